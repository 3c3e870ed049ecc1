// SPDX-License-Identifier: MIT OR Apache-2.0
//! asap-core
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! The stable data model for the ASAP agent-to-agent protocol: the
//! [`Envelope`] wire type, [`Manifest`] self-description, task lifecycle
//! entities, metering types, ULID generation, and JSON-RPC 2.0 framing.
//!
//! If you only take one dependency, take this one.

/// The Envelope wire type and its validation.
pub mod envelope;
/// JSON-RPC 2.0 request/response framing.
pub mod jsonrpc;
/// Manifest self-description and its nested capability types.
pub mod manifest;
/// Usage metering events, query windows, and aggregation.
pub mod metering;
/// Task/Message/Artifact/Part/StateSnapshot/Conversation lifecycle entities.
pub mod task;
/// ULID generation, validation and timestamp extraction.
pub mod ulid;
/// Protocol version parsing and negotiation.
pub mod version;

pub use envelope::{validate_envelope, Envelope};
pub use jsonrpc::{
    EnvelopeParams, JsonRpcError, JsonRpcRequest, JsonRpcResponse, RequestId, INTERNAL_ERROR,
    INVALID_PARAMS, INVALID_REQUEST, PARSE_ERROR,
};
pub use manifest::{validate_manifest, AuthScheme, Capability, Endpoint, Manifest, OAuth2Config, Skill};
pub use metering::{aggregate, AggregateBy, MeteringQuery, UsageAggregate, UsageEvent};
pub use task::{
    Artifact, Conversation, Message, Part, Role, StateSnapshot, Task, TaskStatus, MAX_TASK_DEPTH,
};
pub use version::{is_compatible_version, negotiate_version, parse_version};

/// Current protocol version string embedded in new envelopes.
///
/// # Examples
///
/// ```
/// assert_eq!(asap_core::ASAP_VERSION, "0.1.0");
/// ```
pub const ASAP_VERSION: &str = "0.1.0";

/// Maximum length, in bytes, of an agent URN.
pub const MAX_URN_LEN: usize = 255;

/// Errors that can occur constructing or validating core data-model types.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// A value failed one of this crate's structural invariants.
    #[error("{0}")]
    Validation(asap_error::AsapError),
    /// A ULID string was malformed.
    #[error("invalid ULID: {0}")]
    InvalidUlid(String),
}

impl From<CoreError> for asap_error::AsapError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Validation(e) => e,
            CoreError::InvalidUlid(id) => asap_error::AsapError::new(
                asap_error::ErrorCode::InvalidSchema,
                format!("invalid ULID: {id}"),
            ),
        }
    }
}

/// Validate an agent URN: `urn:asap:agent:[a-z0-9-]+(:[a-z0-9-]+)?`, at
/// most [`MAX_URN_LEN`] bytes.
pub fn is_valid_urn(urn: &str) -> bool {
    if urn.len() > MAX_URN_LEN {
        return false;
    }
    let Some(rest) = urn.strip_prefix("urn:asap:agent:") else {
        return false;
    };
    if rest.is_empty() {
        return false;
    }
    let mut segments = rest.split(':');
    let name_ok = segments
        .next()
        .is_some_and(|name| !name.is_empty() && name.bytes().all(is_urn_segment_byte));
    if !name_ok {
        return false;
    }
    match segments.next() {
        None => segments.next().is_none(),
        Some(sub) => sub.bytes().all(is_urn_segment_byte) && !sub.is_empty() && segments.next().is_none(),
    }
}

fn is_urn_segment_byte(b: u8) -> bool {
    b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-'
}
