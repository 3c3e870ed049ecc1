// SPDX-License-Identifier: MIT OR Apache-2.0
//! Delegation tokens: Ed25519-signed JWTs that let one agent act on
//! another's behalf, plus the storage that tracks issuance and supports
//! cascading revocation.
//!
//! Grounded in the distilled system's `asap.economics.delegation_storage`
//! module: same table shape, same iterative-BFS cascade algorithm.

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// In-memory and SQLite-backed [`DelegationStorage`] implementations.
pub mod storage;
/// JWT issuance and verification.
pub mod token;

pub use storage::{DelegationStorage, InMemoryDelegationStorage, IssuedSummary, SqliteDelegationStorage, TokenDetail};
pub use token::{DelegationClaims, DelegationSigner, DelegationVerifier};

use thiserror::Error;

/// Errors raised issuing or validating a delegation token.
#[derive(Debug, Error)]
pub enum DelegationError {
    /// The JWT failed signature or structural verification.
    #[error("invalid delegation token: {0}")]
    InvalidToken(String),
    /// The token's `exp` claim has passed.
    #[error("delegation token expired")]
    Expired,
    /// The token's `jti` is in the revocation set.
    #[error("delegation token revoked")]
    Revoked,
    /// The requested scope exceeds the token's granted scope.
    #[error("requested scope exceeds granted scope")]
    ScopeDenied,
    /// The underlying storage failed.
    #[error(transparent)]
    Storage(#[from] asap_error::AsapError),
}

impl From<DelegationError> for asap_error::AsapError {
    fn from(err: DelegationError) -> Self {
        use asap_error::{AsapError, ErrorCode};
        match err {
            DelegationError::InvalidToken(msg) => AsapError::new(ErrorCode::InvalidJwt, msg),
            DelegationError::Expired => AsapError::new(ErrorCode::ExpiredToken, "delegation token expired"),
            DelegationError::Revoked => AsapError::new(ErrorCode::RevokedToken, "delegation token revoked"),
            DelegationError::ScopeDenied => {
                AsapError::new(ErrorCode::ScopeDenied, "requested scope exceeds granted scope")
            }
            DelegationError::Storage(e) => e,
        }
    }
}

/// Maximum depth walked by [`DelegationStorage::revoke_cascade`]'s
/// breadth-first traversal before a chain is treated as exhausted.
pub const MAX_CASCADE_DEPTH: u32 = 50;
