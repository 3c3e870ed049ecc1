//! Manifest: a peer's self-description, published at
//! `/.well-known/asap/manifest.json`.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single skill a manifest advertises.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Skill {
    /// Stable skill identifier, referenced by `task.request` payloads.
    pub id: String,
    /// Human-readable description.
    pub description: String,
    /// Opaque JSON Schema for the skill's input. Not validated against the
    /// JSON Schema meta-schema by this crate; left to handlers.
    pub input_schema: Value,
    /// Opaque JSON Schema for the skill's output.
    pub output_schema: Value,
}

/// The set of capabilities a manifest advertises.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Capability {
    /// Highest protocol version this agent supports.
    pub asap_version: String,
    /// Skills this agent exposes.
    pub skills: Vec<Skill>,
    /// Whether the agent persists task state across requests.
    pub state_persistence: bool,
    /// Whether the agent supports streaming responses.
    pub streaming: bool,
    /// Names of MCP tools this agent bridges.
    #[serde(default)]
    pub mcp_tools: Vec<String>,
}

/// Network endpoints a manifest publishes.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Endpoint {
    /// Base URL for the JSON-RPC `/asap` endpoint.
    pub asap: String,
    /// Optional WebSocket/events endpoint URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub events: Option<String>,
}

/// Description of an OAuth2 scheme, sufficient to describe it without
/// performing validation (delegated to an out-of-scope JWKS fetcher).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct OAuth2Config {
    /// Token endpoint URL.
    pub token_url: String,
    /// Scopes this agent recognizes.
    #[serde(default)]
    pub scopes: Vec<String>,
}

/// Authentication schemes a manifest advertises support for.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AuthScheme {
    /// Supported scheme names (e.g. `"bearer"`, `"oauth2"`).
    pub schemes: Vec<String>,
    /// OAuth2 details, present when `"oauth2"` is among `schemes`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth2: Option<OAuth2Config>,
}

/// A peer's self-description.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Manifest {
    /// Agent URN, e.g. `urn:asap:agent:billing`.
    pub urn: String,
    /// Human-readable agent name.
    pub name: String,
    /// Semver `MAJOR.MINOR.PATCH` version of this agent.
    pub version: String,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// Declared capabilities.
    pub capability: Capability,
    /// Declared network endpoints.
    pub endpoint: Endpoint,
    /// Supported auth schemes, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthScheme>,
    /// Optional cryptographic signature over the manifest body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

/// Validate a manifest's URN and semver-shaped version.
pub fn validate_manifest(manifest: &Manifest) -> Result<(), crate::CoreError> {
    if !crate::is_valid_urn(&manifest.urn) {
        return Err(crate::CoreError::Validation(asap_error::AsapError::new(
            asap_error::ErrorCode::InvalidSchema,
            format!("manifest urn '{}' is not a valid agent URN", manifest.urn),
        )));
    }

    if !is_semver_triple(&manifest.version) {
        return Err(crate::CoreError::Validation(asap_error::AsapError::new(
            asap_error::ErrorCode::InvalidSchema,
            format!(
                "manifest version '{}' must be a MAJOR.MINOR.PATCH triple",
                manifest.version
            ),
        )));
    }

    Ok(())
}

fn is_semver_triple(s: &str) -> bool {
    let parts: Vec<&str> = s.split('.').collect();
    parts.len() == 3 && parts.iter().all(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_manifest() -> Manifest {
        Manifest {
            urn: "urn:asap:agent:billing".into(),
            name: "Billing Agent".into(),
            version: "1.2.3".into(),
            description: "handles invoices".into(),
            capability: Capability {
                asap_version: "0.1.0".into(),
                skills: vec![Skill {
                    id: "echo".into(),
                    description: "echoes input".into(),
                    input_schema: json!({}),
                    output_schema: json!({}),
                }],
                state_persistence: true,
                streaming: false,
                mcp_tools: vec![],
            },
            endpoint: Endpoint {
                asap: "https://billing.example/asap".into(),
                events: None,
            },
            auth: None,
            signature: None,
        }
    }

    #[test]
    fn valid_manifest_passes() {
        assert!(validate_manifest(&sample_manifest()).is_ok());
    }

    #[test]
    fn rejects_bad_urn() {
        let mut m = sample_manifest();
        m.urn = "not-a-urn".into();
        assert!(validate_manifest(&m).is_err());
    }

    #[test]
    fn rejects_non_semver_version() {
        let mut m = sample_manifest();
        m.version = "v1".into();
        assert!(validate_manifest(&m).is_err());
    }

    #[test]
    fn round_trip_preserves_skills() {
        let m = sample_manifest();
        let json = serde_json::to_string(&m).unwrap();
        let back: Manifest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.capability.skills.len(), 1);
        assert_eq!(back.capability.skills[0].id, "echo");
    }
}
