// SPDX-License-Identifier: MIT OR Apache-2.0
//! Ed25519-signed delegation JWTs: issuance and verification.
//!
//! Header is always `{"alg":"EdDSA","typ":"JWT"}`; Ed25519 is the only
//! supported signing algorithm.

use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use ring::rand::SystemRandom;
use ring::signature::{Ed25519KeyPair, KeyPair};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::DelegationError;

/// Claims carried by a delegation JWT.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegationClaims {
    /// Token id; also the revocation-set key.
    pub jti: String,
    /// URN of the agent granting the delegation.
    pub iss: String,
    /// URN of the agent receiving the delegation.
    pub sub: String,
    /// Granted scopes.
    pub scope: Vec<String>,
    /// Issued-at, Unix seconds.
    pub iat: i64,
    /// Expiry, Unix seconds.
    pub exp: i64,
}

impl DelegationClaims {
    /// `true` if `requested` is a subset of this token's granted scope.
    pub fn grants(&self, requested: &[String]) -> bool {
        requested.iter().all(|r| self.scope.iter().any(|s| s == r))
    }
}

/// An Ed25519 keypair usable both for signing (as a [`DelegationSigner`])
/// and, via [`Ed25519Keys::public_key_der`], for verification.
pub struct Ed25519Keys {
    pkcs8: Vec<u8>,
    public_key: Vec<u8>,
}

impl Ed25519Keys {
    /// Generate a fresh Ed25519 keypair.
    pub fn generate() -> Result<Self, DelegationError> {
        let rng = SystemRandom::new();
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng)
            .map_err(|e| DelegationError::InvalidToken(format!("keygen failed: {e}")))?;
        let pair = Ed25519KeyPair::from_pkcs8(pkcs8.as_ref())
            .map_err(|e| DelegationError::InvalidToken(format!("keygen failed: {e}")))?;
        let public_key = pair.public_key().as_ref().to_vec();
        Ok(Self {
            pkcs8: pkcs8.as_ref().to_vec(),
            public_key,
        })
    }

    /// The raw 32-byte Ed25519 public key, as consumed by
    /// [`DecodingKey::from_ed_der`].
    pub fn public_key_der(&self) -> &[u8] {
        &self.public_key
    }
}

/// Mints delegation JWTs on behalf of a single delegator identity.
pub struct DelegationSigner {
    delegator_urn: String,
    encoding_key: EncodingKey,
}

impl DelegationSigner {
    /// Build a signer for `delegator_urn` from a PKCS8-encoded Ed25519
    /// private key (as produced by [`Ed25519Keys::generate`]).
    pub fn new(delegator_urn: impl Into<String>, keys: &Ed25519Keys) -> Self {
        Self {
            delegator_urn: delegator_urn.into(),
            encoding_key: EncodingKey::from_ed_der(&keys.pkcs8),
        }
    }

    /// Mint a JWT delegating `scope` to `delegate_urn` for `ttl`. Returns
    /// the fresh `jti` and the compact-serialized token.
    pub fn issue(
        &self,
        delegate_urn: &str,
        scope: Vec<String>,
        ttl: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<(String, String), DelegationError> {
        let jti = Uuid::new_v4().to_string();
        let claims = DelegationClaims {
            jti: jti.clone(),
            iss: self.delegator_urn.clone(),
            sub: delegate_urn.to_string(),
            scope,
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
        };
        let header = Header::new(Algorithm::EdDSA);
        let token = encode(&header, &claims, &self.encoding_key)
            .map_err(|e| DelegationError::InvalidToken(e.to_string()))?;
        Ok((jti, token))
    }
}

/// Resolves a delegator's current Ed25519 public key for verification.
pub trait PublicKeyResolver: Send + Sync {
    /// Return the raw public key bytes for `delegator_urn`, if known.
    fn public_key_for(&self, delegator_urn: &str) -> Option<Vec<u8>>;
}

/// Verifies delegation JWTs against a [`PublicKeyResolver`].
///
/// Checks signature, `exp`/`iat`, and (via the caller's storage lookup)
/// revocation; scope-subset checking is left to
/// [`DelegationClaims::grants`] since it depends on the request being
/// authorized.
pub struct DelegationVerifier<'a> {
    resolver: &'a dyn PublicKeyResolver,
}

impl<'a> DelegationVerifier<'a> {
    /// Build a verifier backed by `resolver`.
    pub fn new(resolver: &'a dyn PublicKeyResolver) -> Self {
        Self { resolver }
    }

    /// Verify `token`'s signature and structural claims (but not
    /// revocation — call the storage's `is_revoked`/`are_revoked`
    /// separately).
    pub fn verify(&self, token: &str, now: DateTime<Utc>) -> Result<DelegationClaims, DelegationError> {
        let header = jsonwebtoken::decode_header(token).map_err(|e| DelegationError::InvalidToken(e.to_string()))?;
        if header.alg != Algorithm::EdDSA {
            return Err(DelegationError::InvalidToken(format!("unsupported algorithm: {:?}", header.alg)));
        }

        let issuer = peek_issuer(token)?;
        let public_key = self
            .resolver
            .public_key_for(&issuer)
            .ok_or_else(|| DelegationError::InvalidToken(format!("unknown delegator: {issuer}")))?;

        let decoding_key = DecodingKey::from_ed_der(&public_key);
        let mut validation = Validation::new(Algorithm::EdDSA);
        validation.validate_exp = true;
        validation.set_required_spec_claims(&["exp", "iat", "iss", "sub", "jti"]);

        let data = decode::<DelegationClaims>(token, &decoding_key, &validation)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => DelegationError::Expired,
                _ => DelegationError::InvalidToken(e.to_string()),
            })?;

        if data.claims.iat > now.timestamp() {
            return Err(DelegationError::InvalidToken("iat is in the future".into()));
        }
        Ok(data.claims)
    }
}

/// Decode the `iss` claim without verifying the signature, so the
/// verifier knows which delegator's public key to fetch.
fn peek_issuer(token: &str) -> Result<String, DelegationError> {
    #[derive(Deserialize)]
    struct IssOnly {
        iss: String,
    }
    let mut validation = Validation::new(Algorithm::EdDSA);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.required_spec_claims.clear();
    let dummy_key = DecodingKey::from_secret(&[]);
    let data = decode::<IssOnly>(token, &dummy_key, &validation)
        .map_err(|e| DelegationError::InvalidToken(e.to_string()))?;
    Ok(data.claims.iss)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SingleKeyResolver {
        urn: String,
        key: Vec<u8>,
    }

    impl PublicKeyResolver for SingleKeyResolver {
        fn public_key_for(&self, delegator_urn: &str) -> Option<Vec<u8>> {
            (delegator_urn == self.urn).then(|| self.key.clone())
        }
    }

    #[test]
    fn issues_and_verifies_round_trip() {
        let keys = Ed25519Keys::generate().unwrap();
        let signer = DelegationSigner::new("urn:asap:agent:billing", &keys);
        let now = Utc::now();
        let (jti, token) = signer
            .issue("urn:asap:agent:reporting", vec!["read".into()], chrono::Duration::hours(1), now)
            .unwrap();

        let resolver = SingleKeyResolver {
            urn: "urn:asap:agent:billing".into(),
            key: keys.public_key_der().to_vec(),
        };
        let verifier = DelegationVerifier::new(&resolver);
        let claims = verifier.verify(&token, now).unwrap();
        assert_eq!(claims.jti, jti);
        assert_eq!(claims.sub, "urn:asap:agent:reporting");
        assert!(claims.grants(&["read".to_string()]));
        assert!(!claims.grants(&["write".to_string()]));
    }

    #[test]
    fn rejects_expired_token() {
        let keys = Ed25519Keys::generate().unwrap();
        let signer = DelegationSigner::new("urn:asap:agent:billing", &keys);
        let past = Utc::now() - chrono::Duration::hours(2);
        let (_, token) = signer
            .issue("urn:asap:agent:reporting", vec!["read".into()], chrono::Duration::hours(1), past)
            .unwrap();

        let resolver = SingleKeyResolver {
            urn: "urn:asap:agent:billing".into(),
            key: keys.public_key_der().to_vec(),
        };
        let verifier = DelegationVerifier::new(&resolver);
        assert!(matches!(
            verifier.verify(&token, Utc::now()),
            Err(DelegationError::Expired)
        ));
    }

    #[test]
    fn rejects_unknown_issuer() {
        let keys = Ed25519Keys::generate().unwrap();
        let signer = DelegationSigner::new("urn:asap:agent:billing", &keys);
        let now = Utc::now();
        let (_, token) = signer
            .issue("urn:asap:agent:reporting", vec!["read".into()], chrono::Duration::hours(1), now)
            .unwrap();

        let resolver = SingleKeyResolver {
            urn: "urn:asap:agent:someone-else".into(),
            key: keys.public_key_der().to_vec(),
        };
        let verifier = DelegationVerifier::new(&resolver);
        assert!(verifier.verify(&token, now).is_err());
    }

    #[test]
    fn rejects_wrong_signing_key() {
        let keys = Ed25519Keys::generate().unwrap();
        let other_keys = Ed25519Keys::generate().unwrap();
        let signer = DelegationSigner::new("urn:asap:agent:billing", &keys);
        let now = Utc::now();
        let (_, token) = signer
            .issue("urn:asap:agent:reporting", vec!["read".into()], chrono::Duration::hours(1), now)
            .unwrap();

        let resolver = SingleKeyResolver {
            urn: "urn:asap:agent:billing".into(),
            key: other_keys.public_key_der().to_vec(),
        };
        let verifier = DelegationVerifier::new(&resolver);
        assert!(verifier.verify(&token, now).is_err());
    }
}
