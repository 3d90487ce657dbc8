//! Capability tokens gating room entry.
//!
//! A token is a three-part dot-separated ASCII string
//! `header.payload.signature`, each part base64url without padding. The
//! signature is HMAC-SHA256 over `header.payload` with the deployment
//! secret. Entry-time verification is the only mandatory gate; once a
//! participant is admitted, per-action checks read its grants directly.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;

use crate::error::CoreError;
use crate::participant::Grants;

type HmacSha256 = Hmac<Sha256>;

/// Fixed JOSE-style header; the core only ever issues or accepts this one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenHeader {
    pub alg: String,
    pub typ: String,
}

impl Default for TokenHeader {
    fn default() -> Self {
        TokenHeader {
            alg: "HS256".to_string(),
            typ: "JWT".to_string(),
        }
    }
}

/// The `video` grant object inside the token payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct VideoGrant {
    /// Room the token is bound to. Must equal the room being joined.
    pub room: String,
    pub room_join: bool,
    pub room_admin: bool,
    pub room_create: bool,
    pub can_publish: bool,
    pub can_subscribe: bool,
    pub can_publish_data: bool,
    pub hidden: bool,
    pub recorder: bool,
}

/// Decoded token payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TokenClaims {
    /// Stable identity; becomes the participant id on join.
    pub identity: String,
    /// Display name.
    pub name: String,
    /// Issued-at, unix seconds.
    pub iat: i64,
    /// Expires-at, unix seconds.
    pub exp: i64,
    pub video: VideoGrant,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl TokenClaims {
    /// Converts the token's grant object into the participant grant set.
    pub fn grants(&self) -> Grants {
        Grants {
            can_publish: self.video.can_publish,
            can_subscribe: self.video.can_subscribe,
            can_publish_data: self.video.can_publish_data,
            admin: self.video.room_admin,
            hidden: self.video.hidden,
            recorder: self.video.recorder,
        }
    }
}

/// Builder for issuing signed tokens. Hosting services use this to mint
/// entry credentials; tests use it to exercise the verifier.
#[derive(Debug, Clone)]
pub struct AccessToken {
    identity: String,
    name: String,
    ttl_secs: i64,
    grant: VideoGrant,
    metadata: HashMap<String, serde_json::Value>,
}

impl AccessToken {
    pub fn new(identity: impl Into<String>) -> Self {
        let identity = identity.into();
        AccessToken {
            name: identity.clone(),
            identity,
            ttl_secs: 3600,
            grant: VideoGrant {
                room_join: true,
                can_subscribe: true,
                ..VideoGrant::default()
            },
            metadata: HashMap::new(),
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn ttl_secs(mut self, ttl: i64) -> Self {
        self.ttl_secs = ttl;
        self
    }

    pub fn grant(mut self, grant: VideoGrant) -> Self {
        self.grant = grant;
        self
    }

    pub fn room(mut self, room: impl Into<String>) -> Self {
        self.grant.room = room.into();
        self
    }

    pub fn metadata(mut self, metadata: HashMap<String, serde_json::Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Signs the token with the deployment secret.
    pub fn sign(self, secret: &str) -> Result<String, CoreError> {
        let now = chrono::Utc::now().timestamp();
        let claims = TokenClaims {
            identity: self.identity,
            name: self.name,
            iat: now,
            exp: now + self.ttl_secs,
            video: self.grant,
            metadata: self.metadata,
        };
        sign_claims(&claims, secret)
    }
}

/// Signs an explicit claim set. Exposed so callers can control `iat`/`exp`
/// directly (expiry tests, clock-skew tooling).
pub fn sign_claims(claims: &TokenClaims, secret: &str) -> Result<String, CoreError> {
    let header = serde_json::to_vec(&TokenHeader::default())
        .map_err(|e| CoreError::InvalidToken(e.to_string()))?;
    let payload =
        serde_json::to_vec(claims).map_err(|e| CoreError::InvalidToken(e.to_string()))?;

    let signing_input = format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(header),
        URL_SAFE_NO_PAD.encode(payload)
    );

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| CoreError::InvalidToken(e.to_string()))?;
    mac.update(signing_input.as_bytes());
    let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

    Ok(format!("{}.{}", signing_input, signature))
}

/// Verifies tokens against the deployment secret and a target room.
#[derive(Clone)]
pub struct TokenVerifier {
    secret: String,
}

impl TokenVerifier {
    pub fn new(secret: impl Into<String>) -> Self {
        TokenVerifier {
            secret: secret.into(),
        }
    }

    /// Decodes and checks signature, expiry and room binding.
    ///
    /// Returns the claims on success so the caller can build the
    /// participant template from them.
    pub fn verify(&self, token: &str, target_room: &str) -> Result<TokenClaims, CoreError> {
        let claims = self.decode(token)?;

        if chrono::Utc::now().timestamp() >= claims.exp {
            return Err(CoreError::TokenExpired);
        }
        if !claims.video.room_join {
            return Err(CoreError::Unauthorized(
                "token does not grant room join".to_string(),
            ));
        }
        if claims.video.room != target_room {
            return Err(CoreError::Unauthorized(format!(
                "token is bound to room '{}', not '{}'",
                claims.video.room, target_room
            )));
        }
        Ok(claims)
    }

    /// Signature and structure checks only; expiry and room binding are the
    /// caller's concern. Useful for introspection tooling.
    pub fn decode(&self, token: &str) -> Result<TokenClaims, CoreError> {
        let mut parts = token.split('.');
        let (header_b64, payload_b64, sig_b64) = match (
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
        ) {
            (Some(h), Some(p), Some(s), None) => (h, p, s),
            _ => {
                return Err(CoreError::InvalidToken(
                    "expected three dot-separated parts".to_string(),
                ))
            }
        };

        let signing_input = format!("{}.{}", header_b64, payload_b64);
        let signature = URL_SAFE_NO_PAD
            .decode(sig_b64)
            .map_err(|_| CoreError::InvalidToken("signature is not base64url".to_string()))?;

        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|e| CoreError::InvalidToken(e.to_string()))?;
        mac.update(signing_input.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| CoreError::InvalidToken("signature mismatch".to_string()))?;

        let header_bytes = URL_SAFE_NO_PAD
            .decode(header_b64)
            .map_err(|_| CoreError::InvalidToken("header is not base64url".to_string()))?;
        let header: TokenHeader = serde_json::from_slice(&header_bytes)
            .map_err(|_| CoreError::InvalidToken("header is not valid JSON".to_string()))?;
        if header.alg != "HS256" {
            return Err(CoreError::InvalidToken(format!(
                "unsupported algorithm '{}'",
                header.alg
            )));
        }

        let payload_bytes = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|_| CoreError::InvalidToken("payload is not base64url".to_string()))?;
        serde_json::from_slice(&payload_bytes)
            .map_err(|_| CoreError::InvalidToken("payload is missing required claims".to_string()))
    }
}
