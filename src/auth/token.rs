//! Stateless bearer tokens.
//!
//! Tokens are compact HS256 JWTs carrying `sub`, `iat` and `exp`. Nothing is
//! recorded server-side: a token stays valid until `exp` passes or the
//! signing secret changes.

use chrono::Utc;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

/// Token lifetime: 24 hours.
pub const DEFAULT_TOKEN_TTL_SECS: u64 = 24 * 60 * 60;

const ALGORITHM: Algorithm = Algorithm::HS256;

/// Claims embedded in every token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Username the token was issued for.
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
}

/// Why a token was rejected. Callers outside this crate only ever see a
/// single "unauthorized" outcome; the distinction is kept for logs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    #[error("token is malformed")]
    Malformed,
    #[error("token signature does not verify")]
    BadSignature,
    #[error("token has expired")]
    Expired,
    /// Tokens are never issued for an empty username.
    #[error("token subject must not be empty")]
    EmptySubject,
    #[error("token signing failed: {0}")]
    Signing(String),
}

/// Issues and validates tokens under one process-wide secret.
pub struct TokenService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    ttl_secs: u64,
}

impl TokenService {
    pub fn new(secret: &[u8], ttl_secs: u64) -> Self {
        let mut validation = Validation::new(ALGORITHM);
        // Expiry is checked against an explicit clock in `validate_at`.
        validation.validate_exp = false;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation,
            ttl_secs,
        }
    }

    /// Build from config. A missing secret is a startup error.
    pub fn from_config(config: &crate::config::AuthConfig) -> anyhow::Result<Self> {
        let secret = config.signing_secret()?;
        Ok(Self::new(secret.as_bytes(), config.token_ttl_secs))
    }

    pub fn ttl_secs(&self) -> u64 {
        self.ttl_secs
    }

    pub fn issue(&self, subject: &str) -> Result<String, TokenError> {
        self.issue_at(subject, Utc::now().timestamp())
    }

    /// Issue a token as if the current time were `now` (Unix seconds).
    pub fn issue_at(&self, subject: &str, now: i64) -> Result<String, TokenError> {
        if subject.is_empty() {
            return Err(TokenError::EmptySubject);
        }
        let claims = Claims {
            sub: subject.to_owned(),
            iat: now,
            exp: now.saturating_add(i64::try_from(self.ttl_secs).unwrap_or(i64::MAX)),
        };
        encode(&Header::new(ALGORITHM), &claims, &self.encoding)
            .map_err(|e| TokenError::Signing(e.to_string()))
    }

    pub fn validate(&self, token: &str) -> Result<Claims, TokenError> {
        self.validate_at(token, Utc::now().timestamp())
    }

    /// Validate as of `now` (Unix seconds). Signature is checked before
    /// expiry, so a forged token never reports `Expired`.
    pub fn validate_at(&self, token: &str, now: i64) -> Result<Claims, TokenError> {
        let data = decode::<Claims>(token, &self.decoding, &self.validation).map_err(classify)?;
        let claims = data.claims;
        if claims.sub.is_empty() {
            return Err(TokenError::Malformed);
        }
        if claims.exp <= now {
            return Err(TokenError::Expired);
        }
        Ok(claims)
    }
}

fn classify(err: jsonwebtoken::errors::Error) -> TokenError {
    match err.kind() {
        ErrorKind::InvalidSignature | ErrorKind::InvalidAlgorithm => TokenError::BadSignature,
        ErrorKind::ExpiredSignature => TokenError::Expired,
        _ => TokenError::Malformed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;

    const SECRET: &[u8] = b"test-secret-test-secret-test-secret";
    const NOW: i64 = 1_700_000_000;

    fn service() -> TokenService {
        TokenService::new(SECRET, DEFAULT_TOKEN_TTL_SECS)
    }

    #[test]
    fn issued_token_validates_to_subject() {
        let tokens = service();
        let token = tokens.issue("alice").unwrap();
        let claims = tokens.validate(&token).unwrap();
        assert_eq!(claims.sub, "alice");
        assert_eq!(claims.exp - claims.iat, 86_400);
    }

    #[test]
    fn token_is_valid_for_the_whole_window() {
        let tokens = service();
        let token = tokens.issue_at("alice", NOW).unwrap();
        assert_eq!(tokens.validate_at(&token, NOW).unwrap().sub, "alice");
        assert_eq!(
            tokens.validate_at(&token, NOW + 86_399).unwrap().sub,
            "alice"
        );
        assert_eq!(
            tokens.validate_at(&token, NOW + 86_400),
            Err(TokenError::Expired)
        );
    }

    #[test]
    fn token_issued_in_the_past_is_expired() {
        let tokens = service();
        let token = tokens.issue_at("alice", NOW - 2 * 86_400).unwrap();
        assert_eq!(tokens.validate_at(&token, NOW), Err(TokenError::Expired));
    }

    #[test]
    fn different_secret_is_a_signature_error() {
        let other = TokenService::new(b"another-secret-another-secret-xx", DEFAULT_TOKEN_TTL_SECS);
        let token = other.issue("alice").unwrap();
        assert_eq!(service().validate(&token), Err(TokenError::BadSignature));
    }

    #[test]
    fn expired_token_with_foreign_signature_reports_signature() {
        let other = TokenService::new(b"another-secret-another-secret-xx", DEFAULT_TOKEN_TTL_SECS);
        let token = other.issue_at("alice", NOW - 10 * 86_400).unwrap();
        assert_eq!(
            service().validate_at(&token, NOW),
            Err(TokenError::BadSignature)
        );
    }

    #[test]
    fn other_hmac_algorithm_is_rejected() {
        let claims = Claims {
            sub: "alice".into(),
            iat: NOW,
            exp: NOW + 3600,
        };
        let token = encode(
            &Header::new(Algorithm::HS512),
            &claims,
            &EncodingKey::from_secret(SECRET),
        )
        .unwrap();
        assert_eq!(
            service().validate_at(&token, NOW),
            Err(TokenError::BadSignature)
        );
    }

    #[test]
    fn unsigned_token_is_rejected() {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(br#"{"sub":"alice","iat":1,"exp":9999999999}"#);
        let token = format!("{header}.{payload}.");
        assert!(service().validate(&token).is_err());
    }

    #[test]
    fn tampered_payload_is_a_signature_error() {
        let tokens = service();
        let token = tokens.issue("alice").unwrap();
        let mut parts: Vec<&str> = token.split('.').collect();
        let forged = URL_SAFE_NO_PAD.encode(br#"{"sub":"mallory","iat":1,"exp":9999999999}"#);
        parts[1] = &forged;
        let tampered = parts.join(".");
        assert_eq!(tokens.validate(&tampered), Err(TokenError::BadSignature));
    }

    #[test]
    fn garbage_is_malformed() {
        let tokens = service();
        for bad in ["", "not-a-token", "a.b", "a.b.c", "Bearer "] {
            assert_eq!(tokens.validate(bad), Err(TokenError::Malformed), "{bad:?}");
        }
    }

    #[test]
    fn missing_expiry_is_malformed() {
        #[derive(Serialize)]
        struct NoExp<'a> {
            sub: &'a str,
        }
        let token = encode(
            &Header::new(ALGORITHM),
            &NoExp { sub: "alice" },
            &EncodingKey::from_secret(SECRET),
        )
        .unwrap();
        assert_eq!(service().validate(&token), Err(TokenError::Malformed));
    }

    #[test]
    fn empty_subject_cannot_be_issued() {
        assert_eq!(service().issue(""), Err(TokenError::EmptySubject));
        assert_eq!(service().issue_at("", NOW), Err(TokenError::EmptySubject));
    }
}
