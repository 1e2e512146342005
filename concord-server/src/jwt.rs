//! Access / refresh token issuance and validation (HS256).
//!
//! Two issuers share one symmetric secret: short-lived access tokens under
//! `iss = "concord"` and 30-day refresh tokens under `iss =
//! "concord-refresh"`, so a refresh token can never pass an access check.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::error::Error;

pub fn access_token_ttl() -> Duration {
    Duration::minutes(15)
}

pub fn refresh_token_ttl() -> Duration {
    Duration::days(30)
}

const ISSUER: &str = "concord";
const REFRESH_ISSUER: &str = "concord-refresh";
const MIN_SECRET_LEN: usize = 32;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Concord user id.
    pub sub: String,
    /// The OAuth provider's stable id for the user.
    pub external_id: String,
    pub handle: String,
    pub iat: i64,
    pub exp: i64,
    pub iss: String,
}

#[derive(Debug, Clone)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    /// Expiry of the access token.
    pub expires_at: DateTime<Utc>,
}

/// Stateless after construction; safe to share across tasks.
pub struct JwtManager {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl JwtManager {
    /// Fails when the secret is shorter than 32 bytes.
    pub fn new(secret: &str) -> Result<Self, Error> {
        if secret.len() < MIN_SECRET_LEN {
            return Err(Error::InvalidInput(format!(
                "jwt secret must be at least {MIN_SECRET_LEN} bytes"
            )));
        }
        Ok(Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
        })
    }

    /// Mint a fresh access + refresh pair for the user.
    pub fn generate_token_pair(
        &self,
        user_id: &str,
        external_id: &str,
        handle: &str,
    ) -> Result<TokenPair, Error> {
        let now = Utc::now();
        let access_exp = now + access_token_ttl();
        let access = self.sign(Claims {
            sub: user_id.to_string(),
            external_id: external_id.to_string(),
            handle: handle.to_string(),
            iat: now.timestamp(),
            exp: access_exp.timestamp(),
            iss: ISSUER.to_string(),
        })?;
        let refresh = self.sign(Claims {
            sub: user_id.to_string(),
            external_id: external_id.to_string(),
            handle: handle.to_string(),
            iat: now.timestamp(),
            exp: (now + refresh_token_ttl()).timestamp(),
            iss: REFRESH_ISSUER.to_string(),
        })?;
        Ok(TokenPair {
            access_token: access,
            refresh_token: refresh,
            expires_at: access_exp,
        })
    }

    /// Validate an access token: HS256 signature, expiry, and issuer.
    pub fn validate_token(&self, token: &str) -> Result<Claims, Error> {
        self.validate(token, ISSUER)
    }

    /// Validate a refresh token.
    pub fn validate_refresh(&self, token: &str) -> Result<Claims, Error> {
        self.validate(token, REFRESH_ISSUER)
    }

    /// Validate a refresh token and mint a new pair for the same subject.
    /// The old refresh token stays valid until its own expiry; rotation by
    /// digest is the auth store's concern.
    pub fn refresh_access_token(&self, refresh_token: &str) -> Result<TokenPair, Error> {
        let claims = self.validate_refresh(refresh_token)?;
        self.generate_token_pair(&claims.sub, &claims.external_id, &claims.handle)
    }

    fn sign(&self, claims: Claims) -> Result<String, Error> {
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| Error::Internal(format!("token signing failed: {e}")))
    }

    fn validate(&self, token: &str, issuer: &str) -> Result<Claims, Error> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[issuer]);
        validation.set_required_spec_claims(&["exp", "iss"]);
        jsonwebtoken::decode::<Claims>(token, &self.decoding, &validation)
            .map(|data| data.claims)
            .map_err(|e| Error::Unauthenticated(format!("invalid token: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "0123456789abcdef0123456789abcdef";

    fn manager() -> JwtManager {
        JwtManager::new(SECRET).unwrap()
    }

    #[test]
    fn short_secret_rejected() {
        assert!(JwtManager::new("too-short").is_err());
        assert!(JwtManager::new(SECRET).is_ok());
    }

    #[test]
    fn pair_roundtrip() {
        let m = manager();
        let pair = m.generate_token_pair("u1", "ext1", "alice").unwrap();

        let access = m.validate_token(&pair.access_token).unwrap();
        assert_eq!(access.sub, "u1");
        assert_eq!(access.external_id, "ext1");
        assert_eq!(access.handle, "alice");
        assert_eq!(access.iss, "concord");

        let refresh = m.validate_refresh(&pair.refresh_token).unwrap();
        assert_eq!(refresh.iss, "concord-refresh");
    }

    #[test]
    fn access_expiry_is_fifteen_minutes() {
        let m = manager();
        let before = Utc::now();
        let pair = m.generate_token_pair("u1", "e", "h").unwrap();
        let delta = pair.expires_at - before;
        assert!(delta >= Duration::minutes(14) && delta <= Duration::minutes(16));
    }

    #[test]
    fn issuers_do_not_cross_validate() {
        let m = manager();
        let pair = m.generate_token_pair("u1", "e", "h").unwrap();
        assert!(m.validate_token(&pair.refresh_token).is_err());
        assert!(m.validate_refresh(&pair.access_token).is_err());
    }

    #[test]
    fn wrong_secret_rejected() {
        let m = manager();
        let other = JwtManager::new("ffffffffffffffffffffffffffffffff").unwrap();
        let pair = m.generate_token_pair("u1", "e", "h").unwrap();
        assert!(matches!(
            other.validate_token(&pair.access_token),
            Err(Error::Unauthenticated(_))
        ));
    }

    #[test]
    fn wrong_algorithm_rejected() {
        // Same claims, signed HS384 — the validator only accepts HS256.
        let m = manager();
        let claims = Claims {
            sub: "u1".into(),
            external_id: "e".into(),
            handle: "h".into(),
            iat: Utc::now().timestamp(),
            exp: (Utc::now() + Duration::minutes(5)).timestamp(),
            iss: "concord".into(),
        };
        let forged = jsonwebtoken::encode(
            &Header::new(Algorithm::HS384),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap();
        assert!(m.validate_token(&forged).is_err());
    }

    #[test]
    fn refresh_mints_new_pair() {
        let m = manager();
        let pair = m.generate_token_pair("u1", "e", "h").unwrap();
        let next = m.refresh_access_token(&pair.refresh_token).unwrap();
        let claims = m.validate_token(&next.access_token).unwrap();
        assert_eq!(claims.sub, "u1");
        // The old refresh token is still valid until its own expiry.
        assert!(m.validate_refresh(&pair.refresh_token).is_ok());
    }

    #[test]
    fn expired_token_rejected() {
        let m = manager();
        let claims = Claims {
            sub: "u1".into(),
            external_id: "e".into(),
            handle: "h".into(),
            iat: (Utc::now() - Duration::hours(2)).timestamp(),
            exp: (Utc::now() - Duration::hours(1)).timestamp(),
            iss: "concord".into(),
        };
        let stale = jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap();
        assert!(m.validate_token(&stale).is_err());
    }
}
