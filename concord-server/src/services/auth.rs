//! Login orchestration: device flow, session restore, logout.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;

use crate::db::{self, Db, UserRow};
use crate::error::{Error, Result};
use crate::ids::new_id;
use crate::jwt::{self, JwtManager};
use crate::oauth::{DeviceAuthorization, DevicePoll, IdentityProvider, ProviderProfile};

/// Hard ceiling on one `complete_login` call, whatever the provider says.
const COMPLETE_LOGIN_DEADLINE: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Serialize)]
pub struct LoginResult {
    pub authenticated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<UserRow>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
}

impl LoginResult {
    fn unauthenticated() -> Self {
        Self {
            authenticated: false,
            user: None,
            access_token: None,
            expires_at: None,
        }
    }
}

pub struct AuthService {
    db: Arc<Mutex<Db>>,
    jwt: Arc<JwtManager>,
    provider: Arc<dyn IdentityProvider>,
    rotate_refresh_on_restore: bool,
}

impl AuthService {
    pub fn new(
        db: Arc<Mutex<Db>>,
        jwt: Arc<JwtManager>,
        provider: Arc<dyn IdentityProvider>,
        rotate_refresh_on_restore: bool,
    ) -> Self {
        Self {
            db,
            jwt,
            provider,
            rotate_refresh_on_restore,
        }
    }

    /// Begin the device flow; the response is the provider's, verbatim.
    pub async fn start_login(&self) -> Result<DeviceAuthorization> {
        self.provider.start_device_flow().await
    }

    /// Poll the provider until the user approves or a terminal error lands.
    /// Backoff starts at one second and doubles, bounded by `interval`.
    pub async fn complete_login(&self, device_code: &str, interval: u64) -> Result<LoginResult> {
        let cap = Duration::from_secs(interval.max(1));
        let mut delay = Duration::from_secs(1).min(cap);
        let deadline = tokio::time::Instant::now() + COMPLETE_LOGIN_DEADLINE;

        loop {
            match self.provider.poll_device_token(device_code).await? {
                DevicePoll::Authorized(profile) => return self.finish_login(profile),
                DevicePoll::Pending => {}
                DevicePoll::SlowDown => delay = cap,
                DevicePoll::Denied => {
                    return Err(Error::Unauthenticated("access denied".into()))
                }
                DevicePoll::Expired => {
                    return Err(Error::Unauthenticated("device code expired".into()))
                }
            }
            if tokio::time::Instant::now() + delay > deadline {
                return Err(Error::Unauthenticated("device code expired".into()));
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(cap);
        }
    }

    fn finish_login(&self, profile: ProviderProfile) -> Result<LoginResult> {
        let db = self.db.lock();
        let now = chrono::Utc::now().timestamp_millis();

        let user = match db.get_user_by_external_id(&profile.external_id)? {
            Some(existing) => {
                let updated = UserRow {
                    handle: profile.handle,
                    display_name: profile.display_name,
                    avatar_url: profile.avatar_url,
                    updated_at: now,
                    ..existing
                };
                db.upsert_user(&updated)?;
                updated
            }
            None => {
                let user = UserRow {
                    id: new_id(),
                    external_id: profile.external_id,
                    handle: profile.handle,
                    display_name: profile.display_name,
                    avatar_url: profile.avatar_url,
                    created_at: now,
                    updated_at: now,
                };
                db.upsert_user(&user)?;
                user
            }
        };

        let pair = self
            .jwt
            .generate_token_pair(&user.id, &user.external_id, &user.handle)?;
        let refresh_expires =
            (chrono::Utc::now() + jwt::refresh_token_ttl()).timestamp_millis();
        db.save_session(&new_id(), &user.id, &pair.refresh_token, refresh_expires)?;

        Ok(LoginResult {
            authenticated: true,
            expires_at: Some(pair.expires_at.timestamp_millis()),
            access_token: Some(pair.access_token),
            user: Some(user),
        })
    }

    /// Re-mint an access token from the stored refresh session. The stored
    /// refresh token is left untouched unless rotation is configured.
    pub fn restore_session(&self, user_id: &str) -> Result<LoginResult> {
        let db = self.db.lock();
        let Some(session) = db.get_active_session(user_id)? else {
            return Ok(LoginResult::unauthenticated());
        };
        let Some(refresh_token) = db.open_session_refresh(&session) else {
            // Ciphertext or digest doesn't check out — never hand back a
            // token from a row we can't verify.
            return Err(Error::Integrity);
        };
        let Ok(claims) = self.jwt.validate_refresh(&refresh_token) else {
            // Stored token outlived its own validity; treat as logged out.
            return Ok(LoginResult::unauthenticated());
        };

        let user = db
            .get_user(user_id)?
            .ok_or_else(|| Error::not_found("user not found"))?;
        let pair = self
            .jwt
            .generate_token_pair(&claims.sub, &claims.external_id, &claims.handle)?;

        if self.rotate_refresh_on_restore {
            db.delete_user_sessions(user_id)?;
            let refresh_expires =
                (chrono::Utc::now() + jwt::refresh_token_ttl()).timestamp_millis();
            db.save_session(&new_id(), user_id, &pair.refresh_token, refresh_expires)?;
        }

        Ok(LoginResult {
            authenticated: true,
            expires_at: Some(pair.expires_at.timestamp_millis()),
            access_token: Some(pair.access_token),
            user: Some(user),
        })
    }

    /// Remove every session the user holds.
    pub fn logout(&self, user_id: &str) -> Result<()> {
        self.db.lock().delete_user_sessions(user_id)?;
        Ok(())
    }

    /// TTL sweep for expired sessions; returns rows removed.
    pub fn clean_expired_sessions(&self) -> Result<usize> {
        Ok(self.db.lock().clean_expired_sessions()?)
    }

    /// Validate a bearer token into claims.
    pub fn authenticate(&self, token: &str) -> Result<jwt::Claims> {
        self.jwt.validate_token(token)
    }

    pub fn get_user(&self, user_id: &str) -> Result<Option<UserRow>> {
        Ok(self.db.lock().get_user(user_id)?)
    }
}

// Re-exported for integration tests that need a database handle shape.
pub type SharedDb = Arc<Mutex<db::Db>>;
