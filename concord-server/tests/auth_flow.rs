//! Device-flow login, session restore, and logout against a scripted
//! identity provider.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use concord_server::db::Db;
use concord_server::error::Error;
use concord_server::jwt::JwtManager;
use concord_server::oauth::{DeviceAuthorization, DevicePoll, IdentityProvider, ProviderProfile};
use concord_server::services::AuthService;

const JWT_SECRET: &str = "integration-secret-0123456789abcdef";

/// Provider that replays a scripted sequence of poll outcomes.
struct ScriptedProvider {
    polls: Mutex<Vec<DevicePoll>>,
}

impl ScriptedProvider {
    fn new(mut sequence: Vec<DevicePoll>) -> Self {
        sequence.reverse();
        Self {
            polls: Mutex::new(sequence),
        }
    }
}

#[async_trait]
impl IdentityProvider for ScriptedProvider {
    async fn start_device_flow(&self) -> Result<DeviceAuthorization, Error> {
        Ok(DeviceAuthorization {
            device_code: "device-123".into(),
            user_code: "WXYZ-ABCD".into(),
            verification_uri: "https://provider.example/device".into(),
            expires_in: 900,
            interval: 1,
        })
    }

    async fn poll_device_token(&self, _device_code: &str) -> Result<DevicePoll, Error> {
        Ok(self
            .polls
            .lock()
            .pop()
            .unwrap_or(DevicePoll::Expired))
    }
}

fn profile() -> ProviderProfile {
    ProviderProfile {
        external_id: "ext-9001".into(),
        handle: "alice".into(),
        display_name: "Alice".into(),
        avatar_url: Some("https://cdn.example/alice.png".into()),
    }
}

fn service(sequence: Vec<DevicePoll>) -> (AuthService, Arc<Mutex<Db>>, Arc<JwtManager>) {
    let db = Arc::new(Mutex::new(
        Db::open_memory(concord_server::db::session_key_from_secret(JWT_SECRET)).unwrap(),
    ));
    let jwt = Arc::new(JwtManager::new(JWT_SECRET).unwrap());
    let svc = AuthService::new(
        Arc::clone(&db),
        Arc::clone(&jwt),
        Arc::new(ScriptedProvider::new(sequence)),
        false,
    );
    (svc, db, jwt)
}

#[tokio::test]
async fn login_happy_path() {
    let (svc, _db, jwt) = service(vec![
        DevicePoll::Pending,
        DevicePoll::Pending,
        DevicePoll::Authorized(profile()),
    ]);

    let start = svc.start_login().await.unwrap();
    assert!(!start.device_code.is_empty());
    assert!(!start.user_code.is_empty());

    let result = svc.complete_login(&start.device_code, 1).await.unwrap();
    assert!(result.authenticated);
    let user = result.user.expect("user present");
    assert!(!user.id.is_empty());
    assert_eq!(user.handle, "alice");

    // The access token validates under the same secret and expires in
    // roughly fifteen minutes.
    let token = result.access_token.expect("access token present");
    let claims = jwt.validate_token(&token).unwrap();
    assert_eq!(claims.sub, user.id);
    let now = chrono::Utc::now().timestamp();
    assert!((claims.exp - now - 15 * 60).abs() < 30, "exp ≈ now + 15min");
}

#[tokio::test]
async fn login_repeats_use_same_user() {
    let (svc, _db, _jwt) = service(vec![
        DevicePoll::Authorized(profile()),
        DevicePoll::Authorized(profile()),
    ]);
    let first = svc.complete_login("device-123", 1).await.unwrap();
    let second = svc.complete_login("device-123", 1).await.unwrap();
    assert_eq!(
        first.user.unwrap().id,
        second.user.unwrap().id,
        "same external id maps to the same concord user"
    );
}

#[tokio::test]
async fn denied_login_is_unauthenticated() {
    let (svc, _db, _jwt) = service(vec![DevicePoll::Pending, DevicePoll::Denied]);
    match svc.complete_login("device-123", 1).await {
        Err(Error::Unauthenticated(_)) => {}
        other => panic!("expected Unauthenticated, got {other:?}"),
    }
}

#[tokio::test]
async fn session_restore_mints_new_access_without_rotating_refresh() {
    let (svc, db, _jwt) = service(vec![DevicePoll::Authorized(profile())]);
    let login = svc.complete_login("device-123", 1).await.unwrap();
    let user_id = login.user.unwrap().id;
    let original_token = login.access_token.unwrap();

    let stored_before = db.lock().get_active_session(&user_id).unwrap().unwrap();

    let restored = svc.restore_session(&user_id).unwrap();
    assert!(restored.authenticated);
    let new_token = restored.access_token.unwrap();
    assert_ne!(new_token, original_token, "restore mints a fresh token");

    // The persisted session row still holds the original encrypted refresh.
    let stored_after = db.lock().get_active_session(&user_id).unwrap().unwrap();
    assert_eq!(stored_after.id, stored_before.id);
    assert_eq!(
        stored_after.refresh_ciphertext,
        stored_before.refresh_ciphertext
    );
}

#[tokio::test]
async fn restore_without_session_is_unauthenticated_result() {
    let (svc, _db, _jwt) = service(vec![]);
    let restored = svc.restore_session("nonexistent-user").unwrap();
    assert!(!restored.authenticated);
    assert!(restored.access_token.is_none());
}

#[tokio::test]
async fn logout_invalidates_restore() {
    let (svc, _db, _jwt) = service(vec![DevicePoll::Authorized(profile())]);
    let login = svc.complete_login("device-123", 1).await.unwrap();
    let user_id = login.user.unwrap().id;

    svc.logout(&user_id).unwrap();
    let restored = svc.restore_session(&user_id).unwrap();
    assert!(!restored.authenticated);
}

#[tokio::test]
async fn rotation_flag_replaces_session_row() {
    let db = Arc::new(Mutex::new(
        Db::open_memory(concord_server::db::session_key_from_secret(JWT_SECRET)).unwrap(),
    ));
    let jwt = Arc::new(JwtManager::new(JWT_SECRET).unwrap());
    let svc = AuthService::new(
        Arc::clone(&db),
        jwt,
        Arc::new(ScriptedProvider::new(vec![DevicePoll::Authorized(profile())])),
        true,
    );

    let login = svc.complete_login("device-123", 1).await.unwrap();
    let user_id = login.user.unwrap().id;
    let before = db.lock().get_active_session(&user_id).unwrap().unwrap();

    svc.restore_session(&user_id).unwrap();
    let after = db.lock().get_active_session(&user_id).unwrap().unwrap();
    assert_ne!(before.id, after.id, "rotation stores a new session row");
}
