//! HTTP/JSON surface under `/api/v1`.
//!
//! Handlers are thin: authenticate, parse, call the service, serialise the
//! row. Errors render as `{error:{message}}` with the taxonomy's status
//! code; empty successes are 204.

use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::request::Parts;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;

use crate::error::Error;
use crate::jwt::Claims;
use crate::server::AppState;
use crate::ws;

const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Build the `/api/v1` router.
pub fn router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/health", get(health))
        .route("/auth/device-code", post(auth_device_code))
        .route("/auth/token", post(auth_token))
        .route("/auth/refresh", post(auth_refresh))
        .route("/auth/logout", post(auth_logout))
        .route("/servers", get(list_servers).post(create_server))
        .route("/servers/{id}", put(update_server).delete(delete_server))
        .route(
            "/servers/{id}/channels",
            get(list_channels).post(create_channel),
        )
        .route("/servers/{id}/members", get(list_members))
        .route("/servers/{id}/members/{uid}", delete(remove_member))
        .route("/servers/{id}/members/{uid}/role", put(update_member_role))
        .route("/servers/{id}/invite", post(create_invite))
        .route("/invite/{code}/redeem", post(redeem_invite))
        .route(
            "/channels/{id}/messages",
            get(get_messages).post(send_message),
        )
        .route("/channels/{id}/messages/search", get(search_messages))
        .route("/messages/{id}", put(edit_message).delete(delete_message))
        .route("/friends", get(list_friends))
        .route("/friends/request", post(send_friend_request))
        .route("/friends/requests", get(list_friend_requests))
        .route("/friends/requests/{id}/accept", put(accept_friend_request))
        .route("/friends/requests/{id}", delete(decline_friend_request))
        .route("/friends/{id}", delete(remove_friend))
        .route("/friends/{id}/block", post(block_friend).delete(unblock_friend))
        .route(
            "/friends/{id}/messages",
            get(list_friend_messages).post(send_friend_message),
        )
        .route("/translate", post(translate))
        .route("/ws", get(ws_upgrade));

    Router::new()
        .nest("/api/v1", api)
        .layer(axum::extract::DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ── Authentication extractor ───────────────────────────────────────────

/// Extracts and validates the bearer token; handlers receive the claims.
pub struct AuthUser(pub Claims);

impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = Error;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| Error::Unauthenticated("missing authorization header".into()))?;
        let token = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| Error::Unauthenticated("expected a bearer token".into()))?;
        Ok(AuthUser(state.auth.authenticate(token)?))
    }
}

// ── Health ─────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    connections: usize,
    online: usize,
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        connections: state.hub.connected_count(),
        online: state.presence.online_users().len(),
    })
}

// ── Auth ───────────────────────────────────────────────────────────────

async fn auth_device_code(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, Error> {
    Ok(Json(state.auth.start_login().await?))
}

#[derive(Deserialize)]
struct TokenRequest {
    device_code: String,
    #[serde(default)]
    interval: u64,
}

async fn auth_token(
    State(state): State<Arc<AppState>>,
    Json(body): Json<TokenRequest>,
) -> Result<impl IntoResponse, Error> {
    let result = state
        .auth
        .complete_login(&body.device_code, body.interval.max(1))
        .await?;
    Ok(Json(result))
}

#[derive(Deserialize)]
struct RefreshRequest {
    user_id: String,
}

async fn auth_refresh(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RefreshRequest>,
) -> Result<impl IntoResponse, Error> {
    Ok(Json(state.auth.restore_session(&body.user_id)?))
}

async fn auth_logout(
    State(state): State<Arc<AppState>>,
    AuthUser(claims): AuthUser,
) -> Result<impl IntoResponse, Error> {
    state.auth.logout(&claims.sub)?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Servers ────────────────────────────────────────────────────────────

async fn list_servers(
    State(state): State<Arc<AppState>>,
    AuthUser(claims): AuthUser,
) -> Result<impl IntoResponse, Error> {
    Ok(Json(state.guilds.list_servers(&claims.sub)?))
}

#[derive(Deserialize)]
struct ServerRequest {
    name: String,
    #[serde(default)]
    icon_url: Option<String>,
}

async fn create_server(
    State(state): State<Arc<AppState>>,
    AuthUser(claims): AuthUser,
    Json(body): Json<ServerRequest>,
) -> Result<impl IntoResponse, Error> {
    let server = state
        .guilds
        .create_server(&claims.sub, &body.name, body.icon_url)?;
    Ok((StatusCode::CREATED, Json(server)))
}

async fn update_server(
    State(state): State<Arc<AppState>>,
    AuthUser(claims): AuthUser,
    Path(id): Path<String>,
    Json(body): Json<ServerRequest>,
) -> Result<impl IntoResponse, Error> {
    Ok(Json(state.guilds.update_server(
        &claims.sub,
        &id,
        &body.name,
        body.icon_url,
    )?))
}

async fn delete_server(
    State(state): State<Arc<AppState>>,
    AuthUser(claims): AuthUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, Error> {
    state.guilds.delete_server(&claims.sub, &id)?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Channels ───────────────────────────────────────────────────────────

async fn list_channels(
    State(state): State<Arc<AppState>>,
    AuthUser(claims): AuthUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, Error> {
    Ok(Json(state.guilds.list_channels(&claims.sub, &id)?))
}

#[derive(Deserialize)]
struct ChannelRequest {
    name: String,
    #[serde(rename = "type", default = "default_channel_kind")]
    kind: String,
}

fn default_channel_kind() -> String {
    "text".into()
}

async fn create_channel(
    State(state): State<Arc<AppState>>,
    AuthUser(claims): AuthUser,
    Path(id): Path<String>,
    Json(body): Json<ChannelRequest>,
) -> Result<impl IntoResponse, Error> {
    let channel = state
        .guilds
        .create_channel(&claims.sub, &id, &body.name, &body.kind)?;
    Ok((StatusCode::CREATED, Json(channel)))
}

// ── Members ────────────────────────────────────────────────────────────

async fn list_members(
    State(state): State<Arc<AppState>>,
    AuthUser(claims): AuthUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, Error> {
    Ok(Json(state.guilds.list_members(&claims.sub, &id)?))
}

async fn remove_member(
    State(state): State<Arc<AppState>>,
    AuthUser(claims): AuthUser,
    Path((id, uid)): Path<(String, String)>,
) -> Result<impl IntoResponse, Error> {
    state.guilds.remove_member(&claims.sub, &id, &uid)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct RoleRequest {
    role: String,
}

async fn update_member_role(
    State(state): State<Arc<AppState>>,
    AuthUser(claims): AuthUser,
    Path((id, uid)): Path<(String, String)>,
    Json(body): Json<RoleRequest>,
) -> Result<impl IntoResponse, Error> {
    state
        .guilds
        .update_member_role(&claims.sub, &id, &uid, &body.role)?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Invites ────────────────────────────────────────────────────────────

#[derive(Deserialize, Default)]
struct InviteRequest {
    #[serde(default)]
    max_uses: i64,
    #[serde(default)]
    expires_at: Option<i64>,
}

async fn create_invite(
    State(state): State<Arc<AppState>>,
    AuthUser(claims): AuthUser,
    Path(id): Path<String>,
    body: Option<Json<InviteRequest>>,
) -> Result<impl IntoResponse, Error> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let invite = state
        .guilds
        .create_invite(&claims.sub, &id, body.max_uses, body.expires_at)?;
    Ok((StatusCode::CREATED, Json(invite)))
}

async fn redeem_invite(
    State(state): State<Arc<AppState>>,
    AuthUser(claims): AuthUser,
    Path(code): Path<String>,
) -> Result<impl IntoResponse, Error> {
    Ok(Json(state.guilds.redeem_invite(&claims.sub, &code)?))
}

// ── Messages ───────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct MessagesQuery {
    before: Option<String>,
    after: Option<String>,
    #[serde(default)]
    limit: usize,
}

async fn get_messages(
    State(state): State<Arc<AppState>>,
    AuthUser(claims): AuthUser,
    Path(id): Path<String>,
    Query(query): Query<MessagesQuery>,
) -> Result<impl IntoResponse, Error> {
    Ok(Json(state.chat.get_messages(
        &claims.sub,
        &id,
        query.before.as_deref(),
        query.after.as_deref(),
        query.limit,
    )?))
}

#[derive(Deserialize)]
struct MessageRequest {
    content: String,
}

async fn send_message(
    State(state): State<Arc<AppState>>,
    AuthUser(claims): AuthUser,
    Path(id): Path<String>,
    Json(body): Json<MessageRequest>,
) -> Result<impl IntoResponse, Error> {
    let row = state.chat.send_message(&claims.sub, &id, &body.content)?;
    Ok((StatusCode::CREATED, Json(row)))
}

async fn edit_message(
    State(state): State<Arc<AppState>>,
    AuthUser(claims): AuthUser,
    Path(id): Path<String>,
    Json(body): Json<MessageRequest>,
) -> Result<impl IntoResponse, Error> {
    Ok(Json(state.chat.edit_message(&claims.sub, &id, &body.content)?))
}

#[derive(Deserialize)]
struct DeleteMessageQuery {
    #[serde(default)]
    is_manager: bool,
}

async fn delete_message(
    State(state): State<Arc<AppState>>,
    AuthUser(claims): AuthUser,
    Path(id): Path<String>,
    Query(query): Query<DeleteMessageQuery>,
) -> Result<impl IntoResponse, Error> {
    state.chat.delete_message(&claims.sub, &id, query.is_manager)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct SearchQuery {
    q: String,
    #[serde(default)]
    limit: usize,
}

async fn search_messages(
    State(state): State<Arc<AppState>>,
    AuthUser(claims): AuthUser,
    Path(id): Path<String>,
    Query(query): Query<SearchQuery>,
) -> Result<impl IntoResponse, Error> {
    Ok(Json(state.chat.search_messages(
        &claims.sub,
        &id,
        &query.q,
        query.limit,
    )?))
}

// ── Friends ────────────────────────────────────────────────────────────

async fn list_friends(
    State(state): State<Arc<AppState>>,
    AuthUser(claims): AuthUser,
) -> Result<impl IntoResponse, Error> {
    Ok(Json(state.friends.list_friends(&claims.sub)?))
}

#[derive(Deserialize)]
struct FriendRequestBody {
    user_id: String,
}

async fn send_friend_request(
    State(state): State<Arc<AppState>>,
    AuthUser(claims): AuthUser,
    Json(body): Json<FriendRequestBody>,
) -> Result<impl IntoResponse, Error> {
    let row = state.friends.send_request(&claims.sub, &body.user_id)?;
    Ok((StatusCode::CREATED, Json(row)))
}

async fn list_friend_requests(
    State(state): State<Arc<AppState>>,
    AuthUser(claims): AuthUser,
) -> Result<impl IntoResponse, Error> {
    Ok(Json(state.friends.list_requests(&claims.sub)?))
}

async fn accept_friend_request(
    State(state): State<Arc<AppState>>,
    AuthUser(claims): AuthUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, Error> {
    state.friends.accept_request(&claims.sub, &id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn decline_friend_request(
    State(state): State<Arc<AppState>>,
    AuthUser(claims): AuthUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, Error> {
    state.friends.decline_request(&claims.sub, &id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn remove_friend(
    State(state): State<Arc<AppState>>,
    AuthUser(claims): AuthUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, Error> {
    state.friends.remove_friend(&claims.sub, &id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn block_friend(
    State(state): State<Arc<AppState>>,
    AuthUser(claims): AuthUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, Error> {
    state.friends.block(&claims.sub, &id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn unblock_friend(
    State(state): State<Arc<AppState>>,
    AuthUser(claims): AuthUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, Error> {
    state.friends.unblock(&claims.sub, &id)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct FriendMessagesQuery {
    after: Option<String>,
    #[serde(default)]
    limit: usize,
}

async fn list_friend_messages(
    State(state): State<Arc<AppState>>,
    AuthUser(claims): AuthUser,
    Path(id): Path<String>,
    Query(query): Query<FriendMessagesQuery>,
) -> Result<impl IntoResponse, Error> {
    Ok(Json(state.friends.list_dms(
        &claims.sub,
        &id,
        query.after.as_deref(),
        query.limit,
    )?))
}

async fn send_friend_message(
    State(state): State<Arc<AppState>>,
    AuthUser(claims): AuthUser,
    Path(id): Path<String>,
    Json(body): Json<MessageRequest>,
) -> Result<impl IntoResponse, Error> {
    let row = state.friends.send_dm(&claims.sub, &id, &body.content)?;
    Ok((StatusCode::CREATED, Json(row)))
}

// ── Translation ────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct TranslateRequest {
    text: String,
    target: String,
}

#[derive(Serialize)]
struct TranslateResponse {
    translated_text: String,
}

async fn translate(
    State(state): State<Arc<AppState>>,
    AuthUser(_claims): AuthUser,
    Json(body): Json<TranslateRequest>,
) -> Result<impl IntoResponse, Error> {
    let translated_text = state.translator.translate(&body.text, &body.target).await?;
    Ok(Json(TranslateResponse { translated_text }))
}

// ── WebSocket ──────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct WsQuery {
    token: String,
}

async fn ws_upgrade(
    upgrade: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
) -> Result<impl IntoResponse, Error> {
    let claims = state.auth.authenticate(&query.token)?;
    Ok(upgrade.on_upgrade(move |socket| ws::run_connection(socket, claims.sub, state)))
}
