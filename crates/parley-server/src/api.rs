use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;

use axum::{
    extract::{Path, State},
    http::Method,
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

use parley_shared::{ChatMessage, MessageId, UserId};
use parley_store::User;

use crate::auth::{AuthUser, SharedAuthenticator};
use crate::config::ServerConfig;
use crate::error::{AuthError, ServerError};
use crate::gateway::{self, ConnectionGateway};
use crate::presence::PresenceRegistry;
use crate::router::MessageRouter;
use crate::store::MessageStore;
use crate::unseen::UnseenCounters;

/// Process-wide services, constructed once and handed to every handler and
/// connection task.
#[derive(Clone)]
pub struct AppState {
    pub store: MessageStore,
    pub auth: SharedAuthenticator,
    pub presence: PresenceRegistry,
    pub unseen: UnseenCounters,
    pub router: MessageRouter,
    pub gateway: ConnectionGateway,
}

impl AppState {
    pub fn new(config: &ServerConfig, store: MessageStore, auth: SharedAuthenticator) -> Self {
        let presence = PresenceRegistry::new();
        let unseen = UnseenCounters::new();
        let router = MessageRouter::new(presence.clone(), unseen.clone(), store.clone());
        let gateway = ConnectionGateway::new(presence.clone(), auth.clone(), config);

        Self {
            store,
            auth,
            presence,
            unseen,
            router,
            gateway,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/api/auth/check", get(auth_check))
        .route("/api/auth/logout", post(logout))
        .route("/api/auth/update-profile", put(update_profile))
        .route("/api/presence", get(online_users))
        .route("/api/messages/user", get(contacts))
        .route("/api/messages/users", get(contacts))
        .route("/api/messages/:peer", get(conversation))
        .route("/api/messages/send/:peer", post(send_message))
        .route("/api/messages/mark/:id", put(mark_seen))
        .route("/ws", get(gateway::ws_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct UserResponse {
    success: bool,
    user: User,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ContactsResponse {
    success: bool,
    users: Vec<User>,
    unseen_messages: HashMap<UserId, u32>,
}

#[derive(Serialize)]
struct ConversationResponse {
    success: bool,
    messages: Vec<ChatMessage>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageResponse {
    success: bool,
    new_message: ChatMessage,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OnlineUsersResponse {
    success: bool,
    online_users: Vec<UserId>,
}

#[derive(Debug, Deserialize)]
struct SendMessageRequest {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    image: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateProfileRequest {
    #[serde(default)]
    full_name: Option<String>,
    #[serde(default)]
    bio: Option<String>,
    /// URL of an already-hosted image. Blank keeps the current picture.
    #[serde(default)]
    profile_pic: Option<String>,
}

fn parse_peer(raw: &str) -> Result<UserId, ServerError> {
    UserId::parse(raw).map_err(|e| ServerError::BadRequest(e.to_string()))
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn auth_check(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> Result<Json<UserResponse>, ServerError> {
    let user = state
        .store
        .get_user(user)
        .await?
        .ok_or(ServerError::Unauthenticated(AuthError::UnknownUser))?;

    Ok(Json(UserResponse {
        success: true,
        user,
    }))
}

/// Fields left out of the request keep their stored values.
async fn update_profile(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(req): Json<UpdateProfileRequest>,
) -> Result<Json<UserResponse>, ServerError> {
    let full_name = match req.full_name {
        Some(name) if name.trim().is_empty() => {
            return Err(ServerError::BadRequest("Full name cannot be empty".into()));
        }
        Some(name) => Some(name.trim().to_string()),
        None => None,
    };
    let bio = req.bio;
    let profile_pic = req
        .profile_pic
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty());

    let updated = state
        .store
        .update_user(user.clone(), move |profile| {
            if let Some(full_name) = full_name {
                profile.full_name = full_name;
            }
            if let Some(bio) = bio {
                profile.bio = bio;
            }
            if profile_pic.is_some() {
                profile.profile_pic = profile_pic;
            }
        })
        .await?
        .ok_or(ServerError::Unauthenticated(AuthError::UnknownUser))?;

    info!(user = %user, "Profile updated");
    Ok(Json(UserResponse {
        success: true,
        user: updated,
    }))
}

/// Drop the caller's live connection, if any, and tell everyone else.
async fn logout(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> Json<serde_json::Value> {
    if let Some(broadcast) = state.presence.deregister(&user).await {
        info!(
            user = %user,
            online = broadcast.online().len(),
            "Live connection closed by logout"
        );
        broadcast.dispatch();
    }
    info!(user = %user, "User logged out");
    Json(serde_json::json!({ "success": true, "message": "Logged out" }))
}

async fn online_users(
    State(state): State<AppState>,
    AuthUser(_): AuthUser,
) -> Json<OnlineUsersResponse> {
    Json(OnlineUsersResponse {
        success: true,
        online_users: state.presence.snapshot().await,
    })
}

/// Everyone except the caller, plus the caller's unseen counts per sender.
/// Counts are re-read from the store on every call, so messages that were
/// pushed but never opened (or whose push was dropped) still show up.
async fn contacts(
    State(state): State<AppState>,
    AuthUser(viewer): AuthUser,
) -> Result<Json<ContactsResponse>, ServerError> {
    let users = state.store.contacts(viewer.clone()).await?;

    let stored = state.store.unseen_by_sender(viewer.clone()).await?;
    let unseen_messages = state.unseen.reconcile(&viewer, stored).await;

    Ok(Json(ContactsResponse {
        success: true,
        users,
        unseen_messages,
    }))
}

/// Open the thread with `peer`: everything they sent the caller becomes seen.
async fn conversation(
    State(state): State<AppState>,
    AuthUser(viewer): AuthUser,
    Path(peer): Path<String>,
) -> Result<Json<ConversationResponse>, ServerError> {
    let peer = parse_peer(&peer)?;

    let marked = state
        .store
        .mark_conversation_seen(viewer.clone(), peer.clone())
        .await?;
    state.unseen.reset(&viewer, &peer).await;
    debug!(viewer = %viewer, peer = %peer, marked, "Thread opened");

    let messages = state.store.conversation(viewer, peer).await?;
    Ok(Json(ConversationResponse {
        success: true,
        messages,
    }))
}

async fn send_message(
    State(state): State<AppState>,
    AuthUser(sender): AuthUser,
    Path(peer): Path<String>,
    Json(req): Json<SendMessageRequest>,
) -> Result<Json<SendMessageResponse>, ServerError> {
    let receiver = parse_peer(&peer)?;
    let message = ChatMessage::new(sender, receiver.clone(), req.text, req.image)
        .map_err(|e| ServerError::BadRequest(e.to_string()))?;

    if !state.store.user_exists(receiver.clone()).await? {
        return Err(ServerError::NotFound(format!("User {receiver}")));
    }

    // Routing only ever sees persisted messages.
    let mut message = state.store.insert_message(message).await?;
    let outcome = state.router.route(&mut message).await;
    debug!(message = %message.id, ?outcome, "Message routed");

    Ok(Json(SendMessageResponse {
        success: true,
        new_message: message,
    }))
}

async fn mark_seen(
    State(state): State<AppState>,
    AuthUser(viewer): AuthUser,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let id = Uuid::parse_str(&id)
        .map(MessageId)
        .map_err(|e| ServerError::BadRequest(format!("Invalid message id: {e}")))?;

    let message = state
        .store
        .get_message(id)
        .await?
        .ok_or_else(|| ServerError::NotFound(format!("Message {id}")))?;

    if message.receiver_id != viewer {
        warn!(viewer = %viewer, message = %id, "Attempt to mark another user's message");
        return Err(ServerError::Forbidden(
            "Only the recipient can mark a message seen".into(),
        ));
    }

    state.store.mark_seen(id).await?;
    state.unseen.reset(&viewer, &message.sender_id).await;

    Ok(Json(serde_json::json!({ "success": true })))
}

pub async fn serve<F>(state: AppState, addr: SocketAddr, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use chrono::{Duration, Utc};
    use ed25519_dalek::SigningKey;
    use parley_shared::protocol::ServerEvent;
    use parley_shared::token::issue_token;
    use rand::rngs::OsRng;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use crate::auth::TokenAuthenticator;
    use crate::presence::LiveConnection;

    struct TestApp {
        state: AppState,
        issuer: SigningKey,
    }

    fn uid(s: &str) -> UserId {
        UserId::parse(s).unwrap()
    }

    async fn setup() -> TestApp {
        let issuer = SigningKey::generate(&mut OsRng);
        let store = MessageStore::in_memory().unwrap();
        for (id, name) in [("u1", "Alice"), ("u2", "Bob"), ("u3", "Carol")] {
            store
                .insert_user(User {
                    id: uid(id),
                    full_name: name.into(),
                    bio: String::new(),
                    profile_pic: None,
                    created_at: Utc::now(),
                })
                .await
                .unwrap();
        }

        let auth: SharedAuthenticator = Arc::new(TokenAuthenticator::new(
            issuer.verifying_key().to_bytes(),
            store.clone(),
        ));
        let state = AppState::new(&ServerConfig::default(), store, auth);
        TestApp { state, issuer }
    }

    impl TestApp {
        fn token(&self, user: &str) -> String {
            issue_token(&uid(user), Utc::now() + Duration::hours(1), &self.issuer)
        }

        async fn call(
            &self,
            method: Method,
            uri: &str,
            user: Option<&str>,
            body: Option<Value>,
        ) -> (StatusCode, Value) {
            let mut req = Request::builder().method(method).uri(uri);
            if let Some(user) = user {
                req = req.header("token", self.token(user));
            }
            let req = match body {
                Some(body) => req
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
                None => req.body(Body::empty()).unwrap(),
            };

            let res = build_router(self.state.clone()).oneshot(req).await.unwrap();
            let status = res.status();
            let bytes = axum::body::to_bytes(res.into_body(), usize::MAX)
                .await
                .unwrap();
            let value = if bytes.is_empty() {
                Value::Null
            } else {
                serde_json::from_slice(&bytes).unwrap()
            };
            (status, value)
        }

        async fn send(&self, from: &str, to: &str, text: &str) -> (StatusCode, Value) {
            self.call(
                Method::POST,
                &format!("/api/messages/send/{to}"),
                Some(from),
                Some(json!({ "text": text })),
            )
            .await
        }
    }

    #[tokio::test]
    async fn test_health() {
        let app = setup().await;
        let (status, body) = app.call(Method::GET, "/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_requests_without_token_are_rejected() {
        let app = setup().await;
        let (status, body) = app.call(Method::GET, "/api/auth/check", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["success"], false);

        let (status, _) = app
            .call(
                Method::POST,
                "/api/messages/send/u2",
                None,
                Some(json!({ "text": "hi" })),
            )
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(app
            .state
            .store
            .conversation(uid("u1"), uid("u2"))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_auth_check_returns_profile() {
        let app = setup().await;
        let (status, body) = app.call(Method::GET, "/api/auth/check", Some("u1"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["user"]["_id"], "u1");
        assert_eq!(body["user"]["fullName"], "Alice");
    }

    #[tokio::test]
    async fn test_offline_send_counts_until_thread_opened() {
        let app = setup().await;

        let (status, body) = app.send("u1", "u2", "hello").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["newMessage"]["seen"], false);
        assert_eq!(body["newMessage"]["text"], "hello");

        let (_, contacts) = app
            .call(Method::GET, "/api/messages/users", Some("u2"), None)
            .await;
        assert_eq!(contacts["unseenMessages"], json!({ "u1": 1 }));
        let names: Vec<&str> = contacts["users"]
            .as_array()
            .unwrap()
            .iter()
            .map(|u| u["_id"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["u1", "u3"]);

        let (status, thread) = app.call(Method::GET, "/api/messages/u1", Some("u2"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(thread["messages"].as_array().unwrap().len(), 1);
        assert_eq!(thread["messages"][0]["seen"], true);

        let (_, contacts) = app
            .call(Method::GET, "/api/messages/users", Some("u2"), None)
            .await;
        assert_eq!(contacts["unseenMessages"], json!({}));
    }

    #[tokio::test]
    async fn test_counts_rebuilt_from_store() {
        let app = setup().await;
        // Unseen messages written before this process started.
        for text in ["one", "two"] {
            let msg = ChatMessage::new(uid("u3"), uid("u2"), Some(text.into()), None).unwrap();
            app.state.store.insert_message(msg).await.unwrap();
        }

        let (_, contacts) = app
            .call(Method::GET, "/api/messages/users", Some("u2"), None)
            .await;
        assert_eq!(contacts["unseenMessages"], json!({ "u3": 2 }));
    }

    #[tokio::test]
    async fn test_contacts_served_at_client_path() {
        let app = setup().await;
        app.send("u1", "u2", "hello").await;

        let (status, body) = app
            .call(Method::GET, "/api/messages/user", Some("u2"), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.get("messages").is_none());
        assert_eq!(body["users"].as_array().unwrap().len(), 2);
        assert_eq!(body["unseenMessages"], json!({ "u1": 1 }));
    }

    #[tokio::test]
    async fn test_contacts_count_unopened_live_pushes() {
        let app = setup().await;
        app.call(Method::GET, "/api/messages/user", Some("u2"), None)
            .await;

        // Online, but looking at nothing in particular.
        let (conn, mut endpoint) = LiveConnection::new(uid("u2"), 8);
        app.state.presence.register(conn).await;

        let (_, body) = app.send("u1", "u2", "ping").await;
        assert_eq!(body["newMessage"]["seen"], false);
        assert!(matches!(
            endpoint.events.try_recv().unwrap(),
            ServerEvent::NewMessage { .. }
        ));

        let (_, contacts) = app
            .call(Method::GET, "/api/messages/user", Some("u2"), None)
            .await;
        assert_eq!(contacts["unseenMessages"], json!({ "u1": 1 }));
    }

    #[tokio::test]
    async fn test_contacts_count_dropped_pushes() {
        let app = setup().await;
        app.call(Method::GET, "/api/messages/user", Some("u3"), None)
            .await;

        // Registered, but the transport is already gone.
        let (conn, endpoint) = LiveConnection::new(uid("u3"), 8);
        app.state.presence.register(conn).await;
        drop(endpoint);

        let (status, _) = app.send("u1", "u3", "anyone?").await;
        assert_eq!(status, StatusCode::OK);

        let (_, contacts) = app
            .call(Method::GET, "/api/messages/user", Some("u3"), None)
            .await;
        assert_eq!(contacts["unseenMessages"], json!({ "u1": 1 }));
    }

    #[tokio::test]
    async fn test_fetch_between_persist_and_route_counts_once() {
        let app = setup().await;
        let msg = ChatMessage::new(uid("u1"), uid("u2"), Some("hi".into()), None).unwrap();
        let mut msg = app.state.store.insert_message(msg).await.unwrap();

        let (_, first) = app
            .call(Method::GET, "/api/messages/user", Some("u2"), None)
            .await;
        assert_eq!(first["unseenMessages"], json!({ "u1": 1 }));

        app.state.router.route(&mut msg).await;

        let (_, second) = app
            .call(Method::GET, "/api/messages/user", Some("u2"), None)
            .await;
        assert_eq!(second["unseenMessages"], json!({ "u1": 1 }));
    }

    #[tokio::test]
    async fn test_update_profile() {
        let app = setup().await;

        let (status, body) = app
            .call(
                Method::PUT,
                "/api/auth/update-profile",
                Some("u1"),
                Some(json!({
                    "fullName": " Alice Liddell ",
                    "bio": "down the hole",
                    "profilePic": "https://img.example/alice.png"
                })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["user"]["fullName"], "Alice Liddell");
        assert_eq!(body["user"]["profilePic"], "https://img.example/alice.png");

        // Omitted fields and a blank picture keep what is stored.
        let (status, _) = app
            .call(
                Method::PUT,
                "/api/auth/update-profile",
                Some("u1"),
                Some(json!({ "bio": "back again", "profilePic": "" })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);

        let (_, check) = app.call(Method::GET, "/api/auth/check", Some("u1"), None).await;
        assert_eq!(check["user"]["fullName"], "Alice Liddell");
        assert_eq!(check["user"]["bio"], "back again");
        assert_eq!(check["user"]["profilePic"], "https://img.example/alice.png");

        let (status, _) = app
            .call(
                Method::PUT,
                "/api/auth/update-profile",
                Some("u1"),
                Some(json!({ "fullName": "   " })),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = app
            .call(
                Method::PUT,
                "/api/auth/update-profile",
                None,
                Some(json!({ "bio": "anonymous" })),
            )
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_send_to_viewing_recipient_is_seen() {
        let app = setup().await;
        let (conn, mut endpoint) = LiveConnection::new(uid("u2"), 8);
        let conn_id = conn.id;
        app.state.presence.register(conn).await;
        app.state
            .presence
            .set_viewing(&uid("u2"), conn_id, Some(uid("u1")))
            .await;

        let (status, body) = app.send("u1", "u2", "you there?").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["newMessage"]["seen"], true);

        match endpoint.events.try_recv().unwrap() {
            ServerEvent::NewMessage { message } => {
                assert_eq!(message.text.as_deref(), Some("you there?"))
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(app.state.unseen.get_all(&uid("u2")).await.is_empty());
    }

    #[tokio::test]
    async fn test_send_validation() {
        let app = setup().await;

        let (status, _) = app.send("u1", "nobody", "hello").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = app
            .call(
                Method::POST,
                "/api/messages/send/u2",
                Some("u1"),
                Some(json!({ "text": "   " })),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = app
            .call(
                Method::POST,
                "/api/messages/send/u2",
                Some("u1"),
                Some(json!({ "image": "https://img.example/cat.png" })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["newMessage"].get("text").is_none());
    }

    #[tokio::test]
    async fn test_mark_seen_only_by_recipient() {
        let app = setup().await;
        let (_, body) = app.send("u1", "u2", "hello").await;
        let id = body["newMessage"]["_id"].as_str().unwrap().to_string();
        let uri = format!("/api/messages/mark/{id}");

        let (status, _) = app.call(Method::PUT, &uri, Some("u1"), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = app.call(Method::PUT, &uri, Some("u2"), None).await;
        assert_eq!(status, StatusCode::OK);

        let id = MessageId(Uuid::parse_str(&id).unwrap());
        assert!(app.state.store.get_message(id).await.unwrap().unwrap().seen);
        assert!(app.state.unseen.get_all(&uid("u2")).await.is_empty());

        let missing = format!("/api/messages/mark/{}", Uuid::new_v4());
        let (status, _) = app.call(Method::PUT, &missing, Some("u2"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = app
            .call(Method::PUT, "/api/messages/mark/not-a-uuid", Some("u2"), None)
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_presence_and_logout() {
        let app = setup().await;
        let (conn, mut endpoint) = LiveConnection::new(uid("u1"), 8);
        app.state.presence.register(conn).await;
        let (other, mut other_endpoint) = LiveConnection::new(uid("u3"), 8);
        app.state.presence.register(other).await;

        let (_, body) = app.call(Method::GET, "/api/presence", Some("u2"), None).await;
        assert_eq!(body["onlineUsers"], json!(["u1", "u3"]));

        let (status, _) = app.call(Method::POST, "/api/auth/logout", Some("u1"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(app.state.presence.lookup(&uid("u1")).await.is_none());

        // The logged-out connection is told to close; the rest hear about it.
        tokio::time::timeout(std::time::Duration::from_secs(1), endpoint.close.requested())
            .await
            .expect("close requested");
        assert_eq!(
            other_endpoint.events.try_recv().unwrap(),
            ServerEvent::OnlineUsers {
                users: vec![uid("u3")]
            }
        );
        assert!(endpoint.events.try_recv().is_err());
    }
}
