//! HTTP control plane: REST surface, CORS, security headers, static
//! upload serving, and the loopback-only admin API.

pub mod admin;
pub mod channels;
pub mod guilds;
pub mod members;
pub mod messages;
pub mod roles;
pub mod server_info;
pub mod uploads;

use axum::extract::DefaultBodyLimit;
use axum::http::{header, HeaderValue, Method, Request};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{delete, get, patch, post};
use axum::Router;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::auth::require_auth;
use crate::gateway::handler::ws_handler;
use crate::state::AppState;

/// JSON body cap for the API surface.
const JSON_BODY_LIMIT: usize = 10 * 1024 * 1024;

/// Build the full application router.
pub fn router(state: AppState) -> Router {
    let public = Router::new()
        .route("/api/health", get(server_info::health))
        .route("/api/server/info", get(server_info::info))
        .route("/api/server/icon", get(server_info::icon));

    let authed = Router::new()
        .route("/api/guilds", get(guilds::list).post(guilds::create_rejected))
        .route("/api/guilds/:guild_id/join", post(guilds::join))
        .route("/api/guilds/:guild_id/leave", post(guilds::leave))
        .route("/api/guilds/:guild_id/audit", get(guilds::audit))
        .route(
            "/api/guilds/:guild_id/settings",
            get(guilds::settings).patch(guilds::update_settings),
        )
        .route(
            "/api/guilds/:guild_id/channels",
            get(channels::list).post(channels::create),
        )
        .route("/api/guilds/:guild_id/channels/order", patch(channels::reorder))
        .route(
            "/api/channels/:channel_id",
            patch(channels::update).delete(channels::remove),
        )
        .route("/api/guilds/:guild_id/roles", get(roles::list).post(roles::create))
        .route("/api/roles/:role_id", patch(roles::update).delete(roles::remove))
        .route(
            "/api/roles/:role_id/icon",
            post(roles::upload_icon).layer(DefaultBodyLimit::max(roles::ICON_LIMIT_BYTES)),
        )
        .route("/api/guilds/:guild_id/members", get(members::list))
        .route(
            "/api/guilds/:guild_id/members/:user_id/nickname",
            patch(members::nickname),
        )
        .route("/api/guilds/:guild_id/members/:user_id/roles", patch(members::roles))
        .route(
            "/api/guilds/:guild_id/members/:user_id/timeout",
            patch(members::timeout),
        )
        .route("/api/guilds/:guild_id/members/:user_id/voice", patch(members::voice))
        .route("/api/guilds/:guild_id/members/:user_id/kick", post(members::kick))
        .route("/api/guilds/:guild_id/members/:user_id/ban", post(members::ban))
        .route(
            "/api/guilds/:guild_id/members/:user_id/move",
            post(members::move_voice),
        )
        .route(
            "/api/channels/:channel_id/messages",
            get(messages::list).post(messages::create),
        )
        .route(
            "/api/channels/:channel_id/messages/:message_id",
            delete(messages::remove),
        )
        .route(
            "/api/files/upload",
            post(uploads::upload)
                .layer(DefaultBodyLimit::max(state.config.file_limit_bytes())),
        )
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    let cors = cors_layer(&state);

    Router::new()
        .route("/ws", get(ws_handler))
        .merge(public)
        .merge(authed)
        .merge(admin::router(state.clone()))
        .nest_service("/uploads", ServeDir::new(&state.config.uploads_dir))
        .nest_service("/role-icons", ServeDir::new(&state.config.role_icons_dir))
        .layer(middleware::from_fn(security_headers))
        .layer(cors)
        .layer(DefaultBodyLimit::max(JSON_BODY_LIMIT))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// CORS: configured allowlist plus implicit loopback, with the optional
/// null/file:// escapes, evaluated per request.
fn cors_layer(state: &AppState) -> CorsLayer {
    let config = state.config.clone();
    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(move |origin: &HeaderValue, _| {
            origin
                .to_str()
                .map(|o| config.allows_origin(o))
                .unwrap_or(false)
        }))
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PATCH,
            Method::PUT,
            Method::DELETE,
        ])
        .allow_headers(Any)
}

/// Security headers on every response; HSTS only when the request came in
/// over TLS (terminated upstream).
async fn security_headers(request: Request<axum::body::Body>, next: Next) -> Response {
    let is_tls = request
        .headers()
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|proto| proto.eq_ignore_ascii_case("https"));

    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(header::X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert("x-xss-protection", HeaderValue::from_static("1; mode=block"));
    headers.insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static(
            "default-src 'self'; img-src 'self' data: blob:; media-src 'self' blob:",
        ),
    );
    if is_tls {
        headers.insert(
            header::STRICT_TRANSPORT_SECURITY,
            HeaderValue::from_static("max-age=31536000; includeSubDomains"),
        );
    }
    response
}
