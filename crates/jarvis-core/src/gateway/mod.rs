//! HTTP + WebSocket gateway.
//!
//! A public router (health, login) merged with a protected router
//! (everything else) behind `auth_middleware`, `CorsLayer` applied last.
//! PID-file and port-fallback binding live in `jarvis-daemon` rather than
//! here, since this crate is a library and has no process lifecycle of its
//! own.

#[cfg(feature = "gateway")]
pub mod auth;
#[cfg(feature = "gateway")]
pub mod chat;
#[cfg(feature = "gateway")]
pub mod http;
#[cfg(feature = "gateway")]
pub mod state;
#[cfg(feature = "gateway")]
pub mod terminal;
#[cfg(feature = "gateway")]
pub mod voice;
#[cfg(feature = "gateway")]
pub mod ws;

#[cfg(feature = "gateway")]
pub use state::{GatewayState, GatewayStateInner, SessionState};

#[cfg(feature = "gateway")]
mod router {
    use axum::{
        middleware,
        routing::{get, post, put},
        Router,
    };
    use tower_http::cors::CorsLayer;

    use super::{
        auth::auth_middleware,
        http::{
            camera_snapshot, create_event, event_snapshot, event_thumbnail, execute_tool, get_preferences,
            health, list_events, list_tools, login, nvr_events, set_preference, unresolved_events,
        },
        state::GatewayState,
        ws::ws_handler,
    };

    /// Assembles the full gateway router: public routes need no bearer
    /// token, protected routes (including the `/api/v1/ws` upgrade) require
    /// one via [`auth_middleware`].
    pub fn router(state: GatewayState) -> Router {
        let protected = Router::new()
            .route("/api/v1/ws", get(ws_handler))
            .route("/api/memory/events", get(list_events).post(create_event))
            .route("/api/memory/events/unresolved", get(unresolved_events))
            .route("/api/memory/preferences", get(get_preferences))
            .route("/api/memory/preferences/{key}", put(set_preference))
            .route("/api/tools", get(list_tools))
            .route("/api/tools/execute", post(execute_tool))
            .route("/api/cameras/{camera}/snapshot", get(camera_snapshot))
            .route("/api/events/{id}/thumbnail", get(event_thumbnail))
            .route("/api/events/{id}/snapshot", get(event_snapshot))
            .route("/api/events", get(nvr_events))
            .layer(middleware::from_fn(auth_middleware))
            .with_state(state.clone());

        let public = Router::new()
            .route("/api/health", get(health))
            .route("/api/auth/login", post(login))
            .with_state(state);

        Router::new().merge(public).merge(protected).layer(CorsLayer::permissive())
    }
}

#[cfg(feature = "gateway")]
pub use router::router;
