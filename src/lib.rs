pub mod config;
pub mod error;
pub mod handlers;
pub mod models;
pub mod repositories;
pub mod services;
pub mod state;

use axum::{
    Router, middleware,
    routing::{get, post},
};
use http::{
    HeaderName, HeaderValue, Method,
    header::{AUTHORIZATION, CONTENT_TYPE},
};
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::config::Config;
use crate::state::AppState;

/// Router の構築
pub fn create_router(state: AppState) -> Router {
    // 管理 API（Bearer ADMIN_TOKEN）
    let admin = Router::new()
        .route("/apps", get(handlers::list_apps).post(handlers::create_app))
        .route(
            "/apps/{app_id}",
            get(handlers::get_app).put(handlers::update_app),
        )
        .route("/apps/{app_id}/secret", post(handlers::reveal_secret))
        .route(
            "/apps/{app_id}/secret/rotate",
            post(handlers::rotate_secret),
        )
        .route("/apps/{app_id}/users", get(handlers::list_users))
        .route(
            "/apps/{app_id}/users/{user_id}",
            axum::routing::delete(handlers::reset_user),
        )
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            handlers::require_admin,
        ));

    Router::new()
        .route("/api/health", get(handlers::health_check))
        // 登録・検証
        .route("/auth/status/{app_id}/{user_id}", get(handlers::auth_status))
        .route("/auth/setup/{app_id}/{user_id}", post(handlers::setup))
        .route("/auth/verify/{app_id}/{user_id}", post(handlers::verify))
        .route(
            "/auth/bind-wechat/{app_id}/{user_id}",
            post(handlers::bind_wechat),
        )
        .route(
            "/auth/approval/{app_id}/{user_id}",
            post(handlers::request_approval),
        )
        .route(
            "/auth/approval/{app_id}/{user_id}/{approval_id}",
            get(handlers::poll_approval),
        )
        // 外部チャネル
        .route("/channel/wecom/callback", get(handlers::wecom_callback))
        .route(
            "/channel/approvals/{approval_id}",
            get(handlers::decide_approval),
        )
        // 連携元アプリケーション
        .route("/handoff/redeem", post(handlers::redeem))
        .merge(admin)
        .layer(cors_layer(&state.config))
        .with_state(state)
}

/// CORS 設定（許可オリジン未設定なら全許可）
fn cors_layer(config: &Config) -> CorsLayer {
    let origins: Vec<HeaderValue> = config
        .cors_origins()
        .into_iter()
        .filter_map(|origin| match HeaderValue::from_str(&origin) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(error = ?e, origin = %origin, "不正な CORS オリジンを無視");
                None
            }
        })
        .collect();

    let allow_origin = if origins.is_empty() {
        AllowOrigin::any()
    } else {
        AllowOrigin::list(origins)
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([
            CONTENT_TYPE,
            AUTHORIZATION,
            HeaderName::from_static("x-app-id"),
            HeaderName::from_static("x-app-secret"),
        ])
}
