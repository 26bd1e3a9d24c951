pub mod admin_auth;
pub mod apps;
pub mod auth;
pub mod channel;
pub mod handoff;
pub mod health;

pub use admin_auth::require_admin;
pub use apps::{
    create_app, get_app, list_apps, list_users, reset_user, reveal_secret, rotate_secret,
    update_app,
};
pub use auth::{auth_status, bind_wechat, poll_approval, request_approval, setup, verify};
pub use channel::{decide_approval, wecom_callback};
pub use handoff::redeem;
pub use health::health_check;
