pub mod application;
pub mod channel_approval;
pub mod user_auth;

pub use application::Application;
pub use channel_approval::{ApprovalStatus, ChannelApproval};
pub use user_auth::{ChannelState, ResetScope, TotpState, UserAuthRecord};
