pub mod channel;
pub mod credentials;
pub mod crypto;
pub mod enrollment;
pub mod gateway;
pub mod handoff;
pub mod totp;
pub mod wecom;

pub use channel::{ChannelProvider, ChannelService};
pub use credentials::CredentialService;
pub use crypto::SecretCipher;
pub use enrollment::EnrollmentService;
pub use gateway::Gateway;
pub use handoff::HandoffIssuer;
pub use totp::TotpEngine;
pub use wecom::WeComClient;
