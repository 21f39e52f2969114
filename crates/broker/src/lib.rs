pub mod authentication;
pub mod authorization;
pub mod hub;
pub mod notifications;
pub mod server;
pub mod session;
pub mod subscriptions;
pub mod tls;

use squawkbus_protocol::v1::error::ProtocolError;

pub use crate::authentication::AuthenticationManager;
pub use crate::authorization::{AuthorizationRepository, AuthorizationSpec, Role};
pub use crate::hub::{Hub, SessionEvent};
pub use crate::server::{Server, ServerConfig, TlsConfig};

/// Stable opaque session key. Routing tables hold these rather than session
/// handles so a closed session cannot be kept alive by a stale bucket entry.
pub type SessionId = u64;

/// Cap on a session's outbound message queue. A session that cannot drain
/// this many routed messages is dropped rather than ballooning broker memory.
pub const OUTBOUND_QUEUE: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("outbound queue overflow")]
    OutboundOverflow,

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
