//! Relay Gate
//!
//! Accepts Minecraft connections forwarded by a trusted relay, verifies the
//! ECDSA-signed metadata the relay appends to the handshake hostname, and
//! restores the real client address and hostname before routing the
//! connection to a backend.

pub mod authenticator;
pub mod config;
pub mod interceptor;
pub mod pipeline;
pub mod protocol;
pub mod proxy;
pub mod security;

// Re-export commonly used types and functions
pub use authenticator::{
    RejectReason, RelayPayload, TrustAnchor, ValidatedIdentity, authenticate,
};
pub use config::{Config, ListenConfig, TargetConfig, load_config};
pub use interceptor::{HandshakeInterceptor, IntegrationFault, install};
pub use pipeline::{ChannelInitializer, ConnectionContext, InitializerHolder, Pipeline, Stage};
pub use proxy::{HostInitializer, Router, Server, handle_connection, serve};
pub use security::is_ip_listed;
