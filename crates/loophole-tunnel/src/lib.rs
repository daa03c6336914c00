//! Tunnel core
//!
//! Everything between the operator's local HTTP server and the public
//! gateway: the SSH session with its remote listener, the locally-terminated
//! TLS reverse proxy, the per-connection relay, and the supervisor that
//! keeps the whole thing alive across reconnects.

pub mod acceptor;
pub mod config;
pub mod error;
pub mod gateway;
pub mod proxy;
pub mod supervisor;

pub use config::TunnelConfig;
pub use error::TunnelError;
pub use gateway::GatewaySession;
pub use proxy::LocalProxy;
pub use supervisor::Supervisor;
