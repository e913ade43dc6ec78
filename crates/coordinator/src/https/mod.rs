//! Wallet-facing HTTPS ingress: a TLS-terminating HTTP/1.1 server with
//! per-connection response ordering.

pub mod parser;
pub mod server;
pub mod session;

pub use server::{WalletHttpsServer, WalletServerConfig};
pub use session::SessionConfig;
