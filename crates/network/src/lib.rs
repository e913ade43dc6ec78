//! Coordinator↔node transport: exact-length TLS I/O, the coordinator-side
//! node client, and the node-side server.

pub mod client;
pub mod error;
pub mod server;
pub mod stream;

pub use client::{NodeClient, NodeConnectionInfo};
pub use error::{NetworkError, NetworkResult};
pub use server::{NodeServer, NodeServerConfig, SecurityPolicy, ServerStats};
pub use stream::TlsTimeouts;
