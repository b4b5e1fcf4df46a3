//! Transports that feed JSON-RPC messages into a [`RequestHandler`](crate::server::RequestHandler).

pub mod stdio;

pub use stdio::StdioServer;
