//! JSON-RPC dispatch for the round-trip engines.

pub mod handler;

pub use handler::RequestHandler;
