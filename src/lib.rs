pub mod client;
pub mod commands;
pub mod config;
pub mod error;
pub mod logging;
pub mod mrtr;
pub mod protocol;
pub mod server;
pub mod state;
pub mod tasks;
pub mod tools;
pub mod transport;
pub mod types;
