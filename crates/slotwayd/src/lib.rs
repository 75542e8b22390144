//! slotwayd internals: configuration, daemon assembly and the operator client.

pub mod app;
pub mod client;
pub mod config;

pub use app::Daemon;
pub use client::Client;
pub use config::SlotwayConfig;
