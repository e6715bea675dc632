//! Marketpost daemon building blocks, shared with the CLI

pub mod config;
pub mod logging;
pub mod publisher;

pub use config::Settings;
pub use publisher::ApiPublisher;
