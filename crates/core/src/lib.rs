// Marketpost Core - Domain Logic & Ports
// NO infrastructure dependencies: storage and HTTP live behind ports

pub mod application;
pub mod domain;
pub mod error;
pub mod port;

pub use error::{AppError, ExternalError, Result};
