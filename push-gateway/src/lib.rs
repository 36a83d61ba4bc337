pub mod config;
pub mod dispatch;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod models;
pub mod providers;
pub mod store;

pub use config::Config;
pub use dispatch::PushGateway;
pub use error::{GatewayError, Result};
