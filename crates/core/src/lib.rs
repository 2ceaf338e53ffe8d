pub mod config;
pub mod error;
pub mod event_bus;
pub mod loyalty;

pub use config::AppConfig;
pub use error::{LoyaltyError, LoyaltyResult};
