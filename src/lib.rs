pub mod billing;
pub mod config;
pub mod db;
pub mod error;
pub mod messaging;
pub mod telemetry;

pub use config::{engine_config_from_env, EngineConfig};
pub use error::{AppError, BillingError, BillingResult, Disposition};
