pub mod config_gateway;

pub use config_gateway::{load_config, ConfigError, GatewayConfig};
