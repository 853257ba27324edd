pub mod config;
pub mod error;
pub mod types;

pub use config::{
    AssociatorConfig, BusConfig, Config, MoverConfig, SaslConfig, SaslMechanism, StoreConfig, Topics,
};
pub use error::ConfigError;
pub use types::*;
