//! Configuration model, loader and validation for evdev_transformer.
//!
//! Parses the JSON configuration file into a validated [`Config`] tree:
//! sources, source groups, destinations and the links between them.

mod error;
mod key_codes;
mod loader;
mod model;

pub use error::ConfigError;
pub use key_codes::parse_key_name;
pub use loader::{config_path, load_config, parse_config};
pub use model::*;
