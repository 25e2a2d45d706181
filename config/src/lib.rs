pub mod config;
pub mod defaults;
pub mod settings;

pub use config::{DEFAULT_CONFIG_FILENAME, ENV_CONFIG_KEY, config_file_path, load_toml_settings};
pub use defaults::*;
pub use settings::{LeaseqSettings, WorkerSettings};
