//! `config` command: prints the effective configuration as INI.

use std::path::Path;

use crate::error::CliError;
use crate::runner::load_config;

/// Prints the configuration that `run` would use.
pub fn run(config_path: Option<&Path>) -> Result<(), CliError> {
    let config = load_config(config_path)?;
    print!("{}", config.to_config_string());
    Ok(())
}
