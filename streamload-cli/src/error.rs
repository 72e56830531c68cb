//! CLI error handling with user-friendly messages.

use std::fmt;
use std::process;
use streamload::config::ConfigFileError;
use streamload::error::LoadError;

/// CLI-specific errors.
#[derive(Debug)]
pub enum CliError {
    /// Failed to initialize logging
    LoggingInit(String),
    /// Configuration could not be loaded or is invalid
    Config(String),
    /// A `--stream` argument could not be parsed
    InvalidStream(String),
    /// Reading input failed before the engine saw it
    Input(std::io::Error),
    /// The engine run failed
    Load(LoadError),
}

impl CliError {
    /// Exit the process with an error message and code.
    pub fn exit(&self) -> ! {
        eprintln!("Error: {}", self);

        match self {
            CliError::InvalidStream(_) => {
                eprintln!();
                eprintln!("Streams are given as 'name' or 'namespace.name', e.g. --stream public.users");
            }
            CliError::Load(LoadError::UnknownStream(_)) => {
                eprintln!();
                eprintln!("Every stream present in the input must be passed with --stream.");
            }
            _ => {}
        }

        process::exit(1)
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::LoggingInit(msg) => write!(f, "Failed to initialize logging: {}", msg),
            CliError::Config(msg) => write!(f, "Configuration error: {}", msg),
            CliError::InvalidStream(msg) => write!(f, "Invalid stream: {}", msg),
            CliError::Input(e) => write!(f, "Failed to read input: {}", e),
            CliError::Load(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for CliError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CliError::Input(e) => Some(e),
            CliError::Load(e) => Some(e),
            _ => None,
        }
    }
}

impl From<LoadError> for CliError {
    fn from(e: LoadError) -> Self {
        match e {
            LoadError::Config(msg) => CliError::Config(msg),
            other => CliError::Load(other),
        }
    }
}

impl From<ConfigFileError> for CliError {
    fn from(e: ConfigFileError) -> Self {
        CliError::Config(e.to_string())
    }
}
