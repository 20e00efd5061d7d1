pub mod cache;
pub mod events;
pub mod http;
pub mod origin;
pub mod tunnel;
pub mod worker;

use std::fs;
use std::io;
use std::path::Path;
use std::sync::Once;

use serde::Deserialize;
use structured_logger::json::new_writer;

pub fn init_logging() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        structured_logger::Builder::with_level("INFO")
            .with_target_writer("cacheproxy*", new_writer(io::stderr()))
            .init();
    });
}

pub fn load_config(path: impl AsRef<Path>) -> Result<Config, Box<dyn std::error::Error>> {
    let config_str = fs::read_to_string(&path)?;
    let config: Config = serde_yaml::from_str(&config_str)?;
    Ok(config)
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    #[serde(default = "default_event_log")]
    pub event_log: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen: default_listen(),
            backlog: default_backlog(),
            cache_capacity: default_cache_capacity(),
            event_log: default_event_log(),
        }
    }
}

fn default_listen() -> String {
    "[::]:5555".to_string()
}

fn default_backlog() -> u32 {
    100
}

fn default_cache_capacity() -> usize {
    500
}

fn default_event_log() -> String {
    "proxy.log".to_string()
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    IO(
        #[source]
        #[from]
        io::Error,
    ),

    #[error("malformed request line")]
    InvalidRequest,

    #[error("invalid port in request target: {0}")]
    InvalidPort(String),

    #[error("unknown HTTP request method: {0}")]
    UnsupportedMethod(String),

    #[error("malformed status line")]
    InvalidStatusLine,

    #[error("response header too large")]
    HeaderTooLarge,

    #[error("invalid chunk length")]
    InvalidChunkLength,

    #[error("origin closed before completing the response")]
    TruncatedResponse,
}
