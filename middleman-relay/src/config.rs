//! Configuration system for the middleman relay server.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/middleman/config.toml`)
//! 4. Compiled defaults

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::directory::{AddressParseError, BackendAddress};
use crate::dispatcher::DispatcherConfig;
use crate::registry::RegistryConfig;
use crate::room::RoomConfig;

/// Errors that can occur when loading relay configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),

    /// A service entry is not `NAME=HOST:PORT` or has a bad address.
    #[error("invalid service entry {entry:?}: {reason}")]
    InvalidService {
        /// The offending entry as written.
        entry: String,
        /// What was wrong with it.
        reason: String,
    },

    /// A setting is outside the range the relay can run with.
    #[error("invalid value for {key}: {reason}")]
    InvalidValue {
        /// Config key, as written in the file.
        key: &'static str,
        /// Accepted range.
        reason: &'static str,
    },
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct RelayConfigFile {
    server: ServerFileConfig,
    rooms: RoomsFileConfig,
    services: BTreeMap<String, String>,
}

/// `[server]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerFileConfig {
    bind_addr: Option<String>,
    max_pending_handshakes: Option<usize>,
    control_timeout_ms: Option<u64>,
    max_control_frame: Option<usize>,
}

/// `[rooms]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct RoomsFileConfig {
    max_rooms: Option<usize>,
    join_code_len: Option<usize>,
    poll_interval_ms: Option<u64>,
    read_chunk_size: Option<usize>,
    connect_timeout_ms: Option<u64>,
    client_write_timeout_ms: Option<u64>,
    backend_write_timeout_ms: Option<u64>,
    join_grace_ms: Option<u64>,
}

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// CLI arguments for the relay server.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Middleman room relay server")]
pub struct RelayCliArgs {
    /// Address to bind the control listener to.
    #[arg(short, long, env = "MIDDLEMAN_ADDR")]
    pub bind: Option<String>,

    /// Path to config file (default: `~/.config/middleman/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Backend service as `NAME=HOST:PORT`; may be repeated.
    #[arg(short, long = "service", value_name = "NAME=HOST:PORT")]
    pub services: Vec<String>,

    /// Maximum number of live rooms.
    #[arg(long)]
    pub max_rooms: Option<usize>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "MIDDLEMAN_LOG")]
    pub log_level: String,
}

// ---------------------------------------------------------------------------
// Resolved configuration
// ---------------------------------------------------------------------------

/// Fully resolved relay server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind the control listener to (e.g., `0.0.0.0:5000`).
    pub bind_addr: String,
    /// Control handshake limits.
    pub dispatcher: DispatcherConfig,
    /// Registry limits and per-room settings.
    pub registry: RegistryConfig,
    /// Backend services to register at startup.
    pub services: BTreeMap<String, BackendAddress>,
    /// Log level filter string.
    pub log_level: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:5000".to_string(),
            dispatcher: DispatcherConfig::default(),
            registry: RegistryConfig::default(),
            services: BTreeMap::new(),
            log_level: "info".to_string(),
        }
    }
}

impl RelayConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an error.
    /// If no `--config` is given, the default path is tried and missing file
    /// is treated as empty config.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read
    /// or parsed, or if a service entry is malformed.
    pub fn load(cli: &RelayCliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Self::resolve(cli, &file)
    }

    /// Resolve a `RelayConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default.
    fn resolve(cli: &RelayCliArgs, file: &RelayConfigFile) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let server = &file.server;
        let rooms = &file.rooms;
        let room_defaults = defaults.registry.room;

        let room = RoomConfig {
            poll_interval: millis_or(rooms.poll_interval_ms, room_defaults.poll_interval),
            read_chunk_size: rooms
                .read_chunk_size
                .unwrap_or(room_defaults.read_chunk_size),
            connect_timeout: millis_or(rooms.connect_timeout_ms, room_defaults.connect_timeout),
            client_write_timeout: millis_or(
                rooms.client_write_timeout_ms,
                room_defaults.client_write_timeout,
            ),
            backend_write_timeout: millis_or(
                rooms.backend_write_timeout_ms,
                room_defaults.backend_write_timeout,
            ),
            join_grace: millis_or(rooms.join_grace_ms, room_defaults.join_grace),
        };

        let registry = RegistryConfig {
            max_rooms: cli
                .max_rooms
                .or(rooms.max_rooms)
                .unwrap_or(defaults.registry.max_rooms),
            join_code_len: rooms
                .join_code_len
                .unwrap_or(defaults.registry.join_code_len),
            room,
        };

        let dispatcher = DispatcherConfig {
            max_control_frame: server
                .max_control_frame
                .unwrap_or(defaults.dispatcher.max_control_frame),
            control_timeout: millis_or(
                server.control_timeout_ms,
                defaults.dispatcher.control_timeout,
            ),
            max_pending_handshakes: server
                .max_pending_handshakes
                .unwrap_or(defaults.dispatcher.max_pending_handshakes),
        };

        let mut services = BTreeMap::new();
        for (name, addr) in &file.services {
            let parsed = addr
                .parse()
                .map_err(|e: AddressParseError| ConfigError::InvalidService {
                    entry: format!("{name} = {addr:?}"),
                    reason: e.to_string(),
                })?;
            services.insert(name.clone(), parsed);
        }
        for entry in &cli.services {
            let (name, addr) = parse_service_arg(entry)?;
            services.insert(name, addr);
        }

        let config = Self {
            bind_addr: cli
                .bind
                .clone()
                .or_else(|| server.bind_addr.clone())
                .unwrap_or(defaults.bind_addr),
            dispatcher,
            registry,
            services,
            log_level: cli.log_level.clone(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings that would stall or spin the relay.
    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |key| Err(ConfigError::InvalidValue {
            key,
            reason: "must be greater than zero",
        });
        let room = &self.registry.room;

        if self.registry.max_rooms == 0 {
            return invalid("max_rooms");
        }
        if self.registry.join_code_len == 0 {
            return invalid("join_code_len");
        }
        if room.poll_interval.is_zero() {
            return invalid("poll_interval_ms");
        }
        if room.read_chunk_size == 0 {
            return invalid("read_chunk_size");
        }
        if self.dispatcher.max_pending_handshakes == 0 {
            return invalid("max_pending_handshakes");
        }
        if self.dispatcher.max_control_frame == 0 {
            return invalid("max_control_frame");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

fn millis_or(value: Option<u64>, default: Duration) -> Duration {
    value.map_or(default, Duration::from_millis)
}

/// Parse a `NAME=HOST:PORT` service argument.
fn parse_service_arg(entry: &str) -> Result<(String, BackendAddress), ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidService {
        entry: entry.to_string(),
        reason,
    };
    let (name, addr) = entry
        .split_once('=')
        .ok_or_else(|| invalid("expected NAME=HOST:PORT".to_string()))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(invalid("empty service name".to_string()));
    }
    let addr = addr
        .trim()
        .parse()
        .map_err(|e: AddressParseError| invalid(e.to_string()))?;
    Ok((name.to_string(), addr))
}

/// Load and parse a TOML config file for the relay.
fn load_config_file(
    explicit_path: Option<&std::path::Path>,
) -> Result<RelayConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(RelayConfigFile::default());
        };
        config_dir.join("middleman").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(RelayConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
