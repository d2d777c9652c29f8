use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::pty::SpawnCommand;

/// Default address for both `serve` and `attach`.
pub const DEFAULT_ADDR: &str = "127.0.0.1:8080";

/// Top-level config, loaded from TOML. Every key is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerSection,
    pub client: ClientSection,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// Address to bind the HTTP/WebSocket server.
    pub bind: Option<SocketAddr>,
    /// Shell spawned for each connection.
    pub shell: Option<String>,
    /// Working directory of the shell; a leading `~` is the home directory.
    pub working_dir: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSection {
    /// `host:port` of the server to attach to.
    pub address: Option<String>,
    /// Render remote output only, never send local input.
    pub receive_only: bool,
}

impl Config {
    /// Load config from a TOML file path. Returns None if file doesn't exist.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        Ok(Some(config))
    }

    /// Load from `path`, or from [`default_config_path`] when none is given.
    /// A missing file yields the default config.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match default_config_path() {
                Some(path) => path,
                None => return Ok(Self::default()),
            },
        };
        Ok(Self::load(&path)?.unwrap_or_default())
    }

    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        match self.server.bind {
            Some(addr) => Ok(addr),
            None => DEFAULT_ADDR
                .parse()
                .map_err(|_| ConfigError::InvalidValue("server.bind", DEFAULT_ADDR.to_string())),
        }
    }

    pub fn client_address(&self) -> &str {
        self.client.address.as_deref().unwrap_or(DEFAULT_ADDR)
    }

    /// Command to spawn per connection, with the working directory expanded.
    pub fn spawn_command(&self) -> Result<SpawnCommand, ConfigError> {
        let cwd = self
            .server
            .working_dir
            .as_deref()
            .map(expand_home)
            .transpose()?;
        Ok(SpawnCommand {
            shell: self.server.shell.clone(),
            cwd,
        })
    }
}

/// `$XDG_CONFIG_HOME/wsterm/config.toml` (or the platform equivalent).
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("wsterm").join("config.toml"))
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_home(path: &str) -> Result<PathBuf, ConfigError> {
    let rest = if path == "~" {
        ""
    } else if let Some(rest) = path.strip_prefix("~/") {
        rest
    } else {
        return Ok(PathBuf::from(path));
    };
    let home = dirs::home_dir().ok_or(ConfigError::NoHomeDir)?;
    Ok(if rest.is_empty() { home } else { home.join(rest) })
}

/// Errors that can occur when loading config.
#[derive(Debug)]
pub enum ConfigError {
    ReadFailed(PathBuf, std::io::Error),
    ParseFailed(PathBuf, toml::de::Error),
    InvalidValue(&'static str, String),
    NoHomeDir,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadFailed(path, e) => {
                write!(f, "Failed to read config {}: {}", path.display(), e)
            }
            Self::ParseFailed(path, e) => {
                write!(f, "Failed to parse config {}: {}", path.display(), e)
            }
            Self::InvalidValue(key, value) => write!(f, "Invalid value for {}: {}", key, value),
            Self::NoHomeDir => write!(f, "Cannot expand '~': home directory is unknown"),
        }
    }
}

impl std::error::Error for ConfigError {}
