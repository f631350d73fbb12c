use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_derive::Deserialize;
use thiserror::Error;
use tracing::{warn, Level};

use crate::channel_selector::ChannelMap;
use crate::energy::EnergyMode;
use crate::identity::{DeviceKind, Role};
use crate::meter_client::DeviceEndpoint;

const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 1_000;

/// Anything that stops the bridge from starting. Always fatal.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("missing [global] section in config")]
    MissingGlobal,
    #[error("at least one [devices.<name>] section is required")]
    NoDevices,
    #[error("invalid or missing device_instance for section '{section}'; please set a unique non-negative integer")]
    InvalidInstance { section: String },
    #[error("duplicate device_instance {instance} in sections '{first}' and '{second}'; ensure uniqueness")]
    DuplicateInstance {
        instance: u32,
        first: String,
        second: String,
    },
    #[error("configured role '{role}' in section '{section}' is not in the allowed list [pvinverter, grid]")]
    InvalidRole { section: String, role: String },
    #[error("section '{section}' requires host")]
    MissingHost { section: String },
    #[error("section '{section}' has unknown kind '{kind}' (expected em or 3em)")]
    InvalidKind { section: String, kind: String },
    #[error("section '{section}': {reason}")]
    InvalidEnergyMode { section: String, reason: String },
    #[error("global.{field} must be >= 1")]
    ZeroInterval { field: &'static str },
    #[error("global.modbus_listen '{value}' is not a socket address")]
    InvalidListenAddress { value: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct GlobalConfig {
    pub log_level: Level,
    /// `None` disables the liveness report
    pub sign_of_life: Option<Duration>,
    pub poll_interval: Duration,
    pub request_timeout: Duration,
    pub modbus_listen: Option<SocketAddr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceConfig {
    pub name: String,
    pub role: Role,
    pub instance: u32,
    pub endpoint: DeviceEndpoint,
    pub custom_name: String,
    pub position: u8,
    pub kind: DeviceKind,
    pub channel_map: ChannelMap,
    pub energy_mode: EnergyMode,
}

impl DeviceConfig {
    /// Log prefix, e.g. `grid_main:grid:40@192.168.0.62`
    pub fn tag(&self) -> String {
        format!(
            "{}:{}:{}@{}",
            self.name, self.role, self.instance, self.endpoint.host
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BridgeConfig {
    pub global: GlobalConfig,
    /// Sorted by section name
    pub devices: Vec<DeviceConfig>,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    global: Option<RawGlobal>,
    #[serde(default)]
    devices: BTreeMap<String, RawDevice>,
}

#[derive(Debug, Default, Deserialize)]
struct RawGlobal {
    log_level: Option<toml::Value>,
    sign_of_life_minutes: Option<toml::Value>,
    poll_interval_ms: Option<u64>,
    request_timeout_ms: Option<u64>,
    modbus_listen: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawDevice {
    role: Option<String>,
    device_instance: Option<toml::Value>,
    host: Option<String>,
    username: Option<String>,
    password: Option<String>,
    custom_name: Option<String>,
    position: Option<toml::Value>,
    kind: Option<String>,
    channel: Option<toml::Value>,
    l1_position: Option<toml::Value>,
    energy: Option<String>,
}

pub fn read_config_text(path: &Path) -> Result<String, ConfigError> {
    fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Best effort read of `global.log_level`, used to set up logging before the full validation.
pub fn log_level_from_toml(text: &str) -> Level {
    toml::from_str::<RawConfig>(text)
        .ok()
        .and_then(|raw| raw.global)
        .and_then(|global| global.log_level)
        .map(|value| parse_log_level(&value))
        .unwrap_or(Level::INFO)
}

/// Accepts level names (`debug`, `WARNING`, `critical`, ...) and numeric levels (10, 20, 30, ...).
/// Anything else is INFO.
pub fn parse_log_level(value: &toml::Value) -> Level {
    match value {
        toml::Value::Integer(number) => numeric_level(*number),
        toml::Value::String(text) => parse_level_name(text).unwrap_or(Level::INFO),
        _ => Level::INFO,
    }
}

pub fn parse_level_name(text: &str) -> Option<Level> {
    let text = text.trim();
    if let Ok(number) = text.parse::<i64>() {
        return Some(numeric_level(number));
    }
    match text.to_ascii_uppercase().as_str() {
        "TRACE" => Some(Level::TRACE),
        "DEBUG" => Some(Level::DEBUG),
        "INFO" => Some(Level::INFO),
        "WARN" | "WARNING" => Some(Level::WARN),
        "ERROR" | "CRITICAL" | "FATAL" => Some(Level::ERROR),
        _ => None,
    }
}

fn numeric_level(number: i64) -> Level {
    match number {
        i64::MIN..=5 => Level::TRACE,
        6..=10 => Level::DEBUG,
        11..=20 => Level::INFO,
        21..=30 => Level::WARN,
        _ => Level::ERROR,
    }
}

/// Integer or digit string. `Ok(None)` when absent or blank.
fn soft_int(value: Option<&toml::Value>) -> Result<Option<i64>, String> {
    match value {
        None => Ok(None),
        Some(toml::Value::Integer(number)) => Ok(Some(*number)),
        Some(toml::Value::String(text)) if text.trim().is_empty() => Ok(None),
        Some(toml::Value::String(text)) => text.trim().parse().map(Some).map_err(|_| text.clone()),
        Some(other) => Err(other.to_string()),
    }
}

fn parse_instance(section: &str, value: Option<&toml::Value>) -> Result<u32, ConfigError> {
    let invalid = || ConfigError::InvalidInstance {
        section: section.to_string(),
    };
    match value {
        Some(toml::Value::Integer(number)) => u32::try_from(*number).map_err(|_| invalid()),
        Some(toml::Value::String(text)) => {
            let text = text.trim();
            if text.is_empty() || !text.chars().all(|c| c.is_ascii_digit()) {
                return Err(invalid());
            }
            text.parse().map_err(|_| invalid())
        }
        _ => Err(invalid()),
    }
}

impl BridgeConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(text)?;
        let global = raw.global.ok_or(ConfigError::MissingGlobal)?;
        let global = Self::parse_global(global)?;

        if raw.devices.is_empty() {
            return Err(ConfigError::NoDevices);
        }

        let mut seen_instances: HashMap<u32, String> = HashMap::new();
        let mut devices = Vec::with_capacity(raw.devices.len());
        for (name, device) in raw.devices {
            let device = Self::parse_device(name, device)?;
            if let Some(first) = seen_instances.get(&device.instance) {
                return Err(ConfigError::DuplicateInstance {
                    instance: device.instance,
                    first: first.clone(),
                    second: device.name,
                });
            }
            seen_instances.insert(device.instance, device.name.clone());
            devices.push(device);
        }

        Ok(Self { global, devices })
    }

    fn parse_global(raw: RawGlobal) -> Result<GlobalConfig, ConfigError> {
        let poll_interval_ms = raw.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS);
        if poll_interval_ms == 0 {
            return Err(ConfigError::ZeroInterval {
                field: "poll_interval_ms",
            });
        }
        let request_timeout_ms = raw.request_timeout_ms.unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS);
        if request_timeout_ms == 0 {
            return Err(ConfigError::ZeroInterval {
                field: "request_timeout_ms",
            });
        }

        let sign_of_life_minutes = match soft_int(raw.sign_of_life_minutes.as_ref()) {
            Ok(minutes) => minutes.unwrap_or(0),
            Err(value) => {
                warn!("Invalid sign_of_life_minutes '{value}' in config; disabling sign-of-life");
                0
            }
        };
        let sign_of_life = u64::try_from(sign_of_life_minutes)
            .ok()
            .filter(|minutes| *minutes > 0)
            .map(|minutes| Duration::from_secs(minutes * 60));

        let modbus_listen = match raw.modbus_listen {
            Some(value) if !value.trim().is_empty() => Some(
                value
                    .trim()
                    .parse()
                    .map_err(|_| ConfigError::InvalidListenAddress { value })?,
            ),
            _ => None,
        };

        Ok(GlobalConfig {
            log_level: raw
                .log_level
                .as_ref()
                .map(parse_log_level)
                .unwrap_or(Level::INFO),
            sign_of_life,
            poll_interval: Duration::from_millis(poll_interval_ms),
            request_timeout: Duration::from_millis(request_timeout_ms),
            modbus_listen,
        })
    }

    fn parse_device(name: String, raw: RawDevice) -> Result<DeviceConfig, ConfigError> {
        let instance = parse_instance(&name, raw.device_instance.as_ref())?;

        let role_text = raw.role.unwrap_or_else(|| "grid".to_string());
        let role: Role = role_text.parse().map_err(|role| ConfigError::InvalidRole {
            section: name.clone(),
            role,
        })?;

        let host = raw.host.unwrap_or_default().trim().to_string();
        if host.is_empty() {
            return Err(ConfigError::MissingHost { section: name });
        }
        let mut endpoint = DeviceEndpoint::new(host);
        if let Some(username) = raw.username.map(|u| u.trim().to_string()).filter(|u| !u.is_empty()) {
            endpoint = endpoint.with_credentials(username, raw.password.unwrap_or_default());
        }

        let kind: DeviceKind = raw
            .kind
            .as_deref()
            .unwrap_or("em")
            .parse()
            .map_err(|kind| ConfigError::InvalidKind {
                section: name.clone(),
                kind,
            })?;

        let energy_mode: EnergyMode = raw
            .energy
            .as_deref()
            .unwrap_or("device")
            .parse()
            .map_err(|reason| ConfigError::InvalidEnergyMode {
                section: name.clone(),
                reason,
            })?;

        let channel_map = match kind {
            DeviceKind::Em => {
                let channel = soft_int(raw.channel.as_ref()).unwrap_or_else(|value| {
                    warn!("Invalid channel '{value}' in section '{name}'; defaulting to 0");
                    None
                });
                ChannelMap::single(channel.unwrap_or(0))
            }
            DeviceKind::ThreeEm => {
                let position = soft_int(raw.l1_position.as_ref()).unwrap_or_else(|value| {
                    warn!("Invalid l1_position '{value}' in section '{name}'; keeping device phase order");
                    None
                });
                ChannelMap::three_phase(position.unwrap_or(1))
            }
        };

        let position = match soft_int(raw.position.as_ref()) {
            Ok(position) => u8::try_from(position.unwrap_or(0)).unwrap_or_else(|_| {
                warn!("Invalid position in section '{name}'; defaulting to 0");
                0
            }),
            Err(value) => {
                warn!("Invalid position '{value}' in section '{name}'; defaulting to 0");
                0
            }
        };

        let custom_name = raw
            .custom_name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| kind.product_name().to_string());

        Ok(DeviceConfig {
            name,
            role,
            instance,
            endpoint,
            custom_name,
            position,
            kind,
            channel_map,
            energy_mode,
        })
    }
}
