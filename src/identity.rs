use std::fmt;
use std::str::FromStr;

pub const PRODUCT_ID_PVINVERTER: u16 = 0xA144;
pub const PRODUCT_ID_GRID: u16 = 45069;
/// ET340 energy meter
pub const DEVICE_TYPE_ET340: u16 = 345;
pub const FIRMWARE_VERSION: &str = "0.3";
pub const HARDWARE_VERSION: u16 = 0;
pub const UNKNOWN_SERIAL: &str = "unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    PvInverter,
    Grid,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::PvInverter => "pvinverter",
            Role::Grid => "grid",
        }
    }

    pub fn product_id(self) -> u16 {
        match self {
            Role::PvInverter => PRODUCT_ID_PVINVERTER,
            Role::Grid => PRODUCT_ID_GRID,
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pvinverter" => Ok(Role::PvInverter),
            "grid" => Ok(Role::Grid),
            other => Err(other.to_string()),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hardware family, decides how many channels make up one logical meter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    /// Shelly EM, two independent single phase clamps
    Em,
    /// Shelly 3EM, one three phase meter
    ThreeEm,
}

impl DeviceKind {
    pub fn product_name(self) -> &'static str {
        match self {
            DeviceKind::Em => "Shelly EM",
            DeviceKind::ThreeEm => "Shelly 3EM",
        }
    }
}

impl FromStr for DeviceKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "em" => Ok(DeviceKind::Em),
            "3em" => Ok(DeviceKind::ThreeEm),
            other => Err(other.to_string()),
        }
    }
}

/// Fixed identity block published alongside the measurements.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceIdentity {
    pub role: Role,
    pub instance: u32,
    pub custom_name: String,
    pub serial: String,
    pub position: u8,
    pub kind: DeviceKind,
}

impl DeviceIdentity {
    pub fn product_id(&self) -> u16 {
        self.role.product_id()
    }

    pub fn product_name(&self) -> &'static str {
        self.kind.product_name()
    }

    pub fn device_type(&self) -> u16 {
        DEVICE_TYPE_ET340
    }

    /// Bus service name, e.g. `com.victronenergy.grid.http_40`
    pub fn service_name(&self) -> String {
        format!("com.victronenergy.{}.http_{:02}", self.role, self.instance)
    }
}
