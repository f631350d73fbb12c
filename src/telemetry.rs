use serde_derive::Deserialize;
use serde_json::Value;

/// One measured leg of the circuit as published on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    L1,
    L2,
    L3,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::L1, Phase::L2, Phase::L3];

    /// Zero based slot of this phase
    pub fn index(self) -> usize {
        match self {
            Phase::L1 => 0,
            Phase::L2 => 1,
            Phase::L3 => 2,
        }
    }

    pub fn from_index(index: usize) -> Option<Phase> {
        Phase::ALL.get(index).copied()
    }

    pub fn label(self) -> &'static str {
        match self {
            Phase::L1 => "L1",
            Phase::L2 => "L2",
            Phase::L3 => "L3",
        }
    }
}

/// A single entry of the `emeters` array of a Shelly status document.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelReading {
    pub voltage: f64,
    pub active_power: f64,
    pub reactive_power: f64,
    /// Only the 3EM family reports current directly
    pub current: Option<f64>,
    /// Cumulative forward energy in Wh
    pub total_wh: Option<f64>,
    /// Cumulative reverse energy in Wh
    pub total_returned_wh: Option<f64>,
    pub valid: bool,
}

impl Default for ChannelReading {
    fn default() -> Self {
        Self {
            voltage: 0.0,
            active_power: 0.0,
            reactive_power: 0.0,
            current: None,
            total_wh: None,
            total_returned_wh: None,
            valid: true,
        }
    }
}

/// One fetch result. Lives for a single poll cycle.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TelemetrySample {
    pub channels: Vec<ChannelReading>,
    /// Device computed sum over all channels (3EM only)
    pub total_power: Option<f64>,
    pub mac: Option<String>,
}

// Shelly sends `null` for some fields on older firmware, so every field is optional on the wire.
#[derive(Debug, Deserialize)]
struct RawStatus {
    #[serde(default)]
    emeters: Option<Vec<RawChannel>>,
    #[serde(default)]
    total_power: Option<f64>,
    #[serde(default)]
    mac: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawChannel {
    #[serde(default)]
    voltage: Option<f64>,
    #[serde(default)]
    power: Option<f64>,
    #[serde(default)]
    reactive: Option<f64>,
    #[serde(default)]
    current: Option<f64>,
    #[serde(default)]
    total: Option<f64>,
    #[serde(default)]
    total_returned: Option<f64>,
    #[serde(default)]
    is_valid: Option<bool>,
}

impl From<RawChannel> for ChannelReading {
    fn from(raw: RawChannel) -> Self {
        Self {
            voltage: raw.voltage.unwrap_or_default(),
            active_power: raw.power.unwrap_or_default(),
            reactive_power: raw.reactive.unwrap_or_default(),
            current: raw.current,
            total_wh: raw.total,
            total_returned_wh: raw.total_returned,
            valid: raw.is_valid.unwrap_or(true),
        }
    }
}

impl TelemetrySample {
    /// Decodes a status document that has already been checked to be a JSON object.
    /// A missing `emeters` array decodes to an empty channel list.
    pub fn from_json(document: Value) -> Result<Self, serde_json::Error> {
        let raw: RawStatus = serde_json::from_value(document)?;
        Ok(Self {
            channels: raw
                .emeters
                .unwrap_or_default()
                .into_iter()
                .map(ChannelReading::from)
                .collect(),
            total_power: raw.total_power,
            mac: raw.mac.filter(|mac| !mac.trim().is_empty()),
        })
    }
}
