use thiserror::Error;
use tracing::warn;

use crate::telemetry::{ChannelReading, Phase, TelemetrySample};

/// Which raw channel(s) of a device feed which published phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelMap {
    /// Shelly EM: one of the two clamps is published as L1
    Single { channel: usize },
    /// Shelly 3EM: `l1_position` (1..=3) is swapped into slot 0, `None` keeps the device order
    ThreePhase { l1_position: Option<usize> },
}

impl ChannelMap {
    /// Any channel other than 0 or 1 falls back to 0.
    pub fn single(configured: i64) -> Self {
        let channel = match configured {
            0 | 1 => configured as usize,
            other => {
                warn!("Invalid channel '{other}' in config; defaulting to 0");
                0
            }
        };
        ChannelMap::Single { channel }
    }

    /// Any L1 position outside 1..=3 disables the remap.
    pub fn three_phase(configured: i64) -> Self {
        let l1_position = match configured {
            1 => None,
            2 | 3 => Some(configured as usize),
            other => {
                warn!("Invalid l1_position '{other}' in config; keeping device phase order");
                None
            }
        };
        ChannelMap::ThreePhase { l1_position }
    }

    /// Minimum `emeters` length for a sample to be usable. A three phase meter needs every
    /// phase so the totals always match the published phases.
    pub fn required_channels(&self) -> usize {
        match self {
            ChannelMap::Single { channel } => channel + 1,
            ChannelMap::ThreePhase { .. } => Phase::ALL.len(),
        }
    }

    /// Channel index that feeds the startup jitter
    pub fn primary_channel(&self) -> usize {
        match self {
            ChannelMap::Single { channel } => *channel,
            ChannelMap::ThreePhase { .. } => 0,
        }
    }

    pub fn phase_count(&self) -> usize {
        match self {
            ChannelMap::Single { .. } => 1,
            ChannelMap::ThreePhase { .. } => 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PhaseReading {
    pub phase: Phase,
    pub reading: ChannelReading,
}

/// The channels one logical device publishes, already mapped onto phases.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectedChannels {
    pub phases: Vec<PhaseReading>,
    pub reported_total_power: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    Channels(SelectedChannels),
    /// The device flagged this channel's sample as unusable
    Skip { channel: usize },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SelectionError {
    #[error("status has no emeters[{index}]")]
    MissingChannel { index: usize },
}

/// Swaps the configured L1 position into slot 0. Samples with fewer than three channels are
/// returned unchanged.
pub fn apply_l1_remap(channels: &[ChannelReading], l1_position: Option<usize>) -> Vec<ChannelReading> {
    let mut remapped = channels.to_vec();
    if let Some(position @ 2..=3) = l1_position {
        if remapped.len() >= 3 {
            remapped.swap(0, position - 1);
        }
    }
    remapped
}

pub fn select(sample: &TelemetrySample, map: &ChannelMap) -> Result<Selection, SelectionError> {
    match *map {
        ChannelMap::Single { channel } => {
            let reading = sample
                .channels
                .get(channel)
                .ok_or(SelectionError::MissingChannel { index: channel })?;
            if !reading.valid {
                return Ok(Selection::Skip { channel });
            }
            Ok(Selection::Channels(SelectedChannels {
                phases: vec![PhaseReading {
                    phase: Phase::L1,
                    reading: reading.clone(),
                }],
                // A single clamp's power is the device total for this logical meter
                reported_total_power: None,
            }))
        }
        ChannelMap::ThreePhase { l1_position } => {
            let remapped = apply_l1_remap(&sample.channels, l1_position);
            let mut phases = Vec::with_capacity(3);
            for (index, reading) in remapped.into_iter().take(3).enumerate() {
                if !reading.valid {
                    return Ok(Selection::Skip { channel: index });
                }
                if let Some(phase) = Phase::from_index(index) {
                    phases.push(PhaseReading { phase, reading });
                }
            }
            Ok(Selection::Channels(SelectedChannels {
                phases,
                reported_total_power: sample.total_power,
            }))
        }
    }
}
