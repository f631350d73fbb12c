//! Values the Shelly does not report directly.

use crate::channel_selector::PhaseReading;
use crate::telemetry::Phase;

/// RMS current from active power (W), reactive power (var) and voltage (V).
///
/// Uses the apparent power `S = sqrt(P² + Q²)` so a power factor near zero never divides by
/// zero, then `I = S / V`. Returns `0.0` when the voltage is not positive or any input is not
/// finite.
pub fn derive_current(active_power: f64, reactive_power: f64, voltage: f64) -> f64 {
    if !active_power.is_finite() || !reactive_power.is_finite() || !voltage.is_finite() {
        return 0.0;
    }
    if voltage <= 0.0 {
        return 0.0;
    }
    active_power.hypot(reactive_power) / voltage
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseValues {
    pub phase: Phase,
    pub voltage: f64,
    pub current: f64,
    pub power: f64,
}

impl PhaseValues {
    /// Prefers a device reported current, derives it otherwise.
    pub fn from_reading(phase_reading: &PhaseReading) -> Self {
        let reading = &phase_reading.reading;
        let current = match reading.current {
            Some(current) if current.is_finite() => current,
            _ => derive_current(reading.active_power, reading.reactive_power, reading.voltage),
        };
        Self {
            phase: phase_reading.phase,
            voltage: reading.voltage,
            current,
            power: reading.active_power,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Aggregate {
    pub voltage: f64,
    pub current: f64,
    pub power: f64,
}

/// Device level totals. The supply is symmetric, so the aggregate voltage is the L1 voltage.
pub fn derive_aggregate(phases: &[PhaseValues], reported_total_power: Option<f64>) -> Aggregate {
    let voltage = phases
        .iter()
        .find(|values| values.phase == Phase::L1)
        .map(|values| values.voltage)
        .unwrap_or_default();
    let current: f64 = phases.iter().map(|values| values.current).sum();
    let power = reported_total_power.unwrap_or_else(|| phases.iter().map(|values| values.power).sum());
    Aggregate {
        voltage,
        current,
        power,
    }
}
