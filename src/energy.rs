use std::str::FromStr;
use std::time::Duration;

use tokio::time::Instant;

use crate::channel_selector::PhaseReading;
use crate::telemetry::Phase;

const WATT_SECONDS_PER_KWH: f64 = 3_600_000.0;
const WATT_HOURS_PER_KWH: f64 = 1_000.0;

/// Where cumulative energy comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnergyMode {
    /// The device's own `total`/`total_returned` counters are authoritative
    PassThrough,
    /// Instantaneous power is integrated locally over elapsed time
    Integrate,
}

impl FromStr for EnergyMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "device" | "passthrough" | "pass-through" => Ok(EnergyMode::PassThrough),
            "integrate" => Ok(EnergyMode::Integrate),
            other => Err(format!("unknown energy mode '{other}' (expected device or integrate)")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Reverse,
}

/// One cumulative counter. `kwh` never decreases while integrating.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct EnergyCounterState {
    pub kwh: f64,
    pub last_observed_at: Option<Instant>,
}

/// Adds `power * dt` to the counter for one direction.
///
/// `dt` is the time since the counter was last observed, but never less than
/// `fallback_interval`: a first sample or a clock that did not advance integrates one nominal poll
/// period instead. Forward counts positive power, reverse counts negative power, so the
/// increment is always `>= 0`.
pub fn integrate(
    direction: Direction,
    power_watts: f64,
    now: Instant,
    prior: EnergyCounterState,
    fallback_interval: Duration,
) -> (f64, EnergyCounterState) {
    let elapsed = prior
        .last_observed_at
        .map(|at| now.saturating_duration_since(at))
        .unwrap_or_default();
    let dt = elapsed.max(fallback_interval).as_secs_f64();

    let directed_power = match direction {
        Direction::Forward => power_watts,
        Direction::Reverse => -power_watts,
    };
    let increment = if directed_power.is_finite() {
        directed_power.max(0.0) * dt / WATT_SECONDS_PER_KWH
    } else {
        0.0
    };

    let state = EnergyCounterState {
        kwh: prior.kwh + increment,
        last_observed_at: Some(now),
    };
    (state.kwh, state)
}

/// Takes over the device counter (Wh). A missing or unusable counter keeps the prior value.
pub fn pass_through(
    counter_wh: Option<f64>,
    now: Instant,
    prior: EnergyCounterState,
) -> (f64, EnergyCounterState) {
    let kwh = counter_wh
        .filter(|wh| wh.is_finite() && *wh >= 0.0)
        .map(|wh| wh / WATT_HOURS_PER_KWH)
        .unwrap_or(prior.kwh);
    let state = EnergyCounterState {
        kwh,
        last_observed_at: Some(now),
    };
    (state.kwh, state)
}

#[derive(Debug, Clone, Copy, Default)]
struct PhaseCounters {
    forward: EnergyCounterState,
    reverse: EnergyCounterState,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseEnergy {
    pub phase: Phase,
    pub forward_kwh: f64,
    pub reverse_kwh: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnergyTotals {
    /// Counters for the phases present in this step
    pub phases: Vec<PhaseEnergy>,
    /// Sum over every phase counter, including phases missing from this step
    pub forward_kwh: f64,
    pub reverse_kwh: f64,
}

/// Per-device energy bookkeeping. Lives inside the device's poller and nowhere else.
#[derive(Debug, Clone)]
pub struct EnergyIntegrator {
    mode: EnergyMode,
    fallback_interval: Duration,
    counters: [PhaseCounters; 3],
}

impl EnergyIntegrator {
    pub fn new(mode: EnergyMode, fallback_interval: Duration) -> Self {
        Self {
            mode,
            fallback_interval,
            counters: [PhaseCounters::default(); 3],
        }
    }

    /// Advances every phase counter present in `phases` to `now`.
    pub fn step(&mut self, phases: &[PhaseReading], now: Instant) -> EnergyTotals {
        let mut stepped = Vec::with_capacity(phases.len());
        for phase_reading in phases {
            let reading = &phase_reading.reading;
            let counters = &mut self.counters[phase_reading.phase.index()];
            let (forward_kwh, reverse_kwh) = match self.mode {
                EnergyMode::PassThrough => {
                    let (forward_kwh, forward) = pass_through(reading.total_wh, now, counters.forward);
                    let (reverse_kwh, reverse) =
                        pass_through(reading.total_returned_wh, now, counters.reverse);
                    counters.forward = forward;
                    counters.reverse = reverse;
                    (forward_kwh, reverse_kwh)
                }
                EnergyMode::Integrate => {
                    let (forward_kwh, forward) = integrate(
                        Direction::Forward,
                        reading.active_power,
                        now,
                        counters.forward,
                        self.fallback_interval,
                    );
                    let (reverse_kwh, reverse) = integrate(
                        Direction::Reverse,
                        reading.active_power,
                        now,
                        counters.reverse,
                        self.fallback_interval,
                    );
                    counters.forward = forward;
                    counters.reverse = reverse;
                    (forward_kwh, reverse_kwh)
                }
            };
            stepped.push(PhaseEnergy {
                phase: phase_reading.phase,
                forward_kwh,
                reverse_kwh,
            });
        }

        EnergyTotals {
            phases: stepped,
            forward_kwh: self.counters.iter().map(|c| c.forward.kwh).sum(),
            reverse_kwh: self.counters.iter().map(|c| c.reverse.kwh).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::ChannelReading;

    const POLL: Duration = Duration::from_millis(500);

    fn phase_reading(phase: Phase, power: f64) -> PhaseReading {
        PhaseReading {
            phase,
            reading: ChannelReading {
                voltage: 230.0,
                active_power: power,
                ..ChannelReading::default()
            },
        }
    }

    #[test]
    fn test_half_hour_at_one_kilowatt() {
        let start = Instant::now();
        let prior = EnergyCounterState {
            kwh: 0.0,
            last_observed_at: Some(start),
        };
        let later = start + Duration::from_secs(1800);

        let (forward, state) = integrate(Direction::Forward, 1000.0, later, prior, POLL);
        assert_eq!(forward, 0.5);
        assert_eq!(state.last_observed_at, Some(later));

        let (reverse, _) = integrate(Direction::Reverse, 1000.0, later, prior, POLL);
        assert_eq!(reverse, 0.0);
    }

    #[test]
    fn test_negative_power_counts_reverse_only() {
        let start = Instant::now();
        let prior = EnergyCounterState {
            kwh: 2.0,
            last_observed_at: Some(start),
        };
        let later = start + Duration::from_secs(3600);

        let (forward, _) = integrate(Direction::Forward, -500.0, later, prior, POLL);
        let (reverse, _) = integrate(Direction::Reverse, -500.0, later, prior, POLL);
        assert_eq!(forward, 2.0);
        assert_eq!(reverse, 2.5);
    }

    #[test]
    fn test_clock_going_backwards_uses_fallback_interval() {
        let now = Instant::now();
        let prior = EnergyCounterState {
            kwh: 1.0,
            last_observed_at: Some(now + Duration::from_secs(60)),
        };
        let (kwh, state) = integrate(Direction::Forward, 3600.0, now, prior, POLL);
        // 3600 W for 0.5 s is 0.0005 kWh
        assert!((kwh - 1.0005).abs() < 1e-12);
        assert!(kwh >= prior.kwh);
        assert_eq!(state.last_observed_at, Some(now));
    }

    #[test]
    fn test_zero_elapsed_uses_fallback_interval() {
        let now = Instant::now();
        let prior = EnergyCounterState {
            kwh: 0.0,
            last_observed_at: Some(now),
        };
        let (kwh, _) = integrate(Direction::Forward, 7200.0, now, prior, POLL);
        assert!((kwh - 0.001).abs() < 1e-12);
    }

    #[test]
    fn test_non_finite_power_adds_nothing() {
        let now = Instant::now();
        let prior = EnergyCounterState {
            kwh: 4.0,
            last_observed_at: None,
        };
        let (kwh, state) = integrate(Direction::Forward, f64::NAN, now, prior, POLL);
        assert_eq!(kwh, 4.0);
        assert_eq!(state.last_observed_at, Some(now));
    }

    #[test]
    fn test_pass_through_converts_wh() {
        let now = Instant::now();
        let (kwh, state) = pass_through(Some(123456.0), now, EnergyCounterState::default());
        assert_eq!(kwh, 123.456);
        assert_eq!(state.kwh, 123.456);
    }

    #[test]
    fn test_pass_through_missing_counter_keeps_prior() {
        let prior = EnergyCounterState {
            kwh: 9.0,
            last_observed_at: None,
        };
        let (kwh, _) = pass_through(None, Instant::now(), prior);
        assert_eq!(kwh, 9.0);
    }

    #[test]
    fn test_integrator_sums_phases() {
        let start = Instant::now();
        let mut integrator = EnergyIntegrator::new(EnergyMode::Integrate, Duration::from_secs(3600));
        let phases = [
            phase_reading(Phase::L1, 1000.0),
            phase_reading(Phase::L2, 500.0),
            phase_reading(Phase::L3, -250.0),
        ];

        let totals = integrator.step(&phases, start);
        assert_eq!(totals.phases.len(), 3);
        assert_eq!(totals.phases[0].forward_kwh, 1.0);
        assert_eq!(totals.phases[2].reverse_kwh, 0.25);
        assert_eq!(totals.forward_kwh, 1.5);
        assert_eq!(totals.reverse_kwh, 0.25);

        // A phase missing from the next step keeps contributing its counter to the total
        let totals = integrator.step(&phases[..1], start + Duration::from_secs(3600));
        assert_eq!(totals.phases.len(), 1);
        assert_eq!(totals.forward_kwh, 2.5);
        assert_eq!(totals.reverse_kwh, 0.25);
    }

    #[test]
    fn test_integrator_pass_through_mode() {
        let mut integrator = EnergyIntegrator::new(EnergyMode::PassThrough, POLL);
        let mut reading = phase_reading(Phase::L1, 1500.0);
        reading.reading.total_wh = Some(123456.0);
        reading.reading.total_returned_wh = Some(1000.0);

        let totals = integrator.step(&[reading], Instant::now());
        assert_eq!(totals.forward_kwh, 123.456);
        assert_eq!(totals.reverse_kwh, 1.0);
    }

    #[test]
    fn test_energy_mode_parsing() {
        assert_eq!("device".parse(), Ok(EnergyMode::PassThrough));
        assert_eq!(" Integrate ".parse(), Ok(EnergyMode::Integrate));
        assert!("trapezoid".parse::<EnergyMode>().is_err());
    }
}
