use std::time::Duration;

use chrono::Local;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn, Instrument, Span};

use crate::channel_selector::{select, ChannelMap, Selection, SelectionError};
use crate::derived::{derive_aggregate, PhaseValues};
use crate::energy::EnergyIntegrator;
use crate::identity::UNKNOWN_SERIAL;
use crate::meter_client::{FetchError, MeterClient};
use crate::published_state::{DataPoint, PointValues, PublishedState, StateReader};
use crate::telemetry::TelemetrySample;

/// Our own computation produced something unusable. Not a device fault.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DerivationFault {
    #[error(transparent)]
    Selection(#[from] SelectionError),
    #[error("{point} computed as non-finite value {value}")]
    NonFinite { point: DataPoint, value: f64 },
}

/// What one poll cycle did to the published state.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// New values were published
    Published,
    /// The device flagged the sample invalid; nothing changed
    Skipped { channel: usize },
    /// The fetch failed; power outputs were zeroed, energy kept
    Degraded(FetchError),
    /// Derivation failed; the last good values stand
    Faulted(DerivationFault),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollerTiming {
    pub poll_interval: Duration,
    /// `None` disables the liveness report
    pub sign_of_life: Option<Duration>,
}

/// Polls one device on a fixed timer and owns everything that device mutates.
pub struct DevicePoller {
    client: MeterClient,
    channel_map: ChannelMap,
    integrator: EnergyIntegrator,
    state: PublishedState,
    timing: PollerTiming,
    skip_logged: bool,
}

impl DevicePoller {
    pub fn new(
        client: MeterClient,
        channel_map: ChannelMap,
        integrator: EnergyIntegrator,
        state: PublishedState,
        timing: PollerTiming,
    ) -> Self {
        Self {
            client,
            channel_map,
            integrator,
            state,
            timing,
            skip_logged: false,
        }
    }

    pub fn reader(&self) -> StateReader {
        self.state.reader()
    }

    /// Runs until `shutdown` flips to true. Must be spawned inside the device's tracing span.
    ///
    /// A cycle in flight when shutdown arrives finishes first; its fetch is bounded by the
    /// request timeout.
    pub async fn run(mut self, start_delay: Duration, mut shutdown: watch::Receiver<bool>) {
        let delay = sleep(start_delay);
        tokio::pin!(delay);
        loop {
            tokio::select! {
                _ = &mut delay => break,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
        self.bootstrap_serial().await;

        let liveness = self.timing.sign_of_life.map(|every| {
            info!("Sign-of-life every {} minute(s)", every.as_secs() / 60);
            tokio::spawn(
                report_liveness(self.state.reader(), every, shutdown.clone())
                    .instrument(Span::current()),
            )
        });
        if liveness.is_none() {
            info!("Sign-of-life disabled");
        }

        let mut ticker = interval(self.timing.poll_interval);
        // A fetch slower than the period swallows the ticks it overlapped instead of bursting
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            "Registered periodic update every {} ms",
            self.timing.poll_interval.as_millis()
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.poll_once().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        if let Some(handle) = liveness {
            handle.abort();
        }
        info!("Device poller stopped");
    }

    /// Reads the device MAC once and publishes it as the serial number. On failure the
    /// serial stays `unknown` and polling goes ahead regardless.
    pub async fn bootstrap_serial(&mut self) {
        match self.client.fetch_serial().await {
            Ok(serial) => {
                info!(serial = %serial, "Read serial number from device");
                self.state.set_serial(serial);
            }
            Err(err) => {
                warn!(
                    error = %err,
                    "Could not read serial number; publishing '{UNKNOWN_SERIAL}'"
                );
            }
        }
    }

    /// One full cycle: fetch, select, derive, integrate, publish.
    pub async fn poll_once(&mut self) -> CycleOutcome {
        match self.client.fetch().await {
            Ok(sample) => {
                let outcome = self.process_sample(&sample, Instant::now());
                if let CycleOutcome::Faulted(fault) = &outcome {
                    error!(error = %fault, "Unhandled error while processing sample; keeping last values");
                }
                outcome
            }
            Err(err) => {
                error!(
                    classification = err.classification(),
                    url = %self.client.endpoint().status_url(),
                    "Error getting data from device - check network or device status. Setting power values to 0. Details: {err}"
                );
                self.state.zero_power_outputs();
                CycleOutcome::Degraded(err)
            }
        }
    }

    fn process_sample(&mut self, sample: &TelemetrySample, now: Instant) -> CycleOutcome {
        let selected = match select(sample, &self.channel_map) {
            Ok(Selection::Channels(selected)) => selected,
            Ok(Selection::Skip { channel }) => {
                if !self.skip_logged {
                    warn!("Channel {channel} reports is_valid=false; skipping update");
                    self.skip_logged = true;
                }
                return CycleOutcome::Skipped { channel };
            }
            Err(err) => return self.fault(err.into()),
        };
        self.skip_logged = false;

        let phases: Vec<PhaseValues> = selected.phases.iter().map(PhaseValues::from_reading).collect();
        let aggregate = derive_aggregate(&phases, selected.reported_total_power);

        let mut values = PointValues::new();
        values.insert(DataPoint::Power, aggregate.power);
        values.insert(DataPoint::Voltage, aggregate.voltage);
        values.insert(DataPoint::Current, aggregate.current);
        for phase in &phases {
            values.insert(DataPoint::PhaseVoltage(phase.phase), phase.voltage);
            values.insert(DataPoint::PhaseCurrent(phase.phase), phase.current);
            values.insert(DataPoint::PhasePower(phase.phase), phase.power);
        }
        // Checked before integrating so a fault leaves the energy counters untouched
        if let Err(fault) = ensure_finite(&values) {
            return self.fault(fault);
        }

        let energy = self.integrator.step(&selected.phases, now);
        let mut energy_values = PointValues::new();
        energy_values.insert(DataPoint::EnergyForward, energy.forward_kwh);
        energy_values.insert(DataPoint::EnergyReverse, energy.reverse_kwh);
        if self.channel_map.phase_count() > 1 {
            for phase in &energy.phases {
                energy_values.insert(DataPoint::PhaseEnergyForward(phase.phase), phase.forward_kwh);
                energy_values.insert(DataPoint::PhaseEnergyReverse(phase.phase), phase.reverse_kwh);
            }
        }
        if let Err(fault) = ensure_finite(&energy_values) {
            return self.fault(fault);
        }
        values.extend(energy_values);

        debug!(
            power = aggregate.power,
            voltage = aggregate.voltage,
            current = aggregate.current,
            forward_kwh = energy.forward_kwh,
            reverse_kwh = energy.reverse_kwh,
            "Publishing sample"
        );
        self.state.apply_update(values);
        CycleOutcome::Published
    }

    fn fault(&mut self, fault: DerivationFault) -> CycleOutcome {
        self.state.republish();
        CycleOutcome::Faulted(fault)
    }
}

fn ensure_finite(values: &PointValues) -> Result<(), DerivationFault> {
    match values.iter().find(|(_, value)| !value.is_finite()) {
        Some((point, value)) => Err(DerivationFault::NonFinite {
            point: *point,
            value: *value,
        }),
        None => Ok(()),
    }
}

/// Periodic diagnostic summary. Only reads the published state.
async fn report_liveness(reader: StateReader, every: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => log_sign_of_life(&reader),
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

fn log_sign_of_life(reader: &StateReader) {
    let snapshot = reader.snapshot();
    info!("--- Start: sign of life ---");
    match snapshot.last_update_at() {
        Some(at) => {
            let age = Local::now().signed_duration_since(at).num_seconds();
            info!("Last update: {} ({age}s ago)", at.format("%Y-%m-%d %H:%M:%S"));
        }
        None => info!("Last update: never"),
    }
    for point in [
        DataPoint::Power,
        DataPoint::Voltage,
        DataPoint::Current,
        DataPoint::EnergyForward,
        DataPoint::EnergyReverse,
    ] {
        let value = snapshot
            .formatted(point)
            .unwrap_or_else(|| point.unit().format(0.0));
        info!("Last '{}': {}", point, value);
    }
    info!("--- End: sign of life ---");
}
