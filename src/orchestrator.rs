use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tokio::task::{Id, JoinError, JoinSet};
use tokio::time::timeout;
use tracing::{error, info, info_span, warn, Instrument};

use crate::config::{BridgeConfig, DeviceConfig, GlobalConfig};
use crate::device_poller::{DevicePoller, PollerTiming};
use crate::energy::EnergyIntegrator;
use crate::identity::{DeviceIdentity, UNKNOWN_SERIAL};
use crate::meter_client::MeterClient;
use crate::published_state::{PublishedState, StateReader};

const MIN_JITTER: Duration = Duration::from_millis(50);

/// Deterministic start offset so devices sharing a poll period do not fire together.
pub fn startup_jitter(instance: u32, channel: usize, poll_interval: Duration) -> Duration {
    let period_ms = u64::try_from(poll_interval.as_millis()).unwrap_or(u64::MAX).max(1);
    let offset = (u64::from(instance) * 53 + channel as u64 * 17) % period_ms;
    if offset == 0 {
        MIN_JITTER
    } else {
        Duration::from_millis(offset)
    }
}

/// Owns every device poller task. Nothing is shared between pollers; the orchestrator only
/// starts them, watches them exit and stops them.
pub struct Orchestrator {
    pollers: JoinSet<()>,
    tags: HashMap<Id, String>,
    readers: Vec<StateReader>,
    shutdown_tx: watch::Sender<bool>,
    grace: Duration,
}

impl Orchestrator {
    /// Builds one poller per configured device and spawns it. Fails only if an HTTP client
    /// cannot be constructed; unreachable devices still get a poller. Must be called inside a
    /// tokio runtime.
    pub fn start(config: &BridgeConfig) -> anyhow::Result<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut pollers = JoinSet::new();
        let mut tags = HashMap::new();
        let mut readers = Vec::with_capacity(config.devices.len());

        for device in &config.devices {
            let tag = device.tag();
            let span = info_span!("device", tag = %tag);
            let poller = span
                .in_scope(|| build_poller(device, &config.global))
                .with_context(|| format!("failed to set up device {tag}"))?;
            readers.push(poller.reader());

            let delay = startup_jitter(
                device.instance,
                device.channel_map.primary_channel(),
                config.global.poll_interval,
            );
            let handle = pollers.spawn(poller.run(delay, shutdown_rx.clone()).instrument(span));
            tags.insert(handle.id(), tag);
        }
        info!("Started {} device poller(s)", readers.len());

        Ok(Self {
            pollers,
            tags,
            readers,
            shutdown_tx,
            grace: config.global.request_timeout * 2 + config.global.poll_interval,
        })
    }

    /// Read handles ordered by device section name, not by position in the file.
    pub fn readers(&self) -> &[StateReader] {
        &self.readers
    }

    /// Supervises the pollers until `signal` resolves. A poller that exits or panics is logged
    /// and not restarted; the others keep running.
    pub async fn run_until<F>(&mut self, signal: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(signal);
        loop {
            tokio::select! {
                _ = &mut signal => {
                    info!("Shutdown requested");
                    return;
                }
                joined = self.pollers.join_next_with_id() => {
                    match joined {
                        Some(joined) => log_exit(&self.tags, joined),
                        None => {
                            warn!("No device pollers left running");
                            signal.await;
                            info!("Shutdown requested");
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Signals every poller to stop, waits out the grace period, then aborts stragglers.
    pub async fn shutdown(self) {
        let Self {
            mut pollers,
            tags,
            shutdown_tx,
            grace,
            ..
        } = self;

        let _ = shutdown_tx.send(true);
        let drained = timeout(grace, async {
            while let Some(joined) = pollers.join_next_with_id().await {
                log_exit(&tags, joined);
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                "Device pollers still running after {} ms; aborting",
                grace.as_millis()
            );
            pollers.abort_all();
            while pollers.join_next().await.is_some() {}
        }
        info!("All device pollers stopped");
    }
}

/// Everything a device owns, assembled before its task starts. The serial number is read
/// later from inside the task.
fn build_poller(device: &DeviceConfig, global: &GlobalConfig) -> Result<DevicePoller, reqwest::Error> {
    let client = MeterClient::new(
        device.endpoint.clone(),
        global.request_timeout,
        device.channel_map.required_channels(),
    )?;

    let identity = DeviceIdentity {
        role: device.role,
        instance: device.instance,
        custom_name: device.custom_name.clone(),
        serial: UNKNOWN_SERIAL.to_string(),
        position: device.position,
        kind: device.kind,
    };
    info!(
        service = %identity.service_name(),
        product = identity.product_name(),
        energy = ?device.energy_mode,
        "Registering device"
    );

    Ok(DevicePoller::new(
        client,
        device.channel_map,
        EnergyIntegrator::new(device.energy_mode, global.poll_interval),
        PublishedState::new(identity),
        PollerTiming {
            poll_interval: global.poll_interval,
            sign_of_life: global.sign_of_life,
        },
    ))
}

fn log_exit(tags: &HashMap<Id, String>, joined: Result<(Id, ()), JoinError>) {
    let unknown = String::from("?");
    match joined {
        Ok((id, ())) => {
            info!(device = %tags.get(&id).unwrap_or(&unknown), "Device poller exited");
        }
        Err(err) if err.is_panic() => {
            error!(
                device = %tags.get(&err.id()).unwrap_or(&unknown),
                "Device poller panicked; its last values stay published"
            );
        }
        Err(err) => {
            warn!(
                device = %tags.get(&err.id()).unwrap_or(&unknown),
                "Device poller cancelled"
            );
        }
    }
}
