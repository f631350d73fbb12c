use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Local};

use crate::identity::{DeviceIdentity, DeviceKind};
use crate::telemetry::Phase;

/// A named value exposed to the publishing bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DataPoint {
    EnergyForward,
    EnergyReverse,
    Power,
    Current,
    Voltage,
    PhaseVoltage(Phase),
    PhaseCurrent(Phase),
    PhasePower(Phase),
    PhaseEnergyForward(Phase),
    PhaseEnergyReverse(Phase),
}

impl DataPoint {
    /// Bus path, e.g. `/Ac/L1/Voltage`
    pub fn path(&self) -> String {
        match self {
            DataPoint::EnergyForward => "/Ac/Energy/Forward".to_string(),
            DataPoint::EnergyReverse => "/Ac/Energy/Reverse".to_string(),
            DataPoint::Power => "/Ac/Power".to_string(),
            DataPoint::Current => "/Ac/Current".to_string(),
            DataPoint::Voltage => "/Ac/Voltage".to_string(),
            DataPoint::PhaseVoltage(phase) => format!("/Ac/{}/Voltage", phase.label()),
            DataPoint::PhaseCurrent(phase) => format!("/Ac/{}/Current", phase.label()),
            DataPoint::PhasePower(phase) => format!("/Ac/{}/Power", phase.label()),
            DataPoint::PhaseEnergyForward(phase) => format!("/Ac/{}/Energy/Forward", phase.label()),
            DataPoint::PhaseEnergyReverse(phase) => format!("/Ac/{}/Energy/Reverse", phase.label()),
        }
    }

    pub fn unit(&self) -> Unit {
        match self {
            DataPoint::EnergyForward
            | DataPoint::EnergyReverse
            | DataPoint::PhaseEnergyForward(_)
            | DataPoint::PhaseEnergyReverse(_) => Unit::KilowattHour,
            DataPoint::Power | DataPoint::PhasePower(_) => Unit::Watt,
            DataPoint::Current | DataPoint::PhaseCurrent(_) => Unit::Ampere,
            DataPoint::Voltage | DataPoint::PhaseVoltage(_) => Unit::Volt,
        }
    }

    /// Points that drop to zero while the device is unreachable. Energy counters are not among them.
    pub fn is_power_output(&self) -> bool {
        self.unit() != Unit::KilowattHour
    }

    /// Every point a device of this kind publishes.
    pub fn catalog(kind: DeviceKind) -> Vec<DataPoint> {
        let mut points = vec![
            DataPoint::EnergyForward,
            DataPoint::EnergyReverse,
            DataPoint::Power,
            DataPoint::Current,
            DataPoint::Voltage,
        ];
        match kind {
            DeviceKind::Em => {
                points.push(DataPoint::PhaseVoltage(Phase::L1));
                points.push(DataPoint::PhaseCurrent(Phase::L1));
                points.push(DataPoint::PhasePower(Phase::L1));
            }
            DeviceKind::ThreeEm => {
                for phase in Phase::ALL {
                    points.push(DataPoint::PhaseVoltage(phase));
                    points.push(DataPoint::PhaseCurrent(phase));
                    points.push(DataPoint::PhasePower(phase));
                    points.push(DataPoint::PhaseEnergyForward(phase));
                    points.push(DataPoint::PhaseEnergyReverse(phase));
                }
            }
        }
        points
    }
}

impl fmt::Display for DataPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    KilowattHour,
    Ampere,
    Watt,
    Volt,
}

impl Unit {
    /// Text rendering used by bus consumers: kWh with 2 decimals, everything else with 1.
    pub fn format(self, value: f64) -> String {
        match self {
            Unit::KilowattHour => format!("{value:.2} kWh"),
            Unit::Ampere => format!("{value:.1} A"),
            Unit::Watt => format!("{value:.1} W"),
            Unit::Volt => format!("{value:.1} V"),
        }
    }
}

pub type PointValues = BTreeMap<DataPoint, f64>;

/// An immutable view of one device's published state.
#[derive(Debug, Clone)]
pub struct Snapshot {
    identity: Arc<DeviceIdentity>,
    values: PointValues,
    update_index: u8,
    last_update_at: Option<DateTime<Local>>,
}

impl Snapshot {
    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn get(&self, point: DataPoint) -> Option<f64> {
        self.values.get(&point).copied()
    }

    /// Value of a point, `0.0` if this device does not publish it
    pub fn value(&self, point: DataPoint) -> f64 {
        self.get(point).unwrap_or_default()
    }

    pub fn formatted(&self, point: DataPoint) -> Option<String> {
        self.get(point).map(|value| point.unit().format(value))
    }

    pub fn values(&self) -> &PointValues {
        &self.values
    }

    pub fn update_index(&self) -> u8 {
        self.update_index
    }

    /// When values from a successful poll were last applied
    pub fn last_update_at(&self) -> Option<DateTime<Local>> {
        self.last_update_at
    }
}

/// The single writer of a device's published state. Owned by that device's poller; not `Clone`.
///
/// Every mutation builds a complete new snapshot and swaps it in under the lock, so readers
/// only ever see whole updates.
pub struct PublishedState {
    current: Arc<Snapshot>,
    shared: Arc<RwLock<Arc<Snapshot>>>,
}

/// Read-only handle for the publishing layer and the liveness reporter.
#[derive(Clone)]
pub struct StateReader {
    shared: Arc<RwLock<Arc<Snapshot>>>,
}

impl PublishedState {
    /// Starts with every catalogued point at zero and an update index of 0.
    pub fn new(identity: DeviceIdentity) -> Self {
        let values = DataPoint::catalog(identity.kind)
            .into_iter()
            .map(|point| (point, 0.0))
            .collect();
        let current = Arc::new(Snapshot {
            identity: Arc::new(identity),
            values,
            update_index: 0,
            last_update_at: None,
        });
        Self {
            shared: Arc::new(RwLock::new(current.clone())),
            current,
        }
    }

    pub fn reader(&self) -> StateReader {
        StateReader {
            shared: self.shared.clone(),
        }
    }

    #[cfg(test)]
    pub(crate) fn snapshot(&self) -> Arc<Snapshot> {
        self.current.clone()
    }

    /// Replaces the given points and signals a new sample.
    pub fn apply_update(&mut self, values: PointValues) {
        self.publish(|next| {
            next.values.extend(values);
            next.last_update_at = Some(Local::now());
        });
    }

    /// Zeros every power, current and voltage point. Energy counters keep their values.
    pub fn zero_power_outputs(&mut self) {
        self.publish(|next| {
            for (point, value) in next.values.iter_mut() {
                if point.is_power_output() {
                    *value = 0.0;
                }
            }
        });
    }

    /// Signals a completed cycle without changing any value.
    pub fn republish(&mut self) {
        self.publish(|_| {});
    }

    /// Replaces the serial number in the identity block. Values and update index are untouched.
    pub fn set_serial(&mut self, serial: String) {
        let mut identity = DeviceIdentity::clone(&self.current.identity);
        identity.serial = serial;
        let mut next = Snapshot::clone(&self.current);
        next.identity = Arc::new(identity);
        self.swap(next);
    }

    fn publish(&mut self, mutate: impl FnOnce(&mut Snapshot)) {
        let mut next = Snapshot::clone(&self.current);
        mutate(&mut next);
        next.update_index = next.update_index.wrapping_add(1);
        self.swap(next);
    }

    fn swap(&mut self, next: Snapshot) {
        let next = Arc::new(next);
        self.current = next.clone();
        *self.shared.write().unwrap_or_else(PoisonError::into_inner) = next;
    }
}

impl StateReader {
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.shared
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
