use std::{collections::HashMap, future, sync::Arc};

use tokio::net::TcpListener;
use tokio_modbus::{
    server::tcp::{accept_tcp_connection, Server},
    ExceptionCode, Request, Response, SlaveRequest,
};
use tracing::{debug, error, info, warn};

use crate::identity::{FIRMWARE_VERSION, HARDWARE_VERSION};
use crate::published_state::{DataPoint, Snapshot, StateReader};
use crate::telemetry::Phase;

/// First register of the SunSpec map
pub const BASE_REGISTER: u16 = 40000;
/// Highest Modbus unit id that can be addressed
pub const MAX_UNIT_ID: u32 = 247;

const MANUFACTURER: &str = "Shelly";
const MODEL_COMMON: u16 = 1;
const MODEL_COMMON_LEN: u16 = 65;
/// Float three phase wye meter
const MODEL_METER: u16 = 213;
const MODEL_METER_LEN: u16 = 124;
const END_MARKER: u16 = 0xFFFF;

// Register addresses inside the map
const REG_MANUFACTURER: u16 = 40004;
const REG_MODEL: u16 = 40020;
const REG_OPTIONS: u16 = 40036;
const REG_VERSION: u16 = 40044;
const REG_SERIAL: u16 = 40052;
const REG_DEVICE_ADDRESS: u16 = 40068;
const REG_METER_ID: u16 = 40069;
const REG_CURRENT: u16 = 40071;
const REG_PHASE_CURRENT: u16 = 40073;
const REG_VOLTAGE: u16 = 40079;
const REG_PHASE_VOLTAGE: u16 = 40081;
const REG_POWER: u16 = 40097;
const REG_PHASE_POWER: u16 = 40099;
const REG_ENERGY_EXPORTED: u16 = 40129;
const REG_PHASE_ENERGY_EXPORTED: u16 = 40131;
const REG_ENERGY_IMPORTED: u16 = 40137;
const REG_PHASE_ENERGY_IMPORTED: u16 = 40139;
const REG_END: u16 = 40195;
const REG_UPDATE_INDEX: u16 = 40197;
// Device identity block, outside the SunSpec models
const REG_PRODUCT_ID: u16 = 40198;
const REG_DEVICE_TYPE: u16 = 40199;
const REG_HARDWARE_VERSION: u16 = 40200;
const REG_POSITION: u16 = 40201;
const REG_CUSTOM_NAME: u16 = 40202;
const CUSTOM_NAME_LEN: u16 = 16;

const MAP_LEN: usize = (REG_CUSTOM_NAME + CUSTOM_NAME_LEN - BASE_REGISTER) as usize;

/// Modbus TCP face of the bridge. Each device is a unit whose id is its instance number and
/// whose holding registers render the device's latest snapshot.
#[derive(Clone)]
pub struct ModbusBus {
    units: Arc<HashMap<u8, StateReader>>,
}

impl tokio_modbus::server::Service for ModbusBus {
    type Request = SlaveRequest<'static>;
    type Response = Response;
    type Exception = ExceptionCode;
    type Future = future::Ready<Result<Self::Response, Self::Exception>>;

    fn call(&self, req: Self::Request) -> Self::Future {
        let SlaveRequest { slave, request } = req;
        let res = match request {
            Request::ReadHoldingRegisters(addr, cnt) => {
                debug!("Holding register read for unit {slave} {addr}/{cnt}");
                self.read_registers(slave, addr, cnt)
                    .map(Response::ReadHoldingRegisters)
            }
            Request::ReadInputRegisters(addr, cnt) => {
                debug!("Input register read for unit {slave} {addr}/{cnt}");
                self.read_registers(slave, addr, cnt)
                    .map(Response::ReadInputRegisters)
            }
            _ if !self.units.contains_key(&slave) => Err(ExceptionCode::GatewayTargetDevice),
            _ => {
                debug!("Unsupported function in request for unit {slave}: {request:?}");
                Err(ExceptionCode::IllegalFunction)
            }
        };
        future::ready(res)
    }
}

impl ModbusBus {
    /// Registers one unit per reader. Devices whose instance does not fit a Modbus unit id are
    /// left off the bus.
    pub fn new(readers: &[StateReader]) -> Self {
        let mut units = HashMap::new();
        for reader in readers {
            let instance = reader.snapshot().identity().instance;
            match u8::try_from(instance) {
                Ok(unit) if instance <= MAX_UNIT_ID => {
                    units.insert(unit, reader.clone());
                }
                _ => warn!(
                    "Device instance {instance} exceeds Modbus unit id {MAX_UNIT_ID}; not published over Modbus"
                ),
            }
        }
        Self {
            units: Arc::new(units),
        }
    }

    pub fn unit_ids(&self) -> Vec<u8> {
        let mut ids: Vec<u8> = self.units.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Reads `cnt` registers from one consistent snapshot of unit `slave`.
    pub fn read_registers(&self, slave: u8, addr: u16, cnt: u16) -> Result<Vec<u16>, ExceptionCode> {
        let reader = self
            .units
            .get(&slave)
            .ok_or(ExceptionCode::GatewayTargetDevice)?;

        let start = usize::from(addr.wrapping_sub(BASE_REGISTER));
        let end = start + usize::from(cnt);
        if addr < BASE_REGISTER || cnt == 0 || end > MAP_LEN {
            debug!("Illegal data address, can't handle read of {addr}/{cnt} on unit {slave}");
            return Err(ExceptionCode::IllegalDataAddress);
        }

        let table = register_table(&reader.snapshot());
        Ok(table[start..end].to_vec())
    }

    pub async fn serve_listener(self, listener: TcpListener) -> anyhow::Result<()> {
        info!("Publishing Modbus units {:?}", self.unit_ids());
        let server = Server::new(listener);
        let new_service = |_socket_addr| Ok(Some(self.clone()));
        let on_connected = |stream, socket_addr| async move {
            accept_tcp_connection(stream, socket_addr, new_service)
        };
        let on_process_error = |err| {
            error!("Modbus server error: {err}");
        };
        server.serve(&on_connected, on_process_error).await?;
        Ok(())
    }
}

/// Renders a snapshot as the SunSpec common block followed by a model 213 meter block, the
/// update index and the device identity block. Index 0 is register 40000.
pub fn register_table(snapshot: &Snapshot) -> Vec<u16> {
    let identity = snapshot.identity();
    let mut regs = vec![0u16; MAP_LEN];

    // "SunS"
    set(&mut regs, BASE_REGISTER, 0x5375);
    set(&mut regs, BASE_REGISTER + 1, 0x6e53);
    set(&mut regs, BASE_REGISTER + 2, MODEL_COMMON);
    set(&mut regs, BASE_REGISTER + 3, MODEL_COMMON_LEN);
    set_str(&mut regs, REG_MANUFACTURER, 16, MANUFACTURER);
    set_str(&mut regs, REG_MODEL, 16, identity.product_name());
    set_str(&mut regs, REG_OPTIONS, 8, identity.role.as_str());
    set_str(&mut regs, REG_VERSION, 8, FIRMWARE_VERSION);
    set_str(&mut regs, REG_SERIAL, 16, &identity.serial);
    set(&mut regs, REG_DEVICE_ADDRESS, identity.instance as u16);

    set(&mut regs, REG_METER_ID, MODEL_METER);
    set(&mut regs, REG_METER_ID + 1, MODEL_METER_LEN);

    set_f32(&mut regs, REG_CURRENT, snapshot.value(DataPoint::Current));
    set_f32(&mut regs, REG_VOLTAGE, snapshot.value(DataPoint::Voltage));
    set_f32(&mut regs, REG_POWER, snapshot.value(DataPoint::Power));
    set_f32(
        &mut regs,
        REG_ENERGY_EXPORTED,
        snapshot.value(DataPoint::EnergyReverse) * 1000.0,
    );
    set_f32(
        &mut regs,
        REG_ENERGY_IMPORTED,
        snapshot.value(DataPoint::EnergyForward) * 1000.0,
    );

    for phase in Phase::ALL {
        let offset = 2 * phase.index() as u16;
        set_f32(
            &mut regs,
            REG_PHASE_CURRENT + offset,
            snapshot.value(DataPoint::PhaseCurrent(phase)),
        );
        set_f32(
            &mut regs,
            REG_PHASE_VOLTAGE + offset,
            snapshot.value(DataPoint::PhaseVoltage(phase)),
        );
        set_f32(
            &mut regs,
            REG_PHASE_POWER + offset,
            snapshot.value(DataPoint::PhasePower(phase)),
        );
        set_f32(
            &mut regs,
            REG_PHASE_ENERGY_EXPORTED + offset,
            snapshot.value(DataPoint::PhaseEnergyReverse(phase)) * 1000.0,
        );
        set_f32(
            &mut regs,
            REG_PHASE_ENERGY_IMPORTED + offset,
            snapshot.value(DataPoint::PhaseEnergyForward(phase)) * 1000.0,
        );
    }

    set(&mut regs, REG_END, END_MARKER);
    set(&mut regs, REG_END + 1, 0);
    set(&mut regs, REG_UPDATE_INDEX, u16::from(snapshot.update_index()));

    set(&mut regs, REG_PRODUCT_ID, identity.product_id());
    set(&mut regs, REG_DEVICE_TYPE, identity.device_type());
    set(&mut regs, REG_HARDWARE_VERSION, HARDWARE_VERSION);
    set(&mut regs, REG_POSITION, u16::from(identity.position));
    set_str(&mut regs, REG_CUSTOM_NAME, CUSTOM_NAME_LEN, &identity.custom_name);
    regs
}

fn set(regs: &mut [u16], register: u16, value: u16) {
    regs[usize::from(register - BASE_REGISTER)] = value;
}

/// High word first
fn set_f32(regs: &mut [u16], register: u16, value: f64) {
    let int_encoding: u32 = (value as f32).to_bits();
    set(regs, register, (int_encoding >> 16) as u16);
    set(regs, register + 1, (int_encoding & 0xFFFF) as u16);
}

/// Two ASCII bytes per register, zero padded, truncated to `len` registers.
fn set_str(regs: &mut [u16], register: u16, len: u16, text: &str) {
    let bytes = text.as_bytes();
    for (index, pair) in bytes.chunks(2).take(usize::from(len)).enumerate() {
        let high = u16::from(pair[0]);
        let low = pair.get(1).copied().map(u16::from).unwrap_or(0);
        set(regs, register + index as u16, (high << 8) | low);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{DeviceIdentity, DeviceKind, Role};
    use crate::published_state::{PointValues, PublishedState};
    use tokio_modbus::server::Service;

    fn state(instance: u32, kind: DeviceKind) -> PublishedState {
        PublishedState::new(DeviceIdentity {
            role: Role::Grid,
            instance,
            custom_name: "House".to_string(),
            serial: "A4CF12F45678".to_string(),
            position: 0,
            kind,
        })
    }

    fn float_at(regs: &[u16], register: u16) -> f32 {
        let index = usize::from(register - BASE_REGISTER);
        f32::from_bits((u32::from(regs[index]) << 16) | u32::from(regs[index + 1]))
    }

    #[test]
    fn test_register_table_layout() {
        let mut state = state(40, DeviceKind::ThreeEm);
        state.apply_update(PointValues::from([
            (DataPoint::Power, 1500.0),
            (DataPoint::Voltage, 230.0),
            (DataPoint::Current, 6.5),
            (DataPoint::EnergyForward, 123.456),
            (DataPoint::EnergyReverse, 1.5),
            (DataPoint::PhasePower(Phase::L2), 500.0),
            (DataPoint::PhaseEnergyForward(Phase::L3), 2.0),
        ]));
        let regs = register_table(&state.snapshot());

        assert_eq!(regs.len(), MAP_LEN);
        assert_eq!(&regs[0..4], &[0x5375, 0x6e53, 1, 65]);
        // "Shelly" packed two characters per register
        assert_eq!(&regs[4..8], &[0x5368, 0x656c, 0x6c79, 0]);
        assert_eq!(regs[(REG_DEVICE_ADDRESS - BASE_REGISTER) as usize], 40);
        assert_eq!(regs[69], 213);
        assert_eq!(regs[70], 124);

        assert_eq!(float_at(&regs, 40097), 1500.0);
        assert_eq!(float_at(&regs, 40079), 230.0);
        assert_eq!(float_at(&regs, 40071), 6.5);
        assert_eq!(float_at(&regs, 40101), 500.0);
        assert_eq!(float_at(&regs, 40137), 123456.0);
        assert_eq!(float_at(&regs, 40129), 1500.0);
        assert_eq!(float_at(&regs, 40143), 2000.0);
        // Frequency is not measured
        assert_eq!(float_at(&regs, 40095), 0.0);

        assert_eq!(regs[195], 0xFFFF);
        assert_eq!(regs[196], 0);
        assert_eq!(regs[197], 1);

        // Identity block
        assert_eq!(regs[198], 45069);
        assert_eq!(regs[199], 345);
        assert_eq!(regs[200], 0);
        assert_eq!(regs[201], 0);
        // "House"
        assert_eq!(&regs[202..206], &[0x486f, 0x7573, 0x6500, 0]);
        assert_eq!(MAP_LEN, 218);
    }

    #[test]
    fn test_identity_block_follows_role_and_position() {
        let pv = PublishedState::new(DeviceIdentity {
            role: Role::PvInverter,
            instance: 41,
            custom_name: "Shelly 3EM on the garage roof".to_string(),
            serial: "C45BBE6B1234".to_string(),
            position: 1,
            kind: DeviceKind::ThreeEm,
        });
        let regs = register_table(&pv.snapshot());

        assert_eq!(regs[(REG_PRODUCT_ID - BASE_REGISTER) as usize], 0xA144);
        assert_eq!(regs[(REG_POSITION - BASE_REGISTER) as usize], 1);
        // 29 characters fit in 15 registers; the last one is padding
        let name = &regs[(REG_CUSTOM_NAME - BASE_REGISTER) as usize..];
        assert_eq!(name.len(), usize::from(CUSTOM_NAME_LEN));
        assert_eq!(name[14], 0x6600);
        assert_eq!(name[15], 0);
    }

    #[test]
    fn test_serial_is_truncated_to_field() {
        let mut regs = vec![0u16; MAP_LEN];
        set_str(&mut regs, REG_OPTIONS, 8, "a-very-long-options-string");
        assert_eq!(regs[(REG_VERSION - BASE_REGISTER) as usize], 0);
        assert_eq!(regs[(REG_OPTIONS - BASE_REGISTER) as usize], 0x612d);
    }

    #[test]
    fn test_read_registers_bounds_and_units() {
        let grid = state(40, DeviceKind::Em);
        let bus = ModbusBus::new(&[grid.reader()]);

        assert_eq!(bus.read_registers(40, 40000, 2), Ok(vec![0x5375, 0x6e53]));
        assert_eq!(bus.read_registers(40, 40196, 2).map(|r| r.len()), Ok(2));
        assert_eq!(bus.read_registers(40, 40198, 2), Ok(vec![45069, 345]));
        assert_eq!(bus.read_registers(40, 40216, 2).map(|r| r.len()), Ok(2));
        assert_eq!(
            bus.read_registers(40, 40217, 2),
            Err(ExceptionCode::IllegalDataAddress)
        );
        assert_eq!(
            bus.read_registers(40, 39999, 2),
            Err(ExceptionCode::IllegalDataAddress)
        );
        assert_eq!(
            bus.read_registers(40, 40000, 0),
            Err(ExceptionCode::IllegalDataAddress)
        );
        assert_eq!(
            bus.read_registers(41, 40000, 2),
            Err(ExceptionCode::GatewayTargetDevice)
        );
    }

    #[test]
    fn test_instances_above_unit_range_are_skipped() {
        let addressable = state(247, DeviceKind::Em);
        let too_high = state(300, DeviceKind::Em);
        let bus = ModbusBus::new(&[addressable.reader(), too_high.reader()]);
        assert_eq!(bus.unit_ids(), vec![247]);
    }

    #[test]
    fn test_reads_follow_latest_snapshot() {
        let mut grid = state(40, DeviceKind::Em);
        let bus = ModbusBus::new(&[grid.reader()]);

        grid.apply_update(PointValues::from([(DataPoint::Power, -750.0)]));
        let regs = bus.read_registers(40, REG_POWER, 2).unwrap();
        assert_eq!(f32::from_bits((u32::from(regs[0]) << 16) | u32::from(regs[1])), -750.0);
    }

    #[test]
    fn test_service_rejects_writes() {
        let grid = state(40, DeviceKind::Em);
        let bus = ModbusBus::new(&[grid.reader()]);

        let write = bus.call(SlaveRequest {
            slave: 40,
            request: Request::WriteSingleRegister(40097, 1),
        });
        assert_eq!(write.into_inner(), Err(ExceptionCode::IllegalFunction));

        let unknown = bus.call(SlaveRequest {
            slave: 9,
            request: Request::WriteSingleRegister(40097, 1),
        });
        assert_eq!(unknown.into_inner(), Err(ExceptionCode::GatewayTargetDevice));

        let read = bus.call(SlaveRequest {
            slave: 40,
            request: Request::ReadHoldingRegisters(40069, 2),
        });
        assert_eq!(
            read.into_inner(),
            Ok(Response::ReadHoldingRegisters(vec![213, 124]))
        );
    }
}
