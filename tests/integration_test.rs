use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use serde_json::{json, Value};
use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    net::TcpListener,
    sync::oneshot,
    time::{sleep, timeout},
};
use tokio_modbus::prelude::*;
use tokio_test::assert_ok;

use shelly_meter_bridge::{BridgeConfig, DataPoint, ModbusBus, Orchestrator};

/// Mock Shelly device serving `/status` like the real firmware
#[derive(Clone)]
struct MockShelly {
    mac: &'static str,
    phases: usize,
    power: Arc<AtomicU32>, // Store f32 as u32 bits for atomic access
    total_wh: Arc<AtomicU32>,
    request_count: Arc<AtomicU32>,
    should_fail: Arc<AtomicBool>,
}

impl MockShelly {
    fn new(mac: &'static str, phases: usize) -> Self {
        Self {
            mac,
            phases,
            power: Arc::new(AtomicU32::new(0.0f32.to_bits())),
            total_wh: Arc::new(AtomicU32::new(0.0f32.to_bits())),
            request_count: Arc::new(AtomicU32::new(0)),
            should_fail: Arc::new(AtomicBool::new(false)),
        }
    }

    fn set_power(&self, power: f32) {
        self.power.store(power.to_bits(), Ordering::Relaxed);
    }

    fn set_total_wh(&self, total_wh: f32) {
        self.total_wh.store(total_wh.to_bits(), Ordering::Relaxed);
    }

    fn set_should_fail(&self, should_fail: bool) {
        self.should_fail.store(should_fail, Ordering::Relaxed);
    }

    fn get_request_count(&self) -> u32 {
        self.request_count.load(Ordering::Relaxed)
    }

    /// Every phase reports the same power; single phase devices add an idle second clamp.
    fn status(&self) -> Value {
        let power = f32::from_bits(self.power.load(Ordering::Relaxed));
        let total_wh = f32::from_bits(self.total_wh.load(Ordering::Relaxed));
        let channel = json!({
            "power": power,
            "reactive": 0.0,
            "voltage": 230.0,
            "is_valid": true,
            "total": total_wh,
            "total_returned": 0.0
        });
        if self.phases == 3 {
            json!({
                "mac": self.mac,
                "total_power": power * 3.0,
                "emeters": [channel.clone(), channel.clone(), channel]
            })
        } else {
            json!({
                "mac": self.mac,
                "emeters": [
                    channel,
                    {"power": 0.0, "reactive": 0.0, "voltage": 230.0, "is_valid": true,
                     "total": 0.0, "total_returned": 0.0}
                ]
            })
        }
    }
}

async fn status_handler(State(mock): State<MockShelly>) -> Result<Json<Value>, StatusCode> {
    mock.request_count.fetch_add(1, Ordering::Relaxed);
    if mock.should_fail.load(Ordering::Relaxed) {
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    }
    Ok(Json(mock.status()))
}

/// Start mock Shelly HTTP server
async fn start_mock_shelly(mock: MockShelly) -> (SocketAddr, oneshot::Sender<()>) {
    let app = Router::new()
        .route("/status", get(status_handler))
        .with_state(mock);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    tokio::spawn(async move {
        let server = axum::serve(listener, app);
        tokio::select! {
            _ = server => {},
            _ = shutdown_rx => {
                println!("Mock Shelly server shutting down");
            }
        }
    });

    (addr, shutdown_tx)
}

/// Reads `cnt` holding registers from one unit of the bridge
async fn read_unit(
    bridge_addr: SocketAddr,
    unit: u8,
    addr: u16,
    cnt: u16,
) -> Result<Result<Vec<u16>, ExceptionCode>, Box<dyn std::error::Error>> {
    let mut ctx = tcp::connect_slave(bridge_addr, Slave(unit)).await?;
    Ok(ctx.read_holding_registers(addr, cnt).await?)
}

async fn read_f32(bridge_addr: SocketAddr, unit: u8, addr: u16) -> f32 {
    let result = timeout(Duration::from_secs(5), read_unit(bridge_addr, unit, addr, 2))
        .await
        .expect("Timeout waiting for Modbus response")
        .expect("Failed to read from bridge");
    let registers = assert_ok!(result);
    assert_eq!(registers.len(), 2, "Expected 2 registers for f32 value");
    u16_pair_to_f32(registers[0], registers[1])
}

/// Floats are stored as [high_bits, low_bits]
fn u16_pair_to_f32(high: u16, low: u16) -> f32 {
    let combined: u32 = ((high as u32) << 16) | (low as u32);
    f32::from_bits(combined)
}

#[tokio::test]
async fn test_full_integration() {
    let em = MockShelly::new("A4CF12F45678", 1);
    let three_em = MockShelly::new("C45BBE6B1234", 3);
    em.set_power(1500.0);
    em.set_total_wh(5000.0);
    three_em.set_power(200.0);
    three_em.set_total_wh(1000.0);

    let (em_addr, _em_shutdown) = start_mock_shelly(em.clone()).await;
    let (three_em_addr, _three_em_shutdown) = start_mock_shelly(three_em.clone()).await;

    let config = BridgeConfig::from_toml_str(&format!(
        r#"
        [global]
        log_level = "DEBUG"
        poll_interval_ms = 100
        request_timeout_ms = 300

        [devices.grid_main]
        role = "grid"
        device_instance = 40
        host = "{em_addr}"

        [devices.pv_roof]
        role = "pvinverter"
        device_instance = 41
        host = "{three_em_addr}"
        kind = "3em"
        "#
    ))
    .unwrap();

    // Start the bridge
    let orchestrator = Orchestrator::start(&config).unwrap();
    let bus = ModbusBus::new(orchestrator.readers());
    let bridge_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let bridge_addr = bridge_listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = bus.serve_listener(bridge_listener).await;
    });

    // Wait for the pollers to start and publish
    sleep(Duration::from_millis(800)).await;

    // Test 1: Single phase device published on unit 40
    let power = read_f32(bridge_addr, 40, 40097).await;
    assert!((power - 1500.0).abs() < 0.1, "Expected ~1500W, got {power}W");
    let imported = read_f32(bridge_addr, 40, 40137).await;
    assert!((imported - 5000.0).abs() < 0.1, "Expected 5000Wh, got {imported}Wh");
    let current = read_f32(bridge_addr, 40, 40071).await;
    assert!((current - 6.52).abs() < 0.01, "Expected ~6.52A, got {current}A");

    let grid = orchestrator.readers()[0].snapshot();
    assert_eq!(grid.identity().serial, "A4CF12F45678");
    assert_eq!(grid.formatted(DataPoint::EnergyForward).as_deref(), Some("5.00 kWh"));

    // Test 2: Three phase device on unit 41 uses the device total and sums phase energy
    let total = read_f32(bridge_addr, 41, 40097).await;
    assert!((total - 600.0).abs() < 0.1, "Expected ~600W, got {total}W");
    let phase_c = read_f32(bridge_addr, 41, 40103).await;
    assert!((phase_c - 200.0).abs() < 0.1, "Expected ~200W on L3, got {phase_c}W");
    let imported = read_f32(bridge_addr, 41, 40137).await;
    assert!((imported - 3000.0).abs() < 0.1, "Expected 3000Wh, got {imported}Wh");

    // Test 3: Unknown unit id is rejected by the bridge
    let unknown = read_unit(bridge_addr, 99, 40097, 2).await.unwrap();
    assert_eq!(unknown, Err(ExceptionCode::GatewayTargetDevice));

    // Test 4: Outage zeroes power but keeps energy, other device unaffected
    em.set_should_fail(true);
    sleep(Duration::from_millis(500)).await;

    let power = read_f32(bridge_addr, 40, 40097).await;
    assert_eq!(power, 0.0, "Expected power zeroed during outage");
    let imported = read_f32(bridge_addr, 40, 40137).await;
    assert!((imported - 5000.0).abs() < 0.1, "Energy must survive an outage");
    let total = read_f32(bridge_addr, 41, 40097).await;
    assert!((total - 600.0).abs() < 0.1, "Other device must keep publishing");

    // Test 5: Recovery
    em.set_should_fail(false);
    em.set_power(-800.0);
    em.set_total_wh(5100.0);
    sleep(Duration::from_millis(500)).await;

    let power = read_f32(bridge_addr, 40, 40097).await;
    assert!((power + 800.0).abs() < 0.1, "Expected ~-800W, got {power}W");
    let imported = read_f32(bridge_addr, 40, 40137).await;
    assert!((imported - 5100.0).abs() < 0.1, "Expected 5100Wh, got {imported}Wh");

    assert!(
        em.get_request_count() > 5,
        "Expected multiple polls, got {}",
        em.get_request_count()
    );
    assert!(three_em.get_request_count() > 5);

    timeout(Duration::from_secs(3), orchestrator.shutdown())
        .await
        .expect("Bridge did not shut down in time");
}
