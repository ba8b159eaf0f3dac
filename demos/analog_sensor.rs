//! Poll a two-channel analog sensor (PID 2) over a simulated port.
//!
//! The device loop reads both channels each iteration and publishes the pair
//! over a channel; the main thread prints what arrives.
//!
//! ```sh
//! cargo run --example analog_sensor
//! ```

use bytes::Bytes;
use crossbeam_channel::{unbounded, Sender};
use portbind::core::simulator::{SimulatedBus, SimulatedDevice};
use portbind::{BoundDevice, DeviceApp, DeviceLink, DeviceSpec, DiscoveryCache, FrameError, Liveness};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const SENSOR_PID: u8 = 0x02;
const READ_FIRST: u8 = 0x01;
const READ_SECOND: u8 = 0x02;

struct AnalogSensor {
    readings: Sender<(Bytes, Bytes)>,
}

impl AnalogSensor {
    fn read_pair(link: &mut DeviceLink) -> Result<(Bytes, Bytes), FrameError> {
        let first = link.request(READ_FIRST, &[])?;
        let second = link.request(READ_SECOND, &[])?;
        Ok((first, second))
    }
}

impl DeviceApp for AnalogSensor {
    fn iterate(&mut self, link: &mut DeviceLink) -> bool {
        match Self::read_pair(link) {
            // Stop once nobody listens.
            Ok(pair) => self.readings.send(pair).is_ok(),
            Err(e) => {
                warn!("Sensor read failed: {}", e);
                true
            }
        }
    }
}

fn reading(value: u16) -> Vec<u8> {
    value.to_be_bytes().to_vec()
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let sensor = SimulatedDevice::new("/dev/ttyACM0")
        .identity(SENSOR_PID)
        .reply(READ_FIRST, reading(512))
        .reply(READ_SECOND, reading(100));
    let bus = SimulatedBus::new()
        .with_device(SimulatedDevice::new("/dev/ttyACM1").identity(0x01u8))
        .with_device(sensor.clone());

    let liveness = Liveness::new();
    let cache = DiscoveryCache::new(Arc::new(bus), liveness.clone());
    cache.refresh(115_200, Duration::from_millis(200))?;

    let (tx, rx) = unbounded();
    let device = BoundDevice::bind(
        DeviceSpec::new("analog_sensor", SENSOR_PID)
            .timeout(Duration::from_millis(200))
            .interval(Duration::from_millis(20)),
        &cache,
        liveness.child(),
        AnalogSensor { readings: tx },
    )?;

    for step in 0..5u16 {
        let (first, second) = rx.recv_timeout(Duration::from_secs(2))?;
        info!("first sensor: {:?}, second sensor: {:?}", first, second);
        sensor.set_reply(READ_FIRST, reading(512 + step * 10));
        sensor.set_reply(READ_SECOND, reading(100 - step * 5));
    }

    liveness.shutdown();
    let reason = device.join()?;
    info!("Sensor loop stopped: {}", reason);
    Ok(())
}
