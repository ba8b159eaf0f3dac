//! Drive a PWM motor controller (PID 1) over a simulated port.
//!
//! Speeds set from the main thread are queued and sent by the device loop.
//!
//! ```sh
//! cargo run --example drive_train
//! ```

use parking_lot::Mutex;
use portbind::core::simulator::{SimulatedBus, SimulatedDevice};
use portbind::{BoundDevice, DeviceApp, DeviceLink, DeviceSpec, DiscoveryCache, Liveness};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const DRIVE_TRAIN_PID: u8 = 0x01;
const SET_SPEED: u8 = 0x01;

/// Motor controller with a one-slot command queue
#[derive(Clone, Default)]
struct DriveTrain {
    pending: Arc<Mutex<Option<u8>>>,
}

impl DriveTrain {
    /// Queue an 8-bit PWM speed; returns false when out of range
    fn set_motor(&self, speed: i32) -> bool {
        match u8::try_from(speed) {
            Ok(speed) => {
                *self.pending.lock() = Some(speed);
                true
            }
            Err(_) => {
                error!("Motor speed {} outside 0..=255", speed);
                false
            }
        }
    }
}

impl DeviceApp for DriveTrain {
    fn iterate(&mut self, link: &mut DeviceLink) -> bool {
        let pending = self.pending.lock().take();
        if let Some(speed) = pending {
            if let Err(e) = link.send(SET_SPEED, &[speed]) {
                warn!("Could not send speed {}: {}", speed, e);
            }
        }
        true
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let motor = SimulatedDevice::new("/dev/ttyUSB0").identity(DRIVE_TRAIN_PID);
    let bus = SimulatedBus::new()
        .with_device(SimulatedDevice::new("/dev/ttyS0").silent())
        .with_device(motor.clone());

    let liveness = Liveness::new();
    let cache = DiscoveryCache::new(Arc::new(bus), liveness.clone());
    cache.refresh(115_200, Duration::from_millis(200))?;

    let drive_train = DriveTrain::default();
    let device = BoundDevice::bind(
        DeviceSpec::new("drive_train", DRIVE_TRAIN_PID)
            .timeout(Duration::from_millis(200))
            .interval(Duration::from_millis(10)),
        &cache,
        liveness.child(),
        drive_train.clone(),
    )?;

    for speed in [0, 64, 128, 255, 300] {
        if drive_train.set_motor(speed) {
            info!("Motor speed set to {}", speed);
        }
        thread::sleep(Duration::from_millis(50));
    }

    let reason = device.stop()?;
    info!("Drive train loop stopped: {}", reason);

    for frame in motor.received_frames().iter().filter(|f| f.code() == SET_SPEED) {
        info!("Motor received speed {:?}", frame.body().first());
    }
    Ok(())
}
