//! Binding devices to the ports that host them

use bytes::Bytes;
use parking_lot::Mutex;
use portbind::core::simulator::{SimulatedBus, SimulatedDevice};
use portbind::{
    BindError, BoundDevice, DeviceApp, DeviceLink, DeviceSpec, DiscoveryCache, ExitReason,
    FrameError, Liveness, Pid, TransportError,
};
use std::sync::Arc;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_millis(50);

fn discovered(bus: &SimulatedBus, liveness: &Liveness) -> DiscoveryCache {
    let cache = DiscoveryCache::new(Arc::new(bus.clone()), liveness.clone());
    cache.refresh(115200, TIMEOUT).unwrap();
    cache
}

#[test]
fn absent_pid_fails_without_opening_anything() {
    let bus = SimulatedBus::new()
        .with_device(SimulatedDevice::new("ttyA").identity(1u8))
        .with_device(SimulatedDevice::new("ttyB").identity(2u8));
    let liveness = Liveness::new();
    let cache = discovered(&bus, &liveness);
    let opens_after_discovery = bus.total_opens();

    let err = BoundDevice::bind(
        DeviceSpec::new("missing", 7u8),
        &cache,
        liveness.child(),
        |_: &mut DeviceLink| true,
    )
    .unwrap_err();

    match err {
        BindError::DeviceNotPresent { name, pid } => {
            assert_eq!(name, "missing");
            assert_eq!(pid, Pid::from(7u8));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(bus.total_opens(), opens_after_discovery);
}

#[test]
fn device_follows_its_pid_across_ports() {
    let bus = SimulatedBus::new().with_device(SimulatedDevice::new("ttyUSB0").identity(4u8));
    let liveness = Liveness::new();
    let cache = discovered(&bus, &liveness);
    let spec = DeviceSpec::new("logger", 4u8).timeout(TIMEOUT);

    let first = BoundDevice::bind(spec.clone(), &cache, liveness.child(), |_: &mut DeviceLink| false)
        .unwrap();
    assert_eq!(first.port(), "ttyUSB0");
    first.join().unwrap();

    // Replugged on another port; the next cycle moves the binding.
    bus.detach("ttyUSB0");
    bus.attach(SimulatedDevice::new("ttyUSB1").identity(4u8));
    cache.refresh(115200, TIMEOUT).unwrap();

    let second = BoundDevice::bind(spec, &cache, liveness.child(), |_: &mut DeviceLink| false)
        .unwrap();
    assert_eq!(second.port(), "ttyUSB1");
    second.join().unwrap();
}

struct Poller {
    sensor: SimulatedDevice,
    readings: Arc<Mutex<Vec<Bytes>>>,
}

impl DeviceApp for Poller {
    fn iterate(&mut self, link: &mut DeviceLink) -> bool {
        if let Ok(reading) = link.request(0x01, &[]) {
            self.readings.lock().push(reading);
            self.sensor.set_reply(0x01, vec![0, 11]);
        }
        self.readings.lock().len() < 2
    }
}

#[test]
fn poller_sees_changing_readings() {
    let sensor = SimulatedDevice::new("ttyACM0").identity(2u8).reply(0x01, vec![0, 10]);
    let bus = SimulatedBus::new().with_device(sensor.clone());
    let liveness = Liveness::new();
    let cache = discovered(&bus, &liveness);

    let readings = Arc::new(Mutex::new(Vec::new()));
    let device = BoundDevice::bind(
        DeviceSpec::new("sensor", 2u8).timeout(TIMEOUT),
        &cache,
        liveness.child(),
        Poller {
            sensor: sensor.clone(),
            readings: Arc::clone(&readings),
        },
    )
    .unwrap();

    assert_eq!(device.join().unwrap(), ExitReason::Finished);
    assert_eq!(
        readings.lock().as_slice(),
        &[Bytes::from_static(&[0, 10]), Bytes::from_static(&[0, 11])]
    );
    assert!(!sensor.is_open());
}

#[test]
fn checksum_faults_stay_inside_the_loop() {
    let clean = SimulatedBus::new().with_device(SimulatedDevice::new("ttyS1").identity(3u8));
    let liveness = Liveness::new();
    let cache = discovered(&clean, &liveness);
    // Same port, now garbling every reply; the identity would not survive discovery.
    let noisy = SimulatedBus::new().with_device(
        SimulatedDevice::new("ttyS1")
            .identity(3u8)
            .reply(0x09, vec![1])
            .corrupt_checksum(),
    );

    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&errors);
    let device = BoundDevice::bind_snapshot(
        DeviceSpec::new("noisy", 3u8).timeout(TIMEOUT),
        &cache.snapshot(),
        &noisy,
        liveness.child(),
        move |link: &mut DeviceLink| {
            if let Err(e) = link.request(0x09, &[]) {
                sink.lock().push(e);
            }
            sink.lock().len() < 3
        },
    )
    .unwrap();

    assert_eq!(device.join().unwrap(), ExitReason::Finished);
    let errors = errors.lock();
    assert_eq!(errors.len(), 3);
    assert!(errors.iter().all(|e| matches!(e, FrameError::ChecksumFault { .. })));
}

#[test]
fn stalled_writes_fail_without_ending_the_loop() {
    let clean = SimulatedBus::new().with_device(SimulatedDevice::new("ttyS2").identity(4u8));
    let liveness = Liveness::new();
    let cache = discovered(&clean, &liveness);
    let stalled = SimulatedBus::new()
        .with_device(SimulatedDevice::new("ttyS2").identity(4u8).write_timeout());

    let outcomes = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&outcomes);
    let device = BoundDevice::bind_snapshot(
        DeviceSpec::new("stalled", 4u8).timeout(Duration::from_millis(10)),
        &cache.snapshot(),
        &stalled,
        liveness.child(),
        move |link: &mut DeviceLink| {
            let result = link.send(0x01, &[0x20]);
            let mut seen = sink.lock();
            seen.push((result, link.is_connected()));
            seen.len() < 3
        },
    )
    .unwrap();

    assert_eq!(device.join().unwrap(), ExitReason::Finished);
    let outcomes = outcomes.lock();
    assert_eq!(outcomes.len(), 3);
    for (result, connected) in outcomes.iter() {
        assert!(matches!(
            result,
            Err(FrameError::Transport(TransportError::WriteTimeout(_)))
        ));
        assert!(*connected);
    }
    assert!(stalled.device("ttyS2").unwrap().received_frames().is_empty());
}

#[test]
fn host_shutdown_stops_every_device() {
    let bus = SimulatedBus::new()
        .with_device(SimulatedDevice::new("a").identity(1u8))
        .with_device(SimulatedDevice::new("b").identity(2u8));
    let liveness = Liveness::new();
    let cache = discovered(&bus, &liveness);

    let devices: Vec<BoundDevice> = [1u8, 2]
        .into_iter()
        .map(|pid| {
            BoundDevice::bind(
                DeviceSpec::new(format!("dev{pid}"), pid).interval(Duration::from_millis(2)),
                &cache,
                liveness.child(),
                |_: &mut DeviceLink| true,
            )
            .unwrap()
        })
        .collect();
    assert!(bus.device("a").unwrap().is_open());

    liveness.shutdown();
    for device in devices {
        assert_eq!(device.join().unwrap(), ExitReason::HostGone);
    }
    assert!(!bus.device("a").unwrap().is_open());
    assert!(!bus.device("b").unwrap().is_open());
}
