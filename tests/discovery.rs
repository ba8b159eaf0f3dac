//! Discovery over simulated ports

use portbind::core::discovery::FailureKind;
use portbind::core::simulator::{SimulatedBus, SimulatedDevice};
use portbind::{DiscoveryCache, DiscoverySettings, Liveness, Pid};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_millis(60);

fn bus_with(ids: &[(&str, u8)]) -> SimulatedBus {
    ids.iter().fold(SimulatedBus::new(), |bus, (port, pid)| {
        bus.with_device(SimulatedDevice::new(*port).identity(*pid))
    })
}

#[test]
fn every_responding_port_is_mapped() {
    let bus = bus_with(&[("COM3", 1), ("COM4", 2), ("COM7", 3), ("COM9", 4)]);
    let cache = DiscoveryCache::new(Arc::new(bus.clone()), Liveness::new());

    let report = cache
        .refresh_with(&DiscoverySettings::new(57600, TIMEOUT))
        .unwrap();

    assert_eq!(report.snapshot.len(), 4);
    assert!(report.failures.is_empty());
    assert!(report.conflicts.is_empty());
    for (port, pid) in [("COM3", 1u8), ("COM4", 2), ("COM7", 3), ("COM9", 4)] {
        assert_eq!(cache.lookup(&Pid::from(pid)).as_deref(), Some(port));
        let device = bus.device(port).unwrap();
        assert_eq!(device.open_count(), 1);
        assert_eq!(device.last_baud_rate(), Some(57600));
        assert!(!device.is_open());
    }
}

#[test]
fn mixed_bus_reports_each_failure_once() {
    let bus = SimulatedBus::new()
        .with_device(SimulatedDevice::new("a").identity(1u8))
        .with_device(SimulatedDevice::new("b").silent())
        .with_device(SimulatedDevice::new("c").identity(1u8))
        .with_device(SimulatedDevice::new("d").unopenable())
        .with_device(SimulatedDevice::new("e").identity(5u8).delay(Duration::from_millis(10)))
        .with_device(SimulatedDevice::new("f").identity(6u8).delay(Duration::from_millis(500)));
    let cache = DiscoveryCache::new(Arc::new(bus), Liveness::new());
    let report = cache
        .refresh_with(&DiscoverySettings::new(115200, TIMEOUT))
        .unwrap();

    let mapped: Vec<(String, String)> = report
        .snapshot
        .iter()
        .map(|(pid, port)| (pid.to_string(), port.to_string()))
        .collect();
    assert_eq!(
        mapped,
        vec![("1".to_string(), "a".to_string()), ("5".to_string(), "e".to_string())]
    );

    assert_eq!(report.conflicts.len(), 1);
    assert_eq!(report.conflicts[0].kept, "a");
    assert_eq!(report.conflicts[0].rejected, "c");

    let failures: Vec<(&str, FailureKind)> = report
        .failures
        .iter()
        .map(|f| (f.port.as_str(), f.kind))
        .collect();
    assert_eq!(
        failures,
        vec![
            ("b", FailureKind::NoResponse),
            ("d", FailureKind::Unopenable),
            ("f", FailureKind::NoResponse),
        ]
    );
}

#[test]
fn stalled_write_is_reported_as_write_failure() {
    let bus = SimulatedBus::new()
        .with_device(SimulatedDevice::new("stalled").identity(8u8).write_timeout())
        .with_device(SimulatedDevice::new("ok").identity(9u8));
    let cache = DiscoveryCache::new(Arc::new(bus), Liveness::new());
    let report = cache
        .refresh_with(&DiscoverySettings::new(115200, TIMEOUT))
        .unwrap();

    assert!(report.snapshot.contains(&Pid::from(9u8)));
    assert!(!report.snapshot.contains(&Pid::from(8u8)));
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].port, "stalled");
    assert_eq!(report.failures[0].kind, FailureKind::WriteFailed);
    assert!(!report.failures[0].message.contains("reply"), "{}", report.failures[0].message);
}

#[test]
fn readers_never_see_a_partial_snapshot() {
    let bus = bus_with(&[("p0", 10), ("p1", 11), ("p2", 12)]);
    let cache = Arc::new(DiscoveryCache::new(Arc::new(bus), Liveness::new()));

    let reader = {
        let cache = Arc::clone(&cache);
        thread::spawn(move || {
            for _ in 0..200 {
                let snapshot = cache.snapshot();
                assert!(snapshot.is_empty() || snapshot.len() == 3, "saw {}", snapshot.len());
                thread::sleep(Duration::from_millis(1));
            }
        })
    };

    for _ in 0..3 {
        cache.refresh(115200, TIMEOUT).unwrap();
    }
    reader.join().unwrap();
    assert_eq!(cache.snapshot().cycle(), 3);
}

#[test]
fn concurrent_refreshes_each_publish() {
    let bus = bus_with(&[("p0", 1), ("p1", 2)]);
    let cache = Arc::new(DiscoveryCache::new(Arc::new(bus.clone()), Liveness::new()));

    let handles: Vec<_> = (0..3)
        .map(|_| {
            let cache = Arc::clone(&cache);
            thread::spawn(move || cache.refresh(115200, TIMEOUT).unwrap())
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().unwrap().len(), 2);
    }

    assert_eq!(cache.snapshot().cycle(), 3);
    // Cycles never overlapped, so no probe found its port already open.
    assert_eq!(bus.total_opens(), 6);
}

#[test]
fn empty_bus_publishes_empty_snapshot() {
    let cache = DiscoveryCache::new(Arc::new(SimulatedBus::new()), Liveness::new());
    let report = cache
        .refresh_with(&DiscoverySettings::new(115200, TIMEOUT))
        .unwrap();
    assert!(report.snapshot.is_empty());
    assert!(report.ports.is_empty());
    assert_eq!(report.snapshot.cycle(), 1);
}
