//! Synchronized acquisition: one software trigger per external event.

mod common;

use camdaq_core::cancel::CancelToken;
use camdaq_core::error::AppResult;
use camdaq_driver::hardware::{props, Command, PropertyValue};
use camdaq_driver::{EventSource, GateRelease, ManualEventSource, SyncGate, SyncGateState};
use common::*;
use std::sync::Arc;
use std::time::Duration;

#[test]
fn each_event_releases_exactly_one_frame() {
    let (driver, control) = mock_driver(fast_config());
    let source = ManualEventSource::new();
    driver.synchronize_on(Some(source.clone()));
    let (callback, rx) = frame_channel();
    driver.start(callback).unwrap();
    assert_eq!(
        control.property(props::TRIGGER_MODE),
        Some(PropertyValue::Enum(props::TRIGGER_SOFTWARE.into()))
    );

    assert!(rx.recv_timeout(Duration::from_millis(150)).is_err());
    for i in 0..3u64 {
        assert!(source.fire());
        let frame = recv_frames(&rx, 1, Duration::from_secs(2)).remove(0);
        assert_eq!(frame.metadata.frame_number, i);
        assert_eq!(frame.metadata.discarded, 0);
    }
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

    driver.stop();
    driver.wait_stopped(JOIN_TIMEOUT).unwrap();
    let triggers = control
        .commands()
        .into_iter()
        .filter(|c| *c == Command::SoftwareTrigger)
        .count();
    assert_eq!(triggers, 3);
}

#[test]
fn leaving_sync_mode_resumes_free_running() {
    let (driver, control) = mock_driver(fast_config());
    let source = ManualEventSource::new();
    driver.synchronize_on(Some(source.clone()));
    let (callback, rx) = frame_channel();
    driver.start(callback).unwrap();
    control.set_auto_fill(Some(Duration::from_millis(5)));

    driver.synchronize_on(None);
    let frames = recv_frames(&rx, 3, Duration::from_secs(5));
    driver.stop();
    driver.wait_stopped(JOIN_TIMEOUT).unwrap();

    assert_eq!(frames.len(), 3);
    assert_eq!(
        control.property(props::TRIGGER_MODE),
        Some(PropertyValue::Enum(props::TRIGGER_INTERNAL.into()))
    );
    assert!(!source.fire(), "detached source has no gate");
}

#[test]
fn late_event_fires_once() {
    let gate = Arc::new(SyncGate::new(Duration::from_millis(10)));
    gate.set_enabled(true);
    let source = ManualEventSource::new();
    source.attach(Arc::downgrade(&gate));

    assert!(source.fire());
    assert!(source.fire());
    assert_eq!(gate.state(), SyncGateState::LateFired);

    let cancel = CancelToken::new();
    let mut fired = 0;
    let release = gate
        .arm_and_wait(&cancel, &mut || -> AppResult<()> {
            fired += 1;
            Ok(())
        })
        .unwrap();
    assert!(matches!(release, GateRelease::Late { .. }));
    assert_eq!(gate.state(), SyncGateState::Disarmed);

    let canceller = cancel.clone();
    let handle = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        canceller.cancel();
    });
    let err = gate
        .arm_and_wait(&cancel, &mut || -> AppResult<()> {
            fired += 1;
            Ok(())
        })
        .unwrap_err();
    handle.join().unwrap();

    assert!(err.is_cancelled());
    assert_eq!(fired, 1);
}
