//! Connection loss and recovery through the full driver.

mod common;

use camdaq_core::cancel::CancelToken;
use camdaq_core::status::{ConnectionState, ConnectionStatus, StatusPublisher};
use camdaq_driver::components::telemetry::{Telemetry, TelemetryPoller};
use camdaq_driver::hardware::props;
use camdaq_driver::mock::MockCamera;
use camdaq_driver::{ConnectionTracker, ReconnectOutcome, Reconnector};
use common::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::timeout;

const ALL_SETTINGS: [&str; 10] = [
    props::TRIGGER_MODE,
    props::GAIN,
    props::READOUT_RATE,
    props::EXPOSURE_TIME,
    props::BINNING,
    props::AOI_WIDTH,
    props::AOI_HEIGHT,
    props::AOI_LEFT,
    props::AOI_TOP,
    props::PIXEL_ENCODING,
];

#[tokio::test]
async fn disconnect_reconnects_and_reapplies_every_setting() {
    let mut config = fast_config();
    config.reconnect_backoff = Duration::from_millis(40);
    let (driver, control) = mock_driver(config);
    let mut status = driver.subscribe_status();
    let (callback, rx) = frame_channel();

    driver.start(callback).unwrap();
    control.set_auto_fill(Some(Duration::from_millis(5)));
    let (frames, rx) = tokio::task::spawn_blocking(move || {
        let frames = recv_frames(&rx, 3, Duration::from_secs(5));
        (frames, rx)
    })
    .await
    .unwrap();
    let last_before = frames.last().unwrap().metadata.frame_number;

    control.clear_logs();
    control.fail_next_opens(4);
    control.disconnect();

    timeout(
        Duration::from_secs(5),
        status.wait_for(|s| *s == ConnectionStatus::Reconnecting),
    )
    .await
    .expect("never reconnecting")
    .unwrap();
    timeout(
        Duration::from_secs(5),
        status.wait_for(|s| *s == ConnectionStatus::Connected),
    )
    .await
    .expect("never reconnected")
    .unwrap();

    let after = tokio::task::spawn_blocking(move || recv_frames(&rx, 2, Duration::from_secs(5)))
        .await
        .unwrap();
    assert!(after[0].metadata.frame_number > last_before);

    driver.stop();
    driver.wait_stopped(JOIN_TIMEOUT).unwrap();

    let written: Vec<String> = control.set_log().into_iter().map(|(n, _)| n).collect();
    for name in ALL_SETTINGS {
        assert!(written.iter().any(|w| w == name), "{name} not re-applied");
    }
    assert_eq!(control.open_count(), 5);
    assert_eq!(driver.stats().reconnections, 1);
    assert_eq!(driver.connection_state(), ConnectionState::Connected);
}

#[test]
fn second_reconnect_while_reconnecting_is_a_noop() {
    let tracker = Arc::new(ConnectionTracker::new(StatusPublisher::new()));
    let cancel = CancelToken::new();

    let mut first = MockCamera::new("first");
    let first_control = first.control();
    first_control.disconnect();
    first_control.fail_next_opens(10);

    let worker = {
        let tracker = tracker.clone();
        let cancel = cancel.clone();
        std::thread::spawn(move || {
            let (tx, _rx) = watch::channel(Telemetry::default());
            let mut telemetry = TelemetryPoller::new(Duration::from_secs(5), tx);
            let mut snapshot = None;
            Reconnector::new(&tracker, &cancel, Duration::from_millis(20), None).reconnect(
                &mut first,
                &mut telemetry,
                &mut snapshot,
            )
        })
    };
    assert!(wait_until(Duration::from_secs(2), || {
        tracker.state() == ConnectionState::Reconnecting
    }));

    let mut second = MockCamera::new("second");
    let second_control = second.control();
    let (tx, _rx) = watch::channel(Telemetry::default());
    let mut telemetry = TelemetryPoller::new(Duration::from_secs(5), tx);
    let outcome = Reconnector::new(&tracker, &cancel, Duration::from_millis(20), None)
        .reconnect(&mut second, &mut telemetry, &mut None)
        .unwrap();
    assert_eq!(outcome, ReconnectOutcome::AlreadyInProgress);
    assert_eq!(second_control.open_count(), 0);

    let outcome = worker.join().unwrap().unwrap();
    assert_eq!(outcome, ReconnectOutcome::Reconnected { attempts: 11 });
    assert_eq!(tracker.state(), ConnectionState::Connected);
}

#[test]
fn stop_during_reconnection_ends_cleanly() {
    let mut config = fast_config();
    config.reconnect_backoff = Duration::from_millis(30);
    let (driver, control) = mock_driver(config);
    driver.start(|_| {}).unwrap();

    control.fail_next_opens(u32::MAX);
    control.disconnect();
    assert!(wait_until(Duration::from_secs(2), || {
        driver.connection_state() == ConnectionState::Reconnecting
    }));

    driver.stop();
    driver.wait_stopped(JOIN_TIMEOUT).unwrap();
    assert_eq!(driver.connection_state(), ConnectionState::LostPending);
    assert_eq!(*driver.subscribe_status().borrow(), ConnectionStatus::Disconnected);
}
