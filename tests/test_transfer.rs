mod common;

use captains_log::logfn;
use common::*;
use mesh_stream::metrics::{self, transfer};
use rstest::*;
use std::sync::Mutex;
use std::time::Duration;

// the metrics registry is process-wide; keep these tests serialized
static SERIAL: Mutex<()> = Mutex::new(());

/// Full handoff over the unix socket. The sender and the receiver share
/// this process's registry, so applying the snapshot doubles the counters
/// and replays the histogram sample on top of itself.
#[logfn]
#[rstest]
fn test_transfer_over_socket(runner: TestRunner) {
    let _guard = SERIAL.lock().unwrap();
    runner.block_on(async {
        metrics::reset_all();
        let stats = metrics::get_or_create("transfer_socket", &[("cluster", "c1")]);
        stats.counter("requests").inc(7);
        stats.gauge("depth").update(3);
        let hist = stats.histogram("duration");
        for v in [5, 10, 15] {
            hist.update(v);
        }

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("stats.sock");
        let server_path = path.clone();
        let server = tokio::spawn(async move {
            transfer::transfer_server(&server_path, Duration::from_secs(1)).await;
        });
        // wait for the listener
        tokio::time::sleep(Duration::from_millis(200)).await;

        transfer::transfer_metrics(&path, true, Duration::from_secs(5)).await;

        assert_eq!(stats.counter("requests").count(), 14);
        assert_eq!(stats.gauge("depth").value(), 3);
        assert_eq!(stats.histogram("duration").sample_values().len(), 6);

        server.abort();
        metrics::reset_all();
    });
}

/// Fire-and-forget: the sender returns without reading the status byte and
/// the record still lands.
#[logfn]
#[rstest]
fn test_transfer_no_wait(runner: TestRunner) {
    let _guard = SERIAL.lock().unwrap();
    runner.block_on(async {
        metrics::reset_all();
        let stats = metrics::get_or_create("transfer_nowait", &[("cluster", "c2")]);
        stats.counter("requests").inc(2);

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("stats.sock");
        let server_path = path.clone();
        let server = tokio::spawn(async move {
            transfer::transfer_server(&server_path, Duration::from_secs(1)).await;
        });
        tokio::time::sleep(Duration::from_millis(200)).await;

        transfer::transfer_metrics(&path, false, Duration::ZERO).await;

        // give the listener time to apply
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(stats.counter("requests").count(), 4);

        server.abort();
        metrics::reset_all();
    });
}
