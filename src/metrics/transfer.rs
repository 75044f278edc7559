//! Graceful metrics handoff: a process preparing to restart streams every
//! registered counter, gauge and histogram to its successor over a local
//! socket.
//!
//! Transfer protocol:
//!   request:  4-byte big-endian length, then a msgpack-encoded
//!             `Vec<TransferStats>` (self-describing, field names included)
//!   response: 1 status byte (0 ok, 1 failed)

use super::{get_all, get_or_create, Stats};
use serde_derive::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};

const METRICS_COUNTER: &str = "counter";
const METRICS_GAUGE: &str = "gauge";
const METRICS_HISTOGRAM: &str = "histogram";

/// Matches the read timeout a connection would have waited out before the
/// listener can assume no more senders will show up.
const CONN_READ_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct TransferStats {
    pub typ: String,
    pub labels: Vec<(String, String)>,
    pub data: Vec<TransferData>,
}

/// One metric inside a bundle; histograms carry their whole sample.
#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct TransferData {
    pub kind: String,
    pub key: String,
    pub values: Vec<i64>,
}

fn make_transfer_data() -> Result<Vec<u8>, rmp_serde::encode::Error> {
    let all = get_all();
    let mut transfers = Vec::with_capacity(all.len());
    for stats in all {
        transfers.push(dump_stats(&stats));
    }
    rmp_serde::to_vec_named(&transfers)
}

fn dump_stats(stats: &Arc<Stats>) -> TransferStats {
    let mut data = Vec::new();
    stats.each_counter(|key, c| {
        data.push(TransferData {
            kind: METRICS_COUNTER.to_string(),
            key: key.to_string(),
            values: vec![c.count()],
        });
    });
    stats.each_gauge(|key, g| {
        data.push(TransferData {
            kind: METRICS_GAUGE.to_string(),
            key: key.to_string(),
            values: vec![g.value()],
        });
    });
    stats.each_histogram(|key, h| {
        data.push(TransferData {
            kind: METRICS_HISTOGRAM.to_string(),
            key: key.to_string(),
            values: h.sample_values(),
        });
    });
    TransferStats { typ: stats.typ().to_string(), labels: stats.labels().to_vec(), data }
}

fn read_transfer_data(body: &[u8]) -> Result<(), rmp_serde::decode::Error> {
    let transfers: Vec<TransferStats> = rmp_serde::from_slice(body)?;
    for transfer in transfers {
        let labels: Vec<(&str, &str)> =
            transfer.labels.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        let stats = get_or_create(&transfer.typ, &labels);
        for metric in transfer.data {
            match metric.kind.as_str() {
                METRICS_COUNTER => {
                    if let Some(v) = metric.values.first() {
                        stats.counter(&metric.key).inc(*v);
                    }
                }
                METRICS_GAUGE => {
                    if let Some(v) = metric.values.first() {
                        stats.gauge(&metric.key).update(*v);
                    }
                }
                METRICS_HISTOGRAM => {
                    let h = stats.histogram(&metric.key);
                    for v in metric.values {
                        h.update(v);
                    }
                }
                _ => {} // unsupported metric kind, ignore
            }
        }
    }
    Ok(())
}

/// Listen on `path` for metrics from the outgoing process. The listener
/// exits after `2 * graceful_period` plus the connection read timeout plus
/// 10 seconds of slack.
pub async fn transfer_server(path: &Path, graceful_period: Duration) {
    let _ = std::fs::remove_file(path);
    let listener = match UnixListener::bind(path) {
        Ok(l) => l,
        Err(e) => {
            error!("transfer metrics listen {:?} error: {}", path, e);
            return;
        }
    };
    info!("transfer metrics server start on {:?}", path);
    let accept_loop = async move {
        loop {
            match listener.accept().await {
                Ok((conn, _)) => {
                    tokio::spawn(async move {
                        serve_conn(conn).await;
                    });
                }
                Err(e) => {
                    error!("transfer metrics accept error: {}", e);
                    return;
                }
            }
        }
    };
    let deadline = 2 * graceful_period + CONN_READ_TIMEOUT + Duration::from_secs(10);
    let _ = tokio::time::timeout(deadline, accept_loop).await;
    info!("transfer metrics server exit");
}

async fn serve_conn(mut conn: UnixStream) {
    let status: u8 = match handle(&mut conn).await {
        Ok(_) => 0,
        Err(_) => 1,
    };
    let _ = conn.write_all(&[status]).await;
}

async fn handle(conn: &mut UnixStream) -> Result<(), ()> {
    let mut header = [0u8; 4];
    conn.read_exact(&mut header).await.map_err(|e| {
        error!("transfer metrics read header error: {}", e);
    })?;
    let size = u32::from_be_bytes(header) as usize;
    let mut body = vec![0u8; size];
    conn.read_exact(&mut body).await.map_err(|e| {
        error!("transfer metrics read body error: {}", e);
    })?;
    read_transfer_data(&body).map_err(|e| {
        error!("transfer metrics parse body error: {}", e);
    })
}

/// Send all registered metrics to the successor process listening on
/// `path`. With `wait` the 1-byte status reply is awaited under `timeout`;
/// otherwise fire-and-forget.
pub async fn transfer_metrics(path: &Path, wait: bool, timeout: Duration) {
    let body = match make_transfer_data() {
        Ok(b) => b,
        Err(e) => {
            error!("transfer metrics encode error: {}", e);
            return;
        }
    };
    let mut conn = match UnixStream::connect(path).await {
        Ok(c) => c,
        Err(e) => {
            error!("transfer metrics dial unix socket failed: {}", e);
            return;
        }
    };
    let header = (body.len() as u32).to_be_bytes();
    if let Err(e) = conn.write_all(&header).await {
        error!("transfer metrics send header error: {}", e);
        return;
    }
    if let Err(e) = conn.write_all(&body).await {
        error!("transfer metrics send body error: {}", e);
        return;
    }
    if wait {
        let mut resp = [0u8; 1];
        match tokio::time::timeout(timeout, conn.read_exact(&mut resp)).await {
            Ok(Ok(_)) => {
                info!("transfer metrics got response status: {}", resp[0]);
            }
            Ok(Err(e)) => {
                error!("transfer metrics get response error: {}", e);
            }
            Err(_) => {
                error!("transfer metrics wait response timeout");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_roundtrip_encoding() {
        let s = get_or_create("test_transfer_enc", &[("cluster", "c1")]);
        s.counter("reqs").inc(7);
        s.gauge("depth").update(3);
        s.histogram("dur").update(12);
        let dumped = dump_stats(&s);
        assert_eq!(dumped.typ, "test_transfer_enc");
        assert_eq!(dumped.data.len(), 3);
        let body = rmp_serde::to_vec_named(&vec![dumped]).expect("encode");
        let parsed: Vec<TransferStats> = rmp_serde::from_slice(&body).expect("decode");
        assert_eq!(parsed.len(), 1);
        let reqs = parsed[0].data.iter().find(|d| d.key == "reqs").expect("reqs");
        assert_eq!(reqs.values, vec![7]);
    }
}
