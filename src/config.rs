use std::time::Duration;

#[derive(Clone, Default)]
pub struct ProxyConfig {
    pub timeout: TimeoutSetting,
    pub keepalive: KeepAliveConfig,
    /// Read chunk size of a transport connection, 0 means default (8 KiB)
    pub stream_buf_size: usize,
}

#[derive(Clone)]
pub struct TimeoutSetting {
    /// connect timeout
    pub connect_timeout: Duration,
    /// Socket read timeout. An elapsed read deadline on an idle connection
    /// is tolerated, it only lets the reader re-check the close state.
    pub read_timeout: Duration,
    /// socket write timeout
    pub write_timeout: Duration,
}

impl Default for TimeoutSetting {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Clone)]
pub struct KeepAliveConfig {
    /// How long to wait for one heartbeat response
    pub timeout: Duration,
    /// Consecutive heartbeat timeouts before the connection is closed
    pub fail_threshold: u32,
    /// Heartbeats without any application stream before the connection is
    /// considered idle and closed. 0 disables idle-free.
    pub max_idle_count: u32,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self { timeout: Duration::from_secs(3), fail_threshold: 6, max_idle_count: 0 }
    }
}
