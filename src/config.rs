//! Transport configuration and socket tuning
//!
//! [`NetConfig`] gathers everything tunable about the transport: OS socket
//! options, reactor sizing, framing limits and the capacities of the bounded
//! pools. All resource ceilings live here so a deployment can be sized once
//! and observed against those limits.
//!
//! # Examples
//!
//! ```rust
//! use lockstep_sockets::NetConfig;
//!
//! let cfg = NetConfig {
//!     max_frame_len: 64 * 1024,
//!     reactor_workers: 4,
//!     ..Default::default()
//! };
//! assert!(cfg.tcp_nodelay);
//! ```

use std::io;

use crate::raw;

/// Tuning knobs for the transport.
///
/// Platform-specific options are ignored where unsupported rather than
/// causing errors. All bounded resources (socket table, broadcast pool)
/// take their capacities from here.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetConfig {
    /// Enable TCP_NODELAY, disabling Nagle's algorithm.
    ///
    /// **Default**: `true`
    pub tcp_nodelay: bool,

    /// Enable TCP_QUICKACK for faster ACK responses (Linux only).
    ///
    /// **Default**: `true`
    pub tcp_quickack: bool,

    /// Enable SO_REUSEPORT on listeners (Linux/BSD only).
    ///
    /// **Default**: `false`
    pub reuse_port: bool,

    /// Socket receive buffer size in bytes, if overridden.
    ///
    /// **Default**: `Some(4 MiB)`
    pub recv_buf: Option<usize>,

    /// Socket send buffer size in bytes, if overridden.
    ///
    /// **Default**: `Some(4 MiB)`
    pub send_buf: Option<usize>,

    /// TCP listen backlog.
    ///
    /// **Default**: `Some(1024)`
    pub tcp_backlog: Option<i32>,

    /// How long the reactor blocks waiting for completions before rechecking
    /// for shutdown, in milliseconds.
    ///
    /// **Default**: `10`
    pub poll_timeout_ms: u64,

    /// Number of reactor worker threads servicing completions.
    ///
    /// **Default**: `2`
    pub reactor_workers: usize,

    /// Size of a single receive, in bytes. One receive is outstanding per
    /// socket, so this bounds per-socket staging growth between passes.
    ///
    /// **Default**: `64 KiB`
    pub recv_chunk: usize,

    /// Upper bound on a framed payload. Both enforced on send and treated
    /// as a protocol violation when a peer's length prefix exceeds it.
    ///
    /// **Default**: `1 MiB`
    pub max_frame_len: usize,

    /// Broadcast pool capacity: distinct broadcast payloads per tick.
    ///
    /// **Default**: `4096`
    pub broadcast_slots: usize,

    /// Maximum live sockets, listeners included.
    ///
    /// **Default**: `4096`
    pub max_sockets: usize,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            tcp_nodelay: true,
            tcp_quickack: true,
            reuse_port: false,
            recv_buf: Some(4 << 20),
            send_buf: Some(4 << 20),
            tcp_backlog: Some(1024),
            poll_timeout_ms: 10,
            reactor_workers: 2,
            recv_chunk: 64 * 1024,
            max_frame_len: 1 << 20,
            broadcast_slots: 4096,
            max_sockets: 4096,
        }
    }
}

impl NetConfig {
    /// Preset for latency-sensitive workloads: small socket buffers, short
    /// poll timeout, all TCP latency options on.
    pub fn low_latency() -> Self {
        Self {
            recv_buf: Some(256 * 1024),
            send_buf: Some(256 * 1024),
            tcp_backlog: Some(512),
            poll_timeout_ms: 1,
            ..Default::default()
        }
    }

    /// Preset for bulk transfer: large socket buffers, Nagle left on,
    /// relaxed poll timeout.
    pub fn high_throughput() -> Self {
        Self {
            tcp_nodelay: false,
            tcp_quickack: false,
            recv_buf: Some(16 << 20),
            send_buf: Some(16 << 20),
            tcp_backlog: Some(2048),
            poll_timeout_ms: 50,
            recv_chunk: 256 * 1024,
            ..Default::default()
        }
    }
}

/// Applies the configured socket options to a raw OS socket.
///
/// Must run before the handle is wrapped in a standard library type.
/// Options the platform does not support are skipped.
pub(crate) fn apply_socket_tuning(os: raw::OsSocket, cfg: &NetConfig) -> io::Result<()> {
    if let Some(sz) = cfg.recv_buf {
        raw::set_recv_buffer(os, sz as i32)?;
    }
    if let Some(sz) = cfg.send_buf {
        raw::set_send_buffer(os, sz as i32)?;
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        if cfg.reuse_port {
            raw::set_reuse_port(os, true)?;
        }
        if cfg.tcp_quickack {
            // Best effort; absent on older kernels.
            let _ = raw::set_tcp_quickack(os, true);
        }
    }

    if cfg.tcp_nodelay {
        raw::set_tcp_nodelay(os, true)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NetConfig::default();
        assert!(config.tcp_nodelay);
        assert_eq!(config.recv_buf, Some(4 << 20));
        assert_eq!(config.max_frame_len, 1 << 20);
        assert_eq!(config.reactor_workers, 2);
        assert_eq!(config.max_sockets, 4096);
    }

    #[test]
    fn test_low_latency_config() {
        let config = NetConfig::low_latency();
        assert_eq!(config.recv_buf, Some(256 * 1024));
        assert_eq!(config.poll_timeout_ms, 1);
        assert!(config.tcp_nodelay);
    }

    #[test]
    fn test_high_throughput_config() {
        let config = NetConfig::high_throughput();
        assert_eq!(config.recv_buf, Some(16 << 20));
        assert!(!config.tcp_nodelay); // Nagle left on for efficiency
        assert_eq!(config.tcp_backlog, Some(2048));
    }

    #[test]
    fn test_config_clone() {
        let config1 = NetConfig::low_latency();
        let config2 = config1.clone();
        assert_eq!(config1, config2);
    }
}
