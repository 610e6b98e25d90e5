#![deny(unsafe_op_in_unsafe_fn)]

//! Tick-synchronized TCP transport with a completion reactor
//!
//! Sockets are driven by background reactor threads, but every user-visible
//! event is delivered from [`ConnectionManager::synchronize`], serially, on
//! the application thread. The byte stream is cut into length-prefixed
//! frames; handles are generation-checked so a stale [`SocketId`] can never
//! touch a recycled socket.

pub mod buffer_pool;
pub mod config;
pub mod error;
pub mod events;
pub mod frame;
pub mod manager;
mod raw; // OS-level socket helpers (Unix/Windows)
mod socket;

cfg_if::cfg_if! {
    if #[cfg(feature = "mio-runtime")] {
        pub mod rt { pub use crate::rt_mio::*; }
        mod rt_mio;
    } else {
        compile_error!("Enable the mio-runtime feature");
    }
}

/// Convenience re-exports
pub use config::NetConfig;
pub use error::{DisconnectReason, FrameError, NetError};
pub use events::SocketEvents;
pub use frame::Packetizer;
pub use manager::ConnectionManager;
pub use socket::{SocketId, SocketState};
