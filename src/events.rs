//! Upward interface toward application logic
//!
//! All four callbacks fire exclusively from
//! [`ConnectionManager::synchronize`](crate::manager::ConnectionManager::synchronize),
//! serially, on the application thread. Reactor threads never invoke user
//! code, so subscriber state can be mutated freely inside a callback without
//! cross-thread races.
//!
//! Each callback receives the manager itself, so handlers can send,
//! broadcast or schedule closes from within the pass:
//!
//! ```rust
//! use lockstep_sockets::{ConnectionManager, SocketEvents, SocketId};
//!
//! struct Echo;
//!
//! impl SocketEvents for Echo {
//!     fn on_packet(&mut self, net: &mut ConnectionManager, socket: SocketId, payload: &[u8]) {
//!         let _ = net.send_framed(socket, payload);
//!     }
//! }
//! ```

use crate::error::DisconnectReason;
use crate::manager::ConnectionManager;
use crate::socket::SocketId;

/// Receiver of per-tick network events.
pub trait SocketEvents {
    /// Raw bytes as they arrived, before de-framing.
    ///
    /// Useful for traffic inspection; most applications only implement
    /// [`on_packet`](Self::on_packet).
    fn on_stream(&mut self, _net: &mut ConnectionManager, _socket: SocketId, _bytes: &[u8]) {}

    /// One complete framed message.
    fn on_packet(&mut self, net: &mut ConnectionManager, socket: SocketId, payload: &[u8]);

    /// A listener accepted an inbound connection.
    ///
    /// `accepted` is already live and will start receiving on the next pass.
    fn on_accept(&mut self, _net: &mut ConnectionManager, _listener: SocketId, _accepted: SocketId) {
    }

    /// The connection is gone. Fires exactly once per lost socket; no
    /// partial or garbled packets are delivered for a connection that
    /// failed mid-frame.
    fn on_disconnect(
        &mut self,
        _net: &mut ConnectionManager,
        _socket: SocketId,
        _reason: DisconnectReason,
    ) {
    }
}
