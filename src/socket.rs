//! Per-socket state shared between the application thread and the reactor
//!
//! A socket is split in two along the thread boundary:
//!
//! - The *table entry* ([`Entry`] inside [`Table`]) is owned by the
//!   `ConnectionManager` and mutated only on the application thread.
//! - The *core* ([`SocketCore`]) is reference-counted and shared with the
//!   reactor workers, which look it up through the table by stable index and
//!   only ever touch its internal queues under the socket's own locks.
//!
//! The correlation key handed to the OS is a [`SocketId`]: a stable table
//! index plus a generation counter. A completion that arrives after the slot
//! was freed and reused carries a stale generation and is ignored instead of
//! silently hitting an unrelated socket.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use mio::net::{TcpListener, TcpStream};
use mio::Token;
use slab::Slab;

use crate::error::DisconnectReason;
use crate::frame::Packetizer;

// Token packing puts the generation in the upper half of the word.
const _: () = assert!(usize::BITS >= 64, "token packing requires 64-bit usize");

/// Stable, generation-checked handle to a socket.
///
/// The index is immutable for the socket's entire lifetime, including the
/// time it spends on the destroy queue. Slots are reused, but each reuse
/// bumps the generation, so a stale handle never resolves.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SocketId {
    index: u32,
    generation: u32,
}

impl SocketId {
    pub(crate) fn new(index: usize, generation: u32) -> Self {
        Self {
            index: index as u32,
            generation,
        }
    }

    /// The socket's slot in the connection table.
    pub fn index(self) -> usize {
        self.index as usize
    }

    pub(crate) fn generation(self) -> u32 {
        self.generation
    }

    /// Packs the handle into the correlation token submitted to the OS.
    pub(crate) fn token(self) -> Token {
        Token(((self.generation as usize) << 32) | self.index as usize)
    }

    pub(crate) fn from_token(token: Token) -> Self {
        Self {
            index: (token.0 & 0xffff_ffff) as u32,
            generation: (token.0 >> 32) as u32,
        }
    }
}

/// Lifecycle of a socket.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SocketState {
    /// Allocated but not yet bound or connected.
    Constructed,
    /// Bound and accepting inbound connections.
    Listening,
    /// Connect submitted, waiting for the OS to confirm.
    Connecting,
    /// Live bidirectional stream.
    Connected,
    /// On the destroy queue; no further operations are submitted.
    Disconnecting,
    /// Freed by the synchronize pass.
    Destroyed,
}

/// An outbound buffer queued on a socket.
///
/// Broadcast enqueues a shared reference into many queues so the payload is
/// stored exactly once; direct sends own their bytes.
#[derive(Debug)]
pub(crate) enum SendBuffer {
    Owned(Vec<u8>),
    Shared(Arc<Vec<u8>>),
}

impl SendBuffer {
    pub(crate) fn as_slice(&self) -> &[u8] {
        match self {
            SendBuffer::Owned(v) => v,
            SendBuffer::Shared(v) => v,
        }
    }
}

/// The OS endpoint behind a socket.
#[derive(Debug)]
pub(crate) enum Endpoint {
    Stream(TcpStream),
    Listener(TcpListener),
}

/// I/O-side state, touched by reactor workers and by submit calls.
#[derive(Debug, Default)]
pub(crate) struct IoState {
    pub endpoint: Option<Endpoint>,
    /// A receive has been submitted and has not completed yet. At most one
    /// receive is in flight per socket.
    pub recv_armed: bool,
    /// Connect submitted, completion (first writability) still pending.
    pub connect_pending: bool,
    /// Outbound FIFO; buffers flush in submission order.
    pub pending_sends: VecDeque<SendBuffer>,
    /// Bytes of the front buffer already handed to the OS.
    pub send_cursor: usize,
    /// A previous flush hit `WouldBlock`; finish on the next writability.
    pub want_write: bool,
}

/// Completion staging, appended by reactor workers and drained once per tick
/// by the synchronize pass. User callbacks never fire from here.
#[derive(Debug, Default)]
pub(crate) struct Staging {
    /// Raw received chunks, in arrival order.
    pub stream: Vec<Vec<u8>>,
    /// Inbound connections accepted on behalf of a listener.
    pub accepted: Vec<(TcpStream, SocketAddr)>,
    /// First transport failure observed; later ones are dropped so the
    /// application sees exactly one disconnect.
    pub disconnect: Option<DisconnectReason>,
    /// Outcome of an asynchronous connect.
    pub connected: Option<io::Result<()>>,
}

/// Application-side state, touched only during the synchronize pass.
#[derive(Debug)]
pub(crate) struct AppState {
    pub state: SocketState,
    pub packetizer: Packetizer,
    /// Mirrors `IoState::recv_armed` from the application thread's view:
    /// set when a receive is submitted, cleared when its completion drains.
    pub recv_outstanding: bool,
    pub peer: Option<SocketAddr>,
}

/// The shared half of a socket.
pub(crate) struct SocketCore {
    id: SocketId,
    /// Set once the socket is scheduled for closing; workers treat any
    /// completion for a closed core as a no-op.
    closed: AtomicBool,
    io: Mutex<IoState>,
    staging: Mutex<Staging>,
    app: Mutex<AppState>,
}

impl SocketCore {
    pub(crate) fn new(id: SocketId, max_frame_len: usize) -> Self {
        Self {
            id,
            closed: AtomicBool::new(false),
            io: Mutex::new(IoState::default()),
            staging: Mutex::new(Staging::default()),
            app: Mutex::new(AppState {
                state: SocketState::Constructed,
                packetizer: Packetizer::new(max_frame_len),
                recv_outstanding: false,
                peer: None,
            }),
        }
    }

    pub(crate) fn id(&self) -> SocketId {
        self.id
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub(crate) fn io(&self) -> MutexGuard<'_, IoState> {
        self.io.lock().unwrap()
    }

    pub(crate) fn app(&self) -> MutexGuard<'_, AppState> {
        self.app.lock().unwrap()
    }

    pub(crate) fn state(&self) -> SocketState {
        self.app().state
    }

    pub(crate) fn set_state(&self, state: SocketState) {
        self.app().state = state;
    }

    /// Appends an outbound buffer; the flush is issued by the next
    /// synchronize pass.
    pub(crate) fn enqueue(&self, buf: SendBuffer) {
        self.io().pending_sends.push_back(buf);
    }

    pub(crate) fn pending_send_len(&self) -> usize {
        self.io().pending_sends.len()
    }

    pub(crate) fn stage_chunk(&self, chunk: Vec<u8>) {
        self.staging.lock().unwrap().stream.push(chunk);
    }

    pub(crate) fn stage_accept(&self, stream: TcpStream, peer: SocketAddr) {
        self.staging.lock().unwrap().accepted.push((stream, peer));
    }

    pub(crate) fn stage_disconnect(&self, reason: DisconnectReason) {
        let mut staging = self.staging.lock().unwrap();
        if staging.disconnect.is_none() {
            staging.disconnect = Some(reason);
        }
    }

    pub(crate) fn stage_connect_result(&self, result: io::Result<()>) {
        self.staging.lock().unwrap().connected = Some(result);
    }

    /// Takes everything staged since the last pass.
    pub(crate) fn take_staged(&self) -> Staging {
        std::mem::take(&mut *self.staging.lock().unwrap())
    }
}

impl std::fmt::Debug for SocketCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketCore")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// A live slot in the connection table.
pub(crate) struct Entry {
    pub generation: u32,
    pub core: Arc<SocketCore>,
}

/// The socket table.
///
/// Slots are allocated by index (slab), never moved, and reused only after
/// a generation bump; reactor threads therefore perform read-only lookups
/// by stable index while the application thread alone inserts and removes.
pub(crate) struct Table {
    slots: RwLock<Slab<Entry>>,
}

impl Table {
    pub(crate) fn new() -> Self {
        Self {
            slots: RwLock::new(Slab::new()),
        }
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, Slab<Entry>> {
        self.slots.read().unwrap()
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, Slab<Entry>> {
        self.slots.write().unwrap()
    }

    /// Generation-checked lookup; stale handles resolve to `None`.
    pub(crate) fn lookup(&self, id: SocketId) -> Option<Arc<SocketCore>> {
        self.read()
            .get(id.index())
            .filter(|entry| entry.generation == id.generation())
            .map(|entry| Arc::clone(&entry.core))
    }

    pub(crate) fn lookup_token(&self, token: Token) -> Option<Arc<SocketCore>> {
        self.lookup(SocketId::from_token(token))
    }

    pub(crate) fn len(&self) -> usize {
        self.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_roundtrip() {
        let id = SocketId::new(42, 7);
        assert_eq!(SocketId::from_token(id.token()), id);

        let id = SocketId::new(0, 0);
        assert_eq!(SocketId::from_token(id.token()), id);

        let id = SocketId::new(usize::from(u16::MAX), u32::MAX);
        assert_eq!(SocketId::from_token(id.token()), id);
    }

    #[test]
    fn test_stale_generation_does_not_resolve() {
        let table = Table::new();
        let id = {
            let mut slots = table.write();
            let index = slots.vacant_key();
            let id = SocketId::new(index, 3);
            slots.insert(Entry {
                generation: 3,
                core: Arc::new(SocketCore::new(id, 1024)),
            });
            id
        };
        assert!(table.lookup(id).is_some());

        // Same slot, older generation: must not resolve.
        let stale = SocketId::new(id.index(), 2);
        assert!(table.lookup(stale).is_none());
        assert!(table.lookup_token(stale.token()).is_none());
    }

    #[test]
    fn test_single_disconnect_is_kept() {
        let core = SocketCore::new(SocketId::new(0, 0), 1024);
        core.stage_disconnect(DisconnectReason::Reset);
        core.stage_disconnect(DisconnectReason::GracefulEof);
        let staged = core.take_staged();
        assert_eq!(staged.disconnect, Some(DisconnectReason::Reset));
        // Drained: the next pass sees nothing.
        assert!(core.take_staged().disconnect.is_none());
    }

    #[test]
    fn test_send_queue_order() {
        let core = SocketCore::new(SocketId::new(0, 0), 1024);
        core.enqueue(SendBuffer::Owned(vec![1]));
        core.enqueue(SendBuffer::Shared(Arc::new(vec![2])));
        core.enqueue(SendBuffer::Owned(vec![3]));
        let io = core.io();
        let order: Vec<u8> = io.pending_sends.iter().map(|b| b.as_slice()[0]).collect();
        assert_eq!(order, vec![1, 2, 3]);
    }
}
