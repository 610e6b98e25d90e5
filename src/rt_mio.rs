//! Mio-based completion reactor
//!
//! One poller thread blocks on [`mio::Poll::poll`], the OS completion-wait
//! primitive (epoll on Linux, kqueue on macOS/BSD, IOCP on Windows), and
//! forwards each readiness completion to a small fixed pool of
//! worker threads. Workers resolve the owning socket through its
//! generation-checked correlation token, perform the non-blocking transfer,
//! and append the result to that socket's staging queues under the socket's
//! own lock. Nothing here ever calls user code; user-visible events are
//! emitted exclusively by the synchronize pass on the application thread.
//!
//! Submissions from the application thread ([`Job::Receive`], [`Job::Send`],
//! [`Job::Accept`]) travel over the same channel as readiness completions,
//! so every piece of socket I/O runs off the application thread. A
//! [`Job::Shutdown`] sentinel is posted once per worker at teardown, and a
//! [`mio::Waker`] unblocks the poller.
//!
//! Completions addressed to a socket that is already scheduled for
//! destruction are no-ops, never errors: the destroy queue keeps the core
//! allocated until such stragglers cannot exist anymore.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, error, trace, warn};
use mio::{Events, Poll, Registry, Token, Waker};

use crate::buffer_pool::BufferPool;
use crate::config::NetConfig;
use crate::error::DisconnectReason;
use crate::socket::{Endpoint, IoState, SocketCore, SocketId, Table};

/// Token reserved for the shutdown waker. Unreachable by socket handles in
/// practice: it would require both slot index and generation at their maxima.
const WAKER_TOKEN: Token = Token(usize::MAX);

const EVENTS_CAPACITY: usize = 1024;

/// An operation submitted to the reactor, or a completion routed to a worker.
pub enum Job {
    /// Readiness completion from the poller, addressed by correlation token.
    Readiness {
        token: Token,
        readable: bool,
        writable: bool,
    },
    /// Issue the next asynchronous receive on a connected socket.
    Receive(SocketId),
    /// Flush the socket's outbound queue.
    Send(SocketId),
    /// (Re-)arm accept on a listener.
    Accept(SocketId),
    /// Close sentinel; terminates exactly one worker thread.
    Shutdown,
}

/// The completion reactor: poller thread, worker pool and submission queue.
///
/// Owned by the `ConnectionManager` with an explicit lifetime: construction
/// spawns the threads, drop joins them. There is no process-wide reactor
/// state, so multiple independent managers can coexist (the tests rely on
/// this).
pub struct Reactor {
    registry: Registry,
    jobs: Sender<Job>,
    waker: Waker,
    shutdown: Arc<AtomicBool>,
    poller: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
}

impl Reactor {
    pub(crate) fn new(cfg: &NetConfig, table: Arc<Table>, pool: BufferPool) -> io::Result<Self> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        let shutdown = Arc::new(AtomicBool::new(false));
        let (jobs, job_rx) = unbounded::<Job>();

        let worker_count = cfg.reactor_workers.max(1);
        let mut workers = Vec::with_capacity(worker_count);
        for i in 0..worker_count {
            let rx = job_rx.clone();
            let table = Arc::clone(&table);
            let pool = pool.clone();
            let recv_chunk = cfg.recv_chunk;
            workers.push(
                thread::Builder::new()
                    .name(format!("net-worker-{i}"))
                    .spawn(move || worker_loop(rx, table, pool, recv_chunk))?,
            );
        }

        let poller = {
            let jobs = jobs.clone();
            let shutdown = Arc::clone(&shutdown);
            let timeout = Duration::from_millis(cfg.poll_timeout_ms);
            thread::Builder::new()
                .name("net-poller".into())
                .spawn(move || poller_loop(poll, jobs, shutdown, worker_count, timeout))?
        };

        Ok(Self {
            registry,
            jobs,
            waker,
            shutdown,
            poller: Some(poller),
            workers,
        })
    }

    /// Registry handle for registering sockets from the application thread.
    pub(crate) fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Submits an operation. Returns immediately; results arrive through the
    /// owning socket's staging queues.
    pub(crate) fn submit(&self, job: Job) {
        // Send only fails after shutdown, when completions no longer matter.
        let _ = self.jobs.send(job);
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let _ = self.waker.wake();
        if let Some(handle) = self.poller.take() {
            let _ = handle.join();
        }
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn poller_loop(
    mut poll: Poll,
    jobs: Sender<Job>,
    shutdown: Arc<AtomicBool>,
    worker_count: usize,
    timeout: Duration,
) {
    let mut events = Events::with_capacity(EVENTS_CAPACITY);
    loop {
        if let Err(e) = poll.poll(&mut events, Some(timeout)) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            error!("completion wait failed: {e}");
            break;
        }
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        for event in events.iter() {
            if event.token() == WAKER_TOKEN {
                continue;
            }
            trace!(
                "completion token={:?} readable={} writable={}",
                event.token(),
                event.is_readable(),
                event.is_writable()
            );
            let _ = jobs.send(Job::Readiness {
                token: event.token(),
                readable: event.is_readable(),
                writable: event.is_writable(),
            });
        }
    }
    // One close sentinel per worker ends the pool cleanly.
    for _ in 0..worker_count {
        let _ = jobs.send(Job::Shutdown);
    }
    debug!("poller thread exiting");
}

fn worker_loop(jobs: Receiver<Job>, table: Arc<Table>, pool: BufferPool, recv_chunk: usize) {
    while let Ok(job) = jobs.recv() {
        match job {
            Job::Shutdown => break,
            Job::Readiness {
                token,
                readable,
                writable,
            } => {
                // Stale tokens and already-closed sockets resolve to nothing;
                // the late completion is dropped here.
                let Some(core) = table.lookup_token(token) else {
                    continue;
                };
                if readable {
                    on_readable(&core, &pool, recv_chunk);
                }
                if writable {
                    on_writable(&core);
                }
            }
            Job::Receive(id) => {
                if let Some(core) = table.lookup(id) {
                    submit_receive(&core, &pool, recv_chunk);
                }
            }
            Job::Send(id) => {
                if let Some(core) = table.lookup(id) {
                    flush_sends(&core);
                }
            }
            Job::Accept(id) => {
                if let Some(core) = table.lookup(id) {
                    drain_accepts(&core);
                }
            }
        }
    }
}

fn on_readable(core: &SocketCore, pool: &BufferPool, recv_chunk: usize) {
    if core.is_closed() {
        return;
    }
    let mut io = core.io();
    match io.endpoint {
        Some(Endpoint::Listener(_)) => {
            drop(io);
            drain_accepts(core);
        }
        Some(Endpoint::Stream(_)) => {
            // Data is only pulled when a receive was submitted; otherwise it
            // stays in the kernel until the next synchronize pass arms one.
            if io.recv_armed {
                let outcome = try_recv(&mut io, pool, recv_chunk);
                drop(io);
                apply_recv(core, outcome);
            }
        }
        None => {}
    }
}

fn on_writable(core: &SocketCore) {
    if core.is_closed() {
        return;
    }
    let mut io = core.io();
    if io.connect_pending {
        let result = finalize_connect(&mut io);
        drop(io);
        if let Some(result) = result {
            debug!("connect completion for {:?} ok={}", core.id(), result.is_ok());
            core.stage_connect_result(result);
        }
        return;
    }
    if io.want_write {
        drop(io);
        flush_sends(core);
    }
}

fn submit_receive(core: &SocketCore, pool: &BufferPool, recv_chunk: usize) {
    if core.is_closed() {
        return;
    }
    let mut io = core.io();
    if io.recv_armed {
        // One receive in flight per socket, always.
        return;
    }
    let outcome = try_recv(&mut io, pool, recv_chunk);
    drop(io);
    apply_recv(core, outcome);
}

enum RecvOutcome {
    /// Nothing completed yet; the receive stays armed (or there was no
    /// stream to read from).
    Pending,
    /// One chunk arrived.
    Chunk(Vec<u8>),
    /// The transfer reported end-of-stream or a transport failure.
    Closed(DisconnectReason),
}

fn try_recv(io: &mut IoState, pool: &BufferPool, recv_chunk: usize) -> RecvOutcome {
    let Some(Endpoint::Stream(stream)) = io.endpoint.as_mut() else {
        return RecvOutcome::Pending;
    };
    let mut buf = pool.acquire();
    buf.resize(recv_chunk, 0);
    loop {
        match stream.read(&mut buf) {
            Ok(0) => {
                io.recv_armed = false;
                pool.release(buf);
                return RecvOutcome::Closed(DisconnectReason::GracefulEof);
            }
            Ok(n) => {
                buf.truncate(n);
                io.recv_armed = false;
                return RecvOutcome::Chunk(buf);
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                pool.release(buf);
                io.recv_armed = true;
                return RecvOutcome::Pending;
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                io.recv_armed = false;
                pool.release(buf);
                return RecvOutcome::Closed(DisconnectReason::from_io(&e));
            }
        }
    }
}

fn apply_recv(core: &SocketCore, outcome: RecvOutcome) {
    match outcome {
        RecvOutcome::Pending => {}
        RecvOutcome::Chunk(chunk) => {
            trace!("{} bytes staged for {:?}", chunk.len(), core.id());
            core.stage_chunk(chunk);
        }
        RecvOutcome::Closed(reason) => {
            debug!("transport closed for {:?}: {reason}", core.id());
            core.stage_disconnect(reason);
        }
    }
}

fn flush_sends(core: &SocketCore) {
    if core.is_closed() {
        return;
    }
    let mut io = core.io();
    let mut failed = None;
    {
        let IoState {
            endpoint,
            pending_sends,
            send_cursor,
            want_write,
            ..
        } = &mut *io;
        let Some(Endpoint::Stream(stream)) = endpoint.as_mut() else {
            return;
        };
        *want_write = false;
        while let Some(front) = pending_sends.front() {
            let data = front.as_slice();
            if *send_cursor >= data.len() {
                pending_sends.pop_front();
                *send_cursor = 0;
                continue;
            }
            match stream.write(&data[*send_cursor..]) {
                Ok(n) => {
                    *send_cursor += n;
                    if *send_cursor == data.len() {
                        pending_sends.pop_front();
                        *send_cursor = 0;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    *want_write = true;
                    break;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    failed = Some(DisconnectReason::from_io(&e));
                    break;
                }
            }
        }
    }
    drop(io);
    if let Some(reason) = failed {
        debug!("send failed for {:?}: {reason}", core.id());
        core.stage_disconnect(reason);
    }
}

/// Checks whether an asynchronous connect finished. `None` means the
/// writability was spurious and the connect is still in flight.
fn finalize_connect(io: &mut IoState) -> Option<io::Result<()>> {
    let Some(Endpoint::Stream(stream)) = io.endpoint.as_mut() else {
        return None;
    };
    match stream.take_error() {
        Ok(Some(e)) => {
            io.connect_pending = false;
            Some(Err(e))
        }
        Err(e) => {
            io.connect_pending = false;
            Some(Err(e))
        }
        Ok(None) => match stream.peer_addr() {
            Ok(_) => {
                io.connect_pending = false;
                Some(Ok(()))
            }
            Err(ref e) if e.kind() == io::ErrorKind::NotConnected => None,
            Err(e) => {
                io.connect_pending = false;
                Some(Err(e))
            }
        },
    }
}

fn drain_accepts(core: &SocketCore) {
    if core.is_closed() {
        return;
    }
    let mut accepted = Vec::new();
    {
        let mut io = core.io();
        let Some(Endpoint::Listener(listener)) = io.endpoint.as_mut() else {
            return;
        };
        // Accept until the backlog is drained; looping re-arms the next
        // accept, so listening self-perpetuates without application help.
        loop {
            match listener.accept() {
                Ok(pair) => accepted.push(pair),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("accept failed on {:?}: {e}", core.id());
                    break;
                }
            }
        }
    }
    for (stream, peer) in accepted {
        debug!("accepted {peer} on listener {:?}", core.id());
        core.stage_accept(stream, peer);
    }
}
