//! mio event loop.
//!
//! Readiness-based model: one bounded wait per pass, then every socket in
//! the descriptor set is visited once in order. Ready sockets are read or
//! accepted; the rest are checked for idleness. Accepts and evictions are
//! queued during the scan and applied afterwards, removals first.
//!
//! mio reports edges, while each pass only reads one bounded chunk per
//! socket. Readiness therefore stays latched on the socket until a read or
//! accept returns `WouldBlock`, and the next wait does not block while any
//! socket still has a latch set.

use crate::config::InterfaceConfig;
use crate::error::ServiceError;
use crate::protocol::PayloadTable;
use crate::runtime::connection::{Connection, Progress};
use crate::runtime::descriptors::{DescriptorSet, LISTENER, WAKER};
use crate::runtime::Dispatcher;
use mio::event::Event;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use slab::Slab;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Upper bound for a single read from a client socket.
pub(crate) const READ_CHUNK: usize = 512;

const EVENT_CAPACITY: usize = 256;

pub(crate) struct EventLoop<D> {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    listener_ready: bool,
    connections: Slab<Connection>,
    descriptors: DescriptorSet,
    pending_add: Vec<(TcpStream, SocketAddr)>,
    pending_remove: Vec<Token>,
    table: PayloadTable,
    dispatcher: D,
    poll_interval: Duration,
    idle_timeout: Duration,
    shutdown: Arc<AtomicBool>,
}

impl<D: Dispatcher> EventLoop<D> {
    /// `listener` must already be registered with `poll` under [`LISTENER`].
    pub(crate) fn new(
        poll: Poll,
        listener: TcpListener,
        table: PayloadTable,
        dispatcher: D,
        config: &InterfaceConfig,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            poll,
            events: Events::with_capacity(EVENT_CAPACITY),
            listener,
            listener_ready: false,
            connections: Slab::new(),
            descriptors: DescriptorSet::new(),
            pending_add: Vec::new(),
            pending_remove: Vec::new(),
            table,
            dispatcher,
            poll_interval: config.poll_interval,
            idle_timeout: config.idle_timeout,
            shutdown,
        }
    }

    /// Run until shutdown is requested or a fatal error occurs.
    ///
    /// Every socket, the listener included, is closed when this returns.
    pub(crate) fn run(mut self) -> Result<(), ServiceError> {
        info!(
            idle_timeout_ms = self.idle_timeout.as_millis() as u64,
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "Network loop started"
        );

        let mut result = Ok(());
        while !self.shutdown.load(Ordering::Acquire) {
            if let Err(e) = self.pass() {
                result = Err(e);
                break;
            }
        }

        let open = self.descriptors.connections();
        for mut conn in self.connections.drain() {
            let _ = self.poll.registry().deregister(&mut conn.stream);
        }
        info!(closed = open, "Network loop stopped");

        result
    }

    /// One wait plus one scan of the descriptor set.
    fn pass(&mut self) -> Result<(), ServiceError> {
        let timeout = if self.has_latched_readiness() {
            Duration::ZERO
        } else {
            self.poll_interval
        };

        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(ServiceError::Poll(e)),
        }

        self.latch_events()?;

        let now = Instant::now();
        for idx in 0..self.descriptors.tokens().len() {
            let token = self.descriptors.tokens()[idx];
            if token == LISTENER {
                if self.listener_ready {
                    self.accept_one();
                }
            } else {
                self.service(token, now);
            }
        }

        self.apply_removals()?;
        self.apply_additions();
        Ok(())
    }

    fn has_latched_readiness(&self) -> bool {
        self.listener_ready || self.connections.iter().any(|(_, conn)| conn.readable)
    }

    fn latch_events(&mut self) -> Result<(), ServiceError> {
        for event in self.events.iter() {
            match event.token() {
                WAKER => trace!("Woken"),
                LISTENER => {
                    check_event(event)?;
                    self.listener_ready = true;
                }
                token => {
                    check_event(event)?;
                    // Stale tokens belong to connections evicted last pass.
                    if let Some(conn) = self.connections.get_mut(token.0) {
                        conn.readable = true;
                    }
                }
            }
        }
        Ok(())
    }

    fn accept_one(&mut self) {
        match self.listener.accept() {
            Ok((stream, peer)) => {
                debug!(peer = %peer, "Accepted connection");
                self.pending_add.push((stream, peer));
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.listener_ready = false;
            }
            Err(e) => {
                warn!(error = %e, "Accept failed");
                if !matches!(
                    e.kind(),
                    io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted
                ) {
                    self.listener_ready = false;
                }
            }
        }
    }

    /// Read one chunk from a ready connection, or check an unready one for
    /// idleness. Never both in the same pass.
    fn service(&mut self, token: Token, now: Instant) {
        let Some(conn) = self.connections.get_mut(token.0) else {
            return;
        };

        if !conn.readable {
            if conn.is_idle(now, self.idle_timeout) {
                debug!(conn_id = token.0, peer = %conn.peer, "Idle timeout");
                self.pending_remove.push(token);
            }
            return;
        }

        let mut chunk = [0u8; READ_CHUNK];
        let want = conn.frame.remaining().min(READ_CHUNK);

        let n = match conn.stream.read(&mut chunk[..want]) {
            Ok(0) => {
                debug!(conn_id = token.0, peer = %conn.peer, "Peer closed");
                self.pending_remove.push(token);
                return;
            }
            Ok(n) => n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                conn.readable = false;
                return;
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return,
            Err(e) => {
                debug!(conn_id = token.0, error = %e, "Read failed");
                self.pending_remove.push(token);
                return;
            }
        };

        conn.touch(now);

        match conn.frame.ingest(&chunk[..n], &self.table) {
            Ok(Progress::Incomplete) => {
                trace!(
                    conn_id = token.0,
                    phase = ?conn.frame.phase(),
                    received = conn.frame.bytes_received(),
                    "Partial command"
                );
            }
            Ok(Progress::Complete) => {
                if let Some(header) = conn.frame.header() {
                    trace!(
                        conn_id = token.0,
                        opcode = header.opcode,
                        tag = header.tag,
                        "Command ready"
                    );
                }
                if let Err(e) = complete_command(conn, &self.dispatcher) {
                    debug!(conn_id = token.0, error = %e, "Response write failed");
                    self.pending_remove.push(token);
                }
            }
            Err(e) => {
                debug!(conn_id = token.0, peer = %conn.peer, error = %e, "Protocol error");
                self.pending_remove.push(token);
            }
        }
    }

    fn apply_removals(&mut self) -> Result<(), ServiceError> {
        for token in self.pending_remove.drain(..) {
            match self.descriptors.remove(token) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(_) => return Err(ServiceError::ListenerEviction),
            }

            if let Some(mut conn) = self.connections.try_remove(token.0) {
                let _ = self.poll.registry().deregister(&mut conn.stream);
                debug!(conn_id = token.0, peer = %conn.peer, "Connection closed");
            }
        }
        Ok(())
    }

    fn apply_additions(&mut self) {
        let now = Instant::now();
        for (mut stream, peer) in self.pending_add.drain(..) {
            let entry = self.connections.vacant_entry();
            let token = Token(entry.key());

            if let Err(e) = self
                .poll
                .registry()
                .register(&mut stream, token, Interest::READABLE)
            {
                warn!(peer = %peer, error = %e, "Failed to register connection");
                continue;
            }

            entry.insert(Connection::new(stream, peer, &self.table, now));
            self.descriptors.push(token);
            debug!(conn_id = token.0, peer = %peer, "Connection added");
        }
    }
}

/// Only read-side readiness is registered, so anything else breaks the
/// loop's model of the world.
fn check_event(event: &Event) -> Result<(), ServiceError> {
    if event.is_readable() || event.is_read_closed() || event.is_error() {
        Ok(())
    } else {
        Err(ServiceError::UnexpectedReadiness(event.token().0))
    }
}

/// Dispatch the ready command, write any response, then rearm for the next
/// header.
fn complete_command<D: Dispatcher>(conn: &mut Connection, dispatcher: &D) -> io::Result<()> {
    let response = conn
        .frame
        .command()
        .and_then(|(header, payload)| dispatcher.dispatch(header, payload));
    conn.frame.reset();

    match response {
        Some(bytes) if !bytes.is_empty() => send_blocking(&conn.stream, &bytes),
        _ => Ok(()),
    }
}

/// Write `data` in full with the socket temporarily in blocking mode.
///
/// A slow reader stalls the whole loop while this runs.
fn send_blocking(stream: &TcpStream, data: &[u8]) -> io::Result<()> {
    let socket = socket2::SockRef::from(stream);
    socket.set_nonblocking(false)?;

    let mut writer = stream;
    let result = writer.write_all(data);

    socket.set_nonblocking(true)?;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::CommandHeader;
    use bytes::Bytes;
    use std::thread;

    fn ignore(_: &CommandHeader, _: &[u8]) -> Option<Bytes> {
        None
    }

    fn event_loop() -> EventLoop<impl Dispatcher> {
        let poll = Poll::new().unwrap();
        let mut listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)
            .unwrap();

        EventLoop::new(
            poll,
            listener,
            PayloadTable::default(),
            ignore,
            &InterfaceConfig::default(),
            Arc::new(AtomicBool::new(false)),
        )
    }

    #[test]
    fn test_listener_removal_is_fatal() {
        let mut event_loop = event_loop();
        event_loop.pending_remove.push(LISTENER);

        assert!(matches!(
            event_loop.apply_removals(),
            Err(ServiceError::ListenerEviction)
        ));
        assert_eq!(event_loop.descriptors.tokens(), &[LISTENER]);
    }

    #[test]
    fn test_removals_track_additions() {
        let mut event_loop = event_loop();
        let addr = event_loop.listener.local_addr().unwrap();
        let _client = std::net::TcpStream::connect(addr).unwrap();

        let accepted = loop {
            match event_loop.listener.accept() {
                Ok(accepted) => break accepted,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(5));
                }
                Err(e) => panic!("accept failed: {e}"),
            }
        };
        event_loop.pending_add.push(accepted);
        event_loop.apply_additions();

        assert_eq!(event_loop.descriptors.connections(), 1);
        assert_eq!(event_loop.connections.len(), 1);
        let token = event_loop.descriptors.tokens()[1];

        // Unknown tokens are skipped; the same token twice closes once.
        event_loop.pending_remove.extend([Token(42), token, token]);
        assert!(event_loop.apply_removals().is_ok());
        assert_eq!(event_loop.descriptors.tokens(), &[LISTENER]);
        assert!(event_loop.connections.is_empty());
    }
}
