//! Connection multiplexer.
//!
//! A single `network` thread owns the listening socket and every client
//! connection and drives them from one mio poll loop:
//! - `DescriptorSet`: ordered polling list, listener first
//! - `Connection`: per-socket reassembly state machine
//! - `Dispatcher`: callback invoked per complete command
//!
//! [`Interface`] is the handle the host keeps: it starts the loop, and
//! stopping it joins the thread so no socket outlives the call.

mod connection;
mod descriptors;
mod dispatch;
mod event_loop;

pub use dispatch::Dispatcher;

use crate::config::InterfaceConfig;
use crate::error::ServiceError;
use crate::protocol::PayloadTable;
use descriptors::{LISTENER, WAKER};
use event_loop::EventLoop;
use mio::net::TcpListener;
use mio::{Interest, Poll, Waker};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info};

/// Handle to a running multiplexer.
///
/// Dropping the handle stops the loop and discards its result; call
/// [`stop`](Self::stop) to observe a fatal error.
pub struct Interface {
    local_addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    waker: Arc<Waker>,
    handle: Option<JoinHandle<Result<(), ServiceError>>>,
}

impl Interface {
    /// Bind the listener and launch the poll loop.
    ///
    /// Socket setup happens on the calling thread so that bind failures are
    /// returned here rather than from the loop.
    pub fn start<D: Dispatcher>(
        config: &InterfaceConfig,
        table: PayloadTable,
        dispatcher: D,
    ) -> Result<Self, ServiceError> {
        let listener = create_listener(config.listen, config.backlog).map_err(|source| {
            ServiceError::Bind {
                addr: config.listen,
                source,
            }
        })?;
        let local_addr = listener.local_addr().map_err(ServiceError::Setup)?;
        let mut listener = TcpListener::from_std(listener);

        let poll = Poll::new().map_err(ServiceError::Setup)?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)
            .map_err(ServiceError::Setup)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER).map_err(ServiceError::Setup)?);

        let shutdown = Arc::new(AtomicBool::new(false));
        let event_loop = EventLoop::new(
            poll,
            listener,
            table,
            dispatcher,
            config,
            Arc::clone(&shutdown),
        );

        let handle = thread::Builder::new()
            .name("network".to_string())
            .spawn(move || {
                let result = event_loop.run();
                if let Err(ref e) = result {
                    error!(error = %e, "Network loop failed");
                }
                result
            })
            .map_err(ServiceError::Spawn)?;

        info!(
            addr = %local_addr,
            backlog = config.backlog,
            idle_timeout_secs = config.idle_timeout.as_secs_f64(),
            "Interface started"
        );

        Ok(Self {
            local_addr,
            shutdown,
            waker,
            handle: Some(handle),
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// False once the loop has exited, whether stopped or failed.
    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Signal the loop to exit and wait for it.
    ///
    /// Returns the loop's fatal error, if it died with one. Later calls
    /// return `Ok(())`.
    pub fn stop(&mut self) -> Result<(), ServiceError> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };

        self.shutdown.store(true, Ordering::Release);
        if let Err(e) = self.waker.wake() {
            debug!(error = %e, "Failed to wake network loop");
        }

        let result = handle.join().map_err(|_| ServiceError::Panicked)?;
        info!(addr = %self.local_addr, "Interface stopped");
        result
    }
}

impl Drop for Interface {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

/// Create a non-blocking TCP listener with `SO_REUSEADDR`.
fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}
