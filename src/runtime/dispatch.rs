//! Command dispatch boundary.
//!
//! The event loop hands each fully reassembled command to a [`Dispatcher`]
//! and writes back whatever it returns. Dispatch runs on the loop thread,
//! so a slow dispatcher stalls every connection.

use crate::protocol::CommandHeader;
use bytes::Bytes;

/// Handler for complete commands.
///
/// `payload` borrows the connection's reassembly buffer and is reused as
/// soon as the call returns. Returning `None` or an empty buffer writes
/// nothing back.
pub trait Dispatcher: Send + 'static {
    fn dispatch(&self, header: &CommandHeader, payload: &[u8]) -> Option<Bytes>;
}

impl<F> Dispatcher for F
where
    F: Fn(&CommandHeader, &[u8]) -> Option<Bytes> + Send + 'static,
{
    fn dispatch(&self, header: &CommandHeader, payload: &[u8]) -> Option<Bytes> {
        self(header, payload)
    }
}
