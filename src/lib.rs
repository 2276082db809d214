//! sandbox-interface: binary command endpoint for the sandbox service.
//!
//! Clients open a TCP connection and send a stream of fixed-layout
//! commands. Each command is an 8-byte header followed by a payload whose
//! size is fixed per opcode. The server reassembles commands from partial
//! reads and hands each complete one to a [`Dispatcher`]. Any bytes the
//! dispatcher returns are written back on the same connection.
//!
//! Everything runs on one `network` thread driving a mio poll loop. Idle
//! connections are evicted after a configurable timeout, and a connection
//! that sends an unknown opcode is closed.

pub mod config;
pub mod error;
pub mod protocol;
pub mod runtime;

pub use config::{Config, InterfaceConfig};
pub use error::ServiceError;
pub use protocol::{CodecError, CommandHeader, Opcode, PayloadTable, HEADER_LEN};
pub use runtime::{Dispatcher, Interface};
