//! Per-connection parse state.
//!
//! A connection alternates between reading a header and reading the payload
//! the header announces. Reads are sized so that a single read never crosses
//! from one unit into the next, which keeps pipelined commands in the socket
//! until the current one has been dispatched.

use crate::protocol::{CodecError, CommandHeader, PayloadTable, HEADER_LEN};
use bytes::BytesMut;
use mio::net::TcpStream;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Where a connection is in the current command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Accumulating `HEADER_LEN` bytes.
    WaitingForHeader,
    /// Header accepted; accumulating the opcode's payload.
    WaitingForPayload,
    /// Header and payload complete, waiting to be dispatched.
    Ready,
}

/// Outcome of feeding bytes into a [`Reassembly`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Incomplete,
    Complete,
}

/// Reassembles one header + payload at a time from partial reads.
///
/// The buffer length is the received-bytes cursor. It is cleared, not
/// reallocated, on every phase change.
#[derive(Debug)]
pub struct Reassembly {
    phase: Phase,
    header: Option<CommandHeader>,
    buffer: BytesMut,
    target: usize,
}

impl Reassembly {
    pub fn new(table: &PayloadTable) -> Self {
        let capacity = HEADER_LEN.max(table.max_payload_len());
        Self {
            phase: Phase::WaitingForHeader,
            header: None,
            buffer: BytesMut::with_capacity(capacity),
            target: HEADER_LEN,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Most recently parsed header.
    pub fn header(&self) -> Option<&CommandHeader> {
        self.header.as_ref()
    }

    pub fn bytes_received(&self) -> usize {
        self.buffer.len()
    }

    /// Bytes still needed to finish the current phase.
    pub fn remaining(&self) -> usize {
        match self.phase {
            Phase::Ready => 0,
            _ => self.target - self.buffer.len(),
        }
    }

    /// Append freshly read bytes and advance the phase.
    ///
    /// `data` must not exceed [`remaining`](Self::remaining). An invalid
    /// opcode is reported as an error; the connection is unusable after that.
    pub fn ingest(&mut self, data: &[u8], table: &PayloadTable) -> Result<Progress, CodecError> {
        debug_assert!(self.phase != Phase::Ready, "ingest while a command is pending");
        debug_assert!(data.len() <= self.remaining(), "read crossed a unit boundary");

        self.buffer.extend_from_slice(data);
        if self.buffer.len() < self.target {
            return Ok(Progress::Incomplete);
        }

        match self.phase {
            Phase::WaitingForHeader => {
                let mut raw = [0u8; HEADER_LEN];
                raw.copy_from_slice(&self.buffer[..HEADER_LEN]);
                let header = CommandHeader::decode(&raw);
                let payload_len = table.payload_len(header.opcode)?;

                self.header = Some(header);
                self.buffer.clear();
                self.target = payload_len;

                if payload_len == 0 {
                    self.phase = Phase::Ready;
                    Ok(Progress::Complete)
                } else {
                    self.phase = Phase::WaitingForPayload;
                    Ok(Progress::Incomplete)
                }
            }
            Phase::WaitingForPayload => {
                self.phase = Phase::Ready;
                Ok(Progress::Complete)
            }
            Phase::Ready => Ok(Progress::Complete),
        }
    }

    /// The completed command, only while in [`Phase::Ready`].
    pub fn command(&self) -> Option<(&CommandHeader, &[u8])> {
        match (self.phase, self.header.as_ref()) {
            (Phase::Ready, Some(header)) => Some((header, &self.buffer[..])),
            _ => None,
        }
    }

    /// Return to header-wait for the next command on the same connection.
    pub fn reset(&mut self) {
        self.phase = Phase::WaitingForHeader;
        self.buffer.clear();
        self.target = HEADER_LEN;
    }
}

/// A single accepted client socket.
#[derive(Debug)]
pub struct Connection {
    pub stream: TcpStream,
    pub peer: SocketAddr,
    pub frame: Reassembly,
    /// Updated on every successful read, including partial ones.
    pub last_activity: Instant,
    /// Readiness carried over from a previous pass. mio reports edges, so
    /// this stays set until a read returns `WouldBlock`.
    pub readable: bool,
}

impl Connection {
    pub fn new(stream: TcpStream, peer: SocketAddr, table: &PayloadTable, now: Instant) -> Self {
        Self {
            stream,
            peer,
            frame: Reassembly::new(table),
            last_activity: now,
            readable: false,
        }
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    pub fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_activity) > timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Opcode;

    fn header_bytes(opcode: u32, tag: u32) -> [u8; HEADER_LEN] {
        CommandHeader { opcode, tag }.encode()
    }

    #[test]
    fn test_header_then_payload() {
        let table = PayloadTable::default();
        let mut frame = Reassembly::new(&table);

        assert_eq!(frame.phase(), Phase::WaitingForHeader);
        assert_eq!(frame.remaining(), HEADER_LEN);

        let header = header_bytes(Opcode::GetUnit.as_u32(), 5);
        assert_eq!(frame.ingest(&header[..3], &table), Ok(Progress::Incomplete));
        assert_eq!(frame.bytes_received(), 3);
        assert_eq!(frame.ingest(&header[3..], &table), Ok(Progress::Incomplete));

        assert_eq!(frame.phase(), Phase::WaitingForPayload);
        assert_eq!(frame.bytes_received(), 0);
        assert_eq!(frame.remaining(), 16);
        assert!(frame.command().is_none());

        let payload: Vec<u8> = (0..16).collect();
        assert_eq!(frame.ingest(&payload[..8], &table), Ok(Progress::Incomplete));
        assert_eq!(frame.ingest(&payload[8..], &table), Ok(Progress::Complete));
        assert_eq!(frame.phase(), Phase::Ready);
        assert_eq!(frame.remaining(), 0);

        let (parsed, body) = frame.command().unwrap();
        assert_eq!(parsed.opcode, 1);
        assert_eq!(parsed.tag, 5);
        assert_eq!(body, &payload[..]);
    }

    #[test]
    fn test_reset_allows_next_command() {
        let table = PayloadTable::default();
        let mut frame = Reassembly::new(&table);

        frame
            .ingest(&header_bytes(Opcode::GetUnit.as_u32(), 1), &table)
            .unwrap();
        frame.ingest(&[1; 16], &table).unwrap();
        frame.reset();

        assert_eq!(frame.phase(), Phase::WaitingForHeader);
        assert_eq!(frame.remaining(), HEADER_LEN);
        assert_eq!(frame.header().map(|h| h.tag), Some(1));

        frame
            .ingest(&header_bytes(Opcode::AddUnit.as_u32(), 2), &table)
            .unwrap();
        assert_eq!(frame.remaining(), 32);
        assert_eq!(frame.ingest(&[2; 32], &table), Ok(Progress::Complete));
        assert_eq!(frame.command().map(|(h, p)| (h.tag, p.len())), Some((2, 32)));
    }

    #[test]
    fn test_invalid_opcode() {
        let table = PayloadTable::default();
        let mut frame = Reassembly::new(&table);

        let result = frame.ingest(&header_bytes(Opcode::COUNT as u32, 0), &table);
        assert_eq!(result, Err(CodecError::InvalidOpcode(2)));
        assert!(frame.command().is_none());
    }

    #[test]
    fn test_zero_length_payload_completes_on_header() {
        let table = PayloadTable::new(&[(Opcode::AddUnit, 0), (Opcode::GetUnit, 4)]).unwrap();
        let mut frame = Reassembly::new(&table);

        assert_eq!(
            frame.ingest(&header_bytes(Opcode::AddUnit.as_u32(), 3), &table),
            Ok(Progress::Complete)
        );
        let (header, payload) = frame.command().unwrap();
        assert_eq!(header.tag, 3);
        assert!(payload.is_empty());
    }

    #[test]
    fn test_idle_detection() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        client.set_nonblocking(true).unwrap();

        let start = Instant::now();
        let mut conn = Connection::new(
            TcpStream::from_std(client),
            addr,
            &PayloadTable::default(),
            start,
        );
        let timeout = Duration::from_secs(10);

        assert!(!conn.is_idle(start + Duration::from_secs(10), timeout));
        assert!(conn.is_idle(start + Duration::from_secs(11), timeout));

        conn.touch(start + Duration::from_secs(5));
        assert!(!conn.is_idle(start + Duration::from_secs(11), timeout));
        // Clock readings before the last activity never count as idle.
        assert!(!conn.is_idle(start, timeout));
    }
}
