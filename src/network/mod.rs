pub mod auth;
pub mod batcher;
pub mod binding;
pub mod codec;
pub mod connection;
pub mod crypt;
pub mod error;
pub mod opcode;
pub mod packet;
pub mod ping;
pub mod reactor;

use std::io::{self, Read, Write};

/// Result of one speculative read or write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOutcome {
    /// `n > 0` bytes moved.
    Transferred(usize),
    /// Kernel buffer empty (read) or full (write); retry on next readiness.
    WouldBlock,
    /// Peer closed the stream.
    Closed,
}

/// Byte-stream primitive owned by the reactor and lent to the engine for the
/// duration of one callback. `Err` is a transport failure and always fatal.
pub trait Transport {
    fn read_into(&mut self, buf: &mut [u8]) -> io::Result<IoOutcome>;
    fn write_from(&mut self, buf: &[u8]) -> io::Result<IoOutcome>;
    fn close(&mut self);
}

/// Runs one raw `read`/`write` call, retrying on `Interrupted`, and maps the
/// result onto `IoOutcome`.
fn classify(mut op: impl FnMut() -> io::Result<usize>) -> io::Result<IoOutcome> {
    loop {
        match op() {
            Ok(0) => return Ok(IoOutcome::Closed),
            Ok(n) => return Ok(IoOutcome::Transferred(n)),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(IoOutcome::WouldBlock),
            Err(e) => return Err(e),
        }
    }
}

/// Expects the stream to be in non-blocking mode.
impl Transport for std::net::TcpStream {
    fn read_into(&mut self, buf: &mut [u8]) -> io::Result<IoOutcome> {
        classify(|| self.read(buf))
    }

    fn write_from(&mut self, buf: &[u8]) -> io::Result<IoOutcome> {
        classify(|| self.write(buf))
    }

    fn close(&mut self) {
        let _ = self.shutdown(std::net::Shutdown::Both);
    }
}

impl Transport for tokio::net::TcpStream {
    fn read_into(&mut self, buf: &mut [u8]) -> io::Result<IoOutcome> {
        classify(|| self.try_read(buf))
    }

    fn write_from(&mut self, buf: &[u8]) -> io::Result<IoOutcome> {
        classify(|| self.try_write(buf))
    }

    fn close(&mut self) {
        // The reactor drops the stream, which closes the fd.
        if let Ok(peer) = self.peer_addr() {
            tracing::trace!("[world] [transport_close] peer={}", peer);
        }
    }
}
