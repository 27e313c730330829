//! Authenticated and encrypted byte stream between SignCTRL and its validator.
//!
//! Both ends hold the same pre-shared connection key and run the Noise
//! `NNpsk0` handshake with it. A peer without the key cannot complete the
//! handshake, and everything sent afterwards is sealed with ChaCha20-Poly1305.
//!
//! ```text
//! frame := len: u16 (big endian) || noise message (ciphertext || 16-byte tag)
//! ```
//!
//! Plaintext is split into chunks of at most [`DATA_MAX_SIZE`] bytes, one
//! chunk per frame.

use crate::connection::ConnKey;
use snow::params::NoiseParams;
use snow::{Builder, TransportState};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

const NOISE_PARAMS: &str = "Noise_NNpsk0_25519_ChaChaPoly_SHA256";
const NOISE_PROLOGUE: &[u8] = b"signctrl/secret-connection/1";
const MAX_NOISE_MSG_LEN: usize = u16::MAX as usize;
const TAG_LEN: usize = 16;

/// Largest plaintext chunk sealed into a single frame.
pub const DATA_MAX_SIZE: usize = 1024;

/// How long either side waits for the other during the handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("noise error: {0}")]
    Noise(#[from] snow::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("peer closed the connection during the handshake")]
    Closed,
}

/// A secured stream on top of a TCP connection.
pub struct SecretConnection {
    stream: TcpStream,
    transport: TransportState,
    recv_buf: Vec<u8>,
    recv_pos: usize,
}

impl std::fmt::Debug for SecretConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretConnection")
            .field("peer", &self.stream.peer_addr().ok())
            .finish_non_exhaustive()
    }
}

impl SecretConnection {
    /// Run the handshake as the dialing side.
    pub fn connect(stream: TcpStream, key: &ConnKey) -> Result<Self, HandshakeError> {
        Self::handshake(stream, key, true)
    }

    /// Run the handshake as the listening side.
    pub fn accept(stream: TcpStream, key: &ConnKey) -> Result<Self, HandshakeError> {
        Self::handshake(stream, key, false)
    }

    fn handshake(
        mut stream: TcpStream,
        key: &ConnKey,
        initiator: bool,
    ) -> Result<Self, HandshakeError> {
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;

        let params: NoiseParams = NOISE_PARAMS.parse()?;
        let builder = Builder::new(params)
            .prologue(NOISE_PROLOGUE)
            .psk(0, key.as_bytes());

        let mut msg = vec![0u8; MAX_NOISE_MSG_LEN];
        let mut payload = vec![0u8; MAX_NOISE_MSG_LEN];

        let transport = if initiator {
            let mut hs = builder.build_initiator()?;
            let len = hs.write_message(&[], &mut msg)?;
            write_frame(&mut stream, &msg[..len])?;

            let reply = read_frame(&mut stream)?.ok_or(HandshakeError::Closed)?;
            hs.read_message(&reply, &mut payload)?;
            hs.into_transport_mode()?
        } else {
            let mut hs = builder.build_responder()?;
            let hello = read_frame(&mut stream)?.ok_or(HandshakeError::Closed)?;
            hs.read_message(&hello, &mut payload)?;

            let len = hs.write_message(&[], &mut msg)?;
            write_frame(&mut stream, &msg[..len])?;
            hs.into_transport_mode()?
        };

        stream.set_read_timeout(None)?;
        debug!(
            "Secret connection established with {:?} (initiator: {})",
            stream.peer_addr().ok(),
            initiator
        );

        Ok(Self {
            stream,
            transport,
            recv_buf: Vec::new(),
            recv_pos: 0,
        })
    }

    /// Second handle to the underlying socket, used to shut it down from
    /// another thread.
    pub fn try_clone_stream(&self) -> io::Result<TcpStream> {
        self.stream.try_clone()
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    /// Shut the connection down in both directions.
    pub fn close(&self) -> io::Result<()> {
        match self.stream.shutdown(Shutdown::Both) {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e),
            _ => Ok(()),
        }
    }
}

impl Read for SecretConnection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        while self.recv_pos >= self.recv_buf.len() {
            let sealed = match read_frame(&mut self.stream)? {
                Some(frame) => frame,
                None => return Ok(0),
            };

            let mut plain = vec![0u8; sealed.len()];
            let len = self
                .transport
                .read_message(&sealed, &mut plain)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            plain.truncate(len);

            self.recv_buf = plain;
            self.recv_pos = 0;
        }

        let available = &self.recv_buf[self.recv_pos..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.recv_pos += n;
        Ok(n)
    }
}

impl Write for SecretConnection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut sealed = vec![0u8; DATA_MAX_SIZE + TAG_LEN];
        for chunk in buf.chunks(DATA_MAX_SIZE) {
            let len = self
                .transport
                .write_message(chunk, &mut sealed)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            write_frame(&mut self.stream, &sealed[..len])?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

fn write_frame<W: Write>(writer: &mut W, frame: &[u8]) -> io::Result<()> {
    let len = u16::try_from(frame.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "noise frame too large"))?;
    let mut buf = Vec::with_capacity(2 + frame.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(frame);
    writer.write_all(&buf)
}

/// Read one frame. `None` means the peer closed the stream.
fn read_frame<R: Read>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 2];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let mut frame = vec![0u8; u16::from_be_bytes(len_buf) as usize];
    match reader.read_exact(&mut frame) {
        Ok(()) => Ok(Some(frame)),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e),
    }
}
