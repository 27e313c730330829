//! Connection to the validator node.
//!
//! SignCTRL dials the validator's private validator listen address and
//! secures the stream with the pre-shared connection key. A lost validator is
//! worse than a standby that waits, so dialing is retried at a fixed interval
//! until it succeeds or the service shuts down.

use crate::secret_connection::{HandshakeError, SecretConnection};
use crate::shutdown::ShutdownToken;
use parking_lot::Mutex;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fs;
use std::io;
use std::net::{Shutdown, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// File name of the connection key inside the configuration directory.
pub const CONN_KEY_FILE: &str = "conn.key";

const CONN_KEY_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum ConnKeyError {
    #[error("couldn't access {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("connection key is not valid hex: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("connection key must be {CONN_KEY_LEN} bytes, got {0}")]
    Length(usize),
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("couldn't connect to {address}: {source}")]
    Io {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("secret connection handshake with {address} failed: {source}")]
    Handshake {
        address: String,
        #[source]
        source: HandshakeError,
    },
}

/// Pre-shared key used to secure the connection to the validator.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnKey([u8; CONN_KEY_LEN]);

impl std::fmt::Debug for ConnKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ConnKey({})", self.fingerprint())
    }
}

impl ConnKey {
    pub fn from_bytes(bytes: [u8; CONN_KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn generate() -> Self {
        let mut bytes = [0u8; CONN_KEY_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Short, non-secret identifier of the key for logs.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.0);
        hex::encode(&digest[..8])
    }

    pub fn path(config_dir: &Path) -> PathBuf {
        config_dir.join(CONN_KEY_FILE)
    }

    /// Load the hex-encoded key from the configuration directory.
    pub fn load(config_dir: &Path) -> Result<Self, ConnKeyError> {
        let path = Self::path(config_dir);
        let contents = fs::read_to_string(&path).map_err(|source| ConnKeyError::Io {
            path: path.clone(),
            source,
        })?;

        let bytes = hex::decode(contents.trim())?;
        let key: [u8; CONN_KEY_LEN] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| ConnKeyError::Length(bytes.len()))?;
        Ok(Self(key))
    }

    /// Write the hex-encoded key into the configuration directory, readable by
    /// the owner only.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConnKeyError> {
        let path = Self::path(config_dir);
        let io_err = |source: io::Error| ConnKeyError::Io {
            path: path.clone(),
            source,
        };

        fs::create_dir_all(config_dir).map_err(io_err)?;
        fs::write(&path, format!("{}\n", hex::encode(self.0))).map_err(io_err)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o600)).map_err(io_err)?;
        }

        Ok(())
    }
}

/// Owns the secured stream to the validator.
pub struct ConnectionManager {
    address: String,
    conn_key: ConnKey,
    retry_interval: Duration,
    shutdown: Arc<ShutdownToken>,
    current: Mutex<Option<TcpStream>>,
}

impl ConnectionManager {
    pub fn new(
        address: impl Into<String>,
        conn_key: ConnKey,
        retry_interval: Duration,
        shutdown: Arc<ShutdownToken>,
    ) -> Self {
        Self {
            address: address.into(),
            conn_key,
            retry_interval,
            shutdown,
            current: Mutex::new(None),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Make a single connection attempt including the handshake.
    ///
    /// A successful dial replaces the previously owned stream.
    pub fn dial(&self) -> Result<SecretConnection, ConnectionError> {
        let stream =
            TcpStream::connect(self.address.as_str()).map_err(|source| ConnectionError::Io {
                address: self.address.clone(),
                source,
            })?;

        let conn = SecretConnection::connect(stream, &self.conn_key).map_err(|source| {
            ConnectionError::Handshake {
                address: self.address.clone(),
                source,
            }
        })?;

        let handle = conn
            .try_clone_stream()
            .map_err(|source| ConnectionError::Io {
                address: self.address.clone(),
                source,
            })?;
        if let Some(previous) = self.current.lock().replace(handle) {
            shutdown_stream(&previous);
        }

        Ok(conn)
    }

    /// Dial until a connection is established.
    ///
    /// Returns `None` only if the service shut down in the meantime.
    pub fn retry_dial(&self) -> Option<SecretConnection> {
        loop {
            if self.shutdown.is_cancelled() {
                return None;
            }

            match self.dial() {
                Ok(conn) => {
                    if self.shutdown.is_cancelled() {
                        self.close();
                        return None;
                    }
                    info!("Successfully dialed validator at {}", self.address);
                    return Some(conn);
                }
                Err(e) => {
                    warn!(
                        "Couldn't dial validator: {}. Retrying in {:?}...",
                        e, self.retry_interval
                    );
                }
            }

            if self.shutdown.wait_timeout(self.retry_interval) {
                return None;
            }
        }
    }

    /// Close the owned stream, unblocking anyone reading from it.
    pub fn close(&self) {
        if let Some(stream) = self.current.lock().take() {
            shutdown_stream(&stream);
            debug!("Closed connection to validator at {}", self.address);
        }
    }
}

fn shutdown_stream(stream: &TcpStream) {
    if let Err(e) = stream.shutdown(Shutdown::Both) {
        if e.kind() != io::ErrorKind::NotConnected {
            debug!("Couldn't shut down validator stream: {}", e);
        }
    }
}
