//! Client for the SignCTRL backend.
//!
//! Key custody, last-signed-state protection and chain inspection live in a
//! separate backend process. SignCTRL reaches it over a Unix socket, opening
//! one connection per request.
//!
//! ```text
//! ┌──────────────┐  secret conn  ┌──────────┐  Unix socket  ┌─────────┐
//! │  Validator   │ ◄───────────► │ SignCTRL │ ◄───────────► │ Backend │
//! └──────────────┘               └──────────┘               └─────────┘
//! ```

use crate::handler::{CommitInspector, HandlerError, Keystore, SignKind, Signed};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Largest response accepted from the backend.
const MAX_BACKEND_MSG_SIZE: usize = 1024 * 1024;

/// Upper bound for a single backend round trip.
const BACKEND_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

/// All possible messages from SignCTRL to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendRequest {
    PubKey,
    Sign {
        kind: SignKind,
        height: u64,
        round: u32,
        sign_bytes: Vec<u8>,
    },
    CommitSigned {
        height: u64,
    },
    Ping,
}

/// All possible messages from the backend to SignCTRL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendResponse {
    PubKey { pubkey: Vec<u8> },
    Signature { signature: Vec<u8> },
    Rejected { reason: String },
    CommitSigned(Option<bool>),
    Pong,
    Error { message: String },
}

/// Backend client.
#[derive(Debug, Clone)]
pub struct BackendClient {
    socket_path: PathBuf,
}

impl BackendClient {
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Connect to the backend and send a request.
    fn send_request(&self, request: &BackendRequest) -> Result<BackendResponse, BackendError> {
        let mut stream = UnixStream::connect(&self.socket_path)?;
        stream.set_read_timeout(Some(BACKEND_TIMEOUT))?;
        stream.set_write_timeout(Some(BACKEND_TIMEOUT))?;

        // Serialize and send request
        let request_bytes = bincode::serialize(request)?;
        let len_bytes = (request_bytes.len() as u32).to_le_bytes();
        stream.write_all(&len_bytes)?;
        stream.write_all(&request_bytes)?;
        stream.flush()?;

        // Read response
        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf)?;
        let msg_len = u32::from_le_bytes(len_buf) as usize;
        if msg_len > MAX_BACKEND_MSG_SIZE {
            return Err(BackendError::Protocol(format!(
                "Response too large: {} bytes",
                msg_len
            )));
        }

        let mut msg_buf = vec![0u8; msg_len];
        stream.read_exact(&mut msg_buf)?;

        let response: BackendResponse = bincode::deserialize(&msg_buf)?;
        debug!("Backend answered {:?}", request_kind(request));
        Ok(response)
    }

    /// Ping the backend.
    pub fn ping(&self) -> Result<(), BackendError> {
        match self.send_request(&BackendRequest::Ping)? {
            BackendResponse::Pong => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}

fn request_kind(request: &BackendRequest) -> &'static str {
    match request {
        BackendRequest::PubKey => "pubkey",
        BackendRequest::Sign { .. } => "sign",
        BackendRequest::CommitSigned { .. } => "commit_signed",
        BackendRequest::Ping => "ping",
    }
}

fn unexpected(response: BackendResponse) -> BackendError {
    match response {
        BackendResponse::Error { message } => BackendError::Protocol(format!("Error: {}", message)),
        other => BackendError::Protocol(format!("Unexpected response: {:?}", other)),
    }
}

impl Keystore for BackendClient {
    fn pubkey(&self) -> Result<Vec<u8>, HandlerError> {
        match self.send_request(&BackendRequest::PubKey)? {
            BackendResponse::PubKey { pubkey } => Ok(pubkey),
            other => Err(unexpected(other).into()),
        }
    }

    fn sign(
        &self,
        kind: SignKind,
        height: u64,
        round: u32,
        sign_bytes: &[u8],
    ) -> Result<Signed, HandlerError> {
        let request = BackendRequest::Sign {
            kind,
            height,
            round,
            sign_bytes: sign_bytes.to_vec(),
        };

        match self.send_request(&request)? {
            BackendResponse::Signature { signature } => Ok(Signed::Signature(signature)),
            BackendResponse::Rejected { reason } => Ok(Signed::Rejected(reason)),
            other => Err(unexpected(other).into()),
        }
    }
}

impl CommitInspector for BackendClient {
    fn commit_signed(&self, height: u64) -> Result<Option<bool>, HandlerError> {
        match self.send_request(&BackendRequest::CommitSigned { height })? {
            BackendResponse::CommitSigned(signed) => Ok(signed),
            other => Err(unexpected(other).into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixListener;
    use std::thread;
    use tempfile::TempDir;

    /// Serve `count` connections, answering each request with `answer`.
    fn spawn_backend<F>(listener: UnixListener, count: usize, answer: F) -> thread::JoinHandle<()>
    where
        F: Fn(BackendRequest) -> BackendResponse + Send + 'static,
    {
        thread::spawn(move || {
            for _ in 0..count {
                let (mut stream, _) = listener.accept().unwrap();

                let mut len_buf = [0u8; 4];
                stream.read_exact(&mut len_buf).unwrap();
                let mut msg_buf = vec![0u8; u32::from_le_bytes(len_buf) as usize];
                stream.read_exact(&mut msg_buf).unwrap();
                let request: BackendRequest = bincode::deserialize(&msg_buf).unwrap();

                let response = bincode::serialize(&answer(request)).unwrap();
                stream
                    .write_all(&(response.len() as u32).to_le_bytes())
                    .unwrap();
                stream.write_all(&response).unwrap();
            }
        })
    }

    fn create_test_backend(temp_dir: &TempDir) -> (UnixListener, PathBuf) {
        let socket_path = temp_dir.path().join("backend.sock");
        let listener = UnixListener::bind(&socket_path).unwrap();
        (listener, socket_path)
    }

    #[test]
    fn test_client_ping() {
        let temp_dir = TempDir::new().unwrap();
        let (listener, socket_path) = create_test_backend(&temp_dir);
        let server = spawn_backend(listener, 1, |_| BackendResponse::Pong);

        BackendClient::new(&socket_path).ping().unwrap();
        server.join().unwrap();
    }

    #[test]
    fn test_client_keystore_and_inspector() {
        let temp_dir = TempDir::new().unwrap();
        let (listener, socket_path) = create_test_backend(&temp_dir);
        let server = spawn_backend(listener, 4, |request| match request {
            BackendRequest::PubKey => BackendResponse::PubKey {
                pubkey: vec![1; 32],
            },
            BackendRequest::Sign {
                height: 7,
                sign_bytes,
                ..
            } => BackendResponse::Signature {
                signature: sign_bytes,
            },
            BackendRequest::Sign { .. } => BackendResponse::Rejected {
                reason: "height already signed".to_string(),
            },
            BackendRequest::CommitSigned { height } => {
                BackendResponse::CommitSigned(Some(height % 2 == 0))
            }
            BackendRequest::Ping => BackendResponse::Pong,
        });

        let client = BackendClient::new(&socket_path);
        assert_eq!(client.pubkey().unwrap(), vec![1; 32]);
        assert_eq!(
            client.sign(SignKind::Vote, 7, 0, b"abc").unwrap(),
            Signed::Signature(b"abc".to_vec())
        );
        assert_eq!(
            client.sign(SignKind::Proposal, 6, 0, b"abc").unwrap(),
            Signed::Rejected("height already signed".to_string())
        );
        assert_eq!(client.commit_signed(4).unwrap(), Some(true));
        server.join().unwrap();
    }

    #[test]
    fn test_client_reports_backend_errors() {
        let temp_dir = TempDir::new().unwrap();
        let (listener, socket_path) = create_test_backend(&temp_dir);
        let server = spawn_backend(listener, 1, |_| BackendResponse::Error {
            message: "keystore locked".to_string(),
        });

        let err = BackendClient::new(&socket_path).pubkey().unwrap_err();
        assert!(err.to_string().contains("keystore locked"));
        server.join().unwrap();
    }

    #[test]
    fn test_client_unreachable_backend() {
        let temp_dir = TempDir::new().unwrap();
        let client = BackendClient::new(temp_dir.path().join("missing.sock"));
        assert!(matches!(
            client.commit_signed(1),
            Err(HandlerError::Backend(BackendError::Io(_)))
        ));
    }
}
