//! Receive loop between the validator and the request handler.

use crate::codec::{self, CodecError, MAX_REMOTE_SIGNER_MSG_SIZE};
use crate::connection::ConnectionManager;
use crate::counter::RankCounter;
use crate::handler::{Outcome, RequestHandler};
use crate::protocol::Request;
use crate::secret_connection::SecretConnection;
use crate::shutdown::ShutdownToken;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Everything the loop thread needs for one run of the service.
pub struct MessageLoop<H> {
    pub(crate) handler: Arc<Mutex<H>>,
    pub(crate) counter: Arc<Mutex<RankCounter>>,
    pub(crate) connection: Arc<ConnectionManager>,
    pub(crate) shutdown: Arc<ShutdownToken>,
    /// Asks the service to stop after a fatal outcome.
    pub(crate) on_fatal: Box<dyn FnOnce() + Send>,
}

impl<H: RequestHandler> MessageLoop<H> {
    /// Serve requests on `conn` until the service stops or a request fails
    /// fatally.
    pub fn run(self, mut conn: SecretConnection) {
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            let request: Request = match codec::read_msg(&mut conn, MAX_REMOTE_SIGNER_MSG_SIZE) {
                Ok(request) => request,
                Err(CodecError::Eof) => {
                    if self.shutdown.is_cancelled() {
                        break;
                    }
                    debug!("Validator closed the connection");
                    match self.reconnect() {
                        Some(next) => {
                            conn = next;
                            continue;
                        }
                        None => break,
                    }
                }
                Err(e) if e.is_skippable() => {
                    warn!("Skipping message: {}", e);
                    continue;
                }
                Err(e) => {
                    if self.shutdown.is_cancelled() {
                        break;
                    }
                    error!("Couldn't read message: {}", e);
                    match self.reconnect() {
                        Some(next) => {
                            conn = next;
                            continue;
                        }
                        None => break,
                    }
                }
            };

            debug!("Received {} request", request.kind());
            let handled = {
                let mut handler = self.handler.lock();
                let mut counter = self.counter.lock();
                handler.handle(request, &mut counter)
            };

            if let Err(e) =
                codec::write_msg(&mut conn, &handled.response, MAX_REMOTE_SIGNER_MSG_SIZE)
            {
                error!("Couldn't write response: {}", e);
            }

            match handled.outcome {
                Outcome::Ok => {}
                Outcome::Recoverable(e) => error!("Couldn't handle request: {}", e),
                Outcome::Fatal(e) => {
                    error!("Couldn't handle request: {}", e);
                    debug!("Terminating message loop");
                    if let Err(e) = conn.close() {
                        debug!("Couldn't close connection: {}", e);
                    }
                    (self.on_fatal)();
                    return;
                }
            }
        }

        debug!("Message loop stopped");
        if let Err(e) = conn.close() {
            debug!("Couldn't close connection: {}", e);
        }
    }

    /// Replace a broken connection. Misses are not counted until the handler
    /// sees the validator's signature again.
    fn reconnect(&self) -> Option<SecretConnection> {
        self.connection.close();
        self.counter.lock().lock_counter();
        self.connection.retry_dial()
    }
}
