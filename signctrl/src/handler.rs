//! Request handling.
//!
//! The message loop hands every decoded request, together with the rank
//! counter, to a [`RequestHandler`]. The handler decides which observation
//! counts as a miss, unlocks or resets the counter, and reports back how the
//! loop has to continue.
//!
//! [`RankedHandler`] is the handler shipped with SignCTRL. It learns whether
//! the validator's signature made it into a commit from a
//! [`CommitInspector`] and leaves key custody and last-signed-state protection
//! to a [`Keystore`].

use crate::backend::BackendError;
use crate::counter::{CounterError, RankCounter};
use crate::protocol::{PubKeyResponse, Request, Response, SignResponse};
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("keystore error: {0}")]
    Keystore(String),

    #[error("commit inspection failed: {0}")]
    Inspector(String),
}

/// How the message loop continues after a request was handled.
#[derive(Debug)]
pub enum Outcome {
    Ok,
    /// Logged, the loop keeps running.
    Recoverable(HandlerError),
    /// The process has to stop signing and shut down.
    Fatal(CounterError),
}

/// Response to write back plus the outcome to act on afterwards.
#[derive(Debug)]
pub struct Handled {
    pub response: Response,
    pub outcome: Outcome,
}

impl Handled {
    pub fn ok(response: Response) -> Self {
        Self {
            response,
            outcome: Outcome::Ok,
        }
    }

    pub fn recoverable(response: Response, err: HandlerError) -> Self {
        Self {
            response,
            outcome: Outcome::Recoverable(err),
        }
    }

    pub fn fatal(response: Response, err: CounterError) -> Self {
        Self {
            response,
            outcome: Outcome::Fatal(err),
        }
    }
}

pub trait RequestHandler: Send + 'static {
    fn handle(&mut self, request: Request, counter: &mut RankCounter) -> Handled;
}

/// What is being signed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SignKind {
    Vote,
    Proposal,
}

/// Keystore answer to a sign request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signed {
    Signature(Vec<u8>),
    /// Refused, e.g. because it would conflict with the last signed state.
    Rejected(String),
}

/// Holder of the validator's signing key.
pub trait Keystore: Send {
    fn pubkey(&self) -> Result<Vec<u8>, HandlerError>;

    fn sign(
        &self,
        kind: SignKind,
        height: u64,
        round: u32,
        sign_bytes: &[u8],
    ) -> Result<Signed, HandlerError>;
}

/// Source of chain observations.
pub trait CommitInspector: Send {
    /// Whether the commit for `height` carries the validator's signature.
    ///
    /// `None` if the commit is not known yet.
    fn commit_signed(&self, height: u64) -> Result<Option<bool>, HandlerError>;
}

enum Interrupt {
    Fatal(CounterError),
    Failed(HandlerError),
}

impl From<HandlerError> for Interrupt {
    fn from(e: HandlerError) -> Self {
        Interrupt::Failed(e)
    }
}

/// Handler that signs only at rank 1 and promotes standbys on missed commits.
pub struct RankedHandler<K, C> {
    keystore: K,
    inspector: C,
}

impl<K, C> RankedHandler<K, C>
where
    K: Keystore,
    C: CommitInspector,
{
    pub fn new(keystore: K, inspector: C) -> Self {
        Self {
            keystore,
            inspector,
        }
    }

    /// Walk the counter up to `height`, feeding it the commit of every height
    /// in between.
    fn catch_up(&self, height: u64, counter: &mut RankCounter) -> Result<(), Interrupt> {
        // Misses are not counted while locked, so only the last finished
        // height can change anything.
        if counter.is_locked() {
            counter.advance_to(height.saturating_sub(1));
        }

        while counter.current_height() < height {
            let current = counter.current_height();
            match self.inspector.commit_signed(current)? {
                None => {
                    debug!("Commit for height {} not available yet", current);
                    break;
                }
                Some(true) => {
                    counter.unlock_counter();
                    counter.reset();
                    counter.next_height();
                }
                Some(false) => match counter.record_miss() {
                    Ok(_) | Err(CounterError::CounterLocked) => counter.next_height(),
                    Err(CounterError::ThresholdExceeded) => {
                        info!(
                            "Promoted to rank {}, skipping height {}",
                            counter.rank(),
                            current + 1
                        );
                        counter.next_height();
                    }
                    Err(e) => return Err(Interrupt::Fatal(e)),
                },
            }
        }

        Ok(())
    }

    fn handle_sign(
        &mut self,
        request: &Request,
        kind: SignKind,
        round: u32,
        sign_bytes: &[u8],
        counter: &mut RankCounter,
    ) -> Handled {
        let height = request.height().unwrap_or_default();

        match self.catch_up(height, counter) {
            Ok(()) => {}
            Err(Interrupt::Fatal(e)) => {
                error!("Couldn't keep rank at height {}: {}", height, e);
                return Handled::fatal(request.rejection(e.to_string()), e);
            }
            Err(Interrupt::Failed(e)) => {
                return Handled::recoverable(request.failure(e.to_string()), e);
            }
        }

        let rank = counter.rank();
        if rank != 1 {
            debug!(
                "Not signing {} at height {} (rank: {})",
                request.kind(),
                height,
                rank
            );
            return Handled::ok(request.rejection(format!("SignCTRL is on standby (rank {rank})")));
        }

        match self.keystore.sign(kind, height, round, sign_bytes) {
            Ok(Signed::Signature(signature)) => {
                debug!("Signed {} at height {}", request.kind(), height);
                Handled::ok(sign_response(kind, SignResponse::Success { signature }))
            }
            Ok(Signed::Rejected(reason)) => {
                warn!(
                    "Keystore refused to sign {} at height {}: {}",
                    request.kind(),
                    height,
                    reason
                );
                Handled::ok(request.rejection(reason))
            }
            Err(e) => Handled::recoverable(request.failure(e.to_string()), e),
        }
    }
}

fn sign_response(kind: SignKind, resp: SignResponse) -> Response {
    match kind {
        SignKind::Vote => Response::SignedVote(resp),
        SignKind::Proposal => Response::SignedProposal(resp),
    }
}

impl<K, C> RequestHandler for RankedHandler<K, C>
where
    K: Keystore + 'static,
    C: CommitInspector + 'static,
{
    fn handle(&mut self, request: Request, counter: &mut RankCounter) -> Handled {
        match &request {
            Request::Ping => Handled::ok(Response::Pong),
            Request::PubKey => match self.keystore.pubkey() {
                Ok(pubkey) => Handled::ok(Response::PubKey(PubKeyResponse::Success { pubkey })),
                Err(e) => Handled::recoverable(request.failure(e.to_string()), e),
            },
            Request::SignVote(req) => {
                self.handle_sign(&request, SignKind::Vote, req.round, &req.sign_bytes, counter)
            }
            Request::SignProposal(req) => self.handle_sign(
                &request,
                SignKind::Proposal,
                req.round,
                &req.sign_bytes,
                counter,
            ),
        }
    }
}
