//! Remote signer protocol spoken between the validator node and SignCTRL.
//!
//! Messages travel as length-delimited frames (see [`crate::codec`]) over the
//! secret connection.

use serde::{Deserialize, Serialize};

/// Kind of vote the validator asks to have signed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VoteType {
    Prevote,
    Precommit,
}

/// Request to sign a vote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignVoteRequest {
    /// Chain the vote belongs to
    pub chain_id: String,
    /// Block height
    pub height: u64,
    /// Consensus round
    pub round: u32,
    pub vote_type: VoteType,
    /// Canonical bytes to sign
    pub sign_bytes: Vec<u8>,
}

/// Request to sign a block proposal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignProposalRequest {
    /// Chain the proposal belongs to
    pub chain_id: String,
    /// Block height
    pub height: u64,
    /// Consensus round
    pub round: u32,
    /// Canonical bytes to sign
    pub sign_bytes: Vec<u8>,
}

/// Outcome of a sign request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignResponse {
    /// Successful signature
    Success {
        /// The signature bytes
        signature: Vec<u8>,
    },
    /// This signer refused to sign (e.g. it is not the active signer)
    Rejected {
        /// Reason for rejection
        reason: String,
    },
    /// Internal error
    Error {
        /// Error message
        message: String,
    },
}

/// Response with the validator's public key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PubKeyResponse {
    Success { pubkey: Vec<u8> },
    Error { message: String },
}

/// All possible messages from the validator to SignCTRL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    Ping,
    PubKey,
    SignVote(SignVoteRequest),
    SignProposal(SignProposalRequest),
}

/// All possible messages from SignCTRL to the validator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Pong,
    PubKey(PubKeyResponse),
    SignedVote(SignResponse),
    SignedProposal(SignResponse),
}

impl Request {
    /// Height a sign request refers to, if any.
    pub fn height(&self) -> Option<u64> {
        match self {
            Request::SignVote(req) => Some(req.height),
            Request::SignProposal(req) => Some(req.height),
            Request::Ping | Request::PubKey => None,
        }
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Request::Ping => "ping",
            Request::PubKey => "pubkey",
            Request::SignVote(_) => "sign_vote",
            Request::SignProposal(_) => "sign_proposal",
        }
    }

    /// Build the response this request would get if it was rejected.
    pub fn rejection(&self, reason: impl Into<String>) -> Response {
        let reason = reason.into();
        match self {
            Request::Ping => Response::Pong,
            Request::PubKey => Response::PubKey(PubKeyResponse::Error { message: reason }),
            Request::SignVote(_) => Response::SignedVote(SignResponse::Rejected { reason }),
            Request::SignProposal(_) => {
                Response::SignedProposal(SignResponse::Rejected { reason })
            }
        }
    }

    /// Build the response this request would get if handling it failed.
    pub fn failure(&self, message: impl Into<String>) -> Response {
        let message = message.into();
        match self {
            Request::Ping => Response::Pong,
            Request::PubKey => Response::PubKey(PubKeyResponse::Error { message }),
            Request::SignVote(_) => Response::SignedVote(SignResponse::Error { message }),
            Request::SignProposal(_) => Response::SignedProposal(SignResponse::Error { message }),
        }
    }
}
