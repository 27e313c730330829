//! SignCTRL: high-availability signing for validators.
//!
//! Several SignCTRL processes sit in front of the same validator key, each
//! with a distinct rank. Only the rank 1 process signs. Every other process
//! watches the chain and, once the active signer has missed `threshold`
//! blocks in a row, promotes itself by one rank. A rank 1 process that misses
//! that many blocks itself cannot be promoted any further and shuts down.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐  secret connection  ┌─────────────────┐  Unix socket  ┌─────────┐
//! │  Validator Node │ ◄─────────────────► │    SignCTRL     │ ◄───────────► │ Backend │
//! │                 │  Request/Response   │  (this crate)   │               │         │
//! └─────────────────┘                     └─────────────────┘               └─────────┘
//! ```
//!
//! ## Usage
//!
//! Create the configuration directory with a default `config.toml` and a
//! fresh connection key, then start the service:
//! ```bash
//! signctrl init
//! signctrl start
//! ```

pub mod backend;
pub mod codec;
pub mod config;
pub mod connection;
pub mod counter;
pub mod handler;
pub mod message_loop;
pub mod protocol;
pub mod secret_connection;
pub mod service;
pub mod shutdown;

pub use backend::{BackendClient, BackendError};
pub use config::{Config, ConfigError};
pub use connection::{ConnKey, ConnKeyError, ConnectionError, ConnectionManager};
pub use counter::{CounterError, MissProgress, NoopObserver, RankCounter, RankObserver};
pub use handler::{
    CommitInspector, Handled, HandlerError, Keystore, Outcome, RankedHandler, RequestHandler,
};
pub use protocol::{PubKeyResponse, Request, Response, SignResponse};
pub use service::{ServiceError, ServiceSettings, SignCtrl};
