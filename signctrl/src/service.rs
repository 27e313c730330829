//! Service lifecycle.
//!
//! A [`SignCtrl`] is either stopped or running. Starting it dials the
//! validator and spawns the message loop; stopping it tears the connection
//! down and joins the loop. The loop stops the service on its own only after
//! a fatal outcome, and of a fatal stop racing an external one exactly one
//! does the teardown.

use crate::config::{Config, ConfigError};
use crate::connection::{ConnKey, ConnKeyError, ConnectionManager};
use crate::counter::RankCounter;
use crate::handler::RequestHandler;
use crate::message_loop::MessageLoop;
use crate::shutdown::ShutdownToken;
use parking_lot::Mutex;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info};

/// Name of the thread running the message loop.
pub const LOOP_THREAD_NAME: &str = "signctrl-loop";

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("SignCTRL is already running")]
    AlreadyRunning,

    #[error("couldn't load connection key: {0}")]
    ConnKey(#[from] ConnKeyError),

    #[error("couldn't spawn message loop: {0}")]
    Spawn(#[source] io::Error),

    #[error("start was aborted by stop")]
    Cancelled,
}

/// Where and how the service connects.
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    /// Directory holding `conn.key`
    pub config_dir: PathBuf,
    /// Validator address in `host:port` form
    pub validator_address: String,
    pub retry_dial_after: Duration,
}

impl ServiceSettings {
    pub fn from_config(config: &Config, config_dir: &Path) -> Result<Self, ConfigError> {
        Ok(Self {
            config_dir: config_dir.to_path_buf(),
            validator_address: config.validator_address()?,
            retry_dial_after: config.init.retry_dial_after,
        })
    }
}

enum State {
    Stopped,
    /// Dialing the validator. The token is the one the run will use.
    Starting(Arc<ShutdownToken>),
    Running(Run),
}

struct Run {
    shutdown: Arc<ShutdownToken>,
    connection: Arc<ConnectionManager>,
    thread: Option<JoinHandle<()>>,
}

struct Inner<H> {
    settings: ServiceSettings,
    handler: Arc<Mutex<H>>,
    counter: Arc<Mutex<RankCounter>>,
    state: Mutex<State>,
    stopped_on_fatal: AtomicBool,
}

/// The SignCTRL service.
pub struct SignCtrl<H> {
    inner: Arc<Inner<H>>,
}

impl<H: RequestHandler> SignCtrl<H> {
    pub fn new(settings: ServiceSettings, counter: RankCounter, handler: H) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings,
                handler: Arc::new(Mutex::new(handler)),
                counter: Arc::new(Mutex::new(counter)),
                state: Mutex::new(State::Stopped),
                stopped_on_fatal: AtomicBool::new(false),
            }),
        }
    }

    /// Load the connection key, dial the validator and spawn the message loop.
    ///
    /// Blocks until the validator is reachable. A concurrent [`stop`] aborts
    /// the dial and makes this return [`ServiceError::Cancelled`].
    ///
    /// [`stop`]: SignCtrl::stop
    pub fn start(&self) -> Result<(), ServiceError> {
        let inner = &self.inner;
        let shutdown = Arc::new(ShutdownToken::new());
        let conn_key = {
            let mut state = inner.state.lock();
            if !matches!(*state, State::Stopped) {
                return Err(ServiceError::AlreadyRunning);
            }

            info!("Starting SignCTRL... (rank: {})", self.rank());
            let conn_key = ConnKey::load(&inner.settings.config_dir)?;
            *state = State::Starting(Arc::clone(&shutdown));
            conn_key
        };
        debug!("Loaded connection key {}", conn_key.fingerprint());

        let connection = Arc::new(ConnectionManager::new(
            inner.settings.validator_address.clone(),
            conn_key,
            inner.settings.retry_dial_after,
            Arc::clone(&shutdown),
        ));
        let dialed = connection.retry_dial();

        let mut state = inner.state.lock();
        let conn = match (&*state, dialed) {
            (State::Starting(token), Some(conn)) if Arc::ptr_eq(token, &shutdown) => conn,
            _ => {
                connection.close();
                debug!("Start aborted by a concurrent stop");
                return Err(ServiceError::Cancelled);
            }
        };

        inner.counter.lock().lock_counter();
        inner.stopped_on_fatal.store(false, Ordering::SeqCst);

        let weak = Arc::downgrade(inner);
        let message_loop = MessageLoop {
            handler: Arc::clone(&inner.handler),
            counter: Arc::clone(&inner.counter),
            connection: Arc::clone(&connection),
            shutdown: Arc::clone(&shutdown),
            on_fatal: Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.stopped_on_fatal.store(true, Ordering::SeqCst);
                    inner.stop();
                }
            }),
        };

        let spawned = thread::Builder::new()
            .name(LOOP_THREAD_NAME.to_string())
            .spawn(move || message_loop.run(conn));
        let thread = match spawned {
            Ok(thread) => thread,
            Err(e) => {
                *state = State::Stopped;
                shutdown.cancel();
                connection.close();
                return Err(ServiceError::Spawn(e));
            }
        };

        *state = State::Running(Run {
            shutdown,
            connection,
            thread: Some(thread),
        });
        Ok(())
    }

    /// Stop the service. Returns `true` if this call did the teardown or
    /// aborted a pending start.
    pub fn stop(&self) -> bool {
        self.inner.stop()
    }

    /// Block until the current run has stopped.
    pub fn wait(&self) {
        let shutdown = match &*self.inner.state.lock() {
            State::Starting(shutdown) => Arc::clone(shutdown),
            State::Running(run) => Arc::clone(&run.shutdown),
            State::Stopped => return,
        };
        shutdown.wait();
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.inner.state.lock(), State::Running(_))
    }

    /// Whether the last run saw a fatal outcome, even if an external stop
    /// did the teardown.
    pub fn stopped_on_fatal(&self) -> bool {
        self.inner.stopped_on_fatal.load(Ordering::SeqCst)
    }

    pub fn rank(&self) -> u32 {
        self.inner.counter.lock().rank()
    }

    pub fn current_height(&self) -> u64 {
        self.inner.counter.lock().current_height()
    }
}

impl<H> Inner<H> {
    fn stop(&self) -> bool {
        let run = match std::mem::replace(&mut *self.state.lock(), State::Stopped) {
            State::Running(run) => run,
            State::Starting(shutdown) => {
                shutdown.cancel();
                info!("Aborting SignCTRL start");
                return true;
            }
            State::Stopped => return false,
        };

        run.shutdown.cancel();
        run.connection.close();
        // Waits for a request that is still being handled.
        info!("Stopping SignCTRL... (rank: {})", self.counter.lock().rank());

        if let Some(thread) = run.thread {
            if thread.thread().id() == thread::current().id() {
                debug!("Stop requested by the message loop itself");
            } else if thread.join().is_err() {
                error!("Message loop panicked");
            }
        }
        true
    }
}

impl<H> Drop for SignCtrl<H> {
    fn drop(&mut self) {
        self.inner.stop();
    }
}
