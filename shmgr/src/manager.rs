//! Manager service: owns the segment table and answers client requests.
//!
//! # Architecture
//!
//! ```text
//!   client A ─┐                      ┌──────────────────────────┐
//!   client B ─┼── Unix socket ─────> │ shmgr-dispatch thread    │
//!   client C ─┘   (socket_path)      │  mio::Poll               │
//!                                    │  decode → table → encode │
//!                                    └────────────┬─────────────┘
//!                                                 │ Mutex
//!                                        ┌────────▼────────┐
//!                                        │  SegmentTable   │──> /dev/shm/shmgr-*
//!                                        └─────────────────┘
//! ```
//!
//! A single dispatch thread invokes every handler, so table mutations are
//! serialized; the table mutex is still held for each operation's duration.
//!
//! # Example
//!
//! ```no_run
//! use shmgr::manager::{Manager, ManagerConfig};
//!
//! let manager = Manager::spawn(ManagerConfig::default())?;
//! // ... clients connect to /tmp/shmgr.sock ...
//! manager.shutdown();
//! # Ok::<(), shmgr::manager::ManagerError>(())
//! ```

mod dispatch;
pub mod perm;
pub mod table;

use std::io;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use mio::net::UnixListener;
use mio::{Interest, Poll, Waker};

use crate::trace::{debug, error, info, warn};

use dispatch::{Dispatcher, LISTENER, WAKER};
use table::{Limits, PosixStore, SegmentTable};

/// Socket path used when neither the caller nor `SHMGR_SOCKET` names one.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/shmgr.sock";

/// Environment variable overriding [`DEFAULT_SOCKET_PATH`].
pub const SOCKET_ENV: &str = "SHMGR_SOCKET";

/// The socket path clients and the manager agree on by default.
#[must_use]
pub fn default_socket_path() -> PathBuf {
    std::env::var_os(SOCKET_ENV).map_or_else(|| PathBuf::from(DEFAULT_SOCKET_PATH), PathBuf::from)
}

/// Configuration for the manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Unix socket the manager listens on.
    pub socket_path: PathBuf,
    /// Upper bound on live segments.
    pub max_segments: usize,
    /// Slots added to the table each time it runs out.
    pub grow_increment: usize,
    /// Smallest segment size a Get may create.
    pub shmmin: u64,
    /// Largest segment size a Get may create.
    pub shmmax: u64,
    /// Permission bits of backing objects. Clients open them directly, so this
    /// must admit every uid that segment permissions may admit.
    pub backing_mode: u32,
    /// Permission bits of the socket file.
    pub socket_mode: u32,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            max_segments: 4096,
            grow_increment: 128,
            shmmin: 1,
            shmmax: 1 << 32,
            backing_mode: 0o666,
            socket_mode: 0o666,
        }
    }
}

impl ManagerConfig {
    fn limits(&self) -> Limits {
        Limits {
            // Segment ids are u32 on the wire.
            max_segments: self.max_segments.min(u32::MAX as usize),
            grow_increment: self.grow_increment,
            shmmin: self.shmmin,
            shmmax: self.shmmax,
        }
    }
}

/// Error spawning the manager.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    /// Another manager answers on the socket path.
    #[error("a manager is already listening on {}", .0.display())]
    AlreadyRunning(PathBuf),
    /// Failed to bind the socket.
    #[error("failed to bind {}: {source}", path.display())]
    Bind { path: PathBuf, source: io::Error },
    /// Failed to set up polling or the dispatch thread.
    #[error("failed to start dispatch: {0}")]
    Io(#[from] io::Error),
}

/// Handle to a running manager.
///
/// Dropping the handle stops the dispatch thread, the same as
/// [`Manager::shutdown`]. Every backing object is unlinked and the socket
/// file removed when the thread exits.
pub struct Manager {
    shutdown_flag: Arc<AtomicBool>,
    waker: Arc<Waker>,
    handle: Option<JoinHandle<()>>,
    socket_path: PathBuf,
    instance: u32,
}

impl Manager {
    /// Binds the socket and spawns the dispatch thread.
    ///
    /// A socket file left behind by a manager that died is removed first.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - another manager already answers on the socket path
    /// - the socket path exists and is not a socket
    /// - the socket cannot be bound
    /// - the poller or the dispatch thread cannot be created
    pub fn spawn(config: ManagerConfig) -> Result<Self, ManagerError> {
        let path = config.socket_path.clone();
        let instance = rand::random::<u32>();
        info!(
            socket = %path.display(),
            max_segments = config.max_segments,
            instance,
            "manager starting"
        );

        remove_stale_socket(&path)?;

        let mut listener = UnixListener::bind(&path).map_err(|source| {
            error!(socket = %path.display(), error = %source, "failed to bind socket");
            ManagerError::Bind {
                path: path.clone(),
                source,
            }
        })?;
        if let Err(e) =
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(config.socket_mode))
        {
            warn!(error = %e, "failed to set socket permissions");
        }

        let started = Self::start(&config, &mut listener, instance).and_then(
            |(poll, waker, table, shutdown_flag)| {
                let dispatcher =
                    Dispatcher::new(poll, listener, table, Arc::clone(&shutdown_flag));
                Self::spawn_dispatch(dispatcher, path.clone())
                    .map(|handle| (waker, handle, shutdown_flag))
            },
        );
        let (waker, handle, shutdown_flag) = match started {
            Ok(parts) => parts,
            Err(e) => {
                let _ = std::fs::remove_file(&path);
                return Err(e.into());
            }
        };

        info!("manager started");
        Ok(Self {
            shutdown_flag,
            waker,
            handle: Some(handle),
            socket_path: path,
            instance,
        })
    }

    #[allow(clippy::type_complexity)]
    fn start(
        config: &ManagerConfig,
        listener: &mut UnixListener,
        instance: u32,
    ) -> io::Result<(
        Poll,
        Arc<Waker>,
        Arc<Mutex<SegmentTable<PosixStore>>>,
        Arc<AtomicBool>,
    )> {
        let poll = Poll::new()?;
        poll.registry()
            .register(listener, LISTENER, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        let table = Arc::new(Mutex::new(SegmentTable::new(
            config.limits(),
            instance,
            PosixStore::new(config.backing_mode),
        )));
        Ok((poll, waker, table, Arc::new(AtomicBool::new(false))))
    }

    fn spawn_dispatch(
        mut dispatcher: Dispatcher<PosixStore>,
        path: PathBuf,
    ) -> io::Result<JoinHandle<()>> {
        debug!("spawning dispatch thread");
        thread::Builder::new()
            .name("shmgr-dispatch".into())
            .spawn(move || {
                info!("dispatch thread started");
                if let Err(e) = dispatcher.run() {
                    error!(error = %e, "dispatch loop failed");
                }
                // Closes the listener and unlinks every backing object.
                drop(dispatcher);
                let _ = std::fs::remove_file(&path);
                info!("dispatch thread exiting");
            })
    }

    /// Stops the dispatch thread and waits for it to exit.
    pub fn shutdown(mut self) {
        info!("manager shutdown initiated");
        self.stop();
        info!("manager shutdown complete");
    }

    fn stop(&mut self) {
        self.shutdown_flag.store(true, Ordering::Release);
        if let Err(e) = self.waker.wake() {
            warn!(error = %e, "failed to wake dispatch thread");
        }
        if let Some(handle) = self.handle.take() {
            debug!("waiting for dispatch thread to exit");
            let _ = handle.join();
        }
    }

    /// Blocks until the dispatch thread exits, which happens only after a
    /// shutdown request or a fatal poll error.
    pub fn wait(mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    /// Returns a clone of the shutdown flag for external signal handling.
    ///
    /// Setting the flag alone does not wake the dispatch thread; pair it with
    /// [`Manager::waker`].
    #[must_use]
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown_flag)
    }

    /// Waker that interrupts the dispatch thread's poll.
    #[must_use]
    pub fn waker(&self) -> Arc<Waker> {
        Arc::clone(&self.waker)
    }

    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Random tag of this manager instance, embedded in backing object names.
    #[must_use]
    pub const fn instance(&self) -> u32 {
        self.instance
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Refuses to start over a live manager or anything that is not a socket;
/// removes a dead manager's socket file.
fn remove_stale_socket(path: &Path) -> Result<(), ManagerError> {
    let metadata = match std::fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(source) => {
            return Err(ManagerError::Bind {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    if !metadata.file_type().is_socket() {
        warn!(socket = %path.display(), "path exists and is not a socket");
        return Err(ManagerError::Bind {
            path: path.to_path_buf(),
            source: io::ErrorKind::AlreadyExists.into(),
        });
    }
    if std::os::unix::net::UnixStream::connect(path).is_ok() {
        warn!(socket = %path.display(), "another manager is running");
        return Err(ManagerError::AlreadyRunning(path.to_path_buf()));
    }
    debug!(socket = %path.display(), "removing stale socket");
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(ManagerError::Bind {
            path: path.to_path_buf(),
            source,
        }),
    }
}
