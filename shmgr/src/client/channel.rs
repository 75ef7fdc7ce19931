//! Cached connection to the manager.
//!
//! A context holds at most one current [`Channel`], published through an
//! [`AtomicPtr`]. The fast path is a single acquire load. When an exchange on
//! the current channel fails, the caller connects afresh, resends the request
//! once on the new connection and then tries to publish it with a
//! compare-and-swap; a caller that loses the race closes its own connection.
//!
//! Channels replaced this way are shut down but not freed until the cache
//! itself is dropped, because other threads may still hold a reference to
//! them. Reconnects only happen when the manager goes away, so the retired
//! list stays short.

use std::io::{self, Read};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::{Mutex, PoisonError};

use rustix::net::{SendFlags, send};

use crate::error::ShmError;
use crate::protocol::{
    HEADER_SIZE, Header, MAX_MESSAGE_SIZE, Reply, Request, decode_reply, encode_request,
};
use crate::trace::{debug, warn};

/// One connection to the manager.
pub(crate) struct Channel {
    stream: UnixStream,
    /// Held across send and receive so that replies on the byte stream pair
    /// up with their requests.
    exchange: Mutex<()>,
}

impl Channel {
    fn connect(path: &Path) -> io::Result<Self> {
        let stream = UnixStream::connect(path)?;
        debug!(socket = %path.display(), "connected to manager");
        Ok(Self {
            stream,
            exchange: Mutex::new(()),
        })
    }

    /// Sends one encoded request and reads the complete reply into `reply`,
    /// returning its length.
    fn exchange(&self, request: &[u8], reply: &mut [u8; MAX_MESSAGE_SIZE]) -> io::Result<usize> {
        let _guard = self.exchange.lock().unwrap_or_else(PoisonError::into_inner);

        let mut sent = 0;
        while sent < request.len() {
            match send(&self.stream, &request[sent..], SendFlags::NOSIGNAL) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => sent += n,
                Err(rustix::io::Errno::INTR) => {}
                Err(e) => return Err(e.into()),
            }
        }

        let mut stream = &self.stream;
        stream.read_exact(&mut reply[..HEADER_SIZE])?;
        let total = Header::decode(&reply[..HEADER_SIZE])
            .and_then(|h| h.total_len())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        stream.read_exact(&mut reply[HEADER_SIZE..total])?;
        Ok(total)
    }

    fn shutdown(&self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}

/// Lazily established, shared manager channel.
pub(crate) struct ChannelCache {
    path: PathBuf,
    current: AtomicPtr<Channel>,
    retired: Mutex<Vec<Box<Channel>>>,
}

impl ChannelCache {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self {
            path,
            current: AtomicPtr::new(ptr::null_mut()),
            retired: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Whether a channel is currently published.
    #[cfg(test)]
    pub(crate) fn is_connected(&self) -> bool {
        !self.current.load(Ordering::Acquire).is_null()
    }

    /// Sends `request` and returns the manager's answer.
    ///
    /// Transport failures surface as [`ShmError::NotSupported`] once the
    /// single reconnect-and-resend has failed too.
    pub(crate) fn call(&self, request: &Request) -> Result<Reply, ShmError> {
        let mut encoded = Vec::with_capacity(MAX_MESSAGE_SIZE);
        encode_request(request, &mut encoded);
        let mut reply = [0u8; MAX_MESSAGE_SIZE];

        let seen = self.current.load(Ordering::Acquire);
        // SAFETY: Published channels are only freed when `self` is dropped.
        if let Some(channel) = unsafe { seen.as_ref() } {
            match channel.exchange(&encoded, &mut reply) {
                Ok(len) => return Self::decode(&reply[..len], request),
                Err(e) => {
                    debug!(error = %e, "manager channel failed, reconnecting");
                }
            }
        }

        let fresh = Channel::connect(&self.path).map_err(|e| {
            warn!(socket = %self.path.display(), error = %e, "manager unreachable");
            ShmError::NotSupported
        })?;
        let len = fresh.exchange(&encoded, &mut reply).map_err(|e| {
            warn!(error = %e, "request failed on fresh manager channel");
            ShmError::NotSupported
        })?;
        self.publish(Box::new(fresh), seen);
        Self::decode(&reply[..len], request)
    }

    fn decode(bytes: &[u8], request: &Request) -> Result<Reply, ShmError> {
        decode_reply(bytes, request.subtype()).unwrap_or_else(|err| {
            warn!(error = %err, "malformed reply from manager");
            Err(ShmError::NotSupported)
        })
    }

    /// Replaces `seen` with `fresh` unless another thread got there first.
    fn publish(&self, fresh: Box<Channel>, seen: *mut Channel) {
        let fresh = Box::into_raw(fresh);
        match self
            .current
            .compare_exchange(seen, fresh, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(old) if !old.is_null() => {
                // SAFETY: `old` came from `Box::into_raw` in an earlier publish
                // and has just been unlinked from `current`, so this is its
                // only owner.
                let old = unsafe { Box::from_raw(old) };
                old.shutdown();
                self.retired
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(old);
            }
            Ok(_) => {}
            Err(_) => {
                // SAFETY: `fresh` was never published.
                drop(unsafe { Box::from_raw(fresh) });
            }
        }
    }
}

impl Drop for ChannelCache {
    fn drop(&mut self) {
        let current = std::mem::replace(self.current.get_mut(), ptr::null_mut());
        if !current.is_null() {
            // SAFETY: `&mut self` means no other reference to the channel remains.
            drop(unsafe { Box::from_raw(current) });
        }
    }
}
