//! Manager dispatch thread.
//!
//! One thread owns the listening socket and every client connection and
//! blocks in [`mio::Poll`] until one of them is ready. Complete requests are
//! decoded, answered against the segment table and the reply queued on the
//! same connection, so a client always reads replies in request order.
//!
//! Decoding and encoding happen here and only here; table handlers return a
//! plain `Result<Reply, ShmError>`.

use std::collections::HashMap;
use std::io::{self, ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use mio::net::{UnixListener, UnixStream};
use mio::{Events, Interest, Poll, Token};

use crate::error::ShmError;
use crate::protocol::{
    HEADER_SIZE, Header, MAX_MESSAGE_SIZE, ProtocolError, Reply, Request, SERVICE_ID,
    decode_request, encode_not_handled, encode_reply,
};
use crate::trace::{debug, info, trace, warn};
use crate::types::{ControlCommand, Credentials};

use super::table::{BackingStore, SegmentTable};

pub(crate) const LISTENER: Token = Token(0);
pub(crate) const WAKER: Token = Token(1);
const FIRST_CONNECTION: usize = 2;

const EVENT_CAPACITY: usize = 64;
const READ_CHUNK: usize = 512;

/// Per-client connection state.
struct Connection {
    stream: UnixStream,
    inbuf: Vec<u8>,
    outbuf: Vec<u8>,
    /// Whether the stream is currently registered for writability.
    want_write: bool,
}

impl Connection {
    fn new(stream: UnixStream) -> Self {
        Self {
            stream,
            inbuf: Vec::with_capacity(READ_CHUNK),
            outbuf: Vec::new(),
            want_write: false,
        }
    }
}

/// What to do with a connection after servicing it.
enum Next {
    Keep,
    Close,
}

/// Dispatch loop state.
pub(crate) struct Dispatcher<S: BackingStore> {
    poll: Poll,
    listener: UnixListener,
    connections: HashMap<Token, Connection>,
    next_token: usize,
    table: Arc<Mutex<SegmentTable<S>>>,
    shutdown_flag: Arc<AtomicBool>,
    /// Reusable buffer for encoding replies.
    encode_buf: Vec<u8>,
}

impl<S: BackingStore> Dispatcher<S> {
    /// `listener` must already be registered with `poll` under [`LISTENER`],
    /// and a waker under [`WAKER`].
    pub(crate) fn new(
        poll: Poll,
        listener: UnixListener,
        table: Arc<Mutex<SegmentTable<S>>>,
        shutdown_flag: Arc<AtomicBool>,
    ) -> Self {
        Self {
            poll,
            listener,
            connections: HashMap::new(),
            next_token: FIRST_CONNECTION,
            table,
            shutdown_flag,
            encode_buf: Vec::with_capacity(MAX_MESSAGE_SIZE),
        }
    }

    /// Runs until the shutdown flag is set and the waker fires.
    pub(crate) fn run(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(EVENT_CAPACITY);

        while !self.shutdown_flag.load(Ordering::Acquire) {
            match self.poll.poll(&mut events, None) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            for event in &events {
                match event.token() {
                    LISTENER => self.accept_all(),
                    WAKER => {
                        trace!("dispatch woken");
                    }
                    token => {
                        let next = self.service(token, event.is_readable(), event.is_writable());
                        if matches!(next, Next::Close) {
                            self.close(token);
                        }
                    }
                }
            }
        }

        info!(connections = self.connections.len(), "dispatch loop stopping");
        Ok(())
    }

    fn accept_all(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, _)) => {
                    let token = Token(self.next_token);
                    self.next_token += 1;
                    if let Err(e) = self
                        .poll
                        .registry()
                        .register(&mut stream, token, Interest::READABLE)
                    {
                        warn!(error = %e, "failed to register connection");
                        continue;
                    }
                    debug!(token = token.0, "connection accepted");
                    self.connections.insert(token, Connection::new(stream));
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    return;
                }
            }
        }
    }

    fn close(&mut self, token: Token) {
        if let Some(mut conn) = self.connections.remove(&token) {
            let _ = self.poll.registry().deregister(&mut conn.stream);
            debug!(token = token.0, "connection closed");
        }
    }

    fn service(&mut self, token: Token, readable: bool, writable: bool) -> Next {
        let Some(mut conn) = self.connections.remove(&token) else {
            return Next::Keep;
        };

        let mut next = Next::Keep;
        if readable {
            next = self.read_requests(&mut conn);
        }
        if matches!(next, Next::Keep) && (writable || !conn.outbuf.is_empty()) {
            next = self.flush(token, &mut conn);
        }

        self.connections.insert(token, conn);
        next
    }

    /// Drains the socket and answers every complete request in it.
    fn read_requests(&mut self, conn: &mut Connection) -> Next {
        let mut chunk = [0u8; READ_CHUNK];
        let mut eof = false;
        loop {
            match conn.stream.read(&mut chunk) {
                Ok(0) => {
                    eof = true;
                    break;
                }
                Ok(n) => conn.inbuf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    debug!(error = %e, "read failed");
                    return Next::Close;
                }
            }
        }

        let mut consumed = 0;
        while conn.inbuf.len() - consumed >= HEADER_SIZE {
            let pending = &conn.inbuf[consumed..];
            let total = match Header::decode(pending).and_then(|h| h.total_len()) {
                Ok(total) => total,
                Err(err) => {
                    warn!(error = %err, "unframeable message, dropping connection");
                    return Next::Close;
                }
            };
            if pending.len() < total {
                break;
            }

            let mut message = [0u8; MAX_MESSAGE_SIZE];
            message[..total].copy_from_slice(&pending[..total]);
            if let Err(err) = self.answer(conn, &message[..total]) {
                warn!(error = %err, "malformed request, dropping connection");
                return Next::Close;
            }
            consumed += total;
        }
        conn.inbuf.drain(..consumed);

        if eof { Next::Close } else { Next::Keep }
    }

    /// Answers one complete message by appending its reply to the connection.
    fn answer(&mut self, conn: &mut Connection, message: &[u8]) -> Result<(), ProtocolError> {
        let header = Header::decode(message)?;
        if header.service != SERVICE_ID {
            debug!(service = header.service, "request for foreign service");
            encode_not_handled(&mut self.encode_buf, header.subtype);
            conn.outbuf.extend_from_slice(&self.encode_buf);
            return Ok(());
        }

        let request = decode_request(message)?;
        let subtype = request.subtype();
        let outcome = match peer_credentials(&conn.stream) {
            Ok(who) => handle(&self.table, &who, request),
            Err(e) => {
                warn!(error = %e, "failed to query peer credentials");
                Err(ShmError::PermissionDenied)
            }
        };
        if let Err(err) = &outcome {
            trace!(%subtype, errno = err.errno(), "request failed");
        }

        encode_reply(subtype, &outcome, &mut self.encode_buf);
        conn.outbuf.extend_from_slice(&self.encode_buf);
        Ok(())
    }

    /// Writes as much pending output as the socket takes, and keeps the
    /// writable interest in step with whether anything is left.
    fn flush(&mut self, token: Token, conn: &mut Connection) -> Next {
        let mut written = 0;
        while written < conn.outbuf.len() {
            match conn.stream.write(&conn.outbuf[written..]) {
                Ok(0) => return Next::Close,
                Ok(n) => written += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    debug!(error = %e, "write failed");
                    return Next::Close;
                }
            }
        }
        conn.outbuf.drain(..written);

        let want_write = !conn.outbuf.is_empty();
        if want_write != conn.want_write {
            let interest = if want_write {
                Interest::READABLE | Interest::WRITABLE
            } else {
                Interest::READABLE
            };
            if self
                .poll
                .registry()
                .reregister(&mut conn.stream, token, interest)
                .is_err()
            {
                return Next::Close;
            }
            conn.want_write = want_write;
        }
        Next::Keep
    }
}

fn peer_credentials(stream: &UnixStream) -> io::Result<Credentials> {
    let cred = rustix::net::sockopt::socket_peercred(stream)?;
    Ok(Credentials::new(
        cred.uid.as_raw(),
        cred.gid.as_raw(),
        cred.pid.as_raw_nonzero().get(),
    ))
}

/// Routes a request to the table. The table lock is held for the whole call.
pub(crate) fn handle<S: BackingStore>(
    table: &Mutex<SegmentTable<S>>,
    who: &Credentials,
    request: Request,
) -> Result<Reply, ShmError> {
    let mut table = table.lock().unwrap_or_else(PoisonError::into_inner);

    match request {
        Request::Get(r) => table.get(who, r.key, r.size, r.flags).map(Reply::Get),
        Request::Attach(r) => table.attach(who, r.id, r.flags).map(Reply::Attach),
        Request::Detach(r) => table.detach(who, r.id, r.seq).map(|()| Reply::Detach),
        Request::Control(r) => {
            let command = ControlCommand::try_from(r.command)?;
            table
                .control(who, r.id, command, &r.stat)
                .map(Reply::Control)
        }
    }
}
