//! Tokio driver for a [`Session`]
//!
//! [`Connection`] owns one socket. It can be used directly through
//! [`Connection::next_event`] and the send methods, or handed to
//! [`Connection::run`], which forwards events into a channel and executes
//! [`Command`]s from the application until the socket is closed.

use std::collections::VecDeque;
use std::io;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::Config;
use crate::error::{CloseReason, Error, ErrorKind, Result};
use crate::session::{ConnectionState, Event, Session};

/// Request from the application to a running connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Send one text or binary message
    Send {
        /// Message payload
        payload: Bytes,
        /// Send as a text frame
        is_text: bool,
    },
    /// Start the closing handshake
    Close {
        /// Close status code
        code: u16,
        /// Reason text (at most 123 bytes)
        reason: String,
    },
}

/// Cloneable sender half used to drive a connection running [`Connection::run`]
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    tx: mpsc::Sender<Command>,
}

impl ConnectionHandle {
    /// Create a handle and the command receiver to pass to `run`
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Command>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Queue a message, waiting for channel capacity
    pub async fn send(&self, payload: impl Into<Bytes>, is_text: bool) -> Result<()> {
        self.command(Command::Send {
            payload: payload.into(),
            is_text,
        })
        .await
    }

    /// Ask the connection to close
    pub async fn close(&self, code: u16, reason: impl Into<String>) -> Result<()> {
        self.command(Command::Close {
            code,
            reason: reason.into(),
        })
        .await
    }

    /// Queue a command, waiting for channel capacity
    pub async fn command(&self, command: Command) -> Result<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| Error::ConnectionClosed)
    }

    /// Queue a command without waiting
    ///
    /// Fails with `ConnectionClosed` if the connection is gone and with
    /// `InvalidState` if its command queue is full.
    pub fn try_command(&self, command: Command) -> Result<()> {
        self.tx.try_send(command).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => Error::InvalidState("command queue full"),
            mpsc::error::TrySendError::Closed(_) => Error::ConnectionClosed,
        })
    }

    /// Whether the connection has stopped accepting commands
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// One accepted WebSocket connection over an async byte stream
pub struct Connection<S> {
    stream: S,
    session: Session,
    read_buf: BytesMut,
    read_buffer_size: usize,
    pending: VecDeque<Event>,
    close_timeout: Duration,
    close_deadline: Option<Instant>,
    channel_capacity: usize,
}

/// Result of one wait inside the run loop
enum Step {
    Read(io::Result<usize>),
    CloseTimedOut,
    Command(Option<Command>),
}

/// Read into `buf`, giving up at `deadline`
///
/// Cancel-safe: `read_buf` is, and a timed-out read consumed nothing.
async fn read_until<S: AsyncRead + Unpin>(
    stream: &mut S,
    buf: &mut BytesMut,
    deadline: Option<Instant>,
) -> Step {
    match deadline {
        Some(deadline) => match tokio::time::timeout_at(deadline, stream.read_buf(buf)).await {
            Ok(read) => Step::Read(read),
            Err(_) => Step::CloseTimedOut,
        },
        None => Step::Read(stream.read_buf(buf).await),
    }
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Run the upgrade handshake on a freshly accepted stream
    ///
    /// On success the `101` response has been written. On rejection the
    /// `400` response is written, the stream is shut down and the
    /// handshake error is returned.
    pub async fn accept(stream: S, config: Config) -> Result<Self> {
        let mut conn = Self {
            stream,
            session: Session::new(&config),
            read_buf: BytesMut::with_capacity(config.read_buffer_size),
            read_buffer_size: config.read_buffer_size,
            pending: VecDeque::new(),
            close_timeout: config.close_timeout,
            close_deadline: None,
            channel_capacity: config.channel_capacity,
        };

        while conn.session.state() == ConnectionState::Connecting {
            conn.read_buf.reserve(conn.read_buffer_size);
            if conn.stream.read_buf(&mut conn.read_buf).await? == 0 {
                debug!("peer hung up during handshake");
                conn.session.socket_closed();
                return Err(Error::ConnectionClosed);
            }

            let chunk = conn.read_buf.split();
            match conn.session.receive(&chunk) {
                Ok(events) => conn.pending.extend(events),
                Err(err) => {
                    let _ = conn.flush().await;
                    let _ = conn.stream.shutdown().await;
                    return Err(err);
                }
            }
        }

        conn.flush().await?;
        Ok(conn)
    }

    /// Create a handle and the command receiver to pass to [`run`](Self::run),
    /// sized by `Config::channel_capacity`
    pub fn command_channel(&self) -> (ConnectionHandle, mpsc::Receiver<Command>) {
        ConnectionHandle::channel(self.channel_capacity)
    }

    /// Current session state
    pub fn state(&self) -> ConnectionState {
        self.session.state()
    }

    /// Subprotocol agreed during the handshake
    pub fn subprotocol(&self) -> Option<&str> {
        self.session.subprotocol()
    }

    /// Request path of the upgrade request
    pub fn path(&self) -> Option<&str> {
        self.session.path()
    }

    /// Send a single-frame text or binary message
    pub async fn send(&mut self, payload: impl AsRef<[u8]>, is_text: bool) -> Result<()> {
        self.session.send(payload.as_ref(), is_text)?;
        self.flush().await
    }

    /// Start the closing handshake
    ///
    /// Events keep flowing from [`next_event`](Self::next_event) until the
    /// peer answers or `close_timeout` expires.
    pub async fn send_close(&mut self, code: u16, reason: &str) -> Result<()> {
        self.session.send_close(code, reason)?;
        self.flush().await
    }

    /// Send a Ping; the reply arrives as [`Event::Pong`]
    pub async fn ping(&mut self, payload: impl AsRef<[u8]>) -> Result<()> {
        self.session.ping(payload.as_ref())?;
        self.flush().await
    }

    /// Wait for the next event
    ///
    /// Returns `None` once the connection is CLOSED and every event has
    /// been delivered.
    pub async fn next_event(&mut self) -> Option<Event> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            if !self.drive().await {
                // An abrupt close in drive() may have queued events
                if self.pending.is_empty() {
                    return None;
                }
                continue;
            }
            let deadline = self.close_deadline;
            let step = read_until(&mut self.stream, &mut self.read_buf, deadline).await;
            self.handle_step(step).await;
        }
    }

    /// Per-connection receive loop
    ///
    /// Forwards every event, in order, to `events` (wrapped by `tag`) and
    /// executes commands until the connection is CLOSED. If every
    /// [`ConnectionHandle`] is dropped the connection closes with 1001; if
    /// `events` is dropped, further events are discarded and the connection
    /// closes the same way.
    pub async fn run<T, F>(
        mut self,
        events: mpsc::Sender<T>,
        mut commands: mpsc::Receiver<Command>,
        tag: F,
    ) where
        F: Fn(Event) -> T,
    {
        let mut commands_open = true;
        let mut events_open = true;

        loop {
            while let Some(event) = self.pending.pop_front() {
                if events_open && events.send(tag(event)).await.is_err() {
                    debug!("event receiver dropped");
                    events_open = false;
                    self.close_quietly(CloseReason::GOING_AWAY);
                }
            }

            if !self.drive().await {
                if self.pending.is_empty() {
                    break;
                }
                continue;
            }

            let deadline = self.close_deadline;
            let step = tokio::select! {
                step = read_until(&mut self.stream, &mut self.read_buf, deadline) => step,
                command = commands.recv(), if commands_open => Step::Command(command),
            };

            match step {
                Step::Command(Some(command)) => self.execute(command),
                Step::Command(None) => {
                    debug!("all connection handles dropped");
                    commands_open = false;
                    self.close_quietly(CloseReason::GOING_AWAY);
                }
                step => self.handle_step(step).await,
            }
        }
    }

    fn execute(&mut self, command: Command) {
        let result = match command {
            Command::Send { payload, is_text } => self.session.send(&payload, is_text),
            Command::Close { code, reason } => self.session.send_close(code, &reason),
        };
        if let Err(err) = result {
            debug!(error = %err, "command rejected");
        }
    }

    fn close_quietly(&mut self, code: u16) {
        if self.session.state() == ConnectionState::Open {
            let _ = self.session.send_close(code, "");
        }
    }

    /// Flush, then shut down or arm the close timer as the session requires
    ///
    /// Returns `false` once the session is CLOSED.
    async fn drive(&mut self) -> bool {
        loop {
            if let Err(err) = self.flush().await {
                self.abort(err).await;
            }
            match self.session.state() {
                ConnectionState::Closed => return false,
                _ if self.session.wants_shutdown() => {
                    trace!("shutting down socket");
                    let _ = self.stream.shutdown().await;
                    self.pending.extend(self.session.socket_closed());
                }
                _ => {
                    if self.session.awaiting_close_reply() && self.close_deadline.is_none() {
                        self.close_deadline = Some(Instant::now() + self.close_timeout);
                    }
                    return true;
                }
            }
        }
    }

    async fn handle_step(&mut self, step: Step) {
        match step {
            Step::Read(Ok(0)) => {
                debug!("peer closed the socket");
                self.pending.extend(self.session.socket_closed());
            }
            Step::Read(Ok(n)) => {
                trace!(n, "read from socket");
                let chunk = self.read_buf.split();
                self.read_buf.reserve(self.read_buffer_size);
                match self.session.receive(&chunk) {
                    Ok(events) => self.pending.extend(events),
                    Err(err) => debug!(error = %err, "input after close"),
                }
            }
            Step::Read(Err(err)) => self.abort(err.into()).await,
            Step::CloseTimedOut => {
                warn!("peer did not answer close in time");
                let _ = self.stream.shutdown().await;
                self.pending.extend(self.session.socket_closed());
            }
            Step::Command(_) => {}
        }
    }

    /// Treat an I/O failure as an abrupt close
    async fn abort(&mut self, err: Error) {
        warn!(error = %err, "socket failure");
        if !matches!(err, Error::ConnectionClosed) {
            self.pending.push_back(Event::Error(ErrorKind::Io));
        }
        let _ = self.stream.shutdown().await;
        self.pending.extend(self.session.socket_closed());
    }

    async fn flush(&mut self) -> Result<()> {
        if !self.session.has_outbound() {
            return Ok(());
        }
        let out = self.session.take_outbound();
        trace!(len = out.len(), "writing to socket");
        self.stream.write_all(&out).await?;
        self.stream.flush().await?;
        Ok(())
    }
}
