//! The [`Connection`] state machine.
//!
//! One `Connection` owns one wire session: the transport, the framed buffer,
//! the transaction status, and the bookkeeping for prepended setup messages
//! whose ReadyForQuery replies are drained transparently.
use bytes::{BufMut, BytesMut};
use std::{
    collections::{HashMap, VecDeque},
    fmt,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::atomic::{AtomicU32, Ordering},
    time::Duration,
};

use crate::{
    Error, Result, verbose,
    buffer::BufferedStream,
    net,
    protocol::{
        BackendMessage, BackendProtocol, FrontendProtocol, ProtocolError,
        backend::{self, ErrorResponse, NoticeResponse, NotificationResponse, ParameterStatus},
        frontend,
    },
    statement::{PortalName, StatementName},
};

mod config;
pub(crate) mod startup;
mod version;

pub use config::{CompatMode, Config, GssFactory, ParseError, SslMode};
pub use startup::AuthError;
pub use version::{ServerCaps, ServerVersion};

/// Server pushed notification, raised by `NOTIFY` on a listened channel.
pub type Notification = NotificationResponse;

type NoticeHandler = Box<dyn Fn(&NoticeResponse) + Send>;
type NotificationHandler = Box<dyn Fn(&Notification) + Send>;

/// Connection lifecycle state.
///
/// State only mutates through [`Connection::set_state`]; entering `Ready`
/// closes any lingering row reader.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnState {
    /// Created or gracefully closed.
    Closed,
    /// Startup and authentication in flight.
    Connecting,
    /// Idle, a new request can be issued.
    Ready,
    /// A request was sent, command results pending.
    Executing,
    /// Streaming rows of a result set.
    Fetching,
    /// Inside a COPY sub-protocol.
    Copy,
    /// Fatal transport or protocol failure; terminal until dropped.
    Broken,
}

/// Transaction status of the session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TransactionStatus {
    #[default]
    Idle,
    InTransaction,
    InFailedTransaction,
    /// Client-side only: a BEGIN has been prepended but its reply has not
    /// arrived yet. The server never reports this.
    Pending,
}

impl TransactionStatus {
    /// Status after a ReadyForQuery carrying `indicator`.
    ///
    /// An `'I'` indicator is ignored while `Pending`: it belongs to a
    /// prepended message (e.g. DISCARD ALL) that ran before the BEGIN, so it
    /// must not clear the pending transaction.
    pub(crate) fn advance(self, indicator: u8) -> Result<TransactionStatus, ProtocolError> {
        let new = match indicator {
            b'I' => TransactionStatus::Idle,
            b'T' => TransactionStatus::InTransaction,
            b'E' => TransactionStatus::InFailedTransaction,
            other => {
                return Err(ProtocolError::unexpected_phase(other, "ReadyForQuery status"));
            }
        };
        Ok(match (self, new) {
            (TransactionStatus::Pending, TransactionStatus::Idle) => TransactionStatus::Pending,
            _ => new,
        })
    }
}

/// How DataRow and CopyData payloads are loaded from the wire.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RowLoadingMode {
    /// The whole payload is loaded before the message is surfaced.
    #[default]
    NonSequential,
    /// The payload is surfaced as-is for lazy column-wise consumption.
    Sequential,
    /// Payloads are consumed and discarded without surfacing the message.
    Skip,
}

/// Operation attempted in the wrong connection state.
///
/// Raised without breaking the connection.
pub struct StateError {
    op: &'static str,
    state: ConnState,
}

impl std::error::Error for StateError { }

impl fmt::Display for StateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cannot {} while the connection is {:?}", self.op, self.state)
    }
}

impl fmt::Debug for StateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

static CONN_ID: AtomicU32 = AtomicU32::new(0);

/// One physical session with the backend.
pub struct Connection {
    pub(crate) io: BufferedStream,
    pub(crate) config: Config,
    state: ConnState,
    tx_status: TransactionStatus,
    pub(crate) process_id: u32,
    pub(crate) secret_key: u32,
    params: HashMap<String, String>,
    pub(crate) server_version: ServerVersion,
    pub(crate) caps: ServerCaps,

    /// Setup messages staged ahead of the user's next message chain.
    prepend_buf: BytesMut,
    /// ReadyForQuery replies owed by messages still in `prepend_buf`.
    pending_rfq_prepended: usize,
    /// ReadyForQuery replies owed by prepended messages already on the wire.
    sent_rfq_prepended: usize,

    reader_active: bool,
    stmt_seq: u16,
    portal_seq: u16,
    /// Session-level `statement_timeout`, tracked for per-command overrides.
    session_timeout: Option<Duration>,

    notifications: VecDeque<Notification>,
    on_notice: Option<NoticeHandler>,
    on_notification: Option<NotificationHandler>,

    /// For log correlation only.
    id: u32,
}

impl Connection {
    /// Open a session from a connection url.
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with(Config::parse(url)?).await
    }

    /// Open a session from environment variables, see [`Config::from_env`].
    pub async fn connect_env() -> Result<Self> {
        Self::connect_with(Config::from_env()).await
    }

    /// Open a session with the given config.
    pub async fn connect_with(config: Config) -> Result<Self> {
        let id = CONN_ID.fetch_add(1, Ordering::Relaxed);

        let stream = net::connect(&config).await?;
        let buffer_size = config.buffer_size;

        let mut conn = Connection {
            io: BufferedStream::new(stream, buffer_size),
            config,
            state: ConnState::Connecting,
            tx_status: TransactionStatus::Idle,
            process_id: 0,
            secret_key: 0,
            params: HashMap::new(),
            server_version: ServerVersion::default(),
            caps: ServerCaps::default(),
            prepend_buf: BytesMut::new(),
            pending_rfq_prepended: 0,
            sent_rfq_prepended: 0,
            reader_active: false,
            stmt_seq: 0,
            portal_seq: 0,
            session_timeout: None,
            notifications: VecDeque::new(),
            on_notice: None,
            on_notification: None,
            id,
        };

        match startup::startup(&mut conn).await {
            Ok(()) => {
                tracing::debug!(
                    "conn{}: connected to {}:{} (server {}, pid {})",
                    conn.id, conn.config.host, conn.config.port,
                    conn.server_version, conn.process_id,
                );
                Ok(conn)
            }
            Err(err) => {
                // the session never left Connecting
                conn.set_state(ConnState::Closed);
                Err(err)
            }
        }
    }
}

/// Send and receive surface.
impl Connection {
    /// Buffer a frontend message behind any prepended setup messages.
    ///
    /// Nothing reaches the wire until [`flush`][Connection::flush]; an
    /// encoder failure breaks the session.
    pub fn send<F: FrontendProtocol>(&mut self, msg: F) -> Result<()> {
        verbose!("conn{}: (F) {}", self.id, F::MSGTYPE as char);
        match self.io.send(msg) {
            Ok(()) => Ok(()),
            Err(err) => Err(self.fail(err.into())),
        }
    }

    /// Stage a setup query ahead of the user's next message chain.
    ///
    /// Its ReadyForQuery reply is drained transparently and never surfaced.
    pub fn prepend_query(&mut self, sql: &str) -> Result<()> {
        verbose!("conn{}: (F, prepend) {sql}", self.id);
        match frontend::write(frontend::Query { sql }, &mut self.prepend_buf) {
            Ok(()) => {
                self.pending_rfq_prepended += 1;
                Ok(())
            }
            Err(err) => Err(self.fail(err.into())),
        }
    }

    /// Write buffered messages to the wire, prepended setup first.
    pub async fn flush(&mut self) -> Result<()> {
        match self.flush_inner().await {
            Ok(()) => Ok(()),
            Err(err) => Err(self.fail(err)),
        }
    }

    async fn flush_inner(&mut self) -> Result<()> {
        self.sent_rfq_prepended += self.pending_rfq_prepended;
        self.pending_rfq_prepended = 0;
        let Self { io, prepend_buf, .. } = self;
        io.flush_with_prefix(prepend_buf).await?;
        Ok(())
    }

    /// Receive the next synchronous backend message.
    ///
    /// Asynchronous messages (parameter statuses, notices, notifications)
    /// are dispatched as side effects and not surfaced.
    pub async fn recv(&mut self) -> Result<BackendMessage> {
        self.recv_with(RowLoadingMode::NonSequential, true).await
    }

    /// Receive with an explicit loading mode, optionally surfacing
    /// notifications instead of queueing them.
    pub async fn recv_with(
        &mut self,
        mode: RowLoadingMode,
        ignore_notifications: bool,
    ) -> Result<BackendMessage> {
        match self.recv_inner(mode, ignore_notifications).await {
            Ok(msg) => {
                if self.config.sync_notification && matches!(self.state, ConnState::Ready) {
                    self.drain_notifications().await?;
                }
                Ok(msg)
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    async fn recv_inner(
        &mut self,
        mode: RowLoadingMode,
        ignore_notifications: bool,
    ) -> Result<BackendMessage> {
        if matches!(self.state, ConnState::Closed | ConnState::Broken) {
            return Err(StateError { op: "receive", state: self.state }.into());
        }

        // a read implies the request is complete
        if self.io.has_pending_write() || self.pending_rfq_prepended != 0 {
            self.flush_inner().await?;
        }

        self.drain_prepended().await?;

        // a server error is buffered and raised at its trailing ReadyForQuery
        let mut pending_error: Option<ErrorResponse> = None;

        loop {
            if matches!(mode, RowLoadingMode::Skip) {
                let msgtype = self.io.peek_msgtype().await?;
                if matches!(msgtype, backend::DataRow::MSGTYPE | backend::CopyData::MSGTYPE) {
                    self.io.skip_msg().await?;
                    continue;
                }
            }

            let (msgtype, body) = self.io.read_msg().await?;
            match msgtype {
                NoticeResponse::MSGTYPE => {
                    let notice = NoticeResponse::decode(msgtype, body)?;
                    self.dispatch_notice(notice);
                }
                ParameterStatus::MSGTYPE => {
                    let status = ParameterStatus::decode(msgtype, body)?;
                    self.record_parameter(status);
                }
                NotificationResponse::MSGTYPE => {
                    let notification = NotificationResponse::decode(msgtype, body)?;
                    self.dispatch_notification(notification.clone());
                    if !ignore_notifications {
                        return Ok(BackendMessage::NotificationResponse(notification));
                    }
                }
                ErrorResponse::MSGTYPE => {
                    let err = ErrorResponse::decode(msgtype, body)?;
                    if matches!(self.state, ConnState::Connecting) {
                        // the server closes the socket, no ReadyForQuery follows
                        return Err(err.into());
                    }
                    pending_error = Some(err);
                }
                backend::ReadyForQuery::MSGTYPE => {
                    let rfq = backend::ReadyForQuery::decode(msgtype, body)?;
                    self.apply_rfq(rfq.tx_status)?;
                    self.set_state(ConnState::Ready);
                    if let Some(err) = pending_error {
                        return Err(err.into());
                    }
                    return Ok(BackendMessage::ReadyForQuery(rfq));
                }
                // after an error the backend discards the request; anything
                // else before the ReadyForQuery is residue and is dropped
                _ if pending_error.is_some() => {}
                backend::RowDescription::MSGTYPE => {
                    if matches!(self.state, ConnState::Executing) {
                        self.set_state(ConnState::Fetching);
                        self.reader_active = true;
                    }
                    return Ok(BackendMessage::decode(msgtype, body)?);
                }
                backend::CopyInResponse::MSGTYPE | backend::CopyOutResponse::MSGTYPE => {
                    self.set_state(ConnState::Copy);
                    return Ok(BackendMessage::decode(msgtype, body)?);
                }
                backend::CopyDone::MSGTYPE => {
                    self.set_state(ConnState::Executing);
                    return Ok(BackendMessage::decode(msgtype, body)?);
                }
                _ => return Ok(BackendMessage::decode(msgtype, body)?),
            }
        }
    }

    /// Consume exactly `sent_rfq_prepended` ReadyForQuery replies so setup
    /// messages stay invisible to the caller.
    async fn drain_prepended(&mut self) -> Result<()> {
        while self.sent_rfq_prepended != 0 {
            let msgtype = self.io.peek_msgtype().await?;
            if matches!(msgtype, backend::DataRow::MSGTYPE | backend::CopyData::MSGTYPE) {
                self.io.skip_msg().await?;
                continue;
            }

            let (msgtype, body) = self.io.read_msg().await?;
            match msgtype {
                NoticeResponse::MSGTYPE => {
                    let notice = NoticeResponse::decode(msgtype, body)?;
                    self.dispatch_notice(notice);
                }
                ParameterStatus::MSGTYPE => {
                    let status = ParameterStatus::decode(msgtype, body)?;
                    self.record_parameter(status);
                }
                NotificationResponse::MSGTYPE => {
                    let notification = NotificationResponse::decode(msgtype, body)?;
                    self.dispatch_notification(notification);
                }
                ErrorResponse::MSGTYPE => {
                    // a failed setup message still gets its ReadyForQuery;
                    // the session recovers there
                    let err = ErrorResponse::decode(msgtype, body)?;
                    tracing::error!("conn{}: prepended message failed: {err}", self.id);
                }
                backend::ReadyForQuery::MSGTYPE => {
                    let rfq = backend::ReadyForQuery::decode(msgtype, body)?;
                    self.apply_rfq(rfq.tx_status)?;
                    self.sent_rfq_prepended -= 1;
                }
                // command results of setup messages are not interesting
                _ => {}
            }
        }
        Ok(())
    }
}

/// Simple and extended query surface.
impl Connection {
    /// Issue a simple query; results are read through [`recv`][Connection::recv].
    pub async fn query(&mut self, sql: &str) -> Result<()> {
        self.ensure_ready("query")?;
        self.send(frontend::Query { sql })?;
        self.flush().await?;
        self.set_state(ConnState::Executing);
        Ok(())
    }

    /// Close an extended-protocol batch and hand the turn to the backend.
    pub async fn sync(&mut self) -> Result<()> {
        if !matches!(self.state, ConnState::Ready | ConnState::Executing) {
            return Err(StateError { op: "sync", state: self.state }.into());
        }
        self.send(frontend::Sync)?;
        self.flush().await?;
        self.set_state(ConnState::Executing);
        Ok(())
    }

    /// Next server-side prepared statement name.
    pub fn next_statement(&mut self) -> StatementName {
        let seq = self.stmt_seq;
        self.stmt_seq = self.stmt_seq.wrapping_add(1);
        StatementName::numbered(seq)
    }

    /// Next server-side portal name.
    pub fn next_portal(&mut self) -> PortalName {
        let seq = self.portal_seq;
        self.portal_seq = self.portal_seq.wrapping_add(1);
        PortalName::numbered(seq)
    }

    /// Re-emit a `SET statement_timeout` prepend when the per-command value
    /// differs from the session value.
    pub fn set_backend_timeout(&mut self, timeout: Duration) -> Result<()> {
        if self.session_timeout == Some(timeout) {
            return Ok(());
        }
        let millis = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self.prepend_query(&format!("SET statement_timeout = {millis}"))?;
        self.session_timeout = Some(timeout);
        Ok(())
    }
}

/// COPY sub-protocol surface.
impl Connection {
    /// Send a chunk of copy-in data.
    ///
    /// Payloads that do not fit the write buffer are written straight to the
    /// stream after the frame header, skipping the intermediate copy.
    pub async fn copy_data(&mut self, data: &[u8]) -> Result<()> {
        self.ensure_copy("send copy data")?;
        if data.len() <= self.io.write_space_left() {
            return self.send(frontend::CopyData { data });
        }

        let buf = self.io.write_buf_mut();
        buf.put_u8(b'd');
        buf.put_i32(4 + data.len() as i32);
        match self.io.write_direct(data).await {
            Ok(()) => Ok(()),
            Err(err) => Err(self.fail(err.into())),
        }
    }

    /// Finish the copy-in stream.
    pub async fn copy_done(&mut self) -> Result<()> {
        self.ensure_copy("finish copy")?;
        self.send(frontend::CopyDone)?;
        self.flush().await?;
        self.set_state(ConnState::Executing);
        Ok(())
    }

    /// Abort the copy-in stream; the backend answers with an ErrorResponse.
    pub async fn copy_fail(&mut self, message: &str) -> Result<()> {
        self.ensure_copy("abort copy")?;
        self.send(frontend::CopyFail { message })?;
        self.flush().await?;
        self.set_state(ConnState::Executing);
        Ok(())
    }

    fn ensure_copy(&self, op: &'static str) -> Result<(), StateError> {
        match self.state {
            ConnState::Copy => Ok(()),
            state => Err(StateError { op, state }),
        }
    }
}

/// Transaction tracking.
impl Connection {
    pub fn transaction_status(&self) -> TransactionStatus {
        self.tx_status
    }

    /// Mark that a BEGIN has been prepended but not yet acknowledged.
    pub fn mark_transaction_pending(&mut self) {
        self.tx_status = TransactionStatus::Pending;
    }

    pub(crate) fn apply_rfq(&mut self, indicator: u8) -> Result<(), ProtocolError> {
        let next = self.tx_status.advance(indicator)?;
        if next != self.tx_status {
            verbose!("conn{}: transaction status {:?} -> {next:?}", self.id, self.tx_status);
        }
        self.tx_status = next;
        Ok(())
    }

    fn clear_transaction(&mut self) {
        self.tx_status = TransactionStatus::Idle;
    }
}

/// Cancellation, reset, close.
impl Connection {
    /// Ask the backend to interrupt the currently running query.
    ///
    /// Opens a separate transport with the same settings, fires a single
    /// cancel packet carrying the backend key data, and closes. The state
    /// machine of `self` is untouched.
    pub async fn cancel_request(&self) -> Result<()> {
        let mut packet = BytesMut::with_capacity(16);
        frontend::CancelRequest {
            process_id: self.process_id,
            secret_key: self.secret_key,
        }
        .write(&mut packet);

        tracing::debug!("conn{}: sending cancel request for pid {}", self.id, self.process_id);
        net::send_cancel(&self.config, &packet).await
    }

    /// Prepare the session for reuse, e.g. on return to a pool.
    ///
    /// Rolls back a live transaction and discards session state through
    /// prepended messages; nothing is flushed until the next real operation.
    pub fn reset(&mut self) -> Result<()> {
        self.ensure_ready("reset")?;
        self.reader_active = false;

        if !matches!(self.tx_status, TransactionStatus::Idle) {
            self.prepend_query("ROLLBACK")?;
            self.clear_transaction();
        }

        if self.caps.supports_discard {
            self.prepend_query("DISCARD ALL")?;
        } else {
            self.prepend_query("UNLISTEN *")?;
            self.stmt_seq = 0;
            self.portal_seq = 0;
        }

        Ok(())
    }

    /// Gracefully close the session.
    ///
    /// Terminate is sent best-effort when the session is idle; transport
    /// errors during shutdown are ignored.
    pub async fn close(mut self) -> Result<()> {
        if matches!(self.state, ConnState::Ready) {
            self.io.send(frontend::Terminate).ok();
            self.io.flush().await.ok();
        }
        self.set_state(ConnState::Closed);
        self.cleanup();
        self.io.shutdown().await.ok();
        tracing::debug!("conn{}: closed", self.id);
        Ok(())
    }

    /// Mark the session broken after a fatal error.
    pub(crate) fn break_(&mut self) {
        if matches!(self.state, ConnState::Closed | ConnState::Broken) {
            return;
        }
        tracing::debug!("conn{}: breaking connection", self.id);
        self.set_state(ConnState::Broken);
        self.cleanup();
    }

    fn cleanup(&mut self) {
        self.reader_active = false;
        self.params.clear();
        self.server_version = ServerVersion::default();
        self.clear_transaction();
        self.notifications.clear();
        self.prepend_buf.clear();
        self.pending_rfq_prepended = 0;
        self.sent_rfq_prepended = 0;
        self.on_notice = None;
        self.on_notification = None;
    }

    fn fail(&mut self, err: Error) -> Error {
        if err.is_fatal() {
            self.break_();
        }
        err
    }

    fn ensure_ready(&self, op: &'static str) -> Result<(), StateError> {
        match self.state {
            ConnState::Ready => Ok(()),
            state => Err(StateError { op, state }),
        }
    }
}

/// Asynchronous server messages.
impl Connection {
    /// Register a handler for server notices. Panics in the handler are
    /// swallowed.
    pub fn on_notice(&mut self, handler: impl Fn(&NoticeResponse) + Send + 'static) {
        self.on_notice = Some(Box::new(handler));
    }

    /// Register a handler for notifications. Panics in the handler are
    /// swallowed.
    pub fn on_notification(&mut self, handler: impl Fn(&Notification) + Send + 'static) {
        self.on_notification = Some(Box::new(handler));
    }

    /// Pop a queued notification.
    pub fn next_notification(&mut self) -> Option<Notification> {
        self.notifications.pop_front()
    }

    /// Wait for a notification while the session is idle.
    ///
    /// Only asynchronous side-effect messages are legal here; a synchronous
    /// message arriving outside a request breaks the session.
    pub async fn wait_notification(&mut self) -> Result<Notification> {
        self.ensure_ready("wait for notifications")?;

        loop {
            if let Some(notification) = self.notifications.pop_front() {
                return Ok(notification);
            }
            match self.dispatch_async().await {
                Ok(()) => {}
                Err(err) => return Err(self.fail(err)),
            }
        }
    }

    /// Dispatch everything already buffered or immediately readable, so no
    /// async message is stranded between operations.
    pub async fn drain_notifications(&mut self) -> Result<()> {
        loop {
            while self.io.has_buffered_msg() {
                match self.dispatch_async().await {
                    Ok(()) => {}
                    Err(err) => return Err(self.fail(err)),
                }
            }
            match self.io.try_fill() {
                Ok(true) => continue,
                Ok(false) => return Ok(()),
                Err(err) => {
                    let err = Error::from(err);
                    return Err(self.fail(err));
                }
            }
        }
    }

    async fn dispatch_async(&mut self) -> Result<()> {
        let (msgtype, body) = self.io.read_msg().await?;
        match msgtype {
            NoticeResponse::MSGTYPE => {
                let notice = NoticeResponse::decode(msgtype, body)?;
                self.dispatch_notice(notice);
            }
            ParameterStatus::MSGTYPE => {
                let status = ParameterStatus::decode(msgtype, body)?;
                self.record_parameter(status);
            }
            NotificationResponse::MSGTYPE => {
                let notification = NotificationResponse::decode(msgtype, body)?;
                self.dispatch_notification(notification);
            }
            other => {
                return Err(ProtocolError::unexpected_phase(other, "idle session").into());
            }
        }
        Ok(())
    }

    fn dispatch_notice(&mut self, notice: NoticeResponse) {
        tracing::warn!("conn{}: {notice}", self.id);
        if let Some(handler) = &self.on_notice {
            let _ = catch_unwind(AssertUnwindSafe(|| handler(&notice)));
        }
    }

    fn dispatch_notification(&mut self, notification: Notification) {
        verbose!("conn{}: notification on {:?}", self.id, notification.channel);
        if let Some(handler) = &self.on_notification {
            let _ = catch_unwind(AssertUnwindSafe(|| handler(&notification)));
        }
        self.notifications.push_back(notification);
    }

    pub(crate) fn record_parameter(&mut self, status: ParameterStatus) {
        match status.name.as_str() {
            "server_version" => {
                if let Some(version) = ServerVersion::parse(&status.value) {
                    self.server_version = version;
                    let conformant = self.caps.use_conformant_strings;
                    self.caps = ServerCaps::detect(version);
                    self.caps.use_conformant_strings = conformant;
                }
            }
            "standard_conforming_strings" => {
                self.caps.use_conformant_strings = status.value == "on";
            }
            _ => {}
        }
        self.params.insert(status.name.to_string(), status.value.to_string());
    }
}

/// Observed state.
impl Connection {
    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state, ConnState::Ready)
    }

    pub fn is_secure(&self) -> bool {
        self.io.is_secure()
    }

    /// Backend process id, for cancellation.
    pub fn backend_process_id(&self) -> u32 {
        self.process_id
    }

    /// Backend secret key, for cancellation.
    pub fn backend_secret_key(&self) -> u32 {
        self.secret_key
    }

    pub fn server_version(&self) -> ServerVersion {
        self.server_version
    }

    pub fn server_caps(&self) -> &ServerCaps {
        &self.caps
    }

    /// Latest reported value of a backend parameter.
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn set_state(&mut self, state: ConnState) {
        if matches!(state, ConnState::Ready) && self.reader_active {
            // entering Ready closes a lingering reader and idles its command
            self.reader_active = false;
        }
        self.state = state;
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("tx_status", &self.tx_status)
            .field("process_id", &self.process_id)
            .field("server_version", &self.server_version)
            .finish_non_exhaustive()
    }
}
