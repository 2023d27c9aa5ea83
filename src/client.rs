//! The LDAP client: public operation API, and the driver task that owns the
//! transport, outstanding-request table, offline queue, reconnect loop and
//! every timer.
//!
//! All state lives in one task; handles talk to it over a command channel,
//! and spawned helpers (reader, dial, hooks, timers) report back over an
//! internal event channel tagged with a transport generation so stale
//! events are ignored.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ClientOptions;
use crate::conn::{self, ClientStream, DialError, Endpoint, StreamReadHalf, StreamWriteHalf};
use crate::error::{LdapError, Result};
use crate::framing::FrameBuffer;
use crate::pending::{Completion, Expected, MessageIdGen, Pending, PendingMap};
use crate::protocol::{
    encode_message, AddRequest, Attribute, BindRequest, Change, CompareRequest, Control,
    ExtendedRequest, LdapResult, Message, ModifyDnRequest, ModifyRequest, PagedValue, ProtocolOp,
    SearchRequest, PAGED_RESULTS_OID,
};
use crate::queue::{Enqueue, RequestQueue};
use crate::search::{SearchItem, SearchOptions, SearchStream};

/// WhoAmI extended operation (RFC 4532).
pub const WHOAMI_OID: &str = "1.3.6.1.4.1.4203.1.11.3";

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle events, one typed channel for the whole surface.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Transport established and setup hooks finished.
    Connect,
    /// A connect attempt failed.
    ConnectError(String),
    /// A connect attempt hit the connect timeout.
    ConnectTimeout,
    /// Setup hooks completed.
    Setup,
    /// Transport-level failure.
    Error(String),
    /// Transport closed.
    Close,
    /// Server closed its end of the stream.
    End,
    /// No incoming bytes within the socket timeout.
    SocketTimeout,
    /// The per-request timer fired for the given message id.
    Timeout(i32),
    /// No outstanding requests for the idle timeout.
    Idle,
    /// The client was destroyed.
    Destroy,
}

/// Hook run after connect against a restricted client that bypasses the
/// request queue.
pub type SetupHook =
    Arc<dyn Fn(SetupConn) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> + Send + Sync>;

/// Wrap an async closure as a [`SetupHook`].
pub fn setup_hook<F, Fut>(f: F) -> SetupHook
where
    F: Fn(SetupConn) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |conn| Box::pin(f(conn)))
}

/// Restricted handle passed to setup hooks: bind, search and unbind only,
/// submitted ahead of the queue.
pub struct SetupConn {
    inner: LdapClient,
}

impl SetupConn {
    pub async fn bind(&self, dn: &str, password: &str) -> Result<LdapResult> {
        self.inner.bind(dn, password).await
    }

    pub async fn search(&self, options: SearchOptions) -> Result<SearchStream> {
        self.inner.search(options).await
    }

    pub async fn unbind(&self) -> Result<()> {
        self.inner.unbind().await
    }
}

struct Shared {
    connected: AtomicBool,
    destroyed: AtomicBool,
}

pub(crate) struct OpRequest {
    op: ProtocolOp,
    controls: Vec<Control>,
    expected: Expected,
    completion: Completion,
    /// Reports the allocated message id back to the caller (searches, so
    /// the id can be abandoned).
    id_tx: Option<oneshot::Sender<i32>>,
}

enum Command {
    Op { req: OpRequest, bypass: bool },
    Destroy,
}

enum Internal {
    Incoming {
        gen: u64,
        message: Message,
    },
    TransportClosed {
        gen: u64,
        reason: Option<String>,
        graceful: bool,
    },
    SocketIdle {
        gen: u64,
    },
    DialDone {
        gen: u64,
        outcome: std::result::Result<ClientStream, DialError>,
    },
    HooksDone {
        gen: u64,
        outcome: Result<()>,
    },
    RequestTimeout {
        gen: u64,
        id: i32,
    },
    BackoffElapsed,
    QueueTimerFired {
        gen: u64,
    },
    IdleCheck {
        gen: u64,
    },
}

/// Handle to one LDAP client. Cheap to clone; all clones share the same
/// connection, queue and event stream. The client connects in the
/// background as soon as it is created.
#[derive(Clone)]
pub struct LdapClient {
    cmd_tx: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<ClientEvent>,
    shared: Arc<Shared>,
    bypass: bool,
}

impl LdapClient {
    /// Create the client and start connecting. Fails synchronously on
    /// invalid options (endpoint, TLS material).
    pub fn new(options: ClientOptions) -> Result<LdapClient> {
        let endpoint = Endpoint::from_options(&options)?;
        let tls_config = if endpoint.is_tls() {
            Some(conn::build_tls_config(&options.tls)?)
        } else {
            None
        };
        let id = NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(64);
        let shared = Arc::new(Shared {
            connected: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
        });
        let client = LdapClient {
            cmd_tx,
            events: events.clone(),
            shared: Arc::clone(&shared),
            bypass: false,
        };
        let backoff_start = options
            .reconnect
            .as_ref()
            .map(|r| r.initial_delay())
            .unwrap_or_else(|| Duration::from_millis(100));
        let queue = RequestQueue::new(
            options.queue_size,
            options.queue_timeout(),
            !options.queuing,
        );
        let driver = Driver {
            id,
            opts: options,
            endpoint,
            tls_config,
            cmd_rx,
            internal_tx,
            internal_rx,
            events,
            shared,
            handle: client.clone(),
            state: ConnState::Disconnected,
            transport: None,
            gen: 0,
            queue,
            queue_timer_gen: 0,
            idle_gen: 0,
            attempts: 0,
            backoff_next: backoff_start,
            destroyed: false,
        };
        tokio::spawn(driver.run());
        Ok(client)
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.destroyed.load(Ordering::SeqCst)
    }

    /// Simple bind.
    pub async fn bind(&self, dn: &str, password: &str) -> Result<LdapResult> {
        self.bind_ext(dn, password, Vec::new()).await
    }

    pub async fn bind_ext(
        &self,
        dn: &str,
        password: &str,
        controls: Vec<Control>,
    ) -> Result<LdapResult> {
        let op = ProtocolOp::BindRequest(BindRequest {
            version: 3,
            dn: dn.to_string(),
            password: password.to_string(),
        });
        let message = self.single_op(op, controls, vec![0]).await?;
        expect_result(message)
    }

    /// Add an entry.
    pub async fn add(&self, dn: &str, attributes: Vec<Attribute>) -> Result<LdapResult> {
        self.add_ext(dn, attributes, Vec::new()).await
    }

    pub async fn add_ext(
        &self,
        dn: &str,
        attributes: Vec<Attribute>,
        controls: Vec<Control>,
    ) -> Result<LdapResult> {
        require_dn(dn)?;
        let op = ProtocolOp::AddRequest(AddRequest {
            dn: dn.to_string(),
            attributes,
        });
        let message = self.single_op(op, controls, vec![0]).await?;
        expect_result(message)
    }

    /// Compare an attribute value; true on compareTrue, false on
    /// compareFalse, error otherwise.
    pub async fn compare(&self, dn: &str, attribute: &str, value: &[u8]) -> Result<bool> {
        Ok(self.compare_ext(dn, attribute, value, Vec::new()).await?.0)
    }

    pub async fn compare_ext(
        &self,
        dn: &str,
        attribute: &str,
        value: &[u8],
        controls: Vec<Control>,
    ) -> Result<(bool, LdapResult)> {
        require_dn(dn)?;
        if attribute.is_empty() {
            return Err(LdapError::InvalidArgument("attribute is required".into()));
        }
        let op = ProtocolOp::CompareRequest(CompareRequest {
            dn: dn.to_string(),
            attribute: attribute.to_string(),
            value: value.to_vec(),
        });
        let message = self.single_op(op, controls, vec![5, 6]).await?;
        let result = expect_result(message)?;
        Ok((result.code == 6, result))
    }

    /// Delete an entry.
    pub async fn delete(&self, dn: &str) -> Result<LdapResult> {
        self.delete_ext(dn, Vec::new()).await
    }

    pub async fn delete_ext(&self, dn: &str, controls: Vec<Control>) -> Result<LdapResult> {
        require_dn(dn)?;
        let message = self
            .single_op(ProtocolOp::DelRequest(dn.to_string()), controls, vec![0])
            .await?;
        expect_result(message)
    }

    /// Extended operation; returns the response value (if any) and result.
    pub async fn extended(
        &self,
        oid: &str,
        value: Option<Vec<u8>>,
    ) -> Result<(Option<Vec<u8>>, LdapResult)> {
        self.extended_ext(oid, value, Vec::new()).await
    }

    pub async fn extended_ext(
        &self,
        oid: &str,
        value: Option<Vec<u8>>,
        controls: Vec<Control>,
    ) -> Result<(Option<Vec<u8>>, LdapResult)> {
        if oid.is_empty() {
            return Err(LdapError::InvalidArgument("oid is required".into()));
        }
        let op = ProtocolOp::ExtendedRequest(ExtendedRequest {
            name: oid.to_string(),
            value,
        });
        let message = self.single_op(op, controls, vec![0]).await?;
        match message.op {
            ProtocolOp::ExtendedResponse(res) => Ok((res.value, res.result)),
            other => Err(LdapError::Protocol(format!(
                "expected ExtendedResponse, got {}",
                other.name()
            ))),
        }
    }

    /// WhoAmI (RFC 4532): the authorization identity the server holds for
    /// this connection.
    pub async fn whoami(&self) -> Result<String> {
        let (value, _) = self.extended(WHOAMI_OID, None).await?;
        match value {
            Some(bytes) => String::from_utf8(bytes)
                .map_err(|_| LdapError::Protocol("whoami response is not UTF-8".into())),
            None => Ok(String::new()),
        }
    }

    /// Modify an entry.
    pub async fn modify(&self, dn: &str, changes: Vec<Change>) -> Result<LdapResult> {
        self.modify_ext(dn, changes, Vec::new()).await
    }

    pub async fn modify_ext(
        &self,
        dn: &str,
        changes: Vec<Change>,
        controls: Vec<Control>,
    ) -> Result<LdapResult> {
        require_dn(dn)?;
        if changes.is_empty() {
            return Err(LdapError::InvalidArgument(
                "at least one change is required".into(),
            ));
        }
        let op = ProtocolOp::ModifyRequest(ModifyRequest {
            dn: dn.to_string(),
            changes,
        });
        let message = self.single_op(op, controls, vec![0]).await?;
        expect_result(message)
    }

    /// Rename/move an entry. When `new_dn` has more than one RDN, the first
    /// becomes the new RDN and the remainder the new superior; the old RDN
    /// is always deleted.
    pub async fn modify_dn(&self, dn: &str, new_dn: &str) -> Result<LdapResult> {
        self.modify_dn_ext(dn, new_dn, Vec::new()).await
    }

    pub async fn modify_dn_ext(
        &self,
        dn: &str,
        new_dn: &str,
        controls: Vec<Control>,
    ) -> Result<LdapResult> {
        require_dn(dn)?;
        if new_dn.is_empty() {
            return Err(LdapError::InvalidArgument("new DN is required".into()));
        }
        let (new_rdn, new_superior) = split_first_rdn(new_dn);
        let op = ProtocolOp::ModifyDnRequest(ModifyDnRequest {
            dn: dn.to_string(),
            new_rdn,
            delete_old_rdn: true,
            new_superior,
        });
        let message = self.single_op(op, controls, vec![0]).await?;
        expect_result(message)
    }

    /// Issue a search; the stream delivers entries, referrals and one
    /// terminal. With a PagedResults control the paging cookie is driven
    /// transparently and the stream spans all pages.
    pub async fn search(&self, options: SearchOptions) -> Result<SearchStream> {
        let filter = match (options.filter, options.filter_str) {
            (Some(f), _) => f,
            (None, Some(s)) => crate::filter::Filter::parse(&s)?,
            (None, None) => crate::filter::Filter::present_object_class(),
        };
        if options.size_limit < 0 || options.time_limit < 0 {
            return Err(LdapError::InvalidArgument(
                "size and time limits must be non-negative".into(),
            ));
        }
        let op = ProtocolOp::SearchRequest(SearchRequest {
            base: options.base,
            scope: options.scope,
            deref: options.deref,
            size_limit: options.size_limit,
            time_limit: options.time_limit,
            types_only: options.types_only,
            filter,
            attributes: options.attributes,
        });
        let (tx, rx) = mpsc::unbounded_channel();
        let (id_tx, id_rx) = oneshot::channel();
        self.send_op(OpRequest {
            op,
            controls: options.controls,
            expected: Expected::Codes(vec![0]),
            completion: Completion::Search(tx),
            id_tx: Some(id_tx),
        })?;
        Ok(SearchStream::new(rx, id_rx))
    }

    /// Abandon an outstanding request. Completes once the Abandon PDU is
    /// written; the abandoned request's table entry is dropped, so its
    /// stream ends without a terminal and late replies are discarded.
    pub async fn abandon(&self, message_id: i32) -> Result<()> {
        self.abandon_ext(message_id, Vec::new()).await
    }

    pub async fn abandon_ext(&self, message_id: i32, controls: Vec<Control>) -> Result<()> {
        if message_id < 1 {
            return Err(LdapError::InvalidArgument(format!(
                "invalid message id: {}",
                message_id
            )));
        }
        let (tx, rx) = oneshot::channel();
        self.send_op(OpRequest {
            op: ProtocolOp::AbandonRequest(message_id),
            controls,
            expected: Expected::Abandon,
            completion: Completion::Ack(tx),
            id_tx: None,
        })?;
        recv_ack(rx).await
    }

    /// Graceful unbind; resolves when the transport is torn down.
    pub async fn unbind(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send_op(OpRequest {
            op: ProtocolOp::UnbindRequest,
            controls: Vec::new(),
            expected: Expected::Unbind,
            completion: Completion::Ack(tx),
            id_tx: None,
        })?;
        recv_ack(rx).await
    }

    /// Terminal: freezes the queue, errors queued and pending requests,
    /// sends a best-effort unbind and suppresses all future reconnects.
    pub fn destroy(&self) {
        self.shared.destroyed.store(true, Ordering::SeqCst);
        let _ = self.cmd_tx.send(Command::Destroy);
    }

    async fn single_op(
        &self,
        op: ProtocolOp,
        controls: Vec<Control>,
        expected: Vec<u32>,
    ) -> Result<Message> {
        let (tx, rx) = oneshot::channel();
        self.send_op(OpRequest {
            op,
            controls,
            expected: Expected::Codes(expected),
            completion: Completion::Single(tx),
            id_tx: None,
        })?;
        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(LdapError::Connection("request dropped".to_string())),
        }
    }

    fn send_op(&self, req: OpRequest) -> Result<()> {
        if self.is_destroyed() {
            return Err(LdapError::Destroyed);
        }
        self.cmd_tx
            .send(Command::Op {
                req,
                bypass: self.bypass,
            })
            .map_err(|_| LdapError::Destroyed)
    }
}

async fn recv_ack(rx: oneshot::Receiver<Result<()>>) -> Result<()> {
    match rx.await {
        Ok(outcome) => outcome,
        Err(_) => Err(LdapError::Connection("request dropped".to_string())),
    }
}

fn expect_result(message: Message) -> Result<LdapResult> {
    message
        .op
        .result()
        .cloned()
        .ok_or_else(|| LdapError::Protocol(format!("unexpected {}", message.op.name())))
}

fn require_dn(dn: &str) -> Result<()> {
    if dn.is_empty() {
        Err(LdapError::InvalidArgument("dn is required".into()))
    } else {
        Ok(())
    }
}

/// First RDN and optional remainder of a DN, honoring `\,` escapes.
fn split_first_rdn(dn: &str) -> (String, Option<String>) {
    let bytes = dn.as_bytes();
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match b {
            b'\\' => escaped = true,
            b',' => {
                let rdn = dn[..i].trim().to_string();
                let rest = dn[i + 1..].trim();
                return (
                    rdn,
                    if rest.is_empty() {
                        None
                    } else {
                        Some(rest.to_string())
                    },
                );
            }
            _ => {}
        }
    }
    (dn.trim().to_string(), None)
}

fn fail_op(completion: Completion, err: LdapError) {
    match completion {
        Completion::Single(tx) => {
            let _ = tx.send(Err(err));
        }
        Completion::Search(tx) => {
            let _ = tx.send(Err(err));
        }
        Completion::Ack(tx) => {
            let _ = tx.send(Err(err));
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Disconnected,
    Backoff,
    Dialing,
    SettingUp,
    Connected,
}

struct Transport {
    writer: StreamWriteHalf,
    idgen: MessageIdGen,
    table: PendingMap,
    reader: JoinHandle<()>,
    /// Set once an unbind has been written; suppresses reconnection.
    closing: bool,
    unbind_id: Option<i32>,
}

impl Transport {
    async fn write(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.writer.write_all(bytes).await
    }
}

struct Driver {
    id: u64,
    opts: ClientOptions,
    endpoint: Endpoint,
    tls_config: Option<Arc<rustls::client::ClientConfig>>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    events: broadcast::Sender<ClientEvent>,
    shared: Arc<Shared>,
    /// Handle given to setup hooks (queue-bypassing clone).
    handle: LdapClient,
    state: ConnState,
    transport: Option<Transport>,
    /// Transport generation; bumped on every connect attempt and teardown
    /// so events from dead transports and timers are dropped.
    gen: u64,
    queue: RequestQueue<OpRequest>,
    queue_timer_gen: u64,
    idle_gen: u64,
    attempts: u32,
    backoff_next: Duration,
    destroyed: bool,
}

enum Step {
    Cmd(Option<Command>),
    Internal(Internal),
}

impl Driver {
    async fn run(mut self) {
        debug!(client = self.id, endpoint = %self.endpoint.describe(), "client starting");
        self.start_connect();
        loop {
            let step = tokio::select! {
                cmd = self.cmd_rx.recv() => Step::Cmd(cmd),
                evt = self.internal_rx.recv() => match evt {
                    Some(evt) => Step::Internal(evt),
                    None => break,
                },
            };
            match step {
                Step::Cmd(Some(Command::Op { req, bypass })) => self.on_op(req, bypass).await,
                Step::Cmd(Some(Command::Destroy)) | Step::Cmd(None) => {
                    self.on_destroy().await;
                }
                Step::Internal(evt) => self.on_internal(evt).await,
            }
            if self.destroyed {
                break;
            }
        }
        debug!(client = self.id, "driver finished");
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    async fn on_internal(&mut self, evt: Internal) {
        match evt {
            Internal::Incoming { gen, message } => {
                if gen == self.gen {
                    self.on_incoming(message).await;
                }
            }
            Internal::TransportClosed {
                gen,
                reason,
                graceful,
            } => {
                if gen == self.gen {
                    if let Some(reason) = &reason {
                        error!(client = self.id, "transport error: {}", reason);
                        self.emit(ClientEvent::Error(reason.clone()));
                    }
                    let reason = reason.unwrap_or_else(|| "connection closed".to_string());
                    self.teardown(&reason, graceful);
                }
            }
            Internal::SocketIdle { gen } => {
                if gen == self.gen {
                    warn!(client = self.id, "socket timeout, closing transport");
                    self.emit(ClientEvent::SocketTimeout);
                    self.teardown("socket timeout", false);
                }
            }
            Internal::DialDone { gen, outcome } => self.on_dial_done(gen, outcome).await,
            Internal::HooksDone { gen, outcome } => self.on_hooks_done(gen, outcome).await,
            Internal::RequestTimeout { gen, id } => {
                if gen == self.gen {
                    self.on_request_timeout(id);
                }
            }
            Internal::BackoffElapsed => {
                if self.state == ConnState::Backoff && !self.destroyed {
                    self.start_connect();
                }
            }
            Internal::QueueTimerFired { gen } => {
                if gen == self.queue_timer_gen && !self.queue.is_empty() {
                    warn!(client = self.id, "request queue timeout, purging");
                    self.queue.freeze();
                    for req in self.queue.drain() {
                        fail_op(req.completion, LdapError::QueueTimeout);
                    }
                }
            }
            Internal::IdleCheck { gen } => {
                // recheck at fire time: a request may have been installed since
                if gen == self.idle_gen
                    && self.state == ConnState::Connected
                    && self.transport.as_ref().is_some_and(|t| t.table.is_empty())
                {
                    self.emit(ClientEvent::Idle);
                }
            }
        }
    }

    // --- dispatch --------------------------------------------------------

    async fn on_op(&mut self, req: OpRequest, bypass: bool) {
        if self.destroyed {
            fail_op(req.completion, LdapError::Destroyed);
            return;
        }
        let has_transport = self.transport.is_some();
        if bypass && has_transport {
            self.submit(req).await;
            return;
        }
        if self.state != ConnState::Connected || !has_transport {
            // nothing to abandon or unbind on a dead transport
            if matches!(req.expected, Expected::Abandon | Expected::Unbind) {
                if let Completion::Ack(tx) = req.completion {
                    let _ = tx.send(Ok(()));
                }
                return;
            }
            match self.queue.enqueue(req) {
                Enqueue::Rejected(req) => {
                    fail_op(
                        req.completion,
                        LdapError::Connection("connection unavailable".to_string()),
                    );
                }
                Enqueue::Accepted { start_timer } => {
                    if start_timer {
                        self.arm_queue_timer();
                    }
                    if self.opts.reconnect.is_some() && self.state == ConnState::Disconnected {
                        self.start_connect();
                    }
                }
            }
            return;
        }
        self.flush_queue().await;
        self.submit(req).await;
    }

    fn arm_queue_timer(&mut self) {
        let Some(delay) = self.queue.timeout() else {
            return;
        };
        self.queue_timer_gen += 1;
        let gen = self.queue_timer_gen;
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Internal::QueueTimerFired { gen });
        });
    }

    async fn flush_queue(&mut self) {
        self.queue_timer_gen += 1; // cancel any armed queue timer
        if self.opts.queuing {
            self.queue.thaw();
        }
        for req in self.queue.drain() {
            self.submit(req).await;
        }
    }

    // --- submit ----------------------------------------------------------

    async fn submit(&mut self, req: OpRequest) {
        if self.transport.is_none() {
            fail_op(
                req.completion,
                LdapError::Connection("connection unavailable".to_string()),
            );
            return;
        }
        let OpRequest {
            op,
            controls,
            expected,
            completion,
            id_tx,
        } = req;
        let gen = self.gen;
        let timeout = self.opts.request_timeout();
        let (id, message) = {
            let t = self.transport.as_mut().unwrap();
            let id = t.idgen.next_id();
            (id, Message::with_controls(id, op, controls))
        };
        if let Some(tx) = id_tx {
            let _ = tx.send(id);
        }
        let bytes = encode_message(&message);
        debug!(
            client = self.id,
            msgid = id,
            op = message.op.name(),
            "sending request"
        );
        match expected {
            Expected::Abandon => {
                let mut write_err = None;
                {
                    let t = self.transport.as_mut().unwrap();
                    if let Err(e) = t.write(&bytes).await {
                        write_err = Some(e.to_string());
                    } else if let ProtocolOp::AbandonRequest(target) = message.op {
                        // drop the abandoned entry so idle accounting stays
                        // exact; any late replies are unsolicited
                        if t.table.take(target).is_some() {
                            debug!(client = self.id, msgid = target, "abandoned request removed");
                        }
                    }
                }
                match write_err {
                    Some(e) => {
                        fail_op(completion, LdapError::Connection(format!("write failed: {}", e)));
                        self.teardown(&format!("write failed: {}", e), false);
                    }
                    None => {
                        if let Completion::Ack(tx) = completion {
                            let _ = tx.send(Ok(()));
                        }
                        self.after_table_change();
                    }
                }
            }
            Expected::Unbind => {
                let mut write_err = None;
                {
                    let t = self.transport.as_mut().unwrap();
                    t.table.install(
                        id,
                        Pending {
                            expected: Expected::Unbind,
                            completion,
                            request: None,
                        },
                    );
                    t.closing = true;
                    t.unbind_id = Some(id);
                    if let Err(e) = t.write(&bytes).await {
                        write_err = Some(e.to_string());
                    } else {
                        let _ = t.writer.shutdown().await;
                    }
                }
                if let Some(e) = write_err {
                    // drained by teardown; the pending unbind resolves Ok
                    self.teardown(&format!("write failed: {}", e), false);
                } else {
                    self.mark_activity();
                }
            }
            Expected::Codes(codes) => {
                let retain = matches!(message.op, ProtocolOp::SearchRequest(_))
                    && message.controls.iter().any(|c| c.oid == PAGED_RESULTS_OID);
                let mut write_err = None;
                {
                    let t = self.transport.as_mut().unwrap();
                    t.table.install(
                        id,
                        Pending {
                            expected: Expected::Codes(codes),
                            completion,
                            request: retain.then(|| message.clone()),
                        },
                    );
                    if let Err(e) = t.write(&bytes).await {
                        write_err = Some(e.to_string());
                    }
                }
                if let Some(e) = write_err {
                    self.teardown(&format!("write failed: {}", e), false);
                    return;
                }
                if let Some(delay) = timeout {
                    let tx = self.internal_tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = tx.send(Internal::RequestTimeout { gen, id });
                    });
                }
                self.mark_activity();
            }
        }
    }

    // --- router ----------------------------------------------------------

    async fn on_incoming(&mut self, message: Message) {
        let Some(t) = self.transport.as_mut() else {
            return;
        };
        if !t.table.contains(message.id) {
            if t.unbind_id == Some(message.id) {
                debug!(client = self.id, msgid = message.id, "response after unbind, dropping");
            } else {
                error!(
                    client = self.id,
                    msgid = message.id,
                    op = message.op.name(),
                    "unsolicited message, dropping"
                );
            }
            return;
        }
        match &message.op {
            ProtocolOp::SearchResultEntry(_) | ProtocolOp::SearchResultReference(_) => {
                let item = match message.op {
                    ProtocolOp::SearchResultEntry(entry) => SearchItem::Entry(entry),
                    ProtocolOp::SearchResultReference(uris) => SearchItem::Referral(uris),
                    _ => unreachable!(),
                };
                match t.table.search_sink(message.id) {
                    Some(sink) => {
                        let _ = sink.send(Ok(item));
                    }
                    None => {
                        warn!(
                            client = self.id,
                            msgid = message.id,
                            "search data for a non-streaming request, dropping"
                        );
                    }
                }
            }
            _ => self.on_terminal(message).await,
        }
    }

    async fn on_terminal(&mut self, message: Message) {
        // paged continuation keeps the request outstanding
        if matches!(message.op, ProtocolOp::SearchResultDone(_)) {
            if let Some(paged) = message.paged_control() {
                if !paged.cookie.is_empty() && self.resend_paged(message.id, &paged.cookie).await {
                    return;
                }
            }
        }
        let Some(pending) = self
            .transport
            .as_mut()
            .and_then(|t| t.table.take(message.id))
        else {
            return;
        };
        deliver_terminal(pending, message);
        self.after_table_change();
    }

    /// Copy the response cookie into the retained request PDU and rewrite
    /// it under the same message id and sink. Returns true when the request
    /// stays outstanding.
    async fn resend_paged(&mut self, id: i32, cookie: &[u8]) -> bool {
        let bytes = {
            let Some(t) = self.transport.as_mut() else {
                return false;
            };
            let Some(request) = t.table.request_mut(id) else {
                return false;
            };
            let Some(ctrl) = request
                .controls
                .iter_mut()
                .find(|c| c.oid == PAGED_RESULTS_OID)
            else {
                return false;
            };
            let size = ctrl
                .value
                .as_deref()
                .and_then(|v| PagedValue::decode(v).ok())
                .map(|p| p.size)
                .unwrap_or(0);
            ctrl.value = Some(
                PagedValue {
                    size,
                    cookie: cookie.to_vec(),
                }
                .encode(),
            );
            encode_message(request)
        };
        debug!(client = self.id, msgid = id, "continuing paged search");
        let write_res = self.transport.as_mut().unwrap().write(&bytes).await;
        if let Err(e) = write_res {
            self.teardown(&format!("write failed: {}", e), false);
        }
        true
    }

    fn on_request_timeout(&mut self, id: i32) {
        let Some(pending) = self.transport.as_mut().and_then(|t| t.table.take(id)) else {
            return;
        };
        warn!(client = self.id, msgid = id, "request timeout");
        // synthesized local result fed through the normal completion path
        let result = LdapResult {
            code: 80,
            matched_dn: String::new(),
            message: "request timeout (client interrupt)".to_string(),
            referrals: Vec::new(),
        };
        match pending.completion {
            Completion::Single(tx) => {
                let _ = tx.send(Err(LdapError::RequestTimeout(result)));
            }
            Completion::Search(tx) => {
                let _ = tx.send(Err(LdapError::RequestTimeout(result)));
            }
            Completion::Ack(tx) => {
                let _ = tx.send(Err(LdapError::RequestTimeout(result)));
            }
        }
        self.emit(ClientEvent::Timeout(id));
        self.after_table_change();
    }

    // --- idle accounting --------------------------------------------------

    fn mark_activity(&mut self) {
        self.idle_gen += 1;
    }

    fn after_table_change(&mut self) {
        let empty = self.transport.as_ref().is_some_and(|t| t.table.is_empty());
        if !empty || self.state != ConnState::Connected {
            return;
        }
        let Some(delay) = self.opts.idle_timeout() else {
            return;
        };
        self.idle_gen += 1;
        let gen = self.idle_gen;
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Internal::IdleCheck { gen });
        });
    }

    // --- connection lifecycle --------------------------------------------

    fn start_connect(&mut self) {
        if self.destroyed {
            return;
        }
        self.gen = self.gen.wrapping_add(1);
        let gen = self.gen;
        self.state = ConnState::Dialing;
        let endpoint = self.endpoint.clone();
        let tls = self.tls_config.clone();
        let timeout = self.opts.connect_timeout();
        let tx = self.internal_tx.clone();
        debug!(client = self.id, endpoint = %endpoint.describe(), "dialing");
        tokio::spawn(async move {
            let outcome = conn::dial(&endpoint, tls, timeout).await;
            let _ = tx.send(Internal::DialDone { gen, outcome });
        });
    }

    async fn on_dial_done(
        &mut self,
        gen: u64,
        outcome: std::result::Result<ClientStream, DialError>,
    ) {
        if gen != self.gen || self.destroyed {
            return; // stale attempt; the stream (if any) is dropped here
        }
        match outcome {
            Ok(stream) => {
                let (rd, wr) = stream.into_split();
                let reader = tokio::spawn(read_loop(
                    rd,
                    gen,
                    self.internal_tx.clone(),
                    self.opts.socket_timeout(),
                ));
                self.transport = Some(Transport {
                    writer: wr,
                    idgen: MessageIdGen::new(),
                    table: PendingMap::new(),
                    reader,
                    closing: false,
                    unbind_id: None,
                });
                self.state = ConnState::SettingUp;
                info!(client = self.id, endpoint = %self.endpoint.describe(), "connected");
                if self.opts.setup_hooks.is_empty() {
                    self.commit().await;
                } else {
                    let hooks = self.opts.setup_hooks.clone();
                    let handle = LdapClient {
                        bypass: true,
                        ..self.handle.clone()
                    };
                    let tx = self.internal_tx.clone();
                    tokio::spawn(async move {
                        let mut outcome = Ok(());
                        for hook in hooks {
                            if let Err(e) = hook(SetupConn {
                                inner: handle.clone(),
                            })
                            .await
                            {
                                outcome = Err(e);
                                break;
                            }
                        }
                        let _ = tx.send(Internal::HooksDone { gen, outcome });
                    });
                }
            }
            Err(dial_err) => {
                warn!(
                    client = self.id,
                    endpoint = %self.endpoint.describe(),
                    "connect failed: {}",
                    dial_err.error
                );
                if dial_err.timed_out {
                    self.emit(ClientEvent::ConnectTimeout);
                } else {
                    self.emit(ClientEvent::ConnectError(dial_err.error.to_string()));
                }
                self.on_connect_failed();
            }
        }
    }

    async fn on_hooks_done(&mut self, gen: u64, outcome: Result<()>) {
        if gen != self.gen || self.destroyed {
            return;
        }
        match outcome {
            Ok(()) => self.commit().await,
            Err(e) => {
                warn!(client = self.id, "setup hook failed: {}", e);
                self.emit(ClientEvent::ConnectError(format!("setup failed: {}", e)));
                self.drop_transport("setup failed");
                self.state = ConnState::Disconnected;
                self.on_connect_failed();
            }
        }
    }

    async fn commit(&mut self) {
        self.state = ConnState::Connected;
        self.shared.connected.store(true, Ordering::SeqCst);
        self.attempts = 0;
        self.backoff_next = self
            .opts
            .reconnect
            .as_ref()
            .map(|r| r.initial_delay())
            .unwrap_or_else(|| Duration::from_millis(100));
        self.emit(ClientEvent::Setup);
        self.emit(ClientEvent::Connect);
        info!(client = self.id, "ready");
        self.flush_queue().await;
    }

    fn on_connect_failed(&mut self) {
        match self.opts.reconnect.clone() {
            Some(policy) => {
                self.attempts += 1;
                if policy.fail_after.is_some_and(|n| self.attempts >= n) {
                    error!(
                        client = self.id,
                        attempts = self.attempts,
                        "giving up on reconnection"
                    );
                    self.emit(ClientEvent::Error(format!(
                        "connect failed after {} attempts",
                        self.attempts
                    )));
                    self.state = ConnState::Disconnected;
                    return;
                }
                let delay = self.backoff_next;
                self.backoff_next = (delay * 2).min(policy.max_delay());
                self.state = ConnState::Backoff;
                debug!(client = self.id, delay_ms = delay.as_millis() as u64, "backing off");
                let tx = self.internal_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(Internal::BackoffElapsed);
                });
            }
            None => {
                self.emit(ClientEvent::Error("connection attempt failed".to_string()));
                self.state = ConnState::Disconnected;
            }
        }
    }

    /// Drop the transport and resolve every pending request exactly once.
    /// No events, no reconnect decision (callers handle those).
    fn drop_transport(&mut self, reason: &str) -> bool {
        let Some(mut t) = self.transport.take() else {
            return false;
        };
        t.reader.abort();
        self.gen = self.gen.wrapping_add(1);
        let pending = t.table.len();
        if pending > 0 {
            debug!(
                client = self.id,
                pending, "resolving outstanding requests with errors"
            );
        }
        if self.destroyed {
            t.table.drain(|| LdapError::Destroyed);
        } else {
            let msg = reason.to_string();
            t.table.drain(move || LdapError::Connection(msg.clone()));
        }
        self.shared.connected.store(false, Ordering::SeqCst);
        t.closing
    }

    fn teardown(&mut self, reason: &str, graceful: bool) {
        if self.transport.is_none() {
            return;
        }
        info!(client = self.id, reason, "transport closed");
        let was_closing = self.drop_transport(reason);
        self.state = ConnState::Disconnected;
        if graceful {
            self.emit(ClientEvent::End);
        }
        self.emit(ClientEvent::Close);
        if !self.destroyed && !was_closing && self.opts.reconnect.is_some() {
            self.attempts = 0;
            self.backoff_next = self
                .opts
                .reconnect
                .as_ref()
                .map(|r| r.initial_delay())
                .unwrap_or_else(|| Duration::from_millis(100));
            self.start_connect();
        }
    }

    async fn on_destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        self.shared.destroyed.store(true, Ordering::SeqCst);
        self.queue.freeze();
        for req in self.queue.drain() {
            fail_op(req.completion, LdapError::Destroyed);
        }
        if self.transport.is_some() {
            // best-effort unbind before dropping the socket
            let bytes = {
                let t = self.transport.as_mut().unwrap();
                let id = t.idgen.next_id();
                encode_message(&Message::new(id, ProtocolOp::UnbindRequest))
            };
            let _ = self.transport.as_mut().unwrap().write(&bytes).await;
            self.drop_transport("client destroyed");
            self.state = ConnState::Disconnected;
        }
        info!(client = self.id, "destroyed");
        self.emit(ClientEvent::Destroy);
    }
}

fn deliver_terminal(pending: Pending, message: Message) {
    let result = message.op.result().cloned();
    match pending.completion {
        Completion::Single(tx) => {
            let outcome = match (&pending.expected, &result) {
                (Expected::Codes(codes), Some(res)) if codes.contains(&res.code) => Ok(message),
                (_, Some(res)) => Err(LdapError::from_result(res)),
                (_, None) => Err(LdapError::Protocol(format!(
                    "unexpected {} as a terminal response",
                    message.op.name()
                ))),
            };
            let _ = tx.send(outcome);
        }
        Completion::Search(tx) => {
            let outcome = match (&pending.expected, result) {
                (Expected::Codes(codes), Some(res)) if codes.contains(&res.code) => {
                    Ok(SearchItem::Done(res))
                }
                (_, Some(res)) => Err(LdapError::from_result(&res)),
                (_, None) => Err(LdapError::Protocol(format!(
                    "unexpected {} as a search terminal",
                    message.op.name()
                ))),
            };
            let _ = tx.send(outcome);
        }
        Completion::Ack(tx) => {
            let _ = tx.send(Ok(()));
        }
    }
}

/// Reader task: frame incoming bytes and forward decoded messages to the
/// driver. Any framing error, EOF or socket timeout ends the transport.
async fn read_loop(
    mut rd: StreamReadHalf,
    gen: u64,
    tx: mpsc::UnboundedSender<Internal>,
    socket_timeout: Option<Duration>,
) {
    let mut frames = FrameBuffer::new();
    let mut buf = [0u8; 4096];
    loop {
        let read = rd.read(&mut buf);
        let n = match socket_timeout {
            Some(limit) => match tokio::time::timeout(limit, read).await {
                Ok(n) => n,
                Err(_) => {
                    let _ = tx.send(Internal::SocketIdle { gen });
                    return;
                }
            },
            None => read.await,
        };
        match n {
            Ok(0) => {
                let _ = tx.send(Internal::TransportClosed {
                    gen,
                    reason: None,
                    graceful: true,
                });
                return;
            }
            Ok(n) => {
                frames.push(&buf[..n]);
                loop {
                    match frames.next_message() {
                        Ok(Some(message)) => {
                            if tx.send(Internal::Incoming { gen, message }).is_err() {
                                return;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            let _ = tx.send(Internal::TransportClosed {
                                gen,
                                reason: Some(e.to_string()),
                                graceful: false,
                            });
                            return;
                        }
                    }
                }
            }
            Err(e) => {
                let _ = tx.send(Internal::TransportClosed {
                    gen,
                    reason: Some(e.to_string()),
                    graceful: false,
                });
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_rdn_simple() {
        assert_eq!(split_first_rdn("cn=foo"), ("cn=foo".to_string(), None));
    }

    #[test]
    fn split_rdn_with_superior() {
        assert_eq!(
            split_first_rdn("cn=foo, ou=people, dc=example"),
            (
                "cn=foo".to_string(),
                Some("ou=people, dc=example".to_string())
            )
        );
    }

    #[test]
    fn split_rdn_escaped_comma() {
        assert_eq!(
            split_first_rdn(r"cn=doe\, john,ou=people"),
            (r"cn=doe\, john".to_string(), Some("ou=people".to_string()))
        );
    }
}
