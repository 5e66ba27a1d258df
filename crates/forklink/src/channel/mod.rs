//! Fork channel - controller side of the single-worker TCP channel.
//!
//! Flow:
//! 1. [`ForkChannel::open`] binds an ephemeral loopback port
//! 2. The descriptor (`tcp://host:port?sessionId=token`) is handed to the worker
//! 3. [`ForkChannel::connect_to_client`] starts accepting, returns a [`Connection`]
//! 4. The worker connects and sends the token, the outcome resolves the connection
//! 5. Command source and event handler are registered in any order
//! 6. Once verification and both registrations are in, the readiness gate opens
//!    and the command producer and event consumer start on the worker socket
//!
//! Lifecycle: [`disable`](ForkChannel::disable) stops dispatch,
//! [`relays_finished`](ForkChannel::relays_finished) waits for the event stream and
//! stdout to drain, [`close`](ForkChannel::close) releases the worker socket, the
//! listener and the relay tasks.

mod gate;
mod handshake;
mod streams;

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use serde::{Serialize, de::DeserializeOwned};
use tokio::io::AsyncRead;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

pub use gate::ReadinessGate;
pub use handshake::{AcceptOutcome, Authentication, Connection};
pub use streams::{
    CommandQueue, CommandSender, CommandSource, ConsoleConsumer, EventHandler, TracingConsole,
    command_queue,
};

use crate::bridge::codec::JsonCodec;
use crate::bridge::descriptor::{ConnectionDescriptor, SessionId};
use crate::config::ChannelConfig;
use crate::error::{CloseError, ForkChannelError};
use handshake::{Handshake, WorkerSlot};
use streams::{
    RelayCountdown, ReservedPermit, run_command_producer, run_console_relay, run_event_consumer,
};

/// Verification outcome, command source registered, event handler registered.
const READINESS_PARTICIPANTS: usize = 3;

/// Lifecycle of a fork channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChannelState {
    Created = 0,
    Listening = 1,
    Accepting = 2,
    Accepted = 3,
    Authenticating = 4,
    /// Worker verified; waiting for the stream registrations.
    Authenticated = 5,
    /// Streams are bound to the verified worker.
    Ready = 6,
    /// Accepting failed or the worker could not be verified.
    Failed = 7,
    Closed = 8,
}

impl ChannelState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Created,
            1 => Self::Listening,
            2 => Self::Accepting,
            3 => Self::Accepted,
            4 => Self::Authenticating,
            5 => Self::Authenticated,
            6 => Self::Ready,
            7 => Self::Failed,
            _ => Self::Closed,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }
}

#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    fn new(state: ChannelState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub(crate) fn get(&self) -> ChannelState {
        ChannelState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Closed is final; Failed only gives way to Closed.
    pub(crate) fn advance(&self, next: ChannelState) {
        let _ = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                match ChannelState::from_u8(current) {
                    ChannelState::Closed => None,
                    ChannelState::Failed if next != ChannelState::Closed => None,
                    _ => Some(next as u8),
                }
            });
    }
}

#[derive(Default)]
struct Relays {
    producer: OnceLock<JoinHandle<()>>,
    consumer: OnceLock<JoinHandle<()>>,
    console: OnceLock<JoinHandle<()>>,
}

impl Relays {
    fn streams_bound(&self) -> bool {
        self.producer.get().is_some() || self.consumer.get().is_some()
    }

    fn abort_streams(&self) {
        for task in [self.producer.get(), self.consumer.get()].into_iter().flatten() {
            task.abort();
        }
    }

    fn abort_console(&self) {
        if let Some(task) = self.console.get() {
            task.abort();
        }
    }
}

struct Shared<C, E> {
    fork_id: u32,
    runtime: Handle,
    max_frame_length: usize,
    console: Arc<dyn ConsoleConsumer>,
    worker: Arc<WorkerSlot>,
    state: Arc<StateCell>,
    gate: ReadinessGate,
    authentication: OnceLock<Authentication>,
    commands: OnceLock<Arc<dyn CommandSource<C>>>,
    events: OnceLock<Arc<dyn EventHandler<E>>>,
    disabled: CancellationToken,
    closed: AtomicBool,
    relays: Relays,
    inbound: RelayCountdown,
    consumer_permit: ReservedPermit,
}

impl<C, E> Shared<C, E>
where
    C: Serialize + Send + 'static,
    E: DeserializeOwned + Send + 'static,
{
    fn record_authentication(self: &Arc<Self>, outcome: Authentication) {
        let _ = self.authentication.set(outcome);
        self.arrive();
    }

    fn arrive(self: &Arc<Self>) {
        self.gate.arrive_then(|| self.bind_streams());
    }

    /// Runs once, from whichever arrival opened the readiness gate.
    fn bind_streams(self: &Arc<Self>) {
        let fork_id = self.fork_id;
        if self.closed.load(Ordering::Acquire) {
            tracing::debug!(fork_id, "Channel closed before streams could be bound");
            return;
        }

        match self.authentication.get() {
            Some(Authentication::Verified) => {}
            outcome => {
                tracing::warn!(fork_id, ?outcome, "Not binding streams to an unverified worker");
                self.state.advance(ChannelState::Failed);
                drop(self.consumer_permit.take());
                return;
            }
        }

        let (Some(socket), Some(commands), Some(events)) =
            (self.worker.get(), self.commands.get(), self.events.get())
        else {
            tracing::error!(fork_id, "Readiness gate opened without worker socket or bindings");
            self.state.advance(ChannelState::Failed);
            drop(self.consumer_permit.take());
            return;
        };

        let _guard = self.runtime.enter();
        let stream = match socket.try_clone().and_then(TcpStream::from_std) {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!(fork_id, error = %e, "Failed to open worker socket for streams");
                self.state.advance(ChannelState::Failed);
                drop(self.consumer_permit.take());
                return;
            }
        };

        let (read_half, write_half) = tokio::io::split(stream);
        let reader = FramedRead::new(
            read_half,
            JsonCodec::<E>::with_max_frame_length(self.max_frame_length),
        );
        // Every command is flushed as it is written
        let writer = FramedWrite::new(
            write_half,
            JsonCodec::<C>::with_max_frame_length(self.max_frame_length),
        );

        let permit = self.consumer_permit.take();
        let consume = run_event_consumer(Arc::clone(events), reader, self.disabled.clone());
        let consumer = self.runtime.spawn(
            async move {
                let _permit = permit;
                consume.await
            }
            .instrument(tracing::debug_span!("event_consumer", fork_id)),
        );
        let producer = self.runtime.spawn(
            run_command_producer(Arc::clone(commands), writer, self.disabled.clone())
                .instrument(tracing::debug_span!("command_producer", fork_id)),
        );
        let _ = self.relays.consumer.set(consumer);
        let _ = self.relays.producer.set(producer);

        if self.closed.load(Ordering::Acquire) {
            self.relays.abort_streams();
            return;
        }
        self.state.advance(ChannelState::Ready);
        tracing::debug!(fork_id, "Command and event streams bound to worker");
    }
}

/// Controller side of the channel to one forked worker.
///
/// `C` is the command type sent to the worker, `E` the event type received from it.
pub struct ForkChannel<C, E> {
    shared: Arc<Shared<C, E>>,
    descriptor: ConnectionDescriptor,
    listener: Option<TcpListener>,
    accept_task: Option<JoinHandle<()>>,
}

impl<C, E> ForkChannel<C, E>
where
    C: Serialize + Send + 'static,
    E: DeserializeOwned + Send + 'static,
{
    /// Binds the listening socket. Must be given a runtime that stays alive for
    /// the life of the channel.
    pub fn open(config: ChannelConfig) -> Result<Self, ForkChannelError> {
        let listener = {
            let _guard = config.runtime.enter();
            bind_listener(config.bind_addr).map_err(ForkChannelError::Bind)?
        };
        let local_addr = listener.local_addr().map_err(ForkChannelError::Bind)?;
        let session_id = config.session_id.unwrap_or_else(SessionId::generate);
        let inbound = RelayCountdown::default();

        tracing::debug!(
            fork_id = config.fork_id,
            port = local_addr.port(),
            "Fork channel listening"
        );

        let shared = Arc::new(Shared {
            fork_id: config.fork_id,
            runtime: config.runtime,
            max_frame_length: config.max_frame_length,
            console: config.console,
            worker: Arc::new(WorkerSlot::default()),
            state: Arc::new(StateCell::new(ChannelState::Listening)),
            gate: ReadinessGate::new(READINESS_PARTICIPANTS),
            authentication: OnceLock::new(),
            commands: OnceLock::new(),
            events: OnceLock::new(),
            disabled: CancellationToken::new(),
            closed: AtomicBool::new(false),
            relays: Relays::default(),
            inbound: inbound.clone(),
            consumer_permit: ReservedPermit::new(inbound),
        });

        Ok(Self {
            shared,
            descriptor: ConnectionDescriptor::new(local_addr, session_id),
            listener: Some(listener),
            accept_task: None,
        })
    }

    /// Starts accepting the worker without blocking. Allowed once per channel.
    pub fn connect_to_client(&mut self) -> Result<Connection, ForkChannelError> {
        self.ensure_open()?;
        let listener = self.listener.take().ok_or(ForkChannelError::IllegalState(
            "already accepted TCP client connection",
        ))?;

        let handshake = Handshake {
            listener,
            session_id: self.descriptor.session_id.clone(),
            worker: Arc::clone(&self.shared.worker),
            state: Arc::clone(&self.shared.state),
        };
        let shared = Arc::clone(&self.shared);
        let span = tracing::debug_span!("handshake", fork_id = self.shared.fork_id);

        let (connection, task) = {
            let _guard = self.shared.runtime.enter();
            let _entered = span.enter();
            handshake.start(move |outcome| shared.record_authentication(outcome))
        };
        self.accept_task = Some(task);
        Ok(connection)
    }

    /// Registers where commands for the worker come from.
    pub fn bind_command_source(
        &self,
        source: impl CommandSource<C>,
    ) -> Result<(), ForkChannelError> {
        self.ensure_open()?;
        let source: Arc<dyn CommandSource<C>> = Arc::new(source);
        self.shared
            .commands
            .set(source)
            .map_err(|_| ForkChannelError::IllegalState("command source already bound"))?;
        self.shared.arrive();
        Ok(())
    }

    /// Registers the event handler and, when given, starts relaying the worker's
    /// native stdout to the configured console consumer.
    ///
    /// Both the event consumer and the console relay count towards
    /// [`relays_finished`](ForkChannel::relays_finished).
    pub fn bind_event_handler(
        &self,
        handler: impl EventHandler<E>,
        stdout: Option<Box<dyn AsyncRead + Send + Unpin>>,
    ) -> Result<(), ForkChannelError> {
        self.ensure_open()?;
        let handler: Arc<dyn EventHandler<E>> = Arc::new(handler);
        self.shared
            .events
            .set(handler)
            .map_err(|_| ForkChannelError::IllegalState("event handler already bound"))?;

        self.shared.consumer_permit.reserve();
        if let Some(stdout) = stdout {
            let console = Arc::clone(&self.shared.console);
            let permit = self.shared.inbound.acquire();
            let span = tracing::debug_span!("console_relay", fork_id = self.shared.fork_id);
            let task = self.shared.runtime.spawn(
                async move {
                    let _permit = permit;
                    run_console_relay(stdout, console).await
                }
                .instrument(span),
            );
            let _ = self.shared.relays.console.set(task);
        }

        self.shared.arrive();
        Ok(())
    }
}

impl<C, E> ForkChannel<C, E> {
    /// `tcp://<host>:<port>?sessionId=<token>`, for the worker's bootstrap.
    pub fn connection_string(&self) -> String {
        self.descriptor.to_string()
    }

    /// Environment entry the launcher passes to the worker process.
    pub fn worker_env(&self) -> (&'static str, String) {
        (crate::worker::CONNECTION_ENV, self.connection_string())
    }

    pub fn descriptor(&self) -> &ConnectionDescriptor {
        &self.descriptor
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.descriptor.addr
    }

    pub fn local_host(&self) -> IpAddr {
        self.descriptor.host()
    }

    pub fn local_port(&self) -> u16 {
        self.descriptor.port()
    }

    pub fn session_id(&self) -> &SessionId {
        &self.descriptor.session_id
    }

    pub fn fork_id(&self) -> u32 {
        self.shared.fork_id
    }

    pub fn state(&self) -> ChannelState {
        self.shared.state.get()
    }

    /// True once both streams run against the verified worker.
    pub fn is_ready(&self) -> bool {
        self.state() == ChannelState::Ready
    }

    /// Readiness signals still missing before the streams get bound.
    pub fn readiness_remaining(&self) -> usize {
        self.shared.gate.remaining()
    }

    /// Address of the retained worker connection, once one was accepted.
    pub fn worker_peer(&self) -> Option<SocketAddr> {
        self.shared.worker.peer_addr()
    }

    /// Inbound relays (event consumer, console relay) that have not finished yet.
    ///
    /// The event consumer counts from the moment the handler is bound.
    pub fn pending_relays(&self) -> usize {
        self.shared.inbound.pending()
    }

    /// Waits until the event stream and the worker's stdout have been drained.
    ///
    /// Resolves when both relays hit end of stream, are disabled, or the
    /// channel is closed. Returns at once when no event handler was bound.
    pub async fn relays_finished(&self) {
        self.shared.inbound.finished().await
    }

    /// Stops the command producer and event consumer; sockets stay open.
    ///
    /// No-op when the streams were never bound. Safe to call repeatedly.
    pub fn disable(&self) {
        if !self.shared.relays.streams_bound() {
            tracing::trace!(fork_id = self.shared.fork_id, "Disable before streams were bound");
            return;
        }
        if !self.shared.disabled.is_cancelled() {
            tracing::debug!(fork_id = self.shared.fork_id, "Disabling command and event streams");
            self.shared.disabled.cancel();
        }
    }

    /// Releases the worker socket, the listener and the relay tasks.
    ///
    /// Every release is attempted; the first failure is returned with the
    /// others attached. Calling it again is a no-op.
    pub fn close(&mut self) -> Result<(), ForkChannelError> {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.shared.state.advance(ChannelState::Closed);
        tracing::debug!(fork_id = self.shared.fork_id, "Closing fork channel");

        let worker = self.shared.worker.shutdown();
        let listener = self.release_listener();
        self.shared.relays.abort_streams();
        self.shared.relays.abort_console();
        drop(self.shared.consumer_permit.take());

        CloseError::aggregate([worker, listener]).map_err(ForkChannelError::from)
    }

    fn release_listener(&mut self) -> io::Result<()> {
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
        match self.listener.take() {
            // into_std deregisters from the reactor; the std listener closes on drop
            Some(listener) => listener.into_std().map(drop),
            None => Ok(()),
        }
    }

    fn ensure_open(&self) -> Result<(), ForkChannelError> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(ForkChannelError::IllegalState("fork channel is closed"));
        }
        Ok(())
    }
}

impl<C, E> Drop for ForkChannel<C, E> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(fork_id = self.shared.fork_id, error = %e, "Failed to close fork channel");
        }
    }
}

/// Loopback listener on an OS-assigned port, backlog of one.
fn bind_listener(ip: IpAddr) -> io::Result<TcpListener> {
    let addr = SocketAddr::new(ip, 0);
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    if let Err(e) = socket.set_reuseaddr(true) {
        tracing::debug!(error = %e, "SO_REUSEADDR not supported");
    }
    if let Err(e) = socket.set_keepalive(true) {
        tracing::debug!(error = %e, "SO_KEEPALIVE not supported");
    }
    socket.bind(addr)?;
    socket.listen(1)
}
