//! Collaborator traits and the relay loops that move traffic over the worker socket.
//!
//! - Command producer: pulls from a [`CommandSource`], one frame per command, flushed.
//! - Event consumer: decodes frames and hands each event to an [`EventHandler`].
//! - Console relay: forwards the worker's native stdout, line by line, to a [`ConsoleConsumer`].
//!
//! The event consumer and the console relay each hold a relay permit while they
//! run, so the owner can wait for both to drain before tearing the channel down.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Serialize, de::DeserializeOwned};
use tokio::io::{AsyncRead, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc, watch};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::JsonCodec;

/// Longest stdout line relayed as a unit.
const MAX_CONSOLE_LINE: usize = 1024 * 1024;

/// Supplies the commands sent to the worker.
#[async_trait]
pub trait CommandSource<C>: Send + Sync + 'static {
    /// Next command to send, or `None` once the source is exhausted.
    async fn next_command(&self) -> Option<C>;
}

/// Receives decoded events from the worker, one at a time, in arrival order.
pub trait EventHandler<E>: Send + Sync + 'static {
    fn handle_event(&self, event: E);
}

impl<E, F> EventHandler<E> for F
where
    F: Fn(E) + Send + Sync + 'static,
{
    fn handle_event(&self, event: E) {
        self(event)
    }
}

/// Receives the worker's native stdout text.
pub trait ConsoleConsumer: Send + Sync + 'static {
    fn on_line(&self, line: &str);
}

/// Logs every stdout line through tracing.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingConsole;

impl ConsoleConsumer for TracingConsole {
    fn on_line(&self, line: &str) {
        let trimmed = line.trim_end();
        if !trimmed.is_empty() {
            tracing::info!(target: "forklink::console", "{}", trimmed);
        }
    }
}

/// Creates an in-process command queue.
///
/// The queue is exhausted once every [`CommandSender`] has been dropped and the
/// pending commands have been drained.
pub fn command_queue<C: Send + 'static>() -> (CommandSender<C>, CommandQueue<C>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        CommandSender { tx },
        CommandQueue {
            rx: Mutex::new(rx),
        },
    )
}

/// Producer side of a [`CommandQueue`].
#[derive(Debug)]
pub struct CommandSender<C> {
    tx: mpsc::UnboundedSender<C>,
}

impl<C> Clone for CommandSender<C> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<C> CommandSender<C> {
    pub fn send(&self, command: C) -> io::Result<()> {
        self.tx
            .send(command)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "command queue closed"))
    }
}

#[derive(Debug)]
pub struct CommandQueue<C> {
    rx: Mutex<mpsc::UnboundedReceiver<C>>,
}

#[async_trait]
impl<C: Send + 'static> CommandSource<C> for CommandQueue<C> {
    async fn next_command(&self) -> Option<C> {
        self.rx.lock().await.recv().await
    }
}

/// Counts the inbound relays that are still running.
#[derive(Debug, Clone)]
pub(crate) struct RelayCountdown {
    pending: Arc<watch::Sender<usize>>,
}

impl Default for RelayCountdown {
    fn default() -> Self {
        Self {
            pending: Arc::new(watch::channel(0).0),
        }
    }
}

impl RelayCountdown {
    pub(crate) fn acquire(&self) -> RelayPermit {
        self.pending.send_modify(|n| *n += 1);
        RelayPermit {
            countdown: self.clone(),
        }
    }

    pub(crate) fn pending(&self) -> usize {
        *self.pending.borrow()
    }

    /// Resolves once every permit handed out so far has been dropped.
    pub(crate) async fn finished(&self) {
        let mut rx = self.pending.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

/// Held by a running relay; released on drop, including when the task is aborted.
#[derive(Debug)]
pub(crate) struct RelayPermit {
    countdown: RelayCountdown,
}

impl Drop for RelayPermit {
    fn drop(&mut self) {
        self.countdown
            .pending
            .send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// A permit taken before its relay exists; handed to the relay or released, once.
#[derive(Debug)]
pub(crate) struct ReservedPermit {
    countdown: RelayCountdown,
    held: AtomicBool,
}

impl ReservedPermit {
    pub(crate) fn new(countdown: RelayCountdown) -> Self {
        Self {
            countdown,
            held: AtomicBool::new(false),
        }
    }

    pub(crate) fn reserve(&self) {
        if !self.held.swap(true, Ordering::AcqRel) {
            self.countdown.pending.send_modify(|n| *n += 1);
        }
    }

    /// The reserved permit, for the first caller only.
    pub(crate) fn take(&self) -> Option<RelayPermit> {
        self.held
            .swap(false, Ordering::AcqRel)
            .then(|| RelayPermit {
                countdown: self.countdown.clone(),
            })
    }
}

pub(crate) type CommandWriter<C> = FramedWrite<WriteHalf<TcpStream>, JsonCodec<C>>;
pub(crate) type EventReader<E> = FramedRead<ReadHalf<TcpStream>, JsonCodec<E>>;

/// Writes commands until the source runs dry, the socket fails, or the channel is disabled.
pub(crate) async fn run_command_producer<C: Serialize + Send + 'static>(
    source: Arc<dyn CommandSource<C>>,
    mut writer: CommandWriter<C>,
    disabled: CancellationToken,
) {
    let mut sent: u64 = 0;
    loop {
        let next = tokio::select! {
            biased;
            _ = disabled.cancelled() => {
                tracing::debug!(sent, "Command producer disabled");
                break;
            }
            next = source.next_command() => next,
        };

        let Some(command) = next else {
            tracing::debug!(sent, "Command source exhausted");
            break;
        };

        // SinkExt::send flushes: nothing may sit in a buffer while the worker waits for it
        if let Err(e) = writer.send(command).await {
            tracing::error!(error = %e, sent, "Failed to send command to worker");
            break;
        }
        sent += 1;
    }
}

/// Dispatches events until end of stream, a decode failure, or the channel is disabled.
pub(crate) async fn run_event_consumer<E: DeserializeOwned + Send + 'static>(
    handler: Arc<dyn EventHandler<E>>,
    mut reader: EventReader<E>,
    disabled: CancellationToken,
) {
    let mut received: u64 = 0;
    loop {
        let frame = tokio::select! {
            biased;
            _ = disabled.cancelled() => {
                tracing::debug!(received, "Event consumer disabled");
                break;
            }
            frame = reader.next() => frame,
        };

        match frame {
            Some(Ok(event)) => {
                received += 1;
                handler.handle_event(event);
            }
            Some(Err(e)) => {
                tracing::error!(error = %e, received, "Event stream error");
                break;
            }
            None => {
                tracing::debug!(received, "Event stream closed by worker");
                break;
            }
        }
    }
}

pub(crate) async fn run_console_relay(
    stdout: Box<dyn AsyncRead + Send + Unpin>,
    console: Arc<dyn ConsoleConsumer>,
) {
    let mut lines = FramedRead::new(stdout, LinesCodec::new_with_max_length(MAX_CONSOLE_LINE));
    while let Some(line) = lines.next().await {
        match line {
            Ok(line) => console.on_line(&line),
            Err(e) => {
                tracing::warn!(error = %e, "Console relay stopped");
                break;
            }
        }
    }
    tracing::trace!("Console relay reached end of stdout");
}
