//! Worker side: connect back to the controller and authenticate.
//!
//! The worker receives the connection descriptor from its launcher, connects,
//! writes the raw session token and then speaks framed JSON: commands in,
//! events out.

use std::io;

use serde::{Serialize, de::DeserializeOwned};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::{DEFAULT_MAX_FRAME_LENGTH, JsonCodec};
use crate::bridge::descriptor::ConnectionDescriptor;

/// Environment variable carrying the connection descriptor into the worker.
pub const CONNECTION_ENV: &str = "FORKLINK_CONNECTION";

/// Authenticated connection to the controller.
pub struct WorkerConnection<C, E> {
    pub commands: FramedRead<OwnedReadHalf, JsonCodec<C>>,
    pub events: FramedWrite<OwnedWriteHalf, JsonCodec<E>>,
}

/// Connects to the controller and sends the session token.
///
/// Returns as soon as the token is written; the controller's verdict is not
/// reported back. A rejected worker sees its command stream end.
pub async fn connect<C, E>(
    descriptor: &ConnectionDescriptor,
) -> io::Result<WorkerConnection<C, E>>
where
    C: DeserializeOwned,
    E: Serialize,
{
    connect_with_max_frame_length(descriptor, DEFAULT_MAX_FRAME_LENGTH).await
}

/// [`connect`] with a frame limit matching the controller's
/// [`ChannelConfig::with_max_frame_length`](crate::ChannelConfig::with_max_frame_length).
pub async fn connect_with_max_frame_length<C, E>(
    descriptor: &ConnectionDescriptor,
    max_frame_length: usize,
) -> io::Result<WorkerConnection<C, E>>
where
    C: DeserializeOwned,
    E: Serialize,
{
    let mut stream = TcpStream::connect(descriptor.addr).await?;
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(error = %e, "TCP_NODELAY not supported");
    }
    stream.write_all(descriptor.session_id.as_bytes()).await?;
    tracing::debug!(addr = %descriptor.addr, "Connected to controller");

    let (read_half, write_half) = stream.into_split();
    Ok(WorkerConnection {
        commands: FramedRead::new(
            read_half,
            JsonCodec::with_max_frame_length(max_frame_length),
        ),
        events: FramedWrite::new(
            write_half,
            JsonCodec::with_max_frame_length(max_frame_length),
        ),
    })
}

/// [`connect`] from the textual descriptor.
pub async fn connect_str<C, E>(descriptor: &str) -> io::Result<WorkerConnection<C, E>>
where
    C: DeserializeOwned,
    E: Serialize,
{
    let descriptor: ConnectionDescriptor = descriptor
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    connect(&descriptor).await
}

/// [`connect`] using the descriptor from [`CONNECTION_ENV`].
pub async fn connect_from_env<C, E>() -> io::Result<WorkerConnection<C, E>>
where
    C: DeserializeOwned,
    E: Serialize,
{
    let descriptor = std::env::var(CONNECTION_ENV).map_err(|e| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("{CONNECTION_ENV} not usable: {e}"),
        )
    })?;
    connect_str(&descriptor).await
}
