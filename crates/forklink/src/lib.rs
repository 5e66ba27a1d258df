//! forklink: authenticated single-use TCP channel between a controller and its forked worker.

pub mod bridge;
pub mod channel;
pub mod config;
mod error;
pub mod telemetry;
pub mod worker;

pub use bridge::codec::JsonCodec;
pub use bridge::descriptor::{ConnectionDescriptor, DescriptorError, SessionId};
pub use channel::{
    AcceptOutcome, Authentication, ChannelState, CommandQueue, CommandSender, CommandSource,
    Connection, ConsoleConsumer, EventHandler, ForkChannel, ReadinessGate, TracingConsole,
    command_queue,
};
pub use config::{ChannelConfig, io_runtime};
pub use error::{CloseError, ForkChannelError};
pub use worker::{WorkerConnection, connect_from_env, connect_with_max_frame_length};
