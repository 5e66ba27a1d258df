//! Channel configuration and the I/O runtime it runs on.

use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use tokio::runtime::{Handle, Runtime};

use crate::bridge::codec::DEFAULT_MAX_FRAME_LENGTH;
use crate::bridge::descriptor::SessionId;
use crate::channel::{ConsoleConsumer, TracingConsole};
use crate::error::ForkChannelError;

pub struct ChannelConfig {
    /// Runtime running the accept, verification and relay tasks.
    pub runtime: Handle,
    /// Identifies the fork in logs.
    pub fork_id: u32,
    pub bind_addr: IpAddr,
    /// Generated per channel when not set.
    pub session_id: Option<SessionId>,
    pub max_frame_length: usize,
    pub console: Arc<dyn ConsoleConsumer>,
}

impl ChannelConfig {
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            fork_id: 1,
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            session_id: None,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            console: Arc::new(TracingConsole),
        }
    }

    /// Uses the runtime the caller is running in.
    pub fn from_current() -> Result<Self, ForkChannelError> {
        let handle = Handle::try_current().map_err(|e| ForkChannelError::Runtime(e.to_string()))?;
        Ok(Self::new(handle))
    }

    pub fn with_fork_id(mut self, fork_id: u32) -> Self {
        self.fork_id = fork_id;
        self
    }

    pub fn with_bind_addr(mut self, addr: IpAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    pub fn with_session_id(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn with_max_frame_length(mut self, max: usize) -> Self {
        self.max_frame_length = max;
        self
    }

    pub fn with_console(mut self, console: Arc<dyn ConsoleConsumer>) -> Self {
        self.console = console;
        self
    }
}

/// Builds a dedicated multi-thread runtime for fork channels.
///
/// `worker_threads` bounds the pool; dropping or shutting down the runtime
/// stops every task the channels spawned on it.
pub fn io_runtime(worker_threads: usize) -> io::Result<Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads.max(1))
        .thread_name("forklink-io")
        .enable_all()
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_current_requires_runtime() {
        let err = ChannelConfig::from_current().err().unwrap();
        assert!(matches!(err, ForkChannelError::Runtime(_)));
    }

    #[test]
    fn builder_overrides_defaults() {
        let rt = io_runtime(1).unwrap();
        let config = ChannelConfig::new(rt.handle().clone())
            .with_fork_id(7)
            .with_session_id(SessionId::parse("abc123").unwrap())
            .with_max_frame_length(1024);

        assert_eq!(config.fork_id, 7);
        assert_eq!(config.bind_addr, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(config.session_id.unwrap().as_str(), "abc123");
        assert_eq!(config.max_frame_length, 1024);
    }
}
