//! Error types for the fork channel.

use std::fmt;
use std::io;

use crate::channel::Authentication;

#[derive(Debug, thiserror::Error)]
pub enum ForkChannelError {
    /// API misuse: connecting twice, binding a stream twice, using a closed channel.
    #[error("illegal state: {0}")]
    IllegalState(&'static str),
    #[error("failed to bind listening socket: {0}")]
    Bind(#[source] io::Error),
    #[error("failed to accept worker connection: {0}")]
    Accept(String),
    #[error("no tokio runtime available: {0}")]
    Runtime(String),
    #[error("worker authentication failed: {0}")]
    Authentication(Authentication),
    #[error(transparent)]
    Close(#[from] CloseError),
}

/// Releasing the channel's resources failed.
///
/// Every resource is released regardless; `first` is the earliest failure and
/// `suppressed` holds the ones that followed it.
#[derive(Debug)]
pub struct CloseError {
    pub first: io::Error,
    pub suppressed: Vec<io::Error>,
}

impl CloseError {
    /// Folds release results into a single outcome, keeping every failure.
    pub fn aggregate(results: impl IntoIterator<Item = io::Result<()>>) -> Result<(), Self> {
        let mut errors = results.into_iter().filter_map(Result::err);
        match errors.next() {
            None => Ok(()),
            Some(first) => Err(Self {
                first,
                suppressed: errors.collect(),
            }),
        }
    }
}

impl fmt::Display for CloseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to close fork channel: {}", self.first)?;
        if !self.suppressed.is_empty() {
            write!(f, " ({} more suppressed)", self.suppressed.len())?;
        }
        Ok(())
    }
}

impl std::error::Error for CloseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.first)
    }
}
