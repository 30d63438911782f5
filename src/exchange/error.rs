//! Typed failures a venue call can produce.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VenueError {
    /// The venue refused the request (bad parameters, reduce-only violation, signature).
    #[error("order rejected: {0}")]
    OrderRejected(String),
    /// No acknowledgement arrived in time.
    #[error("order timed out: {0}")]
    OrderTimeout(String),
    #[error("venue unavailable: {0}")]
    VenueUnavailable(String),
    #[error("unexpected venue response: {0}")]
    Decode(String),
}

impl VenueError {
    /// Transient failures are retried on the next evaluation cycle.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            VenueError::OrderTimeout(_) | VenueError::VenueUnavailable(_)
        )
    }
}

pub type VenueResult<T> = std::result::Result<T, VenueError>;
