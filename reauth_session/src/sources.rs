//! Refresh sources

use async_trait::async_trait;
use std::error;

use crate::{RefreshTokenRef, TokenGrant};

#[cfg(feature = "endpoint")]
pub mod endpoint;

#[cfg(feature = "endpoint")]
pub use endpoint::{RefreshEndpoint, RefreshEndpointError};

/// An asynchronous source of renewed tokens
///
/// Implementations perform the remote refresh call. They are only ever asked
/// for one refresh at a time per coordinator.
#[async_trait]
pub trait RefreshSource: Send + Sync + 'static {
    /// The error type returned in the event that the refresh fails
    type Error: error::Error + Send + Sync + 'static;

    /// Exchanges a refresh token for a new grant
    async fn refresh(&self, refresh_token: &RefreshTokenRef) -> Result<TokenGrant, Self::Error>;
}
