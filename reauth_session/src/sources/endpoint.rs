//! A refresh source that exchanges refresh tokens with an HTTP endpoint

use std::{fmt, marker::PhantomData};

use async_trait::async_trait;
use reqwest_middleware::{ClientWithMiddleware, RequestBuilder};
use thiserror::Error;

use super::RefreshSource;
use crate::{RefreshTokenRef, TokenGrant};

mod dto;

/// A refresh source backed by an HTTP refresh endpoint
///
/// The endpoint receives `{ "refreshToken": "…" }` and answers with
/// `{ "accessToken": "…", "refreshToken"?: "…", "user"?: { … } }`.
///
/// The client given here must not carry the middleware that renews sessions on
/// authentication failure, or a rejected refresh token would itself trigger a
/// refresh.
pub struct RefreshEndpoint<T = JsonBody> {
    client: ClientWithMiddleware,
    url: reqwest::Url,
    content_type: PhantomData<fn() -> T>,
}

impl<T> fmt::Debug for RefreshEndpoint<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RefreshEndpoint")
            .field("url", &self.url.as_str())
            .finish_non_exhaustive()
    }
}

impl RefreshEndpoint<JsonBody> {
    /// Constructs a new refresh endpoint that sends its request as JSON
    pub fn new(client: impl Into<ClientWithMiddleware>, url: reqwest::Url) -> Self {
        Self {
            client: client.into(),
            url,
            content_type: PhantomData,
        }
    }

    /// Configures the endpoint to send the refresh token as form data
    pub fn using_form_data(self) -> RefreshEndpoint<FormBody> {
        RefreshEndpoint {
            client: self.client,
            url: self.url,
            content_type: PhantomData,
        }
    }
}

#[async_trait]
impl<T: RequestType> RefreshSource for RefreshEndpoint<T> {
    type Error = RefreshEndpointError;

    async fn refresh(&self, refresh_token: &RefreshTokenRef) -> Result<TokenGrant, Self::Error> {
        request_refresh::<T>(&self.client, self.url.clone(), refresh_token).await
    }
}

/// An error while exchanging a refresh token with the endpoint
#[derive(Debug, Error)]
pub enum RefreshEndpointError {
    /// The endpoint answered with a non-success status
    #[error("refresh endpoint rejected the request: {body}")]
    ErrorWithBody {
        /// The underlying status error
        source: reqwest::Error,
        /// The body of the error
        body: String,
    },
    /// Unable to deserialize the refresh response body
    #[error("error deserializing refresh response body")]
    BodyDeserialize(#[from] serde_json::Error),
    /// The response was successful but carried no access token
    #[error("refresh response did not contain an access token")]
    MissingAccessToken,
    /// Unable to read the response
    #[error("error reading refresh response body")]
    BodyRead(#[source] reqwest::Error),
    /// Unable to send the refresh request
    #[error("error sending refresh request")]
    RequestSend(#[source] reqwest_middleware::Error),
}

impl RefreshEndpointError {
    /// The HTTP status returned by the endpoint, if it answered with an error status
    pub fn status(&self) -> Option<reqwest::StatusCode> {
        match self {
            Self::ErrorWithBody { source, .. } => source.status(),
            _ => None,
        }
    }
}

#[tracing::instrument(err, skip(client, url, refresh_token), fields(url = %url, content_type = T::NAME))]
async fn request_refresh<T: RequestType>(
    client: &ClientWithMiddleware,
    url: reqwest::Url,
    refresh_token: &RefreshTokenRef,
) -> Result<TokenGrant, RefreshEndpointError> {
    tracing::trace!("sending refresh token to endpoint");

    let payload = dto::RefreshRequest {
        refresh_token: refresh_token.as_str(),
    };
    let resp = T::attach_payload(client.post(url), &payload)
        .send()
        .await
        .map_err(RefreshEndpointError::RequestSend)?;

    tracing::debug!(
        response.status = resp.status().as_u16(),
        "received refresh response"
    );

    if let Err(error) = resp.error_for_status_ref() {
        let body = resp.text().await.map_err(RefreshEndpointError::BodyRead)?;
        return Err(RefreshEndpointError::ErrorWithBody {
            source: error,
            body,
        });
    }

    let body = resp.bytes().await.map_err(RefreshEndpointError::BodyRead)?;
    let resp: dto::RefreshResponse = serde_json::from_slice(&body)?;

    let grant = resp
        .into_grant()
        .ok_or(RefreshEndpointError::MissingAccessToken)?;

    tracing::info!(
        has_refresh_token = grant.refresh_token.is_some(),
        has_user = grant.user.is_some(),
        "received renewed tokens"
    );

    Ok(grant)
}

/// A manner of attaching a serializable payload to a request
pub trait RequestType: Send + Sync + 'static {
    /// A short name for the encoding, used in traces
    const NAME: &'static str;

    /// Attaches the serializable payload to the request body
    fn attach_payload<S: serde::Serialize>(request: RequestBuilder, payload: &S) -> RequestBuilder;
}

/// Sends the refresh token as a JSON body
#[derive(Debug)]
pub struct JsonBody;

/// Sends the refresh token as URL-encoded form data
#[derive(Debug)]
pub struct FormBody;

impl RequestType for JsonBody {
    const NAME: &'static str = "json";

    fn attach_payload<S: serde::Serialize>(request: RequestBuilder, payload: &S) -> RequestBuilder {
        request.json(payload)
    }
}

impl RequestType for FormBody {
    const NAME: &'static str = "form";

    fn attach_payload<S: serde::Serialize>(request: RequestBuilder, payload: &S) -> RequestBuilder {
        request.form(payload)
    }
}
