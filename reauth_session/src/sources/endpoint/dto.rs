//! Wire bodies exchanged with the refresh endpoint

use serde::{Deserialize, Serialize};

use crate::{AccessToken, RefreshToken, TokenGrant};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct RefreshRequest<'a> {
    pub refresh_token: &'a str,
}

/// A successful body; every field is optional on the wire so that a missing
/// access token can be reported as such rather than as a parse error
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct RefreshResponse {
    #[serde(default)]
    pub access_token: Option<AccessToken>,
    #[serde(default)]
    pub refresh_token: Option<RefreshToken>,
    #[serde(default)]
    pub user: Option<serde_json::Value>,
}

impl RefreshResponse {
    pub fn into_grant(self) -> Option<TokenGrant> {
        let access_token = self.access_token.filter(|t| !t.as_str().is_empty())?;
        Some(TokenGrant {
            access_token,
            refresh_token: self.refresh_token.filter(|t| !t.as_str().is_empty()),
            user: self.user,
        })
    }
}
