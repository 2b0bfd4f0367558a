#![forbid(unsafe_code)]

//! Credential handling and process guards shared by the tubemirror binaries.
//!
//! Credentials are plain values handed to every remote operation. Nothing in
//! the crate stores them globally; the caller (HTTP handler, CLI command)
//! builds one per request from whatever its session layer provides.

use std::fmt;

use anyhow::{Result, bail};
use nix::unistd::Uid;

use crate::error::{MirrorError, MirrorResult};

/// Authorization for a single remote call.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    /// Developer key. Enough for public reads (search, videos.list).
    ApiKey(String),
    /// User-granted OAuth tokens. Required for uploads. Refreshing an expired
    /// access token is the session layer's job, the refresh token only rides
    /// along so callers can hand it back after a failure.
    OAuth {
        access_token: String,
        refresh_token: Option<String>,
    },
}

impl Credentials {
    pub fn api_key(key: impl Into<String>) -> Self {
        Self::ApiKey(key.into())
    }

    pub fn oauth(access_token: impl Into<String>, refresh_token: Option<String>) -> Self {
        Self::OAuth {
            access_token: access_token.into(),
            refresh_token,
        }
    }

    /// Picks OAuth when an access token is present, otherwise the API key.
    pub fn resolve(
        access_token: Option<String>,
        refresh_token: Option<String>,
        api_key: Option<String>,
    ) -> MirrorResult<Self> {
        match (non_blank(access_token), non_blank(api_key)) {
            (Some(token), _) => Ok(Self::oauth(token, non_blank(refresh_token))),
            (None, Some(key)) => Ok(Self::ApiKey(key)),
            (None, None) => Err(MirrorError::MissingCredentials(
                "neither an access token nor an API key was provided",
            )),
        }
    }

    /// Value for the `Authorization` header, if this credential uses one.
    pub fn bearer_header(&self) -> Option<String> {
        match self {
            Self::ApiKey(_) => None,
            Self::OAuth { access_token, .. } => Some(format!("Bearer {access_token}")),
        }
    }

    /// Value for the `key` query parameter, if this credential uses one.
    pub fn query_key(&self) -> Option<&str> {
        match self {
            Self::ApiKey(key) => Some(key),
            Self::OAuth { .. } => None,
        }
    }

    /// Fails unless the credential acts on behalf of a user.
    pub fn require_user(&self) -> MirrorResult<()> {
        match self {
            Self::OAuth { .. } => Ok(()),
            Self::ApiKey(_) => Err(MirrorError::MissingCredentials(
                "this operation needs an OAuth access token",
            )),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ApiKey(_) => f.write_str("ApiKey(<redacted>)"),
            Self::OAuth { refresh_token, .. } => f
                .debug_struct("OAuth")
                .field("access_token", &"<redacted>")
                .field(
                    "refresh_token",
                    &refresh_token.as_ref().map(|_| "<redacted>"),
                )
                .finish(),
        }
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Fails fast when a binary is started as root. The mirror database and
/// cache live in a user-owned data root.
pub fn ensure_not_root(process: &str) -> Result<()> {
    ensure_not_root_for(Uid::current(), process)
}

fn ensure_not_root_for(uid: Uid, process: &str) -> Result<()> {
    if uid.is_root() {
        bail!("{process} must not be run as root; use a dedicated service account");
    }
    Ok(())
}
