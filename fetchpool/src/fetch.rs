use std::error::Error as _;

use bytes::Bytes;
use thiserror::Error;

pub use reqwest::{Client, IntoUrl, StatusCode};
use reqwest::Response;
use url::Url;

use crate::auth::{AuthContext, Challenge, Credential};

/// Failure to fetch a resource.
///
/// Whatever went wrong (transport, status, decoding), it is reported through a single human-readable reason.
#[derive(Debug, Clone, Error)]
#[error("{reason}")]
pub struct FetchError {
    reason: String,
    status: Option<StatusCode>,
}

impl FetchError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            status: None,
        }
    }

    fn from_status(status: StatusCode) -> Self {
        Self {
            reason: status.to_string(),
            status: Some(status),
        }
    }

    #[inline]
    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// HTTP status of the response when the failure was a non-success status.
    #[inline]
    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        let mut reason = err.to_string();

        let mut source = err.source();
        while let Some(cause) = source {
            reason.push_str(": ");
            reason.push_str(&cause.to_string());
            source = cause.source();
        }

        Self {
            reason,
            status: err.status(),
        }
    }
}

impl From<url::ParseError> for FetchError {
    fn from(err: url::ParseError) -> Self {
        Self::new(format!("invalid URL: {err}"))
    }
}

impl From<std::str::Utf8Error> for FetchError {
    fn from(err: std::str::Utf8Error) -> Self {
        Self::new(format!("response body is not valid UTF-8: {err}"))
    }
}

/// Fetch `url` with a single `credential` and return the response body as text.
pub async fn fetch(url: impl IntoUrl, credential: Credential) -> Result<String, FetchError> {
    Fetcher::new(AuthContext::from_iter([credential])).get(url).await
}

/// HTTP client resolving Basic authentication credentials from an [`AuthContext`].
///
/// Default-realm credentials covering the requested URL are sent preemptively. Realm-specific ones are only sent in
/// answer to a `401 Unauthorized` response challenging for their realm, in which case the request is sent once more.
#[derive(Debug, Clone)]
pub struct Fetcher {
    client: Client,
    auth: AuthContext,
}

impl Fetcher {
    pub fn new(auth: AuthContext) -> Self {
        Self {
            client: Client::default(),
            auth,
        }
    }

    #[inline]
    pub fn with_client(self, client: Client) -> Self {
        Self { client, ..self }
    }

    #[inline]
    pub fn auth(&self) -> &AuthContext {
        &self.auth
    }

    /// GET `url` and decode the whole response body as UTF-8 text.
    pub async fn get(&self, url: impl IntoUrl) -> Result<String, FetchError> {
        let body = self.get_bytes(url).await?;

        Ok(std::str::from_utf8(&body)?.to_owned())
    }

    /// GET `url` and buffer the whole response body.
    pub async fn get_bytes(&self, url: impl IntoUrl) -> Result<Bytes, FetchError> {
        let url = url.into_url()?;

        let sent = self.auth.find(None, &url);

        if let Some(credential) = sent {
            tracing::debug!("Sending credentials of `{}` preemptively to `{url}`", credential.username());
        }

        let mut resp = self.send(&url, sent).await?;

        if resp.status() == StatusCode::UNAUTHORIZED {
            match Challenge::from_headers(resp.headers()) {
                Some(challenge) => {
                    let realm = challenge.realm();

                    match self.auth.find(realm, &url) {
                        Some(credential) if sent != Some(credential) => {
                            tracing::debug!("Answering challenge for realm {realm:?} with credentials of `{}`", credential.username());

                            resp = self.send(&url, Some(credential)).await?;
                        }
                        _ => tracing::debug!("No other credentials to answer challenge for realm {realm:?} from `{url}`"),
                    }
                }
                None => tracing::debug!("Unauthorized without Basic challenge from `{url}`"),
            }
        }

        let status = resp.status();

        if !status.is_success() {
            return Err(FetchError::from_status(status));
        }

        Ok(resp.bytes().await?)
    }

    async fn send(&self, url: &Url, credential: Option<&Credential>) -> Result<Response, FetchError> {
        let mut request = self.client.get(url.clone());

        if let Some(credential) = credential {
            request = request.basic_auth(credential.username(), Some(credential.password()));
        }

        Ok(request.send().await?)
    }
}
