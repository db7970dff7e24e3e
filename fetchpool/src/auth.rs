//! HTTP Basic authentication credentials scoped by realm and URL.

use std::collections::HashMap;
use std::fmt;
use std::ops::Range;

use reqwest::header::{HeaderMap, WWW_AUTHENTICATE};
use url::Url;

/// A username/password pair bound to a URL scope and, optionally, to a realm.
///
/// A credential without a realm belongs to the default realm: it answers any realm challenged by the server within its scope.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    realm: Option<String>,
    scope: Url,
    username: String,
    password: String,
}

impl Credential {
    /// Create a default-realm credential for every URL under `scope`.
    ///
    /// Query and fragment of `scope` are ignored.
    pub fn new(scope: &str, username: impl Into<String>, password: impl Into<String>) -> Result<Self, url::ParseError> {
        let mut scope = Url::parse(scope)?;
        scope.set_query(None);
        scope.set_fragment(None);

        Ok(Self {
            realm: None,
            scope,
            username: username.into(),
            password: password.into(),
        })
    }

    /// Restrict this credential to `realm`.
    #[inline]
    pub fn with_realm(self, realm: impl Into<String>) -> Self {
        Self {
            realm: Some(realm.into()),
            ..self
        }
    }

    #[inline]
    pub fn realm(&self) -> Option<&str> {
        self.realm.as_deref()
    }

    #[inline]
    pub fn scope(&self) -> &Url {
        &self.scope
    }

    #[inline]
    pub fn username(&self) -> &str {
        &self.username
    }

    #[inline]
    pub fn password(&self) -> &str {
        &self.password
    }

    /// Whether `url` lies within this credential's scope.
    ///
    /// Scheme, host and port must match, and the scope path must be a segment-wise prefix of the URL path.
    pub fn covers(&self, url: &Url) -> bool {
        let scope = &self.scope;

        if scope.scheme() != url.scheme()
            || scope.host_str() != url.host_str()
            || scope.port_or_known_default() != url.port_or_known_default()
        {
            return false;
        }

        let prefix = scope.path();

        match url.path().strip_prefix(prefix) {
            Some(rest) => rest.is_empty() || prefix.ends_with('/') || rest.starts_with('/'),
            None => false,
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("realm", &self.realm)
            .field("scope", &self.scope.as_str())
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Registry of credentials, unique per `(realm, scope)`.
#[derive(Debug, Clone, Default)]
pub struct AuthContext {
    credentials: HashMap<(Option<String>, Url), Credential>,
}

impl AuthContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `credential`, returning the one previously registered for the same realm and scope.
    pub fn insert(&mut self, credential: Credential) -> Option<Credential> {
        let key = (credential.realm.clone(), credential.scope.clone());

        self.credentials.insert(key, credential)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }

    /// Find the credential to use for `url` when challenged for `realm`.
    ///
    /// Credentials registered for `realm` take precedence over default-realm ones. Among candidates, the most specific scope wins.
    pub fn find(&self, realm: Option<&str>, url: &Url) -> Option<&Credential> {
        realm
            .and_then(|realm| self.most_specific(Some(realm), url))
            .or_else(|| self.most_specific(None, url))
    }

    fn most_specific(&self, realm: Option<&str>, url: &Url) -> Option<&Credential> {
        self.credentials
            .values()
            .filter(|credential| credential.realm() == realm && credential.covers(url))
            .max_by(|a, b| {
                let (a, b) = (a.scope(), b.scope());
                a.path().len().cmp(&b.path().len()).then_with(|| a.as_str().cmp(b.as_str()))
            })
    }
}

impl FromIterator<Credential> for AuthContext {
    fn from_iter<I: IntoIterator<Item = Credential>>(iter: I) -> Self {
        let mut context = Self::new();
        for credential in iter {
            context.insert(credential);
        }
        context
    }
}

/// A `Basic` authentication challenge sent along a `401 Unauthorized` response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    realm: Option<String>,
}

impl Challenge {
    /// Extract the first `Basic` challenge out of the `WWW-Authenticate` response headers.
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        headers
            .get_all(WWW_AUTHENTICATE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .find_map(Self::parse)
    }

    /// Parse a `WWW-Authenticate` header value, eg. `Basic realm="Admin Area"`.
    pub fn parse(value: &str) -> Option<Self> {
        // ASCII lowercasing keeps byte offsets aligned with `value`
        let lower = value.to_ascii_lowercase();

        let start = find_token(&lower, "basic", |c| c.is_ascii_whitespace())? + "basic".len();
        let params = &lower[start..];

        let realm = find_token(params, "realm", |c| c == '=' || c.is_ascii_whitespace()).and_then(|offset| {
            let raw = value[start + offset + "realm".len()..].trim_start().strip_prefix('=')?.trim_start();

            let realm = match raw.chars().next() {
                Some(quote @ ('"' | '\'')) => {
                    let quoted = &raw[1..];
                    &quoted[..quoted.find(quote).unwrap_or(quoted.len())]
                }
                _ => &raw[..raw.find([',', ' ', '\t']).unwrap_or(raw.len())],
            };

            Some(realm.to_owned())
        });

        Some(Self { realm })
    }

    #[inline]
    pub fn realm(&self) -> Option<&str> {
        self.realm.as_deref()
    }
}

/// Find `token` in `haystack` at the start of an item, ie. only preceded by whitespace since the start or a comma.
///
/// Occurrences within quoted strings are skipped.
fn find_token(haystack: &str, token: &str, followed_by: impl Fn(char) -> bool) -> Option<usize> {
    let quoted = quoted_spans(haystack);

    haystack.match_indices(token).map(|(i, _)| i).find(|&i| {
        let before = haystack[..i].trim_end().chars().next_back();
        let after = haystack[i + token.len()..].chars().next();

        !quoted.iter().any(|span| span.contains(&i)) && matches!(before, None | Some(',')) && after.map_or(true, &followed_by)
    })
}

/// Byte ranges of the double-quoted strings of `s`, quotes included, honoring backslash escapes.
///
/// An unterminated quoted string runs up to the end of `s`.
fn quoted_spans(s: &str) -> Vec<Range<usize>> {
    let mut spans = vec![];
    let mut open = None;
    let mut escaped = false;

    for (i, c) in s.char_indices() {
        match (open, c) {
            (Some(_), _) if escaped => escaped = false,
            (Some(_), '\\') => escaped = true,
            (Some(start), '"') => {
                spans.push(start..i + 1);
                open = None;
            }
            (None, '"') => open = Some(i),
            _ => {}
        }
    }

    if let Some(start) = open {
        spans.push(start..s.len());
    }

    spans
}
