//! A small crate providing authenticated fetching and bounded task running.
//!
//! It is made of two independent parts:
//! - [`fetch`]: resolving a URL with HTTP Basic authentication credentials scoped by realm and URL prefix ([`auth`]),
//!   performing a single GET and returning the decoded body or a flat [`FetchError`](fetch::FetchError) carrying a reason,
//! - [`task`]: distributing a batch of tasks across a fixed number of workers sharing a single queue, waiting for all of
//!   them to complete and collecting every failure instead of stopping at the first one.
//!
//! Credentials without a realm belong to the default realm: they are sent preemptively to any URL of their scope and
//! answer challenges for any realm. Credentials bound to a realm are only sent once the server challenged for it, eg.
//!
//! ```text
//!     GET / HTTP/1.1                                      -> without credentials
//!     HTTP/1.1 401 Unauthorized
//!     WWW-Authenticate: Basic realm="Admin Area"
//!     GET / HTTP/1.1                                      -> once more, with credentials for "Admin Area"
//!     Authorization: Basic YWRtaW46YWRtaW4=
//!     HTTP/1.1 200 OK
//! ```
//!
//! At most a single challenge is answered per fetch, and nothing is retried otherwise.
//!
//! Neither part prints anything: this is left to the caller, see the `fetchpool` binary.

pub mod auth;
pub mod config;
pub mod fetch;
pub mod task;
