//! Command-line and environment configuration.

use std::num::NonZeroUsize;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::auth::{AuthContext, Credential};
use crate::fetch::{Client, FetchError, Fetcher};

pub const DEFAULT_URL: &str = "https://ssr3.scrape.center";

#[derive(Debug, Parser)]
#[command(name = "fetchpool", version, about = "Authenticated HTTP fetching and bounded parallel task running")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Fetch a page protected by HTTP Basic authentication and print its body.
    Fetch(FetchArgs),
    /// Print a range of integers from a bounded pool of workers.
    Run(RunArgs),
}

#[derive(Debug, Clone, Args)]
pub struct FetchArgs {
    /// URL to fetch.
    #[arg(default_value = DEFAULT_URL)]
    pub url: String,

    #[arg(long, env = "FETCHPOOL_USERNAME", default_value = "admin")]
    pub username: String,

    #[arg(long, env = "FETCHPOOL_PASSWORD", default_value = "admin", hide_env_values = true)]
    pub password: String,

    /// Only answer challenges for this realm (any realm when omitted).
    #[arg(long)]
    pub realm: Option<String>,

    /// URL prefix the credentials apply to (the fetched URL when omitted).
    #[arg(long)]
    pub scope: Option<String>,

    /// Request timeout in seconds, `0` to disable.
    #[arg(long, default_value_t = 30)]
    pub timeout_secs: u64,
}

impl FetchArgs {
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }

    pub fn credential(&self) -> Result<Credential, FetchError> {
        let scope = self.scope.as_deref().unwrap_or(&self.url);
        let credential = Credential::new(scope, &self.username, &self.password)?;

        Ok(match &self.realm {
            Some(realm) => credential.with_realm(realm),
            None => credential,
        })
    }

    pub fn fetcher(&self) -> Result<Fetcher, FetchError> {
        let mut builder = Client::builder();

        if let Some(timeout) = self.timeout() {
            builder = builder.timeout(timeout);
        }

        let auth = AuthContext::from_iter([self.credential()?]);

        Ok(Fetcher::new(auth).with_client(builder.build()?))
    }
}

#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    /// Number of concurrent workers.
    #[arg(long, short, default_value = "8")]
    pub workers: NonZeroUsize,

    /// Number of integers to print, starting from 0.
    #[arg(long, short = 'n', default_value_t = 100)]
    pub count: u32,
}
