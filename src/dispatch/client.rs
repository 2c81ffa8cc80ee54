//! Outbound HTTP client policy.
//!
//! One shared client for webhooks, GitHub dispatches and Slack posts:
//! 10-second connect+read timeout, no redirect following (GitHub auth
//! redirects must not leak the bearer token), TLS verification on.

use crate::error::Result;
use anyhow::Context as _;
use std::time::Duration;

/// Default total timeout for every outbound call.
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Build the shared outbound client.
pub fn build_http_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .redirect(reqwest::redirect::Policy::none())
        .user_agent(concat!("crondeck/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("failed to build outbound HTTP client")
        .map_err(Into::into)
}
