use anyhow::Context;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};

pub mod change;
pub mod config;
pub mod constraints;
pub mod consumer;
pub mod orchestrator;
pub mod runner;
pub mod scheduler;
pub mod table;
pub mod telemetry;
pub mod topology;

#[cfg(test)]
pub mod test_support;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const AGENT_VERSION_HEADER: &str = "x-agent-version";

/// HTTP client shared by the orchestrator API and the webhook consumer.
pub fn build_client(cfg: &config::AppConfig) -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .default_headers(build_agent_headers()?)
        .timeout(cfg.http_timeout())
        .build()
        .context("failed to build http client")
}

fn build_agent_headers() -> anyhow::Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(
        USER_AGENT,
        HeaderValue::from_str(&format!("dockate-agent/{VERSION}"))
            .context("invalid user agent header value")?,
    );
    headers.insert(
        AGENT_VERSION_HEADER,
        HeaderValue::from_str(VERSION).context("invalid agent version header value")?,
    );
    Ok(headers)
}
