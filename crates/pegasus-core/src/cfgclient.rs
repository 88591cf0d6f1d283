//! Client for the external config-distribution server.
//!
//! The cfg server hands participants the master address and typed config
//! blobs; only the consuming side lives here.

use std::time::Duration;

use reqwest::Url;
use serde::de::DeserializeOwned;

const PING_BACKOFF_START: Duration = Duration::from_secs(1);
const PING_BACKOFF_CAP: Duration = Duration::from_secs(32);

pub struct CfgClient {
    http: reqwest::Client,
    base: Url,
}

impl CfgClient {
    pub fn new(http: reqwest::Client, base: Url) -> Self {
        Self { http, base }
    }

    /// Block until the cfg server answers `/cfg/ping` with `Pong`,
    /// backing off exponentially from 1s to 32s between attempts.
    pub async fn wait_up(&self) -> anyhow::Result<()> {
        let url = self.base.join("cfg/ping")?;
        let mut backoff = PING_BACKOFF_START;
        loop {
            match self.http.get(url.clone()).send().await {
                Ok(res) if res.status().is_success() => {
                    let body = res.text().await.unwrap_or_default();
                    if body.trim_matches('"') == "Pong" {
                        return Ok(());
                    }
                    tracing::warn!(%body, "unexpected cfg server ping response");
                }
                Ok(res) => {
                    tracing::warn!(status = %res.status(), "cfg server ping failed");
                }
                Err(err) => {
                    tracing::warn!(error = %err, "cfg server not reachable");
                }
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(PING_BACKOFF_CAP);
        }
    }

    /// The registered master address, or `None` when no master has
    /// registered yet.
    pub async fn fetch_master_addr(&self) -> anyhow::Result<Option<String>> {
        let url = self.base.join("cfg/master")?;
        let res = self.http.get(url).send().await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            anyhow::bail!("http {status}: {body}");
        }
        let addr = res.text().await?.trim_matches('"').to_string();
        Ok(if addr.is_empty() { None } else { Some(addr) })
    }

    pub async fn register_master_addr(&self, addr: &str) -> anyhow::Result<()> {
        let url = self.base.join("cfg/master")?;
        let res = self.http.post(url).body(addr.to_string()).send().await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            anyhow::bail!("http {status}: {body}");
        }
        Ok(())
    }

    /// Pull one typed config blob from `/cfg/<path>`.
    pub async fn pull_cfg<T: DeserializeOwned>(&self, path: &str) -> anyhow::Result<T> {
        let url = self.base.join(&format!("cfg/{path}"))?;
        let res = self.http.get(url).send().await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            anyhow::bail!("http {status}: {body}");
        }
        Ok(res.json().await?)
    }
}
