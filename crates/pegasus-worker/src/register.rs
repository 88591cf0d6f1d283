//! Registration with the master and the client used for everything the
//! worker posts back afterwards (heartbeats, status, reports).

use std::time::Duration;

use chrono::Utc;
use reqwest::Url;

use pegasus_core::{TaskReport, TaskStatus, WorkerRegForm};

const REGISTER_RETRY_DELAY: Duration = Duration::from_secs(5);

pub struct MasterClient {
    http: reqwest::Client,
    base: Url,
    key: String,
}

/// Two-step registration: fetch a key, then post the registration form.
/// The key fetch retries until the master answers; a verify failure is
/// fatal (the key would be lost otherwise).
pub async fn register(
    http: reqwest::Client,
    master: Url,
    form: &WorkerRegForm,
) -> anyhow::Result<MasterClient> {
    let reg_url = master.join("worker")?;
    let key = loop {
        match http.get(reg_url.clone()).send().await {
            Ok(res) if res.status().is_success() => {
                let body = res.text().await.unwrap_or_default();
                let key = body.trim().trim_matches('"').to_string();
                if !key.is_empty() {
                    break key;
                }
                tracing::warn!("empty worker key from master");
            }
            Ok(res) => {
                tracing::warn!(status = %res.status(), "fail to register on master");
            }
            Err(err) => {
                tracing::warn!(error = %err, "fail to register on master");
            }
        }
        tokio::time::sleep(REGISTER_RETRY_DELAY).await;
    };
    tracing::info!(%key, "got worker key");

    let mut verify_url = master.join("worker")?;
    verify_url.query_pairs_mut().append_pair("key", &key);
    let res = http.post(verify_url).json(form).send().await?;
    if !res.status().is_success() {
        let status = res.status();
        let body = res.text().await.unwrap_or_default();
        anyhow::bail!("fail to verify on master, http {status}: {body}");
    }
    tracing::info!(addr = %form.addr(), "registered on master");

    Ok(MasterClient {
        http,
        base: master,
        key,
    })
}

impl MasterClient {
    pub fn key(&self) -> &str {
        &self.key
    }

    fn keyed_url(&self, path: &str) -> anyhow::Result<Url> {
        let mut url = self.base.join(path)?;
        url.query_pairs_mut().append_pair("key", &self.key);
        Ok(url)
    }

    /// Heartbeat period advertised by the master (JSON nanoseconds).
    pub async fn hb_interval(&self) -> anyhow::Result<Duration> {
        let url = self.base.join("worker/heartbeat/interval")?;
        let res = self.http.get(url).send().await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            anyhow::bail!("http {status}: {body}");
        }
        let nanos: u64 = res.json().await?;
        Ok(Duration::from_nanos(nanos))
    }

    pub async fn post_heartbeat(&self) -> anyhow::Result<()> {
        let url = self.keyed_url("worker/heartbeat")?;
        let res = self.http.post(url).json(&Utc::now()).send().await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            anyhow::bail!("http {status}: {body}");
        }
        Ok(())
    }

    pub async fn post_status(&self, status: &TaskStatus) -> anyhow::Result<()> {
        let url = self.keyed_url("worker/task/status")?;
        let res = self.http.post(url).json(status).send().await?;
        if !res.status().is_success() {
            let code = res.status();
            let body = res.text().await.unwrap_or_default();
            anyhow::bail!("http {code}: {body}");
        }
        Ok(())
    }

    /// Post a task report. `Ok(false)` means the master rejected it
    /// outright (retrying would be useless); errors are network failures.
    pub async fn post_report(&self, report: &TaskReport) -> anyhow::Result<bool> {
        let url = self.keyed_url("worker/task/report")?;
        let res = self.http.post(url).json(report).send().await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            tracing::warn!(tid = %report.tid, %status, %body, "task report rejected");
            return Ok(false);
        }
        Ok(true)
    }
}
