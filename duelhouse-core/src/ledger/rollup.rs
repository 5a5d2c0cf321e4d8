use crate::error::{CoordinatorError, Result};
use async_trait::async_trait;
use uuid::Uuid;

/// Client for the execution rollup that will host the match. Starting a
/// session is requested once the countdown completes; the coordinator
/// retries with backoff and never rolls a session back on failure.
#[async_trait]
pub trait RollupClient: Send + Sync {
    async fn start_session(&self, session_id: Uuid) -> Result<()>;
}

/// JSON-over-HTTP rollup client.
pub struct HttpRollup {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRollup {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl RollupClient for HttpRollup {
    async fn start_session(&self, session_id: Uuid) -> Result<()> {
        let url = format!("{}/sessions/{}/start", self.base_url, session_id);
        let response = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(|e| CoordinatorError::rollup(format!("Failed to reach rollup: {}", e)))?;

        if !response.status().is_success() {
            return Err(CoordinatorError::rollup(format!(
                "Rollup returned {} for session {}",
                response.status(),
                session_id
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
pub struct MockRollup {
    started: parking_lot::Mutex<Vec<Uuid>>,
    fail_times: parking_lot::Mutex<u32>,
}

#[cfg(test)]
impl MockRollup {
    pub fn new() -> Self {
        Self {
            started: parking_lot::Mutex::new(Vec::new()),
            fail_times: parking_lot::Mutex::new(0),
        }
    }

    /// The next `n` start requests will fail.
    pub fn fail_next_starts(&self, n: u32) {
        *self.fail_times.lock() = n;
    }

    pub fn started_sessions(&self) -> Vec<Uuid> {
        self.started.lock().clone()
    }
}

#[cfg(test)]
#[async_trait]
impl RollupClient for MockRollup {
    async fn start_session(&self, session_id: Uuid) -> Result<()> {
        {
            let mut remaining = self.fail_times.lock();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(CoordinatorError::rollup("Scripted rollup failure"));
            }
        }
        self.started.lock().push(session_id);
        Ok(())
    }
}
