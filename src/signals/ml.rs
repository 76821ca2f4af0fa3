use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::SignalError;
use crate::models::Decision;
use crate::signals::{MarketData, MlSignal, SignalProvider};

const REQUEST_FILE: &str = "request.json";
const RESPONSE_FILE: &str = "response.json";
const POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Serialize, Deserialize)]
struct MlRequest {
    id: u64,
    symbol: String,
    time: chrono::DateTime<chrono::Utc>,
    close: f64,
    atr: f64,
}

#[derive(Debug, Deserialize)]
struct MlResponse {
    id: u64,
    signal: Decision,
    probability: f64,
    confidence: f64,
}

/// Talks to an out-of-process model through two files in a shared directory:
/// a request is written, then the provider polls for a response carrying the
/// same id. The caller bounds the wait (see [`crate::signals::poll`]).
pub struct FileMlProvider {
    dir: PathBuf,
    atr_period: usize,
    next_id: u64,
}

impl FileMlProvider {
    pub fn new(dir: impl Into<PathBuf>, atr_period: usize) -> Self {
        Self {
            dir: dir.into(),
            atr_period,
            next_id: 1,
        }
    }

    pub fn request_path(&self) -> PathBuf {
        self.dir.join(REQUEST_FILE)
    }

    pub fn response_path(&self) -> PathBuf {
        self.dir.join(RESPONSE_FILE)
    }

    async fn read_response(&self, id: u64) -> Result<Option<MlSignal>, SignalError> {
        let path = self.response_path();
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        // Writer may be mid-flush; try again next tick.
        let resp: MlResponse = match serde_json::from_str(&raw) {
            Ok(r) => r,
            Err(e) if e.is_eof() => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if resp.id != id {
            debug!("Ignoring stale ML response {} (waiting for {})", resp.id, id);
            return Ok(None);
        }
        if let Err(e) = tokio::fs::remove_file(&path).await {
            warn!("Could not remove consumed ML response: {}", e);
        }
        Ok(Some(
            MlSignal {
                signal: resp.signal,
                probability: resp.probability,
                confidence: resp.confidence,
            }
            .clamped(),
        ))
    }
}

#[async_trait]
impl SignalProvider for FileMlProvider {
    type Output = MlSignal;

    fn name(&self) -> &'static str {
        "ml_file_channel"
    }

    async fn request(&mut self, data: &MarketData) -> Result<MlSignal, SignalError> {
        let id = self.next_id;
        self.next_id += 1;

        let req = MlRequest {
            id,
            symbol: data.symbol.clone(),
            time: data.now,
            close: data.candles.last().map_or(data.quote.mid(), |c| c.close),
            atr: data.candles.atr(self.atr_period),
        };
        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(self.request_path(), serde_json::to_vec(&req)?).await?;

        loop {
            if let Some(signal) = self.read_response(id).await? {
                return Ok(signal);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}
