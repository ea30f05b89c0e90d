//! Prediction over HTTP: `POST /predict` with a JSON array of `{x1..x10}`.

use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::StatusCode;
use tracing::debug;

use crate::common::config::PredictCfg;
use crate::common::error::{PersonaError, Result};
use crate::data::domain::FeatureVector;

use super::domain::{FeatureRow, PredictResponse, Predictor};

const SERVICE: &str = "prediction service";

pub struct HttpPredictor {
    client: Client,
    url: String,
}

impl HttpPredictor {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| PersonaError::external(SERVICE, err))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn from_cfg(cfg: &PredictCfg) -> Result<Self> {
        Self::new(cfg.url.clone(), Duration::from_secs(cfg.timeout_secs))
    }
}

impl Predictor for HttpPredictor {
    fn predict(&self, rows: &[FeatureVector]) -> Result<Vec<i64>> {
        let body: Vec<FeatureRow> = rows.iter().map(FeatureRow::from).collect();
        debug!(url = %self.url, rows = body.len(), "posting prediction batch");
        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .map_err(|err| PersonaError::external(SERVICE, err))?;

        let status = response.status();
        if status != StatusCode::OK {
            let text = response.text().unwrap_or_default();
            return Err(PersonaError::external(
                SERVICE,
                format!("{} returned {status}: {text}", self.url),
            ));
        }
        let parsed: PredictResponse = response
            .json()
            .map_err(|err| PersonaError::external(SERVICE, format!("malformed response: {err}")))?;
        Ok(parsed.labels)
    }
}
