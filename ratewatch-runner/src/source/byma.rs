//! BYMA open-data source.
//!
//! Fetches the public cauciones endpoint, a JSON array of rows shaped like
//! `{"plazo": 1, "tna": 38.5, "fecha": "2026-01-21 11:00:00", ...}`. For
//! each tenor the row with matching `plazo`, a non-null `tna` and the latest
//! `fecha` wins. Rows that do not look like that are ignored, since the
//! endpoint is undocumented and has changed shape before.

use serde_json::Value;
use std::time::Duration;

use ratewatch_core::domain::{Rate, Tenor};

use super::{FetchError, Quotes, RateSource};
use crate::config::MAX_FETCH_RETRIES;

pub struct BymaSource {
    client: reqwest::blocking::Client,
    url: String,
    max_retries: u32,
    base_delay: Duration,
}

impl BymaSource {
    pub fn new(url: &str, timeout_secs: u64, max_retries: u32) -> Result<Self, FetchError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .user_agent("Mozilla/5.0")
            .build()
            .map_err(|e| FetchError::Other(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            url: url.to_string(),
            max_retries: max_retries.min(MAX_FETCH_RETRIES),
            base_delay: Duration::from_millis(500),
        })
    }

    /// GET the endpoint, retrying connection failures, timeouts and 5xx with
    /// exponential backoff.
    fn fetch_with_retry(&self) -> Result<Value, FetchError> {
        let mut last_error = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = self.base_delay * 2u32.pow(attempt - 1);
                std::thread::sleep(delay);
            }

            match self
                .client
                .get(&self.url)
                .header(reqwest::header::ACCEPT, "application/json")
                .send()
            {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                        log::debug!("BYMA attempt {} returned HTTP {status}", attempt + 1);
                        last_error = Some(FetchError::Http {
                            status: status.as_u16(),
                            url: self.url.clone(),
                        });
                        continue;
                    }
                    if !status.is_success() {
                        return Err(FetchError::Http {
                            status: status.as_u16(),
                            url: self.url.clone(),
                        });
                    }
                    return resp.json::<Value>().map_err(|e| {
                        FetchError::ResponseFormatChanged(format!("response is not JSON: {e}"))
                    });
                }
                Err(e) => {
                    if e.is_connect() || e.is_timeout() {
                        log::debug!("BYMA attempt {} failed: {e}", attempt + 1);
                        last_error = Some(FetchError::NetworkUnreachable(e.to_string()));
                        continue;
                    }
                    return Err(FetchError::NetworkUnreachable(e.to_string()));
                }
            }
        }

        Err(last_error.unwrap_or_else(|| FetchError::Other("max retries exceeded".into())))
    }
}

impl RateSource for BymaSource {
    fn name(&self) -> &str {
        "BYMA"
    }

    fn fetch(&self, tenors: &[Tenor]) -> Result<Quotes, FetchError> {
        let body = self.fetch_with_retry()?;
        let rows = rows_of(&body)?;
        Ok(tenors
            .iter()
            .map(|t| (*t, parse_latest(rows, *t)))
            .collect())
    }
}

/// The row array: either the body itself or its `data` field.
fn rows_of(body: &Value) -> Result<&[Value], FetchError> {
    match body {
        Value::Array(rows) => Ok(rows.as_slice()),
        Value::Object(map) => match map.get("data") {
            Some(Value::Array(rows)) => Ok(rows.as_slice()),
            _ => Err(FetchError::ResponseFormatChanged(
                "expected an array or an object with a 'data' array".into(),
            )),
        },
        _ => Err(FetchError::ResponseFormatChanged(
            "expected an array of rows".into(),
        )),
    }
}

/// Latest `tna` for `tenor`, or `None` if no row quotes it.
pub fn parse_latest(rows: &[Value], tenor: Tenor) -> Option<Rate> {
    rows.iter()
        .filter(|row| plazo_of(row) == Some(u64::from(tenor.days())))
        .filter_map(|row| {
            let tna = number_of(row.get("tna")?)?;
            let fecha = row.get("fecha").and_then(Value::as_str).unwrap_or("");
            Some((fecha, tna))
        })
        .filter(|(_, tna)| tna.is_finite() && *tna >= 0.0)
        .max_by(|a, b| a.0.cmp(b.0))
        .map(|(_, tna)| tna)
}

fn plazo_of(row: &Value) -> Option<u64> {
    match row.get("plazo")? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn number_of(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().replace(',', ".").parse().ok(),
        _ => None,
    }
}
