//! Klines-style REST candle source.
//!
//! Performs one blocking `GET {base}/klines?symbol=&interval=&startTime=&limit=`
//! per page. The response is an array of arrays whose first six entries are
//! `[open_time_ms, open, high, low, close, volume]`; prices may be JSON strings
//! or numbers.

use super::source::{CandleSource, SourceError};
use crate::domain::{RawCandle, Timeframe};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

/// Error body returned alongside 4xx statuses.
#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    msg: String,
}

/// Blocking HTTP candle source.
pub struct HttpCandleSource {
    client: reqwest::blocking::Client,
    base_url: String,
    name: String,
}

impl HttpCandleSource {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, SourceError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("intralab/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SourceError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            name: "http".into(),
        })
    }

    /// Override the provenance name reported by [`CandleSource::name`].
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    fn klines_url(&self, symbol: &str, timeframe: Timeframe, since: DateTime<Utc>, limit: usize) -> String {
        format!(
            "{}/klines?symbol={}&interval={}&startTime={}&limit={}",
            self.base_url,
            symbol.replace('/', ""),
            timeframe.as_str(),
            since.timestamp_millis(),
            limit
        )
    }
}

impl CandleSource for HttpCandleSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn fetch_page(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<RawCandle>, SourceError> {
        let url = self.klines_url(symbol, timeframe, since, limit);

        let resp = self
            .client
            .get(&url)
            .send()
            .map_err(|e| SourceError::Network(e.to_string()))?;
        let status = resp.status();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.as_u16() == 418 {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(60);
            return Err(SourceError::RateLimited {
                retry_after_secs: retry_after,
            });
        }

        let body = resp
            .text()
            .map_err(|e| SourceError::Network(format!("failed to read body: {e}")))?;

        if !status.is_success() {
            return Err(classify_error_body(symbol, status.as_u16(), &body));
        }

        parse_klines(&body)
    }
}

fn classify_error_body(symbol: &str, status: u16, body: &str) -> SourceError {
    match serde_json::from_str::<ApiError>(body) {
        Ok(err) if err.msg.to_ascii_lowercase().contains("invalid symbol") => {
            SourceError::NotFound {
                symbol: symbol.to_string(),
            }
        }
        Ok(err) => SourceError::Http {
            status,
            message: format!("{} ({})", err.msg, err.code),
        },
        Err(_) => SourceError::Http {
            status,
            message: body.chars().take(200).collect(),
        },
    }
}

/// Parse a klines response body into raw candles.
pub fn parse_klines(body: &str) -> Result<Vec<RawCandle>, SourceError> {
    let rows: Vec<Vec<Value>> = serde_json::from_str(body)
        .map_err(|e| SourceError::Format(format!("expected an array of klines: {e}")))?;

    rows.iter()
        .enumerate()
        .map(|(i, row)| parse_row(i, row))
        .collect()
}

fn parse_row(i: usize, row: &[Value]) -> Result<RawCandle, SourceError> {
    if row.len() < 6 {
        return Err(SourceError::Format(format!(
            "kline {i} has {} fields, expected at least 6",
            row.len()
        )));
    }
    let open_ms = row[0]
        .as_i64()
        .ok_or_else(|| SourceError::Format(format!("kline {i}: open time is not an integer")))?;
    let timestamp = DateTime::from_timestamp_millis(open_ms)
        .ok_or_else(|| SourceError::Format(format!("kline {i}: open time out of range")))?;

    Ok(RawCandle {
        timestamp,
        open: number(&row[1], i, "open")?,
        high: number(&row[2], i, "high")?,
        low: number(&row[3], i, "low")?,
        close: number(&row[4], i, "close")?,
        volume: number(&row[5], i, "volume")?,
    })
}

fn number(value: &Value, i: usize, field: &str) -> Result<f64, SourceError> {
    match value {
        Value::String(s) => s.parse::<f64>().ok(),
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
    .ok_or_else(|| SourceError::Format(format!("kline {i}: {field} is not numeric")))
}
