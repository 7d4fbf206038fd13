//! nsqlookupd discovery: which nsqd instances carry a topic.

use std::time::Duration;

use reqwest::StatusCode;
use serde_json::Value;

use crate::messaging::errors::{MessagingError, MessagingResult};

const LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct LookupClient {
    http: reqwest::Client,
}

impl LookupClient {
    pub fn new() -> MessagingResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(LOOKUP_TIMEOUT)
            .build()
            .map_err(|e| MessagingError::connection(format!("lookup client: {e}")))?;
        Ok(Self { http })
    }

    /// `host:port` TCP addresses of every producer of `topic` known to `lookupd`
    pub async fn producers(&self, lookupd: &str, topic: &str) -> MessagingResult<Vec<String>> {
        let url = format!("{}/lookup", http_base(lookupd));
        let response = self
            .http
            .get(&url)
            .query(&[("topic", topic)])
            .send()
            .await
            .map_err(|e| MessagingError::lookup(lookupd, e.to_string()))?;

        // Topics nobody has published to yet are simply unknown
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            return Err(MessagingError::lookup(
                lookupd,
                format!("unexpected status {}", response.status()),
            ));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| MessagingError::lookup(lookupd, e.to_string()))?;
        Ok(parse_producers(&body))
    }
}

fn http_base(address: &str) -> String {
    let trimmed = address.trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    }
}

/// Accepts both the legacy `{"status_code", "data": {...}}` envelope and the flat one
pub fn parse_producers(body: &Value) -> Vec<String> {
    let producers = body
        .get("producers")
        .or_else(|| body.get("data").and_then(|d| d.get("producers")))
        .and_then(Value::as_array);

    let Some(producers) = producers else {
        return Vec::new();
    };

    let mut addresses: Vec<String> = producers
        .iter()
        .filter_map(|p| {
            let host = p
                .get("broadcast_address")
                .or_else(|| p.get("hostname"))
                .and_then(Value::as_str)?;
            let port = p.get("tcp_port").and_then(Value::as_u64)?;
            Some(format!("{host}:{port}"))
        })
        .collect();
    addresses.sort();
    addresses.dedup();
    addresses
}
