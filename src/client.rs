//! Device characteristic channel.
//!
//! - [`DeviceChannel`] is the seam the engine reads, writes and subscribes through.
//! - [`HttpBridgeChannel`] talks to an already-paired local bridge exposing the
//!   HAP JSON resources (`/accessories`, `/characteristics`). It uses the
//!   blocking `ureq` agent, so every call is moved onto the blocking pool.
//! - The bridge has no event stream; `subscribe` reports `Unsupported` and the
//!   engine falls back to polling.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::models::homekit::{parse_accessories, Accessory, CharKey};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING-KEBAB-CASE")]
pub enum UpdateSource {
    Event,
    FastPoll,
    Polling,
}

impl UpdateSource {
    pub fn label(self) -> &'static str {
        match self {
            UpdateSource::Event => "EVENT",
            UpdateSource::FastPoll => "FAST-POLL",
            UpdateSource::Polling => "POLLING",
        }
    }
}

/// One characteristic update as delivered by a channel; any part may be missing.
#[derive(Debug, Clone, PartialEq)]
pub struct RawUpdate {
    pub aid: Option<u64>,
    pub iid: Option<u64>,
    pub value: Option<Value>,
    pub source: UpdateSource,
}

impl RawUpdate {
    pub fn new(key: CharKey, value: Value, source: UpdateSource) -> Self {
        RawUpdate {
            aid: Some(key.aid),
            iid: Some(key.iid),
            value: Some(value),
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("device channel unavailable")]
    Unavailable,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("http {status}: {message}")]
    Http { status: u16, message: String },
    #[error("json error: {0}")]
    Json(#[from] serde_path_to_error::Error<serde_json::Error>),
    #[error("write rejected for {key} (status {status})")]
    Rejected { key: CharKey, status: i64 },
    #[error("{0} is not supported by this channel")]
    Unsupported(&'static str),
    #[error("worker failed: {0}")]
    Worker(String),
}

#[async_trait]
pub trait DeviceChannel: Send + Sync {
    fn is_available(&self) -> bool;

    async fn accessories(&self) -> Result<Vec<Accessory>, ChannelError>;

    /// Read values; the result holds present entries only.
    async fn batch_read(&self, keys: &[CharKey]) -> Result<BTreeMap<CharKey, Value>, ChannelError>;

    async fn batch_write(&self, writes: &[(CharKey, Value)]) -> Result<(), ChannelError>;

    async fn subscribe(&self, keys: &[CharKey], sink: mpsc::UnboundedSender<RawUpdate>) -> Result<(), ChannelError>;
}

// =====================
// HAP JSON bridge
// =====================

#[derive(Debug, Deserialize)]
struct CharacteristicValues {
    characteristics: Vec<CharacteristicValue>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CharacteristicValue {
    aid: u64,
    iid: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    status: Option<i64>,
}

#[derive(Debug, Serialize)]
struct WriteRequest<'a> {
    characteristics: &'a [CharacteristicValue],
}

#[derive(Clone)]
pub struct HttpBridgeChannel {
    base_url: String,
    agent: ureq::Agent,
    available: Arc<AtomicBool>,
}

impl HttpBridgeChannel {
    pub fn new(base_url: &str) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(REQUEST_TIMEOUT))
            .build()
            .into();
        HttpBridgeChannel {
            base_url: base_url.trim_end_matches('/').to_string(),
            agent,
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn track<T>(&self, res: Result<T, ChannelError>) -> Result<T, ChannelError> {
        match &res {
            Ok(_) => self.available.store(true, Ordering::Relaxed),
            Err(ChannelError::Transport(_)) => self.available.store(false, Ordering::Relaxed),
            Err(_) => {}
        }
        res
    }

    fn get_text(&self, path: &str, query: &[(&str, String)]) -> Result<String, ChannelError> {
        let mut req = self.agent.get(&self.url(path)).header("Accept", "application/hap+json");
        for (k, v) in query {
            req = req.query(*k, v);
        }
        let res = req.call().map_err(map_ureq_error)?;
        res.into_body()
            .read_to_string()
            .map_err(|e| ChannelError::Transport(e.to_string()))
    }

    fn put_json<B: Serialize>(&self, path: &str, body: &B) -> Result<(u16, String), ChannelError> {
        let res = self
            .agent
            .put(&self.url(path))
            .header("Accept", "application/hap+json")
            .send_json(body)
            .map_err(map_ureq_error)?;
        let status = res.status().as_u16();
        let text = res
            .into_body()
            .read_to_string()
            .map_err(|e| ChannelError::Transport(e.to_string()))?;
        Ok((status, text))
    }

    fn read_blocking(&self, keys: &[CharKey]) -> Result<BTreeMap<CharKey, Value>, ChannelError> {
        let ids = keys.iter().map(CharKey::to_string).collect::<Vec<_>>().join(",");
        let body = self.get_text("characteristics", &[("id", ids)])?;
        let parsed: CharacteristicValues = parse_json(&body)?;
        Ok(parsed
            .characteristics
            .into_iter()
            .filter(|c| c.status.unwrap_or(0) == 0)
            .filter_map(|c| c.value.map(|v| (CharKey::new(c.aid, c.iid), v)))
            .collect())
    }

    fn write_blocking(&self, writes: &[(CharKey, Value)]) -> Result<(), ChannelError> {
        let characteristics: Vec<CharacteristicValue> = writes
            .iter()
            .map(|(k, v)| CharacteristicValue {
                aid: k.aid,
                iid: k.iid,
                value: Some(v.clone()),
                status: None,
            })
            .collect();
        let (status, body) = self.put_json(
            "characteristics",
            &WriteRequest {
                characteristics: &characteristics,
            },
        )?;

        // 207 Multi-Status carries a per-characteristic result
        if status == 207 {
            let parsed: CharacteristicValues = parse_json(&body)?;
            if let Some(bad) = parsed.characteristics.iter().find(|c| c.status.unwrap_or(0) != 0) {
                return Err(ChannelError::Rejected {
                    key: CharKey::new(bad.aid, bad.iid),
                    status: bad.status.unwrap_or_default(),
                });
            }
        }
        Ok(())
    }
}

fn map_ureq_error(e: ureq::Error) -> ChannelError {
    match e {
        ureq::Error::StatusCode(status) => ChannelError::Http {
            status,
            message: "bridge returned an error status".to_string(),
        },
        other => ChannelError::Transport(other.to_string()),
    }
}

fn parse_json<T: DeserializeOwned>(body: &str) -> Result<T, ChannelError> {
    let de = &mut serde_json::Deserializer::from_str(body);
    Ok(serde_path_to_error::deserialize(de)?)
}

async fn blocking<T, F>(f: F) -> Result<T, ChannelError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ChannelError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ChannelError::Worker(e.to_string()))?
}

#[async_trait]
impl DeviceChannel for HttpBridgeChannel {
    fn is_available(&self) -> bool {
        self.available.load(Ordering::Relaxed)
    }

    async fn accessories(&self) -> Result<Vec<Accessory>, ChannelError> {
        let this = self.clone();
        let res = blocking(move || {
            let body = this.get_text("accessories", &[])?;
            Ok(parse_accessories(&body)?)
        })
        .await;
        self.track(res)
    }

    async fn batch_read(&self, keys: &[CharKey]) -> Result<BTreeMap<CharKey, Value>, ChannelError> {
        if keys.is_empty() {
            return Ok(BTreeMap::new());
        }
        let this = self.clone();
        let keys = keys.to_vec();
        let res = blocking(move || this.read_blocking(&keys)).await;
        self.track(res)
    }

    async fn batch_write(&self, writes: &[(CharKey, Value)]) -> Result<(), ChannelError> {
        if writes.is_empty() {
            return Ok(());
        }
        let this = self.clone();
        let writes = writes.to_vec();
        let res = blocking(move || this.write_blocking(&writes)).await;
        self.track(res)
    }

    async fn subscribe(&self, _keys: &[CharKey], _sink: mpsc::UnboundedSender<RawUpdate>) -> Result<(), ChannelError> {
        Err(ChannelError::Unsupported("event subscription"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_sources_serialize_as_labels() {
        for source in [UpdateSource::Event, UpdateSource::FastPoll, UpdateSource::Polling] {
            assert_eq!(serde_json::to_value(source).unwrap(), Value::from(source.label()));
        }
        let parsed: UpdateSource = serde_json::from_str("\"FAST-POLL\"").unwrap();
        assert_eq!(parsed, UpdateSource::FastPoll);
    }

    #[test]
    fn read_response_keeps_only_present_values() {
        let body = r#"{"characteristics":[
            {"aid":1,"iid":10,"value":21.5},
            {"aid":1,"iid":11,"status":-70402},
            {"aid":2,"iid":10,"value":null}
        ]}"#;
        let parsed: CharacteristicValues = parse_json(body).unwrap();
        let present: Vec<_> = parsed
            .characteristics
            .into_iter()
            .filter(|c| c.status.unwrap_or(0) == 0)
            .filter_map(|c| c.value.map(|v| (CharKey::new(c.aid, c.iid), v)))
            .collect();
        // a null value deserializes as absent
        assert_eq!(present, vec![(CharKey::new(1, 10), Value::from(21.5))]);
    }

    #[test]
    fn malformed_read_response_names_the_path() {
        let err = parse_json::<CharacteristicValues>(r#"{"characteristics":[{"aid":"x","iid":1}]}"#).unwrap_err();
        assert!(err.to_string().contains("characteristics[0].aid"), "{}", err);
    }

    #[test]
    fn write_request_serializes_hap_shape() {
        let chars = [CharacteristicValue {
            aid: 3,
            iid: 12,
            value: Some(Value::from(21.0)),
            status: None,
        }];
        let body = serde_json::to_value(WriteRequest {
            characteristics: &chars,
        })
        .unwrap();
        assert_eq!(body, serde_json::json!({"characteristics":[{"aid":3,"iid":12,"value":21.0}]}));
    }

    #[test]
    fn base_url_is_normalised() {
        let ch = HttpBridgeChannel::new("http://127.0.0.1:4242/");
        assert_eq!(ch.url("/accessories"), "http://127.0.0.1:4242/accessories");
        assert!(ch.is_available());
    }
}
