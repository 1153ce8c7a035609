use crate::error::StageError;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque record body. The engine only clones and moves payloads around.
pub type Payload = serde_json::Value;

pub type StageName = String;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub key: String,
    pub value: Bytes,
}

impl Header {
    pub fn new(key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn text(key: impl Into<String>, value: &str) -> Self {
        Self::new(key, Bytes::copy_from_slice(value.as_bytes()))
    }

    pub fn value_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.value).ok()
    }
}

/// Ordered multimap of message headers. Duplicate keys are allowed and keep
/// their insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(Vec<Header>);

impl Headers {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, header: Header) {
        self.0.push(header);
    }

    pub fn with(mut self, key: impl Into<String>, value: &str) -> Self {
        self.push(Header::text(key, value));
        self
    }

    /// First value stored under `key`.
    pub fn get(&self, key: &str) -> Option<&Header> {
        self.0.iter().find(|h| h.key == key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Header::value_str)
    }

    pub fn get_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a Header> + 'a {
        self.0.iter().filter(move |h| h.key == key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Header> {
        self.0.iter()
    }

    /// Merge `other` over `self`: keys present in `other` replace every
    /// existing value under that key, new keys are appended in order.
    pub fn merge_over(&mut self, other: Headers) {
        if other.is_empty() {
            return;
        }
        self.0.retain(|h| other.get(&h.key).is_none());
        self.0.extend(other.0);
    }
}

impl From<Vec<Header>> for Headers {
    fn from(headers: Vec<Header>) -> Self {
        Self(headers)
    }
}

impl FromIterator<Header> for Headers {
    fn from_iter<I: IntoIterator<Item = Header>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<Bytes>,
    pub payload: Payload,
    #[serde(default)]
    pub headers: Headers,
}

impl Message {
    pub fn new(payload: Payload) -> Self {
        Self {
            key: None,
            payload,
            headers: Headers::new(),
        }
    }

    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    /// Successor message: new payload, key and headers copied forward.
    pub fn derive(&self, payload: Payload) -> Self {
        Self {
            key: self.key.clone(),
            payload,
            headers: self.headers.clone(),
        }
    }
}

/// Dead-letter entry: the original message as it entered the failing stage,
/// the stage that failed and why.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorRecord {
    pub stage: StageName,
    pub message: Message,
    pub cause: StageError,
    pub failed_at: chrono::DateTime<chrono::Utc>,
}

impl ErrorRecord {
    pub fn new(stage: impl Into<StageName>, message: Message, cause: StageError) -> Self {
        Self {
            stage: stage.into(),
            message,
            cause,
            failed_at: chrono::Utc::now(),
        }
    }

    pub fn payload(&self) -> &Payload {
        &self.message.payload
    }
}

impl fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.stage, self.message.payload, self.cause)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_over_replaces_and_appends() {
        let mut headers = Headers::new()
            .with("source", "crm")
            .with("trace", "a")
            .with("trace", "b");

        headers.merge_over(Headers::new().with("trace", "c").with("score", "0.9"));

        let keys: Vec<_> = headers.iter().map(|h| h.key.as_str()).collect();
        assert_eq!(keys, vec!["source", "trace", "score"]);
        assert_eq!(headers.get_str("trace"), Some("c"));
        assert_eq!(headers.get_all("trace").count(), 1);
    }

    #[test]
    fn test_derive_copies_key_and_headers() {
        let original = Message::new(json!({"id": 1}))
            .with_key("k-1")
            .with_headers(Headers::new().with("tenant", "acme"));

        let next = original.derive(json!({"id": 1, "enriched": true}));
        assert_eq!(next.key, original.key);
        assert_eq!(next.headers, original.headers);
        assert_eq!(next.payload["enriched"], true);
    }

    #[test]
    fn test_error_record_json_shape() {
        let record = ErrorRecord::new(
            "validate",
            Message::new(json!("T2")).with_headers(Headers::new().with("h", "v")),
            StageError::failed("rejected"),
        );
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["stage"], "validate");
        assert_eq!(value["message"]["payload"], "T2");
        assert_eq!(value["cause"]["kind"], "failed");
        assert!(value["failed_at"].is_string());
    }
}
