//! Inbound request as the gateway pipeline sees it

use base64::{engine::general_purpose, Engine};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::{header, HeaderMap, Method};
use offstack_core::params::{HeaderValues, QueryValues};
use serde_json::Value;

const JSON_CONTENT_TYPES: [&str; 2] = ["application/json", "application/vnd.api+json"];

/// Body as it goes into a proxy event
#[derive(Debug, Clone, PartialEq)]
pub struct EventBody {
    pub body: Value,
    pub is_base64_encoded: bool,
}

#[derive(Debug, Clone)]
pub struct GatewayRequest {
    pub method: Method,
    /// Path as received, still percent-encoded
    pub path: String,
    pub raw_query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub source_ip: String,
    pub received_at: DateTime<Utc>,
}

impl GatewayRequest {
    pub fn header_values(&self) -> HeaderValues {
        HeaderValues::from_header_map(&self.headers)
    }

    pub fn query(&self) -> QueryValues {
        QueryValues::parse(self.raw_query.as_deref())
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    pub fn user_agent(&self) -> &str {
        self.header(header::USER_AGENT.as_str()).unwrap_or_default()
    }

    /// Media type without parameters, lower case; JSON when absent
    pub fn content_type(&self) -> String {
        self.header(header::CONTENT_TYPE.as_str())
            .and_then(|value| value.split(';').next())
            .map(|value| value.trim().to_lowercase())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| "application/json".to_string())
    }

    fn is_json(&self) -> bool {
        let content_type = self.content_type();
        JSON_CONTENT_TYPES.contains(&content_type.as_str()) || content_type.ends_with("+json")
    }

    /// Binary bodies are multipart uploads or anything that is not UTF-8
    pub fn is_binary(&self) -> bool {
        self.content_type().starts_with("multipart/form-data") || std::str::from_utf8(&self.body).is_err()
    }

    /// Body for template and schema processing: parsed JSON when the content
    /// type is JSON-like and the body is longer than one byte, else the text
    pub fn payload(&self) -> Value {
        let text = String::from_utf8_lossy(&self.body);
        if self.is_json() && self.body.len() > 1 {
            if let Ok(parsed) = serde_json::from_str(&text) {
                return parsed;
            }
        }
        if self.body.is_empty() {
            return Value::Null;
        }
        Value::String(text.into_owned())
    }

    /// Body for proxy events: the raw text, base64 when binary, null when empty
    pub fn event_body(&self) -> EventBody {
        if self.body.is_empty() {
            return EventBody {
                body: Value::Null,
                is_base64_encoded: false,
            };
        }
        if self.is_binary() {
            return EventBody {
                body: Value::String(general_purpose::STANDARD.encode(&self.body)),
                is_base64_encoded: true,
            };
        }
        EventBody {
            body: Value::String(String::from_utf8_lossy(&self.body).into_owned()),
            is_base64_encoded: false,
        }
    }

    /// Path with the stage prefix removed
    pub fn path_without_stage(&self, stage: Option<&str>) -> String {
        match stage {
            Some(stage) => {
                let prefix = format!("/{stage}");
                match self.path.strip_prefix(&prefix) {
                    Some("") => "/".to_string(),
                    Some(rest) if rest.starts_with('/') => rest.to_string(),
                    _ => self.path.clone(),
                }
            }
            None => self.path.clone(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use http::HeaderValue;
    use serde_json::json;

    pub(crate) fn request(method: Method, uri_path: &str, body: &str) -> GatewayRequest {
        let (path, query) = match uri_path.split_once('?') {
            Some((path, query)) => (path.to_string(), Some(query.to_string())),
            None => (uri_path.to_string(), None),
        };
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("localhost:3000"));
        GatewayRequest {
            method,
            path,
            raw_query: query,
            headers,
            body: Bytes::from(body.to_string()),
            source_ip: "127.0.0.1".to_string(),
            received_at: Utc::now(),
        }
    }

    #[test]
    fn test_json_payload_is_parsed() {
        let mut req = request(Method::POST, "/dev/x", r#"{"a":1}"#);
        req.headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json; charset=utf-8"));
        assert_eq!(req.payload(), json!({"a": 1}));
        assert_eq!(req.event_body().body, json!(r#"{"a":1}"#));
    }

    #[test]
    fn test_text_payload_stays_text() {
        let mut req = request(Method::POST, "/dev/x", "{\"a\":1}");
        req.headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        assert_eq!(req.payload(), json!("{\"a\":1}"));

        let short = request(Method::POST, "/dev/x", "1");
        assert_eq!(short.payload(), json!("1"));
    }

    #[test]
    fn test_binary_body_is_base64() {
        let mut req = request(Method::POST, "/dev/upload", "");
        req.headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("multipart/form-data; boundary=x"));
        req.body = Bytes::from_static(&[0xff, 0x00, 0x10]);
        let body = req.event_body();
        assert!(body.is_base64_encoded);
        assert_eq!(body.body, json!("/wAQ"));
    }

    #[test]
    fn test_empty_body_is_null() {
        let req = request(Method::GET, "/dev/x", "");
        assert_eq!(req.event_body().body, Value::Null);
        assert_eq!(req.payload(), Value::Null);
    }

    #[test]
    fn test_path_without_stage() {
        let req = request(Method::GET, "/dev/users/1", "");
        assert_eq!(req.path_without_stage(Some("dev")), "/users/1");
        assert_eq!(req.path_without_stage(None), "/dev/users/1");
        let root = request(Method::GET, "/dev", "");
        assert_eq!(root.path_without_stage(Some("dev")), "/");
        let other = request(Method::GET, "/development/x", "");
        assert_eq!(other.path_without_stage(Some("dev")), "/development/x");
    }
}
