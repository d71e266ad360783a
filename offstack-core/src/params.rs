//! Header and query string normalization for invocation events

use http::HeaderMap;
use std::collections::HashMap;

/// Request headers in both the single-value and the multi-value shape
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeaderValues {
    /// Last value wins
    pub single: HashMap<String, String>,
    pub multi: HashMap<String, Vec<String>>,
}

impl HeaderValues {
    pub fn from_header_map(headers: &HeaderMap) -> Self {
        let mut values = Self::default();
        for (name, value) in headers {
            let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
            values.push(name.as_str(), value);
        }
        values
    }

    pub fn push(&mut self, name: &str, value: String) {
        self.single.insert(name.to_string(), value.clone());
        self.multi.entry(name.to_string()).or_default().push(value);
    }

    /// Values joined with `,` as HTTP API payload v2 expects
    pub fn joined(&self) -> HashMap<String, String> {
        self.multi
            .iter()
            .map(|(name, values)| (name.clone(), values.join(",")))
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.single
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Parsed query string; both maps are `None` when the query is empty
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryValues {
    pub single: Option<HashMap<String, String>>,
    pub multi: Option<HashMap<String, Vec<String>>>,
}

impl QueryValues {
    pub fn parse(raw: Option<&str>) -> Self {
        let raw = match raw {
            Some(raw) if !raw.is_empty() => raw,
            _ => return Self::default(),
        };

        let mut single = HashMap::new();
        let mut multi: HashMap<String, Vec<String>> = HashMap::new();
        for (key, value) in form_urlencoded::parse(raw.as_bytes()) {
            single.insert(key.to_string(), value.to_string());
            multi.entry(key.into_owned()).or_default().push(value.into_owned());
        }

        if single.is_empty() {
            return Self::default();
        }
        Self {
            single: Some(single),
            multi: Some(multi),
        }
    }

    /// Values joined with `,` as HTTP API payload v2 expects
    pub fn joined(&self) -> Option<HashMap<String, String>> {
        self.multi.as_ref().map(|multi| {
            multi
                .iter()
                .map(|(key, values)| (key.clone(), values.join(",")))
                .collect()
        })
    }
}

/// Cookies from every `Cookie` header, split on `;`
pub fn parse_cookies(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(http::header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .map(str::trim)
        .filter(|cookie| !cookie.is_empty())
        .map(ToString::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn test_header_values_last_wins() {
        let mut headers = HeaderMap::new();
        headers.append("x-multi", HeaderValue::from_static("a"));
        headers.append("x-multi", HeaderValue::from_static("b"));
        headers.insert("content-type", HeaderValue::from_static("application/json"));

        let values = HeaderValues::from_header_map(&headers);
        assert_eq!(values.single["x-multi"], "b");
        assert_eq!(values.multi["x-multi"], vec!["a", "b"]);
        assert_eq!(values.joined()["x-multi"], "a,b");
        assert_eq!(values.get("Content-Type"), Some("application/json"));
    }

    #[test]
    fn test_query_values() {
        let query = QueryValues::parse(Some("a=1&b=x%20y&a=2"));
        assert_eq!(query.single.as_ref().unwrap()["a"], "2");
        assert_eq!(query.single.as_ref().unwrap()["b"], "x y");
        assert_eq!(query.multi.as_ref().unwrap()["a"], vec!["1", "2"]);
        assert_eq!(query.joined().unwrap()["a"], "1,2");
    }

    #[test]
    fn test_empty_query_is_none() {
        assert_eq!(QueryValues::parse(None), QueryValues::default());
        assert_eq!(QueryValues::parse(Some("")), QueryValues::default());
    }

    #[test]
    fn test_parse_cookies() {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::COOKIE, HeaderValue::from_static("a=1; b=2"));
        assert_eq!(parse_cookies(&headers), vec!["a=1", "b=2"]);
    }
}
