//! Request serializer - builds requests from a method, URL and parameters

use crate::error::SessionError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use netsession_types::{HttpMethod, Request};
use serde_json::Value;
use std::collections::BTreeMap;
use url::Url;

/// How parameters are encoded into a request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ParameterEncoding {
    /// Query string for GET/HEAD/DELETE, `application/x-www-form-urlencoded` body otherwise
    #[default]
    Form,
    /// JSON body for methods that carry one
    Json,
}

#[derive(Debug, Clone)]
pub struct RequestSerializer {
    encoding: ParameterEncoding,
    headers: BTreeMap<String, String>,
    timeout_secs: Option<u64>,
}

impl Default for RequestSerializer {
    fn default() -> Self {
        let mut headers = BTreeMap::new();
        headers.insert("Accept-Language".to_string(), "en;q=1".to_string());
        Self {
            encoding: ParameterEncoding::Form,
            headers,
            timeout_secs: None,
        }
    }
}

impl RequestSerializer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn json() -> Self {
        Self::default().with_encoding(ParameterEncoding::Json)
    }

    pub fn with_encoding(mut self, encoding: ParameterEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn encoding(&self) -> ParameterEncoding {
        self.encoding
    }

    /// Default header applied to every request; `None` removes it
    pub fn set_header(&mut self, name: &str, value: Option<&str>) {
        self.headers.retain(|k, _| !k.eq_ignore_ascii_case(name));
        if let Some(value) = value {
            self.headers.insert(name.to_string(), value.to_string());
        }
    }

    pub fn set_basic_authorization(&mut self, user: &str, password: &str) {
        let token = STANDARD.encode(format!("{}:{}", user, password));
        self.set_header("Authorization", Some(&format!("Basic {}", token)));
    }

    pub fn clear_authorization(&mut self) {
        self.set_header("Authorization", None);
    }

    pub fn set_timeout_secs(&mut self, timeout: Option<u64>) {
        self.timeout_secs = timeout;
    }

    /// Build a request for `url` with `parameters` encoded per the configured encoding
    pub fn request(
        &self,
        method: HttpMethod,
        url: Url,
        parameters: Option<&Value>,
    ) -> Result<Request, SessionError> {
        let mut request = Request::new(method, url);
        for (name, value) in &self.headers {
            request.set_header(name.as_str(), value.as_str());
        }
        request.timeout_secs = self.timeout_secs;

        let Some(parameters) = parameters.filter(|p| !p.is_null()) else {
            return Ok(request);
        };

        if method.encodes_parameters_in_uri() {
            let query = query_string(parameters);
            if !query.is_empty() {
                let merged = match request.url.query() {
                    Some(existing) if !existing.is_empty() => format!("{}&{}", existing, query),
                    _ => query,
                };
                request.url.set_query(Some(&merged));
            }
            return Ok(request);
        }

        match self.encoding {
            ParameterEncoding::Form => {
                if request.header("content-type").is_none() {
                    request.set_header("Content-Type", "application/x-www-form-urlencoded");
                }
                request.body = Some(query_string(parameters).into_bytes());
            }
            ParameterEncoding::Json => {
                if request.header("content-type").is_none() {
                    request.set_header("Content-Type", "application/json");
                }
                let body = serde_json::to_vec(parameters)
                    .map_err(|e| SessionError::InvalidRequest(e.to_string()))?;
                request.body = Some(body);
            }
        }
        Ok(request)
    }
}

/// Percent-encoded query string with sorted keys
///
/// Nested objects flatten to `key[sub]=value`, arrays to `key[]=value`.
pub fn query_string(parameters: &Value) -> String {
    let mut pairs = Vec::new();
    collect_pairs(None, parameters, &mut pairs);
    pairs
        .into_iter()
        .map(|(key, value)| match value {
            Some(value) => format!("{}={}", urlencoding::encode(&key), urlencoding::encode(&value)),
            None => urlencoding::encode(&key).into_owned(),
        })
        .collect::<Vec<_>>()
        .join("&")
}

fn collect_pairs(key: Option<&str>, value: &Value, pairs: &mut Vec<(String, Option<String>)>) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for k in keys {
                let nested = match key {
                    Some(parent) => format!("{}[{}]", parent, k),
                    None => k.clone(),
                };
                collect_pairs(Some(&nested), &map[k], pairs);
            }
        }
        Value::Array(items) => {
            if let Some(key) = key {
                let nested = format!("{}[]", key);
                for item in items {
                    collect_pairs(Some(&nested), item, pairs);
                }
            }
        }
        Value::Null => {
            if let Some(key) = key {
                pairs.push((key.to_string(), None));
            }
        }
        Value::String(s) => {
            if let Some(key) = key {
                pairs.push((key.to_string(), Some(s.clone())));
            }
        }
        other => {
            if let Some(key) = key {
                pairs.push((key.to_string(), Some(other.to_string())));
            }
        }
    }
}
