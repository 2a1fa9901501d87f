//! Response serializers
//!
//! A serializer validates a response and decodes its body. It reports the
//! object and the error separately so a partially decoded object can travel
//! alongside a validation error.

use crate::error::SerializationError;
use netsession_types::{Response, ResponseObject};
use std::collections::HashSet;
use std::ops::RangeInclusive;
use std::sync::Arc;

/// Result of serializing a response body
#[derive(Debug, Clone, Default)]
pub struct Serialized {
    pub object: Option<ResponseObject>,
    pub error: Option<SerializationError>,
}

impl Serialized {
    pub fn ok(object: ResponseObject) -> Self {
        Self {
            object: Some(object),
            error: None,
        }
    }

    pub fn failed(error: SerializationError) -> Self {
        Self {
            object: None,
            error: Some(error),
        }
    }
}

/// Turns a response and its buffered body into a [`ResponseObject`]
pub trait ResponseSerializer: Send + Sync {
    /// Name reported in completion notifications
    fn name(&self) -> &str;

    fn serialize(&self, response: Option<&Response>, data: &[u8]) -> Serialized;
}

// ============================================================================
// Passthrough
// ============================================================================

/// Hands the raw body through unchanged; the session default
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughSerializer;

impl ResponseSerializer for PassthroughSerializer {
    fn name(&self) -> &str {
        "passthrough"
    }

    fn serialize(&self, _response: Option<&Response>, data: &[u8]) -> Serialized {
        Serialized::ok(ResponseObject::Data(data.to_vec()))
    }
}

// ============================================================================
// HTTP validation
// ============================================================================

/// Validates status code and content type, then passes the body through
#[derive(Debug, Clone)]
pub struct HttpResponseSerializer {
    acceptable_status_codes: RangeInclusive<u16>,
    /// `None` accepts any content type
    acceptable_content_types: Option<HashSet<String>>,
}

impl Default for HttpResponseSerializer {
    fn default() -> Self {
        Self {
            acceptable_status_codes: 200..=299,
            acceptable_content_types: None,
        }
    }
}

impl HttpResponseSerializer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status_codes(mut self, codes: RangeInclusive<u16>) -> Self {
        self.acceptable_status_codes = codes;
        self
    }

    pub fn with_content_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.acceptable_content_types = Some(
            types
                .into_iter()
                .map(|t| t.into().to_ascii_lowercase())
                .collect(),
        );
        self
    }

    /// Check the response, returning the first violation
    ///
    /// A missing response (no headers received) validates; an empty body is
    /// never rejected on content type.
    pub fn validate(&self, response: Option<&Response>, data: &[u8]) -> Result<(), SerializationError> {
        let Some(response) = response else {
            return Ok(());
        };

        if let Some(types) = &self.acceptable_content_types {
            let mime = response.mime_type().unwrap_or_default();
            if !data.is_empty() && !types.contains(&mime) {
                return Err(SerializationError::UnacceptableContentType {
                    content_type: mime,
                    data: Some(data.to_vec()),
                });
            }
        }

        if !self.acceptable_status_codes.contains(&response.status) {
            return Err(SerializationError::UnacceptableStatusCode {
                status: response.status,
                data: Some(data.to_vec()),
            });
        }

        Ok(())
    }
}

impl ResponseSerializer for HttpResponseSerializer {
    fn name(&self) -> &str {
        "http"
    }

    fn serialize(&self, response: Option<&Response>, data: &[u8]) -> Serialized {
        match self.validate(response, data) {
            Ok(()) => Serialized::ok(ResponseObject::Data(data.to_vec())),
            // The body of an error status is still useful to callers
            Err(e @ SerializationError::UnacceptableStatusCode { .. }) => Serialized {
                object: Some(ResponseObject::Data(data.to_vec())),
                error: Some(e),
            },
            Err(e) => Serialized::failed(e),
        }
    }
}

// ============================================================================
// JSON
// ============================================================================

/// Validates like [`HttpResponseSerializer`] and decodes JSON bodies
#[derive(Debug, Clone)]
pub struct JsonResponseSerializer {
    base: HttpResponseSerializer,
    removes_keys_with_null_values: bool,
}

impl Default for JsonResponseSerializer {
    fn default() -> Self {
        Self {
            base: HttpResponseSerializer::new().with_content_types([
                "application/json",
                "text/json",
                "text/javascript",
            ]),
            removes_keys_with_null_values: false,
        }
    }
}

impl JsonResponseSerializer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn removes_keys_with_null_values(mut self, remove: bool) -> Self {
        self.removes_keys_with_null_values = remove;
        self
    }

    pub fn with_status_codes(mut self, codes: RangeInclusive<u16>) -> Self {
        self.base = self.base.with_status_codes(codes);
        self
    }

    fn decode(&self, data: &[u8]) -> Result<ResponseObject, SerializationError> {
        // Some servers answer an empty JSON response with a single space
        if data.is_empty() || data == b" " {
            return Ok(ResponseObject::Empty);
        }

        let mut value: serde_json::Value =
            serde_json::from_slice(data).map_err(|e| SerializationError::Decode {
                message: e.to_string(),
                data: Some(data.to_vec()),
            })?;

        if self.removes_keys_with_null_values {
            strip_nulls(&mut value);
        }
        Ok(ResponseObject::Json(value))
    }
}

impl ResponseSerializer for JsonResponseSerializer {
    fn name(&self) -> &str {
        "json"
    }

    fn serialize(&self, response: Option<&Response>, data: &[u8]) -> Serialized {
        let validation = self.base.validate(response, data);
        if let Err(e @ SerializationError::UnacceptableContentType { .. }) = validation {
            return Serialized::failed(e);
        }

        match self.decode(data) {
            Ok(object) => Serialized {
                object: Some(object),
                error: validation.err(),
            },
            Err(decode_error) => Serialized {
                object: None,
                error: Some(validation.err().unwrap_or(decode_error)),
            },
        }
    }
}

/// Recursively remove object keys whose value is `null`
fn strip_nulls(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::Object(map) => {
            map.retain(|_, v| !v.is_null());
            for v in map.values_mut() {
                strip_nulls(v);
            }
        }
        serde_json::Value::Array(items) => {
            for v in items {
                strip_nulls(v);
            }
        }
        _ => {}
    }
}

// ============================================================================
// Compound
// ============================================================================

/// Delegates to the first member that accepts the response
pub struct CompoundResponseSerializer {
    serializers: Vec<Arc<dyn ResponseSerializer>>,
    fallback: HttpResponseSerializer,
}

impl CompoundResponseSerializer {
    pub fn new(serializers: Vec<Arc<dyn ResponseSerializer>>) -> Self {
        Self {
            serializers,
            fallback: HttpResponseSerializer::default(),
        }
    }
}

impl ResponseSerializer for CompoundResponseSerializer {
    fn name(&self) -> &str {
        "compound"
    }

    fn serialize(&self, response: Option<&Response>, data: &[u8]) -> Serialized {
        for serializer in &self.serializers {
            let serialized = serializer.serialize(response, data);
            if serialized.error.is_none() {
                return serialized;
            }
        }
        self.fallback.serialize(response, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use url::Url;

    fn response(status: u16, content_type: &str) -> Response {
        Response::new(Url::parse("https://example.com/api").unwrap(), status)
            .with_header("Content-Type", content_type)
    }

    #[test]
    fn test_passthrough_returns_raw_bytes() {
        let serialized = PassthroughSerializer.serialize(None, b"raw");
        assert_eq!(serialized.object, Some(ResponseObject::Data(b"raw".to_vec())));
        assert!(serialized.error.is_none());
    }

    #[test]
    fn test_http_status_failure_keeps_body() {
        let serializer = HttpResponseSerializer::new();
        let serialized = serializer.serialize(Some(&response(404, "text/plain")), b"missing");

        assert_eq!(serialized.object, Some(ResponseObject::Data(b"missing".to_vec())));
        assert!(matches!(
            serialized.error,
            Some(SerializationError::UnacceptableStatusCode { status: 404, .. })
        ));
    }

    #[test]
    fn test_http_content_type_failure_drops_body() {
        let serializer = HttpResponseSerializer::new().with_content_types(["application/json"]);
        let serialized = serializer.serialize(Some(&response(200, "text/html")), b"<html>");

        assert!(serialized.object.is_none());
        assert_eq!(serialized.error.unwrap().data(), Some(&b"<html>"[..]));
    }

    #[test]
    fn test_json_decodes_and_strips_nulls() {
        let serializer = JsonResponseSerializer::new().removes_keys_with_null_values(true);
        let body = br#"{"a":1,"b":null,"c":[{"d":null,"e":2}]}"#;
        let serialized = serializer.serialize(Some(&response(200, "application/json; charset=utf-8")), body);

        assert!(serialized.error.is_none());
        assert_eq!(
            serialized.object,
            Some(ResponseObject::Json(json!({"a": 1, "c": [{"e": 2}]})))
        );
    }

    #[test]
    fn test_json_empty_body() {
        let serializer = JsonResponseSerializer::new();
        let serialized = serializer.serialize(Some(&response(204, "application/json")), b" ");
        assert_eq!(serialized.object, Some(ResponseObject::Empty));
    }

    #[test]
    fn test_json_error_status_still_decodes() {
        let serializer = JsonResponseSerializer::new();
        let serialized =
            serializer.serialize(Some(&response(422, "application/json")), br#"{"error":"bad"}"#);

        assert_eq!(serialized.object, Some(ResponseObject::Json(json!({"error": "bad"}))));
        assert!(matches!(
            serialized.error,
            Some(SerializationError::UnacceptableStatusCode { status: 422, .. })
        ));
    }

    #[test]
    fn test_json_decode_failure() {
        let serializer = JsonResponseSerializer::new();
        let serialized = serializer.serialize(Some(&response(200, "application/json")), b"{oops");
        assert!(serialized.object.is_none());
        assert!(matches!(serialized.error, Some(SerializationError::Decode { .. })));
    }

    #[test]
    fn test_compound_picks_first_accepting_member() {
        let compound = CompoundResponseSerializer::new(vec![
            Arc::new(JsonResponseSerializer::new()),
            Arc::new(HttpResponseSerializer::new().with_content_types(["text/plain"])),
        ]);

        let json = compound.serialize(Some(&response(200, "application/json")), b"[1]");
        assert_eq!(json.object, Some(ResponseObject::Json(json!([1]))));

        let text = compound.serialize(Some(&response(200, "text/plain")), b"hi");
        assert_eq!(text.object, Some(ResponseObject::Data(b"hi".to_vec())));

        let other = compound.serialize(Some(&response(200, "image/png")), b"\x89PNG");
        assert!(other.error.is_none());
    }
}
