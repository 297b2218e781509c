use bytes::Bytes;
use serde::Deserialize;
use serde::Serialize;
use serde_json_bytes::ByteString;
use serde_json_bytes::Map as JsonMap;
use serde_json_bytes::Value;

use crate::error::FetchError;
use crate::graphql::Error;
use crate::graphql::Object;

/// A GraphQL response payload as received from an upstream server.
///
/// A request that is delivered incrementally produces several payloads,
/// every one of them in this shape.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct Response {
    /// The label that was passed to the defer or stream directive for this patch.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub label: Option<String>,

    /// The response data.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub data: Option<Value>,

    /// The errors raised by the operation, if any.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub errors: Vec<Error>,

    /// The optional GraphQL extensions.
    #[serde(skip_serializing_if = "Object::is_empty", default)]
    pub extensions: Object,

    /// Whether further payloads follow this one.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub has_next: Option<bool>,
}

#[buildstructor::buildstructor]
impl Response {
    /// Constructor
    #[builder(visibility = "pub")]
    fn new(
        label: Option<String>,
        data: Option<Value>,
        errors: Vec<Error>,
        // Skip the `Object` type alias in order to use buildstructor's map special-casing
        extensions: JsonMap<ByteString, Value>,
        has_next: Option<bool>,
    ) -> Self {
        Self {
            label,
            data,
            errors,
            extensions,
            has_next,
        }
    }

    /// Create a [`Response`] from the supplied [`Bytes`].
    ///
    /// This will return an error if the input is not a valid GraphQL
    /// response body.
    pub fn from_bytes(b: Bytes) -> Result<Response, FetchError> {
        let value = Value::from_bytes(b).map_err(|error| FetchError::MalformedResponse {
            reason: error.to_string(),
        })?;
        let response = serde_json_bytes::from_value::<Response>(value).map_err(|error| {
            FetchError::MalformedResponse {
                reason: error.to_string(),
            }
        })?;
        // The GraphQL spec requires at least one error when the data entry
        // is absent.
        if response.data.is_none() && response.errors.is_empty() {
            return Err(FetchError::MalformedResponse {
                reason: "graphql response without data must contain at least one error"
                    .to_string(),
            });
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use serde_json_bytes::json;

    use super::*;

    #[test]
    fn deserializes_an_incremental_payload() {
        let response = Response::from_bytes(Bytes::from_static(
            br#"{"data":{"viewer":{"name":"Alice"}},"hasNext":true}"#,
        ))
        .unwrap();
        assert_eq!(response.data, Some(json!({"viewer": {"name": "Alice"}})));
        assert_eq!(response.has_next, Some(true));
    }

    #[test]
    fn keeps_errors_alongside_partial_data() {
        let response = Response::from_bytes(Bytes::from_static(
            br#"{"errors":[{"message":"boom","locations":[{"line":1,"column":2}]}],"data":{"viewer":null}}"#,
        ))
        .unwrap();
        assert_eq!(response.data, Some(json!({"viewer": null})));
        assert_eq!(response.errors.len(), 1);
        assert_eq!(response.errors[0].message, "boom");
        assert_eq!(response.errors[0].locations[0].line, 1);
    }

    #[test]
    fn rejects_a_body_that_is_not_json() {
        let error = Response::from_bytes(Bytes::from_static(b"not json")).unwrap_err();
        assert!(matches!(error, FetchError::MalformedResponse { .. }));
    }

    #[test]
    fn rejects_a_response_with_neither_data_nor_errors() {
        let error = Response::from_bytes(Bytes::from_static(b"{}")).unwrap_err();
        assert!(matches!(error, FetchError::MalformedResponse { .. }));
    }
}
