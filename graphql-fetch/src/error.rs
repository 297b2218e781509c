//! Error types for query fetching.

use displaydoc::Display;
use serde::Serialize;
use serde_json_bytes::Value;
use thiserror::Error;

use crate::graphql;
use crate::operation::OperationKind;

/// Contract violations reported synchronously by
/// [`fetch_query`](crate::fetch_query).
///
/// These indicate a programming error at the call site. They are returned
/// from the call itself, before any stream or network activity exists.
#[derive(Error, Display, Debug, Clone, Eq, PartialEq)]
pub enum FetchQueryError {
    /// expected a query operation, got a {kind}
    ExpectedQueryOperation {
        /// Kind of the operation that was supplied instead.
        kind: OperationKind,
    },

    /// {0}
    InvalidFetchPolicy(#[from] InvalidFetchPolicy),
}

/// invalid fetch policy '{0}'
#[derive(Error, Display, Debug, Clone, Eq, PartialEq)]
pub struct InvalidFetchPolicy(pub String);

/// Failures raised while a fetch is executing.
///
/// These are surfaced as `Err` items on response streams rather than from
/// the `fetch_query` call itself. One upstream failure may fan out to every
/// subscriber of a de-duplicated request, so the type is cloneable.
#[derive(Error, Display, Debug, Clone, Eq, PartialEq, Serialize)]
#[serde(untagged)]
#[non_exhaustive]
pub enum FetchError {
    /// fetch failed: {reason}
    #[serde(rename_all = "camelCase")]
    RequestFailed {
        /// The HTTP status code, when the failure happened above the transport.
        #[serde(skip_serializing_if = "Option::is_none")]
        status_code: Option<u16>,
        /// Why the request failed.
        reason: String,
    },

    /// response was malformed: {reason}
    MalformedResponse {
        /// Why the payload could not be decoded.
        reason: String,
    },

    /// local store rejected a payload: {reason}
    StoreUpdateFailed {
        /// Why the store write failed.
        reason: String,
    },

    /// request was interrupted before completion
    RequestInterrupted,
}

impl FetchError {
    /// Convert the fetch error to a GraphQL error.
    pub fn to_graphql_error(&self) -> graphql::Error {
        let mut extensions = match serde_json_bytes::to_value(self) {
            Ok(Value::Object(fields)) => fields,
            _ => graphql::Object::default(),
        };
        extensions.insert("code", self.extension_code().into());
        graphql::Error::builder()
            .message(self.to_string())
            .extensions(extensions)
            .build()
    }

    /// The machine-readable code identifying this class of failure.
    pub fn extension_code(&self) -> &'static str {
        match self {
            FetchError::RequestFailed { .. } => "REQUEST_FAILED",
            FetchError::MalformedResponse { .. } => "MALFORMED_RESPONSE",
            FetchError::StoreUpdateFailed { .. } => "STORE_UPDATE_FAILED",
            FetchError::RequestInterrupted => "REQUEST_INTERRUPTED",
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json_bytes::json;

    use super::*;

    #[test]
    fn fetch_errors_render_as_graphql_errors() {
        let error = FetchError::RequestFailed {
            status_code: Some(503),
            reason: "service unavailable".to_string(),
        };
        let graphql_error = error.to_graphql_error();
        assert_eq!(graphql_error.message, "fetch failed: service unavailable");
        assert_eq!(
            graphql_error.extensions.get("code"),
            Some(&json!("REQUEST_FAILED")),
        );
        assert_eq!(
            graphql_error.extensions.get("statusCode"),
            Some(&json!(503)),
        );
    }

    #[test]
    fn unit_failures_still_carry_a_code() {
        let graphql_error = FetchError::RequestInterrupted.to_graphql_error();
        assert_eq!(
            graphql_error.message,
            "request was interrupted before completion"
        );
        assert_eq!(
            graphql_error.extensions.get("code"),
            Some(&json!("REQUEST_INTERRUPTED")),
        );
    }

    #[test]
    fn invalid_policy_errors_name_the_value() {
        let error = FetchQueryError::from(InvalidFetchPolicy("store-and-network".to_string()));
        assert_eq!(error.to_string(), "invalid fetch policy 'store-and-network'");
    }
}
