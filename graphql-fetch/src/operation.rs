//! Operation descriptors: tagged query definitions bound to concrete
//! variables, and the canonical identity that recognizes identical requests.

use std::fmt;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use serde_json_bytes::ByteString;
use serde_json_bytes::Value;
use sha2::Digest;
use sha2::Sha256;

use crate::graphql;
use crate::graphql::Object;

/// The kind of operation a GraphQL document contains.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub enum OperationKind {
    #[default]
    Query,
    Mutation,
    Subscription,
}

impl OperationKind {
    pub(crate) const fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Query => "query",
            OperationKind::Mutation => "mutation",
            OperationKind::Subscription => "subscription",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A compiled GraphQL operation: its name, kind and document text.
///
/// Definitions arrive pre-tagged from build tooling; nothing in this crate
/// parses or validates the document text.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryDefinition {
    /// The operation name.
    pub name: String,
    /// The kind of operation the document contains.
    #[serde(default)]
    pub operation_kind: OperationKind,
    /// The GraphQL document text.
    pub text: String,
}

#[buildstructor::buildstructor]
impl QueryDefinition {
    /// Builds a tagged operation definition. The kind defaults to
    /// [`OperationKind::Query`].
    #[builder(visibility = "pub")]
    fn new(name: String, operation_kind: Option<OperationKind>, text: String) -> Self {
        Self {
            name,
            operation_kind: operation_kind.unwrap_or_default(),
            text,
        }
    }
}

/// A [`QueryDefinition`] bound to concrete variables, together with the
/// canonical [`RequestIdentifier`] derived from both.
///
/// Descriptors are immutable once constructed and cheap to clone: clones
/// share the definition and variables.
#[derive(Clone, Debug)]
pub struct OperationDescriptor {
    definition: Arc<QueryDefinition>,
    variables: Arc<Object>,
    request_id: RequestIdentifier,
}

impl OperationDescriptor {
    /// Bind `variables` to `definition` and derive the request identity.
    pub fn new(definition: QueryDefinition, variables: Object) -> Self {
        let request_id = RequestIdentifier::new(&definition, &variables);
        Self {
            definition: Arc::new(definition),
            variables: Arc::new(variables),
            request_id,
        }
    }

    /// The definition this descriptor was built from.
    pub fn definition(&self) -> &QueryDefinition {
        &self.definition
    }

    /// The variables bound to the operation.
    pub fn variables(&self) -> &Object {
        &self.variables
    }

    /// The canonical identity used for de-duplication and store addressing.
    pub fn request_id(&self) -> &RequestIdentifier {
        &self.request_id
    }

    /// Render the descriptor as a wire-shape request body.
    pub fn to_request(&self) -> graphql::Request {
        graphql::Request::builder()
            .query(self.definition.text.clone())
            .operation_name(self.definition.name.clone())
            .variables(self.variables.as_ref().clone())
            .build()
    }
}

/// The canonical identity of a (definition, variables) pair.
///
/// Two descriptors naming the same operation with semantically equal
/// variables share an identifier even when their variable maps were built
/// in different insertion orders: the identifier is a SHA-256 digest over
/// the operation and the canonical JSON serialization of its variables,
/// with object keys recursively sorted.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestIdentifier(String);

impl RequestIdentifier {
    fn new(definition: &QueryDefinition, variables: &Object) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(definition.name.as_bytes());
        hasher.update([0x00]);
        hasher.update(definition.operation_kind.as_str().as_bytes());
        hasher.update([0x00]);
        hasher.update(definition.text.as_bytes());
        hasher.update([0x00]);
        hasher.update(canonical_json(variables));
        Self(hex::encode(hasher.finalize()))
    }

    /// The identifier as printable hex.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The variables rendered as JSON with object keys recursively sorted.
/// JSON quoting keeps key and string bytes from reading as structure.
fn canonical_json(variables: &Object) -> Vec<u8> {
    serde_json::to_vec(&sorted_object(variables)).expect("serializing a JSON object cannot fail")
}

fn sorted_object(object: &Object) -> Object {
    let mut entries: Vec<(&ByteString, &Value)> = object.iter().collect();
    entries.sort_unstable_by(|(a, _), (b, _)| a.as_str().cmp(b.as_str()));
    let mut sorted = Object::new();
    for (key, value) in entries {
        sorted.insert(key.clone(), sorted_value(value));
    }
    sorted
}

fn sorted_value(value: &Value) -> Value {
    match value {
        Value::Array(items) => Value::Array(items.iter().map(sorted_value).collect()),
        Value::Object(object) => Value::Object(sorted_object(object)),
        scalar => scalar.clone(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json_bytes::json;

    use super::*;

    fn viewer_query() -> QueryDefinition {
        QueryDefinition::builder()
            .name("ViewerQuery")
            .text("query ViewerQuery($id: ID!) { viewer(id: $id) { name } }")
            .build()
    }

    fn variables(value: Value) -> Object {
        value.as_object().expect("fixture must be an object").clone()
    }

    #[test]
    fn definitions_default_to_the_query_kind() {
        assert_eq!(viewer_query().operation_kind, OperationKind::Query);
    }

    #[test]
    fn identity_ignores_variable_insertion_order() {
        let forward = variables(json!({"a": 1, "b": {"x": true, "y": [1, 2]}}));
        let reverse = variables(json!({"b": {"y": [1, 2], "x": true}, "a": 1}));

        let first = OperationDescriptor::new(viewer_query(), forward);
        let second = OperationDescriptor::new(viewer_query(), reverse);
        assert_eq!(first.request_id(), second.request_id());
    }

    #[test]
    fn identity_depends_on_variable_values() {
        let first = OperationDescriptor::new(viewer_query(), variables(json!({"id": "1"})));
        let second = OperationDescriptor::new(viewer_query(), variables(json!({"id": "2"})));
        assert_ne!(first.request_id(), second.request_id());
    }

    #[test]
    fn identity_depends_on_key_boundaries() {
        // One key spelled "a:null,b" must not digest like two entries.
        let merged = variables(json!({"a:null,b": null}));
        let split = variables(json!({"a": null, "b": null}));

        let first = OperationDescriptor::new(viewer_query(), merged);
        let second = OperationDescriptor::new(viewer_query(), split);
        assert_ne!(first.request_id(), second.request_id());
    }

    #[test]
    fn identity_depends_on_the_operation() {
        let other = QueryDefinition::builder()
            .name("OtherQuery")
            .text("query OtherQuery { other }")
            .build();
        let first = OperationDescriptor::new(viewer_query(), Object::new());
        let second = OperationDescriptor::new(other, Object::new());
        assert_ne!(first.request_id(), second.request_id());
    }

    #[test]
    fn descriptors_render_wire_requests() {
        let descriptor = OperationDescriptor::new(viewer_query(), variables(json!({"id": "1"})));
        let request = descriptor.to_request();
        assert_eq!(request.operation_name.as_deref(), Some("ViewerQuery"));
        assert_eq!(request.variables.get("id"), Some(&json!("1")));
        assert!(request.query.contains("viewer"));
    }
}
