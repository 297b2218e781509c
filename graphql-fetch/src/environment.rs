//! The execution environment consumed by [`fetch_query`](crate::fetch_query).

use serde::Deserialize;
use serde::Serialize;
use serde_json_bytes::Value;
use static_assertions::assert_impl_all;

use crate::dedup::InFlightRequests;
use crate::graphql::ResponseStream;
use crate::network::CacheConfig;
use crate::operation::OperationDescriptor;

/// What an environment's local store can say about an operation before any
/// network activity.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Availability {
    /// Every field of the operation's result shape is present and current.
    Available,
    /// The result shape is present but no longer considered current.
    Stale,
    /// At least one required field has never been written.
    Missing,
}

/// The locally stored data for an operation at one point in time.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Snapshot {
    /// The stored response data. `Value::Null` when nothing is stored.
    pub data: Value,
}

/// A GraphQL execution environment: a local store that can be checked and
/// read, plus a network layer that can execute operations against a server.
///
/// [`fetch_query`](crate::fetch_query) is generic over this trait; concrete
/// environments decide how data is stored, fetched and retained.
///
/// # Contract
///
/// * [`execute`](Environment::execute) starts a single network request and
///   yields each payload the server delivers. Implementations commit a
///   payload to their local store before yielding it, so a
///   [`lookup`](Environment::lookup) triggered by the payload event
///   observes the freshly written data.
/// * Dropping the stream returned by `execute` cancels the underlying
///   request. In-flight coordination relies on this to propagate
///   cancellation from the last interested subscriber down to the wire.
/// * Completing a request does not retain its data on behalf of callers;
///   retention is the environment's own concern.
pub trait Environment: Send + Sync + 'static {
    /// Report whether the operation's result shape is satisfiable from the
    /// local store right now.
    fn check(&self, operation: &OperationDescriptor) -> Availability;

    /// Read the operation's result shape out of the local store.
    fn lookup(&self, operation: &OperationDescriptor) -> Snapshot;

    /// Start the operation on the network layer.
    fn execute(
        &self,
        operation: &OperationDescriptor,
        cache_config: &CacheConfig,
    ) -> ResponseStream;

    /// The table coordinating identical concurrent requests against this
    /// environment.
    ///
    /// Implementations hold one [`InFlightRequests`] (created with
    /// `Default::default()`) for their whole lifetime.
    fn in_flight_requests(&self) -> &InFlightRequests;
}

assert_impl_all!(dyn Environment: Send, Sync);
