//! The `fetch_query` entry point and its fetch policies.

use std::fmt;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;

use futures::Stream;
use futures::StreamExt;
use futures::future::ready;
use futures::stream::once;
use serde::Deserialize;
use serde::Serialize;
use serde::de;
use serde_json_bytes::Value;
use static_assertions::assert_impl_all;

use crate::environment::Availability;
use crate::environment::Environment;
use crate::error::FetchError;
use crate::error::FetchQueryError;
use crate::error::InvalidFetchPolicy;
use crate::graphql::Object;
use crate::network::CacheConfig;
use crate::network::CacheConfigOverride;
use crate::operation::OperationDescriptor;
use crate::operation::OperationKind;
use crate::operation::QueryDefinition;

/// Stream of response data snapshots produced by [`fetch_query`].
///
/// Each item corresponds to one network payload and carries the data the
/// store holds for the operation after that payload was committed, so
/// queries using incremental delivery yield several increasingly complete
/// snapshots. An `Err` item is terminal. Dropping the stream releases
/// interest in the underlying request.
pub type QueryResponseStream = Pin<Box<dyn Stream<Item = Result<Value, FetchError>> + Send>>;

assert_impl_all!(QueryResponseStream: Send);

/// How [`fetch_query`] decides between the local store and the network.
///
/// The decision is made once, when the stream is created.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
#[non_exhaustive]
pub enum FetchPolicy {
    /// Always fetch from the network, ignoring any data the local store
    /// already holds for the operation.
    #[default]
    NetworkOnly,
    /// Answer from the local store if it can fully satisfy the operation
    /// with current data, otherwise fetch from the network. Stale data does
    /// not qualify.
    StoreOrNetwork,
}

impl FetchPolicy {
    pub(crate) const fn as_str(&self) -> &'static str {
        match self {
            FetchPolicy::NetworkOnly => "network-only",
            FetchPolicy::StoreOrNetwork => "store-or-network",
        }
    }
}

impl fmt::Display for FetchPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FetchPolicy {
    type Err = InvalidFetchPolicy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "network-only" => Ok(FetchPolicy::NetworkOnly),
            "store-or-network" => Ok(FetchPolicy::StoreOrNetwork),
            other => Err(InvalidFetchPolicy(other.to_string())),
        }
    }
}

impl<'de> Deserialize<'de> for FetchPolicy {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        String::deserialize(deserializer)?
            .parse()
            .map_err(de::Error::custom)
    }
}

/// Options accepted by [`fetch_query`].
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FetchQueryOptions {
    /// Store versus network decision, [`FetchPolicy::NetworkOnly`] unless
    /// set.
    pub fetch_policy: FetchPolicy,
    /// Per-call adjustments to the cache config forwarded to the network
    /// layer.
    pub network_cache_config: CacheConfigOverride,
}

#[buildstructor::buildstructor]
impl FetchQueryOptions {
    #[builder(visibility = "pub")]
    fn new(
        fetch_policy: Option<FetchPolicy>,
        network_cache_config: Option<CacheConfigOverride>,
    ) -> Self {
        Self {
            fetch_policy: fetch_policy.unwrap_or_default(),
            network_cache_config: network_cache_config.unwrap_or_default(),
        }
    }
}

/// Fetch the given query against an environment and observe the data as a
/// stream of snapshots.
///
/// The operation kind is validated and the fetch policy resolved before
/// anything is returned, so callers holding an `Ok` know a query is on its
/// way. Every network payload is committed to the environment's store
/// before the corresponding snapshot is read back and yielded, which means
/// each item reflects all payloads received so far.
///
/// # Errors
///
/// Fails synchronously when `query` is not of the query kind. Network and
/// store failures are reported through the stream instead.
///
/// # De-duplication
///
/// Identical calls made while a request is in flight share that request
/// rather than fetching twice. Late subscribers first replay the payloads
/// they missed. The sharing window closes when the request completes: a
/// call made afterwards starts a fresh one.
///
/// # Cancellation and retention
///
/// Dropping the returned stream releases interest in the shared request;
/// when the last interested stream is dropped mid-flight the request is
/// cancelled. `fetch_query` does not retain the fetched data against
/// eviction. Callers who need the data to outlive the stream must arrange
/// retention themselves.
///
/// Must be called within a tokio runtime when the network is consulted.
pub fn fetch_query<E>(
    environment: &Arc<E>,
    query: &QueryDefinition,
    variables: Object,
    options: FetchQueryOptions,
) -> Result<QueryResponseStream, FetchQueryError>
where
    E: Environment + ?Sized,
{
    if query.operation_kind != OperationKind::Query {
        return Err(FetchQueryError::ExpectedQueryOperation {
            kind: query.operation_kind,
        });
    }
    let operation = OperationDescriptor::new(query.clone(), variables);
    let cache_config = CacheConfig::default().merged_with(&options.network_cache_config);

    match options.fetch_policy {
        FetchPolicy::StoreOrNetwork => {
            if environment.check(&operation) == Availability::Available {
                tracing::debug!(
                    operation = %operation.definition().name,
                    "answering from the local store"
                );
                let snapshot = environment.lookup(&operation);
                return Ok(Box::pin(once(ready(Ok(snapshot.data)))));
            }
            Ok(fetch_from_network(environment, operation, &cache_config))
        }
        FetchPolicy::NetworkOnly => Ok(fetch_from_network(environment, operation, &cache_config)),
        #[allow(unreachable_patterns)]
        other => Err(FetchQueryError::InvalidFetchPolicy(InvalidFetchPolicy(
            other.to_string(),
        ))),
    }
}

fn fetch_from_network<E>(
    environment: &Arc<E>,
    operation: OperationDescriptor,
    cache_config: &CacheConfig,
) -> QueryResponseStream
where
    E: Environment + ?Sized,
{
    let events = environment
        .in_flight_requests()
        .subscribe(&operation, || environment.execute(&operation, cache_config));
    let environment = Arc::clone(environment);
    Box::pin(events.map(move |event| event.map(|_payload| environment.lookup(&operation).data)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policies_parse_from_their_wire_spellings() {
        assert_eq!(
            "network-only".parse::<FetchPolicy>(),
            Ok(FetchPolicy::NetworkOnly)
        );
        assert_eq!(
            "store-or-network".parse::<FetchPolicy>(),
            Ok(FetchPolicy::StoreOrNetwork)
        );
    }

    #[test]
    fn unknown_policy_spellings_are_rejected_by_name() {
        let error = "store-and-network".parse::<FetchPolicy>().unwrap_err();
        assert_eq!(
            error.to_string(),
            "invalid fetch policy 'store-and-network'"
        );
    }

    #[test]
    fn policies_round_trip_through_serde() {
        assert_eq!(
            serde_json::to_string(&FetchPolicy::StoreOrNetwork).unwrap(),
            r#""store-or-network""#
        );
        assert_eq!(
            serde_json::from_str::<FetchPolicy>(r#""network-only""#).unwrap(),
            FetchPolicy::NetworkOnly
        );
    }

    #[test]
    fn unknown_policy_spellings_are_rejected_when_deserialized() {
        let error = serde_json::from_str::<FetchPolicy>(r#""store-and-network""#).unwrap_err();
        assert!(
            error
                .to_string()
                .contains("invalid fetch policy 'store-and-network'")
        );
    }

    #[test]
    fn options_default_to_network_only() {
        let options = FetchQueryOptions::default();
        assert_eq!(options.fetch_policy, FetchPolicy::NetworkOnly);
        assert_eq!(options.network_cache_config, CacheConfigOverride::default());
    }
}
