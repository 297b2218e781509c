//! Policy-driven fetching of GraphQL queries with request de-duplication.
//!
//! [`fetch_query`] is the entry point: it checks the operation kind,
//! resolves a [`FetchPolicy`] against an [`Environment`]'s local store and
//! returns a stream of response data snapshots, one per network payload.
//! Identical concurrent calls share a single network request for as long as
//! that request is in flight.

#![warn(unreachable_pub)]

mod dedup;
mod environment;
mod error;
mod fetch;
pub mod graphql;
mod network;
mod operation;
pub mod testing;

pub use dedup::InFlightRequests;
pub use dedup::RequestEvent;
pub use dedup::RequestStream;
pub use environment::Availability;
pub use environment::Environment;
pub use environment::Snapshot;
pub use error::FetchError;
pub use error::FetchQueryError;
pub use error::InvalidFetchPolicy;
pub use fetch::FetchPolicy;
pub use fetch::FetchQueryOptions;
pub use fetch::QueryResponseStream;
pub use fetch::fetch_query;
pub use graphql::ResponseStream;
pub use network::CacheConfig;
pub use network::CacheConfigOverride;
pub use operation::OperationDescriptor;
pub use operation::OperationKind;
pub use operation::QueryDefinition;
pub use operation::RequestIdentifier;
