//! Mock environment for exercising fetch behavior in tests.
//!
//! [`MockEnvironment`] keeps an in-memory store keyed by request identity
//! and serves programmed fetch behaviors in the order they were queued. A
//! behavior either yields canned payloads, fails, or hands the test a
//! [`ResponseController`] to feed events in while the request is observably
//! in flight.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::task::Context;
use std::task::Poll;

use futures::Stream;
use serde_json_bytes::Value;
use static_assertions::assert_impl_all;
use tokio::sync::mpsc;

use crate::dedup::InFlightRequests;
use crate::environment::Availability;
use crate::environment::Environment;
use crate::environment::Snapshot;
use crate::error::FetchError;
use crate::graphql;
use crate::network::CacheConfig;
use crate::operation::OperationDescriptor;
use crate::operation::RequestIdentifier;

type SharedStore = Arc<Mutex<HashMap<RequestIdentifier, Value>>>;
type SharedAvailability = Arc<Mutex<HashMap<RequestIdentifier, Availability>>>;

enum FetchBehavior {
    Payloads(Vec<graphql::Response>),
    Error(FetchError),
    Controlled(mpsc::UnboundedReceiver<FetchEvent>),
}

/// One event fed into a controlled fetch.
enum FetchEvent {
    Payload(graphql::Response),
    Error(FetchError),
    Complete,
}

/// An [`Environment`] whose network responses are programmed by the test.
///
/// Unprogrammed fetches fail with an error naming the operation, so a test
/// that triggers more network round trips than it queued behaviors for
/// fails loudly instead of hanging.
#[derive(Default)]
pub struct MockEnvironment {
    store: SharedStore,
    availability: SharedAvailability,
    behaviors: Mutex<VecDeque<FetchBehavior>>,
    fetch_calls: AtomicUsize,
    open_fetches: Arc<AtomicUsize>,
    last_cache_config: Mutex<Option<CacheConfig>>,
    in_flight: InFlightRequests,
}

impl MockEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a fetch that yields a single payload carrying `data`, then
    /// completes.
    pub fn queue_payload(&self, data: Value) {
        self.queue_payloads(vec![graphql::Response::builder().data(data).build()]);
    }

    /// Queue a fetch that yields the given payloads in order, then
    /// completes.
    pub fn queue_payloads(&self, payloads: Vec<graphql::Response>) {
        self.behaviors
            .lock()
            .expect("lock poisoned")
            .push_back(FetchBehavior::Payloads(payloads));
    }

    /// Queue a fetch that fails with `error` without yielding a payload.
    pub fn queue_error(&self, error: FetchError) {
        self.behaviors
            .lock()
            .expect("lock poisoned")
            .push_back(FetchBehavior::Error(error));
    }

    /// Queue a fetch that stays open until the returned controller feeds it
    /// events. Dropping the controller completes the fetch.
    pub fn queue_controlled(&self) -> ResponseController {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.behaviors
            .lock()
            .expect("lock poisoned")
            .push_back(FetchBehavior::Controlled(receiver));
        ResponseController { sender }
    }

    /// Seed the store for `operation` and mark it available, as if a fetch
    /// for it had completed earlier.
    pub fn store_data(&self, operation: &OperationDescriptor, data: Value) {
        self.store
            .lock()
            .expect("lock poisoned")
            .insert(operation.request_id().clone(), data);
        self.availability
            .lock()
            .expect("lock poisoned")
            .insert(operation.request_id().clone(), Availability::Available);
    }

    /// Downgrade whatever the store holds for `operation` to stale.
    pub fn mark_stale(&self, operation: &OperationDescriptor) {
        self.availability
            .lock()
            .expect("lock poisoned")
            .insert(operation.request_id().clone(), Availability::Stale);
    }

    /// How many times the network was consulted.
    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    /// How many fetches are currently open, counting a fetch until its
    /// stream is dropped.
    pub fn open_fetches(&self) -> usize {
        self.open_fetches.load(Ordering::SeqCst)
    }

    /// The cache config the most recent fetch was given.
    pub fn last_cache_config(&self) -> Option<CacheConfig> {
        self.last_cache_config
            .lock()
            .expect("lock poisoned")
            .clone()
    }
}

impl Environment for MockEnvironment {
    fn check(&self, operation: &OperationDescriptor) -> Availability {
        self.availability
            .lock()
            .expect("lock poisoned")
            .get(operation.request_id())
            .copied()
            .unwrap_or(Availability::Missing)
    }

    fn lookup(&self, operation: &OperationDescriptor) -> Snapshot {
        let data = self
            .store
            .lock()
            .expect("lock poisoned")
            .get(operation.request_id())
            .cloned()
            .unwrap_or(Value::Null);
        Snapshot { data }
    }

    fn execute(
        &self,
        operation: &OperationDescriptor,
        cache_config: &CacheConfig,
    ) -> graphql::ResponseStream {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.open_fetches.fetch_add(1, Ordering::SeqCst);
        *self.last_cache_config.lock().expect("lock poisoned") = Some(cache_config.clone());

        let behavior = self
            .behaviors
            .lock()
            .expect("lock poisoned")
            .pop_front()
            .unwrap_or_else(|| {
                FetchBehavior::Error(FetchError::RequestFailed {
                    status_code: None,
                    reason: format!(
                        "no programmed fetch for operation '{}'",
                        operation.definition().name
                    ),
                })
            });
        let (queued, live) = match behavior {
            FetchBehavior::Payloads(payloads) => (
                payloads
                    .into_iter()
                    .map(FetchEvent::Payload)
                    .chain(std::iter::once(FetchEvent::Complete))
                    .collect(),
                None,
            ),
            FetchBehavior::Error(error) => {
                (VecDeque::from(vec![FetchEvent::Error(error)]), None)
            }
            FetchBehavior::Controlled(receiver) => (VecDeque::new(), Some(receiver)),
        };

        Box::pin(MockFetchStream {
            identifier: operation.request_id().clone(),
            store: Arc::clone(&self.store),
            availability: Arc::clone(&self.availability),
            queued,
            live,
            done: false,
            _open: OpenFetch(Arc::clone(&self.open_fetches)),
        })
    }

    fn in_flight_requests(&self) -> &InFlightRequests {
        &self.in_flight
    }
}

assert_impl_all!(MockEnvironment: Send, Sync);

struct MockFetchStream {
    identifier: RequestIdentifier,
    store: SharedStore,
    availability: SharedAvailability,
    queued: VecDeque<FetchEvent>,
    live: Option<mpsc::UnboundedReceiver<FetchEvent>>,
    done: bool,
    _open: OpenFetch,
}

impl MockFetchStream {
    /// Commits payload data to the store before yielding it, so a snapshot
    /// read triggered by the yield observes the payload.
    fn apply(&mut self, event: FetchEvent) -> Poll<Option<Result<graphql::Response, FetchError>>> {
        match event {
            FetchEvent::Payload(response) => {
                if let Some(data) = &response.data {
                    self.store
                        .lock()
                        .expect("lock poisoned")
                        .insert(self.identifier.clone(), data.clone());
                    self.availability
                        .lock()
                        .expect("lock poisoned")
                        .insert(self.identifier.clone(), Availability::Available);
                }
                Poll::Ready(Some(Ok(response)))
            }
            FetchEvent::Error(error) => {
                self.done = true;
                Poll::Ready(Some(Err(error)))
            }
            FetchEvent::Complete => {
                self.done = true;
                Poll::Ready(None)
            }
        }
    }
}

impl Stream for MockFetchStream {
    type Item = Result<graphql::Response, FetchError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        if let Some(event) = this.queued.pop_front() {
            return this.apply(event);
        }
        match &mut this.live {
            Some(receiver) => match receiver.poll_recv(cx) {
                Poll::Ready(Some(event)) => this.apply(event),
                Poll::Ready(None) => {
                    this.done = true;
                    Poll::Ready(None)
                }
                Poll::Pending => Poll::Pending,
            },
            None => {
                this.done = true;
                Poll::Ready(None)
            }
        }
    }
}

struct OpenFetch(Arc<AtomicUsize>);

impl Drop for OpenFetch {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Feeds events into a fetch queued with
/// [`MockEnvironment::queue_controlled`].
///
/// Events sent after the fetch was cancelled are silently discarded, which
/// lets tests assert that nothing observes them.
pub struct ResponseController {
    sender: mpsc::UnboundedSender<FetchEvent>,
}

impl ResponseController {
    /// Emit a payload carrying `data`.
    pub fn emit(&self, data: Value) {
        self.emit_response(graphql::Response::builder().data(data).build());
    }

    /// Emit a full response payload.
    pub fn emit_response(&self, response: graphql::Response) {
        let _ = self.sender.send(FetchEvent::Payload(response));
    }

    /// Fail the fetch with `error`.
    pub fn fail(&self, error: FetchError) {
        let _ = self.sender.send(FetchEvent::Error(error));
    }

    /// Complete the fetch successfully.
    pub fn complete(&self) {
        let _ = self.sender.send(FetchEvent::Complete);
    }

    /// Whether the fetch is still listening, false once it was cancelled or
    /// completed.
    pub fn is_connected(&self) -> bool {
        !self.sender.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use serde_json_bytes::json;
    use test_log::test;

    use super::*;
    use crate::operation::QueryDefinition;

    fn operation() -> OperationDescriptor {
        OperationDescriptor::new(
            QueryDefinition::builder()
                .name("Viewer")
                .text("query Viewer { viewer { name } }")
                .build(),
            crate::graphql::Object::new(),
        )
    }

    #[test(tokio::test)]
    async fn unprogrammed_fetches_fail_loudly() {
        let environment = MockEnvironment::new();
        let operation = operation();
        let mut stream = environment.execute(&operation, &CacheConfig::default());

        let event = stream.next().await;
        match event {
            Some(Err(FetchError::RequestFailed { reason, .. })) => {
                assert!(reason.contains("Viewer"), "unexpected reason: {reason}");
            }
            other => panic!("expected a request failure, got {other:?}"),
        }
    }

    #[test(tokio::test)]
    async fn payloads_are_committed_before_they_are_yielded() {
        let environment = MockEnvironment::new();
        let operation = operation();
        environment.queue_payload(json!({"viewer": {"name": "Alice"}}));

        let mut stream = environment.execute(&operation, &CacheConfig::default());
        let payload = stream.next().await.unwrap().unwrap();

        assert_eq!(payload.data, Some(json!({"viewer": {"name": "Alice"}})));
        assert_eq!(
            environment.lookup(&operation).data,
            json!({"viewer": {"name": "Alice"}})
        );
        assert_eq!(environment.check(&operation), Availability::Available);
        assert_eq!(stream.next().await, None);
    }
}
