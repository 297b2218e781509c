//! De-duplication of identical in-flight requests.
//!
//! The first subscriber for a request identity starts the network request
//! and a driver task that fans payloads out. Further subscribers with the
//! same identity attach to the running request, replaying the payloads they
//! missed before following along live. The table entry disappears the
//! moment the request reaches a terminal event, so a subscriber arriving
//! after completion starts a fresh request.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::task::Context;
use std::task::Poll;

use futures::Stream;
use futures::StreamExt;
use static_assertions::assert_impl_all;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::Instrument;

use crate::error::FetchError;
use crate::graphql;
use crate::operation::OperationDescriptor;
use crate::operation::RequestIdentifier;

/// A single event observed by a subscriber: one payload, or the error that
/// ended the request.
pub type RequestEvent = Result<graphql::Response, FetchError>;

type Registry = Arc<Mutex<HashMap<RequestIdentifier, Arc<Mutex<RequestState>>>>>;

/// Coordination table for identical concurrent requests against one
/// environment.
#[derive(Default)]
pub struct InFlightRequests {
    registry: Registry,
}

struct RequestState {
    history: Vec<RequestEvent>,
    subscribers: Vec<mpsc::UnboundedSender<RequestEvent>>,
    interest: usize,
    done: bool,
    driver: Option<AbortHandle>,
}

impl InFlightRequests {
    /// Attach to the in-flight request for `operation`, starting one via
    /// `connect` if no identical request is currently running.
    ///
    /// Must be called within a tokio runtime: the first subscriber for an
    /// identity spawns the task that drives the request.
    pub fn subscribe<F>(&self, operation: &OperationDescriptor, connect: F) -> RequestStream
    where
        F: FnOnce() -> graphql::ResponseStream,
    {
        let identifier = operation.request_id().clone();
        let (sender, receiver) = mpsc::unbounded_channel();

        let state = {
            let mut registry = lock(&self.registry);
            if let Some(state) = registry.get(&identifier) {
                let mut entry = lock(state);
                entry.interest += 1;
                let replay = entry.history.iter().cloned().collect();
                entry.subscribers.push(sender);
                tracing::debug!(
                    operation = %operation.definition().name,
                    id = %identifier,
                    "joining in-flight request"
                );
                return RequestStream {
                    replay,
                    live: receiver,
                    guard: Some(InterestGuard {
                        registry: Arc::clone(&self.registry),
                        identifier,
                        state: Arc::clone(state),
                    }),
                    terminated: false,
                };
            }

            let state = Arc::new(Mutex::new(RequestState {
                history: Vec::new(),
                subscribers: vec![sender],
                interest: 1,
                done: false,
                driver: None,
            }));
            registry.insert(identifier.clone(), Arc::clone(&state));
            state
        };

        tracing::debug!(
            operation = %operation.definition().name,
            id = %identifier,
            "starting request"
        );
        let upstream = connect();
        let task = tokio::spawn(
            drive(
                upstream,
                Arc::clone(&self.registry),
                identifier.clone(),
                Arc::clone(&state),
            )
            .instrument(tracing::debug_span!(
                "in_flight_request",
                operation = %operation.definition().name
            )),
        );
        lock(&state).driver = Some(task.abort_handle());

        RequestStream {
            replay: VecDeque::new(),
            live: receiver,
            guard: Some(InterestGuard {
                registry: Arc::clone(&self.registry),
                identifier,
                state,
            }),
            terminated: false,
        }
    }

    /// Number of requests currently in flight.
    pub fn len(&self) -> usize {
        lock(&self.registry).len()
    }

    /// Whether no request is currently in flight.
    pub fn is_empty(&self) -> bool {
        lock(&self.registry).is_empty()
    }
}

/// Forward every upstream event to the subscribers, then tear the entry
/// down at the terminal event. If the task dies without reaching one, the
/// subscribers are told the request was interrupted.
async fn drive(
    mut upstream: graphql::ResponseStream,
    registry: Registry,
    identifier: RequestIdentifier,
    state: Arc<Mutex<RequestState>>,
) {
    let teardown = scopeguard::guard(
        (registry, identifier, Arc::clone(&state)),
        |(registry, identifier, state)| {
            finish(
                &registry,
                &identifier,
                &state,
                Some(Err(FetchError::RequestInterrupted)),
            );
        },
    );

    while let Some(event) = upstream.next().await {
        match event {
            Ok(payload) => {
                let mut entry = lock(&state);
                entry.history.push(Ok(payload.clone()));
                entry
                    .subscribers
                    .retain(|subscriber| subscriber.send(Ok(payload.clone())).is_ok());
            }
            Err(error) => {
                let (registry, identifier, state) = scopeguard::ScopeGuard::into_inner(teardown);
                finish(&registry, &identifier, &state, Some(Err(error)));
                return;
            }
        }
    }

    let (registry, identifier, state) = scopeguard::ScopeGuard::into_inner(teardown);
    finish(&registry, &identifier, &state, None);
}

/// Mark the request done, deliver the terminal event if there is one, and
/// drop the entry from the table. De-duplication for this identity ends
/// here: the registry removal and the terminal delivery happen under the
/// same locks, so no subscriber can attach to a finished request.
fn finish(
    registry: &Mutex<HashMap<RequestIdentifier, Arc<Mutex<RequestState>>>>,
    identifier: &RequestIdentifier,
    state: &Arc<Mutex<RequestState>>,
    terminal: Option<RequestEvent>,
) {
    let mut registry = lock(registry);
    let mut entry = lock(state);
    if entry.done {
        return;
    }
    entry.done = true;
    entry.driver = None;
    if let Some(event) = terminal {
        for subscriber in &entry.subscribers {
            let _ = subscriber.send(event.clone());
        }
    }
    entry.subscribers.clear();
    if let Some(current) = registry.get(identifier) {
        if Arc::ptr_eq(current, state) {
            registry.remove(identifier);
        }
    }
    tracing::trace!(id = %identifier, "request no longer in flight");
}

struct InterestGuard {
    registry: Registry,
    identifier: RequestIdentifier,
    state: Arc<Mutex<RequestState>>,
}

impl Drop for InterestGuard {
    fn drop(&mut self) {
        let mut registry = lock(&self.registry);
        let mut entry = lock(&self.state);
        entry.interest = entry.interest.saturating_sub(1);
        if entry.interest > 0 || entry.done {
            return;
        }
        entry.done = true;
        entry.subscribers.clear();
        if let Some(driver) = entry.driver.take() {
            driver.abort();
        }
        if let Some(current) = registry.get(&self.identifier) {
            if Arc::ptr_eq(current, &self.state) {
                registry.remove(&self.identifier);
            }
        }
        tracing::debug!(
            id = %self.identifier,
            "last subscriber left, cancelling request"
        );
    }
}

/// One subscriber's stream over a shared in-flight request.
///
/// Payloads the request produced before this subscriber attached are
/// replayed first, then live events follow. The stream ends after the
/// request completes or yields its error. Dropping the stream releases the
/// subscriber's interest; when the last interested subscriber goes away
/// mid-flight, the underlying request is cancelled.
pub struct RequestStream {
    replay: VecDeque<RequestEvent>,
    live: mpsc::UnboundedReceiver<RequestEvent>,
    guard: Option<InterestGuard>,
    terminated: bool,
}

impl RequestStream {
    fn finish(&mut self) {
        self.terminated = true;
        self.guard = None;
    }
}

impl Stream for RequestStream {
    type Item = RequestEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.terminated {
            return Poll::Ready(None);
        }
        if let Some(event) = this.replay.pop_front() {
            if event.is_err() {
                this.finish();
            }
            return Poll::Ready(Some(event));
        }
        match this.live.poll_recv(cx) {
            Poll::Ready(Some(event)) => {
                if event.is_err() {
                    this.finish();
                }
                Poll::Ready(Some(event))
            }
            Poll::Ready(None) => {
                this.finish();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

assert_impl_all!(RequestStream: Send);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().expect("lock poisoned")
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use futures::stream;
    use serde_json_bytes::json;
    use test_log::test;
    use tokio::time::timeout;

    use super::*;
    use crate::operation::QueryDefinition;

    fn ping_operation() -> OperationDescriptor {
        OperationDescriptor::new(
            QueryDefinition::builder()
                .name("Ping")
                .text("query Ping { ping }")
                .build(),
            crate::graphql::Object::new(),
        )
    }

    fn payload(name: &str) -> graphql::Response {
        graphql::Response::builder().data(json!({"ping": name})).build()
    }

    async fn next_event(stream: &mut RequestStream) -> Option<RequestEvent> {
        timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("stream made no progress")
    }

    #[test(tokio::test)]
    async fn replays_history_to_late_subscribers() {
        let table = InFlightRequests::default();
        let operation = ping_operation();
        let (sender, mut receiver) = mpsc::unbounded_channel::<RequestEvent>();

        let mut first = table.subscribe(&operation, || {
            Box::pin(stream::unfold(receiver, |mut receiver| async move {
                receiver.recv().await.map(|event| (event, receiver))
            }))
        });

        sender.send(Ok(payload("a"))).unwrap();
        assert_eq!(next_event(&mut first).await, Some(Ok(payload("a"))));

        let mut second = table.subscribe(&operation, || unreachable!("request must be shared"));
        assert_eq!(table.len(), 1);
        assert_eq!(next_event(&mut second).await, Some(Ok(payload("a"))));

        sender.send(Ok(payload("b"))).unwrap();
        assert_eq!(next_event(&mut first).await, Some(Ok(payload("b"))));
        assert_eq!(next_event(&mut second).await, Some(Ok(payload("b"))));

        drop(sender);
        assert_eq!(next_event(&mut first).await, None);
        assert_eq!(next_event(&mut second).await, None);
        assert!(table.is_empty());
    }

    #[test(tokio::test)]
    async fn an_error_event_ends_the_request_for_every_subscriber() {
        let table = InFlightRequests::default();
        let operation = ping_operation();

        let mut first = table.subscribe(&operation, || {
            Box::pin(stream::iter(vec![Err(FetchError::RequestFailed {
                status_code: Some(500),
                reason: "boom".to_string(),
            })]))
        });

        let event = next_event(&mut first).await;
        assert!(matches!(event, Some(Err(FetchError::RequestFailed { .. }))));
        assert_eq!(next_event(&mut first).await, None);
        assert!(table.is_empty());
    }

    #[test(tokio::test)]
    async fn dropping_the_last_subscriber_cancels_the_upstream() {
        struct Canary(Arc<AtomicUsize>);
        impl Drop for Canary {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let dropped = Arc::new(AtomicUsize::new(0));
        let table = InFlightRequests::default();
        let operation = ping_operation();

        let canary = Canary(Arc::clone(&dropped));
        let subscriber = table.subscribe(&operation, move || {
            Box::pin(stream::unfold(canary, |canary| async move {
                std::future::pending::<()>().await;
                drop(canary);
                None
            }))
        });
        assert_eq!(table.len(), 1);

        drop(subscriber);
        assert!(table.is_empty());

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while dropped.load(Ordering::SeqCst) == 0 {
            assert!(
                tokio::time::Instant::now() < deadline,
                "upstream was never dropped"
            );
            tokio::task::yield_now().await;
        }
    }
}
