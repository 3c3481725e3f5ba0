//! EventBus - 型付き publish/subscribe
//!
//! # 配送ルール
//! - `publish` は購読済みハンドラを登録順に同期的に呼ぶ
//! - 非同期ハンドラは tokio 上に spawn され、失敗はログに残すだけ
//! - 1 つのハンドラの失敗・panic が他のハンドラへの配送を止めることはない
//! - 購読者がいないイベントは黙って捨てる（配線前に publish されたものも同様）

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::{error, trace, warn};

use crate::domain::{Event, EventKind, HandlerError};

pub type HandlerFuture = BoxFuture<'static, Result<(), HandlerError>>;

type SyncHandler<T> = Arc<dyn Fn(&Event<T>) -> Result<(), HandlerError> + Send + Sync>;
type AsyncHandler<T> = Arc<dyn Fn(Event<T>) -> HandlerFuture + Send + Sync>;

enum Handler<T> {
    Sync(SyncHandler<T>),
    Async(AsyncHandler<T>),
}

impl<T> Clone for Handler<T> {
    fn clone(&self) -> Self {
        match self {
            Handler::Sync(f) => Handler::Sync(Arc::clone(f)),
            Handler::Async(f) => Handler::Async(Arc::clone(f)),
        }
    }
}

struct Registry<T> {
    handlers: Mutex<HashMap<EventKind, Vec<(u64, Handler<T>)>>>,
    next_id: AtomicU64,
}

/// Type-erased view of a registry so `Subscription` does not carry `T`.
trait Unsubscribe: Send + Sync {
    fn remove(&self, kind: EventKind, id: u64) -> bool;
}

impl<T: 'static> Unsubscribe for Registry<T> {
    fn remove(&self, kind: EventKind, id: u64) -> bool {
        let mut handlers = self.handlers.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(list) = handlers.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(handler_id, _)| *handler_id != id);
        before != list.len()
    }
}

/// Handle returned by `subscribe`. Dropping it does NOT unsubscribe.
pub struct Subscription {
    kind: EventKind,
    id: u64,
    registry: Weak<dyn Unsubscribe>,
}

impl Subscription {
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Returns whether the handler was still registered.
    pub fn unsubscribe(&self) -> bool {
        self.registry
            .upgrade()
            .is_some_and(|registry| registry.remove(self.kind, self.id))
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .finish()
    }
}

/// Cheap to clone; clones share the same subscribers.
pub struct EventBus<T> {
    registry: Arc<Registry<T>>,
}

impl<T> Clone for EventBus<T> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Default for EventBus<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync + 'static> EventBus<T> {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Registry {
                handlers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register a synchronous handler.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&Event<T>) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.register(kind, Handler::Sync(Arc::new(handler)))
    }

    /// Register a handler returning a pending operation. The operation is
    /// spawned on the current tokio runtime; its failure is logged.
    pub fn subscribe_async<F, Fut>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(Event<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let handler: AsyncHandler<T> = Arc::new(move |event| handler(event).boxed());
        self.register(kind, Handler::Async(handler))
    }

    fn register(&self, kind: EventKind, handler: Handler<T>) -> Subscription {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(kind)
            .or_default()
            .push((id, handler));

        let registry: Arc<dyn Unsubscribe> = self.registry.clone();
        Subscription {
            kind,
            id,
            registry: Arc::downgrade(&registry),
        }
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.registry
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .map_or(0, Vec::len)
    }

    /// Deliver `event` to every current subscriber of its kind.
    pub fn publish(&self, event: Event<T>) {
        let kind = event.kind();
        // snapshot so handlers may (un)subscribe or publish re-entrantly
        let handlers: Vec<Handler<T>> = self
            .registry
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .map(|list| list.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default();

        if handlers.is_empty() {
            trace!(event = %kind, "no subscribers, event dropped");
            return;
        }

        for handler in handlers {
            match handler {
                Handler::Sync(f) => match catch_unwind(AssertUnwindSafe(|| f(&event))) {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(event = %kind, error = %e, "event handler failed"),
                    Err(_) => error!(event = %kind, "event handler panicked"),
                },
                Handler::Async(f) => {
                    let future = match catch_unwind(AssertUnwindSafe(|| f(event.clone()))) {
                        Ok(future) => future,
                        Err(_) => {
                            error!(event = %kind, "event handler panicked");
                            continue;
                        }
                    };
                    match tokio::runtime::Handle::try_current() {
                        Ok(runtime) => {
                            runtime.spawn(async move {
                                if let Err(e) = future.await {
                                    warn!(event = %kind, error = %e, "async event handler failed");
                                }
                            });
                        }
                        Err(_) => {
                            warn!(event = %kind, "no tokio runtime, async handler skipped");
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EntityRef, EntityType, FrontId};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn deleted() -> Event<()> {
        Event::EntityDeleted {
            entity_type: EntityType::new("note"),
            target: EntityRef::new(FrontId::new("front-a")),
        }
    }

    #[test]
    fn handlers_run_in_subscription_order() {
        let bus = EventBus::<()>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for n in 0..3 {
            let seen = seen.clone();
            bus.subscribe(EventKind::EntityDeleted, move |_| {
                seen.lock().unwrap().push(n);
                Ok(())
            });
        }

        bus.publish(deleted());
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn only_matching_kind_is_delivered() {
        let bus = EventBus::<()>::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        bus.subscribe(EventKind::EntityCreated, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        bus.publish(deleted());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn failing_or_panicking_handler_does_not_block_others() {
        let bus = EventBus::<()>::new();
        let calls = Arc::new(AtomicUsize::new(0));

        bus.subscribe(EventKind::EntityDeleted, |_| {
            Err(HandlerError::Other("boom".to_string()))
        });
        bus.subscribe(EventKind::EntityDeleted, |_| panic!("handler bug"));
        let c = calls.clone();
        bus.subscribe(EventKind::EntityDeleted, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        bus.publish(deleted());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = EventBus::<()>::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let sub = bus.subscribe(EventKind::EntityDeleted, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        bus.publish(deleted());
        assert!(sub.unsubscribe());
        assert!(!sub.unsubscribe());
        bus.publish(deleted());

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(bus.subscriber_count(EventKind::EntityDeleted), 0);
    }

    #[test]
    fn publishing_without_subscribers_is_a_no_op() {
        let bus = EventBus::<()>::new();
        bus.publish(deleted());
        assert_eq!(bus.subscriber_count(EventKind::EntityDeleted), 0);
    }

    #[test]
    fn handlers_may_subscribe_while_being_called() {
        let bus = EventBus::<()>::new();
        let inner_bus = bus.clone();
        bus.subscribe(EventKind::EntityDeleted, move |_| {
            inner_bus.subscribe(EventKind::EntityCreated, |_| Ok(()));
            Ok(())
        });

        bus.publish(deleted());
        assert_eq!(bus.subscriber_count(EventKind::EntityCreated), 1);
    }

    #[tokio::test]
    async fn async_handler_failure_is_isolated() {
        let bus = EventBus::<()>::new();
        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = Arc::new(Mutex::new(Some(tx)));

        bus.subscribe_async(EventKind::EntityDeleted, |_| async {
            Err(HandlerError::Other("remote down".to_string()))
        });
        bus.subscribe_async(EventKind::EntityDeleted, move |event| {
            let tx = tx.clone();
            async move {
                if let Some(tx) = tx.lock().unwrap().take() {
                    let _ = tx.send(event.kind());
                }
                Ok(())
            }
        });

        bus.publish(deleted());
        let kind = tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(kind, EventKind::EntityDeleted);
    }
}
