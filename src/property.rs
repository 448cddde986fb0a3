use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, ThreadId};
use tokio::sync::mpsc;

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Observable single value.
///
/// Every subscriber sees the value current at subscription time first and
/// then every later `set`, in order. Handlers run on the thread calling
/// `set`; use [`Property::subscribe_channel`] to move delivery elsewhere.
pub struct Property<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    // Serializes deliveries so handlers observe values in set order.
    delivery: Mutex<()>,
    state: Mutex<State<T>>,
    writer: AtomicBool,
}

struct State<T> {
    value: T,
    handlers: BTreeMap<u64, Handler<T>>,
    next_id: u64,
    delivering: Option<ThreadId>,
}

impl<T> Clone for Property<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Property<T>
where
    T: Clone + Send + 'static,
{
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(Inner {
                delivery: Mutex::new(()),
                state: Mutex::new(State {
                    value,
                    handlers: BTreeMap::new(),
                    next_id: 0,
                    delivering: None,
                }),
                writer: AtomicBool::new(false),
            }),
        }
    }

    pub fn get(&self) -> T {
        lock(&self.inner.state).value.clone()
    }

    /// Replaces the value and hands it to every subscriber before returning.
    ///
    /// Must not be called from inside one of this property's handlers.
    pub fn set(&self, value: T) {
        let _delivery = self.inner.begin_delivery();
        let handlers = {
            let mut state = lock(&self.inner.state);
            state.value = value.clone();
            state
                .handlers
                .iter()
                .map(|(id, handler)| (*id, Arc::clone(handler)))
                .collect::<Vec<_>>()
        };
        for (id, handler) in handlers {
            // An earlier handler in this round may have cancelled this one.
            if self.inner.is_subscribed(id) {
                handler(&value);
            }
        }
    }

    #[must_use = "dropping the subscription cancels it"]
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let _delivery = self.inner.begin_delivery();
        let handler: Handler<T> = Arc::new(handler);
        let (id, current) = {
            let mut state = lock(&self.inner.state);
            let id = state.next_id;
            state.next_id += 1;
            state.handlers.insert(id, Arc::clone(&handler));
            (id, state.value.clone())
        };
        handler(&current);

        let weak: Weak<Inner<T>> = Arc::downgrade(&self.inner);
        Subscription {
            cancel: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.unsubscribe(id);
                }
            })),
        }
    }

    /// Subscribes through an unbounded channel so the consumer can receive
    /// values on its own task. The current value is already queued.
    pub fn subscribe_channel(&self) -> (Subscription, mpsc::UnboundedReceiver<T>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.subscribe(move |value: &T| {
            let _ = tx.send(value.clone());
        });
        (subscription, rx)
    }

    /// Claims exclusive write ownership. Returns `None` when another writer
    /// already holds the claim.
    pub fn claim_writer(&self) -> Option<WriterClaim> {
        self.inner
            .writer
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        let inner = Arc::clone(&self.inner);
        Some(WriterClaim {
            release: Some(Box::new(move || {
                inner.writer.store(false, Ordering::Release);
            })),
        })
    }
}

impl<T> Inner<T> {
    fn begin_delivery(&self) -> Delivery<'_, T> {
        let guard = lock(&self.delivery);
        lock(&self.state).delivering = Some(thread::current().id());
        Delivery {
            inner: self,
            _guard: guard,
        }
    }

    fn is_subscribed(&self, id: u64) -> bool {
        lock(&self.state).handlers.contains_key(&id)
    }

    /// Removes a handler. Off the delivering thread this waits for the
    /// delivery in progress, so the handler never runs after it returns.
    fn unsubscribe(&self, id: u64) {
        let current = thread::current().id();
        let mut state = lock(&self.state);
        if state.delivering == Some(current) {
            state.handlers.remove(&id);
            return;
        }
        drop(state);
        let _delivery = lock(&self.delivery);
        lock(&self.state).handlers.remove(&id);
    }
}

/// Held while handlers run; records the delivering thread.
struct Delivery<'a, T> {
    inner: &'a Inner<T>,
    _guard: MutexGuard<'a, ()>,
}

impl<T> Drop for Delivery<'_, T> {
    fn drop(&mut self) {
        lock(&self.inner.state).delivering = None;
    }
}

impl<T> std::fmt::Debug for Property<T>
where
    T: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.inner.state);
        f.debug_struct("Property")
            .field("value", &state.value)
            .field("subscribers", &state.handlers.len())
            .finish()
    }
}

/// Cancellation token returned by [`Property::subscribe`].
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// The handler is not invoked after this returns. Called from another
    /// thread while a `set` is delivering, it waits for that delivery.
    pub fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Exclusive write ownership of a property, released on drop.
pub struct WriterClaim {
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Drop for WriterClaim {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
