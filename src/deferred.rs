//! The deferred-value state machine: settlement, chaining, and awaiting.

use std::fmt;
use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use crate::queue::TaskQueue;
use crate::{Error, Step};

pub(crate) type Observer<T, E> = Box<dyn FnOnce(Result<T, E>) + Send>;

/// The consumer half of a deferred value.
///
/// Settles at most once, to either a success payload or a failure reason,
/// and hands that outcome to every observer exactly once on a later turn of
/// its [`TaskQueue`]. Clones share the same underlying value.
///
/// # Examples
///
/// ```
/// use deferred_out::{Deferred, TaskQueue};
/// use futures::executor::block_on;
/// use std::thread;
///
/// let queue = TaskQueue::new();
/// let (settler, value) = Deferred::<String, String>::new(&queue);
/// let consumer = thread::spawn(move || block_on(value));
/// settler.fulfill("done".into());
/// assert_eq!(consumer.join().unwrap(), Ok("done".into()));
/// ```
pub struct Deferred<T, E> {
    inner: Arc<Mutex<Inner<T, E>>>,
    queue: TaskQueue,
}

/// The producer half of a deferred value.
///
/// Settlement is write-once: the first `fulfill`/`reject`/`resolve` wins and
/// every later call is a silent no-op. Clones settle the same value; when
/// the last clone is dropped without settling, the value is abandoned and
/// waiting tasks observe [`Error::Abandoned`].
pub struct Settler<T, E> {
    inner: Arc<Mutex<Inner<T, E>>>,
    queue: TaskQueue,
}

struct Inner<T, E> {
    state: State<T, E>,
    producers: usize,
    observed: bool,
}

enum State<T, E> {
    Pending {
        observers: Vec<Observer<T, E>>,
        wakers: Vec<Waker>,
    },
    Settled(Result<T, E>),
    Abandoned,
}

impl<T, E> Inner<T, E> {
    fn state_name(&self) -> &'static str {
        match &self.state {
            State::Pending { .. } => "pending",
            State::Settled(Ok(_)) => "fulfilled",
            State::Settled(Err(_)) => "rejected",
            State::Abandoned => "abandoned",
        }
    }
}

impl<T, E> Deferred<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Create a pending deferred value and the settler that will settle it.
    ///
    /// # Examples
    ///
    /// ```
    /// use deferred_out::{Deferred, TaskQueue};
    ///
    /// let queue = TaskQueue::new();
    /// let (settler, value) = Deferred::<String, String>::new(&queue);
    /// settler.fulfill("ready".into());
    /// assert_eq!(value.settlement(), Some(Ok("ready".into())));
    /// ```
    pub fn new(queue: &TaskQueue) -> (Settler<T, E>, Self) {
        let inner = Arc::new(Mutex::new(Inner {
            state: State::Pending {
                observers: Vec::new(),
                wakers: Vec::new(),
            },
            producers: 1,
            observed: false,
        }));
        let settler = Settler {
            inner: inner.clone(),
            queue: queue.clone(),
        };
        let deferred = Deferred {
            inner,
            queue: queue.clone(),
        };
        (settler, deferred)
    }

    /// Run `executor` synchronously with a settler for the new value.
    ///
    /// An `Err` return rejects the value, unless the executor already
    /// settled it.
    pub fn create<F>(queue: &TaskQueue, executor: F) -> Self
    where
        F: FnOnce(Settler<T, E>) -> Result<(), E>,
    {
        let (settler, deferred) = Self::new(queue);
        if let Err(reason) = executor(settler.clone()) {
            settler.reject(reason);
        }
        deferred
    }

    /// An already-fulfilled value.
    pub fn fulfilled(queue: &TaskQueue, value: T) -> Self {
        Self::resolved(queue, Step::Value(value))
    }

    /// An already-rejected value. The reason is stored as-is, never adopted.
    pub fn rejected(queue: &TaskQueue, reason: E) -> Self {
        let (settler, deferred) = Self::new(queue);
        settler.reject(reason);
        deferred
    }

    /// Wrap a [`Step`]: a payload or failure settles the new value at once,
    /// while a deferred input yields a value that adopts its eventual
    /// outcome.
    pub fn resolved(queue: &TaskQueue, step: Step<T, E>) -> Self {
        let (settler, deferred) = Self::new(queue);
        settler.resolve(step);
        deferred
    }

    /// Snapshot of the outcome. `None` while pending or abandoned.
    pub fn settlement(&self) -> Option<Result<T, E>> {
        match &self.inner.lock().unwrap().state {
            State::Settled(outcome) => Some(outcome.clone()),
            _ => None,
        }
    }

    /// Derive a new deferred value from this one's eventual settlement.
    ///
    /// Once this value settles, the matching handler runs on a later queue
    /// turn and its [`Step`] settles the derived value, with a deferred
    /// return adopted the same way [`Settler::resolve`] adopts one.
    /// Handlers are never invoked synchronously with the call to `chain`,
    /// even when this value has already settled.
    ///
    /// # Examples
    ///
    /// ```
    /// use deferred_out::{Deferred, Step, TaskQueue};
    /// use futures::executor::block_on;
    ///
    /// let queue = TaskQueue::new();
    /// let value = Deferred::<i32, String>::fulfilled(&queue, 2);
    /// let tripled = value.chain(|n| Step::Value(n * 3), Step::Fail);
    /// queue.run_until_idle();
    /// assert_eq!(block_on(tripled), Ok(6));
    /// ```
    pub fn chain<U, F, R>(&self, on_fulfilled: F, on_rejected: R) -> Deferred<U, E>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Step<U, E> + Send + 'static,
        R: FnOnce(E) -> Step<U, E> + Send + 'static,
    {
        let (settler, derived) = Deferred::new(&self.queue);
        self.observe(Box::new(move |outcome| {
            let step = match outcome {
                Ok(value) => on_fulfilled(value),
                Err(reason) => on_rejected(reason),
            };
            settler.resolve(step);
        }));
        derived
    }

    /// Success-only chaining; a rejection tunnels through unchanged.
    pub fn chain_fulfilled<U, F>(&self, on_fulfilled: F) -> Deferred<U, E>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Step<U, E> + Send + 'static,
    {
        self.chain(on_fulfilled, Step::Fail)
    }

    /// Failure-only chaining; a fulfillment tunnels through unchanged.
    pub fn recover<R>(&self, on_rejected: R) -> Deferred<T, E>
    where
        R: FnOnce(E) -> Step<T, E> + Send + 'static,
    {
        self.chain(Step::Value, on_rejected)
    }

    pub(crate) fn observe(&self, observer: Observer<T, E>) {
        let mut inner = self.inner.lock().unwrap();
        inner.observed = true;
        match &mut inner.state {
            State::Pending { observers, .. } => observers.push(observer),
            State::Settled(outcome) => {
                let outcome = outcome.clone();
                drop(inner);
                self.queue.defer(move || observer(outcome));
            }
            // An abandoned value never settles; dropping the observer
            // releases any settler it holds, abandoning derived values in
            // turn.
            State::Abandoned => {
                drop(inner);
                drop(observer);
            }
        }
    }
}

impl<T, E> Settler<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Settle with a success payload. No-op once settled.
    pub fn fulfill(&self, value: T) {
        self.settle(Ok(value));
    }

    /// Settle with a failure reason. No-op once settled.
    pub fn reject(&self, reason: E) {
        self.settle(Err(reason));
    }

    /// Settle from a [`Step`]. A payload or failure settles directly; a
    /// deferred value is adopted, and this settler fires with its eventual
    /// outcome instead.
    pub fn resolve(&self, step: Step<T, E>) {
        match step {
            Step::Value(value) => self.settle(Ok(value)),
            Step::Fail(reason) => self.settle(Err(reason)),
            Step::Deferred(other) => {
                let settler = self.clone();
                other.observe(Box::new(move |outcome| settler.settle(outcome)));
            }
        }
    }

    pub(crate) fn settle(&self, outcome: Result<T, E>) {
        let mut inner = self.inner.lock().unwrap();
        match mem::replace(&mut inner.state, State::Settled(outcome.clone())) {
            State::Pending { observers, wakers } => {
                drop(inner);
                for observer in observers {
                    let outcome = outcome.clone();
                    self.queue.defer(move || observer(outcome));
                }
                for waker in wakers {
                    waker.wake();
                }
            }
            // Settlement is write-once; a later attempt restores the first.
            prior => inner.state = prior,
        }
    }
}

impl<T, E> Clone for Deferred<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            queue: self.queue.clone(),
        }
    }
}

impl<T, E> Clone for Settler<T, E> {
    fn clone(&self) -> Self {
        self.inner.lock().unwrap().producers += 1;
        Self {
            inner: self.inner.clone(),
            queue: self.queue.clone(),
        }
    }
}

impl<T, E> Drop for Settler<T, E> {
    fn drop(&mut self) {
        let mut inner = self.inner.lock().unwrap();
        inner.producers -= 1;
        if inner.producers > 0 {
            return;
        }
        match mem::replace(&mut inner.state, State::Abandoned) {
            State::Pending { observers, wakers } => {
                drop(inner);
                drop(observers);
                for waker in wakers {
                    waker.wake();
                }
            }
            settled => inner.state = settled,
        }
    }
}

impl<T, E> Future for Deferred<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    type Output = Result<T, Error<E>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut inner = self.inner.lock().unwrap();
        inner.observed = true;
        match &mut inner.state {
            State::Pending { wakers, .. } => {
                wakers.push(cx.waker().clone());
                Poll::Pending
            }
            State::Settled(Ok(value)) => Poll::Ready(Ok(value.clone())),
            State::Settled(Err(reason)) => Poll::Ready(Err(Error::Rejected(reason.clone()))),
            State::Abandoned => Poll::Ready(Err(Error::Abandoned)),
        }
    }
}

impl<T, E> Drop for Inner<T, E> {
    fn drop(&mut self) {
        if self.observed {
            return;
        }
        if let State::Settled(Err(_)) = &self.state {
            tracing::warn!(
                reason = std::any::type_name::<E>(),
                "deferred value dropped with an unobserved rejection"
            );
        }
    }
}

impl<T, E> fmt::Debug for Deferred<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred")
            .field("state", &self.inner.lock().unwrap().state_name())
            .finish()
    }
}

impl<T, E> fmt::Debug for Settler<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settler")
            .field("state", &self.inner.lock().unwrap().state_name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::Deferred;
    use crate::{Error, Step, TaskQueue};
    use futures::executor::block_on;
    use std::sync::{Arc, Mutex};
    use std::thread;

    #[test]
    fn settlement_is_write_once() {
        let queue = TaskQueue::new();
        let (settler, value) = Deferred::<i32, String>::new(&queue);
        settler.fulfill(1);
        settler.fulfill(2);
        settler.reject("late".to_string());
        assert_eq!(value.settlement(), Some(Ok(1)));
    }

    #[test]
    fn observers_run_on_a_later_turn() {
        let queue = TaskQueue::new();
        let value = Deferred::<i32, String>::fulfilled(&queue, 7);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let in_handler = seen.clone();
        let derived = value.chain_fulfilled(move |n| {
            in_handler.lock().unwrap().push(format!("handler {n}"));
            Step::Value(n)
        });
        seen.lock().unwrap().push("registered".to_string());
        queue.run_until_idle();
        assert_eq!(*seen.lock().unwrap(), ["registered", "handler 7"]);
        assert_eq!(derived.settlement(), Some(Ok(7)));
    }

    #[test]
    fn observers_fire_in_registration_order() {
        let queue = TaskQueue::new();
        let (settler, value) = Deferred::<i32, String>::new(&queue);
        let seen = Arc::new(Mutex::new(Vec::new()));
        for label in ["a", "b", "c"] {
            let seen = seen.clone();
            let _ = value.chain_fulfilled(move |n| {
                seen.lock().unwrap().push(label);
                Step::Value(n)
            });
        }
        settler.fulfill(0);
        queue.run_until_idle();
        assert_eq!(*seen.lock().unwrap(), ["a", "b", "c"]);
    }

    #[test]
    fn settlement_without_observers_schedules_nothing() {
        let queue = TaskQueue::new();
        let (settler, value) = Deferred::<i32, String>::new(&queue);
        settler.fulfill(1);
        assert!(queue.is_idle());
        assert_eq!(value.settlement(), Some(Ok(1)));
    }

    #[test]
    fn chain_propagates_through_links() {
        let queue = TaskQueue::new();
        let (settler, value) = Deferred::<i32, String>::new(&queue);
        let result = value
            .chain_fulfilled(|n| Step::Value(n + 1))
            .chain_fulfilled(|n| Step::Value(n * 2));
        settler.fulfill(3);
        queue.run_until_idle();
        assert_eq!(result.settlement(), Some(Ok(8)));
    }

    #[test]
    fn rejection_tunnels_until_recovered() {
        let queue = TaskQueue::new();
        let result = Deferred::<String, String>::rejected(&queue, "boom".to_string())
            .chain_fulfilled(Step::Value)
            .recover(|reason| Step::Value(reason + "!"));
        queue.run_until_idle();
        assert_eq!(result.settlement(), Some(Ok("boom!".to_string())));
    }

    #[test]
    fn chain_on_rejected_runs_the_failure_handler() {
        let queue = TaskQueue::new();
        let result = Deferred::<i32, String>::rejected(&queue, "no".to_string())
            .chain(Step::Value, |reason| Step::Fail(reason.to_uppercase()));
        queue.run_until_idle();
        assert_eq!(result.settlement(), Some(Err("NO".to_string())));
    }

    #[test]
    fn resolve_adopts_a_deferred_value() {
        let queue = TaskQueue::new();
        let (inner_settler, inner) = Deferred::<i32, String>::new(&queue);
        let (outer_settler, outer) = Deferred::<i32, String>::new(&queue);
        outer_settler.resolve(Step::Deferred(inner));
        queue.run_until_idle();
        assert_eq!(outer.settlement(), None);
        inner_settler.fulfill(42);
        queue.run_until_idle();
        assert_eq!(outer.settlement(), Some(Ok(42)));
    }

    #[test]
    fn handler_returning_a_deferred_is_adopted() {
        let queue = TaskQueue::new();
        let (late_settler, late) = Deferred::<i32, String>::new(&queue);
        let handoff = late.clone();
        let result = Deferred::<i32, String>::fulfilled(&queue, 1)
            .chain_fulfilled(move |_| Step::Deferred(handoff));
        queue.run_until_idle();
        assert_eq!(result.settlement(), None);
        late_settler.fulfill(5);
        queue.run_until_idle();
        assert_eq!(result.settlement(), Some(Ok(5)));
    }

    #[test]
    fn executor_error_rejects() {
        let queue = TaskQueue::new();
        let value: Deferred<i32, String> =
            Deferred::create(&queue, |_settler| Err("broken".to_string()));
        assert_eq!(value.settlement(), Some(Err("broken".to_string())));
    }

    #[test]
    fn executor_error_after_settling_is_ignored() {
        let queue = TaskQueue::new();
        let value: Deferred<i32, String> = Deferred::create(&queue, |settler| {
            settler.fulfill(9);
            Err("ignored".to_string())
        });
        assert_eq!(value.settlement(), Some(Ok(9)));
    }

    #[test]
    fn awaits_a_value_settled_from_another_thread() {
        let queue = TaskQueue::new();
        let (settler, value) = Deferred::<String, String>::new(&queue);
        let consumer = thread::spawn(move || block_on(value));
        let producer = thread::spawn(move || settler.fulfill("ready".to_string()));
        producer.join().expect("The producer thread has panicked");
        assert_eq!(
            consumer.join().expect("The consumer thread has panicked"),
            Ok("ready".to_string())
        );
    }

    #[test]
    fn await_reports_rejection() {
        let queue = TaskQueue::new();
        let value = Deferred::<i32, String>::rejected(&queue, "denied".to_string());
        assert_eq!(block_on(value), Err(Error::Rejected("denied".to_string())));
    }

    #[test]
    fn dropped_settler_abandons_waiters() {
        let queue = TaskQueue::new();
        let (settler, value) = Deferred::<i32, String>::new(&queue);
        drop(settler);
        assert_eq!(block_on(value), Err(Error::Abandoned));
    }

    #[test]
    fn abandonment_cascades_to_derived_values() {
        let queue = TaskQueue::new();
        let (settler, value) = Deferred::<i32, String>::new(&queue);
        let derived = value.chain_fulfilled(Step::Value);
        drop(settler);
        assert_eq!(block_on(derived), Err(Error::Abandoned));
    }

    #[test]
    fn cloned_settlers_keep_the_value_alive() {
        let queue = TaskQueue::new();
        let (settler, value) = Deferred::<i32, String>::new(&queue);
        let keeper = settler.clone();
        drop(settler);
        assert_eq!(value.settlement(), None);
        keeper.fulfill(11);
        assert_eq!(value.settlement(), Some(Ok(11)));
    }
}
