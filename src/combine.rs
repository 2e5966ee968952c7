//! Combinators over groups of deferred values.

use std::sync::{Arc, Mutex};

use crate::deferred::{Deferred, Settler};
use crate::queue::TaskQueue;
use crate::Step;

struct Gather<T> {
    results: Vec<Option<T>>,
    fulfilled: usize,
}

impl<T, E> Deferred<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Combine every source into one deferred `Vec`.
    ///
    /// Fulfills with the results in input order once the last source has
    /// fulfilled, or rejects with the first rejection in settlement order;
    /// after that, settlements of the remaining sources have no further
    /// effect. Payload and failure inputs count as already-settled sources.
    /// An empty input fulfills immediately with an empty `Vec`.
    ///
    /// # Examples
    ///
    /// ```
    /// use deferred_out::{Deferred, Step, TaskQueue};
    ///
    /// let queue = TaskQueue::new();
    /// let (settler, slow) = Deferred::<i32, String>::new(&queue);
    /// let combined = Deferred::all(&queue, vec![Step::Value(1), Step::Deferred(slow)]);
    ///
    /// settler.fulfill(2);
    /// queue.run_until_idle();
    /// assert_eq!(combined.settlement(), Some(Ok(vec![1, 2])));
    /// ```
    pub fn all(queue: &TaskQueue, sources: Vec<Step<T, E>>) -> Deferred<Vec<T>, E> {
        let (settler, combined) = Deferred::new(queue);
        if sources.is_empty() {
            settler.fulfill(Vec::new());
            return combined;
        }
        let slots = Arc::new(Mutex::new(Gather {
            results: (0..sources.len()).map(|_| None).collect(),
            fulfilled: 0,
        }));
        for (index, source) in sources.into_iter().enumerate() {
            match source {
                Step::Value(value) => record(&slots, &settler, index, value),
                Step::Fail(reason) => settler.reject(reason),
                Step::Deferred(source) => {
                    let slots = slots.clone();
                    let settler = settler.clone();
                    source.observe(Box::new(move |outcome| match outcome {
                        Ok(value) => record(&slots, &settler, index, value),
                        Err(reason) => settler.reject(reason),
                    }));
                }
            }
        }
        combined
    }

    /// Settle with the outcome of whichever source settles first, fulfilled
    /// or rejected; every later settlement is ignored.
    ///
    /// Payload and failure inputs count as already settled, so the earliest
    /// of them wins over any still-pending deferred input. An empty input
    /// yields a value that never settles; awaiting it reports
    /// [`Error::Abandoned`](crate::Error::Abandoned).
    pub fn first_settled(queue: &TaskQueue, sources: Vec<Step<T, E>>) -> Deferred<T, E> {
        let (settler, first) = Deferred::new(queue);
        for source in sources {
            match source {
                Step::Value(value) => settler.fulfill(value),
                Step::Fail(reason) => settler.reject(reason),
                Step::Deferred(source) => {
                    let settler = settler.clone();
                    source.observe(Box::new(move |outcome| settler.settle(outcome)));
                }
            }
        }
        first
    }
}

fn record<T, E>(
    slots: &Arc<Mutex<Gather<T>>>,
    settler: &Settler<Vec<T>, E>,
    index: usize,
    value: T,
) where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    let mut gather = slots.lock().unwrap();
    gather.results[index] = Some(value);
    gather.fulfilled += 1;
    if gather.fulfilled == gather.results.len() {
        let results = gather.results.drain(..).flatten().collect();
        drop(gather);
        settler.fulfill(results);
    }
}
