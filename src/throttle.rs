//! Bounded-parallelism task runner.

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{Receiver, TryRecvError, channel};

use crate::error::ThrottleError;

/// A deferred unit of work. It is run at most once, either on whichever
/// rayon thread picks it up or on the calling thread.
pub type Task<'a, T, E> = Box<dyn FnOnce() -> Result<T, E> + Send + 'a>;

/// Runs `tasks` with at most `limit` of them outstanding at any time and
/// returns their results in input order, regardless of completion order.
///
/// The scheduler works as follows:
/// 1. The first `limit` tasks are spawned on the rayon pool.
/// 2. The calling thread waits for results on a channel. When it is itself a
///    rayon worker it keeps executing pool jobs while it waits, so that the
///    spawned tasks can make progress even on a single-thread pool.
/// 3. Each successful result is stored at its original index and the next
///    task that has not been started yet is spawned in its place.
///
/// The first failing task fails the whole call. Tasks that are already
/// running are not cancelled: the call returns once they settle, and their
/// results are discarded. No further tasks are started after a failure.
///
/// A panic inside a task is re-raised on the calling thread.
pub fn throttle_all<'a, T, E>(
    limit: usize,
    tasks: Vec<Task<'a, T, E>>,
) -> Result<Vec<T>, ThrottleError<E>>
where
    T: Send + 'a,
    E: Send + 'a,
{
    if limit == 0 {
        return Err(ThrottleError::InvalidLimit(limit));
    }

    let total = tasks.len();
    let mut results: Vec<Option<T>> = std::iter::repeat_with(|| None).take(total).collect();
    let mut failure = None;
    let mut panicked = None;

    let mut pending = tasks.into_iter().enumerate();

    rayon::in_place_scope(|s| {
        let (sender, receiver) = channel();

        let spawn = |(index, task): (usize, Task<'a, T, E>)| {
            let sender = sender.clone();
            s.spawn(move |_| {
                let outcome = panic::catch_unwind(AssertUnwindSafe(task));
                // Receiver is gone only once the call has already failed.
                let _ = sender.send((index, outcome));
            });
        };

        let mut started = 0;
        for next in pending.by_ref().take(limit) {
            spawn(next);
            started += 1;
        }

        let mut settled = 0;
        while settled < started {
            let Some((index, outcome)) = receive(&receiver) else {
                break;
            };
            settled += 1;

            match outcome {
                Ok(Ok(value)) => {
                    results[index] = Some(value);

                    if failure.is_none()
                        && panicked.is_none()
                        && let Some(next) = pending.next()
                    {
                        spawn(next);
                        started += 1;
                    }
                }
                Ok(Err(error)) => {
                    failure.get_or_insert(ThrottleError::Task { index, error });
                }
                Err(payload) => {
                    panicked.get_or_insert(payload);
                }
            }
        }
    });

    if let Some(payload) = panicked {
        panic::resume_unwind(payload);
    }

    if let Some(failure) = failure {
        return Err(failure);
    }

    Ok(results.into_iter().flatten().collect())
}

/// Same contract as [`throttle_all`], but every task runs on the calling
/// thread, one after another in input order. Nothing is ever handed to the
/// rayon pool.
///
/// The first failing task fails the whole call, later tasks are not started.
pub fn throttle_local<'a, T, E>(
    limit: usize,
    tasks: Vec<Task<'a, T, E>>,
) -> Result<Vec<T>, ThrottleError<E>> {
    if limit == 0 {
        return Err(ThrottleError::InvalidLimit(limit));
    }

    let mut results = Vec::with_capacity(tasks.len());
    for (index, task) in tasks.into_iter().enumerate() {
        match task() {
            Ok(value) => results.push(value),
            Err(error) => return Err(ThrottleError::Task { index, error }),
        }
    }

    Ok(results)
}

/// Blocks for the next message. A rayon worker must never park here, as the
/// jobs it is waiting for may sit in its own local queue.
fn receive<M>(receiver: &Receiver<M>) -> Option<M> {
    if rayon::current_thread_index().is_none() {
        return receiver.recv().ok();
    }

    loop {
        match receiver.try_recv() {
            Ok(message) => return Some(message),
            Err(TryRecvError::Disconnected) => return None,
            Err(TryRecvError::Empty) => {
                if !matches!(rayon::yield_now(), Some(rayon::Yield::Executed)) {
                    std::thread::yield_now();
                }
            }
        }
    }
}
