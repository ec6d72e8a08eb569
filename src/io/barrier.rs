//! Join point for the sub-requests of one logical write.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};

type OnComplete = Box<dyn FnOnce(Result<()>) + Send + 'static>;

/// Counts down sub-request completions; the last arrival runs the
/// completion exactly once, with the first error seen (if any).
pub(crate) struct CompletionBarrier {
    remaining: AtomicUsize,
    first_error: Mutex<Option<Error>>,
    on_complete: Mutex<Option<OnComplete>>,
}

impl CompletionBarrier {
    /// A barrier over `parts` sub-requests. With zero parts the completion
    /// runs immediately.
    pub(crate) fn new<F>(parts: usize, on_complete: F) -> Arc<Self>
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let barrier = Arc::new(Self {
            remaining: AtomicUsize::new(parts),
            first_error: Mutex::new(None),
            on_complete: Mutex::new(Some(Box::new(on_complete))),
        });
        if parts == 0 {
            barrier.finish();
        }
        barrier
    }

    /// Record one sub-request completion.
    pub(crate) fn arrive(&self, result: Result<()>) {
        if let Err(error) = result {
            let mut first = self.first_error.lock();
            if first.is_none() {
                *first = Some(error);
            }
        }
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.finish();
        }
    }

    #[cfg(test)]
    pub(crate) fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    fn finish(&self) {
        let Some(on_complete) = self.on_complete.lock().take() else {
            return;
        };
        match self.first_error.lock().take() {
            Some(error) => on_complete(Err(error)),
            None => on_complete(Ok(())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::thread;

    #[test]
    fn test_last_arrival_completes() {
        let fired = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&fired);
        let barrier = CompletionBarrier::new(3, move |res| {
            assert!(res.is_ok());
            seen.fetch_add(1, Ordering::SeqCst);
        });

        barrier.arrive(Ok(()));
        barrier.arrive(Ok(()));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(barrier.remaining(), 1);
        barrier.arrive(Ok(()));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_first_error_wins() {
        let failed = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&failed);
        let barrier = CompletionBarrier::new(3, move |res| {
            *slot.lock() = res.err();
        });

        barrier.arrive(Err(Error::OutOfSpace));
        barrier.arrive(Ok(()));
        barrier.arrive(Err(Error::ShuttingDown));

        assert!(matches!(*failed.lock(), Some(Error::OutOfSpace)));
    }

    #[test]
    fn test_zero_parts_completes_immediately() {
        let fired = Arc::new(AtomicBool::new(false));
        let seen = Arc::clone(&fired);
        let _barrier = CompletionBarrier::new(0, move |_| seen.store(true, Ordering::SeqCst));
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_concurrent_arrivals_complete_once() {
        let fired = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&fired);
        let barrier = CompletionBarrier::new(64, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    for _ in 0..8 {
                        barrier.arrive(Ok(()));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
