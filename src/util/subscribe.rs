use std::sync::Arc;

pub type NextFn<T> = Arc<dyn Fn(&T) + Send + Sync + 'static>;
pub type ErrorFn<E> = Arc<dyn Fn(&E) + Send + Sync + 'static>;
pub type CompleteFn = Arc<dyn Fn() + Send + Sync + 'static>;

/// Receiver of a stream of values that may end in an error or complete.
///
/// Every method has a no-op default so implementors only override what they
/// care about.
pub trait Observer<T, E>: Send + Sync {
    fn next(&self, _value: &T) {}

    fn error(&self, _error: &E) {}

    fn complete(&self) {}
}

/// Closure-based [`Observer`] assembled with a builder.
pub struct PartialObserver<T, E> {
    pub next: Option<NextFn<T>>,
    pub error: Option<ErrorFn<E>>,
    pub complete: Option<CompleteFn>,
}

impl<T, E> PartialObserver<T, E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_next<F>(mut self, callback: F) -> Self
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.next = Some(Arc::new(callback));
        self
    }

    pub fn with_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.error = Some(Arc::new(callback));
        self
    }

    pub fn with_complete<F>(mut self, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.complete = Some(Arc::new(callback));
        self
    }
}

impl<T, E> Default for PartialObserver<T, E> {
    fn default() -> Self {
        Self {
            next: None,
            error: None,
            complete: None,
        }
    }
}

impl<T, E> Clone for PartialObserver<T, E> {
    fn clone(&self) -> Self {
        Self {
            next: self.next.clone(),
            error: self.error.clone(),
            complete: self.complete.clone(),
        }
    }
}

impl<T, E> Observer<T, E> for PartialObserver<T, E>
where
    T: 'static,
    E: 'static,
{
    fn next(&self, value: &T) {
        if let Some(callback) = &self.next {
            callback(value);
        }
    }

    fn error(&self, error: &E) {
        if let Some(callback) = &self.error {
            callback(error);
        }
    }

    fn complete(&self) {
        if let Some(callback) = &self.complete {
            callback();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn missing_callbacks_are_no_ops() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let observer: PartialObserver<u32, String> =
            PartialObserver::new().with_next(move |value| {
                counter.fetch_add(*value as usize, Ordering::SeqCst);
            });
        observer.next(&3);
        observer.error(&"ignored".to_string());
        observer.complete();
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }
}
