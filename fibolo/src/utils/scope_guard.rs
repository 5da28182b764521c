/// Runs a closure when dropped, unless disarmed first.
///
/// Used for rollbacks on early returns, e.g. closing a freshly created socket
/// when a later setup step fails.
pub(crate) struct ScopeGuard<F: FnOnce()> {
    // Taken on drop or disarm so the closure runs at most once.
    closure: Option<F>,
}

impl<F: FnOnce()> ScopeGuard<F> {
    pub(crate) fn new(closure: F) -> Self {
        ScopeGuard {
            closure: Some(closure),
        }
    }

    pub(crate) fn disarm(&mut self) {
        self.closure.take();
    }
}

impl<F: FnOnce()> Drop for ScopeGuard<F> {
    fn drop(&mut self) {
        if let Some(closure) = self.closure.take() {
            closure();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_runs_on_drop() {
        let hit = Cell::new(0);
        {
            let _guard = ScopeGuard::new(|| hit.set(hit.get() + 1));
        }
        assert_eq!(hit.get(), 1);
    }

    #[test]
    fn test_disarmed_guard_does_nothing() {
        let hit = Cell::new(false);
        {
            let mut guard = ScopeGuard::new(|| hit.set(true));
            guard.disarm();
        }
        assert!(!hit.get());
    }
}
