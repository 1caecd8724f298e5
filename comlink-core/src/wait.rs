//! Lock and condvar helpers where a zero timeout means "wait indefinitely".

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Lock a mutex, recovering the guard if another thread panicked while holding it.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Wait on `cv` while `condition` holds. Returns the guard and whether the wait timed out.
pub(crate) fn wait_while<'a, T, F>(
    cv: &Condvar,
    guard: MutexGuard<'a, T>,
    timeout: Duration,
    condition: F,
) -> (MutexGuard<'a, T>, bool)
where
    F: FnMut(&mut T) -> bool,
{
    if timeout.is_zero() {
        let guard = cv
            .wait_while(guard, condition)
            .unwrap_or_else(PoisonError::into_inner);
        (guard, false)
    } else {
        let (guard, result) = cv
            .wait_timeout_while(guard, timeout, condition)
            .unwrap_or_else(PoisonError::into_inner);
        (guard, result.timed_out())
    }
}

/// Deadline helper for loops that wait several times against one budget.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Deadline(Option<Instant>);

impl Deadline {
    pub(crate) fn after(timeout: Duration) -> Self {
        if timeout.is_zero() {
            Deadline(None)
        } else {
            Deadline(Some(Instant::now() + timeout))
        }
    }

    pub(crate) fn expired(&self) -> bool {
        matches!(self.0, Some(at) if Instant::now() >= at)
    }

    /// Time left, or zero (indefinite) if there is no deadline. Never returns zero for an
    /// expired deadline; callers check [`Deadline::expired`] first.
    pub(crate) fn remaining(&self) -> Duration {
        match self.0 {
            None => Duration::ZERO,
            Some(at) => at
                .saturating_duration_since(Instant::now())
                .max(Duration::from_millis(1)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn zero_timeout_waits_until_condition_clears() {
        let pair = Arc::new((Mutex::new(false), Condvar::new()));
        let p2 = pair.clone();
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            *lock(&p2.0) = true;
            p2.1.notify_all();
        });
        let (guard, timed_out) = wait_while(&pair.1, lock(&pair.0), Duration::ZERO, |ready| !*ready);
        assert!(*guard);
        assert!(!timed_out);
        drop(guard);
        t.join().unwrap();
    }

    #[test]
    fn bounded_wait_reports_timeout() {
        let pair = (Mutex::new(()), Condvar::new());
        let (guard, timed_out) = wait_while(&pair.1, lock(&pair.0), Duration::from_millis(10), |_| true);
        drop(guard);
        assert!(timed_out);
    }

    #[test]
    fn deadline_without_timeout_never_expires() {
        let d = Deadline::after(Duration::ZERO);
        assert!(!d.expired());
        assert!(d.remaining().is_zero());
        let d = Deadline::after(Duration::from_millis(1));
        thread::sleep(Duration::from_millis(5));
        assert!(d.expired());
    }
}
