//! Observable variables with change notification.
//!
//! A [`Var`] holds a value and a wakeup token. Readers receive the current
//! value together with a token that is cancelled by the next `set`, so a
//! reader that re-reads after the token fires observes every transition made
//! after its read. Rapid intervening sets coalesce; only the latest value is
//! observable after a wakeup.

use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

/// A single value cell with change notification.
#[derive(Debug)]
pub struct Var<T> {
    state: Mutex<State<T>>,
}

#[derive(Debug)]
struct State<T> {
    value: T,
    wake: CancellationToken,
}

impl<T: Clone> Var<T> {
    /// A variable pre-populated with the given value.
    pub fn of(value: T) -> Self {
        Self {
            state: Mutex::new(State {
                value,
                wake: CancellationToken::new(),
            }),
        }
    }

    /// Returns the current value and a token cancelled by the next [`set`].
    ///
    /// [`set`]: Var::set
    pub fn get(&self) -> (T, CancellationToken) {
        let state = self.state.lock().expect("notify var poisoned");
        (state.value.clone(), state.wake.clone())
    }

    /// Returns the current value without a wakeup token.
    pub fn peek(&self) -> T {
        self.state.lock().expect("notify var poisoned").value.clone()
    }

    /// Replaces the value and wakes all pending waiters.
    pub fn set(&self, value: T) {
        let wake = {
            let mut state = self.state.lock().expect("notify var poisoned");
            state.value = value;
            std::mem::replace(&mut state.wake, CancellationToken::new())
        };
        // Cancel outside the lock so woken waiters can immediately re-read.
        wake.cancel();
    }

    /// Applies `f` to the value under the lock, waking waiters afterwards.
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let (ret, wake) = {
            let mut state = self.state.lock().expect("notify var poisoned");
            let ret = f(&mut state.value);
            let wake = std::mem::replace(&mut state.wake, CancellationToken::new());
            (ret, wake)
        };
        wake.cancel();
        ret
    }
}

impl<T: Clone + Default> Default for Var<T> {
    fn default() -> Self {
        Self::of(T::default())
    }
}
