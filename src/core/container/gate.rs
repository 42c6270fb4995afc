use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;

/// A continuation waiting for the gate to open
enum Listener<T> {
    Channel(oneshot::Sender<T>),
    Callback(Box<dyn FnOnce(T) + Send>),
}

enum GateState<T> {
    Pending(Vec<Listener<T>>),
    Open(T),
}

/// One-shot readiness broadcast
///
/// Stores one flag (the open value) plus the list of continuations that
/// registered before the gate opened. Opening drains that list exactly once,
/// in arrival order. Anything registering afterwards runs immediately.
pub struct ReadyGate<T> {
    state: Mutex<GateState<T>>,
}

impl<T: Clone + Send + 'static> Default for ReadyGate<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> ReadyGate<T> {
    /// Generate a closed gate
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GateState::Pending(Vec::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GateState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Has the gate been opened
    pub fn is_open(&self) -> bool {
        matches!(*self.lock(), GateState::Open(_))
    }

    /// The open value, if any, without waiting
    pub fn peek(&self) -> Option<T> {
        match &*self.lock() {
            GateState::Open(value) => Some(value.clone()),
            GateState::Pending(_) => None,
        }
    }

    /// Open the gate and notify every queued listener
    ///
    /// ### Params
    ///
    /// * `value` - The value handed to every listener.
    ///
    /// ### Returns
    ///
    /// `false` if the gate was already open. The value is dropped then.
    pub fn open(&self, value: T) -> bool {
        let listeners = {
            let mut state = self.lock();
            if matches!(*state, GateState::Open(_)) {
                return false;
            }
            match std::mem::replace(&mut *state, GateState::Open(value.clone())) {
                GateState::Pending(listeners) => listeners,
                GateState::Open(_) => Vec::new(),
            }
        };

        // lock is released, callbacks may re-enter the gate
        for listener in listeners {
            match listener {
                Listener::Channel(tx) => {
                    // the waiter may have been dropped in the meantime
                    let _ = tx.send(value.clone());
                }
                Listener::Callback(f) => f(value.clone()),
            }
        }

        true
    }

    /// Register a callback
    ///
    /// Queued if the gate is closed, invoked right away otherwise.
    pub fn on_open<F>(&self, f: F)
    where
        F: FnOnce(T) + Send + 'static,
    {
        let value = {
            let mut state = self.lock();
            match &mut *state {
                GateState::Open(value) => value.clone(),
                GateState::Pending(listeners) => {
                    listeners.push(Listener::Callback(Box::new(f)));
                    return;
                }
            }
        };
        f(value)
    }

    /// Wait for the gate to open
    ///
    /// ### Returns
    ///
    /// The open value, or `None` if the gate was dropped before opening.
    pub async fn wait(&self) -> Option<T> {
        let rx = {
            let mut state = self.lock();
            match &mut *state {
                GateState::Open(value) => return Some(value.clone()),
                GateState::Pending(listeners) => {
                    let (tx, rx) = oneshot::channel();
                    listeners.push(Listener::Channel(tx));
                    rx
                }
            }
        };
        rx.await.ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_queued_callbacks_fire_in_order_once() {
        let gate: ReadyGate<u32> = ReadyGate::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..5 {
            let seen = Arc::clone(&seen);
            gate.on_open(move |v| seen.lock().unwrap().push((i, v)));
        }
        assert!(seen.lock().unwrap().is_empty());
        assert!(!gate.is_open());

        assert!(gate.open(7));
        assert!(!gate.open(8));

        let seen_now = seen.lock().unwrap().clone();
        assert_eq!(seen_now, vec![(0, 7), (1, 7), (2, 7), (3, 7), (4, 7)]);
    }

    #[test]
    fn test_late_callback_runs_immediately() {
        let gate: ReadyGate<&'static str> = ReadyGate::new();
        gate.open("ready");

        let seen = Arc::new(Mutex::new(None));
        let seen_c = Arc::clone(&seen);
        gate.on_open(move |v| *seen_c.lock().unwrap() = Some(v));

        assert_eq!(*seen.lock().unwrap(), Some("ready"));
        assert_eq!(gate.peek(), Some("ready"));
    }

    #[tokio::test]
    async fn test_waiters_are_released() {
        let gate = Arc::new(ReadyGate::<u64>::new());

        let mut handles = Vec::new();
        for _ in 0..4 {
            let gate = Arc::clone(&gate);
            handles.push(tokio::spawn(async move { gate.wait().await }));
        }
        tokio::task::yield_now().await;

        gate.open(42);
        for handle in handles {
            assert_eq!(handle.await.unwrap(), Some(42));
        }
        assert_eq!(gate.wait().await, Some(42));
    }
}
