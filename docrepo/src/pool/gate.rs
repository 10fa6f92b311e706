use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;

/// One-shot readiness latch for a logical database. Waiters registered before
/// the gate opens are released in registration order; waits after it opened
/// return immediately.
#[derive(Debug, Default)]
pub struct ReadinessGate {
    state: Mutex<GateState>,
}

#[derive(Debug, Default)]
struct GateState {
    opened: bool,
    waiters: Vec<oneshot::Sender<()>>,
}

impl ReadinessGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// The latch state stays meaningful even if a holder panicked
    fn state(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_open(&self) -> bool {
        self.state().opened
    }

    /// Number of callers currently waiting
    pub fn pending(&self) -> usize {
        self.state().waiters.len()
    }

    /// Open the gate and release every waiter. Returns false if it was already open.
    pub fn open(&self) -> bool {
        let waiters = {
            let mut state = self.state();
            if state.opened {
                return false;
            }
            state.opened = true;
            std::mem::take(&mut state.waiters)
        };
        for waiter in waiters {
            // A dropped waiter gave up; nothing to release
            let _ = waiter.send(());
        }
        true
    }

    pub async fn wait(&self) {
        let rx = {
            let mut state = self.state();
            if state.opened {
                return;
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push(tx);
            rx
        };
        let _ = rx.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_releases_all_waiters() {
        let gate = Arc::new(ReadinessGate::new());
        let mut handles = Vec::new();
        for _ in 0..3 {
            let gate = gate.clone();
            handles.push(tokio::spawn(async move { gate.wait().await }));
        }
        while gate.pending() < 3 {
            tokio::task::yield_now().await;
        }

        assert!(gate.open());
        assert!(!gate.open());
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(gate.pending(), 0);
    }

    #[tokio::test]
    async fn test_wait_after_open_is_immediate() {
        let gate = ReadinessGate::new();
        gate.open();
        gate.wait().await;
        assert!(gate.is_open());
    }

    #[test]
    fn test_waiters_released_in_order() {
        let gate = ReadinessGate::new();
        let mut receivers = Vec::new();
        for _ in 0..3 {
            let (tx, rx) = oneshot::channel();
            gate.state.lock().unwrap().waiters.push(tx);
            receivers.push(rx);
        }
        gate.open();
        for mut rx in receivers {
            assert_eq!(rx.try_recv(), Ok(()));
        }
    }

    #[tokio::test]
    async fn test_poisoned_gate_still_latches() {
        let gate = Arc::new(ReadinessGate::new());
        let poisoner = gate.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.state.lock().unwrap();
            panic!("holder panicked");
        })
        .join();
        assert!(gate.state.is_poisoned());
        assert!(!gate.is_open());

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.wait().await })
        };
        while gate.pending() < 1 {
            tokio::task::yield_now().await;
        }
        assert!(!waiter.is_finished());

        assert!(gate.open());
        waiter.await.unwrap();
        assert!(gate.is_open());
    }
}
