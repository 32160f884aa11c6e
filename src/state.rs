//! Responder-side connection state machine.
//!
//! Transitions are serialized by a non-blocking lock: a transition requested
//! while another is running is dropped with a warning. Entering `Connected`
//! arms the pairing deadline, and entering `Error` or `Disconnected` always
//! runs the cleanup hook.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
};

use crate::error::ConnectionError;

pub const DEFAULT_PAIRING_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Starting,
    Connected,
    Paired,
    Error,
}

impl ConnectionState {
    pub fn can_transition_to(self, to: ConnectionState) -> bool {
        use ConnectionState::*;
        if self == to {
            return true;
        }
        matches!(
            (self, to),
            (Disconnected, Starting | Error)
                | (Starting, Connected | Error | Disconnected)
                | (Connected, Paired | Error | Disconnected)
                | (Paired, Disconnected | Error)
                | (Error, Starting | Disconnected | Paired)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Starting => "starting",
            ConnectionState::Connected => "connected",
            ConnectionState::Paired => "paired",
            ConnectionState::Error => "error",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateSnapshot {
    pub state: ConnectionState,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied,
    /// Already in the requested state; nothing ran.
    Unchanged,
    Rejected,
    /// Another transition held the lock.
    Busy,
}

pub type CleanupHook = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

struct ArmedDeadline {
    generation: u64,
    handle: JoinHandle<()>,
}

pub struct StateMachine {
    workspace: String,
    pairing_timeout: Duration,
    transitioning: tokio::sync::Mutex<()>,
    current: watch::Sender<StateSnapshot>,
    history: broadcast::Sender<StateSnapshot>,
    deadline: Mutex<Option<ArmedDeadline>>,
    generation: AtomicU64,
    cleanup: Mutex<Option<CleanupHook>>,
}

impl StateMachine {
    pub fn new(workspace: impl Into<String>, pairing_timeout: Duration) -> Arc<Self> {
        let initial = StateSnapshot {
            state: ConnectionState::Disconnected,
            reason: None,
        };
        let (current, _) = watch::channel(initial);
        let (history, _) = broadcast::channel(64);
        Arc::new(Self {
            workspace: workspace.into(),
            pairing_timeout,
            transitioning: tokio::sync::Mutex::new(()),
            current,
            history,
            deadline: Mutex::new(None),
            generation: AtomicU64::new(0),
            cleanup: Mutex::new(None),
        })
    }

    pub fn set_cleanup(&self, hook: CleanupHook) {
        *self.cleanup.lock() = Some(hook);
    }

    pub fn state(&self) -> ConnectionState {
        self.current.borrow().state
    }

    pub fn snapshot(&self) -> StateSnapshot {
        self.current.borrow().clone()
    }

    /// Latest-value view of the state.
    pub fn subscribe(&self) -> watch::Receiver<StateSnapshot> {
        self.current.subscribe()
    }

    /// Every applied transition, in order.
    pub fn transitions(&self) -> broadcast::Receiver<StateSnapshot> {
        self.history.subscribe()
    }

    pub fn pairing_deadline_armed(&self) -> bool {
        self.deadline.lock().is_some()
    }

    pub async fn transition(
        self: &Arc<Self>,
        to: ConnectionState,
        reason: Option<String>,
    ) -> TransitionOutcome {
        let run_cleanup = {
            let Ok(_guard) = self.transitioning.try_lock() else {
                tracing::warn!(
                    target = "ask_broker::state",
                    to = %to,
                    "transition already in progress, dropping request"
                );
                return TransitionOutcome::Busy;
            };

            let from = self.state();
            if from == to {
                return TransitionOutcome::Unchanged;
            }
            if !from.can_transition_to(to) {
                tracing::warn!(
                    target = "ask_broker::state",
                    from = %from,
                    to = %to,
                    "rejected invalid state transition"
                );
                return TransitionOutcome::Rejected;
            }

            let snapshot = StateSnapshot { state: to, reason };
            self.current.send_replace(snapshot.clone());
            let _ = self.history.send(snapshot.clone());
            match &snapshot.reason {
                Some(reason) => tracing::info!(
                    target = "ask_broker::state",
                    from = %from,
                    to = %to,
                    reason = %reason,
                    "state changed"
                ),
                None => tracing::info!(
                    target = "ask_broker::state",
                    from = %from,
                    to = %to,
                    "state changed"
                ),
            }

            match to {
                ConnectionState::Connected => {
                    self.arm_pairing_deadline();
                    false
                }
                ConnectionState::Paired => {
                    self.disarm_pairing_deadline();
                    false
                }
                ConnectionState::Disconnected | ConnectionState::Error => {
                    self.disarm_pairing_deadline();
                    true
                }
                ConnectionState::Starting => false,
            }
        };

        if run_cleanup {
            let hook = self.cleanup.lock().clone();
            if let Some(hook) = hook {
                hook().await;
            }
        }
        TransitionOutcome::Applied
    }

    pub async fn fail(self: &Arc<Self>, error: &ConnectionError) -> TransitionOutcome {
        self.transition(ConnectionState::Error, Some(error.to_string()))
            .await
    }

    fn arm_pairing_deadline(self: &Arc<Self>) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let machine: Weak<Self> = Arc::downgrade(self);
        let timeout = self.pairing_timeout;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(machine) = machine.upgrade() else {
                return;
            };
            {
                let mut slot = machine.deadline.lock();
                match slot.as_ref() {
                    Some(armed) if armed.generation == generation => {
                        // Taking the slot keeps the Error transition from aborting this task.
                        slot.take();
                    }
                    _ => return,
                }
            }
            let error = ConnectionError::PairingTimeout {
                workspace: machine.workspace.clone(),
                timeout_ms: timeout.as_millis() as u64,
            };
            while machine.state() == ConnectionState::Connected {
                if machine.fail(&error).await != TransitionOutcome::Busy {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        });

        if let Some(previous) = self
            .deadline
            .lock()
            .replace(ArmedDeadline { generation, handle })
        {
            previous.handle.abort();
        }
    }

    fn disarm_pairing_deadline(&self) {
        if let Some(armed) = self.deadline.lock().take() {
            armed.handle.abort();
        }
    }
}

impl Drop for StateMachine {
    fn drop(&mut self) {
        self.disarm_pairing_deadline();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    use futures::FutureExt;

    use super::{ConnectionState, StateMachine, TransitionOutcome};
    use ConnectionState::*;

    #[test]
    fn transition_table() {
        let allowed = [
            (Disconnected, Starting),
            (Disconnected, Error),
            (Starting, Connected),
            (Starting, Error),
            (Starting, Disconnected),
            (Connected, Paired),
            (Connected, Error),
            (Connected, Disconnected),
            (Paired, Disconnected),
            (Paired, Error),
            (Error, Starting),
            (Error, Disconnected),
            (Error, Paired),
        ];
        let all = [Disconnected, Starting, Connected, Paired, Error];
        for from in all {
            for to in all {
                let expected = from == to || allowed.contains(&(from, to));
                assert_eq!(from.can_transition_to(to), expected, "{from} -> {to}");
            }
        }
    }

    #[tokio::test]
    async fn invalid_transition_is_rejected() {
        let machine = StateMachine::new("/proj", Duration::from_secs(30));
        assert_eq!(
            machine.transition(Paired, None).await,
            TransitionOutcome::Rejected
        );
        assert_eq!(machine.state(), Disconnected);
    }

    #[tokio::test]
    async fn same_state_is_a_no_op() {
        let machine = StateMachine::new("/proj", Duration::from_secs(30));
        let mut history = machine.transitions();
        assert_eq!(
            machine.transition(Disconnected, None).await,
            TransitionOutcome::Unchanged
        );
        assert!(history.try_recv().is_err());
    }

    #[tokio::test]
    async fn concurrent_transition_is_dropped() {
        let machine = StateMachine::new("/proj", Duration::from_secs(30));
        let _held = machine.transitioning.try_lock().unwrap();
        assert_eq!(
            machine.transition(Starting, None).await,
            TransitionOutcome::Busy
        );
        assert_eq!(machine.state(), Disconnected);
    }

    #[tokio::test]
    async fn pairing_deadline_fails_into_error_with_cleanup() {
        let machine = StateMachine::new("/proj", Duration::from_millis(50));
        let cleanups = Arc::new(AtomicUsize::new(0));
        let counter = cleanups.clone();
        machine.set_cleanup(Arc::new(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            .boxed()
        }));

        machine.transition(Starting, None).await;
        machine.transition(Connected, None).await;
        assert!(machine.pairing_deadline_armed());

        tokio::time::sleep(Duration::from_millis(200)).await;
        let snapshot = machine.snapshot();
        assert_eq!(snapshot.state, Error);
        assert!(snapshot.reason.unwrap().contains("/proj"));
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
        assert!(!machine.pairing_deadline_armed());
    }

    #[tokio::test]
    async fn disconnecting_runs_cleanup_but_pairing_does_not() {
        let machine = StateMachine::new("/proj", Duration::from_secs(30));
        let cleanups = Arc::new(AtomicUsize::new(0));
        let counter = cleanups.clone();
        machine.set_cleanup(Arc::new(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            .boxed()
        }));

        machine.transition(Starting, None).await;
        machine.transition(Connected, None).await;
        machine.transition(Paired, None).await;
        assert_eq!(cleanups.load(Ordering::SeqCst), 0);

        machine
            .transition(Disconnected, Some("disabled by user".into()))
            .await;
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
        // already disconnected, nothing runs again
        machine.transition(Disconnected, None).await;
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn pairing_disarms_the_deadline() {
        let machine = StateMachine::new("/proj", Duration::from_millis(50));
        machine.transition(Starting, None).await;
        machine.transition(Connected, None).await;
        machine.transition(Paired, None).await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(machine.state(), Paired);
    }

    #[tokio::test]
    async fn late_pairing_recovers_from_error() {
        let machine = StateMachine::new("/proj", Duration::from_millis(20));
        machine.transition(Starting, None).await;
        machine.transition(Connected, None).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(machine.state(), Error);

        assert_eq!(
            machine.transition(Paired, None).await,
            TransitionOutcome::Applied
        );
        assert_eq!(machine.state(), Paired);
    }

    #[tokio::test]
    async fn watchers_see_the_latest_state() {
        let machine = StateMachine::new("/proj", Duration::from_secs(30));
        let mut rx = machine.subscribe();
        machine.transition(Starting, None).await;
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().state, Starting);
    }
}
