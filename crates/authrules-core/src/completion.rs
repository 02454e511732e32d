//! Completion slot: a single-assignment result channel for rule callbacks.
//!
//! A rule finishes by raising its completion signal once. The signal half can
//! be cloned into whatever host functions the script sees; the first
//! `signal` call wins and every later one is rejected and counted.
use crate::data_model::{Context, User};
use crate::outcome::{ExecutionOutcome, FailureKind};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;

/// Payload of a completion signal.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Continue { user: User, context: Context },
    Error { kind: FailureKind, message: String },
}

impl From<Completion> for ExecutionOutcome {
    fn from(completion: Completion) -> Self {
        match completion {
            Completion::Continue { user, context } => ExecutionOutcome::Continue { user, context },
            Completion::Error { kind, message } => ExecutionOutcome::Fail { kind, message },
        }
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("completion signal already raised")]
pub struct AlreadySignaled;

/// Sending half. Cheap to clone.
#[derive(Debug, Clone)]
pub struct CompletionSignal {
    sender: Arc<Mutex<Option<oneshot::Sender<Completion>>>>,
    rejected: Arc<AtomicU32>,
}

/// Receiving half, owned by the sandbox driving the invocation.
#[derive(Debug)]
pub struct CompletionReceiver {
    receiver: oneshot::Receiver<Completion>,
    rejected: Arc<AtomicU32>,
}

/// Result of waiting on a completion slot.
#[derive(Debug, Clone, PartialEq)]
pub enum Waited {
    Signaled(Completion),
    /// Every signal handle was dropped without a signal.
    Abandoned,
    DeadlineElapsed,
}

pub fn completion_slot() -> (CompletionSignal, CompletionReceiver) {
    let (tx, rx) = oneshot::channel();
    let rejected = Arc::new(AtomicU32::new(0));
    (
        CompletionSignal {
            sender: Arc::new(Mutex::new(Some(tx))),
            rejected: Arc::clone(&rejected),
        },
        CompletionReceiver {
            receiver: rx,
            rejected,
        },
    )
}

impl CompletionSignal {
    pub fn signal(&self, completion: Completion) -> Result<(), AlreadySignaled> {
        let sender = self.sender.lock().take();
        match sender {
            Some(tx) => {
                // The receiver may already have given up at the deadline.
                let _ = tx.send(completion);
                Ok(())
            }
            None => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                Err(AlreadySignaled)
            }
        }
    }

    pub fn is_signaled(&self) -> bool {
        self.sender.lock().is_none()
    }
}

impl CompletionReceiver {
    pub async fn wait(&mut self, deadline: Duration) -> Waited {
        match tokio::time::timeout(deadline, &mut self.receiver).await {
            Ok(Ok(completion)) => Waited::Signaled(completion),
            Ok(Err(_)) => Waited::Abandoned,
            Err(_) => Waited::DeadlineElapsed,
        }
    }

    /// Number of signals rejected so far.
    pub fn rejected(&self) -> u32 {
        self.rejected.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_model::Protocol;

    fn cont() -> Completion {
        Completion::Continue {
            user: User::new("u"),
            context: Context::new("c", "conn", Protocol::OAuth2),
        }
    }

    #[tokio::test]
    async fn test_first_signal_wins() {
        let (signal, mut rx) = completion_slot();
        let second = signal.clone();

        signal.signal(cont()).unwrap();
        let err = second
            .signal(Completion::Error {
                kind: FailureKind::Unauthorized,
                message: "late".to_string(),
            })
            .unwrap_err();
        assert_eq!(err, AlreadySignaled);

        match rx.wait(Duration::from_millis(100)).await {
            Waited::Signaled(Completion::Continue { .. }) => {}
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(rx.rejected(), 1);
        assert!(signal.is_signaled());
    }

    #[tokio::test]
    async fn test_dropped_signal_is_abandoned() {
        let (signal, mut rx) = completion_slot();
        drop(signal);
        assert_eq!(rx.wait(Duration::from_secs(1)).await, Waited::Abandoned);
    }

    #[tokio::test]
    async fn test_deadline_elapses() {
        let (_signal, mut rx) = completion_slot();
        assert_eq!(
            rx.wait(Duration::from_millis(20)).await,
            Waited::DeadlineElapsed
        );
    }

    #[tokio::test]
    async fn test_signal_from_another_task() {
        let (signal, mut rx) = completion_slot();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            let _ = signal.signal(Completion::Error {
                kind: FailureKind::Generic,
                message: "boom".to_string(),
            });
        });
        let waited = rx.wait(Duration::from_secs(1)).await;
        let outcome = match waited {
            Waited::Signaled(c) => ExecutionOutcome::from(c),
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(outcome.label(), "error");
    }
}
