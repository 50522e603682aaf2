//! Single-slot handoff of a spawned process between tasks.

use pipewright_types::{Error, Result};
use tokio::sync::oneshot;

use super::process::Process;

/// Create a connected sender/receiver pair.
pub fn handoff() -> (ProcessSender, ProcessReceiver) {
    let (tx, rx) = oneshot::channel();
    (ProcessSender(tx), ProcessReceiver(rx))
}

/// Producer half. Delivers exactly one spawn outcome.
#[derive(Debug)]
pub struct ProcessSender(oneshot::Sender<Result<Process>>);

impl ProcessSender {
    /// Deliver the outcome. Gives it back if the receiver is gone.
    pub fn send(self, outcome: Result<Process>) -> std::result::Result<(), Result<Process>> {
        self.0.send(outcome)
    }

    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }
}

/// Consumer half.
#[derive(Debug)]
pub struct ProcessReceiver(oneshot::Receiver<Result<Process>>);

impl ProcessReceiver {
    /// Wait for the process. Fails with [`Error::HandoffClosed`] if the
    /// sender was dropped without sending.
    pub async fn recv(self) -> Result<Process> {
        self.0.await.map_err(|_| Error::HandoffClosed)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dropped_sender_is_handoff_error() {
        let (tx, rx) = handoff();
        drop(tx);
        assert!(matches!(rx.recv().await, Err(Error::HandoffClosed)));
    }

    #[tokio::test]
    async fn test_error_outcome_passes_through() {
        let (tx, rx) = handoff();
        tx.send(Err(Error::EmptyProgram)).unwrap();
        assert!(matches!(rx.recv().await, Err(Error::EmptyProgram)));
    }

    #[tokio::test]
    async fn test_send_without_receiver_returns_outcome() {
        let (tx, rx) = handoff();
        drop(rx);
        assert!(tx.is_closed());
        let returned = tx.send(Err(Error::NotMarked)).unwrap_err();
        assert!(matches!(returned, Err(Error::NotMarked)));
    }
}
