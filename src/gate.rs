use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::GatewayError;

/// Bounds concurrent outbound upstream requests. Acquired before any key
/// is leased so a saturated gateway does not sit on credentials.
#[derive(Clone)]
pub struct ConcurrencyGate {
    semaphore: Arc<Semaphore>,
    timeout: Duration,
}

impl ConcurrencyGate {
    pub fn new(capacity: usize, timeout: Duration) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity.max(1))),
            timeout,
        }
    }

    /// Waits for an admission slot. Tokio semaphores queue waiters in
    /// FIFO order, which is exactly the fairness the gate needs.
    pub async fn admit(&self) -> Result<OwnedSemaphorePermit, GatewayError> {
        match tokio::time::timeout(
            self.timeout,
            Arc::clone(&self.semaphore).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_closed)) => Err(GatewayError::Internal(
                "admission semaphore closed".to_string(),
            )),
            Err(_elapsed) => Err(GatewayError::AdmissionTimeout),
        }
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn admits_up_to_capacity() {
        let gate = ConcurrencyGate::new(2, Duration::from_millis(50));
        let first = gate.admit().await.expect("first");
        let _second = gate.admit().await.expect("second");
        assert_eq!(gate.available(), 0);

        let err = gate.admit().await.expect_err("saturated");
        assert!(matches!(err, GatewayError::AdmissionTimeout));

        drop(first);
        let _third = gate.admit().await.expect("slot freed");
    }

    #[tokio::test]
    async fn waiters_are_admitted_in_fifo_order() {
        let gate = ConcurrencyGate::new(1, Duration::from_millis(500));
        let held = gate.admit().await.expect("held");

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        for id in 0..3 {
            let gate = gate.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let permit = gate.admit().await;
                let _ = tx.send(id);
                drop(permit);
            });
            // Give each waiter time to join the queue in order.
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        drop(held);
        let mut order = Vec::new();
        for _ in 0..3 {
            order.push(rx.recv().await.expect("admitted"));
        }
        assert_eq!(order, vec![0, 1, 2]);
    }
}
