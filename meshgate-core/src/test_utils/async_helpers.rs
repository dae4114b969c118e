//! Async test helpers

use std::future::Future;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{timeout, Duration};

use crate::core_pubsub::{InboundMessage, Subscription};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RecvTimeoutError {
    #[error("receive operation timed out")]
    Timeout,
    #[error("channel closed")]
    Closed,
}

/// Next message on a subscription, or an error after `duration`
pub async fn recv_timeout(
    subscription: &mut Subscription,
    duration: Duration,
) -> Result<InboundMessage, RecvTimeoutError> {
    timeout(duration, subscription.recv())
        .await
        .map_err(|_| RecvTimeoutError::Timeout)?
        .ok_or(RecvTimeoutError::Closed)
}

/// Wait until the watched value satisfies `predicate`, returning a copy of it
pub async fn wait_for_watch<T, F>(
    rx: &mut watch::Receiver<T>,
    duration: Duration,
    predicate: F,
) -> Result<T, RecvTimeoutError>
where
    T: Clone,
    F: Fn(&T) -> bool,
{
    let wait = async {
        loop {
            {
                let current = rx.borrow_and_update();
                if predicate(&current) {
                    return Ok(current.clone());
                }
            }
            if rx.changed().await.is_err() {
                return Err(RecvTimeoutError::Closed);
            }
        }
    };
    timeout(duration, wait)
        .await
        .map_err(|_| RecvTimeoutError::Timeout)?
}

/// Helper to assert a future completes within duration
pub async fn assert_completes_within<F, T>(duration: Duration, future: F) -> T
where
    F: Future<Output = T>,
{
    match timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => panic!("Future did not complete within {:?}", duration),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_pubsub::{BroadcastChannel, BroadcastHub};

    #[tokio::test(start_paused = true)]
    async fn test_recv_timeout_times_out() {
        let hub = BroadcastHub::new();
        let mut sub = hub.endpoint("a").subscribe("t").await.unwrap();
        let result = recv_timeout(&mut sub, Duration::from_millis(50)).await;
        assert_eq!(result.unwrap_err(), RecvTimeoutError::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_watch() {
        let (tx, mut rx) = watch::channel(0u32);
        tokio::spawn(async move {
            for i in 1..=3 {
                tokio::time::sleep(Duration::from_millis(10)).await;
                let _ = tx.send(i);
            }
        });
        let value = wait_for_watch(&mut rx, Duration::from_secs(1), |v| *v >= 3).await;
        assert_eq!(value, Ok(3));
    }
}
