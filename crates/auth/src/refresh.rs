//! Single-flight access token refresh
//!
//! The first caller runs the refresh; everyone arriving while it is in flight
//! is queued and released with the same outcome once it settles.

use log::{debug, warn};
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::oneshot;

use crate::error::AuthError;

type Outcome = Result<String, String>;

#[derive(Debug, Default)]
pub struct RefreshCoordinator {
    // `Some` while a refresh is in flight, holding the queued waiters
    waiters: Mutex<Option<Vec<oneshot::Sender<Outcome>>>>,
}

enum Role {
    Leader,
    Waiter(oneshot::Receiver<Outcome>),
}

impl RefreshCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_refreshing(&self) -> bool {
        self.lock().is_some()
    }

    /// Number of callers parked behind the in-flight refresh
    pub fn waiting(&self) -> usize {
        self.lock().as_ref().map_or(0, Vec::len)
    }

    /// Obtain a fresh token, calling `refresh` only if no refresh is in flight.
    pub async fn run<F, Fut>(&self, refresh: F) -> Result<String, AuthError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String, AuthError>>,
    {
        let role = {
            let mut guard = self.lock();
            match guard.as_mut() {
                Some(queue) => {
                    let (tx, rx) = oneshot::channel();
                    queue.push(tx);
                    Role::Waiter(rx)
                }
                None => {
                    *guard = Some(Vec::new());
                    Role::Leader
                }
            }
        };

        match role {
            Role::Waiter(rx) => {
                debug!("Refresh already in flight, waiting for its result");
                match rx.await {
                    Ok(Ok(token)) => Ok(token),
                    Ok(Err(message)) => Err(AuthError::SessionExpired(message)),
                    Err(_) => Err(AuthError::SessionExpired(
                        "token refresh was abandoned".to_string(),
                    )),
                }
            }
            Role::Leader => {
                let mut flight = InFlight {
                    coordinator: self,
                    settled: false,
                };
                let outcome = refresh().await;
                let shared = match &outcome {
                    Ok(token) => Ok(token.clone()),
                    Err(e) => Err(e.to_string()),
                };
                flight.settle(shared);
                outcome
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Vec<oneshot::Sender<Outcome>>>> {
        self.waiters.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Clears the in-flight marker even if the leading future is dropped
struct InFlight<'a> {
    coordinator: &'a RefreshCoordinator,
    settled: bool,
}

impl InFlight<'_> {
    fn settle(&mut self, outcome: Outcome) {
        self.settled = true;
        let waiters = self.coordinator.lock().take().unwrap_or_default();
        debug!("Refresh settled, releasing {} waiter(s)", waiters.len());
        for waiter in waiters {
            // receiver may have been dropped by a cancelled request
            let _ = waiter.send(outcome.clone());
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.settled {
            let waiters = self.coordinator.lock().take().unwrap_or_default();
            warn!("Refresh cancelled, rejecting {} waiter(s)", waiters.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrent_callers_share_one_refresh() {
        let coordinator = Arc::new(RefreshCoordinator::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let coordinator = coordinator.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                coordinator
                    .run(|| async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok("fresh".to_string())
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "fresh");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!coordinator.is_refreshing());
    }

    #[tokio::test]
    async fn test_failure_rejects_waiters() {
        let coordinator = Arc::new(RefreshCoordinator::new());

        let leader = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .run(|| async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Err(AuthError::InvalidCredentials {
                            status: 401,
                            message: "cookie expired".to_string(),
                        })
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(coordinator.is_refreshing());

        let waiter = coordinator
            .run(|| async { Ok("never called".to_string()) })
            .await;

        assert!(matches!(waiter, Err(AuthError::SessionExpired(_))));
        assert!(matches!(
            leader.await.unwrap(),
            Err(AuthError::InvalidCredentials { .. })
        ));
        assert!(!coordinator.is_refreshing());
    }

    #[tokio::test]
    async fn test_cancelled_leader_does_not_wedge() {
        let coordinator = Arc::new(RefreshCoordinator::new());

        let leader = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .run(|| async {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        Ok("late".to_string())
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let waiter = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.run(|| async { Ok("x".to_string()) }).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(coordinator.waiting(), 1);

        leader.abort();
        assert!(matches!(
            waiter.await.unwrap(),
            Err(AuthError::SessionExpired(_))
        ));
        assert!(!coordinator.is_refreshing());

        let next = coordinator.run(|| async { Ok("again".to_string()) }).await;
        assert_eq!(next.unwrap(), "again");
    }
}
