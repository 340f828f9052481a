//! Per-volume operation serializer.
//!
//! Mutating controller operations take an [`OperationGuard`] for the volume
//! they touch (or for the requested name while a volume is still being
//! created).  At most one guard exists per key.  A second request for a held
//! key waits at most the configured bound and then fails with
//! [`CsiError::OperationPending`], leaving retry pacing to the orchestrator.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::CsiError;
use crate::types::VolumeId;

type LockTable = DashMap<String, Arc<Mutex<()>>>;

/// Per-request context carried into every controller operation.
///
/// Cancelling it aborts a pending lock wait.  Work that already reached the
/// backend is not interrupted.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    cancel: CancellationToken,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tie the context to an existing token, e.g. a transport-level one.
    pub fn with_token(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the context is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }
}

/// Lock key for an existing volume.
pub fn volume_key(volume_id: &VolumeId) -> String {
    format!("volume:{volume_id}")
}

/// Lock key for a volume name during `CreateVolume`.
pub fn name_key(name: &str) -> String {
    format!("name:{name}")
}

/// Hands out at most one [`OperationGuard`] per key.
#[derive(Debug)]
pub struct OperationSerializer {
    locks: Arc<LockTable>,
    wait: Duration,
}

impl OperationSerializer {
    /// `wait` bounds how long a request queues behind a held key.  Zero
    /// fails fast.
    pub fn new(wait: Duration) -> Self {
        Self {
            locks: Arc::new(DashMap::new()),
            wait,
        }
    }

    /// Acquire the lock for `key`.
    ///
    /// Fails with [`CsiError::OperationPending`] when the key stays held for
    /// longer than the configured wait, and with [`CsiError::Cancelled`] when
    /// `ctx` is cancelled first.  Neither failure has side effects.
    pub async fn acquire(&self, key: String, ctx: &CallContext) -> Result<OperationGuard, CsiError> {
        if ctx.is_cancelled() {
            return Err(CsiError::Cancelled(format!("request for {key} cancelled")));
        }

        let mutex = Arc::clone(self.locks.entry(key.clone()).or_default().value());
        let mut waiter = Waiter {
            key,
            mutex: Some(mutex),
            locks: Arc::clone(&self.locks),
        };
        let held = waiter.lock(self.wait, ctx).await?;

        Ok(OperationGuard {
            key: waiter.key.clone(),
            held: Some(held),
            locks: Arc::clone(&self.locks),
        })
    }

    /// `true` while some guard for `key` is alive.
    pub fn is_held(&self, key: &str) -> bool {
        self.locks
            .get(key)
            .is_some_and(|m| m.try_lock().is_err())
    }

    /// Number of keys currently tracked (held or waited on).
    pub fn tracked_keys(&self) -> usize {
        self.locks.len()
    }
}

/// Owns a reference to a key's mutex until it is locked or abandoned.
struct Waiter {
    key: String,
    mutex: Option<Arc<Mutex<()>>>,
    locks: Arc<LockTable>,
}

impl Waiter {
    async fn lock(
        &mut self,
        wait: Duration,
        ctx: &CallContext,
    ) -> Result<OwnedMutexGuard<()>, CsiError> {
        let Some(mutex) = self.mutex.clone() else {
            return Err(CsiError::Internal(format!("lock for {} already consumed", self.key)));
        };

        if let Ok(held) = Arc::clone(&mutex).try_lock_owned() {
            return Ok(held);
        }
        if wait.is_zero() {
            return Err(CsiError::OperationPending(self.key.clone()));
        }

        debug!(key = %self.key, ?wait, "key held, waiting");
        tokio::select! {
            _ = ctx.cancelled() => {
                Err(CsiError::Cancelled(format!("request for {} cancelled while waiting", self.key)))
            }
            res = tokio::time::timeout(wait, mutex.lock_owned()) => {
                res.map_err(|_| CsiError::OperationPending(self.key.clone()))
            }
        }
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        self.mutex.take();
        self.locks
            .remove_if(&self.key, |_, m| Arc::strong_count(m) == 1);
    }
}

/// Exclusive hold on a key.  Released on drop, including during unwinding.
pub struct OperationGuard {
    key: String,
    held: Option<OwnedMutexGuard<()>>,
    locks: Arc<LockTable>,
}

impl OperationGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl std::fmt::Debug for OperationGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationGuard").field("key", &self.key).finish()
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        // Release the mutex before checking whether anyone else still
        // references the entry.
        self.held.take();
        self.locks
            .remove_if(&self.key, |_, m| Arc::strong_count(m) == 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_acquire_fails_fast() {
        let ser = OperationSerializer::new(Duration::ZERO);
        let ctx = CallContext::new();

        let guard = ser.acquire("volume:v1".into(), &ctx).await.unwrap();
        assert!(ser.is_held("volume:v1"));

        let err = ser.acquire("volume:v1".into(), &ctx).await.unwrap_err();
        assert!(matches!(err, CsiError::OperationPending(_)));

        drop(guard);
        assert!(!ser.is_held("volume:v1"));
        assert_eq!(ser.tracked_keys(), 0);
        ser.acquire("volume:v1".into(), &ctx).await.unwrap();
    }

    #[tokio::test]
    async fn different_keys_do_not_contend() {
        let ser = OperationSerializer::new(Duration::ZERO);
        let ctx = CallContext::new();
        let _a = ser.acquire(volume_key(&"a".into()), &ctx).await.unwrap();
        let _b = ser.acquire(volume_key(&"b".into()), &ctx).await.unwrap();
        assert_eq!(ser.tracked_keys(), 2);
    }

    #[tokio::test]
    async fn bounded_wait_times_out() {
        let ser = OperationSerializer::new(Duration::from_millis(20));
        let ctx = CallContext::new();
        let _guard = ser.acquire("k".into(), &ctx).await.unwrap();

        let err = ser.acquire("k".into(), &ctx).await.unwrap_err();
        assert!(matches!(err, CsiError::OperationPending(_)));
        // The failed waiter must not leak its reference.
        assert_eq!(ser.tracked_keys(), 1);
    }

    #[tokio::test]
    async fn waiter_gets_lock_after_release() {
        let ser = Arc::new(OperationSerializer::new(Duration::from_secs(5)));
        let ctx = CallContext::new();
        let guard = ser.acquire("k".into(), &ctx).await.unwrap();

        let waiter = {
            let ser = Arc::clone(&ser);
            tokio::spawn(async move { ser.acquire("k".into(), &CallContext::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(guard);

        let second = waiter.await.unwrap().unwrap();
        assert_eq!(second.key(), "k");
    }

    #[tokio::test]
    async fn cancellation_aborts_wait() {
        let ser = Arc::new(OperationSerializer::new(Duration::from_secs(30)));
        let _guard = ser.acquire("k".into(), &CallContext::new()).await.unwrap();

        let ctx = CallContext::new();
        let waiter = {
            let ser = Arc::clone(&ser);
            let ctx = ctx.clone();
            tokio::spawn(async move { ser.acquire("k".into(), &ctx).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        ctx.cancel();

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, CsiError::Cancelled(_)));
        assert!(ser.is_held("k"));
    }

    #[tokio::test]
    async fn already_cancelled_context_is_rejected() {
        let ser = OperationSerializer::new(Duration::ZERO);
        let ctx = CallContext::new();
        ctx.cancel();
        let err = ser.acquire("k".into(), &ctx).await.unwrap_err();
        assert!(matches!(err, CsiError::Cancelled(_)));
        assert_eq!(ser.tracked_keys(), 0);
    }

    #[tokio::test]
    async fn guard_released_when_holder_panics() {
        let ser = Arc::new(OperationSerializer::new(Duration::ZERO));
        let guard = ser.acquire("k".into(), &CallContext::new()).await.unwrap();

        let task = tokio::spawn(async move {
            let _guard = guard;
            panic!("critical section blew up");
        });
        assert!(task.await.is_err());
        assert!(!ser.is_held("k"));
    }
}
