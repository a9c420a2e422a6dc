//! Process-wide registry of active plans.
//!
//! The outer map is guarded by one mutex; each plan has its own mutex so
//! that work on one plan never waits on another. Neither lock is held
//! across an `.await`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, OwnedRwLockReadGuard};
use tokio_util::sync::CancellationToken;

use plansmith_db::models::Context;

use super::{ActivePlan, PlanKey};
use crate::stream::StreamMessage;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("plan {0} already has an active session")]
    AlreadyActive(PlanKey),

    #[error("plan {0} is not active")]
    NotActive(PlanKey),

    #[error("timed out waiting for the build lock on plan {0}")]
    LockTimeout(PlanKey),
}

/// The client side of a newly created active plan.
#[derive(Debug)]
pub struct PlanSubscription {
    pub key: PlanKey,
    pub messages: mpsc::UnboundedReceiver<StreamMessage>,
    /// Fires once every reply and build for the plan has finished.
    pub done: CancellationToken,
}

#[derive(Debug, Default)]
pub struct ActivePlanRegistry {
    plans: Mutex<HashMap<PlanKey, Arc<Mutex<ActivePlan>>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ActivePlanRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new active plan. Fails if one is already active for `key`.
    pub fn create(
        &self,
        key: PlanKey,
        contexts: &[Context],
        reply_streaming: bool,
    ) -> Result<PlanSubscription, RegistryError> {
        let mut plans = lock(&self.plans);
        if plans.contains_key(&key) {
            return Err(RegistryError::AlreadyActive(key));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let plan = ActivePlan::new(key.clone(), contexts, reply_streaming, tx);
        let done = plan.done.clone();
        plans.insert(key.clone(), Arc::new(Mutex::new(plan)));
        tracing::debug!(plan = %key, "active plan registered");

        Ok(PlanSubscription {
            key,
            messages: rx,
            done,
        })
    }

    fn entry(&self, key: &PlanKey) -> Option<Arc<Mutex<ActivePlan>>> {
        lock(&self.plans).get(key).cloned()
    }

    /// Snapshot of the plan's current state.
    pub fn get(&self, key: &PlanKey) -> Option<ActivePlan> {
        self.entry(key).map(|plan| lock(&plan).clone())
    }

    pub fn contains(&self, key: &PlanKey) -> bool {
        lock(&self.plans).contains_key(key)
    }

    /// Apply `f` to the plan under its lock. Returns `None` if the plan is
    /// not active.
    pub fn update<R>(&self, key: &PlanKey, f: impl FnOnce(&mut ActivePlan) -> R) -> Option<R> {
        let plan = self.entry(key)?;
        let mut guard = lock(&plan);
        Some(f(&mut guard))
    }

    /// Unregister the plan, returning its final state.
    pub fn remove(&self, key: &PlanKey) -> Option<ActivePlan> {
        let plan = lock(&self.plans).remove(key)?;
        tracing::debug!(plan = %key, "active plan removed");
        let state = lock(&plan).clone();
        Some(state)
    }

    /// Take the plan's build lock for reading. Reset builds take it for
    /// writing, so holding this guard keeps pending changes from being
    /// reverted underneath the caller.
    pub async fn lock_for_read(
        &self,
        key: &PlanKey,
        timeout: Duration,
    ) -> Result<OwnedRwLockReadGuard<()>, RegistryError> {
        let build_lock = self
            .update(key, |plan| plan.build_lock.clone())
            .ok_or_else(|| RegistryError::NotActive(key.clone()))?;
        tokio::time::timeout(timeout, build_lock.read_owned())
            .await
            .map_err(|_| RegistryError::LockTimeout(key.clone()))
    }

    pub fn active_keys(&self) -> Vec<PlanKey> {
        lock(&self.plans).keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.plans).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.plans).is_empty()
    }
}
