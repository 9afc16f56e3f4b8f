use crate::LockStore;
use crate::manager::LockManager;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

/// Anything holding locks that can be released in bulk.
#[async_trait]
pub trait ReleaseAll: Send + Sync {
    /// Releases every lock held, logging and skipping failures.
    async fn release_all(&self);
}

#[async_trait]
impl<S> ReleaseAll for LockManager<S>
where
    S: LockStore,
{
    async fn release_all(&self) {
        Self::release_all(self).await;
    }
}

/// The lock managers created during one unit of work, such as a request or a
/// task.
///
/// The host owns the scope, registers each manager it creates, and calls
/// [`LockScope::release_all`] when the unit of work ends, however it ends, so
/// locks forgotten by the work itself are not left to the store TTL.
#[derive(Default)]
pub struct LockScope {
    managers: Vec<Arc<dyn ReleaseAll>>,
}

impl LockScope {
    /// Creates an empty scope.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracks a manager until the next [`LockScope::release_all`].
    pub fn register(&mut self, manager: Arc<dyn ReleaseAll>) {
        self.managers.push(manager);
    }

    /// Number of managers tracked.
    #[must_use]
    pub fn len(&self) -> usize {
        self.managers.len()
    }

    /// Whether no managers are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.managers.is_empty()
    }

    /// Releases every lock of every registered manager, then forgets the
    /// managers.
    pub async fn release_all(&mut self) {
        let managers = std::mem::take(&mut self.managers);
        debug!(managers = managers.len(), "Releasing locks held in scope.");

        for manager in managers {
            manager.release_all().await;
        }
    }
}

impl fmt::Debug for LockScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockScope")
            .field("managers", &self.managers.len())
            .finish()
    }
}
