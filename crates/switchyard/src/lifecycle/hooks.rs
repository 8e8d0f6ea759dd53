//! Hook storage and handles.

use super::Inner;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, Weak};

pub(super) type HookFn = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    Init,
    Start,
    Ready,
    BeforeShutdown,
    Shutdown,
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HookKind::Init => "init",
            HookKind::Start => "start",
            HookKind::Ready => "ready",
            HookKind::BeforeShutdown => "before_shutdown",
            HookKind::Shutdown => "shutdown",
        })
    }
}

/// A resource released during shutdown.
#[async_trait]
pub trait Disposable: Send + Sync {
    fn name(&self) -> &str;

    async fn dispose(&self) -> anyhow::Result<()>;
}

#[derive(Default)]
pub(super) struct HookTable {
    next_id: u64,
    hooks: HashMap<HookKind, Vec<(u64, HookFn)>>,
}

impl HookTable {
    pub(super) fn insert(&mut self, kind: HookKind, hook: HookFn) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.hooks.entry(kind).or_default().push((id, hook));
        id
    }

    pub(super) fn remove(&mut self, kind: HookKind, id: u64) -> bool {
        let Some(hooks) = self.hooks.get_mut(&kind) else {
            return false;
        };
        let before = hooks.len();
        hooks.retain(|(hook_id, _)| *hook_id != id);
        hooks.len() != before
    }

    /// Hooks of `kind` in registration order, with their position.
    pub(super) fn snapshot(&self, kind: HookKind) -> Vec<(usize, HookFn)> {
        self.hooks
            .get(&kind)
            .map(|hooks| {
                hooks
                    .iter()
                    .enumerate()
                    .map(|(index, (_, hook))| (index, Arc::clone(hook)))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Returned by hook registration. Dropping it keeps the hook registered.
#[derive(Debug)]
pub struct HookHandle {
    id: u64,
    kind: HookKind,
    coordinator: Weak<Inner>,
}

impl HookHandle {
    pub(super) fn new(id: u64, kind: HookKind, coordinator: Weak<Inner>) -> Self {
        Self {
            id,
            kind,
            coordinator,
        }
    }

    pub fn kind(&self) -> HookKind {
        self.kind
    }

    /// Remove the hook. Returns false if it was already gone.
    pub fn unregister(self) -> bool {
        let Some(inner) = self.coordinator.upgrade() else {
            return false;
        };
        let mut hooks = inner.hooks.lock().unwrap_or_else(PoisonError::into_inner);
        hooks.remove(self.kind, self.id)
    }
}
