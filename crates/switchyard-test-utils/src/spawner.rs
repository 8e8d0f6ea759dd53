//! Scripted worker spawner.
//!
//! Stands in for [`ProcessSpawner`](switchyard::cluster::ProcessSpawner) so
//! supervisor tests run without child processes. Each spawned "worker" lives
//! until the test crashes it or, unless told otherwise, until it receives the
//! shutdown sentinel (then it exits 0).

use async_trait::async_trait;
use futures::future::FutureExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use switchyard::cluster::{SpawnedWorker, WorkerControl, WorkerExit, WorkerSpawner};
use switchyard::errors::SwitchyardError;
use tokio::sync::{oneshot, Notify};

#[derive(Default)]
struct Inner {
    next_spawn: u64,
    /// Live fake worker per slot: (spawn id, exit trigger).
    live: HashMap<usize, (u64, oneshot::Sender<WorkerExit>)>,
    spawns_per_slot: HashMap<usize, usize>,
    total_spawns: usize,
    sentinels: usize,
    fail_next: usize,
    ignore_shutdown: bool,
}

/// Spawner whose workers the test controls. Clone to share.
#[derive(Clone, Default)]
pub struct ScriptedSpawner {
    inner: Arc<Mutex<Inner>>,
    spawned: Arc<Notify>,
}

impl ScriptedSpawner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Workers that ignore the sentinel and never exit on their own.
    pub fn ignoring_shutdown(self) -> Self {
        self.lock().ignore_shutdown = true;
        self
    }

    /// The next `count` spawn attempts fail.
    pub fn fail_next_spawns(&self, count: usize) {
        self.lock().fail_next = count;
    }

    pub fn as_spawner(&self) -> Arc<dyn WorkerSpawner> {
        Arc::new(self.clone())
    }

    /// Make the live worker in `slot` exit with `code`. Returns false if the
    /// slot has no live worker.
    pub fn crash(&self, slot: usize, code: i32) -> bool {
        self.exit(slot, WorkerExit::code(code))
    }

    /// Make the live worker in `slot` exit with `exit`.
    pub fn exit(&self, slot: usize, exit: WorkerExit) -> bool {
        match self.lock().live.remove(&slot) {
            Some((_, trigger)) => trigger.send(exit).is_ok(),
            None => false,
        }
    }

    /// Exit every live worker with code 0.
    pub fn release_all(&self) {
        let live: Vec<_> = self.lock().live.drain().collect();
        for (_, (_, trigger)) in live {
            let _ = trigger.send(WorkerExit::code(0));
        }
    }

    /// Successful spawns so far.
    pub fn spawn_count(&self) -> usize {
        self.lock().total_spawns
    }

    pub fn spawns_for(&self, slot: usize) -> usize {
        self.lock().spawns_per_slot.get(&slot).copied().unwrap_or(0)
    }

    /// Slots with a live worker.
    pub fn live_count(&self) -> usize {
        self.lock().live.len()
    }

    /// Shutdown sentinels delivered.
    pub fn sentinel_count(&self) -> usize {
        self.lock().sentinels
    }

    /// Wait until at least `count` successful spawns happened.
    pub async fn wait_for_spawns(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let notified = self.spawned.notified();
                if self.spawn_count() >= count {
                    return;
                }
                notified.await;
            }
        })
        .await
        .unwrap_or_else(|_| {
            panic!(
                "expected {count} spawns, saw {}",
                self.spawn_count()
            )
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl WorkerSpawner for ScriptedSpawner {
    fn spawn(&self, slot: usize) -> Result<SpawnedWorker, SwitchyardError> {
        let mut inner = self.lock();
        if inner.fail_next > 0 {
            inner.fail_next -= 1;
            return Err(SwitchyardError::Spawn(format!("scripted spawn failure for slot {slot}")));
        }

        inner.next_spawn += 1;
        let spawn_id = inner.next_spawn;
        let (trigger, exited) = oneshot::channel();
        inner.live.insert(slot, (spawn_id, trigger));
        *inner.spawns_per_slot.entry(slot).or_default() += 1;
        inner.total_spawns += 1;
        drop(inner);
        self.spawned.notify_waiters();

        Ok(SpawnedWorker {
            pid: u32::try_from(10_000 + spawn_id).ok(),
            control: Box::new(ScriptedControl {
                slot,
                spawn_id,
                spawner: self.clone(),
            }),
            // A dropped trigger means the test tore the spawner down.
            exited: async move { exited.await.unwrap_or(WorkerExit { code: None }) }.boxed(),
        })
    }
}

struct ScriptedControl {
    slot: usize,
    spawn_id: u64,
    spawner: ScriptedSpawner,
}

#[async_trait]
impl WorkerControl for ScriptedControl {
    async fn send_shutdown(&mut self) -> Result<(), SwitchyardError> {
        let mut inner = self.spawner.lock();
        inner.sentinels += 1;
        if inner.ignore_shutdown {
            return Ok(());
        }
        let is_this_worker =
            matches!(inner.live.get(&self.slot), Some((id, _)) if *id == self.spawn_id);
        if is_this_worker {
            if let Some((_, trigger)) = inner.live.remove(&self.slot) {
                let _ = trigger.send(WorkerExit::code(0));
            }
        }
        Ok(())
    }
}
