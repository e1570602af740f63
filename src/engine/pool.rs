use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::engine::template::IterationScope;

// Time cancelled iterations get to hand back their partial result before their tasks are aborted.
const HARD_STOP_GRACE: Duration = Duration::from_secs(1);

/// A virtual user. Runs iterations strictly one after another.
#[derive(Debug)]
pub struct Vu {
    pub id: u64,
    pub scenario: Arc<str>,
    /// Iterations started by this VU.
    pub iterations: u64,
    pub scope: IterationScope,
    pub rng: StdRng,
}

impl Vu {
    fn new(id: u64, scenario: Arc<str>, seed: u64) -> Self {
        Self {
            id,
            scenario,
            iterations: 0,
            scope: IterationScope::default(),
            rng: StdRng::seed_from_u64(seed ^ id.wrapping_mul(0x9E37_79B9_7F4A_7C15)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownSummary {
    /// Tasks that finished on their own within the grace period.
    pub completed: u64,
    /// Tasks still running when the grace period ran out.
    pub force_stopped: u64,
}

/// The VUs of one executor.
///
/// Idle VUs wait in a bounded free list; `created` counts idle plus checked-out
/// VUs and never exceeds `max_vus`, so neither does `active`.
pub struct VuPool {
    scenario: Arc<str>,
    max_vus: u64,
    seed: u64,
    idle_tx: Sender<Vu>,
    idle_rx: Receiver<Vu>,
    created: AtomicU64,
    active: AtomicU64,
    peak: AtomicU64,
    ids: Arc<AtomicU64>,
    tasks: Mutex<JoinSet<()>>,
}

impl VuPool {
    /// `ids` hands out run-unique VU ids across all pools.
    pub fn new(scenario: Arc<str>, max_vus: u64, seed: u64, ids: Arc<AtomicU64>) -> Self {
        let (idle_tx, idle_rx) = bounded(max_vus.max(1) as usize);
        Self {
            scenario,
            max_vus,
            seed,
            idle_tx,
            idle_rx,
            created: AtomicU64::new(0),
            active: AtomicU64::new(0),
            peak: AtomicU64::new(0),
            ids,
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    /// VUs currently checked out.
    pub fn active(&self) -> u64 {
        self.active.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> u64 {
        self.peak.load(Ordering::SeqCst)
    }

    /// VUs in existence, idle or checked out.
    pub fn created(&self) -> u64 {
        self.created.load(Ordering::SeqCst)
    }

    fn reserve_slot(&self) -> bool {
        self.created
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.max_vus).then_some(n + 1)
            })
            .is_ok()
    }

    fn new_vu(&self) -> Vu {
        let id = self.ids.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!(scenario = %self.scenario, vu = id, "vu created");
        Vu::new(id, self.scenario.clone(), self.seed)
    }

    fn check_out(&self, vu: Vu) -> Vu {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        vu
    }

    /// Create idle VUs up front, up to `max_vus`.
    pub fn preallocate(&self, n: u64) {
        for _ in 0..n {
            if !self.reserve_slot() {
                break;
            }
            let vu = self.new_vu();
            if self.idle_tx.try_send(vu).is_err() {
                self.created.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    /// An idle VU, or a new one while below the cap. `None` when exhausted.
    pub fn acquire(&self) -> Option<Vu> {
        if let Ok(vu) = self.idle_rx.try_recv() {
            return Some(self.check_out(vu));
        }
        if !self.reserve_slot() {
            return None;
        }
        Some(self.check_out(self.new_vu()))
    }

    /// Return a VU to the free list with a clean scope.
    pub fn release(&self, mut vu: Vu) {
        vu.scope.clear();
        self.active.fetch_sub(1, Ordering::SeqCst);
        if self.idle_tx.try_send(vu).is_err() {
            self.created.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Discard a checked-out VU and free its slot.
    pub fn retire(&self, vu: Vu) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.created.fetch_sub(1, Ordering::SeqCst);
        tracing::debug!(scenario = %self.scenario, vu = vu.id, iterations = vu.iterations, "vu retired");
    }

    /// Track a VU task so shutdown can wait for it.
    pub fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock();
        while tasks.try_join_next().is_some() {}
        tasks.spawn(fut);
    }

    /// Wait up to `grace` for tracked tasks, then cancel `hard` and abort stragglers.
    pub async fn shutdown(&self, grace: Duration, hard: &CancellationToken) -> ShutdownSummary {
        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        let mut summary = ShutdownSummary::default();
        // No deadline when the grace period runs past any representable instant.
        let deadline = tokio::time::Instant::now().checked_add(grace);

        loop {
            let joined = match deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, tasks.join_next()).await,
                None => Ok(tasks.join_next().await),
            };
            match joined {
                Ok(Some(_)) => summary.completed += 1,
                Ok(None) => break,
                Err(_) => {
                    summary.force_stopped = tasks.len() as u64;
                    tracing::warn!(
                        scenario = %self.scenario,
                        remaining = summary.force_stopped,
                        "graceful stop expired, interrupting iterations"
                    );
                    hard.cancel();
                    let drain = tokio::time::Instant::now() + HARD_STOP_GRACE;
                    while let Ok(Some(_)) = tokio::time::timeout_at(drain, tasks.join_next()).await {}
                    tasks.abort_all();
                    while tasks.join_next().await.is_some() {}
                    break;
                }
            }
        }
        hard.cancel();

        // VUs held by aborted tasks were dropped without being handed back.
        let lost = self.active.swap(0, Ordering::SeqCst);
        if lost > 0 {
            self.created.fetch_sub(lost, Ordering::SeqCst);
            tracing::debug!(scenario = %self.scenario, vus = lost, "discarded VUs of aborted tasks");
        }

        // Idle VUs are torn down with the pool.
        while let Ok(vu) = self.idle_rx.try_recv() {
            self.created.fetch_sub(1, Ordering::SeqCst);
            drop(vu);
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(max: u64) -> VuPool {
        VuPool::new(Arc::from("test"), max, 7, Arc::new(AtomicU64::new(0)))
    }

    #[test]
    fn test_acquire_respects_max_vus() {
        let pool = pool(3);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        let c = pool.acquire().unwrap();
        assert!(pool.acquire().is_none());
        assert_eq!(pool.active(), 3);
        assert_eq!(pool.peak(), 3);

        pool.release(b);
        assert_eq!(pool.active(), 2);
        let again = pool.acquire().unwrap();
        assert_eq!(pool.created(), 3);
        pool.release(a);
        pool.release(c);
        pool.release(again);
        assert_eq!(pool.active(), 0);
        assert_eq!(pool.peak(), 3);
    }

    #[test]
    fn test_release_clears_scope_and_reuses_vu() {
        let pool = pool(1);
        let mut vu = pool.acquire().unwrap();
        let id = vu.id;
        vu.scope.set("token", "abc");
        pool.release(vu);
        let vu = pool.acquire().unwrap();
        assert_eq!(vu.id, id);
        assert!(vu.scope.is_empty());
    }

    #[test]
    fn test_retire_frees_slot() {
        let pool = pool(1);
        let vu = pool.acquire().unwrap();
        let first = vu.id;
        pool.retire(vu);
        assert_eq!(pool.created(), 0);
        let vu = pool.acquire().unwrap();
        assert_ne!(vu.id, first);
    }

    #[test]
    fn test_preallocate_caps_at_max() {
        let pool = pool(4);
        pool.preallocate(10);
        assert_eq!(pool.created(), 4);
        assert_eq!(pool.active(), 0);
        let vus: Vec<_> = (0..4).map(|_| pool.acquire().unwrap()).collect();
        assert!(pool.acquire().is_none());
        assert_eq!(vus.len(), 4);
    }

    #[test]
    fn test_concurrent_acquire_never_exceeds_max() {
        let pool = Arc::new(pool(5));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        if let Some(vu) = pool.acquire() {
                            assert!(pool.active() <= 5);
                            pool.release(vu);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(pool.peak() <= 5);
        assert_eq!(pool.active(), 0);
        assert!(pool.created() <= 5);
    }

    #[test]
    fn test_vu_ids_unique_across_pools() {
        let ids = Arc::new(AtomicU64::new(0));
        let a = VuPool::new(Arc::from("a"), 2, 0, ids.clone());
        let b = VuPool::new(Arc::from("b"), 2, 0, ids);
        let x = a.acquire().unwrap();
        let y = b.acquire().unwrap();
        assert_ne!(x.id, y.id);
        assert_eq!(&*y.scenario, "b");
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_waits_for_grace() {
        let pool = pool(2);
        pool.spawn(async {
            tokio::time::sleep(Duration::from_secs(2)).await;
        });
        let hard = CancellationToken::new();
        let summary = pool.shutdown(Duration::from_secs(5), &hard).await;
        assert_eq!(summary, ShutdownSummary { completed: 1, force_stopped: 0 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_force_stops_after_grace() {
        let pool = pool(2);
        let hard = CancellationToken::new();
        let observed = hard.clone();
        pool.spawn(async move {
            observed.cancelled().await;
        });
        pool.spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        let started = tokio::time::Instant::now();
        let summary = pool.shutdown(Duration::from_secs(1), &hard).await;
        assert_eq!(summary.force_stopped, 2);
        assert_eq!(summary.completed, 0);
        assert!(hard.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_shutdown_leaves_no_vus() {
        let pool = Arc::new(pool(4));
        let hard = CancellationToken::new();
        let cooperative = pool.acquire().unwrap();
        let stuck = pool.acquire().unwrap();
        pool.preallocate(1);
        assert_eq!(pool.created(), 3);

        let task_pool = pool.clone();
        let token = hard.clone();
        pool.spawn(async move {
            token.cancelled().await;
            task_pool.retire(cooperative);
        });
        pool.spawn(async move {
            let _held = stuck;
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });

        let summary = pool.shutdown(Duration::from_secs(1), &hard).await;
        assert_eq!(summary.force_stopped, 2);
        assert_eq!(pool.active(), 0);
        assert_eq!(pool.created(), 0);
        assert_eq!(pool.peak(), 2);
    }
}
