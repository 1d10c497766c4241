//! Browser pool management for concurrent capture jobs
//!
//! This module owns every live browser process. Instances are lent to one job
//! at a time through a [`PooledBrowser`] lease, capped at
//! `PoolConfig::max_instances`, evicted least-recently-used when the cap is
//! reached, and closed by a periodic sweep once idle for too long.
//!
//! All slot bookkeeping happens under a single lock that is never held across
//! an await. Launching and closing processes happen outside it; a slot being
//! launched is reserved first so it already counts towards the cap. The
//! reservation is released if the acquiring future is dropped mid-launch.

use crate::renderer::{Browser, BrowserLauncher};
use crate::{BrowserKind, CaptureError, Metrics, PoolConfig};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, error, info, warn};

/// Point-in-time pool occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Live or launching instances; never exceeds `max`
    pub active: usize,
    pub max: usize,
    pub leased: usize,
    pub idle: usize,
    pub launching: usize,
}

impl PoolStats {
    pub fn utilization(&self) -> f64 {
        if self.max == 0 {
            return 0.0;
        }
        self.leased as f64 / self.max as f64
    }
}

struct Slot {
    id: usize,
    kind: BrowserKind,
    created_at: Instant,
    last_used_at: Instant,
    leased: bool,
    /// `None` while the process is still launching
    browser: Option<Arc<dyn Browser>>,
    uses: usize,
}

impl Slot {
    fn is_idle(&self) -> bool {
        !self.leased && self.browser.is_some()
    }
}

enum Plan {
    Reuse(usize, Arc<dyn Browser>),
    Launch(usize),
    Wait,
}

struct PoolInner {
    launcher: Arc<dyn BrowserLauncher>,
    config: PoolConfig,
    slots: Mutex<Vec<Slot>>,
    released: Notify,
    next_id: AtomicUsize,
    shutting_down: AtomicBool,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    metrics: Arc<Metrics>,
}

/// Bounded pool of browser instances shared by all jobs.
#[derive(Clone)]
pub struct BrowserPool {
    inner: Arc<PoolInner>,
}

impl BrowserPool {
    pub fn new(
        config: PoolConfig,
        launcher: Arc<dyn BrowserLauncher>,
        metrics: Arc<Metrics>,
    ) -> Self {
        info!(
            "Browser pool created: max {} instances, idle timeout {:?}",
            config.max_instances, config.idle_timeout
        );
        Self {
            inner: Arc::new(PoolInner {
                launcher,
                config,
                slots: Mutex::new(Vec::new()),
                released: Notify::new(),
                next_id: AtomicUsize::new(0),
                shutting_down: AtomicBool::new(false),
                sweeper: Mutex::new(None),
                metrics,
            }),
        }
    }

    /// Lends an instance of `kind` to the caller.
    ///
    /// An idle instance of the same kind is reused; otherwise a new one is
    /// launched if the pool is below capacity, or after evicting the
    /// least-recently-used idle instance. When every instance is leased the
    /// call waits up to `acquire_timeout` for a release and then fails with
    /// [`CaptureError::PoolExhausted`].
    pub async fn acquire(&self, kind: BrowserKind) -> Result<PooledBrowser, CaptureError> {
        let deadline = Instant::now() + self.inner.config.acquire_timeout;

        loop {
            if self.inner.shutting_down.load(Ordering::Acquire) {
                return Err(CaptureError::ShuttingDown);
            }

            // Registered before inspecting the slots so a release between the
            // check and the wait is not missed.
            let notified = self.inner.released.notified();

            let (plan, discarded) = self.plan(kind);
            if !discarded.is_empty() {
                self.inner.metrics.pool_evictions.increment(discarded.len() as u64);
                close_instances(discarded).await;
            }

            match plan {
                Plan::Reuse(id, browser) => {
                    debug!("Reusing browser instance {}", id);
                    return Ok(self.lease(id, kind, browser));
                }
                Plan::Launch(id) => {
                    let browser = self.launch(id, kind).await?;
                    return Ok(self.lease(id, kind, browser));
                }
                Plan::Wait => {
                    if Instant::now() >= deadline {
                        return Err(CaptureError::PoolExhausted {
                            max: self.inner.config.max_instances,
                        });
                    }
                    debug!("All browser instances busy, waiting for a release");
                    let _ = timeout_at(deadline, notified).await;
                }
            }
        }
    }

    /// Decides how to satisfy an acquisition, returning any instances that
    /// were removed from the pool and still need closing.
    fn plan(&self, kind: BrowserKind) -> (Plan, Vec<(usize, Arc<dyn Browser>)>) {
        let mut slots = self.inner.slots.lock();
        let now = Instant::now();

        let mut discarded = Vec::new();
        slots.retain(|slot| match &slot.browser {
            Some(browser) if !slot.leased && !browser.is_alive() => {
                warn!("Browser instance {} died while idle, discarding", slot.id);
                discarded.push((slot.id, browser.clone()));
                false
            }
            _ => true,
        });

        let reusable = slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_idle() && s.kind == kind)
            .min_by_key(|(_, s)| s.last_used_at)
            .map(|(index, _)| index);

        if let Some(index) = reusable {
            let slot = &mut slots[index];
            slot.leased = true;
            slot.last_used_at = now;
            slot.uses += 1;
            let id = slot.id;
            if let Some(browser) = slot.browser.clone() {
                self.publish(&slots);
                return (Plan::Reuse(id, browser), discarded);
            }
        }

        if slots.len() >= self.inner.config.max_instances {
            let lru = slots
                .iter()
                .enumerate()
                .filter(|(_, s)| s.is_idle())
                .min_by_key(|(_, s)| s.last_used_at)
                .map(|(index, _)| index);

            match lru {
                Some(index) => {
                    let slot = slots.remove(index);
                    info!(
                        "Evicting least-recently-used browser instance {} ({} uses, age {:?})",
                        slot.id,
                        slot.uses,
                        now.duration_since(slot.created_at)
                    );
                    if let Some(browser) = slot.browser {
                        discarded.push((slot.id, browser));
                    }
                }
                None => return (Plan::Wait, discarded),
            }
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        slots.push(Slot {
            id,
            kind,
            created_at: now,
            last_used_at: now,
            leased: true,
            browser: None,
            uses: 1,
        });
        self.publish(&slots);

        (Plan::Launch(id), discarded)
    }

    async fn launch(&self, id: usize, kind: BrowserKind) -> Result<Arc<dyn Browser>, CaptureError> {
        let mut reservation = Reservation {
            inner: &self.inner,
            id,
            armed: true,
        };
        let launch_timeout = self.inner.config.launch_timeout;
        let result = match timeout(launch_timeout, self.inner.launcher.launch(id, kind)).await {
            Ok(result) => result,
            Err(_) => Err(CaptureError::Timeout(launch_timeout)),
        };

        let browser = match result {
            Ok(browser) => browser,
            Err(e) => {
                error!("Failed to launch browser instance {}: {}", id, e);
                drop(reservation);
                return Err(match e {
                    CaptureError::BrowserLaunchFailed(_) => e,
                    other => CaptureError::BrowserLaunchFailed(other.to_string()),
                });
            }
        };
        self.inner.metrics.pool_launches.increment(1);

        let installed = {
            let mut slots = self.inner.slots.lock();
            match slots.iter_mut().find(|s| s.id == id) {
                Some(slot) => {
                    slot.browser = Some(browser.clone());
                    true
                }
                None => false,
            }
        };

        reservation.armed = false;

        if !installed {
            // Shut down or reclaimed by the sweep while launching.
            close_instances(vec![(id, browser)]).await;
            if self.inner.shutting_down.load(Ordering::Acquire) {
                return Err(CaptureError::ShuttingDown);
            }
            return Err(CaptureError::BrowserLaunchFailed(format!(
                "instance {id} was reclaimed while launching"
            )));
        }
        Ok(browser)
    }

    fn lease(&self, id: usize, kind: BrowserKind, browser: Arc<dyn Browser>) -> PooledBrowser {
        PooledBrowser {
            id,
            kind,
            browser,
            pool: Arc::downgrade(&self.inner),
        }
    }

    /// Returns a leased instance to the pool. `last_used_at` is left as it
    /// was at acquisition.
    fn release(inner: &PoolInner, id: usize) {
        let mut slots = inner.slots.lock();
        match slots.iter_mut().find(|s| s.id == id) {
            Some(slot) => {
                slot.leased = false;
                debug!("Browser instance {} returned to pool", id);
            }
            None => debug!("Released browser instance {} is no longer pooled", id),
        }
        publish_stats(inner, &slots);
        drop(slots);
        inner.released.notify_waiters();
    }

    /// Closes every instance unused for longer than `idle_timeout`,
    /// including leases that were never returned, and frees reservations
    /// stuck launching for longer than `launch_timeout`. Returns how many
    /// slots were reclaimed.
    pub async fn sweep(&self) -> usize {
        let idle_timeout = self.inner.config.idle_timeout;
        let launch_timeout = self.inner.config.launch_timeout;
        let now = Instant::now();
        let mut abandoned = 0;

        let expired: Vec<(usize, Arc<dyn Browser>)> = {
            let mut slots = self.inner.slots.lock();
            let mut expired = Vec::new();
            slots.retain(|slot| {
                let Some(browser) = &slot.browser else {
                    if now.duration_since(slot.created_at) > launch_timeout {
                        warn!(
                            "Reclaiming browser instance {} stuck launching for over {:?}",
                            slot.id, launch_timeout
                        );
                        abandoned += 1;
                        return false;
                    }
                    return true;
                };
                if now.duration_since(slot.last_used_at) <= idle_timeout {
                    return true;
                }
                if slot.leased {
                    warn!(
                        "Force-releasing browser instance {} leased for over {:?}",
                        slot.id, idle_timeout
                    );
                } else {
                    debug!("Browser instance {} idle for over {:?}", slot.id, idle_timeout);
                }
                expired.push((slot.id, browser.clone()));
                false
            });
            self.publish(&slots);
            expired
        };

        let count = expired.len() + abandoned;
        if count > 0 {
            info!("Idle sweep reclaiming {} browser slot(s)", count);
            self.inner.metrics.pool_swept.increment(count as u64);
            close_instances(expired).await;
            self.inner.released.notify_waiters();
        }
        count
    }

    /// Starts the periodic idle sweep. Calling it again replaces the
    /// previous sweeper.
    pub fn start_sweeper(&self) {
        let interval = self.inner.config.sweep_interval;
        let weak: Weak<PoolInner> = Arc::downgrade(&self.inner);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                BrowserPool { inner }.sweep().await;
            }
        });

        if let Some(previous) = self.inner.sweeper.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Closes every instance concurrently and stops the sweeper. Failures
    /// are logged; the pool rejects further acquisitions afterwards.
    pub async fn close_all(&self) {
        self.inner.shutting_down.store(true, Ordering::Release);
        if let Some(sweeper) = self.inner.sweeper.lock().take() {
            sweeper.abort();
        }

        let instances: Vec<(usize, Arc<dyn Browser>)> = {
            let mut slots = self.inner.slots.lock();
            let drained = slots
                .drain(..)
                .filter_map(|slot| slot.browser.map(|b| (slot.id, b)))
                .collect();
            self.publish(&slots);
            drained
        };

        info!("Closing {} browser instance(s)", instances.len());
        close_instances(instances).await;
        self.inner.released.notify_waiters();
        info!("Browser pool shut down");
    }

    pub fn stats(&self) -> PoolStats {
        let slots = self.inner.slots.lock();
        compute_stats(&slots, self.inner.config.max_instances)
    }

    fn publish(&self, slots: &[Slot]) {
        publish_stats(&self.inner, slots);
    }
}

fn compute_stats(slots: &[Slot], max: usize) -> PoolStats {
    let launching = slots.iter().filter(|s| s.browser.is_none()).count();
    let leased = slots.iter().filter(|s| s.leased).count();
    PoolStats {
        active: slots.len(),
        max,
        leased,
        idle: slots.len() - leased,
        launching,
    }
}

fn publish_stats(inner: &PoolInner, slots: &[Slot]) {
    inner
        .metrics
        .record_pool(&compute_stats(slots, inner.config.max_instances));
}

/// Slot reserved for a launch in progress. Dropping it while still armed
/// removes the slot, so an acquisition abandoned mid-launch does not hold a
/// place in the pool.
struct Reservation<'a> {
    inner: &'a PoolInner,
    id: usize,
    armed: bool,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut slots = self.inner.slots.lock();
        let before = slots.len();
        slots.retain(|s| s.id != self.id || s.browser.is_some());
        if slots.len() != before {
            debug!("Freed reservation of browser instance {}", self.id);
            publish_stats(self.inner, &slots);
        }
        drop(slots);
        self.inner.released.notify_waiters();
    }
}

async fn close_instances(instances: Vec<(usize, Arc<dyn Browser>)>) {
    let closes = instances.into_iter().map(|(id, browser)| async move {
        if let Err(e) = browser.close().await {
            warn!("Failed to close browser instance {}: {}", id, e);
        }
    });
    join_all(closes).await;
}

/// Exclusive loan of one browser instance. Dropping it returns the
/// instance to the pool.
pub struct PooledBrowser {
    id: usize,
    kind: BrowserKind,
    browser: Arc<dyn Browser>,
    pool: Weak<PoolInner>,
}

impl PooledBrowser {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn kind(&self) -> BrowserKind {
        self.kind
    }

    pub fn browser(&self) -> &Arc<dyn Browser> {
        &self.browser
    }

    /// Marks the instance as in active use so the idle sweep leaves it
    /// alone during long jobs.
    pub fn touch(&self) {
        if let Some(inner) = self.pool.upgrade() {
            if let Some(slot) = inner.slots.lock().iter_mut().find(|s| s.id == self.id) {
                slot.last_used_at = Instant::now();
            }
        }
    }

    pub fn release(self) {}
}

impl std::fmt::Debug for PooledBrowser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBrowser")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

impl Drop for PooledBrowser {
    fn drop(&mut self) {
        if let Some(inner) = self.pool.upgrade() {
            BrowserPool::release(&inner, self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::fake::{FakeLauncher, FakeSite};
    use crate::PoolConfig;
    use std::time::Duration;

    fn pool_with(max: usize, acquire_timeout: Duration) -> (BrowserPool, Arc<FakeLauncher>) {
        let launcher = Arc::new(FakeLauncher::new(FakeSite::default()));
        let config = PoolConfig {
            max_instances: max,
            idle_timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
            acquire_timeout,
            launch_timeout: Duration::from_secs(5),
        };
        let pool = BrowserPool::new(config, launcher.clone(), Arc::new(Metrics::new()));
        (pool, launcher)
    }

    #[tokio::test]
    async fn reuses_released_instance_of_same_kind() {
        let (pool, launcher) = pool_with(2, Duration::ZERO);

        let first = pool.acquire(BrowserKind::Chromium).await.unwrap();
        let id = first.id();
        first.release();

        let second = pool.acquire(BrowserKind::Chromium).await.unwrap();
        assert_eq!(second.id(), id);
        assert_eq!(launcher.launched(), 1);
        assert_eq!(pool.stats().active, 1);
    }

    #[tokio::test]
    async fn fails_fast_when_every_instance_is_leased() {
        let (pool, _) = pool_with(1, Duration::ZERO);

        let _held = pool.acquire(BrowserKind::Chromium).await.unwrap();
        let err = pool.acquire(BrowserKind::Chromium).await.unwrap_err();
        assert!(matches!(err, CaptureError::PoolExhausted { max: 1 }));
        assert_eq!(pool.stats().active, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn evicts_least_recently_used_idle_instance_at_capacity() {
        let (pool, launcher) = pool_with(2, Duration::ZERO);

        let a = pool.acquire(BrowserKind::Chromium).await.unwrap();
        let a_id = a.id();
        tokio::time::advance(Duration::from_secs(1)).await;
        let b = pool.acquire(BrowserKind::Chromium).await.unwrap();
        let b_id = b.id();
        a.release();
        b.release();

        // Both idle but of the wrong kind: the older one goes.
        let mobile = pool.acquire(BrowserKind::ChromiumMobile).await.unwrap();
        assert_ne!(mobile.id(), a_id);
        assert_eq!(pool.stats().active, 2);
        assert!(launcher.closed_ids().contains(&a_id));
        assert!(!launcher.closed_ids().contains(&b_id));
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_release_within_acquire_timeout() {
        let (pool, launcher) = pool_with(1, Duration::from_secs(5));

        let held = pool.acquire(BrowserKind::Chromium).await.unwrap();
        let held_id = held.id();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            held.release();
        });

        let next = pool.acquire(BrowserKind::Chromium).await.unwrap();
        assert_eq!(next.id(), held_id);
        assert_eq!(launcher.launched(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_closes_instances_idle_past_timeout() {
        let (pool, launcher) = pool_with(3, Duration::ZERO);

        let stale = pool.acquire(BrowserKind::Chromium).await.unwrap();
        let stale_id = stale.id();
        stale.release();

        tokio::time::advance(Duration::from_secs(200)).await;
        let fresh = pool.acquire(BrowserKind::ChromiumMobile).await.unwrap();
        tokio::time::advance(Duration::from_secs(101)).await;

        assert_eq!(pool.sweep().await, 1);
        assert_eq!(launcher.closed_ids(), vec![stale_id]);
        assert_eq!(pool.stats().active, 1);
        drop(fresh);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_force_releases_leaked_lease() {
        let (pool, launcher) = pool_with(1, Duration::ZERO);
        pool.start_sweeper();

        let leaked = pool.acquire(BrowserKind::Chromium).await.unwrap();
        let leaked_id = leaked.id();
        std::mem::forget(leaked);

        // idle timeout (300s) plus at most one sweep interval (60s)
        tokio::time::sleep(Duration::from_secs(361)).await;

        assert!(launcher.closed_ids().contains(&leaked_id));
        assert_eq!(pool.stats().active, 0);
        assert!(pool.acquire(BrowserKind::Chromium).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn touch_keeps_long_lease_alive() {
        let (pool, launcher) = pool_with(1, Duration::ZERO);

        let lease = pool.acquire(BrowserKind::Chromium).await.unwrap();
        tokio::time::advance(Duration::from_secs(250)).await;
        lease.touch();
        tokio::time::advance(Duration::from_secs(250)).await;

        assert_eq!(pool.sweep().await, 0);
        assert!(launcher.closed_ids().is_empty());
    }

    #[tokio::test]
    async fn failed_launch_frees_the_reserved_slot() {
        let (pool, launcher) = pool_with(1, Duration::ZERO);
        launcher.fail_next_launch();

        let err = pool.acquire(BrowserKind::Chromium).await.unwrap_err();
        assert!(matches!(err, CaptureError::BrowserLaunchFailed(_)));
        assert_eq!(pool.stats().active, 0);
        assert!(pool.acquire(BrowserKind::Chromium).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_launch_frees_the_reserved_slot() {
        let (pool, launcher) = pool_with(1, Duration::ZERO);
        launcher.set_launch_delay(Duration::from_secs(3));

        let abandoned = timeout(
            Duration::from_millis(100),
            pool.acquire(BrowserKind::Chromium),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(pool.stats().active, 0);
        assert_eq!(pool.stats().launching, 0);

        launcher.set_launch_delay(Duration::ZERO);
        let lease = pool.acquire(BrowserKind::Chromium).await.unwrap();
        assert_eq!(launcher.launched(), 1);
        assert_eq!(pool.stats().active, 1);
        drop(lease);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_reclaims_reservation_stuck_launching() {
        let (pool, _) = pool_with(1, Duration::ZERO);

        // A reservation nobody will ever complete.
        let (plan, _) = pool.plan(BrowserKind::Chromium);
        assert!(matches!(plan, Plan::Launch(_)));
        assert_eq!(pool.stats().launching, 1);

        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(pool.sweep().await, 0);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(pool.sweep().await, 1);
        assert_eq!(pool.stats().active, 0);
        assert!(pool.acquire(BrowserKind::Chromium).await.is_ok());
    }

    #[tokio::test]
    async fn close_all_closes_everything_and_rejects_new_leases() {
        let (pool, launcher) = pool_with(3, Duration::ZERO);
        let a = pool.acquire(BrowserKind::Chromium).await.unwrap();
        let b = pool.acquire(BrowserKind::Chromium).await.unwrap();
        b.release();
        launcher.fail_closes();

        pool.close_all().await;

        assert_eq!(launcher.closed_ids().len(), 2);
        assert_eq!(pool.stats().active, 0);
        assert!(matches!(
            pool.acquire(BrowserKind::Chromium).await,
            Err(CaptureError::ShuttingDown)
        ));
        drop(a);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn active_never_exceeds_max_under_contention() {
        let (pool, launcher) = pool_with(2, Duration::from_secs(10));
        launcher.set_launch_delay(Duration::from_millis(5));

        let mut tasks = Vec::new();
        for i in 0..16 {
            let pool = pool.clone();
            tasks.push(tokio::spawn(async move {
                let kind = if i % 3 == 0 {
                    BrowserKind::ChromiumMobile
                } else {
                    BrowserKind::Chromium
                };
                let lease = pool.acquire(kind).await.unwrap();
                assert!(pool.stats().active <= 2);
                tokio::time::sleep(Duration::from_millis(2)).await;
                lease.release();
                assert!(pool.stats().active <= 2);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert!(launcher.max_live() <= 2);
    }
}
