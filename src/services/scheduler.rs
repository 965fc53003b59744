//! Fixed-cadence fan-out of sync cycles over the subscribed tenants.
//!
//! A single timer thread ticks; every tick spawns one worker thread per
//! tenant. Workers are independent: a failing or slow tenant never delays
//! another tenant's cycle, and a tenant whose previous cycle is still running
//! is skipped rather than run twice.

use log::{debug, error, info, warn};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::models::c8y::{TenantContext, TenantId};
use crate::services::platform::SubscriptionRegistry;
use crate::services::sync::{SyncError, SyncJob, SyncReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cadence {
    /// Wait before the first tick.
    pub initial_delay: Duration,
    pub interval: Duration,
    /// Time budget of one tenant's cycle.
    pub cycle_timeout: Duration,
}

/// Running totals over all tenants since startup.
#[derive(Debug, Default)]
pub struct SyncStats {
    succeeded: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
    devices_created: AtomicU64,
    failures_by_kind: Mutex<BTreeMap<&'static str, u64>>,
}

impl SyncStats {
    fn record_success(&self, report: &SyncReport) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
        if report.device_created {
            self.devices_created.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn record_failure(&self, err: &SyncError) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        let mut by_kind = self.failures_by_kind.lock().unwrap_or_else(PoisonError::into_inner);
        *by_kind.entry(err.kind()).or_default() += 1;
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    pub fn devices_created(&self) -> u64 {
        self.devices_created.load(Ordering::Relaxed)
    }

    pub fn failures_by_kind(&self) -> BTreeMap<&'static str, u64> {
        self.failures_by_kind
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Removes the tenant from the in-flight set when its worker ends.
struct InFlight {
    set: Arc<Mutex<HashSet<TenantId>>>,
    tenant: TenantId,
}

impl InFlight {
    fn claim(set: &Arc<Mutex<HashSet<TenantId>>>, tenant: &TenantId) -> Option<InFlight> {
        let mut guard = set.lock().unwrap_or_else(PoisonError::into_inner);
        guard.insert(tenant.clone()).then(|| InFlight {
            set: Arc::clone(set),
            tenant: tenant.clone(),
        })
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.tenant);
    }
}

/// Dispatches one cycle per subscribed tenant.
pub struct Fanout {
    job: Arc<SyncJob>,
    registry: Arc<dyn SubscriptionRegistry>,
    cadence: Cadence,
    in_flight: Arc<Mutex<HashSet<TenantId>>>,
    stats: Arc<SyncStats>,
}

impl Fanout {
    pub fn new(job: Arc<SyncJob>, registry: Arc<dyn SubscriptionRegistry>, cadence: Cadence) -> Self {
        Fanout {
            job,
            registry,
            cadence,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            stats: Arc::new(SyncStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<SyncStats> {
        Arc::clone(&self.stats)
    }

    /// Start a worker for every subscribed tenant not already running.
    pub fn tick(&self) -> Vec<JoinHandle<()>> {
        let tenants = match self.registry.subscribed_tenants() {
            Ok(t) => t,
            Err(e) => {
                error!("Listing subscribed tenants failed, skipping tick: {}", e);
                return Vec::new();
            }
        };
        let subscribed = tenants.iter().map(|t| t.tenant().clone()).collect::<Vec<_>>();
        self.job.retain_tenants(&subscribed);

        let mut workers = Vec::with_capacity(tenants.len());
        for tenant in tenants {
            let Some(claim) = InFlight::claim(&self.in_flight, tenant.tenant()) else {
                warn!("tenant={} previous cycle still running; skipping this tick", tenant.tenant());
                self.stats.skipped.fetch_add(1, Ordering::Relaxed);
                continue;
            };
            match self.spawn_worker(tenant, claim) {
                Ok(handle) => workers.push(handle),
                Err(e) => error!("Spawning sync worker failed: {}", e),
            }
        }
        debug!("Tick dispatched {} worker(s)", workers.len());
        workers
    }

    fn spawn_worker(&self, tenant: TenantContext, claim: InFlight) -> std::io::Result<JoinHandle<()>> {
        let job = Arc::clone(&self.job);
        let stats = Arc::clone(&self.stats);
        let deadline_after = self.cadence.cycle_timeout;
        thread::Builder::new()
            .name(format!("sync-{}", tenant.tenant()))
            .spawn(move || {
                let _claim = claim;
                let started = Instant::now();
                match job.run(&tenant, started + deadline_after) {
                    Ok(report) => {
                        stats.record_success(&report);
                        info!(
                            "tenant={} device={} city={} synced in {}ms at {}",
                            report.tenant,
                            report.device,
                            report.weather.city,
                            started.elapsed().as_millis(),
                            report.completed_at.to_rfc3339()
                        );
                    }
                    Err(e) => {
                        stats.record_failure(&e);
                        error!("tenant={} stage={} cycle failed: {}", tenant.tenant(), e.kind(), e);
                    }
                }
            })
    }
}

/// Owns the timer thread; ticking stops when the scheduler is stopped.
pub struct Scheduler {
    stop_tx: mpsc::Sender<()>,
    timer: JoinHandle<Vec<JoinHandle<()>>>,
    stats: Arc<SyncStats>,
}

impl Scheduler {
    pub fn start(fanout: Fanout) -> std::io::Result<Scheduler> {
        let cadence = fanout.cadence;
        let (stop_tx, stop_rx) = mpsc::channel();
        let stats = fanout.stats();
        let timer = thread::Builder::new()
            .name("sync-timer".into())
            .spawn(move || run_timer(&fanout, &stop_rx))?;
        info!(
            "Scheduler started: first tick in {}s, then every {}s (cycle timeout {}s)",
            cadence.initial_delay.as_secs(),
            cadence.interval.as_secs(),
            cadence.cycle_timeout.as_secs()
        );
        Ok(Scheduler { stop_tx, timer, stats })
    }

    pub fn stats(&self) -> Arc<SyncStats> {
        Arc::clone(&self.stats)
    }

    /// Stop ticking and wait for running cycles to finish.
    pub fn stop(self) {
        // the timer may already be gone; either way it is not ticking anymore
        let _ = self.stop_tx.send(());
        let workers = match self.timer.join() {
            Ok(w) => w,
            Err(_) => {
                error!("Scheduler timer thread panicked");
                Vec::new()
            }
        };
        if !workers.is_empty() {
            info!("Waiting for {} running cycle(s)", workers.len());
        }
        for worker in workers {
            if worker.join().is_err() {
                error!("Sync worker panicked");
            }
        }
        info!(
            "Scheduler stopped (succeeded={}, failed={}, skipped={}, devices_created={})",
            self.stats.succeeded(),
            self.stats.failed(),
            self.stats.skipped(),
            self.stats.devices_created()
        );
    }
}

fn run_timer(fanout: &Fanout, stop_rx: &mpsc::Receiver<()>) -> Vec<JoinHandle<()>> {
    let cadence = fanout.cadence;
    let mut workers: Vec<JoinHandle<()>> = Vec::new();
    let mut wait = cadence.initial_delay;
    loop {
        match stop_rx.recv_timeout(wait) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
        let tick_start = Instant::now();

        workers.retain(|w| !w.is_finished());
        workers.extend(fanout.tick());
        let stats = &fanout.stats;
        info!(
            "Tick: {} cycle(s) running (totals: succeeded={}, failed={}, skipped={})",
            workers.len(),
            stats.succeeded(),
            stats.failed(),
            stats.skipped()
        );
        let failures = stats.failures_by_kind();
        if !failures.is_empty() {
            debug!("Failures by stage: {:?}", failures);
        }

        // Maintain steady cadence
        wait = cadence.interval.saturating_sub(tick_start.elapsed());
    }
    workers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::fakes::{FakePlatform, FakeWeather, snapshot, tenant};
    use crate::services::platform::{Platform, WeatherProvider};

    fn cadence(initial_delay: Duration, interval: Duration) -> Cadence {
        Cadence {
            initial_delay,
            interval,
            cycle_timeout: Duration::from_secs(30),
        }
    }

    fn fanout(platform: &Arc<FakePlatform>, weather: &Arc<FakeWeather>) -> Fanout {
        fanout_with(platform, weather, cadence(Duration::from_secs(10), Duration::from_secs(60)))
    }

    fn fanout_with(platform: &Arc<FakePlatform>, weather: &Arc<FakeWeather>, cadence: Cadence) -> Fanout {
        let job = SyncJob::new(
            Arc::clone(platform) as Arc<dyn Platform>,
            Arc::clone(weather) as Arc<dyn WeatherProvider>,
        );
        Fanout::new(
            Arc::new(job),
            Arc::clone(platform) as Arc<dyn SubscriptionRegistry>,
            cadence,
        )
    }

    fn join_all(workers: Vec<JoinHandle<()>>) {
        for w in workers {
            w.join().expect("worker");
        }
    }

    fn device_of(platform: &FakePlatform, tenant_id: &str) -> Option<crate::models::c8y::ManagedObjectId> {
        platform
            .state()
            .devices
            .iter()
            .find(|(_, d)| d.tenant.0 == tenant_id)
            .map(|(id, _)| id.clone())
    }

    #[test]
    fn failing_tenant_does_not_block_others() {
        let platform = Arc::new(FakePlatform::default());
        let weather = Arc::new(FakeWeather::default());
        platform.add_tenant(&tenant("tA"), "key-a", "2950159");
        platform.add_tenant(&tenant("tB"), "key-b", "2643743");
        // only tenant B's key is accepted by the provider
        weather.serve("key-b", snapshot("London", 60.0));

        let f = fanout(&platform, &weather);
        join_all(f.tick());

        let b = device_of(&platform, "tB").expect("tenant B device");
        assert_eq!(platform.weather_of(&b), Some(snapshot("London", 60.0)));
        let a = device_of(&platform, "tA").expect("tenant A device resolved");
        assert_eq!(platform.weather_of(&a), None);

        let stats = f.stats();
        assert_eq!(stats.succeeded(), 1);
        assert_eq!(stats.failed(), 1);
        assert_eq!(stats.failures_by_kind().get("provider"), Some(&1));
    }

    #[test]
    fn running_tenant_is_skipped() {
        let platform = Arc::new(FakePlatform::default());
        let weather = Arc::new(FakeWeather::default());
        platform.add_tenant(&tenant("tA"), "key-a", "2950159");
        weather.serve("key-a", snapshot("Berlin", 50.0));
        let f = fanout(&platform, &weather);

        let held = InFlight::claim(&f.in_flight, &TenantId("tA".into())).expect("claim");
        assert!(f.tick().is_empty());
        assert_eq!(f.stats().skipped(), 1);

        drop(held);
        join_all(f.tick());
        assert_eq!(f.stats().succeeded(), 1);
    }

    #[test]
    fn unsubscribed_tenant_is_resolved_afresh_on_return() {
        let platform = Arc::new(FakePlatform::default());
        let weather = Arc::new(FakeWeather::default());
        let t = tenant("tA");
        platform.add_tenant(&t, "key-a", "2950159");
        weather.serve("key-a", snapshot("Berlin", 50.0));
        let f = fanout(&platform, &weather);

        join_all(f.tick());
        assert_eq!(platform.state().lookups, 1);

        let saved = std::mem::take(&mut platform.state().tenants);
        join_all(f.tick());
        platform.state().tenants = saved;

        join_all(f.tick());
        assert_eq!(platform.state().lookups, 2);
        assert_eq!(f.stats().succeeded(), 2);
    }

    #[test]
    fn registry_failure_skips_tick() {
        let platform = Arc::new(FakePlatform::default());
        let weather = Arc::new(FakeWeather::default());
        platform.add_tenant(&tenant("tA"), "key-a", "2950159");
        platform.state().registry_failure = true;

        let f = fanout(&platform, &weather);
        assert!(f.tick().is_empty());
        assert_eq!(platform.state().lookups, 0);
    }

    #[test]
    fn scheduler_ticks_and_stops() {
        let platform = Arc::new(FakePlatform::default());
        let weather = Arc::new(FakeWeather::default());
        platform.add_tenant(&tenant("tA"), "key-a", "2950159");
        weather.serve("key-a", snapshot("Berlin", 50.0));

        let timing = cadence(Duration::from_millis(0), Duration::from_secs(3600));
        let scheduler = Scheduler::start(fanout_with(&platform, &weather, timing)).expect("start");
        let stats = scheduler.stats();

        let waited = Instant::now();
        while stats.succeeded() == 0 && waited.elapsed() < Duration::from_secs(5) {
            thread::sleep(Duration::from_millis(10));
        }
        scheduler.stop();
        assert_eq!(stats.succeeded(), 1);
        assert_eq!(platform.state().updates, 1);
    }
}
