//! Drift-free acquisition loop
//!
//! Cycle k is due at `epoch + k * period`. After each cycle the loop sleeps
//! `period - ((now - epoch) mod period)`, so processing jitter never
//! accumulates into the cadence.

use std::time::Duration;

use chrono::Utc;
use errors::{log_service_error, ServiceErrorTrait};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::bus_lock::{BusGuard, BusLock};
use crate::config::{MeterSrvConfig, OutputFormat};
use crate::error::{BusLockError, MeterSrvError, Result};
use crate::reading::{read_all, FieldFailurePolicy, Reading};
use crate::record;
use crate::register_map::RegisterMap;
use crate::sink::Sink;
use crate::status::{FatalKind, StatusPanel};
use crate::transport::Transport;

/// Sleep until the next deadline after `now`
///
/// Exactly on a deadline this is a full period.
pub fn time_to_next_deadline(epoch: Instant, now: Instant, period: Duration) -> Duration {
    let period_nanos = period.as_nanos();
    if period_nanos == 0 {
        return Duration::ZERO;
    }
    let into = now.saturating_duration_since(epoch).as_nanos() % period_nanos;
    Duration::from_nanos((period_nanos - into) as u64)
}

/// Instant of the most recent wall-clock multiple of `period`
pub fn wall_clock_epoch(period: Duration) -> Instant {
    let now = Instant::now();
    let period_nanos = period.as_nanos();
    if period_nanos == 0 {
        return now;
    }
    let since_unix = Utc::now()
        .timestamp_nanos_opt()
        .map(|n| n.max(0) as u128)
        .unwrap_or_default();
    let into = Duration::from_nanos((since_unix % period_nanos) as u64);
    now.checked_sub(into).unwrap_or(now)
}

/// Cadence bookkeeping
#[derive(Debug, Clone)]
pub struct ScheduleState {
    pub period: Duration,
    pub epoch: Instant,
    pub cycle_count: u64,
}

impl ScheduleState {
    pub fn new(period: Duration, epoch: Instant) -> Self {
        Self {
            period,
            epoch,
            cycle_count: 0,
        }
    }

    /// Index of the period slot containing `at`
    pub fn slot(&self, at: Instant) -> u128 {
        match self.period.as_nanos() {
            0 => 0,
            period => at.saturating_duration_since(self.epoch).as_nanos() / period,
        }
    }

    pub fn next_sleep(&self, now: Instant) -> Duration {
        time_to_next_deadline(self.epoch, now, self.period)
    }
}

/// Result of one cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Reading written to the sink
    Appended,
    /// Reading dropped by the failure policy
    Discarded,
    /// Bus not acquired; nothing read
    BusTimeout,
}

/// Counters kept for the life of the loop
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleStats {
    pub cycles: u64,
    pub appended: u64,
    pub discarded: u64,
    pub bus_timeouts: u64,
    pub field_failures: u64,
    pub barriers: u64,
    pub overruns: u64,
    /// Cycles cut short by a non-fatal service error
    pub failed: u64,
}

impl CycleStats {
    fn record(&mut self, outcome: CycleOutcome) {
        self.cycles += 1;
        match outcome {
            CycleOutcome::Appended => self.appended += 1,
            CycleOutcome::Discarded => self.discarded += 1,
            CycleOutcome::BusTimeout => self.bus_timeouts += 1,
        }
    }
}

/// Per-cycle settings
#[derive(Debug, Clone)]
pub struct CycleOptions {
    /// Bus lock identity
    pub identity: String,
    pub bus_timeout: Duration,
    pub policy: FieldFailurePolicy,
    pub format: OutputFormat,
    pub flush_every: u32,
}

impl Default for CycleOptions {
    fn default() -> Self {
        Self {
            identity: format!("metersrv:{}", std::process::id()),
            bus_timeout: Duration::from_secs(2),
            policy: FieldFailurePolicy::Degrade,
            format: OutputFormat::Csv,
            flush_every: 10,
        }
    }
}

impl CycleOptions {
    pub fn from_config(config: &MeterSrvConfig) -> Self {
        Self {
            identity: config.service.identity(),
            bus_timeout: config.bus_lock.effective_timeout(),
            policy: config.output.failure_policy,
            format: config.output.format,
            flush_every: config.schedule.flush_every.max(1),
        }
    }
}

/// Everything one acquisition cycle touches
pub struct ServiceContext {
    map: RegisterMap,
    transport: Box<dyn Transport>,
    lock: BusLock,
    sink: Box<dyn Sink>,
    panel: StatusPanel,
    options: CycleOptions,
}

impl ServiceContext {
    pub fn new(
        map: RegisterMap,
        transport: Box<dyn Transport>,
        lock: BusLock,
        sink: Box<dyn Sink>,
        panel: StatusPanel,
        mut options: CycleOptions,
    ) -> Self {
        // a zero interval would never hit a barrier
        options.flush_every = options.flush_every.max(1);
        Self {
            map,
            transport,
            lock,
            sink,
            panel,
            options,
        }
    }

    pub fn options(&self) -> &CycleOptions {
        &self.options
    }

    /// Take the bus, waiting up to the configured bound
    ///
    /// `Ok(None)` means the wait timed out.
    async fn take_bus(&mut self) -> Result<Option<BusGuard>> {
        let identity = self.options.identity.clone();
        if let Some(guard) = self.lock.try_acquire(&identity)? {
            return Ok(Some(guard));
        }

        self.panel.bus_wait().await;
        match self.lock.acquire(&identity, self.options.bus_timeout).await {
            Ok(guard) => {
                if guard.recovered() {
                    warn!("Bus '{}' reclaimed from a stale holder", self.lock.name());
                }
                Ok(Some(guard))
            },
            Err(BusLockError::BusTimeout { name, waited }) => {
                warn!("Bus '{}' busy for {:?}, skipping cycle", name, waited);
                Ok(None)
            },
            Err(e) => Err(e.into()),
        }
    }

    /// Read every field under the bus lock
    ///
    /// The guard is released right after the last register read.
    pub async fn read(&mut self) -> Result<Option<Reading>> {
        let Some(mut guard) = self.take_bus().await? else {
            return Ok(None);
        };
        let reading = read_all(&self.map, self.transport.as_mut(), Utc::now()).await;
        if let Err(e) = guard.release() {
            warn!("Failed to release bus '{}': {}", self.lock.name(), e);
        }
        Ok(Some(reading))
    }

    /// One cycle: lock, read, release, append
    ///
    /// Only storage and lock backend failures are returned as errors.
    pub async fn cycle(&mut self) -> Result<(CycleOutcome, usize)> {
        self.panel.cycle_start().await;

        let Some(reading) = self.read().await? else {
            self.panel.bus_error().await;
            return Ok((CycleOutcome::BusTimeout, 0));
        };

        let failed = reading.failed_count();
        if failed > 0 {
            self.panel.read_failure().await;
            if self.options.policy == FieldFailurePolicy::Discard {
                warn!(
                    "Discarding reading with {} of {} fields failed",
                    failed,
                    reading.len()
                );
                return Ok((CycleOutcome::Discarded, failed));
            }
        } else {
            self.panel.read_success().await;
        }

        let bytes = record::encode(&reading, self.options.format)?;
        self.sink.append(&bytes)?;
        if failed == 0 {
            self.panel.appended().await;
        }
        Ok((CycleOutcome::Appended, failed))
    }

    /// Flush then sync the sink
    pub fn barrier(&mut self) -> Result<()> {
        self.sink.flush()?;
        self.sink.sync()?;
        Ok(())
    }

    /// Close the sink, logging any failure
    pub fn close_sink(&mut self) {
        if let Err(e) = self.sink.flush() {
            warn!("Final flush failed: {}", e);
        }
        if let Err(e) = self.sink.close() {
            error!("Failed to close log: {}", e);
        }
    }
}

impl std::fmt::Debug for ServiceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceContext")
            .field("model", &self.map.model())
            .field("transport", &self.transport.describe())
            .field("lock", &self.lock)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Periodic driver owning the service context
#[derive(Debug)]
pub struct Scheduler {
    ctx: ServiceContext,
    state: ScheduleState,
    stats: CycleStats,
}

impl Scheduler {
    pub fn new(ctx: ServiceContext, state: ScheduleState) -> Self {
        Self {
            ctx,
            state,
            stats: CycleStats::default(),
        }
    }

    pub fn state(&self) -> &ScheduleState {
        &self.state
    }

    pub fn stats(&self) -> &CycleStats {
        &self.stats
    }

    /// One cycle plus the periodic durability barrier
    pub async fn tick(&mut self) -> Result<CycleOutcome> {
        let (outcome, failed) = self.ctx.cycle().await?;
        self.state.cycle_count += 1;
        self.stats.record(outcome);
        self.stats.field_failures += failed as u64;

        if self.state.cycle_count % u64::from(self.ctx.options.flush_every) == 0 {
            self.ctx.barrier()?;
            self.stats.barriers += 1;
            debug!("Durability barrier after cycle {}", self.state.cycle_count);
        }

        debug!(
            "Cycle {} {:?} ({} field failures)",
            self.state.cycle_count, outcome, failed
        );
        Ok(outcome)
    }

    /// Run until a fatal error
    ///
    /// Errors that are not fatal end only the current cycle.
    pub async fn run(&mut self) -> Result<()> {
        info!(
            "Acquisition every {:?}, durability barrier every {} cycles",
            self.state.period, self.ctx.options.flush_every
        );
        loop {
            let started = Instant::now();
            if let Err(e) = self.tick().await {
                if e.is_fatal() {
                    return Err(e);
                }
                self.stats.failed += 1;
                log_service_error("Cycle failed", &e);
            }

            let now = Instant::now();
            let missed = self.state.slot(now).saturating_sub(self.state.slot(started));
            if missed > 0 {
                self.stats.overruns += 1;
                warn!(
                    "Cycle took {:?}, longer than the {:?} period; skipping {} deadline(s)",
                    now - started,
                    self.state.period,
                    missed
                );
            }
            tokio::time::sleep(self.state.next_sleep(now)).await;
        }
    }

    /// Close the sink and show the final status
    ///
    /// Any bus guard is already gone: guards never outlive a cycle.
    pub async fn shutdown(&mut self, error: Option<&MeterSrvError>) {
        self.ctx.close_sink();
        let kind = error.map(FatalKind::from).unwrap_or(FatalKind::Other);
        self.ctx.panel.fatal(kind).await;
        info!(
            "Stopped after {} cycles: {} appended, {} discarded, {} bus timeouts, {} failed, {} field failures, {} barriers",
            self.stats.cycles,
            self.stats.appended,
            self.stats.discarded,
            self.stats.bus_timeouts,
            self.stats.failed,
            self.stats.field_failures,
            self.stats.barriers
        );
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::bus_lock::LockBackend;
    use crate::error::TransportError;
    use crate::register_map::{DecodeKind, RegisterMapEntry};
    use crate::sink::MemorySink;
    use crate::status::{Colour, RecordingIndicator};
    use crate::transport::MemoryTransport;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use tracing_test::traced_test;

    #[derive(Default)]
    struct Slot(Mutex<bool>);

    impl LockBackend for Slot {
        fn name(&self) -> &str {
            "slot"
        }
        fn try_acquire(&self, _identity: &str) -> std::result::Result<bool, BusLockError> {
            let mut held = self.0.lock();
            Ok(!std::mem::replace(&mut *held, true))
        }
        fn release(&self, _identity: &str) -> std::result::Result<(), BusLockError> {
            *self.0.lock() = false;
            Ok(())
        }
        fn recover(&self, _identity: &str) -> std::result::Result<(), BusLockError> {
            Ok(())
        }
    }

    struct Harness {
        transport: MemoryTransport,
        sink: MemorySink,
        indicator: RecordingIndicator,
        backend: Arc<Slot>,
    }

    fn scheduler(policy: FieldFailurePolicy, flush_every: u32) -> (Scheduler, Harness) {
        let map = RegisterMap::new(
            "bench",
            vec![
                RegisterMapEntry::new("volts", 3028, 2, DecodeKind::Float32),
                RegisterMapEntry::new("amps", 3000, 2, DecodeKind::Float32),
            ],
        )
        .unwrap();
        let transport = MemoryTransport::new();
        transport.set_f32(3028, 230.1).set_f32(3000, 5.5);
        let sink = MemorySink::new();
        let indicator = RecordingIndicator::new();
        let backend = Arc::new(Slot::default());
        let lock = BusLock::new(backend.clone(), Duration::from_millis(100), false);

        let ctx = ServiceContext::new(
            map,
            Box::new(transport.clone()),
            lock,
            Box::new(sink.clone()),
            StatusPanel::new(Box::new(indicator.clone())),
            CycleOptions {
                identity: "test".into(),
                bus_timeout: Duration::from_millis(300),
                policy,
                format: OutputFormat::Csv,
                flush_every,
            },
        );
        let state = ScheduleState::new(Duration::from_secs(10), Instant::now());
        (
            Scheduler::new(ctx, state),
            Harness {
                transport,
                sink,
                indicator,
                backend,
            },
        )
    }

    #[test]
    fn test_time_to_next_deadline() {
        let epoch = Instant::now();
        let p = Duration::from_secs(10);
        assert_eq!(time_to_next_deadline(epoch, epoch, p), p);
        assert_eq!(
            time_to_next_deadline(epoch, epoch + Duration::from_millis(2500), p),
            Duration::from_millis(7500)
        );
        assert_eq!(
            time_to_next_deadline(epoch, epoch + Duration::from_secs(37), p),
            Duration::from_secs(3)
        );
        // before the epoch counts as on it
        assert_eq!(time_to_next_deadline(epoch + p, epoch, p), p);
        assert_eq!(time_to_next_deadline(epoch, epoch, Duration::ZERO), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_barrier_every_n_cycles() {
        let (mut scheduler, h) = scheduler(FieldFailurePolicy::Degrade, 3);
        for _ in 0..7 {
            assert_eq!(scheduler.tick().await.unwrap(), CycleOutcome::Appended);
        }
        assert_eq!(h.sink.lines().len(), 7);
        assert_eq!(h.sink.flushes(), 2);
        assert_eq!(h.sink.syncs(), 2);
        assert_eq!(scheduler.stats().barriers, 2);
        assert_eq!(scheduler.state().cycle_count, 7);
        assert!(!*h.backend.0.lock(), "bus left held");
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_bus_timeout_skips_read_but_counts_cycle() {
        let (mut scheduler, h) = scheduler(FieldFailurePolicy::Degrade, 1);
        *h.backend.0.lock() = true;

        assert_eq!(scheduler.tick().await.unwrap(), CycleOutcome::BusTimeout);
        assert!(h.transport.requests().is_empty());
        assert!(h.sink.lines().is_empty());
        assert_eq!(h.indicator.current()[1], Colour::Red);
        // barrier still runs on bus-timeout cycles
        assert_eq!(h.sink.syncs(), 1);
        assert_eq!(scheduler.stats().bus_timeouts, 1);
        assert!(logs_contain("skipping cycle"));

        *h.backend.0.lock() = false;
        assert_eq!(scheduler.tick().await.unwrap(), CycleOutcome::Appended);
    }

    #[tokio::test]
    async fn test_failure_policies() {
        let (mut degrade, h) = scheduler(FieldFailurePolicy::Degrade, 10);
        h.transport
            .fail_at(3000, TransportError::Timeout(Duration::from_millis(500)));
        assert_eq!(degrade.tick().await.unwrap(), CycleOutcome::Appended);
        assert_eq!(h.sink.lines().len(), 1);
        assert_eq!(h.indicator.current()[1], Colour::Red);
        assert_eq!(degrade.stats().field_failures, 1);

        let (mut discard, h) = scheduler(FieldFailurePolicy::Discard, 10);
        h.transport
            .fail_at(3000, TransportError::Timeout(Duration::from_millis(500)));
        assert_eq!(discard.tick().await.unwrap(), CycleOutcome::Discarded);
        assert!(h.sink.lines().is_empty());
    }

    #[tokio::test]
    async fn test_all_fields_failed_still_appends_a_row() {
        let (mut scheduler, h) = scheduler(FieldFailurePolicy::Degrade, 10);
        h.transport
            .fail_at(3028, TransportError::Io("no response".into()))
            .fail_at(3000, TransportError::Io("no response".into()));
        assert_eq!(scheduler.tick().await.unwrap(), CycleOutcome::Appended);
        assert_eq!(scheduler.stats().field_failures, 2);
        assert_eq!(h.indicator.current()[1], Colour::Red);

        let lines = h.sink.lines();
        assert_eq!(lines.len(), 1);
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .from_reader(lines[0].as_bytes());
        let row = reader.records().next().unwrap().unwrap();
        assert_eq!(row.len(), 3);
        assert!(!row[0].is_empty());
        assert_eq!(&row[1], "");
        assert_eq!(&row[2], "");
    }

    #[tokio::test]
    async fn test_unsupported_kind_degrades_to_empty_points() {
        let map = RegisterMap::new(
            "bitmap-only",
            vec![RegisterMapEntry::new(
                "alarms",
                100,
                1,
                DecodeKind::Other("BITMAP".into()),
            )],
        )
        .unwrap();
        let sink = MemorySink::new();
        let ctx = ServiceContext::new(
            map,
            Box::new(MemoryTransport::new()),
            BusLock::new(Arc::new(Slot::default()), Duration::from_millis(100), false),
            Box::new(sink.clone()),
            StatusPanel::new(Box::new(RecordingIndicator::new())),
            CycleOptions {
                format: OutputFormat::Json,
                ..CycleOptions::default()
            },
        );
        let mut scheduler =
            Scheduler::new(ctx, ScheduleState::new(Duration::from_secs(10), Instant::now()));

        assert_eq!(scheduler.tick().await.unwrap(), CycleOutcome::Appended);
        let lines = sink.lines();
        assert_eq!(lines.len(), 1);
        let record: serde_json::Value = serde_json::from_str(&lines[0]).unwrap();
        assert!(record["points"].as_object().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_zero_flush_interval_is_clamped() {
        let (mut scheduler, h) = scheduler(FieldFailurePolicy::Degrade, 0);
        assert_eq!(scheduler.ctx.options().flush_every, 1);
        scheduler.tick().await.unwrap();
        scheduler.tick().await.unwrap();
        assert_eq!(scheduler.stats().barriers, 2);
        assert_eq!(h.sink.syncs(), 2);
    }

    /// Fails its first attempts with queued errors, then acts like [`Slot`]
    #[derive(Default)]
    struct Scripted {
        errors: Mutex<Vec<BusLockError>>,
        slot: Slot,
    }

    impl LockBackend for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }
        fn try_acquire(&self, identity: &str) -> std::result::Result<bool, BusLockError> {
            if let Some(err) = self.errors.lock().pop() {
                return Err(err);
            }
            self.slot.try_acquire(identity)
        }
        fn release(&self, identity: &str) -> std::result::Result<(), BusLockError> {
            self.slot.release(identity)
        }
        fn recover(&self, _identity: &str) -> std::result::Result<(), BusLockError> {
            Ok(())
        }
    }

    fn scripted_scheduler(first_error: BusLockError) -> (Scheduler, MemorySink) {
        let map = RegisterMap::new(
            "bench",
            vec![RegisterMapEntry::new("volts", 3028, 2, DecodeKind::Float32)],
        )
        .unwrap();
        let transport = MemoryTransport::new();
        transport.set_f32(3028, 230.1);
        let backend = Scripted::default();
        backend.errors.lock().push(first_error);
        let sink = MemorySink::new();
        let ctx = ServiceContext::new(
            map,
            Box::new(transport),
            BusLock::new(Arc::new(backend), Duration::from_millis(100), false),
            Box::new(sink.clone()),
            StatusPanel::new(Box::new(RecordingIndicator::new())),
            CycleOptions::default(),
        );
        let state = ScheduleState::new(Duration::from_secs(10), Instant::now());
        (Scheduler::new(ctx, state), sink)
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_fatal_error_ends_only_its_cycle() {
        let (mut scheduler, sink) = scripted_scheduler(BusLockError::BusTimeout {
            name: "scripted".into(),
            waited: Duration::ZERO,
        });

        let stopped = tokio::time::timeout(Duration::from_secs(25), scheduler.run()).await;
        assert!(stopped.is_err(), "loop must keep running");

        assert_eq!(scheduler.stats().failed, 1);
        assert_eq!(scheduler.stats().appended, 2);
        assert_eq!(sink.lines().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_stops_the_loop() {
        let (mut scheduler, sink) = scripted_scheduler(BusLockError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "marker directory vanished",
        )));

        let err = tokio::time::timeout(Duration::from_secs(25), scheduler.run())
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, MeterSrvError::BusLock(_)));
        assert!(err.is_fatal());
        assert_eq!(scheduler.stats().failed, 0);
        assert!(sink.lines().is_empty());
    }

    #[tokio::test]
    async fn test_success_lights_then_clears() {
        let (mut scheduler, h) = scheduler(FieldFailurePolicy::Degrade, 10);
        scheduler.tick().await.unwrap();
        let frames = h.indicator.frames();
        assert!(frames
            .iter()
            .any(|f| f[1] == Colour::Blue && f[2] == Colour::Green));
        assert_eq!(h.indicator.current()[1], Colour::Off);
        assert_eq!(h.indicator.current()[2], Colour::Off);
    }

    #[tokio::test]
    async fn test_storage_failure_is_fatal() {
        let (mut scheduler, h) = scheduler(FieldFailurePolicy::Degrade, 10);
        h.sink.fail_writes(true);
        let err = scheduler.tick().await.unwrap_err();
        assert!(matches!(err, MeterSrvError::Storage(_)));

        scheduler.shutdown(Some(&err)).await;
        assert!(h.sink.is_closed());
        assert_eq!(
            h.indicator.current()[..3],
            [Colour::Red, Colour::Off, Colour::Red]
        );
    }
}
