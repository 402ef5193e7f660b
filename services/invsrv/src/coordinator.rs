//! Polling coordinator
//!
//! One coordinator per device. It runs the register map against the transport
//! on a timer, merges per-block results into an immutable snapshot, and
//! serializes writes against poll cycles.
//!
//! State flow:
//! - timer tick: `Idle -> Polling -> Idle`
//! - write: `Idle -> WritePending -> Idle`, then a forced `Polling` cycle is
//!   spawned once the write succeeds
//!
//! Every transport call runs on its own tokio task bounded by a timeout, so a
//! stalled device never blocks the caller beyond that bound.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{broadcast, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::codec::{decode_field, encode_write};
use crate::config::{validate_poll_interval, DeviceConfig};
use crate::error::{CoordinatorError, Result, TransportError, WriteError};
use crate::protocols::modbus::constants::DEFAULT_IO_TIMEOUT;
use crate::protocols::modbus::transport::{ModbusTcpTransport, RegisterTransport};
use crate::register_map::{RegisterMap, WriteSpec};
use crate::snapshot::{TelemetrySnapshot, TelemetryValue};
use crate::source::{TelemetrySource, WriteTarget};

/// Bound on one transport call: connect, send and receive each get the I/O timeout
pub const DEFAULT_WORKER_TIMEOUT: Duration = Duration::from_secs(DEFAULT_IO_TIMEOUT.as_secs() * 3);

const SNAPSHOT_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CoordinatorPhase {
    Idle,
    Polling,
    WritePending,
}

#[derive(Debug, Default)]
struct Counters {
    cycles_succeeded: AtomicU64,
    cycles_failed: AtomicU64,
    block_failures: AtomicU64,
    forced_refreshes: AtomicU64,
    writes_succeeded: AtomicU64,
    writes_failed: AtomicU64,
}

/// Point-in-time copy of the coordinator counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CoordinatorStats {
    pub cycles_succeeded: u64,
    pub cycles_failed: u64,
    pub block_failures: u64,
    pub forced_refreshes: u64,
    pub writes_succeeded: u64,
    pub writes_failed: u64,
}

struct Inner {
    device: DeviceConfig,
    map: Arc<RegisterMap>,
    transport: Arc<dyn RegisterTransport>,
    worker_timeout: Duration,
    poll_interval_ms: AtomicU64,
    snapshot: ArcSwapOption<TelemetrySnapshot>,
    last_error: RwLock<Option<CoordinatorError>>,
    phase: RwLock<CoordinatorPhase>,
    /// Held for a whole poll cycle or write
    cycle_lock: Mutex<()>,
    /// Signalled after every completed cycle so the timer restarts
    cycle_done: Notify,
    updates: broadcast::Sender<Arc<TelemetrySnapshot>>,
    counters: Counters,
}

/// Holds a non-idle phase for the life of a cycle or write
///
/// Dropping it restores `Idle`, also when the caller's future is cancelled
/// mid-cycle. A finished poll cycle additionally restarts the timer.
struct PhaseGuard<'a> {
    inner: &'a Inner,
    restart_timer: bool,
}

impl<'a> PhaseGuard<'a> {
    fn enter(inner: &'a Inner, phase: CoordinatorPhase, restart_timer: bool) -> Self {
        *inner.phase.write() = phase;
        Self {
            inner,
            restart_timer,
        }
    }
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        *self.inner.phase.write() = CoordinatorPhase::Idle;
        if self.restart_timer {
            self.inner.cycle_done.notify_waiters();
        }
    }
}

/// Cheap to clone; all clones drive the same device
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("device", &self.inner.device.name)
            .field("endpoint", &format!("{}:{}", self.inner.device.host, self.inner.device.port))
            .field("unit_id", &self.inner.device.unit_id)
            .field("poll_interval", &self.poll_interval())
            .field("phase", &self.phase())
            .finish()
    }
}

impl Coordinator {
    pub fn new(
        device: DeviceConfig,
        map: Arc<RegisterMap>,
        transport: Arc<dyn RegisterTransport>,
    ) -> Self {
        let (updates, _) = broadcast::channel(SNAPSHOT_CHANNEL_CAPACITY);
        let poll_interval_ms = device.poll_interval().as_millis() as u64;
        Self {
            inner: Arc::new(Inner {
                device,
                map,
                transport,
                worker_timeout: DEFAULT_WORKER_TIMEOUT,
                poll_interval_ms: AtomicU64::new(poll_interval_ms),
                snapshot: ArcSwapOption::empty(),
                last_error: RwLock::new(None),
                phase: RwLock::new(CoordinatorPhase::Idle),
                cycle_lock: Mutex::new(()),
                cycle_done: Notify::new(),
                updates,
                counters: Counters::default(),
            }),
        }
    }

    /// Coordinator talking Modbus TCP to `device`
    pub fn for_device(device: DeviceConfig, map: Arc<RegisterMap>) -> Self {
        let transport = ModbusTcpTransport::new(device.host.clone(), device.port, device.unit_id);
        Self::new(device, map, Arc::new(transport))
    }

    /// Override the per-call worker bound; only valid before the coordinator is shared
    pub fn with_worker_timeout(self, worker_timeout: Duration) -> Self {
        match Arc::try_unwrap(self.inner) {
            Ok(mut inner) => {
                inner.worker_timeout = worker_timeout;
                Self {
                    inner: Arc::new(inner),
                }
            },
            Err(inner) => {
                warn!("Worker timeout not changed: coordinator already shared");
                Self { inner }
            },
        }
    }

    pub fn device(&self) -> &DeviceConfig {
        &self.inner.device
    }

    pub fn snapshot(&self) -> Option<Arc<TelemetrySnapshot>> {
        self.inner.snapshot.load_full()
    }

    pub fn last_error(&self) -> Option<CoordinatorError> {
        self.inner.last_error.read().clone()
    }

    pub fn phase(&self) -> CoordinatorPhase {
        *self.inner.phase.read()
    }

    pub fn stats(&self) -> CoordinatorStats {
        let c = &self.inner.counters;
        CoordinatorStats {
            cycles_succeeded: c.cycles_succeeded.load(Ordering::Relaxed),
            cycles_failed: c.cycles_failed.load(Ordering::Relaxed),
            block_failures: c.block_failures.load(Ordering::Relaxed),
            forced_refreshes: c.forced_refreshes.load(Ordering::Relaxed),
            writes_succeeded: c.writes_succeeded.load(Ordering::Relaxed),
            writes_failed: c.writes_failed.load(Ordering::Relaxed),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<TelemetrySnapshot>> {
        self.inner.updates.subscribe()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.inner.poll_interval_ms.load(Ordering::Relaxed))
    }

    /// Change the cadence in place; takes effect from the next scheduled cycle
    pub fn set_poll_interval(&self, interval: Duration) -> Result<()> {
        if interval.subsec_nanos() != 0 {
            return Err(CoordinatorError::InvalidInterval(format!(
                "{interval:?} is not a whole number of seconds"
            )));
        }
        validate_poll_interval(interval.as_secs()).map_err(CoordinatorError::InvalidInterval)?;

        let previous = self.poll_interval();
        self.inner
            .poll_interval_ms
            .store(interval.as_millis() as u64, Ordering::Relaxed);
        info!(
            "Device {} poll interval changed {:?} -> {:?}",
            self.inner.device.name, previous, interval
        );
        Ok(())
    }

    /// Run `fut` on its own task, bounded by the worker timeout
    async fn in_worker<T, F>(&self, fut: F) -> std::result::Result<T, TransportError>
    where
        T: Send + 'static,
        F: Future<Output = std::result::Result<T, TransportError>> + Send + 'static,
    {
        let handle = tokio::spawn(fut);
        let abort = handle.abort_handle();
        match tokio::time::timeout(self.inner.worker_timeout, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(TransportError::connection(format!(
                "transport worker failed: {join_error}"
            ))),
            Err(_) => {
                abort.abort();
                Err(TransportError::connection(format!(
                    "transport call exceeded {:?}",
                    self.inner.worker_timeout
                )))
            },
        }
    }

    /// Bring-up poll; failure here means the device must not be exposed
    pub async fn first_refresh(&self) -> Result<Arc<TelemetrySnapshot>> {
        self.refresh().await.map_err(|e| {
            let err = CoordinatorError::FirstCycleFailed {
                device: self.inner.device.name.clone(),
                reason: e.to_string(),
            };
            *self.inner.last_error.write() = Some(err.clone());
            err
        })
    }

    /// Run one poll cycle now, waiting for any in-flight cycle or write
    pub async fn refresh(&self) -> Result<Arc<TelemetrySnapshot>> {
        let _lock = self.inner.cycle_lock.lock().await;
        let _phase = PhaseGuard::enter(&self.inner, CoordinatorPhase::Polling, true);
        self.poll_cycle().await
    }

    /// Caller must hold `cycle_lock`
    async fn poll_cycle(&self) -> Result<Arc<TelemetrySnapshot>> {
        let device = &self.inner.device.name;
        let blocks = self.inner.map.blocks();
        let mut values = BTreeMap::new();
        let mut failed_blocks = Vec::new();
        let mut last_failure = None;

        for spec in blocks {
            let transport = Arc::clone(&self.inner.transport);
            let block = spec.block.clone();
            let read = self
                .in_worker(async move { transport.read_block(&block).await })
                .await;

            match read {
                Ok(words) => {
                    for field in &spec.fields {
                        values.insert(field.key.clone(), decode_field(field, &words));
                    }
                },
                Err(e) => {
                    warn!(
                        "Device {} block {} (FC{:02X} @{} x{}) failed: {}",
                        device,
                        spec.block.name,
                        spec.block.function_code.code(),
                        spec.block.start_address,
                        spec.block.count,
                        e
                    );
                    self.inner
                        .counters
                        .block_failures
                        .fetch_add(1, Ordering::Relaxed);
                    failed_blocks.push(spec.block.name.clone());
                    last_failure = Some(e);
                },
            }
        }

        if failed_blocks.len() == blocks.len() {
            let err = CoordinatorError::AllBlocksFailed {
                device: device.clone(),
                blocks: blocks.len(),
                last: last_failure
                    .unwrap_or_else(|| TransportError::connection("no blocks attempted")),
            };
            error!("{}", err);
            self.inner
                .counters
                .cycles_failed
                .fetch_add(1, Ordering::Relaxed);
            *self.inner.last_error.write() = Some(err.clone());
            return Err(err);
        }

        let snapshot = Arc::new(TelemetrySnapshot::new(values, failed_blocks));
        debug!(
            "Device {} cycle complete: {} values, {} of {} blocks failed",
            device,
            snapshot.len(),
            snapshot.failed_blocks.len(),
            blocks.len()
        );
        self.inner.snapshot.store(Some(Arc::clone(&snapshot)));
        self.inner
            .counters
            .cycles_succeeded
            .fetch_add(1, Ordering::Relaxed);
        *self.inner.last_error.write() = None;
        // No receivers is fine
        let _ = self.inner.updates.send(Arc::clone(&snapshot));
        Ok(snapshot)
    }

    fn resolve_target(&self, target: &WriteTarget) -> std::result::Result<WriteSpec, WriteError> {
        let map = &self.inner.map;
        match target {
            WriteTarget::Key(key) => map
                .write_spec(key)
                .cloned()
                .ok_or_else(|| WriteError::UnknownKey(key.clone())),
            WriteTarget::Address(address) => map
                .write_spec_for_address(*address)
                .cloned()
                .ok_or(WriteError::NotWritable(*address)),
        }
    }

    /// Encode `value` and write it; a refresh is spawned after success
    pub async fn write(
        &self,
        target: WriteTarget,
        value: f64,
    ) -> std::result::Result<(), WriteError> {
        let spec = self.resolve_target(&target)?;

        if !value.is_finite() {
            return Err(WriteError::InvalidValue {
                key: spec.key,
                value,
            });
        }
        if let Some(range) = spec.range {
            if value < range.min || value > range.max {
                return Err(WriteError::OutOfRange {
                    key: spec.key,
                    value,
                    min: range.min,
                    max: range.max,
                });
            }
        }

        let raw = encode_write(value, spec.raw_scale);
        let address = spec.register_address;

        let result = {
            let _lock = self.inner.cycle_lock.lock().await;
            let _phase = PhaseGuard::enter(&self.inner, CoordinatorPhase::WritePending, false);
            let transport = Arc::clone(&self.inner.transport);
            self.in_worker(async move { transport.write_register(address, raw).await })
                .await
        };

        if let Err(source) = result {
            self.inner
                .counters
                .writes_failed
                .fetch_add(1, Ordering::Relaxed);
            warn!(
                "Device {} write {}={} (register {} raw {:#06X}) failed: {}",
                self.inner.device.name, spec.key, value, address, raw, source
            );
            return Err(WriteError::Transport { address, source });
        }

        self.inner
            .counters
            .writes_succeeded
            .fetch_add(1, Ordering::Relaxed);
        info!(
            "Device {} wrote {}={} (register {} raw {:#06X})",
            self.inner.device.name, spec.key, value, address, raw
        );

        let this = self.clone();
        tokio::spawn(async move {
            this.inner
                .counters
                .forced_refreshes
                .fetch_add(1, Ordering::Relaxed);
            if let Err(e) = this.refresh().await {
                debug!("Post-write refresh failed: {}", e);
            }
        });
        Ok(())
    }

    /// Spawn the timer loop; it stops when `token` is cancelled
    ///
    /// The timer restarts after every completed cycle, including forced ones.
    pub fn start(&self, token: CancellationToken) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            info!(
                "Polling started for device {} ({}:{} unit {}), interval {:?}",
                this.inner.device.name,
                this.inner.device.host,
                this.inner.device.port,
                this.inner.device.unit_id,
                this.poll_interval()
            );

            loop {
                let interval = this.poll_interval();
                let cycle_done = this.inner.cycle_done.notified();
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = cycle_done => continue,
                    _ = tokio::time::sleep(interval) => {},
                }

                // Failures are recorded and logged inside the cycle
                let _ = this.refresh().await;
            }

            info!("Polling stopped for device {}", this.inner.device.name);
        })
    }
}

#[async_trait]
impl TelemetrySource for Coordinator {
    fn snapshot(&self) -> Option<Arc<TelemetrySnapshot>> {
        Coordinator::snapshot(self)
    }

    async fn request_refresh(&self) -> Result<Arc<TelemetrySnapshot>> {
        self.refresh().await
    }

    async fn write(&self, target: WriteTarget, value: f64) -> std::result::Result<(), WriteError> {
        Coordinator::write(self, target, value).await
    }

    fn subscribe(&self) -> broadcast::Receiver<Arc<TelemetrySnapshot>> {
        Coordinator::subscribe(self)
    }

    fn register_map(&self) -> &RegisterMap {
        &self.inner.map
    }
}

/// Snapshot values for logging, in key order
pub fn describe_values(snapshot: &TelemetrySnapshot) -> String {
    snapshot
        .values
        .iter()
        .map(|(key, value)| match value {
            TelemetryValue::Absent => format!("{key}=-"),
            other => format!("{key}={other}"),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::register_map::{BlockSpec, FieldSpec, ReadFunction, RegisterBlock};
    use tracing_test::traced_test;

    struct FixedTransport;

    #[async_trait]
    impl RegisterTransport for FixedTransport {
        async fn read_block(
            &self,
            block: &RegisterBlock,
        ) -> std::result::Result<Vec<u16>, TransportError> {
            Ok((0..block.count).collect())
        }

        async fn write_register(
            &self,
            _address: u16,
            _raw: u16,
        ) -> std::result::Result<(), TransportError> {
            Ok(())
        }
    }

    struct StalledTransport;

    #[async_trait]
    impl RegisterTransport for StalledTransport {
        async fn read_block(
            &self,
            _block: &RegisterBlock,
        ) -> std::result::Result<Vec<u16>, TransportError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(vec![])
        }

        async fn write_register(
            &self,
            _address: u16,
            _raw: u16,
        ) -> std::result::Result<(), TransportError> {
            std::future::pending().await
        }
    }

    struct PanickingTransport;

    #[async_trait]
    impl RegisterTransport for PanickingTransport {
        async fn read_block(
            &self,
            _block: &RegisterBlock,
        ) -> std::result::Result<Vec<u16>, TransportError> {
            panic!("decoder bug");
        }

        async fn write_register(
            &self,
            _address: u16,
            _raw: u16,
        ) -> std::result::Result<(), TransportError> {
            panic!("decoder bug");
        }
    }

    /// Fails every read of the block named "broken"
    struct BrokenBlockTransport;

    #[async_trait]
    impl RegisterTransport for BrokenBlockTransport {
        async fn read_block(
            &self,
            block: &RegisterBlock,
        ) -> std::result::Result<Vec<u16>, TransportError> {
            if block.name == "broken" {
                return Err(TransportError::exception(0x83, 0x02));
            }
            Ok(vec![7; block.count as usize])
        }

        async fn write_register(
            &self,
            _address: u16,
            _raw: u16,
        ) -> std::result::Result<(), TransportError> {
            Ok(())
        }
    }

    fn small_map() -> Arc<RegisterMap> {
        Arc::new(
            RegisterMap::new(
                vec![BlockSpec {
                    block: RegisterBlock::new("only", ReadFunction::ReadHolding, 100, 4),
                    fields: vec![FieldSpec::unsigned("a", 1), FieldSpec::unsigned("b", 3)],
                }],
                vec![],
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_refresh_publishes_snapshot() {
        let coordinator = Coordinator::new(
            DeviceConfig::new("t", "127.0.0.1"),
            small_map(),
            Arc::new(FixedTransport),
        );
        assert!(coordinator.snapshot().is_none());
        let mut rx = coordinator.subscribe();

        let snapshot = coordinator.first_refresh().await.unwrap();
        assert_eq!(snapshot.get("a"), Some(&TelemetryValue::Integer(1)));
        assert_eq!(snapshot.get("b"), Some(&TelemetryValue::Integer(3)));
        assert!(Arc::ptr_eq(&snapshot, &coordinator.snapshot().unwrap()));
        assert!(Arc::ptr_eq(&snapshot, &rx.recv().await.unwrap()));
        assert_eq!(coordinator.phase(), CoordinatorPhase::Idle);
        assert_eq!(describe_values(&snapshot), "a=1 b=3");
    }

    #[tokio::test]
    async fn test_stalled_worker_times_out() {
        let coordinator = Coordinator::new(
            DeviceConfig::new("stall", "127.0.0.1"),
            small_map(),
            Arc::new(StalledTransport),
        )
        .with_worker_timeout(Duration::from_millis(50));

        let err = coordinator.refresh().await.unwrap_err();
        match err {
            CoordinatorError::AllBlocksFailed { last, .. } => assert!(last.is_connection()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_set_poll_interval_bounds() {
        let coordinator = Coordinator::new(
            DeviceConfig::new("t", "127.0.0.1"),
            small_map(),
            Arc::new(FixedTransport),
        );
        assert_eq!(coordinator.poll_interval(), Duration::from_secs(30));
        assert!(coordinator.set_poll_interval(Duration::from_secs(4)).is_err());
        assert!(coordinator.set_poll_interval(Duration::from_secs(3601)).is_err());
        assert!(coordinator.set_poll_interval(Duration::from_millis(5500)).is_err());
        coordinator.set_poll_interval(Duration::from_secs(5)).unwrap();
        assert_eq!(coordinator.poll_interval(), Duration::from_secs(5));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_block_failure_is_logged_per_block() {
        let map = RegisterMap::new(
            vec![
                BlockSpec {
                    block: RegisterBlock::new("good", ReadFunction::ReadInput, 10, 2),
                    fields: vec![FieldSpec::unsigned("g", 0)],
                },
                BlockSpec {
                    block: RegisterBlock::new("broken", ReadFunction::ReadHolding, 20, 2),
                    fields: vec![FieldSpec::unsigned("x", 0)],
                },
            ],
            vec![],
        )
        .unwrap();
        let coordinator = Coordinator::new(
            DeviceConfig::new("logs", "127.0.0.1"),
            Arc::new(map),
            Arc::new(BrokenBlockTransport),
        );

        let snapshot = coordinator.refresh().await.unwrap();

        assert_eq!(snapshot.failed_blocks, vec!["broken".to_string()]);
        assert!(logs_contain("block broken (FC03 @20 x2) failed"));
        assert!(logs_contain("illegal data address"));
        assert!(!logs_contain("block good"));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_all_blocks_failed_is_logged() {
        let coordinator = Coordinator::new(
            DeviceConfig::new("dark", "127.0.0.1"),
            small_map(),
            Arc::new(StalledTransport),
        )
        .with_worker_timeout(Duration::from_millis(20));

        assert!(coordinator.refresh().await.is_err());
        assert!(logs_contain("Could not fetch data from dark"));
        assert_eq!(coordinator.stats().cycles_failed, 1);
    }

    #[tokio::test]
    async fn test_worker_panic_becomes_block_failure() {
        let coordinator = Coordinator::new(
            DeviceConfig::new("panic", "127.0.0.1"),
            small_map(),
            Arc::new(PanickingTransport),
        );

        let err = coordinator.refresh().await.unwrap_err();
        match err {
            CoordinatorError::AllBlocksFailed { last, .. } => {
                assert!(last.is_connection());
                assert!(last.to_string().contains("transport worker failed"));
            },
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(coordinator.phase(), CoordinatorPhase::Idle);
    }

    #[tokio::test]
    async fn test_abandoned_refresh_returns_to_idle() {
        let coordinator = Coordinator::new(
            DeviceConfig::new("stall", "127.0.0.1"),
            small_map(),
            Arc::new(StalledTransport),
        );

        let abandoned =
            tokio::time::timeout(Duration::from_millis(30), coordinator.refresh()).await;
        assert!(abandoned.is_err());
        assert_eq!(coordinator.phase(), CoordinatorPhase::Idle);
        assert!(coordinator.inner.cycle_lock.try_lock().is_ok());
    }
}
