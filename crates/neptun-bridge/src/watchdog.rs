//! Liveness watchdog
//!
//! On a fixed period, every device in the registry is evaluated as
//! `lost = (now - last_seen) > lost_timeout`. A device that never sent
//! telemetry is lost from the moment it was first referenced.
//!
//! Each report is emitted every tick through a callback, together with a
//! `changed` flag (true on the first evaluation of a device). Callback
//! failures are logged at debug and the next tick simply emits again.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace};

use crate::config::{NeptunConfig, MIN_CHECK_INTERVAL};
use crate::registry::{DeviceId, DeviceRegistry};

/// Liveness of one device at one tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LivenessReport {
    /// Device identifier
    pub device: DeviceId,
    /// No telemetry within the lost timeout
    pub lost: bool,
    /// Differs from the previous tick, or first tick for this device
    pub changed: bool,
}

/// Callback receiving each report
pub type LivenessCallback =
    Arc<dyn Fn(&LivenessReport) -> std::result::Result<(), String> + Send + Sync>;

/// Periodic lost/alive evaluation over the registry
#[derive(Debug, Clone)]
pub struct LivenessWatchdog {
    registry: DeviceRegistry,
    period: Duration,
}

impl LivenessWatchdog {
    /// Create with a check period, floored at 5 seconds
    pub fn new(registry: DeviceRegistry, period: Duration) -> Self {
        Self {
            registry,
            period: period.max(MIN_CHECK_INTERVAL),
        }
    }

    /// Create from configuration
    pub fn from_config(registry: DeviceRegistry, config: &NeptunConfig) -> Self {
        Self::new(registry, config.liveness.check_interval)
    }

    /// Effective check period
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Evaluate every known device now
    pub fn evaluate(&self) -> Vec<LivenessReport> {
        self.evaluate_at(Instant::now())
    }

    /// Evaluate every known device as of `now`
    pub fn evaluate_at(&self, now: Instant) -> Vec<LivenessReport> {
        self.registry
            .entries()
            .into_iter()
            .map(|(device, entry)| {
                let mut entry = entry.lock();
                let lost = entry.is_lost_at(now);
                let changed = entry.record_liveness(lost);
                if changed {
                    debug!(device = %device, lost, "Device liveness changed");
                }
                LivenessReport {
                    device,
                    lost,
                    changed,
                }
            })
            .collect()
    }

    /// Run one tick and hand every report to `emit`
    pub fn tick(&self, emit: &LivenessCallback) -> usize {
        let reports = self.evaluate();
        for report in &reports {
            if let Err(e) = emit(report) {
                debug!(device = %report.device, "Liveness emission failed: {}", e);
            }
        }
        trace!(devices = reports.len(), "Liveness tick");
        reports.len()
    }

    /// Spawn the periodic task; it stops when `shutdown` flips to true or its sender is dropped
    pub fn spawn(self, emit: LivenessCallback, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Liveness watchdog started, period {:?}", self.period);
            let mut interval = tokio::time::interval(self.period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        self.tick(&emit);
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Liveness watchdog stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn dev(id: &str) -> DeviceId {
        DeviceId::new(id)
    }

    #[test]
    fn test_period_floor() {
        let watchdog = LivenessWatchdog::new(DeviceRegistry::new(), Duration::from_secs(1));
        assert_eq!(watchdog.period(), Duration::from_secs(5));

        let watchdog = LivenessWatchdog::new(DeviceRegistry::new(), Duration::from_secs(60));
        assert_eq!(watchdog.period(), Duration::from_secs(60));
    }

    #[test]
    fn test_threshold() {
        let registry = DeviceRegistry::new();
        let t = Instant::now();
        registry.touch_at(&dev("a"), t);
        let watchdog = LivenessWatchdog::new(registry, Duration::from_secs(30));

        let at_299 = watchdog.evaluate_at(t + Duration::from_secs(299));
        assert!(!at_299[0].lost);
        let at_301 = watchdog.evaluate_at(t + Duration::from_secs(301));
        assert!(at_301[0].lost);
    }

    #[test]
    fn test_never_seen_is_lost() {
        let registry = DeviceRegistry::new();
        registry.register(&dev("quiet"));
        let watchdog = LivenessWatchdog::new(registry, Duration::from_secs(30));

        let reports = watchdog.evaluate_at(Instant::now());
        assert_eq!(
            reports,
            vec![LivenessReport {
                device: dev("quiet"),
                lost: true,
                changed: true,
            }]
        );
    }

    #[test]
    fn test_changed_flag() {
        let registry = DeviceRegistry::new();
        let t = Instant::now();
        registry.touch_at(&dev("a"), t);
        let watchdog = LivenessWatchdog::new(registry.clone(), Duration::from_secs(30));

        assert!(watchdog.evaluate_at(t)[0].changed);
        assert!(!watchdog.evaluate_at(t + Duration::from_secs(10))[0].changed);

        let lost = watchdog.evaluate_at(t + Duration::from_secs(400));
        assert!(lost[0].lost && lost[0].changed);

        registry.touch_at(&dev("a"), t + Duration::from_secs(401));
        let back = watchdog.evaluate_at(t + Duration::from_secs(402));
        assert!(!back[0].lost && back[0].changed);
    }

    #[test]
    fn test_per_device_timeout() {
        let registry = DeviceRegistry::new();
        let t = Instant::now();
        registry.touch_at(&dev("fast"), t);
        registry.touch_at(&dev("slow"), t);
        registry.set_lost_timeout(&dev("fast"), Duration::from_secs(10));
        let watchdog = LivenessWatchdog::new(registry, Duration::from_secs(30));

        let reports = watchdog.evaluate_at(t + Duration::from_secs(11));
        assert_eq!(reports.len(), 2);
        assert!(reports[0].lost, "fast device should be lost");
        assert!(!reports[1].lost, "slow device still alive");
    }

    #[test]
    fn test_emission_failure_does_not_stop_tick() {
        let registry = DeviceRegistry::new();
        registry.register(&dev("a"));
        registry.register(&dev("b"));
        let watchdog = LivenessWatchdog::new(registry, Duration::from_secs(30));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = Arc::clone(&seen);
        let emit: LivenessCallback = Arc::new(move |report| {
            seen_cb.lock().push(report.device.clone());
            Err("bus down".to_string())
        });

        assert_eq!(watchdog.tick(&emit), 2);
        assert_eq!(seen.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_task_emits_every_period() {
        let registry = DeviceRegistry::new();
        registry.register(&dev("a"));
        let watchdog = LivenessWatchdog::new(registry, Duration::from_secs(5));

        let count = Arc::new(Mutex::new(0usize));
        let count_cb = Arc::clone(&count);
        let emit: LivenessCallback = Arc::new(move |_| {
            *count_cb.lock() += 1;
            Ok(())
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = watchdog.spawn(emit, shutdown_rx);

        // First tick fires immediately, then every 5 s
        tokio::time::sleep(Duration::from_millis(10_100)).await;
        assert_eq!(*count.lock(), 3);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }
}
