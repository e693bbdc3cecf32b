//! Workspace resource status and backend memory metrics.

use std::sync::Arc;
use std::time::Duration;

use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use sysinfo::{Pid, System};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::common::error::MetricsError;
use crate::common::types::ResourcesStatus;
use crate::supervisor::client::SupervisorApi;

/// Poll the supervisor for resource usage and publish the latest answer.
pub async fn run_status_poller(
    supervisor: Arc<dyn SupervisorApi>,
    interval: Duration,
    status: watch::Sender<Option<ResourcesStatus>>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            result = supervisor.resources_status() => result,
        };
        match result {
            Ok(current) => {
                status.send_replace(Some(current));
            }
            Err(e) => error!("Failed to get resource status: {}", e),
        }
    }
}

/// Periodically sample memory usage and push it to the supervisor.
pub async fn run_metrics_pusher(
    supervisor: Arc<dyn SupervisorApi>,
    job: String,
    interval: Duration,
    metrics: MemoryMetrics,
    cancel: CancellationToken,
) {
    let mut sampler = MemorySampler::new();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        metrics.record(sampler.sample());
        let body = match metrics.encode() {
            Ok(body) => body,
            Err(e) => {
                error!("{}", e);
                continue;
            }
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            result = supervisor.push_metrics(&job, body) => result,
        };
        if let Err(e) = result {
            warn!("Failed to push metrics: {}", e);
        }
    }
}

/// Count every drop of available system memory below `threshold_bytes`.
///
/// A stretch of consecutive low readings counts once.
pub async fn run_low_memory_watcher<F>(
    metrics: MemoryMetrics,
    threshold_bytes: u64,
    interval: Duration,
    mut sample: F,
    cancel: CancellationToken,
) where
    F: FnMut() -> MemorySample + Send,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut low = false;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let current = sample();
        let below = current.available_bytes < threshold_bytes;
        if below && !low {
            warn!(
                "Low memory: {} bytes available, threshold is {} bytes",
                current.available_bytes, threshold_bytes
            );
            metrics.record_low_memory();
        } else if !below && low {
            info!("Memory recovered: {} bytes available", current.available_bytes);
        }
        low = below;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemorySample {
    pub used_bytes: u64,
    pub max_bytes: u64,
    pub available_bytes: u64,
}

/// Reads this process's resident memory and the memory available to it.
pub struct MemorySampler {
    system: System,
    pid: Option<Pid>,
}

impl MemorySampler {
    pub fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                warn!("Cannot identify own process, reporting zero usage: {}", e);
                None
            }
        };
        Self {
            system: System::new(),
            pid,
        }
    }

    pub fn sample(&mut self) -> MemorySample {
        self.system.refresh_memory();
        let used_bytes = self
            .pid
            .filter(|pid| self.system.refresh_process(*pid))
            .and_then(|pid| self.system.process(pid))
            .map(|process| process.memory())
            .unwrap_or(0);

        MemorySample {
            used_bytes,
            max_bytes: self.system.total_memory(),
            available_bytes: self.system.available_memory(),
        }
    }
}

impl Default for MemorySampler {
    fn default() -> Self {
        Self::new()
    }
}

/// Memory gauges and the low-memory counter in their own registry, labelled
/// with the backend identity. Clones share the registry.
#[derive(Clone)]
pub struct MemoryMetrics {
    registry: Registry,
    used: IntGaugeVec,
    max: IntGaugeVec,
    low_memory: IntCounterVec,
    labels: [String; 2],
}

impl MemoryMetrics {
    pub fn new(product: &str, qualifier: &str) -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let used = IntGaugeVec::new(
            Opts::new(
                "ide_backend_memory_used_bytes",
                "Resident memory of the IDE backend process",
            ),
            &["product", "qualifier"],
        )?;
        registry.register(Box::new(used.clone()))?;

        let max = IntGaugeVec::new(
            Opts::new(
                "ide_backend_memory_max_bytes",
                "Memory available to the IDE backend process",
            ),
            &["product", "qualifier"],
        )?;
        registry.register(Box::new(max.clone()))?;

        let low_memory = IntCounterVec::new(
            Opts::new(
                "ide_backend_low_memory_total",
                "Times available system memory dropped below the threshold",
            ),
            &["product", "qualifier"],
        )?;
        registry.register(Box::new(low_memory.clone()))?;
        low_memory.with_label_values(&[product, qualifier]);

        Ok(Self {
            registry,
            used,
            max,
            low_memory,
            labels: [product.to_string(), qualifier.to_string()],
        })
    }

    fn label_values(&self) -> [&str; 2] {
        [self.labels[0].as_str(), self.labels[1].as_str()]
    }

    pub fn record(&self, sample: MemorySample) {
        let labels = self.label_values();
        self.used
            .with_label_values(&labels)
            .set(saturating_i64(sample.used_bytes));
        self.max
            .with_label_values(&labels)
            .set(saturating_i64(sample.max_bytes));
        debug!("Memory: {} of {} bytes", sample.used_bytes, sample.max_bytes);
    }

    pub fn record_low_memory(&self) {
        self.low_memory.with_label_values(&self.label_values()).inc();
    }

    /// Render every gauge in the text exposition format.
    pub fn encode(&self) -> Result<String, MetricsError> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| MetricsError::Encoding(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::Encoding(e.to_string()))
    }
}

fn saturating_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::testing::FakeSupervisor;

    #[test]
    fn test_gauges_are_labelled() {
        let metrics = MemoryMetrics::new("IntelliJ", "stable").unwrap();
        metrics.record(MemorySample {
            used_bytes: 1024,
            max_bytes: 4096,
            available_bytes: 2048,
        });

        let text = metrics.encode().unwrap();
        assert!(text.contains("# TYPE ide_backend_memory_used_bytes gauge"));
        assert!(text.contains(
            "ide_backend_memory_used_bytes{product=\"IntelliJ\",qualifier=\"stable\"} 1024"
        ));
        assert!(text.contains(
            "ide_backend_memory_max_bytes{product=\"IntelliJ\",qualifier=\"stable\"} 4096"
        ));
        assert!(text.contains(
            "ide_backend_low_memory_total{product=\"IntelliJ\",qualifier=\"stable\"} 0"
        ));
    }

    #[test]
    fn test_label_values_are_escaped() {
        let metrics = MemoryMetrics::new("Go\"Land", "stable").unwrap();
        metrics.record(MemorySample {
            used_bytes: 1,
            max_bytes: 2,
            available_bytes: 1,
        });
        assert!(metrics.encode().unwrap().contains(r#"product="Go\"Land""#));
    }

    #[test]
    fn test_sampler_reports_system_memory() {
        let sample = MemorySampler::new().sample();
        assert!(sample.max_bytes > 0);
        assert!(sample.used_bytes <= sample.max_bytes);
        assert!(sample.available_bytes <= sample.max_bytes);
    }

    #[test]
    fn test_oversized_values_saturate() {
        assert_eq!(saturating_i64(u64::MAX), i64::MAX);
        assert_eq!(saturating_i64(42), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_poller_publishes_latest() {
        let supervisor = FakeSupervisor::new();
        let (tx, rx) = watch::channel(None);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run_status_poller(
            supervisor.clone(),
            Duration::from_secs(1),
            tx,
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(supervisor.status_calls.load(Ordering::SeqCst), 3);
        let status = rx.borrow().clone().unwrap();
        assert_eq!(status.memory.used, 3 * 1024);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_low_memory_counts_each_drop_once() {
        const MB: u64 = 1024 * 1024;
        let metrics = MemoryMetrics::new("IntelliJ", "stable").unwrap();
        let cancel = CancellationToken::new();

        let mut readings: std::collections::VecDeque<u64> =
            [512, 100, 90, 400, 50, 60].into_iter().map(|mb| mb * MB).collect();
        let sample = move || MemorySample {
            used_bytes: 0,
            max_bytes: 1024 * MB,
            available_bytes: readings.pop_front().unwrap_or(1024 * MB),
        };

        let task = tokio::spawn(run_low_memory_watcher(
            metrics.clone(),
            256 * MB,
            Duration::from_secs(1),
            sample,
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(metrics
            .encode()
            .unwrap()
            .contains("ide_backend_low_memory_total{product=\"IntelliJ\",qualifier=\"stable\"} 1"));

        tokio::time::sleep(Duration::from_secs(5)).await;
        cancel.cancel();
        task.await.unwrap();
        assert!(metrics
            .encode()
            .unwrap()
            .contains("ide_backend_low_memory_total{product=\"IntelliJ\",qualifier=\"stable\"} 2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pusher_sends_under_job() {
        let supervisor = FakeSupervisor::new();
        let cancel = CancellationToken::new();
        let metrics = MemoryMetrics::new("IntelliJ", "stable").unwrap();

        let task = tokio::spawn(run_metrics_pusher(
            supervisor.clone(),
            "ide_backend".to_string(),
            Duration::from_secs(5),
            metrics,
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_secs(6)).await;
        cancel.cancel();
        task.await.unwrap();

        let pushed = supervisor.pushed.lock().unwrap().clone();
        assert_eq!(pushed.len(), 2);
        assert_eq!(pushed[0].0, "ide_backend");
        assert!(pushed[0].1.contains("ide_backend_memory_max_bytes"));
        assert!(pushed[0].1.contains("ide_backend_low_memory_total"));
    }
}
