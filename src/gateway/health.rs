//! Passive channel health: rolling success windows fed by request outcomes.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;

use super::channel_index::ChannelIndex;
use super::config::HealthConfig;
use super::store::{Store, with_store_deadline};
use super::store_types::ChannelStatus;
use crate::utils::task::AbortOnDrop;

const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-channel bounded outcome queues.
#[derive(Debug)]
pub struct HealthWindows {
    capacity: usize,
    threshold: f64,
    queues: HashMap<i64, VecDeque<bool>>,
}

impl HealthWindows {
    pub fn new(capacity: usize, threshold: f64) -> Self {
        Self {
            capacity: capacity.max(1),
            threshold,
            queues: HashMap::new(),
        }
    }

    pub fn record_success(&mut self, channel_id: i64) {
        self.push(channel_id, true);
    }

    /// Records a failure and returns true when the channel should be disabled.
    /// A full queue below the success threshold is reset.
    pub fn record_failure(&mut self, channel_id: i64) -> bool {
        let capacity = self.capacity;
        let threshold = self.threshold;
        let queue = self.push(channel_id, false);
        if queue.len() < capacity {
            return false;
        }
        let successes = queue.iter().filter(|ok| **ok).count();
        let rate = successes as f64 / queue.len() as f64;
        if rate < threshold {
            self.queues.remove(&channel_id);
            return true;
        }
        false
    }

    pub fn len(&self, channel_id: i64) -> usize {
        self.queues.get(&channel_id).map(VecDeque::len).unwrap_or(0)
    }

    pub fn success_rate(&self, channel_id: i64) -> Option<f64> {
        let queue = self.queues.get(&channel_id)?;
        if queue.is_empty() {
            return None;
        }
        let successes = queue.iter().filter(|ok| **ok).count();
        Some(successes as f64 / queue.len() as f64)
    }

    fn push(&mut self, channel_id: i64, outcome: bool) -> &VecDeque<bool> {
        let capacity = self.capacity;
        let queue = self.queues.entry(channel_id).or_default();
        while queue.len() >= capacity {
            queue.pop_front();
        }
        queue.push_back(outcome);
        queue
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HealthStats {
    pub dropped_samples: u64,
    pub auto_disabled: u64,
}

/// Consumes success/failure samples off bounded queues and auto-disables
/// channels whose rolling success rate drops below the threshold.
///
/// Inactive unless `enable_metric` is set; `record_outcome` is then a no-op.
pub struct HealthMonitor {
    enabled: bool,
    success_tx: mpsc::Sender<i64>,
    failure_tx: mpsc::Sender<i64>,
    receivers: Mutex<Option<(mpsc::Receiver<i64>, mpsc::Receiver<i64>)>>,
    windows: Mutex<HealthWindows>,
    store: Arc<dyn Store>,
    index: Arc<ChannelIndex>,
    dropped_samples: AtomicU64,
    auto_disabled: AtomicU64,
    store_timeout: Duration,
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("enabled", &self.enabled)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl HealthMonitor {
    pub fn new(config: &HealthConfig, store: Arc<dyn Store>, index: Arc<ChannelIndex>) -> Self {
        let (success_tx, success_rx) = mpsc::channel(config.success_chan_size.max(1));
        let (failure_tx, failure_rx) = mpsc::channel(config.fail_chan_size.max(1));
        Self {
            enabled: config.enable_metric,
            success_tx,
            failure_tx,
            receivers: Mutex::new(Some((success_rx, failure_rx))),
            windows: Mutex::new(HealthWindows::new(
                config.queue_size,
                config.success_rate_threshold,
            )),
            store,
            index,
            dropped_samples: AtomicU64::new(0),
            auto_disabled: AtomicU64::new(0),
            store_timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Fire-and-forget. Samples are dropped when the queue is full.
    pub fn record_outcome(&self, channel_id: i64, success: bool) {
        if !self.enabled {
            return;
        }
        let tx = if success {
            &self.success_tx
        } else {
            &self.failure_tx
        };
        if let Err(err) = tx.try_send(channel_id) {
            self.dropped_samples.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(channel_id, success, error = %err, "health sample dropped");
        }
    }

    /// Spawns the success and failure consumers. Returns no tasks when
    /// disabled or already started.
    pub(crate) fn start(self: &Arc<Self>) -> Vec<AbortOnDrop> {
        if !self.enabled {
            return Vec::new();
        }
        let Some((mut success_rx, mut failure_rx)) = self
            .receivers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return Vec::new();
        };

        let monitor = self.clone();
        let successes = AbortOnDrop::spawn("health-success-consumer", async move {
            while let Some(channel_id) = success_rx.recv().await {
                monitor.apply(channel_id, true).await;
            }
        });
        let monitor = self.clone();
        let failures = AbortOnDrop::spawn("health-failure-consumer", async move {
            while let Some(channel_id) = failure_rx.recv().await {
                monitor.apply(channel_id, false).await;
            }
        });
        vec![successes, failures]
    }

    /// Applies one sample, disabling the channel when its window says so.
    pub async fn apply(&self, channel_id: i64, success: bool) {
        let disable = {
            let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
            if success {
                windows.record_success(channel_id);
                false
            } else {
                windows.record_failure(channel_id)
            }
        };
        if disable {
            self.auto_disable(channel_id).await;
        }
    }

    pub fn stats(&self) -> HealthStats {
        HealthStats {
            dropped_samples: self.dropped_samples.load(Ordering::Relaxed),
            auto_disabled: self.auto_disabled.load(Ordering::Relaxed),
        }
    }

    async fn auto_disable(&self, channel_id: i64) {
        match with_store_deadline(
            self.store_timeout,
            self.store.update_channel_status(
                channel_id,
                ChannelStatus::AutoDisabled,
                Some(ChannelStatus::Enabled),
            ),
        )
        .await
        {
            Ok(true) => {
                self.auto_disabled.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(channel_id, "channel auto-disabled: success rate below threshold");
                if let Err(err) = self.index.rebuild().await {
                    tracing::error!(error = %err, "channel index rebuild after auto-disable failed");
                }
            }
            Ok(false) => {
                tracing::debug!(channel_id, "channel already disabled");
            }
            Err(err) => {
                tracing::error!(channel_id, error = %err, "failed to auto-disable channel");
            }
        }
    }
}
