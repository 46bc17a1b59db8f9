use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use super::Clock;
use super::config::{DefaultChannelModelMapping, DefaultChannelModels, RuntimeOptions};
use super::store::{Store, StoreError, with_store_deadline};
use super::store_types::Channel;

const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(5);

/// Immutable, read-optimized view of the enabled channels.
#[derive(Debug, Default)]
pub struct ChannelSnapshot {
    model_channels: HashMap<String, Vec<Arc<Channel>>>,
    all_models: Vec<String>,
    type_models: BTreeMap<i32, Vec<String>>,
    channel_count: usize,
    built_at_ms: u64,
}

impl ChannelSnapshot {
    /// Builds the snapshot from enabled channels, backfilling empty model
    /// lists and mappings from the per-type defaults.
    pub fn build(
        channels: Vec<Channel>,
        default_models: &DefaultChannelModels,
        default_mapping: &DefaultChannelModelMapping,
        built_at_ms: u64,
    ) -> Self {
        let mut model_channels: HashMap<String, Vec<Arc<Channel>>> = HashMap::new();
        let mut type_models: BTreeMap<i32, BTreeSet<String>> = BTreeMap::new();
        let mut channel_count = 0;

        for mut channel in channels {
            if !channel.status.is_enabled() {
                continue;
            }
            let type_key = channel.channel_type.to_string();
            if channel.models.is_empty() {
                if let Some(models) = default_models.get(&type_key) {
                    channel.models = models.clone();
                }
            }
            if channel.model_mapping.is_empty() {
                if let Some(mapping) = default_mapping.get(&type_key) {
                    channel.model_mapping = mapping.clone();
                }
            }

            let mut seen = BTreeSet::new();
            channel.models.retain(|model| !model.is_empty() && seen.insert(model.clone()));

            type_models
                .entry(channel.channel_type)
                .or_default()
                .extend(channel.models.iter().cloned());

            let channel = Arc::new(channel);
            for model in &channel.models {
                model_channels
                    .entry(model.clone())
                    .or_default()
                    .push(channel.clone());
            }
            channel_count += 1;
        }

        for list in model_channels.values_mut() {
            // Stable, so equal priorities keep id order.
            list.sort_by(|a, b| b.priority.cmp(&a.priority));
        }

        let mut all_models: Vec<String> = model_channels.keys().cloned().collect();
        all_models.sort();

        Self {
            model_channels,
            all_models,
            type_models: type_models
                .into_iter()
                .map(|(channel_type, models)| (channel_type, models.into_iter().collect()))
                .collect(),
            channel_count,
            built_at_ms,
        }
    }

    /// Channels serving `model`, highest priority first.
    pub fn channels(&self, model: &str) -> &[Arc<Channel>] {
        self.model_channels
            .get(model)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn all_models(&self) -> &[String] {
        &self.all_models
    }

    pub fn models_by_type(&self, channel_type: i32) -> &[String] {
        self.type_models
            .get(&channel_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn type_to_models(&self) -> &BTreeMap<i32, Vec<String>> {
        &self.type_models
    }

    pub fn channel_count(&self) -> usize {
        self.channel_count
    }

    pub fn built_at_ms(&self) -> u64 {
        self.built_at_ms
    }
}

/// Holds the current [`ChannelSnapshot`] and rebuilds it from the store.
///
/// Readers clone the `Arc` under a short read lock; a rebuild only holds the
/// write lock for the pointer swap.
pub struct ChannelIndex {
    store: Arc<dyn Store>,
    options: Arc<RuntimeOptions>,
    clock: Arc<dyn Clock>,
    snapshot: RwLock<Arc<ChannelSnapshot>>,
    rebuild_lock: tokio::sync::Mutex<()>,
    store_timeout: Duration,
}

impl std::fmt::Debug for ChannelIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.snapshot();
        f.debug_struct("ChannelIndex")
            .field("channels", &snapshot.channel_count())
            .field("models", &snapshot.all_models().len())
            .field("built_at_ms", &snapshot.built_at_ms())
            .finish()
    }
}

impl ChannelIndex {
    pub fn new(store: Arc<dyn Store>, options: Arc<RuntimeOptions>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            options,
            clock,
            snapshot: RwLock::new(Arc::new(ChannelSnapshot::default())),
            rebuild_lock: tokio::sync::Mutex::new(()),
            store_timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    pub fn snapshot(&self) -> Arc<ChannelSnapshot> {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Reloads enabled channels and publishes a new snapshot. Concurrent
    /// rebuilds are serialized; readers are never blocked on the store.
    pub async fn rebuild(&self) -> Result<usize, StoreError> {
        let _guard = self.rebuild_lock.lock().await;
        let channels =
            with_store_deadline(self.store_timeout, self.store.list_enabled_channels()).await?;
        let snapshot = ChannelSnapshot::build(
            channels,
            &self.options.default_channel_models(),
            &self.options.default_channel_model_mapping(),
            self.clock.now_millis(),
        );
        let count = snapshot.channel_count();
        let models = snapshot.all_models().len();
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(snapshot);
        tracing::info!(channels = count, models, "channel index rebuilt");
        Ok(count)
    }

    pub fn all_models(&self) -> Vec<String> {
        self.snapshot().all_models().to_vec()
    }

    pub fn models_by_type(&self, channel_type: i32) -> Vec<String> {
        self.snapshot().models_by_type(channel_type).to_vec()
    }

    pub fn type_to_models(&self) -> BTreeMap<i32, Vec<String>> {
        self.snapshot().type_to_models().clone()
    }

    pub fn channels_for_model(&self, model: &str) -> Vec<Arc<Channel>> {
        self.snapshot().channels(model).to_vec()
    }
}
