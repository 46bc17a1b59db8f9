//! Active channel probing.
//!
//! A pass walks every channel (enabled or not), issues one tiny completion
//! through a [`ChannelProbe`], records the latency, and flips channel status
//! according to the runtime options.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use super::Clock;
use super::channel_index::ChannelIndex;
use super::config::{ProbeConfig, RuntimeOptions};
use super::limits::duration_to_millis;
use super::store::{Store, StoreError, with_store_deadline};
use super::store_types::{Channel, ChannelStatus};
use super::upstream::UpstreamError;
use crate::utils::http::{join_url, response_text_truncated};
use crate::utils::task::AbortOnDrop;

const DEFAULT_BASE_URL: &str = "https://api.openai.com";
const MAX_ERROR_BODY_BYTES: usize = 64 * 1024;
const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    #[error("probe transport error: {0}")]
    Transport(String),
    #[error("channel {0} has no models to probe")]
    NoModels(i64),
    #[error("a probe pass is already running")]
    AlreadyRunning,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ProbeError {
    pub fn should_disable_channel(&self) -> bool {
        match self {
            Self::Upstream(err) => err.should_disable_channel(),
            _ => false,
        }
    }
}

/// Issues one synthetic request against a channel.
#[async_trait]
pub trait ChannelProbe: Send + Sync {
    /// `model` is already mapped to the channel's upstream name.
    async fn probe(&self, channel: &Channel, model: &str) -> Result<(), ProbeError>;
}

/// Probes OpenAI-compatible channels with a two-token chat completion.
#[derive(Clone, Debug)]
pub struct HttpChannelProbe {
    client: reqwest::Client,
}

impl HttpChannelProbe {
    pub fn new(timeout: Duration) -> Result<Self, ProbeError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| ProbeError::Transport(format!("probe http client error: {err}")))?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ChannelProbe for HttpChannelProbe {
    async fn probe(&self, channel: &Channel, model: &str) -> Result<(), ProbeError> {
        let base_url = if channel.base_url.is_empty() {
            DEFAULT_BASE_URL
        } else {
            channel.base_url.as_str()
        };
        let body = serde_json::json!({
            "model": model,
            "max_tokens": 2,
            "messages": [{"role": "user", "content": "hi"}],
        });

        let response = self
            .client
            .post(join_url(base_url, "/v1/chat/completions"))
            .bearer_auth(&channel.key)
            .json(&body)
            .send()
            .await
            .map_err(|err| ProbeError::Transport(format!("probe request failed: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response_text_truncated(response, MAX_ERROR_BODY_BYTES).await;
            return Err(UpstreamError::from_response_body(status.as_u16(), &body).into());
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProbeReport {
    pub probed: usize,
    pub failed: usize,
    pub disabled: Vec<i64>,
    pub enabled: Vec<i64>,
}

impl ProbeReport {
    pub fn status_changed(&self) -> bool {
        !self.disabled.is_empty() || !self.enabled.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProbeAction {
    None,
    Disabled,
    Enabled,
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct ChannelProber {
    store: Arc<dyn Store>,
    index: Arc<ChannelIndex>,
    probe: Arc<dyn ChannelProbe>,
    options: Arc<RuntimeOptions>,
    config: ProbeConfig,
    clock: Arc<dyn Clock>,
    running: AtomicBool,
    store_timeout: Duration,
}

impl std::fmt::Debug for ChannelProber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelProber")
            .field("config", &self.config)
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl ChannelProber {
    pub fn new(
        store: Arc<dyn Store>,
        index: Arc<ChannelIndex>,
        probe: Arc<dyn ChannelProbe>,
        options: Arc<RuntimeOptions>,
        config: ProbeConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            index,
            probe,
            options,
            config,
            clock,
            running: AtomicBool::new(false),
            store_timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Probes every channel once. Only one pass runs at a time.
    pub async fn run_once(&self) -> Result<ProbeReport, ProbeError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ProbeError::AlreadyRunning);
        }
        let _guard = RunningGuard(&self.running);

        let channels = with_store_deadline(self.store_timeout, self.store.list_channels()).await?;
        let pause = Duration::from_millis(self.config.pause_ms);
        let mut report = ProbeReport::default();
        for (i, channel) in channels.iter().enumerate() {
            if i > 0 && !pause.is_zero() {
                tokio::time::sleep(pause).await;
            }
            let (action, result) = self.probe_channel(channel).await;
            report.probed += 1;
            if result.is_err() {
                report.failed += 1;
            }
            match action {
                ProbeAction::Disabled => report.disabled.push(channel.id),
                ProbeAction::Enabled => report.enabled.push(channel.id),
                ProbeAction::None => {}
            }
        }

        if report.status_changed() {
            if let Err(err) = self.index.rebuild().await {
                tracing::error!(error = %err, "channel index rebuild after probe failed");
            }
        }
        tracing::info!(
            probed = report.probed,
            failed = report.failed,
            disabled = report.disabled.len(),
            enabled = report.enabled.len(),
            "channel probe pass finished"
        );
        Ok(report)
    }

    /// Probes one channel, records its latency, and applies the resulting
    /// status change. Does not rebuild the index.
    pub async fn probe_channel(&self, channel: &Channel) -> (ProbeAction, Result<(), ProbeError>) {
        let was_enabled = channel.status.is_enabled();
        let started = tokio::time::Instant::now();
        let result = match self.probe_model(channel) {
            Some(model) => {
                let timeout = self.config.timeout();
                match tokio::time::timeout(timeout, self.probe.probe(channel, &model)).await {
                    Ok(result) => result,
                    Err(_) => Err(ProbeError::Timeout(timeout)),
                }
            }
            None => Err(ProbeError::NoModels(channel.id)),
        };
        let elapsed = started.elapsed();
        let elapsed_ms = duration_to_millis(elapsed);

        if let Err(err) = with_store_deadline(
            self.store_timeout,
            self.store
                .record_channel_probe(channel.id, elapsed_ms, self.clock.now_millis()),
        )
        .await
        {
            tracing::warn!(channel_id = channel.id, error = %err, "failed to record probe result");
        }

        let automatic_disable = self.options.automatic_disable_channel();
        let threshold = self.options.channel_disable_threshold();
        let mut action = ProbeAction::None;

        if was_enabled {
            let too_slow = !threshold.is_zero() && elapsed > threshold;
            let disabling_error = result
                .as_ref()
                .err()
                .is_some_and(ProbeError::should_disable_channel);
            if too_slow {
                tracing::warn!(
                    channel_id = channel.id,
                    elapsed_ms,
                    threshold_ms = duration_to_millis(threshold),
                    "channel probe exceeded latency threshold"
                );
            }
            if automatic_disable && (too_slow || disabling_error) {
                if self
                    .set_status(channel.id, ChannelStatus::AutoDisabled, ChannelStatus::Enabled)
                    .await
                {
                    action = ProbeAction::Disabled;
                }
            }
        } else if result.is_ok()
            && channel.status == ChannelStatus::AutoDisabled
            && self.options.automatic_enable_channel()
        {
            if self
                .set_status(channel.id, ChannelStatus::Enabled, ChannelStatus::AutoDisabled)
                .await
            {
                action = ProbeAction::Enabled;
            }
        }

        if let Err(err) = &result {
            tracing::info!(channel_id = channel.id, elapsed_ms, error = %err, "channel probe failed");
        } else {
            tracing::debug!(channel_id = channel.id, elapsed_ms, "channel probe succeeded");
        }
        (action, result)
    }

    /// Spawns the periodic loop. The first pass runs one interval after start.
    pub(crate) fn start(self: &Arc<Self>) -> Option<AbortOnDrop> {
        if !self.config.enabled {
            return None;
        }
        let period = Duration::from_secs(self.config.interval_seconds.max(1));
        let prober = self.clone();
        Some(AbortOnDrop::spawn("channel-prober", async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                tracing::info!("probing all channels");
                if let Err(err) = prober.run_once().await {
                    tracing::warn!(error = %err, "channel probe pass failed");
                }
            }
        }))
    }

    /// The configured probe model when the channel serves it, otherwise the
    /// channel's first model; mapped to the upstream name.
    fn probe_model(&self, channel: &Channel) -> Option<String> {
        let model = if channel.models.iter().any(|m| *m == self.config.model) {
            self.config.model.as_str()
        } else {
            channel.models.first()?.as_str()
        };
        Some(channel.mapped_model(model).to_string())
    }

    async fn set_status(&self, id: i64, status: ChannelStatus, expected: ChannelStatus) -> bool {
        match with_store_deadline(
            self.store_timeout,
            self.store.update_channel_status(id, status, Some(expected)),
        )
        .await
        {
            Ok(changed) => {
                if changed {
                    tracing::warn!(channel_id = id, status = ?status, "channel status changed by probe");
                }
                changed
            }
            Err(err) => {
                tracing::error!(channel_id = id, error = %err, "failed to update channel status");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use httpmock::{Method::POST, MockServer};

    use super::*;
    use crate::gateway::ManualClock;
    use crate::gateway::config::GatewayConfig;
    use crate::gateway::store::MemoryStore;

    fn can_bind_localhost() -> bool {
        match std::net::TcpListener::bind(("127.0.0.1", 0)) {
            Ok(listener) => {
                drop(listener);
                true
            }
            Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => false,
            Err(err) => panic!("failed to bind localhost for httpmock tests: {err}"),
        }
    }

    #[derive(Default)]
    struct ScriptedProbe {
        delays: HashMap<i64, Duration>,
        errors: HashMap<i64, UpstreamError>,
        seen: Mutex<Vec<(i64, String)>>,
    }

    #[async_trait]
    impl ChannelProbe for ScriptedProbe {
        async fn probe(&self, channel: &Channel, model: &str) -> Result<(), ProbeError> {
            self.seen
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .push((channel.id, model.to_string()));
            if let Some(delay) = self.delays.get(&channel.id) {
                tokio::time::sleep(*delay).await;
            }
            match self.errors.get(&channel.id) {
                Some(err) => Err(err.clone().into()),
                None => Ok(()),
            }
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        index: Arc<ChannelIndex>,
        options: Arc<RuntimeOptions>,
        ids: Vec<i64>,
    }

    async fn fixture(channels: Vec<Channel>) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let ids = store.insert_channels(channels).await.expect("insert");
        let options = Arc::new(RuntimeOptions::from_config(&GatewayConfig::default()));
        let index = Arc::new(ChannelIndex::new(
            store.clone(),
            options.clone(),
            Arc::new(ManualClock::new(0)),
        ));
        index.rebuild().await.expect("rebuild");
        Fixture {
            store,
            index,
            options,
            ids,
        }
    }

    fn prober(fixture: &Fixture, probe: Arc<dyn ChannelProbe>) -> ChannelProber {
        let config = ProbeConfig {
            pause_ms: 0,
            ..ProbeConfig::default()
        };
        ChannelProber::new(
            fixture.store.clone(),
            fixture.index.clone(),
            probe,
            fixture.options.clone(),
            config,
            Arc::new(ManualClock::new(42_000)),
        )
    }

    #[tokio::test]
    async fn slow_enabled_channel_is_disabled_when_automatic_disable_is_on() {
        let fixture = fixture(vec![
            Channel::new(1, "sk-a").with_models(["gpt-4o"]),
            Channel::new(1, "sk-b").with_models(["gpt-4o"]),
        ])
        .await;
        fixture
            .options
            .update("AutomaticDisableChannelEnabled", "true")
            .expect("option");
        fixture
            .options
            .update("ChannelDisableThreshold", "0.02")
            .expect("option");

        let slow = fixture.ids[0];
        let probe = Arc::new(ScriptedProbe {
            delays: HashMap::from([(slow, Duration::from_millis(150))]),
            ..ScriptedProbe::default()
        });
        let report = prober(&fixture, probe).run_once().await.expect("pass");

        assert_eq!(report.probed, 2);
        assert_eq!(report.disabled, vec![slow]);
        let channel = fixture.store.get_channel(slow).await.expect("get");
        assert_eq!(channel.status, ChannelStatus::AutoDisabled);
        assert!(channel.response_duration_ms >= 150);
        assert_eq!(channel.test_at_ms, Some(42_000));
        assert_eq!(fixture.index.channels_for_model("gpt-4o").len(), 1);
    }

    #[tokio::test]
    async fn slow_channel_stays_enabled_without_automatic_disable() {
        let fixture = fixture(vec![Channel::new(1, "sk-a").with_models(["gpt-4o"])]).await;
        fixture
            .options
            .update("ChannelDisableThreshold", "0.01")
            .expect("option");
        let id = fixture.ids[0];
        let probe = Arc::new(ScriptedProbe {
            delays: HashMap::from([(id, Duration::from_millis(60))]),
            ..ScriptedProbe::default()
        });
        let report = prober(&fixture, probe).run_once().await.expect("pass");
        assert!(report.disabled.is_empty());
        assert_eq!(
            fixture.store.get_channel(id).await.expect("get").status,
            ChannelStatus::Enabled
        );
    }

    #[tokio::test]
    async fn credential_error_disables_and_success_reenables() {
        let fixture = fixture(vec![
            Channel::new(1, "sk-revoked").with_models(["gpt-4o"]),
            Channel::new(1, "sk-back")
                .with_models(["gpt-4o"])
                .with_status(ChannelStatus::AutoDisabled),
            Channel::new(1, "sk-manual")
                .with_models(["gpt-4o"])
                .with_status(ChannelStatus::ManuallyDisabled),
        ])
        .await;
        fixture
            .options
            .update("AutomaticDisableChannelEnabled", "true")
            .expect("option");
        fixture
            .options
            .update("AutomaticEnableChannelEnabled", "true")
            .expect("option");

        let (revoked, back, manual) = (fixture.ids[0], fixture.ids[1], fixture.ids[2]);
        let probe = Arc::new(ScriptedProbe {
            errors: HashMap::from([(revoked, UpstreamError::new(401, "invalid key"))]),
            ..ScriptedProbe::default()
        });
        let report = prober(&fixture, probe).run_once().await.expect("pass");

        assert_eq!(report.disabled, vec![revoked]);
        assert_eq!(report.enabled, vec![back]);
        assert_eq!(report.failed, 1);
        assert_eq!(
            fixture.store.get_channel(manual).await.expect("get").status,
            ChannelStatus::ManuallyDisabled
        );
        let served: Vec<i64> = fixture
            .index
            .channels_for_model("gpt-4o")
            .iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(served, vec![back]);
    }

    #[tokio::test]
    async fn probe_uses_mapped_model_and_flags_channels_without_models() {
        let mut mapped = Channel::new(1, "sk-a").with_models(["gpt-4o"]);
        mapped
            .model_mapping
            .insert("gpt-4o".to_string(), "gpt-4o-2024-08-06".to_string());
        let fixture = fixture(vec![mapped, Channel::new(1, "sk-empty")]).await;
        let probe = Arc::new(ScriptedProbe::default());
        let report = prober(&fixture, probe.clone())
            .run_once()
            .await
            .expect("pass");

        assert_eq!(report.failed, 1);
        let seen = probe
            .seen
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        assert_eq!(seen, vec![(fixture.ids[0], "gpt-4o-2024-08-06".to_string())]);
    }

    #[tokio::test]
    async fn overlapping_passes_are_rejected() {
        let fixture = fixture(vec![Channel::new(1, "sk-a").with_models(["gpt-4o"])]).await;
        let probe = Arc::new(ScriptedProbe {
            delays: HashMap::from([(fixture.ids[0], Duration::from_millis(100))]),
            ..ScriptedProbe::default()
        });
        let prober = Arc::new(prober(&fixture, probe));

        let first = {
            let prober = prober.clone();
            tokio::spawn(async move { prober.run_once().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(prober.is_running());
        assert!(matches!(
            prober.run_once().await,
            Err(ProbeError::AlreadyRunning)
        ));
        first.await.expect("join").expect("pass");
        assert!(!prober.is_running());
    }

    #[tokio::test]
    async fn http_probe_posts_minimal_completion() {
        if !can_bind_localhost() {
            return;
        }
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/chat/completions")
                    .header("authorization", "Bearer sk-live")
                    .body_includes("\"max_tokens\":2")
                    .body_includes("\"model\":\"gpt-4o\"");
                then.status(200)
                    .header("content-type", "application/json")
                    .body(r#"{"choices":[],"usage":{"prompt_tokens":1,"completion_tokens":1}}"#);
            })
            .await;

        let probe = HttpChannelProbe::new(Duration::from_secs(5)).expect("client");
        let channel = Channel::new(1, "sk-live").with_base_url(server.base_url());
        probe.probe(&channel, "gpt-4o").await.expect("probe");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn http_probe_classifies_provider_errors() {
        if !can_bind_localhost() {
            return;
        }
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/chat/completions");
                then.status(429)
                    .header("content-type", "application/json")
                    .body(r#"{"error":{"message":"You exceeded your current quota","type":"insufficient_quota","code":"insufficient_quota"}}"#);
            })
            .await;

        let probe = HttpChannelProbe::new(Duration::from_secs(5)).expect("client");
        let channel = Channel::new(1, "sk-live").with_base_url(format!("{}/", server.base_url()));
        let err = probe.probe(&channel, "gpt-4o").await.expect_err("quota");
        match &err {
            ProbeError::Upstream(upstream) => {
                assert_eq!(upstream.status, 429);
                assert_eq!(upstream.error_type, "insufficient_quota");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.should_disable_channel());
    }
}
