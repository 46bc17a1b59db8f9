//! Routing, admission control and accounting for a multi-tenant AI gateway.

pub mod admin;
pub mod auth;
pub mod balance;
pub mod cache;
pub mod channel_index;
pub mod config;
pub mod costing;
pub mod entity_cache;
pub mod health;
pub mod ledger;
pub mod limits;
pub mod observability;
pub mod probe;
#[cfg(feature = "store-redis")]
pub mod redis_store;
pub mod router;
#[cfg(feature = "store-sqlite")]
pub mod sqlite_store;
pub mod store;
pub mod store_types;
pub mod upstream;

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::Instrument;

use crate::utils::task::AbortOnDrop;
use balance::{BalanceError, BalanceOracle, FixedBalance};
use cache::CacheStore;
use channel_index::ChannelIndex;
use config::{ConfigError, RuntimeOptions};
use costing::{PriceTable, PriceTableError, Prices, UnitPrice};
use entity_cache::EntityCache;
use health::HealthMonitor;
use ledger::{QuotaLedger, Settlement};
use limits::{InMemoryRateLimitBackend, LimiterError, RateLimitBackend, RateLimiter};
use observability::{Observability, ObservabilitySnapshot};
use probe::{ChannelProbe, ChannelProber, HttpChannelProbe, ProbeError};
use router::ChannelSelector;
use store::{Store, StoreError};

pub use auth::AuthContext;
pub use config::GatewayConfig;
pub use ledger::Usage;
pub use store_types::{
    Channel, ChannelStatus, Group, GroupStatus, Token, TokenStatus, UsageLogQuery, UsageLogRecord,
};
pub use upstream::UpstreamError;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("rate limit exceeded: {scope}")]
    RateLimited { scope: String },
    #[error("no token provided")]
    MissingToken,
    #[error("invalid token")]
    InvalidToken,
    #[error("token {name} (#{id}) has expired")]
    TokenExpired { id: i64, name: String },
    #[error("token {name} (#{id}) quota is exhausted")]
    TokenExhausted { id: i64, name: String },
    #[error("token {name} (#{id}) is not enabled")]
    TokenDisabled { id: i64, name: String },
    #[error("token may only be used from subnet {subnet}, current ip: {ip}")]
    SubnetForbidden { subnet: String, ip: String },
    #[error("group {group} is disabled")]
    GroupDisabled { group: String },
    #[error("token is not allowed to use model {model}")]
    ModelForbidden { model: String },
    #[error("token #{id} quota insufficient: remaining {remaining:.6}, required {required:.6}")]
    TokenQuotaInsufficient {
        id: i64,
        remaining: f64,
        required: f64,
    },
    #[error("group {group} balance insufficient: remaining {remaining:.6}, required {required:.6}")]
    BalanceInsufficient {
        group: String,
        remaining: f64,
        required: f64,
    },
    #[error("no price configured for model {model}")]
    PriceNotFound { model: String },
    #[error("no available channel for model {model} in group {group}")]
    NoChannel { group: String, model: String },
    #[error("invalid channel id: {id}")]
    ChannelInvalid { id: i64 },
    #[error("channel #{id} is disabled")]
    ChannelDisabled { id: i64 },
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Limiter(#[from] LimiterError),
    #[error(transparent)]
    Balance(#[from] BalanceError),
    #[error(transparent)]
    Prices(#[from] PriceTableError),
    #[error(transparent)]
    Probe(#[from] ProbeError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("{what} timed out after {after:?}")]
    Timeout { what: &'static str, after: Duration },
}

impl GatewayError {
    /// HTTP status the error maps to at the client boundary.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::RateLimited { .. } => 429,
            Self::MissingToken
            | Self::InvalidToken
            | Self::TokenExpired { .. }
            | Self::TokenExhausted { .. }
            | Self::TokenDisabled { .. } => 401,
            Self::SubnetForbidden { .. }
            | Self::GroupDisabled { .. }
            | Self::ModelForbidden { .. }
            | Self::TokenQuotaInsufficient { .. }
            | Self::BalanceInsufficient { .. } => 403,
            Self::ChannelInvalid { .. } | Self::InvalidRequest { .. } => 400,
            Self::NoChannel { .. } | Self::ChannelDisabled { .. } => 503,
            Self::Upstream(err) if (400..=599).contains(&err.status) => err.status,
            Self::Upstream(_) => 502,
            Self::Timeout { .. } => 504,
            Self::PriceNotFound { .. }
            | Self::Store(_)
            | Self::Limiter(_)
            | Self::Balance(_)
            | Self::Prices(_)
            | Self::Probe(_)
            | Self::Config(_) => 500,
        }
    }

    /// Rejected before any provider spend.
    pub fn is_admission(&self) -> bool {
        matches!(self.status_code(), 401 | 403 | 429)
    }
}

pub trait Clock: Send + Sync {
    fn now_millis(&self) -> u64;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_else(|_| Duration::from_secs(0));
        u64::try_from(now.as_millis()).unwrap_or(u64::MAX)
    }
}

/// Clock driven by hand, for deterministic time-dependent behavior.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    pub fn new(now_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(now_ms),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now_ms
            .fetch_add(limits::duration_to_millis(by), Ordering::SeqCst);
    }

    pub fn set(&self, now_ms: u64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// A normalized completion request as the core sees it.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RelayRequest {
    pub model: String,
    pub prompt_tokens: u32,
    pub max_completion_tokens: u32,
    /// Bypasses selection; the channel must still be enabled.
    #[serde(default)]
    pub pinned_channel: Option<i64>,
    #[serde(default)]
    pub body: serde_json::Value,
}

impl RelayRequest {
    pub fn new(model: impl Into<String>, prompt_tokens: u32, max_completion_tokens: u32) -> Self {
        Self {
            model: model.into(),
            prompt_tokens,
            max_completion_tokens,
            pinned_channel: None,
            body: serde_json::Value::Null,
        }
    }

    pub fn with_pinned_channel(mut self, channel_id: i64) -> Self {
        self.pinned_channel = Some(channel_id);
        self
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RelayResponse {
    pub usage: Usage,
    #[serde(default)]
    pub body: serde_json::Value,
}

#[derive(Clone, Debug)]
pub struct RelayResult {
    pub response: RelayResponse,
    pub channel_id: i64,
    pub amount: f64,
    pub attempts: u32,
}

/// Everything a provider adaptor needs to call the selected channel.
#[derive(Clone, PartialEq, Eq)]
pub struct ChannelContext {
    pub channel_id: i64,
    pub channel_type: i32,
    pub channel_name: String,
    pub key: String,
    pub base_url: String,
    pub config: BTreeMap<String, String>,
    pub model_mapping: BTreeMap<String, String>,
    pub origin_model: String,
    pub actual_model: String,
}

impl std::fmt::Debug for ChannelContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelContext")
            .field("channel_id", &self.channel_id)
            .field("channel_type", &self.channel_type)
            .field("channel_name", &self.channel_name)
            .field("key", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("origin_model", &self.origin_model)
            .field("actual_model", &self.actual_model)
            .finish_non_exhaustive()
    }
}

impl ChannelContext {
    pub fn authorization_header(&self) -> String {
        format!("Bearer {}", self.key)
    }
}

/// Per-provider request translation lives outside the core.
#[async_trait]
pub trait ProviderAdaptor: Send + Sync {
    async fn execute(
        &self,
        context: &ChannelContext,
        request: &RelayRequest,
    ) -> Result<RelayResponse, UpstreamError>;
}

/// Handles for the long-lived loops; dropping them stops every loop.
#[derive(Debug, Default)]
pub struct BackgroundTasks {
    tasks: Vec<AbortOnDrop>,
}

impl BackgroundTasks {
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.tasks.iter().map(AbortOnDrop::name).collect()
    }

    pub fn shutdown(self) {
        drop(self);
    }
}

pub struct GatewayBuilder {
    config: GatewayConfig,
    store: Arc<dyn Store>,
    cache: Option<Arc<dyn CacheStore>>,
    rate_limit_backend: Option<Arc<dyn RateLimitBackend>>,
    balance: Option<Arc<dyn BalanceOracle>>,
    prices: PriceTable,
    probe: Option<Arc<dyn ChannelProbe>>,
    clock: Option<Arc<dyn Clock>>,
}

impl GatewayBuilder {
    pub fn new(config: GatewayConfig, store: Arc<dyn Store>) -> Self {
        Self {
            config,
            store,
            cache: None,
            rate_limit_backend: None,
            balance: None,
            prices: PriceTable::default(),
            probe: None,
            clock: None,
        }
    }

    /// Shared entity cache; without one every lookup reads the store.
    pub fn cache(mut self, cache: Arc<dyn CacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Distributed limiter backing; defaults to the in-memory one.
    pub fn rate_limit_backend(mut self, backend: Arc<dyn RateLimitBackend>) -> Self {
        self.rate_limit_backend = Some(backend);
        self
    }

    pub fn balance(mut self, oracle: Arc<dyn BalanceOracle>) -> Self {
        self.balance = Some(oracle);
        self
    }

    pub fn prices(mut self, prices: PriceTable) -> Self {
        self.prices = prices;
        self
    }

    pub fn probe(mut self, probe: Arc<dyn ChannelProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Applies persisted options and builds the first channel index.
    pub async fn build(self) -> Result<Gateway, GatewayError> {
        let Self {
            config,
            store,
            cache,
            rate_limit_backend,
            balance,
            prices,
            probe,
            clock,
        } = self;
        config.validate()?;
        prices.validate()?;

        let clock = clock.unwrap_or_else(|| Arc::new(SystemClock));
        let options = Arc::new(RuntimeOptions::from_config(&config));
        apply_persisted_options(store.as_ref(), &options).await?;

        let (backend, memory_limiter) = match rate_limit_backend {
            Some(backend) => (backend, None),
            None => {
                let memory = Arc::new(InMemoryRateLimitBackend::new(Duration::from_secs(
                    config.limits.key_expiration_seconds,
                )));
                (memory.clone() as Arc<dyn RateLimitBackend>, Some(memory))
            }
        };
        let limiter = RateLimiter::new(backend, clock.clone());

        let store_timeout = config.relay.store_timeout();
        let entities = EntityCache::new(store.clone(), cache, &config.cache)
            .with_store_timeout(store_timeout);
        let index = Arc::new(
            ChannelIndex::new(store.clone(), options.clone(), clock.clone())
                .with_store_timeout(store_timeout),
        );
        index.rebuild().await?;
        let selector = ChannelSelector::new(index.clone());
        let health = Arc::new(
            HealthMonitor::new(&config.health, store.clone(), index.clone())
                .with_store_timeout(store_timeout),
        );

        let oracle = balance.unwrap_or_else(|| Arc::new(FixedBalance::default()));
        let ledger = Arc::new(
            QuotaLedger::new(store.clone(), entities.clone(), oracle, clock.clone())
                .with_timeout(store_timeout)
                .with_pre_consume(config.relay.pre_consume),
        );

        let probe = match probe {
            Some(probe) => probe,
            None => Arc::new(HttpChannelProbe::new(config.probe.timeout())?),
        };
        let prober = Arc::new(
            ChannelProber::new(
                store.clone(),
                index.clone(),
                probe,
                options.clone(),
                config.probe.clone(),
                clock.clone(),
            )
            .with_store_timeout(store_timeout),
        );

        tracing::info!(
            channels = index.snapshot().channel_count(),
            cache = entities.cache_enabled(),
            distributed_limiter = memory_limiter.is_none(),
            "gateway ready"
        );

        Ok(Gateway {
            config,
            options,
            store,
            entities,
            limiter,
            memory_limiter,
            index,
            selector,
            health,
            ledger,
            prices: Arc::new(Prices::new(prices)),
            prober,
            observability: Arc::new(Observability::default()),
            clock,
        })
    }
}

/// Owns every component. There is no process-global state; embedders hold
/// the `Gateway` and pass it where needed.
pub struct Gateway {
    config: GatewayConfig,
    options: Arc<RuntimeOptions>,
    store: Arc<dyn Store>,
    entities: EntityCache,
    limiter: RateLimiter,
    memory_limiter: Option<Arc<InMemoryRateLimitBackend>>,
    index: Arc<ChannelIndex>,
    selector: ChannelSelector,
    health: Arc<HealthMonitor>,
    ledger: Arc<QuotaLedger>,
    prices: Arc<Prices>,
    prober: Arc<ChannelProber>,
    observability: Arc<Observability>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("index", &self.index)
            .field("entities", &self.entities)
            .field("limiter", &self.limiter)
            .field("health", &self.health)
            .finish_non_exhaustive()
    }
}

impl Gateway {
    pub fn builder(config: GatewayConfig, store: Arc<dyn Store>) -> GatewayBuilder {
        GatewayBuilder::new(config, store)
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn options(&self) -> &Arc<RuntimeOptions> {
        &self.options
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn entities(&self) -> &EntityCache {
        &self.entities
    }

    pub fn index(&self) -> &Arc<ChannelIndex> {
        &self.index
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn ledger(&self) -> &Arc<QuotaLedger> {
        &self.ledger
    }

    pub fn prices(&self) -> &Arc<Prices> {
        &self.prices
    }

    pub fn prober(&self) -> &Arc<ChannelProber> {
        &self.prober
    }

    pub fn observability(&self) -> ObservabilitySnapshot {
        self.observability.snapshot()
    }

    /// Spawns index/option sync, limiter GC, health consumers and the
    /// prober (when enabled).
    pub fn start(&self) -> BackgroundTasks {
        let mut tasks = Vec::new();

        let store = self.store.clone();
        let options = self.options.clone();
        let index = self.index.clone();
        let period = Duration::from_secs(self.config.index.sync_interval_seconds.max(1));
        tasks.push(AbortOnDrop::spawn("channel-index-sync", async move {
            let mut ticker = every(period);
            loop {
                ticker.tick().await;
                if let Err(err) = apply_persisted_options(store.as_ref(), &options).await {
                    tracing::warn!(error = %err, "failed to sync options");
                }
                if let Err(err) = index.rebuild().await {
                    tracing::warn!(error = %err, "failed to sync channel index");
                }
            }
        }));

        if let Some(memory) = self.memory_limiter.clone() {
            let clock = self.clock.clone();
            let period = Duration::from_secs(self.config.limits.gc_interval_seconds.max(1));
            tasks.push(AbortOnDrop::spawn("rate-limit-gc", async move {
                let mut ticker = every(period);
                loop {
                    ticker.tick().await;
                    let evicted = memory.gc(clock.now_millis());
                    if evicted > 0 {
                        tracing::debug!(evicted, remaining = memory.len(), "rate limit windows evicted");
                    }
                }
            }));
        }

        tasks.extend(self.health.start());
        if let Some(prober) = self.prober.start() {
            tasks.push(prober);
        }
        BackgroundTasks { tasks }
    }

    /// Global per-client-IP cap.
    pub async fn admit_ip(&self, ip: std::net::IpAddr) -> Result<(), GatewayError> {
        let limit = self.options.global_api_rate_limit();
        let allowed = self
            .limiter
            .allow(limits::SCOPE_IP, &ip.to_string(), limit, Duration::from_secs(60))
            .await?;
        if !allowed {
            self.observability.record_rate_limited();
            return Err(GatewayError::RateLimited {
                scope: limits::SCOPE_IP.to_string(),
            });
        }
        Ok(())
    }

    pub fn select_channel(
        &self,
        group: &str,
        model: &str,
        ignore_first_priority: bool,
    ) -> Result<Arc<Channel>, GatewayError> {
        self.selector
            .pick(model, ignore_first_priority)
            .map_err(|_| {
                self.observability.record_no_channel();
                GatewayError::NoChannel {
                    group: group.to_string(),
                    model: model.to_string(),
                }
            })
    }

    /// Loads a specific channel from the store, bypassing selection.
    pub async fn select_pinned_channel(&self, id: i64) -> Result<Arc<Channel>, GatewayError> {
        let channel = match self
            .bounded("channel lookup", self.store.get_channel(id))
            .await
        {
            Ok(channel) => channel,
            Err(GatewayError::Store(err)) if err.is_not_found() => {
                return Err(GatewayError::ChannelInvalid { id });
            }
            Err(err) => return Err(err),
        };
        if !channel.status.is_enabled() {
            return Err(GatewayError::ChannelDisabled { id });
        }
        Ok(Arc::new(channel))
    }

    /// Stamps the channel's credentials and routing data onto a context the
    /// provider adaptor executes against.
    pub fn setup_context_for_selected_channel(
        &self,
        channel: &Channel,
        model: &str,
    ) -> ChannelContext {
        ChannelContext {
            channel_id: channel.id,
            channel_type: channel.channel_type,
            channel_name: channel.name.clone(),
            key: channel.key.clone(),
            base_url: channel.base_url.clone(),
            config: channel.config.clone(),
            model_mapping: channel.model_mapping.clone(),
            origin_model: model.to_string(),
            actual_model: channel.mapped_model(model).to_string(),
        }
    }

    pub fn record_outcome(&self, channel_id: i64, success: bool) {
        self.health.record_outcome(channel_id, success);
    }

    pub fn unit_price(&self, model: &str, channel_type: i32) -> Result<UnitPrice, GatewayError> {
        self.prices
            .unit_price(model, channel_type)
            .ok_or_else(|| GatewayError::PriceNotFound {
                model: model.to_string(),
            })
    }

    /// Runs one request end to end: admission, authentication, selection,
    /// pre-authorization, the upstream call with retries, and settlement.
    pub async fn relay(
        &self,
        authorization: &str,
        client_ip: std::net::IpAddr,
        request: RelayRequest,
        adaptor: &dyn ProviderAdaptor,
    ) -> Result<RelayResult, GatewayError> {
        let span = tracing::info_span!("relay", model = %request.model, ip = %client_ip);
        self.relay_inner(authorization, client_ip, request, adaptor)
            .instrument(span)
            .await
    }

    async fn relay_inner(
        &self,
        authorization: &str,
        client_ip: std::net::IpAddr,
        request: RelayRequest,
        adaptor: &dyn ProviderAdaptor,
    ) -> Result<RelayResult, GatewayError> {
        self.observability.record_request();
        self.admit_ip(client_ip).await?;
        let auth = self
            .authenticate(authorization, client_ip, &request.model)
            .await?;
        let group = auth.group.id.as_str();

        let pinned = request.pinned_channel.is_some();
        let mut channel = match request.pinned_channel {
            Some(id) => self.select_pinned_channel(id).await?,
            None => self.select_channel(group, &request.model, false)?,
        };

        let price = self.unit_price(&request.model, channel.channel_type)?;
        let estimate = price.estimate(request.prompt_tokens, request.max_completion_tokens);
        let reservation = self.ledger.pre_authorize(&auth.token, estimate).await?;
        let mut release = self.ledger.guard(Settlement {
            token: auth.token.clone(),
            channel_id: channel.id,
            model: request.model.clone(),
            usage: Usage::default(),
            price,
            reserved: reservation.reserved,
            content: String::new(),
        });

        let upstream_timeout = self.config.relay.upstream_timeout();
        let retries = if pinned { 0 } else { self.options.retry_times() };
        let mut attempt: u64 = 0;
        loop {
            let context = self.setup_context_for_selected_channel(&channel, &request.model);
            self.observability.record_upstream_call();
            let result =
                match tokio::time::timeout(upstream_timeout, adaptor.execute(&context, &request))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(UpstreamError::new(
                        504,
                        format!(
                            "upstream did not respond within {}ms",
                            limits::duration_to_millis(upstream_timeout)
                        ),
                    )
                    .with_type("timeout")),
                };
            match result {
                Ok(response) => {
                    self.record_outcome(channel.id, true);
                    let price = self
                        .prices
                        .unit_price(&request.model, channel.channel_type)
                        .unwrap_or(price);
                    release.disarm();
                    let amount = self
                        .settle(Settlement {
                            token: auth.token.clone(),
                            channel_id: channel.id,
                            model: request.model.clone(),
                            usage: response.usage,
                            price,
                            reserved: reservation.reserved,
                            content: String::new(),
                        })
                        .await;
                    return Ok(RelayResult {
                        response,
                        channel_id: channel.id,
                        amount,
                        attempts: u32::try_from(attempt + 1).unwrap_or(u32::MAX),
                    });
                }
                Err(err) => {
                    self.observability.record_upstream_error();
                    tracing::warn!(
                        channel_id = channel.id,
                        status = err.status,
                        attempt,
                        error = %err,
                        "upstream call failed"
                    );
                    self.handle_upstream_error(&channel, &err).await;

                    let next = if !pinned && attempt < retries && should_retry(err.status) {
                        self.select_channel(group, &request.model, true).ok()
                    } else {
                        None
                    };
                    match next {
                        Some(next) => {
                            attempt += 1;
                            self.observability.record_retry();
                            channel = next;
                        }
                        None => {
                            release.disarm();
                            self.settle(Settlement {
                                token: auth.token.clone(),
                                channel_id: channel.id,
                                model: request.model.clone(),
                                usage: Usage::default(),
                                price,
                                reserved: reservation.reserved,
                                content: String::new(),
                            })
                            .await;
                            return Err(GatewayError::Upstream(err));
                        }
                    }
                }
            }
        }
    }

    /// Credential-class errors disable the channel right away when automatic
    /// disabling is on; everything else is a health sample.
    async fn handle_upstream_error(&self, channel: &Channel, err: &UpstreamError) {
        if !(err.should_disable_channel() && self.options.automatic_disable_channel()) {
            self.record_outcome(channel.id, false);
            return;
        }
        match self
            .bounded(
                "channel status",
                self.store.update_channel_status(
                    channel.id,
                    ChannelStatus::AutoDisabled,
                    Some(ChannelStatus::Enabled),
                ),
            )
            .await
        {
            Ok(true) => {
                tracing::warn!(channel_id = channel.id, error = %err, "channel auto-disabled after upstream error");
                if let Err(err) = self.index.rebuild().await {
                    tracing::error!(error = %err, "channel index rebuild failed");
                }
            }
            Ok(false) => {}
            Err(err) => {
                tracing::error!(channel_id = channel.id, error = %err, "failed to auto-disable channel");
            }
        }
    }

    /// Settlement runs as its own task so a dropped request cannot cut it
    /// short.
    async fn settle(&self, settlement: Settlement) -> f64 {
        match self.ledger.settle_in_background(settlement).await {
            Ok(amount) => amount,
            Err(err) => {
                tracing::error!(error = %err, "settlement task failed");
                0.0
            }
        }
    }

    async fn bounded<T, E, F>(&self, what: &'static str, fut: F) -> Result<T, GatewayError>
    where
        F: Future<Output = Result<T, E>>,
        E: Into<GatewayError>,
    {
        with_deadline(what, self.config.relay.store_timeout(), fut).await
    }
}

pub(crate) async fn with_deadline<T, E, F>(
    what: &'static str,
    after: Duration,
    fut: F,
) -> Result<T, GatewayError>
where
    F: Future<Output = Result<T, E>>,
    E: Into<GatewayError>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => Err(GatewayError::Timeout { what, after }),
    }
}

fn should_retry(status: u16) -> bool {
    match status {
        429 => true,
        500..=599 => true,
        400 => false,
        200..=299 => false,
        _ => true,
    }
}

fn every(period: Duration) -> tokio::time::Interval {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker
}

/// Applies options persisted in the store. Invalid entries are skipped.
async fn apply_persisted_options(
    store: &dyn Store,
    options: &RuntimeOptions,
) -> Result<(), StoreError> {
    for (key, value) in store.load_options().await? {
        if let Err(err) = options.update(&key, &value) {
            tracing::warn!(key = %key, error = %err, "ignoring persisted option");
        }
    }
    Ok(())
}
