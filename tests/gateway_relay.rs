use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use aiproxy::gateway::balance::FixedBalance;
use aiproxy::gateway::config::{
    OPTION_AUTOMATIC_DISABLE_CHANNEL, OPTION_GLOBAL_API_RATE_LIMIT, OPTION_RETRY_TIMES,
};
use aiproxy::gateway::costing::PriceTable;
use aiproxy::gateway::store::{MemoryStore, Store};
use aiproxy::gateway::{
    Channel, ChannelContext, ChannelStatus, Gateway, GatewayConfig, GatewayError, Group,
    ManualClock, ProviderAdaptor, RelayRequest, RelayResponse, Token, UpstreamError, Usage,
    UsageLogQuery,
};

const AUTH: &str = "Bearer sk-abc";
const IP: IpAddr = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7));

#[derive(Default)]
struct ScriptedAdaptor {
    failures: Mutex<HashMap<i64, UpstreamError>>,
    calls: Mutex<Vec<(i64, String)>>,
}

impl ScriptedAdaptor {
    fn fail(&self, channel_id: i64, err: UpstreamError) {
        self.failures
            .lock()
            .expect("lock")
            .insert(channel_id, err);
    }

    fn calls(&self) -> Vec<i64> {
        self.calls
            .lock()
            .expect("lock")
            .iter()
            .map(|(id, _)| *id)
            .collect()
    }
}

#[async_trait]
impl ProviderAdaptor for ScriptedAdaptor {
    async fn execute(
        &self,
        context: &ChannelContext,
        request: &RelayRequest,
    ) -> Result<RelayResponse, UpstreamError> {
        self.calls
            .lock()
            .expect("lock")
            .push((context.channel_id, context.actual_model.clone()));
        if let Some(err) = self.failures.lock().expect("lock").get(&context.channel_id) {
            return Err(err.clone());
        }
        Ok(RelayResponse {
            usage: Usage::new(request.prompt_tokens, 500),
            body: serde_json::json!({"id": "cmpl-1"}),
        })
    }
}

/// Never answers for the listed channels.
struct StallingAdaptor {
    stalled: Vec<i64>,
}

#[async_trait]
impl ProviderAdaptor for StallingAdaptor {
    async fn execute(
        &self,
        context: &ChannelContext,
        request: &RelayRequest,
    ) -> Result<RelayResponse, UpstreamError> {
        if self.stalled.contains(&context.channel_id) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        Ok(RelayResponse {
            usage: Usage::new(request.prompt_tokens, 10),
            body: serde_json::Value::Null,
        })
    }
}

struct Harness {
    gw: Gateway,
    store: Arc<MemoryStore>,
    clock: Arc<ManualClock>,
    oracle: Arc<FixedBalance>,
    adaptor: ScriptedAdaptor,
    c1: i64,
    c2: i64,
}

async fn harness(config: GatewayConfig, group: Group, token: Token) -> Harness {
    let store = Arc::new(MemoryStore::new());
    store.create_group(&group).await.expect("group");
    store.create_token(token).await.expect("token");
    let ids = store
        .insert_channels(vec![
            Channel::new(1, "sk-c1")
                .with_name("c1")
                .with_models(["m"])
                .with_priority(10),
            Channel::new(1, "sk-c2")
                .with_name("c2")
                .with_models(["m"])
                .with_priority(5),
        ])
        .await
        .expect("channels");

    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let oracle = Arc::new(FixedBalance::new(0.0).with_balance(group.id.clone(), 10_000.0));
    let gw = Gateway::builder(config, store.clone())
        .prices(PriceTable::default().with_price("m", 1.0))
        .balance(oracle.clone())
        .clock(clock.clone())
        .build()
        .await
        .expect("gateway");

    Harness {
        gw,
        store,
        clock,
        oracle,
        adaptor: ScriptedAdaptor::default(),
        c1: ids[0],
        c2: ids[1],
    }
}

async fn default_harness() -> Harness {
    harness(
        GatewayConfig::default(),
        Group::new("g1"),
        Token::new("g1", "abc").with_name("t1"),
    )
    .await
}

impl Harness {
    async fn relay(&self, request: RelayRequest) -> Result<aiproxy::RelayResult, GatewayError> {
        self.gw.relay(AUTH, IP, request, &self.adaptor).await
    }
}

#[tokio::test]
async fn group_qpm_admits_two_then_limits_until_the_window_passes() {
    let h = harness(
        GatewayConfig::default(),
        Group::new("g1").with_qpm(2),
        Token::new("g1", "abc"),
    )
    .await;

    h.relay(RelayRequest::new("m", 10, 10)).await.expect("first");
    h.relay(RelayRequest::new("m", 10, 10)).await.expect("second");
    let err = h
        .relay(RelayRequest::new("m", 10, 10))
        .await
        .expect_err("third");
    assert!(matches!(err, GatewayError::RateLimited { .. }));
    assert_eq!(err.status_code(), 429);

    h.clock.advance(Duration::from_secs(60));
    h.relay(RelayRequest::new("m", 10, 10)).await.expect("fourth");
    assert_eq!(h.adaptor.calls().len(), 3);
}

#[tokio::test]
async fn token_ceiling_rejects_before_the_upstream_call() {
    let mut token = Token::new("g1", "abc").with_quota(1000.0);
    token.used_amount = 950.0;
    let h = harness(GatewayConfig::default(), Group::new("g1"), token).await;

    // (50_000 + 50_000) tokens at 1.0 per 1K = 100.
    let err = h
        .relay(RelayRequest::new("m", 50_000, 50_000))
        .await
        .expect_err("ceiling");
    match err {
        GatewayError::TokenQuotaInsufficient {
            remaining,
            required,
            ..
        } => {
            assert_eq!(remaining, 50.0);
            assert_eq!(required, 100.0);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(h.adaptor.calls().is_empty());
    assert_eq!(h.oracle.balance("g1"), 10_000.0);
    let group = h.store.get_group("g1").await.expect("group");
    assert_eq!(group.used_amount, 0.0);
}

#[tokio::test]
async fn selection_honors_priority_tiers() {
    let h = default_harness().await;
    for _ in 0..1000 {
        assert_eq!(h.gw.select_channel("g1", "m", false).expect("c1").id, h.c1);
    }
    for _ in 0..1000 {
        assert_eq!(h.gw.select_channel("g1", "m", true).expect("c2").id, h.c2);
    }
    let err = h
        .gw
        .select_channel("g1", "unknown", false)
        .expect_err("no channel");
    assert!(matches!(err, GatewayError::NoChannel { .. }));
}

#[tokio::test]
async fn successful_relay_settles_actual_usage() {
    let h = default_harness().await;
    let result = h
        .relay(RelayRequest::new("m", 1500, 4000))
        .await
        .expect("relay");
    assert_eq!(result.channel_id, h.c1);
    assert_eq!(result.attempts, 1);
    // (1500 + 500) at 1.0 per 1K.
    assert_eq!(result.amount, 2.0);
    assert_eq!(h.oracle.balance("g1"), 9_998.0);

    let group = h.store.get_group("g1").await.expect("group");
    assert_eq!((group.used_amount, group.request_count), (2.0, 1));
    let channel = h.store.get_channel(h.c1).await.expect("channel");
    assert_eq!(channel.request_count, 1);
    let logs = h
        .store
        .query_usage_logs(&UsageLogQuery::default())
        .await
        .expect("logs");
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].channel_id, h.c1);
    assert_eq!(logs[0].token_name, "t1");

    let stats = h.gw.observability();
    assert_eq!(stats.requests, 1);
    assert_eq!(stats.upstream_calls, 1);
}

#[tokio::test]
async fn retryable_failure_moves_to_the_lower_tier() {
    let h = default_harness().await;
    h.gw.options()
        .update(OPTION_RETRY_TIMES, "1")
        .expect("option");
    h.adaptor.fail(h.c1, UpstreamError::new(503, "overloaded"));

    let result = h
        .relay(RelayRequest::new("m", 100, 100))
        .await
        .expect("relay");
    assert_eq!(result.channel_id, h.c2);
    assert_eq!(result.attempts, 2);
    assert_eq!(h.adaptor.calls(), vec![h.c1, h.c2]);
    assert_eq!(h.gw.observability().retries, 1);
    assert_eq!(h.gw.observability().upstream_errors, 1);
}

#[tokio::test]
async fn non_retryable_failure_refunds_the_reservation() {
    let mut config = GatewayConfig::default();
    config.relay.pre_consume = true;
    let h = harness(config, Group::new("g1"), Token::new("g1", "abc")).await;
    h.gw.options()
        .update(OPTION_RETRY_TIMES, "3")
        .expect("option");
    h.adaptor.fail(h.c1, UpstreamError::new(400, "bad request"));

    let err = h
        .relay(RelayRequest::new("m", 1000, 1000))
        .await
        .expect_err("upstream");
    match &err {
        GatewayError::Upstream(upstream) => assert_eq!(upstream.status, 400),
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(err.status_code(), 400);
    assert_eq!(h.adaptor.calls(), vec![h.c1]);
    assert_eq!(h.oracle.balance("g1"), 10_000.0);
    let logs = h
        .store
        .query_usage_logs(&UsageLogQuery::default())
        .await
        .expect("logs");
    assert!(logs.is_empty());
}

#[tokio::test]
async fn dropped_request_releases_its_reservation() {
    let mut config = GatewayConfig::default();
    config.relay.pre_consume = true;
    let h = harness(config, Group::new("g1"), Token::new("g1", "abc")).await;
    let stalling = StallingAdaptor {
        stalled: vec![h.c1, h.c2],
    };

    let relay = h
        .gw
        .relay(AUTH, IP, RelayRequest::new("m", 1000, 1000), &stalling);
    let outcome = tokio::time::timeout(Duration::from_millis(200), relay).await;
    assert!(outcome.is_err());

    for _ in 0..100 {
        if h.oracle.balance("g1") == 10_000.0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(h.oracle.balance("g1"), 10_000.0);
    let logs = h
        .store
        .query_usage_logs(&UsageLogQuery::default())
        .await
        .expect("logs");
    assert!(logs.is_empty());
}

#[tokio::test]
async fn stalled_upstream_times_out_and_retries() {
    let mut config = GatewayConfig::default();
    config.relay.upstream_timeout_ms = 50;
    config.relay.pre_consume = true;
    let h = harness(config, Group::new("g1"), Token::new("g1", "abc")).await;
    let stalling = StallingAdaptor {
        stalled: vec![h.c1],
    };

    let err = h
        .gw
        .relay(AUTH, IP, RelayRequest::new("m", 1000, 1000), &stalling)
        .await
        .expect_err("timed out");
    match &err {
        GatewayError::Upstream(upstream) => assert_eq!(upstream.status, 504),
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(h.oracle.balance("g1"), 10_000.0);

    h.gw.options()
        .update(OPTION_RETRY_TIMES, "1")
        .expect("option");
    let result = h
        .gw
        .relay(AUTH, IP, RelayRequest::new("m", 1000, 1000), &stalling)
        .await
        .expect("relay");
    assert_eq!(result.channel_id, h.c2);
    assert_eq!(result.attempts, 2);
    assert_eq!(h.gw.observability().upstream_errors, 2);
}

#[tokio::test]
async fn credential_errors_disable_the_channel() {
    let h = default_harness().await;
    h.gw.options()
        .update(OPTION_AUTOMATIC_DISABLE_CHANNEL, "true")
        .expect("option");
    h.gw.options()
        .update(OPTION_RETRY_TIMES, "1")
        .expect("option");
    h.adaptor.fail(
        h.c1,
        UpstreamError::new(401, "Incorrect API key provided").with_code("invalid_api_key"),
    );

    let result = h
        .relay(RelayRequest::new("m", 10, 10))
        .await
        .expect("relay");
    assert_eq!(result.channel_id, h.c2);
    let c1 = h.store.get_channel(h.c1).await.expect("c1");
    assert_eq!(c1.status, ChannelStatus::AutoDisabled);
    for _ in 0..100 {
        assert_eq!(h.gw.select_channel("g1", "m", false).expect("c2").id, h.c2);
    }
}

#[tokio::test]
async fn pinned_channel_bypasses_selection() {
    let h = default_harness().await;
    let result = h
        .relay(RelayRequest::new("m", 10, 10).with_pinned_channel(h.c2))
        .await
        .expect("pinned");
    assert_eq!(result.channel_id, h.c2);

    let err = h
        .relay(RelayRequest::new("m", 10, 10).with_pinned_channel(999))
        .await
        .expect_err("invalid");
    assert!(matches!(err, GatewayError::ChannelInvalid { id: 999 }));

    h.gw.disable_channel(h.c2).await.expect("disable");
    let err = h
        .relay(RelayRequest::new("m", 10, 10).with_pinned_channel(h.c2))
        .await
        .expect_err("disabled");
    assert!(matches!(err, GatewayError::ChannelDisabled { .. }));
}

#[tokio::test]
async fn global_ip_limit_applies_before_authentication() {
    let h = default_harness().await;
    h.gw.options()
        .update(OPTION_GLOBAL_API_RATE_LIMIT, "1")
        .expect("option");

    h.relay(RelayRequest::new("m", 10, 10)).await.expect("first");
    let err = h
        .gw
        .relay("Bearer sk-unknown", IP, RelayRequest::new("m", 10, 10), &h.adaptor)
        .await
        .expect_err("limited");
    assert!(matches!(err, GatewayError::RateLimited { .. }));

    let other_ip: IpAddr = "198.51.100.1".parse().expect("ip");
    let err = h
        .gw
        .relay("Bearer sk-unknown", other_ip, RelayRequest::new("m", 10, 10), &h.adaptor)
        .await
        .expect_err("unknown token");
    assert!(matches!(err, GatewayError::InvalidToken));
}

#[tokio::test]
async fn channel_context_carries_the_mapped_model() {
    let h = default_harness().await;
    let mut channel = h.store.get_channel(h.c1).await.expect("c1");
    channel
        .model_mapping
        .insert("m".to_string(), "m-2024".to_string());
    h.gw.update_channel(&channel).await.expect("update");

    h.relay(RelayRequest::new("m", 10, 10).with_pinned_channel(h.c1))
        .await
        .expect("relay");
    let calls = h.adaptor.calls.lock().expect("lock").clone();
    assert_eq!(calls, vec![(h.c1, "m-2024".to_string())]);

    let context = h.gw.setup_context_for_selected_channel(&channel, "m");
    assert_eq!(context.origin_model, "m");
    assert_eq!(context.actual_model, "m-2024");
    assert_eq!(context.authorization_header(), "Bearer sk-c1");
}

#[tokio::test]
async fn background_tasks_stop_on_shutdown() {
    let h = default_harness().await;
    let tasks = h.gw.start();
    assert!(tasks.names().contains(&"channel-index-sync"));
    assert!(tasks.names().contains(&"rate-limit-gc"));
    tasks.shutdown();
}
