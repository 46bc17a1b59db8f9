//! Administrative mutations. Every entry point writes the store first and then
//! refreshes whatever derived state reads it: the channel index for channels
//! and channel-related options, the entity cache for groups and tokens.

use rand::Rng;
use rand::distr::Alphanumeric;

use super::config::{OPTION_DEFAULT_CHANNEL_MODEL_MAPPING, OPTION_DEFAULT_CHANNEL_MODELS};
use super::probe::{ProbeAction, ProbeError, ProbeReport};
use super::store_types::{
    Channel, ChannelStatus, Group, GroupStatus, Token, TokenStatus, UsageLogQuery, UsageLogRecord,
};
use super::{Gateway, GatewayError};

const TOKEN_KEY_LEN: usize = 48;

/// Generates a fresh token secret.
pub fn generate_token_key() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_KEY_LEN)
        .map(char::from)
        .collect()
}

/// Keys are matched after the last `-` is stripped from the bearer value.
fn check_token_key(key: &str) -> Result<(), GatewayError> {
    if key.contains('-') {
        return Err(GatewayError::InvalidRequest {
            reason: "token key must not contain '-'".to_string(),
        });
    }
    Ok(())
}

/// Result of probing a single channel on demand.
#[derive(Debug)]
pub struct ChannelTest {
    pub channel_id: i64,
    pub action: ProbeAction,
    pub result: Result<(), ProbeError>,
}

impl Gateway {
    pub async fn insert_channels(&self, channels: Vec<Channel>) -> Result<Vec<i64>, GatewayError> {
        let ids = self
            .bounded("channel insert", self.store.insert_channels(channels))
            .await?;
        tracing::info!(count = ids.len(), "channels inserted");
        self.rebuild_index().await?;
        Ok(ids)
    }

    pub async fn update_channel(&self, channel: &Channel) -> Result<(), GatewayError> {
        self.bounded("channel update", self.store.update_channel(channel))
            .await?;
        tracing::info!(channel_id = channel.id, "channel updated");
        self.rebuild_index().await
    }

    pub async fn delete_channel(&self, id: i64) -> Result<(), GatewayError> {
        self.bounded("channel delete", self.store.delete_channel(id))
            .await?;
        tracing::info!(channel_id = id, "channel deleted");
        self.rebuild_index().await
    }

    /// Takes the channel out of rotation. Probes never re-enable a manually
    /// disabled channel.
    pub async fn disable_channel(&self, id: i64) -> Result<(), GatewayError> {
        self.set_channel_status(id, ChannelStatus::ManuallyDisabled)
            .await
    }

    pub async fn enable_channel(&self, id: i64) -> Result<(), GatewayError> {
        self.set_channel_status(id, ChannelStatus::Enabled).await
    }

    async fn set_channel_status(&self, id: i64, status: ChannelStatus) -> Result<(), GatewayError> {
        let changed = self
            .bounded(
                "channel status",
                self.store.update_channel_status(id, status, None),
            )
            .await?;
        if changed {
            tracing::info!(channel_id = id, ?status, "channel status changed");
            self.rebuild_index().await?;
        }
        Ok(())
    }

    pub async fn create_group(&self, group: &Group) -> Result<(), GatewayError> {
        self.bounded("group create", self.store.create_group(group))
            .await?;
        tracing::info!(group = %group.id, "group created");
        Ok(())
    }

    pub async fn update_group_qpm(&self, id: &str, qpm: u64) -> Result<(), GatewayError> {
        self.bounded("group qpm", self.store.update_group_qpm(id, qpm))
            .await?;
        self.entities.invalidate_group(id).await;
        tracing::info!(group = %id, qpm, "group qpm updated");
        Ok(())
    }

    pub async fn update_group_status(
        &self,
        id: &str,
        status: GroupStatus,
    ) -> Result<(), GatewayError> {
        self.bounded("group status", self.store.update_group_status(id, status))
            .await?;
        self.entities.invalidate_group(id).await;
        tracing::info!(group = %id, ?status, "group status updated");
        Ok(())
    }

    /// Creates a token, generating its key when none is given. Derived
    /// statuses cannot be set by callers; new tokens start enabled.
    pub async fn create_token(&self, mut token: Token) -> Result<Token, GatewayError> {
        if token.key.trim().is_empty() {
            token.key = generate_token_key();
        }
        check_token_key(&token.key)?;
        token.status = TokenStatus::Enabled;
        token.used_amount = 0.0;
        token.request_count = 0;
        token.accessed_at_ms = None;
        if token.created_at_ms == 0 {
            token.created_at_ms = self.clock.now_millis();
        }
        let token = self
            .bounded("token create", self.store.create_token(token))
            .await?;
        tracing::info!(token_id = token.id, group = %token.group_id, "token created");
        Ok(token)
    }

    /// Replaces a token's editable fields. Status and usage stay as stored;
    /// status changes go through [`Gateway::update_token_status`]. Both the
    /// old and the new key are evicted from the cache.
    pub async fn update_token(&self, token: &Token) -> Result<(), GatewayError> {
        let previous = self
            .bounded("token lookup", self.store.get_token(token.id))
            .await?;
        let mut updated = token.clone();
        if updated.key.trim().is_empty() {
            updated.key = previous.key.clone();
        }
        check_token_key(&updated.key)?;
        updated.status = previous.status;
        updated.used_amount = previous.used_amount;
        updated.request_count = previous.request_count;
        updated.accessed_at_ms = previous.accessed_at_ms;
        self.bounded("token update", self.store.update_token(&updated))
            .await?;
        self.entities.invalidate_token(&previous.key).await;
        if previous.key != updated.key {
            self.entities.invalidate_token(&updated.key).await;
        }
        tracing::info!(token_id = token.id, "token updated");
        Ok(())
    }

    pub async fn delete_token(&self, id: i64) -> Result<(), GatewayError> {
        let token = self
            .bounded("token lookup", self.store.get_token(id))
            .await?;
        self.bounded("token delete", self.store.delete_token(id))
            .await?;
        self.entities.invalidate_token(&token.key).await;
        tracing::info!(token_id = id, "token deleted");
        Ok(())
    }

    /// Only `Enabled` and `Disabled` can be set. A token that is past its
    /// expiry or over its quota cannot be re-enabled until those change.
    pub async fn update_token_status(
        &self,
        id: i64,
        status: TokenStatus,
    ) -> Result<(), GatewayError> {
        if !matches!(status, TokenStatus::Enabled | TokenStatus::Disabled) {
            return Err(GatewayError::InvalidRequest {
                reason: format!("token status {status:?} cannot be set directly"),
            });
        }
        let token = self
            .bounded("token lookup", self.store.get_token(id))
            .await?;
        if status == TokenStatus::Enabled {
            let now = self.clock.now_millis();
            if token.expired_at_ms.is_some_and(|at| at < now) {
                return Err(GatewayError::InvalidRequest {
                    reason: "token has expired; extend its expiry first".to_string(),
                });
            }
            if token.quota_exhausted() {
                return Err(GatewayError::InvalidRequest {
                    reason: "token quota is exhausted; raise its quota first".to_string(),
                });
            }
        }
        self.bounded(
            "token status",
            self.store.update_token_status(id, status, None),
        )
        .await?;
        self.entities.invalidate_token(&token.key).await;
        tracing::info!(token_id = id, ?status, "token status updated");
        Ok(())
    }

    /// Validates, applies and persists one runtime option.
    pub async fn update_option(&self, key: &str, value: &str) -> Result<(), GatewayError> {
        self.options.update(key, value)?;
        self.bounded("option save", self.store.save_option(key, value))
            .await?;
        tracing::info!(key = %key, "option updated");
        if matches!(
            key,
            OPTION_DEFAULT_CHANNEL_MODELS | OPTION_DEFAULT_CHANNEL_MODEL_MAPPING
        ) {
            self.rebuild_index().await?;
        }
        Ok(())
    }

    pub async fn query_usage_logs(
        &self,
        query: &UsageLogQuery,
    ) -> Result<Vec<UsageLogRecord>, GatewayError> {
        self.bounded("usage log query", self.store.query_usage_logs(query))
            .await
    }

    /// Runs one probe pass over every channel now.
    pub async fn probe_channels(&self) -> Result<ProbeReport, GatewayError> {
        Ok(self.prober.run_once().await?)
    }

    /// Probes one channel now and applies any resulting status change.
    pub async fn test_channel(&self, id: i64) -> Result<ChannelTest, GatewayError> {
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
        let (action, result) = self.prober.probe_channel(&channel).await;
        if action != ProbeAction::None {
            self.rebuild_index().await?;
        }
        Ok(ChannelTest {
            channel_id: id,
            action,
            result,
        })
    }

    async fn rebuild_index(&self) -> Result<(), GatewayError> {
        let channels = self.index.rebuild().await?;
        tracing::debug!(channels, "channel index rebuilt");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::gateway::cache::MemoryCacheStore;
    use crate::gateway::config::{GatewayConfig, OPTION_RETRY_TIMES};
    use crate::gateway::costing::PriceTable;
    use crate::gateway::probe::ChannelProbe;
    use crate::gateway::store::{MemoryStore, Store};
    use crate::gateway::upstream::UpstreamError;
    use crate::gateway::ManualClock;

    const IP: std::net::IpAddr = std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST);

    struct RejectingProbe;

    #[async_trait]
    impl ChannelProbe for RejectingProbe {
        async fn probe(&self, _channel: &Channel, _model: &str) -> Result<(), ProbeError> {
            Err(UpstreamError::new(401, "invalid api key").into())
        }
    }

    async fn gateway() -> (Gateway, Arc<MemoryStore>, Arc<ManualClock>) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(1_000));
        let gw = Gateway::builder(GatewayConfig::default(), store.clone())
            .cache(Arc::new(MemoryCacheStore::with_clock(clock.clone())))
            .prices(PriceTable::default().with_default_price(1.0))
            .probe(Arc::new(RejectingProbe))
            .clock(clock.clone())
            .build()
            .await
            .expect("gateway");
        (gw, store, clock)
    }

    #[test]
    fn generated_keys_are_alphanumeric() {
        let key = generate_token_key();
        assert_eq!(key.len(), TOKEN_KEY_LEN);
        assert!(key.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(key, generate_token_key());
    }

    #[tokio::test]
    async fn channel_mutations_rebuild_the_index() {
        let (gw, _, _) = gateway().await;
        let ids = gw
            .insert_channels(vec![
                Channel::new(1, "k1").with_models(["m"]),
                Channel::new(1, "k2").with_models(["m"]),
            ])
            .await
            .expect("insert");
        assert_eq!(gw.index().channels_for_model("m").len(), 2);

        gw.disable_channel(ids[0]).await.expect("disable");
        let serving: Vec<i64> = gw
            .index()
            .channels_for_model("m")
            .iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(serving, vec![ids[1]]);

        gw.enable_channel(ids[0]).await.expect("enable");
        assert_eq!(gw.index().channels_for_model("m").len(), 2);

        gw.delete_channel(ids[1]).await.expect("delete");
        assert_eq!(gw.index().channels_for_model("m").len(), 1);

        let err = gw.disable_channel(999).await.expect_err("missing");
        assert!(matches!(err, GatewayError::Store(_)));
    }

    #[tokio::test]
    async fn group_updates_evict_the_cached_group() {
        let (gw, store, _) = gateway().await;
        gw.create_group(&Group::new("g1")).await.expect("group");
        assert_eq!(gw.entities().get_group("g1").await.expect("warm").qpm, 0);

        gw.update_group_qpm("g1", 30).await.expect("qpm");
        assert_eq!(gw.entities().get_group("g1").await.expect("group").qpm, 30);

        gw.update_group_status("g1", GroupStatus::Disabled)
            .await
            .expect("status");
        let group = gw.entities().get_group("g1").await.expect("group");
        assert_eq!(group.status, GroupStatus::Disabled);
        assert_eq!(store.get_group("g1").await.expect("group").qpm, 30);
    }

    #[tokio::test]
    async fn token_lifecycle_keeps_cache_consistent() {
        let (gw, _, _) = gateway().await;
        gw.create_group(&Group::new("g1")).await.expect("group");
        let token = gw
            .create_token(Token::new("g1", "").with_name("ci"))
            .await
            .expect("token");
        assert_eq!(token.key.len(), TOKEN_KEY_LEN);
        assert_eq!(token.created_at_ms, 1_000);
        let old_key = token.key.clone();
        gw.entities().get_token(&old_key).await.expect("warm");

        let mut renamed = token.clone();
        renamed.key = "rotatedkey".to_string();
        renamed.used_amount = 123.0;
        gw.update_token(&renamed).await.expect("update");
        let err = gw.entities().get_token(&old_key).await.expect_err("old key gone");
        assert!(err.is_not_found());
        let fresh = gw.entities().get_token("rotatedkey").await.expect("new key");
        assert_eq!(fresh.used_amount, 0.0);

        gw.update_token_status(token.id, TokenStatus::Disabled)
            .await
            .expect("disable");
        let cached = gw.entities().get_token("rotatedkey").await.expect("token");
        assert_eq!(cached.status, TokenStatus::Disabled);

        gw.delete_token(token.id).await.expect("delete");
        let err = gw.entities().get_token("rotatedkey").await.expect_err("deleted");
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn derived_token_states_cannot_be_forced() {
        let (gw, _, clock) = gateway().await;
        gw.create_group(&Group::new("g1")).await.expect("group");
        let token = gw
            .create_token(Token::new("g1", "abc").with_expired_at_ms(2_000))
            .await
            .expect("token");

        let err = gw
            .update_token_status(token.id, TokenStatus::Exhausted)
            .await
            .expect_err("derived");
        assert!(matches!(err, GatewayError::InvalidRequest { .. }));

        gw.update_token_status(token.id, TokenStatus::Disabled)
            .await
            .expect("disable");
        clock.advance(Duration::from_secs(5));
        let err = gw
            .update_token_status(token.id, TokenStatus::Enabled)
            .await
            .expect_err("expired");
        assert!(matches!(err, GatewayError::InvalidRequest { .. }));

        let err = gw
            .create_token(Token::new("g1", "a-b"))
            .await
            .expect_err("dash");
        assert!(matches!(err, GatewayError::InvalidRequest { .. }));
    }

    #[tokio::test]
    async fn update_token_keeps_stored_status_and_rejects_dashed_keys() {
        let (gw, store, clock) = gateway().await;
        gw.create_group(&Group::new("g1")).await.expect("group");
        let token = gw
            .create_token(Token::new("g1", "abc").with_expired_at_ms(2_000))
            .await
            .expect("token");

        let mut forced = token.clone();
        forced.status = TokenStatus::Exhausted;
        forced.name = "renamed".to_string();
        gw.update_token(&forced).await.expect("update");
        let stored = store.get_token(token.id).await.expect("token");
        assert_eq!(stored.status, TokenStatus::Enabled);
        assert_eq!(stored.name, "renamed");

        clock.advance(Duration::from_secs(5));
        gw.authenticate("sk-abc", IP, "")
            .await
            .expect_err("expired");
        assert_eq!(
            store.get_token(token.id).await.expect("token").status,
            TokenStatus::Expired
        );
        let mut revived = stored.clone();
        revived.status = TokenStatus::Enabled;
        gw.update_token(&revived).await.expect("update");
        assert_eq!(
            store.get_token(token.id).await.expect("token").status,
            TokenStatus::Expired
        );

        let mut dashed = stored;
        dashed.key = "new-key".to_string();
        let err = gw.update_token(&dashed).await.expect_err("dash");
        assert!(matches!(err, GatewayError::InvalidRequest { .. }));
        assert_eq!(store.get_token(token.id).await.expect("token").key, "abc");
    }

    #[tokio::test]
    async fn options_are_validated_then_persisted() {
        let (gw, store, _) = gateway().await;
        gw.update_option(OPTION_RETRY_TIMES, "3").await.expect("option");
        assert_eq!(gw.options().retry_times(), 3);
        assert_eq!(
            store.load_options().await.expect("options").get(OPTION_RETRY_TIMES),
            Some(&"3".to_string())
        );

        let err = gw
            .update_option(OPTION_RETRY_TIMES, "many")
            .await
            .expect_err("invalid");
        assert!(matches!(err, GatewayError::Config(_)));
        assert_eq!(gw.options().retry_times(), 3);

        gw.insert_channels(vec![Channel::new(7, "k")])
            .await
            .expect("insert");
        assert!(gw.index().channels_for_model("m7").is_empty());
        gw.update_option(OPTION_DEFAULT_CHANNEL_MODELS, r#"{"7":["m7"]}"#)
            .await
            .expect("models");
        assert_eq!(gw.index().channels_for_model("m7").len(), 1);
    }

    #[tokio::test]
    async fn test_channel_applies_probe_verdict() {
        let (gw, store, _) = gateway().await;
        gw.options()
            .update(crate::gateway::config::OPTION_AUTOMATIC_DISABLE_CHANNEL, "true")
            .expect("option");
        let ids = gw
            .insert_channels(vec![Channel::new(1, "k").with_models(["m"])])
            .await
            .expect("insert");

        let outcome = gw.test_channel(ids[0]).await.expect("test");
        assert_eq!(outcome.action, ProbeAction::Disabled);
        assert!(outcome.result.is_err());
        assert_eq!(
            store.get_channel(ids[0]).await.expect("channel").status,
            ChannelStatus::AutoDisabled
        );
        assert!(gw.index().channels_for_model("m").is_empty());

        let err = gw.test_channel(42).await.expect_err("missing");
        assert!(matches!(err, GatewayError::ChannelInvalid { id: 42 }));

        let report = gw.probe_channels().await.expect("pass");
        assert_eq!(report.probed, 1);
        assert!(report.disabled.is_empty());
    }
}
