//! Per-request token and group validation.

use std::net::IpAddr;
use std::time::Duration;

use ipnetwork::IpNetwork;

use super::limits::SCOPE_GROUP_QPM;
use super::store_types::{Group, GroupStatus, Token, TokenStatus};
use super::{Gateway, GatewayError};

const QPM_WINDOW: Duration = Duration::from_secs(60);

/// Everything the rest of the request needs to know about the caller.
#[derive(Clone, Debug)]
pub struct AuthContext {
    pub token: Token,
    pub group: Group,
    /// Models the token may call: its own allow-list, or every model the
    /// channel index currently serves.
    pub available_models: Vec<String>,
}

/// Extracts the token key from an `Authorization` value. Accepts
/// `Bearer sk-<key>`, `sk-<key>` or a bare key; anything after the first `-`
/// of the key is a routing suffix and ignored.
pub fn parse_token_key(authorization: &str) -> Option<&str> {
    let raw = authorization.trim();
    let raw = raw
        .strip_prefix("Bearer ")
        .or_else(|| raw.strip_prefix("bearer "))
        .unwrap_or(raw)
        .trim();
    let raw = raw.strip_prefix("sk-").unwrap_or(raw);
    let key = raw.split('-').next().unwrap_or_default();
    (!key.is_empty()).then_some(key)
}

/// True when `ip` falls inside any network of the comma-separated CIDR list.
/// Entries that fail to parse never match.
pub fn ip_in_subnets(ip: IpAddr, subnets: &str) -> bool {
    subnets
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .any(|entry| match entry.parse::<IpNetwork>() {
            Ok(network) => network.contains(ip),
            Err(err) => {
                tracing::warn!(subnet = %entry, error = %err, "ignoring unparsable token subnet");
                false
            }
        })
}

impl Gateway {
    /// Resolves the caller's token and group and checks every admission rule
    /// in order: token state, expiry, quota, subnet, group state, model
    /// allow-list and the group QPM budget.
    pub async fn authenticate(
        &self,
        authorization: &str,
        client_ip: IpAddr,
        model: &str,
    ) -> Result<AuthContext, GatewayError> {
        let result = self.authenticate_inner(authorization, client_ip, model).await;
        if let Err(err) = &result {
            match err {
                GatewayError::RateLimited { .. } => {}
                err if err.is_admission() => self.observability.record_auth_rejected(),
                _ => {}
            }
        }
        result
    }

    async fn authenticate_inner(
        &self,
        authorization: &str,
        client_ip: IpAddr,
        model: &str,
    ) -> Result<AuthContext, GatewayError> {
        let key = parse_token_key(authorization).ok_or(GatewayError::MissingToken)?;
        let token = match self.entities.get_token(key).await {
            Ok(token) => token,
            Err(err) if err.is_not_found() => return Err(GatewayError::InvalidToken),
            Err(err) => return Err(err.into()),
        };
        self.validate_token(&token).await?;

        if let Some(subnet) = token.subnet.as_deref().filter(|s| !s.trim().is_empty()) {
            if !ip_in_subnets(client_ip, subnet) {
                return Err(GatewayError::SubnetForbidden {
                    subnet: subnet.to_string(),
                    ip: client_ip.to_string(),
                });
            }
        }

        let group = match self.entities.get_group(&token.group_id).await {
            Ok(group) => group,
            Err(err) if err.is_not_found() => {
                return Err(GatewayError::GroupDisabled {
                    group: token.group_id.clone(),
                });
            }
            Err(err) => return Err(err.into()),
        };
        if group.status != GroupStatus::Enabled {
            return Err(GatewayError::GroupDisabled { group: group.id });
        }

        let available_models = if token.models.is_empty() {
            self.index.all_models()
        } else {
            token.models.clone()
        };
        if !model.is_empty() && !available_models.iter().any(|m| m == model) {
            return Err(GatewayError::ModelForbidden {
                model: model.to_string(),
            });
        }

        let qpm = match group.qpm {
            0 => self.options.default_group_qpm(),
            qpm => qpm,
        };
        if !self
            .limiter
            .allow(SCOPE_GROUP_QPM, &group.id, qpm, QPM_WINDOW)
            .await?
        {
            self.observability.record_rate_limited();
            tracing::debug!(group = %group.id, qpm, "group qpm exceeded");
            return Err(GatewayError::RateLimited {
                scope: SCOPE_GROUP_QPM.to_string(),
            });
        }

        Ok(AuthContext {
            token,
            group,
            available_models,
        })
    }

    async fn validate_token(&self, token: &Token) -> Result<(), GatewayError> {
        let id = token.id;
        let name = token.name.clone();
        match token.status {
            TokenStatus::Exhausted => return Err(GatewayError::TokenExhausted { id, name }),
            TokenStatus::Expired => return Err(GatewayError::TokenExpired { id, name }),
            TokenStatus::Disabled => return Err(GatewayError::TokenDisabled { id, name }),
            TokenStatus::Enabled => {}
        }

        let now = self.clock.now_millis();
        if token.expired_at_ms.is_some_and(|at| at < now) {
            self.persist_token_status(token, TokenStatus::Expired).await;
            return Err(GatewayError::TokenExpired { id, name });
        }
        if token.quota_exhausted() {
            self.persist_token_status(token, TokenStatus::Exhausted).await;
            return Err(GatewayError::TokenExhausted { id, name });
        }
        Ok(())
    }

    /// Records a status derived during validation. Failures are logged; the
    /// request is rejected either way.
    async fn persist_token_status(&self, token: &Token, status: TokenStatus) {
        match self
            .bounded(
                "token status",
                self.store
                    .update_token_status(token.id, status, Some(TokenStatus::Enabled)),
            )
            .await
        {
            Ok(true) => tracing::info!(token_id = token.id, ?status, "token status derived"),
            Ok(false) => {
                tracing::debug!(token_id = token.id, ?status, "token status changed concurrently");
            }
            Err(err) => {
                tracing::error!(token_id = token.id, ?status, error = %err, "failed to persist token status");
            }
        }
        self.entities.invalidate_token(&token.key).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::gateway::cache::MemoryCacheStore;
    use crate::gateway::config::GatewayConfig;
    use crate::gateway::costing::PriceTable;
    use crate::gateway::store::{MemoryStore, Store};
    use crate::gateway::store_types::Channel;
    use crate::gateway::ManualClock;

    const IP: IpAddr = IpAddr::V4(std::net::Ipv4Addr::new(10, 1, 2, 3));

    async fn gateway(store: Arc<MemoryStore>, clock: Arc<ManualClock>) -> Gateway {
        store
            .insert_channels(vec![
                Channel::new(1, "sk-a").with_models(["gpt-4o", "gpt-4o-mini"]),
            ])
            .await
            .expect("channels");
        Gateway::builder(GatewayConfig::default(), store)
            .cache(Arc::new(MemoryCacheStore::with_clock(clock.clone())))
            .prices(PriceTable::default().with_default_price(1.0))
            .clock(clock)
            .build()
            .await
            .expect("gateway")
    }

    async fn seeded(token: Token) -> (Gateway, Arc<MemoryStore>, Arc<ManualClock>, Token) {
        let store = Arc::new(MemoryStore::new());
        store.create_group(&Group::new("g1")).await.expect("group");
        let token = store.create_token(token).await.expect("token");
        let clock = Arc::new(ManualClock::new(1_000_000));
        let gw = gateway(store.clone(), clock.clone()).await;
        (gw, store, clock, token)
    }

    #[test]
    fn token_key_parsing_strips_prefixes_and_suffix() {
        assert_eq!(parse_token_key("Bearer sk-abc123"), Some("abc123"));
        assert_eq!(parse_token_key("Bearer sk-abc123-7"), Some("abc123"));
        assert_eq!(parse_token_key("sk-abc"), Some("abc"));
        assert_eq!(parse_token_key("abc"), Some("abc"));
        assert_eq!(parse_token_key("Bearer "), None);
        assert_eq!(parse_token_key(""), None);
    }

    #[test]
    fn subnet_list_matches_any_entry() {
        assert!(ip_in_subnets(IP, "192.168.0.0/16, 10.1.0.0/16"));
        assert!(!ip_in_subnets(IP, "192.168.0.0/16"));
        assert!(!ip_in_subnets(IP, "not-a-cidr"));
        assert!(ip_in_subnets(IP, "garbage,10.0.0.0/8"));
    }

    #[tokio::test]
    async fn valid_token_sees_all_index_models() {
        let (gw, _, _, _) = seeded(Token::new("g1", "abc").with_name("t")).await;
        let auth = gw
            .authenticate("Bearer sk-abc", IP, "gpt-4o")
            .await
            .expect("auth");
        assert_eq!(auth.group.id, "g1");
        assert_eq!(auth.available_models, vec!["gpt-4o", "gpt-4o-mini"]);
    }

    #[tokio::test]
    async fn unknown_and_missing_keys_are_rejected() {
        let (gw, _, _, _) = seeded(Token::new("g1", "abc")).await;
        let err = gw.authenticate("Bearer sk-nope", IP, "gpt-4o").await.expect_err("unknown");
        assert!(matches!(err, GatewayError::InvalidToken));
        let err = gw.authenticate("", IP, "gpt-4o").await.expect_err("missing");
        assert!(matches!(err, GatewayError::MissingToken));
        assert_eq!(gw.observability().auth_rejected, 2);
    }

    #[tokio::test]
    async fn expiry_is_derived_and_persisted() {
        let (gw, store, clock, token) =
            seeded(Token::new("g1", "abc").with_expired_at_ms(1_500_000)).await;
        gw.authenticate("sk-abc", IP, "gpt-4o").await.expect("still valid");

        clock.advance(Duration::from_secs(600));
        let err = gw.authenticate("sk-abc", IP, "gpt-4o").await.expect_err("expired");
        assert!(matches!(err, GatewayError::TokenExpired { .. }));
        let stored = store.get_token(token.id).await.expect("token");
        assert_eq!(stored.status, TokenStatus::Expired);

        // The invalidated cache entry now reloads the persisted status.
        let err = gw.authenticate("sk-abc", IP, "gpt-4o").await.expect_err("expired");
        assert!(matches!(err, GatewayError::TokenExpired { .. }));
    }

    #[tokio::test]
    async fn exhausted_quota_marks_the_token() {
        let mut token = Token::new("g1", "abc").with_name("t").with_quota(10.0);
        token.used_amount = 10.0;
        let (gw, store, _, token) = seeded(token).await;
        let err = gw.authenticate("sk-abc", IP, "gpt-4o").await.expect_err("exhausted");
        match err {
            GatewayError::TokenExhausted { id, name } => {
                assert_eq!(id, token.id);
                assert_eq!(name, "t");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        let stored = store.get_token(token.id).await.expect("token");
        assert_eq!(stored.status, TokenStatus::Exhausted);
    }

    #[tokio::test]
    async fn disabled_token_and_group_are_rejected() {
        let (gw, store, _, token) = seeded(Token::new("g1", "abc")).await;
        store
            .update_token_status(token.id, TokenStatus::Disabled, None)
            .await
            .expect("status");
        gw.entities().invalidate_token("abc").await;
        let err = gw.authenticate("sk-abc", IP, "gpt-4o").await.expect_err("disabled");
        assert!(matches!(err, GatewayError::TokenDisabled { .. }));

        store
            .update_token_status(token.id, TokenStatus::Enabled, None)
            .await
            .expect("status");
        gw.entities().invalidate_token("abc").await;
        store
            .update_group_status("g1", GroupStatus::Disabled)
            .await
            .expect("group");
        let err = gw.authenticate("sk-abc", IP, "gpt-4o").await.expect_err("group");
        assert!(matches!(err, GatewayError::GroupDisabled { .. }));
    }

    #[tokio::test]
    async fn subnet_restriction_applies_after_token_checks() {
        let (gw, _, _, _) = seeded(Token::new("g1", "abc").with_subnet("192.168.0.0/24")).await;
        let err = gw.authenticate("sk-abc", IP, "gpt-4o").await.expect_err("subnet");
        match err {
            GatewayError::SubnetForbidden { subnet, ip } => {
                assert_eq!(subnet, "192.168.0.0/24");
                assert_eq!(ip, "10.1.2.3");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        let inside: IpAddr = "192.168.0.9".parse().expect("ip");
        gw.authenticate("sk-abc", inside, "gpt-4o").await.expect("inside");
    }

    #[tokio::test]
    async fn token_model_allow_list_is_enforced() {
        let (gw, _, _, _) = seeded(Token::new("g1", "abc").with_models(["gpt-4o-mini"])).await;
        let err = gw.authenticate("sk-abc", IP, "gpt-4o").await.expect_err("model");
        assert!(matches!(err, GatewayError::ModelForbidden { .. }));
        gw.authenticate("sk-abc", IP, "gpt-4o-mini").await.expect("allowed");

        let err = gw
            .authenticate("sk-abc", IP, "not-served")
            .await
            .expect_err("unknown model");
        assert!(matches!(err, GatewayError::ModelForbidden { .. }));
    }

    #[tokio::test]
    async fn group_qpm_falls_back_to_default_option() {
        let (gw, store, clock, _) = seeded(Token::new("g1", "abc")).await;
        gw.options()
            .update(crate::gateway::config::OPTION_DEFAULT_GROUP_QPM, "2")
            .expect("option");
        assert_eq!(store.get_group("g1").await.expect("group").qpm, 0);

        gw.authenticate("sk-abc", IP, "gpt-4o").await.expect("first");
        gw.authenticate("sk-abc", IP, "gpt-4o").await.expect("second");
        let err = gw.authenticate("sk-abc", IP, "gpt-4o").await.expect_err("third");
        assert!(matches!(err, GatewayError::RateLimited { .. }));
        assert_eq!(gw.observability().rate_limited, 1);
        assert_eq!(gw.observability().auth_rejected, 0);

        clock.advance(Duration::from_secs(60));
        gw.authenticate("sk-abc", IP, "gpt-4o").await.expect("after window");
    }
}
