//! Two-phase spend accounting: a pre-check before the upstream call and a
//! settlement once real usage is known.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::balance::BalanceOracle;
use super::costing::UnitPrice;
use super::entity_cache::EntityCache;
use super::store::Store;
use super::store_types::{Token, TokenStatus, UsageLogRecord};
use super::{Clock, GatewayError, with_deadline};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl Usage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
        }
    }

    pub fn total_tokens(&self) -> u64 {
        u64::from(self.prompt_tokens) + u64::from(self.completion_tokens)
    }
}

/// Outcome of a successful pre-authorization.
#[derive(Clone, Debug, PartialEq)]
pub struct Reservation {
    pub group_id: String,
    pub estimate: f64,
    /// Amount already deducted from the group balance; zero unless the
    /// ledger runs in pre-consume mode.
    pub reserved: f64,
}

#[derive(Clone, Debug)]
pub struct Settlement {
    pub token: Token,
    pub channel_id: i64,
    pub model: String,
    pub usage: Usage,
    pub price: UnitPrice,
    pub reserved: f64,
    pub content: String,
}

pub struct QuotaLedger {
    store: Arc<dyn Store>,
    entities: EntityCache,
    oracle: Arc<dyn BalanceOracle>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
    pre_consume: bool,
}

impl std::fmt::Debug for QuotaLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaLedger")
            .field("timeout", &self.timeout)
            .field("pre_consume", &self.pre_consume)
            .finish_non_exhaustive()
    }
}

impl QuotaLedger {
    pub fn new(
        store: Arc<dyn Store>,
        entities: EntityCache,
        oracle: Arc<dyn BalanceOracle>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            entities,
            oracle,
            clock,
            timeout: DEFAULT_TIMEOUT,
            pre_consume: false,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_pre_consume(mut self, pre_consume: bool) -> Self {
        self.pre_consume = pre_consume;
        self
    }

    pub fn pre_consume(&self) -> bool {
        self.pre_consume
    }

    /// Rejects the call when the token ceiling or the group balance cannot
    /// cover `estimate`. Nothing is spent on rejection.
    pub async fn pre_authorize(
        &self,
        token: &Token,
        estimate: f64,
    ) -> Result<Reservation, GatewayError> {
        let estimate = if estimate.is_finite() {
            estimate.max(0.0)
        } else {
            0.0
        };
        if let Some(quota) = token.quota {
            if token.used_amount + estimate > quota {
                return Err(GatewayError::TokenQuotaInsufficient {
                    id: token.id,
                    remaining: (quota - token.used_amount).max(0.0),
                    required: estimate,
                });
            }
        }

        let group = token.group_id.as_str();
        let (remaining, reserved) = if self.pre_consume {
            let remaining = with_deadline(
                "balance reservation",
                self.timeout,
                self.oracle.reserve(group, estimate),
            )
            .await?;
            (remaining, estimate)
        } else {
            let remaining = with_deadline(
                "balance lookup",
                self.timeout,
                self.oracle.remaining_balance(group),
            )
            .await?;
            (remaining, 0.0)
        };
        if remaining < estimate {
            return Err(GatewayError::BalanceInsufficient {
                group: group.to_string(),
                remaining,
                required: estimate,
            });
        }

        Ok(Reservation {
            group_id: group.to_string(),
            estimate,
            reserved,
        })
    }

    /// Books the actual spend and releases whatever part of the reservation
    /// was not used. Errors are logged; the return value is the amount
    /// charged.
    pub async fn settle(&self, settlement: Settlement) -> f64 {
        let Settlement {
            token,
            channel_id,
            model,
            usage,
            price,
            reserved,
            content,
        } = settlement;
        let group_id = token.group_id.clone();
        let amount = price.amount(usage.prompt_tokens, usage.completion_tokens);

        let delta = amount - reserved;
        if delta != 0.0 {
            if let Err(err) = with_deadline(
                "balance post-consume",
                self.timeout,
                self.oracle.post_consume(&group_id, delta),
            )
            .await
            {
                tracing::error!(group = %group_id, delta, error = %err, "failed to post consumed amount");
            }
        }
        if usage.total_tokens() == 0 {
            if reserved != 0.0 {
                tracing::debug!(group = %group_id, reserved, "reservation released");
            }
            return 0.0;
        }

        let now = self.clock.now_millis();
        let record = UsageLogRecord {
            id: 0,
            created_at_ms: now,
            group_id: group_id.clone(),
            channel_id,
            token_id: token.id,
            token_name: token.name.clone(),
            model: model.clone(),
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            prompt_price: price.price,
            completion_price: price.completion_price(),
            amount,
            content,
        };

        let (group_res, token_res, channel_res, log_res) = futures_util::future::join4(
            with_deadline(
                "group usage",
                self.timeout,
                self.store.increment_group_usage(&group_id, amount, 1, now),
            ),
            with_deadline(
                "token usage",
                self.timeout,
                self.store.increment_token_usage(token.id, amount, 1, now),
            ),
            with_deadline(
                "channel usage",
                self.timeout,
                self.store.increment_channel_usage(channel_id, amount, 1),
            ),
            with_deadline("usage log", self.timeout, self.store.append_usage_log(record)),
        )
        .await;
        if let Err(err) = group_res {
            tracing::error!(group = %group_id, amount, error = %err, "failed to update group usage");
        }
        if let Err(err) = token_res {
            tracing::error!(token_id = token.id, amount, error = %err, "failed to update token usage");
        }
        if let Err(err) = channel_res {
            tracing::error!(channel_id, amount, error = %err, "failed to update channel usage");
        }
        if let Err(err) = log_res {
            tracing::error!(group = %group_id, model = %model, error = %err, "failed to append usage log");
        }

        self.refresh_token(&token).await;
        tracing::debug!(
            group = %group_id,
            token_id = token.id,
            channel_id,
            model = %model,
            amount,
            "settled"
        );
        amount
    }

    /// Settles on the runtime so the caller can return right away.
    pub fn settle_in_background(
        self: &Arc<Self>,
        settlement: Settlement,
    ) -> tokio::task::JoinHandle<f64> {
        let ledger = self.clone();
        tokio::spawn(async move { ledger.settle(settlement).await })
    }

    /// Arms a guard that refunds `release.reserved` if it is dropped before
    /// [`ReservationGuard::disarm`]. A guard with nothing reserved is inert.
    pub fn guard(self: &Arc<Self>, release: Settlement) -> ReservationGuard {
        let release = (release.reserved != 0.0).then(|| Settlement {
            usage: Usage::default(),
            ..release
        });
        ReservationGuard {
            ledger: self.clone(),
            release,
        }
    }

    /// Re-reads the token so the cache reflects the new usage, marking it
    /// exhausted once it crosses its ceiling.
    async fn refresh_token(&self, token: &Token) {
        let mut fresh = match with_deadline(
            "token reload",
            self.timeout,
            self.store.get_token(token.id),
        )
        .await
        {
            Ok(fresh) => fresh,
            Err(err) => {
                tracing::warn!(token_id = token.id, error = %err, "failed to reload token after settlement");
                self.entities.invalidate_token(&token.key).await;
                return;
            }
        };

        if fresh.status == TokenStatus::Enabled && fresh.quota_exhausted() {
            match with_deadline(
                "token status",
                self.timeout,
                self.store.update_token_status(
                    fresh.id,
                    TokenStatus::Exhausted,
                    Some(TokenStatus::Enabled),
                ),
            )
            .await
            {
                Ok(true) => {
                    tracing::info!(token_id = fresh.id, "token quota exhausted");
                    fresh.status = TokenStatus::Exhausted;
                }
                Ok(false) => {
                    tracing::debug!(token_id = fresh.id, "token status changed during settlement");
                    self.entities.invalidate_token(&token.key).await;
                    return;
                }
                Err(err) => {
                    tracing::error!(token_id = fresh.id, error = %err, "failed to mark token exhausted");
                    self.entities.invalidate_token(&token.key).await;
                    return;
                }
            }
        }
        if fresh.key.is_empty() {
            fresh.key = token.key.clone();
        }
        self.entities.refresh_token(&fresh).await;
    }
}

/// Releases a pre-consumed reservation when the request that took it goes
/// away without settling.
#[derive(Debug)]
pub struct ReservationGuard {
    ledger: Arc<QuotaLedger>,
    release: Option<Settlement>,
}

impl ReservationGuard {
    pub fn disarm(&mut self) {
        self.release = None;
    }
}

impl Drop for ReservationGuard {
    fn drop(&mut self) {
        let Some(release) = self.release.take() else {
            return;
        };
        let group = release.token.group_id.clone();
        let reserved = release.reserved;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::warn!(group = %group, reserved, "request dropped before settlement; releasing reservation");
                let ledger = self.ledger.clone();
                handle.spawn(async move {
                    ledger.settle(release).await;
                });
            }
            Err(_) => {
                tracing::error!(group = %group, reserved, "no runtime to release reservation");
            }
        }
    }
}
