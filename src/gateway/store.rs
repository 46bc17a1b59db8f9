//! Authoritative persistence for channels, groups, tokens, usage logs and
//! options.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use thiserror::Error;

use super::store_types::{
    Channel, ChannelStatus, Group, GroupStatus, Token, TokenStatus, UsageLogQuery, UsageLogRecord,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    #[error("{entity} already exists: {id}")]
    Conflict { entity: &'static str, id: String },
    #[error("invalid record: {0}")]
    Invalid(String),
    #[error("store call timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("store join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[cfg(feature = "store-sqlite")]
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Bounds one store call.
pub(crate) async fn with_store_deadline<T>(
    after: std::time::Duration,
    fut: impl std::future::Future<Output = Result<T, StoreError>>,
) -> Result<T, StoreError> {
    tokio::time::timeout(after, fut)
        .await
        .map_err(|_| StoreError::Timeout(after))?
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn get_channel(&self, id: i64) -> Result<Channel, StoreError>;
    async fn list_channels(&self) -> Result<Vec<Channel>, StoreError>;
    async fn list_enabled_channels(&self) -> Result<Vec<Channel>, StoreError>;
    /// Inserts every channel in one batch and returns the assigned ids in order.
    async fn insert_channels(&self, channels: Vec<Channel>) -> Result<Vec<i64>, StoreError>;
    async fn update_channel(&self, channel: &Channel) -> Result<(), StoreError>;
    async fn delete_channel(&self, id: i64) -> Result<(), StoreError>;
    /// Sets the status. With `expected`, only a channel currently in that
    /// status is changed. Returns whether a row changed.
    async fn update_channel_status(
        &self,
        id: i64,
        status: ChannelStatus,
        expected: Option<ChannelStatus>,
    ) -> Result<bool, StoreError>;
    async fn increment_channel_usage(
        &self,
        id: i64,
        amount: f64,
        requests: u64,
    ) -> Result<(), StoreError>;
    async fn record_channel_probe(
        &self,
        id: i64,
        response_duration_ms: u64,
        test_at_ms: u64,
    ) -> Result<(), StoreError>;

    async fn create_group(&self, group: &Group) -> Result<(), StoreError>;
    async fn get_group(&self, id: &str) -> Result<Group, StoreError>;
    async fn list_groups(&self) -> Result<Vec<Group>, StoreError>;
    async fn update_group_qpm(&self, id: &str, qpm: u64) -> Result<(), StoreError>;
    async fn update_group_status(&self, id: &str, status: GroupStatus) -> Result<(), StoreError>;
    async fn increment_group_usage(
        &self,
        id: &str,
        amount: f64,
        requests: u64,
        at_ms: u64,
    ) -> Result<(), StoreError>;

    /// Inserts the token and returns it with its assigned id.
    async fn create_token(&self, token: Token) -> Result<Token, StoreError>;
    async fn get_token(&self, id: i64) -> Result<Token, StoreError>;
    async fn get_token_by_key(&self, key: &str) -> Result<Token, StoreError>;
    async fn list_tokens(&self, group_id: &str) -> Result<Vec<Token>, StoreError>;
    async fn update_token(&self, token: &Token) -> Result<(), StoreError>;
    async fn delete_token(&self, id: i64) -> Result<(), StoreError>;
    /// Sets the status when the current one matches `expected` (or always
    /// when `None`). Returns whether the stored status changed.
    async fn update_token_status(
        &self,
        id: i64,
        status: TokenStatus,
        expected: Option<TokenStatus>,
    ) -> Result<bool, StoreError>;
    async fn increment_token_usage(
        &self,
        id: i64,
        amount: f64,
        requests: u64,
        at_ms: u64,
    ) -> Result<(), StoreError>;

    async fn append_usage_log(&self, record: UsageLogRecord) -> Result<i64, StoreError>;
    /// Newest first, filtered and paginated by `query`.
    async fn query_usage_logs(
        &self,
        query: &UsageLogQuery,
    ) -> Result<Vec<UsageLogRecord>, StoreError>;

    async fn load_options(&self) -> Result<BTreeMap<String, String>, StoreError>;
    async fn save_option(&self, key: &str, value: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    channels: BTreeMap<i64, Channel>,
    groups: BTreeMap<String, Group>,
    tokens: BTreeMap<i64, Token>,
    usage_logs: Vec<UsageLogRecord>,
    options: BTreeMap<String, String>,
    next_channel_id: i64,
    next_token_id: i64,
    next_log_id: i64,
}

/// Process-local store, used by tests and single-node embedding.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_channel(&self, id: i64) -> Result<Channel, StoreError> {
        self.lock()
            .channels
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("channel", id))
    }

    async fn list_channels(&self) -> Result<Vec<Channel>, StoreError> {
        Ok(self.lock().channels.values().cloned().collect())
    }

    async fn list_enabled_channels(&self) -> Result<Vec<Channel>, StoreError> {
        Ok(self
            .lock()
            .channels
            .values()
            .filter(|channel| channel.status.is_enabled())
            .cloned()
            .collect())
    }

    async fn insert_channels(&self, channels: Vec<Channel>) -> Result<Vec<i64>, StoreError> {
        let mut state = self.lock();
        let mut ids = Vec::with_capacity(channels.len());
        for mut channel in channels {
            state.next_channel_id += 1;
            channel.id = state.next_channel_id;
            ids.push(channel.id);
            state.channels.insert(channel.id, channel);
        }
        Ok(ids)
    }

    async fn update_channel(&self, channel: &Channel) -> Result<(), StoreError> {
        let mut state = self.lock();
        let slot = state
            .channels
            .get_mut(&channel.id)
            .ok_or_else(|| StoreError::not_found("channel", channel.id))?;
        *slot = channel.clone();
        Ok(())
    }

    async fn delete_channel(&self, id: i64) -> Result<(), StoreError> {
        self.lock()
            .channels
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found("channel", id))
    }

    async fn update_channel_status(
        &self,
        id: i64,
        status: ChannelStatus,
        expected: Option<ChannelStatus>,
    ) -> Result<bool, StoreError> {
        let mut state = self.lock();
        let channel = state
            .channels
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("channel", id))?;
        if expected.is_some_and(|expected| channel.status != expected) {
            return Ok(false);
        }
        let changed = channel.status != status;
        channel.status = status;
        Ok(changed)
    }

    async fn increment_channel_usage(
        &self,
        id: i64,
        amount: f64,
        requests: u64,
    ) -> Result<(), StoreError> {
        let mut state = self.lock();
        let channel = state
            .channels
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("channel", id))?;
        channel.used_amount += amount;
        channel.request_count = channel.request_count.saturating_add(requests);
        Ok(())
    }

    async fn record_channel_probe(
        &self,
        id: i64,
        response_duration_ms: u64,
        test_at_ms: u64,
    ) -> Result<(), StoreError> {
        let mut state = self.lock();
        let channel = state
            .channels
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("channel", id))?;
        channel.response_duration_ms = response_duration_ms;
        channel.test_at_ms = Some(test_at_ms);
        Ok(())
    }

    async fn create_group(&self, group: &Group) -> Result<(), StoreError> {
        let mut state = self.lock();
        if state.groups.contains_key(&group.id) {
            return Err(StoreError::Conflict {
                entity: "group",
                id: group.id.clone(),
            });
        }
        state.groups.insert(group.id.clone(), group.clone());
        Ok(())
    }

    async fn get_group(&self, id: &str) -> Result<Group, StoreError> {
        self.lock()
            .groups
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("group", id))
    }

    async fn list_groups(&self) -> Result<Vec<Group>, StoreError> {
        Ok(self.lock().groups.values().cloned().collect())
    }

    async fn update_group_qpm(&self, id: &str, qpm: u64) -> Result<(), StoreError> {
        let mut state = self.lock();
        let group = state
            .groups
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found("group", id))?;
        group.qpm = qpm;
        Ok(())
    }

    async fn update_group_status(&self, id: &str, status: GroupStatus) -> Result<(), StoreError> {
        let mut state = self.lock();
        let group = state
            .groups
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found("group", id))?;
        group.status = status;
        Ok(())
    }

    async fn increment_group_usage(
        &self,
        id: &str,
        amount: f64,
        requests: u64,
        at_ms: u64,
    ) -> Result<(), StoreError> {
        let mut state = self.lock();
        let group = state
            .groups
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found("group", id))?;
        group.used_amount += amount;
        group.request_count = group.request_count.saturating_add(requests);
        group.accessed_at_ms = Some(at_ms);
        Ok(())
    }

    async fn create_token(&self, mut token: Token) -> Result<Token, StoreError> {
        let mut state = self.lock();
        if state.tokens.values().any(|existing| existing.key == token.key) {
            return Err(StoreError::Conflict {
                entity: "token",
                id: token.name.clone(),
            });
        }
        if !state.groups.contains_key(&token.group_id) {
            return Err(StoreError::not_found("group", &token.group_id));
        }
        state.next_token_id += 1;
        token.id = state.next_token_id;
        state.tokens.insert(token.id, token.clone());
        Ok(token)
    }

    async fn get_token(&self, id: i64) -> Result<Token, StoreError> {
        self.lock()
            .tokens
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("token", id))
    }

    async fn get_token_by_key(&self, key: &str) -> Result<Token, StoreError> {
        self.lock()
            .tokens
            .values()
            .find(|token| token.key == key)
            .cloned()
            .ok_or_else(|| StoreError::not_found("token", "<redacted>"))
    }

    async fn list_tokens(&self, group_id: &str) -> Result<Vec<Token>, StoreError> {
        Ok(self
            .lock()
            .tokens
            .values()
            .filter(|token| token.group_id == group_id)
            .cloned()
            .collect())
    }

    async fn update_token(&self, token: &Token) -> Result<(), StoreError> {
        let mut state = self.lock();
        if state
            .tokens
            .values()
            .any(|existing| existing.id != token.id && existing.key == token.key)
        {
            return Err(StoreError::Conflict {
                entity: "token",
                id: token.name.clone(),
            });
        }
        let slot = state
            .tokens
            .get_mut(&token.id)
            .ok_or_else(|| StoreError::not_found("token", token.id))?;
        *slot = token.clone();
        Ok(())
    }

    async fn delete_token(&self, id: i64) -> Result<(), StoreError> {
        self.lock()
            .tokens
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found("token", id))
    }

    async fn update_token_status(
        &self,
        id: i64,
        status: TokenStatus,
        expected: Option<TokenStatus>,
    ) -> Result<bool, StoreError> {
        let mut state = self.lock();
        let token = state
            .tokens
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("token", id))?;
        if expected.is_some_and(|expected| token.status != expected) {
            return Ok(false);
        }
        let changed = token.status != status;
        token.status = status;
        Ok(changed)
    }

    async fn increment_token_usage(
        &self,
        id: i64,
        amount: f64,
        requests: u64,
        at_ms: u64,
    ) -> Result<(), StoreError> {
        let mut state = self.lock();
        let token = state
            .tokens
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("token", id))?;
        token.used_amount += amount;
        token.request_count = token.request_count.saturating_add(requests);
        token.accessed_at_ms = Some(at_ms);
        Ok(())
    }

    async fn append_usage_log(&self, mut record: UsageLogRecord) -> Result<i64, StoreError> {
        let mut state = self.lock();
        state.next_log_id += 1;
        record.id = state.next_log_id;
        state.usage_logs.push(record);
        Ok(state.next_log_id)
    }

    async fn query_usage_logs(
        &self,
        query: &UsageLogQuery,
    ) -> Result<Vec<UsageLogRecord>, StoreError> {
        let state = self.lock();
        let mut matched: Vec<UsageLogRecord> = state
            .usage_logs
            .iter()
            .filter(|record| query.matches(record))
            .cloned()
            .collect();
        matched.sort_by(|a, b| {
            b.created_at_ms
                .cmp(&a.created_at_ms)
                .then_with(|| b.id.cmp(&a.id))
        });
        let limit = query.limit.unwrap_or(usize::MAX);
        Ok(matched.into_iter().skip(query.offset).take(limit).collect())
    }

    async fn load_options(&self) -> Result<BTreeMap<String, String>, StoreError> {
        Ok(self.lock().options.clone())
    }

    async fn save_option(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.lock()
            .options
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}
