use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    Enabled,
    ManuallyDisabled,
    AutoDisabled,
}

impl ChannelStatus {
    pub fn code(self) -> i64 {
        match self {
            Self::Enabled => 1,
            Self::ManuallyDisabled => 2,
            Self::AutoDisabled => 3,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::Enabled),
            2 => Some(Self::ManuallyDisabled),
            3 => Some(Self::AutoDisabled),
            _ => None,
        }
    }

    pub fn is_enabled(self) -> bool {
        self == Self::Enabled
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupStatus {
    Enabled,
    Disabled,
    Deleted,
}

impl GroupStatus {
    pub fn code(self) -> i64 {
        match self {
            Self::Enabled => 1,
            Self::Disabled => 2,
            Self::Deleted => 3,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::Enabled),
            2 => Some(Self::Disabled),
            3 => Some(Self::Deleted),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenStatus {
    Enabled,
    Disabled,
    Expired,
    Exhausted,
}

impl TokenStatus {
    pub fn code(self) -> i64 {
        match self {
            Self::Enabled => 1,
            Self::Disabled => 2,
            Self::Expired => 3,
            Self::Exhausted => 4,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::Enabled),
            2 => Some(Self::Disabled),
            3 => Some(Self::Expired),
            4 => Some(Self::Exhausted),
            _ => None,
        }
    }
}

/// A provider credential serving a set of models at a priority.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub id: i64,
    #[serde(rename = "type")]
    pub channel_type: i32,
    #[serde(default)]
    pub name: String,
    pub key: String,
    pub status: ChannelStatus,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub model_mapping: BTreeMap<String, String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub config: BTreeMap<String, String>,
    #[serde(default)]
    pub used_amount: f64,
    #[serde(default)]
    pub request_count: u64,
    #[serde(default)]
    pub response_duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_at_ms: Option<u64>,
    #[serde(default)]
    pub balance: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub balance_updated_at_ms: Option<u64>,
    #[serde(default)]
    pub created_at_ms: u64,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("channel_type", &self.channel_type)
            .field("name", &self.name)
            .field("key", &"<redacted>")
            .field("status", &self.status)
            .field("base_url", &self.base_url)
            .field("models", &self.models)
            .field("model_mapping", &self.model_mapping)
            .field("priority", &self.priority)
            .field("config", &"<redacted>")
            .field("used_amount", &self.used_amount)
            .field("request_count", &self.request_count)
            .finish()
    }
}

impl Channel {
    pub fn new(channel_type: i32, key: impl Into<String>) -> Self {
        Self {
            id: 0,
            channel_type,
            name: String::new(),
            key: key.into(),
            status: ChannelStatus::Enabled,
            base_url: String::new(),
            models: Vec::new(),
            model_mapping: BTreeMap::new(),
            priority: 0,
            config: BTreeMap::new(),
            used_amount: 0.0,
            request_count: 0,
            response_duration_ms: 0,
            test_at_ms: None,
            balance: 0.0,
            balance_updated_at_ms: None,
            created_at_ms: 0,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_models<I, S>(mut self, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.models = models.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_status(mut self, status: ChannelStatus) -> Self {
        self.status = status;
        self
    }

    /// Upstream model name after applying the channel's remap table.
    pub fn mapped_model<'a>(&'a self, model: &'a str) -> &'a str {
        match self.model_mapping.get(model) {
            Some(mapped) if !mapped.is_empty() => mapped.as_str(),
            _ => model,
        }
    }
}

/// A quota-bearing tenant.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    pub status: GroupStatus,
    /// Queries per minute; zero falls back to the system default.
    #[serde(default)]
    pub qpm: u64,
    #[serde(default)]
    pub used_amount: f64,
    #[serde(default)]
    pub request_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accessed_at_ms: Option<u64>,
    #[serde(default)]
    pub created_at_ms: u64,
}

impl Group {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: GroupStatus::Enabled,
            qpm: 0,
            used_amount: 0.0,
            request_count: 0,
            accessed_at_ms: None,
            created_at_ms: 0,
        }
    }

    pub fn with_qpm(mut self, qpm: u64) -> Self {
        self.qpm = qpm;
        self
    }
}

/// A caller-presented credential scoped to one group.
///
/// The secret key is never serialized; cached copies get it restored from the
/// lookup key.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub id: i64,
    pub group_id: String,
    #[serde(default, skip_serializing)]
    pub key: String,
    #[serde(default)]
    pub name: String,
    pub status: TokenStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expired_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota: Option<f64>,
    #[serde(default)]
    pub used_amount: f64,
    #[serde(default)]
    pub request_count: u64,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accessed_at_ms: Option<u64>,
    #[serde(default)]
    pub created_at_ms: u64,
}

impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Token")
            .field("id", &self.id)
            .field("group_id", &self.group_id)
            .field("key", &"<redacted>")
            .field("name", &self.name)
            .field("status", &self.status)
            .field("expired_at_ms", &self.expired_at_ms)
            .field("quota", &self.quota)
            .field("used_amount", &self.used_amount)
            .field("request_count", &self.request_count)
            .field("models", &self.models)
            .field("subnet", &self.subnet)
            .finish()
    }
}

impl Token {
    pub fn new(group_id: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            id: 0,
            group_id: group_id.into(),
            key: key.into(),
            name: String::new(),
            status: TokenStatus::Enabled,
            expired_at_ms: None,
            quota: None,
            used_amount: 0.0,
            request_count: 0,
            models: Vec::new(),
            subnet: None,
            accessed_at_ms: None,
            created_at_ms: 0,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_quota(mut self, quota: f64) -> Self {
        self.quota = Some(quota);
        self
    }

    pub fn with_models<I, S>(mut self, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.models = models.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_subnet(mut self, subnet: impl Into<String>) -> Self {
        self.subnet = Some(subnet.into());
        self
    }

    pub fn with_expired_at_ms(mut self, expired_at_ms: u64) -> Self {
        self.expired_at_ms = Some(expired_at_ms);
        self
    }

    pub fn quota_exhausted(&self) -> bool {
        matches!(self.quota, Some(quota) if quota <= self.used_amount)
    }
}

/// One settled request; never updated after it is appended.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UsageLogRecord {
    pub id: i64,
    pub created_at_ms: u64,
    pub group_id: String,
    pub channel_id: i64,
    pub token_id: i64,
    pub token_name: String,
    pub model: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub prompt_price: f64,
    pub completion_price: f64,
    pub amount: f64,
    #[serde(default)]
    pub content: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct UsageLogQuery {
    #[serde(default)]
    pub group_id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub channel_id: Option<i64>,
    #[serde(default)]
    pub token_name: Option<String>,
    #[serde(default)]
    pub start_ms: Option<u64>,
    #[serde(default)]
    pub end_ms: Option<u64>,
    #[serde(default)]
    pub offset: usize,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl UsageLogQuery {
    pub fn matches(&self, record: &UsageLogRecord) -> bool {
        if let Some(group_id) = &self.group_id {
            if &record.group_id != group_id {
                return false;
            }
        }
        if let Some(model) = &self.model {
            if &record.model != model {
                return false;
            }
        }
        if let Some(channel_id) = self.channel_id {
            if record.channel_id != channel_id {
                return false;
            }
        }
        if let Some(token_name) = &self.token_name {
            if &record.token_name != token_name {
                return false;
            }
        }
        if let Some(start_ms) = self.start_ms {
            if record.created_at_ms < start_ms {
                return false;
            }
        }
        if let Some(end_ms) = self.end_ms {
            if record.created_at_ms > end_ms {
                return false;
            }
        }
        true
    }
}
