use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::OptionalExtension;
use rusqlite::types::Value;

use super::store::{Store, StoreError};
use super::store_types::{
    Channel, ChannelStatus, Group, GroupStatus, Token, TokenStatus, UsageLogQuery, UsageLogRecord,
};

#[derive(Clone, Debug)]
pub struct SqliteStore {
    path: PathBuf,
}

impl SqliteStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        self.with_connection(|_| Ok(())).await
    }

    /// Runs `f` on a fresh connection inside the blocking pool.
    async fn with_connection<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut rusqlite::Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<T, StoreError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            f(&mut conn)
        })
        .await?
    }
}

const CHANNEL_COLUMNS: &str = "id, type, name, key, status, base_url, models_json, model_mapping_json,
    priority, config_json, used_amount, request_count, response_duration_ms, test_at_ms, balance,
    balance_updated_at_ms, created_at_ms";

const GROUP_COLUMNS: &str =
    "id, status, qpm, used_amount, request_count, accessed_at_ms, created_at_ms";

const TOKEN_COLUMNS: &str = "id, group_id, key, name, status, expired_at_ms, quota, used_amount,
    request_count, models_json, subnet, accessed_at_ms, created_at_ms";

const USAGE_LOG_COLUMNS: &str = "id, created_at_ms, group_id, channel_id, token_id, token_name,
    model, prompt_tokens, completion_tokens, prompt_price, completion_price, amount, content";

struct ChannelRow {
    id: i64,
    channel_type: i64,
    name: String,
    key: String,
    status: i64,
    base_url: String,
    models_json: String,
    model_mapping_json: String,
    priority: i64,
    config_json: String,
    used_amount: f64,
    request_count: i64,
    response_duration_ms: i64,
    test_at_ms: Option<i64>,
    balance: f64,
    balance_updated_at_ms: Option<i64>,
    created_at_ms: i64,
}

fn read_channel_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChannelRow> {
    Ok(ChannelRow {
        id: row.get(0)?,
        channel_type: row.get(1)?,
        name: row.get(2)?,
        key: row.get(3)?,
        status: row.get(4)?,
        base_url: row.get(5)?,
        models_json: row.get(6)?,
        model_mapping_json: row.get(7)?,
        priority: row.get(8)?,
        config_json: row.get(9)?,
        used_amount: row.get(10)?,
        request_count: row.get(11)?,
        response_duration_ms: row.get(12)?,
        test_at_ms: row.get(13)?,
        balance: row.get(14)?,
        balance_updated_at_ms: row.get(15)?,
        created_at_ms: row.get(16)?,
    })
}

impl ChannelRow {
    fn into_channel(self) -> Result<Channel, StoreError> {
        let status = ChannelStatus::from_code(self.status).ok_or_else(|| {
            StoreError::Invalid(format!(
                "channel {} has unknown status {}",
                self.id, self.status
            ))
        })?;
        Ok(Channel {
            id: self.id,
            channel_type: i32::try_from(self.channel_type).unwrap_or_default(),
            name: self.name,
            key: self.key,
            status,
            base_url: self.base_url,
            models: serde_json::from_str(&self.models_json)?,
            model_mapping: serde_json::from_str(&self.model_mapping_json)?,
            priority: i32::try_from(self.priority).unwrap_or_default(),
            config: serde_json::from_str(&self.config_json)?,
            used_amount: self.used_amount,
            request_count: i64_to_u64(self.request_count),
            response_duration_ms: i64_to_u64(self.response_duration_ms),
            test_at_ms: self.test_at_ms.map(i64_to_u64),
            balance: self.balance,
            balance_updated_at_ms: self.balance_updated_at_ms.map(i64_to_u64),
            created_at_ms: i64_to_u64(self.created_at_ms),
        })
    }
}

fn read_group(row: &rusqlite::Row<'_>) -> rusqlite::Result<(Group, i64)> {
    let status: i64 = row.get(1)?;
    Ok((
        Group {
            id: row.get(0)?,
            status: GroupStatus::from_code(status).unwrap_or(GroupStatus::Disabled),
            qpm: i64_to_u64(row.get(2)?),
            used_amount: row.get(3)?,
            request_count: i64_to_u64(row.get(4)?),
            accessed_at_ms: row.get::<_, Option<i64>>(5)?.map(i64_to_u64),
            created_at_ms: i64_to_u64(row.get(6)?),
        },
        status,
    ))
}

struct TokenRow {
    token: Token,
    status: i64,
    models_json: String,
}

fn read_token_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TokenRow> {
    let status: i64 = row.get(4)?;
    Ok(TokenRow {
        token: Token {
            id: row.get(0)?,
            group_id: row.get(1)?,
            key: row.get(2)?,
            name: row.get(3)?,
            status: TokenStatus::Disabled,
            expired_at_ms: row.get::<_, Option<i64>>(5)?.map(i64_to_u64),
            quota: row.get(6)?,
            used_amount: row.get(7)?,
            request_count: i64_to_u64(row.get(8)?),
            models: Vec::new(),
            subnet: row.get(10)?,
            accessed_at_ms: row.get::<_, Option<i64>>(11)?.map(i64_to_u64),
            created_at_ms: i64_to_u64(row.get(12)?),
        },
        status,
        models_json: row.get(9)?,
    })
}

impl TokenRow {
    fn into_token(self) -> Result<Token, StoreError> {
        let mut token = self.token;
        token.status = TokenStatus::from_code(self.status).ok_or_else(|| {
            StoreError::Invalid(format!(
                "token {} has unknown status {}",
                token.id, self.status
            ))
        })?;
        token.models = serde_json::from_str(&self.models_json)?;
        Ok(token)
    }
}

fn read_usage_log(row: &rusqlite::Row<'_>) -> rusqlite::Result<UsageLogRecord> {
    Ok(UsageLogRecord {
        id: row.get(0)?,
        created_at_ms: i64_to_u64(row.get(1)?),
        group_id: row.get(2)?,
        channel_id: row.get(3)?,
        token_id: row.get(4)?,
        token_name: row.get(5)?,
        model: row.get(6)?,
        prompt_tokens: i64_to_u32(row.get(7)?),
        completion_tokens: i64_to_u32(row.get(8)?),
        prompt_price: row.get(9)?,
        completion_price: row.get(10)?,
        amount: row.get(11)?,
        content: row.get(12)?,
    })
}

fn select_channels(
    conn: &rusqlite::Connection,
    filter: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<Channel>, StoreError> {
    let sql = format!("SELECT {CHANNEL_COLUMNS} FROM channels {filter} ORDER BY id");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params, read_channel_row)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?.into_channel()?);
    }
    Ok(out)
}

fn select_token(
    conn: &rusqlite::Connection,
    filter: &str,
    param: &dyn rusqlite::ToSql,
) -> Result<Option<Token>, StoreError> {
    let sql = format!("SELECT {TOKEN_COLUMNS} FROM tokens {filter}");
    let row = conn
        .query_row(&sql, [param], read_token_row)
        .optional()?;
    row.map(TokenRow::into_token).transpose()
}

fn channel_exists(conn: &rusqlite::Connection, id: i64) -> Result<bool, StoreError> {
    let found: Option<i64> = conn
        .query_row("SELECT id FROM channels WHERE id = ?1", [id], |row| {
            row.get(0)
        })
        .optional()?;
    Ok(found.is_some())
}

fn token_exists(conn: &rusqlite::Connection, id: i64) -> Result<bool, StoreError> {
    let found: Option<i64> = conn
        .query_row("SELECT id FROM tokens WHERE id = ?1", [id], |row| row.get(0))
        .optional()?;
    Ok(found.is_some())
}

fn group_exists(conn: &rusqlite::Connection, id: &str) -> Result<bool, StoreError> {
    let found: Option<String> = conn
        .query_row("SELECT id FROM groups WHERE id = ?1", [id], |row| row.get(0))
        .optional()?;
    Ok(found.is_some())
}

fn expect_changed(
    changed: usize,
    entity: &'static str,
    id: impl ToString,
) -> Result<(), StoreError> {
    if changed == 0 {
        return Err(StoreError::not_found(entity, id));
    }
    Ok(())
}

fn map_conflict(err: rusqlite::Error, entity: &'static str, id: String) -> StoreError {
    match &err {
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            StoreError::Conflict { entity, id }
        }
        _ => StoreError::Sqlite(err),
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn get_channel(&self, id: i64) -> Result<Channel, StoreError> {
        self.with_connection(move |conn| {
            select_channels(conn, "WHERE id = ?1", rusqlite::params![id])?
                .into_iter()
                .next()
                .ok_or_else(|| StoreError::not_found("channel", id))
        })
        .await
    }

    async fn list_channels(&self) -> Result<Vec<Channel>, StoreError> {
        self.with_connection(|conn| select_channels(conn, "", rusqlite::params![]))
            .await
    }

    async fn list_enabled_channels(&self) -> Result<Vec<Channel>, StoreError> {
        let enabled = ChannelStatus::Enabled.code();
        self.with_connection(move |conn| select_channels(conn, "WHERE status = ?1", rusqlite::params![enabled]))
            .await
    }

    async fn insert_channels(&self, channels: Vec<Channel>) -> Result<Vec<i64>, StoreError> {
        self.with_connection(move |conn| {
            let tx = conn.transaction()?;
            let mut ids = Vec::with_capacity(channels.len());
            for channel in &channels {
                tx.execute(
                    "INSERT INTO channels (type, name, key, status, base_url, models_json,
                        model_mapping_json, priority, config_json, used_amount, request_count,
                        response_duration_ms, test_at_ms, balance, balance_updated_at_ms,
                        created_at_ms)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                    rusqlite::params![
                        i64::from(channel.channel_type),
                        channel.name,
                        channel.key,
                        channel.status.code(),
                        channel.base_url,
                        serde_json::to_string(&channel.models)?,
                        serde_json::to_string(&channel.model_mapping)?,
                        i64::from(channel.priority),
                        serde_json::to_string(&channel.config)?,
                        channel.used_amount,
                        u64_to_i64(channel.request_count),
                        u64_to_i64(channel.response_duration_ms),
                        channel.test_at_ms.map(u64_to_i64),
                        channel.balance,
                        channel.balance_updated_at_ms.map(u64_to_i64),
                        u64_to_i64(channel.created_at_ms),
                    ],
                )?;
                ids.push(tx.last_insert_rowid());
            }
            tx.commit()?;
            Ok(ids)
        })
        .await
    }

    async fn update_channel(&self, channel: &Channel) -> Result<(), StoreError> {
        let channel = channel.clone();
        self.with_connection(move |conn| {
            let changed = conn.execute(
                "UPDATE channels SET type = ?1, name = ?2, key = ?3, status = ?4, base_url = ?5,
                    models_json = ?6, model_mapping_json = ?7, priority = ?8, config_json = ?9,
                    balance = ?10, balance_updated_at_ms = ?11
                 WHERE id = ?12",
                rusqlite::params![
                    i64::from(channel.channel_type),
                    channel.name,
                    channel.key,
                    channel.status.code(),
                    channel.base_url,
                    serde_json::to_string(&channel.models)?,
                    serde_json::to_string(&channel.model_mapping)?,
                    i64::from(channel.priority),
                    serde_json::to_string(&channel.config)?,
                    channel.balance,
                    channel.balance_updated_at_ms.map(u64_to_i64),
                    channel.id,
                ],
            )?;
            expect_changed(changed, "channel", channel.id)
        })
        .await
    }

    async fn delete_channel(&self, id: i64) -> Result<(), StoreError> {
        self.with_connection(move |conn| {
            let changed = conn.execute("DELETE FROM channels WHERE id = ?1", [id])?;
            expect_changed(changed, "channel", id)
        })
        .await
    }

    async fn update_channel_status(
        &self,
        id: i64,
        status: ChannelStatus,
        expected: Option<ChannelStatus>,
    ) -> Result<bool, StoreError> {
        self.with_connection(move |conn| {
            let changed = match expected {
                Some(expected) => conn.execute(
                    "UPDATE channels SET status = ?1 WHERE id = ?2 AND status = ?3",
                    rusqlite::params![status.code(), id, expected.code()],
                )?,
                None => conn.execute(
                    "UPDATE channels SET status = ?1 WHERE id = ?2 AND status != ?1",
                    rusqlite::params![status.code(), id],
                )?,
            };
            if changed == 0 && !channel_exists(conn, id)? {
                return Err(StoreError::not_found("channel", id));
            }
            Ok(changed > 0)
        })
        .await
    }

    async fn increment_channel_usage(
        &self,
        id: i64,
        amount: f64,
        requests: u64,
    ) -> Result<(), StoreError> {
        self.with_connection(move |conn| {
            let changed = conn.execute(
                "UPDATE channels
                 SET used_amount = used_amount + ?1, request_count = request_count + ?2
                 WHERE id = ?3",
                rusqlite::params![amount, u64_to_i64(requests), id],
            )?;
            expect_changed(changed, "channel", id)
        })
        .await
    }

    async fn record_channel_probe(
        &self,
        id: i64,
        response_duration_ms: u64,
        test_at_ms: u64,
    ) -> Result<(), StoreError> {
        self.with_connection(move |conn| {
            let changed = conn.execute(
                "UPDATE channels SET response_duration_ms = ?1, test_at_ms = ?2 WHERE id = ?3",
                rusqlite::params![
                    u64_to_i64(response_duration_ms),
                    u64_to_i64(test_at_ms),
                    id
                ],
            )?;
            expect_changed(changed, "channel", id)
        })
        .await
    }

    async fn create_group(&self, group: &Group) -> Result<(), StoreError> {
        let group = group.clone();
        self.with_connection(move |conn| {
            conn.execute(
                "INSERT INTO groups (id, status, qpm, used_amount, request_count, accessed_at_ms,
                    created_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    group.id,
                    group.status.code(),
                    u64_to_i64(group.qpm),
                    group.used_amount,
                    u64_to_i64(group.request_count),
                    group.accessed_at_ms.map(u64_to_i64),
                    u64_to_i64(group.created_at_ms),
                ],
            )
            .map_err(|err| map_conflict(err, "group", group.id.clone()))?;
            Ok(())
        })
        .await
    }

    async fn get_group(&self, id: &str) -> Result<Group, StoreError> {
        let id = id.to_string();
        self.with_connection(move |conn| {
            let sql = format!("SELECT {GROUP_COLUMNS} FROM groups WHERE id = ?1");
            let (group, status) = conn
                .query_row(&sql, [&id], read_group)
                .optional()?
                .ok_or_else(|| StoreError::not_found("group", &id))?;
            if GroupStatus::from_code(status).is_none() {
                return Err(StoreError::Invalid(format!(
                    "group {id} has unknown status {status}"
                )));
            }
            Ok(group)
        })
        .await
    }

    async fn list_groups(&self) -> Result<Vec<Group>, StoreError> {
        self.with_connection(|conn| {
            let sql = format!("SELECT {GROUP_COLUMNS} FROM groups ORDER BY id");
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([], read_group)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?.0);
            }
            Ok(out)
        })
        .await
    }

    async fn update_group_qpm(&self, id: &str, qpm: u64) -> Result<(), StoreError> {
        let id = id.to_string();
        self.with_connection(move |conn| {
            let changed = conn.execute(
                "UPDATE groups SET qpm = ?1 WHERE id = ?2",
                rusqlite::params![u64_to_i64(qpm), id],
            )?;
            expect_changed(changed, "group", id)
        })
        .await
    }

    async fn update_group_status(&self, id: &str, status: GroupStatus) -> Result<(), StoreError> {
        let id = id.to_string();
        self.with_connection(move |conn| {
            let changed = conn.execute(
                "UPDATE groups SET status = ?1 WHERE id = ?2",
                rusqlite::params![status.code(), id],
            )?;
            expect_changed(changed, "group", id)
        })
        .await
    }

    async fn increment_group_usage(
        &self,
        id: &str,
        amount: f64,
        requests: u64,
        at_ms: u64,
    ) -> Result<(), StoreError> {
        let id = id.to_string();
        self.with_connection(move |conn| {
            let changed = conn.execute(
                "UPDATE groups
                 SET used_amount = used_amount + ?1, request_count = request_count + ?2,
                     accessed_at_ms = ?3
                 WHERE id = ?4",
                rusqlite::params![amount, u64_to_i64(requests), u64_to_i64(at_ms), id],
            )?;
            expect_changed(changed, "group", id)
        })
        .await
    }

    async fn create_token(&self, token: Token) -> Result<Token, StoreError> {
        self.with_connection(move |conn| {
            if !group_exists(conn, &token.group_id)? {
                return Err(StoreError::not_found("group", &token.group_id));
            }
            conn.execute(
                "INSERT INTO tokens (group_id, key, name, status, expired_at_ms, quota,
                    used_amount, request_count, models_json, subnet, accessed_at_ms,
                    created_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                rusqlite::params![
                    token.group_id,
                    token.key,
                    token.name,
                    token.status.code(),
                    token.expired_at_ms.map(u64_to_i64),
                    token.quota,
                    token.used_amount,
                    u64_to_i64(token.request_count),
                    serde_json::to_string(&token.models)?,
                    token.subnet,
                    token.accessed_at_ms.map(u64_to_i64),
                    u64_to_i64(token.created_at_ms),
                ],
            )
            .map_err(|err| map_conflict(err, "token", token.name.clone()))?;
            let mut token = token;
            token.id = conn.last_insert_rowid();
            Ok(token)
        })
        .await
    }

    async fn get_token(&self, id: i64) -> Result<Token, StoreError> {
        self.with_connection(move |conn| {
            select_token(conn, "WHERE id = ?1", &id)?
                .ok_or_else(|| StoreError::not_found("token", id))
        })
        .await
    }

    async fn get_token_by_key(&self, key: &str) -> Result<Token, StoreError> {
        let key = key.to_string();
        self.with_connection(move |conn| {
            select_token(conn, "WHERE key = ?1", &key)?
                .ok_or_else(|| StoreError::not_found("token", "<redacted>"))
        })
        .await
    }

    async fn list_tokens(&self, group_id: &str) -> Result<Vec<Token>, StoreError> {
        let group_id = group_id.to_string();
        self.with_connection(move |conn| {
            let sql = format!("SELECT {TOKEN_COLUMNS} FROM tokens WHERE group_id = ?1 ORDER BY id");
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([&group_id], read_token_row)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?.into_token()?);
            }
            Ok(out)
        })
        .await
    }

    async fn update_token(&self, token: &Token) -> Result<(), StoreError> {
        let token = token.clone();
        self.with_connection(move |conn| {
            let changed = conn
                .execute(
                    "UPDATE tokens SET key = ?1, name = ?2, status = ?3, expired_at_ms = ?4,
                        quota = ?5, models_json = ?6, subnet = ?7
                     WHERE id = ?8",
                    rusqlite::params![
                        token.key,
                        token.name,
                        token.status.code(),
                        token.expired_at_ms.map(u64_to_i64),
                        token.quota,
                        serde_json::to_string(&token.models)?,
                        token.subnet,
                        token.id,
                    ],
                )
                .map_err(|err| map_conflict(err, "token", token.name.clone()))?;
            expect_changed(changed, "token", token.id)
        })
        .await
    }

    async fn delete_token(&self, id: i64) -> Result<(), StoreError> {
        self.with_connection(move |conn| {
            let changed = conn.execute("DELETE FROM tokens WHERE id = ?1", [id])?;
            expect_changed(changed, "token", id)
        })
        .await
    }

    async fn update_token_status(
        &self,
        id: i64,
        status: TokenStatus,
        expected: Option<TokenStatus>,
    ) -> Result<bool, StoreError> {
        self.with_connection(move |conn| {
            let changed = match expected {
                Some(expected) => conn.execute(
                    "UPDATE tokens SET status = ?1 WHERE id = ?2 AND status = ?3",
                    rusqlite::params![status.code(), id, expected.code()],
                )?,
                None => conn.execute(
                    "UPDATE tokens SET status = ?1 WHERE id = ?2 AND status != ?1",
                    rusqlite::params![status.code(), id],
                )?,
            };
            if changed == 0 && !token_exists(conn, id)? {
                return Err(StoreError::not_found("token", id));
            }
            Ok(changed > 0)
        })
        .await
    }

    async fn increment_token_usage(
        &self,
        id: i64,
        amount: f64,
        requests: u64,
        at_ms: u64,
    ) -> Result<(), StoreError> {
        self.with_connection(move |conn| {
            let changed = conn.execute(
                "UPDATE tokens
                 SET used_amount = used_amount + ?1, request_count = request_count + ?2,
                     accessed_at_ms = ?3
                 WHERE id = ?4",
                rusqlite::params![amount, u64_to_i64(requests), u64_to_i64(at_ms), id],
            )?;
            expect_changed(changed, "token", id)
        })
        .await
    }

    async fn append_usage_log(&self, record: UsageLogRecord) -> Result<i64, StoreError> {
        self.with_connection(move |conn| {
            conn.execute(
                "INSERT INTO usage_logs (created_at_ms, group_id, channel_id, token_id,
                    token_name, model, prompt_tokens, completion_tokens, prompt_price,
                    completion_price, amount, content)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                rusqlite::params![
                    u64_to_i64(record.created_at_ms),
                    record.group_id,
                    record.channel_id,
                    record.token_id,
                    record.token_name,
                    record.model,
                    i64::from(record.prompt_tokens),
                    i64::from(record.completion_tokens),
                    record.prompt_price,
                    record.completion_price,
                    record.amount,
                    record.content,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    async fn query_usage_logs(
        &self,
        query: &UsageLogQuery,
    ) -> Result<Vec<UsageLogRecord>, StoreError> {
        let query = query.clone();
        self.with_connection(move |conn| {
            let mut clauses: Vec<&str> = Vec::new();
            let mut params: Vec<Value> = Vec::new();
            if let Some(group_id) = query.group_id {
                clauses.push("group_id = ?");
                params.push(Value::Text(group_id));
            }
            if let Some(model) = query.model {
                clauses.push("model = ?");
                params.push(Value::Text(model));
            }
            if let Some(channel_id) = query.channel_id {
                clauses.push("channel_id = ?");
                params.push(Value::Integer(channel_id));
            }
            if let Some(token_name) = query.token_name {
                clauses.push("token_name = ?");
                params.push(Value::Text(token_name));
            }
            if let Some(start_ms) = query.start_ms {
                clauses.push("created_at_ms >= ?");
                params.push(Value::Integer(u64_to_i64(start_ms)));
            }
            if let Some(end_ms) = query.end_ms {
                clauses.push("created_at_ms <= ?");
                params.push(Value::Integer(u64_to_i64(end_ms)));
            }

            let filter = if clauses.is_empty() {
                String::new()
            } else {
                format!("WHERE {}", clauses.join(" AND "))
            };
            // SQLite treats a negative LIMIT as unbounded.
            let limit = query
                .limit
                .map(|limit| u64_to_i64(limit as u64))
                .unwrap_or(-1);
            params.push(Value::Integer(limit));
            params.push(Value::Integer(u64_to_i64(query.offset as u64)));

            let sql = format!(
                "SELECT {USAGE_LOG_COLUMNS} FROM usage_logs {filter}
                 ORDER BY created_at_ms DESC, id DESC
                 LIMIT ? OFFSET ?"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(params.iter()), read_usage_log)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }

    async fn load_options(&self) -> Result<BTreeMap<String, String>, StoreError> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare("SELECT key, value FROM options")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            let mut out = BTreeMap::new();
            for row in rows {
                let (key, value) = row?;
                out.insert(key, value);
            }
            Ok(out)
        })
        .await
    }

    async fn save_option(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let key = key.to_string();
        let value = value.to_string();
        self.with_connection(move |conn| {
            conn.execute(
                "INSERT INTO options (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                rusqlite::params![key, value],
            )?;
            Ok(())
        })
        .await
    }
}

fn init_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS channels (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            type INTEGER NOT NULL,
            name TEXT NOT NULL DEFAULT '',
            key TEXT NOT NULL,
            status INTEGER NOT NULL,
            base_url TEXT NOT NULL DEFAULT '',
            models_json TEXT NOT NULL DEFAULT '[]',
            model_mapping_json TEXT NOT NULL DEFAULT '{}',
            priority INTEGER NOT NULL DEFAULT 0,
            config_json TEXT NOT NULL DEFAULT '{}',
            used_amount REAL NOT NULL DEFAULT 0,
            request_count INTEGER NOT NULL DEFAULT 0,
            response_duration_ms INTEGER NOT NULL DEFAULT 0,
            test_at_ms INTEGER,
            balance REAL NOT NULL DEFAULT 0,
            balance_updated_at_ms INTEGER,
            created_at_ms INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_channels_status ON channels(status);

        CREATE TABLE IF NOT EXISTS groups (
            id TEXT PRIMARY KEY NOT NULL,
            status INTEGER NOT NULL,
            qpm INTEGER NOT NULL DEFAULT 0,
            used_amount REAL NOT NULL DEFAULT 0,
            request_count INTEGER NOT NULL DEFAULT 0,
            accessed_at_ms INTEGER,
            created_at_ms INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS tokens (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            group_id TEXT NOT NULL,
            key TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL DEFAULT '',
            status INTEGER NOT NULL,
            expired_at_ms INTEGER,
            quota REAL,
            used_amount REAL NOT NULL DEFAULT 0,
            request_count INTEGER NOT NULL DEFAULT 0,
            models_json TEXT NOT NULL DEFAULT '[]',
            subnet TEXT,
            accessed_at_ms INTEGER,
            created_at_ms INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_tokens_group_id ON tokens(group_id);

        CREATE TABLE IF NOT EXISTS usage_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            created_at_ms INTEGER NOT NULL,
            group_id TEXT NOT NULL,
            channel_id INTEGER NOT NULL,
            token_id INTEGER NOT NULL,
            token_name TEXT NOT NULL,
            model TEXT NOT NULL,
            prompt_tokens INTEGER NOT NULL,
            completion_tokens INTEGER NOT NULL,
            prompt_price REAL NOT NULL,
            completion_price REAL NOT NULL,
            amount REAL NOT NULL,
            content TEXT NOT NULL DEFAULT ''
        );
        CREATE INDEX IF NOT EXISTS idx_usage_logs_created_at_ms
            ON usage_logs(created_at_ms);
        CREATE INDEX IF NOT EXISTS idx_usage_logs_group_id_created_at_ms
            ON usage_logs(group_id, created_at_ms);
        CREATE INDEX IF NOT EXISTS idx_usage_logs_model_created_at_ms
            ON usage_logs(model, created_at_ms);

        CREATE TABLE IF NOT EXISTS options (
            key TEXT PRIMARY KEY NOT NULL,
            value TEXT NOT NULL
        );",
    )?;
    Ok(())
}

fn open_connection(path: PathBuf) -> Result<rusqlite::Connection, rusqlite::Error> {
    let conn = rusqlite::Connection::open(path)?;
    let _ = conn.busy_timeout(Duration::from_secs(5));
    let _ = conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;");
    Ok(conn)
}

fn u64_to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn i64_to_u64(value: i64) -> u64 {
    if value <= 0 { 0 } else { value as u64 }
}

fn i64_to_u32(value: i64) -> u32 {
    u32::try_from(value.max(0)).unwrap_or(u32::MAX)
}
