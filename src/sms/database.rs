use std::time::Duration;
use anyhow::{anyhow, bail, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use tracing::debug;
use uuid::Uuid;
use crate::config::DatabaseConfig;
use crate::sms::types::{ApiKey, Direction, IncomingMessage, MessageFilter, MessageStatus, OutgoingRequest, SMSMessage};

const SCHEMA_SQL: &str = include_str!("../schema.sql");

const INBOX_CURSOR_KEY: &str = "inbox_last_seen_index";

pub struct SMSDatabase {
    pool: SqlitePool
}
impl SMSDatabase {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let connection_options = SqliteConnectOptions::new()
            .filename(&config.database_url)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(20)
            .min_connections(5)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(None)
            .max_lifetime(None)
            .test_before_acquire(true)
            .after_connect(|conn, _meta| {
                Box::pin(async move {
                    sqlx::query("PRAGMA foreign_keys = ON").execute(&mut *conn).await?;
                    sqlx::query("PRAGMA cache_size = -64000").execute(&mut *conn).await?; // 64MB Cache
                    sqlx::query("PRAGMA temp_store = memory").execute(&mut *conn).await?;
                    Ok(())
                })
            })
            .connect_with(connection_options)
            .await
            .map_err(|e| anyhow!(e))?;

        let db = Self { pool };
        db.init_tables().await?;
        Ok(db)
    }

    /// In-memory database for tests; same schema, same pragmas.
    #[cfg(test)]
    pub async fn connect_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(SqliteConnectOptions::new().in_memory(true))
            .await
            .map_err(|e| anyhow!(e))?;

        let db = Self { pool };
        db.init_tables().await?;
        Ok(db)
    }

    async fn init_tables(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA_SQL)
            .execute(&self.pool)
            .await
            .map_err(|e| anyhow!(e))?;

        debug!("SMSDatabase tables initialized successfully!");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| anyhow!(e))?;
        Ok(())
    }

    // ---- messages ----

    pub async fn insert_outgoing(&self, request: &OutgoingRequest) -> Result<SMSMessage> {
        let message_id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO messages (message_id, direction, phone_number, content, status, api_key_id) VALUES (?, 'outgoing', ?, ?, ?, ?)"
        )
            .bind(&message_id)
            .bind(&request.phone_number)
            .bind(&request.content)
            .bind(MessageStatus::Pending)
            .bind(&request.api_key_id)
            .execute(&self.pool)
            .await
            .map_err(|e| anyhow!(e))?;

        match self.get_message(&message_id).await? {
            Some(message) => Ok(message),
            None => bail!("Outgoing message disappeared immediately after insert!")
        }
    }

    /// Insert an inbound message keyed by its modem inbox slot. Returns None
    /// when the slot was already ingested (restart re-poll).
    pub async fn insert_incoming(&self, incoming: &IncomingMessage) -> Result<Option<SMSMessage>> {
        let message_id = Uuid::new_v4().to_string();
        let result = sqlx::query(
            "INSERT OR IGNORE INTO messages (message_id, direction, phone_number, content, status, modem_index, modem_reported_status, received_at) \
             VALUES (?, 'incoming', ?, ?, ?, ?, ?, unixepoch())"
        )
            .bind(&message_id)
            .bind(&incoming.phone_number)
            .bind(&incoming.content)
            .bind(MessageStatus::Received)
            .bind(incoming.modem_index)
            .bind(&incoming.modem_reported_status)
            .execute(&self.pool)
            .await
            .map_err(|e| anyhow!(e))?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_message(&message_id).await
    }

    pub async fn get_message(&self, message_id: &str) -> Result<Option<SMSMessage>> {
        sqlx::query_as(
            "SELECT message_id, direction, phone_number, content, status, modem_message_id, error_message, api_key_id, \
             modem_index, modem_reported_status, sent_at, delivered_at, received_at, created_at, updated_at \
             FROM messages WHERE message_id = ?"
        )
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| anyhow!(e))
    }

    /// Conditional status transition. Returns false when the message was not
    /// in one of the expected pre-states, which callers treat as lost race.
    pub async fn transition_status(
        &self,
        message_id: &str,
        from: &[MessageStatus],
        to: MessageStatus
    ) -> Result<bool> {
        if from.is_empty() {
            bail!("Status transition requires at least one pre-state");
        }

        // Timestamp columns are set exactly once, at their defining transition.
        let timestamp_clause = match to {
            MessageStatus::Sent => ", sent_at = unixepoch()",
            MessageStatus::Delivered => ", delivered_at = unixepoch()",
            _ => ""
        };

        let placeholders = vec!["?"; from.len()].join(", ");
        let sql = format!(
            "UPDATE messages SET status = ?, updated_at = unixepoch(){} WHERE message_id = ? AND status IN ({})",
            timestamp_clause, placeholders
        );

        let mut query = sqlx::query(&sql)
            .bind(to)
            .bind(message_id);
        for status in from {
            query = query.bind(*status);
        }

        let result = query
            .execute(&self.pool)
            .await
            .map_err(|e| anyhow!(e))?;

        Ok(result.rows_affected() == 1)
    }

    /// Single-statement sending -> sent transition. Stores the modem id and
    /// stamps sent_at atomically so the two never disagree.
    pub async fn mark_sent(&self, message_id: &str, modem_message_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE messages SET status = ?, modem_message_id = ?, sent_at = unixepoch(), updated_at = unixepoch() \
             WHERE message_id = ? AND status = ?"
        )
            .bind(MessageStatus::Sent)
            .bind(modem_message_id)
            .bind(message_id)
            .bind(MessageStatus::Sending)
            .execute(&self.pool)
            .await
            .map_err(|e| anyhow!(e))?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn set_error_message(&self, message_id: &str, error_message: &str) -> Result<()> {
        sqlx::query(
            "UPDATE messages SET error_message = ?, updated_at = unixepoch() WHERE message_id = ?"
        )
            .bind(error_message)
            .bind(message_id)
            .execute(&self.pool)
            .await
            .map_err(|e| anyhow!(e))?;
        Ok(())
    }

    /// Sent messages that have not reached a terminal state and are old
    /// enough to be worth asking the modem about.
    pub async fn get_unreconciled_sent(&self, older_than_secs: i64, limit: u32) -> Result<Vec<SMSMessage>> {
        sqlx::query_as(
            "SELECT message_id, direction, phone_number, content, status, modem_message_id, error_message, api_key_id, \
             modem_index, modem_reported_status, sent_at, delivered_at, received_at, created_at, updated_at \
             FROM messages \
             WHERE status = ? AND modem_message_id IS NOT NULL AND sent_at < (unixepoch() - ?) \
             ORDER BY sent_at ASC LIMIT ?"
        )
            .bind(MessageStatus::Sent)
            .bind(older_than_secs)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| anyhow!(e))
    }

    /// List messages visible to one API key: its own outgoing traffic plus
    /// all incoming traffic.
    pub async fn list_messages(&self, api_key_id: &str, filter: &MessageFilter) -> Result<Vec<SMSMessage>> {
        let mut sql = String::from(
            "SELECT message_id, direction, phone_number, content, status, modem_message_id, error_message, api_key_id, \
             modem_index, modem_reported_status, sent_at, delivered_at, received_at, created_at, updated_at \
             FROM messages WHERE (direction = 'incoming' OR api_key_id = ?)"
        );

        if filter.direction.is_some() {
            sql.push_str(" AND direction = ?");
        }
        if filter.status.is_some() {
            sql.push_str(" AND status = ?");
        }
        if filter.phone_number.is_some() {
            sql.push_str(" AND phone_number = ?");
        }
        sql.push_str(" ORDER BY created_at DESC LIMIT ? OFFSET ?");

        let mut query = sqlx::query_as(&sql).bind(api_key_id);
        if let Some(direction) = filter.direction {
            query = query.bind(direction.as_str());
        }
        if let Some(status) = filter.status {
            query = query.bind(status);
        }
        if let Some(phone) = &filter.phone_number {
            query = query.bind(phone.clone());
        }

        query
            .bind(filter.limit as i64)
            .bind(filter.offset as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| anyhow!(e))
    }

    // ---- api keys ----

    pub async fn insert_api_key(
        &self,
        name: &str,
        key_hash: &str,
        key_prefix: &str,
        rate_limit: Option<i64>
    ) -> Result<ApiKey> {
        let api_key_id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO api_keys (api_key_id, name, key_hash, key_prefix, is_active, rate_limit) VALUES (?, ?, ?, ?, 1, ?)"
        )
            .bind(&api_key_id)
            .bind(name)
            .bind(key_hash)
            .bind(key_prefix)
            .bind(rate_limit)
            .execute(&self.pool)
            .await
            .map_err(|e| anyhow!(e))?;

        match self.get_api_key(&api_key_id).await? {
            Some(key) => Ok(key),
            None => bail!("API key disappeared immediately after insert!")
        }
    }

    pub async fn get_api_key(&self, api_key_id: &str) -> Result<Option<ApiKey>> {
        sqlx::query_as(
            "SELECT api_key_id, name, key_hash, key_prefix, is_active, rate_limit, last_used_at, created_at, updated_at \
             FROM api_keys WHERE api_key_id = ?"
        )
            .bind(api_key_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| anyhow!(e))
    }

    pub async fn get_active_api_key_by_prefix(&self, key_prefix: &str) -> Result<Option<ApiKey>> {
        sqlx::query_as(
            "SELECT api_key_id, name, key_hash, key_prefix, is_active, rate_limit, last_used_at, created_at, updated_at \
             FROM api_keys WHERE key_prefix = ? AND is_active = 1"
        )
            .bind(key_prefix)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| anyhow!(e))
    }

    pub async fn deactivate_api_key(&self, api_key_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE api_keys SET is_active = 0, updated_at = unixepoch() WHERE api_key_id = ?"
        )
            .bind(api_key_id)
            .execute(&self.pool)
            .await
            .map_err(|e| anyhow!(e))?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn touch_api_key(&self, api_key_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE api_keys SET last_used_at = unixepoch() WHERE api_key_id = ?"
        )
            .bind(api_key_id)
            .execute(&self.pool)
            .await
            .map_err(|e| anyhow!(e))?;
        Ok(())
    }

    // ---- gateway state ----

    pub async fn get_inbox_cursor(&self) -> Result<i64> {
        let value: Option<String> = sqlx::query_scalar(
            "SELECT value FROM gateway_state WHERE key = ?"
        )
            .bind(INBOX_CURSOR_KEY)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| anyhow!(e))?;

        match value {
            Some(raw) => raw.parse::<i64>()
                .map_err(|e| anyhow!("Corrupt inbox cursor value {:?}: {}", raw, e)),
            None => Ok(0)
        }
    }

    pub async fn set_inbox_cursor(&self, index: i64) -> Result<()> {
        sqlx::query(
            "INSERT INTO gateway_state (key, value, updated_at) VALUES (?, ?, unixepoch()) \
             ON CONFLICT (key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at"
        )
            .bind(INBOX_CURSOR_KEY)
            .bind(index.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| anyhow!(e))?;
        Ok(())
    }

    pub async fn count_messages_by_direction(&self, direction: Direction) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE direction = ?")
            .bind(direction.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| anyhow!(e))
    }
}
