/// SQLite persistence for execution history
///
/// Every write here is best-effort by contract: a failed audit write is
/// retried once with simplified data, then skipped with an error log. An
/// in-flight traversal is never aborted because its audit trail could not be
/// written, and a record is never dropped because its payload did not
/// serialize (the payload is degraded instead).

use crate::history::records::{
    FlowExecutionRecord, FlowRunStatus, IntegrationExecutionRecord, LabelParticipationRecord,
    NodeRunStatus, ScriptExecutionRecord,
};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use sqlx::{sqlite::SqlitePool, Row};

/// Maximum characters kept when a value is degraded to its string form
const TRUNCATED_DATA_LIMIT: usize = 500;

/// SQLite-backed history store
#[derive(Debug, Clone)]
pub struct HistoryStore {
    pool: SqlitePool,
}

impl HistoryStore {
    /// Create new store instance with database connection
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Initialize the four audit tables
    ///
    /// Safe to call multiple times (uses IF NOT EXISTS).
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS flow_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                flow_id INTEGER NOT NULL,
                status TEXT NOT NULL,
                trigger_source TEXT,
                source_id INTEGER,
                execution_path JSON,
                error_details TEXT,
                start_time TEXT,
                end_time TEXT,
                execution_time INTEGER,
                timestamp TEXT,
                input_data JSON,
                output_data JSON
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS function_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                function_id INTEGER NOT NULL,
                flow_id INTEGER,
                status TEXT NOT NULL,
                input_data JSON,
                output_data JSON,
                error_message TEXT,
                execution_time INTEGER,
                timestamp TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS integration_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                integration_id INTEGER NOT NULL,
                flow_id INTEGER,
                status TEXT NOT NULL,
                input_data JSON,
                response_data JSON,
                error_message TEXT,
                execution_time INTEGER,
                timestamp TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS label_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                label_id INTEGER NOT NULL,
                flow_id INTEGER,
                event TEXT NOT NULL,
                data JSON,
                status TEXT,
                timestamp TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS device_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                device_id INTEGER NOT NULL,
                event TEXT NOT NULL,
                data JSON,
                timestamp TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Open a flow record in `running` state, returning its id
    ///
    /// Returns None when both the write and its simplified retry fail; the
    /// caller proceeds without the record.
    pub async fn begin_flow_run(
        &self,
        flow_id: i64,
        trigger_source: &str,
        source_id: i64,
        start_time: DateTime<Utc>,
    ) -> Option<i64> {
        let attempt = sqlx::query(
            r#"
            INSERT INTO flow_history (flow_id, status, trigger_source, source_id, start_time, timestamp)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(flow_id)
        .bind(FlowRunStatus::Running.as_str())
        .bind(trigger_source)
        .bind(source_id)
        .bind(start_time.to_rfc3339())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await;

        match attempt {
            Ok(result) => Some(result.last_insert_rowid()),
            Err(e) => {
                tracing::error!("❌ Could not open flow history record for flow {}: {}", flow_id, e);
                None
            }
        }
    }

    /// Finalize a flow record with the aggregated outcome
    #[allow(clippy::too_many_arguments)]
    pub async fn finalize_flow_run(
        &self,
        record_id: i64,
        status: FlowRunStatus,
        execution_path: &Value,
        error_details: Option<&Value>,
        input_data: &Value,
        output_data: Option<&Value>,
        end_time: DateTime<Utc>,
        execution_time_ms: i64,
    ) {
        let path_json = safe_json_string(execution_path);
        let errors_json = error_details.map(safe_json_string);
        let input_json = safe_json_string(input_data);
        let output_json = output_data.map(safe_json_string);

        let attempt = sqlx::query(
            r#"
            UPDATE flow_history
            SET status = ?, execution_path = ?, error_details = ?, end_time = ?,
                execution_time = ?, timestamp = ?, input_data = ?, output_data = ?
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(&path_json)
        .bind(&errors_json)
        .bind(end_time.to_rfc3339())
        .bind(execution_time_ms)
        .bind(Utc::now().to_rfc3339())
        .bind(&input_json)
        .bind(&output_json)
        .bind(record_id)
        .execute(&self.pool)
        .await;

        if let Err(e) = attempt {
            tracing::warn!("⚠️ Flow history finalize failed for record {}: {}, retrying simplified", record_id, e);
            let simplified = json!({"error": "execution path omitted after persistence failure"});
            let retry = sqlx::query(
                "UPDATE flow_history SET status = ?, execution_path = ?, end_time = ?, execution_time = ? WHERE id = ?",
            )
            .bind(status.as_str())
            .bind(simplified.to_string())
            .bind(end_time.to_rfc3339())
            .bind(execution_time_ms)
            .bind(record_id)
            .execute(&self.pool)
            .await;
            if let Err(e2) = retry {
                tracing::error!("❌ Could not finalize flow history record {}: {}", record_id, e2);
            }
        }
    }

    /// Open a script record in `running` state, returning its id
    pub async fn begin_function_run(
        &self,
        function_id: i64,
        flow_id: Option<i64>,
        input_data: &Value,
    ) -> Option<i64> {
        let input_json = safe_json_string(input_data);
        let attempt = sqlx::query(
            "INSERT INTO function_history (function_id, flow_id, status, input_data, timestamp) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(function_id)
        .bind(flow_id)
        .bind(NodeRunStatus::Running.as_str())
        .bind(&input_json)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await;

        match attempt {
            Ok(result) => Some(result.last_insert_rowid()),
            Err(e) => {
                tracing::warn!("⚠️ Function history insert failed: {}, retrying simplified", e);
                let retry = sqlx::query(
                    "INSERT INTO function_history (function_id, flow_id, status, timestamp) VALUES (?, ?, ?, ?)",
                )
                .bind(function_id)
                .bind(flow_id)
                .bind(NodeRunStatus::Running.as_str())
                .bind(Utc::now().to_rfc3339())
                .execute(&self.pool)
                .await;
                match retry {
                    Ok(result) => Some(result.last_insert_rowid()),
                    Err(e2) => {
                        tracing::error!("❌ Could not record function execution: {}", e2);
                        None
                    }
                }
            }
        }
    }

    /// Close a script record with its final outcome
    pub async fn finish_function_run(
        &self,
        record_id: i64,
        status: NodeRunStatus,
        output_data: Option<&Value>,
        error_message: Option<&str>,
        execution_time_ms: i64,
    ) {
        let output_json = output_data.map(safe_json_string);
        let attempt = sqlx::query(
            "UPDATE function_history SET status = ?, output_data = ?, error_message = ?, execution_time = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(&output_json)
        .bind(error_message)
        .bind(execution_time_ms)
        .bind(record_id)
        .execute(&self.pool)
        .await;

        if let Err(e) = attempt {
            tracing::warn!("⚠️ Function history update failed for record {}: {}, retrying simplified", record_id, e);
            let retry = sqlx::query(
                "UPDATE function_history SET status = ?, output_data = ?, execution_time = ? WHERE id = ?",
            )
            .bind(status.as_str())
            .bind(json!({"error": "Data contained non-serializable values"}).to_string())
            .bind(execution_time_ms)
            .bind(record_id)
            .execute(&self.pool)
            .await;
            if let Err(e2) = retry {
                tracing::error!("❌ Could not finish function history record {}: {}", record_id, e2);
            }
        }
    }

    /// Open an integration record in `running` state, returning its id
    pub async fn begin_integration_run(
        &self,
        integration_id: i64,
        flow_id: Option<i64>,
        input_data: &Value,
    ) -> Option<i64> {
        let input_json = safe_json_string(input_data);
        let attempt = sqlx::query(
            "INSERT INTO integration_history (integration_id, flow_id, status, input_data, timestamp) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(integration_id)
        .bind(flow_id)
        .bind(NodeRunStatus::Running.as_str())
        .bind(&input_json)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await;

        match attempt {
            Ok(result) => Some(result.last_insert_rowid()),
            Err(e) => {
                tracing::warn!("⚠️ Integration history insert failed: {}, retrying simplified", e);
                let retry = sqlx::query(
                    "INSERT INTO integration_history (integration_id, flow_id, status, timestamp) VALUES (?, ?, ?, ?)",
                )
                .bind(integration_id)
                .bind(flow_id)
                .bind(NodeRunStatus::Running.as_str())
                .bind(Utc::now().to_rfc3339())
                .execute(&self.pool)
                .await;
                match retry {
                    Ok(result) => Some(result.last_insert_rowid()),
                    Err(e2) => {
                        tracing::error!("❌ Could not record integration execution: {}", e2);
                        None
                    }
                }
            }
        }
    }

    /// Close an integration record with its final outcome
    pub async fn finish_integration_run(
        &self,
        record_id: i64,
        status: NodeRunStatus,
        response_data: Option<&Value>,
        error_message: Option<&str>,
        execution_time_ms: i64,
    ) {
        let response_json = response_data.map(safe_json_string);
        let attempt = sqlx::query(
            "UPDATE integration_history SET status = ?, response_data = ?, error_message = ?, execution_time = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(&response_json)
        .bind(error_message)
        .bind(execution_time_ms)
        .bind(record_id)
        .execute(&self.pool)
        .await;

        if let Err(e) = attempt {
            tracing::warn!("⚠️ Integration history update failed for record {}: {}, retrying simplified", record_id, e);
            let retry = sqlx::query(
                "UPDATE integration_history SET status = ?, response_data = ?, execution_time = ? WHERE id = ?",
            )
            .bind(status.as_str())
            .bind(json!({"error": "Data contained non-serializable values"}).to_string())
            .bind(execution_time_ms)
            .bind(record_id)
            .execute(&self.pool)
            .await;
            if let Err(e2) = retry {
                tracing::error!("❌ Could not finish integration history record {}: {}", record_id, e2);
            }
        }
    }

    /// Record a label's participation in a root invocation
    pub async fn record_label_event(
        &self,
        label_id: i64,
        flow_id: Option<i64>,
        event: &str,
        status: &str,
        data: &Value,
    ) {
        let data_json = safe_json_string(data);
        let attempt = sqlx::query(
            "INSERT INTO label_history (label_id, flow_id, event, data, status, timestamp) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(label_id)
        .bind(flow_id)
        .bind(event)
        .bind(&data_json)
        .bind(status)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await;

        if let Err(e) = attempt {
            tracing::warn!("⚠️ Label history insert failed for label {}: {}", label_id, e);
        }
    }

    /// Record a raw device event (uplink/join) at the ingest boundary
    pub async fn record_device_event(&self, device_id: i64, event: &str, data: &Value) {
        let data_json = safe_json_string(data);
        let attempt = sqlx::query(
            "INSERT INTO device_history (device_id, event, data, timestamp) VALUES (?, ?, ?, ?)",
        )
        .bind(device_id)
        .bind(event)
        .bind(&data_json)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await;

        if let Err(e) = attempt {
            tracing::warn!("⚠️ Device history insert failed for device {}: {}", device_id, e);
        }
    }

    /// Recent device event payloads for uplink deduplication, newest first
    pub async fn recent_device_events(
        &self,
        device_id: i64,
        event: &str,
        limit: i64,
    ) -> Result<Vec<Value>> {
        let rows = sqlx::query(
            "SELECT data FROM device_history WHERE device_id = ? AND event = ? ORDER BY id DESC LIMIT ?",
        )
        .bind(device_id)
        .bind(event)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .filter_map(|row| {
                let data: Option<String> = row.get("data");
                data.and_then(|json| serde_json::from_str(&json).ok())
            })
            .collect())
    }

    /// Fetch a flow record by id
    pub async fn flow_run(&self, record_id: i64) -> Result<Option<FlowExecutionRecord>> {
        let row = sqlx::query(
            r#"
            SELECT id, flow_id, status, trigger_source, source_id, execution_path,
                   error_details, start_time, end_time, execution_time, input_data, output_data
            FROM flow_history WHERE id = ?
            "#,
        )
        .bind(record_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| FlowExecutionRecord {
            id: row.get("id"),
            flow_id: row.get("flow_id"),
            status: row.get("status"),
            trigger_source: row.get("trigger_source"),
            source_id: row.get("source_id"),
            execution_path: parse_json_column(&row, "execution_path"),
            error_details: parse_json_column(&row, "error_details"),
            start_time: parse_time_column(&row, "start_time"),
            end_time: parse_time_column(&row, "end_time"),
            execution_time_ms: row.get("execution_time"),
            input_data: parse_json_column(&row, "input_data"),
            output_data: parse_json_column(&row, "output_data"),
        }))
    }

    /// All script records for a function, oldest first
    pub async fn function_runs(&self, function_id: i64) -> Result<Vec<ScriptExecutionRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, function_id, flow_id, status, input_data, output_data, error_message, execution_time
            FROM function_history WHERE function_id = ? ORDER BY id
            "#,
        )
        .bind(function_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| ScriptExecutionRecord {
                id: row.get("id"),
                function_id: row.get("function_id"),
                flow_id: row.get("flow_id"),
                status: row.get("status"),
                input_data: parse_json_column(row, "input_data"),
                output_data: parse_json_column(row, "output_data"),
                error_message: row.get("error_message"),
                execution_time_ms: row.get("execution_time"),
            })
            .collect())
    }

    /// All integration records for an integration, oldest first
    pub async fn integration_runs(
        &self,
        integration_id: i64,
    ) -> Result<Vec<IntegrationExecutionRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, integration_id, flow_id, status, input_data, response_data, error_message, execution_time
            FROM integration_history WHERE integration_id = ? ORDER BY id
            "#,
        )
        .bind(integration_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| IntegrationExecutionRecord {
                id: row.get("id"),
                integration_id: row.get("integration_id"),
                flow_id: row.get("flow_id"),
                status: row.get("status"),
                input_data: parse_json_column(row, "input_data"),
                response_data: parse_json_column(row, "response_data"),
                error_message: row.get("error_message"),
                execution_time_ms: row.get("execution_time"),
            })
            .collect())
    }

    /// Label participation rows for a flow, oldest first
    pub async fn label_events_for_flow(
        &self,
        flow_id: i64,
    ) -> Result<Vec<LabelParticipationRecord>> {
        let rows = sqlx::query(
            "SELECT id, label_id, flow_id, event, data, status FROM label_history WHERE flow_id = ? ORDER BY id",
        )
        .bind(flow_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| LabelParticipationRecord {
                id: row.get("id"),
                label_id: row.get("label_id"),
                flow_id: row.get("flow_id"),
                event: row.get("event"),
                status: row.get("status"),
                data: parse_json_column(row, "data"),
            })
            .collect())
    }
}

fn parse_json_column(row: &sqlx::sqlite::SqliteRow, column: &str) -> Option<Value> {
    let raw: Option<String> = row.get(column);
    raw.and_then(|json| serde_json::from_str(&json).ok())
}

fn parse_time_column(row: &sqlx::sqlite::SqliteRow, column: &str) -> Option<DateTime<Utc>> {
    let raw: Option<String> = row.get(column);
    raw.and_then(|text| DateTime::parse_from_rfc3339(&text).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// Serialize a value destined for an audit column, degrading instead of failing
///
/// A record is never dropped because its payload would not serialize: the
/// payload is replaced by a deterministic fallback carrying a truncated
/// string form and an explicit error marker.
pub fn safe_json_string(value: &Value) -> String {
    match serde_json::to_string(value) {
        Ok(json) => json,
        Err(e) => {
            tracing::warn!("⚠️ Audit payload not serializable: {}", e);
            json!({
                "status": "error",
                "error": format!("Failed to serialize audit payload: {}", e),
                "truncated_data": truncate_chars(&format!("{:?}", value), TRUNCATED_DATA_LIMIT),
            })
            .to_string()
        }
    }
}

/// Convert an arbitrary serializable value into an audit-safe JSON value
pub fn safe_serialize<T: serde::Serialize + std::fmt::Debug>(value: &T) -> Value {
    match serde_json::to_value(value) {
        Ok(json) => json,
        Err(e) => {
            tracing::warn!("⚠️ Audit value not serializable: {}", e);
            json!({
                "status": "error",
                "error": format!("Failed to serialize: {}", e),
                "truncated_data": truncate_chars(&format!("{:?}", value), TRUNCATED_DATA_LIMIT),
            })
        }
    }
}

/// Character-boundary-safe truncation
pub fn truncate_chars(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}
