/// SQLite persistence layer for engine entities
///
/// Read-mostly lookups for devices, labels, flows, functions, and
/// integrations, plus the narrow "last execution status" writers the engine
/// uses as a side effect of running nodes. Flow definitions are stored as
/// JSON columns while lookup fields stay indexed.

use crate::flow::types::{Device, Edge, Flow, FlowNode, Function, Integration};
use anyhow::Result;
use sqlx::{sqlite::SqlitePool, Row};

/// SQLite-backed entity store
///
/// Holds the shared connection pool. Cloning is cheap; the pool is
/// internally reference counted.
#[derive(Debug, Clone)]
pub struct EntityStore {
    pool: SqlitePool,
}

impl EntityStore {
    /// Create new store instance with database connection
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Initialize the entity schema
    ///
    /// Safe to call multiple times (uses IF NOT EXISTS).
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS devices (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                dev_eui TEXT NOT NULL UNIQUE,
                status TEXT,
                expected_transmit_interval INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS labels (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS device_labels (
                device_id INTEGER NOT NULL REFERENCES devices(id),
                label_id INTEGER NOT NULL REFERENCES labels(id),
                PRIMARY KEY (device_id, label_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS flows (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                nodes JSON,
                edges JSON,
                status TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS functions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                code TEXT,
                status TEXT NOT NULL DEFAULT 'inactive'
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS integrations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                type TEXT NOT NULL,
                config JSON NOT NULL,
                status TEXT NOT NULL DEFAULT 'inactive'
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_devices_dev_eui ON devices(dev_eui)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Look up a device by its EUI (stored uppercase)
    pub async fn get_device_by_eui(&self, dev_eui: &str) -> Result<Option<Device>> {
        let row = sqlx::query(
            "SELECT id, name, dev_eui, status, expected_transmit_interval FROM devices WHERE dev_eui = ?",
        )
        .bind(dev_eui)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| Device {
            id: row.get("id"),
            name: row.get("name"),
            dev_eui: row.get("dev_eui"),
            status: row.get("status"),
            expected_transmit_interval: row.get("expected_transmit_interval"),
        }))
    }

    /// Label ids associated with a device
    pub async fn label_ids_for_device(&self, device_id: i64) -> Result<Vec<i64>> {
        let rows = sqlx::query("SELECT label_id FROM device_labels WHERE device_id = ?")
            .bind(device_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.iter().map(|row| row.get("label_id")).collect())
    }

    /// Retrieve a flow by ID
    pub async fn get_flow(&self, id: i64) -> Result<Option<Flow>> {
        let row = sqlx::query("SELECT id, name, nodes, edges, status FROM flows WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(flow_from_row(&row)?)),
            None => Ok(None),
        }
    }

    /// Load all flows in storage order
    ///
    /// The ingest boundary scans these against each inbound event to build
    /// the candidate set before the engine is invoked per flow.
    pub async fn list_flows(&self) -> Result<Vec<Flow>> {
        let rows = sqlx::query("SELECT id, name, nodes, edges, status FROM flows ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        let mut flows = Vec::new();
        for row in rows {
            flows.push(flow_from_row(&row)?);
        }
        Ok(flows)
    }

    /// Retrieve a stored Lua function by ID
    pub async fn get_function(&self, id: i64) -> Result<Option<Function>> {
        let row = sqlx::query("SELECT id, name, code, status FROM functions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| Function {
            id: row.get("id"),
            name: row.get("name"),
            code: row.get("code"),
            status: row.get("status"),
        }))
    }

    /// Retrieve an integration by ID
    pub async fn get_integration(&self, id: i64) -> Result<Option<Integration>> {
        let row = sqlx::query("SELECT id, name, type, config, status FROM integrations WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let config_json: String = row.get("config");
                Ok(Some(Integration {
                    id: row.get("id"),
                    name: row.get("name"),
                    kind: row.get("type"),
                    config: serde_json::from_str(&config_json)?,
                    status: row.get("status"),
                }))
            }
            None => Ok(None),
        }
    }

    /// Narrow last-execution-status writer for flows
    pub async fn update_flow_status(&self, id: i64, status: &str) -> Result<()> {
        sqlx::query("UPDATE flows SET status = ? WHERE id = ?")
            .bind(status)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Narrow last-execution-status writer for functions
    pub async fn update_function_status(&self, id: i64, status: &str) -> Result<()> {
        sqlx::query("UPDATE functions SET status = ? WHERE id = ?")
            .bind(status)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Narrow last-execution-status writer for integrations
    pub async fn update_integration_status(&self, id: i64, status: &str) -> Result<()> {
        sqlx::query("UPDATE integrations SET status = ? WHERE id = ?")
            .bind(status)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Narrow status writer for devices (online/offline transitions)
    pub async fn update_device_status(&self, id: i64, status: &str) -> Result<()> {
        sqlx::query("UPDATE devices SET status = ? WHERE id = ?")
            .bind(status)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Store a device, returning its id
    pub async fn save_device(
        &self,
        name: &str,
        dev_eui: &str,
        expected_transmit_interval: Option<i64>,
    ) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO devices (name, dev_eui, status, expected_transmit_interval) VALUES (?, ?, 'never_seen', ?)",
        )
        .bind(name)
        .bind(dev_eui.to_uppercase())
        .bind(expected_transmit_interval)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Store a label, returning its id
    pub async fn save_label(&self, name: &str) -> Result<i64> {
        let result = sqlx::query("INSERT INTO labels (name) VALUES (?)")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(result.last_insert_rowid())
    }

    /// Associate a label with a device
    pub async fn attach_label(&self, device_id: i64, label_id: i64) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO device_labels (device_id, label_id) VALUES (?, ?)")
            .bind(device_id)
            .bind(label_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Store a flow definition, returning its id
    pub async fn save_flow(&self, name: &str, nodes: &[FlowNode], edges: &[Edge]) -> Result<i64> {
        let result = sqlx::query("INSERT INTO flows (name, nodes, edges) VALUES (?, ?, ?)")
            .bind(name)
            .bind(serde_json::to_string(nodes)?)
            .bind(serde_json::to_string(edges)?)
            .execute(&self.pool)
            .await?;
        Ok(result.last_insert_rowid())
    }

    /// Store a Lua function, returning its id
    pub async fn save_function(&self, name: &str, code: &str) -> Result<i64> {
        let result = sqlx::query("INSERT INTO functions (name, code) VALUES (?, ?)")
            .bind(name)
            .bind(code)
            .execute(&self.pool)
            .await?;
        Ok(result.last_insert_rowid())
    }

    /// Store an integration, returning its id
    pub async fn save_integration(
        &self,
        name: &str,
        kind: &str,
        config: &serde_json::Value,
    ) -> Result<i64> {
        let result = sqlx::query("INSERT INTO integrations (name, type, config) VALUES (?, ?, ?)")
            .bind(name)
            .bind(kind)
            .bind(serde_json::to_string(config)?)
            .execute(&self.pool)
            .await?;
        Ok(result.last_insert_rowid())
    }
}

fn flow_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Flow> {
    let nodes_json: Option<String> = row.get("nodes");
    let edges_json: Option<String> = row.get("edges");

    let nodes: Vec<FlowNode> = match nodes_json {
        Some(json) => serde_json::from_str(&json)?,
        None => Vec::new(),
    };
    let edges: Vec<Edge> = match edges_json {
        Some(json) => serde_json::from_str(&json)?,
        None => Vec::new(),
    };

    Ok(Flow {
        id: row.get("id"),
        name: row.get("name"),
        nodes,
        edges,
        status: row.get("status"),
    })
}
