use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local, Timelike, Utc};
use metrics::counter;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::Result;

/// Completed and failed rows older than this many days are purged
const GC_WINDOW_DAYS: i64 = 7;

/// Local hour at which the daily purge runs
const GC_HOUR: u32 = 2;

/// Synchronization status of a queued operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Conflict,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::InProgress => "in_progress",
            SyncStatus::Completed => "completed",
            SyncStatus::Failed => "failed",
            SyncStatus::Conflict => "conflict",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(SyncStatus::Pending),
            "in_progress" => Some(SyncStatus::InProgress),
            "completed" => Some(SyncStatus::Completed),
            "failed" => Some(SyncStatus::Failed),
            "conflict" => Some(SyncStatus::Conflict),
            _ => None,
        }
    }
}

/// Kinds of write operations that can be queued
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Create,
    Update,
    Delete,
    BulkCreate,
    BulkUpdate,
    BulkDelete,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Create => "create",
            OperationType::Update => "update",
            OperationType::Delete => "delete",
            OperationType::BulkCreate => "bulk_create",
            OperationType::BulkUpdate => "bulk_update",
            OperationType::BulkDelete => "bulk_delete",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(OperationType::Create),
            "update" => Some(OperationType::Update),
            "delete" => Some(OperationType::Delete),
            "bulk_create" => Some(OperationType::BulkCreate),
            "bulk_update" => Some(OperationType::BulkUpdate),
            "bulk_delete" => Some(OperationType::BulkDelete),
            _ => None,
        }
    }
}

/// A write operation waiting for the panel to come back
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct QueuedOperation {
    pub id: Uuid,
    pub operation_type: OperationType,
    pub resource_type: String,
    pub resource_id: Option<String>,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub status: SyncStatus,
    pub error_message: Option<String>,
}

impl QueuedOperation {
    pub fn new(
        operation_type: OperationType,
        resource_type: impl Into<String>,
        data: serde_json::Value,
        resource_id: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            operation_type,
            resource_type: resource_type.into(),
            resource_id,
            data,
            created_at: Utc::now(),
            retry_count: 0,
            max_retries: 3,
            status: SyncStatus::Pending,
            error_message: None,
        }
    }
}

/// Capability invoked to replay one queued operation against the panel
#[async_trait]
pub trait SyncHandler: Send + Sync {
    async fn sync(&self, operation: &QueuedOperation) -> Result<()>;
}

/// Synchronization statistics
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    pub total_operations: u64,
    pub pending_operations: u64,
    pub completed_operations: u64,
    pub failed_operations: u64,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub is_online: bool,
}

/// Result of draining the pending queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    pub synced: u64,
    pub failed: u64,
}

/// Offline queue configuration
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub db_path: PathBuf,
    pub sync_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("cache/offline.db"),
            sync_interval: Duration::from_secs(60),
        }
    }
}

struct QueueInner {
    conn: Mutex<Connection>,
    stats: Mutex<SyncStats>,
    handlers: tokio::sync::RwLock<HashMap<String, Arc<dyn SyncHandler>>>,
    online: AtomicBool,
}

/// Durable FIFO of pending panel writes.
///
/// Rows are replayed per resource type in `created_at` order by the sync
/// loop. The SQLite file is single-writer; the connection mutex is never
/// held across a handler call.
pub struct OfflineQueue {
    inner: Arc<QueueInner>,
    sync_task: Mutex<Option<JoinHandle<()>>>,
}

impl OfflineQueue {
    pub fn open(config: QueueConfig) -> Result<Self> {
        if let Some(parent) = config.db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(&config.db_path)?;
        init_schema(&conn)?;

        let pending: u64 = conn.query_row(
            "SELECT COUNT(*) FROM queued_operations WHERE status = 'pending'",
            [],
            |row| row.get(0),
        )?;
        let total: u64 =
            conn.query_row("SELECT COUNT(*) FROM queued_operations", [], |row| row.get(0))?;

        let inner = Arc::new(QueueInner {
            conn: Mutex::new(conn),
            stats: Mutex::new(SyncStats {
                total_operations: total,
                pending_operations: pending,
                is_online: true,
                ..SyncStats::default()
            }),
            handlers: tokio::sync::RwLock::new(HashMap::new()),
            online: AtomicBool::new(true),
        });

        let loop_inner = Arc::clone(&inner);
        let interval = config.sync_interval;
        let sync_task = tokio::spawn(async move {
            sync_loop(loop_inner, interval).await;
        });

        info!(db = %config.db_path.display(), pending = pending, "Offline queue opened");
        Ok(Self {
            inner,
            sync_task: Mutex::new(Some(sync_task)),
        })
    }

    /// Register the replay capability for a resource type
    pub async fn register_sync_handler(&self, resource_type: &str, handler: Arc<dyn SyncHandler>) {
        let mut handlers = self.inner.handlers.write().await;
        handlers.insert(resource_type.to_string(), handler);
        debug!(resource_type = resource_type, "Sync handler registered");
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    /// Queue a new operation; when online it is synced immediately in the
    /// background
    pub async fn queue_operation(
        &self,
        operation_type: OperationType,
        resource_type: &str,
        data: serde_json::Value,
        resource_id: Option<String>,
    ) -> Result<Uuid> {
        let operation = QueuedOperation::new(operation_type, resource_type, data, resource_id);
        let id = operation.id;
        self.enqueue(operation).await?;
        Ok(id)
    }

    /// Insert an operation row; inserting an already-known id is a no-op
    pub async fn enqueue(&self, operation: QueuedOperation) -> Result<bool> {
        let inserted = {
            let conn = self.lock_conn();
            conn.execute(
                "INSERT OR IGNORE INTO queued_operations
                 (id, operation_type, resource_type, resource_id, data,
                  created_at, retry_count, max_retries, status, error_message)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    operation.id.to_string(),
                    operation.operation_type.as_str(),
                    operation.resource_type,
                    operation.resource_id,
                    operation.data.to_string(),
                    operation.created_at.timestamp_micros() as f64 / 1_000_000.0,
                    operation.retry_count,
                    operation.max_retries,
                    operation.status.as_str(),
                    operation.error_message,
                ],
            )? > 0
        };

        if !inserted {
            debug!(id = %operation.id, "Operation already queued, ignoring");
            return Ok(false);
        }

        {
            let mut stats = self.inner.stats.lock().expect("stats mutex poisoned");
            stats.total_operations += 1;
            stats.pending_operations += 1;
        }
        counter!("control_queue_operations_total", 1);

        info!(
            id = %operation.id,
            operation = operation.operation_type.as_str(),
            resource_type = %operation.resource_type,
            "Operation queued"
        );

        if self.is_online() {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                sync_single(&inner, operation).await;
            });
        }

        Ok(true)
    }

    /// Drain every pending operation in created_at order
    pub async fn sync_all_pending(&self) -> SyncOutcome {
        sync_all(&self.inner).await
    }

    /// Flip the online flag; going online triggers an immediate drain
    pub async fn set_online(&self, online: bool) {
        let was_online = self.inner.online.swap(online, Ordering::SeqCst);
        {
            let mut stats = self.inner.stats.lock().expect("stats mutex poisoned");
            stats.is_online = online;
        }

        if was_online == online {
            return;
        }

        if online {
            info!("Going online, draining queued operations");
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                sync_all(&inner).await;
            });
        } else {
            info!("Going offline, writes will be queued");
        }
    }

    /// Pending operations, optionally filtered by resource type
    pub async fn pending_operations(&self, resource_type: Option<&str>) -> Result<Vec<QueuedOperation>> {
        let conn = self.lock_conn();
        load_pending(&conn, resource_type)
    }

    /// Purge completed/failed rows older than the cutoff; returns removed count
    pub async fn clear_completed_operations(&self, older_than_days: i64) -> Result<u64> {
        let cutoff =
            (Utc::now() - chrono::Duration::days(older_than_days)).timestamp_micros() as f64
                / 1_000_000.0;
        let conn = self.lock_conn();

        let removed = conn.execute(
            "DELETE FROM queued_operations
             WHERE status IN ('completed', 'failed') AND created_at < ?1",
            params![cutoff],
        )? as u64;

        if removed > 0 {
            info!(removed = removed, "Purged old queue rows");
        }
        Ok(removed)
    }

    pub fn stats(&self) -> SyncStats {
        self.inner.stats.lock().expect("stats mutex poisoned").clone()
    }

    pub async fn operation(&self, id: Uuid) -> Result<Option<QueuedOperation>> {
        let conn = self.lock_conn();
        let row = conn
            .query_row(
                "SELECT id, operation_type, resource_type, resource_id, data,
                        created_at, retry_count, max_retries, status, error_message
                 FROM queued_operations WHERE id = ?1",
                params![id.to_string()],
                row_to_operation,
            )
            .optional()?;
        Ok(row)
    }

    /// Stop the sync loop
    pub async fn close(&self) {
        let task = self.sync_task.lock().expect("task mutex poisoned").take();
        if let Some(task) = task {
            task.abort();
        }
        info!("Offline queue closed");
    }

    fn lock_conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.inner.conn.lock().expect("queue mutex poisoned")
    }
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS queued_operations (
            id TEXT PRIMARY KEY,
            operation_type TEXT NOT NULL,
            resource_type TEXT NOT NULL,
            resource_id TEXT,
            data TEXT NOT NULL,
            created_at REAL NOT NULL,
            retry_count INTEGER DEFAULT 0,
            max_retries INTEGER DEFAULT 3,
            status TEXT DEFAULT 'pending',
            error_message TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_status ON queued_operations(status);
        CREATE INDEX IF NOT EXISTS idx_resource_type ON queued_operations(resource_type);
        CREATE INDEX IF NOT EXISTS idx_created_at ON queued_operations(created_at);",
    )?;
    Ok(())
}

fn row_to_operation(row: &rusqlite::Row<'_>) -> rusqlite::Result<QueuedOperation> {
    let id: String = row.get(0)?;
    let operation_type: String = row.get(1)?;
    let data: String = row.get(4)?;
    let created_at: f64 = row.get(5)?;
    let status: String = row.get(8)?;

    Ok(QueuedOperation {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        operation_type: OperationType::parse(&operation_type).unwrap_or(OperationType::Create),
        resource_type: row.get(2)?,
        resource_id: row.get(3)?,
        data: serde_json::from_str(&data).unwrap_or(serde_json::Value::Null),
        created_at: DateTime::from_timestamp_micros((created_at * 1_000_000.0) as i64)
            .unwrap_or_else(Utc::now),
        retry_count: row.get(6)?,
        max_retries: row.get(7)?,
        status: SyncStatus::parse(&status).unwrap_or(SyncStatus::Pending),
        error_message: row.get(9)?,
    })
}

fn load_pending(conn: &Connection, resource_type: Option<&str>) -> Result<Vec<QueuedOperation>> {
    let mut operations = Vec::new();

    match resource_type {
        Some(resource_type) => {
            let mut stmt = conn.prepare(
                "SELECT id, operation_type, resource_type, resource_id, data,
                        created_at, retry_count, max_retries, status, error_message
                 FROM queued_operations
                 WHERE status = 'pending' AND resource_type = ?1
                 ORDER BY created_at ASC",
            )?;
            let rows = stmt.query_map(params![resource_type], row_to_operation)?;
            for row in rows {
                operations.push(row?);
            }
        }
        None => {
            let mut stmt = conn.prepare(
                "SELECT id, operation_type, resource_type, resource_id, data,
                        created_at, retry_count, max_retries, status, error_message
                 FROM queued_operations
                 WHERE status = 'pending'
                 ORDER BY created_at ASC",
            )?;
            let rows = stmt.query_map([], row_to_operation)?;
            for row in rows {
                operations.push(row?);
            }
        }
    }

    Ok(operations)
}

fn update_status(
    inner: &QueueInner,
    id: Uuid,
    status: SyncStatus,
    retry_count: Option<u32>,
    error_message: Option<&str>,
) -> Result<()> {
    let conn = inner.conn.lock().expect("queue mutex poisoned");
    match retry_count {
        Some(retry_count) => {
            conn.execute(
                "UPDATE queued_operations
                 SET status = ?1, retry_count = ?2, error_message = ?3
                 WHERE id = ?4",
                params![status.as_str(), retry_count, error_message, id.to_string()],
            )?;
        }
        None => {
            conn.execute(
                "UPDATE queued_operations SET status = ?1 WHERE id = ?2",
                params![status.as_str(), id.to_string()],
            )?;
        }
    }
    Ok(())
}

/// Replay one operation through its handler; returns true on success
async fn sync_single(inner: &QueueInner, mut operation: QueuedOperation) -> bool {
    let handler = {
        let handlers = inner.handlers.read().await;
        handlers.get(&operation.resource_type).cloned()
    };

    let handler = match handler {
        Some(handler) => handler,
        None => {
            error!(
                resource_type = %operation.resource_type,
                "No sync handler registered"
            );
            return false;
        }
    };

    if let Err(e) = update_status(inner, operation.id, SyncStatus::InProgress, None, None) {
        error!(id = %operation.id, error = %e, "Failed to mark operation in progress");
        return false;
    }

    match handler.sync(&operation).await {
        Ok(()) => {
            if let Err(e) = update_status(inner, operation.id, SyncStatus::Completed, None, None) {
                error!(id = %operation.id, error = %e, "Failed to mark operation completed");
            }
            {
                let mut stats = inner.stats.lock().expect("stats mutex poisoned");
                stats.completed_operations += 1;
                stats.pending_operations = stats.pending_operations.saturating_sub(1);
            }
            counter!("control_queue_synced_total", 1);
            info!(id = %operation.id, "Operation synced");
            true
        }
        Err(e) => {
            operation.retry_count += 1;
            let message = e.to_string();

            if operation.retry_count >= operation.max_retries {
                warn!(
                    id = %operation.id,
                    retries = operation.retry_count,
                    error = %message,
                    "Operation failed permanently"
                );
                let _ = update_status(
                    inner,
                    operation.id,
                    SyncStatus::Failed,
                    Some(operation.retry_count),
                    Some(&message),
                );
                let mut stats = inner.stats.lock().expect("stats mutex poisoned");
                stats.failed_operations += 1;
                stats.pending_operations = stats.pending_operations.saturating_sub(1);
                counter!("control_queue_failed_total", 1);
            } else {
                debug!(
                    id = %operation.id,
                    retries = operation.retry_count,
                    error = %message,
                    "Operation failed, will retry"
                );
                let _ = update_status(
                    inner,
                    operation.id,
                    SyncStatus::Pending,
                    Some(operation.retry_count),
                    Some(&message),
                );
            }
            false
        }
    }
}

async fn sync_all(inner: &QueueInner) -> SyncOutcome {
    if !inner.online.load(Ordering::SeqCst) {
        warn!("Cannot sync while offline");
        return SyncOutcome::default();
    }

    let operations = {
        let conn = inner.conn.lock().expect("queue mutex poisoned");
        match load_pending(&conn, None) {
            Ok(ops) => ops,
            Err(e) => {
                error!(error = %e, "Failed to load pending operations");
                return SyncOutcome::default();
            }
        }
    };

    let mut outcome = SyncOutcome::default();
    for operation in operations {
        if sync_single(inner, operation).await {
            outcome.synced += 1;
        } else {
            outcome.failed += 1;
        }
    }

    {
        let mut stats = inner.stats.lock().expect("stats mutex poisoned");
        stats.last_sync_time = Some(Utc::now());
    }

    if outcome.synced > 0 || outcome.failed > 0 {
        info!(synced = outcome.synced, failed = outcome.failed, "Sync pass finished");
    }
    outcome
}

/// Background loop: periodic drain plus a daily purge at the GC hour
async fn sync_loop(inner: Arc<QueueInner>, interval: Duration) {
    let mut last_gc_day: Option<chrono::NaiveDate> = None;
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        ticker.tick().await;

        let pending = {
            let stats = inner.stats.lock().expect("stats mutex poisoned");
            stats.pending_operations
        };

        if inner.online.load(Ordering::SeqCst) && pending > 0 {
            sync_all(&inner).await;
        }

        let now = Local::now();
        if now.hour() == GC_HOUR && last_gc_day != Some(now.date_naive()) {
            last_gc_day = Some(now.date_naive());
            let cutoff = (Utc::now() - chrono::Duration::days(GC_WINDOW_DAYS)).timestamp_micros()
                as f64
                / 1_000_000.0;
            let conn = inner.conn.lock().expect("queue mutex poisoned");
            match conn.execute(
                "DELETE FROM queued_operations
                 WHERE status IN ('completed', 'failed') AND created_at < ?1",
                params![cutoff],
            ) {
                Ok(removed) if removed > 0 => info!(removed = removed, "Daily queue purge"),
                Ok(_) => {}
                Err(e) => error!(error = %e, "Daily queue purge failed"),
            }
        }
    }
}
