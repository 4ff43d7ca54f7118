//! StateStore — redb-backed state persistence for Grayline.
//!
//! Provides typed CRUD operations over deployments, applications, and
//! diagnostic reports. All values are JSON-serialized into redb's `&[u8]`
//! value columns. The store supports both on-disk and in-memory backends
//! (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition, TableHandle};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

type Table = TableDefinition<'static, &'static str, &'static [u8]>;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(|e| StateError::Open(e.to_string()))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(|e| StateError::Open(e.to_string()))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(StateError::storage)?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(DEPLOYMENTS).map_err(StateError::storage)?;
        txn.open_table(APPLICATIONS).map_err(StateError::storage)?;
        txn.open_table(REPORTS).map_err(StateError::storage)?;
        txn.commit().map_err(StateError::storage)?;
        Ok(())
    }

    fn put<T: Serialize>(&self, table: Table, key: &str, value: &T) -> StateResult<()> {
        let bytes = serde_json::to_vec(value).map_err(|e| StateError::encode(table.name(), e))?;
        let txn = self.db.begin_write().map_err(StateError::storage)?;
        {
            let mut table = txn.open_table(table).map_err(StateError::storage)?;
            table
                .insert(key, bytes.as_slice())
                .map_err(StateError::storage)?;
        }
        txn.commit().map_err(StateError::storage)?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, table: Table, key: &str) -> StateResult<Option<T>> {
        let name = table.name().to_string();
        let txn = self.db.begin_read().map_err(StateError::storage)?;
        let table = txn.open_table(table).map_err(StateError::storage)?;
        match table.get(key).map_err(StateError::storage)? {
            Some(guard) => {
                let value = serde_json::from_slice(guard.value()).map_err(|e| StateError::decode(&name, e))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn scan<T: DeserializeOwned>(&self, table: Table) -> StateResult<Vec<T>> {
        let name = table.name().to_string();
        let txn = self.db.begin_read().map_err(StateError::storage)?;
        let table = txn.open_table(table).map_err(StateError::storage)?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(StateError::storage)? {
            let (_, value) = entry.map_err(StateError::storage)?;
            results.push(serde_json::from_slice(value.value()).map_err(|e| StateError::decode(&name, e))?);
        }
        Ok(results)
    }

    fn remove(&self, table: Table, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(StateError::storage)?;
        let existed;
        {
            let mut table = txn.open_table(table).map_err(StateError::storage)?;
            existed = table.remove(key).map_err(StateError::storage)?.is_some();
        }
        txn.commit().map_err(StateError::storage)?;
        Ok(existed)
    }

    // ── Deployments ────────────────────────────────────────────────

    /// Insert or update a deployment record.
    pub fn put_deployment(&self, record: &DeploymentRecord) -> StateResult<()> {
        self.put(DEPLOYMENTS, &record.id, record)?;
        debug!(deployment = %record.id, status = %record.status, "deployment stored");
        Ok(())
    }

    /// Get a deployment by id.
    pub fn get_deployment(&self, id: &str) -> StateResult<Option<DeploymentRecord>> {
        self.get(DEPLOYMENTS, id)
    }

    /// List all deployments, newest first.
    pub fn list_deployments(&self) -> StateResult<Vec<DeploymentRecord>> {
        let mut records: Vec<DeploymentRecord> = self.scan(DEPLOYMENTS)?;
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(records)
    }

    /// Filtered, paged listing, newest first.
    pub fn search_deployments(
        &self,
        filter: &DeploymentFilter,
    ) -> StateResult<Page<DeploymentRecord>> {
        let page = filter.page.max(1);
        let page_size = match filter.page_size {
            0 => DeploymentFilter::DEFAULT_PAGE_SIZE,
            n => n.min(DeploymentFilter::MAX_PAGE_SIZE),
        };

        let matching: Vec<DeploymentRecord> = self
            .list_deployments()?
            .into_iter()
            .filter(|r| filter.matches(r))
            .collect();
        let total = matching.len();
        let items = matching
            .into_iter()
            .skip((page - 1).saturating_mul(page_size))
            .take(page_size)
            .collect();

        Ok(Page {
            items,
            total,
            page,
            page_size,
        })
    }

    // ── Applications ───────────────────────────────────────────────

    /// Insert or update an application record.
    pub fn put_application(&self, app: &Application) -> StateResult<()> {
        self.put(APPLICATIONS, &app.name, app)?;
        debug!(app = %app.name, nodes = app.nodes.len(), "application stored");
        Ok(())
    }

    /// Get an application by name.
    pub fn get_application(&self, name: &str) -> StateResult<Option<Application>> {
        self.get(APPLICATIONS, name)
    }

    /// List all applications.
    pub fn list_applications(&self) -> StateResult<Vec<Application>> {
        self.scan(APPLICATIONS)
    }

    /// Delete an application by name. Returns true if it existed.
    pub fn delete_application(&self, name: &str) -> StateResult<bool> {
        self.remove(APPLICATIONS, name)
    }

    // ── Diagnostic reports ─────────────────────────────────────────

    /// Insert or update a diagnostic report (producer side).
    pub fn put_report(&self, report: &DiagnosticReport) -> StateResult<()> {
        self.put(REPORTS, &report.deployment_id, report)
    }

    /// Get the diagnostic report for a deployment.
    pub fn get_report(&self, deployment_id: &str) -> StateResult<Option<DiagnosticReport>> {
        self.get(REPORTS, deployment_id)
    }
}
