//! Schema & Entry Processor
//!
//! Owns the shared three-table schema and everything written to or read
//! from it: integrity checking and repair, entry CRUD with optimistic
//! locking, and metadata read/replace. All SQL is generated here, with
//! identifiers escaped through the dialect catalog and every value bound as
//! a parameter.
//!
//! The version counter on the `ENTRY` row is the sole conflict-detection
//! token. An update only succeeds when the local copy's version is at least
//! the shared one; equal versions proceed, so the last committer among
//! equal-version writers wins. Every client of the same shared schema must
//! follow the same rule to interoperate.

use std::collections::{BTreeMap, HashSet};

use sqlx::Row;

use crate::dialect::{Dialect, REQUIRED_TABLES};
use crate::entry::BibEntry;
use crate::error::{Error, Result};
use crate::gateway::{QueryGateway, SqlValue};

const ENTRY_TABLE: &str = "ENTRY";
const FIELD_TABLE: &str = "FIELD";
const METADATA_TABLE: &str = "METADATA";

const SHARED_ID: &str = "SHARED_ID";
const ENTRY_TYPE: &str = "TYPE";
const VERSION: &str = "VERSION";
const ENTRY_SHARED_ID: &str = "ENTRY_SHARED_ID";
const FIELD_NAME: &str = "NAME";
const FIELD_VALUE: &str = "VALUE";
const METADATA_KEY: &str = "KEY";
const METADATA_VALUE: &str = "VALUE";

/// Processes all entry and metadata traffic to one shared database and
/// manages its structure
pub struct DbProcessor {
    gateway: QueryGateway,
}

impl DbProcessor {
    pub fn new(gateway: QueryGateway) -> Self {
        Self { gateway }
    }

    /// Dialect of the underlying connection
    pub fn dialect(&self) -> Dialect {
        self.gateway.dialect()
    }

    /// Release the underlying gateway, e.g. to close the connection
    pub fn into_gateway(self) -> QueryGateway {
        self.gateway
    }

    /// Cheap liveness probe of the underlying connection
    pub async fn ping(&mut self) -> Result<()> {
        self.gateway.ping().await
    }

    /// Scan the database for the required tables.
    ///
    /// Column-level structure is not checked here; the schema DDL is the
    /// authority for that.
    pub async fn check_base_integrity(&mut self) -> Result<bool> {
        let tables: HashSet<String> = self
            .gateway
            .table_names()
            .await?
            .into_iter()
            .map(|name| name.to_uppercase())
            .collect();

        Ok(REQUIRED_TABLES.iter().all(|spec| tables.contains(spec.name)))
    }

    /// Create the required tables if they are missing. Idempotent.
    pub async fn set_up_shared_database(&mut self) -> Result<()> {
        for statement in self.dialect().create_schema_sql() {
            self.gateway.execute(statement).await?;
        }

        if !self.check_base_integrity().await? {
            // can only happen through direct manual intervention on the
            // shared side; nothing left to do about it from here
            tracing::error!("shared database structure is corrupt after setup");
        }
        Ok(())
    }

    /// Insert an entry into the shared database and assign the generated id
    /// (and version 1) back onto it.
    ///
    /// An entry whose shared id is already present is skipped silently, so
    /// duplicate propagation of the same insert is harmless.
    pub async fn insert_entry(&mut self, entry: &mut BibEntry) -> Result<()> {
        if entry.has_shared_id() && self.entry_exists(entry.shared_id()).await? {
            tracing::debug!(shared_id = entry.shared_id(), "entry already shared, skipping insert");
            return Ok(());
        }

        self.gateway.begin().await?;
        match self.insert_entry_in_tx(entry).await {
            Ok(shared_id) => {
                self.commit_or_roll_back().await?;
                entry.set_shared_id(shared_id);
                entry.set_version(1);
                Ok(())
            }
            Err(err) => {
                self.rollback_after(&err).await;
                Err(err)
            }
        }
    }

    async fn insert_entry_in_tx(&mut self, entry: &BibEntry) -> Result<i64> {
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.escape(ENTRY_TABLE),
            self.escape(ENTRY_TYPE),
            self.placeholder(1),
        );
        let shared_id = self
            .gateway
            .insert_returning_id(&sql, &[SqlValue::text(entry.entry_type())], SHARED_ID)
            .await?;

        let field_sql = format!(
            "INSERT INTO {} ({}, {}, {}) VALUES ({}, {}, {})",
            self.escape(FIELD_TABLE),
            self.escape(ENTRY_SHARED_ID),
            self.escape(FIELD_NAME),
            self.escape(FIELD_VALUE),
            self.placeholder(1),
            self.placeholder(2),
            self.placeholder(3),
        );
        for (name, value) in entry.fields() {
            self.gateway
                .execute_with(
                    &field_sql,
                    &[
                        SqlValue::int(shared_id),
                        SqlValue::text(name.as_str()),
                        SqlValue::text(value.as_str()),
                    ],
                )
                .await?;
        }

        Ok(shared_id)
    }

    /// Update the shared copy of `local_entry`, guarded by the version
    /// counter.
    ///
    /// Runs in one transaction. On success the shared version is incremented
    /// by exactly one and written back onto `local_entry`. A stale local
    /// copy rolls back completely and fails with [`Error::OfflineLock`]
    /// carrying both sides; an entry deleted on the shared side fails with
    /// [`Error::EntryNotPresent`].
    pub async fn update_entry(&mut self, local_entry: &mut BibEntry) -> Result<()> {
        self.gateway.begin().await?;
        match self.update_entry_in_tx(local_entry).await {
            Ok(new_version) => {
                self.commit_or_roll_back().await?;
                local_entry.set_version(new_version);
                Ok(())
            }
            Err(err) => {
                self.rollback_after(&err).await;
                Err(err)
            }
        }
    }

    async fn update_entry_in_tx(&mut self, local_entry: &BibEntry) -> Result<i64> {
        let shared_id = local_entry.shared_id();
        let shared_entry = self.shared_entry(shared_id).await?.ok_or_else(|| {
            Error::EntryNotPresent {
                entry: Box::new(local_entry.clone()),
            }
        })?;

        // remove shared fields which no longer exist locally
        let delete_sql = format!(
            "DELETE FROM {} WHERE {} = {} AND {} = {}",
            self.escape(FIELD_TABLE),
            self.escape(FIELD_NAME),
            self.placeholder(1),
            self.escape(ENTRY_SHARED_ID),
            self.placeholder(2),
        );
        let removed: Vec<String> = shared_entry
            .field_names()
            .filter(|name| local_entry.field(name).is_none())
            .map(String::from)
            .collect();
        for name in removed {
            self.gateway
                .execute_with(&delete_sql, &[SqlValue::text(name), SqlValue::int(shared_id)])
                .await?;
        }

        if local_entry.version() < shared_entry.version() {
            return Err(Error::OfflineLock {
                local: Box::new(local_entry.clone()),
                shared: Box::new(shared_entry),
            });
        }

        for (name, value) in local_entry.fields() {
            if self.field_exists(shared_id, name).await? {
                let sql = format!(
                    "UPDATE {} SET {} = {} WHERE {} = {} AND {} = {}",
                    self.escape(FIELD_TABLE),
                    self.escape(FIELD_VALUE),
                    self.placeholder(1),
                    self.escape(FIELD_NAME),
                    self.placeholder(2),
                    self.escape(ENTRY_SHARED_ID),
                    self.placeholder(3),
                );
                self.gateway
                    .execute_with(
                        &sql,
                        &[
                            SqlValue::text(value.as_str()),
                            SqlValue::text(name.as_str()),
                            SqlValue::int(shared_id),
                        ],
                    )
                    .await?;
            } else {
                let sql = format!(
                    "INSERT INTO {} ({}, {}, {}) VALUES ({}, {}, {})",
                    self.escape(FIELD_TABLE),
                    self.escape(ENTRY_SHARED_ID),
                    self.escape(FIELD_NAME),
                    self.escape(FIELD_VALUE),
                    self.placeholder(1),
                    self.placeholder(2),
                    self.placeholder(3),
                );
                self.gateway
                    .execute_with(
                        &sql,
                        &[
                            SqlValue::int(shared_id),
                            SqlValue::text(name.as_str()),
                            SqlValue::text(value.as_str()),
                        ],
                    )
                    .await?;
            }
        }

        // type and version bump in one statement
        let sql = format!(
            "UPDATE {} SET {} = {}, {} = {} + 1 WHERE {} = {}",
            self.escape(ENTRY_TABLE),
            self.escape(ENTRY_TYPE),
            self.placeholder(1),
            self.escape(VERSION),
            self.escape(VERSION),
            self.escape(SHARED_ID),
            self.placeholder(2),
        );
        self.gateway
            .execute_with(
                &sql,
                &[
                    SqlValue::text(local_entry.entry_type()),
                    SqlValue::int(shared_id),
                ],
            )
            .await?;

        Ok(shared_entry.version() + 1)
    }

    /// Delete the shared copy of an entry; its field rows cascade
    pub async fn remove_entry(&mut self, entry: &BibEntry) -> Result<()> {
        let sql = format!(
            "DELETE FROM {} WHERE {} = {}",
            self.escape(ENTRY_TABLE),
            self.escape(SHARED_ID),
            self.placeholder(1),
        );
        self.gateway
            .execute_with(&sql, &[SqlValue::int(entry.shared_id())])
            .await?;
        Ok(())
    }

    /// Fetch one entry with all its fields
    pub async fn shared_entry(&mut self, shared_id: i64) -> Result<Option<BibEntry>> {
        Ok(self.fetch_entries(Some(shared_id)).await?.pop())
    }

    /// Fetch all entries with their fields, ordered by shared id
    pub async fn shared_entries(&mut self) -> Result<Vec<BibEntry>> {
        self.fetch_entries(None).await
    }

    async fn fetch_entries(&mut self, shared_id: Option<i64>) -> Result<Vec<BibEntry>> {
        let mut sql = format!(
            "SELECT {}, {}, {} FROM {}",
            self.escape(SHARED_ID),
            self.escape(ENTRY_TYPE),
            self.escape(VERSION),
            self.escape(ENTRY_TABLE),
        );
        let mut params = Vec::new();
        if let Some(shared_id) = shared_id {
            sql.push_str(&format!(
                " WHERE {} = {}",
                self.escape(SHARED_ID),
                self.placeholder(1),
            ));
            params.push(SqlValue::int(shared_id));
        }
        sql.push_str(&format!(" ORDER BY {}", self.escape(SHARED_ID)));

        let rows = self.gateway.fetch_all_with(&sql, &params).await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let shared_id: i64 = row.try_get(0)?;
            let entry_type: Option<String> = row.try_get(1)?;
            let version: Option<i64> = row.try_get(2)?;

            let mut entry = BibEntry::new(entry_type.unwrap_or_default());
            entry.set_shared_id(shared_id);
            entry.set_version(version.unwrap_or(1));
            self.load_fields(&mut entry).await?;
            entries.push(entry);
        }

        Ok(entries)
    }

    async fn load_fields(&mut self, entry: &mut BibEntry) -> Result<()> {
        let sql = format!(
            "SELECT {}, {} FROM {} WHERE {} = {}",
            self.escape(FIELD_NAME),
            self.escape(FIELD_VALUE),
            self.escape(FIELD_TABLE),
            self.escape(ENTRY_SHARED_ID),
            self.placeholder(1),
        );
        let rows = self
            .gateway
            .fetch_all_with(&sql, &[SqlValue::int(entry.shared_id())])
            .await?;

        for row in rows {
            let name: String = row.try_get(0)?;
            // a NULL value means the field is unset; pruned on read
            if let Some(value) = row.try_get::<Option<String>, _>(1)? {
                entry.set_field(&name, value);
            }
        }
        Ok(())
    }

    /// Mapping from shared id to version for every entry, without field
    /// data. Lets the synchronizer decide which entries need a full fetch.
    pub async fn id_version_mapping(&mut self) -> Result<BTreeMap<i64, i64>> {
        let sql = format!(
            "SELECT {}, {} FROM {} ORDER BY {}",
            self.escape(SHARED_ID),
            self.escape(VERSION),
            self.escape(ENTRY_TABLE),
            self.escape(SHARED_ID),
        );
        let rows = self.gateway.fetch_all_with(&sql, &[]).await?;

        let mut mapping = BTreeMap::new();
        for row in rows {
            let shared_id: i64 = row.try_get(0)?;
            let version: Option<i64> = row.try_get(1)?;
            mapping.insert(shared_id, version.unwrap_or(1));
        }
        Ok(mapping)
    }

    /// Fetch all shared metadata
    pub async fn shared_metadata(&mut self) -> Result<BTreeMap<String, String>> {
        let sql = format!(
            "SELECT {}, {} FROM {}",
            self.escape(METADATA_KEY),
            self.escape(METADATA_VALUE),
            self.escape(METADATA_TABLE),
        );
        let rows = self.gateway.fetch_all_with(&sql, &[]).await?;

        let mut data = BTreeMap::new();
        for row in rows {
            let key: String = row.try_get(0)?;
            let value: String = row.try_get(1)?;
            data.insert(key, value);
        }
        Ok(data)
    }

    /// Replace all shared metadata with `data` in one transaction.
    ///
    /// Metadata has no versioning and no conflict detection; the last writer
    /// wins unconditionally.
    pub async fn set_shared_metadata(&mut self, data: &BTreeMap<String, String>) -> Result<()> {
        self.gateway.begin().await?;
        match self.replace_metadata_in_tx(data).await {
            Ok(()) => self.commit_or_roll_back().await,
            Err(err) => {
                self.rollback_after(&err).await;
                Err(err)
            }
        }
    }

    async fn replace_metadata_in_tx(&mut self, data: &BTreeMap<String, String>) -> Result<()> {
        // DELETE rather than TRUNCATE: portable, and MySQL's TRUNCATE would
        // commit the surrounding transaction
        let clear_sql = format!("DELETE FROM {}", self.escape(METADATA_TABLE));
        self.gateway.execute(&clear_sql).await?;

        let insert_sql = format!(
            "INSERT INTO {} ({}, {}) VALUES ({}, {})",
            self.escape(METADATA_TABLE),
            self.escape(METADATA_KEY),
            self.escape(METADATA_VALUE),
            self.placeholder(1),
            self.placeholder(2),
        );
        for (key, value) in data {
            self.gateway
                .execute_with(
                    &insert_sql,
                    &[SqlValue::text(key.as_str()), SqlValue::text(value.as_str())],
                )
                .await?;
        }
        Ok(())
    }

    async fn entry_exists(&mut self, shared_id: i64) -> Result<bool> {
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = {}",
            self.escape(SHARED_ID),
            self.escape(ENTRY_TABLE),
            self.escape(SHARED_ID),
            self.placeholder(1),
        );
        Ok(self
            .gateway
            .fetch_optional_with(&sql, &[SqlValue::int(shared_id)])
            .await?
            .is_some())
    }

    async fn field_exists(&mut self, shared_id: i64, name: &str) -> Result<bool> {
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = {} AND {} = {}",
            self.escape(FIELD_NAME),
            self.escape(FIELD_TABLE),
            self.escape(FIELD_NAME),
            self.placeholder(1),
            self.escape(ENTRY_SHARED_ID),
            self.placeholder(2),
        );
        Ok(self
            .gateway
            .fetch_optional_with(&sql, &[SqlValue::text(name), SqlValue::int(shared_id)])
            .await?
            .is_some())
    }

    async fn commit_or_roll_back(&mut self) -> Result<()> {
        match self.gateway.commit().await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.rollback_after(&err).await;
                Err(err)
            }
        }
    }

    async fn rollback_after(&mut self, cause: &Error) {
        if let Err(rollback_err) = self.gateway.rollback().await {
            tracing::error!(
                cause = %cause,
                error = %rollback_err,
                "rollback failed after aborted operation"
            );
        }
    }

    fn escape(&self, identifier: &str) -> String {
        self.gateway.dialect().escape(identifier)
    }

    fn placeholder(&self, index: usize) -> String {
        self.gateway.dialect().placeholder(index)
    }
}
