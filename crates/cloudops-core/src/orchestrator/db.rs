//! Persistent storage for actions and their audit log using redb.
//!
//! # Table design
//!
//! ```text
//! actions           [ created_at_ms: u64 BE | uuid ] → JSON Action
//! action_keys       uuid                             → actions key
//! action_logs       [ created_at_ms: u64 BE | uuid ] → JSON ActionLogEntry
//! action_log_index  uuid (action)                    ⇉ action_logs key
//! live_actions      actions key                      → ()  (non-terminal only)
//! completed_actions [ completed_at_ms | uuid ]       → actions key
//! ```
//!
//! Because the timestamp occupies the high bytes in big-endian encoding, byte
//! ordering equals timestamp ordering: a scan of `actions` yields oldest
//! created first, and log retention is a single range scan. Dispatch reads
//! only `live_actions` and retention only a prefix of `completed_actions`, so
//! neither decodes finished actions it does not touch.
//!
//! Every mutation runs inside one write transaction that re-reads the record
//! and checks the caller's expectation before writing. redb admits a single
//! writer at a time, so the check and the write are atomic with respect to
//! other runners sharing the file. The file itself is locked to one process.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use redb::{
    Database, MultimapTableDefinition, ReadableMultimapTable, ReadableTable, TableDefinition,
};
use uuid::Uuid;

use crate::error::{EngineError, Result};

use super::action::{Action, ActionLogEntry, ActionStatus};

// ---------------------------------------------------------------------------
// Table definitions
// ---------------------------------------------------------------------------

const ACTIONS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("actions");
const ACTION_KEYS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("action_keys");
const LOGS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("action_logs");
const LOG_INDEX: MultimapTableDefinition<&[u8], &[u8]> =
    MultimapTableDefinition::new("action_log_index");
const LIVE: TableDefinition<&[u8], ()> = TableDefinition::new("live_actions");
const COMPLETED: TableDefinition<&[u8], &[u8]> = TableDefinition::new("completed_actions");

// ---------------------------------------------------------------------------
// Key helpers
// ---------------------------------------------------------------------------

fn time_key(ts: DateTime<Utc>, id: Uuid) -> [u8; 24] {
    let mut key = [0u8; 24];
    let ms = ts.timestamp_millis().max(0) as u64;
    key[..8].copy_from_slice(&ms.to_be_bytes());
    key[8..].copy_from_slice(id.as_bytes());
    key
}

/// Exclusive upper bound selecting every key strictly older than `ts`.
fn older_than(ts: DateTime<Utc>) -> [u8; 24] {
    let mut key = [0u8; 24];
    let ms = ts.timestamp_millis().max(0) as u64;
    key[..8].copy_from_slice(&ms.to_be_bytes());
    key
}

fn db_err(e: impl std::fmt::Display) -> EngineError {
    EngineError::Db(e.to_string())
}

/// The action id embedded in an `actions` key.
fn key_id(key: &[u8]) -> Result<Uuid> {
    key.get(8..)
        .and_then(|b| Uuid::from_slice(b).ok())
        .ok_or_else(|| EngineError::Db("malformed action key".to_string()))
}

/// Run store work on the blocking pool. redb commits synchronously, so async
/// callers must not run transactions on an executor thread.
pub async fn with_store<T, F>(db: &Arc<ActionDb>, f: F) -> Result<T>
where
    F: FnOnce(&ActionDb) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let db = Arc::clone(db);
    tokio::task::spawn_blocking(move || f(&db))
        .await
        .map_err(|e| EngineError::Db(format!("store task failed: {e}")))?
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// Conditions under which a runner may take ownership of an action.
#[derive(Debug, Clone, Copy)]
pub struct ClaimRequest {
    pub now: DateTime<Utc>,
    /// Running actions whose heartbeat is older than this are presumed orphaned.
    pub stale_before: DateTime<Utc>,
    pub max_attempts: u32,
    /// Ignore `scheduled_for` (manual run-now).
    pub force: bool,
}

impl ClaimRequest {
    pub fn admits(&self, action: &Action) -> bool {
        if action.attempt_count >= self.max_attempts {
            return false;
        }
        match action.status {
            ActionStatus::Scheduled => {
                self.force || action.scheduled_for.map_or(true, |t| t <= self.now)
            }
            ActionStatus::Running => action
                .last_heartbeat
                .map_or(true, |beat| beat < self.stale_before),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ActionFilter {
    pub owner: Option<String>,
    pub status: Option<ActionStatus>,
    pub limit: Option<usize>,
}

// ---------------------------------------------------------------------------
// ActionDb
// ---------------------------------------------------------------------------

/// Persistent store for `Action` records and their log entries.
pub struct ActionDb {
    db: Database,
}

impl ActionDb {
    /// Open or create the redb database at `path`, creating all tables.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path).map_err(|e| match e {
            redb::DatabaseError::DatabaseAlreadyOpen => {
                EngineError::StoreLocked(path.display().to_string())
            }
            other => db_err(other),
        })?;
        let wt = db.begin_write().map_err(db_err)?;
        wt.open_table(ACTIONS).map_err(db_err)?;
        wt.open_table(ACTION_KEYS).map_err(db_err)?;
        wt.open_table(LOGS).map_err(db_err)?;
        wt.open_multimap_table(LOG_INDEX).map_err(db_err)?;
        wt.open_table(LIVE).map_err(db_err)?;
        wt.open_table(COMPLETED).map_err(db_err)?;
        wt.commit().map_err(db_err)?;
        Ok(Self { db })
    }

    /// Insert a new action.
    pub fn insert(&self, action: &Action) -> Result<()> {
        let key = time_key(action.created_at, action.id);
        let value = serde_json::to_vec(action)?;
        let wt = self.db.begin_write().map_err(db_err)?;
        {
            let mut actions = wt.open_table(ACTIONS).map_err(db_err)?;
            let mut keys = wt.open_table(ACTION_KEYS).map_err(db_err)?;
            if keys
                .get(action.id.as_bytes().as_slice())
                .map_err(db_err)?
                .is_some()
            {
                return Err(EngineError::Db(format!(
                    "action already exists: {}",
                    action.id
                )));
            }
            actions
                .insert(key.as_slice(), value.as_slice())
                .map_err(db_err)?;
            keys.insert(action.id.as_bytes().as_slice(), key.as_slice())
                .map_err(db_err)?;
            index_status(&wt, &key, action)?;
        }
        wt.commit().map_err(db_err)?;
        Ok(())
    }

    pub fn find(&self, id: Uuid) -> Result<Option<Action>> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let keys = rt.open_table(ACTION_KEYS).map_err(db_err)?;
        let actions = rt.open_table(ACTIONS).map_err(db_err)?;
        let Some(key) = keys.get(id.as_bytes().as_slice()).map_err(db_err)? else {
            return Ok(None);
        };
        let Some(value) = actions.get(key.value()).map_err(db_err)? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_slice(value.value())?))
    }

    pub fn get(&self, id: Uuid) -> Result<Action> {
        self.find(id)?
            .ok_or_else(|| EngineError::ActionNotFound(id.to_string()))
    }

    /// Scan actions oldest-created first, keeping those matching `keep`, up
    /// to `limit`.
    fn scan<F>(&self, limit: usize, mut keep: F) -> Result<Vec<Action>>
    where
        F: FnMut(&Action) -> bool,
    {
        let rt = self.db.begin_read().map_err(db_err)?;
        let table = rt.open_table(ACTIONS).map_err(db_err)?;
        let mut result = Vec::new();
        for entry in table.iter().map_err(db_err)? {
            if result.len() >= limit {
                break;
            }
            let (_, v) = entry.map_err(db_err)?;
            let action: Action = serde_json::from_slice(v.value())?;
            if keep(&action) {
                result.push(action);
            }
        }
        Ok(result)
    }

    /// Like `scan`, over non-terminal actions only.
    fn scan_live<F>(&self, limit: usize, mut keep: F) -> Result<Vec<Action>>
    where
        F: FnMut(&Action) -> bool,
    {
        let rt = self.db.begin_read().map_err(db_err)?;
        let live = rt.open_table(LIVE).map_err(db_err)?;
        let actions = rt.open_table(ACTIONS).map_err(db_err)?;
        let mut result = Vec::new();
        for entry in live.iter().map_err(db_err)? {
            if result.len() >= limit {
                break;
            }
            let (k, _) = entry.map_err(db_err)?;
            let Some(v) = actions.get(k.value()).map_err(db_err)? else {
                continue;
            };
            let action: Action = serde_json::from_slice(v.value())?;
            if keep(&action) {
                result.push(action);
            }
        }
        Ok(result)
    }

    /// Actions matching `filter`, newest first.
    pub fn list(&self, filter: &ActionFilter) -> Result<Vec<Action>> {
        let mut all = self.scan(usize::MAX, |a| {
            filter.owner.as_deref().map_or(true, |o| a.owner == o)
                && filter.status.map_or(true, |s| a.status == s)
        })?;
        all.reverse();
        if let Some(limit) = filter.limit {
            all.truncate(limit);
        }
        Ok(all)
    }

    /// `Scheduled` actions eligible at `now`, oldest first.
    pub fn select_due(
        &self,
        now: DateTime<Utc>,
        max_attempts: u32,
        limit: usize,
    ) -> Result<Vec<Action>> {
        self.scan_live(limit, |a| {
            a.status == ActionStatus::Scheduled
                && a.scheduled_for.map_or(true, |t| t <= now)
                && a.attempt_count < max_attempts
        })
    }

    /// `Running` actions whose heartbeat is missing or older than
    /// `stale_before`, oldest first.
    pub fn select_stale(
        &self,
        stale_before: DateTime<Utc>,
        max_attempts: u32,
        limit: usize,
    ) -> Result<Vec<Action>> {
        self.scan_live(limit, |a| {
            a.status == ActionStatus::Running
                && a.last_heartbeat.map_or(true, |beat| beat < stale_before)
                && a.attempt_count < max_attempts
        })
    }

    /// Conditionally mutate one action.
    ///
    /// Within a single write transaction: load the action, and only if
    /// `expect` holds apply `mutate` and persist. Returns the stored action
    /// when the write happened, `None` when the expectation failed (the
    /// equivalent of an UPDATE touching zero rows).
    pub fn update_if<P, M>(&self, id: Uuid, expect: P, mutate: M) -> Result<Option<Action>>
    where
        P: FnOnce(&Action) -> bool,
        M: FnOnce(&mut Action),
    {
        let wt = self.db.begin_write().map_err(db_err)?;
        let updated = {
            let keys = wt.open_table(ACTION_KEYS).map_err(db_err)?;
            let mut actions = wt.open_table(ACTIONS).map_err(db_err)?;
            let key = match keys.get(id.as_bytes().as_slice()).map_err(db_err)? {
                Some(k) => k.value().to_vec(),
                None => return Err(EngineError::ActionNotFound(id.to_string())),
            };
            let current = match actions.get(key.as_slice()).map_err(db_err)? {
                Some(v) => serde_json::from_slice::<Action>(v.value())?,
                None => return Err(EngineError::ActionNotFound(id.to_string())),
            };
            if expect(&current) {
                let was_terminal = current.is_terminal();
                let mut next = current;
                mutate(&mut next);
                let value = serde_json::to_vec(&next)?;
                actions
                    .insert(key.as_slice(), value.as_slice())
                    .map_err(db_err)?;
                if !was_terminal {
                    index_status(&wt, &key, &next)?;
                }
                Some(next)
            } else {
                None
            }
        };
        match updated {
            Some(action) => {
                wt.commit().map_err(db_err)?;
                Ok(Some(action))
            }
            None => {
                wt.abort().map_err(db_err)?;
                Ok(None)
            }
        }
    }

    /// Take ownership of an action for one step: `Running`, fresh heartbeat,
    /// `started_at` stamped on first claim.
    pub fn claim(&self, id: Uuid, req: ClaimRequest) -> Result<Option<Action>> {
        self.update_if(
            id,
            |a| req.admits(a),
            |a| {
                a.status = ActionStatus::Running;
                a.touch(req.now);
                if a.started_at.is_none() {
                    a.started_at = Some(req.now);
                }
            },
        )
    }

    /// Cancel an action that has not started yet.
    ///
    /// Succeeds only while the action is `Scheduled`; returns `false`
    /// otherwise and leaves the record untouched.
    pub fn cancel(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let updated = self.update_if(
            id,
            |a| a.status == ActionStatus::Scheduled,
            |a| {
                a.finish(ActionStatus::Canceled, now);
                a.error_message = None;
            },
        )?;
        Ok(updated.is_some())
    }

    // -----------------------------------------------------------------------
    // Log entries
    // -----------------------------------------------------------------------

    pub fn append_log(&self, entry: &ActionLogEntry) -> Result<()> {
        let key = time_key(entry.created_at, entry.id);
        let value = serde_json::to_vec(entry)?;
        let wt = self.db.begin_write().map_err(db_err)?;
        {
            let mut logs = wt.open_table(LOGS).map_err(db_err)?;
            let mut index = wt.open_multimap_table(LOG_INDEX).map_err(db_err)?;
            logs.insert(key.as_slice(), value.as_slice())
                .map_err(db_err)?;
            index
                .insert(entry.action_id.as_bytes().as_slice(), key.as_slice())
                .map_err(db_err)?;
        }
        wt.commit().map_err(db_err)?;
        Ok(())
    }

    /// Log entries of one action in chronological order.
    pub fn logs_for(&self, action_id: Uuid) -> Result<Vec<ActionLogEntry>> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let logs = rt.open_table(LOGS).map_err(db_err)?;
        let index = rt.open_multimap_table(LOG_INDEX).map_err(db_err)?;
        let mut result = Vec::new();
        // Multimap values come back in key order, i.e. chronologically.
        for key in index
            .get(action_id.as_bytes().as_slice())
            .map_err(db_err)?
        {
            let key = key.map_err(db_err)?;
            if let Some(v) = logs.get(key.value()).map_err(db_err)? {
                result.push(serde_json::from_slice(v.value())?);
            }
        }
        Ok(result)
    }

    // -----------------------------------------------------------------------
    // Retention
    // -----------------------------------------------------------------------

    /// Delete terminal actions completed before `cutoff`, with their logs.
    pub fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let upper = older_than(cutoff);
        let wt = self.db.begin_write().map_err(db_err)?;
        let deleted = {
            let mut actions = wt.open_table(ACTIONS).map_err(db_err)?;
            let mut keys = wt.open_table(ACTION_KEYS).map_err(db_err)?;
            let mut logs = wt.open_table(LOGS).map_err(db_err)?;
            let mut index = wt.open_multimap_table(LOG_INDEX).map_err(db_err)?;
            let mut completed = wt.open_table(COMPLETED).map_err(db_err)?;

            let mut expired: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
            for entry in completed.range(..upper.as_slice()).map_err(db_err)? {
                let (k, v) = entry.map_err(db_err)?;
                expired.push((k.value().to_vec(), v.value().to_vec()));
            }

            for (completed_key, key) in &expired {
                let id = key_id(key)?;
                let id_bytes = id.as_bytes().as_slice();
                let mut log_keys = Vec::new();
                for lk in index.get(id_bytes).map_err(db_err)? {
                    log_keys.push(lk.map_err(db_err)?.value().to_vec());
                }
                for lk in &log_keys {
                    logs.remove(lk.as_slice()).map_err(db_err)?;
                }
                index.remove_all(id_bytes).map_err(db_err)?;
                keys.remove(id_bytes).map_err(db_err)?;
                actions.remove(key.as_slice()).map_err(db_err)?;
                completed.remove(completed_key.as_slice()).map_err(db_err)?;
            }
            expired.len()
        };
        wt.commit().map_err(db_err)?;
        Ok(deleted)
    }

    /// Delete log entries created before `cutoff`, regardless of action state.
    pub fn delete_logs_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let upper = older_than(cutoff);
        let wt = self.db.begin_write().map_err(db_err)?;
        let deleted = {
            let mut logs = wt.open_table(LOGS).map_err(db_err)?;
            let mut index = wt.open_multimap_table(LOG_INDEX).map_err(db_err)?;

            let mut expired: Vec<(Vec<u8>, Uuid)> = Vec::new();
            for entry in logs.range(..upper.as_slice()).map_err(db_err)? {
                let (k, v) = entry.map_err(db_err)?;
                let log: ActionLogEntry = serde_json::from_slice(v.value())?;
                expired.push((k.value().to_vec(), log.action_id));
            }
            for (key, action_id) in &expired {
                logs.remove(key.as_slice()).map_err(db_err)?;
                index
                    .remove(action_id.as_bytes().as_slice(), key.as_slice())
                    .map_err(db_err)?;
            }
            expired.len()
        };
        wt.commit().map_err(db_err)?;
        Ok(deleted)
    }
}

/// Keep `live_actions` and `completed_actions` in step with `action`, stored
/// under `key`. Terminal is final, so a record only ever moves from live to
/// completed.
fn index_status(wt: &redb::WriteTransaction, key: &[u8], action: &Action) -> Result<()> {
    let mut live = wt.open_table(LIVE).map_err(db_err)?;
    if action.is_terminal() {
        live.remove(key).map_err(db_err)?;
        let at = action.completed_at.unwrap_or(action.updated_at);
        let mut completed = wt.open_table(COMPLETED).map_err(db_err)?;
        completed
            .insert(time_key(at, action.id).as_slice(), key)
            .map_err(db_err)?;
    } else {
        live.insert(key, ()).map_err(db_err)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::action::{
        ActionPayload, LogLevel, NewAction, OperationType, Step,
    };
    use chrono::Duration as CDur;
    use tempfile::TempDir;

    fn open_tmp() -> (TempDir, ActionDb) {
        let dir = TempDir::new().unwrap();
        let db = ActionDb::open(&dir.path().join("test.redb")).unwrap();
        (dir, db)
    }

    fn action_at(owner: &str, created: DateTime<Utc>) -> Action {
        Action::new(
            NewAction {
                owner: owner.into(),
                application_id: "shop".into(),
                environment: "prod".into(),
                credential_ref: "shop".into(),
                operation: OperationType::Start,
                payload: ActionPayload::default(),
                scheduled_for: None,
                retry_until: None,
            },
            created,
        )
    }

    fn claim_req(now: DateTime<Utc>) -> ClaimRequest {
        ClaimRequest {
            now,
            stale_before: now - CDur::seconds(50),
            max_attempts: 5,
            force: false,
        }
    }

    #[test]
    fn insert_and_get() {
        let (_dir, db) = open_tmp();
        let a = action_at("t1", Utc::now());
        db.insert(&a).unwrap();
        assert_eq!(db.get(a.id).unwrap(), a);
        assert!(db.find(Uuid::new_v4()).unwrap().is_none());
        assert!(matches!(
            db.get(Uuid::new_v4()),
            Err(EngineError::ActionNotFound(_))
        ));
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let (_dir, db) = open_tmp();
        let a = action_at("t1", Utc::now());
        db.insert(&a).unwrap();
        assert!(db.insert(&a).is_err());
    }

    #[test]
    fn select_due_is_oldest_first_and_respects_schedule() {
        let (_dir, db) = open_tmp();
        let now = Utc::now();
        let newer = action_at("t1", now - CDur::seconds(10));
        let older = action_at("t2", now - CDur::seconds(60));
        let mut future = action_at("t1", now - CDur::seconds(90));
        future.scheduled_for = Some(now + CDur::minutes(5));
        db.insert(&newer).unwrap();
        db.insert(&older).unwrap();
        db.insert(&future).unwrap();

        let due = db.select_due(now, 5, 10).unwrap();
        let ids: Vec<Uuid> = due.iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![older.id, newer.id]);

        let limited = db.select_due(now, 5, 1).unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].id, older.id);
    }

    #[test]
    fn select_due_skips_exhausted_attempts() {
        let (_dir, db) = open_tmp();
        let now = Utc::now();
        let mut a = action_at("t1", now);
        a.attempt_count = 5;
        db.insert(&a).unwrap();
        assert!(db.select_due(now, 5, 10).unwrap().is_empty());
        assert_eq!(db.select_due(now, 6, 10).unwrap().len(), 1);
    }

    #[test]
    fn claim_is_exclusive_until_stale() {
        let (_dir, db) = open_tmp();
        let now = Utc::now();
        let a = action_at("t1", now);
        db.insert(&a).unwrap();

        let claimed = db.claim(a.id, claim_req(now)).unwrap().unwrap();
        assert_eq!(claimed.status, ActionStatus::Running);
        assert_eq!(claimed.last_heartbeat, Some(now));
        assert_eq!(claimed.started_at, Some(now));

        // A second runner in the same interval loses.
        assert!(db.claim(a.id, claim_req(now + CDur::seconds(10))).unwrap().is_none());

        // Once the heartbeat is stale the action may be reclaimed.
        let later = now + CDur::seconds(51);
        let reclaimed = db.claim(a.id, claim_req(later)).unwrap().unwrap();
        assert_eq!(reclaimed.last_heartbeat, Some(later));
        assert_eq!(reclaimed.started_at, Some(now), "started_at is kept");
    }

    #[test]
    fn claim_respects_schedule_unless_forced() {
        let (_dir, db) = open_tmp();
        let now = Utc::now();
        let mut a = action_at("t1", now);
        a.scheduled_for = Some(now + CDur::hours(1));
        db.insert(&a).unwrap();

        assert!(db.claim(a.id, claim_req(now)).unwrap().is_none());
        let forced = ClaimRequest {
            force: true,
            ..claim_req(now)
        };
        assert!(db.claim(a.id, forced).unwrap().is_some());
    }

    #[test]
    fn select_stale_finds_orphaned_running_actions() {
        let (_dir, db) = open_tmp();
        let now = Utc::now();
        let a = action_at("t1", now - CDur::minutes(5));
        let b = action_at("t1", now - CDur::minutes(4));
        db.insert(&a).unwrap();
        db.insert(&b).unwrap();
        db.claim(a.id, claim_req(now - CDur::minutes(3))).unwrap();
        db.claim(b.id, claim_req(now - CDur::seconds(5))).unwrap();

        let stale = db.select_stale(now - CDur::seconds(50), 5, 10).unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, a.id);
    }

    #[test]
    fn cancel_only_from_scheduled() {
        let (_dir, db) = open_tmp();
        let now = Utc::now();
        let a = action_at("t1", now);
        let b = action_at("t1", now);
        db.insert(&a).unwrap();
        db.insert(&b).unwrap();

        assert!(db.cancel(a.id, now).unwrap());
        let canceled = db.get(a.id).unwrap();
        assert_eq!(canceled.status, ActionStatus::Canceled);
        assert_eq!(canceled.completed_at, Some(now));
        // Second cancel is a no-op.
        assert!(!db.cancel(a.id, now).unwrap());

        db.claim(b.id, claim_req(now)).unwrap();
        assert!(!db.cancel(b.id, now).unwrap());
        assert_eq!(db.get(b.id).unwrap().status, ActionStatus::Running);
    }

    #[test]
    fn update_if_failed_expectation_writes_nothing() {
        let (_dir, db) = open_tmp();
        let a = action_at("t1", Utc::now());
        db.insert(&a).unwrap();
        let res = db
            .update_if(a.id, |_| false, |x| x.attempt_count = 99)
            .unwrap();
        assert!(res.is_none());
        assert_eq!(db.get(a.id).unwrap().attempt_count, 0);
    }

    #[test]
    fn list_filters_and_orders_newest_first() {
        let (_dir, db) = open_tmp();
        let now = Utc::now();
        let a = action_at("t1", now - CDur::seconds(30));
        let b = action_at("t2", now - CDur::seconds(20));
        let c = action_at("t1", now - CDur::seconds(10));
        for x in [&a, &b, &c] {
            db.insert(x).unwrap();
        }
        let t1 = db
            .list(&ActionFilter {
                owner: Some("t1".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(
            t1.iter().map(|x| x.id).collect::<Vec<_>>(),
            vec![c.id, a.id]
        );
        let limited = db
            .list(&ActionFilter {
                limit: Some(1),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(limited[0].id, c.id);
    }

    #[test]
    fn logs_are_returned_in_order() {
        let (_dir, db) = open_tmp();
        let now = Utc::now();
        let a = action_at("t1", now);
        db.insert(&a).unwrap();
        let second = ActionLogEntry::new(a.id, LogLevel::Warn, Some(Step::WaitRunning), "two", now);
        let first = ActionLogEntry::new(
            a.id,
            LogLevel::Info,
            Some(Step::CallStart),
            "one",
            now - CDur::seconds(1),
        );
        db.append_log(&second).unwrap();
        db.append_log(&first).unwrap();
        let logs = db.logs_for(a.id).unwrap();
        assert_eq!(
            logs.iter().map(|l| l.message.as_str()).collect::<Vec<_>>(),
            vec!["one", "two"]
        );
        assert!(db.logs_for(Uuid::new_v4()).unwrap().is_empty());
    }

    #[test]
    fn delete_terminal_before_removes_actions_and_logs() {
        let (_dir, db) = open_tmp();
        let now = Utc::now();
        let mut old = action_at("t1", now - CDur::days(40));
        old.finish(ActionStatus::Succeeded, now - CDur::days(35));
        let mut recent = action_at("t1", now - CDur::days(2));
        recent.finish(ActionStatus::Failed, now - CDur::days(1));
        let live = action_at("t1", now - CDur::days(60));
        for x in [&old, &recent, &live] {
            db.insert(x).unwrap();
        }
        db.append_log(&ActionLogEntry::new(old.id, LogLevel::Info, None, "x", now))
            .unwrap();

        let deleted = db.delete_terminal_before(now - CDur::days(30)).unwrap();
        assert_eq!(deleted, 1);
        assert!(db.find(old.id).unwrap().is_none());
        assert!(db.logs_for(old.id).unwrap().is_empty());
        assert!(db.find(recent.id).unwrap().is_some());
        assert!(db.find(live.id).unwrap().is_some(), "non-terminal actions are kept");
    }

    #[test]
    fn delete_logs_before_is_a_range_cut() {
        let (_dir, db) = open_tmp();
        let now = Utc::now();
        let a = action_at("t1", now);
        db.insert(&a).unwrap();
        db.append_log(&ActionLogEntry::new(
            a.id,
            LogLevel::Info,
            None,
            "ancient",
            now - CDur::days(100),
        ))
        .unwrap();
        db.append_log(&ActionLogEntry::new(a.id, LogLevel::Info, None, "fresh", now))
            .unwrap();

        let deleted = db.delete_logs_before(now - CDur::days(90)).unwrap();
        assert_eq!(deleted, 1);
        let logs = db.logs_for(a.id).unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].message, "fresh");
    }

    #[test]
    fn second_open_reports_locked_store() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.redb");
        let _held = ActionDb::open(&path).unwrap();
        let err = ActionDb::open(&path).err().unwrap();
        assert!(matches!(err, EngineError::StoreLocked(_)));
        assert!(err.to_string().contains("cloudops serve"));
    }

    #[test]
    fn finished_actions_leave_dispatch_and_reach_retention() {
        let (_dir, db) = open_tmp();
        let now = Utc::now();
        let a = action_at("t1", now - CDur::days(40));
        db.insert(&a).unwrap();
        assert_eq!(db.select_due(now, 5, 10).unwrap().len(), 1);

        let done_at = now - CDur::days(35);
        db.update_if(a.id, |_| true, |x| x.finish(ActionStatus::Succeeded, done_at))
            .unwrap()
            .unwrap();
        assert!(db.select_due(now, 5, 10).unwrap().is_empty());
        assert!(db.select_stale(now, 5, 10).unwrap().is_empty());

        // A later write to the finished record does not re-index it.
        db.update_if(a.id, |_| true, |x| x.error_message = Some("late".into()))
            .unwrap()
            .unwrap();
        assert_eq!(db.delete_terminal_before(now - CDur::days(30)).unwrap(), 1);
        assert!(db.find(a.id).unwrap().is_none());
        assert_eq!(db.delete_terminal_before(now).unwrap(), 0);
    }

    #[tokio::test]
    async fn with_store_runs_off_the_executor() {
        let (_dir, db) = open_tmp();
        let db = Arc::new(db);
        let a = action_at("t1", Utc::now());
        let id = a.id;
        with_store(&db, move |db| db.insert(&a)).await.unwrap();
        let found = with_store(&db, move |db| db.get(id)).await.unwrap();
        assert_eq!(found.id, id);
    }

    #[test]
    fn empty_db_queries_return_empty() {
        let (_dir, db) = open_tmp();
        let now = Utc::now();
        assert!(db.select_due(now, 5, 10).unwrap().is_empty());
        assert!(db.select_stale(now, 5, 10).unwrap().is_empty());
        assert_eq!(db.delete_terminal_before(now).unwrap(), 0);
        assert_eq!(db.delete_logs_before(now).unwrap(), 0);
    }
}
