use crate::analysis::ratchet::{base_from_churn, RatchetConfig};
use crate::error::{Error, Result as AppResult};
use crate::models::day::{
    AiMetadata, DayRecord, DayUpdate, MergePolicy, PeriodKind, PeriodRecord, BASE_SCORE_FLOOR,
};
use chrono::{Datelike, Days, NaiveDate, Weekday};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Result, Row};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const DB_SCHEMA_VERSION: i64 = 2;

pub const STORE_DIR: &str = ".devpulse";
pub const STORE_FILE: &str = "progress.db";

const DAY_COLUMNS: &str = "date, insertions, deletions, base_score, trend, summary, ai_score, \
    local_score, local_score_raw, progress_percent, ai_model, ai_provider, ai_tokens, \
    ai_duration_ms, ai_chunks, ai_generated_at, created_at, updated_at";

/// Store handle shared by the orchestrator and the poller. Every mutation runs
/// under this lock, so the two writers serialize instead of racing.
pub type SharedStore = Arc<tokio::sync::Mutex<AggregationStore>>;

pub fn initialize_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;",
    )?;

    let mut version: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

    if version < 1 {
        apply_migration_1(conn)?;
        version = 1;
        conn.pragma_update(None, "user_version", version)?;
    }

    if version < 2 {
        apply_migration_2(conn)?;
        version = 2;
        conn.pragma_update(None, "user_version", version)?;
    }

    if version > DB_SCHEMA_VERSION {
        log::warn!("progress store has newer schema version {version}; continuing");
    }

    Ok(())
}

fn apply_migration_1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS days (
            date TEXT PRIMARY KEY,
            insertions INTEGER NOT NULL DEFAULT 0,
            deletions INTEGER NOT NULL DEFAULT 0,
            base_score INTEGER NOT NULL DEFAULT 100,
            trend INTEGER NOT NULL DEFAULT 0,
            summary TEXT,
            ai_score INTEGER,
            local_score INTEGER,
            local_score_raw INTEGER,
            progress_percent INTEGER,
            created_at INTEGER NOT NULL DEFAULT 0,
            updated_at INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS weeks (
            key TEXT PRIMARY KEY,
            insertions INTEGER NOT NULL DEFAULT 0,
            deletions INTEGER NOT NULL DEFAULT 0,
            base_score INTEGER NOT NULL DEFAULT 100,
            summary TEXT,
            created_at INTEGER NOT NULL DEFAULT 0,
            updated_at INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS months (
            key TEXT PRIMARY KEY,
            insertions INTEGER NOT NULL DEFAULT 0,
            deletions INTEGER NOT NULL DEFAULT 0,
            base_score INTEGER NOT NULL DEFAULT 100,
            summary TEXT,
            created_at INTEGER NOT NULL DEFAULT 0,
            updated_at INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS years (
            key TEXT PRIMARY KEY,
            insertions INTEGER NOT NULL DEFAULT 0,
            deletions INTEGER NOT NULL DEFAULT 0,
            base_score INTEGER NOT NULL DEFAULT 100,
            summary TEXT,
            created_at INTEGER NOT NULL DEFAULT 0,
            updated_at INTEGER NOT NULL DEFAULT 0
        );
        ",
    )
}

fn apply_migration_2(conn: &Connection) -> Result<()> {
    add_column_if_missing(conn, "days", "ai_model TEXT")?;
    add_column_if_missing(conn, "days", "ai_provider TEXT")?;
    add_column_if_missing(conn, "days", "ai_tokens INTEGER")?;
    add_column_if_missing(conn, "days", "ai_duration_ms INTEGER")?;
    add_column_if_missing(conn, "days", "ai_chunks INTEGER")?;
    add_column_if_missing(conn, "days", "ai_generated_at INTEGER")?;

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS store_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_days_raw ON days(date, local_score_raw);
        ",
    )
}

fn add_column_if_missing(conn: &Connection, table: &str, column_def: &str) -> Result<()> {
    let column_name = column_def
        .split_whitespace()
        .next()
        .unwrap_or(column_def)
        .to_string();

    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let exists = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .filter_map(|res| res.ok())
        .any(|name| name == column_name);

    if !exists {
        conn.execute(&format!("ALTER TABLE {table} ADD COLUMN {column_def}"), [])?;
    }

    Ok(())
}

pub fn store_path(repo_path: &Path) -> PathBuf {
    repo_path.join(STORE_DIR).join(STORE_FILE)
}

pub fn day_key(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

pub fn parse_day_key(key: &str) -> AppResult<NaiveDate> {
    NaiveDate::parse_from_str(key.trim(), "%Y-%m-%d").map_err(|_| Error::InvalidDate(key.to_string()))
}

/// ISO-8601 week key (`YYYY-Www`); the year is the ISO week-numbering year.
pub fn week_key(date: NaiveDate) -> String {
    let week = date.iso_week();
    format!("{:04}-W{:02}", week.year(), week.week())
}

pub fn month_key(date: NaiveDate) -> String {
    date.format("%Y-%m").to_string()
}

pub fn year_key(date: NaiveDate) -> String {
    date.format("%Y").to_string()
}

pub fn period_key(kind: PeriodKind, date: NaiveDate) -> String {
    match kind {
        PeriodKind::Week => week_key(date),
        PeriodKind::Month => month_key(date),
        PeriodKind::Year => year_key(date),
    }
}

/// First and last calendar day of the period containing `date`.
pub fn period_bounds(kind: PeriodKind, date: NaiveDate) -> (NaiveDate, NaiveDate) {
    match kind {
        PeriodKind::Week => {
            let week = date.iso_week();
            let monday = NaiveDate::from_isoywd_opt(week.year(), week.week(), Weekday::Mon).unwrap_or(date);
            (monday, monday + Days::new(6))
        }
        PeriodKind::Month => {
            let first = date.with_day(1).unwrap_or(date);
            let next = if date.month() == 12 {
                NaiveDate::from_ymd_opt(date.year() + 1, 1, 1)
            } else {
                NaiveDate::from_ymd_opt(date.year(), date.month() + 1, 1)
            };
            let last = next.and_then(|n| n.pred_opt()).unwrap_or(date);
            (first, last)
        }
        PeriodKind::Year => {
            let first = NaiveDate::from_ymd_opt(date.year(), 1, 1).unwrap_or(date);
            let last = NaiveDate::from_ymd_opt(date.year(), 12, 31).unwrap_or(date);
            (first, last)
        }
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn day_from_row(row: &Row<'_>) -> Result<DayRecord> {
    Ok(DayRecord {
        date: row.get(0)?,
        insertions: row.get(1)?,
        deletions: row.get(2)?,
        base_score: row.get(3)?,
        trend: row.get(4)?,
        summary: row.get(5)?,
        ai_score: row.get(6)?,
        local_score: row.get(7)?,
        local_score_raw: row.get(8)?,
        progress_percent: row.get(9)?,
        ai: AiMetadata {
            model: row.get(10)?,
            provider: row.get(11)?,
            tokens: row.get(12)?,
            duration_ms: row.get(13)?,
            chunks_count: row.get(14)?,
            generated_at: row.get(15)?,
        },
        created_at: row.get(16)?,
        updated_at: row.get(17)?,
    })
}

fn period_from_row(kind: PeriodKind, row: &Row<'_>) -> Result<PeriodRecord> {
    Ok(PeriodRecord {
        kind,
        key: row.get(0)?,
        insertions: row.get(1)?,
        deletions: row.get(2)?,
        base_score: row.get(3)?,
        summary: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn merge_count(current: i64, incoming: Option<i64>, policy: MergePolicy) -> i64 {
    match (incoming, policy) {
        (None, _) => current,
        (Some(value), MergePolicy::Overwrite) => value.max(0),
        (Some(value), MergePolicy::KeepMax) => current.max(value),
    }
}

fn merge_optional(current: Option<i64>, incoming: Option<i64>, policy: MergePolicy) -> Option<i64> {
    match (current, incoming, policy) {
        (current, None, _) => current,
        (_, Some(value), MergePolicy::Overwrite) => Some(value),
        (Some(existing), Some(value), MergePolicy::KeepMax) => Some(existing.max(value)),
        (None, Some(value), MergePolicy::KeepMax) => Some(value),
    }
}

/// Per-repository persistence of day rows and their week/month/year rollups.
pub struct AggregationStore {
    conn: Connection,
    path: Option<PathBuf>,
    ratchet: RatchetConfig,
}

impl AggregationStore {
    pub fn open(path: &Path, ratchet: RatchetConfig) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        initialize_schema(&conn)?;
        Ok(AggregationStore {
            conn,
            path: Some(path.to_path_buf()),
            ratchet,
        })
    }

    pub fn open_for_repo(repo_path: &Path, ratchet: RatchetConfig) -> AppResult<Self> {
        Self::open(&store_path(repo_path), ratchet)
    }

    pub fn open_in_memory(ratchet: RatchetConfig) -> AppResult<Self> {
        let conn = Connection::open_in_memory()?;
        initialize_schema(&conn)?;
        Ok(AggregationStore {
            conn,
            path: None,
            ratchet,
        })
    }

    pub fn into_shared(self) -> SharedStore {
        Arc::new(tokio::sync::Mutex::new(self))
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn load_day_raw(&self, key: &str) -> Result<Option<DayRecord>> {
        self.conn
            .query_row(
                &format!("SELECT {DAY_COLUMNS} FROM days WHERE date = ?1"),
                params![key],
                day_from_row,
            )
            .optional()
    }

    /// Base score of the latest recorded day strictly before `date`.
    fn previous_base(&self, date: NaiveDate) -> Result<Option<i64>> {
        self.conn
            .query_row(
                "SELECT base_score FROM days WHERE date < ?1 ORDER BY date DESC LIMIT 1",
                params![day_key(date)],
                |row| row.get(0),
            )
            .optional()
    }

    /// Recompute base score and trend so the ratchet invariant holds.
    fn settle(&self, date: NaiveDate, record: &mut DayRecord) -> Result<()> {
        let previous = self.previous_base(date)?;
        let step = base_from_churn(previous, record.insertions, record.deletions, &self.ratchet);
        record.base_score = record.base_score.max(step.base_score);
        record.trend = record.base_score - step.previous_base;
        Ok(())
    }

    fn write_day(&self, record: &DayRecord) -> Result<()> {
        self.conn.execute(
            &format!(
                "INSERT INTO days ({DAY_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
                 ON CONFLICT(date) DO UPDATE SET
                    insertions = excluded.insertions,
                    deletions = excluded.deletions,
                    base_score = excluded.base_score,
                    trend = excluded.trend,
                    summary = excluded.summary,
                    ai_score = excluded.ai_score,
                    local_score = excluded.local_score,
                    local_score_raw = excluded.local_score_raw,
                    progress_percent = excluded.progress_percent,
                    ai_model = excluded.ai_model,
                    ai_provider = excluded.ai_provider,
                    ai_tokens = excluded.ai_tokens,
                    ai_duration_ms = excluded.ai_duration_ms,
                    ai_chunks = excluded.ai_chunks,
                    ai_generated_at = excluded.ai_generated_at,
                    updated_at = excluded.updated_at"
            ),
            params![
                record.date,
                record.insertions,
                record.deletions,
                record.base_score,
                record.trend,
                record.summary,
                record.ai_score,
                record.local_score,
                record.local_score_raw,
                record.progress_percent,
                record.ai.model,
                record.ai.provider,
                record.ai.tokens,
                record.ai.duration_ms,
                record.ai.chunks_count,
                record.ai.generated_at,
                record.created_at,
                record.updated_at,
            ],
        )?;
        Ok(())
    }

    fn new_day(date: NaiveDate) -> DayRecord {
        let timestamp = now();
        DayRecord {
            created_at: timestamp,
            updated_at: timestamp,
            ..DayRecord::empty(&day_key(date))
        }
    }

    /// Read one day. A stale trend or a base below the previous day is
    /// repaired in place before returning.
    pub fn get_day(&self, date: NaiveDate) -> Result<Option<DayRecord>> {
        let Some(mut record) = self.load_day_raw(&day_key(date))? else {
            return Ok(None);
        };

        let (base, trend) = (record.base_score, record.trend);
        self.settle(date, &mut record)?;
        if record.base_score != base || record.trend != trend {
            log::warn!(
                "repairing day {}: base {base} -> {}, trend {trend} -> {}",
                record.date,
                record.base_score,
                record.trend
            );
            record.updated_at = now();
            self.write_day(&record)?;
        }

        Ok(Some(record))
    }

    /// Write a full day row. Base score and trend are re-derived so the
    /// ratchet invariant survives arbitrary input.
    pub fn set_day(&self, record: &DayRecord) -> AppResult<DayRecord> {
        let date = parse_day_key(&record.date)?;
        let mut record = record.clone();
        record.date = day_key(date);
        record.insertions = record.insertions.max(0);
        record.deletions = record.deletions.max(0);
        record.updated_at = now();
        if record.created_at == 0 {
            record.created_at = record.updated_at;
        }
        self.settle(date, &mut record)?;
        self.write_day(&record)?;
        Ok(record)
    }

    /// Inclusive date range, ascending.
    pub fn get_days_range(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<DayRecord>> {
        let mut stmt = self
            .conn
            .prepare("SELECT date FROM days WHERE date >= ?1 AND date <= ?2 ORDER BY date ASC")?;
        let keys: Vec<String> = stmt
            .query_map(params![day_key(start), day_key(end)], |row| row.get(0))?
            .collect::<Result<_>>()?;

        let mut days = Vec::with_capacity(keys.len());
        for key in keys {
            let Ok(date) = NaiveDate::parse_from_str(&key, "%Y-%m-%d") else {
                continue;
            };
            if let Some(day) = self.get_day(date)? {
                days.push(day);
            }
        }
        Ok(days)
    }

    /// Add churn deltas to a day, creating the row if needed.
    pub fn accumulate_day(&self, date: NaiveDate, insertions: i64, deletions: i64) -> Result<DayRecord> {
        let mut record = self
            .load_day_raw(&day_key(date))?
            .unwrap_or_else(|| Self::new_day(date));
        record.insertions += insertions.max(0);
        record.deletions += deletions.max(0);
        record.updated_at = now();
        self.settle(date, &mut record)?;
        self.write_day(&record)?;
        Ok(record)
    }

    /// Apply a partial update under the given merge policy.
    pub fn save_day(&self, date: NaiveDate, update: &DayUpdate, policy: MergePolicy) -> Result<DayRecord> {
        let mut record = self
            .load_day_raw(&day_key(date))?
            .unwrap_or_else(|| Self::new_day(date));

        record.insertions = merge_count(record.insertions, update.insertions, policy);
        record.deletions = merge_count(record.deletions, update.deletions, policy);
        record.base_score = merge_count(record.base_score, update.base_score, policy);
        record.ai_score = merge_optional(record.ai_score, update.ai_score, policy);
        record.local_score = merge_optional(record.local_score, update.local_score, policy);
        record.local_score_raw = merge_optional(record.local_score_raw, update.local_score_raw, policy);
        record.progress_percent = merge_optional(record.progress_percent, update.progress_percent, policy);
        if let Some(summary) = &update.summary {
            record.summary = Some(summary.clone());
        }
        if let Some(ai) = &update.ai {
            record.ai = ai.clone();
        }

        record.updated_at = now();
        self.settle(date, &mut record)?;
        self.write_day(&record)?;
        Ok(record)
    }

    /// Raw scores of the `window_days` days before `before`, oldest first.
    pub fn recent_raw_scores(&self, before: NaiveDate, window_days: u32) -> Result<Vec<i64>> {
        let start = before
            .checked_sub_days(Days::new(u64::from(window_days)))
            .unwrap_or(NaiveDate::MIN);
        let mut stmt = self.conn.prepare(
            "SELECT local_score_raw FROM days
             WHERE date >= ?1 AND date < ?2 AND local_score_raw IS NOT NULL
             ORDER BY date ASC",
        )?;
        let scores = stmt
            .query_map(params![day_key(start), day_key(before)], |row| row.get(0))?
            .collect::<Result<Vec<i64>>>()?;
        Ok(scores)
    }

    /// Recompute the week, month and year rows covering `date`.
    pub fn recompute_rollups(&self, date: NaiveDate) -> Result<()> {
        for kind in [PeriodKind::Week, PeriodKind::Month, PeriodKind::Year] {
            self.recompute_period(kind, date)?;
        }
        Ok(())
    }

    /// Sum counts over the period and carry the latest day's base score.
    /// Days are read through `get_day`, so a stale base is repaired before it
    /// reaches the rollup. Unchanged aggregates leave the row untouched,
    /// timestamps included.
    pub fn recompute_period(&self, kind: PeriodKind, date: NaiveDate) -> Result<Option<PeriodRecord>> {
        let (start, end) = period_bounds(kind, date);
        let key = period_key(kind, date);

        let days = self.get_days_range(start, end)?;
        let Some(latest) = days.last() else {
            return Ok(None);
        };
        let insertions: i64 = days.iter().map(|day| day.insertions).sum();
        let deletions: i64 = days.iter().map(|day| day.deletions).sum();
        let base_score = latest.base_score;

        if let Some(existing) = self.get_period(kind, &key)? {
            if existing.insertions == insertions
                && existing.deletions == deletions
                && existing.base_score == base_score
            {
                return Ok(Some(existing));
            }
        }

        let timestamp = now();
        self.conn.execute(
            &format!(
                "INSERT INTO {table} (key, insertions, deletions, base_score, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                 ON CONFLICT(key) DO UPDATE SET
                    insertions = excluded.insertions,
                    deletions = excluded.deletions,
                    base_score = excluded.base_score,
                    updated_at = excluded.updated_at",
                table = kind.table()
            ),
            params![key, insertions, deletions, base_score, timestamp],
        )?;

        self.get_period(kind, &key)
    }

    pub fn get_period(&self, kind: PeriodKind, key: &str) -> Result<Option<PeriodRecord>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT key, insertions, deletions, base_score, summary, created_at, updated_at
                     FROM {} WHERE key = ?1",
                    kind.table()
                ),
                params![key],
                |row| period_from_row(kind, row),
            )
            .optional()
    }

    pub fn list_periods(&self, kind: PeriodKind) -> Result<Vec<PeriodRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT key, insertions, deletions, base_score, summary, created_at, updated_at
             FROM {} ORDER BY key ASC",
            kind.table()
        ))?;
        let rows = stmt
            .query_map([], |row| period_from_row(kind, row))?
            .collect::<Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Attach summary text to an existing rollup row. Returns false when the row does not exist.
    pub fn set_period_summary(&self, kind: PeriodKind, key: &str, summary: &str) -> Result<bool> {
        let changed = self.conn.execute(
            &format!(
                "UPDATE {} SET summary = ?2, updated_at = ?3 WHERE key = ?1",
                kind.table()
            ),
            params![key, summary, now()],
        )?;
        Ok(changed > 0)
    }

    pub fn get_meta(&self, key: &str) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT value FROM store_meta WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
    }

    pub fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO store_meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    /// Copy the whole store out to `dest`, replacing any file already there.
    pub fn export_to(&self, dest: &Path) -> AppResult<()> {
        if dest.exists() {
            fs::remove_file(dest)?;
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        self.conn
            .execute("VACUUM INTO ?1", params![dest.to_string_lossy().to_string()])?;
        Ok(())
    }

    /// Replace the store file with `source`, keeping a timestamped backup of
    /// the previous file. Returns the backup path.
    ///
    /// The source is copied and migrated next to the store before anything is
    /// replaced. If the swap itself fails, the backup is put back and reopened.
    pub fn import_from(&mut self, source: &Path) -> AppResult<PathBuf> {
        let Some(path) = self.path.clone() else {
            return Err(Error::ImportUnsupported);
        };

        let stamp = now();
        let candidate = with_suffix(&path, &format!(".import-{stamp}"));
        if let Err(e) = prepare_import(source, &candidate) {
            discard_store_files(&candidate);
            return Err(e);
        }

        let previous = std::mem::replace(&mut self.conn, Connection::open_in_memory()?);
        if let Err((conn, e)) = previous.close() {
            self.conn = conn;
            discard_store_files(&candidate);
            return Err(Error::Store(e));
        }

        let backup = with_suffix(&path, &format!(".bak-{stamp}"));
        if let Err(e) = self.install_import(&path, &candidate, &backup) {
            log::warn!("import from {} failed, restoring previous store: {e}", source.display());
            discard_store_files(&candidate);
            if let Err(restore) = self.restore_store(&path, &backup) {
                log::error!("could not reopen progress store {}: {restore}", path.display());
            }
            return Err(e);
        }

        log::info!("imported progress store from {}", source.display());
        Ok(backup)
    }

    fn install_import(&mut self, path: &Path, candidate: &Path, backup: &Path) -> AppResult<()> {
        if path.exists() {
            if let Err(e) = fs::copy(path, backup) {
                discard_store_files(backup);
                return Err(e.into());
            }
        }
        remove_sidecars(path)?;
        fs::rename(candidate, path)?;

        let conn = Connection::open(path)?;
        initialize_schema(&conn)?;
        self.conn = conn;
        Ok(())
    }

    fn restore_store(&mut self, path: &Path, backup: &Path) -> AppResult<()> {
        if backup.exists() {
            remove_sidecars(path)?;
            fs::copy(backup, path)?;
        }
        let conn = Connection::open(path)?;
        initialize_schema(&conn)?;
        self.conn = conn;
        Ok(())
    }
}

/// Snapshot `source` into `candidate`, migrate it and check every table the
/// store reads. The source is opened read-only so a missing path is an error.
fn prepare_import(source: &Path, candidate: &Path) -> AppResult<()> {
    {
        let source = Connection::open_with_flags(
            source,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        source.execute("VACUUM INTO ?1", params![candidate.to_string_lossy().to_string()])?;
    }

    let conn = Connection::open(candidate)?;
    initialize_schema(&conn)?;
    conn.prepare(&format!("SELECT {DAY_COLUMNS} FROM days LIMIT 1"))?;
    for kind in [PeriodKind::Week, PeriodKind::Month, PeriodKind::Year] {
        conn.prepare(&format!(
            "SELECT key, insertions, deletions, base_score, summary, created_at, updated_at
             FROM {} LIMIT 1",
            kind.table()
        ))?;
    }
    conn.prepare("SELECT key, value FROM store_meta LIMIT 1")?;
    conn.close().map_err(|(_, e)| Error::Store(e))?;
    Ok(())
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

fn remove_sidecars(path: &Path) -> std::io::Result<()> {
    for suffix in ["-wal", "-shm"] {
        let sidecar = with_suffix(path, suffix);
        if sidecar.exists() {
            fs::remove_file(sidecar)?;
        }
    }
    Ok(())
}

fn discard_store_files(path: &Path) {
    for file in [path.to_path_buf(), with_suffix(path, "-wal"), with_suffix(path, "-shm")] {
        if file.exists() {
            if let Err(e) = fs::remove_file(&file) {
                log::warn!("could not remove {}: {e}", file.display());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> AggregationStore {
        AggregationStore::open_in_memory(RatchetConfig::default()).expect("in-memory store")
    }

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").expect("date")
    }

    #[test]
    fn schema_initializes_with_expected_version() {
        let conn = Connection::open_in_memory().expect("in-memory db");
        initialize_schema(&conn).expect("schema init");
        let version: i64 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .expect("schema version");
        assert_eq!(version, DB_SCHEMA_VERSION);
    }

    #[test]
    fn iso_week_keys_follow_thursday_rule() {
        assert_eq!(week_key(date("2024-01-08")), "2024-W02");
        assert_eq!(week_key(date("2021-01-03")), "2020-W53");
        assert_eq!(week_key(date("2024-12-30")), "2025-W01");
        assert_eq!(month_key(date("2024-02-29")), "2024-02");
        assert_eq!(year_key(date("2024-02-29")), "2024");
    }

    #[test]
    fn period_bounds_cover_calendar_units() {
        assert_eq!(
            period_bounds(PeriodKind::Week, date("2024-01-10")),
            (date("2024-01-08"), date("2024-01-14"))
        );
        assert_eq!(
            period_bounds(PeriodKind::Month, date("2024-02-10")),
            (date("2024-02-01"), date("2024-02-29"))
        );
        assert_eq!(
            period_bounds(PeriodKind::Month, date("2023-12-31")),
            (date("2023-12-01"), date("2023-12-31"))
        );
    }

    #[test]
    fn accumulate_creates_day_and_caps_growth() {
        let store = store();
        let day = store.accumulate_day(date("2024-03-01"), 500, 0).expect("accumulate");
        assert_eq!(day.insertions, 500);
        assert_eq!(day.base_score, 135);
        assert_eq!(day.trend, 35);

        let again = store.accumulate_day(date("2024-03-01"), 10, 4).expect("accumulate");
        assert_eq!(again.insertions, 510);
        assert_eq!(again.deletions, 4);
        assert_eq!(again.base_score, 135);
    }

    #[test]
    fn ratchet_carries_across_gaps() {
        let store = store();
        store.accumulate_day(date("2024-03-01"), 500, 0).expect("day one");
        let later = store.accumulate_day(date("2024-03-05"), 0, 0).expect("later day");
        assert_eq!(later.base_score, 135);
        assert_eq!(later.trend, 0);
    }

    #[test]
    fn keep_max_policy_never_lowers_counts() {
        let store = store();
        store.accumulate_day(date("2024-03-02"), 40, 10).expect("poller write");

        let update = DayUpdate {
            insertions: Some(30),
            deletions: Some(12),
            summary: Some("## Done".to_string()),
            local_score: Some(44),
            ..Default::default()
        };
        let saved = store
            .save_day(date("2024-03-02"), &update, MergePolicy::KeepMax)
            .expect("save");
        assert_eq!(saved.insertions, 40);
        assert_eq!(saved.deletions, 12);
        assert_eq!(saved.summary.as_deref(), Some("## Done"));
        assert_eq!(saved.local_score, Some(44));

        let overwritten = store
            .save_day(
                date("2024-03-02"),
                &DayUpdate {
                    insertions: Some(5),
                    ..Default::default()
                },
                MergePolicy::Overwrite,
            )
            .expect("overwrite");
        assert_eq!(overwritten.insertions, 5);
        assert_eq!(overwritten.deletions, 12);
    }

    #[test]
    fn stale_trend_is_repaired_on_read() {
        let store = store();
        store.accumulate_day(date("2024-03-01"), 500, 0).expect("day one");
        store.accumulate_day(date("2024-03-02"), 10, 0).expect("day two");
        store
            .conn
            .execute("UPDATE days SET trend = 999 WHERE date = '2024-03-02'", [])
            .expect("corrupt trend");

        let repaired = store.get_day(date("2024-03-02")).expect("read").expect("row");
        assert_eq!(repaired.trend, repaired.base_score - 135);

        let stored: i64 = store
            .conn
            .query_row("SELECT trend FROM days WHERE date = '2024-03-02'", [], |r| r.get(0))
            .expect("stored trend");
        assert_eq!(stored, repaired.trend);
    }

    #[test]
    fn range_reads_are_inclusive_and_ordered() {
        let store = store();
        for d in ["2024-03-03", "2024-03-01", "2024-03-02", "2024-03-09"] {
            store.accumulate_day(date(d), 1, 1).expect("accumulate");
        }
        let days = store
            .get_days_range(date("2024-03-01"), date("2024-03-03"))
            .expect("range");
        let keys: Vec<_> = days.iter().map(|d| d.date.as_str()).collect();
        assert_eq!(keys, vec!["2024-03-01", "2024-03-02", "2024-03-03"]);
    }

    #[test]
    fn recent_raw_scores_exclude_today_and_old_days() {
        let store = store();
        for (d, raw) in [("2024-01-01", 90), ("2024-03-01", 40), ("2024-03-09", 60), ("2024-03-10", 70)] {
            store
                .save_day(
                    date(d),
                    &DayUpdate {
                        local_score_raw: Some(raw),
                        ..Default::default()
                    },
                    MergePolicy::Overwrite,
                )
                .expect("save");
        }
        let scores = store.recent_raw_scores(date("2024-03-10"), 30).expect("scores");
        assert_eq!(scores, vec![40, 60]);
    }

    #[test]
    fn rollups_sum_counts_and_take_latest_base() {
        let store = store();
        store.accumulate_day(date("2024-01-08"), 500, 0).expect("monday");
        store.accumulate_day(date("2024-01-10"), 20, 5).expect("wednesday");
        store.recompute_rollups(date("2024-01-10")).expect("rollups");

        let week = store.get_period(PeriodKind::Week, "2024-W02").expect("read").expect("week");
        assert_eq!(week.insertions, 520);
        assert_eq!(week.deletions, 5);
        let wednesday = store.get_day(date("2024-01-10")).expect("read").expect("day");
        assert_eq!(week.base_score, wednesday.base_score);

        let month = store.get_period(PeriodKind::Month, "2024-01").expect("read").expect("month");
        assert_eq!(month.insertions, 520);
        assert!(store.get_period(PeriodKind::Year, "2024").expect("read").is_some());
    }

    #[test]
    fn rollup_recomputation_is_idempotent() {
        let store = store();
        store.accumulate_day(date("2024-05-06"), 33, 7).expect("accumulate");
        store.recompute_rollups(date("2024-05-06")).expect("first");
        let first: Vec<_> = [PeriodKind::Week, PeriodKind::Month, PeriodKind::Year]
            .iter()
            .map(|kind| store.list_periods(*kind).expect("list"))
            .collect();

        std::thread::sleep(std::time::Duration::from_millis(1100));
        store.recompute_rollups(date("2024-05-06")).expect("second");
        let second: Vec<_> = [PeriodKind::Week, PeriodKind::Month, PeriodKind::Year]
            .iter()
            .map(|kind| store.list_periods(*kind).expect("list"))
            .collect();

        assert_eq!(first, second);
    }

    #[test]
    fn period_summary_survives_recompute() {
        let store = store();
        store.accumulate_day(date("2024-05-06"), 3, 1).expect("accumulate");
        store.recompute_rollups(date("2024-05-06")).expect("rollups");
        assert!(store
            .set_period_summary(PeriodKind::Month, "2024-05", "Busy month")
            .expect("summary"));
        store.accumulate_day(date("2024-05-07"), 3, 1).expect("accumulate");
        store.recompute_rollups(date("2024-05-07")).expect("rollups");

        let month = store.get_period(PeriodKind::Month, "2024-05").expect("read").expect("month");
        assert_eq!(month.summary.as_deref(), Some("Busy month"));
        assert_eq!(month.insertions, 6);
    }

    #[test]
    fn meta_values_round_trip() {
        let store = store();
        assert_eq!(store.get_meta("poller.last_commit").expect("read"), None);
        store.set_meta("poller.last_commit", "abc").expect("write");
        store.set_meta("poller.last_commit", "def").expect("write");
        assert_eq!(store.get_meta("poller.last_commit").expect("read").as_deref(), Some("def"));
    }

    #[test]
    fn import_requires_file_backed_store() {
        let mut store = store();
        let result = store.import_from(Path::new("/nonexistent.db"));
        assert!(matches!(result, Err(Error::ImportUnsupported)));
    }

    #[test]
    fn failed_import_keeps_the_current_store_usable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = AggregationStore::open_for_repo(dir.path(), RatchetConfig::default())
            .expect("store");
        store.accumulate_day(date("2024-02-01"), 40, 2).expect("seed");

        let unmigrated = dir.path().join("unmigrated.db");
        Connection::open(&unmigrated)
            .expect("open")
            .execute_batch("CREATE TABLE days (x INTEGER);")
            .expect("partial table");
        let mislabeled = dir.path().join("mislabeled.db");
        Connection::open(&mislabeled)
            .expect("open")
            .execute_batch("CREATE TABLE days (date TEXT PRIMARY KEY); PRAGMA user_version = 2;")
            .expect("partial table");

        for source in [&unmigrated, &mislabeled] {
            assert!(store.import_from(source).is_err(), "{}", source.display());
            let day = store.get_day(date("2024-02-01")).expect("read").expect("row");
            assert_eq!((day.insertions, day.deletions), (40, 2));
        }
        store.accumulate_day(date("2024-02-02"), 5, 0).expect("still writable");

        let leftovers = fs::read_dir(dir.path().join(STORE_DIR))
            .expect("store dir")
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().contains(".import-"))
            .count();
        assert_eq!(leftovers, 0);

        drop(store);
        let reopened = AggregationStore::open_for_repo(dir.path(), RatchetConfig::default())
            .expect("reopen");
        let days = reopened
            .get_days_range(date("2024-02-01"), date("2024-02-02"))
            .expect("range");
        assert_eq!(days.len(), 2);
    }

    #[test]
    fn import_from_missing_path_creates_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = AggregationStore::open_for_repo(dir.path(), RatchetConfig::default())
            .expect("store");
        let missing = dir.path().join("missing.db");

        assert!(store.import_from(&missing).is_err());
        assert!(!missing.exists());
        store.accumulate_day(date("2024-02-01"), 1, 0).expect("still writable");
    }

    #[test]
    fn rollup_base_reflects_repaired_days() {
        let store = store();
        store.accumulate_day(date("2024-03-04"), 10, 0).expect("monday");
        store.accumulate_day(date("2024-03-05"), 10, 0).expect("tuesday");
        store
            .save_day(
                date("2024-03-04"),
                &DayUpdate {
                    base_score: Some(400),
                    ..Default::default()
                },
                MergePolicy::KeepMax,
            )
            .expect("raise monday");

        let month = store
            .recompute_period(PeriodKind::Month, date("2024-03-05"))
            .expect("recompute")
            .expect("month");
        let tuesday = store.get_day(date("2024-03-05")).expect("read").expect("day");
        assert!(tuesday.base_score >= 400);
        assert_eq!(month.base_score, tuesday.base_score);
    }
}
