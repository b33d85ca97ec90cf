use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{Connection, Transaction, params};
use serde::Serialize;
use tracing::debug;

use crate::model::RunOutcome;
use crate::util::{ensure_directory, now_utc_string};

const DB_SCHEMA_VERSION: &str = "1";

const RUN_TABLES: [&str; 6] = [
    "failed_combinations",
    "error_log",
    "strategy_judgments",
    "page_validations",
    "extractions",
    "runs",
];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreCounts {
    pub runs: i64,
    pub completed: i64,
    pub failed: i64,
    pub extractions: i64,
    pub page_validations: i64,
    pub judgments: i64,
    pub errors: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredRun {
    pub run_id: String,
    pub document: String,
    pub stage: String,
    pub selected_strategy: Option<String>,
    pub selected_total: Option<f64>,
    pub finished_at: String,
}

/// SQLite-backed history of pipeline runs.
pub struct RunStore {
    connection: Connection,
}

impl RunStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            ensure_directory(parent)?;
        }
        let connection = Connection::open(path)
            .with_context(|| format!("failed to open run database {}", path.display()))?;
        configure_connection(&connection)?;
        ensure_schema(&connection)?;
        Ok(Self { connection })
    }

    /// Writes one run and all of its rows. Persisting the same run id again
    /// replaces the earlier rows.
    pub fn persist(&mut self, outcome: &RunOutcome) -> Result<()> {
        let tx = self.connection.transaction()?;
        for table in RUN_TABLES {
            tx.execute(&format!("DELETE FROM {table} WHERE run_id = ?1"), [&outcome.run_id])
                .with_context(|| format!("failed to clear {table} rows for run {}", outcome.run_id))?;
        }

        let selection = outcome.selection.as_ref();
        tx.execute(
            "
            INSERT INTO runs(
              run_id, document, sha256, stage, started_at, finished_at,
              selected_strategy, selected_total, rationale, total_cost_usd
            )
            VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ",
            params![
                outcome.run_id,
                outcome.document,
                outcome.sha256,
                outcome.stage.as_str(),
                outcome.started_at,
                outcome.finished_at,
                selection.map(|selection| selection.strategy.as_str()),
                selection.map(|selection| selection.total),
                selection.map(|selection| selection.rationale.as_str()),
                outcome.total_cost_usd(),
            ],
        )
        .with_context(|| format!("failed to insert run {}", outcome.run_id))?;

        insert_extractions(&tx, outcome)?;
        insert_validations(&tx, outcome)?;
        insert_judgments(&tx, outcome)?;
        insert_errors(&tx, outcome)?;

        tx.commit()?;
        debug!(run_id = %outcome.run_id, "run persisted");
        Ok(())
    }

    pub fn counts(&self) -> Result<StoreCounts> {
        Ok(StoreCounts {
            runs: query_count(&self.connection, "SELECT COUNT(*) FROM runs")?,
            completed: query_count(&self.connection, "SELECT COUNT(*) FROM runs WHERE stage = 'completed'")?,
            failed: query_count(&self.connection, "SELECT COUNT(*) FROM runs WHERE stage = 'failed'")?,
            extractions: query_count(&self.connection, "SELECT COUNT(*) FROM extractions")?,
            page_validations: query_count(&self.connection, "SELECT COUNT(*) FROM page_validations")?,
            judgments: query_count(&self.connection, "SELECT COUNT(*) FROM strategy_judgments")?,
            errors: query_count(&self.connection, "SELECT COUNT(*) FROM error_log")?,
        })
    }

    pub fn recent_runs(&self, limit: usize) -> Result<Vec<StoredRun>> {
        let mut statement = self.connection.prepare(
            "
            SELECT run_id, document, stage, selected_strategy, selected_total, finished_at
            FROM runs
            ORDER BY finished_at DESC, run_id DESC
            LIMIT ?1
            ",
        )?;
        let rows = statement.query_map([limit as i64], |row| {
            Ok(StoredRun {
                run_id: row.get(0)?,
                document: row.get(1)?,
                stage: row.get(2)?,
                selected_strategy: row.get(3)?,
                selected_total: row.get(4)?,
                finished_at: row.get(5)?,
            })
        })?;

        let mut runs = Vec::new();
        for row in rows {
            runs.push(row?);
        }
        Ok(runs)
    }
}

fn configure_connection(connection: &Connection) -> Result<()> {
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .context("failed to set journal_mode=WAL")?;
    connection
        .pragma_update(None, "synchronous", "NORMAL")
        .context("failed to set synchronous=NORMAL")?;
    Ok(())
}

fn ensure_schema(connection: &Connection) -> Result<()> {
    connection.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS metadata (
          key TEXT PRIMARY KEY,
          value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS runs (
          run_id TEXT PRIMARY KEY,
          document TEXT NOT NULL,
          sha256 TEXT NOT NULL,
          stage TEXT NOT NULL,
          started_at TEXT NOT NULL,
          finished_at TEXT NOT NULL,
          selected_strategy TEXT,
          selected_total REAL,
          rationale TEXT,
          total_cost_usd REAL NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS extractions (
          run_id TEXT NOT NULL,
          strategy TEXT NOT NULL,
          tool_version TEXT NOT NULL,
          status TEXT NOT NULL,
          error_message TEXT,
          total_page_count INTEGER NOT NULL,
          sampled_page_count INTEGER NOT NULL,
          sampled_pages_json TEXT NOT NULL,
          processing_time_ms REAL NOT NULL,
          cost_usd REAL NOT NULL,
          settings_json TEXT NOT NULL,
          PRIMARY KEY (run_id, strategy),
          FOREIGN KEY (run_id) REFERENCES runs(run_id)
        );

        CREATE TABLE IF NOT EXISTS page_validations (
          run_id TEXT NOT NULL,
          strategy TEXT NOT NULL,
          page_number INTEGER NOT NULL,
          label TEXT NOT NULL,
          passed INTEGER NOT NULL,
          confidence REAL NOT NULL,
          fallback_path_json TEXT NOT NULL,
          fallback_attempts INTEGER NOT NULL,
          processing_time_ms REAL NOT NULL,
          reason TEXT,
          issues_json TEXT NOT NULL,
          suggestions_json TEXT NOT NULL,
          PRIMARY KEY (run_id, strategy, page_number),
          FOREIGN KEY (run_id) REFERENCES runs(run_id)
        );

        CREATE TABLE IF NOT EXISTS strategy_judgments (
          run_id TEXT NOT NULL,
          strategy TEXT NOT NULL,
          total REAL NOT NULL,
          grade TEXT NOT NULL,
          s_read REAL NOT NULL,
          s_sent REAL NOT NULL,
          s_noise REAL NOT NULL,
          s_table REAL NOT NULL,
          s_fig REAL NOT NULL,
          speed_ms_per_page REAL NOT NULL,
          fallback_tools_json TEXT NOT NULL,
          pages_json TEXT NOT NULL,
          PRIMARY KEY (run_id, strategy),
          FOREIGN KEY (run_id) REFERENCES runs(run_id)
        );

        CREATE TABLE IF NOT EXISTS error_log (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          run_id TEXT NOT NULL,
          stage TEXT NOT NULL,
          message TEXT NOT NULL,
          error_type TEXT NOT NULL,
          timestamp TEXT NOT NULL,
          FOREIGN KEY (run_id) REFERENCES runs(run_id)
        );

        CREATE TABLE IF NOT EXISTS failed_combinations (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          run_id TEXT NOT NULL,
          strategy TEXT NOT NULL,
          average_confidence REAL NOT NULL,
          page_pass_rate REAL NOT NULL,
          timestamp TEXT NOT NULL,
          FOREIGN KEY (run_id) REFERENCES runs(run_id)
        );

        CREATE INDEX IF NOT EXISTS idx_runs_document ON runs(document, finished_at);
        CREATE INDEX IF NOT EXISTS idx_error_log_run ON error_log(run_id);
        CREATE INDEX IF NOT EXISTS idx_failed_combinations_run ON failed_combinations(run_id);
        ",
    )?;

    connection.execute(
        "INSERT INTO metadata(key, value) VALUES('db_schema_version', ?1)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
        [DB_SCHEMA_VERSION],
    )?;
    connection.execute(
        "INSERT INTO metadata(key, value) VALUES('db_updated_at', ?1)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
        [now_utc_string()],
    )?;

    Ok(())
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    serde_json::to_string(value).context("failed to serialize column value")
}

fn insert_extractions(tx: &Transaction<'_>, outcome: &RunOutcome) -> Result<()> {
    let mut statement = tx.prepare(
        "
        INSERT INTO extractions(
          run_id, strategy, tool_version, status, error_message, total_page_count,
          sampled_page_count, sampled_pages_json, processing_time_ms, cost_usd, settings_json
        )
        VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        ",
    )?;

    for record in &outcome.extractions {
        statement
            .execute(params![
                outcome.run_id,
                record.strategy,
                record.tool_version,
                record.status.as_str(),
                record.error_message,
                record.total_page_count as i64,
                record.sampled_page_count as i64,
                to_json(&record.sampled_pages)?,
                record.processing_time_ms,
                record.cost_usd,
                to_json(&record.settings)?,
            ])
            .with_context(|| format!("failed to insert extraction {}", record.strategy))?;
    }
    Ok(())
}

fn insert_validations(tx: &Transaction<'_>, outcome: &RunOutcome) -> Result<()> {
    let mut statement = tx.prepare(
        "
        INSERT INTO page_validations(
          run_id, strategy, page_number, label, passed, confidence, fallback_path_json,
          fallback_attempts, processing_time_ms, reason, issues_json, suggestions_json
        )
        VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
        ",
    )?;

    for validation in &outcome.validations {
        for page in &validation.pages {
            statement
                .execute(params![
                    outcome.run_id,
                    validation.strategy,
                    page.page_number,
                    page.label(),
                    page.passed,
                    page.confidence,
                    to_json(&page.fallback_path)?,
                    page.fallback_attempts as i64,
                    page.processing_time_ms,
                    page.notes.reason,
                    to_json(&page.notes.issues)?,
                    to_json(&page.notes.suggestions)?,
                ])
                .with_context(|| {
                    format!(
                        "failed to insert validation for {} page {}",
                        validation.strategy, page.page_number
                    )
                })?;
        }
    }
    Ok(())
}

fn insert_judgments(tx: &Transaction<'_>, outcome: &RunOutcome) -> Result<()> {
    let mut statement = tx.prepare(
        "
        INSERT INTO strategy_judgments(
          run_id, strategy, total, grade, s_read, s_sent, s_noise, s_table, s_fig,
          speed_ms_per_page, fallback_tools_json, pages_json
        )
        VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
        ",
    )?;

    for judgment in &outcome.judgments {
        statement
            .execute(params![
                outcome.run_id,
                judgment.strategy,
                judgment.total,
                judgment.grade.as_str(),
                judgment.scores.read,
                judgment.scores.sentence,
                judgment.scores.noise,
                judgment.scores.table,
                judgment.scores.figure,
                judgment.speed_ms_per_page,
                to_json(&judgment.fallback_tools)?,
                to_json(&judgment.pages)?,
            ])
            .with_context(|| format!("failed to insert judgment {}", judgment.strategy))?;
    }
    Ok(())
}

fn insert_errors(tx: &Transaction<'_>, outcome: &RunOutcome) -> Result<()> {
    let mut errors = tx.prepare(
        "
        INSERT INTO error_log(run_id, stage, message, error_type, timestamp)
        VALUES(?1, ?2, ?3, ?4, ?5)
        ",
    )?;
    for entry in &outcome.error_log {
        errors.execute(params![
            outcome.run_id,
            entry.stage.as_str(),
            entry.message,
            entry.error_type,
            entry.timestamp,
        ])?;
    }

    let mut combinations = tx.prepare(
        "
        INSERT INTO failed_combinations(run_id, strategy, average_confidence, page_pass_rate, timestamp)
        VALUES(?1, ?2, ?3, ?4, ?5)
        ",
    )?;
    for combination in &outcome.failed_combinations {
        combinations.execute(params![
            outcome.run_id,
            combination.strategy,
            combination.average_confidence,
            combination.page_pass_rate,
            combination.timestamp,
        ])?;
    }
    Ok(())
}

fn query_count(connection: &Connection, sql: &str) -> Result<i64> {
    let count = connection
        .query_row(sql, [], |row| row.get(0))
        .with_context(|| format!("failed to run count query: {sql}"))?;
    Ok(count)
}
