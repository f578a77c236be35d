use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};

use crate::model::CombineRunManifest;
use crate::pages::Decisions;
use crate::pages::reconcile::PageDecision;

pub const LEDGER_SCHEMA_VERSION: &str = "0.1.0";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerTotals {
    pub runs: i64,
    pub decisions: i64,
    pub unavailable: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerRun {
    pub run_id: String,
    pub document: String,
    pub strategy: String,
    pub completed_at: String,
    pub pages_total: i64,
    pub pages_unavailable: i64,
}

pub fn open_ledger(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        crate::util::ensure_directory(parent)?;
    }
    let connection =
        Connection::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    configure_connection(&connection)?;
    ensure_schema(&connection)?;
    Ok(connection)
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

pub fn ensure_schema(connection: &Connection) -> Result<()> {
    connection
        .execute_batch(
            "
            CREATE TABLE IF NOT EXISTS metadata (
              key TEXT PRIMARY KEY,
              value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS combine_runs (
              run_id TEXT PRIMARY KEY,
              document TEXT NOT NULL,
              primary_source TEXT NOT NULL,
              strategy TEXT NOT NULL,
              started_at TEXT NOT NULL,
              completed_at TEXT NOT NULL,
              pages_total INTEGER NOT NULL,
              pages_unavailable INTEGER NOT NULL,
              report_path TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS page_decisions (
              run_id TEXT NOT NULL REFERENCES combine_runs(run_id),
              page INTEGER NOT NULL,
              status TEXT NOT NULL,
              selected_source TEXT,
              reason TEXT,
              confidence TEXT,
              detail TEXT NOT NULL,
              PRIMARY KEY (run_id, page)
            );

            CREATE INDEX IF NOT EXISTS idx_page_decisions_status ON page_decisions(status);
            ",
        )
        .context("failed to create ledger schema")?;

    connection
        .execute(
            "INSERT INTO metadata(key, value) VALUES('schema_version', ?1)
             ON CONFLICT(key) DO UPDATE SET value=excluded.value",
            params![LEDGER_SCHEMA_VERSION],
        )
        .context("failed to record ledger schema version")?;

    Ok(())
}

/// Stores one combine run and its per-page decisions. Re-recording a run id
/// replaces its earlier rows.
pub fn record_run(
    connection: &mut Connection,
    manifest: &CombineRunManifest,
    decisions: &Decisions,
) -> Result<usize> {
    let tx = connection.transaction()?;

    tx.execute(
        "DELETE FROM page_decisions WHERE run_id = ?1",
        params![manifest.run_id],
    )?;
    tx.execute(
        "
        INSERT INTO combine_runs(
          run_id, document, primary_source, strategy, started_at, completed_at,
          pages_total, pages_unavailable, report_path
        )
        VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        ON CONFLICT(run_id) DO UPDATE SET
          document=excluded.document,
          primary_source=excluded.primary_source,
          strategy=excluded.strategy,
          started_at=excluded.started_at,
          completed_at=excluded.completed_at,
          pages_total=excluded.pages_total,
          pages_unavailable=excluded.pages_unavailable,
          report_path=excluded.report_path
        ",
        params![
            manifest.run_id,
            manifest.document,
            manifest.primary_source,
            manifest.strategy,
            manifest.started_at,
            manifest.completed_at,
            manifest.counts.pages_total as i64,
            manifest.counts.pages_unavailable as i64,
            manifest.paths.report_path,
        ],
    )?;

    {
        let mut statement = tx.prepare(
            "
            INSERT INTO page_decisions(run_id, page, status, selected_source, reason, confidence, detail)
            VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ",
        )?;

        for (page, decision) in decisions {
            match decision {
                PageDecision::Selected(selection) => {
                    statement.execute(params![
                        manifest.run_id,
                        page,
                        "selected",
                        selection.selected_source,
                        selection.reason.label(),
                        selection.confidence.as_str(),
                        selection.reason.describe(),
                    ])?;
                }
                PageDecision::Unavailable { reason } => {
                    statement.execute(params![
                        manifest.run_id,
                        page,
                        "unavailable",
                        Option::<String>::None,
                        Option::<String>::None,
                        Option::<String>::None,
                        reason.to_string(),
                    ])?;
                }
            }
        }
    }

    tx.commit()?;
    Ok(decisions.len())
}

pub fn totals(connection: &Connection) -> Result<LedgerTotals> {
    Ok(LedgerTotals {
        runs: query_count(connection, "SELECT COUNT(*) FROM combine_runs")?,
        decisions: query_count(connection, "SELECT COUNT(*) FROM page_decisions")?,
        unavailable: query_count(
            connection,
            "SELECT COUNT(*) FROM page_decisions WHERE status = 'unavailable'",
        )?,
    })
}

pub fn latest_run(connection: &Connection) -> Result<Option<LedgerRun>> {
    let run = connection
        .query_row(
            "
            SELECT run_id, document, strategy, completed_at, pages_total, pages_unavailable
            FROM combine_runs
            ORDER BY completed_at DESC, run_id DESC
            LIMIT 1
            ",
            [],
            |row| {
                Ok(LedgerRun {
                    run_id: row.get(0)?,
                    document: row.get(1)?,
                    strategy: row.get(2)?,
                    completed_at: row.get(3)?,
                    pages_total: row.get(4)?,
                    pages_unavailable: row.get(5)?,
                })
            },
        )
        .optional()
        .context("failed to read latest combine run")?;
    Ok(run)
}

fn query_count(connection: &Connection, sql: &str) -> Result<i64> {
    let count = connection
        .query_row(sql, [], |row| row.get(0))
        .with_context(|| format!("failed to run count query: {sql}"))?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::model::{CombineCounts, CombinePaths};
    use crate::pages::reconcile::{
        Confidence, SelectionDecision, SelectionReason, UnavailableReason,
    };

    fn manifest(run_id: &str, completed_at: &str, unavailable: usize) -> CombineRunManifest {
        CombineRunManifest {
            manifest_version: 1,
            run_id: run_id.to_string(),
            document: "policy".to_string(),
            primary_source: "ocr".to_string(),
            strategy: "rule".to_string(),
            started_at: completed_at.to_string(),
            completed_at: completed_at.to_string(),
            sources: Vec::new(),
            selection: Vec::new(),
            counts: CombineCounts {
                pages_total: 2,
                pages_assembled: 2 - unavailable,
                pages_unavailable: unavailable,
                pages_recovered: 0,
                chars_total: 10,
                pages_by_source: BTreeMap::new(),
            },
            paths: CombinePaths {
                output_dir: "out".to_string(),
                report_path: "out/policy_combined.txt".to_string(),
                decisions_path: "out/policy_decisions.json".to_string(),
                manifest_path: "out/policy_combine_run.json".to_string(),
                db_path: None,
            },
            warnings: Vec::new(),
        }
    }

    fn decisions() -> Decisions {
        let mut decisions = Decisions::new();
        decisions.insert(
            1,
            PageDecision::Selected(SelectionDecision {
                selected_source: "ocr".to_string(),
                reason: SelectionReason::PrimaryPreferred,
                confidence: Confidence::High,
            }),
        );
        decisions.insert(2, PageDecision::unavailable(UnavailableReason::NoContent));
        decisions
    }

    fn ledger() -> Connection {
        let connection = Connection::open_in_memory().expect("in-memory db");
        ensure_schema(&connection).expect("schema");
        connection
    }

    #[test]
    fn empty_ledger_has_no_latest_run() {
        let connection = ledger();
        assert_eq!(
            totals(&connection).expect("totals"),
            LedgerTotals {
                runs: 0,
                decisions: 0,
                unavailable: 0
            }
        );
        assert!(latest_run(&connection).expect("latest").is_none());
    }

    #[test]
    fn recorded_runs_are_counted_and_rerecording_replaces_rows() {
        let mut connection = ledger();
        record_run(&mut connection, &manifest("run-a", "2024-01-01T00:00:00Z", 1), &decisions())
            .expect("record a");
        record_run(&mut connection, &manifest("run-b", "2024-02-01T00:00:00Z", 1), &decisions())
            .expect("record b");
        record_run(&mut connection, &manifest("run-b", "2024-02-01T00:00:00Z", 1), &decisions())
            .expect("record b again");

        let totals = totals(&connection).expect("totals");
        assert_eq!(totals.runs, 2);
        assert_eq!(totals.decisions, 4);
        assert_eq!(totals.unavailable, 2);

        let latest = latest_run(&connection).expect("latest").expect("a run");
        assert_eq!(latest.run_id, "run-b");
        assert_eq!(latest.pages_unavailable, 1);

        let reason: String = connection
            .query_row(
                "SELECT reason FROM page_decisions WHERE run_id = 'run-a' AND page = 1",
                [],
                |row| row.get(0),
            )
            .expect("decision row");
        assert_eq!(reason, "fallback-preferred");
    }
}
