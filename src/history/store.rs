//! Run history store

use super::schema::init_schema;
use crate::tools::ActionOutcome;
use crate::workflow::WorkflowRun;
use anyhow::{Context, Result};
use rusqlite::Connection;
use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunKind {
    Action,
    Workflow,
}

impl fmt::Display for RunKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Action => "action",
            Self::Workflow => "workflow",
        })
    }
}

impl FromStr for RunKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "action" => Ok(Self::Action),
            "workflow" => Ok(Self::Workflow),
            other => Err(format!("unknown run kind '{other}'")),
        }
    }
}

/// One recorded run
#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub id: i64,
    pub kind: RunKind,
    pub name: String,
    pub success: bool,
    pub exit_codes: Vec<i32>,
    pub duration_ms: Option<i64>,
    pub detail: Option<String>,
    pub created_at: String,
}

/// History database
pub struct History {
    conn: Connection,
}

impl History {
    /// Open or create the history database
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open history database at {}", path.display()))?;

        init_schema(&conn)?;

        Ok(Self { conn })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory history")?;
        init_schema(&conn)?;
        Ok(Self { conn })
    }

    fn insert(
        &mut self,
        kind: RunKind,
        name: &str,
        success: bool,
        exit_codes: &[i32],
        duration_ms: u64,
        detail: Option<&str>,
    ) -> Result<i64> {
        let now = chrono::Local::now().to_rfc3339();
        let codes = serde_json::to_string(exit_codes)?;

        self.conn.execute(
            "INSERT INTO runs (kind, name, success, exit_codes, duration_ms, detail, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            (
                kind.to_string(),
                name,
                success,
                &codes,
                duration_ms as i64,
                detail,
                &now,
            ),
        )?;

        Ok(self.conn.last_insert_rowid())
    }

    /// Record an action run
    pub fn record_action(&mut self, outcome: &ActionOutcome) -> Result<i64> {
        let failed = outcome.failed_exit_codes();
        let detail = (!failed.is_empty()).then(|| {
            let codes: Vec<String> = failed.iter().map(i32::to_string).collect();
            format!("failed exit codes: {}", codes.join(", "))
        });
        self.insert(
            RunKind::Action,
            &outcome.action,
            outcome.all_succeeded(),
            &outcome.exit_codes(),
            outcome.duration_ms(),
            detail.as_deref(),
        )
    }

    /// Record a workflow run
    pub fn record_workflow(&mut self, run: &WorkflowRun) -> Result<i64> {
        let failed = run.failed_steps();
        let detail = if run.cancelled {
            Some("cancelled".to_string())
        } else if failed.is_empty() {
            None
        } else {
            Some(format!("failed steps: {}", failed.join(", ")))
        };
        self.insert(
            RunKind::Workflow,
            &run.name,
            run.success,
            &run.exit_codes(),
            run.duration.as_millis() as u64,
            detail.as_deref(),
        )
    }

    /// Most recent runs first
    pub fn recent(&self, limit: usize) -> Result<Vec<RunRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, kind, name, success, exit_codes, duration_ms, detail, created_at
             FROM runs
             ORDER BY id DESC
             LIMIT ?1",
        )?;

        let rows = stmt
            .query_map([limit as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, bool>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<i64>>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, String>(7)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(
                |(id, kind, name, success, codes, duration_ms, detail, created_at)| {
                    Ok(RunRecord {
                        id,
                        kind: kind.parse().map_err(anyhow::Error::msg)?,
                        name,
                        success,
                        exit_codes: serde_json::from_str(&codes)
                            .with_context(|| format!("Invalid exit codes in run {id}"))?,
                        duration_ms,
                        detail,
                        created_at,
                    })
                },
            )
            .collect()
    }

    /// Delete every record, returning how many were removed
    pub fn clear(&mut self) -> Result<usize> {
        Ok(self.conn.execute("DELETE FROM runs", [])?)
    }
}
