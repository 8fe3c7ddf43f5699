//! Durable template storage on local SQLite (Turso).
//!
//! One row per `(label, template_id)`. The structured parts of a template
//! (signature, patterns, confidences) are stored as JSON columns; rows
//! are replaced atomically so readers see either the old or the new
//! template, never a torn one.

use crate::errors::ExtractError;
use crate::template::{FieldPattern, StructuralSignature, Template};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tracing::{debug, info};
use turso::{params, Database};
use uuid::Uuid;

const TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS templates (
    id TEXT PRIMARY KEY,
    label TEXT NOT NULL,
    sample_count INTEGER NOT NULL,
    signature TEXT NOT NULL,
    field_patterns TEXT NOT NULL,
    field_confidence TEXT NOT NULL,
    reference_text TEXT NOT NULL,
    coord_space TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
)";

const INDEX_SQL: &str = "CREATE INDEX IF NOT EXISTS idx_templates_label ON templates(label)";

#[derive(Clone)]
pub struct TemplateStore {
    db: Database,
    max_per_label: usize,
}

impl TemplateStore {
    /// Opens (or creates) the store at `db_path`; `:memory:` is accepted
    /// for tests.
    pub async fn open(db_path: &str, max_per_label: usize) -> Result<Self, ExtractError> {
        let db = turso::Builder::new_local(db_path).build().await?;
        let conn = db.connect()?;
        // WAL improves concurrent reader behaviour on file-backed stores.
        conn.query("PRAGMA journal_mode=WAL;", ()).await?;
        conn.execute(TABLE_SQL, ()).await?;
        conn.execute(INDEX_SQL, ()).await?;
        Ok(Self { db, max_per_label })
    }

    /// All templates for a label, most-sampled (then most recent) first.
    pub async fn list(&self, label: &str) -> Result<Vec<Template>, ExtractError> {
        let conn = self.db.connect()?;
        let mut rows = conn
            .query(
                "SELECT id, label, sample_count, signature, field_patterns, field_confidence,
                        reference_text, coord_space, created_at, updated_at
                 FROM templates WHERE label = ?
                 ORDER BY sample_count DESC, updated_at DESC",
                params![label],
            )
            .await?;
        let mut templates = Vec::new();
        while let Some(row) = rows.next().await? {
            templates.push(row_to_template(&row)?);
        }
        Ok(templates)
    }

    pub async fn get(&self, label: &str, id: Uuid) -> Result<Option<Template>, ExtractError> {
        let conn = self.db.connect()?;
        let mut rows = conn
            .query(
                "SELECT id, label, sample_count, signature, field_patterns, field_confidence,
                        reference_text, coord_space, created_at, updated_at
                 FROM templates WHERE label = ? AND id = ?",
                params![label, id.to_string()],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_template(&row)?)),
            None => Ok(None),
        }
    }

    /// Inserts or replaces a template by id, then trims the label back
    /// under its cap by dropping the weakest template.
    pub async fn upsert(&self, template: &Template) -> Result<(), ExtractError> {
        let conn = self.db.connect()?;
        conn.execute(
            "INSERT OR REPLACE INTO templates
             (id, label, sample_count, signature, field_patterns, field_confidence,
              reference_text, coord_space, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                template.id.to_string(),
                template.label.clone(),
                template.sample_count as i64,
                serde_json::to_string(&template.signature)?,
                serde_json::to_string(&template.field_patterns)?,
                serde_json::to_string(&template.field_confidence)?,
                template.reference_text.clone(),
                template.coord_space.clone(),
                template.created_at.to_rfc3339(),
                template.updated_at.to_rfc3339(),
            ],
        )
        .await?;
        debug!(label = %template.label, id = %template.id, "Upserted template");
        self.enforce_label_cap(&template.label).await
    }

    pub async fn delete(&self, label: &str, id: Uuid) -> Result<(), ExtractError> {
        let conn = self.db.connect()?;
        conn.execute(
            "DELETE FROM templates WHERE label = ? AND id = ?",
            params![label, id.to_string()],
        )
        .await?;
        Ok(())
    }

    pub async fn count_per_label(&self) -> Result<BTreeMap<String, u64>, ExtractError> {
        let conn = self.db.connect()?;
        let mut rows = conn
            .query(
                "SELECT label, COUNT(*) FROM templates GROUP BY label",
                (),
            )
            .await?;
        let mut counts = BTreeMap::new();
        while let Some(row) = rows.next().await? {
            let label: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            counts.insert(label, count as u64);
        }
        Ok(counts)
    }

    /// Evicts the lowest-confidence, lowest-sample-count, oldest template
    /// while the label exceeds its cap.
    async fn enforce_label_cap(&self, label: &str) -> Result<(), ExtractError> {
        let templates = self.list(label).await?;
        if templates.len() <= self.max_per_label {
            return Ok(());
        }
        let mut ranked = templates;
        ranked.sort_by(|a, b| {
            a.mean_confidence()
                .partial_cmp(&b.mean_confidence())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.sample_count.cmp(&b.sample_count))
                .then(a.updated_at.cmp(&b.updated_at))
        });
        let excess = ranked.len() - self.max_per_label;
        for template in ranked.into_iter().take(excess) {
            info!(
                label,
                id = %template.id,
                confidence = template.mean_confidence(),
                "Evicting weakest template over per-label cap"
            );
            self.delete(label, template.id).await?;
        }
        Ok(())
    }
}

fn row_to_template(row: &turso::Row) -> Result<Template, ExtractError> {
    let id: String = row.get(0)?;
    let label: String = row.get(1)?;
    let sample_count: i64 = row.get(2)?;
    let signature: String = row.get(3)?;
    let field_patterns: String = row.get(4)?;
    let field_confidence: String = row.get(5)?;
    let reference_text: String = row.get(6)?;
    let coord_space: String = row.get(7)?;
    let created_at: String = row.get(8)?;
    let updated_at: String = row.get(9)?;

    let signature: StructuralSignature = serde_json::from_str(&signature)?;
    let field_patterns: BTreeMap<String, FieldPattern> = serde_json::from_str(&field_patterns)?;
    let field_confidence: BTreeMap<String, f64> = serde_json::from_str(&field_confidence)?;

    Ok(Template {
        id: Uuid::parse_str(&id)
            .map_err(|e| ExtractError::Internal(format!("bad template id {id}: {e}")))?,
        label,
        sample_count: sample_count as u32,
        signature,
        field_patterns,
        field_confidence,
        reference_text,
        coord_space,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, ExtractError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| ExtractError::Internal(format!("bad timestamp {raw}: {e}")))
}

impl std::fmt::Debug for TemplateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateStore")
            .field("max_per_label", &self.max_per_label)
            .finish_non_exhaustive()
    }
}
