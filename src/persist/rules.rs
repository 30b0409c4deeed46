//! Rule-change proposals: pending rows, approval, and file application.
//!
//! A successful run (or the failure-learning loop) produces candidate rule
//! additions. They sit in `rule_changes` as `pending` until a reviewer
//! approves or rejects them; approval appends the block to the target rule
//! document with an auto-append marker, refusing duplicates.

use std::path::Path;

use anyhow::Context;

use super::{now_iso, Database};

/// Marker prefix for blocks appended by approval. The duplicate check
/// splits existing documents on this marker.
const AUTO_APPEND_MARKER: &str = "\n\n---\n\n## Auto-appended (run_id:";

/// A rule-change row as stored.
#[derive(Debug, Clone)]
pub struct RuleChangeRecord {
    pub id: String,
    pub run_id: String,
    pub rule_name: String,
    pub added_block: String,
    pub genre: Option<String>,
    pub status: String,
    pub reviewer: Option<String>,
    pub created_at: String,
}

impl Database {
    /// Insert one pending rule-change row per non-empty improvement block.
    ///
    /// # Errors
    ///
    /// Returns an error if a write fails.
    pub async fn save_pending_improvements(
        &self,
        run_id: &str,
        improvements: &[(String, String)],
        genre: Option<&str>,
    ) -> anyhow::Result<Vec<String>> {
        let mut ids = Vec::new();
        for (rule_name, block) in improvements {
            let block = block.trim();
            if block.is_empty() {
                continue;
            }
            let id = format!("rc_{}", &uuid::Uuid::new_v4().simple().to_string()[..12]);
            let now = now_iso();
            sqlx::query(
                "INSERT INTO rule_changes (id, run_id, rule_name, added_block, genre, status,
                     created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, ?6)",
            )
            .bind(&id)
            .bind(run_id)
            .bind(rule_name)
            .bind(block)
            .bind(genre)
            .bind(&now)
            .execute(self.pool())
            .await
            .context("failed to save rule change")?;
            ids.push(id);
        }
        Ok(ids)
    }

    /// List rule changes, optionally filtered by status.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub async fn list_rule_changes(
        &self,
        status: Option<&str>,
    ) -> anyhow::Result<Vec<RuleChangeRecord>> {
        type Row = (
            String,
            String,
            String,
            String,
            Option<String>,
            String,
            Option<String>,
            String,
        );
        let rows: Vec<Row> = match status {
            Some(status) => {
                sqlx::query_as(
                    "SELECT id, run_id, rule_name, added_block, genre, status, reviewer, created_at
                     FROM rule_changes WHERE status = ?1 ORDER BY created_at DESC",
                )
                .bind(status)
                .fetch_all(self.pool())
                .await
            }
            None => {
                sqlx::query_as(
                    "SELECT id, run_id, rule_name, added_block, genre, status, reviewer, created_at
                     FROM rule_changes ORDER BY created_at DESC",
                )
                .fetch_all(self.pool())
                .await
            }
        }
        .context("failed to list rule changes")?;

        Ok(rows
            .into_iter()
            .map(
                |(id, run_id, rule_name, added_block, genre, status, reviewer, created_at)| {
                    RuleChangeRecord {
                        id,
                        run_id,
                        rule_name,
                        added_block,
                        genre,
                        status,
                        reviewer,
                        created_at,
                    }
                },
            )
            .collect())
    }

    /// Mark a rule change approved or rejected.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn set_rule_change_status(
        &self,
        id: &str,
        status: &str,
        reviewer: &str,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE rule_changes SET status = ?2, reviewer = ?3, updated_at = ?4 WHERE id = ?1",
        )
        .bind(id)
        .bind(status)
        .bind(reviewer)
        .bind(now_iso())
        .execute(self.pool())
        .await
        .context("failed to update rule change")?;
        Ok(())
    }

    /// Whether a similar candidate (same rule, category keyword, reason
    /// prefix inside the block) already exists as pending or approved.
    /// Used by failure learning to avoid re-drafting the same rule.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub async fn rule_candidate_exists(
        &self,
        rule_name: &str,
        category: &str,
        reason: &str,
    ) -> anyhow::Result<bool> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT added_block FROM rule_changes
             WHERE rule_name = ?1 AND status IN ('pending', 'approved') LIMIT 50",
        )
        .bind(rule_name)
        .fetch_all(self.pool())
        .await
        .context("failed to query rule candidates")?;

        let reason_prefix: String = reason.chars().take(30).collect();
        Ok(rows.iter().any(|(block,)| {
            block.contains(category) && (reason_prefix.is_empty() || block.contains(&reason_prefix))
        }))
    }
}

/// Short signature of a block for duplicate detection: its first three
/// lines, trimmed.
fn block_signature(block: &str) -> Vec<String> {
    block
        .trim()
        .lines()
        .take(3)
        .map(|line| line.trim().to_owned())
        .collect()
}

/// Whether an existing document already contains the block downstream of
/// any previous auto-append marker.
fn is_duplicate_block(existing: &str, block: &str) -> bool {
    let signature = block_signature(block);
    if signature.is_empty() {
        return false;
    }
    existing
        .split(AUTO_APPEND_MARKER)
        .skip(1)
        .any(|appended| block_signature(appended) == signature || appended.contains(&signature.join("\n")))
}

/// Append an approved rule change to its target rule document.
///
/// The appended block carries a separator and a header naming the
/// originating run (and genre when present). Returns `false` without
/// writing when the block is already present downstream of a previous
/// auto-append.
///
/// # Errors
///
/// Returns an error if the rule file cannot be read or written.
pub fn apply_approved_change(
    rules_dir: &Path,
    change: &RuleChangeRecord,
) -> anyhow::Result<bool> {
    let content = change.added_block.trim();
    if content.is_empty() || change.rule_name.is_empty() {
        return Ok(false);
    }

    let mut header = format!("## Auto-appended (run_id: {}", change.run_id);
    if let Some(genre) = change.genre.as_deref().filter(|g| !g.is_empty()) {
        header.push_str(&format!(", genre: {genre}"));
    }
    header.push_str(")\n\n");

    // saas_<name> rules live under a saas/ subdirectory of the rules tree.
    let rule_path = if let Some(saas) = change.rule_name.strip_prefix("saas_") {
        let dir = rules_dir.join("saas");
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        dir.join(format!("{saas}_rules.md"))
    } else {
        std::fs::create_dir_all(rules_dir)
            .with_context(|| format!("failed to create {}", rules_dir.display()))?;
        rules_dir.join(format!("{}.md", change.rule_name))
    };

    let appendix = format!("\n\n---\n\n{header}{content}\n");

    if rule_path.exists() {
        let existing = std::fs::read_to_string(&rule_path)
            .with_context(|| format!("failed to read {}", rule_path.display()))?;
        if is_duplicate_block(&existing, content) {
            return Ok(false);
        }
        std::fs::write(&rule_path, format!("{}{appendix}", existing.trim_end()))
            .with_context(|| format!("failed to write {}", rule_path.display()))?;
    } else if content.starts_with('#') {
        std::fs::write(&rule_path, format!("{content}{appendix}"))
            .with_context(|| format!("failed to write {}", rule_path.display()))?;
    } else {
        std::fs::write(
            &rule_path,
            format!("# {}\n\n{content}{appendix}", change.rule_name),
        )
        .with_context(|| format!("failed to write {}", rule_path.display()))?;
    }

    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(rule_name: &str, block: &str) -> RuleChangeRecord {
        RuleChangeRecord {
            id: "rc_test".to_owned(),
            run_id: "run-9".to_owned(),
            rule_name: rule_name.to_owned(),
            added_block: block.to_owned(),
            genre: Some("admin".to_owned()),
            status: "approved".to_owned(),
            reviewer: Some("reviewer@example".to_owned()),
            created_at: "2026-01-01T00:00:00Z".to_owned(),
        }
    }

    #[tokio::test]
    async fn test_pending_rows_skip_empty_blocks() {
        let db = Database::open_in_memory().await.expect("open");
        let improvements = vec![
            ("spec_rules".to_owned(), "## Add acceptance criteria".to_owned()),
            ("coder_rules".to_owned(), "   ".to_owned()),
        ];
        let ids = db
            .save_pending_improvements("run-1", &improvements, None)
            .await
            .expect("save");
        assert_eq!(ids.len(), 1);
        let pending = db.list_rule_changes(Some("pending")).await.expect("list");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].rule_name, "spec_rules");
    }

    #[tokio::test]
    async fn test_approve_updates_status() {
        let db = Database::open_in_memory().await.expect("open");
        let ids = db
            .save_pending_improvements(
                "run-1",
                &[("fix_rules".to_owned(), "## Retry carefully".to_owned())],
                None,
            )
            .await
            .expect("save");
        db.set_rule_change_status(&ids[0], "approved", "alex")
            .await
            .expect("approve");
        let rows = db.list_rule_changes(Some("approved")).await.expect("list");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].reviewer.as_deref(), Some("alex"));
    }

    #[tokio::test]
    async fn test_candidate_dedup() {
        let db = Database::open_in_memory().await.expect("open");
        db.save_pending_improvements(
            "run-1",
            &[(
                "saas_kintone".to_owned(),
                "## auth_error\n- token refresh before writes: ERR_X".to_owned(),
            )],
            None,
        )
        .await
        .expect("save");
        assert!(db
            .rule_candidate_exists("saas_kintone", "auth_error", "ERR_X")
            .await
            .expect("check"));
        assert!(!db
            .rule_candidate_exists("saas_kintone", "rate_limit", "ERR_Y")
            .await
            .expect("check"));
    }

    #[test]
    fn test_apply_creates_file_with_marker() {
        let dir = tempfile::tempdir().expect("tempdir");
        let applied = apply_approved_change(dir.path(), &change("review_rules", "## New check"))
            .expect("apply");
        assert!(applied);
        let content =
            std::fs::read_to_string(dir.path().join("review_rules.md")).expect("read");
        assert!(content.contains("## Auto-appended (run_id: run-9, genre: admin)"));
        assert!(content.contains("## New check"));
    }

    #[test]
    fn test_apply_refuses_duplicate() {
        let dir = tempfile::tempdir().expect("tempdir");
        let record = change("review_rules", "## New check\n- point one\n- point two");
        assert!(apply_approved_change(dir.path(), &record).expect("first"));
        assert!(!apply_approved_change(dir.path(), &record).expect("second"));

        let content =
            std::fs::read_to_string(dir.path().join("review_rules.md")).expect("read");
        assert_eq!(content.matches("## New check").count(), 1);
    }

    #[test]
    fn test_apply_routes_saas_rules() {
        let dir = tempfile::tempdir().expect("tempdir");
        let applied =
            apply_approved_change(dir.path(), &change("saas_freee", "## Avoid bulk deletes"))
                .expect("apply");
        assert!(applied);
        assert!(dir.path().join("saas/freee_rules.md").exists());
    }

    #[test]
    fn test_apply_appends_to_existing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("review_rules.md");
        std::fs::write(&path, "# Review rules\n\n- existing\n").expect("seed");
        apply_approved_change(dir.path(), &change("review_rules", "## Extra")).expect("apply");
        let content = std::fs::read_to_string(&path).expect("read");
        assert!(content.starts_with("# Review rules"));
        assert!(content.contains("## Extra"));
    }
}
