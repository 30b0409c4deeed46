//! Row-level-security check for SQL artifact sets.
//!
//! Every `CREATE TABLE` declaring a tenant-id column must also enable row
//! level security and carry policies covering reads and writes. Tables
//! without a tenant column (lookup/master tables) are exempt.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;

use super::CheckResult;

/// Column name that marks a table as tenant-owned.
const TENANT_COLUMN: &str = "tenant_id";

fn create_table_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?is)CREATE\s+TABLE\s+(?:IF\s+NOT\s+EXISTS\s+)?(\w+)\s*\((.*?)\);")
            .unwrap_or_else(|e| panic!("invalid create-table pattern: {e}"))
    })
}

fn extract_create_tables(sql: &str) -> Vec<(String, String)> {
    create_table_re()
        .captures_iter(sql)
        .map(|caps| (caps[1].to_owned(), caps[2].to_owned()))
        .collect()
}

fn has_tenant_column(table_body: &str) -> bool {
    let pattern = format!(r"(?i)\b{TENANT_COLUMN}\b");
    Regex::new(&pattern).map(|re| re.is_match(table_body)).unwrap_or(false)
}

fn has_rls_enabled(full_sql: &str, table: &str) -> bool {
    let pattern = format!(
        r"(?i)ALTER\s+TABLE\s+{}\s+ENABLE\s+ROW\s+LEVEL\s+SECURITY",
        regex::escape(table)
    );
    Regex::new(&pattern).map(|re| re.is_match(full_sql)).unwrap_or(false)
}

fn has_policy(full_sql: &str, table: &str, operation: &str) -> bool {
    let pattern = format!(
        r"(?is)CREATE\s+POLICY\s+\S+\s+ON\s+{}\s+.*?FOR\s+{}",
        regex::escape(table),
        operation
    );
    Regex::new(&pattern).map(|re| re.is_match(full_sql)).unwrap_or(false)
}

/// Validate row-level security across every `.sql` artifact.
pub fn run_rls_check(artifacts: &BTreeMap<String, String>) -> CheckResult {
    let mut findings = Vec::new();

    for (path, content) in artifacts {
        if !path.ends_with(".sql") {
            continue;
        }
        for (table, body) in extract_create_tables(content) {
            if !has_tenant_column(&body) {
                // Master/lookup table: exempt.
                continue;
            }
            if !has_rls_enabled(content, &table) {
                findings.push(format!(
                    "[{path}] table `{table}` has a {TENANT_COLUMN} column but no ENABLE ROW LEVEL SECURITY"
                ));
                continue;
            }
            if has_policy(content, &table, "ALL") {
                continue;
            }
            let mut missing = Vec::new();
            for op in ["SELECT", "INSERT", "UPDATE"] {
                if !has_policy(content, &table, op) {
                    missing.push(op);
                }
            }
            if !missing.is_empty() {
                findings.push(format!(
                    "[{path}] table `{table}` is missing {} policies",
                    missing.join(", ")
                ));
            }
        }
    }

    CheckResult::from_findings(findings)
}
