//! Rule document loading.
//!
//! Rule documents are Markdown files under the configured rules directory
//! (`genre_rules.md`, `spec_rules.md`, `fix_rules.md`, `saas/<name>_rules.md`,
//! ...). A missing document falls back to the caller's default -- usually
//! an empty string or a built-in prompt.

use std::path::Path;

/// Load `<name>.md` from `rules_dir`, returning `fallback` when the file
/// is absent or unreadable.
pub fn load_rule(rules_dir: &Path, name: &str, fallback: &str) -> String {
    let path = rules_dir.join(format!("{name}.md"));
    match std::fs::read_to_string(&path) {
        Ok(content) if !content.trim().is_empty() => content,
        _ => fallback.to_owned(),
    }
}

/// Load the per-SaaS rule document `saas/<saas_name>_rules.md`.
pub fn load_saas_rule(rules_dir: &Path, saas_name: &str) -> String {
    load_rule(&rules_dir.join("saas"), &format!("{saas_name}_rules"), "")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_existing_rule() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("spec_rules.md"), "# Spec rules\n").expect("write");
        assert_eq!(load_rule(dir.path(), "spec_rules", "fallback"), "# Spec rules\n");
    }

    #[test]
    fn test_missing_rule_uses_fallback() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert_eq!(load_rule(dir.path(), "nope", "fallback"), "fallback");
    }

    #[test]
    fn test_blank_rule_uses_fallback() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("empty.md"), "   \n").expect("write");
        assert_eq!(load_rule(dir.path(), "empty", "fallback"), "fallback");
    }

    #[test]
    fn test_saas_rule_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("saas")).expect("mkdir");
        std::fs::write(dir.path().join("saas/kintone_rules.md"), "- no deletes\n")
            .expect("write");
        assert_eq!(load_saas_rule(dir.path(), "kintone"), "- no deletes\n");
        assert_eq!(load_saas_rule(dir.path(), "freee"), "");
    }
}
