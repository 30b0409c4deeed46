//! Status and classification types shared across both pipeline tracks.

use serde::{Deserialize, Serialize};

/// Lifecycle status of a code-track run.
///
/// Transitions follow the run graph: `Started → SpecDone → (SpecReview |
/// Coding) → (ReviewOk | ReviewNg) → Published`. `Published` is terminal
/// for success; `Failed` and `Timeout` are terminal for failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Started,
    SpecDone,
    SpecReview,
    Coding,
    ReviewOk,
    ReviewNg,
    Published,
    Failed,
    Timeout,
}

impl RunStatus {
    /// Whether the run can never progress further.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Published | Self::Failed | Self::Timeout)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Started => "started",
            Self::SpecDone => "spec_done",
            Self::SpecReview => "spec_review",
            Self::Coding => "coding",
            Self::ReviewOk => "review_ok",
            Self::ReviewNg => "review_ng",
            Self::Published => "published",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for RunStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "started" => Ok(Self::Started),
            "spec_done" => Ok(Self::SpecDone),
            "spec_review" => Ok(Self::SpecReview),
            "coding" => Ok(Self::Coding),
            "review_ok" => Ok(Self::ReviewOk),
            "review_ng" => Ok(Self::ReviewNg),
            "published" => Ok(Self::Published),
            "failed" => Ok(Self::Failed),
            "timeout" => Ok(Self::Timeout),
            other => Err(anyhow::anyhow!("unknown run status: {other}")),
        }
    }
}

/// Lifecycle status of a SaaS-track task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Planning,
    AwaitingApproval,
    Executing,
    Completed,
    Failed,
    Rejected,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Planning => "planning",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "planning" => Ok(Self::Planning),
            "awaiting_approval" => Ok(Self::AwaitingApproval),
            "executing" => Ok(Self::Executing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "rejected" => Ok(Self::Rejected),
            other => Err(anyhow::anyhow!("unknown task status: {other}")),
        }
    }
}

/// Health of a tenant-to-SaaS connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Pending,
    Active,
    TokenExpired,
    Error,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::TokenExpired => "token_expired",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for ConnectionStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "active" => Ok(Self::Active),
            "token_expired" => Ok(Self::TokenExpired),
            "error" => Ok(Self::Error),
            other => Err(anyhow::anyhow!("unknown connection status: {other}")),
        }
    }
}

/// How a connection authenticates against its SaaS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    Oauth2,
    ApiKey,
    Basic,
}

impl std::fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Oauth2 => "oauth2",
            Self::ApiKey => "api_key",
            Self::Basic => "basic",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for AuthMethod {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "oauth2" => Ok(Self::Oauth2),
            "api_key" => Ok(Self::ApiKey),
            "basic" => Ok(Self::Basic),
            other => Err(anyhow::anyhow!("unknown auth method: {other}")),
        }
    }
}

/// Coarse classification of a task failure, derived from the first failing
/// error message by keyword matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    AuthError,
    ValidationError,
    RateLimit,
    Timeout,
    ApiError,
    Unknown,
}

impl FailureCategory {
    /// Classify a set of error messages by the fixed keyword table. The
    /// first match in table order wins; no match falls back to `ApiError`.
    pub fn classify(errors: &[String]) -> Self {
        if errors.is_empty() {
            return Self::Unknown;
        }
        let combined = errors.join(" ").to_lowercase();
        const TABLE: &[(&str, FailureCategory)] = &[
            ("auth", FailureCategory::AuthError),
            ("unauthorized", FailureCategory::AuthError),
            ("token", FailureCategory::AuthError),
            ("expired", FailureCategory::AuthError),
            ("validation", FailureCategory::ValidationError),
            ("invalid", FailureCategory::ValidationError),
            ("required", FailureCategory::ValidationError),
            ("missing", FailureCategory::ValidationError),
            ("rate_limit", FailureCategory::RateLimit),
            ("too many", FailureCategory::RateLimit),
            ("throttl", FailureCategory::RateLimit),
            ("timeout", FailureCategory::Timeout),
            ("timed out", FailureCategory::Timeout),
        ];
        for (keyword, category) in TABLE {
            if combined.contains(keyword) {
                return *category;
            }
        }
        Self::ApiError
    }
}

impl std::fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::AuthError => "auth_error",
            Self::ValidationError => "validation_error",
            Self::RateLimit => "rate_limit",
            Self::Timeout => "timeout",
            Self::ApiError => "api_error",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for FailureCategory {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auth_error" => Ok(Self::AuthError),
            "validation_error" => Ok(Self::ValidationError),
            "rate_limit" => Ok(Self::RateLimit),
            "timeout" => Ok(Self::Timeout),
            "api_error" => Ok(Self::ApiError),
            "unknown" => Ok(Self::Unknown),
            other => Err(anyhow::anyhow!("unknown failure category: {other}")),
        }
    }
}

/// Where an audit record originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditSource {
    Sandbox,
    Saas,
}

impl std::fmt::Display for AuditSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sandbox => f.write_str("sandbox"),
            Self::Saas => f.write_str("saas"),
        }
    }
}

/// One tool invocation, recorded by the sandbox or the SaaS executor.
///
/// Argument values may be truncated; result summaries carry only a success
/// flag, an optional short error, and the elapsed time. Raw payloads never
/// enter an audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub tool: String,
    pub arguments: serde_json::Value,
    pub result_summary: AuditResultSummary,
}

/// Outcome portion of an [`AuditRecord`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditResultSummary {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
}

impl AuditRecord {
    /// Build a record stamped with the current time.
    pub fn now(
        tool: impl Into<String>,
        arguments: serde_json::Value,
        success: bool,
        error: Option<String>,
        duration_ms: Option<i64>,
    ) -> Self {
        Self {
            timestamp: chrono::Utc::now(),
            tool: tool.into(),
            arguments,
            result_summary: AuditResultSummary {
                success,
                error,
                duration_ms,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_status_roundtrip() {
        for status in [
            RunStatus::Started,
            RunStatus::SpecDone,
            RunStatus::SpecReview,
            RunStatus::Coding,
            RunStatus::ReviewOk,
            RunStatus::ReviewNg,
            RunStatus::Published,
            RunStatus::Failed,
            RunStatus::Timeout,
        ] {
            let parsed: RunStatus = status.to_string().parse().expect("roundtrip");
            assert_eq!(status, parsed);
        }
    }

    #[test]
    fn test_run_status_terminal() {
        assert!(RunStatus::Published.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Timeout.is_terminal());
        assert!(!RunStatus::SpecReview.is_terminal());
        assert!(!RunStatus::ReviewNg.is_terminal());
    }

    #[test]
    fn test_task_status_roundtrip() {
        for status in [
            TaskStatus::Planning,
            TaskStatus::AwaitingApproval,
            TaskStatus::Executing,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Rejected,
        ] {
            let parsed: TaskStatus = status.to_string().parse().expect("roundtrip");
            assert_eq!(status, parsed);
        }
    }

    #[test]
    fn test_classify_auth() {
        let errors = vec!["get_records: 401 unauthorized".to_owned()];
        assert_eq!(FailureCategory::classify(&errors), FailureCategory::AuthError);
    }

    #[test]
    fn test_classify_validation() {
        let errors = vec!["field `amount` is required".to_owned()];
        assert_eq!(
            FailureCategory::classify(&errors),
            FailureCategory::ValidationError
        );
    }

    #[test]
    fn test_classify_rate_limit() {
        let errors = vec!["429 too many requests".to_owned()];
        assert_eq!(FailureCategory::classify(&errors), FailureCategory::RateLimit);
    }

    #[test]
    fn test_classify_default_is_api_error() {
        let errors = vec!["internal server error".to_owned()];
        assert_eq!(FailureCategory::classify(&errors), FailureCategory::ApiError);
    }

    #[test]
    fn test_classify_empty_is_unknown() {
        assert_eq!(FailureCategory::classify(&[]), FailureCategory::Unknown);
    }

    #[test]
    fn test_audit_record_serializes_without_empty_fields() {
        let record = AuditRecord::now("file_write", serde_json::json!({"path": "a"}), true, None, None);
        let json = serde_json::to_value(&record).expect("serialize");
        assert!(json["result_summary"].get("error").is_none());
        assert_eq!(json["result_summary"]["success"], true);
    }
}
