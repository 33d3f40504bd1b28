use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Lifecycle status of a submission.
///
/// Parsing is case-insensitive and accepts the backend's spellings
/// (`judging`, `wrong_answer`, `canceled`). Unrecognised values are kept in
/// `Other` and treated as non-terminal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SubmissionStatus {
    Pending,
    Running,
    Accepted,
    Rejected,
    Failed,
    Cancelled,
    Error,
    Completed,
    Other(String),
}

impl SubmissionStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "PENDING" | "QUEUED" => Self::Pending,
            "RUNNING" | "JUDGING" => Self::Running,
            "ACCEPTED" => Self::Accepted,
            "REJECTED" | "WRONG_ANSWER" => Self::Rejected,
            "FAILED" => Self::Failed,
            "CANCELLED" | "CANCELED" => Self::Cancelled,
            "ERROR" => Self::Error,
            "COMPLETED" => Self::Completed,
            _ => Self::Other(raw.trim().to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Accepted => "ACCEPTED",
            Self::Rejected => "REJECTED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
            Self::Error => "ERROR",
            Self::Completed => "COMPLETED",
            Self::Other(raw) => raw,
        }
    }

    /// No further change is expected once a submission reports one of these.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Accepted
                | Self::Rejected
                | Self::Failed
                | Self::Cancelled
                | Self::Error
                | Self::Completed
        )
    }
}

impl fmt::Display for SubmissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for SubmissionStatus {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

impl Serialize for SubmissionStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for SubmissionStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::parse(&raw))
    }
}

/// One execution attempt within a submission's lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JudgeRun {
    pub id: String,
    pub status: String,
    #[serde(default, alias = "duration_ms", alias = "runtime_ms")]
    pub duration_ms: Option<u64>,
    #[serde(default, alias = "created_at")]
    pub created_at: Option<DateTime<Utc>>,
}

/// Authoritative view of a submission as returned by `GET /submissions/{id}`.
///
/// Field names are accepted in both camelCase and snake_case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub id: String,
    pub status: SubmissionStatus,
    #[serde(default, alias = "problem_id")]
    pub problem_id: Option<String>,
    #[serde(default, alias = "user_id")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default, alias = "runtime_ms")]
    pub runtime_ms: Option<u64>,
    #[serde(default, alias = "memory_kb")]
    pub memory_kb: Option<u64>,
    #[serde(default, alias = "error_message")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub version: Option<i64>,
    #[serde(default, alias = "created_at")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, alias = "updated_at")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, alias = "judge_runs")]
    pub judge_runs: Option<Vec<JudgeRun>>,
}

impl Submission {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Body of `POST /submissions`.
#[derive(Debug, Clone, Serialize)]
pub struct NewSubmission {
    pub problem_id: String,
    pub language: String,
    pub code: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmissionFilter {
    pub problem_id: Option<String>,
    pub user_id: Option<String>,
    pub status: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl SubmissionFilter {
    pub fn query_string(&self) -> String {
        let mut pairs = Vec::new();
        if let Some(value) = &self.problem_id {
            pairs.push(("problem_id", value.clone()));
        }
        if let Some(value) = &self.user_id {
            pairs.push(("user_id", value.clone()));
        }
        if let Some(value) = &self.status {
            pairs.push(("status", value.clone()));
        }
        if let Some(value) = self.limit {
            pairs.push(("limit", value.to_string()));
        }
        if let Some(value) = self.offset {
            pairs.push(("offset", value.to_string()));
        }
        if pairs.is_empty() {
            return String::new();
        }
        let encoded = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(pairs)
            .finish();
        format!("?{encoded}")
    }
}

/// Pagination metadata. The backend reports `limit/offset/count/total`;
/// older deployments report `page/pageSize/total/filtered`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageMeta {
    #[serde(default)]
    pub page: Option<u64>,
    #[serde(default, alias = "page_size")]
    pub page_size: Option<u64>,
    #[serde(default)]
    pub total: Option<u64>,
    #[serde(default)]
    pub filtered: Option<u64>,
    #[serde(default)]
    pub limit: Option<u64>,
    #[serde(default)]
    pub offset: Option<u64>,
    #[serde(default)]
    pub count: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubmissionPage {
    pub items: Vec<Submission>,
    pub meta: Option<PageMeta>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusLog {
    pub id: String,
    #[serde(alias = "submission_id")]
    pub submission_id: String,
    #[serde(alias = "from_status")]
    pub from_status: String,
    #[serde(alias = "to_status")]
    pub to_status: String,
    #[serde(alias = "created_at")]
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Problem {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub difficulty: Option<String>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default, alias = "created_at")]
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionUser {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

impl SessionUser {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}
