//! Plain-text rendering for command output.

use subtrack_core::model::{Problem, StatusLog, SubmissionPage};
use subtrack_core::{Submission, SyncNotice};

pub fn submission_line(submission: &Submission) -> String {
    let mut line = format!("{:<24} {:<10}", submission.id, submission.status);
    if let Some(problem) = &submission.problem_id {
        line.push_str(&format!(" problem={problem}"));
    }
    if let Some(language) = &submission.language {
        line.push_str(&format!(" lang={language}"));
    }
    if let Some(score) = submission.score {
        line.push_str(&format!(" score={score}"));
    }
    line.trim_end().to_string()
}

pub fn submission_detail(submission: &Submission) -> String {
    let mut out = vec![
        format!("id:       {}", submission.id),
        format!("status:   {}", submission.status),
    ];
    let optional = [
        ("problem", submission.problem_id.clone()),
        ("language", submission.language.clone()),
        ("score", submission.score.map(|s| s.to_string())),
        ("runtime", submission.runtime_ms.map(|ms| format!("{ms} ms"))),
        ("memory", submission.memory_kb.map(|kb| format!("{kb} KB"))),
        ("error", submission.error_message.clone()),
        ("created", submission.created_at.map(|t| t.to_rfc3339())),
        ("updated", submission.updated_at.map(|t| t.to_rfc3339())),
    ];
    for (label, value) in optional {
        if let Some(value) = value {
            out.push(format!("{:<9} {value}", format!("{label}:")));
        }
    }
    if let Some(runs) = &submission.judge_runs {
        out.push(format!("runs:     {}", runs.len()));
        for run in runs {
            let duration = run
                .duration_ms
                .map(|ms| format!(" ({ms} ms)"))
                .unwrap_or_default();
            out.push(format!("  - {} {}{duration}", run.id, run.status));
        }
    }
    out.join("\n")
}

pub fn page(page: &SubmissionPage) -> String {
    let mut lines: Vec<String> = page.items.iter().map(submission_line).collect();
    if let Some(total) = page.meta.as_ref().and_then(|meta| meta.total) {
        lines.push(format!("{} of {total} submissions", page.items.len()));
    }
    lines.join("\n")
}

pub fn logs(entries: &[StatusLog]) -> String {
    entries
        .iter()
        .map(|log| format!("{} {} -> {}", log.created_at, log.from_status, log.to_status))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn problems(problems: &[Problem]) -> String {
    problems
        .iter()
        .map(|p| match &p.difficulty {
            Some(difficulty) => format!("{:<24} {} [{difficulty}]", p.id, p.title),
            None => format!("{:<24} {}", p.id, p.title),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// One line per notice; `None` for notices not worth printing.
pub fn notice(notice: &SyncNotice) -> Option<String> {
    match notice {
        SyncNotice::Seeded { job_id, status } => Some(format!("{job_id}: {status}")),
        SyncNotice::StatusChanged { job_id, from, to } => Some(format!("{job_id}: {from} -> {to}")),
        SyncNotice::Connection { job_id, connected } => Some(format!(
            "{job_id}: live updates {}",
            if *connected { "connected" } else { "disconnected" }
        )),
        SyncNotice::FetchFailed { job_id, error, .. } => {
            Some(format!("{job_id}: {}", error.user_message()))
        }
        SyncNotice::Terminal { job_id, status } => Some(format!("{job_id}: finished with {status}")),
        SyncNotice::Stopped { .. } => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use subtrack_core::{ApiError, SubmissionStatus};

    fn submission() -> Submission {
        serde_json::from_value(json!({
            "id": "s-1",
            "status": "accepted",
            "problem_id": "p-1",
            "language": "rust",
            "score": 100.0,
            "judge_runs": [{"id": "r-1", "status": "passed", "duration_ms": 12}]
        }))
        .unwrap()
    }

    #[test]
    fn line_includes_known_fields() {
        let line = submission_line(&submission());
        assert!(line.starts_with("s-1"));
        assert!(line.contains("ACCEPTED"));
        assert!(line.contains("problem=p-1"));
        assert!(line.contains("score=100"));
    }

    #[test]
    fn detail_lists_runs() {
        let detail = submission_detail(&submission());
        assert!(detail.contains("runs:     1"));
        assert!(detail.contains("r-1 passed (12 ms)"));
    }

    #[test]
    fn notices_render_transitions_and_errors() {
        let changed = SyncNotice::StatusChanged {
            job_id: "s-1".into(),
            from: SubmissionStatus::Pending,
            to: SubmissionStatus::Running,
        };
        assert_eq!(notice(&changed).unwrap(), "s-1: PENDING -> RUNNING");

        let failed = SyncNotice::FetchFailed {
            job_id: "s-1".into(),
            error: ApiError::new("SUBMISSION_NOT_FOUND", 404, "gone").into(),
            fatal: true,
        };
        assert!(notice(&failed).unwrap().contains("Not found"));
        assert!(notice(&SyncNotice::Stopped { job_id: "s-1".into() }).is_none());
    }
}
