//! Aggregation of all job results of a run into one report and one issue comment.

use std::path::PathBuf;

use anyhow::Result;
use fanout_core::{
    models::{AggregateReport, JobResult, JobStatus},
    util::now,
};
use fanout_github::{CommentOutcome, RepoName};
use fanout_store::ResultStore;

use crate::publisher::Forge;

/// Hidden marker identifying the summary comment of a run.
pub fn marker(run_id: &str) -> String { format!("<!-- fanout-summary:{run_id} -->") }

/// Read every result document in the store. Unreadable documents become failed results
/// so they are counted rather than silently dropped.
pub fn collect(store: &ResultStore) -> Result<Vec<JobResult>> {
    let docs = store.list()?;
    Ok(docs
        .into_iter()
        .map(|doc| match doc.result {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(key = %doc.key, "Unreadable result document: {e:#}");
                let mut result = JobResult::new(doc.key.integration(), None, None, now());
                result.finish(JobStatus::Failed, format!("Unreadable result document: {e:#}"), now());
                result
            }
        })
        .collect())
}

pub fn reduce(results: Vec<JobResult>) -> AggregateReport {
    let (mut passed, mut failed, mut not_found) = (0, 0, 0);
    for result in &results {
        match result.status {
            JobStatus::Passed => passed += 1,
            JobStatus::NotFound => not_found += 1,
            JobStatus::Failed | JobStatus::Running => failed += 1,
        }
    }
    AggregateReport { total: results.len(), passed, failed, not_found, results }
}

/// Render the report as a markdown comment. Output depends only on the report and run id.
pub fn render(report: &AggregateReport, run_id: &str) -> String {
    let mut out = String::new();
    out.push_str(&marker(run_id));
    out.push('\n');
    out.push_str("### Integration check summary\n\n");
    if report.total == 0 {
        out.push_str("No results were found for this run: no check job published a result.\n");
        return out;
    }
    out.push_str(&format!(
        "{} checked: {} passed, {} failed, {} not found.\n\n",
        report.total, report.passed, report.failed, report.not_found
    ));
    out.push_str("| Integration | Status | Pull request | Message |\n");
    out.push_str("| - | - | - | - |\n");
    for result in &report.results {
        let status = match result.status {
            JobStatus::Passed => "✅ Passed",
            JobStatus::Failed => "❌ Failed",
            JobStatus::NotFound => "❔ Not found",
            JobStatus::Running => "❌ Failed (stale, never finished)",
        };
        let pr = result.pr_url.as_deref().map(|url| format!("[link]({url})")).unwrap_or_default();
        let message = result.message.as_deref().map(table_cell).unwrap_or_default();
        out.push_str(&format!("| `{}` | {status} | {pr} | {message} |\n", result.integration));
    }
    out
}

/// First line only, with pipes escaped.
fn table_cell(text: &str) -> String {
    text.lines().next().unwrap_or_default().trim().replace('|', "\\|")
}

/// A reduced and rendered run.
#[derive(Debug)]
pub struct Summary {
    pub report: AggregateReport,
    pub markdown: String,
    /// Where `summary.json` was written.
    pub path: PathBuf,
}

/// Collect, reduce and render everything in the store, and write `summary.json`.
pub fn summarize(store: &ResultStore, run_id: &str) -> Result<Summary> {
    let report = reduce(collect(store)?);
    let path = store.write_summary(&report)?;
    let markdown = render(&report, run_id);
    tracing::info!(
        "Summary: {} total, {} passed, {} failed, {} not found",
        report.total,
        report.passed,
        report.failed,
        report.not_found
    );
    Ok(Summary { report, markdown, path })
}

/// Post the rendered report to the triggering issue, replacing an earlier summary of the
/// same run.
pub async fn publish(
    forge: &dyn Forge,
    repo: &RepoName,
    issue_number: u64,
    run_id: &str,
    body: &str,
) -> Result<CommentOutcome> {
    let outcome = forge.upsert_comment(repo, issue_number, &marker(run_id), body).await?;
    tracing::info!("Summary comment {:?} on {repo}#{issue_number}", outcome);
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use fanout_store::DocumentKey;
    use time::OffsetDateTime;

    use super::*;
    use crate::publisher::tests::FakeForge;

    fn result(integration: &str, status: JobStatus) -> JobResult {
        let mut result = JobResult::new(integration, Some(3), None, OffsetDateTime::UNIX_EPOCH);
        if status.is_terminal() {
            result.finish(status, format!("{integration} done"), OffsetDateTime::UNIX_EPOCH);
        }
        result
    }

    #[test]
    fn test_reduce_counts() {
        let report = reduce(vec![
            result("a", JobStatus::Passed),
            result("b", JobStatus::Failed),
            result("c", JobStatus::NotFound),
        ]);
        assert_eq!((report.total, report.passed, report.failed, report.not_found), (3, 1, 1, 1));

        let report = reduce(vec![result("a", JobStatus::Running), result("a", JobStatus::Passed)]);
        assert_eq!((report.total, report.passed, report.failed), (2, 1, 1));
        for n in 0..6 {
            let results = (0..n).map(|i| result("x", match i % 4 {
                0 => JobStatus::Passed,
                1 => JobStatus::Failed,
                2 => JobStatus::NotFound,
                _ => JobStatus::Running,
            }));
            let report = reduce(results.collect());
            assert_eq!(report.total, n);
            assert_eq!(report.passed + report.failed + report.not_found, n);
        }
    }

    #[test]
    fn test_render() {
        let mut passed = result("foo", JobStatus::Passed);
        passed.pr_url = Some("https://github.com/acme/docs/pull/4".to_string());
        let mut failed = result("bar", JobStatus::Failed);
        failed.message = Some("exit 2 | see log\nsecond line".to_string());
        let report = reduce(vec![passed, failed, result("baz", JobStatus::Running)]);
        let expected = "<!-- fanout-summary:run-1 -->
### Integration check summary

3 checked: 1 passed, 2 failed, 0 not found.

| Integration | Status | Pull request | Message |
| - | - | - | - |
| `foo` | ✅ Passed | [link](https://github.com/acme/docs/pull/4) | foo done |
| `bar` | ❌ Failed |  | exit 2 \\| see log |
| `baz` | ❌ Failed (stale, never finished) |  |  |
";
        assert_eq!(render(&report, "run-1"), expected);
        assert_eq!(render(&report, "run-1"), render(&report, "run-1"));
    }

    #[test]
    fn test_render_empty() {
        let report = reduce(Vec::new());
        assert_eq!(report.total, 0);
        let text = render(&report, "run-1");
        assert!(text.starts_with("<!-- fanout-summary:run-1 -->"));
        assert!(text.contains("No results were found"));
    }

    #[test]
    fn test_collect_reports_unreadable() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResultStore::open(dir.path()).unwrap();
        let key = DocumentKey::new("foo", "1");
        store.create(&key, &result("foo", JobStatus::Passed)).unwrap();
        fs::write(dir.path().join("bar--2.json"), "{ not json").unwrap();
        let results = collect(&store).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].integration, "bar");
        assert_eq!(results[0].status, JobStatus::Failed);
        assert!(results[0].message.as_deref().unwrap().starts_with("Unreadable"));
        assert_eq!(results[1].status, JobStatus::Passed);
    }

    #[tokio::test]
    async fn test_publish_updates_in_place() {
        let forge = FakeForge::default();
        let repo: RepoName = "acme/docs".parse().unwrap();
        let first = render(&reduce(Vec::new()), "run-1");
        let second = render(&reduce(vec![result("foo", JobStatus::Passed)]), "run-1");
        let other = render(&reduce(Vec::new()), "run-2");
        assert_eq!(publish(&forge, &repo, 3, "run-1", &first).await.unwrap(), CommentOutcome::Created);
        assert_eq!(publish(&forge, &repo, 3, "run-1", &second).await.unwrap(), CommentOutcome::Updated);
        assert_eq!(publish(&forge, &repo, 3, "run-2", &other).await.unwrap(), CommentOutcome::Created);
        let comments = forge.comments.lock().unwrap();
        assert_eq!(comments.len(), 2);
        assert_eq!(comments[0].1, second);
    }
}
