//! Remediation pull requests.

use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use fanout_core::util::sanitize_component;
use fanout_github::{CommentOutcome, GitHub, RepoName};
use time::OffsetDateTime;

use crate::git::Vcs;

/// The code-hosting operations the orchestrator needs.
#[async_trait]
pub trait Forge: Send + Sync {
    /// Open a pull request and return its URL.
    async fn open_pull_request(
        &self,
        repo: &RepoName,
        head: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<String>;

    /// Create or replace the issue comment carrying `marker`.
    async fn upsert_comment(
        &self,
        repo: &RepoName,
        issue_number: u64,
        marker: &str,
        body: &str,
    ) -> Result<CommentOutcome>;
}

#[async_trait]
impl Forge for GitHub {
    async fn open_pull_request(
        &self,
        repo: &RepoName,
        head: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<String> {
        GitHub::open_pull_request(self, repo, head, base, title, body).await
    }

    async fn upsert_comment(
        &self,
        repo: &RepoName,
        issue_number: u64,
        marker: &str,
        body: &str,
    ) -> Result<CommentOutcome> {
        self.upsert_issue_comment(repo, issue_number, marker, body).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrResult {
    /// Nothing to commit.
    Skipped,
    Created { url: String },
    Failed { message: String },
}

pub struct PrRequest<'a> {
    pub resource_path: &'a Path,
    pub branch: &'a str,
    pub commit_message: &'a str,
    pub title: &'a str,
    pub body: &'a str,
}

pub struct PrPublisher<'a> {
    pub vcs: &'a dyn Vcs,
    pub forge: &'a dyn Forge,
    pub repo: &'a RepoName,
    pub base_branch: &'a str,
}

impl PrPublisher<'_> {
    /// Stage, commit, push and open a pull request. Never fails: every problem is
    /// reported as [`PrResult::Failed`].
    pub async fn publish(&self, request: &PrRequest<'_>) -> PrResult {
        match self.try_publish(request).await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(branch = request.branch, "Failed to publish pull request: {e:#}");
                PrResult::Failed { message: format!("{e:#}") }
            }
        }
    }

    async fn try_publish(&self, request: &PrRequest<'_>) -> Result<PrResult> {
        let path = request.resource_path;
        self.vcs.stage_all(path).await?;
        if !self.vcs.has_staged_changes(path).await? {
            tracing::info!("No changes under {}, skipping pull request", path.display());
            return Ok(PrResult::Skipped);
        }
        self.vcs.commit(path, request.branch, request.commit_message).await?;
        self.vcs.push(path, request.branch).await?;
        let url = self
            .forge
            .open_pull_request(self.repo, request.branch, self.base_branch, request.title, request.body)
            .await?;
        Ok(PrResult::Created { url })
    }
}

/// A branch name unique per invocation: `<prefix>/<integration>-<issue>-<unix time>-<nonce>`.
pub fn branch_name(prefix: &str, integration: &str, issue_number: u64, now: OffsetDateTime) -> String {
    format!(
        "{}/{}-{issue_number}-{}-{:04x}",
        sanitize_component(prefix),
        sanitize_component(integration),
        now.unix_timestamp(),
        rand::random::<u16>()
    )
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{
        path::PathBuf,
        sync::{Mutex, atomic::{AtomicUsize, Ordering}},
    };

    use anyhow::bail;
    use time::macros::datetime;

    use super::*;

    /// In-memory [`Vcs`] recording what it was asked to do.
    #[derive(Default)]
    pub struct FakeVcs {
        pub changes: bool,
        pub fail_push: bool,
        pub log: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Vcs for FakeVcs {
        async fn stage_all(&self, path: &Path) -> Result<()> {
            self.log.lock().unwrap().push(format!("stage {}", path.display()));
            Ok(())
        }

        async fn has_staged_changes(&self, _path: &Path) -> Result<bool> { Ok(self.changes) }

        async fn commit(&self, _path: &Path, branch: &str, _message: &str) -> Result<()> {
            self.log.lock().unwrap().push(format!("commit {branch}"));
            Ok(())
        }

        async fn push(&self, _path: &Path, branch: &str) -> Result<()> {
            if self.fail_push {
                bail!("remote rejected {branch}");
            }
            self.log.lock().unwrap().push(format!("push {branch}"));
            Ok(())
        }
    }

    /// In-memory [`Forge`]. Comments are kept per marker, like the real upsert.
    #[derive(Default)]
    pub struct FakeForge {
        pub pulls: AtomicUsize,
        pub comments: Mutex<Vec<(u64, String)>>,
    }

    #[async_trait]
    impl Forge for FakeForge {
        async fn open_pull_request(
            &self,
            repo: &RepoName,
            head: &str,
            _base: &str,
            _title: &str,
            _body: &str,
        ) -> Result<String> {
            let n = self.pulls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(format!("https://github.com/{repo}/pull/{n}?head={head}"))
        }

        async fn upsert_comment(
            &self,
            _repo: &RepoName,
            issue_number: u64,
            marker: &str,
            body: &str,
        ) -> Result<CommentOutcome> {
            let mut comments = self.comments.lock().unwrap();
            if let Some(existing) =
                comments.iter_mut().find(|(n, b)| *n == issue_number && b.contains(marker))
            {
                existing.1 = body.to_string();
                return Ok(CommentOutcome::Updated);
            }
            comments.push((issue_number, body.to_string()));
            Ok(CommentOutcome::Created)
        }
    }

    fn request(path: &Path) -> PrRequest<'_> {
        PrRequest {
            resource_path: path,
            branch: "fanout/foo-1",
            commit_message: "msg",
            title: "title",
            body: "body",
        }
    }

    #[tokio::test]
    async fn test_publish() {
        let repo: RepoName = "acme/docs".parse().unwrap();
        let path = PathBuf::from("integrations/foo");
        let forge = FakeForge::default();

        let vcs = FakeVcs::default();
        let publisher = PrPublisher { vcs: &vcs, forge: &forge, repo: &repo, base_branch: "main" };
        assert_eq!(publisher.publish(&request(&path)).await, PrResult::Skipped);
        assert_eq!(*vcs.log.lock().unwrap(), vec!["stage integrations/foo"]);

        let vcs = FakeVcs { changes: true, ..Default::default() };
        let publisher = PrPublisher { vcs: &vcs, forge: &forge, repo: &repo, base_branch: "main" };
        let PrResult::Created { url } = publisher.publish(&request(&path)).await else {
            panic!("expected a pull request");
        };
        assert!(url.starts_with("https://github.com/acme/docs/pull/1"));
        assert_eq!(vcs.log.lock().unwrap().len(), 3);

        let vcs = FakeVcs { changes: true, fail_push: true, ..Default::default() };
        let publisher = PrPublisher { vcs: &vcs, forge: &forge, repo: &repo, base_branch: "main" };
        let PrResult::Failed { message } = publisher.publish(&request(&path)).await else {
            panic!("expected failure");
        };
        assert!(message.contains("remote rejected"));
        assert_eq!(forge.pulls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_branch_name() {
        let now = datetime!(2024-05-01 12:00 UTC);
        let a = branch_name("fanout", "foo.bar", 12, now);
        let b = branch_name("fanout", "foo.bar", 12, now);
        assert!(a.starts_with("fanout/foo-bar-12-1714564800-"), "{a}");
        assert_eq!(a.len(), b.len());
        assert!(!a.contains(' ') && !a.contains(':'));
    }
}
