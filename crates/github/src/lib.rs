pub mod payload;
pub mod webhook;

use std::{fmt, str::FromStr, sync::OnceLock};

use anyhow::{Context, Result, anyhow};
use fanout_core::config::GitHubConfig;
use http::StatusCode;
use octocrab::{GitHubError, Octocrab};
use regex::Regex;
use url::Url;

const GITHUB_WEB_URL: &str = "https://github.com";

#[derive(Clone)]
pub struct GitHub {
    pub client: Octocrab,
}

/// An `owner/name` repository identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepoName {
    pub owner: String,
    pub name: String,
}

impl FromStr for RepoName {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (owner, name) = s
            .trim()
            .split_once('/')
            .filter(|(o, n)| !o.is_empty() && !n.is_empty() && !n.contains('/'))
            .ok_or_else(|| anyhow!("Invalid repository {s:?}, expected owner/name"))?;
        Ok(Self { owner: owner.to_string(), name: name.trim_end_matches(".git").to_string() })
    }
}

impl fmt::Display for RepoName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

impl RepoName {
    pub fn clone_url(&self) -> String { format!("{GITHUB_WEB_URL}/{}/{}.git", self.owner, self.name) }

    /// HTTPS remote with the token embedded, for pushing.
    pub fn authenticated_url(&self, token: &str) -> Result<Url> {
        let mut url = Url::parse(&self.clone_url())?;
        url.set_username("x-access-token").map_err(|()| anyhow!("Cannot set username"))?;
        url.set_password(Some(token)).map_err(|()| anyhow!("Cannot set password"))?;
        Ok(url)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommentOutcome {
    Created,
    Updated,
}

impl GitHub {
    /// Create a client. Without a token the client is anonymous and every write fails.
    pub fn new(config: &GitHubConfig, token: Option<&str>) -> Result<Self> {
        let mut builder = Octocrab::builder();
        if let Some(token) = token {
            builder = builder.personal_token(token.to_string());
        }
        if let Some(api_url) = &config.api_url {
            builder = builder.base_uri(api_url.as_str()).context("Invalid GitHub API URL")?;
        }
        let client = builder.build().context("Failed to create GitHub client")?;
        Ok(Self { client })
    }

    /// Open a pull request and return its web URL.
    pub async fn open_pull_request(
        &self,
        repo: &RepoName,
        head: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<String> {
        let result = self
            .client
            .pulls(&repo.owner, &repo.name)
            .create(title, head, base)
            .body(body)
            .send()
            .await;
        let pull = match result {
            Ok(pull) => pull,
            Err(octocrab::Error::GitHub { source, .. })
                if matches!(*source, GitHubError {
                    status_code: StatusCode::UNPROCESSABLE_ENTITY,
                    ..
                }) =>
            {
                return Err(anyhow!(
                    "GitHub rejected pull request {head} -> {base}: {}",
                    source.message
                ));
            }
            Err(e) => return Err(e).context("Failed to create pull request"),
        };
        tracing::info!("Opened pull request #{} in {}", pull.number, repo);
        pull.html_url
            .map(|u| u.to_string())
            .with_context(|| format!("Pull request #{} has no URL", pull.number))
    }

    /// Create or replace the issue comment identified by `marker`.
    ///
    /// The first comment containing the marker is updated in place and any further
    /// copies are deleted, so repeated calls converge on a single comment.
    pub async fn upsert_issue_comment(
        &self,
        repo: &RepoName,
        issue_number: u64,
        marker: &str,
        body: &str,
    ) -> Result<CommentOutcome> {
        let issues = self.client.issues(&repo.owner, &repo.name);
        let first_page = issues
            .list_comments(issue_number)
            .per_page(100)
            .send()
            .await
            .context("Failed to list issue comments")?;
        let comments =
            self.client.all_pages(first_page).await.context("Failed to list issue comments")?;
        let existing: Vec<_> = comments
            .iter()
            .filter(|comment| comment.body.as_deref().is_some_and(|b| b.contains(marker)))
            .collect();

        if let Some(first) = existing.first() {
            issues
                .update_comment(first.id, body.to_string())
                .await
                .context("Failed to update existing comment")?;
            for comment in existing.iter().skip(1) {
                if let Err(e) = issues.delete_comment(comment.id).await {
                    tracing::warn!("Failed to delete duplicate comment {}: {}", comment.id, e);
                }
            }
            Ok(CommentOutcome::Updated)
        } else {
            issues
                .create_comment(issue_number, body.to_string())
                .await
                .context("Failed to create comment")?;
            Ok(CommentOutcome::Created)
        }
    }
}

pub fn extract_github_url(url: &str) -> Option<(&str, &str)> {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    let caps = REGEX
        .get_or_init(|| {
            Regex::new(r"^https?://github\.com/(?P<owner>[^/]+)/(?P<repo>[^/]+?)(?:\.git)?(?:/|$)")
                .unwrap()
        })
        .captures(url)?;
    let owner = caps.name("owner").map(|m| m.as_str()).unwrap_or_default();
    let repo = caps.name("repo").map(|m| m.as_str()).unwrap_or_default();
    Some((owner, repo))
}
