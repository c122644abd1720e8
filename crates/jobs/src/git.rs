//! Resource acquisition and the git operations used to publish changes.
//!
//! Uses the system `git` binary so existing credential helpers keep working.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use fanout_core::config::CheckConfig;
use fanout_github::RepoName;

use tokio::sync::Mutex;

use crate::process::{CommandOutput, run_command};

/// Serializes worktree bookkeeping, which git stores in the shared `.git` directory.
static WORKTREES: Mutex<()> = Mutex::const_new(());

/// Where integrations are read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// A plain directory, read in place.
    Local(PathBuf),
    /// A local git repository. Every check instance gets its own worktree detached at
    /// `base`, so the repository's own checkout is never touched.
    Worktree { repo: PathBuf, base: String },
    /// A repository cloned fresh for every check instance.
    Remote { url: String, git_ref: Option<String> },
}

impl Source {
    /// Resolve the configured source. An empty source means the triggering repository.
    pub fn resolve(
        config: &CheckConfig,
        base_branch: &str,
        repository: &str,
        token: Option<&str>,
    ) -> Result<Self> {
        let git_ref = config.source_ref.clone();
        if config.source.trim().is_empty() {
            let repo: RepoName = repository.parse()?;
            let url = match token {
                Some(token) => repo.authenticated_url(token)?.to_string(),
                None => repo.clone_url(),
            };
            return Ok(Self::Remote { url, git_ref });
        }
        let path = Path::new(&config.source);
        if path.join(".git").exists() {
            let base = git_ref.unwrap_or_else(|| base_branch.to_string());
            return Ok(Self::Worktree { repo: path.to_path_buf(), base });
        }
        if path.is_dir() {
            return Ok(Self::Local(path.to_path_buf()));
        }
        Ok(Self::Remote { url: config.source.clone(), git_ref })
    }

    /// Materialize the source and return its root directory. Worktrees and clones are
    /// created at `dest`, which is owned by a single check instance.
    pub async fn acquire(&self, dest: &Path, timeout: Duration) -> Result<PathBuf> {
        match self {
            Self::Local(path) => {
                if !path.is_dir() {
                    bail!("Source directory {} does not exist", path.display());
                }
                Ok(path.clone())
            }
            Self::Worktree { repo, base } => {
                let dest = std::path::absolute(dest)
                    .with_context(|| format!("Invalid checkout path {}", dest.display()))?;
                add_worktree(repo, base, &dest, timeout).await?;
                Ok(dest)
            }
            Self::Remote { url, git_ref } => {
                clone(url, git_ref.as_deref(), dest, timeout).await?;
                Ok(dest.to_path_buf())
            }
        }
    }

    /// Undo [`Source::acquire`] where it created something that must not outlive the
    /// instance. Failures are logged; a leftover worktree is pruned on the next acquire.
    pub async fn release(&self, dest: &Path, timeout: Duration) {
        let Self::Worktree { repo, .. } = self else {
            return;
        };
        let Ok(dest) = std::path::absolute(dest) else {
            return;
        };
        let _guard = WORKTREES.lock().await;
        let argv = git_argv(&["worktree", "remove", "--force", &dest.to_string_lossy()]);
        let error = match run_command(&argv, repo, &[], timeout).await {
            Ok(out) if out.success() => return,
            Ok(out) => out.output.trim().to_string(),
            Err(e) => format!("{e:#}"),
        };
        tracing::warn!("Failed to remove worktree {}: {error}", dest.display());
    }
}

fn git_argv(args: &[&str]) -> Vec<String> {
    std::iter::once("git").chain(args.iter().copied()).map(str::to_string).collect()
}

async fn add_worktree(repo: &Path, base: &str, dest: &Path, timeout: Duration) -> Result<()> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let _guard = WORKTREES.lock().await;
    if dest.exists() {
        tokio::fs::remove_dir_all(dest)
            .await
            .with_context(|| format!("Failed to remove stale checkout {}", dest.display()))?;
    }
    let prune = run_command(&git_argv(&["worktree", "prune"]), repo, &[], timeout).await?;
    ensure_success("git worktree prune", &prune)?;
    let dest_arg = dest.to_string_lossy();
    let argv = git_argv(&["worktree", "add", "--detach", &dest_arg, base]);
    let out = run_command(&argv, repo, &[], timeout).await?;
    if !out.success() {
        bail!("git worktree add failed: {}", out.output.trim());
    }
    tracing::info!("Checked out {base} into {}", dest.display());
    Ok(())
}

async fn clone(url: &str, git_ref: Option<&str>, dest: &Path, timeout: Duration) -> Result<()> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    if dest.exists() {
        tokio::fs::remove_dir_all(dest)
            .await
            .with_context(|| format!("Failed to remove stale checkout {}", dest.display()))?;
    }
    let mut argv: Vec<String> =
        ["git", "clone", "--depth", "1"].into_iter().map(str::to_string).collect();
    if let Some(git_ref) = git_ref {
        argv.extend(["--branch".to_string(), git_ref.to_string(), "--single-branch".to_string()]);
    }
    argv.push(url.to_string());
    argv.push(dest.to_string_lossy().into_owned());
    let env = [("GIT_TERMINAL_PROMPT", "0".to_string())];
    let out = run_command(&argv, Path::new("."), &env, timeout).await?;
    // The URL may carry a token, so only the exit status is reported
    ensure_success("git clone", &out)?;
    tracing::info!("Cloned source into {}", dest.display());
    Ok(())
}

fn ensure_success(what: &str, out: &CommandOutput) -> Result<()> {
    if out.timed_out {
        bail!("{what} timed out");
    }
    if !out.success() {
        bail!("{what} failed with exit code {}", out.exit_code());
    }
    Ok(())
}

/// The version-control operations needed to publish a change.
#[async_trait]
pub trait Vcs: Send + Sync {
    /// Stage every change below `path`.
    async fn stage_all(&self, path: &Path) -> Result<()>;

    async fn has_staged_changes(&self, path: &Path) -> Result<bool>;

    /// Create `branch` at the current commit and commit the staged changes below `path`
    /// to it.
    async fn commit(&self, path: &Path, branch: &str, message: &str) -> Result<()>;

    async fn push(&self, path: &Path, branch: &str) -> Result<()>;
}

pub struct Git {
    name: String,
    email: String,
    remote: String,
    timeout: Duration,
}

impl Git {
    pub fn new(config: &CheckConfig) -> Self {
        Self {
            name: config.git_name.clone(),
            email: config.git_email.clone(),
            remote: "origin".to_string(),
            timeout: config.timeouts.publish(),
        }
    }

    async fn git(&self, path: &Path, args: &[&str]) -> Result<CommandOutput> {
        let mut argv = vec![
            "git".to_string(),
            "-c".to_string(),
            format!("user.name={}", self.name),
            "-c".to_string(),
            format!("user.email={}", self.email),
        ];
        argv.extend(args.iter().map(|a| a.to_string()));
        run_command(&argv, path, &[("GIT_TERMINAL_PROMPT", "0".to_string())], self.timeout).await
    }

    async fn git_ok(&self, path: &Path, args: &[&str]) -> Result<()> {
        let out = self.git(path, args).await?;
        if !out.success() {
            bail!("git {} failed: {}", args[0], out.output.trim());
        }
        Ok(())
    }
}

#[async_trait]
impl Vcs for Git {
    async fn stage_all(&self, path: &Path) -> Result<()> { self.git_ok(path, &["add", "-A", "."]).await }

    async fn has_staged_changes(&self, path: &Path) -> Result<bool> {
        let out = self.git(path, &["diff", "--cached", "--quiet", "--", "."]).await?;
        match out.code {
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            _ => bail!("git diff failed: {}", out.output.trim()),
        }
    }

    async fn commit(&self, path: &Path, branch: &str, message: &str) -> Result<()> {
        self.git_ok(path, &["checkout", "-b", branch]).await?;
        self.git_ok(path, &["commit", "-m", message, "--", "."]).await
    }

    async fn push(&self, path: &Path, branch: &str) -> Result<()> {
        let refspec = format!("HEAD:refs/heads/{branch}");
        let out = self.git(path, &["push", &self.remote, &refspec]).await?;
        ensure_success("git push", &out)
    }
}
