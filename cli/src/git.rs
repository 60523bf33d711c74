use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::time::Instant;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use pointer_codenav::CommitDiffer;
use pointer_codenav::db::DbError;
use pointer_codenav::db::models::RepositoryId;
use tokio::process::Command;
use tracing::{debug, error, info};

/// Diffs files of local checkouts with the git binary.
#[derive(Debug, Clone)]
pub struct GitDiffer {
    bin: String,
    repos: HashMap<RepositoryId, PathBuf>,
}

impl GitDiffer {
    pub fn new(bin: impl Into<String>, repos: HashMap<RepositoryId, PathBuf>) -> Self {
        Self {
            bin: bin.into(),
            repos,
        }
    }

    pub async fn validate_binary_exists(&self) -> Result<()> {
        info!(
            stage = "git",
            event = "git.binary_check.begin",
            git_bin = %self.bin,
            "checking git binary"
        );
        self.run(["--version"], None, "version").await?;
        Ok(())
    }

    fn repo_dir(&self, repository_id: RepositoryId) -> Result<&Path> {
        self.repos
            .get(&repository_id)
            .map(PathBuf::as_path)
            .ok_or_else(|| anyhow!("no checkout configured for repository {repository_id}"))
    }

    async fn diff_text(
        &self,
        repository_id: RepositoryId,
        from_commit: &str,
        to_commit: &str,
        path: &str,
    ) -> Result<Option<String>> {
        let cwd = self.repo_dir(repository_id)?;

        let exists = self
            .output(cat_file_args(to_commit, path), Some(cwd), "cat-file")
            .await?;
        if !exists.status.success() {
            return Ok(None);
        }

        let stdout = self
            .run(diff_args(from_commit, to_commit, path), Some(cwd), "diff")
            .await?;
        Ok(Some(stdout))
    }

    async fn output<I, S>(&self, args: I, cwd: Option<&Path>, operation: &str) -> Result<Output>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let args_vec = args
            .into_iter()
            .map(|s| s.as_ref().to_string())
            .collect::<Vec<_>>();

        let cmd_display = format!("{} {}", self.bin, args_vec.join(" "));
        debug!(
            stage = "git",
            event = "git.cmd.begin",
            operation = %operation,
            cwd = ?cwd.map(|p| p.display().to_string()),
            command = %cmd_display,
            "starting git command"
        );

        let mut cmd = Command::new(&self.bin);
        cmd.args(&args_vec);
        if let Some(cwd) = cwd {
            cmd.current_dir(cwd);
        }

        let start = Instant::now();
        let output = cmd
            .output()
            .await
            .with_context(|| format!("failed to execute '{cmd_display}'"))?;

        debug!(
            stage = "git",
            event = "git.cmd.end",
            operation = %operation,
            duration_ms = start.elapsed().as_millis(),
            status_code = ?output.status.code(),
            stdout_bytes = output.stdout.len(),
            command = %cmd_display,
            "git command finished"
        );

        Ok(output)
    }

    async fn run<I, S>(&self, args: I, cwd: Option<&Path>, operation: &str) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let output = self.output(args, cwd, operation).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!(
                stage = "git",
                event = "git.cmd.fail",
                operation = %operation,
                cwd = ?cwd.map(|p| p.display().to_string()),
                status_code = ?output.status.code(),
                stderr = %stderr.trim(),
                "git command failed"
            );
            return Err(anyhow!(
                "git {operation} failed (status {:?}): {}",
                output.status.code(),
                stderr.trim()
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn cat_file_args(commit: &str, path: &str) -> Vec<String> {
    vec![
        "cat-file".to_string(),
        "-e".to_string(),
        format!("{commit}:{path}"),
    ]
}

fn diff_args(from_commit: &str, to_commit: &str, path: &str) -> Vec<String> {
    vec![
        "diff".to_string(),
        "--no-color".to_string(),
        "--no-ext-diff".to_string(),
        "--unified=0".to_string(),
        from_commit.to_string(),
        to_commit.to_string(),
        "--".to_string(),
        path.to_string(),
    ]
}

#[async_trait]
impl CommitDiffer for GitDiffer {
    async fn diff(
        &self,
        repository_id: RepositoryId,
        from_commit: &str,
        to_commit: &str,
        path: &str,
    ) -> Result<Option<String>, DbError> {
        self.diff_text(repository_id, from_commit, to_commit, path)
            .await
            .map_err(|e| DbError::Diff(format!("{e:#}")))
    }
}
