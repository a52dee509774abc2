use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use std::process::Output;
use tokio::process::Command as AsyncCommand;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::auth::{AskPass, Credentials};
use crate::config::{AuthorConfig, RepositoryConfig};
use crate::store::VersionedStore;

/// Git-backed [`VersionedStore`]: one commit per saved version or removal
pub struct GitStore {
    root: PathBuf,
    branch: Option<String>,
    author: AuthorConfig,
    credentials: Option<Credentials>,
    askpass: Option<AskPass>,
    state: Mutex<StoreState>,
}

/// Mutable repository state, guarded by the store lock
#[derive(Debug, Default)]
struct StoreState {
    /// Last commit known to be on the remote
    published_head: Option<String>,
}

impl GitStore {
    /// Open the repository at `config.path`, cloning `config.url` into it if absent
    pub async fn open_or_clone(
        config: &RepositoryConfig,
        credentials: Option<Credentials>,
    ) -> Result<Self> {
        let root = PathBuf::from(&config.path);

        let askpass = match &credentials {
            Some(credentials) if credentials.needs_askpass() => {
                let dir = dirs::runtime_dir().unwrap_or_else(std::env::temp_dir);
                Some(AskPass::install(&dir)?)
            }
            _ => None,
        };

        let mut store = Self {
            root,
            branch: config.branch.clone(),
            author: config.author.clone(),
            credentials,
            askpass,
            state: Mutex::new(StoreState::default()),
        };

        if store.root.join(".git").exists() {
            info!("Opening repository at {}", store.root.display());
            store
                .git(&["rev-parse", "--git-dir"])
                .await
                .context("Unable to open repository")?;
        } else {
            store.clone_from(&config.url).await?;
        }

        let published_head = store.upstream_head().await;
        debug!("Publish cursor initialised at {:?}", published_head);
        store.state.get_mut().published_head = published_head;

        Ok(store)
    }

    /// Local checkout location
    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn clone_from(&self, url: &str) -> Result<()> {
        info!("Cloning repository: {} -> {}", url, self.root.display());

        if let Some(parent) = self.root.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create parent directory")?;
        }

        let mut args = vec!["clone".to_string()];
        if let Some(branch) = &self.branch {
            args.push("--branch".to_string());
            args.push(branch.clone());
        }
        args.push("--".to_string());
        args.push(url.to_string());
        args.push(self.root.to_string_lossy().into_owned());

        let output = self
            .command(None)
            .args(&args)
            .output()
            .await
            .context("Failed to execute git clone")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("Unable to clone repository: {}", stderr.trim());
        }

        info!("Successfully cloned: {}", url);
        Ok(())
    }

    fn command(&self, cwd: Option<&Path>) -> AsyncCommand {
        let mut command = AsyncCommand::new("git");
        command
            .env("GIT_TERMINAL_PROMPT", "0")
            .kill_on_drop(true);

        if let Some(credentials) = &self.credentials {
            let askpass = self.askpass.as_ref().map(|a| a.path());
            command.envs(credentials.git_env(askpass));
        }
        if let Some(cwd) = cwd {
            command.current_dir(cwd);
        }

        command
    }

    /// Run git inside the repository, failing on a non-zero exit
    async fn git(&self, args: &[&str]) -> Result<Output> {
        let output = self.git_unchecked(args).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }

        Ok(output)
    }

    /// Run git inside the repository and hand back the raw result
    async fn git_unchecked(&self, args: &[&str]) -> Result<Output> {
        self.command(Some(&self.root))
            .args(args)
            .output()
            .await
            .with_context(|| format!("Failed to execute git {}", args.join(" ")))
    }

    async fn commit(&self, message: &str, name: &str) -> Result<()> {
        let user_name = format!("user.name={}", self.author.name);
        let user_email = format!("user.email={}", self.author.email);

        self.git(&[
            "-c",
            &user_name,
            "-c",
            &user_email,
            "commit",
            "--quiet",
            "--no-verify",
            "-m",
            message,
            "--",
            name,
        ])
        .await
        .map(|_| ())
    }

    async fn is_tracked(&self, name: &str) -> Result<bool> {
        let output = self
            .git_unchecked(&["ls-files", "--error-unmatch", "--", name])
            .await?;
        Ok(output.status.success())
    }

    async fn has_staged_changes(&self, name: &str) -> Result<bool> {
        let output = self
            .git_unchecked(&["diff", "--cached", "--quiet", "--", name])
            .await?;

        match output.status.code() {
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            _ => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                Err(anyhow!("git diff --cached failed: {}", stderr.trim()))
            }
        }
    }

    async fn head(&self) -> Option<String> {
        let output = self
            .git_unchecked(&["rev-parse", "--verify", "--quiet", "HEAD"])
            .await
            .ok()?;
        parse_commit_id(&output)
    }

    async fn upstream_head(&self) -> Option<String> {
        let output = self
            .git_unchecked(&["rev-parse", "--verify", "--quiet", "@{upstream}"])
            .await
            .ok()?;
        parse_commit_id(&output)
    }

    async fn current_branch(&self) -> Result<String> {
        if let Some(branch) = &self.branch {
            return Ok(branch.clone());
        }

        let output = self
            .git(&["symbolic-ref", "--short", "HEAD"])
            .await
            .context("Unable to determine the current branch")?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Returns whether a commit was recorded
    async fn write_and_commit(&self, target: &Path, name: &str, content: &[u8]) -> Result<bool> {
        tokio::fs::write(target, content)
            .await
            .context("Cannot write file content")?;
        self.git(&["add", "--", name])
            .await
            .context("Cannot add file to the index")?;

        if !self.has_staged_changes(name).await? {
            debug!("Content of {} is unchanged, nothing to record", name);
            return Ok(false);
        }

        self.commit(&format!("New version of {}", name), name)
            .await
            .context("Cannot commit change")?;
        Ok(true)
    }

    /// Put `name` back to its committed state after a failed save
    async fn rollback_save(&self, name: &str, was_tracked: bool) {
        let result = if was_tracked {
            match self.git(&["reset", "--quiet", "--", name]).await {
                Ok(_) => self.git(&["checkout", "--", name]).await.map(|_| ()),
                Err(e) => Err(e),
            }
        } else {
            let unstage = self
                .git(&["rm", "--cached", "--quiet", "--ignore-unmatch", "--", name])
                .await;
            let _ = tokio::fs::remove_file(self.root.join(name)).await;
            unstage.map(|_| ())
        };

        if let Err(e) = result {
            warn!("Failed to roll back {}: {:#}", name, e);
        }
    }

    async fn rollback_delete(&self, name: &str) {
        let result = match self.git(&["reset", "--quiet", "HEAD", "--", name]).await {
            Ok(_) => self.git(&["checkout", "HEAD", "--", name]).await.map(|_| ()),
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            warn!("Failed to roll back removal of {}: {:#}", name, e);
        }
    }
}

#[async_trait]
impl VersionedStore for GitStore {
    async fn save(&self, name: &Path, content: &[u8]) -> Result<()> {
        let name = repository_name(name)?;
        let _guard = self.state.lock().await;

        let target = self.root.join(&name);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Unable to create parent dir(s)")?;
        }

        let was_tracked = self.is_tracked(&name).await?;

        match self.write_and_commit(&target, &name, content).await {
            Ok(true) => {
                info!("Recorded new version of {}", name);
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(e) => {
                self.rollback_save(&name, was_tracked).await;
                Err(e)
            }
        }
    }

    async fn delete(&self, name: &Path) -> Result<()> {
        let name = repository_name(name)?;
        let _guard = self.state.lock().await;

        if !self.is_tracked(&name).await? {
            bail!("{} is not tracked by the store", name);
        }

        self.git(&["rm", "--quiet", "--", &name])
            .await
            .context("Cannot stage removal")?;

        if let Err(e) = self.commit(&format!("Remove {}", name), &name).await {
            self.rollback_delete(&name).await;
            return Err(e.context("Cannot commit removal"));
        }

        info!("Recorded removal of {}", name);
        Ok(())
    }

    async fn publish(&self) -> Result<()> {
        let mut state = self.state.lock().await;

        let Some(head) = self.head().await else {
            debug!("Repository has no commits, nothing to publish");
            return Ok(());
        };

        if state.published_head.as_deref() == Some(head.as_str()) {
            debug!("Nothing to publish, remote is at {}", head);
            return Ok(());
        }

        let branch = self.current_branch().await?;
        let refspec = format!("HEAD:refs/heads/{}", branch);

        info!("Start pushing to remote repository");
        self.git(&["push", "--quiet", "origin", &refspec])
            .await
            .context("Unable to push to remote repository")?;

        info!("Pushed {} to origin/{}", head, branch);
        state.published_head = Some(head);
        Ok(())
    }
}

/// Validate a store-relative name and render it with `/` separators
fn repository_name(name: &Path) -> Result<String> {
    let mut parts = Vec::new();

    for component in name.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            _ => bail!("Invalid store name {}: must be relative without '..'", name.display()),
        }
    }

    if parts.is_empty() {
        bail!("Invalid store name: empty path");
    }

    Ok(parts.join("/"))
}

fn parse_commit_id(output: &Output) -> Option<String> {
    if !output.status.success() {
        return None;
    }
    let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!id.is_empty()).then_some(id)
}
