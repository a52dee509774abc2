//! Credential resolution for clone and push
//!
//! The configured auth descriptor is turned into [`Credentials`] once at
//! startup. Secrets reach git through an askpass helper script and
//! environment variables, so they never appear on a command line.

use anyhow::{anyhow, bail, Context, Result};
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::process::Command as AsyncCommand;
use tracing::debug;

use crate::config::{AuthConfig, CommandConfig};

/// Environment variable carrying the username for the askpass helper
pub const USERNAME_ENV: &str = "FILESENTRY_GIT_USERNAME";
/// Environment variable carrying the password or key passphrase
pub const PASSWORD_ENV: &str = "FILESENTRY_GIT_PASSWORD";

const ASKPASS_SCRIPT: &str = r#"#!/bin/sh
case "$1" in
  Username*|username*) printf '%s\n' "$FILESENTRY_GIT_USERNAME" ;;
  *) printf '%s\n' "$FILESENTRY_GIT_PASSWORD" ;;
esac
"#;

/// Resolved credentials for the remote
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    /// HTTP basic authentication
    Basic { username: String, password: String },
    /// HTTP token, sent as basic auth with a placeholder username
    Token(String),
    /// Private key authentication
    Ssh {
        username: String,
        private_key: PathBuf,
        passphrase: Option<String>,
    },
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .finish_non_exhaustive(),
            Credentials::Token(_) => f.write_str("Token(..)"),
            Credentials::Ssh {
                username,
                private_key,
                ..
            } => f
                .debug_struct("Ssh")
                .field("username", username)
                .field("private_key", private_key)
                .finish_non_exhaustive(),
        }
    }
}

impl Credentials {
    /// Environment variables to set on every git invocation.
    ///
    /// `askpass` must point at an installed [`AskPass`] script whenever a
    /// secret needs to be delivered.
    pub fn git_env(&self, askpass: Option<&Path>) -> Vec<(String, String)> {
        let mut env = Vec::new();
        let askpass = askpass.map(|p| p.to_string_lossy().into_owned());

        match self {
            Credentials::Basic { username, password } => {
                env.push((USERNAME_ENV.to_string(), username.clone()));
                env.push((PASSWORD_ENV.to_string(), password.clone()));
                if let Some(askpass) = askpass {
                    env.push(("GIT_ASKPASS".to_string(), askpass));
                }
            }
            Credentials::Token(token) => {
                // Any non-empty username works for token auth
                env.push((USERNAME_ENV.to_string(), "git".to_string()));
                env.push((PASSWORD_ENV.to_string(), token.clone()));
                if let Some(askpass) = askpass {
                    env.push(("GIT_ASKPASS".to_string(), askpass));
                }
            }
            Credentials::Ssh {
                username,
                private_key,
                passphrase,
            } => {
                let ssh_command = format!(
                    "ssh -i {} -o IdentitiesOnly=yes -o User={}",
                    shell_quote(&private_key.to_string_lossy()),
                    shell_quote(username)
                );
                env.push(("GIT_SSH_COMMAND".to_string(), ssh_command));
                if let (Some(passphrase), Some(askpass)) = (passphrase, askpass) {
                    env.push((PASSWORD_ENV.to_string(), passphrase.clone()));
                    env.push(("SSH_ASKPASS".to_string(), askpass));
                    env.push(("SSH_ASKPASS_REQUIRE".to_string(), "force".to_string()));
                }
            }
        }

        env
    }

    /// Whether the askpass helper is needed to deliver a secret
    pub fn needs_askpass(&self) -> bool {
        match self {
            Credentials::Basic { .. } | Credentials::Token(_) => true,
            Credentials::Ssh { passphrase, .. } => passphrase.is_some(),
        }
    }
}

/// Resolve the configured auth descriptor. `None` means anonymous access.
pub async fn resolve(auth: &AuthConfig) -> Result<Option<Credentials>> {
    if let Some(basic) = &auth.basic {
        let password = match (&basic.password, &basic.password_command) {
            (Some(password), _) => password.clone(),
            (None, Some(command)) => run_secret_command(command).await?,
            (None, None) => String::new(),
        };

        return Ok(Some(Credentials::Basic {
            username: basic.username.clone(),
            password,
        }));
    }

    if let Some(token) = &auth.token {
        return Ok(Some(Credentials::Token(token.clone())));
    }

    if let Some(ssh) = &auth.ssh {
        let passphrase = match (&ssh.pk_password, &ssh.pk_password_command) {
            (Some(password), _) => Some(password.clone()),
            (None, Some(command)) => Some(run_secret_command(command).await?),
            (None, None) => None,
        };

        let private_key = PathBuf::from(&ssh.private_key);
        if !private_key.exists() {
            bail!("SSH private key not found: {}", private_key.display());
        }

        return Ok(Some(Credentials::Ssh {
            username: ssh.username.clone(),
            private_key,
            passphrase,
        }));
    }

    Ok(None)
}

/// Run a configured command and return its trimmed stdout
async fn run_secret_command(command: &CommandConfig) -> Result<String> {
    debug!("Resolving secret via command: {}", command.name);

    let output = AsyncCommand::new(&command.name)
        .args(&command.args)
        .output()
        .await
        .with_context(|| format!("Failed to execute password command: {}", command.name))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(anyhow!(
            "Password command {} failed ({}): {}",
            command.name,
            output.status,
            stderr.trim()
        ));
    }

    let secret = String::from_utf8(output.stdout)
        .with_context(|| format!("Output of password command {} is not valid UTF-8", command.name))?;

    Ok(secret.trim_end_matches(['\r', '\n']).to_string())
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Askpass helper script, removed again when dropped
#[derive(Debug)]
pub struct AskPass {
    path: PathBuf,
}

impl AskPass {
    /// Write the helper script into `dir`
    pub fn install(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create askpass directory: {}", dir.display()))?;

        let path = dir.join(format!("filesentry-askpass-{}.sh", std::process::id()));
        std::fs::write(&path, ASKPASS_SCRIPT)
            .with_context(|| format!("Failed to write askpass helper: {}", path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o700))
                .context("Failed to make askpass helper executable")?;
        }

        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for AskPass {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
