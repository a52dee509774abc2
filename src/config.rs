use anyhow::{bail, Context, Result};
use dirs::config_dir;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure for FileSentry
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    /// Backing git repository
    pub repository: RepositoryConfig,

    /// Absolute paths to mirror into the repository.
    ///
    /// Values are reserved for per-path options; only the keys are used today.
    #[serde(default)]
    pub files: BTreeMap<String, serde_yaml::Value>,

    /// Watcher tuning
    #[serde(default)]
    pub watch: WatchConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Repository configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RepositoryConfig {
    /// Remote URL used for clone and push
    pub url: String,

    /// Branch to clone and push (remote default when unset)
    #[serde(default)]
    pub branch: Option<String>,

    /// Local checkout location
    #[serde(default = "default_repository_path")]
    pub path: String,

    /// Push interval
    #[serde(default = "default_push_interval")]
    pub push_interval: String, // "5m", "0" disables

    /// Commit identity
    #[serde(default)]
    pub author: AuthorConfig,

    /// Authentication used for clone and push
    #[serde(default)]
    pub auth: AuthConfig,
}

/// Commit author identity
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AuthorConfig {
    #[serde(default = "default_author_name")]
    pub name: String,

    #[serde(default = "default_author_email")]
    pub email: String,
}

/// Authentication descriptor. At most one method may be set.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct AuthConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basic: Option<BasicAuthConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh: Option<SshAuthConfig>,
}

/// Username and password (or a command printing the password)
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BasicAuthConfig {
    pub username: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_command: Option<CommandConfig>,
}

/// Private key authentication
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SshAuthConfig {
    #[serde(default = "default_ssh_username")]
    pub username: String,

    pub private_key: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pk_password: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pk_password_command: Option<CommandConfig>,
}

/// External command whose stdout yields a secret
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CommandConfig {
    pub name: String,

    #[serde(default)]
    pub args: Vec<String>,
}

/// Watcher configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct WatchConfig {
    /// How often deleted paths are checked for recreation
    #[serde(default = "default_recovery_interval")]
    pub recovery_interval: String,

    /// Upper bound for background tasks to stop on shutdown
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: String,
}

/// Logging configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String, // "info"

    /// Log format
    #[serde(default = "default_log_format")]
    pub format: String, // "compact", "pretty", "full"

    /// Enable colored output
    #[serde(default = "default_true")]
    pub color: bool,
}

// Default value functions
fn default_true() -> bool {
    true
}
fn default_repository_path() -> String {
    if let Ok(data_home) = std::env::var("XDG_DATA_HOME") {
        format!("{}/filesentry/repo", data_home)
    } else {
        "${HOME}/.local/share/filesentry/repo".to_string()
    }
}
fn default_push_interval() -> String {
    "5m".to_string()
}
fn default_author_name() -> String {
    "FileSentry".to_string()
}
fn default_author_email() -> String {
    "filesentry@localhost".to_string()
}
fn default_ssh_username() -> String {
    "git".to_string()
}
fn default_recovery_interval() -> String {
    "5s".to_string()
}
fn default_shutdown_timeout() -> String {
    "5s".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "compact".to_string()
}

impl Default for AuthorConfig {
    fn default() -> Self {
        Self {
            name: default_author_name(),
            email: default_author_email(),
        }
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            recovery_interval: default_recovery_interval(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            color: default_true(),
        }
    }
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            branch: None,
            path: default_repository_path(),
            push_interval: default_push_interval(),
            author: AuthorConfig::default(),
            auth: AuthConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a specific file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let mut config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        config.expand_paths()?;

        Ok(config)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_yaml::to_string(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;

        Ok(())
    }

    /// Get the default configuration file path (XDG compliant)
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = config_dir().context("Failed to get user config directory")?;

        Ok(config_dir.join("filesentry").join("config.yml"))
    }

    /// Expand environment variables and `~` in configured paths
    pub fn expand_paths(&mut self) -> Result<()> {
        self.repository.path = shellexpand::full(&self.repository.path)
            .context("Failed to expand repository path")?
            .into_owned();

        if let Some(ssh) = self.repository.auth.ssh.as_mut() {
            ssh.private_key = shellexpand::full(&ssh.private_key)
                .context("Failed to expand ssh private_key path")?
                .into_owned();
        }

        let mut files = BTreeMap::new();
        for (path, options) in std::mem::take(&mut self.files) {
            let expanded = shellexpand::full(&path)
                .with_context(|| format!("Failed to expand managed path: {}", path))?
                .into_owned();
            files.insert(expanded, options);
        }
        self.files = files;

        Ok(())
    }

    /// Check the configuration for mistakes that would only surface at runtime
    pub fn validate(&self) -> Result<()> {
        if self.repository.url.trim().is_empty() {
            bail!("repository.url must be set");
        }

        let auth = &self.repository.auth;
        let methods = [auth.basic.is_some(), auth.token.is_some(), auth.ssh.is_some()]
            .iter()
            .filter(|set| **set)
            .count();
        if methods > 1 {
            bail!("repository.auth must configure at most one of basic, token or ssh");
        }

        self.push_interval()?;
        self.recovery_interval()?;
        self.shutdown_timeout()?;

        for path in self.files.keys() {
            if !Path::new(path).is_absolute() {
                tracing::warn!(path = %path, "Managed path is not absolute and will be ignored");
            }
        }

        Ok(())
    }

    /// Managed paths in configuration order
    pub fn managed_paths(&self) -> Vec<PathBuf> {
        self.files.keys().map(PathBuf::from).collect()
    }

    pub fn repository_path(&self) -> PathBuf {
        PathBuf::from(&self.repository.path)
    }

    pub fn push_interval(&self) -> Result<Duration> {
        parse_duration(&self.repository.push_interval).context("Invalid repository.push_interval")
    }

    pub fn recovery_interval(&self) -> Result<Duration> {
        parse_duration(&self.watch.recovery_interval).context("Invalid watch.recovery_interval")
    }

    pub fn shutdown_timeout(&self) -> Result<Duration> {
        parse_duration(&self.watch.shutdown_timeout).context("Invalid watch.shutdown_timeout")
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            repository: RepositoryConfig::default(),
            files: BTreeMap::new(),
            watch: WatchConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Parse duration strings like "500ms", "30s", "5m", "1h", "2d" or bare seconds
pub fn parse_duration(duration_str: &str) -> Result<Duration> {
    let duration_str = duration_str.trim().to_lowercase();

    if let Some(value) = duration_str.strip_suffix("ms") {
        value
            .trim()
            .parse::<u64>()
            .map(Duration::from_millis)
            .context("Invalid milliseconds value")
    } else if let Some(value) = duration_str.strip_suffix('s') {
        value.trim().parse::<u64>().map(Duration::from_secs).context("Invalid seconds value")
    } else if let Some(value) = duration_str.strip_suffix('m') {
        value
            .trim()
            .parse::<u64>()
            .map(|v| Duration::from_secs(v * 60))
            .context("Invalid minutes value")
    } else if let Some(value) = duration_str.strip_suffix('h') {
        value
            .trim()
            .parse::<u64>()
            .map(|v| Duration::from_secs(v * 3600))
            .context("Invalid hours value")
    } else if let Some(value) = duration_str.strip_suffix('d') {
        value
            .trim()
            .parse::<u64>()
            .map(|v| Duration::from_secs(v * 86400))
            .context("Invalid days value")
    } else {
        duration_str
            .parse::<u64>()
            .map(Duration::from_secs)
            .context("Invalid duration format. Use format like '30s', '5m', '1h'")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use tempfile::TempDir;

    fn minimal_config() -> Config {
        let mut config = Config::default();
        config.repository.url = "https://example.com/backup.git".to_string();
        config
    }

    #[test]
    fn test_config_default_values() {
        let config = Config::default();

        assert!(config.repository.url.is_empty());
        assert!(config.repository.branch.is_none());
        assert_eq!(config.repository.push_interval, "5m");
        assert_eq!(config.repository.author.name, "FileSentry");
        assert_eq!(config.watch.recovery_interval, "5s");
        assert_eq!(config.watch.shutdown_timeout, "5s");
        assert_eq!(config.logging.level, "info");
        assert!(config.logging.color);
        assert!(config.files.is_empty());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("2d").unwrap(), Duration::from_secs(172800));
        assert_eq!(parse_duration("45").unwrap(), Duration::from_secs(45));
        assert_eq!(parse_duration("0").unwrap(), Duration::ZERO);
        assert_eq!(parse_duration(" 10S ").unwrap(), Duration::from_secs(10));

        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("").is_err());
        assert!(parse_duration("5w").is_err());
    }

    #[test]
    fn test_expand_paths() {
        env::set_var("TEST_FILESENTRY_HOME", "/test/home");

        let mut config = minimal_config();
        config.repository.path = "${TEST_FILESENTRY_HOME}/repo".to_string();
        config
            .files
            .insert("${TEST_FILESENTRY_HOME}/notes.txt".to_string(), serde_yaml::Value::Null);

        config.expand_paths().expect("Failed to expand paths");

        assert_eq!(config.repository.path, "/test/home/repo");
        assert_eq!(
            config.managed_paths(),
            vec![PathBuf::from("/test/home/notes.txt")]
        );

        env::remove_var("TEST_FILESENTRY_HOME");
    }

    #[test]
    fn test_config_load_nonexistent_file() {
        let result = Config::load(Path::new("/nonexistent/path/config.yml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_config_save_and_load() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config_path = temp_dir.path().join("filesentry").join("config.yml");

        let mut config = minimal_config();
        config.repository.path = "/custom/repo".to_string();
        config.repository.branch = Some("backup".to_string());
        config.repository.auth.token = Some("secret".to_string());
        config.files.insert("/etc/hosts".to_string(), serde_yaml::Value::Null);

        config.save(&config_path).expect("Failed to save config");
        let loaded = Config::load(&config_path).expect("Failed to load config");

        assert_eq!(loaded.repository.path, "/custom/repo");
        assert_eq!(loaded.repository.branch.as_deref(), Some("backup"));
        assert_eq!(loaded.repository.auth.token.as_deref(), Some("secret"));
        assert_eq!(loaded.managed_paths(), vec![PathBuf::from("/etc/hosts")]);
    }

    #[test]
    fn test_config_default_path_xdg() {
        let default_path = Config::default_config_path().expect("Failed to get default path");
        assert!(default_path.to_string_lossy().contains("filesentry"));
        assert!(default_path.to_string_lossy().ends_with("config.yml"));
    }

    #[test]
    fn test_validate_rejects_multiple_auth_methods() {
        let mut config = minimal_config();
        config.repository.auth.token = Some("t".to_string());
        config.repository.auth.basic = Some(BasicAuthConfig {
            username: "me".to_string(),
            password: Some("pw".to_string()),
            password_command: None,
        });

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("at most one"));
    }

    #[test]
    fn test_validate_rejects_missing_url_and_bad_interval() {
        let config = Config::default();
        assert!(config.validate().is_err());

        let mut config = minimal_config();
        config.repository.push_interval = "often".to_string();
        let err = config.validate().unwrap_err();
        assert!(format!("{:#}", err).contains("push_interval"));

        assert!(minimal_config().validate().is_ok());
    }

    #[test]
    fn test_yaml_parsing() {
        let yaml_content = r#"
repository:
  url: "git@github.com:me/backup.git"
  branch: "main"
  path: "/srv/backup"
  push_interval: "0"
  author:
    name: "Backup Bot"
  auth:
    ssh:
      private_key: "/keys/id_ed25519"
      pk_password_command:
        name: "pass"
        args: ["show", "ssh"]
files:
  /etc/hosts: {}
  /home/me/notes:
watch:
  recovery_interval: "200ms"
logging:
  level: "debug"
  format: "pretty"
  color: false
"#;

        let config: Config = serde_yaml::from_str(yaml_content).expect("Failed to parse YAML");

        assert_eq!(config.repository.url, "git@github.com:me/backup.git");
        assert_eq!(config.repository.branch.as_deref(), Some("main"));
        assert_eq!(config.push_interval().unwrap(), Duration::ZERO);
        assert_eq!(config.repository.author.name, "Backup Bot");
        assert_eq!(config.repository.author.email, "filesentry@localhost");

        let ssh = config.repository.auth.ssh.as_ref().expect("ssh auth");
        assert_eq!(ssh.username, "git");
        assert_eq!(ssh.private_key, "/keys/id_ed25519");
        let command = ssh.pk_password_command.as_ref().expect("command");
        assert_eq!(command.name, "pass");
        assert_eq!(command.args, vec!["show", "ssh"]);

        assert_eq!(
            config.managed_paths(),
            vec![PathBuf::from("/etc/hosts"), PathBuf::from("/home/me/notes")]
        );
        assert_eq!(config.recovery_interval().unwrap(), Duration::from_millis(200));
        assert_eq!(config.watch.shutdown_timeout, "5s");
        assert_eq!(config.logging.format, "pretty");
        assert!(!config.logging.color);
    }
}
