//! FileSentry - Mirror files into a git repository
//!
//! FileSentry watches a configured set of files and directories, records every
//! change and deletion as a commit in a local git repository and periodically
//! pushes the accumulated history to a remote.
//!
//! ## Core Features
//!
//! - **Change Capture**: One commit per observed write, one per deletion
//! - **Recreation Recovery**: Files deleted and recreated (editor atomic saves) are re-watched
//! - **Scheduled Push**: Commits are published on a fixed interval and once more at shutdown
//! - **Authentication**: Basic, token or SSH key credentials, never exposed on the command line
//! - **Configuration Management**: YAML-based configuration with XDG compliance
//!
//! ## Modules
//!
//! - [`config`]: Configuration management and parsing
//! - [`auth`]: Credential resolution and git environment wiring
//! - [`store`]: The versioned store contract
//! - [`git`]: Git-backed store
//! - [`watch`]: Change observer on top of native filesystem notifications
//! - [`processor`]: Bridges observed changes into the store
//! - [`pusher`]: Periodic publishing
//! - [`daemon`]: Process lifecycle

pub mod auth;
pub mod config;
pub mod daemon;
pub mod git;
pub mod processor;
pub mod pusher;
pub mod store;
pub mod watch;

pub use auth::Credentials;
pub use config::Config;
pub use daemon::Daemon;
pub use git::GitStore;
pub use processor::{ManageSummary, Processor};
pub use pusher::Pusher;
pub use store::VersionedStore;
pub use watch::{ChangeObserver, FileWatcher, WatchHandler};
