//! fsync-cli library: the command-line surface over fsync-core.
//!
//! Exposed as a library so integration tests can drive commands directly.

pub mod commands;
pub mod config;
pub mod persistence;
pub mod progress;
pub mod prompt;

pub use commands::run;
pub use config::{Args, Command, Config};
pub use persistence::JsonPeerStore;
pub use progress::ConsoleProgress;
pub use prompt::PromptConfirmer;
