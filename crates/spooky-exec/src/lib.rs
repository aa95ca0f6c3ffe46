//! spooky-exec: Remote command channel abstraction
//!
//! Provides the `CommandChannel` trait and its SSH and local implementations.

pub mod error;
pub mod keys;
pub mod local;
pub mod result;
pub mod ssh;
pub mod traits;

pub use error::ExecError;
pub use keys::{KeyError, KeySource, ResolvedKey};
pub use local::LocalChannel;
pub use result::{CommandResult, ConnectionInfo, Credentials};
pub use ssh::SshChannel;
pub use traits::{CommandChannel, read_script};
