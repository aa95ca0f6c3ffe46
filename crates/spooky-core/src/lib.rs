//! spooky-core: Targeting and execution engine
//!
//! Resolves which machines an action applies to and dispatches the action
//! over command channels, sequentially or through a bounded worker pool.

pub mod channel;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod outcome;
pub mod pool;
pub mod resolver;

pub use channel::ChannelOpener;
pub use config::{Action, ActionTask, Config, Machine};
pub use dispatcher::{DispatchOptions, Dispatcher};
pub use error::CoreError;
pub use event::DispatchEvent;
pub use outcome::{ActionResult, Outcome};
pub use pool::{WorkerOutcome, WorkerPool};
pub use resolver::{FactTags, Resolver, TagSelector, resolve};
