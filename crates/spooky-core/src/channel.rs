//! Seam between the dispatcher and the transport

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use spooky_exec::{CommandChannel, ExecError};

use crate::config::Machine;

/// Opens command channels for machines
///
/// The binary wires in an SSH opener; tests inject mocks.
#[async_trait]
pub trait ChannelOpener: Send + Sync {
    /// Open an authenticated channel to `machine`
    async fn open(
        &self,
        machine: &Machine,
        connect_timeout: Duration,
    ) -> Result<Arc<dyn CommandChannel>, ExecError>;
}
