//! Channel opener backed by SSH, with a local shortcut for loopback machines

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use spooky_core::{ChannelOpener, Machine};
use spooky_exec::{CommandChannel, ExecError, LocalChannel, SshChannel};

/// Default implementation of `ChannelOpener`
#[derive(Debug, Clone, Copy, Default)]
pub struct SshChannelOpener;

impl SshChannelOpener {
    /// Create a new opener
    pub fn new() -> Self {
        Self
    }

    fn is_loopback(machine: &Machine) -> bool {
        machine.host == "localhost" || machine.host == "127.0.0.1"
    }
}

#[async_trait]
impl ChannelOpener for SshChannelOpener {
    async fn open(
        &self,
        machine: &Machine,
        connect_timeout: Duration,
    ) -> Result<Arc<dyn CommandChannel>, ExecError> {
        if Self::is_loopback(machine) {
            tracing::debug!(machine = %machine.name, "using local channel for loopback host");
            return Ok(Arc::new(LocalChannel::new()));
        }

        let channel = SshChannel::open(machine.connection_info(), connect_timeout).await?;
        Ok(Arc::new(channel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_loopback_uses_local_channel() {
        let machine = Machine::new("localhost", "127.0.0.1").with_password("unused");

        let channel = SshChannelOpener::new()
            .open(&machine, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(channel.channel_type(), "local");
    }

    #[tokio::test]
    async fn test_missing_credentials_fail_before_connecting() {
        let machine = Machine::new("web1", "192.0.2.10");

        let err = SshChannelOpener::new()
            .open(&machine, Duration::from_secs(1))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ExecError::AuthenticationFailed(_)));
    }
}
