//! SSH command channel using the russh crate

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use russh::keys::ssh_key;
use russh::keys::{PrivateKeyWithHashAlg, load_secret_key};
use russh::{ChannelMsg, Disconnect, client};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use crate::error::ExecError;
use crate::keys::ResolvedKey;
use crate::result::{CommandResult, ConnectionInfo};
use crate::traits::CommandChannel;

/// SSH client handler for russh
#[derive(Debug)]
struct SshClientHandler;

impl client::Handler for SshClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        // Accept all server keys (like StrictHostKeyChecking=no)
        Ok(true)
    }
}

/// SSH command channel
///
/// Holds one authenticated session; every command runs in its own
/// session channel on top of it.
pub struct SshChannel {
    /// Connection configuration
    conn_info: ConnectionInfo,
    /// SSH session, `None` once closed
    session: Mutex<Option<client::Handle<SshClientHandler>>>,
}

impl std::fmt::Debug for SshChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshChannel")
            .field("conn_info", &self.conn_info)
            .finish_non_exhaustive()
    }
}

impl SshChannel {
    /// Connect and authenticate to the remote host
    ///
    /// # Errors
    /// Returns `ExecError::AuthenticationFailed` when no credential is usable
    /// or the server rejects them, `ExecError::ConnectionFailed` on network or
    /// handshake failure, including `connect_timeout` expiry.
    #[instrument(skip(conn_info), fields(host = %conn_info.host, port = conn_info.port))]
    pub async fn open(
        conn_info: ConnectionInfo,
        connect_timeout: Duration,
    ) -> Result<Self, ExecError> {
        if conn_info.credentials.is_empty() {
            return Err(ExecError::AuthenticationFailed(
                "no password or key configured".to_string(),
            ));
        }

        // Resolve the key before touching the network so a broken key with
        // no password fallback fails as an authentication problem.
        let key = match conn_info.credentials.key.as_ref().map(|k| k.resolve()) {
            Some(Ok(key)) => Some(key),
            Some(Err(e)) => {
                if conn_info.credentials.password.is_none() {
                    return Err(ExecError::AuthenticationFailed(format!("unusable key: {e}")));
                }
                warn!(error = %e, "SSH key unusable, falling back to password");
                None
            }
            None => None,
        };

        info!(user = %conn_info.user, "connecting to SSH");

        let handshake = async {
            let config = Arc::new(client::Config::default());
            let mut session = client::connect(
                config,
                (conn_info.host.as_str(), conn_info.port),
                SshClientHandler,
            )
            .await
            .map_err(|e| ExecError::ConnectionFailed(e.to_string()))?;

            let authenticated = authenticate(&mut session, &conn_info, key.as_ref()).await?;
            if !authenticated {
                return Err(ExecError::AuthenticationFailed(format!(
                    "server rejected credentials for {}",
                    conn_info.user
                )));
            }
            Ok::<_, ExecError>(session)
        };

        // One deadline covers both the TCP handshake and authentication.
        let session = match timeout(connect_timeout, handshake).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(ExecError::ConnectionFailed(format!(
                    "connect timed out after {connect_timeout:?}"
                )));
            }
        };

        info!(host = %conn_info.host, "SSH connected and authenticated");

        Ok(Self {
            conn_info,
            session: Mutex::new(Some(session)),
        })
    }

    /// Get connection info
    pub fn connection_info(&self) -> &ConnectionInfo {
        &self.conn_info
    }
}

/// Try the key first, then the password
async fn authenticate(
    session: &mut client::Handle<SshClientHandler>,
    conn_info: &ConnectionInfo,
    key: Option<&ResolvedKey>,
) -> Result<bool, ExecError> {
    if let Some(key) = key {
        let key_pair = load_secret_key(key.path(), None)
            .map_err(|e| ExecError::SshKeyError(e.to_string()))?;

        let hash_alg = session
            .best_supported_rsa_hash()
            .await
            .ok()
            .flatten()
            .flatten();
        let auth_res = session
            .authenticate_publickey(
                &conn_info.user,
                PrivateKeyWithHashAlg::new(Arc::new(key_pair), hash_alg),
            )
            .await
            .map_err(|e| ExecError::AuthenticationFailed(e.to_string()))?;

        if auth_res.success() {
            return Ok(true);
        }
        debug!(user = %conn_info.user, "public key rejected");
    }

    if let Some(password) = conn_info.credentials.password.as_deref() {
        let auth_res = session
            .authenticate_password(&conn_info.user, password)
            .await
            .map_err(|e| ExecError::AuthenticationFailed(e.to_string()))?;
        return Ok(auth_res.success());
    }

    Ok(false)
}

#[async_trait]
impl CommandChannel for SshChannel {
    #[instrument(skip(self, cmd), fields(host = %self.conn_info.host))]
    async fn exec(&self, cmd: &str) -> Result<CommandResult, ExecError> {
        let session_lock = self.session.lock().await;
        let session = session_lock.as_ref().ok_or(ExecError::NotConnected)?;

        debug!(command = %cmd, "executing remote command");

        let start = Instant::now();

        let mut channel = session
            .channel_open_session()
            .await
            .map_err(|e| ExecError::IoError(e.to_string()))?;

        channel
            .exec(true, cmd)
            .await
            .map_err(|e| ExecError::IoError(e.to_string()))?;

        let mut status = -1;
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        // exit-status may arrive after EOF, so drain until the channel closes
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { data } => stdout.extend_from_slice(&data),
                ChannelMsg::ExtendedData { data, ext } if ext == 1 => {
                    stderr.extend_from_slice(&data);
                }
                ChannelMsg::ExitStatus { exit_status } => {
                    status = i32::try_from(exit_status).unwrap_or(-1);
                }
                _ => {}
            }
        }

        let duration = start.elapsed();
        let stdout = String::from_utf8_lossy(&stdout).to_string();
        let stderr = String::from_utf8_lossy(&stderr).to_string();

        debug!(
            command = %cmd,
            status = status,
            duration = ?duration,
            "remote command completed"
        );

        Ok(CommandResult {
            status,
            stdout,
            stderr,
            duration,
        })
    }

    async fn close(&self) -> Result<(), ExecError> {
        let mut session_lock = self.session.lock().await;

        if let Some(session) = session_lock.take() {
            session
                .disconnect(Disconnect::ByApplication, "", "English")
                .await
                .map_err(|e| ExecError::IoError(e.to_string()))?;
            info!(host = %self.conn_info.host, "SSH disconnected");
        }
        Ok(())
    }

    fn channel_type(&self) -> &'static str {
        "ssh"
    }
}
