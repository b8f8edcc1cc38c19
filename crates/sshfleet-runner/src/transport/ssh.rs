//! SSH transport built on `russh`, with file transfer over SFTP.
//!
//! Connection targets are resolved like the OpenSSH client would: the
//! descriptor's hostname is looked up in `~/.ssh/config` for `HostName`,
//! `Port`, `User`, `IdentityFile` and `ProxyCommand`. Values set on the
//! descriptor always win. Authentication tries the
//! descriptor's key file (or the configured/default identities) first, then
//! the password, and finally the `none` method.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::keys::{PrivateKeyWithHashAlg, PublicKey};
use russh::{ChannelMsg, Disconnect};
use russh_sftp::client::SftpSession;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use sshfleet_core::model::{DEFAULT_SSH_PORT, HostDescriptor, current_username};
use sshfleet_core::ssh_config::{SshClientConfig, expand_proxy_command};

use super::proxy::ProxyStream;
use super::{Connector, ExecOutput, RemoteShell, TransferChannel, TransportError};

/// SSH extended-data stream number for stderr.
const STDERR_STREAM: u32 = 1;

/// Identities tried when neither the descriptor nor the ssh config names one.
const DEFAULT_IDENTITIES: &[&str] = &["id_ed25519", "id_ecdsa", "id_rsa"];

/// What to do with server host keys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HostKeyPolicy {
    /// Accept and record unknown keys in `~/.ssh/known_hosts`; reject
    /// changed keys.
    #[default]
    AcceptNew,
    /// Only accept keys already present in `~/.ssh/known_hosts`.
    Strict,
    /// Accept any key without checking.
    AcceptAny,
}

/// Tunables for [`SshConnector`].
#[derive(Debug, Clone)]
pub struct SshOptions {
    /// Upper bound on connect + authenticate.
    pub connect_timeout: Duration,
    pub host_key_policy: HostKeyPolicy,
    pub keepalive_interval: Option<Duration>,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            host_key_policy: HostKeyPolicy::default(),
            keepalive_interval: Some(Duration::from_secs(30)),
        }
    }
}

/// Fully resolved connection target for one host descriptor.
#[derive(Clone, PartialEq, Eq)]
struct Target {
    alias: String,
    hostname: String,
    port: u16,
    username: String,
    password: Option<String>,
    identities: Vec<PathBuf>,
    proxy_command: Option<String>,
}

impl Target {
    fn label(&self) -> String {
        format!("{}@{}:{}", self.username, self.hostname, self.port)
    }
}

impl std::fmt::Debug for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Target")
            .field("alias", &self.alias)
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("identities", &self.identities)
            .field("proxy_command", &self.proxy_command)
            .finish_non_exhaustive()
    }
}

struct ClientHandler {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        if self.policy == HostKeyPolicy::AcceptAny {
            return Ok(true);
        }
        match russh::keys::check_known_hosts(&self.host, self.port, server_public_key) {
            Ok(true) => Ok(true),
            Ok(false) if self.policy == HostKeyPolicy::AcceptNew => {
                info!(host = %self.host, port = self.port, "Recording new host key");
                if let Err(e) = russh::keys::known_hosts::learn_known_hosts(
                    &self.host,
                    self.port,
                    server_public_key,
                ) {
                    warn!(host = %self.host, error = %e, "Failed to record host key");
                }
                Ok(true)
            }
            Ok(false) => {
                warn!(host = %self.host, "Unknown host key rejected by strict policy");
                Ok(false)
            }
            Err(e) => {
                warn!(host = %self.host, error = %e, "Host key verification failed");
                Ok(false)
            }
        }
    }
}

/// Opens authenticated `russh` sessions.
pub struct SshConnector {
    options: SshOptions,
    client_config: Arc<client::Config>,
    ssh_config: SshClientConfig,
}

impl SshConnector {
    /// Build a connector that honours `~/.ssh/config`.
    pub fn new(options: SshOptions) -> Result<Self, TransportError> {
        let ssh_config =
            SshClientConfig::load_default().map_err(|e| TransportError::Config(e.to_string()))?;
        Ok(Self::with_ssh_config(options, ssh_config))
    }

    pub fn with_ssh_config(options: SshOptions, ssh_config: SshClientConfig) -> Self {
        let client_config = client::Config {
            keepalive_interval: options.keepalive_interval,
            ..Default::default()
        };
        Self {
            options,
            client_config: Arc::new(client_config),
            ssh_config,
        }
    }

    fn resolve(&self, host: &HostDescriptor) -> Target {
        let opts = self.ssh_config.lookup(&host.hostname);
        let hostname = opts.hostname.unwrap_or_else(|| host.hostname.clone());
        let port = host.port.or(opts.port).unwrap_or(DEFAULT_SSH_PORT);
        let username = host
            .username
            .clone()
            .or(opts.user)
            .unwrap_or_else(current_username);

        let identities = if let Some(key) = &host.key_file {
            vec![key.clone()]
        } else if !opts.identity_files.is_empty() {
            opts.identity_files
        } else {
            default_identities()
        };

        let proxy_command = opts
            .proxy_command
            .map(|template| expand_proxy_command(&template, &host.hostname, &hostname, port, &username));

        Target {
            alias: host.hostname.clone(),
            hostname,
            port,
            username,
            password: host.password.clone(),
            identities,
            proxy_command,
        }
    }

    fn handler(&self, target: &Target) -> ClientHandler {
        ClientHandler {
            host: target.hostname.clone(),
            port: target.port,
            policy: self.options.host_key_policy,
        }
    }

    async fn open_session(&self, target: &Target) -> Result<Handle<ClientHandler>, TransportError> {
        let handler = self.handler(target);
        let config = Arc::clone(&self.client_config);

        let handle = if let Some(proxy) = &target.proxy_command {
            debug!(host = %target.alias, proxy = %proxy, "Tunnelling through ProxyCommand");
            let stream = ProxyStream::spawn(proxy)?;
            client::connect_stream(config, stream, handler).await
        } else {
            client::connect(config, (target.hostname.as_str(), target.port), handler).await
        };

        handle.map_err(|e| match e {
            russh::Error::UnknownKey => TransportError::HostKey(target.label()),
            e => TransportError::Connect(format!("{}: {e}", target.label())),
        })
    }
}

#[async_trait]
impl Connector for SshConnector {
    type Shell = SshShell;

    async fn connect(&self, host: &HostDescriptor) -> Result<SshShell, TransportError> {
        let target = self.resolve(host);
        debug!(target = ?target, "Connecting");

        let connect = async {
            let mut handle = self.open_session(&target).await?;
            authenticate(&mut handle, &target).await?;
            Ok::<_, TransportError>(handle)
        };
        let handle = tokio::time::timeout(self.options.connect_timeout, connect)
            .await
            .map_err(|_| {
                TransportError::Connect(format!(
                    "{}: timed out after {}s",
                    target.label(),
                    self.options.connect_timeout.as_secs()
                ))
            })??;

        debug!(host = %target.label(), "Connected");
        Ok(SshShell {
            handle,
            label: target.label(),
        })
    }
}

async fn authenticate(
    handle: &mut Handle<ClientHandler>,
    target: &Target,
) -> Result<(), TransportError> {
    let auth_err = |e: russh::Error| TransportError::Auth(format!("{}: {e}", target.label()));

    for path in &target.identities {
        let key = match russh::keys::load_secret_key(path, target.password.as_deref()) {
            Ok(key) => key,
            Err(e) => {
                debug!(key = %path.display(), error = %e, "Skipping unusable identity");
                continue;
            }
        };
        let hash_alg = handle
            .best_supported_rsa_hash()
            .await
            .map_err(auth_err)?
            .flatten();
        let outcome = handle
            .authenticate_publickey(
                &target.username,
                PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg),
            )
            .await
            .map_err(auth_err)?;
        if outcome.success() {
            debug!(host = %target.label(), key = %path.display(), "Authenticated with key");
            return Ok(());
        }
    }

    if let Some(password) = &target.password {
        let outcome = handle
            .authenticate_password(&target.username, password)
            .await
            .map_err(auth_err)?;
        if outcome.success() {
            debug!(host = %target.label(), "Authenticated with password");
            return Ok(());
        }
    }

    if handle
        .authenticate_none(&target.username)
        .await
        .map_err(auth_err)?
        .success()
    {
        debug!(host = %target.label(), "Authenticated without credentials");
        return Ok(());
    }

    Err(TransportError::Auth(format!(
        "{}: no authentication method succeeded",
        target.label()
    )))
}

fn default_identities() -> Vec<PathBuf> {
    let Some(home) = dirs::home_dir() else {
        return Vec::new();
    };
    DEFAULT_IDENTITIES
        .iter()
        .map(|name| home.join(".ssh").join(name))
        .filter(|path| path.exists())
        .collect()
}

/// A live `russh` session.
pub struct SshShell {
    handle: Handle<ClientHandler>,
    label: String,
}

#[async_trait]
impl RemoteShell for SshShell {
    type Transfer = SftpChannel;

    async fn exec(&mut self, command: &str) -> Result<ExecOutput, TransportError> {
        let mut channel = self.handle.channel_open_session().await?;
        channel.exec(true, command).await?;

        // Keep reading until the channel closes; the exit status may arrive
        // before the last data frames.
        let mut output = ExecOutput::default();
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { data } => output.stdout.extend_from_slice(&data),
                ChannelMsg::ExtendedData { data, ext } if ext == STDERR_STREAM => {
                    output.stderr.extend_from_slice(&data);
                }
                ChannelMsg::ExitStatus { exit_status } => output.exit_code = Some(exit_status),
                _ => {}
            }
        }
        Ok(output)
    }

    async fn open_transfer(&mut self) -> Result<SftpChannel, TransportError> {
        let channel = self.handle.channel_open_session().await?;
        channel.request_subsystem(true, "sftp").await?;
        let session = SftpSession::new(channel.into_stream()).await?;
        Ok(SftpChannel { session })
    }

    async fn disconnect(&mut self) {
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            debug!(host = %self.label, error = %e, "Disconnect failed");
        }
    }
}

/// SFTP channel over an [`SshShell`].
pub struct SftpChannel {
    session: SftpSession,
}

#[async_trait]
impl TransferChannel for SftpChannel {
    async fn create_dir(&mut self, path: &str) -> Result<(), TransportError> {
        self.session.create_dir(path).await?;
        Ok(())
    }

    async fn upload(&mut self, local: &Path, remote: &str) -> Result<u64, TransportError> {
        let mut source = tokio::fs::File::open(local).await?;
        let mut dest = self.session.create(remote).await?;
        let copied = tokio::io::copy(&mut source, &mut dest).await?;
        dest.shutdown().await?;
        Ok(copied)
    }

    async fn download(&mut self, remote: &str, local: &Path) -> Result<u64, TransportError> {
        let mut source = self.session.open(remote).await?;
        let mut dest = tokio::fs::File::create(local).await?;
        let copied = tokio::io::copy(&mut source, &mut dest).await?;
        dest.flush().await?;
        Ok(copied)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.session.close().await?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn connector(config: &str) -> SshConnector {
        SshConnector::with_ssh_config(SshOptions::default(), SshClientConfig::parse(config))
    }

    #[test]
    fn resolve_without_config_uses_descriptor() {
        let host = HostDescriptor::new("node1", 2)
            .with_username("alice")
            .with_port(2200)
            .with_key_file("/keys/id");
        let target = connector("").resolve(&host);
        assert_eq!(target.hostname, "node1");
        assert_eq!(target.port, 2200);
        assert_eq!(target.username, "alice");
        assert_eq!(target.identities, vec![PathBuf::from("/keys/id")]);
        assert_eq!(target.proxy_command, None);
    }

    #[test]
    fn resolve_applies_ssh_config_alias() {
        let config = "Host gpu\n  HostName 10.1.2.3\n  Port 2022\n  IdentityFile /keys/gpu\n";
        let target = connector(config).resolve(&HostDescriptor::new("gpu", 1).with_username("bob"));
        assert_eq!(target.alias, "gpu");
        assert_eq!(target.hostname, "10.1.2.3");
        assert_eq!(target.port, 2022);
        assert_eq!(target.identities, vec![PathBuf::from("/keys/gpu")]);
    }

    #[test]
    fn explicit_port_beats_ssh_config() {
        let config = "Host gpu\n  Port 2022\n";
        let host = HostDescriptor::new("gpu", 1).with_username("bob").with_port(2200);
        assert_eq!(connector(config).resolve(&host).port, 2200);
    }

    #[test]
    fn proxy_command_is_expanded() {
        let config = "Host node*\n  ProxyCommand ssh -W %h:%p %r@bastion\n";
        let target = connector(config).resolve(&HostDescriptor::new("node7", 1).with_username("carol"));
        assert_eq!(
            target.proxy_command.as_deref(),
            Some("ssh -W node7:22 carol@bastion")
        );
    }

    #[test]
    fn explicit_default_port_beats_ssh_config() {
        let config = "Host gpu\n  Port 2022\n";
        let host = HostDescriptor::new("gpu", 1).with_port(DEFAULT_SSH_PORT);
        assert_eq!(connector(config).resolve(&host).port, DEFAULT_SSH_PORT);

        let unset = HostDescriptor::new("gpu", 1);
        assert_eq!(connector(config).resolve(&unset).port, 2022);
        assert_eq!(connector("").resolve(&unset).port, DEFAULT_SSH_PORT);
    }

    #[test]
    fn manifest_hosts_fall_back_to_ssh_config() {
        let manifest = sshfleet_core::Manifest::parse(
            r#"
[[hosts]]
hostname = "gpu"
cpu_slots = 1

[[hosts]]
hostname = "gpu"
cpu_slots = 1
username = "bob"
port = 22

[[jobs]]
command = "true"
"#,
        )
        .unwrap();
        let hosts = manifest.host_descriptors();
        let config = connector("Host gpu\n  User deploy\n  Port 2022\n");

        let implicit = config.resolve(&hosts[0]);
        assert_eq!(implicit.username, "deploy");
        assert_eq!(implicit.port, 2022);

        let explicit = config.resolve(&hosts[1]);
        assert_eq!(explicit.username, "bob");
        assert_eq!(explicit.port, 22);
    }

    #[test]
    fn ssh_config_user_fills_unset_username() {
        let config = "Host gpu\n  User deploy\n";
        let target = connector(config).resolve(&HostDescriptor::new("gpu", 1));
        assert_eq!(target.username, "deploy");

        let named = connector(config).resolve(&HostDescriptor::new("gpu", 1).with_username("bob"));
        assert_eq!(named.username, "bob");
    }

    #[test]
    fn target_debug_hides_password() {
        let host = HostDescriptor::new("node1", 1).with_username("alice").with_password("s3cret");
        let target = connector("").resolve(&host);
        assert!(!format!("{target:?}").contains("s3cret"));
    }

    #[test]
    fn handler_keeps_resolved_endpoint_and_policy() {
        let options = SshOptions {
            host_key_policy: HostKeyPolicy::Strict,
            ..SshOptions::default()
        };
        let config = SshClientConfig::parse("Host gpu\n  HostName 10.1.2.3\n  Port 2022\n");
        let connector = SshConnector::with_ssh_config(options, config);
        let handler = connector.handler(&connector.resolve(&HostDescriptor::new("gpu", 1)));
        assert_eq!(handler.host, "10.1.2.3");
        assert_eq!(handler.port, 2022);
        assert_eq!(handler.policy, HostKeyPolicy::Strict);
    }

    #[test]
    fn default_options() {
        let options = SshOptions::default();
        assert_eq!(options.host_key_policy, HostKeyPolicy::AcceptNew);
        assert_eq!(options.connect_timeout, Duration::from_secs(30));
    }
}
