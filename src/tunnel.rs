// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! SOCKS tunnel from the client to the cluster's control plane
//!
//! The tunnel is an `ssh -N -D <port>` session owned by a background task.
//! The task runs until the session dies on its own or the
//! [`TunnelHandle`] asks it to stop.

use crate::config::TunnelConfig;
use crate::provider::{Instance, InstanceId};
use slog::{Logger, debug, error, info, warn};
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("control plane instance {0} has no address")]
    NoAddress(InstanceId),
    #[error("failed to start tunnel to {host}")]
    Spawn {
        host: String,
        #[source]
        err: std::io::Error,
    },
    #[error("failed waiting for tunnel process")]
    Wait(#[source] std::io::Error),
    #[error("failed to stop tunnel process")]
    Kill(#[source] std::io::Error),
    #[error("tunnel supervisor task failed")]
    Join(#[source] tokio::task::JoinError),
}

/// Starts the long-running remote-login process that carries the tunnel
pub trait LoginTransport: Send + Sync {
    /// Start a process forwarding a local SOCKS port through `host`
    fn spawn_forwarder(&self, host: &str) -> std::io::Result<Child>;

    /// Local port the forwarder listens on
    fn local_port(&self) -> u16;
}

/// [`LoginTransport`] that runs the system's ssh client
pub struct SshTransport {
    config: TunnelConfig,
}

impl SshTransport {
    pub fn new(config: TunnelConfig) -> SshTransport {
        SshTransport { config }
    }

    /// Arguments passed to ssh to open the tunnel through `host`
    pub fn ssh_args(&self, host: &str) -> Vec<String> {
        let config = &self.config;
        // ssh keeps the first value given for an option, so the caller's
        // options go ahead of the defaults.
        let mut args = config.ssh_options.clone();
        args.extend([
            String::from("-o"),
            format!("ConnectTimeout={}", config.connect_timeout.as_secs()),
            String::from("-o"),
            format!(
                "ServerAliveInterval={}",
                config.keepalive_interval.as_secs()
            ),
            String::from("-N"),
            String::from("-D"),
            config.local_port.to_string(),
        ]);
        if let Some(identity_file) = &config.identity_file {
            args.push(String::from("-i"));
            args.push(identity_file.to_string());
        }
        args.push(String::from("-l"));
        args.push(config.user.clone());
        args.push(host.to_string());
        args
    }

    /// The ssh command for a tunnel through `host`.  It runs with this
    /// process's environment, so ssh finds the caller's agent.
    fn command(&self, host: &str) -> Command {
        let mut cmd = Command::new(self.config.ssh_program.as_std_path());
        cmd.args(self.ssh_args(host))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

impl LoginTransport for SshTransport {
    fn spawn_forwarder(&self, host: &str) -> std::io::Result<Child> {
        self.command(host).spawn()
    }

    fn local_port(&self) -> u16 {
        self.config.local_port
    }
}

/// How a tunnel ended
#[derive(Debug, PartialEq, Eq)]
pub enum TunnelExit {
    /// stopped through [`TunnelHandle::close`] or its stop token
    Stopped,
    /// the process exited on its own
    Exited(ExitStatus),
}

/// Handle to a running tunnel
///
/// Dropping the handle without closing it leaves the supervisor task
/// running until the process exits or the runtime shuts down.
pub struct TunnelHandle {
    host: String,
    local_port: u16,
    pid: Option<u32>,
    stop: CancellationToken,
    task: JoinHandle<Result<TunnelExit, TunnelError>>,
}

impl TunnelHandle {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Process id of the tunnel's remote-login process
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Token that stops the tunnel when cancelled
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the tunnel to end, either on its own or because its stop
    /// token was cancelled
    pub async fn wait(self) -> Result<TunnelExit, TunnelError> {
        self.task.await.map_err(TunnelError::Join)?
    }

    /// Stop the tunnel and wait for its process to go away
    pub async fn close(self) -> Result<TunnelExit, TunnelError> {
        self.stop.cancel();
        self.wait().await
    }
}

/// Open a tunnel to the control plane instance
///
/// Returns `Ok(None)` if there is no control plane instance to tunnel to.
/// Otherwise returns as soon as the remote-login process has started; it
/// does not wait for the connection to be established.
pub fn open_proxy(
    transport: &dyn LoginTransport,
    control_plane: Option<&Instance>,
    log: &Logger,
) -> Result<Option<TunnelHandle>, TunnelError> {
    let Some(instance) = control_plane else {
        error!(log, "no control plane instance running; not opening tunnel");
        return Ok(None);
    };
    let host = instance
        .address
        .clone()
        .ok_or_else(|| TunnelError::NoAddress(instance.id.clone()))?;
    open_proxy_to_host(transport, &host, log).map(Some)
}

/// Open a tunnel through `host`
pub fn open_proxy_to_host(
    transport: &dyn LoginTransport,
    host: &str,
    log: &Logger,
) -> Result<TunnelHandle, TunnelError> {
    let local_port = transport.local_port();
    let log = log.new(slog::o!(
        "component" => "Tunnel",
        "host" => host.to_string(),
        "local_port" => local_port,
    ));
    let mut child = transport
        .spawn_forwarder(host)
        .map_err(|err| TunnelError::Spawn { host: host.to_string(), err })?;
    let pid = child.id();
    info!(log, "started tunnel"; "pid" => ?pid);

    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(log_stderr(stderr, log.clone()));
    }

    let stop = CancellationToken::new();
    let task = tokio::spawn(supervise(child, stop.clone(), log));
    Ok(TunnelHandle {
        host: host.to_string(),
        local_port,
        pid,
        stop,
        task,
    })
}

async fn supervise(
    mut child: Child,
    stop: CancellationToken,
    log: Logger,
) -> Result<TunnelExit, TunnelError> {
    tokio::select! {
        status = child.wait() => {
            let status = status.map_err(TunnelError::Wait)?;
            warn!(log, "tunnel process exited"; "status" => %status);
            Ok(TunnelExit::Exited(status))
        }
        _ = stop.cancelled() => {
            child.kill().await.map_err(TunnelError::Kill)?;
            info!(log, "stopped tunnel");
            Ok(TunnelExit::Stopped)
        }
    }
}

async fn log_stderr(stderr: ChildStderr, log: Logger) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(log, "ssh: {}", line);
    }
}
