// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Entry points for bringing up a cluster and for tunnelling into it

use crate::access::{
    AccessAuthorizer, AccessError, AddressDiscovery, HostResolver,
};
use crate::config::{ClusterProfile, Config, TunnelConfig};
use crate::launch::{BringUpRun, LaunchError, LaunchSequencer};
use crate::poll;
use crate::probe::StatusProbe;
use crate::provider::{FirewallApi, Instance, ProviderError};
use crate::readiness::{Readiness, ReadinessOrchestrator};
use crate::registry::RoleRegistry;
use crate::site_file::{
    SiteFileError, SiteFileParams, StorageCredentials, write_site_file,
};
use crate::tunnel::{LoginTransport, TunnelError, TunnelHandle, open_proxy};
use camino::{Utf8Path, Utf8PathBuf};
use oxnet::IpNet;
use slog::{Logger, info, warn};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BringUpError {
    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error("failed to look up cluster instances")]
    Registry(#[from] ProviderError),

    #[error(transparent)]
    Access(#[from] AccessError),

    #[error(transparent)]
    SiteFile(#[from] SiteFileError),

    #[error(transparent)]
    Tunnel(#[from] TunnelError),
}

/// Where to write the client site file, and the credentials it carries
#[derive(Clone, Debug)]
pub struct SiteFileTarget {
    pub config_dir: Utf8PathBuf,
    pub credentials: StorageCredentials,
}

/// Result of a bring-up that got as far as waiting for readiness
#[derive(Debug)]
pub struct BringUpOutcome {
    /// The control-plane instance, if one is running
    pub control_plane: Option<Instance>,
    pub worker_coordinator: Option<Instance>,
    /// Client ranges the cluster's web UIs were opened to
    pub client_cidrs: Vec<IpNet>,
    /// Path of the client site file, if one was written
    pub site_file: Option<Utf8PathBuf>,
    pub readiness: Readiness,
}

/// Collaborators needed to bring up one cluster
pub struct ClusterBringUp<'a, P> {
    pub config: &'a Config,
    pub registry: &'a RoleRegistry,
    pub firewall: &'a dyn FirewallApi,
    pub discovery: &'a dyn AddressDiscovery,
    pub resolver: &'a dyn HostResolver,
    pub probe: &'a P,
    pub log: Logger,
}

impl<P: StatusProbe> ClusterBringUp<'_, P> {
    /// Launch every group of `run`, then open the cluster to
    /// `client_cidrs` and wait for it to become ready
    ///
    /// `run` stays with the caller, so whatever was launched before a
    /// failure is still known afterwards.  Nothing launched is ever torn
    /// down here.
    pub async fn bring_up(
        &self,
        run: &mut BringUpRun,
        client_cidrs: &[IpNet],
        site_file: Option<&SiteFileTarget>,
    ) -> Result<BringUpOutcome, BringUpError> {
        let config = self.config;
        let timeouts = &config.timeouts;
        let profile = &config.profile;

        LaunchSequencer::new(
            self.registry,
            timeouts.poll_interval,
            timeouts.singleton_timeout,
            &self.log,
        )
        .run(run)
        .await?;

        self.wait_for_instances(run).await;

        let control_plane =
            self.registry.running_singleton(&profile.control_plane_role).await?;
        let worker_coordinator = self
            .registry
            .running_singleton(&profile.worker_coordinator_role)
            .await?;
        let control_plane_host =
            control_plane.as_ref().and_then(|i| i.address.as_deref());
        let coordinator_host =
            worker_coordinator.as_ref().and_then(|i| i.address.as_deref());

        let hosts = control_plane_host.zip(coordinator_host);
        let site_file = match (site_file, hosts) {
            (Some(target), Some((control_plane_host, coordinator_host))) => {
                let path = write_site_file(
                    &target.config_dir,
                    &config.cluster_name,
                    &SiteFileParams {
                        control_plane_host,
                        control_plane_rpc_port: profile.control_plane_rpc_port,
                        coordinator_host,
                        coordinator_rpc_port: profile.coordinator_rpc_port,
                        socks_port: config.tunnel.local_port,
                        user: &config.tunnel.user,
                        credentials: &target.credentials,
                    },
                )?;
                info!(self.log, "wrote client site file"; "path" => %path);
                Some(path)
            }
            (Some(_), None) => {
                warn!(
                    self.log,
                    "control plane or worker coordinator is not running; \
                     not writing client site file"
                );
                None
            }
            (None, _) => None,
        };

        let client_cidrs = AccessAuthorizer::new(
            self.firewall,
            self.discovery,
            self.resolver,
            profile,
            &self.log,
        )
        .authorize(client_cidrs, control_plane_host, coordinator_host)
        .await?;

        let expected_workers =
            u32::try_from(run.requested_in_role(&profile.worker_role))
                .unwrap_or(u32::MAX);
        // The worker coordinator serves the status page that readiness is
        // judged by.
        let readiness = ReadinessOrchestrator::new(
            self.probe,
            timeouts.poll_interval,
            timeouts.readiness_timeout,
            &self.log,
        )
        .await_cluster_ready(coordinator_host, expected_workers)
        .await;
        if let Readiness::TimedOut { phase, last_observed } = readiness {
            warn!(
                self.log,
                "cluster did not become ready in time; inspect it manually";
                "phase" => %phase,
                "last_observed_workers" => ?last_observed,
            );
        }

        Ok(BringUpOutcome {
            control_plane,
            worker_coordinator,
            client_cidrs,
            site_file,
            readiness,
        })
    }

    /// Wait for every launched instance to report running.  Running late is
    /// not fatal: readiness waiting still gets its full budget.
    async fn wait_for_instances(&self, run: &BringUpRun) {
        if run.launched().is_empty() {
            return;
        }
        let timeouts = &self.config.timeouts;
        info!(
            self.log,
            "waiting for instances to start";
            "count" => run.launched().len(),
        );
        match self
            .registry
            .wait_until_running(
                run.launched(),
                &timeouts.poll_interval,
                &timeouts.singleton_timeout,
            )
            .await
        {
            Ok(_) => info!(self.log, "all instances running"),
            Err(poll::Error::TimedOut(elapsed)) => warn!(
                self.log,
                "not all instances are running; continuing anyway";
                "elapsed" => ?elapsed,
            ),
            Err(poll::Error::PermanentError(e)) => warn!(
                self.log,
                "failed to check instance states; continuing anyway";
                "error" => %e,
            ),
        }
    }
}

/// Running instances of the control-plane and data-node roles
pub async fn list_cluster(
    registry: &RoleRegistry,
    profile: &ClusterProfile,
) -> Result<Vec<Instance>, ProviderError> {
    registry
        .running_in_roles(&[
            profile.control_plane_role.clone(),
            profile.data_node_role.clone(),
        ])
        .await
}

/// Open a SOCKS tunnel to `instance`, or to the running control-plane
/// instance if none is given
///
/// Returns `Ok(None)` if there's no control plane to tunnel to.
pub async fn open_cluster_proxy(
    registry: &RoleRegistry,
    profile: &ClusterProfile,
    transport: &dyn LoginTransport,
    instance: Option<Instance>,
    log: &Logger,
) -> Result<Option<TunnelHandle>, BringUpError> {
    let instance = match instance {
        Some(instance) => Some(instance),
        None => registry.running_singleton(&profile.control_plane_role).await?,
    };
    Ok(open_proxy(transport, instance.as_ref(), log)?)
}

/// Tunnel settings with the identity file resolved against `base`
pub fn tunnel_config_relative_to(
    config: &TunnelConfig,
    base: &Utf8Path,
) -> TunnelConfig {
    let mut config = config.clone();
    config.identity_file = config.identity_file.take().map(|path| {
        if path.is_relative() { base.join(path) } else { path }
    });
    config
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_tunnel_identity_relative_to_config() {
        let base = Utf8Path::new("/etc/cluster");
        let config = TunnelConfig {
            identity_file: Some(Utf8PathBuf::from("keys/id_ed25519")),
            ..TunnelConfig::default()
        };
        let resolved = tunnel_config_relative_to(&config, base);
        assert_eq!(
            resolved.identity_file.as_deref(),
            Some(Utf8Path::new("/etc/cluster/keys/id_ed25519"))
        );

        let config = TunnelConfig {
            identity_file: Some(Utf8PathBuf::from("/root/.ssh/id_rsa")),
            ..TunnelConfig::default()
        };
        let resolved = tunnel_config_relative_to(&config, base);
        assert_eq!(resolved.identity_file, config.identity_file);

        let resolved =
            tunnel_config_relative_to(&TunnelConfig::default(), base);
        assert_eq!(resolved, TunnelConfig::default());
    }
}
