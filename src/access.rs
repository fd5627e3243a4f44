// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Opening the cluster's firewall to a client and between its own roles

use crate::config::ClusterProfile;
use crate::provider::{FirewallApi, ProviderError};
use crate::role::Role;
use async_trait::async_trait;
use hickory_resolver::TokioResolver;
use hickory_resolver::config::ResolverConfig;
use hickory_resolver::name_server::TokioConnectionProvider;
use oxnet::IpNet;
use slog::{Logger, debug, info, warn};
use std::net::{AddrParseError, IpAddr};
use std::time::Duration;
use thiserror::Error;

/// Service that echoes back the caller's public address
pub const DEFAULT_DISCOVERY_URL: &str = "http://checkip.amazonaws.com/";

#[derive(Debug, Error)]
pub enum AccessError {
    #[error("failed to discover our public address from {url}")]
    Discovery {
        url: String,
        #[source]
        err: reqwest::Error,
    },

    #[error("{url} returned {body:?}, which is not an IP address")]
    BadDiscoveredAddress {
        url: String,
        body: String,
        #[source]
        err: AddrParseError,
    },

    #[error("failed to resolve {host}")]
    Resolve {
        host: String,
        #[source]
        err: hickory_resolver::ResolveError,
    },

    #[error("no addresses found for {host}")]
    NoAddresses { host: String },

    #[error("failed to open ports {port_from}-{port_to} of '{role}' to {cidr}")]
    Firewall {
        role: Role,
        port_from: u16,
        port_to: u16,
        cidr: IpNet,
        #[source]
        err: ProviderError,
    },
}

/// Finds the public address of the machine running the bring-up
#[async_trait]
pub trait AddressDiscovery: Send + Sync {
    async fn public_address(&self) -> Result<IpAddr, AccessError>;
}

/// [`AddressDiscovery`] that asks a plain-text "what is my address" service
pub struct HttpAddressDiscovery {
    client: reqwest::Client,
    url: String,
}

impl HttpAddressDiscovery {
    pub fn new(url: &str) -> Result<HttpAddressDiscovery, AccessError> {
        let client = reqwest::ClientBuilder::new()
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| AccessError::Discovery {
                url: url.to_string(),
                err,
            })?;
        Ok(HttpAddressDiscovery { client, url: url.to_string() })
    }
}

#[async_trait]
impl AddressDiscovery for HttpAddressDiscovery {
    async fn public_address(&self) -> Result<IpAddr, AccessError> {
        let discovery_err =
            |err| AccessError::Discovery { url: self.url.clone(), err };
        let body = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(discovery_err)?
            .error_for_status()
            .map_err(discovery_err)?
            .text()
            .await
            .map_err(discovery_err)?;
        let body = body.trim();
        body.parse().map_err(|err| AccessError::BadDiscoveredAddress {
            url: self.url.clone(),
            body: body.to_string(),
            err,
        })
    }
}

/// Resolves instance host names to addresses
#[async_trait]
pub trait HostResolver: Send + Sync {
    async fn lookup(&self, host: &str) -> Result<IpAddr, AccessError>;
}

/// [`HostResolver`] backed by DNS
pub struct DnsResolver {
    resolver: TokioResolver,
}

impl DnsResolver {
    pub fn new() -> DnsResolver {
        let resolver = TokioResolver::builder_with_config(
            ResolverConfig::default(),
            TokioConnectionProvider::default(),
        )
        .build();
        DnsResolver { resolver }
    }
}

impl Default for DnsResolver {
    fn default() -> DnsResolver {
        DnsResolver::new()
    }
}

#[async_trait]
impl HostResolver for DnsResolver {
    async fn lookup(&self, host: &str) -> Result<IpAddr, AccessError> {
        self.resolver
            .lookup_ip(host)
            .await
            .map_err(|err| AccessError::Resolve {
                host: host.to_string(),
                err,
            })?
            .iter()
            .next()
            .ok_or_else(|| AccessError::NoAddresses { host: host.to_string() })
    }
}

/// Resolve `host`, skipping the lookup if it's already an IP address
pub async fn resolve_host(
    resolver: &dyn HostResolver,
    host: &str,
) -> Result<IpAddr, AccessError> {
    match host.parse::<IpAddr>() {
        Ok(ip) => Ok(ip),
        Err(_) => resolver.lookup(host).await,
    }
}

pub struct AccessAuthorizer<'a> {
    firewall: &'a dyn FirewallApi,
    discovery: &'a dyn AddressDiscovery,
    resolver: &'a dyn HostResolver,
    profile: &'a ClusterProfile,
    log: Logger,
}

impl<'a> AccessAuthorizer<'a> {
    pub fn new(
        firewall: &'a dyn FirewallApi,
        discovery: &'a dyn AddressDiscovery,
        resolver: &'a dyn HostResolver,
        profile: &'a ClusterProfile,
        log: &Logger,
    ) -> AccessAuthorizer<'a> {
        AccessAuthorizer {
            firewall,
            discovery,
            resolver,
            profile,
            log: log.new(slog::o!("component" => "AccessAuthorizer")),
        }
    }

    /// Open the cluster's web UIs to `client_cidrs` (or, if there are none,
    /// to this machine's public address), and open each singleton's RPC port
    /// to the other singleton.
    ///
    /// Returns the client ranges that were authorized.
    pub async fn authorize(
        &self,
        client_cidrs: &[IpNet],
        control_plane: Option<&str>,
        worker_coordinator: Option<&str>,
    ) -> Result<Vec<IpNet>, AccessError> {
        let client_cidrs = if client_cidrs.is_empty() {
            debug!(self.log, "no client ranges given; using our own address");
            let ip = self.discovery.public_address().await?;
            vec![IpNet::host_net(ip)]
        } else {
            client_cidrs.to_vec()
        };
        info!(self.log, "authorizing client ranges"; "cidrs" => ?client_cidrs);

        let profile = self.profile;
        for cidr in &client_cidrs {
            self.open(
                &profile.control_plane_role,
                profile.management_ui_port,
                *cidr,
            )
            .await?;
            self.open(
                &profile.worker_coordinator_role,
                profile.status_ui_port,
                *cidr,
            )
            .await?;
        }

        let (Some(control_plane), Some(worker_coordinator)) =
            (control_plane, worker_coordinator)
        else {
            warn!(
                self.log,
                "control plane or worker coordinator is missing; not opening \
                 RPC ports between them";
                "control_plane" => ?control_plane,
                "worker_coordinator" => ?worker_coordinator,
            );
            return Ok(client_cidrs);
        };

        let control_plane_ip =
            resolve_host(self.resolver, control_plane).await?;
        let coordinator_ip =
            resolve_host(self.resolver, worker_coordinator).await?;
        for ip in [control_plane_ip, coordinator_ip] {
            let cidr = IpNet::host_net(ip);
            self.open(
                &profile.control_plane_role,
                profile.control_plane_rpc_port,
                cidr,
            )
            .await?;
            self.open(
                &profile.worker_coordinator_role,
                profile.coordinator_rpc_port,
                cidr,
            )
            .await?;
        }

        Ok(client_cidrs)
    }

    async fn open(
        &self,
        role: &Role,
        port: u16,
        cidr: IpNet,
    ) -> Result<(), AccessError> {
        debug!(
            self.log,
            "opening port";
            "role" => %role,
            "port" => port,
            "cidr" => %cidr,
        );
        self.firewall.authorize_role(role, port, port, cidr).await.map_err(
            |err| AccessError::Firewall {
                role: role.clone(),
                port_from: port,
                port_to: port,
                cidr,
                err,
            },
        )
    }
}
