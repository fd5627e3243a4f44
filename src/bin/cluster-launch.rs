// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bring up a cluster, or tunnel into one

use anyhow::{Context, Result, bail};
use camino::{Utf8Path, Utf8PathBuf};
use clap::{Parser, Subcommand};
use cluster_launch::access::{DnsResolver, HttpAddressDiscovery};
use cluster_launch::bringup::{
    SiteFileTarget, list_cluster, tunnel_config_relative_to,
};
use cluster_launch::registry::RoleRegistry;
use cluster_launch::sim::{SimCloud, SimStatusProbe};
use cluster_launch::site_file::StorageCredentials;
use cluster_launch::tunnel::{SshTransport, TunnelExit, open_proxy_to_host};
use cluster_launch::{BringUpRun, ClusterBringUp, Config, Readiness};
use oxnet::IpNet;
use slog::{Logger, info};
use std::sync::Arc;

#[derive(Debug, Subcommand)]
enum SubCommand {
    /// Bring up the configured cluster on the in-memory simulated cloud
    Simulate {
        /// Write the client site file under this directory.  Requires
        /// AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY to be set.
        #[clap(long)]
        config_dir: Option<Utf8PathBuf>,

        /// Open the cluster to this range instead of the configured ones
        /// (may be repeated)
        #[clap(long = "client-cidr")]
        client_cidrs: Vec<IpNet>,
    },

    /// Open a SOCKS tunnel through the given control-plane host and keep it
    /// open until interrupted
    Proxy {
        /// Address of the control-plane instance
        #[clap(long)]
        host: String,
    },
}

#[derive(Debug, Parser)]
#[clap(
    name = "cluster-launch",
    about = "Bring up a cluster on rented instances and tunnel into it"
)]
struct Args {
    /// Path to the cluster configuration TOML file
    #[clap(short, long, action)]
    config: Utf8PathBuf,

    #[clap(subcommand)]
    subcommand: SubCommand,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::from_file(&args.config)
        .with_context(|| format!("loading config {}", args.config))?;
    let log = config
        .log
        .to_logger("cluster-launch")
        .context("failed to create logger")?;

    match args.subcommand {
        SubCommand::Simulate { config_dir, client_cidrs } => {
            do_simulate(&config, config_dir, client_cidrs, &log).await
        }
        SubCommand::Proxy { host } => {
            let base = args.config.parent().unwrap_or(Utf8Path::new("."));
            do_proxy(&config, base, &host, &log).await
        }
    }
}

fn storage_credentials() -> Result<StorageCredentials> {
    Ok(StorageCredentials {
        access_key_id: std::env::var("AWS_ACCESS_KEY_ID")
            .context("AWS_ACCESS_KEY_ID must be set to write the site file")?,
        secret_access_key: std::env::var("AWS_SECRET_ACCESS_KEY").context(
            "AWS_SECRET_ACCESS_KEY must be set to write the site file",
        )?,
    })
}

async fn do_simulate(
    config: &Config,
    config_dir: Option<Utf8PathBuf>,
    client_cidrs: Vec<IpNet>,
    log: &Logger,
) -> Result<()> {
    let site_file = match config_dir {
        Some(config_dir) => Some(SiteFileTarget {
            config_dir,
            credentials: storage_credentials()?,
        }),
        None => None,
    };
    let client_cidrs = if client_cidrs.is_empty() {
        config.client_cidrs.clone()
    } else {
        client_cidrs
    };

    let cloud = Arc::new(SimCloud::new());
    let registry = RoleRegistry::new(cloud.clone(), log);
    let discovery = HttpAddressDiscovery::new(&config.discovery_url)?;
    let resolver = DnsResolver::new();
    let probe =
        SimStatusProbe::new(cloud.clone(), config.profile.worker_role.clone());
    let bring_up = ClusterBringUp {
        config,
        registry: &registry,
        firewall: &*cloud,
        discovery: &discovery,
        resolver: &resolver,
        probe: &probe,
        log: log.clone(),
    };

    let mut run = BringUpRun::new(config.groups.clone());
    let result =
        bring_up.bring_up(&mut run, &client_cidrs, site_file.as_ref()).await;
    info!(log, "launched instances"; "count" => run.launched().len());
    let outcome = result.context("bring-up failed")?;

    for instance in list_cluster(&registry, &config.profile).await? {
        let roles: Vec<&str> =
            instance.roles.iter().map(|r| r.as_str()).collect();
        println!(
            "{}\t{}\t{}\t{}",
            instance.id,
            roles.join("+"),
            instance.state,
            instance.address.as_deref().unwrap_or("-"),
        );
    }
    if let Some(path) = &outcome.site_file {
        println!("client site file: {}", path);
    }

    match outcome.readiness {
        Readiness::Ready { workers } => {
            println!("cluster is ready with {} worker(s)", workers);
            Ok(())
        }
        Readiness::NoControlPlane => {
            println!("no control plane is running; nothing to wait for");
            Ok(())
        }
        Readiness::TimedOut { phase, .. } => bail!(
            "cluster did not become ready in time ({}); inspect it manually",
            phase
        ),
    }
}

async fn do_proxy(
    config: &Config,
    base: &Utf8Path,
    host: &str,
    log: &Logger,
) -> Result<()> {
    let transport =
        SshTransport::new(tunnel_config_relative_to(&config.tunnel, base));
    let handle = open_proxy_to_host(&transport, host, log)?;
    println!(
        "SOCKS proxy on localhost:{} through {}; press Ctrl-C to stop",
        handle.local_port(),
        handle.host(),
    );

    let stop = handle.stop_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stop.cancel();
        }
    });

    match handle.wait().await? {
        TunnelExit::Stopped => Ok(()),
        TunnelExit::Exited(status) => {
            bail!("tunnel exited unexpectedly: {}", status)
        }
    }
}
