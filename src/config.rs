// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interfaces for working with bring-up configuration

use crate::access::DEFAULT_DISCOVERY_URL;
use crate::role::{InstanceGroupRequest, Role};
use camino::{Utf8Path, Utf8PathBuf};
use dropshot::ConfigLogging;
use oxnet::IpNet;
use serde::Deserialize;
use serde_with::{DisplayFromStr, DurationSeconds, serde_as};
use std::time::Duration;

/// Configuration for one cluster bring-up
#[serde_as]
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// Name of the cluster; used for the client configuration directory
    pub cluster_name: String,
    /// Configuration for the bring-up log
    pub log: ConfigLogging,
    /// Ranges allowed to reach the cluster's web UIs.  If empty, this
    /// machine's public address is used.
    #[serde_as(as = "Vec<DisplayFromStr>")]
    #[serde(default)]
    pub client_cidrs: Vec<IpNet>,
    /// Service used to find this machine's public address
    #[serde(default = "default_discovery_url")]
    pub discovery_url: String,
    #[serde(default)]
    pub profile: ClusterProfile,
    #[serde(default)]
    pub timeouts: Timeouts,
    #[serde(default)]
    pub tunnel: TunnelConfig,
    /// Instance groups, in launch order
    pub groups: Vec<InstanceGroupRequest>,
}

fn default_discovery_url() -> String {
    DEFAULT_DISCOVERY_URL.to_string()
}

/// Names of the roles the bring-up treats specially, and the ports their
/// services listen on
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClusterProfile {
    pub control_plane_role: Role,
    pub worker_coordinator_role: Role,
    pub worker_role: Role,
    pub data_node_role: Role,
    pub management_ui_port: u16,
    pub status_ui_port: u16,
    pub control_plane_rpc_port: u16,
    pub coordinator_rpc_port: u16,
    /// Path of the coordinator's status page on `status_ui_port`
    pub status_path: String,
}

impl Default for ClusterProfile {
    fn default() -> ClusterProfile {
        ClusterProfile {
            control_plane_role: Role::new("nn"),
            worker_coordinator_role: Role::new("jt"),
            worker_role: Role::new("tt"),
            data_node_role: Role::new("dn"),
            management_ui_port: 80,
            status_ui_port: 50030,
            control_plane_rpc_port: 8020,
            coordinator_rpc_port: 8021,
            status_path: String::from("/jobtracker.jsp"),
        }
    }
}

#[serde_as]
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Timeouts {
    /// Time between attempts of every readiness poll
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "poll_interval_secs")]
    pub poll_interval: Duration,
    /// Overall budget for the cluster's services to come up
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "readiness_timeout_secs")]
    pub readiness_timeout: Duration,
    /// Budget for launched instances to reach the running state
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "singleton_timeout_secs")]
    pub singleton_timeout: Duration,
    /// Budget for each request to the status page
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "probe_timeout_secs")]
    pub probe_timeout: Duration,
    /// Additional attempts for each worker-count probe
    pub probe_retries: u32,
}

impl Default for Timeouts {
    fn default() -> Timeouts {
        Timeouts {
            poll_interval: Duration::from_secs(3),
            readiness_timeout: Duration::from_secs(600),
            singleton_timeout: Duration::from_secs(300),
            probe_timeout: Duration::from_secs(5),
            probe_retries: 2,
        }
    }
}

/// How to reach the control plane for the SOCKS tunnel
#[serde_as]
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TunnelConfig {
    pub user: String,
    /// Local port of the SOCKS listener
    pub local_port: u16,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "connect_timeout_secs")]
    pub connect_timeout: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "keepalive_interval_secs")]
    pub keepalive_interval: Duration,
    pub ssh_program: Utf8PathBuf,
    pub identity_file: Option<Utf8PathBuf>,
    /// Extra arguments passed to ssh ahead of the built-in options
    pub ssh_options: Vec<String>,
}

impl Default for TunnelConfig {
    fn default() -> TunnelConfig {
        TunnelConfig {
            user: String::from("root"),
            local_port: 6666,
            connect_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(60),
            ssh_program: Utf8PathBuf::from("ssh"),
            identity_file: None,
            ssh_options: Vec::new(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config from {path}: {err}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("Failed to parse config from {path}: {err}")]
    Parse {
        path: Utf8PathBuf,
        #[source]
        err: toml::de::Error,
    },
    #[error("Invalid config in {path}: {message}")]
    Invalid { path: Utf8PathBuf, message: String },
}

impl Config {
    pub fn from_file<P: AsRef<Utf8Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|err| ConfigError::Io { path: path.into(), err })?;
        let config: Config = toml::from_str(&contents)
            .map_err(|err| ConfigError::Parse { path: path.into(), err })?;
        config.validate().map_err(|message| ConfigError::Invalid {
            path: path.into(),
            message,
        })?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), String> {
        if self.cluster_name.is_empty()
            || self.cluster_name.contains(std::path::is_separator)
        {
            return Err(format!(
                "cluster_name {:?} must be non-empty and contain no path \
                 separators",
                self.cluster_name
            ));
        }
        if self.groups.is_empty() {
            return Err(String::from("at least one group must be configured"));
        }
        if let Some(group) = self.groups.iter().find(|g| g.roles.is_empty()) {
            return Err(format!(
                "group of {} instance(s) has no roles",
                group.count
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::launch::BringUpRun;
    use camino_tempfile::Utf8TempDir;

    #[test]
    fn test_example_config() {
        let path = Utf8Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("tests/config.test.toml");
        let config = Config::from_file(&path).expect("example config");
        assert_eq!(config.cluster_name, "test-cluster");
        assert_eq!(config.groups.len(), 3);
        assert_eq!(config.groups[0].label(), "nn+snn");
        let run = BringUpRun::new(config.groups.clone());
        assert_eq!(run.requested_in_role(&config.profile.worker_role), 5);
        assert_eq!(
            config.client_cidrs,
            vec!["198.51.100.0/24".parse::<IpNet>().unwrap()]
        );
        assert_eq!(config.timeouts.poll_interval, Duration::from_secs(1));
        assert_eq!(config.timeouts.readiness_timeout, Duration::from_secs(60));
        // Not given in the file
        assert_eq!(config.timeouts.probe_retries, 2);
        assert_eq!(config.profile, ClusterProfile::default());
        assert_eq!(config.tunnel.local_port, 6666);
        assert_eq!(config.discovery_url, DEFAULT_DISCOVERY_URL);
    }

    fn write_config(dir: &Utf8TempDir, contents: &str) -> Utf8PathBuf {
        let path = dir.path().join("config.toml");
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_invalid_configs() {
        let dir = Utf8TempDir::new().unwrap();

        let path = write_config(
            &dir,
            r#"
            cluster_name = "c"
            groups = []
            [log]
            mode = "stderr-terminal"
            level = "info"
            "#,
        );
        assert!(matches!(
            Config::from_file(&path),
            Err(ConfigError::Invalid { .. })
        ));

        let path = write_config(
            &dir,
            r#"
            cluster_name = "../escape"
            groups = [ { roles = ["nn"], count = 1 } ]
            [log]
            mode = "stderr-terminal"
            level = "info"
            "#,
        );
        assert!(matches!(
            Config::from_file(&path),
            Err(ConfigError::Invalid { .. })
        ));

        let path = write_config(&dir, "cluster_name = ");
        assert!(matches!(
            Config::from_file(&path),
            Err(ConfigError::Parse { .. })
        ));

        assert!(matches!(
            Config::from_file(dir.path().join("missing.toml")),
            Err(ConfigError::Io { .. })
        ));
    }
}
