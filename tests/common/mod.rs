// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared integration testing facilities

#![allow(dead_code)]

use async_trait::async_trait;
use camino::Utf8Path;
use cluster_launch::Config;
use cluster_launch::access::{AccessError, AddressDiscovery, HostResolver};
use cluster_launch::probe::StatusProbe;
use dropshot::test_util::LogContext;
use dropshot::{ConfigLogging, ConfigLoggingIfExists, ConfigLoggingLevel};
use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

pub const CONTROL_PLANE_ADDR: &str = "192.0.2.10";
pub const COORDINATOR_ADDR: &str = "192.0.2.20";
pub const CLIENT_ADDR: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 7);

pub fn test_setup_log(test_name: &str) -> LogContext {
    let log_config = ConfigLogging::File {
        level: ConfigLoggingLevel::Trace,
        path: "UNUSED".into(),
        if_exists: ConfigLoggingIfExists::Fail,
    };
    LogContext::new(test_name, &log_config)
}

/// Load the configuration the test suite runs with
pub fn test_config() -> Config {
    let path = Utf8Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/config.test.toml");
    Config::from_file(&path).expect("failed to load config.test.toml")
}

/// Status page fragment reporting `count` active workers
pub fn status_page(count: u32) -> String {
    format!(
        "<html><body><h2>Cluster Summary</h2>\n\
         <table><tr><th>Nodes</th></tr>\n\
         <tr><td><a href=\"machines.jsp?type=active\">{}</a></td></tr>\n\
         </table></body></html>\n",
        count
    )
}

/// Discovery that always finds the same address
#[derive(Default)]
pub struct FixedDiscovery {
    pub calls: AtomicUsize,
}

#[async_trait]
impl AddressDiscovery for FixedDiscovery {
    async fn public_address(&self) -> Result<IpAddr, AccessError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(IpAddr::V4(CLIENT_ADDR))
    }
}

/// Resolver for tests whose instance addresses are all IP literals
pub struct NoResolver;

#[async_trait]
impl HostResolver for NoResolver {
    async fn lookup(&self, host: &str) -> Result<IpAddr, AccessError> {
        Err(AccessError::NoAddresses { host: host.to_string() })
    }
}

#[derive(Debug, thiserror::Error)]
#[error("connection refused")]
pub struct Refused;

/// Status probe that reports worker counts from a script
///
/// The status endpoint answers after `refusals` failed checks.  Each worker
/// count probe takes the next scripted count; the last one repeats.
pub struct ScriptedProbe {
    refusals: AtomicUsize,
    counts: Mutex<VecDeque<u32>>,
    pub check_calls: AtomicUsize,
    pub count_calls: AtomicUsize,
}

impl ScriptedProbe {
    pub fn new(refusals: usize, counts: &[u32]) -> ScriptedProbe {
        ScriptedProbe {
            refusals: AtomicUsize::new(refusals),
            counts: Mutex::new(counts.iter().copied().collect()),
            check_calls: AtomicUsize::new(0),
            count_calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl StatusProbe for ScriptedProbe {
    type Error = Refused;

    async fn check_responds(&self, _host: &str) -> Result<(), Refused> {
        self.check_calls.fetch_add(1, Ordering::SeqCst);
        let left = self.refusals.load(Ordering::SeqCst);
        if left == 0 {
            return Ok(());
        }
        self.refusals.store(left - 1, Ordering::SeqCst);
        Err(Refused)
    }

    async fn worker_count(&self, _host: &str) -> Result<u32, Refused> {
        self.count_calls.fetch_add(1, Ordering::SeqCst);
        let mut counts = self.counts.lock().unwrap();
        let count = if counts.len() > 1 {
            counts.pop_front()
        } else {
            counts.front().copied()
        };
        count.ok_or(Refused)
    }
}
