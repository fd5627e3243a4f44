// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Simulated cloud provider
//!
//! [`SimCloud`] keeps instances and firewall rules in memory.  It backs the
//! test suite and the `simulate` subcommand of the CLI.

use crate::probe::StatusProbe;
use crate::provider::{
    FirewallApi, Instance, InstanceApi, InstanceId, InstanceState,
    ProviderError,
};
use crate::role::{InstanceGroupRequest, Role};
use async_trait::async_trait;
use oxnet::IpNet;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// One call to [`FirewallApi::authorize_role`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FirewallRule {
    pub role: Role,
    pub port_from: u16,
    pub port_to: u16,
    pub cidr: IpNet,
}

struct SimInstance {
    instance: Instance,
    /// address assigned once the instance is running
    address: String,
    /// `describe` calls remaining before the instance is running
    boot_polls_left: usize,
}

#[derive(Default)]
struct SimCloudInner {
    next_id: u64,
    instances: BTreeMap<InstanceId, SimInstance>,
    launches: Vec<InstanceGroupRequest>,
    launch_counts: BTreeMap<usize, usize>,
    pinned_addresses: BTreeMap<Role, String>,
    boot_polls: usize,
    firewall_rules: Vec<FirewallRule>,
}

#[derive(Default)]
pub struct SimCloud {
    inner: Mutex<SimCloudInner>,
}

impl SimCloud {
    pub fn new() -> SimCloud {
        SimCloud::default()
    }

    /// Make launched instances report "pending" for `polls` calls to
    /// `describe` before they report "running"
    pub fn set_boot_polls(&self, polls: usize) {
        self.inner.lock().unwrap().boot_polls = polls;
    }

    /// Make the `index`th call to `launch` (counting from zero) start `count`
    /// instances regardless of what was requested
    pub fn set_launch_count(&self, index: usize, count: usize) {
        self.inner.lock().unwrap().launch_counts.insert(index, count);
    }

    /// Give every instance launched with `role` the address `address`
    pub fn pin_address<S: Into<String>>(&self, role: &Role, address: S) {
        self.inner
            .lock()
            .unwrap()
            .pinned_addresses
            .insert(role.clone(), address.into());
    }

    /// Returns every group passed to `launch` so far, in order, including
    /// the environment each was launched with
    pub fn launches(&self) -> Vec<InstanceGroupRequest> {
        self.inner.lock().unwrap().launches.clone()
    }

    pub fn firewall_rules(&self) -> Vec<FirewallRule> {
        self.inner.lock().unwrap().firewall_rules.clone()
    }

    pub fn instances(&self) -> Vec<Instance> {
        self.inner
            .lock()
            .unwrap()
            .instances
            .values()
            .map(|i| i.instance.clone())
            .collect()
    }
}

#[async_trait]
impl InstanceApi for SimCloud {
    async fn launch(
        &self,
        group: &InstanceGroupRequest,
    ) -> Result<Vec<InstanceId>, ProviderError> {
        let mut inner = self.inner.lock().unwrap();
        let index = inner.launches.len();
        inner.launches.push(group.clone());
        let count =
            inner.launch_counts.get(&index).copied().unwrap_or(group.count);
        let pinned = group
            .roles
            .iter()
            .find_map(|r| inner.pinned_addresses.get(r))
            .cloned();

        let mut ids = Vec::with_capacity(count);
        for _ in 0..count {
            inner.next_id += 1;
            let n = inner.next_id;
            let id = InstanceId::new(format!("i-{:08x}", n));
            let address = pinned.clone().unwrap_or_else(|| {
                format!("10.0.{}.{}", (n >> 8) & 0xff, n & 0xff)
            });
            let boot_polls_left = inner.boot_polls;
            let running = boot_polls_left == 0;
            let instance = Instance {
                id: id.clone(),
                roles: group.roles.clone(),
                state: if running {
                    InstanceState::Running
                } else {
                    InstanceState::Pending
                },
                address: running.then(|| address.clone()),
            };
            inner.instances.insert(
                id.clone(),
                SimInstance { instance, address, boot_polls_left },
            );
            ids.push(id);
        }
        Ok(ids)
    }

    async fn list_by_role(
        &self,
        role: &Role,
        state: InstanceState,
    ) -> Result<Vec<Instance>, ProviderError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .instances
            .values()
            .map(|i| &i.instance)
            .filter(|i| i.has_role(role) && i.state == state)
            .cloned()
            .collect())
    }

    async fn describe(
        &self,
        ids: &[InstanceId],
    ) -> Result<Vec<Instance>, ProviderError> {
        let mut inner = self.inner.lock().unwrap();
        let mut found = Vec::with_capacity(ids.len());
        for id in ids {
            let sim = inner
                .instances
                .get_mut(id)
                .ok_or_else(|| ProviderError::UnknownInstance(id.clone()))?;
            if sim.boot_polls_left > 0 {
                sim.boot_polls_left -= 1;
                if sim.boot_polls_left == 0 {
                    sim.instance.state = InstanceState::Running;
                    sim.instance.address = Some(sim.address.clone());
                }
            }
            found.push(sim.instance.clone());
        }
        Ok(found)
    }
}

#[async_trait]
impl FirewallApi for SimCloud {
    async fn authorize_role(
        &self,
        role: &Role,
        port_from: u16,
        port_to: u16,
        cidr: IpNet,
    ) -> Result<(), ProviderError> {
        self.inner.lock().unwrap().firewall_rules.push(FirewallRule {
            role: role.clone(),
            port_from,
            port_to,
            cidr,
        });
        Ok(())
    }
}

/// [`StatusProbe`] answering from a [`SimCloud`]
///
/// A host answers once a running instance has its address, and reports
/// every running instance with the worker role as an active worker.
pub struct SimStatusProbe {
    cloud: Arc<SimCloud>,
    worker_role: Role,
}

impl SimStatusProbe {
    pub fn new(cloud: Arc<SimCloud>, worker_role: Role) -> SimStatusProbe {
        SimStatusProbe { cloud, worker_role }
    }
}

#[async_trait]
impl StatusProbe for SimStatusProbe {
    type Error = ProviderError;

    async fn check_responds(&self, host: &str) -> Result<(), ProviderError> {
        let up = self.cloud.instances().iter().any(|i| {
            i.is_running() && i.address.as_deref() == Some(host)
        });
        if up {
            Ok(())
        } else {
            Err(ProviderError::Api(format!("no running instance at {}", host)))
        }
    }

    async fn worker_count(&self, host: &str) -> Result<u32, ProviderError> {
        self.check_responds(host).await?;
        let workers = self
            .cloud
            .instances()
            .iter()
            .filter(|i| i.is_running() && i.has_role(&self.worker_role))
            .count();
        Ok(u32::try_from(workers).unwrap_or(u32::MAX))
    }
}
