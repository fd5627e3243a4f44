// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interfaces to the cloud provider consumed during a bring-up run
//!
//! The provider's instance-lifecycle and firewall APIs are external to this
//! crate.  [`crate::sim::SimCloud`] implements both in memory.

use crate::role::{InstanceGroupRequest, Role};
use async_trait::async_trait;
use oxnet::IpNet;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Opaque identifier assigned to an instance by the cloud provider
#[derive(
    Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize,
)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn new<S: Into<String>>(id: S) -> InstanceId {
        InstanceId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of an instance, as reported by the provider
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceState {
    Pending,
    Running,
    ShuttingDown,
    Terminated,
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstanceState::Pending => "pending",
            InstanceState::Running => "running",
            InstanceState::ShuttingDown => "shutting-down",
            InstanceState::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// An instance known to the provider
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Instance {
    pub id: InstanceId,
    pub roles: Vec<Role>,
    pub state: InstanceState,
    /// resolvable public name or address; only populated once the instance
    /// is running
    pub address: Option<String>,
}

impl Instance {
    pub fn is_running(&self) -> bool {
        self.state == InstanceState::Running
    }

    pub fn has_role(&self, role: &Role) -> bool {
        self.roles.contains(role)
    }
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("cloud provider request failed: {0}")]
    Api(String),
    #[error("cloud provider does not know instance {0}")]
    UnknownInstance(InstanceId),
}

/// The provider's instance-lifecycle API
#[async_trait]
pub trait InstanceApi: Send + Sync {
    /// Start `group.count` instances tagged with `group.roles`, passing
    /// `group.env` into each instance's environment.  Returns the identifiers
    /// of the instances the provider accepted, which may be fewer or more than
    /// requested.
    async fn launch(
        &self,
        group: &InstanceGroupRequest,
    ) -> Result<Vec<InstanceId>, ProviderError>;

    /// List instances tagged with `role` that are currently in `state`
    async fn list_by_role(
        &self,
        role: &Role,
        state: InstanceState,
    ) -> Result<Vec<Instance>, ProviderError>;

    /// Describe the given instances
    async fn describe(
        &self,
        ids: &[InstanceId],
    ) -> Result<Vec<Instance>, ProviderError>;
}

/// The provider's firewall API
#[async_trait]
pub trait FirewallApi: Send + Sync {
    /// Allow inbound TCP traffic on ports `port_from..=port_to` of every
    /// instance tagged with `role`, from `cidr`
    async fn authorize_role(
        &self,
        role: &Role,
        port_from: u16,
        port_to: u16,
        cidr: IpNet,
    ) -> Result<(), ProviderError>;
}
