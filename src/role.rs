// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Roles and the groups of instances requested for them

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Tag identifying an instance's function within the cluster (e.g., "nn" for
/// the control plane, "tt" for a worker)
#[derive(
    Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize,
)]
#[serde(transparent)]
pub struct Role(String);

impl Role {
    pub fn new<S: Into<String>>(name: S) -> Role {
        Role(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of the environment binding that carries this role's address when
    /// the role is a singleton, e.g. `TASK_TRACKER_HOST` for "task+tracker".
    pub fn binding_name(&self) -> String {
        format!("{}_HOST", sanitize_role_name(&self.0))
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Role {
    fn from(s: &str) -> Role {
        Role::new(s)
    }
}

/// Convert a role name into a token usable as a shell variable name.
///
/// Every character outside `[A-Za-z0-9]` becomes `_` and the result is
/// uppercased.
pub fn sanitize_role_name(role: &str) -> String {
    role.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' }
        })
        .collect()
}

/// How the instances of a group behave during launch
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoleKind {
    /// exactly one instance is expected; its address is propagated to groups
    /// launched after it
    Singleton,
    /// any number of interchangeable instances
    Replicated,
}

/// A requested set of instances sharing one or more role tags
///
/// Created by the caller before a bring-up run and not modified during it.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct InstanceGroupRequest {
    pub roles: Vec<Role>,
    pub count: usize,
    /// extra bindings injected into each instance's environment
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl InstanceGroupRequest {
    pub fn new<I, R>(roles: I, count: usize) -> InstanceGroupRequest
    where
        I: IntoIterator<Item = R>,
        R: Into<Role>,
    {
        InstanceGroupRequest {
            roles: roles.into_iter().map(Into::into).collect(),
            count,
            env: BTreeMap::new(),
        }
    }

    pub fn with_env<K: Into<String>, V: Into<String>>(
        mut self,
        key: K,
        value: V,
    ) -> InstanceGroupRequest {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn kind(&self) -> RoleKind {
        if self.count == 1 { RoleKind::Singleton } else { RoleKind::Replicated }
    }

    pub fn has_role(&self, role: &Role) -> bool {
        self.roles.contains(role)
    }

    /// Human-readable label for log messages and errors, e.g. "nn+snn"
    pub fn label(&self) -> String {
        self.roles
            .iter()
            .map(Role::as_str)
            .collect::<Vec<_>>()
            .join("+")
    }
}
