// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Queries about which instances currently fill which roles
//!
//! The registry is the bring-up engine's only view of real-world instance
//! state.  It never caches: every call goes back to the provider.

use crate::poll::{self, CondCheckError};
use crate::provider::{
    Instance, InstanceApi, InstanceId, InstanceState, ProviderError,
};
use crate::role::Role;
use slog::{Logger, debug};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

pub struct RoleRegistry {
    api: Arc<dyn InstanceApi>,
    log: Logger,
}

impl RoleRegistry {
    pub fn new(api: Arc<dyn InstanceApi>, log: &Logger) -> RoleRegistry {
        RoleRegistry {
            api,
            log: log.new(slog::o!("component" => "RoleRegistry")),
        }
    }

    pub fn api(&self) -> &Arc<dyn InstanceApi> {
        &self.api
    }

    pub async fn instances_in_role(
        &self,
        role: &Role,
        state: InstanceState,
    ) -> Result<Vec<Instance>, ProviderError> {
        self.api.list_by_role(role, state).await
    }

    /// Returns the first running instance with `role`, if any
    ///
    /// This is how singleton roles (the control plane, the worker
    /// coordinator) are located after launch.
    pub async fn running_singleton(
        &self,
        role: &Role,
    ) -> Result<Option<Instance>, ProviderError> {
        Ok(self
            .instances_in_role(role, InstanceState::Running)
            .await?
            .into_iter()
            .next())
    }

    /// Returns the running instances having any of `roles`, each listed once
    pub async fn running_in_roles(
        &self,
        roles: &[Role],
    ) -> Result<Vec<Instance>, ProviderError> {
        let mut seen = BTreeSet::new();
        let mut instances = Vec::new();
        for role in roles {
            for instance in
                self.instances_in_role(role, InstanceState::Running).await?
            {
                if seen.insert(instance.id.clone()) {
                    instances.push(instance);
                }
            }
        }
        Ok(instances)
    }

    /// Wait until every instance in `ids` reports the running state
    ///
    /// Provider errors while describing the instances are treated as
    /// transient: freshly launched instances are not always visible right
    /// away.
    pub async fn wait_until_running(
        &self,
        ids: &[InstanceId],
        poll_interval: &Duration,
        poll_max: &Duration,
    ) -> Result<Vec<Instance>, poll::Error<ProviderError>> {
        poll::wait_for_condition::<_, ProviderError, _, _>(
            || async {
                let instances = self
                    .api
                    .describe(ids)
                    .await
                    .map_err(CondCheckError::Transient)?;
                let running =
                    instances.iter().filter(|i| i.is_running()).count();
                debug!(
                    self.log,
                    "checked instance states";
                    "running" => running,
                    "expected" => ids.len(),
                );
                if running == ids.len() && instances.len() == ids.len() {
                    Ok(instances)
                } else {
                    Err(CondCheckError::NotYet)
                }
            },
            poll_interval,
            poll_max,
        )
        .await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::role::InstanceGroupRequest;
    use crate::sim::SimCloud;
    use crate::test_util::test_setup_log;

    #[tokio::test]
    async fn test_running_lookups() {
        let logctx = test_setup_log("test_running_lookups");
        let cloud = Arc::new(SimCloud::new());
        let registry = RoleRegistry::new(cloud.clone(), &logctx.log);
        let nn = Role::from("nn");
        let dn = Role::from("dn");
        assert_eq!(registry.running_singleton(&nn).await.unwrap(), None);

        cloud
            .launch(&InstanceGroupRequest::new(["nn", "dn"], 1))
            .await
            .unwrap();
        cloud
            .launch(&InstanceGroupRequest::new(["dn", "tt"], 3))
            .await
            .unwrap();

        let singleton = registry.running_singleton(&nn).await.unwrap();
        assert!(singleton.expect("no control plane").has_role(&dn));
        // The instance carrying both roles is listed once.
        let listed =
            registry.running_in_roles(&[nn.clone(), dn.clone()]).await.unwrap();
        assert_eq!(listed.len(), 4);
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_wait_until_running() {
        let logctx = test_setup_log("test_wait_until_running");
        let cloud = Arc::new(SimCloud::new());
        cloud.set_boot_polls(2);
        let registry = RoleRegistry::new(cloud.clone(), &logctx.log);
        let ids = cloud
            .launch(&InstanceGroupRequest::new(["dn"], 3))
            .await
            .unwrap();

        let instances = registry
            .wait_until_running(
                &ids,
                &Duration::from_millis(1),
                &Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(instances.len(), 3);
        assert!(instances.iter().all(|i| i.is_running()));

        // Unknown instances are retried until the deadline.
        let result = registry
            .wait_until_running(
                &[InstanceId::new("i-missing")],
                &Duration::from_millis(1),
                &Duration::from_millis(20),
            )
            .await;
        assert!(matches!(result, Err(poll::Error::TimedOut(_))));
        logctx.cleanup_successful();
    }
}
