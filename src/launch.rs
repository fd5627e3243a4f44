// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Ordered launch of instance groups
//!
//! Groups are launched strictly in the order the caller listed them.  When a
//! singleton group finishes launching, its address is turned into one
//! [`SingletonBinding`] per role, and those bindings are added to the
//! environment of every group launched after it.

use crate::poll;
use crate::provider::{Instance, InstanceId, ProviderError};
use crate::registry::RoleRegistry;
use crate::role::{InstanceGroupRequest, Role, RoleKind};
use slog::{Logger, debug, error, info, warn};
use std::time::Duration;
use thiserror::Error;

/// A `<ROLE>_HOST=<address>` binding derived from a running singleton
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SingletonBinding {
    pub role: Role,
    pub name: String,
    pub value: String,
}

impl SingletonBinding {
    pub fn new(role: &Role, address: &str) -> SingletonBinding {
        SingletonBinding {
            role: role.clone(),
            name: role.binding_name(),
            value: address.to_string(),
        }
    }
}

/// Derive the bindings published by a singleton group whose instance is
/// reachable at `address`
pub fn propagate_singleton(
    roles: &[Role],
    address: &str,
) -> Vec<SingletonBinding> {
    roles.iter().map(|role| SingletonBinding::new(role, address)).collect()
}

/// Launched-instance total that didn't match the requested total
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InstanceCountDiscrepancy {
    pub launched: usize,
    pub requested: usize,
}

/// State of one bring-up attempt
///
/// Owned by whoever drives the run; only [`LaunchSequencer::run`] adds to it.
#[derive(Clone, Debug)]
pub struct BringUpRun {
    groups: Vec<InstanceGroupRequest>,
    launched: Vec<InstanceId>,
    bindings: Vec<SingletonBinding>,
    singletons: Vec<Instance>,
}

impl BringUpRun {
    pub fn new(groups: Vec<InstanceGroupRequest>) -> BringUpRun {
        BringUpRun {
            groups,
            launched: Vec::new(),
            bindings: Vec::new(),
            singletons: Vec::new(),
        }
    }

    pub fn groups(&self) -> &[InstanceGroupRequest] {
        &self.groups
    }

    /// Identifiers of every instance launched so far, in launch order
    pub fn launched(&self) -> &[InstanceId] {
        &self.launched
    }

    pub fn bindings(&self) -> &[SingletonBinding] {
        &self.bindings
    }

    /// Running instances of the singleton groups launched so far
    pub fn singletons(&self) -> &[Instance] {
        &self.singletons
    }

    pub fn requested_count(&self) -> usize {
        self.groups.iter().map(|g| g.count).sum()
    }

    /// Total requested instances of groups carrying `role`
    pub fn requested_in_role(&self, role: &Role) -> usize {
        self.groups.iter().filter(|g| g.has_role(role)).map(|g| g.count).sum()
    }

    pub fn discrepancy(&self) -> Option<InstanceCountDiscrepancy> {
        let launched = self.launched.len();
        let requested = self.requested_count();
        (launched != requested)
            .then_some(InstanceCountDiscrepancy { launched, requested })
    }
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error(
        "expected {expected} '{roles}' instance, but the provider \
         launched {actual}"
    )]
    SingletonCountMismatch { roles: String, expected: usize, actual: usize },

    #[error("failed to launch '{roles}' instances")]
    Launch {
        roles: String,
        #[source]
        err: ProviderError,
    },

    #[error("'{roles}' instance {id} did not start running")]
    SingletonNotRunning {
        roles: String,
        id: InstanceId,
        #[source]
        err: poll::Error<ProviderError>,
    },

    #[error("running '{roles}' instance {id} has no address")]
    SingletonNoAddress { roles: String, id: InstanceId },
}

pub struct LaunchSequencer<'a> {
    registry: &'a RoleRegistry,
    poll_interval: Duration,
    singleton_timeout: Duration,
    log: Logger,
}

impl<'a> LaunchSequencer<'a> {
    pub fn new(
        registry: &'a RoleRegistry,
        poll_interval: Duration,
        singleton_timeout: Duration,
        log: &Logger,
    ) -> LaunchSequencer<'a> {
        LaunchSequencer {
            registry,
            poll_interval,
            singleton_timeout,
            log: log.new(slog::o!("component" => "LaunchSequencer")),
        }
    }

    /// Launch every group of `run`, in order
    ///
    /// A singleton group that doesn't come back with exactly one instance
    /// ends the run: no later group is launched.  Identifiers of everything
    /// launched before the failure remain recorded in `run`.
    pub async fn run(&self, run: &mut BringUpRun) -> Result<(), LaunchError> {
        for index in 0..run.groups.len() {
            let mut group = run.groups[index].clone();
            for binding in &run.bindings {
                group
                    .env
                    .entry(binding.name.clone())
                    .or_insert_with(|| binding.value.clone());
            }

            let roles = group.label();
            info!(
                self.log,
                "launching instances";
                "roles" => &roles,
                "count" => group.count,
            );
            debug!(
                self.log,
                "instance environment";
                "roles" => &roles,
                "env" => ?group.env,
            );

            let ids = self
                .registry
                .api()
                .launch(&group)
                .await
                .map_err(|err| LaunchError::Launch {
                    roles: roles.clone(),
                    err,
                })?;

            if group.kind() == RoleKind::Singleton {
                let actual = ids.len();
                run.launched.extend(ids.iter().cloned());
                if actual != 1 {
                    error!(
                        self.log,
                        "singleton group did not launch exactly one instance";
                        "roles" => &roles,
                        "actual" => actual,
                    );
                    return Err(LaunchError::SingletonCountMismatch {
                        roles,
                        expected: 1,
                        actual,
                    });
                }
                let instance = self.confirm_singleton(&roles, &ids[0]).await?;
                let address = instance.address.as_deref().ok_or_else(|| {
                    LaunchError::SingletonNoAddress {
                        roles: roles.clone(),
                        id: instance.id.clone(),
                    }
                })?;
                let bindings = propagate_singleton(&group.roles, address);
                info!(
                    self.log,
                    "singleton running";
                    "roles" => &roles,
                    "instance" => %instance.id,
                    "address" => address,
                );
                run.bindings.extend(bindings);
                run.singletons.push(instance);
            } else {
                run.launched.extend(ids);
            }
        }

        if let Some(InstanceCountDiscrepancy { launched, requested }) =
            run.discrepancy()
        {
            warn!(
                self.log,
                "number of launched instances does not match the number \
                 requested";
                "launched" => launched,
                "requested" => requested,
            );
        }

        Ok(())
    }

    async fn confirm_singleton(
        &self,
        roles: &str,
        id: &InstanceId,
    ) -> Result<Instance, LaunchError> {
        let not_running = |err| LaunchError::SingletonNotRunning {
            roles: roles.to_string(),
            id: id.clone(),
            err,
        };
        let instances = self
            .registry
            .wait_until_running(
                std::slice::from_ref(id),
                &self.poll_interval,
                &self.singleton_timeout,
            )
            .await
            .map_err(not_running)?;
        instances.into_iter().find(|i| &i.id == id).ok_or_else(|| {
            not_running(poll::Error::PermanentError(
                ProviderError::UnknownInstance(id.clone()),
            ))
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sim::SimCloud;
    use crate::test_util::test_setup_log;
    use std::sync::Arc;

    fn groups() -> Vec<InstanceGroupRequest> {
        vec![
            InstanceGroupRequest::new(["nn", "snn"], 1),
            InstanceGroupRequest::new(["jt"], 1),
            InstanceGroupRequest::new(["dn", "tt"], 5)
                .with_env("JAVA_OPTS", "-Xmx1g"),
        ]
    }

    #[tokio::test]
    async fn test_bindings_flow_to_later_groups() {
        let logctx = test_setup_log("test_bindings_flow_to_later_groups");
        let cloud = Arc::new(SimCloud::new());
        cloud.pin_address(&Role::from("nn"), "nn.example.com");
        cloud.pin_address(&Role::from("jt"), "jt.example.com");
        let registry = RoleRegistry::new(cloud.clone(), &logctx.log);
        let sequencer = LaunchSequencer::new(
            &registry,
            Duration::from_millis(10),
            Duration::from_secs(5),
            &logctx.log,
        );

        let mut run = BringUpRun::new(groups());
        sequencer.run(&mut run).await.expect("launch failed");

        assert_eq!(run.launched().len(), 7);
        assert_eq!(run.discrepancy(), None);
        assert_eq!(
            run.bindings()
                .iter()
                .map(|b| (b.name.as_str(), b.value.as_str()))
                .collect::<Vec<_>>(),
            vec![
                ("NN_HOST", "nn.example.com"),
                ("SNN_HOST", "nn.example.com"),
                ("JT_HOST", "jt.example.com"),
            ]
        );

        let launches = cloud.launches();
        assert_eq!(launches.len(), 3);
        // Nothing is known before the first group.
        assert!(launches[0].env.is_empty());
        // The second group sees the first group's bindings only.
        assert_eq!(
            launches[1].env.keys().map(String::as_str).collect::<Vec<_>>(),
            vec!["NN_HOST", "SNN_HOST"]
        );
        // The third group sees both, plus its own.
        assert_eq!(launches[2].env["NN_HOST"], "nn.example.com");
        assert_eq!(launches[2].env["JT_HOST"], "jt.example.com");
        assert_eq!(launches[2].env["JAVA_OPTS"], "-Xmx1g");

        assert_eq!(run.singletons().len(), 2);
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_singleton_count_mismatch_stops_launch() {
        let logctx =
            test_setup_log("test_singleton_count_mismatch_stops_launch");
        for returned in [0, 2] {
            let cloud = Arc::new(SimCloud::new());
            // The second group is the "jt" singleton.
            cloud.set_launch_count(1, returned);
            let registry = RoleRegistry::new(cloud.clone(), &logctx.log);
            let sequencer = LaunchSequencer::new(
                &registry,
                Duration::from_millis(10),
                Duration::from_secs(5),
                &logctx.log,
            );

            let mut run = BringUpRun::new(groups());
            let err = sequencer.run(&mut run).await.unwrap_err();
            match err {
                LaunchError::SingletonCountMismatch {
                    roles,
                    expected,
                    actual,
                } => {
                    assert_eq!(roles, "jt");
                    assert_eq!(expected, 1);
                    assert_eq!(actual, returned);
                }
                other => panic!("unexpected error: {}", other),
            }

            // The worker group was never launched.
            assert_eq!(cloud.launches().len(), 2);
            assert_eq!(run.launched().len(), 1 + returned);
            assert_eq!(run.bindings().len(), 2);
        }
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_singleton_waits_for_running() {
        let logctx = test_setup_log("test_singleton_waits_for_running");
        let cloud = Arc::new(SimCloud::new());
        cloud.set_boot_polls(3);
        let registry = RoleRegistry::new(cloud.clone(), &logctx.log);
        let sequencer = LaunchSequencer::new(
            &registry,
            Duration::from_millis(1),
            Duration::from_secs(5),
            &logctx.log,
        );

        let mut run =
            BringUpRun::new(vec![InstanceGroupRequest::new(["nn"], 1)]);
        sequencer.run(&mut run).await.expect("launch failed");
        assert_eq!(run.singletons().len(), 1);
        assert!(run.singletons()[0].is_running());
        assert_eq!(run.bindings()[0].name, "NN_HOST");
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_singleton_never_running() {
        let logctx = test_setup_log("test_singleton_never_running");
        let cloud = Arc::new(SimCloud::new());
        cloud.set_boot_polls(usize::MAX);
        let registry = RoleRegistry::new(cloud.clone(), &logctx.log);
        let sequencer = LaunchSequencer::new(
            &registry,
            Duration::from_millis(1),
            Duration::from_millis(20),
            &logctx.log,
        );

        let mut run = BringUpRun::new(groups());
        let err = sequencer.run(&mut run).await.unwrap_err();
        assert!(matches!(
            err,
            LaunchError::SingletonNotRunning {
                err: poll::Error::TimedOut(_),
                ..
            }
        ));
        assert_eq!(cloud.launches().len(), 1);
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_discrepancy_is_not_fatal() {
        let logctx = test_setup_log("test_discrepancy_is_not_fatal");
        let cloud = Arc::new(SimCloud::new());
        // The worker group comes back short.
        cloud.set_launch_count(2, 3);
        let registry = RoleRegistry::new(cloud.clone(), &logctx.log);
        let sequencer = LaunchSequencer::new(
            &registry,
            Duration::from_millis(10),
            Duration::from_secs(5),
            &logctx.log,
        );

        let mut run = BringUpRun::new(groups());
        sequencer.run(&mut run).await.expect("launch failed");
        assert_eq!(
            run.discrepancy(),
            Some(InstanceCountDiscrepancy { launched: 5, requested: 7 })
        );
        logctx.cleanup_successful();
    }

    #[test]
    fn test_requested_in_role() {
        let run = BringUpRun::new(groups());
        assert_eq!(run.requested_count(), 7);
        assert_eq!(run.requested_in_role(&Role::from("tt")), 5);
        assert_eq!(run.requested_in_role(&Role::from("nn")), 1);
        assert_eq!(run.requested_in_role(&Role::from("missing")), 0);
    }
}
