// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Waiting for a launched cluster's services to come up
//!
//! Readiness is established in two phases that share one deadline:
//!
//! 1. the status service answers at all, then
//! 2. (only if workers were requested) the number of active workers it
//!    reports reaches the number requested.

use crate::poll::{self, CondCheckError};
use crate::probe::StatusProbe;
use slog::{Logger, debug, info, warn};
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// The readiness phase that was still in progress when a wait timed out
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadinessPhase {
    StatusEndpoint,
    Workers,
}

impl fmt::Display for ReadinessPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadinessPhase::StatusEndpoint => {
                f.write_str("waiting for the status endpoint")
            }
            ReadinessPhase::Workers => f.write_str("waiting for workers"),
        }
    }
}

/// How a readiness wait ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Readiness {
    /// there's no control-plane instance, so there was nothing to wait for
    NoControlPlane,
    /// the cluster is up; `workers` is the last worker count observed (zero
    /// if workers were never polled)
    Ready { workers: u32 },
    /// the deadline passed first.  Nothing is torn down; the operator has to
    /// inspect the cluster.
    TimedOut { phase: ReadinessPhase, last_observed: Option<u32> },
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        !matches!(self, Readiness::TimedOut { .. })
    }
}

pub struct ReadinessOrchestrator<'a, P> {
    probe: &'a P,
    poll_interval: Duration,
    timeout: Duration,
    log: Logger,
}

impl<'a, P: StatusProbe> ReadinessOrchestrator<'a, P> {
    pub fn new(
        probe: &'a P,
        poll_interval: Duration,
        timeout: Duration,
        log: &Logger,
    ) -> ReadinessOrchestrator<'a, P> {
        ReadinessOrchestrator {
            probe,
            poll_interval,
            timeout,
            log: log.new(slog::o!("component" => "ReadinessOrchestrator")),
        }
    }

    /// Wait for the status service on `address` to answer and for at least
    /// `expected_workers` workers to report in
    pub async fn await_cluster_ready(
        &self,
        address: Option<&str>,
        expected_workers: u32,
    ) -> Readiness {
        let Some(address) = address else {
            info!(self.log, "no control plane instance; nothing to wait for");
            return Readiness::NoControlPlane;
        };

        let start = Instant::now();
        info!(self.log, "waiting for status endpoint"; "address" => address);
        let responded = poll::wait_for_condition_until(
            || async {
                self.probe.check_responds(address).await.map_err(|e| {
                    debug!(
                        self.log,
                        "status endpoint not answering yet";
                        "error" => %e,
                    );
                    CondCheckError::Transient(e)
                })
            },
            start,
            &self.poll_interval,
            &self.timeout,
        )
        .await;
        // The probe's errors are all transient, so a timeout is the only way
        // for the wait to fail.
        if responded.is_err() {
            warn!(
                self.log,
                "status endpoint did not answer in time";
                "address" => address,
                "timeout" => ?self.timeout,
            );
            return Readiness::TimedOut {
                phase: ReadinessPhase::StatusEndpoint,
                last_observed: None,
            };
        }

        if expected_workers == 0 {
            return Readiness::Ready { workers: 0 };
        }

        info!(
            self.log,
            "waiting for workers";
            "address" => address,
            "expected" => expected_workers,
        );
        let last_observed = Mutex::new(None);
        let result = poll::wait_for_condition_until(
            || async {
                let count = match self.probe.worker_count(address).await {
                    Ok(count) => count,
                    Err(e) => {
                        debug!(
                            self.log,
                            "failed to probe worker count";
                            "error" => %e,
                        );
                        return Err(CondCheckError::Transient(e));
                    }
                };
                *last_observed.lock().unwrap() = Some(count);
                if count >= expected_workers {
                    Ok(count)
                } else {
                    debug!(
                        self.log,
                        "waiting for more workers";
                        "running" => count,
                        "expected" => expected_workers,
                    );
                    Err(CondCheckError::NotYet)
                }
            },
            start,
            &self.poll_interval,
            &self.timeout,
        )
        .await;

        match result {
            Ok(workers) => {
                info!(self.log, "cluster is ready"; "workers" => workers);
                Readiness::Ready { workers }
            }
            Err(_) => {
                let last_observed = *last_observed.lock().unwrap();
                warn!(
                    self.log,
                    "workers did not start in time";
                    "expected" => expected_workers,
                    "last_observed" => ?last_observed,
                );
                Readiness::TimedOut {
                    phase: ReadinessPhase::Workers,
                    last_observed,
                }
            }
        }
    }
}
