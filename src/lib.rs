// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bring-up of a Hadoop-style cluster on rented instances
//!
//! A bring-up launches role-tagged instance groups in order, hands the
//! addresses of singleton roles to the groups launched after them, opens the
//! firewall to the client, and waits for the cluster's services to report
//! ready.  A separate entry point opens a SOCKS tunnel to the control plane.
//!
//! The cloud provider is reached only through the traits in [`provider`];
//! [`sim::SimCloud`] is an in-memory implementation of them.

pub mod access;
pub mod bringup;
pub mod config;
pub mod launch;
pub mod poll;
pub mod probe;
pub mod provider;
pub mod readiness;
pub mod registry;
pub mod role;
pub mod sim;
pub mod site_file;
pub mod tunnel;

pub use bringup::{BringUpError, BringUpOutcome, ClusterBringUp};
pub use config::Config;
pub use launch::BringUpRun;
pub use readiness::Readiness;
pub use role::{InstanceGroupRequest, Role};
