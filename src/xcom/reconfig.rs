// Copyright 2021 The xcom Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use log::info;

use crate::constant::*;
use crate::error::RejectReason;
use crate::site_def::SiteDef;
use crate::synode::Synode;
use crate::types::{Cargo, NodeAddress, NodeSet};

/// The start of a configuration decided at `at`. Every slot which might be
/// in flight when `at` is executed lies below `at + event_horizon`, so the
/// new configuration can't change the rules for any of them.
#[inline(always)]
pub fn config_start(at: &Synode, event_horizon: u32) -> Synode {
    at.ahead(event_horizon as u64 + 1)
}

fn all_speak(site: &SiteDef, protocol: u32) -> bool {
    site.nodes.iter().all(|n| n.protocol >= protocol)
}

fn check_members(site: &SiteDef, nodes: &[NodeAddress]) -> Result<(), RejectReason> {
    if nodes.is_empty() {
        return Err(RejectReason::EmptyNodeList);
    }
    if nodes.iter().any(|n| !site.is_member(n)) {
        return Err(RejectReason::NotMember);
    }
    Ok(())
}

/// Validates a reconfiguration request against the configuration it will be
/// applied on. The same check runs when the request is proposed and when it
/// is executed, so a request which became invalid in between is ignored by
/// every node alike.
pub fn validate(site: &SiteDef, cargo: &Cargo) -> Result<(), RejectReason> {
    match cargo {
        Cargo::App(_) | Cargo::View(_) => Err(RejectReason::NotConfig),
        Cargo::AddNode(nodes) => {
            if nodes.is_empty() {
                return Err(RejectReason::EmptyNodeList);
            }
            for (i, node) in nodes.iter().enumerate() {
                if site.is_member(node) {
                    return Err(RejectReason::AlreadyMember);
                }
                if nodes[..i].iter().any(|n| n.same_node(node)) {
                    return Err(RejectReason::DuplicateNode);
                }
                if site.event_horizon != EVENT_HORIZON_DEFAULT
                    && node.protocol < PROTOCOL_EVENT_HORIZON
                {
                    return Err(RejectReason::IncompatibleEventHorizon);
                }
                if site.max_active_leaders != ACTIVE_LEADERS_ALL
                    && node.protocol < PROTOCOL_SINGLE_LEADER
                {
                    return Err(RejectReason::IncompatibleLeaders);
                }
            }
            Ok(())
        }
        Cargo::RemoveNode(nodes) => {
            check_members(site, nodes)?;
            let remains = site
                .nodes
                .iter()
                .filter(|n| !nodes.iter().any(|r| r.same_node(n)))
                .count();
            if remains == 0 {
                return Err(RejectReason::EmptyConfig);
            }
            Ok(())
        }
        Cargo::SetEventHorizon(eh) => {
            if *eh < EVENT_HORIZON_MIN || *eh > EVENT_HORIZON_MAX {
                return Err(RejectReason::EventHorizonOutOfRange);
            }
            if !all_speak(site, PROTOCOL_EVENT_HORIZON) {
                return Err(RejectReason::IncompatibleEventHorizon);
            }
            Ok(())
        }
        Cargo::SetLeaders(nodes) => {
            check_members(site, nodes)?;
            if !all_speak(site, PROTOCOL_SINGLE_LEADER) {
                return Err(RejectReason::IncompatibleLeaders);
            }
            Ok(())
        }
        Cargo::SetMaxLeaders(max) => {
            if *max > site.max_nodes() {
                return Err(RejectReason::TooManyLeaders);
            }
            if !all_speak(site, PROTOCOL_SINGLE_LEADER) {
                return Err(RejectReason::IncompatibleLeaders);
            }
            Ok(())
        }
        Cargo::ForceConfig(nodes) => check_members(site, nodes),
    }
}

/// A forced configuration is only proposed if every forced node is believed
/// alive, otherwise it could never gather its acks.
pub fn validate_force<F>(site: &SiteDef, nodes: &[NodeAddress], is_alive: F) -> Result<(), RejectReason>
where
    F: Fn(&NodeAddress) -> bool,
{
    check_members(site, nodes)?;
    if nodes.iter().any(|n| !is_alive(n)) {
        return Err(RejectReason::SuspectedDead);
    }
    Ok(())
}

/// Builds the configuration resulting from executing `cargo` at synode `at`.
///
/// `base` is the latest installed configuration, the new one is cloned from
/// it. `event_horizon` is the event horizon of the configuration governing
/// `at`, it determines the start of the new configuration.
pub fn next_config(
    base: &SiteDef,
    cargo: &Cargo,
    at: Synode,
    event_horizon: u32,
) -> Result<SiteDef, RejectReason> {
    if !cargo.is_view() {
        validate(base, cargo)?;
    }

    let mut site = base.clone();
    site.start = std::cmp::max(config_start(&at, event_horizon), base.start.next_sequence())
        .with_node(0);
    site.boot_key = at;
    site.forced = false;

    let mut membership_changed = false;
    match cargo {
        Cargo::App(_) => return Err(RejectReason::NotConfig),
        Cargo::AddNode(nodes) => {
            site.nodes.extend(nodes.iter().cloned());
            membership_changed = true;
        }
        Cargo::RemoveNode(nodes) => {
            site.nodes.retain(|n| !nodes.iter().any(|r| r.same_node(n)));
            membership_changed = true;
        }
        Cargo::ForceConfig(nodes) => {
            site.nodes.retain(|n| nodes.iter().any(|f| f.same_node(n)));
            site.forced = true;
            membership_changed = true;
        }
        Cargo::SetEventHorizon(eh) => site.event_horizon = *eh,
        Cargo::SetLeaders(nodes) => site.leaders = nodes.clone(),
        Cargo::SetMaxLeaders(max) => site.max_active_leaders = *max,
        Cargo::View(set) => {
            let mut set = set.clone();
            set.resize(site.max_nodes());
            site.global_node_set = set;
        }
    }

    if membership_changed {
        let nodes = site.nodes.clone();
        site.leaders.retain(|l| nodes.iter().any(|n| n.same_node(l)));
        site.global_node_set = NodeSet::full(site.max_nodes());
        site.max_active_leaders = std::cmp::min(site.max_active_leaders, site.max_nodes());
    }
    site.analyze_leaders();

    info!(
        "synode {} builds config start {} with {} nodes, event horizon {}, max leaders {}",
        at,
        site.start,
        site.max_nodes(),
        site.event_horizon,
        site.max_active_leaders
    );
    Ok(site)
}
