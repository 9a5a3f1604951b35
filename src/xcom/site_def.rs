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

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::constant::*;
use crate::synode::{NodeNo, Synode};
use crate::types::{NodeAddress, NodeSet};

/// A configuration of the group. It governs every synode from `start` until
/// the `start` of the next configuration.
///
/// SiteDefs are immutable once installed, an update builds a new SiteDef and
/// installs it into `SiteDefs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteDef {
    pub start: Synode,

    /// The synode at which the reconfiguration creating this SiteDef was
    /// executed, null for a booted group.
    pub boot_key: Synode,
    pub event_horizon: u32,
    pub nodes: Vec<NodeAddress>,
    pub max_active_leaders: u32,

    /// The preferred leaders, in order of preference.
    pub leaders: Vec<NodeAddress>,
    pub active_leaders: NodeSet,

    /// The agreed liveness of the members, installed by views.
    pub global_node_set: NodeSet,

    /// Installed by a forced reconfiguration.
    pub forced: bool,
}

impl SiteDef {
    /// Builds the configuration of a freshly booted group.
    pub fn boot(start: Synode, nodes: Vec<NodeAddress>, event_horizon: u32) -> SiteDef {
        let size = nodes.len() as u32;
        let mut site = SiteDef {
            start,
            boot_key: Synode::NULL,
            event_horizon,
            nodes,
            max_active_leaders: ACTIVE_LEADERS_ALL,
            leaders: Vec::new(),
            active_leaders: NodeSet::new(size),
            global_node_set: NodeSet::full(size),
            forced: false,
        };
        site.analyze_leaders();
        site
    }

    pub fn max_nodes(&self) -> u32 {
        self.nodes.len() as u32
    }

    pub fn nodeno(&self, node: &NodeAddress) -> Option<NodeNo> {
        self.nodes
            .iter()
            .position(|n| n.same_node(node))
            .map(|i| i as NodeNo)
    }

    pub fn address(&self, node: NodeNo) -> Option<&NodeAddress> {
        self.nodes.get(node as usize)
    }

    pub fn is_member(&self, node: &NodeAddress) -> bool {
        self.nodeno(node).is_some()
    }

    pub fn is_active_leader(&self, node: NodeNo) -> bool {
        if node >= self.max_nodes() {
            return false;
        }
        if self.max_active_leaders == ACTIVE_LEADERS_ALL {
            return true;
        }
        self.active_leaders.contains(node)
    }

    /// Slots of nodes which aren't active leaders are never proposed for,
    /// they are executed as no-ops without any message.
    pub fn ignore_message(&self, synode: &Synode) -> bool {
        !self.is_active_leader(synode.node)
    }

    pub fn is_quorum(&self, count: u32) -> bool {
        count > self.max_nodes() / 2
    }

    /// Recomputes `active_leaders` from the preferred leaders and the agreed
    /// liveness of the members.
    pub fn analyze_leaders(&mut self) {
        let size = self.max_nodes();
        if self.max_active_leaders == ACTIVE_LEADERS_ALL {
            self.active_leaders = NodeSet::full(size);
            return;
        }

        let limit = self.max_active_leaders;
        let is_alive = |n: NodeNo| self.global_node_set.contains(n);
        let mut active = NodeSet::new(size);
        for leader in &self.leaders {
            if active.count() >= limit {
                break;
            }
            if let Some(n) = self.nodeno(leader) {
                if is_alive(n) {
                    active.add(n);
                }
            }
        }

        if active.count() == 0 {
            let mut alive = (0..size).filter(|n| is_alive(*n));
            if self.leaders.is_empty() {
                alive.take(limit as usize).for_each(|n| active.add(n));
            } else if let Some(n) = alive.next() {
                active.add(n);
            }
        }

        if active.count() == 0 && size > 0 {
            // nobody is known alive, fall back to the first member.
            active.add(0);
        }
        self.active_leaders = active;
    }

    /// The synode after which a member removed by this configuration may
    /// exit.
    pub fn exit_synode(&self) -> Synode {
        self.start.ahead(self.event_horizon as u64)
    }
}

/// The chain of installed configurations, ordered by start synode.
#[derive(Debug, Default, Clone)]
pub struct SiteDefs {
    defs: Vec<Arc<SiteDef>>,
}

impl SiteDefs {
    pub fn new() -> SiteDefs {
        SiteDefs::default()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }

    /// Installs a configuration. A configuration with the same start
    /// replaces the installed one.
    pub fn install(&mut self, site: SiteDef) -> Arc<SiteDef> {
        let site = Arc::new(site);
        match self.defs.binary_search_by(|s| s.start.cmp(&site.start)) {
            Ok(idx) => self.defs[idx] = site.clone(),
            Err(idx) => self.defs.insert(idx, site.clone()),
        }
        site
    }

    /// Returns the configuration governing `synode`.
    pub fn find(&self, synode: &Synode) -> Option<Arc<SiteDef>> {
        self.defs
            .iter()
            .rev()
            .find(|s| s.start.sequence <= synode.sequence)
            .cloned()
    }

    pub fn latest(&self) -> Option<Arc<SiteDef>> {
        self.defs.last().cloned()
    }

    /// Releases configurations which only govern synodes below `low`, the
    /// one governing `low` is kept.
    pub fn garbage_collect(&mut self, low: &Synode) -> usize {
        let keep_from = self
            .defs
            .iter()
            .rposition(|s| s.start.sequence <= low.sequence)
            .unwrap_or(0);
        self.defs.drain(..keep_from).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<SiteDef>> {
        self.defs.iter()
    }

    pub fn to_vec(&self) -> Vec<SiteDef> {
        self.defs.iter().map(|s| s.as_ref().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(n: u64) -> Vec<NodeAddress> {
        (0..n)
            .map(|i| NodeAddress::new(format!("127.0.0.1:{}", 3300 + i), i + 1))
            .collect()
    }

    fn leader_site(n: u64, max: u32, leaders: Vec<NodeNo>, alive: Vec<NodeNo>) -> SiteDef {
        let mut site = SiteDef::boot(Synode::new(1, 1, 0), nodes(n), 10);
        site.max_active_leaders = max;
        site.leaders = leaders
            .iter()
            .map(|n| site.nodes[*n as usize].clone())
            .collect();
        site.global_node_set = NodeSet::new(n as u32);
        alive.into_iter().for_each(|n| site.global_node_set.add(n));
        site.analyze_leaders();
        site
    }

    #[test]
    fn all_nodes_are_leaders_by_default() {
        let site = SiteDef::boot(Synode::new(1, 1, 0), nodes(3), 10);
        assert_eq!(site.active_leaders.count(), 3);
        for i in 0..3 {
            assert!(site.is_active_leader(i));
        }
        assert!(!site.is_active_leader(3));
        assert!(site.ignore_message(&Synode::new(1, 5, 3)));
        assert!(site.is_quorum(2));
        assert!(!site.is_quorum(1));
    }

    #[test]
    fn preferred_leaders() {
        let site = leader_site(5, 2, vec![3, 1, 0], vec![0, 1, 2, 3, 4]);
        assert_eq!(site.active_leaders.iter().collect::<Vec<_>>(), vec![1, 3]);
        assert!(site.ignore_message(&Synode::new(1, 5, 0)));
        assert!(!site.ignore_message(&Synode::new(1, 5, 3)));

        // dead preferred leaders are skipped.
        let site = leader_site(5, 2, vec![3, 1, 0], vec![0, 2, 4]);
        assert_eq!(site.active_leaders.iter().collect::<Vec<_>>(), vec![0]);
    }

    #[test]
    fn fallback_leaders() {
        // preferred leaders are all dead, the lowest alive node leads.
        let site = leader_site(3, 1, vec![0], vec![1, 2]);
        assert_eq!(site.active_leaders.iter().collect::<Vec<_>>(), vec![1]);

        // without preference, alive nodes in order.
        let site = leader_site(4, 2, vec![], vec![1, 2, 3]);
        assert_eq!(site.active_leaders.iter().collect::<Vec<_>>(), vec![1, 2]);

        // nobody alive.
        let site = leader_site(3, 1, vec![], vec![]);
        assert_eq!(site.active_leaders.iter().collect::<Vec<_>>(), vec![0]);
    }

    #[test]
    fn site_defs_chain() {
        let mut sites = SiteDefs::new();
        let first = SiteDef::boot(Synode::new(1, 1, 0), nodes(3), 5);
        let mut second = first.clone();
        second.start = Synode::new(1, 106, 0);
        second.nodes = nodes(4);
        sites.install(second.clone());
        sites.install(first.clone());

        assert_eq!(sites.len(), 2);
        assert_eq!(sites.find(&Synode::new(1, 105, 2)).unwrap().max_nodes(), 3);
        assert_eq!(sites.find(&Synode::new(1, 106, 0)).unwrap().max_nodes(), 4);
        assert!(sites.find(&Synode::NULL).is_none());
        assert_eq!(sites.latest().unwrap().start, second.start);

        // replacing keeps a single entry per start.
        let mut viewed = second.clone();
        viewed.global_node_set.remove(1);
        sites.install(viewed.clone());
        assert_eq!(sites.len(), 2);
        assert_eq!(*sites.latest().unwrap(), viewed);

        assert_eq!(sites.garbage_collect(&Synode::new(1, 50, 0)), 0);
        assert_eq!(sites.garbage_collect(&Synode::new(1, 200, 0)), 1);
        assert_eq!(sites.len(), 1);
        assert_eq!(sites.to_vec(), vec![viewed]);
    }

    #[test]
    fn exit_synode_is_one_horizon_past_start() {
        let mut site = SiteDef::boot(Synode::new(1, 106, 0), nodes(2), 5);
        site.boot_key = Synode::new(1, 100, 1);
        assert_eq!(site.exit_synode(), Synode::new(1, 111, 0));
    }
}
