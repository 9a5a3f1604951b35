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

use std::collections::HashMap;

use log::debug;

use crate::site_def::SiteDef;
use crate::types::{NodeAddress, NodeSet, Tick};

/// Tracks when each node was heard from last, nodes are keyed by uuid so the
/// record survives renumbering by reconfigurations.
#[derive(Debug, Default)]
pub struct Detector {
    detected: HashMap<u64, Tick>,
}

impl Detector {
    pub fn new() -> Detector {
        Detector::default()
    }

    pub fn note_alive(&mut self, node: &NodeAddress, now: Tick) {
        let at = self.detected.entry(node.uuid).or_insert(now);
        if *at < now {
            *at = now;
        }
    }

    /// Forgets the node, it is considered dead until it is heard again.
    pub fn note_dead(&mut self, node: &NodeAddress) {
        if self.detected.remove(&node.uuid).is_some() {
            debug!("node {} is marked dead", node);
        }
    }

    pub fn is_alive(&self, node: &NodeAddress, now: Tick, timeout: Tick) -> bool {
        self.detected
            .get(&node.uuid)
            .map(|at| now.saturating_sub(*at) < timeout)
            .unwrap_or(false)
    }

    /// Forgets every node `keep` rejects, returns how many were dropped.
    pub fn retain<F>(&mut self, keep: F) -> usize
    where
        F: Fn(&u64) -> bool,
    {
        let before = self.detected.len();
        self.detected.retain(|uuid, _| keep(uuid));
        before - self.detected.len()
    }

    /// The liveness of the members of `site` as seen by `me`.
    pub fn local_node_set(
        &self,
        site: &SiteDef,
        me: &NodeAddress,
        now: Tick,
        timeout: Tick,
    ) -> NodeSet {
        let mut set = NodeSet::new(site.max_nodes());
        for (i, node) in site.nodes.iter().enumerate() {
            if node.same_node(me) || self.is_alive(node, now, timeout) {
                set.add(i as u32);
            }
        }
        set
    }
}
