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

use std::collections::VecDeque;

use log::trace;

use crate::cache::InstanceCache;
use crate::site_def::{SiteDef, SiteDefs};
use crate::synode::{NodeNo, Synode};
use crate::types::NodeAddress;

/// How a synode was obtained, it decides whether the first push may skip the
/// prepare phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocKind {
    /// From the stream of the local node.
    Local,
    /// Granted by an active leader from its own stream.
    Remote,
    /// Any free slot of any stream, only used by a node which elected
    /// itself, or for forced configurations.
    Global,
}

impl AllocKind {
    pub fn is_two_phase(&self) -> bool {
        !matches!(self, AllocKind::Global)
    }
}

/// Hands out synodes to proposer workers.
#[derive(Debug, Default)]
pub struct SlotAllocator {
    /// The last synode issued from the local stream.
    last_local: Synode,

    /// The cursor of global allocation.
    current: Synode,

    /// Granted synodes waiting for a worker.
    pool: VecDeque<(Synode, AllocKind)>,

    /// Round robin cursor over the active leaders.
    next_leader: usize,
}

impl SlotAllocator {
    pub fn new() -> SlotAllocator {
        SlotAllocator::default()
    }

    pub fn last_local(&self) -> Synode {
        self.last_local
    }

    /// Marks the local slots up to `synode` as used, they are never handed
    /// out afterwards.
    pub fn skip_local(&mut self, synode: Synode) {
        if self.last_local < synode {
            self.last_local = synode;
        }
    }

    /// Returns the first free synode of the local stream at or after `hint`.
    /// Sequences governed by a configuration in which the local node isn't
    /// an active leader are passed over. `None` is returned if the local
    /// node doesn't lead in the latest configuration either, or the
    /// candidate is beyond the event horizon.
    pub fn local_allocate<C, F>(
        &mut self,
        sites: &SiteDefs,
        me: &NodeAddress,
        hint: Synode,
        cache: &C,
        too_far: F,
    ) -> Option<Synode>
    where
        C: InstanceCache,
        F: Fn(&Synode) -> bool,
    {
        let latest = sites.latest()?;
        let mut sequence = std::cmp::max(hint.sequence, self.last_local.sequence + 1);
        loop {
            let slot = Synode::new(hint.group, sequence, 0);
            if too_far(&slot) {
                return None;
            }
            let site = sites.find(&slot)?;
            let node = match site.nodeno(me) {
                Some(node) if site.is_active_leader(node) => node,
                _ if site.start == latest.start => return None,
                _ => {
                    sequence += 1;
                    continue;
                }
            };
            let candidate = Synode::new(hint.group, sequence, node);
            if candidate < hint || cache.is_busy(&candidate) {
                sequence += 1;
                continue;
            }
            trace!("node {} allocate local synode {}", me, candidate);
            self.last_local = candidate;
            return Some(candidate);
        }
    }

    /// Returns the first free synode of any stream of an active leader at or
    /// after `hint`.
    pub fn global_allocate<C, F>(
        &mut self,
        sites: &SiteDefs,
        hint: Synode,
        cache: &C,
        too_far: F,
    ) -> Option<Synode>
    where
        C: InstanceCache,
        F: Fn(&Synode) -> bool,
    {
        let mut synode = std::cmp::max(hint, self.current);
        loop {
            let site = sites.find(&synode)?;
            if synode.node >= site.max_nodes() {
                synode = synode.ahead(1);
                continue;
            }
            if too_far(&synode) {
                return None;
            }
            if site.ignore_message(&synode) || cache.is_busy(&synode) {
                synode = synode.next(site.max_nodes());
                continue;
            }
            trace!("allocate global synode {}", synode);
            self.current = synode.next(site.max_nodes());
            return Some(synode);
        }
    }

    /// Picks the active leader to ask for a synode, round robin over the
    /// leaders believed alive.
    pub fn pick_leader<F>(&mut self, site: &SiteDef, me: &NodeAddress, is_alive: F) -> Option<NodeNo>
    where
        F: Fn(&NodeAddress) -> bool,
    {
        let leaders = (0..site.max_nodes())
            .filter(|n| site.is_active_leader(*n))
            .filter(|n| {
                site.address(*n)
                    .map(|a| !a.same_node(me) && is_alive(a))
                    .unwrap_or(false)
            })
            .collect::<Vec<_>>();
        if leaders.is_empty() {
            return None;
        }
        let leader = leaders[self.next_leader % leaders.len()];
        self.next_leader = self.next_leader.wrapping_add(1);
        Some(leader)
    }

    pub fn push_grant(&mut self, synode: Synode, kind: AllocKind) {
        self.pool.push_back((synode, kind));
    }

    /// Puts back a synode which the worker failed to use.
    pub fn return_grant(&mut self, synode: Synode, kind: AllocKind) {
        self.pool.push_front((synode, kind));
    }

    /// Takes the oldest granted synode, unless it is beyond the event
    /// horizon. Grants the executor has already passed are dropped.
    pub fn take_reserved<F>(&mut self, executed: &Synode, too_far: F) -> Option<(Synode, AllocKind)>
    where
        F: Fn(&Synode) -> bool,
    {
        while let Some((synode, kind)) = self.pool.front().cloned() {
            if synode < *executed {
                self.pool.pop_front();
                continue;
            }
            if too_far(&synode) {
                return None;
            }
            self.pool.pop_front();
            return Some((synode, kind));
        }
        None
    }
}
