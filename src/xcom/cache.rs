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

use std::collections::{BTreeMap, HashMap};

use log::{debug, trace};

use crate::error::Error;
use crate::instance::PaxosInstance;
use crate::synode::Synode;

/// A trait is used by xcom to keep the Paxos instances of synodes.
///
/// Implementations are bounded: an instance may be evicted unless it is
/// locked by a proposer worker, belongs to a forced configuration, or it is
/// started and not below the log window start (`low_water`).
pub trait InstanceCache {
    /// Returns the instance of `synode`, creating a fresh one if necessary.
    /// `Error::Busy` is returned when the cache is full of instances which
    /// can't be evicted.
    fn get_or_create(&mut self, synode: Synode) -> Result<&mut PaxosInstance, Error>;

    fn try_get(&self, synode: &Synode) -> Option<&PaxosInstance>;

    fn try_get_mut(&mut self, synode: &Synode) -> Option<&mut PaxosInstance>;

    /// Evicts the least recently used instance which is allowed to go.
    fn evict_clean_lru(&mut self) -> Option<Synode>;

    /// Advances the log window start to `synode` and releases the instances
    /// below it. Returns the number of released instances.
    fn release_until(&mut self, synode: Synode) -> usize;

    /// The start of the log window.
    fn low_water(&self) -> Synode;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns whether the slot is used by some role already.
    fn is_busy(&self, synode: &Synode) -> bool {
        self.try_get(synode)
            .map(|p| p.is_started())
            .unwrap_or(false)
    }

    /// Returns whether a value has been decided for the slot.
    fn is_learned(&self, synode: &Synode) -> bool {
        self.try_get(synode)
            .map(|p| p.is_finished())
            .unwrap_or(false)
    }
}

/// An in-memory `InstanceCache` with LRU eviction.
#[derive(Debug)]
pub struct MemInstanceCache {
    capacity: usize,
    low_water: Synode,
    next_stamp: u64,
    instances: HashMap<Synode, (u64, PaxosInstance)>,
    lru: BTreeMap<u64, Synode>,
}

impl MemInstanceCache {
    pub fn new(capacity: usize) -> MemInstanceCache {
        MemInstanceCache {
            capacity: std::cmp::max(capacity, 1),
            low_water: Synode::NULL,
            next_stamp: 0,
            instances: HashMap::new(),
            lru: BTreeMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn evictable(&self, p: &PaxosInstance) -> bool {
        if p.is_locked() || p.force_delivery {
            return false;
        }
        !p.is_started() || p.synode < self.low_water
    }

    fn remove(&mut self, synode: &Synode) -> bool {
        match self.instances.remove(synode) {
            Some((stamp, _)) => {
                self.lru.remove(&stamp);
                true
            }
            None => false,
        }
    }
}

impl InstanceCache for MemInstanceCache {
    fn get_or_create(&mut self, synode: Synode) -> Result<&mut PaxosInstance, Error> {
        if !self.instances.contains_key(&synode) && self.instances.len() >= self.capacity {
            if self.evict_clean_lru().is_none() {
                debug!(
                    "synode {} cache is full, {} instances are pinned",
                    synode,
                    self.instances.len()
                );
                return Err(Error::Busy);
            }
        }

        let stamp = self.next_stamp;
        self.next_stamp += 1;
        let slot = self
            .instances
            .entry(synode)
            .or_insert_with(|| (stamp, PaxosInstance::new(synode)));
        let prev_stamp = std::mem::replace(&mut slot.0, stamp);
        self.lru.remove(&prev_stamp);
        self.lru.insert(stamp, synode);
        Ok(&mut slot.1)
    }

    fn try_get(&self, synode: &Synode) -> Option<&PaxosInstance> {
        self.instances.get(synode).map(|(_, p)| p)
    }

    fn try_get_mut(&mut self, synode: &Synode) -> Option<&mut PaxosInstance> {
        self.instances.get_mut(synode).map(|(_, p)| p)
    }

    fn evict_clean_lru(&mut self) -> Option<Synode> {
        let victim = self
            .lru
            .values()
            .find(|s| {
                self.instances
                    .get(*s)
                    .map(|(_, p)| self.evictable(p))
                    .unwrap_or(true)
            })
            .cloned()?;
        trace!("synode {} is evicted from cache", victim);
        self.remove(&victim);
        Some(victim)
    }

    fn release_until(&mut self, synode: Synode) -> usize {
        if synode <= self.low_water {
            return 0;
        }
        self.low_water = synode;

        let released = self
            .instances
            .iter()
            .filter(|(s, (_, p))| **s < synode && self.evictable(p))
            .map(|(s, _)| *s)
            .collect::<Vec<_>>();
        for s in &released {
            self.remove(s);
        }
        trace!("release {} instances until synode {}", released.len(), synode);
        released.len()
    }

    fn low_water(&self) -> Synode {
        self.low_water
    }

    fn len(&self) -> usize {
        self.instances.len()
    }
}
