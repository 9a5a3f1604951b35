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

//! An in-process group for tests: several `Xcom` nodes exchange their
//! `Ready::msgs` directly, any node or any single link can be cut off.

use std::collections::HashSet;

use log::{Metadata, Record};

use crate::cache::MemInstanceCache;
use crate::error::Error;
use crate::site_def::SiteDef;
use crate::synode::{GroupId, Synode};
use crate::types::*;
use crate::xcom::{Xcom, XcomOption};

struct SimpleLogger;
impl log::Log for SimpleLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        println!(
            "[{} - {} - {}:{}] {}",
            record.level(),
            record.target(),
            record.file().unwrap_or("unknown"),
            record.line().unwrap_or(0),
            record.args()
        );
    }

    fn flush(&self) {}
}

static LOGGER: SimpleLogger = SimpleLogger;
static SETUP_LOGGER: std::sync::Once = std::sync::Once::new();

pub(crate) fn setup_logger() {
    SETUP_LOGGER.call_once(|| {
        log::set_logger(&LOGGER)
            .map(|()| log::set_max_level(log::LevelFilter::Debug))
            .expect("init logger");
    });
}

pub(crate) const GROUP: GroupId = 7;

const MAX_PUMP_ROUNDS: usize = 1000;

pub(crate) fn addr(i: u64) -> NodeAddress {
    NodeAddress::new(format!("127.0.0.1:{}", 33061 + i), i + 1)
}

/// Short timeouts, a value waits for a synode for as long as the test runs.
pub(crate) fn test_option(event_horizon: u32) -> XcomOption {
    XcomOption {
        event_horizon,
        base_propose_timeout_tick: 4,
        max_propose_timeout_tick: 16,
        synode_request_timeout_tick: 4,
        max_allocation_wait_tick: 2000,
        base_fetch_wait_tick: 1,
        max_fetch_wait_tick: 8,
        detector_live_timeout_tick: 20,
        heartbeat_interval_tick: 2,
        view_interval_tick: 10,
        cache_capacity: 4096,
        ..XcomOption::default()
    }
}

pub(crate) struct Cluster {
    pub nodes: Vec<Xcom<MemInstanceCache>>,
    pub addrs: Vec<NodeAddress>,
    option: XcomOption,
    capacity: usize,
    isolated: HashSet<usize>,
    cut: HashSet<(usize, usize)>,
    delivered: Vec<Vec<Delivery>>,
    failures: Vec<Vec<FailedRequest>>,
}

impl Cluster {
    pub fn new(num_nodes: usize, option: XcomOption) -> Cluster {
        let capacity = option.cache_capacity;
        Cluster::with_cache(num_nodes, option, capacity)
    }

    pub fn with_cache(num_nodes: usize, option: XcomOption, capacity: usize) -> Cluster {
        let addrs = (0..num_nodes as u64).map(addr).collect::<Vec<_>>();
        let site = SiteDef::boot(Synode::new(GROUP, 1, 0), addrs, option.event_horizon);
        Cluster::build(site, option, capacity)
    }

    pub fn with_site(site: SiteDef, option: XcomOption) -> Cluster {
        let capacity = option.cache_capacity;
        Cluster::build(site, option, capacity)
    }

    fn build(site: SiteDef, option: XcomOption, capacity: usize) -> Cluster {
        let addrs = site.nodes.clone();
        let nodes = addrs
            .iter()
            .map(|a| {
                let mut xcom = Xcom::new(option.clone(), a.clone(), MemInstanceCache::new(capacity));
                xcom.boot(site.clone()).expect("boot");
                xcom
            })
            .collect::<Vec<_>>();
        let num_nodes = nodes.len();
        Cluster {
            nodes,
            addrs,
            option,
            capacity,
            isolated: HashSet::new(),
            cut: HashSet::new(),
            delivered: vec![Vec::new(); num_nodes],
            failures: vec![Vec::new(); num_nodes],
        }
    }

    /// Adds a node booted from `snapshot`.
    pub fn join(&mut self, me: NodeAddress, snapshot: Snapshot) -> Result<(), Error> {
        let mut xcom = Xcom::new(self.option.clone(), me.clone(), MemInstanceCache::new(self.capacity));
        xcom.import_state(snapshot)?;
        self.nodes.push(xcom);
        self.addrs.push(me);
        self.delivered.push(Vec::new());
        self.failures.push(Vec::new());
        Ok(())
    }

    pub fn propose(&mut self, node: usize, value: &[u8]) -> Result<u64, Error> {
        self.nodes[node].propose(Cargo::App(value.to_vec()), 0)
    }

    pub fn isolate(&mut self, node: usize) {
        self.isolated.insert(node);
    }

    pub fn heal(&mut self, node: usize) {
        self.isolated.remove(&node);
    }

    /// Drops the traffic between `a` and `b` in both directions.
    pub fn cut(&mut self, a: usize, b: usize) {
        self.cut.insert((a.min(b), a.max(b)));
    }

    pub fn mend(&mut self, a: usize, b: usize) {
        self.cut.remove(&(a.min(b), a.max(b)));
    }

    pub fn delivered(&self, node: usize) -> Vec<Delivery> {
        self.delivered[node].clone()
    }

    pub fn failures(&self, node: usize) -> Vec<FailedRequest> {
        self.failures[node].clone()
    }

    /// Advances every node and routes their messages until nothing moves.
    pub fn pump(&mut self) {
        for _ in 0..MAX_PUMP_ROUNDS {
            let mut inflight = Vec::new();
            for idx in 0..self.nodes.len() {
                let ready = self.nodes[idx].advance();
                self.delivered[idx].extend(ready.deliveries);
                self.failures[idx].extend(ready.failures);
                inflight.extend(ready.msgs.into_iter().map(|m| (idx, m)));
            }
            if inflight.is_empty() {
                return;
            }
            for (from, envelope) in inflight {
                let to = match self.addrs.iter().position(|a| a.same_node(&envelope.to)) {
                    Some(to) => to,
                    None => continue,
                };
                if self.isolated.contains(&from) || self.isolated.contains(&to) {
                    continue;
                }
                if self.cut.contains(&(from.min(to), from.max(to))) {
                    continue;
                }
                self.nodes[to].step(envelope.msg);
            }
        }
    }

    pub fn run(&mut self, ticks: usize) {
        for _ in 0..ticks {
            for node in &mut self.nodes {
                node.tick();
            }
            self.pump();
        }
    }
}
