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

use log::{debug, error, info, trace, warn};

use crate::cache::InstanceCache;
use crate::constant::*;
use crate::reconfig;
use crate::site_def::SiteDef;
use crate::synode::Synode;
use crate::types::*;
use crate::xcom::{generate_timeout_tick, Xcom, XcomEvent};

/// The state of the ordered delivery cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorState {
    /// Waiting for the value of `executed_msg`. `attempts` counts the
    /// escalations so far, the next one happens at `deadline`.
    Fetch {
        attempts: u32,
        deadline: Option<Tick>,
    },
    /// The value of `executed_msg` is known.
    Execute,
    Terminate,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum ExecutorEvent {
    Learned,
    Escalated(Tick),
    Idle,
    Executed,
    ExitReached,
}

impl ExecutorState {
    pub(crate) fn transition(self, event: ExecutorEvent) -> ExecutorState {
        match (self, event) {
            (ExecutorState::Terminate, _) => ExecutorState::Terminate,
            (_, ExecutorEvent::ExitReached) => ExecutorState::Terminate,
            (ExecutorState::Fetch { .. }, ExecutorEvent::Learned) => ExecutorState::Execute,
            (ExecutorState::Fetch { attempts, deadline }, ExecutorEvent::Escalated(next)) => {
                ExecutorState::Fetch {
                    attempts: if deadline.is_some() { attempts + 1 } else { attempts },
                    deadline: Some(next),
                }
            }
            (ExecutorState::Fetch { .. }, ExecutorEvent::Idle)
            | (ExecutorState::Execute, ExecutorEvent::Executed) => ExecutorState::Fetch {
                attempts: 0,
                deadline: None,
            },
            (state, _) => state,
        }
    }
}

#[derive(Debug)]
pub(crate) struct Executor {
    pub(crate) state: ExecutorState,

    /// Every synode before it has been executed.
    pub(crate) executed_msg: Synode,

    /// Set once the local node is removed, application values at or beyond
    /// it are not delivered.
    pub(crate) delivery_limit: Option<Synode>,

    /// Set once the local node is removed, the node terminates after it.
    pub(crate) exit_synode: Option<Synode>,
}

impl Executor {
    pub fn new() -> Executor {
        Executor {
            state: ExecutorState::Fetch {
                attempts: 0,
                deadline: None,
            },
            executed_msg: Synode::NULL,
            delivery_limit: None,
            exit_synode: None,
        }
    }

    fn on(&mut self, event: ExecutorEvent) {
        self.state = self.state.transition(event);
    }
}

impl<C: InstanceCache> Xcom<C> {
    pub(crate) fn run_executor(&mut self) -> bool {
        let mut progressed = false;
        for _ in 0..MAX_EXECUTE_PER_ADVANCE {
            let advanced = match self.executor.state {
                ExecutorState::Terminate => false,
                ExecutorState::Fetch { attempts, deadline } => self.fetch(attempts, deadline),
                ExecutorState::Execute => {
                    self.execute_current();
                    true
                }
            };
            if !advanced || !self.state.is_active() {
                break;
            }
            progressed = true;
        }
        progressed
    }

    /// Someone needs the value of `synode`: a later synode is in use, or a
    /// removed node waits for the group to reach its exit synode.
    fn is_wanted(&self, synode: &Synode) -> bool {
        self.max_synode > *synode || self.removed.iter().any(|(_, exit)| synode <= exit)
    }

    fn fetch(&mut self, attempts: u32, deadline: Option<Tick>) -> bool {
        if let Some(exit) = self.executor.exit_synode {
            if self.executor.executed_msg > exit {
                info!(
                    "node {} reach exit synode {}, executed {}",
                    self.me, exit, self.executor.executed_msg
                );
                self.executor.on(ExecutorEvent::ExitReached);
                self.transition(XcomEvent::ExitReached);
                return true;
            }
        }

        let site = match self.sites.find(&self.executor.executed_msg) {
            Some(site) => site,
            None => return false,
        };
        if self.executor.executed_msg.node >= site.max_nodes() {
            self.executor.executed_msg = self.executor.executed_msg.ahead(1);
            return true;
        }

        let synode = self.executor.executed_msg;
        if site.ignore_message(&synode) || self.cache.is_learned(&synode) {
            self.executor.on(ExecutorEvent::Learned);
            return true;
        }
        if !self.is_wanted(&synode) {
            if deadline.is_some() {
                self.executor.on(ExecutorEvent::Idle);
            }
            return false;
        }
        if self.skip_own_slot(&site, synode) {
            return true;
        }

        match deadline {
            None => {
                let wait = self.fetch_wait(attempts);
                self.executor.on(ExecutorEvent::Escalated(self.now + wait));
                false
            }
            Some(deadline) if self.now >= deadline => {
                self.escalate(&site, synode, attempts);
                let wait = self.fetch_wait(attempts + 1);
                self.executor.on(ExecutorEvent::Escalated(self.now + wait));
                true
            }
            Some(_) => false,
        }
    }

    fn fetch_wait(&self, attempts: u32) -> Tick {
        let base = self.option.base_fetch_wait_tick;
        let wait = base.saturating_mul(1 << std::cmp::min(attempts, 16));
        generate_timeout_tick(std::cmp::min(wait, self.option.max_fetch_wait_tick))
    }

    /// The owner of an unused slot proposes a no-op there at its own ballot,
    /// without a prepare. It is decided by a majority of accepts like any
    /// other value, so a higher ballot pushed by another node still wins.
    fn skip_own_slot(&mut self, site: &SiteDef, synode: Synode) -> bool {
        let node = match site.nodeno(&self.me) {
            Some(node) if node == synode.node => node,
            _ => return false,
        };
        if self.allocator.last_local() >= synode || self.cache.is_busy(&synode) {
            return false;
        }
        let skip = match self.cache.get_or_create(synode) {
            Ok(p) => {
                let mut skip = p.push_2p(Arc::new(PaxMsg::noop(synode)), node);
                skip.op = Op::Skip;
                skip
            }
            Err(_) => return false,
        };
        self.allocator.skip_local(synode);

        trace!("node {} skip own synode {}", self.me, synode);
        self.broadcast(site, skip);
        true
    }

    fn escalate(&mut self, site: &SiteDef, synode: Synode, attempts: u32) {
        debug!(
            "node {} synode {} is missing after {} attempts, max synode {}",
            self.me, synode, attempts, self.max_synode
        );
        match attempts {
            0 | 1 => self.request_values(synode),
            2 if self.i_am_the_greatest(site) => self.push_noop(synode),
            2 => self.request_values(synode),
            _ => self.push_noop(synode),
        }
    }

    /// Asks the other members for every unknown value from `from` up to the
    /// highest synode in use.
    fn request_values(&mut self, from: Synode) {
        let mut synode = from;
        let mut requested = 0;
        while requested < MAX_READ_REQUESTS && synode <= self.max_synode && !self.too_far(&synode) {
            let site = match self.sites.find(&synode) {
                Some(site) => site,
                None => break,
            };
            if synode.node >= site.max_nodes() {
                synode = synode.ahead(1);
                continue;
            }
            if !site.ignore_message(&synode) && !self.cache.is_learned(&synode) {
                self.broadcast_others(&site, PaxMsg::new(Op::Read, synode));
                requested += 1;
            }
            synode = synode.next(site.max_nodes());
        }
        trace!("node {} read {} synodes from {}", self.me, requested, from);
    }

    fn execute_current(&mut self) {
        let synode = self.executor.executed_msg;
        let site = match self.sites.find(&synode) {
            Some(site) => site,
            None => {
                self.executor.on(ExecutorEvent::Executed);
                return;
            }
        };
        let learned = self.cache.try_get(&synode).and_then(|p| p.learner.learned.clone());

        if let Some(value) = &learned {
            if !value.is_noop() {
                self.execute_value(&site, value);
            }
            if self.executor.delivery_limit.map(|l| synode >= l).unwrap_or(false) {
                self.forward_learn(value);
            }
        }

        let next = synode.next(site.max_nodes());
        trace!("node {} executed synode {}", self.me, synode);
        self.executor.executed_msg = next;
        if next > self.max_synode {
            self.max_synode = next;
        }
        if next.node == 0 {
            self.collect_garbage(next);
        }
        self.executor.on(ExecutorEvent::Executed);
    }

    fn execute_value(&mut self, site: &SiteDef, value: &PaxMsg) {
        let synode = value.synode;
        let deliverable = self.executor.delivery_limit.map(|l| synode < l).unwrap_or(true);
        for data in &value.payload {
            match &data.cargo {
                Cargo::App(bytes) => {
                    if !deliverable {
                        continue;
                    }
                    self.ready.deliveries.push(Delivery {
                        synode,
                        origin: data.origin,
                        lsn: data.lsn,
                        payload: bytes.clone(),
                        outcome: Outcome::Ok,
                    });
                }
                Cargo::View(set) => self.execute_view(site, synode, set),
                cargo => self.execute_config(site, synode, data, cargo),
            }
        }
    }

    fn execute_config(&mut self, site: &SiteDef, synode: Synode, data: &AppData, cargo: &Cargo) {
        let latest = match self.sites.latest() {
            Some(latest) => latest,
            None => return,
        };
        match reconfig::next_config(&latest, cargo, synode, site.event_horizon) {
            Ok(next) => self.install_config(next),
            Err(reason) => {
                warn!(
                    "node {} synode {} reject config {:?}: {}",
                    self.me, synode, cargo, reason
                );
                if data.origin == self.me.uuid {
                    self.ready.failures.push(FailedRequest {
                        synode,
                        data: data.clone(),
                    });
                }
            }
        }
    }

    fn execute_view(&mut self, site: &SiteDef, synode: Synode, set: &NodeSet) {
        let latest = match self.sites.latest() {
            Some(latest) => latest,
            None => return,
        };
        if set.size() != latest.max_nodes() || *set == latest.global_node_set {
            trace!("node {} synode {} drop stale view", self.me, synode);
            return;
        }
        let view = Cargo::View(set.clone());
        match reconfig::next_config(&latest, &view, synode, site.event_horizon) {
            Ok(next) => self.install_config(next),
            Err(reason) => debug!("node {} synode {} drop view: {}", self.me, synode, reason),
        }
    }

    fn install_config(&mut self, site: SiteDef) {
        let prev = self.sites.latest();
        let site = self.sites.install(site);
        self.ready.installed.push(site.clone());
        self.note_members_alive(&site);
        self.forget_non_members();

        let prev = match prev {
            Some(prev) => prev,
            None => return,
        };
        let exit = site.exit_synode();
        for node in prev.nodes.iter().filter(|n| !site.is_member(n)) {
            if node.same_node(&self.me) {
                info!(
                    "node {} is removed since synode {}, exit after {}",
                    self.me, site.start, exit
                );
                self.executor.delivery_limit = Some(site.start);
                self.executor.exit_synode = Some(exit);
                self.transition(XcomEvent::Removed(exit));
            } else {
                info!("node {} removed, inform it until {}", node, exit);
                self.removed.push((node.clone(), exit));
            }
        }
    }

    /// Drops the liveness records of nodes no kept configuration names.
    fn forget_non_members(&mut self) {
        let sites = &self.sites;
        let forgotten = self
            .detector
            .retain(|uuid| sites.iter().any(|s| s.nodes.iter().any(|n| n.uuid == *uuid)));
        if forgotten > 0 {
            debug!("node {} forget {} non member nodes", self.me, forgotten);
        }
    }

    /// A removed node passes the values it learns on to the survivors.
    fn forward_learn(&mut self, value: &Arc<PaxMsg>) {
        let site = match self.sites.find(&value.synode) {
            Some(site) => site,
            None => return,
        };
        let mut learn = value.carry(Op::Learn);
        learn.synode = value.synode;
        self.broadcast_others(&site, learn);
    }

    fn collect_garbage(&mut self, executed: Synode) {
        let retention = self.option.log_retention as u64;
        if executed.sequence <= retention {
            return;
        }
        let low = Synode::new(executed.group, executed.sequence - retention, 0);
        let released = self.cache.release_until(low);
        let sites = self.sites.garbage_collect(&low);
        self.forget_non_members();
        if released > 0 || sites > 0 {
            trace!(
                "node {} release {} instances and {} configs below {}",
                self.me,
                released,
                sites,
                low
            );
        }
        if self.cache.low_water() > executed {
            error!(
                "node {} log start {} passes executed {}",
                self.me,
                self.cache.low_water(),
                executed
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemInstanceCache;
    use crate::sim::*;
    use crate::xcom::{TerminateReason, XcomState};
    use rand::{thread_rng, Rng};

    #[test]
    fn executor_transitions() {
        let state = ExecutorState::Fetch {
            attempts: 0,
            deadline: None,
        };
        let state = state.transition(ExecutorEvent::Escalated(5));
        assert_eq!(
            state,
            ExecutorState::Fetch {
                attempts: 0,
                deadline: Some(5)
            }
        );
        let state = state.transition(ExecutorEvent::Escalated(9));
        assert_eq!(
            state,
            ExecutorState::Fetch {
                attempts: 1,
                deadline: Some(9)
            }
        );
        let state = state.transition(ExecutorEvent::Learned);
        assert_eq!(state, ExecutorState::Execute);
        let state = state.transition(ExecutorEvent::Executed);
        assert_eq!(
            state,
            ExecutorState::Fetch {
                attempts: 0,
                deadline: None
            }
        );
        let state = state.transition(ExecutorEvent::ExitReached);
        assert_eq!(state, ExecutorState::Terminate);
        assert_eq!(state.transition(ExecutorEvent::Learned), ExecutorState::Terminate);
    }

    #[test]
    fn too_far_is_an_admission_gate() {
        setup_logger();
        let mut rng = thread_rng();
        for _ in 0..200 {
            let eh = rng.gen_range(EVENT_HORIZON_MIN..=20);
            let start = rng.gen_range(1..1000u64);
            let mut xcom = Xcom::new(test_option(eh), addr(0), MemInstanceCache::new(64));
            let nodes = (0..3).map(addr).collect::<Vec<_>>();
            xcom.boot(SiteDef::boot(Synode::new(GROUP, start, 0), nodes, eh))
                .unwrap();

            let sequence = rng.gen_range(start..start + 2 * eh as u64);
            let synode = Synode::new(GROUP, sequence, rng.gen_range(0..3));
            let expect = sequence >= start + eh as u64;
            assert_eq!(xcom.too_far(&synode), expect, "{} eh {}", synode, eh);

            let mut msg = PaxMsg::new(Op::Prepare, synode);
            msg.proposal = crate::synode::Ballot::new(1, 1);
            msg.from = 1;
            msg.sender = addr(1);
            msg.group_id = GROUP;
            xcom.step(msg);
            let _ = xcom.advance();
            assert_eq!(xcom.cache.try_get(&synode).is_some(), !expect);
        }
    }

    #[test]
    fn add_node_takes_effect_after_event_horizon() {
        setup_logger();
        let mut cluster = Cluster::new(3, test_option(5));
        cluster.propose(0, b"before").unwrap();
        cluster.run(5);
        cluster.nodes[0]
            .propose(Cargo::AddNode(vec![addr(3)]), 0)
            .unwrap();
        cluster.run(5);

        let latest = cluster.nodes[0].get_latest_config().unwrap();
        assert_eq!(latest.max_nodes(), 4);
        assert_eq!(latest.start, latest.boot_key.ahead(6));
        for node in 1..3 {
            assert_eq!(cluster.nodes[node].get_latest_config().unwrap(), latest);
        }

        // the new node isn't part of any synode before the start.
        let early = cluster.nodes[0].executed_msg();
        assert!(early < latest.start);
        let mut prepare = PaxMsg::new(Op::Prepare, early);
        prepare.proposal = crate::synode::Ballot::new(7, 3);
        prepare.from = 3;
        prepare.sender = addr(3);
        prepare.group_id = GROUP;
        cluster.nodes[1].step(prepare);
        let ready = cluster.nodes[1].advance();
        assert!(ready.msgs.is_empty());
        assert!(!cluster.nodes[1].cache.is_busy(&early));

        // the group runs into the new config without the new node.
        let mut proposed = 1;
        for _ in 0..50 {
            if cluster.nodes[0].executed_msg() >= latest.start {
                break;
            }
            cluster.propose(0, b"fill").unwrap();
            proposed += 1;
            cluster.run(5);
        }
        assert!(cluster.nodes[0].executed_msg() >= latest.start);

        let snapshot = cluster.nodes[0].export_state();
        cluster.join(addr(3), snapshot.clone()).unwrap();
        assert_eq!(cluster.nodes[3].executed_msg(), snapshot.log_end);
        assert_eq!(cluster.nodes[3].state(), &XcomState::Run);

        for i in 0..8u8 {
            cluster.propose((i % 4) as usize, &[i]).unwrap();
            cluster.run(3);
        }
        cluster.run(200);

        let delivered = cluster.delivered(0);
        assert_eq!(delivered.len(), proposed + 8);
        let joined = cluster.delivered(3);
        assert!(joined.len() >= 8);
        assert!(joined.iter().all(|d| d.synode >= snapshot.log_end));
        assert_eq!(&delivered[delivered.len() - joined.len()..], &joined[..]);
    }

    #[test]
    fn removed_node_exits_after_exit_synode() {
        setup_logger();
        let mut cluster = Cluster::new(3, test_option(5));
        cluster.propose(2, b"first").unwrap();
        cluster.run(5);
        cluster.nodes[0]
            .propose(Cargo::RemoveNode(vec![addr(2)]), 0)
            .unwrap();
        cluster.run(5);

        let latest = cluster.nodes[0].get_latest_config().unwrap();
        assert_eq!(latest.max_nodes(), 2);
        let exit = latest.exit_synode();
        assert_eq!(cluster.nodes[2].state(), &XcomState::Exiting(exit));
        assert!(matches!(
            cluster.nodes[2].propose(Cargo::App(b"no".to_vec()), 0),
            Err(crate::error::Error::NotReady)
        ));

        for i in 0..4u8 {
            cluster.propose((i % 2) as usize, &[i]).unwrap();
            cluster.run(3);
        }
        cluster.run(200);

        assert_eq!(
            cluster.nodes[2].state(),
            &XcomState::Terminated(TerminateReason::Removed)
        );
        assert!(cluster.nodes[0].removed.is_empty());
        assert!(cluster.nodes[0].executed_msg() > exit);

        let survivors = cluster.delivered(0);
        assert_eq!(survivors.len(), 5);
        assert_eq!(survivors, cluster.delivered(1));
        // the removed node delivers nothing governed by the new config.
        let removed = cluster.delivered(2);
        assert!(!removed.is_empty());
        assert!(removed.iter().all(|d| d.synode < latest.start));
        assert_eq!(&survivors[..removed.len()], &removed[..]);
    }

    #[test]
    fn removed_node_is_forgotten() {
        setup_logger();
        let mut option = test_option(5);
        option.log_retention = 3;
        let mut cluster = Cluster::new(3, option);
        cluster.nodes[0]
            .propose(Cargo::RemoveNode(vec![addr(2)]), 0)
            .unwrap();
        cluster.run(5);
        let latest = cluster.nodes[0].get_latest_config().unwrap();
        assert_eq!(latest.max_nodes(), 2);
        let exit = latest.exit_synode();

        let removed = XcomState::Terminated(TerminateReason::Removed);
        for i in 0..100u8 {
            if cluster.nodes[2].state() == &removed
                && cluster.nodes[0].executed_msg().sequence > exit.sequence + 8
            {
                break;
            }
            cluster.propose((i % 2) as usize, &[i]).unwrap();
            cluster.run(3);
        }
        assert_eq!(cluster.nodes[2].state(), &removed);
        // the last words of the removed node are forgotten by later slots.
        for node in 0..2 {
            cluster.propose(node, b"after").unwrap();
            cluster.run(3);
        }

        for node in 0..2 {
            let xcom = &cluster.nodes[node];
            assert_eq!(xcom.sites.len(), 1);
            assert!(!xcom.detector.is_alive(&addr(2), xcom.now, Tick::MAX));
            assert!(xcom.detector.is_alive(&addr(1 - node as u64), xcom.now, Tick::MAX));
        }
    }

    #[test]
    fn event_horizon_change() {
        setup_logger();
        let mut cluster = Cluster::new(3, test_option(5));
        cluster.nodes[1].propose(Cargo::SetEventHorizon(12), 0).unwrap();
        cluster.run(5);
        let latest = cluster.nodes[2].get_latest_config().unwrap();
        assert_eq!(latest.event_horizon, 12);
        // the decision was made under an event horizon of five.
        assert_eq!(latest.start, latest.boot_key.ahead(6));

        for i in 0..6u8 {
            cluster.propose((i % 3) as usize, &[i]).unwrap();
        }
        cluster.run(100);
        assert_eq!(cluster.delivered(0).len(), 6);
        assert_eq!(cluster.delivered(0), cluster.delivered(2));
        let node = &cluster.nodes[0];
        let active = node.get_active_config().unwrap();
        assert_eq!(
            node.horizon(),
            node.executed_msg().sequence + std::cmp::min(active.event_horizon, 12) as u64
        );
    }

    #[test]
    fn leader_change_ignores_other_streams() {
        setup_logger();
        let mut cluster = Cluster::new(3, test_option(5));
        cluster.nodes[0].propose(Cargo::SetMaxLeaders(1), 0).unwrap();
        cluster.run(5);
        cluster.nodes[0].propose(Cargo::SetLeaders(vec![addr(1)]), 0).unwrap();
        cluster.run(5);
        let latest = cluster.nodes[0].get_latest_config().unwrap();
        assert_eq!(latest.max_active_leaders, 1);
        assert!(latest.is_active_leader(1));
        assert!(!latest.is_active_leader(0));

        // fill the pipeline up to the new leader set.
        for _ in 0..50 {
            if cluster.nodes[0].executed_msg() >= latest.start {
                break;
            }
            cluster.propose(0, b"fill").unwrap();
            cluster.run(5);
        }
        assert!(cluster.nodes[0].executed_msg() >= latest.start);

        for i in 0..6u8 {
            cluster.propose((i % 3) as usize, &[i]).unwrap();
            cluster.run(3);
        }
        cluster.run(100);
        let delivered = cluster.delivered(0);
        let values = delivered.iter().filter(|d| d.payload.len() == 1).collect::<Vec<_>>();
        assert_eq!(values.len(), 6);
        assert!(values.iter().all(|d| d.synode.node == 1));
        assert_eq!(delivered, cluster.delivered(2));
    }

    #[test]
    fn owner_skip_loses_to_a_higher_ballot() {
        setup_logger();
        let mut site = SiteDef::boot(Synode::new(GROUP, 1, 0), (0..3).map(addr).collect(), 5);
        site.max_active_leaders = 1;
        site.leaders = vec![addr(1)];
        site.analyze_leaders();
        let mut cluster = Cluster::with_site(site, test_option(5));

        // node 0 can't reach the leader, it takes the leader's slot itself.
        cluster.cut(0, 1);
        cluster.nodes[0].notify_connection_lost(&addr(1));
        cluster.propose(0, b"g").unwrap();
        cluster.run(15);

        let target = Synode::new(GROUP, 1, 1);
        let delivered = cluster.delivered(0);
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].synode, target);
        assert_eq!(delivered[0].payload, b"g".to_vec());
        for node in 1..3 {
            assert_eq!(cluster.delivered(node), delivered);
            let learned = cluster.nodes[node]
                .cache
                .try_get(&target)
                .and_then(|p| p.learner.learned.clone())
                .unwrap();
            assert!(!learned.is_noop());
        }
    }

    #[test]
    fn log_window_is_released() {
        setup_logger();
        let mut option = test_option(5);
        option.log_retention = 3;
        let mut cluster = Cluster::new(3, option);
        for i in 0..20u8 {
            cluster.propose(0, &[i]).unwrap();
            cluster.run(2);
        }
        cluster.run(50);
        assert_eq!(cluster.delivered(0).len(), 20);
        let node = &cluster.nodes[0];
        let executed = node.executed_msg();
        let low = node.cache.low_water();
        assert_eq!(low.sequence, executed.sequence - 3);
        assert!(node.cache.len() <= 3 * 5 + 3);
        assert_eq!(node.export_state().log_start, low);
    }
}
