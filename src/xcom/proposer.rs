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
use std::sync::Arc;

use log::{debug, error, info, trace, warn};

use crate::allocator::AllocKind;
use crate::cache::InstanceCache;
use crate::error::{Error, RejectReason};
use crate::reconfig;
use crate::synode::{Ballot, Synode};
use crate::types::*;
use crate::xcom::{generate_timeout_tick, Xcom, XcomEvent, XcomState};

/// The log sequence number of a local request, `(origin, lsn)` of the
/// resulting delivery identifies it.
pub type RequestId = u64;

/// Values pushed together in a single synode.
#[derive(Debug, Clone)]
pub(crate) struct Batch {
    pub items: Vec<AppData>,
    pub force: bool,
}

impl Batch {
    fn bytes(&self) -> usize {
        self.items.iter().map(|d| d.cargo.size()).sum()
    }
}

#[derive(Debug)]
pub(crate) enum WorkerState {
    Idle,
    /// Waiting for a synode.
    Reserving {
        batch: Batch,
        since: Tick,
        requested_at: Option<Tick>,
    },
    /// Pushing `mine` at `synode`.
    Pushing {
        batch: Batch,
        synode: Synode,
        mine: Arc<PaxMsg>,
        /// The learn generation of the instance, the worker wakes once it
        /// moves.
        rv: u64,
        deadline: Tick,
        timeout: Tick,
        retries: u32,
    },
}

enum Reservation {
    Granted(Synode, AllocKind),
    Wait(Option<Tick>),
}

#[derive(Debug)]
pub(crate) struct ProposerEngine {
    pub(crate) workers: Vec<WorkerState>,
    pub(crate) queue: VecDeque<(AppData, bool)>,
    pub(crate) next_lsn: RequestId,
}

impl ProposerEngine {
    pub fn new(num_workers: usize) -> ProposerEngine {
        ProposerEngine {
            workers: (0..num_workers).map(|_| WorkerState::Idle).collect(),
            queue: VecDeque::new(),
            next_lsn: 1,
        }
    }
}

impl<C: InstanceCache> Xcom<C> {
    /// Submits a value to the group.
    ///
    /// Reconfigurations are validated against the latest configuration and
    /// rejected synchronously. A `ForceConfig` additionally requires every
    /// forced node to be alive.
    pub fn propose(&mut self, cargo: Cargo, expiry: Tick) -> Result<RequestId, Error> {
        match &self.state {
            XcomState::Run => {}
            XcomState::Terminated(_) => return Err(Error::Exited),
            _ => return Err(Error::NotReady),
        }
        if cargo.is_view() {
            return Err(Error::ConfigRejected(RejectReason::NotConfig));
        }

        let force = matches!(cargo, Cargo::ForceConfig(_));
        if cargo.is_config() {
            let site = self.sites.latest().ok_or(Error::NotReady)?;
            reconfig::validate(&site, &cargo)?;
            if let Cargo::ForceConfig(nodes) = &cargo {
                reconfig::validate_force(&site, nodes, |n| self.is_alive(n))?;
            }
            info!("node {} propose {:?}", self.me, cargo);
        }
        Ok(self.submit(cargo, expiry, force))
    }

    pub(crate) fn submit(&mut self, cargo: Cargo, expiry: Tick, force: bool) -> RequestId {
        let lsn = self.proposer.next_lsn;
        self.proposer.next_lsn += 1;
        let data = AppData {
            origin: self.me.uuid,
            lsn,
            expiry,
            cargo,
        };
        self.proposer.queue.push_back((data, force));
        lsn
    }

    pub(crate) fn run_proposers(&mut self) -> bool {
        let mut progressed = false;
        for idx in 0..self.proposer.workers.len() {
            while self.state.is_active() && self.poll_worker(idx) {
                progressed = true;
            }
        }
        progressed
    }

    fn poll_worker(&mut self, idx: usize) -> bool {
        let state = std::mem::replace(&mut self.proposer.workers[idx], WorkerState::Idle);
        let (next, progressed) = match state {
            WorkerState::Idle => self.poll_idle(),
            WorkerState::Reserving {
                batch,
                since,
                requested_at,
            } => self.poll_reserving(batch, since, requested_at),
            WorkerState::Pushing {
                batch,
                synode,
                mine,
                rv,
                deadline,
                timeout,
                retries,
            } => self.poll_pushing(batch, synode, mine, rv, deadline, timeout, retries),
        };
        self.proposer.workers[idx] = next;
        progressed
    }

    fn poll_idle(&mut self) -> (WorkerState, bool) {
        let (first, force) = match self.proposer.queue.pop_front() {
            Some(item) => item,
            None => return (WorkerState::Idle, false),
        };

        let mut batch = Batch {
            items: vec![first],
            force,
        };
        if batch.items[0].cargo.is_app() {
            let mut bytes = batch.bytes();
            while batch.items.len() < self.option.max_batch_count {
                let fits = match self.proposer.queue.front() {
                    Some((data, false)) => {
                        data.cargo.is_app() && bytes + data.cargo.size() <= self.option.max_batch_bytes
                    }
                    _ => false,
                };
                if !fits {
                    break;
                }
                if let Some((data, _)) = self.proposer.queue.pop_front() {
                    bytes += data.cargo.size();
                    batch.items.push(data);
                }
            }
        }

        trace!("node {} batch {} values", self.me, batch.items.len());
        let state = WorkerState::Reserving {
            batch,
            since: self.now,
            requested_at: None,
        };
        (state, true)
    }

    fn poll_reserving(
        &mut self,
        mut batch: Batch,
        since: Tick,
        requested_at: Option<Tick>,
    ) -> (WorkerState, bool) {
        let now = self.now;
        let (expired, live): (Vec<AppData>, Vec<AppData>) =
            batch.items.into_iter().partition(|d| d.is_expired(now));
        batch.items = live;
        if !expired.is_empty() {
            debug!("node {} drop {} expired values", self.me, expired.len());
            self.fail_requests(expired, Synode::NULL);
        }
        if batch.items.is_empty() {
            return (WorkerState::Idle, true);
        }
        if now >= since + self.option.max_allocation_wait_tick {
            warn!(
                "node {} could not get a synode for {} values in {} ticks",
                self.me,
                batch.items.len(),
                now - since
            );
            self.fail_requests(batch.items, Synode::NULL);
            return (WorkerState::Idle, true);
        }

        match self.reserve_synode(&batch, requested_at) {
            Reservation::Granted(synode, kind) => self.start_push(batch, synode, kind, since),
            Reservation::Wait(requested_at) => {
                let state = WorkerState::Reserving {
                    batch,
                    since,
                    requested_at,
                };
                (state, false)
            }
        }
    }

    fn reserve_synode(&mut self, batch: &Batch, requested_at: Option<Tick>) -> Reservation {
        let executed = self.executor.executed_msg;
        let horizon = self.horizon();
        let too_far = move |s: &Synode| s.sequence >= horizon;

        if !batch.force {
            if let Some((synode, kind)) = self.allocator.take_reserved(&executed, too_far) {
                return Reservation::Granted(synode, kind);
            }
        }

        let site = match self.sites.latest() {
            Some(site) => site,
            None => return Reservation::Wait(requested_at),
        };
        if batch.force {
            // a forced configuration can't wait for the leaders it removes.
            return match self
                .allocator
                .global_allocate(&self.sites, executed, &self.cache, too_far)
            {
                Some(synode) => Reservation::Granted(synode, AllocKind::Global),
                None => Reservation::Wait(requested_at),
            };
        }

        let node = match site.nodeno(&self.me) {
            Some(node) => node,
            None => return Reservation::Wait(requested_at),
        };
        if let Some(synode) =
            self.allocator
                .local_allocate(&self.sites, &self.me, executed, &self.cache, too_far)
        {
            return Reservation::Granted(synode, AllocKind::Local);
        }
        if site.is_active_leader(node) {
            // blocked by the event horizon.
            return Reservation::Wait(requested_at);
        }

        if let Some(at) = requested_at {
            if self.now < at + self.option.synode_request_timeout_tick {
                return Reservation::Wait(requested_at);
            }
        }
        let now = self.now;
        let live_timeout = self.option.detector_live_timeout_tick;
        let detector = &self.detector;
        let leader = self
            .allocator
            .pick_leader(&site, &self.me, |a| detector.is_alive(a, now, live_timeout));
        match leader {
            Some(leader) => {
                trace!("node {} request synode from node {}", self.me, leader);
                self.send_to(&site, leader, PaxMsg::new(Op::SynodeRequest, executed));
                Reservation::Wait(Some(self.now))
            }
            None if self.i_am_the_greatest(&site) => {
                match self
                    .allocator
                    .global_allocate(&self.sites, executed, &self.cache, too_far)
                {
                    Some(synode) => Reservation::Granted(synode, AllocKind::Global),
                    None => Reservation::Wait(requested_at),
                }
            }
            None => Reservation::Wait(requested_at),
        }
    }

    fn start_push(
        &mut self,
        batch: Batch,
        synode: Synode,
        kind: AllocKind,
        since: Tick,
    ) -> (WorkerState, bool) {
        let retry = |batch: Batch| WorkerState::Reserving {
            batch,
            since,
            requested_at: None,
        };
        let site = match self.sites.find(&synode) {
            Some(site) => site,
            None => return (retry(batch), true),
        };
        let node = match site.nodeno(&self.me) {
            Some(node) => node,
            None => return (retry(batch), true),
        };

        let mut payload = Vec::new();
        if payload.try_reserve_exact(batch.items.len()).is_err() {
            error!("node {} out of memory when building synode {}", self.me, synode);
            self.transition(XcomEvent::Fatal("out of memory".to_owned()));
            return (WorkerState::Idle, true);
        }
        payload.extend(batch.items.iter().cloned());
        let mut value = PaxMsg::new(Op::Accept, synode);
        value.payload = payload;
        value.force_delivery = batch.force;
        let mine = Arc::new(value);

        let first = match self.cache.get_or_create(synode) {
            Err(_) => {
                self.allocator.return_grant(synode, kind);
                return (retry(batch), false);
            }
            Ok(p) => {
                if p.is_finished() || !p.try_lock() {
                    None
                } else {
                    p.force_delivery = batch.force;
                    let two_phase = kind.is_two_phase()
                        && !batch.force
                        && p.acceptor.promise == Ballot::INITIAL
                        && p.acceptor.accepted.is_none();
                    let msg = if two_phase {
                        p.push_2p(mine.clone(), node)
                    } else {
                        p.push_3p(mine.clone(), node)
                    };
                    Some((msg, p.rv()))
                }
            }
        };

        let (msg, rv) = match first {
            Some(first) => first,
            None => return (retry(batch), true),
        };
        debug!(
            "node {} push {} values at synode {} with {} ({:?})",
            self.me,
            batch.items.len(),
            synode,
            msg.proposal,
            kind
        );
        self.broadcast(&site, msg);
        let timeout = self.option.base_propose_timeout_tick;
        let state = WorkerState::Pushing {
            batch,
            synode,
            mine,
            rv,
            deadline: self.now + generate_timeout_tick(timeout),
            timeout,
            retries: 0,
        };
        (state, true)
    }

    fn poll_pushing(
        &mut self,
        batch: Batch,
        synode: Synode,
        mine: Arc<PaxMsg>,
        rv: u64,
        deadline: Tick,
        timeout: Tick,
        retries: u32,
    ) -> (WorkerState, bool) {
        let learned = match self.cache.try_get_mut(&synode) {
            Some(p) if p.rv() == rv => None,
            Some(p) => {
                p.unlock();
                p.learner.learned.clone()
            }
            None => {
                warn!("node {} synode {} is gone while pushing", self.me, synode);
                let state = WorkerState::Reserving {
                    batch,
                    since: self.now,
                    requested_at: None,
                };
                return (state, true);
            }
        };

        if let Some(learned) = learned {
            if learned.same_value(&mine) {
                trace!("node {} synode {} is decided with my value", self.me, synode);
                return (WorkerState::Idle, true);
            }
            info!(
                "node {} synode {} is decided with another value, retry",
                self.me, synode
            );
            let state = WorkerState::Reserving {
                batch,
                since: self.now,
                requested_at: None,
            };
            return (state, true);
        }

        if self.now < deadline {
            let state = WorkerState::Pushing {
                batch,
                synode,
                mine,
                rv,
                deadline,
                timeout,
                retries,
            };
            return (state, false);
        }

        if retries >= self.option.max_propose_retries {
            warn!(
                "node {} synode {} give up after {} retries",
                self.me, synode, retries
            );
            if let Some(p) = self.cache.try_get_mut(&synode) {
                p.unlock();
            }
            self.push_noop(synode);
            self.fail_requests(batch.items, synode);
            return (WorkerState::Idle, true);
        }

        let site = self.sites.find(&synode);
        let node = site.as_ref().and_then(|s| s.nodeno(&self.me));
        let prepare = match (node, self.cache.try_get_mut(&synode)) {
            (Some(node), Some(p)) => Some(p.push_3p(mine.clone(), node)),
            _ => None,
        };
        if let (Some(site), Some(prepare)) = (site, prepare) {
            debug!(
                "node {} synode {} retry with {}",
                self.me, synode, prepare.proposal
            );
            self.broadcast(&site, prepare);
        }

        let timeout = std::cmp::min(timeout * 2, self.option.max_propose_timeout_tick);
        let state = WorkerState::Pushing {
            batch,
            synode,
            mine,
            rv,
            deadline: self.now + generate_timeout_tick(timeout),
            timeout,
            retries: retries + 1,
        };
        (state, true)
    }

    /// Pushes a no-op at `synode` with a fresh ballot, unless a worker holds
    /// the instance or the value is known.
    pub(crate) fn push_noop(&mut self, synode: Synode) {
        let site = match self.sites.find(&synode) {
            Some(site) => site,
            None => return,
        };
        let node = match site.nodeno(&self.me) {
            Some(node) => node,
            None => return,
        };
        let prepare = match self.cache.get_or_create(synode) {
            Ok(p) if !p.is_finished() && !p.is_locked() => {
                p.push_3p(Arc::new(PaxMsg::noop(synode)), node)
            }
            _ => return,
        };
        debug!(
            "node {} push no-op at synode {} with {}",
            self.me, synode, prepare.proposal
        );
        self.broadcast(&site, prepare);
    }

    fn fail_requests(&mut self, items: Vec<AppData>, synode: Synode) {
        for data in items {
            if data.cargo.is_view() {
                continue;
            }
            self.ready.failures.push(FailedRequest { synode, data });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::site_def::SiteDef;
    use crate::sim::*;

    #[test]
    fn batching_respects_limits() {
        setup_logger();
        let mut option = test_option(5);
        option.max_batch_count = 3;
        option.proposer_workers = 1;
        let mut cluster = Cluster::new(1, option);
        for i in 0..7u8 {
            cluster.propose(0, &[i]).unwrap();
        }
        cluster.run(3);
        let delivered = cluster.delivered(0);
        assert_eq!(delivered.len(), 7);
        let synodes = delivered.iter().map(|d| d.synode.sequence).collect::<Vec<_>>();
        assert_eq!(synodes, vec![1, 1, 1, 2, 2, 2, 3]);
        let lsns = delivered.iter().map(|d| d.lsn).collect::<Vec<_>>();
        assert_eq!(lsns, vec![1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn config_is_never_batched() {
        setup_logger();
        let mut cluster = Cluster::new(1, test_option(5));
        cluster.propose(0, b"a").unwrap();
        cluster.nodes[0].propose(Cargo::SetEventHorizon(8), 0).unwrap();
        cluster.propose(0, b"b").unwrap();
        cluster.run(3);
        let delivered = cluster.delivered(0);
        assert_eq!(delivered.len(), 2);
        assert_eq!(delivered[0].synode.sequence, 1);
        assert_eq!(delivered[1].synode.sequence, 3);
    }

    #[test]
    fn synchronous_rejections() {
        setup_logger();
        let mut cluster = Cluster::new(3, test_option(5));
        let node = &mut cluster.nodes[0];
        assert!(matches!(
            node.propose(Cargo::AddNode(vec![addr(1)]), 0),
            Err(Error::ConfigRejected(RejectReason::AlreadyMember))
        ));
        assert!(matches!(
            node.propose(Cargo::SetEventHorizon(0), 0),
            Err(Error::ConfigRejected(RejectReason::EventHorizonOutOfRange))
        ));
        assert!(matches!(
            node.propose(Cargo::View(NodeSet::full(3)), 0),
            Err(Error::ConfigRejected(RejectReason::NotConfig))
        ));
        node.notify_connection_lost(&addr(2));
        assert!(matches!(
            node.propose(Cargo::ForceConfig(vec![addr(0), addr(2)]), 0),
            Err(Error::ConfigRejected(RejectReason::SuspectedDead))
        ));
        node.notify_alive(&addr(2));
        assert!(node.propose(Cargo::ForceConfig(vec![addr(0), addr(2)]), 0).is_ok());
    }

    #[test]
    fn expired_values_fail() {
        setup_logger();
        let mut option = test_option(5);
        option.proposer_workers = 1;
        option.max_propose_retries = 1;
        option.max_propose_timeout_tick = 4;
        let mut cluster = Cluster::new(3, option);
        cluster.isolate(1);
        cluster.isolate(2);
        // the only worker is busy pushing `late` while `x` expires.
        let late = cluster.nodes[0].propose(Cargo::App(b"late".to_vec()), 0).unwrap();
        let expiring = cluster.nodes[0].propose(Cargo::App(b"x".to_vec()), 2).unwrap();
        cluster.run(60);

        let failures = cluster.failures(0);
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0].data.lsn, late);
        assert_eq!(failures[0].synode, Synode::new(GROUP, 1, 0));
        assert_eq!(failures[1].data.lsn, expiring);
        assert!(failures[1].synode.is_null());
        assert!(cluster.delivered(0).is_empty());
    }

    #[test]
    fn push_gives_up_without_majority() {
        setup_logger();
        let mut option = test_option(5);
        option.max_propose_retries = 2;
        option.max_propose_timeout_tick = 4;
        let mut cluster = Cluster::new(3, option);
        cluster.isolate(1);
        cluster.isolate(2);
        let lsn = cluster.propose(0, b"lost").unwrap();
        cluster.run(60);
        let failures = cluster.failures(0);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].data.lsn, lsn);
        assert_eq!(failures[0].synode, Synode::new(GROUP, 1, 0));
        assert!(cluster.delivered(0).is_empty());
    }

    #[test]
    fn decided_slot_is_not_allocated_again() {
        setup_logger();
        let mut cluster = Cluster::new(3, test_option(5));
        // node 1 decides a no-op at the next slot of node 0.
        let target = Synode::new(GROUP, 1, 0);
        cluster.nodes[1].push_noop(target);
        cluster.pump();
        assert!(cluster.nodes[0].cache.is_learned(&target));

        let lsn = cluster.propose(0, b"mine").unwrap();
        cluster.run(10);
        let delivered = cluster.delivered(0);
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].lsn, lsn);
        assert!(delivered[0].synode > target);
        assert_eq!(delivered, cluster.delivered(1));
    }

    #[test]
    fn lost_race_after_accept_retries() {
        setup_logger();
        let mut cluster = Cluster::new(3, test_option(5));
        cluster.isolate(0);
        let lsn = cluster.propose(0, b"mine").unwrap();
        cluster.run(1);
        // node 0 accepted its own value alone, the others decide a no-op.
        let target = Synode::new(GROUP, 1, 0);
        cluster.nodes[1].push_noop(target);
        cluster.pump();
        assert!(cluster.nodes[1].cache.is_learned(&target));

        cluster.heal(0);
        cluster.run(100);
        let delivered = cluster.delivered(0);
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].lsn, lsn);
        assert!(delivered[0].synode > target);
        assert!(cluster.failures(0).is_empty());
    }

    #[test]
    fn conflicting_values_at_one_synode() {
        setup_logger();
        let mut cluster = Cluster::new(3, test_option(5));
        // both nodes believe they hold the slot of node 2.
        let target = Synode::new(GROUP, 1, 2);
        cluster.nodes[0].allocator.push_grant(target, AllocKind::Global);
        cluster.nodes[1].allocator.push_grant(target, AllocKind::Global);
        cluster.propose(0, b"zero").unwrap();
        cluster.propose(1, b"one").unwrap();
        cluster.pump();
        cluster.run(50);

        let delivered = cluster.delivered(0);
        assert_eq!(delivered.len(), 2);
        assert_eq!(delivered[0].synode, target);
        assert!(delivered[1].synode > target);
        let mut payloads = delivered.iter().map(|d| d.payload.clone()).collect::<Vec<_>>();
        payloads.sort();
        assert_eq!(payloads, vec![b"one".to_vec(), b"zero".to_vec()]);

        // the loser moved to its own stream.
        let loser = if delivered[1].payload == b"zero".to_vec() { 0 } else { 1 };
        assert_eq!(delivered[1].synode.node, loser);
        for node in 0..3 {
            assert_eq!(cluster.delivered(node), delivered);
            assert!(cluster.failures(node).is_empty());
        }
    }

    #[test]
    fn single_leader_grants_synodes() {
        setup_logger();
        let option = test_option(5);
        let mut site = SiteDef::boot(Synode::new(GROUP, 1, 0), (0..3).map(addr).collect(), 5);
        site.max_active_leaders = 1;
        site.leaders = vec![addr(0)];
        site.analyze_leaders();
        let mut cluster = Cluster::with_site(site, option);

        for round in 0..3u8 {
            for node in 0..3 {
                cluster.propose(node, &[node as u8, round]).unwrap();
            }
            cluster.run(3);
        }
        cluster.run(100);

        let delivered = cluster.delivered(0);
        assert_eq!(delivered.len(), 9);
        assert!(delivered.iter().all(|d| d.synode.node == 0));
        for node in 1..3 {
            assert_eq!(cluster.delivered(node), delivered);
            assert!(cluster.nodes[node].allocator.last_local().is_null());
        }
    }

    #[test]
    fn greatest_node_allocates_globally_without_leader() {
        setup_logger();
        let option = test_option(5);
        let mut site = SiteDef::boot(Synode::new(GROUP, 1, 0), (0..3).map(addr).collect(), 5);
        site.max_active_leaders = 1;
        site.leaders = vec![addr(2)];
        site.analyze_leaders();
        let mut cluster = Cluster::with_site(site, option);
        cluster.nodes[0].notify_connection_lost(&addr(2));
        cluster.isolate(2);
        cluster.propose(0, b"g").unwrap();
        cluster.run(10);
        let delivered = cluster.delivered(0);
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].synode.node, 2);
        assert_eq!(delivered, cluster.delivered(1));
    }

    #[test]
    fn cache_pressure_is_transient() {
        setup_logger();
        let mut option = test_option(5);
        option.log_retention = 1;
        let mut cluster = Cluster::with_cache(1, option, 2);
        for i in 0..6u8 {
            cluster.propose(0, &[i]).unwrap();
            cluster.run(1);
        }
        cluster.run(10);
        assert_eq!(cluster.delivered(0).len(), 6);
        assert!(cluster.nodes[0].cache.len() <= 2);
    }
}
