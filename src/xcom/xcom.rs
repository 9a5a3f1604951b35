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

use chrono::prelude::*;
use log::{debug, error, info, trace, warn};
use rand::{thread_rng, RngCore};
use serde::{Deserialize, Serialize};

use crate::acceptor::{self, DispatchTable, Outgoing, Target};
use crate::allocator::{AllocKind, SlotAllocator};
use crate::cache::InstanceCache;
use crate::constant::*;
use crate::detector::Detector;
use crate::error::Error;
use crate::executor::Executor;
use crate::proposer::ProposerEngine;
use crate::site_def::{SiteDef, SiteDefs};
use crate::synode::{GroupId, NodeNo, Synode};
use crate::types::*;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct XcomOption {
    /// Specify the number of proposer workers, each worker pushes one batch
    /// of values at a time.
    ///
    /// default: 4
    pub proposer_workers: usize,

    /// Specify the max number of application values batched into a single
    /// synode.
    ///
    /// default: 32
    pub max_batch_count: usize,

    /// Specify the approximately limit of number of bytes of application
    /// values batched into a single synode.
    ///
    /// default: 1MB
    pub max_batch_bytes: usize,

    /// Specify the event horizon of a booted group.
    ///
    /// default: 10
    pub event_horizon: u32,

    /// Specify the max number of Paxos instances kept by the default cache.
    ///
    /// default: 10000
    pub cache_capacity: usize,

    /// Specify the number of executed sequences kept to serve reads of
    /// lagging nodes.
    ///
    /// default: 1000
    pub log_retention: u64,

    /// Specify the base timeout tick of a push, it is doubled on every retry
    /// until `max_propose_timeout_tick`.
    ///
    /// default: 10
    pub base_propose_timeout_tick: u64,

    /// default: 100
    pub max_propose_timeout_tick: u64,

    /// Specify the number of retries before a worker pushes a no-op for its
    /// slot and reports a delivery failure.
    ///
    /// default: 5
    pub max_propose_retries: u32,

    /// Specify the ticks to wait for a synode requested from a leader before
    /// asking again.
    ///
    /// default: 10
    pub synode_request_timeout_tick: u64,

    /// Specify the ticks a batch may wait for a synode before it is failed.
    ///
    /// default: 300
    pub max_allocation_wait_tick: u64,

    /// Specify the base ticks the executor waits for a missing value before
    /// escalating.
    ///
    /// default: 5
    pub base_fetch_wait_tick: u64,

    /// default: 50
    pub max_fetch_wait_tick: u64,

    /// A node not heard within this many ticks is suspected dead.
    ///
    /// default: 50
    pub detector_live_timeout_tick: u64,

    /// default: 5
    pub heartbeat_interval_tick: u64,

    /// Specify the min ticks between two views proposed by the local node.
    ///
    /// default: 20
    pub view_interval_tick: u64,
}

impl Default for XcomOption {
    fn default() -> XcomOption {
        XcomOption {
            proposer_workers: 4,
            max_batch_count: 32,
            max_batch_bytes: 1024 * 1024,
            event_horizon: EVENT_HORIZON_DEFAULT,
            cache_capacity: 10000,
            log_retention: 1000,
            base_propose_timeout_tick: 10,
            max_propose_timeout_tick: 100,
            max_propose_retries: 5,
            synode_request_timeout_tick: 10,
            max_allocation_wait_tick: 300,
            base_fetch_wait_tick: 5,
            max_fetch_wait_tick: 50,
            detector_live_timeout_tick: 50,
            heartbeat_interval_tick: 5,
            view_interval_tick: 20,
        }
    }
}

impl XcomOption {
    /// Parses options from JSON, missing fields take their default value.
    pub fn from_json(json: &str) -> Result<XcomOption, Error> {
        Ok(serde_json::from_str(json)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminateReason {
    /// The node was removed from the group and reached its exit synode.
    Removed,
    /// The node needs values nobody keeps any more, it must restart from a
    /// snapshot.
    TooFarBehind,
    Fatal(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XcomState {
    Start,
    Run,
    /// Removed from the group, still executing until the exit synode.
    Exiting(Synode),
    Terminated(TerminateReason),
}

#[derive(Debug, Clone)]
pub(crate) enum XcomEvent {
    Boot,
    Removed(Synode),
    ExitReached,
    Die,
    Fatal(String),
}

impl XcomState {
    pub(crate) fn transition(self, event: XcomEvent) -> XcomState {
        match (self, event) {
            (XcomState::Terminated(reason), _) => XcomState::Terminated(reason),
            (_, XcomEvent::Fatal(msg)) => XcomState::Terminated(TerminateReason::Fatal(msg)),
            (XcomState::Start, XcomEvent::Die) => XcomState::Start,
            (_, XcomEvent::Die) => XcomState::Terminated(TerminateReason::TooFarBehind),
            (XcomState::Start, XcomEvent::Boot) => XcomState::Run,
            (XcomState::Run, XcomEvent::Removed(exit)) => XcomState::Exiting(exit),
            (XcomState::Exiting(_), XcomEvent::ExitReached) => {
                XcomState::Terminated(TerminateReason::Removed)
            }
            (state, event) => {
                debug!("ignore event {:?} in state {:?}", event, state);
                state
            }
        }
    }

    /// Running nodes take part in the protocol.
    pub fn is_active(&self) -> bool {
        matches!(self, XcomState::Run | XcomState::Exiting(_))
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self, XcomState::Terminated(_))
    }
}

/// The output of `Xcom::advance`.
#[derive(Debug, Default)]
pub struct Ready {
    /// Messages to send to remote nodes.
    pub msgs: Vec<Envelope>,

    /// Decided values, in synode order.
    pub deliveries: Vec<Delivery>,

    /// Values proposed by the local node which could not be delivered.
    pub failures: Vec<FailedRequest>,

    /// Configurations installed since the last `advance`.
    pub installed: Vec<Arc<SiteDef>>,
}

#[inline(always)]
pub(crate) fn generate_timeout_tick(base: Tick) -> Tick {
    let base = std::cmp::max(base, 1);
    base + thread_rng().next_u64() % std::cmp::max(base / 2, 1)
}

/// A node of a group. `Xcom` does no IO and keeps no clock: received
/// messages are fed with `step`, time with `tick`, and the output is taken
/// with `advance`.
pub struct Xcom<C: InstanceCache> {
    pub(crate) option: XcomOption,
    pub(crate) me: NodeAddress,
    pub(crate) group_id: GroupId,
    pub(crate) state: XcomState,
    pub(crate) now: Tick,

    pub(crate) sites: SiteDefs,
    pub(crate) cache: C,
    pub(crate) allocator: SlotAllocator,
    pub(crate) proposer: ProposerEngine,
    pub(crate) executor: Executor,
    pub(crate) detector: Detector,

    /// The highest synode known to be in use, the executor only waits for
    /// values below it.
    pub(crate) max_synode: Synode,

    /// Nodes removed by executed configurations, they are told about the
    /// progress until their exit synode.
    pub(crate) removed: Vec<(NodeAddress, Synode)>,

    pub(crate) loopback: VecDeque<PaxMsg>,
    pub(crate) last_heartbeat_at: Tick,
    pub(crate) last_view_at: Option<Tick>,
    pub(crate) ready: Ready,
}

impl<C: InstanceCache> Xcom<C> {
    pub fn new(option: XcomOption, me: NodeAddress, cache: C) -> Xcom<C> {
        let workers = std::cmp::max(option.proposer_workers, 1);
        Xcom {
            option,
            me,
            group_id: 0,
            state: XcomState::Start,
            now: 0,
            sites: SiteDefs::new(),
            cache,
            allocator: SlotAllocator::new(),
            proposer: ProposerEngine::new(workers),
            executor: Executor::new(),
            detector: Detector::new(),
            max_synode: Synode::NULL,
            removed: Vec::new(),
            loopback: VecDeque::new(),
            last_heartbeat_at: 0,
            last_view_at: None,
            ready: Ready::default(),
        }
    }

    /// Boots a new group with `site` as its first configuration.
    pub fn boot(&mut self, site: SiteDef) -> Result<(), Error> {
        if self.state != XcomState::Start {
            return Err(Error::NotReady);
        }
        if site.nodes.is_empty() {
            return Err(Error::NoNodes);
        }
        if !site.is_member(&self.me) {
            return Err(Error::NotMember);
        }

        info!(
            "node {} boot group {} at synode {} with {} nodes",
            self.me,
            site.start.group,
            site.start,
            site.max_nodes()
        );
        self.group_id = site.start.group;
        self.executor.executed_msg = site.start;
        self.max_synode = site.start;
        self.note_members_alive(&site);
        let site = self.sites.install(site);
        self.ready.installed.push(site);
        self.transition(XcomEvent::Boot);
        Ok(())
    }

    /// Exports the configurations and log window of the local node, a new
    /// node can join with it.
    pub fn export_state(&self) -> Snapshot {
        Snapshot {
            log_start: self.cache.low_water(),
            log_end: self.executor.executed_msg,
            configs: self.sites.to_vec(),
            taken_at: Local::now().timestamp_nanos_opt().unwrap_or_default(),
        }
    }

    /// Boots the local node from a snapshot exported by a member. The
    /// application state up to `log_end` is expected to be transferred by
    /// the application itself.
    pub fn import_state(&mut self, snapshot: Snapshot) -> Result<(), Error> {
        if self.state != XcomState::Start {
            return Err(Error::NotReady);
        }
        if snapshot.configs.is_empty() {
            return Err(Error::NoNodes);
        }
        let first = snapshot
            .configs
            .iter()
            .find(|s| s.is_member(&self.me))
            .cloned()
            .ok_or(Error::NotMember)?;

        let mut executed = snapshot.log_end;
        if executed < first.start {
            // values before the first configuration including the local
            // node are never executed here.
            executed = first.start;
        }

        info!(
            "node {} import snapshot [{}, {}), {} configs, execute from {}",
            self.me,
            snapshot.log_start,
            snapshot.log_end,
            snapshot.configs.len(),
            executed
        );
        self.group_id = first.start.group;
        for site in snapshot.configs {
            let site = self.sites.install(site);
            self.ready.installed.push(site);
        }
        if let Some(latest) = self.sites.latest() {
            self.note_members_alive(&latest);
        }
        self.cache.release_until(executed);
        self.executor.executed_msg = executed;
        self.max_synode = executed;
        self.transition(XcomEvent::Boot);
        Ok(())
    }

    /// Feeds a message received from the network.
    pub fn step(&mut self, msg: PaxMsg) {
        if !self.state.is_active() {
            trace!("node {} drop {:?} in state {:?}", self.me, msg, self.state);
            return;
        }
        self.dispatch_message(msg);
    }

    /// Advances the logical clock by one tick.
    pub fn tick(&mut self) {
        self.now += 1;
        if !self.state.is_active() {
            return;
        }

        if self.now >= self.last_heartbeat_at + self.option.heartbeat_interval_tick {
            self.last_heartbeat_at = self.now;
            self.heartbeat();
        }
        if self.state == XcomState::Run {
            self.maybe_propose_view();
        }
    }

    /// Runs every task until none of them makes progress, and returns the
    /// output produced since the last call.
    pub fn advance(&mut self) -> Ready {
        for _ in 0..MAX_ADVANCE_ROUNDS {
            let mut progressed = false;
            while let Some(msg) = self.loopback.pop_front() {
                self.dispatch_message(msg);
                progressed = true;
            }
            if self.state.is_active() {
                progressed |= self.run_proposers();
            }
            if self.state.is_active() {
                progressed |= self.run_executor();
            }
            if !progressed && self.loopback.is_empty() {
                break;
            }
        }
        std::mem::take(&mut self.ready)
    }

    /// The transport lost the connection to `node`.
    pub fn notify_connection_lost(&mut self, node: &NodeAddress) {
        self.detector.note_dead(node);
    }

    /// The transport heard from `node`.
    pub fn notify_alive(&mut self, node: &NodeAddress) {
        self.detector.note_alive(node, self.now);
    }

    /// The configuration governing the next synode to execute.
    pub fn get_active_config(&self) -> Option<Arc<SiteDef>> {
        self.sites.find(&self.executor.executed_msg)
    }

    /// The latest installed configuration, it might not be active yet.
    pub fn get_latest_config(&self) -> Option<Arc<SiteDef>> {
        self.sites.latest()
    }

    /// Every synode before it has been executed.
    pub fn executed_msg(&self) -> Synode {
        self.executor.executed_msg
    }

    pub fn state(&self) -> &XcomState {
        &self.state
    }

    pub fn address(&self) -> &NodeAddress {
        &self.me
    }

    pub fn now(&self) -> Tick {
        self.now
    }

    pub(crate) fn transition(&mut self, event: XcomEvent) {
        let prev = std::mem::replace(&mut self.state, XcomState::Start);
        let next = prev.clone().transition(event);
        if prev != next {
            info!("node {} state {:?} => {:?}", self.me, prev, next);
        }
        self.state = next;
    }

    pub(crate) fn note_members_alive(&mut self, site: &SiteDef) {
        for node in &site.nodes {
            self.detector.note_alive(node, self.now);
        }
    }

    pub(crate) fn is_alive(&self, node: &NodeAddress) -> bool {
        node.same_node(&self.me)
            || self
                .detector
                .is_alive(node, self.now, self.option.detector_live_timeout_tick)
    }

    /// The lowest numbered live member acts on behalf of the group when no
    /// leader can be reached.
    pub(crate) fn i_am_the_greatest(&self, site: &SiteDef) -> bool {
        let first_alive = (0..site.max_nodes()).find(|n| {
            site.address(*n)
                .map(|a| self.is_alive(a))
                .unwrap_or(false)
        });
        first_alive.is_some() && first_alive == site.nodeno(&self.me)
    }

    /// Synodes at or beyond this sequence are not admitted.
    pub(crate) fn horizon(&self) -> u64 {
        let executed = self.executor.executed_msg;
        let active = self.sites.find(&executed);
        let latest = self.sites.latest();
        let event_horizon = match (active, latest) {
            (Some(a), Some(l)) => std::cmp::min(a.event_horizon, l.event_horizon),
            (Some(s), None) | (None, Some(s)) => s.event_horizon,
            (None, None) => 0,
        };
        executed.sequence + event_horizon as u64
    }

    pub(crate) fn too_far(&self, synode: &Synode) -> bool {
        synode.sequence >= self.horizon()
    }

    /// The configuration which numbers the sender and receiver of `op`.
    pub(crate) fn governing_site(&self, op: Op, synode: &Synode) -> Option<Arc<SiteDef>> {
        if op.is_control() {
            self.sites.latest()
        } else {
            self.sites.find(synode)
        }
    }

    fn send_to_address(&mut self, to_addr: &NodeAddress, from: NodeNo, to: NodeNo, mut msg: PaxMsg) {
        msg.from = from;
        msg.to = to;
        msg.sender = self.me.clone();
        msg.group_id = self.group_id;
        msg.delivered_msg = self.executor.executed_msg;
        if to_addr.same_node(&self.me) {
            self.loopback.push_back(msg);
        } else {
            trace!("node {} send {:?} to {}", self.me, msg, to_addr);
            self.ready.msgs.push(Envelope {
                to: to_addr.clone(),
                msg,
            });
        }
    }

    pub(crate) fn send_to(&mut self, site: &SiteDef, to: NodeNo, msg: PaxMsg) {
        let to_addr = match site.address(to) {
            Some(addr) => addr.clone(),
            None => {
                warn!("node {} send {:?} to unknown node {}", self.me, msg, to);
                return;
            }
        };
        let from = site.nodeno(&self.me).unwrap_or(VOID_NODE_NO);
        self.send_to_address(&to_addr, from, to, msg);
    }

    pub(crate) fn broadcast(&mut self, site: &SiteDef, msg: PaxMsg) {
        for to in 0..site.max_nodes() {
            self.send_to(site, to, msg.clone());
        }
    }

    /// Like `broadcast`, but the local node is left out.
    pub(crate) fn broadcast_others(&mut self, site: &SiteDef, msg: PaxMsg) {
        for to in 0..site.max_nodes() {
            if site.address(to).map(|a| a.same_node(&self.me)).unwrap_or(true) {
                continue;
            }
            self.send_to(site, to, msg.clone());
        }
    }

    /// Replies to the sender of `request`, which isn't necessarily a member
    /// of the configuration governing it.
    fn reply(&mut self, request: &PaxMsg, msg: PaxMsg) {
        let from = self
            .governing_site(msg.op, &request.synode)
            .and_then(|site| site.nodeno(&self.me))
            .unwrap_or(VOID_NODE_NO);
        let to_addr = request.sender.clone();
        self.send_to_address(&to_addr, from, request.from, msg);
    }

    fn route(&mut self, site: &SiteDef, request: &PaxMsg, out: Outgoing) {
        match out.target {
            Target::Reply => self.reply(request, out.msg),
            Target::All => self.broadcast(site, out.msg),
        }
    }

    fn dispatch_message(&mut self, msg: PaxMsg) {
        if msg.group_id != self.group_id {
            debug!(
                "node {} drop msg of group {}, expect {}",
                self.me, msg.group_id, self.group_id
            );
            return;
        }
        if !msg.sender.same_node(&self.me) {
            self.detector.note_alive(&msg.sender, self.now);
        }
        if msg.delivered_msg > self.max_synode {
            self.max_synode = msg.delivered_msg;
        }

        let table = self
            .sites
            .latest()
            .map(|site| DispatchTable::for_site(&site, &self.me))
            .unwrap_or(DispatchTable::Secondary);
        if !table.serves(msg.op) {
            trace!("node {} {:?} table drop {:?}", self.me, table, msg);
            return;
        }

        match msg.op {
            Op::IAmAlive => {}
            Op::Die => self.handle_die(&msg),
            Op::SynodeRequest => self.handle_synode_request(&msg),
            Op::SynodeAllocated => self.handle_synode_allocated(&msg),
            Op::Read => self.handle_read(&msg),
            Op::Prepare
            | Op::AckPrepare
            | Op::AckPrepareEmpty
            | Op::Accept
            | Op::AckAccept
            | Op::Learn
            | Op::TinyLearn
            | Op::Skip => self.dispatch_paxos(msg),
        }
    }

    fn dispatch_paxos(&mut self, msg: PaxMsg) {
        if msg.synode > self.max_synode {
            self.max_synode = msg.synode;
        }
        if self.too_far(&msg.synode) {
            trace!(
                "node {} synode {} is too far, executed {}",
                self.me,
                msg.synode,
                self.executor.executed_msg
            );
            return;
        }
        let site = match self.sites.find(&msg.synode) {
            Some(site) => site,
            None => return,
        };
        if msg.synode < self.cache.low_water() && self.cache.try_get(&msg.synode).is_none() {
            // the slot was decided and released, never start it again.
            if matches!(msg.op, Op::Prepare | Op::Accept) {
                self.reply(&msg, PaxMsg::new(Op::Die, msg.synode));
            }
            return;
        }

        let learner_op = matches!(msg.op, Op::Learn | Op::TinyLearn);
        if !learner_op {
            if !acceptor::is_participant(&site, msg.from, &msg.sender) {
                debug!(
                    "node {} synode {} drop {} from non member {}",
                    self.me, msg.synode, msg.op, msg.sender
                );
                return;
            }
            if site.nodeno(&self.me).is_none() {
                return;
            }
            if msg.op == Op::Skip && msg.from != msg.synode.node {
                return;
            }
        }
        if site.ignore_message(&msg.synode) && !msg.force_delivery {
            trace!("node {} synode {} is ignored", self.me, msg.synode);
            return;
        }

        let outgoing = {
            let p = match self.cache.get_or_create(msg.synode) {
                Ok(p) => p,
                Err(err) => {
                    debug!("node {} synode {} drop {}: {}", self.me, msg.synode, msg.op, err);
                    return;
                }
            };
            match msg.op {
                Op::Prepare => acceptor::handle_prepare(p, &msg),
                Op::Accept => acceptor::handle_accept(p, &msg),
                Op::AckPrepare | Op::AckPrepareEmpty => acceptor::handle_ack_prepare(p, &msg, &site),
                Op::AckAccept => acceptor::handle_ack_accept(p, &msg, &site),
                Op::TinyLearn => acceptor::handle_tiny_learn(p, &msg),
                Op::Learn => {
                    acceptor::handle_learn(p, &msg);
                    None
                }
                Op::Skip => acceptor::handle_skip(p, &msg),
                _ => None,
            }
        };
        if let Some(out) = outgoing {
            self.route(&site, &msg, out);
        }
    }

    fn handle_read(&mut self, msg: &PaxMsg) {
        let out = self.cache.try_get(&msg.synode).and_then(acceptor::handle_read);
        match out {
            Some(out) => self.reply(msg, out.msg),
            None if msg.synode < self.cache.low_water() => {
                info!(
                    "node {} synode {} is below log start {}, tell {} to die",
                    self.me,
                    msg.synode,
                    self.cache.low_water(),
                    msg.sender
                );
                self.reply(msg, PaxMsg::new(Op::Die, msg.synode));
            }
            None => {}
        }
    }

    fn handle_die(&mut self, msg: &PaxMsg) {
        if msg.synode < self.executor.executed_msg {
            return;
        }
        error!(
            "node {} synode {} is lost by {}, executed {}",
            self.me, msg.synode, msg.sender, self.executor.executed_msg
        );
        self.transition(XcomEvent::Die);
    }

    fn handle_synode_request(&mut self, msg: &PaxMsg) {
        let horizon = self.horizon();
        let hint = self.executor.executed_msg;
        let granted = self.allocator.local_allocate(
            &self.sites,
            &self.me,
            hint,
            &self.cache,
            move |s: &Synode| s.sequence >= horizon,
        );
        match granted {
            Some(synode) => {
                debug!("node {} grant synode {} to {}", self.me, synode, msg.sender);
                self.reply(msg, PaxMsg::new(Op::SynodeAllocated, synode));
            }
            None => debug!("node {} has no synode for {}", self.me, msg.sender),
        }
    }

    fn handle_synode_allocated(&mut self, msg: &PaxMsg) {
        if self.state != XcomState::Run {
            return;
        }
        self.allocator.push_grant(msg.synode, AllocKind::Remote);
    }

    fn heartbeat(&mut self) {
        let site = match self.sites.latest() {
            Some(site) => site,
            None => return,
        };
        let msg = PaxMsg::new(Op::IAmAlive, self.executor.executed_msg);
        self.broadcast_others(&site, msg.clone());

        let executed = self.executor.executed_msg;
        self.removed.retain(|(_, exit)| executed <= *exit);
        let from = site.nodeno(&self.me).unwrap_or(VOID_NODE_NO);
        for (node, _) in self.removed.clone() {
            self.send_to_address(&node, from, VOID_NODE_NO, msg.clone());
        }
    }

    fn maybe_propose_view(&mut self) {
        let site = match self.sites.latest() {
            Some(site) => site,
            None => return,
        };
        if !site.is_member(&self.me) {
            return;
        }
        let local = self.detector.local_node_set(
            &site,
            &self.me,
            self.now,
            self.option.detector_live_timeout_tick,
        );
        if local == site.global_node_set {
            return;
        }
        if let Some(at) = self.last_view_at {
            if self.now < at + self.option.view_interval_tick {
                return;
            }
        }

        info!(
            "node {} propose view {:?}, agreed {:?}",
            self.me,
            local.iter().collect::<Vec<_>>(),
            site.global_node_set.iter().collect::<Vec<_>>()
        );
        self.last_view_at = Some(self.now);
        // a view which can't get a slot soon is stale.
        let expiry = self.now + self.option.view_interval_tick;
        self.submit(Cargo::View(local), expiry, false);
    }
}
