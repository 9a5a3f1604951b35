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

//! Handlers of the acceptor and learner roles, and of the proposer role
//! reacting to acks. Each handler updates a single `PaxosInstance` and
//! returns the message to send, the runtime routes it.

use std::sync::Arc;

use log::{debug, trace};

use crate::instance::PaxosInstance;
use crate::site_def::SiteDef;
use crate::synode::{Ballot, NodeNo};
use crate::types::{NodeAddress, NodeSet, Op, PaxMsg};

/// Where a reply goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// The sender of the handled message.
    Reply,
    /// Every member of the configuration governing the synode.
    All,
}

#[derive(Debug, Clone)]
pub struct Outgoing {
    pub target: Target,
    pub msg: PaxMsg,
}

impl Outgoing {
    fn reply(msg: PaxMsg) -> Option<Outgoing> {
        Some(Outgoing {
            target: Target::Reply,
            msg,
        })
    }

    fn all(msg: PaxMsg) -> Option<Outgoing> {
        Some(Outgoing {
            target: Target::All,
            msg,
        })
    }
}

/// The opcodes a node serves depend on whether it is an active leader: only
/// leaders grant synodes to other nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchTable {
    Primary,
    Secondary,
}

impl DispatchTable {
    pub fn for_site(site: &SiteDef, me: &NodeAddress) -> DispatchTable {
        match site.nodeno(me) {
            Some(n) if site.is_active_leader(n) => DispatchTable::Primary,
            _ => DispatchTable::Secondary,
        }
    }

    pub fn serves(&self, op: Op) -> bool {
        match op {
            Op::SynodeRequest => *self == DispatchTable::Primary,
            _ => true,
        }
    }
}

/// Returns whether the acked nodes form a quorum. A forced value needs the
/// ack of every forced node, anything else a majority of the configuration.
pub fn quorum_reached(site: &SiteDef, acked: &NodeSet, forced: Option<&[NodeAddress]>) -> bool {
    match forced {
        Some(nodes) => nodes.iter().all(|node| {
            site.nodeno(node)
                .map(|n| acked.contains(n))
                .unwrap_or(false)
        }),
        None => site.is_quorum(acked.count()),
    }
}

/// Both the incoming message and the accepted value are no-ops, accepting
/// again can't break anything.
fn noop_match(p: &PaxosInstance, pm: &PaxMsg) -> bool {
    pm.is_noop()
        && p.acceptor
            .accepted
            .as_ref()
            .map(|a| a.is_noop())
            .unwrap_or(false)
}

/// A finished instance answers proposers with the decided value.
fn teach(p: &PaxosInstance) -> Option<Outgoing> {
    p.learner
        .learned
        .as_ref()
        .and_then(|learned| Outgoing::reply(learned.carry(Op::Learn)))
}

pub fn handle_prepare(p: &mut PaxosInstance, pm: &PaxMsg) -> Option<Outgoing> {
    if p.is_finished() {
        return teach(p);
    }
    if !(pm.proposal > p.acceptor.promise || noop_match(p, pm)) {
        trace!(
            "synode {} reject prepare {}, promised {}",
            p.synode,
            pm.proposal,
            p.acceptor.promise
        );
        return None;
    }

    p.acceptor.promise = std::cmp::max(p.acceptor.promise, pm.proposal);
    if pm.force_delivery {
        p.force_delivery = true;
    }
    p.touch();
    let mut reply = match &p.acceptor.accepted {
        Some(accepted) => accepted.carry(Op::AckPrepare),
        None => PaxMsg::new(Op::AckPrepareEmpty, p.synode),
    };
    reply.reply_to = pm.proposal;
    Outgoing::reply(reply)
}

pub fn handle_accept(p: &mut PaxosInstance, pm: &PaxMsg) -> Option<Outgoing> {
    if p.is_finished() {
        return teach(p);
    }
    if p.acceptor.promise > pm.proposal && !noop_match(p, pm) {
        trace!(
            "synode {} reject accept {}, promised {}",
            p.synode,
            pm.proposal,
            p.acceptor.promise
        );
        return None;
    }

    p.acceptor.promise = std::cmp::max(p.acceptor.promise, pm.proposal);
    p.acceptor.accepted = Some(Arc::new(pm.clone()));
    if pm.force_delivery {
        p.force_delivery = true;
    }
    p.touch();
    let mut reply = PaxMsg::new(Op::AckAccept, p.synode);
    reply.proposal = pm.proposal;
    reply.reply_to = pm.proposal;
    Outgoing::reply(reply)
}

fn forced_nodes(p: &PaxosInstance) -> Option<Vec<NodeAddress>> {
    p.proposer
        .message
        .as_ref()
        .and_then(|m| m.forced_nodes().map(|nodes| nodes.to_vec()))
}

/// Collects the acks of the prepare phase, the accept of the proposer's
/// ballot is broadcast once a quorum answered.
pub fn handle_ack_prepare(p: &mut PaxosInstance, pm: &PaxMsg, site: &SiteDef) -> Option<Outgoing> {
    if p.is_finished()
        || p.proposer.sent_prepare != Some(pm.reply_to)
        || p.proposer.sent_propose == Some(pm.reply_to)
    {
        return None;
    }

    p.proposer.prep_nodeset.add(pm.from);
    if pm.op == Op::AckPrepare {
        // adopt the value accepted with the highest ballot.
        let adopt = match p.proposer.adopted {
            Some(ballot) => pm.proposal > ballot,
            None => true,
        };
        if adopt {
            debug!(
                "synode {} adopts value accepted at {} from node {}",
                p.synode, pm.proposal, pm.from
            );
            p.proposer.adopted = Some(pm.proposal);
            p.proposer.message = Some(Arc::new(pm.carry(Op::Accept)));
        }
    }

    let forced = forced_nodes(p);
    if !quorum_reached(site, &p.proposer.prep_nodeset, forced.as_deref()) {
        return None;
    }
    p.proposer.sent_propose = Some(p.proposer.ballot);
    p.proposer.prop_nodeset.clear();
    Outgoing::all(p.build_accept())
}

/// Collects the acks of the accept phase, the value is learned once a
/// quorum accepted it.
pub fn handle_ack_accept(p: &mut PaxosInstance, pm: &PaxMsg, site: &SiteDef) -> Option<Outgoing> {
    if p.is_finished() || p.proposer.sent_propose != Some(pm.reply_to) {
        return None;
    }

    p.proposer.prop_nodeset.add(pm.from);
    let forced = forced_nodes(p);
    if !quorum_reached(site, &p.proposer.prop_nodeset, forced.as_deref()) {
        return None;
    }

    let accept = p.build_accept();
    p.learn(&accept);
    let msg = if accept.is_noop() || p.proposer.adopted.is_some() {
        accept.carry(Op::Learn)
    } else {
        let mut tiny = PaxMsg::new(Op::TinyLearn, p.synode);
        tiny.proposal = accept.proposal;
        tiny.msg_type = accept.msg_type;
        tiny.force_delivery = accept.force_delivery;
        tiny
    };
    Outgoing::all(msg)
}

pub fn handle_learn(p: &mut PaxosInstance, pm: &PaxMsg) -> bool {
    if pm.force_delivery {
        p.force_delivery = true;
    }
    p.learn(pm)
}

/// A tiny learn only names the ballot, the value is the one accepted at that
/// ballot. Nodes which didn't accept it ask for the value.
pub fn handle_tiny_learn(p: &mut PaxosInstance, pm: &PaxMsg) -> Option<Outgoing> {
    if p.is_finished() {
        return None;
    }
    match p.acceptor.accepted.clone() {
        Some(accepted) if accepted.proposal == pm.proposal => {
            p.learn(&accepted);
            None
        }
        _ => Outgoing::reply(PaxMsg::new(Op::Read, p.synode)),
    }
}

/// Serves a read with the decided value, if any.
pub fn handle_read(p: &PaxosInstance) -> Option<Outgoing> {
    teach(p)
}

/// The owner of the slot proposes a no-op at its own ballot. It is served
/// as an accept of that ballot, so any higher promise rejects it.
pub fn handle_skip(p: &mut PaxosInstance, pm: &PaxMsg) -> Option<Outgoing> {
    if !pm.is_noop() || pm.proposal != Ballot::owner(pm.synode.node) {
        debug!("synode {} drop malformed skip from node {}", p.synode, pm.from);
        return None;
    }
    handle_accept(p, pm)
}

/// Returns whether `node` may take part in the instance of `site`.
pub fn is_participant(site: &SiteDef, node: NodeNo, sender: &NodeAddress) -> bool {
    site.address(node)
        .map(|a| a.same_node(sender))
        .unwrap_or(false)
}
