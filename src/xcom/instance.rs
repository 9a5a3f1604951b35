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

use chrono::prelude::*;
use log::error;

use crate::synode::{Ballot, NodeNo, Synode};
use crate::types::{NodeSet, Op, PaxMsg};

#[derive(Debug, Clone, Default)]
pub struct ProposerState {
    pub ballot: Ballot,
    pub sent_prepare: Option<Ballot>,
    pub sent_propose: Option<Ballot>,

    /// Nodes which acked the prepare of `ballot`.
    pub prep_nodeset: NodeSet,

    /// Nodes which acked the accept of `ballot`.
    pub prop_nodeset: NodeSet,

    /// The highest accepted ballot reported by the prepare acks, the value
    /// of it replaces `message`.
    pub adopted: Option<Ballot>,

    /// The value to push.
    pub message: Option<Arc<PaxMsg>>,
}

#[derive(Debug, Clone, Default)]
pub struct AcceptorState {
    pub promise: Ballot,
    pub accepted: Option<Arc<PaxMsg>>,
}

#[derive(Debug, Clone, Default)]
pub struct LearnerState {
    pub learned: Option<Arc<PaxMsg>>,
}

/// The Paxos state of a single synode, shared by the proposer, acceptor and
/// learner roles of the local node.
#[derive(Debug, Clone)]
pub struct PaxosInstance {
    pub synode: Synode,
    pub proposer: ProposerState,
    pub acceptor: AcceptorState,
    pub learner: LearnerState,

    /// The instance belongs to a forced configuration, it is accepted by the
    /// forced nodes only.
    pub force_delivery: bool,

    /// Wall clock of the last modification, in nanoseconds.
    pub last_modified: i64,

    locked: bool,

    /// Bumped whenever the instance learns a value, a proposer worker waits
    /// for it to move.
    rv: u64,
}

impl PaxosInstance {
    pub fn new(synode: Synode) -> PaxosInstance {
        PaxosInstance {
            synode,
            proposer: ProposerState::default(),
            acceptor: AcceptorState::default(),
            learner: LearnerState::default(),
            force_delivery: false,
            last_modified: 0,
            locked: false,
            rv: 0,
        }
    }

    /// An instance is started once any of its roles left the initial state.
    pub fn is_started(&self) -> bool {
        self.locked
            || self.proposer.message.is_some()
            || self.acceptor.accepted.is_some()
            || self.acceptor.promise != Ballot::INITIAL
            || self.learner.learned.is_some()
    }

    pub fn is_finished(&self) -> bool {
        self.learner.learned.is_some()
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Takes the instance for a proposer worker, only one worker may push a
    /// value at a time.
    pub fn try_lock(&mut self) -> bool {
        if self.locked {
            return false;
        }
        self.locked = true;
        true
    }

    pub fn unlock(&mut self) {
        self.locked = false;
    }

    pub fn rv(&self) -> u64 {
        self.rv
    }

    pub fn touch(&mut self) {
        self.last_modified = Local::now().timestamp_nanos_opt().unwrap_or_default();
    }

    /// Records the decided value. A learned value never changes, so learning
    /// again is a no-op and a different value is reported.
    pub fn learn(&mut self, msg: &PaxMsg) -> bool {
        if let Some(learned) = &self.learner.learned {
            if !learned.same_value(msg) {
                error!(
                    "synode {} learned {:?} conflicts with learned {:?}",
                    self.synode, msg, learned
                );
            }
            return false;
        }

        let learned = Arc::new(msg.carry(Op::Learn));
        if self
            .acceptor
            .accepted
            .as_ref()
            .map(|a| !a.same_value(&learned))
            .unwrap_or(true)
        {
            self.acceptor.accepted = Some(learned.clone());
        }
        self.learner.learned = Some(learned);
        self.rv += 1;
        self.touch();
        true
    }

    /// Starts a two-phase push: the owner of a cleanly allocated slot goes
    /// straight to accept with ballot `{0, node}`.
    pub fn push_2p(&mut self, value: Arc<PaxMsg>, node: NodeNo) -> PaxMsg {
        let ballot = Ballot::owner(node);
        self.reset_proposer(ballot, value);
        self.proposer.sent_propose = Some(ballot);
        self.build_accept()
    }

    /// Starts a three-phase push with a ballot above every ballot seen.
    pub fn push_3p(&mut self, value: Arc<PaxMsg>, node: NodeNo) -> PaxMsg {
        let ballot = self
            .proposer
            .ballot
            .next_above(&self.acceptor.promise, node);
        self.reset_proposer(ballot, value);
        self.proposer.sent_prepare = Some(ballot);

        let mut msg = PaxMsg::new(Op::Prepare, self.synode);
        msg.proposal = ballot;
        msg.force_delivery = self.force_delivery;
        if let Some(value) = &self.proposer.message {
            msg.msg_type = value.msg_type;
        }
        msg
    }

    /// The accept message of the current ballot.
    pub fn build_accept(&self) -> PaxMsg {
        let mut msg = match &self.proposer.message {
            Some(value) => value.carry(Op::Accept),
            None => PaxMsg::noop(self.synode).carry(Op::Accept),
        };
        msg.synode = self.synode;
        msg.proposal = self.proposer.ballot;
        msg.force_delivery = self.force_delivery;
        msg
    }

    fn reset_proposer(&mut self, ballot: Ballot, value: Arc<PaxMsg>) {
        self.proposer.ballot = ballot;
        self.proposer.sent_prepare = None;
        self.proposer.sent_propose = None;
        self.proposer.prep_nodeset.clear();
        self.proposer.prop_nodeset.clear();
        self.proposer.adopted = None;
        self.proposer.message = Some(value);
        self.touch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AppData, Cargo};

    fn value(synode: Synode, lsn: u64) -> Arc<PaxMsg> {
        let mut msg = PaxMsg::new(Op::Accept, synode);
        msg.payload.push(AppData {
            origin: 1,
            lsn,
            expiry: 0,
            cargo: Cargo::App(vec![lsn as u8]),
        });
        Arc::new(msg)
    }

    #[test]
    fn started_and_finished() {
        let synode = Synode::new(1, 1, 0);
        let mut p = PaxosInstance::new(synode);
        assert!(!p.is_started());
        assert!(!p.is_finished());

        assert!(p.try_lock());
        assert!(!p.try_lock());
        assert!(p.is_started());
        p.unlock();
        assert!(!p.is_started());

        p.acceptor.promise = Ballot::new(1, 2);
        assert!(p.is_started());
    }

    #[test]
    fn learn_never_regresses() {
        let synode = Synode::new(1, 1, 0);
        let mut p = PaxosInstance::new(synode);
        let first = value(synode, 1);
        assert!(p.learn(&first));
        assert_eq!(p.rv(), 1);
        assert!(p.is_finished());

        assert!(!p.learn(&value(synode, 2)));
        assert!(!p.learn(&PaxMsg::noop(synode)));
        let learned = p.learner.learned.clone().unwrap();
        assert!(learned.same_value(&first));
        assert_eq!(learned.op, Op::Learn);
        assert_eq!(p.rv(), 1);
    }

    #[test]
    fn push_ballots() {
        let synode = Synode::new(1, 1, 2);
        let mut p = PaxosInstance::new(synode);
        let accept = p.push_2p(value(synode, 1), 2);
        assert_eq!(accept.op, Op::Accept);
        assert_eq!(accept.proposal, Ballot::owner(2));
        assert_eq!(accept.payload.len(), 1);

        p.acceptor.promise = Ballot::new(3, 1);
        let prepare = p.push_3p(value(synode, 1), 0);
        assert_eq!(prepare.op, Op::Prepare);
        assert_eq!(prepare.proposal, Ballot::new(4, 0));
        assert!(prepare.payload.is_empty());

        let again = p.push_3p(Arc::new(PaxMsg::noop(synode)), 0);
        assert_eq!(again.proposal, Ballot::new(5, 0));
        assert!(again.msg_type == crate::types::MsgType::NoOp);
    }
}
