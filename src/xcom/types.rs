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

use serde::{Deserialize, Serialize};

use crate::constant::*;
use crate::site_def::SiteDef;
use crate::synode::{Ballot, GroupId, NodeNo, Synode};

/// Logical time, one tick is one timer period of the scheduler.
pub type Tick = u64;

/// The identity of a member.
#[derive(Debug, Default, Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub struct NodeAddress {
    pub address: String,
    pub uuid: u64,

    /// The highest protocol generation spoken by this member.
    pub protocol: u32,
}

impl NodeAddress {
    pub fn new<T: Into<String>>(address: T, uuid: u64) -> NodeAddress {
        NodeAddress {
            address: address.into(),
            uuid,
            protocol: PROTOCOL_CURRENT,
        }
    }

    pub fn with_protocol(mut self, protocol: u32) -> NodeAddress {
        self.protocol = protocol;
        self
    }

    /// Two addresses refer to the same node if both address and uuid match,
    /// the protocol doesn't take part in it.
    pub fn same_node(&self, other: &NodeAddress) -> bool {
        self.uuid == other.uuid && self.address == other.address
    }
}

impl std::fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}#{}", self.address, self.uuid)
    }
}

/// A fixed size set of node numbers.
#[derive(Debug, Default, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct NodeSet {
    bits: Vec<bool>,
}

impl NodeSet {
    pub fn new(size: u32) -> NodeSet {
        NodeSet {
            bits: vec![false; size as usize],
        }
    }

    pub fn full(size: u32) -> NodeSet {
        NodeSet {
            bits: vec![true; size as usize],
        }
    }

    pub fn size(&self) -> u32 {
        self.bits.len() as u32
    }

    pub fn resize(&mut self, size: u32) {
        self.bits.resize(size as usize, false);
    }

    pub fn add(&mut self, node: NodeNo) {
        let idx = node as usize;
        if idx >= self.bits.len() {
            self.bits.resize(idx + 1, false);
        }
        self.bits[idx] = true;
    }

    pub fn remove(&mut self, node: NodeNo) {
        if let Some(bit) = self.bits.get_mut(node as usize) {
            *bit = false;
        }
    }

    pub fn contains(&self, node: NodeNo) -> bool {
        self.bits.get(node as usize).cloned().unwrap_or(false)
    }

    pub fn count(&self) -> u32 {
        self.bits.iter().filter(|b| **b).count() as u32
    }

    pub fn clear(&mut self) {
        self.bits.iter_mut().for_each(|b| *b = false);
    }

    pub fn iter(&self) -> impl Iterator<Item = NodeNo> + '_ {
        self.bits
            .iter()
            .enumerate()
            .filter(|(_, b)| **b)
            .map(|(i, _)| i as NodeNo)
    }
}

/// The content of a proposed value.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub enum Cargo {
    /// An opaque application payload.
    App(Vec<u8>),
    AddNode(Vec<NodeAddress>),
    RemoveNode(Vec<NodeAddress>),
    SetEventHorizon(u32),
    /// The preferred leaders, in order of preference.
    SetLeaders(Vec<NodeAddress>),
    SetMaxLeaders(u32),
    /// Replace the membership without the consent of a majority of the
    /// current configuration, accepted by the listed nodes only.
    ForceConfig(Vec<NodeAddress>),
    /// The liveness view of the proposing node.
    View(NodeSet),
}

impl Cargo {
    pub fn is_app(&self) -> bool {
        matches!(self, Cargo::App(_))
    }

    /// Returns whether this cargo changes the configuration. A view isn't a
    /// reconfiguration request although it also installs a configuration.
    pub fn is_config(&self) -> bool {
        !matches!(self, Cargo::App(_) | Cargo::View(_))
    }

    pub fn is_view(&self) -> bool {
        matches!(self, Cargo::View(_))
    }

    /// The approximate number of bytes of this cargo.
    pub fn size(&self) -> usize {
        match self {
            Cargo::App(bytes) => bytes.len(),
            Cargo::AddNode(nodes)
            | Cargo::RemoveNode(nodes)
            | Cargo::SetLeaders(nodes)
            | Cargo::ForceConfig(nodes) => nodes
                .iter()
                .map(|n| n.address.len() + std::mem::size_of::<u64>() * 2)
                .sum(),
            Cargo::SetEventHorizon(_) | Cargo::SetMaxLeaders(_) => std::mem::size_of::<u32>(),
            Cargo::View(set) => set.size() as usize,
        }
    }
}

/// One value proposed by a client.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AppData {
    /// The uuid of the proposing node.
    pub origin: u64,

    /// The log sequence number assigned by the proposing node, `(origin,
    /// lsn)` identifies a value.
    pub lsn: u64,

    /// The value is dropped if it didn't get a slot before this tick, zero
    /// means never.
    pub expiry: Tick,
    pub cargo: Cargo,
}

impl AppData {
    pub fn is_expired(&self, now: Tick) -> bool {
        self.expiry != 0 && self.expiry < now
    }
}

#[derive(Debug, PartialEq, Eq, Serialize, Deserialize, Clone, Copy, Hash)]
pub enum Op {
    Prepare,
    AckPrepare,
    AckPrepareEmpty,
    Accept,
    AckAccept,
    Learn,
    TinyLearn,
    Read,
    Skip,
    SynodeRequest,
    SynodeAllocated,
    Die,
    IAmAlive,
}

impl std::fmt::Display for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let op = match &self {
            Op::Prepare => "Prepare",
            Op::AckPrepare => "AckPrepare",
            Op::AckPrepareEmpty => "AckPrepareEmpty",
            Op::Accept => "Accept",
            Op::AckAccept => "AckAccept",
            Op::Learn => "Learn",
            Op::TinyLearn => "TinyLearn",
            Op::Read => "Read",
            Op::Skip => "Skip",
            Op::SynodeRequest => "SynodeRequest",
            Op::SynodeAllocated => "SynodeAllocated",
            Op::Die => "Die",
            Op::IAmAlive => "IAmAlive",
        };
        write!(f, "{}", op)
    }
}

impl Op {
    /// Messages of these ops are not about a particular slot, their `from`
    /// and `to` are node numbers of the latest configuration.
    pub fn is_control(&self) -> bool {
        matches!(self, Op::SynodeRequest | Op::SynodeAllocated | Op::IAmAlive)
    }
}

#[derive(Debug, PartialEq, Eq, Serialize, Deserialize, Clone, Copy)]
pub enum MsgType {
    Normal,
    NoOp,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct PaxMsg {
    pub from: NodeNo,

    /// Who this message send to.
    pub to: NodeNo,
    pub sender: NodeAddress,
    pub group_id: GroupId,
    pub synode: Synode,
    pub proposal: Ballot,

    /// The ballot a reply answers.
    pub reply_to: Ballot,
    pub op: Op,
    pub msg_type: MsgType,
    pub force_delivery: bool,
    pub payload: Vec<AppData>,

    /// The executed synode of the sender.
    pub delivered_msg: Synode,
}

impl PaxMsg {
    pub fn new(op: Op, synode: Synode) -> PaxMsg {
        PaxMsg {
            from: VOID_NODE_NO,
            to: VOID_NODE_NO,
            sender: NodeAddress::default(),
            group_id: synode.group,
            synode,
            proposal: Ballot::INITIAL,
            reply_to: Ballot::INITIAL,
            op,
            msg_type: MsgType::Normal,
            force_delivery: false,
            payload: Vec::new(),
            delivered_msg: Synode::NULL,
        }
    }

    pub fn noop(synode: Synode) -> PaxMsg {
        let mut msg = PaxMsg::new(Op::Learn, synode);
        msg.msg_type = MsgType::NoOp;
        msg
    }

    pub fn is_noop(&self) -> bool {
        self.msg_type == MsgType::NoOp
    }

    /// Builds a message of `op` carrying the value of `self`.
    pub fn carry(&self, op: Op) -> PaxMsg {
        let mut msg = PaxMsg::new(op, self.synode);
        msg.proposal = self.proposal;
        msg.msg_type = self.msg_type;
        msg.force_delivery = self.force_delivery;
        msg.payload = self.payload.clone();
        msg
    }

    /// Returns whether both messages carry the same value, values are
    /// identified by their `(origin, lsn)` pairs.
    pub fn same_value(&self, other: &PaxMsg) -> bool {
        if self.msg_type != other.msg_type || self.payload.len() != other.payload.len() {
            return false;
        }
        self.payload
            .iter()
            .zip(other.payload.iter())
            .all(|(l, r)| l.origin == r.origin && l.lsn == r.lsn)
    }

    /// The nodes which must accept a forced configuration.
    pub fn forced_nodes(&self) -> Option<&[NodeAddress]> {
        if !self.force_delivery {
            return None;
        }
        self.payload.iter().find_map(|d| match &d.cargo {
            Cargo::ForceConfig(nodes) => Some(nodes.as_slice()),
            _ => None,
        })
    }
}

impl std::fmt::Debug for PaxMsg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let num_values = self.payload.len();
        f.debug_struct("PaxMsg")
            .field("op", &self.op)
            .field("from", &self.from)
            .field("to", &self.to)
            .field("synode", &self.synode)
            .field("proposal", &self.proposal)
            .field("reply_to", &self.reply_to)
            .field("msg_type", &self.msg_type)
            .field("force", &self.force_delivery)
            .field("num_values", &num_values)
            .finish()
    }
}

/// A message to send to a remote node.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub to: NodeAddress,
    pub msg: PaxMsg,
}

#[derive(Debug, PartialEq, Eq, Serialize, Deserialize, Clone, Copy)]
pub enum Outcome {
    Ok,
    Failure,
}

/// A value handed to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub synode: Synode,
    pub origin: u64,
    pub lsn: u64,
    pub payload: Vec<u8>,
    pub outcome: Outcome,
}

/// A request proposed by the local node which could not be delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedRequest {
    /// The last synode the request was pushed at, null if it never got one.
    pub synode: Synode,
    pub data: AppData,
}

impl From<FailedRequest> for Delivery {
    fn from(failed: FailedRequest) -> Delivery {
        let payload = match failed.data.cargo {
            Cargo::App(bytes) => bytes,
            _ => Vec::new(),
        };
        Delivery {
            synode: failed.synode,
            origin: failed.data.origin,
            lsn: failed.data.lsn,
            payload,
            outcome: Outcome::Failure,
        }
    }
}

/// The state exported for a booting node to catch up.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Snapshot {
    /// The smallest synode still kept in the local log window.
    pub log_start: Synode,

    /// Every synode before it has been executed.
    pub log_end: Synode,
    pub configs: Vec<SiteDef>,

    /// Wall clock, in nanoseconds.
    pub taken_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_set_operations() {
        let mut set = NodeSet::new(3);
        assert_eq!(set.count(), 0);
        set.add(0);
        set.add(2);
        assert!(set.contains(2));
        assert!(!set.contains(1));
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![0, 2]);

        set.add(4);
        assert_eq!(set.size(), 5);
        assert_eq!(set.count(), 3);
        set.remove(0);
        set.remove(10);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![2, 4]);
        set.clear();
        assert_eq!(set.count(), 0);
        assert_eq!(NodeSet::full(3).count(), 3);
    }

    #[test]
    fn same_value_compares_identity() {
        let data = |lsn| AppData {
            origin: 7,
            lsn,
            expiry: 0,
            cargo: Cargo::App(vec![1]),
        };
        let mut a = PaxMsg::new(Op::Accept, Synode::new(1, 1, 0));
        a.payload = vec![data(1), data(2)];
        let mut b = a.carry(Op::Learn);
        assert!(a.same_value(&b));

        b.payload[1].lsn = 3;
        assert!(!a.same_value(&b));

        let noop = PaxMsg::noop(a.synode);
        assert!(!a.same_value(&noop));
        assert!(noop.same_value(&PaxMsg::noop(a.synode)));
    }

    #[test]
    fn cargo_kinds() {
        assert!(Cargo::App(vec![]).is_app());
        assert!(Cargo::SetMaxLeaders(1).is_config());
        assert!(!Cargo::View(NodeSet::new(1)).is_config());
        assert!(Cargo::View(NodeSet::new(1)).is_view());
    }

    #[test]
    fn failed_request_into_delivery() {
        let failed = FailedRequest {
            synode: Synode::NULL,
            data: AppData {
                origin: 1,
                lsn: 9,
                expiry: 0,
                cargo: Cargo::App(vec![4, 2]),
            },
        };
        let delivery = Delivery::from(failed);
        assert_eq!(delivery.outcome, Outcome::Failure);
        assert_eq!(delivery.payload, vec![4, 2]);
        assert_eq!(delivery.lsn, 9);
    }

    #[test]
    fn pax_msg_codec() {
        let mut msg = PaxMsg::new(Op::Accept, Synode::new(1, 3, 2));
        msg.proposal = Ballot::new(2, 1);
        msg.payload.push(AppData {
            origin: 3,
            lsn: 1,
            expiry: 0,
            cargo: Cargo::AddNode(vec![NodeAddress::new("127.0.0.1:3306", 3)]),
        });
        let bytes = serde_json::to_vec(&msg).unwrap();
        let decoded: PaxMsg = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded.synode, msg.synode);
        assert_eq!(decoded.proposal, msg.proposal);
        assert_eq!(decoded.payload, msg.payload);
    }
}
