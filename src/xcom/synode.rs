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

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::constant::*;

/// The number of a node within a configuration, it is the index of the node
/// in `SiteDef::nodes`.
pub type NodeNo = u32;

/// Identifies a group, so messages of different groups are never mixed.
pub type GroupId = u32;

/// A slot of the replicated log. Each configuration gives every member its
/// own stream of slots: for every sequence number there is one synode per
/// member, named by `node`.
///
/// Synodes are totally ordered by `(sequence, node, group)`, this is also the
/// delivery order.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Synode {
    pub group: GroupId,
    pub sequence: u64,
    pub node: NodeNo,
}

impl Synode {
    /// The null synode, it is smaller than any valid synode.
    pub const NULL: Synode = Synode {
        group: 0,
        sequence: 0,
        node: 0,
    };

    pub fn new(group: GroupId, sequence: u64, node: NodeNo) -> Synode {
        Synode {
            group,
            sequence,
            node,
        }
    }

    pub fn is_null(&self) -> bool {
        self.sequence == 0
    }

    /// The successor in delivery order, for a configuration of `max_nodes`
    /// members.
    pub fn next(&self, max_nodes: u32) -> Synode {
        if self.node + 1 >= max_nodes {
            Synode::new(self.group, self.sequence + 1, 0)
        } else {
            Synode::new(self.group, self.sequence, self.node + 1)
        }
    }

    /// The next slot of the same stream.
    pub fn next_sequence(&self) -> Synode {
        Synode::new(self.group, self.sequence + 1, self.node)
    }

    /// The first synode of sequence `self.sequence + delta`.
    pub fn ahead(&self, delta: u64) -> Synode {
        Synode::new(self.group, self.sequence + delta, 0)
    }

    pub fn with_node(&self, node: NodeNo) -> Synode {
        Synode::new(self.group, self.sequence, node)
    }
}

impl Ord for Synode {
    fn cmp(&self, other: &Synode) -> Ordering {
        self.sequence
            .cmp(&other.sequence)
            .then(self.node.cmp(&other.node))
            .then(self.group.cmp(&other.group))
    }
}

impl PartialOrd for Synode {
    fn partial_cmp(&self, other: &Synode) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Synode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{{} {} {}}}", self.group, self.sequence, self.node)
    }
}

/// A Paxos ballot. Ballots are ordered lexicographically by
/// `(counter, node)`.
///
/// The owner of a slot proposes with counter `0` and skips the prepare
/// phase, any other proposer (recovery, no-op) starts from counter `1`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ballot {
    pub counter: i32,
    pub node: NodeNo,
}

impl Ballot {
    /// The promise an acceptor starts with.
    pub const INITIAL: Ballot = Ballot {
        counter: 0,
        node: 0,
    };

    pub fn new(counter: i32, node: NodeNo) -> Ballot {
        Ballot { counter, node }
    }

    /// The ballot used by a two-phase push of `node`.
    pub fn owner(node: NodeNo) -> Ballot {
        Ballot::new(0, node)
    }

    /// A ballot of `node` which is greater than both `self` and `other`.
    pub fn next_above(&self, other: &Ballot, node: NodeNo) -> Ballot {
        let counter = std::cmp::max(self.counter, other.counter);
        Ballot::new(std::cmp::max(counter, 0) + 1, node)
    }
}

impl Ord for Ballot {
    fn cmp(&self, other: &Ballot) -> Ordering {
        self.counter
            .cmp(&other.counter)
            .then(self.node.cmp(&other.node))
    }
}

impl PartialOrd for Ballot {
    fn partial_cmp(&self, other: &Ballot) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Ballot {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{{} {}}}", self.counter, self.node)
    }
}

/// Returns whether `node` refers to an actual member.
#[inline(always)]
pub fn is_valid_node_no(node: NodeNo) -> bool {
    node != VOID_NODE_NO
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synode_total_order() {
        let a = Synode::new(1, 5, 2);
        let b = Synode::new(1, 6, 0);
        let c = Synode::new(1, 5, 3);
        assert!(a < b);
        assert!(a < c);
        assert!(c < b);
        assert!(Synode::NULL < a);

        let mut synodes = vec![b, c, a];
        synodes.sort();
        assert_eq!(synodes, vec![a, c, b]);
    }

    #[test]
    fn synode_next() {
        let s = Synode::new(1, 5, 1);
        assert_eq!(s.next(3), Synode::new(1, 5, 2));
        assert_eq!(s.next(2), Synode::new(1, 6, 0));
        assert_eq!(s.next_sequence(), Synode::new(1, 6, 1));
        assert_eq!(s.ahead(6), Synode::new(1, 11, 0));
        assert!(Synode::NULL.is_null());
        assert!(!s.is_null());
    }

    #[test]
    fn ballot_order() {
        assert!(Ballot::owner(2) > Ballot::INITIAL);
        assert_eq!(Ballot::owner(0), Ballot::INITIAL);
        assert!(Ballot::new(1, 0) > Ballot::owner(2));
        assert!(Ballot::new(1, 2) > Ballot::new(1, 1));

        let b = Ballot::owner(1).next_above(&Ballot::new(3, 2), 0);
        assert_eq!(b, Ballot::new(4, 0));
        assert!(b > Ballot::new(3, 2));
    }
}
