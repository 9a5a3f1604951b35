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

/// The reason why a reconfiguration request is rejected synchronously.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The request carries no node at all.
    #[error("empty node list")]
    EmptyNodeList,
    /// A node to add is already a member.
    #[error("node is already a member")]
    AlreadyMember,
    /// A node to add appears twice in the request.
    #[error("duplicated node")]
    DuplicateNode,
    /// A node referenced by the request isn't a member.
    #[error("node is not a member")]
    NotMember,
    /// Applying the request would leave the group without members.
    #[error("configuration would be empty")]
    EmptyConfig,
    /// The requested event horizon is outside the valid range.
    #[error("event horizon out of range")]
    EventHorizonOutOfRange,
    /// Some member speaks a protocol which doesn't support a non-default
    /// event horizon.
    #[error("some member can not reconfigure the event horizon")]
    IncompatibleEventHorizon,
    /// Some member speaks a protocol which doesn't support leader sets.
    #[error("some member does not support leaders")]
    IncompatibleLeaders,
    /// More active leaders are requested than members exist.
    #[error("too many active leaders")]
    TooManyLeaders,
    /// A node of a forced configuration is suspected dead.
    #[error("node is suspected dead")]
    SuspectedDead,
    /// The request isn't a reconfiguration.
    #[error("not a reconfiguration")]
    NotConfig,
}

#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    /// The node isn't booted yet, or it is exiting.
    #[error("xcom is not ready")]
    NotReady,

    /// The instance cache is full, the request should be retried later.
    #[error("system is busy")]
    Busy,

    /// A boot or import request carries no configuration.
    #[error("no nodes")]
    NoNodes,

    /// The local node isn't a member of the configuration it is booted with.
    #[error("local node is not a member")]
    NotMember,

    #[error("configuration rejected: {0}")]
    ConfigRejected(RejectReason),

    /// The local node left the group.
    #[error("xcom exited")]
    Exited,

    /// The local node can't keep its Paxos state any more, it must be
    /// restarted.
    #[error("fatal: {0}")]
    Fatal(String),

    #[error("codec: {0}")]
    Codec(Arc<serde_json::Error>),

    #[error("broken io request")]
    Io(Arc<std::io::Error>),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        Error::Io(Arc::new(err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Error {
        Error::Codec(Arc::new(err))
    }
}

impl From<RejectReason> for Error {
    fn from(reason: RejectReason) -> Error {
        Error::ConfigRejected(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejections_are_readable() {
        let err: Error = RejectReason::AlreadyMember.into();
        assert_eq!(err.to_string(), "configuration rejected: node is already a member");
        assert_eq!(RejectReason::NotConfig.to_string(), "not a reconfiguration");
    }
}
