//! # xcom
//!
//! `xcom` is a group communication engine built on multi-Paxos. Every member
//! of a group owns a stream of slots, called synodes, and proposes its values
//! into its own stream, so members rarely compete for the same slot. The
//! decided values of all streams are merged by synode order and delivered to
//! every member in the same order.
//!
//! Besides the Paxos rounds, `xcom` implements:
//!
//! - two-phase pushes for uncontested slots
//! - event horizon, the admission window of in-flight synodes
//! - membership and leader reconfiguration, delayed by one event horizon
//! - exit logic for removed members
//! - liveness detection and agreed views
//!
//! An `Xcom` does no IO: the caller feeds it with received
//! messages and ticks, and takes the messages to send and the values to
//! deliver from `Xcom::advance`. `XcomNode` wires an `Xcom` to a `Transport`
//! and an `Application`.

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

extern crate chrono;
extern crate log;
extern crate rand;
extern crate serde;
extern crate serde_json;
extern crate thiserror;

mod acceptor;
mod allocator;
mod executor;
mod instance;
mod proposer;
mod reconfig;
mod xcom;

#[cfg(test)]
mod sim;

pub mod cache;
pub mod constant;
pub mod detector;
pub mod error;
pub mod node;
pub mod site_def;
pub mod synode;
pub mod types;

pub use crate::allocator::AllocKind;
pub use crate::cache::{InstanceCache, MemInstanceCache};
pub use crate::error::{Error, RejectReason};
pub use crate::executor::ExecutorState;
pub use crate::instance::{AcceptorState, LearnerState, PaxosInstance, ProposerState};
pub use crate::node::{Application, Inbound, Transport, XcomNode};
pub use crate::proposer::RequestId;
pub use crate::site_def::{SiteDef, SiteDefs};
pub use crate::synode::{Ballot, Synode};
pub use crate::xcom::{Ready, TerminateReason, Xcom, XcomOption, XcomState};
