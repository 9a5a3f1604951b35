//! The crate `constant` defines a set constant used by xcom.

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

/// A special value is used to mark illegal or invalid node number, eg: the
/// sender of a message isn't a member of the configuration governing it.
pub const VOID_NODE_NO: u32 = std::u32::MAX;

/// The sequence of the first slot of a booted group. Sequence zero is
/// reserved for the null synode.
pub const FIRST_SEQUENCE: u64 = 1;

/// The lower bound of a valid event horizon.
pub const EVENT_HORIZON_MIN: u32 = 1;

/// The upper bound of a valid event horizon.
pub const EVENT_HORIZON_MAX: u32 = 200;

/// The event horizon used when nothing else is configured. Members speaking a
/// protocol older than [`PROTOCOL_EVENT_HORIZON`] only support this value.
pub const EVENT_HORIZON_DEFAULT: u32 = 10;

/// A special value of `max_active_leaders`: every member is a leader.
pub const ACTIVE_LEADERS_ALL: u32 = 0;

/// The first protocol generation that is able to reconfigure the event
/// horizon.
pub const PROTOCOL_EVENT_HORIZON: u32 = 6;

/// The first protocol generation that supports a restricted set of active
/// leaders.
pub const PROTOCOL_SINGLE_LEADER: u32 = 9;

/// The protocol generation spoken by this implementation.
pub const PROTOCOL_CURRENT: u32 = PROTOCOL_SINGLE_LEADER;

/// Upper bound of the number of `Read` requests issued by one fetch
/// escalation.
pub const MAX_READ_REQUESTS: usize = 64;

/// Upper bound of the number of slots the executor handles within a single
/// `advance()`, so a long catch-up doesn't starve the other tasks.
pub const MAX_EXECUTE_PER_ADVANCE: usize = 1024;

/// Upper bound of the number of scheduling rounds within a single
/// `advance()`.
pub const MAX_ADVANCE_ROUNDS: usize = 256;
