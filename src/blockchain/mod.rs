// This file is part of VELA.
//
// Copyright (C) 2023 The Vela Project.
//
// VELA is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the
// Free Software Foundation, either version 3 of the License, or (at your
// option) any later version.
//
// VELA is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License
// for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with VELA. If not, see <https://www.gnu.org/licenses/>.

//! Blockchain service components.
//!
//! The service owns the ledger write path and everything hanging off it:
//! - ledger: validates blocks and applies or inverts their mutations.
//! - processor: the single writer draining the inbound block queue.
//! - unchecked: holding area for blocks missing a dependency.
//! - election/vote/online_reps: fork resolution by weighted votes.
//! - dispatcher: read-only request verbs.
//!
//! External components interact with the service via message passing.

pub(crate) mod dispatcher;
pub(crate) mod processor;
pub(crate) mod unchecked;

pub mod election;
pub mod ledger;
pub mod message;
pub mod online_reps;
pub mod pubsub;
pub mod service;
pub mod vote;

pub use election::{ActiveElections, WeightProvider};
pub use ledger::{Ledger, ProcessResult};
pub use message::{
    BlockRequestReceiver, BlockRequestSender, BlockResponseReceiver, BlockResponseSender, Message,
};
pub use online_reps::OnlineReps;
pub use pubsub::Event;
pub use service::BlockService;
pub use vote::{VoteCode, VotePipeline};
