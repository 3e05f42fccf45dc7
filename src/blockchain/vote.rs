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

//! Vote intake: replay suppression, signature verification and vote
//! canonicalization.
//!
//! Identical votes arriving over different wire paths collapse onto one
//! shared allocation through the uniquer, so elections and the vote table
//! reference a single copy.

use crate::{
    base::{
        schema::{Account, Vote},
        Mutex,
    },
    crypto::Hash,
};
use lru::LruCache;
use std::sync::Arc;

/// Replay window entries.
const REPLAY_CACHE_SIZE: usize = 65536;

/// Canonical vote cache entries.
const UNIQUER_CACHE_SIZE: usize = 16384;

/// Classification of an incoming vote.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum VoteCode {
    /// Fresh, verified vote.
    Vote,
    /// (account, sequence) seen before.
    Replay,
    /// Signature or shape check failed.
    Invalid,
}

/// Vote deduplication and verification stage.
pub struct VotePipeline {
    replay: Mutex<LruCache<(Account, u64), ()>>,
    uniquer: Mutex<LruCache<(Account, Hash), Arc<Vote>>>,
}

impl Default for VotePipeline {
    fn default() -> Self {
        VotePipeline {
            replay: Mutex::new(LruCache::new(REPLAY_CACHE_SIZE)),
            uniquer: Mutex::new(LruCache::new(UNIQUER_CACHE_SIZE)),
        }
    }
}

impl VotePipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Canonicalize a vote: identical (account, digest) pairs share one
    /// allocation.
    pub fn unique(&self, vote: Vote) -> Arc<Vote> {
        let key = (vote.account, vote.digest());
        let mut uniquer = self.uniquer.lock();
        if let Some(existing) = uniquer.get(&key) {
            return existing.clone();
        }
        let vote = Arc::new(vote);
        uniquer.put(key, vote.clone());
        vote
    }

    /// Verify and classify a vote. Fresh votes come back canonicalized for
    /// routing into elections.
    pub fn process(&self, vote: Vote) -> (VoteCode, Option<Arc<Vote>>) {
        if !vote.verify() {
            return (VoteCode::Invalid, None);
        }
        let replay_key = (vote.account, vote.sequence);
        {
            let mut replay = self.replay.lock();
            if replay.contains(&replay_key) {
                return (VoteCode::Replay, None);
            }
            replay.put(replay_key, ());
        }
        let vote = self.unique(vote);
        (VoteCode::Vote, Some(vote))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::schema::tests::test_keypair;

    fn test_vote(sequence: u64) -> Vote {
        Vote::new(&test_keypair(1), sequence, vec![Hash::new([9; 32])])
    }

    #[test]
    fn fresh_vote_accepted() {
        let pipeline = VotePipeline::new();

        let (code, vote) = pipeline.process(test_vote(1));

        assert_eq!(code, VoteCode::Vote);
        assert_eq!(vote.unwrap().sequence, 1);
    }

    #[test]
    fn replay_suppressed() {
        let pipeline = VotePipeline::new();
        pipeline.process(test_vote(1));

        let (code, vote) = pipeline.process(test_vote(1));

        assert_eq!(code, VoteCode::Replay);
        assert!(vote.is_none());

        // A later sequence from the same account is fresh again.
        let (code, _) = pipeline.process(test_vote(2));
        assert_eq!(code, VoteCode::Vote);
    }

    #[test]
    fn invalid_signature_rejected() {
        let pipeline = VotePipeline::new();
        let mut vote = test_vote(1);
        vote.sequence = 2; // breaks the signed digest

        let (code, routed) = pipeline.process(vote);

        assert_eq!(code, VoteCode::Invalid);
        assert!(routed.is_none());
    }

    #[test]
    fn uniquer_shares_storage() {
        let pipeline = VotePipeline::new();

        let a = pipeline.unique(test_vote(1));
        let b = pipeline.unique(test_vote(1));

        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn different_accounts_do_not_collide() {
        let pipeline = VotePipeline::new();
        let v1 = Vote::new(&test_keypair(1), 1, vec![Hash::new([9; 32])]);
        let v2 = Vote::new(&test_keypair(2), 1, vec![Hash::new([9; 32])]);

        assert_eq!(pipeline.process(v1).0, VoteCode::Vote);
        assert_eq!(pipeline.process(v2).0, VoteCode::Vote);
    }
}
