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

//! Representatives observed voting within the online window, and the
//! derived online-stake estimate elections measure quorum against.

use crate::base::schema::{Account, Amount};
use std::collections::{HashMap, VecDeque};

/// Seconds a representative stays "online" after its last vote.
pub const ONLINE_WINDOW: u64 = 300;

/// Upper bound of retained weight samples (two weeks at five minutes).
pub const WEIGHT_SAMPLES_MAX: usize = 4032;

/// Fraction trimmed from each end of the sample distribution.
const TRIM_PERCENT: usize = 10;

pub struct OnlineReps {
    /// Representative -> unix seconds of the last observed vote.
    reps: HashMap<Account, u64>,
    /// Rolling online-weight samples, oldest first.
    samples: VecDeque<Amount>,
    /// Configured floor for the stake estimate.
    minimum: Amount,
}

impl OnlineReps {
    pub fn new(minimum: Amount) -> Self {
        OnlineReps {
            reps: HashMap::new(),
            samples: VecDeque::new(),
            minimum,
        }
    }

    /// Reload persisted samples at node start, oldest first.
    pub fn restore(&mut self, samples: impl IntoIterator<Item = Amount>) {
        for sample in samples {
            self.push_sample(sample);
        }
    }

    /// Record a vote from `representative` at `now`.
    pub fn observe(&mut self, representative: Account, now: u64) {
        self.reps.insert(representative, now);
    }

    /// Representatives seen within the online window.
    pub fn online(&self, now: u64) -> Vec<Account> {
        self.reps
            .iter()
            .filter(|(_, seen)| now.saturating_sub(**seen) <= ONLINE_WINDOW)
            .map(|(rep, _)| *rep)
            .collect()
    }

    /// Drop expired entries, compute the current online weight through
    /// `weight_of` and append it to the sample window. The caller persists
    /// the returned sample.
    pub fn sample<W>(&mut self, now: u64, weight_of: W) -> Amount
    where
        W: Fn(&Account) -> Amount,
    {
        self.reps
            .retain(|_, seen| now.saturating_sub(*seen) <= ONLINE_WINDOW);
        let mut total = Amount::zero();
        for rep in self.reps.keys() {
            total = total.checked_add(weight_of(rep)).unwrap_or(Amount::MAX);
        }
        self.push_sample(total);
        total
    }

    fn push_sample(&mut self, sample: Amount) {
        self.samples.push_back(sample);
        while self.samples.len() > WEIGHT_SAMPLES_MAX {
            self.samples.pop_front();
        }
    }

    /// Stake estimate: the trimmed mean of the retained samples, floored by
    /// the configured minimum.
    pub fn online_stake(&self) -> Amount {
        if self.samples.is_empty() {
            return self.minimum;
        }
        let mut sorted: Vec<u128> = self.samples.iter().map(|a| a.0).collect();
        sorted.sort_unstable();
        let trim = sorted.len() * TRIM_PERCENT / 100;
        let kept = &sorted[trim..sorted.len() - trim];
        let mean = if kept.is_empty() {
            // Everything trimmed away; fall back to the plain mean.
            sorted.iter().sum::<u128>() / sorted.len() as u128
        } else {
            kept.iter().sum::<u128>() / kept.len() as u128
        };
        Amount(mean.max(self.minimum.0))
    }
}
