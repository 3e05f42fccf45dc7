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

//! Publish/subscribe notification of ledger events.
//!
//! The wallet watches accounts by subscribing to `BLOCK` and `CONFIRM`;
//! the network layer subscribes to republish applied blocks. A subscriber
//! closing its channel end is treated as an implicit unsubscribe.

use super::{BlockResponseSender, Message};
use serde::de::Error as SerdeError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

bitflags::bitflags! {
    /// Service event kinds.
    pub struct Event: u8 {
        /// Block applied to the ledger.
        const BLOCK = 1 << 0;
        /// Block confirmed by an election.
        const CONFIRM = 1 << 1;
        /// Conflicting block observed for an active root.
        const FORK = 1 << 2;
        /// Verified vote accepted by the pipeline.
        const VOTE = 1 << 3;
    }
}

const EVENTS_NUM: usize = 4;

impl Serialize for Event {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u8(self.bits)
    }
}

impl<'de> Deserialize<'de> for Event {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct EventVisitor;

        impl<'de> serde::de::Visitor<'de> for EventVisitor {
            type Value = u8;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("u8")
            }

            fn visit_u8<R>(self, value: u8) -> std::result::Result<u8, R> {
                Ok(value)
            }
        }

        let bits = deserializer.deserialize_u8(EventVisitor)?;
        Event::from_bits(bits).ok_or_else(|| SerdeError::custom("invalid bits"))
    }
}

/// Service event subscribers.
pub(crate) struct PubSub {
    events_sub: HashMap<Event, HashMap<String, BlockResponseSender>>,
}

impl Default for PubSub {
    fn default() -> Self {
        PubSub {
            events_sub: HashMap::new(),
        }
    }
}

impl PubSub {
    pub fn new() -> Self {
        PubSub::default()
    }

    /// Check if the `event` kind has subscribers.
    pub fn has_subscribers(&self, event: Event) -> bool {
        match self.events_sub.get(&event) {
            Some(subs) => !subs.is_empty(),
            None => false,
        }
    }

    /// Subscribe to service events. `events` is a bitflag so multiple kinds
    /// can be OR-ed together; notifications arrive on `chan`.
    pub fn subscribe(&mut self, id: String, events: Event, chan: BlockResponseSender) {
        for i in 0..EVENTS_NUM {
            if let Some(event) = Event::from_bits((1 << i) & events.bits) {
                if event.is_empty() {
                    continue;
                }
                debug!("[sub] '{}' subscribed to '{:?}' event", id, event);
                self.events_sub
                    .entry(event)
                    .or_default()
                    .insert(id.clone(), chan.clone());
            }
        }
    }

    /// Unsubscribe from service events.
    pub fn unsubscribe(&mut self, id: String, events: Event) {
        for i in 0..EVENTS_NUM {
            if let Some(event) = Event::from_bits((1 << i) & events.bits) {
                if event.is_empty() {
                    continue;
                }
                debug!("[sub] '{}' unsubscribed from '{:?}' event", id, event);
                if let Some(event_subs) = self.events_sub.get_mut(&event) {
                    event_subs.remove(&id);
                    if event_subs.is_empty() {
                        self.events_sub.remove(&event);
                    }
                }
            }
        }
    }

    /// Publish a service event to its subscribers.
    pub fn publish(&mut self, event: Event, msg: Message) {
        if let Some(event_subs) = self.events_sub.get_mut(&event) {
            let mut closed_chans = vec![];
            for (id, chan) in event_subs.iter() {
                if chan.is_closed() {
                    closed_chans.push(id.clone());
                    continue;
                }
                let id = id.clone();
                let chan = chan.clone();
                let msg = msg.clone();
                async_std::task::spawn(async move {
                    if chan.send(msg).await.is_err() {
                        debug!("[sub] error publishing to '{}', closing channel", id);
                        chan.close();
                    }
                });
            }
            closed_chans.iter().for_each(|id| {
                debug!("[sub] removing closed subscriber '{}'", id);
                event_subs.remove(id);
            });
            if event_subs.is_empty() {
                self.events_sub.remove(&event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel;

    #[test]
    fn events_subscribe() {
        let mut pubsub = PubSub::default();
        let (sender, _receiver) = channel::simple_channel();

        pubsub.subscribe("wallet".to_string(), Event::BLOCK | Event::CONFIRM, sender);

        assert!(pubsub.has_subscribers(Event::BLOCK));
        assert!(pubsub.has_subscribers(Event::CONFIRM));
        assert!(!pubsub.has_subscribers(Event::FORK));
    }

    #[test]
    fn events_unsubscribe() {
        let mut pubsub = PubSub::default();
        let (sender, _receiver) = channel::simple_channel();
        pubsub.subscribe("wallet".to_string(), Event::BLOCK | Event::CONFIRM, sender);

        pubsub.unsubscribe("wallet".to_string(), Event::BLOCK);

        assert!(!pubsub.has_subscribers(Event::BLOCK));
        assert!(pubsub.has_subscribers(Event::CONFIRM));
    }

    #[test]
    fn publish_reaches_subscriber() {
        let mut pubsub = PubSub::default();
        let (sender, receiver) = channel::simple_channel();
        pubsub.subscribe("observer".to_string(), Event::CONFIRM, sender);

        pubsub.publish(
            Event::CONFIRM,
            Message::BlockConfirmed {
                hash: crate::crypto::Hash::new([1; 32]),
                account: crate::base::schema::Account::new([2; 32]),
            },
        );

        match receiver.recv_sync().unwrap() {
            Message::BlockConfirmed { hash, .. } => {
                assert_eq!(hash, crate::crypto::Hash::new([1; 32]))
            }
            _ => panic!("unexpected"),
        }
    }

    #[test]
    fn publish_drops_closed_subscriber() {
        let mut pubsub = PubSub::default();
        let (sender, receiver) = channel::simple_channel();
        pubsub.subscribe("observer".to_string(), Event::BLOCK, sender);
        drop(receiver);

        pubsub.publish(
            Event::BLOCK,
            Message::BlockConfirmed {
                hash: crate::crypto::Hash::new([1; 32]),
                account: crate::base::schema::Account::new([2; 32]),
            },
        );

        assert!(!pubsub.has_subscribers(Event::BLOCK));
    }
}
