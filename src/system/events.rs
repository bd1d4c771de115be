//! Event plumbing between the host, the connection manager and listeners
//!
//! Inbound host callbacks travel on a [`LinkEventChannel`]; decoded data and connection
//! changes go out on an [`UpdateBus`].

use crate::types::Reading;
use embassy_sync::{
    blocking_mutex::raw::CriticalSectionRawMutex,
    channel::Channel,
    pubsub::{self, PubSubChannel, Subscriber, WaitResult},
};
use embassy_time::Instant;

/// Largest notification payload carried on the inbound channel.
pub const MAX_PACKET_SIZE: usize = 64;

pub type Packet = heapless::Vec<u8, MAX_PACKET_SIZE>;

/// Host callback, delivered to the connection manager.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Advertisement { seen_at: Instant },
    Disconnected,
    Notification(Packet),
}

impl LinkEvent {
    /// Notification event; payload beyond [`MAX_PACKET_SIZE`] is cut off.
    pub fn notification(data: &[u8]) -> Self {
        let data = &data[..data.len().min(MAX_PACKET_SIZE)];
        LinkEvent::Notification(Packet::from_slice(data).unwrap_or_default())
    }
}

pub type LinkEventChannel = Channel<CriticalSectionRawMutex, LinkEvent, 16>;

/// What listeners of a session get to see.
#[derive(Debug, Clone, PartialEq)]
pub enum ScaleUpdate {
    Reading(Reading),
    Connected,
    /// Link dropped; the last published data should no longer be trusted.
    Stale,
}

const UPDATE_CAPACITY: usize = 8;
const MAX_LISTENERS: usize = 4;

type UpdateChannel = PubSubChannel<CriticalSectionRawMutex, ScaleUpdate, UPDATE_CAPACITY, MAX_LISTENERS, 1>;

pub struct UpdateBus {
    channel: UpdateChannel,
}

impl Default for UpdateBus {
    fn default() -> Self {
        Self::new()
    }
}

impl UpdateBus {
    pub fn new() -> Self {
        Self {
            channel: PubSubChannel::new(),
        }
    }

    /// Never waits; a slow listener loses the oldest updates instead.
    pub fn publish(&self, update: ScaleUpdate) {
        self.channel.immediate_publisher().publish_immediate(update);
    }

    pub fn subscribe(&self) -> Result<UpdateSubscriber<'_>, pubsub::Error> {
        Ok(UpdateSubscriber {
            inner: self.channel.subscriber()?,
        })
    }
}

pub struct UpdateSubscriber<'a> {
    inner: Subscriber<'a, CriticalSectionRawMutex, ScaleUpdate, UPDATE_CAPACITY, MAX_LISTENERS, 1>,
}

impl<'a> UpdateSubscriber<'a> {
    pub async fn next_update(&mut self) -> ScaleUpdate {
        loop {
            match self.inner.next_message().await {
                WaitResult::Lagged(count) => {
                    log::debug!("Update listener lagged, {} updates dropped", count);
                    continue;
                }
                WaitResult::Message(update) => return update,
            }
        }
    }

    pub fn try_next_update(&mut self) -> Option<ScaleUpdate> {
        loop {
            match self.inner.try_next_message()? {
                WaitResult::Lagged(_) => continue,
                WaitResult::Message(update) => return Some(update),
            }
        }
    }
}
