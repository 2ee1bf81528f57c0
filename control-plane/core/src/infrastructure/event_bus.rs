// Copyright (c) 2026 Fleet Control Project
// SPDX-License-Identifier: AGPL-3.0
//
// Event Bus - Pub/Sub for Registry Events
//
// In-memory event streaming using tokio broadcast channels. Feeds the
// metrics aggregator, the SSE endpoint and any other registry observer.
// Events are a change notification, not a source of truth: consumers
// read current state from the registry itself.

use crate::domain::events::RegistryEvent;
use crate::domain::node::AgentId;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Event bus for publishing and subscribing to registry events.
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<RegistryEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given channel capacity. Capacity
    /// bounds how many events a slow subscriber can fall behind before
    /// old ones are dropped.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Default capacity (1000 events).
    pub fn with_default_capacity() -> Self {
        Self::new(1000)
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: RegistryEvent) {
        debug!(?event, "publishing registry event");
        let receiver_count = self.sender.send(event).unwrap_or(0);
        if receiver_count == 0 {
            debug!("no subscribers listening to registry events");
        }
    }

    /// Subscribe to all registry events.
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    /// Subscribe to events for a single node. Useful for streaming the
    /// progress of one command.
    pub fn subscribe_node(&self, agent_id: AgentId) -> NodeEventReceiver {
        NodeEventReceiver {
            receiver: self.sender.subscribe(),
            agent_id,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

/// Receiver for all registry events.
pub struct EventReceiver {
    receiver: broadcast::Receiver<RegistryEvent>,
}

impl EventReceiver {
    /// Receive the next event (waits until one is available).
    pub async fn recv(&mut self) -> Result<RegistryEvent, EventBusError> {
        self.receiver.recv().await.map_err(|e| match e {
            broadcast::error::RecvError::Closed => EventBusError::Closed,
            broadcast::error::RecvError::Lagged(n) => {
                warn!("event receiver lagged by {} events", n);
                EventBusError::Lagged(n)
            }
        })
    }

    /// Try to receive an event without waiting.
    pub fn try_recv(&mut self) -> Result<RegistryEvent, EventBusError> {
        self.receiver.try_recv().map_err(|e| match e {
            broadcast::error::TryRecvError::Empty => EventBusError::Empty,
            broadcast::error::TryRecvError::Closed => EventBusError::Closed,
            broadcast::error::TryRecvError::Lagged(n) => {
                warn!("event receiver lagged by {} events", n);
                EventBusError::Lagged(n)
            }
        })
    }
}

/// Receiver filtered to a single node's events.
pub struct NodeEventReceiver {
    receiver: broadcast::Receiver<RegistryEvent>,
    agent_id: AgentId,
}

impl NodeEventReceiver {
    pub async fn recv(&mut self) -> Result<RegistryEvent, EventBusError> {
        loop {
            let event = self.receiver.recv().await.map_err(|e| match e {
                broadcast::error::RecvError::Closed => EventBusError::Closed,
                broadcast::error::RecvError::Lagged(n) => {
                    warn!("event receiver lagged by {} events", n);
                    EventBusError::Lagged(n)
                }
            })?;

            if event.agent_id() == Some(&self.agent_id) {
                return Ok(event);
            }
        }
    }
}

/// Errors that can occur when receiving events.
#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("Event bus is closed")]
    Closed,

    #[error("No events available")]
    Empty,

    #[error("Receiver lagged by {0} events (events were dropped)")]
    Lagged(u64),
}
