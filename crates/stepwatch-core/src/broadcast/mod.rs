// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Live fan-out of tracker updates to connected observers.
//!
//! One [`BroadcastHub`] exists per tracking partition and owns its observer
//! set. Hubs are looked up through a [`HubRegistry`] and torn down by the
//! [`HubReaper`] once they sit empty for too long.
//!
//! Delivery is best-effort and at-most-once. A broadcast is published after
//! the corresponding durable write and never affects it.
//!
//! # Wire messages
//!
//! | Direction | `type` | Payload |
//! |-----------|--------|---------|
//! | hub → observer | `initial_data` | recent runs (default paging) |
//! | hub → observer | `update` | the published event |
//! | hub → observer | `query_result` | runs matching the observer's query |
//! | hub → observer | `error` | message |
//! | observer → hub | `query` | `run_id` or `ref_id`/`ref_type`/`status`/`limit`/`offset` |

mod hub;
mod reaper;
mod registry;

pub use hub::{BroadcastHub, BroadcastReport, ObserverId};
pub use reaper::{HubReaper, HubReaperConfig};
pub use registry::HubRegistry;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::query::{RunQuery, RunTree};

// ============================================================================
// Messages
// ============================================================================

/// Message sent from a hub to an observer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubMessage {
    /// Snapshot delivered once on subscribe.
    InitialData { data: Vec<RunTree> },
    /// A published event.
    Update { data: Value },
    /// Answer to a [`ClientMessage::Query`].
    QueryResult { data: Vec<RunTree> },
    /// A client request could not be served.
    Error { message: String },
}

/// Message sent from an observer to its hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Query(LiveQuery),
}

/// Query issued over a live channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LiveQuery {
    /// Fetch a single run; takes precedence over the filter.
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(flatten)]
    pub filter: RunQuery,
}

// ============================================================================
// Observer Sinks
// ============================================================================

/// Why a message could not be handed to an observer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    /// The observer's queue is full; the message was dropped.
    #[error("observer queue is full")]
    Full,
    /// The observer is gone and will never accept messages again.
    #[error("observer disconnected")]
    Closed,
    /// The sink refused the message.
    #[error("delivery rejected: {0}")]
    Rejected(String),
}

/// Destination for hub messages.
///
/// `deliver` is called with the hub's observer set locked and must not block.
pub trait ObserverSink: Send + Sync {
    fn deliver(&self, message: Arc<HubMessage>) -> Result<(), DeliveryError>;
}

/// Sink backed by a bounded channel. A full queue drops the message.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: mpsc::Sender<Arc<HubMessage>>,
}

impl ChannelSink {
    pub fn new(sender: mpsc::Sender<Arc<HubMessage>>) -> Self {
        Self { sender }
    }

    /// Create a sink and the receiver that drains it.
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<Arc<HubMessage>>) {
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        (Self::new(sender), receiver)
    }
}

impl ObserverSink for ChannelSink {
    fn deliver(&self, message: Arc<HubMessage>) -> Result<(), DeliveryError> {
        self.sender.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => DeliveryError::Full,
            TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }
}
