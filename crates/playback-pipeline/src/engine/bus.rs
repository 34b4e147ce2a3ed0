//! Message bus between a media engine and the controller's event loop.

use std::sync::Arc;

use crossbeam_channel::Sender;

use super::{EngineState, UnitId};
use crate::tag_list::TagList;

/// Origin of a bus message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageSource {
    /// The output graph itself.
    Graph,
    /// The join point where decode units are spliced together.
    Join,
    /// A decode unit, or anything it owns.
    Unit(UnitId),
}

#[derive(Clone, Debug)]
pub enum BusMessage {
    /// A new stream became audible at the output.
    StreamStart,
    /// The whole graph ran out of data.
    Eos,
    StateChanged {
        source: MessageSource,
        old: EngineState,
        new: EngineState,
        /// Further state the source is still heading to, if any.
        pending: Option<EngineState>,
    },
    Tag {
        source: MessageSource,
        tags: TagList,
    },
    Info {
        source: MessageSource,
        text: String,
    },
    Warning {
        source: MessageSource,
        text: String,
    },
    Error {
        source: MessageSource,
        text: String,
    },
    Buffering {
        source: MessageSource,
        percent: u32,
    },
    DurationChanged {
        source: MessageSource,
    },
    Latency,
    /// The engine asks the application to change the graph state.
    RequestState {
        state: EngineState,
    },
    /// Wake-up posted after a unit's output hit end-of-stream.
    StreamEos,
}

/// Decides whether messages from a unit are still meaningful.
pub trait SourceFilter: Send + Sync {
    /// `true` once the unit started shutting down (or never existed).
    fn is_retired(&self, id: UnitId) -> bool;
}

/// A message tagged with the graph generation that produced it.
#[derive(Clone, Debug)]
pub struct Envelope {
    pub epoch: u64,
    pub message: BusMessage,
}

/// Posting side of the bus, handed to an output graph and its units.
///
/// Cloning is cheap. Every graph built by the controller gets its own epoch
/// so messages from a torn-down graph can be recognised and dropped.
#[derive(Clone)]
pub struct Bus {
    tx: Sender<Envelope>,
    epoch: u64,
    filter: Arc<dyn SourceFilter>,
}

impl Bus {
    pub fn new(tx: Sender<Envelope>, epoch: u64, filter: Arc<dyn SourceFilter>) -> Self {
        Self { tx, epoch, filter }
    }

    /// Post a message. Errors from units that are shutting down are dropped.
    ///
    /// Returns `false` if the message was dropped or nobody is listening.
    pub fn post(&self, message: BusMessage) -> bool {
        if let BusMessage::Error {
            source: MessageSource::Unit(id),
            text,
        } = &message
        {
            if self.filter.is_retired(*id) {
                tracing::debug!(unit = id.0, error = %text, "dropping error from unit in shutdown");
                return false;
            }
        }
        self.tx
            .send(Envelope {
                epoch: self.epoch,
                message,
            })
            .is_ok()
    }
}
