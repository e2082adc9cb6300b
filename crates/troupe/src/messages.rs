use std::fmt;

use crate::completion::Completer;
use crate::delay_queue::OnCancel;
use crate::handler::Handler;
use crate::id::ObjectId;
use crate::metrics::DispatcherStats;
use crate::state::WorkerSlot;

/// Everything that crosses into the command loop.
///
/// External callers and worker threads never touch dispatcher state; they
/// push one of these onto the command channel and, when they need an answer,
/// wait on the completion token paired with `response_tx`.
pub enum Command<M> {
    AddObject {
        handler: Box<dyn Handler<M>>,
        response_tx: Completer<ObjectId>,
    },
    RemoveObject {
        id: ObjectId,
        response_tx: Completer<()>,
    },
    PostMessage {
        id: ObjectId,
        message: M,
        /// `None` for fire-and-forget posts from a [`PostBridge`](crate::system::PostBridge)
        response_tx: Option<Completer<bool>>,
    },
    PostMessageLater {
        delay: u32,
        id: ObjectId,
        message: M,
        on_cancel: OnCancel,
    },
    /// Sent by a worker after one `handle` call returns, handing the handler back
    MessageComplete {
        id: ObjectId,
        slot: WorkerSlot,
        handler: Box<dyn Handler<M>>,
    },
    GetStats {
        response_tx: Completer<DispatcherStats>,
    },
    Shutdown {
        response_tx: Completer<()>,
    },
    /// Re-read the tick source and recompute the next wait
    Wake,
}

impl<M> Command<M> {
    pub fn to_log(&self) -> String {
        match self {
            Command::AddObject { .. } => "AddObject".to_string(),
            Command::RemoveObject { id, .. } => format!("RemoveObject: {}", id),
            Command::PostMessage {
                id, response_tx, ..
            } => {
                if response_tx.is_some() {
                    format!("PostMessage: {}", id)
                } else {
                    format!("PostMessage (bridged): {}", id)
                }
            }
            Command::PostMessageLater { delay, id, .. } => {
                format!("PostMessageLater: {} in {}ms", id, delay)
            }
            Command::MessageComplete { id, slot, .. } => {
                format!("MessageComplete: {} on worker {}", id, slot)
            }
            Command::GetStats { .. } => "GetStats".to_string(),
            Command::Shutdown { .. } => "Shutdown".to_string(),
            Command::Wake => "Wake".to_string(),
        }
    }
}

impl<M> fmt::Debug for Command<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_log())
    }
}
