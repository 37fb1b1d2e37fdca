use crate::stats::{StatExt, DISPATCHED_ITEMS, DROPPED_ITEMS};

use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use thiserror::Error;

/// Bounded queue between the emitter and the consumer of output items.
///
/// Dispatching never blocks: a full or disconnected queue drops the item and reports it.
#[derive(Debug, Clone)]
pub struct OutputSink<T> {
    sender: Sender<T>,
    receiver: Receiver<T>,
}

impl<T: Send + 'static> OutputSink<T> {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = bounded(capacity);
        OutputSink { sender, receiver }
    }

    pub fn dispatch(&self, data: T) -> Result<(), DispatchError<T>> {
        match self.sender.try_send(data) {
            Ok(()) => {
                DISPATCHED_ITEMS.inc();
                Ok(())
            }
            Err(e) => {
                DROPPED_ITEMS.inc();
                Err(DispatchError::SendFailed(e))
            }
        }
    }

    /// A handle for consumers. Receivers may be cloned across consumer threads.
    pub fn receiver(&self) -> Receiver<T> {
        self.receiver.clone()
    }
}

#[derive(Debug, Error)]
pub enum DispatchError<T> {
    #[error("Failed to send data")]
    SendFailed(#[from] TrySendError<T>),
}
