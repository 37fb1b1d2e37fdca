use super::sink::OutputSink;
use super::OutputItem;
use crate::stats::{StatExt, MATCHED_PAIRS};
use crate::stream::Stream;

/// Single chokepoint between correlators and the output sink.
#[derive(Debug)]
pub struct Emitter {
    sink: OutputSink<OutputItem>,
}

impl Emitter {
    pub fn new(sink: OutputSink<OutputItem>) -> Self {
        Emitter { sink }
    }

    /// Emits a matched pair of `stream`.
    ///
    /// Counts the match and marks the stream worth persisting. Unless the stream only identifies
    /// its protocol, the item receives the stream's next index and is queued. Indices are only
    /// consumed by items that actually entered the sink.
    pub fn emit(&self, stream: &Stream, mut item: OutputItem) {
        MATCHED_PAIRS.inc();
        stream.mark_persistent();
        if stream.identify_only() {
            return;
        }
        stream.with_next_index(|index| {
            item.index = index;
            match self.sink.dispatch(item) {
                Ok(()) => true,
                Err(error) => {
                    log::error!("Stream {}: dropping item {}: {}", stream.id(), index, error);
                    false
                }
            }
        });
    }
}
