use super::{MuxFormat, MuxQuery, MuxReply, MuxerState, StreamId};
use crate::block::{Block, BlockQueue, QueueLimits};
use crate::error::{Error, RejectReason, Result};
use crate::format::EsFormat;
use crate::sink::AccessOutput;
use mpipe_common::config::DEFAULT_ADD_STREAM_WAIT_US;
use mpipe_common::events::PipelineEvent;
use mpipe_common::Mtime;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// Registered input of a muxer
struct InputStream {
    id: StreamId,
    queue: BlockQueue,
    format: EsFormat,
    active: bool,
}

struct MuxerInner {
    state: MuxerState,
    format: Box<dyn MuxFormat>,
    access: Option<Box<dyn AccessOutput>>,
    inputs: Vec<InputStream>,
    next_stream: u32,
    /// Set once the first block has been written
    started: bool,
}

/// Producer-side handle returned by [`Muxer::add_stream`]
#[derive(Debug, Clone)]
pub struct InputHandle {
    pub id: StreamId,
    pub queue: BlockQueue,
}

impl InputHandle {
    /// Queue a block for the next `mux()` call
    pub fn push(&self, block: Block) -> Result<()> {
        self.queue.push(block)
    }
}

/// Muxer host
///
/// All operations take `&self` and serialize on one internal lock, so
/// `add_stream`/`del_stream` never interleave with a `mux()` walking the
/// input list. Producers only touch their own [`BlockQueue`] and never
/// contend with that lock.
pub struct Muxer {
    id: Uuid,
    inner: Mutex<MuxerInner>,
    queue_limits: QueueLimits,
    /// Bound on the wait-for-first-block gate
    add_stream_wait: Mtime,
    events: Option<broadcast::Sender<PipelineEvent>>,
}

impl Muxer {
    pub fn new(format: Box<dyn MuxFormat>) -> Self {
        Self {
            id: Uuid::new_v4(),
            inner: Mutex::new(MuxerInner {
                state: MuxerState::Closed,
                format,
                access: None,
                inputs: Vec::new(),
                next_stream: 0,
                started: false,
            }),
            queue_limits: QueueLimits::unbounded(),
            add_stream_wait: DEFAULT_ADD_STREAM_WAIT_US,
            events: None,
        }
    }

    /// Bound every input queue created by [`add_stream`](Self::add_stream)
    pub fn with_queue_limits(mut self, limits: QueueLimits) -> Self {
        self.queue_limits = limits;
        self
    }

    /// Stop waiting for idle inputs once another input has queued `window`
    /// of media, or filled its queue
    pub fn with_add_stream_wait(mut self, window: Mtime) -> Self {
        self.add_stream_wait = window;
        self
    }

    pub fn with_events(mut self, events: broadcast::Sender<PipelineEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> MuxerState {
        self.lock().state
    }

    pub fn format_name(&self) -> &'static str {
        self.lock().format.name()
    }

    /// Number of active inputs
    pub fn input_count(&self) -> usize {
        self.lock().inputs.iter().filter(|i| i.active).count()
    }

    /// Queue of input `id`, if it is still active
    pub fn input_queue(&self, id: StreamId) -> Option<BlockQueue> {
        self.lock()
            .inputs
            .iter()
            .find(|i| i.id == id && i.active)
            .map(|i| i.queue.clone())
    }

    /// Attach the access output; `Closed` -> `Open`
    pub fn open(&self, access: Box<dyn AccessOutput>) -> Result<()> {
        let mut inner = self.lock();
        if inner.state != MuxerState::Closed {
            return Err(Error::Rejected(RejectReason::State(inner.state)));
        }
        inner.access = Some(access);
        inner.state = MuxerState::Open;
        info!("Muxer {} ({}) opened", self.id, inner.format.name());
        Ok(())
    }

    /// Register an input stream
    ///
    /// Rejected with no side effect when the muxer is not `Open`/`Active`,
    /// when muxing started and the format forbids late inputs, when the
    /// input limit is reached, or when the codec is not supported.
    pub fn add_stream(&self, format: EsFormat) -> Result<InputHandle> {
        let mut inner = self.lock();
        let caps = inner.format.capabilities();

        match inner.state {
            MuxerState::Open => {}
            MuxerState::Active if caps.add_while_muxing => {}
            MuxerState::Active => return Err(Error::Rejected(RejectReason::AddWhileMuxing)),
            state => return Err(Error::Rejected(RejectReason::State(state))),
        }

        let active = inner.inputs.iter().filter(|i| i.active).count();
        if let Some(max) = caps.max_inputs {
            if active >= max {
                warn!(
                    "Muxer {}: rejecting {} stream, only {} input(s) allowed",
                    self.id, format.codec, max
                );
                return Err(Error::Rejected(RejectReason::TooManyInputs { max }));
            }
        }

        if let Err(reason) = inner.format.accepts(&format) {
            warn!("Muxer {}: rejecting stream: {}", self.id, reason);
            return Err(Error::Rejected(reason));
        }

        let id = StreamId(inner.next_stream);
        inner.next_stream += 1;
        let queue = BlockQueue::with_limits(self.queue_limits);
        let codec = format.codec;
        inner.inputs.push(InputStream {
            id,
            queue: queue.clone(),
            format,
            active: true,
        });
        drop(inner);

        debug!("Muxer {}: added stream {} ({})", self.id, id, codec);
        self.publish(PipelineEvent::StreamAdded {
            muxer_id: self.id,
            stream_id: id.0,
            codec: codec.to_string(),
            timestamp: chrono::Utc::now(),
        });

        Ok(InputHandle { id, queue })
    }

    /// Mark an input inactive and release its pending blocks
    ///
    /// Returns the number of blocks discarded.
    pub fn del_stream(&self, id: StreamId) -> Result<usize> {
        let mut inner = self.lock();
        let Some(input) = inner.inputs.iter_mut().find(|i| i.id == id) else {
            return Err(Error::Rejected(RejectReason::UnknownStream(id)));
        };
        if !input.active {
            return Ok(0);
        }

        input.active = false;
        let discarded = input.queue.clear();
        let codec = input.format.codec;
        drop(inner);

        debug!(
            "Muxer {}: removed stream {} ({}), {} pending block(s) released",
            self.id, id, codec, discarded
        );
        self.publish(PipelineEvent::StreamRemoved {
            muxer_id: self.id,
            stream_id: id.0,
            timestamp: chrono::Utc::now(),
        });

        Ok(discarded)
    }

    pub fn control(&self, query: &MuxQuery) -> Result<MuxReply> {
        self.lock().format.control(query)
    }

    /// Write every block already queued on each active input
    ///
    /// Never waits for data. Each input is drained up to the count it held
    /// when its turn came, so a fast producer cannot starve the others.
    /// Returns the number of blocks written. A write failure fails this
    /// call; blocks not yet taken stay queued for a later call.
    pub fn mux(&self) -> Result<usize> {
        let mut guard = self.lock();
        let inner = &mut *guard;

        match inner.state {
            MuxerState::Open => inner.state = MuxerState::Active,
            MuxerState::Active => {}
            state => return Err(Error::Rejected(RejectReason::State(state))),
        }

        let caps = inner.format.capabilities();
        if caps.wait_for_first_block && !inner.started && self.waiting_for_inputs(&inner.inputs) {
            return Ok(0);
        }

        let Some(access) = inner.access.as_mut() else {
            return Err(Error::InvalidState("muxer has no access output".to_string()));
        };

        let mut written = 0;
        for input in inner.inputs.iter().filter(|i| i.active) {
            let pending = input.queue.count();
            for _ in 0..pending {
                let Some(block) = input.queue.try_pop() else {
                    break;
                };
                if let Err(e) = inner.format.write_block(input.id, block, &mut **access) {
                    error!("Muxer {}: write failed on stream {}: {}", self.id, input.id, e);
                    self.publish(PipelineEvent::MuxWriteFailed {
                        muxer_id: self.id,
                        reason: e.to_string(),
                        timestamp: chrono::Utc::now(),
                    });
                    return Err(e);
                }
                written += 1;
                inner.started = true;
            }
        }

        Ok(written)
    }

    /// Write the format trailer, flush and detach the access output
    ///
    /// Pending blocks on every input are released. The muxer ends in
    /// `Finished` even when the trailer write fails. Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        if inner.state == MuxerState::Finished {
            return Ok(());
        }
        inner.state = MuxerState::Finished;

        let discarded: usize = inner
            .inputs
            .iter_mut()
            .filter(|i| i.active)
            .map(|i| {
                i.active = false;
                i.queue.clear()
            })
            .sum();

        let result = match inner.access.take() {
            Some(mut access) => inner
                .format
                .close(&mut *access)
                .and_then(|()| access.flush()),
            None => Ok(()),
        };

        match &result {
            Ok(()) => info!(
                "Muxer {} ({}) closed, {} pending block(s) released",
                self.id,
                inner.format.name(),
                discarded
            ),
            Err(e) => warn!("Muxer {} close failed: {}", self.id, e),
        }
        result
    }

    /// Whether the first write must still wait for an idle input
    fn waiting_for_inputs(&self, inputs: &[InputStream]) -> bool {
        let mut active = inputs.iter().filter(|i| i.active).peekable();
        if active.peek().is_none() {
            return true;
        }

        let mut waiting = false;
        for input in active {
            if input.queue.is_empty() {
                waiting = true;
            } else if input.queue.is_full()
                || input
                    .queue
                    .pending_span()
                    .is_some_and(|span| span >= self.add_stream_wait)
            {
                trace!("Muxer {}: stream {} buffered enough, not waiting", self.id, input.id);
                return false;
            }
        }
        waiting
    }

    fn lock(&self) -> MutexGuard<'_, MuxerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, event: PipelineEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}

impl std::fmt::Debug for Muxer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("Muxer")
            .field("id", &self.id)
            .field("format", &inner.format.name())
            .field("state", &inner.state)
            .field("inputs", &inner.inputs.len())
            .finish()
    }
}
