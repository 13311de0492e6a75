//! Input side of a codec session.
//!
//! The client allocates a buffer, fills it and submits it; independently the
//! platform announces free input slots. Submitted samples are paired with
//! slots strictly in order, copied into platform memory and queued.

use std::collections::VecDeque;

use tracing::{debug, trace, warn};
use wavry_common::{
    Error, InputTicket, Result, SampleFlags, SampleInfo, SessionEvent, SlotId, SubmitRequest,
};
use wavry_media::{Buffer, BufferPool, BufferPoolStats, PlatformCodec, Sample};

use crate::dispatch::EventDispatcher;

pub struct InputProcessor {
    pool: BufferPool,
    /// Allocated by the client, not yet submitted. Submits match these in order.
    unfilled: VecDeque<Sample>,
    /// Submitted and waiting for a platform slot.
    ready: VecDeque<Sample>,
    slots: VecDeque<SlotId>,
    /// Largest sample the client may allocate for.
    max_size: Option<usize>,
    stopped: bool,
    capacity_learned: bool,
}

impl InputProcessor {
    pub fn new(pool: BufferPool) -> Self {
        Self {
            pool,
            unfilled: VecDeque::new(),
            ready: VecDeque::new(),
            slots: VecDeque::new(),
            max_size: None,
            stopped: true,
            capacity_learned: false,
        }
    }

    pub fn with_max_size(mut self, max_size: Option<usize>) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn start(&mut self) {
        self.stopped = false;
    }

    /// Give every queued buffer back to the pool and forget all slots.
    pub fn stop(&mut self) {
        let samples: Vec<Sample> = self.unfilled.drain(..).chain(self.ready.drain(..)).collect();
        let returned = samples.len();
        for mut sample in samples {
            if let Some(buffer) = sample.take_buffer() {
                self.pool.recycle(buffer);
            }
        }
        self.slots.clear();
        self.stopped = true;
        if returned > 0 {
            debug!(returned, "input stopped with queued samples");
        }
    }

    /// Stop and dispose the pool entirely.
    pub fn release(&mut self) {
        self.stop();
        self.pool.clear();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn pool_stats(&self) -> BufferPoolStats {
        self.pool.stats()
    }

    /// Samples allocated or submitted but not yet handed to the codec.
    pub fn pending(&self) -> usize {
        self.unfilled.len() + self.ready.len()
    }

    pub fn available_slots(&self) -> usize {
        self.slots.len()
    }

    pub fn allocate(&mut self, size: usize, generation: u32) -> Result<InputTicket> {
        if self.stopped {
            return Err(Error::invalid_state("input is stopped"));
        }
        if let Some(max) = self.max_size.filter(|&max| size > max) {
            return Err(Error::invalid_argument(format!(
                "input of {size} bytes exceeds the {max} byte maximum"
            )));
        }
        let buffer = self.pool.obtain(size)?;
        let ticket = InputTicket {
            buffer: buffer.id(),
            capacity: buffer.capacity(),
            generation,
        };
        self.unfilled.push_back(Sample::with_buffer(
            buffer,
            SampleInfo::new(0, size, SampleFlags::empty()),
        ));
        trace!(buffer = %ticket.buffer, size, "input buffer allocated");
        Ok(ticket)
    }

    pub fn submit(
        &mut self,
        request: SubmitRequest,
        generation: u32,
        codec: &mut dyn PlatformCodec,
        events: &EventDispatcher,
    ) -> Result<()> {
        if self.stopped {
            debug!(buffer = %request.buffer, "input stopped, ignoring submit");
            return Ok(());
        }
        if request.generation != generation {
            debug!(
                buffer = %request.buffer,
                stale = request.generation,
                current = generation,
                "ignoring submit from a previous generation"
            );
            return Ok(());
        }

        let front = self.unfilled.front().and_then(Sample::buffer_id);
        if front != Some(request.buffer) {
            let duplicate = !self.pool.owns(request.buffer)
                || self
                    .ready
                    .iter()
                    .any(|sample| sample.buffer_id() == Some(request.buffer));
            if duplicate {
                debug!(buffer = %request.buffer, "ignoring duplicate submit");
                return Ok(());
            }
            return Err(Error::invalid_argument(format!(
                "input {} submitted out of allocation order",
                request.buffer
            )));
        }

        let Some(mut sample) = self.unfilled.pop_front() else {
            return Err(Error::internal("unfilled queue emptied under the session lock"));
        };
        let capacity = sample.buffer().map(Buffer::capacity).unwrap_or(0);
        if let Err(err) = validate(&request, capacity) {
            if let Some(buffer) = sample.take_buffer() {
                self.pool.recycle(buffer);
            }
            return Err(err);
        }

        let timestamp_us = request.info.timestamp_us;
        sample.set_info(request.info);
        sample.set_crypto(request.crypto);
        self.enqueue_ready(sample, timestamp_us, codec, events);
        Ok(())
    }

    /// End of stream needs no buffer and skips the unfilled queue.
    pub fn submit_end_of_stream(
        &mut self,
        timestamp_us: i64,
        codec: &mut dyn PlatformCodec,
        events: &EventDispatcher,
    ) {
        if self.stopped {
            debug!("input stopped, ignoring end of stream");
            return;
        }
        let sample = Sample::without_buffer(SampleInfo::end_of_stream(timestamp_us));
        self.enqueue_ready(sample, timestamp_us, codec, events);
    }

    pub fn on_slot_available(
        &mut self,
        slot: SlotId,
        codec: &mut dyn PlatformCodec,
        events: &EventDispatcher,
    ) {
        if self.stopped {
            trace!(%slot, "input stopped, ignoring slot");
            return;
        }
        if self.slots.contains(&slot) {
            debug!(%slot, "ignoring duplicate input slot");
            return;
        }
        self.slots.push_back(slot);
        self.drain(codec, events);
    }

    fn enqueue_ready(
        &mut self,
        sample: Sample,
        timestamp_us: i64,
        codec: &mut dyn PlatformCodec,
        events: &EventDispatcher,
    ) {
        self.ready.push_back(sample);
        self.drain(codec, events);
        // Draining works from the front, so anything left includes this sample.
        if !self.ready.is_empty() {
            events.enqueue(SessionEvent::InputStatus {
                timestamp_us,
                processed: false,
            });
        }
    }

    fn drain(&mut self, codec: &mut dyn PlatformCodec, events: &EventDispatcher) {
        while !self.ready.is_empty() {
            let Some(slot) = self.slots.pop_front() else {
                return;
            };
            let Some(platform) = codec.input_buffer(slot) else {
                debug!(%slot, "dropping stale input slot");
                continue;
            };
            if !self.capacity_learned {
                self.capacity_learned = true;
                self.pool.set_default_size(platform.len());
            }
            let Some(mut sample) = self.ready.pop_front() else {
                return;
            };

            let info = *sample.info();
            let copied = match sample.buffer() {
                Some(_) if info.size > platform.len() => Err(Error::codec(format!(
                    "input of {} bytes does not fit platform buffer of {} bytes",
                    info.size,
                    platform.len()
                ))),
                Some(buffer) => {
                    buffer.memory().with_bytes(|bytes| {
                        platform[..info.size]
                            .copy_from_slice(&bytes[info.offset..info.offset + info.size])
                    });
                    Ok(())
                }
                None => Ok(()),
            };
            let queued = copied.and_then(|()| {
                codec
                    .queue_input(slot, SampleInfo { offset: 0, ..info }, sample.crypto())
                    .map_err(Error::codec)
            });

            if let Some(buffer) = sample.take_buffer() {
                self.pool.recycle(buffer);
            }

            match queued {
                Ok(()) => {
                    trace!(%slot, timestamp_us = info.timestamp_us, "input queued");
                    events.enqueue(SessionEvent::InputStatus {
                        timestamp_us: info.timestamp_us,
                        processed: true,
                    });
                }
                Err(err) => {
                    warn!(%slot, timestamp_us = info.timestamp_us, error = %err, "codec rejected input");
                    self.slots.push_front(slot);
                    events.enqueue(SessionEvent::Error { fatal: false });
                }
            }
        }
    }
}

fn validate(request: &SubmitRequest, capacity: usize) -> Result<()> {
    let info = &request.info;
    match info.offset.checked_add(info.size) {
        Some(end) if end <= capacity => {}
        _ => {
            return Err(Error::invalid_argument(format!(
                "sample {}+{} exceeds buffer of {capacity} bytes",
                info.offset, info.size
            )))
        }
    }
    if let Some(crypto) = &request.crypto {
        crypto.validate(info.size)?;
    }
    Ok(())
}
