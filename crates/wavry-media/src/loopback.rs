//! Software pass-through codec.
//!
//! Every queued input comes back out unchanged as an output. Callbacks are not
//! invoked directly: they are queued and handed to the session by
//! [`LoopbackDriver::pump`], which plays the role of the platform codec's
//! callback thread.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};
use wavry_common::{
    Codec, CodecCapability, ConfigureFlags, CryptoInfo, MediaFormat, RenderTarget, SampleInfo,
    SlotId,
};

use crate::codec::{CodecFactory, CodecFault, PlatformCallbacks, PlatformCodec};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopbackConfig {
    pub input_slots: usize,
    pub output_slots: usize,
    pub input_capacity: usize,
    pub output_capacity: usize,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            input_slots: 4,
            output_slots: 4,
            input_capacity: 64 * 1024,
            output_capacity: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopbackStats {
    pub queued_inputs: u64,
    pub rendered_outputs: u64,
    pub dropped_outputs: u64,
    pub flushes: u64,
}

#[derive(Debug, Clone)]
enum CodecEvent {
    InputSlot(SlotId),
    Output(SlotId, SampleInfo),
    FormatChanged(MediaFormat),
    Error(CodecFault),
}

#[derive(Default)]
struct EventQueue {
    callbacks: Option<Arc<dyn PlatformCallbacks>>,
    events: VecDeque<CodecEvent>,
    released: bool,
    stats: LoopbackStats,
}

/// Delivers a loopback codec's queued callbacks.
#[derive(Clone)]
pub struct LoopbackDriver {
    queue: Arc<Mutex<EventQueue>>,
}

impl LoopbackDriver {
    /// Deliver queued callbacks until none are left. Returns how many were delivered.
    ///
    /// Callbacks run without the queue lock held, so they may call back into the codec.
    pub fn pump(&self) -> usize {
        let mut delivered = 0;
        loop {
            let next = {
                let mut queue = self.queue.lock();
                match (queue.events.pop_front(), queue.callbacks.clone()) {
                    (Some(event), Some(callbacks)) => Some((event, callbacks)),
                    _ => None,
                }
            };
            let Some((event, callbacks)) = next else {
                return delivered;
            };

            trace!(?event, "delivering loopback callback");
            match event {
                CodecEvent::InputSlot(slot) => callbacks.on_input_slot_available(slot),
                CodecEvent::Output(slot, info) => callbacks.on_output_available(slot, info),
                CodecEvent::FormatChanged(format) => callbacks.on_format_changed(format),
                CodecEvent::Error(fault) => callbacks.on_error(fault),
            }
            delivered += 1;
        }
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().events.len()
    }

    /// Queue an asynchronous codec error.
    pub fn inject_error(&self, fault: CodecFault) {
        self.queue.lock().events.push_back(CodecEvent::Error(fault));
    }

    pub fn stats(&self) -> LoopbackStats {
        self.queue.lock().stats.clone()
    }

    pub fn is_released(&self) -> bool {
        self.queue.lock().released
    }
}

struct InputSlot {
    data: Vec<u8>,
    dequeued: bool,
}

struct OutputSlot {
    data: Vec<u8>,
    pending: Option<SampleInfo>,
}

pub struct LoopbackCodec {
    config: LoopbackConfig,
    queue: Arc<Mutex<EventQueue>>,
    format: Option<MediaFormat>,
    format_reported: bool,
    running: bool,
    inputs: Vec<InputSlot>,
    outputs: Vec<OutputSlot>,
    backlog: VecDeque<(Vec<u8>, SampleInfo)>,
}

impl LoopbackCodec {
    pub fn new(config: LoopbackConfig) -> (Self, LoopbackDriver) {
        let queue = Arc::new(Mutex::new(EventQueue::default()));
        let codec = Self {
            config,
            queue: queue.clone(),
            format: None,
            format_reported: false,
            running: false,
            inputs: (0..config.input_slots)
                .map(|_| InputSlot {
                    data: vec![0; config.input_capacity],
                    dequeued: false,
                })
                .collect(),
            outputs: (0..config.output_slots)
                .map(|_| OutputSlot {
                    data: vec![0; config.output_capacity],
                    pending: None,
                })
                .collect(),
            backlog: VecDeque::new(),
        };
        (codec, LoopbackDriver { queue })
    }

    fn emit(&self, event: CodecEvent) {
        self.queue.lock().events.push_back(event);
    }

    fn reset_slots(&mut self) {
        for slot in &mut self.inputs {
            slot.dequeued = false;
        }
        for slot in &mut self.outputs {
            slot.pending = None;
        }
        self.backlog.clear();
        self.queue.lock().events.clear();
    }

    /// Move backlogged results into free output slots.
    fn drain_backlog(&mut self) {
        while !self.backlog.is_empty() {
            let Some(index) = self.outputs.iter().position(|slot| slot.pending.is_none()) else {
                return;
            };
            let Some((payload, info)) = self.backlog.pop_front() else {
                return;
            };

            if payload.len() > self.config.output_capacity {
                debug!(size = payload.len(), "loopback output exceeds slot capacity");
                self.emit(CodecEvent::Error(CodecFault {
                    code: -1,
                    recoverable: true,
                }));
                continue;
            }

            if !self.format_reported {
                if let Some(format) = self.format {
                    self.emit(CodecEvent::FormatChanged(format));
                }
                self.format_reported = true;
            }

            let slot = &mut self.outputs[index];
            slot.data[..payload.len()].copy_from_slice(&payload);
            let info = SampleInfo {
                offset: 0,
                size: payload.len(),
                ..info
            };
            slot.pending = Some(info);
            self.emit(CodecEvent::Output(SlotId(index as u32), info));
        }
    }
}

impl PlatformCodec for LoopbackCodec {
    fn configure(
        &mut self,
        format: &MediaFormat,
        _target: RenderTarget,
        _flags: ConfigureFlags,
        callbacks: Arc<dyn PlatformCallbacks>,
    ) -> Result<()> {
        if self.format.is_some() {
            bail!("loopback codec is already configured");
        }
        self.format = Some(*format);
        self.queue.lock().callbacks = Some(callbacks);
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        if self.format.is_none() {
            bail!("loopback codec is not configured");
        }
        self.running = true;
        for index in 0..self.inputs.len() {
            if !self.inputs[index].dequeued {
                self.inputs[index].dequeued = true;
                self.emit(CodecEvent::InputSlot(SlotId(index as u32)));
            }
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.running = false;
        self.reset_slots();
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.running = false;
        self.reset_slots();
        self.queue.lock().stats.flushes += 1;
        Ok(())
    }

    fn release(&mut self) {
        self.running = false;
        self.reset_slots();
        self.format = None;
        let mut queue = self.queue.lock();
        queue.callbacks = None;
        queue.released = true;
    }

    fn input_buffer(&mut self, slot: SlotId) -> Option<&mut [u8]> {
        if !self.running {
            return None;
        }
        self.inputs
            .get_mut(slot.0 as usize)
            .filter(|input| input.dequeued)
            .map(|input| input.data.as_mut_slice())
    }

    fn queue_input(
        &mut self,
        slot: SlotId,
        info: SampleInfo,
        _crypto: Option<&CryptoInfo>,
    ) -> Result<()> {
        if !self.running {
            bail!("loopback codec is not running");
        }
        let capacity = self.config.input_capacity;
        let input = self
            .inputs
            .get(slot.0 as usize)
            .filter(|input| input.dequeued)
            .ok_or_else(|| anyhow!("input slot {slot} is not dequeued"))?;

        let end = info
            .offset
            .checked_add(info.size)
            .filter(|&end| end <= capacity)
            .ok_or_else(|| anyhow!("input {}+{} exceeds slot capacity {capacity}", info.offset, info.size))?;

        let payload = input.data[info.offset..end].to_vec();
        // The slot goes straight back to the client.
        self.emit(CodecEvent::InputSlot(slot));
        self.queue.lock().stats.queued_inputs += 1;

        self.backlog.push_back((payload, info));
        self.drain_backlog();
        Ok(())
    }

    fn output_buffer(&self, slot: SlotId) -> Option<&[u8]> {
        self.outputs
            .get(slot.0 as usize)
            .filter(|output| output.pending.is_some())
            .map(|output| output.data.as_slice())
    }

    fn release_output(&mut self, slot: SlotId, render: bool) -> Result<()> {
        let output = self
            .outputs
            .get_mut(slot.0 as usize)
            .filter(|output| output.pending.is_some())
            .ok_or_else(|| anyhow!("output slot {slot} is not pending"))?;
        output.pending = None;

        {
            let mut queue = self.queue.lock();
            if render {
                queue.stats.rendered_outputs += 1;
            } else {
                queue.stats.dropped_outputs += 1;
            }
        }

        self.drain_backlog();
        Ok(())
    }
}

/// Creates loopback codecs and keeps their drivers reachable.
pub struct LoopbackCodecFactory {
    config: LoopbackConfig,
    unsupported: Mutex<HashSet<Codec>>,
    drivers: Mutex<Vec<LoopbackDriver>>,
}

impl LoopbackCodecFactory {
    pub const CODECS: [Codec; 6] = [
        Codec::H264,
        Codec::Hevc,
        Codec::Av1,
        Codec::Vp9,
        Codec::Opus,
        Codec::Aac,
    ];

    pub fn new(config: LoopbackConfig) -> Self {
        Self {
            config,
            unsupported: Mutex::new(HashSet::new()),
            drivers: Mutex::new(Vec::new()),
        }
    }

    pub fn set_supported(&self, codec: Codec, supported: bool) {
        let mut unsupported = self.unsupported.lock();
        if supported {
            unsupported.remove(&codec);
        } else {
            unsupported.insert(codec);
        }
    }

    /// Drivers of every codec created so far that has not been released.
    pub fn drivers(&self) -> Vec<LoopbackDriver> {
        let mut drivers = self.drivers.lock();
        drivers.retain(|driver| !driver.is_released());
        drivers.clone()
    }

    /// Pump every live codec until all of them are idle.
    pub fn pump_all(&self) -> usize {
        let mut total = 0;
        loop {
            let delivered: usize = self.drivers().iter().map(LoopbackDriver::pump).sum();
            if delivered == 0 {
                return total;
            }
            total += delivered;
        }
    }
}

impl Default for LoopbackCodecFactory {
    fn default() -> Self {
        Self::new(LoopbackConfig::default())
    }
}

impl CodecFactory for LoopbackCodecFactory {
    fn capabilities(&self) -> Vec<CodecCapability> {
        let unsupported = self.unsupported.lock();
        Self::CODECS
            .iter()
            .filter(|codec| !unsupported.contains(*codec))
            .map(|&codec| CodecCapability {
                adaptive_playback: codec.is_video(),
                ..CodecCapability::sdr(codec, false)
            })
            .collect()
    }

    fn create(
        &self,
        format: &MediaFormat,
        flags: ConfigureFlags,
    ) -> Result<Box<dyn PlatformCodec>> {
        if self.unsupported.lock().contains(&format.codec) {
            bail!("no loopback codec for {:?}", format.codec);
        }
        if flags.contains(ConfigureFlags::TUNNELED) {
            bail!("loopback codec does not support tunneled playback");
        }
        let (codec, driver) = LoopbackCodec::new(self.config);
        self.drivers.lock().push(driver);
        Ok(Box::new(codec))
    }
}
