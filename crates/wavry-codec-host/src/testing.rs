use std::sync::Arc;

use parking_lot::Mutex;
use wavry_common::{
    Codec, ConfigureFlags, MediaFormat, OutputDescriptor, RenderTarget, SampleFlags, SampleInfo,
    SessionEvent, SessionId, SlotId,
};
use wavry_media::{CodecFault, LoopbackCodec, LoopbackConfig, PlatformCallbacks, PlatformCodec};

use crate::dispatch::{EventDispatcher, SessionEvents};

#[derive(Default)]
pub(crate) struct Recorder {
    events: Mutex<Vec<SessionEvent>>,
}

impl Recorder {
    pub(crate) fn take(&self) -> Vec<SessionEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    pub(crate) fn outputs(&self) -> Vec<OutputDescriptor> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                SessionEvent::Output { output } => Some(*output),
                _ => None,
            })
            .collect()
    }
}

impl SessionEvents for Recorder {
    fn on_event(&self, _session: SessionId, event: SessionEvent) {
        self.events.lock().push(event);
    }
}

struct Silent;

impl PlatformCallbacks for Silent {
    fn on_input_slot_available(&self, _slot: SlotId) {}
    fn on_output_available(&self, _slot: SlotId, _info: SampleInfo) {}
    fn on_format_changed(&self, _format: MediaFormat) {}
    fn on_error(&self, _fault: CodecFault) {}
}

pub(crate) fn dispatcher() -> (EventDispatcher, Arc<Recorder>) {
    let recorder = Arc::new(Recorder::default());
    (EventDispatcher::new(SessionId::new(), recorder.clone()), recorder)
}

/// A started loopback codec whose callbacks go nowhere; tests drive slots by hand.
pub(crate) fn started_codec(config: LoopbackConfig) -> LoopbackCodec {
    let (mut codec, _driver) = LoopbackCodec::new(config);
    codec
        .configure(
            &MediaFormat::video(Codec::H264, 320, 240),
            RenderTarget::Buffers,
            ConfigureFlags::empty(),
            Arc::new(Silent),
        )
        .unwrap();
    codec.start().unwrap();
    codec
}

/// Push `payload` through input slot `slot` so the codec has an output pending.
pub(crate) fn produce_output(
    codec: &mut LoopbackCodec,
    slot: SlotId,
    timestamp_us: i64,
    payload: &[u8],
) -> SampleInfo {
    codec.input_buffer(slot).unwrap()[..payload.len()].copy_from_slice(payload);
    let info = SampleInfo::new(timestamp_us, payload.len(), SampleFlags::empty());
    codec.queue_input(slot, info, None).unwrap();
    info
}
