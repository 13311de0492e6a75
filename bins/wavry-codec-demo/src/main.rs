#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::{bail, Result};
use clap::Parser;
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use wavry_codec_proxy::{
    CodecProxy, ConnectionManager, LocalConnector, OutputBuffer, OutputSample, ProxyCallbacks,
};
use wavry_common::{
    init_tracing_with_default, Codec, HostConfig, MediaFormat, SampleFlags, SampleInfo,
    SessionConfig,
};
use wavry_media::{LoopbackCodecFactory, LoopbackConfig};

const FRAME_INTERVAL_US: i64 = 33_333;
const KEY_FRAME_INTERVAL: u32 = 30;

#[derive(Parser, Debug)]
#[command(name = "wavry-codec-demo")]
struct Args {
    /// Number of frames to decode
    #[arg(long, default_value_t = 120)]
    frames: u32,
    /// Payload size of each synthetic frame in bytes
    #[arg(long, default_value_t = 4096)]
    frame_size: usize,
    /// Render to a surface instead of returning decoded buffers
    #[arg(long)]
    surface: bool,
    /// Kill the session host after this many frames
    #[arg(long)]
    kill_after: Option<u32>,
    #[arg(long, env = "WAVRY_LOG", default_value = "info")]
    log_level: String,
}

#[derive(Default)]
struct Summary {
    processed: u64,
    deferred: u64,
    outputs: u64,
    bytes: u64,
    format_changes: u64,
    errors: Vec<bool>,
}

#[derive(Default)]
struct Pipeline {
    summary: Mutex<Summary>,
    pending: Mutex<Vec<OutputSample>>,
}

impl Pipeline {
    fn fatal(&self) -> bool {
        self.summary.lock().errors.iter().any(|&fatal| fatal)
    }

    fn release_pending(&self, proxy: &CodecProxy) -> Result<()> {
        let pending = std::mem::take(&mut *self.pending.lock());
        for sample in pending {
            proxy.release_output(&sample, true)?;
        }
        Ok(())
    }
}

impl ProxyCallbacks for Pipeline {
    fn on_input_status(&self, timestamp_us: i64, processed: bool) {
        let mut summary = self.summary.lock();
        if processed {
            summary.processed += 1;
        } else {
            debug!(timestamp_us, "input waiting for a codec slot");
            summary.deferred += 1;
        }
    }

    fn on_output_format_changed(&self, format: MediaFormat) {
        info!(
            codec = ?format.codec,
            width = format.resolution.width,
            height = format.resolution.height,
            "output format changed"
        );
        self.summary.lock().format_changes += 1;
    }

    fn on_output(&self, sample: OutputSample, buffer: Option<OutputBuffer>) {
        {
            let mut summary = self.summary.lock();
            summary.outputs += 1;
            summary.bytes += buffer.as_ref().map_or(0, |buffer| buffer.len() as u64);
        }
        self.pending.lock().push(sample);
    }

    fn on_error(&self, fatal: bool) {
        if fatal {
            warn!("codec session failed");
        } else {
            warn!("codec session interrupted, continuing");
        }
        self.summary.lock().errors.push(fatal);
    }
}

fn settle(factory: &LoopbackCodecFactory, connector: &LocalConnector) {
    loop {
        connector.sync();
        let delivered = factory.pump_all();
        connector.sync();
        if delivered == 0 && factory.pump_all() == 0 {
            return;
        }
    }
}

fn synthetic_frame(index: u32, size: usize) -> Vec<u8> {
    let seed = index.to_le_bytes();
    (0..size).map(|i| seed[i % seed.len()] ^ i as u8).collect()
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing_with_default(&args.log_level);

    let loopback = LoopbackConfig {
        input_capacity: args.frame_size.max(LoopbackConfig::default().input_capacity),
        output_capacity: args.frame_size.max(LoopbackConfig::default().output_capacity),
        ..LoopbackConfig::default()
    };
    let factory = Arc::new(LoopbackCodecFactory::new(loopback));
    let connector = Arc::new(LocalConnector::new(factory.clone(), HostConfig::default()));
    let manager = ConnectionManager::new(connector.clone());

    let mut config = SessionConfig::decoder(MediaFormat::video(Codec::H264, 1920, 1080));
    if args.surface {
        config = config.with_surface(1);
    }
    let pipeline = Arc::new(Pipeline::default());
    let proxy = CodecProxy::create(&manager, config, pipeline.clone())?;
    info!(
        session = %proxy.session_id(),
        frames = args.frames,
        frame_size = args.frame_size,
        surface = args.surface,
        adaptive = proxy.is_adaptive_playback_supported(),
        "decoding synthetic stream"
    );
    settle(&factory, &connector);

    for index in 0..args.frames {
        if args.kill_after == Some(index) {
            if let Some(connection) = connector.latest() {
                info!(frame = index, "killing session host");
                connection.kill();
            }
            settle(&factory, &connector);
        }
        if pipeline.fatal() {
            break;
        }

        let flags = if index % KEY_FRAME_INTERVAL == 0 {
            SampleFlags::KEY_FRAME
        } else {
            SampleFlags::empty()
        };
        let info = SampleInfo::new(index as i64 * FRAME_INTERVAL_US, args.frame_size, flags);
        if let Err(err) = proxy.input(&synthetic_frame(index, args.frame_size), info, None) {
            warn!(frame = index, error = %err, "input rejected");
        }

        settle(&factory, &connector);
        pipeline.release_pending(&proxy)?;
    }

    if !pipeline.fatal() {
        let end = SampleInfo::end_of_stream(args.frames as i64 * FRAME_INTERVAL_US);
        proxy.input(&[], end, None)?;
        settle(&factory, &connector);
        pipeline.release_pending(&proxy)?;
    }

    let released = proxy.release();
    let summary = pipeline.summary.lock();
    info!(
        processed = summary.processed,
        deferred = summary.deferred,
        outputs = summary.outputs,
        bytes = summary.bytes,
        format_changes = summary.format_changes,
        interruptions = summary.errors.iter().filter(|&&fatal| !fatal).count(),
        connections = connector.connections().len(),
        released,
        "demo finished"
    );
    if summary.errors.iter().any(|&fatal| fatal) {
        bail!("codec session failed");
    }
    Ok(())
}
