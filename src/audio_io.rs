use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig};
use crossbeam::channel::{bounded, Sender};
use tracing::{error, info};

use crate::engine::SharedEngine;
use crate::error::EngineError;

/// Keeps the device stream alive on its own thread until stopped or dropped.
pub struct OutputHandle {
    stop_tx: Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl OutputHandle {
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for OutputHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn blocked(reason: impl ToString) -> EngineError {
    EngineError::PlaybackBlocked {
        reason: reason.to_string(),
    }
}

fn open_stream(engine: SharedEngine) -> Result<cpal::Stream, EngineError> {
    let sample_rate = engine.lock().sample_rate();
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| blocked("no output device available"))?;
    let supported = device.default_output_config().map_err(blocked)?;
    if supported.sample_format() != SampleFormat::F32 {
        return Err(blocked(format!(
            "unsupported sample format {:?}",
            supported.sample_format()
        )));
    }
    let channels = supported.channels().max(1) as usize;
    let config = StreamConfig {
        channels: channels as u16,
        sample_rate: cpal::SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let mut stereo: Vec<f32> = Vec::new();
    let audio_callback = move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
        let frames = data.len() / channels;
        stereo.resize(frames * 2, 0.0);
        engine.lock().process_block(&mut stereo);
        for (out, frame) in data.chunks_mut(channels).zip(stereo.chunks(2)) {
            match out.len() {
                1 => out[0] = 0.5 * (frame[0] + frame[1]),
                _ => {
                    out[0] = frame[0];
                    out[1] = frame[1];
                    for extra in out.iter_mut().skip(2) {
                        *extra = 0.0;
                    }
                }
            }
        }
    };
    let err_fn = |err| error!("stream error: {err}");
    let stream = device
        .build_output_stream(&config, audio_callback, err_fn, None)
        .map_err(blocked)?;
    stream.play().map_err(blocked)?;
    info!(sample_rate, channels, "output stream started");
    Ok(stream)
}

/// Start pulling blocks from `engine` into the default output device.
///
/// Fails with [`EngineError::PlaybackBlocked`] when the device cannot be
/// opened or started.
pub fn start_output(engine: SharedEngine) -> Result<OutputHandle, EngineError> {
    let (ready_tx, ready_rx) = bounded::<Result<(), EngineError>>(1);
    let (stop_tx, stop_rx) = bounded::<()>(1);
    let thread = std::thread::Builder::new()
        .name("session-engine-output".into())
        .spawn(move || {
            let stream = match open_stream(engine) {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    stream
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            let _ = stop_rx.recv();
            drop(stream);
        })?;
    match ready_rx.recv() {
        Ok(Ok(())) => Ok(OutputHandle {
            stop_tx,
            thread: Some(thread),
        }),
        Ok(Err(e)) => {
            let _ = thread.join();
            Err(e)
        }
        Err(_) => {
            let _ = thread.join();
            Err(blocked("output thread exited before the stream started"))
        }
    }
}
