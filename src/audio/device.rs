//! cpal-backed audio contexts
//!
//! cpal streams are not `Send` on every platform, so each stream is built and
//! owned by a dedicated thread. The handles the session keeps talk to that
//! thread over a channel and are safe to move between tasks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Sample, SampleFormat, Stream, StreamConfig};
use tokio::sync::mpsc;

use super::output::Mixer;
use super::pcm::{to_mono, StreamResampler};
use super::{AudioBackend, AudioError, CaptureContext, Microphone, OutputSink, SourceId};

/// How long to wait for the stream thread to acknowledge a command
const STREAM_COMMAND_TIMEOUT: Duration = Duration::from_secs(2);

/// Capacity of the captured-frame queue between the audio thread and the pipe
const FRAME_QUEUE_CAPACITY: usize = 32;

enum StreamCommand {
    Play(std_mpsc::Sender<Result<(), AudioError>>),
    Stop,
}

/// Owns one cpal stream on its own thread.
struct StreamThread {
    commands: std_mpsc::Sender<StreamCommand>,
    join: Option<thread::JoinHandle<()>>,
}

impl StreamThread {
    fn spawn<F>(name: &str, build: F) -> Result<Self, AudioError>
    where
        F: FnOnce() -> Result<Stream, AudioError> + Send + 'static,
    {
        let (cmd_tx, cmd_rx) = std_mpsc::channel::<StreamCommand>();
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<(), AudioError>>();

        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let stream = match build() {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                while let Ok(cmd) = cmd_rx.recv() {
                    match cmd {
                        StreamCommand::Play(reply) => {
                            let result = stream.play().map_err(|e| {
                                AudioError::StreamCreationFailed(format!(
                                    "Failed to start stream: {}",
                                    e
                                ))
                            });
                            let _ = reply.send(result);
                        }
                        StreamCommand::Stop => break,
                    }
                }

                drop(stream);
                log::debug!("Audio stream thread exiting");
            })
            .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                commands: cmd_tx,
                join: Some(join),
            }),
            Ok(Err(e)) => {
                let _ = join.join();
                Err(e)
            }
            Err(_) => {
                let _ = join.join();
                Err(AudioError::StreamCreationFailed(
                    "Audio thread exited before the stream was built".to_string(),
                ))
            }
        }
    }

    fn play(&self) -> Result<(), AudioError> {
        let (reply_tx, reply_rx) = std_mpsc::channel();
        self.commands
            .send(StreamCommand::Play(reply_tx))
            .map_err(|_| AudioError::ContextClosed)?;
        reply_rx
            .recv_timeout(STREAM_COMMAND_TIMEOUT)
            .map_err(|_| AudioError::StreamCreationFailed("Audio thread not responding".to_string()))?
    }

    fn stop(&mut self) {
        let _ = self.commands.send(StreamCommand::Stop);
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                log::warn!("Audio stream thread panicked during shutdown");
            }
        }
    }
}

impl Drop for StreamThread {
    fn drop(&mut self) {
        self.stop();
    }
}

fn map_build_error(err: cpal::BuildStreamError, input: bool) -> AudioError {
    match err {
        cpal::BuildStreamError::DeviceNotAvailable if input => AudioError::NoInputDevice,
        cpal::BuildStreamError::DeviceNotAvailable => AudioError::NoOutputDevice,
        cpal::BuildStreamError::StreamConfigNotSupported => AudioError::NoSupportedConfig,
        other => {
            let message = other.to_string();
            let lower = message.to_lowercase();
            if input && (lower.contains("permission") || lower.contains("not allowed")) {
                AudioError::PermissionDenied(message)
            } else {
                AudioError::StreamCreationFailed(message)
            }
        }
    }
}

/// Real audio backend over the host's default (or named) devices.
#[derive(Debug, Clone, Default)]
pub struct CpalBackend {
    input_device: Option<String>,
    output_device: Option<String>,
}

impl CpalBackend {
    pub fn new(input_device: Option<String>, output_device: Option<String>) -> Self {
        Self {
            input_device,
            output_device,
        }
    }

    fn find_input_device(&self) -> Result<Device, AudioError> {
        let host = cpal::default_host();
        match &self.input_device {
            Some(name) => host
                .input_devices()
                .map_err(|_| AudioError::NoInputDevice)?
                .find(|d| d.name().map(|n| &n == name).unwrap_or(false))
                .ok_or(AudioError::NoInputDevice),
            None => host.default_input_device().ok_or(AudioError::NoInputDevice),
        }
    }

    fn find_output_device(&self) -> Result<Device, AudioError> {
        let host = cpal::default_host();
        match &self.output_device {
            Some(name) => host
                .output_devices()
                .map_err(|_| AudioError::NoOutputDevice)?
                .find(|d| d.name().map(|n| &n == name).unwrap_or(false))
                .ok_or(AudioError::NoOutputDevice),
            None => host
                .default_output_device()
                .ok_or(AudioError::NoOutputDevice),
        }
    }
}

impl AudioBackend for CpalBackend {
    fn open_output(&self, sample_rate: u32) -> Result<Arc<dyn OutputSink>, AudioError> {
        let device = self.find_output_device()?;
        log::info!("Using audio output device: {:?}", device.name());

        let supported = device
            .default_output_config()
            .map_err(|_| AudioError::NoSupportedConfig)?;
        let sample_format = supported.sample_format();
        let config: StreamConfig = supported.into();

        log::info!(
            "Output config: {} Hz, {} channels, {:?} (sources at {} Hz)",
            config.sample_rate.0,
            config.channels,
            sample_format,
            sample_rate
        );

        let mixer = Arc::new(Mutex::new(Mixer::new(config.sample_rate.0)));
        let render_mixer = mixer.clone();

        let stream = StreamThread::spawn("audio-output", move || {
            build_output_stream(&device, &config, sample_format, render_mixer)
        })?;

        Ok(Arc::new(CpalOutput {
            mixer,
            stream: Mutex::new(Some(stream)),
            closed: AtomicBool::new(false),
        }))
    }

    fn open_capture(&self, sample_rate: u32) -> Result<Box<dyn CaptureContext>, AudioError> {
        let device = self.find_input_device()?;
        log::info!("Using audio input device: {:?}", device.name());

        let supported = device
            .default_input_config()
            .map_err(|_| AudioError::NoSupportedConfig)?;

        log::info!(
            "Input config: {} Hz, {} channels, {:?} (capturing at {} Hz)",
            supported.sample_rate().0,
            supported.channels(),
            supported.sample_format(),
            sample_rate
        );

        let sample_format = supported.sample_format();
        Ok(Box::new(CpalCapture {
            device,
            config: supported.into(),
            sample_format,
            target_rate: sample_rate,
            closed: false,
        }))
    }
}

fn build_output_stream(
    device: &Device,
    config: &StreamConfig,
    sample_format: SampleFormat,
    mixer: Arc<Mutex<Mixer>>,
) -> Result<Stream, AudioError> {
    match sample_format {
        SampleFormat::I16 => build_output_stream_typed::<i16>(device, config, mixer),
        SampleFormat::U16 => build_output_stream_typed::<u16>(device, config, mixer),
        SampleFormat::F32 => build_output_stream_typed::<f32>(device, config, mixer),
        _ => Err(AudioError::NoSupportedConfig),
    }
}

fn build_output_stream_typed<T>(
    device: &Device,
    config: &StreamConfig,
    mixer: Arc<Mutex<Mixer>>,
) -> Result<Stream, AudioError>
where
    T: cpal::SizedSample + cpal::FromSample<f32> + Send + 'static,
{
    let channels = config.channels as usize;
    let mut scratch: Vec<f32> = Vec::new();

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                scratch.resize(data.len(), 0.0);
                match mixer.lock() {
                    Ok(mut m) => m.render(&mut scratch, channels),
                    Err(_) => scratch.iter_mut().for_each(|s| *s = 0.0),
                }
                for (dst, &src) in data.iter_mut().zip(scratch.iter()) {
                    *dst = T::from_sample(src);
                }
            },
            |err| log::error!("Audio output stream error: {}", err),
            None,
        )
        .map_err(|e| map_build_error(e, false))
}

/// Output context: a cpal output stream driving a [`Mixer`].
struct CpalOutput {
    mixer: Arc<Mutex<Mixer>>,
    stream: Mutex<Option<StreamThread>>,
    closed: AtomicBool,
}

impl OutputSink for CpalOutput {
    fn resume(&self) -> Result<(), AudioError> {
        if self.is_closed() {
            return Err(AudioError::ContextClosed);
        }
        let guard = self
            .stream
            .lock()
            .map_err(|_| AudioError::ContextClosed)?;
        guard.as_ref().ok_or(AudioError::ContextClosed)?.play()
    }

    fn current_time(&self) -> f64 {
        self.mixer.lock().map(|m| m.current_time()).unwrap_or(0.0)
    }

    fn start_source(
        &self,
        samples: Arc<[f32]>,
        sample_rate: u32,
        at: f64,
    ) -> Result<SourceId, AudioError> {
        if self.is_closed() {
            return Err(AudioError::ContextClosed);
        }
        let mut mixer = self.mixer.lock().map_err(|_| AudioError::ContextClosed)?;
        mixer
            .add(&samples, sample_rate, at)
            .ok_or(AudioError::ContextClosed)
    }

    fn stop_source(&self, id: SourceId) {
        if let Ok(mut mixer) = self.mixer.lock() {
            mixer.remove(id);
        }
    }

    fn disconnect(&self) {
        if let Ok(mut mixer) = self.mixer.lock() {
            mixer.disconnect();
        }
    }

    fn close(&self) -> Result<(), AudioError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let stream = self
            .stream
            .lock()
            .map_err(|_| AudioError::ContextClosed)?
            .take();
        if let Some(mut stream) = stream {
            stream.stop();
        }
        log::debug!("Audio output context closed");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Capture context: the selected input device and its native format.
struct CpalCapture {
    device: Device,
    config: StreamConfig,
    sample_format: SampleFormat,
    target_rate: u32,
    closed: bool,
}

impl CaptureContext for CpalCapture {
    fn resume(&mut self) -> Result<(), AudioError> {
        if self.closed {
            return Err(AudioError::ContextClosed);
        }
        Ok(())
    }

    fn acquire_microphone(
        &mut self,
        frame_size: usize,
    ) -> Result<Box<dyn Microphone>, AudioError> {
        if self.closed {
            return Err(AudioError::ContextClosed);
        }

        let (tx, rx) = mpsc::channel::<Vec<f32>>(FRAME_QUEUE_CAPACITY);
        let device = self.device.clone();
        let config = self.config.clone();
        let sample_format = self.sample_format;
        let target_rate = self.target_rate;

        let stream = StreamThread::spawn("audio-capture", move || match sample_format {
            SampleFormat::I16 => {
                build_input_stream_typed::<i16>(&device, &config, target_rate, frame_size, tx)
            }
            SampleFormat::U16 => {
                build_input_stream_typed::<u16>(&device, &config, target_rate, frame_size, tx)
            }
            SampleFormat::F32 => {
                build_input_stream_typed::<f32>(&device, &config, target_rate, frame_size, tx)
            }
            _ => Err(AudioError::NoSupportedConfig),
        })?;

        stream.play()?;
        log::info!(
            "Microphone acquired ({} Hz, {}-sample frames)",
            target_rate,
            frame_size
        );

        Ok(Box::new(CpalMicrophone {
            stream: Some(stream),
            frames: Some(rx),
        }))
    }

    fn close(&mut self) -> Result<(), AudioError> {
        if !self.closed {
            self.closed = true;
            log::debug!("Audio capture context closed");
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

fn build_input_stream_typed<T>(
    device: &Device,
    config: &StreamConfig,
    target_rate: u32,
    frame_size: usize,
    tx: mpsc::Sender<Vec<f32>>,
) -> Result<Stream, AudioError>
where
    T: cpal::SizedSample + Send + 'static,
    f32: cpal::FromSample<T>,
{
    let native_rate = config.sample_rate.0;
    let channels = config.channels;
    let frame_size = frame_size.max(1);
    let mut pending: Vec<f32> = Vec::with_capacity(frame_size * 2);
    let mut resampler = StreamResampler::new(native_rate, target_rate);

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let floats: Vec<f32> = data.iter().map(|&s| s.to_sample::<f32>()).collect();
                let mono = to_mono(&floats, channels);
                pending.extend(resampler.process(&mono));

                while pending.len() >= frame_size {
                    let frame: Vec<f32> = pending.drain(..frame_size).collect();
                    // Never block the audio thread
                    if tx.try_send(frame).is_err() {
                        log::trace!("Capture: frame queue full, dropping frame");
                    }
                }
            },
            |err| log::error!("Audio input stream error: {}", err),
            None,
        )
        .map_err(|e| map_build_error(e, true))
}

/// Live microphone stream. Stopping it ends the frame stream.
struct CpalMicrophone {
    stream: Option<StreamThread>,
    frames: Option<mpsc::Receiver<Vec<f32>>>,
}

impl Microphone for CpalMicrophone {
    fn take_frames(&mut self) -> Option<mpsc::Receiver<Vec<f32>>> {
        self.frames.take()
    }

    fn stop(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.stop();
            log::debug!("Microphone stopped");
        }
    }
}
