//! Real loudspeaker/microphone loop through cpal
//!
//! The output callback plays a tone and feeds every buffer to the probe; the
//! input callback pushes microphone samples into a lock-free ring that the
//! main loop drains period by period into the processor. The probe latency is
//! taken from the first output callback's playback timestamp unless the probe
//! has an explicit latency.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::HeapRb;

use aecsync_core::audio::clock::frames_to_time;
use aecsync_core::audio::format::samples_to_bytes;
use aecsync_core::{DspEngine, ProbeRegistry, Processor, ReferenceProbe, StreamStats};

use crate::config::AppConfig;
use crate::simulate::ToneGenerator;

/// Run the processor against the default input and output devices until
/// `running` is cleared
pub fn run<E: DspEngine>(config: &AppConfig, engine: E, running: Arc<AtomicBool>) -> Result<StreamStats> {
    let sim = config.simulation;
    let format = sim.format()?;
    let rate = format.rate();
    let channels = format.channels() as usize;
    let period_samples = format.period_samples() * channels;

    let host = cpal::default_host();
    let output = host
        .default_output_device()
        .ok_or_else(|| anyhow!("No default output device"))?;
    let input = host
        .default_input_device()
        .ok_or_else(|| anyhow!("No default input device"))?;
    tracing::info!(
        output = %output.name().unwrap_or_default(),
        input = %input.name().unwrap_or_default(),
        "Using audio devices"
    );

    let stream_config = StreamConfig {
        channels: format.channels(),
        sample_rate: SampleRate(rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let registry = ProbeRegistry::new();
    let probe = ReferenceProbe::new(config.probe.clone(), &registry);
    probe.setup(format)?;

    let processor = Processor::new(config.processor.clone(), engine, registry)?;
    processor.start()?;
    processor.configure(format)?;

    // One second of microphone audio
    let mic_ring = HeapRb::<i16>::new(rate as usize * channels);
    let (mut mic_producer, mut mic_consumer) = mic_ring.split();

    let out_probe = Arc::clone(&probe);
    let mut tone = ToneGenerator::new(sim.tone_hz, rate, format.channels());
    let mut samples: Vec<i16> = Vec::new();
    let mut bytes: Vec<u8> = Vec::new();
    let mut frames_played = 0u64;
    let mut latency_reported = false;
    let output_stream = output.build_output_stream(
        &stream_config,
        move |data: &mut [f32], info: &cpal::OutputCallbackInfo| {
            samples.resize(data.len(), 0);
            tone.fill(&mut samples);
            for (out, sample) in data.iter_mut().zip(&samples) {
                *out = *sample as f32 / i16::MAX as f32;
            }

            if !latency_reported {
                let timestamp = info.timestamp();
                if let Some(latency) = timestamp.playback.duration_since(&timestamp.callback) {
                    out_probe.on_latency_event(latency.as_nanos() as u64, None);
                    latency_reported = true;
                }
            }

            bytes.resize(samples.len() * 2, 0);
            samples_to_bytes(&samples, &mut bytes);
            out_probe.ingest(&bytes, Some(frames_to_time(frames_played, rate)));
            frames_played += (data.len() / channels) as u64;
        },
        move |err| {
            tracing::error!("Output stream error: {}", err);
        },
        None,
    )?;

    let input_stream = input.build_input_stream(
        &stream_config,
        move |data: &[f32], _: &cpal::InputCallbackInfo| {
            for &sample in data {
                let value = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
                let _ = mic_producer.try_push(value);
            }
        },
        move |err| {
            tracing::error!("Input stream error: {}", err);
        },
        None,
    )?;

    output_stream.play()?;
    input_stream.play()?;
    tracing::info!(rate, channels, "Device loop started");

    let mut captured = vec![0i16; period_samples];
    let mut capture_bytes = vec![0u8; period_samples * 2];
    let mut frames_captured = 0u64;

    while running.load(Ordering::SeqCst) {
        if mic_consumer.occupied_len() < period_samples {
            std::thread::sleep(Duration::from_millis(2));
            continue;
        }

        mic_consumer.pop_slice(&mut captured);
        samples_to_bytes(&captured, &mut capture_bytes);
        processor.ingest(
            &capture_bytes,
            Some(frames_to_time(frames_captured, rate)),
            frames_captured == 0,
        )?;
        frames_captured += format.period_samples() as u64;

        while processor.produce_period()?.is_some() {}
    }

    drop(input_stream);
    drop(output_stream);

    let stats = processor.stats();
    processor.stop();
    tracing::info!(
        periods = stats.periods_processed,
        reference_reads = stats.reference_reads,
        "Device loop stopped"
    );
    Ok(stats)
}
