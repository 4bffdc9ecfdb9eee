//! Loopback simulation
//!
//! Runs a probe and a processor against a synthetic room: a far-end thread
//! plays a tone into the probe and into an acoustic delay line, and the
//! near-end loop reads the delayed, attenuated tone back as microphone input.
//! With [`EchoSubtractor`] as the engine the residual level shows how well the
//! reference lines up with the echo.
//!
//! Both sides stamp their audio with media time derived from frame counts, so
//! the alignment is exact and repeatable regardless of scheduling jitter.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::HeapRb;
use serde::{Deserialize, Serialize};

use aecsync_core::audio::clock::frames_to_time;
use aecsync_core::audio::format::{bytes_to_samples, samples_to_bytes};
use aecsync_core::{
    AudioFormat, DspEngine, EngineError, EngineSettings, ProbeRegistry, Processor, ReferenceProbe,
    StreamStats, MSECOND,
};

use crate::config::AppConfig;

fn default_rate() -> u32 {
    16000
}

fn default_channels() -> u16 {
    1
}

fn default_echo_delay_ms() -> u32 {
    40
}

fn default_echo_gain() -> f32 {
    0.5
}

fn default_tone_hz() -> f32 {
    440.0
}

/// Synthetic room parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SimulationConfig {
    /// Stream sample rate in Hz
    #[serde(default = "default_rate")]
    pub rate: u32,
    #[serde(default = "default_channels")]
    pub channels: u16,
    /// Time from loudspeaker to microphone
    #[serde(default = "default_echo_delay_ms")]
    pub echo_delay_ms: u32,
    /// Attenuation of the acoustic path (0.0..=1.0)
    #[serde(default = "default_echo_gain")]
    pub echo_gain: f32,
    #[serde(default = "default_tone_hz")]
    pub tone_hz: f32,
    /// Stop after this many seconds (0 = until Ctrl+C)
    #[serde(default)]
    pub duration_secs: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            rate: default_rate(),
            channels: default_channels(),
            echo_delay_ms: default_echo_delay_ms(),
            echo_gain: default_echo_gain(),
            tone_hz: default_tone_hz(),
            duration_secs: 0,
        }
    }
}

impl SimulationConfig {
    /// Stream format shared by both ends
    pub fn format(&self) -> Result<AudioFormat> {
        let format = AudioFormat::new(self.rate, self.channels)?;
        format.validate_period()?;
        Ok(format)
    }

    /// Check the room parameters
    pub fn validate(&self) -> Result<()> {
        self.format()?;
        if !(0.0..=1.0).contains(&self.echo_gain) {
            return Err(anyhow!("echo-gain must be within 0.0..=1.0, got {}", self.echo_gain));
        }
        if self.tone_hz <= 0.0 || self.tone_hz >= self.rate as f32 / 2.0 {
            return Err(anyhow!(
                "tone-hz must be between 0 and {} Hz, got {}",
                self.rate / 2,
                self.tone_hz
            ));
        }
        Ok(())
    }
}

/// Result of a simulation run
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    /// Processor counters at the end of the run
    pub stats: StreamStats,
    /// RMS of the microphone input over the whole run
    pub mic_rms: f64,
    /// RMS of the processor output over the whole run
    pub residual_rms: f64,
}

impl SimulationReport {
    /// Echo attenuation in dB (positive is better)
    pub fn attenuation_db(&self) -> f64 {
        if self.residual_rms <= f64::EPSILON {
            return f64::INFINITY;
        }
        20.0 * (self.mic_rms / self.residual_rms).log10()
    }
}

/// Toy engine that subtracts the scaled reference from the near end
///
/// It does no adaptive filtering, so it only cancels the echo when the
/// reference arrives perfectly aligned and the path gain is known.
#[derive(Debug)]
pub struct EchoSubtractor {
    gain: f32,
    reference: Vec<i16>,
    delay_ms: u32,
}

impl EchoSubtractor {
    pub fn new(gain: f32) -> Self {
        Self {
            gain,
            reference: Vec::new(),
            delay_ms: 0,
        }
    }

    /// Last delay forwarded by the processor
    pub fn delay_ms(&self) -> u32 {
        self.delay_ms
    }
}

impl DspEngine for EchoSubtractor {
    fn setup(&mut self, settings: &EngineSettings) -> Result<(), EngineError> {
        tracing::debug!(gain = self.gain, echo_cancel = settings.echo_cancel, "echo subtractor setup");
        self.reference.clear();
        Ok(())
    }

    fn process(&mut self, _rate: u32, _channels: u16, samples: &mut [i16]) -> Result<(), EngineError> {
        if self.reference.len() == samples.len() {
            for (sample, reference) in samples.iter_mut().zip(&self.reference) {
                let residual = *sample as f32 - *reference as f32 * self.gain;
                *sample = residual.round().clamp(i16::MIN as f32, i16::MAX as f32) as i16;
            }
        }
        self.reference.clear();
        Ok(())
    }

    fn process_reverse(&mut self, _rate: u32, _channels: u16, samples: &mut [i16]) -> Result<(), EngineError> {
        self.reference.clear();
        self.reference.extend_from_slice(samples);
        Ok(())
    }

    fn set_delay(&mut self, delay_ms: u32) {
        self.delay_ms = delay_ms;
    }

    fn teardown(&mut self) {
        self.reference.clear();
    }
}

/// Sine generator producing interleaved S16 periods
pub(crate) struct ToneGenerator {
    phase: f32,
    step: f32,
    channels: usize,
}

impl ToneGenerator {
    pub(crate) fn new(tone_hz: f32, rate: u32, channels: u16) -> Self {
        Self {
            phase: 0.0,
            step: std::f32::consts::TAU * tone_hz / rate as f32,
            channels: channels as usize,
        }
    }

    pub(crate) fn fill(&mut self, out: &mut [i16]) {
        for frame in out.chunks_mut(self.channels) {
            let value = (self.phase.sin() * 0.5 * i16::MAX as f32) as i16;
            frame.fill(value);
            self.phase = (self.phase + self.step) % std::f32::consts::TAU;
        }
    }
}

fn sum_squares(samples: &[i16]) -> f64 {
    samples.iter().map(|&s| (s as f64) * (s as f64)).sum()
}

/// Run the loopback simulation until the configured duration elapses or
/// `running` is cleared
///
/// # Arguments
/// * `config` - Probe, processor and room settings
/// * `engine` - Engine driven by the processor
/// * `running` - Cleared by the caller (Ctrl+C) to stop early
pub fn run<E: DspEngine>(config: &AppConfig, engine: E, running: Arc<AtomicBool>) -> Result<SimulationReport> {
    let sim = config.simulation;
    sim.validate()?;
    let format = sim.format()?;
    let period_samples = format.period_samples() * format.channels() as usize;

    let registry = ProbeRegistry::new();
    let probe = ReferenceProbe::new(config.probe.clone(), &registry);
    probe.setup(format)?;
    // The acoustic path counts as loudspeaker latency, no extra engine delay
    probe.on_latency_event(sim.echo_delay_ms as u64 * MSECOND, None);

    let processor = Processor::new(config.processor.clone(), engine, registry)?;
    processor.start().context("Failed to start processor")?;
    processor.configure(format)?;

    // Acoustic path, primed with the echo delay worth of silence
    let delay_samples = (sim.echo_delay_ms as usize * format.rate() as usize / 1000) * format.channels() as usize;
    let room = HeapRb::<i16>::new(delay_samples + period_samples * 64);
    let (mut speaker, mut mic) = room.split();
    speaker.push_slice(&vec![0i16; delay_samples]);

    let far_running = Arc::clone(&running);
    let far_probe = Arc::clone(&probe);
    let far_end = thread::Builder::new()
        .name("far-end".to_string())
        .spawn(move || {
            let mut tone = ToneGenerator::new(sim.tone_hz, format.rate(), format.channels());
            let mut samples = vec![0i16; period_samples];
            let mut bytes = vec![0u8; period_samples * 2];
            let mut frames_played = 0u64;

            while far_running.load(Ordering::SeqCst) {
                if speaker.vacant_len() < period_samples {
                    thread::sleep(Duration::from_millis(1));
                    continue;
                }

                tone.fill(&mut samples);
                samples_to_bytes(&samples, &mut bytes);
                far_probe.ingest(&bytes, Some(frames_to_time(frames_played, format.rate())));
                speaker.push_slice(&samples);
                frames_played += format.period_samples() as u64;

                thread::sleep(Duration::from_millis(10));
            }
            tracing::debug!(frames_played, "far-end thread stopped");
        })
        .context("Failed to spawn far-end thread")?;

    let max_frames = sim.duration_secs * format.rate() as u64;
    let mut captured = vec![0i16; period_samples];
    let mut capture_bytes = vec![0u8; period_samples * 2];
    let mut frames_captured = 0u64;
    let mut mic_energy = 0.0f64;
    let mut residual_energy = 0.0f64;
    let mut sample_count = 0u64;
    let mut result = Ok(());

    while running.load(Ordering::SeqCst) && (max_frames == 0 || frames_captured < max_frames) {
        if mic.occupied_len() < period_samples {
            thread::sleep(Duration::from_millis(1));
            continue;
        }

        mic.pop_slice(&mut captured);
        for sample in captured.iter_mut() {
            *sample = (*sample as f32 * sim.echo_gain) as i16;
        }
        samples_to_bytes(&captured, &mut capture_bytes);

        let timestamp = frames_to_time(frames_captured, format.rate());
        if let Err(e) = processor.ingest(&capture_bytes, Some(timestamp), frames_captured == 0) {
            result = Err(e);
            break;
        }
        frames_captured += format.period_samples() as u64;

        loop {
            match processor.produce_period() {
                Ok(Some(period)) => {
                    let mut output = Vec::new();
                    bytes_to_samples(&period.data, &mut output);
                    residual_energy += sum_squares(&output);
                }
                Ok(None) => break,
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }
        if result.is_err() {
            break;
        }

        mic_energy += sum_squares(&captured);
        sample_count += captured.len() as u64;
    }

    running.store(false, Ordering::SeqCst);
    if far_end.join().is_err() {
        tracing::error!("far-end thread panicked");
    }
    result?;

    let stats = processor.stats();
    processor.stop();

    let samples = sample_count.max(1) as f64;
    let report = SimulationReport {
        stats,
        mic_rms: (mic_energy / samples).sqrt(),
        residual_rms: (residual_energy / samples).sqrt(),
    };

    tracing::info!(
        periods = report.stats.periods_processed,
        mic_rms = report.mic_rms,
        residual_rms = report.residual_rms,
        "Simulation finished"
    );
    Ok(report)
}
