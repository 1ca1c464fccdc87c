use std::sync::{Mutex, PoisonError};

use anyhow::{bail, Context, Result};
use rand::Rng;
use rand_chacha::rand_core::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::placement::EnginePlacement;

use super::{EngineOutput, EngineParams, GenerationAborted, GenerationEngine, ProgressFn};

/// Samples rendered between cancellation checkpoints and progress reports.
const BLOCK_MS: u32 = 250;
/// Continuation header: format marker + note index + oscillator phase.
const CONTINUATION_MAGIC: &[u8; 4] = b"CDZ1";
const CONTINUATION_LEN: usize = 12;

/// Pentatonic offsets over a minor root; random-walked per note.
const SCALE_SEMITONES: [i32; 5] = [0, 3, 5, 7, 10];
const NOTE_MS: u32 = 500;

/// Deterministic procedural synthesizer implementing the engine contract.
///
/// This is not a neural model: it renders a seeded pentatonic line to WAV so
/// that the scheduling, cancellation, progress, and continuation paths run
/// against a real blocking generator. It honors every part of the contract —
/// checkpointed aborts, resolved seeds, reference conditioning, continuation
/// state in and out.
pub struct SynthEngine {
    placement: EnginePlacement,
    sample_rate: u32,
    /// Decode-stage fade table, built lazily in single-device mode so nothing
    /// sits resident while the engine is idle.
    codec_table: Mutex<Option<Vec<f32>>>,
}

struct VoiceState {
    note_index: i32,
    phase: f32,
}

impl SynthEngine {
    pub fn load(placement: EnginePlacement, sample_rate: u32) -> Result<Self> {
        if sample_rate == 0 {
            bail!("engine sample rate must be non-zero");
        }

        match placement {
            EnginePlacement::SingleDevice { defer_codec_load } => {
                info!(defer_codec_load, "Loading engine in single-device mode");
            }
            EnginePlacement::DualDevice {
                model_device,
                codec_device,
            } => {
                info!(model_device, codec_device, "Loading engine in dual-device mode");
            }
        }

        let engine = Self {
            placement,
            sample_rate,
            codec_table: Mutex::new(None),
        };

        // Dual-device hosts keep the codec resident from the start; the
        // single-device path defers it to first use.
        if !engine.defer_codec_load() {
            engine.ensure_codec_table();
        }

        Ok(engine)
    }

    pub fn placement(&self) -> EnginePlacement {
        self.placement
    }

    fn defer_codec_load(&self) -> bool {
        matches!(
            self.placement,
            EnginePlacement::SingleDevice {
                defer_codec_load: true
            }
        )
    }

    fn ensure_codec_table(&self) {
        let mut table = self
            .codec_table
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if table.is_none() {
            let fade_len = (self.sample_rate / 100).max(1) as usize;
            let fade: Vec<f32> = (0..fade_len)
                .map(|i| {
                    let t = i as f32 / fade_len as f32;
                    0.5 - 0.5 * (std::f32::consts::PI * t).cos()
                })
                .collect();
            debug!(fade_len, "Built codec fade table");
            *table = Some(fade);
        }
    }

    fn codec_table_snapshot(&self) -> Option<Vec<f32>> {
        self.codec_table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn restore_voice(&self, continuation: Option<&[u8]>, rng: &mut ChaCha8Rng) -> VoiceState {
        if let Some(bytes) = continuation {
            if bytes.len() == CONTINUATION_LEN && &bytes[..4] == CONTINUATION_MAGIC {
                let note_index = i32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
                let phase = f32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
                debug!(note_index, "Continuing from prior generation state");
                return VoiceState { note_index, phase };
            }
            debug!(
                len = bytes.len(),
                "Ignoring continuation state with unknown layout"
            );
        }
        VoiceState {
            note_index: rng.gen_range(0..SCALE_SEMITONES.len() as i32 * 3),
            phase: 0.0,
        }
    }
}

impl GenerationEngine for SynthEngine {
    fn generate(
        &self,
        params: &EngineParams,
        progress: &ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> Result<EngineOutput> {
        self.ensure_codec_table();

        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: self.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };

        if let Some(parent) = params.output_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create output directory: {}", parent.display())
            })?;
        }
        let mut writer = hound::WavWriter::create(&params.output_path, spec)
            .with_context(|| format!("failed to create {}", params.output_path.display()))?;

        let mut rng = ChaCha8Rng::seed_from_u64(u64::from(params.seed));
        let mut voice = self.restore_voice(params.continuation.as_deref(), &mut rng);
        let fade_table = self.codec_table_snapshot();

        // The tag string and reference window steer timbre: tags pick the
        // root pitch, a stronger conditioning window deepens vibrato.
        let root_hz = 110.0 * 2f32.powf((tag_fingerprint(&params.tags) % 12) as f32 / 12.0);
        let vibrato_depth = params
            .reference
            .as_ref()
            .map(|r| 0.002 * (r.window_secs / crate::reference::REFERENCE_WINDOW_SECS))
            .unwrap_or(0.0);

        let total_samples =
            u64::from(params.duration_ms) * u64::from(self.sample_rate) / 1000;
        let block_samples = (u64::from(BLOCK_MS) * u64::from(self.sample_rate) / 1000).max(1);
        let note_samples = (u64::from(NOTE_MS) * u64::from(self.sample_rate) / 1000).max(1);

        let mut written: u64 = 0;
        let mut note_elapsed: u64 = 0;
        let mut last_percent = u8::MAX;

        while written < total_samples {
            // Checkpoint: cancellation is observed between blocks, never
            // mid-block.
            if cancel.is_cancelled() {
                debug!(job_id = %params.job_id, written, "Abort observed at checkpoint");
                return Err(GenerationAborted.into());
            }

            let block_end = (written + block_samples).min(total_samples);
            while written < block_end {
                if note_elapsed >= note_samples {
                    note_elapsed = 0;
                    voice.note_index += step_for(&mut rng, params.temperature, params.top_k);
                    voice.note_index = voice.note_index.clamp(0, SCALE_SEMITONES.len() as i32 * 4);
                }

                let octave = voice.note_index / SCALE_SEMITONES.len() as i32;
                let degree = voice.note_index.rem_euclid(SCALE_SEMITONES.len() as i32);
                let semitones = SCALE_SEMITONES[degree as usize] + 12 * octave;
                let freq = root_hz * 2f32.powf(semitones as f32 / 12.0);
                let vibrato = 1.0 + vibrato_depth * (voice.phase * 0.37).sin();

                voice.phase += 2.0 * std::f32::consts::PI * freq * vibrato / self.sample_rate as f32;
                if voice.phase > 2.0 * std::f32::consts::PI {
                    voice.phase -= 2.0 * std::f32::consts::PI;
                }

                let envelope = 1.0 - note_elapsed as f32 / note_samples as f32;
                let fade = match fade_table.as_deref() {
                    Some(table) if (written as usize) < table.len() => table[written as usize],
                    _ => 1.0,
                };
                let sample = voice.phase.sin() * envelope * fade * 0.6 / params.cfg_scale.max(1.0);
                writer
                    .write_sample((sample * f32::from(i16::MAX)) as i16)
                    .context("failed to write audio sample")?;

                written += 1;
                note_elapsed += 1;
            }

            let percent = ((written * 100) / total_samples) as u8;
            if percent != last_percent {
                last_percent = percent;
                progress(percent, "Generating audio");
            }
        }

        writer.finalize().context("failed to finalize WAV file")?;

        let mut continuation = Vec::with_capacity(CONTINUATION_LEN);
        continuation.extend_from_slice(CONTINUATION_MAGIC);
        continuation.extend_from_slice(&voice.note_index.to_le_bytes());
        continuation.extend_from_slice(&voice.phase.to_le_bytes());

        Ok(EngineOutput {
            audio_path: params.output_path.clone(),
            continuation: Some(continuation),
        })
    }

    fn release_cached_state(&self) -> Result<()> {
        if self.defer_codec_load() {
            let mut table = self
                .codec_table
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if table.take().is_some() {
                debug!("Released lazily-loaded codec table");
            }
        }
        Ok(())
    }

    fn reclaim_device_memory(&self) -> Result<()> {
        // The procedural engine keeps nothing resident on an accelerator;
        // a neural implementation would flush its device allocator here.
        Ok(())
    }
}

fn tag_fingerprint(tags: &str) -> u32 {
    tags.bytes().fold(0u32, |acc, b| {
        acc.wrapping_mul(31).wrapping_add(u32::from(b))
    })
}

/// Melodic step size: hotter sampling wanders further, a tighter top-k pulls
/// the walk back toward the current note.
fn step_for(rng: &mut ChaCha8Rng, temperature: f32, top_k: u32) -> i32 {
    let span = ((temperature * 3.0).round() as i32).clamp(1, 6);
    let step = rng.gen_range(-span..=span);
    if top_k < 10 {
        step.signum()
    } else {
        step
    }
}
