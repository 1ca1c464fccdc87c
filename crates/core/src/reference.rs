use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::continuation::sanitize_artifact_id;

/// Window length the model was trained against; 100% style influence maps to
/// this many seconds of reference audio.
pub const REFERENCE_WINDOW_SECS: f32 = 10.0;
pub const MIN_WINDOW_SECS: f32 = 1.0;
pub const REF_AUDIO_EXTENSIONS: [&str; 4] = ["wav", "mp3", "flac", "ogg"];

/// Resolved reference-audio conditioning passed to the generation engine.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceConditioning {
    pub audio_path: PathBuf,
    pub window_secs: f32,
    pub start_sec: Option<f32>,
}

/// Conditioning window derived from the user-supplied influence percentage,
/// clamped to the clip's actual duration and a one-second floor.
pub fn conditioning_window_secs(style_influence: f32, clip_duration_secs: f32) -> f32 {
    let window = (style_influence / 100.0) * REFERENCE_WINDOW_SECS;
    window.min(clip_duration_secs).max(MIN_WINDOW_SECS)
}

/// Locate a reference clip by id and derive its conditioning window.
///
/// Returns `Ok(None)` when no file with a known extension exists for the id.
/// A failed duration probe falls back to the full trained window rather than
/// failing the job.
pub fn resolve_reference(
    ref_audio_dir: &Path,
    ref_audio_id: &str,
    style_influence: f32,
    start_sec: Option<f32>,
) -> Result<Option<ReferenceConditioning>> {
    sanitize_artifact_id(ref_audio_id).context("invalid reference audio id")?;

    let Some(audio_path) = locate_reference_audio(ref_audio_dir, ref_audio_id) else {
        return Ok(None);
    };

    let window_secs = match probe_duration_secs(&audio_path) {
        Ok(duration) => {
            let window = conditioning_window_secs(style_influence, duration);
            debug!(
                path = %audio_path.display(),
                clip_secs = duration,
                style_influence,
                window_secs = window,
                "Resolved reference conditioning window"
            );
            window
        }
        Err(err) => {
            warn!(
                path = %audio_path.display(),
                error = %err,
                "Could not probe reference audio duration; using full trained window"
            );
            REFERENCE_WINDOW_SECS
        }
    };

    Ok(Some(ReferenceConditioning {
        audio_path,
        window_secs,
        start_sec,
    }))
}

fn locate_reference_audio(ref_audio_dir: &Path, ref_audio_id: &str) -> Option<PathBuf> {
    for ext in REF_AUDIO_EXTENSIONS {
        let candidate = ref_audio_dir.join(format!("{ref_audio_id}.{ext}"));
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

// ffprobe JSON model (serde)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    format: FfprobeFormat,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

/// Probe a clip's duration with ffprobe.
pub fn probe_duration_secs(path: &Path) -> Result<f32> {
    let output = crate::runtime::command_for("ffprobe")
        .args([
            "-v",
            "error",
            "-show_entries",
            "format=duration",
            "-of",
            "json",
        ])
        .arg(path)
        .output()
        .context("failed to execute ffprobe — is FFmpeg installed?")?;

    if !output.status.success() {
        bail!(
            "ffprobe exited with status {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr)
        );
    }

    parse_ffprobe_duration(&output.stdout)
}

fn parse_ffprobe_duration(json: &[u8]) -> Result<f32> {
    let probe: FfprobeOutput =
        serde_json::from_slice(json).context("failed to parse ffprobe JSON output")?;
    let raw = probe
        .format
        .duration
        .context("ffprobe output has no format duration")?;
    raw.trim()
        .parse::<f32>()
        .with_context(|| format!("invalid ffprobe duration: {raw}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn half_influence_yields_half_the_trained_window() {
        // 50% of the 10-second trained window, inside a 20-second clip.
        let window = conditioning_window_secs(50.0, 20.0);
        assert!((window - 5.0).abs() < f32::EPSILON);
    }

    #[test]
    fn window_is_clamped_to_clip_duration() {
        let window = conditioning_window_secs(100.0, 4.0);
        assert!((window - 4.0).abs() < f32::EPSILON);
    }

    #[test]
    fn window_never_drops_below_one_second() {
        let window = conditioning_window_secs(1.0, 20.0);
        assert!((window - MIN_WINDOW_SECS).abs() < f32::EPSILON);
    }

    #[test]
    fn full_influence_uses_full_trained_window() {
        let window = conditioning_window_secs(100.0, 60.0);
        assert!((window - REFERENCE_WINDOW_SECS).abs() < f32::EPSILON);
    }

    #[test]
    fn locates_clip_by_extension_probe() {
        let temp = tempfile::tempdir().expect("temp dir should be created");
        std::fs::write(temp.path().join("clip.flac"), b"flac bytes").expect("write clip");

        let located = locate_reference_audio(temp.path(), "clip");
        assert_eq!(located, Some(temp.path().join("clip.flac")));
        assert!(locate_reference_audio(temp.path(), "absent").is_none());
    }

    #[test]
    fn missing_clip_resolves_to_none() {
        let temp = tempfile::tempdir().expect("temp dir should be created");
        let resolved =
            resolve_reference(temp.path(), "absent", 50.0, None).expect("resolve missing clip");
        assert!(resolved.is_none());
    }

    #[test]
    fn traversal_reference_id_is_rejected() {
        let temp = tempfile::tempdir().expect("temp dir should be created");
        assert!(resolve_reference(temp.path(), "../etc/passwd", 50.0, None).is_err());
    }

    #[test]
    fn parses_ffprobe_duration_json() {
        let json = br#"{"format": {"duration": "20.043000"}}"#;
        let duration = parse_ffprobe_duration(json).expect("duration should parse");
        assert!((duration - 20.043).abs() < 1e-3);
    }

    #[test]
    fn ffprobe_output_without_duration_is_an_error() {
        let json = br#"{"format": {}}"#;
        assert!(parse_ffprobe_duration(json).is_err());
    }
}
