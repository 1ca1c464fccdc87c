use anyhow::{Context, Result};
use tracing::{debug, info, warn};

/// One detected accelerator and its memory capacity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceleratorInfo {
    pub index: u32,
    pub name: String,
    pub memory_mib: u64,
}

/// Where the engine's sub-components live.
///
/// The language model is the large, always-resident component; the codec is
/// the smaller decode stage with lighter traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnginePlacement {
    /// Zero or one accelerator: keep the codec off the accelerator until it
    /// is first needed, minimizing resident memory while idle.
    SingleDevice { defer_codec_load: bool },
    /// Two or more accelerators: model on the largest, codec on the smallest.
    DualDevice { model_device: u32, codec_device: u32 },
}

/// Strategy mapping detected accelerators to an engine placement.
///
/// Implementations must be pure functions of the capacity list so they can be
/// unit-tested with synthetic inputs and swapped without touching the
/// scheduler.
pub trait PlacementPolicy: Send + Sync {
    fn place(&self, accelerators: &[AcceleratorInfo]) -> EnginePlacement;
}

/// Default policy: largest accelerator hosts the model, smallest hosts the
/// codec, on the premise that the codec is smaller and its traffic lighter.
#[derive(Debug, Default, Clone, Copy)]
pub struct CapacityPlacement;

impl PlacementPolicy for CapacityPlacement {
    fn place(&self, accelerators: &[AcceleratorInfo]) -> EnginePlacement {
        if accelerators.len() < 2 {
            return EnginePlacement::SingleDevice {
                defer_codec_load: true,
            };
        }

        let model = accelerators
            .iter()
            .max_by_key(|a| a.memory_mib)
            .expect("at least two accelerators");
        let codec = accelerators
            .iter()
            .filter(|a| a.index != model.index)
            .min_by_key(|a| a.memory_mib)
            .expect("at least one remaining accelerator");

        EnginePlacement::DualDevice {
            model_device: model.index,
            codec_device: codec.index,
        }
    }
}

/// Detect accelerators by querying `nvidia-smi`.
///
/// Absence of the binary (or any query failure) yields an empty list, which
/// places the engine in single-device mode.
pub fn detect_accelerators() -> Vec<AcceleratorInfo> {
    let output = match crate::runtime::command_for("nvidia-smi")
        .args([
            "--query-gpu=index,name,memory.total",
            "--format=csv,noheader,nounits",
        ])
        .output()
    {
        Ok(output) => output,
        Err(err) => {
            debug!(error = %err, "nvidia-smi not available; assuming no accelerators");
            return Vec::new();
        }
    };

    if !output.status.success() {
        warn!(
            status = %output.status,
            "nvidia-smi query failed; assuming no accelerators"
        );
        return Vec::new();
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    match parse_accelerator_csv(&stdout) {
        Ok(accelerators) => {
            for acc in &accelerators {
                info!(
                    index = acc.index,
                    name = %acc.name,
                    memory_mib = acc.memory_mib,
                    "Detected accelerator"
                );
            }
            accelerators
        }
        Err(err) => {
            warn!(error = %err, "failed to parse nvidia-smi output; assuming no accelerators");
            Vec::new()
        }
    }
}

/// Parse `index, name, memory.total` CSV rows as emitted by
/// `nvidia-smi --format=csv,noheader,nounits`.
pub fn parse_accelerator_csv(raw: &str) -> Result<Vec<AcceleratorInfo>> {
    let mut accelerators = Vec::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut fields = line.splitn(3, ',').map(str::trim);
        let index = fields
            .next()
            .context("missing accelerator index")?
            .parse::<u32>()
            .with_context(|| format!("invalid accelerator index in line: {line}"))?;
        let name = fields
            .next()
            .context("missing accelerator name")?
            .to_string();
        let memory_mib = fields
            .next()
            .context("missing accelerator memory")?
            .parse::<u64>()
            .with_context(|| format!("invalid accelerator memory in line: {line}"))?;
        accelerators.push(AcceleratorInfo {
            index,
            name,
            memory_mib,
        });
    }
    Ok(accelerators)
}
