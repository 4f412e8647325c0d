use std::fmt;

use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use tokio::process::Command;
use tracing::debug;

use crate::engine::GenerationEngine;

/// Host and runtime details printed above the results table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnvironmentInfo {
    pub runtime_version: Option<String>,
    pub accelerator_name: Option<String>,
    pub accelerator_memory_bytes: Option<u64>,
    /// ROCm or NVIDIA kernel driver version reported by the vendor tool.
    pub driver_version: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Accelerator {
    pub name: String,
    pub memory_bytes: Option<u64>,
    pub driver_version: Option<String>,
}

pub async fn detect_environment(engine: &dyn GenerationEngine) -> EnvironmentInfo {
    let runtime_version = engine.runtime_version().await;
    let accelerator = detect_accelerator().await;
    EnvironmentInfo {
        runtime_version,
        accelerator_name: accelerator.as_ref().map(|acc| acc.name.clone()),
        accelerator_memory_bytes: accelerator.as_ref().and_then(|acc| acc.memory_bytes),
        driver_version: accelerator.and_then(|acc| acc.driver_version),
    }
}

async fn detect_accelerator() -> Option<Accelerator> {
    match run_tool(
        "rocm-smi",
        &[
            "--showproductname",
            "--showmeminfo",
            "vram",
            "--showdriverversion",
            "--json",
        ],
    )
    .await
    .and_then(|output| parse_rocm_smi(&output))
    {
        Ok(accelerator) => return Some(accelerator),
        Err(err) => debug!(error = %err, "rocm-smi query failed"),
    }

    match run_tool(
        "nvidia-smi",
        &[
            "--query-gpu=name,memory.total,driver_version",
            "--format=csv,noheader,nounits",
        ],
    )
    .await
    .and_then(|output| parse_nvidia_smi(&output))
    {
        Ok(accelerator) => Some(accelerator),
        Err(err) => {
            debug!(error = %err, "nvidia-smi query failed");
            None
        }
    }
}

async fn run_tool(program: &str, args: &[&str]) -> Result<String> {
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .with_context(|| format!("failed to run {}", program))?;
    if !output.status.success() {
        return Err(anyhow!("{} exited with {}", program, output.status));
    }
    String::from_utf8(output.stdout).with_context(|| format!("{} printed non-UTF-8 output", program))
}

/// First card of `rocm-smi --showproductname --showmeminfo vram --showdriverversion --json`.
pub(crate) fn parse_rocm_smi(output: &str) -> Result<Accelerator> {
    let payload: Value = serde_json::from_str(output).context("rocm-smi output is not JSON")?;
    let cards = payload
        .as_object()
        .ok_or_else(|| anyhow!("rocm-smi output is not an object"))?;

    let mut card_names: Vec<&String> = cards.keys().filter(|key| key.starts_with("card")).collect();
    card_names.sort();
    let card = card_names
        .first()
        .and_then(|name| cards.get(name.as_str()))
        .ok_or_else(|| anyhow!("rocm-smi reported no cards"))?;

    let name = ["Card Series", "Card series", "Card SKU", "Card model"]
        .iter()
        .find_map(|key| card.get(*key).and_then(|value| value.as_str()))
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .ok_or_else(|| anyhow!("rocm-smi did not report a product name"))?
        .to_string();

    let memory_bytes = card
        .get("VRAM Total Memory (B)")
        .and_then(|value| match value {
            Value::String(text) => text.trim().parse::<u64>().ok(),
            other => other.as_u64(),
        });

    let driver_version = payload
        .get("system")
        .and_then(|system| system.get("Driver version"))
        .and_then(|value| value.as_str())
        .map(str::trim)
        .filter(|version| !version.is_empty())
        .map(str::to_string);

    Ok(Accelerator {
        name,
        memory_bytes,
        driver_version,
    })
}

/// First line of `nvidia-smi --query-gpu=name,memory.total,driver_version
/// --format=csv,noheader,nounits`. Memory is reported in MiB. A line without
/// the driver column is accepted.
pub(crate) fn parse_nvidia_smi(output: &str) -> Result<Accelerator> {
    let line = output
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .ok_or_else(|| anyhow!("nvidia-smi reported no devices"))?;

    let (rest, last) = line
        .rsplit_once(',')
        .ok_or_else(|| anyhow!("unexpected nvidia-smi line: {}", line))?;
    let (name, memory, driver) = match rest.rsplit_once(',') {
        Some((name, memory)) if memory.trim().parse::<u64>().is_ok() => (name, memory, Some(last)),
        _ => (rest, last, None),
    };
    let memory_bytes = memory
        .trim()
        .parse::<u64>()
        .ok()
        .map(|mib| mib * 1024 * 1024);

    let driver_version = driver
        .map(str::trim)
        .filter(|version| !version.is_empty())
        .map(str::to_string);

    Ok(Accelerator {
        name: name.trim().to_string(),
        memory_bytes,
        driver_version,
    })
}

impl fmt::Display for EnvironmentInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Engine runtime version: {}",
            self.runtime_version.as_deref().unwrap_or("unknown")
        )?;
        writeln!(
            f,
            "GPU Name: {}",
            self.accelerator_name.as_deref().unwrap_or("No GPU detected")
        )?;
        writeln!(
            f,
            "GPU driver version: {}",
            self.driver_version.as_deref().unwrap_or("unknown")
        )?;
        match self.accelerator_memory_bytes {
            Some(bytes) => writeln!(f, "GPU VRAM: {:.2} GB", bytes as f64 / 1e9),
            None => writeln!(f, "GPU VRAM: unknown"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rocm_smi_json() {
        let output = r#"{
            "card1": {"Card Series": "Other", "VRAM Total Memory (B)": "1"},
            "card0": {"Card Series": "AMD Instinct MI300X", "VRAM Total Memory (B)": "205822885888", "VRAM Total Used Memory (B)": "1"},
            "system": {"Driver version": "6.8.5"}
        }"#;
        let accelerator = parse_rocm_smi(output).unwrap();
        assert_eq!(accelerator.name, "AMD Instinct MI300X");
        assert_eq!(accelerator.memory_bytes, Some(205_822_885_888));
        assert_eq!(accelerator.driver_version.as_deref(), Some("6.8.5"));
    }

    #[test]
    fn rocm_smi_without_driver_section() {
        let output = r#"{"card0": {"Card Series": "AMD Radeon PRO W7900"}}"#;
        let accelerator = parse_rocm_smi(output).unwrap();
        assert_eq!(accelerator.name, "AMD Radeon PRO W7900");
        assert!(accelerator.memory_bytes.is_none());
        assert!(accelerator.driver_version.is_none());
    }

    #[test]
    fn rocm_smi_without_cards_is_an_error() {
        assert!(parse_rocm_smi(r#"{"system": {}}"#).is_err());
        assert!(parse_rocm_smi("ERROR: no devices").is_err());
    }

    #[test]
    fn parses_nvidia_smi_csv() {
        let accelerator = parse_nvidia_smi(
            "NVIDIA H100 80GB HBM3, 81559, 550.54.15\nNVIDIA H100 80GB HBM3, 81559, 550.54.15\n",
        )
        .unwrap();
        assert_eq!(accelerator.name, "NVIDIA H100 80GB HBM3");
        assert_eq!(accelerator.memory_bytes, Some(81_559 * 1024 * 1024));
        assert_eq!(accelerator.driver_version.as_deref(), Some("550.54.15"));

        let without_driver = parse_nvidia_smi("NVIDIA A100-SXM4-40GB, 40960").unwrap();
        assert_eq!(without_driver.name, "NVIDIA A100-SXM4-40GB");
        assert_eq!(without_driver.memory_bytes, Some(40_960 * 1024 * 1024));
        assert!(without_driver.driver_version.is_none());

        assert!(parse_nvidia_smi("\n").is_err());
    }

    #[test]
    fn display_falls_back_when_nothing_was_detected() {
        let rendered = EnvironmentInfo::default().to_string();
        assert!(rendered.contains("GPU Name: No GPU detected"));
        assert!(rendered.contains("Engine runtime version: unknown"));
        assert!(rendered.contains("GPU driver version: unknown"));

        let info = EnvironmentInfo {
            runtime_version: Some("0.11.0".to_string()),
            accelerator_name: Some("AMD Instinct MI300X".to_string()),
            accelerator_memory_bytes: Some(205_822_885_888),
            driver_version: Some("6.8.5".to_string()),
        };
        let rendered = info.to_string();
        assert!(rendered.contains("GPU driver version: 6.8.5"));
        assert!(rendered.contains("Engine runtime version: 0.11.0"));
        assert!(rendered.contains("GPU VRAM: 205.82 GB"));
    }
}
