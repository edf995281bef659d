use std::path::PathBuf;

use super::SupportedBackends;
use crate::config::HardwareConfig;

pub trait CapabilityProbe: Send + Sync {
    fn supported_backends(&self) -> SupportedBackends;
}

/// Fixed answer, for hosts where the caller already knows the hardware.
#[derive(Debug, Clone, Copy)]
pub struct StaticCapability(pub SupportedBackends);

impl StaticCapability {
    pub fn cpu_only() -> Self {
        Self(SupportedBackends {
            cpu: true,
            accelerator: false,
        })
    }

    pub fn all() -> Self {
        Self(SupportedBackends {
            cpu: true,
            accelerator: true,
        })
    }
}

impl CapabilityProbe for StaticCapability {
    fn supported_backends(&self) -> SupportedBackends {
        self.0
    }
}

/// Reports the accelerator as present when the cpuinfo dump mentions one of
/// the configured chipset identifiers. CPU is always supported.
#[derive(Debug, Clone)]
pub struct CpuInfoProbe {
    cpuinfo_path: PathBuf,
    chipsets: Vec<String>,
}

impl CpuInfoProbe {
    pub fn new(cpuinfo_path: impl Into<PathBuf>, chipsets: Vec<String>) -> Self {
        Self {
            cpuinfo_path: cpuinfo_path.into(),
            chipsets: chipsets.into_iter().map(|c| c.to_lowercase()).collect(),
        }
    }

    pub fn from_config(hardware: &HardwareConfig) -> Self {
        Self::new(
            hardware.cpuinfo_path.clone(),
            hardware.accelerator_chipsets.clone(),
        )
    }

    fn matches(&self, cpuinfo: &str) -> bool {
        let cpuinfo = cpuinfo.to_lowercase();
        self.chipsets
            .iter()
            .any(|chip| !chip.is_empty() && cpuinfo.contains(chip.as_str()))
    }
}

impl CapabilityProbe for CpuInfoProbe {
    fn supported_backends(&self) -> SupportedBackends {
        let accelerator = match std::fs::read_to_string(&self.cpuinfo_path) {
            Ok(content) => self.matches(&content),
            Err(e) => {
                tracing::warn!(path = %self.cpuinfo_path.display(), error = %e, "cannot read cpuinfo");
                false
            }
        };
        tracing::debug!(accelerator, "hardware capability probed");
        SupportedBackends {
            cpu: true,
            accelerator,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_file(name: &str, content: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("edge_llm_probe_{}", std::process::id()));
        std::fs::create_dir_all(&dir).expect("temp dir");
        let path = dir.join(name);
        std::fs::write(&path, content).expect("write cpuinfo");
        path
    }

    #[test]
    fn detects_configured_chipset_case_insensitively() {
        let path = temp_file("cpuinfo_mtk", "processor\t: 0\nHardware\t: MT6991V/CZA\n");
        let probe = CpuInfoProbe::new(&path, vec!["mt6991".to_string()]);
        assert_eq!(
            probe.supported_backends(),
            SupportedBackends {
                cpu: true,
                accelerator: true
            }
        );
    }

    #[test]
    fn other_chipsets_and_missing_file_are_cpu_only() {
        let path = temp_file("cpuinfo_other", "Hardware\t: Qualcomm SM8650\n");
        let probe = CpuInfoProbe::new(&path, vec!["mt6991".to_string()]);
        assert!(!probe.supported_backends().accelerator);

        let missing = CpuInfoProbe::new("/nonexistent/cpuinfo", vec!["mt6991".to_string()]);
        let supported = missing.supported_backends();
        assert!(supported.cpu);
        assert!(!supported.accelerator);
    }
}
