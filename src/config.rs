//! Run configuration
//!
//! Everything has a default, so a configuration file only needs to name what
//! differs on the host. Paths of the FSL tools default to a stock
//! `/usr/local/fsl` installation.

use crate::{
    discovery::{DEFAULT_MIN_SLICES, DEFAULT_NAME_PATTERN, DiscoveryError, NameFilter, ScanDiscovery},
    enums::{CanonicalThickness, ScanType},
};

use serde::{Deserialize, Serialize};
use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Could not read config {}: {source}", .path.display())]
    Read { path: PathBuf, source: io::Error },

    #[error("Invalid config {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Atlas template must contain '{{}}': {0}")]
    AtlasTemplate(String),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
}

/// Intensity range, inclusive on both ends
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Window {
    pub min: f32,
    pub max: f32,
}

impl Window {
    pub const fn new(min: f32, max: f32) -> Self {
        Self { min, max }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding one subdirectory per patient
    pub input: PathBuf,
    /// Root of the `NCCT/`, `CTA/` and `CTA_clean/` output trees
    pub output: PathBuf,
    /// Cumulative run ledger
    pub report: PathBuf,
    pub discovery: DiscoveryConfig,
    pub tools: ToolsConfig,
    pub pipeline: PipelineConfig,
    pub window: WindowConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            input: PathBuf::from("."),
            output: PathBuf::from("."),
            report: PathBuf::from("ct-report.csv"),
            discovery: DiscoveryConfig::default(),
            tools: ToolsConfig::default(),
            pipeline: PipelineConfig::default(),
            window: WindowConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Regex every series directory and slice file name must match;
    /// empty accepts any name not starting with a dot
    pub name_pattern: String,
    pub min_slices: usize,
    /// Single-entry directory levels between `{patient}/DICOM` and the
    /// series directories
    pub layout_depth: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            name_pattern: DEFAULT_NAME_PATTERN.to_string(),
            min_slices: DEFAULT_MIN_SLICES,
            layout_depth: 3,
        }
    }
}

impl DiscoveryConfig {
    pub fn name_filter(&self) -> Result<NameFilter, DiscoveryError> {
        if self.name_pattern.is_empty() {
            Ok(NameFilter::visible())
        } else {
            NameFilter::pattern(&self.name_pattern)
        }
    }

    pub fn scan_discovery(&self) -> Result<ScanDiscovery, DiscoveryError> {
        Ok(ScanDiscovery::new(self.name_filter()?, self.min_slices))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub dcm2niix: PathBuf,
    pub flirt: PathBuf,
    pub fslmaths: PathBuf,
    pub bet2: PathBuf,
    /// Upper bound on a single tool invocation
    pub timeout_secs: u64,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            dcm2niix: PathBuf::from("dcm2niix"),
            flirt: PathBuf::from("/usr/local/fsl/bin/flirt"),
            fslmaths: PathBuf::from("/usr/local/fsl/bin/fslmaths"),
            bet2: PathBuf::from("/usr/local/fsl/bin/bet2"),
            timeout_secs: 2 * 60 * 60,
        }
    }
}

impl ToolsConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Atlas path with `{}` standing for the canonical thickness
    pub atlas_template: String,
    /// Longest slice stack handed to registration
    pub max_slices: usize,
    /// Fractional intensity threshold for brain extraction
    pub bet_fraction: f32,
    pub ncct_strip_window: Window,
    pub cta_strip_window: Window,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            atlas_template: "/usr/local/fsl/data/standard/MNI152_T1_{}mm".to_string(),
            max_slices: 500,
            bet_fraction: 0.01,
            ncct_strip_window: Window::new(0.0, 100.0),
            cta_strip_window: Window::new(-75.0, 425.0),
        }
    }
}

impl PipelineConfig {
    pub fn atlas(&self, thickness: CanonicalThickness) -> PathBuf {
        PathBuf::from(self.atlas_template.replace("{}", &thickness.to_string()))
    }

    pub fn strip_window(&self, scan_type: ScanType) -> Window {
        match scan_type {
            ScanType::Ncct => self.ncct_strip_window,
            ScanType::Cta => self.cta_strip_window,
        }
    }
}

/// Clamping ranges of the `window` command
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub ncct: Window,
    pub cta: Window,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            ncct: Window::new(0.0, 100.0),
            cta: Window::new(0.0, 200.0),
        }
    }
}

impl WindowConfig {
    pub fn for_type(&self, scan_type: ScanType) -> Window {
        match scan_type {
            ScanType::Ncct => self.ncct,
            ScanType::Cta => self.cta,
        }
    }
}

impl Config {
    /// Load a TOML configuration, or the defaults when no path is given
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => {
                let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                Self::from_toml(&text).map_err(|source| ConfigError::Parse {
                    path: path.to_path_buf(),
                    source,
                })?
            }
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.pipeline.atlas_template.contains("{}") {
            return Err(ConfigError::AtlasTemplate(self.pipeline.atlas_template.clone()));
        }
        self.discovery.name_filter()?;
        Ok(())
    }

    pub fn type_dir(&self, scan_type: ScanType) -> PathBuf {
        self.output.join(scan_type.label())
    }

    pub fn metadata_dir(&self, scan_type: ScanType) -> PathBuf {
        self.type_dir(scan_type).join("metadata")
    }

    pub fn clean_cta_dir(&self) -> PathBuf {
        self.output.join("CTA_clean")
    }

    /// Create the per-type output trees
    pub fn init_dirs(&self) -> io::Result<()> {
        for scan_type in ScanType::ALL {
            fs::create_dir_all(self.metadata_dir(scan_type))?;
        }
        Ok(())
    }
}
