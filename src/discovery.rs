use crate::{
    classifier::{ClassifierError, SliceMetadata},
    enums::{MAX_THICKNESS_MM, ScanType},
};

use regex::Regex;
use std::{
    fs, io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, warn};

/// Default accepted name shape for series directories and slice files
pub const DEFAULT_NAME_PATTERN: &str = "^[A-Z0-9]+$";

/// Series with this many slice files or fewer are never classified
pub const DEFAULT_MIN_SLICES: usize = 10;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Expected exactly one entry in {}, found {found}", .dir.display())]
    Ambiguous { dir: PathBuf, found: usize },

    #[error("Invalid name pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Predicate over directory entry names
#[derive(Debug, Clone)]
pub enum NameFilter {
    Pattern(Regex),
    /// Any name not starting with a dot
    Visible,
}

impl NameFilter {
    pub fn pattern(pattern: &str) -> Result<Self, DiscoveryError> {
        Ok(NameFilter::Pattern(Regex::new(pattern)?))
    }

    pub fn visible() -> Self {
        NameFilter::Visible
    }

    pub fn accepts(&self, name: &str) -> bool {
        match self {
            NameFilter::Pattern(regex) => regex.is_match(name),
            NameFilter::Visible => !name.starts_with('.'),
        }
    }

    /// Accepted entries of `dir`, sorted by file name
    pub fn list(&self, dir: &Path) -> Result<Vec<PathBuf>, DiscoveryError> {
        let mut paths: Vec<_> = fs::read_dir(dir)?
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_str().is_some_and(|name| self.accepts(name)))
            .map(|entry| entry.path())
            .collect();
        paths.sort();
        Ok(paths)
    }
}

impl Default for NameFilter {
    fn default() -> Self {
        NameFilter::Pattern(Regex::new(DEFAULT_NAME_PATTERN).expect("default pattern is valid"))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScanBucketEntry {
    pub path: PathBuf,
    pub thickness: f64,
}

impl ScanBucketEntry {
    /// The series directory name, used to label outputs and ledger ids
    pub fn series_id(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PatientScanSet {
    pub ncct: Vec<ScanBucketEntry>,
    pub cta: Vec<ScanBucketEntry>,
    pub notes: Vec<String>,
}

impl PatientScanSet {
    pub fn bucket(&self, scan_type: ScanType) -> &[ScanBucketEntry] {
        match scan_type {
            ScanType::Ncct => &self.ncct,
            ScanType::Cta => &self.cta,
        }
    }

    fn bucket_mut(&mut self, scan_type: ScanType) -> &mut Vec<ScanBucketEntry> {
        match scan_type {
            ScanType::Ncct => &mut self.ncct,
            ScanType::Cta => &mut self.cta,
        }
    }

    pub fn notes_text(&self) -> String {
        self.notes.join(" ")
    }
}

pub struct ScanDiscovery {
    filter: NameFilter,
    min_slices: usize,
}

impl ScanDiscovery {
    pub fn new(filter: NameFilter, min_slices: usize) -> Self {
        Self { filter, min_slices }
    }

    pub fn filter(&self) -> &NameFilter {
        &self.filter
    }

    /// Walk the series directories of one study and bucket the usable ones
    ///
    /// # Errors
    ///
    /// Returns error only if `dir` itself cannot be listed; series that cannot
    /// be read are logged and skipped
    pub fn discover(&self, dir: &Path) -> Result<PatientScanSet, DiscoveryError> {
        let mut scan_set = PatientScanSet::default();

        for series in self.filter.list(dir)? {
            if !series.is_dir() {
                continue;
            }
            let slices = match self.list_slices(&series) {
                Ok(slices) => slices,
                Err(e) => {
                    warn!("Could not list series {}: {}", series.display(), e);
                    continue;
                }
            };
            if slices.len() <= self.min_slices {
                debug!("Skipping {} ({} slices)", series.display(), slices.len());
                continue;
            }

            let metadata = match SliceMetadata::read_from_file(&slices[0]) {
                Ok(metadata) => metadata,
                Err(ClassifierError::Dicom(e)) => {
                    warn!("Could not read {}: {}", slices[0].display(), e);
                    continue;
                }
            };

            let Some(scan_type) = metadata.classify().scan_type() else {
                debug!("Not an axial CT: {}", series.display());
                continue;
            };

            match metadata.slice_thickness {
                None => scan_set
                    .notes
                    .push(format!("{scan_type} exists but slice thickness is missing.")),
                Some(thickness)
                    if !thickness.is_finite() || thickness <= 0.0 || thickness > MAX_THICKNESS_MM =>
                {
                    scan_set
                        .notes
                        .push(format!("{scan_type} exists but thickness={thickness}mm."))
                }
                Some(thickness) => scan_set.bucket_mut(scan_type).push(ScanBucketEntry {
                    path: series,
                    thickness,
                }),
            }
        }

        Ok(scan_set)
    }

    /// Locate the study directory below `{patient}/DICOM`, descending `depth`
    /// levels that must each hold a single accepted entry
    pub fn resolve_series_root(&self, dicom_dir: &Path, depth: usize) -> Result<PathBuf, DiscoveryError> {
        let mut dir = dicom_dir.to_path_buf();
        for _ in 0..depth {
            let mut content = self.filter.list(&dir)?;
            if content.len() != 1 {
                return Err(DiscoveryError::Ambiguous {
                    dir,
                    found: content.len(),
                });
            }
            dir = content.remove(0);
        }
        Ok(dir)
    }

    fn list_slices(&self, series: &Path) -> Result<Vec<PathBuf>, DiscoveryError> {
        Ok(self
            .filter
            .list(series)?
            .into_iter()
            .filter(|path| path.is_file())
            .collect())
    }
}

impl Default for ScanDiscovery {
    fn default() -> Self {
        Self::new(NameFilter::default(), DEFAULT_MIN_SLICES)
    }
}
