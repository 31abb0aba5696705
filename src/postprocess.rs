//! Follow-up passes over already processed volumes
//!
//! These run on the output trees after a batch: removal of residual skull
//! from CTA volumes using the patient's stripped NCCT, and clamping of
//! intensities to a fixed window.

use crate::{
    config::{Config, Window},
    enums::ScanType,
    volume::{Volume, VolumeError},
};

use std::{
    fs, io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{info, warn};

/// Ratio between the CTA and NCCT atlas resolutions
pub const UPSAMPLE_FACTOR: usize = 2;

#[derive(Debug, Error)]
pub enum PostprocessError {
    #[error("{}: {source}", .path.display())]
    Volume { path: PathBuf, source: VolumeError },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// More than one NCCT volume, no way to pick the reference
    AmbiguousNcct(usize),
    AmbiguousCta(usize),
    NoNcct,
    NoCta,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::AmbiguousNcct(count) => write!(f, "{count} NCCT volumes (ambiguity)"),
            SkipReason::AmbiguousCta(count) => write!(f, "{count} CTA volumes (ambiguity)"),
            SkipReason::NoNcct => write!(f, "no reference NCCT"),
            SkipReason::NoCta => write!(f, "no CTA"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanOutcome {
    Cleaned { output: PathBuf, zeroed: usize },
    Skipped(SkipReason),
}

/// Volumes of `patient_id` in `dir`, sorted by name
pub fn patient_volumes(dir: &Path, patient_id: &str) -> io::Result<Vec<PathBuf>> {
    let prefix = format!("{patient_id}-");
    let mut volumes: Vec<_> = fs::read_dir(dir)?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with(&prefix) && name.ends_with(".nii"))
        })
        .collect();
    volumes.sort();
    Ok(volumes)
}

/// Zero the CTA voxels of `patient_id` that lie outside the brain of its
/// NCCT, writing the result to the `CTA_clean` tree
///
/// Patients with anything other than exactly one NCCT and one CTA volume
/// are skipped.
pub fn clean_cta(config: &Config, patient_id: &str) -> Result<CleanOutcome, PostprocessError> {
    let nccts = patient_volumes(&config.type_dir(ScanType::Ncct), patient_id)?;
    let ctas = patient_volumes(&config.type_dir(ScanType::Cta), patient_id)?;

    let reason = match (nccts.len(), ctas.len()) {
        (n, _) if n > 1 => Some(SkipReason::AmbiguousNcct(n)),
        (_, n) if n > 1 => Some(SkipReason::AmbiguousCta(n)),
        (0, _) => Some(SkipReason::NoNcct),
        (_, 0) => Some(SkipReason::NoCta),
        _ => None,
    };
    if let Some(reason) = reason {
        warn!("Skipping {}: {}", patient_id, reason);
        return Ok(CleanOutcome::Skipped(reason));
    }

    let (ncct_path, cta_path) = (&nccts[0], &ctas[0]);
    let ncct = load(ncct_path)?;
    let mut cta = load(cta_path)?;
    let zeroed = cta
        .mask_with_upsampled(&ncct, UPSAMPLE_FACTOR)
        .map_err(|source| PostprocessError::Volume {
            path: cta_path.clone(),
            source,
        })?;

    let clean_dir = config.clean_cta_dir();
    fs::create_dir_all(&clean_dir)?;
    let output = clean_dir.join(cta_path.file_name().unwrap_or_default());
    save(&cta, &output)?;
    info!("Cleaned {} ({} voxels zeroed)", output.display(), zeroed);

    Ok(CleanOutcome::Cleaned { output, zeroed })
}

/// Clamp every volume in `dir` to `window`, rewriting each in place
///
/// Returns the number of volumes rewritten
pub fn window_directory(dir: &Path, window: Window) -> Result<usize, PostprocessError> {
    let mut volumes: Vec<_> = fs::read_dir(dir)?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "nii"))
        .collect();
    volumes.sort();

    for path in &volumes {
        info!("NORMALIZING {}", path.display());
        let mut volume = load(path)?;
        volume.clamp(window.min, window.max);
        save(&volume, path)?;
    }
    Ok(volumes.len())
}

fn load(path: &Path) -> Result<Volume, PostprocessError> {
    Volume::load(path).map_err(|source| PostprocessError::Volume {
        path: path.to_path_buf(),
        source,
    })
}

fn save(volume: &Volume, path: &Path) -> Result<(), PostprocessError> {
    volume.save(path).map_err(|source| PostprocessError::Volume {
        path: path.to_path_buf(),
        source,
    })
}
