//! Conversion, registration and skull stripping of bucketed series
//!
//! Each series goes through three stages, and each stage consumes the
//! working volume left in place by the previous one:
//!
//!  1. conversion of the DICOM series into `{output}/{TYPE}/{patient}-{series}.nii`
//!  2. registration into the canonical atlas matching its slice thickness
//!  3. removal of extracranial tissue
//!
//! Intermediate files of a stage live in a scratch directory that is removed
//! when the stage returns, whether it succeeded or not. A failed stage leaves
//! no working volume behind and is reported in the bucket's problems.

use crate::{
    config::Config,
    discovery::ScanBucketEntry,
    enums::{CanonicalThickness, ScanType, ThicknessError},
    runner::{Invocation, ToolOutcome, ToolRunner, find_volume, with_suffix},
    volume::{self, VolumeError},
};

use std::{
    fmt, fs, io,
    path::{Path, PathBuf},
};
use tempfile::TempDir;
use thiserror::Error;
use tracing::{info, warn};

/// Fixed registration parameters handed to `flirt`
pub const REGISTRATION_OPTIONS: [&str; 17] = [
    "-bins", "256", "-cost", "corratio", "-searchrx", "-90", "90", "-searchry", "-90", "90",
    "-searchrz", "-90", "90", "-dof", "12", "-interp", "trilinear",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Conversion,
    Registration,
    Stripping,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Conversion => write!(f, "conversion"),
            Stage::Registration => write!(f, "registration"),
            Stage::Stripping => write!(f, "skull stripping"),
        }
    }
}

#[derive(Debug, Error)]
pub enum StageError {
    #[error("{tool} {outcome}")]
    Tool { tool: String, outcome: ToolOutcome },

    #[error("{tool} produced no volume at {}", .path.display())]
    MissingOutput { tool: String, path: PathBuf },

    #[error(transparent)]
    Volume(#[from] VolumeError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// A series that could not be carried through every stage
#[derive(Debug, Error)]
#[error("{stage} failed: {source}")]
pub struct EntryFailure {
    pub stage: Stage,
    #[source]
    pub source: StageError,
}

impl EntryFailure {
    fn at(stage: Stage) -> impl FnOnce(StageError) -> Self {
        move |source| Self { stage, source }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Internal invariant violated for {}: {source}", .series.display())]
    Invariant {
        series: PathBuf,
        source: ThicknessError,
    },

    #[error("Could not create output directory {}: {source}", .path.display())]
    OutputDir { path: PathBuf, source: io::Error },
}

/// What happened to one bucket, in discovery order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BucketSummary {
    pub ids: Vec<String>,
    /// `"{measured}->{canonical}"` per series
    pub thicknesses: Vec<String>,
    /// `"{series}: {stage} failed: {reason}"` per failed series
    pub problems: Vec<String>,
}

impl BucketSummary {
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn ids_field(&self) -> String {
        self.ids.join(",")
    }

    pub fn thicknesses_field(&self) -> String {
        self.thicknesses.join(",")
    }

    pub fn problems_field(&self) -> String {
        self.problems.join("; ")
    }
}

/// Output file stem shared by the volume and its metadata sidecar
pub fn output_basename(patient_id: &str, series_id: &str) -> String {
    format!("{patient_id}-{series_id}").replace(' ', "_")
}

pub struct ConversionOrchestrator<'a, R> {
    config: &'a Config,
    runner: &'a R,
}

impl<'a, R: ToolRunner> ConversionOrchestrator<'a, R> {
    pub fn new(config: &'a Config, runner: &'a R) -> Self {
        Self { config, runner }
    }

    /// Carry every series of one bucket through all stages
    ///
    /// # Errors
    ///
    /// Only internal-consistency failures are returned; a series that fails a
    /// stage is recorded in the summary's problems and the next one proceeds
    pub async fn process_bucket(
        &self,
        patient_id: &str,
        scan_type: ScanType,
        entries: &[ScanBucketEntry],
    ) -> Result<BucketSummary, PipelineError> {
        let mut summary = BucketSummary::default();
        if entries.is_empty() {
            return Ok(summary);
        }

        let metadata_dir = self.config.metadata_dir(scan_type);
        fs::create_dir_all(&metadata_dir).map_err(|source| PipelineError::OutputDir {
            path: metadata_dir,
            source,
        })?;

        for entry in entries {
            let canonical = CanonicalThickness::from_measured(entry.thickness).map_err(|source| {
                PipelineError::Invariant {
                    series: entry.path.clone(),
                    source,
                }
            })?;
            let series_id = entry.series_id();
            summary.ids.push(series_id.clone());
            summary
                .thicknesses
                .push(format!("{}->{}", entry.thickness, canonical));

            info!(
                "{} {}: {}mm -> {}mm atlas",
                scan_type, series_id, entry.thickness, canonical
            );
            match self.process_entry(patient_id, scan_type, entry, canonical).await {
                Ok(volume) => info!("  done: {}", volume.display()),
                Err(failure) => {
                    warn!("  {} {}: {}", scan_type, series_id, failure);
                    summary.problems.push(format!("{series_id}: {failure}"));
                }
            }
        }

        Ok(summary)
    }

    async fn process_entry(
        &self,
        patient_id: &str,
        scan_type: ScanType,
        entry: &ScanBucketEntry,
        canonical: CanonicalThickness,
    ) -> Result<PathBuf, EntryFailure> {
        let basename = output_basename(patient_id, &entry.series_id());
        let work = self.config.type_dir(scan_type).join(format!("{basename}.nii"));

        let result = async {
            self.convert(&entry.path, scan_type, &basename, &work)
                .await
                .map_err(EntryFailure::at(Stage::Conversion))?;
            self.register(&work, scan_type, canonical)
                .await
                .map_err(EntryFailure::at(Stage::Registration))?;
            self.strip(&work, scan_type)
                .await
                .map_err(EntryFailure::at(Stage::Stripping))
        }
        .await;

        if result.is_err() {
            discard(&work);
        }
        result.map(|()| work)
    }

    async fn convert(
        &self,
        series: &Path,
        scan_type: ScanType,
        basename: &str,
        work: &Path,
    ) -> Result<(), StageError> {
        let scratch = self.scratch(scan_type)?;
        let invocation = Invocation::new(&self.config.tools.dcm2niix)
            .args(["-v", "n", "-o"])
            .arg(scratch.path())
            .args(["-z", "n", "-f"])
            .arg(basename)
            .arg(series);
        self.invoke(invocation).await?;

        let converted = scratch.path().join(format!("{basename}.nii"));
        if !converted.is_file() {
            return Err(StageError::MissingOutput {
                tool: self.tool_name(&self.config.tools.dcm2niix),
                path: converted,
            });
        }
        fs::rename(&converted, work)?;

        let sidecar = scratch.path().join(format!("{basename}.json"));
        if sidecar.is_file() {
            fs::rename(
                &sidecar,
                self.config
                    .metadata_dir(scan_type)
                    .join(format!("{basename}.json")),
            )?;
        } else {
            warn!("  no metadata sidecar for {}", basename);
        }
        Ok(())
    }

    async fn register(
        &self,
        work: &Path,
        scan_type: ScanType,
        canonical: CanonicalThickness,
    ) -> Result<(), StageError> {
        let max_slices = self.config.pipeline.max_slices;
        if volume::truncate_slices(work, max_slices)? {
            info!("  truncated to the last {} slices", max_slices);
        }

        let scratch = self.scratch(scan_type)?;
        let registered = scratch.path().join("registered");
        let invocation = self
            .fsl(&self.config.tools.flirt)
            .arg("-in")
            .arg(work)
            .arg("-ref")
            .arg(self.config.pipeline.atlas(canonical))
            .arg("-out")
            .arg(&registered)
            .arg("-omat")
            .arg(scratch.path().join("registered.mat"))
            .args(REGISTRATION_OPTIONS);
        let produced = self.step(invocation, &registered).await?;
        move_into_place(&produced, &registered, work)
    }

    async fn strip(&self, work: &Path, scan_type: ScanType) -> Result<(), StageError> {
        let window = self.config.pipeline.strip_window(scan_type);
        let scratch = self.scratch(scan_type)?;
        let file = |name: &str| scratch.path().join(name);
        let (thresholded, premask, smoothed, remasked, brain, mask, stripped) = (
            file("thresholded"),
            file("premask"),
            file("smoothed"),
            file("remasked"),
            file("brain"),
            file("mask"),
            file("stripped"),
        );
        let fslmaths = &self.config.tools.fslmaths;

        // Threshold to the scan type's window
        let thr = self
            .fsl(fslmaths)
            .arg(work)
            .arg("-thr")
            .arg(format!("{:.6}", window.min))
            .arg("-uthr")
            .arg(format!("{:.6}", window.max))
            .arg(&thresholded);
        let thresholded = self.step(thr, &thresholded).await?;

        // Filled preliminary mask used to remask after smoothing
        let fill = self
            .fsl(fslmaths)
            .arg(&thresholded)
            .args(["-bin", "-fillh"])
            .arg(&premask);
        let premask = self.step(fill, &premask).await?;

        let smooth = self
            .fsl(fslmaths)
            .arg(&thresholded)
            .args(["-s", "1"])
            .arg(&smoothed);
        let smoothed = self.step(smooth, &smoothed).await?;

        let remask = self
            .fsl(fslmaths)
            .arg(&smoothed)
            .arg("-mas")
            .arg(&premask)
            .arg(&remasked);
        let remasked = self.step(remask, &remasked).await?;

        let bet = self
            .fsl(&self.config.tools.bet2)
            .arg(&remasked)
            .arg(&brain)
            .arg("-f")
            .arg(self.config.pipeline.bet_fraction.to_string());
        let brain = self.step(bet, &brain).await?;

        let fill = self
            .fsl(fslmaths)
            .arg(&brain)
            .args(["-bin", "-fillh"])
            .arg(&mask);
        let mask = self.step(fill, &mask).await?;

        // The final mask applies to the registered volume, not the smoothed one
        let apply = self
            .fsl(fslmaths)
            .arg(work)
            .arg("-mas")
            .arg(&mask)
            .arg(&stripped);
        let produced = self.step(apply, &stripped).await?;
        move_into_place(&produced, &stripped, work)
    }

    /// Run one tool and locate the volume it was asked to write at `stem`
    async fn step(&self, invocation: Invocation, stem: &Path) -> Result<PathBuf, StageError> {
        let tool = invocation.name();
        self.invoke(invocation).await?;
        find_volume(stem).ok_or_else(|| StageError::MissingOutput {
            tool,
            path: with_suffix(stem, "nii"),
        })
    }

    async fn invoke(&self, invocation: Invocation) -> Result<(), StageError> {
        match self.runner.run(&invocation).await {
            ToolOutcome::Succeeded => Ok(()),
            outcome => Err(StageError::Tool {
                tool: invocation.name(),
                outcome,
            }),
        }
    }

    fn fsl(&self, program: &Path) -> Invocation {
        Invocation::new(program).env("FSLOUTPUTTYPE", "NIFTI")
    }

    fn tool_name(&self, program: &Path) -> String {
        Invocation::new(program).name()
    }

    fn scratch(&self, scan_type: ScanType) -> io::Result<TempDir> {
        tempfile::Builder::new()
            .prefix(".scratch-")
            .tempdir_in(self.config.type_dir(scan_type))
    }
}

/// Replace `work` with a tool's result, inflating it first if the tool
/// compressed it
fn move_into_place(produced: &Path, stem: &Path, work: &Path) -> Result<(), StageError> {
    let plain = with_suffix(stem, "nii");
    if produced != plain {
        volume::decompress(produced, &plain)?;
    }
    fs::rename(&plain, work)?;
    Ok(())
}

fn discard(work: &Path) {
    match fs::remove_file(work) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Could not remove partial volume {}: {}", work.display(), e),
    }
}
