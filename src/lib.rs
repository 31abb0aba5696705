//! # ct-prep
//!
//! Resumable batch preprocessing of head CT studies stored as DICOM.
//!
//! For every patient directory below an input root the crate finds the
//! acquired series, sorts them into non-contrast CT (NCCT) and CT angiography
//! (CTA), converts each usable series to NIfTI, registers it into the MNI152
//! atlas whose resolution matches the slice thickness and strips the skull.
//! Outcomes are appended to a CSV ledger, one row per patient, which doubles
//! as the list of patients to skip when the run is started again.
//!
//! A series is only considered when it has more than ten slices and its
//! first slice (in file name order) is:
//!  - CT Image Storage
//!  - an `ORIGINAL` and `AXIAL` image
//!  - 512×512
//!
//! It is a CTA when all five contrast/bolus attributes are present, an NCCT
//! otherwise. Series thicker than 2mm are not processed; they only leave a
//! note in the ledger.
//!
//! Conversion, registration and skull stripping are delegated to `dcm2niix`
//! and FSL (`flirt`, `fslmaths`, `bet2`), invoked through a [`ToolRunner`] so
//! that every invocation is checked and bounded by a timeout.
//!
//! # Examples
//!
//! ## Classifying the series of one study
//!
//! ```no_run
//! # use ct_prep::discovery::ScanDiscovery;
//! # use std::path::Path;
//! let scans = ScanDiscovery::default()
//!     .discover(Path::new("TAC/1234/DICOM/A/B/C"))
//!     .expect("should have listed the study");
//! for entry in &scans.ncct {
//!     println!("NCCT {} at {}mm", entry.series_id(), entry.thickness);
//! }
//! println!("{}", scans.notes_text());
//! ```
//!
//! ## Running a batch
//!
//! ```no_run
//! # use ct_prep::{batch::Batch, config::Config, ledger::Ledger, runner::ProcessRunner};
//! # use tokio_util::sync::CancellationToken;
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load(None)?;
//! config.init_dirs()?;
//! let runner = ProcessRunner::new(config.tools.timeout());
//! let ledger = Ledger::open(&config.report)?;
//! let mut batch = Batch::new(&config, &runner, ledger)?;
//! let summary = batch.run(&CancellationToken::new()).await?;
//! println!("{} processed, {} skipped", summary.processed, summary.skipped);
//! # Ok(())
//! # }
//! ```
//!
//! [`ToolRunner`]: runner::ToolRunner

pub mod batch;
pub mod cancel;
pub mod classifier;
pub mod config;
pub mod discovery;
pub mod enums;
pub mod ledger;
pub mod pipeline;
pub mod postprocess;
pub mod runner;
pub mod volume;
