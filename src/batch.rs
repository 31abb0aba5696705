use crate::{
    config::Config,
    discovery::{DiscoveryError, ScanDiscovery},
    enums::ScanType,
    ledger::{Ledger, LedgerError, LedgerRow},
    pipeline::{ConversionOrchestrator, PipelineError},
    runner::ToolRunner,
};

use std::path::Path;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum BatchError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("Could not list patients: {0}")]
    Discovery(#[from] DiscoveryError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Patients that got a new ledger row
    pub processed: usize,
    /// Patients already in the ledger
    pub skipped: usize,
    /// Processed patients without a `DICOM` folder
    pub missing: usize,
    /// Processed patients whose folder layout could not be resolved
    pub invalid_layout: usize,
    pub cancelled: bool,
}

/// How far a patient got before its row was written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Discovered,
    MissingDicom,
    InvalidLayout,
}

/// Sequential per-patient processing loop
pub struct Batch<'a, R> {
    config: &'a Config,
    discovery: ScanDiscovery,
    orchestrator: ConversionOrchestrator<'a, R>,
    ledger: Ledger,
}

impl<'a, R: ToolRunner> Batch<'a, R> {
    pub fn new(config: &'a Config, runner: &'a R, ledger: Ledger) -> Result<Self, BatchError> {
        Ok(Self {
            config,
            discovery: config.discovery.scan_discovery()?,
            orchestrator: ConversionOrchestrator::new(config, runner),
            ledger,
        })
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Process every pending patient under the input root
    ///
    /// `cancel` is only looked at between patients: a patient that has started
    /// always gets its ledger row.
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<RunSummary, BatchError> {
        let mut summary = RunSummary::default();
        let patients = self.discovery.filter().list(&self.config.input)?;

        for patient_dir in patients {
            if cancel.is_cancelled() {
                info!("Stopping before {}", patient_dir.display());
                summary.cancelled = true;
                break;
            }
            if !patient_dir.is_dir() {
                continue;
            }
            let Some(patient_id) = patient_dir.file_name().and_then(|name| name.to_str()) else {
                continue;
            };

            info!("PATIENT {}", patient_id);
            if self.ledger.contains(patient_id) {
                info!("Skipped because already converted");
                summary.skipped += 1;
                continue;
            }

            let (row, disposition) = self.process_patient(patient_id, &patient_dir).await?;
            self.ledger.append(&row)?;
            summary.processed += 1;
            match disposition {
                Disposition::MissingDicom => summary.missing += 1,
                Disposition::InvalidLayout => summary.invalid_layout += 1,
                Disposition::Discovered => {}
            }
            info!("{}", "-".repeat(80));
        }

        Ok(summary)
    }

    async fn process_patient(
        &self,
        patient_id: &str,
        patient_dir: &Path,
    ) -> Result<(LedgerRow, Disposition), BatchError> {
        let dicom_dir = patient_dir.join("DICOM");
        if !dicom_dir.is_dir() {
            warn!("No DICOM folder for {}", patient_id);
            return Ok((LedgerRow::missing_dicom(patient_id), Disposition::MissingDicom));
        }

        let scans = match self
            .discovery
            .resolve_series_root(&dicom_dir, self.config.discovery.layout_depth)
            .and_then(|root| self.discovery.discover(&root))
        {
            Ok(scans) => scans,
            Err(e) => {
                warn!("Invalid DICOM folder for {}: {}", patient_id, e);
                let row = LedgerRow::with_notes(patient_id, format!("invalid DICOM folder: {e}"));
                return Ok((row, Disposition::InvalidLayout));
            }
        };

        for note in &scans.notes {
            info!("  {}", note);
        }
        info!(
            "  {} NCCT, {} CTA series",
            scans.ncct.len(),
            scans.cta.len()
        );

        let ncct = self
            .orchestrator
            .process_bucket(patient_id, ScanType::Ncct, &scans.ncct)
            .await?;
        let cta = self
            .orchestrator
            .process_bucket(patient_id, ScanType::Cta, &scans.cta)
            .await?;

        let row = LedgerRow::new(patient_id, &ncct, &cta, scans.notes_text());
        Ok((row, Disposition::Discovered))
    }
}
