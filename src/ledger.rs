//! Append-only CSV record of processed patients
//!
//! A patient whose id appears in the ledger is never processed again, so an
//! interrupted run resumes where it stopped. Rows are flushed and synced as
//! soon as they are written.

use crate::pipeline::BucketSummary;

use serde::{Deserialize, Serialize};
use std::{
    collections::HashSet,
    fs::{File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, warn};

pub const HEADER: [&str; 8] = [
    "idProcessoLocal",
    "NCCT",
    "NCCT thick",
    "CTA",
    "CTA thick",
    "NCCT problems",
    "CTA problems",
    "notes",
];

pub const NO_DICOM_FOLDER: &str = "no DICOM folder";

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("CSV error in {}: {source}", .path.display())]
    Csv { path: PathBuf, source: csv::Error },

    #[error("IO error on {}: {source}", .path.display())]
    Io { path: PathBuf, source: io::Error },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerRow {
    #[serde(rename = "idProcessoLocal")]
    pub patient_id: String,
    #[serde(rename = "NCCT")]
    pub ncct: String,
    #[serde(rename = "NCCT thick")]
    pub ncct_thickness: String,
    #[serde(rename = "CTA")]
    pub cta: String,
    #[serde(rename = "CTA thick")]
    pub cta_thickness: String,
    #[serde(rename = "NCCT problems")]
    pub ncct_problems: String,
    #[serde(rename = "CTA problems")]
    pub cta_problems: String,
    pub notes: String,
}

impl LedgerRow {
    pub fn new(patient_id: &str, ncct: &BucketSummary, cta: &BucketSummary, notes: String) -> Self {
        Self {
            patient_id: patient_id.to_string(),
            ncct: ncct.ids_field(),
            ncct_thickness: ncct.thicknesses_field(),
            cta: cta.ids_field(),
            cta_thickness: cta.thicknesses_field(),
            ncct_problems: ncct.problems_field(),
            cta_problems: cta.problems_field(),
            notes,
        }
    }

    pub fn missing_dicom(patient_id: &str) -> Self {
        Self::with_notes(patient_id, NO_DICOM_FOLDER)
    }

    /// A row carrying only a note, for patients that could not be processed
    pub fn with_notes(patient_id: &str, notes: impl Into<String>) -> Self {
        Self {
            patient_id: patient_id.to_string(),
            notes: notes.into(),
            ..Self::default()
        }
    }
}

#[derive(Deserialize)]
struct ProcessedId {
    #[serde(rename = "idProcessoLocal")]
    patient_id: String,
}

pub struct Ledger {
    path: PathBuf,
    writer: csv::Writer<File>,
    processed: HashSet<String>,
}

impl Ledger {
    /// Open the ledger at `path`, creating it with a header row if it is
    /// missing or empty
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let path = path.as_ref().to_path_buf();
        let processed = read_processed(&path)?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| LedgerError::Io {
                path: path.clone(),
                source,
            })?;
        let is_empty = file
            .metadata()
            .map_err(|source| LedgerError::Io {
                path: path.clone(),
                source,
            })?
            .len()
            == 0;

        // A row cut short by a crash must not swallow the next one
        if !is_empty {
            let io_error = |source| LedgerError::Io {
                path: path.clone(),
                source,
            };
            if !ends_with_newline(&path).map_err(io_error)? {
                warn!("Ledger {} has an unterminated last line", path.display());
                file.write_all(b"\n").map_err(io_error)?;
            }
        }

        let writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        let mut ledger = Self {
            path,
            writer,
            processed,
        };
        if is_empty {
            debug!("Starting new ledger at {}", ledger.path.display());
            ledger
                .writer
                .write_record(HEADER)
                .map_err(|source| ledger.csv_error(source))?;
            ledger.sync()?;
        }
        Ok(ledger)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn contains(&self, patient_id: &str) -> bool {
        self.processed.contains(patient_id)
    }

    pub fn processed(&self) -> &HashSet<String> {
        &self.processed
    }

    /// Append one row and make it durable before returning
    pub fn append(&mut self, row: &LedgerRow) -> Result<(), LedgerError> {
        self.writer
            .serialize(row)
            .map_err(|source| self.csv_error(source))?;
        self.sync()?;
        self.processed.insert(row.patient_id.clone());
        Ok(())
    }

    fn sync(&mut self) -> Result<(), LedgerError> {
        let path = &self.path;
        let io_error = |source| LedgerError::Io {
            path: path.clone(),
            source,
        };
        self.writer.flush().map_err(io_error)?;
        self.writer.get_ref().sync_data().map_err(io_error)
    }

    fn csv_error(&self, source: csv::Error) -> LedgerError {
        LedgerError::Csv {
            path: self.path.clone(),
            source,
        }
    }
}

fn ends_with_newline(path: &Path) -> io::Result<bool> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

fn read_processed(path: &Path) -> Result<HashSet<String>, LedgerError> {
    let csv_error = |source| LedgerError::Csv {
        path: path.to_path_buf(),
        source,
    };
    if !path.exists() {
        return Ok(HashSet::new());
    }
    let mut reader = csv::Reader::from_path(path).map_err(csv_error)?;
    reader
        .deserialize::<ProcessedId>()
        .map(|record| record.map(|r| r.patient_id).map_err(csv_error))
        .collect()
}
