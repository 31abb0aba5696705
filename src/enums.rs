use std::fmt;

use thiserror::Error;

/// Thickest slice, in millimeters, that any canonical atlas can absorb.
pub const MAX_THICKNESS_MM: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScanType {
    Ncct,
    Cta,
}

impl ScanType {
    pub const ALL: [ScanType; 2] = [ScanType::Ncct, ScanType::Cta];

    /// Directory name and ledger label of this scan type
    pub fn label(self) -> &'static str {
        match self {
            ScanType::Ncct => "NCCT",
            ScanType::Cta => "CTA",
        }
    }
}

impl fmt::Display for ScanType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanClassification {
    Ncct,
    Cta,
    Rejected,
}

impl ScanClassification {
    pub fn scan_type(self) -> Option<ScanType> {
        match self {
            ScanClassification::Ncct => Some(ScanType::Ncct),
            ScanClassification::Cta => Some(ScanType::Cta),
            ScanClassification::Rejected => None,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ThicknessError {
    #[error("slice thickness {0}mm has no canonical atlas (maximum is 2mm)")]
    OutOfRange(f64),
}

/// Resolution of the canonical atlas a volume is registered into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CanonicalThickness {
    HalfMm,
    OneMm,
    TwoMm,
}

impl CanonicalThickness {
    /// Smallest canonical thickness that is not thinner than `measured`.
    ///
    /// Callers must have already set aside anything thicker than
    /// [`MAX_THICKNESS_MM`]; such a value is reported as an error rather than
    /// clamped.
    pub fn from_measured(measured: f64) -> Result<Self, ThicknessError> {
        if !measured.is_finite() {
            return Err(ThicknessError::OutOfRange(measured));
        }
        if measured <= 0.5 {
            Ok(CanonicalThickness::HalfMm)
        } else if measured <= 1.0 {
            Ok(CanonicalThickness::OneMm)
        } else if measured <= MAX_THICKNESS_MM {
            Ok(CanonicalThickness::TwoMm)
        } else {
            Err(ThicknessError::OutOfRange(measured))
        }
    }

    pub fn millimeters(self) -> f64 {
        match self {
            CanonicalThickness::HalfMm => 0.5,
            CanonicalThickness::OneMm => 1.0,
            CanonicalThickness::TwoMm => 2.0,
        }
    }
}

impl fmt::Display for CanonicalThickness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.millimeters())
    }
}
