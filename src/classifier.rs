use crate::enums::ScanClassification;

use dicom::object::{DefaultDicomObject, OpenFileOptions};
use dicom_dictionary_std::{tags, uids};
use dicom::core::Tag;
use std::path::Path;
use thiserror::Error;

/// In-plane resolution every accepted slice must have
pub const EXPECTED_MATRIX: u16 = 512;

/// Tags whose joint presence marks a contrast-enhanced acquisition
pub const CONTRAST_TAGS: [Tag; 5] = [
    tags::CONTRAST_BOLUS_AGENT,
    tags::CONTRAST_BOLUS_ROUTE,
    tags::CONTRAST_BOLUS_VOLUME,
    tags::CONTRAST_FLOW_RATE,
    tags::CONTRAST_BOLUS_INGREDIENT_CONCENTRATION,
];

#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("DICOM error: {0}")]
    Dicom(#[from] dicom::object::ReadError),
}

/// The tags of a representative slice that drive classification
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SliceMetadata {
    pub sop_class_uid: String,
    pub image_type: Vec<String>,
    pub rows: Option<u16>,
    pub columns: Option<u16>,
    pub contrast_tags_present: usize,
    pub slice_thickness: Option<f64>,
}

impl SliceMetadata {
    /// Read the metadata of one slice, stopping before its pixel data
    pub fn read_from_file(path: impl AsRef<Path>) -> Result<Self, ClassifierError> {
        let dicom_object = OpenFileOptions::new()
            .read_until(tags::PIXEL_DATA)
            .open_file(path.as_ref())?;
        Ok(Self::from_dicom_object(&dicom_object))
    }

    pub fn from_dicom_object(dicom_object: &DefaultDicomObject) -> Self {
        let sop_class_uid = dicom_object
            .meta()
            .media_storage_sop_class_uid
            .trim_end_matches(['\0', ' '])
            .to_string();

        let image_type = dicom_object
            .element(tags::IMAGE_TYPE)
            .ok()
            .and_then(|element| element.to_multi_str().ok())
            .map(|values| values.iter().map(|v| v.trim().to_string()).collect())
            .unwrap_or_default();

        let rows = dicom_object
            .element(tags::ROWS)
            .ok()
            .and_then(|element| element.to_int::<u16>().ok());

        let columns = dicom_object
            .element(tags::COLUMNS)
            .ok()
            .and_then(|element| element.to_int::<u16>().ok());

        let contrast_tags_present = CONTRAST_TAGS
            .iter()
            .filter(|tag| dicom_object.element(**tag).is_ok())
            .count();

        let slice_thickness = dicom_object
            .element(tags::SLICE_THICKNESS)
            .ok()
            .and_then(|element| element.to_float64().ok());

        Self {
            sop_class_uid,
            image_type,
            rows,
            columns,
            contrast_tags_present,
            slice_thickness,
        }
    }

    /// An original axial CT slice at the expected in-plane resolution
    pub fn is_ct(&self) -> bool {
        self.sop_class_uid == uids::CT_IMAGE_STORAGE
            && self.has_image_type("ORIGINAL")
            && self.has_image_type("AXIAL")
            && self.rows == Some(EXPECTED_MATRIX)
            && self.columns == Some(EXPECTED_MATRIX)
    }

    /// Only meaningful when [`SliceMetadata::is_ct`] holds
    pub fn is_cta(&self) -> bool {
        self.contrast_tags_present == CONTRAST_TAGS.len()
    }

    pub fn classify(&self) -> ScanClassification {
        if !self.is_ct() {
            ScanClassification::Rejected
        } else if self.is_cta() {
            ScanClassification::Cta
        } else {
            ScanClassification::Ncct
        }
    }

    fn has_image_type(&self, value: &str) -> bool {
        self.image_type.iter().any(|v| v == value)
    }
}
