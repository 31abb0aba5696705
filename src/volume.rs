use flate2::read::GzDecoder;
use ndarray::{ArrayD, Axis, Ix3, Slice, Zip};
use nifti::{IntoNdArray, NiftiHeader, NiftiObject, ReaderOptions, writer::WriterOptions};
use rayon::prelude::*;
use std::{
    fs::{self, File},
    io::{self, BufReader},
    path::Path,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VolumeError {
    #[error("NIfTI error: {0}")]
    Nifti(#[from] nifti::NiftiError),

    #[error("Expected a {expected}D volume, found {found} dimensions")]
    Dimensionality { expected: usize, found: usize },

    #[error("Volume shape {found:?} does not match expected {expected:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// A NIfTI volume held in memory as `f32` samples
pub struct Volume {
    pub header: NiftiHeader,
    pub data: ArrayD<f32>,
}

impl Volume {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, VolumeError> {
        let object = ReaderOptions::new().read_file(path.as_ref())?;
        let header = object.header().clone();
        let data = object.into_volume().into_ndarray::<f32>()?;
        Ok(Self { header, data })
    }

    /// Write the volume next to `path` and move it into place, so readers
    /// never observe a half-written file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), VolumeError> {
        let path = path.as_ref();
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let staged = tempfile::Builder::new()
            .prefix(".volume-")
            .suffix(".nii")
            .tempfile_in(dir)?;

        // Samples are already scaled, so the written file must not rescale them
        let mut header = self.header.clone();
        header.scl_slope = 1.0;
        header.scl_inter = 0.0;

        WriterOptions::new(staged.path())
            .reference_header(&header)
            .write_nifti(&self.data)?;
        staged.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    /// Length of the last axis (the slice stack)
    pub fn slice_count(&self) -> usize {
        self.data.shape().last().copied().unwrap_or(0)
    }

    /// Keep only the last `keep` samples of the last axis
    pub fn keep_last_slices(&mut self, keep: usize) -> bool {
        let count = self.slice_count();
        if count <= keep {
            return false;
        }
        let axis = Axis(self.data.ndim() - 1);
        self.data = self
            .data
            .slice_axis(axis, Slice::from(count - keep..))
            .to_owned();
        true
    }

    /// Clamp every sample into `[min, max]`
    pub fn clamp(&mut self, min: f32, max: f32) {
        self.data.par_mapv_inplace(|v| v.clamp(min, max));
    }

    /// Zero every sample whose voxel, downsampled by `factor` along each
    /// spatial axis, is non-positive in `reference`
    pub fn mask_with_upsampled(&mut self, reference: &Volume, factor: usize) -> Result<usize, VolumeError> {
        let reference = reference.spatial()?;
        let expected: Vec<usize> = reference.shape().iter().map(|len| len * factor).collect();
        if self.shape() != expected.as_slice() {
            return Err(VolumeError::ShapeMismatch {
                expected,
                found: self.shape().to_vec(),
            });
        }

        let ndim = self.data.ndim();
        let target = self
            .data
            .view_mut()
            .into_dimensionality::<Ix3>()
            .map_err(|_| VolumeError::Dimensionality {
                expected: 3,
                found: ndim,
            })?;

        Zip::indexed(target).par_for_each(|(x, y, z), v| {
            if reference[[x / factor, y / factor, z / factor]] <= 0.0 {
                *v = 0.0;
            }
        });

        let masked = reference.into_par_iter().filter(|v| **v <= 0.0).count();
        Ok(masked * factor.pow(3))
    }

    fn spatial(&self) -> Result<ndarray::ArrayView3<'_, f32>, VolumeError> {
        self.data
            .view()
            .into_dimensionality::<Ix3>()
            .map_err(|_| VolumeError::Dimensionality {
                expected: 3,
                found: self.data.ndim(),
            })
    }
}

/// Number of samples along the last axis, read from the header only
pub fn slice_count(path: impl AsRef<Path>) -> Result<usize, VolumeError> {
    let header = NiftiHeader::from_file(path.as_ref())?;
    let ndim = usize::from(header.dim[0]).clamp(1, 7);
    Ok(usize::from(header.dim[ndim]))
}

/// Truncate the volume at `path` in place to its last `keep` slices
///
/// Returns whether the file was rewritten
pub fn truncate_slices(path: impl AsRef<Path>, keep: usize) -> Result<bool, VolumeError> {
    let path = path.as_ref();
    if slice_count(path)? <= keep {
        return Ok(false);
    }
    let mut volume = Volume::load(path)?;
    volume.keep_last_slices(keep);
    volume.save(path)?;
    Ok(true)
}

/// Inflate a gzip-compressed volume into `destination`
pub fn decompress(source: impl AsRef<Path>, destination: impl AsRef<Path>) -> Result<(), VolumeError> {
    let mut decoder = GzDecoder::new(BufReader::new(File::open(source.as_ref())?));
    let mut output = File::create(destination.as_ref())?;
    io::copy(&mut decoder, &mut output)?;
    fs::remove_file(source.as_ref())?;
    Ok(())
}
