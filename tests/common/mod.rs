#![allow(dead_code)]

use ct_prep::{
    config::Config,
    runner::{Invocation, ToolOutcome, ToolRunner, find_volume, with_suffix},
};
use dicom::core::{DataElement, PrimitiveValue, VR};
use dicom::object::{FileMetaTableBuilder, InMemDicomObject};
use dicom_dictionary_std::{tags, uids};
use flate2::{Compression, write::GzEncoder};
use ndarray::Array3;
use nifti::writer::WriterOptions;
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Mutex,
};
use tokio_util::sync::CancellationToken;

/// Tags of the representative slice written by [`write_series`]
#[derive(Clone)]
pub struct SliceSpec {
    pub sop_class_uid: &'static str,
    pub image_type: Vec<&'static str>,
    pub rows: u16,
    pub columns: u16,
    pub contrast: bool,
    pub thickness: Option<&'static str>,
}

impl SliceSpec {
    pub fn ncct(thickness: &'static str) -> Self {
        Self {
            sop_class_uid: uids::CT_IMAGE_STORAGE,
            image_type: vec!["ORIGINAL", "PRIMARY", "AXIAL"],
            rows: 512,
            columns: 512,
            contrast: false,
            thickness: Some(thickness),
        }
    }

    pub fn cta(thickness: &'static str) -> Self {
        Self {
            contrast: true,
            ..Self::ncct(thickness)
        }
    }
}

pub fn write_slice(path: &Path, fixture: &SliceSpec) {
    let mut obj = InMemDicomObject::new_empty();
    obj.put(DataElement::new(
        tags::IMAGE_TYPE,
        VR::CS,
        PrimitiveValue::Strs(fixture.image_type.iter().map(|v| v.to_string()).collect()),
    ));
    obj.put(DataElement::new(tags::ROWS, VR::US, PrimitiveValue::from(fixture.rows)));
    obj.put(DataElement::new(tags::COLUMNS, VR::US, PrimitiveValue::from(fixture.columns)));
    if let Some(thickness) = fixture.thickness {
        obj.put(DataElement::new(
            tags::SLICE_THICKNESS,
            VR::DS,
            PrimitiveValue::from(thickness),
        ));
    }
    if fixture.contrast {
        obj.put(DataElement::new(tags::CONTRAST_BOLUS_AGENT, VR::LO, PrimitiveValue::from("IOMERON 350")));
        obj.put(DataElement::new(tags::CONTRAST_BOLUS_ROUTE, VR::LO, PrimitiveValue::from("IV")));
        obj.put(DataElement::new(tags::CONTRAST_BOLUS_VOLUME, VR::DS, PrimitiveValue::from("70")));
        obj.put(DataElement::new(tags::CONTRAST_FLOW_RATE, VR::DS, PrimitiveValue::from("4")));
        obj.put(DataElement::new(
            tags::CONTRAST_BOLUS_INGREDIENT_CONCENTRATION,
            VR::DS,
            PrimitiveValue::from("350"),
        ));
    }

    let file = obj
        .with_meta(
            FileMetaTableBuilder::new()
                .transfer_syntax(uids::EXPLICIT_VR_LITTLE_ENDIAN)
                .media_storage_sop_class_uid(fixture.sop_class_uid)
                .media_storage_sop_instance_uid("2.25.1"),
        )
        .unwrap();
    file.write_to_file(path).unwrap();
}

/// A series directory with `slices` files; only the first one (in name
/// order) carries DICOM content
pub fn write_series(study: &Path, name: &str, slices: usize, fixture: &SliceSpec) -> PathBuf {
    let series = study.join(name);
    fs::create_dir_all(&series).unwrap();
    for i in 0..slices {
        let path = series.join(format!("I{i:04}"));
        if i == 0 {
            write_slice(&path, fixture);
        } else {
            fs::write(&path, b"").unwrap();
        }
    }
    series
}

/// `{input}/{patient}/DICOM/A/B/C`, the study directory of a patient
pub fn study_dir(input: &Path, patient: &str) -> PathBuf {
    let study = input.join(patient).join("DICOM").join("A").join("B").join("C");
    fs::create_dir_all(&study).unwrap();
    study
}

pub fn write_volume(path: &Path, shape: (usize, usize, usize)) {
    let data = Array3::from_shape_fn(shape, |(x, y, z)| (x + y + z) as f32);
    WriterOptions::new(path).write_nifti(&data).unwrap();
}

pub fn test_config(root: &Path) -> Config {
    let mut config = Config {
        input: root.join("TAC"),
        output: root.join("out"),
        report: root.join("ct-report.csv"),
        ..Config::default()
    };
    config.tools.dcm2niix = PathBuf::from("dcm2niix");
    config.tools.flirt = PathBuf::from("flirt");
    config.tools.fslmaths = PathBuf::from("fslmaths");
    config.tools.bet2 = PathBuf::from("bet2");
    config.pipeline.atlas_template = root.join("MNI152_T1_{}mm").display().to_string();
    fs::create_dir_all(&config.input).unwrap();
    config.init_dirs().unwrap();
    config
}

/// Stands in for dcm2niix and FSL: each tool copies its input volume to the
/// output it was asked for
pub struct FakeTools {
    pub invocations: Mutex<Vec<Invocation>>,
    pub converted_shape: (usize, usize, usize),
    /// Program that exits with an error
    pub failing: Option<&'static str>,
    /// Program that exits cleanly without writing anything
    pub silent: Option<&'static str>,
    /// Program that writes `{stem}.nii.gz` instead of `{stem}.nii`
    pub compressing: Option<&'static str>,
    /// Cancelled on the first invocation
    pub cancel_on_first_call: Option<CancellationToken>,
}

impl FakeTools {
    pub fn new() -> Self {
        Self {
            invocations: Mutex::new(Vec::new()),
            converted_shape: (4, 4, 12),
            failing: None,
            silent: None,
            compressing: None,
            cancel_on_first_call: None,
        }
    }

    pub fn programs(&self) -> Vec<String> {
        self.invocations
            .lock()
            .unwrap()
            .iter()
            .map(Invocation::name)
            .collect()
    }

    pub fn calls(&self) -> Vec<Invocation> {
        self.invocations.lock().unwrap().clone()
    }

    fn simulate(&self, invocation: &Invocation) {
        let compress = self.compressing.is_some_and(|name| invocation.program_is(name));
        let copy = |input: &str, output: &str| copy_volume(input, output, compress);
        if invocation.program_is("dcm2niix") {
            let dir = PathBuf::from(invocation.flag_value("-o").unwrap());
            let name = invocation.flag_value("-f").unwrap();
            write_volume(&dir.join(format!("{name}.nii")), self.converted_shape);
            fs::write(dir.join(format!("{name}.json")), b"{}").unwrap();
        } else if invocation.program_is("flirt") {
            let input = invocation.flag_value("-in").unwrap();
            let output = invocation.flag_value("-out").unwrap();
            copy(input, output);
            fs::write(invocation.flag_value("-omat").unwrap(), b"1 0 0 0").unwrap();
        } else if invocation.program_is("fslmaths") {
            let input = invocation.arg_str(0).unwrap();
            let output = invocation.arg_str(invocation.args.len() - 1).unwrap();
            copy(input, output);
        } else if invocation.program_is("bet2") {
            copy(invocation.arg_str(0).unwrap(), invocation.arg_str(1).unwrap());
        }
    }
}

fn copy_volume(input: &str, output_stem: &str, compress: bool) {
    let input = Path::new(input);
    let source = if input.is_file() {
        input.to_path_buf()
    } else {
        find_volume(input).unwrap()
    };
    let output_stem = Path::new(output_stem);
    if compress {
        let output = fs::File::create(with_suffix(output_stem, "nii.gz")).unwrap();
        let mut encoder = GzEncoder::new(output, Compression::default());
        std::io::copy(&mut fs::File::open(source).unwrap(), &mut encoder).unwrap();
        encoder.finish().unwrap();
    } else {
        fs::copy(source, with_suffix(output_stem, "nii")).unwrap();
    }
}

impl ToolRunner for FakeTools {
    async fn run(&self, invocation: &Invocation) -> ToolOutcome {
        let first = {
            let mut invocations = self.invocations.lock().unwrap();
            invocations.push(invocation.clone());
            invocations.len() == 1
        };
        if first {
            if let Some(token) = &self.cancel_on_first_call {
                token.cancel();
            }
        }

        if self.failing.is_some_and(|name| invocation.program_is(name)) {
            return ToolOutcome::Failed {
                code: Some(1),
                stderr: "simulated failure".to_string(),
            };
        }
        if self.silent.is_some_and(|name| invocation.program_is(name)) {
            return ToolOutcome::Succeeded;
        }
        self.simulate(invocation);
        ToolOutcome::Succeeded
    }
}
