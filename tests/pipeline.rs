mod common;

use common::{FakeTools, SliceSpec, study_dir, test_config, write_series};
use ct_prep::{
    discovery::{ScanBucketEntry, ScanDiscovery},
    enums::ScanType,
    pipeline::{BucketSummary, ConversionOrchestrator, PipelineError},
    volume,
};
use std::{fs, path::Path};

fn entries_in(dir: &Path) -> Vec<String> {
    let mut names: Vec<_> = fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn empty_bucket_invokes_nothing() {
    let root = tempfile::tempdir().unwrap();
    let config = test_config(root.path());
    let tools = FakeTools::new();

    let summary = ConversionOrchestrator::new(&config, &tools)
        .process_bucket("P1", ScanType::Cta, &[])
        .await
        .unwrap();

    assert_eq!(summary, BucketSummary::default());
    assert_eq!(summary.ids_field(), "");
    assert_eq!(summary.thicknesses_field(), "");
    assert!(tools.calls().is_empty());
}

#[tokio::test]
async fn series_runs_every_stage_in_order() {
    let root = tempfile::tempdir().unwrap();
    let config = test_config(root.path());
    let study = study_dir(&config.input, "P1");
    write_series(&study, "S0001", 50, &SliceSpec::ncct("0.4"));
    let scans = ScanDiscovery::default().discover(&study).unwrap();
    let tools = FakeTools::new();

    let summary = ConversionOrchestrator::new(&config, &tools)
        .process_bucket("P1", ScanType::Ncct, &scans.ncct)
        .await
        .unwrap();

    assert_eq!(summary.ids, vec!["S0001"]);
    assert_eq!(summary.thicknesses, vec!["0.4->0.5"]);
    assert!(summary.problems.is_empty(), "{:?}", summary.problems);
    assert_eq!(
        tools.programs(),
        vec![
            "dcm2niix", "flirt", "fslmaths", "fslmaths", "fslmaths", "fslmaths", "bet2",
            "fslmaths", "fslmaths",
        ]
    );

    let calls = tools.calls();
    let flirt = &calls[1];
    let atlas = config.pipeline.atlas(ct_prep::enums::CanonicalThickness::HalfMm);
    assert_eq!(flirt.flag_value("-ref"), atlas.to_str());
    assert_eq!(flirt.flag_value("-cost"), Some("corratio"));
    assert_eq!(flirt.flag_value("-dof"), Some("12"));
    assert!(flirt.envs.contains(&("FSLOUTPUTTYPE".to_string(), "NIFTI".to_string())));

    let threshold = &calls[2];
    assert_eq!(threshold.flag_value("-thr"), Some("0.000000"));
    assert_eq!(threshold.flag_value("-uthr"), Some("100.000000"));
    assert_eq!(calls[6].flag_value("-f"), Some("0.01"));

    // Final mask is applied to the registered volume itself
    let work = config.type_dir(ScanType::Ncct).join("P1-S0001.nii");
    let last = calls.last().unwrap();
    assert_eq!(last.arg_str(0), work.to_str());
    assert_eq!(last.arg_str(1), Some("-mas"));

    assert!(work.is_file());
    assert!(config.metadata_dir(ScanType::Ncct).join("P1-S0001.json").is_file());
    assert_eq!(
        entries_in(&config.type_dir(ScanType::Ncct)),
        vec!["P1-S0001.nii", "metadata"]
    );
}

#[tokio::test]
async fn cta_uses_its_own_window() {
    let root = tempfile::tempdir().unwrap();
    let config = test_config(root.path());
    let study = study_dir(&config.input, "P1");
    let series = write_series(&study, "S0002", 50, &SliceSpec::cta("1.2"));
    let tools = FakeTools::new();

    let summary = ConversionOrchestrator::new(&config, &tools)
        .process_bucket(
            "P1",
            ScanType::Cta,
            &[ScanBucketEntry {
                path: series,
                thickness: 1.2,
            }],
        )
        .await
        .unwrap();

    assert_eq!(summary.thicknesses, vec!["1.2->2"]);
    let calls = tools.calls();
    assert_eq!(calls[2].flag_value("-thr"), Some("-75.000000"));
    assert_eq!(calls[2].flag_value("-uthr"), Some("425.000000"));
    assert!(config.type_dir(ScanType::Cta).join("P1-S0002.nii").is_file());
}

#[tokio::test]
async fn long_series_are_truncated_before_registration() {
    let root = tempfile::tempdir().unwrap();
    let mut config = test_config(root.path());
    config.pipeline.max_slices = 8;
    let study = study_dir(&config.input, "P1");
    let series = write_series(&study, "S0001", 50, &SliceSpec::ncct("1"));
    let tools = FakeTools::new();

    ConversionOrchestrator::new(&config, &tools)
        .process_bucket(
            "P1",
            ScanType::Ncct,
            &[ScanBucketEntry {
                path: series,
                thickness: 1.0,
            }],
        )
        .await
        .unwrap();

    let work = config.type_dir(ScanType::Ncct).join("P1-S0001.nii");
    assert_eq!(volume::slice_count(&work).unwrap(), 8);
}

#[tokio::test]
async fn failing_tool_is_reported_and_next_series_continues() {
    let root = tempfile::tempdir().unwrap();
    let config = test_config(root.path());
    let study = study_dir(&config.input, "P1");
    let first = write_series(&study, "S0001", 50, &SliceSpec::ncct("1"));
    let second = write_series(&study, "S0002", 50, &SliceSpec::ncct("0.5"));
    let mut tools = FakeTools::new();
    tools.failing = Some("bet2");

    let entries = [
        ScanBucketEntry {
            path: first,
            thickness: 1.0,
        },
        ScanBucketEntry {
            path: second,
            thickness: 0.5,
        },
    ];
    let summary = ConversionOrchestrator::new(&config, &tools)
        .process_bucket("P1", ScanType::Ncct, &entries)
        .await
        .unwrap();

    assert_eq!(summary.ids_field(), "S0001,S0002");
    assert_eq!(summary.thicknesses_field(), "1->1,0.5->0.5");
    assert_eq!(summary.problems.len(), 2);
    assert_eq!(
        summary.problems[0],
        "S0001: skull stripping failed: bet2 exited with code 1: simulated failure"
    );
    assert!(summary.problems[1].starts_with("S0002: skull stripping failed"));

    // No partial volumes, no scratch directories
    assert_eq!(entries_in(&config.type_dir(ScanType::Ncct)), vec!["metadata"]);
    // Second series was still attempted from the start
    assert_eq!(tools.programs().iter().filter(|p| *p == "dcm2niix").count(), 2);
}

#[tokio::test]
async fn missing_output_stops_the_series() {
    let root = tempfile::tempdir().unwrap();
    let config = test_config(root.path());
    let study = study_dir(&config.input, "P1");
    let series = write_series(&study, "S0001", 50, &SliceSpec::ncct("1"));
    let mut tools = FakeTools::new();
    tools.silent = Some("flirt");

    let summary = ConversionOrchestrator::new(&config, &tools)
        .process_bucket(
            "P1",
            ScanType::Ncct,
            &[ScanBucketEntry {
                path: series,
                thickness: 1.0,
            }],
        )
        .await
        .unwrap();

    assert_eq!(summary.problems.len(), 1);
    assert!(
        summary.problems[0].starts_with("S0001: registration failed: flirt produced no volume"),
        "{}",
        summary.problems[0]
    );
    assert_eq!(tools.programs(), vec!["dcm2niix", "flirt"]);
    assert!(!config.type_dir(ScanType::Ncct).join("P1-S0001.nii").exists());
}

#[tokio::test]
async fn thickness_beyond_every_atlas_is_fatal() {
    let root = tempfile::tempdir().unwrap();
    let config = test_config(root.path());
    let tools = FakeTools::new();

    let result = ConversionOrchestrator::new(&config, &tools)
        .process_bucket(
            "P1",
            ScanType::Ncct,
            &[ScanBucketEntry {
                path: root.path().join("S0001"),
                thickness: 2.5,
            }],
        )
        .await;

    assert!(matches!(result, Err(PipelineError::Invariant { .. })));
    assert!(tools.calls().is_empty());
}

#[tokio::test]
async fn compressed_tool_output_is_inflated_in_place() {
    let root = tempfile::tempdir().unwrap();
    let config = test_config(root.path());
    let study = study_dir(&config.input, "P1");
    let series = write_series(&study, "S0001", 50, &SliceSpec::ncct("1"));
    let mut tools = FakeTools::new();
    tools.compressing = Some("flirt");

    let summary = ConversionOrchestrator::new(&config, &tools)
        .process_bucket(
            "P1",
            ScanType::Ncct,
            &[ScanBucketEntry {
                path: series,
                thickness: 1.0,
            }],
        )
        .await
        .unwrap();

    assert!(summary.problems.is_empty(), "{:?}", summary.problems);
    let work = config.type_dir(ScanType::Ncct).join("P1-S0001.nii");
    let bytes = fs::read(&work).unwrap();
    assert_ne!(bytes[..2], [0x1f, 0x8b], "working volume is still gzipped");
    assert_eq!(volume::slice_count(&work).unwrap(), 12);
    assert_eq!(
        entries_in(&config.type_dir(ScanType::Ncct)),
        vec!["P1-S0001.nii", "metadata"]
    );
}
