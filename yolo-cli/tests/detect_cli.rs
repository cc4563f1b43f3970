use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::cargo::cargo_bin_cmd;
use image::{ImageBuffer, Rgb};
use serde_json::Value;
use tempfile::tempdir;
use yolo_utils::normalize_path;

const MODEL_REL_PATH: &str = "../models/yolov8n.onnx";

fn write_sample_image(path: &Path) -> Result<(), Box<dyn Error>> {
    let img = ImageBuffer::from_fn(96, 64, |x, y| {
        let r = ((x * 3 + y) % 255) as u8;
        Rgb([r, 128, 255u8.saturating_sub(r)])
    });
    img.save(path)?;
    Ok(())
}

fn stderr_of(output: &std::process::Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

fn ensure_model_path() -> Option<PathBuf> {
    let path = Path::new(MODEL_REL_PATH);
    if !path.exists() {
        eprintln!(
            "skipping test because the detector model is missing at {}",
            path.display()
        );
        return None;
    }
    Some(normalize_path(path).expect("normalize_path should succeed"))
}

#[test]
fn missing_input_fails() {
    let mut cmd = cargo_bin_cmd!("yolo-detect");
    cmd.arg("--input").arg("does/not/exist.png").arg("--no-gpu");
    let output = cmd.output().expect("run yolo-detect");
    assert!(!output.status.success());
    assert!(stderr_of(&output).contains("path does not exist"));
}

#[test]
fn missing_model_fails_with_load_error() -> Result<(), Box<dyn Error>> {
    let work_dir = tempdir()?;
    let image_path = work_dir.path().join("frame.png");
    write_sample_image(&image_path)?;

    let mut cmd = cargo_bin_cmd!("yolo-detect");
    cmd.arg("--input")
        .arg(&image_path)
        .arg("--model")
        .arg(work_dir.path().join("absent.onnx"))
        .arg("--no-gpu");
    let output = cmd.output()?;
    assert!(!output.status.success());
    assert!(stderr_of(&output).contains("failed to load model"));
    Ok(())
}

#[test]
fn out_of_range_threshold_is_rejected() -> Result<(), Box<dyn Error>> {
    let work_dir = tempdir()?;
    let image_path = work_dir.path().join("frame.png");
    write_sample_image(&image_path)?;

    let mut cmd = cargo_bin_cmd!("yolo-detect");
    cmd.arg("--input")
        .arg(&image_path)
        .arg("--confidence")
        .arg("1.5")
        .arg("--no-gpu");
    let output = cmd.output()?;
    assert!(!output.status.success());
    assert!(stderr_of(&output).contains("confidence threshold"));
    Ok(())
}

#[test]
fn malformed_region_is_a_usage_error() {
    let mut cmd = cargo_bin_cmd!("yolo-detect");
    cmd.args(["--input", "x.png", "--region", "1,2,3"]);
    let output = cmd.output().expect("run yolo-detect");
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn detect_writes_json_and_annotations() -> Result<(), Box<dyn Error>> {
    let Some(model) = ensure_model_path() else {
        return Ok(());
    };

    let work_dir = tempdir()?;
    let image_path = work_dir.path().join("sample.png");
    let json_path = work_dir.path().join("out/detections.json");
    let annotate_dir = work_dir.path().join("annotated");
    write_sample_image(&image_path)?;

    let mut cmd = cargo_bin_cmd!("yolo-detect");
    cmd.arg("--input")
        .arg(&image_path)
        .arg("--model")
        .arg(&model)
        .arg("--no-gpu")
        .arg("--json")
        .arg(&json_path)
        .arg("--annotate")
        .arg(&annotate_dir);
    cmd.assert().success();

    let records: Value = serde_json::from_str(&fs::read_to_string(&json_path)?)?;
    let records = records.as_array().expect("JSON array of image records");
    assert_eq!(records.len(), 1);
    assert_eq!(
        records[0]["image"].as_str(),
        Some(image_path.canonicalize()?.display().to_string().as_str())
    );
    assert_eq!(records[0]["width"].as_u64(), Some(96));
    assert!(records[0]["detections"].is_array());
    assert!(records[0]["inference_ms"].as_f64().is_some());
    assert!(annotate_dir.join("sample.png").exists());
    Ok(())
}

#[test]
fn region_mode_runs_against_model() -> Result<(), Box<dyn Error>> {
    let Some(model) = ensure_model_path() else {
        return Ok(());
    };

    let work_dir = tempdir()?;
    let image_path = work_dir.path().join("sample.png");
    write_sample_image(&image_path)?;

    let mut cmd = cargo_bin_cmd!("yolo-detect");
    cmd.arg("--input")
        .arg(&image_path)
        .arg("--model")
        .arg(&model)
        .arg("--no-gpu")
        .args(["--region", "10,10,40,40"]);
    let output = cmd.output()?;
    assert!(output.status.success(), "stderr: {}", stderr_of(&output));

    let records: Value = serde_json::from_slice(&output.stdout)?;
    for detection in records[0]["detections"].as_array().expect("detections") {
        let rect = &detection["rect"];
        assert!(rect["left"].as_f64().unwrap_or(-1.0) >= 10.0);
        assert!(rect["right"].as_f64().unwrap_or(f64::MAX) <= 50.0);
    }
    Ok(())
}
