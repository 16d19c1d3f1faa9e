//! CLI integration tests

#[path = "../crates/compiler/tests/common/mod.rs"]
mod common;

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::tempdir;

fn detexport() -> Command {
    Command::cargo_bin("detexport").unwrap()
}

#[test]
fn test_help_lists_subcommands() {
    detexport()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("export"))
        .stdout(predicate::str::contains("info"))
        .stdout(predicate::str::contains("simplify"));
}

#[test]
fn test_export_then_info() {
    let dir = tempdir().unwrap();
    let model = common::write_checkpoint(dir.path(), 2, 1);
    let output = dir.path().join("out.onnx");

    detexport()
        .current_dir(dir.path())
        .arg("export")
        .arg(&model)
        .args(["--imgsz", "64", "--nms", "--simplify", "--max-det", "10", "-o"])
        .arg(&output)
        .assert()
        .success()
        .stdout(predicate::str::contains("boxes"))
        .stdout(predicate::str::contains("[10, 4]"));
    assert!(output.exists());

    detexport()
        .arg("info")
        .arg(&output)
        .assert()
        .success()
        .stdout(predicate::str::contains("opset:     17"))
        .stdout(predicate::str::contains("producer:  detexport"))
        .stdout(predicate::str::contains("NonMaxSuppression"))
        .stdout(predicate::str::contains("images"))
        .stdout(predicate::str::contains("[1, 3, 64, 64]"));
}

#[test]
fn test_export_default_output_beside_checkpoint() {
    let dir = tempdir().unwrap();
    let model = common::write_checkpoint(dir.path(), 2, 2);

    detexport()
        .current_dir(dir.path())
        .args(["-q", "export"])
        .arg(&model)
        .args(["--imgsz", "64", "96"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[1, 3, 64, 96]"));
    assert!(dir.path().join("tiny-det.onnx").exists());
}

#[test]
fn test_export_reads_config_file() {
    let dir = tempdir().unwrap();
    let model = common::write_checkpoint(dir.path(), 2, 3);
    let config = dir.path().join("detexport.toml");
    fs::write(
        &config,
        format!(
            "[export]\nmodel = {:?}\nimgsz = [64, 64]\nnms = true\nmax_det = 7\noutput = {:?}\n",
            model.display().to_string(),
            dir.path().join("from_config.onnx").display().to_string()
        ),
    )
    .unwrap();

    detexport()
        .current_dir(dir.path())
        .args(["export", "--config"])
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("[7, 4]"));
    assert!(dir.path().join("from_config.onnx").exists());
}

#[test]
fn test_no_nms_overrides_config_file() {
    let dir = tempdir().unwrap();
    let model = common::write_checkpoint(dir.path(), 2, 5);
    let config = dir.path().join("detexport.toml");
    fs::write(&config, "[export]\nimgsz = [64, 64]\nnms = true\nsimplify = true\n").unwrap();
    let output = dir.path().join("raw_head.onnx");

    detexport()
        .current_dir(dir.path())
        .arg("export")
        .arg(&model)
        .args(["--no-nms", "--no-simplify", "-o"])
        .arg(&output)
        .assert()
        .success()
        .stdout(predicate::str::contains("output0"))
        .stdout(predicate::str::contains("[1, 6, 84]"))
        .stdout(predicate::str::contains("boxes").not());

    detexport()
        .arg("info")
        .arg(&output)
        .assert()
        .success()
        .stdout(predicate::str::contains("NonMaxSuppression").not())
        .stdout(predicate::str::contains("BatchNormalization"));
}

#[test]
fn test_conflicting_toggles_are_rejected() {
    let dir = tempdir().unwrap();
    detexport()
        .current_dir(dir.path())
        .args(["export", "model.safetensors", "--nms", "--no-nms"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("cannot be used with"));
}

#[test]
fn test_simplify_subcommand_shrinks_graph() {
    let dir = tempdir().unwrap();
    let model = common::write_checkpoint(dir.path(), 2, 4);
    let raw = dir.path().join("raw.onnx");
    let simplified = dir.path().join("sim.onnx");

    detexport()
        .current_dir(dir.path())
        .arg("export")
        .arg(&model)
        .args(["--imgsz", "64", "-o"])
        .arg(&raw)
        .assert()
        .success();

    detexport()
        .arg("simplify")
        .arg(&raw)
        .arg("-o")
        .arg(&simplified)
        .assert()
        .success()
        .stdout(predicate::str::contains("Simplified"));
    assert!(fs::metadata(&simplified).unwrap().len() > 0);
}

#[test]
fn test_missing_model_fails() {
    let dir = tempdir().unwrap();
    detexport()
        .current_dir(dir.path())
        .args(["export", "does-not-exist.safetensors"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Error: Failed to export"));
}

#[test]
fn test_unsupported_module_reports_kind_and_layer() {
    let dir = tempdir().unwrap();
    let mut checkpoint = common::tiny_checkpoint(2, 5);
    checkpoint.architecture.layers[6].module = "SPPELAN".to_string();
    let model = dir.path().join("odd.safetensors");
    checkpoint.save(&model).unwrap();

    detexport()
        .current_dir(dir.path())
        .arg("export")
        .arg(&model)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unsupported operator 'SPPELAN' at model.6"));
    assert!(!dir.path().join("odd.onnx").exists());
}

#[test]
fn test_nms_with_batch_is_rejected() {
    let dir = tempdir().unwrap();
    let model = common::write_checkpoint(dir.path(), 2, 6);
    detexport()
        .current_dir(dir.path())
        .arg("export")
        .arg(&model)
        .args(["--nms", "--batch", "4"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("batch must be 1"));
}
