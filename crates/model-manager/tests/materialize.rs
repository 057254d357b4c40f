use std::fs;
use std::path::Path;
use std::sync::Arc;

use common::types::InstanceKey;
use model_manager::{BundleMaterializer, EnsembleResolver};

fn tar_bundle(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, content) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, content.as_bytes()).unwrap();
    }
    builder.into_inner().unwrap()
}

fn materializer(root: &Path, owner: &str, model: &str, instance: &str) -> BundleMaterializer {
    BundleMaterializer::new(
        InstanceKey::new(owner, model, instance).unwrap(),
        root,
        Arc::new(EnsembleResolver::new().unwrap()),
    )
}

#[test]
fn single_component_bundle_gets_canonical_layout() {
    let store = tempfile::tempdir().unwrap();
    let bundle = tar_bundle(&[
        ("foo/config.pbtxt", "name: \"foo\"\n"),
        ("foo/1/model.bin", "binary"),
    ]);

    let result = materializer(store.path(), "acme", "cat-detector", "latest")
        .materialize_tar(bundle.as_slice())
        .unwrap();

    let component = store.path().join("acme#cat-detector#foo#latest");
    assert_eq!(fs::read_to_string(component.join("1/model.bin")).unwrap(), "binary");
    let config = fs::read_to_string(component.join("config.pbtxt")).unwrap();
    assert!(config.contains("name: \"acme#cat-detector#foo#latest\""));
    assert!(!config.contains("name: \"foo\""));

    assert_eq!(result.components.len(), 1);
    assert_eq!(result.components[0].canonical_name, "acme#cat-detector#foo#latest");
}

#[test]
fn ensemble_references_are_rewritten() {
    let store = tempfile::tempdir().unwrap();
    let ensemble_config = r#"name: "ensemble"
platform: "ensemble"
ensemble_scheduling {
  step [
    {
      model_name: "pre"
      model_version: -1
      output_map { key: "pre_out" value: "features" }
    },
    {
      model_name: "infer"
      model_version: -1
      input_map { key: "input" value: "features" }
    }
  ]
}
"#;
    let bundle = tar_bundle(&[
        ("pre/config.pbtxt", "name: \"pre\"\nbackend: \"python\"\n"),
        ("pre/1/model.py", "class TritonPythonModel: pass\n"),
        ("infer/config.pbtxt", "name: \"infer\"\nplatform: \"onnxruntime_onnx\"\n"),
        ("infer/1/model.onnx", "onnx"),
        ("ensemble/config.pbtxt", ensemble_config),
        ("ensemble/1/.keep", ""),
    ]);

    let result = materializer(store.path(), "acme", "cat-detector", "latest")
        .materialize_tar(bundle.as_slice())
        .unwrap();

    let resolved = result.ensemble.clone().unwrap();
    assert_eq!(resolved.component, "acme#cat-detector#ensemble#latest");
    assert_eq!(
        resolved.config_path,
        store.path().join("acme#cat-detector#ensemble#latest/config.pbtxt")
    );

    let patched = fs::read_to_string(&resolved.config_path).unwrap();
    assert!(patched.contains("name: \"acme#cat-detector#ensemble#latest\""));
    assert!(patched.contains("model_name: \"acme#cat-detector#pre#latest\""));
    assert!(patched.contains("model_name: \"acme#cat-detector#infer#latest\""));
    assert!(!patched.contains("\"pre\""));
    assert!(!patched.contains("\"infer\""));
    // Tensor names are not component names
    assert!(patched.contains("value: \"features\""));

    assert_eq!(result.components.len(), 3);
    assert!(result
        .components
        .iter()
        .any(|c| c.is_ensemble() && c.original_name == "ensemble"));
}

#[test]
fn same_bundle_for_two_instances_does_not_collide() {
    let store = tempfile::tempdir().unwrap();
    let bundle = tar_bundle(&[("foo/config.pbtxt", "name: \"foo\"\n"), ("foo/1/model.bin", "x")]);

    for instance in ["v1", "v2"] {
        materializer(store.path(), "acme", "cat", instance)
            .materialize_tar(bundle.as_slice())
            .unwrap();
    }

    assert!(store.path().join("acme#cat#foo#v1/1/model.bin").exists());
    assert!(store.path().join("acme#cat#foo#v2/1/model.bin").exists());
}
