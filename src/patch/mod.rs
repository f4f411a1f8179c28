//! JSON Patch synthesis for the CPU features field
//!
//! This is not a general JSON diff. The only field the webhook ever changes
//! is `spec.template.spec.domain.cpu.features`, so the synthesizer looks at
//! that one path and emits exactly one `add` or `replace` operation. Any
//! other difference between the two documents is ignored.

use json_patch::jsonptr::PointerBuf;
use json_patch::{AddOperation, Patch, PatchOperation, ReplaceOperation};
use serde_json::{Map, Value};
use thiserror::Error;

/// Path segments from the document root down to the `cpu` object
const CPU_PATH: [&str; 5] = ["spec", "template", "spec", "domain", "cpu"];

/// Key of the feature list inside `cpu`
const FEATURES_KEY: &str = "features";

/// Errors raised while building a patch
#[derive(Debug, Error)]
pub enum PatchError {
    /// One of the input documents is not valid JSON
    #[error("malformed {which} document: {source}")]
    MalformedDocument {
        /// `original` or `mutated`
        which: &'static str,
        /// Parser error
        #[source]
        source: serde_json::Error,
    },

    /// A document or the patch could not be serialized
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Diff two serialized documents into JSON Patch bytes
///
/// Returns `Ok(None)` when the documents are identical or the mutated
/// document lacks the features path. Callers must then omit the patch
/// entirely rather than send an empty array.
pub fn diff(original: &[u8], mutated: &[u8]) -> Result<Option<Vec<u8>>, PatchError> {
    diff_documents(original, mutated)?
        .map(|patch| serde_json::to_vec(&patch))
        .transpose()
        .map_err(PatchError::Serialize)
}

/// Diff two serialized documents into a typed patch
pub fn diff_documents(original: &[u8], mutated: &[u8]) -> Result<Option<Patch>, PatchError> {
    let original: Value = parse(original, "original")?;
    let mutated: Value = parse(mutated, "mutated")?;
    Ok(diff_values(&original, &mutated))
}

/// Diff two parsed documents
pub fn diff_values(original: &Value, mutated: &Value) -> Option<Patch> {
    if original == mutated {
        return None;
    }

    // Cannot happen after a successful mutation; kept so a malformed input
    // yields no patch rather than a patch with a bogus value.
    let mutated_cpu = object_at(mutated, &CPU_PATH)?;
    let mutated_features = mutated_cpu.get(FEATURES_KEY).filter(|v| !v.is_null())?;

    let operation = match object_at(original, &CPU_PATH) {
        None => PatchOperation::Add(AddOperation {
            path: PointerBuf::from_tokens(CPU_PATH),
            value: Value::Object(mutated_cpu.clone()),
        }),
        Some(cpu) if cpu.get(FEATURES_KEY).map_or(true, Value::is_null) => {
            PatchOperation::Add(AddOperation {
                path: features_pointer(),
                value: mutated_features.clone(),
            })
        }
        Some(_) => PatchOperation::Replace(ReplaceOperation {
            path: features_pointer(),
            value: mutated_features.clone(),
        }),
    };

    Some(Patch(vec![operation]))
}

fn parse(bytes: &[u8], which: &'static str) -> Result<Value, PatchError> {
    serde_json::from_slice(bytes).map_err(|source| PatchError::MalformedDocument { which, source })
}

fn features_pointer() -> PointerBuf {
    PointerBuf::from_tokens(CPU_PATH.iter().copied().chain([FEATURES_KEY]))
}

/// Walk `path` through nested objects; `None` if a segment is missing or
/// is not an object
fn object_at<'a>(doc: &'a Value, path: &[&str]) -> Option<&'a Map<String, Value>> {
    path.iter()
        .try_fold(doc, |node, segment| node.as_object()?.get(*segment))?
        .as_object()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bytes(value: &Value) -> Vec<u8> {
        serde_json::to_vec(value).unwrap()
    }

    fn single_op(patch: Option<Vec<u8>>) -> Value {
        let patch: Value = serde_json::from_slice(&patch.expect("expected a patch")).unwrap();
        let ops = patch.as_array().expect("patch should be a JSON array");
        assert_eq!(ops.len(), 1, "exactly one operation is emitted");
        ops[0].clone()
    }

    fn vm(domain: Value) -> Value {
        json!({
            "apiVersion": "kubevirt.io/v1",
            "kind": "VirtualMachine",
            "metadata": {"name": "vm-test-123", "namespace": "test-namespace"},
            "spec": {"template": {"spec": {"domain": domain}}}
        })
    }

    // =========================================================================
    // Malformed Input
    // =========================================================================

    #[test]
    fn invalid_original_json_is_an_error() {
        let err = diff(b"{invalid", b"{}").unwrap_err();
        assert!(matches!(
            err,
            PatchError::MalformedDocument {
                which: "original",
                ..
            }
        ));
    }

    #[test]
    fn invalid_mutated_json_is_an_error() {
        let err = diff(b"{}", b"{invalid").unwrap_err();
        assert!(matches!(
            err,
            PatchError::MalformedDocument {
                which: "mutated",
                ..
            }
        ));
    }

    #[test]
    fn both_invalid_is_an_error() {
        assert!(diff(b"{invalid", b"{invalid").is_err());
    }

    // =========================================================================
    // No-Change Cases
    // =========================================================================

    #[test]
    fn identical_documents_yield_no_patch() {
        let doc = bytes(&json!({"spec": {}}));
        assert!(diff(&doc, &doc).unwrap().is_none());
    }

    #[test]
    fn key_order_does_not_count_as_a_change() {
        let a = br#"{"a":1,"spec":{"x":true}}"#;
        let b = br#"{"spec":{"x":true},"a":1}"#;
        assert!(diff(a, b).unwrap().is_none());
    }

    #[test]
    fn missing_or_malformed_path_in_mutated_yields_no_patch() {
        let cases = [
            r#"{"spec":"invalid"}"#,
            r#"{"spec":{"template":"invalid"}}"#,
            r#"{"spec":{"template":{"spec":"invalid"}}}"#,
            r#"{"spec":{"template":{"spec":{"domain":"invalid"}}}}"#,
            r#"{"spec":{"template":{"spec":{"domain":{"cpu":"invalid"}}}}}"#,
            r#"{"spec":{"template":{"spec":{"domain":{"cpu":{}}}}}}"#,
        ];
        for mutated in cases {
            let result = diff(b"{}", mutated.as_bytes()).unwrap();
            assert!(result.is_none(), "expected no patch for {}", mutated);
        }
    }

    #[test]
    fn differences_outside_the_watched_path_are_ignored() {
        let original = vm(json!({"cpu": {"features": [{"name": "vmx", "policy": "require"}]}}));
        let mut mutated = original.clone();
        mutated["metadata"]["labels"] = json!({"team": "infra"});

        let op = single_op(diff(&bytes(&original), &bytes(&mutated)).unwrap());
        // The label change is not represented; only the features field is.
        assert_eq!(op["path"], "/spec/template/spec/domain/cpu/features");
        assert_eq!(op["value"], json!([{"name": "vmx", "policy": "require"}]));
    }

    // =========================================================================
    // Operation Selection
    // =========================================================================

    #[test]
    fn story_original_without_cpu_adds_whole_cpu() {
        let original = vm(json!({"devices": {}}));
        let mutated = vm(json!({
            "devices": {},
            "cpu": {"features": [{"name": "vmx", "policy": "require"}]}
        }));

        let op = single_op(diff(&bytes(&original), &bytes(&mutated)).unwrap());
        assert_eq!(op["op"], "add");
        assert_eq!(op["path"], "/spec/template/spec/domain/cpu");
        assert_eq!(
            op["value"],
            json!({"features": [{"name": "vmx", "policy": "require"}]})
        );
    }

    #[test]
    fn story_original_without_template_adds_whole_cpu() {
        let original = json!({"metadata": {"name": "vm-1"}, "spec": {}});
        let mutated = vm(json!({"cpu": {"features": [{"name": "svm", "policy": "require"}]}}));

        let op = single_op(diff(&bytes(&original), &bytes(&mutated)).unwrap());
        assert_eq!(op["op"], "add");
        assert_eq!(op["path"], "/spec/template/spec/domain/cpu");
    }

    #[test]
    fn story_original_cpu_without_features_adds_features() {
        let original = vm(json!({"cpu": {"cores": 2}}));
        let mutated = vm(json!({
            "cpu": {"cores": 2, "features": [{"name": "vmx", "policy": "require"}]}
        }));

        let op = single_op(diff(&bytes(&original), &bytes(&mutated)).unwrap());
        assert_eq!(op["op"], "add");
        assert_eq!(op["path"], "/spec/template/spec/domain/cpu/features");
        assert_eq!(op["value"], json!([{"name": "vmx", "policy": "require"}]));
    }

    #[test]
    fn null_features_in_original_counts_as_absent() {
        let original = vm(json!({"cpu": {"features": null}}));
        let mutated = vm(json!({"cpu": {"features": [{"name": "vmx", "policy": "require"}]}}));

        let op = single_op(diff(&bytes(&original), &bytes(&mutated)).unwrap());
        assert_eq!(op["op"], "add");
        assert_eq!(op["path"], "/spec/template/spec/domain/cpu/features");
    }

    #[test]
    fn story_original_with_features_replaces_features() {
        let original = vm(json!({"cpu": {"features": [{"name": "pcid", "policy": "require"}]}}));
        let mutated = vm(json!({
            "cpu": {"features": [
                {"name": "pcid", "policy": "require"},
                {"name": "vmx", "policy": "require"}
            ]}
        }));

        let op = single_op(diff(&bytes(&original), &bytes(&mutated)).unwrap());
        assert_eq!(op["op"], "replace");
        assert_eq!(op["path"], "/spec/template/spec/domain/cpu/features");
        assert_eq!(op["value"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn typed_patch_matches_serialized_patch() {
        let original = vm(json!({}));
        let mutated = vm(json!({"cpu": {"features": [{"name": "vmx", "policy": "require"}]}}));

        let patch = diff_documents(&bytes(&original), &bytes(&mutated))
            .unwrap()
            .unwrap();
        assert_eq!(patch.0.len(), 1);
        match &patch.0[0] {
            PatchOperation::Add(add) => {
                assert_eq!(add.path, PointerBuf::from_tokens(CPU_PATH));
            }
            other => panic!("expected add operation, got {:?}", other),
        }

        let serialized = serde_json::to_vec(&patch).unwrap();
        assert_eq!(
            diff(&bytes(&original), &bytes(&mutated)).unwrap(),
            Some(serialized)
        );
    }

    #[test]
    fn emitted_patch_applies_cleanly_to_original() {
        let mut original = vm(json!({"cpu": {"cores": 4}}));
        let mutated = vm(json!({
            "cpu": {"cores": 4, "features": [{"name": "vmx", "policy": "require"}]}
        }));

        let patch = diff_values(&original, &mutated).unwrap();
        json_patch::patch(&mut original, &patch.0).unwrap();
        assert_eq!(original, mutated);
    }
}
