//! Node patch synthesis
//!
//! Turns a desired set of labels, annotations or taints plus a snapshot of the
//! live node object into a JSON patch. Patch values are carried pre-marshaled:
//! the producer of a [`PatchOp`] is responsible for handing in valid JSON.

use k8s_openapi::api::core::v1::Taint;
use serde::ser::{Error as _, SerializeStruct};
use serde::{Serialize, Serializer};
use serde_json::value::RawValue;
use std::collections::BTreeMap;
use std::fmt;

/// Path of the node taint list.
pub const TAINTS_PATH: &str = "/spec/taints";

/// JSON patch operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchOperation {
    Add,
    Remove,
    Replace,
}

impl PatchOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatchOperation::Add => "add",
            PatchOperation::Remove => "remove",
            PatchOperation::Replace => "replace",
        }
    }
}

impl fmt::Display for PatchOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single patch operation with a pre-marshaled value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchOp {
    pub op: PatchOperation,
    pub path: String,
    /// Raw JSON, `None` for removals
    pub value: Option<String>,
}

impl PatchOp {
    pub fn add(path: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            op: PatchOperation::Add,
            path: path.into(),
            value: Some(value.into()),
        }
    }

    pub fn replace(path: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            op: PatchOperation::Replace,
            path: path.into(),
            value: Some(value.into()),
        }
    }

    pub fn remove(path: impl Into<String>) -> Self {
        Self {
            op: PatchOperation::Remove,
            path: path.into(),
            value: None,
        }
    }
}

impl Serialize for PatchOp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let fields = if self.value.is_some() { 3 } else { 2 };
        let mut state = serializer.serialize_struct("PatchOp", fields)?;
        state.serialize_field("op", &self.op)?;
        state.serialize_field("path", &self.path)?;
        if let Some(value) = &self.value {
            let raw = RawValue::from_string(value.clone()).map_err(S::Error::custom)?;
            state.serialize_field("value", &raw)?;
        }
        state.end()
    }
}

/// Encode a patch sequence into its wire format.
pub fn encode_patches(patches: &[PatchOp]) -> Result<String, serde_json::Error> {
    serde_json::to_string(patches)
}

/// Metadata map a key/value patch targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataClass {
    Labels,
    Annotations,
}

impl MetadataClass {
    fn as_str(&self) -> &'static str {
        match self {
            MetadataClass::Labels => "labels",
            MetadataClass::Annotations => "annotations",
        }
    }

    /// Path of the whole map.
    pub fn root_path(&self) -> String {
        format!("/metadata/{}", self.as_str())
    }

    /// Path of a single key in the map.
    pub fn key_path(&self, key: &str) -> String {
        format!("/metadata/{}/{}", self.as_str(), escape_pointer(key))
    }
}

/// Escape a key for use as a JSON pointer reference token.
pub fn escape_pointer(key: &str) -> String {
    key.replace('~', "~0").replace('/', "~1")
}

/// Path of the taint at `index`.
pub fn taint_path(index: usize) -> String {
    format!("{}/{}", TAINTS_PATH, index)
}

/// Synthesize label updates. Values are quoted into JSON strings.
pub fn set_labels(
    desired: &BTreeMap<String, String>,
    live: Option<&BTreeMap<String, String>>,
) -> Result<Vec<PatchOp>, serde_json::Error> {
    let mut quoted = BTreeMap::new();
    for (key, value) in desired {
        quoted.insert(key.clone(), serde_json::to_string(value)?);
    }
    Ok(set_keys(MetadataClass::Labels, &quoted, live))
}

/// Synthesize annotation updates. Values must already be marshaled JSON.
pub fn set_annotations(
    desired: &BTreeMap<String, String>,
    live: Option<&BTreeMap<String, String>>,
) -> Vec<PatchOp> {
    set_keys(MetadataClass::Annotations, desired, live)
}

/// Synthesize `add`/`replace` operations for a key/value map.
///
/// When the live object has no map at all the map itself is created first,
/// since the store requires the parent container to exist.
pub fn set_keys(
    class: MetadataClass,
    desired: &BTreeMap<String, String>,
    live: Option<&BTreeMap<String, String>>,
) -> Vec<PatchOp> {
    let mut patches = Vec::with_capacity(desired.len() + 1);
    if desired.is_empty() {
        return patches;
    }

    if live.is_none() {
        patches.push(PatchOp::add(class.root_path(), "{}"));
    }

    for (key, value) in desired {
        let path = class.key_path(key);
        if live.map(|m| m.contains_key(key)).unwrap_or(false) {
            patches.push(PatchOp::replace(path, value.clone()));
        } else {
            patches.push(PatchOp::add(path, value.clone()));
        }
    }

    patches
}

/// Synthesize removals for the keys present in the live map.
pub fn remove_keys<S: AsRef<str>>(
    class: MetadataClass,
    keys: &[S],
    live: Option<&BTreeMap<String, String>>,
) -> Vec<PatchOp> {
    let Some(live) = live else {
        return Vec::new();
    };

    let mut patches = Vec::new();
    let mut removed = std::collections::BTreeSet::new();
    for key in keys {
        let key = key.as_ref();
        if live.contains_key(key) && removed.insert(key) {
            patches.push(PatchOp::remove(class.key_path(key)));
        }
    }
    patches
}

fn same_taint(a: &Taint, b: &Taint) -> bool {
    a.key == b.key && a.value == b.value && a.effect == b.effect
}

/// Find a taint by its key/value/effect identity.
pub fn find_taint_index(taints: &[Taint], taint: &Taint) -> Option<usize> {
    taints.iter().position(|t| same_taint(t, taint))
}

fn marshal_taint(taint: &Taint) -> Result<String, serde_json::Error> {
    // timeAdded is owned by the store
    let stripped = Taint {
        key: taint.key.clone(),
        value: taint.value.clone(),
        effect: taint.effect.clone(),
        time_added: None,
    };
    serde_json::to_string(&stripped)
}

/// Synthesize taint additions and replacements.
///
/// Indices are resolved against a working copy of the live list that is
/// updated after every emitted operation, so the sequence stays valid when
/// the store applies operations one after another.
pub fn set_taints(
    desired: &[Taint],
    live: Option<&[Taint]>,
) -> Result<Vec<PatchOp>, serde_json::Error> {
    let mut patches = Vec::with_capacity(desired.len() + 1);
    if desired.is_empty() {
        return Ok(patches);
    }

    let mut working: Vec<Taint> = match live {
        Some(taints) => taints.to_vec(),
        None => {
            patches.push(PatchOp::add(TAINTS_PATH, "[]"));
            Vec::new()
        }
    };

    for taint in desired {
        let value = marshal_taint(taint)?;
        match find_taint_index(&working, taint) {
            Some(idx) => {
                patches.push(PatchOp::replace(taint_path(idx), value));
                working[idx] = taint.clone();
            }
            None => {
                let idx = working.len();
                patches.push(PatchOp::add(taint_path(idx), value));
                working.push(taint.clone());
            }
        }
    }

    Ok(patches)
}

/// Synthesize removals for the taints present in the live list.
pub fn remove_taints(remove: &[Taint], live: Option<&[Taint]>) -> Vec<PatchOp> {
    let Some(live) = live else {
        return Vec::new();
    };

    let mut working = live.to_vec();
    let mut patches = Vec::new();
    for taint in remove {
        if let Some(idx) = find_taint_index(&working, taint) {
            patches.push(PatchOp::remove(taint_path(idx)));
            working.remove(idx);
        }
    }
    patches
}
