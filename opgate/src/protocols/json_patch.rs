//! JSON Patch documents between two successive payloads of a stream.
use bytes::Bytes;
use serde_json::Value;

/// Creates the patch turning `previous` into `current`, serialized as a JSON array.
///
/// Operations are meant to be applied in order: removals from one array already account for
/// the elements removed before them.
///
/// Returns `None` when both documents are equal.
pub(crate) fn create(previous: &[u8], current: &[u8]) -> Result<Option<Bytes>, serde_json::Error> {
    let previous: Value = serde_json::from_slice(previous)?;
    let current: Value = serde_json::from_slice(current)?;
    let patch = json_patch::diff(&previous, &current);
    if patch.0.is_empty() {
        return Ok(None);
    }
    Ok(Some(Bytes::from(serde_json::to_vec(&patch)?)))
}
