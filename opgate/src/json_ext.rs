//! JSON helpers shared by the pipeline and the request handlers.
use bytes::Bytes;
use serde_json::Value;

/// Empty JSON object, the variables of a request that sent none.
pub const EMPTY_OBJECT: &[u8] = b"{}";

/// Whether a raw JSON value is the literal `null`.
pub fn is_literal_null(raw: &[u8]) -> bool {
    raw.trim_ascii() == b"null"
}

/// Whether raw variables carry at least one entry worth sending along.
pub(crate) fn has_variables(raw: &[u8]) -> bool {
    raw.trim_ascii().len() > 2
}

/// Re-serialize a JSON document without insignificant whitespace.
pub fn compact(raw: &[u8]) -> Result<Bytes, serde_json::Error> {
    let value: Value = serde_json::from_slice(raw)?;
    Ok(Bytes::from(serde_json::to_vec(&value)?))
}

/// Merge the top level entries of `right` into `left`, `right` winning on conflicts.
///
/// An empty side yields the other side unchanged.
pub fn merge_right_into_left(left: &[u8], right: &[u8]) -> Result<Bytes, serde_json::Error> {
    if left.trim_ascii().is_empty() {
        return Ok(Bytes::copy_from_slice(right));
    }
    if right.trim_ascii().is_empty() {
        return Ok(Bytes::copy_from_slice(left));
    }
    let left: Value = serde_json::from_slice(left)?;
    let right: Value = serde_json::from_slice(right)?;
    let merged = match (left, right) {
        (Value::Object(mut left), Value::Object(right)) => {
            left.extend(right);
            Value::Object(left)
        }
        (_, right) => right,
    };
    Ok(Bytes::from(serde_json::to_vec(&merged)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_literal_null() {
        assert!(is_literal_null(b"null"));
        assert!(is_literal_null(b" null\n"));
        assert!(!is_literal_null(b"\"null\""));
        assert!(!is_literal_null(b"{}"));
        assert!(!is_literal_null(b""));
    }

    #[test]
    fn compacts_documents() {
        assert_eq!(
            compact(b"{ \"id\" : 1,\n \"name\": \"a b\" }").unwrap(),
            Bytes::from_static(br#"{"id":1,"name":"a b"}"#)
        );
        assert!(compact(b"{").is_err());
    }

    #[test]
    fn right_wins_on_merge() {
        let merged = merge_right_into_left(br#"{"a":1,"b":"x"}"#, br#"{"b":"y","c":true}"#).unwrap();
        assert_eq!(merged, Bytes::from_static(br#"{"a":1,"b":"y","c":true}"#));
    }

    #[test]
    fn merge_with_empty_side() {
        assert_eq!(
            merge_right_into_left(b"", br#"{"a":1}"#).unwrap(),
            Bytes::from_static(br#"{"a":1}"#)
        );
        assert_eq!(
            merge_right_into_left(br#"{"a":1}"#, b"").unwrap(),
            Bytes::from_static(br#"{"a":1}"#)
        );
    }

    #[test]
    fn variables_presence() {
        assert!(!has_variables(b"{}"));
        assert!(!has_variables(b""));
        assert!(has_variables(br#"{"a":1}"#));
    }
}
