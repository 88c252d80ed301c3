//! Reshaping of resolved responses before they reach the post-resolve hooks and the client.
use bytes::Bytes;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::error::TransformError;

/// Path segment expanding over every element of an array.
const ARRAY_WILDCARD: &str = "[]";

/// A transformation of the resolved response.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum PostResolveTransformation {
    /// Copy the value found at `from` to `to`. A missing source writes `null`.
    Get { from: Vec<String>, to: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PathElement {
    Key(String),
    Index(usize),
}

/// Applies an operation's post-resolve transformations in order.
#[derive(Debug, Clone)]
pub struct PostResolveTransformer {
    transformations: Vec<PostResolveTransformation>,
}

impl PostResolveTransformer {
    pub fn new(transformations: Vec<PostResolveTransformation>) -> Self {
        Self { transformations }
    }

    pub fn transform(&self, input: &[u8]) -> Result<Bytes, TransformError> {
        if self.transformations.is_empty() {
            return Ok(Bytes::copy_from_slice(input));
        }
        let mut value: Value = serde_json::from_slice(input)?;
        for transformation in &self.transformations {
            match transformation {
                PostResolveTransformation::Get { from, to } => apply_get(&mut value, from, to)?,
            }
        }
        Ok(Bytes::from(serde_json::to_vec(&value)?))
    }
}

fn apply_get(value: &mut Value, from: &[String], to: &[String]) -> Result<(), TransformError> {
    // both sides are expanded against the document before anything is written
    let froms = resolve_paths(value, from);
    let tos = resolve_paths(value, to);
    if froms.len() != tos.len() {
        return Err(TransformError::PathMismatch);
    }
    for (from, to) in froms.iter().zip(tos.iter()) {
        let found = get(value, from).cloned().unwrap_or(Value::Null);
        set(value, to, found)?;
    }
    Ok(())
}

fn resolve_paths(value: &Value, path: &[String]) -> Vec<Vec<PathElement>> {
    let mut resolved = Vec::new();
    expand(value, path, Vec::new(), &mut resolved);
    resolved
}

fn expand(
    value: &Value,
    remaining: &[String],
    mut prefix: Vec<PathElement>,
    out: &mut Vec<Vec<PathElement>>,
) {
    let Some(position) = remaining.iter().position(|s| s == ARRAY_WILDCARD) else {
        prefix.extend(remaining.iter().cloned().map(PathElement::Key));
        out.push(prefix);
        return;
    };
    prefix.extend(remaining[..position].iter().cloned().map(PathElement::Key));
    let len = match get(value, &prefix) {
        Some(Value::Array(items)) => items.len(),
        _ => 0,
    };
    for index in 0..len {
        let mut item = prefix.clone();
        item.push(PathElement::Index(index));
        expand(value, &remaining[position + 1..], item, out);
    }
}

fn get<'a>(value: &'a Value, path: &[PathElement]) -> Option<&'a Value> {
    path.iter().try_fold(value, |current, element| match element {
        PathElement::Key(key) => current.as_object()?.get(key),
        PathElement::Index(index) => current.as_array()?.get(*index),
    })
}

fn set(value: &mut Value, path: &[PathElement], new_value: Value) -> Result<(), TransformError> {
    let mut current = value;
    for element in path {
        current = match element {
            PathElement::Key(key) => match current {
                Value::Object(map) => map
                    .entry(key.clone())
                    .or_insert_with(|| Value::Object(Default::default())),
                _ => return Err(TransformError::InvalidTarget(display_path(path))),
            },
            PathElement::Index(index) => match current {
                Value::Array(items) => items
                    .get_mut(*index)
                    .ok_or_else(|| TransformError::InvalidTarget(display_path(path)))?,
                _ => return Err(TransformError::InvalidTarget(display_path(path))),
            },
        };
    }
    *current = new_value;
    Ok(())
}

fn display_path(path: &[PathElement]) -> String {
    path.iter()
        .map(|element| match element {
            PathElement::Key(key) => key.clone(),
            PathElement::Index(index) => format!("[{index}]"),
        })
        .collect::<Vec<_>>()
        .join(".")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get_transformation(from: &[&str], to: &[&str]) -> PostResolveTransformation {
        PostResolveTransformation::Get {
            from: from.iter().map(|s| s.to_string()).collect(),
            to: to.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[track_caller]
    fn assert_transform(input: &str, expected: &str, transformations: Vec<PostResolveTransformation>) {
        let transformer = PostResolveTransformer::new(transformations);
        let output = transformer.transform(input.as_bytes()).unwrap();
        assert_eq!(std::str::from_utf8(&output).unwrap(), expected);
    }

    #[test]
    fn no_transformations_is_identity() {
        assert_transform(r#"{"foo":"bar"}"#, r#"{"foo":"bar"}"#, vec![]);
    }

    #[test]
    fn lifts_scalars_and_objects() {
        let lift = || vec![get_transformation(&["foo", "bar"], &["foo"])];
        assert_transform(r#"{"foo":{"bar":"baz"}}"#, r#"{"foo":"baz"}"#, lift());
        assert_transform(r#"{"foo":{"bar":123}}"#, r#"{"foo":123}"#, lift());
        assert_transform(r#"{"foo":{"bar":true}}"#, r#"{"foo":true}"#, lift());
        assert_transform(r#"{"foo":{"bar":1.23}}"#, r#"{"foo":1.23}"#, lift());
        assert_transform(r#"{"foo":{"bar":"null"}}"#, r#"{"foo":"null"}"#, lift());
        assert_transform(r#"{"foo":{"bar":null}}"#, r#"{"foo":null}"#, lift());
        assert_transform(
            r#"{"foo":{"bar":{"baz":{"foo":"bar"}}}}"#,
            r#"{"foo":{"foo":"bar"}}"#,
            vec![get_transformation(&["foo", "bar", "baz"], &["foo"])],
        );
    }

    #[test]
    fn missing_source_writes_null() {
        assert_transform(
            r#"{"foo":{}}"#,
            r#"{"foo":null}"#,
            vec![get_transformation(&["foo", "bar"], &["foo"])],
        );
    }

    #[test]
    fn expands_arrays() {
        assert_transform(
            r#"{"foos":[{"foo":{"bar":"baz1"}},{"foo":{"bar":"baz2"}},{"foo":{"bar":"baz3"}}]}"#,
            r#"{"foos":[{"foo":"baz1"},{"foo":"baz2"},{"foo":"baz3"}]}"#,
            vec![get_transformation(
                &["foos", "[]", "foo", "bar"],
                &["foos", "[]", "foo"],
            )],
        );
    }

    #[test]
    fn expands_nested_arrays() {
        assert_transform(
            r#"{"foos":[{"foo":{"bar":[{"foo":{"bar":"baz1"}}]}},{"foo":{"bar":[{"foo":{"bar":"baz2"}},{"foo":{"bar":"baz3"}}]}}]}"#,
            r#"{"foos":[{"foo":{"bar":[{"foo":"baz1"}]}},{"foo":{"bar":[{"foo":"baz2"},{"foo":"baz3"}]}}]}"#,
            vec![get_transformation(
                &["foos", "[]", "foo", "bar", "[]", "foo", "bar"],
                &["foos", "[]", "foo", "bar", "[]", "foo"],
            )],
        );
    }

    #[test]
    fn rejects_invalid_json() {
        let transformer =
            PostResolveTransformer::new(vec![get_transformation(&["foo", "bar"], &["foo"])]);
        assert!(matches!(
            transformer.transform(b"{"),
            Err(TransformError::InvalidJson(_))
        ));
    }

    #[test]
    fn rejects_scalar_targets() {
        let transformer =
            PostResolveTransformer::new(vec![get_transformation(&["a"], &["b", "c"])]);
        assert!(matches!(
            transformer.transform(br#"{"a":1,"b":2}"#),
            Err(TransformError::InvalidTarget(_))
        ));
    }

    #[test]
    fn deserializes_from_configuration() {
        let transformation: PostResolveTransformation = serde_json::from_value(serde_json::json!({
            "kind": "get",
            "from": ["foo", "bar"],
            "to": ["foo"]
        }))
        .unwrap();
        assert_eq!(transformation, get_transformation(&["foo", "bar"], &["foo"]));
    }
}
