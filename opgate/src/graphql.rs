//! Types related to GraphQL responses.

use bytes::Bytes;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

/// A [GraphQL error](https://spec.graphql.org/October2021/#sec-Errors)
/// as may be found in the `errors` field of a GraphQL [`Response`].
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct Error {
    /// The error message.
    pub message: String,

    /// If this is a field error, the JSON path to that field in [`Response::data`]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<Value>>,
}

#[buildstructor::buildstructor]
impl Error {
    #[builder(visibility = "pub")]
    fn new(message: String, path: Option<Vec<Value>>) -> Self {
        Self { message, path }
    }
}

/// A GraphQL response as sent to clients when the gateway reports an error itself.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct Response {
    /// The response data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    /// The optional graphql errors encountered.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub errors: Vec<Error>,
}

impl Response {
    /// A response carrying a single error message and no data.
    pub fn from_message(message: impl Into<String>) -> Self {
        Self {
            data: None,
            errors: vec![Error::builder().message(message).build()],
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        // a map of strings and values always serializes
        Bytes::from(serde_json::to_vec(self).unwrap_or_default())
    }
}
