//! Registered operations and the request parameters that drive their execution.
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use serde_json::value::RawValue;

use crate::configuration::ConfigurationError;
use crate::transform::PostResolveTransformation;
use crate::transform::PostResolveTransformer;

const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_secs(1);

pub(crate) const WG_PREFIX: &str = "wg_";
pub(crate) const WG_VARIABLES: &str = "wg_variables";
pub(crate) const WG_LIVE: &str = "wg_live";
pub(crate) const WG_SSE: &str = "wg_sse";
pub(crate) const WG_SUBSCRIBE_ONCE: &str = "wg_subscribe_once";
pub(crate) const WG_JSON_PATCH: &str = "wg_json_patch";
pub(crate) const WG_DEDUPLICATE: &str = "wg_deduplicate";

/// The kind of a GraphQL operation.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema, strum_macros::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OperationKind {
    Query,
    Mutation,
    Subscription,
}

/// Hook stages enabled for an operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields, default)]
pub struct OperationHooks {
    /// Observational hook called before resolving
    pub pre_resolve: bool,
    /// Hook that may replace the variables used for resolving
    pub mutating_pre_resolve: bool,
    /// Hook whose response replaces resolution entirely
    pub mock_resolve: bool,
    /// Hook that may replace resolution, a `null` response falls through
    pub custom_resolve: bool,
    /// Observational hook called with the resolved response
    pub post_resolve: bool,
    /// Hook that replaces the resolved response
    pub mutating_post_resolve: bool,
}

impl OperationHooks {
    pub fn any_enabled(&self) -> bool {
        self.pre_resolve
            || self.mutating_pre_resolve
            || self.mock_resolve
            || self.custom_resolve
            || self.post_resolve
            || self.mutating_post_resolve
    }
}

/// Live query settings of an operation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields, default)]
pub struct LiveQueryConfig {
    /// Allow clients to request live mode with `wg_live`
    pub enabled: bool,

    /// Interval between two executions; defaults to 1s
    #[serde(
        deserialize_with = "humantime_serde::deserialize",
        serialize_with = "humantime_serde::serialize"
    )]
    #[schemars(with = "String")]
    pub polling_interval: Duration,
}

impl Default for LiveQueryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            polling_interval: DEFAULT_POLLING_INTERVAL,
        }
    }
}

/// A registered operation, exposed at `/operations/<name>`.
///
/// Created from configuration and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Operation {
    /// Endpoint name
    pub name: String,

    /// Operation kind
    pub kind: OperationKind,

    /// GraphQL document of the operation
    pub content: String,

    /// Enabled hook stages
    #[serde(default)]
    pub hooks: OperationHooks,

    /// Live query settings
    #[serde(default)]
    pub live_query: LiveQueryConfig,

    /// JSON schema the request variables must satisfy
    #[serde(default)]
    pub variables_schema: Option<Value>,

    /// Transformations applied to the resolved response
    #[serde(default)]
    pub post_resolve_transformations: Vec<PostResolveTransformation>,

    /// Reject requests without an authenticated user
    #[serde(default)]
    pub authorization_required: bool,
}

#[buildstructor::buildstructor]
impl Operation {
    #[builder(visibility = "pub")]
    #[allow(clippy::too_many_arguments)] // Used through a builder, not directly
    fn new(
        name: String,
        kind: OperationKind,
        content: String,
        hooks: Option<OperationHooks>,
        live_query: Option<LiveQueryConfig>,
        variables_schema: Option<Value>,
        post_resolve_transformations: Vec<PostResolveTransformation>,
        authorization_required: Option<bool>,
    ) -> Self {
        Self {
            name,
            kind,
            content,
            hooks: hooks.unwrap_or_default(),
            live_query: live_query.unwrap_or_default(),
            variables_schema,
            post_resolve_transformations,
            authorization_required: authorization_required.unwrap_or_default(),
        }
    }
}

/// Error body returned when the request variables do not satisfy the operation schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariablesValidationError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<Box<RawValue>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ValidationMessage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationMessage {
    pub message: String,
}

impl fmt::Display for VariablesValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        for error in &self.errors {
            write!(f, "; {}", error.message)?;
        }
        Ok(())
    }
}

impl std::error::Error for VariablesValidationError {}

impl VariablesValidationError {
    fn new(input: Option<Box<RawValue>>, errors: Vec<ValidationMessage>) -> Self {
        Self {
            code: "InputValidationError".to_string(),
            message: "Bad Request: Invalid input".to_string(),
            input,
            errors,
        }
    }
}

/// Validates request variables against an operation's JSON schema.
pub(crate) struct VariablesValidator {
    validator: jsonschema::Validator,
}

impl fmt::Debug for VariablesValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VariablesValidator").finish_non_exhaustive()
    }
}

impl VariablesValidator {
    pub(crate) fn new(schema: &Value) -> Result<Self, String> {
        jsonschema::validator_for(schema)
            .map(|validator| Self { validator })
            .map_err(|e| e.to_string())
    }

    pub(crate) fn validate(&self, variables: &[u8]) -> Result<(), VariablesValidationError> {
        let instance: Value = match serde_json::from_slice(variables) {
            Ok(instance) => instance,
            Err(e) => {
                return Err(VariablesValidationError::new(
                    None,
                    vec![ValidationMessage {
                        message: format!("invalid JSON at column {}: {e}", e.column()),
                    }],
                ));
            }
        };
        let errors: Vec<ValidationMessage> = self
            .validator
            .iter_errors(&instance)
            .map(|e| ValidationMessage {
                message: e.to_string(),
            })
            .collect();
        if errors.is_empty() {
            return Ok(());
        }
        let input = serde_json::from_slice::<Box<RawValue>>(variables).ok();
        Err(VariablesValidationError::new(input, errors))
    }
}

/// An operation with everything derived from its configuration at startup.
#[derive(Debug)]
pub struct RegisteredOperation {
    pub(crate) operation: Arc<Operation>,
    pub(crate) validator: Option<VariablesValidator>,
    pub(crate) transformer: Option<Arc<PostResolveTransformer>>,
    pub(crate) query_params_allow_list: Vec<String>,
}

impl RegisteredOperation {
    pub(crate) fn new(operation: Operation) -> Result<Self, ConfigurationError> {
        let validator = operation
            .variables_schema
            .as_ref()
            .map(VariablesValidator::new)
            .transpose()
            .map_err(|error| ConfigurationError::InvalidConfiguration {
                message: "invalid variables schema",
                error: format!("{}: {error}", operation.name),
            })?;
        let transformer = (!operation.post_resolve_transformations.is_empty()).then(|| {
            Arc::new(PostResolveTransformer::new(
                operation.post_resolve_transformations.clone(),
            ))
        });
        let query_params_allow_list = operation
            .variables_schema
            .as_ref()
            .and_then(|schema| schema.get("properties"))
            .and_then(Value::as_object)
            .map(|properties| properties.keys().cloned().collect())
            .unwrap_or_default();
        Ok(Self {
            operation: Arc::new(operation),
            validator,
            transformer,
            query_params_allow_list,
        })
    }

    pub fn operation(&self) -> &Arc<Operation> {
        &self.operation
    }

    pub(crate) fn validate_variables(
        &self,
        variables: &[u8],
    ) -> Result<(), VariablesValidationError> {
        match &self.validator {
            Some(validator) => validator.validate(variables),
            None => Ok(()),
        }
    }
}

/// Registered operations by name.
#[derive(Debug, Default, Clone)]
pub struct OperationRegistry {
    operations: HashMap<String, Arc<RegisteredOperation>>,
}

impl OperationRegistry {
    pub fn new(operations: Vec<Operation>) -> Result<Self, ConfigurationError> {
        let mut registered = HashMap::with_capacity(operations.len());
        for operation in operations {
            let name = operation.name.clone();
            let operation = RegisteredOperation::new(operation)?;
            if registered.insert(name.clone(), Arc::new(operation)).is_some() {
                return Err(ConfigurationError::InvalidConfiguration {
                    message: "duplicate operation name",
                    error: name,
                });
            }
        }
        Ok(Self {
            operations: registered,
        })
    }

    pub fn get(&self, name: &str) -> Option<Arc<RegisteredOperation>> {
        self.operations.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

/// JSON Patch behavior requested by the client.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PatchMode {
    #[default]
    Disabled,
    /// Send a patch when it is smaller than the full payload
    Enabled,
    /// Always send a patch once a previous payload exists
    Forced,
}

/// The `wg_*` query parameters of a request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestParams {
    pub live: bool,
    pub sse: bool,
    pub subscribe_once: bool,
    pub json_patch: PatchMode,
    pub deduplicate: bool,
}

impl RequestParams {
    pub fn from_query(query: Option<&str>) -> Self {
        let mut params = RequestParams::default();
        for (name, value) in query_pairs(query) {
            match name.as_str() {
                WG_LIVE => params.live = true,
                WG_SSE => params.sse = true,
                WG_SUBSCRIBE_ONCE => params.subscribe_once = true,
                WG_DEDUPLICATE => params.deduplicate = true,
                WG_JSON_PATCH => {
                    params.json_patch = if value == "force" {
                        PatchMode::Forced
                    } else {
                        PatchMode::Enabled
                    }
                }
                _ => {}
            }
        }
        params
    }
}

/// How a request is executed once its operation and parameters are known.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Resolve once and answer with a single JSON document
    OneShot,
    /// Re-run the pipeline on a timer and stream changes
    Live { polling_interval: Duration },
    /// Stream every event of an upstream subscription
    Subscription,
}

impl ExecutionMode {
    pub fn classify(operation: &Operation, params: &RequestParams) -> Self {
        match operation.kind {
            OperationKind::Subscription => ExecutionMode::Subscription,
            OperationKind::Query | OperationKind::Mutation
                if params.live && operation.live_query.enabled =>
            {
                ExecutionMode::Live {
                    polling_interval: operation.live_query.polling_interval,
                }
            }
            OperationKind::Query | OperationKind::Mutation => ExecutionMode::OneShot,
        }
    }
}

/// Builds the variables of a GET request from its query string.
///
/// `wg_variables` carries a JSON document and wins over anything else. Otherwise every
/// allow-listed parameter becomes a variable, as a JSON literal when it parses as one and
/// as a string when it does not.
pub(crate) fn parse_query_variables(query: Option<&str>, allow_list: &[String]) -> Bytes {
    let pairs = query_pairs(query);
    if let Some((_, raw)) = pairs
        .iter()
        .find(|(name, value)| name == WG_VARIABLES && !value.is_empty())
    {
        return Bytes::from(raw.clone());
    }
    variables_from_pairs(pairs, |name| allow_list.iter().any(|allowed| allowed == name))
}

/// Builds the variables of an `application/x-www-form-urlencoded` request body.
///
/// Every field except the `wg_*` ones becomes a variable, converted like query parameters.
pub(crate) fn parse_form_variables(body: &[u8]) -> Bytes {
    variables_from_pairs(urlencoded_pairs(body), |_| true)
}

fn variables_from_pairs(pairs: Vec<(String, String)>, accept: impl Fn(&str) -> bool) -> Bytes {
    let mut variables = serde_json::Map::new();
    for (name, value) in pairs {
        if name.starts_with(WG_PREFIX) || !accept(&name) || variables.contains_key(&name) {
            continue;
        }
        let value = serde_json::from_str::<Value>(&value).unwrap_or(Value::String(value));
        variables.insert(name, value);
    }
    Bytes::from(Value::Object(variables).to_string())
}

fn query_pairs(query: Option<&str>) -> Vec<(String, String)> {
    urlencoded_pairs(query.unwrap_or_default().as_bytes())
}

fn urlencoded_pairs(input: &[u8]) -> Vec<(String, String)> {
    serde_urlencoded::from_bytes(input).unwrap_or_else(|error| {
        tracing::debug!(%error, "could not decode urlencoded pairs");
        Vec::new()
    })
}
