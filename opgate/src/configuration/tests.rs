use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;

use super::*;
use crate::operation::OperationKind;
use crate::transform::PostResolveTransformation;

#[test]
fn defaults() {
    let configuration = Configuration::from_yaml_str("").unwrap();
    assert_eq!(configuration.hooks.url, None);
    assert_eq!(configuration.hooks.timeout, Duration::from_secs(60));
    assert_eq!(configuration.hooks.retry.max_attempts, 40);
    assert_eq!(configuration.hooks.retry.delay, Duration::from_millis(50));
    assert_eq!(configuration.plan_cache.ttl, Duration::from_secs(3600));
    assert_eq!(configuration.plan_cache.capacity, 1024);
    assert_eq!(
        configuration.streaming.ping_interval(),
        Some(Duration::from_secs(5))
    );
    assert!(configuration.operations.is_empty());
}

#[test]
fn full_yaml_configuration() {
    let configuration = Configuration::from_yaml_str(
        r#"
hooks:
  url: http://localhost:9992
  timeout: 10s
  retry:
    max_attempts: 3
    delay: 100ms
plan_cache:
  ttl: 10m
  capacity: 16
streaming:
  ping_interval: 0s
operations:
  - name: Me
    kind: query
    content: "query Me { me { name } }"
    hooks:
      pre_resolve: true
      mutating_post_resolve: true
    live_query:
      enabled: true
      polling_interval: 2s
    post_resolve_transformations:
      - kind: get
        from: [data, me, name]
        to: [data, name]
  - name: Counter
    kind: subscription
    content: "subscription Counter { counter }"
    authorization_required: true
"#,
    )
    .unwrap();

    assert_eq!(configuration.hooks.url.as_deref(), Some("http://localhost:9992"));
    assert_eq!(configuration.hooks.timeout, Duration::from_secs(10));
    assert_eq!(configuration.hooks.retry.max_attempts, 3);
    assert_eq!(configuration.hooks.retry.delay, Duration::from_millis(100));
    assert_eq!(configuration.plan_cache.ttl, Duration::from_secs(600));
    assert_eq!(configuration.plan_cache.capacity, 16);
    assert_eq!(configuration.streaming.ping_interval(), None);

    let me = &configuration.operations[0];
    assert_eq!(me.kind, OperationKind::Query);
    assert!(me.hooks.pre_resolve);
    assert!(me.hooks.mutating_post_resolve);
    assert!(!me.hooks.mock_resolve);
    assert!(me.live_query.enabled);
    assert_eq!(me.live_query.polling_interval, Duration::from_secs(2));
    assert_eq!(
        me.post_resolve_transformations,
        vec![PostResolveTransformation::Get {
            from: vec!["data".into(), "me".into(), "name".into()],
            to: vec!["data".into(), "name".into()],
        }]
    );

    let counter = &configuration.operations[1];
    assert_eq!(counter.kind, OperationKind::Subscription);
    assert!(counter.authorization_required);
    assert!(!counter.hooks.any_enabled());
    assert!(!counter.live_query.enabled);
}

#[test]
fn unknown_fields_are_rejected() {
    let error = Configuration::from_yaml_str(
        r#"
plan_cache:
  ttl: 1h
  size: 12
"#,
    )
    .unwrap_err();
    assert!(matches!(error, ConfigurationError::DeserializeConfigError(_)));
    assert!(error.to_string().contains("unknown field `size`"));
}

#[test]
fn json_configuration() {
    let configuration = Configuration::from_json_value(json!({
        "hooks": { "url": "http://localhost:9992" },
        "operations": [{
            "name": "SetName",
            "kind": "mutation",
            "content": "mutation SetName($name: String!) { setName(name: $name) }",
            "hooks": { "mutating_pre_resolve": true },
            "variables_schema": {
                "type": "object",
                "properties": { "name": { "type": "string" } }
            }
        }]
    }))
    .unwrap();
    assert_eq!(configuration.operations[0].kind, OperationKind::Mutation);
    assert!(configuration.operations[0].variables_schema.is_some());
}

#[test]
fn hooks_require_a_url() {
    let error = Configuration::from_json_value(json!({
        "operations": [{
            "name": "Me",
            "kind": "query",
            "content": "query Me { me { name } }",
            "hooks": { "post_resolve": true }
        }]
    }))
    .unwrap_err();
    assert_eq!(
        error.to_string(),
        "hooks are enabled but no hook server url is configured: Me"
    );
}

#[test]
fn invalid_configurations() {
    let operation = json!({
        "name": "Me",
        "kind": "query",
        "content": "query Me { me { name } }",
    });

    let error = Configuration::from_json_value(json!({
        "operations": [operation.clone(), operation]
    }))
    .unwrap_err();
    assert_eq!(error.to_string(), "duplicate operation name: Me");

    let error = Configuration::from_json_value(json!({
        "operations": [{
            "name": "Me",
            "kind": "query",
            "content": "query Me { me { name } }",
            "live_query": { "enabled": true, "polling_interval": "0s" }
        }]
    }))
    .unwrap_err();
    assert_eq!(
        error.to_string(),
        "live query polling interval must be greater than zero: Me"
    );

    let error = Configuration::from_json_value(json!({
        "hooks": { "url": "not a url" }
    }))
    .unwrap_err();
    assert!(error.to_string().starts_with("invalid hook server url"));

    let error = Configuration::from_json_value(json!({
        "plan_cache": { "capacity": 0 }
    }))
    .unwrap_err();
    assert_eq!(
        error.to_string(),
        "plan cache capacity must be greater than zero: 0"
    );
}

#[test]
fn schema_generation() {
    let schema = serde_json::to_value(generate_config_schema()).unwrap();
    let properties = schema["properties"].as_object().unwrap();
    let mut sections: Vec<_> = properties.keys().map(String::as_str).collect();
    sections.sort_unstable();
    assert_eq!(sections, vec!["hooks", "operations", "plan_cache", "streaming"]);
    assert_eq!(schema["additionalProperties"], json!(false));
}
