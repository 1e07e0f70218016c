//! Routing decision engine: ordered override evaluation, provider/model
//! prefix parsing, and conditional config-patch application.

use crate::config::{AdapterKind, Config, ConfigPatch, OverrideRule, ProviderConfig, compile_predicate};
use crate::error::{Error, Result};
use hyper::HeaderMap;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// The outcome of routing one request. Borrows from the config snapshot the
/// request captured at entry.
#[derive(Debug)]
pub struct RouteDecision<'c> {
    pub provider_name: String,
    pub adapter: AdapterKind,
    pub effective_model: String,
    pub config_patch: Option<&'c BTreeMap<String, ConfigPatch>>,
    pub provider: &'c ProviderConfig,
}

/// Evaluate override rules in declaration order and resolve the target
/// provider, adapter and effective model for this request.
///
/// Provider precedence: explicit rule provider > `provider/model` prefix
/// (from the rule's model when a rule matched, else the body model) >
/// `anthropic`. An unknown resolved provider fails the request.
pub fn decide<'c>(
    config: &'c Config,
    headers: &HeaderMap,
    body: &Value,
) -> Result<RouteDecision<'c>> {
    let body_model = body
        .get("model")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();

    let mut rule_provider: Option<String> = None;
    let mut rule_model: Option<String> = None;
    let mut config_patch: Option<&BTreeMap<String, ConfigPatch>> = None;

    for (i, rule) in config.overrides.iter().enumerate() {
        if rule_matches(rule, headers, body) {
            debug!(rule = i, "override rule matched");
            rule_provider = rule.provider.clone();
            rule_model = rule.model.clone();
            config_patch = rule.config.as_ref();
            break;
        }
    }

    let mut provider_name = rule_provider;
    let mut model = rule_model;

    if provider_name.is_none() {
        let source = model.clone().unwrap_or_else(|| body_model.clone());
        if let Some((prefix, suffix)) = source.split_once('/') {
            provider_name = Some(prefix.to_ascii_lowercase());
            model = Some(suffix.to_string());
        }
    }

    let provider_name = provider_name.unwrap_or_else(|| "anthropic".to_string());
    let provider = config.providers.get(&provider_name).ok_or_else(|| {
        Error::InvalidRequest(format!("unknown provider '{}'", provider_name))
    })?;

    let effective_model = model.unwrap_or(body_model);

    Ok(RouteDecision {
        provider_name,
        adapter: provider.adapter,
        effective_model,
        config_patch,
        provider,
    })
}

/// Check every present predicate of a rule. Absent predicates match anything;
/// a regex that fails to compile makes its predicate non-matching.
fn rule_matches(rule: &OverrideRule, headers: &HeaderMap, body: &Value) -> bool {
    let when = &rule.when;

    if let Some(pattern) = &when.model_regex {
        let model = body.get("model").and_then(Value::as_str).unwrap_or("");
        if !regex_search(pattern, model) {
            return false;
        }
    }

    if let Some(pattern) = &when.system_regex {
        let system_text = collect_system_text(body);
        if !regex_search(pattern, &system_text) {
            return false;
        }
    }

    if let Some(pattern) = &when.user_regex {
        match last_user_text(body) {
            Some(text) => {
                if !regex_search(pattern, &text) {
                    return false;
                }
            }
            None => return false,
        }
    }

    if let Some(tool_name) = &when.has_tool {
        let has = body
            .get("tools")
            .and_then(Value::as_array)
            .map(|tools| {
                tools
                    .iter()
                    .any(|t| t.get("name").and_then(Value::as_str) == Some(tool_name))
            })
            .unwrap_or(false);
        if !has {
            return false;
        }
    }

    if let Some(expected_headers) = &when.header {
        for (name, expected) in expected_headers {
            let actual = headers.get(name).and_then(|v| v.to_str().ok());
            if actual != Some(expected.as_str()) {
                return false;
            }
        }
    }

    true
}

fn regex_search(pattern: &str, haystack: &str) -> bool {
    match compile_predicate(pattern) {
        Some(regex) => regex.is_match(haystack),
        None => {
            warn!(pattern = %pattern, "predicate regex failed to compile; treating as non-match");
            false
        }
    }
}

/// Concatenate all text content of the top-level `system` field.
fn collect_system_text(body: &Value) -> String {
    match body.get("system") {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(blocks)) => {
            let mut out = String::new();
            for block in blocks {
                match block {
                    Value::String(s) => out.push_str(s),
                    Value::Object(obj) => {
                        if let Some(Value::String(text)) = obj.get("text") {
                            out.push_str(text);
                        }
                    }
                    _ => {}
                }
            }
            out
        }
        _ => String::new(),
    }
}

/// Text content of the last `user`-role message; earlier users are ignored.
fn last_user_text(body: &Value) -> Option<String> {
    let messages = body.get("messages")?.as_array()?;
    let last_user = messages
        .iter()
        .rev()
        .find(|m| m.get("role").and_then(Value::as_str) == Some("user"))?;

    match last_user.get("content") {
        Some(Value::String(text)) => Some(text.clone()),
        Some(Value::Array(blocks)) => {
            let mut parts: Vec<&str> = Vec::new();
            for block in blocks {
                match block {
                    Value::String(s) => parts.push(s),
                    Value::Object(obj) => {
                        if obj.get("type").and_then(Value::as_str) == Some("text")
                            && let Some(Value::String(text)) = obj.get("text")
                        {
                            parts.push(text);
                        }
                    }
                    _ => {}
                }
            }
            Some(parts.join("\n"))
        }
        _ => Some(String::new()),
    }
}

/// Apply a matched rule's config patch to the request body.
///
/// Each leaf is located by its path; its condition (if any) is evaluated
/// against the pre-patch value at that path (missing treated as null), then
/// the value is written, creating intermediate objects as needed. A patch
/// never deletes a field, and leaves within one rule do not observe each
/// other's writes.
pub fn apply_config_patch(body: &mut Value, patch: &BTreeMap<String, ConfigPatch>) {
    let mut writes: Vec<(Vec<String>, Value)> = Vec::new();
    collect_patch_writes(body, patch, &mut Vec::new(), &mut writes);
    for (path, value) in writes {
        write_at_path(body, &path, value);
    }
}

fn collect_patch_writes(
    body: &Value,
    patch: &BTreeMap<String, ConfigPatch>,
    prefix: &mut Vec<String>,
    writes: &mut Vec<(Vec<String>, Value)>,
) {
    for (key, node) in patch {
        prefix.push(key.clone());
        match node {
            ConfigPatch::Nested(children) => {
                collect_patch_writes(body, children, prefix, writes);
            }
            ConfigPatch::Conditional { value, when } => {
                let current = read_at_path(body, prefix).unwrap_or(&Value::Null);
                if when.holds(current) {
                    writes.push((prefix.clone(), value.clone()));
                }
            }
            ConfigPatch::Value(value) => {
                writes.push((prefix.clone(), value.clone()));
            }
        }
        prefix.pop();
    }
}

fn read_at_path<'v>(body: &'v Value, path: &[String]) -> Option<&'v Value> {
    let mut current = body;
    for segment in path {
        current = current.get(segment)?;
    }
    Some(current)
}

fn write_at_path(body: &mut Value, path: &[String], value: Value) {
    let mut current = body;
    for (i, segment) in path.iter().enumerate() {
        let is_leaf = i == path.len() - 1;
        let Some(obj) = current.as_object_mut() else {
            warn!(path = %path.join("."), "config patch path traverses a non-object; leaf skipped");
            return;
        };
        if is_leaf {
            obj.insert(segment.clone(), value);
            return;
        }
        current = obj
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
    }
}

/// Map `thinking.budget_tokens` to a reasoning effort level using the
/// configured thresholds. Absent or zero budget yields the configured
/// default effort.
pub fn reasoning_effort(config: &Config, body: &Value) -> String {
    let budget = body
        .get("thinking")
        .and_then(|t| t.get("budget_tokens"))
        .and_then(Value::as_u64)
        .unwrap_or(0);

    if budget == 0 {
        return config.openai.reasoning_effort_default.clone();
    }

    let thresholds = &config.openai.reasoning_thresholds;
    if budget <= thresholds.low_max {
        "low".to_string()
    } else if budget <= thresholds.medium_max {
        "medium".to_string()
    } else {
        "high".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::Path;

    fn test_config(yaml: &str) -> Config {
        Config::parse(yaml, Path::new("test.yaml")).unwrap()
    }

    fn base_config() -> Config {
        test_config(
            r#"
providers:
  anthropic:
    base_url: https://api.anthropic.com
    adapter: anthropic-passthrough
  openai:
    base_url: https://api.openai.com/v1
    adapter: openai
  local:
    base_url: http://localhost:8000/v1
    adapter: openai-compatible
"#,
        )
    }

    #[test]
    fn test_default_passthrough() {
        let config = base_config();
        let body = json!({"model": "claude-3-sonnet", "messages": []});
        let decision = decide(&config, &HeaderMap::new(), &body).unwrap();
        assert_eq!(decision.provider_name, "anthropic");
        assert_eq!(decision.adapter, AdapterKind::AnthropicPassthrough);
        assert_eq!(decision.effective_model, "claude-3-sonnet");
        assert!(decision.config_patch.is_none());
    }

    #[test]
    fn test_provider_prefix_routing() {
        let config = base_config();
        let body = json!({"model": "openai/gpt-5", "messages": []});
        let decision = decide(&config, &HeaderMap::new(), &body).unwrap();
        assert_eq!(decision.provider_name, "openai");
        assert_eq!(decision.adapter, AdapterKind::Openai);
        assert_eq!(decision.effective_model, "gpt-5");
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let config = base_config();
        let body = json!({"model": "mistral/large", "messages": []});
        let err = decide(&config, &HeaderMap::new(), &body).unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[test]
    fn test_model_regex_override() {
        let mut config = base_config();
        config.overrides = test_config(
            r#"
overrides:
  - when:
      model_regex: "HAIKU"
    provider: local
    model: qwen-3
"#,
        )
        .overrides;

        let body = json!({"model": "claude-3-haiku-20240307", "messages": []});
        let decision = decide(&config, &HeaderMap::new(), &body).unwrap();
        assert_eq!(decision.provider_name, "local");
        assert_eq!(decision.effective_model, "qwen-3");
        assert_eq!(decision.adapter, AdapterKind::OpenaiCompatible);
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let mut config = base_config();
        config.overrides = test_config(
            r#"
overrides:
  - when:
      model_regex: "haiku"
    provider: local
    model: first
  - when:
      model_regex: "haiku"
    provider: openai
    model: second
"#,
        )
        .overrides;

        let body = json!({"model": "claude-haiku", "messages": []});
        let decision = decide(&config, &HeaderMap::new(), &body).unwrap();
        assert_eq!(decision.effective_model, "first");
    }

    #[test]
    fn test_rule_without_provider_parses_rule_model_prefix() {
        let mut config = base_config();
        config.overrides = test_config(
            r#"
overrides:
  - when:
      model_regex: "opus"
    model: openai/gpt-5
"#,
        )
        .overrides;

        let body = json!({"model": "claude-opus-4", "messages": []});
        let decision = decide(&config, &HeaderMap::new(), &body).unwrap();
        assert_eq!(decision.provider_name, "openai");
        assert_eq!(decision.effective_model, "gpt-5");
    }

    #[test]
    fn test_header_predicate() {
        let mut config = base_config();
        config.overrides = test_config(
            r#"
overrides:
  - when:
      header:
        X-Route-Hint: fast
    provider: local
    model: qwen-3
"#,
        )
        .overrides;

        let body = json!({"model": "claude-3", "messages": []});

        let mut headers = HeaderMap::new();
        headers.insert("x-route-hint", "fast".parse().unwrap());
        let decision = decide(&config, &headers, &body).unwrap();
        assert_eq!(decision.provider_name, "local");

        // Value comparison is case-sensitive
        let mut headers = HeaderMap::new();
        headers.insert("x-route-hint", "FAST".parse().unwrap());
        let decision = decide(&config, &headers, &body).unwrap();
        assert_eq!(decision.provider_name, "anthropic");
    }

    #[test]
    fn test_has_tool_predicate_case_sensitive() {
        let mut config = base_config();
        config.overrides = test_config(
            r#"
overrides:
  - when:
      has_tool: Bash
    provider: openai
    model: gpt-5
"#,
        )
        .overrides;

        let matching = json!({"model": "m", "tools": [{"name": "Bash"}], "messages": []});
        let decision = decide(&config, &HeaderMap::new(), &matching).unwrap();
        assert_eq!(decision.provider_name, "openai");

        let wrong_case = json!({"model": "m", "tools": [{"name": "bash"}], "messages": []});
        let decision = decide(&config, &HeaderMap::new(), &wrong_case).unwrap();
        assert_eq!(decision.provider_name, "anthropic");
    }

    #[test]
    fn test_user_regex_last_user_only() {
        let mut config = base_config();
        config.overrides = test_config(
            r#"
overrides:
  - when:
      user_regex: "deploy"
    provider: openai
    model: gpt-5
"#,
        )
        .overrides;

        // "deploy" appears only in an earlier user message: no match.
        let body = json!({
            "model": "m",
            "messages": [
                {"role": "user", "content": "please deploy the app"},
                {"role": "assistant", "content": "done"},
                {"role": "user", "content": [{"type": "text", "text": "thanks"}]}
            ]
        });
        let decision = decide(&config, &HeaderMap::new(), &body).unwrap();
        assert_eq!(decision.provider_name, "anthropic");

        let body = json!({
            "model": "m",
            "messages": [
                {"role": "user", "content": "hello"},
                {"role": "assistant", "content": "hi"},
                {"role": "user", "content": [{"type": "text", "text": "now deploy it"}]}
            ]
        });
        let decision = decide(&config, &HeaderMap::new(), &body).unwrap();
        assert_eq!(decision.provider_name, "openai");
    }

    #[test]
    fn test_system_regex_concatenation() {
        let mut config = base_config();
        config.overrides = test_config(
            r#"
overrides:
  - when:
      system_regex: "SPECIAL AGENT"
    provider: openai
    model: gpt-5
"#,
        )
        .overrides;

        let body = json!({
            "model": "m",
            "system": [
                {"type": "text", "text": "You are a special "},
                {"type": "text", "text": "agent."}
            ],
            "messages": []
        });
        let decision = decide(&config, &HeaderMap::new(), &body).unwrap();
        assert_eq!(decision.provider_name, "openai");
    }

    #[test]
    fn test_invalid_predicate_regex_never_matches() {
        let mut config = base_config();
        config.overrides = test_config(
            r#"
overrides:
  - when:
      model_regex: "(unclosed"
    provider: openai
    model: gpt-5
"#,
        )
        .overrides;

        let body = json!({"model": "(unclosed", "messages": []});
        let decision = decide(&config, &HeaderMap::new(), &body).unwrap();
        // Bad regex makes the predicate non-matching, request still routed.
        assert_eq!(decision.provider_name, "anthropic");
    }

    #[test]
    fn test_conditional_patch_applies_when_absent() {
        let rule_config = test_config(
            r#"
overrides:
  - when: {}
    model: m
    config:
      reasoning:
        effort:
          value: medium
          when:
            current_in: [null, low, minimal]
"#,
        );
        let patch = rule_config.overrides[0].config.as_ref().unwrap();

        let mut body = json!({"model": "m"});
        apply_config_patch(&mut body, patch);
        assert_eq!(body["reasoning"]["effort"], "medium");

        let mut body = json!({"model": "m", "reasoning": {"effort": "high"}});
        apply_config_patch(&mut body, patch);
        assert_eq!(body["reasoning"]["effort"], "high");
    }

    #[test]
    fn test_bare_patch_always_applies() {
        let rule_config = test_config(
            r#"
overrides:
  - when: {}
    model: m
    config:
      temperature: 0.2
"#,
        );
        let patch = rule_config.overrides[0].config.as_ref().unwrap();

        let mut body = json!({"model": "m", "temperature": 0.9});
        apply_config_patch(&mut body, patch);
        assert_eq!(body["temperature"], 0.2);
    }

    #[test]
    fn test_patch_conditions_see_pre_patch_state() {
        // Two leaves in one rule: the condition on `b` reads the original
        // value of `b`, not anything written by `a`.
        let rule_config = test_config(
            r#"
overrides:
  - when: {}
    model: m
    config:
      a: 1
      b:
        value: 2
        when:
          current_equals: null
"#,
        );
        let patch = rule_config.overrides[0].config.as_ref().unwrap();
        let mut body = json!({"model": "m"});
        apply_config_patch(&mut body, patch);
        assert_eq!(body["a"], 1);
        assert_eq!(body["b"], 2);
    }

    #[test]
    fn test_patch_skips_non_object_path() {
        let rule_config = test_config(
            r#"
overrides:
  - when: {}
    model: m
    config:
      reasoning:
        effort: high
"#,
        );
        let patch = rule_config.overrides[0].config.as_ref().unwrap();
        let mut body = json!({"model": "m", "reasoning": "off"});
        apply_config_patch(&mut body, patch);
        // The string is left in place rather than being retyped.
        assert_eq!(body["reasoning"], "off");
    }

    #[test]
    fn test_reasoning_effort_thresholds() {
        let config = base_config();

        let body = json!({"model": "m"});
        assert_eq!(reasoning_effort(&config, &body), "minimal");

        let body = json!({"model": "m", "thinking": {"type": "enabled", "budget_tokens": 0}});
        assert_eq!(reasoning_effort(&config, &body), "minimal");

        let body = json!({"model": "m", "thinking": {"type": "enabled", "budget_tokens": 3000}});
        assert_eq!(reasoning_effort(&config, &body), "low");

        let body = json!({"model": "m", "thinking": {"type": "enabled", "budget_tokens": 9000}});
        assert_eq!(reasoning_effort(&config, &body), "medium");

        let body = json!({"model": "m", "thinking": {"type": "enabled", "budget_tokens": 50000}});
        assert_eq!(reasoning_effort(&config, &body), "high");
    }

    #[test]
    fn test_decide_is_deterministic() {
        let mut config = base_config();
        config.overrides = test_config(
            r#"
overrides:
  - when:
      model_regex: "haiku"
    provider: local
    model: qwen-3
"#,
        )
        .overrides;
        let body = json!({"model": "claude-haiku", "messages": []});
        let a = decide(&config, &HeaderMap::new(), &body).unwrap();
        let b = decide(&config, &HeaderMap::new(), &body).unwrap();
        assert_eq!(a.provider_name, b.provider_name);
        assert_eq!(a.effective_model, b.effective_model);
        assert_eq!(a.adapter, b.adapter);
    }
}
