//! Flow and tool definitions, and the library that loads them
//!
//! Steps are a closed set of seven types. Definitions are checked for unknown
//! step types and malformed branches when they are loaded, so the executor
//! only ever sees well-formed steps.

use anyhow::{Context, Result};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value as JsonValue};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

use crate::transaction::{is_financial, RetryConfig};
use crate::types::CallType;

/* ===================== Error Types ===================== */

#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("flow '{flow}' uses unknown step type '{step_type}'")]
    UnknownStepType { flow: String, step_type: String },

    #[error("flow '{flow}' is malformed: {message}")]
    Malformed { flow: String, message: String },

    #[error("duplicate {kind} '{name}'")]
    Duplicate { kind: &'static str, name: String },
}

/* ===================== Step Types ===================== */

pub const STEP_TYPES: &[&str] = &["SAY", "SAY-GET", "SET", "SWITCH", "CASE", "CALL-TOOL", "FLOW"];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum FlowStep {
    #[serde(rename = "SAY")]
    Say(SayStep),
    #[serde(rename = "SAY-GET")]
    SayGet(SayGetStep),
    #[serde(rename = "SET")]
    Set(SetStep),
    #[serde(rename = "SWITCH")]
    Switch(SwitchStep),
    #[serde(rename = "CASE")]
    Case(CaseStep),
    #[serde(rename = "CALL-TOOL")]
    CallTool(CallToolStep),
    #[serde(rename = "FLOW")]
    Flow(FlowCallStep),
}

impl FlowStep {
    pub fn id(&self) -> &str {
        match self {
            FlowStep::Say(s) => &s.id,
            FlowStep::SayGet(s) => &s.id,
            FlowStep::Set(s) => &s.id,
            FlowStep::Switch(s) => &s.id,
            FlowStep::Case(s) => &s.id,
            FlowStep::CallTool(s) => &s.id,
            FlowStep::Flow(s) => &s.id,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            FlowStep::Say(_) => "SAY",
            FlowStep::SayGet(_) => "SAY-GET",
            FlowStep::Set(_) => "SET",
            FlowStep::Switch(_) => "SWITCH",
            FlowStep::Case(_) => "CASE",
            FlowStep::CallTool(_) => "CALL-TOOL",
            FlowStep::Flow(_) => "FLOW",
        }
    }
}

/// Message text with optional `value_<lang>` / `prompt_<lang>` variants
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SayStep {
    #[serde(default)]
    pub id: String,
    #[serde(alias = "prompt")]
    pub value: String,
    #[serde(flatten)]
    pub localized: BTreeMap<String, JsonValue>,
}

impl SayStep {
    pub fn new(id: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            value: value.into(),
            localized: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SayGetStep {
    #[serde(default)]
    pub id: String,
    #[serde(alias = "prompt")]
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variable: Option<String>,
    #[serde(flatten)]
    pub localized: BTreeMap<String, JsonValue>,
}

/// Pick the message for `language`, falling back to the base text
pub fn localized_text<'a>(
    base: &'a str,
    localized: &'a BTreeMap<String, JsonValue>,
    language: &str,
) -> &'a str {
    for prefix in ["value", "prompt"] {
        if let Some(JsonValue::String(text)) = localized.get(&format!("{}_{}", prefix, language)) {
            return text;
        }
    }
    base
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SetStep {
    #[serde(default)]
    pub id: String,
    pub variable: String,
    pub value: JsonValue,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Branch {
    pub key: String,
    pub step: FlowStep,
}

/// Exact-match dispatch on a variable's value
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SwitchStep {
    #[serde(default)]
    pub id: String,
    pub variable: String,
    #[serde(with = "switch_branches")]
    pub branches: Vec<Branch>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaseGuard {
    Condition(String),
    Default,
}

impl CaseGuard {
    fn parse(key: &str) -> Option<Self> {
        if key == "default" {
            return Some(CaseGuard::Default);
        }
        key.strip_prefix("condition:")
            .map(|expr| CaseGuard::Condition(expr.trim().to_string()))
    }
}

impl fmt::Display for CaseGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaseGuard::Condition(expr) => write!(f, "condition: {}", expr),
            CaseGuard::Default => f.write_str("default"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaseBranch {
    pub guard: CaseGuard,
    pub step: FlowStep,
}

/// Ordered conditional dispatch; the first true condition wins
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CaseStep {
    #[serde(default)]
    pub id: String,
    #[serde(with = "case_branches")]
    pub branches: Vec<CaseBranch>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CallToolStep {
    #[serde(default)]
    pub id: String,
    pub tool: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variable: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_fail: Option<Box<FlowStep>>,
    /// Retries already spent on this step; maintained by the executor
    #[serde(default)]
    pub retry_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FlowCallStep {
    #[serde(default)]
    pub id: String,
    #[serde(alias = "value")]
    pub flow: String,
    #[serde(default)]
    pub call_type: CallType,
}

/* ===================== Branch Maps ===================== */

/// Visits a JSON object keeping its entry order
struct OrderedBranches;

impl<'de> Visitor<'de> for OrderedBranches {
    type Value = Vec<(String, FlowStep)>;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a map of branch keys to single steps")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
        let mut entries = Vec::new();
        while let Some(entry) = access.next_entry::<String, FlowStep>()? {
            entries.push(entry);
        }
        Ok(entries)
    }
}

mod switch_branches {
    use super::*;

    pub fn serialize<S: Serializer>(branches: &[Branch], serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(branches.len()))?;
        for branch in branches {
            map.serialize_entry(&branch.key, &branch.step)?;
        }
        map.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Branch>, D::Error> {
        let entries = deserializer.deserialize_map(OrderedBranches)?;
        Ok(entries
            .into_iter()
            .map(|(key, step)| Branch { key, step })
            .collect())
    }
}

mod case_branches {
    use super::*;
    use serde::de::Error;

    pub fn serialize<S: Serializer>(
        branches: &[CaseBranch],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(branches.len()))?;
        for branch in branches {
            map.serialize_entry(&branch.guard.to_string(), &branch.step)?;
        }
        map.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<CaseBranch>, D::Error> {
        deserializer
            .deserialize_map(OrderedBranches)?
            .into_iter()
            .map(|(key, step)| {
                let guard = CaseGuard::parse(&key).ok_or_else(|| {
                    D::Error::custom(format!(
                        "CASE branch key '{}' must be 'default' or start with 'condition:'",
                        key
                    ))
                })?;
                Ok(CaseBranch { guard, step })
            })
            .collect()
    }
}

/* ===================== Definitions ===================== */

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FlowMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FlowDefinition {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub version: String,
    pub steps: Vec<FlowStep>,
    /// Initial values declared by the flow
    #[serde(default)]
    pub variables: Map<String, JsonValue>,
    #[serde(default)]
    pub metadata: FlowMetadata,
}

impl FlowDefinition {
    /// High-risk flows ask before letting another flow interrupt them
    pub fn is_high_risk(&self) -> bool {
        let declared = self
            .metadata
            .risk_level
            .as_deref()
            .map(|level| level.eq_ignore_ascii_case("high"))
            .unwrap_or(false);
        declared
            || is_financial(&self.name)
            || self.metadata.category.as_deref().map(is_financial).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ToolImplementation {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON-Schema-like description of the arguments
    #[serde(default)]
    pub parameters: JsonValue,
    #[serde(default)]
    pub implementation: ToolImplementation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/* ===================== Pre-scan ===================== */

/// Reject unknown step types and list-valued branches before deserializing
fn check_flow(flow: &JsonValue) -> Result<(), DefinitionError> {
    let name = flow
        .get("name")
        .and_then(JsonValue::as_str)
        .unwrap_or("<unnamed>")
        .to_string();
    let steps = flow
        .get("steps")
        .and_then(JsonValue::as_array)
        .ok_or_else(|| DefinitionError::Malformed {
            flow: name.clone(),
            message: "'steps' must be a list".to_string(),
        })?;
    steps.iter().try_for_each(|step| check_step(&name, step))
}

fn check_step(flow: &str, step: &JsonValue) -> Result<(), DefinitionError> {
    let malformed = |message: String| DefinitionError::Malformed {
        flow: flow.to_string(),
        message,
    };
    let step_type = step
        .get("type")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| malformed("every step needs a string 'type'".to_string()))?;
    if !STEP_TYPES.contains(&step_type) {
        return Err(DefinitionError::UnknownStepType {
            flow: flow.to_string(),
            step_type: step_type.to_string(),
        });
    }

    match step_type {
        "SWITCH" | "CASE" => {
            let branches = step
                .get("branches")
                .and_then(JsonValue::as_object)
                .ok_or_else(|| malformed(format!("{} step needs a 'branches' map", step_type)))?;
            for (key, branch) in branches {
                if branch.is_array() {
                    return Err(malformed(format!(
                        "branch '{}' must be a single step; use a FLOW step for several",
                        key
                    )));
                }
                check_step(flow, branch)?;
            }
        }
        "CALL-TOOL" => {
            if let Some(on_fail) = step.get("onFail") {
                check_step(flow, on_fail)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Parse one flow from JSON, checking its steps first
pub fn parse_flow(value: JsonValue) -> Result<FlowDefinition, DefinitionError> {
    check_flow(&value)?;
    let name = value
        .get("name")
        .and_then(JsonValue::as_str)
        .unwrap_or("<unnamed>")
        .to_string();
    serde_json::from_value(value).map_err(|e| DefinitionError::Malformed {
        flow: name,
        message: e.to_string(),
    })
}

/// Accepts a single flow, a list of flows, or `{ "flows": [...] }`
pub fn parse_flows(value: JsonValue) -> Result<Vec<FlowDefinition>, DefinitionError> {
    let flows = match value {
        JsonValue::Array(items) => items,
        JsonValue::Object(mut map) => match map.remove("flows") {
            Some(JsonValue::Array(items)) => items,
            Some(_) => {
                return Err(DefinitionError::Malformed {
                    flow: "<library>".to_string(),
                    message: "'flows' must be a list".to_string(),
                })
            }
            None => vec![JsonValue::Object(map)],
        },
        _ => {
            return Err(DefinitionError::Malformed {
                flow: "<library>".to_string(),
                message: "expected a flow object or a list of flows".to_string(),
            })
        }
    };
    flows.into_iter().map(parse_flow).collect()
}

/// SHA-256 of the definition's canonical JSON
pub fn fingerprint(definition: &FlowDefinition) -> String {
    let canonical = serde_json::to_string(definition).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

/* ===================== Flow Library ===================== */

#[derive(Debug, Clone)]
struct FlowEntry {
    definition: FlowDefinition,
    fingerprint: String,
}

/// Flow definitions addressable by name or id
#[derive(Debug, Clone, Default)]
pub struct FlowLibrary {
    flows: Vec<FlowEntry>,
    by_key: BTreeMap<String, usize>,
}

impl FlowLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_definitions(
        definitions: impl IntoIterator<Item = FlowDefinition>,
    ) -> Result<Self, DefinitionError> {
        let mut library = Self::new();
        for definition in definitions {
            library.insert(definition)?;
        }
        Ok(library)
    }

    pub fn from_json(value: JsonValue) -> Result<Self, DefinitionError> {
        Self::from_definitions(parse_flows(value)?)
    }

    pub fn insert(&mut self, definition: FlowDefinition) -> Result<(), DefinitionError> {
        let mut keys = vec![definition.name.clone()];
        if !definition.id.is_empty() && definition.id != definition.name {
            keys.push(definition.id.clone());
        }
        if let Some(taken) = keys.iter().find(|key| self.by_key.contains_key(*key)) {
            return Err(DefinitionError::Duplicate {
                kind: "flow",
                name: taken.clone(),
            });
        }

        let index = self.flows.len();
        for key in keys {
            self.by_key.insert(key, index);
        }
        debug!(flow = %definition.name, steps = definition.steps.len(), "Registered flow");
        let fingerprint = fingerprint(&definition);
        self.flows.push(FlowEntry {
            definition,
            fingerprint,
        });
        Ok(())
    }

    /// Look a flow up by name or id
    pub fn get(&self, name_or_id: &str) -> Option<&FlowDefinition> {
        self.entry(name_or_id).map(|entry| &entry.definition)
    }

    pub fn fingerprint(&self, name_or_id: &str) -> Option<&str> {
        self.entry(name_or_id).map(|entry| entry.fingerprint.as_str())
    }

    fn entry(&self, name_or_id: &str) -> Option<&FlowEntry> {
        self.by_key
            .get(name_or_id)
            .and_then(|index| self.flows.get(*index))
    }

    pub fn iter(&self) -> impl Iterator<Item = &FlowDefinition> {
        self.flows.iter().map(|entry| &entry.definition)
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// Load flows from a `.json` or `.toml` file
    pub fn load_file(&mut self, path: &Path) -> Result<usize> {
        let source = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read flow file {}", path.display()))?;
        let value: JsonValue = match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => {
                let table: toml::Value = toml::from_str(&source)
                    .with_context(|| format!("Failed to parse TOML in {}", path.display()))?;
                serde_json::to_value(table).context("Failed to convert TOML flows to JSON")?
            }
            _ => serde_json::from_str(&source)
                .with_context(|| format!("Failed to parse JSON in {}", path.display()))?,
        };

        let definitions = parse_flows(value)
            .with_context(|| format!("Invalid flow definitions in {}", path.display()))?;
        let count = definitions.len();
        for definition in definitions {
            self.insert(definition)
                .with_context(|| format!("Failed to register flows from {}", path.display()))?;
        }
        Ok(count)
    }

    /// Load every `.json` and `.toml` file in `dir`, in file-name order
    pub fn load_dir(dir: &Path) -> Result<Self> {
        let mut paths: Vec<_> = std::fs::read_dir(dir)
            .with_context(|| format!("Failed to read flow directory {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                matches!(
                    path.extension().and_then(|ext| ext.to_str()),
                    Some("json") | Some("toml")
                )
            })
            .collect();
        paths.sort();

        let mut library = Self::new();
        for path in &paths {
            library.load_file(path)?;
        }
        info!(flows = library.len(), dir = %dir.display(), "Loaded flow library");
        Ok(library)
    }
}

/* ===================== Tool Registry ===================== */

/// Tool definitions addressable by name or id
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, ToolDefinition>,
}

impl ToolRegistry {
    pub fn new(tools: impl IntoIterator<Item = ToolDefinition>) -> Result<Self, DefinitionError> {
        let mut registry = Self::default();
        for tool in tools {
            if registry.tools.contains_key(&tool.name) {
                return Err(DefinitionError::Duplicate {
                    kind: "tool",
                    name: tool.name,
                });
            }
            registry.tools.insert(tool.name.clone(), tool);
        }
        Ok(registry)
    }

    pub fn get(&self, name_or_id: &str) -> Option<&ToolDefinition> {
        self.tools
            .get(name_or_id)
            .or_else(|| self.tools.values().find(|tool| tool.id == name_or_id))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ToolDefinition> {
        self.tools.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn sample_flow() -> JsonValue {
        json!({
            "id": "support",
            "name": "Support",
            "description": "Help with an order",
            "version": "1.0",
            "variables": {"attempts": 0},
            "steps": [
                {"type": "SAY", "id": "hi", "value": "Hello", "value_es": "Hola"},
                {"type": "SAY-GET", "id": "ask", "value": "Order number?", "variable": "order"},
                {"type": "SWITCH", "id": "route", "variable": "tier", "branches": {
                    "premium": {"type": "SAY", "value": "Priority queue"},
                    "default": {"type": "FLOW", "value": "Standard", "callType": "replace"}
                }},
                {"type": "CASE", "id": "grade", "branches": {
                    "condition: score >= 90": {"type": "SET", "variable": "grade", "value": "A"},
                    "condition: score >= 80": {"type": "SET", "variable": "grade", "value": "B"},
                    "default": {"type": "SET", "variable": "grade", "value": "C"}
                }},
                {"type": "CALL-TOOL", "id": "lookup", "tool": "lookup_order",
                 "args": {"order": "{{order}}"}, "variable": "result",
                 "retry": {"maxRetries": 1},
                 "onFail": {"type": "FLOW", "flow": "Apology"}}
            ]
        })
    }

    #[test]
    fn test_parse_all_step_types() {
        let flow = parse_flow(sample_flow()).unwrap();
        let types: Vec<_> = flow.steps.iter().map(FlowStep::type_name).collect();
        assert_eq!(types, vec!["SAY", "SAY-GET", "SWITCH", "CASE", "CALL-TOOL"]);

        let FlowStep::Say(say) = &flow.steps[0] else {
            unreachable!()
        };
        assert_eq!(localized_text(&say.value, &say.localized, "es"), "Hola");
        assert_eq!(localized_text(&say.value, &say.localized, "fr"), "Hello");

        let FlowStep::Switch(switch) = &flow.steps[2] else {
            unreachable!()
        };
        assert_eq!(switch.branches[0].key, "premium");
        let FlowStep::Flow(target) = &switch.branches[1].step else {
            unreachable!()
        };
        assert_eq!(target.flow, "Standard");
        assert_eq!(target.call_type, CallType::Replace);
    }

    #[test]
    fn test_case_branches_keep_declaration_order() {
        let flow = parse_flow(sample_flow()).unwrap();
        let FlowStep::Case(case) = &flow.steps[3] else {
            unreachable!()
        };
        let guards: Vec<_> = case.branches.iter().map(|b| b.guard.to_string()).collect();
        assert_eq!(
            guards,
            vec!["condition: score >= 90", "condition: score >= 80", "default"]
        );
    }

    #[test]
    fn test_unknown_step_type_rejected() {
        let flow = json!({"name": "Bad", "steps": [{"type": "LOOP"}]});
        assert!(matches!(
            parse_flow(flow),
            Err(DefinitionError::UnknownStepType { step_type, .. }) if step_type == "LOOP"
        ));

        let nested = json!({"name": "Nested", "steps": [
            {"type": "CASE", "branches": {"default": {"type": "EXEC"}}}
        ]});
        assert!(matches!(
            parse_flow(nested),
            Err(DefinitionError::UnknownStepType { .. })
        ));
    }

    #[test]
    fn test_list_branches_rejected() {
        let flow = json!({"name": "Multi", "steps": [
            {"type": "SWITCH", "variable": "x", "branches": {
                "a": [{"type": "SAY", "value": "1"}, {"type": "SAY", "value": "2"}]
            }}
        ]});
        assert!(matches!(
            parse_flow(flow),
            Err(DefinitionError::Malformed { .. })
        ));
    }

    #[test]
    fn test_bad_case_key_rejected() {
        let flow = json!({"name": "Case", "steps": [
            {"type": "CASE", "branches": {"score > 1": {"type": "SAY", "value": "x"}}}
        ]});
        assert!(matches!(
            parse_flow(flow),
            Err(DefinitionError::Malformed { .. })
        ));
    }

    #[test]
    fn test_library_lookup_and_duplicates() {
        let mut library = FlowLibrary::from_json(json!([sample_flow()])).unwrap();
        assert!(library.get("Support").is_some());
        assert!(library.get("support").is_some());
        assert_eq!(library.fingerprint("Support").map(str::len), Some(64));

        let duplicate = parse_flow(sample_flow()).unwrap();
        assert!(matches!(
            library.insert(duplicate),
            Err(DefinitionError::Duplicate { kind: "flow", .. })
        ));
    }

    #[test]
    fn test_fingerprint_changes_with_content() {
        let a = parse_flow(sample_flow()).unwrap();
        let mut b = a.clone();
        assert_eq!(fingerprint(&a), fingerprint(&b));
        b.description = "changed".to_string();
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn test_step_round_trip_keeps_shape() {
        let flow = parse_flow(sample_flow()).unwrap();
        let encoded = serde_json::to_value(&flow).unwrap();
        assert_eq!(parse_flow(encoded).unwrap(), flow);
    }

    #[test]
    fn test_high_risk_detection() {
        let mut flow = parse_flow(sample_flow()).unwrap();
        assert!(!flow.is_high_risk());
        flow.metadata.risk_level = Some("high".to_string());
        assert!(flow.is_high_risk());

        let payment = FlowDefinition {
            name: "Make Payment".to_string(),
            ..Default::default()
        };
        assert!(payment.is_high_risk());
    }

    #[test]
    fn test_load_dir_reads_json_and_toml() {
        let dir = tempfile::tempdir().unwrap();

        let mut json_file = std::fs::File::create(dir.path().join("a_support.json")).unwrap();
        write!(json_file, "{}", json!({"flows": [sample_flow()]})).unwrap();

        std::fs::write(
            dir.path().join("b_greeting.toml"),
            r#"
[[flows]]
name = "Greeting"
description = "Say hello"

[[flows.steps]]
type = "SAY"
value = "Hi {{userId}}"
"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let library = FlowLibrary::load_dir(dir.path()).unwrap();
        assert_eq!(library.len(), 2);
        assert_eq!(library.get("Greeting").unwrap().steps.len(), 1);
    }

    #[test]
    fn test_tool_registry_lookup() {
        let registry = ToolRegistry::new(vec![ToolDefinition {
            id: "t-1".to_string(),
            name: "lookup_order".to_string(),
            implementation: ToolImplementation {
                kind: "local".to_string(),
                function: Some("lookupOrder".to_string()),
                extra: Map::new(),
            },
            ..Default::default()
        }])
        .unwrap();
        assert!(registry.get("lookup_order").is_some());
        assert!(registry.get("t-1").is_some());
        assert!(registry.get("missing").is_none());
    }
}
