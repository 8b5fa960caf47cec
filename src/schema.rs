//! Capability descriptors and the validated call wrappers built from them.
//!
//! The tool server describes its capabilities at runtime, so parameter shapes
//! are not known at compile time. Each descriptor is parsed into a closed
//! `ParamKind` per parameter plus a generic `serde_json::Value` for the
//! argument itself. `translate` turns the descriptor list into a `ToolSet` of
//! `ExecutableTool`s that:
//! - reject missing required parameters and mistyped values before any
//!   process interaction
//! - substitute declared defaults for omitted optionals
//! - omit optionals that have no default from the wire arguments entirely

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::error::{BridgeError, Result};

/// Something that can execute a named capability with an argument map.
///
/// `ProtocolClient` is the production implementation; tests supply counters.
#[async_trait]
pub trait Invoke: Send + Sync {
    async fn invoke(&self, name: &str, arguments: Map<String, Value>) -> Result<String>;
}

/// Declared kind of a single parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
    /// Unrecognized or undeclared kind; accepts any value.
    Any,
}

impl ParamKind {
    /// Parse a kind name. Unknown names map to `Any`.
    pub fn parse(kind: &str) -> Self {
        match kind {
            "string" => ParamKind::String,
            "integer" => ParamKind::Integer,
            "number" => ParamKind::Number,
            "boolean" => ParamKind::Boolean,
            "array" => ParamKind::Array,
            "object" => ParamKind::Object,
            other => {
                tracing::debug!(kind = other, "unrecognized parameter kind treated as any");
                ParamKind::Any
            }
        }
    }

    /// JSON Schema type name, `None` for `Any`.
    pub fn as_str(self) -> Option<&'static str> {
        match self {
            ParamKind::String => Some("string"),
            ParamKind::Integer => Some("integer"),
            ParamKind::Number => Some("number"),
            ParamKind::Boolean => Some("boolean"),
            ParamKind::Array => Some("array"),
            ParamKind::Object => Some("object"),
            ParamKind::Any => None,
        }
    }

    /// Whether `value` satisfies this kind.
    ///
    /// Arrays and objects are checked only at the top level; their contents
    /// pass through untouched.
    pub fn accepts(self, value: &Value) -> bool {
        match self {
            ParamKind::String => value.is_string(),
            ParamKind::Integer => match value {
                Value::Number(n) => {
                    n.is_i64() || n.is_u64() || n.as_f64().is_some_and(|f| f.fract() == 0.0)
                }
                _ => false,
            },
            ParamKind::Number => value.is_number(),
            ParamKind::Boolean => value.is_boolean(),
            ParamKind::Array => value.is_array(),
            ParamKind::Object => value.is_object(),
            ParamKind::Any => true,
        }
    }
}

fn value_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// One declared parameter of a capability.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamKind,
    pub required: bool,
    pub default: Option<Value>,
    pub description: Option<String>,
}

/// A capability as described by the tool server.
#[derive(Debug, Clone, PartialEq)]
pub struct CapabilityDescriptor {
    pub name: String,
    pub description: String,
    /// Parameters in the order the server declared them.
    pub parameters: Vec<ParamSpec>,
}

impl CapabilityDescriptor {
    /// Parse one entry of a capability listing.
    ///
    /// Accepts either a `parameters` map of
    /// `{name: {kind|type, required, default, description}}` or an MCP-style
    /// `inputSchema` JSON Schema object.
    pub fn from_value(value: Value) -> Result<Self> {
        let mut entry = match value {
            Value::Object(entry) => entry,
            other => {
                return Err(BridgeError::Protocol(format!(
                    "capability descriptor is not an object: {other}"
                )))
            }
        };

        let name = match entry.remove("name") {
            Some(Value::String(name)) if !name.is_empty() => name,
            _ => {
                return Err(BridgeError::Protocol(
                    "capability descriptor has no name".to_string(),
                ))
            }
        };
        let description = match entry.remove("description") {
            Some(Value::String(text)) => text,
            _ => String::new(),
        };

        let parameters = if let Some(params) = entry.remove("parameters") {
            parse_parameter_map(&name, params)?
        } else if let Some(schema) = entry.remove("inputSchema") {
            parse_input_schema(&name, schema)?
        } else {
            Vec::new()
        };

        Ok(Self {
            name,
            description,
            parameters,
        })
    }

    pub fn param(&self, name: &str) -> Option<&ParamSpec> {
        self.parameters.iter().find(|p| p.name == name)
    }

    /// Validate caller arguments against this descriptor.
    ///
    /// `arguments` must be a JSON object; `null` is treated as `{}`.
    pub fn bind(&self, arguments: Value) -> Result<BoundArguments> {
        let mut supplied = match arguments {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(self.invalid(format!(
                    "arguments must be an object, got {}",
                    value_type_name(&other)
                )))
            }
        };

        let mut problems = Vec::new();
        let mut slots = Vec::with_capacity(self.parameters.len());
        for param in &self.parameters {
            let slot = match supplied.remove(&param.name) {
                None | Some(Value::Null) if param.required => {
                    problems.push(format!("missing required parameter '{}'", param.name));
                    continue;
                }
                None | Some(Value::Null) => match &param.default {
                    Some(default) => ArgumentSlot::Defaulted(default.clone()),
                    None => ArgumentSlot::Absent,
                },
                Some(value) if !param.kind.accepts(&value) => {
                    problems.push(format!(
                        "parameter '{}' expects {}, got {}",
                        param.name,
                        param.kind.as_str().unwrap_or("any"),
                        value_type_name(&value)
                    ));
                    continue;
                }
                Some(value) => ArgumentSlot::Supplied(value),
            };
            slots.push((param.name.clone(), slot));
        }

        if !problems.is_empty() {
            return Err(self.invalid(problems.join("; ")));
        }

        if !supplied.is_empty() {
            let names: Vec<&str> = supplied.keys().map(String::as_str).collect();
            tracing::debug!(
                tool = %self.name,
                ?names,
                "passing through undeclared arguments"
            );
        }

        Ok(BoundArguments {
            slots,
            undeclared: supplied,
        })
    }

    /// Declaration handed to the model collaborator.
    pub fn declaration(&self) -> ToolDeclaration {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for param in &self.parameters {
            let mut property = Map::new();
            if let Some(kind) = param.kind.as_str() {
                property.insert("type".to_string(), json!(kind));
            }
            if let Some(description) = &param.description {
                property.insert("description".to_string(), json!(description));
            }
            if let Some(default) = &param.default {
                property.insert("default".to_string(), default.clone());
            }
            properties.insert(param.name.clone(), Value::Object(property));
            if param.required {
                required.push(json!(param.name));
            }
        }

        ToolDeclaration {
            name: self.name.clone(),
            description: self.description.clone(),
            parameter_schema: json!({
                "type": "object",
                "properties": properties,
                "required": required,
            }),
        }
    }

    fn invalid(&self, message: String) -> BridgeError {
        BridgeError::Validation {
            tool: self.name.clone(),
            message,
        }
    }
}

fn parse_parameter_map(tool: &str, params: Value) -> Result<Vec<ParamSpec>> {
    let Value::Object(params) = params else {
        return Err(BridgeError::Protocol(format!(
            "parameters of '{tool}' are not a map"
        )));
    };

    params
        .into_iter()
        .map(|(name, spec)| {
            let Value::Object(spec) = spec else {
                return Err(BridgeError::Protocol(format!(
                    "parameter '{name}' of '{tool}' is not an object"
                )));
            };
            let kind = spec
                .get("kind")
                .or_else(|| spec.get("type"))
                .map(kind_of)
                .unwrap_or(ParamKind::Any);
            Ok(ParamSpec {
                kind,
                required: spec.get("required").and_then(Value::as_bool).unwrap_or(false),
                default: spec.get("default").filter(|v| !v.is_null()).cloned(),
                description: spec
                    .get("description")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                name,
            })
        })
        .collect()
}

fn parse_input_schema(tool: &str, schema: Value) -> Result<Vec<ParamSpec>> {
    let Value::Object(schema) = schema else {
        return Err(BridgeError::Protocol(format!(
            "inputSchema of '{tool}' is not an object"
        )));
    };

    let required: HashSet<&str> = schema
        .get("required")
        .and_then(Value::as_array)
        .map(|names| names.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
        return Ok(Vec::new());
    };

    Ok(properties
        .iter()
        .map(|(name, property)| {
            let kind = property
                .get("type")
                .map(kind_of)
                .or_else(|| property.get("anyOf").map(kind_of_any_of))
                .unwrap_or(ParamKind::Any);
            ParamSpec {
                name: name.clone(),
                kind,
                required: required.contains(name.as_str()),
                default: property.get("default").filter(|v| !v.is_null()).cloned(),
                description: property
                    .get("description")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            }
        })
        .collect())
}

/// Kind from a `type` field: a name, or a list like `["string", "null"]`.
fn kind_of(value: &Value) -> ParamKind {
    match value {
        Value::String(kind) => ParamKind::parse(kind),
        Value::Array(kinds) => kinds
            .iter()
            .filter_map(Value::as_str)
            .find(|k| *k != "null")
            .map(ParamKind::parse)
            .unwrap_or(ParamKind::Any),
        _ => ParamKind::Any,
    }
}

/// Kind from an `anyOf` list, as emitted for optional fields.
fn kind_of_any_of(value: &Value) -> ParamKind {
    value
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|branch| branch.get("type"))
        .map(kind_of)
        .find(|kind| *kind != ParamKind::Any)
        .unwrap_or(ParamKind::Any)
}

/// How a declared parameter was resolved for one call.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgumentSlot {
    Supplied(Value),
    Defaulted(Value),
    /// Optional, omitted, no default. Not sent to the server.
    Absent,
}

/// Arguments that passed validation, ready for dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundArguments {
    slots: Vec<(String, ArgumentSlot)>,
    undeclared: Map<String, Value>,
}

impl BoundArguments {
    pub fn slot(&self, name: &str) -> Option<&ArgumentSlot> {
        self.slots
            .iter()
            .find(|(slot_name, _)| slot_name == name)
            .map(|(_, slot)| slot)
    }

    /// The argument map sent on the wire. Absent slots are omitted.
    pub fn into_wire(self) -> Map<String, Value> {
        let mut wire = Map::new();
        for (name, slot) in self.slots {
            match slot {
                ArgumentSlot::Supplied(value) | ArgumentSlot::Defaulted(value) => {
                    wire.insert(name, value);
                }
                ArgumentSlot::Absent => {}
            }
        }
        wire.extend(self.undeclared);
        wire
    }
}

/// Tool declaration as seen by the model collaborator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: String,
    pub parameter_schema: Value,
}

/// A descriptor bound to an invoker.
#[derive(Clone)]
pub struct ExecutableTool {
    descriptor: Arc<CapabilityDescriptor>,
    invoker: Arc<dyn Invoke>,
}

impl std::fmt::Debug for ExecutableTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutableTool")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

impl ExecutableTool {
    pub fn new(descriptor: CapabilityDescriptor, invoker: Arc<dyn Invoke>) -> Self {
        Self {
            descriptor: Arc::new(descriptor),
            invoker,
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn description(&self) -> &str {
        &self.descriptor.description
    }

    pub fn descriptor(&self) -> &CapabilityDescriptor {
        &self.descriptor
    }

    pub fn declaration(&self) -> ToolDeclaration {
        self.descriptor.declaration()
    }

    /// Validate `arguments`, then delegate to the invoker.
    ///
    /// Validation failures return before the invoker is touched.
    pub async fn call(&self, arguments: Value) -> Result<String> {
        let bound = self.descriptor.bind(arguments)?;
        tracing::debug!(tool = %self.descriptor.name, "dispatching validated call");
        self.invoker
            .invoke(&self.descriptor.name, bound.into_wire())
            .await
    }
}

/// The translated tools of one session, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct ToolSet {
    tools: Vec<ExecutableTool>,
}

impl ToolSet {
    /// First tool with this name.
    pub fn get(&self, name: &str) -> Option<&ExecutableTool> {
        self.tools.iter().find(|tool| tool.name() == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ExecutableTool> {
        self.tools.iter()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn declarations(&self) -> Vec<ToolDeclaration> {
        self.tools.iter().map(ExecutableTool::declaration).collect()
    }
}

/// Bind every descriptor to `invoker`, keeping declared order.
pub fn translate(descriptors: Vec<CapabilityDescriptor>, invoker: Arc<dyn Invoke>) -> ToolSet {
    let mut seen = HashSet::new();
    let tools = descriptors
        .into_iter()
        .map(|descriptor| {
            if !seen.insert(descriptor.name.clone()) {
                tracing::warn!(
                    tool = %descriptor.name,
                    "duplicate capability name, lookups resolve to the first"
                );
            }
            ExecutableTool::new(descriptor, Arc::clone(&invoker))
        })
        .collect();
    ToolSet { tools }
}
