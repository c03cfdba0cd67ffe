//! Breakpoint-hit capture transformer
//!
//! Remote agents report breakpoint hits as a loosely-typed JSON payload:
//! an ordered list of raw variable records (each a JSON-encoded string
//! keyed by variable name) plus a serialized stack trace. This module
//! reconstructs that payload into a structured [`BreakpointHit`]. The
//! transform is a pure function over the payload tree so it can be tested
//! in isolation.

use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use super::event::BreakpointHit;
use crate::error::{TransformError, TransformResult};

/// Wire key marking an oversized value the agent refused to capture.
const SKIP_KEY: &str = "@skip";
/// Wire key carrying a captured value's declared class.
const CLASS_KEY: &str = "@class";
/// Wire key carrying a captured value's stable identity token.
const IDENTITY_KEY: &str = "@identity";
/// Wire key carrying an oversized value's measured byte size.
const SIZE_KEY: &str = "@size";

/// Scope tag a remote agent attaches to a captured variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VariableScope {
    /// Field of the receiver object
    InstanceField,
    /// Local variable in the frame
    LocalVariable,
    /// Method argument
    Argument,
    /// Compiler-generated slot
    GeneratedMethod,
}

/// A captured variable's value: exactly one branch is populated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VariableValue {
    /// Composite object/array unpacked into ordered child variables
    Children(Vec<Variable>),
    /// Oversized value replaced by a skip marker; never unpacked
    Skipped {
        /// Reason code (e.g. `MAX_SIZE_EXCEEDED`)
        #[serde(rename = "@skip")]
        reason: String,
        /// Declared class of the original value
        #[serde(rename = "@class", default, skip_serializing_if = "Option::is_none")]
        class: Option<String>,
        /// Measured size in bytes
        #[serde(rename = "@size", default, skip_serializing_if = "Option::is_none")]
        size: Option<i64>,
    },
    /// Primitive or string value
    Scalar(Value),
}

impl VariableValue {
    /// Child variables, if this is a composite.
    pub fn children(&self) -> Option<&[Variable]> {
        match self {
            VariableValue::Children(children) => Some(children),
            _ => None,
        }
    }
}

/// A captured variable: name, scope, class metadata, and a value tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Variable {
    /// Variable name as reported by the agent
    pub name: String,
    /// Value tree
    pub value: VariableValue,
    /// Scope tag; absent for nested children
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<VariableScope>,
    /// Declared class name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub declared_class: Option<String>,
    /// Stable identity token for cycle detection on the client
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
}

impl Variable {
    fn scalar(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value: VariableValue::Scalar(value),
            scope: None,
            declared_class: None,
            identity: None,
        }
    }
}

/// One frame of a captured stack trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackFrame {
    /// Qualified method name
    pub method: String,
    /// Source descriptor, normally `File.ext:line`
    pub source: String,
    /// Variables captured in this frame (top frame only)
    #[serde(default)]
    pub variables: Vec<Variable>,
}

impl StackFrame {
    /// Create a frame with no variables attached.
    pub fn new(method: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            source: source.into(),
            variables: Vec::new(),
        }
    }

    /// Line number parsed from the source descriptor, when present.
    pub fn source_line(&self) -> Option<i32> {
        self.source.rsplit_once(':')?.1.parse().ok()
    }
}

/// A captured stack trace: exception header plus ordered frames,
/// innermost first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackTrace {
    /// Exception type from the header line
    pub exception_type: String,
    /// Optional message following the exception type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Frames, innermost first
    pub frames: Vec<StackFrame>,
}

impl StackTrace {
    /// Parse the serialized `Type: message\n\tat method(Source:line)` form.
    pub fn parse(raw: &str) -> TransformResult<Self> {
        Self::try_parse(raw).ok_or_else(|| TransformError::UnparseableStackTrace(raw.to_string()))
    }

    /// Lenient variant of [`StackTrace::parse`] for removal causes, where a
    /// non-conforming cause simply yields no structured trace.
    pub fn try_parse(raw: &str) -> Option<Self> {
        let mut lines = raw.lines().filter(|line| !line.trim().is_empty());
        let header = lines.next()?.trim();
        let (exception_type, message) = match header.split_once(": ") {
            Some((ty, msg)) => (ty.to_string(), Some(msg.to_string())),
            None => (header.to_string(), None),
        };

        let mut frames = Vec::new();
        for line in lines {
            let line = line.trim();
            let Some(body) = line.strip_prefix("at ") else {
                continue;
            };
            let (method, rest) = body.split_once('(')?;
            let source = rest.strip_suffix(')')?;
            frames.push(StackFrame::new(method.trim(), source));
        }

        if frames.is_empty() {
            return None;
        }
        Some(Self {
            exception_type,
            message,
            frames,
        })
    }

    /// The innermost frame.
    pub fn first_frame(&self) -> &StackFrame {
        &self.frames[0]
    }
}

impl fmt::Display for StackTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => writeln!(f, "{}: {}", self.exception_type, message)?,
            None => writeln!(f, "{}", self.exception_type)?,
        }
        for frame in &self.frames {
            writeln!(f, "\tat {}({})", frame.method, frame.source)?;
        }
        Ok(())
    }
}

/// Transform a raw breakpoint-hit payload into a structured hit record.
///
/// Steps: decode each raw variable record (recursively for composites),
/// fold instance fields into `this`, parse the stack trace, correct an
/// unknown top-frame source from the capture's recorded location, and
/// attach the variables to the innermost frame.
pub fn transform_raw_breakpoint_hit(payload: &Value) -> TransformResult<BreakpointHit> {
    let raw_variables = payload
        .get("variables")
        .and_then(Value::as_array)
        .ok_or(TransformError::MissingField("variables"))?;

    let mut variables = Vec::with_capacity(raw_variables.len());
    for record in raw_variables {
        variables.push(decode_variable_record(record)?);
    }
    merge_instance_fields(&mut variables);

    let raw_trace = payload
        .get("stack_trace")
        .and_then(Value::as_str)
        .ok_or(TransformError::MissingField("stack_trace"))?;
    let mut stack_trace = StackTrace::parse(raw_trace)?;

    if stack_trace.first_frame().source_line().is_none() {
        correct_unknown_source(&mut stack_trace, payload)?;
    }
    stack_trace.frames[0].variables = variables;

    let occurred_at_millis = payload
        .get("occurred_at")
        .and_then(Value::as_i64)
        .ok_or(TransformError::MissingField("occurred_at"))?;
    let occurred_at = Utc
        .timestamp_millis_opt(occurred_at_millis)
        .single()
        .ok_or_else(|| TransformError::MalformedField {
            field: "occurred_at",
            detail: format!("{occurred_at_millis} is not a valid epoch-millis timestamp"),
        })?;

    Ok(BreakpointHit {
        breakpoint_id: required_str(payload, "breakpoint_id")?.to_string(),
        trace_id: required_str(payload, "trace_id")?.to_string(),
        occurred_at,
        service_host: required_str(payload, "service_host")?.to_string(),
        service: required_str(payload, "service")?.to_string(),
        stack_trace,
    })
}

fn required_str<'a>(payload: &'a Value, field: &'static str) -> TransformResult<&'a str> {
    payload
        .get(field)
        .and_then(Value::as_str)
        .ok_or(TransformError::MissingField(field))
}

/// Decode one raw variable record: `{scope, data: {<name>: "<json>"}}`.
fn decode_variable_record(record: &Value) -> TransformResult<Variable> {
    let scope = record
        .get("scope")
        .and_then(Value::as_str)
        .map(|raw| {
            serde_json::from_value::<VariableScope>(Value::String(raw.to_string())).map_err(|_| {
                TransformError::MalformedField {
                    field: "scope",
                    detail: format!("unknown scope '{raw}'"),
                }
            })
        })
        .transpose()?;

    let data = record
        .get("data")
        .and_then(Value::as_object)
        .ok_or(TransformError::MissingField("data"))?;
    let (name, encoded) = data
        .iter()
        .next()
        .ok_or(TransformError::MissingField("data"))?;
    let encoded = encoded
        .as_str()
        .ok_or(TransformError::MalformedField {
            field: "data",
            detail: format!("value for '{name}' is not a JSON-encoded string"),
        })?;

    let outer: Value =
        serde_json::from_str(encoded).map_err(|source| TransformError::VariableDecode {
            name: name.clone(),
            source,
        })?;
    let outer_obj = outer.as_object();

    let mut variable = match outer_obj.and_then(|obj| obj.get(name)) {
        Some(Value::Object(inner)) => to_variable(name, inner),
        Some(value) => {
            let mut scalar = Variable::scalar(name, value.clone());
            scalar.declared_class = outer_field(outer_obj, CLASS_KEY);
            scalar.identity = outer_field(outer_obj, IDENTITY_KEY);
            scalar
        }
        None => Variable::scalar(name, Value::Null),
    };
    variable.scope = scope;
    Ok(variable)
}

fn outer_field(obj: Option<&Map<String, Value>>, key: &str) -> Option<String> {
    obj?.get(key)?.as_str().map(str::to_string)
}

/// Bottom-up recursive decode of a composite value into a variable tree.
///
/// A skip marker passes through unchanged instead of being unpacked.
fn to_variable(name: &str, data: &Map<String, Value>) -> Variable {
    if let Some(reason) = data.get(SKIP_KEY).and_then(Value::as_str) {
        return Variable {
            name: name.to_string(),
            value: VariableValue::Skipped {
                reason: reason.to_string(),
                class: data.get(CLASS_KEY).and_then(Value::as_str).map(str::to_string),
                size: data.get(SIZE_KEY).and_then(Value::as_i64),
            },
            scope: None,
            declared_class: data.get(CLASS_KEY).and_then(Value::as_str).map(str::to_string),
            identity: None,
        };
    }

    let mut children = Vec::new();
    for (field, value) in data {
        if field.starts_with('@') {
            continue;
        }
        match value {
            Value::Object(inner) => children.push(to_variable(field, inner)),
            other => children.push(Variable::scalar(field, other.clone())),
        }
    }

    Variable {
        name: name.to_string(),
        value: VariableValue::Children(children),
        scope: None,
        declared_class: data.get(CLASS_KEY).and_then(Value::as_str).map(str::to_string),
        identity: data
            .get(IDENTITY_KEY)
            .and_then(Value::as_str)
            .map(str::to_string),
    }
}

/// Fold instance-field variables into `this`'s child list, the way an
/// interactive debugger displays receiver state.
fn merge_instance_fields(variables: &mut Vec<Variable>) {
    let has_composite_this = variables
        .iter()
        .any(|v| v.name == "this" && matches!(v.value, VariableValue::Children(_)));
    if !has_composite_this {
        return;
    }

    let mut fields = Vec::new();
    let mut index = 0;
    while index < variables.len() {
        let v = &variables[index];
        if v.scope == Some(VariableScope::InstanceField) && v.name != "this" {
            fields.push(variables.remove(index));
        } else {
            index += 1;
        }
    }

    if let Some(this_var) = variables.iter_mut().find(|v| v.name == "this") {
        if let VariableValue::Children(children) = &mut this_var.value {
            for field in fields {
                children.retain(|child| child.name != field.name);
                children.push(field);
            }
        }
    }
}

/// Rebuild frame 0's source when the agent could not resolve a line number
/// (synthetic/lambda frames), using the capture's recorded location and
/// the language extension from frame 1.
fn correct_unknown_source(trace: &mut StackTrace, payload: &Value) -> TransformResult<()> {
    if trace.frames.len() < 2 {
        return Ok(());
    }

    let language = trace.frames[1]
        .source
        .split_once('.')
        .map(|(_, rest)| rest)
        .and_then(|rest| rest.split(':').next())
        .unwrap_or("java")
        .to_string();

    let location_source = required_str(payload, "location_source")?;
    let location_line = payload
        .get("location_line")
        .and_then(Value::as_i64)
        .ok_or(TransformError::MissingField("location_line"))?;

    let simple_name = location_source
        .rsplit('.')
        .next()
        .unwrap_or(location_source);
    let corrected = StackFrame::new(
        trace.frames[0].method.clone(),
        format!("{simple_name}.{language}:{location_line}"),
    );
    trace.frames[0] = corrected;
    Ok(())
}
