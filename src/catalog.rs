//! Task catalog: declarative job records with typed arguments,
//! concurrency policies and schedules.
//!
//! Catalog loading is deterministic and forgiving about per-entry
//! details: an argument default that does not parse as its declared
//! type is logged and omitted (the task stays runnable, the argument
//! just has no default), and a schedule entry with an unknown unit is
//! logged and skipped. Structural problems (a task without a name, an
//! unknown argument type) are configuration errors.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{NaiveTime, Weekday};
use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::ConfigView;
use crate::error::{Error, Result};
use crate::template::TemplateContext;

/// The only task kind currently understood by the execution core.
pub const TASK_SUBPROCESS: &str = "subprocess";

/// Declared type of a task argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgType {
    /// String argument.
    Str,
    /// Integer argument.
    Int,
    /// Float argument.
    Float,
    /// Boolean argument.
    Bool,
}

impl ArgType {
    /// Parse a declared type name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "str" => Some(Self::Str),
            "int" => Some(Self::Int),
            "float" => Some(Self::Float),
            "bool" => Some(Self::Bool),
            _ => None,
        }
    }

    /// Parse a textual literal into a value of this type.
    pub fn parse_literal(self, text: &str) -> Result<ArgValue> {
        match self {
            Self::Str => Ok(ArgValue::Str(text.to_string())),
            Self::Int => text
                .trim()
                .parse::<i64>()
                .map(ArgValue::Int)
                .map_err(|e| Error::config(format!("'{text}' is not an int: {e}"))),
            Self::Float => text
                .trim()
                .parse::<f64>()
                .map(ArgValue::Float)
                .map_err(|e| Error::config(format!("'{text}' is not a float: {e}"))),
            Self::Bool => match text.trim().to_ascii_lowercase().as_str() {
                "true" | "1" => Ok(ArgValue::Bool(true)),
                "false" | "0" => Ok(ArgValue::Bool(false)),
                _ => Err(Error::config(format!("'{text}' is not a bool"))),
            },
        }
    }

    /// Coerce a JSON literal (string or native) into a value of this type.
    pub fn coerce(self, value: &Value) -> Result<ArgValue> {
        match (self, value) {
            (_, Value::String(s)) => self.parse_literal(s),
            (Self::Int, Value::Number(n)) => n
                .as_i64()
                .map(ArgValue::Int)
                .ok_or_else(|| Error::config(format!("'{n}' is not an int"))),
            (Self::Float, Value::Number(n)) => n
                .as_f64()
                .map(ArgValue::Float)
                .ok_or_else(|| Error::config(format!("'{n}' is not a float"))),
            (Self::Bool, Value::Bool(b)) => Ok(ArgValue::Bool(*b)),
            (_, other) => Err(Error::config(format!(
                "literal {other} does not fit declared type"
            ))),
        }
    }
}

/// A typed argument value.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    /// String value.
    Str(String),
    /// Integer value.
    Int(i64),
    /// Float value.
    Float(f64),
    /// Boolean value.
    Bool(bool),
}

impl ArgValue {
    /// Convert into a JSON value for template contexts.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Str(s) => Value::String(s.clone()),
            Self::Int(i) => Value::from(*i),
            Self::Float(f) => Value::from(*f),
            Self::Bool(b) => Value::Bool(*b),
        }
    }
}

impl fmt::Display for ArgValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) => write!(f, "{s}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Bool(b) => write!(f, "{b}"),
        }
    }
}

/// Declaration of one task argument.
#[derive(Debug, Clone, PartialEq)]
pub struct ArgSpec {
    /// Declared type.
    pub arg_type: ArgType,
    /// Human description, shown on the chat argument keyboard prompt.
    pub description: Option<String>,
    /// Typed default, if the catalog declared a parseable one.
    pub default: Option<ArgValue>,
}

/// Schedule unit: fixed intervals or a weekday anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleUnit {
    /// Every `interval` seconds.
    Seconds,
    /// Every `interval` minutes.
    Minutes,
    /// Every `interval` hours.
    Hours,
    /// Every `interval` days.
    Days,
    /// On the given weekday, every `interval` weeks.
    Weekly(Weekday),
}

impl ScheduleUnit {
    /// Parse a unit name from the catalog grammar.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "seconds" => Some(Self::Seconds),
            "minutes" => Some(Self::Minutes),
            "hours" => Some(Self::Hours),
            "days" => Some(Self::Days),
            "monday" => Some(Self::Weekly(Weekday::Mon)),
            "tuesday" => Some(Self::Weekly(Weekday::Tue)),
            "wednesday" => Some(Self::Weekly(Weekday::Wed)),
            "thursday" => Some(Self::Weekly(Weekday::Thu)),
            "friday" => Some(Self::Weekly(Weekday::Fri)),
            "saturday" => Some(Self::Weekly(Weekday::Sat)),
            "sunday" => Some(Self::Weekly(Weekday::Sun)),
            _ => None,
        }
    }

    /// Whether an `at "HH:MM[:SS]"` anchor is meaningful for this unit.
    pub fn supports_at(self) -> bool {
        matches!(self, Self::Days | Self::Weekly(_))
    }
}

/// One schedule triple: `every <interval> <unit> [at "HH:MM[:SS]"]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Schedule {
    /// Repeat interval, in `unit`s.
    pub interval: u32,
    /// Interval unit.
    pub unit: ScheduleUnit,
    /// Time-of-day anchor for day and weekday units.
    pub at: Option<NaiveTime>,
}

/// A named, re-entrant unit of externally visible work. Immutable after
/// catalog load.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    /// Unique name within the process.
    pub name: String,
    /// Kind tag; only [`TASK_SUBPROCESS`] is runnable.
    pub task_type: String,
    /// Human description.
    pub description: Option<String>,
    /// Templated command vector, expanded at invocation time.
    pub command: Vec<String>,
    /// Declared arguments, in catalog order.
    pub args: IndexMap<String, ArgSpec>,
    /// Derived name → typed default mapping, in catalog order.
    pub default_args: IndexMap<String, ArgValue>,
    /// At most one concurrent run permitted.
    pub singleton: bool,
    /// Names of tasks that must not be running for this one to start.
    pub conflict: BTreeSet<String>,
    /// Periodic schedules.
    pub schedule: Vec<Schedule>,
}

impl Task {
    /// Whether this task has at least one schedule.
    pub fn has_schedule(&self) -> bool {
        !self.schedule.is_empty()
    }

    /// Build the command-template context: call arguments merged over
    /// the task defaults (call arguments win).
    pub fn merge_args(&self, call_args: &IndexMap<String, ArgValue>) -> TemplateContext {
        let mut context = TemplateContext::new();
        for (name, value) in &self.default_args {
            context.insert(name.clone(), value.to_json());
        }
        for (name, value) in call_args {
            context.insert(name.clone(), value.to_json());
        }
        context
    }
}

fn default_task_type() -> String {
    TASK_SUBPROCESS.to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct TaskEntry {
    name: String,
    #[serde(rename = "type", default = "default_task_type")]
    task_type: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default = "default_true")]
    singleton: bool,
    #[serde(default)]
    conflict: Vec<String>,
    #[serde(default)]
    args: IndexMap<String, ArgEntry>,
    #[serde(default)]
    command: Vec<String>,
    #[serde(default)]
    schedule: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct ArgEntry {
    #[serde(rename = "type")]
    arg_type: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    default: Option<Value>,
}

/// Parse the `tasklist` config section into task records.
pub fn parse_catalog(tasklist: &ConfigView) -> Result<Vec<Task>> {
    let mut tasks = Vec::new();
    for entry in tasklist.iter() {
        let view = entry?
            .into_view()
            .ok_or_else(|| Error::config("tasklist entries must be objects"))?;
        tasks.push(parse_task(view.resolved_object()?)?);
    }
    Ok(tasks)
}

fn parse_task(raw: Value) -> Result<Task> {
    let entry: TaskEntry = serde_json::from_value(raw)
        .map_err(|e| Error::config(format!("invalid task entry: {e}")))?;
    debug!(task = %entry.name, "preparing task");

    if entry.task_type == TASK_SUBPROCESS && entry.command.is_empty() {
        return Err(Error::config(format!(
            "task '{}' has an empty command",
            entry.name
        )));
    }

    let mut args = IndexMap::new();
    let mut default_args = IndexMap::new();
    for (name, arg) in entry.args {
        let arg_type = ArgType::from_name(&arg.arg_type).ok_or_else(|| {
            Error::config(format!(
                "task '{}': argument '{name}' has unknown type '{}'",
                entry.name, arg.arg_type
            ))
        })?;
        let default = match arg.default {
            Some(literal) => match arg_type.coerce(&literal) {
                Ok(value) => {
                    default_args.insert(name.clone(), value.clone());
                    Some(value)
                },
                Err(e) => {
                    warn!(
                        task = %entry.name,
                        arg = %name,
                        "default does not parse, omitting: {e}"
                    );
                    None
                },
            },
            None => None,
        };
        args.insert(
            name,
            ArgSpec {
                arg_type,
                description: arg.description,
                default,
            },
        );
    }

    let mut schedule = Vec::new();
    for triple in &entry.schedule {
        if let Some(parsed) = parse_schedule(&entry.name, triple) {
            schedule.push(parsed);
        }
    }

    Ok(Task {
        name: entry.name,
        task_type: entry.task_type,
        description: entry.description,
        command: entry.command,
        args,
        default_args,
        singleton: entry.singleton,
        conflict: entry.conflict.into_iter().collect(),
        schedule,
    })
}

fn parse_schedule(task: &str, triple: &Value) -> Option<Schedule> {
    let Some(parts) = triple.as_array() else {
        warn!(task, "schedule entry is not a triple, skipping: {triple}");
        return None;
    };

    let interval = match parts.first() {
        Some(Value::Number(n)) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
        Some(Value::String(s)) => s.parse::<u32>().ok(),
        _ => None,
    };
    let Some(interval) = interval else {
        warn!(task, "schedule interval is not a positive integer, skipping: {triple}");
        return None;
    };

    let unit = parts.get(1).and_then(Value::as_str);
    let Some(unit) = unit.and_then(ScheduleUnit::from_name) else {
        warn!(task, "schedule unit [{}] not valid, skipping", unit.unwrap_or("?"));
        return None;
    };

    let at = match parts.get(2).and_then(Value::as_str) {
        Some(text) => {
            let parsed = NaiveTime::parse_from_str(text, "%H:%M:%S")
                .or_else(|_| NaiveTime::parse_from_str(text, "%H:%M"));
            match parsed {
                Ok(time) if unit.supports_at() => Some(time),
                Ok(_) => {
                    warn!(task, at = text, "'at' anchor only applies to day and weekday units, ignoring");
                    None
                },
                Err(e) => {
                    warn!(task, at = text, "bad 'at' anchor, skipping schedule: {e}");
                    return None;
                },
            }
        },
        None => None,
    };

    debug!(task, interval, ?unit, ?at, "defined schedule");
    Some(Schedule { interval, unit, at })
}
