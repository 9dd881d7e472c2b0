// Management bridge: a job that invokes an operation on a managed object

use crate::context::JobExecutionContext;
use crate::data_map::DataMap;
use crate::errors::ManagementError;
use crate::job::{Job, JobExecutionError};
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::{error, info};

/// Data map key naming the managed object to call
pub const MGMT_OBJECTNAME: &str = "MGMT_OBJECTNAME";
/// Data map key naming the operation to invoke
pub const MGMT_METHOD: &str = "MGMT_METHOD";
/// Data map key holding `tag:key` parameter definitions, comma separated
pub const MGMT_PARAMDEFS: &str = "MGMT_PARAMDEFS";

/// A typed invocation argument.
///
/// Lowercase tags decode to primitives and uppercase tags to their boxed
/// counterparts; the distinction only changes the reported signature.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Int(i32),
    IntObj(i32),
    Long(i64),
    LongObj(i64),
    Float(f32),
    FloatObj(f32),
    Double(f64),
    DoubleObj(f64),
    String(String),
    Bool(bool),
    BoolObj(bool),
}

impl ParamValue {
    /// Decode `raw` according to a one-character type tag.
    pub fn decode(tag: char, raw: &str) -> Result<Self, ManagementError> {
        let invalid = |reason: String| ManagementError::InvalidValue {
            tag,
            value: raw.to_string(),
            reason,
        };
        let value = match tag {
            'i' => ParamValue::Int(raw.parse().map_err(|e| invalid(format!("{e}")))?),
            'I' => ParamValue::IntObj(raw.parse().map_err(|e| invalid(format!("{e}")))?),
            'l' => ParamValue::Long(raw.parse().map_err(|e| invalid(format!("{e}")))?),
            'L' => ParamValue::LongObj(raw.parse().map_err(|e| invalid(format!("{e}")))?),
            'f' => ParamValue::Float(raw.trim().parse().map_err(|e| invalid(format!("{e}")))?),
            'F' => ParamValue::FloatObj(raw.trim().parse().map_err(|e| invalid(format!("{e}")))?),
            'd' => ParamValue::Double(raw.trim().parse().map_err(|e| invalid(format!("{e}")))?),
            'D' => ParamValue::DoubleObj(raw.trim().parse().map_err(|e| invalid(format!("{e}")))?),
            's' => ParamValue::String(raw.to_string()),
            // Anything but "true" (any case) is false
            'b' => ParamValue::Bool(raw.eq_ignore_ascii_case("true")),
            'B' => ParamValue::BoolObj(raw.eq_ignore_ascii_case("true")),
            other => return Err(ManagementError::UnknownTypeTag(other)),
        };
        Ok(value)
    }

    /// Type name reported alongside the argument.
    pub fn type_name(&self) -> &'static str {
        match self {
            ParamValue::Int(_) => "int",
            ParamValue::IntObj(_) => "Integer",
            ParamValue::Long(_) => "long",
            ParamValue::LongObj(_) => "Long",
            ParamValue::Float(_) => "float",
            ParamValue::FloatObj(_) => "Float",
            ParamValue::Double(_) => "double",
            ParamValue::DoubleObj(_) => "Double",
            ParamValue::String(_) => "String",
            ParamValue::Bool(_) => "boolean",
            ParamValue::BoolObj(_) => "Boolean",
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Int(v) | ParamValue::IntObj(v) => write!(f, "{v}"),
            ParamValue::Long(v) | ParamValue::LongObj(v) => write!(f, "{v}"),
            ParamValue::Float(v) | ParamValue::FloatObj(v) => write!(f, "{v}"),
            ParamValue::Double(v) | ParamValue::DoubleObj(v) => write!(f, "{v}"),
            ParamValue::String(v) => f.write_str(v),
            ParamValue::Bool(v) | ParamValue::BoolObj(v) => write!(f, "{v}"),
        }
    }
}

/// One `tag:key` entry of a parameter definition list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamDef {
    pub tag: char,
    pub key: String,
}

/// Parse `"i:countKey,s:nameKey"` into definitions. Empty segments are
/// skipped; a segment without both a tag and a key is an error.
pub fn parse_param_defs(defs: &str) -> Result<Vec<ParamDef>, ManagementError> {
    defs.split(',')
        .filter(|segment| !segment.is_empty())
        .map(|segment| {
            let mut parts = segment.split(':').filter(|p| !p.is_empty());
            match (parts.next(), parts.next()) {
                (Some(tag), Some(key)) => {
                    let tag = tag
                        .chars()
                        .next()
                        .ok_or_else(|| ManagementError::InvalidParamDef(segment.to_string()))?;
                    Ok(ParamDef {
                        tag,
                        key: key.to_string(),
                    })
                }
                _ => Err(ManagementError::InvalidParamDef(segment.to_string())),
            }
        })
        .collect()
}

/// Resolve each definition's key in `data` and decode it.
pub fn resolve_params(defs: &[ParamDef], data: &DataMap) -> Result<Vec<ParamValue>, ManagementError> {
    defs.iter()
        .map(|def| {
            let raw = data
                .get_as_string(&def.key)
                .ok_or_else(|| ManagementError::MissingParameter(def.key.clone()))?;
            ParamValue::decode(def.tag, &raw)
        })
        .collect()
}

/// Performs the actual call on a managed object
#[async_trait]
pub trait ManagedObjectInvoker: Send + Sync {
    async fn invoke(
        &self,
        object_name: &str,
        method: &str,
        params: &[ParamValue],
    ) -> Result<Value, ManagementError>;
}

/// Job that reads an object name, operation and typed arguments from its
/// merged data map, invokes the operation and stores the return value as
/// the execution result.
pub struct InvokerJob {
    invoker: Arc<dyn ManagedObjectInvoker>,
}

impl InvokerJob {
    pub fn new(invoker: Arc<dyn ManagedObjectInvoker>) -> Self {
        Self { invoker }
    }

    async fn invoke(&self, data: &DataMap) -> Result<Value, ManagementError> {
        let params = match data.get_as_string(MGMT_PARAMDEFS) {
            Some(defs) => resolve_params(&parse_param_defs(&defs)?, data)?,
            None => Vec::new(),
        };

        let (Some(object_name), Some(method)) =
            (data.get_as_string(MGMT_OBJECTNAME), data.get_as_string(MGMT_METHOD))
        else {
            return Err(ManagementError::MissingParameter(format!(
                "{} and {} are required",
                MGMT_OBJECTNAME, MGMT_METHOD
            )));
        };

        info!(object = %object_name, method = %method, params = params.len(), "Invoking managed operation");
        self.invoker.invoke(&object_name, &method, &params).await
    }
}

#[async_trait]
impl Job for InvokerJob {
    async fn execute(&self, ctx: &mut JobExecutionContext) -> Result<(), JobExecutionError> {
        match self.invoke(ctx.merged_job_data_map()).await {
            Ok(result) => {
                ctx.set_result(result);
                Ok(())
            }
            Err(e) => {
                let message = format!("Caught a {} error : {}", e.kind(), e);
                error!(error = %message, "Managed operation failed");
                Err(JobExecutionError::from_source(message, e).with_refire_immediately(false))
            }
        }
    }
}
