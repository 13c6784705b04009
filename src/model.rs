//! Typed resource models.
//!
//! A model is a serde type that also knows its own [`ModelSchema`], which
//! lets the runtime recast the string-encoded properties CloudFormation
//! sends before deserializing them. Implementations are normally generated
//! with `#[derive(CfnModel)]`.

use std::sync::OnceLock;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{ExtensionError, ExtensionResult};
use crate::recast::{recast_object, ModelSchema};

/// A resource model or type configuration that can be built from a raw
/// CloudFormation payload.
///
/// # Examples
///
/// ```
/// use cfn_extension_runtime::{CfnModel, Model};
/// use serde::{Deserialize, Serialize};
/// use serde_json::json;
///
/// #[derive(Debug, Serialize, Deserialize, CfnModel)]
/// #[serde(rename_all = "PascalCase")]
/// struct Bucket {
///     name: Option<String>,
///     versioned: Option<bool>,
/// }
///
/// let bucket = Bucket::from_raw(json!({"Name": "logs", "Versioned": "true"}))
///     .unwrap()
///     .unwrap();
/// assert_eq!(bucket.versioned, Some(true));
/// ```
pub trait Model: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Returns the structural description of this model.
    fn schema() -> &'static ModelSchema;

    /// Converts string-encoded properties of a raw payload to their declared types.
    fn recast(raw: &mut Value) -> ExtensionResult<()> {
        recast_object(Self::schema(), raw)
    }

    /// Builds the model from a raw payload.
    ///
    /// Returns `Ok(None)` for a JSON null, which CloudFormation sends when a
    /// model is absent.
    ///
    /// # Errors
    ///
    /// Returns an `InvalidRequest` error if the payload cannot be recast or
    /// does not match the model.
    fn from_raw(mut raw: Value) -> ExtensionResult<Option<Self>> {
        if raw.is_null() {
            return Ok(None);
        }
        Self::recast(&mut raw)?;
        serde_json::from_value(raw)
            .map(Some)
            .map_err(|e| ExtensionError::invalid_request(e.to_string()))
    }

    /// Serializes the model with null properties removed.
    fn to_wire(&self) -> ExtensionResult<Value> {
        let mut value = serde_json::to_value(self)?;
        strip_nulls(&mut value);
        Ok(value)
    }
}

impl Model for Value {
    fn schema() -> &'static ModelSchema {
        static SCHEMA: OnceLock<ModelSchema> = OnceLock::new();
        SCHEMA.get_or_init(|| ModelSchema::new("Value", Vec::new()))
    }

    fn recast(_raw: &mut Value) -> ExtensionResult<()> {
        Ok(())
    }
}

/// Removes null-valued properties from every object in `value`, recursively.
pub fn strip_nulls(value: &mut Value) {
    match value {
        Value::Object(fields) => {
            fields.retain(|_, v| !v.is_null());
            fields.values_mut().for_each(strip_nulls);
        }
        Value::Array(items) => items.iter_mut().for_each(strip_nulls),
        _ => {}
    }
}
