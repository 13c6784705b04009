//! Recasting of string-encoded payloads into their declared types.
//!
//! CloudFormation transmits every primitive property as a string, even
//! booleans and numbers. Each model carries a [`ModelSchema`] describing the
//! declared type of its fields, and [`recast_object`] walks a decoded JSON
//! object with that schema, converting strings back to native JSON values in
//! place so that the model can be deserialized with serde.
//!
//! Recasting an already recast value is a no-op.

use std::fmt;

use serde_json::{Map, Number, Value};

use crate::error::{ExtensionError, ExtensionResult};

/// Declared type of a model field.
#[derive(Clone)]
pub enum FieldType {
    /// Untyped; the value passes through untouched
    Any,
    /// `true` / `false`
    Bool,
    /// Integer number
    Int,
    /// Floating point number
    Float,
    /// String
    Str,
    /// Ordered list of the inner type
    List(Box<FieldType>),
    /// Duplicate-free collection of the inner type
    Set(Box<FieldType>),
    /// String-keyed map with values of the inner type
    Map(Box<FieldType>),
    /// Nested model, resolved lazily so models can refer to themselves
    Model(fn() -> &'static ModelSchema),
    /// Optional value of the inner type
    Optional(Box<FieldType>),
    /// Union of alternatives; only a single alternative can be recast
    Union(Vec<FieldType>),
    /// A type the schema generator could not resolve
    Unresolved(&'static str),
}

impl FieldType {
    /// Shorthand for `FieldType::List(Box::new(inner))`.
    pub fn list(inner: FieldType) -> Self {
        Self::List(Box::new(inner))
    }

    /// Shorthand for `FieldType::Set(Box::new(inner))`.
    pub fn set(inner: FieldType) -> Self {
        Self::Set(Box::new(inner))
    }

    /// Shorthand for `FieldType::Map(Box::new(inner))`.
    pub fn map(inner: FieldType) -> Self {
        Self::Map(Box::new(inner))
    }

    /// Shorthand for `FieldType::Optional(Box::new(inner))`.
    pub fn optional(inner: FieldType) -> Self {
        Self::Optional(Box::new(inner))
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => write!(f, "Any"),
            Self::Bool => write!(f, "bool"),
            Self::Int => write!(f, "int"),
            Self::Float => write!(f, "float"),
            Self::Str => write!(f, "str"),
            Self::List(inner) => write!(f, "List[{}]", inner),
            Self::Set(inner) => write!(f, "Set[{}]", inner),
            Self::Map(inner) => write!(f, "Map[str, {}]", inner),
            Self::Model(schema) => write!(f, "{}", schema().name),
            Self::Optional(inner) => write!(f, "Optional[{}]", inner),
            Self::Union(alternatives) => {
                write!(f, "Union[")?;
                for (i, alternative) in alternatives.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", alternative)?;
                }
                write!(f, "]")
            }
            Self::Unresolved(name) => write!(f, "{}", name),
        }
    }
}

impl fmt::Debug for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// A single field of a model: its wire name and declared type.
#[derive(Debug, Clone)]
pub struct FieldSchema {
    /// Property name as it appears on the wire
    pub name: &'static str,
    /// Declared type of the property
    pub field_type: FieldType,
}

impl FieldSchema {
    /// Creates a new field description.
    pub fn new(name: &'static str, field_type: FieldType) -> Self {
        Self { name, field_type }
    }
}

/// Structural type descriptor of a model.
///
/// Usually generated by `#[derive(CfnModel)]`.
#[derive(Debug, Clone)]
pub struct ModelSchema {
    /// Model type name, used in error messages
    pub name: &'static str,
    /// Declared fields of the model
    pub fields: Vec<FieldSchema>,
}

impl ModelSchema {
    /// Creates a new schema.
    pub fn new(name: &'static str, fields: Vec<FieldSchema>) -> Self {
        Self { name, fields }
    }

    /// Looks up a field by wire name.
    pub fn field(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.iter().find(|field| field.name == name)
    }
}

/// Returns the JSON kind of a value, for error messages.
fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Recasts every declared field of a JSON object in place.
///
/// Properties the schema does not declare are left untouched.
///
/// # Errors
///
/// Returns an `InvalidRequest` error if `data` is not an object, or if any
/// declared field cannot be converted to its type.
///
/// # Examples
///
/// ```
/// use cfn_extension_runtime::recast::{recast_object, FieldSchema, FieldType, ModelSchema};
/// use serde_json::json;
///
/// let schema = ModelSchema::new(
///     "Bucket",
///     vec![
///         FieldSchema::new("Versioned", FieldType::Bool),
///         FieldSchema::new("Ports", FieldType::list(FieldType::Int)),
///     ],
/// );
/// let mut payload = json!({"Versioned": "TRUE", "Ports": ["80", "443"]});
/// recast_object(&schema, &mut payload).unwrap();
/// assert_eq!(payload, json!({"Versioned": true, "Ports": [80, 443]}));
/// ```
pub fn recast_object(schema: &ModelSchema, data: &mut Value) -> ExtensionResult<()> {
    let Value::Object(fields) = data else {
        return Err(ExtensionError::invalid_request(format!(
            "Can only parse dict items, not {}",
            json_type(data)
        )));
    };
    recast_fields(schema, fields)
}

fn recast_fields(schema: &ModelSchema, fields: &mut Map<String, Value>) -> ExtensionResult<()> {
    for (key, value) in fields.iter_mut() {
        if let Some(field) = schema.field(key) {
            recast_value(key, &field.field_type, value)?;
        }
    }
    Ok(())
}

/// Recasts a single value against its declared type, recursing into
/// nested models and collections.
///
/// `key` names the enclosing field and is only used in error messages.
pub fn recast_value(key: &str, field_type: &FieldType, value: &mut Value) -> ExtensionResult<()> {
    let field_type = resolve(key, field_type)?;

    match (field_type, &mut *value) {
        (FieldType::Any, _) | (_, Value::Null) => Ok(()),
        (FieldType::Model(schema), Value::Object(fields)) => recast_fields(schema(), fields),
        (FieldType::Map(inner), Value::Object(entries)) => {
            for entry in entries.values_mut() {
                recast_value(key, inner, entry)?;
            }
            Ok(())
        }
        (FieldType::List(inner), Value::Array(items)) => {
            for item in items.iter_mut() {
                recast_value(key, inner, item)?;
            }
            Ok(())
        }
        (FieldType::Set(inner), Value::Array(items)) => {
            for item in items.iter_mut() {
                recast_value(key, inner, item)?;
            }
            dedup_in_place(items);
            Ok(())
        }
        (primitive, Value::String(raw)) if is_primitive(primitive) => {
            let cast = recast_primitive(primitive, key, raw)?;
            *value = cast;
            Ok(())
        }
        (FieldType::Bool, Value::Bool(_)) => Ok(()),
        (FieldType::Int, Value::Number(n)) if n.is_i64() || n.is_u64() => Ok(()),
        (FieldType::Float, Value::Number(_)) => Ok(()),
        (FieldType::Str, Value::Number(n)) => {
            *value = Value::String(n.to_string());
            Ok(())
        }
        (FieldType::Str, Value::Bool(b)) => {
            *value = Value::String(b.to_string());
            Ok(())
        }
        (_, other) => Err(ExtensionError::invalid_request(format!(
            "Unsupported type: {} for {}",
            json_type(other),
            key
        ))),
    }
}

fn is_primitive(field_type: &FieldType) -> bool {
    matches!(
        field_type,
        FieldType::Bool | FieldType::Int | FieldType::Float | FieldType::Str
    )
}

static ANY: FieldType = FieldType::Any;

/// Unwraps optionals and single-alternative unions down to a concrete type.
fn resolve<'a>(key: &str, field_type: &'a FieldType) -> ExtensionResult<&'a FieldType> {
    match field_type {
        FieldType::Optional(inner) => resolve(key, inner),
        FieldType::Union(alternatives) => {
            if alternatives.iter().any(|alt| matches!(alt, FieldType::Any)) {
                return Ok(&ANY);
            }
            match alternatives.as_slice() {
                [single] => resolve(key, single),
                _ => Err(ExtensionError::invalid_request(format!(
                    "Cannot process type {} for field {}",
                    field_type, key
                ))),
            }
        }
        FieldType::Unresolved(_) => Err(ExtensionError::invalid_request(format!(
            "Cannot process type {} for field {}",
            field_type, key
        ))),
        other => Ok(other),
    }
}

/// Converts a string to the declared primitive type.
///
/// Boolean casting accepts `"true"` and `"false"` in any case.
pub fn recast_primitive(field_type: &FieldType, key: &str, raw: &str) -> ExtensionResult<Value> {
    match field_type {
        FieldType::Bool => match raw.to_ascii_lowercase().as_str() {
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            _ => Err(ExtensionError::invalid_request(format!(
                "value for {} \"{}\" is not boolean",
                key, raw
            ))),
        },
        FieldType::Int => {
            let trimmed = raw.trim();
            if let Ok(n) = trimmed.parse::<i64>() {
                Ok(Value::Number(n.into()))
            } else if let Ok(n) = trimmed.parse::<u64>() {
                Ok(Value::Number(n.into()))
            } else {
                Err(ExtensionError::invalid_request(format!(
                    "value for {} \"{}\" is not an integer",
                    key, raw
                )))
            }
        }
        FieldType::Float => raw
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| {
                ExtensionError::invalid_request(format!(
                    "value for {} \"{}\" is not a number",
                    key, raw
                ))
            }),
        FieldType::Str => Ok(Value::String(raw.to_string())),
        other => Err(ExtensionError::invalid_request(format!(
            "Cannot process type {} for field {}",
            other, key
        ))),
    }
}

/// Removes repeated elements, keeping the first occurrence of each.
fn dedup_in_place(items: &mut Vec<Value>) {
    let mut unique: Vec<Value> = Vec::with_capacity(items.len());
    for item in items.drain(..) {
        if !unique.contains(&item) {
            unique.push(item);
        }
    }
    *items = unique;
}
