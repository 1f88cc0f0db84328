//! Schema manager: reconciles declarative entity-schema config against the
//! backing store's JSON-schema validators and index sets.
//!
//! Reconciliation is idempotent and safe to run repeatedly with concurrent
//! writers: validator updates are atomic metadata commands and index
//! creation is idempotent. The backing store allows one index build per
//! collection at a time, so a build-in-progress response aborts all further
//! index mutations on that collection for the run.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::db::{DbError, EntityBackend, IndexModel};

/// "moderate" lets existing invalid documents pass on update, which makes
/// schema migration rollouts survivable; "strict" rejects them.
const DEFAULT_VALIDATION_LEVEL: &str = "moderate";

const MAX_INDEX_KEYS: usize = 30;

const REGEX_LOWER_CASE: &str = r"^[a-z0-9\W_]+$";
const REGEX_RFC3339: &str =
    r"^\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(\.\d+)?([+-]\d{2}:\d{2}|Z)$";
const REGEX_INT64: &str =
    r"^(-?(0|[1-9]\d{0,18})|922337203685477580[0-7]|-9223372036854775808)$";

// ============================================================================
// CONFIG STRUCTURES
// ============================================================================

/// Schema configuration for all entity types. Decoupled from any concrete
/// database's DDL representation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaConfig {
    /// Entity types mapped to their validation configuration.
    #[serde(default)]
    pub entities: BTreeMap<String, EntitySchema>,

    /// Validation settings that are not specific to one entity.
    #[serde(default, rename = "config")]
    pub global: GlobalConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntitySchema {
    #[serde(default)]
    pub schema: Option<Schema>,
}

/// Field validation plus index definitions for one entity type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    #[serde(default)]
    pub fields: Vec<Field>,

    #[serde(default)]
    pub additional_properties: bool,

    #[serde(default)]
    pub indexes: Vec<Index>,

    #[serde(default)]
    pub validation_level: String,
}

/// One field in the schema. Only the name is required.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,

    /// string, int, bool, object, datetime, int-str, or bool-str.
    #[serde(default, rename = "type")]
    pub field_type: String,

    #[serde(default)]
    pub required: bool,

    /// Regex the value must match; overrides every other constraint.
    #[serde(default)]
    pub pattern: String,

    /// Case rule for this field; overrides the global case rule.
    #[serde(default)]
    pub case: Option<Case>,

    /// Closed set of valid values; strings only.
    #[serde(default, rename = "enum")]
    pub enum_values: Option<Vec<String>>,

    /// Fields that must also be present when this one is.
    #[serde(default)]
    pub dependents: Vec<String>,

    #[serde(default)]
    pub description: String,
}

/// Case rule. Only type "lower" is supported.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Case {
    #[serde(default)]
    pub strict: bool,

    #[serde(default, rename = "type")]
    pub case_type: String,
}

/// Index definition: 1-30 keys, optional per-key direction (+1/-1),
/// mutually exclusive unique and sparse.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Index {
    #[serde(default)]
    pub keys: Vec<String>,

    #[serde(default)]
    pub unique: bool,

    #[serde(default)]
    pub direction: Vec<i32>,

    #[serde(default)]
    pub sparse: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalConfig {
    #[serde(default)]
    pub schema: GlobalSchemaConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalSchemaConfig {
    #[serde(default)]
    pub case: Case,
}

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("no keys defined for index in {entity}")]
    NoKeysForIndex { entity: String },

    #[error("too many keys defined for index in {entity}; max is {MAX_INDEX_KEYS}")]
    TooManyKeysForIndex { entity: String },

    #[error("number of keys and directions do not match for index in {entity}")]
    KeysAndDirectionsDoNotMatch { entity: String },

    #[error("invalid direction for key(s) in index in {entity}; must be 1 or -1")]
    InvalidIndexDirection { entity: String },

    #[error("index in {entity} cannot be both sparse and unique")]
    IndexSparseAndUnique { entity: String },

    #[error("no indexes defined for {entity}; at least one index is required")]
    NoIndexes { entity: String },

    #[error("field {field} has unsupported type {field_type:?}")]
    InvalidFieldType { field: String, field_type: String },

    #[error("enum on field {field} of type {field_type:?}; enums are only supported for strings")]
    EnumNotString { field: String, field_type: String },

    #[error("field of type {field_type:?} has an empty name")]
    FieldNameEmpty { field_type: String },

    #[error("invalid validation level {level:?} for entity {entity}")]
    InvalidValidationLevel { entity: String, level: String },

    #[error("datasource error for {entity}: {source}")]
    Db {
        entity: String,
        #[source]
        source: DbError,
    },
}

// ============================================================================
// VALIDATOR DOCUMENT
// ============================================================================

/// Build the `$jsonSchema` validator document for one entity schema.
///
/// Per-field constraint priority: explicit pattern, then enum, then the
/// type-driven pattern (datetime / int-str / bool-str), then the case rule.
/// Case rules apply only to string fields and are ignored elsewhere.
pub fn json_schema_validator(
    schema: &Schema,
    global_case: &Case,
) -> Result<serde_json::Value, SchemaError> {
    let mut properties = serde_json::Map::new();
    // The backing store requires `required` to be present even when empty.
    let mut required: Vec<String> = Vec::new();
    let mut dependencies = serde_json::Map::new();

    for field in &schema.fields {
        if field.name.is_empty() {
            return Err(SchemaError::FieldNameEmpty {
                field_type: field.field_type.clone(),
            });
        }

        let backend_type = match field.field_type.as_str() {
            "string" | "bool" | "object" => field.field_type.as_str(),
            // The store's 64-bit integer type.
            "int" => "long",
            "datetime" | "int-str" | "bool-str" => "string",
            _ => {
                return Err(SchemaError::InvalidFieldType {
                    field: field.name.clone(),
                    field_type: field.field_type.clone(),
                })
            }
        };

        if field.field_type != "string" && field.enum_values.is_some() {
            return Err(SchemaError::EnumNotString {
                field: field.name.clone(),
                field_type: field.field_type.clone(),
            });
        }

        let mut field_schema = serde_json::Map::new();
        field_schema.insert("bsonType".to_string(), json!(backend_type));

        let effective_case = field.case.as_ref().unwrap_or(global_case);
        if !field.pattern.is_empty() {
            field_schema.insert("pattern".to_string(), json!(field.pattern));
        } else if field.enum_values.as_ref().is_some_and(|e| !e.is_empty()) {
            field_schema.insert("enum".to_string(), json!(field.enum_values));
        } else if field.field_type == "datetime" {
            // The store has no "format" keyword; a pattern stands in.
            field_schema.insert("pattern".to_string(), json!(REGEX_RFC3339));
        } else if field.field_type == "int-str" {
            field_schema.insert("pattern".to_string(), json!(REGEX_INT64));
        } else if field.field_type == "bool-str" {
            field_schema.insert("enum".to_string(), json!(["true", "false"]));
        } else if effective_case.strict && backend_type == "string" && effective_case.case_type == "lower"
        {
            field_schema.insert("pattern".to_string(), json!(REGEX_LOWER_CASE));
        }

        properties.insert(field.name.clone(), serde_json::Value::Object(field_schema));

        if field.required {
            required.push(field.name.clone());
        }
        if !field.dependents.is_empty() {
            dependencies.insert(field.name.clone(), json!(field.dependents));
        }
    }

    let mut json_schema = serde_json::Map::new();
    json_schema.insert("bsonType".to_string(), json!("object"));
    json_schema.insert("properties".to_string(), serde_json::Value::Object(properties));
    json_schema.insert("required".to_string(), json!(required));
    json_schema.insert(
        "additionalProperties".to_string(),
        json!(schema.additional_properties),
    );
    if !dependencies.is_empty() {
        json_schema.insert(
            "dependencies".to_string(),
            serde_json::Value::Object(dependencies),
        );
    }

    Ok(json!({ "$jsonSchema": json_schema }))
}

// ============================================================================
// INDEX NAMING
// ============================================================================

/// Deterministic index name: kind prefix, underscore-joined keys, then the
/// directions when they were explicit.
pub fn index_name(index: &Index) -> String {
    if index.keys.is_empty() {
        return String::new();
    }

    let prefix = if index.unique {
        "IL"
    } else if index.sparse {
        "SPARSE"
    } else {
        "SL"
    };

    if index.direction.is_empty() {
        return format!("{}_{}", prefix, index.keys.join("_"));
    }
    let directions: Vec<String> = index.direction.iter().map(|d| d.to_string()).collect();
    format!("{}_{}_{}", prefix, index.keys.join("_"), directions.join("_"))
}

fn validate_index(entity: &str, index: &Index) -> Result<(), SchemaError> {
    if index.keys.is_empty() {
        return Err(SchemaError::NoKeysForIndex {
            entity: entity.to_string(),
        });
    }
    if index.keys.len() > MAX_INDEX_KEYS {
        return Err(SchemaError::TooManyKeysForIndex {
            entity: entity.to_string(),
        });
    }
    if !index.direction.is_empty() && index.direction.len() != index.keys.len() {
        return Err(SchemaError::KeysAndDirectionsDoNotMatch {
            entity: entity.to_string(),
        });
    }
    if index.sparse && index.unique {
        return Err(SchemaError::IndexSparseAndUnique {
            entity: entity.to_string(),
        });
    }
    for direction in &index.direction {
        if *direction != 1 && *direction != -1 {
            return Err(SchemaError::InvalidIndexDirection {
                entity: entity.to_string(),
            });
        }
    }
    Ok(())
}

// ============================================================================
// MANAGER
// ============================================================================

pub struct SchemaManager {
    backend: Arc<dyn EntityBackend>,
    retries: u32,
    retry_wait: Duration,
}

impl SchemaManager {
    pub fn new(backend: Arc<dyn EntityBackend>) -> Self {
        Self {
            backend,
            retries: 5,
            retry_wait: Duration::from_secs(2),
        }
    }

    pub fn with_retry(mut self, retries: u32, retry_wait: Duration) -> Self {
        self.retries = retries;
        self.retry_wait = retry_wait;
        self
    }

    /// Reconcile with retries. The metadata-update command can transiently
    /// fail under concurrent writes; every operation is idempotent, so the
    /// whole pass is retried with a jittered wait.
    pub async fn reconcile_with_retry(&self, config: &SchemaConfig) -> Result<(), SchemaError> {
        let retries = self.retries.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.reconcile(config).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= retries => return Err(e),
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "schema reconcile failed");
                    let jitter =
                        Duration::from_millis(rand::thread_rng().gen_range(0..2000));
                    tokio::time::sleep(self.retry_wait + jitter).await;
                }
            }
        }
    }

    /// One reconciliation pass over every configured entity type.
    pub async fn reconcile(&self, config: &SchemaConfig) -> Result<(), SchemaError> {
        for (entity, entity_schema) in &config.entities {
            tracing::info!(entity = %entity, "reconciling schema");

            // No `schema` block: the owner bypasses validation entirely.
            // Remove the validator but leave the indexes alone in case they
            // are managed elsewhere.
            let Some(schema) = &entity_schema.schema else {
                tracing::info!(entity = %entity, "no schema defined, removing validator");
                self.backend
                    .remove_validator(entity)
                    .await
                    .map_err(|e| SchemaError::Db {
                        entity: entity.clone(),
                        source: e,
                    })?;
                continue;
            };

            self.update_indexes(entity, &schema.indexes).await?;
            self.update_validation(entity, schema, &config.global).await?;
        }
        tracing::info!("schema reconciled");
        Ok(())
    }

    async fn update_indexes(&self, entity: &str, indexes: &[Index]) -> Result<(), SchemaError> {
        // An entity that depends solely on full collection scans is assumed
        // to be a configuration mistake.
        if indexes.is_empty() {
            return Err(SchemaError::NoIndexes {
                entity: entity.to_string(),
            });
        }

        let mut declared: Vec<String> = Vec::new();
        for index in indexes {
            validate_index(entity, index)?;
            let name = index_name(index);
            let model = IndexModel {
                name: name.clone(),
                keys: index.keys.clone(),
                unique: index.unique,
                sparse: index.sparse,
            };
            match self.backend.ensure_index(entity, &model).await {
                Ok(()) => declared.push(name),
                Err(DbError::IndexBuildInProgress { .. }) => {
                    // One build at a time per collection; no further index
                    // mutations on this collection this run.
                    tracing::warn!(
                        entity = %entity,
                        index = %name,
                        "index build in progress, skipping remaining index work"
                    );
                    return Ok(());
                }
                Err(e) => {
                    return Err(SchemaError::Db {
                        entity: entity.to_string(),
                        source: e,
                    })
                }
            }
        }

        // Existing indexes that are neither declared nor system indexes are
        // obsolete and dropped.
        let existing = self
            .backend
            .list_indexes(entity)
            .await
            .map_err(|e| SchemaError::Db {
                entity: entity.to_string(),
                source: e,
            })?;
        for name in existing {
            if declared.contains(&name) || name.starts_with('_') {
                continue;
            }
            tracing::warn!(entity = %entity, index = %name, "dropping index not in schema");
            match self.backend.drop_index(entity, &name).await {
                Ok(()) => {}
                // Another process may have dropped it first.
                Err(DbError::Other(msg)) if msg.contains("index not found") => {}
                Err(e) => {
                    return Err(SchemaError::Db {
                        entity: entity.to_string(),
                        source: e,
                    })
                }
            }
        }

        Ok(())
    }

    async fn update_validation(
        &self,
        entity: &str,
        schema: &Schema,
        global: &GlobalConfig,
    ) -> Result<(), SchemaError> {
        // Fields absent: `schema` only manages the indexes.
        if schema.fields.is_empty() {
            tracing::info!(entity = %entity, "no schema fields, removing validator");
            return self
                .backend
                .remove_validator(entity)
                .await
                .map_err(|e| SchemaError::Db {
                    entity: entity.to_string(),
                    source: e,
                });
        }

        let validator = json_schema_validator(schema, &global.schema.case)?;

        let level = match schema.validation_level.as_str() {
            "" => DEFAULT_VALIDATION_LEVEL,
            "moderate" | "strict" => schema.validation_level.as_str(),
            other => {
                return Err(SchemaError::InvalidValidationLevel {
                    entity: entity.to_string(),
                    level: other.to_string(),
                })
            }
        };

        self.backend
            .set_validator(entity, validator, level)
            .await
            .map_err(|e| SchemaError::Db {
                entity: entity.to_string(),
                source: e,
            })
    }
}
