//! Provisioner abstraction for declarative stacks
//!
//! A [`Provisioner`] applies a stack described by a [`StackConfig`] and
//! reports its named outputs, and destroys it again afterwards. Re-applying
//! the same config is not guaranteed to be idempotent; the pipeline applies
//! exactly once per run.
//!
//! # Implementations
//!
//! - [`TerraformProvisioner`] - drives the terraform CLI

mod terraform;

pub use terraform::TerraformProvisioner;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::de::DeserializeOwned;

#[cfg(test)]
use mockall::automock;

use crate::{Error, Result};

/// Trait abstracting stack provisioning
///
/// This trait allows running the pipeline against a fake provisioner in tests
/// while production runs shell out to the real tool.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Create the stack's resources and return its outputs
    ///
    /// Fails with [`Error::Provision`] when the underlying tool reports a
    /// non-success status. Resources may be partially created on failure.
    async fn apply(&self, config: &StackConfig) -> Result<StackOutputs>;

    /// Destroy whatever the stack created, best effort
    async fn destroy(&self, config: &StackConfig) -> Result<()>;
}

/// Immutable parameters for one stack.
#[derive(Clone, Debug, PartialEq)]
pub struct StackConfig {
    dir: PathBuf,
    vars: BTreeMap<String, serde_json::Value>,
}

impl StackConfig {
    /// Create a config for the stack definition in `dir`
    pub fn new(dir: impl Into<PathBuf>, vars: BTreeMap<String, serde_json::Value>) -> Self {
        Self {
            dir: dir.into(),
            vars,
        }
    }

    /// Directory holding the stack definition
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Parameter values keyed by name
    pub fn vars(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.vars
    }

    /// Render one parameter for the command line.
    ///
    /// Strings are passed raw; everything else as JSON, which terraform
    /// accepts for numbers, bools, lists and maps.
    pub fn render_var(value: &serde_json::Value) -> String {
        match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// Named outputs of an applied stack. Read-only once produced.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StackOutputs {
    values: BTreeMap<String, serde_json::Value>,
}

impl StackOutputs {
    /// Wrap already-decoded output values
    pub fn from_values(values: BTreeMap<String, serde_json::Value>) -> Self {
        Self { values }
    }

    /// Output as a string: strings unquoted, other values as compact JSON
    pub fn string(&self, name: &str) -> Result<String> {
        let value = self.value(name)?;
        Ok(StackConfig::render_var(value))
    }

    /// Output deserialized into `T`
    pub fn typed<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        let value = self.value(name)?.clone();
        serde_json::from_value(value).map_err(|e| {
            Error::config(format!("stack output {} has unexpected shape: {}", name, e))
        })
    }

    /// Raw output value
    pub fn value(&self, name: &str) -> Result<&serde_json::Value> {
        self.values.get(name).ok_or_else(|| {
            Error::config(format!(
                "stack output {} not found (available: {})",
                name,
                self.names().collect::<Vec<_>>().join(", ")
            ))
        })
    }

    /// Output names
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// Number of outputs
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the stack produced no outputs
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn outputs() -> StackOutputs {
        StackOutputs::from_values(BTreeMap::from([
            ("eks_cluster_name".to_string(), json!("postgres-eks")),
            ("node_count".to_string(), json!(3)),
            ("subnets".to_string(), json!(["a", "b"])),
        ]))
    }

    #[test]
    fn string_outputs_are_unquoted() {
        assert_eq!(outputs().string("eks_cluster_name").unwrap(), "postgres-eks");
    }

    #[test]
    fn non_string_outputs_render_as_json() {
        assert_eq!(outputs().string("node_count").unwrap(), "3");
        assert_eq!(outputs().string("subnets").unwrap(), r#"["a","b"]"#);
    }

    #[test]
    fn typed_outputs_deserialize() {
        let subnets: Vec<String> = outputs().typed("subnets").unwrap();
        assert_eq!(subnets, vec!["a", "b"]);
        let count: u32 = outputs().typed("node_count").unwrap();
        assert_eq!(count, 3);

        let err = outputs().typed::<u32>("subnets").unwrap_err();
        assert!(err.to_string().contains("unexpected shape"));
    }

    #[test]
    fn missing_output_lists_available_names() {
        let err = outputs().string("vpc_id").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("vpc_id"));
        assert!(msg.contains("eks_cluster_name, node_count, subnets"));
    }

    #[test]
    fn render_var_passes_strings_raw() {
        assert_eq!(StackConfig::render_var(&json!("us-east-1")), "us-east-1");
        assert_eq!(StackConfig::render_var(&json!(true)), "true");
        assert_eq!(
            StackConfig::render_var(&json!({"env": "test"})),
            r#"{"env":"test"}"#
        );
    }
}
