//! Terraform-backed provisioner
//!
//! Runs `init` + `apply`, then reads `output -json`. Failures whose output
//! matches a known-transient pattern are retried with a fixed delay; all
//! others fail the stage immediately.

use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{info, warn};

use super::{Provisioner, StackConfig, StackOutputs};
use crate::command::run_command;
use crate::config::{
    compile_patterns, StackSection, DEFAULT_COMMAND_TIMEOUT, DEFAULT_PROVISION_RETRIES,
    DEFAULT_PROVISION_RETRY_DELAY, DEFAULT_RETRYABLE_ERRORS, DEFAULT_TERRAFORM_BINARY,
};
use crate::{Error, Result};

/// One entry of `terraform output -json`
#[derive(Debug, Deserialize)]
struct OutputEntry {
    value: serde_json::Value,
}

/// Provisioner that shells out to terraform
#[derive(Clone, Debug)]
pub struct TerraformProvisioner {
    binary: String,
    command_timeout: Duration,
    max_retries: u32,
    retry_delay: Duration,
    retryable_errors: Vec<Regex>,
}

impl Default for TerraformProvisioner {
    fn default() -> Self {
        Self {
            binary: DEFAULT_TERRAFORM_BINARY.to_string(),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            max_retries: DEFAULT_PROVISION_RETRIES,
            retry_delay: DEFAULT_PROVISION_RETRY_DELAY,
            retryable_errors: compile_patterns(DEFAULT_RETRYABLE_ERRORS).unwrap_or_default(),
        }
    }
}

impl TerraformProvisioner {
    /// Build from the `stack` section of a harness file
    pub fn from_section(section: &StackSection) -> Result<Self> {
        Ok(Self {
            binary: section.binary.clone(),
            command_timeout: section.command_timeout,
            max_retries: section.max_retries,
            retry_delay: section.retry_delay,
            retryable_errors: compile_patterns(&section.retryable_errors)?,
        })
    }

    /// Use a different terraform binary (e.g. `tofu`)
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Change the retry budget for transient failures
    pub fn with_retries(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = retry_delay;
        self
    }

    fn retryable_match(&self, output: &str) -> Option<&Regex> {
        self.retryable_errors.iter().find(|re| re.is_match(output))
    }

    fn var_args(config: &StackConfig) -> Vec<String> {
        config
            .vars()
            .iter()
            .flat_map(|(name, value)| {
                [
                    "-var".to_string(),
                    format!("{}={}", name, StackConfig::render_var(value)),
                ]
            })
            .collect()
    }

    /// Run one terraform stage, retrying known-transient failures
    async fn run(&self, stage: &str, config: &StackConfig, args: &[String]) -> Result<String> {
        let description = format!("{} {} (dir={})", self.binary, stage, config.dir().display());
        let mut retries = 0u32;

        loop {
            let mut cmd = Command::new(&self.binary);
            cmd.args(args)
                .current_dir(config.dir())
                .env("TF_IN_AUTOMATION", "1")
                .env("TF_INPUT", "0");

            let output = run_command(&mut cmd, &description, self.command_timeout)
                .await
                .map_err(|e| Error::provision(stage, e))?;

            if output.success {
                return Ok(output.stdout);
            }

            let combined = output.combined();
            match self.retryable_match(&combined) {
                Some(pattern) if retries < self.max_retries => {
                    retries += 1;
                    warn!(
                        stage = %stage,
                        retry = retries,
                        max_retries = self.max_retries,
                        pattern = %pattern,
                        delay_ms = self.retry_delay.as_millis(),
                        "Retryable provisioner error, retrying"
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
                Some(_) => {
                    return Err(Error::provision(
                        stage,
                        format!(
                            "still failing after {} retries: {}",
                            retries,
                            output.stderr.trim()
                        ),
                    ));
                }
                None => return Err(Error::provision(stage, output.stderr.trim())),
            }
        }
    }
}

/// Parse `terraform output -json`
fn parse_outputs(raw: &str) -> Result<StackOutputs> {
    let entries: std::collections::BTreeMap<String, OutputEntry> = serde_json::from_str(raw)
        .map_err(|e| Error::provision("output", format!("invalid output JSON: {}", e)))?;

    Ok(StackOutputs::from_values(
        entries
            .into_iter()
            .map(|(name, entry)| (name, entry.value))
            .collect(),
    ))
}

#[async_trait]
impl Provisioner for TerraformProvisioner {
    async fn apply(&self, config: &StackConfig) -> Result<StackOutputs> {
        let init = ["init", "-input=false", "-no-color"].map(String::from);
        self.run("init", config, &init).await?;

        let mut apply: Vec<String> = ["apply", "-auto-approve", "-input=false", "-no-color"]
            .map(String::from)
            .to_vec();
        apply.extend(Self::var_args(config));
        self.run("apply", config, &apply).await?;

        let output = ["output", "-json", "-no-color"].map(String::from);
        let raw = self.run("output", config, &output).await?;
        let outputs = parse_outputs(&raw)?;

        info!(
            dir = %config.dir().display(),
            outputs = outputs.len(),
            "Stack applied"
        );
        Ok(outputs)
    }

    async fn destroy(&self, config: &StackConfig) -> Result<()> {
        let mut destroy: Vec<String> = ["destroy", "-auto-approve", "-input=false", "-no-color"]
            .map(String::from)
            .to_vec();
        destroy.extend(Self::var_args(config));

        self.run("destroy", config, &destroy)
            .await
            .map_err(|e| Error::teardown(e.to_string()))?;

        info!(dir = %config.dir().display(), "Stack destroyed");
        Ok(())
    }
}
