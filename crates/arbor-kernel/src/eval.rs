//! Expression evaluation for `=program` configuration values.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;

/// Turns a program into a value, e.g. `=hostname` into `node17`.
#[async_trait]
pub trait Evaluator: Send + Sync {
    async fn eval(&self, program: &str) -> Result<String>;
}

/// Refuses every program. The default when no evaluator is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoEvaluator;

#[async_trait]
impl Evaluator for NoEvaluator {
    async fn eval(&self, program: &str) -> Result<String> {
        bail!("no evaluator configured for '={program}'")
    }
}

/// Runs the program with `sh -c` and takes its trimmed stdout.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShellEvaluator;

#[async_trait]
impl Evaluator for ShellEvaluator {
    async fn eval(&self, program: &str) -> Result<String> {
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(program)
            .stdin(std::process::Stdio::null())
            .output()
            .await
            .with_context(|| format!("running '{program}'"))?;

        if !output.status.success() {
            bail!(
                "'{}' failed ({}): {}",
                program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Evaluate `value` if it is a `=program`, otherwise return it unchanged.
pub async fn resolve_value(value: &str, evaluator: &dyn Evaluator) -> Result<String> {
    match value.strip_prefix('=') {
        Some(program) => evaluator.eval(program).await,
        None => Ok(value.to_string()),
    }
}
