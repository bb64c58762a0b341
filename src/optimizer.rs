use crate::config::Optimizer as OptimizerConfig;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptimizeOutcome {
    pub bytes_before: i64,
    pub bytes_after: i64,
}

impl OptimizeOutcome {
    pub fn saved(&self) -> i64 {
        (self.bytes_before - self.bytes_after).max(0)
    }
}

/// Rewrites an image in place, smaller if it can.
#[async_trait]
pub trait ImageOptimizer: Send + Sync {
    async fn optimize(&self, path: &Path) -> Result<OptimizeOutcome>;
}

/// Runs a configured optimizer binary against each file.
#[derive(Debug, Clone)]
pub struct CommandOptimizer {
    command: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandOptimizer {
    /// `None` when no optimizer command is configured.
    pub fn from_config(cfg: &OptimizerConfig) -> Option<Self> {
        let command = cfg.command.as_ref()?.trim().to_string();
        Some(Self {
            command,
            args: cfg.args.clone(),
            timeout: Duration::from_secs(cfg.timeout_secs.max(1)),
        })
    }

    /// Ensure the binary can be spawned by invoking it with `--version`.
    pub async fn ensure_available(&self) -> Result<()> {
        let status = Command::new(&self.command)
            .arg("--version")
            .kill_on_drop(true)
            .status()
            .await;
        match status {
            Ok(s) if s.success() => Ok(()),
            Ok(s) => Err(anyhow!("{} not available (exit status {})", self.command, s)),
            Err(e) => Err(anyhow!("{} not available: {}", self.command, e)),
        }
    }

    fn build_args(&self, path: &Path) -> Vec<OsString> {
        let mut substituted = false;
        let mut args: Vec<OsString> = self
            .args
            .iter()
            .map(|arg| {
                if arg == "{file}" {
                    substituted = true;
                    path.as_os_str().to_os_string()
                } else {
                    OsString::from(arg)
                }
            })
            .collect();
        if !substituted {
            args.push(path.as_os_str().to_os_string());
        }
        args
    }
}

#[async_trait]
impl ImageOptimizer for CommandOptimizer {
    async fn optimize(&self, path: &Path) -> Result<OptimizeOutcome> {
        let bytes_before = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("failed to stat {}", path.display()))?
            .len() as i64;

        let child = Command::new(&self.command)
            .args(self.build_args(path))
            .kill_on_drop(true)
            .status();
        let status = tokio::time::timeout(self.timeout, child)
            .await
            .map_err(|_| {
                anyhow!(
                    "{} timed out after {:?} for {}",
                    self.command,
                    self.timeout,
                    path.display()
                )
            })?
            .with_context(|| format!("failed to spawn {} for {}", self.command, path.display()))?;

        if !status.success() {
            return Err(anyhow!(
                "{} exited with status {} for {}",
                self.command,
                status,
                path.display()
            ));
        }

        let bytes_after = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("optimized file vanished: {}", path.display()))?
            .len() as i64;
        Ok(OptimizeOutcome {
            bytes_before,
            bytes_after,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn optimizer(args: &[&str]) -> CommandOptimizer {
        CommandOptimizer::from_config(&OptimizerConfig {
            command: Some("jpegoptim".into()),
            args: args.iter().map(|s| s.to_string()).collect(),
            timeout_secs: 5,
        })
        .unwrap()
    }

    #[test]
    fn substitutes_file_placeholder() {
        let path = PathBuf::from("/tmp/a.jpg");
        let args = optimizer(&["--max=85", "{file}", "--quiet"]).build_args(&path);
        assert_eq!(args, vec!["--max=85", "/tmp/a.jpg", "--quiet"]);
    }

    #[test]
    fn appends_file_without_placeholder() {
        let path = PathBuf::from("/tmp/a.jpg");
        let args = optimizer(&["-o2"]).build_args(&path);
        assert_eq!(args, vec!["-o2", "/tmp/a.jpg"]);
    }

    #[test]
    fn unconfigured_optimizer_is_none() {
        assert!(CommandOptimizer::from_config(&OptimizerConfig::default()).is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn runs_command_and_measures_sizes() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.jpg");
        tokio::fs::write(&file, vec![0u8; 64]).await.unwrap();
        // `truncate -s 16 <file>` stands in for a real optimizer.
        let opt = CommandOptimizer::from_config(&OptimizerConfig {
            command: Some("truncate".into()),
            args: vec!["-s".into(), "16".into(), "{file}".into()],
            timeout_secs: 5,
        })
        .unwrap();
        let outcome = opt.optimize(&file).await.unwrap();
        assert_eq!(outcome.bytes_before, 64);
        assert_eq!(outcome.bytes_after, 16);
        assert_eq!(outcome.saved(), 48);
    }
}
