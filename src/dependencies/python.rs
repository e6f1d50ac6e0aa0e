//! Command-backed collaborators: probe, pip install and kernel spec listing
//! against a concrete interpreter.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::Path;
use std::process::Output;
use std::time::Duration;
use tokio::process::Command;

use super::{InstallOutcome, KernelSpecVerifier, Package, PackageInstaller, PackageProbe};
use crate::environment::InterpreterRef;
use crate::utils::apply_creation_flags;

/// 헬퍼 명령 기본 타임아웃
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// pip 설치는 오래 걸릴 수 있으므로 별도 상한
pub const DEFAULT_INSTALL_TIMEOUT: Duration = Duration::from_secs(600);

/// `python -c "import <module>"`; exit 0 means present.
pub struct PythonPackageProbe {
    timeout: Duration,
}

impl PythonPackageProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for PythonPackageProbe {
    fn default() -> Self {
        Self::new(DEFAULT_COMMAND_TIMEOUT)
    }
}

#[async_trait]
impl PackageProbe for PythonPackageProbe {
    async fn is_installed(&self, package: Package, interpreter: &InterpreterRef) -> Result<bool> {
        let code = format!("import {}", package.module_name());
        let output = run_python(&interpreter.path, &["-c", &code], self.timeout).await?;
        Ok(output.status.success())
    }
}

/// `python -m pip install -U <package>`.
pub struct PipInstaller {
    disabled: bool,
    timeout: Duration,
}

impl PipInstaller {
    pub fn new(disabled: bool, timeout: Duration) -> Self {
        Self { disabled, timeout }
    }
}

impl Default for PipInstaller {
    fn default() -> Self {
        Self::new(false, DEFAULT_INSTALL_TIMEOUT)
    }
}

#[async_trait]
impl PackageInstaller for PipInstaller {
    async fn install(&self, package: Package, interpreter: &InterpreterRef) -> Result<InstallOutcome> {
        if self.disabled {
            tracing::info!("pip install of '{}' skipped: installs are disabled", package);
            return Ok(InstallOutcome::Disabled);
        }

        tracing::info!("pip install: {} ({})", package.pip_name(), interpreter.path.display());
        let output = run_python(
            &interpreter.path,
            &["-m", "pip", "install", "-U", package.pip_name()],
            self.timeout,
        )
        .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow::anyhow!("pip 실행 실패 ({}): {}", package, stderr.trim()));
        }
        Ok(InstallOutcome::Installed)
    }
}

/// `python -m jupyter kernelspec list --json`.
pub struct KernelSpecListCommand {
    timeout: Duration,
}

impl KernelSpecListCommand {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for KernelSpecListCommand {
    fn default() -> Self {
        Self::new(DEFAULT_COMMAND_TIMEOUT)
    }
}

#[async_trait]
impl KernelSpecVerifier for KernelSpecListCommand {
    async fn verify(&self, interpreter: &InterpreterRef) -> Result<()> {
        let output = run_python(
            &interpreter.path,
            &["-m", "jupyter", "kernelspec", "list", "--json"],
            self.timeout,
        )
        .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow::anyhow!("kernelspec list failed: {}", stderr.trim()));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let listing: serde_json::Value =
            serde_json::from_str(&stdout).context("kernelspec list returned invalid JSON")?;
        if listing.get("kernelspecs").is_none() {
            return Err(anyhow::anyhow!("kernelspec list output has no 'kernelspecs' key"));
        }
        Ok(())
    }
}

/// Run the interpreter with `args`, killing it if it outlives `timeout`.
pub(crate) async fn run_python(python_exe: &Path, args: &[&str], timeout: Duration) -> Result<Output> {
    let mut cmd = Command::new(python_exe);
    cmd.args(args)
        .env("PYTHONIOENCODING", "utf-8")
        .stdin(std::process::Stdio::null())
        .kill_on_drop(true);
    apply_creation_flags(&mut cmd);

    tracing::debug!("run: {} {}", python_exe.display(), args.join(" "));
    match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(output) => output.with_context(|| format!("failed to run {}", python_exe.display())),
        Err(_) => {
            // kill_on_drop 으로 프로세스 정리
            tracing::warn!("{} {} timed out after {:?}", python_exe.display(), args.join(" "), timeout);
            Err(anyhow::anyhow!("'{}' timed out after {:?}", args.join(" "), timeout))
        }
    }
}
