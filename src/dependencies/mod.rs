//! Dependency Resolver: makes sure an interpreter has the packages needed
//! to launch a notebook server (and, separately, to run a kernel).
//!
//! ## Flow
//! 1. Probe every required package in priority order (no caching).
//! 2. All present → `Ok`, nothing else happens.
//! 3. Otherwise one prompt: install / select another interpreter / cancel.
//! 4. Install missing packages in the same order. `Ignored`/`Disabled` stop
//!    with `Cancel`.
//! 5. After installing `jupyter`, list kernel specs once. If that fails the
//!    install is treated as broken and reissued a single time.
//!
//! Probe and installer errors are returned to the caller as-is.

pub mod flag_store;
pub mod python;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::environment::InterpreterRef;
use flag_store::FlagStore;

/// Flag set once the first install attempt has been made.
pub const ATTEMPTED_INSTALL_FLAG: &str = "attempted_jupyter_install";

/// Packages the resolver knows about. Declaration order is priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Package {
    Jupyter,
    Notebook,
    IpyKernel,
}

impl Package {
    /// Module name used for `import` probes.
    pub fn module_name(self) -> &'static str {
        match self {
            Self::Jupyter => "jupyter",
            Self::Notebook => "notebook",
            Self::IpyKernel => "ipykernel",
        }
    }

    /// Distribution name passed to pip.
    pub fn pip_name(self) -> &'static str {
        self.module_name()
    }
}

impl fmt::Display for Package {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.module_name())
    }
}

/// Packages a notebook server launch needs, primary first.
pub const SERVER_PACKAGES: [Package; 2] = [Package::Jupyter, Package::Notebook];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyOutcome {
    Ok,
    Cancel,
}

/// What the installer reports back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstallOutcome {
    Installed,
    /// Policy says not to install this package here.
    Ignored,
    /// Installation is turned off.
    Disabled,
}

/// Buttons offered by the prompt. Compared structurally, never by label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptChoice {
    Install,
    SelectDifferent,
    Cancel,
}

#[async_trait]
pub trait PackageProbe: Send + Sync {
    async fn is_installed(&self, package: Package, interpreter: &InterpreterRef) -> Result<bool>;
}

#[async_trait]
pub trait PackageInstaller: Send + Sync {
    async fn install(&self, package: Package, interpreter: &InterpreterRef) -> Result<InstallOutcome>;
}

/// Modal choice. `None` means the prompt was dismissed.
#[async_trait]
pub trait DependencyPrompt: Send + Sync {
    async fn choose(&self, message: &str, choices: &[PromptChoice]) -> Option<PromptChoice>;
}

/// Short-lived command proving the jupyter install actually works.
#[async_trait]
pub trait KernelSpecVerifier: Send + Sync {
    async fn verify(&self, interpreter: &InterpreterRef) -> Result<()>;
}

#[derive(thiserror::Error, Debug)]
pub enum DependencyError {
    #[error("'{package}' is required to run a kernel with {}", .interpreter.display())]
    Cancelled { package: Package, interpreter: PathBuf },

    #[error("'{package}' is still missing from {} after installation", .interpreter.display())]
    NotInstalled { package: Package, interpreter: PathBuf },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

enum InstallStep {
    Continue,
    Stop(InstallOutcome),
}

pub struct DependencyResolver {
    probe: Arc<dyn PackageProbe>,
    installer: Arc<dyn PackageInstaller>,
    prompt: Arc<dyn DependencyPrompt>,
    verifier: Arc<dyn KernelSpecVerifier>,
    flags: Arc<dyn FlagStore>,
}

impl DependencyResolver {
    pub fn new(
        probe: Arc<dyn PackageProbe>,
        installer: Arc<dyn PackageInstaller>,
        prompt: Arc<dyn DependencyPrompt>,
        verifier: Arc<dyn KernelSpecVerifier>,
        flags: Arc<dyn FlagStore>,
    ) -> Self {
        Self {
            probe,
            installer,
            prompt,
            verifier,
            flags,
        }
    }

    /// Make sure the notebook server packages are present for `interpreter`.
    pub async fn ensure_dependencies(&self, interpreter: &InterpreterRef) -> Result<DependencyOutcome> {
        let missing = self.missing_packages(&SERVER_PACKAGES, interpreter).await?;
        if missing.is_empty() {
            tracing::debug!("All server packages present in {}", interpreter.path.display());
            return Ok(DependencyOutcome::Ok);
        }

        tracing::info!(
            "Missing {:?} in {}, asking the user",
            missing,
            interpreter.path.display()
        );
        let message = self.install_message(&missing, interpreter);
        let choice = self
            .prompt
            .choose(
                &message,
                &[PromptChoice::Install, PromptChoice::SelectDifferent, PromptChoice::Cancel],
            )
            .await
            .unwrap_or(PromptChoice::Cancel);

        match choice {
            PromptChoice::Install => {}
            PromptChoice::SelectDifferent | PromptChoice::Cancel => {
                tracing::info!("Dependency install declined ({:?})", choice);
                return Ok(DependencyOutcome::Cancel);
            }
        }

        self.flags.set(ATTEMPTED_INSTALL_FLAG, true)?;
        self.install_missing(&missing, interpreter).await
    }

    /// Make sure `ipykernel` is present before a kernel is started.
    /// `resource` is the document the kernel is for, used in the prompt.
    pub async fn ensure_runtime_dependency(
        &self,
        resource: Option<&Path>,
        interpreter: &InterpreterRef,
    ) -> Result<(), DependencyError> {
        let package = Package::IpyKernel;
        if self.probe.is_installed(package, interpreter).await? {
            return Ok(());
        }

        let target = match resource {
            Some(path) => format!(" for {}", path.display()),
            None => String::new(),
        };
        let message = format!(
            "Running cells{} requires '{}' in {}. Install it?",
            target,
            package,
            interpreter.path.display()
        );
        let choice = self
            .prompt
            .choose(&message, &[PromptChoice::Install, PromptChoice::Cancel])
            .await;

        let cancelled = || DependencyError::Cancelled {
            package,
            interpreter: interpreter.path.clone(),
        };
        if choice != Some(PromptChoice::Install) {
            return Err(cancelled());
        }

        if let InstallStep::Stop(outcome) = self.install(package, interpreter).await? {
            tracing::info!("'{}' install stopped: {:?}", package, outcome);
            return Err(cancelled());
        }

        if !self.probe.is_installed(package, interpreter).await? {
            return Err(DependencyError::NotInstalled {
                package,
                interpreter: interpreter.path.clone(),
            });
        }
        Ok(())
    }

    /// "install" before the first attempt, "reinstall" afterwards.
    pub fn install_verb(&self) -> &'static str {
        if self.flags.get(ATTEMPTED_INSTALL_FLAG) {
            "reinstall"
        } else {
            "install"
        }
    }

    async fn missing_packages(
        &self,
        packages: &[Package],
        interpreter: &InterpreterRef,
    ) -> Result<Vec<Package>> {
        let mut missing = Vec::new();
        for &package in packages {
            let present = self.probe.is_installed(package, interpreter).await?;
            tracing::debug!("probe {} in {}: {}", package, interpreter.path.display(), present);
            if !present {
                missing.push(package);
            }
        }
        Ok(missing)
    }

    async fn install_missing(
        &self,
        missing: &[Package],
        interpreter: &InterpreterRef,
    ) -> Result<DependencyOutcome> {
        for (index, &package) in missing.iter().enumerate() {
            // installing the primary package may already have pulled this one in
            if index > 0 && self.probe.is_installed(package, interpreter).await? {
                tracing::debug!("'{}' appeared after earlier installs", package);
                continue;
            }

            if let InstallStep::Stop(outcome) = self.install(package, interpreter).await? {
                tracing::info!("'{}' install stopped: {:?}", package, outcome);
                return Ok(DependencyOutcome::Cancel);
            }

            if package == Package::Jupyter {
                if let Err(e) = self.verifier.verify(interpreter).await {
                    tracing::warn!(
                        "jupyter installed but kernel spec listing failed ({}), reinstalling once",
                        e
                    );
                    if let InstallStep::Stop(outcome) = self.install(package, interpreter).await? {
                        tracing::info!("'{}' reinstall stopped: {:?}", package, outcome);
                        return Ok(DependencyOutcome::Cancel);
                    }
                    self.verifier
                        .verify(interpreter)
                        .await
                        .context("kernel spec listing still fails after reinstalling jupyter")?;
                }
            }
        }
        Ok(DependencyOutcome::Ok)
    }

    async fn install(&self, package: Package, interpreter: &InterpreterRef) -> Result<InstallStep> {
        tracing::info!("Installing '{}' into {}", package, interpreter.path.display());
        match self.installer.install(package, interpreter).await? {
            InstallOutcome::Installed => Ok(InstallStep::Continue),
            outcome @ (InstallOutcome::Ignored | InstallOutcome::Disabled) => Ok(InstallStep::Stop(outcome)),
        }
    }

    fn install_message(&self, missing: &[Package], interpreter: &InterpreterRef) -> String {
        let names: Vec<String> = missing.iter().map(|p| format!("'{}'", p)).collect();
        let (verb, pronoun) = if missing.len() == 1 { ("is", "it") } else { ("are", "them") };
        format!(
            "{} {} required to start a Jupyter server with {}. Would you like to {} {}?",
            names.join(" and "),
            verb,
            interpreter.path.display(),
            self.install_verb(),
            pronoun
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dependencies::flag_store::MemoryFlagStore;

    struct NoopProbe;
    #[async_trait]
    impl PackageProbe for NoopProbe {
        async fn is_installed(&self, _: Package, _: &InterpreterRef) -> Result<bool> {
            Ok(true)
        }
    }

    struct NoopInstaller;
    #[async_trait]
    impl PackageInstaller for NoopInstaller {
        async fn install(&self, _: Package, _: &InterpreterRef) -> Result<InstallOutcome> {
            Ok(InstallOutcome::Installed)
        }
    }

    struct NoopPrompt;
    #[async_trait]
    impl DependencyPrompt for NoopPrompt {
        async fn choose(&self, _: &str, _: &[PromptChoice]) -> Option<PromptChoice> {
            None
        }
    }

    struct NoopVerifier;
    #[async_trait]
    impl KernelSpecVerifier for NoopVerifier {
        async fn verify(&self, _: &InterpreterRef) -> Result<()> {
            Ok(())
        }
    }

    fn resolver(flags: Arc<MemoryFlagStore>) -> DependencyResolver {
        DependencyResolver::new(
            Arc::new(NoopProbe),
            Arc::new(NoopInstaller),
            Arc::new(NoopPrompt),
            Arc::new(NoopVerifier),
            flags,
        )
    }

    #[test]
    fn test_package_priority_order() {
        assert!(Package::Jupyter < Package::Notebook);
        assert_eq!(SERVER_PACKAGES, [Package::Jupyter, Package::Notebook]);
        assert_eq!(Package::IpyKernel.pip_name(), "ipykernel");
    }

    #[test]
    fn test_install_message_wording() {
        let flags = Arc::new(MemoryFlagStore::new());
        let r = resolver(flags.clone());
        let interp = InterpreterRef::new("/envs/a/bin/python", None);

        let msg = r.install_message(&[Package::Jupyter, Package::Notebook], &interp);
        assert!(msg.starts_with("'jupyter' and 'notebook' are required"));
        assert!(msg.ends_with("install them?"));
        assert!(!msg.contains("reinstall"));

        flags.set(ATTEMPTED_INSTALL_FLAG, true).unwrap();
        let msg = r.install_message(&[Package::Notebook], &interp);
        assert!(msg.contains("'notebook' is required"));
        assert!(msg.ends_with("reinstall it?"));
    }
}
