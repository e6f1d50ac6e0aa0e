//! 통합 테스트용 가짜 협력자들
#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use kernel_launcher::dependencies::{
    DependencyPrompt, InstallOutcome, KernelSpecVerifier, Package, PackageInstaller, PackageProbe,
    PromptChoice,
};
use kernel_launcher::environment::InterpreterRef;
use kernel_launcher::supervisor::enumerator::{ServerDescriptor, ServerEnumerator};

// ─── Connection Waiter fakes ─────────────────────────────────

pub fn descriptor(dir: &str, port: u16) -> ServerDescriptor {
    ServerDescriptor {
        url: format!("http://localhost:{}/", port),
        base_url: "/".to_string(),
        hostname: "localhost".to_string(),
        notebook_dir: PathBuf::from(dir),
        secure: false,
        token: format!("token-{}", port),
        pid: Some(40_000 + port as u32),
        port: Some(port),
    }
}

/// Returns a fixed answer and counts how often it was asked.
pub struct ScriptedEnumerator {
    servers: Option<Vec<ServerDescriptor>>,
    fail: bool,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl ScriptedEnumerator {
    pub fn listing(servers: Vec<ServerDescriptor>) -> Self {
        Self {
            servers: Some(servers),
            fail: false,
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn unavailable() -> Self {
        Self {
            servers: None,
            ..Self::listing(Vec::new())
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::listing(Vec::new())
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ServerEnumerator for ScriptedEnumerator {
    async fn list_servers(&self, cancel: &CancellationToken) -> Result<Option<Vec<ServerDescriptor>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::select! {
                _ = cancel.cancelled() => anyhow::bail!("cancelled"),
                _ = tokio::time::sleep(delay) => {}
            }
        }
        if self.fail {
            anyhow::bail!("registry unreadable");
        }
        Ok(self.servers.clone())
    }
}

// ─── Dependency Resolver fakes ───────────────────────────────

/// Packages present in the fake interpreter. Shared by the probe and the
/// installer so installs become visible to later probes.
#[derive(Clone, Default)]
pub struct FakeSite {
    installed: Arc<Mutex<HashSet<Package>>>,
    probes: Arc<Mutex<Vec<Package>>>,
}

impl FakeSite {
    pub fn with(packages: &[Package]) -> Self {
        let site = Self::default();
        site.installed.lock().unwrap().extend(packages.iter().copied());
        site
    }

    pub fn add(&self, package: Package) {
        self.installed.lock().unwrap().insert(package);
    }

    pub fn probes(&self) -> Vec<Package> {
        self.probes.lock().unwrap().clone()
    }
}

#[async_trait]
impl PackageProbe for FakeSite {
    async fn is_installed(&self, package: Package, _: &InterpreterRef) -> Result<bool> {
        self.probes.lock().unwrap().push(package);
        Ok(self.installed.lock().unwrap().contains(&package))
    }
}

/// Probe that always errors.
pub struct BrokenProbe;

#[async_trait]
impl PackageProbe for BrokenProbe {
    async fn is_installed(&self, _: Package, _: &InterpreterRef) -> Result<bool> {
        anyhow::bail!("interpreter crashed")
    }
}

pub enum InstallBehavior {
    /// Report `Installed` and add the package to the site.
    Install,
    /// Report `Installed` without changing the site.
    Pretend,
    Report(InstallOutcome),
    Fail,
    /// Installing jupyter also brings notebook along.
    Bundle,
}

pub struct RecordingInstaller {
    site: FakeSite,
    behavior: InstallBehavior,
    log: Mutex<Vec<Package>>,
}

impl RecordingInstaller {
    pub fn new(site: &FakeSite, behavior: InstallBehavior) -> Self {
        Self {
            site: site.clone(),
            behavior,
            log: Mutex::new(Vec::new()),
        }
    }

    pub fn log(&self) -> Vec<Package> {
        self.log.lock().unwrap().clone()
    }
}

#[async_trait]
impl PackageInstaller for RecordingInstaller {
    async fn install(&self, package: Package, _: &InterpreterRef) -> Result<InstallOutcome> {
        self.log.lock().unwrap().push(package);
        match &self.behavior {
            InstallBehavior::Install => {
                self.site.add(package);
                Ok(InstallOutcome::Installed)
            }
            InstallBehavior::Pretend => Ok(InstallOutcome::Installed),
            InstallBehavior::Report(outcome) => Ok(*outcome),
            InstallBehavior::Fail => anyhow::bail!("pip exited with 1"),
            InstallBehavior::Bundle => {
                self.site.add(package);
                if package == Package::Jupyter {
                    self.site.add(Package::Notebook);
                }
                Ok(InstallOutcome::Installed)
            }
        }
    }
}

/// Answers with a fixed choice and records every message it was shown.
pub struct RecordingPrompt {
    answer: Option<PromptChoice>,
    shown: Mutex<Vec<(String, Vec<PromptChoice>)>>,
}

impl RecordingPrompt {
    pub fn answering(answer: Option<PromptChoice>) -> Self {
        Self {
            answer,
            shown: Mutex::new(Vec::new()),
        }
    }

    pub fn messages(&self) -> Vec<String> {
        self.shown.lock().unwrap().iter().map(|(m, _)| m.clone()).collect()
    }

    pub fn choices(&self) -> Vec<Vec<PromptChoice>> {
        self.shown.lock().unwrap().iter().map(|(_, c)| c.clone()).collect()
    }
}

#[async_trait]
impl DependencyPrompt for RecordingPrompt {
    async fn choose(&self, message: &str, choices: &[PromptChoice]) -> Option<PromptChoice> {
        self.shown
            .lock()
            .unwrap()
            .push((message.to_string(), choices.to_vec()));
        self.answer
    }
}

/// Fails the first `failures` verifications, then succeeds.
pub struct FlakyVerifier {
    failures: usize,
    calls: AtomicUsize,
}

impl FlakyVerifier {
    pub fn failing(failures: usize) -> Self {
        Self {
            failures,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KernelSpecVerifier for FlakyVerifier {
    async fn verify(&self, _: &InterpreterRef) -> Result<()> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.failures {
            anyhow::bail!("No module named jupyter_client");
        }
        Ok(())
    }
}

pub fn interpreter(path: &str) -> InterpreterRef {
    InterpreterRef::new(Path::new(path), Some("3.11.4"))
}
