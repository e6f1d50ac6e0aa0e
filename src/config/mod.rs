use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::dependencies::flag_store::{FlagStore, JsonFlagStore, MemoryFlagStore};
use crate::dependencies::python::{
    KernelSpecListCommand, PipInstaller, PythonPackageProbe, DEFAULT_INSTALL_TIMEOUT,
};
use crate::dependencies::{DependencyPrompt, DependencyResolver};
use crate::environment::InterpreterRef;
use crate::supervisor::enumerator::JupyterServerEnumerator;
use crate::supervisor::listening::ListeningPattern;
use crate::supervisor::WaiterConfig;

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct LauncherConfig {
    pub launch_timeout_ms: u64,
    pub stream_end_grace_ms: u64,
    /// 없으면 내장 패턴 사용 (host/port 그룹 필수)
    pub listening_pattern: Option<String>,
    pub python: Option<PathBuf>,
    pub installs_disabled: bool,
    pub flag_store_path: Option<PathBuf>,
    pub command_timeout_ms: u64,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            launch_timeout_ms: 60_000,
            stream_end_grace_ms: 2_000,
            listening_pattern: None,
            python: None,
            installs_disabled: false,
            flag_store_path: None,
            command_timeout_ms: 30_000,
        }
    }
}

impl LauncherConfig {
    /// 설정 파일이 없으면 기본값을 사용합니다.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            tracing::debug!("No launcher config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_toml_str(&s).with_context(|| format!("invalid launcher config {}", path.display()))
    }

    pub fn from_toml_str(s: &str) -> anyhow::Result<Self> {
        let cfg: Self = toml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.launch_timeout_ms == 0 {
            anyhow::bail!("launch_timeout_ms must be greater than 0");
        }
        if self.command_timeout_ms == 0 {
            anyhow::bail!("command_timeout_ms must be greater than 0");
        }
        self.pattern()?;
        Ok(())
    }

    fn pattern(&self) -> anyhow::Result<ListeningPattern> {
        match &self.listening_pattern {
            Some(p) => ListeningPattern::new(p),
            None => Ok(ListeningPattern::default()),
        }
    }

    pub fn launch_timeout(&self) -> Duration {
        Duration::from_millis(self.launch_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn waiter_config(&self) -> anyhow::Result<WaiterConfig> {
        Ok(WaiterConfig {
            launch_timeout: self.launch_timeout(),
            stream_end_grace: Duration::from_millis(self.stream_end_grace_ms),
            listening_pattern: self.pattern()?,
        })
    }

    /// `flag_store_path`가 있으면 파일 기반, 없으면 메모리 저장소.
    pub fn flag_store(&self) -> anyhow::Result<Arc<dyn FlagStore>> {
        let store: Arc<dyn FlagStore> = match &self.flag_store_path {
            Some(path) => Arc::new(JsonFlagStore::open(path)?),
            None => Arc::new(MemoryFlagStore::new()),
        };
        Ok(store)
    }

    pub fn installer(&self) -> PipInstaller {
        PipInstaller::new(self.installs_disabled, DEFAULT_INSTALL_TIMEOUT)
    }

    /// Resolver backed by the real python commands. Only the prompt is up
    /// to the caller.
    pub fn dependency_resolver(
        &self,
        prompt: Arc<dyn DependencyPrompt>,
    ) -> anyhow::Result<DependencyResolver> {
        Ok(DependencyResolver::new(
            Arc::new(PythonPackageProbe::new(self.command_timeout())),
            Arc::new(self.installer()),
            prompt,
            Arc::new(KernelSpecListCommand::new(self.command_timeout())),
            self.flag_store()?,
        ))
    }

    /// Interpreter to launch, check and enumerate with: `explicit` if given,
    /// otherwise the configured `python`.
    pub fn interpreter(&self, explicit: Option<&Path>) -> Option<InterpreterRef> {
        let path = explicit.or(self.python.as_deref())?;
        Some(InterpreterRef::new(path, None))
    }

    pub fn server_enumerator(&self, python: Option<&Path>) -> Option<JupyterServerEnumerator> {
        let python = self.interpreter(python)?;
        Some(JupyterServerEnumerator::new(python.path, self.command_timeout()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = LauncherConfig::from_toml_str("").unwrap();
        assert_eq!(cfg.launch_timeout(), Duration::from_secs(60));
        assert_eq!(cfg.command_timeout(), Duration::from_secs(30));
        assert!(!cfg.installs_disabled);

        let waiter = cfg.waiter_config().unwrap();
        assert_eq!(waiter.stream_end_grace, Duration::from_secs(2));
    }

    #[test]
    fn test_overrides() {
        let cfg = LauncherConfig::from_toml_str(
            r#"
launch_timeout_ms = 1500
installs_disabled = true
python = "/opt/py/bin/python3"
listening_pattern = 'up on (?P<host>\S+):(?P<port>\d+)'
"#,
        )
        .unwrap();
        assert_eq!(cfg.launch_timeout(), Duration::from_millis(1500));
        assert!(cfg.installs_disabled);
        assert!(cfg.server_enumerator(None).is_some());

        let waiter = cfg.waiter_config().unwrap();
        let found = waiter.listening_pattern.find("up on 0.0.0.0:7777").unwrap();
        assert_eq!(found.port, 7777);
    }

    #[test]
    fn test_interpreter_falls_back_to_configured_python() {
        let cfg = LauncherConfig::from_toml_str("python = '/opt/py/bin/python3'").unwrap();
        let configured = cfg.interpreter(None).unwrap();
        assert_eq!(configured.path, PathBuf::from("/opt/py/bin/python3"));

        let explicit = cfg.interpreter(Some(Path::new("/envs/a/bin/python"))).unwrap();
        assert_eq!(explicit.path, PathBuf::from("/envs/a/bin/python"));

        assert!(LauncherConfig::default().interpreter(None).is_none());
    }

    #[tokio::test]
    async fn test_disabled_installs() {
        use crate::dependencies::{InstallOutcome, Package, PackageInstaller};

        let cfg = LauncherConfig::from_toml_str("installs_disabled = true").unwrap();
        let python = InterpreterRef::new("/nonexistent/bin/python", None);
        let outcome = cfg.installer().install(Package::Jupyter, &python).await.unwrap();
        assert_eq!(outcome, InstallOutcome::Disabled);
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(LauncherConfig::from_toml_str("launch_timeout_ms = 0").is_err());
        assert!(LauncherConfig::from_toml_str("listening_pattern = 'no groups'").is_err());
        assert!(LauncherConfig::from_toml_str("launch_timeout_ms = \"soon\"").is_err());
    }

    #[test]
    fn test_load_missing_and_present() {
        let dir = tempfile::tempdir().unwrap();
        let missing = LauncherConfig::load(&dir.path().join("none.toml")).unwrap();
        assert!(missing.python.is_none());
        assert!(missing.server_enumerator(None).is_none());

        let path = dir.path().join("launcher.toml");
        let flags = dir.path().join("state").join("flags.json");
        std::fs::write(
            &path,
            format!("command_timeout_ms = 500\nflag_store_path = {:?}\n", flags.to_string_lossy()),
        )
        .unwrap();
        let cfg = LauncherConfig::load(&path).unwrap();
        assert_eq!(cfg.command_timeout(), Duration::from_millis(500));

        let store = cfg.flag_store().unwrap();
        store.set("attempted_jupyter_install", true).unwrap();
        assert!(flags.exists());
    }

    #[test]
    fn test_resolver_reads_persisted_flag() {
        struct NoPrompt;
        #[async_trait::async_trait]
        impl DependencyPrompt for NoPrompt {
            async fn choose(
                &self,
                _: &str,
                _: &[crate::dependencies::PromptChoice],
            ) -> Option<crate::dependencies::PromptChoice> {
                None
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let flags = dir.path().join("flags.json");
        std::fs::write(&flags, r#"{"attempted_jupyter_install": true}"#).unwrap();

        let cfg = LauncherConfig {
            flag_store_path: Some(flags),
            ..LauncherConfig::default()
        };
        let resolver = cfg.dependency_resolver(Arc::new(NoPrompt)).unwrap();
        assert_eq!(resolver.install_verb(), "reinstall");
    }
}
