//! Candidate execution environments and the document metadata they are
//! matched against. Everything here is a read-only snapshot produced by a
//! discovery collaborator.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::utils::paths_equal;

/// Language name shared by interpreter-backed candidates.
pub const PYTHON_LANGUAGE: &str = "python";

/// A concrete interpreter on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterpreterRef {
    pub path: PathBuf,
    /// e.g. "3.12.8"
    #[serde(default)]
    pub version: Option<String>,
}

impl InterpreterRef {
    pub fn new(path: impl Into<PathBuf>, version: Option<&str>) -> Self {
        Self {
            path: path.into(),
            version: version.map(String::from),
        }
    }

    /// Identity is the normalized path; the version string is informational.
    pub fn same_as(&self, other: &InterpreterRef) -> bool {
        paths_equal(&self.path, &other.path)
    }

    pub fn is_at(&self, path: &Path) -> bool {
        paths_equal(&self.path, path)
    }
}

impl PartialEq for InterpreterRef {
    fn eq(&self, other: &Self) -> bool {
        self.same_as(other)
    }
}

impl Eq for InterpreterRef {}

/// A named kernel specification (`kernel.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelSpecRef {
    pub name: String,
    pub display_name: String,
    pub language: String,
}

/// A discoverable thing a document could run against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateEnvironment {
    pub id: String,
    pub language: String,
    #[serde(default)]
    pub interpreter: Option<InterpreterRef>,
    #[serde(default)]
    pub kernel_spec: Option<KernelSpecRef>,
    /// Stand-in for the active interpreter added by ranking. It never rises
    /// above the language tier.
    #[serde(default)]
    pub synthetic: bool,
}

impl CandidateEnvironment {
    /// Candidate backed only by an interpreter, with no kernel spec of its own.
    pub fn from_interpreter(interpreter: &InterpreterRef) -> Self {
        Self {
            id: format!("interpreter:{}", interpreter.path.display()),
            language: PYTHON_LANGUAGE.to_string(),
            interpreter: Some(interpreter.clone()),
            kernel_spec: None,
            synthetic: false,
        }
    }

    /// Stand-in for the active interpreter when nothing else fits.
    pub fn synthetic_for(interpreter: &InterpreterRef) -> Self {
        Self {
            synthetic: true,
            ..Self::from_interpreter(interpreter)
        }
    }

    /// Candidate for a named kernel spec, optionally tied to an interpreter.
    pub fn from_kernel_spec(spec: KernelSpecRef, interpreter: Option<InterpreterRef>) -> Self {
        Self {
            id: format!("kernelspec:{}", spec.name),
            language: spec.language.clone(),
            interpreter,
            kernel_spec: Some(spec),
            synthetic: false,
        }
    }

    pub fn kernel_spec_name(&self) -> Option<&str> {
        self.kernel_spec.as_ref().map(|k| k.name.as_str())
    }

    pub fn speaks(&self, language: &str) -> bool {
        languages_equal(&self.language, language)
    }
}

/// Kernel spec hint recorded in the document (`metadata.kernelspec`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelSpecHint {
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
}

/// Declared intent of a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub language: String,
    #[serde(default)]
    pub kernel_spec: Option<KernelSpecHint>,
    /// nbformat major version
    #[serde(default = "default_format_version")]
    pub format_version: u32,
    /// Interpreter the document was last saved with, if recorded.
    #[serde(default)]
    pub interpreter: Option<PathBuf>,
}

fn default_format_version() -> u32 {
    4
}

impl DocumentMetadata {
    pub fn new(language: &str) -> Self {
        Self {
            language: language.to_string(),
            kernel_spec: None,
            format_version: default_format_version(),
            interpreter: None,
        }
    }

    pub fn with_kernel_spec(mut self, name: &str) -> Self {
        self.kernel_spec = Some(KernelSpecHint {
            name: name.to_string(),
            display_name: None,
            language: Some(self.language.clone()),
        });
        self
    }

    pub fn with_interpreter(mut self, path: impl Into<PathBuf>) -> Self {
        self.interpreter = Some(path.into());
        self
    }

    pub fn kernel_spec_name(&self) -> Option<&str> {
        self.kernel_spec.as_ref().map(|k| k.name.as_str())
    }

    pub fn is_python(&self) -> bool {
        languages_equal(&self.language, PYTHON_LANGUAGE)
    }
}

/// Language names compare case-insensitively ("Python" == "python").
pub fn languages_equal(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interpreter_identity_uses_normalized_path() {
        let a = InterpreterRef::new("/envs/a/bin/python", Some("3.11.2"));
        let b = InterpreterRef::new("/envs/a/bin/../bin/python", None);
        assert_eq!(a, b);
        assert_ne!(a, InterpreterRef::new("/envs/b/bin/python", Some("3.11.2")));
    }

    #[test]
    fn test_document_metadata_from_notebook_json() {
        let doc: DocumentMetadata = serde_json::from_value(serde_json::json!({
            "language": "python",
            "kernel_spec": { "name": "python3", "display_name": "Python 3" }
        }))
        .unwrap();
        assert_eq!(doc.kernel_spec_name(), Some("python3"));
        assert_eq!(doc.format_version, 4);
        assert!(doc.is_python());
    }

    #[test]
    fn test_languages_equal() {
        assert!(languages_equal("Python", "python"));
        assert!(languages_equal(" julia ", "Julia"));
        assert!(!languages_equal("python", "r"));
    }
}
