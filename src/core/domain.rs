use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    C,
    Cpp,
}

impl Language {
    pub fn backend_kind(&self) -> BackendKind {
        match self {
            Language::Python => BackendKind::Interpreter,
            Language::C => BackendKind::LocalToolchain,
            Language::Cpp => BackendKind::Remote,
        }
    }

    pub fn file_extension(&self) -> &'static str {
        match self {
            Language::Python => "py",
            Language::C => "c",
            Language::Cpp => "cpp",
        }
    }

    /// Name the remote execution API expects in its `language` field.
    pub fn remote_name(&self) -> &'static str {
        match self {
            Language::Python => "python3",
            Language::C => "c",
            Language::Cpp => "cpp",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::C => "c",
            Language::Cpp => "cpp",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Interpreter,
    LocalToolchain,
    Remote,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutionRequest {
    pub language: Language,
    pub source: String,
    pub timeout_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RunUpdate {
    Stdout { data: String },
    Stderr { data: String },
    Error { message: String },
    Done,
    Ready,
}

impl RunUpdate {
    pub fn stdout(data: impl Into<String>) -> Self {
        RunUpdate::Stdout { data: data.into() }
    }

    pub fn stderr(data: impl Into<String>) -> Self {
        RunUpdate::Stderr { data: data.into() }
    }

    pub fn error(message: impl Into<String>) -> Self {
        RunUpdate::Error {
            message: message.into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunUpdate::Error { .. } | RunUpdate::Done)
    }
}

/// Terminal record of one run. The last update is always `Error` or `Done`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunResult {
    pub updates: Vec<RunUpdate>,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
}

impl RunResult {
    /// A run that never reached a backend, e.g. because the toolchain is missing.
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            updates: vec![RunUpdate::error(message)],
            started_at: Utc::now(),
            elapsed_ms: 0,
        }
    }

    pub fn stdout(&self) -> String {
        self.updates
            .iter()
            .filter_map(|update| match update {
                RunUpdate::Stdout { data } => Some(data.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn stderr(&self) -> String {
        self.updates
            .iter()
            .filter_map(|update| match update {
                RunUpdate::Stderr { data } => Some(data.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn error(&self) -> Option<&str> {
        self.updates.iter().rev().find_map(|update| match update {
            RunUpdate::Error { message } => Some(message.as_str()),
            _ => None,
        })
    }

    pub fn is_success(&self) -> bool {
        matches!(self.updates.last(), Some(RunUpdate::Done))
    }
}

/// What a backend hands back once a program finished.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramOutput {
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

/// Exercise source as lessons ship it: only `editable` is typed by the learner.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExerciseSource {
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub editable: String,
    #[serde(default)]
    pub suffix: String,
}

impl ExerciseSource {
    pub fn compose(&self) -> String {
        let mut source =
            String::with_capacity(self.prefix.len() + self.editable.len() + self.suffix.len());
        source.push_str(&self.prefix);
        source.push_str(&self.editable);
        source.push_str(&self.suffix);
        source
    }
}
