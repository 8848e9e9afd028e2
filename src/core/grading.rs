use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::domain::RunResult;

/// Lesson-declared grading criterion.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutputRule {
    None,
    Exact {
        value: String,
    },
    Text {
        value: String,
    },
    Error,
    Pointer,
    TextTokens {
        text: String,
        #[serde(default)]
        source_includes: Vec<String>,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredOutput {
    #[serde(flatten)]
    pub rule: OutputRule,
    #[serde(default)]
    pub skippable: bool,
}

impl DesiredOutput {
    pub fn new(rule: OutputRule) -> Self {
        Self {
            rule,
            skippable: false,
        }
    }

    pub fn skippable(mut self) -> Self {
        self.skippable = true;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub passed: bool,
    pub explanation: String,
}

impl Verdict {
    fn pass(explanation: impl Into<String>) -> Self {
        Self {
            passed: true,
            explanation: explanation.into(),
        }
    }

    fn fail(explanation: impl Into<String>) -> Self {
        Self {
            passed: false,
            explanation: explanation.into(),
        }
    }
}

/// What grading sees of a finished run.
#[derive(Clone, Copy, Debug)]
pub struct Submission<'a> {
    pub output: &'a str,
    pub error: Option<&'a str>,
    pub source: &'a str,
}

static POINTER: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"\b0x[0-9a-fA-F]+").ok());

/// Line endings unified to `\n`, trailing blank lines removed.
pub fn normalize_output(text: &str) -> String {
    let unified = text.replace("\r\n", "\n").replace('\r', "\n");
    let mut lines: Vec<&str> = unified.split('\n').collect();
    while lines.last().is_some_and(|line| line.trim().is_empty()) {
        lines.pop();
    }
    lines.join("\n")
}

/// Decides pass/fail for a finished run. Pure.
pub fn grade(rule: &OutputRule, submission: &Submission<'_>) -> Verdict {
    match rule {
        OutputRule::None => Verdict::pass("This exercise is not graded."),
        OutputRule::Exact { value } => {
            if let Some(err) = submission.error {
                return Verdict::fail(format!("The program stopped with an error: {err}"));
            }
            let expected = normalize_output(value);
            let actual = normalize_output(submission.output);
            if actual == expected {
                Verdict::pass("Output matches exactly.")
            } else {
                Verdict::fail(mismatch(&expected, &actual))
            }
        }
        OutputRule::Text { value } => {
            if let Some(err) = submission.error {
                return Verdict::fail(format!("The program stopped with an error: {err}"));
            }
            let expected = normalize_output(value);
            let actual = normalize_output(submission.output);
            if actual.trim() == expected.trim() {
                Verdict::pass("Output matches.")
            } else {
                Verdict::fail(mismatch(expected.trim(), actual.trim()))
            }
        }
        OutputRule::Error => match submission.error {
            Some(_) => Verdict::pass("The program raised an error, as expected."),
            None => Verdict::fail("This exercise expects the program to fail with an error, but it finished normally."),
        },
        OutputRule::Pointer => {
            let found = (*POINTER)
                .as_ref()
                .and_then(|regex| regex.find(submission.output));
            match found {
                Some(address) => Verdict::pass(format!("Found address {}.", address.as_str())),
                None => Verdict::fail(
                    "Expected the output to contain a memory address such as 0x7ffd5e8c.",
                ),
            }
        }
        OutputRule::TextTokens {
            text,
            source_includes,
        } => {
            if !submission.output.contains(text.as_str()) {
                return Verdict::fail(format!("Expected the output to contain {text:?}."));
            }
            let missing: Vec<&str> = source_includes
                .iter()
                .map(String::as_str)
                .filter(|token| !submission.source.contains(token))
                .collect();
            if missing.is_empty() {
                Verdict::pass("Output and code look right.")
            } else {
                Verdict::fail(format!(
                    "Your code should use {}.",
                    itertools::join(missing.iter().map(|token| format!("`{token}`")), ", ")
                ))
            }
        }
    }
}

fn mismatch(expected: &str, actual: &str) -> String {
    format!("Expected output:\n{expected}\nActual output:\n{actual}")
}

/// Grades a materialized run against `desired`, using stdout as the output.
pub fn grade_run(desired: &DesiredOutput, result: &RunResult, source: &str) -> Verdict {
    let output = result.stdout();
    grade(
        &desired.rule,
        &Submission {
            output: &output,
            error: result.error(),
            source,
        },
    )
}

/// Whether the learner may move past an exercise.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub can_continue: bool,
    pub verdict: Option<Verdict>,
}

pub struct ProgressGate;

impl ProgressGate {
    /// `latest` is the most recent finished run and its source, if any.
    pub fn evaluate(desired: Option<&DesiredOutput>, latest: Option<(&RunResult, &str)>) -> Progress {
        let Some(desired) = desired else {
            return Progress {
                can_continue: true,
                verdict: None,
            };
        };

        let verdict = latest.map(|(result, source)| grade_run(desired, result, source));
        let attempted = latest.is_some();

        let can_continue = if desired.rule == OutputRule::None {
            true
        } else if desired.skippable {
            attempted
        } else {
            verdict.as_ref().is_some_and(|verdict| verdict.passed)
        };

        Progress {
            can_continue,
            verdict,
        }
    }
}
