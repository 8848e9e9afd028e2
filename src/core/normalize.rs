//! Rewrites raw tracebacks and compiler diagnostics into beginner-legible text.
//!
//! Purely textual pattern matching. Best effort, never panics: a pattern that
//! fails to compile is skipped, and when nothing matches the last meaningful
//! line of the raw error is returned.

use std::sync::LazyLock;

use regex::{Captures, Regex};

struct Pattern {
    regex: Regex,
    explain: fn(&Captures<'_>) -> String,
}

fn pattern(source: &str, explain: fn(&Captures<'_>) -> String) -> Option<Pattern> {
    Regex::new(source).ok().map(|regex| Pattern { regex, explain })
}

fn group<'a>(caps: &'a Captures<'_>, idx: usize, fallback: &'a str) -> &'a str {
    caps.get(idx).map_or(fallback, |m| m.as_str())
}

// Order matters: TabError is also an IndentationError.
static PATTERNS: LazyLock<Vec<Pattern>> = LazyLock::new(|| {
    [
        pattern(
            r#"unterminated (?:triple-quoted )?string literal|EOL while scanning string literal|EOF while scanning triple-quoted string literal|missing terminating ["'] character"#,
            |_| {
                "A string is missing its closing quote. Check that every opening \" or ' has a matching one.".to_string()
            },
        ),
        pattern(r"expected ':'", |_| {
            "A colon (:) is missing at the end of this line. Lines starting with if, elif, else, for, while, def and class must end with one.".to_string()
        }),
        pattern(
            r"was never closed|unmatched '[)\]}]'|closing parenthesis '.' does not match|unexpected EOF while parsing",
            |_| {
                "A bracket is not matched. Check that every (, [ and { has a matching closing bracket.".to_string()
            },
        ),
        pattern(r"TabError|inconsistent use of tabs and spaces", |_| {
            "This line mixes tabs and spaces for indentation. Use spaces only.".to_string()
        }),
        pattern(
            r"IndentationError|expected an indented block|unexpected indent|unindent does not match",
            |_| {
                "The indentation of this line does not match the lines around it. Blocks after a colon must be indented, and lines in the same block must line up.".to_string()
            },
        ),
        pattern(r"invalid character '[‘’“”]'|invalid character in identifier", |_| {
            "This line contains curly “smart” quotes. Replace them with straight quotes ' or \".".to_string()
        }),
        pattern(r"NameError: name '(\w+)' is not defined", |caps| {
            format!(
                "`{}` is used before it was defined. Check the spelling, or give it a value first.",
                group(caps, 1, "This name")
            )
        }),
        pattern(r"'(\w+)' undeclared|use of undeclared identifier '(\w+)'", |caps| {
            let name = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map_or("This name", |m| m.as_str());
            format!("`{name}` is used before it was declared. Check the spelling, or declare it first.")
        }),
        pattern(
            r#"can only concatenate str \(not "\w+"\) to str|unsupported operand type\(s\) for \+: '(?:int|float)' and 'str'|unsupported operand type\(s\) for \+: 'str' and '(?:int|float)'"#,
            |_| {
                "Text and a number cannot be added together. Convert the number with str() first, e.g. \"Total: \" + str(total).".to_string()
            },
        ),
        pattern(r"ZeroDivisionError|division by zero", |_| {
            "You tried to divide by zero. Check the value you divide by before dividing.".to_string()
        }),
        pattern(r"'NoneType' object has no attribute '(\w+)'", |caps| {
            format!(
                "You tried to use `.{}` on a value that is None. A function probably returned nothing where you expected a value.",
                group(caps, 1, "attribute")
            )
        }),
        pattern(r"expected ';'", |_| {
            "A semicolon (;) is missing at the end of a statement.".to_string()
        }),
    ]
    .into_iter()
    .flatten()
    .collect()
});

static EXERCISE_LINE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r#"File "<exercise>", line (\d+)"#).ok());
static ANY_LINE: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"\bline (\d+)").ok());
static DIAGNOSTIC_LINE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r":(\d+):\d+:\s*(?:fatal )?error").ok());

/// Rewrites a raw error into plain language.
pub fn normalize_error(raw: &str) -> String {
    let raw = raw.trim_end();
    if raw.is_empty() {
        return String::new();
    }

    for pattern in PATTERNS.iter() {
        if let Some(caps) = pattern.regex.captures(raw) {
            let explanation = (pattern.explain)(&caps);
            return match offending_line(raw) {
                Some(line) => format!("{explanation} (line {line})"),
                None => explanation,
            };
        }
    }

    last_meaningful_line(raw)
        .map(str::to_string)
        .unwrap_or_else(|| raw.to_string())
}

/// Line number the trace blames, preferring frames inside the learner's code.
pub fn offending_line(raw: &str) -> Option<u32> {
    let last_capture = |regex: &LazyLock<Option<Regex>>| -> Option<u32> {
        (**regex)
            .as_ref()?
            .captures_iter(raw)
            .last()
            .and_then(|caps| caps.get(1)?.as_str().parse::<u32>().ok())
    };

    last_capture(&EXERCISE_LINE)
        .or_else(|| last_capture(&ANY_LINE))
        .or_else(|| {
            (*DIAGNOSTIC_LINE)
                .as_ref()?
                .captures(raw)
                .and_then(|caps| caps.get(1)?.as_str().parse::<u32>().ok())
        })
}

/// Final line of a trace with frame noise removed.
fn last_meaningful_line(raw: &str) -> Option<&str> {
    raw.lines().rev().map(str::trim_end).find(|line| {
        !line.is_empty()
            && !line.starts_with(char::is_whitespace)
            && !line.starts_with("Traceback")
            && !line.chars().all(|c| matches!(c, '^' | '~' | ' '))
    })
}
