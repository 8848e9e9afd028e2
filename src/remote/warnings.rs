//! Line heuristic that removes compiler warnings from build output while
//! keeping genuine errors and the context lines that belong to them.

use std::sync::LazyLock;

use regex::Regex;

static WARNING: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^\S.*?:(?:\d+:)*\s*warning:").ok());
static ERROR: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^\S.*?:(?:\d+:)*\s*(?:fatal )?error:").ok());
static NOTE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^\S.*?:(?:\d+:)*\s*note:").ok());
static SCOPE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"^In file included from |^\s+from |: In (?:member )?function |: In instantiation of |: At global scope:|: In constructor |: In destructor ").ok()
});
static SUMMARY: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^\d+ warnings? generated\.$").ok());

fn matches(regex: &LazyLock<Option<Regex>>, line: &str) -> bool {
    (**regex).as_ref().is_some_and(|regex| regex.is_match(line))
}

/// Build stderr without warning diagnostics.
///
/// Scope headers such as "In function 'main':" are only kept when an error
/// follows them.
pub fn strip_warnings(stderr: &str) -> String {
    let mut kept: Vec<&str> = Vec::new();
    let mut scope: Vec<&str> = Vec::new();
    let mut in_scope_header = false;
    let mut in_warning = false;

    for line in stderr.lines() {
        if matches(&SUMMARY, line) {
            continue;
        }
        if matches(&SCOPE, line) {
            if !in_scope_header {
                scope.clear();
            }
            scope.push(line);
            in_scope_header = true;
            in_warning = false;
            continue;
        }
        in_scope_header = false;

        if matches(&WARNING, line) {
            in_warning = true;
        } else if matches(&ERROR, line) {
            kept.append(&mut scope);
            kept.push(line);
            in_warning = false;
        } else if matches(&NOTE, line) || line.starts_with(char::is_whitespace) {
            if !in_warning {
                kept.push(line);
            }
        } else {
            in_warning = false;
            kept.append(&mut scope);
            kept.push(line);
        }
    }

    kept.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drops_warning_with_its_context() {
        let stderr = "\
main.cpp: In function 'int main()':
main.cpp:4:9: warning: unused variable 'unused' [-Wunused-variable]
    4 |     int unused = 0;
      |         ^~~~~~
main.cpp:5:5: error: 'cout' was not declared in this scope
    5 |     cout << x;
      |     ^~~~
main.cpp:5:5: note: suggested alternative: 'std::cout'";

        assert_eq!(
            strip_warnings(stderr),
            "\
main.cpp: In function 'int main()':
main.cpp:5:5: error: 'cout' was not declared in this scope
    5 |     cout << x;
      |     ^~~~
main.cpp:5:5: note: suggested alternative: 'std::cout'"
        );
    }

    #[test]
    fn test_warning_only_output_becomes_empty() {
        let stderr = "\
prog.cc:3:7: warning: unused variable 'x' [-Wunused-variable]
  int x;
      ^
1 warning generated.";

        assert_eq!(strip_warnings(stderr), "");
    }

    #[test]
    fn test_scope_header_without_error_is_dropped() {
        let stderr = "\
main.cpp: In function 'int main()':
main.cpp:4:9: warning: unused variable 'y' [-Wunused-variable]
    4 |     int y;
      |         ^";

        assert_eq!(strip_warnings(stderr), "");
    }

    #[test]
    fn test_linker_errors_are_kept() {
        let stderr = "\
/usr/bin/ld: /tmp/cc.o: in function `main':
main.cpp:(.text+0x9): undefined reference to `helper()'
collect2: error: ld returned 1 exit status";

        assert_eq!(strip_warnings(stderr), stderr);
    }

    #[test]
    fn test_errors_pass_through_untouched() {
        let stderr = "main.cpp:3:14: error: expected ';' before 'return'";
        assert_eq!(strip_warnings(stderr), stderr);
    }
}
