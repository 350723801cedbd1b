//! Pre-launch source scan against an environment's security rules.
//!
//! The scan is a cheap first line of defense: it recognizes the common
//! import forms of the supported languages, dynamic imports and direct
//! calls of blocked functions. Comments and string literal contents are
//! masked before matching. Runtime isolation still applies to anything it
//! misses.

use regex::Regex;

use crate::error::{EngineError, EngineResult};
use crate::model::SecurityRules;

/// Import statements whose captured group is a single module path.
const SINGLE_IMPORT_PATTERNS: &[&str] = &[
    // python: from pkg.mod import name
    r"^\s*from\s+([A-Za-z_][\w.]*)\s+import\b",
    // javascript: import x from 'mod' / import 'mod'
    r#"^\s*import\s+(?:.+?\s+from\s+)?['"]([^'"]+)['"]"#,
    // c / c++
    r#"^\s*#\s*include\s*[<"]([^>"]+)[>"]"#,
    // java: import static a.b.c / import a.b.*
    r"^\s*import\s+(?:static\s+)?([A-Za-z_][\w.]*?)(?:\.\*)?\s*$",
];

/// Matches anywhere in a statement: `require('mod')`, `import('mod')`,
/// `__import__('mod')`, `importlib.import_module('mod')` and
/// `Class.forName("mod")`.
const CALL_IMPORT_PATTERN: &str =
    r#"\b(?:require|import|__import__|import_module|forName)\s*\(\s*['"]([^'"]+)['"]"#;

/// python: `import a, b.c as d`
const LIST_IMPORT_PATTERN: &str = r"^\s*import\s+([A-Za-z_][\w.]*(?:\s+as\s+\w+)?(?:\s*,\s*[A-Za-z_][\w.]*(?:\s+as\s+\w+)?)*)\s*$";

/// Stands in for every byte of a string literal's contents.
const MASK: char = '\0';

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// Human-readable descriptions.
    pub violations: Vec<String>,
    /// The offending imports or calls, verbatim.
    pub blocked_operations: Vec<String>,
}

impl ScanReport {
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }

    fn record(&mut self, operation: String, violation: String) {
        if !self.blocked_operations.contains(&operation) {
            self.blocked_operations.push(operation);
            self.violations.push(violation);
        }
    }
}

/// How a language spells comments and string literals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Syntax {
    /// `# comment`, triple-quoted blocks.
    Hash,
    /// `// comment`, `/* block */`, backtick templates.
    Slash,
}

impl Syntax {
    fn for_language(language: &str) -> Self {
        match language.to_ascii_lowercase().as_str() {
            "python" | "python3" | "ruby" | "perl" | "r" | "bash" | "sh" | "shell" => Self::Hash,
            _ => Self::Slash,
        }
    }
}

enum LexState {
    Code,
    LineComment,
    BlockComment,
    Literal { quote: char, triple: bool },
}

/// Two byte-aligned renditions of a source. `code` has comments blanked
/// out; `bare` additionally has string literal contents replaced by
/// [`MASK`]. Quotes and newlines survive in both.
struct Views {
    code: String,
    bare: String,
}

impl Views {
    fn keep(&mut self, s: &str) {
        self.code.push_str(s);
        self.bare.push_str(s);
    }

    fn blank(&mut self, c: char) {
        if c == '\n' {
            self.keep("\n");
        } else {
            for _ in 0..c.len_utf8() {
                self.code.push(' ');
                self.bare.push(' ');
            }
        }
    }

    fn literal(&mut self, c: char) {
        self.code.push(c);
        if c == '\n' {
            self.bare.push('\n');
        } else {
            for _ in 0..c.len_utf8() {
                self.bare.push(MASK);
            }
        }
    }

    fn split(source: &str, syntax: Syntax) -> Self {
        let mut views = Self {
            code: String::with_capacity(source.len()),
            bare: String::with_capacity(source.len()),
        };
        let mut state = LexState::Code;
        let mut escaped = false;
        // Characters of a multi-character delimiter already emitted.
        let mut consumed = 0usize;

        for (i, c) in source.char_indices() {
            if consumed > 0 {
                consumed -= 1;
                continue;
            }
            let rest = source.get(i..).unwrap_or_default();
            let mut buf = [0u8; 4];
            match state {
                LexState::Code => {
                    if (syntax == Syntax::Hash && c == '#')
                        || (syntax == Syntax::Slash && rest.starts_with("//"))
                    {
                        state = LexState::LineComment;
                        views.blank(c);
                    } else if syntax == Syntax::Slash && rest.starts_with("/*") {
                        state = LexState::BlockComment;
                        views.blank('/');
                        views.blank('*');
                        consumed = 1;
                    } else if c == '"' || c == '\'' || (syntax == Syntax::Slash && c == '`') {
                        let triple = syntax == Syntax::Hash
                            && (rest.starts_with("\"\"\"") || rest.starts_with("'''"));
                        let width = if triple { 3 } else { 1 };
                        views.keep(rest.get(..width).unwrap_or_default());
                        consumed = width - 1;
                        state = LexState::Literal { quote: c, triple };
                    } else {
                        views.keep(c.encode_utf8(&mut buf));
                    }
                }
                LexState::LineComment => {
                    if c == '\n' {
                        state = LexState::Code;
                    }
                    views.blank(c);
                }
                LexState::BlockComment => {
                    if rest.starts_with("*/") {
                        views.blank('*');
                        views.blank('/');
                        consumed = 1;
                        state = LexState::Code;
                    } else {
                        views.blank(c);
                    }
                }
                LexState::Literal { quote, triple } => {
                    let closes_triple =
                        rest.get(..3).is_some_and(|d| d.chars().all(|d| d == quote));
                    if escaped {
                        escaped = false;
                        views.literal(c);
                    } else if c == '\\' {
                        escaped = true;
                        views.literal(c);
                    } else if c == quote && !triple {
                        views.keep(c.encode_utf8(&mut buf));
                        state = LexState::Code;
                    } else if c == quote && closes_triple {
                        views.keep(rest.get(..3).unwrap_or_default());
                        consumed = 2;
                        state = LexState::Code;
                    } else {
                        views.literal(c);
                        // An unterminated single-line literal ends with its line.
                        if c == '\n' && !triple && quote != '`' {
                            state = LexState::Code;
                        }
                    }
                }
            }
        }
        views
    }

    /// Statements as aligned `(code, bare)` slices, split on the newlines,
    /// `;` and `:` that sit outside literals.
    fn statements(&self) -> Vec<(&str, &str)> {
        let ends = self
            .bare
            .char_indices()
            .filter(|(_, c)| matches!(c, '\n' | ';' | ':'))
            .map(|(i, _)| i)
            .chain(std::iter::once(self.bare.len()));
        let mut statements = Vec::new();
        let mut start = 0;
        for end in ends {
            if let (Some(code), Some(bare)) = (self.code.get(start..end), self.bare.get(start..end))
            {
                statements.push((code, bare));
            }
            start = end + 1;
        }
        statements
    }
}

/// Whether byte `at` of `bare` lies inside a string literal.
fn masked(bare: &str, at: usize) -> bool {
    bare.get(at..).is_some_and(|rest| rest.starts_with(MASK))
}

#[derive(Debug)]
pub struct SecurityPolicy {
    syntax: Syntax,
    allowed_imports: Vec<String>,
    blocked_imports: Vec<String>,
    single_imports: Vec<Regex>,
    list_import: Regex,
    call_import: Regex,
    blocked_calls: Vec<(String, Regex)>,
}

fn compile(pattern: &str) -> EngineResult<Regex> {
    Regex::new(pattern).map_err(|e| EngineError::Config(format!("bad pattern {pattern:?}: {e}")))
}

/// `module` is covered by `entry` if equal to it or nested below it.
fn covers(entry: &str, module: &str) -> bool {
    module == entry
        || module
            .strip_prefix(entry)
            .is_some_and(|rest| rest.starts_with('.') || rest.starts_with('/'))
}

impl SecurityPolicy {
    /// Compile `rules` for sources written in `language`, which decides the
    /// comment and string syntax the scan masks.
    pub fn compile(rules: &SecurityRules, language: &str) -> EngineResult<Self> {
        let single_imports = SINGLE_IMPORT_PATTERNS
            .iter()
            .map(|p| compile(p))
            .collect::<EngineResult<Vec<_>>>()?;
        let blocked_calls = rules
            .blocked_functions
            .iter()
            .filter(|name| !name.trim().is_empty())
            .map(|name| {
                let pattern = format!(r"(?:^|[^\w.]){}\s*\(", regex::escape(name.trim()));
                compile(&pattern).map(|re| (name.trim().to_string(), re))
            })
            .collect::<EngineResult<Vec<_>>>()?;

        Ok(Self {
            syntax: Syntax::for_language(language),
            allowed_imports: rules.allowed_imports.clone(),
            blocked_imports: rules.blocked_imports.clone(),
            single_imports,
            list_import: compile(LIST_IMPORT_PATTERN)?,
            call_import: compile(CALL_IMPORT_PATTERN)?,
            blocked_calls,
        })
    }

    /// Every module the source imports, in order of appearance.
    pub fn imports(&self, source: &str) -> Vec<String> {
        let views = Views::split(source, self.syntax);
        let mut modules = Vec::new();
        for (code, bare) in views.statements() {
            let indent = code.len() - code.trim_start().len();
            if !masked(bare, indent) {
                self.statement_imports(code, &mut modules);
            }
            for caps in self.call_import.captures_iter(code) {
                if let (Some(call), Some(module)) = (caps.get(0), caps.get(1))
                    && !masked(bare, call.start())
                {
                    modules.push(module.as_str().to_string());
                }
            }
        }
        modules
    }

    fn statement_imports(&self, statement: &str, modules: &mut Vec<String>) {
        if let Some(caps) = self.list_import.captures(statement)
            && let Some(list) = caps.get(1)
        {
            for item in list.as_str().split(',') {
                if let Some(module) = item.split_whitespace().next() {
                    modules.push(module.to_string());
                }
            }
            return;
        }
        for re in &self.single_imports {
            if let Some(module) = re.captures(statement).and_then(|c| c.get(1)) {
                modules.push(module.as_str().to_string());
                return;
            }
        }
    }

    pub fn scan(&self, source: &str) -> ScanReport {
        let mut report = ScanReport::default();

        for module in self.imports(source) {
            if self.blocked_imports.iter().any(|b| covers(b, &module)) {
                report.record(
                    format!("import {module}"),
                    format!("blocked import: {module}"),
                );
            } else if !self.allowed_imports.is_empty()
                && !self.allowed_imports.iter().any(|a| covers(a, &module))
            {
                report.record(
                    format!("import {module}"),
                    format!("import not in allowed list: {module}"),
                );
            }
        }

        let bare = Views::split(source, self.syntax).bare;
        for (name, re) in &self.blocked_calls {
            if bare.lines().any(|line| re.is_match(line)) {
                report.record(format!("{name}()"), format!("blocked function call: {name}"));
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy_for(
        language: &str,
        allowed: &[&str],
        blocked: &[&str],
        functions: &[&str],
    ) -> SecurityPolicy {
        let owned = |v: &[&str]| v.iter().map(|s| s.to_string()).collect();
        SecurityPolicy::compile(
            &SecurityRules {
                allowed_imports: owned(allowed),
                blocked_imports: owned(blocked),
                blocked_functions: owned(functions),
            },
            language,
        )
        .unwrap()
    }

    fn policy(allowed: &[&str], blocked: &[&str], functions: &[&str]) -> SecurityPolicy {
        policy_for("python", allowed, blocked, functions)
    }

    #[test]
    fn recognizes_python_import_forms() {
        let p = policy(&[], &[], &[]);
        let source = "import os, sys as system  # std\n\
                      from collections.abc import Mapping\n\
                      if True: import json\n\
                      x = 1; import re\n\
                      m = __import__('socket')\n\
                      mod = importlib.import_module(\"ctypes\")\n";
        assert_eq!(
            p.imports(source),
            vec!["os", "sys", "collections.abc", "json", "re", "socket", "ctypes"]
        );
    }

    #[test]
    fn recognizes_brace_language_import_forms() {
        let p = policy_for("javascript", &[], &[], &[]);
        let source = "const fs = require('fs'); // load fs\n\
                      import x from \"lodash\";\n\
                      #include <stdio.h>\n\
                      import java.util.List;\n\
                      import static java.lang.Math.max;\n\
                      import java.io.*;\n\
                      const cp = await import('node:child_process');\n\
                      Class<?> k = Class.forName(\"java.lang.Runtime\");\n";
        assert_eq!(
            p.imports(source),
            vec![
                "fs",
                "lodash",
                "stdio.h",
                "java.util.List",
                "java.lang.Math.max",
                "java.io",
                "node:child_process",
                "java.lang.Runtime"
            ]
        );
    }

    #[test]
    fn blocked_import_covers_submodules() {
        let p = policy(&[], &["os", "subprocess"], &[]);
        let report = p.scan("import os.path\nfrom subprocess import run\nimport osmosis\n");
        assert_eq!(
            report.blocked_operations,
            vec!["import os.path", "import subprocess"]
        );
        assert_eq!(report.violations[0], "blocked import: os.path");
    }

    #[test]
    fn trailing_comments_and_inline_statements_do_not_hide_imports() {
        let p = policy(&[], &["os"], &[]);
        for source in [
            "import os  # for paths\n",
            "if True: import os\n",
            "x = 1; import os\n",
            "from os import path  # joins\n",
            "m = __import__('os')\n",
            "m = __import__( \"os\" , globals())\n",
            "import importlib\nm = importlib.import_module('os.path')\n",
        ] {
            let report = p.scan(source);
            assert!(!report.is_clean(), "{source:?} slipped through");
        }
    }

    #[test]
    fn commented_and_quoted_imports_are_ignored() {
        let p = policy(&[], &["os", "socket"], &[]);
        let source = "# import os\n\
                      print('import os')\n\
                      s = \"\"\"\n\
                      import socket\n\
                      \"\"\"\n\
                      note = \"require('os')\"\n";
        assert!(p.imports(source).is_empty());
        assert!(p.scan(source).is_clean());

        let js = policy_for("javascript", &[], &["child_process"], &[]);
        let source = "// const cp = require('child_process');\n\
                      /* import cp from 'child_process'; */\n\
                      console.log(`require('child_process')`);\n";
        assert!(js.scan(source).is_clean());
    }

    #[test]
    fn allow_list_rejects_everything_else() {
        let p = policy(&["math", "json"], &[], &[]);
        assert!(p.scan("import math\nimport json\n").is_clean());
        let report = p.scan("import math\nimport socket\n");
        assert_eq!(report.violations, vec!["import not in allowed list: socket"]);
    }

    #[test]
    fn blocked_calls_match_direct_invocations_only() {
        let p = policy(&[], &[], &["eval", "os.system"]);
        let report = p.scan("x = eval ('1+1')\nos.system('ls')\n");
        assert_eq!(report.blocked_operations, vec!["eval()", "os.system()"]);

        assert!(p.scan("evaluate(1)\nmy.eval(2)\nprint('eval')\n").is_clean());
    }

    #[test]
    fn blocked_calls_inside_strings_and_comments_are_ignored() {
        let p = policy(&[], &[], &["eval", "exec"]);
        let source = "print(\"never call eval() on input\")\n\
                      # exec(code) would be unsafe\n\
                      doc = '''use exec() sparingly'''\n";
        assert!(p.scan(source).is_clean());

        let report = p.scan("print('ok'); eval(input())  # eval\n");
        assert_eq!(report.blocked_operations, vec!["eval()"]);

        let js = policy_for("javascript", &[], &[], &["eval"]);
        assert!(js.scan("// eval(x)\nconst s = 'eval(x)'; /* eval(y) */\n").is_clean());
        assert!(!js.scan("const y = eval(x);\n").is_clean());
    }

    #[test]
    fn repeated_offenses_are_reported_once() {
        let p = policy(&[], &["socket"], &[]);
        let report = p.scan("import socket\nimport socket\n");
        assert_eq!(report.violations.len(), 1);
    }
}
