//! Static lexical screening of submitted code.
//!
//! This is a cheap pre-filter that runs before any process exists. String
//! concatenation, alternate encodings or dynamic attribute access get past it
//! easily, so passing the screener says nothing about safety. Isolation comes
//! from the subprocess and whatever container boundary surrounds it.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeSet;

use crate::config::ExecutorConfig;

static IMPORT_STMT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^\s*import\s+([A-Za-z_][\w.]*(?:\s+as\s+\w+)?(?:\s*,\s*[A-Za-z_][\w.]*(?:\s+as\s+\w+)?)*)")
        .expect("import pattern")
});

static FROM_IMPORT_STMT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^\s*from\s+(\.*[A-Za-z_][\w.]*|\.+)\s+import\b").expect("from-import pattern")
});

static DYNAMIC_EXEC: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(eval|exec|compile|__import__)\s*\(").expect("dynamic exec pattern")
});

#[derive(Debug, Clone)]
pub struct SecurityScreener {
    blocked_patterns: Vec<String>,
    allowed_modules: BTreeSet<String>,
}

impl SecurityScreener {
    pub fn new(blocked_patterns: Vec<String>, allowed_modules: impl IntoIterator<Item = String>) -> Self {
        Self {
            blocked_patterns,
            allowed_modules: allowed_modules.into_iter().collect(),
        }
    }

    pub fn from_config(config: &ExecutorConfig) -> Self {
        Self::new(
            config.blocked_patterns.clone(),
            config.allowed_modules.iter().cloned(),
        )
    }

    /// Every violation found in `code`; empty when the code passes.
    pub fn scan(&self, code: &str) -> Vec<String> {
        let mut violations = Vec::new();

        for pattern in &self.blocked_patterns {
            if code.contains(pattern.as_str()) {
                violations.push(format!("Blocked pattern '{}'", pattern));
            }
        }

        for module in imported_modules(code) {
            if !self.is_module_allowed(&module) {
                violations.push(format!("Import of module '{}' is not allowed", module));
            }
        }

        let mut seen = BTreeSet::new();
        for captures in DYNAMIC_EXEC.captures_iter(code) {
            let call = &captures[1];
            if seen.insert(call.to_string()) {
                violations.push(format!("Dynamic code execution via '{}(' is not allowed", call));
            }
        }

        violations
    }

    /// Checks the top-level package, so `collections.abc` is judged as `collections`.
    pub fn is_module_allowed(&self, module: &str) -> bool {
        let root = module.split('.').next().unwrap_or(module);
        self.allowed_modules.contains(root)
    }
}

/// Module names referenced by `import` and `from ... import` statements, in order of appearance.
pub fn imported_modules(code: &str) -> Vec<String> {
    let mut found: Vec<(usize, String)> = Vec::new();

    for captures in IMPORT_STMT.captures_iter(code) {
        let Some(list) = captures.get(1) else { continue };
        for item in list.as_str().split(',') {
            let name = item.split_whitespace().next().unwrap_or_default();
            if !name.is_empty() {
                found.push((list.start(), name.to_string()));
            }
        }
    }

    for captures in FROM_IMPORT_STMT.captures_iter(code) {
        if let Some(module) = captures.get(1) {
            found.push((module.start(), module.as_str().to_string()));
        }
    }

    found.sort_by_key(|(offset, _)| *offset);
    found.into_iter().map(|(_, name)| name).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn screener() -> SecurityScreener {
        SecurityScreener::from_config(&ExecutorConfig::default())
    }

    #[test]
    fn plain_code_passes() {
        let code = "import math\nfrom collections import Counter\n\nprint(math.sqrt(16), Counter('aab'))\n";
        assert!(screener().scan(code).is_empty());
    }

    #[test]
    fn import_os_is_rejected() {
        let violations = screener().scan("import os");
        assert_eq!(violations, vec!["Import of module 'os' is not allowed"]);
    }

    #[test]
    fn extracts_every_form_of_import() {
        let code = "import math, sys as s\nfrom os.path import join\n  import collections.abc\nfrom . import sibling\n";
        assert_eq!(
            imported_modules(code),
            vec!["math", "sys", "os.path", "collections.abc", "."]
        );
    }

    #[test]
    fn dotted_import_checks_top_level_package() {
        let screener = screener();
        assert!(screener.scan("import collections.abc").is_empty());
        assert_eq!(screener.scan("from os.path import join").len(), 1);
    }

    #[test]
    fn dynamic_execution_forms_are_detected() {
        let violations = screener().scan("eval ('1+1')\nexec(\"x=1\")\ncompile('x', 'f', 'exec')\n");
        assert!(violations.iter().any(|v| v.contains("'eval('")));
        assert!(violations.iter().any(|v| v.contains("'exec('")));
        assert!(violations.iter().any(|v| v.contains("'compile('")));
    }

    #[test]
    fn accumulates_violations_from_all_checks() {
        let code = "import socket\n__import__('os')\nf = open('/etc/passwd')\n";
        let violations = screener().scan(code);
        // blocklist: socket, open( ; import: socket ; dynamic: __import__
        assert!(violations.iter().any(|v| v == "Blocked pattern 'socket'"));
        assert!(violations.iter().any(|v| v == "Blocked pattern 'open('"));
        assert!(violations.iter().any(|v| v.contains("module 'socket'")));
        assert!(violations.iter().any(|v| v.contains("'__import__('")));
        assert_eq!(violations.len(), 4);
    }

    #[test]
    fn identifiers_containing_keywords_are_not_calls() {
        let code = "def my_evaluate(x):\n    return x\nprint(my_evaluate(2))\nretval = 3\n";
        assert!(screener().scan(code).is_empty());
    }

    #[test]
    fn custom_lists_replace_defaults() {
        let screener = SecurityScreener::new(vec!["print(".into()], vec!["signal".to_string()]);
        assert!(screener.is_module_allowed("signal"));
        assert!(screener.is_module_allowed("signal.handlers"));
        assert!(!screener.is_module_allowed("os.path"));
        assert_eq!(screener.scan("import signal\nprint(1)").len(), 1);
        assert_eq!(screener.scan("import math").len(), 1);
    }
}
