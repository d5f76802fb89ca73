//! Static security validation of generated source.
//!
//! The validator is pure and synchronous: it scans source text against a
//! closed set of rules and reports tagged findings. Identical input always
//! yields identical findings, in the same order, so results are cacheable
//! and test assertions are stable.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Closed set of rules the validator enforces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityRule {
    /// `eval(...)` or `new Function(...)`
    DynamicEval,
    /// Shell/process spawning modules (`child_process` and friends)
    ProcessExecution,
    /// Direct filesystem modules (`fs`, `node:fs`, ...)
    FilesystemAccess,
    /// Import outside the approved bundle catalog, including HTTP clients
    /// that bypass the platform fetch shim
    ForbiddenImport,
    /// Browser persistent storage bypassing the data-access shim
    PersistentStorage,
    /// Popup / window-control calls
    WindowControl,
    /// Entry file without a top-level default export (stylistic)
    MissingDefaultExport,
}

/// Finding severity. `Block` aborts bundling; `Warn` is advisory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warn,
    Block,
}

/// Where in the submitted source a finding was produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocation {
    pub file: String,
    /// 1-based line number; 0 for whole-file findings.
    pub line: usize,
}

/// A single validation finding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityFinding {
    pub rule: SecurityRule,
    pub severity: Severity,
    pub message: String,
    pub location: SourceLocation,
}

impl SecurityFinding {
    pub fn blocks(&self) -> bool {
        self.severity == Severity::Block
    }
}

/// Node built-ins and known sandbox-hostile modules, mapped to the rule
/// their import violates. Checked before the catalog: these are denied even
/// if a future catalog entry were to shadow them.
const DENIED_MODULES: &[(&str, SecurityRule)] = &[
    ("child_process", SecurityRule::ProcessExecution),
    ("node:child_process", SecurityRule::ProcessExecution),
    ("worker_threads", SecurityRule::ProcessExecution),
    ("node:worker_threads", SecurityRule::ProcessExecution),
    ("cluster", SecurityRule::ProcessExecution),
    ("vm", SecurityRule::DynamicEval),
    ("node:vm", SecurityRule::DynamicEval),
    ("fs", SecurityRule::FilesystemAccess),
    ("node:fs", SecurityRule::FilesystemAccess),
    ("fs/promises", SecurityRule::FilesystemAccess),
    ("node:fs/promises", SecurityRule::FilesystemAccess),
    ("os", SecurityRule::FilesystemAccess),
    ("node:os", SecurityRule::FilesystemAccess),
    ("net", SecurityRule::ForbiddenImport),
    ("node:net", SecurityRule::ForbiddenImport),
    ("dgram", SecurityRule::ForbiddenImport),
    ("http", SecurityRule::ForbiddenImport),
    ("https", SecurityRule::ForbiddenImport),
    ("axios", SecurityRule::ForbiddenImport),
    ("node-fetch", SecurityRule::ForbiddenImport),
    ("undici", SecurityRule::ForbiddenImport),
];

struct Pattern {
    rule: SecurityRule,
    severity: Severity,
    regex: Regex,
    message: &'static str,
}

/// Scans submitted source for disallowed constructs.
pub struct SecurityValidator {
    patterns: Vec<Pattern>,
    /// `require("x")` / dynamic `import("x")`, anywhere in a line.
    call_import: Regex,
    /// Static import lines, including the `} from "x"` continuation line
    /// of a multi-line import.
    module_line: Regex,
    /// Module names resolvable at bundle time; anything else is forbidden.
    catalog: BTreeSet<String>,
}

impl SecurityValidator {
    /// Build a validator whose import rules resolve against the given
    /// approved module catalog.
    pub fn new<I, S>(approved_modules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let patterns = vec![
            Pattern {
                rule: SecurityRule::DynamicEval,
                severity: Severity::Block,
                regex: Regex::new(r"(?:^|[^.\w])eval\s*\(").expect("static regex"),
                message: "eval() allows arbitrary code execution",
            },
            Pattern {
                rule: SecurityRule::DynamicEval,
                severity: Severity::Block,
                regex: Regex::new(r"\bnew\s+Function\s*\(").expect("static regex"),
                message: "Function constructor allows arbitrary code execution",
            },
            Pattern {
                rule: SecurityRule::PersistentStorage,
                severity: Severity::Block,
                regex: Regex::new(r"\b(?:localStorage|sessionStorage|indexedDB)\b")
                    .expect("static regex"),
                message: "direct browser storage bypasses the data-access shim",
            },
            Pattern {
                rule: SecurityRule::WindowControl,
                severity: Severity::Block,
                regex: Regex::new(r"\bwindow\.open\s*\(").expect("static regex"),
                message: "window.open() is not permitted in sandboxed apps",
            },
            Pattern {
                rule: SecurityRule::WindowControl,
                severity: Severity::Block,
                regex: Regex::new(r"(?:^|[^.\w])(?:alert|confirm|prompt)\s*\(")
                    .expect("static regex"),
                message: "blocking popup dialogs are not permitted in sandboxed apps",
            },
        ];

        Self {
            patterns,
            call_import: Regex::new(r#"\b(?:require|import)\s*\(\s*["']([^"']+)["']"#)
                .expect("static regex"),
            module_line: Regex::new(r#"^\s*(?:import\s+[^("']*|\}?\s*from\s+)["']([^"']+)["']"#)
                .expect("static regex"),
            catalog: approved_modules.into_iter().map(Into::into).collect(),
        }
    }

    /// Scan one source file. Findings come back in scan order: patterns in
    /// declaration order per line, lines in file order, whole-file findings
    /// last.
    pub fn validate(&self, file: &str, source: &str) -> Vec<SecurityFinding> {
        let mut findings = Vec::new();

        for (idx, line) in source.lines().enumerate() {
            let line_no = idx + 1;

            for pattern in &self.patterns {
                if pattern.regex.is_match(line) {
                    findings.push(SecurityFinding {
                        rule: pattern.rule,
                        severity: pattern.severity,
                        message: pattern.message.to_string(),
                        location: SourceLocation {
                            file: file.to_string(),
                            line: line_no,
                        },
                    });
                }
            }

            for capture in self.call_import.captures_iter(line) {
                if let Some(finding) = self.classify_import(file, line_no, &capture[1]) {
                    findings.push(finding);
                }
            }
            if let Some(capture) = self.module_line.captures(line) {
                if let Some(finding) = self.classify_import(file, line_no, &capture[1]) {
                    findings.push(finding);
                }
            }
        }

        if is_entry_file(file) && !source.contains("export default") {
            findings.push(SecurityFinding {
                rule: SecurityRule::MissingDefaultExport,
                severity: Severity::Warn,
                message: "entry file has no top-level default export".to_string(),
                location: SourceLocation {
                    file: file.to_string(),
                    line: 0,
                },
            });
        }

        findings
    }

    fn classify_import(&self, file: &str, line: usize, module: &str) -> Option<SecurityFinding> {
        // Relative imports resolve within the submitted file set.
        if module.starts_with("./") || module.starts_with("../") {
            return None;
        }

        let location = SourceLocation {
            file: file.to_string(),
            line,
        };

        if let Some((name, rule)) = DENIED_MODULES.iter().find(|(name, _)| *name == module) {
            return Some(SecurityFinding {
                rule: *rule,
                severity: Severity::Block,
                message: format!("import of denied module '{}'", name),
                location,
            });
        }

        if self.catalog.contains(module) {
            return None;
        }

        Some(SecurityFinding {
            rule: SecurityRule::ForbiddenImport,
            severity: Severity::Block,
            message: format!("import of '{}' is not in the approved bundle catalog", module),
            location,
        })
    }
}

/// Entry files are the ones expected to carry the app's default export.
fn is_entry_file(file: &str) -> bool {
    matches!(
        file,
        "index.js" | "index.jsx" | "index.ts" | "index.tsx" | "App.jsx" | "App.tsx"
    )
}
