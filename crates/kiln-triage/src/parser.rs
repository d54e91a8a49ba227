//! Build log parser.
//!
//! Lines are tested against a rule table ordered by category. The first rule
//! that fires on a line produces an [`ErrorEvent`] whose template is the
//! normalized form of the rule's `msg` capture (or the whole match). Rules are
//! data: adding a recognizer is a call to [`LogParser::add_rule`].

use crate::config::TriageConfig;
use kiln_core::triage::{ErrorEvent, FailureCategory, LineRange};
use kiln_core::{Error, Result};
use regex::{Captures, Regex};
use std::iter::Enumerate;
use std::str::Lines;
use std::sync::LazyLock;

const UNKNOWN_RULE: &str = "unknown_tail";

/// Built-in recognizers: (name, category, pattern, transient).
const BUILTIN_RULES: &[(&str, FailureCategory, &str, bool)] = &[
    // Compilation
    (
        "compiler_error",
        FailureCategory::Compilation,
        r"^.+?:\d+(?::\d+)?: (?:fatal )?error: (?P<msg>.+)$",
        false,
    ),
    (
        "unsupported_gpu_arch",
        FailureCategory::Compilation,
        r"(?i)(?P<msg>(?:unsupported|unknown|invalid) (?:target |offload |gpu |hip )?(?:arch|architecture|target id)\b.*)$",
        false,
    ),
    (
        "compiler_driver_error",
        FailureCategory::Compilation,
        r"^(?:clang|clang\+\+|hipcc|amdclang\+\+)(?:-\d+)?: error: (?P<msg>(?:no such file|unknown argument|unsupported option|cannot specify).*)$",
        false,
    ),
    // Link
    (
        "undefined_reference",
        FailureCategory::Link,
        r"(?P<msg>undefined (?:reference|symbol)\b.*)$",
        false,
    ),
    (
        "missing_library",
        FailureCategory::Link,
        r"(?P<msg>cannot find -l\S+)",
        false,
    ),
    (
        "multiple_definition",
        FailureCategory::Link,
        r"(?P<msg>multiple definition of .+)$",
        false,
    ),
    (
        "linker_failed",
        FailureCategory::Link,
        r"(?P<msg>(?:linker command failed|ld(?:\.lld)?: error: |collect2: error: ld returned).*)$",
        false,
    ),
    // Runtime
    (
        "gpu_out_of_memory",
        FailureCategory::Runtime,
        r"(?i)(?P<msg>(?:hipErrorOutOfMemory|out of memory|\boom\b|(?:gpu|device) (?:memory|allocation) (?:error|failed)).*)$",
        true,
    ),
    (
        "device_unavailable",
        FailureCategory::Runtime,
        r"(?i)(?P<msg>(?:no (?:hip-capable |rocm-capable |amd )?(?:gpus?|devices?) (?:found|available|detected)\b|hsa_status_error_out_of_resources|device or resource busy).*)$",
        true,
    ),
    (
        "operation_timeout",
        FailureCategory::Runtime,
        r"(?i)(?P<msg>(?:timed out|deadline exceeded)\b.*)$",
        true,
    ),
    (
        "hip_error",
        FailureCategory::Runtime,
        r"(?P<msg>HIP error: .+?)(?: at \S+:\d+)?$",
        false,
    ),
    (
        "hip_api_error",
        FailureCategory::Runtime,
        r"(?P<msg>\bhip(?:Error|ApiError)\w+.*)$",
        false,
    ),
    (
        "memory_access_fault",
        FailureCategory::Runtime,
        r"(?P<msg>Memory access fault by GPU.*)$",
        false,
    ),
    (
        "kernel_launch_failure",
        FailureCategory::Runtime,
        r"(?i)(?P<msg>kernel\b.*\b(?:launch|execution)\b.*\b(?:failed|error)\b.*)$",
        false,
    ),
    (
        "segfault",
        FailureCategory::Runtime,
        r"(?P<msg>Segmentation fault|SIGSEGV|signal 11\b)",
        false,
    ),
    // Config
    (
        "cmake_error",
        FailureCategory::Config,
        r"(?P<msg>CMake Error\b.*)$",
        false,
    ),
    (
        "missing_package",
        FailureCategory::Config,
        r"(?i)(?P<msg>could not find (?:a )?(?:package|configuration file)\b.*)$",
        false,
    ),
    (
        "configure_error",
        FailureCategory::Config,
        r"(?P<msg>configure: error: .+)$",
        false,
    ),
    (
        "missing_module",
        FailureCategory::Config,
        r"(?P<msg>(?:ModuleNotFoundError|ImportError): .+)$",
        false,
    ),
    // Test
    (
        "gtest_failure",
        FailureCategory::Test,
        r"^\s*(?P<msg>\[\s+FAILED\s+\]\s+\S+)",
        false,
    ),
    (
        "ctest_failure",
        FailureCategory::Test,
        r"(?P<msg>\d+% tests passed, \d+ tests? failed.*|The following tests FAILED:?)",
        false,
    ),
    (
        "pytest_failure",
        FailureCategory::Test,
        r"^(?P<msg>FAILED \S+)",
        false,
    ),
    (
        "assertion_failure",
        FailureCategory::Test,
        r"(?i)(?P<msg>assert(?:ion)?\b.*\b(?:failed|error)\b.*)$",
        false,
    ),
];

static BUILTINS: LazyLock<Vec<ParseRule>> = LazyLock::new(|| {
    BUILTIN_RULES
        .iter()
        .map(|(name, category, pattern, transient)| {
            ParseRule::new(*name, *category, pattern)
                .map(|rule| rule.with_transient(*transient))
                .expect("builtin rule pattern")
        })
        .collect()
});

static TIMESTAMP_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:[.,]\d+)?(?:Z|[+-]\d{2}:?\d{2})?|\b\d{2}:\d{2}:\d{2}(?:\.\d+)?\b|\[\s*\d+\.\d+\]",
    )
    .unwrap()
});
static ADDRESS_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b0x[0-9a-fA-F]+\b").unwrap());
static PATH_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(^|[\s(\[='"`])/[^\s:'"`(),\]]+"#).unwrap());
static LINE_COL_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r":\d+(?::\d+)?\b").unwrap());
static NUMBER_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d+(?:\.\d+)*\b").unwrap());
static QUOTE_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#"['"‘’“”´]"#).unwrap());
static GPU_SYMBOL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(hip|hsa|rocblas|rocsparse|rocfft|rocrand|miopen|rccl)\w*\*?").unwrap()
});

/// Normalize a log fragment into a token template.
///
/// Removes timestamps, addresses, absolute paths, line/column suffixes and
/// standalone numbers, unifies quotes to a backtick and collapses GPU API
/// symbol families (`hipMalloc` becomes `hip*`). Error codes such as
/// `hipErrorOutOfMemory` keep their full name.
pub fn normalize(text: &str) -> String {
    let text = TIMESTAMP_REGEX.replace_all(text, " ");
    let text = ADDRESS_REGEX.replace_all(&text, "<addr>");
    let text = PATH_REGEX.replace_all(&text, "${1}<path>");
    let text = LINE_COL_REGEX.replace_all(&text, "");
    let text = NUMBER_REGEX.replace_all(&text, "<n>");
    let text = QUOTE_REGEX.replace_all(&text, "`");
    let text = GPU_SYMBOL_REGEX.replace_all(&text, |caps: &Captures<'_>| {
        let symbol = &caps[0];
        if symbol.starts_with("hipError") || symbol.starts_with("hsa_status") {
            symbol.to_string()
        } else {
            format!("{}*", &caps[1])
        }
    });
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn category_rank(order: &[FailureCategory], category: FailureCategory) -> Option<usize> {
    order.iter().position(|c| *c == category)
}

/// A single recognizer in the parser's rule table.
#[derive(Debug, Clone)]
pub struct ParseRule {
    name: String,
    category: FailureCategory,
    pattern: Regex,
    transient: bool,
}

impl ParseRule {
    /// Compile a rule. A named `msg` group narrows the template to that capture.
    pub fn new(
        name: impl Into<String>,
        category: FailureCategory,
        pattern: &str,
    ) -> Result<Self> {
        let name = name.into();
        if category == FailureCategory::Unknown {
            return Err(Error::Config(format!(
                "Rule {name} cannot target the unknown category"
            )));
        }
        let pattern = Regex::new(pattern)
            .map_err(|e| Error::Config(format!("Invalid pattern for rule {name}: {e}")))?;
        Ok(Self {
            name,
            category,
            pattern,
            transient: false,
        })
    }

    pub fn with_transient(mut self, transient: bool) -> Self {
        self.transient = transient;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn category(&self) -> FailureCategory {
        self.category
    }

    pub fn is_transient(&self) -> bool {
        self.transient
    }

    fn apply(&self, line_no: usize, line: &str) -> Option<ErrorEvent> {
        let caps = self.pattern.captures(line)?;
        let fragment = caps
            .name("msg")
            .or_else(|| caps.get(0))
            .map_or(line, |m| m.as_str());
        let mut template = normalize(fragment);
        if template.is_empty() {
            template = self.name.clone();
        }
        Some(ErrorEvent {
            lines: LineRange::single(line_no),
            category: self.category,
            rule: self.name.clone(),
            raw_text: line.trim_end().to_string(),
            template,
            transient: self.transient,
            embedding: None,
        })
    }
}

/// Rule-table driven log parser.
#[derive(Debug, Clone)]
pub struct LogParser {
    rules: Vec<ParseRule>,
    category_order: Vec<FailureCategory>,
    max_events: usize,
    tail_lines: usize,
}

impl LogParser {
    pub fn new(config: &TriageConfig) -> Self {
        let order = &config.category_order;
        let mut rules: Vec<ParseRule> = BUILTINS
            .iter()
            .filter(|rule| category_rank(order, rule.category).is_some())
            .cloned()
            .collect();
        rules.sort_by_key(|rule| category_rank(order, rule.category).unwrap_or(usize::MAX));

        Self {
            rules,
            category_order: order.clone(),
            max_events: config.max_events.max(1),
            tail_lines: config.unknown_tail_lines,
        }
    }

    fn rank(&self, category: FailureCategory) -> Option<usize> {
        category_rank(&self.category_order, category)
    }

    /// Register an extra rule after the existing rules of its category.
    pub fn add_rule(&mut self, rule: ParseRule) -> Result<()> {
        let Some(rank) = self.rank(rule.category) else {
            return Err(Error::Config(format!(
                "Category {} is not enabled for parsing",
                rule.category
            )));
        };
        let at = self
            .rules
            .iter()
            .position(|r| self.rank(r.category).is_some_and(|r| r > rank))
            .unwrap_or(self.rules.len());
        self.rules.insert(at, rule);
        Ok(())
    }

    pub fn rules(&self) -> &[ParseRule] {
        &self.rules
    }

    /// Run the rule table against one line.
    pub fn classify_line(&self, line_no: usize, line: &str) -> Result<ErrorEvent> {
        self.rules
            .iter()
            .find_map(|rule| rule.apply(line_no, line))
            .ok_or(Error::ParseNoMatch)
    }

    /// Lazily extract events from a log. Always yields at least one event.
    pub fn parse<'a>(&'a self, raw: &'a str) -> ParsedEvents<'a> {
        ParsedEvents {
            parser: self,
            raw,
            lines: raw.lines().enumerate(),
            emitted: 0,
            finished: false,
        }
    }

    fn unknown_tail(&self, raw: &str) -> ErrorEvent {
        let lines: Vec<&str> = raw.lines().collect();
        let start = lines.len().saturating_sub(self.tail_lines);
        let tail = &lines[start..];
        let template = tail
            .iter()
            .rev()
            .find(|line| !line.trim().is_empty())
            .map(|line| normalize(line))
            .unwrap_or_default();

        ErrorEvent {
            lines: LineRange {
                start,
                end: lines.len(),
            },
            category: FailureCategory::Unknown,
            rule: UNKNOWN_RULE.to_string(),
            raw_text: tail.join("\n"),
            template,
            transient: false,
            embedding: None,
        }
    }
}

impl Default for LogParser {
    fn default() -> Self {
        Self::new(&TriageConfig::default())
    }
}

/// Iterator over the events of one log, borrowing the log text.
pub struct ParsedEvents<'a> {
    parser: &'a LogParser,
    raw: &'a str,
    lines: Enumerate<Lines<'a>>,
    emitted: usize,
    finished: bool,
}

impl Iterator for ParsedEvents<'_> {
    type Item = ErrorEvent;

    fn next(&mut self) -> Option<ErrorEvent> {
        if self.finished {
            return None;
        }
        if self.emitted >= self.parser.max_events {
            self.finished = true;
            return None;
        }

        for (line_no, line) in self.lines.by_ref() {
            if let Ok(event) = self.parser.classify_line(line_no, line) {
                self.emitted += 1;
                return Some(event);
            }
        }

        self.finished = true;
        if self.emitted == 0 {
            self.emitted = 1;
            return Some(self.parser.unknown_tail(self.raw));
        }
        None
    }
}
