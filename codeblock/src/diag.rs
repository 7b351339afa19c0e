// diag.rs — Toolchain diagnostics model
//
// Compiler messages captured from the external toolchain, one value per
// reported error or warning. Rendered text is kept verbatim so the editor can
// show exactly what the compiler printed.
//
// Preconditions: none.
// Postconditions: parsing keeps every diagnostic record and every non-JSON
//   line; other JSON record types are dropped.
// Failure modes: none; unparseable lines become notes.
// Side effects: none.

use std::fmt;

use serde::Deserialize;

// ── Diagnostic code ──────────────────────────────────────────────────────

/// A toolchain error code (e.g., `E0308`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DiagCode(pub String);

impl fmt::Display for DiagCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Severity level ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagLevel {
    Error,
    Warning,
    Note,
}

impl DiagLevel {
    fn parse(level: &str) -> Self {
        match level {
            "error" | "error: internal compiler error" => DiagLevel::Error,
            "warning" => DiagLevel::Warning,
            _ => DiagLevel::Note,
        }
    }
}

// ── Location ─────────────────────────────────────────────────────────────

/// Primary line range of a diagnostic inside the unit it was reported for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineRange {
    pub start: usize,
    pub end: usize,
}

// ── Diagnostic ───────────────────────────────────────────────────────────

/// A message reported by the toolchain for one compilation unit.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    /// Name of the unit (primary artifact or auxiliary crate) it belongs to.
    pub unit: String,
    pub code: Option<DiagCode>,
    pub level: DiagLevel,
    pub message: String,
    pub lines: Option<LineRange>,
    /// Compiler-rendered text, including source excerpt when available.
    pub rendered: Option<String>,
}

impl Diagnostic {
    pub fn new(unit: impl Into<String>, level: DiagLevel, message: impl Into<String>) -> Self {
        Self {
            unit: unit.into(),
            code: None,
            level,
            message: message.into(),
            lines: None,
            rendered: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(DiagCode(code.into()));
        self
    }

    pub fn with_lines(mut self, start: usize, end: usize) -> Self {
        self.lines = Some(LineRange { start, end });
        self
    }

    pub fn with_rendered(mut self, rendered: impl Into<String>) -> Self {
        self.rendered = Some(rendered.into());
        self
    }

    pub fn is_error(&self) -> bool {
        self.level == DiagLevel::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(rendered) = &self.rendered {
            return write!(f, "[{}] {}", self.unit, rendered.trim_end());
        }
        let level = match self.level {
            DiagLevel::Error => "error",
            DiagLevel::Warning => "warning",
            DiagLevel::Note => "note",
        };
        if let Some(code) = &self.code {
            write!(f, "[{}] {}[{}]: {}", self.unit, level, code, self.message)?;
        } else {
            write!(f, "[{}] {}: {}", self.unit, level, self.message)?;
        }
        if let Some(lines) = &self.lines {
            write!(f, " (line {})", lines.start)?;
        }
        Ok(())
    }
}

// ── Toolchain message parsing ────────────────────────────────────────────

#[derive(Deserialize)]
struct RawMessage {
    #[serde(rename = "$message_type")]
    message_type: Option<String>,
    // Absent on non-diagnostic records (artifact notifications).
    #[serde(default)]
    message: String,
    #[serde(default)]
    level: String,
    code: Option<RawCode>,
    #[serde(default)]
    spans: Vec<RawSpan>,
    rendered: Option<String>,
}

#[derive(Deserialize)]
struct RawCode {
    code: String,
}

#[derive(Deserialize)]
struct RawSpan {
    line_start: usize,
    line_end: usize,
    is_primary: bool,
}

/// Parse the compiler's stderr (JSON message stream) into diagnostics.
///
/// Lines that are not JSON diagnostics are kept as `Note`s so nothing the
/// toolchain printed is lost. Summary lines ("aborting due to ...") are
/// dropped.
pub fn parse_messages(unit: &str, stderr: &str) -> Vec<Diagnostic> {
    let mut diags = Vec::new();
    for line in stderr.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if !trimmed.starts_with('{') {
            diags.push(Diagnostic::new(unit, DiagLevel::Note, trimmed));
            continue;
        }
        let raw: RawMessage = match serde_json::from_str(trimmed) {
            Ok(raw) => raw,
            Err(_) => {
                diags.push(Diagnostic::new(unit, DiagLevel::Note, trimmed));
                continue;
            }
        };
        if raw
            .message_type
            .as_deref()
            .is_some_and(|t| t != "diagnostic")
        {
            continue;
        }
        if raw.spans.is_empty() && raw.message.starts_with("aborting due to") {
            continue;
        }
        let mut diag = Diagnostic::new(unit, DiagLevel::parse(&raw.level), raw.message);
        if let Some(code) = raw.code {
            diag = diag.with_code(code.code);
        }
        if let Some(span) = raw.spans.iter().find(|s| s.is_primary) {
            diag = diag.with_lines(span.line_start, span.line_end);
        }
        if let Some(rendered) = raw.rendered {
            diag = diag.with_rendered(rendered);
        }
        diags.push(diag);
    }
    diags
}

/// Concatenate diagnostics into the human-readable compiler message.
pub fn render_all(diags: &[Diagnostic]) -> String {
    let mut out = String::new();
    for d in diags {
        out.push_str(&d.to_string());
        out.push('\n');
    }
    out
}
