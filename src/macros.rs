//! Macro evaluator (§4.4).
//!
//! Substitutes `{name}` tokens in PV-name templates. Grounded on
//! `seqMacParse`/`seqMacEval`/`seqChanNameEval` in `seq_main.c`: the
//! `program(...)` statement's macro list is parsed first, then the
//! `seq(..., macroString, ...)` command-line list is parsed over it so that
//! command-line values win (§8 "Macro": "Command-line `a=1` overrides
//! program-statement `a=0`").

use std::collections::HashMap;

/// Maximum nested expansion depth before giving up (§4.4 "cycle detection
/// by bounding depth"). Token values never reference other tokens in this
/// implementation, so a single pass always terminates, but the guard
/// documents the intended contract if that ever changes.
const MAX_EXPANSION_DEPTH: usize = 32;

/// An ordered key/value table, later entries overriding earlier ones.
#[derive(Debug, Default, Clone)]
pub struct MacroTable {
    values: HashMap<String, String>,
}

impl MacroTable {
    pub fn new() -> Self {
        MacroTable {
            values: HashMap::new(),
        }
    }

    /// Parse a comma-separated `key=value` list, as accepted by both the
    /// `program(...)` statement and the `seq()` command-line argument
    /// (§6 "CLI/host surface"). Entries already present are overwritten,
    /// which is exactly how command-line macros are meant to win over
    /// program-statement macros when parsed second.
    pub fn parse(&mut self, spec: &str) {
        for pair in spec.split(',') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            if let Some((key, value)) = pair.split_once('=') {
                self.values
                    .insert(key.trim().to_string(), value.trim().to_string());
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.values.insert(key.to_string(), value.to_string());
    }

    /// Expand every `{name}` token in `template`, one pass, left to right.
    /// Undefined tokens expand to the empty string.
    pub fn expand(&self, template: &str) -> String {
        let mut out = String::with_capacity(template.len());
        let mut depth = 0;
        let mut chars = template.chars().peekable();
        while let Some(c) = chars.next() {
            if c == '{' {
                depth += 1;
                if depth > MAX_EXPANSION_DEPTH {
                    break;
                }
                let mut name = String::new();
                let mut closed = false;
                for c2 in chars.by_ref() {
                    if c2 == '}' {
                        closed = true;
                        break;
                    }
                    name.push(c2);
                }
                if closed {
                    if let Some(value) = self.get(&name) {
                        out.push_str(value);
                    }
                    // undefined token -> empty string
                } else {
                    // unterminated token: emit verbatim
                    out.push('{');
                    out.push_str(&name);
                }
                depth -= 1;
            } else {
                out.push(c);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_adjacent_tokens() {
        let mut m = MacroTable::new();
        m.set("a", "foo");
        m.set("b", "bar");
        assert_eq!(m.expand("{a}{b}"), "foobar");
    }

    #[test]
    fn undefined_token_expands_to_empty() {
        let m = MacroTable::new();
        assert_eq!(m.expand("{undefined}"), "");
    }

    #[test]
    fn command_line_overrides_program_statement() {
        let mut m = MacroTable::new();
        m.parse("a=0");
        m.parse("a=1");
        assert_eq!(m.get("a"), Some("1"));
    }

    #[test]
    fn parse_ignores_blank_entries() {
        let mut m = MacroTable::new();
        m.parse("name=seqtest,, priority=10 ,logfile=/tmp/x.log");
        assert_eq!(m.get("name"), Some("seqtest"));
        assert_eq!(m.get("priority"), Some("10"));
        assert_eq!(m.get("logfile"), Some("/tmp/x.log"));
    }

    #[test]
    fn literal_text_passes_through() {
        let m = MacroTable::new();
        assert_eq!(m.expand("no-macros-here"), "no-macros-here");
    }
}
