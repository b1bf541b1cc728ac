//! Deny-lists for expression evaluation
//!
//! The grammar already makes most dangerous constructs unrepresentable. These
//! lists cover what the grammar can express (paths and calls) and screen text
//! that failed to parse, so it is reported as blocked rather than echoed.

/// Roots that must never be read or called
pub const DENIED_ROOTS: &[&str] = &[
    "process",
    "global",
    "globalThis",
    "window",
    "document",
    "eval",
    "Function",
    "require",
    "module",
    "exports",
    "setTimeout",
    "setInterval",
    "setImmediate",
    "fetch",
    "XMLHttpRequest",
    "localStorage",
    "sessionStorage",
    "indexedDB",
    "WebSocket",
    "import",
    "this",
    "constructor",
    "Reflect",
    "Proxy",
];

/// Properties that must never be traversed
pub const DENIED_PROPERTIES: &[&str] = &[
    "constructor",
    "prototype",
    "__proto__",
    "__defineGetter__",
    "__defineSetter__",
    "__lookupGetter__",
    "__lookupSetter__",
];

/// Statement keywords that mark unparseable text as hostile
const DENIED_KEYWORDS: &[&str] = &[
    "new", "delete", "for", "while", "do", "function", "class", "import", "export", "return",
    "var", "let", "const", "async", "await", "yield", "with", "try", "catch", "throw",
];

pub fn is_denied_root(name: &str) -> bool {
    DENIED_ROOTS.contains(&name)
}

pub fn is_denied_property(name: &str) -> bool {
    DENIED_PROPERTIES.contains(&name)
}

/// Screen text that did not parse as an expression.
///
/// Returns the reason it is blocked, or `None` when it is safe to treat the
/// text as a literal string.
pub fn screen(text: &str) -> Option<String> {
    let code = strip_string_literals(text);

    for token in ["=>", "++", "--", ";", "`", "{", "}"] {
        if code.contains(token) {
            return Some(format!("contains '{}'", token));
        }
    }
    if has_assignment(&code) {
        return Some("contains assignment".to_string());
    }

    for word in identifiers(&code) {
        if DENIED_KEYWORDS.contains(&word) {
            return Some(format!("contains keyword '{}'", word));
        }
        if is_denied_root(word) || is_denied_property(word) {
            return Some(format!("references '{}'", word));
        }
    }
    None
}

/// Blank out quoted sections so their contents are not screened
fn strip_string_literals(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for c in text.chars() {
        match quote {
            Some(q) => {
                if escaped {
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == q {
                    quote = None;
                    out.push(c);
                    continue;
                }
                out.push(' ');
            }
            None => {
                if c == '"' || c == '\'' {
                    quote = Some(c);
                }
                out.push(c);
            }
        }
    }
    out
}

/// A single `=` that is not part of `==`, `!=`, `<=`, `>=` or `=>`
fn has_assignment(code: &str) -> bool {
    let bytes = code.as_bytes();
    bytes.iter().enumerate().any(|(i, &b)| {
        if b != b'=' {
            return false;
        }
        let prev = if i > 0 { bytes[i - 1] } else { b' ' };
        let next = bytes.get(i + 1).copied().unwrap_or(b' ');
        !matches!(prev, b'=' | b'!' | b'<' | b'>') && !matches!(next, b'=' | b'>')
    })
}

fn identifiers(code: &str) -> impl Iterator<Item = &str> {
    code.split(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '$'))
        .filter(|w| !w.is_empty())
}
