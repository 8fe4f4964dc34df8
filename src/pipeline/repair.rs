//! Repair: deterministic cleanup of model-generated JSON.
//!
//! Models asked for "a JSON object and no other text" still produce:
//!
//! - the object wrapped in ` ```json ... ``` ` fences, or with a sentence of
//!   prose before or after it
//! - trailing commas before `}` or `]`
//! - unquoted keys (`{full_name: "..."}`)
//! - single-quoted strings (`{'full_name': 'Emmy Noether'}`)
//! - Python literals (`None`, `True`, `False`)
//! - output cut off mid-string when `max_tokens` is reached
//!
//! [`parse_response`] first tries a strict parse of the outermost object and
//! only runs [`repair_json`] when that fails, so well-formed responses are
//! never rewritten.
//!
//! ## Rule Order
//!
//! Quote normalisation runs first so every later rule can rely on strings
//! being double-quoted. Truncation closing runs before the comma rule so a
//! dangling `,` left by the cut is removed together with the closers.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

/// A parsed response and whether the repair pass was needed to get it.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedResponse {
    pub value: Value,
    pub repaired: bool,
}

/// Parse a raw completion into a JSON object, repairing it if necessary.
///
/// Returns `Err` with a human-readable reason when no object can be
/// recovered; the caller treats that as a failed attempt.
pub fn parse_response(raw: &str) -> Result<ParsedResponse, String> {
    let unfenced = strip_code_fences(raw);
    let candidate = extract_object(&unfenced)
        .ok_or_else(|| "response contains no JSON object".to_string())?;

    if let Ok(value) = serde_json::from_str::<Value>(candidate) {
        return require_object(value).map(|value| ParsedResponse {
            value,
            repaired: false,
        });
    }

    let repaired = repair_json(candidate);
    match serde_json::from_str::<Value>(&repaired) {
        Ok(value) => require_object(value).map(|value| ParsedResponse {
            value,
            repaired: true,
        }),
        Err(e) => Err(format!("unparseable JSON after repair: {e}")),
    }
}

fn require_object(value: Value) -> Result<Value, String> {
    if value.is_object() {
        Ok(value)
    } else {
        Err("response JSON is not an object".to_string())
    }
}

/// Apply every repair rule to an object candidate.
pub fn repair_json(input: &str) -> String {
    let s = normalise_quotes(input);
    let s = close_truncated(&s);
    map_outside_strings(&s, |plain| {
        let p = replace_python_literals(plain);
        let p = quote_bare_keys(&p);
        remove_trailing_commas(&p)
    })
}

// ── Rule 1: Strip code fences ────────────────────────────────────────────────

static RE_FENCED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```[A-Za-z]*[ \t]*\r?\n(.*?)```").unwrap());

fn strip_code_fences(input: &str) -> String {
    match RE_FENCED.captures(input) {
        Some(caps) => caps[1].to_string(),
        None => input.to_string(),
    }
}

// ── Rule 2: Extract the outermost object ─────────────────────────────────────
//
// Scans from the first `{` to its matching `}`, skipping braces inside
// strings. When the object never closes (truncated output) the rest of the
// input is returned for the truncation rule to finish.

fn extract_object(input: &str) -> Option<&str> {
    let start = input.find('{')?;
    let body = &input[start..];
    let mut depth = 0usize;
    let mut in_string: Option<char> = None;
    let mut escaped = false;

    for (i, c) in body.char_indices() {
        if let Some(quote) = in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == quote {
                in_string = None;
            }
            continue;
        }
        match c {
            '"' | '\'' => in_string = Some(c),
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(&body[..i + c.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    Some(body.trim_end())
}

// ── Rule 3: Normalise single-quoted strings ──────────────────────────────────

#[derive(Clone, Copy, PartialEq)]
enum QuoteState {
    Plain,
    Double,
    Single,
}

fn normalise_quotes(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut state = QuoteState::Plain;
    let mut escaped = false;

    for c in input.chars() {
        match state {
            QuoteState::Plain => {
                match c {
                    '"' => state = QuoteState::Double,
                    '\'' => state = QuoteState::Single,
                    _ => {}
                }
                out.push(if c == '\'' { '"' } else { c });
            }
            QuoteState::Double => {
                out.push(c);
                if escaped {
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == '"' {
                    state = QuoteState::Plain;
                }
            }
            QuoteState::Single => {
                if escaped {
                    // `\'` is not a JSON escape; everything else is kept.
                    if c != '\'' {
                        out.push('\\');
                    }
                    out.push(c);
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == '\'' {
                    out.push('"');
                    state = QuoteState::Plain;
                } else if c == '"' {
                    out.push_str("\\\"");
                } else {
                    out.push(c);
                }
            }
        }
    }
    out
}

// ── Rule 4: Close truncated output ───────────────────────────────────────────

fn close_truncated(input: &str) -> String {
    let mut closers: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for c in input.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => closers.push('}'),
            '[' => closers.push(']'),
            '}' | ']' => {
                closers.pop();
            }
            _ => {}
        }
    }

    let mut out = input.to_string();
    if in_string {
        if escaped {
            out.pop();
        }
        out.push('"');
    }
    if closers.is_empty() {
        return out;
    }

    let trimmed_len = out.trim_end().len();
    out.truncate(trimmed_len);
    if out.ends_with(',') {
        out.pop();
    } else if out.ends_with(':') {
        out.push_str(" null");
    }
    while let Some(closer) = closers.pop() {
        out.push(closer);
    }
    out
}

// ── Rules 5-7: applied to text outside strings only ──────────────────────────

fn map_outside_strings(input: &str, rules: impl Fn(&str) -> String) -> String {
    let mut out = String::with_capacity(input.len());
    let mut plain = String::new();
    let mut chars = input.chars();

    while let Some(c) = chars.next() {
        if c != '"' {
            plain.push(c);
            continue;
        }
        out.push_str(&rules(&plain));
        plain.clear();
        out.push('"');
        let mut escaped = false;
        for s in chars.by_ref() {
            out.push(s);
            if escaped {
                escaped = false;
            } else if s == '\\' {
                escaped = true;
            } else if s == '"' {
                break;
            }
        }
    }
    out.push_str(&rules(&plain));
    out
}

static RE_PY_NONE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bNone\b").unwrap());
static RE_PY_TRUE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bTrue\b").unwrap());
static RE_PY_FALSE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bFalse\b").unwrap());

fn replace_python_literals(input: &str) -> String {
    let s = RE_PY_NONE.replace_all(input, "null");
    let s = RE_PY_TRUE.replace_all(&s, "true");
    RE_PY_FALSE.replace_all(&s, "false").into_owned()
}

static RE_BARE_KEY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([{,]\s*)([A-Za-z_][A-Za-z0-9_]*)(\s*:)").unwrap());

fn quote_bare_keys(input: &str) -> String {
    RE_BARE_KEY.replace_all(input, "$1\"$2\"$3").into_owned()
}

static RE_TRAILING_COMMA: Lazy<Regex> = Lazy::new(|| Regex::new(r",(\s*[}\]])").unwrap());

fn remove_trailing_commas(input: &str) -> String {
    RE_TRAILING_COMMA.replace_all(input, "$1").into_owned()
}
