//! Value Renderer - flat, single-line literals for plan argument values
//!
//! Plan arguments arrive in the start document with arbitrary shape: scalars,
//! strings, nested mappings, sequences, and numeric arrays. [`ArgValue`] is the
//! closed set of shapes the renderer understands; every input is normalized
//! into it at the boundary (`From` conversions) before rendering.
//!
//! # Numeric arrays
//!
//! `ndarray` arrays are converted element by element into nested
//! [`ArgValue::Seq`] values. Their own `Display` output elides long arrays with
//! `...` and breaks rows across lines, so it must never reach the output file.
//! After conversion a numeric array and a `Vec` holding the same elements are
//! indistinguishable.
//!
//! # Rendering rules
//!
//! | value | literal |
//! |-------|---------|
//! | `None` | `None` |
//! | `Bool` | `True` / `False` |
//! | `Int` | `42` |
//! | `Float` | `1.5`, `2.0`, `1e-07`, `nan` |
//! | `Str` | `'text'` (device representations render as `'name'`) |
//! | `Seq` | `[1, 2, 3]` |
//! | `Map` | `{key: value, ...}` |
//! | `Opaque` | `<tag>` |
//!
//! The result of [`render`] never contains `\n` or `\r`.

use ndarray::{ArrayBase, ArrayViewD, Data, Dimension};
use regex::Regex;
use std::fmt;
use std::sync::LazyLock;

/// Matches `Class(..., name='m1', ...)` device representations.
static DEVICE_REPR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^[A-Za-z_][\w.]*\((?:.*[,\s])?name=(?:'(?P<sq>[^']*)'|"(?P<dq>[^"]*)")"#)
        .expect("Invalid device repr regex")
});

/// A plan argument value, normalized for rendering.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    /// Rendered as `None`.
    None,
    /// Rendered as `True`/`False`.
    Bool(bool),
    /// Integer of any width.
    Int(i128),
    /// Shortest round-trip form.
    Float(f64),
    /// Single-quoted and escaped.
    Str(String),
    /// List, including numeric arrays.
    Seq(Vec<ArgValue>),
    /// Entries in natural key order.
    Map(Vec<(String, ArgValue)>),
    /// A value the renderer cannot represent; rendered as a `<tag>` placeholder.
    Opaque(String),
}

impl ArgValue {
    /// Placeholder for a value of an unrepresentable kind.
    pub fn opaque(type_tag: impl Into<String>) -> Self {
        ArgValue::Opaque(type_tag.into())
    }

    /// Normalize any numeric array into nested sequences.
    ///
    /// A zero-dimensional array becomes its single element.
    pub fn from_array<A, S, D>(array: &ArrayBase<S, D>) -> Self
    where
        A: Clone + Into<ArgValue>,
        S: Data<Elem = A>,
        D: Dimension,
    {
        flatten_view(array.view().into_dyn())
    }

    /// Convert a JSON value from a document into an argument value.
    pub fn from_json(value: &serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::Null => ArgValue::None,
            Value::Bool(b) => ArgValue::Bool(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    ArgValue::Int(i128::from(i))
                } else if let Some(u) = n.as_u64() {
                    ArgValue::Int(i128::from(u))
                } else if let Some(f) = n.as_f64() {
                    ArgValue::Float(f)
                } else {
                    ArgValue::opaque("number")
                }
            }
            Value::String(s) => ArgValue::Str(s.clone()),
            Value::Array(items) => ArgValue::Seq(items.iter().map(ArgValue::from_json).collect()),
            Value::Object(map) => ArgValue::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), ArgValue::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Render as a single-line literal.
    pub fn render(&self) -> String {
        let mut out = String::new();
        self.render_into(&mut out);
        out
    }

    fn render_into(&self, out: &mut String) {
        match self {
            ArgValue::None => out.push_str("None"),
            ArgValue::Bool(true) => out.push_str("True"),
            ArgValue::Bool(false) => out.push_str("False"),
            ArgValue::Int(i) => out.push_str(&i.to_string()),
            ArgValue::Float(f) => out.push_str(&format_float(*f)),
            ArgValue::Str(s) => match device_name(s) {
                Some(name) => push_quoted(out, name),
                None => push_quoted(out, s),
            },
            ArgValue::Seq(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    item.render_into(out);
                }
                out.push(']');
            }
            ArgValue::Map(entries) => {
                out.push('{');
                for (i, (key, value)) in entries.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    push_escaped(out, key);
                    out.push_str(": ");
                    value.render_into(out);
                }
                out.push('}');
            }
            ArgValue::Opaque(tag) => {
                out.push('<');
                push_escaped(out, tag);
                out.push('>');
            }
        }
    }
}

/// Render any argument value as a flat literal.
pub fn render(value: &ArgValue) -> String {
    value.render()
}

impl fmt::Display for ArgValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

fn flatten_view<A>(view: ArrayViewD<'_, A>) -> ArgValue
where
    A: Clone + Into<ArgValue>,
{
    if view.ndim() == 0 {
        return match view.iter().next() {
            Some(elem) => elem.clone().into(),
            None => ArgValue::opaque("empty array"),
        };
    }
    ArgValue::Seq(view.outer_iter().map(flatten_view).collect())
}

/// Format a float as its shortest round-trip literal.
///
/// Integral values keep a trailing `.0`. Magnitudes at or above `1e16`, or
/// non-zero below `1e-4`, use exponent form with a signed two-digit exponent
/// (`1e-07`, `1.5e+16`).
pub fn format_float(value: f64) -> String {
    if value.is_nan() {
        return "nan".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    let magnitude = value.abs();
    if magnitude != 0.0 && !(1e-4..1e16).contains(&magnitude) {
        let exp_form = format!("{value:e}");
        if let Some((mantissa, exponent)) = exp_form.split_once('e') {
            let exponent: i32 = exponent.parse().unwrap_or(0);
            let sign = if exponent < 0 { '-' } else { '+' };
            return format!("{mantissa}e{sign}{:02}", exponent.abs());
        }
        return exp_form;
    }
    let plain = format!("{value}");
    if plain.contains('.') {
        plain
    } else {
        format!("{plain}.0")
    }
}

/// Device name carried by a `Class(..., name='x', ...)` representation.
pub fn device_name(text: &str) -> Option<&str> {
    let caps = DEVICE_REPR_REGEX.captures(text.trim())?;
    caps.name("sq").or_else(|| caps.name("dq")).map(|m| m.as_str())
}

/// Escape line terminators and backslashes so `text` fits on one line.
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    push_escaped(&mut out, text);
    out
}

fn push_quoted(out: &mut String, text: &str) {
    out.push('\'');
    for ch in text.chars() {
        match ch {
            '\'' => out.push_str("\\'"),
            _ => push_escaped_char(out, ch),
        }
    }
    out.push('\'');
}

fn push_escaped(out: &mut String, text: &str) {
    for ch in text.chars() {
        push_escaped_char(out, ch);
    }
}

fn push_escaped_char(out: &mut String, ch: char) {
    match ch {
        '\\' => out.push_str("\\\\"),
        '\n' => out.push_str("\\n"),
        '\r' => out.push_str("\\r"),
        '\t' => out.push_str("\\t"),
        // every other character `str.splitlines` treats as a line boundary
        '\u{0b}' | '\u{0c}' | '\u{1c}' | '\u{1d}' | '\u{1e}' | '\u{85}' | '\u{2028}'
        | '\u{2029}' => {
            out.push_str(&format!("\\u{{{:04x}}}", ch as u32));
        }
        _ => out.push(ch),
    }
}

macro_rules! from_int {
    ($($t:ty),*) => {
        $(impl From<$t> for ArgValue {
            fn from(value: $t) -> Self {
                ArgValue::Int(i128::from(value))
            }
        })*
    };
}

from_int!(i8, i16, i32, i64, u8, u16, u32, u64);

impl From<usize> for ArgValue {
    fn from(value: usize) -> Self {
        ArgValue::Int(value as i128)
    }
}

impl From<f64> for ArgValue {
    fn from(value: f64) -> Self {
        ArgValue::Float(value)
    }
}

impl From<f32> for ArgValue {
    fn from(value: f32) -> Self {
        ArgValue::Float(f64::from(value))
    }
}

impl From<bool> for ArgValue {
    fn from(value: bool) -> Self {
        ArgValue::Bool(value)
    }
}

impl From<&str> for ArgValue {
    fn from(value: &str) -> Self {
        ArgValue::Str(value.to_string())
    }
}

impl From<String> for ArgValue {
    fn from(value: String) -> Self {
        ArgValue::Str(value)
    }
}

impl<T: Into<ArgValue>> From<Vec<T>> for ArgValue {
    fn from(items: Vec<T>) -> Self {
        ArgValue::Seq(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<ArgValue>> From<Option<T>> for ArgValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(ArgValue::None, Into::into)
    }
}

impl From<&serde_json::Value> for ArgValue {
    fn from(value: &serde_json::Value) -> Self {
        ArgValue::from_json(value)
    }
}

impl<A, S, D> From<&ArrayBase<S, D>> for ArgValue
where
    A: Clone + Into<ArgValue>,
    S: Data<Elem = A>,
    D: Dimension,
{
    fn from(array: &ArrayBase<S, D>) -> Self {
        ArgValue::from_array(array)
    }
}
