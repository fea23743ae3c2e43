//! The runtime [`Value`] tagged union (`spec.md` §3) and its arithmetic,
//! coercion, comparison, and printing rules.
//!
//! `Value`'s variant set is closed by design (`spec.md` §9 "Dynamic dispatch
//! on Value"): operators are plain `match`es over this fixed set, never an
//! open trait object. `string` and `string_ref` from the spec collapse into
//! a single `Str(Rc<str>)` variant here — both are "cheap, shared,
//! non-owning-copy" strings, and `Rc` gives exactly that without the
//! borrow-checker fights a true zero-copy slice would require across the
//! fragment tree / literal pool boundary. See `DESIGN.md`.

use std::fmt;
use std::rc::Rc;

use crate::fragment::{Fragment, FragmentList};

/// A compiled regex value plus enough of its source to print/compare/JSON it.
///
/// `regex::Regex` is neither `PartialEq` nor `Hash`, so equality and hashing
/// fall back to the pattern/flags pair, matching how the original engine
/// treats two regexes with identical source as interchangeable.
#[derive(Debug, Clone)]
pub struct RegexValue {
    pub pattern: String,
    pub flags: String,
    pub compiled: Rc<regex::Regex>,
}

impl PartialEq for RegexValue {
    fn eq(&self, other: &Self) -> bool {
        self.pattern == other.pattern && self.flags == other.flags
    }
}

/// The tagged value every expression evaluates to.
#[derive(Debug, Clone)]
pub enum Value {
    Undefined,
    Int(i64),
    Real(f64),
    Str(Rc<str>),
    FragRef(Rc<Fragment>),
    FragListRef(Rc<FragmentList>),
    Regex(Rc<RegexValue>),
}

impl Default for Value {
    fn default() -> Self {
        Value::Undefined
    }
}

/// Why a numeric coercion or arithmetic operation failed to produce a value.
///
/// Carries enough detail for the call site (the [`crate::processor::Processor`])
/// to log the right diagnostic; it is never surfaced to template authors
/// directly — a failed operation always substitutes [`Value::Undefined`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueError {
    NotANumber,
    DivisionByZero,
    ModuloByZero,
}

impl fmt::Display for ValueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueError::NotANumber => write!(f, "operand is not a number"),
            ValueError::DivisionByZero => write!(f, "division by zero"),
            ValueError::ModuloByZero => write!(f, "modulo by zero"),
        }
    }
}

/// A number coerced from a [`Value`], tracking whether it started as a real
/// so arithmetic can decide whether to promote its result.
#[derive(Debug, Clone, Copy)]
pub enum Number {
    Int(i64),
    Real(f64),
}

impl Number {
    pub fn as_f64(self) -> f64 {
        match self {
            Number::Int(i) => i as f64,
            Number::Real(r) => r,
        }
    }

    fn to_value(self) -> Value {
        match self {
            Number::Int(i) => Value::Int(i),
            Number::Real(r) => Value::Real(r),
        }
    }
}

/// Parse a string as an integer or real, succeeding only if the *entire*
/// trimmed-of-nothing string is consumed (`spec.md` §3: "only succeed when
/// the string parses fully").
fn parse_number_str(s: &str) -> Option<Number> {
    if let Ok(i) = s.parse::<i64>() {
        return Some(Number::Int(i));
    }
    if let Ok(r) = s.parse::<f64>() {
        if r.is_finite() {
            return Some(Number::Real(r));
        }
    }
    None
}

impl Value {
    /// Coerce to a number per `spec.md` §3: numeric variants pass through;
    /// strings coerce only when they parse fully; everything else fails.
    pub fn to_number(&self) -> Result<Number, ValueError> {
        match self {
            Value::Int(i) => Ok(Number::Int(*i)),
            Value::Real(r) => Ok(Number::Real(*r)),
            Value::Str(s) => parse_number_str(s).ok_or(ValueError::NotANumber),
            _ => Err(ValueError::NotANumber),
        }
    }

    /// Derived boolean: `0`, `0.0`, empty string, undefined are falsey;
    /// everything else (including frag refs, regexes, non-empty strings that
    /// fail to parse as numbers) is truthy.
    pub fn to_bool(&self) -> bool {
        match self {
            Value::Undefined => false,
            Value::Int(i) => *i != 0,
            Value::Real(r) => *r != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::FragRef(_) | Value::FragListRef(_) | Value::Regex(_) => true,
        }
    }

    /// Render as a printable string. Used by `PRINT`, string coercion inside
    /// concat, and debug dumps.
    pub fn to_display_string(&self) -> String {
        match self {
            Value::Undefined => "undefined".to_string(),
            Value::Int(i) => i.to_string(),
            Value::Real(r) => format_real(*r),
            Value::Str(s) => s.to_string(),
            Value::FragRef(_) => "<fragment>".to_string(),
            Value::FragListRef(list) => format!("<fragment-list:{}>", list.len()),
            Value::Regex(r) => format!("/{}/{}", r.pattern, r.flags),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Int(_) => "integer",
            Value::Real(_) => "real",
            Value::Str(_) => "string",
            Value::FragRef(_) => "fragment",
            Value::FragListRef(_) => "fragment_list",
            Value::Regex(_) => "regex",
        }
    }

    /// Serialize to JSON text per RFC 8259 (`jsonify` builtin / `json`
    /// content type). Fragment refs/lists recurse; regexes render as their
    /// pattern string since JSON has no regex literal.
    pub fn to_json(&self) -> String {
        let mut out = String::new();
        write_json(self, &mut out);
        out
    }
}

fn format_real(r: f64) -> String {
    if r.is_nan() {
        return "nan".to_string();
    }
    if r.is_infinite() {
        return if r > 0.0 { "inf".into() } else { "-inf".into() };
    }
    if r == r.trunc() && r.abs() < 1e15 {
        format!("{r:.1}")
    } else {
        format!("{r}")
    }
}

fn write_json_string(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out.push('"');
}

fn write_json(value: &Value, out: &mut String) {
    match value {
        Value::Undefined => out.push_str("null"),
        Value::Int(i) => out.push_str(&i.to_string()),
        Value::Real(r) => {
            if r.is_finite() {
                out.push_str(&r.to_string());
            } else {
                out.push_str("null");
            }
        }
        Value::Str(s) => write_json_string(s, out),
        Value::Regex(r) => write_json_string(&format!("/{}/{}", r.pattern, r.flags), out),
        Value::FragRef(frag) => {
            out.push('{');
            for (i, (key, val)) in frag.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_json_string(key, out);
                out.push(':');
                write_json(val, out);
            }
            out.push('}');
        }
        Value::FragListRef(list) => {
            out.push('[');
            for (i, frag) in list.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_json(&Value::FragRef(frag.clone()), out);
            }
            out.push(']');
        }
    }
}

/// Promote a pair of coerced numbers to a common representation: real if
/// either side is real, otherwise integer (`spec.md` §4.3: "integer/real
/// mixing promotes to real").
fn promote(a: Number, b: Number) -> (Number, Number, bool) {
    match (a, b) {
        (Number::Int(_), Number::Int(_)) => (a, b, false),
        _ => (Number::Real(a.as_f64()), Number::Real(b.as_f64()), true),
    }
}

macro_rules! arith_op {
    ($name:ident, $int_op:expr, $real_op:expr) => {
        pub fn $name(a: &Value, b: &Value) -> Result<Value, ValueError> {
            let na = a.to_number()?;
            let nb = b.to_number()?;
            let (na, nb, real) = promote(na, nb);
            if real {
                let (x, y) = (na.as_f64(), nb.as_f64());
                Ok(Value::Real($real_op(x, y)))
            } else {
                let (x, y) = match (na, nb) {
                    (Number::Int(x), Number::Int(y)) => (x, y),
                    _ => unreachable!(),
                };
                Ok(Value::Int($int_op(x, y)))
            }
        }
    };
}

arith_op!(add, i64::wrapping_add, |x: f64, y: f64| x + y);
arith_op!(sub, i64::wrapping_sub, |x: f64, y: f64| x - y);
arith_op!(mul, i64::wrapping_mul, |x: f64, y: f64| x * y);

/// Division: zero divisor is an error regardless of representation
/// (`spec.md` §4.3: "division or modulo by zero is ERROR, result undefined").
pub fn div(a: &Value, b: &Value) -> Result<Value, ValueError> {
    let na = a.to_number()?;
    let nb = b.to_number()?;
    let (na, nb, real) = promote(na, nb);
    if real {
        let (x, y) = (na.as_f64(), nb.as_f64());
        if y == 0.0 {
            return Err(ValueError::DivisionByZero);
        }
        Ok(Value::Real(x / y))
    } else {
        let (x, y) = match (na, nb) {
            (Number::Int(x), Number::Int(y)) => (x, y),
            _ => unreachable!(),
        };
        if y == 0 {
            return Err(ValueError::DivisionByZero);
        }
        Ok(Value::Int(x.wrapping_div(y)))
    }
}

pub fn modulo(a: &Value, b: &Value) -> Result<Value, ValueError> {
    let na = a.to_number()?;
    let nb = b.to_number()?;
    let (na, nb, real) = promote(na, nb);
    if real {
        let (x, y) = (na.as_f64(), nb.as_f64());
        if y == 0.0 {
            return Err(ValueError::ModuloByZero);
        }
        Ok(Value::Real(x % y))
    } else {
        let (x, y) = match (na, nb) {
            (Number::Int(x), Number::Int(y)) => (x, y),
            _ => unreachable!(),
        };
        if y == 0 {
            return Err(ValueError::ModuloByZero);
        }
        Ok(Value::Int(x.wrapping_rem(y)))
    }
}

pub fn neg(a: &Value) -> Result<Value, ValueError> {
    match a.to_number()? {
        Number::Int(i) => Ok(Value::Int(i.wrapping_neg())),
        Number::Real(r) => Ok(Value::Real(-r)),
    }
}

pub fn pos(a: &Value) -> Result<Value, ValueError> {
    Ok(a.to_number()?.to_value())
}

pub fn bit_not(a: &Value) -> Result<Value, ValueError> {
    match a.to_number()? {
        Number::Int(i) => Ok(Value::Int(!i)),
        Number::Real(r) => Ok(Value::Int(!(r as i64))),
    }
}

macro_rules! bitwise_op {
    ($name:ident, $op:tt) => {
        pub fn $name(a: &Value, b: &Value) -> Result<Value, ValueError> {
            let x = to_int(a)?;
            let y = to_int(b)?;
            Ok(Value::Int(x $op y))
        }
    };
}

fn to_int(v: &Value) -> Result<i64, ValueError> {
    match v.to_number()? {
        Number::Int(i) => Ok(i),
        Number::Real(r) => Ok(r as i64),
    }
}

bitwise_op!(bit_and, &);
bitwise_op!(bit_or, |);
bitwise_op!(bit_xor, ^);

/// String concatenation (`++`): both sides are coerced to their display
/// string, never numeric.
pub fn concat(a: &Value, b: &Value) -> Value {
    let mut s = a.to_display_string();
    s.push_str(&b.to_display_string());
    Value::Str(Rc::from(s.as_str()))
}

/// String repetition (`**`): left operand's display string repeated `n`
/// times, `n` coerced from the right operand (negative/non-numeric treated
/// as zero repetitions after logging).
pub fn repeat(a: &Value, b: &Value) -> Result<Value, ValueError> {
    let n = to_int(b)?;
    let s = a.to_display_string();
    let n = n.max(0) as usize;
    Ok(Value::Str(Rc::from(s.repeat(n).as_str())))
}

pub fn not(a: &Value) -> Value {
    Value::Int(!a.to_bool() as i64)
}

/// Short-circuit `&&`: returns the value that determined the result, not a
/// normalized boolean (`spec.md` §4.3).
pub fn logical_and<'a>(a: &'a Value, b: &'a Value) -> &'a Value {
    if a.to_bool() { b } else { a }
}

pub fn logical_or<'a>(a: &'a Value, b: &'a Value) -> &'a Value {
    if a.to_bool() { a } else { b }
}

/// Cross-type equality per `spec.md` §4.3: numeric coercion is attempted for
/// string/number mixes, falling back to string equality if either side
/// can't coerce. Fragment refs/lists/regexes compare by identity or pattern.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    use Value::*;
    match (a, b) {
        (Undefined, Undefined) => true,
        (Undefined, _) | (_, Undefined) => false,
        (Int(_) | Real(_), Int(_) | Real(_)) => numeric_eq(a, b),
        (Str(_), Str(_)) => a.to_display_string() == b.to_display_string(),
        (Str(_), Int(_) | Real(_)) | (Int(_) | Real(_), Str(_)) => {
            match (a.to_number(), b.to_number()) {
                (Ok(_), Ok(_)) => numeric_eq(a, b),
                _ => a.to_display_string() == b.to_display_string(),
            }
        }
        (FragRef(x), FragRef(y)) => Rc::ptr_eq(x, y),
        (FragListRef(x), FragListRef(y)) => Rc::ptr_eq(x, y),
        (Regex(x), Regex(y)) => x == y,
        _ => false,
    }
}

fn numeric_eq(a: &Value, b: &Value) -> bool {
    match (a.to_number(), b.to_number()) {
        (Ok(na), Ok(nb)) => {
            let (na, nb, _) = promote(na, nb);
            na.as_f64() == nb.as_f64()
        }
        _ => false,
    }
}

/// Ordering comparison (`<`, `<=`, `>`, `>=`): numeric only, per `spec.md`
/// §4.3. Returns `None` (undefined + caller-logged WARNING) when either
/// side fails to coerce to a number.
pub fn compare(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    let na = a.to_number().ok()?;
    let nb = b.to_number().ok()?;
    let (na, nb, _) = promote(na, nb);
    na.as_f64().partial_cmp(&nb.as_f64())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_overflow_wraps() {
        let r = add(&Value::Int(i64::MAX), &Value::Int(1)).unwrap();
        match r {
            Value::Int(i) => assert_eq!(i, i64::MIN),
            _ => panic!("expected int"),
        }
    }

    #[test]
    fn mixed_int_real_promotes() {
        let r = add(&Value::Int(1), &Value::Real(2.5)).unwrap();
        match r {
            Value::Real(f) => assert_eq!(f, 3.5),
            _ => panic!("expected real"),
        }
    }

    #[test]
    fn division_by_zero_is_error() {
        assert_eq!(div(&Value::Int(1), &Value::Int(0)), Err(ValueError::DivisionByZero));
    }

    #[test]
    fn string_must_parse_fully_to_coerce() {
        assert!(Value::Str(Rc::from("12x")).to_number().is_err());
        assert!(Value::Str(Rc::from("12")).to_number().is_ok());
    }

    #[test]
    fn falsey_values() {
        assert!(!Value::Int(0).to_bool());
        assert!(!Value::Real(0.0).to_bool());
        assert!(!Value::Str(Rc::from("")).to_bool());
        assert!(!Value::Undefined.to_bool());
        assert!(Value::Str(Rc::from("0x")).to_bool());
    }

    #[test]
    fn logical_and_or_return_determining_operand() {
        let zero = Value::Int(0);
        let one = Value::Int(1);
        assert!(matches!(logical_and(&zero, &one), Value::Int(0)));
        assert!(matches!(logical_or(&zero, &one), Value::Int(1)));
    }

    #[test]
    fn equality_cross_type_falls_back_to_string() {
        assert!(values_equal(&Value::Str(Rc::from("3")), &Value::Int(3)));
        assert!(values_equal(&Value::Str(Rc::from("abc")), &Value::Str(Rc::from("abc"))));
        assert!(!values_equal(&Value::Str(Rc::from("abc")), &Value::Int(3)));
    }
}
