//! Builtin functions callable via `CALL(name, argc)` (`spec.md` §4.2 "Function
//! call"), supplementing the distilled spec per `SPEC_FULL.md` §1.
//!
//! Grounded on `original_source/src/tengfunctionescaping.h` (`escape`,
//! `unescape`, `urlescape`, `urlunescape`, `quoteescape`) and
//! `tengfunctionother.h` (`isenabled`, `dictexist`, `getdict`; that header's
//! `exists` is dead debugging code in the original, never wired into its
//! dispatch table, and is intentionally not ported — see `DESIGN.md`).
//! Every builtin takes the already-evaluated argument list and a
//! [`BuiltinCtx`] borrowing the pieces of render state it needs; on misuse
//! (wrong arity, wrong type) it logs through the ctx's error log at `pos` and
//! returns `Value::Undefined`, matching the VM's general "runtime errors
//! substitute undefined and continue" policy (`spec.md` §4.3).

use std::rc::Rc;

use crate::config::Configuration;
use crate::content_type::ContentTypeRegistry;
use crate::dictionary::Dictionary;
use crate::error::{ErrorLog, Pos};
use crate::value::Value;

pub struct BuiltinCtx<'a> {
    pub dict: &'a Dictionary,
    pub config: &'a Configuration,
    pub content_types: &'a ContentTypeRegistry,
    pub active_mime: &'a str,
    pub errors: &'a mut ErrorLog,
    pub pos: Pos,
}

impl<'a> BuiltinCtx<'a> {
    fn wrong_args(&mut self, name: &str, expected: usize) -> Value {
        self.errors.warning(
            self.pos,
            format!("function '{name}' expects {expected} argument(s)"),
        );
        Value::Undefined
    }

    fn bad_type(&mut self, name: &str, detail: &str) -> Value {
        self.errors.warning(self.pos, format!("function '{name}': {detail}"));
        Value::Undefined
    }
}

fn as_str(v: &Value) -> Option<Rc<str>> {
    match v {
        Value::Str(s) => Some(s.clone()),
        _ => None,
    }
}

/// Dispatch a builtin call by name. Returns `None` if `name` isn't a known
/// builtin (caller then tries the UDF registry).
pub fn call(name: &str, args: &[Value], ctx: &mut BuiltinCtx) -> Option<Value> {
    Some(match name {
        "len" => len(args, ctx),
        "substr" => substr(args, ctx),
        "round" => round(args, ctx),
        "numformat" => numformat(args, ctx),
        "type" => type_of(args, ctx),
        "isempty" => isempty(args, ctx),
        "escape" => escape(args, ctx),
        "unescape" => unescape(args, ctx),
        "urlescape" => urlescape(args, ctx),
        "urlunescape" => urlunescape(args, ctx),
        "quoteescape" => quoteescape(args, ctx),
        "jsonify" => jsonify(args, ctx),
        "isenabled" => isenabled(args, ctx),
        "dictexist" => dictexist(args, ctx),
        "getdict" => getdict(args, ctx),
        "defined" => defined(args, ctx),
        "dict" => dict_lookup(args, ctx),
        _ => return None,
    })
}

fn len(args: &[Value], ctx: &mut BuiltinCtx) -> Value {
    if args.len() != 1 {
        return ctx.wrong_args("len", 1);
    }
    match &args[0] {
        Value::Str(s) => Value::Int(s.chars().count() as i64),
        Value::FragListRef(list) => Value::Int(list.len() as i64),
        _ => ctx.bad_type("len", "argument must be a string or fragment list"),
    }
}

fn substr(args: &[Value], ctx: &mut BuiltinCtx) -> Value {
    if args.len() != 3 {
        return ctx.wrong_args("substr", 3);
    }
    let Some(s) = as_str(&args[0]) else {
        return ctx.bad_type("substr", "first argument must be a string");
    };
    let (Ok(start), Ok(len)) = (args[1].to_number(), args[2].to_number()) else {
        return ctx.bad_type("substr", "start/length must be numbers");
    };
    let chars: Vec<char> = s.chars().collect();
    let start = start.as_f64().max(0.0) as usize;
    let len = len.as_f64().max(0.0) as usize;
    let end = (start + len).min(chars.len());
    if start >= chars.len() {
        return Value::Str(Rc::from(""));
    }
    Value::Str(Rc::from(chars[start..end].iter().collect::<String>().as_str()))
}

fn round(args: &[Value], ctx: &mut BuiltinCtx) -> Value {
    if args.len() != 1 {
        return ctx.wrong_args("round", 1);
    }
    match args[0].to_number() {
        Ok(n) => Value::Int(n.as_f64().round() as i64),
        Err(_) => ctx.bad_type("round", "argument must be a number"),
    }
}

/// `numformat(value, decimals)`: fixed-decimal formatting, the one
/// locale-free numeric format `spec.md` §1 allows as in-scope.
fn numformat(args: &[Value], ctx: &mut BuiltinCtx) -> Value {
    if args.len() != 2 {
        return ctx.wrong_args("numformat", 2);
    }
    let (Ok(value), Ok(decimals)) = (args[0].to_number(), args[1].to_number()) else {
        return ctx.bad_type("numformat", "arguments must be numbers");
    };
    let decimals = decimals.as_f64().max(0.0) as usize;
    Value::Str(Rc::from(format!("{:.*}", decimals, value.as_f64()).as_str()))
}

fn type_of(args: &[Value], ctx: &mut BuiltinCtx) -> Value {
    if args.len() != 1 {
        return ctx.wrong_args("type", 1);
    }
    Value::Str(Rc::from(args[0].type_name()))
}

fn isempty(args: &[Value], ctx: &mut BuiltinCtx) -> Value {
    if args.len() != 1 {
        return ctx.wrong_args("isempty", 1);
    }
    let empty = match &args[0] {
        Value::Undefined => true,
        Value::Str(s) => s.is_empty(),
        Value::FragListRef(list) => list.is_empty(),
        _ => false,
    };
    Value::Int(empty as i64)
}

fn escape(args: &[Value], ctx: &mut BuiltinCtx) -> Value {
    if args.len() != 1 {
        return ctx.wrong_args("escape", 1);
    }
    let Some(s) = as_str(&args[0]) else {
        return ctx.bad_type("escape", "argument must be a string");
    };
    let ct = ctx.content_types.get(ctx.active_mime).unwrap_or_else(|| ctx.content_types.default_type());
    Value::Str(Rc::from(ct.escape(&s).as_str()))
}

fn unescape(args: &[Value], ctx: &mut BuiltinCtx) -> Value {
    if args.len() != 1 {
        return ctx.wrong_args("unescape", 1);
    }
    let Some(s) = as_str(&args[0]) else {
        return ctx.bad_type("unescape", "argument must be a string");
    };
    let ct = ctx.content_types.get(ctx.active_mime).unwrap_or_else(|| ctx.content_types.default_type());
    Value::Str(Rc::from(ct.unescape(&s).as_str()))
}

fn url_escape_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~')
}

fn urlescape(args: &[Value], ctx: &mut BuiltinCtx) -> Value {
    if args.len() != 1 {
        return ctx.wrong_args("urlescape", 1);
    }
    let Some(s) = as_str(&args[0]) else {
        return ctx.bad_type("urlescape", "argument must be a string");
    };
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        if url_escape_byte(b) {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    Value::Str(Rc::from(out.as_str()))
}

fn urlunescape(args: &[Value], ctx: &mut BuiltinCtx) -> Value {
    if args.len() != 1 {
        return ctx.wrong_args("urlunescape", 1);
    }
    let Some(s) = as_str(&args[0]) else {
        return ctx.bad_type("urlunescape", "argument must be a string");
    };
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(v) = u8::from_str_radix(std::str::from_utf8(&bytes[i + 1..i + 3]).unwrap_or(""), 16) {
                out.push(v);
                i += 3;
                continue;
            }
        }
        if bytes[i] == b'+' {
            out.push(b' ');
        } else {
            out.push(bytes[i]);
        }
        i += 1;
    }
    match String::from_utf8(out) {
        Ok(s) => Value::Str(Rc::from(s.as_str())),
        Err(_) => ctx.bad_type("urlunescape", "result is not valid UTF-8"),
    }
}

fn quoteescape(args: &[Value], ctx: &mut BuiltinCtx) -> Value {
    if args.len() != 1 {
        return ctx.wrong_args("quoteescape", 1);
    }
    let Some(s) = as_str(&args[0]) else {
        return ctx.bad_type("quoteescape", "argument must be a string");
    };
    let ct = ctx.content_types.get("quoted-string").expect("quoted-string is always registered");
    Value::Str(Rc::from(ct.escape(&s).as_str()))
}

fn jsonify(args: &[Value], ctx: &mut BuiltinCtx) -> Value {
    if args.len() != 1 {
        return ctx.wrong_args("jsonify", 1);
    }
    Value::Str(Rc::from(args[0].to_json().as_str()))
}

fn isenabled(args: &[Value], ctx: &mut BuiltinCtx) -> Value {
    if args.len() != 1 {
        return ctx.wrong_args("isenabled", 1);
    }
    let Some(feature) = as_str(&args[0]) else {
        return ctx.bad_type("isenabled", "argument must be a string");
    };
    match ctx.config.is_enabled(&feature) {
        Some(v) => Value::Int(v as i64),
        None => ctx.bad_type("isenabled", &format!("unknown feature '{feature}'")),
    }
}

fn dictexist(args: &[Value], ctx: &mut BuiltinCtx) -> Value {
    if args.len() != 1 {
        return ctx.wrong_args("dictexist", 1);
    }
    let Some(key) = as_str(&args[0]) else {
        return ctx.bad_type("dictexist", "argument must be a string");
    };
    let found = ctx.dict.contains(&key) || ctx.config.lookup(&key).is_some();
    Value::Int(found as i64)
}

fn getdict(args: &[Value], ctx: &mut BuiltinCtx) -> Value {
    if args.len() != 2 {
        return ctx.wrong_args("getdict", 2);
    }
    let (Some(key), Some(def)) = (as_str(&args[0]), as_str(&args[1])) else {
        return ctx.bad_type("getdict", "arguments must be strings");
    };
    if let Some(v) = ctx.dict.lookup(&key) {
        return Value::Str(Rc::from(v));
    }
    if let Some(v) = ctx.config.lookup(&key) {
        return Value::Str(Rc::from(v));
    }
    Value::Str(def)
}

fn dict_lookup(args: &[Value], ctx: &mut BuiltinCtx) -> Value {
    if args.len() != 1 {
        return ctx.wrong_args("dict", 1);
    }
    let Some(key) = as_str(&args[0]) else {
        return ctx.bad_type("dict", "argument must be a string");
    };
    match ctx.dict.lookup(&key) {
        Some(v) => Value::Str(Rc::from(v)),
        None => ctx.bad_type("dict", &format!("undefined dictionary key '{key}'")),
    }
}

fn defined(args: &[Value], ctx: &mut BuiltinCtx) -> Value {
    if args.len() != 1 {
        return ctx.wrong_args("defined", 1);
    }
    Value::Int(!matches!(args[0], Value::Undefined) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>(
        dict: &'a Dictionary,
        config: &'a Configuration,
        cts: &'a ContentTypeRegistry,
        errors: &'a mut ErrorLog,
    ) -> BuiltinCtx<'a> {
        BuiltinCtx {
            dict,
            config,
            content_types: cts,
            active_mime: "text/html",
            errors,
            pos: Pos::default(),
        }
    }

    #[test]
    fn len_on_string_counts_chars() {
        let dict = Dictionary::new();
        let config = Configuration::default();
        let cts = ContentTypeRegistry::builtin();
        let mut errors = ErrorLog::new();
        let mut c = ctx(&dict, &config, &cts, &mut errors);
        let v = len(&[Value::Str(Rc::from("hello"))], &mut c);
        assert!(matches!(v, Value::Int(5)));
    }

    #[test]
    fn substr_extracts_range() {
        let dict = Dictionary::new();
        let config = Configuration::default();
        let cts = ContentTypeRegistry::builtin();
        let mut errors = ErrorLog::new();
        let mut c = ctx(&dict, &config, &cts, &mut errors);
        let v = substr(&[Value::Str(Rc::from("hello world")), Value::Int(6), Value::Int(5)], &mut c);
        assert_eq!(v.to_display_string(), "world");
    }

    #[test]
    fn isempty_detects_undefined_and_empty_string() {
        let dict = Dictionary::new();
        let config = Configuration::default();
        let cts = ContentTypeRegistry::builtin();
        let mut errors = ErrorLog::new();
        let mut c = ctx(&dict, &config, &cts, &mut errors);
        assert!(matches!(isempty(&[Value::Undefined], &mut c), Value::Int(1)));
        assert!(matches!(isempty(&[Value::Str(Rc::from(""))], &mut c), Value::Int(1)));
        assert!(matches!(isempty(&[Value::Str(Rc::from("x"))], &mut c), Value::Int(0)));
    }

    #[test]
    fn urlescape_roundtrips() {
        let dict = Dictionary::new();
        let config = Configuration::default();
        let cts = ContentTypeRegistry::builtin();
        let mut errors = ErrorLog::new();
        let mut c = ctx(&dict, &config, &cts, &mut errors);
        let escaped = urlescape(&[Value::Str(Rc::from("a b/c"))], &mut c);
        assert_eq!(escaped.to_display_string(), "a%20b%2Fc");
        let back = urlunescape(&[escaped], &mut c);
        assert_eq!(back.to_display_string(), "a b/c");
    }
}
