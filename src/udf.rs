//! Process-wide user-defined-function registry (`spec.md` §5 "Global state",
//! §6 "UDF registry (collaborator)").
//!
//! A UDF is looked up by its `udf.<name>` call name and invoked with the
//! already-evaluated argument list. Registration is a host/collaborator
//! concern (`spec.md` §1 Out of scope); this module only provides the
//! registry contract, process-wide like the teacher's own `once_cell`-backed
//! global caches (`pipeline/mod.rs` `REGEX_CACHE`).

use std::rc::Rc;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::value::Value;

/// A registered callable: `[Value] -> Value`. Boxed and `Send + Sync` since
/// the registry is process-wide and may be populated from any thread before
/// renders begin; `Value` itself (built on `Rc`) is not `Send`, so UDFs
/// receive and return plain owned data the caller reconstitutes into `Value`
/// on its own (single-threaded) render thread.
pub type Udf = dyn Fn(&[UdfArg]) -> UdfResult + Send + Sync;

/// A UDF-facing argument: `Value` minus the `Rc`-bound fragment/regex
/// variants, which don't make sense to hand across a registry that must be
/// `Send`. UDFs that need fragment data should be written as builtins
/// instead (`crate::builtins`).
#[derive(Debug, Clone, PartialEq)]
pub enum UdfArg {
    Undefined,
    Int(i64),
    Real(f64),
    Str(String),
}

impl UdfArg {
    pub fn from_value(v: &Value) -> Option<UdfArg> {
        match v {
            Value::Undefined => Some(UdfArg::Undefined),
            Value::Int(i) => Some(UdfArg::Int(*i)),
            Value::Real(r) => Some(UdfArg::Real(*r)),
            Value::Str(s) => Some(UdfArg::Str(s.to_string())),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum UdfResult {
    Undefined,
    Int(i64),
    Real(f64),
    Str(String),
    /// The UDF needs render-time context (escaper, position, dict) it
    /// wasn't given — compiler must defer this call to runtime rather than
    /// constant-fold it (`spec.md` §9 design note, §6 "throwing a 'runtime
    /// context needed' marker").
    NeedsContext,
}

impl UdfResult {
    pub fn to_value(&self) -> Value {
        match self {
            UdfResult::Undefined | UdfResult::NeedsContext => Value::Undefined,
            UdfResult::Int(i) => Value::Int(*i),
            UdfResult::Real(r) => Value::Real(*r),
            UdfResult::Str(s) => Value::Str(Rc::from(s.as_str())),
        }
    }
}

static REGISTRY: Lazy<RwLock<std::collections::HashMap<String, Arc<Udf>>>> =
    Lazy::new(|| RwLock::new(std::collections::HashMap::new()));

/// Register a UDF under `udf.<name>`. Overwrites any previous registration
/// for the same name.
pub fn register(name: impl Into<String>, callable: impl Fn(&[UdfArg]) -> UdfResult + Send + Sync + 'static) {
    REGISTRY.write().insert(name.into(), Arc::new(callable));
}

/// Look up and invoke a UDF by its full `udf.<name>` call name. Returns
/// `None` if no UDF is registered under that name.
pub fn call(full_name: &str, args: &[UdfArg]) -> Option<UdfResult> {
    let name = full_name.strip_prefix("udf.")?;
    let f = REGISTRY.read().get(name).cloned()?;
    Some(f(args))
}

pub fn is_registered(full_name: &str) -> bool {
    full_name
        .strip_prefix("udf.")
        .map(|name| REGISTRY.read().contains_key(name))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_call_roundtrip() {
        register("double_test_udf", |args| match args.first() {
            Some(UdfArg::Int(i)) => UdfResult::Int(i * 2),
            _ => UdfResult::Undefined,
        });
        let r = call("udf.double_test_udf", &[UdfArg::Int(21)]);
        assert_eq!(r, Some(UdfResult::Int(42)));
    }

    #[test]
    fn unregistered_name_returns_none() {
        assert_eq!(call("udf.does_not_exist_udf", &[]), None);
    }
}
