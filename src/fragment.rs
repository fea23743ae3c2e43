//! The host-supplied data tree (`spec.md` §3 "Fragment / FragmentList").
//!
//! A [`Fragment`] is an ordered string-keyed map; a [`FragmentList`] is a
//! finite ordered sequence of fragments sharing a key. The host builds the
//! tree once (via [`FragmentBuilder`] or [`Fragment::from_json`]) and the
//! engine only ever borrows it for the duration of a render — fragments and
//! lists are `Rc`-shared so [`crate::value::Value::FragRef`]/`FragListRef`
//! can point into the tree without a lifetime parameter threading through
//! the whole VM.

use std::collections::HashMap;
use std::rc::Rc;

use crate::value::Value;

/// An ordered string-keyed map of values/fragment-lists. Duplicate keys
/// within one fragment are rejected by the builder (`spec.md` §3 invariant).
#[derive(Debug, Default)]
pub struct Fragment {
    order: Vec<Rc<str>>,
    values: HashMap<Rc<str>, Value>,
}

impl Fragment {
    pub fn new() -> Self {
        Fragment::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.order.iter().map(move |k| (k.as_ref(), &self.values[k]))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Insert a key/value pair. Returns `Err` if the key is already present
    /// (duplicate keys within a fragment are not allowed).
    fn insert(&mut self, key: &str, value: Value) -> Result<(), String> {
        let key: Rc<str> = Rc::from(key);
        if self.values.contains_key(&key) {
            return Err(format!("duplicate key '{key}' in fragment"));
        }
        self.order.push(key.clone());
        self.values.insert(key, value);
        Ok(())
    }
}

/// An ordered, finite sequence of fragments sharing a key.
#[derive(Debug, Default)]
pub struct FragmentList {
    items: Vec<Rc<Fragment>>,
}

impl FragmentList {
    pub fn new() -> Self {
        FragmentList::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Rc<Fragment>> {
        self.items.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rc<Fragment>> {
        self.items.iter()
    }

    pub(crate) fn push(&mut self, frag: Rc<Fragment>) {
        self.items.push(frag);
    }
}

/// Child of a fragment: either a scalar [`Value`] or a nested list of
/// fragments. `Fragment` stores everything as [`Value`] (`FragListRef` for
/// the list case); this is the builder-facing view used while assembling
/// a tree.
pub enum Child {
    Value(Value),
    List(Vec<FragmentBuilder>),
}

/// Fluent builder for constructing a [`Fragment`] tree from host code.
///
/// ```
/// use teng::fragment::FragmentBuilder;
/// use teng::value::Value;
///
/// let mut root = FragmentBuilder::new();
/// root.set("var", Value::Str("(var)".into()));
/// let frag = root.build();
/// assert_eq!(frag.get("var").unwrap().to_display_string(), "(var)");
/// ```
#[derive(Default)]
pub struct FragmentBuilder {
    entries: Vec<(String, Child)>,
}

impl FragmentBuilder {
    pub fn new() -> Self {
        FragmentBuilder::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) -> &mut Self {
        self.entries.push((key.into(), Child::Value(value)));
        self
    }

    pub fn set_int(&mut self, key: impl Into<String>, value: i64) -> &mut Self {
        self.set(key, Value::Int(value))
    }

    pub fn set_str(&mut self, key: impl Into<String>, value: impl AsRef<str>) -> &mut Self {
        self.set(key, Value::Str(Rc::from(value.as_ref())))
    }

    /// Open a nested fragment list under `key`, returning builders for each
    /// element for the caller to populate.
    pub fn list<'a>(&'a mut self, key: impl Into<String>, count: usize) -> &'a mut [FragmentBuilder] {
        let items = (0..count).map(|_| FragmentBuilder::new()).collect();
        self.entries.push((key.into(), Child::List(items)));
        match &mut self.entries.last_mut().unwrap().1 {
            Child::List(items) => items.as_mut_slice(),
            Child::Value(_) => unreachable!(),
        }
    }

    pub fn build(self) -> Fragment {
        let mut frag = Fragment::new();
        for (key, child) in self.entries {
            let value = match child {
                Child::Value(v) => v,
                Child::List(items) => {
                    let mut list = FragmentList::new();
                    for item in items {
                        list.push(Rc::new(item.build()));
                    }
                    Value::FragListRef(Rc::new(list))
                }
            };
            // Builder API misuse (duplicate key) is a programmer error on
            // the host side, not a template diagnostic; surfaced as panic
            // like other host-contract violations (e.g. `Vec::insert`
            // out-of-bounds) rather than threaded through `ErrorLog`.
            frag.insert(&key, value).expect("duplicate fragment key");
        }
        frag
    }
}

/// Construct a [`Fragment`] from a `serde_json::Value`. Supplemental to the
/// distilled spec (see `SPEC_FULL.md` §6): the original ships a JSON-backed
/// test/example data loader and this crate's tests lean on it heavily.
///
/// JSON objects become fragments; JSON arrays of objects become fragment
/// lists; scalars map to the corresponding [`Value`] variant. An array
/// containing anything other than objects is rejected, since a
/// `FragmentList` can only hold fragments.
pub fn fragment_from_json(json: &serde_json::Value) -> Result<Fragment, String> {
    match json {
        serde_json::Value::Object(map) => {
            let mut frag = Fragment::new();
            for (key, val) in map {
                let value = json_child_to_value(val)?;
                frag.insert(key, value)?;
            }
            Ok(frag)
        }
        _ => Err("root JSON value must be an object".to_string()),
    }
}

fn json_child_to_value(val: &serde_json::Value) -> Result<Value, String> {
    match val {
        serde_json::Value::Null => Ok(Value::Undefined),
        serde_json::Value::Bool(b) => Ok(Value::Int(*b as i64)),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Value::Int(i))
            } else {
                Ok(Value::Real(n.as_f64().unwrap_or(0.0)))
            }
        }
        serde_json::Value::String(s) => Ok(Value::Str(Rc::from(s.as_str()))),
        serde_json::Value::Array(items) => {
            let mut list = FragmentList::new();
            for item in items {
                let frag = fragment_from_json(item)?;
                list.push(Rc::new(frag));
            }
            Ok(Value::FragListRef(Rc::new(list)))
        }
        serde_json::Value::Object(_) => {
            let frag = fragment_from_json(val)?;
            Ok(Value::FragRef(Rc::new(frag)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_roundtrip() {
        let mut root = FragmentBuilder::new();
        root.set_str("var", "(var)");
        let items = root.list("nested", 3);
        for (i, item) in items.iter_mut().enumerate() {
            item.set_int("idx", i as i64);
        }
        let frag = root.build();
        assert_eq!(frag.get("var").unwrap().to_display_string(), "(var)");
        match frag.get("nested").unwrap() {
            Value::FragListRef(list) => assert_eq!(list.len(), 3),
            _ => panic!("expected list"),
        }
    }

    #[test]
    fn json_object_becomes_fragment() {
        let json: serde_json::Value = serde_json::json!({
            "var": "(var)",
            "nested": [{"idx": 0}, {"idx": 1}, {"idx": 2}],
        });
        let frag = fragment_from_json(&json).unwrap();
        assert_eq!(frag.get("var").unwrap().to_display_string(), "(var)");
        match frag.get("nested").unwrap() {
            Value::FragListRef(list) => assert_eq!(list.len(), 3),
            _ => panic!("expected list"),
        }
    }
}
