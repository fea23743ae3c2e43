//! Runtime view over a [`crate::fragment::Fragment`] tree with an open-frag
//! chain (`spec.md` §4.5).
//!
//! The stack root addresses the root fragment, treated as a single-element
//! list for indexing purposes. Each `open`/`close` pair mirrors one lexical
//! `frag`/`endfrag` block; the chain's depth always equals the lexical
//! nesting of currently-open `frag` directives (`spec.md` §4.5 invariant).

use std::collections::HashMap;
use std::rc::Rc;

use smallvec::SmallVec;

use crate::fragment::{Fragment, FragmentList};
use crate::value::Value;

/// One frame: the fragment list currently open, and which element of it is
/// the active iteration (`i`, out of `n`).
///
/// `locals` holds variables assigned by `set` while this frame is open
/// (`spec.md` §4.2 `set <lvalue> = <expr>`) — the FragmentTree itself is
/// host-owned and read-only, so assigned variables need somewhere to live.
/// They are scoped to the frame the same way a block-local variable is
/// scoped to its block: visible to `set`'s own frame and anything nested
/// inside it, gone once the frag closes.
#[derive(Debug, Clone, Default)]
pub struct Frame {
    pub list: Rc<FragmentList>,
    pub index: usize,
    locals: HashMap<Rc<str>, Value>,
}

impl Frame {
    pub fn count(&self) -> usize {
        self.list.len()
    }

    pub fn current(&self) -> Option<Rc<Fragment>> {
        self.list.get(self.index).cloned()
    }

    pub fn is_first(&self) -> bool {
        self.index == 0
    }

    pub fn is_last(&self) -> bool {
        self.count() == 0 || self.index + 1 == self.count()
    }
}

pub struct FragmentStack {
    /// Inline-capacity-8: the open-frag chain mirrors lexical `frag` nesting,
    /// which templates rarely take past a handful of levels deep.
    frames: SmallVec<[Frame; 8]>,
}

impl FragmentStack {
    /// Build a stack rooted at `root`, addressed as a single-element list.
    pub fn new(root: Rc<Fragment>) -> Self {
        let mut list = FragmentList::new();
        list.push(root);
        let mut frames = SmallVec::new();
        frames.push(Frame { list: Rc::new(list), index: 0, locals: HashMap::new() });
        FragmentStack { frames }
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn top(&self) -> &Frame {
        self.frames.last().expect("frag stack is never empty")
    }

    /// Frame `levels_out` outward from the top (`0` = top itself), clamped
    /// at the root frame.
    pub fn frame_at(&self, levels_out: usize) -> &Frame {
        let idx = self.frames.len().saturating_sub(1).saturating_sub(levels_out);
        &self.frames[idx]
    }

    pub fn root_frame(&self) -> &Frame {
        &self.frames[0]
    }

    /// Current fragment at the top frame's active iteration.
    pub fn current(&self) -> Option<Rc<Fragment>> {
        self.top().current()
    }

    /// Open a fragment list (already selected by the caller via a resolved
    /// variable path) as a new frame.
    pub fn open(&mut self, list: Rc<FragmentList>) {
        self.frames.push(Frame { list, index: 0, locals: HashMap::new() });
    }

    /// Assign a `set`-declared local in the top frame.
    pub fn set_local(&mut self, name: &str, value: Value) {
        let top = self.frames.last_mut().expect("frag stack is never empty");
        top.locals.insert(Rc::from(name), value);
    }

    /// Search outward from the top frame for a `set`-declared local named
    /// `name`, checked before fragment data at the same frame
    /// (`resolve_relative`).
    pub fn resolve_local(&self, name: &str) -> Option<(usize, Value)> {
        for levels_out in 0..self.frames.len() {
            let frame = self.frame_at(levels_out);
            if let Some(v) = frame.locals.get(name) {
                return Some((levels_out, v.clone()));
            }
        }
        None
    }

    /// Assign a `set`-declared local in the root frame (absolute `set`).
    pub fn set_local_at_root(&mut self, name: &str, value: Value) {
        self.frames[0].locals.insert(Rc::from(name), value);
    }

    /// Find the open frame whose list is the same list as `list`
    /// (`spec.md` §4.4 step 2: "if value is a `frag_list_ref` with one frame
    /// open at it, lookup applies to the current iteration").
    pub fn frame_for_list(&self, list: &Rc<FragmentList>) -> Option<&Frame> {
        self.frames.iter().find(|f| Rc::ptr_eq(&f.list, list))
    }

    /// Advance the top frame's iteration. Returns `true` if there is a next
    /// element to process.
    pub fn next(&mut self) -> bool {
        let top = self.frames.last_mut().expect("frag stack is never empty");
        if top.index + 1 < top.count() {
            top.index += 1;
            true
        } else {
            false
        }
    }

    pub fn close(&mut self) {
        if self.frames.len() > 1 {
            self.frames.pop();
        }
    }

    /// Search outward from the top frame for the deepest frame whose
    /// current fragment has a child named `name` (`spec.md` §4.4 step 1).
    /// Returns the levels-out count and the found value (cloned — `Value`
    /// is cheap to clone, it's either a scalar or an `Rc` handle).
    pub fn resolve_relative(&self, name: &str) -> Option<(usize, Value)> {
        for levels_out in 0..self.frames.len() {
            let frame = self.frame_at(levels_out);
            if let Some(frag) = frame.current() {
                if let Some(v) = frag.get(name) {
                    return Some((levels_out, v.clone()));
                }
            }
        }
        None
    }

    /// Absolute lookup: child of the root frame's fragment.
    pub fn resolve_absolute(&self, name: &str) -> Option<Value> {
        self.root_frame().current().and_then(|frag| frag.get(name).cloned())
    }

    /// Combined outward search used for the first segment of a relative
    /// path (`spec.md` §4.4 step 1): at each frame, starting from the top, a
    /// `set`-declared local shadows a same-named fragment field.
    pub fn resolve_relative_any(&self, name: &str) -> Option<(usize, Value)> {
        for levels_out in 0..self.frames.len() {
            let frame = self.frame_at(levels_out);
            if let Some(v) = frame.locals.get(name) {
                return Some((levels_out, v.clone()));
            }
            if let Some(frag) = frame.current() {
                if let Some(v) = frag.get(name) {
                    return Some((levels_out, v.clone()));
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::FragmentBuilder;

    #[test]
    fn relative_search_walks_outward() {
        let mut root = FragmentBuilder::new();
        root.set_str("outer_var", "outer");
        let items = root.list("items", 1);
        items[0].set_str("inner_var", "inner");
        let frag = Rc::new(root.build());

        let mut stack = FragmentStack::new(frag);
        let items_list = match stack.current().unwrap().get("items").unwrap().clone() {
            Value::FragListRef(l) => l,
            _ => panic!("expected list"),
        };
        stack.open(items_list);

        let (levels, v) = stack.resolve_relative("inner_var").unwrap();
        assert_eq!(levels, 0);
        assert_eq!(v.to_display_string(), "inner");

        let (levels, v) = stack.resolve_relative("outer_var").unwrap();
        assert_eq!(levels, 1);
        assert_eq!(v.to_display_string(), "outer");
    }

    #[test]
    fn builtins_on_three_item_list() {
        let mut root = FragmentBuilder::new();
        let items = root.list("nested", 3);
        for (i, item) in items.iter_mut().enumerate() {
            item.set_int("idx", i as i64);
        }
        let frag = Rc::new(root.build());
        let mut stack = FragmentStack::new(frag);
        let list = match stack.current().unwrap().get("nested").unwrap().clone() {
            Value::FragListRef(l) => l,
            _ => panic!("expected list"),
        };
        stack.open(list);

        let mut firsts = 0;
        let mut lasts = 0;
        loop {
            let top = stack.top();
            if top.is_first() {
                firsts += 1;
            }
            if top.is_last() {
                lasts += 1;
            }
            if !stack.next() {
                break;
            }
        }
        assert_eq!(firsts, 1);
        assert_eq!(lasts, 1);
    }
}
