//! The stack-based bytecode VM (`spec.md` §4.3).
//!
//! A single-threaded, cooperative-free interpreter: one [`Processor`] per
//! render, driving an operand [`Value`] stack against a [`FragmentStack`]
//! view of the host data, with side stacks for the active content-type
//! escaper and whitespace format mode. Runtime errors are logged and
//! substitute [`Value::Undefined`]; only a [`crate::writer::Writer`] error
//! aborts the render (`spec.md` §4.3 "Failure policy").

use std::collections::HashMap;
use std::rc::Rc;

use comfy_table::Table;
use smallvec::SmallVec;
use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

use crate::builtins::{self, BuiltinCtx};
use crate::config::Configuration;
use crate::content_type::{ContentType, ContentTypeRegistry};
use crate::dictionary::Dictionary;
use crate::error::{ErrorLog, Pos};
use crate::fragment::Fragment;
use crate::fragment_stack::FragmentStack;
use crate::format::FormatStack;
use crate::program::{BuiltinVar, Literal, Opcode, PathOrigin, Program, Segment, VarPath};
use crate::udf;
use crate::value::{self, Value};
use crate::writer::Writer;

/// Resolves an `include file='<path>'` target to a compiled sub-[`Program`]
/// (`spec.md` §6 "the OS file loader" is an out-of-scope collaborator; this
/// is the seam a [`crate::cache::TemplateCache`] plugs into).
pub trait IncludeLoader {
    fn load(&self, path: &str) -> Option<Rc<Program>>;
}

enum Flow {
    Next,
    Jump(usize),
    Halt,
    Abort,
}

/// Drives one render: a `Program` against a `FragmentStack` rooted at a
/// host-supplied [`Fragment`] tree, emitting through a [`Writer`].
pub struct Processor<'a> {
    program: &'a Program,
    frag_stack: FragmentStack,
    /// Inline-capacity-8: most expressions never push deeper than a couple
    /// of pending operands (`spec.md` §9 hot-path note).
    operand_stack: SmallVec<[Value; 8]>,
    /// Holds `case` subjects, kept separate from `operand_stack` so a
    /// multi-arm comparison chain can peek the subject repeatedly via
    /// `STACK_AT` without it ever being popped by an intervening binary op.
    case_stack: SmallVec<[Value; 4]>,
    escape_stack: Vec<Rc<str>>,
    format_stack: FormatStack,
    dict: &'a Dictionary,
    config: &'a Configuration,
    content_types: &'a ContentTypeRegistry,
    errors: ErrorLog,
    writer: &'a mut dyn Writer,
    loader: Option<&'a dyn IncludeLoader>,
    include_depth: u32,
    block_cursors: HashMap<Rc<str>, usize>,
    return_stack: Vec<(usize, usize)>,
}

impl<'a> Processor<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        program: &'a Program,
        root: Rc<Fragment>,
        dict: &'a Dictionary,
        config: &'a Configuration,
        content_types: &'a ContentTypeRegistry,
        default_mime: &str,
        writer: &'a mut dyn Writer,
        loader: Option<&'a dyn IncludeLoader>,
    ) -> Self {
        Processor {
            program,
            frag_stack: FragmentStack::new(root),
            operand_stack: SmallVec::new(),
            case_stack: SmallVec::new(),
            escape_stack: vec![Rc::from(default_mime)],
            format_stack: FormatStack::new(),
            dict,
            config,
            content_types,
            errors: ErrorLog::new(),
            writer,
            loader,
            include_depth: 0,
            block_cursors: HashMap::new(),
            return_stack: Vec::new(),
        }
    }

    /// Run the whole program to completion (or to `HALT`/a writer error) and
    /// return the accumulated error log.
    pub fn run(&mut self) -> &ErrorLog {
        let program = self.program;
        self.execute(program);
        if self.config.logtooutput && !self.errors.is_empty() {
            let dump = self.errors.to_string();
            let _ = self.writer.write(dump.as_bytes());
        }
        self.errors.finish();
        &self.errors
    }

    fn execute(&mut self, program: &Program) {
        let mut ip = 0usize;
        while ip < program.len() {
            while let Some(&(end, ret)) = self.return_stack.last() {
                if ip >= end {
                    self.return_stack.pop();
                    ip = ret;
                } else {
                    break;
                }
            }
            if ip >= program.len() {
                break;
            }
            match self.step(program, ip) {
                Flow::Next => ip += 1,
                Flow::Jump(target) => ip = target,
                Flow::Halt | Flow::Abort => break,
            }
        }
    }

    fn push(&mut self, v: Value) {
        self.operand_stack.push(v);
    }

    fn pop(&mut self) -> Value {
        self.operand_stack.pop().unwrap_or(Value::Undefined)
    }

    fn pop2(&mut self) -> (Value, Value) {
        let b = self.pop();
        let a = self.pop();
        (a, b)
    }

    fn active_ctype(&self) -> &ContentType {
        self.escape_stack
            .last()
            .and_then(|mime| self.content_types.get(mime))
            .unwrap_or_else(|| self.content_types.default_type())
    }

    fn step(&mut self, program: &Program, ip: usize) -> Flow {
        let pos = program.pos_at(ip);
        let op = program.instructions[ip].clone();
        match op {
            Opcode::Val(idx) => {
                self.push(program.literals[idx as usize].to_value());
                Flow::Next
            }
            Opcode::VarLoad(path, escape) => {
                let mut v = self.eval_var_path(&path, pos);
                if escape {
                    let s = v.to_display_string();
                    v = Value::Str(Rc::from(self.active_ctype().escape(&s).as_str()));
                }
                self.push(v);
                Flow::Next
            }
            Opcode::Pop => {
                self.pop();
                Flow::Next
            }
            Opcode::StackAt(idx) => {
                let len = self.case_stack.len();
                let v = len.checked_sub(1 + idx as usize).and_then(|i| self.case_stack.get(i).cloned());
                match v {
                    Some(v) => self.push(v),
                    None => {
                        self.errors.error(pos, "stack underflow in STACK_AT");
                        self.push(Value::Undefined);
                    }
                }
                Flow::Next
            }
            Opcode::CaseOpen => {
                let v = self.pop();
                self.case_stack.push(v);
                Flow::Next
            }
            Opcode::CaseClose => {
                self.case_stack.pop();
                Flow::Next
            }

            Opcode::Add => self.binop(pos, value::add),
            Opcode::Sub => self.binop(pos, value::sub),
            Opcode::Mul => self.binop(pos, value::mul),
            Opcode::Div => self.binop(pos, value::div),
            Opcode::Mod => self.binop(pos, value::modulo),
            Opcode::Repeat => self.binop(pos, value::repeat),
            Opcode::Concat => {
                let (a, b) = self.pop2();
                self.push(value::concat(&a, &b));
                Flow::Next
            }
            Opcode::BitAnd => self.binop(pos, value::bit_and),
            Opcode::BitOr => self.binop(pos, value::bit_or),
            Opcode::BitXor => self.binop(pos, value::bit_xor),
            Opcode::BitNot => self.unop(pos, value::bit_not),
            Opcode::Neg => self.unop(pos, value::neg),
            Opcode::Pos => self.unop(pos, value::pos),
            Opcode::Not => {
                let a = self.pop();
                self.push(value::not(&a));
                Flow::Next
            }
            Opcode::Eq => {
                let (a, b) = self.pop2();
                self.push(Value::Int(value::values_equal(&a, &b) as i64));
                Flow::Next
            }
            Opcode::Ne => {
                let (a, b) = self.pop2();
                self.push(Value::Int(!value::values_equal(&a, &b) as i64));
                Flow::Next
            }
            Opcode::StrEq => {
                let (a, b) = self.pop2();
                self.push(Value::Int((a.to_display_string() == b.to_display_string()) as i64));
                Flow::Next
            }
            Opcode::StrNe => {
                let (a, b) = self.pop2();
                self.push(Value::Int((a.to_display_string() != b.to_display_string()) as i64));
                Flow::Next
            }
            Opcode::Lt | Opcode::Le | Opcode::Gt | Opcode::Ge => {
                let (a, b) = self.pop2();
                match value::compare(&a, &b) {
                    Some(ord) => {
                        use std::cmp::Ordering::*;
                        let result = match (&op, ord) {
                            (Opcode::Lt, Less) => true,
                            (Opcode::Le, Less | Equal) => true,
                            (Opcode::Gt, Greater) => true,
                            (Opcode::Ge, Greater | Equal) => true,
                            _ => false,
                        };
                        self.push(Value::Int(result as i64));
                    }
                    None => {
                        self.errors.warning(pos, "comparison operand is not a number");
                        self.push(Value::Undefined);
                    }
                }
                Flow::Next
            }
            Opcode::RegexMatch | Opcode::RegexNotMatch => {
                let (a, b) = self.pop2();
                let haystack = a.to_display_string();
                let is_match = match &b {
                    Value::Regex(r) => r.compiled.is_match(&haystack),
                    Value::Str(pattern) => match regex::Regex::new(pattern) {
                        Ok(re) => re.is_match(&haystack),
                        Err(e) => {
                            self.errors.error(pos, format!("invalid regex '{pattern}': {e}"));
                            false
                        }
                    },
                    _ => {
                        self.errors.warning(pos, "regex match operand is not a regex or string");
                        false
                    }
                };
                let result = if matches!(op, Opcode::RegexMatch) { is_match } else { !is_match };
                self.push(Value::Int(result as i64));
                Flow::Next
            }

            Opcode::Jmp(offset) => Flow::Jump((ip as i64 + offset as i64) as usize),
            Opcode::JmpIfNot(offset) => {
                let cond = self.pop();
                if cond.to_bool() { Flow::Next } else { Flow::Jump((ip as i64 + offset as i64) as usize) }
            }
            Opcode::JmpAnd(offset) => {
                let truthy = self.operand_stack.last().map(|v| v.to_bool()).unwrap_or(false);
                if truthy {
                    self.pop();
                    Flow::Next
                } else {
                    Flow::Jump((ip as i64 + offset as i64) as usize)
                }
            }
            Opcode::JmpOr(offset) => {
                let truthy = self.operand_stack.last().map(|v| v.to_bool()).unwrap_or(false);
                if truthy {
                    Flow::Jump((ip as i64 + offset as i64) as usize)
                } else {
                    self.pop();
                    Flow::Next
                }
            }
            Opcode::Halt => Flow::Halt,

            Opcode::Print { literal_text, print_escape } => {
                let v = self.pop();
                let mut s = v.to_display_string();
                if literal_text {
                    s = self.format_stack.current().apply(&s);
                }
                if print_escape && self.config.alwaysescape && self.config.printescape {
                    s = self.active_ctype().escape(&s);
                }
                self.write_checked(pos, s.as_bytes())
            }
            Opcode::Set(path) => {
                let v = self.pop();
                self.exec_set(&path, v, pos);
                Flow::Next
            }

            Opcode::FragOpen(name) => {
                self.exec_frag_open(&name, pos);
                Flow::Next
            }
            Opcode::FragIter => {
                let has_next = self.frag_stack.next();
                self.push(Value::Int(has_next as i64));
                Flow::Next
            }
            Opcode::FragClose => {
                self.frag_stack.close();
                Flow::Next
            }

            Opcode::CtypePush(idx) => {
                if let Literal::Str(mime) = &program.literals[idx as usize] {
                    if self.content_types.get(mime).is_none() {
                        self.errors.warning(pos, format!("unknown content type '{mime}'"));
                    }
                    self.escape_stack.push(mime.clone());
                }
                Flow::Next
            }
            Opcode::CtypePop => {
                if self.escape_stack.len() > 1 {
                    self.escape_stack.pop();
                }
                Flow::Next
            }

            Opcode::FormatPush(idx) => {
                if let Literal::Str(mode) = &program.literals[idx as usize] {
                    match crate::format::FormatMode::parse(mode) {
                        Some(m) => self.format_stack.push(m),
                        None => {
                            self.errors.warning(pos, format!("unknown format mode '{mode}'"));
                            self.format_stack.push(crate::format::FormatMode::Identity);
                        }
                    }
                }
                Flow::Next
            }
            Opcode::FormatPop => {
                self.format_stack.pop();
                Flow::Next
            }

            Opcode::DebugFrag => {
                if self.config.debug {
                    let dump = self.render_debug_dump(pos);
                    return self.write_checked(pos, dump.as_bytes());
                }
                Flow::Next
            }
            Opcode::BytecodeFrag => {
                if self.config.bytecode {
                    let dump = self.render_bytecode_dump(program);
                    return self.write_checked(pos, dump.as_bytes());
                }
                Flow::Next
            }
            Opcode::ErrorFrag => {
                if self.config.errorfragment {
                    let dump = self.render_error_dump();
                    return self.write_checked(pos, dump.as_bytes());
                }
                Flow::Next
            }

            Opcode::DefineBlock(_) => Flow::Next,
            Opcode::Super(name) => self.exec_super(program, &name, ip, pos),

            Opcode::Call(name, argc) => {
                self.exec_call(&name, argc, pos);
                Flow::Next
            }
            Opcode::Include(idx) => {
                if let Literal::Str(path) = program.literals[idx as usize].clone() {
                    self.exec_include(&path, pos);
                }
                Flow::Next
            }
        }
    }

    fn binop(&mut self, pos: Pos, f: fn(&Value, &Value) -> Result<Value, value::ValueError>) -> Flow {
        let (a, b) = self.pop2();
        match f(&a, &b) {
            Ok(v) => self.push(v),
            Err(e) => {
                self.errors.warning(pos, e.to_string());
                self.push(Value::Undefined);
            }
        }
        Flow::Next
    }

    fn unop(&mut self, pos: Pos, f: fn(&Value) -> Result<Value, value::ValueError>) -> Flow {
        let a = self.pop();
        match f(&a) {
            Ok(v) => self.push(v),
            Err(e) => {
                self.errors.warning(pos, e.to_string());
                self.push(Value::Undefined);
            }
        }
        Flow::Next
    }

    fn write_checked(&mut self, pos: Pos, bytes: &[u8]) -> Flow {
        match self.writer.write(bytes) {
            Ok(()) => Flow::Next,
            Err(e) => {
                self.errors.fatal(pos, format!("writer error: {e}"));
                Flow::Abort
            }
        }
    }

    /// Resolve a compiled [`VarPath`] against the current `FragmentStack`,
    /// walking builtin/`_this`/`_parent`/dynamic-index segments per
    /// `spec.md` §4.4.
    fn eval_var_path(&mut self, path: &VarPath, pos: Pos) -> Value {
        let mut dyn_vals: Vec<Value> = (0..path.dynamic_count).map(|_| self.pop()).collect();
        dyn_vals.reverse();
        let mut dyn_iter = dyn_vals.into_iter();

        let depth = self.frag_stack.depth();
        let mut levels_out: usize = if path.origin == PathOrigin::Absolute { depth - 1 } else { 0 };
        let mut cursor: Option<Value> = None;
        let n = path.segments.len();

        for (i, seg) in path.segments.iter().enumerate() {
            let terminal = i + 1 == n;
            match seg {
                Segment::This { terminal: this_terminal } => {
                    if cursor.is_none() {
                        cursor = self.frag_stack.frame_at(levels_out).current().map(Value::FragRef);
                    }
                    if *this_terminal {
                        self.errors.warning(pos, "identifier is reserved");
                    } else {
                        self.errors.warning(pos, "ignoring useless _this");
                    }
                }
                Segment::Parent => {
                    if levels_out + 1 >= depth {
                        self.errors.warning(pos, "_parent violates the root boundary");
                    } else {
                        levels_out += 1;
                    }
                    if terminal {
                        self.errors.warning(pos, "identifier is reserved");
                    }
                    cursor = None;
                }
                Segment::Builtin(bv) => {
                    let frame = self.frag_stack.frame_at(levels_out);
                    cursor = Some(builtin_value(*bv, frame));
                }
                Segment::Field(name) => {
                    cursor = Some(self.resolve_field(cursor.take(), name, &mut levels_out, pos, i == 0 && path.origin == PathOrigin::Relative));
                }
                Segment::DynamicIndex => {
                    let idx_val = dyn_iter.next().unwrap_or(Value::Undefined);
                    let base = cursor.take().unwrap_or(Value::Undefined);
                    cursor = Some(self.resolve_index(&base, &idx_val, pos));
                }
            }
        }

        cursor.unwrap_or(Value::Undefined)
    }

    fn resolve_field(
        &mut self,
        cursor: Option<Value>,
        name: &str,
        levels_out: &mut usize,
        pos: Pos,
        is_first_relative: bool,
    ) -> Value {
        if let Some(val) = cursor {
            return lookup_child(&val, name, &self.frag_stack, &mut self.errors, pos);
        }
        if is_first_relative {
            if let Some((lv, v)) = self.frag_stack.resolve_relative_any(name) {
                *levels_out = lv;
                return v;
            }
            self.errors.warning(pos, format!("undefined variable '{name}'"));
            return Value::Undefined;
        }
        match self.frag_stack.frame_at(*levels_out).current() {
            Some(frag) => match frag.get(name) {
                Some(v) => v.clone(),
                None => {
                    self.errors.warning(pos, format!("undefined variable '{name}'"));
                    Value::Undefined
                }
            },
            None => Value::Undefined,
        }
    }

    fn resolve_index(&mut self, base: &Value, idx: &Value, pos: Pos) -> Value {
        match base {
            Value::FragListRef(list) => match idx.to_number() {
                Ok(n) => {
                    let i = n.as_f64() as i64;
                    if i < 0 || i as usize >= list.len() {
                        self.errors.warning(pos, "fragment list index out of range");
                        Value::Undefined
                    } else {
                        Value::FragRef(list.get(i as usize).unwrap().clone())
                    }
                }
                Err(_) => {
                    self.errors.warning(pos, "fragment list index must be numeric");
                    Value::Undefined
                }
            },
            Value::FragRef(frag) => {
                let key = idx.to_display_string();
                frag.get(&key).cloned().unwrap_or_else(|| {
                    self.errors.warning(pos, format!("undefined variable '{key}'"));
                    Value::Undefined
                })
            }
            _ => {
                self.errors.warning(pos, "indexing a non-fragment value");
                Value::Undefined
            }
        }
    }

    fn exec_set(&mut self, path: &VarPath, value: Value, pos: Pos) {
        match path.segments.last() {
            Some(Segment::Field(name)) => match path.origin {
                PathOrigin::Absolute => self.frag_stack.set_local_at_root(name, value),
                PathOrigin::Relative => self.frag_stack.set_local(name, value),
            },
            _ => {
                self.errors.warning(pos, "'set' target must be a simple variable name");
            }
        }
    }

    /// Resolve and open the fragment list `name` refers to, per `spec.md`
    /// §4.5. Pushes a loop-continue flag so a compiler can emit
    /// `JMP_IF_NOT` right after to skip an empty body (own VM-level
    /// addition beyond the literal opcode list, mirrored by `FragIter`).
    fn exec_frag_open(&mut self, name: &str, pos: Pos) {
        let resolved = self
            .frag_stack
            .resolve_relative_any(name)
            .map(|(_, v)| v)
            .unwrap_or_else(|| {
                self.errors.warning(pos, format!("undefined fragment '{name}'"));
                Value::Undefined
            });
        let list = match resolved {
            Value::FragListRef(list) => list,
            Value::FragRef(frag) => {
                let mut l = crate::fragment::FragmentList::new();
                l.push(frag);
                Rc::new(l)
            }
            Value::Undefined => Rc::new(crate::fragment::FragmentList::new()),
            _ => {
                self.errors.warning(pos, format!("'{name}' is not a fragment list"));
                Rc::new(crate::fragment::FragmentList::new())
            }
        };
        let should_enter = !list.is_empty();
        self.frag_stack.open(list);
        self.push(Value::Int(should_enter as i64));
    }

    fn exec_super(&mut self, program: &Program, name: &Rc<str>, ip: usize, pos: Pos) -> Flow {
        let idx = *self.block_cursors.entry(name.clone()).or_insert(0);
        match program.super_chain.get(name.as_ref()).and_then(|c| c.get(idx)).copied() {
            Some((start, end)) => {
                self.block_cursors.insert(name.clone(), idx + 1);
                self.return_stack.push((end as usize, ip + 1));
                Flow::Jump(start as usize)
            }
            None => {
                self.errors.warning(pos, format!("'super' called with no further base block '{name}'"));
                Flow::Next
            }
        }
    }

    fn exec_call(&mut self, name: &str, argc: u32, pos: Pos) {
        let mut args: Vec<Value> = (0..argc).map(|_| self.pop()).collect();
        args.reverse();

        let mime = self.escape_stack.last().cloned().unwrap_or_else(|| Rc::from(self.content_types.default_type().name));
        let mut ctx = BuiltinCtx {
            dict: self.dict,
            config: self.config,
            content_types: self.content_types,
            active_mime: &mime,
            errors: &mut self.errors,
            pos,
        };
        if let Some(v) = builtins::call(name, &args, &mut ctx) {
            self.push(v);
            return;
        }

        if name.starts_with("udf.") {
            let udf_args: Option<Vec<udf::UdfArg>> = args.iter().map(udf::UdfArg::from_value).collect();
            match udf_args {
                Some(udf_args) => match udf::call(name, &udf_args) {
                    Some(result) => {
                        self.push(result.to_value());
                        return;
                    }
                    None => {
                        self.errors.error(pos, format!("unregistered function '{name}'"));
                        self.push(Value::Undefined);
                        return;
                    }
                },
                None => {
                    self.errors.warning(pos, format!("function '{name}': fragment-valued arguments unsupported"));
                    self.push(Value::Undefined);
                    return;
                }
            }
        }

        self.errors.error(pos, format!("unknown function '{name}'"));
        self.push(Value::Undefined);
    }

    fn exec_include(&mut self, path: &str, pos: Pos) {
        if self.include_depth >= self.config.maxincludedepth.max(0) as u32 {
            self.errors.error(pos, format!("max include depth ({}) exceeded", self.config.maxincludedepth));
            return;
        }
        let Some(loader) = self.loader else {
            self.errors.error(pos, "include: no template loader configured");
            return;
        };
        match loader.load(path) {
            Some(sub) => {
                self.include_depth += 1;
                self.execute(&sub);
                self.include_depth -= 1;
            }
            None => self.errors.error(pos, format!("include: cannot load '{path}'")),
        }
    }

    fn render_bytecode_dump(&self, program: &Program) -> String {
        let mut table = Table::new();
        table.set_header(vec!["ip", "opcode", "pos"]);
        for (ip, (op, pos)) in program.instructions.iter().zip(program.positions.iter()).enumerate() {
            let opcode = self.clip(&format!("{op:?}"));
            table.add_row(vec![ip.to_string(), opcode, pos.to_string()]);
        }
        wrap_comment(&table.to_string(), self.active_ctype())
    }

    fn render_error_dump(&self) -> String {
        let mut table = Table::new();
        table.set_header(vec!["level", "pos", "message"]);
        for e in self.errors.entries() {
            table.add_row(vec![e.level.to_string(), e.pos.to_string(), self.clip(&e.message)]);
        }
        wrap_comment(&table.to_string(), self.active_ctype())
    }

    fn render_debug_dump(&self, pos: Pos) -> String {
        let mut frames = Table::new();
        frames.set_header(vec!["frame (outward)", "index", "count"]);
        for levels_out in 0..self.frag_stack.depth() {
            let frame = self.frag_stack.frame_at(levels_out);
            frames.add_row(vec![levels_out.to_string(), frame.index.to_string(), frame.count().to_string()]);
        }

        // Mirrors the original's `dumpFragment`: scalar fields of the
        // current fragment, clipped to `maxdebugvallength`. Nested fragments
        // and lists are already visible via the frame table above.
        let mut vars = Table::new();
        vars.set_header(vec!["name", "value"]);
        if let Some(frag) = self.frag_stack.current() {
            for (name, value) in frag.iter() {
                if let Value::FragRef(_) | Value::FragListRef(_) = value {
                    continue;
                }
                vars.add_row(vec![name.to_string(), self.clip(&value.to_display_string())]);
            }
        }

        let body = format!("at {pos}\n{frames}\n{vars}");
        wrap_comment(&body, self.active_ctype())
    }

    /// Clip display text to `maxdebugvallength` columns (display width, not
    /// bytes), appending `...` when truncated. `0` means unbounded
    /// (`spec.md` §9 "maxdebugvallength").
    fn clip(&self, s: &str) -> String {
        if self.config.maxdebugvallength <= 0 {
            return s.to_string();
        }
        let max = self.config.maxdebugvallength as usize;
        if s.width() <= max {
            return s.to_string();
        }
        let mut out = String::new();
        let mut width = 0;
        for ch in s.chars() {
            let w = ch.width().unwrap_or(0);
            if width + w > max {
                break;
            }
            out.push(ch);
            width += w;
        }
        out.push_str("...");
        out
    }
}

fn wrap_comment(body: &str, ctype: &ContentType) -> String {
    let (open, close) = ctype.block_comment;
    format!("{open}\n{body}\n{close}\n")
}

fn builtin_value(bv: BuiltinVar, frame: &crate::fragment_stack::Frame) -> Value {
    match bv {
        BuiltinVar::First => Value::Int(frame.is_first() as i64),
        BuiltinVar::Last => Value::Int(frame.is_last() as i64),
        BuiltinVar::Inner => Value::Int((!frame.is_first() && !frame.is_last()) as i64),
        BuiltinVar::Index => Value::Int(frame.index as i64),
        BuiltinVar::Count => Value::Int(frame.count() as i64),
    }
}

/// `spec.md` §4.4 step 2, for when the path continues past an
/// already-resolved value (as opposed to the outward search used for the
/// first relative segment).
fn lookup_child(val: &Value, name: &str, frag_stack: &FragmentStack, errors: &mut ErrorLog, pos: Pos) -> Value {
    match val {
        Value::FragRef(frag) => frag.get(name).cloned().unwrap_or_else(|| {
            errors.warning(pos, format!("undefined variable '{name}'"));
            Value::Undefined
        }),
        Value::FragListRef(list) => {
            if let Some(frame) = frag_stack.frame_for_list(list) {
                if let Some(frag) = frame.current() {
                    return frag.get(name).cloned().unwrap_or_else(|| {
                        errors.warning(pos, format!("undefined variable '{name}'"));
                        Value::Undefined
                    });
                }
            }
            if list.len() == 1 {
                if let Some(frag) = list.get(0) {
                    return frag.get(name).cloned().unwrap_or(Value::Undefined);
                }
            }
            errors.warning(pos, format!("'{name}' accessed on an unopened fragment list"));
            Value::Undefined
        }
        _ => {
            errors.warning(pos, format!("'{name}' accessed on a non-fragment value"));
            Value::Undefined
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content_type::ContentTypeRegistry;
    use crate::error::Pos;
    use crate::fragment::FragmentBuilder;
    use crate::program::{Program, VarPath};
    use crate::writer::StringWriter;

    fn root_with_var() -> Rc<Fragment> {
        let mut b = FragmentBuilder::new();
        b.set_str("var", "(var)");
        Rc::new(b.build())
    }

    fn run_program(program: &Program, root: Rc<Fragment>) -> (String, ErrorLog) {
        let dict = Dictionary::new();
        let config = Configuration::default();
        let cts = ContentTypeRegistry::builtin();
        let mut writer = StringWriter::new();
        let errors = {
            let mut proc = Processor::new(program, root, &dict, &config, &cts, "text/html", &mut writer, None);
            proc.run();
            proc.errors.clone()
        };
        (writer.into_string(), errors)
    }

    #[test]
    fn variable_resolution_simple() {
        let mut program = Program::new();
        let path = VarPath {
            origin: PathOrigin::Relative,
            segments: vec![Segment::Field(Rc::from("var"))],
            dynamic_count: 0,
        };
        program.push(Opcode::VarLoad(Rc::new(path), false), Pos::default());
        program.push(Opcode::Print { literal_text: false, print_escape: true }, Pos::default());

        let (out, errors) = run_program(&program, root_with_var());
        assert_eq!(out, "(var)");
        assert!(errors.is_empty());
    }

    #[test]
    fn variable_resolution_missing_warns() {
        let mut program = Program::new();
        let path = VarPath {
            origin: PathOrigin::Relative,
            segments: vec![Segment::Field(Rc::from("missing"))],
            dynamic_count: 0,
        };
        program.push(Opcode::VarLoad(Rc::new(path), false), Pos::default());
        program.push(Opcode::Print { literal_text: false, print_escape: true }, Pos::default());

        let (out, errors) = run_program(&program, root_with_var());
        assert_eq!(out, "undefined");
        assert_eq!(errors.entries().len(), 1);
    }

    #[test]
    fn html_escaping_scenario() {
        let mut b = FragmentBuilder::new();
        b.set_str("html", "<>&\"");
        let root = Rc::new(b.build());

        let mut program = Program::new();
        let path = VarPath {
            origin: PathOrigin::Relative,
            segments: vec![Segment::Field(Rc::from("html"))],
            dynamic_count: 0,
        };
        program.push(Opcode::VarLoad(Rc::new(path), false), Pos::default());
        program.push(Opcode::Print { literal_text: false, print_escape: true }, Pos::default());

        let (out, _) = run_program(&program, root);
        assert_eq!(out, "&lt;&gt;&amp;&quot;");
    }

    #[test]
    fn ternary_and_precedence() {
        // `${three ? 1 : 2}` with three=3 -> "1"
        let mut b = FragmentBuilder::new();
        b.set_int("three", 3);
        let root = Rc::new(b.build());

        let mut program = Program::new();
        let path = VarPath {
            origin: PathOrigin::Relative,
            segments: vec![Segment::Field(Rc::from("three"))],
            dynamic_count: 0,
        };
        program.push(Opcode::VarLoad(Rc::new(path), false), Pos::default());
        let jmp_if_not = program.push(Opcode::JmpIfNot(0), Pos::default());
        let one = program.intern(Literal::Int(1));
        program.push(Opcode::Val(one), Pos::default());
        let jmp_end = program.push(Opcode::Jmp(0), Pos::default());
        let else_target = program.len() as u32;
        let two = program.intern(Literal::Int(2));
        program.push(Opcode::Val(two), Pos::default());
        let end_target = program.len() as u32;
        program.push(Opcode::Print { literal_text: false, print_escape: false }, Pos::default());

        program.instructions[jmp_if_not as usize] =
            Opcode::JmpIfNot(else_target as i32 - jmp_if_not as i32);
        program.instructions[jmp_end as usize] = Opcode::Jmp(end_target as i32 - jmp_end as i32);

        let (out, _) = run_program(&program, root);
        assert_eq!(out, "1");
    }

    #[test]
    fn builtins_on_three_item_fragment_list() {
        let mut b = FragmentBuilder::new();
        b.list("nested", 3);
        let root = Rc::new(b.build());

        // <?teng frag nested?>${_first}${_index}${_count}<?teng endfrag?>
        let mut program = Program::new();
        program.push(Opcode::FragOpen(Rc::from("nested")), Pos::default());
        let enter_check = program.push(Opcode::JmpIfNot(0), Pos::default());
        let loop_start = program.len() as u32;

        for seg in [Segment::Builtin(BuiltinVar::First), Segment::Builtin(BuiltinVar::Index), Segment::Builtin(BuiltinVar::Count)] {
            let path = VarPath { origin: PathOrigin::Relative, segments: vec![seg], dynamic_count: 0 };
            program.push(Opcode::VarLoad(Rc::new(path), false), Pos::default());
            program.push(Opcode::Print { literal_text: false, print_escape: false }, Pos::default());
        }

        program.push(Opcode::FragIter, Pos::default());
        let exit_check = program.push(Opcode::JmpIfNot(0), Pos::default());
        let jmp_back = program.push(Opcode::Jmp(0), Pos::default());
        program.instructions[jmp_back as usize] = Opcode::Jmp(loop_start as i32 - jmp_back as i32);

        let after_loop = program.len() as u32;
        program.instructions[enter_check as usize] = Opcode::JmpIfNot(after_loop as i32 - enter_check as i32);
        program.instructions[exit_check as usize] = Opcode::JmpIfNot(after_loop as i32 - exit_check as i32);
        program.push(Opcode::FragClose, Pos::default());

        let (out, errors) = run_program(&program, root);
        assert_eq!(out, "103113213");
        assert!(errors.is_empty());
    }
}
