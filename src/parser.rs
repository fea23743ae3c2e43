//! Single-pass, emit-as-you-parse compiler (`spec.md` §4.1, §4.2, §4.4).
//!
//! There is no separate AST: every statement and expression production
//! appends directly onto the tail of a [`Program`] as it is recognized,
//! patching forward jumps once their target is known (`spec.md` §9 design
//! note: "emit bytecode as you parse rather than building then walking a
//! tree"). The [`Lexer`] is driven one token of lookahead at a time.
//!
//! `extends`/`override`/`define`/`super` compile into one flat `Program` by
//! recursively invoking the same parser over the base template's source,
//! swapping in a nested `Lexer` (`compile_nested_source`) and threading a
//! pending-overrides map through `self.active_overrides` (`spec.md` §4.2
//! template inheritance).

use std::collections::HashMap;
use std::rc::Rc;

use crate::builtins::{self, BuiltinCtx};
use crate::config::Configuration;
use crate::content_type::ContentTypeRegistry;
use crate::dictionary::Dictionary;
use crate::error::{ErrorLog, Pos};
use crate::lexer::{DirectiveKind, Lexer, Token};
use crate::program::{BuiltinVar, Literal, Opcode, PathOrigin, Program, Segment, VarPath};
use crate::value::{self, Value};

/// Compile-time collaborator for `extends`: loads a template's raw source so
/// its body can be compiled inline into the extending program. Distinct from
/// [`crate::processor::IncludeLoader`], which resolves a runtime `include`
/// to an already-compiled [`Program`] — `extends` needs the base template's
/// *source*, since its `define block`s are spliced into the same bytecode
/// stream as the overrides (`spec.md` §4.2).
pub trait SourceLoader {
    fn load(&self, path: &str) -> Option<String>;
}

/// The result of a compile: the `Program` plus every diagnostic raised along
/// the way (parse errors are never fatal to the whole compile — the parser
/// synchronizes to the next directive boundary and continues, `spec.md`
/// §4.1/§4.2).
pub struct ParseResult {
    pub program: Program,
    pub errors: ErrorLog,
}

#[derive(Clone)]
struct OverrideSlot {
    body_start: u32,
    exit_jmp_idx: u32,
}

enum SeqStop {
    Keyword(String),
    Eof,
}

/// Builtins whose result depends only on their (already-literal) arguments —
/// safe to fold at compile time by running them through the real
/// [`builtins::call`] against a throwaway context (`spec.md` §9 "model
/// constant folding as `Folded(v) | NeedsRuntime` rather than exceptions").
/// `escape`/`unescape`/`isenabled`/`dictexist`/`getdict`/`dict` depend on
/// render-time content-type or dictionary state and are deliberately
/// excluded; their `CALL` always runs at VM time.
const PURE_BUILTINS: &[&str] =
    &["len", "substr", "round", "numformat", "type", "isempty", "urlescape", "urlunescape", "jsonify", "defined"];

/// Bound on `extends` nesting (`spec.md` §6 `maxincludedepth`: "Max nesting
/// of `include`/`extends`"). The compile-time `extends` chain has no access
/// to a parsed `Configuration` (parsing happens before/independently of
/// params-file resolution at the cache layer), so this mirrors the
/// documented default rather than a configured value.
const MAX_EXTENDS_DEPTH: u32 = 10;

pub struct Parser<'a> {
    lexer: Lexer,
    tok: Token,
    tok_pos: Pos,
    program: Program,
    errors: ErrorLog,
    loader: Option<&'a dyn SourceLoader>,
    shorttag: bool,
    /// Names of `define block`s currently open, innermost last — what `super`
    /// (with no explicit target) resolves against.
    block_stack: Vec<Rc<str>>,
    /// While compiling a base template reached via `extends`, the override
    /// bodies waiting to be spliced in as each matching `define block` is
    /// compiled. `None` outside any `extends` chain.
    active_overrides: Option<HashMap<String, OverrideSlot>>,
    /// Files reached via the current `extends` chain, including the file
    /// being compiled itself — a path already in this list means `extends`
    /// would cycle back through it (`spec.md` §6 `maxincludedepth`).
    extends_chain: Vec<String>,
}

impl<'a> Parser<'a> {
    pub fn new(source: impl Into<Rc<str>>, main_file: &str, loader: Option<&'a dyn SourceLoader>, shorttag: bool) -> Self {
        let mut program = Program::new();
        let file = program.add_file(main_file);
        let mut parser = Parser {
            lexer: Lexer::new(source, file, shorttag),
            tok: Token::Eof,
            tok_pos: Pos::default(),
            program,
            errors: ErrorLog::new(),
            loader,
            shorttag,
            block_stack: Vec::new(),
            active_overrides: None,
            extends_chain: vec![main_file.to_string()],
        };
        parser.advance();
        parser
    }

    /// Compile the whole input to a finished `Program`.
    pub fn compile(mut self) -> ParseResult {
        self.parse_sequence(&[]);
        let halt_pos = self.tok_pos;
        self.program.push(Opcode::Halt, halt_pos);
        self.errors.finish();
        ParseResult { program: self.program, errors: self.errors }
    }

    // -- token plumbing -----------------------------------------------

    fn advance(&mut self) {
        loop {
            let pos = self.lexer.pos();
            match self.lexer.next_token() {
                Ok(t) => {
                    self.tok = t;
                    self.tok_pos = pos;
                    return;
                }
                Err(e) => {
                    let fatal = e.fatal;
                    self.errors.push(if fatal { crate::error::Level::Error } else { crate::error::Level::Warning }, e.pos, e.message);
                    if fatal {
                        self.tok = Token::Eof;
                        self.tok_pos = pos;
                        return;
                    }
                }
            }
        }
    }

    fn bump(&mut self) -> Token {
        let old = std::mem::replace(&mut self.tok, Token::Eof);
        self.advance();
        old
    }

    fn matches_tok(&self, t: &Token) -> bool {
        std::mem::discriminant(&self.tok) == std::mem::discriminant(t)
    }

    fn match_tok(&mut self, t: Token) -> bool {
        if self.matches_tok(&t) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, t: Token, msg: &str) -> bool {
        if self.match_tok(t) {
            true
        } else {
            self.errors.error(self.tok_pos, msg.to_string());
            false
        }
    }

    fn match_ident(&mut self, word: &str) -> bool {
        if let Token::Ident(n) = &self.tok {
            if n == word {
                self.bump();
                return true;
            }
        }
        false
    }

    fn expect_ident_literal(&mut self, word: &str) {
        if !self.match_ident(word) {
            self.errors.error(self.tok_pos, format!("expected '{word}'"));
        }
    }

    fn expect_ident(&mut self) -> Option<String> {
        if let Token::Ident(name) = self.tok.clone() {
            self.bump();
            Some(name)
        } else {
            self.errors.error(self.tok_pos, "expected an identifier");
            None
        }
    }

    fn expect_directive_end(&mut self) {
        if matches!(self.tok, Token::DirectiveEnd) {
            self.bump();
        } else {
            self.errors.error(self.tok_pos, "expected end of directive");
            self.sync_to_directive_end();
        }
    }

    fn sync_to_directive_end(&mut self) {
        while !matches!(self.tok, Token::DirectiveEnd | Token::Eof) {
            self.bump();
        }
        if matches!(self.tok, Token::DirectiveEnd) {
            self.bump();
        }
    }

    fn here(&self) -> u32 {
        self.program.len() as u32
    }

    fn emit(&mut self, op: Opcode, pos: Pos) -> u32 {
        self.program.push(op, pos)
    }

    fn emit_placeholder(&mut self, op: Opcode, pos: Pos) -> u32 {
        self.emit(op, pos)
    }

    fn patch_jmp(&mut self, idx: u32, target: u32) {
        let offset = target as i32 - idx as i32;
        match &mut self.program.instructions[idx as usize] {
            Opcode::Jmp(o) | Opcode::JmpIfNot(o) | Opcode::JmpAnd(o) | Opcode::JmpOr(o) => *o = offset,
            _ => {}
        }
    }

    fn truncate_from(&mut self, from: usize) {
        self.program.instructions.truncate(from);
        self.program.positions.truncate(from);
    }

    fn intern_value(&mut self, v: Value) -> u32 {
        let lit = match v {
            Value::Undefined => Literal::Undefined,
            Value::Int(i) => Literal::Int(i),
            Value::Real(r) => Literal::Real(r),
            Value::Str(s) => Literal::Str(s),
            other => Literal::Str(Rc::from(other.to_display_string().as_str())),
        };
        self.program.intern(lit)
    }

    // -- top-level statement sequencing --------------------------------

    /// Consume text/print/directive tokens until `Eof` or one of `stops`
    /// (a keyword-led directive, with its `Keyword`/`ShortTag` start and the
    /// keyword identifier already consumed — the caller handles whatever
    /// follows, including the directive's own closing `DirectiveEnd`).
    fn parse_sequence(&mut self, stops: &[&str]) -> SeqStop {
        loop {
            match self.tok.clone() {
                Token::Eof => return SeqStop::Eof,
                Token::Text(text) => {
                    let pos = self.tok_pos;
                    self.bump();
                    if !text.is_empty() {
                        let idx = self.program.intern_str(&text);
                        self.emit(Opcode::Val(idx), pos);
                        self.emit(Opcode::Print { literal_text: true, print_escape: false }, pos);
                    }
                }
                Token::DirectiveStart(DirectiveKind::PrintEscape) => {
                    self.bump();
                    self.compile_print(true);
                }
                Token::DirectiveStart(DirectiveKind::PrintRaw) => {
                    self.bump();
                    self.compile_print(false);
                }
                Token::DirectiveStart(DirectiveKind::DictLookup) => {
                    self.bump();
                    self.compile_dict_lookup();
                }
                Token::DirectiveStart(DirectiveKind::Keyword) | Token::DirectiveStart(DirectiveKind::ShortTag) => {
                    let pos = self.tok_pos;
                    self.bump();
                    let Some(keyword) = self.expect_ident_raw() else {
                        self.sync_to_directive_end();
                        continue;
                    };
                    if stops.contains(&keyword.as_str()) {
                        return SeqStop::Keyword(keyword);
                    }
                    self.dispatch_keyword(&keyword, pos);
                }
                _ => {
                    // Level-2 tokens can't appear outside a directive once
                    // the lexer has handed control back to level 1; a stray
                    // one here means a directive didn't close cleanly.
                    self.errors.error(self.tok_pos, "unexpected token outside a directive");
                    self.bump();
                }
            }
        }
    }

    fn expect_ident_raw(&mut self) -> Option<String> {
        if let Token::Ident(name) = self.tok.clone() {
            self.bump();
            Some(name)
        } else {
            self.errors.error(self.tok_pos, "expected a directive keyword");
            None
        }
    }

    fn dispatch_keyword(&mut self, keyword: &str, pos: Pos) {
        match keyword {
            "if" => self.parse_if_stmt(pos),
            "set" => self.parse_set_stmt(pos),
            "frag" => self.parse_frag_stmt(pos),
            "format" => self.parse_format_stmt(pos),
            "ctype" => self.parse_ctype_stmt(pos),
            "include" => self.parse_include_stmt(pos),
            "debug" => {
                self.expect_directive_end();
                self.emit(Opcode::DebugFrag, pos);
            }
            "bytecode" => {
                self.expect_directive_end();
                self.emit(Opcode::BytecodeFrag, pos);
            }
            "_error" => {
                self.expect_directive_end();
                self.emit(Opcode::ErrorFrag, pos);
            }
            "extends" => self.parse_extends_stmt(pos),
            "define" => self.parse_define_stmt(pos),
            "super" => self.parse_super_stmt(pos),
            "override" => {
                self.errors.error(pos, "'override' outside 'extends'");
                self.sync_to_directive_end();
            }
            "elseif" | "else" | "endif" | "endfrag" | "endformat" | "endctype" | "endextends" | "enddefine" | "endoverride" => {
                self.errors.error(pos, format!("unexpected '{keyword}' with no matching opening directive"));
                self.sync_to_directive_end();
            }
            other => {
                self.errors.error(pos, format!("unknown directive '{other}'"));
                self.errors.diag(pos, "synchronizing to next directive boundary");
                self.sync_to_directive_end();
            }
        }
    }

    // -- print / dict lookup -------------------------------------------

    fn compile_print(&mut self, print_escape: bool) {
        let pos = self.tok_pos;
        self.parse_expr();
        self.expect_directive_end();
        self.emit(Opcode::Print { literal_text: false, print_escape }, pos);
    }

    fn compile_dict_lookup(&mut self) {
        let pos = self.tok_pos;
        let Some(key) = self.parse_dotted_name_text() else {
            self.errors.error(pos, "expected a dictionary key");
            self.sync_to_directive_end();
            return;
        };
        self.expect_directive_end();
        let idx = self.program.intern_str(&key);
        self.emit(Opcode::Val(idx), pos);
        self.emit(Opcode::Call(Rc::from("dict"), 1), pos);
        self.emit(Opcode::Print { literal_text: false, print_escape: true }, pos);
    }

    fn parse_dotted_name_text(&mut self) -> Option<String> {
        let Token::Ident(first) = self.tok.clone() else { return None };
        self.bump();
        let mut name = first;
        while matches!(self.tok, Token::Dot) {
            self.bump();
            match self.expect_ident() {
                Some(part) => {
                    name.push('.');
                    name.push_str(&part);
                }
                None => break,
            }
        }
        Some(name)
    }

    // -- statements ------------------------------------------------------

    fn parse_if_stmt(&mut self, pos: Pos) {
        self.parse_expr();
        self.expect_directive_end();
        let mut jmp_if_not = self.emit_placeholder(Opcode::JmpIfNot(0), pos);
        let mut end_jumps = Vec::new();
        loop {
            match self.parse_sequence(&["elseif", "else", "endif"]) {
                SeqStop::Keyword(k) if k == "elseif" => {
                    let elseif_pos = self.tok_pos;
                    end_jumps.push(self.emit_placeholder(Opcode::Jmp(0), elseif_pos));
                    self.patch_jmp(jmp_if_not, self.here());
                    self.parse_expr();
                    self.expect_directive_end();
                    jmp_if_not = self.emit_placeholder(Opcode::JmpIfNot(0), elseif_pos);
                }
                SeqStop::Keyword(k) if k == "else" => {
                    let else_pos = self.tok_pos;
                    end_jumps.push(self.emit_placeholder(Opcode::Jmp(0), else_pos));
                    self.patch_jmp(jmp_if_not, self.here());
                    self.expect_directive_end();
                    self.parse_sequence(&["endif"]);
                    self.expect_directive_end();
                    break;
                }
                SeqStop::Keyword(_) => {
                    // endif
                    self.patch_jmp(jmp_if_not, self.here());
                    self.expect_directive_end();
                    break;
                }
                SeqStop::Eof => {
                    self.errors.error(pos, "unterminated 'if'");
                    break;
                }
            }
        }
        let end = self.here();
        for j in end_jumps {
            self.patch_jmp(j, end);
        }
    }

    fn parse_set_stmt(&mut self, pos: Pos) {
        let path = self.parse_lvalue(pos);
        if !self.match_tok(Token::Assign) {
            self.errors.error(self.tok_pos, "expected '=' in 'set'");
        }
        self.parse_expr();
        self.expect_directive_end();
        match path {
            Some(path) => {
                self.emit(Opcode::Set(Rc::new(path)), pos);
            }
            None => {
                self.emit(Opcode::Pop, pos);
            }
        }
    }

    /// `set`'s target is a single name, relative or (`.name`) absolute — the
    /// VM only ever assigns a frame-local by its own name (`spec.md` §4.2
    /// "`set <lvalue> = <expr>`"; `exec_set` rejects anything deeper).
    fn parse_lvalue(&mut self, pos: Pos) -> Option<VarPath> {
        let (origin, first) = if matches!(self.tok, Token::Dot) {
            self.bump();
            match self.expect_ident() {
                Some(name) => (PathOrigin::Absolute, name),
                None => return None,
            }
        } else if let Token::Ident(name) = self.tok.clone() {
            self.bump();
            (PathOrigin::Relative, name)
        } else {
            self.errors.error(pos, "'set' target must be a variable name");
            return None;
        };
        if matches!(self.tok, Token::Dot | Token::LBracket) {
            self.errors.error(pos, "'set' target must be a simple variable name");
            let mut segments = vec![Segment::Field(Rc::from(first.as_str()))];
            let mut dyn_count = 0;
            self.parse_var_tail(&mut segments, &mut dyn_count);
            return None;
        }
        Some(VarPath { origin, segments: vec![Segment::Field(Rc::from(first.as_str()))], dynamic_count: 0 })
    }

    fn parse_dotted_idents(&mut self) -> Vec<String> {
        let mut out = Vec::new();
        if matches!(self.tok, Token::Dot) {
            self.bump();
        }
        loop {
            match self.tok.clone() {
                Token::Ident(name) => {
                    self.bump();
                    out.push(name);
                }
                _ => break,
            }
            if matches!(self.tok, Token::Dot) {
                self.bump();
                continue;
            }
            break;
        }
        out
    }

    /// `frag a.b.c ... endfrag` opens each dotted segment as its own
    /// single-element frame (via the existing single-segment `FragOpen`) and
    /// only loops the innermost, so the compiled form is indistinguishable
    /// from the flat `frag` case the VM already knows (`spec.md` §4.5).
    fn parse_frag_stmt(&mut self, pos: Pos) {
        let segs = self.parse_dotted_idents();
        self.expect_directive_end();
        if segs.is_empty() {
            self.errors.error(pos, "'frag' requires a fragment name");
            self.parse_sequence(&["endfrag"]);
            self.expect_directive_end();
            return;
        }
        for seg in &segs[..segs.len() - 1] {
            self.emit(Opcode::FragOpen(Rc::from(seg.as_str())), pos);
            self.emit(Opcode::Pop, pos);
        }
        self.emit(Opcode::FragOpen(Rc::from(segs.last().unwrap().as_str())), pos);
        let enter_check = self.emit_placeholder(Opcode::JmpIfNot(0), pos);
        let loop_start = self.here();
        self.parse_sequence(&["endfrag"]);
        let endfrag_pos = self.tok_pos;
        self.expect_directive_end();
        self.emit(Opcode::FragIter, endfrag_pos);
        let exit_check = self.emit_placeholder(Opcode::JmpIfNot(0), endfrag_pos);
        let jmp_back = self.emit_placeholder(Opcode::Jmp(0), endfrag_pos);
        self.patch_jmp(jmp_back, loop_start);
        let after = self.here();
        self.patch_jmp(enter_check, after);
        self.patch_jmp(exit_check, after);
        self.emit(Opcode::FragClose, endfrag_pos);
        for _ in &segs[..segs.len() - 1] {
            self.emit(Opcode::FragClose, endfrag_pos);
        }
    }

    fn parse_attr(&mut self, expected: &str) -> Option<String> {
        if let Token::Ident(name) = self.tok.clone() {
            if name == expected {
                self.bump();
                if !self.match_tok(Token::Assign) {
                    self.errors.error(self.tok_pos, format!("expected '=' after '{expected}'"));
                    return None;
                }
                if let Token::StrLit(s) = self.tok.clone() {
                    self.bump();
                    return Some(s);
                }
                self.errors.error(self.tok_pos, format!("expected a string literal value for '{expected}'"));
                return None;
            }
        }
        None
    }

    fn parse_format_stmt(&mut self, pos: Pos) {
        let Some(mode) = self.parse_attr("space") else {
            self.errors.error(pos, "'format' requires space='<mode>'");
            self.sync_to_directive_end();
            self.parse_sequence(&["endformat"]);
            self.expect_directive_end();
            return;
        };
        self.expect_directive_end();
        let idx = self.program.intern_str(&mode);
        self.emit(Opcode::FormatPush(idx), pos);
        self.parse_sequence(&["endformat"]);
        let end_pos = self.tok_pos;
        self.expect_directive_end();
        self.emit(Opcode::FormatPop, end_pos);
    }

    fn parse_ctype_stmt(&mut self, pos: Pos) {
        let Token::StrLit(mime) = self.tok.clone() else {
            self.errors.error(pos, "'ctype' requires a string literal MIME name");
            self.sync_to_directive_end();
            self.parse_sequence(&["endctype"]);
            self.expect_directive_end();
            return;
        };
        self.bump();
        self.expect_directive_end();
        let idx = self.program.intern_str(&mime);
        self.emit(Opcode::CtypePush(idx), pos);
        self.parse_sequence(&["endctype"]);
        let end_pos = self.tok_pos;
        self.expect_directive_end();
        self.emit(Opcode::CtypePop, end_pos);
    }

    fn parse_include_stmt(&mut self, pos: Pos) {
        let Some(path) = self.parse_attr("file") else {
            self.errors.error(pos, "'include' requires file='<path>'");
            self.sync_to_directive_end();
            return;
        };
        self.expect_directive_end();
        let idx = self.program.intern_str(&path);
        self.emit(Opcode::Include(idx), pos);
    }

    // -- template inheritance --------------------------------------------

    fn parse_extends_stmt(&mut self, pos: Pos) {
        let Some(path) = self.parse_attr("file") else {
            self.errors.error(pos, "'extends' requires file='<path>'");
            self.sync_to_directive_end();
            return;
        };
        self.expect_directive_end();

        // Override bodies below are only ever reached by a jump from inside
        // the base template's matching `define block` (compiled afterward,
        // at a higher address) — never by falling into them in source order.
        let skip_overrides = self.emit_placeholder(Opcode::Jmp(0), pos);

        let mut overrides: HashMap<String, OverrideSlot> = HashMap::new();
        loop {
            match self.parse_sequence(&["override", "endextends"]) {
                SeqStop::Keyword(k) if k == "override" => {
                    self.expect_ident_literal("block");
                    let Some(name) = self.expect_ident() else {
                        self.sync_to_directive_end();
                        continue;
                    };
                    self.expect_directive_end();
                    let body_start = self.here();
                    // `super` inside an override body resolves against the
                    // block it overrides, same as inside `define block` itself.
                    self.block_stack.push(Rc::from(name.as_str()));
                    self.parse_sequence(&["endoverride"]);
                    self.block_stack.pop();
                    self.match_ident("block");
                    self.expect_directive_end();
                    let exit_jmp = self.emit_placeholder(Opcode::Jmp(0), pos);
                    overrides.insert(name, OverrideSlot { body_start, exit_jmp_idx: exit_jmp });
                }
                SeqStop::Keyword(_) => {
                    // endextends
                    self.expect_directive_end();
                    break;
                }
                SeqStop::Eof => {
                    self.errors.error(pos, "unterminated 'extends'");
                    return;
                }
            }
        }

        let base_start = self.here();
        self.patch_jmp(skip_overrides, base_start);

        let Some(loader) = self.loader else {
            self.errors.error(pos, "'extends' requires a compile-time template loader");
            return;
        };
        if self.extends_chain.len() as u32 > MAX_EXTENDS_DEPTH {
            self.errors.error(pos, format!("'extends' nesting exceeds max include depth ({MAX_EXTENDS_DEPTH})"));
            return;
        }
        if self.extends_chain.iter().any(|p| p == &path) {
            self.errors.error(pos, format!("'extends' cycle detected: '{path}' extends itself"));
            return;
        }
        let Some(source) = loader.load(&path) else {
            self.errors.error(pos, format!("extends: cannot load '{path}'"));
            return;
        };
        let base_file = self.program.add_file(&path);
        let prev_overrides = self.active_overrides.replace(overrides);
        self.extends_chain.push(path.clone());
        self.compile_nested_source(&source, base_file);
        self.extends_chain.pop();
        self.active_overrides = prev_overrides;
    }

    /// Compile `source` as if it were inline here: swap in a fresh `Lexer`
    /// over it, run the ordinary statement loop to its `Eof`, then restore
    /// the outer lexer/token. Instructions land on the same `Program`, so
    /// `super`'s jump targets and the literal pool are shared across the
    /// whole `extends` chain.
    fn compile_nested_source(&mut self, source: &str, file: u32) {
        let saved_lexer = std::mem::replace(&mut self.lexer, Lexer::new(source.to_string(), file, self.shorttag));
        let saved_tok = std::mem::replace(&mut self.tok, Token::Eof);
        let saved_pos = self.tok_pos;
        self.advance();
        self.parse_sequence(&[]);
        self.lexer = saved_lexer;
        self.tok = saved_tok;
        self.tok_pos = saved_pos;
    }

    fn parse_define_stmt(&mut self, pos: Pos) {
        self.expect_ident_literal("block");
        let Some(name) = self.expect_ident() else {
            self.sync_to_directive_end();
            return;
        };
        self.expect_directive_end();
        self.emit(Opcode::DefineBlock(Rc::from(name.as_str())), pos);
        self.block_stack.push(Rc::from(name.as_str()));

        let slot = self.active_overrides.as_ref().and_then(|m| m.get(&name)).cloned();
        let body_start = self.here();
        if let Some(slot) = slot {
            let skip_jmp = self.emit_placeholder(Opcode::Jmp(0), pos);
            let base_start = self.here();
            self.parse_sequence(&["enddefine"]);
            self.match_ident("block");
            self.expect_directive_end();
            let base_end = self.here();
            self.patch_jmp(skip_jmp, slot.body_start);
            self.program.super_chain.entry(name.clone()).or_default().push((base_start, base_end));
            self.patch_jmp(slot.exit_jmp_idx, base_end);
            self.program.blocks.insert(name.clone(), (body_start, base_end));
        } else {
            self.parse_sequence(&["enddefine"]);
            self.match_ident("block");
            self.expect_directive_end();
            let body_end = self.here();
            self.program.blocks.insert(name.clone(), (body_start, body_end));
        }
        self.block_stack.pop();
    }

    fn parse_super_stmt(&mut self, pos: Pos) {
        self.match_ident("block");
        self.expect_directive_end();
        match self.block_stack.last().cloned() {
            Some(name) => {
                self.emit(Opcode::Super(name), pos);
            }
            None => self.errors.error(pos, "'super' used outside an overridden block"),
        }
    }

    // -- expressions -------------------------------------------------------
    //
    // Precedence, loosest to tightest (`spec.md` §4.1):
    //   ternary > || > && > == != < <= > >= =~ !~ > | ^ & > + - > * / % ++ **
    //   > unary ! - + ~ > function call / indexing > primary.
    // Each binary-op level folds adjacent `Val` operands at compile time
    // (`try_fold_binop`), so e.g. `2+3` never reaches the VM as three
    // instructions.

    fn parse_expr(&mut self) {
        self.parse_ternary();
    }

    fn parse_ternary(&mut self) {
        let pos = self.tok_pos;
        self.parse_or();
        if matches!(self.tok, Token::Question) {
            self.bump();
            let jmp_if_not = self.emit_placeholder(Opcode::JmpIfNot(0), pos);
            self.parse_expr();
            self.expect(Token::Colon, "expected ':' in ternary");
            let jmp_end = self.emit_placeholder(Opcode::Jmp(0), pos);
            self.patch_jmp(jmp_if_not, self.here());
            self.parse_ternary();
            self.patch_jmp(jmp_end, self.here());
        }
    }

    fn parse_or(&mut self) {
        self.parse_and();
        while matches!(self.tok, Token::OrOr) {
            let pos = self.tok_pos;
            self.bump();
            let jmp = self.emit_placeholder(Opcode::JmpOr(0), pos);
            self.parse_and();
            self.patch_jmp(jmp, self.here());
        }
    }

    fn parse_and(&mut self) {
        self.parse_cmp();
        while matches!(self.tok, Token::AndAnd) {
            let pos = self.tok_pos;
            self.bump();
            let jmp = self.emit_placeholder(Opcode::JmpAnd(0), pos);
            self.parse_cmp();
            self.patch_jmp(jmp, self.here());
        }
    }

    fn parse_cmp(&mut self) {
        self.parse_bitor();
        loop {
            let op = match self.tok {
                Token::EqEq => Opcode::Eq,
                Token::NotEq => Opcode::Ne,
                Token::Lt => Opcode::Lt,
                Token::Le => Opcode::Le,
                Token::Gt => Opcode::Gt,
                Token::Ge => Opcode::Ge,
                Token::RegexMatch => Opcode::RegexMatch,
                Token::RegexNotMatch => Opcode::RegexNotMatch,
                _ => break,
            };
            let pos = self.tok_pos;
            self.bump();
            self.parse_bitor();
            self.emit_binop(op, pos);
        }
    }

    fn parse_bitor(&mut self) {
        self.parse_bitxor();
        while matches!(self.tok, Token::Pipe) {
            let pos = self.tok_pos;
            self.bump();
            self.parse_bitxor();
            self.emit_binop(Opcode::BitOr, pos);
        }
    }

    fn parse_bitxor(&mut self) {
        self.parse_bitand();
        while matches!(self.tok, Token::Caret) {
            let pos = self.tok_pos;
            self.bump();
            self.parse_bitand();
            self.emit_binop(Opcode::BitXor, pos);
        }
    }

    fn parse_bitand(&mut self) {
        self.parse_additive();
        while matches!(self.tok, Token::Amp) {
            let pos = self.tok_pos;
            self.bump();
            self.parse_additive();
            self.emit_binop(Opcode::BitAnd, pos);
        }
    }

    fn parse_additive(&mut self) {
        self.parse_mul();
        loop {
            let op = match self.tok {
                Token::Plus => Opcode::Add,
                Token::Minus => Opcode::Sub,
                _ => break,
            };
            let pos = self.tok_pos;
            self.bump();
            self.parse_mul();
            self.emit_binop(op, pos);
        }
    }

    fn parse_mul(&mut self) {
        self.parse_unary();
        loop {
            let op = match self.tok {
                Token::Star => Opcode::Mul,
                Token::Slash => Opcode::Div,
                Token::Percent => Opcode::Mod,
                Token::Concat => Opcode::Concat,
                Token::Repeat => Opcode::Repeat,
                _ => break,
            };
            let pos = self.tok_pos;
            self.bump();
            self.parse_unary();
            self.emit_binop(op, pos);
        }
    }

    fn parse_unary(&mut self) {
        let pos = self.tok_pos;
        match self.tok {
            Token::Not => {
                self.bump();
                self.parse_unary();
                self.emit_unop(Opcode::Not, pos);
            }
            Token::Minus => {
                self.bump();
                self.parse_unary();
                self.emit_unop(Opcode::Neg, pos);
            }
            Token::Plus => {
                self.bump();
                self.parse_unary();
                self.emit_unop(Opcode::Pos, pos);
            }
            Token::Tilde => {
                self.bump();
                self.parse_unary();
                self.emit_unop(Opcode::BitNot, pos);
            }
            _ => self.parse_primary(),
        }
    }

    fn emit_binop(&mut self, op: Opcode, pos: Pos) {
        if self.try_fold_binop(&op, pos) {
            return;
        }
        self.emit(op, pos);
    }

    fn try_fold_binop(&mut self, op: &Opcode, pos: Pos) -> bool {
        let n = self.program.instructions.len();
        if n < 2 {
            return false;
        }
        let (ia, ib) = match (&self.program.instructions[n - 2], &self.program.instructions[n - 1]) {
            (Opcode::Val(a), Opcode::Val(b)) => (*a, *b),
            _ => return false,
        };
        let a = self.program.literals[ia as usize].to_value();
        let b = self.program.literals[ib as usize].to_value();
        let folded = fold_binop(op, &a, &b);
        let Some(v) = folded else { return false };
        self.truncate_from(n - 2);
        let idx = self.intern_value(v);
        self.emit(Opcode::Val(idx), pos);
        true
    }

    fn emit_unop(&mut self, op: Opcode, pos: Pos) {
        let n = self.program.instructions.len();
        if n >= 1 {
            if let Opcode::Val(idx) = self.program.instructions[n - 1] {
                let a = self.program.literals[idx as usize].to_value();
                if let Some(v) = fold_unop(&op, &a) {
                    self.truncate_from(n - 1);
                    let idx = self.intern_value(v);
                    self.emit(Opcode::Val(idx), pos);
                    return;
                }
            }
        }
        self.emit(op, pos);
    }

    fn parse_primary(&mut self) {
        let pos = self.tok_pos;
        match self.tok.clone() {
            Token::IntLit(i) => {
                self.bump();
                let idx = self.program.intern(Literal::Int(i));
                self.emit(Opcode::Val(idx), pos);
            }
            Token::RealLit(r) => {
                self.bump();
                let idx = self.program.intern(Literal::Real(r));
                self.emit(Opcode::Val(idx), pos);
            }
            Token::StrLit(s) => {
                self.bump();
                let idx = self.program.intern_str(&s);
                self.emit(Opcode::Val(idx), pos);
            }
            Token::LParen => {
                self.bump();
                self.parse_expr();
                self.expect(Token::RParen, "expected ')'");
            }
            Token::Dot => {
                self.compile_var_ref_absolute(false, pos);
            }
            Token::DollarDollar | Token::Dollar => {
                self.compile_runtime_var_ref();
            }
            Token::Ident(name) if name == "case" => {
                self.bump();
                self.compile_case_expr(pos);
            }
            Token::Ident(name) => {
                self.bump();
                if matches!(self.tok, Token::LParen) {
                    self.compile_call(name, pos);
                } else {
                    self.compile_var_ref_from_ident(name, false, pos);
                }
            }
            other => {
                self.errors.error(pos, format!("unexpected token in expression: {other:?}"));
                if !matches!(other, Token::Eof) {
                    self.bump();
                }
                let idx = self.program.intern(Literal::Undefined);
                self.emit(Opcode::Val(idx), pos);
            }
        }
    }

    /// `case <subject> of <label>: <expr>, ... [, else: <expr>] end`.
    ///
    /// Not given a surface grammar in `spec.md` beyond the opcode names it
    /// mentions in passing (`STACK_AT`, a "program-stack ... used by case");
    /// this is the chosen concrete syntax (`DESIGN.md` open-question log).
    /// The subject lives on the VM's separate case-value stack for the whole
    /// construct, so each arm's `STACK_AT(0)` comparison never disturbs it —
    /// only the winning arm's result ends up on the operand stack.
    fn compile_case_expr(&mut self, case_pos: Pos) {
        self.parse_ternary();
        self.emit(Opcode::CaseOpen, case_pos);
        self.expect_ident_literal("of");
        let mut end_jumps = Vec::new();
        let mut had_else = false;
        loop {
            if self.match_ident("else") {
                self.expect(Token::Colon, "expected ':' after 'else' in case");
                self.parse_expr();
                had_else = true;
                break;
            }
            let arm_pos = self.tok_pos;
            self.emit(Opcode::StackAt(0), arm_pos);
            self.parse_unary();
            self.emit_binop(Opcode::Eq, arm_pos);
            let skip = self.emit_placeholder(Opcode::JmpIfNot(0), arm_pos);
            self.expect(Token::Colon, "expected ':' in case arm");
            self.parse_expr();
            end_jumps.push(self.emit_placeholder(Opcode::Jmp(0), arm_pos));
            self.patch_jmp(skip, self.here());
            if self.match_tok(Token::Comma) {
                continue;
            }
            break;
        }
        if !had_else {
            let idx = self.program.intern(Literal::Undefined);
            self.emit(Opcode::Val(idx), case_pos);
        }
        let end = self.here();
        for j in end_jumps {
            self.patch_jmp(j, end);
        }
        self.expect_ident_literal("end");
        self.emit(Opcode::CaseClose, case_pos);
    }

    fn try_fold_call(&mut self, name: &str, argc: u32) -> Option<Value> {
        if !PURE_BUILTINS.contains(&name) {
            return None;
        }
        let argc = argc as usize;
        let n = self.program.instructions.len();
        if n < argc {
            return None;
        }
        let mut args = Vec::with_capacity(argc);
        for i in 0..argc {
            match &self.program.instructions[n - argc + i] {
                Opcode::Val(idx) => args.push(self.program.literals[*idx as usize].to_value()),
                _ => return None,
            }
        }
        let dict = Dictionary::new();
        let config = Configuration::default();
        let cts = ContentTypeRegistry::builtin();
        let mut scratch = ErrorLog::new();
        let mut ctx = BuiltinCtx { dict: &dict, config: &config, content_types: &cts, active_mime: "text/html", errors: &mut scratch, pos: Pos::default() };
        let result = builtins::call(name, &args, &mut ctx)?;
        if !scratch.is_empty() {
            // Arity/type mismatch: let the real CALL run at VM time so the
            // diagnostic lands at this call's actual position.
            return None;
        }
        Some(result)
    }

    fn compile_call(&mut self, name: String, pos: Pos) {
        self.bump(); // '('
        let mut argc = 0u32;
        if !matches!(self.tok, Token::RParen) {
            loop {
                self.parse_expr();
                argc += 1;
                if matches!(self.tok, Token::Comma) {
                    self.bump();
                    continue;
                }
                break;
            }
        }
        self.expect(Token::RParen, "expected ')'");
        if let Some(v) = self.try_fold_call(&name, argc) {
            let n = self.program.instructions.len();
            self.truncate_from(n - argc as usize);
            let idx = self.intern_value(v);
            self.emit(Opcode::Val(idx), pos);
            return;
        }
        self.emit(Opcode::Call(Rc::from(name.as_str()), argc), pos);
    }

    // -- variable paths ---------------------------------------------------

    fn classify_ident(name: &str) -> Segment {
        match name {
            "_this" => Segment::This { terminal: false },
            "_parent" => Segment::Parent,
            "_first" => Segment::Builtin(BuiltinVar::First),
            "_last" => Segment::Builtin(BuiltinVar::Last),
            "_inner" => Segment::Builtin(BuiltinVar::Inner),
            "_index" => Segment::Builtin(BuiltinVar::Index),
            "_count" => Segment::Builtin(BuiltinVar::Count),
            _ => Segment::Field(Rc::from(name)),
        }
    }

    fn mark_terminal_this(segments: &mut [Segment]) {
        if let Some(Segment::This { terminal }) = segments.last_mut() {
            *terminal = true;
        }
    }

    fn parse_var_tail(&mut self, segments: &mut Vec<Segment>, dyn_count: &mut usize) {
        loop {
            match self.tok.clone() {
                Token::Dot => {
                    self.bump();
                    let ident_pos = self.tok_pos;
                    match self.tok.clone() {
                        Token::Ident(name) => {
                            self.bump();
                            segments.push(Self::classify_ident(&name));
                        }
                        other => {
                            self.errors.error(ident_pos, format!("expected an identifier after '.', found {other:?}"));
                            break;
                        }
                    }
                }
                Token::LBracket => {
                    self.bump();
                    self.parse_expr();
                    self.expect(Token::RBracket, "expected ']'");
                    segments.push(Segment::DynamicIndex);
                    *dyn_count += 1;
                }
                _ => break,
            }
        }
        Self::mark_terminal_this(segments);
    }

    fn warn_if_useless_runtime(&mut self, explicit_runtime: bool, dyn_count: usize, pos: Pos) {
        if explicit_runtime && dyn_count == 0 {
            self.errors.warning(pos, "runtime variable is useless: path has no dynamic index");
        }
    }

    fn compile_var_ref_from_ident(&mut self, name: String, explicit_runtime: bool, pos: Pos) {
        let mut segments = vec![Self::classify_ident(&name)];
        let mut dyn_count = 0usize;
        if matches!(self.tok, Token::LBracket) {
            self.bump();
            self.parse_expr();
            self.expect(Token::RBracket, "expected ']'");
            segments.push(Segment::DynamicIndex);
            dyn_count += 1;
        }
        self.parse_var_tail(&mut segments, &mut dyn_count);
        self.warn_if_useless_runtime(explicit_runtime, dyn_count, pos);
        let path = VarPath { origin: PathOrigin::Relative, segments, dynamic_count: dyn_count };
        self.emit(Opcode::VarLoad(Rc::new(path), false), pos);
    }

    fn compile_var_ref_absolute(&mut self, explicit_runtime: bool, pos: Pos) {
        self.bump(); // leading '.'
        let mut segments = Vec::new();
        let mut dyn_count = 0usize;
        match self.tok.clone() {
            Token::Ident(name) => {
                self.bump();
                segments.push(Self::classify_ident(&name));
            }
            other => {
                self.errors.error(pos, format!("expected an identifier after '.', found {other:?}"));
                let idx = self.program.intern(Literal::Undefined);
                self.emit(Opcode::Val(idx), pos);
                return;
            }
        }
        if matches!(self.tok, Token::LBracket) {
            self.bump();
            self.parse_expr();
            self.expect(Token::RBracket, "expected ']'");
            segments.push(Segment::DynamicIndex);
            dyn_count += 1;
        }
        self.parse_var_tail(&mut segments, &mut dyn_count);
        self.warn_if_useless_runtime(explicit_runtime, dyn_count, pos);
        let path = VarPath { origin: PathOrigin::Absolute, segments, dynamic_count: dyn_count };
        self.emit(Opcode::VarLoad(Rc::new(path), false), pos);
    }

    /// `$name...`/`$$name...`/`$.name...`: an explicitly-runtime variable
    /// reference (`spec.md` §4.1 GLOSSARY "runtime variable"). Compiles
    /// identically to the bare form — the distinction only matters for the
    /// "useless runtime variable" diagnostic when no dynamic index follows.
    fn compile_runtime_var_ref(&mut self) {
        let pos = self.tok_pos;
        self.bump(); // '$' or '$$'
        if matches!(self.tok, Token::Dot) {
            self.compile_var_ref_absolute(true, pos);
        } else if let Token::Ident(name) = self.tok.clone() {
            self.bump();
            self.compile_var_ref_from_ident(name, true, pos);
        } else {
            self.errors.error(pos, "expected a variable path after '$'");
            let idx = self.program.intern(Literal::Undefined);
            self.emit(Opcode::Val(idx), pos);
        }
    }
}

fn fold_binop(op: &Opcode, a: &Value, b: &Value) -> Option<Value> {
    match op {
        Opcode::Add => value::add(a, b).ok(),
        Opcode::Sub => value::sub(a, b).ok(),
        Opcode::Mul => value::mul(a, b).ok(),
        Opcode::Div => value::div(a, b).ok(),
        Opcode::Mod => value::modulo(a, b).ok(),
        Opcode::Concat => Some(value::concat(a, b)),
        Opcode::Repeat => value::repeat(a, b).ok(),
        Opcode::BitAnd => value::bit_and(a, b).ok(),
        Opcode::BitOr => value::bit_or(a, b).ok(),
        Opcode::BitXor => value::bit_xor(a, b).ok(),
        Opcode::Eq => Some(Value::Int(value::values_equal(a, b) as i64)),
        Opcode::Ne => Some(Value::Int(!value::values_equal(a, b) as i64)),
        Opcode::StrEq => Some(Value::Int((a.to_display_string() == b.to_display_string()) as i64)),
        Opcode::StrNe => Some(Value::Int((a.to_display_string() != b.to_display_string()) as i64)),
        Opcode::Lt | Opcode::Le | Opcode::Gt | Opcode::Ge => value::compare(a, b).map(|ord| {
            use std::cmp::Ordering::*;
            let result = match (op, ord) {
                (Opcode::Lt, Less) => true,
                (Opcode::Le, Less | Equal) => true,
                (Opcode::Gt, Greater) => true,
                (Opcode::Ge, Greater | Equal) => true,
                _ => false,
            };
            Value::Int(result as i64)
        }),
        // Regex matching isn't folded: a string operand is compiled fresh
        // each time here, so there's no compile-time cost being saved, and
        // folding would need to duplicate the VM's regex-compile-error path.
        _ => None,
    }
}

fn fold_unop(op: &Opcode, a: &Value) -> Option<Value> {
    match op {
        Opcode::Neg => value::neg(a).ok(),
        Opcode::Pos => value::pos(a).ok(),
        Opcode::BitNot => value::bit_not(a).ok(),
        Opcode::Not => Some(value::not(a)),
        _ => None,
    }
}

/// Convenience entry point mirroring the teacher's own `parse_template`
/// façade: compile one standalone template with no `extends` support.
pub fn parse_template(source: &str, main_file: &str, shorttag: bool) -> ParseResult {
    Parser::new(source.to_string(), main_file, None, shorttag).compile()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content_type::ContentTypeRegistry;
    use crate::dictionary::Dictionary;
    use crate::fragment::FragmentBuilder;
    use crate::processor::Processor;
    use crate::writer::StringWriter;

    fn render(program: &Program, root: Rc<crate::fragment::Fragment>) -> (String, ErrorLog) {
        let dict = Dictionary::new();
        let config = Configuration::default();
        let cts = ContentTypeRegistry::builtin();
        let mut writer = StringWriter::new();
        let errors = {
            let mut proc = Processor::new(program, root, &dict, &config, &cts, "text/html", &mut writer, None);
            proc.run().clone()
        };
        (writer.into_string(), errors)
    }

    fn empty_root() -> Rc<crate::fragment::Fragment> {
        Rc::new(FragmentBuilder::new().build())
    }

    #[test]
    fn plain_text_round_trips() {
        let r = parse_template("hello world", "<main>", true);
        assert!(r.errors.is_empty());
        let (out, errors) = render(&r.program, empty_root());
        assert_eq!(out, "hello world");
        assert!(errors.is_empty());
    }

    #[test]
    fn print_escape_directive_escapes_html() {
        let mut b = FragmentBuilder::new();
        b.set_str("html", "<b>");
        let root = Rc::new(b.build());
        let r = parse_template("${html}", "<main>", true);
        assert!(r.errors.is_empty());
        let (out, _) = render(&r.program, root);
        assert_eq!(out, "&lt;b&gt;");
    }

    #[test]
    fn constant_folds_arithmetic_to_one_instruction() {
        let r = parse_template("${1+2}", "<main>", true);
        // Val(3) + Print, no Add opcode at all.
        assert!(!r.program.instructions.iter().any(|op| matches!(op, Opcode::Add)));
        let (out, _) = render(&r.program, empty_root());
        assert_eq!(out, "3");
    }

    #[test]
    fn if_elseif_else_chain() {
        let mut b = FragmentBuilder::new();
        b.set_int("n", 2);
        let root = Rc::new(b.build());
        let src = "<?teng if n==1?>one<?teng elseif n==2?>two<?teng else?>other<?teng endif?>";
        let r = parse_template(src, "<main>", true);
        assert!(r.errors.is_empty());
        let (out, _) = render(&r.program, root);
        assert_eq!(out, "two");
    }

    #[test]
    fn frag_loop_over_list() {
        let mut b = FragmentBuilder::new();
        b.list("items", 3);
        let root = Rc::new(b.build());
        let src = "<?teng frag items?>${_index}<?teng endfrag?>";
        let r = parse_template(src, "<main>", true);
        assert!(r.errors.is_empty());
        let (out, _) = render(&r.program, root);
        assert_eq!(out, "012");
    }

    #[test]
    fn dotted_frag_name_opens_each_segment() {
        let mut b = FragmentBuilder::new();
        let inner = b.list("outer", 1);
        inner[0].list("inner", 2);
        let root = Rc::new(b.build());
        let src = "<?teng frag outer.inner?>x<?teng endfrag?>";
        let r = parse_template(src, "<main>", true);
        assert!(r.errors.is_empty());
        let (out, _) = render(&r.program, root);
        assert_eq!(out, "xx");
    }

    #[test]
    fn set_and_reload_local() {
        let src = "<?teng set x = 5?>${x}";
        let r = parse_template(src, "<main>", true);
        assert!(r.errors.is_empty());
        let (out, _) = render(&r.program, empty_root());
        assert_eq!(out, "5");
    }

    #[test]
    fn ternary_precedence() {
        let src = "${1 ? 2 : 3}";
        let r = parse_template(src, "<main>", true);
        let (out, _) = render(&r.program, empty_root());
        assert_eq!(out, "2");
    }

    #[test]
    fn case_expression_selects_matching_arm() {
        let mut b = FragmentBuilder::new();
        b.set_int("n", 2);
        let root = Rc::new(b.build());
        let src = "${case n of 1: 'one', 2: 'two', else: 'other' end}";
        let r = parse_template(src, "<main>", true);
        assert!(r.errors.is_empty(), "{:?}", r.errors.entries());
        let (out, _) = render(&r.program, root);
        assert_eq!(out, "two");
    }

    #[test]
    fn case_expression_falls_back_to_else() {
        let mut b = FragmentBuilder::new();
        b.set_int("n", 9);
        let root = Rc::new(b.build());
        let src = "${case n of 1: 'one', 2: 'two', else: 'other' end}";
        let r = parse_template(src, "<main>", true);
        let (out, _) = render(&r.program, root);
        assert_eq!(out, "other");
    }

    #[test]
    fn undefined_variable_prints_undefined_and_warns() {
        let r = parse_template("${missing}", "<main>", true);
        let (out, errors) = render(&r.program, empty_root());
        assert_eq!(out, "undefined");
        assert_eq!(errors.entries().len(), 1);
    }

    #[test]
    fn format_block_collapses_whitespace() {
        let src = "<?teng format space='onespace'?>a   b\nc<?teng endformat?>";
        let r = parse_template(src, "<main>", true);
        assert!(r.errors.is_empty());
        let (out, _) = render(&r.program, empty_root());
        assert_eq!(out, "a b c");
    }

    #[test]
    fn ctype_block_switches_escaping() {
        let mut b = FragmentBuilder::new();
        b.set_str("v", "<x>");
        let root = Rc::new(b.build());
        let src = "<?teng ctype 'text/plain'?>${v}<?teng endctype?>";
        let r = parse_template(src, "<main>", true);
        assert!(r.errors.is_empty());
        let (out, _) = render(&r.program, root);
        assert_eq!(out, "<x>");
    }

    struct MapLoader(std::collections::HashMap<&'static str, &'static str>);
    impl SourceLoader for MapLoader {
        fn load(&self, path: &str) -> Option<String> {
            self.0.get(path).map(|s| s.to_string())
        }
    }

    #[test]
    fn extends_with_override_and_super() {
        let mut map = std::collections::HashMap::new();
        map.insert("base.teng", "<?teng define block greeting?>hello<?teng enddefine block?>!");
        let loader = MapLoader(map);
        let src = "<?teng extends file='base.teng'?><?teng override block greeting?>dear <?teng super block?><?teng endoverride block?><?teng endextends?>";
        let r = Parser::new(src.to_string(), "<main>", Some(&loader), true).compile();
        assert!(r.errors.is_empty(), "{:?}", r.errors.entries());
        let (out, _) = render(&r.program, empty_root());
        assert_eq!(out, "dear hello!");
    }

    #[test]
    fn extends_without_override_keeps_base_body() {
        let mut map = std::collections::HashMap::new();
        map.insert("base.teng", "<?teng define block greeting?>hello<?teng enddefine block?>!");
        let loader = MapLoader(map);
        let src = "<?teng extends file='base.teng'?><?teng endextends?>";
        let r = Parser::new(src.to_string(), "<main>", Some(&loader), true).compile();
        assert!(r.errors.is_empty(), "{:?}", r.errors.entries());
        let (out, _) = render(&r.program, empty_root());
        assert_eq!(out, "hello!");
    }

    #[test]
    fn extends_cycle_is_rejected_instead_of_overflowing_the_stack() {
        let mut map = std::collections::HashMap::new();
        map.insert("a.teng", "<?teng extends file='b.teng'?><?teng endextends?>");
        map.insert("b.teng", "<?teng extends file='a.teng'?><?teng endextends?>");
        let loader = MapLoader(map);
        let src = "<?teng extends file='a.teng'?><?teng endextends?>";
        let r = Parser::new(src.to_string(), "<main>", Some(&loader), true).compile();
        assert!(r.errors.has_errors(), "expected a cycle error, got {:?}", r.errors.entries());
    }

    #[test]
    fn extends_self_is_rejected() {
        let mut map = std::collections::HashMap::new();
        map.insert("a.teng", "<?teng extends file='a.teng'?><?teng endextends?>");
        let loader = MapLoader(map);
        let src = "<?teng extends file='a.teng'?><?teng endextends?>";
        let r = Parser::new(src.to_string(), "<main>", Some(&loader), true).compile();
        assert!(r.errors.has_errors(), "expected a cycle error, got {:?}", r.errors.entries());
    }
}
