//! Whitespace "format" modes applied to literal-text print instructions
//! (`spec.md` §4.6).
//!
//! Modes only ever transform text that came from a literal run in the
//! source, never an expression's printed value (`spec.md` §8 invariant 1:
//! "`format` modes affect only literal-text runs inside their scope") —
//! this is why [`crate::program::Opcode::Print`] carries a `literal_text`
//! flag distinguishing the two.

use std::fmt;

/// One whitespace policy, named after its `<?teng format space='...'?>`
/// mode string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatMode {
    /// No transformation; the default when no `format` block is open.
    Identity,
    NoWhite,
    OneSpace,
    StripLines,
    JoinLines,
    NoWhiteLines,
    /// Alias of `NoWhite` (`spec.md` §4.6: "`nospace` (like `nowhite`)").
    NoSpace,
}

impl FormatMode {
    pub fn parse(mode: &str) -> Option<FormatMode> {
        Some(match mode {
            "nowhite" => FormatMode::NoWhite,
            "onespace" => FormatMode::OneSpace,
            "striplines" => FormatMode::StripLines,
            "joinlines" => FormatMode::JoinLines,
            "nowhitelines" => FormatMode::NoWhiteLines,
            "nospace" => FormatMode::NoSpace,
            _ => return None,
        })
    }

    /// Apply this mode to one literal-text run.
    pub fn apply(self, text: &str) -> String {
        match self {
            FormatMode::Identity => text.to_string(),
            FormatMode::NoWhite | FormatMode::NoSpace => {
                text.chars().filter(|c| !c.is_whitespace()).collect()
            }
            FormatMode::OneSpace => collapse_whitespace(text),
            FormatMode::StripLines => text
                .split('\n')
                .map(|line| line.trim())
                .collect::<Vec<_>>()
                .join("\n"),
            FormatMode::JoinLines => text
                .split('\n')
                .map(|line| line.trim())
                .filter(|line| !line.is_empty())
                .collect::<Vec<_>>()
                .join(" "),
            FormatMode::NoWhiteLines => text
                .split('\n')
                .filter(|line| !line.trim().is_empty())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

impl fmt::Display for FormatMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FormatMode::Identity => "identity",
            FormatMode::NoWhite => "nowhite",
            FormatMode::OneSpace => "onespace",
            FormatMode::StripLines => "striplines",
            FormatMode::JoinLines => "joinlines",
            FormatMode::NoWhiteLines => "nowhitelines",
            FormatMode::NoSpace => "nospace",
        };
        f.write_str(s)
    }
}

fn collapse_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_was_space = false;
    for c in text.chars() {
        if c.is_whitespace() {
            if !last_was_space {
                out.push(' ');
            }
            last_was_space = true;
        } else {
            out.push(c);
            last_was_space = false;
        }
    }
    out
}

/// A stack of nested format scopes; innermost (top) is effective. Popping
/// restores the enclosing mode (`spec.md` §4.6: "Modes stack: inner pops
/// restore outer").
#[derive(Debug, Clone, Default)]
pub struct FormatStack {
    stack: Vec<FormatMode>,
}

impl FormatStack {
    pub fn new() -> Self {
        FormatStack::default()
    }

    pub fn push(&mut self, mode: FormatMode) {
        self.stack.push(mode);
    }

    pub fn pop(&mut self) {
        self.stack.pop();
    }

    pub fn current(&self) -> FormatMode {
        self.stack.last().copied().unwrap_or(FormatMode::Identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nowhite_drops_all_whitespace() {
        assert_eq!(FormatMode::NoWhite.apply(" a b \n c "), "abc");
    }

    #[test]
    fn onespace_collapses_runs() {
        assert_eq!(FormatMode::OneSpace.apply("a   b\n\nc"), "a b c");
    }

    #[test]
    fn striplines_preserves_newlines() {
        assert_eq!(FormatMode::StripLines.apply("  a  \n  b  "), "a\nb");
    }

    #[test]
    fn joinlines_joins_nonblank_lines_with_space() {
        assert_eq!(FormatMode::JoinLines.apply("  a  \n\n  b  \n  c "), "a b c");
    }

    #[test]
    fn nowhitelines_drops_blank_lines_only() {
        assert_eq!(FormatMode::NoWhiteLines.apply("a\n   \nb"), "a\nb");
    }

    #[test]
    fn stack_restores_outer_mode_on_pop() {
        let mut stack = FormatStack::new();
        assert_eq!(stack.current(), FormatMode::Identity);
        stack.push(FormatMode::NoWhite);
        stack.push(FormatMode::OneSpace);
        assert_eq!(stack.current(), FormatMode::OneSpace);
        stack.pop();
        assert_eq!(stack.current(), FormatMode::NoWhite);
        stack.pop();
        assert_eq!(stack.current(), FormatMode::Identity);
    }
}
