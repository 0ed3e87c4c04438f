//! Balanced-region scanner for `@`-directive markup.
//!
//! This crate locates directive regions in template text for the skein
//! engine. It knows three shapes:
//!
//! - inline regions: `@(expr)` — [`find_balanced`]
//! - block directives: `@for(cond) { body }` — [`find_blocks`]
//! - conditional chains: `@if(c){..} @elseif(c){..} @else{..}` — [`find_chains`]
//! - attribute directives: `@on[click]="expr"` — [`find_attrs`]
//!
//! While matching a closing bracket the scanner skips brackets that appear
//! inside `'…'`, `"…"` and `` `…` `` literals (including `${…}` interpolation
//! nesting in backtick literals) and inside `//` line and `/* */` block
//! comments. Scanning is strictly left-to-right, first match wins, and the
//! scanner never fails: an unterminated region is discarded and scanning
//! resumes past its opener.
//!
//! Escaped directive markers are not this crate's concern beyond the
//! [`escape`] module: callers run [`escape::mask`] first, so no `@@` sequence
//! survives into the scanned text.
//!
//! # Example
//!
//! ```rust
//! use skein_scanner::find_balanced;
//!
//! let text = r#"Hello @(user.name)!"#;
//! let spans = find_balanced(text, "@(", ')');
//! assert_eq!(spans.len(), 1);
//! assert_eq!(spans[0].inner(text), "user.name");
//! ```

/// A located top-level region, as byte offsets into the scanned text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    /// Offset of the opener's first byte.
    pub start: usize,
    /// Offset one past the closing bracket.
    pub end: usize,
    /// Offset of the first byte inside the brackets.
    pub inner_start: usize,
    /// Offset one past the last byte inside the brackets.
    pub inner_end: usize,
}

impl Span {
    /// The text between the opener and its matching closer.
    pub fn inner<'a>(&self, text: &'a str) -> &'a str {
        &text[self.inner_start..self.inner_end]
    }

    /// The full matched region, opener and closer included.
    pub fn outer<'a>(&self, text: &'a str) -> &'a str {
        &text[self.start..self.end]
    }
}

/// A block directive: `keyword(condition) { body }`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// Offset of the keyword's first byte.
    pub start: usize,
    /// Offset one past the body's closing brace.
    pub end: usize,
    /// Text inside the condition parentheses.
    pub condition: String,
    /// Text inside the body braces.
    pub body: String,
}

/// One branch of a conditional chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Branch {
    /// Condition text; `None` for a trailing `@else`.
    pub condition: Option<String>,
    /// Body text inside the braces.
    pub body: String,
}

/// A full `@if` / `@elseif` / `@else` chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chain {
    /// Offset of the `@if` keyword.
    pub start: usize,
    /// Offset one past the last branch's closing brace.
    pub end: usize,
    /// Branches in source order; only the last may lack a condition.
    pub branches: Vec<Branch>,
}

/// An attribute directive occurrence: `prefix[key]="value"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttrMatch {
    /// Offset of the prefix's first byte.
    pub start: usize,
    /// Offset one past the closing quote.
    pub end: usize,
    /// Text inside the square brackets.
    pub key: String,
    /// Text inside the quotes.
    pub value: String,
}

/// Advances past a string literal or comment starting at `pos`, if any.
///
/// Returns the offset one past the skipped construct, or `None` when `pos`
/// does not start one. An unterminated literal or comment swallows the rest
/// of the input.
fn skip_noise(text: &str, pos: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    match bytes[pos] {
        b'\'' | b'"' => Some(skip_quoted(text, pos, bytes[pos] as char)),
        b'`' => Some(skip_backtick(text, pos)),
        b'/' if bytes.get(pos + 1) == Some(&b'/') => {
            Some(match text[pos..].find('\n') {
                Some(off) => pos + off + 1,
                None => text.len(),
            })
        }
        b'/' if bytes.get(pos + 1) == Some(&b'*') => {
            Some(match text[pos + 2..].find("*/") {
                Some(off) => pos + 2 + off + 2,
                None => text.len(),
            })
        }
        _ => None,
    }
}

/// Offset of the closing `quote` for a value starting at `from`, honoring
/// backslash escapes. `None` when the value never closes.
fn quoted_end(text: &str, from: usize, quote: char) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut i = from;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => {
                i += 1;
                if i < bytes.len() {
                    i += next_char_len(text, i);
                }
            }
            b if b == quote as u8 => return Some(i),
            _ => i += next_char_len(text, i),
        }
    }
    None
}

/// Skips a `'…'` or `"…"` literal, honoring backslash escapes.
fn skip_quoted(text: &str, pos: usize, quote: char) -> usize {
    match quoted_end(text, pos + 1, quote) {
        Some(end) => end + 1,
        None => text.len(),
    }
}

/// Skips a backtick literal, recursing into `${…}` interpolations so a
/// bracket inside one never leaks out as a closer.
fn skip_backtick(text: &str, pos: usize) -> usize {
    let bytes = text.as_bytes();
    let mut i = pos + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => {
                i += 1;
                if i < bytes.len() {
                    i += next_char_len(text, i);
                }
            }
            b'`' => return i + 1,
            b'$' if bytes.get(i + 1) == Some(&b'{') => {
                i = skip_balanced_braces(text, i + 1);
            }
            _ => i += next_char_len(text, i),
        }
    }
    text.len()
}

/// Skips from an opening `{` at `pos` past its matching `}`, applying the
/// same noise rules recursively.
fn skip_balanced_braces(text: &str, pos: usize) -> usize {
    let bytes = text.as_bytes();
    let mut i = pos + 1;
    let mut depth = 1usize;
    while i < bytes.len() {
        if let Some(next) = skip_noise(text, i) {
            i = next;
            continue;
        }
        match bytes[i] {
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return i + 1;
                }
            }
            _ => {}
        }
        i += next_char_len(text, i);
    }
    text.len()
}

/// Byte length of the char starting at `pos` (1 for ASCII).
fn next_char_len(text: &str, pos: usize) -> usize {
    text[pos..].chars().next().map_or(1, |c| c.len_utf8())
}

/// Scans from `from` (just past an open bracket) for the matching `closer`,
/// counting nested `open` brackets and skipping noise. Returns the closer's
/// offset, or `None` when the region is unterminated.
fn find_closer(text: &str, from: usize, open: char, closer: char) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut i = from;
    let mut depth = 1usize;
    while i < bytes.len() {
        if let Some(next) = skip_noise(text, i) {
            i = next;
            continue;
        }
        let c = bytes[i];
        if c == open as u8 && open != closer {
            depth += 1;
        } else if c == closer as u8 {
            depth -= 1;
            if depth == 0 {
                return Some(i);
            }
        }
        i += next_char_len(text, i);
    }
    None
}

/// Returns every top-level span between `opener` and its matching `closer`.
///
/// The opener's final character is taken as the nesting bracket, so
/// `find_balanced(text, "@(", ')')` counts `(` / `)` pairs while matching.
/// Brackets inside string literals and comments do not count. An
/// unterminated span is discarded and scanning resumes past its opener.
pub fn find_balanced(text: &str, opener: &str, closer: char) -> Vec<Span> {
    let open = opener.chars().last().unwrap_or('(');
    let mut spans = Vec::new();
    let mut pos = 0usize;
    while let Some(off) = text[pos..].find(opener) {
        let start = pos + off;
        let inner_start = start + opener.len();
        match find_closer(text, inner_start, open, closer) {
            Some(close) => {
                spans.push(Span {
                    start,
                    end: close + 1,
                    inner_start,
                    inner_end: close,
                });
                pos = close + 1;
            }
            None => {
                // Unterminated: drop it, resume past the opener.
                pos = inner_start;
            }
        }
    }
    spans
}

/// Parses `keyword(condition) { body }` starting exactly at `start`.
///
/// `start` must point at the keyword. Returns `None` when the shape does not
/// hold (no parenthesized condition, or no braced body follows it).
fn block_at(text: &str, start: usize, keyword: &str) -> Option<Block> {
    let mut i = start + keyword.len();
    i = skip_ws(text, i);
    if text.as_bytes().get(i) != Some(&b'(') {
        return None;
    }
    let cond_close = find_closer(text, i + 1, '(', ')')?;
    let condition = text[i + 1..cond_close].to_string();
    let mut j = skip_ws(text, cond_close + 1);
    if text.as_bytes().get(j) != Some(&b'{') {
        return None;
    }
    let body_close = find_closer(text, j + 1, '{', '}')?;
    let body = text[j + 1..body_close].to_string();
    j = body_close + 1;
    Some(Block {
        start,
        end: j,
        condition,
        body,
    })
}

/// Parses `keyword { body }` (no condition) starting exactly at `start`.
fn bare_block_at(text: &str, start: usize, keyword: &str) -> Option<(usize, String)> {
    let i = skip_ws(text, start + keyword.len());
    if text.as_bytes().get(i) != Some(&b'{') {
        return None;
    }
    let body_close = find_closer(text, i + 1, '{', '}')?;
    Some((body_close + 1, text[i + 1..body_close].to_string()))
}

fn skip_ws(text: &str, mut i: usize) -> usize {
    let bytes = text.as_bytes();
    while i < bytes.len() && bytes[i].is_ascii_whitespace() {
        i += 1;
    }
    i
}

/// True when the keyword occurrence at `start` is a whole token: the next
/// significant character opens its condition or body rather than extending
/// the word (`@for` must not match inside `@fortune`).
fn is_keyword_boundary(text: &str, start: usize, keyword: &str) -> bool {
    match text[start + keyword.len()..].chars().next() {
        Some(c) => !(c.is_alphanumeric() || c == '_'),
        None => true,
    }
}

/// Returns every `keyword(condition) { body }` block, left to right.
///
/// A keyword occurrence that is not followed by the full shape is skipped
/// and scanning resumes past it — never an error.
pub fn find_blocks(text: &str, keyword: &str) -> Vec<Block> {
    let mut blocks = Vec::new();
    let mut pos = 0usize;
    while let Some(off) = text[pos..].find(keyword) {
        let start = pos + off;
        if !is_keyword_boundary(text, start, keyword) {
            pos = start + keyword.len();
            continue;
        }
        match block_at(text, start, keyword) {
            Some(block) => {
                pos = block.end;
                blocks.push(block);
            }
            None => pos = start + keyword.len(),
        }
    }
    blocks
}

/// Returns every `@if` chain, stitching consecutive `@elseif` blocks and an
/// optional trailing `@else` under the same skipping rules.
pub fn find_chains(text: &str) -> Vec<Chain> {
    let mut chains = Vec::new();
    let mut pos = 0usize;
    while let Some(off) = text[pos..].find("@if") {
        let start = pos + off;
        if !is_keyword_boundary(text, start, "@if") {
            pos = start + "@if".len();
            continue;
        }
        let Some(head) = block_at(text, start, "@if") else {
            pos = start + "@if".len();
            continue;
        };
        let mut branches = vec![Branch {
            condition: Some(head.condition),
            body: head.body,
        }];
        let mut end = head.end;
        loop {
            let next = skip_ws(text, end);
            if text[next..].starts_with("@elseif") && is_keyword_boundary(text, next, "@elseif") {
                match block_at(text, next, "@elseif") {
                    Some(block) => {
                        branches.push(Branch {
                            condition: Some(block.condition),
                            body: block.body,
                        });
                        end = block.end;
                        continue;
                    }
                    None => break,
                }
            }
            if text[next..].starts_with("@else") && is_keyword_boundary(text, next, "@else") {
                if let Some((after, body)) = bare_block_at(text, next, "@else") {
                    branches.push(Branch {
                        condition: None,
                        body,
                    });
                    end = after;
                }
            }
            break;
        }
        chains.push(Chain {
            start,
            end,
            branches,
        });
        pos = end;
    }
    chains
}

/// Returns every `prefix[key]="value"` attribute directive, left to right.
///
/// The value may use single or double quotes; the key is the text between
/// the square brackets. A prefix occurrence without the full shape is
/// skipped.
pub fn find_attrs(text: &str, prefix: &str) -> Vec<AttrMatch> {
    let needle = format!("{prefix}[");
    let mut matches = Vec::new();
    let mut pos = 0usize;
    while let Some(off) = text[pos..].find(&needle) {
        let start = pos + off;
        let key_start = start + needle.len();
        let Some(key_close) = find_closer(text, key_start, '[', ']') else {
            pos = key_start;
            continue;
        };
        let mut i = key_close + 1;
        if text.as_bytes().get(i) != Some(&b'=') {
            pos = key_close + 1;
            continue;
        }
        i += 1;
        let quote = match text.as_bytes().get(i) {
            Some(&q @ (b'"' | b'\'')) => q as char,
            _ => {
                pos = i;
                continue;
            }
        };
        let value_start = i + 1;
        let Some(value_end) = quoted_end(text, value_start, quote) else {
            pos = value_start;
            continue;
        };
        matches.push(AttrMatch {
            start,
            end: value_end + 1,
            key: text[key_start..key_close].to_string(),
            value: text[value_start..value_end].to_string(),
        });
        pos = value_end + 1;
    }
    matches
}

pub mod escape {
    //! Escape handling for the `@@` marker.
    //!
    //! A doubled `@` escapes a literal `@` so it can never start a
    //! directive. [`mask`] replaces each `@@` with a reserved private-use
    //! sentinel before scanning; [`unmask`] restores each sentinel as a
    //! single `@` afterward — byte-exact minus one escape level.

    /// Private-use scalar standing in for an escaped `@` between phases.
    pub const SENTINEL: char = '\u{E000}';

    /// Replaces every `@@` with [`SENTINEL`].
    pub fn mask(text: &str) -> String {
        text.replace("@@", &SENTINEL.to_string())
    }

    /// Restores every [`SENTINEL`] as a literal `@`.
    pub fn unmask(text: &str) -> String {
        text.replace(SENTINEL, "@")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod balanced {
        use super::*;

        #[test]
        fn single_span() {
            let text = "Hello @(name)!";
            let spans = find_balanced(text, "@(", ')');
            assert_eq!(spans.len(), 1);
            assert_eq!(spans[0].inner(text), "name");
            assert_eq!(spans[0].outer(text), "@(name)");
        }

        #[test]
        fn multiple_spans_left_to_right() {
            let text = "@(a) and @(b)";
            let spans = find_balanced(text, "@(", ')');
            let inner: Vec<_> = spans.iter().map(|s| s.inner(text)).collect();
            assert_eq!(inner, vec!["a", "b"]);
        }

        #[test]
        fn nested_parens_balance() {
            let text = "@(f(g(x), y))";
            let spans = find_balanced(text, "@(", ')');
            assert_eq!(spans.len(), 1);
            assert_eq!(spans[0].inner(text), "f(g(x), y)");
        }

        #[test]
        fn closer_inside_single_quotes_skipped() {
            let text = "@(a + ')')";
            let spans = find_balanced(text, "@(", ')');
            assert_eq!(spans[0].inner(text), "a + ')'");
        }

        #[test]
        fn closer_inside_double_quotes_skipped() {
            let text = r#"@(a + ")")"#;
            let spans = find_balanced(text, "@(", ')');
            assert_eq!(spans[0].inner(text), r#"a + ")""#);
        }

        #[test]
        fn closer_inside_backtick_skipped() {
            let text = "@(`)` + a)";
            let spans = find_balanced(text, "@(", ')');
            assert_eq!(spans[0].inner(text), "`)` + a");
        }

        #[test]
        fn backtick_interpolation_nesting() {
            let text = "@(`${f(')')}` + a)";
            let spans = find_balanced(text, "@(", ')');
            assert_eq!(spans.len(), 1);
            assert_eq!(spans[0].inner(text), "`${f(')')}` + a");
        }

        #[test]
        fn closer_inside_line_comment_skipped() {
            let text = "@(a // )\n + b)";
            let spans = find_balanced(text, "@(", ')');
            assert_eq!(spans[0].inner(text), "a // )\n + b");
        }

        #[test]
        fn closer_inside_block_comment_skipped() {
            let text = "@(a /* ) */ + b)";
            let spans = find_balanced(text, "@(", ')');
            assert_eq!(spans[0].inner(text), "a /* ) */ + b");
        }

        #[test]
        fn unterminated_span_discarded() {
            let text = "before @(never closes";
            assert!(find_balanced(text, "@(", ')').is_empty());
        }

        #[test]
        fn unterminated_then_valid_resumes() {
            // The broken opener swallows nothing: scanning resumes past it
            // and still finds the later complete span.
            let text = "@(broken @(ok)";
            let spans = find_balanced(text, "@(", ')');
            assert_eq!(spans.len(), 1);
            assert_eq!(spans[0].inner(text), "ok");
        }

        #[test]
        fn escaped_quote_inside_string() {
            let text = r#"@('it\'s )fine')"#;
            let spans = find_balanced(text, "@(", ')');
            assert_eq!(spans.len(), 1);
        }

        #[test]
        fn empty_input() {
            assert!(find_balanced("", "@(", ')').is_empty());
        }
    }

    mod blocks {
        use super::*;

        #[test]
        fn simple_block() {
            let blocks = find_blocks("@for(x in xs) { <li>x</li> }", "@for");
            assert_eq!(blocks.len(), 1);
            assert_eq!(blocks[0].condition, "x in xs");
            assert_eq!(blocks[0].body, " <li>x</li> ");
        }

        #[test]
        fn no_whitespace_before_body() {
            let blocks = find_blocks("@for(x in xs){body}", "@for");
            assert_eq!(blocks[0].body, "body");
        }

        #[test]
        fn nested_braces_in_body() {
            let blocks = find_blocks("@for(x in xs) { a { b } c }", "@for");
            assert_eq!(blocks[0].body, " a { b } c ");
        }

        #[test]
        fn nested_directive_in_body_stays_in_body() {
            let text = "@for(x in xs) { @if(x) { inner } }";
            let blocks = find_blocks(text, "@for");
            assert_eq!(blocks.len(), 1);
            assert_eq!(blocks[0].body.trim(), "@if(x) { inner }");
        }

        #[test]
        fn keyword_without_parens_skipped() {
            assert!(find_blocks("@for ever and ever", "@for").is_empty());
        }

        #[test]
        fn keyword_without_body_skipped() {
            assert!(find_blocks("@for(x in xs) and nothing", "@for").is_empty());
        }

        #[test]
        fn longer_word_not_matched() {
            assert!(find_blocks("@fortune(x) { y }", "@for").is_empty());
        }

        #[test]
        fn brace_in_quoted_attr_skipped() {
            let text = r#"@for(x in xs) { <div class="}">x</div> }"#;
            let blocks = find_blocks(text, "@for");
            assert_eq!(blocks.len(), 1);
            assert_eq!(blocks[0].body, r#" <div class="}">x</div> "#);
        }

        #[test]
        fn consecutive_blocks() {
            let blocks = find_blocks("@for(a in x){1}@for(b in y){2}", "@for");
            assert_eq!(blocks.len(), 2);
            assert_eq!(blocks[1].condition, "b in y");
        }
    }

    mod chains {
        use super::*;

        #[test]
        fn lone_if() {
            let chains = find_chains("@if(a) { yes }");
            assert_eq!(chains.len(), 1);
            assert_eq!(chains[0].branches.len(), 1);
            assert_eq!(chains[0].branches[0].condition.as_deref(), Some("a"));
        }

        #[test]
        fn if_else() {
            let chains = find_chains("@if(a) { yes } @else { no }");
            assert_eq!(chains[0].branches.len(), 2);
            assert_eq!(chains[0].branches[1].condition, None);
            assert_eq!(chains[0].branches[1].body, " no ");
        }

        #[test]
        fn full_chain() {
            let chains = find_chains("@if(a){1}@elseif(b){2}@elseif(c){3}@else{4}");
            assert_eq!(chains.len(), 1);
            let conds: Vec<_> = chains[0]
                .branches
                .iter()
                .map(|b| b.condition.as_deref())
                .collect();
            assert_eq!(conds, vec![Some("a"), Some("b"), Some("c"), None]);
        }

        #[test]
        fn chain_span_covers_all_branches() {
            let text = "x @if(a){1}@else{2} y";
            let chains = find_chains(text);
            assert_eq!(&text[chains[0].start..chains[0].end], "@if(a){1}@else{2}");
        }

        #[test]
        fn separate_ifs_are_separate_chains() {
            let chains = find_chains("@if(a){1} text @if(b){2}");
            assert_eq!(chains.len(), 2);
        }

        #[test]
        fn elseif_not_stitched_across_text() {
            // Plain text between blocks breaks the chain; the orphan
            // `@elseif` is not part of it.
            let chains = find_chains("@if(a){1} gap @elseif(b){2}");
            assert_eq!(chains[0].branches.len(), 1);
        }

        #[test]
        fn nested_chain_inside_body_untouched() {
            let chains = find_chains("@if(a){ @if(b){x} }");
            assert_eq!(chains.len(), 1);
            assert_eq!(chains[0].branches[0].body.trim(), "@if(b){x}");
        }
    }

    mod attrs {
        use super::*;

        #[test]
        fn event_attr() {
            let found = find_attrs(r#"<button @on[click]="save()">x</button>"#, "@on");
            assert_eq!(found.len(), 1);
            assert_eq!(found[0].key, "click");
            assert_eq!(found[0].value, "save()");
        }

        #[test]
        fn ref_attr_single_quotes() {
            let found = find_attrs(r#"<div @[ref]='"panel"'>"#, "@");
            assert_eq!(found[0].key, "ref");
            assert_eq!(found[0].value, "\"panel\"");
        }

        #[test]
        fn incomplete_attr_skipped() {
            assert!(find_attrs("<div @on[click]>", "@on").is_empty());
            assert!(find_attrs("<div @on[click]=save>", "@on").is_empty());
        }

        #[test]
        fn multiple_attrs() {
            let found = find_attrs(r#"@on[a]="1" @on[b]="2""#, "@on");
            assert_eq!(found.len(), 2);
            assert_eq!(found[1].key, "b");
        }

        #[test]
        fn escaped_quote_inside_value() {
            let found = find_attrs(r#"<a @on[click]="f(\"x\")">"#, "@on");
            assert_eq!(found.len(), 1);
            assert_eq!(found[0].value, r#"f(\"x\")"#);
        }

        #[test]
        fn unterminated_value_skipped() {
            // The escape swallows what would have closed the value.
            assert!(find_attrs(r#"<a @on[click]="f(\""#, "@on").is_empty());
        }
    }

    mod escaping {
        use super::escape::{mask, unmask, SENTINEL};
        use super::*;

        #[test]
        fn mask_hides_escaped_marker() {
            let masked = mask("a @@ b");
            assert!(!masked.contains("@@"));
            assert!(masked.contains(SENTINEL));
        }

        #[test]
        fn unmask_restores_single_at() {
            assert_eq!(unmask(&mask("a @@ b")), "a @ b");
        }

        #[test]
        fn escaped_directive_never_scanned() {
            let masked = mask("@@(not a directive)");
            assert!(find_balanced(&masked, "@(", ')').is_empty());
        }

        #[test]
        fn real_directive_survives_masking() {
            let masked = mask("@@@(x)");
            let spans = find_balanced(&masked, "@(", ')');
            assert_eq!(spans.len(), 1);
        }

        #[test]
        fn text_without_escapes_unchanged() {
            assert_eq!(mask("plain @(x) text"), "plain @(x) text");
        }
    }
}
