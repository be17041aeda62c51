// ABOUTME: Lexer turning template source into tokens with whitespace control

use crate::error::ParseError;
use crate::token::{Span, Token};
use crate::Options;

/// Which delimiter opened the pending tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Marker {
    Variable,
    Block,
    Comment,
}

/// Tokenizes a template in one left-to-right pass.
///
/// The lexer alternates between two states: outside a tag it scans for the
/// next `{{` / `{%` / `{#` and emits the intervening text, inside a tag it
/// skips whitespace and emits literal/operator tokens until the matching
/// close delimiter at bracket depth zero.
pub fn tokenize(source: &str, options: &Options) -> Result<Vec<(Token, Span)>, ParseError> {
    let mut lexer = Lexer {
        rest: source,
        offset: 0,
        depth: 0,
        strip_leading: false,
        strip_newline: false,
        tokens: Vec::new(),
        options: *options,
    };
    lexer.run()?;
    Ok(lexer.tokens)
}

struct Lexer<'s> {
    rest: &'s str,
    offset: usize,
    /// bracket nesting inside the current tag, so a `}` closing an inner map
    /// literal is not mistaken for the tag close
    depth: usize,
    /// a `-%}`-style closer asked for all following whitespace to go
    strip_leading: bool,
    /// `trim_blocks` asked for the single newline after a block tag to go
    strip_newline: bool,
    tokens: Vec<(Token, Span)>,
    options: Options,
}

impl<'s> Lexer<'s> {
    fn advance(&mut self, n: usize) -> &'s str {
        let (skipped, rest) = self.rest.split_at(n);
        self.offset += n;
        self.rest = rest;
        skipped
    }

    fn push(&mut self, token: Token, span: Span) {
        self.tokens.push((token, span));
    }

    fn run(&mut self) -> Result<(), ParseError> {
        while !self.rest.is_empty() {
            match find_marker(self.rest) {
                Some((text_len, marker)) => {
                    let rest = self.rest;
                    let strip_prev = rest.as_bytes().get(text_len + 2) == Some(&b'-');
                    self.emit_text(&rest[..text_len], Some(marker), strip_prev);
                    self.advance(text_len);
                    let tag_start = self.offset;
                    match marker {
                        Marker::Comment => self.lex_comment(tag_start)?,
                        Marker::Variable | Marker::Block => {
                            self.advance(2);
                            if self.rest.starts_with('-') {
                                self.advance(1);
                            }
                            let token = if marker == Marker::Variable {
                                Token::VariableStart
                            } else {
                                Token::BlockStart
                            };
                            self.push(token, Span::new(tag_start, self.offset));
                            self.lex_tag(marker, tag_start)?;
                        }
                    }
                }
                None => {
                    let chunk = self.rest;
                    self.emit_text(chunk, None, false);
                    self.advance(chunk.len());
                }
            }
        }
        Ok(())
    }

    /// Emit a text chunk, applying whatever whitespace handling is pending
    /// from the previous tag and whatever the upcoming tag requests.
    fn emit_text(&mut self, chunk: &'s str, marker: Option<Marker>, strip_prev: bool) {
        let chunk_start = self.offset;
        let chunk_len = chunk.len();
        let mut text = chunk;

        // trailing-edge handling first, so lstrip still sees the original
        // line structure even when the leading edge is about to be trimmed
        if strip_prev {
            text = text.trim_end();
        } else if self.options.lstrip_blocks
            && matches!(marker, Some(Marker::Block) | Some(Marker::Comment))
        {
            text = lstrip_line(text, chunk_start == 0);
        }

        if self.strip_leading {
            text = text.trim_start();
        } else if self.strip_newline {
            if let Some(rest) = text.strip_prefix("\r\n").or_else(|| text.strip_prefix('\n')) {
                text = rest;
            }
        }
        self.strip_leading = false;
        self.strip_newline = false;

        if !text.is_empty() {
            self.push(
                Token::TemplateData(text.to_string()),
                Span::new(chunk_start, chunk_start + chunk_len),
            );
        }
    }

    fn lex_comment(&mut self, tag_start: usize) -> Result<(), ParseError> {
        match self.rest.find("#}") {
            Some(end) => {
                if self.rest.as_bytes().get(end.wrapping_sub(1)) == Some(&b'-') {
                    self.strip_leading = true;
                } else if self.options.trim_blocks {
                    self.strip_newline = true;
                }
                self.advance(end + 2);
                Ok(())
            }
            None => Err(ParseError::UnclosedComment { offset: tag_start }),
        }
    }

    fn lex_tag(&mut self, marker: Marker, tag_start: usize) -> Result<(), ParseError> {
        self.depth = 0;
        loop {
            let ws = self
                .rest
                .chars()
                .take_while(|c| c.is_whitespace())
                .map(|c| c.len_utf8())
                .sum::<usize>();
            if ws > 0 {
                self.advance(ws);
            }
            if self.rest.is_empty() {
                return Err(ParseError::UnclosedTag { offset: tag_start });
            }

            if self.depth == 0 {
                let (close, token) = if marker == Marker::Variable {
                    ("}}", Token::VariableEnd)
                } else {
                    ("%}", Token::BlockEnd)
                };
                let trimmed_close = self.rest.starts_with('-') && self.rest[1..].starts_with(close);
                if trimmed_close || self.rest.starts_with(close) {
                    let start = self.offset;
                    self.advance(close.len() + trimmed_close as usize);
                    self.push(token, Span::new(start, self.offset));
                    if trimmed_close {
                        self.strip_leading = true;
                    } else if marker == Marker::Block && self.options.trim_blocks {
                        self.strip_newline = true;
                    }
                    return Ok(());
                }
            }

            self.lex_tag_token()?;
        }
    }

    fn lex_tag_token(&mut self) -> Result<(), ParseError> {
        let start = self.offset;

        let two = match self.rest.as_bytes().get(..2) {
            Some(b"//") => Some(Token::FloorDiv),
            Some(b"**") => Some(Token::Pow),
            Some(b"==") => Some(Token::Eq),
            Some(b"!=") => Some(Token::Ne),
            Some(b">=") => Some(Token::Gte),
            Some(b"<=") => Some(Token::Lte),
            _ => None,
        };
        if let Some(token) = two {
            self.advance(2);
            self.push(token, Span::new(start, self.offset));
            return Ok(());
        }

        let Some(c) = self.rest.chars().next() else {
            return Err(ParseError::UnclosedTag { offset: start });
        };
        let one = match c {
            '+' => Some(Token::Plus),
            '-' => Some(Token::Minus),
            '*' => Some(Token::Mul),
            '/' => Some(Token::Div),
            '%' => Some(Token::Mod),
            '~' => Some(Token::Tilde),
            '|' => Some(Token::Pipe),
            '=' => Some(Token::Assign),
            '>' => Some(Token::Gt),
            '<' => Some(Token::Lt),
            '.' => Some(Token::Dot),
            ',' => Some(Token::Comma),
            ':' => Some(Token::Colon),
            '(' => {
                self.depth += 1;
                Some(Token::ParenOpen)
            }
            ')' => {
                self.depth = self.depth.saturating_sub(1);
                Some(Token::ParenClose)
            }
            '[' => {
                self.depth += 1;
                Some(Token::BracketOpen)
            }
            ']' => {
                self.depth = self.depth.saturating_sub(1);
                Some(Token::BracketClose)
            }
            '{' => {
                self.depth += 1;
                Some(Token::BraceOpen)
            }
            '}' => {
                self.depth = self.depth.saturating_sub(1);
                Some(Token::BraceClose)
            }
            _ => None,
        };
        if let Some(token) = one {
            self.advance(1);
            self.push(token, Span::new(start, self.offset));
            return Ok(());
        }

        if c == '\'' || c == '"' {
            return self.eat_string(c as u8);
        }
        if c.is_ascii_digit() {
            return self.eat_number();
        }
        if c.is_alphabetic() || c == '_' {
            return self.eat_identifier();
        }

        Err(ParseError::UnexpectedChar {
            ch: c,
            offset: start,
        })
    }

    fn eat_string(&mut self, delim: u8) -> Result<(), ParseError> {
        let start = self.offset;
        let bytes = self.rest.as_bytes();
        let mut i = 1;
        let mut has_escapes = false;
        while i < bytes.len() && bytes[i] != delim {
            if bytes[i] == b'\\' {
                has_escapes = true;
                i += 2;
            } else {
                i += 1;
            }
        }
        if i >= bytes.len() {
            return Err(ParseError::UnclosedString { offset: start });
        }
        let raw = &self.advance(i + 1)[1..i];
        let content = if has_escapes {
            unescape(raw)
        } else {
            raw.to_string()
        };
        self.push(Token::Str(content), Span::new(start, self.offset));
        Ok(())
    }

    fn eat_number(&mut self) -> Result<(), ParseError> {
        let start = self.offset;
        let bytes = self.rest.as_bytes();
        let mut len = bytes.iter().take_while(|b| b.is_ascii_digit()).count();
        let mut is_float = false;
        // a '.' only continues the number when a digit follows, so that
        // member access on an integer literal still lexes
        if bytes.get(len) == Some(&b'.')
            && bytes.get(len + 1).is_some_and(|b| b.is_ascii_digit())
        {
            is_float = true;
            len += 1;
            len += bytes[len..].iter().take_while(|b| b.is_ascii_digit()).count();
        }
        let raw = self.advance(len);
        let token = if is_float {
            Token::Float(
                raw.parse()
                    .map_err(|_| ParseError::MalformedNumber { offset: start })?,
            )
        } else if let Ok(int) = raw.parse() {
            Token::Int(int)
        } else {
            // past i64 range; fall back to a float literal
            Token::Float(
                raw.parse()
                    .map_err(|_| ParseError::MalformedNumber { offset: start })?,
            )
        };
        self.push(token, Span::new(start, self.offset));
        Ok(())
    }

    fn eat_identifier(&mut self) -> Result<(), ParseError> {
        let start = self.offset;
        let len = self
            .rest
            .chars()
            .take_while(|&c| c.is_alphanumeric() || c == '_')
            .map(|c| c.len_utf8())
            .sum::<usize>();
        let ident = self.advance(len);
        let token = match ident {
            "true" | "True" => Token::Bool(true),
            "false" | "False" => Token::Bool(false),
            "none" | "None" => Token::None,
            _ => Token::Ident(ident.to_string()),
        };
        self.push(token, Span::new(start, self.offset));
        Ok(())
    }
}

/// Find the next tag opener in `rest`: byte offset plus which delimiter.
fn find_marker(rest: &str) -> Option<(usize, Marker)> {
    let bytes = rest.as_bytes();
    let mut i = 0;
    while i + 1 < bytes.len() {
        if bytes[i] == b'{' {
            match bytes[i + 1] {
                b'{' => return Some((i, Marker::Variable)),
                b'%' => return Some((i, Marker::Block)),
                b'#' => return Some((i, Marker::Comment)),
                _ => {}
            }
        }
        i += 1;
    }
    None
}

/// For `lstrip_blocks`: drop spaces and tabs between the last newline and the
/// upcoming block tag. Whitespace before the tag on a line with content stays.
fn lstrip_line(text: &str, at_source_start: bool) -> &str {
    let is_inline_ws = |c: char| c == ' ' || c == '\t';
    match text.rfind('\n') {
        Some(pos) if text[pos + 1..].chars().all(is_inline_ws) => &text[..pos + 1],
        None if at_source_start && text.chars().all(is_inline_ws) => "",
        _ => text,
    }
}

/// Process string-literal escapes. Unknown escapes pass through verbatim.
fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('b') => out.push('\u{0008}'),
            Some('f') => out.push('\u{000C}'),
            Some('v') => out.push('\u{000B}'),
            Some('\\') => out.push('\\'),
            Some('\'') => out.push('\''),
            Some('"') => out.push('"'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex(source: &str) -> Vec<Token> {
        tokenize(source, &Options::default())
            .unwrap()
            .into_iter()
            .map(|(t, _)| t)
            .collect()
    }

    fn lex_with(source: &str, options: Options) -> Vec<Token> {
        tokenize(source, &options)
            .unwrap()
            .into_iter()
            .map(|(t, _)| t)
            .collect()
    }

    fn text_of(tokens: &[Token]) -> String {
        tokens
            .iter()
            .filter_map(|t| match t {
                Token::TemplateData(s) => Some(s.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_plain_text() {
        assert_eq!(
            lex("hello world"),
            vec![Token::TemplateData("hello world".into())]
        );
    }

    #[test]
    fn test_variable_tag() {
        assert_eq!(
            lex("Hello {{ name }}!"),
            vec![
                Token::TemplateData("Hello ".into()),
                Token::VariableStart,
                Token::Ident("name".into()),
                Token::VariableEnd,
                Token::TemplateData("!".into()),
            ]
        );
    }

    #[test]
    fn test_block_tag_and_keywords_stay_idents() {
        assert_eq!(
            lex("{% if x %}"),
            vec![
                Token::BlockStart,
                Token::Ident("if".into()),
                Token::Ident("x".into()),
                Token::BlockEnd,
            ]
        );
    }

    #[test]
    fn test_literals() {
        assert_eq!(
            lex("{{ 42 3.5 'hi' true False none None }}"),
            vec![
                Token::VariableStart,
                Token::Int(42),
                Token::Float(3.5),
                Token::Str("hi".into()),
                Token::Bool(true),
                Token::Bool(false),
                Token::None,
                Token::None,
                Token::VariableEnd,
            ]
        );
    }

    #[test]
    fn test_operators() {
        assert_eq!(
            lex("{{ a // b ** c != d <= e }}"),
            vec![
                Token::VariableStart,
                Token::Ident("a".into()),
                Token::FloorDiv,
                Token::Ident("b".into()),
                Token::Pow,
                Token::Ident("c".into()),
                Token::Ne,
                Token::Ident("d".into()),
                Token::Lte,
                Token::Ident("e".into()),
                Token::VariableEnd,
            ]
        );
    }

    #[test]
    fn test_nested_braces_do_not_close_the_tag() {
        let tokens = lex("{{ {'a': {'b': 1}} }}");
        assert_eq!(tokens.last(), Some(&Token::VariableEnd));
        let closes = tokens
            .iter()
            .filter(|t| matches!(t, Token::BraceClose))
            .count();
        assert_eq!(closes, 2);
    }

    #[test]
    fn test_dot_after_int_is_member_access() {
        assert_eq!(
            lex("{{ 1.x }}"),
            vec![
                Token::VariableStart,
                Token::Int(1),
                Token::Dot,
                Token::Ident("x".into()),
                Token::VariableEnd,
            ]
        );
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(
            lex(r#"{{ "a\nb\t\"c\"" }}"#),
            vec![
                Token::VariableStart,
                Token::Str("a\nb\t\"c\"".into()),
                Token::VariableEnd,
            ]
        );
        // unknown escapes pass through
        assert_eq!(
            lex(r"{{ 'a\qb' }}"),
            vec![
                Token::VariableStart,
                Token::Str("a\\qb".into()),
                Token::VariableEnd,
            ]
        );
    }

    #[test]
    fn test_comment_produces_nothing() {
        assert_eq!(
            lex("a{# anything {{ here }} #}b"),
            vec![
                Token::TemplateData("a".into()),
                Token::TemplateData("b".into()),
            ]
        );
    }

    #[test]
    fn test_strip_markers() {
        let tokens = lex("  {{- 'x' -}}  \n ");
        assert_eq!(
            tokens,
            vec![Token::VariableStart, Token::Str("x".into()), Token::VariableEnd]
        );
    }

    #[test]
    fn test_comment_strip_markers() {
        let tokens = lex("a \n {#- note -#} \n b");
        assert_eq!(text_of(&tokens), "ab");
    }

    #[test]
    fn test_trim_blocks_removes_newline_after_statement() {
        let options = Options {
            trim_blocks: true,
            ..Options::default()
        };
        let tokens = lex_with("{% set x = 1 %}\nrest", options);
        assert_eq!(text_of(&tokens), "rest");
    }

    #[test]
    fn test_lstrip_blocks_removes_indentation_before_statement() {
        let options = Options {
            lstrip_blocks: true,
            ..Options::default()
        };
        let tokens = lex_with("a\n    {% set x = 1 %}", options);
        assert_eq!(text_of(&tokens), "a\n");
    }

    #[test]
    fn test_lstrip_keeps_whitespace_after_content_on_same_line() {
        let options = Options {
            lstrip_blocks: true,
            ..Options::default()
        };
        let tokens = lex_with("a  {% set x = 1 %}", options);
        assert_eq!(text_of(&tokens), "a  ");
    }

    #[test]
    fn test_unclosed_constructs() {
        assert!(matches!(
            tokenize("{{ 'abc", &Options::default()),
            Err(ParseError::UnclosedString { offset: 3 })
        ));
        assert!(matches!(
            tokenize("{# abc", &Options::default()),
            Err(ParseError::UnclosedComment { offset: 0 })
        ));
        assert!(matches!(
            tokenize("{{ a + b", &Options::default()),
            Err(ParseError::UnclosedTag { .. })
        ));
    }

    #[test]
    fn test_unexpected_character() {
        assert!(matches!(
            tokenize("{{ a ? b }}", &Options::default()),
            Err(ParseError::UnexpectedChar { ch: '?', .. })
        ));
    }

    #[test]
    fn test_int_overflow_falls_back_to_float() {
        let tokens = lex("{{ 99999999999999999999 }}");
        assert!(matches!(tokens[1], Token::Float(_)));
    }
}
