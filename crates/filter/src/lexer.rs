// Holmes is an open source web search engine.
// Copyright (C) 2024 The Holmes Authors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::fmt::Display;

use logos::{Lexer, Logos};

use super::{Error, Result};

/// Comparison operators of the rule language. String comparisons carry a
/// case-insensitivity flag (a trailing `i` in the source).
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    ReMatch,
    ReNoMatch,
    PatMatch,
    PatNoMatch,
    InSet,
    NotInSet,
}

impl CmpOp {
    pub fn negated(self) -> Self {
        match self {
            CmpOp::Eq => CmpOp::Ne,
            CmpOp::Ne => CmpOp::Eq,
            CmpOp::Lt => CmpOp::Ge,
            CmpOp::Gt => CmpOp::Le,
            CmpOp::Le => CmpOp::Gt,
            CmpOp::Ge => CmpOp::Lt,
            CmpOp::ReMatch => CmpOp::ReNoMatch,
            CmpOp::ReNoMatch => CmpOp::ReMatch,
            CmpOp::PatMatch => CmpOp::PatNoMatch,
            CmpOp::PatNoMatch => CmpOp::PatMatch,
            CmpOp::InSet => CmpOp::NotInSet,
            CmpOp::NotInSet => CmpOp::InSet,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Lt => "<",
            CmpOp::Gt => ">",
            CmpOp::Le => "<=",
            CmpOp::Ge => ">=",
            CmpOp::ReMatch => "=~",
            CmpOp::ReNoMatch => "!~",
            CmpOp::PatMatch => "=*",
            CmpOp::PatNoMatch => "!*",
            CmpOp::InSet => "=#",
            CmpOp::NotInSet => "!#",
        }
    }
}

#[derive(Debug, PartialEq, Clone)]
pub enum Token<'a> {
    SemiColon,
    Colon,
    Comma,
    OpenBrace,
    CloseBrace,
    OpenParen,
    CloseParen,

    Int,
    StringType,
    RegexType,
    Local,
    Add,
    Delete,
    Log,
    DebugLog,
    Warning,
    ErrorLog,
    Accept,
    Reject,
    If,
    Else,
    Undef,
    Switch,
    Case,
    Defined,

    Assign,
    Cmp(CmpOp, bool),
    And,
    Or,
    Not,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Dot,
    DotDot,

    Ident(&'a str),
    Number(&'a str),
    String(String),
}

impl Display for Token<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::SemiColon => f.write_str(";"),
            Token::Colon => f.write_str(":"),
            Token::Comma => f.write_str(","),
            Token::OpenBrace => f.write_str("{"),
            Token::CloseBrace => f.write_str("}"),
            Token::OpenParen => f.write_str("("),
            Token::CloseParen => f.write_str(")"),
            Token::Int => f.write_str("int"),
            Token::StringType => f.write_str("string"),
            Token::RegexType => f.write_str("regex"),
            Token::Local => f.write_str("local"),
            Token::Add => f.write_str("add"),
            Token::Delete => f.write_str("delete"),
            Token::Log => f.write_str("log"),
            Token::DebugLog => f.write_str("debug"),
            Token::Warning => f.write_str("warning"),
            Token::ErrorLog => f.write_str("error"),
            Token::Accept => f.write_str("accept"),
            Token::Reject => f.write_str("reject"),
            Token::If => f.write_str("if"),
            Token::Else => f.write_str("else"),
            Token::Undef => f.write_str("undef"),
            Token::Switch => f.write_str("switch"),
            Token::Case => f.write_str("case"),
            Token::Defined => f.write_str("defined"),
            Token::Assign => f.write_str("="),
            Token::Cmp(op, icase) => {
                f.write_str(op.as_str())?;
                if *icase {
                    f.write_str("i")?;
                }
                Ok(())
            }
            Token::And => f.write_str("&&"),
            Token::Or => f.write_str("||"),
            Token::Not => f.write_str("!"),
            Token::Plus => f.write_str("+"),
            Token::Minus => f.write_str("-"),
            Token::Star => f.write_str("*"),
            Token::Slash => f.write_str("/"),
            Token::Percent => f.write_str("%"),
            Token::Dot => f.write_str("."),
            Token::DotDot => f.write_str(".."),
            Token::Ident(s) => f.write_str(s),
            Token::Number(n) => f.write_str(n),
            Token::String(s) => write!(f, "\"{s}\""),
        }
    }
}

#[derive(Logos, Debug, PartialEq, Clone)]
#[logos(skip r"[ \t\r\n\f]+")]
#[logos(skip r"#[^\n]*")]
enum Outer<'a> {
    Error,

    #[token("\"")]
    StartString,

    #[token(";")]
    SemiColon,
    #[token(":")]
    Colon,
    #[token(",")]
    Comma,
    #[token("{")]
    OpenBrace,
    #[token("}")]
    CloseBrace,
    #[token("(")]
    OpenParen,
    #[token(")")]
    CloseParen,

    #[token("int")]
    Int,
    #[token("string")]
    StringType,
    #[token("regex")]
    RegexType,
    #[token("local")]
    Local,
    #[token("add")]
    Add,
    #[token("delete")]
    Delete,
    #[token("log")]
    Log,
    #[token("debug")]
    DebugLog,
    #[token("warning")]
    Warning,
    #[token("error")]
    ErrorLog,
    #[token("accept")]
    Accept,
    #[token("reject")]
    Reject,
    #[token("if")]
    If,
    #[token("else")]
    Else,
    #[token("undef")]
    Undef,
    #[token("switch")]
    Switch,
    #[token("case")]
    Case,
    #[token("defined")]
    Defined,

    #[token("=")]
    Assign,
    #[token("==")]
    Eq,
    #[token("==i")]
    EqI,
    #[token("!=")]
    Ne,
    #[token("!=i")]
    NeI,
    #[token("<")]
    Lt,
    #[token("<i")]
    LtI,
    #[token(">")]
    Gt,
    #[token(">i")]
    GtI,
    #[token("<=")]
    Le,
    #[token("<=i")]
    LeI,
    #[token(">=")]
    Ge,
    #[token(">=i")]
    GeI,
    #[token("=~")]
    ReMatch,
    #[token("=~i")]
    ReMatchI,
    #[token("!~")]
    ReNoMatch,
    #[token("!~i")]
    ReNoMatchI,
    #[token("=*")]
    PatMatch,
    #[token("=*i")]
    PatMatchI,
    #[token("!*")]
    PatNoMatch,
    #[token("!*i")]
    PatNoMatchI,
    #[token("=#")]
    InSet,
    #[token("=#i")]
    InSetI,
    #[token("!#")]
    NotInSet,
    #[token("!#i")]
    NotInSetI,

    #[token("&&")]
    And,
    #[token("||")]
    Or,
    #[token("!")]
    Not,
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("%")]
    Percent,
    #[token(".")]
    Dot,
    #[token("..")]
    DotDot,

    #[regex(r"[a-zA-Z_][a-zA-Z0-9_]*", |lex| lex.slice())]
    Ident(&'a str),
    #[regex(r"[0-9]+", |lex| lex.slice())]
    Number(&'a str),
}

#[derive(Logos, Debug, PartialEq, Clone)]
enum QuotedString<'a> {
    #[regex(r#"[^\\"]+"#)]
    Text(&'a str),

    #[token(r#"\""#)]
    EscapedQuote,
    #[token(r"\\")]
    EscapedBackslash,
    #[token(r"\n")]
    EscapedNewline,
    #[token(r"\t")]
    EscapedTab,

    #[token("\"")]
    EndString,
}

pub struct LexerBridge<'source> {
    lexer: Lexer<'source, Outer<'source>>,
}

impl<'source> LexerBridge<'source> {
    pub fn new(source: &'source str) -> Self {
        Self {
            lexer: Outer::lexer(source),
        }
    }

    fn lex_next(&mut self) -> Option<Outer<'source>> {
        Some(self.lexer.next()?.unwrap_or(Outer::Error))
    }
}

impl<'source> Iterator for LexerBridge<'source> {
    type Item = Result<(usize, Token<'source>, usize)>;

    fn next(&mut self) -> Option<Self::Item> {
        let tok = self.lex_next();

        // Read string contents in a separate lexer mode, as the outer
        // token set would mis-tokenize them.
        if let Some(Outer::StartString) = &tok {
            let mut inner: Lexer<QuotedString> = self.lexer.clone().morph();
            let start = inner.span().start + 1;

            let mut res = String::new();
            let mut closed = false;
            for tok in inner.by_ref() {
                match tok {
                    Err(()) => {
                        return Some(Err(Error::UnexpectedEof {
                            expected: vec!["\"".to_string()],
                        }))
                    }
                    Ok(QuotedString::Text(t)) => res.push_str(t),
                    Ok(QuotedString::EscapedQuote) => res.push('"'),
                    Ok(QuotedString::EscapedBackslash) => res.push('\\'),
                    Ok(QuotedString::EscapedNewline) => res.push('\n'),
                    Ok(QuotedString::EscapedTab) => res.push('\t'),
                    Ok(QuotedString::EndString) => {
                        closed = true;
                        break;
                    }
                }
            }

            if !closed {
                return Some(Err(Error::UnexpectedEof {
                    expected: vec!["\"".to_string()],
                }));
            }

            let end = inner.span().end - 1;
            self.lexer = inner.morph();

            return Some(Ok((start, Token::String(res), end)));
        }

        let tok = tok?;
        let s = self.lexer.span();

        let mapped = match tok {
            Outer::Error => {
                let tok = self.lexer.slice().to_string();
                return Some(Err(Error::UnrecognizedToken {
                    token: (s.start, tok, s.end),
                }));
            }
            Outer::StartString => unreachable!("handled above"),
            Outer::SemiColon => Token::SemiColon,
            Outer::Colon => Token::Colon,
            Outer::Comma => Token::Comma,
            Outer::OpenBrace => Token::OpenBrace,
            Outer::CloseBrace => Token::CloseBrace,
            Outer::OpenParen => Token::OpenParen,
            Outer::CloseParen => Token::CloseParen,
            Outer::Int => Token::Int,
            Outer::StringType => Token::StringType,
            Outer::RegexType => Token::RegexType,
            Outer::Local => Token::Local,
            Outer::Add => Token::Add,
            Outer::Delete => Token::Delete,
            Outer::Log => Token::Log,
            Outer::DebugLog => Token::DebugLog,
            Outer::Warning => Token::Warning,
            Outer::ErrorLog => Token::ErrorLog,
            Outer::Accept => Token::Accept,
            Outer::Reject => Token::Reject,
            Outer::If => Token::If,
            Outer::Else => Token::Else,
            Outer::Undef => Token::Undef,
            Outer::Switch => Token::Switch,
            Outer::Case => Token::Case,
            Outer::Defined => Token::Defined,
            Outer::Assign => Token::Assign,
            Outer::Eq => Token::Cmp(CmpOp::Eq, false),
            Outer::EqI => Token::Cmp(CmpOp::Eq, true),
            Outer::Ne => Token::Cmp(CmpOp::Ne, false),
            Outer::NeI => Token::Cmp(CmpOp::Ne, true),
            Outer::Lt => Token::Cmp(CmpOp::Lt, false),
            Outer::LtI => Token::Cmp(CmpOp::Lt, true),
            Outer::Gt => Token::Cmp(CmpOp::Gt, false),
            Outer::GtI => Token::Cmp(CmpOp::Gt, true),
            Outer::Le => Token::Cmp(CmpOp::Le, false),
            Outer::LeI => Token::Cmp(CmpOp::Le, true),
            Outer::Ge => Token::Cmp(CmpOp::Ge, false),
            Outer::GeI => Token::Cmp(CmpOp::Ge, true),
            Outer::ReMatch => Token::Cmp(CmpOp::ReMatch, false),
            Outer::ReMatchI => Token::Cmp(CmpOp::ReMatch, true),
            Outer::ReNoMatch => Token::Cmp(CmpOp::ReNoMatch, false),
            Outer::ReNoMatchI => Token::Cmp(CmpOp::ReNoMatch, true),
            Outer::PatMatch => Token::Cmp(CmpOp::PatMatch, false),
            Outer::PatMatchI => Token::Cmp(CmpOp::PatMatch, true),
            Outer::PatNoMatch => Token::Cmp(CmpOp::PatNoMatch, false),
            Outer::PatNoMatchI => Token::Cmp(CmpOp::PatNoMatch, true),
            Outer::InSet => Token::Cmp(CmpOp::InSet, false),
            Outer::InSetI => Token::Cmp(CmpOp::InSet, true),
            Outer::NotInSet => Token::Cmp(CmpOp::NotInSet, false),
            Outer::NotInSetI => Token::Cmp(CmpOp::NotInSet, true),
            Outer::And => Token::And,
            Outer::Or => Token::Or,
            Outer::Not => Token::Not,
            Outer::Plus => Token::Plus,
            Outer::Minus => Token::Minus,
            Outer::Star => Token::Star,
            Outer::Slash => Token::Slash,
            Outer::Percent => Token::Percent,
            Outer::Dot => Token::Dot,
            Outer::DotDot => Token::DotDot,
            Outer::Ident(s) => Token::Ident(s),
            Outer::Number(n) => Token::Number(n),
        };

        Some(Ok((s.start, mapped, s.end)))
    }
}

pub fn lex(source: &str) -> impl Iterator<Item = Result<(usize, Token<'_>, usize)>> {
    LexerBridge::new(source)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(s: &str) -> Vec<Token<'_>> {
        lex(s).map(|r| r.unwrap()).map(|(_, t, _)| t).collect()
    }

    #[test]
    fn operators() {
        assert_eq!(
            toks("url =~ \"^http:\" && x >=i 3"),
            vec![
                Token::Ident("url"),
                Token::Cmp(CmpOp::ReMatch, false),
                Token::String("^http:".to_string()),
                Token::And,
                Token::Ident("x"),
                Token::Cmp(CmpOp::Ge, true),
                Token::Number("3"),
            ]
        );
    }

    #[test]
    fn comments_skipped() {
        assert_eq!(
            toks("accept; # trailing words == ignored\nreject;"),
            vec![
                Token::Accept,
                Token::SemiColon,
                Token::Reject,
                Token::SemiColon,
            ]
        );
    }

    #[test]
    fn string_escapes() {
        assert_eq!(
            toks(r#""a\"b\\c""#),
            vec![Token::String("a\"b\\c".to_string())]
        );
    }

    #[test]
    fn intervals() {
        assert_eq!(
            toks("case =# 10 .. 20:"),
            vec![
                Token::Case,
                Token::Cmp(CmpOp::InSet, false),
                Token::Number("10"),
                Token::DotDot,
                Token::Number("20"),
                Token::Colon,
            ]
        );
    }

    #[test]
    fn unterminated_string() {
        let mut it = lex("\"abc");
        assert!(matches!(it.next(), Some(Err(Error::UnexpectedEof { .. }))));
    }
}
