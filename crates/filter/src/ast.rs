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

//! Typed command tree of the rule language and the recursive-descent parser
//! producing it. Every parse routine returns `Result`; there is no panic path
//! out of a malformed program.

use crate::lexer::{lex, CmpOp, Token};
use crate::{Bindings, Error, Result, VarCat};

#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum VType {
    Int,
    Str,
    Regex,
}

impl VType {
    pub fn as_str(self) -> &'static str {
        match self {
            VType::Int => "int",
            VType::Str => "string",
            VType::Regex => "regex",
        }
    }
}

/// Precompiled entry of the lookup pool. Regexes and wildcard patterns are
/// compiled once at parse time and shared by all interpreters of the program.
#[derive(Debug)]
pub enum Lookup {
    Regex {
        source: String,
        icase: bool,
        re: regex::Regex,
    },
    Pattern {
        source: String,
        icase: bool,
        pat: Pattern,
    },
}

/// A `prefix*mid*suffix` wildcard pattern. `?` matches a single character.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    parts: Vec<PatternPart>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PatternPart {
    Raw(String),
    AnyRun,
    AnyOne,
}

impl Pattern {
    pub fn compile(source: &str) -> Self {
        let mut parts = Vec::new();
        let mut raw = String::new();

        for c in source.chars() {
            match c {
                '*' => {
                    if !raw.is_empty() {
                        parts.push(PatternPart::Raw(std::mem::take(&mut raw)));
                    }
                    if parts.last() != Some(&PatternPart::AnyRun) {
                        parts.push(PatternPart::AnyRun);
                    }
                }
                '?' => {
                    if !raw.is_empty() {
                        parts.push(PatternPart::Raw(std::mem::take(&mut raw)));
                    }
                    parts.push(PatternPart::AnyOne);
                }
                _ => raw.push(c),
            }
        }

        if !raw.is_empty() {
            parts.push(PatternPart::Raw(raw));
        }

        Self { parts }
    }

    /// True iff the pattern is `*literal*`, i.e. a pure substring test.
    pub fn as_substring(&self) -> Option<&str> {
        match self.parts.as_slice() {
            [PatternPart::AnyRun, PatternPart::Raw(s), PatternPart::AnyRun] => Some(s),
            _ => None,
        }
    }

    /// Splits a `prefix*suffix` pattern into its two literal halves.
    pub fn as_prefix_suffix(&self) -> Option<(&str, &str)> {
        match self.parts.as_slice() {
            [PatternPart::Raw(p), PatternPart::AnyRun, PatternPart::Raw(s)] => {
                Some((p.as_str(), s.as_str()))
            }
            [PatternPart::Raw(p), PatternPart::AnyRun] => Some((p.as_str(), "")),
            [PatternPart::AnyRun, PatternPart::Raw(s)] => Some(("", s.as_str())),
            [PatternPart::AnyRun] => Some(("", "")),
            _ => None,
        }
    }

    pub fn matches(&self, s: &str) -> bool {
        fn rec(parts: &[PatternPart], s: &str) -> bool {
            match parts.split_first() {
                None => s.is_empty(),
                Some((PatternPart::Raw(r), rest)) => {
                    s.strip_prefix(r.as_str()).is_some_and(|s| rec(rest, s))
                }
                Some((PatternPart::AnyOne, rest)) => {
                    let mut it = s.chars();
                    it.next().is_some() && rec(rest, it.as_str())
                }
                Some((PatternPart::AnyRun, rest)) => {
                    if rest.is_empty() {
                        return true;
                    }
                    let mut tail = s;
                    loop {
                        if rec(rest, tail) {
                            return true;
                        }
                        let mut it = tail.chars();
                        if it.next().is_none() {
                            return false;
                        }
                        tail = it.as_str();
                    }
                }
            }
        }

        rec(&self.parts, s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LvSlot {
    Raw(usize),
    Attr,
    Conf,
    User(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lvalue {
    pub name: String,
    pub vtype: VType,
    pub ro: bool,
    pub slot: LvSlot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Cat,
}

impl BinOp {
    pub fn as_str(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
            BinOp::Cat => ".",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    IntConst(i64),
    StrConst(String),
    /// Undefined result of a statically folded operation; carries the type
    /// the expression would otherwise have.
    UndefConst(VType),
    Lvalue(Lvalue),
    Neg(Box<Expr>),
    Bin {
        op: BinOp,
        l: Box<Expr>,
        r: Box<Expr>,
    },
}

impl Expr {
    pub fn vtype(&self) -> VType {
        match self {
            Expr::IntConst(_) => VType::Int,
            Expr::StrConst(_) => VType::Str,
            Expr::UndefConst(t) => *t,
            Expr::Lvalue(lv) => lv.vtype,
            Expr::Neg(_) => VType::Int,
            Expr::Bin { op, .. } => match op {
                BinOp::Cat => VType::Str,
                _ => VType::Int,
            },
        }
    }

    pub fn is_const(&self) -> bool {
        matches!(
            self,
            Expr::IntConst(_) | Expr::StrConst(_) | Expr::UndefConst(_)
        )
    }
}

/// Right-hand side of a comparison. Regex and pattern operands live in the
/// lookup pool; intervals keep both bounds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CmpRhs {
    Expr(Expr),
    Interval(Expr, Expr),
    Lookup(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cond {
    Const(bool),
    /// Undefined constant condition, the result of folding over undef.
    ConstUndef,
    Cmp {
        op: CmpOp,
        icase: bool,
        l: Expr,
        r: CmpRhs,
    },
    Defined(Expr),
    Not(Box<Cond>),
    And(Box<Cond>, Box<Cond>),
    Or(Box<Cond>, Box<Cond>),
    /// Three-valued equality of two conditions.
    CondEq {
        neg: bool,
        l: Box<Cond>,
        r: Box<Cond>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Log,
    Debug,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Log => "log",
            LogLevel::Debug => "debug",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasePattern {
    Int(i64),
    Str(String),
    IntInterval(i64, i64),
    StrInterval(String, String),
    Lookup(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Case {
    pub case_id: u32,
    pub op: CmpOp,
    pub icase: bool,
    pub pat: CasePattern,
    pub body: Vec<Cmd>,
}

#[derive(Debug)]
pub struct Switch {
    pub expr: Expr,
    pub cases: Vec<Case>,
    pub negative: Vec<Cmd>,
    pub undefined: Vec<Cmd>,
    pub accel: Option<crate::accel::Tables>,
}

impl PartialEq for Switch {
    fn eq(&self, other: &Self) -> bool {
        // Accelerators are derived data; equality is structural.
        self.expr == other.expr
            && self.cases == other.cases
            && self.negative == other.negative
            && self.undefined == other.undefined
    }
}

impl Clone for Switch {
    fn clone(&self) -> Self {
        // Accelerators are rebuilt after structural changes; they are
        // derived data and carry no semantics of their own.
        Self {
            expr: self.expr.clone(),
            cases: self.cases.clone(),
            negative: self.negative.clone(),
            undefined: self.undefined.clone(),
            accel: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Cmd {
    Log {
        level: LogLevel,
        expr: Expr,
    },
    Accept {
        msg: Option<Expr>,
    },
    Reject {
        msg: Option<Expr>,
    },
    Set {
        lv: Lvalue,
        expr: Expr,
    },
    /// `add lv = expr;` — appends a value to a multi-valued attribute.
    Attach {
        lv: Lvalue,
        expr: Expr,
    },
    /// `delete lv;`
    Unset {
        lv: Lvalue,
    },
    If {
        cond: Cond,
        positive: Vec<Cmd>,
        negative: Vec<Cmd>,
        undefined: Vec<Cmd>,
    },
    Switch(Box<Switch>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decl {
    pub name: String,
    pub vtype: VType,
    pub local: bool,
    pub slot: usize,
}

/// Parse output before pruning and accelerator construction.
#[derive(Debug)]
pub struct RawProgram {
    pub decls: Vec<Decl>,
    pub body: Vec<Cmd>,
    pub pool: Vec<Lookup>,
    pub cases: u32,
}

pub fn parse(source: &str, bindings: &Bindings) -> Result<RawProgram> {
    let mut toks = Vec::new();
    for tok in lex(source) {
        toks.push(tok?);
    }

    let mut parser = Parser {
        toks,
        pos: 0,
        bindings,
        decls: Vec::new(),
        pool: Vec::new(),
        case_counter: 0,
    };

    let body = parser.program()?;

    Ok(RawProgram {
        decls: parser.decls,
        body,
        pool: parser.pool,
        cases: parser.case_counter,
    })
}

struct Parser<'s, 'b> {
    toks: Vec<(usize, Token<'s>, usize)>,
    pos: usize,
    bindings: &'b Bindings,
    decls: Vec<Decl>,
    pool: Vec<Lookup>,
    case_counter: u32,
}

impl<'s> Parser<'s, '_> {
    fn peek(&self) -> Option<&Token<'s>> {
        self.toks.get(self.pos).map(|(_, t, _)| t)
    }

    fn advance(&mut self) -> Option<Token<'s>> {
        let tok = self.toks.get(self.pos).map(|(_, t, _)| t.clone());
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn unexpected(&self, expected: &[&str]) -> Error {
        let expected = expected.iter().map(|s| s.to_string()).collect();
        match self.toks.get(self.pos) {
            Some((start, tok, end)) => Error::UnexpectedToken {
                token: (*start, tok.to_string(), *end),
                expected,
            },
            None => Error::UnexpectedEof { expected },
        }
    }

    fn expect(&mut self, tok: &Token) -> Result<()> {
        if self.peek() == Some(tok) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.unexpected(&[&tok.to_string()]))
        }
    }

    fn eat(&mut self, tok: &Token) -> bool {
        if self.peek() == Some(tok) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn program(&mut self) -> Result<Vec<Cmd>> {
        let mut cmds = Vec::new();
        while self.peek().is_some() {
            if let Some(cmd) = self.decl_or_cmd()? {
                cmds.push(cmd);
            }
        }
        Ok(cmds)
    }

    fn decl_or_cmd(&mut self) -> Result<Option<Cmd>> {
        let local = self.eat(&Token::Local);
        let vtype = match self.peek() {
            Some(Token::Int) => Some(VType::Int),
            Some(Token::StringType) => Some(VType::Str),
            Some(Token::RegexType) => Some(VType::Regex),
            _ => None,
        };

        if let Some(vtype) = vtype {
            self.pos += 1;
            let name = self.ident()?;
            self.declare(name, vtype, local)?;
            self.expect(&Token::SemiColon)?;
            return Ok(None);
        }

        if local {
            return Err(self.unexpected(&["int", "string", "regex"]));
        }

        self.cmd().map(Some)
    }

    fn declare(&mut self, name: String, vtype: VType, local: bool) -> Result<()> {
        if self.decls.iter().any(|d| d.name == name) || self.bindings.find(&name).is_some() {
            return Err(Error::Redeclared { name });
        }
        let slot = self.decls.len();
        self.decls.push(Decl {
            name,
            vtype,
            local,
            slot,
        });
        Ok(())
    }

    fn ident(&mut self) -> Result<String> {
        match self.peek() {
            Some(Token::Ident(s)) => {
                let s = s.to_string();
                self.pos += 1;
                Ok(s)
            }
            _ => Err(self.unexpected(&["identifier"])),
        }
    }

    fn lookup_lvalue(&self, name: &str) -> Result<Lvalue> {
        if let Some(decl) = self.decls.iter().find(|d| d.name == name) {
            return Ok(Lvalue {
                name: decl.name.clone(),
                vtype: decl.vtype,
                ro: false,
                slot: LvSlot::User(decl.slot),
            });
        }

        if let Some(var) = self.bindings.find(name) {
            let slot = match var.cat {
                VarCat::Raw(slot) => LvSlot::Raw(slot),
                VarCat::Attr => LvSlot::Attr,
                VarCat::Conf => LvSlot::Conf,
            };
            return Ok(Lvalue {
                name: var.name.clone(),
                vtype: var.vtype,
                ro: var.ro,
                slot,
            });
        }

        Err(Error::UnknownVariable {
            name: name.to_string(),
        })
    }

    fn cmd(&mut self) -> Result<Cmd> {
        match self.peek() {
            Some(Token::Log) | Some(Token::DebugLog) | Some(Token::Warning)
            | Some(Token::ErrorLog) => {
                let level = match self.advance().unwrap() {
                    Token::Log => LogLevel::Log,
                    Token::DebugLog => LogLevel::Debug,
                    Token::Warning => LogLevel::Warning,
                    Token::ErrorLog => LogLevel::Error,
                    _ => unreachable!(),
                };
                let expr = self.expr()?;
                self.expect(&Token::SemiColon)?;
                Ok(Cmd::Log { level, expr })
            }
            Some(Token::Accept) | Some(Token::Reject) => {
                let accept = matches!(self.advance().unwrap(), Token::Accept);
                let msg = if self.eat(&Token::SemiColon) {
                    None
                } else {
                    let expr = self.expr()?;
                    self.expect(&Token::SemiColon)?;
                    Some(expr)
                };
                Ok(if accept {
                    Cmd::Accept { msg }
                } else {
                    Cmd::Reject { msg }
                })
            }
            Some(Token::Add) => {
                self.pos += 1;
                let name = self.ident()?;
                let lv = self.lookup_lvalue(&name)?;
                if lv.slot != LvSlot::Attr {
                    return Err(Error::Type {
                        message: format!("add requires an attribute variable, {name} is not one"),
                    });
                }
                self.expect(&Token::Assign)?;
                let expr = self.expr()?;
                self.check_assign(&lv, &expr)?;
                self.expect(&Token::SemiColon)?;
                Ok(Cmd::Attach { lv, expr })
            }
            Some(Token::Delete) => {
                self.pos += 1;
                let name = self.ident()?;
                let lv = self.lookup_lvalue(&name)?;
                self.check_writable(&lv)?;
                self.expect(&Token::SemiColon)?;
                Ok(Cmd::Unset { lv })
            }
            Some(Token::If) => self.if_cmd(),
            Some(Token::Switch) => self.switch_cmd(),
            Some(Token::Ident(_)) => {
                let name = self.ident()?;
                let lv = self.lookup_lvalue(&name)?;
                self.check_writable(&lv)?;
                self.expect(&Token::Assign)?;
                let expr = self.expr()?;
                self.check_assign(&lv, &expr)?;
                self.expect(&Token::SemiColon)?;
                Ok(Cmd::Set { lv, expr })
            }
            _ => Err(self.unexpected(&[
                "log", "accept", "reject", "add", "delete", "if", "switch", "identifier",
            ])),
        }
    }

    fn check_writable(&self, lv: &Lvalue) -> Result<()> {
        if lv.ro {
            Err(Error::ReadOnly {
                name: lv.name.clone(),
            })
        } else {
            Ok(())
        }
    }

    fn check_assign(&self, lv: &Lvalue, expr: &Expr) -> Result<()> {
        self.check_writable(lv)?;
        if lv.vtype != expr.vtype() {
            return Err(Error::Type {
                message: format!(
                    "cannot assign {} to {} variable {}",
                    expr.vtype().as_str(),
                    lv.vtype.as_str(),
                    lv.name
                ),
            });
        }
        Ok(())
    }

    fn block(&mut self) -> Result<Vec<Cmd>> {
        self.expect(&Token::OpenBrace)?;
        let mut cmds = Vec::new();
        while self.peek() != Some(&Token::CloseBrace) {
            if self.peek().is_none() {
                return Err(self.unexpected(&["}"]));
            }
            if let Some(cmd) = self.decl_or_cmd()? {
                cmds.push(cmd);
            }
        }
        self.pos += 1;
        Ok(cmds)
    }

    fn if_cmd(&mut self) -> Result<Cmd> {
        self.expect(&Token::If)?;
        let cond = self.cond()?;
        let positive = self.block()?;

        let negative = if self.eat(&Token::Else) {
            if self.peek() == Some(&Token::If) {
                vec![self.if_cmd()?]
            } else {
                self.block()?
            }
        } else {
            Vec::new()
        };

        let undefined = if self.eat(&Token::Undef) {
            self.block()?
        } else {
            Vec::new()
        };

        Ok(Cmd::If {
            cond,
            positive,
            negative,
            undefined,
        })
    }

    fn switch_cmd(&mut self) -> Result<Cmd> {
        self.expect(&Token::Switch)?;
        let expr = self.expr()?;
        self.expect(&Token::OpenBrace)?;

        let mut cases = Vec::new();
        let mut negative = Vec::new();
        let mut undefined = Vec::new();

        loop {
            match self.peek() {
                Some(Token::Case) => {
                    self.pos += 1;
                    cases.push(self.case(expr.vtype())?);
                }
                Some(Token::Else) => {
                    self.pos += 1;
                    negative = self.block()?;
                }
                Some(Token::Undef) => {
                    self.pos += 1;
                    undefined = self.block()?;
                }
                Some(Token::CloseBrace) => {
                    self.pos += 1;
                    break;
                }
                _ => return Err(self.unexpected(&["case", "else", "undef", "}"])),
            }
        }

        Ok(Cmd::Switch(Box::new(Switch {
            expr,
            cases,
            negative,
            undefined,
            accel: None,
        })))
    }

    fn case(&mut self, scrutinee: VType) -> Result<Case> {
        let (op, icase) = match self.peek() {
            Some(Token::Cmp(op, icase)) => {
                let (op, icase) = (*op, *icase);
                self.pos += 1;
                (op, icase)
            }
            _ => (CmpOp::Eq, false),
        };

        let pat = match (op, self.peek().cloned()) {
            (CmpOp::ReMatch | CmpOp::ReNoMatch, Some(Token::String(s))) => {
                self.pos += 1;
                CasePattern::Lookup(self.pool_regex(&s, icase)?)
            }
            (CmpOp::PatMatch | CmpOp::PatNoMatch, Some(Token::String(s))) => {
                self.pos += 1;
                CasePattern::Lookup(self.pool_pattern(&s, icase))
            }
            (CmpOp::InSet | CmpOp::NotInSet, _) => {
                let lo = self.case_literal(scrutinee)?;
                self.expect(&Token::DotDot)?;
                let hi = self.case_literal(scrutinee)?;
                match (lo, hi) {
                    (CasePattern::Int(lo), CasePattern::Int(hi)) => {
                        CasePattern::IntInterval(lo, hi)
                    }
                    (CasePattern::Str(lo), CasePattern::Str(hi)) => {
                        CasePattern::StrInterval(lo, hi)
                    }
                    _ => {
                        return Err(Error::Type {
                            message: "interval bounds must have matching types".to_string(),
                        })
                    }
                }
            }
            _ => {
                let lit = self.case_literal(scrutinee)?;
                let lit_type = match &lit {
                    CasePattern::Int(_) => VType::Int,
                    CasePattern::Str(_) => VType::Str,
                    _ => unreachable!(),
                };
                if lit_type != scrutinee {
                    return Err(Error::Type {
                        message: format!(
                            "case literal type {} does not match switch type {}",
                            lit_type.as_str(),
                            scrutinee.as_str()
                        ),
                    });
                }
                lit
            }
        };

        self.expect(&Token::Colon)?;

        let mut body = Vec::new();
        while !matches!(
            self.peek(),
            Some(Token::Case) | Some(Token::Else) | Some(Token::Undef)
                | Some(Token::CloseBrace) | None
        ) {
            if let Some(cmd) = self.decl_or_cmd()? {
                body.push(cmd);
            }
        }

        let case_id = self.case_counter;
        self.case_counter += 1;

        Ok(Case {
            case_id,
            op,
            icase,
            pat,
            body,
        })
    }

    fn case_literal(&mut self, _scrutinee: VType) -> Result<CasePattern> {
        match self.advance() {
            Some(Token::Number(n)) => Ok(CasePattern::Int(self.parse_number(n)?)),
            Some(Token::Minus) => match self.advance() {
                Some(Token::Number(n)) => Ok(CasePattern::Int(-self.parse_number(n)?)),
                _ => Err(self.unexpected(&["number"])),
            },
            Some(Token::String(s)) => Ok(CasePattern::Str(s)),
            _ => Err(self.unexpected(&["number", "string"])),
        }
    }

    fn parse_number(&self, n: &str) -> Result<i64> {
        n.parse().map_err(|_| Error::NumberParse {
            token: n.to_string(),
        })
    }

    fn pool_regex(&mut self, source: &str, icase: bool) -> Result<usize> {
        let re = regex::RegexBuilder::new(source)
            .case_insensitive(icase)
            .build()
            .map_err(|e| Error::Regex {
                source_text: source.to_string(),
                message: e.to_string(),
            })?;
        self.pool.push(Lookup::Regex {
            source: source.to_string(),
            icase,
            re,
        });
        Ok(self.pool.len() - 1)
    }

    fn pool_pattern(&mut self, source: &str, icase: bool) -> usize {
        let compiled = if icase {
            Pattern::compile(&source.to_lowercase())
        } else {
            Pattern::compile(source)
        };
        self.pool.push(Lookup::Pattern {
            source: source.to_string(),
            icase,
            pat: compiled,
        });
        self.pool.len() - 1
    }

    /*** Conditions ***/

    fn cond(&mut self) -> Result<Cond> {
        self.or_cond()
    }

    fn or_cond(&mut self) -> Result<Cond> {
        let mut l = self.and_cond()?;
        while self.eat(&Token::Or) {
            let r = self.and_cond()?;
            l = Cond::Or(Box::new(l), Box::new(r));
        }
        Ok(l)
    }

    fn and_cond(&mut self) -> Result<Cond> {
        let mut l = self.eq_cond()?;
        while self.eat(&Token::And) {
            let r = self.eq_cond()?;
            l = Cond::And(Box::new(l), Box::new(r));
        }
        Ok(l)
    }

    fn eq_cond(&mut self) -> Result<Cond> {
        let l = self.primary_cond()?;
        match self.peek() {
            Some(Token::Cmp(CmpOp::Eq, false)) => {
                self.pos += 1;
                let r = self.primary_cond()?;
                Ok(Cond::CondEq {
                    neg: false,
                    l: Box::new(l),
                    r: Box::new(r),
                })
            }
            Some(Token::Cmp(CmpOp::Ne, false)) => {
                self.pos += 1;
                let r = self.primary_cond()?;
                Ok(Cond::CondEq {
                    neg: true,
                    l: Box::new(l),
                    r: Box::new(r),
                })
            }
            _ => Ok(l),
        }
    }

    fn primary_cond(&mut self) -> Result<Cond> {
        if self.eat(&Token::Not) {
            let inner = self.primary_cond()?;
            return Ok(Cond::Not(Box::new(inner)));
        }

        if self.eat(&Token::Defined) {
            self.expect(&Token::OpenParen)?;
            let expr = self.expr()?;
            self.expect(&Token::CloseParen)?;
            return Ok(Cond::Defined(expr));
        }

        // An expression comparison and a parenthesized condition both start
        // with `(`. Try the expression route first and fall back.
        let mark = self.pos;
        if let Ok(expr) = self.expr() {
            if let Some(Token::Cmp(op, icase)) = self.peek().cloned() {
                self.pos += 1;
                return self.finish_cmp(expr, op, icase);
            }
            self.pos = mark;
        } else {
            self.pos = mark;
        }

        self.expect(&Token::OpenParen)?;
        let cond = self.cond()?;
        self.expect(&Token::CloseParen)?;
        Ok(cond)
    }

    fn finish_cmp(&mut self, l: Expr, op: CmpOp, icase: bool) -> Result<Cond> {
        let r = match op {
            CmpOp::ReMatch | CmpOp::ReNoMatch => match self.peek().cloned() {
                Some(Token::String(s)) => {
                    self.pos += 1;
                    CmpRhs::Lookup(self.pool_regex(&s, icase)?)
                }
                Some(Token::Ident(name)) => {
                    let name = name.to_string();
                    self.pos += 1;
                    let lv = self.lookup_lvalue(&name)?;
                    if lv.vtype != VType::Regex {
                        return Err(Error::Type {
                            message: format!("{name} is not a regex variable"),
                        });
                    }
                    CmpRhs::Expr(Expr::Lvalue(lv))
                }
                _ => return Err(self.unexpected(&["string", "regex variable"])),
            },
            CmpOp::PatMatch | CmpOp::PatNoMatch => match self.peek().cloned() {
                Some(Token::String(s)) => {
                    self.pos += 1;
                    CmpRhs::Lookup(self.pool_pattern(&s, icase))
                }
                _ => return Err(self.unexpected(&["string"])),
            },
            CmpOp::InSet | CmpOp::NotInSet => {
                let lo = self.expr()?;
                self.expect(&Token::DotDot)?;
                let hi = self.expr()?;
                if lo.vtype() != hi.vtype() {
                    return Err(Error::Type {
                        message: "interval bounds must have matching types".to_string(),
                    });
                }
                CmpRhs::Interval(lo, hi)
            }
            _ => {
                let r = self.expr()?;
                if l.vtype() != r.vtype() {
                    return Err(Error::Type {
                        message: format!(
                            "cannot compare {} with {}",
                            l.vtype().as_str(),
                            r.vtype().as_str()
                        ),
                    });
                }
                CmpRhs::Expr(r)
            }
        };

        if matches!(
            op,
            CmpOp::ReMatch | CmpOp::ReNoMatch | CmpOp::PatMatch | CmpOp::PatNoMatch
        ) && l.vtype() != VType::Str
        {
            return Err(Error::Type {
                message: "pattern matching requires a string operand".to_string(),
            });
        }

        Ok(Cond::Cmp { op, icase, l, r })
    }

    /*** Expressions ***/

    fn expr(&mut self) -> Result<Expr> {
        let mut l = self.term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                Some(Token::Dot) => BinOp::Cat,
                _ => break,
            };
            self.pos += 1;
            let r = self.term()?;
            self.check_operands(op, &l, &r)?;
            l = Expr::Bin {
                op,
                l: Box::new(l),
                r: Box::new(r),
            };
        }
        Ok(l)
    }

    fn term(&mut self) -> Result<Expr> {
        let mut l = self.factor()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                Some(Token::Percent) => BinOp::Mod,
                _ => break,
            };
            self.pos += 1;
            let r = self.factor()?;
            self.check_operands(op, &l, &r)?;
            l = Expr::Bin {
                op,
                l: Box::new(l),
                r: Box::new(r),
            };
        }
        Ok(l)
    }

    fn check_operands(&self, op: BinOp, l: &Expr, r: &Expr) -> Result<()> {
        match op {
            // Concatenation prints any operand type.
            BinOp::Cat => Ok(()),
            _ => {
                if l.vtype() != VType::Int || r.vtype() != VType::Int {
                    Err(Error::Type {
                        message: format!("operator {} requires int operands", op.as_str()),
                    })
                } else {
                    Ok(())
                }
            }
        }
    }

    fn factor(&mut self) -> Result<Expr> {
        match self.peek().cloned() {
            Some(Token::Number(n)) => {
                let n = self.parse_number(n)?;
                self.pos += 1;
                Ok(Expr::IntConst(n))
            }
            Some(Token::String(s)) => {
                self.pos += 1;
                Ok(Expr::StrConst(s))
            }
            Some(Token::Minus) => {
                self.pos += 1;
                let inner = self.factor()?;
                if inner.vtype() != VType::Int {
                    return Err(Error::Type {
                        message: "unary minus requires an int operand".to_string(),
                    });
                }
                Ok(Expr::Neg(Box::new(inner)))
            }
            Some(Token::OpenParen) => {
                self.pos += 1;
                let expr = self.expr()?;
                self.expect(&Token::CloseParen)?;
                Ok(expr)
            }
            Some(Token::Ident(name)) => {
                let name = name.to_string();
                self.pos += 1;
                let lv = self.lookup_lvalue(&name)?;
                Ok(Expr::Lvalue(lv))
            }
            _ => Err(self.unexpected(&["number", "string", "(", "-", "identifier"])),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Bindings;

    fn bindings() -> Bindings {
        let mut b = Bindings::default();
        b.raw("url", VType::Str, 0);
        b.raw("section", VType::Int, 1);
        b.attr("title", VType::Str);
        b.conf("max_depth", VType::Int);
        b
    }

    #[test]
    fn parses_declarations_and_assignment() {
        let prog = parse("int x; x = 1 + 2 * 3;", &bindings()).unwrap();
        assert_eq!(prog.decls.len(), 1);
        assert_eq!(prog.body.len(), 1);
        match &prog.body[0] {
            Cmd::Set { lv, .. } => assert_eq!(lv.slot, LvSlot::User(0)),
            other => panic!("expected assignment, got {other:?}"),
        }
    }

    #[test]
    fn rejects_type_mismatch() {
        assert!(matches!(
            parse("int x; x = \"str\";", &bindings()),
            Err(Error::Type { .. })
        ));
    }

    #[test]
    fn rejects_unknown_variable() {
        assert!(matches!(
            parse("nope = 1;", &bindings()),
            Err(Error::UnknownVariable { .. })
        ));
    }

    #[test]
    fn parses_if_chain() {
        let prog = parse(
            r#"
            if url =~ "^http:" {
                accept "plain";
            } else if section == 2 {
                reject;
            } undef {
                log "section unknown";
            }
            "#,
            &bindings(),
        )
        .unwrap();
        assert_eq!(prog.body.len(), 1);
        assert_eq!(prog.pool.len(), 1);
    }

    #[test]
    fn parses_switch_with_ops() {
        let prog = parse(
            r#"
            switch url {
                case == "http://a/": accept;
                case =* "*download*": reject "binary";
                case =# "a" .. "m": log "low half";
                else { reject; }
            }
            "#,
            &bindings(),
        )
        .unwrap();
        match &prog.body[0] {
            Cmd::Switch(sw) => {
                assert_eq!(sw.cases.len(), 3);
                assert_eq!(sw.cases[0].case_id, 0);
                assert_eq!(sw.cases[2].op, CmpOp::InSet);
                assert_eq!(sw.negative.len(), 1);
            }
            other => panic!("expected switch, got {other:?}"),
        }
    }

    #[test]
    fn pattern_matching() {
        let pat = Pattern::compile("http://*/index.htm?");
        assert!(pat.matches("http://example.com/index.html"));
        assert!(!pat.matches("http://example.com/index.html.bak"));

        assert_eq!(Pattern::compile("*middle*").as_substring(), Some("middle"));
        assert_eq!(
            Pattern::compile("pre*suf").as_prefix_suffix(),
            Some(("pre", "suf"))
        );
        assert_eq!(Pattern::compile("a*b*c").as_prefix_suffix(), None);
    }
}
