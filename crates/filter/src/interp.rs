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

//! The evaluator. Values carry an undefined state and every operator
//! propagates it; conditions evaluate to a three-valued result feeding the
//! `undef` arms. Evaluation never panics on program input.

use std::sync::Arc;

use crate::ast::{
    BinOp, Case, CasePattern, Cmd, CmpRhs, Cond, Expr, LogLevel, Lookup, LvSlot, Lvalue, Switch,
    VType,
};
use crate::lexer::CmpOp;
use crate::{Error, Filter, Result};

use std::collections::HashMap;

#[derive(Debug, Clone)]
pub enum Value {
    Int(i64),
    Str(String),
    Regex(Arc<regex::Regex>),
    Undef(VType),
}

impl Value {
    pub fn vtype(&self) -> VType {
        match self {
            Value::Int(_) => VType::Int,
            Value::Str(_) => VType::Str,
            Value::Regex(_) => VType::Regex,
            Value::Undef(t) => *t,
        }
    }

    pub fn is_undef(&self) -> bool {
        matches!(self, Value::Undef(_))
    }

    fn display(&self) -> String {
        match self {
            Value::Int(n) => n.to_string(),
            Value::Str(s) => s.clone(),
            Value::Regex(re) => re.as_str().to_string(),
            Value::Undef(_) => "<undefined>".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trilean {
    True,
    False,
    Undef,
}

impl Trilean {
    fn not(self) -> Self {
        match self {
            Trilean::True => Trilean::False,
            Trilean::False => Trilean::True,
            Trilean::Undef => Trilean::Undef,
        }
    }

    fn from_bool(b: bool) -> Self {
        if b {
            Trilean::True
        } else {
            Trilean::False
        }
    }
}

impl From<bool> for Trilean {
    fn from(b: bool) -> Self {
        Trilean::from_bool(b)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accept(Option<String>),
    Reject(Option<String>),
}

impl Verdict {
    pub fn is_accept(&self) -> bool {
        matches!(self, Verdict::Accept(_))
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            Verdict::Accept(msg) | Verdict::Reject(msg) => msg.as_deref(),
        }
    }
}

enum Outcome {
    Continue,
    Done(Verdict),
}

/// Typed access to the caller's bound struct. Slots are assigned when the
/// binding table is built; the program addresses raw variables by slot only.
pub trait RawVars {
    fn get(&self, slot: usize) -> Value;
    fn set(&mut self, slot: usize, value: Value);
}

/// Plain vector-backed raw variable table.
#[derive(Debug, Default, Clone)]
pub struct VarTable {
    vars: Vec<Value>,
}

impl VarTable {
    pub fn new(slots: usize) -> Self {
        Self {
            vars: vec![Value::Undef(VType::Int); slots],
        }
    }

    pub fn with(mut self, slot: usize, value: Value) -> Self {
        self.vars[slot] = value;
        self
    }
}

impl RawVars for VarTable {
    fn get(&self, slot: usize) -> Value {
        self.vars.get(slot).cloned().unwrap_or(Value::Undef(VType::Int))
    }

    fn set(&mut self, slot: usize, value: Value) {
        if slot < self.vars.len() {
            self.vars[slot] = value;
        }
    }
}

/// Multi-valued named attributes of the evaluated object.
#[derive(Debug, Default, Clone)]
pub struct Attrs {
    map: HashMap<String, Vec<Value>>,
}

impl Attrs {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.map.get(name).and_then(|v| v.first())
    }

    pub fn all(&self, name: &str) -> &[Value] {
        self.map.get(name).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn set(&mut self, name: &str, value: Value) {
        self.map.insert(name.to_string(), vec![value]);
    }

    pub fn add(&mut self, name: &str, value: Value) {
        self.map.entry(name.to_string()).or_default().push(value);
    }

    pub fn remove(&mut self, name: &str) {
        self.map.remove(name);
    }
}

/// Named configuration slots the program may read and, when permitted,
/// write. Writes are journaled in rollback mode.
#[derive(Debug, Default, Clone)]
pub struct ConfVars {
    map: HashMap<String, Value>,
}

impl ConfVars {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.map.get(name)
    }

    pub fn set(&mut self, name: &str, value: Value) {
        self.map.insert(name.to_string(), value);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConfigChanges {
    #[default]
    Disabled,
    Keep,
    /// Journal writes at run start, roll them back at run end so filter
    /// driven config tweaks stay scoped to the evaluated object.
    Rollback,
}

pub struct Ctx<'a> {
    pub raw: &'a mut dyn RawVars,
    pub attrs: Option<&'a mut Attrs>,
    pub conf: Option<&'a mut ConfVars>,
    pub config_changes: ConfigChanges,
}

impl<'a> Ctx<'a> {
    pub fn new(raw: &'a mut dyn RawVars) -> Self {
        Self {
            raw,
            attrs: None,
            conf: None,
            config_changes: ConfigChanges::Disabled,
        }
    }

    pub fn with_attrs(mut self, attrs: &'a mut Attrs) -> Self {
        self.attrs = Some(attrs);
        self
    }

    pub fn with_conf(mut self, conf: &'a mut ConfVars, mode: ConfigChanges) -> Self {
        self.conf = Some(conf);
        self.config_changes = mode;
        self
    }
}

/// One interpreter instance. The compiled program is shared and immutable;
/// each worker thread owns its interpreter with private user variables and
/// scratch buffers.
pub struct Interp<'p> {
    program: &'p Filter,
    user_vars: Vec<Value>,
    matched: Vec<usize>,
    journal: Vec<(String, Option<Value>)>,
}

impl<'p> Interp<'p> {
    pub fn new(program: &'p Filter) -> Self {
        Self {
            program,
            user_vars: Vec::new(),
            matched: Vec::new(),
            journal: Vec::new(),
        }
    }

    pub fn run(&mut self, ctx: &mut Ctx<'_>) -> Result<Verdict, Error> {
        self.user_vars.clear();
        self.user_vars.extend(
            self.program
                .decls
                .iter()
                .map(|d| Value::Undef(d.vtype)),
        );
        self.journal.clear();

        let program = self.program;
        let outcome = self.exec_cmds(ctx, &program.body)?;

        if ctx.config_changes == ConfigChanges::Rollback {
            if let Some(conf) = ctx.conf.as_deref_mut() {
                for (name, old) in self.journal.drain(..).rev() {
                    match old {
                        Some(v) => conf.set(&name, v),
                        None => {
                            conf.map.remove(&name);
                        }
                    }
                }
            }
        }

        match outcome {
            Outcome::Done(verdict) => Ok(verdict),
            Outcome::Continue => {
                tracing::error!("filter program fell through without a verdict; rejecting");
                Ok(Verdict::Reject(None))
            }
        }
    }

    fn exec_cmds(&mut self, ctx: &mut Ctx<'_>, cmds: &'p [Cmd]) -> Result<Outcome, Error> {
        for cmd in cmds {
            match self.exec_cmd(ctx, cmd)? {
                Outcome::Continue => {}
                done => return Ok(done),
            }
        }
        Ok(Outcome::Continue)
    }

    fn exec_cmd(&mut self, ctx: &mut Ctx<'_>, cmd: &'p Cmd) -> Result<Outcome, Error> {
        match cmd {
            Cmd::Log { level, expr } => {
                let msg = self.eval_expr(ctx, expr)?.display();
                match level {
                    LogLevel::Log => tracing::info!("{msg}"),
                    LogLevel::Debug => tracing::debug!("{msg}"),
                    LogLevel::Warning => tracing::warn!("{msg}"),
                    LogLevel::Error => tracing::error!("{msg}"),
                }
                Ok(Outcome::Continue)
            }
            Cmd::Accept { msg } => {
                let msg = self.eval_msg(ctx, msg)?;
                Ok(Outcome::Done(Verdict::Accept(msg)))
            }
            Cmd::Reject { msg } => {
                let msg = self.eval_msg(ctx, msg)?;
                Ok(Outcome::Done(Verdict::Reject(msg)))
            }
            Cmd::Set { lv, expr } => {
                let value = self.eval_expr(ctx, expr)?;
                self.write_lv(ctx, lv, value)?;
                Ok(Outcome::Continue)
            }
            Cmd::Attach { lv, expr } => {
                let value = self.eval_expr(ctx, expr)?;
                match ctx.attrs.as_deref_mut() {
                    Some(attrs) => attrs.add(&lv.name, value),
                    None => return Err(Error::MissingContext { what: "attributes" }),
                }
                Ok(Outcome::Continue)
            }
            Cmd::Unset { lv } => {
                match &lv.slot {
                    LvSlot::Attr => match ctx.attrs.as_deref_mut() {
                        Some(attrs) => attrs.remove(&lv.name),
                        None => return Err(Error::MissingContext { what: "attributes" }),
                    },
                    _ => self.write_lv(ctx, lv, Value::Undef(lv.vtype))?,
                }
                Ok(Outcome::Continue)
            }
            Cmd::If {
                cond,
                positive,
                negative,
                undefined,
            } => {
                let arm = match self.eval_cond(ctx, cond)? {
                    Trilean::True => positive,
                    Trilean::False => negative,
                    Trilean::Undef => undefined,
                };
                self.exec_cmds(ctx, arm)
            }
            Cmd::Switch(switch) => self.exec_switch(ctx, switch),
        }
    }

    fn eval_msg(&mut self, ctx: &mut Ctx<'_>, msg: &'p Option<Expr>) -> Result<Option<String>, Error> {
        match msg {
            Some(expr) => Ok(Some(self.eval_expr(ctx, expr)?.display())),
            None => Ok(None),
        }
    }

    fn exec_switch(&mut self, ctx: &mut Ctx<'_>, switch: &'p Switch) -> Result<Outcome, Error> {
        let value = self.eval_expr(ctx, &switch.expr)?;

        if value.is_undef() {
            return self.exec_cmds(ctx, &switch.undefined);
        }

        let mut matched = std::mem::take(&mut self.matched);
        matched.clear();

        if let Some(tables) = &switch.accel {
            match &value {
                Value::Str(s) => tables.find_str(s, &mut matched),
                Value::Int(n) => tables.find_int(*n, &mut matched),
                _ => {}
            }

            for &idx in &tables.linear {
                if self.case_matches(&switch.cases[idx], &value) == Trilean::True {
                    matched.push(idx);
                }
            }
        } else {
            for (idx, case) in switch.cases.iter().enumerate() {
                if self.case_matches(case, &value) == Trilean::True {
                    matched.push(idx);
                }
            }
        }

        // Several tables may report the same case; execute each distinct
        // matched case once, in source order.
        matched.sort_unstable();
        matched.dedup();

        let result = if matched.is_empty() {
            self.exec_cmds(ctx, &switch.negative)
        } else {
            let mut out = Outcome::Continue;
            for &idx in &matched {
                match self.exec_cmds(ctx, &switch.cases[idx].body)? {
                    Outcome::Continue => {}
                    done => {
                        out = done;
                        break;
                    }
                }
            }
            Ok(out)
        };

        self.matched = matched;
        result
    }

    fn case_matches(&self, case: &Case, value: &Value) -> Trilean {
        let pool = &self.program.pool;
        let positive = match (case.op, &case.pat, value) {
            (CmpOp::Eq | CmpOp::Ne | CmpOp::Lt | CmpOp::Gt | CmpOp::Le | CmpOp::Ge,
                CasePattern::Int(lit), Value::Int(n)) => {
                Some(cmp_ordering(case.op, n.cmp(lit)))
            }
            (CmpOp::Eq | CmpOp::Ne | CmpOp::Lt | CmpOp::Gt | CmpOp::Le | CmpOp::Ge,
                CasePattern::Str(lit), Value::Str(s)) => {
                let ord = if case.icase {
                    s.to_lowercase().cmp(&lit.to_lowercase())
                } else {
                    s.cmp(lit)
                };
                Some(cmp_ordering(case.op, ord))
            }
            (CmpOp::PatMatch | CmpOp::PatNoMatch, CasePattern::Lookup(idx), Value::Str(s)) => {
                match &pool[*idx] {
                    Lookup::Pattern { pat, icase, .. } => {
                        let hit = if *icase {
                            pat.matches(&s.to_lowercase())
                        } else {
                            pat.matches(s)
                        };
                        Some(hit == (case.op == CmpOp::PatMatch))
                    }
                    Lookup::Regex { .. } => None,
                }
            }
            (CmpOp::ReMatch | CmpOp::ReNoMatch, CasePattern::Lookup(idx), Value::Str(s)) => {
                match &pool[*idx] {
                    Lookup::Regex { re, .. } => {
                        Some(re.is_match(s) == (case.op == CmpOp::ReMatch))
                    }
                    Lookup::Pattern { .. } => None,
                }
            }
            (CmpOp::InSet | CmpOp::NotInSet, CasePattern::IntInterval(lo, hi), Value::Int(n)) => {
                Some((lo <= n && n <= hi) == (case.op == CmpOp::InSet))
            }
            (CmpOp::InSet | CmpOp::NotInSet, CasePattern::StrInterval(lo, hi), Value::Str(s)) => {
                let inside = if case.icase {
                    let s = s.to_lowercase();
                    lo.to_lowercase() <= s && s <= hi.to_lowercase()
                } else {
                    lo <= s && s <= hi
                };
                Some(inside == (case.op == CmpOp::InSet))
            }
            _ => None,
        };

        match positive {
            Some(b) => Trilean::from_bool(b),
            None => Trilean::Undef,
        }
    }

    /*** Conditions ***/

    fn eval_cond(&mut self, ctx: &mut Ctx<'_>, cond: &'p Cond) -> Result<Trilean, Error> {
        match cond {
            Cond::Const(b) => Ok(Trilean::from_bool(*b)),
            Cond::ConstUndef => Ok(Trilean::Undef),
            Cond::Defined(expr) => {
                let value = self.eval_expr(ctx, expr)?;
                Ok(Trilean::from_bool(!value.is_undef()))
            }
            Cond::Not(inner) => Ok(self.eval_cond(ctx, inner)?.not()),
            Cond::And(l, r) => {
                match self.eval_cond(ctx, l)? {
                    Trilean::False => Ok(Trilean::False),
                    l => match (l, self.eval_cond(ctx, r)?) {
                        (_, Trilean::False) => Ok(Trilean::False),
                        (Trilean::Undef, _) | (_, Trilean::Undef) => Ok(Trilean::Undef),
                        _ => Ok(Trilean::True),
                    },
                }
            }
            Cond::Or(l, r) => {
                match self.eval_cond(ctx, l)? {
                    Trilean::True => Ok(Trilean::True),
                    l => match (l, self.eval_cond(ctx, r)?) {
                        (_, Trilean::True) => Ok(Trilean::True),
                        (Trilean::Undef, _) | (_, Trilean::Undef) => Ok(Trilean::Undef),
                        _ => Ok(Trilean::False),
                    },
                }
            }
            Cond::CondEq { neg, l, r } => {
                let l = self.eval_cond(ctx, l)?;
                let r = self.eval_cond(ctx, r)?;
                match (l, r) {
                    (Trilean::Undef, _) | (_, Trilean::Undef) => Ok(Trilean::Undef),
                    (l, r) => Ok(Trilean::from_bool((l == r) != *neg)),
                }
            }
            Cond::Cmp { op, icase, l, r } => self.eval_cmp(ctx, *op, *icase, l, r),
        }
    }

    fn eval_cmp(
        &mut self,
        ctx: &mut Ctx<'_>,
        op: CmpOp,
        icase: bool,
        l: &'p Expr,
        r: &'p CmpRhs,
    ) -> Result<Trilean, Error> {
        let lv = self.eval_expr(ctx, l)?;
        if lv.is_undef() {
            return Ok(Trilean::Undef);
        }

        let hit = match (op, r) {
            (CmpOp::ReMatch | CmpOp::ReNoMatch, rhs) => {
                let s = match &lv {
                    Value::Str(s) => s,
                    _ => return Ok(Trilean::Undef),
                };
                let is_match = match rhs {
                    CmpRhs::Lookup(idx) => match &self.program.pool[*idx] {
                        Lookup::Regex { re, .. } => re.is_match(s),
                        Lookup::Pattern { .. } => return Ok(Trilean::Undef),
                    },
                    CmpRhs::Expr(expr) => {
                        let rv = self.eval_expr(ctx, expr)?;
                        match rv {
                            Value::Regex(re) => re.is_match(s),
                            Value::Undef(_) => return Ok(Trilean::Undef),
                            _ => return Ok(Trilean::Undef),
                        }
                    }
                    CmpRhs::Interval(..) => return Ok(Trilean::Undef),
                };
                is_match == (op == CmpOp::ReMatch)
            }
            (CmpOp::PatMatch | CmpOp::PatNoMatch, CmpRhs::Lookup(idx)) => {
                let s = match &lv {
                    Value::Str(s) => s,
                    _ => return Ok(Trilean::Undef),
                };
                match &self.program.pool[*idx] {
                    Lookup::Pattern { pat, icase, .. } => {
                        let hit = if *icase {
                            pat.matches(&s.to_lowercase())
                        } else {
                            pat.matches(s)
                        };
                        hit == (op == CmpOp::PatMatch)
                    }
                    Lookup::Regex { .. } => return Ok(Trilean::Undef),
                }
            }
            (CmpOp::InSet | CmpOp::NotInSet, CmpRhs::Interval(lo, hi)) => {
                let lo = self.eval_expr(ctx, lo)?;
                let hi = self.eval_expr(ctx, hi)?;
                if lo.is_undef() || hi.is_undef() {
                    return Ok(Trilean::Undef);
                }
                let inside = match (&lv, &lo, &hi) {
                    (Value::Int(n), Value::Int(lo), Value::Int(hi)) => lo <= n && n <= hi,
                    (Value::Str(s), Value::Str(lo), Value::Str(hi)) => {
                        if icase {
                            let s = s.to_lowercase();
                            lo.to_lowercase() <= s && s <= hi.to_lowercase()
                        } else {
                            lo <= s && s <= hi
                        }
                    }
                    _ => return Ok(Trilean::Undef),
                };
                inside == (op == CmpOp::InSet)
            }
            (op, CmpRhs::Expr(expr)) => {
                let rv = self.eval_expr(ctx, expr)?;
                if rv.is_undef() {
                    return Ok(Trilean::Undef);
                }
                let ord = match (&lv, &rv) {
                    (Value::Int(l), Value::Int(r)) => l.cmp(r),
                    (Value::Str(l), Value::Str(r)) => {
                        if icase {
                            l.to_lowercase().cmp(&r.to_lowercase())
                        } else {
                            l.cmp(r)
                        }
                    }
                    _ => return Ok(Trilean::Undef),
                };
                cmp_ordering(op, ord)
            }
            _ => return Ok(Trilean::Undef),
        };

        Ok(Trilean::from_bool(hit))
    }

    /*** Expressions ***/

    fn eval_expr(&mut self, ctx: &mut Ctx<'_>, expr: &'p Expr) -> Result<Value, Error> {
        match expr {
            Expr::IntConst(n) => Ok(Value::Int(*n)),
            Expr::StrConst(s) => Ok(Value::Str(s.clone())),
            Expr::UndefConst(t) => Ok(Value::Undef(*t)),
            Expr::Lvalue(lv) => self.read_lv(ctx, lv),
            Expr::Neg(inner) => match self.eval_expr(ctx, inner)? {
                Value::Int(n) => Ok(Value::Int(-n)),
                _ => Ok(Value::Undef(VType::Int)),
            },
            Expr::Bin { op, l, r } => {
                let lv = self.eval_expr(ctx, l)?;
                let rv = self.eval_expr(ctx, r)?;
                Ok(eval_binop(*op, &lv, &rv))
            }
        }
    }

    fn read_lv(&mut self, ctx: &mut Ctx<'_>, lv: &Lvalue) -> Result<Value, Error> {
        let value = match &lv.slot {
            LvSlot::User(slot) => self
                .user_vars
                .get(*slot)
                .cloned()
                .unwrap_or(Value::Undef(lv.vtype)),
            LvSlot::Raw(slot) => ctx.raw.get(*slot),
            LvSlot::Attr => match ctx.attrs.as_deref() {
                Some(attrs) => attrs.get(&lv.name).cloned().unwrap_or(Value::Undef(lv.vtype)),
                None => Value::Undef(lv.vtype),
            },
            LvSlot::Conf => match ctx.conf.as_deref() {
                Some(conf) => conf.get(&lv.name).cloned().unwrap_or(Value::Undef(lv.vtype)),
                None => Value::Undef(lv.vtype),
            },
        };

        if value.is_undef() || value.vtype() == lv.vtype {
            Ok(value)
        } else {
            Ok(Value::Undef(lv.vtype))
        }
    }

    fn write_lv(&mut self, ctx: &mut Ctx<'_>, lv: &Lvalue, value: Value) -> Result<(), Error> {
        match &lv.slot {
            LvSlot::User(slot) => {
                if let Some(var) = self.user_vars.get_mut(*slot) {
                    *var = value;
                }
            }
            LvSlot::Raw(slot) => ctx.raw.set(*slot, value),
            LvSlot::Attr => match ctx.attrs.as_deref_mut() {
                Some(attrs) => attrs.set(&lv.name, value),
                None => return Err(Error::MissingContext { what: "attributes" }),
            },
            LvSlot::Conf => match ctx.conf.as_deref_mut() {
                Some(conf) => {
                    if ctx.config_changes == ConfigChanges::Disabled {
                        return Err(Error::ReadOnly {
                            name: lv.name.clone(),
                        });
                    }
                    if ctx.config_changes == ConfigChanges::Rollback
                        && !self.journal.iter().any(|(n, _)| n == &lv.name)
                    {
                        self.journal
                            .push((lv.name.clone(), conf.get(&lv.name).cloned()));
                    }
                    conf.set(&lv.name, value);
                }
                None => return Err(Error::MissingContext { what: "configuration" }),
            },
        }
        Ok(())
    }
}

fn cmp_ordering(op: CmpOp, ord: std::cmp::Ordering) -> bool {
    use std::cmp::Ordering::*;
    match op {
        CmpOp::Eq => ord == Equal,
        CmpOp::Ne => ord != Equal,
        CmpOp::Lt => ord == Less,
        CmpOp::Gt => ord == Greater,
        CmpOp::Le => ord != Greater,
        CmpOp::Ge => ord != Less,
        _ => false,
    }
}

pub(crate) fn eval_binop(op: BinOp, l: &Value, r: &Value) -> Value {
    if op == BinOp::Cat {
        // Concatenation is the one operator that prints undefined operands
        // instead of propagating them.
        return Value::Str(format!("{}{}", l.display(), r.display()));
    }

    let (l, r) = match (l, r) {
        (Value::Int(l), Value::Int(r)) => (*l, *r),
        _ => return Value::Undef(VType::Int),
    };

    match op {
        BinOp::Add => Value::Int(l.wrapping_add(r)),
        BinOp::Sub => Value::Int(l.wrapping_sub(r)),
        BinOp::Mul => Value::Int(l.wrapping_mul(r)),
        BinOp::Div => {
            if r == 0 {
                Value::Undef(VType::Int)
            } else {
                Value::Int(l.wrapping_div(r))
            }
        }
        BinOp::Mod => {
            if r == 0 {
                Value::Undef(VType::Int)
            } else {
                Value::Int(l.wrapping_rem(r))
            }
        }
        BinOp::Cat => unreachable!(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::VType;
    use crate::{Bindings, Filter};

    fn url_filter(src: &str) -> (Filter, Bindings) {
        let mut b = Bindings::default();
        b.raw("url", VType::Str, 0);
        b.raw("host", VType::Str, 1);
        b.raw("section", VType::Int, 2);
        let f = Filter::parse(src, &b).unwrap();
        (f, b)
    }

    fn run_url(f: &Filter, url: Option<&str>, host: Option<&str>) -> Verdict {
        let mut raw = VarTable::new(3);
        if let Some(url) = url {
            raw = raw.with(0, Value::Str(url.to_string()));
        } else {
            raw = raw.with(0, Value::Undef(VType::Str));
        }
        match host {
            Some(host) => raw = raw.with(1, Value::Str(host.to_string())),
            None => raw = raw.with(1, Value::Undef(VType::Str)),
        }
        raw = raw.with(2, Value::Int(0));

        let mut ctx = Ctx::new(&mut raw);
        let mut interp = Interp::new(f);
        interp.run(&mut ctx).unwrap()
    }

    #[test]
    fn root_url_acceptance() {
        let (f, _) = url_filter(
            r#"if url =~ "^http://[^/]*/$" { accept "root"; } reject "non-root";"#,
        );

        assert_eq!(
            run_url(&f, Some("http://a.b/"), None),
            Verdict::Accept(Some("root".to_string()))
        );
        assert_eq!(
            run_url(&f, Some("http://a.b/x"), None),
            Verdict::Reject(Some("non-root".to_string()))
        );
    }

    #[test]
    fn three_valued_logic() {
        let (f, _) = url_filter(
            r#"if defined(host) && host == "x" { accept; } reject;"#,
        );

        assert_eq!(run_url(&f, Some("u"), None), Verdict::Reject(None));
        assert_eq!(run_url(&f, Some("u"), Some("x")), Verdict::Accept(None));
        assert_eq!(run_url(&f, Some("u"), Some("y")), Verdict::Reject(None));
    }

    #[test]
    fn undef_arm_taken() {
        let (f, _) = url_filter(
            r#"if host == "x" { accept "yes"; } else { reject "no"; } undef { reject "unknown"; }"#,
        );

        assert_eq!(
            run_url(&f, Some("u"), None),
            Verdict::Reject(Some("unknown".to_string()))
        );
    }

    #[test]
    fn concat_prints_undefined() {
        let (f, _) = url_filter(r#"accept "host=" . host;"#);
        assert_eq!(
            run_url(&f, Some("u"), None),
            Verdict::Accept(Some("host=<undefined>".to_string()))
        );
        assert_eq!(
            run_url(&f, Some("u"), Some("h")),
            Verdict::Accept(Some("host=h".to_string()))
        );
    }

    #[test]
    fn missing_verdict_rejects() {
        let (f, _) = url_filter(r#"log "nothing decided";"#);
        assert_eq!(run_url(&f, Some("u"), None), Verdict::Reject(None));
    }

    #[test]
    fn division_by_zero_is_undef() {
        let (f, _) = url_filter(
            r#"int x; x = 1 / 0; if x == 1 { accept "a"; } else { accept "b"; } undef { reject "undef"; }"#,
        );
        assert_eq!(
            run_url(&f, Some("u"), None),
            Verdict::Reject(Some("undef".to_string()))
        );
    }

    #[test]
    fn switch_executes_distinct_matches_in_order() {
        let mut b = Bindings::default();
        b.raw("url", VType::Str, 0);
        let f = Filter::parse(
            r#"
            string seen;
            seen = "";
            switch url {
                case =* "*a*": seen = seen . "1";
                case =* "*b*": seen = seen . "2";
                case == "ab": seen = seen . "3";
            }
            accept seen;
            "#,
            &b,
        )
        .unwrap();

        let mut raw = VarTable::new(1).with(0, Value::Str("ab".to_string()));
        let mut ctx = Ctx::new(&mut raw);
        let mut interp = Interp::new(&f);
        assert_eq!(
            interp.run(&mut ctx).unwrap(),
            Verdict::Accept(Some("123".to_string()))
        );
    }

    #[test]
    fn config_rollback() {
        let mut b = Bindings::default();
        b.raw("url", VType::Str, 0);
        b.conf("depth", VType::Int);
        let f = Filter::parse(r#"depth = 9; accept;"#, &b).unwrap();

        let mut raw = VarTable::new(1).with(0, Value::Str("u".to_string()));
        let mut conf = ConfVars::default();
        conf.set("depth", Value::Int(3));

        {
            let mut ctx =
                Ctx::new(&mut raw).with_conf(&mut conf, ConfigChanges::Rollback);
            let mut interp = Interp::new(&f);
            interp.run(&mut ctx).unwrap();
        }
        assert!(matches!(conf.get("depth"), Some(Value::Int(3))));

        {
            let mut ctx = Ctx::new(&mut raw).with_conf(&mut conf, ConfigChanges::Keep);
            let mut interp = Interp::new(&f);
            interp.run(&mut ctx).unwrap();
        }
        assert!(matches!(conf.get("depth"), Some(Value::Int(9))));
    }

    #[test]
    fn attrs_add_and_delete() {
        let mut b = Bindings::default();
        b.raw("url", VType::Str, 0);
        b.attr("label", VType::Str);
        let f = Filter::parse(
            r#"add label = "x"; add label = "y"; accept label;"#,
            &b,
        )
        .unwrap();

        let mut raw = VarTable::new(1).with(0, Value::Str("u".to_string()));
        let mut attrs = Attrs::default();
        let mut ctx = Ctx::new(&mut raw).with_attrs(&mut attrs);
        let mut interp = Interp::new(&f);
        assert_eq!(
            interp.run(&mut ctx).unwrap(),
            Verdict::Accept(Some("x".to_string()))
        );
        assert_eq!(attrs.all("label").len(), 2);
    }
}
