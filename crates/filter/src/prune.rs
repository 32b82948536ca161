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

//! Static optimizer run after parsing, before accelerator construction.
//! Folds constant expressions, evaluates conditions over literal operands
//! with three-valued semantics, deletes dead arms and collapses constant
//! switches. Runs to a fixed point.

use crate::ast::{
    CasePattern, Cmd, CmpRhs, Cond, Expr, Lookup, RawProgram, Switch, VType,
};
use crate::interp::{eval_binop, Trilean, Value};
use crate::lexer::CmpOp;

pub fn prune(program: &mut RawProgram) {
    loop {
        let mut changed = false;
        let body = std::mem::take(&mut program.body);
        program.body = prune_cmds(body, &program.pool, &mut changed);
        if !changed {
            break;
        }
    }
}

fn const_value(expr: &Expr) -> Option<Value> {
    match expr {
        Expr::IntConst(n) => Some(Value::Int(*n)),
        Expr::StrConst(s) => Some(Value::Str(s.clone())),
        Expr::UndefConst(t) => Some(Value::Undef(*t)),
        _ => None,
    }
}

fn value_to_expr(value: Value) -> Expr {
    match value {
        Value::Int(n) => Expr::IntConst(n),
        Value::Str(s) => Expr::StrConst(s),
        Value::Undef(t) => Expr::UndefConst(t),
        Value::Regex(_) => Expr::UndefConst(VType::Regex),
    }
}

fn fold_expr(expr: Expr, changed: &mut bool) -> Expr {
    match expr {
        Expr::Neg(inner) => {
            let inner = fold_expr(*inner, changed);
            match const_value(&inner) {
                Some(Value::Int(n)) => {
                    *changed = true;
                    Expr::IntConst(-n)
                }
                Some(Value::Undef(_)) => {
                    *changed = true;
                    Expr::UndefConst(VType::Int)
                }
                _ => Expr::Neg(Box::new(inner)),
            }
        }
        Expr::Bin { op, l, r } => {
            let l = fold_expr(*l, changed);
            let r = fold_expr(*r, changed);
            match (const_value(&l), const_value(&r)) {
                (Some(lv), Some(rv)) => {
                    *changed = true;
                    value_to_expr(eval_binop(op, &lv, &rv))
                }
                _ => Expr::Bin {
                    op,
                    l: Box::new(l),
                    r: Box::new(r),
                },
            }
        }
        other => other,
    }
}

fn static_cmp(
    op: CmpOp,
    icase: bool,
    l: &Value,
    r: &CmpRhs,
    pool: &[Lookup],
) -> Option<Trilean> {
    if l.is_undef() {
        return Some(Trilean::Undef);
    }

    let hit = match (op, r) {
        (CmpOp::ReMatch | CmpOp::ReNoMatch, CmpRhs::Lookup(idx)) => {
            let s = match l {
                Value::Str(s) => s,
                _ => return Some(Trilean::Undef),
            };
            match &pool[*idx] {
                Lookup::Regex { re, .. } => re.is_match(s) == (op == CmpOp::ReMatch),
                Lookup::Pattern { .. } => return Some(Trilean::Undef),
            }
        }
        (CmpOp::PatMatch | CmpOp::PatNoMatch, CmpRhs::Lookup(idx)) => {
            let s = match l {
                Value::Str(s) => s,
                _ => return Some(Trilean::Undef),
            };
            match &pool[*idx] {
                Lookup::Pattern { pat, icase, .. } => {
                    let hit = if *icase {
                        pat.matches(&s.to_lowercase())
                    } else {
                        pat.matches(s)
                    };
                    hit == (op == CmpOp::PatMatch)
                }
                Lookup::Regex { .. } => return Some(Trilean::Undef),
            }
        }
        (CmpOp::InSet | CmpOp::NotInSet, CmpRhs::Interval(lo, hi)) => {
            let lo = const_value(lo)?;
            let hi = const_value(hi)?;
            if lo.is_undef() || hi.is_undef() {
                return Some(Trilean::Undef);
            }
            let inside = match (l, &lo, &hi) {
                (Value::Int(n), Value::Int(lo), Value::Int(hi)) => lo <= n && n <= hi,
                (Value::Str(s), Value::Str(lo), Value::Str(hi)) => {
                    if icase {
                        let s = s.to_lowercase();
                        lo.to_lowercase() <= s && s <= hi.to_lowercase()
                    } else {
                        lo <= s && s <= hi
                    }
                }
                _ => return Some(Trilean::Undef),
            };
            inside == (op == CmpOp::InSet)
        }
        (op, CmpRhs::Expr(expr)) => {
            let rv = const_value(expr)?;
            if rv.is_undef() {
                return Some(Trilean::Undef);
            }
            let ord = match (l, &rv) {
                (Value::Int(l), Value::Int(r)) => l.cmp(r),
                (Value::Str(l), Value::Str(r)) => {
                    if icase {
                        l.to_lowercase().cmp(&r.to_lowercase())
                    } else {
                        l.cmp(r)
                    }
                }
                _ => return Some(Trilean::Undef),
            };
            match op {
                CmpOp::Eq => ord == std::cmp::Ordering::Equal,
                CmpOp::Ne => ord != std::cmp::Ordering::Equal,
                CmpOp::Lt => ord == std::cmp::Ordering::Less,
                CmpOp::Gt => ord == std::cmp::Ordering::Greater,
                CmpOp::Le => ord != std::cmp::Ordering::Greater,
                CmpOp::Ge => ord != std::cmp::Ordering::Less,
                _ => return Some(Trilean::Undef),
            }
        }
        _ => return None,
    };

    Some(Trilean::from(hit))
}

fn fold_cond(cond: Cond, pool: &[Lookup], changed: &mut bool) -> Cond {
    match cond {
        Cond::Not(inner) => {
            let inner = fold_cond(*inner, pool, changed);
            match inner {
                Cond::Const(b) => {
                    *changed = true;
                    Cond::Const(!b)
                }
                Cond::ConstUndef => {
                    *changed = true;
                    Cond::ConstUndef
                }
                inner => Cond::Not(Box::new(inner)),
            }
        }
        Cond::And(l, r) => {
            let l = fold_cond(*l, pool, changed);
            let r = fold_cond(*r, pool, changed);
            match (&l, &r) {
                (Cond::Const(false), _) | (_, Cond::Const(false)) => {
                    *changed = true;
                    Cond::Const(false)
                }
                (Cond::Const(true), _) => {
                    *changed = true;
                    r
                }
                (_, Cond::Const(true)) => {
                    *changed = true;
                    l
                }
                (Cond::ConstUndef, Cond::ConstUndef) => {
                    *changed = true;
                    Cond::ConstUndef
                }
                _ => Cond::And(Box::new(l), Box::new(r)),
            }
        }
        Cond::Or(l, r) => {
            let l = fold_cond(*l, pool, changed);
            let r = fold_cond(*r, pool, changed);
            match (&l, &r) {
                (Cond::Const(true), _) | (_, Cond::Const(true)) => {
                    *changed = true;
                    Cond::Const(true)
                }
                (Cond::Const(false), _) => {
                    *changed = true;
                    r
                }
                (_, Cond::Const(false)) => {
                    *changed = true;
                    l
                }
                (Cond::ConstUndef, Cond::ConstUndef) => {
                    *changed = true;
                    Cond::ConstUndef
                }
                _ => Cond::Or(Box::new(l), Box::new(r)),
            }
        }
        Cond::CondEq { neg, l, r } => {
            let l = fold_cond(*l, pool, changed);
            let r = fold_cond(*r, pool, changed);
            match (&l, &r) {
                (Cond::ConstUndef, _) | (_, Cond::ConstUndef) => {
                    *changed = true;
                    Cond::ConstUndef
                }
                (Cond::Const(lb), Cond::Const(rb)) => {
                    *changed = true;
                    Cond::Const((lb == rb) != neg)
                }
                _ => Cond::CondEq {
                    neg,
                    l: Box::new(l),
                    r: Box::new(r),
                },
            }
        }
        Cond::Defined(expr) => {
            let expr = fold_expr(expr, changed);
            match const_value(&expr) {
                Some(v) => {
                    *changed = true;
                    Cond::Const(!v.is_undef())
                }
                None => Cond::Defined(expr),
            }
        }
        Cond::Cmp { op, icase, l, r } => {
            let l = fold_expr(l, changed);
            let r = match r {
                CmpRhs::Expr(e) => CmpRhs::Expr(fold_expr(e, changed)),
                CmpRhs::Interval(lo, hi) => {
                    CmpRhs::Interval(fold_expr(lo, changed), fold_expr(hi, changed))
                }
                r => r,
            };

            if let Some(lv) = const_value(&l) {
                if let Some(t) = static_cmp(op, icase, &lv, &r, pool) {
                    *changed = true;
                    return match t {
                        Trilean::True => Cond::Const(true),
                        Trilean::False => Cond::Const(false),
                        Trilean::Undef => Cond::ConstUndef,
                    };
                }
            }

            Cond::Cmp { op, icase, l, r }
        }
        known => known,
    }
}

fn is_terminal(cmd: &Cmd) -> bool {
    matches!(cmd, Cmd::Accept { .. } | Cmd::Reject { .. })
}

fn prune_cmds(cmds: Vec<Cmd>, pool: &[Lookup], changed: &mut bool) -> Vec<Cmd> {
    let mut out = Vec::with_capacity(cmds.len());
    let mut terminated = false;

    for cmd in cmds {
        if terminated {
            *changed = true;
            break;
        }

        match cmd {
            Cmd::Log { level, expr } => out.push(Cmd::Log {
                level,
                expr: fold_expr(expr, changed),
            }),
            Cmd::Accept { msg } => {
                terminated = true;
                out.push(Cmd::Accept {
                    msg: msg.map(|e| fold_expr(e, changed)),
                });
            }
            Cmd::Reject { msg } => {
                terminated = true;
                out.push(Cmd::Reject {
                    msg: msg.map(|e| fold_expr(e, changed)),
                });
            }
            Cmd::Set { lv, expr } => out.push(Cmd::Set {
                lv,
                expr: fold_expr(expr, changed),
            }),
            Cmd::Attach { lv, expr } => out.push(Cmd::Attach {
                lv,
                expr: fold_expr(expr, changed),
            }),
            Cmd::Unset { lv } => out.push(Cmd::Unset { lv }),
            Cmd::If {
                cond,
                positive,
                negative,
                undefined,
            } => {
                let cond = fold_cond(cond, pool, changed);
                let positive = prune_cmds(positive, pool, changed);
                let negative = prune_cmds(negative, pool, changed);
                let undefined = prune_cmds(undefined, pool, changed);

                match cond {
                    Cond::Const(true) => {
                        *changed = true;
                        terminated = positive.iter().any(is_terminal);
                        out.extend(positive);
                    }
                    Cond::Const(false) => {
                        *changed = true;
                        terminated = negative.iter().any(is_terminal);
                        out.extend(negative);
                    }
                    Cond::ConstUndef => {
                        *changed = true;
                        terminated = undefined.iter().any(is_terminal);
                        out.extend(undefined);
                    }
                    cond => {
                        if positive.is_empty() && negative.is_empty() && undefined.is_empty() {
                            *changed = true;
                        } else {
                            out.push(Cmd::If {
                                cond,
                                positive,
                                negative,
                                undefined,
                            });
                        }
                    }
                }
            }
            Cmd::Switch(switch) => {
                let Switch {
                    expr,
                    cases,
                    negative,
                    undefined,
                    accel: _,
                } = *switch;

                let expr = fold_expr(expr, changed);
                let cases = cases
                    .into_iter()
                    .map(|mut case| {
                        case.body = prune_cmds(case.body, pool, changed);
                        case
                    })
                    .collect::<Vec<_>>();
                let negative = prune_cmds(negative, pool, changed);
                let undefined = prune_cmds(undefined, pool, changed);

                if let Some(value) = const_value(&expr) {
                    if value.is_undef() {
                        *changed = true;
                        terminated = undefined.iter().any(is_terminal);
                        out.extend(undefined);
                        continue;
                    }

                    // All case tests on a constant scrutinee are decidable,
                    // so the whole switch collapses.
                    let matched: Vec<_> = cases
                        .iter()
                        .filter(|case| case_hits(case, &value, pool))
                        .collect();

                    *changed = true;
                    match matched.len() {
                        0 => {
                            terminated = negative.iter().any(is_terminal);
                            out.extend(negative);
                        }
                        _ => {
                            let body: Vec<Cmd> = matched
                                .into_iter()
                                .flat_map(|case| case.body.iter().cloned())
                                .collect();
                            terminated = body.iter().any(is_terminal);
                            out.extend(body);
                        }
                    }
                    continue;
                }

                out.push(Cmd::Switch(Box::new(Switch {
                    expr,
                    cases,
                    negative,
                    undefined,
                    accel: None,
                })));
            }
        }
    }

    out
}

fn case_hits(case: &crate::ast::Case, value: &Value, pool: &[Lookup]) -> bool {
    let rhs = match &case.pat {
        CasePattern::Int(n) => CmpRhs::Expr(Expr::IntConst(*n)),
        CasePattern::Str(s) => CmpRhs::Expr(Expr::StrConst(s.clone())),
        CasePattern::IntInterval(lo, hi) => {
            CmpRhs::Interval(Expr::IntConst(*lo), Expr::IntConst(*hi))
        }
        CasePattern::StrInterval(lo, hi) => {
            CmpRhs::Interval(Expr::StrConst(lo.clone()), Expr::StrConst(hi.clone()))
        }
        CasePattern::Lookup(idx) => CmpRhs::Lookup(*idx),
    };

    matches!(
        static_cmp(case.op, case.icase, value, &rhs, pool),
        Some(Trilean::True)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{parse, VType};
    use crate::Bindings;

    fn bindings() -> Bindings {
        let mut b = Bindings::default();
        b.raw("url", VType::Str, 0);
        b
    }

    fn pruned(src: &str) -> Vec<Cmd> {
        let mut prog = parse(src, &bindings()).unwrap();
        prune(&mut prog);
        prog.body
    }

    #[test]
    fn folds_constants() {
        let body = pruned("int x; x = 1 + 2 * 3;");
        match &body[0] {
            Cmd::Set { expr, .. } => assert_eq!(*expr, Expr::IntConst(7)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn collapses_constant_if() {
        let body = pruned(r#"if 1 < 2 { accept "yes"; } else { reject "no"; }"#);
        assert_eq!(body.len(), 1);
        assert!(matches!(&body[0], Cmd::Accept { .. }));
    }

    #[test]
    fn removes_empty_if() {
        let body = pruned(r#"if url == "x" { } accept;"#);
        assert_eq!(body.len(), 1);
        assert!(matches!(&body[0], Cmd::Accept { .. }));
    }

    #[test]
    fn collapses_constant_switch() {
        let body = pruned(
            r#"
            switch "b" {
                case == "a": reject "a";
                case == "b": accept "b";
                else { reject "other"; }
            }
            "#,
        );
        assert_eq!(body.len(), 1);
        match &body[0] {
            Cmd::Accept { msg: Some(expr) } => {
                assert_eq!(*expr, Expr::StrConst("b".to_string()))
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn drops_code_after_verdict() {
        let body = pruned(r#"accept; reject "unreachable";"#);
        assert_eq!(body.len(), 1);
    }

    #[test]
    fn undefined_fold_propagates() {
        let body = pruned(
            r#"if (1 / 0) == 1 { accept "a"; } else { accept "b"; } undef { reject "u"; }"#,
        );
        assert_eq!(body.len(), 1);
        assert!(matches!(&body[0], Cmd::Reject { .. }));
    }

    #[test]
    fn keeps_dynamic_conditions() {
        let body = pruned(r#"if url == "x" { accept; } reject;"#);
        assert_eq!(body.len(), 2);
        assert!(matches!(&body[0], Cmd::If { .. }));
    }
}
