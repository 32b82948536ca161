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

//! Writes a compiled program back out as rule-language source. Inverse of
//! the parser up to whitespace, comments and accelerator tables: parsing
//! the dump yields a structurally equal program.

use std::fmt::Write;

use crate::ast::{
    CasePattern, Cmd, CmpRhs, Cond, Expr, Lookup, Switch,
};
use crate::Filter;

pub fn dump(filter: &Filter) -> String {
    let mut out = String::new();

    for decl in &filter.decls {
        if decl.local {
            out.push_str("local ");
        }
        let _ = writeln!(out, "{} {};", decl.vtype.as_str(), decl.name);
    }

    dump_cmds(&mut out, filter, &filter.body, 0);
    out
}

fn indent(out: &mut String, level: usize) {
    for _ in 0..level {
        out.push_str("    ");
    }
}

fn escape(s: &str) -> String {
    let mut res = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => res.push_str("\\\""),
            '\\' => res.push_str("\\\\"),
            '\n' => res.push_str("\\n"),
            '\t' => res.push_str("\\t"),
            c => res.push(c),
        }
    }
    res
}

fn dump_cmds(out: &mut String, filter: &Filter, cmds: &[Cmd], level: usize) {
    for cmd in cmds {
        dump_cmd(out, filter, cmd, level);
    }
}

fn dump_cmd(out: &mut String, filter: &Filter, cmd: &Cmd, level: usize) {
    indent(out, level);
    match cmd {
        Cmd::Log { level: ll, expr } => {
            let _ = writeln!(out, "{} {};", ll.as_str(), expr_str(filter, expr));
        }
        Cmd::Accept { msg } => match msg {
            Some(expr) => {
                let _ = writeln!(out, "accept {};", expr_str(filter, expr));
            }
            None => out.push_str("accept;\n"),
        },
        Cmd::Reject { msg } => match msg {
            Some(expr) => {
                let _ = writeln!(out, "reject {};", expr_str(filter, expr));
            }
            None => out.push_str("reject;\n"),
        },
        Cmd::Set { lv, expr } => {
            let _ = writeln!(out, "{} = {};", lv.name, expr_str(filter, expr));
        }
        Cmd::Attach { lv, expr } => {
            let _ = writeln!(out, "add {} = {};", lv.name, expr_str(filter, expr));
        }
        Cmd::Unset { lv } => {
            let _ = writeln!(out, "delete {};", lv.name);
        }
        Cmd::If {
            cond,
            positive,
            negative,
            undefined,
        } => {
            let _ = writeln!(out, "if {} {{", cond_str(filter, cond));
            dump_cmds(out, filter, positive, level + 1);
            indent(out, level);
            out.push('}');

            if !negative.is_empty() {
                // Re-sugar an else-if chain.
                if let [Cmd::If { .. }] = negative.as_slice() {
                    out.push_str(" else ");
                    let mut chain = String::new();
                    dump_cmd(&mut chain, filter, &negative[0], level);
                    out.push_str(chain.trim_start());
                    dump_undef_arm(out, filter, undefined, level);
                    return;
                }
                out.push_str(" else {\n");
                dump_cmds(out, filter, negative, level + 1);
                indent(out, level);
                out.push('}');
            }

            dump_undef_arm(out, filter, undefined, level);
        }
        Cmd::Switch(switch) => dump_switch(out, filter, switch, level),
    }
}

fn dump_undef_arm(out: &mut String, filter: &Filter, undefined: &[Cmd], level: usize) {
    if !undefined.is_empty() {
        out.push_str(" undef {\n");
        dump_cmds(out, filter, undefined, level + 1);
        indent(out, level);
        out.push('}');
    }
    out.push('\n');
}

fn dump_switch(out: &mut String, filter: &Filter, switch: &Switch, level: usize) {
    let _ = writeln!(out, "switch {} {{", expr_str(filter, &switch.expr));

    for case in &switch.cases {
        indent(out, level + 1);
        let op = case.op.as_str();
        let icase = if case.icase { "i" } else { "" };
        let pat = match &case.pat {
            CasePattern::Int(n) => n.to_string(),
            CasePattern::Str(s) => format!("\"{}\"", escape(s)),
            CasePattern::IntInterval(lo, hi) => format!("{lo} .. {hi}"),
            CasePattern::StrInterval(lo, hi) => {
                format!("\"{}\" .. \"{}\"", escape(lo), escape(hi))
            }
            CasePattern::Lookup(idx) => match &filter.pool[*idx] {
                Lookup::Regex { source, .. } | Lookup::Pattern { source, .. } => {
                    format!("\"{}\"", escape(source))
                }
            },
        };
        let _ = writeln!(out, "case {op}{icase} {pat}:");
        dump_cmds(out, filter, &case.body, level + 2);
    }

    if !switch.negative.is_empty() {
        indent(out, level + 1);
        out.push_str("else {\n");
        dump_cmds(out, filter, &switch.negative, level + 2);
        indent(out, level + 1);
        out.push_str("}\n");
    }

    if !switch.undefined.is_empty() {
        indent(out, level + 1);
        out.push_str("undef {\n");
        dump_cmds(out, filter, &switch.undefined, level + 2);
        indent(out, level + 1);
        out.push_str("}\n");
    }

    indent(out, level);
    out.push_str("}\n");
}

fn expr_str(filter: &Filter, expr: &Expr) -> String {
    match expr {
        Expr::IntConst(n) => n.to_string(),
        Expr::StrConst(s) => format!("\"{}\"", escape(s)),
        // There is no undefined literal; an expression that always divides
        // by zero reparses to the same folded constant.
        Expr::UndefConst(_) => "(0 / 0)".to_string(),
        Expr::Lvalue(lv) => lv.name.clone(),
        Expr::Neg(inner) => format!("-{}", factor_str(filter, inner)),
        Expr::Bin { op, l, r } => {
            let ls = match l.as_ref() {
                e @ Expr::Bin { .. } => format!("({})", expr_str(filter, e)),
                e => expr_str(filter, e),
            };
            let rs = match r.as_ref() {
                e @ Expr::Bin { .. } => format!("({})", expr_str(filter, e)),
                e => expr_str(filter, e),
            };
            format!("{ls} {} {rs}", op.as_str())
        }
    }
}

fn factor_str(filter: &Filter, expr: &Expr) -> String {
    match expr {
        Expr::Bin { .. } => format!("({})", expr_str(filter, expr)),
        _ => expr_str(filter, expr),
    }
}

fn cond_str(filter: &Filter, cond: &Cond) -> String {
    match cond {
        Cond::Const(true) => "1 == 1".to_string(),
        Cond::Const(false) => "1 == 0".to_string(),
        Cond::ConstUndef => "(0 / 0) == 1".to_string(),
        Cond::Defined(expr) => format!("defined({})", expr_str(filter, expr)),
        Cond::Not(inner) => format!("!({})", cond_str(filter, inner)),
        Cond::And(l, r) => format!(
            "({}) && ({})",
            cond_str(filter, l),
            cond_str(filter, r)
        ),
        Cond::Or(l, r) => format!(
            "({}) || ({})",
            cond_str(filter, l),
            cond_str(filter, r)
        ),
        Cond::CondEq { neg, l, r } => format!(
            "({}) {} ({})",
            cond_str(filter, l),
            if *neg { "!=" } else { "==" },
            cond_str(filter, r)
        ),
        Cond::Cmp { op, icase, l, r } => {
            let icase = if *icase { "i" } else { "" };
            let rhs = match r {
                CmpRhs::Expr(e) => expr_str(filter, e),
                CmpRhs::Interval(lo, hi) => {
                    format!("{} .. {}", expr_str(filter, lo), expr_str(filter, hi))
                }
                CmpRhs::Lookup(idx) => match &filter.pool[*idx] {
                    Lookup::Regex { source, .. } | Lookup::Pattern { source, .. } => {
                        format!("\"{}\"", escape(source))
                    }
                },
            };
            format!("{} {}{icase} {rhs}", expr_str(filter, l), op.as_str())
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::ast::VType;
    use crate::{Bindings, Filter};

    fn bindings() -> Bindings {
        let mut b = Bindings::default();
        b.raw("url", VType::Str, 0);
        b.raw("section", VType::Int, 1);
        b.attr("label", VType::Str);
        b
    }

    fn roundtrip(src: &str) {
        let b = bindings();
        let first = Filter::parse_unoptimized(src, &b).unwrap();
        let dumped = first.dump();
        let second = Filter::parse_unoptimized(&dumped, &b).unwrap();

        assert_eq!(first.body, second.body, "dump was: {dumped}");
        assert_eq!(first.decls, second.decls);
        // The dump of the reparse is a fixed point.
        assert_eq!(dumped, second.dump());
    }

    #[test]
    fn roundtrips_commands() {
        roundtrip(
            r#"
            int x;
            local string note;
            x = 1 + 2 * section;
            note = "n" . "ote";
            add label = note;
            delete label;
            log "x=" . x;
            if defined(url) && url =~ "^http:" {
                accept "ok";
            } else if section == 3 {
                reject;
            } undef {
                warning "undefined input";
            }
            reject "fallthrough";
            "#,
        );
    }

    #[test]
    fn roundtrips_switch() {
        roundtrip(
            r#"
            switch url {
                case == "http://a/": accept "a";
                case ==i "HTTP://B/": accept "b";
                case =* "*cgi*": reject "cgi";
                case =~ "[0-9]+$": reject "digits";
                case =# "a" .. "f": log "low";
                else { reject "none"; }
                undef { reject "undef"; }
            }
            switch section {
                case == 1: accept;
                case =# 2 .. 9: reject "high";
            }
            "#,
        );
    }

    #[test]
    fn roundtrips_escapes() {
        roundtrip(r#"accept "quote:\" backslash:\\ nl:\n";"#);
    }
}
