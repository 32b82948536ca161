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

//! A small compiled rule language consulted by every pipeline stage for
//! acceptance, classification and attribute overrides.
//!
//! A program is parsed against a binding table describing the variables the
//! caller exposes, pruned to a fixed point, equipped with per-switch
//! accelerator tables and then evaluated any number of times against
//! per-object contexts. Evaluation uses three-valued logic: every value can
//! be undefined and conditions propagate that state into the `undef` arms.

pub mod accel;
pub mod ast;
mod dump;
mod interp;
mod lexer;
mod prune;

use thiserror::Error;

use ast::{Cmd, Decl, Lookup, VType as AstVType};

pub use accel::Limits;
pub use ast::VType;
pub use interp::{
    Attrs, ConfVars, ConfigChanges, Ctx, Interp, RawVars, Trilean, Value, VarTable, Verdict,
};
pub use lexer::{lex, CmpOp, Token};

pub(crate) type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Unexpected EOF")]
    UnexpectedEof { expected: Vec<String> },

    #[error("Unexpected token")]
    UnexpectedToken {
        token: (usize, String, usize),
        expected: Vec<String>,
    },

    #[error("Unrecognized token")]
    UnrecognizedToken { token: (usize, String, usize) },

    #[error("Could not parse as a number")]
    NumberParse { token: String },

    #[error("Variable {name} declared twice")]
    Redeclared { name: String },

    #[error("Unknown variable {name}")]
    UnknownVariable { name: String },

    #[error("Variable {name} is read-only")]
    ReadOnly { name: String },

    #[error("Type error: {message}")]
    Type { message: String },

    #[error("Bad regex {source_text}: {message}")]
    Regex { source_text: String, message: String },

    #[error("Evaluation context is missing {what}")]
    MissingContext { what: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarCat {
    /// Field of the caller's bound struct, addressed by slot.
    Raw(usize),
    /// Named attribute of the evaluated object.
    Attr,
    /// Named configuration item; writes are journaled.
    Conf,
}

#[derive(Debug, Clone)]
pub struct Variable {
    pub name: String,
    pub cat: VarCat,
    pub vtype: AstVType,
    pub ro: bool,
}

/// The variables a caller exposes to programs. Raw variables map to slots of
/// the caller's struct; attribute and configuration variables are addressed
/// by name at run time.
#[derive(Debug, Default, Clone)]
pub struct Bindings {
    vars: Vec<Variable>,
}

impl Bindings {
    pub fn raw(&mut self, name: &str, vtype: AstVType, slot: usize) -> &mut Self {
        self.vars.push(Variable {
            name: name.to_string(),
            cat: VarCat::Raw(slot),
            vtype,
            ro: false,
        });
        self
    }

    pub fn raw_ro(&mut self, name: &str, vtype: AstVType, slot: usize) -> &mut Self {
        self.vars.push(Variable {
            name: name.to_string(),
            cat: VarCat::Raw(slot),
            vtype,
            ro: true,
        });
        self
    }

    pub fn attr(&mut self, name: &str, vtype: AstVType) -> &mut Self {
        self.vars.push(Variable {
            name: name.to_string(),
            cat: VarCat::Attr,
            vtype,
            ro: false,
        });
        self
    }

    pub fn conf(&mut self, name: &str, vtype: AstVType) -> &mut Self {
        self.vars.push(Variable {
            name: name.to_string(),
            cat: VarCat::Conf,
            vtype,
            ro: false,
        });
        self
    }

    pub(crate) fn find(&self, name: &str) -> Option<&Variable> {
        self.vars.iter().find(|v| v.name == name)
    }
}

/// A compiled program. Immutable once built; share it behind an `Arc` and
/// give each worker thread its own [`Interp`].
#[derive(Debug)]
pub struct Filter {
    pub(crate) decls: Vec<Decl>,
    pub(crate) body: Vec<Cmd>,
    pub(crate) pool: Vec<Lookup>,
}

impl Filter {
    /// Parses, prunes and accelerates a program with default limits.
    pub fn parse(source: &str, bindings: &Bindings) -> Result<Self> {
        Self::parse_with_limits(source, bindings, &Limits::default())
    }

    pub fn parse_with_limits(
        source: &str,
        bindings: &Bindings,
        limits: &Limits,
    ) -> Result<Self> {
        let mut raw = ast::parse(source, bindings)?;
        prune::prune(&mut raw);

        let mut filter = Self {
            decls: raw.decls,
            body: raw.body,
            pool: raw.pool,
        };

        let mut body = std::mem::take(&mut filter.body);
        build_accels(&mut body, &filter.pool, limits);
        filter.body = body;

        Ok(filter)
    }

    /// Parses without pruning or accelerators. Used by the dumper round-trip
    /// and by tests comparing accelerated and linear evaluation.
    pub fn parse_unoptimized(source: &str, bindings: &Bindings) -> Result<Self> {
        let raw = ast::parse(source, bindings)?;
        Ok(Self {
            decls: raw.decls,
            body: raw.body,
            pool: raw.pool,
        })
    }

    pub fn dump(&self) -> String {
        dump::dump(self)
    }

    pub fn user_vars(&self) -> usize {
        self.decls.len()
    }
}

fn build_accels(cmds: &mut [Cmd], pool: &[Lookup], limits: &Limits) {
    for cmd in cmds {
        match cmd {
            Cmd::If {
                positive,
                negative,
                undefined,
                ..
            } => {
                build_accels(positive, pool, limits);
                build_accels(negative, pool, limits);
                build_accels(undefined, pool, limits);
            }
            Cmd::Switch(switch) => {
                for case in &mut switch.cases {
                    build_accels(&mut case.body, pool, limits);
                }
                build_accels(&mut switch.negative, pool, limits);
                build_accels(&mut switch.undefined, pool, limits);
                switch.accel = Some(accel::build(switch, pool, limits));
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bindings() -> Bindings {
        let mut b = Bindings::default();
        b.raw("url", VType::Str, 0);
        b
    }

    #[test]
    fn accelerated_and_linear_agree() {
        let src = r#"
            string hits;
            hits = "";
            switch url {
                case == "a": hits = hits . "0";
                case == "b": hits = hits . "1";
                case == "c": hits = hits . "2";
                case =* "*b*": hits = hits . "3";
                case =* "*c*": hits = hits . "4";
                case =* "x*y": hits = hits . "5";
                case =# "a" .. "bb": hits = hits . "6";
            }
            accept hits;
        "#;

        let b = bindings();
        let accelerated = Filter::parse_with_limits(
            src,
            &b,
            &Limits {
                hash_limit: 1,
                kmp_limit: 1,
                trie_limit: 1,
                tree_limit: 1,
            },
        )
        .unwrap();
        let linear = Filter::parse_unoptimized(src, &b).unwrap();

        for input in ["a", "b", "c", "ab", "bc", "xzzy", "nothing", ""] {
            let run = |f: &Filter| {
                let mut raw = VarTable::new(1).with(0, Value::Str(input.to_string()));
                let mut ctx = Ctx::new(&mut raw);
                Interp::new(f).run(&mut ctx).unwrap()
            };
            assert_eq!(run(&accelerated), run(&linear), "input {input:?}");
        }
    }

    #[test]
    fn clone_across_threads() {
        let b = bindings();
        let f = std::sync::Arc::new(
            Filter::parse(r#"if url == "x" { accept; } reject;"#, &b).unwrap(),
        );

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let f = std::sync::Arc::clone(&f);
                std::thread::spawn(move || {
                    let input = if i % 2 == 0 { "x" } else { "y" };
                    let mut raw = VarTable::new(1).with(0, Value::Str(input.to_string()));
                    let mut ctx = Ctx::new(&mut raw);
                    Interp::new(&f).run(&mut ctx).unwrap().is_accept()
                })
            })
            .collect();

        let results: Vec<bool> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results, vec![true, false, true, false]);
    }
}
