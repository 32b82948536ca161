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

//! Reference admission. Every discovered URL is canonicalized and passed
//! through the reference filter program, which can reject it outright or
//! override its section, quotas, queue bonus and queue key.

use std::sync::Arc;

use filter::{Ctx, Filter, Interp, Value, VarTable, Verdict};
use url::Url;

use crate::Result;

pub const PROTO_HTTP: u8 = 1;
pub const PROTO_FTP: u8 = 2;
pub const PROTO_HTTPS: u8 = 3;

/// Variable slots the reference filter sees. Writable slots carry the
/// classification back out of the program.
mod slots {
    pub const URL: usize = 0;
    pub const PROTOCOL: usize = 1;
    pub const HOST: usize = 2;
    pub const PORT: usize = 3;
    pub const PATH: usize = 4;
    pub const CONTENT_TYPE: usize = 5;
    pub const SECTION: usize = 6;
    pub const SECTION_SOFT_MAX: usize = 7;
    pub const SECTION_HARD_MAX: usize = 8;
    pub const QUEUE_BONUS: usize = 9;
    pub const QKEY: usize = 10;
    pub const COUNT: usize = 11;
}

/// Classification of one admitted reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefInfo {
    pub url: String,
    pub protocol: u8,
    pub host: String,
    pub port: u16,
    /// Path and query, the part queued under the host.
    pub urlrest: String,
    pub section: usize,
    pub section_soft_max: u32,
    pub section_hard_max: u32,
    pub queue_bonus: u32,
    /// Pre-resolved queue key, when the filter knows one.
    pub qkey: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefVerdict {
    Accepted(RefInfo),
    Rejected(String),
}

pub fn filter_bindings() -> filter::Bindings {
    let mut b = filter::Bindings::default();
    b.raw_ro("url", filter::VType::Str, slots::URL);
    b.raw_ro("protocol", filter::VType::Str, slots::PROTOCOL);
    b.raw_ro("host", filter::VType::Str, slots::HOST);
    b.raw_ro("port", filter::VType::Int, slots::PORT);
    b.raw_ro("path", filter::VType::Str, slots::PATH);
    b.raw("content_type", filter::VType::Str, slots::CONTENT_TYPE);
    b.raw("section", filter::VType::Int, slots::SECTION);
    b.raw("section_soft_max", filter::VType::Int, slots::SECTION_SOFT_MAX);
    b.raw("section_hard_max", filter::VType::Int, slots::SECTION_HARD_MAX);
    b.raw("queue_bonus", filter::VType::Int, slots::QUEUE_BONUS);
    b.raw("qkey", filter::VType::Int, slots::QKEY);
    b
}

pub struct RefFilter {
    program: Option<Arc<Filter>>,
    soft_max: u32,
    hard_max: u32,
}

impl RefFilter {
    pub fn new(program: Option<Arc<Filter>>, soft_max: u32, hard_max: u32) -> Self {
        Self {
            program,
            soft_max,
            hard_max,
        }
    }

    /// Compiles a reference filter program against the admission bindings.
    pub fn compile(source: &str, soft_max: u32, hard_max: u32) -> Result<Self> {
        let program = Filter::parse(source, &filter_bindings())?;
        Ok(Self::new(Some(Arc::new(program)), soft_max, hard_max))
    }

    pub fn classify(&self, raw_url: &str) -> Result<RefVerdict> {
        let Some(canon) = canonicalize(raw_url) else {
            return Ok(RefVerdict::Rejected("unparsable URL".to_string()));
        };

        let mut info = canon;
        info.section_soft_max = self.soft_max;
        info.section_hard_max = self.hard_max;

        let Some(program) = &self.program else {
            return Ok(RefVerdict::Accepted(info));
        };

        let mut vars = VarTable::new(slots::COUNT)
            .with(slots::URL, Value::Str(info.url.clone()))
            .with(slots::PROTOCOL, Value::Str(proto_name(info.protocol).to_string()))
            .with(slots::HOST, Value::Str(info.host.clone()))
            .with(slots::PORT, Value::Int(i64::from(info.port)))
            .with(slots::PATH, Value::Str(info.urlrest.clone()))
            .with(slots::SECTION, Value::Int(info.section as i64))
            .with(slots::SECTION_SOFT_MAX, Value::Int(i64::from(self.soft_max)))
            .with(slots::SECTION_HARD_MAX, Value::Int(i64::from(self.hard_max)))
            .with(slots::QUEUE_BONUS, Value::Int(0));

        let verdict = {
            let mut ctx = Ctx::new(&mut vars);
            Interp::new(program).run(&mut ctx)?
        };

        match verdict {
            Verdict::Reject(msg) => Ok(RefVerdict::Rejected(
                msg.unwrap_or_else(|| "rejected by filter".to_string()),
            )),
            Verdict::Accept(_) => {
                use filter::RawVars;
                if let Value::Int(section) = vars.get(slots::SECTION) {
                    info.section =
                        (section.clamp(0, super::queue::NUM_SECTIONS as i64 - 1)) as usize;
                }
                if let Value::Int(v) = vars.get(slots::SECTION_SOFT_MAX) {
                    info.section_soft_max = v.clamp(0, i64::from(u32::MAX)) as u32;
                }
                if let Value::Int(v) = vars.get(slots::SECTION_HARD_MAX) {
                    info.section_hard_max = v.clamp(0, i64::from(u32::MAX)) as u32;
                }
                if let Value::Int(v) = vars.get(slots::QUEUE_BONUS) {
                    info.queue_bonus = v.clamp(0, i64::from(u32::MAX)) as u32;
                }
                if let Value::Int(v) = vars.get(slots::QKEY) {
                    info.qkey = Some(v.clamp(0, i64::from(u32::MAX)) as u32);
                }
                Ok(RefVerdict::Accepted(info))
            }
        }
    }
}

pub fn proto_name(protocol: u8) -> &'static str {
    match protocol {
        PROTO_HTTP => "http",
        PROTO_FTP => "ftp",
        PROTO_HTTPS => "https",
        _ => "unknown",
    }
}

/// Canonical form: lowercased scheme and host, default port stripped,
/// fragment dropped, empty path normalized to `/`.
pub fn canonicalize(raw: &str) -> Option<RefInfo> {
    let mut url = Url::parse(raw).ok()?;

    let protocol = match url.scheme() {
        "http" => PROTO_HTTP,
        "ftp" => PROTO_FTP,
        "https" => PROTO_HTTPS,
        _ => return None,
    };

    url.set_fragment(None);
    let host = url.host_str()?.to_lowercase();
    let port = url.port_or_known_default()?;

    let mut urlrest = url.path().to_string();
    if urlrest.is_empty() {
        urlrest = "/".to_string();
    }
    if let Some(query) = url.query() {
        urlrest.push('?');
        urlrest.push_str(query);
    }

    let canon = if port == known_default(protocol) {
        format!("{}://{}{}", url.scheme(), host, urlrest)
    } else {
        format!("{}://{}:{}{}", url.scheme(), host, port, urlrest)
    };

    Some(RefInfo {
        url: canon,
        protocol,
        host,
        port,
        urlrest,
        section: 0,
        section_soft_max: 0,
        section_hard_max: 0,
        queue_bonus: 0,
        qkey: None,
    })
}

fn known_default(protocol: u8) -> u16 {
    match protocol {
        PROTO_HTTP => 80,
        PROTO_FTP => 21,
        PROTO_HTTPS => 443,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_forms() {
        let info = canonicalize("HTTP://Example.COM:80/a/b?q=1#frag").unwrap();
        assert_eq!(info.url, "http://example.com/a/b?q=1");
        assert_eq!(info.protocol, PROTO_HTTP);
        assert_eq!(info.host, "example.com");
        assert_eq!(info.port, 80);
        assert_eq!(info.urlrest, "/a/b?q=1");

        let info = canonicalize("http://example.com").unwrap();
        assert_eq!(info.urlrest, "/");

        let info = canonicalize("http://example.com:8080/x").unwrap();
        assert_eq!(info.url, "http://example.com:8080/x");
        assert_eq!(info.port, 8080);

        assert!(canonicalize("mailto:x@example.com").is_none());
        assert!(canonicalize("not a url").is_none());
    }

    #[test]
    fn filterless_admission() {
        let rf = RefFilter::new(None, 100, 200);
        match rf.classify("http://a.example/x").unwrap() {
            RefVerdict::Accepted(info) => {
                assert_eq!(info.section, 0);
                assert_eq!(info.section_soft_max, 100);
                assert_eq!(info.section_hard_max, 200);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn filter_overrides_and_rejects() {
        let rf = RefFilter::compile(
            r#"
            if path =* "*.gif" {
                reject "image";
            }
            if host == "fast.example" {
                queue_bonus = 100;
                section = 1;
            }
            accept;
            "#,
            100,
            200,
        )
        .unwrap();

        match rf.classify("http://fast.example/page").unwrap() {
            RefVerdict::Accepted(info) => {
                assert_eq!(info.queue_bonus, 100);
                assert_eq!(info.section, 1);
            }
            other => panic!("unexpected {other:?}"),
        }

        match rf.classify("http://a.example/pic.gif").unwrap() {
            RefVerdict::Rejected(msg) => assert_eq!(msg, "image"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
