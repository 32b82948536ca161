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

//! The gatherer daemon: a per-host crawl queue with queue-key politeness, a
//! bounded worker pool around a blocking downloader, and the retry/backoff
//! state machine persisting results into the bucket store and the URL/MD5
//! databases.

pub mod daemon;
pub mod md5db;
pub mod queue;
pub mod refs;
pub mod urldb;

use crate::store::bucket::Oid;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("queued URL missing from URL database: {0}")]
    MissingUrlRecord(String),

    #[error("queued URL not marked QUEUED: {0}")]
    NotMarkedQueued(String),

    #[error("successful download of {0} carried no body")]
    MissingBody(String),

    #[error("key resolution for {0} carried no key")]
    MissingKey(String),

    #[error("unknown gatherer error code {code} for {url}")]
    UnknownErrorCode { code: u16, url: String },
}

/// Numeric outcome of one fetch attempt, following the daemon's error
/// taxonomy: 0/1 success or redirect, 2 key resolution, 3/4 not modified,
/// 1000..2000 soft (retried), 2000.. hard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ErrorCode(pub u16);

impl ErrorCode {
    pub const OK: ErrorCode = ErrorCode(0);
    pub const REDIRECT: ErrorCode = ErrorCode(1);
    pub const KEY_RESOLVED: ErrorCode = ErrorCode(2);
    pub const NOT_MODIFIED: ErrorCode = ErrorCode(3);
    pub const NOT_MODIFIED_LAST_MOD: ErrorCode = ErrorCode(4);

    pub fn is_success(self) -> bool {
        self.0 <= 1
    }

    pub fn is_soft(self) -> bool {
        (1000..2000).contains(&self.0)
    }

    pub fn is_hard(self) -> bool {
        self.0 >= 2000
    }

    pub fn is_not_modified(self) -> bool {
        self.0 == 3 || self.0 == 4
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04}", self.0)
    }
}

/// What a worker hands back to the master after one blocking download.
#[derive(Debug, Clone)]
pub struct DownloadOutcome {
    pub code: ErrorCode,
    pub message: String,
    /// Body written to a bucket on success, together with its content sum.
    pub body: Option<FetchedBody>,
    /// Server-reported last modification time.
    pub last_modified: Option<u32>,
    /// `Retry-After` seconds from the reply, honored over our own delays.
    pub retry_after: Option<u64>,
    /// Resolved queue key, present when `code == KEY_RESOLVED`.
    pub queue_key: Option<u32>,
    /// Outgoing references extracted from the document.
    pub refs: Vec<ExtractedRef>,
}

#[derive(Debug, Clone)]
pub struct FetchedBody {
    pub bucket_type: u32,
    pub data: Vec<u8>,
    pub md5: [u8; 16],
}

impl FetchedBody {
    pub fn new(bucket_type: u32, data: Vec<u8>) -> Self {
        let md5 = md5::compute(&data).0;
        Self {
            bucket_type,
            data,
            md5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefKind {
    Normal,
    Redirect,
    Frame,
    Image,
}

#[derive(Debug, Clone)]
pub struct ExtractedRef {
    pub url: String,
    pub kind: RefKind,
}

impl DownloadOutcome {
    pub fn error(code: u16, message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode(code),
            message: message.into(),
            body: None,
            last_modified: None,
            retry_after: None,
            queue_key: None,
            refs: Vec::new(),
        }
    }

    pub fn success(body: FetchedBody) -> Self {
        Self {
            code: ErrorCode::OK,
            message: "OK".to_string(),
            body: Some(body),
            last_modified: None,
            retry_after: None,
            queue_key: None,
            refs: Vec::new(),
        }
    }

    pub fn resolved_key(key: u32) -> Self {
        Self {
            code: ErrorCode::KEY_RESOLVED,
            message: "Key resolved".to_string(),
            body: None,
            last_modified: None,
            retry_after: None,
            queue_key: Some(key),
            refs: Vec::new(),
        }
    }
}

/// Blocking "download one URL" dependency. The network fetchers live
/// outside the core; the daemon only sees this trait.
pub trait Downloader: Send + Sync {
    fn download(&self, url: &str, refreshing: Option<Oid>) -> DownloadOutcome;
}
