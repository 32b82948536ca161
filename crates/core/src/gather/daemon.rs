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

//! The gatherer master. A single mutator owns the host queue, URL and MD5
//! databases and the bucket file; a bounded pool of worker threads performs
//! the blocking downloads and reports back over a channel. Workers never
//! touch shared state.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use super::queue::{HostId, NodeId, Queue, QueueKey, NUM_RESOLVER_KEYS, UNRESOLVABLE_KEY_BASE};
use super::refs::{RefFilter, RefVerdict, PROTO_HTTP};
use super::{DownloadOutcome, Downloader, ErrorCode};
use crate::config::GatherConfig;
use crate::store::bucket::{BucketFile, Oid, OID_FIRST_ERROR, OID_UNDEFINED};
use super::md5db::Md5Db;
use super::urldb::UrlDb;
use crate::store::records::{UrlFlags, UrlRec};
use crate::Result;

const BUCKET_TYPE_ROBOTS: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    None,
    /// Finish running downloads, flush state, exit.
    Graceful,
    /// Abandon running downloads, flush state, exit.
    Hard,
}

/// Async-signal-safe control flag polled by the master loop. A signal
/// handler may only store into it.
#[derive(Default)]
pub struct ControlFlag(AtomicU8);

impl ControlFlag {
    pub fn request(&self, mode: Shutdown) {
        let v = match mode {
            Shutdown::None => 0,
            Shutdown::Graceful => 1,
            Shutdown::Hard => 2,
        };
        self.0.fetch_max(v, Ordering::SeqCst);
    }

    pub fn get(&self) -> Shutdown {
        match self.0.load(Ordering::SeqCst) {
            0 => Shutdown::None,
            1 => Shutdown::Graceful,
            _ => Shutdown::Hard,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueStatus {
    Queued,
    /// Remembered in the URL database but over the soft quota, so not
    /// physically queued yet.
    Recorded,
    AlreadyKnown,
    OverHardQuota,
    Rejected,
}

/// One in-flight download.
#[derive(Debug, Clone)]
pub struct Task {
    pub worker: usize,
    pub host: HostId,
    pub node: NodeId,
    pub url: String,
    pub urlrest: String,
    pub robot_fetch: bool,
    pub refreshing: Oid,
    pub urlrec: UrlRec,
    pub orig_qkey: QueueKey,
}

pub struct Gatherer {
    config: GatherConfig,
    pub queue: Queue,
    urldb: UrlDb,
    md5db: Md5Db,
    bucket: BucketFile,
    ref_filter: RefFilter,
    control: Arc<ControlFlag>,
    sync_counter: u32,
}

impl Gatherer {
    pub fn open<P: AsRef<std::path::Path>>(
        dir: P,
        config: GatherConfig,
        ref_filter: RefFilter,
    ) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;

        Ok(Self {
            queue: Queue::open_with(dir.join("sched"), config.max_resolvers)?,
            urldb: UrlDb::open(dir.join("urls"))?,
            md5db: Md5Db::open(dir.join("md5s"))?,
            bucket: BucketFile::open(dir.join("bucket"))?,
            ref_filter,
            config,
            control: Arc::new(ControlFlag::default()),
            sync_counter: 0,
        })
    }

    pub fn control(&self) -> Arc<ControlFlag> {
        Arc::clone(&self.control)
    }

    pub fn urldb(&self) -> &UrlDb {
        &self.urldb
    }

    pub fn bucket(&self) -> &BucketFile {
        &self.bucket
    }

    /// Admits one URL: canonicalize, run the reference filter, check the
    /// per-host section quotas, record it and queue it.
    pub fn enqueue_url(&mut self, raw_url: &str, initial: bool, now: u64) -> Result<EnqueueStatus> {
        let info = match self.ref_filter.classify(raw_url)? {
            RefVerdict::Accepted(info) => info,
            RefVerdict::Rejected(msg) => {
                tracing::debug!("{raw_url}: rejected by reference filter: {msg}");
                return Ok(EnqueueStatus::Rejected);
            }
        };

        let existing = self.urldb.lookup(&info.url)?;
        if let Some(rec) = &existing {
            if rec.flags.contains(UrlFlags::QUEUED) {
                return Ok(EnqueueStatus::AlreadyKnown);
            }
            if !initial {
                // Already gathered once; only explicit requests regather.
                return Ok(EnqueueStatus::AlreadyKnown);
            }
        }

        let host_id = match self.queue.find_host(info.protocol, &info.host, info.port) {
            Some(id) => id,
            None => {
                if self.queue.host_count() >= self.config.max_host_count {
                    tracing::warn!("host limit reached, requesting graceful shutdown");
                    self.control.request(Shutdown::Graceful);
                    return Ok(EnqueueStatus::OverHardQuota);
                }
                let id = self.queue.new_host(info.protocol, &info.host, info.port);
                if let Some(qkey) = info.qkey {
                    self.queue.host_mut(id).qkey = qkey;
                }
                id
            }
        };

        let known = self.queue.host(host_id).obj_count[info.section];
        let is_new = existing.is_none();

        if is_new && known >= info.section_hard_max {
            return Ok(EnqueueStatus::OverHardQuota);
        }

        let mut rec = existing.unwrap_or(UrlRec {
            access: now as u32,
            oid: OID_UNDEFINED,
            ..Default::default()
        });
        rec.flags |= UrlFlags::QUEUED;
        if initial {
            rec.flags |= UrlFlags::INITIAL;
        }
        self.urldb.store(&info.url, &rec)?;

        if is_new {
            self.queue.host_mut(host_id).obj_count[info.section] = known + 1;
            if known >= info.section_soft_max {
                // Stays in the URL database only; the expirer requeues such
                // URLs once the host has room again.
                return Ok(EnqueueStatus::Recorded);
            }
        }

        let priority = info.queue_bonus + u32::from(initial);
        self.queue.enqueue_item(host_id, &info.urlrest, priority)?;
        self.queue.put_host(host_id, now);
        Ok(EnqueueStatus::Queued)
    }

    /// Picks the next download for a dequeued host: its robots file when
    /// that is still unknown, otherwise the head of its item chain.
    pub fn prepare(&mut self, host: HostId, node: NodeId, now: u64) -> Result<Option<Task>> {
        let robot_fetch = {
            let h = self.queue.host(host);
            h.robot_oid == OID_UNDEFINED && h.protocol == PROTO_HTTP
        };

        let (urlrest, _priority) = if robot_fetch {
            ("/robots.txt".to_string(), 0)
        } else {
            match self.queue.peek_item(host)? {
                Some(item) => (item.text, item.priority),
                None => {
                    self.queue.finish_host(host, now, 0, 0);
                    return Ok(None);
                }
            }
        };

        let h = self.queue.host(host);
        let url = format!(
            "{}://{}{}{}",
            super::refs::proto_name(h.protocol),
            h.name,
            match (h.protocol, h.port) {
                (PROTO_HTTP, 80) | (super::refs::PROTO_HTTPS, 443) | (super::refs::PROTO_FTP, 21) =>
                    String::new(),
                (_, p) => format!(":{p}"),
            },
            urlrest
        );

        let (urlrec, refreshing) = if robot_fetch {
            // Synthesized record so retry accounting works for robot files.
            let rec = UrlRec {
                retries: h.rec_err_count.min(255) as u8,
                ..Default::default()
            };
            (rec, OID_UNDEFINED)
        } else {
            let Some(rec) = self.urldb.lookup(&url)? else {
                return Err(super::Error::MissingUrlRecord(url).into());
            };
            if !rec.flags.contains(UrlFlags::QUEUED) {
                return Err(super::Error::NotMarkedQueued(url).into());
            }
            let refreshing = if rec.oid < OID_FIRST_ERROR && rec.oid != OID_UNDEFINED {
                rec.oid
            } else {
                OID_UNDEFINED
            };
            (rec, refreshing)
        };

        if !robot_fetch && !self.robots_allow(host, &urlrest)? {
            // Rejected without a fetch; run the usual completion path so
            // queue state stays consistent.
            let outcome = DownloadOutcome::error(2304, "Forbidden by robots.txt");
            let task = Task {
                worker: 0,
                host,
                node,
                url,
                urlrest,
                robot_fetch,
                refreshing,
                urlrec,
                orig_qkey: self.queue.host(host).qkey,
            };
            self.finish(&task, outcome, now)?;
            return Ok(None);
        }

        Ok(Some(Task {
            worker: 0,
            host,
            node,
            url,
            urlrest,
            robot_fetch,
            refreshing,
            urlrec,
            orig_qkey: self.queue.host(host).qkey,
        }))
    }

    /// Checks an item against the host's gathered robots file. The robots
    /// bucket body is a list of newline-separated disallowed prefixes.
    fn robots_allow(&mut self, host: HostId, urlrest: &str) -> Result<bool> {
        let robot_oid = self.queue.host(host).robot_oid;
        if robot_oid == OID_UNDEFINED || robot_oid >= OID_FIRST_ERROR {
            return Ok(true);
        }

        let Some((_, body)) = self.bucket.get(robot_oid)? else {
            return Ok(true);
        };

        for prefix in body.split(|&b| b == b'\n') {
            if !prefix.is_empty() && urlrest.as_bytes().starts_with(prefix) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// The retry/backoff state machine, run on the master for every
    /// completed download.
    pub fn finish(&mut self, task: &Task, outcome: DownloadOutcome, now: u64) -> Result<()> {
        let err = outcome.code;
        let host = task.host;
        let mut ur = task.urlrec;
        let mut touched_urldb = false;
        let mut retry_after: u64 = 0;
        let mut skip_refs = false;
        let mut log_new = "";
        let mut oid = OID_UNDEFINED;
        let mut new_qkey: QueueKey = 0;
        let orig_qkey = task.orig_qkey;

        // Anything but a soft failure resets the error counters.
        if !err.is_soft() {
            if ur.retries != 0 {
                ur.retries = 0;
                touched_urldb = true;
            }
            self.queue.host_mut(host).rec_err_count = 0;
            self.queue.reset_node_rec_err(task.node);
        }

        if err.is_hard() {
            oid = OID_FIRST_ERROR + u32::from(err.0);
        } else if err.is_soft() {
            if ur.retries >= self.config.max_retries {
                oid = OID_FIRST_ERROR + u32::from(err.0);
            } else {
                ur.retries += 1;
                touched_urldb = true;
                if !task.robot_fetch {
                    self.queue.requeue_item(host)?;
                }
                let host_errs = {
                    let h = self.queue.host_mut(host);
                    h.rec_err_count += 1;
                    h.rec_err_count
                };
                if orig_qkey != 0 {
                    let node_errs = self.queue.bump_node_rec_err(task.node);
                    retry_after = if let Some(ra) = outcome.retry_after {
                        ra
                    } else if node_errs >= self.config.rec_err_limit
                        || host_errs >= self.config.rec_err_limit
                    {
                        self.config.rec_err_dly2_secs
                    } else {
                        self.config.rec_err_dly1_secs
                    };
                } else if host_errs < 2 {
                    retry_after = self.config.rec_err_dly1_secs;
                }
            }
        } else if err.is_success() {
            let body = outcome
                .body
                .as_ref()
                .ok_or_else(|| super::Error::MissingBody(task.url.clone()))?;
            let bucket_type = if task.robot_fetch {
                BUCKET_TYPE_ROBOTS
            } else {
                body.bucket_type
            };
            oid = self.bucket.append(bucket_type, &body.data)?;
            if self.bucket.size() >= self.config.max_bucket_file_size {
                tracing::warn!("bucket file limit reached, requesting graceful shutdown");
                self.control.request(Shutdown::Graceful);
            }
        } else if err == ErrorCode::KEY_RESOLVED {
            new_qkey = outcome
                .queue_key
                .ok_or_else(|| super::Error::MissingKey(task.url.clone()))?;
        } else if err.is_not_modified() && task.refreshing != OID_UNDEFINED {
            ur.access = now as u32;
            ur.flags.remove(UrlFlags::QUEUED | UrlFlags::REGATHER);
            ur.oid = task.refreshing;
            if err == ErrorCode::NOT_MODIFIED_LAST_MOD {
                ur.http_last_mod = outcome.last_modified.unwrap_or(0);
            }
            touched_urldb = true;
            self.queue.dequeue_item(host)?;
            skip_refs = true;
            log_new = "=";
        } else {
            return Err(super::Error::UnknownErrorCode {
                code: err.0,
                url: task.url.clone(),
            }
            .into());
        }

        if oid != OID_UNDEFINED {
            if orig_qkey == 0 {
                // The host could not be resolved at all; park it on an
                // unresolvable key.
                new_qkey = UNRESOLVABLE_KEY_BASE + (rand::random::<u32>() & 15);
            }

            if task.robot_fetch {
                let h = self.queue.host_mut(host);
                h.robot_oid = oid;
                h.robot_time = now as u32;
            } else {
                ur.access = now as u32;
                ur.flags.remove(UrlFlags::QUEUED | UrlFlags::REGATHER);
                ur.oid = oid;
                ur.http_last_mod = outcome.last_modified.unwrap_or(0);
                self.update_avg_change(&mut ur, &outcome, now);
                touched_urldb = true;

                // Refreshed documents leave their superseded bucket behind.
                if task.refreshing != OID_UNDEFINED && err.is_success() && oid != task.refreshing {
                    self.bucket.delete(task.refreshing)?;
                }

                log_new = "+";
                if let Some(body) = &outcome.body {
                    match self.md5db.lookup(&body.md5)? {
                        Some(rec) if rec.oid != task.refreshing => {
                            // Byte-identical to a known document; keep the
                            // bucket but do not follow its references.
                            skip_refs = true;
                            log_new = "!";
                        }
                        _ => self.md5db.store(&body.md5, oid)?,
                    }
                }
                self.queue.dequeue_item(host)?;
            }
        }

        tracing::info!(
            "{}: {} {} [{}{}{}] k={:08x} p={}",
            task.url,
            err,
            outcome.message,
            task.worker,
            if task.refreshing != OID_UNDEFINED { "*" } else { "" },
            log_new,
            orig_qkey,
            self.queue.host(host).qpriority,
        );

        if retry_after < self.config.min_server_delay_secs && orig_qkey >= NUM_RESOLVER_KEYS {
            retry_after = self.config.min_server_delay_secs;
        }
        if touched_urldb && !task.robot_fetch {
            self.urldb.store(&task.url, &ur)?;
        }
        self.queue.finish_host(host, now, retry_after, new_qkey);

        if !skip_refs && !outcome.refs.is_empty() {
            for r in &outcome.refs {
                self.enqueue_url(&r.url, false, now)?;
            }
        }

        self.sync_counter += 1;
        if self.sync_counter >= self.config.auto_sync {
            self.sync_counter = 0;
            self.sync()?;
        }

        Ok(())
    }

    /// Average change time mixing, updated when a refresh found new content.
    fn update_avg_change(&self, ur: &mut UrlRec, outcome: &DownloadOutcome, now: u64) {
        let Some(last_mod) = outcome.last_modified else {
            return;
        };
        let age = (now as u32).saturating_sub(last_mod);
        if age == 0 {
            return;
        }
        if ur.avg_change_time == 0 {
            ur.avg_change_time = age;
        } else {
            let mix = self.config.doc_change_mix;
            let old = ur.avg_change_time / 256;
            let new = age / 256;
            ur.avg_change_time = mix * old + (256 - mix) * new;
        }
    }

    /// One synchronous gather step: schedule, download, finish. Drives the
    /// whole pipeline without threads; the threaded loop in [`run`] and the
    /// tests both build on it.
    ///
    /// [`run`]: Gatherer::run
    pub fn gather_one(&mut self, downloader: &dyn Downloader, now: u64) -> Result<bool> {
        self.queue.time_step(now);
        let Some((host, node)) = self.queue.dequeue_host(now) else {
            return Ok(false);
        };

        let Some(task) = self.prepare(host, node, now)? else {
            return Ok(true);
        };

        let outcome = downloader.download(&task.url, task.refreshing_oid());
        self.finish(&task, outcome, now)?;
        Ok(true)
    }

    /// The master loop: keeps up to `max_workers` blocking downloads in
    /// flight and serializes all state mutation on this thread.
    pub fn run(&mut self, downloader: Arc<dyn Downloader>) -> Result<()> {
        let (done_tx, done_rx) = crossbeam_channel::unbounded::<(Task, DownloadOutcome)>();
        let mut in_flight = 0usize;
        let mut next_worker = 0usize;

        std::thread::scope(|scope| -> Result<()> {
            loop {
                let now = unix_now();
                let shutdown = self.control.get();

                if shutdown == Shutdown::Hard {
                    break;
                }

                let wait = self.queue.time_step(now);

                while shutdown == Shutdown::None && in_flight < self.config.max_workers {
                    let Some((host, node)) = self.queue.dequeue_host(now) else {
                        break;
                    };
                    let Some(mut task) = self.prepare(host, node, now)? else {
                        continue;
                    };
                    task.worker = next_worker;
                    next_worker += 1;

                    let tx = done_tx.clone();
                    let downloader = Arc::clone(&downloader);
                    scope.spawn(move || {
                        let outcome = downloader.download(&task.url, task.refreshing_oid());
                        tx.send((task, outcome)).ok();
                    });
                    in_flight += 1;
                }

                if in_flight == 0 {
                    if shutdown == Shutdown::Graceful {
                        break;
                    }
                    match wait {
                        // Idle with nothing pending: the crawl is done.
                        None if !self.queue.has_ready() => break,
                        None => continue,
                        Some(secs) => {
                            std::thread::sleep(Duration::from_secs(secs.min(1)));
                            continue;
                        }
                    }
                }

                let timeout = Duration::from_secs(wait.unwrap_or(1).clamp(1, 10));
                match done_rx.recv_timeout(timeout) {
                    Ok((task, outcome)) => {
                        in_flight -= 1;
                        self.finish(&task, outcome, unix_now())?;
                    }
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                    Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
                }
            }

            // Graceful drain of whatever is still running.
            while in_flight > 0 && self.control.get() != Shutdown::Hard {
                match done_rx.recv_timeout(Duration::from_secs(self.config.max_run_time_secs)) {
                    Ok((task, outcome)) => {
                        in_flight -= 1;
                        self.finish(&task, outcome, unix_now())?;
                    }
                    Err(_) => break,
                }
            }

            Ok(())
        })?;

        self.sync()
    }

    pub fn sync(&mut self) -> Result<()> {
        self.queue.sync()?;
        self.urldb.sync()?;
        self.md5db.sync()?;
        Ok(())
    }
}

impl Task {
    fn refreshing_oid(&self) -> Option<Oid> {
        if self.refreshing == OID_UNDEFINED {
            None
        } else {
            Some(self.refreshing)
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gather::FetchedBody;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Scripted downloader: maps URLs to queues of outcomes.
    struct Script {
        outcomes: Mutex<HashMap<String, Vec<DownloadOutcome>>>,
        fallback: DownloadOutcome,
    }

    impl Script {
        fn new() -> Self {
            Self {
                outcomes: Mutex::new(HashMap::new()),
                fallback: DownloadOutcome::error(2404, "Not found"),
            }
        }

        fn on(mut self, url: &str, outcome: DownloadOutcome) -> Self {
            self.outcomes
                .get_mut()
                .unwrap()
                .entry(url.to_string())
                .or_default()
                .push(outcome);
            self
        }

        fn always(mut self, outcome: DownloadOutcome) -> Self {
            self.fallback = outcome;
            self
        }
    }

    impl Downloader for Script {
        fn download(&self, url: &str, _refreshing: Option<Oid>) -> DownloadOutcome {
            let mut outcomes = self.outcomes.lock().unwrap();
            match outcomes.get_mut(url) {
                Some(list) if !list.is_empty() => list.remove(0),
                _ => self.fallback.clone(),
            }
        }
    }

    fn gatherer() -> Gatherer {
        let config = GatherConfig {
            min_server_delay_secs: 0,
            ..GatherConfig::default()
        };
        Gatherer::open(
            crate::gen_temp_path(),
            config,
            RefFilter::new(None, 1000, 2000),
        )
        .unwrap()
    }

    fn drive(g: &mut Gatherer, dl: &dyn Downloader, mut now: u64, steps: usize) -> u64 {
        for _ in 0..steps {
            if !g.gather_one(dl, now).unwrap() {
                match g.queue.time_step(now) {
                    Some(wait) => now += wait,
                    None => break,
                }
            }
        }
        now
    }

    #[test]
    #[tracing_test::traced_test]
    fn successful_gather_stores_bucket_and_urlrec() {
        let mut g = gatherer();
        // Use an https host so no robots fetch intervenes.
        g.enqueue_url("https://a.example/page", true, 100).unwrap();

        let dl = Script::new().on(
            "https://a.example/page",
            DownloadOutcome::success(FetchedBody::new(1, b"hello world".to_vec())),
        );

        drive(&mut g, &dl, 100, 4);

        let rec = g.urldb.lookup("https://a.example/page").unwrap().unwrap();
        assert!(!rec.flags.contains(UrlFlags::QUEUED));
        assert!(rec.oid < OID_FIRST_ERROR);

        let (_, body) = g.bucket.get(rec.oid).unwrap().unwrap();
        assert_eq!(body, b"hello world");
    }

    #[test]
    fn retry_policy_persists_error_after_limit() {
        let mut g = gatherer();
        g.enqueue_url("https://b.example/flaky", true, 0).unwrap();

        let dl = Script::new().always(DownloadOutcome::error(1000, "Connection refused"));

        // Each attempt ends in a soft failure; the host backs off between
        // attempts, so time must advance past each delay.
        drive(&mut g, &dl, 0, 40);

        let rec = g.urldb.lookup("https://b.example/flaky").unwrap().unwrap();
        assert_eq!(rec.oid, OID_FIRST_ERROR + 1000);
        assert_eq!(rec.retries, g.config.max_retries);
        assert!(!rec.flags.contains(UrlFlags::QUEUED));
        assert!(!g.queue.host(g.queue.find_host(3, "b.example", 443).unwrap()).has_items());
    }

    #[test]
    fn duplicate_bodies_do_not_expand_refs() {
        let mut g = gatherer();
        g.enqueue_url("https://c.example/one", true, 0).unwrap();
        g.enqueue_url("https://c.example/two", true, 0).unwrap();

        let body = FetchedBody::new(1, b"identical".to_vec());
        let mut with_refs = DownloadOutcome::success(body.clone());
        with_refs.refs.push(crate::gather::ExtractedRef {
            url: "https://c.example/three".to_string(),
            kind: crate::gather::RefKind::Normal,
        });

        let dl = Script::new()
            .on("https://c.example/one", with_refs.clone())
            .on("https://c.example/two", with_refs);

        drive(&mut g, &dl, 0, 10);

        // The first body expanded its refs, the identical second one did not:
        // /three exists exactly once and no fourth URL appeared.
        assert!(g.urldb.lookup("https://c.example/three").unwrap().is_some());
        assert_eq!(g.urldb.len(), 3);
    }

    #[test]
    fn not_modified_keeps_bucket() {
        let mut g = gatherer();
        g.enqueue_url("https://d.example/stable", true, 0).unwrap();

        let dl = Script::new().on(
            "https://d.example/stable",
            DownloadOutcome::success(FetchedBody::new(1, b"v1".to_vec())),
        );
        let now = drive(&mut g, &dl, 0, 4);

        let rec1 = g.urldb.lookup("https://d.example/stable").unwrap().unwrap();

        // Regather: the server reports no change.
        g.enqueue_url("https://d.example/stable", true, now + 100)
            .unwrap();
        let dl = Script::new().on(
            "https://d.example/stable",
            DownloadOutcome::error(3, "Not changed"),
        );
        drive(&mut g, &dl, now + 100, 4);

        let rec2 = g.urldb.lookup("https://d.example/stable").unwrap().unwrap();
        assert_eq!(rec1.oid, rec2.oid);
        assert!(rec2.access > rec1.access);
        assert!(g.bucket.get(rec2.oid).unwrap().is_some());
    }

    #[test]
    fn robots_fetch_precedes_items_and_blocks() {
        let mut g = gatherer();
        g.enqueue_url("http://e.example/allowed", true, 0).unwrap();
        g.enqueue_url("http://e.example/private/x", true, 0).unwrap();

        let dl = Script::new()
            .on(
                "http://e.example/robots.txt",
                DownloadOutcome::success(FetchedBody::new(BUCKET_TYPE_ROBOTS, b"/private".to_vec())),
            )
            .on(
                "http://e.example/allowed",
                DownloadOutcome::success(FetchedBody::new(1, b"ok".to_vec())),
            );

        drive(&mut g, &dl, 0, 12);

        let host = g.queue.find_host(PROTO_HTTP, "e.example", 80).unwrap();
        assert!(g.queue.host(host).robot_oid < OID_FIRST_ERROR);

        let allowed = g.urldb.lookup("http://e.example/allowed").unwrap().unwrap();
        assert!(allowed.oid < OID_FIRST_ERROR);

        let blocked = g
            .urldb
            .lookup("http://e.example/private/x")
            .unwrap()
            .unwrap();
        assert_eq!(blocked.oid, OID_FIRST_ERROR + 2304);
    }

    #[test]
    fn key_resolution_moves_host_without_item_loss() {
        let mut g = gatherer();
        g.enqueue_url("https://f.example/x", true, 0).unwrap();

        let dl = Script::new()
            .on("https://f.example/x", DownloadOutcome::resolved_key(0x0a00_00fe))
            .on(
                "https://f.example/x",
                DownloadOutcome::success(FetchedBody::new(1, b"after resolve".to_vec())),
            );

        drive(&mut g, &dl, 0, 8);

        let host = g.queue.find_host(3, "f.example", 443).unwrap();
        assert_eq!(g.queue.host(host).qkey, 0x0a00_00fe);

        let rec = g.urldb.lookup("https://f.example/x").unwrap().unwrap();
        assert!(rec.oid < OID_FIRST_ERROR);
    }

    #[test]
    fn graceful_shutdown_flag_stops_run() {
        let mut g = gatherer();
        g.enqueue_url("https://g.example/x", true, 0).unwrap();
        g.control().request(Shutdown::Graceful);

        let dl: Arc<dyn Downloader> = Arc::new(
            Script::new().always(DownloadOutcome::success(FetchedBody::new(1, b"x".to_vec()))),
        );
        g.run(dl).unwrap();

        // Nothing was fetched: the flag was already set.
        let rec = g.urldb.lookup("https://g.example/x").unwrap().unwrap();
        assert!(rec.flags.contains(UrlFlags::QUEUED));
    }
}
