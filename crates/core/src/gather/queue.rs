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

//! Host and queue-key scheduling.
//!
//! Queueing is per host while politeness timing is per queue key (usually
//! the server's IPv4 address), so the two are kept in separate structures:
//! every key owns a qnode with a heap of the hosts waiting under it, and at
//! most one host per qnode is ever active. Item queues hang off hosts as
//! chains of fixed-size pages inside a single queue file; a free list reuses
//! released pages.
//!
//! Queue key assignment:
//!   `00000001 - 00ffffff`  hosts still waiting for key resolution
//!   `7f020000 - 7f02ffff`  unresolvable hosts
//!   anything else          the IPv4 address of the host
//!
//! Resolver nodes outrank everything (their priority reads as `!0`), but
//! only `max_resolvers` resolver slots exist, so real keys cannot starve.

use std::collections::BinaryHeap;
use std::fs::{File, OpenOptions};
use std::hash::Hasher;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use anyhow::bail;
use hashbrown::HashMap;
use rustc_hash::FxHasher;

use crate::store::bucket::{Oid, OID_UNDEFINED};
use crate::Result;

pub const QUEUE_PAGE_SIZE: u32 = 2048;
pub const QUEUE_PAGE_MASK: u32 = QUEUE_PAGE_SIZE - 1;

pub const NUM_RESOLVER_KEYS: u32 = 0x0100_0000;
pub const UNRESOLVABLE_KEY_BASE: u32 = 0x7f02_0000;

pub const NUM_SECTIONS: usize = 4;

const HOST_FILE_MAGIC: u32 = 0x4d48_6f01;

pub type QueueKey = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostId(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    Idle,
    Active,
    Waiting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Idle,
    Active,
    Waiting,
    Ready,
}

#[derive(Debug)]
pub struct Host {
    pub protocol: u8,
    pub name: String,
    pub port: u16,
    /// Offset of the first queued item, 0 when the chain is empty.
    qf_pos: u32,
    /// Offset one past the last queued item.
    qf_last: u32,
    pub robot_oid: Oid,
    pub robot_time: u32,
    pub obj_count: [u32; NUM_SECTIONS],
    pub rec_err_count: u32,
    pub qkey: QueueKey,
    /// Priority of the first queued item.
    pub qpriority: u32,
    sequence: u32,
    state: HostState,
    epoch: u64,
}

impl Host {
    pub fn state(&self) -> HostState {
        self.state
    }

    pub fn has_items(&self) -> bool {
        self.qf_pos != 0
    }
}

#[derive(Debug)]
struct QNode {
    qkey: QueueKey,
    qpriority: u32,
    sequence: u32,
    wake_until: u64,
    pub rec_err_count: u32,
    state: NodeState,
    epoch: u64,
    hosts: BinaryHeap<HostEntry>,
    active_host: Option<HostId>,
}

/// Host-heap entry: higher priority first, then round-robin by sequence.
/// Entries are snapshots; stale ones are skipped via the host epoch.
#[derive(Debug, PartialEq, Eq)]
struct HostEntry {
    qpriority: u32,
    sequence: u32,
    host: HostId,
    epoch: u64,
}

impl Ord for HostEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.qpriority
            .cmp(&other.qpriority)
            .then(other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for HostEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, PartialEq, Eq)]
struct ReadyEntry {
    qpriority: u32,
    sequence: u32,
    node: NodeId,
    epoch: u64,
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.qpriority
            .cmp(&other.qpriority)
            .then(other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, PartialEq, Eq)]
struct WaitEntry {
    wake_until: u64,
    node: NodeId,
    epoch: u64,
}

impl Ord for WaitEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reversed so the binary heap pops the earliest wakeup.
        other
            .wake_until
            .cmp(&self.wake_until)
            .then(other.epoch.cmp(&self.epoch))
    }
}

impl PartialOrd for WaitEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QItem {
    pub text: String,
    pub priority: u32,
    /// Offset just past this item; becomes the host's new chain head on pop.
    aux: u32,
}

pub struct Queue {
    hosts: Vec<Host>,
    host_lookup: HashMap<(u8, String, u16), HostId>,
    nodes: Vec<QNode>,
    node_lookup: HashMap<QueueKey, NodeId>,
    ready: BinaryHeap<ReadyEntry>,
    waiting: BinaryHeap<WaitEntry>,
    sequence_counter: u32,
    max_resolvers: u32,

    queue_file: File,
    queue_size: u32,
    free_head: u32,
    host_file_path: PathBuf,
}

fn name_hash(name: &str) -> u32 {
    let mut hasher = FxHasher::default();
    hasher.write(name.as_bytes());
    hasher.finish() as u32
}

impl Queue {
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        Self::open_with(dir, 16)
    }

    pub fn open_with<P: AsRef<Path>>(dir: P, max_resolvers: u32) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let queue_path = dir.join("queue");
        let host_file_path = dir.join("hosts");

        let queue_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&queue_path)?;
        let queue_size = queue_file.metadata()?.len() as u32;

        let mut queue = Self {
            hosts: Vec::new(),
            host_lookup: HashMap::new(),
            nodes: Vec::new(),
            node_lookup: HashMap::new(),
            ready: BinaryHeap::new(),
            waiting: BinaryHeap::new(),
            sequence_counter: 0,
            max_resolvers: max_resolvers.max(1),
            queue_file,
            queue_size,
            free_head: 0,
            host_file_path,
        };

        queue.load_hosts()?;
        Ok(queue)
    }

    pub fn host_count(&self) -> usize {
        self.hosts.len()
    }

    pub fn host(&self, id: HostId) -> &Host {
        &self.hosts[id.0 as usize]
    }

    pub fn host_mut(&mut self, id: HostId) -> &mut Host {
        &mut self.hosts[id.0 as usize]
    }

    pub fn node_key(&self, id: NodeId) -> QueueKey {
        self.nodes[id.0 as usize].qkey
    }

    pub fn node_rec_err_count(&self, id: NodeId) -> u32 {
        self.nodes[id.0 as usize].rec_err_count
    }

    pub fn bump_node_rec_err(&mut self, id: NodeId) -> u32 {
        let node = &mut self.nodes[id.0 as usize];
        node.rec_err_count += 1;
        node.rec_err_count
    }

    pub fn reset_node_rec_err(&mut self, id: NodeId) {
        self.nodes[id.0 as usize].rec_err_count = 0;
    }

    pub fn find_host(&self, protocol: u8, name: &str, port: u16) -> Option<HostId> {
        self.host_lookup
            .get(&(protocol, name.to_string(), port))
            .copied()
    }

    pub fn new_host(&mut self, protocol: u8, name: &str, port: u16) -> HostId {
        debug_assert!(self.find_host(protocol, name, port).is_none());
        let id = HostId(self.hosts.len() as u32);
        self.hosts.push(Host {
            protocol,
            name: name.to_string(),
            port,
            qf_pos: 0,
            qf_last: 0,
            robot_oid: OID_UNDEFINED,
            robot_time: 0,
            obj_count: [0; NUM_SECTIONS],
            rec_err_count: 0,
            qkey: 0,
            qpriority: 0,
            sequence: 0,
            state: HostState::Idle,
            epoch: 0,
        });
        self.host_lookup
            .insert((protocol, name.to_string(), port), id);
        id
    }

    /*** Item page chains ***/

    fn read_page(&self, base: u32) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; QUEUE_PAGE_SIZE as usize];
        self.queue_file.read_exact_at(&mut buf, u64::from(base))?;
        Ok(buf)
    }

    fn write_page(&self, base: u32, buf: &[u8]) -> Result<()> {
        self.queue_file.write_all_at(buf, u64::from(base))?;
        Ok(())
    }

    fn page_next(buf: &[u8]) -> u32 {
        u32::from_le_bytes(buf[0..4].try_into().unwrap())
    }

    fn set_page_next(buf: &mut [u8], next: u32) {
        buf[0..4].copy_from_slice(&next.to_le_bytes());
    }

    /// Allocates a zeroed page, preferring the free list over growing the
    /// file.
    fn alloc_page(&mut self) -> Result<(u32, Vec<u8>)> {
        if self.free_head != 0 {
            let base = self.free_head & !QUEUE_PAGE_MASK;
            let buf = self.read_page(base)?;
            self.free_head = Self::page_next(&buf);
            Ok((base, vec![0u8; QUEUE_PAGE_SIZE as usize]))
        } else {
            let base = self.queue_size;
            self.queue_size += QUEUE_PAGE_SIZE;
            if self.queue_size >= 0xffff_0000 {
                bail!("queue file too large");
            }
            Ok((base, vec![0u8; QUEUE_PAGE_SIZE as usize]))
        }
    }

    fn free_page(&mut self, base: u32) -> Result<()> {
        let mut buf = vec![0u8; QUEUE_PAGE_SIZE as usize];
        Self::set_page_next(&mut buf, self.free_head);
        // Offset by the link word so page 0 never reads as a null chain.
        self.free_head = base + 4;
        self.write_page(base, &buf)
    }

    pub fn enqueue_item(&mut self, id: HostId, urlrest: &str, priority: u32) -> Result<()> {
        let slen = urlrest.len() + 1;
        let len = (slen + 4) as u32;
        if len + 8 >= QUEUE_PAGE_SIZE {
            bail!("queued item too long: {} bytes", urlrest.len());
        }

        let (qf_pos, qf_last) = {
            let host = &self.hosts[id.0 as usize];
            (host.qf_pos, host.qf_last)
        };

        let (base, mut buf, last) = if qf_last == 0 {
            let (base, buf) = self.alloc_page()?;
            (base, buf, 4u32)
        } else {
            let base = qf_last & !QUEUE_PAGE_MASK;
            let last = qf_last & QUEUE_PAGE_MASK;
            let buf = self.read_page(base)?;
            if last + len + 1 >= QUEUE_PAGE_SIZE {
                let (new_base, new_buf) = self.alloc_page()?;
                let mut old = buf;
                Self::set_page_next(&mut old, new_base + 4);
                self.write_page(base, &old)?;
                (new_base, new_buf, 4u32)
            } else {
                (base, buf, last)
            }
        };

        let at = last as usize;
        buf[at..at + urlrest.len()].copy_from_slice(urlrest.as_bytes());
        buf[at + urlrest.len()] = 0;
        buf[at + slen..at + slen + 4].copy_from_slice(&priority.to_le_bytes());
        buf[at + slen + 4] = 0;
        self.write_page(base, &buf)?;

        let host = &mut self.hosts[id.0 as usize];
        if host.qf_pos == 0 {
            host.qf_pos = base + last;
        }
        host.qf_last = base + last + len;
        if host.qpriority == 0 && host.state != HostState::Waiting {
            host.qpriority = priority;
        }
        Ok(())
    }

    fn peek_at(&mut self, id: HostId) -> Result<Option<QItem>> {
        loop {
            let pos = self.hosts[id.0 as usize].qf_pos;
            if pos == 0 {
                return Ok(None);
            }

            let base = pos & !QUEUE_PAGE_MASK;
            let off = (pos & QUEUE_PAGE_MASK) as usize;
            let buf = self.read_page(base)?;

            if buf[off] != 0 {
                let Some(len) = buf[off..].iter().position(|&b| b == 0) else {
                    bail!("queue page {base:08x} holds an unterminated item");
                };
                let end = off + len;
                let text = String::from_utf8_lossy(&buf[off..end]).into_owned();
                let priority = u32::from_le_bytes(buf[end + 1..end + 5].try_into().unwrap());
                let aux = base + (end + 5) as u32;
                return Ok(Some(QItem {
                    text,
                    priority,
                    aux,
                }));
            }

            // Page exhausted: unlink it and return it to the free list.
            let next = Self::page_next(&buf);
            let host = &mut self.hosts[id.0 as usize];
            host.qf_pos = next;
            if next == 0 {
                host.qf_last = 0;
            }
            self.free_page(base)?;
        }
    }

    pub fn peek_item(&mut self, id: HostId) -> Result<Option<QItem>> {
        self.peek_at(id)
    }

    pub fn dequeue_item(&mut self, id: HostId) -> Result<Option<QItem>> {
        let Some(item) = self.peek_at(id)? else {
            return Ok(None);
        };

        self.hosts[id.0 as usize].qf_pos = item.aux;
        let next = self.peek_at(id)?;
        let host = &mut self.hosts[id.0 as usize];
        match next {
            Some(next) => host.qpriority = next.priority,
            None => {
                host.qf_pos = 0;
                host.qf_last = 0;
                host.qpriority = 0;
            }
        }
        Ok(Some(item))
    }

    pub fn requeue_item(&mut self, id: HostId) -> Result<()> {
        if let Some(item) = self.dequeue_item(id)? {
            self.enqueue_item(id, &item.text, item.priority)?;
        }
        Ok(())
    }

    /// Walks a host's queued items without consuming them.
    pub fn walk_items(&mut self, id: HostId) -> Result<Vec<QItem>> {
        let mut out = Vec::new();
        let mut pos = self.hosts[id.0 as usize].qf_pos;

        while pos != 0 {
            let base = pos & !QUEUE_PAGE_MASK;
            let off = (pos & QUEUE_PAGE_MASK) as usize;
            let buf = self.read_page(base)?;

            if buf[off] != 0 {
                let Some(len) = buf[off..].iter().position(|&b| b == 0) else {
                    bail!("queue page {base:08x} holds an unterminated item");
                };
                let end = off + len;
                let text = String::from_utf8_lossy(&buf[off..end]).into_owned();
                let priority = u32::from_le_bytes(buf[end + 1..end + 5].try_into().unwrap());
                pos = base + (end + 5) as u32;
                out.push(QItem {
                    text,
                    priority,
                    aux: pos,
                });
            } else {
                pos = Self::page_next(&buf);
            }
        }

        Ok(out)
    }

    /*** QNode scheduling ***/

    fn lookup_qnode(&mut self, qkey: QueueKey) -> NodeId {
        if let Some(&id) = self.node_lookup.get(&qkey) {
            return id;
        }
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(QNode {
            qkey,
            qpriority: 0,
            sequence: 0,
            wake_until: 0,
            rec_err_count: 0,
            state: NodeState::Idle,
            epoch: 0,
            hosts: BinaryHeap::new(),
            active_host: None,
        });
        self.node_lookup.insert(qkey, id);
        id
    }

    fn effective_qkey(&self, id: HostId) -> QueueKey {
        let host = &self.hosts[id.0 as usize];
        if host.qkey != 0 {
            host.qkey
        } else {
            (name_hash(&host.name) % self.max_resolvers) + 1
        }
    }

    /// Relinks the qnode a host hangs under after any state change. When
    /// `insert_host` is set the host joins the node's waiting heap first.
    fn relink_qnode(&mut self, host_id: HostId, now: u64, wait_until: u64, insert_host: bool) {
        let qkey = self.effective_qkey(host_id);
        let node_id = self.lookup_qnode(qkey);

        if insert_host {
            let host = &mut self.hosts[host_id.0 as usize];
            host.sequence = self.sequence_counter;
            self.sequence_counter += 1;
            host.epoch += 1;
            let entry = HostEntry {
                qpriority: host.qpriority,
                sequence: host.sequence,
                host: host_id,
                epoch: host.epoch,
            };
            self.nodes[node_id.0 as usize].hosts.push(entry);
        }

        // Decide whether the node may be relinked at all.
        match self.nodes[node_id.0 as usize].state {
            NodeState::Active => {
                if self.nodes[node_id.0 as usize].active_host != Some(host_id) {
                    return;
                }
            }
            NodeState::Waiting => return,
            NodeState::Idle | NodeState::Ready => {}
        }

        // Invalidate any stale heap entries for this node.
        self.nodes[node_id.0 as usize].epoch += 1;
        self.nodes[node_id.0 as usize].active_host = None;

        let best = self.best_waiting_host(node_id);
        let node = &mut self.nodes[node_id.0 as usize];
        let Some((best_pri, _)) = best else {
            node.state = NodeState::Idle;
            return;
        };

        node.qpriority = if qkey < NUM_RESOLVER_KEYS {
            // Resolver slots outrank every real key.
            !0
        } else {
            best_pri
        };
        node.sequence = self.sequence_counter;
        self.sequence_counter += 1;

        if wait_until > now {
            node.state = NodeState::Waiting;
            node.wake_until = wait_until;
            let entry = WaitEntry {
                wake_until: wait_until,
                node: node_id,
                epoch: node.epoch,
            };
            self.waiting.push(entry);
        } else {
            node.state = NodeState::Ready;
            let entry = ReadyEntry {
                qpriority: node.qpriority,
                sequence: node.sequence,
                node: node_id,
                epoch: node.epoch,
            };
            self.ready.push(entry);
        }
    }

    /// Highest-priority live entry of a node's host heap, dropping stale
    /// snapshots on the way.
    fn best_waiting_host(&mut self, node_id: NodeId) -> Option<(u32, HostId)> {
        loop {
            let entry = self.nodes[node_id.0 as usize]
                .hosts
                .peek()
                .map(|e| (e.qpriority, e.host, e.epoch));
            let (pri, host, epoch) = entry?;
            let live = {
                let h = &self.hosts[host.0 as usize];
                h.state == HostState::Waiting && h.epoch == epoch
            };
            if live {
                return Some((pri, host));
            }
            self.nodes[node_id.0 as usize].hosts.pop();
        }
    }

    /// Activates a host whose chain just became non-empty.
    pub fn put_host(&mut self, id: HostId, now: u64) {
        let host = &self.hosts[id.0 as usize];
        if host.state == HostState::Idle && host.qf_pos != 0 {
            self.hosts[id.0 as usize].state = HostState::Waiting;
            self.relink_qnode(id, now, 0, true);
        }
    }

    /// Pops the best ready qnode and its best host. Both become active.
    pub fn dequeue_host(&mut self, _now: u64) -> Option<(HostId, NodeId)> {
        loop {
            let entry = self.ready.pop()?;
            let node = &self.nodes[entry.node.0 as usize];
            if node.state != NodeState::Ready || node.epoch != entry.epoch {
                continue;
            }

            let node_id = entry.node;
            let Some((_, host_id)) = self.best_waiting_host(node_id) else {
                self.nodes[node_id.0 as usize].state = NodeState::Idle;
                continue;
            };
            self.nodes[node_id.0 as usize].hosts.pop();

            let node = &mut self.nodes[node_id.0 as usize];
            node.state = NodeState::Active;
            node.active_host = Some(host_id);
            self.hosts[host_id.0 as usize].state = HostState::Active;
            self.hosts[host_id.0 as usize].epoch += 1;

            return Some((host_id, node_id));
        }
    }

    /// Releases a dequeued host: the qnode waits out `delay`, the host
    /// re-queues if it still has items, and a freshly resolved key moves the
    /// host to its new node.
    pub fn finish_host(&mut self, id: HostId, now: u64, delay: u64, new_qkey: QueueKey) {
        debug_assert_eq!(self.hosts[id.0 as usize].state, HostState::Active);

        if new_qkey != 0 && new_qkey != self.hosts[id.0 as usize].qkey {
            self.relink_qnode(id, now, now, false);
            self.hosts[id.0 as usize].qkey = new_qkey;
        }

        if self.hosts[id.0 as usize].qf_pos == 0 {
            self.hosts[id.0 as usize].state = HostState::Idle;
            self.hosts[id.0 as usize].epoch += 1;
            self.relink_qnode(id, now, now, false);
        } else {
            self.hosts[id.0 as usize].state = HostState::Waiting;
            self.relink_qnode(id, now, now + delay, true);
        }
    }

    /// Moves all due qnodes from the waiting heap to the ready heap and
    /// returns the delay until the next wakeup, if any node still waits.
    pub fn time_step(&mut self, now: u64) -> Option<u64> {
        loop {
            let Some(entry) = self.waiting.peek() else {
                return None;
            };

            let node = &self.nodes[entry.node.0 as usize];
            if node.state != NodeState::Waiting || node.epoch != entry.epoch {
                self.waiting.pop();
                continue;
            }

            if entry.wake_until > now {
                return Some(entry.wake_until - now);
            }

            let entry = self.waiting.pop().unwrap();
            let node = &mut self.nodes[entry.node.0 as usize];
            node.state = NodeState::Ready;
            let ready = ReadyEntry {
                qpriority: node.qpriority,
                sequence: node.sequence,
                node: entry.node,
                epoch: node.epoch,
            };
            self.ready.push(ready);
        }
    }

    pub fn has_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    pub fn hosts(&self) -> impl Iterator<Item = HostId> + '_ {
        (0..self.hosts.len() as u32).map(HostId)
    }

    /*** Persistence ***/

    fn load_hosts(&mut self) -> Result<()> {
        let data = match std::fs::read(&self.host_file_path) {
            Ok(data) if !data.is_empty() => data,
            _ => return Ok(()),
        };

        if data.len() < 12 {
            bail!("host file truncated");
        }
        let magic = u32::from_le_bytes(data[0..4].try_into().unwrap());
        if magic != HOST_FILE_MAGIC {
            bail!("host file has bad magic");
        }
        let count = u32::from_le_bytes(data[4..8].try_into().unwrap());
        self.free_head = u32::from_le_bytes(data[8..12].try_into().unwrap());

        let mut pos = 12usize;
        for _ in 0..count {
            let protocol = data[pos];
            let port = u16::from_le_bytes(data[pos + 1..pos + 3].try_into().unwrap());
            let name_len =
                u16::from_le_bytes(data[pos + 3..pos + 5].try_into().unwrap()) as usize;
            pos += 5;
            let name = String::from_utf8_lossy(&data[pos..pos + name_len]).into_owned();
            pos += name_len;

            let mut words = [0u32; 10];
            for w in &mut words {
                *w = u32::from_le_bytes(data[pos..pos + 4].try_into().unwrap());
                pos += 4;
            }

            let id = self.new_host(protocol, &name, port);
            let host = &mut self.hosts[id.0 as usize];
            host.qf_pos = words[0];
            host.qf_last = words[1];
            host.obj_count = [words[2], words[3], words[4], words[5]];
            host.robot_oid = words[6];
            host.robot_time = words[7];
            host.rec_err_count = words[8];
            host.qkey = words[9];

            let qpriority = u32::from_le_bytes(data[pos..pos + 4].try_into().unwrap());
            pos += 4;
            self.hosts[id.0 as usize].qpriority = qpriority;

            self.put_host(id, 0);
        }

        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.queue_file.sync_data()?;

        let mut data = Vec::new();
        data.extend_from_slice(&HOST_FILE_MAGIC.to_le_bytes());
        data.extend_from_slice(&(self.hosts.len() as u32).to_le_bytes());
        data.extend_from_slice(&self.free_head.to_le_bytes());

        for host in &self.hosts {
            data.push(host.protocol);
            data.extend_from_slice(&host.port.to_le_bytes());
            data.extend_from_slice(&(host.name.len() as u16).to_le_bytes());
            data.extend_from_slice(host.name.as_bytes());
            for w in [
                host.qf_pos,
                host.qf_last,
                host.obj_count[0],
                host.obj_count[1],
                host.obj_count[2],
                host.obj_count[3],
                host.robot_oid,
                host.robot_time,
                host.rec_err_count,
                host.qkey,
                host.qpriority,
            ] {
                data.extend_from_slice(&w.to_le_bytes());
            }
        }

        std::fs::write(&self.host_file_path, data)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> Queue {
        Queue::open(crate::gen_temp_path()).unwrap()
    }

    #[test]
    fn item_chain_fifo() {
        let mut q = queue();
        let h = q.new_host(1, "example.com", 80);

        q.enqueue_item(h, "/a", 5).unwrap();
        q.enqueue_item(h, "/b", 5).unwrap();
        q.enqueue_item(h, "/c", 5).unwrap();

        assert_eq!(q.peek_item(h).unwrap().unwrap().text, "/a");
        assert_eq!(q.dequeue_item(h).unwrap().unwrap().text, "/a");
        assert_eq!(q.dequeue_item(h).unwrap().unwrap().text, "/b");
        assert_eq!(q.dequeue_item(h).unwrap().unwrap().text, "/c");
        assert!(q.dequeue_item(h).unwrap().is_none());
        assert!(!q.host(h).has_items());
        assert_eq!(q.host(h).qpriority, 0);
    }

    #[test]
    fn page_overflow_links_chain() {
        let mut q = queue();
        let h = q.new_host(1, "example.com", 80);

        let long: String = "/".to_string() + &"x".repeat(200);
        for i in 0..50 {
            q.enqueue_item(h, &format!("{long}{i}"), 1).unwrap();
        }

        let items = q.walk_items(h).unwrap();
        assert_eq!(items.len(), 50);
        for (i, item) in items.iter().enumerate() {
            assert_eq!(item.text, format!("{long}{i}"));
        }
    }

    #[test]
    fn freed_pages_are_reused() {
        let mut q = queue();
        let h = q.new_host(1, "example.com", 80);

        let long: String = "/".to_string() + &"y".repeat(500);
        for i in 0..20 {
            q.enqueue_item(h, &format!("{long}{i}"), 1).unwrap();
        }
        while q.dequeue_item(h).unwrap().is_some() {}
        let size_after_drain = q.queue_size;

        for i in 0..20 {
            q.enqueue_item(h, &format!("{long}{i}"), 1).unwrap();
        }
        assert_eq!(q.queue_size, size_after_drain);
    }

    #[test]
    fn queue_fairness_scenario() {
        let mut q = queue();
        let now = 1000u64;

        let h1 = q.new_host(1, "h1.example", 80);
        let h2 = q.new_host(1, "h2.example", 80);
        q.host_mut(h1).qkey = 0x0a00_0001;
        q.host_mut(h2).qkey = 0x0a00_0002;

        q.enqueue_item(h1, "/", 5).unwrap();
        q.put_host(h1, now);
        q.enqueue_item(h2, "/", 3).unwrap();
        q.put_host(h2, now);

        let (first, node1) = q.dequeue_host(now).unwrap();
        assert_eq!(first, h1);
        assert_eq!(q.node_key(node1), 0x0a00_0001);

        q.finish_host(h1, now, 10, 0);

        let (second, _) = q.dequeue_host(now).unwrap();
        assert_eq!(second, h2);
        q.finish_host(h2, now, 10, 0);

        assert!(q.dequeue_host(now).is_none());

        let wait = q.time_step(now).unwrap();
        assert_eq!(wait, 10);

        assert!(q.time_step(now + 10).is_none() || q.has_ready());
        let (third, _) = q.dequeue_host(now + 10).unwrap();
        assert_eq!(third, h1);
    }

    #[test]
    fn resolver_nodes_win() {
        let mut q = queue();
        let now = 0u64;

        let resolved = q.new_host(1, "resolved.example", 80);
        q.host_mut(resolved).qkey = 0x0a00_0001;
        q.enqueue_item(resolved, "/", 1000).unwrap();
        q.put_host(resolved, now);

        let unresolved = q.new_host(1, "unresolved.example", 80);
        q.enqueue_item(unresolved, "/", 1).unwrap();
        q.put_host(unresolved, now);

        let (first, node) = q.dequeue_host(now).unwrap();
        assert_eq!(first, unresolved);
        assert!(q.node_key(node) < NUM_RESOLVER_KEYS);
    }

    #[test]
    fn key_change_moves_host() {
        let mut q = queue();
        let now = 0u64;

        let h = q.new_host(1, "moving.example", 80);
        q.enqueue_item(h, "/", 1).unwrap();
        q.put_host(h, now);

        let (id, node) = q.dequeue_host(now).unwrap();
        assert_eq!(id, h);
        assert!(q.node_key(node) < NUM_RESOLVER_KEYS);

        q.finish_host(h, now, 0, 0x0a0a_0a0a);
        assert_eq!(q.host(h).qkey, 0x0a0a_0a0a);

        let (id, node) = q.dequeue_host(now).unwrap();
        assert_eq!(id, h);
        assert_eq!(q.node_key(node), 0x0a0a_0a0a);
    }

    #[test]
    fn same_key_hosts_share_node() {
        let mut q = queue();
        let now = 0u64;

        let a = q.new_host(1, "a.example", 80);
        let b = q.new_host(1, "b.example", 80);
        q.host_mut(a).qkey = 0x0a00_0001;
        q.host_mut(b).qkey = 0x0a00_0001;

        q.enqueue_item(a, "/", 7).unwrap();
        q.put_host(a, now);
        q.enqueue_item(b, "/", 9).unwrap();
        q.put_host(b, now);

        // Higher priority host first, same node both times.
        let (first, n1) = q.dequeue_host(now).unwrap();
        assert_eq!(first, b);

        // Only one host per key may be active.
        assert!(q.dequeue_host(now).is_none());

        q.dequeue_item(b).unwrap().unwrap();
        q.finish_host(b, now, 0, 0);
        let (second, n2) = q.dequeue_host(now).unwrap();
        assert_eq!(second, a);
        assert_eq!(n1, n2);
    }

    #[test]
    fn idle_host_becomes_idle_after_drain() {
        let mut q = queue();
        let now = 0u64;

        let h = q.new_host(1, "drain.example", 80);
        q.host_mut(h).qkey = 0x0a00_0001;
        q.enqueue_item(h, "/only", 1).unwrap();
        q.put_host(h, now);

        let (id, _) = q.dequeue_host(now).unwrap();
        q.dequeue_item(id).unwrap().unwrap();
        q.finish_host(id, now, 0, 0);

        assert_eq!(q.host(h).state(), HostState::Idle);
        assert!(!q.host(h).has_items());
        assert!(q.dequeue_host(now).is_none());
    }

    #[test]
    fn persistence_roundtrip() {
        let dir = crate::gen_temp_path();
        {
            let mut q = Queue::open(&dir).unwrap();
            let h = q.new_host(1, "keep.example", 8080);
            q.host_mut(h).qkey = 0x7f02_0001;
            q.host_mut(h).robot_oid = 42;
            q.enqueue_item(h, "/kept", 3).unwrap();
            q.put_host(h, 0);
            q.sync().unwrap();
        }

        let mut q = Queue::open(&dir).unwrap();
        let h = q.find_host(1, "keep.example", 8080).unwrap();
        assert_eq!(q.host(h).qkey, 0x7f02_0001);
        assert_eq!(q.host(h).robot_oid, 42);

        let items = q.walk_items(h).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].text, "/kept");
        assert_eq!(items[0].priority, 3);

        let (id, _) = q.dequeue_host(0).unwrap();
        assert_eq!(id, h);
    }
}
