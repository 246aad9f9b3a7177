//! Flow table: stable, compact indices for translated connections
//!
//! Flows are entries in a fixed-size table. The whole table is scanned once
//! per loop iteration for deferred bookkeeping, so sparse empty slots would
//! waste time; fully compacting on every free would mean rewriting hash
//! entries and epoll references. The compromise: maximal runs of free slots
//! form "free clusters", each storing its length and the index of the next
//! cluster in its first slot. The cluster chain is kept in strictly
//! increasing index order, so a scan skips every free run in one step and
//! the table is walked in near-live-entry time.
//!
//! Allocation always takes the lowest free index (`first_free`). Freeing is
//! only allowed in two places: cancelling the most recent allocation, and
//! the deferred scan itself, which rebuilds and merges clusters as it walks.
//!
//! A linear-probing hash table maps `(remote address, endpoint port, remote
//! port)` to a flow side so tap packets find their connection; removal uses
//! a backward-shift so probe chains stay intact.

use crate::dataplane::icmp::{IcmpCtx, PingFlow, PING_TIMEOUT};
use crate::dataplane::tcp::TcpConn;
use crate::dataplane::tcp_splice::TcpSpliceConn;
use crate::event::Pif;
use crate::protocol::InAny;
use crate::util::Stamp;
use std::hash::Hasher;
use tracing::{debug, trace};

/// Flow table capacity
pub const FLOW_MAX: u32 = 8192;

/// Hash table sized for a 70% load factor over the flow table
pub const HASH_TABLE_SIZE: usize = (FLOW_MAX as usize) * 100 / 70;

/// Periodic flow timer interval, milliseconds
pub const FLOW_TIMER_INTERVAL_MS: i64 = 1000;

pub const SOCK_SIDE: usize = 0;
pub const TAP_SIDE: usize = 1;

/// One side of a flow in the hash index: flow index plus side bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowSidx {
    pub flow: u32,
    pub side: usize,
}

impl FlowSidx {
    pub fn new(flow: u32, side: usize) -> Self {
        Self { flow, side }
    }
}

/// Addresses and ports for one side of a flow.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlowSide {
    pub endpoint_addr: InAny,
    pub endpoint_port: u16,
    pub forward_addr: InAny,
    pub forward_port: u16,
}

/// Header common to all populated flow variants.
#[derive(Debug, Clone, Copy)]
pub struct FlowCommon {
    pub pif: [Pif; 2],
    pub side: [FlowSide; 2],
}

impl Default for FlowCommon {
    fn default() -> Self {
        Self {
            pif: [Pif::Host, Pif::Host],
            side: [FlowSide::default(), FlowSide::default()],
        }
    }
}

/// First slot of a run of free entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeCluster {
    /// Number of consecutive free slots in this cluster
    pub n: u32,
    /// Index of the next free cluster, FLOW_MAX at the end of the chain
    pub next: u32,
}

/// A flow table slot.
#[derive(Debug)]
pub enum Flow {
    Free(FreeCluster),
    Tcp(TcpConn),
    TcpSplice(TcpSpliceConn),
    Ping4(PingFlow),
    Ping6(PingFlow),
}

impl Flow {
    pub fn type_str(&self) -> &'static str {
        match self {
            Flow::Free(_) => "<none>",
            Flow::Tcp(_) => "TCP connection",
            Flow::TcpSplice(_) => "TCP connection (spliced)",
            Flow::Ping4(_) => "ICMP ping sequence",
            Flow::Ping6(_) => "ICMPv6 ping sequence",
        }
    }

    pub fn tcp(&self) -> Option<&TcpConn> {
        match self {
            Flow::Tcp(c) => Some(c),
            _ => None,
        }
    }

    pub fn tcp_mut(&mut self) -> Option<&mut TcpConn> {
        match self {
            Flow::Tcp(c) => Some(c),
            _ => None,
        }
    }

    pub fn ping_mut(&mut self) -> Option<&mut PingFlow> {
        match self {
            Flow::Ping4(p) | Flow::Ping6(p) => Some(p),
            _ => None,
        }
    }
}

/// Key for the hash index: remote address and port pair as seen on the tap.
fn flow_hash(secret: (u64, u64), faddr: &InAny, eport: u16, fport: u16) -> u64 {
    let mut h = siphasher::sip::SipHasher24::new_with_keys(secret.0, secret.1);
    h.write(&faddr.0);
    h.write_u64((eport as u64) << 16 | fport as u64);
    h.finish()
}

fn mod_sub(a: usize, b: usize, m: usize) -> usize {
    (a + m - b) % m
}

/// True if `x` lies in the cyclic half-open interval [i, j).
fn mod_between(x: usize, i: usize, j: usize, m: usize) -> bool {
    mod_sub(x, i, m) < mod_sub(j, i, m)
}

pub struct FlowTable {
    tab: Vec<Flow>,
    first_free: u32,
    hash: Vec<Option<FlowSidx>>,
    secret: (u64, u64),
    timer_last: Stamp,
}

impl FlowTable {
    pub fn new(secret: (u64, u64)) -> Self {
        let mut tab = Vec::with_capacity(FLOW_MAX as usize);
        tab.push(Flow::Free(FreeCluster {
            n: FLOW_MAX,
            next: FLOW_MAX,
        }));
        for _ in 1..FLOW_MAX {
            tab.push(Flow::Free(FreeCluster { n: 0, next: 0 }));
        }
        Self {
            tab,
            first_free: 0,
            hash: vec![None; HASH_TABLE_SIZE],
            secret,
            timer_last: Stamp::default(),
        }
    }

    pub fn at(&self, idx: u32) -> &Flow {
        &self.tab[idx as usize]
    }

    pub fn at_mut(&mut self, idx: u32) -> &mut Flow {
        &mut self.tab[idx as usize]
    }

    /// TCP connection at a hash side index, if the slot holds one.
    pub fn tcp_at_sidx(&self, sidx: FlowSidx) -> Option<&TcpConn> {
        self.tab[sidx.flow as usize].tcp()
    }

    /// Allocate the lowest free slot.
    ///
    /// The slot must be populated with `set()` (or released again with
    /// `alloc_cancel()`) before control returns to the event loop; until then
    /// no further allocation may be made.
    pub fn alloc(&mut self) -> Option<u32> {
        let idx = self.first_free;
        if idx >= FLOW_MAX {
            return None;
        }

        let Flow::Free(head) = &self.tab[idx as usize] else {
            unreachable!("first_free points at a populated slot");
        };
        let head = *head;
        debug_assert!(head.n >= 1);
        debug_assert!(idx + head.n <= FLOW_MAX);

        if head.n > 1 {
            // Use one entry from the cluster, shorten it
            self.first_free = idx + 1;
            self.tab[idx as usize + 1] = Flow::Free(FreeCluster {
                n: head.n - 1,
                next: head.next,
            });
        } else {
            // Use the entire cluster
            self.first_free = head.next;
        }

        self.tab[idx as usize] = Flow::Free(FreeCluster { n: 0, next: 0 });
        Some(idx)
    }

    /// Release the slot returned by the most recent `alloc()`.
    ///
    /// Restores it as a one-slot cluster at the head of the chain; the next
    /// deferred pass folds adjacent clusters back together.
    pub fn alloc_cancel(&mut self, idx: u32) {
        debug_assert!(self.first_free > idx);
        self.tab[idx as usize] = Flow::Free(FreeCluster {
            n: 1,
            next: self.first_free,
        });
        self.first_free = idx;
    }

    /// Populate a freshly allocated slot.
    pub fn set(&mut self, idx: u32, flow: Flow) {
        trace!(idx, kind = flow.type_str(), "flow start");
        self.tab[idx as usize] = flow;
    }

    /// Count of populated entries (diagnostics, tests).
    pub fn active_count(&self) -> u32 {
        let mut n = 0;
        let mut idx = 0;
        while idx < FLOW_MAX {
            match &self.tab[idx as usize] {
                Flow::Free(f) => idx += f.n.max(1),
                _ => {
                    n += 1;
                    idx += 1;
                }
            }
        }
        n
    }

    /// Deferred per-flow pass: merge free clusters, retire flows whose
    /// deferred hook reports closure, and run periodic per-flow timers when
    /// at least `FLOW_TIMER_INTERVAL_MS` has elapsed.
    pub fn defer_pass(&mut self, now: Stamp, icmp: &mut IcmpCtx) {
        let timer = if now.diff_ms(&self.timer_last) >= FLOW_TIMER_INTERVAL_MS {
            self.timer_last = now;
            true
        } else {
            false
        };

        // head of the free cluster currently being grown, if any
        let mut free_head: Option<u32> = None;
        // where to write the index of the next discovered cluster
        let mut last_next: Option<u32> = None;

        let mut idx: u32 = 0;
        while idx < FLOW_MAX {
            if let Flow::Free(f) = &self.tab[idx as usize] {
                let f = *f;
                let skip = f.n;
                debug_assert!(skip >= 1, "free cluster head with n == 0");

                if let Some(head) = free_head {
                    // Merge into the preceding free cluster
                    if let Flow::Free(h) = &mut self.tab[head as usize] {
                        h.n += f.n;
                        h.next = f.next;
                    }
                    self.tab[idx as usize] = Flow::Free(FreeCluster { n: 0, next: 0 });
                } else {
                    // New cluster: link it from the previous one (or the head)
                    match last_next {
                        None => self.first_free = idx,
                        Some(prev) => {
                            if let Flow::Free(h) = &mut self.tab[prev as usize] {
                                h.next = idx;
                            }
                        }
                    }
                    free_head = Some(idx);
                    last_next = Some(idx);
                }

                idx += skip.max(1);
                continue;
            }

            let closed = match &mut self.tab[idx as usize] {
                Flow::Free(_) => unreachable!(),
                Flow::Tcp(conn) => conn.defer(),
                Flow::TcpSplice(sp) => {
                    let c = sp.defer();
                    if !c && timer {
                        sp.timer(now);
                    }
                    c
                }
                Flow::Ping4(p) | Flow::Ping6(p) => {
                    timer && now.secs - p.ts > PING_TIMEOUT as i64 && p.expire(icmp)
                }
            };

            if closed {
                debug!(idx, kind = self.tab[idx as usize].type_str(), "flow end");
                match free_head {
                    Some(head) => {
                        // Append to the cluster we are growing
                        self.tab[idx as usize] = Flow::Free(FreeCluster { n: 0, next: 0 });
                        if let Flow::Free(h) = &mut self.tab[head as usize] {
                            debug_assert_eq!(head + h.n, idx);
                            h.n += 1;
                        }
                    }
                    None => {
                        self.tab[idx as usize] =
                            Flow::Free(FreeCluster { n: 1, next: FLOW_MAX });
                        match last_next {
                            None => self.first_free = idx,
                            Some(prev) => {
                                if let Flow::Free(h) = &mut self.tab[prev as usize] {
                                    h.next = idx;
                                }
                            }
                        }
                        free_head = Some(idx);
                        last_next = Some(idx);
                    }
                }
            } else {
                free_head = None;
            }

            idx += 1;
        }

        // Terminate the chain
        match last_next {
            None => self.first_free = FLOW_MAX,
            Some(prev) => {
                if let Flow::Free(h) = &mut self.tab[prev as usize] {
                    h.next = FLOW_MAX;
                }
            }
        }
    }

    // --- hash index ---

    fn bucket(&self, faddr: &InAny, eport: u16, fport: u16) -> usize {
        (flow_hash(self.secret, faddr, eport, fport) % HASH_TABLE_SIZE as u64) as usize
    }

    fn conn_key(&self, sidx: FlowSidx) -> Option<(InAny, u16, u16)> {
        let conn = self.tcp_at_sidx(sidx)?;
        Some((conn.faddr(), conn.eport(), conn.fport()))
    }

    /// Find the bucket holding `sidx`, or the free bucket where its key would
    /// be inserted. Linear probing, stepping downward.
    fn probe(&self, sidx: FlowSidx, faddr: &InAny, eport: u16, fport: u16) -> usize {
        let mut b = self.bucket(faddr, eport, fport);
        while let Some(cur) = self.hash[b] {
            if cur == sidx {
                break;
            }
            b = mod_sub(b, 1, HASH_TABLE_SIZE);
        }
        b
    }

    /// Insert the tap side of a TCP connection into the hash index.
    pub fn hash_insert(&mut self, flow: u32, faddr: &InAny, eport: u16, fport: u16) {
        let sidx = FlowSidx::new(flow, TAP_SIDE);
        let b = self.probe(sidx, faddr, eport, fport);
        self.hash[b] = Some(sidx);
        trace!(flow, bucket = b, "hash table insert");
    }

    /// Drop a connection from the hash index, back-shifting the remainder of
    /// the probe cluster so later entries stay reachable.
    pub fn hash_remove(&mut self, flow: u32, faddr: &InAny, eport: u16, fport: u16) {
        let sidx = FlowSidx::new(flow, TAP_SIDE);
        let mut b = self.probe(sidx, faddr, eport, fport);
        if self.hash[b] != Some(sidx) {
            return; // redundant remove
        }
        trace!(flow, bucket = b, "hash table remove");

        let mut s = mod_sub(b, 1, HASH_TABLE_SIZE);
        while let Some(cur) = self.hash[s] {
            if let Some((a, e, f)) = self.conn_key(cur) {
                let h = self.bucket(&a, e, f);
                if !mod_between(h, s, b, HASH_TABLE_SIZE) {
                    // the entry at s can live in b's slot
                    self.hash[b] = self.hash[s];
                    b = s;
                }
            }
            s = mod_sub(s, 1, HASH_TABLE_SIZE);
        }
        self.hash[b] = None;
    }

    /// Look up a connection by remote address and port pair.
    pub fn hash_lookup(&self, faddr: &InAny, eport: u16, fport: u16) -> Option<FlowSidx> {
        let mut b = self.bucket(faddr, eport, fport);
        while let Some(cur) = self.hash[b] {
            if let Some(conn) = self.tcp_at_sidx(cur) {
                if conn.faddr() == *faddr && conn.eport() == eport && conn.fport() == fport {
                    return Some(cur);
                }
            }
            b = mod_sub(b, 1, HASH_TABLE_SIZE);
        }
        None
    }

    /// Free-cluster chain as (index, len) pairs, for tests and diagnostics.
    pub fn free_chain(&self) -> Vec<(u32, u32)> {
        let mut out = Vec::new();
        let mut idx = self.first_free;
        while idx < FLOW_MAX {
            match &self.tab[idx as usize] {
                Flow::Free(f) => {
                    out.push((idx, f.n));
                    idx = f.next;
                }
                _ => break,
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataplane::tcp::TcpConn;
    use std::net::Ipv4Addr;

    fn table() -> FlowTable {
        FlowTable::new((1, 2))
    }

    fn dummy_conn(faddr: InAny, eport: u16, fport: u16) -> TcpConn {
        let mut conn = TcpConn::new(-1);
        conn.set_faddr(faddr);
        conn.set_eport(eport);
        conn.set_fport(fport);
        conn
    }

    fn alloc_tcp(t: &mut FlowTable, port: u16) -> u32 {
        let idx = t.alloc().unwrap();
        let conn = dummy_conn(InAny::from_v4(Ipv4Addr::new(192, 0, 2, 1)), port, 80);
        t.set(idx, Flow::Tcp(conn));
        idx
    }

    fn close_flow(t: &mut FlowTable, idx: u32) {
        if let Flow::Tcp(conn) = t.at_mut(idx) {
            conn.events = crate::dataplane::tcp::CLOSED;
            conn.sock = -1;
            conn.timer = -1;
        }
    }

    fn chain_is_strictly_ascending(t: &FlowTable) -> bool {
        let chain = t.free_chain();
        chain.windows(2).all(|w| w[0].0 < w[1].0)
    }

    fn free_total(t: &FlowTable) -> u32 {
        t.free_chain().iter().map(|(_, n)| n).sum()
    }

    #[test]
    fn test_alloc_ascending() {
        let mut t = table();
        assert_eq!(t.alloc(), Some(0));
        assert_eq!(t.alloc(), Some(1));
        assert_eq!(t.alloc(), Some(2));
    }

    #[test]
    fn test_alloc_cancel_reuses_slot() {
        let mut t = table();
        let a = t.alloc().unwrap();
        t.alloc_cancel(a);
        assert_eq!(t.alloc(), Some(a));
    }

    #[test]
    fn test_gc_free_chain() {
        // Allocate A-E, close B and D, run the deferred pass: the chain
        // becomes [B, D, tail] with strictly ascending links, and the next
        // allocation returns B.
        let mut t = table();
        let mut icmp = IcmpCtx::new();
        let idx: Vec<u32> = (0..5).map(|i| alloc_tcp(&mut t, 1000 + i)).collect();

        close_flow(&mut t, idx[1]);
        close_flow(&mut t, idx[3]);
        t.defer_pass(Stamp::now(), &mut icmp);

        let chain = t.free_chain();
        assert_eq!(chain[0], (idx[1], 1));
        assert_eq!(chain[1], (idx[3], 1));
        assert_eq!(chain[2], (5, FLOW_MAX - 5));
        assert!(chain_is_strictly_ascending(&t));
        assert_eq!(t.alloc(), Some(idx[1]));
    }

    #[test]
    fn test_gc_merges_adjacent_clusters() {
        let mut t = table();
        let mut icmp = IcmpCtx::new();
        let idx: Vec<u32> = (0..4).map(|i| alloc_tcp(&mut t, 2000 + i)).collect();

        // Close 1 and 2: adjacent frees merge with each other; closing 3 as
        // well merges the run into the tail cluster.
        close_flow(&mut t, idx[1]);
        close_flow(&mut t, idx[2]);
        close_flow(&mut t, idx[3]);
        t.defer_pass(Stamp::now(), &mut icmp);

        let chain = t.free_chain();
        assert_eq!(chain, vec![(1, FLOW_MAX - 1)]);
    }

    #[test]
    fn test_free_accounting_invariant() {
        let mut t = table();
        let mut icmp = IcmpCtx::new();
        let idx: Vec<u32> = (0..10).map(|i| alloc_tcp(&mut t, 3000 + i)).collect();
        for &i in &[idx[0], idx[4], idx[5], idx[9]] {
            close_flow(&mut t, i);
        }
        t.defer_pass(Stamp::now(), &mut icmp);

        assert!(chain_is_strictly_ascending(&t));
        assert_eq!(free_total(&t) + t.active_count(), FLOW_MAX);
        assert_eq!(t.active_count(), 6);
    }

    #[test]
    fn test_hash_insert_lookup_remove() {
        let mut t = table();
        let faddr = InAny::from_v4(Ipv4Addr::new(203, 0, 113, 1));
        let idx = t.alloc().unwrap();
        t.set(idx, Flow::Tcp(dummy_conn(faddr, 33000, 443)));

        t.hash_insert(idx, &faddr, 33000, 443);
        let sidx = t.hash_lookup(&faddr, 33000, 443).unwrap();
        assert_eq!(sidx.flow, idx);
        assert_eq!(sidx.side, TAP_SIDE);

        // Only one match per key
        assert!(t.hash_lookup(&faddr, 33000, 444).is_none());

        t.hash_remove(idx, &faddr, 33000, 443);
        assert!(t.hash_lookup(&faddr, 33000, 443).is_none());
    }

    #[test]
    fn test_hash_remove_insert_identical_state() {
        // Fill several colliding-ish entries; removing and reinserting one
        // must leave lookups for all keys working.
        let mut t = table();
        let faddr = InAny::from_v4(Ipv4Addr::new(198, 51, 100, 7));
        let mut flows = Vec::new();
        for p in 0..32u16 {
            let idx = t.alloc().unwrap();
            t.set(idx, Flow::Tcp(dummy_conn(faddr, 40000 + p, 80)));
            t.hash_insert(idx, &faddr, 40000 + p, 80);
            flows.push(idx);
        }

        let victim = flows[13];
        t.hash_remove(victim, &faddr, 40013, 80);
        t.hash_insert(victim, &faddr, 40013, 80);

        for p in 0..32u16 {
            let sidx = t.hash_lookup(&faddr, 40000 + p, 80).unwrap();
            assert_eq!(sidx.flow, flows[p as usize]);
        }
    }

    #[test]
    fn test_table_full() {
        let mut t = table();
        for i in 0..FLOW_MAX {
            assert_eq!(t.alloc(), Some(i));
            t.set(i, Flow::Tcp(dummy_conn(InAny::UNSPECIFIED, i as u16, 1)));
        }
        assert_eq!(t.alloc(), None);
    }
}
