use std::collections::VecDeque;
use std::io::Write;

use super::error::Error;
use super::noc::{Header, NocAddr, NocSenderState, Packet, SenderState, HEADER_SIZE};
use super::regs::EpId;
use super::tlb::{Lookup, TlbFlags, PAGE_MASK, PAGE_SIZE};
use super::Tcu;
use crate::sim::{Ctx, Work};

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct XferFlags: u8 {
        /// The transfer collects a message that is sent over the NoC when done.
        const MESSAGE = 1 << 0;
        /// The transfer commits a received message into a ring slot.
        const MSGRECV = 1 << 1;
        /// A translation failure aborts the transfer instead of faulting.
        const NOPF = 1 << 2;
        /// Local addresses are physical.
        const NOXLATE = 1 << 3;
        /// The transfer acts on behalf of a privileged TCU.
        const PRIV = 1 << 4;
    }
}

/// What happens when a transfer completes; the tag replaces the virtual
/// completion callbacks of an inheritance-based design.
#[derive(Debug)]
pub enum TransferKind {
    /// Header plus payload collected from local memory become a MESSAGE
    /// packet to `dest`.
    Send { dest: NocAddr, header: Header },
    /// A received message is committed to its ring slot; afterwards the ring
    /// state is published and the NoC request is answered.
    Recv { ep: EpId, msg_addr: u64, header: Header, reply: NocSenderState, noc_addr: u64, payload: Vec<u8> },
    /// Data of a remote-read response lands in the local data region.
    ReadResult { payload: Vec<u8> },
    /// A chunk collected from local memory becomes a WRITE_REQ to `dest`.
    WriteChunk { dest: NocAddr },
    /// A remote read is served from local memory; the collected bytes form
    /// the response.
    RemoteRead { reply: NocSenderState, noc_addr: u64 },
    /// A remote write commits its payload to local memory, then responds.
    RemoteWrite { reply: NocSenderState, noc_addr: u64, payload: Vec<u8> },
}

impl TransferKind {
    /// Whether the transfer writes local memory (as opposed to reading it).
    fn is_write(&self) -> bool {
        matches!(
            self,
            TransferKind::Recv { .. }
                | TransferKind::ReadResult { .. }
                | TransferKind::RemoteWrite { .. }
        )
    }

    /// Whether the transfer was triggered by a NoC request whose slave port
    /// must be released once the transfer owns a buffer.
    fn is_remote(&self) -> bool {
        matches!(
            self,
            TransferKind::Recv { .. }
                | TransferKind::RemoteRead { .. }
                | TransferKind::RemoteWrite { .. }
        )
    }
}

/// An in-flight logical transfer. Owned by a buffer while running; identified
/// by a TCU-wide monotonic id everywhere else.
#[derive(Debug)]
pub struct Transfer {
    pub id: u64,
    pub kind: TransferKind,
    pub write: bool,
    pub local: u64,
    pub remaining: usize,
    pub buf_offset: usize,
    pub free_slots: usize,
    pub flags: XferFlags,
    pub asid: u16,
    pub result: Error,
    pub trans_pending: bool,
    pub start_cycle: u64,
}

pub struct Buffer {
    pub id: usize,
    pub bytes: Vec<u8>,
    pub xfer: Option<Transfer>,
}

#[derive(Default)]
pub struct Statistics {
    pub reads: u64,
    pub writes: u64,
    pub read_cycles: u64,
    pub write_cycles: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub delays: u64,
    pub pagefaults: u64,
    pub aborts: u64,
}

/// The transfer unit: a pool of fixed-size buffers plus the queue of
/// transfers waiting for one.
pub struct XferUnit {
    bufs: Vec<Buffer>,
    queue: VecDeque<Transfer>,
    next_id: u64,
    pub stats: Statistics,
}

impl XferUnit {
    pub fn new(buf_count: usize, buf_size: usize, tlb_enabled: bool) -> XferUnit {
        // Buffer 0 is reserved for non-faulting transfers; with paging
        // enabled a single buffer would deadlock on nested pagefaults.
        assert!(!tlb_enabled || buf_count >= 2, "paging requires at least 2 buffers");
        let bufs = (0..buf_count)
            .map(|id| Buffer { id, bytes: vec![0; buf_size], xfer: None })
            .collect();
        XferUnit { bufs, queue: VecDeque::new(), next_id: 1, stats: Statistics::default() }
    }

    pub fn buffers(&self) -> &[Buffer] {
        &self.bufs
    }

    fn buffer_of(&self, id: u64) -> Option<usize> {
        self.bufs.iter().position(|b| matches!(&b.xfer, Some(t) if t.id == id))
    }

    /// Pick a buffer for a transfer with the given flags, or `None` if the
    /// transfer has to wait.
    fn allocate(&mut self, tlb_enabled: bool, flags: XferFlags) -> Option<usize> {
        // Message receives are serialized: the ring state is published only
        // at completion, so two receives on one ring could commit slots out
        // of order or overrun unread messages.
        if flags.contains(XferFlags::MSGRECV)
            && self.bufs.iter().any(|b| {
                matches!(&b.xfer, Some(t) if t.flags.contains(XferFlags::MSGRECV))
            })
        {
            return None;
        }

        let start = if !tlb_enabled || flags.contains(XferFlags::NOPF) { 0 } else { 1 };
        self.bufs[start..].iter().position(|b| b.xfer.is_none()).map(|i| i + start)
    }

    pub fn print_stats(&self, writer: &mut dyn Write) -> std::io::Result<()> {
        writeln!(writer, "Xfer Reads       {}", self.stats.reads)?;
        writeln!(writer, "Xfer Writes      {}", self.stats.writes)?;
        writeln!(writer, "Xfer BytesRead   {}", self.stats.bytes_read)?;
        writeln!(writer, "Xfer BytesWrit   {}", self.stats.bytes_written)?;
        writeln!(writer, "Xfer Delays      {}", self.stats.delays)?;
        writeln!(writer, "Xfer Pagefaults  {}", self.stats.pagefaults)?;
        writeln!(writer, "Xfer Aborts      {}", self.stats.aborts)?;
        Ok(())
    }
}

fn decode_flags(flags: XferFlags) -> String {
    let mut s = String::with_capacity(4);
    s.push(if flags.contains(XferFlags::MESSAGE) { 'm' } else { '-' });
    s.push(if flags.contains(XferFlags::MSGRECV) { 'r' } else { '-' });
    s.push(if flags.contains(XferFlags::NOPF) { 'p' } else { '-' });
    s.push(if flags.contains(XferFlags::NOXLATE) { 'x' } else { '-' });
    s
}

impl Tcu {
    /// Create a transfer and schedule its first processing step. For
    /// remote-origin transfers the NoC slave port is released right away;
    /// the request data has been captured already.
    pub(crate) fn start_transfer(
        &mut self,
        kind: TransferKind,
        local: u64,
        size: usize,
        flags: XferFlags,
        delay: u64,
        ctx: &mut Ctx,
    ) -> u64 {
        let id = self.xfer.next_id;
        self.xfer.next_id += 1;

        let write = kind.is_write();
        let remote = kind.is_remote();
        if write {
            self.xfer.stats.bytes_written += size as u64;
        } else {
            self.xfer.stats.bytes_read += size as u64;
        }

        let (act, _) = self.regs.cur_act();
        let t = Transfer {
            id,
            kind,
            write,
            local,
            remaining: size,
            buf_offset: 0,
            free_slots: self.params.req_count,
            flags,
            asid: act,
            result: Error::None,
            trans_pending: false,
            start_cycle: ctx.cycle,
        };
        trace!(target: "TcuXfers", "xfer[{}]: new {} transfer of {} bytes @ {:#x} [flags={}]",
            id, if write { "mem-write" } else { "mem-read" }, size, local, decode_flags(flags));

        self.xfer.queue.push_back(t);
        ctx.sched(self.tile.into(), delay + 1, Work::ProcessTransfer(id));
        if remote {
            ctx.sched(self.tile.into(), 1, Work::NocRequestFinished);
        }
        id
    }

    /// Step the state machine of a transfer: allocate a buffer, translate
    /// the current page, and issue page-bounded memory requests.
    pub(crate) fn xfer_process(&mut self, id: u64, ctx: &mut Ctx) {
        let Some(bi) = self.xfer.buffer_of(id) else {
            if self.xfer.queue.iter().any(|t| t.id == id) {
                self.xfer_try_start(id, ctx);
            }
            // Otherwise the transfer is gone; stale work items are ignored.
            return;
        };

        let t = self.xfer.bufs[bi].xfer.as_ref().unwrap();
        if t.remaining == 0 {
            self.xfer_continue(bi, ctx);
            return;
        }

        let (local, flags, asid, write) = (t.local, t.flags, t.asid, t.write);
        if self.tlb.is_some() && !flags.contains(XferFlags::NOXLATE) {
            // Receive buffers are pinned; writes into them skip the
            // write-permission check.
            let access = if write && !flags.contains(XferFlags::MSGRECV) {
                TlbFlags::WRITE
            } else {
                TlbFlags::READ
            };
            match self.tlb.as_mut().unwrap().lookup(local, asid, access) {
                Lookup::Hit(phys) => self.xfer_issue(bi, phys, ctx),
                res => {
                    if res == Lookup::Pagefault {
                        self.xfer.stats.pagefaults += 1;
                    }
                    // A transfer that must not fault reports the error right
                    // away instead of asking the core for help.
                    if flags.contains(XferFlags::NOPF) {
                        self.xfer_abort(id, Error::Pagefault, ctx);
                    } else {
                        self.xfer.bufs[bi].xfer.as_mut().unwrap().trans_pending = true;
                        self.core_req_translate(id, asid, local, access, ctx);
                    }
                }
            }
        } else {
            self.xfer_issue(bi, local, ctx);
        }
    }

    fn xfer_try_start(&mut self, id: u64, ctx: &mut Ctx) {
        let pos = self.xfer.queue.iter().position(|t| t.id == id).unwrap();
        let flags = self.xfer.queue[pos].flags;
        match self.xfer.allocate(self.tlb.is_some(), flags) {
            Some(bi) => {
                let t = self.xfer.queue.remove(pos).unwrap();
                trace!(target: "TcuXfers", "buf{}: starting transfer xfer[{}]", bi, t.id);
                self.xfer.bufs[bi].xfer = Some(t);
                self.transfer_started(bi);
                ctx.sched(self.tile.into(), 1, Work::ProcessTransfer(id));
                // Another buffer may be free as well; give the next waiting
                // transfer a shot.
                if let Some(next) = self.xfer.queue.front().map(|t| t.id) {
                    ctx.sched(self.tile.into(), 1, Work::ProcessTransfer(next));
                }
            }
            None => {
                trace!(target: "TcuXfers", "xfer[{}]: delaying, no free buffer", id);
                self.xfer.stats.delays += 1;
                // Rotate so another queued transfer gets a shot first.
                let t = self.xfer.queue.remove(pos).unwrap();
                self.xfer.queue.push_back(t);
            }
        }
    }

    /// Copy the prefix a transfer starts out with into its buffer.
    fn transfer_started(&mut self, bi: usize) {
        let Buffer { bytes, xfer, .. } = &mut self.xfer.bufs[bi];
        let t = xfer.as_mut().unwrap();
        match &mut t.kind {
            TransferKind::Send { header, .. } => {
                // The header is assembled directly in the buffer; the payload
                // read from local memory lands behind it.
                header.encode(&mut bytes[..HEADER_SIZE]);
                t.buf_offset = HEADER_SIZE;
            }
            TransferKind::Recv { payload, .. }
            | TransferKind::RemoteWrite { payload, .. }
            | TransferKind::ReadResult { payload } => {
                let data = std::mem::take(payload);
                bytes[..data.len()].copy_from_slice(&data);
            }
            _ => {}
        }
    }

    /// Issue page-bounded, block-aligned memory requests while request slots
    /// are available.
    fn xfer_issue(&mut self, bi: usize, phys: u64, ctx: &mut Ctx) {
        let tile = usize::from(self.tile);
        let block = self.params.block_size as u64;
        let lat = self.params.transfer_to_mem_latency;

        let Buffer { bytes, xfer, id: buf_id } = &mut self.xfer.bufs[bi];
        let t = xfer.as_mut().unwrap();

        let next_page = (t.local + PAGE_SIZE) & !PAGE_MASK;
        let mut page_rem = t.remaining.min((next_page - t.local) as usize);
        let mut phys = phys;

        while t.free_slots > 0 && page_rem > 0 {
            let local_off = (t.local & (block - 1)) as usize;
            let req_size = t.remaining.min(block as usize - local_off).min(page_rem);

            let mut pkt = if t.write {
                Packet::write(phys, bytes[t.buf_offset..t.buf_offset + req_size].to_vec())
            } else {
                Packet::read(phys, req_size)
            };
            pkt.sender = SenderState::Mem { xfer: t.id, offset: t.buf_offset };

            trace!(target: "TcuXfers", "buf{}: {} {} bytes @ {:#x}->{:#x} in local memory",
                buf_id, if t.write { "writing" } else { "reading" }, req_size, t.local, phys);
            ctx.sched(tile, lat, Work::MemRequest(pkt));

            t.local += req_size as u64;
            t.buf_offset += req_size;
            phys += req_size as u64;
            t.remaining -= req_size;
            page_rem -= req_size;
            t.free_slots -= 1;
        }
    }

    /// Called by the core-request path once a translation resolved.
    pub(crate) fn xfer_translate_done(&mut self, id: u64, phys: Option<u64>, ctx: &mut Ctx) {
        let Some(bi) = self.xfer.buffer_of(id) else { return };
        let t = self.xfer.bufs[bi].xfer.as_mut().unwrap();
        // An already-errored transfer was aborted on purpose; the abort path
        // finishes it.
        if t.result != Error::None {
            return;
        }
        t.trans_pending = false;
        let Some(phys) = phys else {
            self.xfer_abort(id, Error::Pagefault, ctx);
            return;
        };
        if t.remaining == 0 {
            return;
        }
        self.xfer_issue(bi, phys, ctx);
    }

    /// A local-memory response arrived, or a synthetic `None` drives the
    /// drain path of an aborted transfer.
    pub(crate) fn xfer_recv_mem_response(&mut self, id: u64, pkt: Option<Packet>, ctx: &mut Ctx) {
        let Some(bi) = self.xfer.buffer_of(id) else {
            trace!(target: "TcuXfers", "ignoring mem response for gone xfer[{}]", id);
            return;
        };

        if let Some(pkt) = pkt {
            let Buffer { bytes, xfer, .. } = &mut self.xfer.bufs[bi];
            let t = xfer.as_mut().unwrap();
            if !t.write {
                if let SenderState::Mem { offset, .. } = pkt.sender {
                    bytes[offset..offset + pkt.data.len()].copy_from_slice(&pkt.data);
                }
            }
            t.free_slots += 1;
            trace!(target: "TcuXfers", "buf{}: mem response (rem={:#x}, slots={}/{})",
                bi, t.remaining, t.free_slots, self.params.req_count);
        }

        self.xfer_continue(bi, ctx);
    }

    fn xfer_continue(&mut self, bi: usize, ctx: &mut Ctx) {
        let req_count = self.params.req_count;
        let t = self.xfer.bufs[bi].xfer.as_ref().unwrap();
        let done = t.result != Error::None || (t.remaining == 0 && t.free_slots == req_count);

        if done {
            let t = self.xfer.bufs[bi].xfer.take().unwrap();
            let data = self.xfer.bufs[bi].bytes[..t.buf_offset].to_vec();
            trace!(target: "TcuXfers", "buf{}: transfer xfer[{}] done ({:?})", bi, t.id, t.result);

            if t.write {
                self.xfer.stats.writes += 1;
                self.xfer.stats.write_cycles += ctx.cycle - t.start_cycle;
            } else {
                self.xfer.stats.reads += 1;
                self.xfer.stats.read_cycles += ctx.cycle - t.start_cycle;
            }
            self.transfer_done(t, data, ctx);

            // Hand the freed buffer to the next waiting transfer.
            if let Some(next) = self.xfer.queue.front().map(|t| t.id) {
                ctx.sched(self.tile.into(), 1, Work::ProcessTransfer(next));
            }
        } else if t.remaining > 0 {
            let id = t.id;
            self.xfer_process(id, ctx);
        }
    }

    /// Abort a transfer: record the error, cancel a pending translation and
    /// let the drain path terminate through a synthetic response. Responses
    /// of requests still in flight are ignored afterwards.
    pub(crate) fn xfer_abort(&mut self, id: u64, error: Error, ctx: &mut Ctx) {
        if let Some(bi) = self.xfer.buffer_of(id) {
            trace!(target: "TcuXfers", "buf{}: aborting transfer xfer[{}] ({:?})", bi, id, error);
            let t = self.xfer.bufs[bi].xfer.as_mut().unwrap();
            t.result = error;
            t.remaining = 0;
            let cancel_trans = std::mem::replace(&mut t.trans_pending, false);
            if cancel_trans {
                self.core_req_abort_translate(id, ctx);
            }
            self.xfer.stats.aborts += 1;
            self.xfer_recv_mem_response(id, None, ctx);
        } else if let Some(pos) = self.xfer.queue.iter().position(|t| t.id == id) {
            let mut t = self.xfer.queue.remove(pos).unwrap();
            t.result = error;
            self.xfer.stats.aborts += 1;
            self.transfer_done(t, Vec::new(), ctx);
        }
    }

    /// Abort every local transfer; received messages are only torn down on
    /// reset. Returns whether all buffers are free afterwards.
    pub(crate) fn xfer_abort_local(&mut self, abort_msgs: bool, ctx: &mut Ctx) -> bool {
        let mut ids = Vec::new();
        for b in &self.xfer.bufs {
            if let Some(t) = &b.xfer {
                let abort = !t.kind.is_remote() || (abort_msgs && t.flags.contains(XferFlags::MSGRECV));
                if abort {
                    ids.push(t.id);
                }
            }
        }
        for t in &self.xfer.queue {
            if !t.kind.is_remote() {
                ids.push(t.id);
            }
        }
        for id in ids {
            self.xfer_abort(id, Error::Abort, ctx);
        }
        self.xfer.bufs.iter().all(|b| b.xfer.is_none())
    }

    /// Dispatch on the kind tag of a finished transfer. `data` holds the
    /// buffer contents accumulated by the transfer.
    fn transfer_done(&mut self, t: Transfer, data: Vec<u8>, ctx: &mut Ctx) {
        let result = t.result;
        match t.kind {
            TransferKind::Send { dest, .. } => self.msg_send_done(result, dest, data, ctx),
            TransferKind::Recv { ep, msg_addr, header, reply, noc_addr, .. } => {
                self.msg_recv_done(ep, msg_addr, header, reply, noc_addr, result, ctx);
            }
            TransferKind::ReadResult { .. } => self.mem_read_chunk_done(result, ctx),
            TransferKind::WriteChunk { dest } => {
                self.mem_write_chunk_collected(result, dest, data, ctx);
            }
            TransferKind::RemoteRead { reply, noc_addr } => {
                self.mem_remote_done(reply, noc_addr, result, data, true, ctx);
            }
            TransferKind::RemoteWrite { reply, noc_addr, .. } => {
                self.mem_remote_done(reply, noc_addr, result, Vec::new(), false, ctx);
            }
        }
    }
}
