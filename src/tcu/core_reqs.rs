use std::collections::VecDeque;
use std::io::Write;

use super::regs::{ActId, EpId, PrivReg, RegAccess};
use super::tlb::{TlbFlags, PAGE_BITS, PAGE_MASK};
use super::{Irq, Tcu};
use crate::sim::Ctx;

/// Descriptor type field of the CORE_REQ register.
const TYPE_IDLE: u64 = 0;
const TYPE_FOREIGN: u64 = 1;
const TYPE_XLATE: u64 = 2;
const TYPE_RESP: u64 = 3;

#[derive(Debug)]
enum ReqKind {
    /// A transfer waits for the core to resolve a translation.
    Translate { xfer: u64, asid: u16, virt: u64, access: TlbFlags },
    /// A message arrived for an activity other than the running one.
    ForeignRecv { ep: EpId, act: ActId },
}

#[derive(Debug)]
struct Request {
    id: u64,
    kind: ReqKind,
    started: bool,
}

#[derive(Default)]
pub struct Statistics {
    pub reqs: u64,
    pub delays: u64,
    pub fails: u64,
}

/// Upcalls from the TCU to the local core. At most one request is presented
/// through CORE_REQ at a time; the rest wait in arrival order.
pub struct CoreRequests {
    reqs: VecDeque<Request>,
    next_id: u64,
    pub stats: Statistics,
}

impl CoreRequests {
    pub fn new() -> CoreRequests {
        CoreRequests { reqs: VecDeque::new(), next_id: 1, stats: Statistics::default() }
    }

    pub fn is_empty(&self) -> bool {
        self.reqs.is_empty()
    }

    pub fn clear(&mut self) {
        self.reqs.clear();
    }

    pub fn print_stats(&self, writer: &mut dyn Write) -> std::io::Result<()> {
        writeln!(writer, "CoreReqs         {}", self.stats.reqs)?;
        writeln!(writer, "CoreReq Delays   {}", self.stats.delays)?;
        writeln!(writer, "CoreReq Fails    {}", self.stats.fails)?;
        Ok(())
    }
}

impl Tcu {
    pub(crate) fn core_req_translate(
        &mut self,
        xfer: u64,
        asid: u16,
        virt: u64,
        access: TlbFlags,
        ctx: &mut Ctx,
    ) {
        let id = self.core_reqs.next_id;
        self.core_reqs.next_id += 1;
        debug!(target: "TcuCoreReqs", "CoreRequest[{}] = xlate(virt={:#x}, asid={}, access={:?})",
            id, virt, asid, access);
        self.core_reqs.reqs.push_back(Request {
            id,
            kind: ReqKind::Translate { xfer, asid, virt, access },
            started: false,
        });
        self.core_reqs.stats.reqs += 1;
        if self.core_reqs.reqs.len() == 1 {
            self.core_req_start_front(ctx);
        } else {
            self.core_reqs.stats.delays += 1;
        }
    }

    pub(crate) fn core_req_foreign(&mut self, ep: EpId, act: ActId, ctx: &mut Ctx) {
        let id = self.core_reqs.next_id;
        self.core_reqs.next_id += 1;
        debug!(target: "TcuCoreReqs", "CoreRequest[{}] = recvForeign(ep={}, act={})", id, ep, act);
        self.core_reqs.reqs.push_back(Request {
            id,
            kind: ReqKind::ForeignRecv { ep, act },
            started: false,
        });
        self.core_reqs.stats.reqs += 1;
        if self.core_reqs.reqs.len() == 1 {
            self.core_req_start_front(ctx);
        } else {
            self.core_reqs.stats.delays += 1;
        }
    }

    fn core_req_start_front(&mut self, ctx: &mut Ctx) {
        let Some(req) = self.core_reqs.reqs.front_mut() else { return };
        req.started = true;
        let desc = match req.kind {
            ReqKind::ForeignRecv { ep, act } => {
                TYPE_FOREIGN | (u64::from(ep) << 4) | (u64::from(act) << 48)
            }
            ReqKind::Translate { asid, virt, access, .. } => {
                TYPE_XLATE
                    | (u64::from(access.bits() & 0x3) << 4)
                    | (u64::from(asid) << 6)
                    | ((virt >> PAGE_BITS) << 24)
            }
        };
        debug!(target: "TcuCoreReqs", "CoreRequest[{}] started", req.id);
        self.regs.set_priv(PrivReg::CoreReq, desc, RegAccess::Tcu);
        self.set_irq(Irq::CORE_REQ, ctx);
    }

    /// The core wrote a response descriptor into CORE_REQ.
    pub(crate) fn core_req_complete(&mut self, ctx: &mut Ctx) {
        let resp = self.regs.get_priv(PrivReg::CoreReq);
        if resp & 0xF != TYPE_RESP {
            error!(target: "TcuCoreReqs", "CORE_REQ written without response type: {:#x}", resp);
            return;
        }
        let Some(req) = self.core_reqs.reqs.pop_front() else {
            error!(target: "TcuCoreReqs", "core response without pending request");
            return;
        };
        debug!(target: "TcuCoreReqs", "CoreRequest[{}] done", req.id);
        self.regs.set_priv(PrivReg::CoreReq, TYPE_IDLE, RegAccess::Tcu);

        match req.kind {
            ReqKind::Translate { xfer, asid, virt, .. } => {
                let flags = TlbFlags::from_bits_truncate(((resp >> 4) & 0x1F) as u32);
                if flags.is_empty() {
                    self.core_reqs.stats.fails += 1;
                    self.xfer_translate_done(xfer, None, ctx);
                } else {
                    let phys_page = (resp >> 24) << PAGE_BITS;
                    if let Some(tlb) = self.tlb.as_mut() {
                        tlb.insert(virt, asid, phys_page, flags);
                    }
                    let phys = phys_page | (virt & PAGE_MASK);
                    self.xfer_translate_done(xfer, Some(phys), ctx);
                }
            }
            ReqKind::ForeignRecv { .. } => {}
        }

        self.core_req_start_front(ctx);
    }

    /// Drop the translation request belonging to an aborted transfer.
    pub(crate) fn core_req_abort_translate(&mut self, xfer: u64, ctx: &mut Ctx) {
        let Some(pos) = self.core_reqs.reqs.iter().position(
            |r| matches!(r.kind, ReqKind::Translate { xfer: x, .. } if x == xfer),
        ) else {
            return;
        };
        let req = self.core_reqs.reqs.remove(pos).unwrap();
        debug!(target: "TcuCoreReqs", "CoreRequest[{}] aborted", req.id);
        if req.started {
            self.regs.set_priv(PrivReg::CoreReq, TYPE_IDLE, RegAccess::Tcu);
        }
        if pos == 0 {
            self.core_req_start_front(ctx);
        }
    }
}
