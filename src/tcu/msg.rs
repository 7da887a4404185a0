use std::io::Write;

use super::error::Error;
use super::noc::{
    Header, HeaderFlags, MemCmd, NocAddr, NocFlags, NocPacketType, NocSenderState, Packet,
    SenderState, HEADER_SIZE,
};
use super::regs::{
    Cmd, CmdOp, Ep, EpId, Features, RecvEp, SendEp, SendFlags, UnprivReg, NO_REPLIES,
};
use super::xfer::{TransferKind, XferFlags};
use super::{Irq, Tcu};
use crate::sim::Ctx;

#[derive(Default)]
pub struct Statistics {
    pub sent_bytes: u64,
    pub replied_bytes: u64,
    pub received_bytes: u64,
    /// Received messages dropped because the ring was full.
    pub no_space: u64,
    /// Received messages that targeted a foreign activity.
    pub foreign_act: u64,
}

/// Messaging state of a TCU; the logic lives in the `impl Tcu` below and in
/// the transfer-completion hooks.
pub struct MsgUnit {
    pub stats: Statistics,
}

impl MsgUnit {
    pub fn new() -> MsgUnit {
        MsgUnit { stats: Statistics::default() }
    }

    pub fn print_stats(&self, writer: &mut dyn Write) -> std::io::Result<()> {
        writeln!(writer, "Msg SentBytes    {}", self.stats.sent_bytes)?;
        writeln!(writer, "Msg RepliedBytes {}", self.stats.replied_bytes)?;
        writeln!(writer, "Msg RecvdBytes   {}", self.stats.received_bytes)?;
        writeln!(writer, "Msg NoSpace      {}", self.stats.no_space)?;
        writeln!(writer, "Msg ForeignAct   {}", self.stats.foreign_act)?;
        Ok(())
    }
}

impl Tcu {
    /// Start a SEND or REPLY: resolve the send endpoint, pay a credit and
    /// collect header plus payload into a transfer buffer.
    pub(crate) fn msg_start_transmission(&mut self, cmd: Cmd, ctx: &mut Ctx) {
        let is_reply = cmd.op == CmdOp::Reply;
        let mut epid = cmd.ep;
        let mut hflags = HeaderFlags::REPLY_ENABLED;
        let mut reply_ep = 0u16;
        let mut reply_label = 0u64;
        let mut reply_size = 0u8;

        if is_reply {
            // Replies go out through the use-once endpoint installed when the
            // message arrived.
            let Some(rep) = self.regs.get_recv_ep(epid) else {
                debug!(target: "TcuMsgs", "EP{}: invalid EP for reply", epid);
                self.schedule_finish(1, Error::InvEp, ctx);
                return;
            };
            if rep.reply_eps == NO_REPLIES {
                debug!(target: "TcuMsgs", "EP{}: no reply EPs, cannot reply on msg {:#x}", epid, cmd.arg);
                self.schedule_finish(1, Error::InvEp, ctx);
                return;
            }
            let msgidx = (u64::from(cmd.arg) >> rep.msg_size) as usize;
            if msgidx >= rep.slots() {
                self.schedule_finish(1, Error::InvMsg, ctx);
                return;
            }
            epid = rep.reply_eps + msgidx as EpId;

            let rsep = self.regs.get_send_ep(epid);
            let valid = matches!(&rsep, Some(s) if s.msg_size != 0 && s.flags.contains(SendFlags::REPLY));
            if !valid {
                debug!(target: "TcuMsgs", "EP{}: invalid reply EP. Double reply for msg {:#x}?",
                    epid, cmd.arg);
                self.schedule_finish(1, Error::InvEp, ctx);
                return;
            }
            let rsep = rsep.unwrap();

            // The reply grants the sender its credit back.
            reply_ep = rsep.crd_ep;
            hflags = HeaderFlags::REPLY | HeaderFlags::GRANT_CREDITS;
            if rsep.flags.contains(SendFlags::PF) {
                hflags |= HeaderFlags::PAGEFAULT;
            }
        }

        let Some(mut sep) = self.regs.get_send_ep(epid) else {
            debug!(target: "TcuMsgs", "EP{}: invalid EP", epid);
            self.schedule_finish(1, Error::InvEp, ctx);
            return;
        };
        if sep.msg_size == 0 {
            self.schedule_finish(1, Error::InvEp, ctx);
            return;
        }
        // Reply endpoints cannot be used with SEND.
        if !is_reply && sep.flags.contains(SendFlags::REPLY) {
            self.schedule_finish(1, Error::SendReply, ctx);
            return;
        }
        let (cur_act, _) = self.regs.cur_act();
        if sep.act != cur_act {
            self.schedule_finish(1, Error::ForeignEp, ctx);
            return;
        }

        let (addr, size) = self.regs.data();
        if size + HEADER_SIZE > 1 << sep.msg_size
            || size + HEADER_SIZE > self.params.max_noc_packet_size
        {
            self.schedule_finish(1, Error::OutOfBounds, ctx);
            return;
        }

        let unlim = sep.is_unlimited();
        if !unlim {
            if sep.cur_crd == 0 {
                debug!(target: "TcuMsgs", "EP{}: no credits to send message", epid);
                self.schedule_finish(1, Error::MissCredits, ctx);
                return;
            }
            sep.cur_crd -= 1;
            debug!(target: "TcuCredits", "EP{} paid 1 credit ({} left)", epid, sep.cur_crd);
            self.regs.set_ep(epid, &Ep::Send(sep));
        }

        if !is_reply {
            reply_ep = cmd.arg as u16;
            reply_label = self.regs.get_unpriv(UnprivReg::Arg1);
            reply_size = self.regs.get_recv_ep(reply_ep).map(|r| r.msg_size).unwrap_or(0);
            self.msg.stats.sent_bytes += size as u64;
        } else {
            self.msg.stats.replied_bytes += size as u64;
        }

        let header = Header {
            flags: hflags,
            sender_tile: self.tile as u8,
            // The sentinel suppresses the credit return for unlimited senders.
            sender_ep: if unlim { self.regs.num_eps() as EpId } else { epid },
            reply_ep,
            length: size as u16,
            label: sep.label,
            reply_label,
            reply_size,
        };
        debug!(target: "TcuMsgs", "[{} -> {}] with EP{} of {:#x}:{}",
            if is_reply { "rp" } else { "sd" }, sep.target_tile, epid, addr, size);

        let dest = NocAddr::new(sep.target_tile, u64::from(sep.target_ep));
        let kind = TransferKind::Send { dest, header };
        let mut tflags = XferFlags::MESSAGE;
        if cmd.nopf {
            tflags |= XferFlags::NOPF;
        }
        let id = self.start_transfer(
            kind,
            addr,
            size,
            tflags,
            self.params.start_msg_transfer_delay,
            ctx,
        );
        self.cmd_xfer = Some(id);
    }

    /// The local collect-transfer of a SEND/REPLY finished; emit the packet.
    pub(crate) fn msg_send_done(
        &mut self,
        result: Error,
        dest: NocAddr,
        data: Vec<u8>,
        ctx: &mut Ctx,
    ) {
        self.cmd_xfer = None;
        if result != Error::None {
            self.schedule_finish(1, result, ctx);
            return;
        }
        let pkt = Packet {
            addr: dest.to_raw(),
            size: data.len(),
            cmd: MemCmd::WriteReq,
            data,
            sender: SenderState::Noc(NocSenderState {
                ptype: NocPacketType::Message,
                origin: self.tile,
                cmd_id: self.cmd_id,
                flags: NocFlags::empty(),
                result: Error::None,
            }),
        };
        self.cmd_sent = true;
        self.send_noc_request(pkt, self.params.cmd_to_noc_latency, ctx);
    }

    /// A MESSAGE packet arrived over the NoC.
    pub(crate) fn msg_recv_from_noc(&mut self, pkt: Packet, noc: NocSenderState, ctx: &mut Ctx) {
        let Some(header) = Header::decode(&pkt.data) else {
            error!(target: "TcuMsgs", "dropping runt message of {} bytes", pkt.data.len());
            self.send_noc_response_for(pkt, noc, Error::InvMsg, Vec::new(), ctx);
            return;
        };
        self.msg.stats.received_bytes += u64::from(header.length);

        let ep = NocAddr::from_raw(pkt.addr).offset as EpId;
        debug!(target: "TcuMsgs", "[rv <- {}] {} bytes on EP{}",
            header.sender_tile, header.length, ep);

        let granting_reply =
            header.flags.contains(HeaderFlags::REPLY | HeaderFlags::GRANT_CREDITS);

        // Credit receives without a stored reply message.
        if usize::from(ep) >= self.regs.num_eps()
            && granting_reply
            && usize::from(header.reply_ep) < self.regs.num_eps()
        {
            self.msg_recv_credits(header.reply_ep);
            self.send_noc_response_for(pkt, noc, Error::None, Vec::new(), ctx);
            self.wakeup_core(None, ctx);
            return;
        }

        let Some(rep) = self.regs.get_recv_ep(ep) else {
            let err = if granting_reply { Error::RecvGone } else { Error::InvEp };
            debug!(target: "TcuMsgs", "EP{}: not a receive EP ({:?})", ep, err);
            self.send_noc_response_for(pkt, noc, err, Vec::new(), ctx);
            return;
        };
        if pkt.data.len() > rep.slot_size() as usize {
            self.send_noc_response_for(pkt, noc, Error::OutOfBounds, Vec::new(), ctx);
            return;
        }

        let Some(idx) = self.msg_alloc_slot(ep) else {
            debug!(target: "TcuMsgs", "EP{}: ignoring message: no space left", ep);
            self.msg.stats.no_space += 1;
            self.send_noc_response_for(pkt, noc, Error::NoRingSpace, Vec::new(), ctx);
            return;
        };

        // Message receives never fault; the ring is pinned.
        let mut rflags = XferFlags::MSGRECV | XferFlags::NOPF;
        if noc.flags.contains(NocFlags::PRIV) {
            rflags |= XferFlags::PRIV;
        }
        let msg_addr = rep.buf_addr + (idx as u64) * rep.slot_size();
        let size = pkt.data.len();
        let kind = TransferKind::Recv {
            ep,
            msg_addr,
            header,
            reply: noc,
            noc_addr: pkt.addr,
            payload: pkt.data,
        };
        self.start_transfer(kind, msg_addr, size, rflags, self.params.noc_to_transfer_latency, ctx);
    }

    /// First-fit slot allocation starting at the write position.
    fn msg_alloc_slot(&mut self, ep: EpId) -> Option<usize> {
        let mut rep = self.regs.get_recv_ep(ep)?;
        let slots = rep.slots();
        let idx = (0..slots)
            .map(|i| (usize::from(rep.wr_pos) + i) % slots)
            .find(|&i| !rep.is_occupied(i))?;
        rep.set_occupied(idx, true);
        rep.wr_pos = ((idx + 1) % slots) as u8;
        debug!(target: "TcuMsgs", "EP{}: put message at index {}", ep, idx);
        self.regs.set_ep(ep, &Ep::Receive(rep));
        Some(idx)
    }

    /// The ring-slot transfer of a received message finished; publish the
    /// ring state and answer the NoC request.
    pub(crate) fn msg_recv_done(
        &mut self,
        ep: EpId,
        msg_addr: u64,
        header: Header,
        mut reply: NocSenderState,
        noc_addr: u64,
        result: Error,
        ctx: &mut Ctx,
    ) {
        reply.result = self.msg_finish_receive(ep, msg_addr, &header, result, ctx);
        let resp = Packet {
            addr: noc_addr,
            size: 0,
            cmd: MemCmd::WriteResp,
            data: Vec::new(),
            sender: SenderState::Noc(reply),
        };
        self.send_noc_response(resp, ctx);
    }

    fn msg_finish_receive(
        &mut self,
        ep: EpId,
        msg_addr: u64,
        header: &Header,
        result: Error,
        ctx: &mut Ctx,
    ) -> Error {
        let Some(mut rep) = self.regs.get_recv_ep(ep) else { return Error::InvEp };
        let Some(idx) = rep.msg_to_idx(msg_addr) else { return Error::InvMsg };

        if result != Error::None {
            rep.set_occupied(idx, false);
            self.regs.set_ep(ep, &Ep::Receive(rep));
            return result;
        }

        // The reply endpoint id in the header is the id of *our* sending EP.
        if header.flags.contains(HeaderFlags::REPLY | HeaderFlags::GRANT_CREDITS)
            && usize::from(header.reply_ep) < self.regs.num_eps()
        {
            self.msg_recv_credits(header.reply_ep);
        }

        if !header.flags.contains(HeaderFlags::REPLY) && rep.reply_eps != NO_REPLIES {
            // Install the use-once reply EP bound to this slot.
            let mut flags = SendFlags::REPLY;
            if header.flags.contains(HeaderFlags::PAGEFAULT) {
                flags |= SendFlags::PF;
            }
            let sep = SendEp {
                act: rep.act,
                target_tile: u16::from(header.sender_tile),
                target_ep: header.reply_ep,
                label: header.reply_label,
                msg_size: header.reply_size,
                max_crd: 1,
                cur_crd: 1,
                crd_ep: header.sender_ep,
                flags,
            };
            self.regs.set_ep(rep.reply_eps + idx as EpId, &Ep::Send(sep));
        }

        rep.set_unread(idx, true);
        debug!(target: "TcuMsgs", "EP{}: increment message count to {}", ep, rep.msg_count());
        let act = rep.act;
        self.regs.set_ep(ep, &Ep::Receive(rep));

        let (cur_act, _) = self.regs.cur_act();
        if act != cur_act {
            // The running activity must not observe this message; let the
            // core sort it out.
            self.msg.stats.foreign_act += 1;
            self.core_req_foreign(ep, act, ctx);
        } else {
            self.regs.add_msg();
            if self.regs.has_feature(Features::IRQ_ON_MSG) {
                self.set_irq(Irq::MSG, ctx);
            } else {
                self.wakeup_core(Some(ep), ctx);
            }
        }
        Error::None
    }

    pub(crate) fn msg_recv_credits(&mut self, ep: EpId) {
        let Some(mut sep) = self.regs.get_send_ep(ep) else { return };
        if !sep.is_unlimited() {
            sep.cur_crd = (sep.cur_crd + 1).min(sep.max_crd);
            debug!(target: "TcuCredits", "EP{} received 1 credit ({} in total)", ep, sep.cur_crd);
            self.regs.set_ep(ep, &Ep::Send(sep));
        }
    }

    /// Fetch the oldest unread message; returns its absolute address or the
    /// all-ones sentinel when the ring has none.
    pub(crate) fn msg_fetch(&mut self, ep: EpId) -> u64 {
        let Some(mut rep) = self.regs.get_recv_ep(ep) else { return u64::MAX };
        if rep.msg_count() == 0 {
            return u64::MAX;
        }
        let slots = rep.slots();
        let idx = (0..slots)
            .map(|i| (usize::from(rep.rd_pos) + i) % slots)
            .find(|&i| rep.is_unread(i))
            .unwrap();
        debug_assert!(rep.is_occupied(idx));

        rep.set_unread(idx, false);
        rep.rd_pos = ((idx + 1) % slots) as u8;
        debug!(target: "TcuMsgs", "EP{}: fetched message at index {} (count={})",
            ep, idx, rep.msg_count());
        let addr = rep.buf_addr + (idx as u64) * rep.slot_size();
        let act = rep.act;
        self.regs.set_ep(ep, &Ep::Receive(rep));
        let (cur_act, _) = self.regs.cur_act();
        if act == cur_act {
            self.regs.rem_msg();
        }
        addr
    }

    /// Release the slot of the message at `offset` into the ring buffer and
    /// invalidate its reply EP.
    pub(crate) fn msg_ack(&mut self, ep: EpId, offset: u64) -> Error {
        let Some(mut rep) = self.regs.get_recv_ep(ep) else { return Error::InvEp };
        let idx = (offset >> rep.msg_size) as usize;
        if idx >= rep.slots() || !rep.is_occupied(idx) {
            return Error::InvMsg;
        }

        rep.set_occupied(idx, false);
        let was_unread = rep.is_unread(idx);
        if was_unread {
            rep.set_unread(idx, false);
        }
        let (act, reply_eps) = (rep.act, rep.reply_eps);
        debug!(target: "TcuMsgs", "EP{}: acked msg at index {}", ep, idx);
        self.regs.set_ep(ep, &Ep::Receive(rep));

        if reply_eps != NO_REPLIES {
            self.regs.invalidate_ep(reply_eps + idx as EpId);
        }
        if was_unread {
            let (cur_act, _) = self.regs.cur_act();
            if act == cur_act {
                self.regs.rem_msg();
            }
        }
        Error::None
    }

    /// Invalidate reply EPs of a gone sender (external INV_REPLY command).
    pub(crate) fn msg_invalidate_reply(&mut self, rep_id: EpId, tile: u16, sep_id: EpId) -> Error {
        let Some(rep) = self.regs.get_recv_ep(rep_id) else { return Error::InvEp };
        if rep.reply_eps == NO_REPLIES {
            return Error::InvEp;
        }
        for i in 0..rep.slots() {
            let ep = rep.reply_eps + i as EpId;
            if let Some(sep) = self.regs.get_send_ep(ep) {
                if sep.target_tile == tile && sep.crd_ep == sep_id {
                    self.regs.invalidate_ep(ep);
                }
            }
        }
        Error::None
    }

    /// Roll back the credit taken by a failed SEND (everything but a credit
    /// miss took one).
    pub(crate) fn msg_finish_send(&mut self, error: Error, ep: EpId) {
        let Some(mut sep) = self.regs.get_send_ep(ep) else { return };
        if !sep.is_unlimited() && error != Error::None && error != Error::MissCredits {
            sep.cur_crd = (sep.cur_crd + 1).min(sep.max_crd);
            debug!(target: "TcuCredits", "EP{}: credit restored after {:?} ({} now)",
                ep, error, sep.cur_crd);
            self.regs.set_ep(ep, &Ep::Send(sep));
        }
    }
}

/// Check the structural invariants of a receive EP; used by tests.
pub fn check_recv_invariants(rep: &RecvEp) {
    assert_eq!(rep.msg_count(), rep.unread.count_ones());
    assert_eq!(rep.unread & !rep.occupied, 0, "unread slot that is not occupied");
    assert!(rep.occupied.count_ones() <= rep.slots() as u32);
}
