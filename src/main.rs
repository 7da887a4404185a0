#[macro_use]
extern crate log;

use tilesim::config::Config;
use tilesim::sim::System;
use tilesim::tcu::noc::{Header, HEADER_SIZE};
use tilesim::tcu::regs::{
    Cmd, CmdOp, Ep, RecvEp, SendEp, SendFlags, UnprivReg, INVALID_ACT, NO_REPLIES,
};
use tilesim::tcu::error::Error;

macro_rules! usage_string {
    () => {
        "Usage: {} [options]
Options:
  --config <file>       Load the system configuration from a TOML file.
  --stats               Print per-tile statistics after the run.
  --help                Display this help message.
"
    };
}

fn data_reg(addr: u64, size: usize) -> u64 {
    addr | ((size as u64) << 32)
}

/// Run a ping/reply exchange between two tiles and report the outcome.
fn run_demo(config: &Config, stats: bool) {
    let mut sys = System::new(config);
    let (ping, pong) = (0usize, 1usize);

    // Tile 0 sends through EP2 and receives the reply on EP3; tile 1
    // receives on EP4 with reply EPs starting at EP5.
    sys.set_ep(ping, 2, Ep::Send(SendEp {
        act: INVALID_ACT,
        target_tile: pong as u16,
        target_ep: 4,
        label: 0x1234,
        msg_size: 7,
        max_crd: 1,
        cur_crd: 1,
        crd_ep: 0,
        flags: SendFlags::empty(),
    }));
    sys.set_ep(ping, 3, Ep::Receive(RecvEp {
        act: INVALID_ACT,
        buf_addr: 0x4000,
        size: 1,
        msg_size: 7,
        reply_eps: NO_REPLIES,
        occupied: 0,
        unread: 0,
        rd_pos: 0,
        wr_pos: 0,
    }));
    sys.set_ep(pong, 4, Ep::Receive(RecvEp {
        act: INVALID_ACT,
        buf_addr: 0x1000,
        size: 2,
        msg_size: 7,
        reply_eps: 5,
        occupied: 0,
        unread: 0,
        rd_pos: 0,
        wr_pos: 0,
    }));

    let payload = b"hello across the NoC";
    sys.write_mem(ping, 0x100, payload);
    sys.cpu_write_unpriv(ping, UnprivReg::Data, data_reg(0x100, payload.len()));
    sys.cpu_write_unpriv(ping, UnprivReg::Arg1, 0xBEEF);
    sys.cpu_write_unpriv(
        ping,
        UnprivReg::Command,
        Cmd { op: CmdOp::Send, ep: 2, nopf: false, error: Error::None, arg: 3 }.to_reg(),
    );
    sys.run();

    let cmd = Cmd::from_reg(sys.cpu_read_unpriv(ping, UnprivReg::Command));
    info!("send finished after {} cycles: {:?}", sys.cycle(), cmd.error);

    // The receiver fetches the message and replies.
    sys.cpu_write_unpriv(
        pong,
        UnprivReg::Command,
        Cmd { op: CmdOp::FetchMsg, ep: 4, nopf: false, error: Error::None, arg: 0 }.to_reg(),
    );
    sys.run();
    let msg_addr = sys.cpu_read_unpriv(pong, UnprivReg::Arg1);
    let raw = sys.read_mem(pong, msg_addr, HEADER_SIZE + payload.len());
    let header = Header::decode(&raw).unwrap();
    info!(
        "tile {} received {} bytes (label {:#x}): {:?}",
        pong,
        header.length,
        header.label,
        String::from_utf8_lossy(&raw[HEADER_SIZE..])
    );

    let reply = b"pong";
    sys.write_mem(pong, 0x300, reply);
    sys.cpu_write_unpriv(pong, UnprivReg::Data, data_reg(0x300, reply.len()));
    sys.cpu_write_unpriv(
        pong,
        UnprivReg::Command,
        Cmd {
            op: CmdOp::Reply,
            ep: 4,
            nopf: false,
            error: Error::None,
            arg: (msg_addr - 0x1000) as u32,
        }
        .to_reg(),
    );
    sys.run();

    let cmd = Cmd::from_reg(sys.cpu_read_unpriv(pong, UnprivReg::Command));
    info!("reply finished after {} cycles: {:?}", sys.cycle(), cmd.error);
    let crd = sys.tcu(ping).regs.get_send_ep(2).map(|ep| ep.cur_crd);
    info!("tile {} has {:?} credits again", ping, crd);

    if stats {
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        for tile in 0..config.tiles {
            sys.tcu(tile).print_stats(&mut out).unwrap();
        }
    }
}

fn main() {
    pretty_env_logger::init();

    let mut args = std::env::args();
    let prog = args.next().unwrap();

    let mut config: Option<Config> = None;
    let mut stats = false;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                let path = match args.next() {
                    Some(path) => path,
                    None => {
                        eprintln!("{}: --config requires an argument", prog);
                        std::process::exit(1);
                    }
                };
                let content = match std::fs::read_to_string(&path) {
                    Ok(content) => content,
                    Err(err) => {
                        eprintln!("{}: cannot read {}: {}", prog, path, err);
                        std::process::exit(1);
                    }
                };
                match toml::from_str(&content) {
                    Ok(cfg) => config = Some(cfg),
                    Err(err) => {
                        eprintln!("{}: invalid config: {}", prog, err);
                        std::process::exit(1);
                    }
                }
            }
            "--stats" => stats = true,
            "--help" => {
                eprintln!(usage_string!(), prog);
                return;
            }
            _ => {
                eprintln!(usage_string!(), prog);
                std::process::exit(1);
            }
        }
    }

    let config = config.unwrap_or_default();
    assert!(config.tiles >= 2, "the demo needs at least two tiles");
    run_demo(&config, stats);
}
