use std::path::PathBuf;
use std::process;

use mtp_gadget::dirfs::DirFs;
use mtp_gadget::ffs::{configure_gadget, FunctionFsPipe, GadgetConfig};
use mtp_gadget::{EventSink, Server, ServerConfig, StopToken, StorageBackend};

fn main() {
    env_logger::init();

    let mut configfs = PathBuf::from("/sys/kernel/config/usb_gadget/mtp");
    let mut ffs = PathBuf::from("/dev/ffs-mtp");
    let mut udc = String::new();
    let mut root = PathBuf::from(".");
    let mut config = ServerConfig::default();

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--configfs" => configfs = next_value(&mut args, "--configfs").into(),
            "--ffs" => ffs = next_value(&mut args, "--ffs").into(),
            "--udc" => udc = next_value(&mut args, "--udc"),
            "--root" => root = next_value(&mut args, "--root").into(),
            "--vid" => config.vid = parse_hex16(&next_value(&mut args, "--vid")),
            "--pid" => config.pid = parse_hex16(&next_value(&mut args, "--pid")),
            "--help" | "-h" => {
                eprintln!("Usage: mtp-gadget [OPTIONS] --udc <NAME>");
                eprintln!();
                eprintln!("Serve a directory tree to a USB host over MTP.");
                eprintln!();
                eprintln!("Options:");
                eprintln!("  --configfs <DIR>  Gadget configfs directory");
                eprintln!("                    (default: /sys/kernel/config/usb_gadget/mtp)");
                eprintln!("  --ffs <DIR>       FunctionFS mountpoint (default: /dev/ffs-mtp)");
                eprintln!("  --udc <NAME>      UDC to bind (see /sys/class/udc)");
                eprintln!("  --root <DIR>      Directory to serve (default: .)");
                eprintln!("  --vid <HEX>       Vendor id (default: 0x057e)");
                eprintln!("  --pid <HEX>       Product id (default: 0x201d)");
                eprintln!();
                eprintln!("Environment:");
                eprintln!("  RUST_LOG=info    Show session lifecycle");
                eprintln!("  RUST_LOG=debug   Show every operation");
                process::exit(0);
            }
            other => {
                eprintln!("unexpected argument: {other}");
                process::exit(1);
            }
        }
    }

    if udc.is_empty() {
        eprintln!("--udc is required (see /sys/class/udc)");
        process::exit(1);
    }

    let mut gadget = GadgetConfig::new(configfs, ffs, &udc);
    gadget.vid = config.vid;
    gadget.pid = config.pid;

    if let Err(e) = configure_gadget(&gadget, &config.identity) {
        eprintln!("gadget setup failed: {e}");
        process::exit(1);
    }

    let stop = StopToken::new();
    let pipe = match FunctionFsPipe::open(gadget, stop.clone()) {
        Ok(pipe) => pipe,
        Err(e) => {
            eprintln!("functionfs open failed: {e}");
            process::exit(1);
        }
    };

    let (events, rx) = EventSink::channel(64);
    let server = Server::start(
        Box::new(pipe),
        config,
        vec![StorageBackend {
            storage_id: 0x0001_0001,
            backend: Box::new(DirFs::new("", "Shared Storage", root)),
        }],
        events,
        stop,
    );

    eprintln!("==> Serving. Progress follows; ctrl-c to quit.");
    for event in rx {
        println!("{event:?}");
    }

    server.stop();
}

fn next_value(args: &mut impl Iterator<Item = String>, flag: &str) -> String {
    args.next().unwrap_or_else(|| {
        eprintln!("{flag} requires a value");
        process::exit(1);
    })
}

fn parse_hex16(s: &str) -> u16 {
    let trimmed = s.trim_start_matches("0x");
    u16::from_str_radix(trimmed, 16).unwrap_or_else(|_| {
        eprintln!("expected a hex id, got {s}");
        process::exit(1);
    })
}
