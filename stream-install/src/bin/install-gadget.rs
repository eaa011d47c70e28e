use std::path::PathBuf;
use std::process;

use mtp_gadget::ffs::{configure_gadget, FunctionFsPipe, GadgetConfig};
use mtp_gadget::{EventSink, ServerConfig, SessionEvent, StopToken};
use stream_install::store::{DirContentStore, MemoryTitleKeeper};
use stream_install::{ImageMode, InstallServer, InstallServerOptions};

fn main() {
    env_logger::init();

    let mut configfs = PathBuf::from("/sys/kernel/config/usb_gadget/mtp");
    let mut ffs = PathBuf::from("/dev/ffs-mtp");
    let mut udc = String::new();
    let mut store_dir = PathBuf::from("./contents");
    let mut image_mode = ImageMode::Pull;
    let config = ServerConfig::default();

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--configfs" => configfs = next_value(&mut args, "--configfs").into(),
            "--ffs" => ffs = next_value(&mut args, "--ffs").into(),
            "--udc" => udc = next_value(&mut args, "--udc"),
            "--store" => store_dir = next_value(&mut args, "--store").into(),
            "--buffered-image" => image_mode = ImageMode::Buffered,
            "--help" | "-h" => {
                eprintln!("Usage: install-gadget [OPTIONS] --udc <NAME>");
                eprintln!();
                eprintln!("Present a virtual install volume over MTP; archives written");
                eprintln!("to it stream straight into the content store.");
                eprintln!();
                eprintln!("Options:");
                eprintln!("  --configfs <DIR>   Gadget configfs directory");
                eprintln!("  --ffs <DIR>        FunctionFS mountpoint (default: /dev/ffs-mtp)");
                eprintln!("  --udc <NAME>       UDC to bind (see /sys/class/udc)");
                eprintln!("  --store <DIR>      Content store directory (default: ./contents)");
                eprintln!("  --buffered-image   Reassemble disk images in the write path");
                eprintln!("                     instead of the pull-mode consumer thread");
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

    let store = DirContentStore::new(&store_dir).unwrap_or_else(|e| {
        eprintln!("content store at {} failed: {e}", store_dir.display());
        process::exit(1);
    });

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
    let server = InstallServer::start(
        Box::new(pipe),
        InstallServerOptions {
            config,
            image_mode,
            store: Box::new(store),
            keeper: Box::new(MemoryTitleKeeper::new()),
            events,
        },
        stop,
    );

    eprintln!("==> Ready. Copy an archive onto the Install volume.");
    for event in rx {
        match event {
            SessionEvent::WriteProgress { offset, size } => {
                let (received, total) = server.manager().progress();
                if total > 0 {
                    eprint!(
                        "\r{:>3}% ({} / {} bytes)",
                        received * 100 / total,
                        received,
                        total
                    );
                }
                let _ = (offset, size);
            }
            SessionEvent::WriteEnd { path } => {
                eprintln!();
                match server.manager().title_id() {
                    Some(id) => eprintln!("installed {path} (title {id:016x})"),
                    None => eprintln!("finished {path}"),
                }
            }
            other => log::debug!("{other:?}"),
        }
    }

    server.stop();
}

fn next_value(args: &mut impl Iterator<Item = String>, flag: &str) -> String {
    args.next().unwrap_or_else(|| {
        eprintln!("{flag} requires a value");
        process::exit(1);
    })
}
