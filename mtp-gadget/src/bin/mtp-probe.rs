//! Host-side smoke test: find the gadget on the USB bus, open a session
//! and list its storages. Useful for checking enumeration and framing
//! without an MTP-capable file manager.

use std::process;
use std::time::Duration;

use rusb::{Context, DeviceHandle, UsbContext};

use mtp_gadget::protocol::{
    read_u16_le, read_u32_le, CONTAINER_COMMAND, CONTAINER_DATA, CONTAINER_RESPONSE,
    OP_GET_STORAGE_IDS, OP_OPEN_SESSION, RSP_OK,
};

const DEFAULT_VID: u16 = 0x057E;
const DEFAULT_PID: u16 = 0x201D;
const INTERFACE: u8 = 0;
const EP_IN: u8 = 0x81;
const EP_OUT: u8 = 0x02;
const TIMEOUT: Duration = Duration::from_secs(2);

fn main() {
    env_logger::init();

    let mut vid = DEFAULT_VID;
    let mut pid = DEFAULT_PID;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--vid" => vid = parse_hex16(args.next().as_deref().unwrap_or("")),
            "--pid" => pid = parse_hex16(args.next().as_deref().unwrap_or("")),
            "--help" | "-h" => {
                eprintln!("Usage: mtp-probe [--vid HEX] [--pid HEX]");
                eprintln!();
                eprintln!("Open a session on an attached MTP gadget and list storages.");
                process::exit(0);
            }
            other => {
                eprintln!("unexpected argument: {other}");
                process::exit(1);
            }
        }
    }

    let handle = open(vid, pid).unwrap_or_else(|e| {
        eprintln!("error: {e}");
        process::exit(1);
    });

    // OpenSession(session=1)
    transact(&handle, OP_OPEN_SESSION, 0, &[1]).unwrap_or_else(|e| {
        eprintln!("OpenSession failed: {e}");
        process::exit(1);
    });
    eprintln!("session open");

    // GetStorageIds
    let data = transact(&handle, OP_GET_STORAGE_IDS, 1, &[]).unwrap_or_else(|e| {
        eprintln!("GetStorageIds failed: {e}");
        process::exit(1);
    });
    let count = read_u32_le(&data, 0).unwrap_or(0) as usize;
    print!("{count} storage(s):");
    for i in 0..count {
        if let Some(id) = read_u32_le(&data, 4 + i * 4) {
            print!(" {id:#010x}");
        }
    }
    println!();
}

/// Scan the bus for the gadget, open it and claim the PTP interface.
fn open(vid: u16, pid: u16) -> rusb::Result<DeviceHandle<Context>> {
    let ctx = Context::new()?;
    let device = ctx
        .devices()?
        .iter()
        .find(|dev| {
            dev.device_descriptor()
                .map(|d| d.vendor_id() == vid && d.product_id() == pid)
                .unwrap_or(false)
        })
        .ok_or(rusb::Error::NoDevice)?;

    let handle = device.open()?;
    let _ = handle.set_auto_detach_kernel_driver(true);
    handle.claim_interface(INTERFACE)?;

    log::info!(
        "opened gadget (bus {:03} dev {:03})",
        device.bus_number(),
        device.address()
    );
    Ok(handle)
}

/// Issue one command, collect an optional data phase, check the response.
/// Returns the data payload.
fn transact(
    handle: &DeviceHandle<Context>,
    code: u16,
    trans_id: u32,
    params: &[u32],
) -> Result<Vec<u8>, String> {
    let mut cmd = Vec::with_capacity(12 + params.len() * 4);
    cmd.extend_from_slice(&(12 + params.len() as u32 * 4).to_le_bytes());
    cmd.extend_from_slice(&CONTAINER_COMMAND.to_le_bytes());
    cmd.extend_from_slice(&code.to_le_bytes());
    cmd.extend_from_slice(&trans_id.to_le_bytes());
    for &p in params {
        cmd.extend_from_slice(&p.to_le_bytes());
    }
    handle
        .write_bulk(EP_OUT, &cmd, TIMEOUT)
        .map_err(|e| format!("write: {e}"))?;

    let mut data = Vec::new();
    loop {
        let mut buf = vec![0u8; 64 * 1024];
        let n = handle
            .read_bulk(EP_IN, &mut buf, TIMEOUT)
            .map_err(|e| format!("read: {e}"))?;
        if n < 12 {
            return Err(format!("short container ({n} bytes)"));
        }
        let kind = read_u16_le(&buf, 4).unwrap_or(0);
        match kind {
            CONTAINER_DATA => {
                let total = read_u32_le(&buf, 0).unwrap_or(0) as usize;
                data.extend_from_slice(&buf[12..n]);
                // Large payloads continue in follow-up transfers.
                while data.len() + 12 < total {
                    let n = handle
                        .read_bulk(EP_IN, &mut buf, TIMEOUT)
                        .map_err(|e| format!("read: {e}"))?;
                    data.extend_from_slice(&buf[..n]);
                }
            }
            CONTAINER_RESPONSE => {
                let rsp = read_u16_le(&buf, 6).unwrap_or(0);
                if rsp != RSP_OK {
                    return Err(format!("response {rsp:#06x}"));
                }
                return Ok(data);
            }
            other => return Err(format!("unexpected container type {other:#06x}")),
        }
    }
}

fn parse_hex16(s: &str) -> u16 {
    u16::from_str_radix(s.trim_start_matches("0x"), 16).unwrap_or_else(|_| {
        eprintln!("expected a hex id, got {s}");
        process::exit(1);
    })
}
