//! Linux FunctionFS transport: the real USB gadget backing of [`BulkPipe`].
//!
//! The gadget presents a still-image class interface (class 0x06, subclass
//! 0x01, protocol 0x01) with one bulk-in, one bulk-out and one interrupt-in
//! endpoint. Descriptors are pushed through `ep0`; the endpoint files then
//! appear next to it. Binding and unbinding the UDC through configfs gives
//! the forced re-enumeration the server performs at startup.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::responder::DeviceIdentity;
use crate::usb::{BulkPipe, StopToken};

pub const DEFAULT_VID: u16 = 0x057E;
pub const DEFAULT_PID: u16 = 0x201D;

const USB_CLASS_STILL_IMAGE: u8 = 0x06;
const USB_SUBCLASS_STILL_IMAGE: u8 = 0x01;
const USB_PROTOCOL_PTP: u8 = 0x01;

const EP_IN_ADDR: u8 = 0x81;
const EP_OUT_ADDR: u8 = 0x02;
const EP_INT_ADDR: u8 = 0x83;

const FUNCTIONFS_DESCRIPTORS_MAGIC_V2: u32 = 0x0000_0003;
const FUNCTIONFS_STRINGS_MAGIC: u32 = 0x0000_0002;
const FUNCTIONFS_HAS_FS_DESC: u32 = 0x0000_0001;
const FUNCTIONFS_HAS_HS_DESC: u32 = 0x0000_0002;

/// Where the gadget lives in configfs and where FunctionFS is mounted.
#[derive(Debug, Clone)]
pub struct GadgetConfig {
    pub configfs_dir: PathBuf,
    pub ffs_dir: PathBuf,
    /// UDC name to bind (an entry of /sys/class/udc).
    pub udc: String,
    pub vid: u16,
    pub pid: u16,
}

impl GadgetConfig {
    pub fn new(configfs_dir: impl Into<PathBuf>, ffs_dir: impl Into<PathBuf>, udc: &str) -> Self {
        GadgetConfig {
            configfs_dir: configfs_dir.into(),
            ffs_dir: ffs_dir.into(),
            udc: udc.to_owned(),
            vid: DEFAULT_VID,
            pid: DEFAULT_PID,
        }
    }

    fn udc_file(&self) -> PathBuf {
        self.configfs_dir.join("UDC")
    }
}

fn write_file(path: &Path, contents: &str) -> std::io::Result<()> {
    fs::write(path, contents)
}

/// Populate the configfs gadget skeleton: ids, strings, one configuration
/// with the FunctionFS function linked in. Idempotent over an existing
/// skeleton.
pub fn configure_gadget(config: &GadgetConfig, identity: &DeviceIdentity) -> Result<()> {
    let root = &config.configfs_dir;
    fs::create_dir_all(root).map_err(Error::UsbIo)?;
    write_file(&root.join("idVendor"), &format!("{:#06x}\n", config.vid)).map_err(Error::UsbIo)?;
    write_file(&root.join("idProduct"), &format!("{:#06x}\n", config.pid)).map_err(Error::UsbIo)?;

    let strings = root.join("strings/0x409");
    fs::create_dir_all(&strings).map_err(Error::UsbIo)?;
    write_file(&strings.join("manufacturer"), &identity.manufacturer).map_err(Error::UsbIo)?;
    write_file(&strings.join("product"), &identity.model).map_err(Error::UsbIo)?;
    write_file(&strings.join("serialnumber"), &identity.serial).map_err(Error::UsbIo)?;

    let function = root.join("functions/ffs.mtp");
    fs::create_dir_all(&function).map_err(Error::UsbIo)?;
    let cfg = root.join("configs/c.1");
    fs::create_dir_all(&cfg).map_err(Error::UsbIo)?;

    #[cfg(unix)]
    {
        let link = cfg.join("ffs.mtp");
        if !link.exists() {
            std::os::unix::fs::symlink(&function, &link).map_err(Error::UsbIo)?;
        }
    }

    log::info!(
        "gadget configured at {} (vid {:#06x} pid {:#06x})",
        root.display(),
        config.vid,
        config.pid
    );
    Ok(())
}

/// Bulk pipe over FunctionFS endpoint files.
pub struct FunctionFsPipe {
    // Held open for the lifetime of the function; closing ep0 tears the
    // endpoints down.
    _ep0: File,
    ep_in: File,
    ep_out: File,
    _ep_int: File,
    config: GadgetConfig,
    stop: StopToken,
}

impl FunctionFsPipe {
    /// Write descriptors through ep0 and open the endpoint files.
    pub fn open(config: GadgetConfig, stop: StopToken) -> Result<Self> {
        let dir = &config.ffs_dir;
        let mut ep0 = OpenOptions::new()
            .read(true)
            .write(true)
            .open(dir.join("ep0"))
            .map_err(Error::UsbIo)?;

        ep0.write_all(&descriptor_blob()).map_err(Error::UsbIo)?;
        ep0.write_all(&strings_blob()).map_err(Error::UsbIo)?;

        let ep_in = OpenOptions::new()
            .write(true)
            .open(dir.join("ep1"))
            .map_err(Error::UsbIo)?;
        let ep_out = OpenOptions::new()
            .read(true)
            .open(dir.join("ep2"))
            .map_err(Error::UsbIo)?;
        let ep_int = OpenOptions::new()
            .write(true)
            .open(dir.join("ep3"))
            .map_err(Error::UsbIo)?;

        log::info!("functionfs endpoints open at {}", dir.display());
        Ok(FunctionFsPipe {
            _ep0: ep0,
            ep_in,
            ep_out,
            _ep_int: ep_int,
            config,
            stop,
        })
    }
}

impl BulkPipe for FunctionFsPipe {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.stop.check()?;
        self.ep_out.read(buf).map_err(Error::UsbIo)
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.stop.check()?;
        self.ep_in.write_all(buf).map_err(Error::UsbIo)
    }

    fn enable(&mut self) -> Result<()> {
        write_file(&self.config.udc_file(), &self.config.udc).map_err(Error::UsbIo)
    }

    fn disable(&mut self) -> Result<()> {
        write_file(&self.config.udc_file(), "\n").map_err(Error::UsbIo)
    }
}

// ---------------------------------------------------------------------------
// Descriptor blobs
// ---------------------------------------------------------------------------

fn push_interface_descriptor(out: &mut Vec<u8>) {
    out.extend_from_slice(&[
        9,    // bLength
        4,    // bDescriptorType: interface
        0,    // bInterfaceNumber
        0,    // bAlternateSetting
        3,    // bNumEndpoints
        USB_CLASS_STILL_IMAGE,
        USB_SUBCLASS_STILL_IMAGE,
        USB_PROTOCOL_PTP,
        1, // iInterface
    ]);
}

fn push_endpoint_descriptor(out: &mut Vec<u8>, addr: u8, attributes: u8, max_packet: u16, interval: u8) {
    out.push(7); // bLength
    out.push(5); // bDescriptorType: endpoint
    out.push(addr);
    out.push(attributes);
    out.extend_from_slice(&max_packet.to_le_bytes());
    out.push(interval);
}

fn push_descriptor_set(out: &mut Vec<u8>, bulk_packet: u16, int_interval: u8) {
    push_interface_descriptor(out);
    push_endpoint_descriptor(out, EP_IN_ADDR, 0x02, bulk_packet, 0);
    push_endpoint_descriptor(out, EP_OUT_ADDR, 0x02, bulk_packet, 0);
    push_endpoint_descriptor(out, EP_INT_ADDR, 0x03, 28, int_interval);
}

fn descriptor_blob() -> Vec<u8> {
    let mut body = Vec::new();
    push_descriptor_set(&mut body, 64, 10); // full speed
    let fs_len = body.len();
    push_descriptor_set(&mut body, 512, 6); // high speed
    debug_assert_eq!(body.len(), fs_len * 2);

    let mut blob = Vec::new();
    blob.extend_from_slice(&FUNCTIONFS_DESCRIPTORS_MAGIC_V2.to_le_bytes());
    let length = (4 * 5 + body.len()) as u32;
    blob.extend_from_slice(&length.to_le_bytes());
    blob.extend_from_slice(&(FUNCTIONFS_HAS_FS_DESC | FUNCTIONFS_HAS_HS_DESC).to_le_bytes());
    blob.extend_from_slice(&4u32.to_le_bytes()); // fs descriptor count
    blob.extend_from_slice(&4u32.to_le_bytes()); // hs descriptor count
    blob.extend_from_slice(&body);
    blob
}

fn strings_blob() -> Vec<u8> {
    let text = b"MTP\0";
    let mut blob = Vec::new();
    blob.extend_from_slice(&FUNCTIONFS_STRINGS_MAGIC.to_le_bytes());
    let length = (4 * 4 + 2 + text.len()) as u32;
    blob.extend_from_slice(&length.to_le_bytes());
    blob.extend_from_slice(&1u32.to_le_bytes()); // string count
    blob.extend_from_slice(&1u32.to_le_bytes()); // language count
    blob.extend_from_slice(&0x0409u16.to_le_bytes());
    blob.extend_from_slice(text);
    blob
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_blob_length_field_matches() {
        let blob = descriptor_blob();
        let length = u32::from_le_bytes([blob[4], blob[5], blob[6], blob[7]]);
        assert_eq!(length as usize, blob.len());
        // Interface class triple sits right after the fixed header and the
        // first two interface-descriptor bytes plus number/alt/ep counts.
        let iface = &blob[20..29];
        assert_eq!(iface[5], USB_CLASS_STILL_IMAGE);
        assert_eq!(iface[6], USB_SUBCLASS_STILL_IMAGE);
        assert_eq!(iface[7], USB_PROTOCOL_PTP);
    }

    #[test]
    fn strings_blob_length_field_matches() {
        let blob = strings_blob();
        let length = u32::from_le_bytes([blob[4], blob[5], blob[6], blob[7]]);
        assert_eq!(length as usize, blob.len());
    }
}
