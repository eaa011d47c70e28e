//! End-to-end: a synthetic MTP host copies archives onto the virtual
//! install volume and the content store ends up with registered blobs.

use mtp_gadget::protocol::*;
use mtp_gadget::usb::{LoopbackHost, LoopbackPipe};
use mtp_gadget::{EventSink, ServerConfig, StopToken};
use stream_install::image::build::image;
use stream_install::layout::build::{partition, EntrySpec};
use stream_install::layout::{PACKAGE_ENTRY_SIZE, PACKAGE_MAGIC};
use stream_install::store::{ContentId, MemoryContentStore, MemoryTitleKeeper};
use stream_install::{
    ImageMode, InstallServer, InstallServerOptions, INSTALL_STORAGE_ID,
};

struct Host {
    link: LoopbackHost,
    trans_id: u32,
}

impl Host {
    fn command(&mut self, code: u16, params: &[u32]) {
        let mut raw = Vec::new();
        ContainerHeader::new(CONTAINER_COMMAND, code, self.trans_id, params.len() as u32 * 4)
            .emit(&mut raw);
        for &p in params {
            raw.extend_from_slice(&p.to_le_bytes());
        }
        self.link.send(&raw).unwrap();
    }

    fn send_data_chunked(&mut self, code: u16, payload: &[u8], chunks: &[usize]) {
        let mut raw = Vec::new();
        ContainerHeader::new(CONTAINER_DATA, code, self.trans_id, payload.len() as u32)
            .emit(&mut raw);
        let first = chunks.first().copied().unwrap_or(payload.len());
        raw.extend_from_slice(&payload[..first.min(payload.len())]);
        self.link.send(&raw).unwrap();

        let mut at = first.min(payload.len());
        for &len in &chunks[1..] {
            if at >= payload.len() {
                break;
            }
            let end = (at + len).min(payload.len());
            self.link.send(&payload[at..end]).unwrap();
            at = end;
        }
        while at < payload.len() {
            let end = (at + 4096).min(payload.len());
            self.link.send(&payload[at..end]).unwrap();
            at = end;
        }
    }

    fn expect_response(&mut self, code: u16) -> Vec<u32> {
        let mut buf = vec![0u8; 128 * 1024];
        let n = self.link.recv(&mut buf).unwrap();
        let header = ContainerHeader::parse(&buf[..n]).unwrap();
        assert_eq!(header.kind, CONTAINER_RESPONSE);
        assert_eq!(header.code, code, "got response {:#06x}", header.code);
        self.trans_id += 1;
        buf[CONTAINER_HEADER_SIZE..n]
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect()
    }

    fn open_session(&mut self) {
        self.command(OP_OPEN_SESSION, &[1]);
        self.expect_response(RSP_OK);
    }

    /// Create an archive object on the install volume and stream its
    /// bytes, split into `chunks`.
    fn upload(&mut self, name: &str, payload: &[u8], chunks: &[usize]) {
        self.command(
            OP_SEND_OBJECT_PROP_LIST,
            &[
                INSTALL_STORAGE_ID,
                ROOT_PARENT,
                FMT_UNDEFINED as u32,
                (payload.len() as u64 >> 32) as u32,
                payload.len() as u32,
            ],
        );
        let mut tuples = Vec::new();
        tuples.extend_from_slice(&1u32.to_le_bytes());
        tuples.extend_from_slice(&0u32.to_le_bytes());
        tuples.extend_from_slice(&PROP_OBJECT_FILE_NAME.to_le_bytes());
        tuples.extend_from_slice(&TYPE_STRING.to_le_bytes());
        let mut units: Vec<u16> = name.encode_utf16().collect();
        units.push(0);
        tuples.push(units.len() as u8);
        for u in units {
            tuples.extend_from_slice(&u.to_le_bytes());
        }
        self.send_data_chunked(OP_SEND_OBJECT_PROP_LIST, &tuples, &[tuples.len()]);
        let params = self.expect_response(RSP_OK);
        assert!(params[2] > 0);

        self.command(OP_SEND_OBJECT, &[]);
        self.send_data_chunked(OP_SEND_OBJECT, payload, chunks);
        self.expect_response(RSP_OK);
    }
}

fn start(image_mode: ImageMode) -> (InstallServer, Host, MemoryContentStore, MemoryTitleKeeper) {
    let store = MemoryContentStore::new();
    let keeper = MemoryTitleKeeper::new();
    let stop = StopToken::new();
    let (pipe, link) = LoopbackPipe::pair(stop.clone());
    let server = InstallServer::start(
        Box::new(pipe),
        InstallServerOptions {
            config: ServerConfig::default(),
            image_mode,
            store: Box::new(store.clone()),
            keeper: Box::new(keeper.clone()),
            events: EventSink::none(),
        },
        stop,
    );
    (server, Host { link, trans_id: 0 }, store, keeper)
}

fn meta_blob(title_id: u64, kind: u8) -> Vec<u8> {
    let mut blob = Vec::new();
    blob.extend_from_slice(&title_id.to_le_bytes());
    blob.extend_from_slice(&0u32.to_le_bytes());
    blob.push(kind);
    blob.resize(128, 0);
    blob
}

#[test]
fn package_archive_streams_into_the_content_store() {
    let meta_a = ContentId::new([0xA1; 16]);
    let meta_b = ContentId::new([0xA2; 16]);
    let content = ContentId::new([0xA3; 16]);
    let archive = partition(
        PACKAGE_MAGIC,
        PACKAGE_ENTRY_SIZE,
        &[
            EntrySpec {
                name: format!("{meta_a}.cnmt.nca"),
                data: meta_blob(0x0100_4444_5555_6000, 0x80),
            },
            EntrySpec {
                name: format!("{meta_b}.cnmt.nca"),
                data: meta_blob(0x0100_4444_5555_6800, 0x81),
            },
            EntrySpec {
                name: format!("{content}.nca"),
                data: vec![0xC3; 200_000],
            },
        ],
    );

    let (server, mut host, store, keeper) = start(ImageMode::Buffered);
    host.open_session();

    // One 64 KiB chunk, then many 4 KiB chunks.
    host.upload("game.nsp", &archive, &[64 * 1024]);

    assert_eq!(store.registered_ids().len(), 3);
    assert_eq!(store.placeholder_count(), 0);
    assert!(keeper.installed_metas().len() >= 2);
    assert_eq!(
        server.manager().title_id(),
        Some(0x0100_4444_5555_6000),
        "base id derived from the patch meta's key"
    );
    assert!(server.manager().take_complete());

    let (received, total) = server.manager().progress();
    assert_eq!(received, archive.len() as u64);
    assert_eq!(total, archive.len() as u64);

    server.stop();
}

#[test]
fn disk_image_installs_through_the_pull_pipeline() {
    let content_a = ContentId::new([0xB1; 16]);
    let content_b = ContentId::new([0xB2; 16]);
    let archive = image(
        0xF000,
        &[
            EntrySpec {
                name: format!("{content_a}.cnmt.nca"),
                data: meta_blob(0x0100_9999_0000_2000, 0x80),
            },
            EntrySpec {
                name: format!("{content_b}.nca"),
                data: vec![0xB2; 300_000],
            },
        ],
    );

    let (server, mut host, store, keeper) = start(ImageMode::Pull);
    host.open_session();
    host.upload("game.xci", &archive, &[64 * 1024]);

    assert_eq!(store.registered_ids().len(), 2);
    assert_eq!(keeper.application_records().last(), Some(&0x0100_9999_0000_2000));
    assert_eq!(server.manager().title_id(), Some(0x0100_9999_0000_2000));

    server.stop();
}

#[test]
fn unknown_archive_names_cannot_even_be_created() {
    let (server, mut host, store, _) = start(ImageMode::Buffered);
    host.open_session();

    host.command(
        OP_SEND_OBJECT_PROP_LIST,
        &[INSTALL_STORAGE_ID, ROOT_PARENT, FMT_UNDEFINED as u32, 0, 8],
    );
    let mut tuples = Vec::new();
    tuples.extend_from_slice(&1u32.to_le_bytes());
    tuples.extend_from_slice(&0u32.to_le_bytes());
    tuples.extend_from_slice(&PROP_OBJECT_FILE_NAME.to_le_bytes());
    tuples.extend_from_slice(&TYPE_STRING.to_le_bytes());
    let name = "movie.mp4";
    let mut units: Vec<u16> = name.encode_utf16().collect();
    units.push(0);
    tuples.push(units.len() as u8);
    for u in units {
        tuples.extend_from_slice(&u.to_le_bytes());
    }
    host.send_data_chunked(OP_SEND_OBJECT_PROP_LIST, &tuples, &[tuples.len()]);
    host.expect_response(RSP_GENERAL_ERROR);

    assert!(store.registered_ids().is_empty());
    server.stop();
}

#[test]
fn corrupt_archive_fails_the_write_transaction() {
    let (server, mut host, store, _) = start(ImageMode::Buffered);
    host.open_session();

    host.command(
        OP_SEND_OBJECT_PROP_LIST,
        &[INSTALL_STORAGE_ID, ROOT_PARENT, FMT_UNDEFINED as u32, 0, 4096],
    );
    let mut tuples = Vec::new();
    tuples.extend_from_slice(&1u32.to_le_bytes());
    tuples.extend_from_slice(&0u32.to_le_bytes());
    tuples.extend_from_slice(&PROP_OBJECT_FILE_NAME.to_le_bytes());
    tuples.extend_from_slice(&TYPE_STRING.to_le_bytes());
    let mut units: Vec<u16> = "bogus.nsp".encode_utf16().collect();
    units.push(0);
    tuples.push(units.len() as u8);
    for u in units {
        tuples.extend_from_slice(&u.to_le_bytes());
    }
    host.send_data_chunked(OP_SEND_OBJECT_PROP_LIST, &tuples, &[tuples.len()]);
    host.expect_response(RSP_OK);

    host.command(OP_SEND_OBJECT, &[]);
    host.send_data_chunked(OP_SEND_OBJECT, &vec![0xFFu8; 4096], &[4096]);
    host.expect_response(RSP_GENERAL_ERROR);

    assert!(store.registered_ids().is_empty());
    server.stop();
}
