//! On-disk layout of the two archive shapes.
//!
//! Both start with the same 16-byte partition header; they differ in the
//! magic, the per-entry record size, and how entry data offsets are
//! anchored.

use mtp_gadget::protocol::{read_u32_le, read_u64_le};

use crate::error::{InstallError, InstallResult};

/// Flat package archive magic ("PFS0").
pub const PACKAGE_MAGIC: u32 = 0x3053_4650;
/// Disk-image partition magic ("HFS0").
pub const IMAGE_MAGIC: u32 = 0x3053_4648;

pub const PARTITION_HEADER_SIZE: usize = 16;
/// Package entries: data offset, size, name offset, reserved.
pub const PACKAGE_ENTRY_SIZE: usize = 24;
/// Image entries additionally carry a hash region.
pub const IMAGE_ENTRY_SIZE: usize = 64;

/// `{magic, num_files, string_table_size, padding}`.
#[derive(Debug, Clone, Copy)]
pub struct PartitionHeader {
    pub num_files: u32,
    pub string_table_size: u32,
}

impl PartitionHeader {
    /// Parse and check the magic. `None` means more bytes are needed.
    pub fn parse(buf: &[u8], magic: u32) -> InstallResult<Option<Self>> {
        if buf.len() < PARTITION_HEADER_SIZE {
            return Ok(None);
        }
        let found = read_u32_le(buf, 0).unwrap();
        if found != magic {
            return Err(InstallError::BadMagic { found });
        }
        Ok(Some(PartitionHeader {
            num_files: read_u32_le(buf, 4).unwrap(),
            string_table_size: read_u32_le(buf, 8).unwrap(),
        }))
    }

    /// Bytes occupied by the fixed header, the entry table and the string
    /// table together.
    pub fn full_size(&self, entry_size: usize) -> usize {
        PARTITION_HEADER_SIZE
            + self.num_files as usize * entry_size
            + self.string_table_size as usize
    }
}

/// One parsed entry: name plus its data range, relative to the end of the
/// owning partition header.
#[derive(Debug, Clone)]
pub struct PartitionEntry {
    pub name: String,
    pub data_offset: u64,
    pub size: u64,
}

/// A fully parsed partition: entries and the total header size.
#[derive(Debug, Clone)]
pub struct Partition {
    pub header_size: u64,
    pub entries: Vec<PartitionEntry>,
}

impl Partition {
    pub fn entry(&self, name: &str) -> Option<&PartitionEntry> {
        self.entries.iter().find(|e| e.name == name)
    }
}

/// Parse a complete partition out of `buf`. `None` means the variable part
/// has not fully arrived yet.
pub fn parse_partition(
    buf: &[u8],
    entry_size: usize,
    magic: u32,
) -> InstallResult<Option<Partition>> {
    let Some(header) = PartitionHeader::parse(buf, magic)? else {
        return Ok(None);
    };
    let full_size = header.full_size(entry_size);
    if buf.len() < full_size {
        return Ok(None);
    }

    let table_start = PARTITION_HEADER_SIZE;
    let strings_start = table_start + header.num_files as usize * entry_size;
    let string_table = &buf[strings_start..full_size];

    let mut entries = Vec::with_capacity(header.num_files as usize);
    for i in 0..header.num_files as usize {
        let at = table_start + i * entry_size;
        let data_offset = read_u64_le(buf, at).unwrap();
        let size = read_u64_le(buf, at + 8).unwrap();
        let name_offset = read_u32_le(buf, at + 16).unwrap() as usize;
        let name = string_at(string_table, name_offset)?;
        entries.push(PartitionEntry {
            name,
            data_offset,
            size,
        });
    }

    Ok(Some(Partition {
        header_size: full_size as u64,
        entries,
    }))
}

fn string_at(table: &[u8], offset: usize) -> InstallResult<String> {
    let tail = table
        .get(offset..)
        .ok_or_else(|| InstallError::Store("entry name offset out of range".into()))?;
    let end = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
    String::from_utf8(tail[..end].to_vec())
        .map_err(|_| InstallError::Store("entry name is not utf-8".into()))
}

/// Build an archive image in memory — the fixture counterpart of
/// `parse_partition`, used by the test suites.
pub mod build {
    use super::*;

    pub struct EntrySpec {
        pub name: String,
        pub data: Vec<u8>,
    }

    /// Lay out `{header, entry table, string table, data}` with the given
    /// entry record size, returning the serialized partition.
    pub fn partition(magic: u32, entry_size: usize, entries: &[EntrySpec]) -> Vec<u8> {
        let mut string_table = Vec::new();
        let mut name_offsets = Vec::new();
        for e in entries {
            name_offsets.push(string_table.len() as u32);
            string_table.extend_from_slice(e.name.as_bytes());
            string_table.push(0);
        }
        // Align the header end like real packers do.
        while string_table.len() % 16 != 0 {
            string_table.push(0);
        }

        let mut out = Vec::new();
        out.extend_from_slice(&magic.to_le_bytes());
        out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
        out.extend_from_slice(&(string_table.len() as u32).to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());

        let mut data_offset = 0u64;
        for (e, &name_offset) in entries.iter().zip(&name_offsets) {
            out.extend_from_slice(&data_offset.to_le_bytes());
            out.extend_from_slice(&(e.data.len() as u64).to_le_bytes());
            out.extend_from_slice(&name_offset.to_le_bytes());
            out.resize(out.len() + entry_size - 20, 0);
            data_offset += e.data.len() as u64;
        }
        out.extend_from_slice(&string_table);
        for e in entries {
            out.extend_from_slice(&e.data);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::build::{partition, EntrySpec};
    use super::*;

    #[test]
    fn package_partition_roundtrip() {
        let raw = partition(
            PACKAGE_MAGIC,
            PACKAGE_ENTRY_SIZE,
            &[
                EntrySpec {
                    name: "first.nca".into(),
                    data: vec![1; 100],
                },
                EntrySpec {
                    name: "second.tik".into(),
                    data: vec![2; 32],
                },
            ],
        );

        let parsed = parse_partition(&raw, PACKAGE_ENTRY_SIZE, PACKAGE_MAGIC)
            .unwrap()
            .unwrap();
        assert_eq!(parsed.entries.len(), 2);
        assert_eq!(parsed.entries[0].name, "first.nca");
        assert_eq!(parsed.entries[0].data_offset, 0);
        assert_eq!(parsed.entries[0].size, 100);
        assert_eq!(parsed.entries[1].data_offset, 100);
        assert_eq!(parsed.header_size as usize, raw.len() - 132);
    }

    #[test]
    fn truncated_partition_asks_for_more() {
        let raw = partition(
            PACKAGE_MAGIC,
            PACKAGE_ENTRY_SIZE,
            &[EntrySpec {
                name: "a.nca".into(),
                data: vec![0; 8],
            }],
        );
        assert!(parse_partition(&raw[..10], PACKAGE_ENTRY_SIZE, PACKAGE_MAGIC)
            .unwrap()
            .is_none());
        assert!(parse_partition(&raw[..20], PACKAGE_ENTRY_SIZE, PACKAGE_MAGIC)
            .unwrap()
            .is_none());
    }

    #[test]
    fn wrong_magic_is_fatal() {
        let raw = partition(
            IMAGE_MAGIC,
            PACKAGE_ENTRY_SIZE,
            &[EntrySpec {
                name: "a".into(),
                data: Vec::new(),
            }],
        );
        assert!(matches!(
            parse_partition(&raw, PACKAGE_ENTRY_SIZE, PACKAGE_MAGIC),
            Err(InstallError::BadMagic { .. })
        ));
    }
}
