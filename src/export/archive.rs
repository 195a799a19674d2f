//! Deterministic store-only zip archives.
//!
//! Bytes depend only on the entry set: entries sorted by path, zero
//! timestamps and attributes, fixed version fields, no compression.
//! Layout is every local header with its data, then the central directory,
//! then the end record.

use std::fs;
use std::path::Path;

use walkdir::WalkDir;

use crate::error::{AssemblyError, Result};
use crate::hashing::{relative_slash_path, sha256_hex};

const LOCAL_HEADER_SIGNATURE: u32 = 0x0403_4b50;
const CENTRAL_HEADER_SIGNATURE: u32 = 0x0201_4b50;
const END_OF_CENTRAL_DIRECTORY_SIGNATURE: u32 = 0x0605_4b50;

const ZIP_VERSION: u16 = 20;
const METHOD_STORED: u16 = 0;

const LOCAL_HEADER_LEN: usize = 30;
const CENTRAL_HEADER_LEN: usize = 46;
const END_RECORD_LEN: usize = 22;

const MAX_ENTRIES: usize = u16::MAX as usize;

const CRC32_TABLE: [u32; 256] = crc32_table();

const fn crc32_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ 0xEDB8_8320
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

pub fn crc32(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for &byte in data {
        crc = CRC32_TABLE[((crc ^ byte as u32) & 0xFF) as usize] ^ (crc >> 8);
    }
    !crc
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// Forward-slash path inside the archive.
    pub path: String,
    pub data: Vec<u8>,
}

/// Fields shared by the local and central headers of one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryRecord {
    pub crc32: u32,
    pub size: u32,
    pub name_len: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalFileHeader {
    pub record: EntryRecord,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CentralDirectoryHeader {
    pub record: EntryRecord,
    pub local_header_offset: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndOfCentralDirectory {
    pub entries: u16,
    pub directory_size: u32,
    pub directory_offset: u32,
}

fn put_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

impl EntryRecord {
    fn for_entry(entry: &ArchiveEntry) -> Result<Self> {
        let size = u32::try_from(entry.data.len())
            .map_err(|_| AssemblyError::ArchiveTooLarge(format!("{} exceeds 4 GiB", entry.path)))?;
        let name_len = u16::try_from(entry.path.len())
            .map_err(|_| AssemblyError::ArchiveTooLarge(format!("path too long: {}", entry.path)))?;
        Ok(Self {
            crc32: crc32(&entry.data),
            size,
            name_len,
        })
    }

    /// crc, compressed size, uncompressed size, name length, extra length.
    fn encode_tail(&self, out: &mut Vec<u8>) {
        put_u32(out, self.crc32);
        put_u32(out, self.size);
        put_u32(out, self.size);
        put_u16(out, self.name_len);
        put_u16(out, 0);
    }
}

/// version, flags, method, time, date.
fn encode_fixed_fields(out: &mut Vec<u8>) {
    put_u16(out, ZIP_VERSION);
    put_u16(out, 0);
    put_u16(out, METHOD_STORED);
    put_u16(out, 0);
    put_u16(out, 0);
}

impl LocalFileHeader {
    pub fn encode(&self, name: &str, out: &mut Vec<u8>) {
        put_u32(out, LOCAL_HEADER_SIGNATURE);
        encode_fixed_fields(out);
        self.record.encode_tail(out);
        out.extend_from_slice(name.as_bytes());
    }
}

impl CentralDirectoryHeader {
    pub fn encode(&self, name: &str, out: &mut Vec<u8>) {
        put_u32(out, CENTRAL_HEADER_SIGNATURE);
        put_u16(out, ZIP_VERSION); // made by
        encode_fixed_fields(out);
        self.record.encode_tail(out);
        put_u16(out, 0); // comment length
        put_u16(out, 0); // disk number
        put_u16(out, 0); // internal attributes
        put_u32(out, 0); // external attributes
        put_u32(out, self.local_header_offset);
        out.extend_from_slice(name.as_bytes());
    }
}

impl EndOfCentralDirectory {
    pub fn encode(&self, out: &mut Vec<u8>) {
        put_u32(out, END_OF_CENTRAL_DIRECTORY_SIGNATURE);
        put_u16(out, 0);
        put_u16(out, 0);
        put_u16(out, self.entries);
        put_u16(out, self.entries);
        put_u32(out, self.directory_size);
        put_u32(out, self.directory_offset);
        put_u16(out, 0);
    }
}

fn offset_u32(offset: usize) -> Result<u32> {
    u32::try_from(offset).map_err(|_| AssemblyError::ArchiveTooLarge("archive exceeds 4 GiB".to_string()))
}

/// Serialize entries into archive bytes. Input order does not matter.
pub fn build_archive(entries: &[ArchiveEntry]) -> Result<Vec<u8>> {
    if entries.len() > MAX_ENTRIES {
        return Err(AssemblyError::ArchiveTooLarge(format!(
            "{} entries (max {})",
            entries.len(),
            MAX_ENTRIES
        )));
    }
    let mut sorted: Vec<&ArchiveEntry> = entries.iter().collect();
    sorted.sort_by(|a, b| a.path.cmp(&b.path));

    let mut out = Vec::new();
    let mut central = Vec::with_capacity(sorted.len());
    for entry in &sorted {
        let record = EntryRecord::for_entry(entry)?;
        let local_header_offset = offset_u32(out.len())?;
        LocalFileHeader { record }.encode(&entry.path, &mut out);
        out.extend_from_slice(&entry.data);
        central.push(CentralDirectoryHeader {
            record,
            local_header_offset,
        });
    }

    let directory_offset = offset_u32(out.len())?;
    for (entry, header) in sorted.iter().zip(&central) {
        header.encode(&entry.path, &mut out);
    }
    let directory_size = offset_u32(out.len())? - directory_offset;

    EndOfCentralDirectory {
        entries: sorted.len() as u16,
        directory_size,
        directory_offset,
    }
    .encode(&mut out);
    offset_u32(out.len())?;
    Ok(out)
}

/// Every regular file under `root` as an archive entry.
pub fn collect_entries(root: &Path) -> Result<Vec<ArchiveEntry>> {
    let mut entries = vec![];
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|e| AssemblyError::Io(e.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        entries.push(ArchiveEntry {
            path: relative_slash_path(root, entry.path())?,
            data: fs::read(entry.path())?,
        });
    }
    Ok(entries)
}

/// Archive `root` into `dest`; returns the archive's sha256.
pub fn write_archive(root: &Path, dest: &Path) -> Result<String> {
    let bytes = build_archive(&collect_entries(root)?)?;
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(dest, &bytes)?;
    Ok(sha256_hex(&bytes))
}

/// Recompute the sha256 of a file on disk.
pub fn digest_file(path: &Path) -> Result<String> {
    Ok(sha256_hex(&fs::read(path)?))
}

struct Reader<'a> {
    bytes: &'a [u8],
}

impl<'a> Reader<'a> {
    fn slice(&self, offset: usize, len: usize) -> Result<&'a [u8]> {
        offset
            .checked_add(len)
            .and_then(|end| self.bytes.get(offset..end))
            .ok_or_else(|| AssemblyError::ArchiveMalformed(format!("truncated at offset {}", offset)))
    }

    fn u16(&self, offset: usize) -> Result<u16> {
        let b = self.slice(offset, 2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&self, offset: usize) -> Result<u32> {
        let b = self.slice(offset, 4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn expect_signature(&self, offset: usize, signature: u32, what: &str) -> Result<()> {
        if self.u32(offset)? != signature {
            return Err(AssemblyError::ArchiveMalformed(format!(
                "missing {} signature at offset {}",
                what, offset
            )));
        }
        Ok(())
    }
}

/// Parse a store-only archive without a trailing comment. CRCs are checked.
pub fn read_entries(bytes: &[u8]) -> Result<Vec<ArchiveEntry>> {
    let reader = Reader { bytes };
    let end = bytes
        .len()
        .checked_sub(END_RECORD_LEN)
        .ok_or_else(|| AssemblyError::ArchiveMalformed("shorter than an end record".to_string()))?;
    reader.expect_signature(end, END_OF_CENTRAL_DIRECTORY_SIGNATURE, "end record")?;
    let count = reader.u16(end + 10)? as usize;
    let mut offset = reader.u32(end + 16)? as usize;

    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        reader.expect_signature(offset, CENTRAL_HEADER_SIGNATURE, "central header")?;
        if reader.u16(offset + 10)? != METHOD_STORED {
            return Err(AssemblyError::ArchiveMalformed("compressed entries are not supported".to_string()));
        }
        let crc = reader.u32(offset + 16)?;
        let size = reader.u32(offset + 24)? as usize;
        let name_len = reader.u16(offset + 28)? as usize;
        let extra_len = reader.u16(offset + 30)? as usize;
        let comment_len = reader.u16(offset + 32)? as usize;
        let local = reader.u32(offset + 42)? as usize;
        let name = reader.slice(offset + CENTRAL_HEADER_LEN, name_len)?;
        let path = String::from_utf8(name.to_vec())
            .map_err(|_| AssemblyError::ArchiveMalformed("entry name is not UTF-8".to_string()))?;

        reader.expect_signature(local, LOCAL_HEADER_SIGNATURE, "local header")?;
        let local_name_len = reader.u16(local + 26)? as usize;
        let local_extra_len = reader.u16(local + 28)? as usize;
        let data = reader.slice(local + LOCAL_HEADER_LEN + local_name_len + local_extra_len, size)?;
        if crc32(data) != crc {
            return Err(AssemblyError::ArchiveMalformed(format!("crc mismatch for {}", path)));
        }

        entries.push(ArchiveEntry {
            path,
            data: data.to_vec(),
        });
        offset += CENTRAL_HEADER_LEN + name_len + extra_len + comment_len;
    }
    Ok(entries)
}
