//! Packed little-endian ZIP64 binary records (spec.md §4.E, §6).
//!
//! Kept as explicit `to_le_bytes`/`from_le_bytes` encode/decode helpers
//! rather than a struct-packing crate, matching the teacher's own
//! hand-rolled parsing idiom in `aff4.rs`'s central-directory reader.

pub const EOCD_SIGNATURE: u32 = 0x0605_4b50;
pub const ZIP64_LOCATOR_SIG: u32 = 0x0706_4b50;
pub const ZIP64_EOCD_SIG: u32 = 0x0606_4b50;
pub const CD_ENTRY_SIG: u32 = 0x0201_4b50;
pub const LOCAL_FILE_SIG: u32 = 0x0403_4b50;
pub const DATA_DESCRIPTOR_SIG: u32 = 0x0807_4b50;

pub const ZIP_STORED: u16 = 0;
pub const ZIP_DEFLATE: u16 = 8;

pub const ZIP64_EXTRA_TAG: u16 = 1;

/// Sentinel written into 32-bit legacy fields when the real value lives in
/// the Zip64 extensible extra field.
pub const SENTINEL_32: u32 = 0xFFFF_FFFF;

pub struct LocalFileHeader {
    pub flags: u16,
    pub compression_method: u16,
    pub dostime: u16,
    pub dosdate: u16,
    pub crc32: u32,
    pub compress_size: u32,
    pub file_size: u32,
    pub file_name: String,
}

impl LocalFileHeader {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(30 + self.file_name.len());
        out.extend_from_slice(&LOCAL_FILE_SIG.to_le_bytes());
        out.extend_from_slice(&0x14u16.to_le_bytes()); // version needed
        out.extend_from_slice(&self.flags.to_le_bytes());
        out.extend_from_slice(&self.compression_method.to_le_bytes());
        out.extend_from_slice(&self.dostime.to_le_bytes());
        out.extend_from_slice(&self.dosdate.to_le_bytes());
        out.extend_from_slice(&self.crc32.to_le_bytes());
        out.extend_from_slice(&self.compress_size.to_le_bytes());
        out.extend_from_slice(&self.file_size.to_le_bytes());
        out.extend_from_slice(&(self.file_name.len() as u16).to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes()); // extra field len
        out.extend_from_slice(self.file_name.as_bytes());
        out
    }

    pub fn decode(buf: &[u8]) -> Option<(Self, usize)> {
        if buf.len() < 30 {
            return None;
        }
        let magic = u32::from_le_bytes(buf[0..4].try_into().ok()?);
        if magic != LOCAL_FILE_SIG {
            return None;
        }
        let flags = u16::from_le_bytes(buf[6..8].try_into().ok()?);
        let compression_method = u16::from_le_bytes(buf[8..10].try_into().ok()?);
        let dostime = u16::from_le_bytes(buf[10..12].try_into().ok()?);
        let dosdate = u16::from_le_bytes(buf[12..14].try_into().ok()?);
        let crc32 = u32::from_le_bytes(buf[14..18].try_into().ok()?);
        let compress_size = u32::from_le_bytes(buf[18..22].try_into().ok()?);
        let file_size = u32::from_le_bytes(buf[22..26].try_into().ok()?);
        let name_len = u16::from_le_bytes(buf[26..28].try_into().ok()?) as usize;
        let extra_len = u16::from_le_bytes(buf[28..30].try_into().ok()?) as usize;
        if buf.len() < 30 + name_len + extra_len {
            return None;
        }
        let file_name = String::from_utf8_lossy(&buf[30..30 + name_len]).to_string();
        Some((
            LocalFileHeader {
                flags,
                compression_method,
                dostime,
                dosdate,
                crc32,
                compress_size,
                file_size,
                file_name,
            },
            30 + name_len + extra_len,
        ))
    }
}

/// Zip64 data descriptor (8-byte sizes), written after streamed payloads.
pub struct DataDescriptor {
    pub crc32: u32,
    pub compress_size: u64,
    pub file_size: u64,
}

impl DataDescriptor {
    pub fn encode(&self) -> [u8; 24] {
        let mut out = [0u8; 24];
        out[0..4].copy_from_slice(&DATA_DESCRIPTOR_SIG.to_le_bytes());
        out[4..8].copy_from_slice(&self.crc32.to_le_bytes());
        out[8..16].copy_from_slice(&self.compress_size.to_le_bytes());
        out[16..24].copy_from_slice(&self.file_size.to_le_bytes());
        out
    }

    pub fn decode(buf: &[u8; 24]) -> Option<Self> {
        let magic = u32::from_le_bytes(buf[0..4].try_into().ok()?);
        if magic != DATA_DESCRIPTOR_SIG {
            return None;
        }
        Some(DataDescriptor {
            crc32: u32::from_le_bytes(buf[4..8].try_into().ok()?),
            compress_size: u64::from_le_bytes(buf[8..16].try_into().ok()?),
            file_size: u64::from_le_bytes(buf[16..24].try_into().ok()?),
        })
    }
}

/// One parsed central-directory entry.
#[derive(Debug, Clone)]
pub struct CdEntry {
    pub filename: String,
    pub compression_method: u16,
    pub compress_size: u64,
    pub file_size: u64,
    pub local_header_offset: u64,
    pub crc32: u32,
    pub dostime: u16,
    pub dosdate: u16,
}

impl CdEntry {
    /// Encode this entry as a CD file header + Zip64 extensible extra field
    /// (always 32 bytes, sentinel values for the 32-bit legacy fields).
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(46 + 32 + self.filename.len());
        out.extend_from_slice(&CD_ENTRY_SIG.to_le_bytes());
        out.extend_from_slice(&0x317u16.to_le_bytes()); // version made by
        out.extend_from_slice(&0x2du16.to_le_bytes()); // version needed (zip64)
        out.extend_from_slice(&0x8u16.to_le_bytes()); // flags: data descriptor
        out.extend_from_slice(&self.compression_method.to_le_bytes());
        out.extend_from_slice(&self.dostime.to_le_bytes());
        out.extend_from_slice(&self.dosdate.to_le_bytes());
        out.extend_from_slice(&self.crc32.to_le_bytes());
        out.extend_from_slice(&SENTINEL_32.to_le_bytes()); // compress_size
        out.extend_from_slice(&SENTINEL_32.to_le_bytes()); // file_size
        out.extend_from_slice(&(self.filename.len() as u16).to_le_bytes());
        out.extend_from_slice(&32u16.to_le_bytes()); // extra_field_len
        out.extend_from_slice(&0u16.to_le_bytes()); // file_comment_length
        out.extend_from_slice(&0u16.to_le_bytes()); // disk_number_start
        out.extend_from_slice(&0u16.to_le_bytes()); // internal_file_attr
        out.extend_from_slice(&(0o644u32 << 16).to_le_bytes()); // external_file_attr
        out.extend_from_slice(&SENTINEL_32.to_le_bytes()); // relative_offset_local_header
        out.extend_from_slice(self.filename.as_bytes());

        // Zip64 extensible field.
        out.extend_from_slice(&ZIP64_EXTRA_TAG.to_le_bytes());
        out.extend_from_slice(&28u16.to_le_bytes());
        out.extend_from_slice(&self.file_size.to_le_bytes());
        out.extend_from_slice(&self.compress_size.to_le_bytes());
        out.extend_from_slice(&(self.local_header_offset as i64).to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes()); // disk_number_start

        out
    }

    /// Decode one CD entry at `buf[..]`; returns the entry and the number
    /// of bytes consumed (fixed header + name + extra + comment).
    pub fn decode(buf: &[u8]) -> Option<(Self, usize)> {
        if buf.len() < 46 {
            return None;
        }
        let magic = u32::from_le_bytes(buf[0..4].try_into().ok()?);
        if magic != CD_ENTRY_SIG {
            return None;
        }
        let compression_method = u16::from_le_bytes(buf[10..12].try_into().ok()?);
        let dostime = u16::from_le_bytes(buf[12..14].try_into().ok()?);
        let dosdate = u16::from_le_bytes(buf[14..16].try_into().ok()?);
        let crc32 = u32::from_le_bytes(buf[16..20].try_into().ok()?);
        let mut compress_size = u32::from_le_bytes(buf[20..24].try_into().ok()?) as u64;
        let mut file_size = u32::from_le_bytes(buf[24..28].try_into().ok()?) as u64;
        let name_len = u16::from_le_bytes(buf[28..30].try_into().ok()?) as usize;
        let extra_len = u16::from_le_bytes(buf[30..32].try_into().ok()?) as usize;
        let comment_len = u16::from_le_bytes(buf[32..34].try_into().ok()?) as usize;
        let mut local_header_offset =
            u32::from_le_bytes(buf[42..46].try_into().ok()?) as u64;

        let total_len = 46 + name_len + extra_len + comment_len;
        if buf.len() < total_len {
            return None;
        }
        let filename = String::from_utf8_lossy(&buf[46..46 + name_len]).to_string();

        let extra = &buf[46 + name_len..46 + name_len + extra_len];
        let mut i = 0;
        while i + 4 <= extra.len() {
            let tag = u16::from_le_bytes(extra[i..i + 2].try_into().ok()?);
            let size = u16::from_le_bytes(extra[i + 2..i + 4].try_into().ok()?) as usize;
            if tag == ZIP64_EXTRA_TAG {
                let mut ptr = i + 4;
                if file_size == SENTINEL_32 as u64 && ptr + 8 <= extra.len() {
                    file_size = u64::from_le_bytes(extra[ptr..ptr + 8].try_into().ok()?);
                    ptr += 8;
                }
                if compress_size == SENTINEL_32 as u64 && ptr + 8 <= extra.len() {
                    compress_size = u64::from_le_bytes(extra[ptr..ptr + 8].try_into().ok()?);
                    ptr += 8;
                }
                if local_header_offset == SENTINEL_32 as u64 && ptr + 8 <= extra.len() {
                    local_header_offset =
                        u64::from_le_bytes(extra[ptr..ptr + 8].try_into().ok()?);
                }
            }
            i += 4 + size;
        }

        Some((
            CdEntry {
                filename,
                compression_method,
                compress_size,
                file_size,
                local_header_offset,
                crc32,
                dostime,
                dosdate,
            },
            total_len,
        ))
    }
}

pub struct Zip64EndCd {
    pub entry_count: u64,
    pub size_of_cd: u64,
    pub offset_of_cd: u64,
}

impl Zip64EndCd {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(56);
        out.extend_from_slice(&ZIP64_EOCD_SIG.to_le_bytes());
        out.extend_from_slice(&44u64.to_le_bytes()); // size_of_header (fixed part after this field)
        out.extend_from_slice(&0x2du16.to_le_bytes());
        out.extend_from_slice(&0x2du16.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&self.entry_count.to_le_bytes());
        out.extend_from_slice(&self.entry_count.to_le_bytes());
        out.extend_from_slice(&self.size_of_cd.to_le_bytes());
        out.extend_from_slice(&self.offset_of_cd.to_le_bytes());
        out
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < 56 {
            return None;
        }
        let magic = u32::from_le_bytes(buf[0..4].try_into().ok()?);
        if magic != ZIP64_EOCD_SIG {
            return None;
        }
        Some(Zip64EndCd {
            entry_count: u64::from_le_bytes(buf[32..40].try_into().ok()?),
            size_of_cd: u64::from_le_bytes(buf[40..48].try_into().ok()?),
            offset_of_cd: u64::from_le_bytes(buf[48..56].try_into().ok()?),
        })
    }
}

pub struct Zip64CdLocator {
    pub offset_of_end_cd: u64,
}

impl Zip64CdLocator {
    pub fn encode(&self) -> [u8; 20] {
        let mut out = [0u8; 20];
        out[0..4].copy_from_slice(&ZIP64_LOCATOR_SIG.to_le_bytes());
        out[4..8].copy_from_slice(&0u32.to_le_bytes());
        out[8..16].copy_from_slice(&self.offset_of_end_cd.to_le_bytes());
        out[16..20].copy_from_slice(&1u32.to_le_bytes());
        out
    }

    pub fn decode(buf: &[u8; 20]) -> Option<Self> {
        let magic = u32::from_le_bytes(buf[0..4].try_into().ok()?);
        if magic != ZIP64_LOCATOR_SIG {
            return None;
        }
        Some(Zip64CdLocator {
            offset_of_end_cd: u64::from_le_bytes(buf[8..16].try_into().ok()?),
        })
    }
}

pub struct EndCentralDirectory {
    pub total_entries: u16,
    pub size_of_cd: i32,
    pub offset_of_cd: i32,
    pub comment: Vec<u8>,
}

impl EndCentralDirectory {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(22 + self.comment.len());
        out.extend_from_slice(&EOCD_SIGNATURE.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&self.total_entries.to_le_bytes());
        out.extend_from_slice(&self.total_entries.to_le_bytes());
        out.extend_from_slice(&self.size_of_cd.to_le_bytes());
        out.extend_from_slice(&self.offset_of_cd.to_le_bytes());
        out.extend_from_slice(&(self.comment.len() as u16).to_le_bytes());
        out.extend_from_slice(&self.comment);
        out
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < 22 {
            return None;
        }
        let magic = u32::from_le_bytes(buf[0..4].try_into().ok()?);
        if magic != EOCD_SIGNATURE {
            return None;
        }
        let total_entries = u16::from_le_bytes(buf[10..12].try_into().ok()?);
        let size_of_cd = i32::from_le_bytes(buf[12..16].try_into().ok()?);
        let offset_of_cd = i32::from_le_bytes(buf[16..20].try_into().ok()?);
        let comment_len = u16::from_le_bytes(buf[20..22].try_into().ok()?) as usize;
        let comment = if buf.len() >= 22 + comment_len {
            buf[22..22 + comment_len].to_vec()
        } else {
            Vec::new()
        };
        Some(EndCentralDirectory {
            total_entries,
            size_of_cd,
            offset_of_cd,
            comment,
        })
    }
}

/// DOS time/date pair for "now", good enough for deterministic-ish output;
/// AFF4 does not rely on timestamp accuracy for round-tripping.
pub fn dos_now() -> (u16, u16) {
    (0, 0x21)
}
