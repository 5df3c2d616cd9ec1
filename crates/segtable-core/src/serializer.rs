//! Binary format for table segment records
//!
//! Every record is an [`EntryHeader`] (24 bytes) followed by the key bytes and
//! the value bytes. Records carry a backpointer to the previous record of the
//! same bucket, so a bucket chain can be walked using the segment alone.

use crate::entry::{TableEntry, TableKey};
use crate::error::{TableError, TableResult};

/// Header size in bytes
pub const HEADER_SIZE: usize = 24;

/// Current record format version
pub const FORMAT_VERSION: u8 = 1;

/// Maximum key length in bytes
pub const MAX_KEY_LENGTH: usize = 8192;

/// Maximum length of one serialized record (1MB)
pub const MAX_SERIALIZATION_LENGTH: usize = 1024 * 1024;

/// Maximum value length in bytes
pub const MAX_VALUE_LENGTH: usize = MAX_SERIALIZATION_LENGTH - HEADER_SIZE - MAX_KEY_LENGTH;

/// value_length marker for removals
const TOMBSTONE_MARKER: u32 = u32::MAX;

/// backpointer marker for the last record of a chain
const NO_BACKPOINTER: u64 = u64::MAX;

/// Bytes covered by the header checksum (everything before the checksum field)
const CHECKSUMMED_HEADER: usize = 20;

/// Fixed-size header of each record
///
/// Layout (little-endian):
///   [0..4]   total_length: u32 - header + key + value
///   [4]      version:      u8
///   [5]      reserved:     u8
///   [6..8]   key_length:   u16
///   [8..12]  value_length: u32 - 0xFFFF_FFFF marks a removal
///   [12..20] backpointer:  u64 - 0xFFFF_FFFF_FFFF_FFFF ends the chain
///   [20..24] checksum:     u32 - CRC32C of bytes [0..20] + key + value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryHeader {
    pub total_length: usize,
    pub key_length: usize,
    /// `None` for removals
    pub value_length: Option<usize>,
    pub backpointer: Option<u64>,
    pub checksum: u32,
}

impl EntryHeader {
    fn new(key_length: usize, value_length: Option<usize>, backpointer: Option<u64>) -> Self {
        Self {
            total_length: HEADER_SIZE + key_length + value_length.unwrap_or(0),
            key_length,
            value_length,
            backpointer,
            checksum: 0,
        }
    }

    pub fn is_deletion(&self) -> bool {
        self.value_length.is_none()
    }

    fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&(self.total_length as u32).to_le_bytes());
        buf[4] = FORMAT_VERSION;
        buf[6..8].copy_from_slice(&(self.key_length as u16).to_le_bytes());
        let value_length = self.value_length.map_or(TOMBSTONE_MARKER, |v| v as u32);
        buf[8..12].copy_from_slice(&value_length.to_le_bytes());
        buf[12..20].copy_from_slice(&self.backpointer.unwrap_or(NO_BACKPOINTER).to_le_bytes());
        buf[20..24].copy_from_slice(&self.checksum.to_le_bytes());
        buf
    }

    /// Parse and validate a header read at segment `offset`.
    fn from_bytes(buf: &[u8; HEADER_SIZE], offset: u64) -> TableResult<Self> {
        let total_length = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        let version = buf[4];
        let key_length = u16::from_le_bytes([buf[6], buf[7]]) as usize;
        let raw_value_length = u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]);
        let raw_backpointer = u64::from_le_bytes(buf[12..20].try_into().unwrap_or([0xFF; 8]));
        let checksum = u32::from_le_bytes([buf[20], buf[21], buf[22], buf[23]]);

        if version != FORMAT_VERSION {
            return Err(TableError::data_format(offset, format!("unsupported record version {}", version)));
        }
        if key_length > MAX_KEY_LENGTH {
            return Err(TableError::data_format(
                offset,
                format!("key length {} exceeds {}", key_length, MAX_KEY_LENGTH),
            ));
        }

        let value_length = if raw_value_length == TOMBSTONE_MARKER {
            None
        } else if raw_value_length as usize > MAX_VALUE_LENGTH {
            return Err(TableError::data_format(
                offset,
                format!("value length {} exceeds {}", raw_value_length, MAX_VALUE_LENGTH),
            ));
        } else {
            Some(raw_value_length as usize)
        };

        let expected_total = HEADER_SIZE + key_length + value_length.unwrap_or(0);
        if total_length != expected_total {
            return Err(TableError::data_format(
                offset,
                format!("total length {} does not match components ({})", total_length, expected_total),
            ));
        }

        let backpointer = match raw_backpointer {
            NO_BACKPOINTER => None,
            bp if bp < offset => Some(bp),
            bp => {
                return Err(TableError::data_format(
                    offset,
                    format!("backpointer {} does not precede the record", bp),
                ))
            }
        };

        Ok(Self { total_length, key_length, value_length, backpointer, checksum })
    }
}

/// A record decoded from a segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub key: Vec<u8>,
    /// `None` for removals
    pub value: Option<Vec<u8>>,
    /// Segment offset of the record
    pub version: u64,
    pub backpointer: Option<u64>,
    pub total_length: usize,
}

impl LogRecord {
    pub fn is_deletion(&self) -> bool {
        self.value.is_none()
    }

    /// Offset of the byte after this record.
    pub fn next_offset(&self) -> u64 {
        self.version + self.total_length as u64
    }
}

/// Encodes and decodes table segment records.
#[derive(Debug, Clone, Copy, Default)]
pub struct EntrySerializer;

impl EntrySerializer {
    pub fn new() -> Self {
        Self
    }

    /// Serialized length of a put, validating key and value sizes.
    pub fn update_length(&self, entry: &TableEntry) -> TableResult<usize> {
        check_lengths(entry.key.key.len(), entry.value.len())?;
        Ok(HEADER_SIZE + entry.key.key.len() + entry.value.len())
    }

    /// Serialized length of a removal, validating the key size.
    pub fn removal_length(&self, key: &TableKey) -> TableResult<usize> {
        check_lengths(key.key.len(), 0)?;
        Ok(HEADER_SIZE + key.key.len())
    }

    /// Serialize a put batch; `backpointers[i]` links `entries[i]` to its bucket chain.
    pub fn serialize_update(&self, entries: &[TableEntry], backpointers: &[Option<u64>]) -> TableResult<Vec<u8>> {
        let length = entries.iter().map(|e| HEADER_SIZE + e.key.key.len() + e.value.len()).sum();
        let mut buffer = Vec::with_capacity(length);
        for (entry, backpointer) in entries.iter().zip(backpointers) {
            self.serialize_record(&mut buffer, &entry.key.key, Some(&entry.value), *backpointer)?;
        }
        Ok(buffer)
    }

    /// Serialize a removal batch; `backpointers[i]` links `keys[i]` to its bucket chain.
    pub fn serialize_removal(&self, keys: &[TableKey], backpointers: &[Option<u64>]) -> TableResult<Vec<u8>> {
        let length = keys.iter().map(|k| HEADER_SIZE + k.key.len()).sum();
        let mut buffer = Vec::with_capacity(length);
        for (key, backpointer) in keys.iter().zip(backpointers) {
            self.serialize_record(&mut buffer, &key.key, None, *backpointer)?;
        }
        Ok(buffer)
    }

    /// Append one record to `buffer`. `value = None` writes a removal.
    pub fn serialize_record(
        &self,
        buffer: &mut Vec<u8>,
        key: &[u8],
        value: Option<&[u8]>,
        backpointer: Option<u64>,
    ) -> TableResult<()> {
        // Validate sizes BEFORE any allocation
        check_lengths(key.len(), value.map_or(0, |v| v.len()))?;

        let mut header = EntryHeader::new(key.len(), value.map(|v| v.len()), backpointer);
        let header_bytes = header.to_bytes();

        let mut digest = crc32c::crc32c(&header_bytes[..CHECKSUMMED_HEADER]);
        digest = crc32c::crc32c_append(digest, key);
        if let Some(value) = value {
            digest = crc32c::crc32c_append(digest, value);
        }
        header.checksum = digest;

        buffer.extend_from_slice(&header.to_bytes());
        buffer.extend_from_slice(key);
        if let Some(value) = value {
            buffer.extend_from_slice(value);
        }
        Ok(())
    }

    /// Decode the header at the start of `data` (which begins at segment `offset`).
    ///
    /// Returns `Ok(None)` if `data` is shorter than a header.
    pub fn read_header(&self, data: &[u8], offset: u64) -> TableResult<Option<EntryHeader>> {
        if data.len() < HEADER_SIZE {
            return Ok(None);
        }
        let mut buf = [0u8; HEADER_SIZE];
        buf.copy_from_slice(&data[..HEADER_SIZE]);
        EntryHeader::from_bytes(&buf, offset).map(Some)
    }

    /// Decode the record at the start of `data` (which begins at segment `offset`).
    ///
    /// Returns `Ok(None)` if `data` ends before the record does, so the caller
    /// may fetch more bytes. Malformed records fail with `DataFormat`.
    pub fn read_record(&self, data: &[u8], offset: u64) -> TableResult<Option<LogRecord>> {
        let header = match self.read_header(data, offset)? {
            Some(header) => header,
            None => return Ok(None),
        };
        if data.len() < header.total_length {
            return Ok(None);
        }

        let key_end = HEADER_SIZE + header.key_length;
        let value_end = header.total_length;

        let mut digest = crc32c::crc32c(&data[..CHECKSUMMED_HEADER]);
        digest = crc32c::crc32c_append(digest, &data[HEADER_SIZE..value_end]);
        if digest != header.checksum {
            return Err(TableError::data_format(
                offset,
                format!("checksum mismatch: expected 0x{:08x}, got 0x{:08x}", header.checksum, digest),
            ));
        }

        Ok(Some(LogRecord {
            key: data[HEADER_SIZE..key_end].to_vec(),
            value: header.value_length.map(|_| data[key_end..value_end].to_vec()),
            version: offset,
            backpointer: header.backpointer,
            total_length: header.total_length,
        }))
    }

    /// Decode consecutive whole records from `data` (which begins at `offset`),
    /// stopping at the first record that does not fit entirely.
    pub fn read_records(&self, data: &[u8], offset: u64) -> TableResult<Vec<LogRecord>> {
        let mut records = Vec::new();
        let mut position = 0usize;
        while let Some(record) = self.read_record(&data[position..], offset + position as u64)? {
            position += record.total_length;
            records.push(record);
        }
        Ok(records)
    }
}

fn check_lengths(key_length: usize, value_length: usize) -> TableResult<()> {
    if key_length > MAX_KEY_LENGTH {
        return Err(TableError::CapacityExceeded { length: key_length, max: MAX_KEY_LENGTH });
    }
    if value_length > MAX_VALUE_LENGTH {
        return Err(TableError::CapacityExceeded { length: value_length, max: MAX_VALUE_LENGTH });
    }
    Ok(())
}
