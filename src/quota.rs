//! Quota metadata codec.
//!
//! Usage accounting travels as a big-endian record of three signed
//! 64-bit counters. Records written by older releases carry only the
//! size; reading one succeeds with zeroed counts but is flagged so the
//! caller schedules a heal on the next lookup. The quota-conf stream is
//! a fixed ASCII header followed by 16-byte gfid records, each tagged
//! with a one-byte type from format version 1.2 on.

use std::io;
use std::io::Read;

use log::debug;
use zerocopy::BigEndian;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::byteorder::I64;

use crate::dict::Dict;
use crate::dict::DictValue;
use crate::gfid::Gfid;
use crate::iatt::IaType;

/// The conf-file magic; the trailing digits carry the format version.
pub const QUOTA_CONF_HEADER: &str =
    "GlusterFS Quota conf | version: v1.2\n";

/// Current conf format version.
pub const QUOTA_CONF_VERSION: f32 = 1.2;

/// Record type tag: disk-usage limit.
pub const QUOTA_CONF_TYPE_USAGE: u8 = 1;
/// Record type tag: object-count limit.
pub const QUOTA_CONF_TYPE_OBJECTS: u8 = 2;

/// On-wire shape of the accounting record.
#[derive(Clone, Copy, Debug, FromBytes, Immutable, IntoBytes)]
#[repr(C)]
struct QuotaMetaWire {
    size: I64<BigEndian>,
    file_count: I64<BigEndian>,
    dir_count: I64<BigEndian>,
}

/// Usage counters for one directory tree.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct QuotaMeta {
    /// Bytes consumed.
    pub size: i64,
    /// Files beneath the root.
    pub file_count: i64,
    /// Directories beneath the root.
    pub dir_count: i64,
}

impl QuotaMeta {
    /// True when every counter is zero.
    pub fn is_null(&self) -> bool {
        self.size == 0 && self.file_count == 0 && self.dir_count == 0
    }
}

/// What decoding a record found.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum QuotaMetaRead {
    /// A complete record.
    Full(QuotaMeta),
    /// A pre-upgrade 8-byte record: counts default to zero and the
    /// object counters heal on the next lookup.
    Legacy(QuotaMeta),
}

impl QuotaMetaRead {
    /// The decoded counters either way.
    pub fn meta(&self) -> QuotaMeta {
        match self {
            QuotaMetaRead::Full(m) | QuotaMetaRead::Legacy(m) => *m,
        }
    }
}

/// Decode an accounting record. `None` for anything shorter than the
/// legacy 8-byte form.
pub fn meta_from_bytes(data: &[u8]) -> Option<QuotaMetaRead> {
    if data.len() >= size_of::<QuotaMetaWire>() {
        let wire = QuotaMetaWire::read_from_bytes(
            &data[..size_of::<QuotaMetaWire>()],
        )
        .ok()?;
        return Some(QuotaMetaRead::Full(QuotaMeta {
            size: wire.size.get(),
            file_count: wire.file_count.get(),
            dir_count: wire.dir_count.get(),
        }));
    }
    if data.len() >= 2 * size_of::<i64>() {
        // size + file_count, no dir_count
        let size = i64::from_be_bytes(data[..8].try_into().ok()?);
        let file_count = i64::from_be_bytes(data[8..16].try_into().ok()?);
        return Some(QuotaMetaRead::Full(QuotaMeta {
            size,
            file_count,
            dir_count: 0,
        }));
    }
    if data.len() == size_of::<i64>() {
        let size = i64::from_be_bytes(data[..8].try_into().ok()?);
        debug!("quota record is pre-upgrade, object counts missing");
        return Some(QuotaMetaRead::Legacy(QuotaMeta {
            size,
            file_count: 0,
            dir_count: 0,
        }));
    }
    None
}

/// Encode an accounting record. Directories persist all three
/// counters; files omit `dir_count`.
pub fn meta_to_bytes(meta: &QuotaMeta, ia_type: IaType) -> Vec<u8> {
    let wire = QuotaMetaWire {
        size: I64::new(meta.size),
        file_count: I64::new(meta.file_count),
        dir_count: I64::new(meta.dir_count),
    };
    let full = wire.as_bytes();
    match ia_type {
        IaType::Directory => full.to_vec(),
        _ => full[..2 * size_of::<i64>()].to_vec(),
    }
}

/// Fetch and decode a record stored under `key`. A legacy record reads
/// as success here; use [`dict_get_inode_meta`] where the caller needs
/// the heal signal.
pub fn dict_get_meta(dict: &Dict, key: &str) -> Option<QuotaMeta> {
    dict_get_inode_meta(dict, key).map(|read| read.meta())
}

/// Fetch and decode a record, preserving the legacy marker.
pub fn dict_get_inode_meta(dict: &Dict, key: &str) -> Option<QuotaMetaRead> {
    let value = dict.get(key)?;
    meta_from_bytes(value.as_bytes()?)
}

/// Store a record under `key`.
pub fn dict_set_meta(
    dict: &Dict,
    key: &str,
    meta: &QuotaMeta,
    ia_type: IaType,
) {
    let bytes = meta_to_bytes(meta, ia_type);
    dict.set(
        key.to_string(),
        DictValue::Bin(std::sync::Arc::from(bytes.as_slice())),
    );
}

/// Streaming reader for a quota-conf file.
#[derive(Debug)]
pub struct QuotaConfReader<R> {
    source: R,
    version: f32,
}

impl<R: Read> QuotaConfReader<R> {
    /// Consume and check the header; the version parses from its tail.
    pub fn new(mut source: R) -> io::Result<QuotaConfReader<R>> {
        let mut header = vec![0u8; QUOTA_CONF_HEADER.len()];
        let mut filled = 0;
        while filled < header.len() {
            let n = source.read(&mut header[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            // an empty conf file carries the current version
            return Ok(QuotaConfReader {
                source,
                version: QUOTA_CONF_VERSION,
            });
        }
        if filled != header.len() {
            return Err(io::Error::other("short quota conf header"));
        }
        let text = std::str::from_utf8(&header)
            .map_err(|_| io::Error::other("quota conf header not ascii"))?;
        let trimmed = text.trim_end_matches('\n');
        let version: f32 = trimmed[trimmed.len().saturating_sub(3)..]
            .parse()
            .map_err(|_| io::Error::other("bad quota conf version"))?;
        Ok(QuotaConfReader { source, version })
    }

    /// The format version the header declared.
    pub fn version(&self) -> f32 {
        self.version
    }

    /// The next gfid record: the id plus its type tag. `None` at a
    /// clean end of stream.
    pub fn read_gfid(&mut self) -> io::Result<Option<(Gfid, u8)>> {
        let mut raw = [0u8; 16];
        let mut filled = 0;
        while filled < raw.len() {
            let n = self.source.read(&mut raw[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            return Ok(None);
        }
        if filled != raw.len() {
            return Err(io::Error::other("truncated quota conf gfid"));
        }
        let gfid = Gfid(raw);
        if self.version >= 1.2 {
            let mut tag = [0u8; 1];
            let n = self.source.read(&mut tag)?;
            if n != 1 {
                return Err(io::Error::other("missing quota conf type tag"));
            }
            Ok(Some((gfid, tag[0])))
        } else {
            Ok(Some((gfid, QUOTA_CONF_TYPE_USAGE)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn full_record_round_trips() {
        let meta = QuotaMeta {
            size: 1 << 40,
            file_count: 123,
            dir_count: 45,
        };
        let bytes = meta_to_bytes(&meta, IaType::Directory);
        assert_eq!(bytes.len(), 24);
        assert_eq!(
            meta_from_bytes(&bytes),
            Some(QuotaMetaRead::Full(meta))
        );
        // big-endian on the wire
        assert_eq!(&bytes[..8], &(1u64 << 40).to_be_bytes());
    }

    #[test]
    fn file_records_omit_dir_count() {
        let meta = QuotaMeta {
            size: 512,
            file_count: 7,
            dir_count: 99,
        };
        let bytes = meta_to_bytes(&meta, IaType::Regular);
        assert_eq!(bytes.len(), 16);
        let read = meta_from_bytes(&bytes).unwrap();
        assert_eq!(
            read.meta(),
            QuotaMeta {
                size: 512,
                file_count: 7,
                dir_count: 0
            }
        );
    }

    #[test]
    fn legacy_record_is_flagged_for_heal() {
        let bytes = 4096i64.to_be_bytes();
        match meta_from_bytes(&bytes) {
            Some(QuotaMetaRead::Legacy(meta)) => {
                assert_eq!(meta.size, 4096);
                assert_eq!(meta.file_count, 0);
                assert_eq!(meta.dir_count, 0);
            }
            other => panic!("expected legacy read, got {other:?}"),
        }
        assert!(meta_from_bytes(&[0u8; 4]).is_none());
    }

    #[test]
    fn dict_round_trip() {
        let dict = Dict::new();
        let meta = QuotaMeta {
            size: 10,
            file_count: 2,
            dir_count: 1,
        };
        dict_set_meta(&dict, "trusted.glusterfs.quota.size", &meta, IaType::Directory);
        assert_eq!(
            dict_get_meta(&dict, "trusted.glusterfs.quota.size"),
            Some(meta)
        );
        assert!(dict_get_meta(&dict, "missing").is_none());
    }

    #[test]
    fn conf_reader_parses_header_and_records() {
        let a = Gfid::generate();
        let b = Gfid::generate();
        let mut stream = QUOTA_CONF_HEADER.as_bytes().to_vec();
        stream.extend_from_slice(&a.0);
        stream.push(QUOTA_CONF_TYPE_USAGE);
        stream.extend_from_slice(&b.0);
        stream.push(QUOTA_CONF_TYPE_OBJECTS);

        let mut reader = QuotaConfReader::new(Cursor::new(stream)).unwrap();
        assert!((reader.version() - 1.2).abs() < f32::EPSILON);
        assert_eq!(
            reader.read_gfid().unwrap(),
            Some((a, QUOTA_CONF_TYPE_USAGE))
        );
        assert_eq!(
            reader.read_gfid().unwrap(),
            Some((b, QUOTA_CONF_TYPE_OBJECTS))
        );
        assert_eq!(reader.read_gfid().unwrap(), None);
    }

    #[test]
    fn empty_conf_reads_as_current_version() {
        let mut reader =
            QuotaConfReader::new(Cursor::new(Vec::new())).unwrap();
        assert!((reader.version() - QUOTA_CONF_VERSION).abs() < f32::EPSILON);
        assert_eq!(reader.read_gfid().unwrap(), None);
    }

    #[test]
    fn truncated_streams_error() {
        let mut stream = QUOTA_CONF_HEADER.as_bytes().to_vec();
        stream.extend_from_slice(&[1, 2, 3]);
        let mut reader = QuotaConfReader::new(Cursor::new(stream)).unwrap();
        assert!(reader.read_gfid().is_err());

        let short_header = &QUOTA_CONF_HEADER.as_bytes()[..10];
        assert!(QuotaConfReader::new(Cursor::new(short_header)).is_err());
    }
}
