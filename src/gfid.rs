//! Globally unique file identifiers.
//!
//! A gfid is 16 opaque bytes. The canonical text form is the 36-character
//! hyphenated rendering, which doubles as the logical-volume name for
//! bd-bound files (`/dev/<vg>/<gfid>`).

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

/// A 16-byte globally unique file id.
#[derive(Clone, Copy, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Gfid(pub [u8; 16]);

impl Gfid {
    /// The all-zero gfid. Reserved; never names an LV.
    pub const NULL: Gfid = Gfid([0; 16]);

    /// True for the reserved all-zero id.
    pub fn is_null(&self) -> bool {
        self.0 == [0; 16]
    }

    /// Mint a fresh id. Process-unique and time-seeded; not a standards
    /// UUID but formatted like one.
    pub fn generate() -> Gfid {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let mut raw = [0u8; 16];
        raw[..8].copy_from_slice(&now.as_nanos().to_be_bytes()[8..]);
        raw[8..12].copy_from_slice(&(std::process::id()).to_be_bytes());
        raw[12..].copy_from_slice(&(seq as u32).wrapping_add(1).to_be_bytes());
        // Version/variant nibbles keep the text form parseable as a UUID.
        raw[6] = (raw[6] & 0x0f) | 0x40;
        raw[8] = (raw[8] & 0x3f) | 0x80;
        Gfid(raw)
    }
}

impl fmt::Display for Gfid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7], b[8], b[9], b[10],
            b[11], b[12], b[13], b[14], b[15]
        )
    }
}

impl fmt::Debug for Gfid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Gfid({self})")
    }
}

/// Error parsing the canonical hyphenated form.
#[derive(Debug, Eq, PartialEq)]
pub struct InvalidGfid;

impl fmt::Display for InvalidGfid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid gfid string")
    }
}

impl std::error::Error for InvalidGfid {}

impl FromStr for Gfid {
    type Err = InvalidGfid;

    fn from_str(s: &str) -> Result<Gfid, InvalidGfid> {
        let bytes = s.as_bytes();
        if bytes.len() != 36 {
            return Err(InvalidGfid);
        }
        let mut raw = [0u8; 16];
        let mut idx = 0;
        let mut pos = 0;
        while pos < 36 {
            if pos == 8 || pos == 13 || pos == 18 || pos == 23 {
                if bytes[pos] != b'-' {
                    return Err(InvalidGfid);
                }
                pos += 1;
                continue;
            }
            let hi = hex_val(bytes[pos]).ok_or(InvalidGfid)?;
            let lo = hex_val(bytes[pos + 1]).ok_or(InvalidGfid)?;
            raw[idx] = (hi << 4) | lo;
            idx += 1;
            pos += 2;
        }
        Ok(Gfid(raw))
    }
}

fn hex_val(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}
