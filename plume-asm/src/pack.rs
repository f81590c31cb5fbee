//! AVM pack archive framing.
//!
//! A pack is the 24-byte header `#!/usr/bin/env AtomVM\n\0\0` followed by
//! records of the form `{size[u32 be], flags[u32 be], reserved[u32],
//! name[nul-terminated], pad-to-4, payload}`. `size` covers the whole
//! record. A record with `flags == 0` terminates the stream.

/// Record flag: this module is the entry point.
pub const FLAG_START: u32 = 0x01;
/// Record flag: the payload is a module image.
pub const FLAG_BEAM: u32 = 0x02;

const HEADER: &[u8; 24] = b"#!/usr/bin/env AtomVM\n\0\0";

/// Malformed pack archives.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PackError {
    /// The 24-byte pack header is missing.
    #[error("bad pack header")]
    BadHeader,
    /// A record runs past the end of the archive.
    #[error("truncated record at offset {0}")]
    Truncated(usize),
    /// A record name is not valid UTF-8 or lacks its terminator.
    #[error("malformed record name at offset {0}")]
    BadName(usize),
}

/// One record of a pack archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackRecord<'a> {
    /// Record name; module records carry the module file name.
    pub name: &'a str,
    /// Flag bits ([`FLAG_START`], [`FLAG_BEAM`]).
    pub flags: u32,
    /// Record payload.
    pub data: &'a [u8],
}

impl PackRecord<'_> {
    /// Whether the payload is a module image.
    pub fn is_beam(&self) -> bool {
        self.flags & FLAG_BEAM != 0
    }

    /// Whether this module is the entry point.
    pub fn is_start(&self) -> bool {
        self.flags & FLAG_START != 0
    }
}

/// Parses an archive into its records, stopping at the terminator.
pub fn records(data: &[u8]) -> Result<Vec<PackRecord<'_>>, PackError> {
    if data.len() < HEADER.len() || &data[..HEADER.len()] != HEADER {
        return Err(PackError::BadHeader);
    }

    let mut out = Vec::new();
    let mut at = HEADER.len();
    loop {
        let fields = data.get(at..at + 12).ok_or(PackError::Truncated(at))?;
        let size = u32::from_be_bytes(fields[0..4].try_into().expect("4 bytes")) as usize;
        let flags = u32::from_be_bytes(fields[4..8].try_into().expect("4 bytes"));
        if flags == 0 {
            return Ok(out);
        }
        let record_end = at + size;
        if record_end > data.len() || size < 12 {
            return Err(PackError::Truncated(at));
        }

        let name_start = at + 12;
        let name_end = data[name_start..record_end]
            .iter()
            .position(|b| *b == 0)
            .map(|i| name_start + i)
            .ok_or(PackError::BadName(name_start))?;
        let name =
            core::str::from_utf8(&data[name_start..name_end]).map_err(|_| PackError::BadName(name_start))?;

        let mut payload_start = name_end + 1;
        payload_start += (4 - payload_start % 4) % 4;
        if payload_start > record_end {
            return Err(PackError::Truncated(at));
        }

        out.push(PackRecord {
            name,
            flags,
            data: &data[payload_start..record_end],
        });
        at = record_end;
    }
}

/// Writes an archive from `(name, flags, payload)` records, appending the
/// terminator. The test-suite counterpart of [`records`].
pub fn write(records: &[(&str, u32, &[u8])]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(HEADER);
    for (name, flags, payload) in records {
        let mut name_field = name.as_bytes().to_vec();
        name_field.push(0);
        while (12 + name_field.len()) % 4 != 0 {
            name_field.push(0);
        }
        let size = 12 + name_field.len() + payload.len();
        out.extend_from_slice(&(size as u32).to_be_bytes());
        out.extend_from_slice(&flags.to_be_bytes());
        out.extend_from_slice(&0u32.to_be_bytes());
        out.extend_from_slice(&name_field);
        out.extend_from_slice(payload);
    }
    // Terminator record.
    out.extend_from_slice(&24u32.to_be_bytes());
    out.extend_from_slice(&0u32.to_be_bytes());
    out.extend_from_slice(&0u32.to_be_bytes());
    out.extend_from_slice(b"end\0\0\0\0\0\0\0\0\0");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_records() {
        let payload = [1u8, 2, 3, 4];
        let archive = write(&[
            ("main.beam", FLAG_BEAM | FLAG_START, &payload),
            ("lib.beam", FLAG_BEAM, &payload),
        ]);
        let records = records(&archive).expect("parses");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].name, "main.beam");
        assert!(records[0].is_start() && records[0].is_beam());
        assert_eq!(records[0].data, &payload);
        assert!(!records[1].is_start());
    }

    #[test]
    fn rejects_foreign_headers() {
        assert_eq!(records(b"#!/bin/sh\n"), Err(PackError::BadHeader));
    }
}
