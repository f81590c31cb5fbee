//! `FOR1`/`BEAM` chunk container framing.
//!
//! A module image is the magic `FOR1`, a big-endian 32-bit payload size,
//! the magic `BEAM`, then 4-byte-aligned chunks of the form
//! `{tag[4], size[u32 be], payload[size], pad-to-4}`. This module scans an
//! image into raw chunk slices and parses the code chunk sub-header; it
//! knows nothing about atoms or terms.

use core::ops::Range;

/// Malformed module images.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BeamError {
    /// Image too short or a chunk runs past the end.
    #[error("truncated image at offset {0}")]
    Truncated(usize),
    /// The `FOR1` or `BEAM` magic is missing.
    #[error("bad container magic")]
    BadMagic,
    /// A required chunk is absent.
    #[error("missing required chunk {0}")]
    MissingChunk(&'static str),
    /// The code chunk sub-header is malformed.
    #[error("malformed code chunk")]
    BadCodeChunk,
}

fn read_u32(data: &[u8], at: usize) -> Result<u32, BeamError> {
    let bytes = data
        .get(at..at + 4)
        .ok_or(BeamError::Truncated(at))?
        .try_into()
        .expect("4-byte slice");
    Ok(u32::from_be_bytes(bytes))
}

/// Byte ranges of the chunks of one module image.
///
/// Ranges index the original image so the caller can keep a single owned
/// buffer and slice into it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BeamChunks {
    /// `AtU8`: length-prefixed UTF-8 atom names.
    pub atoms: Range<usize>,
    /// `Code`: sub-header plus instruction stream.
    pub code: Range<usize>,
    /// `ExpT`: exported functions.
    pub exports: Range<usize>,
    /// `ImpT`: imported functions.
    pub imports: Range<usize>,
    /// `StrT`: the string pool.
    pub strings: Range<usize>,
    /// `LitT`: zlib-compressed literal table, if present.
    pub literals_compressed: Option<Range<usize>>,
    /// `LitU`: uncompressed literal table, if present.
    pub literals_plain: Option<Range<usize>>,
    /// `FunT`: fun table, if present.
    pub funs: Option<Range<usize>>,
    /// `LocT`: local labels, if present.
    pub locals: Option<Range<usize>>,
}

/// Scans an image into chunk ranges.
///
/// `AtU8`, `Code`, `ExpT`, `ImpT` and `StrT` are required; `StrT` may be
/// empty but must be present. Unknown chunk tags are skipped.
pub fn scan(image: &[u8]) -> Result<BeamChunks, BeamError> {
    if image.len() < 12 {
        return Err(BeamError::Truncated(image.len()));
    }
    if &image[0..4] != b"FOR1" || &image[8..12] != b"BEAM" {
        return Err(BeamError::BadMagic);
    }
    let total = read_u32(image, 4)? as usize;
    let end = (total + 8).min(image.len());

    let mut chunks = BeamChunks::default();
    let mut seen = [false; 5];
    let mut at = 12;
    while at + 8 <= end {
        let tag: [u8; 4] = image[at..at + 4].try_into().expect("4-byte tag");
        let size = read_u32(image, at + 4)? as usize;
        let payload = at + 8..at + 8 + size;
        if payload.end > image.len() {
            return Err(BeamError::Truncated(at));
        }
        match &tag {
            b"AtU8" => {
                chunks.atoms = payload.clone();
                seen[0] = true;
            }
            b"Code" => {
                chunks.code = payload.clone();
                seen[1] = true;
            }
            b"ExpT" => {
                chunks.exports = payload.clone();
                seen[2] = true;
            }
            b"ImpT" => {
                chunks.imports = payload.clone();
                seen[3] = true;
            }
            b"StrT" => {
                chunks.strings = payload.clone();
                seen[4] = true;
            }
            b"LitT" => chunks.literals_compressed = Some(payload.clone()),
            b"LitU" => chunks.literals_plain = Some(payload.clone()),
            b"FunT" => chunks.funs = Some(payload.clone()),
            b"LocT" => chunks.locals = Some(payload.clone()),
            _ => {}
        }
        at = payload.end + ((4 - payload.end % 4) % 4);
    }

    const REQUIRED: [&str; 5] = ["AtU8", "Code", "ExpT", "ImpT", "StrT"];
    for (present, name) in seen.iter().zip(REQUIRED) {
        if !present {
            return Err(BeamError::MissingChunk(name));
        }
    }
    Ok(chunks)
}

/// Parsed code chunk sub-header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeHeader {
    /// Instruction-set version.
    pub version: u32,
    /// Highest opcode used by the module.
    pub max_opcode: u32,
    /// Number of labels (label numbers are `1..count`).
    pub label_count: u32,
    /// Number of functions.
    pub function_count: u32,
    /// Offset of the first instruction within the code chunk payload.
    pub code_start: usize,
}

impl CodeHeader {
    /// Parses the sub-header of a code chunk payload.
    pub fn parse(code_chunk: &[u8]) -> Result<Self, BeamError> {
        let word = |at: usize| -> Result<u32, BeamError> {
            code_chunk
                .get(at..at + 4)
                .map(|b| u32::from_be_bytes(b.try_into().expect("4-byte slice")))
                .ok_or(BeamError::BadCodeChunk)
        };
        let info_size = word(0)? as usize;
        let header = CodeHeader {
            version: word(4)?,
            max_opcode: word(8)?,
            label_count: word(12)?,
            function_count: word(16)?,
            code_start: 4 + info_size,
        };
        if header.code_start > code_chunk.len() {
            return Err(BeamError::BadCodeChunk);
        }
        Ok(header)
    }
}

/// Assembles module images for tests and tooling.
#[derive(Debug, Default)]
pub struct Builder {
    chunks: Vec<([u8; 4], Vec<u8>)>,
}

impl Builder {
    /// Empty image.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a raw chunk.
    pub fn chunk(&mut self, tag: [u8; 4], payload: Vec<u8>) -> &mut Self {
        self.chunks.push((tag, payload));
        self
    }

    /// Appends an `AtU8` chunk from atom names. The first name is the
    /// module atom by convention.
    pub fn atoms(&mut self, names: &[&str]) -> &mut Self {
        let mut payload = Vec::new();
        payload.extend_from_slice(&(names.len() as u32).to_be_bytes());
        for name in names {
            payload.push(name.len() as u8);
            payload.extend_from_slice(name.as_bytes());
        }
        self.chunk(*b"AtU8", payload)
    }

    /// Appends a `Code` chunk around assembled instructions.
    pub fn code(&mut self, instructions: &[u8], label_count: u32, function_count: u32) -> &mut Self {
        let mut payload = Vec::with_capacity(20 + instructions.len());
        payload.extend_from_slice(&16u32.to_be_bytes());
        payload.extend_from_slice(&0u32.to_be_bytes()); // version
        payload.extend_from_slice(&(crate::opcode::Opcode::RecvMarkerUse as u32).to_be_bytes());
        payload.extend_from_slice(&label_count.to_be_bytes());
        payload.extend_from_slice(&function_count.to_be_bytes());
        payload.extend_from_slice(instructions);
        self.chunk(*b"Code", payload)
    }

    /// Appends an `ExpT` chunk of `(function_atom, arity, label)` rows.
    pub fn exports(&mut self, rows: &[(u32, u32, u32)]) -> &mut Self {
        self.chunk(*b"ExpT", Self::table(rows))
    }

    /// Appends an `ImpT` chunk of `(module_atom, function_atom, arity)`
    /// rows.
    pub fn imports(&mut self, rows: &[(u32, u32, u32)]) -> &mut Self {
        self.chunk(*b"ImpT", Self::table(rows))
    }

    /// Appends a `StrT` chunk.
    pub fn strings(&mut self, pool: &[u8]) -> &mut Self {
        self.chunk(*b"StrT", pool.to_vec())
    }

    /// Appends a `LitU` chunk of raw external-term blobs.
    pub fn literals(&mut self, blobs: &[Vec<u8>]) -> &mut Self {
        let mut payload = Vec::new();
        payload.extend_from_slice(&(blobs.len() as u32).to_be_bytes());
        for blob in blobs {
            payload.extend_from_slice(&(blob.len() as u32).to_be_bytes());
            payload.extend_from_slice(blob);
        }
        self.chunk(*b"LitU", payload)
    }

    /// Appends a `FunT` chunk of
    /// `(fun_atom, total_arity, label, index, n_free, old_uniq)` rows.
    pub fn funs(&mut self, rows: &[(u32, u32, u32, u32, u32, u32)]) -> &mut Self {
        let mut payload = Vec::new();
        payload.extend_from_slice(&(rows.len() as u32).to_be_bytes());
        for (a, b, c, d, e, f) in rows {
            for field in [a, b, c, d, e, f] {
                payload.extend_from_slice(&field.to_be_bytes());
            }
        }
        self.chunk(*b"FunT", payload)
    }

    fn table(rows: &[(u32, u32, u32)]) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&(rows.len() as u32).to_be_bytes());
        for (a, b, c) in rows {
            payload.extend_from_slice(&a.to_be_bytes());
            payload.extend_from_slice(&b.to_be_bytes());
            payload.extend_from_slice(&c.to_be_bytes());
        }
        payload
    }

    /// Produces the framed image.
    pub fn build(&self) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(b"BEAM");
        for (tag, payload) in &self.chunks {
            body.extend_from_slice(tag);
            body.extend_from_slice(&(payload.len() as u32).to_be_bytes());
            body.extend_from_slice(payload);
            while body.len() % 4 != 0 {
                body.push(0);
            }
        }
        let mut image = Vec::with_capacity(body.len() + 8);
        image.extend_from_slice(b"FOR1");
        image.extend_from_slice(&(body.len() as u32).to_be_bytes());
        image.extend_from_slice(&body);
        image
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_image() -> Vec<u8> {
        let mut b = Builder::new();
        b.atoms(&["m", "f"])
            .code(&[3], 1, 1)
            .exports(&[(2, 0, 1)])
            .imports(&[])
            .strings(&[]);
        b.build()
    }

    #[test]
    fn scans_a_built_image() {
        let image = minimal_image();
        let chunks = scan(&image).expect("scans");
        assert_eq!(&image[chunks.atoms.start..chunks.atoms.start + 4], &[0, 0, 0, 2]);
        let header = CodeHeader::parse(&image[chunks.code.clone()]).expect("code header");
        assert_eq!(header.label_count, 1);
        assert_eq!(header.function_count, 1);
        assert_eq!(header.code_start, 20);
        assert_eq!(image[chunks.code.start + header.code_start], 3);
    }

    #[test]
    fn missing_required_chunk_is_an_error() {
        let mut b = Builder::new();
        b.atoms(&["m"]).code(&[3], 1, 0).exports(&[]).strings(&[]);
        assert_eq!(scan(&b.build()), Err(BeamError::MissingChunk("ImpT")));
    }

    #[test]
    fn bad_magic_is_an_error() {
        assert_eq!(scan(b"FOR2AAAABEAM"), Err(BeamError::BadMagic));
    }
}
