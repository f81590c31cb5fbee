//! The compact operand encoding.
//!
//! Every operand starts with a tag byte whose low nibble selects the broad
//! kind; bits 3..4 select the immediate width scheme (4-bit inline, 11-bit
//! split across two bytes, or an N-byte big-endian two's-complement
//! payload). The same decoder serves the loader (which only needs to walk
//! past operands) and the interpreter (which materializes them against the
//! current process and module).

/// Low-nibble operand kinds.
pub(crate) mod tag {
    pub const LITERAL: u8 = 0;
    pub const SMALL_INT: u8 = 1;
    pub const ATOM: u8 = 2;
    pub const XREG: u8 = 3;
    pub const YREG: u8 = 4;
    pub const EXTENDED: u8 = 7;
    pub const LARGE_LITERAL: u8 = 8;
    pub const LARGE_INTEGER: u8 = 9;
    pub const LARGE_ATOM: u8 = 10;
    pub const LARGE_YREG: u8 = 12;

    /// Full tag bytes of the extended subforms.
    pub const EXT_LIST: u8 = 0x17;
    pub const EXT_FP_REG: u8 = 0x27;
    pub const EXT_ALLOC_LIST: u8 = 0x37;
    pub const EXT_LITERAL: u8 = 0x47;

    /// Immediate-width scheme selector (bits 3..4).
    pub const LARGE_IMM_MASK: u8 = 0x18;
    pub const IMM_11BITS: u8 = 0x08;
    pub const IMM_NBYTES: u8 = 0x18;
}

/// A decoded operand.
///
/// `Untagged` is the wire kind generic listings call "literal": plain
/// unsigned values used for labels, arities, import indices and alloc
/// counts. Loading a term from the module literal table is the separate
/// extended form [`Operand::Literal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    /// Untagged unsigned immediate (labels, counts, indices).
    Untagged(u64),
    /// Tagged integer, small or large; large forms are sign-extended.
    Integer(i64),
    /// Module-local atom index. Index 0 encodes the empty list.
    Atom(u32),
    /// x-register index.
    XReg(u16),
    /// y-register index.
    YReg(u16),
    /// Index into the module literal table.
    Literal(u32),
    /// Extended list header; `0` is the element count that follows.
    List(u32),
    /// Extended allocation list, split by requested kind.
    Alloc(AllocList),
}

/// Allocation counts from an extended alloc list, by kind. The consumer
/// applies its own per-kind word weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AllocList {
    /// Plain heap words.
    pub words: u64,
    /// Boxed floats.
    pub floats: u64,
    /// Fun environments.
    pub funs: u64,
}

/// Operand decoding failures. All of them are fatal for the enclosing
/// module: the encoding is produced by a compiler and never partially
/// valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum OperandError {
    /// The code chunk ended inside an operand.
    #[error("truncated operand at offset {0}")]
    Truncated(usize),
    /// The tag byte does not map to a known kind or width scheme.
    #[error("unsupported operand encoding {tag:#04x} at offset {offset}")]
    Unsupported {
        /// Offending tag byte.
        tag: u8,
        /// Offset of the tag byte within the code chunk.
        offset: usize,
    },
    /// A large-integer payload wider than 8 bytes.
    #[error("oversized integer operand at offset {0}")]
    IntegerTooLarge(usize),
    /// The operand decoded fine but is not the kind the instruction
    /// requires at this position.
    #[error("operand kind mismatch at offset {0}")]
    KindMismatch(usize),
}

fn byte(code: &[u8], at: usize) -> Result<u8, OperandError> {
    code.get(at).copied().ok_or(OperandError::Truncated(at))
}

/// Reads the 4-bit / 11-bit immediate shared by the literal, atom and
/// label kinds. Returns the value and the number of bytes consumed.
fn small_immediate(code: &[u8], pos: usize) -> Result<(u64, usize), OperandError> {
    let first = byte(code, pos)?;
    match (first >> 3) & 0x3 {
        0 | 2 => Ok((u64::from(first >> 4), 1)),
        1 => {
            let low = byte(code, pos + 1)?;
            Ok(((u64::from(first & 0xE0) << 3) | u64::from(low), 2))
        }
        _ => Err(OperandError::Unsupported {
            tag: first,
            offset: pos,
        }),
    }
}

/// Reads the N-byte big-endian two's-complement payload of a large
/// integer. `N = (tag >> 5) + 2`, valid for 2..=8.
fn nbyte_integer(code: &[u8], pos: usize) -> Result<(i64, usize), OperandError> {
    let first = byte(code, pos)?;
    let count = usize::from(first >> 5) + 2;
    if count > 8 {
        return Err(OperandError::IntegerTooLarge(pos));
    }
    let bytes = code
        .get(pos + 1..pos + 1 + count)
        .ok_or(OperandError::Truncated(pos))?;
    let mut value: i64 = if bytes[0] & 0x80 != 0 { -1 } else { 0 };
    for b in bytes {
        value = (value << 8) | i64::from(*b);
    }
    Ok((value, count + 1))
}

/// Decodes one operand, advancing `pos` past it.
pub fn decode_operand(code: &[u8], pos: &mut usize) -> Result<Operand, OperandError> {
    let at = *pos;
    let first = byte(code, at)?;
    let operand = match first & 0xF {
        tag::LITERAL | tag::LARGE_LITERAL => {
            let (value, len) = small_immediate(code, at)?;
            *pos = at + len;
            Operand::Untagged(value)
        }
        tag::SMALL_INT => {
            let (value, len) = small_immediate(code, at)?;
            *pos = at + len;
            Operand::Integer(value as i64)
        }
        tag::ATOM => {
            let (value, len) = small_immediate(code, at)?;
            *pos = at + len;
            Operand::Atom(value as u32)
        }
        tag::LARGE_ATOM => match first & tag::LARGE_IMM_MASK {
            tag::IMM_11BITS => {
                let (value, len) = small_immediate(code, at)?;
                *pos = at + len;
                Operand::Atom(value as u32)
            }
            _ => {
                return Err(OperandError::Unsupported {
                    tag: first,
                    offset: at,
                })
            }
        },
        tag::LARGE_INTEGER => match first & tag::LARGE_IMM_MASK {
            tag::IMM_11BITS => {
                let (value, len) = small_immediate(code, at)?;
                *pos = at + len;
                Operand::Integer(value as i64)
            }
            tag::IMM_NBYTES => {
                let (value, len) = nbyte_integer(code, at)?;
                *pos = at + len;
                Operand::Integer(value)
            }
            _ => {
                return Err(OperandError::Unsupported {
                    tag: first,
                    offset: at,
                })
            }
        },
        tag::XREG => {
            *pos = at + 1;
            Operand::XReg(u16::from(first >> 4))
        }
        tag::YREG => {
            *pos = at + 1;
            Operand::YReg(u16::from(first >> 4))
        }
        tag::LARGE_YREG => {
            if first & tag::LARGE_IMM_MASK != tag::IMM_11BITS {
                return Err(OperandError::Unsupported {
                    tag: first,
                    offset: at,
                });
            }
            let low = byte(code, at + 1)?;
            *pos = at + 2;
            Operand::YReg(((u16::from(first & 0xE0)) << 3) | u16::from(low))
        }
        tag::EXTENDED => match first {
            tag::EXT_LITERAL => {
                let ext = byte(code, at + 1)?;
                match ext & 0xF {
                    0 => {
                        *pos = at + 2;
                        Operand::Literal(u32::from(ext >> 4))
                    }
                    0x8 => {
                        let low = byte(code, at + 2)?;
                        *pos = at + 3;
                        Operand::Literal((u32::from(ext & 0xE0) << 3) | u32::from(low))
                    }
                    _ => {
                        return Err(OperandError::Unsupported {
                            tag: ext,
                            offset: at + 1,
                        })
                    }
                }
            }
            tag::EXT_LIST => {
                let mut next = at + 1;
                let count = match decode_operand(code, &mut next)? {
                    Operand::Untagged(n) => n as u32,
                    _ => return Err(OperandError::KindMismatch(at + 1)),
                };
                *pos = next;
                Operand::List(count)
            }
            tag::EXT_ALLOC_LIST => {
                let mut next = at + 1;
                let pairs = match decode_operand(code, &mut next)? {
                    Operand::Untagged(n) => n,
                    _ => return Err(OperandError::KindMismatch(at + 1)),
                };
                let mut alloc = AllocList::default();
                for _ in 0..pairs {
                    let kind = match decode_operand(code, &mut next)? {
                        Operand::Untagged(k) => k,
                        _ => return Err(OperandError::KindMismatch(next)),
                    };
                    let number = match decode_operand(code, &mut next)? {
                        Operand::Untagged(n) => n,
                        _ => return Err(OperandError::KindMismatch(next)),
                    };
                    match kind {
                        0 => alloc.words += number,
                        1 => alloc.floats += number,
                        2 => alloc.funs += number,
                        _ => {
                            return Err(OperandError::Unsupported {
                                tag: kind as u8,
                                offset: next,
                            })
                        }
                    }
                }
                *pos = next;
                Operand::Alloc(alloc)
            }
            _ => {
                return Err(OperandError::Unsupported {
                    tag: first,
                    offset: at,
                })
            }
        },
        _ => {
            return Err(OperandError::Unsupported {
                tag: first,
                offset: at,
            })
        }
    };
    Ok(operand)
}

impl Operand {
    /// The operand as an untagged unsigned value (labels, counts).
    pub fn untagged(self, at: usize) -> Result<u64, OperandError> {
        match self {
            Operand::Untagged(v) => Ok(v),
            _ => Err(OperandError::KindMismatch(at)),
        }
    }

    /// The operand as a module-local atom index.
    pub fn atom(self, at: usize) -> Result<u32, OperandError> {
        match self {
            Operand::Atom(v) => Ok(v),
            _ => Err(OperandError::KindMismatch(at)),
        }
    }
}

/// Decodes an operand that must be a label (untagged immediate).
pub fn decode_label(code: &[u8], pos: &mut usize) -> Result<u32, OperandError> {
    let at = *pos;
    decode_operand(code, pos)?.untagged(at).map(|v| v as u32)
}

/// Decodes an operand that must be an untagged unsigned immediate.
pub fn decode_untagged(code: &[u8], pos: &mut usize) -> Result<u64, OperandError> {
    let at = *pos;
    decode_operand(code, pos)?.untagged(at)
}

/// Decodes an operand that must be a module-local atom index.
pub fn decode_atom_index(code: &[u8], pos: &mut usize) -> Result<u32, OperandError> {
    let at = *pos;
    decode_operand(code, pos)?.atom(at)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn one(bytes: &[u8]) -> Operand {
        let mut pos = 0;
        let op = decode_operand(bytes, &mut pos).expect("decodes");
        assert_eq!(pos, bytes.len(), "whole operand consumed");
        op
    }

    #[rstest]
    #[case(&[0x00], Operand::Untagged(0))]
    #[case(&[0x50], Operand::Untagged(5))]
    #[case(&[0x08, 0x2A], Operand::Untagged(42))]
    #[case(&[0x28, 0x00], Operand::Untagged(0x100))]
    #[case(&[0x31], Operand::Integer(3))]
    #[case(&[0x12], Operand::Atom(1))]
    #[case(&[0x02], Operand::Atom(0))]
    #[case(&[0x2A, 0x01], Operand::Atom(0x101))]
    #[case(&[0x23], Operand::XReg(2))]
    #[case(&[0xF4], Operand::YReg(15))]
    #[case(&[0x2C, 0x01], Operand::YReg(0x101))]
    #[case(&[0x09, 0xFF], Operand::Integer(255))]
    #[case(&[0xE9, 0xFF], Operand::Integer(0x7FF))]
    #[case(&[0x47, 0x30], Operand::Literal(3))]
    #[case(&[0x47, 0x08, 0x2A], Operand::Literal(42))]
    fn decodes_simple_forms(#[case] bytes: &[u8], #[case] expected: Operand) {
        assert_eq!(one(bytes), expected);
    }

    #[test]
    fn nbyte_integers_sign_extend() {
        // 2-byte form: tag 0x19, payload big-endian.
        assert_eq!(one(&[0x19, 0x12, 0x34]), Operand::Integer(0x1234));
        assert_eq!(one(&[0x19, 0xFF, 0xFE]), Operand::Integer(-2));
        // 8-byte form: tag (6 << 5) | 0x19 = 0xD9.
        assert_eq!(
            one(&[0xD9, 0x7F, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]),
            Operand::Integer(i64::MAX)
        );
    }

    #[test]
    fn alloc_list_accumulates_kinds() {
        // 0x37, 2 pairs: {words, 3}, {floats, 2}
        let bytes = [0x37, 0x20, 0x00, 0x30, 0x10, 0x20];
        assert_eq!(
            one(&bytes),
            Operand::Alloc(AllocList {
                words: 3,
                floats: 2,
                funs: 0
            })
        );
    }

    #[test]
    fn fp_registers_are_rejected() {
        let mut pos = 0;
        let err = decode_operand(&[tag::EXT_FP_REG, 0x00], &mut pos).unwrap_err();
        assert!(matches!(err, OperandError::Unsupported { tag: 0x27, .. }));
    }

    #[test]
    fn truncation_is_reported() {
        let mut pos = 0;
        assert_eq!(
            decode_operand(&[0x08], &mut pos),
            Err(OperandError::Truncated(1))
        );
    }
}
