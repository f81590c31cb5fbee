//! Bit-level binary construction and matching.
//!
//! This implementation keeps the reference restrictions: only byte
//! aligned offsets and sizes, unit 8 (unit 1 for integer writes), and
//! empty flag sets are accepted; everything else raises `unsupported`.
//! Reads and writes are big-endian, unsigned.

use crate::heap::Heap;
use crate::term::Term;

bitflags::bitflags! {
    /// Bit-syntax flags. All of them are rejected today; the type exists
    /// so call sites parse the operand instead of a bare integer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BsFlags: u32 {
        /// Little-endian access.
        const LITTLE = 0x02;
        /// Signed extraction.
        const SIGNED = 0x04;
        /// Host byte order.
        const NATIVE = 0x10;
    }
}

/// Failure modes of bitstring primitives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BsError {
    /// Raise `unsupported`: the operation needs a feature this
    /// implementation restricts away.
    Unsupported,
    /// Raise `badarg`: the operation overran or got the wrong shape.
    Badarg,
    /// Expected match failure: jump to the fail label.
    Fail,
}

fn check_flags(flags: i64) -> Result<(), BsError> {
    match BsFlags::from_bits(flags as u32) {
        Some(f) if f.is_empty() => Ok(()),
        _ => Err(BsError::Unsupported),
    }
}

fn check_aligned(bits: usize) -> Result<usize, BsError> {
    if bits % 8 != 0 {
        return Err(BsError::Unsupported);
    }
    Ok(bits / 8)
}

/// Writes `size_bits` of `value` into the build target at `offset_bits`.
pub fn insert_integer(
    heap: &mut Heap,
    target: Term,
    offset_bits: usize,
    value: i64,
    size_bits: i64,
    flags: i64,
) -> Result<(), BsError> {
    check_flags(flags)?;
    if size_bits < 0 || size_bits > 64 {
        return Err(BsError::Unsupported);
    }
    let size_bytes = check_aligned(size_bits as usize)?;
    let offset_bytes = check_aligned(offset_bits)?;
    if offset_bytes + size_bytes > heap.binary_size(target) {
        return Err(BsError::Badarg);
    }
    let mut bytes = [0u8; 8];
    for (i, b) in bytes.iter_mut().take(size_bytes).enumerate() {
        *b = (value >> (8 * (size_bytes - 1 - i))) as u8;
    }
    heap.binary_write(target, offset_bytes, &bytes[..size_bytes]);
    Ok(())
}

/// Copies `size_bytes` of `src` into the build target at `offset_bits`.
pub fn insert_binary(
    heap: &mut Heap,
    target: Term,
    offset_bits: usize,
    src: Term,
    size_bytes: usize,
) -> Result<(), BsError> {
    let offset_bytes = check_aligned(offset_bits)?;
    if size_bytes > heap.binary_size(src) {
        return Err(BsError::Badarg);
    }
    if offset_bytes + size_bytes > heap.binary_size(target) {
        return Err(BsError::Badarg);
    }
    let bytes = heap.binary_bytes(src);
    heap.binary_write(target, offset_bytes, &bytes[..size_bytes]);
    Ok(())
}

/// Reads `size_bits` from `bin` at `offset_bits` as an unsigned
/// big-endian integer. Running past the end is an expected match
/// failure.
pub fn extract_integer(
    heap: &Heap,
    bin: Term,
    offset_bits: usize,
    size_bits: usize,
    flags: i64,
) -> Result<i64, BsError> {
    check_flags(flags)?;
    if size_bits > 64 {
        return Err(BsError::Unsupported);
    }
    let size_bytes = check_aligned(size_bits)?;
    let offset_bytes = check_aligned(offset_bits)?;
    if offset_bytes + size_bytes > heap.binary_size(bin) {
        return Err(BsError::Fail);
    }
    let mut value: u64 = 0;
    for i in 0..size_bytes {
        value = (value << 8) | u64::from(heap.binary_byte(bin, offset_bytes + i));
    }
    Ok(value as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_round_trip() {
        let mut heap = Heap::with_capacity(64);
        let bin = heap.alloc_binary(4);
        insert_integer(&mut heap, bin, 0, 0xDEAD, 16, 0).expect("writes");
        insert_integer(&mut heap, bin, 16, 0xBEEF, 16, 0).expect("writes");
        assert_eq!(heap.binary_bytes(bin), [0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(extract_integer(&heap, bin, 0, 32, 0), Ok(0xDEADBEEF));
        assert_eq!(extract_integer(&heap, bin, 16, 16, 0), Ok(0xBEEF));
    }

    #[test]
    fn unaligned_sizes_are_unsupported() {
        let mut heap = Heap::with_capacity(64);
        let bin = heap.alloc_binary(4);
        assert_eq!(
            insert_integer(&mut heap, bin, 0, 1, 3, 0),
            Err(BsError::Unsupported)
        );
        assert_eq!(extract_integer(&heap, bin, 0, 7, 0), Err(BsError::Unsupported));
    }

    #[test]
    fn flags_are_unsupported() {
        let mut heap = Heap::with_capacity(64);
        let bin = heap.alloc_binary(4);
        assert_eq!(
            insert_integer(&mut heap, bin, 0, 1, 8, BsFlags::LITTLE.bits() as i64),
            Err(BsError::Unsupported)
        );
    }

    #[test]
    fn overrun_write_is_badarg_and_overrun_read_fails() {
        let mut heap = Heap::with_capacity(64);
        let bin = heap.alloc_binary(2);
        assert_eq!(
            insert_integer(&mut heap, bin, 8, 1, 16, 0),
            Err(BsError::Badarg)
        );
        assert_eq!(extract_integer(&heap, bin, 8, 16, 0), Err(BsError::Fail));
    }

    #[test]
    fn binary_insert_copies_bytes() {
        let mut heap = Heap::with_capacity(64);
        let src = heap.alloc_binary(3);
        heap.binary_write(src, 0, b"abc");
        let dst = heap.alloc_binary(5);
        insert_binary(&mut heap, dst, 16, src, 3).expect("writes");
        assert_eq!(heap.binary_bytes(dst), b"\0\0abc");
    }
}
