use bytemuck::Pod;
use std::cell::RefCell;
/// Rounds `value` up to a multiple of `align` (any non-zero `align`).
#[inline]
pub fn align_hi(value: usize, align: usize) -> usize {
    value.div_ceil(align) * align
}
/// Rounds `value` down to a multiple of `align` (any non-zero `align`).
#[inline]
pub fn align_lo(value: usize, align: usize) -> usize {
    value / align * align
}
/// Smallest power of two that is `>= value` (1 for 0).
#[inline]
pub fn pow2_hi(value: usize) -> usize {
    value.max(1).next_power_of_two()
}
pub fn ensure_capacity<T: Clone + Default>(v: &mut Vec<T>, len: usize) {
    if v.len() < len {
        v.resize(len, T::default());
    }
}
/// Bytes a scratch region of `count` elements of `T` needs, including the
/// slack used to align it inside an arbitrary byte buffer.
pub fn scratch_bytes<T: Pod>(count: usize) -> usize {
    if count == 0 {
        0
    } else {
        count * std::mem::size_of::<T>() + std::mem::align_of::<T>() - 1
    }
}
/// Splits an aligned `[T; count]` region off the front of a byte buffer.
///
/// Panics when the buffer is too small; a short scratch buffer is a caller bug.
pub fn carve<T: Pod>(buf: &mut [u8], count: usize) -> (&mut [T], &mut [u8]) {
    if count == 0 {
        return (&mut [], buf);
    }
    let pad = buf.as_ptr().align_offset(std::mem::align_of::<T>());
    let bytes = count * std::mem::size_of::<T>();
    assert!(
        pad.saturating_add(bytes) <= buf.len(),
        "scratch buffer too small: need {} bytes, have {}",
        pad.saturating_add(bytes),
        buf.len()
    );
    let (_, rest) = buf.split_at_mut(pad);
    let (head, tail) = rest.split_at_mut(bytes);
    (bytemuck::cast_slice_mut(head), tail)
}
thread_local! {
    static SCRATCH: RefCell<Vec<u8>> = const { RefCell::new(Vec::new()) };
}
/// Runs `f` with a thread-local scratch buffer of at least `len` bytes.
pub fn with_scratch<R>(len: usize, f: impl FnOnce(&mut [u8]) -> R) -> R {
    SCRATCH.with(|cell| match cell.try_borrow_mut() {
        Ok(mut buf) => {
            ensure_capacity(&mut buf, len);
            f(&mut buf[..len])
        }
        Err(_) => {
            let mut local = vec![0u8; len];
            f(&mut local)
        }
    })
}
#[cfg(test)]
mod tests {
    use super::*;
    #[test]
    fn test_alignment_helpers() {
        assert_eq!(align_hi(0, 4), 0);
        assert_eq!(align_hi(5, 4), 8);
        assert_eq!(align_hi(17, 12), 24);
        assert_eq!(align_lo(17, 12), 12);
        assert_eq!(pow2_hi(3), 4);
        assert_eq!(pow2_hi(4), 4);
        assert_eq!(pow2_hi(0), 1);
    }
    #[test]
    fn test_carve_aligns_and_splits() {
        let mut buf = vec![0u8; scratch_bytes::<i32>(10) + 7];
        let len = buf.len();
        let (words, rest) = carve::<i32>(&mut buf[1..], 10);
        assert_eq!(words.len(), 10);
        assert_eq!(words.as_ptr() as usize % 4, 0);
        words[9] = -1;
        assert!(rest.len() + 40 <= len - 1);
    }
    #[test]
    #[should_panic(expected = "scratch buffer too small")]
    fn test_carve_short_buffer() {
        let mut buf = vec![0u8; 8];
        let _ = carve::<i32>(&mut buf, 16);
    }
    #[test]
    fn test_with_scratch_reentrant() {
        let outer = with_scratch(16, |a| {
            a[0] = 1;
            with_scratch(8, |b| b.len())
        });
        assert_eq!(outer, 8);
    }
}
