/// Mask or unmask a payload in place.
///
/// Byte `i` is XORed with `mask[i % 4]`, so applying the same mask twice restores
/// the original bytes.
#[inline]
pub fn apply_mask(buf: &mut [u8], mask: [u8; 4]) {
    apply_mask_fast32(buf, mask)
}

/// A safe unoptimized mask application.
#[inline]
fn apply_mask_fallback(buf: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= mask[i & 3];
    }
}

/// Faster version of `apply_mask()` which operates on 4-byte blocks.
#[inline]
fn apply_mask_fast32(buf: &mut [u8], mask: [u8; 4]) {
    let mask_u32 = u32::from_ne_bytes(mask);

    let mut blocks = buf.chunks_exact_mut(4);
    for block in &mut blocks {
        let word = u32::from_ne_bytes([block[0], block[1], block[2], block[3]]) ^ mask_u32;
        block.copy_from_slice(&word.to_ne_bytes());
    }
    // The tail starts at a multiple of 4, so the key lines up again at index 0.
    apply_mask_fallback(blocks.into_remainder(), mask);
}

#[cfg(test)]
mod tests {
    use super::{apply_mask, apply_mask_fallback, apply_mask_fast32};

    #[test]
    fn test_apply_mask() {
        let mask = [0x6d, 0xb6, 0xb2, 0x80];
        let unmasked = [
            0xf3, 0x00, 0x01, 0x02, 0x03, 0x80, 0x81, 0x82, 0xff, 0xfe, 0x00, 0x17, 0x74, 0xf9,
            0x12, 0x03,
        ];

        // Check masking with different alignments and lengths.
        for data_len in 0..=unmasked.len() {
            let unmasked = &unmasked[0..data_len];

            let mut masked = unmasked.to_vec();
            apply_mask_fallback(&mut masked, mask);

            let mut masked_fast = unmasked.to_vec();
            apply_mask_fast32(&mut masked_fast, mask);

            assert_eq!(masked, masked_fast);
        }
    }

    #[test]
    fn mask_is_self_inverse() {
        for _ in 0..64 {
            let len = rand::random_range(0..300);
            let payload: Vec<u8> = (0..len).map(|_| rand::random()).collect();
            let key: [u8; 4] = rand::random();

            let mut data = payload.clone();
            apply_mask(&mut data, key);
            apply_mask(&mut data, key);
            assert_eq!(data, payload);
        }
    }

    #[test]
    fn rfc_example() {
        // "Hello" masked with 0x37fa213d (RFC 6455, section 5.7)
        let mut data = vec![0x7f, 0x9f, 0x4d, 0x51, 0x58];
        apply_mask(&mut data, [0x37, 0xfa, 0x21, 0x3d]);
        assert_eq!(data, b"Hello");
    }
}
