//! Frame masking: XOR with a repeating 4-byte key
//!
//! The hot loop widens the key to a `u64` and processes eight bytes per
//! iteration; output is byte-for-byte identical to the naive
//! `data[i] ^= key[i % 4]` form.

use std::cell::Cell;

/// Apply the WebSocket mask in place
///
/// Used both for masking (client writes) and unmasking (server reads);
/// XOR is its own inverse.
#[inline]
pub fn apply_mask(data: &mut [u8], key: [u8; 4]) {
    // SAFETY: u64 has no validity requirements beyond alignment, which
    // align_to_mut guarantees for the middle slice.
    let (head, mid, tail) = unsafe { data.align_to_mut::<u64>() };

    for (i, b) in head.iter_mut().enumerate() {
        *b ^= key[i & 3];
    }

    // Word lanes continue where the head stopped; rotate the key so lane
    // byte 0 lines up with the next payload position.
    let rot = head.len() & 3;
    let rk = [
        key[rot],
        key[(rot + 1) & 3],
        key[(rot + 2) & 3],
        key[(rot + 3) & 3],
    ];
    let wide = u64::from_ne_bytes([rk[0], rk[1], rk[2], rk[3], rk[0], rk[1], rk[2], rk[3]]);
    for word in mid.iter_mut() {
        *word ^= wide;
    }

    // mid covers a multiple of four bytes, so the tail keeps the same phase
    for (i, b) in tail.iter_mut().enumerate() {
        *b ^= rk[i & 3];
    }
}

/// Apply the mask starting at a non-zero key offset
///
/// Useful when a payload is unmasked in chunks; `offset` is the number of
/// payload bytes already processed.
#[inline]
pub fn apply_mask_offset(data: &mut [u8], key: [u8; 4], offset: usize) {
    let rot = offset & 3;
    if rot == 0 {
        apply_mask(data, key);
        return;
    }
    let rotated = [
        key[rot],
        key[(rot + 1) & 3],
        key[(rot + 2) & 3],
        key[(rot + 3) & 3],
    ];
    apply_mask(data, rotated);
}

thread_local! {
    static RNG_STATE: Cell<u64> = const { Cell::new(0) };
}

/// Generate a fresh masking key
///
/// Thread-local xorshift64 seeded from the clock. Masking keys defeat cache
/// poisoning by intermediaries, not attackers; they do not need to be
/// cryptographically secure.
#[inline]
pub fn generate_key() -> [u8; 4] {
    RNG_STATE.with(|state| {
        let mut s = state.get();
        if s == 0 {
            s = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos() as u64;
            s ^= &s as *const _ as u64;
            s |= 1;
        }

        s ^= s << 13;
        s ^= s >> 7;
        s ^= s << 17;

        state.set(s);
        (s as u32).to_ne_bytes()
    })
}
