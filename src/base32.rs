use data_encoding::{DecodeError, DecodeKind, DecodePartial};

const BASE32_CHARS: [u8; 32] = *b"0123456789abcdfghijklmnpqrsvwxyz";
const BASE32_CHARS_REVERSE: [u8; 256] = {
    let mut ret = [0xFFu8; 256];
    let mut idx = 0u8;
    while idx < 32 {
        let ch = BASE32_CHARS[idx as usize];
        ret[ch as usize] = idx;
        idx += 1;
    }
    ret
};

pub const fn encode_len(len: usize) -> usize {
    (8 * len + 5 - 1) / 5
}

const fn decode_len_internal(len: usize) -> (usize, usize) {
    let trail = len * 5 % 8;
    (len - trail / 5, 5 * len / 8)
}

pub const fn decode_len(len: usize) -> usize {
    let (ilen, olen) = decode_len_internal(len);
    if ilen != len {
        panic!("Invalid base32 length");
    }
    olen
}

/// Encodes `input` into the digest alphabet. The buffer is processed in
/// reverse byte order, split into little-endian 5-bit quanta, and quantum
/// `n` lands at output position `N-1-n`.
pub fn encode_mut(input: &[u8], output: &mut [u8]) {
    assert_eq!(output.len(), encode_len(input.len()));
    let mut reversed = input.to_vec();
    reversed.reverse();
    reversed
        .chunks(5)
        .zip(output.rchunks_mut(8))
        .for_each(|(input, output)| {
            let mut x = 0u64;
            for (i, input) in input.iter().enumerate() {
                x |= u64::from(*input) << (8 * i);
            }
            for (i, output) in output.iter_mut().rev().enumerate() {
                let y = x >> (5 * i);
                *output = BASE32_CHARS[(y & 0x1f) as usize];
            }
        });
}

pub fn encode(input: &[u8]) -> String {
    let mut output = vec![0u8; encode_len(input.len())];
    encode_mut(input, &mut output);
    // SAFETY: the alphabet is a subset of ASCII, which guarantees valid UTF-8.
    unsafe { String::from_utf8_unchecked(output) }
}

// Fails if there are non-zero trailing bits.
fn check_trail(input: &[u8]) -> Result<(), DecodePartial> {
    let trail = 5 * input.len() % 8;
    if trail == 0 {
        return Ok(());
    }
    let mut mask = (1 << trail) - 1;
    mask <<= 5 - trail;
    if BASE32_CHARS_REVERSE[input[0] as usize] & mask != 0 {
        fail(0, DecodeKind::Trailing)
    } else {
        Ok(())
    }
}

fn fail(pos: usize, kind: DecodeKind) -> Result<(), DecodePartial> {
    Err(DecodePartial {
        read: pos / 8 * 8,
        written: pos / 8 * 5,
        error: DecodeError { position: pos, kind },
    })
}

pub fn decode_mut(input: &[u8], output: &mut [u8]) -> Result<(), DecodePartial> {
    assert_eq!(output.len(), decode_len(input.len()));
    let input_len = input.len();
    for ((chunk, input), output) in input.rchunks(8).enumerate().zip(output.chunks_mut(5)) {
        let mut x = 0u64;
        for j in 0..input.len() {
            let y = BASE32_CHARS_REVERSE[input[input.len() - j - 1] as usize];
            if y >= 1 << 5 {
                fail(input_len - (chunk * 8 + j) - 1, DecodeKind::Symbol)?;
            }
            x |= u64::from(y) << (5 * j);
        }
        for (j, output) in output.iter_mut().enumerate() {
            *output = (x >> (8 * j) & 0xff) as u8;
        }
    }
    check_trail(input)?;
    // Undo the byte reversal applied by the encoder.
    output.reverse();
    Ok(())
}

pub fn decode(input: &[u8]) -> Result<Vec<u8>, DecodePartial> {
    let mut output = vec![0u8; decode_len(input.len())];
    decode_mut(input, &mut output)?;
    Ok(output)
}
