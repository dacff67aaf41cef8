use super::error::{Nip77Error, Result};

/// Append a varint to `out`.
///
/// Varints are base-128 digits, most significant digit first, with the
/// high bit set on every byte except the last.
pub fn encode_varint(out: &mut Vec<u8>, value: u64) {
    let mut digits = [0u8; 10];
    let mut len = 0;
    let mut rest = value;
    loop {
        digits[len] = (rest & 0x7F) as u8;
        len += 1;
        rest >>= 7;
        if rest == 0 {
            break;
        }
    }
    for (position, digit) in digits[..len].iter().rev().enumerate() {
        if position + 1 < len {
            out.push(digit | 0x80);
        } else {
            out.push(*digit);
        }
    }
}

/// Number of bytes `encode_varint` produces for `value`.
pub fn varint_len(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    bits.div_ceil(7).max(1)
}

/// Forward-only reader over an encoded message.
pub(crate) struct Reader<'a> {
    data: &'a [u8],
}

impl<'a> Reader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub(crate) fn remaining(&self) -> usize {
        self.data.len()
    }

    pub(crate) fn byte(&mut self, what: &'static str) -> Result<u8> {
        let (&first, rest) = self
            .data
            .split_first()
            .ok_or(Nip77Error::UnexpectedEnd(what))?;
        self.data = rest;
        Ok(first)
    }

    pub(crate) fn take(&mut self, len: usize, what: &'static str) -> Result<&'a [u8]> {
        if len > self.data.len() {
            return Err(Nip77Error::UnexpectedEnd(what));
        }
        let (head, rest) = self.data.split_at(len);
        self.data = rest;
        Ok(head)
    }

    pub(crate) fn array<const N: usize>(&mut self, what: &'static str) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N, what)?);
        Ok(out)
    }

    pub(crate) fn varint(&mut self, what: &'static str) -> Result<u64> {
        let mut value: u64 = 0;
        loop {
            let byte = self.byte(what)?;
            if value > (u64::MAX >> 7) {
                return Err(Nip77Error::VarintOverflow);
            }
            value = (value << 7) | u64::from(byte & 0x7F);
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
    }
}

/// Decode a single varint from the start of `data`.
///
/// Returns (value, bytes_consumed)
pub fn decode_varint(data: &[u8]) -> Result<(u64, usize)> {
    let mut reader = Reader::new(data);
    let value = reader.varint("varint")?;
    Ok((value, data.len() - reader.remaining()))
}
