//! Conversion between fixed-width ECDSA signatures and DER `SEQUENCE { INTEGER r, INTEGER s }`.

use soulbrowser_core_types::BusError;

const P256_SCALAR_LEN: usize = 32;

fn der_len(len: usize) -> Vec<u8> {
    if len < 0x80 {
        return vec![len as u8];
    }
    let bytes: Vec<u8> = len
        .to_be_bytes()
        .iter()
        .copied()
        .skip_while(|b| *b == 0)
        .collect();
    let mut out = Vec::with_capacity(bytes.len() + 1);
    out.push(0x80 | bytes.len() as u8);
    out.extend(bytes);
    out
}

fn der_integer(scalar: &[u8]) -> Vec<u8> {
    let first = scalar
        .iter()
        .position(|b| *b != 0)
        .unwrap_or(scalar.len().saturating_sub(1));
    let trimmed = &scalar[first..];
    let mut body = Vec::with_capacity(trimmed.len() + 1);
    if trimmed.first().map_or(true, |b| b & 0x80 != 0) {
        body.push(0x00);
    }
    body.extend_from_slice(trimmed);
    let mut out = vec![0x02];
    out.extend(der_len(body.len()));
    out.extend(body);
    out
}

/// Re-encode a 64-byte `r || s` signature as DER.
pub fn p1363_to_der(raw: &[u8]) -> Result<Vec<u8>, BusError> {
    if raw.len() != P256_SCALAR_LEN * 2 {
        return Err(BusError::Malformed(format!(
            "expected {} signature bytes, got {}",
            P256_SCALAR_LEN * 2,
            raw.len()
        )));
    }
    let (r, s) = raw.split_at(P256_SCALAR_LEN);
    let mut seq = der_integer(r);
    seq.extend(der_integer(s));
    let mut out = vec![0x30];
    out.extend(der_len(seq.len()));
    out.extend(seq);
    Ok(out)
}

fn read_len(input: &[u8], pos: &mut usize) -> Option<usize> {
    let first = *input.get(*pos)?;
    *pos += 1;
    if first & 0x80 == 0 {
        return Some(first as usize);
    }
    let count = (first & 0x7f) as usize;
    if count == 0 || count > std::mem::size_of::<usize>() {
        return None;
    }
    let mut len = 0usize;
    for _ in 0..count {
        len = (len << 8) | *input.get(*pos)? as usize;
        *pos += 1;
    }
    Some(len)
}

fn read_integer<'a>(input: &'a [u8], pos: &mut usize) -> Option<&'a [u8]> {
    if *input.get(*pos)? != 0x02 {
        return None;
    }
    *pos += 1;
    let len = read_len(input, pos)?;
    let value = input.get(*pos..*pos + len)?;
    *pos += len;
    Some(value)
}

/// Decode a DER signature back into fixed-width `r || s`.
pub fn der_to_p1363(der: &[u8]) -> Result<Vec<u8>, BusError> {
    let malformed = || BusError::Malformed("invalid DER signature".to_string());
    let mut pos = 0usize;
    if der.first() != Some(&0x30) {
        return Err(malformed());
    }
    pos += 1;
    let seq_len = read_len(der, &mut pos).ok_or_else(malformed)?;
    if pos + seq_len != der.len() {
        return Err(malformed());
    }
    let mut out = Vec::with_capacity(P256_SCALAR_LEN * 2);
    for _ in 0..2 {
        let int = read_integer(der, &mut pos).ok_or_else(malformed)?;
        let first = int.iter().position(|b| *b != 0).unwrap_or(int.len());
        let trimmed = &int[first..];
        if trimmed.len() > P256_SCALAR_LEN {
            return Err(malformed());
        }
        out.extend(std::iter::repeat(0u8).take(P256_SCALAR_LEN - trimmed.len()));
        out.extend_from_slice(trimmed);
    }
    if pos != der.len() {
        return Err(malformed());
    }
    Ok(out)
}
