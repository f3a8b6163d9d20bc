//! Cursor-style helpers for the hand-rolled big-endian binary formats used
//! across the pipeline.

pub fn read_u8(data: &[u8], offset: &mut usize) -> anyhow::Result<u8> {
    anyhow::ensure!(*offset + 1 <= data.len(), "short u8");
    let out = data[*offset];
    *offset += 1;
    Ok(out)
}

pub fn read_u16(data: &[u8], offset: &mut usize) -> anyhow::Result<u16> {
    anyhow::ensure!(*offset + 2 <= data.len(), "short u16");
    let mut buf = [0u8; 2];
    buf.copy_from_slice(&data[*offset..*offset + 2]);
    *offset += 2;
    Ok(u16::from_be_bytes(buf))
}

pub fn read_u32(data: &[u8], offset: &mut usize) -> anyhow::Result<u32> {
    anyhow::ensure!(*offset + 4 <= data.len(), "short u32");
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&data[*offset..*offset + 4]);
    *offset += 4;
    Ok(u32::from_be_bytes(buf))
}

pub fn read_u64(data: &[u8], offset: &mut usize) -> anyhow::Result<u64> {
    anyhow::ensure!(*offset + 8 <= data.len(), "short u64");
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[*offset..*offset + 8]);
    *offset += 8;
    Ok(u64::from_be_bytes(buf))
}

pub fn read_i64(data: &[u8], offset: &mut usize) -> anyhow::Result<i64> {
    Ok(read_u64(data, offset)? as i64)
}

/// Read a `u32`-length-prefixed byte slice.
pub fn read_bytes<'a>(data: &'a [u8], offset: &mut usize) -> anyhow::Result<&'a [u8]> {
    let len = read_u32(data, offset)? as usize;
    anyhow::ensure!(*offset + len <= data.len(), "short byte slice");
    let out = &data[*offset..*offset + len];
    *offset += len;
    Ok(out)
}

pub fn write_bytes(out: &mut Vec<u8>, data: &[u8]) {
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    out.extend_from_slice(data);
}

/// Bob Jenkins' lookup3 `hashlittle`. The backup mutation key embeds one
/// byte of this hash, so the exact algorithm is part of the wire format.
pub fn hash_little(data: &[u8], initval: u32) -> u32 {
    let mut a = 0xdead_beef_u32
        .wrapping_add(data.len() as u32)
        .wrapping_add(initval);
    let mut b = a;
    let mut c = a;

    let mut k = data;
    while k.len() > 12 {
        a = a.wrapping_add(u32::from_le_bytes(k[0..4].try_into().expect("len checked")));
        b = b.wrapping_add(u32::from_le_bytes(k[4..8].try_into().expect("len checked")));
        c = c.wrapping_add(u32::from_le_bytes(k[8..12].try_into().expect("len checked")));

        a = a.wrapping_sub(c);
        a ^= c.rotate_left(4);
        c = c.wrapping_add(b);
        b = b.wrapping_sub(a);
        b ^= a.rotate_left(6);
        a = a.wrapping_add(c);
        c = c.wrapping_sub(b);
        c ^= b.rotate_left(8);
        b = b.wrapping_add(a);
        a = a.wrapping_sub(c);
        a ^= c.rotate_left(16);
        c = c.wrapping_add(b);
        b = b.wrapping_sub(a);
        b ^= a.rotate_left(19);
        a = a.wrapping_add(c);
        c = c.wrapping_sub(b);
        c ^= b.rotate_left(4);
        b = b.wrapping_add(a);

        k = &k[12..];
    }

    if k.is_empty() {
        return c;
    }
    // Trailing bytes zero-extend to little-endian words, matching the
    // byte-wise tail switch of the reference implementation.
    let mut tail = [0u8; 12];
    tail[..k.len()].copy_from_slice(k);
    a = a.wrapping_add(u32::from_le_bytes(tail[0..4].try_into().expect("len checked")));
    if k.len() > 4 {
        b = b.wrapping_add(u32::from_le_bytes(tail[4..8].try_into().expect("len checked")));
    }
    if k.len() > 8 {
        c = c.wrapping_add(u32::from_le_bytes(tail[8..12].try_into().expect("len checked")));
    }

    c ^= b;
    c = c.wrapping_sub(b.rotate_left(14));
    a ^= c;
    a = a.wrapping_sub(c.rotate_left(11));
    b ^= a;
    b = b.wrapping_sub(a.rotate_left(25));
    c ^= b;
    c = c.wrapping_sub(b.rotate_left(16));
    a ^= c;
    a = a.wrapping_sub(c.rotate_left(4));
    b ^= a;
    b = b.wrapping_sub(a.rotate_left(14));
    c ^= b;
    c = c.wrapping_sub(b.rotate_left(24));
    c
}
