//! Mutations and their wire codec.
//!
//! A mutation is the unit of write work carried through the commit pipeline:
//! tagged by the proxy, appended to the transaction logs, and applied by
//! storage. The binary layout is
//! `u8 kind || u32 len(param1) || param1 || u32 len(param2) || param2`,
//! lengths big-endian.

use bytes::Bytes;

use crate::codec::{read_bytes, read_u8};
use crate::types::Version;

/// Atomic read-modify-write operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AtomicKind {
    Add,
    And,
    Or,
    Xor,
    Max,
    Min,
    ByteMin,
    ByteMax,
    AppendIfFits,
    CompareAndClear,
}

impl AtomicKind {
    fn wire(self) -> u8 {
        match self {
            AtomicKind::Add => 4,
            AtomicKind::And => 5,
            AtomicKind::Or => 6,
            AtomicKind::Xor => 7,
            AtomicKind::Max => 8,
            AtomicKind::Min => 9,
            AtomicKind::ByteMin => 10,
            AtomicKind::ByteMax => 11,
            AtomicKind::AppendIfFits => 12,
            AtomicKind::CompareAndClear => 13,
        }
    }

    fn from_wire(byte: u8) -> anyhow::Result<Self> {
        Ok(match byte {
            4 => AtomicKind::Add,
            5 => AtomicKind::And,
            6 => AtomicKind::Or,
            7 => AtomicKind::Xor,
            8 => AtomicKind::Max,
            9 => AtomicKind::Min,
            10 => AtomicKind::ByteMin,
            11 => AtomicKind::ByteMax,
            12 => AtomicKind::AppendIfFits,
            13 => AtomicKind::CompareAndClear,
            other => anyhow::bail!("unknown atomic op {other}"),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Mutation {
    Set {
        key: Bytes,
        value: Bytes,
    },
    ClearRange {
        begin: Bytes,
        end: Bytes,
    },
    /// The key carries a 4-byte little-endian offset trailer at which the
    /// commit versionstamp is patched in before resolution.
    SetVersionstampedKey {
        key: Bytes,
        value: Bytes,
    },
    SetVersionstampedValue {
        key: Bytes,
        value: Bytes,
    },
    AtomicOp {
        op: AtomicKind,
        key: Bytes,
        param: Bytes,
    },
}

impl Mutation {
    pub fn set(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Mutation::Set {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn clear_range(begin: impl Into<Bytes>, end: impl Into<Bytes>) -> Self {
        Mutation::ClearRange {
            begin: begin.into(),
            end: end.into(),
        }
    }

    /// Everything except a range clear addresses a single key.
    pub fn is_single_key(&self) -> bool {
        !matches!(self, Mutation::ClearRange { .. })
    }

    /// First parameter: the key, or the begin of a cleared range.
    pub fn param1(&self) -> &Bytes {
        match self {
            Mutation::Set { key, .. }
            | Mutation::SetVersionstampedKey { key, .. }
            | Mutation::SetVersionstampedValue { key, .. }
            | Mutation::AtomicOp { key, .. } => key,
            Mutation::ClearRange { begin, .. } => begin,
        }
    }

    /// Second parameter: the value, operand, or the end of a cleared range.
    pub fn param2(&self) -> &Bytes {
        match self {
            Mutation::Set { value, .. }
            | Mutation::SetVersionstampedKey { value, .. }
            | Mutation::SetVersionstampedValue { value, .. } => value,
            Mutation::AtomicOp { param, .. } => param,
            Mutation::ClearRange { end, .. } => end,
        }
    }

    /// Serialized size plus a fixed per-mutation overhead, used for batch
    /// accounting.
    pub fn expected_size(&self) -> usize {
        self.param1().len() + self.param2().len() + 24
    }

    fn wire_kind(&self) -> u8 {
        match self {
            Mutation::Set { .. } => 0,
            Mutation::ClearRange { .. } => 1,
            Mutation::SetVersionstampedKey { .. } => 2,
            Mutation::SetVersionstampedValue { .. } => 3,
            Mutation::AtomicOp { op, .. } => op.wire(),
        }
    }

    pub fn encoded_len(&self) -> usize {
        1 + 4 + self.param1().len() + 4 + self.param2().len()
    }

    pub fn encode_to(&self, out: &mut Vec<u8>) {
        out.push(self.wire_kind());
        out.extend_from_slice(&(self.param1().len() as u32).to_be_bytes());
        out.extend_from_slice(self.param1());
        out.extend_from_slice(&(self.param2().len() as u32).to_be_bytes());
        out.extend_from_slice(self.param2());
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.encode_to(&mut out);
        out
    }

    pub fn decode(data: &[u8], offset: &mut usize) -> anyhow::Result<Self> {
        let kind = read_u8(data, offset)?;
        let param1 = Bytes::copy_from_slice(read_bytes(data, offset)?);
        let param2 = Bytes::copy_from_slice(read_bytes(data, offset)?);
        Ok(match kind {
            0 => Mutation::Set {
                key: param1,
                value: param2,
            },
            1 => Mutation::ClearRange {
                begin: param1,
                end: param2,
            },
            2 => Mutation::SetVersionstampedKey {
                key: param1,
                value: param2,
            },
            3 => Mutation::SetVersionstampedValue {
                key: param1,
                value: param2,
            },
            other => Mutation::AtomicOp {
                op: AtomicKind::from_wire(other)?,
                key: param1,
                param: param2,
            },
        })
    }
}

/// Patch a versionstamped parameter in place.
///
/// The parameter ends with a little-endian u32 naming the byte offset at
/// which the 10-byte versionstamp `(commit version BE u64, batch index BE
/// u16)` is written; the trailer itself is stripped.
pub fn transform_versionstamp(
    param: &Bytes,
    version: Version,
    batch_index: u16,
) -> anyhow::Result<Bytes> {
    anyhow::ensure!(param.len() >= 4, "versionstamped parameter too short");
    let trailer_at = param.len() - 4;
    let offset = u32::from_le_bytes([
        param[trailer_at],
        param[trailer_at + 1],
        param[trailer_at + 2],
        param[trailer_at + 3],
    ]) as usize;
    anyhow::ensure!(
        offset + 10 <= trailer_at,
        "versionstamp offset {offset} out of bounds for parameter of {trailer_at} bytes"
    );

    let mut out = param[..trailer_at].to_vec();
    out[offset..offset + 8].copy_from_slice(&(version as u64).to_be_bytes());
    out[offset + 8..offset + 10].copy_from_slice(&batch_index.to_be_bytes());
    Ok(Bytes::from(out))
}

/// Apply the versionstamp to the appropriate parameter of a mutation,
/// returning the rewritten mutation. Non-versionstamped mutations are
/// returned unchanged.
pub fn patch_versionstamp(
    m: &Mutation,
    version: Version,
    batch_index: u16,
) -> anyhow::Result<Mutation> {
    Ok(match m {
        Mutation::SetVersionstampedKey { key, value } => Mutation::Set {
            key: transform_versionstamp(key, version, batch_index)?,
            value: value.clone(),
        },
        Mutation::SetVersionstampedValue { key, value } => Mutation::Set {
            key: key.clone(),
            value: transform_versionstamp(value, version, batch_index)?,
        },
        other => other.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_round_trip() {
        let mutations = vec![
            Mutation::set(&b"key"[..], &b"value"[..]),
            Mutation::clear_range(&b"a"[..], &b"z"[..]),
            Mutation::AtomicOp {
                op: AtomicKind::Add,
                key: Bytes::from_static(b"counter"),
                param: Bytes::copy_from_slice(&1u64.to_le_bytes()),
            },
            Mutation::SetVersionstampedValue {
                key: Bytes::from_static(b"k"),
                value: Bytes::from_static(b"0123456789\x00\x00\x00\x00"),
            },
        ];
        for m in &mutations {
            let buf = m.encode();
            assert_eq!(buf.len(), m.encoded_len());
            let mut offset = 0;
            let back = Mutation::decode(&buf, &mut offset).unwrap();
            assert_eq!(&back, m);
            assert_eq!(offset, buf.len());
        }
    }

    #[test]
    fn versionstamp_patching() {
        // 10 stamp bytes at offset 3, then a 4-byte LE offset trailer.
        let mut raw = b"abc".to_vec();
        raw.extend_from_slice(&[0u8; 10]);
        raw.extend_from_slice(b"tail");
        raw.extend_from_slice(&3u32.to_le_bytes());

        let patched = transform_versionstamp(&Bytes::from(raw), 0x0102030405060708, 9).unwrap();
        assert_eq!(&patched[..3], b"abc");
        assert_eq!(&patched[3..11], &0x0102030405060708u64.to_be_bytes());
        assert_eq!(&patched[11..13], &9u16.to_be_bytes());
        assert_eq!(&patched[13..], b"tail");
    }

    #[test]
    fn versionstamp_bounds_checked() {
        let raw = Bytes::from_static(&[0u8; 6]);
        assert!(transform_versionstamp(&raw, 1, 0).is_err());
    }

    #[test]
    fn patch_rewrites_kind() {
        let mut raw = vec![0u8; 10];
        raw.extend_from_slice(&0u32.to_le_bytes());
        let m = Mutation::SetVersionstampedKey {
            key: Bytes::from(raw),
            value: Bytes::from_static(b"v"),
        };
        let patched = patch_versionstamp(&m, 77, 2).unwrap();
        match patched {
            Mutation::Set { key, value } => {
                assert_eq!(&key[..8], &77u64.to_be_bytes());
                assert_eq!(value.as_ref(), b"v");
            }
            other => panic!("expected Set, got {other:?}"),
        }
    }
}
