//! Fixed-layout big-endian frames for NAT-PMP and PCP
//!
//! A frame is a zero-initialised buffer of known size; fields are written at
//! byte offsets with one of three widths. Decoding reads the same offsets
//! back. Both protocols build their headers from this, including the PCP
//! nonce and 128-bit address fields via the byte-slice helpers.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytes::{Buf, BufMut, BytesMut};

use crate::nat::error::CodecError;

/// Width of a single integer field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldWidth {
    U8,
    U16,
    U32,
}

impl FieldWidth {
    /// Only 8, 16 and 32 bit fields exist on these wires
    pub fn from_bits(bits: u8) -> Result<Self, CodecError> {
        match bits {
            8 => Ok(Self::U8),
            16 => Ok(Self::U16),
            32 => Ok(Self::U32),
            other => Err(CodecError::InvalidWidth(other)),
        }
    }

    pub fn bits(self) -> u8 {
        match self {
            Self::U8 => 8,
            Self::U16 => 16,
            Self::U32 => 32,
        }
    }

    pub fn len(self) -> usize {
        self.bits() as usize / 8
    }
}

/// One `(width, offset, value)` triple
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    pub width: FieldWidth,
    pub offset: usize,
    pub value: u32,
}

impl Field {
    pub fn u8(offset: usize, value: u8) -> Self {
        Self { width: FieldWidth::U8, offset, value: value.into() }
    }

    pub fn u16(offset: usize, value: u16) -> Self {
        Self { width: FieldWidth::U16, offset, value: value.into() }
    }

    pub fn u32(offset: usize, value: u32) -> Self {
        Self { width: FieldWidth::U32, offset, value }
    }
}

/// Encode `fields` into a zeroed buffer of `size` bytes.
///
/// Fields may be given in any order. Overlapping fields are not detected;
/// the later write wins.
pub fn encode(size: usize, fields: &[Field]) -> Result<BytesMut, CodecError> {
    let mut writer = FrameWriter::new(size);
    for field in fields {
        writer.put(*field)?;
    }
    Ok(writer.finish())
}

/// Read each `(width, offset)` back out of `buf`
pub fn decode(buf: &[u8], layout: &[(FieldWidth, usize)]) -> Result<Vec<u32>, CodecError> {
    let reader = FrameReader::new(buf);
    layout
        .iter()
        .map(|&(width, offset)| reader.get(width, offset))
        .collect()
}

fn check_bounds(offset: usize, len: usize, size: usize) -> Result<(), CodecError> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(CodecError::OutOfBounds { offset, len, size }),
    }
}

/// Builder over a fixed-size zeroed frame
#[derive(Debug)]
pub struct FrameWriter {
    buf: BytesMut,
}

impl FrameWriter {
    pub fn new(size: usize) -> Self {
        Self {
            buf: BytesMut::zeroed(size),
        }
    }

    pub fn put(&mut self, field: Field) -> Result<&mut Self, CodecError> {
        let size = self.buf.len();
        check_bounds(field.offset, field.width.len(), size)?;

        let mut slot = &mut self.buf[field.offset..];
        match field.width {
            FieldWidth::U8 => {
                let value = u8::try_from(field.value)
                    .map_err(|_| CodecError::ValueOverflow { value: field.value, bits: 8 })?;
                slot.put_u8(value);
            }
            FieldWidth::U16 => {
                let value = u16::try_from(field.value)
                    .map_err(|_| CodecError::ValueOverflow { value: field.value, bits: 16 })?;
                slot.put_u16(value);
            }
            FieldWidth::U32 => slot.put_u32(field.value),
        }
        Ok(self)
    }

    pub fn u8(&mut self, offset: usize, value: u8) -> Result<&mut Self, CodecError> {
        self.put(Field::u8(offset, value))
    }

    pub fn u16(&mut self, offset: usize, value: u16) -> Result<&mut Self, CodecError> {
        self.put(Field::u16(offset, value))
    }

    pub fn u32(&mut self, offset: usize, value: u32) -> Result<&mut Self, CodecError> {
        self.put(Field::u32(offset, value))
    }

    pub fn bytes(&mut self, offset: usize, value: &[u8]) -> Result<&mut Self, CodecError> {
        check_bounds(offset, value.len(), self.buf.len())?;
        self.buf[offset..offset + value.len()].copy_from_slice(value);
        Ok(self)
    }

    /// 128-bit address field; IPv4 is written in its IPv4-mapped form
    pub fn ip(&mut self, offset: usize, addr: IpAddr) -> Result<&mut Self, CodecError> {
        let octets = match addr {
            IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
            IpAddr::V6(v6) => v6.octets(),
        };
        self.bytes(offset, &octets)
    }

    pub fn finish(self) -> BytesMut {
        self.buf
    }
}

/// Reader over a received frame
#[derive(Debug, Clone, Copy)]
pub struct FrameReader<'a> {
    buf: &'a [u8],
}

impl<'a> FrameReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn get(&self, width: FieldWidth, offset: usize) -> Result<u32, CodecError> {
        check_bounds(offset, width.len(), self.buf.len())?;
        let mut slot = &self.buf[offset..];
        Ok(match width {
            FieldWidth::U8 => slot.get_u8().into(),
            FieldWidth::U16 => slot.get_u16().into(),
            FieldWidth::U32 => slot.get_u32(),
        })
    }

    pub fn u8(&self, offset: usize) -> Result<u8, CodecError> {
        check_bounds(offset, 1, self.buf.len())?;
        Ok(self.buf[offset])
    }

    pub fn u16(&self, offset: usize) -> Result<u16, CodecError> {
        check_bounds(offset, 2, self.buf.len())?;
        Ok((&self.buf[offset..]).get_u16())
    }

    pub fn u32(&self, offset: usize) -> Result<u32, CodecError> {
        check_bounds(offset, 4, self.buf.len())?;
        Ok((&self.buf[offset..]).get_u32())
    }

    pub fn bytes<const N: usize>(&self, offset: usize) -> Result<[u8; N], CodecError> {
        check_bounds(offset, N, self.buf.len())?;
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[offset..offset + N]);
        Ok(out)
    }

    /// 128-bit address field, unwrapping IPv4-mapped addresses
    pub fn ip(&self, offset: usize) -> Result<IpAddr, CodecError> {
        let v6 = Ipv6Addr::from(self.bytes::<16>(offset)?);
        Ok(match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        })
    }

    pub fn ipv4(&self, offset: usize) -> Result<Ipv4Addr, CodecError> {
        Ok(Ipv4Addr::from(self.bytes::<4>(offset)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_writes_big_endian_at_offsets() {
        let buf = encode(
            12,
            &[
                Field::u32(8, 7200),
                Field::u8(0, 0),
                Field::u8(1, 1),
                Field::u16(4, 8080),
                Field::u16(6, 8080),
            ],
        )
        .unwrap();

        assert_eq!(
            &buf[..],
            &[0, 1, 0, 0, 0x1F, 0x90, 0x1F, 0x90, 0, 0, 0x1C, 0x20]
        );
    }

    #[test]
    fn test_decode_reads_back_encoded_fields() {
        let fields = [
            Field::u8(0, 2),
            Field::u8(1, 0x81),
            Field::u16(2, 0xBEEF),
            Field::u32(4, 0xDEAD_BEEF),
            Field::u32(12, 1),
        ];
        let buf = encode(24, &fields).unwrap();
        let layout: Vec<_> = fields.iter().map(|f| (f.width, f.offset)).collect();
        let values = decode(&buf, &layout).unwrap();

        let expected: Vec<u32> = fields.iter().map(|f| f.value).collect();
        assert_eq!(values, expected);
    }

    #[test]
    fn test_untouched_bytes_stay_zero() {
        let buf = encode(8, &[Field::u8(7, 0xFF)]).unwrap();
        assert_eq!(&buf[..7], &[0u8; 7]);
    }

    #[test]
    fn test_invalid_width_is_reported() {
        assert_eq!(FieldWidth::from_bits(24), Err(CodecError::InvalidWidth(24)));
        assert_eq!(FieldWidth::from_bits(64), Err(CodecError::InvalidWidth(64)));
        assert_eq!(FieldWidth::from_bits(16), Ok(FieldWidth::U16));
    }

    #[test]
    fn test_out_of_bounds_and_overflow() {
        assert!(matches!(
            encode(4, &[Field::u32(2, 1)]),
            Err(CodecError::OutOfBounds { offset: 2, len: 4, size: 4 })
        ));
        let overflow = Field { width: FieldWidth::U8, offset: 0, value: 256 };
        assert!(matches!(
            encode(4, &[overflow]),
            Err(CodecError::ValueOverflow { value: 256, bits: 8 })
        ));
        assert!(FrameReader::new(&[0, 1]).u32(0).is_err());
    }

    #[test]
    fn test_ipv4_mapped_address_fields() {
        let addr: IpAddr = "192.168.1.37".parse().unwrap();
        let mut writer = FrameWriter::new(16);
        writer.ip(0, addr).unwrap();
        let buf = writer.finish();

        assert_eq!(&buf[10..12], &[0xFF, 0xFF]);
        assert_eq!(FrameReader::new(&buf).ip(0).unwrap(), addr);
    }
}
