//! Low-level MP4 atom/box writing primitives.
//!
//! MP4 files are structured as nested boxes (atoms). Each box has:
//! - 4-byte big-endian size (includes header)
//! - 4-byte ASCII type (e.g. "ftyp", "moov", "mdat")
//!
//! "Full boxes" additionally have:
//! - 1-byte version
//! - 3-byte flags
//!
//! Sizes are always known before a box is written (see [`crate::boxes`]),
//! so nothing here seeks back to patch a header.

use byteorder::{BigEndian, WriteBytesExt};
use std::io::{self, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::MuxResult;

/// Four-character box or brand code.
pub type FourCC = [u8; 4];

/// Standard box header length.
pub const BOX_HEADER_LEN: u64 = 8;

/// Header length when the 64-bit `largesize` field is used.
pub const LARGE_BOX_HEADER_LEN: u64 = 16;

/// Header length a box of `body_len` payload bytes needs.
pub fn header_len_for(body_len: u64) -> u64 {
    if body_len + BOX_HEADER_LEN > u32::MAX as u64 {
        LARGE_BOX_HEADER_LEN
    } else {
        BOX_HEADER_LEN
    }
}

/// Write a standard box header: 4-byte size + 4-byte type.
///
/// `size` is the total box size including the 8-byte header.
pub fn write_box_header<W: Write>(writer: &mut W, box_type: &FourCC, size: u32) -> MuxResult<()> {
    writer.write_u32::<BigEndian>(size)?;
    writer.write_all(box_type)?;
    Ok(())
}

/// Write the version + 24-bit flags word of a full box.
pub fn write_version_flags<W: Write>(writer: &mut W, version: u8, flags: u32) -> MuxResult<()> {
    let version_flags = ((version as u32) << 24) | (flags & 0x00FF_FFFF);
    writer.write_u32::<BigEndian>(version_flags)?;
    Ok(())
}

/// Write a 64-bit box header for large boxes (size == 1 signals extended size).
pub fn write_large_box_header<W: Write>(
    writer: &mut W,
    box_type: &FourCC,
    large_size: u64,
) -> MuxResult<()> {
    writer.write_u32::<BigEndian>(1)?; // size=1 means "look at largesize"
    writer.write_all(box_type)?;
    writer.write_u64::<BigEndian>(large_size)?;
    Ok(())
}

/// Write whichever header form fits `size`.
pub fn write_header<W: Write>(writer: &mut W, box_type: &FourCC, size: u64) -> MuxResult<()> {
    if size > u32::MAX as u64 {
        write_large_box_header(writer, box_type, size)
    } else {
        write_box_header(writer, box_type, size as u32)
    }
}

/// Standard video timescale (90kHz, same as MPEG-TS).
pub const VIDEO_TIMESCALE: u32 = 90_000;

/// Movie-level timescale (1000 = millisecond precision).
pub const MOVIE_TIMESCALE: u32 = 1000;

/// Rescale a duration between timescales, rounding down.
pub fn rescale(ticks: u64, from: u32, to: u32) -> u64 {
    if from == 0 {
        return 0;
    }
    (ticks as u128 * to as u128 / from as u128) as u64
}

/// Write a fixed-point 16.16 number.
pub fn write_fixed_point_16_16<W: Write>(writer: &mut W, value: f64) -> MuxResult<()> {
    let fixed = (value * 65536.0).round() as i32;
    writer.write_i32::<BigEndian>(fixed)?;
    Ok(())
}

/// Write a fixed-point 8.8 number.
pub fn write_fixed_point_8_8<W: Write>(writer: &mut W, value: f64) -> MuxResult<()> {
    let fixed = (value * 256.0).round() as i16;
    writer.write_i16::<BigEndian>(fixed)?;
    Ok(())
}

/// Write the unity transformation matrix used by mvhd and tkhd (36 bytes).
pub fn write_unity_matrix<W: Write>(writer: &mut W) -> MuxResult<()> {
    for value in [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0] {
        write_fixed_point_16_16(writer, value)?;
    }
    writer.write_u32::<BigEndian>(0x4000_0000)?; // 1.0 in 2.30 fixed point
    Ok(())
}

/// Write zero padding bytes.
pub fn write_zeros<W: Write>(writer: &mut W, count: usize) -> MuxResult<()> {
    const ZEROS: [u8; 64] = [0; 64];
    let mut left = count;
    while left > 0 {
        let n = left.min(ZEROS.len());
        writer.write_all(&ZEROS[..n])?;
        left -= n;
    }
    Ok(())
}

/// ISO 639-2/T language code packed into 3x5 bits.
/// Default is "und" (undetermined).
pub fn encode_language(lang: &str) -> u16 {
    let bytes = lang.as_bytes();
    if bytes.len() < 3 || !bytes[..3].iter().all(u8::is_ascii_lowercase) {
        return encode_language("und");
    }
    let a = (bytes[0] - 0x60) as u16;
    let b = (bytes[1] - 0x60) as u16;
    let c = (bytes[2] - 0x60) as u16;
    (a << 10) | (b << 5) | c
}

/// Seconds between 1904-01-01 (MP4 epoch) and 1970-01-01 (Unix epoch).
pub const MP4_EPOCH_OFFSET: u64 = 2_082_844_800;

/// Current time as MP4 creation time (seconds since 1904).
pub fn mp4_creation_time() -> u64 {
    let unix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    MP4_EPOCH_OFFSET + unix
}

/// Length of an MPEG-4 descriptor size field in expandable form (1-4 bytes).
pub fn descr_length_size(len: usize) -> usize {
    match len {
        0..=0x7F => 1,
        0x80..=0x3FFF => 2,
        0x4000..=0x1F_FFFF => 3,
        _ => 4,
    }
}

/// Write an MPEG-4 descriptor length in expandable form (1-4 bytes).
pub fn write_descr_length(out: &mut Vec<u8>, len: usize) {
    let count = descr_length_size(len);
    for i in (0..count).rev() {
        let byte = ((len >> (7 * i)) & 0x7F) as u8;
        out.push(if i > 0 { byte | 0x80 } else { byte });
    }
}

/// A `Write` adapter that counts the bytes passing through it.
#[derive(Debug)]
pub struct CountingWriter<W> {
    inner: W,
    count: u64,
}

impl<W: Write> CountingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, count: 0 }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_box_header() {
        let mut buf = Vec::new();
        write_box_header(&mut buf, b"ftyp", 20).unwrap();
        assert_eq!(buf.len(), 8);
        assert_eq!(&buf[0..4], &[0x00, 0x00, 0x00, 0x14]);
        assert_eq!(&buf[4..8], b"ftyp");
    }

    #[test]
    fn test_version_flags() {
        let mut buf = Vec::new();
        write_version_flags(&mut buf, 1, 0x000003).unwrap();
        assert_eq!(&buf, &[0x01, 0x00, 0x00, 0x03]);
    }

    #[test]
    fn test_write_large_box_header() {
        let mut buf = Vec::new();
        write_large_box_header(&mut buf, b"mdat", 0x1_0000_0000).unwrap();
        assert_eq!(buf.len(), 16);
        assert_eq!(&buf[0..4], &[0x00, 0x00, 0x00, 0x01]);
        assert_eq!(&buf[4..8], b"mdat");
        assert_eq!(
            &buf[8..16],
            &[0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_header_form_follows_size() {
        assert_eq!(header_len_for(100), BOX_HEADER_LEN);
        assert_eq!(header_len_for(u32::MAX as u64), LARGE_BOX_HEADER_LEN);

        let mut small = Vec::new();
        write_header(&mut small, b"mdat", 108).unwrap();
        assert_eq!(small.len(), 8);
        let mut large = Vec::new();
        write_header(&mut large, b"mdat", u32::MAX as u64 + 16).unwrap();
        assert_eq!(large.len(), 16);
    }

    #[test]
    fn test_rescale() {
        assert_eq!(rescale(90_000, VIDEO_TIMESCALE, MOVIE_TIMESCALE), 1000);
        assert_eq!(rescale(44_100, 44_100, MOVIE_TIMESCALE), 1000);
        assert_eq!(rescale(5, 0, MOVIE_TIMESCALE), 0);
    }

    #[test]
    fn test_write_fixed_point() {
        let mut buf = Vec::new();
        write_fixed_point_16_16(&mut buf, 1.0).unwrap();
        write_fixed_point_8_8(&mut buf, 1.0).unwrap();
        assert_eq!(&buf, &[0x00, 0x01, 0x00, 0x00, 0x01, 0x00]);
    }

    #[test]
    fn test_unity_matrix_is_36_bytes() {
        let mut buf = Vec::new();
        write_unity_matrix(&mut buf).unwrap();
        assert_eq!(buf.len(), 36);
        assert_eq!(&buf[32..36], &[0x40, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_write_zeros_spans_chunks() {
        let mut buf = Vec::new();
        write_zeros(&mut buf, 150).unwrap();
        assert_eq!(buf, vec![0u8; 150]);
    }

    #[test]
    fn test_encode_language() {
        assert_eq!(encode_language("und"), 0x55C4);
        assert_eq!(encode_language("eng"), 5575);
        assert_eq!(encode_language("EN"), 0x55C4);
    }

    #[test]
    fn test_mp4_creation_time() {
        assert!(mp4_creation_time() > MP4_EPOCH_OFFSET);
    }

    #[test]
    fn test_descr_length_forms() {
        let mut out = Vec::new();
        write_descr_length(&mut out, 5);
        assert_eq!(out, vec![5]);

        out.clear();
        write_descr_length(&mut out, 200);
        assert_eq!(out, vec![0x81, 0x48]);
        assert_eq!(descr_length_size(200), 2);
    }

    #[test]
    fn test_counting_writer() {
        let mut writer = CountingWriter::new(Vec::new());
        writer.write_all(b"abcd").unwrap();
        writer.write_all(b"ef").unwrap();
        assert_eq!(writer.count(), 6);
        assert_eq!(writer.into_inner(), b"abcdef");
    }
}
