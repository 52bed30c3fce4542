//! Annex-B (start-code delimited) NAL unit helpers.
//!
//! H.264/H.265 hardware encoders emit access units and codec configuration
//! as `00 00 01` / `00 00 00 01` delimited NAL units. MP4 stores the same
//! NAL units with a 4-byte big-endian length prefix instead; both the size
//! estimate and the write pass of a muxer go through [`nal_units`] so the
//! two can never disagree.

/// Iterator over the NAL units of an Annex-B byte stream.
///
/// Start codes are stripped. Input without any start code yields the whole
/// buffer as one NAL unit (the encoder already emitted a bare NAL).
#[derive(Clone, Debug)]
pub struct NalUnits<'a> {
    data: &'a [u8],
    pos: usize,
}

/// Split an Annex-B buffer into NAL units.
pub fn nal_units(data: &[u8]) -> NalUnits<'_> {
    let pos = match find_start_code(data, 0) {
        Some((start, len)) if start == 0 => len,
        Some(_) | None => 0,
    };
    NalUnits { data, pos }
}

/// Find the next start code at or after `from`; returns (offset, length).
fn find_start_code(data: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 {
            if data[i + 2] == 1 {
                return Some((i, 3));
            }
            if data[i + 2] == 0 && i + 4 <= data.len() && data[i + 3] == 1 {
                return Some((i, 4));
            }
        }
        i += 1;
    }
    None
}

impl<'a> Iterator for NalUnits<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        while self.pos < self.data.len() {
            let start = self.pos;
            let (end, next) = match find_start_code(self.data, start) {
                Some((offset, len)) => (offset, offset + len),
                None => (self.data.len(), self.data.len()),
            };
            self.pos = next;
            if end > start {
                return Some(&self.data[start..end]);
            }
        }
        None
    }
}

/// Whether `data` begins with an Annex-B start code.
pub fn has_start_code(data: &[u8]) -> bool {
    matches!(find_start_code(data, 0), Some((0, _)))
}

/// Size of `data` once rewritten with 4-byte length prefixes.
pub fn length_prefixed_size(data: &[u8]) -> usize {
    nal_units(data).map(|nal| 4 + nal.len()).sum()
}

/// Rewrite `data` with 4-byte big-endian length prefixes, appending to `out`.
pub fn write_length_prefixed(data: &[u8], out: &mut Vec<u8>) {
    for nal in nal_units(data) {
        out.extend_from_slice(&(nal.len() as u32).to_be_bytes());
        out.extend_from_slice(nal);
    }
}

/// H.264 NAL unit type (low 5 bits of the header byte).
pub fn h264_nal_type(nal: &[u8]) -> Option<u8> {
    nal.first().map(|b| b & 0x1F)
}

/// H.265 NAL unit type (bits 1..7 of the first header byte).
pub fn h265_nal_type(nal: &[u8]) -> Option<u8> {
    nal.first().map(|b| (b >> 1) & 0x3F)
}

/// Remove emulation prevention bytes (`00 00 03` → `00 00`) from a NAL payload.
pub fn unescape_rbsp(nal: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(nal.len());
    let mut zeros = 0;
    for &b in nal {
        if zeros >= 2 && b == 3 {
            zeros = 0;
            continue;
        }
        zeros = if b == 0 { zeros + 1 } else { 0 };
        out.push(b);
    }
    out
}

/// Insert emulation prevention bytes so `payload` cannot contain a start code.
pub fn escape_rbsp(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + payload.len() / 64);
    let mut zeros = 0;
    for &b in payload {
        if zeros >= 2 && b <= 3 {
            out.push(3);
            zeros = 0;
        }
        zeros = if b == 0 { zeros + 1 } else { 0 };
        out.push(b);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_mixed_start_codes() {
        let data = [0, 0, 0, 1, 0x67, 0xAA, 0, 0, 1, 0x68, 0xBB, 0xCC];
        let nals: Vec<&[u8]> = nal_units(&data).collect();
        assert_eq!(nals, vec![&[0x67, 0xAA][..], &[0x68, 0xBB, 0xCC][..]]);
    }

    #[test]
    fn bare_nal_is_one_unit() {
        let data = [0x65, 0x01, 0x02];
        let nals: Vec<&[u8]> = nal_units(&data).collect();
        assert_eq!(nals, vec![&data[..]]);
        assert!(!has_start_code(&data));
    }

    #[test]
    fn empty_input_has_no_units() {
        assert_eq!(nal_units(&[]).count(), 0);
        assert_eq!(nal_units(&[0, 0, 0, 1]).count(), 0);
    }

    #[test]
    fn length_prefixed_size_matches_written_bytes() {
        let data = [0, 0, 0, 1, 0x65, 1, 2, 3, 0, 0, 1, 0x41, 9];
        let mut out = Vec::new();
        write_length_prefixed(&data, &mut out);
        assert_eq!(out.len(), length_prefixed_size(&data));
        assert_eq!(out, vec![0, 0, 0, 4, 0x65, 1, 2, 3, 0, 0, 0, 2, 0x41, 9]);
    }

    #[test]
    fn nal_types() {
        assert_eq!(h264_nal_type(&[0x67]), Some(7));
        assert_eq!(h265_nal_type(&[0x40, 0x01]), Some(32));
        assert_eq!(h265_nal_type(&[0x42, 0x01]), Some(33));
    }

    #[test]
    fn unescape_removes_emulation_prevention() {
        assert_eq!(unescape_rbsp(&[0, 0, 3, 1, 0, 0, 3]), vec![0, 0, 1, 0, 0]);
    }

    #[test]
    fn escaped_payload_survives_nal_split() {
        let payload = [0x65, 0, 0, 1, 0, 0, 0, 2, 7];
        let escaped = escape_rbsp(&payload);
        let mut stream = vec![0, 0, 0, 1];
        stream.extend_from_slice(&escaped);
        let nals: Vec<&[u8]> = nal_units(&stream).collect();
        assert_eq!(nals.len(), 1);
        assert_eq!(unescape_rbsp(nals[0]), payload);
    }
}
