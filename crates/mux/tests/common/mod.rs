//! Shared helpers: a small ISO-BMFF walker and frame builders.

#![allow(dead_code)]

use std::sync::Arc;

use bytes::Bytes;
use ck_common::{AudioCodec, EncodedFrame, FrameFormat, Rational, Resolution, Timestamp, VideoCodec};

pub const SPS: [u8; 12] = [
    0x67, 0x64, 0x00, 0x1F, 0xAC, 0xD9, 0x40, 0x50, 0x05, 0xBB, 0x01, 0x10,
];
pub const PPS: [u8; 6] = [0x68, 0xEB, 0xE3, 0xCB, 0x22, 0xC0];
/// AAC-LC, 48 kHz, stereo.
pub const ASC: [u8; 2] = [0x11, 0x90];

const CONTAINERS: [&[u8; 4]; 8] = [
    b"moov", b"trak", b"mdia", b"minf", b"stbl", b"mvex", b"moof", b"traf",
];

/// One parsed box: type, absolute offset of its header, and its body.
#[derive(Clone, Debug)]
pub struct Atom<'a> {
    pub kind: [u8; 4],
    pub offset: usize,
    pub header_len: usize,
    pub body: &'a [u8],
    pub children: Vec<Atom<'a>>,
}

impl<'a> Atom<'a> {
    pub fn size(&self) -> usize {
        self.header_len + self.body.len()
    }

    pub fn child(&self, kind: &[u8; 4]) -> Option<&Atom<'a>> {
        self.children.iter().find(|c| &c.kind == kind)
    }

    pub fn all(&self, kind: &[u8; 4]) -> Vec<&Atom<'a>> {
        self.children.iter().filter(|c| &c.kind == kind).collect()
    }

    /// Follow a path of child types.
    pub fn path(&self, kinds: &[&[u8; 4]]) -> &Atom<'a> {
        kinds.iter().fold(self, |atom, kind| {
            atom.child(kind)
                .unwrap_or_else(|| panic!("missing {}", String::from_utf8_lossy(*kind)))
        })
    }

    /// Big-endian u32 fields of a full box body, after version/flags.
    pub fn fields(&self) -> Vec<u32> {
        self.body[4..]
            .chunks_exact(4)
            .map(|c| u32::from_be_bytes(c.try_into().unwrap()))
            .collect()
    }

    /// Entries of a table box (`entry_count` then `width` words per entry).
    pub fn table(&self, width: usize) -> Vec<Vec<u32>> {
        let fields = self.fields();
        let count = fields[0] as usize;
        fields[1..1 + count * width]
            .chunks(width)
            .map(<[u32]>::to_vec)
            .collect()
    }
}

pub fn parse(data: &[u8]) -> Vec<Atom<'_>> {
    parse_at(data, 0)
}

fn parse_at(data: &[u8], base: usize) -> Vec<Atom<'_>> {
    let mut atoms = Vec::new();
    let mut pos = 0;
    while pos + 8 <= data.len() {
        let mut size = u32::from_be_bytes(data[pos..pos + 4].try_into().unwrap()) as usize;
        let kind: [u8; 4] = data[pos + 4..pos + 8].try_into().unwrap();
        let mut header_len = 8;
        if size == 1 {
            size = u64::from_be_bytes(data[pos + 8..pos + 16].try_into().unwrap()) as usize;
            header_len = 16;
        }
        assert!(size >= header_len && pos + size <= data.len(), "box overruns parent");
        let body = &data[pos + header_len..pos + size];
        let children = if CONTAINERS.contains(&&kind) {
            parse_at(body, base + pos + header_len)
        } else {
            Vec::new()
        };
        atoms.push(Atom {
            kind,
            offset: base + pos,
            header_len,
            body,
            children,
        });
        pos += size;
    }
    assert_eq!(pos, data.len(), "boxes must tile their parent");
    atoms
}

pub fn kinds(atoms: &[Atom<'_>]) -> Vec<String> {
    atoms
        .iter()
        .map(|a| String::from_utf8_lossy(&a.kind).into_owned())
        .collect()
}

pub fn video_format() -> Arc<FrameFormat> {
    Arc::new(FrameFormat::video(
        VideoCodec::H264,
        Resolution::HD,
        Rational::FPS_25,
    ))
}

pub fn audio_format() -> Arc<FrameFormat> {
    Arc::new(FrameFormat::audio(AudioCodec::Aac, 48_000, 2))
}

/// H.264 access unit `index` at 25 fps, with SPS/PPS on the first one.
pub fn video_frame(index: i64, key: bool) -> EncodedFrame {
    let nal_type = if key { 0x65 } else { 0x41 };
    let mut data = vec![0u8, 0, 0, 1, nal_type];
    data.extend(std::iter::repeat(index as u8 + 1).take(20 + index as usize));
    let mut frame = EncodedFrame::new(data, Timestamp::from_micros(index * 40_000), video_format())
        .with_key_frame(key);
    if index == 0 {
        let extras: Vec<Bytes> = vec![Bytes::from_static(&SPS), Bytes::from_static(&PPS)];
        frame = frame.with_extras(Arc::from(extras));
    }
    frame
}

/// AAC frame `index`, 20 ms apart, with the ASC on the first one.
pub fn audio_frame(index: i64) -> EncodedFrame {
    let data = vec![0xA0 | (index as u8 & 0x0F); 12];
    let mut frame = EncodedFrame::new(data, Timestamp::from_micros(index * 20_000), audio_format())
        .with_key_frame(true);
    if index == 0 {
        let extras: Vec<Bytes> = vec![Bytes::from_static(&ASC)];
        frame = frame.with_extras(Arc::from(extras));
    }
    frame
}
