//! Minimal AMF0 writer for FLV script tags.

use std::io::Write;

use byteorder::{BigEndian, WriteBytesExt};

use crate::error::MuxResult;

const MARKER_NUMBER: u8 = 0x00;
const MARKER_BOOLEAN: u8 = 0x01;
const MARKER_STRING: u8 = 0x02;
const MARKER_ECMA_ARRAY: u8 = 0x08;
const OBJECT_END: [u8; 3] = [0x00, 0x00, 0x09];

#[derive(Clone, Debug, PartialEq)]
pub enum Amf0Value {
    Number(f64),
    Boolean(bool),
    String(String),
    EcmaArray(Vec<(String, Amf0Value)>),
}

fn key_size(key: &str) -> u64 {
    2 + key.len() as u64
}

fn write_key<W: Write>(key: &str, writer: &mut W) -> MuxResult<()> {
    writer.write_u16::<BigEndian>(key.len() as u16)?;
    writer.write_all(key.as_bytes())?;
    Ok(())
}

impl Amf0Value {
    /// Encoded size including the type marker.
    pub fn size(&self) -> u64 {
        match self {
            Self::Number(_) => 9,
            Self::Boolean(_) => 2,
            Self::String(s) => 1 + key_size(s),
            Self::EcmaArray(entries) => {
                1 + 4
                    + entries
                        .iter()
                        .map(|(k, v)| key_size(k) + v.size())
                        .sum::<u64>()
                    + OBJECT_END.len() as u64
            }
        }
    }

    pub fn write<W: Write>(&self, writer: &mut W) -> MuxResult<()> {
        match self {
            Self::Number(n) => {
                writer.write_u8(MARKER_NUMBER)?;
                writer.write_f64::<BigEndian>(*n)?;
            }
            Self::Boolean(b) => {
                writer.write_u8(MARKER_BOOLEAN)?;
                writer.write_u8(u8::from(*b))?;
            }
            Self::String(s) => {
                writer.write_u8(MARKER_STRING)?;
                write_key(s, writer)?;
            }
            Self::EcmaArray(entries) => {
                writer.write_u8(MARKER_ECMA_ARRAY)?;
                writer.write_u32::<BigEndian>(entries.len() as u32)?;
                for (key, value) in entries {
                    write_key(key, writer)?;
                    value.write(writer)?;
                }
                writer.write_all(&OBJECT_END)?;
            }
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> MuxResult<Vec<u8>> {
        let mut out = Vec::with_capacity(self.size() as usize);
        self.write(&mut out)?;
        Ok(out)
    }
}
