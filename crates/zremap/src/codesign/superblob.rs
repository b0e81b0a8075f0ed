//! SuperBlob parsing for Apple code signatures
//!
//! The SuperBlob is the top-level container of an embedded signature. It
//! holds a header followed by an index of blob entries, each pointing to an
//! embedded blob (CodeDirectory, requirements, entitlements, CMS signature).
//!
//! ## Structure
//!
//! ```text
//! ┌────────────────────────────────────┐
//! │ SuperBlob Header (12 bytes)        │
//! │  - magic: 0xfade0cc0 (4 bytes)     │
//! │  - length: total size (4 bytes)    │
//! │  - count: number of blobs (4 bytes)│
//! ├────────────────────────────────────┤
//! │ Index Entry 0..count (8 bytes each)│
//! │  - slot_type (4 bytes)             │
//! │  - offset (4 bytes)                │
//! ├────────────────────────────────────┤
//! │ Blob data                          │
//! └────────────────────────────────────┘
//! ```
//!
//! Every field is big-endian regardless of the architecture of the binary.

use super::constants::*;
use crate::macho::MachOFile;
use crate::{Error, Result};

/// Size of the SuperBlob header in bytes (magic + length + count)
const SUPERBLOB_HEADER_SIZE: usize = 12;

/// Size of each index entry in bytes (slot_type + offset)
const INDEX_ENTRY_SIZE: usize = 8;

/// Size of a generic blob header (magic + length)
const BLOB_HEADER_SIZE: usize = 8;

/// A borrowed, validated SuperBlob.
#[derive(Debug, Clone)]
pub struct SuperBlob<'a> {
    data: &'a [u8],
    index: Vec<(u32, usize)>,
}

impl<'a> SuperBlob<'a> {
    /// Parse the SuperBlob at the start of `data`.
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        let magic = read_be_u32(data, 0)?;
        if magic != CSMAGIC_EMBEDDED_SIGNATURE {
            return Err(Error::MachO(format!(
                "unexpected signature magic {magic:#010x}"
            )));
        }

        let length = read_be_u32(data, 4)? as usize;
        let data = data
            .get(..length)
            .ok_or_else(|| Error::MachO("SuperBlob length exceeds signature data".into()))?;

        let count = read_be_u32(data, 8)? as usize;
        let mut index = Vec::with_capacity(count.min(64));
        for i in 0..count {
            let at = SUPERBLOB_HEADER_SIZE + i * INDEX_ENTRY_SIZE;
            let slot = read_be_u32(data, at)?;
            let offset = read_be_u32(data, at + 4)? as usize;
            index.push((slot, offset));
        }

        Ok(Self { data, index })
    }

    /// Slot types present, in index order.
    pub fn slots(&self) -> impl Iterator<Item = u32> + '_ {
        self.index.iter().map(|(slot, _)| *slot)
    }

    /// The blob stored in `slot`, including its 8-byte header.
    pub fn blob(&self, slot: u32) -> Result<Option<&'a [u8]>> {
        let Some(&(_, offset)) = self.index.iter().find(|(s, _)| *s == slot) else {
            return Ok(None);
        };
        let length = read_be_u32(self.data, offset + 4)? as usize;
        if length < BLOB_HEADER_SIZE {
            return Err(Error::MachO(format!("blob in slot {slot:#x} is truncated")));
        }
        self.data
            .get(offset..offset + length)
            .map(Some)
            .ok_or_else(|| Error::MachO(format!("blob in slot {slot:#x} out of bounds")))
    }

    /// Payload of the XML entitlements blob, if any.
    pub fn entitlements(&self) -> Result<Option<&'a [u8]>> {
        let Some(blob) = self.blob(CSSLOT_ENTITLEMENTS)? else {
            return Ok(None);
        };
        let magic = read_be_u32(blob, 0)?;
        if magic != CSMAGIC_EMBEDDED_ENTITLEMENTS {
            return Err(Error::MachO(format!(
                "entitlements slot holds magic {magic:#010x}"
            )));
        }
        Ok(Some(&blob[BLOB_HEADER_SIZE..]))
    }
}

/// XML entitlements embedded in the first slice of `file`.
///
/// `Ok(None)` when the binary is unsigned or was signed without
/// entitlements.
pub fn embedded_entitlements(file: &MachOFile) -> Result<Option<Vec<u8>>> {
    let Some(slice) = file.slices().first() else {
        return Ok(None);
    };
    let Some((dataoff, datasize)) = slice.code_signature else {
        return Ok(None);
    };

    let bytes = file.slice_bytes(slice);
    let start = dataoff as usize;
    let signature = bytes
        .get(start..start + datasize as usize)
        .ok_or_else(|| Error::MachO("code signature extends past end of slice".into()))?;

    let superblob = SuperBlob::parse(signature)?;
    Ok(superblob.entitlements()?.map(<[u8]>::to_vec))
}

fn read_be_u32(data: &[u8], offset: usize) -> Result<u32> {
    data.get(offset..offset + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| Error::MachO(format!("signature truncated at offset {offset}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::macho::testutil::ThinImage;

    const XML: &[u8] = br#"<?xml version="1.0" encoding="UTF-8"?>
<plist version="1.0"><dict><key>application-identifier</key><string>ABCDE12345.com.example.app</string></dict></plist>"#;

    fn superblob(entries: &[(u32, Vec<u8>)]) -> Vec<u8> {
        let header = SUPERBLOB_HEADER_SIZE + entries.len() * INDEX_ENTRY_SIZE;
        let total = header + entries.iter().map(|(_, b)| b.len()).sum::<usize>();
        let mut buf = Vec::new();
        buf.extend(CSMAGIC_EMBEDDED_SIGNATURE.to_be_bytes());
        buf.extend((total as u32).to_be_bytes());
        buf.extend((entries.len() as u32).to_be_bytes());
        let mut offset = header;
        for (slot, blob) in entries {
            buf.extend(slot.to_be_bytes());
            buf.extend((offset as u32).to_be_bytes());
            offset += blob.len();
        }
        for (_, blob) in entries {
            buf.extend(blob);
        }
        buf
    }

    fn blob(magic: u32, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend(magic.to_be_bytes());
        buf.extend(((payload.len() + 8) as u32).to_be_bytes());
        buf.extend(payload);
        buf
    }

    #[test]
    fn test_finds_entitlements_among_other_slots() {
        let data = superblob(&[
            (CSSLOT_CODEDIRECTORY, blob(CSMAGIC_CODEDIRECTORY, &[0; 16])),
            (CSSLOT_ENTITLEMENTS, blob(CSMAGIC_EMBEDDED_ENTITLEMENTS, XML)),
            (CSSLOT_DER_ENTITLEMENTS, blob(CSMAGIC_EMBEDDED_DER_ENTITLEMENTS, &[0x70, 0])),
        ]);
        let sb = SuperBlob::parse(&data).unwrap();
        assert_eq!(
            sb.slots().collect::<Vec<_>>(),
            vec![CSSLOT_CODEDIRECTORY, CSSLOT_ENTITLEMENTS, CSSLOT_DER_ENTITLEMENTS]
        );
        assert_eq!(sb.entitlements().unwrap(), Some(XML));
        assert!(sb.blob(0x0002).unwrap().is_none());
    }

    #[test]
    fn test_rejects_wrong_magic() {
        let mut data = superblob(&[]);
        data[0] = 0;
        assert!(SuperBlob::parse(&data).is_err());
    }

    #[test]
    fn test_rejects_truncated_index() {
        let mut data = superblob(&[(CSSLOT_ENTITLEMENTS, blob(CSMAGIC_EMBEDDED_ENTITLEMENTS, XML))]);
        data[8..12].copy_from_slice(&100u32.to_be_bytes());
        assert!(SuperBlob::parse(&data).is_err());
    }

    #[test]
    fn test_embedded_entitlements_from_binary() {
        let file = MachOFile::parse(ThinImage::new().entitlements(XML).build()).unwrap();
        assert_eq!(embedded_entitlements(&file).unwrap().as_deref(), Some(XML));

        let unsigned = MachOFile::parse(ThinImage::new().build()).unwrap();
        assert_eq!(embedded_entitlements(&unsigned).unwrap(), None);
    }
}
