//! Mach-O parsing using goblin.
//!
//! Parsing produces a read-only view of each architecture slice: where its
//! load commands live, which dylibs it links, whether it is encrypted and
//! how much padding is left before the first section. Editors in
//! [`super::load_commands`] re-parse after every structural change, so a
//! view never outlives the bytes it describes.

use crate::{Error, Result};
use goblin::mach::header::{MH_EXECUTE, SIZEOF_HEADER_32, SIZEOF_HEADER_64};
use goblin::mach::load_command::CommandVariant;
use goblin::mach::{Mach, MachO};
use std::path::Path;

/// A parsed thin or fat Mach-O image.
pub struct MachOFile {
    /// Raw file data
    data: Vec<u8>,
    /// Is FAT binary
    is_fat: bool,
    /// Architecture slices
    slices: Vec<ArchSlice>,
}

/// FairPlay encryption metadata of a slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncryptionInfo {
    /// Offset of the command within the slice.
    pub command_offset: usize,
    pub cryptoff: u32,
    pub cryptsize: u32,
    pub cryptid: u32,
}

/// An `LC_LOAD_DYLIB` or `LC_LOAD_WEAK_DYLIB` command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DylibRef {
    /// Offset of the command within the slice.
    pub command_offset: usize,
    pub cmdsize: usize,
    pub weak: bool,
    pub name: String,
}

/// An `LC_BUILD_VERSION` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildVersionRef {
    /// Offset of the command within the slice.
    pub command_offset: usize,
    pub platform: u32,
    pub minos: u32,
    pub sdk: u32,
}

/// A single architecture slice
#[derive(Debug, Clone)]
pub struct ArchSlice {
    /// Offset in file
    pub offset: usize,
    /// Size of slice
    pub size: usize,
    /// Is 64-bit
    pub is_64: bool,
    pub big_endian: bool,
    /// Is executable (MH_EXECUTE)
    pub is_executable: bool,
    pub header_size: usize,
    pub ncmds: u32,
    pub sizeofcmds: u32,
    /// File offset of the first section with content; load commands must end before it.
    pub first_content_offset: usize,
    pub encryption: Option<EncryptionInfo>,
    pub dylibs: Vec<DylibRef>,
    pub build_version: Option<BuildVersionRef>,
    /// `(dataoff, datasize)` of `LC_CODE_SIGNATURE`.
    pub code_signature: Option<(u32, u32)>,
}

impl ArchSlice {
    /// Slice-relative offset just past the last load command.
    pub fn load_commands_end(&self) -> usize {
        self.header_size + self.sizeofcmds as usize
    }

    /// Padding available for new load commands.
    pub fn load_command_space(&self) -> usize {
        self.first_content_offset.saturating_sub(self.load_commands_end())
    }

    pub fn is_encrypted(&self) -> bool {
        self.encryption.map_or(false, |info| info.cryptid != 0)
    }

    pub fn links(&self, name: &str) -> bool {
        self.dylibs.iter().any(|dylib| dylib.name == name)
    }
}

impl MachOFile {
    /// Open and parse a Mach-O file
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read(path.as_ref())?;
        Self::parse(data)
    }

    /// Parse Mach-O from bytes
    pub fn parse(data: Vec<u8>) -> Result<Self> {
        let (is_fat, slices) = parse_slices(&data)?;
        Ok(Self { data, is_fat, slices })
    }

    /// Is FAT binary
    pub fn is_fat(&self) -> bool {
        self.is_fat
    }

    /// Get architecture slices
    pub fn slices(&self) -> &[ArchSlice] {
        &self.slices
    }

    /// Bytes of one slice.
    pub fn slice_bytes(&self, slice: &ArchSlice) -> &[u8] {
        &self.data[slice.offset..slice.offset + slice.size]
    }
}

/// Parse slice views out of a borrowed image.
pub(crate) fn parse_slices(data: &[u8]) -> Result<(bool, Vec<ArchSlice>)> {
    let mach = Mach::parse(data).map_err(|e| Error::MachO(format!("Failed to parse: {}", e)))?;

    match mach {
        Mach::Binary(macho) => {
            let slice = parse_single(data, &macho)?;
            Ok((false, vec![slice]))
        }
        Mach::Fat(fat) => {
            let mut slices = Vec::new();
            for (i, arch) in fat.iter_arches().enumerate() {
                let arch = arch.map_err(|e| Error::MachO(format!("Fat arch {}: {}", i, e)))?;
                let offset = arch.offset as usize;
                let size = arch.size as usize;
                let slice_data = data
                    .get(offset..offset + size)
                    .ok_or_else(|| Error::MachO(format!("Slice {} extends past end of file", i)))?;

                let macho = MachO::parse(slice_data, 0)
                    .map_err(|e| Error::MachO(format!("Slice {}: {}", i, e)))?;

                let mut slice = parse_single(slice_data, &macho)?;
                slice.offset = offset;
                slice.size = size;
                slices.push(slice);
            }
            if slices.is_empty() {
                return Err(Error::MachO("Empty FAT binary".into()));
            }
            Ok((true, slices))
        }
    }
}

fn parse_single(slice_data: &[u8], macho: &MachO) -> Result<ArchSlice> {
    let is_64 = macho.is_64;
    let header_size = if is_64 { SIZEOF_HEADER_64 } else { SIZEOF_HEADER_32 };

    let mut encryption = None;
    let mut dylibs = Vec::new();
    let mut build_version = None;
    let mut code_signature = None;

    for lc in &macho.load_commands {
        let cmdsize = lc.command.cmdsize();
        match &lc.command {
            CommandVariant::EncryptionInfo32(info) => {
                encryption = Some(EncryptionInfo {
                    command_offset: lc.offset,
                    cryptoff: info.cryptoff,
                    cryptsize: info.cryptsize,
                    cryptid: info.cryptid,
                });
            }
            CommandVariant::EncryptionInfo64(info) => {
                encryption = Some(EncryptionInfo {
                    command_offset: lc.offset,
                    cryptoff: info.cryptoff,
                    cryptsize: info.cryptsize,
                    cryptid: info.cryptid,
                });
            }
            CommandVariant::LoadDylib(cmd) | CommandVariant::LoadWeakDylib(cmd) => {
                let name = read_lc_str(slice_data, lc.offset, cmd.dylib.name as usize, cmdsize)?;
                dylibs.push(DylibRef {
                    command_offset: lc.offset,
                    cmdsize,
                    weak: matches!(lc.command, CommandVariant::LoadWeakDylib(_)),
                    name,
                });
            }
            CommandVariant::BuildVersion(cmd) => {
                build_version = Some(BuildVersionRef {
                    command_offset: lc.offset,
                    platform: cmd.platform,
                    minos: cmd.minos,
                    sdk: cmd.sdk,
                });
            }
            CommandVariant::CodeSignature(cs) => {
                code_signature = Some((cs.dataoff, cs.datasize));
            }
            _ => {}
        }
    }

    Ok(ArchSlice {
        offset: 0,
        size: slice_data.len(),
        is_64,
        big_endian: !macho.little_endian,
        is_executable: macho.header.filetype == MH_EXECUTE,
        header_size,
        ncmds: macho.header.ncmds as u32,
        sizeofcmds: macho.header.sizeofcmds,
        first_content_offset: first_content_offset(macho, slice_data.len()),
        encryption,
        dylibs,
        build_version,
        code_signature,
    })
}

fn read_lc_str(data: &[u8], command_offset: usize, name_offset: usize, cmdsize: usize) -> Result<String> {
    let bytes = data
        .get(command_offset + name_offset..command_offset + cmdsize)
        .ok_or_else(|| Error::MachO(format!("dylib name out of bounds at {:#x}", command_offset)))?;
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    Ok(String::from_utf8_lossy(&bytes[..end]).into_owned())
}

/// Lowest file offset of any section with content, falling back to the
/// first non-zero segment offset.
fn first_content_offset(macho: &MachO, slice_len: usize) -> usize {
    let mut min_offset = usize::MAX;

    for segment in macho.segments.iter() {
        if let Ok(sections) = segment.sections() {
            for (section, _) in sections {
                if section.offset > 0 && section.size > 0 {
                    min_offset = min_offset.min(section.offset as usize);
                }
            }
        }
    }

    if min_offset == usize::MAX {
        for lc in &macho.load_commands {
            let fileoff = match &lc.command {
                CommandVariant::Segment64(seg) => seg.fileoff,
                CommandVariant::Segment32(seg) => seg.fileoff as u64,
                _ => continue,
            };
            if fileoff > 0 {
                min_offset = min_offset.min(fileoff as usize);
            }
        }
    }

    if min_offset == usize::MAX {
        slice_len
    } else {
        min_offset
    }
}
