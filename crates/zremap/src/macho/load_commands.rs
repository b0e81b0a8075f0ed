//! In-place load command surgery.
//!
//! Every edit keeps slice sizes unchanged: removed commands are compacted
//! upward and the freed tail is zeroed; inserted commands go into the padding
//! between the last command and the first section. Fat headers therefore
//! never need rewriting.

use super::parser::{parse_slices, ArchSlice};
use crate::{Error, Result};
use log::{debug, info, warn};
use std::str::FromStr;

const LC_LOAD_DYLIB: u32 = 0xc;

/// Fixed part of `dylib_command`: cmd, cmdsize, name offset, timestamp,
/// current version, compatibility version.
const DYLIB_COMMAND_SIZE: usize = 24;

const NCMDS_OFFSET: usize = 16;
const SIZEOFCMDS_OFFSET: usize = 20;

/// Fail if any slice of the image carries a nonzero `cryptid`.
///
/// Every slice is checked before anything else so no slice of a partially
/// encrypted fat binary gets modified.
pub fn reject_if_encrypted(data: &[u8]) -> Result<()> {
    let (_, slices) = parse_slices(data)?;
    for (index, slice) in slices.iter().enumerate() {
        if let Some(info) = slice.encryption {
            if info.cryptid != 0 {
                return Err(Error::EncryptedBinary {
                    path: Default::default(),
                    slice: index,
                    cryptid: info.cryptid,
                });
            }
        }
    }
    Ok(())
}

/// Remove every `LC_LOAD_DYLIB`/`LC_LOAD_WEAK_DYLIB` whose path contains one
/// of `fragments`, in every slice. Returns the number of commands removed.
///
/// Removing a dependency shifts the ordinals of the dylibs after it.
pub fn remove_conflicting_load_commands(data: &mut [u8], fragments: &[String]) -> Result<usize> {
    let fragments: Vec<&str> = fragments
        .iter()
        .map(String::as_str)
        .filter(|f| !f.is_empty())
        .collect();
    if fragments.is_empty() {
        return Ok(0);
    }

    let (_, slices) = parse_slices(data)?;
    let mut removed = 0;
    for slice in &slices {
        let bytes = &mut data[slice.offset..slice.offset + slice.size];
        removed += remove_from_slice(bytes, slice, &fragments);
    }
    Ok(removed)
}

fn remove_from_slice(bytes: &mut [u8], slice: &ArchSlice, fragments: &[&str]) -> usize {
    let mut end = slice.load_commands_end();
    let mut ncmds = slice.ncmds;
    let mut sizeofcmds = slice.sizeofcmds;
    let mut removed = 0;

    // Back to front keeps the offsets of earlier commands valid.
    for dylib in slice.dylibs.iter().rev() {
        if !fragments.iter().any(|f| dylib.name.contains(f)) {
            continue;
        }
        let start = dylib.command_offset;
        let size = dylib.cmdsize;
        bytes.copy_within(start + size..end, start);
        bytes[end - size..end].fill(0);

        end -= size;
        ncmds -= 1;
        sizeofcmds -= size as u32;
        removed += 1;
        info!("removed load command for {}", dylib.name);
    }

    if removed > 0 {
        write_u32(bytes, NCMDS_OFFSET, ncmds, slice.big_endian);
        write_u32(bytes, SIZEOFCMDS_OFFSET, sizeofcmds, slice.big_endian);
    }
    removed
}

/// Append an `LC_LOAD_DYLIB` for `path` to every slice that does not already
/// link it. Returns the number of slices changed.
pub fn insert_load_dylib(data: &mut [u8], path: &str) -> Result<usize> {
    let (_, slices) = parse_slices(data)?;
    let mut changed = 0;
    for (index, slice) in slices.iter().enumerate() {
        if slice.is_encrypted() {
            return Err(Error::EncryptedBinary {
                path: Default::default(),
                slice: index,
                cryptid: slice.encryption.map_or(0, |info| info.cryptid),
            });
        }
        let bytes = &mut data[slice.offset..slice.offset + slice.size];
        if insert_into_slice(bytes, slice, path)? {
            changed += 1;
        }
    }
    Ok(changed)
}

fn insert_into_slice(bytes: &mut [u8], slice: &ArchSlice, path: &str) -> Result<bool> {
    if slice.links(path) {
        debug!("{path} already linked, skipping");
        return Ok(false);
    }

    let align = if slice.is_64 { 8 } else { 4 };
    let cmdsize = align_to(DYLIB_COMMAND_SIZE + path.len() + 1, align);
    let available = slice.load_command_space();
    if cmdsize > available {
        return Err(Error::LoadCommandSpace {
            path: Default::default(),
            needed: cmdsize,
            available,
        });
    }

    let start = slice.load_commands_end();
    if bytes[start..start + cmdsize].iter().any(|&b| b != 0) {
        warn!("load command padding is not empty; overwriting {cmdsize} bytes");
    }

    let be = slice.big_endian;
    bytes[start..start + cmdsize].fill(0);
    write_u32(bytes, start, LC_LOAD_DYLIB, be);
    write_u32(bytes, start + 4, cmdsize as u32, be);
    write_u32(bytes, start + 8, DYLIB_COMMAND_SIZE as u32, be);
    write_u32(bytes, start + 12, 2, be);
    write_u32(bytes, start + 16, 0, be);
    write_u32(bytes, start + 20, 0, be);
    bytes[start + DYLIB_COMMAND_SIZE..start + DYLIB_COMMAND_SIZE + path.len()]
        .copy_from_slice(path.as_bytes());

    write_u32(bytes, NCMDS_OFFSET, slice.ncmds + 1, be);
    write_u32(bytes, SIZEOFCMDS_OFFSET, slice.sizeofcmds + cmdsize as u32, be);
    Ok(true)
}

/// Target platform and versions for `LC_BUILD_VERSION`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildVersionTarget {
    pub platform: Platform,
    /// Packed `xxxx.yy.zz`.
    pub minos: u32,
    /// Packed `xxxx.yy.zz`.
    pub sdk: u32,
}

impl BuildVersionTarget {
    /// Build a target from dotted version strings.
    pub fn new(platform: Platform, minos: &str, sdk: &str) -> Result<Self> {
        Ok(Self {
            platform,
            minos: parse_version(minos)?,
            sdk: parse_version(sdk)?,
        })
    }
}

/// Platforms `LC_BUILD_VERSION` can name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    MacOs,
    Ios,
    TvOs,
    WatchOs,
    MacCatalyst,
    IosSimulator,
}

impl Platform {
    pub fn raw(self) -> u32 {
        match self {
            Platform::MacOs => 1,
            Platform::Ios => 2,
            Platform::TvOs => 3,
            Platform::WatchOs => 4,
            Platform::MacCatalyst => 6,
            Platform::IosSimulator => 7,
        }
    }
}

impl FromStr for Platform {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "macos" => Ok(Platform::MacOs),
            "ios" => Ok(Platform::Ios),
            "tvos" => Ok(Platform::TvOs),
            "watchos" => Ok(Platform::WatchOs),
            "maccatalyst" => Ok(Platform::MacCatalyst),
            "iossimulator" | "ios-simulator" => Ok(Platform::IosSimulator),
            other => Err(Error::Config(format!("unknown platform '{other}'"))),
        }
    }
}

/// Pack `X.Y.Z` (minor and patch optional) as `X << 16 | Y << 8 | Z`.
pub fn parse_version(version: &str) -> Result<u32> {
    let invalid = || Error::Config(format!("invalid version '{version}'"));
    let mut parts = version.trim().split('.');
    let major: u32 = parts.next().ok_or_else(invalid)?.parse().map_err(|_| invalid())?;
    let minor: u32 = match parts.next() {
        Some(p) => p.parse().map_err(|_| invalid())?,
        None => 0,
    };
    let patch: u32 = match parts.next() {
        Some(p) => p.parse().map_err(|_| invalid())?,
        None => 0,
    };
    if parts.next().is_some() || major > 0xffff || minor > 0xff || patch > 0xff {
        return Err(invalid());
    }
    Ok(major << 16 | minor << 8 | patch)
}

/// Overwrite platform, minos and sdk of `LC_BUILD_VERSION` in every slice
/// that has one. Returns the number of slices rewritten.
pub fn rewrite_build_version(data: &mut [u8], target: BuildVersionTarget) -> Result<usize> {
    let (_, slices) = parse_slices(data)?;
    let mut rewritten = 0;
    for (index, slice) in slices.iter().enumerate() {
        let Some(build) = slice.build_version else {
            warn!("slice {index} has no LC_BUILD_VERSION, leaving it as is");
            continue;
        };
        let at = slice.offset + build.command_offset;
        let be = slice.big_endian;
        write_u32(data, at + 8, target.platform.raw(), be);
        write_u32(data, at + 12, target.minos, be);
        write_u32(data, at + 16, target.sdk, be);
        rewritten += 1;
    }
    Ok(rewritten)
}

fn align_to(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

fn write_u32(data: &mut [u8], offset: usize, value: u32, big_endian: bool) {
    let bytes = if big_endian {
        value.to_be_bytes()
    } else {
        value.to_le_bytes()
    };
    data[offset..offset + 4].copy_from_slice(&bytes);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::macho::parser::MachOFile;
    use crate::macho::testutil::{fat, ThinImage, IMAGE_SIZE};

    #[test]
    fn test_align_to() {
        assert_eq!(align_to(24 + 18 + 1, 8), 48);
        assert_eq!(align_to(48, 8), 48);
        assert_eq!(align_to(43, 4), 44);
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("14.0").unwrap(), 0x000e_0000);
        assert_eq!(parse_version("17.2.1").unwrap(), 0x0011_0201);
        assert_eq!(parse_version("15").unwrap(), 0x000f_0000);
        assert!(parse_version("1.2.3.4").is_err());
        assert!(parse_version("x.1").is_err());
        assert!(parse_version("1.300").is_err());
    }

    #[test]
    fn test_reject_encrypted_fat_slice() {
        let data = fat(vec![
            ThinImage::new().build(),
            ThinImage::new().x86_64().encrypted(1).build(),
        ]);
        match reject_if_encrypted(&data) {
            Err(Error::EncryptedBinary { slice, cryptid, .. }) => {
                assert_eq!(slice, 1);
                assert_eq!(cryptid, 1);
            }
            other => panic!("expected EncryptedBinary, got {other:?}"),
        }
    }

    #[test]
    fn test_cryptid_zero_is_not_encrypted() {
        let data = ThinImage::new().encrypted(0).build();
        assert!(reject_if_encrypted(&data).is_ok());
    }

    #[test]
    fn test_insert_then_already_present() {
        let mut data = ThinImage::new().dylib("/usr/lib/libSystem.B.dylib").build();
        let before = MachOFile::parse(data.clone()).unwrap().slices()[0].clone();

        assert_eq!(insert_load_dylib(&mut data, "@loader_path/Frameworks/t.dylib").unwrap(), 1);
        assert_eq!(data.len(), IMAGE_SIZE);

        let after = MachOFile::parse(data.clone()).unwrap().slices()[0].clone();
        assert_eq!(after.ncmds, before.ncmds + 1);
        assert_eq!(after.sizeofcmds, before.sizeofcmds + 56);
        assert_eq!(after.dylibs.last().unwrap().name, "@loader_path/Frameworks/t.dylib");

        assert_eq!(insert_load_dylib(&mut data, "@loader_path/Frameworks/t.dylib").unwrap(), 0);
    }

    #[test]
    fn test_insert_without_space() {
        let mut data = ThinImage::new().crowd_load_commands(760).build();
        let original = data.clone();
        match insert_load_dylib(&mut data, "@loader_path/Frameworks/t.dylib") {
            Err(Error::LoadCommandSpace { needed, available, .. }) => {
                assert_eq!(needed, 56);
                assert!(available < needed);
            }
            other => panic!("expected LoadCommandSpace, got {other:?}"),
        }
        assert_eq!(data, original);
    }

    #[test]
    fn test_remove_conflicting_compacts_commands() {
        let mut data = ThinImage::new()
            .dylib("/usr/lib/libSystem.B.dylib")
            .dylib("@rpath/CydiaSubstrate.framework/CydiaSubstrate")
            .dylib("/usr/lib/libobjc.A.dylib")
            .build();
        let before = MachOFile::parse(data.clone()).unwrap().slices()[0].clone();
        let removed_size = before.dylibs[1].cmdsize as u32;

        let removed =
            remove_conflicting_load_commands(&mut data, &["CydiaSubstrate".to_string()]).unwrap();
        assert_eq!(removed, 1);

        let after = MachOFile::parse(data.clone()).unwrap().slices()[0].clone();
        assert_eq!(after.ncmds, before.ncmds - 1);
        assert_eq!(after.sizeofcmds, before.sizeofcmds - removed_size);
        let names: Vec<&str> = after.dylibs.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["/usr/lib/libSystem.B.dylib", "/usr/lib/libobjc.A.dylib"]);

        let end = after.load_commands_end();
        assert!(data[end..end + removed_size as usize].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_empty_fragment_removes_nothing() {
        let mut data = ThinImage::new().dylib("/usr/lib/libSystem.B.dylib").build();
        assert_eq!(remove_conflicting_load_commands(&mut data, &[String::new()]).unwrap(), 0);
    }

    #[test]
    fn test_fat_edits_every_slice() {
        let mut data = fat(vec![
            ThinImage::new().dylib("/usr/lib/libsubstitute.dylib").build(),
            ThinImage::new().x86_64().dylib("/usr/lib/libsubstitute.dylib").build(),
        ]);
        let len = data.len();
        assert_eq!(
            remove_conflicting_load_commands(&mut data, &["substitute".to_string()]).unwrap(),
            2
        );
        assert_eq!(insert_load_dylib(&mut data, "@loader_path/Frameworks/t.dylib").unwrap(), 2);
        assert_eq!(data.len(), len);

        let file = MachOFile::parse(data).unwrap();
        for slice in file.slices() {
            assert_eq!(slice.dylibs.len(), 1);
            assert!(slice.links("@loader_path/Frameworks/t.dylib"));
        }
    }

    #[test]
    fn test_rewrite_build_version() {
        let mut data = ThinImage::new().build_version(2, 0x000f_0000, 0x0011_0000).build();
        let target = BuildVersionTarget::new(Platform::Ios, "14.0", "17.2").unwrap();
        assert_eq!(rewrite_build_version(&mut data, target).unwrap(), 1);

        let slice = MachOFile::parse(data).unwrap().slices()[0].clone();
        let bv = slice.build_version.unwrap();
        assert_eq!(bv.platform, 2);
        assert_eq!(bv.minos, 0x000e_0000);
        assert_eq!(bv.sdk, 0x0011_0200);
    }

    #[test]
    fn test_rewrite_build_version_missing_command() {
        let mut data = ThinImage::new().build();
        let target = BuildVersionTarget::new(Platform::Ios, "14.0", "17.0").unwrap();
        assert_eq!(rewrite_build_version(&mut data, target).unwrap(), 0);
    }

    #[test]
    fn test_platform_parse() {
        assert_eq!("iOS".parse::<Platform>().unwrap(), Platform::Ios);
        assert!("amiga".parse::<Platform>().is_err());
    }
}
