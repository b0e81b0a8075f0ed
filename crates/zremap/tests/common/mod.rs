//! Bundle fixtures shared by the integration tests.
//!
//! Binaries are thin little-endian arm64 images: header and load commands,
//! `__text` at 0x400, `__LINKEDIT` (code signature) from 0x600 to the end.

#![allow(dead_code)]

use plist::{Dictionary, Value};
use std::fs;
use std::path::{Path, PathBuf};

pub const ORIGINAL_TEAM: &str = "ABCDE12345";
pub const NEW_TEAM: &str = "ZZZZZ99999";
pub const MAIN_ID: &str = "com.example.demo";
pub const WIDGET_ID: &str = "com.example.demo.widget";
pub const SHARED_GROUP: &str = "group.com.example.shared";

const TEXT_OFFSET: usize = 0x400;
const LINKEDIT_OFFSET: usize = 0x600;
const MIN_LINKEDIT_SIZE: usize = 0x200;

#[derive(Default)]
pub struct Binary {
    text: Vec<u8>,
    entitlements: Option<Vec<u8>>,
    cryptid: Option<u32>,
}

impl Binary {
    pub fn new() -> Self {
        Self::default()
    }

    /// NUL-separated strings placed in `__text`.
    pub fn strings(mut self, strings: &[&str]) -> Self {
        for s in strings {
            self.text.extend_from_slice(s.as_bytes());
            self.text.push(0);
        }
        self
    }

    pub fn entitlements(mut self, entitlements: &Dictionary) -> Self {
        let mut xml = Vec::new();
        plist::to_writer_xml(&mut xml, entitlements).unwrap();
        self.entitlements = Some(xml);
        self
    }

    pub fn encrypted(mut self) -> Self {
        self.cryptid = Some(1);
        self
    }

    pub fn build(self) -> Vec<u8> {
        let signature = self.entitlements.as_deref().map(signature);
        let linkedit_size = signature
            .as_ref()
            .map_or(MIN_LINKEDIT_SIZE, |sig| sig.len().max(MIN_LINKEDIT_SIZE).next_multiple_of(16));
        let image_size = LINKEDIT_OFFSET + linkedit_size;

        let mut cmds: Vec<Vec<u8>> = Vec::new();

        let mut text = Vec::new();
        u32s(&mut text, &[0x19, 72 + 80]);
        name16(&mut text, "__TEXT");
        u64s(&mut text, &[0x1_0000_0000, LINKEDIT_OFFSET as u64, 0, LINKEDIT_OFFSET as u64]);
        u32s(&mut text, &[5, 5, 1, 0]);
        name16(&mut text, "__text");
        name16(&mut text, "__TEXT");
        u64s(
            &mut text,
            &[0x1_0000_0000 + TEXT_OFFSET as u64, (LINKEDIT_OFFSET - TEXT_OFFSET) as u64],
        );
        u32s(&mut text, &[TEXT_OFFSET as u32, 2, 0, 0, 0x8000_0400, 0, 0, 0]);
        cmds.push(text);

        let mut linkedit = Vec::new();
        u32s(&mut linkedit, &[0x19, 72]);
        name16(&mut linkedit, "__LINKEDIT");
        let size = linkedit_size as u64;
        u64s(
            &mut linkedit,
            &[0x1_0000_0000 + LINKEDIT_OFFSET as u64, size, LINKEDIT_OFFSET as u64, size],
        );
        u32s(&mut linkedit, &[1, 1, 0, 0]);
        cmds.push(linkedit);

        if let Some(cryptid) = self.cryptid {
            let mut enc = Vec::new();
            u32s(
                &mut enc,
                &[0x2c, 24, TEXT_OFFSET as u32, (LINKEDIT_OFFSET - TEXT_OFFSET) as u32, cryptid, 0],
            );
            cmds.push(enc);
        }

        cmds.push(dylib_command("/usr/lib/libSystem.B.dylib"));

        if let Some(sig) = &signature {
            let mut cs = Vec::new();
            u32s(&mut cs, &[0x1d, 16, LINKEDIT_OFFSET as u32, sig.len() as u32]);
            cmds.push(cs);
        }

        let sizeofcmds: usize = cmds.iter().map(Vec::len).sum();
        let mut out = Vec::with_capacity(image_size);
        u32s(
            &mut out,
            &[0xfeed_facf, 0x0100_000c, 0, 2, cmds.len() as u32, sizeofcmds as u32, 0, 0],
        );
        for cmd in cmds {
            out.extend_from_slice(&cmd);
        }
        out.resize(image_size, 0);
        out[TEXT_OFFSET..TEXT_OFFSET + self.text.len()].copy_from_slice(&self.text);
        if let Some(sig) = signature {
            out[LINKEDIT_OFFSET..LINKEDIT_OFFSET + sig.len()].copy_from_slice(&sig);
        }
        out
    }
}

fn dylib_command(name: &str) -> Vec<u8> {
    let cmdsize = (24 + name.len() + 1 + 7) / 8 * 8;
    let mut cmd = Vec::with_capacity(cmdsize);
    u32s(&mut cmd, &[0xc, cmdsize as u32, 24, 2, 0x0001_0000, 0x0001_0000]);
    cmd.extend_from_slice(name.as_bytes());
    cmd.resize(cmdsize, 0);
    cmd
}

fn signature(xml: &[u8]) -> Vec<u8> {
    let blob_len = 8 + xml.len();
    let total = 12 + 8 + blob_len;
    let mut sig = Vec::with_capacity(total);
    for word in [0xfade_0cc0, total as u32, 1, 5, 20, 0xfade_7171, blob_len as u32] {
        sig.extend_from_slice(&u32::to_be_bytes(word));
    }
    sig.extend_from_slice(xml);
    sig
}

fn u32s(buf: &mut Vec<u8>, values: &[u32]) {
    for v in values {
        buf.extend_from_slice(&v.to_le_bytes());
    }
}

fn u64s(buf: &mut Vec<u8>, values: &[u64]) {
    for v in values {
        buf.extend_from_slice(&v.to_le_bytes());
    }
}

fn name16(buf: &mut Vec<u8>, name: &str) {
    let mut field = [0u8; 16];
    field[..name.len()].copy_from_slice(name.as_bytes());
    buf.extend_from_slice(&field);
}

pub fn strings(values: &[&str]) -> Value {
    Value::Array(values.iter().map(|s| Value::String(s.to_string())).collect())
}

pub fn write_bundle(dir: &Path, bundle_id: &str, executable: &str, binary: Vec<u8>) {
    fs::create_dir_all(dir).unwrap();
    let mut info = Dictionary::new();
    info.insert("CFBundleIdentifier".into(), Value::String(bundle_id.into()));
    info.insert("CFBundleExecutable".into(), Value::String(executable.into()));
    plist::to_file_xml(dir.join("Info.plist"), &info).unwrap();
    fs::write(dir.join(executable), binary).unwrap();
}

fn app_entitlements(bundle_id: &str) -> Dictionary {
    let mut ents = Dictionary::new();
    ents.insert(
        "application-identifier".into(),
        Value::String(format!("{ORIGINAL_TEAM}.{bundle_id}")),
    );
    ents.insert(
        "com.apple.developer.team-identifier".into(),
        Value::String(ORIGINAL_TEAM.into()),
    );
    ents.insert("com.apple.security.application-groups".into(), strings(&[SHARED_GROUP]));
    ents.insert(
        "keychain-access-groups".into(),
        strings(&[&format!("{ORIGINAL_TEAM}.{MAIN_ID}")]),
    );
    ents.insert("get-task-allow".into(), Value::Boolean(true));
    ents
}

/// `Demo.app` with a framework and an extension sharing one app group.
///
/// ```text
/// Demo.app/Demo
/// Demo.app/Frameworks/Kit.framework/Kit
/// Demo.app/PlugIns/Widget.appex/Widget
/// ```
pub fn demo_app(root: &Path, main: Binary) -> PathBuf {
    let app = root.join("Payload/Demo.app");
    write_bundle(&app, MAIN_ID, "Demo", main.entitlements(&app_entitlements(MAIN_ID)).build());
    write_bundle(
        &app.join("Frameworks/Kit.framework"),
        "com.example.kit",
        "Kit",
        Binary::new().strings(&[ORIGINAL_TEAM, MAIN_ID]).build(),
    );
    write_bundle(
        &app.join("PlugIns/Widget.appex"),
        WIDGET_ID,
        "Widget",
        Binary::new()
            .strings(&[WIDGET_ID, SHARED_GROUP])
            .entitlements(&app_entitlements(WIDGET_ID))
            .build(),
    );
    app
}

/// Main binary referencing its own identity, the shared group and the team.
pub fn main_binary() -> Binary {
    Binary::new().strings(&[MAIN_ID, SHARED_GROUP, ORIGINAL_TEAM, WIDGET_ID])
}

pub fn contains(haystack: &[u8], needle: &str) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle.as_bytes())
}

pub fn read_plist(path: &Path) -> Dictionary {
    plist::from_file(path).unwrap()
}
