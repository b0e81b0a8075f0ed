//! Synthetic Mach-O images for unit tests.
//!
//! Layout of a thin image (little-endian arm64, `MH_EXECUTE`):
//!
//! ```text
//! 0x000  mach_header_64
//! 0x020  load commands (padding up to 0x400)
//! 0x400  __TEXT,__text  (caller supplied bytes)
//! 0x600  __LINKEDIT     (code signature, when present)
//! 0x800  end
//! ```

pub const TEXT_OFFSET: usize = 0x400;
pub const LINKEDIT_OFFSET: usize = 0x600;
pub const IMAGE_SIZE: usize = 0x800;

const CPU_TYPE_ARM64: u32 = 0x0100_000c;
const CPU_TYPE_X86_64: u32 = 0x0100_0007;

#[derive(Default)]
pub struct ThinImage {
    dylibs: Vec<String>,
    cryptid: Option<u32>,
    build_version: Option<(u32, u32, u32)>,
    text: Vec<u8>,
    entitlements: Option<Vec<u8>>,
    padding_commands: usize,
    cpu_type: Option<u32>,
}

impl ThinImage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dylib(mut self, name: &str) -> Self {
        self.dylibs.push(name.to_string());
        self
    }

    pub fn encrypted(mut self, cryptid: u32) -> Self {
        self.cryptid = Some(cryptid);
        self
    }

    pub fn build_version(mut self, platform: u32, minos: u32, sdk: u32) -> Self {
        self.build_version = Some((platform, minos, sdk));
        self
    }

    /// Bytes placed at the start of `__text`.
    pub fn text(mut self, bytes: &[u8]) -> Self {
        self.text = bytes.to_vec();
        self
    }

    /// Embed a code signature carrying these entitlements.
    pub fn entitlements(mut self, xml: &[u8]) -> Self {
        self.entitlements = Some(xml.to_vec());
        self
    }

    /// Fill the load command area with dummy dylib commands of this many bytes.
    pub fn crowd_load_commands(mut self, bytes: usize) -> Self {
        self.padding_commands = bytes;
        self
    }

    pub fn x86_64(mut self) -> Self {
        self.cpu_type = Some(CPU_TYPE_X86_64);
        self
    }

    pub fn build(self) -> Vec<u8> {
        let mut cmds: Vec<Vec<u8>> = Vec::new();

        // __TEXT with one __text section.
        let mut text = Vec::new();
        push_u32(&mut text, 0x19);
        push_u32(&mut text, 72 + 80);
        push_name(&mut text, "__TEXT");
        push_u64(&mut text, 0x1_0000_0000);
        push_u64(&mut text, LINKEDIT_OFFSET as u64);
        push_u64(&mut text, 0);
        push_u64(&mut text, LINKEDIT_OFFSET as u64);
        push_u32(&mut text, 5);
        push_u32(&mut text, 5);
        push_u32(&mut text, 1);
        push_u32(&mut text, 0);
        push_name(&mut text, "__text");
        push_name(&mut text, "__TEXT");
        push_u64(&mut text, 0x1_0000_0000 + TEXT_OFFSET as u64);
        push_u64(&mut text, (LINKEDIT_OFFSET - TEXT_OFFSET) as u64);
        push_u32(&mut text, TEXT_OFFSET as u32);
        push_u32(&mut text, 2);
        push_u32(&mut text, 0);
        push_u32(&mut text, 0);
        push_u32(&mut text, 0x8000_0400);
        push_u32(&mut text, 0);
        push_u32(&mut text, 0);
        push_u32(&mut text, 0);
        cmds.push(text);

        let mut linkedit = Vec::new();
        push_u32(&mut linkedit, 0x19);
        push_u32(&mut linkedit, 72);
        push_name(&mut linkedit, "__LINKEDIT");
        push_u64(&mut linkedit, 0x1_0000_0000 + LINKEDIT_OFFSET as u64);
        push_u64(&mut linkedit, (IMAGE_SIZE - LINKEDIT_OFFSET) as u64);
        push_u64(&mut linkedit, LINKEDIT_OFFSET as u64);
        push_u64(&mut linkedit, (IMAGE_SIZE - LINKEDIT_OFFSET) as u64);
        push_u32(&mut linkedit, 1);
        push_u32(&mut linkedit, 1);
        push_u32(&mut linkedit, 0);
        push_u32(&mut linkedit, 0);
        cmds.push(linkedit);

        if let Some(cryptid) = self.cryptid {
            let mut enc = Vec::new();
            push_u32(&mut enc, 0x2c);
            push_u32(&mut enc, 24);
            push_u32(&mut enc, TEXT_OFFSET as u32);
            push_u32(&mut enc, (LINKEDIT_OFFSET - TEXT_OFFSET) as u32);
            push_u32(&mut enc, cryptid);
            push_u32(&mut enc, 0);
            cmds.push(enc);
        }

        if let Some((platform, minos, sdk)) = self.build_version {
            let mut bv = Vec::new();
            push_u32(&mut bv, 0x32);
            push_u32(&mut bv, 24);
            push_u32(&mut bv, platform);
            push_u32(&mut bv, minos);
            push_u32(&mut bv, sdk);
            push_u32(&mut bv, 0);
            cmds.push(bv);
        }

        for name in &self.dylibs {
            cmds.push(dylib_command(name));
        }

        if self.padding_commands > 0 {
            // One oversized command whose name is all padding.
            let filler = "F".repeat(self.padding_commands.saturating_sub(32));
            cmds.push(dylib_command(&format!("/filler/{filler}")));
        }

        let signature = self.entitlements.as_deref().map(signature_with_entitlements);
        if let Some(sig) = &signature {
            let mut cs = Vec::new();
            push_u32(&mut cs, 0x1d);
            push_u32(&mut cs, 16);
            push_u32(&mut cs, LINKEDIT_OFFSET as u32);
            push_u32(&mut cs, sig.len() as u32);
            cmds.push(cs);
        }

        let sizeofcmds: usize = cmds.iter().map(Vec::len).sum();
        assert!(32 + sizeofcmds <= TEXT_OFFSET, "fixture load commands overflow");

        let mut out = Vec::with_capacity(IMAGE_SIZE);
        push_u32(&mut out, 0xfeed_facf);
        push_u32(&mut out, self.cpu_type.unwrap_or(CPU_TYPE_ARM64));
        push_u32(&mut out, 0);
        push_u32(&mut out, 2);
        push_u32(&mut out, cmds.len() as u32);
        push_u32(&mut out, sizeofcmds as u32);
        push_u32(&mut out, 0);
        push_u32(&mut out, 0);
        for cmd in cmds {
            out.extend_from_slice(&cmd);
        }
        out.resize(IMAGE_SIZE, 0);

        out[TEXT_OFFSET..TEXT_OFFSET + self.text.len()].copy_from_slice(&self.text);
        if let Some(sig) = signature {
            out[LINKEDIT_OFFSET..LINKEDIT_OFFSET + sig.len()].copy_from_slice(&sig);
        }
        out
    }
}

/// Wrap thin images in a big-endian fat header, slices aligned to 0x4000.
pub fn fat(slices: Vec<Vec<u8>>) -> Vec<u8> {
    const ALIGN: usize = 0x4000;
    let mut out = Vec::new();
    out.extend_from_slice(&0xcafe_babeu32.to_be_bytes());
    out.extend_from_slice(&(slices.len() as u32).to_be_bytes());

    let mut offset = ALIGN;
    let mut placed = Vec::new();
    for slice in &slices {
        let cpu_type = u32::from_le_bytes([slice[4], slice[5], slice[6], slice[7]]);
        out.extend_from_slice(&cpu_type.to_be_bytes());
        out.extend_from_slice(&0u32.to_be_bytes());
        out.extend_from_slice(&(offset as u32).to_be_bytes());
        out.extend_from_slice(&(slice.len() as u32).to_be_bytes());
        out.extend_from_slice(&14u32.to_be_bytes());
        placed.push(offset);
        offset += (slice.len() + ALIGN - 1) / ALIGN * ALIGN;
    }

    for (slice, at) in slices.iter().zip(placed) {
        out.resize(at, 0);
        out.extend_from_slice(slice);
    }
    out
}

fn dylib_command(name: &str) -> Vec<u8> {
    let cmdsize = (24 + name.len() + 1 + 7) / 8 * 8;
    let mut cmd = Vec::with_capacity(cmdsize);
    push_u32(&mut cmd, 0xc);
    push_u32(&mut cmd, cmdsize as u32);
    push_u32(&mut cmd, 24);
    push_u32(&mut cmd, 2);
    push_u32(&mut cmd, 0x0001_0000);
    push_u32(&mut cmd, 0x0001_0000);
    cmd.extend_from_slice(name.as_bytes());
    cmd.resize(cmdsize, 0);
    cmd
}

fn signature_with_entitlements(xml: &[u8]) -> Vec<u8> {
    let blob_len = 8 + xml.len();
    let total = 12 + 8 + blob_len;
    let mut sig = Vec::with_capacity(total);
    sig.extend_from_slice(&0xfade_0cc0u32.to_be_bytes());
    sig.extend_from_slice(&(total as u32).to_be_bytes());
    sig.extend_from_slice(&1u32.to_be_bytes());
    sig.extend_from_slice(&5u32.to_be_bytes());
    sig.extend_from_slice(&20u32.to_be_bytes());
    sig.extend_from_slice(&0xfade_7171u32.to_be_bytes());
    sig.extend_from_slice(&(blob_len as u32).to_be_bytes());
    sig.extend_from_slice(xml);
    sig
}

fn push_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn push_u64(buf: &mut Vec<u8>, value: u64) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn push_name(buf: &mut Vec<u8>, name: &str) {
    let mut field = [0u8; 16];
    field[..name.len()].copy_from_slice(name.as_bytes());
    buf.extend_from_slice(&field);
}
