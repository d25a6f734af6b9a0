use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

use tracing::debug;

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const ELF_CLASS_32: u8 = 1;
const ELF_CLASS_64: u8 = 2;

const MACHO_MAGIC_32: [u8; 4] = [0xce, 0xfa, 0xed, 0xfe];
const MACHO_MAGIC_64: [u8; 4] = [0xcf, 0xfa, 0xed, 0xfe];

const PE_SIGNATURE: [u8; 4] = [b'P', b'E', 0, 0];
const PE_MACHINE_I386: u16 = 0x014c;
const PE_MACHINE_AMD64: u16 = 0x8664;
const PE_MACHINE_ARM64: u16 = 0xaa64;

/// Offset of `e_lfanew` in the DOS header.
const DOS_LFANEW_OFFSET: usize = 0x3c;

/// Pointer width of a native image or of the running process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bitness {
    Bits32,
    Bits64,
}

impl Bitness {
    #[cfg(target_pointer_width = "64")]
    pub const HOST: Bitness = Bitness::Bits64;
    #[cfg(not(target_pointer_width = "64"))]
    pub const HOST: Bitness = Bitness::Bits32;

    /// The other pointer width.
    pub fn other(self) -> Bitness {
        match self {
            Bitness::Bits32 => Bitness::Bits64,
            Bitness::Bits64 => Bitness::Bits32,
        }
    }

    /// Name of the per-width library directory (`x86` or `x64`).
    pub fn dir_name(self) -> &'static str {
        match self {
            Bitness::Bits32 => "x86",
            Bitness::Bits64 => "x64",
        }
    }

    pub fn is_host(self) -> bool {
        self == Bitness::HOST
    }

    /// Detect the pointer width from the first bytes of an image.
    ///
    /// Understands ELF and Mach-O headers directly. PE images need the NT header,
    /// which lives at a variable offset, so use [`Bitness::from_pe_machine`] for them.
    ///
    /// # Returns
    ///
    /// `None` if the header is not recognized.
    pub fn from_header(header: &[u8]) -> Option<Bitness> {
        if header.len() >= 5 && header[..4] == ELF_MAGIC {
            return match header[4] {
                ELF_CLASS_32 => Some(Bitness::Bits32),
                ELF_CLASS_64 => Some(Bitness::Bits64),
                _ => None,
            };
        }

        if header.len() >= 4 {
            if header[..4] == MACHO_MAGIC_32 {
                return Some(Bitness::Bits32);
            }
            if header[..4] == MACHO_MAGIC_64 {
                return Some(Bitness::Bits64);
            }
        }

        None
    }

    /// Map a PE `Machine` field to a pointer width.
    pub fn from_pe_machine(machine: u16) -> Option<Bitness> {
        match machine {
            PE_MACHINE_I386 => Some(Bitness::Bits32),
            PE_MACHINE_AMD64 | PE_MACHINE_ARM64 => Some(Bitness::Bits64),
            _ => None,
        }
    }
}

impl std::fmt::Display for Bitness {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Bitness::Bits32 => write!(f, "32-bit"),
            Bitness::Bits64 => write!(f, "64-bit"),
        }
    }
}

/// Read the pointer width of the image stored at `path`.
///
/// # Returns
///
/// `Ok(None)` when the file is readable but is not an ELF, Mach-O or PE image.
pub fn read_bitness(path: &Path) -> io::Result<Option<Bitness>> {
    let mut file = File::open(path)?;

    let mut header = [0u8; 64];
    let len = read_up_to(&mut file, &mut header)?;
    let header = &header[..len];

    if let Some(bitness) = Bitness::from_header(header) {
        return Ok(Some(bitness));
    }

    if header.len() >= DOS_LFANEW_OFFSET + 4 && header.starts_with(b"MZ") {
        let mut lfanew = [0u8; 4];
        lfanew.copy_from_slice(&header[DOS_LFANEW_OFFSET..DOS_LFANEW_OFFSET + 4]);
        let nt_offset = u32::from_le_bytes(lfanew) as u64;

        let mut nt_header = [0u8; 6];
        file.seek(SeekFrom::Start(nt_offset))?;
        if read_up_to(&mut file, &mut nt_header)? == nt_header.len() && nt_header[..4] == PE_SIGNATURE {
            let machine = u16::from_le_bytes([nt_header[4], nt_header[5]]);
            return Ok(Bitness::from_pe_machine(machine));
        }
    }

    debug!(
        path = %path.display(),
        header = %hex::encode(&header[..header.len().min(16)]),
        "unrecognized image header"
    );
    Ok(None)
}

fn read_up_to(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_elf_class() {
        let mut header = vec![0x7f, b'E', b'L', b'F', 1, 1, 1, 0];
        assert_eq!(Bitness::from_header(&header), Some(Bitness::Bits32));

        header[4] = 2;
        assert_eq!(Bitness::from_header(&header), Some(Bitness::Bits64));

        header[4] = 9;
        assert_eq!(Bitness::from_header(&header), None);
    }

    #[test]
    fn test_macho_magic() {
        assert_eq!(
            Bitness::from_header(&[0xcf, 0xfa, 0xed, 0xfe, 7, 0, 0, 1]),
            Some(Bitness::Bits64)
        );
        assert_eq!(
            Bitness::from_header(&[0xce, 0xfa, 0xed, 0xfe]),
            Some(Bitness::Bits32)
        );
    }

    #[test]
    fn test_unknown_header() {
        assert_eq!(Bitness::from_header(b"#!/bin/sh"), None);
        assert_eq!(Bitness::from_header(&[]), None);
    }

    #[test]
    fn test_pe_machine() {
        assert_eq!(Bitness::from_pe_machine(0x014c), Some(Bitness::Bits32));
        assert_eq!(Bitness::from_pe_machine(0x8664), Some(Bitness::Bits64));
        assert_eq!(Bitness::from_pe_machine(0x0200), None);
    }

    #[test]
    fn test_other_and_dirs() {
        assert_eq!(Bitness::Bits32.other(), Bitness::Bits64);
        assert_eq!(Bitness::Bits64.dir_name(), "x64");
        assert_eq!(Bitness::Bits32.dir_name(), "x86");
        assert!(Bitness::HOST.is_host());
        assert!(!Bitness::HOST.other().is_host());
    }

    #[cfg(any(target_os = "linux", target_os = "macos"))]
    #[test]
    fn test_current_exe_matches_host() {
        let exe = std::env::current_exe().unwrap();
        assert_eq!(read_bitness(&exe).unwrap(), Some(Bitness::HOST));
    }
}
