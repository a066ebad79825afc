//! Candidate discovery for batch runs.
//!
//! Walks a root directory (optionally recursive), keeps files that look like
//! executables, drops oversized inputs, and caps the total candidate count.
//! Discovery order is deterministic: directory entries are visited sorted by
//! name, depth-first. The returned order is the order of the final report.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

/// Extensions accepted without content sniffing.
const EXECUTABLE_EXTENSIONS: &[&str] = &[
    "exe", "dll", "sys", "scr", "com", // Windows
    "elf", "so", "bin", "out", // Linux
    "dylib", "bundle", // macOS
    "apk", "dex", // Android
];

/// Scanner options.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub recursive: bool,
    pub max_files: Option<usize>,
    /// Inputs larger than this are classified out.
    pub max_input_bytes: u64,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            recursive: true,
            max_files: None,
            max_input_bytes: 50 * 1024 * 1024,
        }
    }
}

/// Collect executable candidates under `root` in deterministic discovery
/// order. Unreadable entries are logged and skipped, never fatal.
pub fn scan_directory(root: &Path, options: &ScanOptions) -> std::io::Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    let mut scanned = 0usize;
    walk(root, options, 0, &mut found, &mut scanned)?;
    info!(
        root = %root.display(),
        scanned,
        candidates = found.len(),
        "directory scan complete"
    );
    Ok(found)
}

fn walk(
    dir: &Path,
    options: &ScanOptions,
    depth: usize,
    found: &mut Vec<PathBuf>,
    scanned: &mut usize,
) -> std::io::Result<()> {
    let mut entries: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| match entry {
            Ok(e) => Some(e.path()),
            Err(err) => {
                warn!(dir = %dir.display(), error = %err, "unreadable directory entry");
                None
            }
        })
        .collect();
    entries.sort();

    for path in entries {
        if let Some(cap) = options.max_files {
            if found.len() >= cap {
                debug!(cap, "candidate cap reached");
                return Ok(());
            }
        }
        if path.is_dir() {
            // Never descend through a directory symlink; a cycle would
            // re-walk the same tree and duplicate candidates.
            let via_symlink = fs::symlink_metadata(&path)
                .map(|meta| meta.file_type().is_symlink())
                .unwrap_or(true);
            if options.recursive && !via_symlink {
                walk(&path, options, depth + 1, found, scanned)?;
            }
            continue;
        }
        *scanned += 1;
        match classify(&path, options.max_input_bytes) {
            Classification::Executable => found.push(path),
            Classification::TooLarge => {
                warn!(file = %path.display(), "input exceeds size cap; dropped");
            }
            Classification::NotExecutable => {
                debug!(file = %path.display(), "not an executable; dropped");
            }
        }
    }
    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
enum Classification {
    Executable,
    NotExecutable,
    TooLarge,
}

fn classify(path: &Path, max_input_bytes: u64) -> Classification {
    match fs::metadata(path) {
        Ok(meta) if meta.len() > max_input_bytes => return Classification::TooLarge,
        Ok(_) => {}
        Err(_) => return Classification::NotExecutable,
    }

    let by_extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            EXECUTABLE_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false);
    if by_extension {
        return Classification::Executable;
    }

    // Content sniffing replaces libmagic: PE, ELF, Mach-O, shebang scripts.
    if sniff_executable(path) {
        Classification::Executable
    } else {
        Classification::NotExecutable
    }
}

fn sniff_executable(path: &Path) -> bool {
    let Ok(bytes) = read_prefix(path, 4) else {
        return false;
    };
    match bytes.as_slice() {
        [0x4d, 0x5a, ..] => true,                   // MZ
        [0x7f, 0x45, 0x4c, 0x46] => true,           // \x7fELF
        [0xfe, 0xed, 0xfa, 0xce | 0xcf] => true,    // Mach-O 32/64 BE
        [0xcf | 0xce, 0xfa, 0xed, 0xfe] => true,    // Mach-O LE
        [0x23, 0x21, ..] => true,                   // #! script
        _ => false,
    }
}

fn read_prefix(path: &Path, len: usize) -> std::io::Result<Vec<u8>> {
    use std::io::Read;
    let mut file = fs::File::open(path)?;
    let mut buf = vec![0u8; len];
    let n = file.read(&mut buf)?;
    buf.truncate(n);
    Ok(buf)
}
