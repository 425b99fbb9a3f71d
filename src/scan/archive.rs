use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use anyhow::{Context, Result, bail};
use tracing::{debug, warn};

/// True if `path` names a tar archive by extension.
pub fn looks_like_archive(path: &str) -> bool {
    let p = Path::new(path);
    matches!(
        p.extension().and_then(|e| e.to_str()),
        Some("tar" | "gz" | "tgz")
    ) || path.ends_with(".tar.gz")
}

/// Extracts an in-memory tar (optionally gzipped) into `dest`.
pub fn extract_bytes(data: &[u8], dest: &Path) -> Result<usize> {
    extract_reader(data, dest)
}

/// Extracts a tar (optionally gzipped) file into `dest`.
pub fn extract_file(path: &Path, dest: &Path) -> Result<usize> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    extract_reader(BufReader::new(file), dest)
}

/// Detects gzip by its magic bytes, then unpacks.
fn extract_reader<R: BufRead>(mut reader: R, dest: &Path) -> Result<usize> {
    let is_gzip = {
        let head = reader.fill_buf().context("Failed to read archive")?;
        head.len() >= 2 && head[0] == 0x1f && head[1] == 0x8b
    };

    if is_gzip {
        unpack(flate2::read::GzDecoder::new(reader), dest)
    } else {
        unpack(reader, dest)
    }
}

/// Unpacks every entry under `dest`. Entries that would land outside `dest`
/// are skipped.
fn unpack<R: Read>(reader: R, dest: &Path) -> Result<usize> {
    let mut archive = tar::Archive::new(reader);
    let mut extracted = 0usize;

    for entry_result in archive.entries().context("Failed to read tar entries")? {
        let mut entry = entry_result.context("Failed to read tar entry")?;
        let entry_path = entry.path()?.to_path_buf();

        let unpacked = entry
            .unpack_in(dest)
            .with_context(|| format!("Failed to extract {}", entry_path.display()))?;
        if unpacked {
            extracted += 1;
        } else {
            warn!(path = %entry_path.display(), "Skipping archive entry outside the context root");
        }
    }

    if extracted == 0 {
        bail!("archive contains no extractable entries");
    }

    debug!(entries = extracted, dest = %dest.display(), "Extracted archive");
    Ok(extracted)
}
