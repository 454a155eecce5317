// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Deployment package helpers: content digests and zip extraction.

use std::io::Cursor;
use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha2::{Digest, Sha256};

use crate::error::{NimbusError, NimbusResult};

/// Base64-encoded SHA-256 of a deployment package, as reported by `CodeSha256`.
pub fn digest(bytes: &[u8]) -> String {
    STANDARD.encode(Sha256::digest(bytes))
}

/// Unpack an in-memory zip archive into `dest`, creating it if needed.
pub fn unpack(bytes: &[u8], dest: &Path) -> NimbusResult<()> {
    std::fs::create_dir_all(dest)
        .map_err(|e| NimbusError::io(format!("creating {}", dest.display()), e))?;

    let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).map_err(|e| NimbusError::Archive {
        context: format!("reading archive for {}", dest.display()),
        reason: e.to_string(),
    })?;

    tracing::debug!(dest = %dest.display(), entries = archive.len(), "Unpacking archive");

    // `extract` rejects entries that would escape `dest`.
    archive.extract(dest).map_err(|e| NimbusError::Archive {
        context: format!("extracting into {}", dest.display()),
        reason: e.to_string(),
    })
}

/// Unpack a zip archive stored on disk into `dest`.
pub fn unpack_file(archive: &Path, dest: &Path) -> NimbusResult<()> {
    let bytes = std::fs::read(archive)
        .map_err(|e| NimbusError::io(format!("reading {}", archive.display()), e))?;
    unpack(&bytes, dest)
}

#[cfg(test)]
pub(crate) fn zip_of(files: &[(&str, &str)]) -> Vec<u8> {
    use std::io::Write;

    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (name, content) in files {
        writer
            .start_file(*name, zip::write::SimpleFileOptions::default())
            .unwrap();
        writer.write_all(content.as_bytes()).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_is_base64_sha256() {
        // sha256("") = e3b0c442...
        assert_eq!(digest(b""), "47DEQpj8HBSa+/TImW+5JCeuQeRkm5NMpJWZG3hSuFU=");
        assert_ne!(digest(b"a"), digest(b"b"));
    }

    #[test]
    fn test_unpack_writes_files() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("content");
        let bytes = zip_of(&[("handler.py", "def handler(e, c): pass"), ("lib/util.py", "")]);

        unpack(&bytes, &dest).unwrap();

        assert!(dest.join("handler.py").is_file());
        assert!(dest.join("lib/util.py").is_file());
    }

    #[test]
    fn test_unpack_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let result = unpack(b"not a zip", dir.path());
        assert!(matches!(result, Err(NimbusError::Archive { .. })));
    }
}
