//! C9 — OVA packaging.
//!
//! Bundles a completed OVF export directory (descriptor, manifest, disk
//! images) into a single `.ova` tar archive, optionally gzip-compressed.

use std::fs::File;
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum PackageError {
    #[error("package I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("OVF descriptor not found in {0}")]
    MissingDescriptor(PathBuf),
    #[error("archive member {0} escapes the package root")]
    UnsafeMember(String),
}

/// Build a `.ova` archive from `source_dir`, ordering the `.ovf` descriptor
/// first (the OVA spec requires it to precede the disks it references).
/// `compression_level` is only consulted when `gzip` is true.
pub fn build_ova(
    source_dir: &Path,
    output_path: &Path,
    gzip: bool,
    compression_level: u32,
) -> Result<(), PackageError> {
    let entries = ordered_members(source_dir)?;
    let out_file = File::create(output_path).map_err(|e| PackageError::Io {
        path: output_path.to_path_buf(),
        source: e,
    })?;

    if gzip {
        let encoder = GzEncoder::new(out_file, Compression::new(compression_level));
        let mut builder = tar::Builder::new(encoder);
        append_members(&mut builder, source_dir, &entries)?;
        let encoder = builder.into_inner().map_err(|e| PackageError::Io {
            path: output_path.to_path_buf(),
            source: e,
        })?;
        encoder.finish().map_err(|e| PackageError::Io {
            path: output_path.to_path_buf(),
            source: e,
        })?;
    } else {
        let mut builder = tar::Builder::new(out_file);
        append_members(&mut builder, source_dir, &entries)?;
        builder.finish().map_err(|e| PackageError::Io {
            path: output_path.to_path_buf(),
            source: e,
        })?;
    }

    info!(
        output = ?output_path,
        members = entries.len(),
        gzip,
        "packaged OVA"
    );
    Ok(())
}

/// Descriptor (`.ovf`) first, then everything else in directory order.
fn ordered_members(source_dir: &Path) -> Result<Vec<PathBuf>, PackageError> {
    let mut descriptor = None;
    let mut rest = Vec::new();

    let read_dir = std::fs::read_dir(source_dir).map_err(|e| PackageError::Io {
        path: source_dir.to_path_buf(),
        source: e,
    })?;

    for entry in read_dir {
        let entry = entry.map_err(|e| PackageError::Io {
            path: source_dir.to_path_buf(),
            source: e,
        })?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        if path
            .file_name()
            .is_some_and(|n| is_checkpoint_artifact(&n.to_string_lossy()))
        {
            continue;
        }
        if path.extension().is_some_and(|e| e == "ovf") {
            descriptor = Some(path);
        } else {
            rest.push(path);
        }
    }

    let descriptor = descriptor.ok_or_else(|| PackageError::MissingDescriptor(source_dir.to_path_buf()))?;
    rest.sort();
    let mut ordered = vec![descriptor];
    ordered.extend(rest);
    Ok(ordered)
}

/// True for the resumable-transfer checkpoint file and its `.backup`/`.tmp`
/// siblings (see `checkpoint::CheckpointStore`) — never real export output,
/// so they must never end up as archive members.
fn is_checkpoint_artifact(file_name: &str) -> bool {
    file_name.starts_with(".checkpoint-")
}

fn append_members<W: std::io::Write>(
    builder: &mut tar::Builder<W>,
    source_dir: &Path,
    entries: &[PathBuf],
) -> Result<(), PackageError> {
    for path in entries {
        let name = path
            .file_name()
            .expect("directory listing always yields a file name")
            .to_string_lossy()
            .into_owned();
        debug!(member = %name, "appending OVA member");
        builder
            .append_path_with_name(path, &name)
            .map_err(|e| PackageError::Io {
                path: path.clone(),
                source: e,
            })?;
    }
    Ok(())
}

/// Verify an `.ova` archive: it must contain exactly one `.ovf` descriptor
/// and every member path must stay within the archive root (no `..`
/// traversal or absolute paths), defending a later unpack step.
pub fn validate_ova(path: &Path) -> Result<(), PackageError> {
    let file = File::open(path).map_err(|e| PackageError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;

    let mut archive = if path.extension().is_some_and(|e| e == "gz") {
        tar::Archive::new(Box::new(flate2::read::GzDecoder::new(file)) as Box<dyn std::io::Read>)
    } else {
        tar::Archive::new(Box::new(file) as Box<dyn std::io::Read>)
    };

    let mut first_is_descriptor = false;
    let mut has_vmdk = false;
    for (index, entry) in archive
        .entries()
        .map_err(|e| PackageError::Io {
            path: path.to_path_buf(),
            source: e,
        })?
        .enumerate()
    {
        let entry = entry.map_err(|e| PackageError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let entry_path = entry.path().map_err(|e| PackageError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let name = entry_path.to_string_lossy().into_owned();
        if name.contains("..") || entry_path.is_absolute() {
            return Err(PackageError::UnsafeMember(name));
        }
        if index == 0 && entry_path.extension().is_some_and(|e| e == "ovf") {
            first_is_descriptor = true;
        }
        if entry_path.extension().is_some_and(|e| e == "vmdk") {
            has_vmdk = true;
        }
    }

    if !first_is_descriptor || !has_vmdk {
        return Err(PackageError::MissingDescriptor(path.to_path_buf()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write(dir: &Path, name: &str, content: &[u8]) {
        std::fs::write(dir.join(name), content).unwrap();
    }

    #[test]
    fn builds_and_validates_uncompressed_ova() {
        let src = tempdir().unwrap();
        write(src.path(), "demo.ovf", b"<Envelope/>");
        write(src.path(), "demo-disk0.vmdk", b"disk bytes");

        let out = tempdir().unwrap().path().join("demo.ova");
        build_ova(src.path(), &out, false, 6).unwrap();

        validate_ova(&out).unwrap();
    }

    #[test]
    fn builds_and_validates_gzip_ova() {
        let src = tempdir().unwrap();
        write(src.path(), "demo.ovf", b"<Envelope/>");
        write(src.path(), "demo-disk0.vmdk", b"disk bytes");

        let out = tempdir().unwrap().path().join("demo.ova.gz");
        build_ova(src.path(), &out, true, 6).unwrap();

        validate_ova(&out).unwrap();
    }

    #[test]
    fn rejects_directory_with_no_descriptor() {
        let src = tempdir().unwrap();
        write(src.path(), "demo-disk0.vmdk", b"disk bytes");
        let out = tempdir().unwrap().path().join("demo.ova");
        let err = build_ova(src.path(), &out, false, 6).unwrap_err();
        assert!(matches!(err, PackageError::MissingDescriptor(_)));
    }

    #[test]
    fn excludes_checkpoint_artifacts_from_the_archive() {
        let src = tempdir().unwrap();
        write(src.path(), "demo.ovf", b"<Envelope/>");
        write(src.path(), "demo-disk0.vmdk", b"disk bytes");
        write(src.path(), ".checkpoint-demo.json", b"{}");
        write(src.path(), ".checkpoint-demo.json.backup", b"{}");

        let out = tempdir().unwrap().path().join("demo.ova");
        build_ova(src.path(), &out, false, 6).unwrap();

        let file = File::open(&out).unwrap();
        let mut archive = tar::Archive::new(file);
        for entry in archive.entries().unwrap() {
            let entry = entry.unwrap();
            let name = entry.path().unwrap().to_string_lossy().into_owned();
            assert!(!name.contains("checkpoint"), "unexpected member {name}");
        }
    }

    #[test]
    fn descriptor_is_first_member() {
        let src = tempdir().unwrap();
        write(src.path(), "z-disk.vmdk", b"z");
        write(src.path(), "a-disk.vmdk", b"a");
        write(src.path(), "demo.ovf", b"<Envelope/>");

        let out = tempdir().unwrap().path().join("demo.ova");
        build_ova(src.path(), &out, false, 6).unwrap();

        let file = File::open(&out).unwrap();
        let mut archive = tar::Archive::new(file);
        let mut entries = archive.entries().unwrap();
        let first = entries.next().unwrap().unwrap();
        assert!(first.path().unwrap().extension().is_some_and(|e| e == "ovf"));
    }
}
