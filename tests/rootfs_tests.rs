//! Tests for root filesystem extraction: round-trips, permission bits,
//! symlink anchoring, and the healing retry for out-of-order archives.

use flate2::write::GzEncoder;
use flate2::Compression;
use jailrun::rootfs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tar::{Builder, EntryType, Header};
use tempfile::NamedTempFile;

// =============================================================================
// Archive construction helpers
// =============================================================================

fn file_header(path: &str, mode: u32, size: usize) -> Header {
    let mut header = Header::new_ustar();
    header.set_path(path).unwrap();
    header.set_mode(mode);
    header.set_size(size as u64);
    header.set_cksum();
    header
}

fn dir_header(path: &str, mode: u32) -> Header {
    let mut header = Header::new_ustar();
    header.set_path(path).unwrap();
    header.set_mode(mode);
    header.set_entry_type(EntryType::Directory);
    header.set_size(0);
    header.set_cksum();
    header
}

fn add_symlink(builder: &mut Builder<Vec<u8>>, path: &str, target: &str) {
    let mut header = Header::new_ustar();
    header.set_entry_type(EntryType::Symlink);
    header.set_size(0);
    builder.append_link(&mut header, path, target).unwrap();
}

fn write_tar(builder: Builder<Vec<u8>>) -> NamedTempFile {
    let bytes = builder.into_inner().unwrap();
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(&bytes).unwrap();
    file.flush().unwrap();
    file
}

fn sample_tree() -> Builder<Vec<u8>> {
    let mut builder = Builder::new(Vec::new());
    builder
        .append(&dir_header("bin/", 0o755), &[][..])
        .unwrap();
    builder
        .append(&file_header("bin/busybox", 0o755, 4), &b"ELF!"[..])
        .unwrap();
    builder
        .append(
            &file_header("readme.txt", 0o600, 32),
            &b"This archive contains this file."[..],
        )
        .unwrap();
    builder
}

fn mode_of(path: &Path) -> u32 {
    std::fs::metadata(path).unwrap().permissions().mode() & 0o7777
}

// =============================================================================
// Round-trips
// =============================================================================

#[test]
fn extract_round_trips_contents_and_modes() {
    let image = write_tar(sample_tree());
    let root = rootfs::extract(image.path(), false).unwrap();

    let busybox = root.path().join("bin/busybox");
    let readme = root.path().join("readme.txt");

    assert_eq!(std::fs::read(&busybox).unwrap(), b"ELF!");
    assert_eq!(
        std::fs::read(&readme).unwrap(),
        b"This archive contains this file."
    );
    assert_eq!(mode_of(&busybox), 0o755);
    assert_eq!(mode_of(&readme), 0o600);
    assert_eq!(mode_of(&root.path().join("bin")), 0o755);
}

#[test]
fn extract_gzipped_round_trips() {
    let bytes = sample_tree().into_inner().unwrap();
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&bytes).unwrap();
    let mut image = NamedTempFile::new().unwrap();
    image.write_all(&encoder.finish().unwrap()).unwrap();

    let root = rootfs::extract(image.path(), true).unwrap();
    assert_eq!(
        std::fs::read(root.path().join("bin/busybox")).unwrap(),
        b"ELF!"
    );
}

#[test]
fn extract_is_idempotent_modulo_root_name() {
    let image = write_tar(sample_tree());
    let first = rootfs::extract(image.path(), false).unwrap();
    let second = rootfs::extract(image.path(), false).unwrap();

    assert_ne!(first.path(), second.path());
    for rel in ["bin/busybox", "readme.txt"] {
        assert_eq!(
            std::fs::read(first.path().join(rel)).unwrap(),
            std::fs::read(second.path().join(rel)).unwrap(),
            "trees must match for {rel}"
        );
    }
}

#[test]
fn extracted_root_is_removed_on_drop() {
    let image = write_tar(sample_tree());
    let root = rootfs::extract(image.path(), false).unwrap();
    let path = root.path().to_path_buf();
    assert!(path.exists());
    drop(root);
    assert!(!path.exists(), "temp root must be removed on drop");
}

// =============================================================================
// Symlinks
// =============================================================================

#[test]
fn absolute_symlink_target_stays_inside_root() {
    let mut builder = sample_tree();
    builder
        .append(&dir_header("etc/", 0o755), &[][..])
        .unwrap();
    add_symlink(&mut builder, "etc/shell", "/bin/busybox");
    let image = write_tar(builder);

    let root = rootfs::extract(image.path(), false).unwrap();
    let link = root.path().join("etc/shell");

    let target = std::fs::read_link(&link).unwrap();
    assert!(
        !target.is_absolute(),
        "absolute targets must be rewritten relative, got {}",
        target.display()
    );

    let resolved = std::fs::canonicalize(&link).unwrap();
    let canonical_root = std::fs::canonicalize(root.path()).unwrap();
    assert!(
        resolved.starts_with(&canonical_root),
        "{} escapes {}",
        resolved.display(),
        canonical_root.display()
    );
    assert_eq!(std::fs::read(&link).unwrap(), b"ELF!");
}

#[test]
fn relative_symlink_target_is_kept_verbatim() {
    let mut builder = sample_tree();
    add_symlink(&mut builder, "bin/sh", "busybox");
    let image = write_tar(builder);

    let root = rootfs::extract(image.path(), false).unwrap();
    let target = std::fs::read_link(root.path().join("bin/sh")).unwrap();
    assert_eq!(target, Path::new("busybox"));
}

#[test]
fn symlink_listed_before_parent_directory_is_healed() {
    let mut builder = Builder::new(Vec::new());
    add_symlink(&mut builder, "usr/bin/sh", "busybox");
    builder
        .append(&dir_header("usr/bin/", 0o755), &[][..])
        .unwrap();
    builder
        .append(&file_header("usr/bin/busybox", 0o755, 4), &b"ELF!"[..])
        .unwrap();
    let image = write_tar(builder);

    let root = rootfs::extract(image.path(), false).unwrap();
    let target = std::fs::read_link(root.path().join("usr/bin/sh")).unwrap();
    assert_eq!(target, Path::new("busybox"));
}

#[test]
fn duplicate_symlink_entries_are_tolerated() {
    let mut builder = sample_tree();
    add_symlink(&mut builder, "bin/sh", "busybox");
    add_symlink(&mut builder, "bin/sh", "busybox");
    let image = write_tar(builder);

    assert!(rootfs::extract(image.path(), false).is_ok());
}

// =============================================================================
// Rejected entries
// =============================================================================

#[test]
fn unsupported_entry_type_fails_with_type_flag() {
    let mut builder = sample_tree();
    let mut header = Header::new_ustar();
    header.set_path("dev/initctl").unwrap();
    header.set_entry_type(EntryType::Fifo);
    header.set_mode(0o600);
    header.set_size(0);
    header.set_cksum();
    builder.append(&header, &[][..]).unwrap();
    let image = write_tar(builder);

    let err = rootfs::extract(image.path(), false).unwrap_err();
    let message = err.to_string();
    assert!(
        message.contains("Unknown type flag") && message.contains("dev/initctl"),
        "unexpected error: {message}"
    );
}
