//! Materializes the writable runtime tree the backend executes from.
//!
//! Provisioning is idempotent: files are overwritten in place, directories
//! are merged, and launcher shims are only written where nothing exists yet.

use serde_json::json;
use std::ffi::OsStr;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

use crate::config::RuntimeLayout;
use crate::error::ProvisionError;
use crate::startup_log::StartupLog;

const EXECUTABLE_MODE: u32 = 0o755;

/// Build or refresh `runtime_root` from `source_root`.
///
/// Everything the backend needs is a hard requirement; files listed in
/// [`RuntimeLayout::optional_files`] are skipped with a warning on failure.
pub fn provision(
    source_root: &Path,
    runtime_root: &Path,
    layout: &RuntimeLayout,
    log: &StartupLog,
) -> Result<PathBuf, ProvisionError> {
    create_dir(runtime_root)?;
    for dir in &layout.directories {
        create_dir(&runtime_root.join(dir))?;
    }

    for name in layout.entry_scripts.iter().chain(&layout.assets) {
        let src = source_root.join(name);
        if !src.is_file() {
            continue;
        }
        let dst = runtime_root.join(name);
        copy_file(&src, &dst)?;
        if layout.entry_scripts.contains(name) {
            make_executable(&dst)?;
        }
    }

    for dir in &layout.overlay_dirs {
        copy_dir_overlay(
            &source_root.join(dir),
            &runtime_root.join(dir),
            &layout.denylist,
        )?;
    }

    let serving_dir = runtime_root.join(&layout.serving_dir);
    create_dir(&serving_dir)?;
    for name in &layout.entry_scripts {
        let src = source_root.join(&layout.serving_dir).join(name);
        let dst = serving_dir.join(name);
        if src.is_file() {
            copy_file(&src, &dst)?;
            make_executable(&dst)?;
        } else {
            write_shim_if_missing(&dst, &format!("../{}", name))?;
        }
    }

    for file in &layout.optional_files {
        let src = source_root.join(file);
        if !src.is_file() {
            continue;
        }
        // Non-fatal: optional files are documentation, not needed to serve.
        if let Err(e) = copy_file(&src, &runtime_root.join(file)) {
            log.warn(
                "runtime.optional_copy_skipped",
                json!({ "path": file.display().to_string(), "error": e.to_string() }),
            );
        }
    }

    Ok(runtime_root.to_path_buf())
}

fn create_dir(path: &Path) -> Result<(), ProvisionError> {
    fs::create_dir_all(path).map_err(|source| ProvisionError::CreateDir {
        path: path.to_path_buf(),
        source,
    })
}

/// Copy `src` over `dst`, leaving `dst` owner-writable so the next run can
/// overwrite it even when the installation tree is read-only.
fn copy_file(src: &Path, dst: &Path) -> Result<(), ProvisionError> {
    let copy_err = |source| ProvisionError::Copy {
        from: src.to_path_buf(),
        to: dst.to_path_buf(),
        source,
    };

    if let Some(parent) = dst.parent() {
        create_dir(parent)?;
    }
    if dst.symlink_metadata().is_ok() {
        fs::remove_file(dst).map_err(copy_err)?;
    }
    fs::copy(src, dst).map_err(copy_err)?;

    let mut perms = fs::metadata(dst).map_err(copy_err)?.permissions();
    if perms.mode() & 0o200 == 0 {
        perms.set_mode(perms.mode() | 0o200);
        fs::set_permissions(dst, perms).map_err(copy_err)?;
    }
    Ok(())
}

fn make_executable(path: &Path) -> Result<(), ProvisionError> {
    fs::set_permissions(path, fs::Permissions::from_mode(EXECUTABLE_MODE)).map_err(|source| {
        ProvisionError::Copy {
            from: path.to_path_buf(),
            to: path.to_path_buf(),
            source,
        }
    })
}

fn is_denied(name: &OsStr, denylist: &[String]) -> bool {
    denylist.iter().any(|d| OsStr::new(d) == name)
}

/// Recursively merge `src` into `dst`, overwriting on conflict and skipping
/// any entry whose basename is in `denylist`. A missing `src` is a no-op.
pub fn copy_dir_overlay(src: &Path, dst: &Path, denylist: &[String]) -> Result<(), ProvisionError> {
    if !src.is_dir() {
        debug!("Overlay source {} does not exist, skipping", src.display());
        return Ok(());
    }
    create_dir(dst)?;

    let walker = WalkDir::new(src)
        .min_depth(1)
        .into_iter()
        .filter_entry(|entry| !is_denied(entry.file_name(), denylist));

    for entry in walker {
        let entry = entry.map_err(|source| ProvisionError::Walk {
            path: src.to_path_buf(),
            source,
        })?;
        let Ok(relative) = entry.path().strip_prefix(src) else {
            continue;
        };
        let target = dst.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            create_dir(&target)?;
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &target)?;
        } else {
            copy_file(entry.path(), &target)?;
        }
    }
    Ok(())
}

fn copy_symlink(src: &Path, dst: &Path) -> Result<(), ProvisionError> {
    let link_err = |source| ProvisionError::Copy {
        from: src.to_path_buf(),
        to: dst.to_path_buf(),
        source,
    };
    let link_target = fs::read_link(src).map_err(link_err)?;
    if dst.symlink_metadata().is_ok() {
        fs::remove_file(dst).map_err(link_err)?;
    }
    std::os::unix::fs::symlink(link_target, dst).map_err(link_err)
}

fn shim_script(relative_target: &str) -> String {
    format!(
        r#"#!/usr/bin/perl
use strict;
use warnings;
use FindBin qw($Bin);
my $target = "$Bin/{relative_target}";
chdir "$Bin/.." or die "chdir failed: $!";
exec '/usr/bin/perl', $target or die "exec failed: $!";
"#
    )
}

/// Write an executable launcher at `path` that runs the script at
/// `relative_target` from the serving root. An existing file is left alone.
pub fn write_shim_if_missing(path: &Path, relative_target: &str) -> Result<(), ProvisionError> {
    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(EXECUTABLE_MODE)
        .open(path);

    let mut file = match file {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            debug!("Keeping existing {}", path.display());
            return Ok(());
        }
        Err(source) => {
            return Err(ProvisionError::Shim {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    debug!("Writing launcher shim {} -> {}", path.display(), relative_target);
    file.write_all(shim_script(relative_target).as_bytes())
        .map_err(|source| ProvisionError::Shim {
            path: path.to_path_buf(),
            source,
        })
}
