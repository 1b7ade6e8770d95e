//! Spawned helper processes (§4.N, §6, §9). Every helper is invoked with an
//! explicit argv vector, never through a shell. A non-zero exit status is
//! logged as a warning and returned to the caller rather than surfaced as a
//! hard error — operations built on top of these helpers decide for
//! themselves whether the failure is fatal (e.g. an `e2fsck` failure still
//! proceeds to the mount attempt).

use std::ffi::OsStr;
use std::path::Path;
use std::process::{Command, ExitStatus};

use crate::error::{Result, SupervisorError};

fn run(program: &str, args: &[&OsStr]) -> Result<ExitStatus> {
    log::debug!("spawning {program} {args:?}");
    let status = Command::new(program).args(args).status()?;
    if !status.success() {
        log::warn!(
            "helper {program} exited with status {:?}",
            status.code().unwrap_or(-1)
        );
    }
    Ok(status)
}

fn require_success(program: &str, status: ExitStatus) -> Result<()> {
    if status.success() {
        Ok(())
    } else {
        Err(SupervisorError::Helper {
            program: program.to_string(),
            status: status.code().unwrap_or(-1),
        })
    }
}

/// `dd if=/dev/zero of=FILE bs=512 count=N` — creates a sparse-ish raw image.
pub fn dd_create_image(path: &Path, count_512b_blocks: u64) -> Result<ExitStatus> {
    run(
        "/system/bin/dd",
        &[
            OsStr::new("if=/dev/zero"),
            OsStr::new(&format!("of={}", path.display())),
            OsStr::new("bs=512"),
            OsStr::new(&format!("count={count_512b_blocks}")),
        ],
    )
}

/// `losetup [-r] DEV FILE`
pub fn losetup_attach(loop_dev: &Path, file: &Path, read_only: bool) -> Result<ExitStatus> {
    let mut args: Vec<&OsStr> = Vec::new();
    if read_only {
        args.push(OsStr::new("-r"));
    }
    args.push(loop_dev.as_os_str());
    args.push(file.as_os_str());
    run("/system/bin/losetup", &args)
}

/// `e2fsck -y DEV` (or `-fy` when the caller knows the device isn't mounted).
pub fn e2fsck_check(dev: &Path, force: bool) -> Result<ExitStatus> {
    let flag = if force { "-fy" } else { "-y" };
    run("/system/bin/e2fsck", &[OsStr::new(flag), dev.as_os_str()])
}

/// `mkfs.ext4 PATH`
pub fn mkfs_ext4(path: &Path) -> Result<ExitStatus> {
    run("/system/bin/mkfs.ext4", &[path.as_os_str()])
}

/// `sed -i EXPR FILE`
pub fn sed_inplace(expr: &str, file: &Path) -> Result<ExitStatus> {
    run(
        "/system/bin/sed",
        &[OsStr::new("-i"), OsStr::new(expr), file.as_os_str()],
    )
}

/// `cp [-R] [-f] SRC DST`
pub fn cp_path(src: &Path, dst: &Path, recursive: bool, force: bool) -> Result<ExitStatus> {
    let mut args: Vec<&OsStr> = Vec::new();
    if recursive {
        args.push(OsStr::new("-R"));
    }
    if force {
        args.push(OsStr::new("-f"));
    }
    args.push(src.as_os_str());
    args.push(dst.as_os_str());
    run("/system/bin/cp", &args)
}

/// `chmod [-R] MODE PATH`
pub fn chmod_path(mode: &str, path: &Path, recursive: bool) -> Result<ExitStatus> {
    let mut args: Vec<&OsStr> = Vec::new();
    if recursive {
        args.push(OsStr::new("-R"));
    }
    args.push(OsStr::new(mode));
    args.push(path.as_os_str());
    run("/system/bin/chmod", &args)
}

/// Recursively removes the *contents* of `dir`, leaving `dir` itself intact.
/// The original implementation shelled out to `sh -c 'rm -Rf DIR/*'`; per the
/// "never pass user input through a shell" guidance this walks the directory
/// in-process instead.
pub fn purge_directory_contents(dir: &Path) -> Result<()> {
    log::info!("purging contents of {}", dir.display());
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err.into()),
    };

    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            std::fs::remove_dir_all(&path)?;
        } else {
            std::fs::remove_file(&path)?;
        }
    }
    Ok(())
}

/// Wraps an already-run status with the "fatal to the caller" policy, for the
/// handful of call sites where a helper's success genuinely gates the next
/// step (e.g. `mkfs.ext4` failing means there is no filesystem to mount).
pub fn require(program: &str, status: ExitStatus) -> Result<()> {
    require_success(program, status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn purge_removes_contents_but_not_dir() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.img"), b"data").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/b.img"), b"data").unwrap();

        purge_directory_contents(dir.path()).unwrap();

        assert!(dir.path().exists());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn purge_missing_directory_is_a_noop() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("does-not-exist");
        purge_directory_contents(&missing).unwrap();
    }

    #[test]
    fn require_success_maps_nonzero_exit_to_helper_error() {
        let status = Command::new("/bin/false").status().unwrap();
        let err = require("/bin/false", status).unwrap_err();
        assert!(matches!(err, SupervisorError::Helper { .. }));
    }
}
