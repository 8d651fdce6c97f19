use std::fs::{File, OpenOptions};
use std::path::Path;

use anyhow::{Context, Result};

/// Open (creating if needed) `<logs_dir>/<file_name>` in append mode, 0644,
/// creating the `logs/` parent with 0755 if missing. Used both for the
/// gateway's own `plugin-proxy.log` and for each supervised service's
/// `<name>.log` capture file.
pub fn open_log_file(logs_dir: &Path, file_name: &str) -> Result<File> {
    std::fs::create_dir_all(logs_dir)
        .with_context(|| format!("failed to create logs directory: {}", logs_dir.display()))?;
    set_dir_mode(logs_dir, 0o755);

    let path = logs_dir.join(file_name);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to create log file: {}", path.display()))?;
    set_file_mode(&path, 0o644);
    Ok(file)
}

#[cfg(unix)]
fn set_dir_mode(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(meta) = std::fs::metadata(path) {
        let mut perms = meta.permissions();
        perms.set_mode(mode);
        let _ = std::fs::set_permissions(path, perms);
    }
}

#[cfg(not(unix))]
fn set_dir_mode(_path: &Path, _mode: u32) {}

#[cfg(unix)]
fn set_file_mode(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(meta) = std::fs::metadata(path) {
        let mut perms = meta.permissions();
        perms.set_mode(mode);
        let _ = std::fs::set_permissions(path, perms);
    }
}

#[cfg(not(unix))]
fn set_file_mode(_path: &Path, _mode: u32) {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn creates_logs_dir_and_appends() {
        let dir = tempfile::tempdir().unwrap();
        let logs_dir = dir.path().join("logs");

        {
            let mut file = open_log_file(&logs_dir, "svc.log").unwrap();
            use std::io::Write;
            writeln!(file, "first line").unwrap();
        }
        {
            let mut file = open_log_file(&logs_dir, "svc.log").unwrap();
            use std::io::Write;
            writeln!(file, "second line").unwrap();
        }

        let mut contents = String::new();
        File::open(logs_dir.join("svc.log"))
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        assert_eq!(contents, "first line\nsecond line\n");
    }
}
