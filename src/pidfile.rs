//! Single-instance enforcement through a pid file.

use std::fs;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum PidfileError {
    #[error("another instance is running with pid {0}")]
    AlreadyRunning(u32),
    #[error("can't access pid file: {0}")]
    Io(#[from] std::io::Error),
}

/// Claims the pid file. A file left behind by a dead process is replaced;
/// a live owner aborts startup.
pub fn acquire(path: &Path) -> Result<(), PidfileError> {
    if let Ok(content) = fs::read_to_string(path) {
        if let Ok(pid) = content.trim().parse::<u32>() {
            if pid != std::process::id() && Path::new(&format!("/proc/{}", pid)).exists() {
                return Err(PidfileError::AlreadyRunning(pid));
            }
            log::warn!("removing stale pid file of dead process {}", pid);
        }
    }
    fs::write(path, format!("{}\n", std::process::id()))?;
    Ok(())
}

/// Removes the pid file on shutdown.
pub fn release(path: &Path) {
    if let Err(err) = fs::remove_file(path) {
        log::warn!("can't remove pid file {}: {}", path.display(), err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn scratch(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("canbridge-{}-{}.pid", name, std::process::id()))
    }

    #[test]
    fn acquire_writes_our_pid() {
        let path = scratch("acquire");
        acquire(&path).unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.trim(), std::process::id().to_string());
        release(&path);
        assert!(!path.exists());
    }

    #[test]
    fn stale_files_are_replaced() {
        let path = scratch("stale");
        // pids are capped well below this, so the owner cannot exist
        fs::write(&path, "1073741824\n").unwrap();
        acquire(&path).unwrap();
        assert_eq!(
            fs::read_to_string(&path).unwrap().trim(),
            std::process::id().to_string()
        );
        release(&path);
    }

    #[test]
    fn live_owner_blocks_startup() {
        let path = scratch("live");
        // pid 1 always exists
        fs::write(&path, "1\n").unwrap();
        assert!(matches!(
            acquire(&path),
            Err(PidfileError::AlreadyRunning(1))
        ));
        fs::remove_file(&path).unwrap();
    }
}
