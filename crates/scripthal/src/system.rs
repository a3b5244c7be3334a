//! Resource introspection, watchdog, power and timing primitives
//!
//! Stateless synchronous entry points. Every query and control operation
//! reports failure through [`HalError`] rather than returning zero.

use crate::HalError;
use nix::sys::reboot::{RebootMode, reboot};
use scripthal_config::SystemPaths;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::process::Command;
use std::time::Duration;

/// Host facilities behind the stateless entry points
pub trait SystemControl {
    /// Current free heap in bytes. A snapshot, not a reservation.
    fn heap_free_bytes(&self) -> Result<u64, HalError>;

    /// Bytes consumed on the filesystem
    fn fs_usage_bytes(&self) -> Result<u64, HalError>;

    /// Reset the hardware watchdog countdown
    fn feed_watchdog(&mut self) -> Result<(), HalError>;

    /// Restart the device. On real hardware a successful call does not
    /// return; callers must flush anything they care about beforehand.
    fn restart_system(&mut self) -> Result<(), HalError>;

    /// Block the calling thread for at least `duration_us` microseconds.
    ///
    /// On a cooperative engine this stalls every pending timer and callback.
    fn sleep_microseconds(&self, duration_us: u64) {
        std::thread::sleep(Duration::from_micros(duration_us));
    }
}

/// Linux backend using procfs, statvfs, the watchdog character device and
/// reboot(2)
pub struct LinuxSystem {
    paths: SystemPaths,
    watchdog: Option<File>,
}

impl LinuxSystem {
    pub fn new(paths: SystemPaths) -> Self {
        Self {
            paths,
            watchdog: None,
        }
    }

    /// Stop the watchdog with the magic close character.
    ///
    /// Drivers built with `nowayout` ignore this and keep counting.
    pub fn disarm_watchdog(&mut self) -> Result<(), HalError> {
        if let Some(mut file) = self.watchdog.take() {
            file.write_all(b"V")?;
            tracing::info!("Watchdog disarmed");
        }
        Ok(())
    }

    fn meminfo_available(&self) -> Option<u64> {
        let contents = fs::read_to_string(&self.paths.meminfo_path).ok()?;
        parse_meminfo_available(&contents)
    }

    fn sysinfo_free() -> Result<u64, HalError> {
        let mut info: libc::sysinfo = unsafe { std::mem::zeroed() };
        let result = unsafe { libc::sysinfo(&mut info) };
        if result == 0 {
            Ok(info.freeram as u64 * info.mem_unit as u64)
        } else {
            Err(HalError::Io(std::io::Error::last_os_error()))
        }
    }
}

impl SystemControl for LinuxSystem {
    fn heap_free_bytes(&self) -> Result<u64, HalError> {
        match self.meminfo_available() {
            Some(bytes) => Ok(bytes),
            None => {
                tracing::debug!(
                    "{} unreadable, falling back to sysinfo(2)",
                    self.paths.meminfo_path.display()
                );
                Self::sysinfo_free()
            }
        }
    }

    fn fs_usage_bytes(&self) -> Result<u64, HalError> {
        let stat = nix::sys::statvfs::statvfs(&self.paths.fs_root)?;
        let used_blocks = (stat.blocks() as u64).saturating_sub(stat.blocks_free() as u64);
        Ok(used_blocks * stat.fragment_size() as u64)
    }

    fn feed_watchdog(&mut self) -> Result<(), HalError> {
        if self.watchdog.is_none() {
            // Opening the device arms the watchdog
            let file = OpenOptions::new()
                .write(true)
                .open(&self.paths.watchdog_device)?;
            tracing::info!("Watchdog armed at {}", self.paths.watchdog_device.display());
            self.watchdog = Some(file);
        }

        if let Some(file) = self.watchdog.as_mut() {
            file.write_all(b"\0")?;
        }
        Ok(())
    }

    fn restart_system(&mut self) -> Result<(), HalError> {
        tracing::info!("Restarting system...");

        match reboot(RebootMode::RB_AUTOBOOT) {
            Ok(never) => match never {},
            Err(errno) => {
                tracing::warn!("reboot(2) failed ({}), trying reboot command", errno);
                let status = Command::new("reboot").status()?;
                if status.success() {
                    Ok(())
                } else {
                    Err(HalError::RestartFailed(format!("reboot exited with {}", status)))
                }
            }
        }
    }
}

/// Free memory in bytes from `/proc/meminfo` contents.
///
/// Prefers `MemAvailable` and falls back to `MemFree` on kernels that
/// predate it.
pub(crate) fn parse_meminfo_available(contents: &str) -> Option<u64> {
    let field = |name: &str| {
        contents.lines().find_map(|line| {
            let rest = line.strip_prefix(name)?.strip_prefix(':')?;
            let kb: u64 = rest.trim().trim_end_matches("kB").trim().parse().ok()?;
            Some(kb * 1024)
        })
    };

    field("MemAvailable").or_else(|| field("MemFree"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    const MEMINFO: &str = "MemTotal:        8048212 kB\n\
                           MemFree:          512000 kB\n\
                           MemAvailable:    4096000 kB\n\
                           Buffers:          100000 kB\n";

    #[test]
    fn test_parse_mem_available() {
        assert_eq!(parse_meminfo_available(MEMINFO), Some(4096000 * 1024));
    }

    #[test]
    fn test_parse_falls_back_to_mem_free() {
        let old_kernel = "MemTotal: 1000 kB\nMemFree: 250 kB\n";
        assert_eq!(parse_meminfo_available(old_kernel), Some(250 * 1024));
        assert_eq!(parse_meminfo_available("garbage"), None);
    }

    #[test]
    fn test_heap_free_reads_configured_meminfo() {
        let dir = tempfile::tempdir().unwrap();
        let meminfo = dir.path().join("meminfo");
        fs::write(&meminfo, MEMINFO).unwrap();

        let system = LinuxSystem::new(SystemPaths {
            meminfo_path: meminfo,
            ..Default::default()
        });
        assert_eq!(system.heap_free_bytes().unwrap(), 4096000 * 1024);
    }

    #[test]
    fn test_fs_usage_on_temp_dir() {
        let dir = tempfile::tempdir().unwrap();
        let system = LinuxSystem::new(SystemPaths {
            fs_root: dir.path().to_path_buf(),
            ..Default::default()
        });
        assert!(system.fs_usage_bytes().is_ok());
    }

    #[test]
    fn test_fs_usage_missing_root_is_an_error() {
        let system = LinuxSystem::new(SystemPaths {
            fs_root: PathBuf::from("/nonexistent/scripthal/root"),
            ..Default::default()
        });
        assert!(system.fs_usage_bytes().is_err());
    }

    #[test]
    fn test_watchdog_feed_writes_keepalive() {
        let dir = tempfile::tempdir().unwrap();
        let device = dir.path().join("watchdog");
        fs::write(&device, b"").unwrap();

        let mut system = LinuxSystem::new(SystemPaths {
            watchdog_device: device.clone(),
            ..Default::default()
        });
        system.feed_watchdog().unwrap();
        system.feed_watchdog().unwrap();
        system.disarm_watchdog().unwrap();

        assert_eq!(fs::read(&device).unwrap(), b"\0\0V");
    }

    #[test]
    fn test_watchdog_missing_device_is_an_error() {
        let mut system = LinuxSystem::new(SystemPaths {
            watchdog_device: PathBuf::from("/nonexistent/watchdog"),
            ..Default::default()
        });
        assert!(matches!(system.feed_watchdog(), Err(HalError::Io(_))));
    }
}
