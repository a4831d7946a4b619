//! Process-info provider
//!
//! Serves a closed set of text files generated on read: `uptime`,
//! `version`, `cpuinfo`, `meminfo`. Everything is read-only; stat reports
//! the generated text length.

use std::rc::Rc;

use crate::clock::Clock;
use crate::error::{FsError, FsResult};
use crate::vfs::provider::VirtualProvider;
use crate::vfs::{DirEntry, Metadata};

const PROC_NAMES: &[&str] = &["cpuinfo", "meminfo", "uptime", "version"];

pub struct ProcProvider {
    clock: Rc<dyn Clock>,
}

impl ProcProvider {
    pub fn new(clock: Rc<dyn Clock>) -> Self {
        Self { clock }
    }

    fn render(&self, name: &str) -> Option<String> {
        match name {
            "uptime" => {
                let secs = self.clock.monotonic_ms() as f64 / 1000.0;
                Some(format!("{:.2} {:.2}\n", secs, secs))
            }
            "version" => Some(format!(
                "shellbox version {} (sandbox kernel)\n",
                env!("CARGO_PKG_VERSION")
            )),
            "cpuinfo" => Some(
                "processor\t: 0\n\
                 vendor_id\t: shellbox\n\
                 model name\t: virtual sandbox cpu\n\
                 cpu MHz\t\t: 1000.000\n\
                 cache size\t: 0 KB\n\n"
                    .to_string(),
            ),
            "meminfo" => Some(
                "MemTotal:         262144 kB\n\
                 MemFree:          262144 kB\n\
                 MemAvailable:     262144 kB\n\
                 SwapTotal:             0 kB\n\
                 SwapFree:              0 kB\n"
                    .to_string(),
            ),
            _ => None,
        }
    }
}

impl VirtualProvider for ProcProvider {
    fn read(&self, sub: &str) -> FsResult<Vec<u8>> {
        if sub.is_empty() {
            return Err(FsError::eisdir("/proc"));
        }
        self.render(sub)
            .map(String::into_bytes)
            .ok_or_else(|| FsError::enoent(format!("/proc/{}", sub)))
    }

    fn write(&self, sub: &str, _data: &[u8]) -> FsResult<()> {
        if sub.is_empty() {
            Err(FsError::eisdir("/proc"))
        } else {
            Err(FsError::erofs(format!("/proc/{}", sub)))
        }
    }

    fn exists(&self, sub: &str) -> bool {
        sub.is_empty() || PROC_NAMES.contains(&sub)
    }

    fn stat(&self, sub: &str) -> FsResult<Metadata> {
        if sub.is_empty() {
            return Ok(Metadata::for_dir(0o555));
        }
        match self.render(sub) {
            Some(text) => Ok(Metadata::for_file(text.len() as u64, 0o444)),
            None => Err(FsError::enoent(format!("/proc/{}", sub))),
        }
    }

    fn readdir(&self, sub: &str) -> FsResult<Vec<DirEntry>> {
        match sub {
            "" => Ok(PROC_NAMES
                .iter()
                .map(|name| DirEntry {
                    name: name.to_string(),
                    is_dir: false,
                    is_symlink: false,
                })
                .collect()),
            name if PROC_NAMES.contains(&name) => {
                Err(FsError::enotdir(format!("/proc/{}", name)))
            }
            other => Err(FsError::enoent(format!("/proc/{}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::FsErrorKind;

    fn provider() -> (ProcProvider, ManualClock) {
        let clock = ManualClock::new();
        (ProcProvider::new(Rc::new(clock.clone())), clock)
    }

    #[test]
    fn test_uptime_follows_clock() {
        let (proc_fs, clock) = provider();
        clock.advance(2500);
        let text = String::from_utf8(proc_fs.read("uptime").unwrap()).unwrap();
        assert!(text.starts_with("2.50"));
    }

    #[test]
    fn test_version_mentions_crate() {
        let (proc_fs, _) = provider();
        let text = String::from_utf8(proc_fs.read("version").unwrap()).unwrap();
        assert!(text.contains("shellbox"));
    }

    #[test]
    fn test_all_writes_are_erofs() {
        let (proc_fs, _) = provider();
        for name in PROC_NAMES {
            assert_eq!(
                proc_fs.write(name, b"x").unwrap_err().kind,
                FsErrorKind::Erofs
            );
        }
    }

    #[test]
    fn test_stat_size_matches_text() {
        let (proc_fs, _) = provider();
        let text = proc_fs.read("meminfo").unwrap();
        assert_eq!(proc_fs.stat("meminfo").unwrap().size, text.len() as u64);
    }

    #[test]
    fn test_unknown_name_is_enoent() {
        let (proc_fs, _) = provider();
        assert_eq!(proc_fs.read("mounts").unwrap_err().kind, FsErrorKind::Enoent);
    }
}
