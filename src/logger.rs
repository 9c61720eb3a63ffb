use anyhow::Result;
use chrono::Utc;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

pub trait Logger: Send + Sync {
    fn staged(&self, _src: &Path, _bytes: u64) {}
    fn uploaded(&self, _src: &Path, _remote: &str, _bytes: u64) {}
    fn downloaded(&self, _remote: &str, _dst: &Path) {}
    fn retry(&self, _src: &Path, _attempts: u32, _msg: &str) {}
    fn dead_letter(&self, _src: &Path, _attempts: u32) {}
    fn skipped(&self, _path: &Path, _msg: &str) {}
    fn error(&self, _context: &str, _path: &Path, _msg: &str) {}
    fn done(&self, _objects: u64, _bytes: u64, _seconds: f64) {}
}

pub struct NoopLogger;
impl Logger for NoopLogger {}

pub struct TextLogger {
    file: Mutex<File>,
}

impl TextLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(f),
        })
    }

    fn line(&self, s: &str) {
        if let Ok(mut f) = self.file.lock() {
            let _ = writeln!(f, "[{}] {}", Utc::now().to_rfc3339(), s);
        }
    }
}

impl Logger for TextLogger {
    fn staged(&self, src: &Path, bytes: u64) {
        self.line(&format!("STAGE src={} bytes={}", src.display(), bytes));
    }
    fn uploaded(&self, src: &Path, remote: &str, bytes: u64) {
        self.line(&format!(
            "UPLOAD src={} remote={} bytes={}",
            src.display(),
            remote,
            bytes
        ));
    }
    fn downloaded(&self, remote: &str, dst: &Path) {
        self.line(&format!("DOWNLOAD remote={} dst={}", remote, dst.display()));
    }
    fn retry(&self, src: &Path, attempts: u32, msg: &str) {
        self.line(&format!(
            "RETRY src={} attempts={} msg={}",
            src.display(),
            attempts,
            msg
        ));
    }
    fn dead_letter(&self, src: &Path, attempts: u32) {
        self.line(&format!(
            "DEAD src={} attempts={}",
            src.display(),
            attempts
        ));
    }
    fn skipped(&self, path: &Path, msg: &str) {
        self.line(&format!("SKIP path={} msg={}", path.display(), msg));
    }
    fn error(&self, context: &str, path: &Path, msg: &str) {
        self.line(&format!("ERROR ctx={} path={} msg={}", context, path.display(), msg));
    }
    fn done(&self, objects: u64, bytes: u64, seconds: f64) {
        self.line(&format!(
            "DONE objects={objects} bytes={bytes} seconds={seconds:.3}"
        ));
    }
}
