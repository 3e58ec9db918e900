use crate::error::{Error, Result};
use std::collections::VecDeque;
use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Cadence of the follow loop when no new data is available.
pub const FOLLOW_IDLE_INTERVAL: Duration = Duration::from_millis(200);

const TAIL_CHUNK_BYTES: u64 = 8192;
const TAIL_MAX_CHUNKS: usize = 512; // ~4 MiB cap for pathological files

/// Last `n` lines of a file; `n <= 0` returns the entire file.
/// A missing file is an error.
pub fn tail_lines(path: &Path, n: i64) -> Result<Vec<String>> {
    let mut f = fs::OpenOptions::new()
        .read(true)
        .open(path)
        .map_err(|_| Error::NotFound(format!("log file {}", path.display())))?;

    if n <= 0 {
        let mut raw = String::new();
        f.read_to_string(&mut raw)
            .map_err(|e| Error::os(format!("read {}", path.display()), e))?;
        return Ok(raw.split_terminator('\n').map(str::to_string).collect());
    }

    let len = f
        .metadata()
        .map_err(|e| Error::os(format!("stat {}", path.display()), e))?
        .len();
    if len == 0 {
        return Ok(vec![]);
    }

    // Read backwards in chunks until enough newlines were seen.
    let n = n as usize;
    let mut pos = len;
    let mut newline_count = 0usize;
    let mut chunks: Vec<Vec<u8>> = vec![];
    while pos > 0 && newline_count <= n {
        let read_size = TAIL_CHUNK_BYTES.min(pos) as usize;
        pos -= read_size as u64;
        f.seek(SeekFrom::Start(pos))
            .map_err(|e| Error::os(format!("seek {}", path.display()), e))?;
        let mut buf = vec![0u8; read_size];
        f.read_exact(&mut buf)
            .map_err(|e| Error::os(format!("read {}", path.display()), e))?;
        newline_count += buf.iter().filter(|&&b| b == b'\n').count();
        chunks.push(buf);
        if chunks.len() > TAIL_MAX_CHUNKS {
            break;
        }
    }
    chunks.reverse();
    let data = chunks.concat();
    let s = String::from_utf8_lossy(&data);
    let mut lines: Vec<String> = s.split_terminator('\n').map(str::to_string).collect();
    if lines.len() > n {
        lines.drain(..lines.len() - n);
    }
    Ok(lines)
}

/// Follow-mode producer: after an initial tail, yields each newline-terminated
/// line appended to the file. Survives log rotation by re-opening when the
/// path's inode changes, and yields cooperatively (>= 200 ms between polls)
/// when no data is pending.
pub struct LogFollower {
    path: PathBuf,
    inode: u64,
    offset: u64,
    partial: Vec<u8>,
    queue: VecDeque<String>,
}

impl LogFollower {
    /// Open at the current end of file, returning the last `initial_lines`
    /// first (0 = no initial tail). A missing file is an error.
    pub fn open(path: &Path, initial_lines: usize) -> Result<LogFollower> {
        let meta = fs::metadata(path)
            .map_err(|_| Error::NotFound(format!("log file {}", path.display())))?;
        let queue: VecDeque<String> = if initial_lines == 0 {
            VecDeque::new()
        } else {
            tail_lines(path, initial_lines as i64)?.into()
        };
        Ok(LogFollower {
            path: path.to_path_buf(),
            inode: meta.ino(),
            offset: meta.len(),
            partial: vec![],
            queue,
        })
    }

    /// Next complete line. Waits for data when none is buffered.
    pub async fn next_line(&mut self) -> Result<String> {
        loop {
            if let Some(line) = self.queue.pop_front() {
                return Ok(line);
            }
            if !self.poll()? {
                tokio::time::sleep(FOLLOW_IDLE_INTERVAL).await;
            }
        }
    }

    /// One non-blocking poll of the file; true when new lines were queued.
    fn poll(&mut self) -> Result<bool> {
        let meta = match fs::metadata(&self.path) {
            Ok(m) => m,
            // Rotation window: the old file was renamed away and the new one
            // does not exist yet. Keep waiting.
            Err(_) => return Ok(false),
        };
        if meta.ino() != self.inode {
            // Rotated: start from the head of the replacement file.
            self.inode = meta.ino();
            self.offset = 0;
            self.partial.clear();
        } else if meta.len() < self.offset {
            // Truncated in place.
            self.offset = 0;
            self.partial.clear();
        }
        if meta.len() == self.offset {
            return Ok(false);
        }

        let mut f = fs::OpenOptions::new()
            .read(true)
            .open(&self.path)
            .map_err(|e| Error::os(format!("open {}", self.path.display()), e))?;
        f.seek(SeekFrom::Start(self.offset))
            .map_err(|e| Error::os(format!("seek {}", self.path.display()), e))?;
        let mut delta = Vec::new();
        f.read_to_end(&mut delta)
            .map_err(|e| Error::os(format!("read {}", self.path.display()), e))?;
        self.offset += delta.len() as u64;

        self.partial.extend_from_slice(&delta);
        let mut produced = false;
        while let Some(idx) = self.partial.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.partial.drain(..=idx).collect();
            let line = &line[..line.len() - 1];
            self.queue
                .push_back(String::from_utf8_lossy(line).into_owned());
            produced = true;
        }
        Ok(produced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::{AtomicU32, Ordering};

    static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

    fn temp_file(lines: &[&str]) -> PathBuf {
        let n = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        let path =
            std::env::temp_dir().join(format!("gem-logs-test-{}-{n}.log", std::process::id()));
        let mut f = fs::File::create(&path).unwrap();
        for l in lines {
            writeln!(f, "{l}").unwrap();
        }
        path
    }

    #[test]
    fn tail_returns_last_n() {
        let path = temp_file(&["one", "two", "three", "four"]);
        assert_eq!(tail_lines(&path, 2).unwrap(), vec!["three", "four"]);
        let _ = fs::remove_file(path);
    }

    #[test]
    fn tail_zero_returns_everything() {
        let path = temp_file(&["a", "b", "c"]);
        assert_eq!(tail_lines(&path, 0).unwrap(), vec!["a", "b", "c"]);
        assert_eq!(tail_lines(&path, -1).unwrap(), vec!["a", "b", "c"]);
        let _ = fs::remove_file(path);
    }

    #[test]
    fn tail_more_than_file_returns_all() {
        let path = temp_file(&["only"]);
        assert_eq!(tail_lines(&path, 50).unwrap(), vec!["only"]);
        let _ = fs::remove_file(path);
    }

    #[test]
    fn tail_missing_file_is_not_found() {
        let path = PathBuf::from("/nonexistent/gem/never.log");
        assert!(matches!(tail_lines(&path, 5), Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn follower_yields_appended_lines() {
        let path = temp_file(&["old"]);
        let mut follower = LogFollower::open(&path, 1).unwrap();
        assert_eq!(follower.next_line().await.unwrap(), "old");

        let mut f = fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(f, "fresh").unwrap();
        drop(f);
        assert_eq!(follower.next_line().await.unwrap(), "fresh");
        let _ = fs::remove_file(path);
    }

    #[tokio::test]
    async fn follower_survives_rotation() {
        let path = temp_file(&["before"]);
        let mut follower = LogFollower::open(&path, 0).unwrap();

        // Rotate: rename away, then recreate the path (new inode).
        let rotated = path.with_extension("log.1");
        fs::rename(&path, &rotated).unwrap();
        let mut f = fs::File::create(&path).unwrap();
        writeln!(f, "after-rotate").unwrap();
        drop(f);

        assert_eq!(follower.next_line().await.unwrap(), "after-rotate");
        let _ = fs::remove_file(path);
        let _ = fs::remove_file(rotated);
    }
}
