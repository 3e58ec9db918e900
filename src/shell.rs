use crate::error::{Error, Result};
use nix::pty::{openpty, Winsize};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::collections::BTreeMap;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::sync::Arc;
use tokio::io::unix::AsyncFd;

/// An attached interactive shell: the master side of a pseudo-terminal pair
/// whose slave is the controlling terminal of a freshly spawned shell child.
///
/// The shell is a sibling of the supervised process, inheriting its working
/// directory and environment; it is not a shell *inside* the child. Closing
/// the session kills only the shell, never the supervised process.
#[derive(Clone)]
pub struct ShellSession {
    master: Arc<AsyncFd<OwnedFd>>,
    shell_pid: i32,
}

impl std::fmt::Debug for ShellSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShellSession")
            .field("shell_pid", &self.shell_pid)
            .finish()
    }
}

impl ShellSession {
    /// Allocate a PTY and spawn `$SHELL` (fallback `/bin/sh`) on its slave
    /// side, with the target process's working directory and environment.
    pub fn spawn(cwd: &str, env: &BTreeMap<String, String>) -> Result<ShellSession> {
        let winsize = Winsize {
            ws_row: 24,
            ws_col: 80,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let pty = openpty(Some(&winsize), None)
            .map_err(|e| Error::os_errno("allocate pty", e))?;

        let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string());
        let slave_out = pty
            .slave
            .try_clone()
            .map_err(|e| Error::os("dup pty slave", e))?;
        let slave_err = pty
            .slave
            .try_clone()
            .map_err(|e| Error::os("dup pty slave", e))?;

        let mut cmd = Command::new(&shell);
        cmd.stdin(Stdio::from(pty.slave))
            .stdout(Stdio::from(slave_out))
            .stderr(Stdio::from(slave_err));
        if !cwd.is_empty() {
            cmd.current_dir(cwd);
        }
        for (k, v) in env {
            cmd.env(k, v);
        }
        // New session + controlling terminal, so job control works inside.
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                if libc::ioctl(0, libc::TIOCSCTTY as libc::c_ulong, 0) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
        let mut child = cmd
            .spawn()
            .map_err(|e| Error::os(format!("spawn shell {shell}"), e))?;
        let shell_pid = child.id() as i32;

        // Reap the shell when it exits so it never lingers as a zombie.
        tokio::task::spawn_blocking(move || {
            let _ = child.wait();
        });

        set_nonblocking(pty.master.as_raw_fd())?;
        let master = AsyncFd::new(pty.master).map_err(|e| Error::os("register pty master", e))?;
        Ok(ShellSession {
            master: Arc::new(master),
            shell_pid,
        })
    }

    pub fn shell_pid(&self) -> i32 {
        self.shell_pid
    }

    /// Read the next chunk of bytes from the master side.
    /// Returns 0 at EOF (shell exited and the slave side closed).
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        loop {
            let mut guard = self
                .master
                .readable()
                .await
                .map_err(|e| Error::os("await pty readable", e))?;
            let r = guard.try_io(|inner| {
                let n = unsafe {
                    libc::read(
                        inner.get_ref().as_raw_fd(),
                        buf.as_mut_ptr() as *mut libc::c_void,
                        buf.len(),
                    )
                };
                if n < 0 {
                    let errno = nix::errno::Errno::last();
                    if errno == nix::errno::Errno::EAGAIN {
                        return Err(std::io::Error::from(std::io::ErrorKind::WouldBlock));
                    }
                    // EIO on the master means the slave side is gone: treat as EOF.
                    if errno == nix::errno::Errno::EIO {
                        return Ok(0);
                    }
                    return Err(std::io::Error::from_raw_os_error(errno as i32));
                }
                Ok(n as usize)
            });
            match r {
                Ok(Ok(n)) => return Ok(n),
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Ok(Err(e)) => return Err(Error::os("read pty master", e)),
                Err(_would_block) => continue,
            }
        }
    }

    /// Write the whole buffer to the master side.
    pub async fn write_all(&self, data: &[u8]) -> Result<()> {
        let mut off = 0usize;
        while off < data.len() {
            let mut guard = self
                .master
                .writable()
                .await
                .map_err(|e| Error::os("await pty writable", e))?;
            let r = guard.try_io(|inner| {
                let n = unsafe {
                    libc::write(
                        inner.get_ref().as_raw_fd(),
                        data[off..].as_ptr() as *const libc::c_void,
                        data.len() - off,
                    )
                };
                if n < 0 {
                    let errno = nix::errno::Errno::last();
                    if errno == nix::errno::Errno::EAGAIN {
                        return Err(std::io::Error::from(std::io::ErrorKind::WouldBlock));
                    }
                    return Err(std::io::Error::from_raw_os_error(errno as i32));
                }
                Ok(n as usize)
            });
            match r {
                Ok(Ok(n)) => off += n,
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Ok(Err(e)) => return Err(Error::os("write pty master", e)),
                Err(_would_block) => continue,
            }
        }
        Ok(())
    }

    /// Propagate the caller's window size to the slave terminal.
    pub fn resize(&self, rows: u16, cols: u16) -> Result<()> {
        let ws = libc::winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let r = unsafe {
            libc::ioctl(
                self.master.get_ref().as_raw_fd(),
                libc::TIOCSWINSZ as libc::c_ulong,
                &ws,
            )
        };
        if r < 0 {
            return Err(Error::os("resize pty", std::io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Hang up the shell child. The supervised process is untouched.
    pub fn close(&self) {
        let _ = kill(Pid::from_raw(self.shell_pid), Signal::SIGHUP);
    }
}

fn set_nonblocking(fd: i32) -> Result<()> {
    use nix::fcntl::{fcntl, FcntlArg, OFlag};
    let flags = OFlag::from_bits_truncate(
        fcntl(fd, FcntlArg::F_GETFL).map_err(|e| Error::os_errno("F_GETFL", e))?,
    );
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))
        .map_err(|e| Error::os_errno("F_SETFL", e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shell_round_trips_bytes() {
        let env = BTreeMap::new();
        let session = ShellSession::spawn("/tmp", &env).expect("spawn shell");
        session.write_all(b"echo gem-$((20+3))\n").await.unwrap();

        // Collect output until the expansion shows up (or we give up).
        let mut collected = Vec::new();
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        let mut buf = [0u8; 1024];
        while std::time::Instant::now() < deadline {
            let n = tokio::time::timeout(
                std::time::Duration::from_millis(500),
                session.read(&mut buf),
            )
            .await;
            match n {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => collected.extend_from_slice(&buf[..n]),
                _ => {}
            }
            if String::from_utf8_lossy(&collected).contains("gem-23") {
                break;
            }
        }
        assert!(
            String::from_utf8_lossy(&collected).contains("gem-23"),
            "shell output: {:?}",
            String::from_utf8_lossy(&collected)
        );
        session.close();
    }

    #[tokio::test]
    async fn resize_succeeds_on_live_session() {
        let env = BTreeMap::new();
        let session = ShellSession::spawn("", &env).expect("spawn shell");
        session.resize(50, 120).unwrap();
        session.close();
    }
}
