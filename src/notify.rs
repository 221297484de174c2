//! Progress notifications from workers.
//!
//! All live workers share one datagram socket in the runtime directory.
//! Datagrams are routed to jobs by the kernel-attested sender pid; the pid a
//! worker might claim in the payload is never trusted.

use std::io::IoSliceMut;
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nix::errno::Errno;
use nix::sys::socket::{self, ControlMessageOwned, MsgFlags, UnixCredentials};
use tokio::io::unix::AsyncFd;
use tracing::{debug, warn};

use crate::manager::Manager;

/// One parsed notification datagram.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Notification {
    pub version: Option<String>,
    pub progress: Option<u32>,
    pub errno: Option<i32>,
    pub ready: bool,
}

/// Parse the KEY=VALUE lines of a notification datagram. Unknown keys are
/// ignored, invalid progress or errno values are dropped with a warning.
pub fn parse(text: &str) -> Notification {
    let mut n = Notification::default();
    for line in text.lines() {
        if let Some(v) = line.strip_prefix("X_SYSUPDATE_VERSION=") {
            n.version = Some(v.to_string());
        } else if let Some(v) = line.strip_prefix("X_SYSUPDATE_PROGRESS=") {
            match v.trim().parse::<u32>() {
                Ok(percent) if percent <= 100 => n.progress = Some(percent),
                _ => warn!(value = v, "got invalid percent value, ignoring"),
            }
        } else if let Some(v) = line.strip_prefix("ERRNO=") {
            match v.trim().parse::<i32>() {
                Ok(errno) if errno >= 0 => n.errno = Some(errno),
                _ => warn!(value = v, "got invalid errno value, ignoring"),
            }
        } else if line == "READY=1" {
            n.ready = true;
        }
    }
    n
}

/// The daemon-wide notify socket. Bound before any worker is spawned.
pub struct NotifyListener {
    socket: AsyncFd<UnixDatagram>,
    path: PathBuf,
}

impl NotifyListener {
    /// Bind the datagram socket at `path` and enable credential passing.
    /// A stale socket file from a previous run is removed first.
    pub fn bind(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let _ = std::fs::remove_file(path);

        let socket = UnixDatagram::bind(path)?;
        socket.set_nonblocking(true)?;
        socket::setsockopt(&socket, socket::sockopt::PassCred, &true)
            .map_err(std::io::Error::from)?;

        Ok(Self {
            socket: AsyncFd::new(socket)?,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Receive datagrams for the daemon's lifetime, routing each to the job
    /// registry. Transient receive errors are ignored.
    pub async fn run(self, manager: Arc<Manager>) {
        loop {
            let mut guard = match self.socket.readable().await {
                Ok(guard) => guard,
                Err(e) => {
                    warn!(error = %e, "notify socket wait failed");
                    return;
                }
            };

            match receive_one(self.socket.get_ref()) {
                Ok(Some((pid, text))) => {
                    manager.dispatch_notify(pid, &text).await;
                }
                Ok(None) => {} // dropped datagram
                Err(Errno::EAGAIN) => guard.clear_ready(),
                Err(Errno::EINTR) => {}
                Err(e) => {
                    debug!(error = %e, "transient notify receive error, ignoring");
                }
            }
        }
    }
}

impl Drop for NotifyListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Receive a single datagram with the sender's credentials. Returns None
/// when the datagram must be dropped: truncated, uncredentialed, or carrying
/// a non-positive peer pid. Ancillary fds, should a peer smuggle any, are
/// closed immediately.
fn receive_one(socket: &UnixDatagram) -> nix::Result<Option<(u32, String)>> {
    let mut buf = [0u8; 4096];
    let mut cmsg_buf = nix::cmsg_space!(UnixCredentials, [std::os::fd::RawFd; 8]);

    let (bytes, truncated, creds) = {
        let mut iov = [IoSliceMut::new(&mut buf)];
        let msg = socket::recvmsg::<()>(
            socket.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_buf),
            MsgFlags::MSG_DONTWAIT | MsgFlags::MSG_CMSG_CLOEXEC | MsgFlags::MSG_TRUNC,
        )?;

        let mut creds: Option<UnixCredentials> = None;
        if let Ok(cmsgs) = msg.cmsgs() {
            for cmsg in cmsgs {
                match cmsg {
                    ControlMessageOwned::ScmCredentials(c) => creds = Some(c),
                    ControlMessageOwned::ScmRights(fds) => {
                        for fd in fds {
                            let _ = nix::unistd::close(fd);
                        }
                    }
                    _ => {}
                }
            }
        }

        (msg.bytes, msg.flags.contains(MsgFlags::MSG_TRUNC), creds)
    };

    if truncated {
        warn!("got overly long notification datagram, ignoring");
        return Ok(None);
    }

    let Some(creds) = creds else {
        warn!("got notification datagram lacking credential information, ignoring");
        return Ok(None);
    };
    if creds.pid() <= 0 {
        warn!(pid = creds.pid(), "got notification datagram with bad peer pid, ignoring");
        return Ok(None);
    }

    let text = String::from_utf8_lossy(&buf[..bytes]).into_owned();
    Ok(Some((creds.pid() as u32, text)))
}
