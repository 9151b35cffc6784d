//! The control endpoint (§4.3 step 3): a VSOCK listener when the host
//! supports it, otherwise a UNIX-domain bytestream the hypervisor serves
//! and the supervisor connects to as a client — mirroring the asymmetry
//! between a vsock device (host listens, guest connects) and a QEMU
//! `chardev socket,...,server=on` serial port (hypervisor listens, host
//! connects).

use std::os::fd::{FromRawFd, OwnedFd};
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio::net::UnixStream;
use tokio::time::timeout;

/// Where the Agent's control stream arrives from.
pub enum ControlEndpoint {
    /// Host-side VSOCK listener; the guest Agent connects out to it.
    Vsock { cid: u32, port: u32 },
    /// The hypervisor serves a UNIX socket (e.g. a QEMU chardev); the
    /// supervisor connects to it as a client.
    UnixClient { path: PathBuf },
}

/// Bind an AF_VSOCK listening socket on `cid`/`port` and accept exactly one
/// connection, blocking the calling thread (intended to run inside
/// `spawn_blocking`).
#[cfg(target_os = "linux")]
fn vsock_accept_once(cid: u32, port: u32) -> Result<OwnedFd> {
    unsafe {
        let fd = libc::socket(libc::AF_VSOCK, libc::SOCK_STREAM, 0);
        if fd < 0 {
            bail!("socket(AF_VSOCK) failed: {}", std::io::Error::last_os_error());
        }

        let mut addr: libc::sockaddr_vm = std::mem::zeroed();
        addr.svm_family = libc::AF_VSOCK as libc::sa_family_t;
        addr.svm_cid = cid;
        addr.svm_port = port;

        let bind_ret = libc::bind(
            fd,
            &addr as *const libc::sockaddr_vm as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_vm>() as libc::socklen_t,
        );
        if bind_ret != 0 {
            let err = std::io::Error::last_os_error();
            libc::close(fd);
            bail!("bind(AF_VSOCK, cid={cid}, port={port}) failed: {err}");
        }

        if libc::listen(fd, 1) != 0 {
            let err = std::io::Error::last_os_error();
            libc::close(fd);
            bail!("listen(AF_VSOCK) failed: {err}");
        }

        let client_fd = libc::accept(fd, std::ptr::null_mut(), std::ptr::null_mut());
        let err = std::io::Error::last_os_error();
        libc::close(fd);
        if client_fd < 0 {
            bail!("accept(AF_VSOCK) failed: {err}");
        }

        Ok(OwnedFd::from_raw_fd(client_fd))
    }
}

#[cfg(not(target_os = "linux"))]
fn vsock_accept_once(_cid: u32, _port: u32) -> Result<OwnedFd> {
    bail!("AF_VSOCK control endpoints are only supported on Linux")
}

impl ControlEndpoint {
    /// Accept (or establish) the one control connection for this Instance,
    /// bounded by `startup_timeout`. Declares the Instance STARTED once this
    /// resolves.
    pub async fn accept(&self, startup_timeout: Duration) -> Result<UnixStream> {
        match self {
            ControlEndpoint::Vsock { cid, port } => {
                let (cid, port) = (*cid, *port);
                let fd = timeout(
                    startup_timeout,
                    tokio::task::spawn_blocking(move || vsock_accept_once(cid, port)),
                )
                .await
                .context("timed out waiting for guest Agent to connect over VSOCK")?
                .context("vsock accept task panicked")??;

                let std_stream = StdUnixStream::from(fd);
                std_stream.set_nonblocking(true)?;
                UnixStream::from_std(std_stream).context("wrapping vsock fd as a UNIX stream")
            }
            ControlEndpoint::UnixClient { path } => connect_with_retry(path, startup_timeout).await,
        }
    }
}

/// The hypervisor may not have created its serving socket yet when we first
/// try to connect (same race the teacher's shell helpers poll around);
/// retry on a short interval until `deadline`.
async fn connect_with_retry(path: &Path, deadline: Duration) -> Result<UnixStream> {
    timeout(deadline, async {
        loop {
            match UnixStream::connect(path).await {
                Ok(stream) => return Ok(stream),
                Err(_) => tokio::time::sleep(Duration::from_millis(100)).await,
            }
        }
    })
    .await
    .with_context(|| format!("timed out connecting to hypervisor control socket {}", path.display()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixListener;

    #[tokio::test]
    async fn test_unix_client_connects_once_socket_appears() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mgmt.sock");

        let path_for_server = path.clone();
        let server = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let listener = UnixListener::bind(&path_for_server).unwrap();
            listener.accept().await.unwrap();
        });

        let endpoint = ControlEndpoint::UnixClient { path: path.clone() };
        let result = endpoint.accept(Duration::from_secs(2)).await;
        assert!(result.is_ok());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_unix_client_times_out_if_never_served() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("never.sock");
        let endpoint = ControlEndpoint::UnixClient { path };
        let result = endpoint.accept(Duration::from_millis(200)).await;
        assert!(result.is_err());
    }
}
