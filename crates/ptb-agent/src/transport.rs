//! Connects to the Controller's control endpoint from inside the guest:
//! either the PCI serial chardev QEMU exposes (`-device pci-serial`, wired to
//! the supervisor's `ControlEndpoint::UnixClient` chardev on the host side)
//! or an AF_VSOCK connect-out to the host's listening port.
//!
//! Grounded in `original_source/instance-manager/management_client.py`'s
//! `ManagementClient.start()` connect-with-retry loop, and in
//! `ptb-supervisor::transport`'s AF_VSOCK raw-socket idiom for the Rust side.

use std::os::fd::{FromRawFd, OwnedFd};
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::fs::File;
use tokio::net::UnixStream;
use tokio::time::timeout;

const CONNECT_RETRIES: u32 = 5;
const CONNECT_RETRY_WAIT: Duration = Duration::from_secs(5);

/// Where the control stream is reached from inside the guest.
pub enum AgentTransport {
    /// A character device backed by the hypervisor's serial chardev.
    SerialDevice { path: PathBuf },
    /// AF_VSOCK connect-out to the host (CID 2) on a well-known port.
    Vsock { port: u32 },
}

#[cfg(target_os = "linux")]
fn vsock_connect(port: u32) -> Result<OwnedFd> {
    const VMADDR_CID_HOST: u32 = 2;
    unsafe {
        let fd = libc::socket(libc::AF_VSOCK, libc::SOCK_STREAM, 0);
        if fd < 0 {
            bail!("socket(AF_VSOCK) failed: {}", std::io::Error::last_os_error());
        }

        let mut addr: libc::sockaddr_vm = std::mem::zeroed();
        addr.svm_family = libc::AF_VSOCK as libc::sa_family_t;
        addr.svm_cid = VMADDR_CID_HOST;
        addr.svm_port = port;

        let ret = libc::connect(
            fd,
            &addr as *const libc::sockaddr_vm as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_vm>() as libc::socklen_t,
        );
        if ret != 0 {
            let err = std::io::Error::last_os_error();
            libc::close(fd);
            bail!("connect(AF_VSOCK, host, port={port}) failed: {err}");
        }

        Ok(OwnedFd::from_raw_fd(fd))
    }
}

#[cfg(not(target_os = "linux"))]
fn vsock_connect(_port: u32) -> Result<OwnedFd> {
    bail!("AF_VSOCK control endpoints are only supported on Linux")
}

/// The two concrete stream types this Agent can drive the control protocol
/// over, unified behind `AsyncRead + AsyncWrite` at the call site.
pub enum ControlStream {
    Serial(File),
    Vsock(UnixStream),
}

impl tokio::io::AsyncRead for ControlStream {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            ControlStream::Serial(f) => std::pin::Pin::new(f).poll_read(cx, buf),
            ControlStream::Vsock(s) => std::pin::Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl tokio::io::AsyncWrite for ControlStream {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        match self.get_mut() {
            ControlStream::Serial(f) => std::pin::Pin::new(f).poll_write(cx, buf),
            ControlStream::Vsock(s) => std::pin::Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            ControlStream::Serial(f) => std::pin::Pin::new(f).poll_flush(cx),
            ControlStream::Vsock(s) => std::pin::Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            ControlStream::Serial(f) => std::pin::Pin::new(f).poll_shutdown(cx),
            ControlStream::Vsock(s) => std::pin::Pin::new(s).poll_shutdown(cx),
        }
    }
}

impl AgentTransport {
    /// Open the control stream, retrying up to `CONNECT_RETRIES` times on a
    /// fixed interval (mirroring the Python client's retry loop) before
    /// giving up.
    pub async fn connect(&self) -> Result<ControlStream> {
        let mut retries_left = CONNECT_RETRIES;
        loop {
            let attempt = self.try_connect().await;
            match attempt {
                Ok(stream) => return Ok(stream),
                Err(err) => {
                    if retries_left == 0 {
                        return Err(err).context("unable to connect to management server in timeout");
                    }
                    tracing::warn!(error = %err, retries_left, "control connect failed, retrying");
                    retries_left -= 1;
                    tokio::time::sleep(CONNECT_RETRY_WAIT).await;
                }
            }
        }
    }

    async fn try_connect(&self) -> Result<ControlStream> {
        match self {
            AgentTransport::SerialDevice { path } => {
                let file = timeout(Duration::from_secs(2), open_serial(path))
                    .await
                    .with_context(|| format!("timed out opening {}", path.display()))??;
                Ok(ControlStream::Serial(file))
            }
            AgentTransport::Vsock { port } => {
                let port = *port;
                let fd = tokio::task::spawn_blocking(move || vsock_connect(port))
                    .await
                    .context("vsock connect task panicked")??;
                let std_stream = StdUnixStream::from(fd);
                std_stream.set_nonblocking(true)?;
                Ok(ControlStream::Vsock(UnixStream::from_std(std_stream)?))
            }
        }
    }
}

async fn open_serial(path: &Path) -> Result<File> {
    tokio::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .await
        .with_context(|| format!("opening control device {}", path.display()))
}
