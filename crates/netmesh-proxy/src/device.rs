//! Virtual network interface abstraction.
//!
//! The tunnel reads packets written by workloads from a [`TunDevice`] and
//! writes translated packets back into it. [`LinuxTun`] drives a kernel TUN
//! interface; [`MemoryTun`] is an in-process device backed by channels.

use std::io;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

#[async_trait]
pub trait TunDevice: Send + Sync {
    /// Read one packet into `buf`, returning its length.
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write one packet.
    async fn send(&self, packet: &[u8]) -> io::Result<usize>;

    fn name(&self) -> &str;
}

#[cfg(target_os = "linux")]
mod linux {
    use std::fs::{File, OpenOptions};
    use std::io::{self, Read, Write};
    use std::os::unix::io::AsRawFd;

    use async_trait::async_trait;
    use tokio::io::unix::AsyncFd;
    use tracing::info;

    use super::TunDevice;

    const TUN_PATH: &str = "/dev/net/tun";
    const IFF_TUN: libc::c_short = 0x0001;
    const IFF_NO_PI: libc::c_short = 0x1000;
    const TUNSETIFF: libc::c_ulong = 0x400454ca;

    /// Layout of `struct ifreq` as used by TUNSETIFF.
    #[repr(C)]
    struct TunRequest {
        name: [u8; libc::IFNAMSIZ],
        flags: libc::c_short,
        _pad: [u8; 22],
    }

    /// A kernel TUN interface without packet information headers.
    ///
    /// Address assignment and routes are left to the host.
    pub struct LinuxTun {
        fd: AsyncFd<File>,
        name: String,
    }

    impl LinuxTun {
        /// Attach to (or create) the TUN interface `name`.
        ///
        /// Must be called from within a tokio runtime.
        pub fn open(name: &str) -> io::Result<Self> {
            if name.is_empty() || name.len() >= libc::IFNAMSIZ {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("interface name {name:?} must be 1..{} bytes", libc::IFNAMSIZ),
                ));
            }

            let file = OpenOptions::new().read(true).write(true).open(TUN_PATH)?;
            let mut request = TunRequest {
                name: [0; libc::IFNAMSIZ],
                flags: IFF_TUN | IFF_NO_PI,
                _pad: [0; 22],
            };
            request.name[..name.len()].copy_from_slice(name.as_bytes());

            let fd = file.as_raw_fd();
            // SAFETY: `fd` is an open descriptor owned by `file` and `request`
            // outlives both calls.
            unsafe {
                if libc::ioctl(fd, TUNSETIFF as _, &mut request) < 0 {
                    return Err(io::Error::last_os_error());
                }
                let flags = libc::fcntl(fd, libc::F_GETFL);
                if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
                    return Err(io::Error::last_os_error());
                }
            }

            info!(device = name, "opened TUN device");
            Ok(Self {
                fd: AsyncFd::new(file)?,
                name: name.to_string(),
            })
        }
    }

    #[async_trait]
    impl TunDevice for LinuxTun {
        async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
            loop {
                let mut guard = self.fd.readable().await?;
                match guard.try_io(|inner| (&*inner.get_ref()).read(buf)) {
                    Ok(result) => return result,
                    Err(_would_block) => continue,
                }
            }
        }

        async fn send(&self, packet: &[u8]) -> io::Result<usize> {
            loop {
                let mut guard = self.fd.writable().await?;
                match guard.try_io(|inner| (&*inner.get_ref()).write(packet)) {
                    Ok(result) => return result,
                    Err(_would_block) => continue,
                }
            }
        }

        fn name(&self) -> &str {
            &self.name
        }
    }
}

#[cfg(target_os = "linux")]
pub use linux::LinuxTun;

/// Channel-backed device.
///
/// Packets pushed through [`MemoryTunHandle::inject`] come out of
/// [`TunDevice::recv`]; packets the tunnel sends show up on
/// [`MemoryTunHandle::delivered`].
pub struct MemoryTun {
    name: String,
    inbound: Mutex<mpsc::Receiver<Vec<u8>>>,
    outbound: mpsc::Sender<Vec<u8>>,
}

/// The workload side of a [`MemoryTun`].
pub struct MemoryTunHandle {
    inject: mpsc::Sender<Vec<u8>>,
    delivered: mpsc::Receiver<Vec<u8>>,
}

impl MemoryTun {
    pub fn new(name: &str, capacity: usize) -> (Self, MemoryTunHandle) {
        let (inject, inbound) = mpsc::channel(capacity);
        let (outbound, delivered) = mpsc::channel(capacity);
        (
            Self {
                name: name.to_string(),
                inbound: Mutex::new(inbound),
                outbound,
            },
            MemoryTunHandle { inject, delivered },
        )
    }
}

impl MemoryTunHandle {
    /// Hand a packet to the tunnel as if a workload had written it.
    pub async fn inject(&self, packet: Vec<u8>) -> io::Result<()> {
        self.inject
            .send(packet)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "device closed"))
    }

    /// Next packet the tunnel delivered to the workloads.
    pub async fn delivered(&mut self) -> Option<Vec<u8>> {
        self.delivered.recv().await
    }
}

#[async_trait]
impl TunDevice for MemoryTun {
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let packet = self
            .inbound
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "device closed"))?;
        let n = packet.len().min(buf.len());
        buf[..n].copy_from_slice(&packet[..n]);
        Ok(n)
    }

    async fn send(&self, packet: &[u8]) -> io::Result<usize> {
        self.outbound
            .send(packet.to_vec())
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "device closed"))?;
        Ok(packet.len())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_tun_moves_packets_both_ways() {
        let (tun, mut handle) = MemoryTun::new("mem0", 4);
        assert_eq!(tun.name(), "mem0");

        handle.inject(vec![1, 2, 3]).await.unwrap();
        let mut buf = [0u8; 16];
        let n = tun.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[1, 2, 3]);

        tun.send(&[9, 9]).await.unwrap();
        assert_eq!(handle.delivered().await.unwrap(), vec![9, 9]);
    }

    #[tokio::test]
    async fn memory_tun_reports_closed_handle() {
        let (tun, handle) = MemoryTun::new("mem0", 1);
        drop(handle);
        let mut buf = [0u8; 4];
        let err = tun.recv(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
