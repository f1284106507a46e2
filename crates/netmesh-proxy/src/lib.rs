//! netmesh-proxy — the packet-translation tunnel.
//!
//! Packets written by workloads into the TUN device are addressed to
//! service IPs. The tunnel rewrites them towards a concrete instance's
//! namespace IP and relays them over UDP to the node hosting it; the
//! receiving tunnel reverses the translation before handing the packet to
//! its own TUN device.
//!
//! # Components
//!
//! - **`packet`** — IPv4/IPv6 + TCP/UDP decode, encode and address rewrite
//! - **`defrag`** — IPv4 fragment reassembly used by the codec
//! - **`cache`** — per-port flow affinity cache
//! - **`pool`** — connected UDP sockets towards remote nodes
//! - **`device`** — TUN device abstraction and the Linux implementation
//! - **`tunnel`** — the two forwarding pipelines

pub mod cache;
pub mod checksum;
pub mod defrag;
pub mod device;
pub mod error;
pub mod packet;
pub mod pool;
pub mod tunnel;

pub use cache::{ConversionEntry, ProxyCache};
pub use device::{MemoryTun, MemoryTunHandle, TunDevice};
#[cfg(target_os = "linux")]
pub use device::LinuxTun;
pub use error::{CodecError, TunnelError, TunnelResult};
pub use packet::{NetworkHeader, Packet, PacketCodec, TransportHeader};
pub use pool::ConnectionPool;
pub use tunnel::ProxyTunnel;
