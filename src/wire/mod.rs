//! Shared wire types: the peer record and the two message families
//! (`control` over TCP, `data` over UDP).

pub mod control;
pub mod data;

use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// One peer's address book entry, held by the Coordinator and by the
/// Subcoordinator that owns its strand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub name: String,
    pub ip: IpAddr,
    pub data_port: u16,
    pub ctrl_port: u16,
}

impl PeerRecord {
    pub fn new(name: impl Into<String>, ip: IpAddr, data_port: u16) -> Self {
        Self {
            name: name.into(),
            ip,
            data_port,
            ctrl_port: data_port + 10000,
        }
    }

    pub fn data_addr(&self) -> std::net::SocketAddr {
        std::net::SocketAddr::new(self.ip, self.data_port)
    }

    pub fn ctrl_addr(&self) -> std::net::SocketAddr {
        std::net::SocketAddr::new(self.ip, self.ctrl_port)
    }
}
