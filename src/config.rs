//! CLI-facing options and their validation. Everything here is checked
//! before any network activity.

use std::net::IpAddr;

use tracing::info;

use crate::error::TransferError;

pub const DEFAULT_SIGNAL_URL: &str = "ws://127.0.0.1:8787/ws";
pub const SIGNAL_URL_ENV: &str = "SLIPSTREAM_SIGNAL_URL";

pub const DEFAULT_STUN_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// A TURN relay with its credentials.
#[derive(Debug, Clone)]
pub struct TurnServer {
    pub url: String,
    pub username: String,
    pub credential: String,
}

/// Peer-connection options shared by the send and receive commands.
#[derive(Debug, Clone)]
pub struct RtcOptions {
    pub stun: Vec<String>,
    pub turn: Vec<TurnServer>,
    pub force_relay: bool,
}

impl Default for RtcOptions {
    fn default() -> Self {
        RtcOptions {
            stun: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
            turn: Vec::new(),
            force_relay: false,
        }
    }
}

impl RtcOptions {
    pub fn validate(&self) -> Result<(), TransferError> {
        if self.force_relay && self.turn.is_empty() {
            return Err(TransferError::Config(
                "--force-relay requires at least one TURN server".to_string(),
            ));
        }
        for turn in &self.turn {
            if !turn.url.starts_with("turn:") && !turn.url.starts_with("turns:") {
                return Err(TransferError::Config(format!(
                    "TURN url {:?} must start with turn: or turns:",
                    turn.url
                )));
            }
        }
        Ok(())
    }

    /// Hosts behind VPN or CGNAT interfaces rarely complete a direct path,
    /// so relay is forced for them when a relay is actually configured.
    pub fn apply_network_heuristics(&mut self) {
        if self.force_relay {
            return;
        }
        if vpn_or_cgnat_present() {
            if self.turn.is_empty() {
                info!("VPN/CGNAT interface detected but no TURN server configured");
            } else {
                info!("VPN/CGNAT interface detected, forcing relay");
                self.force_relay = true;
            }
        }
    }
}

/// Resolve the signaling endpoint: explicit flag, then environment, then
/// the built-in default.
pub fn signal_url(flag: Option<String>) -> String {
    flag.or_else(|| std::env::var(SIGNAL_URL_ENV).ok())
        .unwrap_or_else(|| DEFAULT_SIGNAL_URL.to_string())
}

/// True when any interface looks like a VPN tunnel or carries a CGNAT
/// address.
pub fn vpn_or_cgnat_present() -> bool {
    match if_addrs::get_if_addrs() {
        Ok(interfaces) => interfaces
            .iter()
            .any(|iface| looks_like_vpn(&iface.name) || is_cgnat(iface.ip())),
        Err(_) => false,
    }
}

fn looks_like_vpn(interface_name: &str) -> bool {
    const PREFIXES: &[&str] = &["tun", "tap", "wg", "utun", "zt", "tailscale"];
    PREFIXES.iter().any(|p| interface_name.starts_with(p))
}

/// 100.64.0.0/10, the shared address space used by carrier-grade NAT and
/// mesh VPNs.
fn is_cgnat(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            octets[0] == 100 && (64..128).contains(&octets[1])
        }
        IpAddr::V6(_) => false,
    }
}
