//! # Protocol Configuration & Constants
//!
//! Every magic number in Tessera lives here. If you're hardcoding a timeout
//! somewhere else, you're doing it wrong and you owe the team coffee.
//!
//! Two kinds of things live in this file:
//!
//! - **Constants** that define the wire protocol and the network's gossip and
//!   consensus thresholds. Changing these on a live network splits it.
//! - **[`NetworkConfig`]**, the per-node knobs (ports, addresses, timeouts)
//!   that operators actually touch. It deserializes from the `[network]`
//!   table of the node's TOML file.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Protocol Version
// ---------------------------------------------------------------------------

/// Magic bytes that open every transport handshake. Peers that don't speak
/// Tessera get rejected before we spend a single DH operation on them.
pub const PROTOCOL_MAGIC: [u8; 4] = *b"TSRA";

/// Wire protocol version carried in the handshake preamble.
pub const WIRE_PROTOCOL_VERSION: u8 = 1;

/// The full version string of the protocol crate.
pub const PROTOCOL_VERSION: &str = "0.1.0";

// ---------------------------------------------------------------------------
// Cryptographic Parameters
// ---------------------------------------------------------------------------

/// AES-256-GCM key length in bytes.
pub const AES_KEY_LENGTH: usize = 32;

/// AES-256-GCM nonce length in bytes. Twelve. Not 16. Not 8. Twelve.
pub const AES_NONCE_LENGTH: usize = 12;

/// AES-256-GCM authentication tag length in bytes.
pub const AES_TAG_LENGTH: usize = 16;

/// Hash output length in bytes (BLAKE3).
pub const HASH_OUTPUT_LENGTH: usize = 32;

// ---------------------------------------------------------------------------
// Socket Layout
// ---------------------------------------------------------------------------

/// Default router (request/reply) port. Every other port is derived from it.
pub const DEFAULT_ROUTER_PORT: u16 = 19000;

/// Publisher port = router port + this offset.
pub const PUBLISHER_PORT_OFFSET: u16 = 80;

/// Webserver port = router port + this offset. The webserver itself lives
/// outside this crate, but peers still advertise where to find it.
pub const WEBSERVER_PORT_OFFSET: u16 = 160;

/// Upper bound on a single decrypted frame. A block with a fat state diff
/// fits comfortably; a malicious 4 GiB length prefix does not.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Outbound queue depth per router connection.
pub const CONNECTION_QUEUE_DEPTH: usize = 256;

/// Outbound queue depth per publisher subscriber. Slow subscribers lose
/// messages once this fills up; publishing never waits on them.
pub const SUBSCRIBER_QUEUE_DEPTH: usize = 1024;

/// Depth of the network command channel (connect/remove requests).
pub const COMMAND_QUEUE_DEPTH: usize = 1024;

// ---------------------------------------------------------------------------
// Timing Defaults
// ---------------------------------------------------------------------------

/// How long the transport handshake may take before we give up on it.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default per-attempt timeout for a peer request.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 2_000;

/// Default number of attempts per peer request.
pub const DEFAULT_REQUEST_ATTEMPTS: u32 = 3;

/// Reconnect backoff starts here and doubles on every failure...
pub const DEFAULT_RECONNECT_BACKOFF_BASE_MS: u64 = 250;

/// ...until it hits this ceiling. Never a busy loop, never a week-long nap.
pub const DEFAULT_RECONNECT_BACKOFF_MAX_MS: u64 = 10_000;

/// Interval between liveness pings to a connected peer.
pub const DEFAULT_PING_INTERVAL_MS: u64 = 5_000;

/// Consecutive failed pings before a peer is removed.
pub const DEFAULT_MAX_PING_STRIKES: u32 = 3;

// ---------------------------------------------------------------------------
// Gossip & Consensus Thresholds
// ---------------------------------------------------------------------------

/// Up to this many connected peers, gossip goes to everyone.
pub const GOSSIP_FULL_FANOUT_MAX_PEERS: usize = 25;

/// Target probability that a gossiped message reaches the whole network.
pub const GOSSIP_TARGET_REACH: f64 = 0.99;

/// Modelled probability that any single peer relays successfully.
pub const GOSSIP_PEER_SUCCESS_PROBABILITY: f64 = 0.51;

/// Percentage of the originally queried peers that must agree on a block
/// hash during catchup (rounded up).
pub const CATCHUP_MAJORITY_PERCENT: usize = 51;

// ---------------------------------------------------------------------------
// Membership
// ---------------------------------------------------------------------------

/// State key holding the masternode committee.
pub const MASTERNODES_MEMBERS_KEY: &str = "masternodes.S:members";

/// State key holding the delegate committee.
pub const DELEGATES_MEMBERS_KEY: &str = "delegates.S:members";

// ---------------------------------------------------------------------------
// SocketPorts
// ---------------------------------------------------------------------------

/// The three ports a node exposes. Each one is independently settable, but
/// by convention they are derived from the router port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketPorts {
    pub router: u16,
    pub publisher: u16,
    pub webserver: u16,
}

impl SocketPorts {
    /// Derive the full port set from a router (base) port.
    pub fn from_base(router: u16) -> Self {
        Self {
            router,
            publisher: router.wrapping_add(PUBLISHER_PORT_OFFSET),
            webserver: router.wrapping_add(WEBSERVER_PORT_OFFSET),
        }
    }
}

impl Default for SocketPorts {
    fn default() -> Self {
        Self::from_base(DEFAULT_ROUTER_PORT)
    }
}

/// Split a `host:port` address into its parts.
///
/// IPv6 literals in brackets (`[::1]:19000`) keep their brackets in the host.
pub fn split_address(address: &str) -> Option<(&str, u16)> {
    let (host, port) = address.rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }
    port.parse().ok().map(|port| (host, port))
}

// ---------------------------------------------------------------------------
// NetworkConfig
// ---------------------------------------------------------------------------

/// Errors raised by [`NetworkConfig::validate`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("router and publisher ports collide on {0}")]
    PortCollision(u16),

    #[error("request_attempts must be at least 1")]
    NoRequestAttempts,

    #[error("reconnect backoff base ({base_ms} ms) exceeds the maximum ({max_ms} ms)")]
    BackoffInverted { base_ms: u64, max_ms: u64 },

    #[error("max_ping_strikes must be at least 1")]
    NoPingStrikes,
}

/// Per-node network configuration.
///
/// Every field has a default, so an empty `[network]` table is a valid
/// (if lonely) configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Ports to bind and advertise.
    pub socket_ports: SocketPorts,
    /// Bind and advertise loopback only. Used for multi-node tests on a
    /// single machine.
    pub local: bool,
    /// Address advertised to peers. Ignored when `local` is set.
    pub external_ip: Option<String>,
    /// State keys whose union forms the committee allowed to connect.
    pub membership_keys: Vec<String>,
    /// Start in accept-all mode. Only sensible for the very first node of a
    /// brand-new network.
    pub accept_all: bool,
    /// When set, catchup only trusts peers whose VK is listed here.
    pub catchup_allow_list: Option<Vec<String>>,
    pub request_timeout_ms: u64,
    pub request_attempts: u32,
    pub reconnect_backoff_base_ms: u64,
    pub reconnect_backoff_max_ms: u64,
    pub ping_interval_ms: u64,
    pub max_ping_strikes: u32,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            socket_ports: SocketPorts::default(),
            local: false,
            external_ip: None,
            membership_keys: vec![
                MASTERNODES_MEMBERS_KEY.to_string(),
                DELEGATES_MEMBERS_KEY.to_string(),
            ],
            accept_all: false,
            catchup_allow_list: None,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            request_attempts: DEFAULT_REQUEST_ATTEMPTS,
            reconnect_backoff_base_ms: DEFAULT_RECONNECT_BACKOFF_BASE_MS,
            reconnect_backoff_max_ms: DEFAULT_RECONNECT_BACKOFF_MAX_MS,
            ping_interval_ms: DEFAULT_PING_INTERVAL_MS,
            max_ping_strikes: DEFAULT_MAX_PING_STRIKES,
        }
    }
}

impl NetworkConfig {
    /// Loopback configuration on the given router port.
    pub fn local(router_port: u16) -> Self {
        Self {
            socket_ports: SocketPorts::from_base(router_port),
            local: true,
            ..Self::default()
        }
    }

    /// Reject configurations that cannot work at runtime.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.socket_ports.router == self.socket_ports.publisher {
            return Err(ConfigError::PortCollision(self.socket_ports.router));
        }
        if self.request_attempts == 0 {
            return Err(ConfigError::NoRequestAttempts);
        }
        if self.reconnect_backoff_base_ms > self.reconnect_backoff_max_ms {
            return Err(ConfigError::BackoffInverted {
                base_ms: self.reconnect_backoff_base_ms,
                max_ms: self.reconnect_backoff_max_ms,
            });
        }
        if self.max_ping_strikes == 0 {
            return Err(ConfigError::NoPingStrikes);
        }
        Ok(())
    }

    /// Interface the router and publisher bind to.
    pub fn bind_host(&self) -> &str {
        if self.local {
            "127.0.0.1"
        } else {
            "0.0.0.0"
        }
    }

    /// Host advertised to peers in `hello` and gossip announcements.
    pub fn advertised_host(&self) -> String {
        if self.local {
            return "127.0.0.1".to_string();
        }
        self.external_ip
            .clone()
            .unwrap_or_else(|| "127.0.0.1".to_string())
    }

    /// Router address advertised to peers, as `host:port`.
    pub fn router_address(&self) -> String {
        format!("{}:{}", self.advertised_host(), self.socket_ports.router)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    /// Backoff before reconnect attempt number `attempt` (zero-based):
    /// `base * 2^attempt`, capped at the configured maximum.
    pub fn reconnect_backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
        let millis = self
            .reconnect_backoff_base_ms
            .saturating_mul(factor)
            .min(self.reconnect_backoff_max_ms);
        Duration::from_millis(millis)
    }
}
