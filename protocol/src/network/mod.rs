//! # Network Module
//!
//! The peer mesh of a permissioned node: authenticated transport, request
//! routing, broadcast, peer admission and gossip discovery, and majority
//! catch-up.
//!
//! ## Architecture
//!
//! ```text
//! transport.rs   — Authenticated, encrypted framed TCP (handshake + frames)
//! credentials.rs — Committee-based admission gate consulted by the handshake
//! router.rs      — Inbound request endpoint, action dispatch, identity routing
//! dealer.rs      — Outbound request channel with retries and correlation
//! publisher.rs   — Fire-and-forget broadcast plus the matching subscriber
//! messages.rs    — Action names, topics, announcements, network commands
//! services.rs    — Router handlers (ping, hello, block queries, gossip)
//! peer.rs        — One remote node: hello, heartbeat, typed requests
//! gossip.rs      — Gossip group sizing
//! node.rs        — Network: peer map, admission, discovery
//! catchup.rs     — Majority-consensus block backfill
//! lifecycle.rs   — Boot sequencing state machine
//! ```
//!
//! ## Design Decisions
//!
//! - Every socket goes through the same handshake, so admission is enforced
//!   once, below the application. A stranger never gets to send a request.
//! - JSON on the wire. Messages are small and infrequent; readability when
//!   debugging a live mesh wins over compactness.
//! - The peer map has exactly one writer (the command loop). Everyone else
//!   submits commands, which keeps "one peer per VK" trivially true.
//! - Catchup talks to peers through the `BlockSource` trait, so consensus
//!   and linkage rules are tested without sockets.

pub mod catchup;
pub mod credentials;
pub mod dealer;
pub mod gossip;
pub mod lifecycle;
pub mod messages;
pub mod node;
pub mod peer;
pub mod publisher;
pub mod router;
pub mod services;
pub mod transport;

pub use catchup::{
    majority_threshold, BlockSource, CatchupError, CatchupHandler, CatchupNetwork, CatchupOutcome,
    FetchType,
};
pub use credentials::CredentialsProvider;
pub use dealer::Dealer;
pub use gossip::{gossip_fanout, select_gossip_group};
pub use lifecycle::{Lifecycle, LifecycleError, NodeEvent, NodeState};
pub use messages::{Announcement, LatestBlockInfo, NetworkCommand};
pub use node::{AdmissionError, Network, NetworkError};
pub use peer::Peer;
pub use publisher::{Publisher, Subscriber};
pub use router::{Identity, RequestContext, Router, ServiceTable};
pub use transport::{Authenticator, SecureStream, TransportError};
