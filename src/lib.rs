//! A replicated state machine for a small vaccine-site database: N server
//! replicas execute an identical, totally ordered stream of client requests,
//! so any number of concurrent clients observe the same outputs no matter
//! which replica answers, and the system keeps serving through up to N - 1
//! simulated replica failures.
//!
//! Replica coordination follows the classic state-machine approach:
//!
//! - **Agreement**: every broadcast is acknowledged by every live replica
//!   before the client's next broadcast, after "Fault-Tolerant Broadcasts"
//!   by Schneider, Gries, and Schlichting. A failure notice counts as the
//!   acknowledgment that demotes its sender.
//! - **Order**: requests carry Lamport timestamps and execute in ascending
//!   `(rseqno, client_id)` order once stable, as described in Schneider's
//!   "Implementing Fault-Tolerant Services Using the State Machine
//!   Approach".
//! - **Liveness**: each client broadcasts periodic no-op dummy requests so
//!   every replica's stability test always holds a recent sequence number
//!   from every client.
//!
//! ## Example
//!
//! ```
//! use lockstep::{ClientConfig, ClientContext, Message, Replica, ReplicaConfig};
//!
//! // Three replicas on OS-assigned loopback ports.
//! let replicas: Vec<Replica> = (0..3)
//!     .map(|_| {
//!         Replica::spawn(ReplicaConfig {
//!             bind_addr: "127.0.0.1:0".parse().unwrap(),
//!             test_log_dir: None,
//!         })
//!         .unwrap()
//!     })
//!     .collect();
//! let addrs: Vec<_> = replicas.iter().map(|r| r.local_addr()).collect();
//!
//! // Every replica executes the same request stream in the same order, so
//! // the client sees the same database no matter which replica answers.
//! let client = ClientContext::connect(&addrs, ClientConfig::default()).unwrap();
//! let listing = client.request(Message::list()).unwrap();
//! assert!(listing.contains("Harvard University"));
//!
//! // One replica may fail without interrupting service.
//! replicas[0].inject_failure();
//! assert_eq!(client.request(Message::list()).unwrap(), listing);
//! client.quit();
//! ```

pub mod app;
pub mod client;
pub mod clock;
pub mod replica;
pub mod wire;

pub use app::{Site, SiteDb};
pub use client::{ClientConfig, ClientContext};
pub use clock::LogicalClock;
pub use replica::{Replica, ReplicaConfig};
pub use wire::{Channel, Message, Transaction, WireError, WireResult};

/// First port of a replica set; `servers` binds N consecutive ports from
/// here.
pub const BASE_PORT: u16 = 8892;
