//! Flood routing: deduplication, hop/TTL/loop guards, and the per-envelope
//! forwarding decision.
//!
//! - `seen`: bounded dedup cache of envelope ids
//! - `router`: pure decision engine producing a `RouteAction`

pub mod router;
pub mod seen;

pub use router::{ControlKind, DropReason, RouteAction, Router, RouterStats};
pub use seen::{SeenSet, DEFAULT_SEEN_CAPACITY};
