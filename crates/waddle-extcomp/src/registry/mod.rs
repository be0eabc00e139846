//! Component connection registry.
//!
//! Tracks which live sessions serve which component domains. A domain may be
//! served by several redundant sessions; routing entries for the domain stay
//! in place while at least one of them is alive.
//!
//! ## Architecture
//!
//! ```text
//! ComponentProtocol --bind/unbind--> ComponentConnectionRegistry
//!                                        |
//!                                        v
//!                          DashMap<domain, Arc<Vec<ComponentConnection>>>
//!                                        |
//!                                        v
//!                              Weak<dyn Session> per connection
//! ```
//!
//! Writers are serialized by a single mutex and replace a domain's vector
//! wholesale, so readers always see a complete snapshot without locking.

mod connection_registry;

pub use connection_registry::{
    ComponentConnection, ComponentConnectionRegistry, RegistryStatistics, UnbindOutcome,
};
