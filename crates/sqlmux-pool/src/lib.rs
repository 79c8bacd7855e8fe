//! # sqlmux-pool
//!
//! Connection pooling engine for the driver.
//!
//! The [`ConnectionFactory`] is the entry point: it maps each distinct
//! [`PoolKey`] (canonical configuration plus optional auth context) to a
//! [`PoolGroup`], which in turn owns at most one live [`ConnectionPool`].
//! Pools hand out [`PooledConnection`] guards that return their physical
//! connection on drop; broken connections are destroyed instead of re-idled.
//!
//! A background sweep retires empty pools and walks inactive groups through
//! `Active -> Idle -> Disabled` before releasing them; disabled groups are
//! replaced copy-on-write, never mutated in place. Non-pooled opens go
//! through a fixed-slot creation throttle so a burst of direct connections
//! cannot stampede the server.
//!
//! Transport establishment itself lives behind the [`ConnectionOpener`]
//! trait; this crate never dials or negotiates anything.

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod factory;
pub mod group;
pub mod key;
pub mod opener;
pub mod pool;
mod throttle;

pub use config::{FactoryOptions, PoolConfig};
pub use error::PoolError;
pub use factory::{ConnectionFactory, FactoryStats};
pub use group::PoolGroup;
pub use key::PoolKey;
pub use opener::ConnectionOpener;
pub use pool::{ConnectionPool, PoolState, PooledConnection};
