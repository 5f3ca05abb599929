pub mod config;
pub mod error;
pub mod ipv4;
pub mod model;
pub mod persist;
pub mod pool;
pub mod reconcile;
pub mod server;

pub use error::{EngineError, Result};
pub use model::{HostConfig, Lease, LeaseBatch, ListenConfig, OptionValue, Request, Response};
pub use pool::{Subnet, SubnetConfig};
pub use reconcile::ObjectCache;
pub use server::Server;
