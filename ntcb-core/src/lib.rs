//! NTCB core - identity, registration and bus plumbing shared by every
//! component of the fleet (authority, daemons, bots).
//!
//! - [`identity`]: snowflake ids seeded by the operator's node slot
//! - [`header`]: the per-process identity record and its redacted form
//! - [`registration`]: the `/reg` handshake with the authority
//! - [`bus`]: the MQTT session, publish/subscribe and lifecycle broadcasts
//! - [`heartbeat`]: periodic `Stat` reports
//! - [`lifecycle`]: join / serve / leave, and the shared component context

pub mod bus;
pub mod config;
pub mod header;
pub mod heartbeat;
pub mod identity;
pub mod lifecycle;
pub mod logging;
pub mod messages;
pub mod registration;
pub mod signals;
pub mod topics;

#[cfg(test)]
pub(crate) mod testing;

pub use bus::{BusClient, BusError, BusLink, Handler, Inbound, Publisher};
pub use config::{load_config, BusyPolicy, ComponentConfig};
pub use header::{ComponentHeader, PublicHeader};
pub use lifecycle::{exit_code_for, join_fleet, leave_fleet, ComponentContext, Fleet, JoinError};
pub use messages::ComponentKind;
