//! Service records and the service registry
//!
//! A [`Svc`] is the primary entity of the supervisor: one supervised
//! command, keyed by (command path, instance tag).  The [`Registry`] is an
//! arena of records addressed by stable integer [`SvcId`]s, so timers and
//! events can refer to services without holding pointers into the arena.

mod record;
mod registry;

pub use record::{
    BlockReason, EnvFile, LogConfig, LogTarget, PidfileConf, Svc, SvcKind, SvcState,
    DEFAULT_KILLDELAY,
};
pub use registry::{Registry, SvcId};
