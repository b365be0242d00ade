//! Runtime flags controlling lock-stack checking and the monitor cache.
//!
//! All flags can be set either from the command line (`--verify-lock-stack=false`)
//! or from environment variables (`VMKIT_VERIFY_LOCK_STACK=false`), see [`parse_sync_flags`].

use crate::{
    define_flag,
    utils::flags::{self, FlagError},
};

pub struct SyncFlags;

define_flag!(SyncFlags =>
    bool,
    verify_lock_stack,
    cfg!(debug_assertions),
    "Verify lock-stack consistency after every mutation. (default: true in debug builds)"
);

define_flag!(SyncFlags =>
    bool,
    check_lock_owner,
    cfg!(debug_assertions),
    "Assert that lock-stack readers hold a quiescence guarantee for the owning thread. (default: true in debug builds)"
);

define_flag!(SyncFlags =>
    bool,
    use_om_cache,
    true,
    "Cache object -> monitor associations per thread. (default: true)"
);

define_flag!(SyncFlags =>
    bool,
    om_cache_hit_rate,
    false,
    "Collect monitor cache hit-rate statistics. (default: false)"
);

define_flag!(SyncFlags =>
    usize,
    om_cache_report_interval,
    0,
    "Log monitor cache statistics every N lookups, 0 disables reporting. (default: 0)"
);

/// Prefix used for command-line (`--vmkit:name`) and environment (`VMKIT_NAME`) flags.
pub const FLAG_PREFIX: &str = "vmkit";

/// Parse [`SyncFlags`] from the process arguments and environment.
pub fn parse_sync_flags() -> Result<(), FlagError> {
    parse_sync_flags_from(std::env::args(), std::env::vars())
}

pub fn parse_sync_flags_from(
    args: impl Iterator<Item = String>,
    env: impl Iterator<Item = (String, String)>,
) -> Result<(), FlagError> {
    flags::parse_with_prefix::<SyncFlags>(FLAG_PREFIX, args, env)?;

    log::debug!(
        target: "vmkit::flags",
        "sync flags: verify_lock_stack={} check_lock_owner={} use_om_cache={} om_cache_hit_rate={}",
        syncflags_verify_lock_stack(),
        syncflags_check_lock_owner(),
        syncflags_use_om_cache(),
        syncflags_om_cache_hit_rate()
    );

    Ok(())
}
