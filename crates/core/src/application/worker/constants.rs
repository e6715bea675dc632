// Worker constants (no magic values)
use std::time::Duration;

/// Poll interval when no job is claimable (5s)
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Sleep duration after a tick error before polling again (1s)
pub const ERROR_RECOVERY_SLEEP_DURATION: Duration = Duration::from_secs(1);

/// Discovery is re-run this many times per tick when claims are lost
pub const MAX_CLAIM_ATTEMPTS_PER_TICK: usize = 3;
