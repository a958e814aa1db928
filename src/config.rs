use std::time::Duration;

/// Relay behavior knobs, resolved once at startup and handed to the session
/// and presence-store constructors. Nothing below `main` reads the
/// environment directly.
#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// Broadcast enter/leave notices to the room on join and leave.
    pub notify_on_enter_leave: bool,
    /// How long a room's presence map survives after its last write.
    pub presence_ttl: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            notify_on_enter_leave: true,
            presence_ttl: Duration::from_secs(3600),
        }
    }
}

impl RelayConfig {
    /// Reads `NOTIFY_ON_ENTER_OR_LEAVE` and `PRESENCE_TTL_SECS`, falling back
    /// to the defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let notify_on_enter_leave = dotenv::var("NOTIFY_ON_ENTER_OR_LEAVE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.notify_on_enter_leave);
        let presence_ttl = dotenv::var("PRESENCE_TTL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.presence_ttl);
        Self {
            notify_on_enter_leave,
            presence_ttl,
        }
    }
}
