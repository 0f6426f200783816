use netwarden_core::store::PowerPolicy;

/// Linux power management suspends the whole machine or throttles devices;
/// it has no per-app battery optimisation that kills background services.
/// The service runs as a root daemon, so the only thing that stops it is its
/// service manager or a signal, both of which go through `shutdown_signal`.
pub struct LinuxPowerPolicy;

impl PowerPolicy for LinuxPowerPolicy {
    fn would_kill_background_service(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_daemon_survives_power_management() {
        assert!(!LinuxPowerPolicy.would_kill_background_service());
    }
}
