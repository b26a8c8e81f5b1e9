//! Reconnect inhibition for the push channel.
//!
//! After a session fails or closes, the gate suppresses reconnect attempts for
//! a fixed number of scheduler ticks, then permits exactly one attempt.

/// Default number of ticks to wait after a failed session.
pub const DEFAULT_INHIBIT_CYCLES: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectGate {
    inhibit_cycles: u32,
    remaining: u32,
}

impl Default for ReconnectGate {
    fn default() -> Self {
        Self::new(DEFAULT_INHIBIT_CYCLES)
    }
}

impl ReconnectGate {
    /// A fresh gate permits an immediate first attempt.
    pub fn new(inhibit_cycles: u32) -> Self {
        Self {
            inhibit_cycles,
            remaining: 0,
        }
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    pub fn is_inhibited(&self) -> bool {
        self.remaining > 0
    }

    /// Arm the cooldown. Called once per failed or closed session.
    pub fn on_failure(&mut self) {
        self.remaining = self.inhibit_cycles;
    }

    /// Called once per tick while the session is closed.
    /// Returns `true` when a reconnect attempt is permitted on this tick.
    pub fn on_tick(&mut self) -> bool {
        if self.remaining > 0 {
            self.remaining -= 1;
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_gate_allows_first_attempt() {
        let mut gate = ReconnectGate::new(5);
        assert!(gate.on_tick());
    }

    #[test]
    fn failure_inhibits_for_configured_cycles() {
        let mut gate = ReconnectGate::new(5);
        gate.on_failure();
        let attempts: Vec<bool> = (0..6).map(|_| gate.on_tick()).collect();
        assert_eq!(attempts, vec![false, false, false, false, false, true]);
    }

    #[test]
    fn zero_cycles_never_inhibits() {
        let mut gate = ReconnectGate::new(0);
        gate.on_failure();
        assert!(!gate.is_inhibited());
        assert!(gate.on_tick());
    }

    #[test]
    fn repeated_failure_rearms() {
        let mut gate = ReconnectGate::new(2);
        gate.on_failure();
        assert!(!gate.on_tick());
        gate.on_failure();
        assert_eq!(gate.remaining(), 2);
    }
}
