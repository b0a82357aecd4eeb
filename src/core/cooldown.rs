// src/core/cooldown.rs
use crate::types::SignalSide;
use crate::utils::clock::Clock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastSignal {
    pub side: SignalSide,
    pub at_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CooldownVerdict {
    Allowed,
    Suppressed { remaining_ms: i64 },
}

/// Per-symbol entry rate limiter.
///
/// Inside the window a repeat of the last executed side is suppressed; the
/// opposite side always passes.
pub struct SignalCooldown {
    window_ms: i64,
    clock: Arc<dyn Clock>,
    last: Option<LastSignal>,
}

impl SignalCooldown {
    pub fn new(window_secs: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            window_ms: i64::try_from(window_secs.saturating_mul(1_000)).unwrap_or(i64::MAX),
            clock,
            last: None,
        }
    }

    pub fn check(&self, side: SignalSide) -> CooldownVerdict {
        let Some(last) = self.last else {
            return CooldownVerdict::Allowed;
        };
        if side == SignalSide::None || side != last.side {
            return CooldownVerdict::Allowed;
        }
        let elapsed = self.clock.now_ms() - last.at_ms;
        if elapsed < self.window_ms {
            CooldownVerdict::Suppressed {
                remaining_ms: self.window_ms - elapsed,
            }
        } else {
            CooldownVerdict::Allowed
        }
    }

    pub fn record(&mut self, side: SignalSide) {
        self.last = Some(LastSignal {
            side,
            at_ms: self.clock.now_ms(),
        });
    }

    pub fn last(&self) -> Option<LastSignal> {
        self.last
    }

    pub fn restore(&mut self, last: Option<LastSignal>) {
        self.last = last;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::clock::ManualClock;

    fn cooldown(secs: u64) -> (SignalCooldown, ManualClock) {
        let clock = ManualClock::new(1_000_000);
        (SignalCooldown::new(secs, Arc::new(clock.clone())), clock)
    }

    #[test]
    fn first_signal_is_allowed() {
        let (c, _) = cooldown(60);
        assert_eq!(c.check(SignalSide::Long), CooldownVerdict::Allowed);
    }

    #[test]
    fn same_side_is_suppressed_inside_window() {
        let (mut c, clock) = cooldown(60);
        c.record(SignalSide::Long);
        clock.advance_secs(10);
        assert_eq!(
            c.check(SignalSide::Long),
            CooldownVerdict::Suppressed { remaining_ms: 50_000 }
        );
        clock.advance_secs(50);
        assert_eq!(c.check(SignalSide::Long), CooldownVerdict::Allowed);
    }

    #[test]
    fn opposite_side_passes_inside_window() {
        let (mut c, clock) = cooldown(60);
        c.record(SignalSide::Long);
        clock.advance_secs(1);
        assert_eq!(c.check(SignalSide::Short), CooldownVerdict::Allowed);
    }

    #[test]
    fn restored_memory_applies() {
        let (mut c, _) = cooldown(60);
        c.restore(Some(LastSignal {
            side: SignalSide::Short,
            at_ms: 1_000_000,
        }));
        assert!(matches!(c.check(SignalSide::Short), CooldownVerdict::Suppressed { .. }));
    }
}
