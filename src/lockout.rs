/*! Network-wide in-motion lockout.

When the coach is moving, the bus broadcasts a lockout level and
controllers are expected to sit on their hands: level 1 blocks mobile
things (slides, awnings), level 2 additionally blocks hazardous
switching. The latch only ratchets up on observation; silence lets it
step back down one level every five seconds.
 */
use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::info;

use crate::{Error, Result};

/// One de-escalation step per this much silence.
const DECAY: Duration = Duration::from_secs(5);

/// Highest defined lockout level.
const MAX_LEVEL: u8 = 3;

/// What a command does, as far as the lockout cares.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CommandClass {
    /// Lights, HVAC setpoints; never blocked.
    Normal,
    /// Moves something: H-bridge motors. Blocked at level 1 and up.
    Mobile,
    /// Switches load circuits. Blocked at level 2 and up.
    Hazardous,
}

struct Observed {
    level: u8,
    at: Instant,
}

/// The latched lockout level, shared across a bridge.
pub struct Lockout {
    observed: Mutex<Observed>,
    decay: Duration,
}

impl Lockout {
    /// New latch at level 0.
    pub fn new() -> Self {
        Self::with_decay(DECAY)
    }

    fn with_decay(decay: Duration) -> Self {
        Self {
            observed: Mutex::new(Observed {
                level: 0,
                at: Instant::now(),
            }),
            decay,
        }
    }

    /// Record an observed level. Ratchets upward only; any
    /// observation restarts the silence clock.
    pub fn observe(&self, level: u8) {
        let mut obs = self.observed.lock().unwrap();
        let current = Self::decayed(&obs, self.decay);
        let new = current.max(level.min(MAX_LEVEL));
        if new > current {
            info!("in-motion lockout level {new}");
        }
        obs.level = new;
        obs.at = Instant::now();
    }

    fn decayed(obs: &Observed, decay: Duration) -> u8 {
        let steps = obs.at.elapsed().as_millis() / decay.as_millis().max(1);
        obs.level.saturating_sub(steps.min(u128::from(MAX_LEVEL)) as u8)
    }

    /// The effective level right now, decay applied.
    pub fn level(&self) -> u8 {
        let obs = self.observed.lock().unwrap();
        Self::decayed(&obs, self.decay)
    }

    /// Error out if the current level blocks this class of command.
    pub fn check(&self, class: CommandClass) -> Result<()> {
        let level = self.level();
        let blocked = match class {
            CommandClass::Normal => false,
            CommandClass::Mobile => level >= 1,
            CommandClass::Hazardous => level >= 2,
        };
        if blocked {
            return Err(Error::Command(format!(
                "in-motion lockout active (level {level})"
            )));
        }
        Ok(())
    }
}

impl Default for Lockout {
    fn default() -> Self {
        Self::new()
    }
}
