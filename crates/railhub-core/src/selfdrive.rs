//! Self-drive state machine for train hubs.
//!
//! Purely reactive: it is fed power changes and color samples and answers
//! with the action the train controller should take. It never touches a
//! session itself.
//!
//! ```text
//! Idle --(enabled, power != 0)--> Running --(debounced stop color)--> Stopping --> Idle
//!   ^                               |
//!   +-----(disabled or power 0)-----+
//! ```

use serde::{Deserialize, Serialize};

use railhub_types::Color;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelfDriveState {
    /// Manual mode, or stopped.
    #[default]
    Idle,
    /// Self-drive enabled and the train is moving.
    Running,
    /// A stop color was hit and the zero-power command is on its way.
    Stopping,
}

impl std::fmt::Display for SelfDriveState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelfDriveConfig {
    /// Consecutive identical samples needed before a color counts.
    pub debounce_window: u32,
    /// Marker colors that stop the train.
    pub stop_colors: Vec<Color>,
    /// Marker colors that reverse the train.
    pub reverse_colors: Vec<Color>,
}

impl Default for SelfDriveConfig {
    fn default() -> Self {
        Self {
            debounce_window: 3,
            stop_colors: vec![Color::Red],
            reverse_colors: Vec::new(),
        }
    }
}

impl SelfDriveConfig {
    #[must_use]
    pub fn debounce_window(mut self, samples: u32) -> Self {
        self.debounce_window = samples;
        self
    }

    #[must_use]
    pub fn stop_colors(mut self, colors: Vec<Color>) -> Self {
        self.stop_colors = colors;
        self
    }

    #[must_use]
    pub fn reverse_colors(mut self, colors: Vec<Color>) -> Self {
        self.reverse_colors = colors;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.debounce_window == 0 {
            return Err(Error::invalid_config("debounce_window must be at least 1"));
        }
        if let Some(color) = self
            .stop_colors
            .iter()
            .chain(&self.reverse_colors)
            .find(|c| !c.is_marker())
        {
            return Err(Error::invalid_config(format!(
                "{color} cannot be used as a track marker"
            )));
        }
        if let Some(color) = self.stop_colors.iter().find(|c| self.reverse_colors.contains(c)) {
            return Err(Error::invalid_config(format!(
                "{color} is both a stop and a reverse color"
            )));
        }
        Ok(())
    }
}

/// Reports a color once it has been seen `window` times in a row.
#[derive(Debug, Clone)]
pub struct Debouncer {
    window: u32,
    current: Color,
    run: u32,
}

impl Debouncer {
    pub fn new(window: u32) -> Self {
        Self {
            window: window.max(1),
            current: Color::None,
            run: 0,
        }
    }

    /// Feed one sample. Returns the color exactly once per run, on the
    /// sample that completes the window. `Color::None` breaks any run.
    pub fn observe(&mut self, color: Color) -> Option<Color> {
        if color == Color::None {
            self.clear();
            return None;
        }
        if color == self.current {
            self.run = self.run.saturating_add(1);
        } else {
            self.current = color;
            self.run = 1;
        }
        (self.run == self.window).then_some(color)
    }

    pub fn clear(&mut self) {
        self.current = Color::None;
        self.run = 0;
    }

    /// Color of the run in progress, if any.
    pub fn current(&self) -> Option<Color> {
        (self.run > 0).then_some(self.current)
    }
}

/// What the controller must do after a pattern hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternAction {
    /// Send zero power, then call [`SelfDrive::finish_stop`].
    Stop,
    /// Send the current power with the sign flipped.
    Reverse,
}

/// A state change, reported so callers can publish it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: SelfDriveState,
    pub to: SelfDriveState,
}

#[derive(Debug, Clone)]
pub struct SelfDrive {
    config: SelfDriveConfig,
    enabled: bool,
    state: SelfDriveState,
    power: i8,
    debouncer: Debouncer,
}

impl SelfDrive {
    pub fn new(config: SelfDriveConfig) -> Self {
        let debouncer = Debouncer::new(config.debounce_window);
        Self {
            config,
            enabled: false,
            state: SelfDriveState::Idle,
            power: 0,
            debouncer,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn state(&self) -> SelfDriveState {
        self.state
    }

    pub fn last_color(&self) -> Option<Color> {
        self.debouncer.current()
    }

    fn go(&mut self, to: SelfDriveState) -> Option<Transition> {
        let from = self.state;
        self.state = to;
        (from != to).then_some(Transition { from, to })
    }

    fn resting_state(&self) -> SelfDriveState {
        if self.enabled && self.power != 0 {
            SelfDriveState::Running
        } else {
            SelfDriveState::Idle
        }
    }

    /// Switch self-drive on or off. Turning it off always lands in `Idle`.
    pub fn set_enabled(&mut self, enabled: bool) -> Option<Transition> {
        self.enabled = enabled;
        if !enabled {
            return self.go(SelfDriveState::Idle);
        }
        let next = self.resting_state();
        self.go(next)
    }

    /// Record a commanded power.
    pub fn on_power(&mut self, power: i8) -> Option<Transition> {
        self.power = power;
        let next = self.resting_state();
        self.go(next)
    }

    /// Feed a color sample. Only a debounced hit while `Running` acts.
    pub fn on_color(&mut self, color: Color) -> Option<PatternAction> {
        let hit = self.debouncer.observe(color)?;
        if self.state != SelfDriveState::Running {
            return None;
        }
        if self.config.stop_colors.contains(&hit) {
            self.go(SelfDriveState::Stopping);
            Some(PatternAction::Stop)
        } else if self.config.reverse_colors.contains(&hit) {
            Some(PatternAction::Reverse)
        } else {
            None
        }
    }

    /// The stop command went out: the train is now at rest.
    pub fn finish_stop(&mut self) -> Option<Transition> {
        if self.state != SelfDriveState::Stopping {
            return None;
        }
        self.power = 0;
        self.go(SelfDriveState::Idle)
    }

    /// Power the controller should send for a reverse action.
    pub fn reversed_power(&self) -> i8 {
        self.power.saturating_neg()
    }
}
