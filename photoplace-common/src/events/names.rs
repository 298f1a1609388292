//! Lifecycle phase tags and event-name derivation
//!
//! Every stage publishes its lifecycle under names of the form
//! `"<StageName><separator><phaseTag>"`, e.g. `LoadPhotos:start`.
//! Callers may substitute an explicit name for any phase.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::Error;

/// Default separator between stage name and phase tag
pub const DEFAULT_SEPARATOR: &str = ":";

/// Lifecycle phase of a stage run
///
/// Emitted in this order by a successful run:
/// `Start`, `Ini`, `StartGo`, `Run`, `FinishGo`, `End`, `Finish`.
/// `Ini`, `Run` and `End` come from the phase bodies themselves; the runner
/// emits the other four around them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Phase {
    /// Locks held, nothing executed yet
    Start,
    /// Setup is preparing (emitted by the setup phase)
    Ini,
    /// Setup done, execute about to begin
    StartGo,
    /// Execute progress (emitted by the execute phase, possibly many times)
    Run,
    /// Execute done
    FinishGo,
    /// Finalize is wrapping up (emitted by the finalize phase)
    End,
    /// Finalize done, locks about to be released
    Finish,
}

impl Phase {
    /// All phases in emission order
    pub const ALL: [Phase; 7] = [
        Phase::Start,
        Phase::Ini,
        Phase::StartGo,
        Phase::Run,
        Phase::FinishGo,
        Phase::End,
        Phase::Finish,
    ];

    /// Tag used when deriving event names
    pub fn tag(&self) -> &'static str {
        match self {
            Phase::Start => "start",
            Phase::Ini => "ini",
            Phase::StartGo => "startgo",
            Phase::Run => "run",
            Phase::FinishGo => "finishgo",
            Phase::End => "end",
            Phase::Finish => "finish",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for Phase {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Phase::ALL
            .into_iter()
            .find(|phase| phase.tag() == s)
            .ok_or_else(|| Error::InvalidInput(format!("Unknown phase tag: {}", s)))
    }
}

/// Derive the conventional event name for a stage phase
pub fn default_event_name(stage: &str, phase: Phase, separator: &str) -> String {
    format!("{}{}{}", stage, separator, phase.tag())
}

/// Event names for one stage type, with optional per-phase overrides
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventNames {
    stage: String,
    separator: String,
    overrides: HashMap<Phase, String>,
}

impl EventNames {
    /// Names for `stage` using the default separator
    pub fn new(stage: impl Into<String>) -> Self {
        Self::with_separator(stage, DEFAULT_SEPARATOR)
    }

    /// Names for `stage` using a custom separator
    pub fn with_separator(stage: impl Into<String>, separator: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            separator: separator.into(),
            overrides: HashMap::new(),
        }
    }

    /// Change the separator, keeping any overrides
    pub fn separated_by(mut self, separator: impl Into<String>) -> Self {
        self.separator = separator.into();
        self
    }

    /// Replace the derived name of one phase with an explicit name
    pub fn with_override(mut self, phase: Phase, name: impl Into<String>) -> Self {
        self.overrides.insert(phase, name.into());
        self
    }

    /// Stage type tag these names derive from
    pub fn stage(&self) -> &str {
        &self.stage
    }

    /// Separator between stage tag and phase tag
    pub fn separator(&self) -> &str {
        &self.separator
    }

    /// Event name for a phase (override wins over derivation)
    pub fn name(&self, phase: Phase) -> String {
        match self.overrides.get(&phase) {
            Some(name) => name.clone(),
            None => default_event_name(&self.stage, phase, &self.separator),
        }
    }

    /// Event names for every phase, in emission order
    pub fn all(&self) -> Vec<String> {
        Phase::ALL.iter().map(|phase| self.name(*phase)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_event_name() {
        assert_eq!(
            default_event_name("LoadPhotos", Phase::Start, DEFAULT_SEPARATOR),
            "LoadPhotos:start"
        );
        assert_eq!(
            default_event_name("SaveFiles", Phase::FinishGo, "."),
            "SaveFiles.finishgo"
        );
    }

    #[test]
    fn test_phase_tag_roundtrip() {
        for phase in Phase::ALL {
            assert_eq!(phase.tag().parse::<Phase>().unwrap(), phase);
        }
        assert!("bogus".parse::<Phase>().is_err());
    }

    #[test]
    fn test_override_wins() {
        let names = EventNames::new("Geolocate").with_override(Phase::Run, "geotag-progress");
        assert_eq!(names.name(Phase::Run), "geotag-progress");
        assert_eq!(names.name(Phase::End), "Geolocate:end");
        assert_eq!(names.all().len(), 7);
    }
}
