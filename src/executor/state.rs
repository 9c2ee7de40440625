//! Install lifecycle states.

use crate::formula::Phase;

/// State of one formula's installation.
///
/// `Pending → Configuring → Building → Installing → DocBuilding → Done`,
/// with `Failed` reachable from anywhere. Phases with no declared steps are
/// skipped, so a trace never contains a state whose phase ran nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Pending,
    Configuring,
    Building,
    Installing,
    DocBuilding,
    Done,
    Failed,
}

impl State {
    /// The state entered when a step of the given phase starts.
    pub fn for_phase(phase: Phase) -> Self {
        match phase {
            Phase::Configure => State::Configuring,
            Phase::Build => State::Building,
            Phase::Install => State::Installing,
            Phase::Doc => State::DocBuilding,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, State::Done | State::Failed)
    }

    pub fn name(&self) -> &'static str {
        match self {
            State::Pending => "pending",
            State::Configuring => "configuring",
            State::Building => "building",
            State::Installing => "installing",
            State::DocBuilding => "doc-building",
            State::Done => "done",
            State::Failed => "failed",
        }
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
