/// Offer phases of a provided service instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerPhase {
    Down,
    InitialWait,
    Repetition,
    Main,
}

impl ServerPhase {
    pub const ALL: [ServerPhase; 4] = [
        ServerPhase::Down,
        ServerPhase::InitialWait,
        ServerPhase::Repetition,
        ServerPhase::Main,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ServerPhase::Down => "Down",
            ServerPhase::InitialWait => "InitialWait",
            ServerPhase::Repetition => "Repetition",
            ServerPhase::Main => "Main",
        }
    }

    /// Phases never move backwards except to Down.
    pub fn is_valid_change(&self, to: ServerPhase) -> bool {
        use ServerPhase::*;
        matches!(
            (self, to),
            (Down, InitialWait)
                | (InitialWait, Down)
                | (InitialWait, Repetition)
                | (InitialWait, Main)
                | (Repetition, Down)
                | (Repetition, Main)
                | (Main, Down)
        )
    }

    /// Whether the instance is announced on the network in this phase.
    pub fn is_offering(&self) -> bool {
        matches!(self, ServerPhase::Repetition | ServerPhase::Main)
    }
}
