/// Search phases of a required service instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FindPhase {
    Down,
    InitialWait,
    Repetition,
    Main,
}

impl FindPhase {
    pub const ALL: [FindPhase; 4] = [FindPhase::Down, FindPhase::InitialWait, FindPhase::Repetition, FindPhase::Main];

    pub fn as_str(&self) -> &'static str {
        match self {
            FindPhase::Down => "Down",
            FindPhase::InitialWait => "InitialWait",
            FindPhase::Repetition => "Repetition",
            FindPhase::Main => "Main",
        }
    }

    pub fn is_valid_change(&self, to: FindPhase) -> bool {
        use FindPhase::*;
        matches!(
            (self, to),
            (Down, InitialWait)
                | (Down, Main)
                | (InitialWait, Down)
                | (InitialWait, Repetition)
                | (InitialWait, Main)
                | (Repetition, Down)
                | (Repetition, Main)
                | (Main, Down)
        )
    }

    /// Phases in which FindService messages still go out.
    pub fn is_searching(&self) -> bool {
        matches!(self, FindPhase::InitialWait | FindPhase::Repetition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_down_may_jump_to_main() {
        assert!(FindPhase::Down.is_valid_change(FindPhase::Main));
        assert!(!FindPhase::Main.is_valid_change(FindPhase::InitialWait));
        assert!(!FindPhase::Repetition.is_valid_change(FindPhase::InitialWait));

        let valid = FindPhase::ALL
            .iter()
            .flat_map(|from| FindPhase::ALL.iter().map(move |to| (*from, *to)))
            .filter(|(from, to)| from.is_valid_change(*to))
            .count();
        assert_eq!(valid, 8);
    }
}
