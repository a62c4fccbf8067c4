use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoteOutcome {
    /// One checksum was reported by strictly more replicas than any other.
    Consensus(String),
    /// Two or more checksums share the highest count.
    Tie,
    NoVotes,
}

/// Strict-plurality vote over the checksums reported for one file.
pub fn vote<'a, I>(checksums: I) -> VoteOutcome
where
    I: IntoIterator<Item = &'a str>,
{
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for checksum in checksums {
        *counts.entry(checksum).or_default() += 1;
    }

    let Some(best) = counts.values().copied().max() else {
        return VoteOutcome::NoVotes;
    };

    let mut leaders = counts.iter().filter(|(_, count)| **count == best);
    match (leaders.next(), leaders.next()) {
        (Some((checksum, _)), None) => VoteOutcome::Consensus(checksum.to_string()),
        _ => VoteOutcome::Tie,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plurality_wins() {
        assert_eq!(
            vote(["abc", "abc", "xyz"]),
            VoteOutcome::Consensus("abc".to_string())
        );
        assert_eq!(
            vote(["abc", "abc", "xyz", "xyz", "xyz", "def"]),
            VoteOutcome::Consensus("xyz".to_string())
        );
        assert_eq!(vote(["only"]), VoteOutcome::Consensus("only".to_string()));
    }

    #[test]
    fn test_tie_and_empty() {
        assert_eq!(vote(["abc", "xyz"]), VoteOutcome::Tie);
        assert_eq!(vote(["a", "a", "b", "b", "c"]), VoteOutcome::Tie);
        assert_eq!(vote(std::iter::empty()), VoteOutcome::NoVotes);
    }
}
