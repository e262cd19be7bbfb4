//! Round-robin identity selection

/// Picks which identity sends the next value
///
/// Selection is strictly round-robin over the usable identities, starting
/// after the one that sent last. Identities flagged unusable are skipped.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityRotator;

impl IdentityRotator {
    /// Index of the next usable identity after `last`
    ///
    /// `usable[i]` reports whether identity `i` may send. A `last` index that no
    /// longer exists (e.g. after a removal) starts the rotation from the top.
    pub fn next(usable: &[bool], last: Option<usize>) -> Option<usize> {
        let len = usable.len();
        if len == 0 {
            return None;
        }
        let start = match last {
            Some(i) if i < len => i + 1,
            _ => 0,
        };
        (0..len)
            .map(|offset| (start + offset) % len)
            .find(|&i| usable[i])
    }

    /// Whether any identity can still send
    pub fn any_usable(usable: &[bool]) -> bool {
        usable.iter().any(|&u| u)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sequence(usable: &[bool], mut last: Option<usize>, n: usize) -> Vec<usize> {
        let mut picked = Vec::new();
        for _ in 0..n {
            let next = IdentityRotator::next(usable, last).unwrap();
            picked.push(next);
            last = Some(next);
        }
        picked
    }

    #[test]
    fn test_round_robin_from_start() {
        assert_eq!(sequence(&[true, true, true], None, 4), vec![0, 1, 2, 0]);
    }

    #[test]
    fn test_continues_after_last_sender() {
        assert_eq!(sequence(&[true, true, true], Some(1), 3), vec![2, 0, 1]);
    }

    #[test]
    fn test_skips_unusable_identities() {
        assert_eq!(sequence(&[true, false, true], None, 4), vec![0, 2, 0, 2]);
    }

    #[test]
    fn test_single_identity_repeats() {
        assert_eq!(sequence(&[true], Some(0), 3), vec![0, 0, 0]);
    }

    #[test]
    fn test_none_when_nothing_usable() {
        assert_eq!(IdentityRotator::next(&[false, false], Some(0)), None);
        assert_eq!(IdentityRotator::next(&[], None), None);
        assert!(!IdentityRotator::any_usable(&[false, false]));
    }

    #[test]
    fn test_stale_last_index_restarts() {
        assert_eq!(IdentityRotator::next(&[true, true], Some(5)), Some(0));
    }

    #[test]
    fn test_deterministic() {
        let usable = [true, false, true, true];
        assert_eq!(
            IdentityRotator::next(&usable, Some(0)),
            IdentityRotator::next(&usable, Some(0))
        );
    }
}
