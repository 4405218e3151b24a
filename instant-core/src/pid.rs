//! Position identifiers (PIDs) for the Logoot sequence CRDT.
//!
//! A PID is a non-empty path of levels, each level a `(digit, site)` pair.
//! PIDs are totally ordered lexicographically, level by level (digit first,
//! site as tie-break), with a strict prefix sorting before its extensions:
//!
//! ```text
//!   [(5,a)]  <  [(5,a),(1,b)]  <  [(5,b)]  <  [(6,a)]
//! ```
//!
//! That is exactly the ordering `Vec<Level>` already has in Rust, so `Ord`
//! is derived rather than hand-written.
//!
//! Every document is bounded by two sentinels, [`Pid::low`] and
//! [`Pid::high`]. New identifiers are produced by [`generate`], which bisects
//! the digit gap between two neighbours and tags the new level with the
//! caller's site, so concurrent generators never collide.
//!
//! Reference: Weiss, Urso & Molli — Logoot: A Scalable Optimistic Replication
//! Algorithm for Collaborative Editing (ICDCS 2009)

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Participant identifier, assigned by the relay server.
pub type SiteId = u32;

/// Largest digit used at any level. The high sentinel sits here.
///
/// Kept below 2^53 so digits survive JSON consumers that store numbers as
/// doubles.
pub const MAX_DIGIT: u64 = 100_000_000_000;

/// One level of a PID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "(u64, SiteId)", into = "(u64, SiteId)")]
pub struct Level {
    pub digit: u64,
    pub site: SiteId,
}

impl Level {
    pub const fn new(digit: u64, site: SiteId) -> Self {
        Self { digit, site }
    }
}

impl From<(u64, SiteId)> for Level {
    fn from((digit, site): (u64, SiteId)) -> Self {
        Self { digit, site }
    }
}

impl From<Level> for (u64, SiteId) {
    fn from(level: Level) -> Self {
        (level.digit, level.site)
    }
}

/// Position identifier. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<Level>", into = "Vec<Level>")]
pub struct Pid(Vec<Level>);

impl Pid {
    /// Build a PID from its levels. Fails on an empty path.
    pub fn from_levels(levels: Vec<Level>) -> Result<Self, PidError> {
        if levels.is_empty() {
            return Err(PidError::Empty);
        }
        Ok(Self(levels))
    }

    /// Single-level PID.
    pub fn single(digit: u64, site: SiteId) -> Self {
        Self(vec![Level::new(digit, site)])
    }

    /// Low sentinel: sorts before every content identifier.
    pub fn low(site: SiteId) -> Self {
        Self::single(0, site)
    }

    /// High sentinel: sorts after every content identifier.
    pub fn high(site: SiteId) -> Self {
        Self::single(MAX_DIGIT, site)
    }

    pub fn levels(&self) -> &[Level] {
        &self.0
    }

    /// Number of levels.
    pub fn depth(&self) -> usize {
        self.0.len()
    }

    /// Site that minted this identifier (the tag on its last level).
    pub fn site(&self) -> SiteId {
        // Non-empty by construction.
        self.0[self.0.len() - 1].site
    }
}

impl TryFrom<Vec<Level>> for Pid {
    type Error = PidError;

    fn try_from(levels: Vec<Level>) -> Result<Self, Self::Error> {
        Self::from_levels(levels)
    }
}

impl From<Pid> for Vec<Level> {
    fn from(pid: Pid) -> Self {
        pid.0
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, level) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "[{},{}]", level.digit, level.site)?;
        }
        write!(f, "]")
    }
}

/// Identifier errors. Everything except [`PidError::Empty`] is an ordering
/// violation raised by [`generate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PidError {
    /// A PID must have at least one level.
    Empty,
    /// Both bounds are the same identifier.
    Equal(Pid),
    /// The left bound sorts after the right bound.
    Inverted { left: Pid, right: Pid },
    /// No identifier tagged with the caller's site fits between the bounds.
    Adjacent { left: Pid, right: Pid },
    /// The constructed identifier fell outside its bounds.
    Escaped { left: Pid, right: Pid, generated: Pid },
}

impl PidError {
    pub fn is_ordering_violation(&self) -> bool {
        !matches!(self, Self::Empty)
    }
}

impl fmt::Display for PidError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "PID has no levels"),
            Self::Equal(pid) => write!(f, "Ordering violation: bounds are equal: {pid}"),
            Self::Inverted { left, right } => {
                write!(f, "Ordering violation: left PID is greater than right PID: {left} > {right}")
            }
            Self::Adjacent { left, right } => {
                write!(f, "Ordering violation: no room between adjacent PIDs {left} and {right}")
            }
            Self::Escaped { left, right, generated } => write!(
                f,
                "Ordering violation: generated PID {generated} is not between {left} and {right}"
            ),
        }
    }
}

impl std::error::Error for PidError {}

/// Three-way comparison. Same as `a.cmp(b)`.
pub fn compare(a: &Pid, b: &Pid) -> Ordering {
    a.cmp(b)
}

/// Generate a PID `p` with `left < p < right`, tagged with `site`.
///
/// Walks the levels from the root. While the prefix built so far still equals
/// a bound's prefix, that bound constrains the next level; once the prefix has
/// moved strictly past a bound it no longer does. A missing left level counts
/// as digit 0, a missing (or no longer constraining) right level as
/// [`MAX_DIGIT`]. The first level with a digit gap wider than one receives the
/// midpoint; otherwise the left level is copied and the walk descends.
pub fn generate(site: SiteId, left: &Pid, right: &Pid) -> Result<Pid, PidError> {
    match left.cmp(right) {
        Ordering::Equal => return Err(PidError::Equal(left.clone())),
        Ordering::Greater => {
            return Err(PidError::Inverted {
                left: left.clone(),
                right: right.clone(),
            })
        }
        Ordering::Less => {}
    }

    let mut levels = Vec::with_capacity(left.depth().max(right.depth()) + 1);
    let mut tight_left = true;
    let mut tight_right = true;
    let mut depth = 0;

    loop {
        let l = if tight_left { left.0.get(depth).copied() } else { None };
        let r = if tight_right {
            match right.0.get(depth) {
                Some(r) => Some(*r),
                // Prefix equals all of `right`: anything deeper sorts after it.
                None => {
                    return Err(PidError::Adjacent {
                        left: left.clone(),
                        right: right.clone(),
                    })
                }
            }
        } else {
            None
        };

        let lo = l.map_or(0, |l| l.digit);
        let hi = r.map_or(MAX_DIGIT, |r| r.digit);

        if hi > lo && hi - lo > 1 {
            levels.push(Level::new(lo + (hi - lo) / 2, site));
            break;
        }

        let next = match (l, r) {
            (Some(l), _) => l,
            (None, Some(r)) if r.digit == 0 => r,
            (None, _) => Level::new(0, site),
        };
        tight_left = l == Some(next);
        tight_right = r == Some(next);
        levels.push(next);
        depth += 1;
    }

    let generated = Pid(levels);
    if !(left < &generated && &generated < right) {
        return Err(PidError::Escaped {
            left: left.clone(),
            right: right.clone(),
            generated,
        });
    }
    log::trace!("generated {generated} between {left} and {right}");
    Ok(generated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const CID: SiteId = 1;
    const CID2: SiteId = 2;

    fn pid(levels: &[(u64, SiteId)]) -> Pid {
        Pid::from_levels(levels.iter().map(|&l| Level::from(l)).collect()).unwrap()
    }

    #[test]
    fn test_compare() {
        assert_eq!(compare(&pid(&[(1, 0)]), &pid(&[(2, 0)])), Ordering::Less);
        assert_eq!(
            compare(&pid(&[(1, 0), (2, 0)]), &pid(&[(1, 0), (2, 0), (3, 0)])),
            Ordering::Less
        );
        assert_eq!(compare(&pid(&[(5, 0)]), &pid(&[(2, 0)])), Ordering::Greater);
        assert_eq!(compare(&pid(&[(2, 0), (1, 0)]), &pid(&[(2, 0)])), Ordering::Greater);
        assert_eq!(compare(&pid(&[(2, 3)]), &pid(&[(2, 3)])), Ordering::Equal);
    }

    #[test]
    fn test_site_breaks_digit_ties() {
        assert!(pid(&[(4, CID)]) < pid(&[(4, CID2)]));
        assert!(pid(&[(4, CID2)]) < pid(&[(5, CID)]));
        assert!(pid(&[(4, CID), (9, CID)]) < pid(&[(4, CID2)]));
    }

    #[test]
    fn test_sentinels_bound_content() {
        let low = Pid::low(7);
        let high = Pid::high(7);
        let p = generate(3, &low, &high).unwrap();
        assert!(low < p && p < high);
        assert_eq!(p.depth(), 1);
        assert_eq!(p.site(), 3);
    }

    #[test]
    fn test_generate_preserves_order() {
        let left = pid(&[(1, CID), (2, CID), (3, CID)]);
        let right = pid(&[(1, CID), (2, CID2), (4, CID)]);

        let p = generate(CID, &left, &right).unwrap();
        let p2 = generate(CID, &p, &right).unwrap();

        assert!(left < p);
        assert!(p < p2);
        assert!(p2 < right);
    }

    #[test]
    fn test_generate_splits_at_first_wide_gap() {
        let left = pid(&[(10, CID)]);
        let right = pid(&[(20, CID2)]);
        assert_eq!(generate(9, &left, &right).unwrap(), pid(&[(15, 9)]));
    }

    #[test]
    fn test_generate_descends_when_digits_adjacent() {
        let left = pid(&[(10, CID)]);
        let right = pid(&[(11, CID)]);
        let p = generate(9, &left, &right).unwrap();
        assert_eq!(p, pid(&[(10, CID), (MAX_DIGIT / 2, 9)]));
    }

    #[test]
    fn test_generate_below_an_extension_of_left() {
        // right extends left; the new PID must slot under right's next level
        let left = pid(&[(5, CID)]);
        let right = pid(&[(5, CID), (1, CID2)]);
        let p = generate(CID2, &left, &right).unwrap();
        assert!(left < p && p < right);
    }

    #[test]
    fn test_generate_follows_zero_digit_path_of_right() {
        let left = pid(&[(5, 1)]);
        let right = pid(&[(5, 1), (0, 4), (40, 4)]);
        let p = generate(9, &left, &right).unwrap();
        assert!(left < p && p < right);
    }

    #[test]
    fn test_adjacent_pids_error() {
        let left = pid(&[(1, CID), (2, CID)]);
        let right = pid(&[(1, CID), (2, CID), (0, CID)]);
        let err = generate(CID, &left, &right).unwrap_err();
        assert!(matches!(err, PidError::Adjacent { .. }));
        assert!(err.is_ordering_violation());
    }

    #[test]
    fn test_bad_ordering_error() {
        let left = pid(&[(1, CID), (2, CID), (4, CID)]);
        let right = pid(&[(1, CID), (2, CID), (3, CID)]);
        assert!(matches!(
            generate(CID, &left, &right),
            Err(PidError::Inverted { .. })
        ));
    }

    #[test]
    fn test_equal_pids_error() {
        let left = pid(&[(1, CID), (2, CID), (3, CID)]);
        let right = left.clone();
        assert_eq!(
            generate(CID, &left, &right),
            Err(PidError::Equal(left.clone()))
        );
    }

    #[test]
    fn test_lots_of_pids_appending() {
        let high = Pid::high(CID);
        let mut cur = Pid::single(1, CID);
        for _ in 0..1000 {
            let p = generate(CID, &cur, &high).unwrap();
            assert!(cur < p, "cur: {cur}, p: {p}");
            assert!(p < high, "p: {p}, high: {high}");
            cur = p;
        }
    }

    #[test]
    fn test_lots_of_pids_prepending() {
        let low = Pid::low(CID);
        let mut cur = Pid::high(CID);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            let p = generate(CID2, &low, &cur).unwrap();
            assert!(low < p && p < cur, "low: {low}, p: {p}, cur: {cur}");
            assert!(seen.insert(p.clone()), "duplicate {p}");
            cur = p;
        }
    }

    #[test]
    fn test_alternating_bisection_never_collides() {
        let mut lo = Pid::low(CID);
        let mut hi = Pid::high(CID);
        let mut seen = std::collections::HashSet::new();
        for i in 0..1000 {
            // (lo, p) then (p, hi): narrow from alternating sides.
            let p = generate(CID2, &lo, &hi).unwrap();
            assert!(lo < p && p < hi, "step {i}: lo: {lo}, p: {p}, hi: {hi}");
            assert!(seen.insert(p.clone()), "step {i}: duplicate {p}");
            if i % 2 == 0 {
                hi = p;
            } else {
                lo = p;
            }
        }
        assert_eq!(seen.len(), 1000);
    }

    #[test]
    fn test_concurrent_sites_same_gap_are_distinct() {
        let left = pid(&[(10, CID)]);
        let right = pid(&[(20, CID)]);
        let a = generate(3, &left, &right).unwrap();
        let b = generate(4, &left, &right).unwrap();
        assert_ne!(a, b);
        assert!(a < b);
        assert!(left < a && b < right);
    }

    #[test]
    fn test_display_and_json() {
        let p = pid(&[(1, 100), (2, 101)]);
        assert_eq!(p.to_string(), "[[1,100],[2,101]]");
        assert_eq!(serde_json::to_string(&p).unwrap(), "[[1,100],[2,101]]");
        let back: Pid = serde_json::from_str("[[1,100],[2,101]]").unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn test_empty_pid_rejected() {
        assert_eq!(Pid::from_levels(Vec::new()), Err(PidError::Empty));
        assert!(serde_json::from_str::<Pid>("[]").is_err());
        assert!(!PidError::Empty.is_ordering_violation());
    }

    fn arb_pid() -> impl Strategy<Value = Pid> {
        prop::collection::vec((0..=MAX_DIGIT, 0u32..6), 1..5).prop_map(|levels| {
            Pid::from_levels(levels.into_iter().map(Level::from).collect()).unwrap()
        })
    }

    proptest! {
        /// Exactly one of <, =, > holds, and the order is antisymmetric.
        #[test]
        fn prop_compare_total(a in arb_pid(), b in arb_pid()) {
            let ab = compare(&a, &b);
            let ba = compare(&b, &a);
            prop_assert_eq!(ab, ba.reverse());
            prop_assert_eq!(ab == Ordering::Equal, a == b);
        }

        #[test]
        fn prop_compare_transitive(a in arb_pid(), b in arb_pid(), c in arb_pid()) {
            let mut sorted = [a, b, c];
            sorted.sort();
            prop_assert!(sorted[0] <= sorted[1]);
            prop_assert!(sorted[1] <= sorted[2]);
            prop_assert!(sorted[0] <= sorted[2]);
        }

        /// Generated identifiers land strictly between their bounds, or the
        /// call reports an ordering violation. It never returns a bad PID.
        #[test]
        fn prop_generate_between(a in arb_pid(), b in arb_pid(), site in 0u32..6) {
            match a.cmp(&b) {
                Ordering::Less => match generate(site, &a, &b) {
                    Ok(p) => prop_assert!(a < p && p < b),
                    Err(e) => {
                        let adjacent = matches!(e, PidError::Adjacent { .. });
                        prop_assert!(adjacent, "expected Adjacent, got {:?}", e);
                    }
                },
                Ordering::Equal => {
                    let result = generate(site, &a, &b);
                    prop_assert_eq!(result, Err(PidError::Equal(a.clone())));
                }
                Ordering::Greater => {
                    let result = generate(site, &a, &b);
                    let inverted = matches!(result, Err(PidError::Inverted { .. }));
                    prop_assert!(inverted, "expected Inverted, got {:?}", result);
                }
            }
        }

        /// Repeated bisection of a shrinking interval never breaks the bounds.
        #[test]
        fn prop_generate_chain(site in 1u32..50, steps in prop::collection::vec(any::<bool>(), 1..200)) {
            let mut lo = Pid::low(0);
            let mut hi = Pid::high(0);
            for go_left in steps {
                let p = generate(site, &lo, &hi).unwrap();
                prop_assert!(lo < p && p < hi);
                if go_left { hi = p } else { lo = p }
            }
        }
    }
}
