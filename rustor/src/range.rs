//! Arithmetic over half-open byte ranges and coverings of a fixed domain.
//!
//! A covering tracks which parts of `[domain.first, domain.last)` are
//! present, as a sorted vector of non-overlapping ranges. The storage layer
//! uses two of these per piece: bytes on disk and bytes claimed by an
//! in-flight request.

type Result<T> = std::result::Result<T, CoveringError>;

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoveringError {

    #[error("range {0} is not contained in domain {1}")]
    OutOfDomain(Range, Range),
}

/// Half-open interval `[first, last)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub first: u64,
    pub last: u64,
}

impl Range {

    pub fn new(first: u64, last: u64) -> Self {
        debug_assert!(first <= last, "inverted range {}..{}", first, last);
        Self { first, last }
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.last - self.first
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.first == self.last
    }

    // Whole of other lies within self.
    pub fn contains(&self, other: &Range) -> bool {
        self.first <= other.first && other.last <= self.last
    }

    pub fn intersect(&self, other: &Range) -> Option<Range> {
        let first = self.first.max(other.first);
        let last = self.last.min(other.last);
        (first < last).then(|| Range::new(first, last))
    }

    // Overlapping or sharing an endpoint, so a merge loses no information.
    pub fn touches(&self, other: &Range) -> bool {
        self.first <= other.last && other.first <= self.last
    }

    pub fn merge(&self, other: &Range) -> Range {
        debug_assert!(self.touches(other));
        Range::new(self.first.min(other.first), self.last.max(other.last))
    }
}

impl std::fmt::Display for Range {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.first, self.last)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Covering {
    domain: Range,
    ranges: Vec<Range>,
}

impl Covering {

    pub fn new(domain: Range) -> Self {
        Self { domain, ranges: Vec::new() }
    }

    pub fn domain(&self) -> Range {
        self.domain
    }

    pub fn ranges(&self) -> &[Range] {
        &self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn is_complete(&self) -> bool {
        self.ranges.len() == 1 && self.ranges[0] == self.domain
    }

    /// Number of bytes covered.
    pub fn covered(&self) -> u64 {
        self.ranges.iter().map(Range::len).sum()
    }

    /// Minimal covering of `self ∪ r`. Single left-to-right pass, merging
    /// `r` with every range it touches or adjoins.
    pub fn fill(&self, r: Range) -> Result<Covering> {
        if !self.domain.contains(&r) {
            return Err(CoveringError::OutOfDomain(r, self.domain));
        }
        if r.is_empty() {
            return Ok(self.clone());
        }

        let mut out = Vec::with_capacity(self.ranges.len() + 1);
        let mut acc = r;
        let mut placed = false;
        for x in &self.ranges {
            if placed || x.last < acc.first {
                // Strictly left of the accumulator, or already past it.
                out.push(*x);
            } else if x.touches(&acc) {
                acc = acc.merge(x);
            } else {
                // Strictly right; the accumulator can grow no further.
                out.push(acc);
                placed = true;
                out.push(*x);
            }
        }
        if !placed {
            out.push(acc);
        }
        Ok(Covering { domain: self.domain, ranges: out })
    }

    /// Covering with every byte of `r` removed.
    pub fn poke(&self, r: Range) -> Result<Covering> {
        if !self.domain.contains(&r) {
            return Err(CoveringError::OutOfDomain(r, self.domain));
        }
        if r.is_empty() {
            return Ok(self.clone());
        }

        let mut out = Vec::with_capacity(self.ranges.len() + 1);
        for x in &self.ranges {
            match x.intersect(&r) {
                Some(hit) => {
                    if x.first < hit.first {
                        out.push(Range::new(x.first, hit.first));
                    }
                    if hit.last < x.last {
                        out.push(Range::new(hit.last, x.last));
                    }
                }
                None => out.push(*x),
            }
        }
        Ok(Covering { domain: self.domain, ranges: out })
    }

    /// Leftmost sub-range of `sub` disjoint from the covering, or `None`
    /// when `sub` is fully covered.
    pub fn first_gap(&self, sub: Range) -> Option<Range> {
        debug_assert!(self.domain.contains(&sub));
        let mut cursor = sub.first;
        for x in &self.ranges {
            if cursor >= sub.last {
                return None;
            }
            if x.last <= cursor {
                continue;
            }
            if x.first > cursor {
                return Some(Range::new(cursor, x.first.min(sub.last)));
            }
            cursor = x.last;
        }
        (cursor < sub.last).then(|| Range::new(cursor, sub.last))
    }

    /// All gaps of `sub`, left to right.
    pub fn gaps(&self, sub: Range) -> Vec<Range> {
        let mut out = Vec::new();
        let mut cursor = sub.first;
        for x in &self.ranges {
            if cursor >= sub.last {
                break;
            }
            if x.last <= cursor {
                continue;
            }
            if x.first > cursor {
                out.push(Range::new(cursor, x.first.min(sub.last)));
            }
            cursor = cursor.max(x.last);
        }
        if cursor < sub.last {
            out.push(Range::new(cursor, sub.last));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn covering(domain: (u64, u64), ranges: &[(u64, u64)]) -> Covering {
        let mut c = Covering::new(Range::new(domain.0, domain.1));
        for &(a, b) in ranges {
            c = c.fill(Range::new(a, b)).unwrap();
        }
        c
    }

    #[test]
    fn fill_merges_touching_ranges() {
        let c = covering((0, 100), &[(0, 10), (20, 30)]);
        assert_eq!(c.ranges(), &[Range::new(0, 10), Range::new(20, 30)]);

        // Adjoining on both sides collapses all three.
        let c = c.fill(Range::new(10, 20)).unwrap();
        assert_eq!(c.ranges(), &[Range::new(0, 30)]);
    }

    #[test]
    fn fill_merges_overlap() {
        let c = covering((0, 100), &[(10, 20), (40, 50), (15, 45)]);
        assert_eq!(c.ranges(), &[Range::new(10, 50)]);
    }

    #[test]
    fn fill_keeps_disjoint_sorted() {
        let c = covering((0, 100), &[(50, 60), (0, 10), (20, 30)]);
        assert_eq!(
            c.ranges(),
            &[Range::new(0, 10), Range::new(20, 30), Range::new(50, 60)],
        );
    }

    #[test]
    fn fill_out_of_domain() {
        let c = Covering::new(Range::new(0, 10));
        assert_eq!(
            c.fill(Range::new(5, 11)),
            Err(CoveringError::OutOfDomain(Range::new(5, 11), Range::new(0, 10))),
        );
    }

    #[test]
    fn poke_splits_ranges() {
        let c = covering((0, 100), &[(0, 50)]);
        let c = c.poke(Range::new(10, 20)).unwrap();
        assert_eq!(c.ranges(), &[Range::new(0, 10), Range::new(20, 50)]);

        // Poking the edge trims rather than splits.
        let c = c.poke(Range::new(0, 5)).unwrap();
        assert_eq!(c.ranges(), &[Range::new(5, 10), Range::new(20, 50)]);

        // Poking a hole is a no-op.
        let c2 = c.poke(Range::new(12, 18)).unwrap();
        assert_eq!(c, c2);
    }

    #[test]
    fn fill_then_poke_equals_poke() {
        // Filling a range and then poking it back out lands in the same
        // place as poking alone.
        let c = covering((0, 100), &[(0, 10), (30, 60), (80, 90)]);
        let r = Range::new(5, 40);
        assert_eq!(
            c.fill(r).unwrap().poke(r).unwrap(),
            c.poke(r).unwrap(),
        );
    }

    #[test]
    fn first_gap_basics() {
        let domain = Range::new(0, 100);
        let c = covering((0, 100), &[(10, 20), (30, 40)]);

        assert_eq!(c.first_gap(domain), Some(Range::new(0, 10)));
        assert_eq!(c.first_gap(Range::new(10, 40)), Some(Range::new(20, 30)));
        assert_eq!(c.first_gap(Range::new(10, 20)), None);
        assert_eq!(c.first_gap(Range::new(30, 100)), Some(Range::new(40, 100)));

        let full = covering((0, 100), &[(0, 100)]);
        assert_eq!(full.first_gap(domain), None);
        assert!(full.is_complete());
    }

    #[test]
    fn first_gap_is_contained_and_disjoint() {
        // The gap lies inside the queried sub-range and touches no
        // covered byte.
        let c = covering((0, 64), &[(0, 8), (16, 24), (40, 48)]);
        let sub = Range::new(4, 60);
        let g = c.first_gap(sub).unwrap();
        assert!(sub.contains(&g));
        for x in c.ranges() {
            assert!(x.intersect(&g).is_none());
        }
        assert_eq!(g, Range::new(8, 16));
    }

    #[test]
    fn gaps_walk() {
        let c = covering((0, 50), &[(10, 20), (30, 40)]);
        assert_eq!(
            c.gaps(Range::new(0, 50)),
            vec![Range::new(0, 10), Range::new(20, 30), Range::new(40, 50)],
        );
        assert_eq!(c.gaps(Range::new(12, 18)), Vec::<Range>::new());
        assert_eq!(c.gaps(Range::new(15, 35)), vec![Range::new(20, 30)]);
    }

    #[test]
    fn covered_counts_bytes() {
        let c = covering((0, 100), &[(0, 10), (20, 25)]);
        assert_eq!(c.covered(), 15);
        assert!(!c.is_complete());
        assert!(!c.is_empty());
        assert!(Covering::new(Range::new(0, 4)).is_empty());
    }
}
