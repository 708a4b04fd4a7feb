use std::cmp::Ordering;
use std::fmt;

/// A protocol version: a tuple of unsigned segments, compared lexicographically.
///
/// Mirrors `QVersionNumber` from the system this protocol was modelled on:
/// segments are compared pairwise, and a shorter prefix of an otherwise-equal
/// sequence sorts lower (`[1, 0]` < `[1, 0, 1]`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Version(pub Vec<u32>);

impl Version {
    pub fn new(segments: impl Into<Vec<u32>>) -> Self {
        Self(segments.into())
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(u32::to_string).collect();
        write!(f, "{}", parts.join("."))
    }
}

/// Current protocol version spoken by this implementation.
pub fn protocol_version() -> Version {
    Version::new([1, 0, 0])
}

/// Oldest protocol version this implementation will still talk to.
pub fn min_compatible_version() -> Version {
    Version::new([1, 0, 0])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lexicographic_ordering() {
        assert!(Version::new([1, 0, 0]) < Version::new([1, 0, 1]));
        assert!(Version::new([1, 0]) < Version::new([1, 0, 1]));
        assert!(Version::new([1, 1, 0]) > Version::new([1, 0, 9]));
        assert_eq!(Version::new([1, 0, 0]), Version::new([1, 0, 0]));
    }

    #[test]
    fn display_format() {
        assert_eq!(Version::new([1, 0, 0]).to_string(), "1.0.0");
    }
}
