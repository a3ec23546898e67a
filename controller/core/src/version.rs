use std::sync::atomic::{AtomicU64, Ordering};

/// Produces strictly increasing snapshot versions for the lifetime of the process.
///
/// Versions start at `1` so that the first published snapshot is distinguishable from the
/// empty version a proxy reports before it has received any configuration.
#[derive(Debug, Default)]
pub struct VersionSequencer(AtomicU64);

impl VersionSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> String {
        let version = self.0.fetch_add(1, Ordering::Relaxed) + 1;
        version.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_above_unset() {
        let versions = VersionSequencer::new();
        let first = versions.next();
        assert_ne!(first, "");
        assert_ne!(first, "0");
        assert_eq!(first, "1");
    }

    #[test]
    fn strictly_increasing() {
        let versions = VersionSequencer::new();
        let mut prior = 0u64;
        for _ in 0..1000 {
            let v = versions.next().parse::<u64>().expect("versions must be integers");
            assert!(v > prior, "{v} must be greater than {prior}");
            prior = v;
        }
    }
}
