//! Destination collision policy
//!
//! Decides whether an existing destination item is skipped or overwritten.
//! Sizes are compared first; content hashes are only requested when the
//! sizes agree under [`CollisionMode::UpdateIfDifferent`].

use crate::config::CollisionMode;

/// What to do with the destination item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Leave the destination alone
    Skip,
    /// Replace the existing destination
    Overwrite,
    /// No destination exists yet
    Create,
}

impl Resolution {
    /// True when the transfer must happen
    pub fn should_write(&self) -> bool {
        !matches!(self, Self::Skip)
    }
}

/// Result of the size check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeCheck {
    /// Sizes alone settle it
    Decided(Resolution),
    /// Sizes match; compare content hashes
    CompareHashes,
}

/// Collision policy for one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CollisionResolver {
    mode: CollisionMode,
}

impl CollisionResolver {
    /// Resolver for a mode
    pub fn new(mode: CollisionMode) -> Self {
        Self { mode }
    }

    /// Configured mode
    pub fn mode(&self) -> CollisionMode {
        self.mode
    }

    /// Decide from existence and sizes; unknown sizes count as different
    pub fn decide(
        &self,
        dest_exists: bool,
        src_size: Option<u64>,
        dest_size: Option<u64>,
    ) -> SizeCheck {
        if !dest_exists {
            return SizeCheck::Decided(Resolution::Create);
        }
        match self.mode {
            CollisionMode::Skip => SizeCheck::Decided(Resolution::Skip),
            CollisionMode::Update => SizeCheck::Decided(Resolution::Overwrite),
            CollisionMode::UpdateIfDifferent => match (src_size, dest_size) {
                (Some(src), Some(dest)) if src == dest => SizeCheck::CompareHashes,
                _ => SizeCheck::Decided(Resolution::Overwrite),
            },
        }
    }

    /// Second stage for equal sizes
    pub fn decide_by_hash<H: PartialEq + ?Sized>(src_hash: &H, dest_hash: &H) -> Resolution {
        if src_hash == dest_hash {
            Resolution::Skip
        } else {
            Resolution::Overwrite
        }
    }

    /// Full decision with lazily computed hashes
    pub fn resolve<H, S, D>(
        &self,
        dest_exists: bool,
        src_size: Option<u64>,
        dest_size: Option<u64>,
        src_hash: S,
        dest_hash: D,
    ) -> Resolution
    where
        H: PartialEq,
        S: FnOnce() -> H,
        D: FnOnce() -> H,
    {
        match self.decide(dest_exists, src_size, dest_size) {
            SizeCheck::Decided(resolution) => resolution,
            SizeCheck::CompareHashes => Self::decide_by_hash(&src_hash(), &dest_hash()),
        }
    }
}

/// Shorthand for [`CollisionResolver::resolve`]
pub fn resolve<H, S, D>(
    mode: CollisionMode,
    dest_exists: bool,
    src_size: Option<u64>,
    dest_size: Option<u64>,
    src_hash: S,
    dest_hash: D,
) -> Resolution
where
    H: PartialEq,
    S: FnOnce() -> H,
    D: FnOnce() -> H,
{
    CollisionResolver::new(mode).resolve(dest_exists, src_size, dest_size, src_hash, dest_hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_missing_destination_is_create() {
        for mode in [CollisionMode::Skip, CollisionMode::Update, CollisionMode::UpdateIfDifferent] {
            let r = resolve(mode, false, Some(1), None, || "a", || "b");
            assert_eq!(r, Resolution::Create);
        }
    }

    #[test]
    fn test_skip_and_update_ignore_content() {
        assert_eq!(
            resolve(CollisionMode::Skip, true, Some(1), Some(2), || 1, || 2),
            Resolution::Skip
        );
        assert_eq!(
            resolve(CollisionMode::Update, true, Some(1), Some(1), || 1, || 1),
            Resolution::Overwrite
        );
    }

    #[test]
    fn test_hashes_only_when_sizes_match() {
        let hashed = Cell::new(0);
        let hash = |v: &'static str| {
            hashed.set(hashed.get() + 1);
            v
        };

        let r = resolve(
            CollisionMode::UpdateIfDifferent,
            true,
            Some(10),
            Some(11),
            || hash("a"),
            || hash("a"),
        );
        assert_eq!(r, Resolution::Overwrite);
        assert_eq!(hashed.get(), 0);

        let r = resolve(
            CollisionMode::UpdateIfDifferent,
            true,
            Some(10),
            Some(10),
            || hash("a"),
            || hash("a"),
        );
        assert_eq!(r, Resolution::Skip);
        assert_eq!(hashed.get(), 2);

        let r = resolve(
            CollisionMode::UpdateIfDifferent,
            true,
            Some(10),
            Some(10),
            || "a",
            || "b",
        );
        assert_eq!(r, Resolution::Overwrite);
    }

    #[test]
    fn test_unknown_size_overwrites() {
        let resolver = CollisionResolver::new(CollisionMode::UpdateIfDifferent);
        assert_eq!(
            resolver.decide(true, None, Some(3)),
            SizeCheck::Decided(Resolution::Overwrite)
        );
        assert!(!Resolution::Skip.should_write());
        assert!(Resolution::Create.should_write());
    }
}
