// ============================================================================
// Edit history — bounded, index-addressed snapshot stack
// ============================================================================

use image::RgbaImage;

/// Maximum number of snapshots kept.
pub const DEFAULT_DEPTH: usize = 10;

/// Undo/redo over full image snapshots.
///
/// Invariant: `index ∈ [-1, len-1]`. A push truncates every snapshot after
/// the current index (invalidating redo states) before appending; past
/// capacity the oldest snapshot is evicted and the index decremented in
/// lock-step. The stack stores only image snapshots — never strokes or
/// derived masks.
pub struct SnapshotHistory {
    snapshots: Vec<RgbaImage>,
    index: isize,
    capacity: usize,
}

impl Default for SnapshotHistory {
    fn default() -> Self {
        Self::new(DEFAULT_DEPTH)
    }
}

impl SnapshotHistory {
    pub fn new(capacity: usize) -> Self {
        SnapshotHistory {
            snapshots: Vec::new(),
            index: -1,
            capacity: capacity.max(1),
        }
    }

    /// Record a new snapshot as the current state.
    pub fn push(&mut self, image: RgbaImage) {
        self.snapshots.truncate((self.index + 1) as usize);
        self.snapshots.push(image);
        self.index += 1;

        if self.snapshots.len() > self.capacity {
            self.snapshots.remove(0);
            self.index -= 1;
        }
    }

    /// Step back one snapshot. No-op (None) at the oldest state.
    pub fn undo(&mut self) -> Option<&RgbaImage> {
        if self.index > 0 {
            self.index -= 1;
            Some(&self.snapshots[self.index as usize])
        } else {
            None
        }
    }

    /// Step forward one snapshot. No-op (None) at the newest state.
    pub fn redo(&mut self) -> Option<&RgbaImage> {
        if self.index >= 0 && (self.index as usize) < self.snapshots.len() - 1 {
            self.index += 1;
            Some(&self.snapshots[self.index as usize])
        } else {
            None
        }
    }

    pub fn can_undo(&self) -> bool {
        self.index > 0
    }

    pub fn can_redo(&self) -> bool {
        self.index >= 0 && (self.index as usize) < self.snapshots.len().saturating_sub(1)
    }

    /// The snapshot at the current index, if any.
    pub fn current(&self) -> Option<&RgbaImage> {
        if self.index >= 0 {
            self.snapshots.get(self.index as usize)
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;
    use proptest::prelude::*;

    fn tagged(tag: u8) -> RgbaImage {
        RgbaImage::from_pixel(2, 2, Rgba([tag, 0, 0, 255]))
    }

    fn tag_of(img: &RgbaImage) -> u8 {
        img.get_pixel(0, 0)[0]
    }

    #[test]
    fn undo_redo_sequence() {
        let mut h = SnapshotHistory::new(10);
        h.push(tagged(1));
        h.push(tagged(2));
        h.push(tagged(3));

        assert_eq!(h.undo().map(tag_of), Some(2));
        assert_eq!(h.undo().map(tag_of), Some(1));
        assert!(h.undo().is_none());
        assert!(!h.can_undo());

        assert_eq!(h.redo().map(tag_of), Some(2));
        assert_eq!(h.redo().map(tag_of), Some(3));
        assert!(h.redo().is_none());
        assert!(!h.can_redo());
    }

    #[test]
    fn push_after_undo_discards_redo_states() {
        let mut h = SnapshotHistory::new(10);
        h.push(tagged(1));
        h.push(tagged(2));
        h.push(tagged(3));
        assert_eq!(h.undo().map(tag_of), Some(2));

        h.push(tagged(4));
        assert!(!h.can_redo());
        assert_eq!(h.len(), 3);
        assert_eq!(h.undo().map(tag_of), Some(2));
        assert_eq!(h.redo().map(tag_of), Some(4));
    }

    #[test]
    fn depth_bound_evicts_oldest_and_stays_consistent() {
        let mut h = SnapshotHistory::new(10);
        for i in 1..=12 {
            h.push(tagged(i));
        }
        assert_eq!(h.len(), 10);
        assert_eq!(h.current().map(tag_of), Some(12));

        // Walk all the way back: the oldest two snapshots are gone
        let mut last = 0;
        while let Some(img) = h.undo() {
            last = tag_of(img);
        }
        assert_eq!(last, 3);
        assert!(h.can_redo());
        assert!(!h.can_undo());
    }

    #[test]
    fn empty_history_is_inert() {
        let mut h = SnapshotHistory::default();
        assert!(h.undo().is_none());
        assert!(h.redo().is_none());
        assert!(h.current().is_none());
        assert!(!h.can_undo());
        assert!(!h.can_redo());
    }

    proptest! {
        /// Whatever the operation sequence, the index invariant holds and
        /// current() agrees with can_undo/can_redo.
        #[test]
        fn index_invariant_holds(ops in proptest::collection::vec(0u8..3, 0..40)) {
            let mut h = SnapshotHistory::new(5);
            let mut tag = 0u8;
            for op in ops {
                match op {
                    0 => {
                        tag = tag.wrapping_add(1);
                        h.push(tagged(tag));
                    }
                    1 => { let _ = h.undo(); }
                    _ => { let _ = h.redo(); }
                }
                prop_assert!(h.index >= -1);
                prop_assert!(h.index < h.snapshots.len() as isize);
                prop_assert!(h.len() <= 5);
                if h.index >= 0 {
                    prop_assert!(h.current().is_some());
                }
            }
        }
    }
}
