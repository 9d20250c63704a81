//! Block cursor, confirmation gating and epoch alignment

use std::ops::RangeInclusive;

/// True once `current` is buried under at least `confirmations` blocks
pub fn should_advance(latest: u64, current: u64, confirmations: u64) -> bool {
    latest >= current && latest - current >= confirmations
}

/// Header batching schedule for light clients that accept fixed windows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochSchedule {
    /// 0 disables alignment
    pub epoch_size: u64,
    /// Number of headers in one batch
    pub window: u64,
    pub offset: u64,
}

impl EpochSchedule {
    /// Schedule whose batches start on an epoch boundary
    pub fn new(epoch_size: u64, window: u64) -> Self {
        let window = window.max(1);
        Self {
            epoch_size,
            window,
            offset: window - 1,
        }
    }

    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    /// Every block is aligned; batches hold one header
    pub fn disabled() -> Self {
        Self::new(0, 1)
    }

    pub fn is_aligned(&self, block: u64) -> bool {
        if self.epoch_size == 0 {
            return true;
        }
        block >= self.offset && (block - self.offset) % self.epoch_size == 0
    }

    /// First aligned block at or after `block`
    pub fn next_aligned(&self, block: u64) -> u64 {
        if self.epoch_size == 0 {
            return block;
        }
        if block <= self.offset {
            return self.offset;
        }
        let epochs = (block - self.offset).div_ceil(self.epoch_size);
        self.offset + epochs * self.epoch_size
    }

    /// The inclusive window of headers ending at `block`
    pub fn batch_range(&self, block: u64) -> RangeInclusive<u64> {
        block.saturating_sub(self.window - 1)..=block
    }
}

impl Default for EpochSchedule {
    fn default() -> Self {
        Self::disabled()
    }
}

/// Per-loop position. Owned by exactly one loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncCursor {
    current_block: u64,
    synced_height: u64,
    confirmations: u64,
}

impl SyncCursor {
    pub fn new(start_block: u64, confirmations: u64) -> Self {
        Self {
            current_block: start_block,
            synced_height: 0,
            confirmations,
        }
    }

    pub fn current_block(&self) -> u64 {
        self.current_block
    }

    pub fn synced_height(&self) -> u64 {
        self.synced_height
    }

    pub fn confirmations(&self) -> u64 {
        self.confirmations
    }

    pub fn ready(&self, latest: u64) -> bool {
        should_advance(latest, self.current_block, self.confirmations)
    }

    pub fn advance(&mut self, stride: u64) {
        self.current_block += stride.max(1);
    }

    /// Move forward without going back, e.g. to the first verifiable block
    pub fn clamp_to(&mut self, min: u64) {
        self.current_block = self.current_block.max(min);
    }

    /// Startup reconciliation with the destination's synced height.
    ///
    /// A cursor behind the synced height, or more than `lookahead` blocks
    /// ahead of it, jumps to `synced_height + lookahead`. Returns true if the
    /// cursor moved.
    pub fn catch_up(&mut self, synced_height: u64, lookahead: u64) -> bool {
        self.synced_height = synced_height;
        let behind = self.current_block < synced_height;
        let too_far = self.current_block.saturating_sub(synced_height) > lookahead;
        if behind || too_far {
            self.current_block = synced_height + lookahead;
            true
        } else {
            false
        }
    }

    /// Move up to the next block `schedule` accepts. With a stride that
    /// divides the epoch, every later step stays aligned.
    pub fn align(&mut self, schedule: &EpochSchedule) -> bool {
        let aligned = schedule.next_aligned(self.current_block);
        let moved = aligned != self.current_block;
        self.current_block = aligned;
        moved
    }

    /// A header batch is due only past the synced height
    pub fn needs_header(&self) -> bool {
        self.current_block > self.synced_height
    }

    pub fn mark_synced(&mut self) {
        self.synced_height = self.current_block;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confirmation_gating() {
        assert!(should_advance(100, 95, 3));
        assert!(!should_advance(100, 95, 10));
        assert!(should_advance(100, 100, 0));
        assert!(!should_advance(90, 95, 0));
    }

    #[test]
    fn test_cursor_ready() {
        let cursor = SyncCursor::new(95, 10);
        assert!(!cursor.ready(100));
        assert!(cursor.ready(105));
    }

    #[test]
    fn test_catch_up_from_genesis() {
        let mut cursor = SyncCursor::new(0, 0);
        assert!(cursor.catch_up(500, 12));
        assert_eq!(cursor.current_block(), 512);
        assert_eq!(cursor.synced_height(), 500);
    }

    #[test]
    fn test_catch_up_within_lookahead_keeps_cursor() {
        let mut cursor = SyncCursor::new(505, 0);
        assert!(!cursor.catch_up(500, 12));
        assert_eq!(cursor.current_block(), 505);

        let mut ahead = SyncCursor::new(900, 0);
        assert!(ahead.catch_up(500, 12));
        assert_eq!(ahead.current_block(), 512);
    }

    #[test]
    fn test_epoch_alignment() {
        let schedule = EpochSchedule::new(200, 12);
        assert_eq!(schedule.offset, 11);
        assert!(schedule.is_aligned(811));
        assert!(schedule.is_aligned(11));
        assert!(!schedule.is_aligned(711));
        assert!(!schedule.is_aligned(800));
        assert!(!schedule.is_aligned(5));
        assert_eq!(schedule.batch_range(811), 800..=811);
    }

    #[test]
    fn test_next_aligned() {
        let schedule = EpochSchedule::new(200, 12);
        assert_eq!(schedule.next_aligned(0), 11);
        assert_eq!(schedule.next_aligned(11), 11);
        assert_eq!(schedule.next_aligned(12), 211);
        assert_eq!(schedule.next_aligned(512), 611);
        assert_eq!(schedule.next_aligned(811), 811);
        assert_eq!(EpochSchedule::disabled().next_aligned(512), 512);
    }

    #[test]
    fn test_stride_walk_hits_every_epoch_after_align() {
        let schedule = EpochSchedule::new(200, 12);
        let mut cursor = SyncCursor::new(0, 0);
        cursor.catch_up(500, 12);
        assert!(cursor.align(&schedule));
        assert_eq!(cursor.current_block(), 611);

        let mut aligned = Vec::new();
        for _ in 0..8 {
            if schedule.is_aligned(cursor.current_block()) {
                aligned.push(cursor.current_block());
            }
            cursor.advance(50);
        }
        assert_eq!(aligned, vec![611, 811]);
        assert!(!cursor.align(&schedule));
        assert_eq!(cursor.current_block(), 1011);
    }

    #[test]
    fn test_disabled_schedule() {
        let schedule = EpochSchedule::disabled();
        assert!(schedule.is_aligned(0));
        assert!(schedule.is_aligned(12345));
        assert_eq!(schedule.batch_range(7), 7..=7);
    }

    #[test]
    fn test_header_gate() {
        let mut cursor = SyncCursor::new(10, 0);
        cursor.catch_up(10, 12);
        assert!(!cursor.needs_header());
        cursor.advance(1);
        assert!(cursor.needs_header());
        cursor.mark_synced();
        assert_eq!(cursor.synced_height(), 11);
        assert!(!cursor.needs_header());
    }

    #[test]
    fn test_clamp_never_moves_back() {
        let mut cursor = SyncCursor::new(50, 0);
        cursor.clamp_to(40);
        assert_eq!(cursor.current_block(), 50);
        cursor.clamp_to(60);
        assert_eq!(cursor.current_block(), 60);
    }
}
