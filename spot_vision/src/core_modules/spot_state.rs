// THEORY:
// `SpotState` is the debounce memory of a single region. The raw per-frame vote
// is noisy: a pedestrian crossing a spot, a car's headlights sweeping over it,
// or a compression artifact can flip it for a frame or two. The machine only
// lets the confirmed state change on sustained evidence.
//
// Each frame, in this order:
// 1.  An occupied vote extends the occupied streak and clears the free streak;
//     a free vote does the opposite.
// 2.  An occupied streak of `occupy_frames` confirms OCCUPIED.
// 3.  Otherwise a free streak of `free_frames` confirms FREE, but only if the
//     raw difference is also below `clear_threshold` this frame.
// 4.  Otherwise the confirmed state is held.
//
// Confirming OCCUPIED takes longer than confirming FREE, and FREE is gated on
// a low raw difference as well, so the machine leans toward fewer false
// "occupied" reports while still recovering quickly from an empty spot.
//
// The machine also tells the engine when a spot has just become verifiably
// clear: FREE, exactly `free_frames` free votes in a row, and a low difference.
// That fires once per free streak and is the cue for a local baseline patch.

use crate::config::HysteresisConfig;

/// The two signals behind one frame's raw vote, kept apart for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Vote {
    /// The edge ratio rose materially above the region's baseline.
    pub from_edge: bool,
    /// The shadow-robust difference covered enough of the region.
    pub from_diff: bool,
}

impl Vote {
    pub fn occupied_now(&self) -> bool {
        self.from_edge || self.from_diff
    }
}

/// What the state machine decided for one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpotUpdate {
    pub confirmed_occupied: bool,
    /// The spot just became verifiably clear and its baseline should be patched.
    pub repair_due: bool,
}

/// Debounce memory for one region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SpotState {
    pub confirmed_occupied: bool,
    pub occ_streak: u32,
    pub free_streak: u32,
}

impl SpotState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one frame's vote and raw difference ratio through the machine.
    pub fn update(&mut self, occupied_now: bool, diff_ratio: f64, params: &HysteresisConfig) -> SpotUpdate {
        if occupied_now {
            self.occ_streak = self.occ_streak.saturating_add(1);
            self.free_streak = 0;
        } else {
            self.free_streak = self.free_streak.saturating_add(1);
            self.occ_streak = 0;
        }

        let clear = diff_ratio < params.clear_threshold;
        if self.occ_streak >= params.occupy_frames {
            self.confirmed_occupied = true;
        } else if self.free_streak >= params.free_frames && clear {
            self.confirmed_occupied = false;
        }

        SpotUpdate {
            confirmed_occupied: self.confirmed_occupied,
            repair_due: !self.confirmed_occupied && self.free_streak == params.free_frames && clear,
        }
    }

    /// Forgets both streaks while keeping the confirmed state.
    pub fn reset_streaks(&mut self) {
        self.occ_streak = 0;
        self.free_streak = 0;
    }
}
