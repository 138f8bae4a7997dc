//! Reserved state tags carried in the high byte below the relation mask.
//!
//! The tags and their lifecycle are shared between the CPU producer side and
//! whatever consumer maps the same pages, so their numeric values are fixed.

/// Free; a producer may reserve it.
pub const ST_IDLE: u8 = 0x00;
/// Producer wrote payload and rang the doorbell.
pub const ST_PUBLISHED: u8 = 0x01;
/// A consumer won the claim CAS and owns the cell.
pub const ST_CLAIMED: u8 = 0x02;
/// The claiming consumer is working on the cell.
pub const ST_PROCESSING: u8 = 0x03;
/// Consumer finished; result committed in place.
pub const ST_COMPLETE: u8 = 0x04;
/// Producer read the result and recycled the cell.
pub const ST_RETIRED: u8 = 0x05;
/// Sentinel: a region epoch bump is in flight.
pub const ST_EPOCH_BUMP: u8 = 0x06;
/// Reserved mid-commit; clock is odd while this tag is visible.
pub const ST_PENDING: u8 = 0x07;

/// First of the tags left to user extension (0xF0..=0xFF).
pub const ST_USER_BASE: u8 = 0xF0;

/// Human-readable tag name for diagnostics.
pub fn state_name(st: u8) -> &'static str {
    match st {
        ST_IDLE => "IDLE",
        ST_PUBLISHED => "PUBLISHED",
        ST_CLAIMED => "CLAIMED",
        ST_PROCESSING => "PROCESSING",
        ST_COMPLETE => "COMPLETE",
        ST_RETIRED => "RETIRED",
        ST_EPOCH_BUMP => "EPOCH_BUMP",
        ST_PENDING => "PENDING",
        s if s >= ST_USER_BASE => "USER",
        _ => "UNKNOWN",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_values_are_stable() {
        assert_eq!(ST_IDLE, 0x00);
        assert_eq!(ST_PUBLISHED, 0x01);
        assert_eq!(ST_CLAIMED, 0x02);
        assert_eq!(ST_PROCESSING, 0x03);
        assert_eq!(ST_COMPLETE, 0x04);
        assert_eq!(ST_RETIRED, 0x05);
        assert_eq!(ST_EPOCH_BUMP, 0x06);
        assert_eq!(ST_PENDING, 0x07);
    }

    #[test]
    fn user_range_is_named() {
        assert_eq!(state_name(0xF0), "USER");
        assert_eq!(state_name(0xFF), "USER");
        assert_eq!(state_name(0x40), "UNKNOWN");
    }
}
