//! The fixed message flag set. `Recent` is per-view (not stored on disk
//! with the others in the canonical record; kept here only for IMAP-facing
//! code that wants one enum to reason about); `Dirty` is internal state
//! meaning "changed in-index but the backend hasn't persisted it yet".

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Flag {
    Answered = 0x01,
    Flagged = 0x02,
    Deleted = 0x04,
    Seen = 0x08,
    Draft = 0x10,
    Recent = 0x20,
    Dirty = 0x40,
}

pub const ALL_PERSISTENT_FLAGS: u8 =
    Flag::Answered as u8 | Flag::Flagged as u8 | Flag::Deleted as u8 | Flag::Seen as u8 | Flag::Draft as u8 | Flag::Dirty as u8;

pub fn has_flag(bitmap: u8, flag: Flag) -> bool {
    bitmap & flag as u8 != 0
}

pub fn set_flag(bitmap: u8, flag: Flag) -> u8 {
    bitmap | flag as u8
}

pub fn clear_flag(bitmap: u8, flag: Flag) -> u8 {
    bitmap & !(flag as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_clear_round_trip() {
        let mut bm = 0u8;
        bm = set_flag(bm, Flag::Seen);
        bm = set_flag(bm, Flag::Deleted);
        assert!(has_flag(bm, Flag::Seen));
        assert!(has_flag(bm, Flag::Deleted));
        assert!(!has_flag(bm, Flag::Draft));
        bm = clear_flag(bm, Flag::Seen);
        assert!(!has_flag(bm, Flag::Seen));
        assert!(has_flag(bm, Flag::Deleted));
    }
}
