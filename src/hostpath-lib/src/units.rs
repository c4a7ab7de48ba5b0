pub const MIB: u64 = 1024 * 1024;
pub const GIB: u64 = 1024 * MIB;

/// Rounds a size up to whole MiB below 1GiB, and to whole GiB from there on.
pub fn round_off_bytes(bytes: u64) -> u64 {
    let unit = if bytes < GIB { MIB } else { GIB };
    match bytes % unit {
        0 => bytes,
        rem => bytes.saturating_add(unit - rem),
    }
}

/// Same as [`round_off_bytes`] for the signed sizes carried in external records.
pub fn round_off_i64(bytes: i64) -> i64 {
    if bytes <= 0 {
        return bytes;
    }
    i64::try_from(round_off_bytes(bytes as u64)).unwrap_or(i64::MAX)
}

pub fn to_i64(bytes: u64) -> i64 {
    i64::try_from(bytes).unwrap_or(i64::MAX)
}
