//! Address-family constants for the allowed-IPs tries.

/// Byte width of an IPv4 address.
pub const V4_WIDTH: usize = 4;

/// Byte width of an IPv6 address.
pub const V6_WIDTH: usize = 16;

/// Deepest possible v4 walk: one node per prefix bit plus the root slot.
pub const MAX_DEPTH_V4: usize = V4_WIDTH * 8 + 1;

/// Deepest possible v6 walk.
pub const MAX_DEPTH_V6: usize = V6_WIDTH * 8 + 1;
