use num::{FromPrimitive, traits::WrappingAdd};
use std::{env, time::Duration};

/// Increments a mutable reference in place, and returns the original value
pub(crate) fn wrapping_inplace_add<T: WrappingAdd + FromPrimitive + Copy>(value: &mut T) -> T {
    let id = *value;
    *value = value.wrapping_add(&T::from_u8(1).unwrap());
    id
}

/// Get the connection wait timeout, either from environment or default 2 s
pub fn get_default_connection_timeout() -> Duration {
    Duration::from_secs_f32(
        env::var("CACLIENT_CONNECTION_TIMEOUT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(2.0f32)
            .max(0.01f32),
    )
}

/// Get the largest array transfer permitted, either from environment or default 16 MiB
pub fn get_default_max_array_bytes() -> usize {
    env::var("EPICS_CA_MAX_ARRAY_BYTES")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(1usize << 24)
        .max(16384usize)
}

/// Whether callbacks should be delivered from a transport thread
///
/// Anything other than `NO` (in any case) leaves preemptive delivery on.
pub fn get_default_preemptive_callback() -> bool {
    env::var("CACLIENT_PREEMPTIVE_CALLBACK")
        .map(|v| !v.trim().eq_ignore_ascii_case("no"))
        .unwrap_or(true)
}
