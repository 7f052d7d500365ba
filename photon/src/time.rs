use std::time::SystemTime;

/// Current unix timestamp with sub-second precision, the clock every
/// keep-alive stamp and timeout bucket is measured against.
#[inline]
pub fn timestamp_f64() -> f64 {
    let elapsed = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("System clock predates the unix epoch");

    elapsed.as_secs() as f64 + f64::from(elapsed.subsec_micros()) / 1_000_000f64
}
