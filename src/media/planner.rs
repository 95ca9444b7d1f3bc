/// Fixed audio bitrate added on top of the video budget.
pub const AUDIO_BITRATE: &str = "128k";

/// Burst ceiling relative to the target bitrate.
const MAX_RATE_FACTOR: u64 = 2;
/// Rate-control buffer relative to the target bitrate.
const BUF_SIZE_FACTOR: u64 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodePlan {
    /// Video bits per second
    pub video_bitrate: u64,
}

impl EncodePlan {
    pub fn max_rate(&self) -> u64 {
        self.video_bitrate.saturating_mul(MAX_RATE_FACTOR)
    }

    pub fn buf_size(&self) -> u64 {
        self.video_bitrate.saturating_mul(BUF_SIZE_FACTOR)
    }
}

/// Spreads `target_size_bytes` over the whole clip.
///
/// Returns `None` when the duration is not a positive finite number.
pub fn plan(target_size_bytes: u64, duration_secs: f64) -> Option<EncodePlan> {
    if !duration_secs.is_finite() || duration_secs <= 0.0 {
        return None;
    }

    let bits = target_size_bytes as f64 * 8.0;
    let video_bitrate = (bits / duration_secs).floor() as u64;
    Some(EncodePlan { video_bitrate })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_plan_one_megabyte_over_eight_seconds() {
        let plan = plan(1024 * 1024, 8.0).unwrap();
        assert_eq!(plan.video_bitrate, 1024 * 1024);
        assert_eq!(plan.max_rate(), 2 * 1024 * 1024);
        assert_eq!(plan.buf_size(), 4 * 1024 * 1024);
    }

    #[test]
    fn test_plan_rounds_down() {
        // 10 bytes = 80 bits over 3 seconds
        assert_eq!(plan(10, 3.0).unwrap().video_bitrate, 26);
    }

    #[test]
    fn test_plan_rejects_non_positive_duration() {
        assert!(plan(1000, 0.0).is_none());
        assert!(plan(1000, -1.5).is_none());
        assert!(plan(1000, f64::NAN).is_none());
        assert!(plan(1000, f64::INFINITY).is_none());
    }

    proptest! {
        #[test]
        fn prop_bitrate_is_floor_of_bits_per_second(
            size in 1u64..=(8 * 1024 * 1024 * 1024),
            duration in 1u32..=100_000,
        ) {
            let plan = plan(size, f64::from(duration)).unwrap();
            prop_assert_eq!(plan.video_bitrate, size * 8 / u64::from(duration));
        }
    }
}
