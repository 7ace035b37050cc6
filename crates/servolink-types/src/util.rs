//! Numeric helpers shared by command builders and the simulator.

use chrono::Utc;

const CRC32_POLYNOMIAL: u32 = 0x04C1_1DB7;

/// Word-wise CRC-32 used to seal [`LowCmd`][crate::LowCmd] messages.
///
/// Each word is fed MSB-first into a non-reflected CRC-32 register seeded
/// with `0xFFFF_FFFF`; no final XOR is applied.
pub fn crc32_core(words: &[u32]) -> u32 {
    let mut crc: u32 = 0xFFFF_FFFF;
    for &word in words {
        let mut bit: u32 = 1 << 31;
        for _ in 0..32 {
            if crc & 0x8000_0000 != 0 {
                crc = (crc << 1) ^ CRC32_POLYNOMIAL;
            } else {
                crc <<= 1;
            }
            if word & bit != 0 {
                crc ^= CRC32_POLYNOMIAL;
            }
            bit >>= 1;
        }
    }
    crc
}

/// Wall-clock timestamp in microseconds since the Unix epoch.
pub fn timestamp_us() -> u64 {
    Utc::now().timestamp_micros().max(0) as u64
}

/// Linear interpolation between `start` and `end`; `t` is not clamped.
pub fn lerp(start: f32, end: f32, t: f32) -> f32 {
    start + (end - start) * t
}

/// Clamp `value` to `[min, max]`.
pub fn clamp(value: f32, min: f32, max: f32) -> f32 {
    value.max(min).min(max)
}

pub fn deg2rad(deg: f32) -> f32 {
    deg.to_radians()
}

pub fn rad2deg(rad: f32) -> f32 {
    rad.to_degrees()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc32_known_vectors() {
        assert_eq!(crc32_core(&[]), 0xFFFF_FFFF);
        assert_eq!(crc32_core(&[0]), 0xC704_DD7B);
        assert_eq!(crc32_core(&[1, 2, 3]), 0x64C5_1784);
    }

    #[test]
    fn crc32_detects_single_bit_flip() {
        let a = crc32_core(&[0xDEAD_BEEF, 42]);
        let b = crc32_core(&[0xDEAD_BEEF, 43]);
        assert_ne!(a, b);
    }

    #[test]
    fn lerp_and_clamp() {
        assert!((lerp(0.0, 2.0, 0.25) - 0.5).abs() < f32::EPSILON);
        assert!((clamp(5.0, -1.0, 1.0) - 1.0).abs() < f32::EPSILON);
        assert!((clamp(-5.0, -1.0, 1.0) + 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn degree_conversions() {
        assert!((deg2rad(180.0) - std::f32::consts::PI).abs() < 1e-6);
        assert!((rad2deg(std::f32::consts::FRAC_PI_2) - 90.0).abs() < 1e-4);
    }

    #[test]
    fn timestamp_is_monotone_enough() {
        let a = timestamp_us();
        let b = timestamp_us();
        assert!(b >= a);
        assert!(a > 1_600_000_000_000_000);
    }
}
