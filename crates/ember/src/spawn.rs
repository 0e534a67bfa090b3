//! # Spawn Scheduling
//!
//! A [`SpawnInfo`] is one batch of time-based spawns for a frame. Spawn
//! programs read its timing through the `Emitter.SpawnInterval`,
//! `Emitter.InterpSpawnStartDt` and `Emitter.SpawnGroup` parameters to
//! place each new instance inside the frame.

/// One batch of spawns requested for this frame.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SpawnInfo {
    /// Instances to spawn.
    pub count: usize,
    /// Seconds between consecutive spawns.
    pub interval_dt: f32,
    /// Seconds from the start of the frame to the first spawn.
    pub interp_start_dt: f32,
    /// User grouping tag forwarded to the spawn program.
    pub spawn_group: i32,
}

impl SpawnInfo {
    /// A burst of `count` instances at the start of the frame.
    #[must_use]
    pub const fn burst(count: usize) -> Self {
        Self {
            count,
            interval_dt: 0.0,
            interp_start_dt: 0.0,
            spawn_group: 0,
        }
    }
}

/// Continuous spawning at a fixed rate with fractional carry.
///
/// ```text
/// rate 10/s, dt 0.033:  0.33 -> 0 spawned, carry 0.33
///                       0.66 -> 0 spawned, carry 0.66
///                       0.99 -> 0 spawned, carry 0.99
///                       1.32 -> 1 spawned, carry 0.32
/// ```
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SpawnRate {
    rate: f32,
    carry: f32,
    spawn_group: i32,
}

impl SpawnRate {
    /// Spawns `rate` instances per second.
    #[must_use]
    pub fn new(rate: f32) -> Self {
        Self {
            rate: rate.max(0.0),
            carry: 0.0,
            spawn_group: 0,
        }
    }

    /// Tags spawns with `group`.
    #[must_use]
    pub const fn with_group(mut self, group: i32) -> Self {
        self.spawn_group = group;
        self
    }

    /// Instances per second.
    #[inline]
    #[must_use]
    pub const fn rate(&self) -> f32 {
        self.rate
    }

    /// Fraction of an instance owed from earlier frames.
    #[inline]
    #[must_use]
    pub const fn carry(&self) -> f32 {
        self.carry
    }

    /// Forgets the carried fraction.
    pub fn reset(&mut self) {
        self.carry = 0.0;
    }

    /// Advances by `dt` seconds and returns this frame's batch.
    ///
    /// `interp_start_dt` is the time until the first whole instance is
    /// owed, measured from the start of the frame.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    pub fn advance(&mut self, dt: f32) -> SpawnInfo {
        if self.rate <= 0.0 || dt <= 0.0 {
            return SpawnInfo {
                spawn_group: self.spawn_group,
                ..SpawnInfo::default()
            };
        }

        let interval_dt = 1.0 / self.rate;
        let interp_start_dt = (1.0 - self.carry) * interval_dt;
        let owed = self.rate.mul_add(dt, self.carry);
        let count = owed.floor();
        self.carry = owed - count;

        SpawnInfo {
            count: count as usize,
            interval_dt,
            interp_start_dt,
            spawn_group: self.spawn_group,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ten_per_second_at_tenth_of_second() {
        let mut rate = SpawnRate::new(10.0);
        let info = rate.advance(0.1);
        assert_eq!(info.count, 1);
        assert!((info.interval_dt - 0.1).abs() < 1e-6);
        assert!((info.interp_start_dt - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_fraction_carries_between_frames() {
        let mut rate = SpawnRate::new(10.0);
        let counts: Vec<usize> = (0..4).map(|_| rate.advance(0.04).count).collect();
        assert_eq!(counts, vec![0, 0, 1, 0]);
        assert!((rate.carry() - 0.6).abs() < 1e-4);
    }

    #[test]
    fn test_zero_rate_spawns_nothing() {
        let mut rate = SpawnRate::new(0.0).with_group(3);
        let info = rate.advance(1.0);
        assert_eq!(info.count, 0);
        assert_eq!(info.spawn_group, 3);
    }

    #[test]
    fn test_burst_starts_at_frame_start() {
        let info = SpawnInfo::burst(32);
        assert_eq!(info.count, 32);
        assert_eq!(info.interp_start_dt, 0.0);
    }
}
