//! Jitter-absorbing motion interpolation for remote participants.
//!
//! One [`InterpolationBuffer`] exists per remote participant. Inbound
//! `PLAYER_UPDATE` samples are buffered in timestamp order; the renderer
//! asks for a smoothed pose once per frame, always targeting
//! `render_time - PLAYBACK_DELAY_MS`. With realistic jitter (50–150 ms
//! variance) the target time usually falls between two real samples, so
//! the returned pose is a plain linear blend rather than a guess.
//!
//! All timestamps are receiver-local milliseconds on one monotonic clock;
//! no cross-peer clock synchronization is assumed.

use std::collections::VecDeque;

/// Only the most recent samples are kept.
pub const MAX_SAMPLES: usize = 20;

/// Fixed rendering lag that buys interpolation headroom.
pub const PLAYBACK_DELAY_MS: u64 = 100;

/// How far past the newest sample dead-reckoning may run before the pose
/// freezes. Prevents runaway extrapolation during a network stall.
pub const MAX_EXTRAPOLATION_MS: u64 = 200;

/// One buffered motion sample from a `PLAYER_UPDATE`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionSample {
    pub position: [f32; 3],
    pub yaw: f32,
    pub velocity: [f32; 3],
    pub timestamp_ms: u64,
}

/// Smoothed pose handed to the rendering collaborator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InterpolatedState {
    pub position: [f32; 3],
    pub yaw: f32,
}

/// Timestamp-ordered sample window for one remote participant.
#[derive(Debug, Default)]
pub struct InterpolationBuffer {
    samples: VecDeque<MotionSample>,
}

impl InterpolationBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a sample, keeping the buffer sorted by timestamp and capped
    /// at [`MAX_SAMPLES`]. Samples normally arrive in order, so the common
    /// case is a plain append.
    pub fn add_sample(&mut self, sample: MotionSample) {
        match self.samples.back() {
            Some(last) if sample.timestamp_ms < last.timestamp_ms => {
                // Late arrival: walk back to its slot.
                let idx = self
                    .samples
                    .iter()
                    .position(|s| s.timestamp_ms > sample.timestamp_ms)
                    .unwrap_or(self.samples.len());
                self.samples.insert(idx, sample);
            }
            _ => self.samples.push_back(sample),
        }
        while self.samples.len() > MAX_SAMPLES {
            self.samples.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Newest buffered timestamp, if any.
    pub fn latest_timestamp(&self) -> Option<u64> {
        self.samples.back().map(|s| s.timestamp_ms)
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    /// Smoothed pose for `render_time_ms`, targeting
    /// `render_time_ms - PLAYBACK_DELAY_MS`.
    ///
    /// Three boundary cases:
    /// - every buffered sample is newer than the target: the oldest sample
    ///   is returned verbatim (there is nothing further back to blend with);
    /// - the target is past the newest sample: dead-reckon from the newest
    ///   sample with its velocity, clamped to [`MAX_EXTRAPOLATION_MS`],
    ///   frozen beyond;
    /// - empty buffer: `None` — the caller must not render this avatar.
    pub fn interpolated_state(&self, render_time_ms: u64) -> Option<InterpolatedState> {
        let (front, back) = match (self.samples.front(), self.samples.back()) {
            (Some(f), Some(b)) => (f, b),
            _ => return None,
        };
        let target = render_time_ms.saturating_sub(PLAYBACK_DELAY_MS);

        if target <= front.timestamp_ms {
            return Some(InterpolatedState {
                position: front.position,
                yaw: front.yaw,
            });
        }

        if target >= back.timestamp_ms {
            let ahead_ms = (target - back.timestamp_ms).min(MAX_EXTRAPOLATION_MS);
            let dt = ahead_ms as f32 / 1000.0;
            return Some(InterpolatedState {
                position: [
                    back.position[0] + back.velocity[0] * dt,
                    back.position[1] + back.velocity[1] * dt,
                    back.position[2] + back.velocity[2] * dt,
                ],
                yaw: back.yaw,
            });
        }

        // Two real samples straddle the target: blend.
        let mut prev = front;
        for next in self.samples.iter().skip(1) {
            if next.timestamp_ms >= target {
                let span = (next.timestamp_ms - prev.timestamp_ms) as f32;
                let t = if span > 0.0 {
                    (target - prev.timestamp_ms) as f32 / span
                } else {
                    1.0
                };
                return Some(InterpolatedState {
                    position: [
                        lerp(prev.position[0], next.position[0], t),
                        lerp(prev.position[1], next.position[1], t),
                        lerp(prev.position[2], next.position[2], t),
                    ],
                    yaw: lerp_yaw(prev.yaw, next.yaw, t),
                });
            }
            prev = next;
        }
        unreachable!("target is bounded by front/back timestamps");
    }
}

fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}

/// Angular interpolation along the shortest arc, so a yaw crossing the
/// ±π seam never spins the long way round.
pub fn lerp_yaw(a: f32, b: f32, t: f32) -> f32 {
    use std::f32::consts::{PI, TAU};
    let mut delta = (b - a) % TAU;
    if delta > PI {
        delta -= TAU;
    } else if delta < -PI {
        delta += TAU;
    }
    a + delta * t
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::PI;

    fn sample(t: u64, x: f32, vx: f32) -> MotionSample {
        MotionSample {
            position: [x, 0.0, 0.0],
            yaw: 0.0,
            velocity: [vx, 0.0, 0.0],
            timestamp_ms: t,
        }
    }

    #[test]
    fn test_empty_buffer_returns_none() {
        let buf = InterpolationBuffer::new();
        assert_eq!(buf.interpolated_state(1000), None);
    }

    #[test]
    fn test_blend_between_bounding_samples() {
        let mut buf = InterpolationBuffer::new();
        buf.add_sample(sample(1000, 0.0, 0.0));
        buf.add_sample(sample(1100, 10.0, 0.0));

        // render 1150 → target 1050, halfway between the samples
        let state = buf.interpolated_state(1150).unwrap();
        assert!((state.position[0] - 5.0).abs() < 1e-4);
    }

    #[test]
    fn test_blend_stays_inside_sample_bounds() {
        // Convexity: for any target inside the buffered range, each axis is
        // within the bounding samples' min/max.
        let mut buf = InterpolationBuffer::new();
        let points = [
            (1000u64, [0.0, 5.0, -2.0]),
            (1050, [1.0, 4.0, -1.0]),
            (1130, [3.0, 8.0, 0.5]),
            (1200, [2.0, 7.0, 4.0]),
        ];
        for (t, p) in points {
            buf.add_sample(MotionSample {
                position: p,
                yaw: 0.0,
                velocity: [0.0; 3],
                timestamp_ms: t,
            });
        }
        let (lo, hi) = (1000u64, 1200u64);
        for target in (lo..=hi).step_by(7) {
            let state = buf.interpolated_state(target + PLAYBACK_DELAY_MS).unwrap();
            for axis in 0..3 {
                let min = points.iter().map(|(_, p)| p[axis]).fold(f32::MAX, f32::min);
                let max = points.iter().map(|(_, p)| p[axis]).fold(f32::MIN, f32::max);
                assert!(
                    state.position[axis] >= min - 1e-4 && state.position[axis] <= max + 1e-4,
                    "axis {axis} escaped bounds at target {target}"
                );
            }
        }
    }

    #[test]
    fn test_all_samples_newer_returns_oldest_verbatim() {
        let mut buf = InterpolationBuffer::new();
        buf.add_sample(sample(5000, 3.0, 1.0));
        buf.add_sample(sample(5100, 4.0, 1.0));

        // render 4000 → target 3900, older than everything buffered
        let state = buf.interpolated_state(4000).unwrap();
        assert_eq!(state.position, [3.0, 0.0, 0.0]);
    }

    #[test]
    fn test_extrapolation_uses_velocity() {
        let mut buf = InterpolationBuffer::new();
        buf.add_sample(sample(1000, 0.0, 10.0)); // 10 units/s along x

        // render 1200 → target 1100, 100ms past the sample
        let state = buf.interpolated_state(1200).unwrap();
        assert!((state.position[0] - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_extrapolation_freezes_after_cap() {
        let mut buf = InterpolationBuffer::new();
        buf.add_sample(sample(1000, 0.0, 10.0));

        let at_cap = buf
            .interpolated_state(1000 + PLAYBACK_DELAY_MS + MAX_EXTRAPOLATION_MS)
            .unwrap();
        let far_past = buf.interpolated_state(1_000_000).unwrap();
        assert_eq!(at_cap.position, far_past.position);
        assert!((at_cap.position[0] - 2.0).abs() < 1e-4); // 10 u/s × 0.2 s
    }

    #[test]
    fn test_buffer_caps_at_max_samples() {
        let mut buf = InterpolationBuffer::new();
        for i in 0..(MAX_SAMPLES as u64 + 15) {
            buf.add_sample(sample(i * 50, i as f32, 0.0));
        }
        assert_eq!(buf.len(), MAX_SAMPLES);
        // The oldest kept sample is the 16th pushed.
        assert_eq!(buf.interpolated_state(0).unwrap().position[0], 15.0);
    }

    #[test]
    fn test_out_of_order_sample_is_sorted_in() {
        let mut buf = InterpolationBuffer::new();
        buf.add_sample(sample(1000, 0.0, 0.0));
        buf.add_sample(sample(1200, 20.0, 0.0));
        buf.add_sample(sample(1100, 10.0, 0.0)); // late arrival

        // target 1100 lands exactly on the late sample
        let state = buf.interpolated_state(1200).unwrap();
        assert!((state.position[0] - 10.0).abs() < 1e-4);
    }

    #[test]
    fn test_yaw_wraps_shortest_path() {
        // 170° to -170° should pass through 180°, not 0°.
        let a = 170.0_f32.to_radians();
        let b = -170.0_f32.to_radians();
        let mid = lerp_yaw(a, b, 0.5);
        let expected = PI; // 180°, up to sign/wrap
        assert!(
            (mid.abs() - expected).abs() < 1e-4,
            "midpoint {mid} should sit on the ±π seam"
        );
    }

    #[test]
    fn test_yaw_blend_between_samples() {
        let mut buf = InterpolationBuffer::new();
        buf.add_sample(MotionSample {
            position: [0.0; 3],
            yaw: 0.0,
            velocity: [0.0; 3],
            timestamp_ms: 1000,
        });
        buf.add_sample(MotionSample {
            position: [0.0; 3],
            yaw: PI / 2.0,
            velocity: [0.0; 3],
            timestamp_ms: 1100,
        });
        let state = buf.interpolated_state(1150).unwrap();
        assert!((state.yaw - PI / 4.0).abs() < 1e-4);
    }
}
