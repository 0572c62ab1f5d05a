//! Mono downmix of per-bucket envelopes.
//!
//! Built-in weights are keyed by speaker position, read from the stream's
//! channel map: front left and right at unity, LFE dropped, every other
//! speaker at -3 dB. A channel map that doesn't describe the stream falls
//! back to a uniform average. Config overrides are keyed by channel count
//! and win over the built-in weights. Weights are normalized to sum to one
//! so a signal present on every channel keeps its level.

use crate::waveform::{self, speakers};
use std::collections::HashMap;

const MINUS_3DB: f32 = std::f32::consts::FRAC_1_SQRT_2;

fn speaker_weight(bit: u32) -> f32 {
    match bit {
        speakers::FRONT_LEFT | speakers::FRONT_RIGHT => 1.0,
        speakers::LFE => 0.0,
        _ => MINUS_3DB,
    }
}

/// Built-in weights in channel-map order, or `None` if the map doesn't
/// describe `channels` speakers.
fn builtin_weights(channel_map: u32, channels: usize) -> Option<Vec<f32>> {
    if waveform::channel_count(channel_map) != channels {
        return None;
    }
    let w = (0..u32::BITS)
        .map(|i| 1u32 << i)
        .filter(|bit| channel_map & bit != 0)
        .map(speaker_weight)
        .collect();
    Some(w)
}

fn normalize(weights: &[f32]) -> Option<Vec<f32>> {
    let sum: f32 = weights.iter().sum();
    if weights.iter().any(|w| !w.is_finite() || *w < 0.0) || sum <= 0.0 {
        return None;
    }
    Some(weights.iter().map(|w| w / sum).collect())
}

/// Speaker-keyed mixing weights, with per-channel-count overrides from config.
#[derive(Debug, Clone, Default)]
pub struct DownmixTable {
    overrides: HashMap<usize, Vec<f32>>,
}

impl DownmixTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the weights used for `channels`-channel audio. Rejects
    /// mis-sized, negative or all-zero weight sets.
    pub fn set_override(&mut self, channels: usize, weights: &[f32]) -> bool {
        if weights.len() != channels {
            return false;
        }
        match normalize(weights) {
            Some(w) => {
                self.overrides.insert(channels, w);
                true
            }
            None => false,
        }
    }

    /// Normalized weights for `channels` channels laid out as `channel_map`.
    pub fn weights(&self, channel_map: u32, channels: usize) -> Vec<f32> {
        if let Some(w) = self.overrides.get(&channels) {
            return w.clone();
        }
        builtin_weights(channel_map, channels)
            .and_then(|w| normalize(&w))
            .unwrap_or_else(|| vec![1.0 / channels as f32; channels])
    }

    /// Mix bucket-major `(min, max, rms)` arrays down to one channel.
    /// Min and max mix linearly; RMS mixes in the power domain.
    pub fn mix(
        &self,
        channel_map: u32,
        channels: usize,
        minimum: &[f32],
        maximum: &[f32],
        rms: &[f32],
    ) -> (Vec<f32>, Vec<f32>, Vec<f32>) {
        let weights = self.weights(channel_map, channels);
        let buckets = minimum.len() / channels;
        let mut out_min = Vec::with_capacity(buckets);
        let mut out_max = Vec::with_capacity(buckets);
        let mut out_rms = Vec::with_capacity(buckets);

        for b in 0..buckets {
            let range = b * channels..(b + 1) * channels;
            let (mut lo, mut hi, mut power) = (0.0f32, 0.0f32, 0.0f32);
            for ((&w, (&mn, &mx)), &r) in weights
                .iter()
                .zip(minimum[range.clone()].iter().zip(&maximum[range.clone()]))
                .zip(&rms[range])
            {
                lo += w * mn;
                hi += w * mx;
                power += w * r * r;
            }
            out_min.push(lo);
            out_max.push(hi);
            out_rms.push(power.sqrt());
        }
        (out_min, out_max, out_rms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sum(w: &[f32]) -> f32 {
        w.iter().sum()
    }

    #[test]
    fn test_weights_are_normalized() {
        let table = DownmixTable::new();
        for channels in 1..=18 {
            let map = waveform::default_channel_map(channels);
            let w = table.weights(map, channels);
            assert_eq!(w.len(), channels);
            assert!((sum(&w) - 1.0).abs() < 1e-5, "{channels} channels sum to {}", sum(&w));
        }
        // LFE carries nothing in 5.1
        assert_eq!(table.weights(waveform::default_channel_map(6), 6)[3], 0.0);
        // A map that doesn't match the channel count: uniform
        assert!(table.weights(speakers::STEREO, 3).iter().all(|&w| (w - 1.0 / 3.0).abs() < 1e-6));
    }

    #[test]
    fn test_weights_follow_speaker_positions() {
        let table = DownmixTable::new();
        // Quad and FL FR FC LFE share a channel count but not a layout
        let quad = speakers::STEREO | speakers::BACK_LEFT | speakers::BACK_RIGHT;
        let w = table.weights(quad, 4);
        assert!(w.iter().all(|&x| x > 0.0));
        assert!((w[0] - w[1]).abs() < 1e-6);
        assert!(w[2] < w[0]);

        let three_one = speakers::STEREO | speakers::FRONT_CENTER | speakers::LFE;
        let w = table.weights(three_one, 4);
        assert_eq!(w[3], 0.0);
        assert!((sum(&w) - 1.0).abs() < 1e-6);
        assert!((w[2] / w[0] - MINUS_3DB).abs() < 1e-6);
    }

    #[test]
    fn test_stereo_mix() {
        let table = DownmixTable::new();
        // Two buckets, bucket-major L/R
        let min = [-1.0, -0.5, -0.2, 0.0];
        let max = [1.0, 0.5, 0.2, 0.0];
        let rms = [0.5, 0.5, 0.3, 0.4];
        let (lo, hi, r) = table.mix(speakers::STEREO, 2, &min, &max, &rms);

        assert_eq!(lo, vec![-0.75, -0.1]);
        assert_eq!(hi, vec![0.75, 0.1]);
        assert!((r[0] - 0.5).abs() < 1e-6);
        assert!((r[1] - (0.125f32).sqrt()).abs() < 1e-6);
        assert!(lo.iter().zip(&hi).all(|(a, b)| a <= b));
    }

    #[test]
    fn test_overrides() {
        let mut table = DownmixTable::new();
        assert!(table.set_override(3, &[2.0, 2.0, 0.0]));
        let surround = waveform::default_channel_map(3);
        assert_eq!(table.weights(surround, 3), vec![0.5, 0.5, 0.0]);

        assert!(!table.set_override(3, &[1.0, 1.0]));
        assert!(!table.set_override(2, &[1.0, -1.0]));
        assert!(!table.set_override(2, &[0.0, 0.0]));
        assert_eq!(table.weights(speakers::STEREO, 2), vec![0.5, 0.5]);
    }
}
