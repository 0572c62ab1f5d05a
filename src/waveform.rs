use thiserror::Error;

/// Number of time buckets a track is summarized into.
pub const BUCKET_COUNT: usize = 2048;

/// Maximum channel count, bounded by the width of the channel map.
pub const MAX_CHANNELS: usize = 18;

/// Speaker positions in channel-map bit order.
pub mod speakers {
    pub const FRONT_LEFT: u32 = 1 << 0;
    pub const FRONT_RIGHT: u32 = 1 << 1;
    pub const FRONT_CENTER: u32 = 1 << 2;
    pub const LFE: u32 = 1 << 3;
    pub const BACK_LEFT: u32 = 1 << 4;
    pub const BACK_RIGHT: u32 = 1 << 5;
    pub const SIDE_LEFT: u32 = 1 << 9;
    pub const SIDE_RIGHT: u32 = 1 << 10;

    /// Every bit a channel map may use.
    pub const ALL: u32 = (1 << super::MAX_CHANNELS) - 1;

    pub const MONO: u32 = FRONT_CENTER;
    pub const STEREO: u32 = FRONT_LEFT | FRONT_RIGHT;
}

#[derive(Error, Debug, PartialEq)]
pub enum WaveformError {
    #[error("channel map {0:#x} is empty or out of range")]
    InvalidChannelMap(u32),
    #[error("expected {expected} samples per array, got {found}")]
    Length { expected: usize, found: usize },
}

/// Number of channels described by a channel map.
pub fn channel_count(channel_map: u32) -> usize {
    channel_map.count_ones() as usize
}

/// Conventional channel map for a bare channel count, used when the decoder
/// doesn't report one.
pub fn default_channel_map(channels: usize) -> u32 {
    use speakers::*;
    match channels {
        1 => MONO,
        2 => STEREO,
        3 => STEREO | FRONT_CENTER,
        4 => STEREO | BACK_LEFT | BACK_RIGHT,
        5 => STEREO | FRONT_CENTER | BACK_LEFT | BACK_RIGHT,
        6 => STEREO | FRONT_CENTER | LFE | BACK_LEFT | BACK_RIGHT,
        8 => STEREO | FRONT_CENTER | LFE | BACK_LEFT | BACK_RIGHT | SIDE_LEFT | SIDE_RIGHT,
        n if n <= MAX_CHANNELS => ((1u64 << n) - 1) as u32,
        _ => 0,
    }
}

/// Per-channel min/max/RMS envelope over [`BUCKET_COUNT`] buckets.
///
/// Arrays are stored channel-major: channel `c` occupies
/// `[c * BUCKET_COUNT, (c + 1) * BUCKET_COUNT)`. Waveforms are immutable once
/// built and are shared as `Arc<Waveform>`.
#[derive(Debug, Clone, PartialEq)]
pub struct Waveform {
    channel_map: u32,
    valid_buckets: usize,
    minimum: Vec<f32>,
    maximum: Vec<f32>,
    rms: Vec<f32>,
}

impl Waveform {
    pub fn new(
        channel_map: u32,
        minimum: Vec<f32>,
        maximum: Vec<f32>,
        rms: Vec<f32>,
        valid_buckets: usize,
    ) -> Result<Self, WaveformError> {
        let channels = channel_count(channel_map);
        if channels == 0 || channel_map & !speakers::ALL != 0 {
            return Err(WaveformError::InvalidChannelMap(channel_map));
        }
        let expected = channels * BUCKET_COUNT;
        for found in [minimum.len(), maximum.len(), rms.len()] {
            if found != expected {
                return Err(WaveformError::Length { expected, found });
            }
        }
        Ok(Self {
            channel_map,
            valid_buckets: valid_buckets.min(BUCKET_COUNT),
            minimum,
            maximum,
            rms,
        })
    }

    /// All-zero mono waveform with no valid buckets, handed out while analysis runs.
    pub fn placeholder() -> Self {
        let zeros = vec![0.0; BUCKET_COUNT];
        Self {
            channel_map: speakers::MONO,
            valid_buckets: 0,
            minimum: zeros.clone(),
            maximum: zeros.clone(),
            rms: zeros,
        }
    }

    pub fn channel_map(&self) -> u32 {
        self.channel_map
    }

    pub fn channel_count(&self) -> usize {
        channel_count(self.channel_map)
    }

    /// Buckets holding real data; the rest are zero-filled.
    pub fn valid_buckets(&self) -> usize {
        self.valid_buckets
    }

    pub fn is_complete(&self) -> bool {
        self.valid_buckets == BUCKET_COUNT
    }

    pub fn minimum(&self, channel: usize) -> &[f32] {
        &self.minimum[channel * BUCKET_COUNT..(channel + 1) * BUCKET_COUNT]
    }

    pub fn maximum(&self, channel: usize) -> &[f32] {
        &self.maximum[channel * BUCKET_COUNT..(channel + 1) * BUCKET_COUNT]
    }

    pub fn rms(&self, channel: usize) -> &[f32] {
        &self.rms[channel * BUCKET_COUNT..(channel + 1) * BUCKET_COUNT]
    }

    /// Flat channel-major arrays, as persisted.
    pub fn raw_minimum(&self) -> &[f32] {
        &self.minimum
    }

    pub fn raw_maximum(&self) -> &[f32] {
        &self.maximum
    }

    pub fn raw_rms(&self) -> &[f32] {
        &self.rms
    }

    /// Largest absolute sample value seen on a channel.
    pub fn peak(&self, channel: usize) -> f32 {
        self.minimum(channel)
            .iter()
            .zip(self.maximum(channel))
            .fold(0.0_f32, |acc, (lo, hi)| acc.max(lo.abs()).max(hi.abs()))
    }

    /// Mean of the per-bucket RMS values on a channel.
    pub fn mean_rms(&self, channel: usize) -> f32 {
        self.rms(channel).iter().sum::<f32>() / BUCKET_COUNT as f32
    }
}
