//! Proportional bucketing of a sample stream into min/max/RMS envelopes.
//!
//! Bucket `b` covers frames `[bucket_end(b - 1), bucket_end(b))` where
//! `bucket_end(b) = floor((b + 1) * total / BUCKET_COUNT)`, so the envelope
//! spans the whole track regardless of sample rate or length.

use super::downmix::DownmixTable;
use crate::waveform::{BUCKET_COUNT, Waveform, WaveformError, speakers};

/// First frame past the end of bucket `bucket`.
pub fn bucket_end(bucket: usize, total_frames: u64) -> u64 {
    ((bucket as u128 + 1) * total_frames as u128 / BUCKET_COUNT as u128) as u64
}

/// Bucket-major accumulator: index `[bucket * channels + channel]`.
pub struct BucketAccumulator {
    channels: usize,
    total_frames: u64,
    position: u64,
    bucket: usize,
    bucket_end: u64,
    bucket_frames: u64,
    minimum: Vec<f32>,
    maximum: Vec<f32>,
    rms: Vec<f32>,
    /// Sum of squares for the bucket in progress, one per channel.
    square_sums: Vec<f64>,
}

impl BucketAccumulator {
    pub fn new(channels: usize, total_frames: u64) -> Self {
        let mut acc = Self {
            channels,
            total_frames,
            position: 0,
            bucket: 0,
            bucket_end: bucket_end(0, total_frames),
            bucket_frames: 0,
            minimum: vec![0.0; BUCKET_COUNT * channels],
            maximum: vec![0.0; BUCKET_COUNT * channels],
            rms: vec![0.0; BUCKET_COUNT * channels],
            square_sums: vec![0.0; channels],
        };
        acc.open_bucket();
        acc.close_finished_buckets();
        acc
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Buckets finalized so far.
    pub fn completed_buckets(&self) -> usize {
        self.bucket
    }

    pub fn is_full(&self) -> bool {
        self.bucket >= BUCKET_COUNT
    }

    /// Frames still expected before every bucket is finalized.
    pub fn remaining_frames(&self) -> u64 {
        self.total_frames.saturating_sub(self.position)
    }

    /// Fold interleaved samples into the buckets. Frames past the declared
    /// length are ignored; a trailing partial frame is dropped.
    pub fn feed(&mut self, interleaved: &[f32]) {
        for frame in interleaved.chunks_exact(self.channels) {
            if self.is_full() {
                break;
            }
            let base = self.bucket * self.channels;
            for (ch, &sample) in frame.iter().enumerate() {
                let i = base + ch;
                self.minimum[i] = self.minimum[i].min(sample);
                self.maximum[i] = self.maximum[i].max(sample);
                self.square_sums[ch] += f64::from(sample) * f64::from(sample);
            }
            self.bucket_frames += 1;
            self.position += 1;
            self.close_finished_buckets();
        }
    }

    /// Treat every frame still expected as silence and finalize the
    /// remaining buckets. Returns the number of frames padded.
    pub fn fill_silence(&mut self) -> u64 {
        let padded = self.remaining_frames();
        while !self.is_full() {
            let frames = self.bucket_end.saturating_sub(self.position);
            if frames > 0 {
                let base = self.bucket * self.channels;
                for i in base..base + self.channels {
                    self.minimum[i] = self.minimum[i].min(0.0);
                    self.maximum[i] = self.maximum[i].max(0.0);
                }
                self.bucket_frames += frames;
                self.position += frames;
            }
            self.close_finished_buckets();
        }
        padded
    }

    fn open_bucket(&mut self) {
        if self.is_full() {
            return;
        }
        let base = self.bucket * self.channels;
        self.minimum[base..base + self.channels].fill(f32::INFINITY);
        self.maximum[base..base + self.channels].fill(f32::NEG_INFINITY);
        self.square_sums.fill(0.0);
        self.bucket_frames = 0;
    }

    fn close_finished_buckets(&mut self) {
        while !self.is_full() && self.position >= self.bucket_end {
            let base = self.bucket * self.channels;
            for ch in 0..self.channels {
                let i = base + ch;
                if self.bucket_frames == 0 {
                    self.minimum[i] = 0.0;
                    self.maximum[i] = 0.0;
                    self.rms[i] = 0.0;
                } else {
                    self.rms[i] = (self.square_sums[ch] / self.bucket_frames as f64).sqrt() as f32;
                }
            }
            self.bucket += 1;
            if !self.is_full() {
                self.bucket_end = bucket_end(self.bucket, self.total_frames);
            }
            self.open_bucket();
        }
    }

    /// Build a channel-major waveform from the finalized buckets. Buckets not
    /// yet finalized are zero-filled. With a downmix table the result is mono.
    pub fn to_waveform(
        &self,
        channel_map: u32,
        downmix: Option<&DownmixTable>,
    ) -> Result<Waveform, WaveformError> {
        let done = self.completed_buckets().min(BUCKET_COUNT);
        let (channels, channel_map, min, max, rms) = match downmix {
            Some(table) if self.channels > 1 => {
                let (min, max, rms) = table.mix(
                    channel_map,
                    self.channels,
                    &self.minimum[..done * self.channels],
                    &self.maximum[..done * self.channels],
                    &self.rms[..done * self.channels],
                );
                (1, speakers::MONO, min, max, rms)
            }
            _ => {
                let n = done * self.channels;
                (
                    self.channels,
                    channel_map,
                    self.minimum[..n].to_vec(),
                    self.maximum[..n].to_vec(),
                    self.rms[..n].to_vec(),
                )
            }
        };

        let transpose = |bucket_major: &[f32]| {
            let mut out = vec![0.0f32; channels * BUCKET_COUNT];
            for (i, &v) in bucket_major.iter().enumerate() {
                let (bucket, ch) = (i / channels, i % channels);
                out[ch * BUCKET_COUNT + bucket] = v;
            }
            out
        };

        Waveform::new(channel_map, transpose(&min), transpose(&max), transpose(&rms), done)
    }
}
