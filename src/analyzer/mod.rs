pub mod buckets;
pub mod decode;
pub mod downmix;

use crate::location::{Location, is_location_forbidden};
use crate::notify::{UpdateSender, WaveformUpdate};
use crate::waveform::{self, BUCKET_COUNT, MAX_CHANNELS, Waveform};
use buckets::BucketAccumulator;
use decode::{AudioInfo, AudioSource, DecodeError, DecoderFactory};
use downmix::DownmixTable;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Longest track we are willing to summarize (31 days).
pub const MAX_DURATION_SECS: f64 = 31.0 * 24.0 * 3600.0;

#[derive(Error, Debug)]
pub enum AnalyzeError {
    #[error("Source is not seekable")]
    NotSeekable,
    #[error("Unsupported path: {0}")]
    UnsupportedPath(String),
    #[error("Duration out of range: {0:.1}s")]
    DurationOutOfRange(f64),
    #[error("Channel count changed mid-stream: {expected} -> {found}")]
    ChannelMismatch { expected: usize, found: usize },
    #[error("Too many channels: {0}")]
    TooManyChannels(usize),
    #[error("Decoder produced no audio")]
    EmptyStream,
    #[error("Decode error: {0}")]
    Decode(DecodeError),
    #[error("Waveform error: {0}")]
    Waveform(#[from] waveform::WaveformError),
}

impl From<DecodeError> for AnalyzeError {
    fn from(e: DecodeError) -> Self {
        match e {
            DecodeError::Unsupported(path) => Self::UnsupportedPath(path),
            other => Self::Decode(other),
        }
    }
}

/// Knobs that shape a single analysis.
#[derive(Debug, Clone)]
pub struct AnalysisSettings {
    /// Collapse all channels to mono before storing.
    pub downmix: Option<DownmixTable>,
    /// Minimum wall-clock gap between partial waveform reports.
    pub progress_interval: Duration,
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            downmix: None,
            progress_interval: Duration::from_millis(500),
        }
    }
}

/// Everything a job needs from its surroundings for one step.
pub struct AnalysisEnv<'a> {
    pub decoders: &'a dyn DecoderFactory,
    /// Reads an existing stored waveform, if any.
    pub lookup: &'a dyn Fn(&Location) -> Option<Waveform>,
    pub abort: &'a AtomicBool,
    pub settings: &'a AnalysisSettings,
    pub updates: Option<&'a UpdateSender>,
}

/// Result of advancing a job by one step.
#[derive(Debug)]
pub enum StepOutcome {
    NotDone,
    Done(Arc<Waveform>),
    /// Skipped: the stored waveform is returned, or `None` for excluded locations.
    Elided(Option<Arc<Waveform>>),
    Aborted,
    Failed(AnalyzeError),
}

/// What to analyze and on whose behalf.
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub location: Location,
    /// Re-run even if a waveform is stored.
    pub forced: bool,
    /// Requested by a user rather than a background pass.
    pub user_submitted: bool,
}

enum Phase {
    Setup,
    Accumulate(Box<Accumulation>),
    Finished,
}

struct Accumulation {
    source: Box<dyn AudioSource>,
    total_frames: u64,
    /// Allocated when the first chunk reveals the channel count.
    buckets: Option<BucketAccumulator>,
    channel_map: u32,
    last_report: Instant,
    last_reported_bucket: usize,
}

/// Two-phase analysis job, advanced one step at a time by a worker.
pub struct AnalysisJob {
    request: AnalysisRequest,
    phase: Phase,
    progress: f32,
}

impl AnalysisJob {
    pub fn new(request: AnalysisRequest) -> Self {
        Self {
            request,
            phase: Phase::Setup,
            progress: 0.0,
        }
    }

    pub fn location(&self) -> &Location {
        &self.request.location
    }

    /// Fraction of buckets finalized, in `[0, 1]`.
    pub fn progress(&self) -> f32 {
        self.progress
    }

    /// Advance by one step: setup on the first call, then one decoded chunk per call.
    pub fn step(&mut self, env: &AnalysisEnv<'_>) -> StepOutcome {
        if env.abort.load(Ordering::Relaxed) {
            return StepOutcome::Aborted;
        }

        let outcome = match std::mem::replace(&mut self.phase, Phase::Finished) {
            Phase::Setup => self.setup(env),
            Phase::Accumulate(acc) => self.accumulate(acc, env),
            Phase::Finished => Ok(StepOutcome::Elided(None)),
        };
        outcome.unwrap_or_else(StepOutcome::Failed)
    }

    fn setup(&mut self, env: &AnalysisEnv<'_>) -> Result<StepOutcome, AnalyzeError> {
        let request = &self.request;

        if !request.user_submitted && is_location_forbidden(&request.location) {
            log::debug!("Skipping excluded location {}", request.location);
            return Ok(StepOutcome::Elided(None));
        }

        if !request.forced {
            if let Some(existing) = (env.lookup)(&request.location) {
                log::debug!("Already stored: {}", request.location);
                return Ok(StepOutcome::Elided(Some(Arc::new(existing))));
            }
        }

        let mut source = env.decoders.open(&request.location)?;
        if !source.can_seek() {
            return Err(AnalyzeError::NotSeekable);
        }

        let info = complete_info(source.info(), source.dynamic_info());
        let (sample_rate, total_frames) = match (info.sample_rate, info.length) {
            (Some(rate), Some(len)) if rate > 0 => (rate, len),
            _ => return Err(AnalyzeError::DurationOutOfRange(0.0)),
        };
        let duration = total_frames as f64 / f64::from(sample_rate);
        if duration <= 0.0 || duration > MAX_DURATION_SECS {
            return Err(AnalyzeError::DurationOutOfRange(duration));
        }

        log::debug!(
            "Analyzing {} ({} frames at {} Hz, {:.1}s)",
            request.location,
            total_frames,
            sample_rate,
            duration
        );

        self.phase = Phase::Accumulate(Box::new(Accumulation {
            source,
            total_frames,
            buckets: None,
            channel_map: 0,
            last_report: Instant::now(),
            last_reported_bucket: 0,
        }));
        Ok(StepOutcome::NotDone)
    }

    fn accumulate(
        &mut self,
        mut acc: Box<Accumulation>,
        env: &AnalysisEnv<'_>,
    ) -> Result<StepOutcome, AnalyzeError> {
        match acc.source.next_chunk()? {
            Some(chunk) if chunk.channels > 0 => {
                let buckets = match &mut acc.buckets {
                    Some(b) => {
                        if b.channels() != chunk.channels {
                            return Err(AnalyzeError::ChannelMismatch {
                                expected: b.channels(),
                                found: chunk.channels,
                            });
                        }
                        b
                    }
                    slot => {
                        if chunk.channels > MAX_CHANNELS {
                            return Err(AnalyzeError::TooManyChannels(chunk.channels));
                        }
                        let declared = chunk.channel_map & waveform::speakers::ALL;
                        acc.channel_map = if waveform::channel_count(declared) == chunk.channels {
                            declared
                        } else {
                            waveform::default_channel_map(chunk.channels)
                        };
                        slot.insert(BucketAccumulator::new(chunk.channels, acc.total_frames))
                    }
                };
                buckets.feed(&chunk.samples);
            }
            Some(_) => {
                self.phase = Phase::Accumulate(acc);
                return Ok(StepOutcome::NotDone);
            }
            None => match &mut acc.buckets {
                // Decoder ran dry early: pad so the bucket boundaries still line up
                Some(b) => {
                    let padded = b.fill_silence();
                    log::debug!(
                        "{} ended {} frames early, padded with silence",
                        self.request.location,
                        padded
                    );
                }
                None => return Err(AnalyzeError::EmptyStream),
            },
        }

        let Some(buckets) = &acc.buckets else {
            return Err(AnalyzeError::EmptyStream);
        };

        self.progress = buckets.completed_buckets() as f32 / BUCKET_COUNT as f32;

        if buckets.is_full() {
            let waveform = buckets.to_waveform(acc.channel_map, env.settings.downmix.as_ref())?;
            return Ok(StepOutcome::Done(Arc::new(waveform)));
        }

        if let Some(updates) = env.updates {
            let completed = buckets.completed_buckets();
            if completed > acc.last_reported_bucket
                && acc.last_report.elapsed() >= env.settings.progress_interval
            {
                let partial = buckets.to_waveform(acc.channel_map, env.settings.downmix.as_ref())?;
                updates.publish(WaveformUpdate {
                    location: self.request.location.clone(),
                    waveform: Arc::new(partial),
                    valid_buckets: completed,
                });
                acc.last_report = Instant::now();
                acc.last_reported_bucket = completed;
            }
        }

        self.phase = Phase::Accumulate(acc);
        Ok(StepOutcome::NotDone)
    }
}

/// Fill gaps in the declared info from what the decoder learned dynamically.
fn complete_info(declared: AudioInfo, dynamic: Option<AudioInfo>) -> AudioInfo {
    let dynamic = dynamic.unwrap_or_default();
    AudioInfo {
        sample_rate: declared.sample_rate.filter(|&r| r > 0).or(dynamic.sample_rate),
        length: declared.length.filter(|&n| n > 0).or(dynamic.length),
    }
}

/// Run a job to completion on the calling thread.
pub fn analyze_to_completion(job: &mut AnalysisJob, env: &AnalysisEnv<'_>) -> StepOutcome {
    loop {
        match job.step(env) {
            StepOutcome::NotDone => continue,
            other => return other,
        }
    }
}
