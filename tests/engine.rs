use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use wavecache::analyzer::decode::{AudioChunk, AudioInfo, AudioSource, DecodeError, DecoderFactory};
use wavecache::config::EngineSettings;
use wavecache::db::Database;
use wavecache::db::models::Job;
use wavecache::location::{Location, MediaExists};
use wavecache::waveform::{self, BUCKET_COUNT, speakers};
use wavecache::{CacheEngine, Query, QueryHandle, Urgency};

const WAIT: Duration = Duration::from_secs(20);

/// Produces a triangle wave on every channel, `delay` per chunk.
struct FakeDecoder {
    channel_map: u32,
    sample_rate: u32,
    frames: u64,
    chunk_frames: usize,
    delay: Duration,
    opened: Mutex<Vec<Location>>,
}

impl FakeDecoder {
    fn new(channel_map: u32, frames: u64) -> Self {
        Self {
            channel_map,
            sample_rate: 44100,
            frames,
            chunk_frames: 4096,
            delay: Duration::ZERO,
            opened: Mutex::new(Vec::new()),
        }
    }

    fn slow(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn opened(&self) -> Vec<Location> {
        self.opened.lock().unwrap().clone()
    }
}

struct FakeSource {
    channels: usize,
    channel_map: u32,
    sample_rate: u32,
    frames: u64,
    position: u64,
    chunk_frames: usize,
    delay: Duration,
}

impl AudioSource for FakeSource {
    fn info(&self) -> AudioInfo {
        AudioInfo {
            sample_rate: Some(self.sample_rate),
            length: Some(self.frames),
        }
    }

    fn can_seek(&self) -> bool {
        true
    }

    fn next_chunk(&mut self) -> Result<Option<AudioChunk>, DecodeError> {
        if self.position >= self.frames {
            return Ok(None);
        }
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        let n = (self.frames - self.position).min(self.chunk_frames as u64);
        let mut samples = Vec::with_capacity(n as usize * self.channels);
        for i in self.position..self.position + n {
            let phase = (i % 200) as f32 / 100.0 - 1.0;
            for _ in 0..self.channels {
                samples.push(phase * 0.8);
            }
        }
        self.position += n;
        Ok(Some(AudioChunk {
            samples,
            channels: self.channels,
            channel_map: self.channel_map,
            sample_rate: self.sample_rate,
        }))
    }
}

impl DecoderFactory for FakeDecoder {
    fn open(&self, location: &Location) -> Result<Box<dyn AudioSource>, DecodeError> {
        self.opened.lock().unwrap().push(location.clone());
        Ok(Box::new(FakeSource {
            channels: waveform::channel_count(self.channel_map),
            channel_map: self.channel_map,
            sample_rate: self.sample_rate,
            frames: self.frames,
            position: 0,
            chunk_frames: self.chunk_frames,
            delay: self.delay,
        }))
    }
}

struct EverythingExists;

impl MediaExists for EverythingExists {
    fn exists(&self, _: &Location) -> bool {
        true
    }
}

fn engine_with(db: Database, decoder: &Arc<FakeDecoder>, workers: usize) -> CacheEngine {
    CacheEngine::new(
        db,
        decoder.clone(),
        Arc::new(EverythingExists),
        EngineSettings {
            workers,
            ..Default::default()
        },
    )
}

fn query(path: &str, urgency: Urgency) -> QueryHandle {
    Query::new(Location::new(path, 0), urgency).into_handle()
}

#[test]
fn test_needed_query_gets_placeholder_then_full_waveform() {
    let surround = speakers::FRONT_LEFT
        | speakers::FRONT_RIGHT
        | speakers::FRONT_CENTER
        | speakers::LFE
        | speakers::BACK_LEFT
        | speakers::BACK_RIGHT;
    let decoder = Arc::new(FakeDecoder::new(surround, 441_000));
    let mut engine = engine_with(Database::open_in_memory().unwrap(), &decoder, 2);
    engine.start().unwrap();

    let deliveries = Arc::new(Mutex::new(Vec::new()));
    let seen = deliveries.clone();
    let q = Query::new(Location::new("/music/live.flac", 0), Urgency::Needed)
        .on_complete(move |q| {
            let valid = q.waveform().map(|w| w.valid_buckets());
            seen.lock().unwrap().push(valid);
        })
        .into_handle();

    let placeholder = engine.get_waveform(&q);
    assert_eq!(placeholder.valid_buckets(), 0);
    assert!(q.wait(WAIT));

    let w = q.waveform().unwrap();
    assert_eq!(w.valid_buckets(), BUCKET_COUNT);
    assert_eq!(w.channel_count(), surround.count_ones() as usize);
    for ch in 0..w.channel_count() {
        assert_eq!(w.minimum(ch).len(), BUCKET_COUNT);
        assert!(w.rms(ch).iter().all(|&r| r >= 0.0));
        assert!(w.minimum(ch).iter().zip(w.maximum(ch)).all(|(lo, hi)| lo <= hi));
    }
    assert_eq!(
        *deliveries.lock().unwrap(),
        vec![Some(0), Some(BUCKET_COUNT)]
    );

    engine.shutdown().unwrap();
}

#[test]
fn test_cached_location_is_never_decoded_twice() {
    let decoder = Arc::new(FakeDecoder::new(speakers::STEREO, 88_200));
    let mut engine = engine_with(Database::open_in_memory().unwrap(), &decoder, 2);
    engine.start().unwrap();

    let first = query("/music/a.flac", Urgency::Desired);
    engine.get_waveform(&first);
    assert!(first.wait(WAIT));
    let stored = first.waveform().unwrap();

    for _ in 0..2 {
        let again = query("/music/a.flac", Urgency::Desired);
        let w = engine.get_waveform(&again);
        assert!(again.is_done());
        assert_eq!(*w, *stored);
    }
    assert!(engine.wait_idle(WAIT));
    assert_eq!(decoder.opened().len(), 1);
}

#[test]
fn test_shutdown_persists_jobs_and_restart_replays_them() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("waveforms.db");

    // First run: a slow decoder guarantees nothing finishes
    let slow = Arc::new(FakeDecoder::new(speakers::STEREO, 44_100 * 600).slow(Duration::from_millis(5)));
    let mut engine = engine_with(Database::open(&db_path).unwrap(), &slow, 1);
    engine.start().unwrap();

    let background = query("/music/bulk.flac", Urgency::Bulk);
    engine.get_waveform(&background);
    let forced = Query::new(Location::new("/music/forced.flac", 0), Urgency::Bulk)
        .forced(true)
        .into_handle();
    engine.get_waveform(&forced);

    let deadline = std::time::Instant::now() + WAIT;
    while slow.opened().is_empty() {
        assert!(std::time::Instant::now() < deadline);
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(engine.shutdown().unwrap(), 2);
    assert!(!background.is_done());
    drop(engine);

    let jobs = Database::open(&db_path).unwrap().get_jobs().unwrap();
    assert_eq!(
        jobs,
        vec![
            Job {
                location: Location::new("/music/forced.flac", 0),
                user_submitted: true,
            },
            Job {
                location: Location::new("/music/bulk.flac", 0),
                user_submitted: false,
            },
        ]
    );

    // Second run replays both at bulk urgency and clears the table
    let fast = Arc::new(FakeDecoder::new(speakers::STEREO, 44_100));
    let mut engine = engine_with(Database::open(&db_path).unwrap(), &fast, 2);
    assert_eq!(engine.start().unwrap(), 2);
    assert_eq!(engine.stats().unwrap().jobs, 0);

    assert!(engine.wait_idle(WAIT));
    assert!(engine.has_waveform(&Location::new("/music/bulk.flac", 0)));
    assert!(engine.has_waveform(&Location::new("/music/forced.flac", 0)));
    assert_eq!(fast.opened().len(), 2);
    assert_eq!(engine.shutdown().unwrap(), 0);
}

#[test]
fn test_needed_request_overtakes_bulk_backlog() {
    let decoder = Arc::new(FakeDecoder::new(speakers::MONO, 44_100 * 5).slow(Duration::from_millis(1)));
    let mut engine = engine_with(Database::open_in_memory().unwrap(), &decoder, 1);
    engine.start().unwrap();

    let backlog: Vec<_> = (0..30)
        .map(|i| query(&format!("/music/bulk{i:02}.flac"), Urgency::Bulk))
        .collect();
    for q in &backlog {
        engine.get_waveform(q);
    }

    let now_playing = query("/music/now-playing.flac", Urgency::Needed);
    engine.get_waveform(&now_playing);
    assert!(now_playing.wait(WAIT));
    assert!(now_playing.waveform().unwrap().is_complete());

    let opened = decoder.opened();
    let pos = opened
        .iter()
        .position(|l| l.path == "/music/now-playing.flac")
        .unwrap();
    assert!(pos <= 2, "needed opened at position {pos}");
    assert!(backlog.iter().filter(|q| q.is_done()).count() < backlog.len());
    engine.shutdown().unwrap();
}

#[test]
fn test_corrupt_row_reads_as_miss_and_is_deleted() {
    let db = Database::open_in_memory().unwrap();
    db.conn
        .execute("INSERT INTO files (location, subsong) VALUES ('/music/bad.flac', 0)", [])
        .unwrap();
    db.conn
        .execute(
            "INSERT INTO waveforms (file_id, channels, compression, min, max, rms)
             VALUES (1, 3, 99, x'00', x'00', x'00')",
            [],
        )
        .unwrap();

    let decoder = Arc::new(FakeDecoder::new(speakers::STEREO, 44_100));
    let engine = engine_with(db, &decoder, 1);
    let location = Location::new("/music/bad.flac", 0);

    assert!(engine.has_waveform(&location));
    assert!(engine.get_waveform_sync(&location).is_none());
    assert!(!engine.has_waveform(&location));
    assert!(engine.get_waveform_sync(&location).is_none());
    assert_eq!(engine.stats().unwrap().files, 0);
}

#[test]
fn test_downmix_stores_mono() {
    let mut settings = EngineSettings {
        workers: 1,
        ..Default::default()
    };
    settings.analysis.downmix = Some(Default::default());

    let decoder = Arc::new(FakeDecoder::new(speakers::STEREO, 44_100));
    let mut engine = CacheEngine::new(
        Database::open_in_memory().unwrap(),
        decoder.clone(),
        Arc::new(EverythingExists),
        settings,
    );
    engine.start().unwrap();

    let q = query("/music/a.flac", Urgency::Needed);
    engine.get_waveform(&q);
    assert!(q.wait(WAIT));
    let w = engine.get_waveform_sync(q.location()).unwrap();
    assert_eq!(w.channel_count(), 1);
    assert_eq!(w.channel_map(), speakers::MONO);
}
