use crate::location::Location;
use crate::waveform;
use std::fs::File;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CODEC_TYPE_NULL, Decoder, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::{MediaSource, MediaSourceStream};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("No decoder for {0}")]
    Unsupported(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Codec error: {0}")]
    Codec(String),
}

/// Stream properties as reported by the decoder. Either field may be unknown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AudioInfo {
    pub sample_rate: Option<u32>,
    /// Length in frames (samples per channel).
    pub length: Option<u64>,
}

/// One block of decoded, interleaved audio.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub samples: Vec<f32>,
    pub channels: usize,
    /// Speaker layout bitmask; 0 when the decoder doesn't know.
    pub channel_map: u32,
    pub sample_rate: u32,
}

impl AudioChunk {
    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.samples.len() / self.channels
        }
    }
}

/// An opened, decodable stream.
pub trait AudioSource: Send {
    /// Declared properties, available right after opening.
    fn info(&self) -> AudioInfo;

    /// Properties learned while decoding; used when `info` is incomplete.
    fn dynamic_info(&mut self) -> Option<AudioInfo> {
        None
    }

    fn can_seek(&self) -> bool;

    /// Next chunk of audio, or `None` once the stream is exhausted.
    fn next_chunk(&mut self) -> Result<Option<AudioChunk>, DecodeError>;
}

/// Opens audio sources for locations.
pub trait DecoderFactory: Send + Sync {
    fn open(&self, location: &Location) -> Result<Box<dyn AudioSource>, DecodeError>;
}

/// Decodes local files with symphonia. The subsong index selects the N-th audio track.
#[derive(Debug, Default, Clone, Copy)]
pub struct SymphoniaDecoder;

impl DecoderFactory for SymphoniaDecoder {
    fn open(&self, location: &Location) -> Result<Box<dyn AudioSource>, DecodeError> {
        let path = location
            .file_path()
            .ok_or_else(|| DecodeError::Unsupported(location.path.clone()))?;

        let file = File::open(&path)?;
        let seekable = file.is_seekable();
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
            .map_err(|e| match e {
                SymphoniaError::IoError(io) => DecodeError::Io(io),
                SymphoniaError::Unsupported(what) => {
                    DecodeError::Unsupported(format!("{} ({})", location.path, what))
                }
                other => DecodeError::Codec(other.to_string()),
            })?;
        let format = probed.format;

        let track = format
            .tracks()
            .iter()
            .filter(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .nth(location.subsong as usize)
            .ok_or_else(|| {
                DecodeError::Unsupported(format!(
                    "{}: no audio track for subsong {}",
                    location.path, location.subsong
                ))
            })?;

        let info = AudioInfo {
            sample_rate: track.codec_params.sample_rate,
            length: track.codec_params.n_frames,
        };
        let track_id = track.id;

        let decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())
            .map_err(|e| DecodeError::Codec(e.to_string()))?;

        Ok(Box::new(SymphoniaSource {
            format,
            decoder,
            track_id,
            info,
            seekable,
            sample_buf: None,
            finished: false,
        }))
    }
}

struct SymphoniaSource {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    info: AudioInfo,
    seekable: bool,
    sample_buf: Option<SampleBuffer<f32>>,
    finished: bool,
}

impl AudioSource for SymphoniaSource {
    fn info(&self) -> AudioInfo {
        self.info
    }

    fn dynamic_info(&mut self) -> Option<AudioInfo> {
        let params = self.decoder.codec_params();
        Some(AudioInfo {
            sample_rate: params.sample_rate,
            length: params.n_frames,
        })
    }

    fn can_seek(&self) -> bool {
        self.seekable
    }

    fn next_chunk(&mut self) -> Result<Option<AudioChunk>, DecodeError> {
        while !self.finished {
            let packet = match self.format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    self.finished = true;
                    break;
                }
                // Chained streams change parameters here; the waveform can't follow.
                Err(SymphoniaError::ResetRequired) => {
                    self.finished = true;
                    break;
                }
                Err(SymphoniaError::IoError(e)) => return Err(DecodeError::Io(e)),
                Err(e) => return Err(DecodeError::Codec(e.to_string())),
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode(&packet) {
                Ok(decoded) => decoded,
                Err(SymphoniaError::DecodeError(e)) => {
                    log::warn!("Skipping undecodable packet: {}", e);
                    continue;
                }
                Err(SymphoniaError::IoError(e)) => return Err(DecodeError::Io(e)),
                Err(e) => return Err(DecodeError::Codec(e.to_string())),
            };

            let spec = *decoded.spec();
            let needed = decoded.capacity() as u64;
            let channels = spec.channels.count();
            let fits = self
                .sample_buf
                .as_ref()
                .is_some_and(|b| b.capacity() as u64 >= needed * channels as u64);
            if !fits {
                self.sample_buf = None;
            }
            let buf = self
                .sample_buf
                .get_or_insert_with(|| SampleBuffer::new(needed, spec));
            buf.copy_interleaved_ref(decoded);

            return Ok(Some(AudioChunk {
                samples: buf.samples().to_vec(),
                channels,
                channel_map: spec.channels.bits() & waveform::speakers::ALL,
                sample_rate: spec.rate,
            }));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    /// Write a 16-bit PCM WAV file.
    fn write_wav(path: &std::path::Path, channels: u16, rate: u32, frames: u32) {
        let data_len = frames * channels as u32 * 2;
        let mut f = File::create(path).unwrap();
        f.write_all(b"RIFF").unwrap();
        f.write_all(&(36 + data_len).to_le_bytes()).unwrap();
        f.write_all(b"WAVEfmt ").unwrap();
        f.write_all(&16u32.to_le_bytes()).unwrap();
        f.write_all(&1u16.to_le_bytes()).unwrap();
        f.write_all(&channels.to_le_bytes()).unwrap();
        f.write_all(&rate.to_le_bytes()).unwrap();
        f.write_all(&(rate * channels as u32 * 2).to_le_bytes()).unwrap();
        f.write_all(&(channels * 2).to_le_bytes()).unwrap();
        f.write_all(&16u16.to_le_bytes()).unwrap();
        f.write_all(b"data").unwrap();
        f.write_all(&data_len.to_le_bytes()).unwrap();
        for i in 0..frames {
            for ch in 0..channels {
                let v = if ch == 0 { (i % 100) as i16 * 100 } else { -((i % 50) as i16) * 100 };
                f.write_all(&v.to_le_bytes()).unwrap();
            }
        }
    }

    #[test]
    fn test_symphonia_decodes_wav() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        write_wav(&path, 2, 8000, 4000);

        let mut source = SymphoniaDecoder.open(&Location::from_file(&path)).unwrap();
        assert_eq!(source.info().sample_rate, Some(8000));
        assert_eq!(source.info().length, Some(4000));
        assert!(source.can_seek());

        let mut frames = 0;
        while let Some(chunk) = source.next_chunk().unwrap() {
            assert_eq!(chunk.channels, 2);
            assert_eq!(chunk.channel_map, waveform::speakers::STEREO);
            frames += chunk.frames();
        }
        assert_eq!(frames, 4000);
        // Exhausted sources stay exhausted
        assert!(source.next_chunk().unwrap().is_none());
    }

    #[test]
    fn test_open_errors() {
        assert!(matches!(
            SymphoniaDecoder.open(&Location::new("http://example.com/a.mp3", 0)),
            Err(DecodeError::Unsupported(_))
        ));
        assert!(matches!(
            SymphoniaDecoder.open(&Location::new("/definitely/not/here.flac", 0)),
            Err(DecodeError::Io(_))
        ));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        write_wav(&path, 1, 8000, 100);
        assert!(matches!(
            SymphoniaDecoder.open(&Location::new(path.to_string_lossy().to_string(), 1)),
            Err(DecodeError::Unsupported(_))
        ));
    }
}
