use crate::compression::CompressionError;
use crate::location::Location;
use thiserror::Error;

/// A pending analysis request persisted across restarts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub location: Location,
    pub user_submitted: bool,
}

/// Store-wide counters.
#[derive(Debug, Default)]
pub struct StoreStats {
    pub files: i64,
    pub waveforms: i64,
    pub jobs: i64,
    /// Sum of the three blob columns over every waveform row.
    pub blob_bytes: i64,
    pub by_compression: Vec<(i64, i64)>,
}

/// Why a stored row was rejected. Rejected rows are deleted and read as a miss.
#[derive(Error, Debug)]
pub enum CorruptEntry {
    #[error("channel map {0:#x} is out of range")]
    ChannelMap(i64),
    #[error("{column} blob: {source}")]
    Blob {
        column: &'static str,
        #[source]
        source: CompressionError,
    },
    #[error(transparent)]
    Compression(#[from] CompressionError),
}

/// A waveform row as stored, before decompression.
pub(crate) struct StoredRow {
    pub file_id: i64,
    pub channel_map: i64,
    pub compression: i64,
    pub min: Vec<u8>,
    pub max: Vec<u8>,
    pub rms: Vec<u8>,
}
