use core::fmt;
use std::io;

use arrayvec::ArrayVec;

pub mod flags;
mod mixer;
mod parse;
mod paula;
mod player;
mod waves;
mod wav;

pub use mixer::cia_period_to_hz;
pub use player::Player;
pub use wav::record_wav;
pub use waves::WaveformBank;

/// The number of Paula voices on an Amiga.
pub const AMIGA_VOICES: usize = 4;

/// Main crystal oscillator frequency of PAL Amiga systems.
pub const AMIGA_PAL_XTAL_HZ: u32 = 28_375_160;
/// Paula color clock (CCK) frequency on a PAL Amiga.
pub const PAULA_PAL_CLK: f64 = AMIGA_PAL_XTAL_HZ as f64 / 8.0;
/// CIA-8520 timer clock (CCK / 5) on a PAL Amiga.
pub const CIA_PAL_CLK: f64 = AMIGA_PAL_XTAL_HZ as f64 / 40.0;

/// The slowest CIA timer period selectable from a module header (~49.92 Hz).
pub const AHX_HIGHEST_CIA_PERIOD: u16 = 14209;
/// The replayer tick period used before any module is loaded.
pub const AHX_DEFAULT_CIA_PERIOD: u16 = AHX_HIGHEST_CIA_PERIOD;

/// The maximum number of instruments a module can define.
pub const MAX_INSTRUMENTS: usize = 63;

/// Every track owns 64 row slots regardless of the play length of a track.
pub(crate) const TRACK_ROWS: usize = 64;
/// A track row is 3 bytes: `[note6:instr-hi2][instr-lo4:cmd4][param8]`.
pub(crate) const TRACK_ROW_BYTES: usize = 3;
/// A performance-list entry is 4 bytes.
pub(crate) const PERF_ENTRY_BYTES: usize = 4;
/// Room for the longest possible performance list, zero-padded.
pub(crate) const PERF_LIST_BYTES: usize = PERF_ENTRY_BYTES * 256;

/// The error type of every fallible operation in this crate.
///
/// The discriminants carry the error codes of the reference player, exposed
/// through [AhxError::code].
#[derive(Debug, thiserror::Error)]
pub enum AhxError {
    /// A buffer could not be allocated.
    #[error("out of memory")]
    OutOfMemory,
    /// The audio output device could not be opened or configured.
    #[error("error setting up the audio output device")]
    AudioDevice,
    /// A file could not be read or written.
    #[error("file i/o error: {0}")]
    FileIo(#[from] io::Error),
    /// The data is not an AHX module, or the module revision is unsupported.
    #[error("not an AHX module")]
    NotAnAhx,
    /// The waveform bank was not initialized before use.
    #[error("waveforms are not initialized")]
    NoWaves,
    /// Playback was requested with no module loaded.
    #[error("no song loaded")]
    SongNotLoaded,
}

impl AhxError {
    /// Returns the numeric error code of the reference player (1..=6).
    pub fn code(&self) -> u8 {
        match self {
            AhxError::OutOfMemory => 1,
            AhxError::AudioDevice => 2,
            AhxError::FileIo(..) => 3,
            AhxError::NotAnAhx => 4,
            AhxError::NoWaves => 5,
            AhxError::SongNotLoaded => 6,
        }
    }
}

impl From<hound::Error> for AhxError {
    fn from(e: hound::Error) -> Self {
        match e {
            hound::Error::IoError(e) => AhxError::FileIo(e),
            _ => AhxError::FileIo(io::Error::new(io::ErrorKind::Other, e.to_string())),
        }
    }
}

/// A single synthetic instrument.
///
/// The layout mirrors the 22-byte on-disk record followed by the
/// performance list. Several fields pack more than one parameter:
///
/// * [Instrument::filter_speed_wavelength]: bits 0..=2 wavelength,
///   bits 3..=7 the low filter-speed bits.
/// * [Instrument::vibrato_depth]: bits 0..=3 depth, bits 4..=6 the HardCut
///   frame count, bit 7 the HardCutRelease flag.
/// * [Instrument::filter_lower_limit]/[Instrument::filter_upper_limit]:
///   bit 7 of each carries one extra filter-speed bit.
#[derive(Debug, Clone)]
pub struct Instrument {
    pub volume: u8,
    pub filter_speed_wavelength: u8,
    pub a_frames: u8,
    pub a_volume: u8,
    pub d_frames: u8,
    pub d_volume: u8,
    pub s_frames: u8,
    pub r_frames: u8,
    pub r_volume: u8,
    pub filter_lower_limit: u8,
    pub vibrato_delay: u8,
    pub vibrato_depth: u8,
    pub vibrato_speed: u8,
    pub square_lower_limit: u8,
    pub square_upper_limit: u8,
    pub square_speed: u8,
    pub filter_upper_limit: u8,
    pub perf_speed: u8,
    pub perf_length: u8,
    /// The performance list, always [PERF_LIST_BYTES] long; bytes past
    /// `4 * perf_length` read as zero.
    pub perf_list: Box<[u8]>,
}

impl Instrument {
    /// The sentinel used whenever a row references an instrument the module
    /// does not define.
    pub(crate) fn empty() -> Instrument {
        Instrument {
            volume: 0,
            filter_speed_wavelength: 4 << 3,
            a_frames: 1,
            a_volume: 0,
            d_frames: 1,
            d_volume: 0,
            s_frames: 1,
            r_frames: 1,
            r_volume: 0,
            filter_lower_limit: 1,
            vibrato_delay: 0,
            vibrato_depth: 0,
            vibrato_speed: 0,
            square_lower_limit: 0x20,
            square_upper_limit: 0x3F,
            square_speed: 1,
            filter_upper_limit: 0x1F,
            perf_speed: 1,
            perf_length: 0,
            perf_list: vec![0u8; PERF_LIST_BYTES].into_boxed_slice(),
        }
    }

    /// Reads one performance-list byte at a signed offset.
    ///
    /// Offsets before the list (the `jump to step 0` quirk) and past its end
    /// read as zero.
    pub(crate) fn perf_byte(&self, offset: i32) -> u8 {
        usize::try_from(offset)
            .ok()
            .and_then(|i| self.perf_list.get(i).copied())
            .unwrap_or(0)
    }
}

/// The **AHX** music module, immutable once parsed.
///
/// A module holds an outer sequence of positions, each mapping every voice to
/// a (track, transpose) pair, a bank of tracks (the inner row patterns), and
/// up to 63 synthetic [Instrument]s.
#[derive(Debug, Clone)]
pub struct AhxModule {
    /// The song title, at most 255 bytes in the file.
    pub name: String,
    /// Format revision, 0 or 1. Revision 0 predates the filter commands.
    pub revision: u8,
    /// The number of entries in the position table.
    pub song_length: u16,
    /// The position playback restarts from after the last one.
    /// Always less than [AhxModule::song_length].
    pub restart_pos: u16,
    /// The number of rows actually played per track (at most 64).
    pub track_length: u8,
    /// The highest track index referenced by the position table.
    pub highest_track: u8,
    /// Entry positions of the subsongs.
    pub subsongs: Box<[u16]>,
    /// `song_length * 8` bytes: four (track, transpose) pairs per position.
    pub positions: Box<[u8]>,
    /// `(highest_track + 1) * 64 * 3` bytes of row data; track 0 may be
    /// all-zero if the header says so.
    pub tracks: Box<[u8]>,
    /// The instruments, referenced 1-based from track rows.
    pub instruments: ArrayVec<Instrument, MAX_INSTRUMENTS>,
    /// The CIA timer period clocking the replayer, from header bits 13..=14.
    pub cia_period: u16,
    pub(crate) empty_instrument: Instrument,
}

impl AhxModule {
    /// Returns the replayer tick rate of this module in Hz (nominally ~50 Hz).
    #[inline]
    pub fn tick_rate(&self) -> f64 {
        cia_period_to_hz(self.cia_period)
    }

    /// Returns the tempo of this module in beats per minute.
    pub fn bpm(&self) -> f64 {
        self.tick_rate() * 2.5
    }

    /// Returns the number of subsongs.
    #[inline]
    pub fn subsong_count(&self) -> u8 {
        self.subsongs.len() as u8
    }

    /// Returns the raw 3 bytes of the given track row, or an all-zero row
    /// when the reference is out of range.
    pub(crate) fn track_row(&self, track: u8, row: u16) -> [u8; 3] {
        let offset = (((track as usize) << 6) + row as usize) * TRACK_ROW_BYTES;
        match self.tracks.get(offset..offset + TRACK_ROW_BYTES) {
            Some(bytes) => [bytes[0], bytes[1], bytes[2]],
            None => [0; 3],
        }
    }

    /// Returns the four (track, transpose) pairs of a position, or silence
    /// when the position is out of range.
    pub(crate) fn position(&self, pos: u16) -> [(u8, i8); 4] {
        let mut pairs = [(0, 0); 4];
        let offset = (pos as usize) << 3;
        if let Some(bytes) = self.positions.get(offset..offset + 8) {
            for (pair, chunk) in pairs.iter_mut().zip(bytes.chunks_exact(2)) {
                *pair = (chunk[0], chunk[1] as i8);
            }
        }
        pairs
    }

    /// Resolves a 1-based instrument number, falling back to the empty
    /// sentinel for number 0 and for instruments the module does not define.
    pub(crate) fn instrument(&self, num: u8) -> &Instrument {
        num.checked_sub(1)
            .and_then(|i| self.instruments.get(i as usize))
            .unwrap_or(&self.empty_instrument)
    }
}

impl fmt::Display for AhxModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}\" (THX rev {})", self.name, self.revision)
    }
}
