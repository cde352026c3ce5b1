//! AHX module parser and replayer.
//!
//! [AHX] (Abyss' Highest eXperience, also distributed with a `THX` file
//! signature) is a tracker [format] from the Commodore Amiga that synthesizes
//! all four voices from a small bank of generated waveforms run through an
//! emulated filter bank, instead of playing back sampled instruments.
//!
//! This library parses the compact binary modules, reconstructs the replayer
//! state at tracker-tick granularity and mixes the four emulated Paula voices
//! into a stereo 16-bit PCM stream, bit-reproducible against the AHX 2.3d-sp3
//! player.
//!
//! The [Player] value owns everything: the generated [WaveformBank], the
//! loaded [AhxModule], the per-voice replayer and Paula state, and the output
//! filter chain. Pull interleaved samples from it with
//! [Player::output_samples], or render a whole song to disk with [record_wav].
//!
//! [AHX]: https://en.wikipedia.org/wiki/AHX_(file_format)
//! [format]: https://ftp.modland.com/pub/documents/format_documentation/
use std::{fs, path::Path};

mod ahx;

pub use ahx::*;

/// Attempts to parse an AHX module from the given file `path`.
///
/// Returns an instance of `AhxModule` on success.
pub fn load_file<P: AsRef<Path>>(path: P) -> Result<AhxModule, AhxError> {
    let data = fs::read(path.as_ref())?;
    AhxModule::parse(&data)
}
