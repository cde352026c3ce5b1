//! Offline rendering of a module into a PCM RIFF/WAVE file.

use std::path::Path;

use log::info;

use super::mixer::cia_period_to_hz;
use super::{AhxError, Player, AHX_HIGHEST_CIA_PERIOD};

/// Renders the module in `data` to a 16-bit stereo WAV file at `out_path`.
///
/// The song plays `loop_times + 1` traversals of its position table, or less
/// when an `F00` effect stops it first. `output_freq`, `master_vol` and
/// `stereo_separation` take the same ranges as [Player::init].
pub fn record_wav<P: AsRef<Path>>(
    data: &[u8],
    out_path: P,
    subsong: u8,
    loop_times: i32,
    output_freq: i32,
    master_vol: i32,
    stereo_separation: i32,
) -> Result<(), AhxError> {
    let mut player = Player::new();
    player.init(output_freq, master_vol, stereo_separation);
    player.load(data)?;

    let spec = hound::WavSpec {
        channels: 2,
        sample_rate: player.output_freq() as u32,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(out_path, spec)?;

    player.set_recording(true);
    player.play(subsong)?;
    player.set_loop_times(loop_times);

    let max_samples_per_tick =
        (player.output_freq() as f64 / cia_period_to_hz(AHX_HIGHEST_CIA_PERIOD)).ceil() as usize;
    let mut buffer = vec![0i16; max_samples_per_tick * 2];

    let mut total_frames: u64 = 0;
    while player.is_recording() {
        let written = player.render_tick(&mut buffer);
        for &sample in &buffer[..written] {
            writer.write_sample(sample)?;
        }
        total_frames += written as u64 / 2;
    }

    writer.finalize()?;
    info!("rendered {} frames at {} Hz", total_frames, player.output_freq());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::parse::testutil::*;
    use super::*;

    fn wav_path(name: &str) -> std::path::PathBuf {
        let mut path = std::env::temp_dir();
        path.push(name);
        path
    }

    #[test]
    fn renders_one_traversal_and_stops() {
        let rows = vec![row(25, 1, 0, 0), [0; 3], [0; 3], [0; 3]];
        let spec = TestModule {
            tracks: vec![rows],
            ..TestModule::default()
        };
        let path = wav_path("ahx-replayer-one-pass.wav");
        record_wav(&spec.bytes(), &path, 0, 0, 44100, 256, 20).unwrap();

        let reader = hound::WavReader::open(&path).unwrap();
        let wav_spec = reader.spec();
        assert_eq!(wav_spec.channels, 2);
        assert_eq!(wav_spec.sample_rate, 44100);
        assert_eq!(wav_spec.bits_per_sample, 16);
        // one position of four rows at tempo 6, ~50 ticks/s
        let seconds = reader.duration() as f64 / 44100.0;
        assert!((0.2..1.2).contains(&seconds), "{seconds}");
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn loop_count_multiplies_the_traversals() {
        let rows = vec![row(25, 1, 0, 0), [0; 3], [0; 3], [0; 3]];
        let spec = TestModule {
            tracks: vec![rows.clone()],
            ..TestModule::default()
        };
        let once = wav_path("ahx-replayer-loop0.wav");
        let thrice = wav_path("ahx-replayer-loop2.wav");
        record_wav(&spec.bytes(), &once, 0, 0, 44100, 256, 20).unwrap();
        record_wav(&spec.bytes(), &thrice, 0, 2, 44100, 256, 20).unwrap();

        let short = hound::WavReader::open(&once).unwrap().duration() as f64;
        let long = hound::WavReader::open(&thrice).unwrap().duration() as f64;
        assert!((long / short - 3.0).abs() < 0.1, "{}", long / short);
        std::fs::remove_file(&once).ok();
        std::fs::remove_file(&thrice).ok();
    }

    #[test]
    fn f00_cuts_the_rendering_short() {
        let rows = vec![row(25, 1, 0, 0), row(0, 0, 0xF, 0), [0; 3], [0; 3]];
        let spec = TestModule {
            tracks: vec![rows],
            ..TestModule::default()
        };
        let path = wav_path("ahx-replayer-f00.wav");
        record_wav(&spec.bytes(), &path, 0, 100, 44100, 256, 20).unwrap();
        let seconds = hound::WavReader::open(&path).unwrap().duration() as f64 / 44100.0;
        // two rows of six ticks each, not 101 traversals
        assert!(seconds < 0.5, "{seconds}");
        std::fs::remove_file(&path).ok();
    }
}
