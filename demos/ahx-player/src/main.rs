//! AHX player
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ahx_replayer::{record_wav, AhxError, Player};
use clap::Parser;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SampleRate, StreamConfig};

const DEFAULT_AUDIO_FREQ: i32 = 48000;
const DEFAULT_MASTER_VOL: i32 = 256;
const DEFAULT_STEREO_SEPARATION: i32 = 10;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// A file path to an AHX/THX module.
    module: String,

    /// Audio output frequency: 32000 - 384000 Hz.
    #[arg(short, long, default_value_t = DEFAULT_AUDIO_FREQ, value_parser = freq_in_range)]
    frequency: i32,

    /// Master volume: 0 - 256.
    #[arg(short, long, default_value_t = DEFAULT_MASTER_VOL, value_parser = volume_in_range)]
    master: i32,

    /// Stereo separation: 0 (mono) - 100 (Amiga hard-panning).
    #[arg(short, long, default_value_t = DEFAULT_STEREO_SEPARATION, value_parser = separation_in_range)]
    separation: i32,

    /// Subsong to play, 0 = main song.
    #[arg(long, default_value_t = 0)]
    subsong: u8,

    /// Render the song to `<module>.wav` instead of playing it.
    #[arg(long)]
    render_to_wav: bool,

    /// How many times to loop the song while rendering to WAV.
    #[arg(long, default_value_t = 0)]
    wav_loops: i32,

    /// Log verbosity level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    debug: u8,
}

fn freq_in_range(s: &str) -> Result<i32, String> {
    let freq: i32 = s.parse().map_err(|_| format!("`{s}` isn't a frequency"))?;
    if (32000..=384000).contains(&freq) {
        Ok(freq)
    } else {
        Err("frequency not in range 32000 - 384000".into())
    }
}

fn volume_in_range(s: &str) -> Result<i32, String> {
    let volume: i32 = s.parse().map_err(|_| format!("`{s}` isn't a volume"))?;
    if (0..=256).contains(&volume) {
        Ok(volume)
    } else {
        Err("volume not in range 0 - 256".into())
    }
}

fn separation_in_range(s: &str) -> Result<i32, String> {
    let percent: i32 = s.parse().map_err(|_| format!("`{s}` isn't a percentage"))?;
    if (0..=100).contains(&percent) {
        Ok(percent)
    } else {
        Err("separation not in range 0 - 100".into())
    }
}

/****************************************************************************/
/*                                  PLAYER                                  */
/****************************************************************************/

fn play<T>(
    player: Arc<Mutex<Player>>,
    device: &cpal::Device,
    config: &StreamConfig,
) -> Result<cpal::Stream, Box<dyn std::error::Error>>
where
    T: cpal::SizedSample + cpal::FromSample<i16> + Send + 'static,
{
    let channels = config.channels as usize;
    let mut scratch: Vec<i16> = Vec::new();

    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _| {
            let frames = data.len() / channels;
            scratch.resize(frames * 2, 0);
            player.lock().unwrap().output_samples(&mut scratch);

            for (frame, pcm) in data.chunks_mut(channels).zip(scratch.chunks(2)) {
                for (slot, &sample) in frame.iter_mut().zip(pcm.iter()) {
                    *slot = T::from_sample(sample);
                }
            }
        },
        |err| log::error!("audio stream error: {err}"),
        None,
    )?;
    stream.play()?;
    Ok(stream)
}

/****************************************************************************/
/*                                   MAIN                                   */
/****************************************************************************/

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    simple_logger::init_with_level(match args.debug {
        0 => log::Level::Info,
        1 => log::Level::Debug,
        _ => log::Level::Trace,
    })?;

    let data = std::fs::read(&args.module)?;

    if args.render_to_wav {
        let out = format!("{}.wav", args.module);
        log::info!("rendering to {out}");
        record_wav(
            &data,
            &out,
            args.subsong,
            args.wav_loops,
            args.frequency,
            args.master,
            args.separation,
        )?;
        return Ok(());
    }

    let mut player = Player::new();
    player.init(args.frequency, args.master, args.separation);
    player.load(&data)?;

    {
        let module = player.module().expect("just loaded");
        log::info!(
            r#"{} - {} position(s), restart at {}, {} instrument(s), {} subsong(s)"#,
            module,
            module.song_length,
            module.restart_pos,
            module.instruments.len(),
            module.subsong_count(),
        );
        log::info!(
            "tick rate: {:.4} Hz ({:.2} BPM), track length: {}",
            module.tick_rate(),
            module.bpm(),
            module.track_length,
        );
    }

    player.play(args.subsong)?;

    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| AhxError::AudioDevice.to_string())?;
    let default_config = device.default_output_config()?;
    let config = StreamConfig {
        channels: 2,
        sample_rate: SampleRate(player.output_freq() as u32),
        buffer_size: cpal::BufferSize::Default,
    };

    log::debug!(
        "audio output: {} Hz, {} ch. ({:?})",
        config.sample_rate.0,
        config.channels,
        default_config.sample_format()
    );

    let player = Arc::new(Mutex::new(player));
    let _stream = match default_config.sample_format() {
        SampleFormat::I16 => play::<i16>(player.clone(), &device, &config)?,
        SampleFormat::U16 => play::<u16>(player.clone(), &device, &config)?,
        SampleFormat::F32 => play::<f32>(player.clone(), &device, &config)?,
        other => return Err(format!("unsupported sample format: {other:?}").into()),
    };

    loop {
        {
            let player = player.lock().unwrap();
            let (pos, row) = player.position();
            let length = player.module().map(|m| m.song_length).unwrap_or(0);
            print!(
                " Pos: {:03}/{:03} - Row: {:02} - Speed: {} {}   \r",
                pos,
                length,
                row,
                player.tempo(),
                if player.is_paused() { "(PAUSED)" } else { "" }
            );
        }
        std::io::stdout().flush().ok();
        std::thread::sleep(Duration::from_millis(50));
    }
}
