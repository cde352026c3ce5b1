use log::info;

use super::flags::{Dmacon, EnhancedCommand, PlistCommand, TrackCommand, Waveform};
use super::mixer::AudioOutput;
use super::paula::{Blep, PaulaVoice};
use super::waves::{
    NOISE_OFFSET, NOISE_SIZE, SAWTOOTH_OFFSET, SQUARES_OFFSET, VOICE_BUFFER_LEN, WAVE_OFFSETS,
};
use super::*;

/// Note periods for the five octaves, index 1..=60. Index 0 holds a zero
/// period which Paula treats as its longest cycle.
static PERIOD_TABLE: [i16; 1 + 60] = [
    0,
    3424, 3232, 3048, 2880, 2712, 2560, 2416, 2280, 2152, 2032, 1920, 1812,
    1712, 1616, 1524, 1440, 1356, 1280, 1208, 1140, 1076, 1016,  960,  906,
     856,  808,  762,  720,  678,  640,  604,  570,  538,  508,  480,  453,
     428,  404,  381,  360,  339,  320,  302,  285,  269,  254,  240,  226,
     214,  202,  190,  180,  170,  160,  151,  143,  135,  127,  120,  113,
];

/// The 129 words preceding the period table in the AHX 2.3d-sp3 68020
/// binary. Songs legitimately drive the note index negative, and the
/// resulting reads from this data are part of the reference output; the
/// table is frozen test data, not derivable.
static BEFORE_PERIOD_TABLE_68020: [u16; 129] = [
    0xF6F2, 0xEEEA, 0xE6E3, 0x201B, 0x1612, 0x0E0A, 0x0603, 0x00FD, 0xFAF8, 0xF6F4,
    0xF2F1, 0x100D, 0x0A08, 0x0604, 0x0201, 0x00FF, 0xFEFE, 0xFEFE, 0xFEFF, 0x4A30,
    0x0170, 0x0000, 0x0027, 0x66FF, 0x0000, 0x00B2, 0x4A30, 0x0170, 0x0000, 0x0026,
    0x6712, 0x3770, 0x0170, 0x0000, 0x0064, 0x0006, 0x51F0, 0x0170, 0x0000, 0x0026,
    0x4A30, 0x0170, 0x0000, 0x0022, 0x67FF, 0x0000, 0x007C, 0x48E7, 0x3F68, 0x2470,
    0x0170, 0x0000, 0x005C, 0x0C30, 0x0003, 0x0170, 0x0000, 0x0014, 0x67FF, 0x0000,
    0x0042, 0x7C01, 0x7405, 0x9430, 0x0170, 0x0000, 0x0015, 0xE56E, 0xCCFC, 0x0005,
    0x5346, 0x2270, 0x0170, 0x0000, 0x0060, 0x7E01, 0x7400, 0x1430, 0x0170, 0x0000,
    0x0015, 0xE52F, 0x5347, 0x2619, 0x24C3, 0x51CF, 0xFFFA, 0x51CE, 0xFFDE, 0x60FF,
    0x0000, 0x0016, 0x2270, 0x0170, 0x0000, 0x0060, 0x7E4F, 0x24D9, 0x24D9, 0x51CF,
    0xFFFA, 0x4CDF, 0x16FC, 0x51F0, 0x0170, 0x0000, 0x0022, 0x3770, 0x0170, 0x0000,
    0x0066, 0x0008, 0x4E75, 0x377C, 0x0000, 0x0008, 0x4E75, 0x0004, 0x0000, 0x0001,
    0x0000, 0x0015, 0x4C70, 0x0015, 0x4D6C, 0x000E, 0xA9C4, 0x0015, 0x5E68,
];

/// 64-step signed sine used by the vibrato, amplitude 255.
static VIB_TABLE: [i16; 64] = [
       0,   24,   49,   74,   97,  120,  141,  161,
     180,  197,  212,  224,  235,  244,  250,  253,
     255,  253,  250,  244,  235,  224,  212,  197,
     180,  161,  141,  120,   97,   74,   49,   24,
       0,  -24,  -49,  -74,  -97, -120, -141, -161,
    -180, -197, -212, -224, -235, -244, -250, -253,
    -255, -253, -250, -244, -235, -224, -212, -197,
    -180, -161, -141, -120,  -97,  -74,  -49,  -24,
];

/// Where a voice's Paula buffer gets refilled from on the next register push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum AudioSource {
    /// The zero section; produces silence.
    #[default]
    Empty,
    /// A byte offset into the waveform bank.
    Bank(usize),
    /// The voice's own square scratch buffer.
    SquareTemp,
}

/// Per-voice replayer state. Reset whenever playback (re)starts.
#[derive(Debug, Default)]
struct Voice {
    track: u8,
    transpose: i8,
    next_track: u8,
    next_transpose: i8,

    /// Envelope accumulator, 8.8 fixed point.
    adsr: i16,
    a_frames: u8,
    d_frames: u8,
    s_frames: u8,
    r_frames: u8,
    a_delta: i16,
    d_delta: i16,
    r_delta: i16,

    /// 1-based instrument number last struck on this voice.
    instrument: Option<u8>,
    waveform: Waveform,
    wavelength: u8,
    instr_period: i16,
    track_period: i16,
    vibrato_period: i16,
    note_max_volume: u8,
    perf_sub_volume: u8,
    track_master_volume: u8,

    new_waveform: bool,
    plant_square: bool,
    square_reverse: bool,
    ignore_square: bool,
    plant_period: bool,
    fixed_note: bool,

    volume_slide_up: u8,
    volume_slide_down: u8,

    hard_cut: u8,
    hard_cut_release: bool,
    hard_cut_release_f: u8,

    period_slide_speed: i16,
    period_slide_period: i16,
    period_slide_limit: i16,
    period_slide_on: bool,
    period_slide_with_limit: bool,

    period_perf_slide_speed: i16,
    period_perf_slide_period: i16,
    period_perf_slide_on: bool,

    vibrato_delay: u8,
    vibrato_current: u8,
    vibrato_depth: u8,
    vibrato_speed: u8,

    square_on: bool,
    square_init: bool,
    square_wait: u8,
    square_lower_limit: u8,
    square_upper_limit: u8,
    square_pos: u8,
    square_signum: i8,
    square_sliding_in: bool,

    filter_on: bool,
    filter_init: bool,
    filter_wait: u8,
    filter_lower_limit: u8,
    filter_upper_limit: u8,
    filter_pos: u8,
    filter_signum: i8,
    filter_speed: u8,
    filter_sliding_in: bool,
    /// Doubles as a flag and a deferred filter position from `4xy`.
    ignore_filter: u8,

    perf_current: u8,
    perf_speed: u8,
    perf_wait: u8,
    /// Byte cursor into the instrument's performance list; may sit 4 bytes
    /// before the list after a jump to step 0, reading zeros.
    perf_list_offset: i32,

    note_delay_wait: u8,
    note_delay_on: bool,
    note_cut_wait: u8,
    note_cut_on: bool,

    audio_period: u16,
    audio_volume: u16,
    audio_source: AudioSource,
}

impl Voice {
    fn reset(&mut self) {
        *self = Voice {
            track_master_volume: 64,
            square_signum: 1,
            square_lower_limit: 1,
            square_upper_limit: 63,
            ..Voice::default()
        };
    }
}

/// Song-level playback state.
#[derive(Debug, Default)]
struct SongState {
    playing: bool,
    subsong: u8,
    pos_nr: u16,
    note_nr: u16,
    step_wait_frames: u16,
    get_new_position: bool,
    tempo: u8,
    pattern_break: bool,
    pos_jump: u16,
    pos_jump_note: u16,
    wn_random: u32,
    loop_counter: i32,
    loop_times: i32,
    bpm: f64,
}

/// The AHX player: waveform bank, loaded module, replayer and Paula state,
/// and the output filter chain, as one owned value.
///
/// All mutation goes through `&mut self`; share a `Player` between an audio
/// callback and a controller thread by wrapping it in a mutex, which then
/// plays the role of the reference player's mixer lock.
pub struct Player {
    waves: Option<WaveformBank>,
    module: Option<AhxModule>,
    song: SongState,
    voices: [Voice; AMIGA_VOICES],
    paula: [PaulaVoice; AMIGA_VOICES],
    bleps: [Blep; AMIGA_VOICES],
    voice_bufs: [[i8; VOICE_BUFFER_LEN]; AMIGA_VOICES],
    square_bufs: [[i8; 0x80]; AMIGA_VOICES],
    audio: AudioOutput,
    recording_to_wav: bool,
}

impl Default for Player {
    fn default() -> Self {
        Player::new()
    }
}

impl Player {
    /// Creates a player with no waveform bank; call [Player::init] before
    /// loading anything.
    pub fn new() -> Player {
        Player {
            waves: None,
            module: None,
            song: SongState::default(),
            voices: Default::default(),
            paula: Default::default(),
            bleps: Default::default(),
            voice_bufs: [[0; VOICE_BUFFER_LEN]; AMIGA_VOICES],
            square_bufs: [[0; 0x80]; AMIGA_VOICES],
            audio: AudioOutput::default(),
            recording_to_wav: false,
        }
    }

    /// Builds the waveform bank and sets up the output stage.
    ///
    /// `output_freq` is clamped to the rates the mixer can run the Paula
    /// model at (31389..=384000 Hz); `master_vol` to 0..=256 and
    /// `stereo_separation` to 0..=100 percent.
    pub fn init(&mut self, output_freq: i32, master_vol: i32, stereo_separation: i32) {
        self.waves = Some(WaveformBank::new());
        self.audio.init(output_freq, master_vol, stereo_separation);
    }

    /// Frees the waveform bank and the mix buffers. The loaded module stays.
    pub fn close(&mut self) {
        self.stop();
        self.waves = None;
        self.audio.close();
    }

    /// Parses `data` and installs the module.
    ///
    /// Fails with [AhxError::NoWaves] if [Player::init] has not run, and with
    /// [AhxError::NotAnAhx] on anything that is not an AHX module.
    pub fn load(&mut self, data: &[u8]) -> Result<(), AhxError> {
        if self.waves.is_none() {
            return Err(AhxError::NoWaves);
        }
        let module = AhxModule::parse(data)?;
        self.stop();
        self.module = Some(module);
        Ok(())
    }

    /// Stops playback and drops the loaded module.
    pub fn free(&mut self) {
        self.stop();
        self.set_dmacon(Dmacon::ALL_VOICES);
        self.module = None;
    }

    /// Starts playback from the beginning of the given subsong.
    ///
    /// Subsong 0 is the main song; 1..=n select the entries of the subsong
    /// table, clamped to the last one. All per-voice state is reset.
    pub fn play(&mut self, subsong: u8) -> Result<(), AhxError> {
        if self.module.is_none() {
            return Err(AhxError::SongNotLoaded);
        }
        if self.waves.is_none() {
            return Err(AhxError::NoWaves);
        }
        let module = self.module.as_ref().unwrap();

        self.song.subsong = 0;
        self.song.pos_nr = 0;
        let subsong_count = module.subsong_count();
        if subsong > 0 && subsong_count > 0 {
            let index = (subsong - 1).min(subsong_count - 1);
            self.song.subsong = index + 1;
            self.song.pos_nr = module.subsongs[index as usize];
        }

        self.song.step_wait_frames = 0;
        self.song.get_new_position = true;
        self.song.note_nr = 0;

        for voice in self.paula.iter_mut() {
            voice.set_volume(0);
        }
        for voice in self.voices.iter_mut() {
            voice.reset();
        }

        let cia_period = module.cia_period;
        let bpm = module.bpm();
        self.setup_audio_channels();
        self.audio.set_cia_period(cia_period);

        self.voice_bufs = [[0; VOICE_BUFFER_LEN]; AMIGA_VOICES];
        self.square_bufs = [[0; 0x80]; AMIGA_VOICES];

        self.song.pos_jump = 0;
        self.song.tempo = 6;
        self.song.playing = true;
        self.song.loop_counter = 0;
        self.song.loop_times = 0;
        self.song.bpm = bpm;
        self.song.wn_random = 0;

        self.audio.tick_sample_counter = 0;
        self.audio.clear_filter_state();
        self.audio.reset_dithering();

        info!("playing subsong {} from position {}", self.song.subsong, self.song.pos_nr);
        Ok(())
    }

    /// Stops playback; the module stays loaded.
    pub fn stop(&mut self) {
        self.song.playing = false;
        for voice in self.paula.iter_mut() {
            voice.set_volume(0);
        }
        for voice in self.voices.iter_mut() {
            voice.reset();
        }
    }

    /// Jumps to the next song position on the coming tick.
    pub fn next_pattern(&mut self) {
        let Some(module) = self.module.as_ref() else {
            return;
        };
        if self.song.pos_nr + 1 < module.song_length {
            self.song.pos_jump = self.song.pos_nr + 1;
            self.song.pattern_break = true;
            self.audio.tick_sample_counter = 0;
        }
    }

    /// Jumps to the previous song position on the coming tick.
    pub fn prev_pattern(&mut self) {
        if self.song.pos_nr > 0 {
            self.song.pos_jump = self.song.pos_nr - 1;
            self.song.pattern_break = true;
            self.audio.tick_sample_counter = 0;
        }
    }

    /// Pauses or resumes output; a paused player emits silence.
    pub fn toggle_pause(&mut self) {
        self.audio.pause = !self.audio.pause;
    }

    /// Sets the master volume, clamped to 0..=256.
    pub fn set_master_volume(&mut self, volume: i32) {
        self.audio.set_master_volume(volume);
    }

    /// Sets the stereo separation percentage: 0 folds to mono, 100 keeps the
    /// Amiga hard panning.
    pub fn set_stereo_separation(&mut self, percentage: i32) {
        self.audio.set_stereo_separation(percentage);
    }

    /// The clamped output sample rate the player mixes at.
    #[inline]
    pub fn output_freq(&self) -> i32 {
        self.audio.output_freq()
    }

    #[inline]
    pub fn master_volume(&self) -> i32 {
        self.audio.master_volume()
    }

    #[inline]
    pub fn stereo_separation(&self) -> i32 {
        self.audio.stereo_separation()
    }

    /// The loaded module, if any.
    #[inline]
    pub fn module(&self) -> Option<&AhxModule> {
        self.module.as_ref()
    }

    #[inline]
    pub fn is_playing(&self) -> bool {
        self.song.playing
    }

    #[inline]
    pub fn is_paused(&self) -> bool {
        self.audio.pause
    }

    /// The active subsong: 0 for the main song.
    #[inline]
    pub fn subsong(&self) -> u8 {
        self.song.subsong
    }

    /// The current (position, row) of the sequencer.
    #[inline]
    pub fn position(&self) -> (u16, u16) {
        (self.song.pos_nr, self.song.note_nr)
    }

    /// Ticks per row, as last set by an `Fxy` effect (6 at song start).
    #[inline]
    pub fn tempo(&self) -> u8 {
        self.song.tempo
    }

    /// Beats per minute of the active song.
    #[inline]
    pub fn bpm(&self) -> f64 {
        self.song.bpm
    }

    pub(crate) fn set_loop_times(&mut self, loop_times: i32) {
        self.song.loop_times = loop_times;
    }

    pub(crate) fn set_recording(&mut self, on: bool) {
        self.recording_to_wav = on;
    }

    pub(crate) fn is_recording(&self) -> bool {
        self.recording_to_wav
    }

    /// Pulls interleaved stereo samples from the player; the entry point for
    /// audio-driver callbacks. `out.len()` must be even.
    ///
    /// Consumes the remainder of the current tick, runs the replayer tick
    /// whenever the 32.32 fixed-point tick counter crosses zero, and mixes up
    /// to the next boundary. Never blocks; produces silence while paused or
    /// before [Player::init].
    pub fn output_samples(&mut self, out: &mut [i16]) {
        if self.audio.pause || !self.audio.is_ready() {
            out.fill(0);
            return;
        }

        let even_len = out.len() & !1;
        let mut out = &mut out[..even_len];
        while !out.is_empty() {
            if self.audio.tick_sample_counter <= 0 {
                self.sid_interrupt();
                self.audio.tick_sample_counter += self.audio.samples_per_tick;
            }

            let remaining_tick = ((self.audio.tick_sample_counter + u32::MAX as i64) >> 32) as usize;
            let samples_to_mix = (out.len() / 2).min(remaining_tick);

            let (chunk, rest) = out.split_at_mut(samples_to_mix * 2);
            self.mix_samples(chunk);
            out = rest;

            self.audio.tick_sample_counter -= (samples_to_mix as i64) << 32;
        }
    }

    /// Renders exactly one tick's worth of samples into `out`, returning the
    /// number of `i16` values written. `out` must hold a full tick.
    pub(crate) fn render_tick(&mut self, out: &mut [i16]) -> usize {
        if self.audio.tick_sample_counter <= 0 {
            self.sid_interrupt();
            self.audio.tick_sample_counter += self.audio.samples_per_tick;
        }

        let samples_to_mix = ((self.audio.tick_sample_counter + u32::MAX as i64) >> 32) as usize;
        self.mix_samples(&mut out[..samples_to_mix * 2]);
        self.audio.tick_sample_counter -= (samples_to_mix as i64) << 32;

        samples_to_mix * 2
    }

    pub(crate) fn mix_samples(&mut self, target: &mut [i16]) {
        let Player {
            paula,
            bleps,
            voice_bufs,
            audio,
            ..
        } = self;
        audio.mix(paula, bleps, voice_bufs, target);
    }

    fn set_dmacon(&mut self, bits: Dmacon) {
        for (ch, voice) in self.paula.iter_mut().enumerate() {
            if bits.voice(ch) {
                if bits.contains(Dmacon::SET) {
                    voice.start_dma();
                } else {
                    voice.stop_dma();
                }
            }
        }
    }

    fn setup_audio_channels(&mut self) {
        self.set_dmacon(Dmacon::ALL_VOICES);

        let period_div = self.audio.period_to_delta_div();
        for voice in self.paula.iter_mut() {
            voice.set_period(0x88, period_div);
            voice.set_volume(0);
            voice.set_length((VOICE_BUFFER_LEN / 2) as u16);
        }

        self.set_dmacon(Dmacon::SET | Dmacon::ALL_VOICES);
    }

    /// One replayer tick, clocked at the module's CIA rate.
    ///
    /// Register pushes happen first, then (on a row boundary) the row decode,
    /// then the per-frame processing of every voice; writes to the Paula
    /// registers become audible from the next mixed sample on.
    pub(crate) fn sid_interrupt(&mut self) {
        if !self.song.playing {
            return;
        }
        let Player {
            waves,
            module,
            song,
            voices,
            paula,
            voice_bufs,
            square_bufs,
            audio,
            recording_to_wav,
            ..
        } = self;
        let (Some(waves), Some(module)) = (waves.as_ref(), module.as_ref()) else {
            return;
        };

        for ch in 0..AMIGA_VOICES {
            set_audio(
                &mut paula[ch],
                &mut voices[ch],
                &mut voice_bufs[ch],
                &square_bufs[ch],
                waves,
                audio,
            );
        }

        if song.step_wait_frames == 0 {
            if song.get_new_position {
                let pos_next = if song.pos_nr + 1 == module.song_length {
                    0
                } else {
                    song.pos_nr + 1
                };
                let current = module.position(song.pos_nr);
                let next = module.position(pos_next);
                for (ch, voice) in voices.iter_mut().enumerate() {
                    voice.track = current[ch].0;
                    voice.transpose = current[ch].1;
                    voice.next_track = next[ch].0;
                    voice.next_transpose = next[ch].1;
                }
                song.get_new_position = false;
            }

            for ch in 0..AMIGA_VOICES {
                process_step(voices, ch, song, module, recording_to_wav);
            }
            song.step_wait_frames = song.tempo as u16;
        }

        for ch in 0..AMIGA_VOICES {
            process_frame(
                voices,
                ch,
                song,
                module,
                waves,
                &mut square_bufs[ch],
                recording_to_wav,
            );
        }

        song.step_wait_frames = song.step_wait_frames.wrapping_sub(1);
        if song.step_wait_frames == 0 {
            if !song.pattern_break {
                song.note_nr += 1;
                if song.note_nr == module.track_length as u16 {
                    song.pos_jump = song.pos_nr + 1;
                    song.pattern_break = true;
                }
            }

            if song.pattern_break {
                song.pattern_break = false;

                song.note_nr = song.pos_jump_note;
                song.pos_jump_note = 0;
                song.pos_nr = song.pos_jump;
                song.pos_jump = 0;

                if song.pos_nr == module.song_length {
                    song.pos_nr = module.restart_pos;
                    if song.loop_counter >= song.loop_times {
                        *recording_to_wav = false;
                    } else {
                        song.loop_counter += 1;
                    }
                }
                if song.pos_nr >= module.song_length {
                    song.pos_nr = 0;
                    if song.loop_counter >= song.loop_times {
                        *recording_to_wav = false;
                    } else {
                        song.loop_counter += 1;
                    }
                }

                song.get_new_position = true;
            }
        }
    }
}

/// Pushes a voice's pending register writes to Paula and rebuilds its DMA
/// buffer when the waveform changed.
fn set_audio(
    paula: &mut PaulaVoice,
    ch: &mut Voice,
    voice_buf: &mut [i8; VOICE_BUFFER_LEN],
    square_buf: &[i8; 0x80],
    waves: &WaveformBank,
    audio: &AudioOutput,
) {
    if ch.plant_period {
        paula.set_period(ch.audio_period, audio.period_to_delta_div());
        ch.plant_period = false;
    }

    if ch.new_waveform {
        copy_waveform_to_voice_buffer(ch, voice_buf, square_buf, waves);
        ch.new_waveform = false;
    }

    paula.set_volume(ch.audio_volume);
}

fn copy_waveform_to_voice_buffer(
    ch: &Voice,
    voice_buf: &mut [i8; VOICE_BUFFER_LEN],
    square_buf: &[i8; 0x80],
    waves: &WaveformBank,
) {
    match ch.audio_source {
        AudioSource::Empty => voice_buf.fill(0),
        AudioSource::Bank(offset) => {
            let data = waves.data();
            if ch.waveform == Waveform::Noise {
                voice_buf.copy_from_slice(&data[offset..offset + VOICE_BUFFER_LEN]);
            } else {
                let length = (1usize << ch.wavelength) << 2;
                tile(voice_buf, &data[offset..offset + length]);
            }
        }
        AudioSource::SquareTemp => {
            let length = (1usize << ch.wavelength) << 2;
            tile(voice_buf, &square_buf[..length]);
        }
    }
}

/// Repeats `pattern` across the whole voice buffer; every tuned waveform
/// length divides the buffer exactly.
fn tile(voice_buf: &mut [i8; VOICE_BUFFER_LEN], pattern: &[i8]) {
    for chunk in voice_buf.chunks_mut(pattern.len()) {
        chunk.copy_from_slice(pattern);
    }
}

#[inline]
fn period_at(note: i16) -> i16 {
    PERIOD_TABLE.get(note as u16 as usize).copied().unwrap_or(0)
}

/// Decodes and executes the current row on one voice.
fn process_step(
    voices: &mut [Voice; AMIGA_VOICES],
    index: usize,
    song: &mut SongState,
    module: &AhxModule,
    recording_to_wav: &mut bool,
) {
    let ch = &mut voices[index];
    ch.volume_slide_up = 0;
    ch.volume_slide_down = 0;

    let bytes = if ch.track > module.highest_track {
        [0; 3]
    } else {
        module.track_row(ch.track, song.note_nr)
    };
    let mut note = (bytes[0] >> 2) & 0x3F;
    let instr = ((bytes[0] & 3) << 4) | (bytes[1] >> 4);
    let command = TrackCommand::decode(bytes[1] & 0x0F, bytes[2]);

    // note cut and note delay act before everything else; a pending delay
    // defers the whole row
    if let TrackCommand::Enhanced(enhanced) = command {
        let ch = &mut voices[index];
        match enhanced {
            EnhancedCommand::NoteCut(ticks) => {
                if ticks < song.tempo {
                    ch.note_cut_wait = ticks;
                    ch.note_cut_on = true;
                    ch.hard_cut_release = false;
                }
            }
            EnhancedCommand::NoteDelay(ticks) => {
                if ch.note_delay_on {
                    ch.note_delay_on = false;
                } else if ticks < song.tempo {
                    ch.note_delay_wait = ticks;
                    if ch.note_delay_wait != 0 {
                        ch.note_delay_on = true;
                        return;
                    }
                }
            }
            _ => {}
        }
    }

    match command {
        TrackCommand::PositionJumpHi(param) => {
            let pos = param & 0x0F;
            if pos <= 9 {
                // clears the low byte of a jump target set earlier
                song.pos_jump = (pos as u16) << 8;
            }
        }
        TrackCommand::PatternBreak(param) => {
            song.pos_jump = song.pos_nr + 1;
            let target = ((param >> 4) * 10 + (param & 0x0F)) as u16;
            song.pos_jump_note = if target >= module.track_length as u16 { 0 } else { target };
            song.pattern_break = true;
        }
        TrackCommand::PositionJump(param) => {
            let digits = ((param >> 4) * 10 + (param & 0x0F)) as u16;
            song.pos_jump = song.pos_jump.wrapping_mul(100).wrapping_add(digits);
            song.pattern_break = true;
        }
        TrackCommand::SetTempo(param) => {
            song.tempo = param;
            if param == 0 {
                *recording_to_wav = false;
            }
        }
        TrackCommand::TonePortamentoVolumeSlide(param) | TrackCommand::VolumeSlide(param) => {
            let ch = &mut voices[index];
            ch.volume_slide_down = param & 0x0F;
            ch.volume_slide_up = param >> 4;
        }
        _ => {}
    }

    if instr > 0 {
        let ch = &mut voices[index];
        let ins = module.instrument(instr);

        ch.perf_sub_volume = 64;
        ch.period_perf_slide_speed = 0;
        ch.period_slide_period = 0;
        ch.period_slide_limit = 0;

        ch.adsr = 0;
        ch.a_frames = ins.a_frames;
        let mut delta = ((ins.a_volume as i32) << 8) as i16;
        if ch.a_frames != 0 {
            delta /= ch.a_frames as i16;
        }
        ch.a_delta = delta;

        ch.d_frames = ins.d_frames;
        let mut delta = (((ins.d_volume as i8 as i32) - (ins.a_volume as i8 as i32)) << 8) as i16;
        if ch.d_frames != 0 {
            delta /= ch.d_frames as i16;
        }
        ch.d_delta = delta;

        ch.s_frames = ins.s_frames;

        ch.r_frames = ins.r_frames;
        let mut delta = (((ins.r_volume as i8 as i32) - (ins.d_volume as i8 as i32)) << 8) as i16;
        if ch.r_frames != 0 {
            delta /= ch.r_frames as i16;
        }
        ch.r_delta = delta;

        ch.wavelength = (ins.filter_speed_wavelength & 0b0000_0111).min(5);
        ch.note_max_volume = ins.volume;

        ch.vibrato_current = 0;
        ch.vibrato_delay = ins.vibrato_delay;
        ch.vibrato_depth = ins.vibrato_depth & 0b0000_1111;
        ch.vibrato_speed = ins.vibrato_speed;
        ch.vibrato_period = 0;
        ch.hard_cut_release = ins.vibrato_depth & 128 != 0;
        ch.hard_cut = (ins.vibrato_depth & 0b0111_0000) >> 4;

        ch.ignore_square = false;
        ch.square_sliding_in = false;
        ch.square_wait = 0;
        ch.square_on = false;

        let lower = ins.square_lower_limit >> (5 - ch.wavelength);
        let upper = ins.square_upper_limit >> (5 - ch.wavelength);
        (ch.square_lower_limit, ch.square_upper_limit) =
            if lower <= upper { (lower, upper) } else { (upper, lower) };

        ch.ignore_filter = 0;
        ch.filter_wait = 0;
        ch.filter_on = false;
        ch.filter_sliding_in = false;

        ch.filter_speed = ins.filter_speed_wavelength >> 3;
        let mut lower = ins.filter_lower_limit;
        let mut upper = ins.filter_upper_limit;
        if lower & 128 != 0 {
            ch.filter_speed |= 32;
        }
        if upper & 128 != 0 {
            ch.filter_speed |= 64;
        }
        lower &= !128;
        upper &= !128;
        (ch.filter_lower_limit, ch.filter_upper_limit) =
            if lower <= upper { (lower, upper) } else { (upper, lower) };

        ch.filter_pos = 32;

        ch.perf_wait = 0;
        ch.perf_speed = ins.perf_speed;
        ch.perf_current = 0;
        ch.instrument = Some(instr);
        ch.perf_list_offset = 0;
    }

    match command {
        TrackCommand::SquareOffset(param) => {
            let ch = &mut voices[index];
            ch.square_pos = param >> (5 - ch.wavelength);
            ch.plant_square = true;
            // the next square-init performance command is void
            ch.ignore_square = true;
        }
        TrackCommand::OverrideFilter(param) => {
            let ch = &mut voices[index];
            if param < 0x40 {
                ch.ignore_filter = param;
            } else {
                ch.filter_pos = param - 0x40;
            }
        }
        _ => {}
    }

    voices[index].period_slide_on = false;

    if let TrackCommand::TonePortamento(param) | TrackCommand::TonePortamentoVolumeSlide(param) =
        command
    {
        let ch = &mut voices[index];
        if matches!(command, TrackCommand::TonePortamento(_)) && param != 0 {
            ch.period_slide_speed = param as i16;
        }

        let mut do_slide = true;
        if note != 0 {
            let period_limit = period_at(ch.track_period).wrapping_sub(period_at(note as i16));
            let test = (period_limit as u16).wrapping_add(ch.period_slide_period as u16);
            if test == 0 {
                // already on the target note
                do_slide = false;
            } else {
                ch.period_slide_limit = 0i16.wrapping_sub(period_limit);
            }
        }
        if do_slide {
            ch.period_slide_on = true;
            ch.period_slide_with_limit = true;
            note = 0;
        }
    }

    if note != 0 {
        let ch = &mut voices[index];
        ch.track_period = note as i16;
        ch.plant_period = true;
    }

    match command {
        TrackCommand::PortamentoUp(param) => {
            let ch = &mut voices[index];
            ch.period_slide_speed = -(param as i16);
            ch.period_slide_on = true;
            ch.period_slide_with_limit = false;
        }
        TrackCommand::PortamentoDown(param) => {
            let ch = &mut voices[index];
            ch.period_slide_speed = param as i16;
            ch.period_slide_on = true;
            ch.period_slide_with_limit = false;
        }
        TrackCommand::Enhanced(enhanced) => {
            let ch = &mut voices[index];
            match enhanced {
                EnhancedCommand::FineSlideUp(value) => {
                    ch.period_slide_period = ch.period_slide_period.wrapping_sub(value as i16);
                    ch.plant_period = true;
                }
                EnhancedCommand::FineSlideDown(value) => {
                    ch.period_slide_period = ch.period_slide_period.wrapping_add(value as i16);
                    ch.plant_period = true;
                }
                EnhancedCommand::VibratoControl(value) => ch.vibrato_depth = value,
                EnhancedCommand::FineVolumeUp(value) => {
                    let volume = ch.note_max_volume.wrapping_add(value);
                    ch.note_max_volume = if volume > 0x40 { 0x40 } else { volume };
                }
                EnhancedCommand::FineVolumeDown(value) => {
                    let volume = ch.note_max_volume.wrapping_sub(value);
                    ch.note_max_volume = if (volume as i8) < 0 { 0 } else { volume };
                }
                _ => {}
            }
        }
        TrackCommand::SetVolume(param) => {
            let value = param as i16;
            if value <= 0x40 {
                voices[index].note_max_volume = value as u8;
            } else {
                let value = value - 0x50;
                if value >= 0 {
                    if value <= 0x40 {
                        for ch in voices.iter_mut() {
                            ch.track_master_volume = value as u8;
                        }
                    } else {
                        let value = value - (0xA0 - 0x50);
                        if (0..=0x40).contains(&value) {
                            voices[index].track_master_volume = value as u8;
                        }
                    }
                }
            }
        }
        _ => {}
    }
}

/// Executes one performance-list command on a voice.
fn plist_command(ch: &mut Voice, command: PlistCommand, param: u8) {
    match command {
        PlistCommand::SetFilter => {
            if param == 0 {
                return;
            }
            if ch.ignore_filter != 0 {
                ch.filter_pos = ch.ignore_filter;
                ch.ignore_filter = 0;
            } else {
                ch.filter_pos = param;
                ch.new_waveform = true;
            }
        }
        PlistCommand::SlideUp => {
            ch.period_perf_slide_speed = param as i16;
            ch.period_perf_slide_on = true;
        }
        PlistCommand::SlideDown => {
            ch.period_perf_slide_speed = -(param as i16);
            ch.period_perf_slide_on = true;
        }
        PlistCommand::SetSquare => {
            if ch.ignore_square {
                ch.ignore_square = false;
            } else {
                ch.square_pos = param >> (5 - ch.wavelength);
            }
        }
        PlistCommand::ToggleModulation => {
            if param == 0 {
                // plain 4-00 toggles square modulation only
                ch.square_on = !ch.square_on;
                ch.square_init = ch.square_on;
                ch.square_signum = 1;
            } else {
                if param & 0x0F != 0 {
                    ch.square_on = !ch.square_on;
                    ch.square_init = ch.square_on;
                    ch.square_signum = if param & 0x0F == 0x0F { -1 } else { 1 };
                }
                if param & 0xF0 != 0 {
                    ch.filter_on = !ch.filter_on;
                    ch.filter_init = ch.filter_on;
                    ch.filter_signum = if param & 0xF0 == 0xF0 { -1 } else { 1 };
                }
            }
        }
        PlistCommand::JumpToStep => {
            // step 0 parks the cursor 4 bytes before the list, on zeros
            ch.perf_current = param.wrapping_sub(1);
            ch.perf_list_offset = (param as i32) * PERF_ENTRY_BYTES as i32 - PERF_ENTRY_BYTES as i32;
        }
        PlistCommand::SetVolume => {
            let value = param as i16;
            if value <= 0x40 {
                ch.note_max_volume = value as u8;
            } else {
                let value = value - 0x50;
                if value >= 0 {
                    if value <= 0x40 {
                        ch.perf_sub_volume = value as u8;
                    } else {
                        let value = value - (0xA0 - 0x50);
                        if (0..=0x40).contains(&value) {
                            ch.track_master_volume = value as u8;
                        }
                    }
                }
            }
        }
        PlistCommand::SetSpeed => {
            ch.perf_speed = param;
            ch.perf_wait = param;
        }
    }
}

/// Per-tick processing of one voice: envelopes, slides, modulation, the
/// performance list, and the final period/volume composition. The step order
/// is contractual; reordering changes the output.
fn process_frame(
    voices: &mut [Voice; AMIGA_VOICES],
    index: usize,
    song: &mut SongState,
    module: &AhxModule,
    waves: &WaveformBank,
    square_buf: &mut [i8; 0x80],
    recording_to_wav: &mut bool,
) {
    {
        let ch = &mut voices[index];

        // a HardCut instrument peeks at the coming row and schedules a cut
        // shortly before a new instrument strikes
        if ch.hard_cut != 0 {
            let mut track = ch.track;
            let mut note_nr = song.note_nr + 1;
            if note_nr == module.track_length as u16 {
                note_nr = 0;
                track = ch.next_track;
            }

            let bytes = module.track_row(track, note_nr);
            let next_instr = ((bytes[0] & 3) << 4) | (bytes[1] >> 4);
            if next_instr != 0 {
                let mut cut_tick = (song.tempo as i32 - ch.hard_cut as i32) as i8;
                if cut_tick < 0 {
                    cut_tick = 0;
                }

                if !ch.note_cut_on {
                    ch.note_cut_on = true;
                    ch.note_cut_wait = cut_tick as u8;
                    ch.hard_cut_release_f =
                        (0i32 - (ch.note_cut_wait as i32 - song.tempo as i32)) as u8;
                }

                ch.hard_cut = 0;
            }
        }

        if ch.note_cut_on {
            if ch.note_cut_wait == 0 {
                ch.note_cut_on = false;
                if ch.hard_cut_release {
                    let ins = module.instrument(ch.instrument.unwrap_or(0));
                    ch.r_frames = ch.hard_cut_release_f;
                    ch.r_delta = if ch.hard_cut_release_f != 0 {
                        let target = (ins.r_volume as i32) << 8;
                        (0i32 - ((ch.adsr as i32 - target) / ch.hard_cut_release_f as i32)) as i16
                    } else {
                        0
                    };
                    ch.a_frames = 0;
                    ch.d_frames = 0;
                    ch.s_frames = 0;
                } else {
                    ch.note_max_volume = 0;
                }
            }
            ch.note_cut_wait = ch.note_cut_wait.wrapping_sub(1);
        }
    }

    if voices[index].note_delay_on {
        if voices[index].note_delay_wait == 0 {
            process_step(voices, index, song, module, recording_to_wav);
        } else {
            voices[index].note_delay_wait -= 1;
        }
    }

    let ch = &mut voices[index];
    let has_instrument = ch.instrument.is_some();
    let ins = module.instrument(ch.instrument.unwrap_or(0));

    // envelope: each stage walks its delta and snaps to the exact target
    if ch.a_frames != 0 {
        ch.adsr = ch.adsr.wrapping_add(ch.a_delta);
        ch.a_frames -= 1;
        if ch.a_frames == 0 {
            ch.adsr = ((ins.a_volume as i32) << 8) as i16;
        }
    } else if ch.d_frames != 0 {
        ch.adsr = ch.adsr.wrapping_add(ch.d_delta);
        ch.d_frames -= 1;
        if ch.d_frames == 0 {
            ch.adsr = ((ins.d_volume as i32) << 8) as i16;
        }
    } else if ch.s_frames != 0 {
        ch.s_frames -= 1;
    } else if ch.r_frames != 0 {
        ch.adsr = ch.adsr.wrapping_add(ch.r_delta);
        ch.r_frames -= 1;
        if ch.r_frames == 0 {
            ch.adsr = ((ins.r_volume as i32) << 8) as i16;
        }
    }

    // volume slide
    let volume = ch
        .note_max_volume
        .wrapping_sub(ch.volume_slide_down)
        .wrapping_add(ch.volume_slide_up);
    ch.note_max_volume = (volume as i8).clamp(0, 0x40) as u8;

    // period slide
    if ch.period_slide_on {
        if ch.period_slide_with_limit {
            let mut speed = ch.period_slide_speed;
            let period = ch.period_slide_period.wrapping_sub(ch.period_slide_limit);
            if period != 0 {
                if period > 0 {
                    speed = speed.wrapping_neg();
                }
                // sign flip on (period + speed) means the limit was crossed
                let limit_test = period.wrapping_add(speed) ^ period;
                if limit_test >= 0 {
                    ch.period_slide_period = ch.period_slide_period.wrapping_add(speed);
                } else {
                    ch.period_slide_period = ch.period_slide_limit;
                }
                ch.plant_period = true;
            }
        } else {
            ch.period_slide_period = ch.period_slide_period.wrapping_add(ch.period_slide_speed);
            ch.plant_period = true;
        }
    }

    // vibrato
    if ch.vibrato_depth != 0 {
        if ch.vibrato_delay != 0 {
            ch.vibrato_delay -= 1;
        } else {
            ch.vibrato_period =
                (VIB_TABLE[(ch.vibrato_current & 63) as usize] * ch.vibrato_depth as i16) >> 7;
            ch.plant_period = true;
            ch.vibrato_current = ch.vibrato_current.wrapping_add(ch.vibrato_speed) & 63;
        }
    }

    // performance list
    if has_instrument {
        if ch.perf_current == ins.perf_length {
            if ch.perf_wait != 0 {
                ch.perf_wait -= 1;
            } else {
                ch.period_perf_slide_speed = 0;
            }
        } else {
            // perf speed 0x80 underflows the signed wait counter and counts
            // as expired; songs depend on it ("Enchanted Friday Nights")
            let signed_overflow = ch.perf_wait == 128;
            ch.perf_wait = ch.perf_wait.wrapping_sub(1);
            if signed_overflow || (ch.perf_wait as i8) <= 0 {
                let b0 = ins.perf_byte(ch.perf_list_offset);
                let b1 = ins.perf_byte(ch.perf_list_offset + 1);
                let param1 = ins.perf_byte(ch.perf_list_offset + 2);
                let param2 = ins.perf_byte(ch.perf_list_offset + 3);

                let cmd2 = PlistCommand::from((b0 >> 5) & 7);
                let cmd1 = PlistCommand::from((b0 >> 2) & 7);
                let wave = ((b0 << 1) & 6) | (b1 >> 7);
                let fixed = (b1 >> 6) & 1 != 0;
                let note = b1 & 0x3F;

                if let Some(waveform) = Waveform::from_perf_field(wave) {
                    ch.waveform = waveform;
                    ch.new_waveform = true;
                    ch.period_perf_slide_speed = 0;
                    ch.period_perf_slide_period = 0;
                }

                ch.period_perf_slide_on = false;
                plist_command(ch, cmd1, param1);
                plist_command(ch, cmd2, param2);

                if note != 0 {
                    ch.instr_period = note as i16;
                    ch.plant_period = true;
                    ch.fixed_note = fixed;
                }

                ch.perf_list_offset += PERF_ENTRY_BYTES as i32;
                ch.perf_current = ch.perf_current.wrapping_add(1);
                ch.perf_wait = ch.perf_speed;
            }
        }
    }

    // performance portamento
    if ch.period_perf_slide_on {
        ch.period_perf_slide_period = ch
            .period_perf_slide_period
            .wrapping_sub(ch.period_perf_slide_speed);
        if ch.period_perf_slide_period != 0 {
            ch.plant_period = true;
        }
    }

    // square modulation
    if ch.waveform == Waveform::Square && ch.square_on {
        ch.square_wait = ch.square_wait.wrapping_sub(1);
        if (ch.square_wait as i8) <= 0 {
            if ch.square_init {
                ch.square_init = false;
                if (ch.square_pos as i8) <= (ch.square_lower_limit as i8) {
                    ch.square_sliding_in = true;
                    ch.square_signum = 1;
                } else if (ch.square_pos as i8) >= (ch.square_upper_limit as i8) {
                    ch.square_sliding_in = true;
                    ch.square_signum = -1;
                }
            }

            if ch.square_pos == ch.square_lower_limit || ch.square_pos == ch.square_upper_limit {
                if ch.square_sliding_in {
                    ch.square_sliding_in = false;
                } else {
                    ch.square_signum = -ch.square_signum;
                }
            }

            ch.square_pos = ch.square_pos.wrapping_add(ch.square_signum as u8);
            ch.plant_square = true;
            ch.square_wait = ins.square_speed;
        }
    }

    // filter modulation
    if ch.filter_on {
        ch.filter_wait = ch.filter_wait.wrapping_sub(1);
        if (ch.filter_wait as i8) <= 0 {
            if ch.filter_init {
                ch.filter_init = false;
                if (ch.filter_pos as i8) <= (ch.filter_lower_limit as i8) {
                    ch.filter_sliding_in = true;
                    ch.filter_signum = 1;
                } else if (ch.filter_pos as i8) >= (ch.filter_upper_limit as i8) {
                    ch.filter_sliding_in = true;
                    ch.filter_signum = -1;
                }
            }

            // low speeds take several steps per tick
            let cycles = if ch.filter_speed < 4 { 5 - ch.filter_speed as i32 } else { 1 };
            for _ in 0..cycles {
                if ch.filter_pos == ch.filter_lower_limit || ch.filter_pos == ch.filter_upper_limit
                {
                    if ch.filter_sliding_in {
                        ch.filter_sliding_in = false;
                    } else {
                        ch.filter_signum = -ch.filter_signum;
                    }
                }
                ch.filter_pos = ch.filter_pos.wrapping_add(ch.filter_signum as u8);
            }

            ch.new_waveform = true;
            ch.filter_wait = ch.filter_speed.wrapping_sub(3);
            if (ch.filter_wait as i8) < 1 {
                ch.filter_wait = 1;
            }
        }
    }

    // square rebuild: resample the selected pulse band into the scratch
    // buffer the Paula copy reads from
    if ch.waveform == Waveform::Square || ch.plant_square {
        let (bank, base) = match WaveformBank::section_offset(ch.filter_pos) {
            Some(section) => (waves.data(), section + SQUARES_OFFSET),
            None => (waves.empty(), 0),
        };

        let mut which_square = ch.square_pos << (5 - ch.wavelength);
        if (which_square as i8) > 0x20 {
            which_square = 0x40u8.wrapping_sub(which_square);
            ch.square_reverse = true;
        }
        which_square = which_square.wrapping_sub(1);
        if (which_square as i8) < 0 {
            which_square = 0;
        }

        let mut src = base + ((which_square as usize) << 7);
        let delta = 32usize >> ch.wavelength;
        let length = (1usize << ch.wavelength) << 2;
        for sample in square_buf[..length].iter_mut() {
            *sample = bank.get(src).copied().unwrap_or(0);
            src += delta;
        }

        ch.new_waveform = true;
        ch.plant_square = false;
    }

    // a noise voice re-randomizes its read offset every tick
    if ch.waveform == Waveform::Noise {
        ch.new_waveform = true;
    }

    if ch.new_waveform {
        if ch.waveform == Waveform::Square {
            ch.audio_source = AudioSource::SquareTemp;
        } else {
            match WaveformBank::section_offset(ch.filter_pos) {
                None => ch.audio_source = AudioSource::Empty,
                Some(section) => {
                    let mut offset = section
                        + match ch.waveform {
                            Waveform::Triangle => WAVE_OFFSETS[ch.wavelength as usize],
                            Waveform::Sawtooth => {
                                SAWTOOTH_OFFSET + WAVE_OFFSETS[ch.wavelength as usize]
                            }
                            Waveform::Noise => NOISE_OFFSET,
                            Waveform::Square => unreachable!(),
                        };
                    if ch.waveform == Waveform::Noise {
                        offset += (song.wn_random & (NOISE_SIZE as u32 - 0x280 - 1)) as usize;
                    }
                    ch.audio_source = AudioSource::Bank(offset);
                }
            }
            if ch.waveform == Waveform::Noise {
                let mut seed = song.wn_random;
                seed = seed.wrapping_add(2239384);
                seed = seed.rotate_right(8);
                seed = seed.wrapping_add(782323);
                seed ^= 0b100_1011;
                seed = seed.wrapping_sub(6735);
                song.wn_random = seed;
            }
        }
    }

    // final period: compose, then clamp into Paula's range
    let mut note = ch.instr_period;
    if !ch.fixed_note {
        note = note.wrapping_add(ch.transpose as i16);
        note = note.wrapping_add(ch.track_period - 1);
    }
    if note > 5 * 12 {
        note = 5 * 12;
    }

    let mut period = if note < 0 {
        if note < -129 {
            note = -129;
        }
        BEFORE_PERIOD_TABLE_68020[(note + 129) as usize] as i16
    } else {
        PERIOD_TABLE[note as usize]
    };

    if !ch.fixed_note {
        period = period.wrapping_add(ch.period_slide_period);
    }
    period = period.wrapping_add(ch.period_perf_slide_period);
    period = period.wrapping_add(ch.vibrato_period);
    ch.audio_period = period.clamp(113, 3424) as u16;

    // final volume: ADSR * note volume * performance volume * track volume
    let mut volume = (ch.adsr >> 8) as u16;
    volume = ((volume as u32 * ch.note_max_volume as u32) >> 6) as u16;
    volume = ((volume as u32 * ch.perf_sub_volume as u32) >> 6) as u16;
    ch.audio_volume = ((volume as u32 * ch.track_master_volume as u32) >> 6) as u16;
}
