//! The output stage: mix-down of the Paula voices, the A1200 RC filter
//! pair, optional 2x decimation, stereo separation, normalization and
//! triangular-dithered quantization to 16-bit PCM.

use core::f64::consts::TAU;

use super::paula::{generate_samples, Blep, PaulaVoice};
use super::waves::VOICE_BUFFER_LEN;
use super::{AHX_DEFAULT_CIA_PERIOD, AHX_HIGHEST_CIA_PERIOD, AMIGA_VOICES, CIA_PAL_CLK, PAULA_PAL_CLK};

/// Loudness headroom factor of the normalization stage.
const NORM_FACTOR: f64 = 1.5;
/// Cumulative mid/side normalization, (1/sqrt 2) squared.
const STEREO_NORM_FACTOR: f64 = 0.5;
const INITIAL_DITHER_SEED: i32 = 0x12345000;
/// Keeps the one-pole filter states out of denormal range.
const DENORMAL_OFFSET: f64 = 1e-20;

/// Converts a CIA-8520 timer period into its interrupt rate in Hz.
/// The timer triggers on underflow, hence the `+ 1`.
#[inline]
pub fn cia_period_to_hz(period: u16) -> f64 {
    CIA_PAL_CLK / (period as f64 + 1.0)
}

/// 1-pole 6 dB/oct RC filter, stereo state.
#[derive(Debug, Default, Clone, Copy)]
struct RcFilter {
    c1: f64,
    c2: f64,
    state: [f64; 2],
}

impl RcFilter {
    fn set_cutoff(&mut self, sample_rate: f64, hz: f64) {
        let a = if hz < sample_rate / 2.0 { ((TAU * hz) / sample_rate).cos() } else { 1.0 };
        let b = 2.0 - a;
        let c = b - (b * b - 1.0).sqrt();
        self.c1 = 1.0 - c;
        self.c2 = c;
    }

    fn clear(&mut self) {
        self.state = [0.0; 2];
    }

    fn low_pass(&mut self, input: [f64; 2]) -> [f64; 2] {
        self.state[0] = (self.c1 * input[0]) + (self.c2 * self.state[0]) + DENORMAL_OFFSET;
        self.state[1] = (self.c1 * input[1]) + (self.c2 * self.state[1]) + DENORMAL_OFFSET;
        self.state
    }

    fn high_pass(&mut self, input: [f64; 2]) -> [f64; 2] {
        let low = self.low_pass(input);
        [input[0] - low[0], input[1] - low[1]]
    }
}

/// 9-tap half-band decimator for the 2x-oversampled path.
#[derive(Debug, Default)]
struct Decimator {
    left: [f64; 9],
    right: [f64; 9],
}

impl Decimator {
    fn clear(&mut self) {
        self.left = [0.0; 9];
        self.right = [0.0; 9];
    }

    fn decimate(state: &mut [f64; 9], x0: f64, x1: f64) -> f64 {
        const H0: f64 = 8192.0 / 16384.0;
        const H1: f64 = 5042.0 / 16384.0;
        const H3: f64 = -1277.0 / 16384.0;
        const H5: f64 = 429.0 / 16384.0;
        const H7: f64 = -116.0 / 16384.0;
        const H9: f64 = 18.0 / 16384.0;

        let h9x0 = H9 * x0;
        let h7x0 = H7 * x0;
        let h5x0 = H5 * x0;
        let h3x0 = H3 * x0;
        let h1x0 = H1 * x0;
        let output = state[8] + h9x0;

        state[8] = state[7] + h7x0;
        state[7] = state[6] + h5x0;
        state[6] = state[5] + h3x0;
        state[5] = state[4] + h1x0;
        state[4] = state[3] + h1x0 + H0 * x1;
        state[3] = state[2] + h3x0;
        state[2] = state[1] + h5x0;
        state[1] = state[0] + h7x0;
        state[0] = h9x0;

        output
    }
}

#[inline]
fn clamp16(sample: i32) -> i16 {
    if sample as i16 as i32 != sample {
        (0x7FFF ^ (sample >> 31)) as i16
    } else {
        sample as i16
    }
}

/// Mix buffers, filter chain and output settings.
///
/// Unused until [AudioOutput::init] allocates the buffers; a player with an
/// uninitialized output stage produces silence instead of panicking.
#[derive(Debug, Default)]
pub(crate) struct AudioOutput {
    output_freq: i32,
    master_vol: i32,
    stereo_separation: i32,
    pub(crate) pause: bool,

    oversampling: bool,
    period_to_delta_div: f64,
    mix_normalize: f64,
    side_factor: f64,

    mix_l: Vec<f64>,
    mix_r: Vec<f64>,

    filter_lo: RcFilter,
    filter_hi: RcFilter,
    use_lowpass: bool,
    decimator: Decimator,

    dither_seed: i32,
    prng_state_l: f64,
    prng_state_r: f64,

    /// 32.32 fixed-point samples left within the current replayer tick.
    pub(crate) tick_sample_counter: i64,
    /// 32.32 fixed-point samples per replayer tick.
    pub(crate) samples_per_tick: i64,
}

impl AudioOutput {
    /// Sets up the output stage for the given rate and levels.
    ///
    /// Rates below 96 kHz run the Paula model 2x oversampled and decimate on
    /// output. The rate floor keeps the phase delta of the lowest Paula
    /// period below one sample per output sample.
    pub(crate) fn init(&mut self, output_freq: i32, master_vol: i32, stereo_separation: i32) {
        let min_freq = (PAULA_PAL_CLK / 113.0) as i32 + 1;
        self.output_freq = output_freq.clamp(min_freq, 384000);

        self.set_stereo_separation(stereo_separation);
        self.set_master_volume(master_vol);

        self.oversampling = self.output_freq < 96000;

        self.period_to_delta_div = PAULA_PAL_CLK / self.output_freq as f64;
        if self.oversampling {
            self.period_to_delta_div *= 0.5;
        }

        let mut max_samples_per_tick =
            (self.output_freq as f64 / cia_period_to_hz(AHX_HIGHEST_CIA_PERIOD)).ceil() as usize;
        if self.oversampling {
            max_samples_per_tick *= 2;
        }
        self.mix_l = vec![0.0; max_samples_per_tick];
        self.mix_r = vec![0.0; max_samples_per_tick];

        self.calculate_filter_coeffs();
        self.decimator.clear();

        self.set_cia_period(AHX_DEFAULT_CIA_PERIOD);
        self.tick_sample_counter = 0;

        self.reset_dithering();
    }

    /// Releases the mix buffers; the player goes silent until the next init.
    pub(crate) fn close(&mut self) {
        self.mix_l = Vec::new();
        self.mix_r = Vec::new();
    }

    #[inline]
    pub(crate) fn is_ready(&self) -> bool {
        !self.mix_l.is_empty() && self.samples_per_tick > 0
    }

    #[inline]
    pub(crate) fn output_freq(&self) -> i32 {
        self.output_freq
    }

    #[inline]
    pub(crate) fn master_volume(&self) -> i32 {
        self.master_vol
    }

    #[inline]
    pub(crate) fn stereo_separation(&self) -> i32 {
        self.stereo_separation
    }

    #[inline]
    pub(crate) fn period_to_delta_div(&self) -> f64 {
        self.period_to_delta_div
    }

    /// Master volume 0..=256, folded into the normalization factor.
    /// The factor is negative: the Amiga audio path inverts the phase.
    pub(crate) fn set_master_volume(&mut self, volume: i32) {
        self.master_vol = volume.clamp(0, 256);
        self.mix_normalize = (NORM_FACTOR * (-(i16::MAX as f64) / AMIGA_VOICES as f64))
            * (self.master_vol as f64 / 256.0);
    }

    /// Stereo separation 0..=100 percent; 100 keeps the hard panning.
    pub(crate) fn set_stereo_separation(&mut self, percentage: i32) {
        self.stereo_separation = percentage.clamp(0, 100);
        self.side_factor = (self.stereo_separation as f64 / 100.0) * STEREO_NORM_FACTOR;
    }

    /// Programs the replayer tick length from a CIA timer period.
    pub(crate) fn set_cia_period(&mut self, period: u16) {
        let hz = cia_period_to_hz(period);
        let samples_per_tick = self.output_freq as f64 / hz;
        self.samples_per_tick = (samples_per_tick * (u32::MAX as f64 + 1.0)) as i64;
    }

    pub(crate) fn clear_filter_state(&mut self) {
        self.filter_lo.clear();
        self.filter_hi.clear();
    }

    pub(crate) fn reset_dithering(&mut self) {
        self.dither_seed = INITIAL_DITHER_SEED;
        self.prng_state_l = 0.0;
        self.prng_state_r = 0.0;
    }

    /// A1200 filter path.
    ///
    /// The fixed RC low-pass (680 ohm / 6800 pF, ~34.4 kHz) only matters when
    /// the mix rate can represent it; the RC high-pass (1390 ohm / 22 uF,
    /// ~5.2 Hz) is always in circuit. No Sallen-Key "LED" filter: AHX never
    /// enables it.
    fn calculate_filter_coeffs(&mut self) {
        let mut rate = self.output_freq as f64;
        if self.oversampling {
            rate *= 2.0;
        }

        let cutoff = 1.0 / (TAU * 680.0 * 6.8e-9);
        self.use_lowpass = rate / 2.0 > cutoff;
        if self.use_lowpass {
            self.filter_lo.set_cutoff(rate, cutoff);
        }

        let cutoff = 1.0 / (TAU * 1390.0 * 2.2e-5);
        self.filter_hi.set_cutoff(rate, cutoff);

        self.clear_filter_state();
    }

    fn process_filters(&mut self, num_samples: usize) {
        for i in 0..num_samples {
            let mut samples = [self.mix_l[i], self.mix_r[i]];
            if self.use_lowpass {
                samples = self.filter_lo.low_pass(samples);
            }
            samples = self.filter_hi.high_pass(samples);
            self.mix_l[i] = samples[0];
            self.mix_r[i] = samples[1];
        }
    }

    fn random32(&mut self) -> i32 {
        self.dither_seed = self.dither_seed.wrapping_mul(134775813).wrapping_add(1);
        self.dither_seed
    }

    /// Separation, normalization, 1-bit triangular (high-pass shaped)
    /// dithering and the final clamp of one stereo sample.
    fn quantize(&mut self, left: f64, right: f64) -> (i16, i16) {
        let (mut left, mut right) = (left, right);
        if self.stereo_separation != 100 {
            let mid = (left + right) * STEREO_NORM_FACTOR;
            let side = (left - right) * self.side_factor;
            left = mid + side;
            right = mid - side;
        }

        left *= self.mix_normalize;
        right *= self.mix_normalize;

        let prng = self.random32() as f64 * (0.5 / i32::MAX as f64);
        let dithered = (left + prng) - self.prng_state_l;
        self.prng_state_l = prng;
        let out_l = clamp16(dithered as i32);

        let prng = self.random32() as f64 * (0.5 / i32::MAX as f64);
        let dithered = (right + prng) - self.prng_state_r;
        self.prng_state_r = prng;
        let out_r = clamp16(dithered as i32);

        (out_l, out_r)
    }

    /// Mixes `target.len() / 2` stereo frames: voice generation, filters,
    /// (optional) decimation, then per-sample quantization.
    pub(crate) fn mix(
        &mut self,
        paula: &mut [PaulaVoice; AMIGA_VOICES],
        bleps: &mut [Blep; AMIGA_VOICES],
        voice_bufs: &[[i8; VOICE_BUFFER_LEN]; AMIGA_VOICES],
        target: &mut [i16],
    ) {
        let frames = target.len() / 2;
        if frames == 0 {
            return;
        }
        let mix_samples = if self.oversampling { frames * 2 } else { frames };
        if self.mix_l.len() < mix_samples {
            target.fill(0);
            return;
        }

        generate_samples(
            paula,
            bleps,
            voice_bufs,
            &mut self.mix_l[..mix_samples],
            &mut self.mix_r[..mix_samples],
        );
        self.process_filters(mix_samples);

        if self.oversampling {
            for i in 0..frames {
                let left =
                    Decimator::decimate(&mut self.decimator.left, self.mix_l[i * 2], self.mix_l[i * 2 + 1]);
                let right =
                    Decimator::decimate(&mut self.decimator.right, self.mix_r[i * 2], self.mix_r[i * 2 + 1]);
                let (out_l, out_r) = self.quantize(left, right);
                target[i * 2] = out_l;
                target[i * 2 + 1] = out_r;
            }
        } else {
            for i in 0..frames {
                let (out_l, out_r) = self.quantize(self.mix_l[i], self.mix_r[i]);
                target[i * 2] = out_l;
                target[i * 2 + 1] = out_r;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cia_period_rates() {
        let hz = cia_period_to_hz(AHX_HIGHEST_CIA_PERIOD);
        assert!((hz - 49.92).abs() < 0.01, "{hz}");
        assert!(cia_period_to_hz(3552) > hz);
    }

    #[test]
    fn clamp16_boundaries() {
        assert_eq!(clamp16(0), 0);
        assert_eq!(clamp16(32767), 32767);
        assert_eq!(clamp16(-32768), -32768);
        assert_eq!(clamp16(32768), 32767);
        assert_eq!(clamp16(-32769), -32768);
        assert_eq!(clamp16(i32::MAX), 32767);
        assert_eq!(clamp16(i32::MIN), -32768);
    }

    #[test]
    fn init_clamps_the_settings() {
        let mut audio = AudioOutput::default();
        audio.init(8000, 999, 150);
        assert_eq!(audio.output_freq(), (PAULA_PAL_CLK / 113.0) as i32 + 1);
        assert_eq!(audio.master_volume(), 256);
        assert_eq!(audio.stereo_separation(), 100);

        audio.init(500_000, -5, -5);
        assert_eq!(audio.output_freq(), 384000);
        assert_eq!(audio.master_volume(), 0);
        assert_eq!(audio.stereo_separation(), 0);
        assert!(!audio.oversampling);

        audio.init(44100, 256, 20);
        assert!(audio.oversampling);
        assert!(audio.is_ready());
    }

    #[test]
    fn samples_per_tick_scales_with_the_rate() {
        let mut audio = AudioOutput::default();
        audio.init(96000, 256, 20);
        let per_tick = audio.samples_per_tick as f64 / (u32::MAX as f64 + 1.0);
        let expected = 96000.0 / cia_period_to_hz(AHX_DEFAULT_CIA_PERIOD);
        assert!((per_tick - expected).abs() < 1e-6);
    }

    #[test]
    fn dither_stream_is_reproducible() {
        let mut audio = AudioOutput::default();
        audio.init(96000, 256, 100);
        let first: Vec<i32> = (0..16).map(|_| audio.random32()).collect();
        audio.reset_dithering();
        let second: Vec<i32> = (0..16).map(|_| audio.random32()).collect();
        assert_eq!(first, second);
        assert_eq!(first[0], INITIAL_DITHER_SEED.wrapping_mul(134775813).wrapping_add(1));
    }

    #[test]
    fn quantize_is_a_passthrough_at_full_separation() {
        let mut audio = AudioOutput::default();
        audio.init(96000, 256, 100);
        // dither adds less than one LSB around the scaled value
        let (left, right) = audio.quantize(-0.5, 0.25);
        let scale = NORM_FACTOR * (-(i16::MAX as f64) / AMIGA_VOICES as f64);
        assert!((left as f64 - -0.5 * scale).abs() <= 1.5);
        assert!((right as f64 - 0.25 * scale).abs() <= 1.5);
    }

    #[test]
    fn zero_separation_folds_to_mono() {
        let mut audio = AudioOutput::default();
        audio.init(96000, 256, 0);
        let (left, right) = audio.quantize(1.0, -1.0);
        // mid is zero; only dither remains
        assert!(left.abs() <= 1);
        assert!(right.abs() <= 1);
    }

    #[test]
    fn high_pass_filter_removes_dc() {
        let mut filter = RcFilter::default();
        filter.set_cutoff(44100.0, 5.2);
        let mut output = [0.0; 2];
        for _ in 0..200_000 {
            output = filter.high_pass([1.0, -1.0]);
        }
        assert!(output[0].abs() < 1e-3);
        assert!(output[1].abs() < 1e-3);
    }

    #[test]
    fn decimator_preserves_a_constant_signal() {
        let mut decimator = Decimator::default();
        let mut last = 0.0;
        for _ in 0..64 {
            last = Decimator::decimate(&mut decimator.left, 1.0, 1.0);
        }
        // the half-band taps sum to one per output sample
        assert!((last - 1.0).abs() < 1e-9, "{last}");
    }
}
