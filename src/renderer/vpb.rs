//! Voice Parameter Block
//!
//! Per-voice persistent state, stored in primary memory at
//! `vpb_base_addr + voice_id * VPB_SIZE_BYTES` as big-endian 16-bit words.
//! The renderer round-trips the block through memory on every voice it
//! touches and keeps no long-lived copy, so the host and the microcode
//! always agree on voice state.

use bitflags::bitflags;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

/// Size of one VPB in 16-bit words.
pub const VPB_SIZE_WORDS: usize = 0x30;

/// Size of one VPB in bytes.
pub const VPB_SIZE_BYTES: u32 = (VPB_SIZE_WORDS as u32) * 2;

// Word offsets within the block.
const W_STATE: usize = 0x00;
const W_FLAGS: usize = 0x01;
const W_FORMAT: usize = 0x02;
const W_SAMPLE_BASE: usize = 0x04;
const W_LOOP_START: usize = 0x06;
const W_LOOP_END: usize = 0x08;
const W_POSITION: usize = 0x0A;
const W_POS_FRAC: usize = 0x0C;
const W_RATIO: usize = 0x0D;
const W_VOLUME: usize = 0x0E;
const W_TARGET_VOLUME: usize = 0x0F;
const W_REVERB_VOLUME: usize = 0x10;
const W_COEF_INDEX: usize = 0x11;
const W_YN1: usize = 0x12;
const W_YN2: usize = 0x13;
const W_LOOP_YN1: usize = 0x14;
const W_LOOP_YN2: usize = 0x15;
const W_AFC_LEFTOVER_COUNT: usize = 0x16;
const W_CHANNEL_GAINS: usize = 0x18;
const W_AFC_LEFTOVER: usize = 0x1C;
const W_RESAMPLE_HIST: usize = 0x2C;

bitflags! {
    /// Voice control flag word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct VpbFlags: u16 {
        /// Wrap from loop-end back to loop-start instead of stopping.
        const LOOP = 0x0001;
        /// Also mix this voice into the four reverb-send buffers.
        const REVERB_SEND = 0x0002;
    }
}

/// Sample source format tag.
///
/// The tag selects both the codec and the memory region the stream lives
/// in: PCM16 streams sit in primary memory, PCM8 and AFC streams in the
/// secondary (sample) region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u16)]
pub enum SampleFormat {
    /// 4-bit adaptive-delta blocks in secondary memory.
    Afc = 0x05,
    /// Signed 8-bit PCM in secondary memory, expanded to 16 bits.
    Pcm8 = 0x08,
    /// Signed big-endian 16-bit PCM in primary memory.
    Pcm16 = 0x10,
}

/// One voice's parameter block.
///
/// Field meanings follow the in-memory layout documented in the module
/// docs; fixed-point formats are noted per field. `format` and `flags` are
/// kept raw so unknown bits written by the host survive the round-trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vpb {
    /// 0 = inactive, nonzero = active. Cleared by the renderer when a
    /// non-looping voice runs out of samples.
    pub state: u16,
    /// Raw flag word; see [`VpbFlags`].
    pub flags: u16,
    /// Raw format tag; see [`SampleFormat`].
    pub format: u16,
    /// Byte address of the sample stream start in its region.
    pub sample_base_addr: u32,
    /// Loop start, in samples from the stream start.
    pub loop_start: u32,
    /// Loop end (exclusive), in samples. Doubles as end-of-stream for
    /// non-looping voices.
    pub loop_end: u32,
    /// Integer part of the read position, in samples.
    pub current_position: u32,
    /// Fractional part of the read position, 0.12 fixed point.
    pub current_pos_frac: u16,
    /// Raw samples consumed per produced sample, 4.12 fixed point.
    pub resampling_ratio: u16,
    /// Current voice volume, 1.15 fixed point.
    pub volume: u16,
    /// Volume ramp target, 1.15 fixed point.
    pub target_volume: u16,
    /// Gain for the reverb-send copy, 4.12 fixed point.
    pub reverb_volume: u16,
    /// AFC coefficient-pair index currently in effect.
    pub coef_index: u16,
    /// Most recent decoded sample (AFC history).
    pub yn1: i16,
    /// Second most recent decoded sample (AFC history).
    pub yn2: i16,
    /// History snapshot restored when the voice loops, so every pass over
    /// the loop decodes identically.
    pub loop_yn1: i16,
    /// See `loop_yn1`.
    pub loop_yn2: i16,
    /// Number of valid entries in `afc_leftover`.
    pub afc_leftover_count: u16,
    /// Routing gains into front-left, front-right, back-left, back-right,
    /// 1.15 fixed point.
    pub channel_gains: [u16; 4],
    /// Decoded-but-unconsumed AFC samples carried to the next frame.
    pub afc_leftover: [i16; 16],
    /// Last four raw samples, context for the 4-tap resampling filter.
    pub resample_hist: [i16; 4],
}

impl Default for Vpb {
    fn default() -> Self {
        Self {
            state: 0,
            flags: 0,
            format: 0,
            sample_base_addr: 0,
            loop_start: 0,
            loop_end: 0,
            current_position: 0,
            current_pos_frac: 0,
            resampling_ratio: 0,
            volume: 0,
            target_volume: 0,
            reverb_volume: 0,
            coef_index: 0,
            yn1: 0,
            yn2: 0,
            loop_yn1: 0,
            loop_yn2: 0,
            afc_leftover_count: 0,
            channel_gains: [0; 4],
            afc_leftover: [0; 16],
            resample_hist: [0; 4],
        }
    }
}

impl Vpb {
    /// Whether this voice should be rendered at all.
    pub fn is_active(&self) -> bool {
        self.state != 0
    }

    /// Decoded flag word.
    pub fn flags(&self) -> VpbFlags {
        VpbFlags::from_bits_truncate(self.flags)
    }

    /// Decoded format tag, or `None` for an unknown value.
    pub fn sample_format(&self) -> Option<SampleFormat> {
        SampleFormat::from_u16(self.format)
    }

    /// Stop the voice; the host observes completion through the stored
    /// state word.
    pub fn deactivate(&mut self) {
        self.state = 0;
    }

    /// Decode a block from its raw word image.
    pub fn from_words(words: &[u16; VPB_SIZE_WORDS]) -> Self {
        let u32_at = |off: usize| ((words[off] as u32) << 16) | words[off + 1] as u32;
        let mut vpb = Self {
            state: words[W_STATE],
            flags: words[W_FLAGS],
            format: words[W_FORMAT],
            sample_base_addr: u32_at(W_SAMPLE_BASE),
            loop_start: u32_at(W_LOOP_START),
            loop_end: u32_at(W_LOOP_END),
            current_position: u32_at(W_POSITION),
            current_pos_frac: words[W_POS_FRAC],
            resampling_ratio: words[W_RATIO],
            volume: words[W_VOLUME],
            target_volume: words[W_TARGET_VOLUME],
            reverb_volume: words[W_REVERB_VOLUME],
            coef_index: words[W_COEF_INDEX],
            yn1: words[W_YN1] as i16,
            yn2: words[W_YN2] as i16,
            loop_yn1: words[W_LOOP_YN1] as i16,
            loop_yn2: words[W_LOOP_YN2] as i16,
            afc_leftover_count: words[W_AFC_LEFTOVER_COUNT],
            ..Self::default()
        };
        for i in 0..4 {
            vpb.channel_gains[i] = words[W_CHANNEL_GAINS + i];
        }
        for i in 0..16 {
            vpb.afc_leftover[i] = words[W_AFC_LEFTOVER + i] as i16;
        }
        for i in 0..4 {
            vpb.resample_hist[i] = words[W_RESAMPLE_HIST + i] as i16;
        }
        vpb
    }

    /// Encode the block back to its raw word image.
    pub fn to_words(&self) -> [u16; VPB_SIZE_WORDS] {
        let mut words = [0u16; VPB_SIZE_WORDS];
        let put_u32 = |words: &mut [u16; VPB_SIZE_WORDS], off: usize, v: u32| {
            words[off] = (v >> 16) as u16;
            words[off + 1] = v as u16;
        };
        words[W_STATE] = self.state;
        words[W_FLAGS] = self.flags;
        words[W_FORMAT] = self.format;
        put_u32(&mut words, W_SAMPLE_BASE, self.sample_base_addr);
        put_u32(&mut words, W_LOOP_START, self.loop_start);
        put_u32(&mut words, W_LOOP_END, self.loop_end);
        put_u32(&mut words, W_POSITION, self.current_position);
        words[W_POS_FRAC] = self.current_pos_frac;
        words[W_RATIO] = self.resampling_ratio;
        words[W_VOLUME] = self.volume;
        words[W_TARGET_VOLUME] = self.target_volume;
        words[W_REVERB_VOLUME] = self.reverb_volume;
        words[W_COEF_INDEX] = self.coef_index;
        words[W_YN1] = self.yn1 as u16;
        words[W_YN2] = self.yn2 as u16;
        words[W_LOOP_YN1] = self.loop_yn1 as u16;
        words[W_LOOP_YN2] = self.loop_yn2 as u16;
        words[W_AFC_LEFTOVER_COUNT] = self.afc_leftover_count;
        for i in 0..4 {
            words[W_CHANNEL_GAINS + i] = self.channel_gains[i];
        }
        for i in 0..16 {
            words[W_AFC_LEFTOVER + i] = self.afc_leftover[i] as u16;
        }
        for i in 0..4 {
            words[W_RESAMPLE_HIST + i] = self.resample_hist[i] as u16;
        }
        words
    }
}
