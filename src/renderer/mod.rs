//! Voice rendering engine
//!
//! Owns the eight 80-sample mixing buffers and the shared lookup tables,
//! and renders one voice at a time into them: fetch the voice parameter
//! block, download and decode raw samples, resample to exactly 80 output
//! samples, apply the volume ramp while accumulating into every buffer the
//! voice routes to, then store the updated block back to memory.
//!
//! The engine knows nothing about the mailbox protocol; the state machine
//! in [`crate::ucode`] drives it through the
//! `prepare_frame → add_voice(n) → finalize_frame` contract.

pub mod decode;
pub mod vpb;

use log::warn;

use crate::memory::DspMemory;
use crate::state::{StateReader, StateWriter};
use vpb::{Vpb, VpbFlags, VPB_SIZE_BYTES, VPB_SIZE_WORDS};

/// Samples produced per voice per rendering pass.
pub const MIXING_BUFFER_SIZE: usize = 0x50;

/// One accumulation buffer's worth of samples.
pub type MixingBuffer = [i16; MIXING_BUFFER_SIZE];

/// Largest raw run one pass can consume: 80 output samples at the maximum
/// 4.12 ratio (just under 16 raw samples each), plus the 4-sample filter
/// context.
const RAW_INPUT_BUFFER_SIZE: usize = MIXING_BUFFER_SIZE * 16 + 4;

/// Scale a buffer in place by a fixed-point volume with `frac_bits`
/// fractional bits, saturating each sample to the signed 16-bit range.
fn apply_volume_in_place(buf: &mut MixingBuffer, vol: u16, frac_bits: u32) {
    for sample in buf.iter_mut() {
        let mut tmp = *sample as i32 * vol as i32;
        tmp >>= frac_bits;
        *sample = tmp.clamp(-0x8000, 0x7FFF) as i16;
    }
}

/// Scale a buffer by a 1.15 fixed-point volume (unity = 0x8000).
pub fn apply_volume_in_place_1_15(buf: &mut MixingBuffer, vol: u16) {
    apply_volume_in_place(buf, vol, 15);
}

/// Scale a buffer by a 4.12 fixed-point volume (unity = 0x1000).
pub fn apply_volume_in_place_4_12(buf: &mut MixingBuffer, vol: u16) {
    apply_volume_in_place(buf, vol, 12);
}

/// Accumulate `src` into `dst` while ramping a 32-bit running volume.
///
/// The upper 16 bits of `vol` are the effective gain: each sample
/// contributes `((vol >> 16) * src[i]) >> 16`, accumulated with
/// saturation, and `vol` advances by `step` after every sample. A zero
/// volume with a zero step is a recognized nothing-to-do fast path.
///
/// Returns the running volume after the last sample, so a caller can
/// carry a ramp across buffers.
///
/// The original hardware steps its ramps in far coarser increments; the
/// per-sample cadence here is an audibly transparent refinement.
pub fn add_buffers_with_volume_ramp(
    dst: &mut MixingBuffer,
    src: &MixingBuffer,
    mut vol: i32,
    step: i32,
) -> i32 {
    if vol == 0 && step == 0 {
        return vol;
    }

    for (d, s) in dst.iter_mut().zip(src.iter()) {
        let contribution = ((vol >> 16) * (*s as i32)) >> 16;
        *d = (*d as i32 + contribution).clamp(-0x8000, 0x7FFF) as i16;
        vol += step;
    }

    vol
}

/// Combine a 1.15 voice volume with a 1.15 routing gain into the 16-bit
/// effective gain fed to the ramp (capped so the running volume stays a
/// positive `i32` across the `<< 16` widening).
fn combine_gains(volume: u16, gain: u16) -> i32 {
    (((volume as u32 * gain as u32) >> 15) as i32).min(0x7FFF)
}

/// The per-voice rendering engine.
///
/// Holds the eight mixing buffers, the host-uploaded lookup tables and the
/// output configuration. One instance belongs to one UCode instance and
/// lives exactly as long as it does.
#[derive(Debug, Clone)]
pub struct AudioRenderer {
    /// Whether `prepare_frame` has run since the last `finalize_frame`.
    prepared: bool,

    // Primary-memory addresses the finalized frame is written to.
    output_lbuf_addr: u32,
    output_rbuf_addr: u32,

    /// Master output volume applied before upload, 1.15 fixed point.
    output_volume: u16,

    /// Base address of the linear VPB array in primary memory.
    vpb_base_addr: u32,

    // Mixing buffers.
    buf_front_left: MixingBuffer,
    buf_front_right: MixingBuffer,
    buf_back_left: MixingBuffer,
    buf_back_right: MixingBuffer,
    buf_front_left_reverb: MixingBuffer,
    buf_front_right_reverb: MixingBuffer,
    buf_back_left_reverb: MixingBuffer,
    buf_back_right_reverb: MixingBuffer,

    /// Quarter-wave sine table, 1.15 fixed point. Uploaded by the host
    /// alongside the other tables; the pattern-synthesis voice formats
    /// that consume it are not part of this implementation.
    sine_table: [i16; 0x80],

    /// Polyphase resampling coefficients: 64 phases of 4 taps, 1.15.
    resampling_coeffs: [i16; 0x100],

    /// AFC predictor coefficients: 16 pairs, 5.11 fixed point.
    afc_coeffs: [i16; 0x20],
}

impl Default for AudioRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioRenderer {
    /// Create a renderer with cleared buffers and tables.
    pub fn new() -> Self {
        Self {
            prepared: false,
            output_lbuf_addr: 0,
            output_rbuf_addr: 0,
            output_volume: 0,
            vpb_base_addr: 0,
            buf_front_left: [0; MIXING_BUFFER_SIZE],
            buf_front_right: [0; MIXING_BUFFER_SIZE],
            buf_back_left: [0; MIXING_BUFFER_SIZE],
            buf_back_right: [0; MIXING_BUFFER_SIZE],
            buf_front_left_reverb: [0; MIXING_BUFFER_SIZE],
            buf_front_right_reverb: [0; MIXING_BUFFER_SIZE],
            buf_back_left_reverb: [0; MIXING_BUFFER_SIZE],
            buf_back_right_reverb: [0; MIXING_BUFFER_SIZE],
            sine_table: [0; 0x80],
            resampling_coeffs: [0; 0x100],
            afc_coeffs: [0; 0x20],
        }
    }

    /// Install the quarter-wave sine table.
    pub fn set_sine_table(&mut self, table: [i16; 0x80]) {
        self.sine_table = table;
    }

    /// Install the polyphase resampling coefficients.
    pub fn set_resampling_coeffs(&mut self, coeffs: [i16; 0x100]) {
        self.resampling_coeffs = coeffs;
    }

    /// Install the AFC predictor coefficient pairs.
    pub fn set_afc_coeffs(&mut self, coeffs: [i16; 0x20]) {
        self.afc_coeffs = coeffs;
    }

    /// Set the base address of the VPB array in primary memory.
    pub fn set_vpb_base_addr(&mut self, addr: u32) {
        self.vpb_base_addr = addr;
    }

    /// Set the master output volume (1.15 fixed point).
    pub fn set_output_volume(&mut self, volume: u16) {
        self.output_volume = volume;
    }

    /// Set the primary-memory address the left output buffer is written to.
    pub fn set_output_left_buffer_addr(&mut self, addr: u32) {
        self.output_lbuf_addr = addr;
    }

    /// Set the primary-memory address the right output buffer is written to.
    pub fn set_output_right_buffer_addr(&mut self, addr: u32) {
        self.output_rbuf_addr = addr;
    }

    /// Whether a frame is currently prepared.
    pub fn is_prepared(&self) -> bool {
        self.prepared
    }

    /// Front-left mixing buffer contents (observability for hosts/tests).
    pub fn front_left(&self) -> &MixingBuffer {
        &self.buf_front_left
    }

    /// Front-right mixing buffer contents.
    pub fn front_right(&self) -> &MixingBuffer {
        &self.buf_front_right
    }

    /// Zero all eight mixing buffers and mark the engine prepared.
    pub fn prepare_frame(&mut self) {
        for buf in [
            &mut self.buf_front_left,
            &mut self.buf_front_right,
            &mut self.buf_back_left,
            &mut self.buf_back_right,
            &mut self.buf_front_left_reverb,
            &mut self.buf_front_right_reverb,
            &mut self.buf_back_left_reverb,
            &mut self.buf_back_right_reverb,
        ] {
            buf.fill(0);
        }
        self.prepared = true;
    }

    /// Render one voice into the mixing buffers.
    ///
    /// Fetches the voice's parameter block, decodes and resamples its
    /// stream, mixes the 80-sample result into every routed buffer through
    /// the volume ramp and stores the updated block back. Inactive voices
    /// and voices with an unknown format tag are no-ops.
    pub fn add_voice<M: DspMemory>(&mut self, mem: &mut M, voice_id: u16) {
        if !self.prepared {
            warn!("add_voice({voice_id}) before prepare_frame, ignored");
            return;
        }

        let mut vpb = self.fetch_vpb(mem, voice_id);
        if !vpb.is_active() {
            return;
        }
        let Some(format) = vpb.sample_format() else {
            warn!("voice {voice_id} has unknown sample format {:#06x}", vpb.format);
            return;
        };

        // The fraction is 12 bits; stray host-written upper bits would
        // overrun the raw buffer.
        vpb.current_pos_frac &= 0xFFF;

        let needed = self.needed_raw_samples_count(&vpb);
        let mut raw = [0i16; RAW_INPUT_BUFFER_SIZE];
        raw[..4].copy_from_slice(&vpb.resample_hist);
        self.load_input_samples(mem, &mut vpb, format, needed, &mut raw);

        let mut input_samples: MixingBuffer = [0; MIXING_BUFFER_SIZE];
        self.resample(&mut vpb, &raw[..needed + 4], &mut input_samples);
        vpb.resample_hist.copy_from_slice(&raw[needed..needed + 4]);

        self.mix_voice(&vpb, &input_samples);
        vpb.volume = vpb.target_volume;

        self.store_vpb(mem, voice_id, &vpb);
    }

    /// Scale the four main buffers by the master volume and upload the
    /// front pair to the configured primary-memory addresses.
    pub fn finalize_frame<M: DspMemory>(&mut self, mem: &mut M) {
        if !self.prepared {
            warn!("finalize_frame without prepare_frame");
        }

        let volume = self.output_volume;
        apply_volume_in_place_1_15(&mut self.buf_front_left, volume);
        apply_volume_in_place_1_15(&mut self.buf_front_right, volume);
        apply_volume_in_place_1_15(&mut self.buf_back_left, volume);
        apply_volume_in_place_1_15(&mut self.buf_back_right, volume);

        for (i, &sample) in self.buf_front_left.iter().enumerate() {
            mem.write_ram_u16(self.output_lbuf_addr.wrapping_add(i as u32 * 2), sample as u16);
        }
        for (i, &sample) in self.buf_front_right.iter().enumerate() {
            mem.write_ram_u16(self.output_rbuf_addr.wrapping_add(i as u32 * 2), sample as u16);
        }

        self.prepared = false;
    }

    /// Raw samples that must be fetched so resampling yields exactly 80
    /// output samples from the current fractional position.
    fn needed_raw_samples_count(&self, vpb: &Vpb) -> usize {
        ((vpb.current_pos_frac as u32
            + MIXING_BUFFER_SIZE as u32 * vpb.resampling_ratio as u32)
            >> 12) as usize
    }

    /// Polyphase-resample `src` (4 context samples followed by the fresh
    /// raw run) into 80 output samples, advancing the fractional position.
    fn resample(&self, vpb: &mut Vpb, src: &[i16], dst: &mut MixingBuffer) {
        let ratio = vpb.resampling_ratio as u32;
        let mut pos = vpb.current_pos_frac as u32;

        for out in dst.iter_mut() {
            let base = (pos >> 12) as usize;
            let phase = ((pos >> 6) & 0x3F) as usize;
            let coeffs = &self.resampling_coeffs[phase * 4..phase * 4 + 4];

            let mut acc: i32 = 0;
            for (tap, &coeff) in coeffs.iter().enumerate() {
                acc += src[base + tap] as i32 * coeff as i32;
            }
            *out = (acc >> 15).clamp(-0x8000, 0x7FFF) as i16;

            pos += ratio;
        }

        vpb.current_pos_frac = (pos & 0xFFF) as u16;
    }

    /// Ramp-mix one voice's resampled frame into every routed buffer.
    fn mix_voice(&mut self, vpb: &Vpb, input_samples: &MixingBuffer) {
        let gains = vpb.channel_gains;
        let main: [(&mut MixingBuffer, u16); 4] = [
            (&mut self.buf_front_left, gains[0]),
            (&mut self.buf_front_right, gains[1]),
            (&mut self.buf_back_left, gains[2]),
            (&mut self.buf_back_right, gains[3]),
        ];
        for (buf, gain) in main {
            Self::ramp_mix(buf, input_samples, vpb, gain);
        }

        if vpb.flags().contains(VpbFlags::REVERB_SEND) && vpb.reverb_volume != 0 {
            let mut send = *input_samples;
            apply_volume_in_place_4_12(&mut send, vpb.reverb_volume);
            let reverb: [(&mut MixingBuffer, u16); 4] = [
                (&mut self.buf_front_left_reverb, gains[0]),
                (&mut self.buf_front_right_reverb, gains[1]),
                (&mut self.buf_back_left_reverb, gains[2]),
                (&mut self.buf_back_right_reverb, gains[3]),
            ];
            for (buf, gain) in reverb {
                Self::ramp_mix(buf, &send, vpb, gain);
            }
        }
    }

    /// Mix into one buffer, ramping from the voice's current volume to its
    /// target across the 80 samples.
    fn ramp_mix(dst: &mut MixingBuffer, src: &MixingBuffer, vpb: &Vpb, gain: u16) {
        let start = combine_gains(vpb.volume, gain);
        let end = combine_gains(vpb.target_volume, gain);
        let vol = start << 16;
        let step = ((end - start) << 16) / MIXING_BUFFER_SIZE as i32;
        add_buffers_with_volume_ramp(dst, src, vol, step);
    }

    /// Fetch a voice's parameter block from primary memory.
    pub fn fetch_vpb<M: DspMemory>(&self, mem: &M, voice_id: u16) -> Vpb {
        let base = self.vpb_base_addr.wrapping_add(voice_id as u32 * VPB_SIZE_BYTES);
        let mut words = [0u16; VPB_SIZE_WORDS];
        for (i, word) in words.iter_mut().enumerate() {
            *word = mem.read_ram_u16(base.wrapping_add(i as u32 * 2));
        }
        Vpb::from_words(&words)
    }

    /// Store a voice's parameter block back to primary memory.
    pub fn store_vpb<M: DspMemory>(&self, mem: &mut M, voice_id: u16, vpb: &Vpb) {
        let base = self.vpb_base_addr.wrapping_add(voice_id as u32 * VPB_SIZE_BYTES);
        for (i, word) in vpb.to_words().iter().enumerate() {
            mem.write_ram_u16(base.wrapping_add(i as u32 * 2), *word);
        }
    }

    /// Flush the renderer's raw state into a save-state stream.
    pub fn save_state(&self, w: &mut StateWriter) {
        w.write_bool(self.prepared);
        w.write_u32(self.output_lbuf_addr);
        w.write_u32(self.output_rbuf_addr);
        w.write_u16(self.output_volume);
        w.write_u32(self.vpb_base_addr);
        for buf in [
            &self.buf_front_left,
            &self.buf_front_right,
            &self.buf_back_left,
            &self.buf_back_right,
            &self.buf_front_left_reverb,
            &self.buf_front_right_reverb,
            &self.buf_back_left_reverb,
            &self.buf_back_right_reverb,
        ] {
            w.write_i16_slice(buf);
        }
        w.write_i16_slice(&self.sine_table);
        w.write_i16_slice(&self.resampling_coeffs);
        w.write_i16_slice(&self.afc_coeffs);
    }

    /// Restore the renderer's raw state from a save-state stream.
    pub fn load_state(&mut self, r: &mut StateReader<'_>) -> std::io::Result<()> {
        self.prepared = r.read_bool()?;
        self.output_lbuf_addr = r.read_u32()?;
        self.output_rbuf_addr = r.read_u32()?;
        self.output_volume = r.read_u16()?;
        self.vpb_base_addr = r.read_u32()?;
        for buf in [
            &mut self.buf_front_left,
            &mut self.buf_front_right,
            &mut self.buf_back_left,
            &mut self.buf_back_right,
            &mut self.buf_front_left_reverb,
            &mut self.buf_front_right_reverb,
            &mut self.buf_back_left_reverb,
            &mut self.buf_back_right_reverb,
        ] {
            r.read_i16_slice(buf)?;
        }
        r.read_i16_slice(&mut self.sine_table)?;
        r.read_i16_slice(&mut self.resampling_coeffs)?;
        r.read_i16_slice(&mut self.afc_coeffs)?;
        Ok(())
    }
}
