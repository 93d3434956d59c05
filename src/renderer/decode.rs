//! Sample acquisition pipeline
//!
//! Downloads and decodes the raw (pre-resampling) sample run for one voice:
//! 16-bit PCM copied from primary memory, 8-bit PCM expanded from secondary
//! memory, or AFC adaptive-delta blocks decoded from secondary memory.
//! All three paths honor the voice's loop window and deactivate the voice
//! on non-looping exhaustion.
//!
//! AFC streams decode in fixed 16-sample blocks, so a request rarely lands
//! on a block boundary; decoded samples beyond the request are cached in
//! the voice parameter block and drained first on the next call. The
//! predictor history also lives in the VPB, and is re-seeded from the
//! per-loop-point snapshot on wrap so every pass over the loop decodes
//! identically.

use super::vpb::{SampleFormat, Vpb, VpbFlags};
use super::AudioRenderer;
use crate::memory::DspMemory;

/// Samples per AFC block.
const AFC_BLOCK_SAMPLES: u32 = 16;

/// Bytes per AFC block: one header byte plus 16 packed 4-bit deltas.
const AFC_BLOCK_BYTES: u32 = 9;

/// Loop end of 0 means the host never bounded the stream.
fn effective_end(vpb: &Vpb) -> u32 {
    if vpb.loop_end == 0 {
        u32::MAX
    } else {
        vpb.loop_end
    }
}

/// Whether the voice can wrap instead of stopping at `end`.
fn can_loop(vpb: &Vpb, end: u32) -> bool {
    vpb.flags().contains(VpbFlags::LOOP) && vpb.loop_start < end
}

impl AudioRenderer {
    /// Fill `raw[4..4 + count]` with the voice's next `count` raw samples.
    ///
    /// The first four entries of `raw` are the caller-provided filter
    /// context and are left untouched.
    pub(crate) fn load_input_samples<M: DspMemory>(
        &self,
        mem: &M,
        vpb: &mut Vpb,
        format: SampleFormat,
        count: usize,
        raw: &mut [i16],
    ) {
        let dst = &mut raw[4..4 + count];
        match format {
            SampleFormat::Pcm16 => Self::download_pcm16_samples(mem, vpb, dst),
            SampleFormat::Pcm8 => Self::download_pcm8_samples(mem, vpb, dst),
            SampleFormat::Afc => self.download_afc_samples(mem, vpb, dst),
        }
    }

    /// Copy signed 16-bit samples from primary memory.
    ///
    /// Non-looping exhaustion repeats the last fetched sample, so a stream
    /// that ends exactly at its final value stays gapless while the volume
    /// ramps out.
    fn download_pcm16_samples<M: DspMemory>(mem: &M, vpb: &mut Vpb, dst: &mut [i16]) {
        let end = effective_end(vpb);
        let mut last = vpb.resample_hist[3];
        let mut finished = false;

        for out in dst.iter_mut() {
            if !finished && vpb.current_position >= end {
                if can_loop(vpb, end) {
                    vpb.current_position = vpb.loop_start;
                } else {
                    finished = true;
                    vpb.deactivate();
                }
            }
            if finished {
                *out = last;
                continue;
            }

            let addr = vpb.sample_base_addr.wrapping_add(vpb.current_position.wrapping_mul(2));
            last = mem.read_ram_i16(addr);
            *out = last;
            vpb.current_position += 1;
        }
    }

    /// Expand signed 8-bit samples from secondary memory to 16 bits.
    /// Non-looping exhaustion pads with silence.
    fn download_pcm8_samples<M: DspMemory>(mem: &M, vpb: &mut Vpb, dst: &mut [i16]) {
        let end = effective_end(vpb);
        let mut finished = false;

        for out in dst.iter_mut() {
            if !finished && vpb.current_position >= end {
                if can_loop(vpb, end) {
                    vpb.current_position = vpb.loop_start;
                } else {
                    finished = true;
                    vpb.deactivate();
                }
            }
            if finished {
                *out = 0;
                continue;
            }

            let addr = vpb.sample_base_addr.wrapping_add(vpb.current_position);
            *out = ((mem.read_aram_u8(addr) as i8) as i16) << 8;
            vpb.current_position += 1;
        }
    }

    /// Decode AFC blocks from secondary memory.
    fn download_afc_samples<M: DspMemory>(&self, mem: &M, vpb: &mut Vpb, dst: &mut [i16]) {
        let mut written = 0;

        // Drain samples decoded past the end of the previous request.
        let carried = (vpb.afc_leftover_count as usize).min(dst.len());
        if carried > 0 {
            dst[..carried].copy_from_slice(&vpb.afc_leftover[..carried]);
            vpb.afc_leftover.copy_within(carried.., 0);
            vpb.afc_leftover_count -= carried as u16;
            written += carried;
        }

        while written < dst.len() {
            let end = effective_end(vpb);
            if vpb.current_position >= end {
                if can_loop(vpb, end) {
                    // Restart the predictor from the loop snapshot so the
                    // loop body decodes the same on every pass.
                    vpb.current_position = vpb.loop_start;
                    vpb.yn1 = vpb.loop_yn1;
                    vpb.yn2 = vpb.loop_yn2;
                } else {
                    vpb.deactivate();
                    for out in dst[written..].iter_mut() {
                        *out = 0;
                    }
                    return;
                }
            }

            let block_index = vpb.current_position / AFC_BLOCK_SAMPLES;
            let skip = (vpb.current_position % AFC_BLOCK_SAMPLES) as usize;
            let addr = vpb
                .sample_base_addr
                .wrapping_add(block_index * AFC_BLOCK_BYTES);
            let decoded = self.decode_afc_block(mem, addr, vpb);

            // Deliverable part of this block: after any discard for a
            // non-aligned entry point, clipped at the loop/stream end.
            let avail = (AFC_BLOCK_SAMPLES as usize - skip)
                .min((end - vpb.current_position) as usize);
            let take = avail.min(dst.len() - written);
            dst[written..written + take].copy_from_slice(&decoded[skip..skip + take]);
            written += take;

            // Anything decoded but not delivered is carried to next call.
            let spill = avail - take;
            vpb.afc_leftover[..spill].copy_from_slice(&decoded[skip + take..skip + avail]);
            vpb.afc_leftover_count = spill as u16;

            vpb.current_position += avail as u32;
        }
    }

    /// Decode one 9-byte AFC block into 16 samples, advancing the
    /// predictor history in the VPB.
    ///
    /// Header byte: scale exponent in the high nibble, coefficient-pair
    /// index in the low nibble. Each 4-bit delta is sign-extended,
    /// pre-shifted by 11, scaled, combined with the two-sample history
    /// through the 5.11 coefficient pair and saturated.
    fn decode_afc_block<M: DspMemory>(&self, mem: &M, addr: u32, vpb: &mut Vpb) -> [i16; 16] {
        let header = mem.read_aram_u8(addr);
        let delta = 1i64 << (header >> 4);
        let idx = (header & 0x0F) as usize;
        vpb.coef_index = idx as u16;
        let coef0 = self.afc_coeffs[idx * 2] as i64;
        let coef1 = self.afc_coeffs[idx * 2 + 1] as i64;

        let mut out = [0i16; 16];
        for byte_index in 0..8 {
            let byte = mem.read_aram_u8(addr.wrapping_add(1 + byte_index as u32));
            for (half, nibble) in [byte >> 4, byte & 0x0F].into_iter().enumerate() {
                let mut n = nibble as i64;
                if n >= 8 {
                    n -= 16;
                }
                n <<= 11;

                let sample = (delta * n + coef0 * vpb.yn1 as i64 + coef1 * vpb.yn2 as i64) >> 11;
                let sample = sample.clamp(-0x8000, 0x7FFF) as i16;
                vpb.yn2 = vpb.yn1;
                vpb.yn1 = sample;
                out[byte_index * 2 + half] = sample;
            }
        }
        out
    }
}
