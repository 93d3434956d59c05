//! End-to-end rendering tests: mail protocol in, mixed samples in host
//! memory out, with the fixed-point arithmetic checked against hand
//! computed values.

use dac_hle::ucode::{MAIL_ACK_DONE_RENDERING, MAIL_READY};
use dac_hle::{DacUCode, DspMemory, SampleFormat, VecDspMemory, Vpb};

const VPB_BASE: u32 = 0x1000;
const SAMPLES_ADDR: u32 = 0x2000;
const LBUF_ADDR: u32 = 0x6000;
const RBUF_ADDR: u32 = 0x6200;

fn drain(ucode: &mut DacUCode) -> Vec<u32> {
    let mut mails = Vec::new();
    while let Some(mail) = ucode.pop_outgoing_mail() {
        mails.push(mail);
    }
    mails
}

/// Filter bank whose every phase passes tap 3 through at 0x7FFF (one LSB
/// below unity), making the data path easy to follow by hand.
fn passthrough_coeffs() -> [i16; 0x100] {
    let mut coeffs = [0i16; 0x100];
    for phase in 0..0x40 {
        coeffs[phase * 4 + 3] = 0x7FFF;
    }
    coeffs
}

fn new_ucode() -> DacUCode {
    let mut ucode = DacUCode::new();
    assert_eq!(drain(&mut ucode), vec![MAIL_READY]);
    let renderer = ucode.renderer_mut();
    renderer.set_resampling_coeffs(passthrough_coeffs());
    renderer.set_vpb_base_addr(VPB_BASE);
    renderer.set_output_volume(0x8000); // unity
    renderer.set_output_left_buffer_addr(LBUF_ADDR);
    renderer.set_output_right_buffer_addr(RBUF_ADDR);
    ucode
}

/// Start rendering one frame of `voices` voices and release them all.
fn render_one_frame(ucode: &mut DacUCode, mem: &mut VecDspMemory, voices: u32) {
    ucode.handle_mail(mem, 0x8101_0000 | voices);
    ucode.handle_mail(mem, 0x8800_0000);
    assert_eq!(drain(ucode), vec![MAIL_ACK_DONE_RENDERING, 0]);
}

#[test]
fn pcm16_constant_stream_mixes_to_expected_levels() {
    let mut mem = VecDspMemory::new(0x10000, 0x10000);
    mem.load_ram_words(SAMPLES_ADDR, &[0x1000; 0x200]);

    let mut ucode = new_ucode();
    let vpb = Vpb {
        state: 1,
        format: SampleFormat::Pcm16 as u16,
        sample_base_addr: SAMPLES_ADDR,
        loop_end: 0x200,
        resampling_ratio: 0x1000, // 1.0
        volume: 0x8000,           // unity
        target_volume: 0x8000,
        channel_gains: [0x7FFF, 0, 0, 0],
        ..Vpb::default()
    };
    ucode.renderer().store_vpb(&mut mem, 0, &vpb);

    render_one_frame(&mut ucode, &mut mem, 1);

    // Raw 0x1000 through the 0x7FFF tap: (0x1000 * 0x7FFF) >> 15 = 0xFFF.
    // Effective gain (0x8000 * 0x7FFF) >> 15 = 0x7FFF, contribution
    // (0x7FFF * 0xFFF) >> 16 = 2047, unity master volume keeps it.
    // Sample 0 sees only the zeroed filter history.
    assert_eq!(mem.read_ram_i16(LBUF_ADDR), 0);
    for i in 1..0x50 {
        assert_eq!(mem.read_ram_i16(LBUF_ADDR + i * 2), 2047, "sample {i}");
    }
    // Nothing routed to the right channel.
    for i in 0..0x50 {
        assert_eq!(mem.read_ram_i16(RBUF_ADDR + i * 2), 0);
    }

    let stored = ucode.renderer().fetch_vpb(&mem, 0);
    assert_eq!(stored.current_position, 0x50);
    assert_eq!(stored.current_pos_frac, 0);
}

#[test]
fn pcm8_half_ratio_voice_consumes_half_the_stream() {
    let mut mem = VecDspMemory::new(0x10000, 0x10000);
    mem.load_aram(SAMPLES_ADDR, &[0x10; 0x100]);

    let mut ucode = new_ucode();
    let vpb = Vpb {
        state: 1,
        format: SampleFormat::Pcm8 as u16,
        sample_base_addr: SAMPLES_ADDR,
        loop_end: 0x100,
        resampling_ratio: 0x0800, // 0.5
        volume: 0x8000,
        target_volume: 0x8000,
        channel_gains: [0x7FFF, 0x7FFF, 0, 0],
        ..Vpb::default()
    };
    ucode.renderer().store_vpb(&mut mem, 0, &vpb);

    render_one_frame(&mut ucode, &mut mem, 1);

    // 0x10 expands to 0x1000; the first two output samples still read the
    // zeroed filter history (integer position advances every 2nd sample).
    assert_eq!(mem.read_ram_i16(LBUF_ADDR), 0);
    assert_eq!(mem.read_ram_i16(LBUF_ADDR + 2), 0);
    for i in 2..0x50 {
        assert_eq!(mem.read_ram_i16(LBUF_ADDR + i * 2), 2047, "sample {i}");
        assert_eq!(mem.read_ram_i16(RBUF_ADDR + i * 2), 2047, "sample {i}");
    }

    // 80 output samples at ratio 0.5 consume 40 raw samples.
    let stored = ucode.renderer().fetch_vpb(&mem, 0);
    assert_eq!(stored.current_position, 40);
}

#[test]
fn afc_voice_renders_through_the_full_pipeline() {
    let mut mem = VecDspMemory::new(0x10000, 0x10000);

    // Six blocks of constant deltas: nibble 1 at scale 10 decodes to 1024
    // with a zero predictor.
    let mut block = [0u8; 9];
    block[0] = 10 << 4;
    for b in block[1..].iter_mut() {
        *b = 0x11;
    }
    for i in 0..6 {
        mem.load_aram(SAMPLES_ADDR + i * 9, &block);
    }

    let mut ucode = new_ucode();
    let vpb = Vpb {
        state: 1,
        format: SampleFormat::Afc as u16,
        sample_base_addr: SAMPLES_ADDR,
        loop_end: 96,
        resampling_ratio: 0x1000,
        volume: 0x8000,
        target_volume: 0x8000,
        channel_gains: [0x7FFF, 0, 0, 0],
        ..Vpb::default()
    };
    ucode.renderer().store_vpb(&mut mem, 0, &vpb);

    render_one_frame(&mut ucode, &mut mem, 1);

    // 1024 through the tap: 1023; through the gain: 511.
    assert_eq!(mem.read_ram_i16(LBUF_ADDR), 0);
    for i in 1..0x50 {
        assert_eq!(mem.read_ram_i16(LBUF_ADDR + i * 2), 511, "sample {i}");
    }

    // 80 samples is an exact block multiple: no leftover carried.
    let stored = ucode.renderer().fetch_vpb(&mem, 0);
    assert!(stored.is_active());
    assert_eq!(stored.current_position, 80);
    assert_eq!(stored.afc_leftover_count, 0);
}

#[test]
fn volume_ramp_rises_across_the_frame() {
    let mut mem = VecDspMemory::new(0x10000, 0x10000);
    mem.load_ram_words(SAMPLES_ADDR, &[0x2000; 0x200]);

    let mut ucode = new_ucode();
    let vpb = Vpb {
        state: 1,
        format: SampleFormat::Pcm16 as u16,
        sample_base_addr: SAMPLES_ADDR,
        loop_end: 0x200,
        resampling_ratio: 0x1000,
        volume: 0,
        target_volume: 0x8000,
        channel_gains: [0x7FFF, 0, 0, 0],
        ..Vpb::default()
    };
    ucode.renderer().store_vpb(&mut mem, 0, &vpb);

    render_one_frame(&mut ucode, &mut mem, 1);

    // Ramping from silence to unity: strictly non-decreasing output, with
    // a silent start and an audible end.
    let mut prev = mem.read_ram_i16(LBUF_ADDR);
    assert_eq!(prev, 0);
    for i in 1..0x50 {
        let cur = mem.read_ram_i16(LBUF_ADDR + i * 2);
        assert!(cur >= prev, "sample {i} regressed: {cur} < {prev}");
        prev = cur;
    }
    assert!(prev > 3000);

    // The ramp lands on its target for the next frame.
    assert_eq!(ucode.renderer().fetch_vpb(&mem, 0).volume, 0x8000);
}

#[test]
fn looping_voice_crosses_the_boundary_seamlessly() {
    let mut mem = VecDspMemory::new(0x10000, 0x10000);
    // A 64-sample loop of a recognizable staircase.
    let stream: Vec<i16> = (0..64).map(|i| (i as i16) * 100).collect();
    mem.load_ram_words(SAMPLES_ADDR, &stream);

    let mut ucode = new_ucode();
    let vpb = Vpb {
        state: 1,
        format: SampleFormat::Pcm16 as u16,
        flags: dac_hle::VpbFlags::LOOP.bits(),
        sample_base_addr: SAMPLES_ADDR,
        loop_start: 0,
        loop_end: 64,
        resampling_ratio: 0x1000,
        volume: 0x8000,
        target_volume: 0x8000,
        channel_gains: [0x7FFF, 0, 0, 0],
        ..Vpb::default()
    };
    ucode.renderer().store_vpb(&mut mem, 0, &vpb);

    render_one_frame(&mut ucode, &mut mem, 1);

    // After 80 samples through a 64-sample loop the position wrapped to 16.
    let stored = ucode.renderer().fetch_vpb(&mem, 0);
    assert!(stored.is_active());
    assert_eq!(stored.current_position, 16);

    // The wrapped region replays the loop start: output samples 64 + n
    // carry the same values as output samples n (both read stream[n - 1]
    // through the tap and the identical gain chain).
    for n in 1..8u32 {
        let first = mem.read_ram_i16(LBUF_ADDR + n * 2);
        let wrapped = mem.read_ram_i16(LBUF_ADDR + (64 + n) * 2);
        assert_eq!(first, wrapped, "sample {n}");
        if n > 1 {
            assert_ne!(first, 0);
        }
    }
}
