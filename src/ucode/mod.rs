//! Mailbox protocol state machine
//!
//! The original microcode is interrupt driven: mail arrival preempts
//! whatever the DSP is doing, and long-running work (audio rendering) is
//! resumed between interrupts. This implementation rewrites that control
//! flow as an explicit state machine with two entry points — feed one mail
//! word, or tick once — which keeps the emulation deterministic and makes
//! save states exact.
//!
//! Incoming words are interpreted according to the current state: in
//! [`MailState::Waiting`] they start command batches, start rendering,
//! update voice synchronization or halt the instance; in
//! [`MailState::WritingCommand`] they fill the circular command buffer; in
//! [`MailState::Rendering`] they release further voices for the frame in
//! progress. Acknowledgments go out as mail pairs through an internal
//! queue the host drains.

pub mod command_buffer;

use std::collections::VecDeque;
use std::io;

use log::{debug, error, warn};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

use crate::memory::DspMemory;
use crate::renderer::AudioRenderer;
use crate::state::{StateReader, StateWriter};
use crate::{DacHleError, Result};
use command_buffer::CommandBuffer;

/// Mail word queued at construction to announce the microcode is ready.
pub const MAIL_READY: u32 = 0xDCD1_0000;

/// First ack word for a routine command-batch completion.
pub const MAIL_ACK_STANDARD: u32 = 0xDCD1_0004;

/// First ack word when a rendering request has been fully satisfied.
pub const MAIL_ACK_DONE_RENDERING: u32 = 0xDCD1_0005;

/// Upper bound on addressable voices, and on the skip-bitfield array.
const MAX_VOICES: u32 = 0x100;

// High-byte mail prefixes understood while waiting.
const PREFIX_COMMAND_BATCH: u32 = 0x80;
const PREFIX_START_RENDERING: u32 = 0x81;
const PREFIX_SYNC: u32 = 0x88;
const PREFIX_HALT: u32 = 0xFF;

/// Save-state stream magic.
const STATE_MAGIC: &[u8; 4] = b"DACS";

/// Save-state stream version.
const STATE_VERSION: u32 = 1;

/// Modes of the mail state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u32)]
pub enum MailState {
    /// Ready for the next word.
    Waiting = 0,
    /// A rendering request is in progress; mail paces the voices.
    Rendering = 1,
    /// Buffering the words of a command batch.
    WritingCommand = 2,
    /// Terminal diagnostic sink; nothing is processed any more.
    Halted = 3,
}

/// Kinds of acknowledgment mail pairs sent back to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandAck {
    /// Routine command-batch completion.
    Standard,
    /// The rendering request is fully satisfied.
    DoneRendering,
}

/// Command opcodes carried in bits 24..31 of a command's first word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u32)]
enum CommandOpcode {
    Nop = 0x00,
    SetupTables = 0x01,
    StartRendering = 0x02,
    SetVpbBase = 0x03,
    SetOutputVolume = 0x04,
    SetOutputBuffers = 0x05,
}

/// The DAC UCode instance: mail state machine plus rendering engine.
///
/// The host delivers one 32-bit word at a time with [`handle_mail`], makes
/// progress with [`update`] and drains outgoing acknowledgment words with
/// [`pop_outgoing_mail`]. Everything runs synchronously on the caller's
/// thread.
///
/// [`handle_mail`]: DacUCode::handle_mail
/// [`update`]: DacUCode::update
/// [`pop_outgoing_mail`]: DacUCode::pop_outgoing_mail
#[derive(Debug, Clone)]
pub struct DacUCode {
    mail_state: MailState,

    /// Mail words still expected to complete the batch being written.
    expected_cmd_words: u32,

    /// Voices below this ceiling may be rendered; sync mail raises it in
    /// groups of 16.
    sync_max_voice_id: u32,

    /// Per-group 16-bit skip bitfields delivered by sync mail. A set bit
    /// (numbered from the top, bit 15 = first voice of the group) mutes
    /// that voice for the current frame.
    sync_voice_skip_flags: [u32; MAX_VOICES as usize],

    cmd_buffer: CommandBuffer,

    /// Command draining is suspended while a rendering request hijacks the
    /// mail flow.
    cmd_can_execute: bool,

    // Rendering flow control.
    rendering_requested_frames: u32,
    rendering_voices_per_frame: u16,
    rendering_curr_frame: u32,
    rendering_curr_voice: u32,

    /// Sync value echoed in the final done-rendering ack.
    rendering_sync_value: u16,

    /// Outgoing mail words, oldest first.
    mail_out: VecDeque<u32>,

    renderer: AudioRenderer,
}

impl Default for DacUCode {
    fn default() -> Self {
        Self::new()
    }
}

impl DacUCode {
    /// Create a fresh instance and queue the ready mail.
    pub fn new() -> Self {
        let mut ucode = Self {
            mail_state: MailState::Waiting,
            expected_cmd_words: 0,
            sync_max_voice_id: 0,
            sync_voice_skip_flags: [0; MAX_VOICES as usize],
            cmd_buffer: CommandBuffer::new(),
            cmd_can_execute: true,
            rendering_requested_frames: 0,
            rendering_voices_per_frame: 0,
            rendering_curr_frame: 0,
            rendering_curr_voice: 0,
            rendering_sync_value: 0,
            mail_out: VecDeque::new(),
            renderer: AudioRenderer::new(),
        };
        ucode.mail_out.push_back(MAIL_READY);
        ucode
    }

    /// Current protocol state.
    pub fn mail_state(&self) -> MailState {
        self.mail_state
    }

    /// Whether a rendering request is still being worked on.
    pub fn rendering_in_progress(&self) -> bool {
        self.rendering_curr_frame != self.rendering_requested_frames
    }

    /// Shared access to the rendering engine.
    pub fn renderer(&self) -> &AudioRenderer {
        &self.renderer
    }

    /// Mutable access to the rendering engine, for the hosting framework's
    /// configuration setters.
    pub fn renderer_mut(&mut self) -> &mut AudioRenderer {
        &mut self.renderer
    }

    /// Pop the oldest outgoing mail word, if any.
    pub fn pop_outgoing_mail(&mut self) -> Option<u32> {
        self.mail_out.pop_front()
    }

    /// Deliver one incoming 32-bit mail word.
    pub fn handle_mail<M: DspMemory>(&mut self, mem: &mut M, mail: u32) {
        match self.mail_state {
            MailState::Waiting => self.handle_mail_waiting(mem, mail),
            MailState::WritingCommand => {
                self.cmd_buffer.write32(mail);
                self.expected_cmd_words -= 1;
                if self.expected_cmd_words == 0 {
                    self.cmd_buffer.command_written();
                    self.set_mail_state(MailState::Waiting);
                    self.run_pending_commands(mem);
                }
            }
            MailState::Rendering => {
                self.apply_sync_mail(mail);
                self.render_audio(mem);
            }
            MailState::Halted => {
                warn!("mail {mail:#010x} while halted, ignored");
            }
        }
    }

    /// Make progress without new mail: advance rendering or drain queued
    /// commands, whichever the current state allows.
    pub fn update<M: DspMemory>(&mut self, mem: &mut M) {
        match self.mail_state {
            MailState::Rendering => self.render_audio(mem),
            MailState::Waiting => self.run_pending_commands(mem),
            _ => {}
        }
    }

    fn handle_mail_waiting<M: DspMemory>(&mut self, mem: &mut M, mail: u32) {
        match mail >> 24 {
            PREFIX_COMMAND_BATCH => {
                let count = mail & 0xFFFF;
                if count == 0 {
                    warn!("command batch header without any words");
                } else {
                    self.expected_cmd_words = count;
                    self.set_mail_state(MailState::WritingCommand);
                }
            }
            PREFIX_START_RENDERING => {
                let frames = (mail >> 16) & 0xFF;
                let voices = mail & 0xFFFF;
                self.start_rendering(frames, voices, 0);
                self.render_audio(mem);
            }
            PREFIX_SYNC => {
                // Stored now, consumed once rendering starts.
                self.apply_sync_mail(mail);
            }
            PREFIX_HALT => {
                warn!("host requested halt");
                self.set_mail_state(MailState::Halted);
            }
            prefix => {
                warn!("unhandled mail {mail:#010x} (prefix {prefix:#04x})");
            }
        }
    }

    /// Store a sync mail's skip bitfield and raise the voice ceiling by
    /// one 16-voice group.
    fn apply_sync_mail(&mut self, mail: u32) {
        let group = self.sync_max_voice_id >> 4;
        if group >= MAX_VOICES {
            warn!("sync mail past the last voice group, ignored");
            return;
        }
        self.sync_voice_skip_flags[group as usize] = mail & 0xFFFF;
        self.sync_max_voice_id += 0x10;
    }

    fn set_mail_state(&mut self, new_state: MailState) {
        debug!("mail state {:?} -> {:?}", self.mail_state, new_state);
        self.mail_state = new_state;
    }

    fn start_rendering(&mut self, frames: u32, voices_per_frame: u32, sync_value: u16) {
        if frames == 0 {
            warn!("rendering request for zero frames");
            self.send_command_ack(CommandAck::DoneRendering, sync_value);
            return;
        }
        let voices = voices_per_frame.min(MAX_VOICES);
        if voices != voices_per_frame {
            warn!("voices per frame clamped from {voices_per_frame} to {voices}");
        }

        debug!("start rendering: {frames} frames of {voices} voices");
        self.rendering_requested_frames = frames;
        self.rendering_voices_per_frame = voices as u16;
        self.rendering_curr_frame = 0;
        self.rendering_curr_voice = 0;
        self.rendering_sync_value = sync_value;
        self.cmd_can_execute = false;
        self.set_mail_state(MailState::Rendering);
    }

    /// Advance the current rendering request as far as voice
    /// synchronization allows.
    fn render_audio<M: DspMemory>(&mut self, mem: &mut M) {
        if self.mail_state != MailState::Rendering {
            return;
        }

        while self.rendering_in_progress() {
            while self.rendering_curr_voice < self.rendering_voices_per_frame as u32 {
                let voice = self.rendering_curr_voice;
                if voice >= self.sync_max_voice_id {
                    // Not released by the host yet; resume on the next
                    // sync mail or tick.
                    return;
                }

                if !self.renderer.is_prepared() {
                    self.renderer.prepare_frame();
                }

                let flags = self.sync_voice_skip_flags[(voice >> 4) as usize];
                let skipped = flags & (1 << (15 - (voice & 0xF))) != 0;
                if !skipped {
                    self.renderer.add_voice(mem, voice as u16);
                }
                self.rendering_curr_voice += 1;
            }

            // Frame complete; a frame with no released voices still
            // uploads cleared buffers.
            if !self.renderer.is_prepared() {
                self.renderer.prepare_frame();
            }
            self.renderer.finalize_frame(mem);

            self.rendering_curr_voice = 0;
            self.sync_max_voice_id = 0;
            self.sync_voice_skip_flags.fill(0);
            self.rendering_curr_frame += 1;

            if self.rendering_in_progress() {
                self.send_command_ack(CommandAck::Standard, (self.rendering_curr_frame - 1) as u16);
            } else {
                self.send_command_ack(CommandAck::DoneRendering, self.rendering_sync_value);
                self.set_mail_state(MailState::Waiting);
                self.cmd_can_execute = true;
                self.run_pending_commands(mem);
                return;
            }
        }
    }

    /// Drain queued commands until the buffer is empty or a rendering
    /// request hijacks the mail flow. May halt the instance on a malformed
    /// command.
    fn run_pending_commands<M: DspMemory>(&mut self, mem: &mut M) {
        if self.mail_state != MailState::Waiting || !self.cmd_can_execute {
            return;
        }

        let mut executed = 0u32;
        let mut last_sync = 0u16;

        while self.cmd_buffer.pending_commands() > 0 {
            let word = self.cmd_buffer.read32();
            self.cmd_buffer.command_consumed();

            if word & 0x8000_0000 == 0 {
                error!("malformed command word {word:#010x}, halting");
                self.set_mail_state(MailState::Halted);
                return;
            }
            let opcode = (word >> 24) & 0x7F;
            let sync = ((word >> 16) & 0xFF) as u16;
            let payload = word & 0xFFFF;

            match CommandOpcode::from_u32(opcode) {
                Some(CommandOpcode::Nop) => {
                    debug!("cmd nop");
                }
                Some(CommandOpcode::SetupTables) => {
                    let sine_addr = self.cmd_buffer.read32();
                    let resampling_addr = self.cmd_buffer.read32();
                    let afc_addr = self.cmd_buffer.read32();
                    debug!(
                        "cmd setup tables: sine {sine_addr:#010x}, \
                         resampling {resampling_addr:#010x}, afc {afc_addr:#010x}"
                    );
                    self.download_tables(mem, sine_addr, resampling_addr, afc_addr);
                }
                Some(CommandOpcode::StartRendering) => {
                    let frames = self.cmd_buffer.read32();
                    // Ack the setup commands executed ahead of the hijack.
                    if executed > 0 {
                        self.send_command_ack(CommandAck::Standard, last_sync);
                    }
                    self.start_rendering(frames, payload, sync);
                    self.render_audio(mem);
                    if self.mail_state != MailState::Waiting || !self.cmd_can_execute {
                        return;
                    }
                    // Rendering finished synchronously (or never started);
                    // keep draining, but a fresh ack run begins.
                    executed = 0;
                    last_sync = 0;
                    continue;
                }
                Some(CommandOpcode::SetVpbBase) => {
                    let addr = self.cmd_buffer.read32();
                    debug!("cmd set vpb base {addr:#010x}");
                    self.renderer.set_vpb_base_addr(addr);
                }
                Some(CommandOpcode::SetOutputVolume) => {
                    debug!("cmd set output volume {payload:#06x}");
                    self.renderer.set_output_volume(payload as u16);
                }
                Some(CommandOpcode::SetOutputBuffers) => {
                    let left = self.cmd_buffer.read32();
                    let right = self.cmd_buffer.read32();
                    debug!("cmd set output buffers {left:#010x} / {right:#010x}");
                    self.renderer.set_output_left_buffer_addr(left);
                    self.renderer.set_output_right_buffer_addr(right);
                }
                None if (0x06..=0x0D).contains(&opcode) => {
                    warn!("reserved command {opcode:#04x} ignored");
                }
                None => {
                    error!("unknown command {opcode:#04x}, halting");
                    self.set_mail_state(MailState::Halted);
                    return;
                }
            }

            executed += 1;
            last_sync = sync;
        }

        if executed > 0 {
            self.send_command_ack(CommandAck::Standard, last_sync);
        }
    }

    /// Download the three lookup tables from primary memory.
    fn download_tables<M: DspMemory>(
        &mut self,
        mem: &M,
        sine_addr: u32,
        resampling_addr: u32,
        afc_addr: u32,
    ) {
        let mut sine = [0i16; 0x80];
        for (i, entry) in sine.iter_mut().enumerate() {
            *entry = mem.read_ram_i16(sine_addr.wrapping_add(i as u32 * 2));
        }
        let mut resampling = [0i16; 0x100];
        for (i, entry) in resampling.iter_mut().enumerate() {
            *entry = mem.read_ram_i16(resampling_addr.wrapping_add(i as u32 * 2));
        }
        let mut afc = [0i16; 0x20];
        for (i, entry) in afc.iter_mut().enumerate() {
            *entry = mem.read_ram_i16(afc_addr.wrapping_add(i as u32 * 2));
        }
        self.renderer.set_sine_table(sine);
        self.renderer.set_resampling_coeffs(resampling);
        self.renderer.set_afc_coeffs(afc);
    }

    /// Queue the two-word acknowledgment mail pair.
    fn send_command_ack(&mut self, ack_type: CommandAck, sync_value: u16) {
        let first = match ack_type {
            CommandAck::Standard => MAIL_ACK_STANDARD,
            CommandAck::DoneRendering => MAIL_ACK_DONE_RENDERING,
        };
        self.mail_out.push_back(first);
        self.mail_out.push_back(sync_value as u32);
    }

    /// Serialize the full instance state (protocol, command buffer,
    /// counters, mixing buffers, tables) into a byte vector.
    pub fn save_state(&self) -> Vec<u8> {
        let mut w = StateWriter::new();
        w.write_bytes(STATE_MAGIC);
        w.write_u32(STATE_VERSION);

        w.write_u32(self.mail_state as u32);
        w.write_u32(self.expected_cmd_words);
        w.write_u32(self.sync_max_voice_id);
        w.write_u32_slice(&self.sync_voice_skip_flags);
        self.cmd_buffer.save_state(&mut w);
        w.write_bool(self.cmd_can_execute);
        w.write_u32(self.rendering_requested_frames);
        w.write_u16(self.rendering_voices_per_frame);
        w.write_u32(self.rendering_curr_frame);
        w.write_u32(self.rendering_curr_voice);
        w.write_u16(self.rendering_sync_value);

        w.write_u32(self.mail_out.len() as u32);
        for &mail in &self.mail_out {
            w.write_u32(mail);
        }

        self.renderer.save_state(&mut w);
        w.into_bytes()
    }

    /// Restore an instance state produced by [`save_state`]. Subsequent
    /// output is bit-identical to the run the state was taken from.
    ///
    /// [`save_state`]: DacUCode::save_state
    pub fn load_state(&mut self, bytes: &[u8]) -> Result<()> {
        let mut r = StateReader::new(bytes);

        let mut magic = [0u8; 4];
        r.read_bytes(&mut magic)?;
        if &magic != STATE_MAGIC {
            return Err(DacHleError::BadMagic);
        }
        let version = r.read_u32()?;
        if version != STATE_VERSION {
            return Err(DacHleError::StateVersion { got: version, expected: STATE_VERSION });
        }

        let raw_state = r.read_u32()?;
        self.mail_state = MailState::from_u32(raw_state).ok_or_else(|| {
            DacHleError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid mail state {raw_state}"),
            ))
        })?;
        self.expected_cmd_words = r.read_u32()?;
        self.sync_max_voice_id = r.read_u32()?;
        r.read_u32_slice(&mut self.sync_voice_skip_flags)?;
        self.cmd_buffer.load_state(&mut r)?;
        self.cmd_can_execute = r.read_bool()?;
        self.rendering_requested_frames = r.read_u32()?;
        self.rendering_voices_per_frame = r.read_u16()?;
        self.rendering_curr_frame = r.read_u32()?;
        self.rendering_curr_voice = r.read_u32()?;
        self.rendering_sync_value = r.read_u16()?;

        let mail_count = r.read_u32()?;
        self.mail_out.clear();
        for _ in 0..mail_count {
            self.mail_out.push_back(r.read_u32()?);
        }

        self.renderer.load_state(&mut r)?;
        Ok(())
    }
}
