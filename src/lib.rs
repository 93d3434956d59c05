//! DAC UCode HLE
//!
//! High-level emulation of the fixed-function audio microcode ("DAC UCode")
//! running on a game console's audio coprocessor. The host CPU talks to the
//! coprocessor through a mailbox: one 32-bit word at a time, interpreted
//! according to the coprocessor's current mode. The microcode mixes up to
//! hundreds of independently parameterized voices — each with its own sample
//! source, codec, resampling ratio, loop points and volume ramp — into a
//! small set of 80-sample buffers once per frame, then writes the result
//! back to host memory.
//!
//! # Features
//! - Mailbox protocol state machine (idle / buffering / executing / rendering)
//! - Circular 64-word command buffer with variable-arity commands
//! - Per-voice rendering: PCM16, PCM8 and AFC (adaptive-delta) sample sources
//! - 64-phase polyphase resampling to a fixed 80-sample frame
//! - Bit-exact fixed-point volume scaling and per-sample volume ramps
//! - Full raw-state save/restore for bit-identical resume
//!
//! # Quick start
//! ```
//! use dac_hle::{DacUCode, VecDspMemory};
//!
//! let mut mem = VecDspMemory::new(0x10000, 0x10000);
//! let mut ucode = DacUCode::new();
//!
//! // The instance announces readiness with a single mail word.
//! assert_eq!(ucode.pop_outgoing_mail(), Some(0xDCD1_0000));
//!
//! // Queue a one-word command batch: set the master output volume.
//! ucode.handle_mail(&mut mem, 0x8000_0001);
//! ucode.handle_mail(&mut mem, 0x8400_0000 | 0x7FFF);
//!
//! // The batch is acked with two mail words.
//! assert_eq!(ucode.pop_outgoing_mail(), Some(0xDCD1_0004));
//! assert_eq!(ucode.pop_outgoing_mail(), Some(0));
//! ```
//!
//! The host is expected to drive the instance cooperatively: deliver mail
//! with [`DacUCode::handle_mail`], tick it with [`DacUCode::update`] and
//! drain acknowledgments with [`DacUCode::pop_outgoing_mail`]. Nothing in
//! this crate blocks or spawns threads.

#![warn(missing_docs)]

// Domain modules
pub mod memory; // Host memory interface (primary RAM + sample RAM)
pub mod renderer; // Voice rendering engine
pub mod state; // Save-state stream writer/reader
pub mod ucode; // Mailbox protocol state machine

/// Error types for DAC UCode operations.
///
/// Protocol misuse by the emulated host (for example reading more command
/// words than were written) is recovered locally and logged, never surfaced
/// here; this enum only covers the fallible host-facing surfaces, which is
/// save-state restore today.
#[derive(thiserror::Error, Debug)]
pub enum DacHleError {
    /// IO error while reading a save-state stream
    #[error("save state error: {0}")]
    Io(#[from] std::io::Error),

    /// Save-state stream does not start with the expected magic
    #[error("save state has bad magic")]
    BadMagic,

    /// Save-state stream was produced by an incompatible version
    #[error("save state version mismatch: got {got}, expected {expected}")]
    StateVersion {
        /// Version found in the stream
        got: u32,
        /// Version this build understands
        expected: u32,
    },
}

/// Result type for DAC UCode operations
pub type Result<T> = std::result::Result<T, DacHleError>;

// Public API exports
pub use memory::{DspMemory, VecDspMemory};
pub use renderer::vpb::{SampleFormat, Vpb, VpbFlags};
pub use renderer::{AudioRenderer, MixingBuffer, MIXING_BUFFER_SIZE};
pub use state::{StateReader, StateWriter};
pub use ucode::{CommandAck, DacUCode, MailState};
