//! Circular command buffer
//!
//! Mail words buffered while the state machine is in command-writing mode
//! land here until execution is permitted. The queue tracks words and
//! logical commands separately: commands have variable arity, so the word
//! offsets alone cannot say how many commands are pending.
//!
//! Reading past the write offset is host protocol misuse; it is logged and
//! recovered with a zero sentinel rather than aborting, matching the
//! original microcode's behavior. Overflow is a bug condition and is not
//! modeled as recoverable.

use log::error;

use crate::state::{StateReader, StateWriter};

/// Capacity in 32-bit words.
pub const COMMAND_BUFFER_WORDS: usize = 64;

/// Circular queue of raw command words with a logical-command count.
#[derive(Debug, Clone)]
pub struct CommandBuffer {
    buffer: [u32; COMMAND_BUFFER_WORDS],
    read_offset: u32,
    write_offset: u32,
    pending_commands: u32,
}

impl Default for CommandBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self {
            buffer: [0; COMMAND_BUFFER_WORDS],
            read_offset: 0,
            write_offset: 0,
            pending_commands: 0,
        }
    }

    /// Append a 32-bit word, advancing the write offset.
    pub fn write32(&mut self, value: u32) {
        self.buffer[self.write_offset as usize] = value;
        self.write_offset = (self.write_offset + 1) % COMMAND_BUFFER_WORDS as u32;
    }

    /// Pop a 32-bit word, advancing the read offset.
    ///
    /// Reading with nothing buffered logs an error and returns 0 without
    /// advancing anything.
    pub fn read32(&mut self) -> u32 {
        if self.read_offset == self.write_offset {
            error!("reading too many command params");
            return 0;
        }

        let value = self.buffer[self.read_offset as usize];
        self.read_offset = (self.read_offset + 1) % COMMAND_BUFFER_WORDS as u32;
        value
    }

    /// Record that a complete command finished buffering.
    pub fn command_written(&mut self) {
        self.pending_commands += 1;
    }

    /// Record that one queued command was drained.
    pub fn command_consumed(&mut self) {
        self.pending_commands = self.pending_commands.saturating_sub(1);
    }

    /// Number of complete commands waiting to execute.
    pub fn pending_commands(&self) -> u32 {
        self.pending_commands
    }

    /// Whether any buffered words remain unread.
    pub fn has_unread_words(&self) -> bool {
        self.read_offset != self.write_offset
    }

    /// Flush the queue's raw state into a save-state stream.
    pub fn save_state(&self, w: &mut StateWriter) {
        w.write_u32_slice(&self.buffer);
        w.write_u32(self.read_offset);
        w.write_u32(self.write_offset);
        w.write_u32(self.pending_commands);
    }

    /// Restore the queue's raw state from a save-state stream.
    pub fn load_state(&mut self, r: &mut StateReader<'_>) -> std::io::Result<()> {
        r.read_u32_slice(&mut self.buffer)?;
        self.read_offset = r.read_u32()? % COMMAND_BUFFER_WORDS as u32;
        self.write_offset = r.read_u32()? % COMMAND_BUFFER_WORDS as u32;
        self.pending_commands = r.read_u32()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_three_words_round_trip_in_order() {
        let mut queue = CommandBuffer::new();
        queue.write32(0x11);
        queue.write32(0x22);
        queue.write32(0x33);

        assert_eq!(queue.read32(), 0x11);
        assert_eq!(queue.read32(), 0x22);
        assert_eq!(queue.read32(), 0x33);

        // A fourth read is misuse: zero sentinel, no state change.
        assert_eq!(queue.read32(), 0);
        assert!(!queue.has_unread_words());
        queue.write32(0x44);
        assert_eq!(queue.read32(), 0x44);
    }

    #[test]
    fn test_offsets_wrap_around_capacity() {
        let mut queue = CommandBuffer::new();
        // Walk the offsets most of the way around.
        for i in 0..COMMAND_BUFFER_WORDS as u32 - 2 {
            queue.write32(i);
            assert_eq!(queue.read32(), i);
        }
        // A run crossing the wrap point still reads back in order.
        for i in 100..105 {
            queue.write32(i);
        }
        for i in 100..105 {
            assert_eq!(queue.read32(), i);
        }
    }

    #[test]
    fn test_pending_command_accounting() {
        let mut queue = CommandBuffer::new();
        assert_eq!(queue.pending_commands(), 0);
        queue.command_written();
        queue.command_written();
        assert_eq!(queue.pending_commands(), 2);
        queue.command_consumed();
        assert_eq!(queue.pending_commands(), 1);
        queue.command_consumed();
        queue.command_consumed();
        assert_eq!(queue.pending_commands(), 0);
    }

    #[test]
    fn test_state_round_trip() {
        let mut queue = CommandBuffer::new();
        queue.write32(0xAAAA);
        queue.write32(0xBBBB);
        queue.command_written();
        assert_eq!(queue.read32(), 0xAAAA);

        let mut w = StateWriter::new();
        queue.save_state(&mut w);
        let bytes = w.into_bytes();

        let mut restored = CommandBuffer::new();
        restored.load_state(&mut StateReader::new(&bytes)).unwrap();
        assert_eq!(restored.pending_commands(), 1);
        assert_eq!(restored.read32(), 0xBBBB);
        assert!(!restored.has_unread_words());
    }
}
