//! Keyboard input decoding.

use super::command::Command;

/// What to do with one input byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputAction {
    /// Send the byte to the active session.
    Forward(u8),
    /// Run a command.
    Command(Command),
    /// The byte after the escape prefix has no binding.
    Unknown(u8),
}

/// Splits the input stream into forwarded bytes and commands.
///
/// The escape prefix arms command mode for exactly one following byte.
#[derive(Debug, Clone)]
pub struct InputDecoder {
    escape: u8,
    armed: bool,
}

impl InputDecoder {
    pub fn new(escape: u8) -> Self {
        Self {
            escape,
            armed: false,
        }
    }

    /// Returns the escape prefix.
    pub fn escape(&self) -> u8 {
        self.escape
    }

    /// Returns whether the next byte is a command.
    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Feeds one byte. Returns `None` when the byte was the escape prefix.
    pub fn feed(&mut self, byte: u8) -> Option<InputAction> {
        if self.armed {
            self.armed = false;
            return Some(match Command::from_byte(byte, self.escape) {
                Some(command) => InputAction::Command(command),
                None => InputAction::Unknown(byte),
            });
        }
        if byte == self.escape {
            self.armed = true;
            return None;
        }
        Some(InputAction::Forward(byte))
    }
}

/// Result of feeding a byte to a [`LineEditor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineEvent {
    /// Still editing; the bytes should be echoed.
    Echo(Vec<u8>),
    /// Enter was pressed.
    Submit(String),
    /// Escape, `^C` or `^D` on an empty line.
    Cancel,
}

/// Minimal line editor for the new-session prompt.
#[derive(Debug, Clone, Default)]
pub struct LineEditor {
    line: String,
}

impl LineEditor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one raw-mode byte.
    pub fn feed(&mut self, byte: u8) -> LineEvent {
        match byte {
            b'\r' | b'\n' => LineEvent::Submit(std::mem::take(&mut self.line)),
            0x1b | 0x03 => {
                self.line.clear();
                LineEvent::Cancel
            }
            0x04 if self.line.is_empty() => LineEvent::Cancel,
            0x08 | 0x7f => {
                if self.line.pop().is_some() {
                    LineEvent::Echo(b"\x08 \x08".to_vec())
                } else {
                    LineEvent::Echo(Vec::new())
                }
            }
            0x15 => {
                let erase = b"\x08 \x08".repeat(self.line.chars().count());
                self.line.clear();
                LineEvent::Echo(erase)
            }
            0x20..=0x7e => {
                self.line.push(char::from(byte));
                LineEvent::Echo(vec![byte])
            }
            _ => LineEvent::Echo(Vec::new()),
        }
    }
}
