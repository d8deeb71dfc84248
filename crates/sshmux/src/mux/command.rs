//! Control-key commands.
//!
//! A command is the single byte typed after the escape prefix.

/// Default escape prefix, `^A`.
pub const ESCAPE_BYTE: u8 = 0x01;

/// A front-end command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Prompt for `[user@]host[:port]` and open a session.
    NewSession,
    /// Switch to the next session.
    Next,
    /// Switch to the previous session.
    Previous,
    /// Print the session list.
    List,
    /// Select the session at this list index.
    Select(usize),
    /// Close the active session.
    Close,
    /// Close every session and exit.
    Quit,
    /// Print the key bindings.
    Help,
    /// Send the escape byte itself to the active session.
    SendEscape,
}

impl Command {
    /// Maps the byte following the escape prefix to a command.
    pub fn from_byte(byte: u8, escape: u8) -> Option<Self> {
        if byte == escape {
            return Some(Command::SendEscape);
        }
        match byte {
            b'c' => Some(Command::NewSession),
            b'n' | b' ' => Some(Command::Next),
            b'p' | 0x08 | 0x7f => Some(Command::Previous),
            b'"' | b'w' => Some(Command::List),
            b'0'..=b'9' => Some(Command::Select(usize::from(byte - b'0'))),
            b'd' | b'k' => Some(Command::Close),
            b'q' | b'\\' => Some(Command::Quit),
            b'?' => Some(Command::Help),
            _ => None,
        }
    }
}

/// Parses `^X` notation (`^@` through `^_`, letters in either case).
pub fn parse_escape_key(key: &str) -> Option<u8> {
    let mut chars = key.chars();
    match (chars.next(), chars.next(), chars.next()) {
        (Some('^'), Some(c), None) => {
            let c = c.to_ascii_uppercase();
            if ('@'..='_').contains(&c) {
                Some(c as u8 - b'@')
            } else {
                None
            }
        }
        _ => None,
    }
}

/// Renders a control byte in `^X` notation.
pub fn describe_key(byte: u8) -> String {
    match byte {
        0x00..=0x1f => format!("^{}", char::from(byte + b'@')),
        0x7f => "^?".to_string(),
        _ => char::from(byte).to_string(),
    }
}

/// Key binding summary, one binding per line.
pub fn help_text(escape: u8) -> String {
    let esc = describe_key(escape);
    [
        format!("{esc} c        open a new session"),
        format!("{esc} n/space  next session"),
        format!("{esc} p/bksp   previous session"),
        format!("{esc} \"/w      list sessions"),
        format!("{esc} 0-9      select session by number"),
        format!("{esc} d/k      close the current session"),
        format!("{esc} q/\\      close all sessions and quit"),
        format!("{esc} {esc}       send a literal {esc}"),
        format!("{esc} ?        this help"),
    ]
    .join("\r\n")
}
