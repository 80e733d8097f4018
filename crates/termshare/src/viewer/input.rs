//! Local keystroke handling for the viewer.

/// What to do with one byte of local input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputAction {
    /// Send the byte to the host.
    Forward(u8),
    /// The exit gesture was completed; end the session.
    Escape,
}

/// Detects the escape byte pressed twice in a row.
///
/// The first press is forwarded like any other byte, so the escape key stays
/// usable inside the remote shell.
#[derive(Debug, Clone)]
pub struct EscapeDetector {
    escape: u8,
    previous: Option<u8>,
}

impl EscapeDetector {
    pub fn new(escape: u8) -> Self {
        Self {
            escape,
            previous: None,
        }
    }

    pub fn feed(&mut self, byte: u8) -> InputAction {
        if byte == self.escape && self.previous == Some(self.escape) {
            self.previous = None;
            return InputAction::Escape;
        }
        self.previous = Some(byte);
        InputAction::Forward(byte)
    }
}

/// Human spelling of a control byte, e.g. `Ctrl-X` for 0x18.
pub fn key_name(byte: u8) -> String {
    match byte {
        0x00..=0x1f => format!("Ctrl-{}", (byte + 0x40) as char),
        0x7f => "Ctrl-?".to_string(),
        _ => format!("{:?}", byte as char),
    }
}
