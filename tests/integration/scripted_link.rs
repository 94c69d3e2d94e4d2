//! Scripted link fixture for integration tests.
//!
//! Plays the role of the chain transport: records every outbound frame so
//! tests can assert on the full conversation, and feeds back a pre-scripted
//! reply byte stream one byte per poll, the same pacing a UART ISR gives
//! the real driver.

use std::collections::VecDeque;

use tbms::LinkError;
use tbms::ports::LinkPort;

pub struct ScriptedLink {
    replies: VecDeque<u8>,
    /// Every frame the driver transmitted, in order.
    pub sent: Vec<Vec<u8>>,
}

impl Default for ScriptedLink {
    fn default() -> Self {
        Self::new()
    }
}

#[allow(dead_code)]
impl ScriptedLink {
    pub fn new() -> Self {
        Self {
            replies: VecDeque::new(),
            sent: Vec::new(),
        }
    }

    pub fn with_replies(replies: &[u8]) -> Self {
        let mut link = Self::new();
        link.queue(replies);
        link
    }

    /// Append bytes to the scripted reply stream.
    pub fn queue(&mut self, replies: &[u8]) {
        self.replies.extend(replies);
    }

    /// Bytes the driver has not consumed (should usually be zero at the end
    /// of a scenario).
    pub fn unconsumed(&self) -> usize {
        self.replies.len()
    }
}

impl LinkPort for ScriptedLink {
    fn write_frame(&mut self, frame: &[u8]) -> Result<(), LinkError> {
        self.sent.push(frame.to_vec());
        Ok(())
    }

    fn read_byte(&mut self) -> Result<Option<u8>, LinkError> {
        Ok(self.replies.pop_front())
    }
}
