use std::sync::Mutex;

use pdp17_core::constants::Word;

/// Command value meaning nothing is posted.
pub const CMD_NONE: Word = 0xFFFF;

/// Single-entry attention slot shared by the CPU thread and the device
/// threads. A post overwrites whatever is pending; there is no queue.
pub struct Mailbox {
    slot: Mutex<(usize, Word)>,
}

impl Mailbox {
    pub fn new() -> Mailbox {
        Mailbox {
            slot: Mutex::new((0, CMD_NONE)),
        }
    }

    /// Posts a command for a unit, replacing any unclaimed one.
    pub fn post(&self, unit: usize, cmd: Word) {
        let mut slot = self.slot.lock().unwrap();
        *slot = (unit, cmd);
    }

    /// Claims the pending command if it is addressed to `unit`, emptying
    /// the slot under the same lock so no other thread sees it.
    pub fn claim(&self, unit: usize) -> Option<Word> {
        let mut slot = self.slot.lock().unwrap();
        if slot.0 == unit && slot.1 != CMD_NONE {
            let cmd = slot.1;
            *slot = (0, CMD_NONE);
            Some(cmd)
        } else {
            None
        }
    }
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}
