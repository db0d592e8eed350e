use bytes::{Bytes, BytesMut};

use crate::protocol::error::{ProtocolError, Result};
use crate::protocol::message::{Message, Payload};

/// Accumulates the fragments of one logical message until all of them have arrived.
///
/// The slot vector is sized from the first fragment seen (which need not be index 0 -
/// UDP reorders freely). Entries live in the reassembly cache and are aged out by it, so
/// a message that never completes does not pin memory beyond the forget timeout.
pub(crate) struct Reassembly {
    /// header fields of the message under reconstruction, payload stripped
    template: Message,
    slots: Vec<Option<Bytes>>,
    missing: usize,
}

impl Reassembly {
    pub fn new(first: &Message) -> Reassembly {
        let total = first.fragments_total as usize;
        let mut template = first.clone();
        template.payload = Payload::None;

        Reassembly {
            template,
            slots: vec![None; total],
            missing: total,
        }
    }

    /// Store one fragment. A duplicate (e.g. from a retransmission whose ack got lost)
    ///  overwrites its slot silently - the bytes are expected to be identical.
    pub fn accept(&mut self, msg: &Message) -> Result<()> {
        let index = msg.fragment_index as usize;
        if index >= self.slots.len() {
            return Err(ProtocolError::InvalidMessage(format!(
                "fragment index {} out of range for {} expected fragments",
                index,
                self.slots.len()
            )));
        }
        let payload = msg.payload.as_encoded().cloned().ok_or_else(|| {
            ProtocolError::InvalidMessage("fragment without payload".into())
        })?;

        if self.slots[index].replace(payload).is_none() {
            self.missing -= 1;
        }
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.missing == 0
    }

    /// Concatenate the fragment payloads in index order into the reconstructed message.
    ///  Type, command, id, compression, encryption and session are inherited from the
    ///  fragment that opened the reassembly.
    pub fn assemble(self) -> Message {
        let len = self.slots.iter().flatten().map(|b| b.len()).sum();
        let mut payload = BytesMut::with_capacity(len);
        for slot in self.slots {
            let buf = slot.expect("assemble must only be called once all slots are filled");
            payload.extend_from_slice(&buf);
        }

        let mut msg = self.template;
        msg.payload = Payload::Encoded(payload.freeze());
        msg.reassembled = true;
        msg.fragmented = false;
        msg.fragment_index = 0;
        msg.fragments_total = 1;
        msg
    }
}
