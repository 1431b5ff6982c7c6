use crate::common::{
    clock::Timestamp,
    id::{MessageId, ProcessorId},
};

use super::view::Membership;

/*
    Three kinds of messages drive the protocol. A processor that wants to
    (re)form a group broadcasts new-group(V), where V is the time by which
    every correct processor must have seen it. Each processor that joins
    answers with present(V, members), and keeps sending present messages as
    its periodic heartbeat. Under the attendance-list policy liveness is
    instead checked by a single attendance-list token passed around the ring
    of members.
*/

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MessageKind {
    NewGroup,
    Present,
    AttendanceList,
}

#[derive(Clone, PartialEq, Debug)]
pub enum Payload {
    NewGroup {
        deadline: Timestamp,
    },
    Present {
        deadline: Timestamp,
        members: Membership,
    },
    AttendanceList {
        epoch: Timestamp,
    },
}

impl Payload {
    pub fn kind(&self) -> MessageKind {
        match self {
            Payload::NewGroup { .. } => MessageKind::NewGroup,
            Payload::Present { .. } => MessageKind::Present,
            Payload::AttendanceList { .. } => MessageKind::AttendanceList,
        }
    }
}

/// A message envelope. Identity is the channel-minted id.
#[derive(Clone, Debug)]
pub struct Message {
    id: MessageId,
    sender: ProcessorId,
    receiver: Option<ProcessorId>,
    payload: Payload,
}

impl Message {
    pub(crate) fn new(id: MessageId, sender: ProcessorId, payload: Payload) -> Self {
        Message {
            id,
            sender,
            receiver: None,
            payload,
        }
    }

    /// Addresses the message for unicast delivery.
    pub fn with_receiver(mut self, receiver: ProcessorId) -> Self {
        self.receiver = Some(receiver);
        self
    }

    /// Copy of a broadcast message addressed to one recipient.
    pub(crate) fn addressed_to(&self, receiver: ProcessorId) -> Self {
        self.clone().with_receiver(receiver)
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn sender(&self) -> ProcessorId {
        self.sender
    }

    pub fn receiver(&self) -> Option<ProcessorId> {
        self.receiver
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Message {}
