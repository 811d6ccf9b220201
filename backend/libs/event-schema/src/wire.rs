// Protobuf layout of a change record on the bus:
//
//   message Event {
//     string domain = 1;
//     string title  = 2;
//     string user   = 3;
//   }

use prost::Message;

use crate::ChangeEvent;

#[derive(Clone, PartialEq, Message)]
pub(crate) struct EventMessage {
    #[prost(string, tag = "1")]
    pub domain: String,
    #[prost(string, tag = "2")]
    pub title: String,
    #[prost(string, tag = "3")]
    pub user: String,
}

pub(crate) fn encode(event: &ChangeEvent) -> Vec<u8> {
    EventMessage {
        domain: event.domain.clone(),
        title: event.title.clone(),
        user: event.user.clone(),
    }
    .encode_to_vec()
}

pub(crate) fn decode(bytes: &[u8]) -> Result<EventMessage, prost::DecodeError> {
    EventMessage::decode(bytes)
}
