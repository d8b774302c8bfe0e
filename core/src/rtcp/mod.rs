//! RTCP control plane: wire codec and participant logic.

pub mod participant;
pub mod wire;

pub use participant::{
    rtt_from_echo, ClockMap, Event, Participant, SendState, StreamTracker, REPORT_INTERVAL,
};
pub use wire::{
    Goodbye, ReceiverReport, ReceptionReport, RtcpPacket, SenderReport, SourceDescription,
};
