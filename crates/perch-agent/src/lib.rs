//! # perch-agent
//!
//! Device-side agent library: a resilient signaling connection to the hub,
//! tunneled-HTTP servicing against the local media control plane, and a
//! channel seam for the media layer. The `perch-agent` binary wires this up
//! with a logging media integration; real installs attach a producer that
//! consumes [`agent::SessionEvent`]s and answers through
//! [`agent::SignalSender`].

pub mod agent;
pub mod local;
