//! Text-chat relay: clients register a unique name over TCP and exchange
//! broadcast or whispered messages through one central process.
//!
//! - [`envelope`] defines the message union and its newline-delimited,
//!   versioned JSON framing.
//! - [`directory`] is the shared username-to-connection registry and the
//!   broadcast operation built on it.
//! - [`command`] interprets chat bodies (`Bye`, `/w`, `/a`).
//! - [`session`] runs one connection through registration, relaying and
//!   termination.
//! - [`relay`] accepts connections and stops once the directory drains.
//! - [`client`] is a terminal client; [`cli`] parses the command line.
//!
//! Integration tests drive a real [`relay::Relay`] over loopback TCP.

pub mod cli;
pub mod client;
pub mod command;
pub mod directory;
pub mod envelope;
pub mod relay;
pub mod session;
