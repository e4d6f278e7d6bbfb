//! Line-oriented AT command transport for UART-attached cellular modems.
//!
//! This crate implements the half-duplex request/response layer that modem
//! drivers build on: a byte-driven parser that segments the inbound stream
//! into lines, tells command responses apart from unsolicited result codes
//! (URCs), and handles binary payloads and data prompts; and a channel that
//! serializes one command at a time against a background reader, bounded by
//! a timeout.
//!
//! The per-modem command suites (PDP context setup, socket opcodes, URC
//! dialects) are clients of this crate, not part of it.
//!
//! # Architecture
//!
//! [`AtChannel`] holds the shared state: the parser behind a blocking mutex,
//! a signal acting as the response semaphore, and the channel flags. It is
//! `const`-constructible so it can live in a `static`. [`AtChannel::split`]
//! hands back a [`Runner`] owning the receive half of the UART and a
//! [`Client`] owning the transmit half:
//!
//! ```ignore
//! static CALLBACKS: MyCallbacks = MyCallbacks::new();
//! static CHANNEL: AtChannel = AtChannel::new(&CALLBACKS);
//!
//! let (runner, mut client) = CHANNEL.split(uart_rx, uart_tx);
//! spawner.spawn(reader_task(runner))?; // runner.run().await
//!
//! CHANNEL.open();
//! client.set_timeout(10);
//! let rssi = client.command("AT+CSQ").await?;
//! ```
//!
//! All [`Client`] methods take `&mut self`: the channel supports exactly one
//! command in flight, and the borrow checker enforces the single-caller
//! contract that the underlying protocol requires.

#![cfg_attr(not(test), no_std)]

// This mod MUST go first, so that the others see its macros.
mod fmt;

mod channel;
mod error;
mod hex;
mod line;
mod parser;
mod scan;

#[cfg(test)]
mod test_helpers;

pub use channel::{AtChannel, Client, Runner};
pub use error::Error;
pub use parser::{Parser, ParserEvent, Response};
pub use scan::{AtCallbacks, CharacterHandler, LineScanner, NoCallbacks, ScanDecision};

/// Maximum transmitted command length, including the trailing `\r`.
pub const COMMAND_CAPACITY: usize = 80;

/// Maximum assembled line length. Well-behaved modems stay below this;
/// longer lines degrade to their most recent bytes.
pub const LINE_CAPACITY: usize = 79;

/// Response accumulator capacity, sized to the UART receive buffer of the
/// modems this crate targets.
pub const RESPONSE_CAPACITY: usize = 640;

/// Maximum data prompt length (`"> "`, `"@"` and friends).
pub const PROMPT_CAPACITY: usize = 8;

/// A single received line, as handed to URC handlers.
pub type Line = heapless::Vec<u8, LINE_CAPACITY>;
