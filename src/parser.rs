//! Byte-driven response collection.
//!
//! The parser segments the inbound stream into lines, classifies each line
//! through the scanner chain (per-command scanner, then the channel-wide
//! scanner, then the built-in defaults) and accumulates everything that
//! belongs to the current command into the response buffer. Binary and
//! hex-framed payloads declared by a scanner are copied verbatim; data
//! prompts complete a response without waiting for a newline.
//!
//! Feeding never blocks and consumes one byte at a time, so the parser can
//! sit directly behind a UART receive loop.

use heapless::Vec;

use crate::hex;
use crate::line::LineBuffer;
use crate::scan::{default_scan, AtCallbacks, CharacterHandler, LineScanner, ScanDecision};
use crate::{Line, PROMPT_CAPACITY, RESPONSE_CAPACITY};

/// An owned, completed command response.
///
/// Holds every collected line separated by a single `\n`, without the
/// terminal line (`OK` or equivalent). Terminal error lines are preserved,
/// so `+CME ERROR: …` text is available for inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Response {
    buf: Vec<u8, RESPONSE_CAPACITY>,
}

impl Response {
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// The response as text. Fails for responses carrying binary payloads.
    pub fn as_str(&self) -> Result<&str, core::str::Utf8Error> {
        core::str::from_utf8(&self.buf)
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// An empty response means the command completed with a bare `OK`.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

impl AsRef<[u8]> for Response {
    fn as_ref(&self) -> &[u8] {
        &self.buf
    }
}

/// Emitted by [`Parser::feed_byte`] when a byte completes something.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParserEvent {
    /// The current command's response reached a terminal classification.
    Response(Response),
    /// A line classified as an unsolicited result code.
    Urc(Line),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Discarding input; URC lines are still recognized and dispatched.
    Idle,
    /// Collecting lines into the response buffer.
    Collecting,
    /// Copying a declared binary payload into the response buffer.
    RawData { remaining: usize, start: usize },
    /// Decoding a declared hex payload, two characters per byte.
    HexData {
        remaining: usize,
        start: usize,
        high: Option<u8>,
    },
}

pub struct Parser<'cb> {
    state: State,
    line: LineBuffer,
    response: Vec<u8, RESPONSE_CAPACITY>,
    response_dropped: u32,
    command_scanner: Option<LineScanner>,
    character_handler: Option<CharacterHandler>,
    prompt: Option<Vec<u8, PROMPT_CAPACITY>>,
    callbacks: &'cb dyn AtCallbacks,
}

impl<'cb> Parser<'cb> {
    pub const fn new(callbacks: &'cb dyn AtCallbacks) -> Self {
        Self {
            state: State::Idle,
            line: LineBuffer::new(),
            response: Vec::new(),
            response_dropped: 0,
            command_scanner: None,
            character_handler: None,
            prompt: None,
            callbacks,
        }
    }

    /// Arm the parser for the next command. Clears the response buffer and
    /// starts collecting; must be called before the command is transmitted.
    ///
    /// Re-arming while a payload read is in progress abandons the payload.
    pub fn await_response(&mut self) {
        if matches!(self.state, State::RawData { .. } | State::HexData { .. }) {
            warn!("re-armed with a payload read in progress, discarding it");
        }
        self.response.clear();
        self.state = State::Collecting;
    }

    /// Expect a data prompt (`"> "`, `"@"`) as the next command's response.
    /// Armed for one command only: cleared on match and on completion.
    pub fn expect_dataprompt(&mut self, prompt: &[u8]) {
        let mut p = Vec::new();
        let n = prompt.len().min(PROMPT_CAPACITY);
        let _ = p.extend_from_slice(&prompt[..n]);
        self.prompt = Some(p);
    }

    /// Install the line scanner for the next command.
    pub fn set_command_scanner(&mut self, scanner: LineScanner) {
        self.command_scanner = Some(scanner);
    }

    pub fn clear_command_scanner(&mut self) {
        self.command_scanner = None;
    }

    /// Install a per-byte rewriter, applied until cleared or reset.
    pub fn set_character_handler(&mut self, handler: CharacterHandler) {
        self.character_handler = Some(handler);
    }

    pub fn clear_character_handler(&mut self) {
        self.character_handler = None;
    }

    /// Abandon the current command: back to idle, per-command state cleared.
    ///
    /// The response buffer is left as-is; it is cleared when the next
    /// command arms the parser.
    pub fn reset(&mut self) {
        self.state = State::Idle;
        self.line.clear();
        self.command_scanner = None;
        self.character_handler = None;
        self.prompt = None;
    }

    /// Bytes lost to line head-drop and response truncation. A non-zero
    /// count indicates a stream the buffers were not sized for.
    pub fn overflow_count(&self) -> u32 {
        self.line.dropped().wrapping_add(self.response_dropped)
    }

    /// Feed a slice, handing each produced event to `sink`.
    pub fn feed(&mut self, bytes: &[u8], mut sink: impl FnMut(ParserEvent)) {
        for &byte in bytes {
            if let Some(event) = self.feed_byte(byte) {
                sink(event);
            }
        }
    }

    /// Feed a single byte. At most one event per byte.
    pub fn feed_byte(&mut self, byte: u8) -> Option<ParserEvent> {
        match self.state {
            State::Idle | State::Collecting => self.feed_line_byte(byte),
            State::RawData { remaining, start } => {
                self.push_response(byte);
                let remaining = remaining - 1;
                if remaining == 0 {
                    self.payload_complete(start)
                } else {
                    self.state = State::RawData { remaining, start };
                    None
                }
            }
            State::HexData {
                remaining,
                start,
                high,
            } => self.feed_hex_byte(byte, remaining, start, high),
        }
    }

    fn feed_line_byte(&mut self, byte: u8) -> Option<ParserEvent> {
        let byte = match self.character_handler {
            Some(handler) => match handler(byte, self.line.as_bytes()) {
                Some(b) => b,
                None => return None,
            },
            None => byte,
        };

        match byte {
            b'\r' => None,
            b'\n' => {
                if self.line.is_empty() {
                    return None;
                }
                let event = self.handle_line();
                self.line.clear();
                event
            }
            b => {
                self.line.push(b);
                let prompt_matched = self.state == State::Collecting
                    && match self.prompt {
                        Some(ref prompt) => self.line.as_bytes().starts_with(prompt),
                        None => false,
                    };
                if prompt_matched {
                    self.line.clear();
                    return self.complete();
                }
                None
            }
        }
    }

    fn feed_hex_byte(
        &mut self,
        byte: u8,
        remaining: usize,
        start: usize,
        high: Option<u8>,
    ) -> Option<ParserEvent> {
        // Modems wrap hex payloads in CR/LF; those are framing, not data.
        if byte == b'\r' || byte == b'\n' {
            return None;
        }
        let Some(value) = hex::nibble(byte) else {
            warn!("non-hex byte {} in hex payload", byte);
            return None;
        };
        match high {
            None => {
                self.state = State::HexData {
                    remaining,
                    start,
                    high: Some(value),
                };
                None
            }
            Some(h) => {
                self.push_response(h << 4 | value);
                let remaining = remaining - 1;
                if remaining == 0 {
                    self.payload_complete(start)
                } else {
                    self.state = State::HexData {
                        remaining,
                        start,
                        high: None,
                    };
                    None
                }
            }
        }
    }

    /// Classify and act on the line currently in the buffer. The caller
    /// clears the line buffer afterwards.
    fn handle_line(&mut self) -> Option<ParserEvent> {
        let Some(decision) = self.classify_line() else {
            trace!("discarding command echo");
            return None;
        };

        match self.state {
            State::Idle => {
                if decision == ScanDecision::Urc {
                    Some(ParserEvent::Urc(self.take_line()))
                } else {
                    None
                }
            }
            State::Collecting => match decision {
                ScanDecision::Urc => Some(ParserEvent::Urc(self.take_line())),
                ScanDecision::FinalOk => self.complete(),
                ScanDecision::Final => {
                    self.append_line();
                    self.complete()
                }
                ScanDecision::RawDataFollows(n) => {
                    self.begin_payload(n, false)
                }
                ScanDecision::HexDataFollows(n) => {
                    self.begin_payload(n, true)
                }
                // Unknown cannot come out of the chain; treat it like an
                // intermediate line if a scanner misbehaves.
                ScanDecision::Intermediate | ScanDecision::Unknown => {
                    self.append_line();
                    None
                }
            },
            // Lines are only handled in the two states above.
            State::RawData { .. } | State::HexData { .. } => None,
        }
    }

    /// Run the scanner chain over the current line. `None` means the line
    /// is the echo of the command we just transmitted and carries nothing.
    fn classify_line(&self) -> Option<ScanDecision> {
        let line = self.line.as_bytes();

        if let Some(scanner) = self.command_scanner {
            let decision = scanner(line);
            if decision != ScanDecision::Unknown {
                return Some(decision);
            }
        }
        let decision = self.callbacks.scan_line(line);
        if decision != ScanDecision::Unknown {
            return Some(decision);
        }
        if self.is_echo(line) {
            return None;
        }
        Some(default_scan(line))
    }

    /// With echo enabled, the modem repeats the command before answering.
    /// The repeat is the first line seen while collecting and starts with
    /// the command prefix; no AT response line does.
    fn is_echo(&self, line: &[u8]) -> bool {
        self.state == State::Collecting
            && self.response.is_empty()
            && (line.starts_with(b"AT") || line.starts_with(b"at"))
    }

    /// Record the header line and switch to payload copying. A declared
    /// length of zero completes immediately with an empty synthetic line.
    fn begin_payload(&mut self, len: usize, is_hex: bool) -> Option<ParserEvent> {
        self.append_line();
        self.push_response(b'\n');
        let start = self.response.len();
        if len == 0 {
            self.state = State::Collecting;
            return self.payload_complete(start);
        }
        self.state = if is_hex {
            State::HexData {
                remaining: len,
                start,
                high: None,
            }
        } else {
            State::RawData {
                remaining: len,
                start,
            }
        };
        None
    }

    /// A declared payload has been fully copied. The payload is offered to
    /// the installed scanners as a synthetic line so a per-command scanner
    /// can terminate on it; the built-in defaults are skipped, since binary
    /// data could accidentally spell `OK`.
    fn payload_complete(&mut self, start: usize) -> Option<ParserEvent> {
        self.state = State::Collecting;
        let decision = {
            let payload = &self.response[start.min(self.response.len())..];
            let mut d = ScanDecision::Unknown;
            if let Some(scanner) = self.command_scanner {
                d = scanner(payload);
            }
            if d == ScanDecision::Unknown {
                d = self.callbacks.scan_line(payload);
            }
            d
        };
        match decision {
            ScanDecision::Final | ScanDecision::FinalOk => self.complete(),
            _ => None,
        }
    }

    fn complete(&mut self) -> Option<ParserEvent> {
        self.state = State::Idle;
        self.prompt = None;
        Some(ParserEvent::Response(Response {
            buf: self.response.clone(),
        }))
    }

    fn take_line(&self) -> Line {
        Vec::from_slice(self.line.as_bytes()).unwrap_or_default()
    }

    fn append_line(&mut self) {
        if !self.response.is_empty() {
            self.push_response(b'\n');
        }
        for i in 0..self.line.as_bytes().len() {
            let byte = self.line.as_bytes()[i];
            self.push_response(byte);
        }
    }

    fn push_response(&mut self, byte: u8) {
        if self.response.push(byte).is_err() {
            self.response_dropped = self.response_dropped.wrapping_add(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::NoCallbacks;
    use crate::test_helpers::UrcRecorder;

    fn armed(callbacks: &dyn AtCallbacks) -> Parser<'_> {
        let mut parser = Parser::new(callbacks);
        parser.await_response();
        parser
    }

    /// Collect the response produced by feeding `bytes`, if any.
    fn feed_all(parser: &mut Parser<'_>, bytes: &[u8]) -> Option<Response> {
        let mut response = None;
        parser.feed(bytes, |event| {
            if let ParserEvent::Response(r) = event {
                response = Some(r);
            }
        });
        response
    }

    #[test]
    fn simple_ok_with_echo() {
        let mut parser = armed(&NoCallbacks);
        let response = feed_all(&mut parser, b"AT\r\r\nOK\r\n").unwrap();
        assert!(response.is_empty());
        assert_eq!(response.as_str().unwrap(), "");
    }

    #[test]
    fn query_and_value() {
        let mut parser = armed(&NoCallbacks);
        let response = feed_all(&mut parser, b"+CSQ: 14,0\r\nOK\r\n").unwrap();
        assert_eq!(response.as_bytes(), b"+CSQ: 14,0");
    }

    #[test]
    fn multiple_lines_joined_with_newline() {
        let mut parser = armed(&NoCallbacks);
        let response = feed_all(&mut parser, b"A\r\nB\nC\r\nOK\r\n").unwrap();
        assert_eq!(response.as_bytes(), b"A\nB\nC");
    }

    #[test]
    fn urc_during_response_does_not_terminate() {
        let recorder = UrcRecorder::recognizing(b"+CREG:");
        let mut parser = armed(&recorder);

        let mut urcs = vec![];
        parser.feed(b"+CREG: 1,1\r\n", |event| match event {
            ParserEvent::Urc(line) => urcs.push(line),
            ParserEvent::Response(_) => panic!("a URC must not terminate collection"),
        });
        assert_eq!(urcs.len(), 1);
        assert_eq!(&urcs[0][..], b"+CREG: 1,1");

        let response = feed_all(&mut parser, b"Quectel\r\nOK\r\n").unwrap();
        assert_eq!(response.as_bytes(), b"Quectel");
    }

    #[test]
    fn urc_in_idle_leaves_response_alone() {
        let recorder = UrcRecorder::recognizing(b"+CREG:");
        let mut parser = Parser::new(&recorder);

        let mut urcs = 0;
        parser.feed(b"+CREG: 5\r\nnoise\r\nOK\r\n", |event| match event {
            ParserEvent::Urc(_) => urcs += 1,
            ParserEvent::Response(_) => panic!("no command armed"),
        });
        assert_eq!(urcs, 1);
        assert!(parser.response.is_empty());
    }

    fn qird_scanner(line: &[u8]) -> ScanDecision {
        if line.starts_with(b"+QIRD:") {
            ScanDecision::RawDataFollows(5)
        } else {
            ScanDecision::Unknown
        }
    }

    #[test]
    fn raw_payload_follows_header() {
        let mut parser = armed(&NoCallbacks);
        parser.set_command_scanner(qird_scanner);

        assert!(feed_all(&mut parser, b"+QIRD: 1,TCP,5\r\n").is_none());
        assert!(feed_all(&mut parser, &[0x00, 0x01, 0xff, 0x7f, 0x80]).is_none());
        let response = feed_all(&mut parser, b"OK\r\n").unwrap();

        let mut expected = b"+QIRD: 1,TCP,5\n".to_vec();
        expected.extend_from_slice(&[0x00, 0x01, 0xff, 0x7f, 0x80]);
        assert_eq!(response.as_bytes(), &expected[..]);
    }

    fn qird_hex_scanner(line: &[u8]) -> ScanDecision {
        if line.starts_with(b"+QIRD:") {
            ScanDecision::HexDataFollows(4)
        } else {
            ScanDecision::Unknown
        }
    }

    #[test]
    fn hex_payload_is_decoded() {
        let mut parser = armed(&NoCallbacks);
        parser.set_command_scanner(qird_hex_scanner);

        assert!(feed_all(&mut parser, b"+QIRD: 4\r\nA1b2C3d4\r\n").is_none());
        let response = feed_all(&mut parser, b"OK\r\n").unwrap();

        let mut expected = b"+QIRD: 4\n".to_vec();
        expected.extend_from_slice(&[0xa1, 0xb2, 0xc3, 0xd4]);
        assert_eq!(response.as_bytes(), &expected[..]);
    }

    fn zero_len_scanner(line: &[u8]) -> ScanDecision {
        if line.starts_with(b"+QIRD:") {
            ScanDecision::HexDataFollows(0)
        } else if line.is_empty() {
            // The synthetic line for a zero-length payload.
            ScanDecision::Final
        } else {
            ScanDecision::Unknown
        }
    }

    #[test]
    fn zero_length_payload_is_legal() {
        let mut parser = armed(&NoCallbacks);
        parser.set_command_scanner(zero_len_scanner);

        let response = feed_all(&mut parser, b"+QIRD: 0\r\n").unwrap();
        assert_eq!(response.as_bytes(), b"+QIRD: 0\n");
    }

    #[test]
    fn data_prompt_completes_without_newline() {
        let mut parser = armed(&NoCallbacks);
        parser.expect_dataprompt(b"> ");

        let response = feed_all(&mut parser, b"> ").unwrap();
        assert!(response.is_empty());
    }

    #[test]
    fn prompt_expectation_does_not_survive_completion() {
        let mut parser = armed(&NoCallbacks);
        parser.expect_dataprompt(b"> ");

        // The modem refused with ERROR instead of prompting.
        let response = feed_all(&mut parser, b"ERROR\r\n").unwrap();
        assert_eq!(response.as_bytes(), b"ERROR");

        // Next command must not be completed by a stray "> ".
        parser.await_response();
        assert!(feed_all(&mut parser, b"> ").is_none());
    }

    #[test]
    fn error_text_is_preserved() {
        let mut parser = armed(&NoCallbacks);
        let response = feed_all(&mut parser, b"+CME ERROR: SIM busy\r\n").unwrap();
        assert_eq!(response.as_bytes(), b"+CME ERROR: SIM busy");
    }

    #[test]
    fn ok_is_terminal_even_with_a_scanner_installed() {
        fn never(_: &[u8]) -> ScanDecision {
            ScanDecision::Unknown
        }
        let mut parser = armed(&NoCallbacks);
        parser.set_command_scanner(never);
        let response = feed_all(&mut parser, b"OK\r\n").unwrap();
        assert!(response.is_empty());
    }

    fn shut_ok_scanner(line: &[u8]) -> ScanDecision {
        if line == b"SHUT OK" {
            ScanDecision::FinalOk
        } else {
            ScanDecision::Unknown
        }
    }

    #[test]
    fn command_scanner_wins_over_defaults() {
        let mut parser = armed(&NoCallbacks);
        parser.set_command_scanner(shut_ok_scanner);
        let response = feed_all(&mut parser, b"SHUT OK\r\n").unwrap();
        assert!(response.is_empty());
    }

    #[test]
    fn long_line_degrades_to_most_recent_bytes() {
        let mut parser = armed(&NoCallbacks);
        let mut input = vec![b'x'; 200];
        input[200 - crate::LINE_CAPACITY] = b'y'; // first surviving byte
        input.extend_from_slice(b"\r\nOK\r\n");

        let response = feed_all(&mut parser, &input).unwrap();
        assert_eq!(response.len(), crate::LINE_CAPACITY);
        assert_eq!(response.as_bytes()[0], b'y');
        assert_eq!(parser.overflow_count(), 200 - crate::LINE_CAPACITY as u32);
    }

    #[test]
    fn exact_capacity_line_is_preserved() {
        let mut parser = armed(&NoCallbacks);
        let mut input = vec![b'z'; crate::LINE_CAPACITY];
        input.extend_from_slice(b"\r\nOK\r\n");

        let response = feed_all(&mut parser, &input).unwrap();
        assert_eq!(response.len(), crate::LINE_CAPACITY);
        assert_eq!(parser.overflow_count(), 0);
    }

    fn colon_breaks_ipd(byte: u8, line: &[u8]) -> Option<u8> {
        if byte == b':' && line.starts_with(b"+IPD") {
            Some(b'\n')
        } else {
            Some(byte)
        }
    }

    #[test]
    fn character_handler_can_force_line_completion() {
        fn ipd_scanner(line: &[u8]) -> ScanDecision {
            if line.starts_with(b"+IPD") {
                ScanDecision::Final
            } else {
                ScanDecision::Unknown
            }
        }
        let mut parser = armed(&NoCallbacks);
        parser.set_character_handler(colon_breaks_ipd);
        parser.set_command_scanner(ipd_scanner);

        // No newline in the stream; the handler supplies one at ':'.
        let response = feed_all(&mut parser, b"+IPD,5:").unwrap();
        assert_eq!(response.as_bytes(), b"+IPD,5");
    }

    fn drop_nul(byte: u8, _line: &[u8]) -> Option<u8> {
        if byte == 0 {
            None
        } else {
            Some(byte)
        }
    }

    #[test]
    fn character_handler_can_drop_bytes() {
        let mut parser = armed(&NoCallbacks);
        parser.set_character_handler(drop_nul);
        let response = feed_all(&mut parser, b"A\0B\0C\r\nOK\r\n").unwrap();
        assert_eq!(response.as_bytes(), b"ABC");
    }

    #[test]
    fn rearm_discards_payload_in_progress() {
        let mut parser = armed(&NoCallbacks);
        parser.set_command_scanner(qird_scanner);

        assert!(feed_all(&mut parser, b"+QIRD: 1,TCP,5\r\n").is_none());
        assert!(feed_all(&mut parser, &[0xde, 0xad]).is_none());

        // Caller gave up and armed the next command.
        parser.await_response();
        parser.clear_command_scanner();
        let response = feed_all(&mut parser, b"OK\r\n").unwrap();
        assert!(response.is_empty());
    }

    #[test]
    fn reset_returns_to_idle_and_clears_transients() {
        let mut parser = armed(&NoCallbacks);
        parser.set_command_scanner(shut_ok_scanner);
        parser.expect_dataprompt(b"> ");
        parser.feed(b"partial line", |_| panic!("no event expected"));

        parser.reset();

        // Idle: a terminal line is discarded, not reported.
        assert!(feed_all(&mut parser, b"SHUT OK\r\nOK\r\n").is_none());

        // The transient scanner is gone: after re-arming, "SHUT OK" is an
        // ordinary intermediate line.
        parser.await_response();
        let response = feed_all(&mut parser, b"SHUT OK\r\nOK\r\n").unwrap();
        assert_eq!(response.as_bytes(), b"SHUT OK");
    }

    #[test]
    fn late_lines_after_completion_are_discarded() {
        let mut parser = armed(&NoCallbacks);
        assert!(feed_all(&mut parser, b"OK\r\n").is_some());

        // Anything trailing belongs to nobody.
        assert!(feed_all(&mut parser, b"stale\r\nOK\r\n").is_none());
    }
}
