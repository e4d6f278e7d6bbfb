//! Per-line response classification.

/// What a scanner decided about one assembled line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ScanDecision {
    /// No decision; the next scanner in the chain gets a chance.
    Unknown,
    /// Part of the response; append and keep collecting.
    Intermediate,
    /// Unsolicited result code; dispatch out-of-band, do not append.
    Urc,
    /// Terminal line. The line content is kept so callers can inspect the
    /// error text.
    Final,
    /// Terminal line whose content carries no information (`OK` and its
    /// modem-specific equivalents); discarded.
    FinalOk,
    /// The next `n` bytes are a binary payload belonging to this response.
    RawDataFollows(usize),
    /// The next `2 * n` characters are a hex-encoded payload of `n` bytes.
    HexDataFollows(usize),
}

/// Per-command line scanner, armed for exactly one command and consumed on
/// its completion. Encodes command-specific quirks: modems that emit lines
/// after `OK`, or terminate with `SHUT OK` / `DATA ACCEPT:` instead.
///
/// A per-command scanner is authoritative: its decision wins over the
/// channel-wide scanner and the built-in defaults.
pub type LineScanner = fn(line: &[u8]) -> ScanDecision;

/// Per-byte rewriter, run before line assembly.
///
/// Receives the incoming byte and the line assembled so far. Returning
/// `None` drops the byte; returning `Some(b'\n')` forces line completion at
/// this position. This is how prompts that arrive without a newline
/// (`"CONNECT:"` style) are turned into classifiable lines, and how
/// non-printable noise is scrubbed from a dirty stream.
pub type CharacterHandler = fn(byte: u8, line: &[u8]) -> Option<u8>;

/// Channel-lifetime callbacks, borrowed for as long as the channel is in
/// use.
///
/// `handle_urc` runs on the reader task; it must not block on the channel
/// and cannot issue commands (doing so requires the `&mut Client`, which
/// the reader never holds). URC handlers that need to talk to the modem
/// queue work for the command-issuing task instead.
pub trait AtCallbacks: Sync {
    /// Channel-wide line scanner, consulted after the per-command scanner.
    fn scan_line(&self, _line: &[u8]) -> ScanDecision {
        ScanDecision::Unknown
    }

    /// Called once per classified URC line.
    fn handle_urc(&self, _line: &[u8]) {}
}

/// Callback set that recognizes nothing; every line falls through to the
/// built-in classification.
pub struct NoCallbacks;

impl AtCallbacks for NoCallbacks {}

/// Terminal lines every AT dialect shares. The line text is preserved so
/// callers can string-match the failure.
const FINAL_EXACT: &[&[u8]] = &[
    b"ERROR",
    b"NO CARRIER",
    b"BUSY",
    b"NO ANSWER",
    b"NO DIALTONE",
];

/// Extended error responses carry a cause after the colon.
const FINAL_PREFIXES: &[&[u8]] = &[b"+CME ERROR:", b"+CMS ERROR:"];

/// Built-in classification, applied when every installed scanner returns
/// [`ScanDecision::Unknown`].
pub(crate) fn default_scan(line: &[u8]) -> ScanDecision {
    if line == b"OK" {
        return ScanDecision::FinalOk;
    }
    if FINAL_EXACT.iter().any(|&t| line == t)
        || FINAL_PREFIXES.iter().any(|&p| line.starts_with(p))
    {
        return ScanDecision::Final;
    }
    ScanDecision::Intermediate
}
