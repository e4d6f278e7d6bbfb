#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum Error {
    /// No terminal response arrived within the configured timeout. The
    /// parser has been reset; the next command starts from a clean state.
    Timeout,

    /// The channel is closed, or was closed while waiting for a response.
    PortClosed,

    /// The formatted command does not fit the 80-byte command line.
    CommandTooLong,

    /// The transport rejected the outgoing bytes.
    Write,

    /// The modem answered with a terminal response other than `OK`, or an
    /// option probe never converged on the requested value.
    ErrorResponse,
}
