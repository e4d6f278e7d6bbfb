//! Half-duplex command/response coordination.
//!
//! [`AtChannel`] owns the parser and the synchronization state shared
//! between the background reader and the command issuer. Splitting it
//! yields a [`Runner`] for the receive half of the UART and a [`Client`]
//! for the transmit half.

use core::cell::RefCell;
use core::fmt;
use core::fmt::Write as _;
use core::sync::atomic::{AtomicBool, Ordering};

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::signal::Signal;
use embassy_time::{with_timeout, Duration, Timer};
use embedded_io_async::{Read, Write};
use heapless::String;

use crate::error::Error;
use crate::hex;
use crate::parser::{Parser, ParserEvent, Response};
use crate::scan::{AtCallbacks, CharacterHandler, LineScanner};
use crate::COMMAND_CAPACITY;

/// Poll cadence of a reader whose channel is closed or suspended.
const IDLE_POLL: Duration = Duration::from_millis(200);

/// The waiter re-checks the port state between slices of this length, so a
/// concurrent `close()` unblocks it within one slice.
const WAIT_SLICE: Duration = Duration::from_secs(1);

/// Input bytes per hex write. 40 bytes become 80 characters on the wire,
/// which bounds the stack buffer at one command line.
const HEX_CHUNK: usize = 40;

/// Shared channel state. `const`-constructible so it can live in a
/// `static`; open/close any number of times between construction and drop.
pub struct AtChannel<'cb> {
    parser: Mutex<CriticalSectionRawMutex, RefCell<Parser<'cb>>>,
    response: Signal<CriticalSectionRawMutex, Response>,
    callbacks: &'cb dyn AtCallbacks,
    open: AtomicBool,
    suspended: AtomicBool,
}

impl<'cb> AtChannel<'cb> {
    pub const fn new(callbacks: &'cb dyn AtCallbacks) -> Self {
        Self {
            parser: Mutex::new(RefCell::new(Parser::new(callbacks))),
            response: Signal::new(),
            callbacks,
            open: AtomicBool::new(false),
            suspended: AtomicBool::new(false),
        }
    }

    /// Split into the reader half and the command half.
    pub fn split<R: Read, W: Write>(
        &self,
        reader: R,
        writer: W,
    ) -> (Runner<'_, 'cb, R>, Client<'_, 'cb, W>) {
        (
            Runner {
                channel: self,
                reader,
            },
            Client {
                channel: self,
                writer,
                timeout_secs: 0,
                delay: Duration::from_millis(0),
            },
        )
    }

    /// Open the channel. Idempotent. A response signal left over from a
    /// previous session is discarded.
    pub fn open(&self) {
        if !self.open.swap(true, Ordering::Relaxed) {
            debug!("channel opened");
            self.response.reset();
        }
    }

    /// Close the channel. Idempotent. A waiter blocked in `command` observes
    /// the closed port within one wait slice and returns `PortClosed`.
    pub fn close(&self) {
        if self.open.swap(false, Ordering::Relaxed) {
            debug!("channel closed");
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Relaxed)
    }

    /// Pause the reader without touching the port state. Takes effect at
    /// the reader's next read boundary; bytes the transport has already
    /// handed over are still processed.
    pub fn suspend(&self) {
        self.suspended.store(true, Ordering::Relaxed);
    }

    pub fn resume(&self) {
        self.suspended.store(false, Ordering::Relaxed);
    }

    fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Relaxed)
    }

    /// Bytes lost to buffer overflow since construction.
    pub fn overflow_count(&self) -> u32 {
        self.with_parser(|parser| parser.overflow_count())
    }

    fn with_parser<T>(&self, f: impl FnOnce(&mut Parser<'cb>) -> T) -> T {
        self.parser.lock(|parser| f(&mut parser.borrow_mut()))
    }
}

/// Background reader. Spawn [`Runner::run`] on the executor; it feeds the
/// parser and dispatches completed responses and URCs.
pub struct Runner<'a, 'cb, R> {
    channel: &'a AtChannel<'cb>,
    reader: R,
}

impl<'a, 'cb, R: Read> Runner<'a, 'cb, R> {
    pub async fn run(mut self) -> ! {
        let mut buf = [0u8; 32];
        loop {
            if !self.channel.is_open() || self.channel.is_suspended() {
                Timer::after(IDLE_POLL).await;
                continue;
            }
            match self.reader.read(&mut buf).await {
                Ok(0) => Timer::after(IDLE_POLL).await,
                Ok(n) => self.process(&buf[..n]),
                Err(_) => {
                    warn!("transport read error");
                    Timer::after(IDLE_POLL).await;
                }
            }
        }
    }

    fn process(&self, bytes: &[u8]) {
        for &byte in bytes {
            let event = self.channel.with_parser(|parser| parser.feed_byte(byte));
            match event {
                Some(ParserEvent::Response(response)) => {
                    debug!(">> response complete ({} bytes)", response.len());
                    self.channel.response.signal(response);
                }
                // Dispatched outside the parser lock: the handler may take
                // its time, and the handler must never observe the parser
                // mid-mutation.
                Some(ParserEvent::Urc(line)) => {
                    trace!(">> urc {:?}", &line[..]);
                    self.channel.callbacks.handle_urc(&line);
                }
                None => {}
            }
        }
    }
}

/// Command issuer. Every method takes `&mut self`: the channel carries one
/// command at a time, and exclusive access is how that contract is kept.
pub struct Client<'a, 'cb, W> {
    channel: &'a AtChannel<'cb>,
    writer: W,
    timeout_secs: u32,
    delay: Duration,
}

impl<'a, 'cb, W: Write> Client<'a, 'cb, W> {
    /// The shared channel, for `open`/`close`/`suspend` from the same task.
    pub fn channel(&self) -> &'a AtChannel<'cb> {
        self.channel
    }

    /// Response timeout in whole seconds. Zero (the default) makes every
    /// command report `Timeout` immediately; set this before first use.
    pub fn set_timeout(&mut self, secs: u32) {
        self.timeout_secs = secs;
    }

    /// Quiet time inserted before each command. Some modems drop input
    /// arriving on the heels of the previous exchange.
    pub fn set_delay(&mut self, millis: u64) {
        self.delay = Duration::from_millis(millis);
    }

    /// Expect a data prompt instead of a response line for the next
    /// command.
    pub fn expect_dataprompt(&mut self, prompt: &[u8]) {
        self.channel
            .with_parser(|parser| parser.expect_dataprompt(prompt));
    }

    /// Arm a line scanner for the next command only.
    pub fn set_command_scanner(&mut self, scanner: LineScanner) {
        self.channel
            .with_parser(|parser| parser.set_command_scanner(scanner));
    }

    /// Install a per-byte rewriter, applied until cleared or until the next
    /// command completes.
    pub fn set_character_handler(&mut self, handler: CharacterHandler) {
        self.channel
            .with_parser(|parser| parser.set_character_handler(handler));
    }

    pub fn clear_character_handler(&mut self) {
        self.channel
            .with_parser(|parser| parser.clear_character_handler());
    }

    /// Send a command and wait for its response.
    pub async fn command(&mut self, cmd: &str) -> Result<Response, Error> {
        self.command_fmt(format_args!("{}", cmd)).await
    }

    /// Like [`Client::command`], with the command line built from format
    /// arguments: `client.command_fmt(format_args!("AT+CPIN={}", pin))`.
    pub async fn command_fmt(&mut self, args: fmt::Arguments<'_>) -> Result<Response, Error> {
        let line = format_command(args)?;
        debug!("<< {}", &line[..line.len() - 1]);
        self.transact(line.as_bytes()).await
    }

    /// Send a pre-formatted payload and wait for its response. Used for the
    /// body following a data prompt; no length bound and no `\r` appended.
    pub async fn command_raw(&mut self, data: &[u8]) -> Result<Response, Error> {
        debug!("<< [{} bytes]", data.len());
        self.transact(data).await
    }

    /// Send a command and require it to complete with a bare `OK`.
    pub async fn command_ok(&mut self, cmd: &str) -> Result<(), Error> {
        let response = self.command(cmd).await?;
        if response.is_empty() {
            Ok(())
        } else {
            Err(Error::ErrorResponse)
        }
    }

    /// One-way formatted write; the parser is not armed and no response is
    /// collected. No `\r` is appended.
    pub async fn send(&mut self, s: &str) -> Result<(), Error> {
        self.send_fmt(format_args!("{}", s)).await
    }

    pub async fn send_fmt(&mut self, args: fmt::Arguments<'_>) -> Result<(), Error> {
        let mut line: String<COMMAND_CAPACITY> = String::new();
        line.write_fmt(args).map_err(|_| Error::CommandTooLong)?;
        debug!("s< {}", line.as_str());
        self.ensure_open()?;
        self.write_all(line.as_bytes()).await
    }

    /// One-way verbatim write.
    pub async fn send_raw(&mut self, data: &[u8]) -> Result<(), Error> {
        debug!("r< [{} bytes]", data.len());
        self.ensure_open()?;
        self.write_all(data).await
    }

    /// One-way write of `data` as uppercase hex, chunked so the encode
    /// buffer stays small.
    pub async fn send_hex(&mut self, data: &[u8]) -> Result<(), Error> {
        debug!("h< [{} bytes]", data.len());
        self.ensure_open()?;
        let mut encoded = [0u8; HEX_CHUNK * 2];
        for chunk in data.chunks(HEX_CHUNK) {
            let n = hex::encode_to(chunk, &mut encoded);
            self.write_all(&encoded[..n]).await?;
        }
        Ok(())
    }

    /// Probe an option with `AT+<option>?` and, if it does not already read
    /// back as `+<option>: <value>`, set it with `AT+<option>=<value>` and
    /// re-probe after a one second back-off, up to `attempts` rounds.
    ///
    /// Transport timeouts abort immediately; a probe that never converges
    /// exhausts the attempts and reports [`Error::ErrorResponse`].
    pub async fn config(&mut self, option: &str, value: &str, attempts: u32) -> Result<(), Error> {
        let mut expected: String<COMMAND_CAPACITY> = String::new();
        write!(expected, "+{}: {}", option, value).map_err(|_| Error::CommandTooLong)?;

        for _ in 0..attempts {
            let response = self.command_fmt(format_args!("AT+{}?", option)).await?;
            if response.as_bytes().starts_with(expected.as_bytes()) {
                return Ok(());
            }
            if let Err(e) = self
                .command_fmt(format_args!("AT+{}={}", option, value))
                .await
            {
                debug!("option set rejected: {:?}", e);
            }
            Timer::after(Duration::from_secs(1)).await;
        }
        Err(Error::ErrorResponse)
    }

    async fn transact(&mut self, data: &[u8]) -> Result<Response, Error> {
        if !self.channel.is_open() {
            return Err(Error::PortClosed);
        }

        if self.delay.as_ticks() > 0 {
            Timer::after(self.delay).await;
        }

        // Arm before transmitting; the first response byte may arrive
        // before the write call returns.
        self.channel.response.reset();
        self.channel.with_parser(|parser| parser.await_response());

        if let Err(e) = self.write_all(data).await {
            self.channel.with_parser(|parser| parser.reset());
            return Err(e);
        }

        let mut remaining = self.timeout_secs;
        while remaining > 0 {
            match with_timeout(WAIT_SLICE, self.channel.response.wait()).await {
                Ok(response) => {
                    self.finish_command();
                    return Ok(response);
                }
                Err(_) => {
                    if !self.channel.is_open() {
                        self.finish_command();
                        return Err(Error::PortClosed);
                    }
                    remaining -= 1;
                }
            }
        }

        warn!("command timed out");
        self.channel.with_parser(|parser| parser.reset());
        Err(Error::Timeout)
    }

    /// Per-command settings are one-shot; drop them now that the command is
    /// over.
    fn finish_command(&mut self) {
        self.channel.with_parser(|parser| {
            parser.clear_command_scanner();
            parser.clear_character_handler();
        });
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<(), Error> {
        self.writer
            .write_all(data)
            .await
            .map_err(|_| Error::Write)?;
        self.writer.flush().await.map_err(|_| Error::Write)
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.channel.is_open() {
            Ok(())
        } else {
            Err(Error::PortClosed)
        }
    }
}

fn format_command(args: fmt::Arguments<'_>) -> Result<String<COMMAND_CAPACITY>, Error> {
    let mut line: String<COMMAND_CAPACITY> = String::new();
    line.write_fmt(args).map_err(|_| Error::CommandTooLong)?;
    line.push('\r').map_err(|_| Error::CommandTooLong)?;
    Ok(line)
}
