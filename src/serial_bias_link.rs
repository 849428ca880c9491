use serialport::SerialPort;
use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

use crate::bias_link::{
    BiasCommand, BiasLink, BiasReply, Polarity, ResultCode, CODE_BAD_REPLY, CODE_LINK_ERROR,
    CODE_TIMEOUT,
};

#[derive(Debug, Clone)]
pub struct SerialLinkSettings {
    pub baud_rate: u32,
    /// Timeout of a single port read; commands poll until their own bound.
    pub read_timeout: Duration,
    pub prompt: String,
}

impl Default for SerialLinkSettings {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            read_timeout: Duration::from_millis(10),
            prompt: "> ".to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SerialLinkError {
    #[error("Serial port error: {0}")]
    SerialPort(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error(
        "Timeout error: Expected prompt '{expected}' but got '{actual}'. Likely due to a timeout."
    )]
    Timeout { expected: String, actual: String },

    #[error("UTF-8 conversion error: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("Unexpected reply '{reply}' to {command}")]
    UnexpectedReply {
        command: &'static str,
        reply: String,
    },

    #[error("Supply rejected the command with code {code}")]
    Rejected { code: ResultCode },

    #[error("Serial link is not open")]
    NotOpen,
}

impl SerialLinkError {
    /// Result code handed back through the `BiasLink` seam.
    pub fn code(&self) -> ResultCode {
        match self {
            SerialLinkError::Timeout { .. } => CODE_TIMEOUT,
            SerialLinkError::Utf8(_) | SerialLinkError::UnexpectedReply { .. } => CODE_BAD_REPLY,
            SerialLinkError::Rejected { code } => *code,
            SerialLinkError::SerialPort(_) | SerialLinkError::Io(_) | SerialLinkError::NotOpen => {
                CODE_LINK_ERROR
            }
        }
    }
}

/// Bias supply behind a line-oriented serial console.
///
/// Every command is one line; the supply answers with one reply line followed
/// by the prompt.
pub struct SerialBiasLink {
    port: String,
    settings: SerialLinkSettings,
    serial: Option<Box<dyn SerialPort>>,
}

impl SerialBiasLink {
    const OPEN_TIMEOUT: Duration = Duration::from_secs(1);

    /// Unopened link; the port is claimed by `open`.
    pub fn new(port: &str, settings: SerialLinkSettings) -> Self {
        Self {
            port: port.to_string(),
            settings,
            serial: None,
        }
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    fn connect(&mut self) -> Result<(), SerialLinkError> {
        let serial = serialport::new(&self.port, self.settings.baud_rate)
            .timeout(self.settings.read_timeout)
            .open()?;
        self.serial = Some(serial);
        self.flush()?;

        log::debug!("Connected to bias supply on {}. Sending CTRL-C to reset.", self.port);
        self.send_ctrl_c()?;

        log::debug!("Turning on prompt");
        self.exec("prompt on", Self::OPEN_TIMEOUT)?;
        self.flush()
    }

    fn serial(&mut self) -> Result<&mut Box<dyn SerialPort>, SerialLinkError> {
        self.serial.as_mut().ok_or(SerialLinkError::NotOpen)
    }

    fn flush(&mut self) -> Result<(), SerialLinkError> {
        self.serial()?.discard_input()?;
        Ok(())
    }

    fn send_ctrl_c(&mut self) -> Result<(), SerialLinkError> {
        self.serial()?.write_all(&[CTRL_C])?;
        Ok(())
    }

    fn exec(&mut self, command: &str, timeout: Duration) -> Result<String, SerialLinkError> {
        let prompt = self.settings.prompt.clone().into_bytes();
        exec_on(self.serial()?, &prompt, command, timeout)
    }
}

const CTRL_C: u8 = 0x03;

/// Byte stream to the supply's console.
trait Console: Read + Write {
    /// Drop anything buffered in either direction.
    fn discard_input(&mut self) -> io::Result<()>;
}

impl Console for Box<dyn SerialPort> {
    fn discard_input(&mut self) -> io::Result<()> {
        self.clear(serialport::ClearBuffer::All)?;
        Ok(())
    }
}

/// Send one command line and collect everything up to the prompt.
///
/// On timeout the command is interrupted with CTRL-C and pending input is
/// discarded, so a late reply cannot be taken as the answer to the next
/// command.
fn exec_on<C: Console>(
    console: &mut C,
    prompt: &[u8],
    command: &str,
    timeout: Duration,
) -> Result<String, SerialLinkError> {
    console.write_all(format!("{}\n", command).as_bytes())?;

    let mut response = Vec::new();
    let now = Instant::now();
    while !response.ends_with(prompt) {
        if now.elapsed() >= timeout {
            let tail = response.len().saturating_sub(prompt.len());
            let err = SerialLinkError::Timeout {
                expected: String::from_utf8_lossy(prompt).to_string(),
                actual: String::from_utf8_lossy(&response[tail..]).to_string(),
            };
            cancel(console);
            return Err(err);
        }

        let mut byte = [0u8; 1];
        match console.read_exact(&mut byte) {
            Ok(()) => response.push(byte[0]),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {}
            Err(e) => return Err(e.into()),
        }
    }

    response.truncate(response.len() - prompt.len());
    Ok(String::from_utf8(response)?.trim().to_string())
}

fn cancel<C: Console>(console: &mut C) {
    log::debug!("Interrupting timed out command");
    if let Err(e) = console
        .write_all(&[CTRL_C])
        .and_then(|()| console.discard_input())
    {
        log::warn!("Failed to resync bias console: {}", e);
    }
}

impl BiasLink for SerialBiasLink {
    fn open(&mut self) -> Result<(), ResultCode> {
        self.connect().map_err(|e| {
            log::error!("Cannot open bias supply on {}: {}", self.port, e);
            self.serial = None;
            e.code()
        })
    }

    fn transact(
        &mut self,
        command: &BiasCommand,
        timeout: Duration,
    ) -> Result<BiasReply, ResultCode> {
        let line = encode_command(command);
        log::debug!("bias > {}", line);
        let result = self
            .exec(&line, timeout)
            .and_then(|response| parse_reply(command, &response));
        result.map_err(|e| {
            log::debug!("bias command '{}' failed: {}", line, e);
            e.code()
        })
    }

    fn close(&mut self) {
        if self.serial.take().is_some() {
            log::debug!("Closed bias supply on {}", self.port);
        }
    }
}

pub fn encode_command(command: &BiasCommand) -> String {
    match command {
        BiasCommand::SetVoltage(mv) => format!("bias mv {}", mv),
        BiasCommand::SetPolarity(Polarity::Negative) => "bias pol neg".to_string(),
        BiasCommand::SetPolarity(Polarity::Positive) => "bias pol pos".to_string(),
        BiasCommand::HvOn => "bias hv on".to_string(),
        BiasCommand::HvOff => "bias hv off".to_string(),
        BiasCommand::QueryStatus => "bias status".to_string(),
        BiasCommand::QueryVoltage => "bias read".to_string(),
    }
}

/// Interpret the response to `command`. Only the last non-empty line counts,
/// so an echoed command line is ignored.
pub fn parse_reply(command: &BiasCommand, response: &str) -> Result<BiasReply, SerialLinkError> {
    let reply = response
        .lines()
        .map(str::trim)
        .rev()
        .find(|line| !line.is_empty())
        .unwrap_or("");
    let unexpected = || SerialLinkError::UnexpectedReply {
        command: command.name(),
        reply: reply.to_string(),
    };

    let mut words = reply.split_whitespace();
    let head = words.next();
    let args: Vec<&str> = words.collect();

    if let (Some("err"), [code]) = (head, args.as_slice()) {
        let code = code.parse().map_err(|_| unexpected())?;
        return Err(SerialLinkError::Rejected { code });
    }

    match (command, head, args.as_slice()) {
        (
            BiasCommand::SetVoltage(_)
            | BiasCommand::SetPolarity(_)
            | BiasCommand::HvOn
            | BiasCommand::HvOff,
            Some("ok"),
            [],
        ) => Ok(BiasReply::Ack),
        (BiasCommand::QueryStatus, Some("status"), [enabled, negative]) => Ok(BiasReply::Status {
            enabled: parse_flag(enabled).ok_or_else(unexpected)?,
            is_negative: parse_flag(negative).ok_or_else(unexpected)?,
        }),
        (BiasCommand::QueryVoltage, Some("mv"), [value]) => Ok(BiasReply::Voltage {
            millivolts: value.parse().map_err(|_| unexpected())?,
        }),
        _ => Err(unexpected()),
    }
}

fn parse_flag(word: &str) -> Option<bool> {
    match word {
        "0" => Some(false),
        "1" => Some(true),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Console fed from a byte queue; reads time out once the queue is empty.
    #[derive(Default)]
    struct FakeConsole {
        incoming: VecDeque<u8>,
        /// Refill `incoming` forever with this byte.
        chatter: Option<u8>,
        written: Vec<u8>,
        discarded: bool,
    }

    impl FakeConsole {
        fn replying(reply: &str) -> Self {
            Self {
                incoming: reply.bytes().collect(),
                ..Self::default()
            }
        }
    }

    impl Read for FakeConsole {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if let Some(byte) = self.chatter {
                self.incoming.push_back(byte);
            }
            match self.incoming.pop_front() {
                Some(byte) if !buf.is_empty() => {
                    buf[0] = byte;
                    Ok(1)
                }
                Some(_) => Ok(0),
                None => {
                    std::thread::sleep(Duration::from_millis(1));
                    Err(io::ErrorKind::TimedOut.into())
                }
            }
        }
    }

    impl Write for FakeConsole {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Console for FakeConsole {
        fn discard_input(&mut self) -> io::Result<()> {
            self.incoming.clear();
            self.discarded = true;
            Ok(())
        }
    }

    #[test]
    fn test_exec_collects_reply_up_to_prompt() {
        let mut console = FakeConsole::replying("ok\r\n> ");
        let reply = exec_on(&mut console, b"> ", "bias hv on", Duration::from_secs(1)).unwrap();
        assert_eq!(reply, "ok");
        assert_eq!(console.written, b"bias hv on\n");
        assert!(!console.discarded);
    }

    #[test]
    fn test_exec_timeout_interrupts_and_discards_input() {
        let mut console = FakeConsole::replying("status");
        let err = exec_on(&mut console, b"> ", "bias status", Duration::from_millis(20))
            .unwrap_err();
        assert_eq!(err.code(), CODE_TIMEOUT);
        assert_eq!(console.written, b"bias status\n\x03");
        assert!(console.discarded);
    }

    #[test]
    fn test_exec_gives_up_on_endless_output_without_prompt() {
        let mut console = FakeConsole {
            chatter: Some(b'x'),
            ..FakeConsole::default()
        };
        let started = Instant::now();
        let err = exec_on(&mut console, b"> ", "bias read", Duration::from_millis(30))
            .unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(matches!(err, SerialLinkError::Timeout { ref actual, .. } if actual.starts_with('x')));
        assert_eq!(console.written.last(), Some(&CTRL_C));
    }

    #[test]
    fn test_encode_command_lines() {
        assert_eq!(encode_command(&BiasCommand::SetVoltage(-2500)), "bias mv -2500");
        assert_eq!(
            encode_command(&BiasCommand::SetPolarity(Polarity::Negative)),
            "bias pol neg"
        );
        assert_eq!(encode_command(&BiasCommand::HvOff), "bias hv off");
        assert_eq!(encode_command(&BiasCommand::QueryVoltage), "bias read");
    }

    #[test]
    fn test_parse_acknowledgements_and_rejections() {
        assert_eq!(parse_reply(&BiasCommand::HvOn, "ok").unwrap(), BiasReply::Ack);
        assert_eq!(
            parse_reply(&BiasCommand::HvOn, "bias hv on\r\nok").unwrap(),
            BiasReply::Ack
        );

        let err = parse_reply(&BiasCommand::SetVoltage(1), "err 7").unwrap_err();
        assert!(matches!(err, SerialLinkError::Rejected { code: 7 }));
        assert_eq!(err.code(), 7);
    }

    #[test]
    fn test_parse_queries() {
        assert_eq!(
            parse_reply(&BiasCommand::QueryStatus, "status 1 0").unwrap(),
            BiasReply::Status {
                enabled: true,
                is_negative: false
            }
        );
        assert_eq!(
            parse_reply(&BiasCommand::QueryVoltage, "mv -51230").unwrap(),
            BiasReply::Voltage { millivolts: -51230 }
        );
    }

    #[test]
    fn test_malformed_replies_are_bad_reply() {
        for (command, reply) in [
            (BiasCommand::QueryStatus, "status 1"),
            (BiasCommand::QueryStatus, "status 2 0"),
            (BiasCommand::QueryVoltage, "mv lots"),
            (BiasCommand::QueryVoltage, "ok"),
            (BiasCommand::HvOff, ""),
            (BiasCommand::HvOff, "err x"),
        ] {
            let err = parse_reply(&command, reply).unwrap_err();
            assert_eq!(err.code(), CODE_BAD_REPLY, "{reply:?}");
        }
    }

    #[test]
    fn test_unopened_link_reports_link_error() {
        let mut link = SerialBiasLink::new("/dev/does-not-exist", SerialLinkSettings::default());
        assert_eq!(
            link.transact(&BiasCommand::QueryStatus, Duration::from_millis(1)),
            Err(CODE_LINK_ERROR)
        );
        link.close();
    }
}
