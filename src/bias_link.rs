use std::thread;
use std::time::Duration;

/// Raw status returned by the bias hardware layer. `0` is success.
pub type ResultCode = i32;

pub const CODE_OK: ResultCode = 0;
/// The device did not answer in time.
pub const CODE_TIMEOUT: ResultCode = -1;
/// The link to the device is broken or was never opened.
pub const CODE_LINK_ERROR: ResultCode = -2;
/// The device answered with something that could not be understood.
pub const CODE_BAD_REPLY: ResultCode = -3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polarity {
    Negative,
    Positive,
}

impl Polarity {
    pub fn is_negative(&self) -> bool {
        matches!(self, Polarity::Negative)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BiasCommand {
    /// DAC setpoint in millivolts, before gain and offset.
    SetVoltage(i32),
    SetPolarity(Polarity),
    HvOn,
    HvOff,
    QueryStatus,
    QueryVoltage,
}

impl BiasCommand {
    /// Operation name carried by errors.
    pub fn name(&self) -> &'static str {
        match self {
            BiasCommand::SetVoltage(_) => "set_voltage",
            BiasCommand::SetPolarity(_) => "set_polarity",
            BiasCommand::HvOn => "hv_on",
            BiasCommand::HvOff => "hv_off",
            BiasCommand::QueryStatus => "get_status",
            BiasCommand::QueryVoltage => "get_voltage",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BiasReply {
    Ack,
    Status { enabled: bool, is_negative: bool },
    /// Applied output, after gain and offset.
    Voltage { millivolts: i32 },
}

/// Seam to the high-voltage bias hardware.
///
/// A link is owned by exactly one I/O worker thread, so implementations only
/// need to be `Send`.
pub trait BiasLink: Send + 'static {
    fn open(&mut self) -> Result<(), ResultCode>;

    /// Execute one command, giving up after `timeout` with `CODE_TIMEOUT`.
    fn transact(&mut self, command: &BiasCommand, timeout: Duration)
        -> Result<BiasReply, ResultCode>;

    fn close(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkBehaviour {
    Responsive,
    /// Accepts the open, then never answers.
    Unresponsive,
    /// Rejects every command with the given device code.
    Rejecting(ResultCode),
    /// Cannot be opened.
    Absent,
}

/// In-memory bias supply.
#[derive(Debug, Clone)]
pub struct SimulatedBiasLink {
    behaviour: LinkBehaviour,
    gain_permille: i32,
    offset_mv: i32,
    limit_mv: u32,
    setpoint_mv: i32,
    polarity: Polarity,
    enabled: bool,
    open: bool,
}

impl Default for SimulatedBiasLink {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedBiasLink {
    pub const DEFAULT_LIMIT_MV: u32 = 100_000;
    /// Device code for a setpoint beyond the supply's range.
    pub const ERR_OUT_OF_RANGE: ResultCode = 2;

    pub fn new() -> Self {
        Self::with_behaviour(LinkBehaviour::Responsive)
    }

    pub fn with_behaviour(behaviour: LinkBehaviour) -> Self {
        Self {
            behaviour,
            gain_permille: 1000,
            offset_mv: 0,
            limit_mv: Self::DEFAULT_LIMIT_MV,
            setpoint_mv: 0,
            polarity: Polarity::Positive,
            enabled: false,
            open: false,
        }
    }

    /// Output = setpoint * gain / 1000 + offset.
    pub fn with_calibration(mut self, gain_permille: i32, offset_mv: i32) -> Self {
        self.gain_permille = gain_permille;
        self.offset_mv = offset_mv;
        self
    }

    pub fn with_limit(mut self, limit_mv: u32) -> Self {
        self.limit_mv = limit_mv;
        self
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn setpoint(&self) -> i32 {
        self.setpoint_mv
    }

    fn applied_mv(&self) -> i32 {
        if !self.enabled {
            return 0;
        }
        let scaled = i64::from(self.setpoint_mv) * i64::from(self.gain_permille) / 1000
            + i64::from(self.offset_mv);
        let signed = if self.polarity.is_negative() {
            -scaled
        } else {
            scaled
        };
        signed.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32
    }
}

impl BiasLink for SimulatedBiasLink {
    fn open(&mut self) -> Result<(), ResultCode> {
        if self.behaviour == LinkBehaviour::Absent {
            return Err(CODE_LINK_ERROR);
        }
        log::debug!("Opening simulated bias link ({:?})", self.behaviour);
        self.open = true;
        Ok(())
    }

    fn transact(
        &mut self,
        command: &BiasCommand,
        timeout: Duration,
    ) -> Result<BiasReply, ResultCode> {
        if !self.open {
            return Err(CODE_LINK_ERROR);
        }
        match self.behaviour {
            LinkBehaviour::Unresponsive => {
                thread::sleep(timeout);
                return Err(CODE_TIMEOUT);
            }
            LinkBehaviour::Rejecting(code) => return Err(code),
            LinkBehaviour::Responsive | LinkBehaviour::Absent => {}
        }

        match *command {
            BiasCommand::SetVoltage(mv) => {
                if mv.unsigned_abs() > self.limit_mv {
                    return Err(Self::ERR_OUT_OF_RANGE);
                }
                self.setpoint_mv = mv;
                Ok(BiasReply::Ack)
            }
            BiasCommand::SetPolarity(polarity) => {
                self.polarity = polarity;
                Ok(BiasReply::Ack)
            }
            BiasCommand::HvOn => {
                self.enabled = true;
                Ok(BiasReply::Ack)
            }
            BiasCommand::HvOff => {
                self.enabled = false;
                Ok(BiasReply::Ack)
            }
            BiasCommand::QueryStatus => Ok(BiasReply::Status {
                enabled: self.enabled,
                is_negative: self.polarity.is_negative(),
            }),
            BiasCommand::QueryVoltage => Ok(BiasReply::Voltage {
                millivolts: self.applied_mv(),
            }),
        }
    }

    fn close(&mut self) {
        log::debug!("Closing simulated bias link");
        self.open = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: Duration = Duration::from_millis(10);

    fn opened(link: SimulatedBiasLink) -> SimulatedBiasLink {
        let mut link = link;
        link.open().unwrap();
        link
    }

    #[test]
    fn test_commands_require_open() {
        let mut link = SimulatedBiasLink::new();
        assert_eq!(link.transact(&BiasCommand::HvOn, T), Err(CODE_LINK_ERROR));
        assert_eq!(
            SimulatedBiasLink::with_behaviour(LinkBehaviour::Absent).open(),
            Err(CODE_LINK_ERROR)
        );
    }

    #[test]
    fn test_applied_voltage_includes_calibration_and_polarity() {
        let mut link = opened(SimulatedBiasLink::new().with_calibration(1500, 20));
        link.transact(&BiasCommand::SetVoltage(1000), T).unwrap();
        assert_eq!(
            link.transact(&BiasCommand::QueryVoltage, T),
            Ok(BiasReply::Voltage { millivolts: 0 })
        );

        link.transact(&BiasCommand::HvOn, T).unwrap();
        link.transact(&BiasCommand::SetPolarity(Polarity::Negative), T)
            .unwrap();
        assert_eq!(
            link.transact(&BiasCommand::QueryVoltage, T),
            Ok(BiasReply::Voltage { millivolts: -1520 })
        );
        assert_eq!(
            link.transact(&BiasCommand::QueryStatus, T),
            Ok(BiasReply::Status {
                enabled: true,
                is_negative: true
            })
        );
    }

    #[test]
    fn test_extreme_setpoints_saturate() {
        let mut link = opened(SimulatedBiasLink::new());
        assert_eq!(
            link.transact(&BiasCommand::SetVoltage(i32::MIN), T),
            Err(SimulatedBiasLink::ERR_OUT_OF_RANGE)
        );

        let mut link = opened(
            SimulatedBiasLink::new()
                .with_limit(u32::MAX)
                .with_calibration(3000, i32::MAX),
        );
        link.transact(&BiasCommand::HvOn, T).unwrap();
        link.transact(&BiasCommand::SetVoltage(i32::MAX), T).unwrap();
        assert_eq!(
            link.transact(&BiasCommand::QueryVoltage, T),
            Ok(BiasReply::Voltage {
                millivolts: i32::MAX
            })
        );
    }

    #[test]
    fn test_rejecting_link_returns_device_code() {
        let mut link = opened(SimulatedBiasLink::with_behaviour(LinkBehaviour::Rejecting(9)));
        assert_eq!(link.transact(&BiasCommand::HvOff, T), Err(9));
    }
}
