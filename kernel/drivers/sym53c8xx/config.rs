// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Host adapter configuration.
//!
//! The defaults suit most systems. They can be overridden
//! with a boot option string of space-separated `key:value`
//! pairs, such as `"tags:16 sync:12 wide:0"`.

use core::fmt;

/// What to do when the bus lines look wrong while
/// resetting the SCSI bus.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BusCheck {
    /// Don't check the bus lines.
    Off,

    /// Check, and fail the reset if they are wrong.
    Fail,

    /// Check, and only log a warning.
    Warn,
}

/// The host adapter's configuration.
///
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    // name prefixes every log line.
    pub name: &'static str,

    // host_id is the adapter's own SCSI id.
    pub host_id: u8,

    // max_tags is the default queue depth of
    // tagged logical units.
    pub max_tags: u8,

    // min_sync is the fastest period factor to
    // negotiate, and 0 disables synchronous
    // transfers.
    pub min_sync: u8,

    // wide enables 16-bit transfers.
    pub wide: bool,

    // dt enables double transition clocking.
    pub dt: bool,

    // Size limits.
    pub max_queue: usize,
    pub max_sg: usize,
    pub max_target: u8,
    pub max_lun: u8,
    pub ccb_count: usize,

    // iarb_max is the number of consecutive
    // immediate arbitrations allowed, 0 to
    // disable them.
    pub iarb_max: u8,

    pub bus_check: BusCheck,

    // residual enables residual reporting.
    pub residual: bool,

    // verbose raises the log level of routine
    // events.
    pub verbose: u8,

    // irq_totem_pole selects the IRQ mode.
    pub irq_totem_pole: bool,

    // settle_delay is the time in seconds to
    // wait after a bus reset.
    pub settle_delay: u8,

    // disconnect lets targets disconnect from
    // untagged commands too.
    pub disconnect: bool,

    // Bus addresses of the memory shared with
    // SCRIPTS.
    pub scripta_ba: u32,
    pub scriptb_ba: u32,
    pub hcb_ba: u32,
    pub squeue_ba: u32,
    pub dqueue_ba: u32,
    pub ccb_ba: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            name: "sym0",
            host_id: 7,
            max_tags: 16,
            min_sync: 10,
            wide: true,
            dt: true,
            max_queue: 64,
            max_sg: 96,
            max_target: 16,
            max_lun: 8,
            ccb_count: 62,
            iarb_max: 4,
            bus_check: BusCheck::Fail,
            residual: true,
            verbose: 1,
            irq_totem_pole: false,
            settle_delay: 3,
            disconnect: true,
            scripta_ba: 0x0010_0000,
            scriptb_ba: 0x0011_0000,
            hcb_ba: 0x0012_0000,
            squeue_ba: 0x0013_0000,
            dqueue_ba: 0x0014_0000,
            ccb_ba: 0x0020_0000,
        }
    }
}

/// Explains why a configuration string was rejected.
///
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// An option was not of the form `key:value`.
    Malformed,

    /// The option is not recognised.
    UnknownOption,

    /// The option's value is not a number, or is
    /// out of range.
    InvalidValue(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::Malformed => write!(f, "option is not of the form key:value"),
            ConfigError::UnknownOption => write!(f, "unknown option"),
            ConfigError::InvalidValue(key) => write!(f, "invalid value for {}", key),
        }
    }
}

fn parse_num(key: &'static str, value: &str, max: u32) -> Result<u32, ConfigError> {
    let n = match value.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => value.parse::<u32>(),
    };

    match n {
        Ok(n) if n <= max => Ok(n),
        _ => Err(ConfigError::InvalidValue(key)),
    }
}

impl Config {
    /// Applies the options in `options` to the
    /// default configuration.
    ///
    pub fn parse(options: &str) -> Result<Self, ConfigError> {
        let mut config = Config::default();
        config.apply(options)?;
        Ok(config)
    }

    /// Applies the options in `options` to the
    /// configuration.
    ///
    pub fn apply(&mut self, options: &str) -> Result<(), ConfigError> {
        for option in options.split_whitespace() {
            let (key, value) = option.split_once(':').ok_or(ConfigError::Malformed)?;
            match key {
                "tags" => self.max_tags = parse_num("tags", value, crate::MAX_TASK as u32)? as u8,
                "sync" => self.min_sync = parse_num("sync", value, 255)? as u8,
                "wide" => self.wide = parse_num("wide", value, 1)? != 0,
                "dt" => self.dt = parse_num("dt", value, 1)? != 0,
                "hostid" => self.host_id = parse_num("hostid", value, 15)? as u8,
                "verb" => self.verbose = parse_num("verb", value, 255)? as u8,
                "iarb" => self.iarb_max = parse_num("iarb", value, 255)? as u8,
                "buschk" => {
                    self.bus_check = match parse_num("buschk", value, 2)? {
                        0 => BusCheck::Off,
                        1 => BusCheck::Fail,
                        _ => BusCheck::Warn,
                    }
                }
                "residual" => self.residual = parse_num("residual", value, 1)? != 0,
                "irqm" => self.irq_totem_pole = parse_num("irqm", value, 2)? != 0,
                "settle" => self.settle_delay = parse_num("settle", value, 255)? as u8,
                "disc" => self.disconnect = parse_num("disc", value, 1)? != 0,
                "queue" => self.max_queue = parse_num("queue", value, 256)?.max(3) as usize,
                _ => return Err(ConfigError::UnknownOption),
            }
        }

        Ok(())
    }
}
