//! Runtime-tunable thresholds and admission rules
//!
//! One struct owned by the collection, built at startup from the config file
//! and changed afterwards only through named commands. Values are validated
//! before anything is written, so a rejected command leaves no trace.

use crate::domain::types::AddressError;
use crate::services::distance::effective_absorption;
use crate::services::filter::FilterParams;
use crate::services::irk::{IrkError, IrkSet};
use crate::services::matcher::{AddressSet, IdentityMatcher, PatternSet};
use crate::services::query::{Query, QueryError};
use thiserror::Error;

pub const DEFAULT_SKIP_DISTANCE: f64 = 0.5;
pub const DEFAULT_MAX_DISTANCE: f64 = 16.0;
pub const DEFAULT_REF_RSSI: i32 = -65;
pub const DEFAULT_FORGET_MS: u64 = 300_000;
pub const DEFAULT_SKIP_MS: u64 = 5_000;
pub const DEFAULT_CLOSE_MS: u64 = 30_000;
pub const DEFAULT_COUNT_MS: u64 = 10_000;
pub const DEFAULT_COUNT_ENTER: f64 = 2.0;
pub const DEFAULT_COUNT_EXIT: f64 = 4.0;

/// Names accepted by [`Tunables::apply`]
pub const COMMANDS: &[&str] = &[
    "max_distance",
    "absorption",
    "ref_rssi",
    "skip_distance",
    "forget_ms",
    "skip_ms",
    "close_ms",
    "count_ms",
    "count_enter",
    "count_exit",
    "include",
    "exclude",
    "query",
    "known_macs",
    "known_irks",
    "count_ids",
];

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CommandError {
    #[error("unknown command {0:?}")]
    Unknown(String),
    #[error("{command}: {value:?} is not a valid number")]
    NotANumber { command: &'static str, value: String },
    #[error("{command}: count_enter ({enter}) must stay below count_exit ({exit})")]
    CountOrder { command: &'static str, enter: f64, exit: f64 },
    #[error("query: {0}")]
    Query(#[from] QueryError),
    #[error("known_macs: {0}")]
    Address(#[from] AddressError),
    #[error("known_irks: {0}")]
    Irk(#[from] IrkError),
}

#[derive(Debug, Clone)]
pub struct Tunables {
    /// Largest single-update distance jump accepted (m, <= 0 disables)
    pub skip_distance: f64,
    /// Distances above this are clamped and treated as out of range (m, <= 0 disables)
    pub max_distance: f64,
    /// Path-loss exponent as configured; see [`Tunables::absorption`]
    pub absorption: f64,
    /// Reference RSSI at 1 m for devices without calibration
    pub ref_rssi: i32,
    pub forget_ms: u64,
    pub skip_ms: u64,
    pub close_ms: u64,
    pub count_ms: u64,
    pub count_enter: f64,
    pub count_exit: f64,
    /// Ids eligible for counting; empty means every device
    pub count_ids: PatternSet,
    pub matcher: IdentityMatcher,
    pub filter: FilterParams,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            skip_distance: DEFAULT_SKIP_DISTANCE,
            max_distance: DEFAULT_MAX_DISTANCE,
            absorption: crate::services::distance::DEFAULT_ABSORPTION,
            ref_rssi: DEFAULT_REF_RSSI,
            forget_ms: DEFAULT_FORGET_MS,
            skip_ms: DEFAULT_SKIP_MS,
            close_ms: DEFAULT_CLOSE_MS,
            count_ms: DEFAULT_COUNT_MS,
            count_enter: DEFAULT_COUNT_ENTER,
            count_exit: DEFAULT_COUNT_EXIT,
            count_ids: PatternSet::default(),
            matcher: IdentityMatcher::default(),
            filter: FilterParams::default(),
        }
    }
}

fn parse_f64(command: &'static str, value: &str) -> Result<f64, CommandError> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| CommandError::NotANumber { command, value: value.to_string() })
}

fn parse_u64(command: &'static str, value: &str) -> Result<u64, CommandError> {
    value
        .trim()
        .parse::<u64>()
        .map_err(|_| CommandError::NotANumber { command, value: value.to_string() })
}

fn parse_i32(command: &'static str, value: &str) -> Result<i32, CommandError> {
    value
        .trim()
        .parse::<i32>()
        .map_err(|_| CommandError::NotANumber { command, value: value.to_string() })
}

impl Tunables {
    /// Path-loss exponent with the `> 0` guard applied
    pub fn absorption(&self) -> f64 {
        effective_absorption(self.absorption)
    }

    /// Whether a device takes part in occupancy counting
    pub fn is_countable(&self, id: &str, alias: &str) -> bool {
        self.count_ids.is_empty()
            || self.count_ids.matches(id)
            || (!alias.is_empty() && self.count_ids.matches(alias))
    }

    /// Apply one named command. Returns the canonical command name on success.
    pub fn apply(&mut self, command: &str, payload: &str) -> Result<&'static str, CommandError> {
        let name = COMMANDS
            .iter()
            .copied()
            .find(|c| *c == command)
            .ok_or_else(|| CommandError::Unknown(command.to_string()))?;

        match name {
            "max_distance" => self.max_distance = parse_f64(name, payload)?,
            "absorption" => self.absorption = parse_f64(name, payload)?,
            "ref_rssi" => self.ref_rssi = parse_i32(name, payload)?,
            "skip_distance" => self.skip_distance = parse_f64(name, payload)?,
            "forget_ms" => self.forget_ms = parse_u64(name, payload)?,
            "skip_ms" => self.skip_ms = parse_u64(name, payload)?,
            "close_ms" => self.close_ms = parse_u64(name, payload)?,
            "count_ms" => self.count_ms = parse_u64(name, payload)?,
            "count_enter" => {
                let enter = parse_f64(name, payload)?;
                if enter >= self.count_exit {
                    return Err(CommandError::CountOrder { command: name, enter, exit: self.count_exit });
                }
                self.count_enter = enter;
            }
            "count_exit" => {
                let exit = parse_f64(name, payload)?;
                if self.count_enter >= exit {
                    return Err(CommandError::CountOrder { command: name, enter: self.count_enter, exit });
                }
                self.count_exit = exit;
            }
            "include" => self.matcher.include = PatternSet::parse(payload),
            "exclude" => self.matcher.exclude = PatternSet::parse(payload),
            "query" => {
                self.matcher.query = if payload.trim().is_empty() { None } else { Some(payload.parse::<Query>()?) }
            }
            "known_macs" => self.matcher.known_macs = AddressSet::parse(payload)?,
            "known_irks" => self.matcher.known_irks = IrkSet::parse(payload)?,
            "count_ids" => self.count_ids = PatternSet::parse(payload),
            _ => return Err(CommandError::Unknown(command.to_string())),
        }

        Ok(name)
    }
}
