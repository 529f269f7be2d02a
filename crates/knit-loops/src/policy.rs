//! Continuation policies: what a loop does after each cycle.
//!
//! Textual form: `forever`, `forever:<duration>` or `backlog`, optionally
//! followed by `,until-error`. Durations use unit suffixes (`500ms`, `30s`,
//! `1m30s`, `2h`).

use crate::error::LoopError;
use crate::looping::Next;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyParseError {
    #[error("unknown policy: {0:?}")]
    Unknown(String),
    #[error("backlog policy does not take parameters")]
    BacklogParameter,
    #[error("invalid duration: {0:?}")]
    Duration(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Policy {
    /// Never stop. Idle cycles are followed by the cooldown.
    Forever(Duration),
    /// Work while there is work, then stop cleanly.
    Backlog,
    /// Like the wrapped policy, but the first error stops the loop.
    UntilError(Box<Policy>),
}

impl Policy {
    pub fn until_error(self) -> Self {
        match self {
            Self::UntilError(_) => self,
            base => Self::UntilError(Box::new(base)),
        }
    }

    /// Decide what follows a cycle. Without [`Policy::UntilError`], errors
    /// are dropped.
    pub fn next(&self, progressed: bool, err: Option<LoopError>) -> Next {
        match self {
            Self::Forever(cooldown) => {
                if progressed {
                    Next::Continue(Duration::ZERO)
                } else {
                    Next::Continue(*cooldown)
                }
            }
            Self::Backlog => {
                if progressed {
                    Next::Continue(Duration::ZERO)
                } else {
                    Next::Stop
                }
            }
            Self::UntilError(base) => match err {
                Some(err) => Next::Fail(err),
                None => base.next(progressed, None),
            },
        }
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Forever(cooldown) => write!(f, "forever:{}", format_duration(*cooldown)),
            Self::Backlog => f.write_str("backlog"),
            Self::UntilError(base) => write!(f, "{base}{UNTIL_ERROR_SUFFIX}"),
        }
    }
}

/// Appended to a base policy to stop the loop on the first error.
const UNTIL_ERROR_SUFFIX: &str = ",until-error";

impl FromStr for Policy {
    type Err = PolicyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(base) = s.strip_suffix(UNTIL_ERROR_SUFFIX) {
            return base.parse::<Self>().map(Self::until_error);
        }
        let (name, param) = match s.split_once(':') {
            Some((name, param)) => (name, Some(param)),
            None => (s, None),
        };
        match name {
            "forever" => match param {
                None | Some("") => Ok(Self::Forever(Duration::ZERO)),
                Some(d) => parse_duration(d).map(Self::Forever),
            },
            "backlog" => match param {
                None => Ok(Self::Backlog),
                Some(_) => Err(PolicyParseError::BacklogParameter),
            },
            _ => Err(PolicyParseError::Unknown(s.to_string())),
        }
    }
}

const NANOS_PER_SEC: u128 = 1_000_000_000;

fn unit_nanos(unit: &str) -> Option<u128> {
    match unit {
        "ns" => Some(1),
        "us" | "µs" => Some(1_000),
        "ms" => Some(1_000_000),
        "s" => Some(NANOS_PER_SEC),
        "m" => Some(60 * NANOS_PER_SEC),
        "h" => Some(3600 * NANOS_PER_SEC),
        _ => None,
    }
}

/// Parse a sequence of `<number><unit>` terms, e.g. `1m30s` or `1.5h`.
pub fn parse_duration(s: &str) -> Result<Duration, PolicyParseError> {
    let invalid = || PolicyParseError::Duration(s.to_string());
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    if s.is_empty() {
        return Err(invalid());
    }

    let mut total: u128 = 0;
    let mut rest = s;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        let (number, tail) = rest.split_at(number_len);
        let unit_len = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, tail) = tail.split_at(unit_len);

        let scale = unit_nanos(unit).ok_or_else(invalid)?;
        let (whole, frac) = number.split_once('.').unwrap_or((number, ""));
        if whole.is_empty() && frac.is_empty() {
            return Err(invalid());
        }
        let whole: u128 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| invalid())?
        };
        let mut nanos = whole.checked_mul(scale).ok_or_else(invalid)?;
        if !frac.is_empty() {
            // Digits beyond nanosecond precision cannot matter.
            let frac = &frac[..frac.len().min(18)];
            let digits: u128 = frac.parse().map_err(|_| invalid())?;
            nanos += digits * scale / 10u128.pow(frac.len() as u32);
        }
        total = total.checked_add(nanos).ok_or_else(invalid)?;
        rest = tail;
    }

    let secs = u64::try_from(total / NANOS_PER_SEC).map_err(|_| invalid())?;
    Ok(Duration::new(secs, (total % NANOS_PER_SEC) as u32))
}

/// Inverse of [`parse_duration`]: `0s`, `500ms`, `30s`, `1m30s`, `2h0m0s`.
pub fn format_duration(d: Duration) -> String {
    if d.is_zero() {
        return "0s".to_string();
    }
    let nanos = d.subsec_nanos();
    if d.as_secs() == 0 {
        return if nanos % 1_000_000 == 0 {
            format!("{}ms", nanos / 1_000_000)
        } else if nanos % 1_000 == 0 {
            format!("{}us", nanos / 1_000)
        } else {
            format!("{nanos}ns")
        };
    }

    let secs = d.as_secs();
    let (hours, minutes, seconds) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    let mut out = String::new();
    if hours > 0 {
        out.push_str(&format!("{hours}h"));
    }
    if hours > 0 || minutes > 0 {
        out.push_str(&format!("{minutes}m"));
    }
    out.push_str(&seconds.to_string());
    if nanos > 0 {
        let frac = format!("{nanos:09}");
        out.push('.');
        out.push_str(frac.trim_end_matches('0'));
    }
    out.push('s');
    out
}
