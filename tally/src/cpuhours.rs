//! CPU-hour arithmetic for finished jobs.
//!
//! A job's consumption over a window is `millicores × hours / 1000`,
//! computed in decimal. The window starts at the later of the job's start
//! instant and its last usage update, so repeated calculations for the
//! same job never double-count time.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::error::{Result, UsageError};
use crate::jobs::JobId;
use crate::totals::UserId;

const MILLIS_PER_HOUR: i64 = 3_600_000;
const MILLICORES_PER_CORE: i64 = 1000;

/// Outcome of a usage calculation for one job.
#[derive(Clone, Debug)]
pub struct UsageCalculation {
    pub job: JobId,
    pub user: UserId,
    pub millicores: i64,
    pub cpu_hours: Decimal,
    /// Start of the accounted window.
    pub basis: DateTime<Utc>,
    /// End of the accounted window; becomes the job's new
    /// `usage_last_update`.
    pub calc: DateTime<Utc>,
}

/// The instant accounting starts from: the later of the job's start date
/// and its last usage update.
pub fn usage_basis(
    start: DateTime<Utc>,
    usage_last_update: Option<DateTime<Utc>>,
) -> DateTime<Utc> {
    match usage_last_update {
        Some(last) if last > start => last,
        _ => start,
    }
}

/// CPU hours consumed by `millicores` between `basis` and `calc`.
///
/// A window of zero (or negative, if the basis already passed the end)
/// length yields zero. Arithmetic is checked; overflow is reported as
/// [`UsageError::Arithmetic`].
pub fn cpu_hours(
    millicores: i64,
    basis: DateTime<Utc>,
    calc: DateTime<Utc>,
) -> Result<Decimal> {
    if calc <= basis {
        return Ok(Decimal::ZERO);
    }

    let window_ms = (calc - basis).num_milliseconds();
    let hours = Decimal::from(window_ms)
        .checked_div(Decimal::from(MILLIS_PER_HOUR))
        .ok_or_else(|| {
            UsageError::Arithmetic("window duration division failed".into())
        })?;

    Decimal::from(millicores)
        .checked_mul(hours)
        .and_then(|core_ms| core_ms.checked_div(Decimal::from(MILLICORES_PER_CORE)))
        .ok_or_else(|| {
            UsageError::Arithmetic(format!(
                "cpu-hour product overflowed for {millicores} millicores over {hours} hours"
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instant(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn two_cores_for_two_hours_is_four_cpu_hours() {
        let start = instant("2024-01-01T00:00:00Z");
        let end = instant("2024-01-01T02:00:00Z");
        let hours = cpu_hours(2000, start, end).unwrap();
        assert_eq!(hours, Decimal::from(4));
    }

    #[test]
    fn basis_prefers_later_usage_update() {
        let start = instant("2024-01-01T00:00:00Z");
        let later = instant("2024-01-01T01:00:00Z");
        assert_eq!(usage_basis(start, Some(later)), later);
        assert_eq!(usage_basis(later, Some(start)), later);
        assert_eq!(usage_basis(start, None), start);
    }

    #[test]
    fn zero_length_window_is_zero() {
        let t = instant("2024-01-01T00:00:00Z");
        assert_eq!(cpu_hours(2000, t, t).unwrap(), Decimal::ZERO);
    }

    #[test]
    fn inverted_window_is_zero() {
        let start = instant("2024-01-01T02:00:00Z");
        let end = instant("2024-01-01T00:00:00Z");
        assert_eq!(cpu_hours(2000, start, end).unwrap(), Decimal::ZERO);
    }

    #[test]
    fn zero_millicores_is_zero() {
        let start = instant("2024-01-01T00:00:00Z");
        let end = instant("2024-01-01T08:00:00Z");
        assert_eq!(cpu_hours(0, start, end).unwrap(), Decimal::ZERO);
    }

    #[test]
    fn fractional_hours_stay_exact() {
        let start = instant("2024-01-01T00:00:00Z");
        let end = instant("2024-01-01T00:30:00Z");
        // 500 millicores for half an hour: 0.25 cpu-hours.
        let hours = cpu_hours(500, start, end).unwrap();
        assert_eq!(hours, "0.25".parse::<Decimal>().unwrap());
    }
}
