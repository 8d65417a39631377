//! Rolling-window analytics over a scheme's NAV history.
//!
//! For each window length the kernel walks the series once, anchoring every
//! endpoint `j` at the latest point dated at or before `date_j - years`, and
//! collects one rolling-return / CAGR / max-drawdown sample per valid
//! endpoint. Aggregates are persisted per (scheme, window) with availability
//! fields always filled, metrics NULL when the window produced no periods.

use anyhow::bail;
use chrono::{Months, NaiveDate};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use sqlx::PgPool;

use crate::db::queries;

#[derive(Debug, Clone, Copy)]
pub struct WindowSpec {
    pub label: &'static str,
    pub years: u32,
}

pub const DEFAULT_WINDOWS: [WindowSpec; 4] = [
    WindowSpec { label: "1Y", years: 1 },
    WindowSpec { label: "3Y", years: 3 },
    WindowSpec { label: "5Y", years: 5 },
    WindowSpec { label: "10Y", years: 10 },
];

#[derive(Debug, Clone, Copy)]
struct Point {
    date: NaiveDate,
    nav: f64,
}

#[derive(Debug, Default)]
struct WindowStats {
    rolling_periods: i32,
    rolling_min: Option<Decimal>,
    rolling_max: Option<Decimal>,
    rolling_median: Option<Decimal>,
    rolling_p25: Option<Decimal>,
    rolling_p75: Option<Decimal>,
    max_drawdown: Option<Decimal>,
    cagr_min: Option<Decimal>,
    cagr_max: Option<Decimal>,
    cagr_median: Option<Decimal>,
}

/// Recompute analytics for every window of one scheme and upsert the rows.
///
/// A window without enough history still gets a row: availability fields
/// populated, `rolling_periods = 0`, all metrics NULL.
pub async fn compute_and_upsert(pool: &PgPool, scheme_code: &str) -> anyhow::Result<()> {
    let rows = queries::list_nav_history(pool, scheme_code).await?;
    if rows.is_empty() {
        bail!("no nav history for scheme_code={scheme_code}");
    }

    let mut pts: Vec<Point> = rows
        .iter()
        .filter_map(|r| {
            let nav = r.nav_value.to_f64()?;
            (nav.is_finite() && nav > 0.0).then_some(Point {
                date: r.nav_date,
                nav,
            })
        })
        .collect();
    if pts.len() < 2 {
        bail!("insufficient usable nav points for scheme_code={scheme_code}");
    }
    pts.sort_by_key(|p| p.date);

    let start_date = pts[0].date;
    let end_date = pts[pts.len() - 1].date;

    for w in DEFAULT_WINDOWS {
        let stats = compute_window(&pts, w.years);
        queries::upsert_fund_analytics(
            pool,
            scheme_code,
            w.label,
            stats.rolling_min,
            stats.rolling_max,
            stats.rolling_median,
            stats.rolling_p25,
            stats.rolling_p75,
            stats.max_drawdown,
            stats.cagr_min,
            stats.cagr_max,
            stats.cagr_median,
            start_date,
            end_date,
            pts.len() as i32,
            stats.rolling_periods,
        )
        .await?;
    }

    Ok(())
}

fn compute_window(pts: &[Point], years: u32) -> WindowStats {
    let mut returns: Vec<f64> = Vec::with_capacity(pts.len());
    let mut cagrs: Vec<f64> = Vec::with_capacity(pts.len());
    let mut worst_drawdown = f64::INFINITY;

    // i trails j: the latest index whose date is at or before date_j - years.
    let mut i = 0usize;
    for j in 0..pts.len() {
        let Some(start_need) = pts[j].date.checked_sub_months(Months::new(years * 12)) else {
            continue;
        };
        while i + 1 < j && pts[i + 1].date <= start_need {
            i += 1;
        }

        // The window only counts if the series actually reaches back to it.
        if pts[0].date > start_need {
            continue;
        }
        if i >= j {
            continue;
        }

        let start_nav = pts[i].nav;
        let end_nav = pts[j].nav;
        if start_nav <= 0.0 || end_nav <= 0.0 {
            continue;
        }

        returns.push((end_nav / start_nav - 1.0) * 100.0);

        let cagr = ((end_nav / start_nav).powf(1.0 / f64::from(years)) - 1.0) * 100.0;
        if cagr.is_finite() {
            cagrs.push(cagr);
        }

        let dd = max_drawdown_pct(&pts[i..=j]);
        if dd < worst_drawdown {
            worst_drawdown = dd;
        }
    }

    let mut stats = WindowStats {
        rolling_periods: returns.len() as i32,
        ..WindowStats::default()
    };
    if returns.is_empty() {
        return stats;
    }

    returns.sort_by(|a, b| a.total_cmp(b));
    stats.rolling_min = round2(returns[0]);
    stats.rolling_max = round2(returns[returns.len() - 1]);
    stats.rolling_p25 = round2(percentile_sorted(&returns, 0.25));
    stats.rolling_median = round2(percentile_sorted(&returns, 0.50));
    stats.rolling_p75 = round2(percentile_sorted(&returns, 0.75));

    if worst_drawdown.is_finite() {
        stats.max_drawdown = round2(worst_drawdown);
    }

    if !cagrs.is_empty() {
        cagrs.sort_by(|a, b| a.total_cmp(b));
        stats.cagr_min = round2(cagrs[0]);
        stats.cagr_max = round2(cagrs[cagrs.len() - 1]);
        stats.cagr_median = round2(percentile_sorted(&cagrs, 0.50));
    }

    stats
}

/// Worst percent drop from a running peak within the slice.
fn max_drawdown_pct(window: &[Point]) -> f64 {
    let mut peak = window[0].nav;
    let mut worst = 0.0f64;
    for p in window {
        if p.nav > peak {
            peak = p.nav;
        }
        if peak <= 0.0 {
            continue;
        }
        let dd = (p.nav / peak - 1.0) * 100.0;
        if dd < worst {
            worst = dd;
        }
    }
    worst
}

/// Linear-interpolated percentile over an already-sorted slice.
fn percentile_sorted(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    if p <= 0.0 {
        return sorted[0];
    }
    if p >= 1.0 {
        return sorted[sorted.len() - 1];
    }

    let pos = p * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    if lo == hi {
        return sorted[lo];
    }
    let frac = pos - lo as f64;
    sorted[lo] * (1.0 - frac) + sorted[hi] * frac
}

/// Metrics persist as NUMERIC(6,2); round before they leave the kernel.
fn round2(v: f64) -> Option<Decimal> {
    Decimal::from_f64(v).map(|d| d.round_dp(2))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn pt(date: NaiveDate, nav: f64) -> Point {
        Point { date, nav }
    }

    #[test]
    fn max_drawdown_finds_peak_to_trough() {
        let pts = [
            pt(d(2020, 1, 1), 100.0),
            pt(d(2020, 1, 2), 120.0),
            pt(d(2020, 1, 3), 90.0),
            pt(d(2020, 1, 4), 110.0),
        ];
        // peak 120 -> trough 90 => -25%
        assert!((max_drawdown_pct(&pts) - (-25.0)).abs() < 1e-9);
    }

    #[test]
    fn max_drawdown_is_zero_for_monotonic_series() {
        let pts = [
            pt(d(2020, 1, 1), 100.0),
            pt(d(2020, 1, 2), 105.0),
            pt(d(2020, 1, 3), 111.0),
        ];
        assert_eq!(max_drawdown_pct(&pts), 0.0);
    }

    #[test]
    fn percentiles_interpolate_linearly() {
        let x = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(percentile_sorted(&x, 0.50), 2.5);
        assert_eq!(percentile_sorted(&x, 0.25), 1.75);
        assert_eq!(percentile_sorted(&x, 0.75), 3.25);
        assert_eq!(percentile_sorted(&x, 0.0), 1.0);
        assert_eq!(percentile_sorted(&x, 1.0), 4.0);
    }

    #[test]
    fn one_year_window_collects_expected_periods() {
        let pts = [
            pt(d(2020, 1, 1), 100.0),
            pt(d(2020, 7, 1), 110.0),
            pt(d(2021, 1, 1), 120.0),
            pt(d(2021, 7, 1), 130.0),
        ];
        let stats = compute_window(&pts, 1);

        // Endpoints 2021-01-01 (anchored at 2020-01-01) and 2021-07-01
        // (anchored at 2020-07-01) qualify; the first two reach too far back.
        assert_eq!(stats.rolling_periods, 2);
        assert_eq!(stats.rolling_min, Some(dec!(18.18)));
        assert_eq!(stats.rolling_max, Some(dec!(20.00)));
        assert_eq!(stats.rolling_median, Some(dec!(19.09)));
        // Monotonic navs: no drawdown anywhere.
        assert_eq!(stats.max_drawdown, Some(dec!(0.00)));
        // 1Y CAGR equals the rolling return.
        assert_eq!(stats.cagr_min, Some(dec!(18.18)));
        assert_eq!(stats.cagr_max, Some(dec!(20.00)));
    }

    #[test]
    fn window_longer_than_history_has_zero_periods() {
        let pts = [
            pt(d(2023, 1, 1), 100.0),
            pt(d(2023, 6, 1), 105.0),
            pt(d(2023, 12, 1), 103.0),
        ];
        let stats = compute_window(&pts, 5);
        assert_eq!(stats.rolling_periods, 0);
        assert!(stats.rolling_min.is_none());
        assert!(stats.rolling_median.is_none());
        assert!(stats.max_drawdown.is_none());
        assert!(stats.cagr_median.is_none());
    }

    #[test]
    fn drawdown_within_rolling_window_is_captured() {
        let pts = [
            pt(d(2020, 1, 1), 100.0),
            pt(d(2020, 6, 1), 120.0),
            pt(d(2020, 9, 1), 90.0),
            pt(d(2021, 1, 1), 110.0),
        ];
        let stats = compute_window(&pts, 1);
        assert_eq!(stats.rolling_periods, 1);
        assert_eq!(stats.max_drawdown, Some(dec!(-25.00)));
        assert_eq!(stats.rolling_min, Some(dec!(10.00)));
    }

    #[test]
    fn percentile_ordering_holds_on_larger_series() {
        // Two years of monthly points with alternating moves.
        let mut pts = Vec::new();
        let mut nav = 100.0;
        for k in 0..25u32 {
            let date = d(2020, 1, 1)
                .checked_add_months(Months::new(k))
                .unwrap();
            nav *= if k % 2 == 0 { 1.04 } else { 0.99 };
            pts.push(pt(date, nav));
        }
        let stats = compute_window(&pts, 1);
        assert!(stats.rolling_periods > 0);

        let min = stats.rolling_min.unwrap();
        let p25 = stats.rolling_p25.unwrap();
        let med = stats.rolling_median.unwrap();
        let p75 = stats.rolling_p75.unwrap();
        let max = stats.rolling_max.unwrap();
        assert!(min <= p25 && p25 <= med && med <= p75 && p75 <= max);
        assert!(stats.max_drawdown.unwrap() <= dec!(0));
    }
}
