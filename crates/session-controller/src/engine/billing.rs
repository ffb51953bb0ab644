//! Per-minute billing arithmetic.
//!
//! Amounts are currency units with two decimals; durations are milliseconds.
//! Nothing here touches the store.

pub const MS_PER_MINUTE: i64 = 60_000;

/// Warning window before a session runs out of balance.
pub const LOW_BALANCE_WINDOW_MS: i64 = 60_000;

/// Upper bound on the session length a balance can buy. Leaves headroom for
/// adding it to any epoch-millisecond timestamp.
pub const MAX_AFFORDABLE_MS: i64 = i64::MAX / 4;

/// Outcome of billing an occupancy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Usage {
    pub elapsed_ms: i64,
    /// Full amount for the elapsed time.
    pub amount: f64,
    /// Balance after the charge, never negative.
    pub updated_balance: f64,
    /// Part of `amount` the balance did not cover.
    pub shortfall: f64,
}

#[must_use]
pub fn round_money(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Per-minute rate after the offer discount.
///
/// A non-positive rate is treated as 1 so the result can be used as a divisor.
#[must_use]
pub fn discounted_rate(rate: f64, offer_percent: f64) -> f64 {
    let rate = if rate <= 0.0 { 1.0 } else { rate };
    rate - rate * offer_percent / 100.0
}

/// Balance needed to join an online waitlist: `minutes` at the discounted rate.
#[must_use]
pub fn minimum_balance(rate: f64, offer_percent: f64, minutes: i64) -> f64 {
    let minutes = minutes as f64;
    let minimum = rate * minutes - (offer_percent / 100.0) * rate * minutes;
    round_money(minimum.max(0.0))
}

/// Milliseconds of session the balance pays for.
#[must_use]
pub fn affordable_ms(balance: f64, discounted_rate: f64) -> i64 {
    if discounted_rate <= 0.0 || balance <= 0.0 {
        return 0;
    }
    let ms = (balance / discounted_rate * MS_PER_MINUTE as f64).floor();
    if ms >= MAX_AFFORDABLE_MS as f64 {
        MAX_AFFORDABLE_MS
    } else {
        ms as i64
    }
}

/// When the balance runs out if the session starts at `now_ms`.
#[must_use]
pub fn tentative_end(now_ms: i64, balance: f64, discounted_rate: f64) -> i64 {
    now_ms.saturating_add(affordable_ms(balance, discounted_rate))
}

/// Bill `elapsed_ms` of session against `balance`.
#[must_use]
pub fn usage(elapsed_ms: i64, discounted_rate: f64, balance: f64) -> Usage {
    let elapsed_ms = elapsed_ms.max(0);
    let amount = round_money(elapsed_ms as f64 / MS_PER_MINUTE as f64 * discounted_rate);
    let updated_balance = round_money((balance - amount).max(0.0));
    let shortfall = round_money((amount - balance.max(0.0)).max(0.0));

    Usage {
        elapsed_ms,
        amount,
        updated_balance,
        shortfall,
    }
}

/// Delay before the next balance check: one minute before the end, capped at
/// `max_interval_ms`, never negative.
#[must_use]
pub fn balance_check_delay(remaining_ms: i64, max_interval_ms: i64) -> i64 {
    (remaining_ms - LOW_BALANCE_WINDOW_MS).clamp(0, max_interval_ms.max(0))
}

/// How far a top-up pushes the tentative end.
#[must_use]
pub fn top_up_extension_ms(amount: f64, discounted_rate: f64) -> i64 {
    affordable_ms(amount, discounted_rate)
}
