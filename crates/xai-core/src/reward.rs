//! Block subsidy schedule and supply accounting.
//!
//! The subsidy is read from the network's [`subsidy_schedule`]
//! (height → amount, halving steps); the genesis block mints nothing. The
//! `max_supply` cap truncates the final block that would cross it, so the
//! cumulative sum of subsidies never exceeds the cap.
//!
//! [`subsidy_schedule`]: crate::params::NetworkParams::subsidy_schedule

use crate::params::NetworkParams;

/// Scheduled subsidy for `height`, before the supply cap.
fn scheduled_subsidy(params: &NetworkParams, height: u64) -> u64 {
    if height == 0 {
        return 0;
    }
    params
        .subsidy_schedule
        .iter()
        .rev()
        .find(|step| step.start_height <= height)
        .map(|step| step.subsidy)
        .unwrap_or(0)
}

/// Total subsidy minted for all heights strictly below `height`, saturating,
/// truncated at the supply cap. Closed-form over the schedule steps.
pub fn cumulative_supply_before(params: &NetworkParams, height: u64) -> u64 {
    let mut total: u64 = 0;
    for (i, step) in params.subsidy_schedule.iter().enumerate() {
        if step.start_height >= height {
            break;
        }
        let end = params
            .subsidy_schedule
            .get(i + 1)
            .map(|next| next.start_height)
            .unwrap_or(u64::MAX)
            .min(height);
        let count = end - step.start_height;
        total = total.saturating_add(step.subsidy.saturating_mul(count));
        if total >= params.max_supply {
            return params.max_supply;
        }
    }
    total.min(params.max_supply)
}

/// The subsidy the coinbase at `height` must mint: the scheduled amount,
/// reduced if minting it in full would cross `max_supply`.
pub fn block_subsidy(params: &NetworkParams, height: u64) -> u64 {
    let scheduled = scheduled_subsidy(params, height);
    let minted = cumulative_supply_before(params, height);
    scheduled.min(params.max_supply.saturating_sub(minted))
}
