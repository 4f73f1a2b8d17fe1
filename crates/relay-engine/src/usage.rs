//! Usage reconciliation.
//!
//! Upstreams disagree on what they report: some omit usage entirely, some
//! report only a total. Settlement always works from a complete [`Usage`].

use relay_core::Usage;

/// Fill in whatever the upstream left out.
///
/// - no report: the prompt estimate plus `completion_estimate()`
/// - a total without a prompt split: the prompt is taken from the estimate
///   (capped at the total) and the rest is completion
pub fn reconcile_usage(
    reported: Option<Usage>,
    prompt_estimate: u32,
    completion_estimate: impl FnOnce() -> u32,
) -> Usage {
    let Some(mut usage) = reported else {
        return Usage::new(prompt_estimate, completion_estimate());
    };

    if usage.prompt_tokens == 0 && usage.total_tokens > 0 {
        usage.prompt_tokens = prompt_estimate.min(usage.total_tokens);
        usage.completion_tokens = usage.total_tokens - usage.prompt_tokens;
    }
    let sum = usage.prompt_tokens + usage.completion_tokens;
    if usage.total_tokens < sum {
        usage.total_tokens = sum;
    }
    usage
}
