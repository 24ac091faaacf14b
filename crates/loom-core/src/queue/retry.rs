//! Retry policy: decides timeout-driven redelivery.

use chrono::{DateTime, Utc};

use crate::domain::Retry;

/// Outcome of one scanner pass over one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryVerdict {
    /// Nothing to do yet (or no policy).
    Skip,
    /// Counter bumped; put back to PENDING and enqueue.
    Requeue,
    /// Budget used up; the message becomes FAILURE.
    Exhausted,
}

/// Evaluate the job-level retry policy at `now`.
///
/// `num_retry` と `checked_time` はここでだけ更新される。
/// - `number == 0` か timeout 無しなら何もしない
/// - 既に `num_retry >= number` なら Exhausted
/// - 最後のチェック（初回は created）から timeout を過ぎていたらカウンタを進める
pub fn evaluate(retry: &mut Retry, created: DateTime<Utc>, now: DateTime<Utc>) -> RetryVerdict {
    let Some(timeout) = retry.timeout else {
        return RetryVerdict::Skip;
    };
    if retry.number == 0 {
        return RetryVerdict::Skip;
    }
    if retry.is_exhausted() {
        return RetryVerdict::Exhausted;
    }

    let Ok(timeout) = chrono::Duration::from_std(timeout) else {
        return RetryVerdict::Skip;
    };
    let last = retry.checked_time.unwrap_or(created);
    if now - last <= timeout {
        return RetryVerdict::Skip;
    }

    retry.num_retry += 1;
    retry.checked_time = Some(now);
    if retry.is_exhausted() {
        RetryVerdict::Exhausted
    } else {
        RetryVerdict::Requeue
    }
}
