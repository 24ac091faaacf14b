//! IdGenerator port - ID 生成の抽象化
//!
//! # 実装
//! - **SnowflakeGenerator**: 時刻 + インスタンス番号 + シーケンスの 64-bit 値
//!
//! レイアウト: `(ms since 2010-11-04T01:42:54.657Z) << 22 | instance << 12 | sequence`

use std::sync::Mutex;

use thiserror::Error;

use crate::domain::MessageId;
use crate::ports::Clock;

/// Custom epoch in unix milliseconds.
pub const TWEPOCH_MS: i64 = 1_288_834_974_657;

const INSTANCE_BITS: u32 = 10;
const SEQUENCE_BITS: u32 = 12;
pub const MAX_INSTANCE_ID: u16 = (1 << INSTANCE_BITS) - 1;
const SEQUENCE_MASK: u16 = (1 << SEQUENCE_BITS) - 1;
const TIMESTAMP_SHIFT: u32 = INSTANCE_BITS + SEQUENCE_BITS;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdError {
    #[error("clock moved backwards: last={last_ms}ms now={now_ms}ms")]
    ClockMovedBackwards { last_ms: i64, now_ms: i64 },

    #[error("sequence exhausted for {0}ms")]
    SequenceExhausted(i64),

    #[error("clock is before the id epoch")]
    BeforeEpoch,

    #[error("instance id {0} exceeds {MAX_INSTANCE_ID}")]
    InstanceOutOfRange(u16),
}

/// IdGenerator は衝突しない MessageId を生成
///
/// # 契約
/// - 同じ generator からの ID は一意で、辞書順に非減少
/// - 時計が戻ったら失敗する（過去の ID を再利用しない）
pub trait IdGenerator: Send + Sync {
    fn new_id(&self) -> Result<MessageId, IdError>;
}

#[derive(Debug, Default)]
struct SnowflakeState {
    last_ms: i64,
    sequence: u16,
}

/// Snowflake 方式の生成器。状態は内部の Mutex で直列化される。
pub struct SnowflakeGenerator<C> {
    clock: C,
    instance: u16,
    state: Mutex<SnowflakeState>,
}

impl<C: Clock> SnowflakeGenerator<C> {
    pub fn new(clock: C, instance: u16) -> Result<Self, IdError> {
        if instance > MAX_INSTANCE_ID {
            return Err(IdError::InstanceOutOfRange(instance));
        }
        Ok(Self {
            clock,
            instance,
            state: Mutex::new(SnowflakeState::default()),
        })
    }
}

impl<C: Clock> IdGenerator for SnowflakeGenerator<C> {
    fn new_id(&self) -> Result<MessageId, IdError> {
        let now_ms = self.clock.now().timestamp_millis() - TWEPOCH_MS;
        if now_ms < 0 {
            return Err(IdError::BeforeEpoch);
        }

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if now_ms < state.last_ms {
            return Err(IdError::ClockMovedBackwards {
                last_ms: state.last_ms,
                now_ms,
            });
        }

        if now_ms == state.last_ms {
            // 同じ ms 内で 4096 個を使い切ったら呼び出し側で待ってもらう
            if state.sequence == SEQUENCE_MASK {
                return Err(IdError::SequenceExhausted(now_ms));
            }
            state.sequence += 1;
        } else {
            state.sequence = 0;
        }
        state.last_ms = now_ms;

        let raw = ((now_ms as u64) << TIMESTAMP_SHIFT)
            | (u64::from(self.instance) << SEQUENCE_BITS)
            | u64::from(state.sequence);
        Ok(MessageId::from_u64(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{FixedClock, SystemClock};
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;

    #[test]
    fn ids_are_unique_and_ordered() {
        let id_gen = SnowflakeGenerator::new(SystemClock, 1).unwrap();

        let mut ids = Vec::new();
        while ids.len() < 10_000 {
            match id_gen.new_id() {
                Ok(id) => ids.push(id),
                Err(IdError::SequenceExhausted(_)) => std::thread::yield_now(),
                Err(e) => panic!("unexpected {e}"),
            }
        }

        for pair in ids.windows(2) {
            assert!(pair[0] < pair[1], "{} !< {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn layout_carries_instance_and_sequence() {
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let id_gen = SnowflakeGenerator::new(FixedClock::new(t), 7).unwrap();

        let first = id_gen.new_id().unwrap().as_u64();
        let second = id_gen.new_id().unwrap().as_u64();

        assert_eq!((first >> 12) & 0x3ff, 7);
        assert_eq!(first & 0xfff, 0);
        assert_eq!(second & 0xfff, 1);
        assert_eq!(
            (first >> 22) as i64,
            t.timestamp_millis() - TWEPOCH_MS
        );
    }

    #[test]
    fn fails_when_clock_moves_backwards() {
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let clock = Arc::new(FixedClock::new(t));
        let id_gen = SnowflakeGenerator::new(Arc::clone(&clock), 1).unwrap();

        id_gen.new_id().unwrap();
        clock.advance(chrono::Duration::milliseconds(-5));

        assert!(matches!(
            id_gen.new_id(),
            Err(IdError::ClockMovedBackwards { .. })
        ));
    }

    #[test]
    fn fails_when_sequence_is_exhausted() {
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let clock = Arc::new(FixedClock::new(t));
        let id_gen = SnowflakeGenerator::new(Arc::clone(&clock), 1).unwrap();

        for _ in 0..4096 {
            id_gen.new_id().unwrap();
        }
        assert!(matches!(id_gen.new_id(), Err(IdError::SequenceExhausted(_))));

        clock.advance(chrono::Duration::milliseconds(1));
        assert!(id_gen.new_id().is_ok());
    }

    #[test]
    fn rejects_out_of_range_instance() {
        assert!(SnowflakeGenerator::new(SystemClock, 1024).is_err());
    }
}
