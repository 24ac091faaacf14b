//! ReaperLoop - タイムアウトしたメッセージの回収
//!
//! # フロー
//! 1. 一定間隔（デフォルト 10s）で `Topic::check_retry_jobs(now)` を呼ぶ
//! 2. タイムアウトしたものは PENDING に戻して再投入、予算切れは FAILURE
//!
//! ワーカーの heartbeat は無い。死んだワーカーが持っていたジョブはここでしか戻らない。

use std::sync::Weak;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::queue::Topic;

pub struct ReaperLoop {
    topic: Weak<Topic>,
    interval: Duration,
    token: CancellationToken,
}

impl ReaperLoop {
    pub fn new(topic: Weak<Topic>, interval: Duration, token: CancellationToken) -> Self {
        Self {
            topic,
            interval,
            token,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // 最初の tick は即時なので捨てる
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let Some(topic) = self.topic.upgrade() else {
                break;
            };
            if topic.is_closed() {
                break;
            }
            if let Err(e) = topic.check_retry_jobs(Utc::now()) {
                error!(topic = topic.name(), error = %e, "retry check failed");
            }
        }
        debug!("reaper loop stopped");
    }
}
