//! 주기적 업데이트 스케줄러
//!
//! 시작 즉시 한 번, 이후 고정 주기마다 [`RuleUpdater::run_cycle`]을 실행합니다.
//! 대기 중에만 취소 토큰을 확인하므로 진행 중인 사이클은 끝까지 실행됩니다.
//! 사이클 에러는 로그만 남기고 루프를 종료하지 않습니다.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::listing::ListingFetcher;
use crate::updater::{RuleUpdater, UpdateOutcome};

/// 업데이트 스케줄러
pub struct UpdateScheduler<F> {
    updater: RuleUpdater<F>,
    interval: Duration,
}

impl<F: ListingFetcher> UpdateScheduler<F> {
    /// 스케줄러를 생성합니다.
    pub fn new(updater: RuleUpdater<F>, interval: Duration) -> Self {
        Self { updater, interval }
    }

    /// 취소될 때까지 업데이트 루프를 실행하고 실행한 사이클 수를 반환합니다.
    pub async fn run(self, cancel: CancellationToken) -> u64 {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval_secs = self.interval.as_secs(), "rule update scheduler started");

        let mut cycles: u64 = 0;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            cycles += 1;
            match self.updater.run_cycle().await {
                Ok(UpdateOutcome::Installed { checksum, version, .. }) => {
                    info!(cycle = cycles, %checksum, %version, "update cycle installed new rules");
                }
                Ok(outcome) => {
                    info!(cycle = cycles, ?outcome, "update cycle finished");
                }
                Err(e) => {
                    error!(cycle = cycles, error = %e, "update cycle failed, will retry next interval");
                }
            }
        }

        info!(cycles, "rule update scheduler stopped");
        cycles
    }

    /// 백그라운드 태스크로 실행합니다.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<u64> {
        tokio::spawn(self.run(cancel))
    }
}
