use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::messages::TimeoutInfo;

/// Single-owner timeout scheduler.
///
/// Holds at most one pending timeout. Scheduling a timeout for an
/// equal-or-newer `(height, round, step)` supersedes the pending one;
/// older requests are ignored. Fired timeouts are delivered on the
/// returned receiver.
pub struct TimeoutTicker {
    schedule_tx: mpsc::UnboundedSender<TimeoutInfo>,
}

impl TimeoutTicker {
    pub fn spawn() -> (Self, mpsc::Receiver<TimeoutInfo>) {
        let (schedule_tx, mut schedule_rx) = mpsc::unbounded_channel::<TimeoutInfo>();
        let (fire_tx, fire_rx) = mpsc::channel(16);

        tokio::spawn(async move {
            let mut pending: Option<(Instant, TimeoutInfo)> = None;

            loop {
                let sleep = async {
                    match &pending {
                        Some((deadline, _)) => tokio::time::sleep_until(*deadline).await,
                        None => std::future::pending().await,
                    }
                };

                tokio::select! {
                    request = schedule_rx.recv() => {
                        let Some(request) = request else { break };

                        let supersedes = match &pending {
                            None => true,
                            Some((_, pending_info)) => {
                                let new_key = (request.height, request.round, request.step);
                                let old_key = (
                                    pending_info.height,
                                    pending_info.round,
                                    pending_info.step,
                                );
                                new_key >= old_key
                            }
                        };
                        if supersedes {
                            trace!(
                                height = %request.height, round = %request.round,
                                step = %request.step, duration = ?request.duration,
                                "Scheduled timeout"
                            );
                            pending = Some((Instant::now() + request.duration, request));
                        }
                    }

                    _ = sleep => {
                        let (_, info) = pending.take().expect("sleep only armed when pending");
                        trace!(
                            height = %info.height, round = %info.round, step = %info.step,
                            "Timeout fired"
                        );
                        if fire_tx.send(info).await.is_err() {
                            break;
                        }
                    }
                }
            }
            debug!("Timeout ticker finished");
        });

        (Self { schedule_tx }, fire_rx)
    }

    pub fn schedule(&self, info: TimeoutInfo) {
        let _ = self.schedule_tx.send(info);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::round_state::RoundStepType;
    use noirbft_core_types::{Height, Round};
    use std::time::Duration;

    fn info(height: u64, round: i32, step: RoundStepType, millis: u64) -> TimeoutInfo {
        TimeoutInfo {
            duration: Duration::from_millis(millis),
            height: Height::new(height),
            round: Round::new(round),
            step,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fires_after_duration() {
        let (ticker, mut fired) = TimeoutTicker::spawn();
        ticker.schedule(info(1, 0, RoundStepType::Propose, 100));

        let out = fired.recv().await.unwrap();
        assert_eq!(out.height, Height::new(1));
        assert_eq!(out.step, RoundStepType::Propose);
    }

    #[tokio::test(start_paused = true)]
    async fn newer_timeout_supersedes_older() {
        let (ticker, mut fired) = TimeoutTicker::spawn();
        ticker.schedule(info(1, 0, RoundStepType::Propose, 1_000));
        // Same height, later step: replaces the pending propose timeout.
        ticker.schedule(info(1, 0, RoundStepType::PrevoteWait, 50));

        let out = fired.recv().await.unwrap();
        assert_eq!(out.step, RoundStepType::PrevoteWait);

        // Nothing else fires afterwards.
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(fired.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn older_request_is_ignored() {
        let (ticker, mut fired) = TimeoutTicker::spawn();
        ticker.schedule(info(5, 2, RoundStepType::Precommit, 50));
        ticker.schedule(info(5, 1, RoundStepType::Propose, 10));

        let out = fired.recv().await.unwrap();
        assert_eq!(out.round, Round::new(2));
        assert_eq!(out.step, RoundStepType::Precommit);
    }
}
