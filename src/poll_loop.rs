use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::detector::TransferDetector;
use crate::notifier::Notifier;
use crate::source::ChainSource;
use crate::watchlist::WatchList;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleSummary {
    pub polled: usize,
    pub failed: usize,
    pub detected: usize,
    pub delivered: usize,
}

/// Polls every watched address in list order, then sleeps, until cancelled.
pub struct PollLoop<S> {
    detector: TransferDetector<S>,
    notifier: Arc<dyn Notifier>,
    watchlist: Arc<WatchList>,
    interval: Duration,
}

impl<S: ChainSource> PollLoop<S> {
    pub fn new(
        detector: TransferDetector<S>,
        notifier: Arc<dyn Notifier>,
        watchlist: Arc<WatchList>,
        interval: Duration,
    ) -> Self {
        Self {
            detector,
            notifier,
            watchlist,
            interval,
        }
    }

    pub fn detector(&self) -> &TransferDetector<S> {
        &self.detector
    }

    /// One pass over the watch list. A failing address is logged and skipped;
    /// cancellation abandons the in-flight address and ends the pass early.
    pub async fn run_cycle(&mut self, shutdown: &CancellationToken) -> CycleSummary {
        let mut summary = CycleSummary::default();
        let watchlist = Arc::clone(&self.watchlist);

        for entry in watchlist.iter() {
            let result = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    debug!("Shutdown requested while polling {:?}", entry.address);
                    break;
                }
                result = self.detector.poll(entry.address) => result,
            };
            summary.polled += 1;

            match result {
                Ok(transfers) => {
                    summary.detected += transfers.len();
                    for transfer in &transfers {
                        if self.notifier.notify(transfer, entry).await {
                            summary.delivered += 1;
                        }
                    }
                }
                Err(e) => {
                    summary.failed += 1;
                    warn!(
                        "Polling {} ({:?}) failed, retrying next cycle: {}",
                        entry.nickname, entry.address, e
                    );
                }
            }
        }

        summary
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(
            "Watching {} address(es) every {} seconds",
            self.watchlist.len(),
            self.interval.as_secs()
        );

        loop {
            let cycle_start = Instant::now();
            let summary = self.run_cycle(&shutdown).await;
            info!(
                "Cycle finished in {:?}: {} polled, {} failed, {} detected, {} delivered",
                cycle_start.elapsed(),
                summary.polled,
                summary.failed,
                summary.detected,
                summary.delivered
            );

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = sleep(self.interval) => {}
            }
        }

        info!("Poll loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::DetectorSettings;
    use crate::error::WatchError;
    use crate::notifier::recording::RecordingNotifier;
    use crate::source::MockChainSource;
    use crate::source::fake::FakeChain;
    use crate::watchlist::WatchedEntry;
    use alloy_primitives::{Address, U256};

    const ALICE: Address = Address::repeat_byte(0xaa);
    const BOB: Address = Address::repeat_byte(0xbb);
    const CAROL: Address = Address::repeat_byte(0xcc);
    const OUTSIDER: Address = Address::repeat_byte(0x11);
    const TKN: Address = Address::repeat_byte(0x70);

    fn watchlist() -> Arc<WatchList> {
        Arc::new(
            [(ALICE, "alice"), (BOB, "bob"), (CAROL, "carol")]
                .into_iter()
                .map(|(address, nickname)| WatchedEntry {
                    address,
                    nickname: nickname.to_string(),
                })
                .collect(),
        )
    }

    fn settings() -> DetectorSettings {
        DetectorSettings {
            confirmations: 0,
            overlap_blocks: 0,
            ..DetectorSettings::default()
        }
    }

    fn poll_loop<S: ChainSource>(source: S, notifier: Arc<RecordingNotifier>) -> PollLoop<S> {
        let watchlist = watchlist();
        let detector = TransferDetector::new(source, watchlist.clone(), settings());
        PollLoop::new(detector, notifier, watchlist, Duration::from_millis(10))
    }

    #[tokio::test]
    async fn failing_address_does_not_block_the_others() {
        let chain = Arc::new(FakeChain::with_head(100));
        chain.set_token(TKN, Some("TKN"), Some(18));
        let notifier = Arc::new(RecordingNotifier::default());
        let mut poll_loop = poll_loop(chain.clone(), notifier.clone());
        let shutdown = CancellationToken::new();

        // seed every cursor
        poll_loop.run_cycle(&shutdown).await;

        for (i, address) in [ALICE, BOB, CAROL].into_iter().enumerate() {
            let one_token = U256::from(1_000_000_000_000_000_000u128);
            chain.push_token_transfer(TKN, OUTSIDER, address, one_token, 101, i as u8 + 1, 0);
        }
        chain.set_head(101);
        chain.make_unavailable(BOB);

        let summary = poll_loop.run_cycle(&shutdown).await;

        assert_eq!(summary.polled, 3);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.delivered, 2);
        let messages = notifier.messages();
        assert_eq!(messages.len(), 2);
        assert!(messages[0].starts_with("alice ("));
        assert!(messages[0].contains("received 1.0 TKN from 0x1111111111111111111111111111111111111111"));
        assert!(messages[1].starts_with("carol ("));

        chain.make_available(BOB);
        poll_loop.run_cycle(&shutdown).await;
        let messages = notifier.messages();
        assert_eq!(messages.len(), 3);
        assert!(messages[2].starts_with("bob ("));
    }

    #[tokio::test]
    async fn delivery_failure_does_not_stop_later_notifications() {
        let chain = Arc::new(FakeChain::with_head(100));
        let notifier = Arc::new(RecordingNotifier::failing_on("alice"));
        let mut poll_loop = poll_loop(chain.clone(), notifier.clone());
        let shutdown = CancellationToken::new();
        poll_loop.run_cycle(&shutdown).await;

        chain.push_native_transfer(OUTSIDER, ALICE, 1_000_000_000_000_000_000, 101, 1);
        chain.push_native_transfer(OUTSIDER, CAROL, 2_000_000_000_000_000_000, 101, 2);
        chain.set_head(101);

        let summary = poll_loop.run_cycle(&shutdown).await;

        assert_eq!(summary.detected, 2);
        assert_eq!(summary.delivered, 1);
        assert_eq!(notifier.messages().len(), 1);
        assert!(notifier.messages()[0].contains("carol"));
    }

    #[tokio::test]
    async fn unreachable_node_fails_every_address_but_finishes_the_cycle() {
        let mut source = MockChainSource::new();
        source
            .expect_latest_block()
            .times(3)
            .returning(|| Err(WatchError::SourceUnavailable("connection refused".into())));
        source.expect_fetch_native_transfers().never();
        source.expect_fetch_token_transfers().never();

        let notifier = Arc::new(RecordingNotifier::default());
        let mut poll_loop = poll_loop(source, notifier.clone());

        let summary = poll_loop.run_cycle(&CancellationToken::new()).await;

        assert_eq!(summary.polled, 3);
        assert_eq!(summary.failed, 3);
        assert!(notifier.messages().is_empty());
    }

    #[tokio::test]
    async fn cancelled_token_stops_the_loop() {
        let chain = Arc::new(FakeChain::with_head(100));
        let notifier = Arc::new(RecordingNotifier::default());
        let poll_loop = poll_loop(chain, notifier);
        let shutdown = CancellationToken::new();

        let handle = tokio::spawn(poll_loop.run(shutdown.clone()));
        sleep(Duration::from_millis(30)).await;
        shutdown.cancel();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn cycle_after_cancellation_polls_nothing() {
        let chain = Arc::new(FakeChain::with_head(100));
        let notifier = Arc::new(RecordingNotifier::default());
        let mut poll_loop = poll_loop(chain, notifier);
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let summary = poll_loop.run_cycle(&shutdown).await;
        assert_eq!(summary.polled, 0);
        assert_eq!(poll_loop.detector().cursor(ALICE, crate::models::TransferKind::Token), None);
    }
}
