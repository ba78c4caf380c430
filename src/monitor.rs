//! Monitoring loop
//!
//! Every capture mark: grab frames, analyse each symbol on a bounded worker
//! pool and hand aligned signals to the lifecycle manager. Between marks the
//! exit sweep runs on its own interval, and the daily close-out fires once
//! per trading day.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::capture::{CapturedFrame, FrameSource};
use crate::execution::{ClosedTrade, ExitReason, LifecycleManager, SignalDecision};
use crate::session::{Clock, MarketSession};
use crate::vision::{AnalysisError, ChartAnalysis, ChartAnalyzer};

pub const DEFAULT_MAX_WORKERS: usize = 4;

/// What happened to one captured frame
#[derive(Debug)]
pub enum FrameOutcome {
    Analyzed {
        analysis: ChartAnalysis,
        decision: SignalDecision,
    },
    AnalysisFailed(AnalysisError),
    ExecutionFailed(String),
}

#[derive(Debug)]
pub struct FrameReport {
    pub symbol: String,
    pub source: String,
    pub outcome: FrameOutcome,
}

async fn process_frame(
    manager: Arc<LifecycleManager>,
    analyzer: Arc<ChartAnalyzer>,
    frame: CapturedFrame,
) -> FrameReport {
    let CapturedFrame { symbol, image, source } = frame;

    let analysed = tokio::task::spawn_blocking(move || analyzer.analyze(&image)).await;
    let outcome = match analysed {
        Err(e) => {
            error!(symbol = %symbol, error = %e, "analysis task failed");
            FrameOutcome::ExecutionFailed(format!("analysis task failed: {}", e))
        }
        Ok(Err(e)) => {
            warn!(symbol = %symbol, source = %source, error = %e, "chart analysis failed");
            FrameOutcome::AnalysisFailed(e)
        }
        Ok(Ok(analysis)) => {
            info!(
                symbol = %symbol,
                stm = %analysis.signals.stm,
                td = %analysis.signals.td,
                zigzag = %analysis.signals.zigzag,
                candles = analysis.candle_count,
                "frame analysed"
            );
            match manager.on_signal(&symbol, analysis.signals).await {
                Ok(decision) => FrameOutcome::Analyzed { analysis, decision },
                Err(e) => {
                    error!(symbol = %symbol, error = %e, "signal handling failed");
                    FrameOutcome::ExecutionFailed(e.to_string())
                }
            }
        }
    };

    FrameReport {
        symbol,
        source,
        outcome,
    }
}

/// The capture mark still owed a cycle. It only moves on once that cycle
/// has run, so a mark that passes while a sweep or close-out is busy is
/// captured late instead of skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureSchedule {
    pending: DateTime<Utc>,
}

impl CaptureSchedule {
    pub fn starting_at(session: &MarketSession, now: DateTime<Utc>) -> Self {
        Self {
            pending: session.next_capture_in_window(now),
        }
    }

    pub fn pending(&self) -> DateTime<Utc> {
        self.pending
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        now >= self.pending
    }

    /// Zero once the pending mark has passed
    pub fn wait(&self, now: DateTime<Utc>) -> std::time::Duration {
        (self.pending - now).to_std().unwrap_or_default()
    }

    /// Mark the pending cycle done and move to the following mark
    pub fn complete(&mut self, session: &MarketSession) {
        self.pending = session.next_capture_in_window(self.pending + ChronoDuration::seconds(1));
    }
}

pub struct Monitor {
    manager: Arc<LifecycleManager>,
    analyzer: Arc<ChartAnalyzer>,
    source: Arc<dyn FrameSource>,
    clock: Arc<dyn Clock>,
    workers: Arc<Semaphore>,
    last_daily_close: Mutex<Option<NaiveDate>>,
}

impl Monitor {
    pub fn new(
        manager: Arc<LifecycleManager>,
        analyzer: ChartAnalyzer,
        source: Arc<dyn FrameSource>,
        clock: Arc<dyn Clock>,
        max_workers: usize,
    ) -> Self {
        Self {
            manager,
            analyzer: Arc::new(analyzer),
            source,
            clock,
            workers: Arc::new(Semaphore::new(max_workers.max(1))),
            last_daily_close: Mutex::new(None),
        }
    }

    fn session(&self) -> &MarketSession {
        self.manager.session()
    }

    /// One capture cycle. Frames for untracked symbols and repeat frames
    /// for a symbol already seen this cycle are dropped before analysis.
    pub async fn run_cycle(&self) -> Result<Vec<FrameReport>> {
        let source = Arc::clone(&self.source);
        let frames = tokio::task::spawn_blocking(move || source.capture())
            .await
            .context("capture task panicked")??;

        let mut seen = HashSet::new();
        let mut tasks = JoinSet::new();
        for frame in frames {
            if !self.manager.is_tracked(&frame.symbol) {
                debug!(symbol = %frame.symbol, "untracked symbol, frame dropped");
                continue;
            }
            if !seen.insert(frame.symbol.clone()) {
                warn!(symbol = %frame.symbol, source = %frame.source, "second frame this cycle, dropped");
                continue;
            }
            let permit = Arc::clone(&self.workers)
                .acquire_owned()
                .await
                .context("worker pool closed")?;
            let manager = Arc::clone(&self.manager);
            let analyzer = Arc::clone(&self.analyzer);
            tasks.spawn(async move {
                let _permit = permit;
                process_frame(manager, analyzer, frame).await
            });
        }

        let mut reports = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(report) => reports.push(report),
                Err(e) => error!(error = %e, "worker task failed"),
            }
        }
        reports.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        info!(frames = reports.len(), "capture cycle complete");
        Ok(reports)
    }

    pub async fn exit_sweep(&self) -> Vec<ClosedTrade> {
        let closed = self.manager.check_exit_conditions().await;
        if !closed.is_empty() {
            info!(count = closed.len(), "exit sweep closed positions");
        }
        closed
    }

    /// Close everything during the close-out minute, once per trading day
    pub async fn daily_close_if_due(&self) -> Vec<ClosedTrade> {
        let now = self.clock.now();
        if !self.session().is_daily_close(now) {
            return Vec::new();
        }
        let today = MarketSession::trading_day(now);
        {
            let mut last = self.last_daily_close.lock().await;
            if *last == Some(today) {
                return Vec::new();
            }
            *last = Some(today);
        }
        info!(%today, "daily close-out");
        self.manager.close_all_positions(ExitReason::DailyClose).await
    }

    /// Run until ctrl-c, then disconnect the gateway
    pub async fn run(&self) -> Result<()> {
        let symbols = self.manager.tracked_symbols();
        self.manager
            .gateway()
            .subscribe_price_stream(&symbols)
            .await
            .context("Failed to subscribe to price streams")?;
        info!(symbols = ?symbols, gateway = self.manager.gateway().name(), "monitor started");

        let mut exit_ticker = tokio::time::interval(self.session().config().exit_check_interval);
        exit_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        let mut schedule = CaptureSchedule::starting_at(self.session(), self.clock.now());
        loop {
            let now = self.clock.now();
            let wait = schedule.wait(now);
            if schedule.is_due(now) {
                debug!(mark = %MarketSession::eastern(schedule.pending()), "capture overdue, running now");
            } else {
                debug!(next_capture = %MarketSession::eastern(schedule.pending()), "waiting");
            }

            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
                _ = exit_ticker.tick() => {
                    self.exit_sweep().await;
                    self.daily_close_if_due().await;
                }
                _ = tokio::time::sleep(wait) => {
                    if let Err(e) = self.run_cycle().await {
                        error!(error = %e, "capture cycle failed");
                    }
                    schedule.complete(self.session());
                }
            }
        }

        self.manager.disconnect().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{PriceCache, SimulatedGateway, TradeLedger, TradingConfig};
    use crate::session::FixedClock;
    use crate::vision::candles::test_support::*;
    use crate::vision::ScanConfig;
    use image::{Rgb, RgbImage};
    use std::time::Duration;

    const ORANGE: Rgb<u8> = Rgb([160, 100, 20]);
    const YELLOW: Rgb<u8> = Rgb([240, 220, 40]);
    const FUCHSIA: Rgb<u8> = Rgb([224, 64, 251]);

    struct StaticFrames(Vec<CapturedFrame>);

    impl FrameSource for StaticFrames {
        fn capture(&self) -> Result<Vec<CapturedFrame>> {
            Ok(self.0.clone())
        }
    }

    /// Three candles, reference x=33, every indicator reading buy
    fn buy_chart() -> RgbImage {
        let mut img = blank(100, 80);
        paint(&mut img, 10, 17, 2, 20, RED);
        paint(&mut img, 30, 37, 5, 22, RED);
        paint(&mut img, 50, 57, 4, 18, GREEN);
        paint(&mut img, 33, 33, 60, 64, ORANGE);
        paint(&mut img, 33, 33, 25, 27, YELLOW);
        paint(&mut img, 13, 53, 30, 31, FUCHSIA);
        img
    }

    fn frame(symbol: &str, image: RgbImage) -> CapturedFrame {
        CapturedFrame {
            symbol: symbol.to_string(),
            image,
            source: format!("{}.png", symbol.to_lowercase()),
        }
    }

    fn monitor(frames: Vec<CapturedFrame>, clock: Arc<FixedClock>) -> (Monitor, Arc<SimulatedGateway>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let gateway = Arc::new(SimulatedGateway::new(PriceCache::new()));
        let config = TradingConfig {
            fill_timeout: Duration::from_millis(50),
            ledger_path: dir.path().join("trades.csv"),
            ..Default::default()
        };
        let ledger = TradeLedger::open(&config.ledger_path).unwrap();
        let manager = Arc::new(LifecycleManager::new(
            config,
            gateway.clone(),
            ledger,
            MarketSession::default(),
            clock.clone(),
            vec!["AAPL".to_string(), "TSLA".to_string()],
        ));
        let monitor = Monitor::new(
            manager,
            ChartAnalyzer::new(ScanConfig::default().with_line_span(20)),
            Arc::new(StaticFrames(frames)),
            clock,
            2,
        );
        (monitor, gateway, dir)
    }

    fn clock_at(hour: u32, minute: u32) -> Arc<FixedClock> {
        let date = NaiveDate::from_ymd_opt(2025, 3, 12).unwrap();
        Arc::new(FixedClock::eastern(date, hour, minute).unwrap())
    }

    #[tokio::test]
    async fn test_cycle_enters_on_aligned_frame() {
        let frames = vec![
            frame("AAPL", buy_chart()),
            frame("AAPL", buy_chart()),
            frame("MSFT", buy_chart()),
            frame("TSLA", blank(60, 40)),
        ];
        let (monitor, gateway, _dir) = monitor(frames, clock_at(10, 5));
        gateway.set_price("AAPL", 100.0);

        let reports = monitor.run_cycle().await.unwrap();
        assert_eq!(reports.len(), 2);

        assert_eq!(reports[0].symbol, "AAPL");
        match &reports[0].outcome {
            FrameOutcome::Analyzed { analysis, decision } => {
                assert_eq!(analysis.reference_x, 33);
                assert!(matches!(decision, SignalDecision::Entered(p) if p.shares == 4));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(matches!(
            reports[1].outcome,
            FrameOutcome::AnalysisFailed(AnalysisError::NoCandles)
        ));
        assert_eq!(gateway.submitted().len(), 1);
    }

    #[tokio::test]
    async fn test_daily_close_once_per_day() {
        let clock = clock_at(15, 58);
        let (monitor, gateway, _dir) = monitor(vec![frame("AAPL", buy_chart())], clock.clone());
        gateway.set_price("AAPL", 100.0);
        monitor.run_cycle().await.unwrap();

        assert!(monitor.daily_close_if_due().await.is_empty());

        clock.advance(chrono::Duration::minutes(1));
        let closed = monitor.daily_close_if_due().await;
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].reason, ExitReason::DailyClose);

        monitor.run_cycle().await.unwrap();
        clock.advance(chrono::Duration::seconds(30));
        assert!(monitor.daily_close_if_due().await.is_empty());
        assert!(!monitor.manager.is_flat("AAPL").await);
    }

    #[tokio::test]
    async fn test_exit_sweep_uses_cached_price() {
        let (monitor, gateway, _dir) = monitor(vec![frame("AAPL", buy_chart())], clock_at(11, 0));
        gateway.set_price("AAPL", 100.0);
        monitor.run_cycle().await.unwrap();

        gateway.set_price("AAPL", 99.0);
        let closed = monitor.exit_sweep().await;
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].reason, ExitReason::StopLoss);
    }

    #[test]
    fn test_capture_schedule_keeps_overdue_mark() {
        let session = MarketSession::default();
        let start = clock_at(10, 4).now() + ChronoDuration::seconds(59);
        let mut schedule = CaptureSchedule::starting_at(&session, start);
        let ten_oh_five = clock_at(10, 5).now();
        assert_eq!(schedule.pending(), ten_oh_five);
        assert!(!schedule.is_due(start));
        assert_eq!(schedule.wait(start), Duration::from_secs(1));

        // a sweep ran past the mark: the 10:05 cycle is still owed
        let late = ten_oh_five + ChronoDuration::milliseconds(200);
        assert!(schedule.is_due(late));
        assert_eq!(schedule.wait(late), Duration::ZERO);
        assert_eq!(schedule.pending(), ten_oh_five);

        schedule.complete(&session);
        assert_eq!(schedule.pending(), clock_at(10, 10).now());
    }

    #[test]
    fn test_daily_close_does_not_eat_last_capture() {
        let session = MarketSession::default();
        let mut schedule = CaptureSchedule::starting_at(&session, clock_at(15, 59).now());
        let four = clock_at(16, 0).now();
        assert_eq!(schedule.pending(), four);

        // close-out orders held the loop until 16:00:25
        assert!(schedule.is_due(four + ChronoDuration::seconds(25)));
        schedule.complete(&session);
        // next mark is the following session open
        assert_eq!(schedule.pending(), clock_at(9, 30).now() + ChronoDuration::days(1));
    }
}
