//! Append-only trade ledger CSV
//!
//! One row per ENTRY and one per EXIT, correlated by `Trade_ID`. The column
//! order is read by downstream analysis tooling and must not change.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use csv::{ReaderBuilder, WriterBuilder};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use super::position::{ClosedTrade, Position};
use crate::session::MARKET_TZ;
use crate::vision::Signal;

pub const COLUMNS: [&str; 21] = [
    "Trade_ID",
    "Entry_Time",
    "Exit_Time",
    "Symbol",
    "Signal_Type",
    "Action",
    "Shares",
    "Entry_Price",
    "Exit_Price",
    "Take_Profit",
    "Stop_Loss",
    "PnL_Dollar",
    "PnL_Percent",
    "Exit_Reason",
    "Duration_Minutes",
    "STM_Signal",
    "TD_Signal",
    "Zigzag_Signal",
    "Market_Hours",
    "Order_Type",
    "Notes",
];

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const ESTIMATED_NOTE: &str = "; estimated fill";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LedgerAction {
    Entry,
    Exit,
}

/// One ledger line; field order is the column order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerRow {
    #[serde(rename = "Trade_ID")]
    pub trade_id: String,
    #[serde(rename = "Entry_Time")]
    pub entry_time: String,
    #[serde(rename = "Exit_Time")]
    pub exit_time: Option<String>,
    #[serde(rename = "Symbol")]
    pub symbol: String,
    #[serde(rename = "Signal_Type")]
    pub signal_type: String,
    #[serde(rename = "Action")]
    pub action: LedgerAction,
    #[serde(rename = "Shares")]
    pub shares: u32,
    #[serde(rename = "Entry_Price")]
    pub entry_price: f64,
    #[serde(rename = "Exit_Price")]
    pub exit_price: Option<f64>,
    #[serde(rename = "Take_Profit")]
    pub take_profit: f64,
    #[serde(rename = "Stop_Loss")]
    pub stop_loss: f64,
    #[serde(rename = "PnL_Dollar")]
    pub pnl_dollar: Option<f64>,
    #[serde(rename = "PnL_Percent")]
    pub pnl_percent: Option<f64>,
    #[serde(rename = "Exit_Reason")]
    pub exit_reason: Option<String>,
    #[serde(rename = "Duration_Minutes")]
    pub duration_minutes: Option<f64>,
    #[serde(rename = "STM_Signal")]
    pub stm_signal: Option<Signal>,
    #[serde(rename = "TD_Signal")]
    pub td_signal: Option<Signal>,
    #[serde(rename = "Zigzag_Signal")]
    pub zigzag_signal: Option<Signal>,
    #[serde(rename = "Market_Hours")]
    pub market_hours: String,
    #[serde(rename = "Order_Type")]
    pub order_type: String,
    #[serde(rename = "Notes")]
    pub notes: String,
}

fn format_time(t: DateTime<Utc>) -> String {
    t.with_timezone(&MARKET_TZ).format(TIME_FORMAT).to_string()
}

fn yes_no(b: bool) -> String {
    if b { "Yes" } else { "No" }.to_string()
}

fn note(base: &str, estimated: bool) -> String {
    if estimated {
        format!("{}{}", base, ESTIMATED_NOTE)
    } else {
        base.to_string()
    }
}

impl LedgerRow {
    pub fn entry(position: &Position) -> Self {
        Self {
            trade_id: position.trade_id.clone(),
            entry_time: format_time(position.entry_time),
            exit_time: None,
            symbol: position.symbol.clone(),
            signal_type: position.direction.to_string(),
            action: LedgerAction::Entry,
            shares: position.shares,
            entry_price: position.entry_price,
            exit_price: None,
            take_profit: position.take_profit,
            stop_loss: position.stop_loss,
            pnl_dollar: None,
            pnl_percent: None,
            exit_reason: None,
            duration_minutes: None,
            stm_signal: Some(position.signals.stm),
            td_signal: Some(position.signals.td),
            zigzag_signal: Some(position.signals.zigzag),
            market_hours: yes_no(position.is_market_hours),
            order_type: position.order_type.clone(),
            notes: note("Trade entry", position.estimated_fill),
        }
    }

    pub fn exit(trade: &ClosedTrade) -> Self {
        let mut row = Self::entry(&trade.position);
        row.exit_time = Some(format_time(trade.exit_time));
        row.action = LedgerAction::Exit;
        row.exit_price = Some(trade.exit_price);
        row.pnl_dollar = Some(trade.pnl_dollar);
        row.pnl_percent = Some(trade.pnl_percent);
        row.exit_reason = Some(trade.reason.to_string());
        row.duration_minutes = Some(trade.duration_minutes);
        row.order_type = trade.exit_order_type.clone();
        row.notes = note("Trade exit", trade.estimated_fill);
        row
    }

    pub fn is_estimated(&self) -> bool {
        self.notes.ends_with(ESTIMATED_NOTE)
    }
}

/// Append-only CSV writer; appends are serialized
#[derive(Debug)]
pub struct TradeLedger {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl TradeLedger {
    /// Create the file with its header row if it does not exist yet
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create ledger dir {}", parent.display()))?;
            }
        }
        let empty = fs::metadata(&path).map(|m| m.len() == 0).unwrap_or(true);
        if empty {
            let mut writer = WriterBuilder::new()
                .from_path(&path)
                .with_context(|| format!("Failed to create ledger {}", path.display()))?;
            writer.write_record(COLUMNS).context("Failed to write ledger header")?;
            writer.flush().context("Failed to flush ledger header")?;
        }
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one row. The file write runs on the blocking pool; the lock
    /// is held across it so rows never interleave.
    pub async fn append(&self, row: &LedgerRow) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.path.clone();
        let owned = row.clone();
        tokio::task::spawn_blocking(move || write_row(&path, &owned))
            .await
            .context("ledger write task panicked")??;
        debug!(trade_id = %row.trade_id, action = ?row.action, "ledger row appended");
        Ok(())
    }

    pub fn load(&self) -> Result<Vec<LedgerRow>> {
        load_rows(&self.path)
    }
}

fn write_row(path: &Path, row: &LedgerRow) -> Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open ledger {}", path.display()))?;
    let mut writer = WriterBuilder::new().has_headers(false).from_writer(file);
    writer.serialize(row).context("Failed to write ledger row")?;
    writer.flush().context("Failed to flush ledger")?;
    Ok(())
}

pub fn load_rows(path: &Path) -> Result<Vec<LedgerRow>> {
    let file = File::open(path).with_context(|| format!("Failed to open ledger {}", path.display()))?;
    let mut reader = ReaderBuilder::new().has_headers(true).from_reader(file);
    let mut rows = Vec::new();
    for result in reader.deserialize() {
        let row: LedgerRow = result.context("Failed to parse ledger row")?;
        rows.push(row);
    }
    Ok(rows)
}

/// Per-group trade statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GroupStats {
    pub trades: usize,
    pub wins: usize,
    pub total_pnl: f64,
}

impl GroupStats {
    fn add(&mut self, pnl: f64) {
        self.trades += 1;
        self.total_pnl += pnl;
        if pnl > 0.0 {
            self.wins += 1;
        }
    }

    pub fn win_rate(&self) -> f64 {
        if self.trades == 0 {
            0.0
        } else {
            self.wins as f64 / self.trades as f64 * 100.0
        }
    }
}

/// Performance summary over the EXIT rows of a ledger
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LedgerSummary {
    pub entries: usize,
    pub completed: usize,
    /// Entries without a matching exit
    pub open: usize,
    pub wins: usize,
    pub losses: usize,
    pub win_rate: f64,
    pub total_pnl: f64,
    pub avg_pnl: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub avg_duration_minutes: f64,
    pub estimated_fills: usize,
    pub by_symbol: BTreeMap<String, GroupStats>,
    pub by_side: BTreeMap<String, GroupStats>,
    pub by_reason: BTreeMap<String, GroupStats>,
}

impl LedgerSummary {
    pub fn from_rows(rows: &[LedgerRow]) -> Self {
        let mut summary = Self::default();
        let mut exited: Vec<&str> = Vec::new();
        let mut win_sum = 0.0;
        let mut loss_sum = 0.0;
        let mut duration_sum = 0.0;

        for row in rows {
            if row.is_estimated() {
                summary.estimated_fills += 1;
            }
            match row.action {
                LedgerAction::Entry => summary.entries += 1,
                LedgerAction::Exit => {
                    exited.push(&row.trade_id);
                    let pnl = row.pnl_dollar.unwrap_or(0.0);
                    summary.completed += 1;
                    summary.total_pnl += pnl;
                    duration_sum += row.duration_minutes.unwrap_or(0.0);
                    if pnl > 0.0 {
                        summary.wins += 1;
                        win_sum += pnl;
                    } else {
                        summary.losses += 1;
                        loss_sum += pnl;
                    }
                    summary.by_symbol.entry(row.symbol.clone()).or_default().add(pnl);
                    summary.by_side.entry(row.signal_type.clone()).or_default().add(pnl);
                    summary
                        .by_reason
                        .entry(row.exit_reason.clone().unwrap_or_default())
                        .or_default()
                        .add(pnl);
                }
            }
        }

        summary.open = rows
            .iter()
            .filter(|r| r.action == LedgerAction::Entry && !exited.contains(&r.trade_id.as_str()))
            .count();

        if summary.completed > 0 {
            let n = summary.completed as f64;
            summary.win_rate = summary.wins as f64 / n * 100.0;
            summary.avg_pnl = summary.total_pnl / n;
            summary.avg_duration_minutes = duration_sum / n;
        }
        if summary.wins > 0 {
            summary.avg_win = win_sum / summary.wins as f64;
        }
        if summary.losses > 0 {
            summary.avg_loss = loss_sum / summary.losses as f64;
        }
        summary
    }
}

impl std::fmt::Display for LedgerSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "OVERALL")?;
        writeln!(f, "  Entries: {}  Completed: {}  Open: {}", self.entries, self.completed, self.open)?;
        writeln!(f, "  Wins: {}  Losses: {}  Win rate: {:.1}%", self.wins, self.losses, self.win_rate)?;
        writeln!(f, "  Total P&L: ${:.2}  Avg/trade: ${:.2}", self.total_pnl, self.avg_pnl)?;
        writeln!(f, "  Avg win: ${:.2}  Avg loss: ${:.2}", self.avg_win, self.avg_loss)?;
        if self.avg_loss != 0.0 {
            writeln!(f, "  Risk/reward: {:.2}", (self.avg_win / self.avg_loss).abs())?;
        }
        writeln!(f, "  Avg duration: {:.1} min  Estimated fills: {}", self.avg_duration_minutes, self.estimated_fills)?;

        for (title, groups) in [
            ("BY SYMBOL", &self.by_symbol),
            ("BY SIDE", &self.by_side),
            ("BY EXIT REASON", &self.by_reason),
        ] {
            writeln!(f, "{}", title)?;
            for (key, g) in groups {
                writeln!(
                    f,
                    "  {:<24} trades {:>3}  win {:>5.1}%  P&L ${:.2}",
                    key,
                    g.trades,
                    g.win_rate(),
                    g.total_pnl
                )?;
            }
        }
        Ok(())
    }
}
