//! Append-only trade journal
//!
//! One row per fill or close event. The CSV header is written once, only
//! when the file starts empty, so restarts keep appending to the same log.

use crate::market::Direction;
use crate::positions::Position;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum JournalError {
    #[error("journal I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("journal write error: {0}")]
    Csv(#[from] csv::Error),
}

/// One fill/close event row.
#[derive(Clone, Debug, Serialize)]
pub struct TradeRecord {
    #[serde(rename = "Time")]
    pub time: String,
    #[serde(rename = "Symbol")]
    pub symbol: String,
    #[serde(rename = "Type")]
    pub side: String,
    #[serde(rename = "Volume")]
    pub volume: f64,
    #[serde(rename = "Price")]
    pub price: f64,
    #[serde(rename = "Profit")]
    pub profit: f64,
    #[serde(rename = "Comment")]
    pub comment: String,
    #[serde(rename = "Magic")]
    pub magic: u64,
    #[serde(rename = "SL")]
    pub stop: f64,
    #[serde(rename = "TP")]
    pub target: f64,
}

impl TradeRecord {
    fn new(position: &Position, at: DateTime<Utc>, profit: f64, comment: &str) -> Self {
        Self {
            time: at.format("%Y-%m-%d %H:%M:%S").to_string(),
            symbol: position.symbol.to_string(),
            side: match position.direction {
                Direction::Long => "BUY".to_string(),
                Direction::Short => "SELL".to_string(),
            },
            volume: position.volume,
            price: position.entry_price,
            profit,
            comment: comment.to_string(),
            magic: position.magic.0,
            stop: position.stop,
            target: position.target,
        }
    }

    pub fn fill(position: &Position, at: DateTime<Utc>, comment: &str) -> Self {
        Self::new(position, at, 0.0, comment)
    }

    pub fn close(position: &Position, at: DateTime<Utc>, profit: f64, comment: &str) -> Self {
        Self::new(position, at, profit, comment)
    }
}

pub trait TradeJournal: Send + Sync {
    fn append(&self, record: &TradeRecord) -> Result<(), JournalError>;
}

/// CSV file journal.
pub struct CsvTradeJournal {
    writer: Mutex<csv::Writer<File>>,
}

impl CsvTradeJournal {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, JournalError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())?;
        let starts_empty = file.metadata()?.len() == 0;
        let writer = csv::WriterBuilder::new()
            .has_headers(starts_empty)
            .from_writer(file);
        Ok(Self {
            writer: Mutex::new(writer),
        })
    }
}

impl TradeJournal for CsvTradeJournal {
    fn append(&self, record: &TradeRecord) -> Result<(), JournalError> {
        let mut writer = self.writer.lock();
        writer.serialize(record)?;
        writer.flush()?;
        Ok(())
    }
}

/// Sink for runs with the journal disabled.
pub struct NullJournal;

impl TradeJournal for NullJournal {
    fn append(&self, _record: &TradeRecord) -> Result<(), JournalError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::OrderId;
    use crate::market::{Magic, Symbol, Timeframe};
    use crate::positions::PositionStage;
    use chrono::TimeZone;

    fn position() -> Position {
        Position {
            magic: Magic(10_000),
            order_id: OrderId(1),
            symbol: Symbol::new("EURUSD"),
            timeframe: Timeframe::M5,
            direction: Direction::Long,
            volume: 0.02,
            entry_price: 1.0982,
            stop: 1.0962,
            target: 1.1082,
            initial_risk: 0.002,
            stage: PositionStage::Open,
            opened_at: None,
        }
    }

    #[test]
    fn writes_header_once_across_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.csv");
        let at = Utc.with_ymd_and_hms(2024, 6, 3, 12, 0, 0).unwrap();

        {
            let journal = CsvTradeJournal::open(&path).unwrap();
            journal
                .append(&TradeRecord::fill(&position(), at, "gaprev"))
                .unwrap();
        }
        {
            let journal = CsvTradeJournal::open(&path).unwrap();
            journal
                .append(&TradeRecord::close(&position(), at, -40.0, "gaprev"))
                .unwrap();
        }

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "Time,Symbol,Type,Volume,Price,Profit,Comment,Magic,SL,TP");
        assert!(lines[1].contains("2024-06-03 12:00:00"));
        assert!(lines[1].contains("BUY"));
        assert!(lines[2].contains("-40"));
    }

    #[test]
    fn null_journal_swallows_records() {
        let at = Utc.with_ymd_and_hms(2024, 6, 3, 12, 0, 0).unwrap();
        NullJournal
            .append(&TradeRecord::fill(&position(), at, ""))
            .unwrap();
    }
}
