//! SQLite position ledger.
//!
//! Durable record of every hedge leg pair the engine has opened, keyed by an
//! opaque trade id. An open row survives restarts and is the source of truth
//! for "do we currently hold a hedge". Closing a row computes per-leg and net
//! P&L from the recorded entry and exit prices.

use crate::strategy::{Direction, HedgePosition, PositionStatus};
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use std::fmt::Write as _;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};
use uuid::Uuid;

/// Data captured when both opening legs have filled.
#[derive(Debug, Clone)]
pub struct OpenRecord {
    pub direction: Direction,
    pub amount: Decimal,
    pub price_a: Decimal,
    pub price_b: Decimal,
    pub order_id_a: String,
    pub order_id_b: String,
    pub spread: Decimal,
}

/// Data captured when both closing legs have filled. Unknown fees count as zero.
#[derive(Debug, Clone, Default)]
pub struct CloseRecord {
    pub price_a: Decimal,
    pub price_b: Decimal,
    pub order_id_a: String,
    pub order_id_b: String,
    pub spread: Decimal,
    pub open_fee_a: Option<Decimal>,
    pub open_fee_b: Option<Decimal>,
    pub close_fee_a: Option<Decimal>,
    pub close_fee_b: Option<Decimal>,
    pub forced: bool,
}

impl CloseRecord {
    pub fn total_fees(&self) -> Decimal {
        [
            self.open_fee_a,
            self.open_fee_b,
            self.close_fee_a,
            self.close_fee_b,
        ]
        .into_iter()
        .map(Option::unwrap_or_default)
        .sum()
    }
}

/// Realized result of a closed trade.
#[derive(Debug, Clone, PartialEq)]
pub struct ClosedTrade {
    pub trade_id: String,
    pub direction: Direction,
    pub amount: Decimal,
    pub pnl_a: Decimal,
    pub pnl_b: Decimal,
    pub gross_pnl: Decimal,
    pub fees: Decimal,
    pub net_pnl: Decimal,
    pub closed_at: DateTime<Utc>,
}

/// Per-leg realized P&L, `(venue A, venue B)`.
pub fn leg_pnl(
    direction: Direction,
    amount: Decimal,
    open: (Decimal, Decimal),
    close: (Decimal, Decimal),
) -> (Decimal, Decimal) {
    let long_a = (close.0 - open.0) * amount;
    let short_b = (open.1 - close.1) * amount;
    match direction {
        Direction::LongAShortB => (long_a, short_b),
        Direction::ShortALongB => (-long_a, -short_b),
    }
}

/// Aggregate figures for trades opened today (UTC).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LedgerStats {
    pub total_trades: u32,
    pub open_trades: u32,
    pub closed_trades: u32,
    pub volume: Decimal,
    pub gross_pnl: Decimal,
    pub fees: Decimal,
    pub net_pnl: Decimal,
}

pub struct PositionLedger {
    conn: Connection,
}

impl PositionLedger {
    /// Opens (or creates) the ledger at `db_path`. `":memory:"` is accepted.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let path = db_path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create ledger directory {:?}", parent))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open ledger at {:?}", path))?;

        let ledger = Self { conn };
        ledger.init_schema()?;

        info!("Position ledger initialized at {:?}", path);
        Ok(ledger)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS trades (
                trade_id TEXT PRIMARY KEY,
                direction TEXT NOT NULL,
                amount TEXT NOT NULL,
                status TEXT NOT NULL,
                opened_at TEXT NOT NULL,
                spread_at_open TEXT NOT NULL,
                open_price_a TEXT NOT NULL,
                open_price_b TEXT NOT NULL,
                open_order_a TEXT NOT NULL,
                open_order_b TEXT NOT NULL,
                closed_at TEXT,
                spread_at_close TEXT,
                close_price_a TEXT,
                close_price_b TEXT,
                close_order_a TEXT,
                close_order_b TEXT,
                open_fee_a TEXT,
                open_fee_b TEXT,
                close_fee_a TEXT,
                close_fee_b TEXT,
                pnl_a TEXT,
                pnl_b TEXT,
                gross_pnl TEXT,
                net_pnl TEXT,
                forced_close INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_trades_status ON trades(status);
            CREATE INDEX IF NOT EXISTS idx_trades_opened_at ON trades(opened_at);
            "#,
        )?;

        debug!("Ledger schema initialized");
        Ok(())
    }

    /// Persists a newly opened hedge and returns its trade id.
    pub fn record_open(&self, record: &OpenRecord) -> Result<HedgePosition> {
        let position = HedgePosition {
            trade_id: Uuid::new_v4().to_string(),
            direction: record.direction,
            amount: record.amount,
            entry_price_a: record.price_a,
            entry_price_b: record.price_b,
            order_id_a: record.order_id_a.clone(),
            order_id_b: record.order_id_b.clone(),
            opened_at: Utc::now(),
            spread_at_open: record.spread,
            status: PositionStatus::Open,
        };

        self.conn.execute(
            r#"
            INSERT INTO trades (trade_id, direction, amount, status, opened_at, spread_at_open,
                                open_price_a, open_price_b, open_order_a, open_order_b)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                position.trade_id,
                position.direction.as_str(),
                position.amount.to_string(),
                position.status.as_str(),
                position.opened_at.to_rfc3339(),
                position.spread_at_open.to_string(),
                position.entry_price_a.to_string(),
                position.entry_price_b.to_string(),
                position.order_id_a,
                position.order_id_b,
            ],
        )?;

        info!(
            trade_id = %position.trade_id,
            direction = %position.direction,
            amount = %position.amount,
            "Trade opened in ledger"
        );
        Ok(position)
    }

    /// Marks a trade closed and stores its realized P&L.
    pub fn record_close(&self, trade_id: &str, record: &CloseRecord) -> Result<ClosedTrade> {
        let Some(position) = self.get_trade(trade_id)? else {
            bail!("unknown trade {trade_id}");
        };
        if position.status == PositionStatus::Closed {
            bail!("trade {trade_id} is already closed");
        }

        let (pnl_a, pnl_b) = leg_pnl(
            position.direction,
            position.amount,
            (position.entry_price_a, position.entry_price_b),
            (record.price_a, record.price_b),
        );
        let gross_pnl = pnl_a + pnl_b;
        let fees = record.total_fees();
        let net_pnl = gross_pnl - fees;
        let closed_at = Utc::now();
        let opt = |v: Option<Decimal>| v.map(|d| d.to_string());

        self.conn.execute(
            r#"
            UPDATE trades SET
                status = ?2, closed_at = ?3, spread_at_close = ?4,
                close_price_a = ?5, close_price_b = ?6, close_order_a = ?7, close_order_b = ?8,
                open_fee_a = ?9, open_fee_b = ?10, close_fee_a = ?11, close_fee_b = ?12,
                pnl_a = ?13, pnl_b = ?14, gross_pnl = ?15, net_pnl = ?16, forced_close = ?17
            WHERE trade_id = ?1
            "#,
            params![
                trade_id,
                PositionStatus::Closed.as_str(),
                closed_at.to_rfc3339(),
                record.spread.to_string(),
                record.price_a.to_string(),
                record.price_b.to_string(),
                record.order_id_a,
                record.order_id_b,
                opt(record.open_fee_a),
                opt(record.open_fee_b),
                opt(record.close_fee_a),
                opt(record.close_fee_b),
                pnl_a.to_string(),
                pnl_b.to_string(),
                gross_pnl.to_string(),
                net_pnl.to_string(),
                record.forced as i32,
            ],
        )?;

        info!(
            %trade_id,
            %gross_pnl,
            %fees,
            %net_pnl,
            forced = record.forced,
            "Trade closed in ledger"
        );
        Ok(ClosedTrade {
            trade_id: trade_id.to_string(),
            direction: position.direction,
            amount: position.amount,
            pnl_a,
            pnl_b,
            gross_pnl,
            fees,
            net_pnl,
            closed_at,
        })
    }

    pub fn has_open_positions(&self) -> Result<bool> {
        Ok(self.open_count()? > 0)
    }

    pub fn open_count(&self) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM trades WHERE status = 'open'",
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Open trades, oldest first.
    pub fn get_open_trades(&self) -> Result<Vec<HedgePosition>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT trade_id, direction, amount, status, opened_at, spread_at_open,
                   open_price_a, open_price_b, open_order_a, open_order_b
            FROM trades
            WHERE status = 'open'
            ORDER BY opened_at ASC
            "#,
        )?;

        let rows = stmt.query_map([], row_to_position)?;
        let mut trades = Vec::new();
        for row in rows {
            trades.push(row?.context("Corrupt ledger row")?);
        }
        Ok(trades)
    }

    pub fn get_trade(&self, trade_id: &str) -> Result<Option<HedgePosition>> {
        let row = self
            .conn
            .query_row(
                r#"
                SELECT trade_id, direction, amount, status, opened_at, spread_at_open,
                       open_price_a, open_price_b, open_order_a, open_order_b
                FROM trades
                WHERE trade_id = ?1
                "#,
                [trade_id],
                row_to_position,
            )
            .optional()?;

        row.transpose()
    }

    /// Statistics over trades opened since UTC midnight.
    pub fn today_stats(&self) -> Result<LedgerStats> {
        let midnight = Utc::now()
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc())
            .unwrap_or_else(Utc::now);

        let mut stmt = self.conn.prepare(
            r#"
            SELECT status, amount, open_price_a, gross_pnl, net_pnl
            FROM trades
            WHERE opened_at >= ?1
            "#,
        )?;

        let rows = stmt.query_map([midnight.to_rfc3339()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<String>>(4)?,
            ))
        })?;

        let mut stats = LedgerStats::default();
        for row in rows {
            let (status, amount, price_a, gross, net) = row?;
            let amount = parse_decimal(&amount)?;
            stats.total_trades += 1;
            // Notional of both legs, priced on venue A.
            stats.volume += amount * parse_decimal(&price_a)? * Decimal::TWO;

            if status == PositionStatus::Closed.as_str() {
                stats.closed_trades += 1;
                let gross = gross.as_deref().map(parse_decimal).transpose()?.unwrap_or_default();
                let net = net.as_deref().map(parse_decimal).transpose()?.unwrap_or_default();
                stats.gross_pnl += gross;
                stats.net_pnl += net;
                stats.fees += gross - net;
            } else {
                stats.open_trades += 1;
            }
        }
        Ok(stats)
    }

    /// Human-readable summary for the `status` command.
    pub fn report(&self) -> Result<String> {
        let stats = self.today_stats()?;
        let open = self.get_open_trades()?;

        let mut out = String::new();
        let _ = writeln!(out, "=== Hedge ledger ({}) ===", Utc::now().format("%Y-%m-%d"));
        let _ = writeln!(
            out,
            "Trades today: {} ({} open, {} closed)",
            stats.total_trades, stats.open_trades, stats.closed_trades
        );
        let _ = writeln!(out, "Volume: {}", stats.volume.round_dp(2));
        let _ = writeln!(
            out,
            "P&L: gross {} / fees {} / net {}",
            stats.gross_pnl.round_dp(4),
            stats.fees.round_dp(4),
            stats.net_pnl.round_dp(4)
        );

        if open.is_empty() {
            let _ = writeln!(out, "No open hedges");
        } else {
            let _ = writeln!(out, "Open hedges:");
            for trade in &open {
                let _ = writeln!(
                    out,
                    "  {} {} {} @ A={} B={} (spread {}, since {})",
                    trade.trade_id,
                    trade.direction,
                    trade.amount,
                    trade.entry_price_a,
                    trade.entry_price_b,
                    trade.spread_at_open,
                    trade.opened_at.format("%H:%M:%S")
                );
            }
        }
        Ok(out)
    }
}

type RowResult = Result<HedgePosition>;

/// Maps a row to a position. The outer `rusqlite::Result` carries column
/// access errors, the inner one carries parse errors.
fn row_to_position(row: &Row<'_>) -> rusqlite::Result<RowResult> {
    let trade_id: String = row.get(0)?;
    let direction: String = row.get(1)?;
    let amount: String = row.get(2)?;
    let status: String = row.get(3)?;
    let opened_at: String = row.get(4)?;
    let spread: String = row.get(5)?;
    let price_a: String = row.get(6)?;
    let price_b: String = row.get(7)?;
    let order_id_a: String = row.get(8)?;
    let order_id_b: String = row.get(9)?;

    Ok((|| -> Result<HedgePosition> {
        Ok(HedgePosition {
            direction: Direction::from_str(&direction)?,
            amount: parse_decimal(&amount)?,
            status: match status.as_str() {
                "open" => PositionStatus::Open,
                "closed" => PositionStatus::Closed,
                other => bail!("unknown status {other} for trade {trade_id}"),
            },
            opened_at: DateTime::parse_from_rfc3339(&opened_at)
                .with_context(|| format!("bad timestamp for trade {trade_id}"))?
                .with_timezone(&Utc),
            spread_at_open: parse_decimal(&spread)?,
            entry_price_a: parse_decimal(&price_a)?,
            entry_price_b: parse_decimal(&price_b)?,
            order_id_a,
            order_id_b,
            trade_id,
        })
    })())
}

fn parse_decimal(value: &str) -> Result<Decimal> {
    Decimal::from_str(value).with_context(|| format!("bad decimal in ledger: {value}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn open_record(direction: Direction) -> OpenRecord {
        OpenRecord {
            direction,
            amount: dec!(1),
            price_a: dec!(100),
            price_b: dec!(100.15),
            order_id_a: "a-1".into(),
            order_id_b: "b-1".into(),
            spread: dec!(0.15),
        }
    }

    #[test]
    fn test_open_and_close_long_a() {
        let ledger = PositionLedger::new(":memory:").unwrap();
        assert!(!ledger.has_open_positions().unwrap());

        let position = ledger.record_open(&open_record(Direction::LongAShortB)).unwrap();
        assert!(ledger.has_open_positions().unwrap());
        assert_eq!(ledger.get_open_trades().unwrap(), vec![position.clone()]);

        let closed = ledger
            .record_close(
                &position.trade_id,
                &CloseRecord {
                    price_a: dec!(100.05),
                    price_b: dec!(100.07),
                    spread: dec!(0.02),
                    close_fee_a: Some(dec!(0.01)),
                    ..Default::default()
                },
            )
            .unwrap();

        assert_eq!(closed.pnl_a, dec!(0.05));
        assert_eq!(closed.pnl_b, dec!(0.08));
        assert_eq!(closed.gross_pnl, dec!(0.13));
        assert_eq!(closed.fees, dec!(0.01));
        assert_eq!(closed.net_pnl, dec!(0.12));
        assert!(!ledger.has_open_positions().unwrap());
        assert_eq!(
            ledger.get_trade(&position.trade_id).unwrap().unwrap().status,
            PositionStatus::Closed
        );
    }

    #[test]
    fn test_short_a_pnl_is_mirrored() {
        let (a, b) = leg_pnl(
            Direction::ShortALongB,
            dec!(2),
            (dec!(100.15), dec!(100)),
            (dec!(100.05), dec!(100.07)),
        );
        assert_eq!(a, dec!(0.2));
        assert_eq!(b, dec!(0.14));
    }

    #[test]
    fn test_close_errors() {
        let ledger = PositionLedger::new(":memory:").unwrap();
        assert!(ledger.record_close("missing", &CloseRecord::default()).is_err());

        let position = ledger.record_open(&open_record(Direction::LongAShortB)).unwrap();
        ledger
            .record_close(&position.trade_id, &CloseRecord::default())
            .unwrap();
        assert!(ledger
            .record_close(&position.trade_id, &CloseRecord::default())
            .is_err());
    }

    #[test]
    fn test_open_trade_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("ledger.db");

        let id = {
            let ledger = PositionLedger::new(&path).unwrap();
            ledger.record_open(&open_record(Direction::ShortALongB)).unwrap().trade_id
        };

        let ledger = PositionLedger::new(&path).unwrap();
        let open = ledger.get_open_trades().unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].trade_id, id);
        assert_eq!(open[0].direction, Direction::ShortALongB);
        assert_eq!(open[0].entry_price_b, dec!(100.15));
    }

    #[test]
    fn test_today_stats_and_report() {
        let ledger = PositionLedger::new(":memory:").unwrap();
        let first = ledger.record_open(&open_record(Direction::LongAShortB)).unwrap();
        ledger.record_open(&open_record(Direction::LongAShortB)).unwrap();
        ledger
            .record_close(
                &first.trade_id,
                &CloseRecord {
                    price_a: dec!(100.1),
                    price_b: dec!(100.15),
                    open_fee_a: Some(dec!(0.02)),
                    open_fee_b: Some(dec!(0.02)),
                    ..Default::default()
                },
            )
            .unwrap();

        let stats = ledger.today_stats().unwrap();
        assert_eq!(stats.total_trades, 2);
        assert_eq!(stats.open_trades, 1);
        assert_eq!(stats.closed_trades, 1);
        assert_eq!(stats.volume, dec!(400));
        assert_eq!(stats.gross_pnl, dec!(0.1));
        assert_eq!(stats.fees, dec!(0.04));
        assert_eq!(stats.net_pnl, dec!(0.06));

        let report = ledger.report().unwrap();
        assert!(report.contains("1 open, 1 closed"));
        assert!(report.contains("buy_a_sell_b"));
    }
}
