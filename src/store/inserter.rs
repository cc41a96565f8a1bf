//! Per-(Stream, Pipe) insertion task (spec §4.E). Drains a Pipe, buffers
//! its blocks, and flushes to TimescaleDB on a fixed period. Each flush
//! also feeds the decimator chain and, on an interval marker, inserts a
//! boundary row. Backend failures retry with bounded exponential backoff;
//! on exhaustion the inserter closes its pipe so the producer observes a
//! write failure and stops (§7's propagation policy).

use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, warn};
use sqlx::PgPool;

use crate::block::Block;
use crate::error::{JouleError, Result};
use crate::layout::Elem;
use crate::pipe::local::Pipe;
use crate::stream::Stream;
use crate::store::decimator::{DecimatedRow, DecimatorChain};

const MAX_RETRIES: u32 = 5;
const INITIAL_BACKOFF: Duration = Duration::from_millis(500);

pub struct Inserter {
    stream: Stream,
    pipe: Pipe,
    pool: PgPool,
    insert_period: Duration,
}

impl Inserter {
    pub fn new(stream: Stream, pipe: Pipe, pool: PgPool, insert_period: Duration) -> Self {
        Inserter {
            stream,
            pipe,
            pool,
            insert_period,
        }
    }

    /// Runs until the pipe closes and every buffered row has been
    /// flushed. Returns `Err` only if the backend failed permanently
    /// (the pipe is closed in that case too).
    pub async fn run(self) -> Result<()> {
        let Inserter {
            stream,
            pipe,
            pool,
            insert_period,
        } = self;
        let mut chain = if stream.decimate {
            Some(DecimatorChain::new(
                stream.layout.dtype,
                stream.layout.count,
                super::NUM_LEVELS as usize,
            ))
        } else {
            None
        };
        let mut pending = Block::empty(stream.layout);
        let mut last_timestamp: Option<u64> = None;
        let mut ticker = tokio::time::interval(insert_period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let result = loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = flush(&pool, &stream, &mut pending, chain.as_mut()).await {
                        break Err(e);
                    }
                }
                read = pipe.read(false) => {
                    match read {
                        Ok(data) => {
                            let crate::pipe::local::ReadData::Structured(block) = data else {
                                unreachable!("inserter always reads structured data")
                            };
                            let n = block.len();
                            if n > 0 {
                                last_timestamp = block.last_timestamp().or(last_timestamp);
                                pending.append(block);
                                if let Err(e) = pipe.consume(n).await {
                                    break Err(e);
                                }
                            }
                            if pipe.end_of_interval().await {
                                if let Err(e) = flush(&pool, &stream, &mut pending, chain.as_mut()).await {
                                    break Err(e);
                                }
                                if let Some(ts) = last_timestamp {
                                    if let Err(e) = insert_boundary(&pool, &stream, ts).await {
                                        break Err(e);
                                    }
                                }
                                if let Some(chain) = chain.as_mut() {
                                    chain.reset();
                                }
                            }
                        }
                        Err(JouleError::EmptyPipe) => {
                            break flush(&pool, &stream, &mut pending, chain.as_mut()).await;
                        }
                        Err(e) => break Err(e),
                    }
                }
            }
        };

        if let Err(e) = &result {
            error!(
                "[{}] inserter failed permanently: {}; closing pipe",
                stream.name, e
            );
            let _ = pipe.close().await;
        }
        result
    }
}

/// Insert `pending`'s rows (and their decimations) in one transaction,
/// retrying with exponential backoff on failure. The decimator chain is
/// advanced exactly once, before the retry loop, so a retried attempt
/// re-sends the same (idempotent, `ON CONFLICT`-guarded) rows rather than
/// double-counting samples into the chain's running accumulators.
async fn flush(
    pool: &PgPool,
    stream: &Stream,
    pending: &mut Block,
    chain: Option<&mut DecimatorChain>,
) -> Result<()> {
    if pending.is_empty() {
        return Ok(());
    }
    let mut decimated: Vec<(u32, DecimatedRow)> = Vec::new();
    if let Some(chain) = chain {
        for i in 0..pending.len() {
            let ts = pending.timestamps[i];
            let values = pending.row_values(i);
            for (level_idx, row) in chain.push(ts, &values) {
                decimated.push((chain.factor(level_idx), row));
            }
        }
    }

    let mut backoff = INITIAL_BACKOFF;
    for attempt in 0..=MAX_RETRIES {
        match try_flush(pool, stream, pending, &decimated).await {
            Ok(()) => {
                debug!(
                    "[{}] flushed {} rows ({} decimated) to {}",
                    stream.name,
                    pending.len(),
                    decimated.len(),
                    stream.table_name()
                );
                *pending = Block::empty(stream.layout);
                return Ok(());
            }
            Err(e) if attempt < MAX_RETRIES => {
                warn!(
                    "[{}] flush attempt {} failed: {}; retrying in {:?}",
                    stream.name,
                    attempt + 1,
                    e,
                    backoff
                );
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
            Err(e) => {
                return Err(JouleError::Data(format!(
                    "[{}] flush failed after {} attempts: {}",
                    stream.name, MAX_RETRIES, e
                )));
            }
        }
    }
    unreachable!("loop always returns")
}

async fn try_flush(
    pool: &PgPool,
    stream: &Stream,
    pending: &Block,
    decimated: &[(u32, DecimatedRow)],
) -> Result<()> {
    let mut tx = pool.begin().await?;
    let table = stream.table_name();
    for i in 0..pending.len() {
        let ts = pending.timestamps[i];
        let payload = row_payload(&pending.row_values(i));
        sqlx::query(&format!(
            "INSERT INTO joule.{table} (time, data) VALUES ($1, $2) ON CONFLICT (time) DO NOTHING"
        ))
        .bind(micros_to_datetime(ts))
        .bind(payload)
        .execute(&mut *tx)
        .await?;
    }

    for (factor, row) in decimated {
        let decimated_table = stream.decimated_table_name(*factor);
        let payload = row_payload(&row.to_elems());
        sqlx::query(&format!(
            "INSERT INTO joule.{decimated_table} (time, data) VALUES ($1, $2) \
             ON CONFLICT (time) DO NOTHING"
        ))
        .bind(micros_to_datetime(row.timestamp))
        .bind(payload)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

/// Insert a boundary row at `last_timestamp + 1`. Idempotent: adjacent
/// boundary rows at the same point are a no-op via `ON CONFLICT`.
async fn insert_boundary(pool: &PgPool, stream: &Stream, last_timestamp: u64) -> Result<()> {
    let table = stream.intervals_table_name();
    sqlx::query(&format!(
        "INSERT INTO joule.{table} (time) VALUES ($1) ON CONFLICT (time) DO NOTHING"
    ))
    .bind(micros_to_datetime(last_timestamp + 1))
    .execute(pool)
    .await?;
    Ok(())
}

fn row_payload(values: &[Elem]) -> Vec<u8> {
    let mut out = Vec::new();
    for v in values {
        v.encode(&mut out);
    }
    out
}

pub fn micros_to_datetime(us: u64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(us as i64).unwrap_or_else(|| DateTime::from_timestamp(0, 0).unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn micros_round_trip_through_chrono() {
        let dt = micros_to_datetime(1_700_000_000_123_456);
        assert_eq!(dt.timestamp_micros(), 1_700_000_000_123_456);
    }
}
