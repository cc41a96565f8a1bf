//! Cross-process framed Pipe (spec §4.D). Uses the same contract as the
//! in-process pipe — a `Pipe` handle still owns the queue, read buffer and
//! subscribers — but instead of a caller driving `write`/`read` directly,
//! a background task "pumps" bytes to or from an async byte stream
//! (subprocess stdio, or a socket). Interval markers are encoded as one
//! `interval_token` record; reader chunks arbitrary byte arrivals into
//! whole-record boundaries and holds partial tails; EOF closes the pipe.

use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::block::Block;
use crate::error::{JouleError, Result};
use crate::layout::{interval_token_row, is_interval_token, Layout};
use crate::pipe::local::{Pipe, ReadData};

const READ_CHUNK: usize = 64 * 1024;

/// Construct a framed pipe and spawn the task that reads raw records from
/// `reader` into it. Returns the pipe handle immediately; the pump task
/// keeps running until EOF or a decode error, at which point it closes
/// the pipe (spec §4.D: "EOF on the byte stream closes the pipe").
pub fn spawn_reader<R>(layout: Layout, name: impl Into<String>, reader: R) -> Pipe
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let pipe = Pipe::new_framed(layout, name);
    spawn_pump(pipe.clone(), reader, true);
    pipe
}

/// Spawn the task that pumps raw records from `reader` into an existing
/// pipe, without closing it on EOF. Used by the Worker to feed an output
/// pipe that must outlive any single subprocess generation: EOF on a
/// module's output fd ends that generation, but the pipe (and its bound
/// Inserter) stays open across the restart (spec §4.G's restart
/// contract).
pub fn pump_into<R>(sink: Pipe, reader: R) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    spawn_pump(sink, reader, false)
}

fn spawn_pump<R>(sink: Pipe, mut reader: R, close_on_eof: bool) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let layout = sink.layout;
        let row_width = layout.raw_row_width();
        let mut pending = Vec::new();
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            let n = match reader.read(&mut chunk).await {
                Ok(0) => {
                    debug!("[{}] EOF on framed reader", sink.name);
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    warn!("[{}] framed reader error: {}", sink.name, e);
                    break;
                }
            };
            pending.extend_from_slice(&chunk[..n]);

            let whole = (pending.len() / row_width) * row_width;
            if whole > 0 {
                if let Err(e) = emit_records(&sink, layout, &pending[..whole]).await {
                    warn!("[{}] framed reader write failed: {}", sink.name, e);
                    break;
                }
                pending.drain(..whole);
            }
        }
        if close_on_eof {
            let _ = sink.close().await;
        }
    })
}

/// Split a buffer of whole raw records into runs of ordinary data
/// separated by interval tokens, and apply them to `sink` in order.
async fn emit_records(sink: &Pipe, layout: Layout, bytes: &[u8]) -> Result<()> {
    let row_width = layout.raw_row_width();
    let mut run_start = 0usize;
    let mut offset = 0usize;
    while offset < bytes.len() {
        let row = &bytes[offset..offset + row_width];
        if is_interval_token(row) {
            if offset > run_start {
                let (block, _) = Block::decode_raw(layout, &bytes[run_start..offset]);
                sink.write(block).await?;
            }
            sink.close_interval().await?;
            run_start = offset + row_width;
        }
        offset += row_width;
    }
    if run_start < bytes.len() {
        let (block, _) = Block::decode_raw(layout, &bytes[run_start..]);
        sink.write(block).await?;
    }
    Ok(())
}

/// Construct a framed pipe and spawn the task that reads blocks from
/// `source` (typically a subscriber Pipe) and writes raw records to
/// `writer`. Stops when `source` reports `EmptyPipe` (producer closed) or
/// the underlying stream errors.
pub fn spawn_writer<W>(source: Pipe, mut writer: W) -> tokio::task::JoinHandle<Result<()>>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let data = match source.read(false).await {
                Ok(data) => data,
                Err(JouleError::EmptyPipe) => break,
                Err(e) => return Err(e),
            };
            let ReadData::Structured(block) = data else {
                unreachable!("framed writer always reads structured data")
            };
            let n = block.len();
            if n > 0 {
                writer.write_all(&block.encode_raw()).await?;
            }
            let end_of_interval = source.end_of_interval().await;
            if end_of_interval {
                writer
                    .write_all(&interval_token_row(&source.layout, false))
                    .await?;
            }
            source.consume(n).await?;
        }
        writer.shutdown().await?;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::Layout;
    use tokio_test::io::Builder;

    #[tokio::test]
    async fn reader_decodes_records_and_interval_tokens() {
        let layout = Layout::parse("int32_1").unwrap();
        let row1 = Block::from_flat_values(layout, &[vec![10.0, 1.0]]).encode_raw();
        let token = interval_token_row(&layout, false);
        let row2 = Block::from_flat_values(layout, &[vec![20.0, 2.0]]).encode_raw();

        let reader = Builder::new()
            .read(&row1)
            .read(&token)
            .read(&row2)
            .build();
        let pipe = spawn_reader(layout, "test", reader);

        let data = pipe.read(false).await.unwrap();
        assert_eq!(data.len(), 1);
        assert!(pipe.end_of_interval().await);
        pipe.consume(1).await.unwrap();

        let data = pipe.read(false).await.unwrap();
        assert_eq!(data.len(), 1);
        assert!(!pipe.end_of_interval().await);
    }

    #[tokio::test]
    async fn writer_emits_raw_records_and_interval_token() {
        let layout = Layout::parse("int32_1").unwrap();
        let source = Pipe::new(layout, "source");
        source
            .write(Block::from_flat_values(layout, &[vec![10.0, 1.0]]))
            .await
            .unwrap();
        source.close_interval().await.unwrap();
        source.close().await.unwrap();

        let row1 = Block::from_flat_values(layout, &[vec![10.0, 1.0]]).encode_raw();
        let token = interval_token_row(&layout, false);
        let writer = Builder::new().write(&row1).write(&token).build();

        spawn_writer(source, writer).await.unwrap().unwrap();
    }
}
