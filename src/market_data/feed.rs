// =============================================================================
// Feed Reader -- JSON-lines producers for the ingest channel
// =============================================================================
//
// The engine never fetches data itself. Upstream collectors write JSON lines
// to a file or pipe them to stdin; each configured feed gets one reader task
// that forwards raw lines into the bounded ingest channel. Parsing happens on
// the ingest side so malformed lines are counted with every other rejection.

use std::path::PathBuf;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Where a feed's lines come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedSource {
    Stdin,
    File(PathBuf),
}

impl FeedSource {
    /// `-` means stdin, anything else is a file path.
    pub fn parse(spec: &str) -> Self {
        match spec.trim() {
            "-" => Self::Stdin,
            path => Self::File(PathBuf::from(path)),
        }
    }
}

impl std::fmt::Display for FeedSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdin => write!(f, "stdin"),
            Self::File(p) => write!(f, "{}", p.display()),
        }
    }
}

/// One raw line tagged with the feed it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedLine {
    pub feed: String,
    pub line: String,
}

/// Forward every non-blank line of `reader` into `tx`.
///
/// Returns the number of lines forwarded. Stops early, without error, when
/// the receiving side has gone away.
pub async fn pump_lines<R>(name: &str, reader: R, tx: &mpsc::Sender<FeedLine>) -> Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let mut forwarded = 0u64;

    while let Some(line) = lines
        .next_line()
        .await
        .with_context(|| format!("failed to read from feed {name}"))?
    {
        if line.trim().is_empty() {
            continue;
        }
        let msg = FeedLine {
            feed: name.to_string(),
            line,
        };
        if tx.send(msg).await.is_err() {
            warn!(feed = %name, "ingest channel closed -- feed reader stopping");
            break;
        }
        forwarded += 1;
    }

    Ok(forwarded)
}

/// Read a whole feed source into the ingest channel.
pub async fn run_feed(name: &str, source: FeedSource, tx: mpsc::Sender<FeedLine>) -> Result<u64> {
    info!(feed = %name, source = %source, "feed reader started");

    let forwarded = match &source {
        FeedSource::Stdin => pump_lines(name, tokio::io::stdin(), &tx).await?,
        FeedSource::File(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("failed to open feed file {}", path.display()))?;
            pump_lines(name, file, &tx).await?
        }
    };

    info!(feed = %name, source = %source, forwarded, "feed exhausted");
    Ok(forwarded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_parsing() {
        assert_eq!(FeedSource::parse("-"), FeedSource::Stdin);
        assert_eq!(
            FeedSource::parse("data/ticks.jsonl"),
            FeedSource::File(PathBuf::from("data/ticks.jsonl"))
        );
    }

    #[tokio::test]
    async fn pump_skips_blank_lines() {
        let input: &[u8] = b"{\"a\":1}\n\n   \n{\"b\":2}\n";
        let (tx, mut rx) = mpsc::channel(8);
        let n = pump_lines("test", input, &tx).await.unwrap();
        assert_eq!(n, 2);
        drop(tx);
        let first = rx.recv().await.unwrap();
        assert_eq!(first.feed, "test");
        assert_eq!(first.line, "{\"a\":1}");
        assert_eq!(rx.recv().await.unwrap().line, "{\"b\":2}");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn pump_stops_when_receiver_dropped() {
        let input: &[u8] = b"1\n2\n3\n";
        let (tx, rx) = mpsc::channel(8);
        drop(rx);
        let n = pump_lines("test", input, &tx).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        let (tx, _rx) = mpsc::channel(1);
        let res = run_feed("market", FeedSource::File("/no/such/feed.jsonl".into()), tx).await;
        assert!(res.is_err());
    }
}
