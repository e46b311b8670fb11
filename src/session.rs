use std::{future::Future, time::Duration};

use async_trait::async_trait;
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    time::{Instant, interval_at},
};
use tracing::debug;

use crate::{
    error::ManagerResult,
    hub::{LogRecord, Subscription},
};

/// Idle interval after which a session emits a heartbeat
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Destination of a log session
#[async_trait]
pub trait LogSink: Send {
    async fn record(&mut self, record: &LogRecord) -> ManagerResult<()>;

    async fn heartbeat(&mut self) -> ManagerResult<()>;
}

/// Writes records as server-sent events: `data: <json>` frames and
/// `: heartbeat` comments
pub struct SseSink<W> {
    writer: W,
}

impl<W> SseSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[async_trait]
impl<W> LogSink for SseSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn record(&mut self, record: &LogRecord) -> ManagerResult<()> {
        let data = serde_json::to_string(record)?;
        self.writer
            .write_all(format!("data: {data}\n\n").as_bytes())
            .await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn heartbeat(&mut self) -> ManagerResult<()> {
        self.writer.write_all(b": heartbeat\n\n").await?;
        self.writer.flush().await?;
        Ok(())
    }
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The hub closed the subscription
    Closed,
    /// The consumer went away
    Cancelled,
}

/// Drains one subscription into a sink until the hub closes it or the
/// consumer cancels. The subscription is released on every exit path,
/// including sink errors.
pub struct LogSession {
    subscription: Subscription,
    heartbeat: Duration,
}

impl LogSession {
    pub fn new(subscription: Subscription) -> Self {
        Self {
            subscription,
            heartbeat: HEARTBEAT_INTERVAL,
        }
    }

    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub async fn run<S, C>(self, sink: &mut S, cancel: C) -> ManagerResult<SessionEnd>
    where
        S: LogSink,
        C: Future<Output = ()>,
    {
        let LogSession {
            mut subscription,
            heartbeat,
        } = self;
        tokio::pin!(cancel);
        let mut ticker = interval_at(Instant::now() + heartbeat, heartbeat);

        let end = loop {
            tokio::select! {
                record = subscription.recv() => match record {
                    Some(record) => sink.record(&record).await?,
                    None => break SessionEnd::Closed,
                },
                _ = ticker.tick() => sink.heartbeat().await?,
                _ = &mut cancel => break SessionEnd::Cancelled,
            }
        };

        debug!("Log session {} ended: {:?}", subscription.id(), end);
        Ok(end)
    }
}
