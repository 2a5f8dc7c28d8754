//! HTTP transfer lanes.
//!
//! Each lane streams one resource body into the download directory and
//! reports back through [`LaneEvent`]s.

use crate::error::Result as ClientResult;
use futures_util::StreamExt;
use pulseboard_sync::{LaneEvent, LaneId, LaneLauncher, Result, SyncError};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use url::Url;

pub type LaneEvents = mpsc::UnboundedReceiver<LaneEvent>;

/// `{session_id}-{resource}-{round}.csv`
pub fn lane_file_name(lane: &LaneId, round: u32) -> String {
    format!("{}-{}-{}.csv", lane.session_id, lane.resource, round)
}

#[derive(Debug)]
pub struct HttpLaneLauncher {
    client: reqwest::Client,
    download_dir: PathBuf,
    events: mpsc::UnboundedSender<LaneEvent>,
    tasks: Vec<JoinHandle<()>>,
}

impl HttpLaneLauncher {
    pub fn new(download_dir: impl Into<PathBuf>) -> (Self, LaneEvents) {
        Self::with_client(reqwest::Client::new(), download_dir)
    }

    pub fn with_client(client: reqwest::Client, download_dir: impl Into<PathBuf>) -> (Self, LaneEvents) {
        let (events, receiver) = mpsc::unbounded_channel();
        (
            Self {
                client,
                download_dir: download_dir.into(),
                events,
                tasks: Vec::new(),
            },
            receiver,
        )
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    /// Lanes launched and not yet finished.
    pub fn active(&self) -> usize {
        self.tasks.iter().filter(|task| !task.is_finished()).count()
    }
}

impl LaneLauncher for HttpLaneLauncher {
    fn launch(&mut self, lane: &LaneId, round: u32, url: Url) -> Result<()> {
        let handle = Handle::try_current()
            .map_err(|error| SyncError::Transport(format!("no async runtime: {error}")))?;
        let path = self.download_dir.join(lane_file_name(lane, round));
        debug!(url = %url, path = %path.display(), "lane scheduled");
        self.tasks.retain(|task| !task.is_finished());
        self.tasks.push(handle.spawn(run_lane(
            self.client.clone(),
            lane.clone(),
            round,
            url,
            path,
            self.events.clone(),
        )));
        Ok(())
    }
}

impl Drop for HttpLaneLauncher {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

async fn run_lane(
    client: reqwest::Client,
    lane: LaneId,
    round: u32,
    url: Url,
    path: PathBuf,
    events: mpsc::UnboundedSender<LaneEvent>,
) {
    let emit = |event: LaneEvent| {
        if events.send(event).is_err() {
            debug!("lane event dropped, receiver gone");
        }
    };

    emit(LaneEvent::Running {
        lane: lane.clone(),
        round,
    });
    match download(&client, url, &path).await {
        Ok(bytes) => {
            info!(path = %path.display(), bytes, "lane body saved");
            emit(LaneEvent::Finished { lane, round, bytes });
        }
        Err(error) => emit(LaneEvent::Failed {
            lane,
            round,
            reason: error.to_string(),
        }),
    }
}

async fn download(client: &reqwest::Client, url: Url, path: &Path) -> ClientResult<u64> {
    let response = client.get(url).send().await?.error_for_status()?;
    let mut file = tokio::fs::File::create(path).await?;
    let mut body = response.bytes_stream();
    let mut written = 0_u64;
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    Ok(written)
}
