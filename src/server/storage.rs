//! Durable log file module: a logger thread appending chosen values to a
//! plain text file, one value per line.

use std::io::SeekFrom;
use std::path::Path;

use crate::message::{ReplicaId, SlotIdx};
use crate::server::slots::LogSink;
use crate::utils::PaxosLogError;

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Log action ID type.
pub type LogActionId = u64;

/// Action command to the logger. File cursor will be positioned at EOF after
/// every action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogAction {
    /// Append one line to EOF.
    Append { entry: String, sync: bool },

    /// Read all lines back.
    ReadAll,

    /// Truncate the file to empty.
    Truncate,
}

/// Action result returned by the logger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogResult {
    /// `now_size` is the size of file after this.
    Append { now_size: usize },

    /// All lines currently in the file.
    ReadAll { entries: Vec<String> },

    /// `now_size` is the size of file after this.
    Truncate { now_size: usize },
}

/// Durable storage logging module.
pub struct StorageHub {
    /// My replica ID.
    me: ReplicaId,

    /// Sender side of the log channel.
    tx_log: mpsc::UnboundedSender<(LogActionId, LogAction)>,

    /// Receiver side of the ack channel.
    rx_ack: mpsc::UnboundedReceiver<(LogActionId, LogResult)>,

    /// Join handle of the logger thread.
    _logger_handle: JoinHandle<()>,
}

// StorageHub public API implementation
impl StorageHub {
    /// Creates a new durable storage logging hub. Spawns the logger thread.
    /// Creates a log channel for submitting logging actions to the logger and
    /// an ack channel for getting results. The backing file is created if
    /// missing and truncated to empty.
    pub async fn new_and_setup(
        me: ReplicaId,
        path: &Path,
    ) -> Result<Self, PaxosLogError> {
        let backer_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .await?;
        pf_info!(me; "backer file '{}' prepared", path.display());

        let (tx_log, rx_log) = mpsc::unbounded_channel();
        let (tx_ack, rx_ack) = mpsc::unbounded_channel();

        let logger_handle =
            tokio::spawn(Self::logger_thread(me, backer_file, rx_log, tx_ack));

        Ok(StorageHub {
            me,
            tx_log,
            rx_ack,
            _logger_handle: logger_handle,
        })
    }

    /// Submits an action by sending it to the log channel.
    pub fn submit_action(
        &mut self,
        id: LogActionId,
        action: LogAction,
    ) -> Result<(), PaxosLogError> {
        self.tx_log
            .send((id, action))
            .map_err(|e| PaxosLogError::msg(e.to_string()))
    }

    /// Waits for the next logging result by receiving from the ack channel.
    pub async fn get_result(
        &mut self,
    ) -> Result<(LogActionId, LogResult), PaxosLogError> {
        match self.rx_ack.recv().await {
            Some((id, result)) => Ok((id, result)),
            None => logged_err!(self.me; "ack channel has been closed"),
        }
    }
}

impl LogSink for StorageHub {
    fn append(
        &mut self,
        slot: SlotIdx,
        value: &str,
    ) -> Result<(), PaxosLogError> {
        self.submit_action(
            slot as LogActionId,
            LogAction::Append {
                entry: value.into(),
                sync: true,
            },
        )
    }
}

// StorageHub logger thread implementation
impl StorageHub {
    /// Append given line to EOF.
    async fn append_entry(
        backer: &mut File,
        file_size: usize,
        entry: &str,
        sync: bool,
    ) -> Result<usize, PaxosLogError> {
        let mut line = Vec::with_capacity(entry.len() + 1);
        line.extend_from_slice(entry.as_bytes());
        line.push(b'\n');
        backer.write_all(&line).await?;

        if sync {
            backer.sync_data().await?;
        }

        Ok(file_size + line.len())
    }

    /// Read all lines of the file.
    async fn read_entries(
        backer: &mut File,
    ) -> Result<Vec<String>, PaxosLogError> {
        backer.seek(SeekFrom::Start(0)).await?;
        let mut content = String::new();
        backer.read_to_string(&mut content).await?;
        backer.seek(SeekFrom::End(0)).await?; // recover cursor to EOF
        Ok(content.lines().map(String::from).collect())
    }

    /// Truncate the file to empty.
    async fn truncate_log(backer: &mut File) -> Result<usize, PaxosLogError> {
        backer.set_len(0).await?;
        backer.seek(SeekFrom::Start(0)).await?;
        Ok(0)
    }

    /// Carry out the given action on logger.
    async fn do_action(
        backer: &mut File,
        file_size: &mut usize,
        action: LogAction,
    ) -> Result<LogResult, PaxosLogError> {
        match action {
            LogAction::Append { entry, sync } => {
                *file_size =
                    Self::append_entry(backer, *file_size, &entry, sync).await?;
                Ok(LogResult::Append {
                    now_size: *file_size,
                })
            }
            LogAction::ReadAll => Self::read_entries(backer)
                .await
                .map(|entries| LogResult::ReadAll { entries }),
            LogAction::Truncate => {
                *file_size = Self::truncate_log(backer).await?;
                Ok(LogResult::Truncate {
                    now_size: *file_size,
                })
            }
        }
    }

    /// Logger thread function.
    async fn logger_thread(
        me: ReplicaId,
        mut backer_file: File,
        mut rx_log: mpsc::UnboundedReceiver<(LogActionId, LogAction)>,
        tx_ack: mpsc::UnboundedSender<(LogActionId, LogResult)>,
    ) {
        pf_debug!(me; "logger thread spawned");

        let mut file_size: usize = 0;
        while let Some((id, action)) = rx_log.recv().await {
            match Self::do_action(&mut backer_file, &mut file_size, action)
                .await
            {
                Ok(result) => {
                    if let Err(e) = tx_ack.send((id, result)) {
                        pf_error!(me; "error sending to tx_ack: {}", e);
                    }
                }
                Err(e) => {
                    pf_error!(me; "error during logging: {}", e);
                }
            }
        }

        // channel gets closed and no messages remain
        pf_debug!(me; "logger thread exitted");
    }
}

#[cfg(test)]
mod storage_tests {
    use super::*;
    use crate::server::slots::LogSlotStore;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn api_log_ack() -> Result<(), PaxosLogError> {
        let path = Path::new("/tmp/test-paxoslog-backer-0.log");
        let mut hub = StorageHub::new_and_setup(0, path).await?;
        hub.submit_action(
            0,
            LogAction::Append {
                entry: "Hi".into(),
                sync: true,
            },
        )?;
        hub.submit_action(
            1,
            LogAction::Append {
                entry: "a:b c".into(),
                sync: false,
            },
        )?;
        hub.submit_action(2, LogAction::ReadAll)?;
        hub.submit_action(3, LogAction::Truncate)?;
        hub.submit_action(4, LogAction::ReadAll)?;
        assert_eq!(
            hub.get_result().await?,
            (0, LogResult::Append { now_size: 3 })
        );
        assert_eq!(
            hub.get_result().await?,
            (1, LogResult::Append { now_size: 9 })
        );
        assert_eq!(
            hub.get_result().await?,
            (
                2,
                LogResult::ReadAll {
                    entries: vec!["Hi".into(), "a:b c".into()]
                }
            )
        );
        assert_eq!(
            hub.get_result().await?,
            (3, LogResult::Truncate { now_size: 0 })
        );
        assert_eq!(
            hub.get_result().await?,
            (4, LogResult::ReadAll { entries: vec![] })
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn store_writes_through() -> Result<(), PaxosLogError> {
        let path = Path::new("/tmp/test-paxoslog-backer-1.log");
        let mut hub = StorageHub::new_and_setup(1, path).await?;
        let mut store = LogSlotStore::new(None);
        store.record_success(1, "second");
        store.record_success(0, "first");
        assert_eq!(store.write(&mut hub)?, 2);
        assert_eq!(hub.get_result().await?.0, 0);
        assert_eq!(hub.get_result().await?.0, 1);
        hub.submit_action(9, LogAction::ReadAll)?;
        assert_eq!(
            hub.get_result().await?,
            (
                9,
                LogResult::ReadAll {
                    entries: vec!["first".into(), "second".into()]
                }
            )
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn setup_truncates() -> Result<(), PaxosLogError> {
        let path = Path::new("/tmp/test-paxoslog-backer-2.log");
        tokio::fs::write(path, "stale\n").await?;
        let mut hub = StorageHub::new_and_setup(2, path).await?;
        hub.submit_action(0, LogAction::ReadAll)?;
        assert_eq!(
            hub.get_result().await?,
            (0, LogResult::ReadAll { entries: vec![] })
        );
        Ok(())
    }
}
