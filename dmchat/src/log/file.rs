//! File-backed message log.
//!
//! Each conversation gets its own file under the log directory. A file is a
//! concatenation of length-prefixed postcard frames (see
//! [`dmchat_proto::codec`]), so appends never rewrite existing data and a
//! torn trailing write only loses that last record. The next append cuts
//! such a tail off before writing, so later records stay readable.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

use dmchat_proto::codec::{self, LogRecord};
use dmchat_proto::message::{ConversationId, Message, MessageId};

use super::{LogError, MessageLog};

/// Extension of per-conversation log files.
const LOG_EXTENSION: &str = "dmlog";

/// A [`MessageLog`] persisted to one file per conversation.
pub struct FileLog {
    dir: PathBuf,
    /// File length after this log's last write, per conversation. Also
    /// serializes appends so frames never interleave.
    written: Mutex<HashMap<ConversationId, u64>>,
}

impl FileLog {
    /// Open (creating if needed) a log rooted at `dir`.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::Io`] if the directory cannot be created.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, LogError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        tracing::debug!(dir = %dir.display(), "opened message log");
        Ok(Self {
            dir,
            written: Mutex::new(HashMap::new()),
        })
    }

    /// Directory holding the log files.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the file holding one conversation's records.
    #[must_use]
    pub fn path_for(&self, conversation: &ConversationId) -> PathBuf {
        self.dir
            .join(format!("{}.{LOG_EXTENSION}", file_stem(conversation)))
    }

    async fn read_records(&self, conversation: &ConversationId) -> Result<Vec<Message>, LogError> {
        let path = self.path_for(conversation);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let (records, consumed) = codec::decode_all(&bytes);
        if consumed < bytes.len() {
            tracing::warn!(
                path = %path.display(),
                skipped = bytes.len() - consumed,
                "ignoring torn or corrupt tail of message log"
            );
        }

        Ok(records
            .into_iter()
            .filter(|record| record.conversation == *conversation)
            .map(|record| record.message)
            .collect())
    }
}

/// Length of the complete frames at the start of `path`.
async fn valid_prefix(path: &Path) -> Result<u64, LogError> {
    let bytes = tokio::fs::read(path).await?;
    let (_, consumed) = codec::decode_all(&bytes);
    Ok(consumed as u64)
}

async fn file_len(path: &Path) -> Result<u64, LogError> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(meta.len()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e.into()),
    }
}

/// Maps a conversation id to a filesystem-safe file stem.
///
/// ASCII alphanumerics, `-` and `_` pass through; every other byte is
/// written as `%XX`, so distinct ids never share a file.
fn file_stem(conversation: &ConversationId) -> String {
    use std::fmt::Write;

    let mut stem = String::with_capacity(conversation.as_str().len());
    for byte in conversation.as_str().bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            stem.push(char::from(byte));
        } else {
            let _ = write!(stem, "%{byte:02X}");
        }
    }
    stem
}

impl MessageLog for FileLog {
    async fn append(&self, conversation: &ConversationId, message: &Message) -> Result<(), LogError> {
        if !message.is_confirmed() {
            return Err(LogError::Unconfirmed);
        }
        let frame = codec::encode_framed(&LogRecord {
            conversation: conversation.clone(),
            message: message.clone(),
        })?;

        let mut written = self.written.lock().await;
        let known = written.remove(conversation);
        let path = self.path_for(conversation);

        let on_disk = file_len(&path).await?;
        let end = if on_disk == 0 || known == Some(on_disk) {
            on_disk
        } else {
            valid_prefix(&path).await?
        };

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .await?;
        if end < on_disk {
            tracing::warn!(
                path = %path.display(),
                dropped = on_disk - end,
                "cutting torn tail off message log"
            );
            file.set_len(end).await?;
        }
        file.seek(SeekFrom::Start(end)).await?;
        file.write_all(&frame).await?;
        file.flush().await?;

        written.insert(conversation.clone(), end + frame.len() as u64);
        Ok(())
    }

    async fn latest_offset(
        &self,
        conversation: &ConversationId,
    ) -> Result<Option<MessageId>, LogError> {
        Ok(self
            .read_records(conversation)
            .await?
            .into_iter()
            .rev()
            .find_map(|message| message.id))
    }

    async fn load(&self, conversation: &ConversationId) -> Result<Vec<Message>, LogError> {
        self.read_records(conversation).await
    }
}
