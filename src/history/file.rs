use async_trait::async_trait;
use chrono::Utc;
use log::{ debug, info, warn };
use serde::{ Deserialize, Serialize };
use std::io::SeekFrom;
use std::path::{ Path, PathBuf };
use std::sync::atomic::{ AtomicBool, Ordering };
use tokio::fs::{ self, File, OpenOptions };
use tokio::io::{ AsyncReadExt, AsyncSeekExt, AsyncWriteExt };
use tokio::sync::{ Mutex, RwLock };
use crate::errors::StoreError;
use crate::history::{ BoundedSessions, SessionStore };
use crate::models::chat::Turn;

#[derive(Serialize, Deserialize)]
struct LogRecord {
    key: String,
    turns: Vec<Turn>,
    #[serde(default)]
    stored_at: i64,
}

struct LogWriter {
    file: File,
    /// Bytes in the log, excluding any partial record a failed append could
    /// not truncate away.
    len: u64,
    records: usize,
    /// The log does not end on a line boundary; the next append starts with
    /// a newline so it never fuses with the broken record.
    torn: bool,
}

/// Session store persisted as a JSON-lines append log.
///
/// Every `set` appends one record; opening the store replays the log with the
/// same eviction rules, so the last record for a key wins. Once the log holds
/// more than twice as many records as live sessions it is rewritten.
///
/// The session map and the log have separate locks. Reads only take the map
/// lock, and only for the in-memory lookup.
pub struct FileSessionStore {
    path: PathBuf,
    sessions: RwLock<BoundedSessions>,
    log: Mutex<LogWriter>,
    compacting: AtomicBool,
}

impl FileSessionStore {
    pub async fn open(path: impl AsRef<Path>, capacity: usize) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let mut sessions = BoundedSessions::new(capacity);
        let mut records = 0;
        let mut torn = false;
        match fs::read(&path).await {
            Ok(bytes) => {
                torn = bytes.last().map_or(false, |b| *b != b'\n');
                let content = String::from_utf8_lossy(&bytes);
                for (line_no, line) in content.lines().enumerate() {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<LogRecord>(line) {
                        Ok(record) => {
                            sessions.insert(&record.key, record.turns);
                            records += 1;
                        }
                        Err(e) => {
                            warn!(
                                "Skipping corrupted session record at {}:{}: {}",
                                path.display(),
                                line_no + 1,
                                e
                            );
                        }
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e.into());
            }
        }
        info!(
            "Loaded {} sessions from {} ({} log records)",
            sessions.len(),
            path.display(),
            records
        );

        let file = Self::open_log(&path).await?;
        let len = file.metadata().await?.len();
        let needs_compaction = records > 2 * sessions.len().max(1);
        let store = Self {
            path,
            sessions: RwLock::new(sessions),
            log: Mutex::new(LogWriter { file, len, records, torn }),
            compacting: AtomicBool::new(false),
        };

        if needs_compaction {
            store.compact().await;
        }

        Ok(store)
    }

    async fn open_log(path: &Path) -> Result<File, StoreError> {
        Ok(OpenOptions::new().create(true).append(true).open(path).await?)
    }

    fn tmp_path(&self) -> PathBuf {
        self.path.with_extension("jsonl.tmp")
    }

    /// Appends one record. On failure the log is cut back to its last record
    /// boundary so a half-written line cannot swallow the next record.
    async fn append(log: &mut LogWriter, record: &str) -> Result<(), StoreError> {
        let mut line = String::with_capacity(record.len() + 2);
        if log.torn {
            line.push('\n');
        }
        line.push_str(record);
        line.push('\n');

        if let Err(e) = Self::write_line(&mut log.file, line.as_bytes()).await {
            match log.file.set_len(log.len).await {
                Ok(()) => {
                    warn!("Session log append failed, truncated back to {} bytes", log.len);
                }
                Err(truncate_err) => {
                    warn!("Session log append failed and could not be truncated: {}", truncate_err);
                    log.torn = true;
                }
            }
            return Err(e.into());
        }

        log.len += line.len() as u64;
        log.records += 1;
        log.torn = false;
        Ok(())
    }

    async fn write_line(file: &mut File, line: &[u8]) -> std::io::Result<()> {
        file.write_all(line).await?;
        file.flush().await
    }

    /// Best effort: a failed rewrite leaves the uncompacted log in place.
    async fn compact(&self) {
        if self.compacting.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.rewrite_log().await {
            warn!("Compaction of {} failed, keeping the full log: {}", self.path.display(), e);
            let _ = fs::remove_file(self.tmp_path()).await;
        }
        self.compacting.store(false, Ordering::Release);
    }

    /// Writes the live sessions to a temp file without holding either lock,
    /// then, under the log lock, carries over records appended in the
    /// meantime and swaps the file in.
    async fn rewrite_log(&self) -> Result<(), StoreError> {
        let stored_at = Utc::now().timestamp();
        let (snapshot, checkpoint) = {
            let log = self.log.lock().await;
            let sessions = self.sessions.read().await;
            let snapshot: Vec<LogRecord> = sessions
                .iter()
                .map(|(key, turns)| LogRecord { key: key.clone(), turns: turns.clone(), stored_at })
                .collect();
            (snapshot, log.len)
        };

        let mut content = String::new();
        for record in &snapshot {
            content.push_str(&serde_json::to_string(record)?);
            content.push('\n');
        }
        let tmp_path = self.tmp_path();
        fs::write(&tmp_path, &content).await?;

        let mut log = self.log.lock().await;
        let tail = Self::read_from(&self.path, checkpoint).await?;
        if !tail.is_empty() {
            let mut tmp = OpenOptions::new().append(true).open(&tmp_path).await?;
            Self::write_line(&mut tmp, &tail).await?;
        }
        fs::rename(&tmp_path, &self.path).await?;

        let carried = tail
            .split(|b| *b == b'\n')
            .filter(|line| !line.iter().all(u8::is_ascii_whitespace))
            .count();
        let previous = log.records;
        log.file = Self::open_log(&self.path).await?;
        log.len = (content.len() + tail.len()) as u64;
        log.records = snapshot.len() + carried;
        log.torn = tail.last().map_or(false, |b| *b != b'\n');
        debug!(
            "Compacted session log {} from {} to {} records",
            self.path.display(),
            previous,
            log.records
        );
        Ok(())
    }

    async fn read_from(path: &Path, offset: u64) -> Result<Vec<u8>, StoreError> {
        let mut file = File::open(path).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut rest = Vec::new();
        file.read_to_end(&mut rest).await?;
        Ok(rest)
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<Turn>>, StoreError> {
        Ok(self.sessions.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, turns: Vec<Turn>) -> Result<(), StoreError> {
        let record = LogRecord {
            key: key.to_string(),
            turns,
            stored_at: Utc::now().timestamp(),
        };
        let line = serde_json::to_string(&record)?;

        let needs_compaction = {
            let mut log = self.log.lock().await;
            Self::append(&mut log, &line).await?;

            let mut sessions = self.sessions.write().await;
            let evicted = sessions.insert(key, record.turns);
            if !evicted.is_empty() {
                debug!("Evicted {} sessions to stay within capacity", evicted.len());
            }
            log.records > 2 * sessions.len()
        };

        if needs_compaction {
            self.compact().await;
        }
        Ok(())
    }

    async fn len(&self) -> Result<usize, StoreError> {
        Ok(self.sessions.read().await.len())
    }
}
