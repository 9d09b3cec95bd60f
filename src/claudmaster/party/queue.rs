//! Append-only JSONL logs backing the party queues.
//!
//! One JSON document per line, append-only, fsync after each append. Status
//! changes are modelled as re-appended records; loading replays the log and
//! keeps the latest record per id, enforcing that `status` only ever advances
//! (a stale append is dropped with a warning rather than rewinding state).

use crate::claudmaster::party::protocol::{ActionStatus, PartyAction, PartyResponse};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// A typed append-only JSONL file.
#[derive(Debug)]
pub struct JsonlLog<T> {
    path: PathBuf,
    _marker: std::marker::PhantomData<T>,
}

impl<T: Serialize + DeserializeOwned> JsonlLog<T> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _marker: std::marker::PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record and fsync.
    pub fn append(&self, record: &T) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let line = serde_json::to_string(record)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        file.sync_data()?;
        Ok(())
    }

    /// Read every record in append order. A torn final line (crash mid-append)
    /// is skipped; anything unparsable earlier is reported.
    pub fn load(&self) -> io::Result<Vec<T>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = fs::File::open(&self.path)?;
        let reader = BufReader::new(file);
        let mut records = Vec::new();
        let mut lines = reader.lines().peekable();
        while let Some(line) = lines.next() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(record) => records.push(record),
                Err(e) => {
                    let is_last = lines.peek().is_none();
                    if is_last {
                        log::warn!(
                            "dropping torn final line in {}: {}",
                            self.path.display(),
                            e
                        );
                    } else {
                        return Err(io::Error::new(io::ErrorKind::InvalidData, e));
                    }
                }
            }
        }
        Ok(records)
    }
}

/// The action queue: `party/actions.jsonl` plus an in-memory view.
#[derive(Debug)]
pub struct ActionQueue {
    log: JsonlLog<PartyAction>,
    /// Latest record per action id.
    actions: HashMap<String, PartyAction>,
    /// Ids still awaiting processing, in submission order.
    pending: Vec<String>,
}

impl ActionQueue {
    /// Open the queue, replaying any persisted records.
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let log = JsonlLog::new(path);
        let mut queue = Self {
            log,
            actions: HashMap::new(),
            pending: Vec::new(),
        };
        for record in queue.log.load()? {
            queue.integrate(record);
        }
        Ok(queue)
    }

    fn integrate(&mut self, record: PartyAction) {
        let existing_status = self.actions.get(&record.id).map(|a| a.status);
        match existing_status {
            Some(status) if record.status.rank() < status.rank() => {
                log::warn!(
                    "ignoring status rewind for action {}: {:?} -> {:?}",
                    record.id,
                    status,
                    record.status
                );
            }
            Some(_) => {
                if record.status != ActionStatus::Queued {
                    self.pending.retain(|id| id != &record.id);
                }
                if record.status == ActionStatus::Processing {
                    // Still in flight across a restart: requeue it.
                    self.pending.push(record.id.clone());
                }
                self.actions.insert(record.id.clone(), record);
            }
            None => {
                if matches!(record.status, ActionStatus::Queued | ActionStatus::Processing) {
                    self.pending.push(record.id.clone());
                }
                self.actions.insert(record.id.clone(), record);
            }
        }
    }

    /// Append a freshly submitted action with status `Queued`.
    pub fn submit(&mut self, action: PartyAction) -> io::Result<()> {
        self.log.append(&action)?;
        self.integrate(action);
        Ok(())
    }

    /// Advance an action's status, appending the transition to the log.
    /// Rewinds are rejected.
    pub fn advance(&mut self, action_id: &str, status: ActionStatus) -> io::Result<()> {
        let Some(current) = self.actions.get(action_id) else {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("unknown action {}", action_id),
            ));
        };
        if status.rank() < current.status.rank() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "status of {} may not rewind ({:?} -> {:?})",
                    action_id, current.status, status
                ),
            ));
        }
        let mut updated = current.clone();
        updated.status = status;
        self.log.append(&updated)?;
        self.integrate(updated);
        Ok(())
    }

    /// Next action awaiting processing, oldest first.
    pub fn next_pending(&self) -> Option<&PartyAction> {
        self.pending.first().and_then(|id| self.actions.get(id))
    }

    pub fn get(&self, action_id: &str) -> Option<&PartyAction> {
        self.actions.get(action_id)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// The response log: `party/responses.jsonl`.
#[derive(Debug)]
pub struct ResponseQueue {
    log: JsonlLog<PartyResponse>,
    responses: Vec<PartyResponse>,
}

impl ResponseQueue {
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let log = JsonlLog::new(path);
        let responses = log.load()?;
        Ok(Self { log, responses })
    }

    pub fn publish(&mut self, response: PartyResponse) -> io::Result<()> {
        self.log.append(&response)?;
        self.responses.push(response);
        Ok(())
    }

    pub fn all(&self) -> &[PartyResponse] {
        &self.responses
    }

    pub fn len(&self) -> usize {
        self.responses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.responses.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claudmaster::session::ActionSource;
    use chrono::Utc;

    fn action(id: &str, status: ActionStatus) -> PartyAction {
        PartyAction {
            id: id.to_string(),
            participant_id: "pA".to_string(),
            text: "I cast light".to_string(),
            source: ActionSource::Text,
            status,
            submitted_at: Utc::now(),
        }
    }

    #[test]
    fn queue_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("actions.jsonl");

        {
            let mut queue = ActionQueue::open(&path).unwrap();
            queue.submit(action("a1", ActionStatus::Queued)).unwrap();
            queue.submit(action("a2", ActionStatus::Queued)).unwrap();
            queue.advance("a1", ActionStatus::Resolved).unwrap();
        }

        let queue = ActionQueue::open(&path).unwrap();
        assert_eq!(queue.pending_len(), 1);
        assert_eq!(queue.next_pending().unwrap().id, "a2");
        assert_eq!(queue.get("a1").unwrap().status, ActionStatus::Resolved);
    }

    #[test]
    fn status_never_rewinds() {
        let dir = tempfile::tempdir().unwrap();
        let mut queue = ActionQueue::open(dir.path().join("actions.jsonl")).unwrap();
        queue.submit(action("a1", ActionStatus::Queued)).unwrap();
        queue.advance("a1", ActionStatus::Resolved).unwrap();
        assert!(queue.advance("a1", ActionStatus::Queued).is_err());
    }

    #[test]
    fn torn_final_line_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("responses.jsonl");
        {
            let mut queue = ResponseQueue::open(&path).unwrap();
            queue
                .publish(PartyResponse {
                    id: "r1".into(),
                    action_id: "a1".into(),
                    public: Some("The room is dark.".into()),
                    private_by_recipient: Default::default(),
                    dm_only: None,
                    produced_at: Utc::now(),
                })
                .unwrap();
        }
        // Simulate a crash mid-append.
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"id\": \"r2\", \"trunc").unwrap();

        let queue = ResponseQueue::open(&path).unwrap();
        assert_eq!(queue.len(), 1);
    }
}
