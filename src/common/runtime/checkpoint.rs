use anyhow::{anyhow, bail, Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const PARAMS_FILE: &str = "params.bin";
const OPTIMIZER_FILE: &str = "optimizer.bin";
const STEP_FILE: &str = "step";

/// Encoded training state: module record, optimizer record and the number
/// of optimizer steps taken so far.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Checkpoint {
    pub params: Vec<u8>,
    pub optimizer: Vec<u8>,
    pub step: usize,
}

pub trait CheckpointStore: Send + Sync {
    fn save(&self, checkpoint: &Checkpoint) -> Result<()>;
    fn load(&self) -> Result<Checkpoint>;
}

/// Three files in one directory, created on save.
#[derive(Clone, Debug)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn read(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.dir.join(name);
        std::fs::read(&path).with_context(|| format!("failed to read {}", path.display()))
    }

    fn write(&self, name: &str, bytes: &[u8]) -> Result<()> {
        let path = self.dir.join(name);
        std::fs::write(&path, bytes).with_context(|| format!("failed to write {}", path.display()))
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        std::fs::create_dir_all(&self.dir).with_context(|| {
            format!("failed to create checkpoint directory {}", self.dir.display())
        })?;
        self.write(PARAMS_FILE, &checkpoint.params)?;
        self.write(OPTIMIZER_FILE, &checkpoint.optimizer)?;
        self.write(STEP_FILE, checkpoint.step.to_string().as_bytes())
    }

    fn load(&self) -> Result<Checkpoint> {
        let raw_step = String::from_utf8(self.read(STEP_FILE)?)
            .context("checkpoint step file is not UTF-8")?;
        let step = raw_step
            .trim()
            .parse::<usize>()
            .with_context(|| format!("invalid checkpoint step {raw_step:?}"))?;
        Ok(Checkpoint {
            params: self.read(PARAMS_FILE)?,
            optimizer: self.read(OPTIMIZER_FILE)?,
            step,
        })
    }
}

#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    slot: Mutex<Option<Checkpoint>>,
}

impl CheckpointStore for MemoryCheckpointStore {
    fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let mut slot = self
            .slot
            .lock()
            .map_err(|_| anyhow!("checkpoint slot poisoned"))?;
        *slot = Some(checkpoint.clone());
        Ok(())
    }

    fn load(&self) -> Result<Checkpoint> {
        let slot = self
            .slot
            .lock()
            .map_err(|_| anyhow!("checkpoint slot poisoned"))?;
        match slot.as_ref() {
            Some(checkpoint) => Ok(checkpoint.clone()),
            None => bail!("no checkpoint has been saved"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Checkpoint {
        Checkpoint {
            params: vec![1, 2, 3],
            optimizer: vec![9, 8],
            step: 42,
        }
    }

    #[test]
    fn memory_store_round_trips() {
        let store = MemoryCheckpointStore::default();
        assert!(store.load().is_err());
        store.save(&sample()).unwrap();
        assert_eq!(store.load().unwrap(), sample());
    }

    #[test]
    fn file_store_round_trips() {
        let dir = std::env::temp_dir().join(format!("marl_ppo_ckpt_{}", std::process::id()));
        let store = FileCheckpointStore::new(&dir);
        store.save(&sample()).unwrap();
        let loaded = store.load();
        std::fs::remove_dir_all(&dir).ok();
        assert_eq!(loaded.unwrap(), sample());
    }
}
