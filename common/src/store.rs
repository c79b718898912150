use crate::{
    config::{merge_color, validate_credentials, Configuration},
    error::{ClockError, StorageError},
    types::{ColorUpdate, ConfigUpdate, FieldGroup, RejectedField},
};

/// Serialized configuration must fit the device's storage slot.
pub const MAX_CONFIG_BLOB_BYTES: usize = 512;

/// Durable slot holding one configuration blob. Implementations must commit
/// a write completely or not at all.
pub trait BlobStorage {
    fn read_blob(&self) -> Result<Option<Vec<u8>>, StorageError>;

    fn write_blob(&mut self, bytes: &[u8]) -> Result<(), StorageError>;
}

/// In-memory slot, with a switch to make writes fail.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    blob: Option<Vec<u8>>,
    fail_writes: bool,
    writes: usize,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_blob(blob: Vec<u8>) -> Self {
        Self {
            blob: Some(blob),
            ..Self::default()
        }
    }

    pub fn set_fail_writes(&mut self, fail: bool) {
        self.fail_writes = fail;
    }

    pub fn blob(&self) -> Option<&[u8]> {
        self.blob.as_deref()
    }

    pub fn writes(&self) -> usize {
        self.writes
    }
}

impl BlobStorage for MemoryStorage {
    fn read_blob(&self) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.blob.clone())
    }

    fn write_blob(&mut self, bytes: &[u8]) -> Result<(), StorageError> {
        if self.fail_writes {
            return Err(StorageError::Backend("write rejected".to_string()));
        }
        self.blob = Some(bytes.to_vec());
        self.writes += 1;
        Ok(())
    }
}

pub fn encode_configuration(config: &Configuration) -> Result<Vec<u8>, StorageError> {
    let bytes = serde_json::to_vec(config).map_err(StorageError::Encode)?;
    if bytes.len() > MAX_CONFIG_BLOB_BYTES {
        return Err(StorageError::TooLarge {
            size: bytes.len(),
            capacity: MAX_CONFIG_BLOB_BYTES,
        });
    }
    Ok(bytes)
}

pub fn decode_configuration(bytes: &[u8]) -> Result<Configuration, StorageError> {
    let mut config: Configuration =
        serde_json::from_slice(bytes).map_err(StorageError::Decode)?;
    config.sanitize();
    Ok(config)
}

/// Owns the single in-memory configuration and its durable copy.
#[derive(Debug)]
pub struct ConfigStore<S> {
    storage: S,
    current: Configuration,
    dirty: bool,
}

impl<S: BlobStorage> ConfigStore<S> {
    /// Starts from defaults; call [`ConfigStore::load`] to pick up the stored copy.
    pub fn new(storage: S) -> Self {
        Self {
            storage,
            current: Configuration::default(),
            dirty: false,
        }
    }

    /// Replaces the in-memory configuration with the durable copy, or with
    /// defaults when nothing was stored yet. On error the in-memory copy is
    /// left as it was.
    pub fn load(&mut self) -> Result<&Configuration, StorageError> {
        let config = match self.storage.read_blob()? {
            Some(bytes) => decode_configuration(&bytes)?,
            None => Configuration::default(),
        };
        self.current = config;
        self.dirty = false;
        Ok(&self.current)
    }

    pub fn current(&self) -> &Configuration {
        &self.current
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }

    /// True while the in-memory copy has changes the durable copy lacks.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn replace(&mut self, update: &ConfigUpdate) -> (Vec<FieldGroup>, Vec<RejectedField>) {
        let mut next = self.current.clone();
        let (applied, rejected) = next.merge(update);
        if !applied.is_empty() {
            self.swap(next);
        }
        (applied, rejected)
    }

    pub fn replace_color(&mut self, update: &ColorUpdate) -> Result<(), ClockError> {
        let color = merge_color(self.current.color, update)?;
        if color != self.current.color {
            let mut next = self.current.clone();
            next.color = color;
            next.ensure_fits_storage()?;
            self.swap(next);
        }
        Ok(())
    }

    /// Stores station credentials; a missing password keeps the stored one.
    /// Credentials whose escaped encoding would overflow storage are rejected.
    pub fn set_credentials(
        &mut self,
        ssid: &str,
        password: Option<&str>,
    ) -> Result<(), ClockError> {
        let ssid = ssid.trim();
        let password = password.unwrap_or(&self.current.wifi_password);
        validate_credentials(ssid, password)?;

        let mut next = self.current.clone();
        next.ssid = ssid.to_string();
        next.wifi_password = password.to_string();
        next.ensure_fits_storage()?;
        self.swap(next);
        Ok(())
    }

    /// Adopts fallback credentials when none are stored and writes them through.
    /// Returns `false` when the store already had credentials.
    pub fn seed_credentials(
        &mut self,
        ssid: &str,
        password: Option<&str>,
    ) -> Result<bool, ClockError> {
        if self.current.is_provisioned() {
            return Ok(false);
        }
        self.set_credentials(ssid, password)?;
        self.persist()?;
        Ok(true)
    }

    /// Writes the in-memory configuration to storage. Safe to repeat; the
    /// durable copy is untouched when encoding or the write fails.
    pub fn persist(&mut self) -> Result<(), StorageError> {
        let bytes = encode_configuration(&self.current)?;
        self.storage.write_blob(&bytes)?;
        self.dirty = false;
        Ok(())
    }

    fn swap(&mut self, next: Configuration) {
        if next != self.current {
            self.current = next;
            self.dirty = true;
        }
    }
}
