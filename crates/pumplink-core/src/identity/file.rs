// ── File-backed identity store ──
//
// One TOML record holds all identity fields plus the replay counter.
// Every write goes to a temporary file in the same directory, is synced
// to disk and then atomically renamed over the record.

use std::fs;
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use pumplink_api::{CipherKey, DeviceAddress, PumpIdentity, ReplayCounterStore};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::IdentityStore;
use crate::error::CoreError;

/// On-disk shape. Every field is optional so that a partial record is
/// detected as corruption instead of failing to parse.
#[derive(Debug, Default, Serialize, Deserialize)]
struct IdentityRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    replay_counter: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    client_pump_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pump_client_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    key_response_address: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pump_id: Option<String>,
}

impl IdentityRecord {
    fn from_identity(identity: &PumpIdentity, replay_counter: u64) -> Self {
        Self {
            address: Some(identity.address.to_string()),
            replay_counter: Some(replay_counter),
            client_pump_key: Some(hex::encode(identity.client_pump_key.expose())),
            pump_client_key: Some(hex::encode(identity.pump_client_key.expose())),
            key_response_address: Some(identity.key_response_address),
            pump_id: Some(identity.pump_id.clone()),
        }
    }

    fn is_empty(&self) -> bool {
        self.address.is_none()
            && self.replay_counter.is_none()
            && self.client_pump_key.is_none()
            && self.pump_client_key.is_none()
            && self.key_response_address.is_none()
            && self.pump_id.is_none()
    }

    /// Decode into an identity and its counter, or report what is wrong.
    fn decode(&self) -> Result<Option<(PumpIdentity, u64)>, CoreError> {
        if self.is_empty() {
            return Ok(None);
        }

        let (
            Some(address),
            Some(replay_counter),
            Some(client_pump_key),
            Some(pump_client_key),
            Some(key_response_address),
            Some(pump_id),
        ) = (
            &self.address,
            self.replay_counter,
            &self.client_pump_key,
            &self.pump_client_key,
            self.key_response_address,
            &self.pump_id,
        )
        else {
            return Err(corruption(format!(
                "missing fields: {}",
                self.missing_fields().join(", ")
            )));
        };

        let address: DeviceAddress = address
            .parse()
            .map_err(|_| corruption(format!("malformed device address {address:?}")))?;
        let client_pump_key = decode_key(client_pump_key, "client_pump_key")?;
        let pump_client_key = decode_key(pump_client_key, "pump_client_key")?;

        Ok(Some((
            PumpIdentity {
                address,
                client_pump_key,
                pump_client_key,
                key_response_address,
                pump_id: pump_id.clone(),
            },
            replay_counter,
        )))
    }

    fn missing_fields(&self) -> Vec<&'static str> {
        let fields = [
            ("address", self.address.is_none()),
            ("replay_counter", self.replay_counter.is_none()),
            ("client_pump_key", self.client_pump_key.is_none()),
            ("pump_client_key", self.pump_client_key.is_none()),
            ("key_response_address", self.key_response_address.is_none()),
            ("pump_id", self.pump_id.is_none()),
        ];
        fields
            .into_iter()
            .filter_map(|(name, missing)| missing.then_some(name))
            .collect()
    }
}

fn corruption(message: String) -> CoreError {
    CoreError::IdentityCorruption { message }
}

fn decode_key(encoded: &str, field: &str) -> Result<CipherKey, CoreError> {
    hex::decode(encoded)
        .ok()
        .and_then(|bytes| CipherKey::from_slice(&bytes))
        .ok_or_else(|| corruption(format!("malformed {field}")))
}

// ── FileIdentityStore ────────────────────────────────────────────

/// Identity store backed by a single TOML file.
#[derive(Debug)]
pub struct FileIdentityStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileIdentityStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_record(&self) -> Result<IdentityRecord, CoreError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(IdentityRecord::default()),
            Err(e) => return Err(e.into()),
        };
        toml::from_str(&contents).map_err(|e| corruption(format!("unreadable record: {e}")))
    }

    fn write_record(&self, record: &IdentityRecord) -> Result<(), CoreError> {
        let contents = toml::to_string_pretty(record).map_err(|e| CoreError::Storage {
            message: e.to_string(),
        })?;
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir)?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(contents.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| CoreError::from(e.error))?;

        // Make the rename itself durable.
        #[cfg(unix)]
        fs::File::open(dir)?.sync_all()?;

        Ok(())
    }

    fn store_counter(&self, value: u64) -> Result<(), pumplink_api::Error> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut record = self.read_record().map_err(counter_error)?;
        let Some((_, current)) = record.decode().map_err(counter_error)? else {
            return Err(no_identity());
        };
        if value < current {
            return Err(pumplink_api::Error::CounterRegression {
                current,
                attempted: value,
            });
        }
        record.replay_counter = Some(value);
        self.write_record(&record).map_err(counter_error)
    }
}

fn counter_error(err: CoreError) -> pumplink_api::Error {
    pumplink_api::Error::CounterStore {
        message: err.to_string(),
    }
}

fn no_identity() -> pumplink_api::Error {
    pumplink_api::Error::CounterStore {
        message: "no pump identity stored".into(),
    }
}

impl ReplayCounterStore for FileIdentityStore {
    fn replay_counter(&self) -> Result<u64, pumplink_api::Error> {
        let record = self.read_record().map_err(counter_error)?;
        match record.decode().map_err(counter_error)? {
            Some((_, counter)) => Ok(counter),
            None => Err(no_identity()),
        }
    }

    fn set_replay_counter(&self, value: u64) -> Result<(), pumplink_api::Error> {
        self.store_counter(value)
    }
}

impl IdentityStore for FileIdentityStore {
    fn create_identity(&self, identity: &PumpIdentity) -> Result<(), CoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.write_record(&IdentityRecord::from_identity(identity, 0))?;
        info!(address = %identity.address, path = %self.path.display(), "pump identity stored");
        Ok(())
    }

    fn delete_identity(&self) -> Result<bool, CoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        match fs::remove_file(&self.path) {
            Ok(()) => {
                info!(path = %self.path.display(), "pump identity deleted");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("no pump identity to delete");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn load_identity(&self) -> Result<Option<PumpIdentity>, CoreError> {
        Ok(self.read_record()?.decode()?.map(|(identity, _)| identity))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pumplink_api::CIPHER_KEY_LEN;

    use super::*;

    fn identity() -> PumpIdentity {
        PumpIdentity {
            address: "00:0e:2f:1a:b4:77".parse().unwrap(),
            client_pump_key: CipherKey::new([0x11; CIPHER_KEY_LEN]),
            pump_client_key: CipherKey::new([0x22; CIPHER_KEY_LEN]),
            key_response_address: 0x1d,
            pump_id: "PUMP_10233103".into(),
        }
    }

    fn store_in(dir: &tempfile::TempDir) -> FileIdentityStore {
        FileIdentityStore::new(dir.path().join("pump").join("identity.toml"))
    }

    #[test]
    fn identity_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        assert_eq!(store.load_identity().unwrap(), None);

        store.create_identity(&identity()).unwrap();
        assert_eq!(store.load_identity().unwrap(), Some(identity()));
        assert_eq!(store.replay_counter().unwrap(), 0);
        assert_eq!(
            store.list_identities().unwrap(),
            vec![identity().address]
        );
    }

    #[test]
    fn counter_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.create_identity(&identity()).unwrap();
        for value in [1, 2, 5, 5, 9] {
            store.set_replay_counter(value).unwrap();
        }
        drop(store);

        // Simulated restart: a fresh handle on the same file.
        let reopened = store_in(&dir);
        assert_eq!(reopened.replay_counter().unwrap(), 9);
        assert_eq!(reopened.load_identity().unwrap(), Some(identity()));
    }

    #[test]
    fn counter_never_moves_backwards() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.create_identity(&identity()).unwrap();
        store.set_replay_counter(40).unwrap();

        let err = store.set_replay_counter(39).unwrap_err();
        assert!(matches!(
            err,
            pumplink_api::Error::CounterRegression {
                current: 40,
                attempted: 39
            }
        ));
        assert_eq!(store.replay_counter().unwrap(), 40);
    }

    #[test]
    fn counter_write_without_identity_fails_loudly() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        assert!(store.set_replay_counter(1).is_err());
        assert!(store.replay_counter().is_err());
    }

    #[test]
    fn partial_record_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        fs::write(
            store.path(),
            "address = \"00:0e:2f:1a:b4:77\"\nreplay_counter = 3\n",
        )
        .unwrap();

        let err = store.load_identity().unwrap_err();
        assert!(matches!(err, CoreError::IdentityCorruption { ref message } if message.contains("client_pump_key")));
    }

    #[test]
    fn short_key_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.create_identity(&identity()).unwrap();
        let contents = fs::read_to_string(store.path()).unwrap();
        let truncated = contents.replace(&"11".repeat(CIPHER_KEY_LEN), "1111");
        fs::write(store.path(), truncated).unwrap();

        assert!(matches!(
            store.load_identity(),
            Err(CoreError::IdentityCorruption { .. })
        ));
    }

    #[test]
    fn delete_reports_existence() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.create_identity(&identity()).unwrap();
        assert!(store.delete_identity().unwrap());
        assert!(!store.delete_identity().unwrap());
        assert!(store.list_identities().unwrap().is_empty());
    }

    #[test]
    fn create_replaces_previous_identity_and_resets_counter() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.create_identity(&identity()).unwrap();
        store.set_replay_counter(77).unwrap();

        let mut other = identity();
        other.pump_id = "PUMP_2".into();
        store.create_identity(&other).unwrap();

        assert_eq!(store.load_identity().unwrap().unwrap().pump_id, "PUMP_2");
        assert_eq!(store.replay_counter().unwrap(), 0);
    }

    #[test]
    fn non_hex_key_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.create_identity(&identity()).unwrap();
        let contents = fs::read_to_string(store.path()).unwrap();
        let garbled = contents.replace(&"22".repeat(CIPHER_KEY_LEN), &"zz".repeat(CIPHER_KEY_LEN));
        fs::write(store.path(), garbled).unwrap();

        let err = store.load_identity().unwrap_err();
        assert!(matches!(err, CoreError::IdentityCorruption { ref message } if message.contains("pump_client_key")));
    }

    mod proptests {
        use proptest::prelude::*;

        use super::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(32))]

            // Accepted writes are monotonic, regressions are refused, and
            // a fresh handle sees the highest accepted value.
            #[test]
            fn prop_counter_is_monotonic_across_reopen(
                writes in prop::collection::vec(0u64..64, 1..24)
            ) {
                let dir = tempfile::tempdir().unwrap();
                let store = store_in(&dir);
                store.create_identity(&identity()).unwrap();

                let mut highest = 0u64;
                for value in writes {
                    let result = store.set_replay_counter(value);
                    if value < highest {
                        let regression = matches!(
                            result,
                            Err(pumplink_api::Error::CounterRegression { current, attempted })
                                if current == highest && attempted == value
                        );
                        prop_assert!(regression);
                    } else {
                        prop_assert!(result.is_ok());
                        highest = value;
                    }
                    prop_assert_eq!(store.replay_counter().unwrap(), highest);
                }
                drop(store);

                let reopened = store_in(&dir);
                prop_assert_eq!(reopened.replay_counter().unwrap(), highest);
            }
        }
    }
}
