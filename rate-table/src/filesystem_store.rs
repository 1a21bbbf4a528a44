//! Persistent store keeping one compressed file per key under
//! `{base_dir}/{namespace}/`. Survives restarts, so the synchronizer can
//! still evict keys published by a previous process.
use crate::store::{PersistentStore, StoreError};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

const FILE_EXTENSION: &str = "rec";

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct StoredRecord {
    key: String,
    value: Vec<u8>,
}

#[derive(Clone)]
enum Compression {
    #[allow(dead_code)]
    None,
    // zstd with compression level
    Zstd(i32),
}

struct Codec {
    compression: Compression,
    config: bincode::config::Configuration,
}

impl Codec {
    fn new(compression: Compression) -> Self {
        Codec {
            compression,
            // standard defaults to little-endian + varint
            config: bincode::config::standard(),
        }
    }

    fn write<W: Write>(&self, writer: &mut W, record: &StoredRecord) -> Result<usize, StoreError> {
        match self.compression {
            Compression::None => {
                let size = bincode::serde::encode_into_std_write(record, writer, self.config)?;
                writer.flush()?;
                Ok(size)
            }
            Compression::Zstd(level) => {
                let mut encoder = zstd::stream::write::Encoder::new(writer, level)?;
                let size =
                    bincode::serde::encode_into_std_write(record, &mut encoder, self.config)?;
                encoder.finish()?;
                Ok(size)
            }
        }
    }

    fn read<R: Read>(&self, mut reader: R) -> Result<StoredRecord, StoreError> {
        match self.compression {
            Compression::None => {
                Ok(bincode::serde::decode_from_std_read(&mut reader, self.config)?)
            }
            Compression::Zstd(_) => {
                let mut decoder = zstd::stream::read::Decoder::new(reader)?;
                Ok(bincode::serde::decode_from_std_read(&mut decoder, self.config)?)
            }
        }
    }
}

pub struct FilesystemStore {
    dir: PathBuf,
    codec: Codec,
}

impl FilesystemStore {
    pub fn new(base_dir: &str, namespace: &str) -> Result<Self, StoreError> {
        let dir = Path::new(base_dir).join(namespace);
        fs::create_dir_all(&dir)?;
        Ok(FilesystemStore {
            dir,
            codec: Codec::new(Compression::Zstd(1)),
        })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let name = URL_SAFE_NO_PAD.encode(key.as_bytes());
        self.dir.join(format!("{name}.{FILE_EXTENSION}"))
    }

    fn key_for(path: &Path) -> Option<String> {
        if path.extension()? != FILE_EXTENSION {
            return None;
        }
        let stem = path.file_stem()?.to_str()?;
        let decoded = URL_SAFE_NO_PAD.decode(stem).ok()?;
        String::from_utf8(decoded).ok()
    }

    fn read_record(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        let file = match File::open(self.path_for(key)) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let record = self.codec.read(io::BufReader::new(file))?;
        if record.key != key {
            return Err(StoreError::Unavailable(format!(
                "record for '{key}' holds key '{}'",
                record.key
            )));
        }
        Ok(Some(Bytes::from(record.value)))
    }

    fn write_record(&self, key: &str, value: Bytes) -> Result<(), StoreError> {
        let path = self.path_for(key);
        // Write to a sibling temp file and rename so readers never see a torn record
        let tmp_path = path.with_extension("tmp");
        let record = StoredRecord {
            key: key.to_string(),
            value: value.to_vec(),
        };

        let file = File::create(&tmp_path)?;
        let mut writer = io::BufWriter::new(file);
        let size = self.codec.write(&mut writer, &record)?;
        writer.into_inner().map_err(|e| e.into_error())?.sync_all()?;
        fs::rename(&tmp_path, &path)?;

        tracing::trace!(key, bytes = size, "stored record");
        Ok(())
    }

    fn delete_record(&self, key: &str) -> Result<(), StoreError> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn list_keys(&self) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        for dir_entry in fs::read_dir(&self.dir)? {
            if let Some(key) = Self::key_for(&dir_entry?.path()) {
                keys.push(key);
            }
        }
        Ok(keys)
    }
}

#[async_trait]
impl PersistentStore for FilesystemStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        self.read_record(key)
    }

    async fn put(&self, key: &str, value: Bytes) -> Result<(), StoreError> {
        self.write_record(key, value)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.delete_record(key)
    }

    async fn keys(&self) -> Result<Vec<String>, StoreError> {
        self.list_keys()
    }
}
