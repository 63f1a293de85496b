//! RocksDB-backed note storage.
//!
//! Three column families, keyed for the access patterns the sync server
//! needs:
//!
//! | CF       | Key                                     | Value (LZ4 + JSON) |
//! |----------|-----------------------------------------|--------------------|
//! | notes    | note_id (16B)                           | Note               |
//! | blocks   | note_id (16B) + block_id (16B)          | Block              |
//! | versions | block_id (16B) + version_number (8B BE) | BlockVersion       |
//!
//! Block keys share the note id prefix, so one prefix scan lists a note's
//! blocks and block lookups are scoped to their note for free. Version
//! numbers are big-endian, making lexicographic key order numeric order: a
//! forward scan walks history 1..N and a reverse seek from the maximum key
//! finds the latest version without a scan.
//!
//! Every multi-key mutation (create with its first version, update with its
//! snapshot, cascading deletes, reorders) goes through one WriteBatch, so
//! readers never observe a half-applied edit.

use log::{debug, info};
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamily, ColumnFamilyDescriptor, DBCompressionType,
    DBWithThreadMode, Direction, IteratorMode, Options, SingleThreaded, SliceTransform,
    WriteBatch, WriteOptions,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::error::Error;
use std::fmt;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use vellum_core::{Block, BlockType, BlockVersion, Note};

pub const CF_NOTES: &str = "notes";
pub const CF_BLOCKS: &str = "blocks";
pub const CF_VERSIONS: &str = "versions";

const COLUMN_FAMILIES: [&str; 3] = [CF_NOTES, CF_BLOCKS, CF_VERSIONS];

const BLOCK_KEY_LEN: usize = 32;
const VERSION_KEY_LEN: usize = 24;

/// Errors from the storage layer
#[derive(Debug, Clone, PartialEq)]
pub enum StoreError {
    /// RocksDB operation failed
    DatabaseError(String),
    /// Note does not exist
    NoteNotFound(Uuid),
    /// Block does not exist (or belongs to a different note)
    BlockNotFound(Uuid),
    /// Version does not exist for the block
    VersionNotFound(Uuid, u64),
    /// Failed to serialize a record
    SerializationError(String),
    /// Failed to deserialize a record
    DeserializationError(String),
    /// Failed to decompress a record
    CompressionError(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "database error: {}", e),
            StoreError::NoteNotFound(id) => write!(f, "note not found: {}", id),
            StoreError::BlockNotFound(id) => write!(f, "block not found: {}", id),
            StoreError::VersionNotFound(block_id, version) => {
                write!(f, "version {} not found for block {}", version, block_id)
            }
            StoreError::SerializationError(e) => write!(f, "serialization error: {}", e),
            StoreError::DeserializationError(e) => write!(f, "deserialization error: {}", e),
            StoreError::CompressionError(e) => write!(f, "compression error: {}", e),
        }
    }
}

impl Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

impl StoreError {
    /// True for lookups that missed, as opposed to engine faults.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StoreError::NoteNotFound(_)
                | StoreError::BlockNotFound(_)
                | StoreError::VersionNotFound(..)
        )
    }
}

/// Store tuning knobs
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub path: PathBuf,
    pub create_if_missing: bool,
    pub write_buffer_size: usize,
    pub max_write_buffer_number: i32,
    pub block_cache_size: usize,
    /// Fsync every write. Durable but slow; leave off for live editing.
    pub sync_writes: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("vellum_data"),
            create_if_missing: true,
            write_buffer_size: 64 * 1024 * 1024,
            max_write_buffer_number: 4,
            block_cache_size: 256 * 1024 * 1024,
            sync_writes: false,
        }
    }
}

impl StoreConfig {
    /// Small buffers for unit and integration tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            create_if_missing: true,
            write_buffer_size: 8 * 1024 * 1024,
            max_write_buffer_number: 2,
            block_cache_size: 4 * 1024 * 1024,
            sync_writes: false,
        }
    }
}

/// Persistent store for notes, their blocks, and block version history.
pub struct NoteStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl NoteStore {
    /// Open (or create) the store at the configured path.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut opts = Options::default();
        opts.create_if_missing(config.create_if_missing);
        opts.create_missing_column_families(true);
        opts.increase_parallelism(num_cpus());
        opts.set_max_background_jobs(4);
        opts.set_keep_log_file_num(5);
        opts.set_max_total_wal_size(128 * 1024 * 1024);

        let cache = Cache::new_lru_cache(config.block_cache_size);
        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, cf_options(name, &config, &cache)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &opts,
            &config.path,
            cf_descriptors,
        )?;

        info!("Note store opened at {}", config.path.display());
        Ok(Self { db, config })
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Notes ───────────────────────────────────────────────────────────

    pub fn create_note(&self, owner: Uuid, title: &str) -> Result<Note, StoreError> {
        let note = Note::new(owner, title);
        self.put_note(&note)?;
        debug!("Created note {} for user {}", note.id, owner);
        Ok(note)
    }

    pub fn get_note(&self, note_id: Uuid) -> Result<Note, StoreError> {
        let bytes = self
            .db
            .get_cf(self.cf(CF_NOTES)?, note_id.as_bytes())?
            .ok_or(StoreError::NoteNotFound(note_id))?;
        decode_record(&bytes)
    }

    pub fn note_exists(&self, note_id: Uuid) -> Result<bool, StoreError> {
        Ok(self
            .db
            .get_cf(self.cf(CF_NOTES)?, note_id.as_bytes())?
            .is_some())
    }

    pub fn set_title(&self, note_id: Uuid, title: &str) -> Result<Note, StoreError> {
        let mut note = self.get_note(note_id)?;
        note.title = title.to_string();
        note.touch();
        self.put_note(&note)?;
        Ok(note)
    }

    pub fn add_collaborator(&self, note_id: Uuid, user_id: Uuid) -> Result<Note, StoreError> {
        let mut note = self.get_note(note_id)?;
        if note.add_collaborator(user_id) {
            note.touch();
            self.put_note(&note)?;
        }
        Ok(note)
    }

    pub fn remove_collaborator(&self, note_id: Uuid, user_id: Uuid) -> Result<Note, StoreError> {
        let mut note = self.get_note(note_id)?;
        if note.remove_collaborator(user_id) {
            note.touch();
            self.put_note(&note)?;
        }
        Ok(note)
    }

    /// Delete a note together with all its blocks and their histories.
    pub fn delete_note(&self, note_id: Uuid) -> Result<(), StoreError> {
        self.get_note(note_id)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(self.cf(CF_NOTES)?, note_id.as_bytes());
        for block in self.list_blocks(note_id)? {
            batch.delete_cf(self.cf(CF_BLOCKS)?, block_key(note_id, block.id));
            self.delete_versions_into(&mut batch, block.id)?;
        }
        self.db.write_opt(batch, &self.write_opts())?;
        debug!("Deleted note {} and its blocks", note_id);
        Ok(())
    }

    // ─── Blocks ──────────────────────────────────────────────────────────

    /// Create a block and record its content as version 1, atomically.
    pub fn create_block(
        &self,
        note_id: Uuid,
        block_type: BlockType,
        content: Value,
        order: u32,
        author: Uuid,
    ) -> Result<Block, StoreError> {
        if !self.note_exists(note_id)? {
            return Err(StoreError::NoteNotFound(note_id));
        }

        let block = Block::new(note_id, block_type, content, order);
        let version = BlockVersion::new(block.id, block.content.clone(), author, 1);

        let mut batch = WriteBatch::default();
        batch.put_cf(
            self.cf(CF_BLOCKS)?,
            block_key(note_id, block.id),
            encode_record(&block)?,
        );
        batch.put_cf(
            self.cf(CF_VERSIONS)?,
            version_key(block.id, 1),
            encode_record(&version)?,
        );
        self.db.write_opt(batch, &self.write_opts())?;
        Ok(block)
    }

    /// Fetch a block, scoped to its note: a block id under a different note
    /// is not found.
    pub fn get_block(&self, note_id: Uuid, block_id: Uuid) -> Result<Block, StoreError> {
        let bytes = self
            .db
            .get_cf(self.cf(CF_BLOCKS)?, block_key(note_id, block_id))?
            .ok_or(StoreError::BlockNotFound(block_id))?;
        decode_record(&bytes)
    }

    /// All blocks of a note, ordered by (order, created_at).
    pub fn list_blocks(&self, note_id: Uuid) -> Result<Vec<Block>, StoreError> {
        let cf = self.cf(CF_BLOCKS)?;
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(note_id.as_bytes(), Direction::Forward));

        let mut blocks: Vec<Block> = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if key.len() < BLOCK_KEY_LEN || &key[..16] != note_id.as_bytes() {
                break;
            }
            blocks.push(decode_record(&value)?);
        }
        blocks.sort_by(|a, b| a.order.cmp(&b.order).then(a.created_at.cmp(&b.created_at)));
        Ok(blocks)
    }

    /// Replace a block's content.
    ///
    /// Identical content only bumps `updated_at` and appends no version, so
    /// a client re-sending its current state cannot inflate history. Changed
    /// content and its snapshot land in one batch; the new version number is
    /// latest + 1.
    pub fn update_block_content(
        &self,
        note_id: Uuid,
        block_id: Uuid,
        content: Value,
        author: Uuid,
    ) -> Result<(Block, Option<BlockVersion>), StoreError> {
        let mut block = self.get_block(note_id, block_id)?;

        if block.content == content {
            block.touch();
            self.db.put_cf_opt(
                self.cf(CF_BLOCKS)?,
                block_key(note_id, block_id),
                encode_record(&block)?,
                &self.write_opts(),
            )?;
            return Ok((block, None));
        }

        let next = self.latest_version_number(block_id)?.map_or(1, |n| n + 1);
        block.content = content;
        block.touch();
        let version = BlockVersion::new(block_id, block.content.clone(), author, next);

        let mut batch = WriteBatch::default();
        batch.put_cf(
            self.cf(CF_BLOCKS)?,
            block_key(note_id, block_id),
            encode_record(&block)?,
        );
        batch.put_cf(
            self.cf(CF_VERSIONS)?,
            version_key(block_id, next),
            encode_record(&version)?,
        );
        self.db.write_opt(batch, &self.write_opts())?;
        Ok((block, Some(version)))
    }

    /// Delete a block and every version it ever had, atomically.
    pub fn delete_block(&self, note_id: Uuid, block_id: Uuid) -> Result<(), StoreError> {
        self.get_block(note_id, block_id)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(self.cf(CF_BLOCKS)?, block_key(note_id, block_id));
        self.delete_versions_into(&mut batch, block_id)?;
        self.db.write_opt(batch, &self.write_opts())?;
        debug!("Deleted block {} from note {}", block_id, note_id);
        Ok(())
    }

    /// Give each listed block its index as order, in one batch.
    ///
    /// Every id must name a block of this note; any miss rejects the whole
    /// reorder with nothing applied. Positions change without touching
    /// `updated_at`, so a reorder is not an edit to block content.
    pub fn reorder_blocks(&self, note_id: Uuid, block_ids: &[Uuid]) -> Result<(), StoreError> {
        let mut blocks = Vec::with_capacity(block_ids.len());
        for &block_id in block_ids {
            blocks.push(self.get_block(note_id, block_id)?);
        }

        let cf = self.cf(CF_BLOCKS)?;
        let mut batch = WriteBatch::default();
        for (index, block) in blocks.iter_mut().enumerate() {
            block.order = index as u32;
            batch.put_cf(cf, block_key(note_id, block.id), encode_record(block)?);
        }
        self.db.write_opt(batch, &self.write_opts())?;
        Ok(())
    }

    // ─── Versions ────────────────────────────────────────────────────────

    /// A block's full history, ascending by version number.
    pub fn list_versions(
        &self,
        note_id: Uuid,
        block_id: Uuid,
    ) -> Result<Vec<BlockVersion>, StoreError> {
        self.get_block(note_id, block_id)?;

        let cf = self.cf(CF_VERSIONS)?;
        let start = version_key(block_id, 0);
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&start, Direction::Forward));

        let mut versions = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if key.len() < VERSION_KEY_LEN || &key[..16] != block_id.as_bytes() {
                break;
            }
            versions.push(decode_record(&value)?);
        }
        Ok(versions)
    }

    /// The highest version number recorded for a block, if any.
    pub fn latest_version_number(&self, block_id: Uuid) -> Result<Option<u64>, StoreError> {
        let cf = self.cf(CF_VERSIONS)?;
        let upper = version_key(block_id, u64::MAX);
        let mut iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&upper, Direction::Reverse));

        if let Some(item) = iter.next() {
            let (key, _) = item?;
            if key.len() == VERSION_KEY_LEN && &key[..16] == block_id.as_bytes() {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&key[16..24]);
                return Ok(Some(u64::from_be_bytes(buf)));
            }
        }
        Ok(None)
    }

    /// Copy an old version's content back into the block.
    ///
    /// Restoring is itself an edit: it appends a new snapshot at latest + 1
    /// rather than truncating history.
    pub fn restore_version(
        &self,
        note_id: Uuid,
        block_id: Uuid,
        version_number: u64,
        author: Uuid,
    ) -> Result<(Block, BlockVersion), StoreError> {
        let mut block = self.get_block(note_id, block_id)?;

        let bytes = self
            .db
            .get_cf(self.cf(CF_VERSIONS)?, version_key(block_id, version_number))?
            .ok_or(StoreError::VersionNotFound(block_id, version_number))?;
        let source: BlockVersion = decode_record(&bytes)?;

        let next = self.latest_version_number(block_id)?.map_or(1, |n| n + 1);
        block.content = source.content;
        block.touch();
        let version = BlockVersion::new(block_id, block.content.clone(), author, next);

        let mut batch = WriteBatch::default();
        batch.put_cf(
            self.cf(CF_BLOCKS)?,
            block_key(note_id, block_id),
            encode_record(&block)?,
        );
        batch.put_cf(
            self.cf(CF_VERSIONS)?,
            version_key(block_id, next),
            encode_record(&version)?,
        );
        self.db.write_opt(batch, &self.write_opts())?;
        Ok((block, version))
    }

    // ─── Internals ───────────────────────────────────────────────────────

    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    fn put_note(&self, note: &Note) -> Result<(), StoreError> {
        self.db.put_cf_opt(
            self.cf(CF_NOTES)?,
            note.id.as_bytes(),
            encode_record(note)?,
            &self.write_opts(),
        )?;
        Ok(())
    }

    /// Queue deletion of every version key belonging to `block_id`.
    fn delete_versions_into(
        &self,
        batch: &mut WriteBatch,
        block_id: Uuid,
    ) -> Result<(), StoreError> {
        let cf = self.cf(CF_VERSIONS)?;
        let start = version_key(block_id, 0);
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&start, Direction::Forward));
        for item in iter {
            let (key, _) = item?;
            if key.len() < VERSION_KEY_LEN || &key[..16] != block_id.as_bytes() {
                break;
            }
            batch.delete_cf(cf, key);
        }
        Ok(())
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("missing column family: {}", name)))
    }

    fn write_opts(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }
}

fn cf_options(cf_name: &str, config: &StoreConfig, cache: &Cache) -> Options {
    let mut opts = Options::default();
    opts.set_write_buffer_size(config.write_buffer_size);
    opts.set_max_write_buffer_number(config.max_write_buffer_number);
    opts.set_compression_type(DBCompressionType::Lz4);

    match cf_name {
        CF_NOTES => {
            // Point lookups by note id only
            opts.optimize_for_point_lookup(
                (config.block_cache_size / (1024 * 1024)).max(8) as u64
            );
        }
        CF_BLOCKS => {
            // note_id prefix scans for list_blocks
            opts.set_prefix_extractor(SliceTransform::create_fixed_prefix(16));
            let mut block_opts = BlockBasedOptions::default();
            block_opts.set_block_cache(cache);
            block_opts.set_bloom_filter(10.0, false);
            opts.set_block_based_table_factory(&block_opts);
        }
        CF_VERSIONS => {
            // No prefix extractor here: the latest-version lookup seeks in
            // reverse from a key that crosses prefix boundaries.
            let mut block_opts = BlockBasedOptions::default();
            block_opts.set_block_cache(cache);
            opts.set_block_based_table_factory(&block_opts);
        }
        _ => {}
    }
    opts
}

fn block_key(note_id: Uuid, block_id: Uuid) -> [u8; BLOCK_KEY_LEN] {
    let mut key = [0u8; BLOCK_KEY_LEN];
    key[..16].copy_from_slice(note_id.as_bytes());
    key[16..].copy_from_slice(block_id.as_bytes());
    key
}

fn version_key(block_id: Uuid, version: u64) -> [u8; VERSION_KEY_LEN] {
    let mut key = [0u8; VERSION_KEY_LEN];
    key[..16].copy_from_slice(block_id.as_bytes());
    key[16..].copy_from_slice(&version.to_be_bytes());
    key
}

fn encode_record<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    let json = serde_json::to_vec(value)
        .map_err(|e| StoreError::SerializationError(e.to_string()))?;
    Ok(lz4_flex::compress_prepend_size(&json))
}

fn decode_record<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let json = lz4_flex::decompress_size_prepended(bytes)
        .map_err(|e| StoreError::CompressionError(e.to_string()))?;
    serde_json::from_slice(&json).map_err(|e| StoreError::DeserializationError(e.to_string()))
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
