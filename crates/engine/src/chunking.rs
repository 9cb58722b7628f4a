//! Content chunking
//!
//! Content larger than the configured `chunk_size` never lives inline:
//! it is split into `N = ceil(len / chunk_size)` child entities named
//! `"{parent}-chunk-{i}"`, each carrying its slice plus a per-chunk
//! SHA-256, while the parent keeps empty content and the metadata tags
//!
//! ```text
//! content:chunks:N
//! content:chunk-size:S
//! content:size:T
//! content:checksum:sha256:<hex>
//! ```
//!
//! Reassembly streams chunk by chunk, verifying each chunk's digest on
//! the way through and the whole-content digest at the end. Any missing
//! or corrupt chunk aborts the stream; no partial data is handed out as
//! if complete.

use entitydb_core::{Entity, EntityId, Error, Result, TagBody, TemporalTag};
use sha2::{Digest, Sha256};
use tracing::debug;

/// Tag carried by every chunk child
pub const CHUNK_TYPE_TAG: &str = "type:chunk";

/// Parsed chunk metadata from a parent's tags
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkMeta {
    /// Number of chunk children
    pub count: u32,
    /// Slice size used for the split
    pub chunk_size: u64,
    /// Total content length
    pub total_size: u64,
    /// Hex SHA-256 of the whole content
    pub checksum_hex: String,
}

/// Read chunk metadata off a parent entity, if it is chunked
pub fn chunk_meta(entity: &Entity) -> Option<ChunkMeta> {
    Some(ChunkMeta {
        count: entity.value_after("content:chunks:")?.parse().ok()?,
        chunk_size: entity.value_after("content:chunk-size:")?.parse().ok()?,
        total_size: entity.value_after("content:size:")?.parse().ok()?,
        checksum_hex: entity
            .value_after("content:checksum:sha256:")?
            .to_owned(),
    })
}

/// A split of oversized content into a parent and its chunk children
#[derive(Debug)]
pub struct ChunkPlan {
    /// The parent, with metadata tags and empty content
    pub parent: Entity,
    /// Chunk children in index order
    pub chunks: Vec<Entity>,
}

/// Split `content` for `id` at `chunk_size` boundaries
///
/// `tags` are the caller's tags for the parent; the metadata tags are
/// appended at `now`.
pub fn plan_chunks(
    id: EntityId,
    mut tags: Vec<TemporalTag>,
    content: Vec<u8>,
    chunk_size: usize,
    now: i64,
) -> Result<ChunkPlan> {
    debug_assert!(content.len() > chunk_size);

    let total_size = content.len();
    let count = content.len().div_ceil(chunk_size);
    let whole_digest = hex::encode(Sha256::digest(&content));

    let mut chunks = Vec::with_capacity(count);
    for (index, slice) in content.chunks(chunk_size).enumerate() {
        let child_id = id.chunk_child(index as u32);
        let chunk_digest = hex::encode(Sha256::digest(slice));
        let chunk_tags = vec![
            tag_at(now, CHUNK_TYPE_TAG.to_owned())?,
            tag_at(now, format!("parent:{}", id))?,
            tag_at(now, format!("chunk:index:{}", index))?,
            tag_at(now, format!("chunk:checksum:sha256:{}", chunk_digest))?,
        ];
        chunks.push(Entity::new(child_id, chunk_tags, slice.to_vec()));
    }

    tags.push(tag_at(now, format!("content:chunks:{}", count))?);
    tags.push(tag_at(now, format!("content:chunk-size:{}", chunk_size))?);
    tags.push(tag_at(now, format!("content:size:{}", total_size))?);
    tags.push(tag_at(
        now,
        format!("content:checksum:sha256:{}", whole_digest),
    )?);
    let parent = Entity::new(id, tags, Vec::new());

    debug!(
        target: "entitydb::chunking",
        id = %parent.id,
        chunks = count,
        total_size,
        "planned chunk split"
    );

    Ok(ChunkPlan { parent, chunks })
}

fn tag_at(now: i64, body: String) -> Result<TemporalTag> {
    TemporalTag::at(now, TagBody::new(body)?)
}

/// Fetches one chunk child by id
pub type ChunkFetch<'a> = Box<dyn Fn(&EntityId) -> Result<Entity> + 'a>;

/// Streaming, verifying reassembly of a chunked parent
///
/// Yields each chunk's bytes after verifying its per-chunk digest; after
/// the last chunk the whole-content digest is checked against the
/// parent's metadata. The stream fuses after the first error.
pub struct ContentStream<'a> {
    parent: EntityId,
    meta: ChunkMeta,
    fetch: ChunkFetch<'a>,
    next_index: u32,
    hasher: Sha256,
    bytes_seen: u64,
    failed: bool,
    finished: bool,
}

impl<'a> ContentStream<'a> {
    /// Begin streaming `parent`'s content
    ///
    /// `parent` must carry chunk metadata.
    pub fn new(parent: &Entity, fetch: ChunkFetch<'a>) -> Result<Self> {
        let meta = chunk_meta(parent).ok_or_else(|| {
            Error::invariant(format!("{} streamed without chunk metadata", parent.id))
        })?;
        Ok(ContentStream {
            parent: parent.id.clone(),
            meta,
            fetch,
            next_index: 0,
            hasher: Sha256::new(),
            bytes_seen: 0,
            failed: false,
            finished: false,
        })
    }

    /// The parsed metadata driving this stream
    pub fn meta(&self) -> &ChunkMeta {
        &self.meta
    }

    /// Drain the stream into one buffer
    pub fn read_all(mut self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.meta.total_size as usize);
        for piece in &mut self {
            out.extend_from_slice(&piece?);
        }
        Ok(out)
    }

    fn fetch_verified(&mut self, index: u32) -> Result<Vec<u8>> {
        let child_id = self.parent.chunk_child(index);
        let chunk = (self.fetch)(&child_id).map_err(|e| match e {
            Error::NotFound { .. } | Error::Tombstoned { .. } => Error::ChunkMissing {
                parent: self.parent.clone(),
                index,
            },
            other => other,
        })?;

        let expected = chunk
            .value_after("chunk:checksum:sha256:")
            .map(str::to_owned)
            .ok_or_else(|| Error::ChunkMissing {
                parent: self.parent.clone(),
                index,
            })?;
        let actual = hex::encode(Sha256::digest(&chunk.content));
        if actual != expected {
            return Err(Error::checksum_mismatch(
                child_id.to_string(),
                expected,
                actual,
            ));
        }

        self.hasher.update(&chunk.content);
        self.bytes_seen += chunk.content.len() as u64;
        Ok(chunk.content)
    }

    fn finalize(&mut self) -> Result<()> {
        let actual = hex::encode(self.hasher.clone().finalize());
        if self.bytes_seen != self.meta.total_size {
            return Err(Error::checksum_mismatch(
                self.parent.to_string(),
                format!("{} bytes", self.meta.total_size),
                format!("{} bytes", self.bytes_seen),
            ));
        }
        if actual != self.meta.checksum_hex {
            return Err(Error::checksum_mismatch(
                self.parent.to_string(),
                self.meta.checksum_hex.clone(),
                actual,
            ));
        }
        Ok(())
    }
}

impl Iterator for ContentStream<'_> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.finished {
            return None;
        }
        if self.next_index == self.meta.count {
            self.finished = true;
            return match self.finalize() {
                Ok(()) => None,
                Err(e) => {
                    self.failed = true;
                    Some(Err(e))
                }
            };
        }

        let index = self.next_index;
        self.next_index += 1;
        match self.fetch_verified(index) {
            Ok(bytes) => Some(Ok(bytes)),
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}
