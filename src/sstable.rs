//! SSTable façade and the partition encoder
//!
//! An sstable set is either loaded (TOC first, then each declared
//! component) or populated by `write_components`, which drives one forward
//! pass over a sorted partition stream, producing Data, Index, Summary,
//! Filter and Statistics in lockstep and committing the set by writing the
//! TOC last. A half-written set is recognizable by its missing TOC and can
//! be reclaimed with `mark_for_deletion`.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tokio::fs::{File, OpenOptions};
use tracing::{debug, warn};

use crate::bloom::BloomFilter;
use crate::component::{component_filename, ComponentType, Format, Version};
use crate::composite::{compose_column_name, compose_plain_column_name, Composite, CompositeMarker};
use crate::compress::{CompressedReader, Compression, Compressor};
use crate::encoding::{narrow_u32, write_i16, write_string16, write_u32, write_u64, write_u8};
use crate::error::{Error, Result};
use crate::index::{IndexEntry, IndexList};
use crate::metadata::Statistics;
use crate::partition::{
    Cell, ClusteredRow, CollectionCell, ColumnMask, ColumnValue, DeletionTime, Partition,
    PartitionSource, Tombstone,
};
use crate::reader::RandomAccessReader;
use crate::schema::TableSchema;
use crate::stats::{ColumnStats, MetadataCollector};
use crate::summary::Summary;
use crate::writer::{Checksum, FileWriter, DEFAULT_CRC_CHUNK_SIZE};

// A TOC is a handful of short lines; reading a whole page of it means
// something is wrong with the file.
const TOC_MAX_SIZE: usize = 4096;

/// One sstable set: its identity, its component files and the in-memory
/// mirrors of the loaded components.
#[derive(Debug)]
pub struct Sstable {
    dir: PathBuf,
    version: Version,
    generation: u64,
    format: Format,
    components: BTreeSet<ComponentType>,
    summary: Summary,
    statistics: Statistics,
    compression: Option<Compression>,
    filter: Option<BloomFilter>,
    index_file: Option<File>,
    data_file: Option<File>,
    data_file_size: u64,
    bytes_on_disk: Option<u64>,
    marked_for_deletion: bool,
}

impl Sstable {
    /// An sstable handle for `(dir, la, generation, big)`. Nothing is
    /// touched on disk until `load` or `write_components`.
    pub fn new(dir: impl Into<PathBuf>, generation: u64) -> Self {
        Self {
            dir: dir.into(),
            version: Version::La,
            generation,
            format: Format::Big,
            components: BTreeSet::new(),
            summary: Summary::default(),
            statistics: Statistics::default(),
            compression: None,
            filter: None,
            index_file: None,
            data_file: None,
            data_file_size: 0,
            bytes_on_disk: None,
            marked_for_deletion: false,
        }
    }

    /// This sstable's generation number.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Path of one component file of this sstable.
    pub fn filename(&self, component: ComponentType) -> PathBuf {
        component_filename(&self.dir, self.version, self.generation, self.format, component)
    }

    /// Whether the given component is present.
    pub fn has_component(&self, component: ComponentType) -> bool {
        self.components.contains(&component)
    }

    /// The loaded Summary mirror.
    pub fn summary(&self) -> &Summary {
        &self.summary
    }

    /// The loaded Statistics mirror.
    pub fn statistics(&self) -> &Statistics {
        &self.statistics
    }

    /// The loaded compression metadata, if the table is compressed.
    pub fn compression(&self) -> Option<&Compression> {
        self.compression.as_ref()
    }

    /// The loaded bloom filter, if present.
    pub fn filter(&self) -> Option<&BloomFilter> {
        self.filter.as_ref()
    }

    /// Uncompressed size of the Data file.
    pub fn data_size(&self) -> u64 {
        match &self.compression {
            Some(compression) => compression.data_len,
            None => self.data_file_size,
        }
    }

    /// Sum of the component file sizes, cached after the first call.
    pub async fn bytes_on_disk(&mut self) -> Result<u64> {
        if let Some(bytes) = self.bytes_on_disk {
            return Ok(bytes);
        }
        let mut total = 0;
        for component in &self.components {
            let path = component_filename(
                &self.dir,
                self.version,
                self.generation,
                self.format,
                *component,
            );
            total += tokio::fs::metadata(&path).await?.len();
        }
        self.bytes_on_disk = Some(total);
        Ok(total)
    }

    /// Request best-effort removal of every component file when this
    /// sstable is dropped.
    pub fn mark_for_deletion(&mut self) {
        self.marked_for_deletion = true;
    }

    // A short read inside a component record means the file is truncated.
    // read_indexes is the one caller that inspects the mismatch itself.
    fn rewrite_mismatch(err: Error, component: ComponentType) -> Error {
        match err {
            Error::BufferSizeMismatch { got, expected } => Error::malformed(format!(
                "EOF in {} record: got {got} bytes, expected {expected}",
                component.file_name()
            )),
            other => other,
        }
    }

    fn map_not_found(err: std::io::Error, path: &Path) -> Error {
        if err.kind() == std::io::ErrorKind::NotFound {
            Error::file_not_found(path)
        } else {
            Error::Io(err)
        }
    }

    async fn open_reader(&self, component: ComponentType) -> Result<RandomAccessReader> {
        let path = self.filename(component);
        debug!(path = %path.display(), "Reading {} file", component.file_name());
        RandomAccessReader::open(&path).await.map_err(|e| match e {
            Error::Io(io) if io.kind() == std::io::ErrorKind::NotFound => {
                Error::file_not_found(&path)
            }
            other => other,
        })
    }

    async fn create_component(&self, component: ComponentType) -> Result<FileWriter> {
        let path = self.filename(component);
        debug!(path = %path.display(), "Writing {} file", component.file_name());
        let file = File::create(&path).await?;
        Ok(FileWriter::buffered(file))
    }

    /// Load the sstable: TOC, then Statistics, CompressionInfo, Filter and
    /// Summary, then open Index and Data for random reads.
    pub async fn load(&mut self) -> Result<()> {
        self.read_toc().await?;
        if self.has_component(ComponentType::CompressionInfo) == self.has_component(ComponentType::Crc)
        {
            return Err(Error::malformed(
                "SSTable must carry exactly one of CRC and CompressionInfo",
            ));
        }
        self.read_statistics().await?;
        self.read_compression().await?;
        self.read_filter().await?;
        self.read_summary().await?;
        self.open_data().await?;
        if let Some(compression) = &mut self.compression {
            compression.update(self.data_file_size);
        }
        Ok(())
    }

    /// Persist the in-memory component mirrors. The TOC goes last: it is
    /// the commit marker, so crash recovery never sees a TOC naming
    /// components that were not fully written.
    pub async fn store(&self) -> Result<()> {
        self.write_statistics().await?;
        self.write_compression().await?;
        self.write_filter().await?;
        self.write_summary().await?;
        self.write_toc().await
    }

    async fn read_toc(&mut self) -> Result<()> {
        let path = self.filename(ComponentType::Toc);
        debug!(path = %path.display(), "Reading TOC file");

        let raw = tokio::fs::read(&path)
            .await
            .map_err(|e| Self::map_not_found(e, &path))?;
        if raw.len() >= TOC_MAX_SIZE {
            return Err(Error::malformed(format!(
                "SSTable TOC too big: {} bytes",
                raw.len()
            )));
        }

        let text = String::from_utf8_lossy(&raw);
        for line in text.split('\n') {
            // accept trailing newlines
            if line.is_empty() {
                continue;
            }
            match ComponentType::from_file_name(line) {
                Some(component) => {
                    self.components.insert(component);
                }
                None => {
                    return Err(Error::malformed(format!(
                        "Unrecognized TOC component: {line}"
                    )))
                }
            }
        }
        if self.components.is_empty() {
            return Err(Error::malformed("Empty TOC"));
        }
        Ok(())
    }

    async fn write_toc(&self) -> Result<()> {
        let mut out = self.create_component(ComponentType::Toc).await?;
        for component in &self.components {
            out.write_all(component.file_name().as_bytes()).await?;
            out.write_all(b"\n").await?;
        }
        out.close().await?;
        Ok(())
    }

    async fn read_statistics(&mut self) -> Result<()> {
        let mut src = self.open_reader(ComponentType::Statistics).await?;
        self.statistics = Statistics::read(&mut src)
            .await
            .map_err(|e| Self::rewrite_mismatch(e, ComponentType::Statistics))?;
        Ok(())
    }

    async fn write_statistics(&self) -> Result<()> {
        let mut out = self.create_component(ComponentType::Statistics).await?;
        self.statistics.write(&mut out).await?;
        out.close().await?;
        Ok(())
    }

    async fn read_compression(&mut self) -> Result<()> {
        if !self.has_component(ComponentType::CompressionInfo) {
            return Ok(());
        }
        let mut src = self.open_reader(ComponentType::CompressionInfo).await?;
        let compression = Compression::read(&mut src)
            .await
            .map_err(|e| Self::rewrite_mismatch(e, ComponentType::CompressionInfo))?;
        self.compression = Some(compression);
        Ok(())
    }

    async fn write_compression(&self) -> Result<()> {
        let Some(compression) = &self.compression else {
            return Ok(());
        };
        if !self.has_component(ComponentType::CompressionInfo) {
            return Ok(());
        }
        let mut out = self.create_component(ComponentType::CompressionInfo).await?;
        compression.write(&mut out).await?;
        out.close().await?;
        Ok(())
    }

    async fn read_filter(&mut self) -> Result<()> {
        if !self.has_component(ComponentType::Filter) {
            return Ok(());
        }
        let mut src = self.open_reader(ComponentType::Filter).await?;
        let filter = BloomFilter::read(&mut src)
            .await
            .map_err(|e| Self::rewrite_mismatch(e, ComponentType::Filter))?;
        self.filter = Some(filter);
        Ok(())
    }

    async fn write_filter(&self) -> Result<()> {
        let Some(filter) = &self.filter else {
            return Ok(());
        };
        if !self.has_component(ComponentType::Filter) {
            return Ok(());
        }
        let mut out = self.create_component(ComponentType::Filter).await?;
        filter.write(&mut out).await?;
        out.close().await?;
        Ok(())
    }

    async fn read_summary(&mut self) -> Result<()> {
        let mut src = self.open_reader(ComponentType::Summary).await?;
        self.summary = Summary::read(&mut src)
            .await
            .map_err(|e| Self::rewrite_mismatch(e, ComponentType::Summary))?;
        Ok(())
    }

    async fn write_summary(&self) -> Result<()> {
        let mut out = self.create_component(ComponentType::Summary).await?;
        self.summary.write(&mut out).await?;
        out.close().await?;
        Ok(())
    }

    async fn write_digest(&self, full_checksum: u32) -> Result<()> {
        let mut out = self.create_component(ComponentType::Digest).await?;
        out.write_all(full_checksum.to_string().as_bytes()).await?;
        out.close().await?;
        Ok(())
    }

    async fn write_crc(&self, checksum: &Checksum) -> Result<()> {
        let mut out = self.create_component(ComponentType::Crc).await?;
        checksum.write(&mut out).await?;
        out.close().await?;
        Ok(())
    }

    async fn open_data(&mut self) -> Result<()> {
        let index_path = self.filename(ComponentType::Index);
        let data_path = self.filename(ComponentType::Data);

        self.index_file = Some(
            File::open(&index_path)
                .await
                .map_err(|e| Self::map_not_found(e, &index_path))?,
        );
        let data = File::open(&data_path)
            .await
            .map_err(|e| Self::map_not_found(e, &data_path))?;
        self.data_file_size = data.metadata().await?.len();
        self.data_file = Some(data);
        Ok(())
    }

    async fn create_data(&self) -> Result<(File, File)> {
        let data = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.filename(ComponentType::Data))
            .await?;
        let index = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.filename(ComponentType::Index))
            .await?;
        Ok((data, index))
    }

    /// Seek the Index file to `position` and parse up to `quantity`
    /// entries. A final entry truncated exactly at the end of the file
    /// yields fewer entries; truncation inside an entry is an error.
    pub async fn read_indexes(&self, position: u64, quantity: u64) -> Result<IndexList> {
        let file = self
            .index_file
            .as_ref()
            .ok_or_else(|| Error::malformed("Index file is not open"))?;
        let mut stream = RandomAccessReader::shared(file).await?;
        stream.seek(position).await?;

        let mut indexes = IndexList::new();
        while (indexes.len() as u64) < quantity {
            let entry_start = stream.position();
            match IndexEntry::read(&mut stream).await {
                Ok(entry) => indexes.push(entry),
                Err(Error::BufferSizeMismatch { .. }) => {
                    if stream.eof() && stream.position() == entry_start {
                        break;
                    }
                    return Err(Error::malformed(
                        "Index file truncated in the middle of an entry",
                    ));
                }
                Err(other) => return Err(other),
            }
        }
        Ok(indexes)
    }

    /// Read `len` bytes of the logical Data stream starting at `pos`,
    /// transparently decompressing when the table is compressed.
    pub async fn data_read(&self, pos: u64, len: usize) -> Result<Bytes> {
        let file = self
            .data_file
            .as_ref()
            .ok_or_else(|| Error::malformed("Data file is not open"))?;
        match &self.compression {
            Some(compression) => {
                let mut stream = CompressedReader::new(file, compression, pos).await?;
                stream.read_exactly(len).await
            }
            None => {
                let mut stream = RandomAccessReader::shared(file).await?;
                stream.seek(pos).await?;
                stream.read_exactly(len).await
            }
        }
    }

    /// Consume a sorted partition stream and produce every component of
    /// this sstable, writing the TOC last as the commit marker.
    pub async fn write_components<S: PartitionSource>(
        &mut self,
        mut source: S,
        estimated_partitions: u64,
        schema: &TableSchema,
    ) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let (data_file, index_file) = self.create_data().await?;

        self.components.extend([
            ComponentType::Toc,
            ComponentType::Statistics,
            ComponentType::Digest,
            ComponentType::Index,
            ComponentType::Summary,
            ComponentType::Data,
        ]);

        let filter_fp_chance = schema.bloom_filter_fp_chance();
        let filter = if filter_fp_chance < 1.0 {
            self.components.insert(ComponentType::Filter);
            Some(BloomFilter::with_fp_chance(
                estimated_partitions,
                filter_fp_chance,
            )?)
        } else {
            None
        };

        let params = schema.compressor_params();
        let data = if params.compressor == Compressor::None {
            self.components.insert(ComponentType::Crc);
            FileWriter::checksummed(data_file, DEFAULT_CRC_CHUNK_SIZE)
        } else {
            self.components.insert(ComponentType::CompressionInfo);
            FileWriter::compressed(
                data_file,
                Compression::for_write(params.compressor, params.chunk_length),
            )?
        };

        let mut encoder = PartitionEncoder {
            data,
            index: FileWriter::buffered(index_file),
            summary: Summary::prepare(estimated_partitions)?,
            filter,
            collector: MetadataCollector::default(),
            c_stats: ColumnStats::default(),
            schema,
            first_key: None,
            last_key: None,
        };

        while let Some(partition) = source.next_partition().await? {
            encoder.write_partition(&partition).await?;
        }

        let PartitionEncoder {
            data,
            index,
            mut summary,
            filter,
            mut collector,
            first_key,
            last_key,
            ..
        } = encoder;

        summary.seal(first_key, last_key)?;
        index.close().await?;

        let uncompressed_len = data.offset();
        let sealed = data.close().await?;

        if let Some(compression) = sealed.compression {
            collector
                .add_compression_ratio(compression.compressed_file_length(), uncompressed_len);
            self.compression = Some(compression);
        }
        self.summary = summary;
        self.filter = filter;
        self.statistics = collector.seal_statistics(schema.partitioner(), filter_fp_chance)?;

        // Data is on disk and synced before its Digest exists.
        self.write_digest(sealed.full_checksum).await?;
        if let Some(checksum) = sealed.checksum {
            self.write_crc(&checksum).await?;
        }

        self.write_summary().await?;
        self.write_filter().await?;
        self.write_statistics().await?;
        self.write_compression().await?;
        self.write_toc().await
    }
}

impl Drop for Sstable {
    fn drop(&mut self) {
        if !self.marked_for_deletion {
            return;
        }
        // Best effort: a failed deletion is retried by the next startup
        // sweep, and generation numbers are never reused.
        for component in &self.components {
            let path = component_filename(
                &self.dir,
                self.version,
                self.generation,
                self.format,
                *component,
            );
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "Failed to delete sstable component");
            }
        }
    }
}

/// Write-path state threaded through one pass over the partition stream.
struct PartitionEncoder<'a> {
    data: FileWriter,
    index: FileWriter,
    summary: Summary,
    filter: Option<BloomFilter>,
    collector: MetadataCollector,
    c_stats: ColumnStats,
    schema: &'a TableSchema,
    first_key: Option<Bytes>,
    last_key: Option<Bytes>,
}

impl PartitionEncoder<'_> {
    fn update_cell_stats(&mut self, timestamp: i64) {
        self.c_stats.update_timestamp(timestamp);
        self.c_stats.column_count += 1;
    }

    // Every written column name feeds the min/max trackers with its full
    // component list: the clustering prefix followed by the appended
    // components.
    async fn write_column_name(
        &mut self,
        clustering: &Composite,
        values: &[Bytes],
        marker: CompositeMarker,
    ) -> Result<()> {
        let mut components = clustering.components().to_vec();
        components.extend_from_slice(values);
        self.c_stats.update_column_names(&components);

        let frame = compose_column_name(clustering, values, marker)?;
        self.data.write_all(&frame).await
    }

    async fn write_plain_column_name(&mut self, name: &Bytes) -> Result<()> {
        self.c_stats.update_column_names(std::slice::from_ref(name));
        let frame = compose_plain_column_name(name)?;
        self.data.write_all(&frame).await
    }

    // Cell components that follow the column name.
    async fn write_cell(&mut self, cell: &Cell) -> Result<()> {
        self.update_cell_stats(cell.timestamp());
        match cell {
            Cell::Tombstone {
                timestamp,
                deletion_time,
            } => {
                self.c_stats
                    .tombstone_histogram
                    .update(u64::from(*deletion_time));
                write_u8(&mut self.data, ColumnMask::Deletion as u8).await?;
                write_u64(&mut self.data, *timestamp as u64).await?;
                write_u32(&mut self.data, 4).await?;
                write_u32(&mut self.data, *deletion_time).await
            }
            Cell::Expiring {
                timestamp,
                ttl,
                expiry,
                value,
            } => {
                write_u8(&mut self.data, ColumnMask::Expiration as u8).await?;
                write_u32(&mut self.data, *ttl).await?;
                write_u32(&mut self.data, *expiry).await?;
                write_u64(&mut self.data, *timestamp as u64).await?;
                write_u32(&mut self.data, narrow_u32(value.len())?).await?;
                self.data.write_all(value).await
            }
            Cell::Live { timestamp, value } => {
                write_u8(&mut self.data, ColumnMask::None as u8).await?;
                write_u64(&mut self.data, *timestamp as u64).await?;
                write_u32(&mut self.data, narrow_u32(value.len())?).await?;
                self.data.write_all(value).await
            }
        }
    }

    // A row marker is an empty-value cell at the row's bare clustering
    // prefix. Rows with no creation timestamp write none.
    async fn write_row_marker(&mut self, row: &ClusteredRow, clustering: &Composite) -> Result<()> {
        let Some(created_at) = row.created_at else {
            return Ok(());
        };
        self.write_column_name(clustering, &[Bytes::new()], CompositeMarker::None)
            .await?;
        self.update_cell_stats(created_at);
        write_u8(&mut self.data, ColumnMask::None as u8).await?;
        write_u64(&mut self.data, created_at as u64).await?;
        write_u32(&mut self.data, 0).await
    }

    async fn write_range_tombstone(
        &mut self,
        start: &Composite,
        end: &Composite,
        suffix: &[Bytes],
        tombstone: Tombstone,
    ) -> Result<()> {
        self.write_column_name(start, suffix, CompositeMarker::StartRange)
            .await?;
        write_u8(&mut self.data, ColumnMask::RangeTombstone as u8).await?;
        self.write_column_name(end, suffix, CompositeMarker::EndRange)
            .await?;

        self.update_cell_stats(tombstone.timestamp);
        self.c_stats
            .tombstone_histogram
            .update(tombstone.deletion_time.max(0) as u64);

        write_u32(&mut self.data, tombstone.deletion_time as u32).await?;
        write_u64(&mut self.data, tombstone.timestamp as u64).await
    }

    // A collection serializes as a range tombstone over its column name
    // followed by one column-name-extended cell per element.
    async fn write_collection(
        &mut self,
        clustering: &Composite,
        name: &Bytes,
        collection: &CollectionCell,
    ) -> Result<()> {
        if let Some(tombstone) = collection.tombstone {
            self.write_range_tombstone(
                clustering,
                clustering,
                std::slice::from_ref(name),
                tombstone,
            )
            .await?;
        }
        for (element_key, cell) in &collection.cells {
            let values = [name.clone(), element_key.clone()];
            self.write_column_name(clustering, &values, CompositeMarker::None)
                .await?;
            self.write_cell(cell).await?;
        }
        Ok(())
    }

    async fn write_clustered_row(&mut self, row: &ClusteredRow) -> Result<()> {
        let clustering = Composite::from_clustering(&row.clustering)?;
        if self.schema.is_compound() {
            self.write_row_marker(row, &clustering).await?;
        }

        for (id, value) in &row.cells {
            let name = self.schema.regular_column_at(*id)?.name.clone();
            match value {
                ColumnValue::Collection(collection) => {
                    self.write_collection(&clustering, &name, collection).await?;
                }
                ColumnValue::Atomic(cell) => {
                    if self.schema.is_compound() {
                        self.write_column_name(
                            &clustering,
                            std::slice::from_ref(&name),
                            CompositeMarker::None,
                        )
                        .await?;
                    } else {
                        self.write_plain_column_name(&name).await?;
                    }
                    self.write_cell(cell).await?;
                }
            }
        }
        Ok(())
    }

    async fn write_static_row(&mut self, cells: &[(u32, ColumnValue)]) -> Result<()> {
        if cells.is_empty() {
            return Ok(());
        }
        let prefix = Composite::static_prefix();
        for (id, value) in cells {
            let name = self.schema.static_column_at(*id)?.name.clone();
            match value {
                ColumnValue::Collection(collection) => {
                    self.write_collection(&prefix, &name, collection).await?;
                }
                ColumnValue::Atomic(cell) => {
                    self.write_column_name(&prefix, std::slice::from_ref(&name), CompositeMarker::None)
                        .await?;
                    self.write_cell(cell).await?;
                }
            }
        }
        Ok(())
    }

    async fn write_partition(&mut self, partition: &Partition) -> Result<()> {
        self.c_stats.start_offset = self.data.offset();
        let key = partition.key.clone();

        self.summary.maybe_add_entry(&key, self.index.offset());
        if let Some(filter) = &mut self.filter {
            filter.insert(&key);
        }
        self.collector.add_key(&key);

        IndexEntry::write_parts(&mut self.index, &key, self.data.offset()).await?;
        write_string16(&mut self.data, &key).await?;

        let deletion = DeletionTime::from(partition.tombstone);
        if !deletion.is_live() {
            self.c_stats
                .tombstone_histogram
                .update(deletion.local_deletion_time.max(0) as u64);
            self.c_stats
                .update_local_deletion_time(deletion.local_deletion_time);
            self.c_stats.update_timestamp(deletion.marked_for_delete_at);
        }
        deletion.write(&mut self.data).await?;

        self.write_static_row(&partition.static_row).await?;
        for range_tombstone in &partition.range_tombstones {
            let start = Composite::from_clustering(&range_tombstone.start)?;
            let end = Composite::from_clustering(&range_tombstone.end)?;
            self.write_range_tombstone(&start, &end, &[], range_tombstone.tombstone)
                .await?;
        }
        for row in &partition.rows {
            self.write_clustered_row(row).await?;
        }
        write_i16(&mut self.data, 0).await?;

        self.c_stats.row_size = self.data.offset() - self.c_stats.start_offset;
        let stats = std::mem::take(&mut self.c_stats);
        self.collector.update(stats);

        if self.first_key.is_none() {
            self.first_key = Some(key);
        } else {
            self.last_key = Some(key);
        }
        Ok(())
    }
}
