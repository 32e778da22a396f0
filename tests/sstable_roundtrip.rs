//! End-to-end write/read scenarios over real sstable sets
//!
//! Each test writes a full sstable set into a temp directory through the
//! partition encoder and inspects the produced files byte by byte, or
//! loads them back through the façade.

use std::path::Path;

use bytes::Bytes;
use rand::{Rng, SeedableRng};

use sstablite::metadata::{Metadata, MetadataType, StatsMetadata};
use sstablite::reader::RandomAccessReader;
use sstablite::writer::Checksum;
use sstablite::{
    Cell, ClusteredRow, ColumnValue, ComponentType, CompressionParams, Compressor, Error,
    MemorySource, Partition, RangeTombstone, Sstable, TableSchema, Tombstone,
};

fn crc32(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

fn int_key(i: u32) -> Bytes {
    Bytes::copy_from_slice(&i.to_be_bytes())
}

fn live_row(timestamp: i64, value: &[u8]) -> ClusteredRow {
    ClusteredRow {
        clustering: Vec::new(),
        created_at: None,
        cells: vec![(
            0,
            ColumnValue::Atomic(Cell::Live {
                timestamp,
                value: Bytes::copy_from_slice(value),
            }),
        )],
    }
}

fn simple_schema() -> TableSchema {
    TableSchema::new(false).with_regular_column("v")
}

async fn build_sstable(
    dir: &Path,
    generation: u64,
    schema: &TableSchema,
    partitions: Vec<Partition>,
) -> Sstable {
    let mut sstable = Sstable::new(dir, generation);
    let count = partitions.len() as u64;
    sstable
        .write_components(MemorySource::new(partitions), count, schema)
        .await
        .unwrap();
    sstable
}

async fn load_sstable(dir: &Path, generation: u64) -> Sstable {
    let mut sstable = Sstable::new(dir, generation);
    sstable.load().await.unwrap();
    sstable
}

#[tokio::test]
async fn single_partition_single_live_cell() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut partition = Partition::with_key(int_key(1));
    partition.rows.push(live_row(100, &100u32.to_be_bytes()));

    let written = build_sstable(dir.path(), 1, &simple_schema(), vec![partition]).await;

    // key(6) + deletion_time(12) + column name(3) + cell(17) + end marker(2)
    let data = std::fs::read(written.filename(ComponentType::Data)).unwrap();
    assert_eq!(data.len(), 40);
    #[rustfmt::skip]
    let golden: [u8; 40] = [
        0x00, 0x04, 0x00, 0x00, 0x00, 0x01,                   // partition key
        0x7F, 0xFF, 0xFF, 0xFF,                               // live local_deletion_time
        0x80, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,       // live marked_for_delete_at
        0x00, 0x01, b'v',                                     // column name
        0x00,                                                 // column_mask::none
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x64,       // timestamp 100
        0x00, 0x00, 0x00, 0x04, 0x00, 0x00, 0x00, 0x64,       // value length + value 100
        0x00, 0x00,                                           // end of partition
    ];
    assert_eq!(data, golden);

    assert_eq!(written.summary().entries.len(), 1);
    assert_eq!(&written.summary().entries[0].key[..], &int_key(1)[..]);
    assert!(written.filter().unwrap().contains(&int_key(1)));

    let digest = std::fs::read_to_string(written.filename(ComponentType::Digest)).unwrap();
    assert_eq!(digest.parse::<u32>().unwrap(), crc32(&data));

    let loaded = load_sstable(dir.path(), 1).await;
    let indexes = loaded.read_indexes(0, 100).await.unwrap();
    assert_eq!(indexes.len(), 1);
    assert_eq!(&indexes[0].key[..], &int_key(1)[..]);
    assert_eq!(indexes[0].position, 0);
    assert!(indexes[0].promoted_index.is_empty());
}

fn stats_of(sstable: &Sstable) -> &StatsMetadata {
    match &sstable.statistics().contents[&MetadataType::Stats] {
        Metadata::Stats(stats) => stats,
        other => panic!("unexpected metadata record: {other:?}"),
    }
}

#[tokio::test]
async fn partition_tombstone() {
    let dir = tempfile::TempDir::new().unwrap();
    let deletion_time = 1_400_000_000;
    let mut partition = Partition::with_key(int_key(1));
    partition.tombstone = Some(Tombstone {
        timestamp: 5000,
        deletion_time,
    });

    let written = build_sstable(dir.path(), 1, &simple_schema(), vec![partition]).await;

    // deletion record follows the 6-byte key: local_deletion_time then
    // marked_for_delete_at
    let data = std::fs::read(written.filename(ComponentType::Data)).unwrap();
    let local_deletion_time =
        i32::from_be_bytes([data[6], data[7], data[8], data[9]]);
    assert!(local_deletion_time < i32::MAX);
    assert_eq!(local_deletion_time, deletion_time);

    let stats = stats_of(&written);
    let histogram = &stats.estimated_tombstone_drop_time;
    assert_eq!(histogram.count(), 1);
    let bucket = match histogram
        .bucket_offsets
        .binary_search(&(deletion_time as u64))
    {
        Ok(i) | Err(i) => i.min(histogram.buckets.len() - 1),
    };
    assert_eq!(histogram.buckets[bucket], 1);
}

#[tokio::test]
async fn range_tombstone_over_clustering_range() {
    let dir = tempfile::TempDir::new().unwrap();
    let schema = TableSchema::new(true).with_regular_column("v");
    let mut partition = Partition::with_key(int_key(1));
    partition.range_tombstones.push(RangeTombstone {
        start: vec![int_key(1)],
        end: vec![int_key(2)],
        tombstone: Tombstone {
            timestamp: 9000,
            deletion_time: 1_400_000_000,
        },
    });

    let written = build_sstable(dir.path(), 1, &schema, vec![partition]).await;

    let data = std::fs::read(written.filename(ComponentType::Data)).unwrap();
    // key(6) + deletion_time(12), then the framed markers
    let body = &data[18..];
    let start_marker = &body[..9];
    assert_eq!(
        start_marker,
        &[0x00, 0x07, 0x00, 0x04, 0, 0, 0, 1, 0xFF]
    );
    assert_eq!(body[9], 0x10); // column_mask::range_tombstone
    let end_marker = &body[10..19];
    assert_eq!(end_marker, &[0x00, 0x07, 0x00, 0x04, 0, 0, 0, 2, 0x01]);
    let deletion = u32::from_be_bytes([body[19], body[20], body[21], body[22]]);
    assert_eq!(deletion, 1_400_000_000);
    let timestamp = u64::from_be_bytes([
        body[23], body[24], body[25], body[26], body[27], body[28], body[29], body[30],
    ]);
    assert_eq!(timestamp, 9000);

    let stats = stats_of(&written);
    assert_eq!(stats.min_column_names, vec![int_key(1)]);
    assert_eq!(stats.max_column_names, vec![int_key(2)]);
}

fn bulk_partitions(count: u32, value_len: usize) -> Vec<Partition> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(42);
    (0..count)
        .map(|i| {
            let mut value = vec![0u8; value_len];
            rng.fill(&mut value[..]);
            let mut partition = Partition::with_key(int_key(i));
            partition.rows.push(live_row(i64::from(i), &value));
            partition
        })
        .collect()
}

#[tokio::test]
async fn compressed_round_trip_matches_uncompressed() {
    let dir = tempfile::TempDir::new().unwrap();
    let partitions = bulk_partitions(1000, 100);

    let plain_schema = simple_schema();
    let lz4_schema = simple_schema().with_compression(CompressionParams {
        compressor: Compressor::Lz4,
        chunk_length: 4096,
    });

    build_sstable(dir.path(), 1, &plain_schema, partitions.clone()).await;
    build_sstable(dir.path(), 2, &lz4_schema, partitions).await;

    let plain = load_sstable(dir.path(), 1).await;
    let compressed = load_sstable(dir.path(), 2).await;

    let plain_len = std::fs::metadata(plain.filename(ComponentType::Data)).unwrap().len();
    let info = compressed.compression().unwrap();
    assert_eq!(info.data_len, plain_len);
    assert!(info.offsets.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(compressed.data_size(), plain.data_size());

    let mut pos = 0u64;
    while pos < plain_len {
        let len = 7000.min((plain_len - pos) as usize);
        let expected = plain.data_read(pos, len).await.unwrap();
        let actual = compressed.data_read(pos, len).await.unwrap();
        assert_eq!(expected, actual, "mismatch at offset {pos}");
        pos += len as u64;
    }
}

#[tokio::test]
async fn load_fails_without_declared_filter() {
    let dir = tempfile::TempDir::new().unwrap();
    let schema = simple_schema().with_compression(CompressionParams {
        compressor: Compressor::Lz4,
        chunk_length: 4096,
    });
    let written = build_sstable(dir.path(), 1, &schema, bulk_partitions(10, 32)).await;

    std::fs::remove_file(written.filename(ComponentType::Filter)).unwrap();

    let mut reloaded = Sstable::new(dir.path(), 1);
    match reloaded.load().await {
        Err(Error::FileNotFound(path)) => {
            assert!(path.to_string_lossy().ends_with("Filter.db"));
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

#[tokio::test]
async fn load_fails_on_bogus_toc() {
    let dir = tempfile::TempDir::new().unwrap();
    let sstable = Sstable::new(dir.path(), 1);
    std::fs::write(sstable.filename(ComponentType::Toc), "BogusComponent.db\n").unwrap();

    let mut reloaded = Sstable::new(dir.path(), 1);
    match reloaded.load().await {
        Err(Error::MalformedSstable(msg)) => {
            assert_eq!(msg, "Unrecognized TOC component: BogusComponent.db");
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

#[tokio::test]
async fn toc_matches_files_on_disk() {
    let dir = tempfile::TempDir::new().unwrap();
    build_sstable(dir.path(), 7, &simple_schema(), bulk_partitions(5, 16)).await;

    let toc_path = dir.path().join("la-7-big-TOC.txt");
    let toc = std::fs::read_to_string(&toc_path).unwrap();
    let mut named: Vec<String> = toc
        .split('\n')
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect();
    named.sort();

    let mut present: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .map(|name| {
            name.strip_prefix("la-7-big-")
                .expect("unexpected file in sstable dir")
                .to_string()
        })
        .collect();
    present.sort();

    assert_eq!(named, present);
}

#[tokio::test]
async fn crc_component_covers_every_chunk() {
    let dir = tempfile::TempDir::new().unwrap();
    // > 32 KiB of data so the CRC file holds several chunks
    let written = build_sstable(dir.path(), 1, &simple_schema(), bulk_partitions(800, 128)).await;

    let data = std::fs::read(written.filename(ComponentType::Data)).unwrap();
    let mut src = RandomAccessReader::open(&written.filename(ComponentType::Crc))
        .await
        .unwrap();
    let checksum = Checksum::read(&mut src).await.unwrap();

    let chunk_size = checksum.chunk_size as usize;
    let expected: Vec<u32> = data.chunks(chunk_size).map(crc32).collect();
    assert!(expected.len() > 1);
    assert_eq!(checksum.checksums, expected);

    let digest = std::fs::read_to_string(written.filename(ComponentType::Digest)).unwrap();
    assert_eq!(digest.parse::<u32>().unwrap(), crc32(&data));
}

#[tokio::test]
async fn summary_samples_every_interval() {
    let dir = tempfile::TempDir::new().unwrap();
    let written = build_sstable(dir.path(), 1, &simple_schema(), bulk_partitions(300, 8)).await;

    let summary = written.summary();
    assert_eq!(summary.header.min_index_interval, 128);
    // ceil(300 / 128)
    assert_eq!(summary.entries.len(), 3);

    // each index entry is key(2 + 4) + position(8) + promoted index(4)
    let entry_size = 18u64;
    for (k, entry) in summary.entries.iter().enumerate() {
        let index_ordinal = k as u64 * 128;
        assert_eq!(entry.position, index_ordinal * entry_size);
        assert_eq!(&entry.key[..], &int_key(k as u32 * 128)[..]);
    }
}

#[tokio::test]
async fn index_entries_point_at_their_partitions() {
    let dir = tempfile::TempDir::new().unwrap();
    build_sstable(dir.path(), 1, &simple_schema(), bulk_partitions(64, 24)).await;

    let loaded = load_sstable(dir.path(), 1).await;
    let indexes = loaded.read_indexes(0, 1000).await.unwrap();
    assert_eq!(indexes.len(), 64);

    for entry in &indexes {
        let framed = loaded
            .data_read(entry.position, 2 + entry.key.len())
            .await
            .unwrap();
        let key_len = u16::from_be_bytes([framed[0], framed[1]]) as usize;
        assert_eq!(key_len, entry.key.len());
        assert_eq!(&framed[2..], &entry.key[..]);
    }
}

#[tokio::test]
async fn read_indexes_stops_cleanly_at_eof_and_rejects_truncation() {
    let dir = tempfile::TempDir::new().unwrap();
    build_sstable(dir.path(), 1, &simple_schema(), bulk_partitions(20, 8)).await;

    let loaded = load_sstable(dir.path(), 1).await;
    // asking for more entries than exist ends cleanly at the boundary
    let indexes = loaded.read_indexes(0, 1000).await.unwrap();
    assert_eq!(indexes.len(), 20);

    // a file cut mid-entry is malformed
    let index_path = loaded.filename(ComponentType::Index);
    let len = std::fs::metadata(&index_path).unwrap().len();
    let file = std::fs::OpenOptions::new()
        .write(true)
        .open(&index_path)
        .unwrap();
    file.set_len(len - 5).unwrap();

    match loaded.read_indexes(0, 1000).await {
        Err(Error::MalformedSstable(msg)) => assert!(msg.contains("truncated")),
        other => panic!("unexpected result: {other:?}"),
    }
}

#[tokio::test]
async fn filter_is_sound_and_fp_bounded() {
    let dir = tempfile::TempDir::new().unwrap();
    build_sstable(dir.path(), 1, &simple_schema(), bulk_partitions(2000, 8)).await;

    let loaded = load_sstable(dir.path(), 1).await;
    let filter = loaded.filter().unwrap();
    for i in 0..2000u32 {
        assert!(filter.contains(&int_key(i)));
    }

    let mut false_positives = 0;
    for i in 0..10_000u32 {
        if filter.contains(&(1_000_000 + i).to_be_bytes()) {
            false_positives += 1;
        }
    }
    // fp_chance defaults to 0.01; allow 2x over 10k probes
    assert!(false_positives <= 200, "{false_positives} false positives");
}

#[tokio::test]
async fn loaded_mirrors_match_written_mirrors() {
    let dir = tempfile::TempDir::new().unwrap();
    let schema = simple_schema().with_compression(CompressionParams {
        compressor: Compressor::Snappy,
        chunk_length: 4096,
    });
    let written = build_sstable(dir.path(), 1, &schema, bulk_partitions(300, 64)).await;
    let loaded = load_sstable(dir.path(), 1).await;

    assert_eq!(loaded.summary(), written.summary());
    assert_eq!(loaded.statistics(), written.statistics());
    assert_eq!(loaded.filter(), written.filter());
    assert_eq!(loaded.compression(), written.compression());
    for component in [
        ComponentType::Toc,
        ComponentType::Data,
        ComponentType::Index,
        ComponentType::Summary,
        ComponentType::Statistics,
        ComponentType::Digest,
        ComponentType::Filter,
        ComponentType::CompressionInfo,
    ] {
        assert!(loaded.has_component(component));
    }
    assert!(!loaded.has_component(ComponentType::Crc));
}

#[tokio::test]
async fn store_rewrites_metadata_components() {
    let dir = tempfile::TempDir::new().unwrap();
    build_sstable(dir.path(), 1, &simple_schema(), bulk_partitions(40, 16)).await;

    let first = load_sstable(dir.path(), 1).await;
    first.store().await.unwrap();

    let second = load_sstable(dir.path(), 1).await;
    assert_eq!(second.summary(), first.summary());
    assert_eq!(second.statistics(), first.statistics());
    assert_eq!(second.filter(), first.filter());
}

#[tokio::test]
async fn empty_partition_stream_fails() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut sstable = Sstable::new(dir.path(), 1);
    let result = sstable
        .write_components(MemorySource::new(Vec::new()), 0, &simple_schema())
        .await;
    assert!(matches!(result, Err(Error::MalformedSstable(_))));
    // no TOC was written: the partial set is not committed
    assert!(!sstable.filename(ComponentType::Toc).exists());
}

#[tokio::test]
async fn bytes_on_disk_sums_components() {
    let dir = tempfile::TempDir::new().unwrap();
    build_sstable(dir.path(), 1, &simple_schema(), bulk_partitions(10, 32)).await;

    let mut loaded = load_sstable(dir.path(), 1).await;
    let expected: u64 = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|entry| entry.unwrap().metadata().unwrap().len())
        .sum();
    assert_eq!(loaded.bytes_on_disk().await.unwrap(), expected);
}

#[tokio::test]
async fn mark_for_deletion_reclaims_partial_set() {
    let dir = tempfile::TempDir::new().unwrap();
    build_sstable(dir.path(), 1, &simple_schema(), bulk_partitions(5, 8)).await;
    {
        let mut loaded = load_sstable(dir.path(), 1).await;
        loaded.mark_for_deletion();
    }
    let leftovers: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
    assert!(leftovers.is_empty());
}
