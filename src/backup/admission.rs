use crate::backup::compress::{CompressionAlgorithm, CompressionLevel, CompressorConfig};
use crate::backup::metadata::DatabaseMetadata;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::WithMsg;
use bon::Builder;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, warn};

/// Text dump size relative to on-disk table size.
pub const DUMP_EXPANSION: f64 = 1.35;
/// Encrypted stream header and per-chunk tag overhead.
pub const ENCRYPTION_OVERHEAD: f64 = 1.01;
/// Extra room for bundling several databases into one artifact.
pub const COMBINED_OVERHEAD: f64 = 1.05;
/// Ratio assumed for an algorithm missing from the table.
pub const FALLBACK_RATIO: f64 = 0.6;
pub const DEFAULT_SAFETY_MARGIN_PERCENT: f64 = 10.0;

fn ceil(value: f64) -> u64 {
    value.max(0.0).ceil() as u64
}

/// Expected compressed/uncompressed size ratio per algorithm and level.
#[derive(Clone, Debug, PartialEq)]
pub struct CompressionRatioTable {
    ratios: HashMap<(CompressionAlgorithm, CompressionLevel), f64>,
}

impl Default for CompressionRatioTable {
    fn default() -> Self {
        let deflate = [0.40, 0.35, 0.30, 0.28, 0.25];
        let zstd = [0.35, 0.32, 0.28, 0.25, 0.22];

        let mut table = Self::empty();
        for (i, level) in CompressionLevel::ALL.into_iter().enumerate() {
            for algorithm in [
                CompressionAlgorithm::Gzip,
                CompressionAlgorithm::ParallelGzip,
                CompressionAlgorithm::Zlib,
            ] {
                table = table.with_ratio(algorithm, level, deflate[i]);
            }
            table = table.with_ratio(CompressionAlgorithm::Zstd, level, zstd[i]);
        }
        table
    }
}

impl CompressionRatioTable {
    pub fn empty() -> Self {
        Self {
            ratios: HashMap::new(),
        }
    }

    pub fn with_ratio(
        mut self,
        algorithm: CompressionAlgorithm,
        level: CompressionLevel,
        ratio: f64,
    ) -> Self {
        self.ratios.insert((algorithm, level), ratio);
        self
    }

    /// Exact level, then the algorithm's default level, then [`FALLBACK_RATIO`].
    pub fn lookup(&self, algorithm: CompressionAlgorithm, level: CompressionLevel) -> f64 {
        if algorithm == CompressionAlgorithm::None {
            return 1.0;
        }
        self.ratios
            .get(&(algorithm, level))
            .or_else(|| self.ratios.get(&(algorithm, CompressionLevel::Default)))
            .copied()
            .unwrap_or(FALLBACK_RATIO)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SizeEstimate {
    pub database: String,
    pub original_size: u64,
    pub estimated_dump_size: u64,
    pub estimated_final_size: u64,
    pub compression_ratio_applied: f64,
    pub compression_on: bool,
    pub encryption_on: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AdmissionResult {
    pub estimated_total: u64,
    pub required_with_margin: u64,
    pub available_free: u64,
    pub total_space: u64,
    pub sufficient: bool,
    pub per_database: Vec<SizeEstimate>,
    pub databases_without_metadata: usize,
}

impl AdmissionResult {
    /// Bytes missing for the run to be admitted; zero when sufficient.
    pub fn shortage(&self) -> u64 {
        self.required_with_margin.saturating_sub(self.available_free)
    }

    pub fn ensure_sufficient(&self) -> Result<()> {
        if self.sufficient {
            Ok(())
        } else {
            Err(Error::InsufficientSpace {
                required: self.required_with_margin,
                available: self.available_free,
            })
        }
    }
}

#[derive(Clone, Debug, PartialEq, Builder)]
pub struct CapacityConfig {
    #[builder(default)]
    pub compression: CompressorConfig,
    #[builder(default)]
    pub encryption_on: bool,
    /// One artifact for the whole run
    #[builder(default)]
    pub combined: bool,
    #[builder(default = DEFAULT_SAFETY_MARGIN_PERCENT)]
    pub safety_margin_percent: f64,
    #[builder(default)]
    pub ratios: CompressionRatioTable,
}

pub fn estimate_database(database: &str, original_size: u64, config: &CapacityConfig) -> SizeEstimate {
    let estimated_dump_size = ceil(original_size as f64 * DUMP_EXPANSION);
    let compression_on = config.compression.is_enabled();

    let compression_ratio_applied = if compression_on {
        config
            .ratios
            .lookup(config.compression.algorithm, config.compression.level)
    } else {
        1.0
    };
    let mut estimated_final_size = if compression_on {
        ceil(estimated_dump_size as f64 * compression_ratio_applied)
    } else {
        estimated_dump_size
    };
    if config.encryption_on {
        estimated_final_size = ceil(estimated_final_size as f64 * ENCRYPTION_OVERHEAD);
    }

    SizeEstimate {
        database: database.to_string(),
        original_size,
        estimated_dump_size,
        estimated_final_size,
        compression_ratio_applied,
        compression_on,
        encryption_on: config.encryption_on,
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DiskUsage {
    pub total: u64,
    pub free: u64,
}

pub trait FreeSpaceProbe: Send + Sync {
    fn disk_usage(&self, dir: &Path) -> Result<DiskUsage>;
}

/// Space available to the current user on the filesystem holding `dir`.
#[derive(Clone, Copy, Debug, Default)]
pub struct FsFreeSpace;

impl FreeSpaceProbe for FsFreeSpace {
    fn disk_usage(&self, dir: &Path) -> Result<DiskUsage> {
        let usage = fs2::total_space(dir).and_then(|total| {
            fs2::available_space(dir).map(|free| DiskUsage { total, free })
        });
        usage
            .map_err(Error::from)
            .with_msg(format!("Query free space failed: {dir:?}"))
    }
}

/// Compares the estimated artifact total, plus the safety margin, with the
/// free space of the filesystem holding `out_dir`. Every stage rounds up.
pub fn check_capacity(
    out_dir: &Path,
    names: &[String],
    metadata: &HashMap<String, DatabaseMetadata>,
    config: &CapacityConfig,
    probe: &dyn FreeSpaceProbe,
) -> Result<AdmissionResult> {
    let mut per_database = Vec::with_capacity(names.len());
    let mut databases_without_metadata = 0;

    for name in names {
        match metadata.get(name).map(DatabaseMetadata::size_bytes) {
            Some(size) if size > 0 => per_database.push(estimate_database(name, size, config)),
            _ => {
                warn!("No size metadata for {name}, leaving it out of the space estimate");
                databases_without_metadata += 1;
            }
        }
    }

    let mut estimated_total: u64 = per_database.iter().map(|e| e.estimated_final_size).sum();
    if config.combined {
        estimated_total = ceil(estimated_total as f64 * COMBINED_OVERHEAD);
    }
    let required_with_margin =
        ceil(estimated_total as f64 * (1.0 + config.safety_margin_percent / 100.0));

    let usage = probe.disk_usage(out_dir)?;
    let result = AdmissionResult {
        estimated_total,
        required_with_margin,
        available_free: usage.free,
        total_space: usage.total,
        sufficient: usage.free >= required_with_margin,
        per_database,
        databases_without_metadata,
    };

    info!(
        "Space check for {:?}: {} bytes required (estimate {}), {} bytes free",
        out_dir, result.required_with_margin, result.estimated_total, result.available_free
    );
    if !result.sufficient {
        warn!("Insufficient disk space, {} bytes short", result.shortage());
    }
    Ok(result)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    pub(crate) struct FixedSpace(pub u64);

    impl FreeSpaceProbe for FixedSpace {
        fn disk_usage(&self, _dir: &Path) -> Result<DiskUsage> {
            Ok(DiskUsage {
                total: self.0.saturating_mul(2),
                free: self.0,
            })
        }
    }

    fn metadata(sizes: &[(&str, u64)]) -> HashMap<String, DatabaseMetadata> {
        sizes
            .iter()
            .map(|(name, size)| {
                (
                    name.to_string(),
                    DatabaseMetadata::builder().name(*name).size_bytes(*size).build(),
                )
            })
            .collect()
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn gzip_default() -> CapacityConfig {
        CapacityConfig::builder()
            .compression(CompressorConfig::new(
                CompressionAlgorithm::Gzip,
                CompressionLevel::Default,
            ))
            .build()
    }

    #[test]
    fn test_ratio_lookup_fallbacks() {
        let table = CompressionRatioTable::default();
        assert_eq!(table.lookup(CompressionAlgorithm::Gzip, CompressionLevel::Default), 0.30);
        assert_eq!(table.lookup(CompressionAlgorithm::Zstd, CompressionLevel::Best), 0.22);
        assert_eq!(table.lookup(CompressionAlgorithm::None, CompressionLevel::Best), 1.0);

        let sparse = CompressionRatioTable::empty().with_ratio(
            CompressionAlgorithm::Zlib,
            CompressionLevel::Default,
            0.5,
        );
        assert_eq!(sparse.lookup(CompressionAlgorithm::Zlib, CompressionLevel::Best), 0.5);
        assert_eq!(
            sparse.lookup(CompressionAlgorithm::Zstd, CompressionLevel::Best),
            FALLBACK_RATIO
        );
    }

    #[test]
    fn test_estimate_is_monotonic() {
        let configs = [
            CapacityConfig::builder().build(),
            gzip_default(),
            CapacityConfig::builder()
                .compression(CompressorConfig::new(
                    CompressionAlgorithm::Zstd,
                    CompressionLevel::Best,
                ))
                .encryption_on(true)
                .build(),
        ];
        let sizes = [1, 2, 3, 999, 1000, 4096, 10 * MIB, 10 * MIB + 1, 5 << 30];
        for config in &configs {
            for pair in sizes.windows(2) {
                let a = estimate_database("a", pair[0], config);
                let b = estimate_database("b", pair[1], config);
                assert!(a.estimated_final_size <= b.estimated_final_size);
                assert!(a.estimated_final_size > 0);
            }
        }
    }

    #[test]
    fn test_estimate_rounds_up() {
        let estimate = estimate_database("tiny", 1, &gzip_default());
        assert_eq!(estimate.estimated_dump_size, 2);
        assert_eq!(estimate.estimated_final_size, 1);

        let encrypted = CapacityConfig::builder().encryption_on(true).build();
        let estimate = estimate_database("tiny", 100, &encrypted);
        assert_eq!(estimate.estimated_dump_size, 135);
        assert_eq!(estimate.estimated_final_size, 137);
        assert!(!estimate.compression_on);
        assert_eq!(estimate.compression_ratio_applied, 1.0);
    }

    #[test]
    fn test_sufficient_space() {
        let meta = metadata(&[("a", 100 * MIB), ("b", 200 * MIB), ("c", 50 * MIB)]);
        let result = check_capacity(
            Path::new("/backups"),
            &names(&["a", "b", "c"]),
            &meta,
            &gzip_default(),
            &FixedSpace(1024 * MIB),
        )
        .unwrap();

        let expected = 0.3 * 1.35 * (350 * MIB) as f64;
        assert!((result.estimated_total as f64 - expected).abs() < 8.0);
        assert_eq!(
            result.required_with_margin,
            (result.estimated_total as f64 * 1.1).ceil() as u64
        );
        assert!(result.sufficient);
        assert_eq!(result.shortage(), 0);
        assert!(result.ensure_sufficient().is_ok());
        assert_eq!(result.per_database.len(), 3);
    }

    #[test]
    fn test_insufficient_space_reports_shortage() {
        let meta = metadata(&[("a", 100 * MIB), ("b", 200 * MIB), ("c", 50 * MIB)]);
        let result = check_capacity(
            Path::new("/backups"),
            &names(&["a", "b", "c"]),
            &meta,
            &gzip_default(),
            &FixedSpace(100 * MIB),
        )
        .unwrap();

        assert!(!result.sufficient);
        assert_eq!(result.shortage(), result.required_with_margin - 100 * MIB);
        match result.ensure_sufficient() {
            Err(Error::InsufficientSpace {
                required,
                available,
            }) => {
                assert_eq!(required, result.required_with_margin);
                assert_eq!(available, 100 * MIB);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_missing_metadata_skipped_and_counted() {
        let meta = metadata(&[("a", 10 * MIB), ("empty", 0)]);
        let result = check_capacity(
            Path::new("."),
            &names(&["a", "empty", "unknown"]),
            &meta,
            &CapacityConfig::builder().build(),
            &FixedSpace(u64::MAX),
        )
        .unwrap();

        assert_eq!(result.databases_without_metadata, 2);
        assert_eq!(result.per_database.len(), 1);
        assert_eq!(result.estimated_total, result.per_database[0].estimated_final_size);
        assert!(result.estimated_total >= 10 * MIB * 135 / 100);
    }

    #[test]
    fn test_combined_overhead_applied() {
        let meta = metadata(&[("a", 100 * MIB), ("b", 100 * MIB)]);
        let separate = gzip_default();
        let combined = CapacityConfig {
            combined: true,
            ..gzip_default()
        };
        let run = |config: &CapacityConfig| {
            check_capacity(
                Path::new("."),
                &names(&["a", "b"]),
                &meta,
                config,
                &FixedSpace(u64::MAX),
            )
            .unwrap()
        };

        let separate = run(&separate);
        let combined = run(&combined);
        assert_eq!(
            combined.estimated_total,
            (separate.estimated_total as f64 * COMBINED_OVERHEAD).ceil() as u64
        );
    }

    #[test]
    fn test_admission_matches_comparison_at_boundary() {
        let meta = metadata(&[("a", 1000)]);
        let config = CapacityConfig::builder().safety_margin_percent(0.0).build();
        let probe_result = |free| {
            check_capacity(Path::new("."), &names(&["a"]), &meta, &config, &FixedSpace(free))
                .unwrap()
        };

        assert!(probe_result(1350).sufficient);
        assert!(!probe_result(1349).sufficient);
    }

    #[test]
    fn test_fs_probe_reports_space() {
        let tmp = tempfile::tempdir().unwrap();
        let usage = FsFreeSpace.disk_usage(tmp.path()).unwrap();
        assert!(usage.total >= usage.free);
        assert!(FsFreeSpace
            .disk_usage(Path::new("/nonexistent/db-backup/dir"))
            .is_err());
    }
}
