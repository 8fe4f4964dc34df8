//! Stage drivers and the full-pipeline entry point.
//!
//! Each `*_stage` function is independently callable by an external
//! orchestrator: it takes the configured code version and its upstream
//! outputs, consults the [`PipelineCache`], and returns a [`StageReport`] plus
//! the typed value the next stage needs. A fatal problem is
//! `Err(PipelineError)`; per-subject problems land in
//! [`StageReport::failures`] and never fail the stage.
//!
//! A stage-level cache entry is stored only when the stage had no per-item
//! failures, so a rerun always retries failed subjects.

use crate::cache::{
    digest_file, fingerprint_outputs, output_ref, write_atomic, CacheKey, Fingerprinter,
    PipelineCache,
};
use crate::completion::resolve_backend;
use crate::config::PipelineConfig;
use crate::error::{PipelineError, SubjectError};
use crate::output::{OutputRef, PipelineReport, StageName, StageReport};
use crate::pdf::{bind_pdfium, validate_pdf_path};
use crate::pipeline::normalize::normalize_records;
use crate::pipeline::outline::{read_outline, DocumentOutline};
use crate::pipeline::segment::{materialize, plan_segments, SegmentManifest, MANIFEST_FILE};
use crate::pipeline::structure::{ExtractionOptions, StructuredExtractor};
use crate::pipeline::text::{build_transcript, PdfiumTextLayer, Transcript};
use crate::record::BiographyRecord;
use futures::stream::{self, StreamExt};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Cache stage name for per-subject structured-extraction entries.
pub const SUBJECT_CACHE_STAGE: &str = "extract_structure.subject";

/// Counter present in every stage's counts: work items attempted.
const ITEMS: &str = "items";
/// Counter present in every stage's counts: work items that produced output.
const SUCCEEDED: &str = "succeeded";

/// Segmentation result.
#[derive(Debug, Clone)]
pub struct Segmented {
    pub report: StageReport,
    pub manifest: SegmentManifest,
}

/// Text-extraction result.
#[derive(Debug, Clone)]
pub struct Transcribed {
    pub report: StageReport,
    pub transcripts: Vec<Transcript>,
}

/// Structured-extraction result. Records are sorted by subject key.
#[derive(Debug, Clone)]
pub struct Structured {
    pub report: StageReport,
    pub records: Vec<(String, BiographyRecord)>,
}

/// Run all four stages in order.
///
/// # Errors
/// Returns `Err(PipelineError)` for fatal errors only:
/// - source PDF missing, unreadable or not a PDF
/// - empty outline or duplicate subject keys
/// - no completion provider configured when a subject needs a call
///
/// Subjects that fail extraction are listed in the structure stage's report;
/// normalisation still runs, so a run where every subject failed writes
/// header-only tables and reports `0/N`.
pub async fn run_pipeline(
    pdf: impl AsRef<Path>,
    config: &PipelineConfig,
) -> Result<PipelineReport, PipelineError> {
    let total_start = Instant::now();
    let pdf = pdf.as_ref();
    info!("Starting pipeline: {}", pdf.display());
    debug!("Config: {:?}", config);

    let cache = PipelineCache::open(config.effective_cache_dir());

    let segmented = segment_stage(pdf, config, &cache).await?;
    info!("{}", segmented.report.summary());

    let transcribed =
        extract_text_stage(&segmented.manifest, &segmented.report.outputs, config, &cache).await?;
    info!("{}", transcribed.report.summary());

    let (structured, normalized) = structure_and_normalize(
        &transcribed.transcripts,
        &transcribed.report.outputs,
        config,
        &cache,
    )
    .await?;

    let total_duration_ms = total_start.elapsed().as_millis() as u64;
    info!("Pipeline complete in {}ms", total_duration_ms);

    Ok(PipelineReport {
        stages: vec![
            segmented.report,
            transcribed.report,
            structured,
            normalized,
        ],
        total_duration_ms,
    })
}

/// Stages 3 and 4. Normalisation runs even when no subject produced a record.
async fn structure_and_normalize(
    transcripts: &[Transcript],
    text_outputs: &[OutputRef],
    config: &PipelineConfig,
    cache: &PipelineCache,
) -> Result<(StageReport, StageReport), PipelineError> {
    let structured = extract_structure_stage(transcripts, text_outputs, config, cache).await?;
    info!("{}", structured.report.summary());

    if structured.records.is_empty() && !structured.report.failures.is_empty() {
        warn!(
            "All {} subjects failed structured extraction; tables will be empty",
            structured.report.total_items
        );
    }

    let normalized =
        normalize_stage(&structured.records, &structured.report.outputs, config, cache).await?;
    info!("{}", normalized.summary());

    Ok((structured.report, normalized))
}

/// Read a PDF's page count and bookmark tree without running any stage.
pub async fn inspect_outline(pdf: impl AsRef<Path>) -> Result<DocumentOutline, PipelineError> {
    let path = pdf.as_ref().to_path_buf();
    validate_pdf_path(&path)?;
    tokio::task::spawn_blocking(move || read_outline(&path))
        .await
        .map_err(|e| PipelineError::Internal(format!("Outline task panicked: {}", e)))?
}

// ── Stage 1: segment ─────────────────────────────────────────────────────────

pub async fn segment_stage(
    pdf: &Path,
    config: &PipelineConfig,
    cache: &PipelineCache,
) -> Result<Segmented, PipelineError> {
    let start = Instant::now();
    validate_pdf_path(pdf)?;

    let source_digest = digest_file(pdf)
        .await
        .map_err(|e| PipelineError::UpstreamUnreadable {
            path: pdf.to_path_buf(),
            detail: e.to_string(),
        })?;
    let mut fp = Fingerprinter::new(StageName::Segment.as_str());
    fp.part("source", source_digest.as_bytes())
        .part("start_page", config.start_page.to_string().as_bytes());
    let key = CacheKey::new(
        StageName::Segment.as_str(),
        &config.versions.segment,
        fp.finish(),
    );

    let _guard = cache.lock(&key).await;
    if let Some(entry) = cache.lookup(&key).await {
        let loaded = match entry.outputs.iter().find(|o| o.name == MANIFEST_FILE) {
            Some(manifest_ref) => SegmentManifest::load(&manifest_ref.path),
            None => Err(PipelineError::Internal("entry has no manifest".to_string())),
        };
        match loaded {
            Ok(manifest) => {
                notify_cached(config, StageName::Segment);
                return Ok(Segmented {
                    report: cached_report(
                        StageName::Segment,
                        &key,
                        entry.outputs,
                        entry.counts,
                        start,
                    ),
                    manifest,
                });
            }
            Err(e) => warn!("segment cache entry unusable, recomputing: {}", e),
        }
    }

    if let Some(ref cb) = config.progress_callback {
        cb.on_stage_start(StageName::Segment, 1);
    }

    let source = pdf.to_path_buf();
    let split_dir = config.split_dir();
    let start_page = config.start_page;
    let (manifest, outputs) = tokio::task::spawn_blocking(move || {
        let outline = read_outline(&source)?;
        let segments = plan_segments(&outline.entries, outline.total_pages, start_page)?;
        if segments.is_empty() {
            return Err(PipelineError::EmptyOutline {
                path: source.clone(),
                start_page,
            });
        }
        materialize(&source, outline.total_pages, start_page, segments, &split_dir)
    })
    .await
    .map_err(|e| PipelineError::Internal(format!("Segment task panicked: {}", e)))??;

    let pages: usize = manifest.segments.iter().map(|s| s.page_count()).sum();
    let counts = BTreeMap::from([
        (ITEMS.to_string(), manifest.segments.len()),
        (SUCCEEDED.to_string(), manifest.segments.len()),
        ("pages".to_string(), pages),
        ("source_pages".to_string(), manifest.total_pages),
    ]);
    cache.store(&key, outputs.clone(), counts.clone()).await?;

    if let Some(ref cb) = config.progress_callback {
        cb.on_stage_complete(StageName::Segment, 1, 1);
    }

    Ok(Segmented {
        report: fresh_report(StageName::Segment, &key, outputs, counts, Vec::new(), start),
        manifest,
    })
}

// ── Stage 2: extract_text ────────────────────────────────────────────────────

pub async fn extract_text_stage(
    manifest: &SegmentManifest,
    segment_outputs: &[OutputRef],
    config: &PipelineConfig,
    cache: &PipelineCache,
) -> Result<Transcribed, PipelineError> {
    let start = Instant::now();
    let key = CacheKey::new(
        StageName::ExtractText.as_str(),
        &config.versions.extract_text,
        fingerprint_outputs(StageName::ExtractText.as_str(), segment_outputs),
    );

    let _guard = cache.lock(&key).await;
    if let Some(entry) = cache.lookup(&key).await {
        match load_transcripts(&entry.outputs).await {
            Ok(transcripts) => {
                notify_cached(config, StageName::ExtractText);
                return Ok(Transcribed {
                    report: cached_report(
                        StageName::ExtractText,
                        &key,
                        entry.outputs,
                        entry.counts,
                        start,
                    ),
                    transcripts,
                });
            }
            Err(e) => warn!("extract_text cache entry unusable, recomputing: {}", e),
        }
    }

    let total = manifest.segments.len();
    if let Some(ref cb) = config.progress_callback {
        cb.on_stage_start(StageName::ExtractText, total);
    }

    let segments = manifest.segments.clone();
    let extracted = tokio::task::spawn_blocking(move || {
        let pdfium = bind_pdfium()?;
        let layer = PdfiumTextLayer::new(&pdfium);
        Ok::<_, PipelineError>(
            segments
                .iter()
                .map(|seg| build_transcript(&layer, seg))
                .collect::<Vec<_>>(),
        )
    })
    .await
    .map_err(|e| PipelineError::Internal(format!("Text task panicked: {}", e)))??;

    let text_dir = config.text_dir();
    let mut outputs = Vec::with_capacity(extracted.len());
    let mut transcripts = Vec::with_capacity(extracted.len());
    let mut pages = 0;
    let mut empty_pages = 0;
    for (transcript, empty) in extracted {
        let path = text_dir.join(format!("{}.txt", transcript.key));
        let text = transcript.to_text();
        write_atomic(&path, text.as_bytes()).await?;
        outputs.push(output_ref(transcript.key.clone(), &path, text.as_bytes()));
        pages += transcript.pages.len();
        empty_pages += empty;
        transcripts.push(transcript);
    }
    if empty_pages > 0 {
        warn!("{} pages had no readable text", empty_pages);
    }

    let counts = BTreeMap::from([
        (ITEMS.to_string(), total),
        (SUCCEEDED.to_string(), transcripts.len()),
        ("pages".to_string(), pages),
        ("empty_pages".to_string(), empty_pages),
    ]);
    cache.store(&key, outputs.clone(), counts.clone()).await?;

    if let Some(ref cb) = config.progress_callback {
        cb.on_stage_complete(StageName::ExtractText, transcripts.len(), total);
    }

    Ok(Transcribed {
        report: fresh_report(StageName::ExtractText, &key, outputs, counts, Vec::new(), start),
        transcripts,
    })
}

// ── Stage 3: extract_structure ───────────────────────────────────────────────

/// What happened to one subject.
enum SubjectOutcome {
    Done {
        key: String,
        record: BiographyRecord,
        output: OutputRef,
        cached: bool,
        attempts: u32,
        repaired: bool,
        tokens: usize,
    },
    Failed(SubjectError),
}

/// Per-subject cache key: the subject plus its exact transcript text.
pub fn subject_cache_key(version: &str, transcript: &Transcript) -> CacheKey {
    let mut fp = Fingerprinter::new(SUBJECT_CACHE_STAGE);
    fp.part("subject", transcript.key.as_bytes())
        .part("transcript", transcript.to_text().as_bytes());
    CacheKey::new(SUBJECT_CACHE_STAGE, version, fp.finish())
}

pub async fn extract_structure_stage(
    transcripts: &[Transcript],
    text_outputs: &[OutputRef],
    config: &PipelineConfig,
    cache: &PipelineCache,
) -> Result<Structured, PipelineError> {
    let start = Instant::now();
    let version = config.versions.extract_structure.as_str();
    let key = CacheKey::new(
        StageName::ExtractStructure.as_str(),
        version,
        fingerprint_outputs(StageName::ExtractStructure.as_str(), text_outputs),
    );

    let _guard = cache.lock(&key).await;
    if let Some(entry) = cache.lookup(&key).await {
        match load_records(&entry.outputs).await {
            Ok(records) => {
                notify_cached(config, StageName::ExtractStructure);
                return Ok(Structured {
                    report: cached_report(
                        StageName::ExtractStructure,
                        &key,
                        entry.outputs,
                        entry.counts,
                        start,
                    ),
                    records,
                });
            }
            Err(e) => warn!("extract_structure cache entry unusable, recomputing: {}", e),
        }
    }

    let total = transcripts.len();
    if let Some(ref cb) = config.progress_callback {
        cb.on_stage_start(StageName::ExtractStructure, total);
    }

    // Pass 1: subjects whose transcript is unchanged since a previous run.
    let mut outcomes: Vec<SubjectOutcome> = Vec::with_capacity(total);
    let mut misses: Vec<&Transcript> = Vec::new();
    for transcript in transcripts {
        let subject_key = subject_cache_key(version, transcript);
        match cached_subject(cache, &subject_key).await {
            Some((record, output)) => {
                if let Some(ref cb) = config.progress_callback {
                    cb.on_subject_complete(&transcript.key, true);
                }
                outcomes.push(SubjectOutcome::Done {
                    key: transcript.key.clone(),
                    record,
                    output,
                    cached: true,
                    attempts: 0,
                    repaired: false,
                    tokens: 0,
                });
            }
            None => misses.push(transcript),
        }
    }
    debug!(
        "{} of {} subjects served from cache, {} need a completion",
        outcomes.len(),
        total,
        misses.len()
    );

    // Pass 2: everything else, through the bounded worker pool.
    if !misses.is_empty() {
        let backend = resolve_backend(config)?;
        info!("Using completion backend {}", backend.name());
        let extractor = StructuredExtractor::new(backend, ExtractionOptions::from_config(config));
        let records_dir = config.records_dir();

        let fresh: Vec<SubjectOutcome> = stream::iter(misses.into_iter().map(|transcript| {
            let extractor = extractor.clone();
            let records_dir = records_dir.clone();
            async move {
                extract_subject(&extractor, cache, transcript, version, &records_dir, config).await
            }
        }))
        .buffer_unordered(config.concurrency.max(1))
        .collect()
        .await;
        outcomes.extend(fresh);
    }

    let mut records = Vec::new();
    let mut outputs = Vec::new();
    let mut failures = Vec::new();
    let mut cache_hits = 0;
    let mut attempts_total = 0usize;
    let mut repaired_total = 0;
    let mut tokens_total = 0;
    for outcome in outcomes {
        match outcome {
            SubjectOutcome::Done {
                key,
                record,
                output,
                cached,
                attempts,
                repaired,
                tokens,
            } => {
                if cached {
                    cache_hits += 1;
                }
                attempts_total += attempts as usize;
                repaired_total += usize::from(repaired);
                tokens_total += tokens;
                records.push((key, record));
                outputs.push(output);
            }
            SubjectOutcome::Failed(e) => failures.push(e),
        }
    }
    records.sort_by(|a, b| a.0.cmp(&b.0));
    failures.sort_by(|a, b| a.subject().cmp(b.subject()));

    for f in &failures {
        warn!("{}", f);
    }

    let counts = BTreeMap::from([
        (ITEMS.to_string(), total),
        (SUCCEEDED.to_string(), records.len()),
        ("failed".to_string(), failures.len()),
        ("cache_hits".to_string(), cache_hits),
        ("attempts".to_string(), attempts_total),
        ("repaired".to_string(), repaired_total),
        ("tokens".to_string(), tokens_total),
    ]);
    if failures.is_empty() {
        cache.store(&key, outputs.clone(), counts.clone()).await?;
    } else {
        info!(
            "{} subjects failed; stage result not cached so they are retried next run",
            failures.len()
        );
    }

    if let Some(ref cb) = config.progress_callback {
        cb.on_stage_complete(StageName::ExtractStructure, records.len(), total);
    }

    Ok(Structured {
        report: fresh_report(StageName::ExtractStructure, &key, outputs, counts, failures, start),
        records,
    })
}

async fn cached_subject(cache: &PipelineCache, key: &CacheKey) -> Option<(BiographyRecord, OutputRef)> {
    let entry = cache.lookup(key).await?;
    let output = entry.outputs.into_iter().next()?;
    match load_record(&output.path).await {
        Ok(record) => Some((record, output)),
        Err(e) => {
            warn!("cached record unusable, recomputing: {}", e);
            None
        }
    }
}

async fn extract_subject(
    extractor: &StructuredExtractor,
    cache: &PipelineCache,
    transcript: &Transcript,
    version: &str,
    records_dir: &Path,
    config: &PipelineConfig,
) -> SubjectOutcome {
    let subject = transcript.key.as_str();
    let subject_key = subject_cache_key(version, transcript);
    let _guard = cache.lock(&subject_key).await;

    // Another run may have finished this subject while we waited for the lock.
    if let Some((record, output)) = cached_subject(cache, &subject_key).await {
        if let Some(ref cb) = config.progress_callback {
            cb.on_subject_complete(subject, true);
        }
        return SubjectOutcome::Done {
            key: subject.to_string(),
            record,
            output,
            cached: true,
            attempts: 0,
            repaired: false,
            tokens: 0,
        };
    }

    if let Some(ref cb) = config.progress_callback {
        cb.on_subject_start(subject);
    }

    let result = match extractor.extract(transcript).await {
        Ok(extraction) => persist_record(records_dir, subject, &extraction.record)
            .await
            .map(|output| (extraction, output)),
        Err(e) => Err(e),
    };

    match result {
        Ok((extraction, output)) => {
            let counts = BTreeMap::from([("attempts".to_string(), extraction.attempts as usize)]);
            if let Err(e) = cache.store(&subject_key, vec![output.clone()], counts).await {
                warn!("{}: record written but not cached: {}", subject, e);
            }
            if let Some(ref cb) = config.progress_callback {
                cb.on_subject_complete(subject, false);
            }
            SubjectOutcome::Done {
                key: subject.to_string(),
                record: extraction.record,
                output,
                cached: false,
                attempts: extraction.attempts,
                repaired: extraction.repaired,
                tokens: extraction.input_tokens + extraction.output_tokens,
            }
        }
        Err(e) => {
            if let Some(ref cb) = config.progress_callback {
                cb.on_subject_error(subject, &e.to_string());
            }
            SubjectOutcome::Failed(e)
        }
    }
}

async fn persist_record(
    records_dir: &Path,
    subject: &str,
    record: &BiographyRecord,
) -> Result<OutputRef, SubjectError> {
    let write_err = |detail: String| SubjectError::RecordWriteFailed {
        subject: subject.to_string(),
        detail,
    };
    let path = records_dir.join(format!("{subject}.json"));
    let json = serde_json::to_vec_pretty(record).map_err(|e| write_err(e.to_string()))?;
    write_atomic(&path, &json)
        .await
        .map_err(|e| write_err(e.to_string()))?;
    Ok(output_ref(subject, &path, &json))
}

async fn load_record(path: &Path) -> Result<BiographyRecord, PipelineError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| PipelineError::UpstreamUnreadable {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;
    serde_json::from_slice(&bytes).map_err(|e| PipelineError::UpstreamUnreadable {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })
}

// ── Stage 4: normalize ───────────────────────────────────────────────────────

pub async fn normalize_stage(
    records: &[(String, BiographyRecord)],
    record_outputs: &[OutputRef],
    config: &PipelineConfig,
    cache: &PipelineCache,
) -> Result<StageReport, PipelineError> {
    let start = Instant::now();
    let key = CacheKey::new(
        StageName::Normalize.as_str(),
        &config.versions.normalize,
        fingerprint_outputs(StageName::Normalize.as_str(), record_outputs),
    );

    let _guard = cache.lock(&key).await;
    if let Some(entry) = cache.lookup(&key).await {
        notify_cached(config, StageName::Normalize);
        return Ok(cached_report(StageName::Normalize, &key, entry.outputs, entry.counts, start));
    }

    if let Some(ref cb) = config.progress_callback {
        cb.on_stage_start(StageName::Normalize, records.len());
    }

    let tables = normalize_records(records);
    let outputs = tables.write_csv(&config.tables_dir()).await?;

    let mut counts = tables.counts();
    counts.insert(ITEMS.to_string(), records.len());
    counts.insert(SUCCEEDED.to_string(), tables.personal.len());
    cache.store(&key, outputs.clone(), counts.clone()).await?;

    if let Some(ref cb) = config.progress_callback {
        cb.on_stage_complete(StageName::Normalize, tables.personal.len(), records.len());
    }

    Ok(fresh_report(StageName::Normalize, &key, outputs, counts, Vec::new(), start))
}

// ── Helpers ──────────────────────────────────────────────────────────────────

async fn load_transcripts(outputs: &[OutputRef]) -> Result<Vec<Transcript>, PipelineError> {
    let mut transcripts = Vec::with_capacity(outputs.len());
    for out in outputs {
        let text = read_upstream(&out.path).await?;
        transcripts.push(Transcript::from_text(out.name.clone(), &text));
    }
    Ok(transcripts)
}

async fn load_records(
    outputs: &[OutputRef],
) -> Result<Vec<(String, BiographyRecord)>, PipelineError> {
    let mut records = Vec::with_capacity(outputs.len());
    for out in outputs {
        records.push((out.name.clone(), load_record(&out.path).await?));
    }
    Ok(records)
}

async fn read_upstream(path: &Path) -> Result<String, PipelineError> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|e| PipelineError::UpstreamUnreadable {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })
}

fn notify_cached(config: &PipelineConfig, stage: StageName) {
    info!("{}: unchanged since last run, using cached outputs", stage);
    if let Some(ref cb) = config.progress_callback {
        cb.on_stage_cached(stage);
    }
}

fn cached_report(
    stage: StageName,
    key: &CacheKey,
    outputs: Vec<OutputRef>,
    counts: BTreeMap<String, usize>,
    start: Instant,
) -> StageReport {
    let mut report = fresh_report(stage, key, outputs, counts, Vec::new(), start);
    report.cached = true;
    report
}

fn fresh_report(
    stage: StageName,
    key: &CacheKey,
    mut outputs: Vec<OutputRef>,
    counts: BTreeMap<String, usize>,
    failures: Vec<SubjectError>,
    start: Instant,
) -> StageReport {
    outputs.sort_by(|a, b| a.name.cmp(&b.name));
    StageReport {
        stage,
        code_version: key.code_version.clone(),
        fingerprint: key.fingerprint.clone(),
        cached: false,
        outputs,
        total_items: counts.get(ITEMS).copied().unwrap_or(0),
        succeeded: counts.get(SUCCEEDED).copied().unwrap_or(0),
        counts,
        failures,
        duration_ms: start.elapsed().as_millis() as u64,
    }
}
