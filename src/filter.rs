// src/filter.rs
//! Pure multi-criteria filter engine with rejection-reason accounting.
//!
//! Every record is checked against each active criterion in a fixed order;
//! the first failing criterion rejects it and increments that criterion's
//! counter, so callers can explain *why* zero results passed. Deterministic:
//! identical inputs always produce identical output and breakdown.

use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::model::{Esfera, Modality, ProcStatus, SearchRequest, Uf, UnifiedProcurement};
use crate::sources::fold_accents;

/// Terms shorter than this after stopword removal are discarded.
pub const MIN_TERM_LEN: usize = 3;

/// Portuguese stopwords stripped from custom search terms.
const STOPWORDS: &[&str] = &[
    "a", "o", "as", "os", "de", "da", "do", "das", "dos", "e", "em", "no", "na",
    "nos", "nas", "um", "uma", "ao", "aos", "com", "para", "por", "que", "ou",
    "se", "sem", "sobre",
];

/// Which criterion rejected a record. Doubles as the breakdown map key.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Criterion {
    Uf,
    DateRange,
    Status,
    Modality,
    Esfera,
    Municipio,
    ValueRange,
    Keyword,
}

pub type RejectionBreakdown = BTreeMap<Criterion, u64>;

/// Criteria compiled from a `SearchRequest`, with terms already
/// stopword-filtered, length-floored, and accent-folded.
#[derive(Debug, Clone)]
pub struct FilterCriteria {
    ufs: BTreeSet<Uf>,
    start: NaiveDate,
    end: NaiveDate,
    statuses: BTreeSet<ProcStatus>,
    modalities: BTreeSet<Modality>,
    esferas: BTreeSet<Esfera>,
    municipios: BTreeSet<String>,
    min_value: Option<f64>,
    max_value: Option<f64>,
    /// `None` means the keyword criterion is inactive (no terms given).
    keywords: Option<Vec<String>>,
    /// True when all custom terms were eliminated and the sector fallback
    /// set took over.
    pub used_fallback_keywords: bool,
}

impl FilterCriteria {
    pub fn from_request(req: &SearchRequest, sector_keywords: &[String]) -> Self {
        let (keywords, used_fallback) = prepare_terms(&req.terms, sector_keywords);
        Self {
            ufs: req.ufs.iter().copied().collect(),
            start: req.start,
            end: req.end,
            statuses: req.filters.statuses.iter().copied().collect(),
            modalities: req.filters.modalities.iter().copied().collect(),
            esferas: req.filters.esferas.iter().copied().collect(),
            municipios: req
                .filters
                .municipios
                .iter()
                .map(|m| fold_accents(m.trim()))
                .filter(|m| !m.is_empty())
                .collect(),
            min_value: req.filters.min_value,
            max_value: req.filters.max_value,
            keywords,
            used_fallback_keywords: used_fallback,
        }
    }

    /// First criterion the record fails, if any. Order is fixed so the
    /// breakdown stays deterministic.
    fn first_rejection(&self, p: &UnifiedProcurement) -> Option<Criterion> {
        if !self.ufs.is_empty() && !self.ufs.contains(&p.uf) {
            return Some(Criterion::Uf);
        }

        // A record is "in range" when its activity interval intersects the
        // requested window.
        let rec_start = p.published_at.date_naive();
        let rec_end = p
            .deadline_at
            .map(|d| d.date_naive())
            .unwrap_or(rec_start)
            .max(rec_start);
        if rec_end < self.start || rec_start > self.end {
            return Some(Criterion::DateRange);
        }

        if !self.statuses.is_empty() && !self.statuses.contains(&p.status) {
            return Some(Criterion::Status);
        }
        if !self.modalities.is_empty() && !self.modalities.contains(&p.modality) {
            return Some(Criterion::Modality);
        }
        if !self.esferas.is_empty() && !self.esferas.contains(&p.esfera) {
            return Some(Criterion::Esfera);
        }
        if !self.municipios.is_empty() {
            let m = p
                .municipality
                .as_deref()
                .map(fold_accents)
                .unwrap_or_default();
            if !self.municipios.contains(&m) {
                return Some(Criterion::Municipio);
            }
        }

        if self.min_value.is_some() || self.max_value.is_some() {
            // Records without a value are excluded whenever the range is
            // constrained.
            match p.value {
                None => return Some(Criterion::ValueRange),
                Some(v) => {
                    if self.min_value.is_some_and(|min| v < min)
                        || self.max_value.is_some_and(|max| v > max)
                    {
                        return Some(Criterion::ValueRange);
                    }
                }
            }
        }

        if let Some(keywords) = &self.keywords {
            let haystack = fold_accents(&format!("{} {}", p.title, p.description));
            if !keywords.iter().any(|k| haystack.contains(k.as_str())) {
                return Some(Criterion::Keyword);
            }
        }

        None
    }
}

/// Output of a filtering run. `sum(breakdown) == input_len - passed.len()`
/// always holds.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterOutcome {
    pub passed: Vec<UnifiedProcurement>,
    pub breakdown: RejectionBreakdown,
}

/// Pure function: evaluate every record against the criteria.
pub fn apply_filters(
    records: Vec<UnifiedProcurement>,
    criteria: &FilterCriteria,
) -> FilterOutcome {
    let mut passed = Vec::with_capacity(records.len());
    let mut breakdown = RejectionBreakdown::new();

    for record in records {
        match criteria.first_rejection(&record) {
            None => passed.push(record),
            Some(criterion) => {
                *breakdown.entry(criterion).or_insert(0) += 1;
            }
        }
    }

    for (criterion, count) in &breakdown {
        metrics::counter!(
            "filter_rejected_total",
            "criterion" => format!("{criterion:?}").to_lowercase()
        )
        .increment(*count);
    }

    FilterOutcome { passed, breakdown }
}

/// Stopword-filter, length-floor, and fold the custom terms. Returns the
/// effective keyword list (None = criterion inactive) and whether the
/// sector fallback kicked in.
fn prepare_terms(terms: &[String], sector_keywords: &[String]) -> (Option<Vec<String>>, bool) {
    if terms.iter().all(|t| t.trim().is_empty()) {
        return (None, false);
    }

    let mut cleaned: Vec<String> = terms
        .iter()
        .map(|t| fold_accents(t.trim()))
        .filter(|t| !t.is_empty())
        .filter(|t| !STOPWORDS.contains(&t.as_str()))
        .filter(|t| t.chars().count() >= MIN_TERM_LEN)
        .collect();
    cleaned.sort_unstable();
    cleaned.dedup();

    if cleaned.is_empty() {
        let fallback: Vec<String> = sector_keywords
            .iter()
            .map(|k| fold_accents(k.trim()))
            .filter(|k| !k.is_empty())
            .collect();
        if fallback.is_empty() {
            return (None, false);
        }
        return (Some(fallback), true);
    }

    (Some(cleaned), false)
}
