// src/model.rs
//! Unified data model: the normalized procurement record, search requests,
//! and the canonical search fingerprint used as the cache key.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Bump when the canonical serialization changes, so stale cache entries
/// from older processes never collide with new ones.
pub const FINGERPRINT_VERSION: &str = "v2";

/// Brazilian state code. Closed set of 27 values.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[allow(clippy::upper_case_acronyms)]
pub enum Uf {
    AC, AL, AP, AM, BA, CE, DF, ES, GO, MA, MT, MS, MG, PA, PB, PR, PE, PI,
    RJ, RN, RS, RO, RR, SC, SP, SE, TO,
}

impl Uf {
    pub fn as_str(&self) -> &'static str {
        match self {
            Uf::AC => "AC", Uf::AL => "AL", Uf::AP => "AP", Uf::AM => "AM",
            Uf::BA => "BA", Uf::CE => "CE", Uf::DF => "DF", Uf::ES => "ES",
            Uf::GO => "GO", Uf::MA => "MA", Uf::MT => "MT", Uf::MS => "MS",
            Uf::MG => "MG", Uf::PA => "PA", Uf::PB => "PB", Uf::PR => "PR",
            Uf::PE => "PE", Uf::PI => "PI", Uf::RJ => "RJ", Uf::RN => "RN",
            Uf::RS => "RS", Uf::RO => "RO", Uf::RR => "RR", Uf::SC => "SC",
            Uf::SP => "SP", Uf::SE => "SE", Uf::TO => "TO",
        }
    }
}

impl std::str::FromStr for Uf {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let up = s.trim().to_ascii_uppercase();
        let uf = match up.as_str() {
            "AC" => Uf::AC, "AL" => Uf::AL, "AP" => Uf::AP, "AM" => Uf::AM,
            "BA" => Uf::BA, "CE" => Uf::CE, "DF" => Uf::DF, "ES" => Uf::ES,
            "GO" => Uf::GO, "MA" => Uf::MA, "MT" => Uf::MT, "MS" => Uf::MS,
            "MG" => Uf::MG, "PA" => Uf::PA, "PB" => Uf::PB, "PR" => Uf::PR,
            "PE" => Uf::PE, "PI" => Uf::PI, "RJ" => Uf::RJ, "RN" => Uf::RN,
            "RS" => Uf::RS, "RO" => Uf::RO, "RR" => Uf::RR, "SC" => Uf::SC,
            "SP" => Uf::SP, "SE" => Uf::SE, "TO" => Uf::TO,
            _ => return Err(()),
        };
        Ok(uf)
    }
}

impl std::fmt::Display for Uf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Legal procurement mechanism, normalized across source vocabularies.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Modality {
    PregaoEletronico,
    PregaoPresencial,
    Concorrencia,
    ConcorrenciaEletronica,
    Dispensa,
    Inexigibilidade,
    Credenciamento,
    LeilaoEletronico,
    Other,
}

/// Lifecycle status of a tender, normalized across source vocabularies.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ProcStatus {
    Open,
    Closed,
    Suspended,
    Annulled,
    Other,
}

/// Administrative sphere of the purchasing organ.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Esfera {
    Federal,
    Estadual,
    Municipal,
    Other,
}

/// Composite identifier: `{source}:{source_local_id}`. Unique post-dedup.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProcurementId(pub String);

impl ProcurementId {
    pub fn new(source: &str, local_id: &str) -> Self {
        Self(format!("{source}:{local_id}"))
    }
}

impl std::fmt::Display for ProcurementId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One procurement opportunity after source normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedProcurement {
    pub id: ProcurementId,
    pub title: String,
    pub description: String,
    pub organ: String,
    pub uf: Uf,
    pub municipality: Option<String>,
    pub modality: Modality,
    pub status: ProcStatus,
    pub esfera: Esfera,
    pub published_at: DateTime<Utc>,
    pub deadline_at: Option<DateTime<Utc>>,
    pub value: Option<f64>,
    pub source: String,
    /// Cross-source control number (e.g. PNCP contratação id) when the
    /// provider exposes one; drives exact dedup.
    pub control_number: Option<String>,
}

/// Optional multi-dimensional filters of a search. Empty sets mean "no
/// constraint on this dimension".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchFilters {
    #[serde(default)]
    pub statuses: Vec<ProcStatus>,
    #[serde(default)]
    pub modalities: Vec<Modality>,
    #[serde(default)]
    pub esferas: Vec<Esfera>,
    #[serde(default)]
    pub municipios: Vec<String>,
    #[serde(default)]
    pub min_value: Option<f64>,
    #[serde(default)]
    pub max_value: Option<f64>,
}

impl SearchFilters {
    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty()
            && self.modalities.is_empty()
            && self.esferas.is_empty()
            && self.municipios.is_empty()
            && self.min_value.is_none()
            && self.max_value.is_none()
    }
}

/// A search as submitted by the caller. Validated before any work starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub ufs: Vec<Uf>,
    pub start: NaiveDate,
    pub end: NaiveDate,
    /// Free-text terms; stopword-filtered and length-floored by the filter
    /// engine. Empty means "use the configured sector keyword set".
    #[serde(default)]
    pub terms: Vec<String>,
    #[serde(default)]
    pub filters: SearchFilters,
}

impl SearchRequest {
    /// Canonical serialization: sorted dedup'd UFs, ISO dates, sorted filter
    /// sets, sorted lower-cased terms. Semantically equal requests yield the
    /// same string regardless of input ordering.
    pub fn canonical_string(&self) -> String {
        let mut ufs: Vec<&str> = self.ufs.iter().map(Uf::as_str).collect();
        ufs.sort_unstable();
        ufs.dedup();

        let mut terms: Vec<String> = self
            .terms
            .iter()
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect();
        terms.sort_unstable();
        terms.dedup();

        let mut statuses: Vec<String> =
            self.filters.statuses.iter().map(|s| format!("{s:?}")).collect();
        statuses.sort_unstable();
        statuses.dedup();
        let mut modalities: Vec<String> =
            self.filters.modalities.iter().map(|m| format!("{m:?}")).collect();
        modalities.sort_unstable();
        modalities.dedup();
        let mut esferas: Vec<String> =
            self.filters.esferas.iter().map(|e| format!("{e:?}")).collect();
        esferas.sort_unstable();
        esferas.dedup();
        let mut municipios: Vec<String> = self
            .filters
            .municipios
            .iter()
            .map(|m| m.trim().to_lowercase())
            .filter(|m| !m.is_empty())
            .collect();
        municipios.sort_unstable();
        municipios.dedup();

        format!(
            "{}|ufs={}|start={}|end={}|terms={}|st={}|mod={}|esf={}|mun={}|vmin={}|vmax={}",
            FINGERPRINT_VERSION,
            ufs.join(","),
            self.start.format("%Y-%m-%d"),
            self.end.format("%Y-%m-%d"),
            terms.join(","),
            statuses.join(","),
            modalities.join(","),
            esferas.join(","),
            municipios.join(","),
            self.filters
                .min_value
                .map(|v| format!("{v:.2}"))
                .unwrap_or_default(),
            self.filters
                .max_value
                .map(|v| format!("{v:.2}"))
                .unwrap_or_default(),
        )
    }

    /// Deterministic cache key: SHA-256 of the canonical string, first 16
    /// bytes rendered as hex.
    pub fn fingerprint(&self) -> SearchFingerprint {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(self.canonical_string().as_bytes());
        let digest = hasher.finalize();
        let mut out = String::with_capacity(32);
        for b in digest.iter().take(16) {
            use std::fmt::Write as _;
            let _ = write!(&mut out, "{:02x}", b);
        }
        SearchFingerprint(out)
    }
}

/// Fixed-width hex key identifying a canonicalized search request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SearchFingerprint(pub String);

impl std::fmt::Display for SearchFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-region/source progress status. Causal per (uf, source):
/// pending → fetching → done|error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Pending,
    Fetching,
    Done,
    Error,
}

/// Ephemeral progress event published while a search runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub search_id: String,
    pub uf: Uf,
    pub source: String,
    pub status: ProgressStatus,
    /// Records found so far for this (uf, source); 0 until fetch completes.
    pub found: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(ufs: Vec<Uf>, terms: Vec<&str>) -> SearchRequest {
        SearchRequest {
            ufs,
            start: NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
            end: NaiveDate::from_ymd_opt(2026, 1, 7).unwrap(),
            terms: terms.into_iter().map(String::from).collect(),
            filters: SearchFilters::default(),
        }
    }

    #[test]
    fn fingerprint_ignores_uf_and_term_order() {
        let a = req(vec![Uf::SP, Uf::RJ, Uf::MG], vec!["Obra", "reforma"]);
        let b = req(vec![Uf::MG, Uf::SP, Uf::RJ], vec!["reforma", "obra"]);
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn fingerprint_ignores_duplicate_ufs() {
        let a = req(vec![Uf::SP, Uf::SP], vec![]);
        let b = req(vec![Uf::SP], vec![]);
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn fingerprint_changes_with_date_range() {
        let a = req(vec![Uf::SP], vec![]);
        let mut b = a.clone();
        b.end = NaiveDate::from_ymd_opt(2026, 1, 8).unwrap();
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn fingerprint_ignores_filter_set_order() {
        let mut a = req(vec![Uf::SP], vec![]);
        a.filters.statuses = vec![ProcStatus::Open, ProcStatus::Suspended];
        let mut b = req(vec![Uf::SP], vec![]);
        b.filters.statuses = vec![ProcStatus::Suspended, ProcStatus::Open];
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn fingerprint_is_fixed_width_hex() {
        let fp = req(vec![Uf::BA], vec![]).fingerprint();
        assert_eq!(fp.0.len(), 32);
        assert!(fp.0.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn uf_parses_case_insensitively() {
        assert_eq!("sp".parse::<Uf>(), Ok(Uf::SP));
        assert_eq!(" RJ ".parse::<Uf>(), Ok(Uf::RJ));
        assert!("XX".parse::<Uf>().is_err());
    }
}
