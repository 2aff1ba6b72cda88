// src/sources/mod.rs
//! Source adapters: one per external provider. Each adapter owns its own
//! pagination and field-name variability, normalizes raw records into
//! `UnifiedProcurement`, and surfaces failures as typed `SourceFailure`
//! values that never crash the aggregation.

pub mod comprasnet;
pub mod pncp;
pub mod transparencia;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;

use crate::error::SourceFailure;
use crate::model::{Esfera, Modality, ProcStatus, Uf, UnifiedProcurement};

pub use comprasnet::ComprasnetAdapter;
pub use pncp::PncpAdapter;
pub use transparencia::TransparenciaAdapter;

/// What one adapter is asked to fetch: a single region over a date range.
/// Filter dimensions beyond region/date are applied downstream.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceQuery {
    pub uf: Uf,
    pub start: NaiveDate,
    pub end: NaiveDate,
}

#[async_trait::async_trait]
pub trait SourceAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Fetch raw provider records for the query, following the provider's
    /// own pagination. Identical parameters yield a consistent record set
    /// modulo upstream changes.
    async fn fetch(&self, query: &SourceQuery) -> Result<Vec<Value>, SourceFailure>;

    /// Map one raw record to the unified schema. `None` on malformed or
    /// unrecognized input; the caller logs and drops it, never errors.
    fn normalize(&self, raw: &Value) -> Option<UnifiedProcurement>;

    /// Fetch + normalize, dropping (and counting) malformed records.
    async fn fetch_normalized(
        &self,
        query: &SourceQuery,
    ) -> Result<Vec<UnifiedProcurement>, SourceFailure> {
        let raw = self.fetch(query).await?;
        let total = raw.len();
        let mut out = Vec::with_capacity(total);
        for record in &raw {
            match self.normalize(record) {
                Some(p) => out.push(p),
                None => {
                    tracing::debug!(source = self.name(), "dropped malformed record");
                }
            }
        }
        let dropped = total - out.len();
        if dropped > 0 {
            tracing::warn!(source = self.name(), dropped, total, "records failed normalization");
            metrics::counter!("source_malformed_total", "source" => self.name().to_string())
                .increment(dropped as u64);
        }
        metrics::counter!("source_records_total", "source" => self.name().to_string())
            .increment(out.len() as u64);
        Ok(out)
    }
}

// ---------------------------------------------------------------
// Field-alias lookup
// ---------------------------------------------------------------
// The same concept appears under several keys across providers. Each
// adapter declares an explicit alias table per canonical field; lookups
// walk dotted paths into nested objects.

fn lookup<'a>(raw: &'a Value, path: &str) -> Option<&'a Value> {
    let mut cur = raw;
    for seg in path.split('.') {
        cur = cur.get(seg)?;
    }
    Some(cur)
}

/// First alias that resolves to a non-empty string.
pub fn first_str<'a>(raw: &'a Value, aliases: &[&str]) -> Option<&'a str> {
    for alias in aliases {
        if let Some(s) = lookup(raw, alias).and_then(Value::as_str) {
            let t = s.trim();
            if !t.is_empty() {
                return Some(s);
            }
        }
    }
    None
}

/// First alias that resolves to a number (or a numeric string).
pub fn first_f64(raw: &Value, aliases: &[&str]) -> Option<f64> {
    for alias in aliases {
        match lookup(raw, alias) {
            Some(Value::Number(n)) => return n.as_f64(),
            Some(Value::String(s)) => {
                if let Ok(v) = s.trim().replace(',', ".").parse::<f64>() {
                    return Some(v);
                }
            }
            _ => {}
        }
    }
    None
}

// ---------------------------------------------------------------
// Text + vocabulary normalization
// ---------------------------------------------------------------

/// Normalize free text: entity-decode, strip tags, normalize quotes,
/// collapse whitespace, cap length.
pub fn normalize_text(s: &str) -> String {
    // 1) HTML entity decode
    let mut out = html_escape::decode_html_entities(s).to_string();

    // 2) Strip HTML tags
    static RE_TAGS: once_cell::sync::OnceCell<regex::Regex> = once_cell::sync::OnceCell::new();
    let re_tags = RE_TAGS.get_or_init(|| regex::Regex::new(r"(?is)</?[^>]+>").unwrap());
    out = re_tags.replace_all(&out, "").to_string();

    // 3) Normalize curly quotes to ASCII
    out = out
        .replace(['\u{201C}', '\u{201D}', '\u{00AB}', '\u{00BB}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'");

    // 4) Collapse whitespace
    static RE_WS: once_cell::sync::OnceCell<regex::Regex> = once_cell::sync::OnceCell::new();
    let re_ws = RE_WS.get_or_init(|| regex::Regex::new(r"\s+").unwrap());
    out = re_ws.replace_all(&out, " ").to_string();
    out = out.trim().to_string();

    // 5) Length cap: 2000 chars
    if out.chars().count() > 2000 {
        out = out.chars().take(2000).collect();
    }

    out
}

/// Lower-case and strip Portuguese diacritics, for accent-insensitive
/// matching and comparison.
pub fn fold_accents(s: &str) -> String {
    s.chars()
        .map(|c| match c.to_lowercase().next().unwrap_or(c) {
            'á' | 'à' | 'â' | 'ã' | 'ä' => 'a',
            'é' | 'è' | 'ê' | 'ë' => 'e',
            'í' | 'ì' | 'î' | 'ï' => 'i',
            'ó' | 'ò' | 'ô' | 'õ' | 'ö' => 'o',
            'ú' | 'ù' | 'û' | 'ü' => 'u',
            'ç' => 'c',
            'ñ' => 'n',
            other => other,
        })
        .collect()
}

/// Map a provider's modality label onto the closed enum.
pub fn normalize_modality(label: &str) -> Modality {
    let folded = fold_accents(label);
    if folded.contains("pregao") {
        if folded.contains("presencial") {
            Modality::PregaoPresencial
        } else {
            Modality::PregaoEletronico
        }
    } else if folded.contains("concorrencia") {
        if folded.contains("eletronic") {
            Modality::ConcorrenciaEletronica
        } else {
            Modality::Concorrencia
        }
    } else if folded.contains("dispensa") {
        Modality::Dispensa
    } else if folded.contains("inexigibilidade") {
        Modality::Inexigibilidade
    } else if folded.contains("credenciamento") {
        Modality::Credenciamento
    } else if folded.contains("leilao") {
        Modality::LeilaoEletronico
    } else {
        Modality::Other
    }
}

/// Map a provider's status label onto the closed enum.
pub fn normalize_status(label: &str) -> ProcStatus {
    let folded = fold_accents(label);
    if folded.contains("abert")
        || folded.contains("divulgad")
        || folded.contains("publicad")
        || folded.contains("recebendo")
        || folded.contains("em andamento")
    {
        ProcStatus::Open
    } else if folded.contains("encerrad")
        || folded.contains("homologad")
        || folded.contains("concluid")
        || folded.contains("fechad")
    {
        ProcStatus::Closed
    } else if folded.contains("suspens") {
        ProcStatus::Suspended
    } else if folded.contains("anulad") || folded.contains("revogad") || folded.contains("cancelad")
    {
        ProcStatus::Annulled
    } else {
        ProcStatus::Other
    }
}

/// Map an esfera label or single-letter code onto the closed enum.
pub fn normalize_esfera(label: &str) -> Esfera {
    match fold_accents(label).as_str() {
        "f" | "federal" => Esfera::Federal,
        "e" | "estadual" => Esfera::Estadual,
        "m" | "municipal" => Esfera::Municipal,
        _ => Esfera::Other,
    }
}

/// Parse provider timestamps: ISO-8601 datetime with or without offset,
/// or a bare date (midnight UTC).
pub fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    let t = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(t) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(t, "%Y-%m-%dT%H:%M:%S") {
        return Some(Utc.from_utc_datetime(&naive));
    }
    if let Ok(date) = NaiveDate::parse_from_str(t, "%Y-%m-%d") {
        return Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?));
    }
    None
}
