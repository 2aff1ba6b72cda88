// src/sources/pncp.rs
//! PNCP (Portal Nacional de Contratações Públicas) adapter. The
//! authoritative source by default: its control number is the
//! cross-source dedup key when other providers echo it.

use serde_json::Value;

use crate::error::{SourceFailure, SourceFailureKind};
use crate::model::{Esfera, ProcurementId, UnifiedProcurement};
use crate::sources::{
    first_f64, first_str, normalize_esfera, normalize_modality, normalize_status,
    normalize_text, parse_datetime, SourceAdapter, SourceQuery,
};

const PAGE_SIZE: usize = 50;
const MAX_PAGES: usize = 20;

// Canonical field → provider aliases. The API has renamed several fields
// across versions; both spellings stay mapped.
const F_LOCAL_ID: &[&str] = &["numeroControlePNCP", "numeroControlePncp", "numeroCompra"];
const F_TITLE: &[&str] = &["objetoCompra", "objeto"];
const F_DESCRIPTION: &[&str] = &["informacaoComplementar", "objetoCompra", "objeto"];
const F_ORGAN: &[&str] = &["orgaoEntidade.razaoSocial", "nomeOrgao"];
const F_UF: &[&str] = &["unidadeOrgao.ufSigla", "ufSigla", "uf"];
const F_MUNICIPALITY: &[&str] = &["unidadeOrgao.municipioNome", "municipioNome"];
const F_MODALITY: &[&str] = &["modalidadeNome", "modalidade"];
const F_STATUS: &[&str] = &["situacaoCompraNome", "situacaoCompra"];
const F_ESFERA: &[&str] = &["orgaoEntidade.esferaId", "esferaId"];
const F_VALUE: &[&str] = &["valorTotalEstimado", "valorTotal"];
const F_PUBLISHED: &[&str] = &["dataPublicacaoPncp", "dataPublicacao"];
const F_DEADLINE: &[&str] = &["dataEncerramentoProposta", "dataAberturaProposta"];

pub struct PncpAdapter {
    mode: Mode,
}

enum Mode {
    /// Raw JSON body, for tests and offline runs.
    Fixture(String),
    Http {
        base_url: String,
        client: reqwest::Client,
    },
}

impl PncpAdapter {
    pub fn from_fixture(body: &str) -> Self {
        Self {
            mode: Mode::Fixture(body.to_string()),
        }
    }

    pub fn from_url(base_url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            mode: Mode::Http {
                base_url: base_url.into(),
                client,
            },
        }
    }

    fn records_from_body(body: &Value) -> Vec<Value> {
        match body.get("data") {
            Some(Value::Array(items)) => items.clone(),
            _ => match body {
                Value::Array(items) => items.clone(),
                _ => Vec::new(),
            },
        }
    }

    fn failure(&self, kind: SourceFailureKind) -> SourceFailure {
        SourceFailure::new(self.name(), kind)
    }
}

#[async_trait::async_trait]
impl SourceAdapter for PncpAdapter {
    fn name(&self) -> &'static str {
        "pncp"
    }

    async fn fetch(&self, query: &SourceQuery) -> Result<Vec<Value>, SourceFailure> {
        match &self.mode {
            Mode::Fixture(body) => {
                let parsed: Value = serde_json::from_str(body)
                    .map_err(|e| self.failure(SourceFailureKind::Parse).with_detail(e.to_string()))?;
                Ok(Self::records_from_body(&parsed))
            }
            Mode::Http { base_url, client } => {
                let mut out = Vec::new();
                let mut page = 1usize;
                loop {
                    let url = format!(
                        "{base_url}/v1/contratacoes/publicacao?dataInicial={}&dataFinal={}&uf={}&pagina={page}&tamanhoPagina={PAGE_SIZE}",
                        query.start.format("%Y%m%d"),
                        query.end.format("%Y%m%d"),
                        query.uf,
                    );
                    let resp = client.get(&url).send().await.map_err(|e| {
                        self.failure(SourceFailureKind::Network).with_detail(e.to_string())
                    })?;
                    let status = resp.status();
                    if status.as_u16() == 204 {
                        break; // PNCP signals "no more records" with 204
                    }
                    if !status.is_success() {
                        return Err(self.failure(SourceFailureKind::Http(status.as_u16())));
                    }
                    let body: Value = resp.json().await.map_err(|e| {
                        self.failure(SourceFailureKind::Parse).with_detail(e.to_string())
                    })?;
                    let records = Self::records_from_body(&body);
                    let got = records.len();
                    out.extend(records);

                    let total_pages = body
                        .get("totalPaginas")
                        .and_then(Value::as_u64)
                        .unwrap_or(0) as usize;
                    page += 1;
                    if got < PAGE_SIZE || page > total_pages || page > MAX_PAGES {
                        break;
                    }
                }
                Ok(out)
            }
        }
    }

    fn normalize(&self, raw: &Value) -> Option<UnifiedProcurement> {
        let local_id = first_str(raw, F_LOCAL_ID)?;
        let title = normalize_text(first_str(raw, F_TITLE)?);
        if title.is_empty() {
            return None;
        }
        let uf = first_str(raw, F_UF)?.parse().ok()?;
        let published_at = parse_datetime(first_str(raw, F_PUBLISHED)?)?;

        let control = first_str(raw, &["numeroControlePNCP", "numeroControlePncp"]);

        Some(UnifiedProcurement {
            id: ProcurementId::new(self.name(), local_id),
            title,
            description: first_str(raw, F_DESCRIPTION)
                .map(normalize_text)
                .unwrap_or_default(),
            organ: first_str(raw, F_ORGAN).map(normalize_text).unwrap_or_default(),
            uf,
            municipality: first_str(raw, F_MUNICIPALITY).map(|s| s.trim().to_string()),
            modality: first_str(raw, F_MODALITY)
                .map(normalize_modality)
                .unwrap_or(crate::model::Modality::Other),
            status: first_str(raw, F_STATUS)
                .map(normalize_status)
                .unwrap_or(crate::model::ProcStatus::Other),
            esfera: first_str(raw, F_ESFERA)
                .map(normalize_esfera)
                .unwrap_or(Esfera::Other),
            published_at,
            deadline_at: first_str(raw, F_DEADLINE).and_then(parse_datetime),
            value: first_f64(raw, F_VALUE),
            source: self.name().to_string(),
            control_number: control.map(|s| s.trim().to_string()),
        })
    }
}
