// src/sources/transparencia.rs
//! Portal da Transparência adapter (federal executive spending portal).

use serde_json::Value;

use crate::error::{SourceFailure, SourceFailureKind};
use crate::model::{Esfera, Modality, ProcStatus, ProcurementId, UnifiedProcurement};
use crate::sources::{
    first_f64, first_str, normalize_modality, normalize_status, normalize_text,
    parse_datetime, SourceAdapter, SourceQuery,
};

const MAX_PAGES: usize = 10;
const PAGE_SIZE: usize = 50;

const F_LOCAL_ID: &[&str] = &["id", "licitacao.numero", "numeroProcesso"];
const F_TITLE: &[&str] = &["licitacao.objeto", "objeto"];
const F_ORGAN: &[&str] = &["unidadeGestora.orgaoVinculado.nome", "unidadeGestora.nome", "orgao"];
const F_UF: &[&str] = &["municipio.uf.sigla", "uf"];
const F_MUNICIPALITY: &[&str] = &["municipio.nomeIBGE", "municipio.nome"];
const F_MODALITY: &[&str] = &["modalidadeLicitacao.descricao", "modalidade"];
const F_STATUS: &[&str] = &["situacaoCompra.descricao", "situacao"];
const F_VALUE: &[&str] = &["valor", "valorLicitacao"];
const F_PUBLISHED: &[&str] = &["dataPublicacao", "dataAbertura"];
const F_DEADLINE: &[&str] = &["dataResultadoCompra", "dataEncerramento"];

pub struct TransparenciaAdapter {
    mode: Mode,
}

enum Mode {
    Fixture(String),
    Http {
        base_url: String,
        api_key: String,
        client: reqwest::Client,
    },
}

impl TransparenciaAdapter {
    pub fn from_fixture(body: &str) -> Self {
        Self {
            mode: Mode::Fixture(body.to_string()),
        }
    }

    pub fn from_url(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        client: reqwest::Client,
    ) -> Self {
        Self {
            mode: Mode::Http {
                base_url: base_url.into(),
                api_key: api_key.into(),
                client,
            },
        }
    }

    fn failure(&self, kind: SourceFailureKind) -> SourceFailure {
        SourceFailure::new(self.name(), kind)
    }
}

#[async_trait::async_trait]
impl SourceAdapter for TransparenciaAdapter {
    fn name(&self) -> &'static str {
        "transparencia"
    }

    async fn fetch(&self, query: &SourceQuery) -> Result<Vec<Value>, SourceFailure> {
        match &self.mode {
            Mode::Fixture(body) => {
                let parsed: Value = serde_json::from_str(body)
                    .map_err(|e| self.failure(SourceFailureKind::Parse).with_detail(e.to_string()))?;
                Ok(parsed.as_array().cloned().unwrap_or_default())
            }
            Mode::Http {
                base_url,
                api_key,
                client,
            } => {
                // Plain JSON array per page; an empty page ends pagination.
                let mut out = Vec::new();
                for page in 1..=MAX_PAGES {
                    let url = format!(
                        "{base_url}/api-de-dados/licitacoes?dataInicial={}&dataFinal={}&uf={}&pagina={page}",
                        query.start.format("%d/%m/%Y"),
                        query.end.format("%d/%m/%Y"),
                        query.uf,
                    );
                    let resp = client
                        .get(&url)
                        .header("chave-api-dados", api_key)
                        .send()
                        .await
                        .map_err(|e| {
                            self.failure(SourceFailureKind::Network).with_detail(e.to_string())
                        })?;
                    if !resp.status().is_success() {
                        return Err(self.failure(SourceFailureKind::Http(resp.status().as_u16())));
                    }
                    let body: Value = resp.json().await.map_err(|e| {
                        self.failure(SourceFailureKind::Parse).with_detail(e.to_string())
                    })?;
                    let records = body.as_array().cloned().unwrap_or_default();
                    let got = records.len();
                    out.extend(records);
                    if got < PAGE_SIZE {
                        break;
                    }
                }
                Ok(out)
            }
        }
    }

    fn normalize(&self, raw: &Value) -> Option<UnifiedProcurement> {
        let local_id = match first_str(raw, F_LOCAL_ID) {
            Some(s) => s.trim().to_string(),
            None => first_f64(raw, F_LOCAL_ID).map(|n| format!("{n}"))?,
        };
        let title = normalize_text(first_str(raw, F_TITLE)?);
        if title.is_empty() {
            return None;
        }
        let uf = first_str(raw, F_UF)?.parse().ok()?;
        let published_at = parse_datetime(first_str(raw, F_PUBLISHED)?)?;

        Some(UnifiedProcurement {
            id: ProcurementId::new(self.name(), &local_id),
            title,
            description: String::new(),
            organ: first_str(raw, F_ORGAN).map(normalize_text).unwrap_or_default(),
            uf,
            municipality: first_str(raw, F_MUNICIPALITY).map(|s| s.trim().to_string()),
            modality: first_str(raw, F_MODALITY)
                .map(normalize_modality)
                .unwrap_or(Modality::Other),
            status: first_str(raw, F_STATUS)
                .map(normalize_status)
                .unwrap_or(ProcStatus::Other),
            // The portal only covers the federal executive.
            esfera: Esfera::Federal,
            published_at,
            deadline_at: first_str(raw, F_DEADLINE).and_then(parse_datetime),
            value: first_f64(raw, F_VALUE),
            source: self.name().to_string(),
            control_number: None,
        })
    }
}
