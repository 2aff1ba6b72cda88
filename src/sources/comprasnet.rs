// src/sources/comprasnet.rs
//! Compras.gov.br adapter. Offset-paginated JSON; echoes the PNCP control
//! number for records that are mirrored from there.

use serde_json::Value;

use crate::error::{SourceFailure, SourceFailureKind};
use crate::model::{Esfera, Modality, ProcStatus, ProcurementId, UnifiedProcurement};
use crate::sources::{
    first_f64, first_str, normalize_esfera, normalize_modality, normalize_status,
    normalize_text, parse_datetime, SourceAdapter, SourceQuery,
};

const PAGE_SIZE: usize = 100;
const MAX_PAGES: usize = 10;

const F_LOCAL_ID: &[&str] = &["idCompra", "identificador", "id"];
const F_CONTROL: &[&str] = &["numeroControlePncp", "numeroControlePNCP"];
const F_TITLE: &[&str] = &["objeto", "descricaoObjeto"];
const F_ORGAN: &[&str] = &["nomeOrgao", "orgao.nome", "nomeUasg"];
const F_UF: &[&str] = &["uf", "ufSigla", "unidadeOrgao.uf"];
const F_MUNICIPALITY: &[&str] = &["municipio", "nomeMunicipio"];
const F_MODALITY: &[&str] = &["nomeModalidade", "modalidade"];
const F_STATUS: &[&str] = &["situacaoCompra", "situacao"];
const F_ESFERA: &[&str] = &["esfera", "esferaId"];
const F_VALUE: &[&str] = &["valorTotalEstimado", "valorEstimadoTotal", "valorTotal"];
const F_PUBLISHED: &[&str] = &["dataPublicacao", "dataPublicacaoPncp"];
const F_DEADLINE: &[&str] = &["dataAberturaProposta", "dataEntregaProposta"];

pub struct ComprasnetAdapter {
    mode: Mode,
}

enum Mode {
    Fixture(String),
    Http {
        base_url: String,
        client: reqwest::Client,
    },
}

impl ComprasnetAdapter {
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
        match body.get("resultado") {
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
impl SourceAdapter for ComprasnetAdapter {
    fn name(&self) -> &'static str {
        "comprasnet"
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
                for page in 0..MAX_PAGES {
                    let url = format!(
                        "{base_url}/modulo-contratacoes/1_consultarContratacoes?dataPublicacaoInicial={}&dataPublicacaoFinal={}&unidadeOrgaoUfSigla={}&tamanhoPagina={PAGE_SIZE}&offset={}",
                        query.start.format("%Y-%m-%d"),
                        query.end.format("%Y-%m-%d"),
                        query.uf,
                        page * PAGE_SIZE,
                    );
                    let resp = client.get(&url).send().await.map_err(|e| {
                        self.failure(SourceFailureKind::Network).with_detail(e.to_string())
                    })?;
                    if !resp.status().is_success() {
                        return Err(self.failure(SourceFailureKind::Http(resp.status().as_u16())));
                    }
                    let body: Value = resp.json().await.map_err(|e| {
                        self.failure(SourceFailureKind::Parse).with_detail(e.to_string())
                    })?;
                    let records = Self::records_from_body(&body);
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
        // Local ids come back as numbers or strings depending on the module.
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
            esfera: first_str(raw, F_ESFERA)
                .map(normalize_esfera)
                .unwrap_or(Esfera::Other),
            published_at,
            deadline_at: first_str(raw, F_DEADLINE).and_then(parse_datetime),
            value: first_f64(raw, F_VALUE),
            source: self.name().to_string(),
            control_number: first_str(raw, F_CONTROL).map(|s| s.trim().to_string()),
        })
    }
}
