use serde::{Deserialize, Serialize};

use super::{coerce_number, coerce_text, field, parse_object};
use crate::structured::ParseFailure;

pub(super) const SYSTEM_PROMPT: &str = "Eres un analista financiero experto en NIIF para PYMEs. \
Responde únicamente con un objeto JSON válido.";

const KEYS: &[&str] = &[
    "solvencia",
    "liquidez",
    "rentabilidad",
    "tendencia_ventas",
    "resumen_ejecutivo",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinancialFindings {
    /// Long-term capacity to meet obligations.
    pub solvencia: String,
    /// Short-term capacity to cover debts.
    pub liquidez: String,
    pub rentabilidad: String,
    pub tendencia_ventas: String,
    pub resumen_ejecutivo: String,
    /// Overall financial health in `[0, 1]` as judged by the model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub puntaje_financiero: Option<f64>,
}

impl FinancialFindings {
    pub(crate) fn placeholder(label: &str, summary: String) -> Self {
        Self {
            solvencia: label.into(),
            liquidez: label.into(),
            rentabilidad: label.into(),
            tendencia_ventas: label.into(),
            resumen_ejecutivo: summary,
            puntaje_financiero: None,
        }
    }

    pub(super) fn text_fields_mut(&mut self) -> Vec<(&'static str, &mut String)> {
        vec![
            ("solvencia", &mut self.solvencia),
            ("liquidez", &mut self.liquidez),
            ("rentabilidad", &mut self.rentabilidad),
            ("tendencia_ventas", &mut self.tendencia_ventas),
            ("resumen_ejecutivo", &mut self.resumen_ejecutivo),
        ]
    }

    pub(super) fn component_score(&self) -> Option<f64> {
        self.puntaje_financiero.map(|score| score.clamp(0.0, 1.0))
    }
}

pub(super) fn prompt(document: &str) -> String {
    format!(
        r#"Analiza el siguiente texto extraído de los estados financieros de una PYME.

TEXTO DEL DOCUMENTO FINANCIERO:
{document}

Basándote únicamente en el texto, evalúa de forma concisa:
1. Solvencia: capacidad de cumplir obligaciones a largo plazo.
2. Liquidez: capacidad de cubrir deudas a corto plazo.
3. Rentabilidad: eficiencia para generar beneficios.
4. Tendencia de ventas: evolución de los ingresos.
5. Resumen ejecutivo: un párrafo con tu opinión sobre la salud financiera general.
6. Puntaje financiero: número entre 0 y 1, donde 1 es la máxima salud financiera.

Responde solo con JSON con las claves "solvencia", "liquidez", "rentabilidad", "tendencia_ventas", "resumen_ejecutivo" y "puntaje_financiero"."#
    )
}

pub(super) fn parse(raw: &str) -> Result<FinancialFindings, ParseFailure> {
    let value = parse_object(raw, KEYS)?;
    Ok(FinancialFindings {
        solvencia: coerce_text(field(&value, "solvencia")),
        liquidez: coerce_text(field(&value, "liquidez")),
        rentabilidad: coerce_text(field(&value, "rentabilidad")),
        tendencia_ventas: coerce_text(field(&value, "tendencia_ventas")),
        resumen_ejecutivo: coerce_text(field(&value, "resumen_ejecutivo")),
        puntaje_financiero: coerce_number(field(&value, "puntaje_financiero")),
    })
}
