use serde::{Deserialize, Serialize};

use super::{coerce_text, field, parse_object};
use crate::structured::ParseFailure;

pub(super) const SYSTEM_PROMPT: &str = "Eres un analista de riesgo crediticio especializado en \
comportamiento de pago de PYMEs. Responde únicamente con un objeto JSON válido.";

const KEYS: &[&str] = &[
    "patron_de_pago",
    "fiabilidad_referencias",
    "riesgo_comportamental",
    "resumen_ejecutivo",
];

const LOW_RISK: f64 = 0.85;
const MODERATE_RISK: f64 = 0.55;
const HIGH_RISK: f64 = 0.20;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehavioralFindings {
    /// `Puntual`, `Con Retrasos Leves` or `Moroso`.
    pub patron_de_pago: String,
    /// `Alta`, `Media` or `Baja`.
    pub fiabilidad_referencias: String,
    /// `Bajo`, `Moderado` or `Alto`.
    pub riesgo_comportamental: String,
    pub resumen_ejecutivo: String,
}

impl BehavioralFindings {
    pub(crate) fn placeholder(label: &str, summary: String) -> Self {
        Self {
            patron_de_pago: label.into(),
            fiabilidad_referencias: label.into(),
            riesgo_comportamental: label.into(),
            resumen_ejecutivo: summary,
        }
    }

    pub(super) fn text_fields_mut(&mut self) -> Vec<(&'static str, &mut String)> {
        vec![
            ("patron_de_pago", &mut self.patron_de_pago),
            ("fiabilidad_referencias", &mut self.fiabilidad_referencias),
            ("riesgo_comportamental", &mut self.riesgo_comportamental),
            ("resumen_ejecutivo", &mut self.resumen_ejecutivo),
        ]
    }

    /// Risk label first, payment pattern as a fallback.
    pub(super) fn component_score(&self) -> Option<f64> {
        risk_score(&self.riesgo_comportamental).or_else(|| pattern_score(&self.patron_de_pago))
    }
}

fn risk_score(label: &str) -> Option<f64> {
    let label = label.to_lowercase();
    if label.contains("bajo") {
        Some(LOW_RISK)
    } else if label.contains("moderado") || label.contains("medio") {
        Some(MODERATE_RISK)
    } else if label.contains("alto") {
        Some(HIGH_RISK)
    } else {
        None
    }
}

fn pattern_score(label: &str) -> Option<f64> {
    let label = label.to_lowercase();
    if label.contains("retraso") {
        Some(MODERATE_RISK)
    } else if label.contains("puntual") {
        Some(LOW_RISK)
    } else if label.contains("moroso") || label.contains("morosidad") {
        Some(HIGH_RISK)
    } else {
        None
    }
}

pub(super) fn prompt(history: &str) -> String {
    format!(
        r#"Evalúa el comportamiento de pago de una PYME a partir de sus referencias comerciales y su historial de pagos.

INFORMACIÓN DISPONIBLE:
{history}

Determina:
1. Patrón de pago: "Puntual", "Con Retrasos Leves" o "Moroso".
2. Fiabilidad de las referencias: "Alta", "Media" o "Baja".
3. Riesgo comportamental: "Bajo", "Moderado" o "Alto".
4. Resumen ejecutivo: un párrafo que justifique la evaluación.

Responde solo con JSON con las claves "patron_de_pago", "fiabilidad_referencias", "riesgo_comportamental" y "resumen_ejecutivo"."#
    )
}

pub(super) fn parse(raw: &str) -> Result<BehavioralFindings, ParseFailure> {
    let value = parse_object(raw, KEYS)?;
    Ok(BehavioralFindings {
        patron_de_pago: coerce_text(field(&value, "patron_de_pago")),
        fiabilidad_referencias: coerce_text(field(&value, "fiabilidad_referencias")),
        riesgo_comportamental: coerce_text(field(&value, "riesgo_comportamental")),
        resumen_ejecutivo: coerce_text(field(&value, "resumen_ejecutivo")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn risk_label_takes_precedence() {
        let findings = parse(
            r#"{"patron_de_pago": "Moroso", "riesgo_comportamental": "Bajo", "resumen_ejecutivo": "x"}"#,
        )
        .unwrap();
        assert_eq!(findings.component_score(), Some(LOW_RISK));
    }

    #[test]
    fn falls_back_to_payment_pattern() {
        let findings =
            parse(r#"{"patron_de_pago": "Con Retrasos Leves", "riesgo_comportamental": "?"}"#)
                .unwrap();
        assert_eq!(findings.component_score(), Some(MODERATE_RISK));

        let unknown = parse(r#"{"resumen_ejecutivo": "sin clasificar"}"#).unwrap();
        assert_eq!(unknown.component_score(), None);
    }
}
