use serde::{Deserialize, Serialize};

use super::{coerce_list, coerce_number, coerce_text, field, parse_object};
use crate::structured::ParseFailure;

pub(super) const SYSTEM_PROMPT: &str = "Eres un analista de reputación digital de empresas. \
Responde únicamente con un objeto JSON válido.";

const KEYS: &[&str] = &[
    "sentimiento_general",
    "puntaje_sentimiento",
    "temas_positivos",
    "temas_negativos",
    "resumen_ejecutivo",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReputationalFindings {
    pub sentimiento_general: String,
    /// Sentiment in `[-1, 1]`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub puntaje_sentimiento: Option<f64>,
    pub temas_positivos: Vec<String>,
    pub temas_negativos: Vec<String>,
    pub resumen_ejecutivo: String,
}

impl ReputationalFindings {
    pub(crate) fn placeholder(label: &str, summary: String) -> Self {
        Self {
            sentimiento_general: label.into(),
            puntaje_sentimiento: None,
            temas_positivos: Vec::new(),
            temas_negativos: Vec::new(),
            resumen_ejecutivo: summary,
        }
    }

    pub(super) fn text_fields_mut(&mut self) -> Vec<(&'static str, &mut String)> {
        let mut fields = vec![
            ("sentimiento_general", &mut self.sentimiento_general),
            ("resumen_ejecutivo", &mut self.resumen_ejecutivo),
        ];
        fields.extend(
            self.temas_positivos
                .iter_mut()
                .map(|topic| ("temas_positivos", topic)),
        );
        fields.extend(
            self.temas_negativos
                .iter_mut()
                .map(|topic| ("temas_negativos", topic)),
        );
        fields
    }

    /// Sentiment mapped from `[-1, 1]` onto `[0, 1]`.
    pub(super) fn component_score(&self) -> Option<f64> {
        self.puntaje_sentimiento
            .map(|score| (score.clamp(-1.0, 1.0) + 1.0) / 2.0)
    }
}

pub(super) fn prompt(content: &str) -> String {
    format!(
        r#"Analiza la reputación de una PYME a partir de publicaciones y comentarios públicos en redes sociales.

CONTENIDO RECOPILADO:
{content}

Evalúa:
1. Sentimiento general: Positivo, Neutral o Negativo.
2. Puntaje de sentimiento: número entre -1 (muy negativo) y 1 (muy positivo).
3. Temas positivos: lista de aspectos elogiados por los clientes.
4. Temas negativos: lista de quejas o críticas recurrentes.
5. Resumen ejecutivo: un párrafo sobre la percepción pública de la empresa.

Responde solo con JSON con las claves "sentimiento_general", "puntaje_sentimiento", "temas_positivos", "temas_negativos" y "resumen_ejecutivo"."#
    )
}

pub(super) fn parse(raw: &str) -> Result<ReputationalFindings, ParseFailure> {
    let value = parse_object(raw, KEYS)?;
    Ok(ReputationalFindings {
        sentimiento_general: coerce_text(field(&value, "sentimiento_general")),
        puntaje_sentimiento: coerce_number(field(&value, "puntaje_sentimiento")),
        temas_positivos: coerce_list(field(&value, "temas_positivos")),
        temas_negativos: coerce_list(field(&value, "temas_negativos")),
        resumen_ejecutivo: coerce_text(field(&value, "resumen_ejecutivo")),
    })
}
